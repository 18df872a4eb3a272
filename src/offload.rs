//! Host orchestration of one offloaded multiplication.
//!
//! An [`Offload`] owns the three host matrices, the validated kernel
//! dimensions and the work partition.  [`Offload::run`] drives the whole
//! sequence on a [`Backend`]: select the device, build the kernel, upload
//! A, B and the zeroed C, launch once, drain the queue, read C back and
//! report the timing.  Everything acquired on the device is owned by
//! locals of `run`, so it is released on every return path, including
//! early returns through `?`.

use std::time::{Duration, Instant};

use log::{debug, info};
use rand::Rng;

use crate::backend::{Access, Backend, DeviceInfo, ExecutionContext, KernelArgs};
use crate::config::{DeviceKind, OffloadConfig, Partition};
use crate::error::OffloadError;
use crate::kernel::{KernelDims, KernelSource};
use crate::matrix::Matrix;

/// Default relative tolerance used when verifying a product.
pub const DEFAULT_TOLERANCE: f32 = 1e-4;

/// Wall-clock time of the single dispatch and the work it performed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExecutionTiming {
    /// From just before submission until the queue reported completion.
    pub elapsed: Duration,
    /// `2 * m * n * k`.
    pub flop_count: u64,
}

impl ExecutionTiming {
    pub fn seconds(&self) -> f64 {
        self.elapsed.as_secs_f64()
    }

    /// Achieved floating point operations per second.
    ///
    /// An elapsed time below one nanosecond is treated as one nanosecond.
    pub fn flops_per_second(&self) -> f64 {
        self.flop_count as f64 / self.seconds().max(1e-9)
    }

    pub fn gflops(&self) -> f64 {
        self.flops_per_second() / 1e9
    }
}

/// Result of a completed offload.
#[derive(Debug, Clone)]
pub struct OffloadReport {
    pub device: DeviceInfo,
    pub product: Matrix,
    pub timing: ExecutionTiming,
}

impl OffloadReport {
    /// Compare the product against `expected` cell by cell.
    pub fn verify(&self, expected: &Matrix, tolerance: f32) -> Result<(), OffloadError> {
        let mismatches = self.product.mismatches(expected, tolerance);
        if mismatches > 0 {
            return Err(OffloadError::Verification {
                mismatches,
                max_relative_error: self.product.max_relative_error(expected),
            });
        }
        Ok(())
    }
}

/// One multiplication `C = A * B`, ready to run.
#[derive(Debug, Clone)]
pub struct Offload {
    a: Matrix,
    b: Matrix,
    c: Matrix,
    dims: KernelDims,
    partition: Partition,
    source: KernelSource,
}

impl Offload {
    /// Prepare `a * b` with square local groups of extent `group_size`.
    ///
    /// Rejects incompatible shapes, an empty inner dimension and an
    /// output that the group extent does not evenly divide.
    pub fn new(a: Matrix, b: Matrix, group_size: usize) -> Result<Self, OffloadError> {
        a.check_multipliable(&b)?;
        if a.cols() == 0 {
            return Err(OffloadError::InvalidPartition {
                reason: "inner dimension is empty".into(),
            });
        }
        let partition = Partition::new(a.rows(), b.cols(), group_size)?;
        let dims = KernelDims::new(a.rows(), b.cols(), a.cols())?;
        let c = Matrix::try_zeros(a.rows(), b.cols())?;
        Ok(Self {
            a,
            b,
            c,
            dims,
            partition,
            source: KernelSource::MATMUL,
        })
    }

    /// Prepare an N×N multiplication of uniform random inputs scaled by
    /// `1 / N`.  The partition is validated before anything is allocated.
    pub fn random<R: Rng>(config: &OffloadConfig, rng: &mut R) -> Result<Self, OffloadError> {
        config.partition()?;
        let n = config.size;
        let scale = 1.0 / n as f32;
        let a = Matrix::random(n, n, scale, rng)?;
        let b = Matrix::random(n, n, scale, rng)?;
        Self::new(a, b, config.group_size)
    }

    /// Use a different kernel source.
    pub fn with_kernel_source(mut self, source: KernelSource) -> Self {
        self.source = source;
        self
    }

    /// The product computed on the host with the kernel's formula.
    pub fn reference_product(&self) -> Result<Matrix, OffloadError> {
        self.a.reference_product(&self.b)
    }

    /// Perform the multiplication on the first device of `kind`.
    pub fn run<B: Backend>(self, backend: &B, kind: DeviceKind) -> Result<OffloadReport, OffloadError> {
        let Offload {
            a,
            b,
            mut c,
            dims,
            partition,
            source,
        } = self;

        let context = backend.open(kind)?;
        let device = context.device().clone();
        info!("running {}x{}x{} multiply on {device}", dims.rows_a, dims.cols_b, dims.common);

        let kernel = context.build_kernel(&source, &partition)?;
        let a_buf = context.upload("matrix A", a.as_slice(), Access::ReadOnly)?;
        let b_buf = context.upload("matrix B", b.as_slice(), Access::ReadOnly)?;
        let c_buf = context.upload("matrix C", c.as_slice(), Access::ReadWrite)?;
        drop(a);
        drop(b);

        let launch = context.record(
            &kernel,
            KernelArgs {
                dims,
                a: &a_buf,
                b: &b_buf,
                c: &c_buf,
            },
            &partition,
        )?;
        let (groups_x, groups_y) = partition.groups();
        debug!(
            "dispatching {} work-items in ({groups_x}, {groups_y}) groups of {}x{}",
            partition.work_items(),
            partition.group(),
            partition.group()
        );

        let start = Instant::now();
        context.submit_and_wait(launch)?;
        let elapsed = start.elapsed();

        context.download(&c_buf, c.as_mut_slice())?;
        let timing = ExecutionTiming {
            elapsed,
            flop_count: dims.flop_count(),
        };
        info!(
            "kernel finished in {:.6} s ({:.3} GFLOPS)",
            timing.seconds(),
            timing.gflops()
        );

        Ok(OffloadReport {
            device,
            product: c,
            timing,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostBackend;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn timing_throughput() {
        let timing = ExecutionTiming {
            elapsed: Duration::from_millis(500),
            flop_count: 2_000_000_000,
        };
        assert!((timing.flops_per_second() - 4e9).abs() < 1.0);
        assert!((timing.gflops() - 4.0).abs() < 1e-9);
    }

    #[test]
    fn zero_elapsed_does_not_divide_by_zero() {
        let timing = ExecutionTiming {
            elapsed: Duration::ZERO,
            flop_count: 10,
        };
        assert!(timing.flops_per_second().is_finite());
    }

    #[test]
    fn random_offload_matches_reference() {
        let mut rng = StdRng::seed_from_u64(42);
        let offload = Offload::random(&OffloadConfig::new(16, 4), &mut rng).unwrap();
        let expected = offload.reference_product().unwrap();
        let report = offload.run(&HostBackend::new(), DeviceKind::Cpu).unwrap();
        assert_eq!(report.timing.flop_count, 2 * 16 * 16 * 16);
        report.verify(&expected, DEFAULT_TOLERANCE).unwrap();
    }

    #[test]
    fn random_rejects_indivisible_size_before_generating() {
        let mut rng = StdRng::seed_from_u64(1);
        let err = Offload::random(&OffloadConfig::new(10, 4), &mut rng).unwrap_err();
        assert!(matches!(err, OffloadError::InvalidPartition { .. }));
    }

    #[test]
    fn oversized_inputs_fail_with_allocation_error() {
        // 2^31 fits the 32-bit index space and is divisible by 16, but
        // one 2^31 x 2^31 matrix needs 16 EiB.
        let mut rng = StdRng::seed_from_u64(3);
        let err = Offload::random(&OffloadConfig::new(1 << 31, 16), &mut rng).unwrap_err();
        assert!(matches!(err, OffloadError::Allocation { .. }));
        assert_eq!(err.exit_code(), 5);
    }

    #[test]
    fn empty_inner_dimension_is_rejected() {
        let err = Offload::new(Matrix::zeros(2, 0), Matrix::zeros(0, 2), 2).unwrap_err();
        assert!(matches!(err, OffloadError::InvalidPartition { .. }));
    }

    #[test]
    fn verify_reports_mismatches() {
        let report = OffloadReport {
            device: DeviceInfo {
                name: "test".into(),
                kind: DeviceKind::Cpu,
                backend: "host".into(),
                driver: String::new(),
            },
            product: Matrix::identity(2),
            timing: ExecutionTiming {
                elapsed: Duration::from_millis(1),
                flop_count: 16,
            },
        };
        let err = report.verify(&Matrix::zeros(2, 2), DEFAULT_TOLERANCE).unwrap_err();
        assert!(matches!(err, OffloadError::Verification { mismatches: 2, .. }));
        report.verify(&Matrix::identity(2), DEFAULT_TOLERANCE).unwrap();
    }
}
