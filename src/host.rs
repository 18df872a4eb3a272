//! Host execution of the multiply kernel.
//!
//! [`HostBackend`] runs the kernel's per-cell formula on the calling
//! thread, one local group after another, so results are bit-for-bit
//! reproducible.  It only offers CPU-class devices unless told
//! otherwise, which makes it useful for exercising the orchestrator
//! without any graphics adapter.

use std::cell::RefCell;
use std::rc::Rc;

use log::debug;

use crate::backend::{Access, Backend, DeviceInfo, ExecutionContext, KernelArgs};
use crate::config::{DeviceKind, Partition};
use crate::error::OffloadError;
use crate::kernel::{self, KernelDims, KernelSource};

/// Backend evaluating the kernel on the host.
#[derive(Debug, Clone)]
pub struct HostBackend {
    kinds: Vec<DeviceKind>,
}

impl HostBackend {
    /// A host backend exposing a single CPU-class device.
    pub fn new() -> Self {
        Self {
            kinds: vec![DeviceKind::Cpu],
        }
    }

    /// A host backend that reports devices of exactly `kinds`.
    pub fn with_kinds(kinds: &[DeviceKind]) -> Self {
        Self {
            kinds: kinds.to_vec(),
        }
    }
}

impl Default for HostBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for HostBackend {
    type Context = HostContext;

    fn open(&self, kind: DeviceKind) -> Result<HostContext, OffloadError> {
        if !self.kinds.contains(&kind) {
            return Err(OffloadError::DeviceUnavailable { kind });
        }
        Ok(HostContext {
            info: DeviceInfo {
                name: "host executor".into(),
                kind,
                backend: "host".into(),
                driver: String::new(),
            },
        })
    }
}

#[derive(Debug)]
pub struct HostContext {
    info: DeviceInfo,
}

/// A "compiled" kernel: the validated group extent.
#[derive(Debug)]
pub struct HostKernel {
    group: u32,
}

/// A host-resident copy of one kernel buffer.
#[derive(Debug, Clone)]
pub struct HostBuffer {
    data: Rc<RefCell<Vec<f32>>>,
    access: Access,
}

/// A recorded launch, holding the bound buffers.
#[derive(Debug)]
pub struct HostLaunch {
    dims: KernelDims,
    partition: Partition,
    a: HostBuffer,
    b: HostBuffer,
    c: HostBuffer,
}

fn check_len(what: &'static str, buffer: &HostBuffer, expected: usize) -> Result<(), OffloadError> {
    let actual = buffer.data.borrow().len();
    if actual != expected {
        return Err(OffloadError::BufferLength {
            what,
            expected,
            actual,
        });
    }
    Ok(())
}

impl ExecutionContext for HostContext {
    type Kernel = HostKernel;
    type Buffer = HostBuffer;
    type Launch = HostLaunch;

    fn device(&self) -> &DeviceInfo {
        &self.info
    }

    fn build_kernel(
        &self,
        source: &KernelSource,
        partition: &Partition,
    ) -> Result<HostKernel, OffloadError> {
        if !source.declares_entry_point() {
            return Err(OffloadError::Compilation {
                log: format!("entry point `{}` is not declared in the source", source.entry_point),
            });
        }
        Ok(HostKernel {
            group: partition.group(),
        })
    }

    fn upload(
        &self,
        what: &'static str,
        data: &[f32],
        access: Access,
    ) -> Result<HostBuffer, OffloadError> {
        let mut copy = Vec::new();
        copy.try_reserve_exact(data.len())
            .map_err(|e| OffloadError::Allocation {
                what,
                bytes: std::mem::size_of_val(data) as u64,
                reason: e.to_string(),
            })?;
        copy.extend_from_slice(data);
        debug!("host buffer {what}: {} elements, {access:?}", copy.len());
        Ok(HostBuffer {
            data: Rc::new(RefCell::new(copy)),
            access,
        })
    }

    fn record(
        &self,
        kernel: &HostKernel,
        args: KernelArgs<'_, HostBuffer>,
        partition: &Partition,
    ) -> Result<HostLaunch, OffloadError> {
        if kernel.group != partition.group() {
            return Err(OffloadError::InvalidPartition {
                reason: format!(
                    "kernel was built for group extent {} but launched with {}",
                    kernel.group,
                    partition.group()
                ),
            });
        }
        if (args.dims.rows_a, args.dims.cols_b) != partition.global() {
            return Err(OffloadError::InvalidPartition {
                reason: format!(
                    "global extent {:?} does not cover output {}x{}",
                    partition.global(),
                    args.dims.rows_a,
                    args.dims.cols_b
                ),
            });
        }
        check_len("matrix A", args.a, args.dims.a_len())?;
        check_len("matrix B", args.b, args.dims.b_len())?;
        check_len("matrix C", args.c, args.dims.c_len())?;
        if args.c.access != Access::ReadWrite {
            return Err(OffloadError::Dispatch {
                reason: "output buffer is not writable".into(),
            });
        }
        Ok(HostLaunch {
            dims: args.dims,
            partition: *partition,
            a: args.a.clone(),
            b: args.b.clone(),
            c: args.c.clone(),
        })
    }

    fn submit_and_wait(&self, launch: HostLaunch) -> Result<(), OffloadError> {
        let HostLaunch {
            dims,
            partition,
            a,
            b,
            c,
        } = launch;
        let aliased = || OffloadError::Dispatch {
            reason: "output buffer aliases an input buffer".into(),
        };
        let mut out = c.data.try_borrow_mut().map_err(|_| aliased())?;
        let a = a.data.try_borrow().map_err(|_| aliased())?;
        let b = b.data.try_borrow().map_err(|_| aliased())?;

        let group = partition.group() as usize;
        let (groups_x, groups_y) = partition.groups();
        for group_y in 0..groups_y as usize {
            for group_x in 0..groups_x as usize {
                for local_y in 0..group {
                    for local_x in 0..group {
                        let row = group_x * group + local_x;
                        let col = group_y * group + local_y;
                        out[kernel::output_index(&dims, row, col)] =
                            kernel::cell(&dims, &a, &b, row, col);
                    }
                }
            }
        }
        Ok(())
    }

    fn download(&self, buffer: &HostBuffer, out: &mut [f32]) -> Result<(), OffloadError> {
        let data = buffer.data.try_borrow().map_err(|_| OffloadError::Readback {
            reason: "buffer is still in use".into(),
        })?;
        if data.len() != out.len() {
            return Err(OffloadError::BufferLength {
                what: "readback destination",
                expected: data.len(),
                actual: out.len(),
            });
        }
        out.copy_from_slice(&data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gpu_is_unavailable_by_default() {
        let backend = HostBackend::new();
        assert!(backend.open(DeviceKind::Cpu).is_ok());
        let err = backend.open(DeviceKind::Gpu).err().unwrap();
        assert!(matches!(err, OffloadError::DeviceUnavailable { kind: DeviceKind::Gpu }));
    }

    #[test]
    fn launch_writes_every_cell() {
        let ctx = HostBackend::new().open(DeviceKind::Cpu).unwrap();
        let partition = Partition::new(2, 2, 1).unwrap();
        let dims = KernelDims::new(2, 2, 2).unwrap();
        let kernel = ctx.build_kernel(&KernelSource::MATMUL, &partition).unwrap();
        // A = [[1,2],[3,4]], B = I, column-major.
        let a = ctx.upload("A", &[1.0, 3.0, 2.0, 4.0], Access::ReadOnly).unwrap();
        let b = ctx.upload("B", &[1.0, 0.0, 0.0, 1.0], Access::ReadOnly).unwrap();
        let c = ctx.upload("C", &[-1.0; 4], Access::ReadWrite).unwrap();
        let launch = ctx
            .record(&kernel, KernelArgs { dims, a: &a, b: &b, c: &c }, &partition)
            .unwrap();
        ctx.submit_and_wait(launch).unwrap();
        let mut out = [0.0; 4];
        ctx.download(&c, &mut out).unwrap();
        assert_eq!(out, [1.0, 3.0, 2.0, 4.0]);
    }

    #[test]
    fn read_only_output_is_rejected() {
        let ctx = HostBackend::new().open(DeviceKind::Cpu).unwrap();
        let partition = Partition::new(1, 1, 1).unwrap();
        let dims = KernelDims::new(1, 1, 1).unwrap();
        let kernel = ctx.build_kernel(&KernelSource::MATMUL, &partition).unwrap();
        let a = ctx.upload("A", &[2.0], Access::ReadOnly).unwrap();
        let c = ctx.upload("C", &[0.0], Access::ReadOnly).unwrap();
        let err = ctx
            .record(&kernel, KernelArgs { dims, a: &a, b: &a, c: &c }, &partition)
            .err()
            .unwrap();
        assert!(matches!(err, OffloadError::Dispatch { .. }));
    }

    #[test]
    fn missing_entry_point_fails_to_build() {
        let ctx = HostBackend::new().open(DeviceKind::Cpu).unwrap();
        let partition = Partition::new(2, 2, 2).unwrap();
        let source = KernelSource {
            entry_point: "main",
            ..KernelSource::MATMUL
        };
        let err = ctx.build_kernel(&source, &partition).err().unwrap();
        assert!(matches!(err, OffloadError::Compilation { .. }));
    }
}
