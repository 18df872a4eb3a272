//! One-shot dense matrix multiplication offloaded to a compute device
//! using [wgpu](https://github.com/gfx-rs/wgpu).
//!
//! The crate multiplies two single precision matrices by dispatching a
//! single compute kernel to a CPU-class or GPU-class adapter.  The host
//! side is deliberately simple: it uploads the inputs, launches one 2-D
//! grid with one work-item per output cell, waits for the queue to drain,
//! reads the product back and reports how long the kernel took.  The
//! whole API is synchronous and blocking.
//!
//! Matrices are flattened column-major throughout; see [`kernel`] for the
//! exact index arithmetic.
//!
//! ```no_run
//! use matmul_offload::{DeviceKind, Offload, OffloadConfig, WgpuBackend};
//!
//! let offload = Offload::random(&OffloadConfig::default(), &mut rand::thread_rng())?;
//! let report = offload.run(&WgpuBackend, DeviceKind::Gpu)?;
//! println!("{:.3} GFLOPS", report.timing.gflops());
//! # Ok::<(), matmul_offload::OffloadError>(())
//! ```

pub mod backend;
pub mod buffer;
pub mod compute;
pub mod config;
pub mod context;
pub mod error;
pub mod host;
pub mod kernel;
pub mod matrix;
pub mod offload;

// Re‑export the most common types at the crate root.
pub use backend::{Access, Backend, DeviceInfo, ExecutionContext, KernelArgs};
pub use buffer::GpuBuffer;
pub use compute::WgpuBackend;
pub use config::{BackendKind, DeviceKind, OffloadConfig, Partition};
pub use context::GpuContext;
pub use error::{OffloadError, Stage};
pub use host::HostBackend;
pub use kernel::{KernelDims, KernelSource};
pub use matrix::Matrix;
pub use offload::{ExecutionTiming, Offload, OffloadReport, DEFAULT_TOLERANCE};
