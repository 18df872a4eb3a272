//! The seam between the host orchestrator and an execution engine.
//!
//! A [`Backend`] resolves a device category to an open
//! [`ExecutionContext`].  The context owns everything device-side: the
//! compiled kernel, the buffers and the recorded launch are associated
//! types whose `Drop` releases the underlying resources, so a run that
//! bails out early with `?` still releases whatever it had acquired.

use std::fmt;

use crate::config::{DeviceKind, Partition};
use crate::error::OffloadError;
use crate::kernel::{KernelDims, KernelSource};

/// Access mode of a device buffer as seen by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    ReadWrite,
}

/// Description of the device a context was opened on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: String,
    pub kind: DeviceKind,
    pub backend: String,
    pub driver: String,
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}] via {}", self.name, self.kind, self.backend)?;
        if !self.driver.is_empty() {
            write!(f, " ({})", self.driver)?;
        }
        Ok(())
    }
}

/// The six logical kernel arguments in binding order: the three
/// dimensions, then A, B and C.
pub struct KernelArgs<'a, B> {
    pub dims: KernelDims,
    pub a: &'a B,
    pub b: &'a B,
    pub c: &'a B,
}

/// Something that can open a device of a requested category.
pub trait Backend {
    type Context: ExecutionContext;

    /// Select the first device of `kind` and create a context with a
    /// single in-order queue on it.
    fn open(&self, kind: DeviceKind) -> Result<Self::Context, OffloadError>;
}

/// A context bound to one device and one queue.
pub trait ExecutionContext {
    type Kernel;
    type Buffer;
    type Launch;

    fn device(&self) -> &DeviceInfo;

    /// Build `source` for this device with the partition's group extent.
    fn build_kernel(
        &self,
        source: &KernelSource,
        partition: &Partition,
    ) -> Result<Self::Kernel, OffloadError>;

    /// Allocate a device buffer and fill it with `data`.  The copy is
    /// complete when this returns.
    fn upload(
        &self,
        what: &'static str,
        data: &[f32],
        access: Access,
    ) -> Result<Self::Buffer, OffloadError>;

    /// Bind the arguments and record one launch over `partition`
    /// without submitting it.
    fn record(
        &self,
        kernel: &Self::Kernel,
        args: KernelArgs<'_, Self::Buffer>,
        partition: &Partition,
    ) -> Result<Self::Launch, OffloadError>;

    /// Submit a recorded launch and block until the queue has drained.
    fn submit_and_wait(&self, launch: Self::Launch) -> Result<(), OffloadError>;

    /// Copy a device buffer back into `out`, blocking until done.
    fn download(&self, buffer: &Self::Buffer, out: &mut [f32]) -> Result<(), OffloadError>;
}
