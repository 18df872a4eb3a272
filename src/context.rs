//! GPU context initialization.
//!
//! This module wraps wgpu's instance, adapter, device and queue.  A
//! [`GpuContext`] is opened for a device category: the adapters are
//! enumerated in the order wgpu reports them and the first one of the
//! requested category that supports compute shaders is used.  The
//! asynchronous adapter and device requests are driven to completion
//! with [`pollster`].

use log::{debug, info};
use wgpu::{Adapter, Device, Instance, Queue};

use crate::backend::DeviceInfo;
use crate::config::DeviceKind;
use crate::error::OffloadError;

/// A GPU context encapsulates all state needed to submit compute work.
///
/// All handles are released when the context is dropped.  Buffers,
/// pipelines and command buffers created from it keep the device alive
/// internally, so drop order between them does not matter.
pub struct GpuContext {
    /// The global instance used to enumerate adapters.
    pub instance: Instance,
    /// The physical device selected for computation.
    pub adapter: Adapter,
    /// Logical device used to create resources and command encoders.
    pub device: Device,
    /// The single in-order submission queue.
    pub queue: Queue,
    info: DeviceInfo,
}

/// Map a wgpu adapter type onto the two device categories.
///
/// Adapters that report [`wgpu::DeviceType::Other`] belong to neither.
pub fn classify(device_type: wgpu::DeviceType) -> Option<DeviceKind> {
    match device_type {
        wgpu::DeviceType::Cpu => Some(DeviceKind::Cpu),
        wgpu::DeviceType::DiscreteGpu
        | wgpu::DeviceType::IntegratedGpu
        | wgpu::DeviceType::VirtualGpu => Some(DeviceKind::Gpu),
        wgpu::DeviceType::Other => None,
    }
}

impl GpuContext {
    /// Open a context on the first adapter of `kind`.
    ///
    /// Blocks the current thread while the device request completes.
    /// Returns [`OffloadError::DeviceUnavailable`] when no adapter of
    /// that category supports compute shaders.
    pub fn new_blocking(kind: DeviceKind) -> Result<Self, OffloadError> {
        // Create an instance on every backend compiled in (Vulkan, Metal,
        // DX12, GL) and walk its adapters in enumeration order.
        let instance = Instance::new(&wgpu::InstanceDescriptor::default());
        let adapter = instance
            .enumerate_adapters(wgpu::Backends::all())
            .into_iter()
            .find(|adapter| {
                let adapter_info = adapter.get_info();
                let compute = adapter
                    .get_downlevel_capabilities()
                    .flags
                    .contains(wgpu::DownlevelFlags::COMPUTE_SHADERS);
                debug!(
                    "adapter {} ({:?}, {:?}) compute={compute}",
                    adapter_info.name, adapter_info.device_type, adapter_info.backend
                );
                compute && classify(adapter_info.device_type) == Some(kind)
            })
            .ok_or(OffloadError::DeviceUnavailable { kind })?;

        let adapter_info = adapter.get_info();
        // Request the logical device and its queue.  No optional
        // features are needed for f32 storage buffers.  The adapter's own
        // limits are always satisfiable and allow the largest buffers the
        // hardware supports.
        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("matmul_offload_device"),
            required_features: wgpu::Features::empty(),
            required_limits: adapter.limits(),
            memory_hints: wgpu::MemoryHints::Performance,
            trace: wgpu::Trace::Off,
        }))
        .map_err(|e| OffloadError::DeviceRequest {
            adapter: adapter_info.name.clone(),
            reason: e.to_string(),
        })?;

        let info = DeviceInfo {
            name: adapter_info.name.clone(),
            kind,
            backend: format!("{:?}", adapter_info.backend),
            driver: adapter_info.driver.clone(),
        };
        info!("opened {info}");
        Ok(Self {
            instance,
            adapter,
            device,
            queue,
            info,
        })
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    /// Run `f` inside an error scope and return its result together with
    /// the first error of type `filter` it raised.
    ///
    /// Without a scope wgpu hands errors to the uncaptured error handler,
    /// which panics.
    pub fn scoped<R>(&self, filter: wgpu::ErrorFilter, f: impl FnOnce() -> R) -> (R, Option<wgpu::Error>) {
        self.device.push_error_scope(filter);
        let value = f();
        let error = pollster::block_on(self.device.pop_error_scope());
        (value, error)
    }

    /// Block until all submitted work has completed.
    pub fn drain(&self) -> Result<(), String> {
        self.device
            .poll(wgpu::PollType::Wait)
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}
