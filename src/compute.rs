//! Running the multiply kernel through wgpu.
//!
//! [`WgpuBackend`] opens a [`GpuContext`] on a CPU-class or GPU-class
//! adapter.  Building the kernel compiles the WGSL module and a compute
//! pipeline with an explicit bind group layout mirroring the kernel's
//! argument order: the dimension uniform at binding 0, A and B as
//! read-only storage at bindings 1 and 2, C as read/write storage at
//! binding 3.  A launch is one compute pass dispatching a 2-D grid of
//! `(rows / W, cols / W)` workgroups.

use std::num::NonZeroU64;

use log::debug;
use wgpu::{self, ShaderModuleDescriptor, ShaderSource};

use crate::backend::{Access, Backend, DeviceInfo, ExecutionContext, KernelArgs};
use crate::buffer::GpuBuffer;
use crate::config::{DeviceKind, Partition};
use crate::context::GpuContext;
use crate::error::OffloadError;
use crate::kernel::{KernelDims, KernelSource};

/// Backend dispatching to real adapters through wgpu.
#[derive(Debug, Clone, Copy, Default)]
pub struct WgpuBackend;

impl Backend for WgpuBackend {
    type Context = GpuContext;

    fn open(&self, kind: DeviceKind) -> Result<GpuContext, OffloadError> {
        GpuContext::new_blocking(kind)
    }
}

/// A compiled compute pipeline for one group extent.
pub struct WgpuKernel {
    pub pipeline: wgpu::ComputePipeline,
    pub bind_group_layout: wgpu::BindGroupLayout,
    pub group: u32,
}

/// Recorded commands for a single launch.
///
/// The dimension uniform and bind group are kept here until the commands
/// have been submitted.
pub struct WgpuLaunch {
    commands: wgpu::CommandBuffer,
    _dims: GpuBuffer<KernelDims>,
    _bind_group: wgpu::BindGroup,
}

/// Reject partitions the device cannot dispatch.
pub fn check_partition(limits: &wgpu::Limits, partition: &Partition) -> Result<(), OffloadError> {
    let group = partition.group();
    if group > limits.max_compute_workgroup_size_x || group > limits.max_compute_workgroup_size_y {
        return Err(OffloadError::InvalidPartition {
            reason: format!(
                "group extent {group} exceeds the device's workgroup size limits ({}, {})",
                limits.max_compute_workgroup_size_x, limits.max_compute_workgroup_size_y
            ),
        });
    }
    if partition.items_per_group() > u64::from(limits.max_compute_invocations_per_workgroup) {
        return Err(OffloadError::InvalidPartition {
            reason: format!(
                "{group}x{group} = {} invocations per group exceeds the device limit of {}",
                partition.items_per_group(),
                limits.max_compute_invocations_per_workgroup
            ),
        });
    }
    let (groups_x, groups_y) = partition.groups();
    let max_groups = limits.max_compute_workgroups_per_dimension;
    if groups_x > max_groups || groups_y > max_groups {
        return Err(OffloadError::InvalidPartition {
            reason: format!(
                "grid of ({groups_x}, {groups_y}) groups exceeds {max_groups} per dimension"
            ),
        });
    }
    Ok(())
}

fn compilation_log(info: &wgpu::CompilationInfo) -> String {
    info.messages
        .iter()
        .filter(|m| matches!(m.message_type, wgpu::CompilationMessageType::Error))
        .map(|m| match &m.location {
            Some(loc) => format!("{}:{}: {}", loc.line_number, loc.line_position, m.message),
            None => m.message.clone(),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn uniform_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: NonZeroU64::new(std::mem::size_of::<KernelDims>() as u64),
        },
        count: None,
    }
}

fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: NonZeroU64::new(std::mem::size_of::<f32>() as u64),
        },
        count: None,
    }
}

/// Compile `source` for `partition`'s group extent.
///
/// Both the shader module and the pipeline are created inside a
/// validation error scope.  On failure the compiler messages are
/// returned as the log of an [`OffloadError::Compilation`].
pub fn compile_kernel(
    context: &GpuContext,
    source: &KernelSource,
    partition: &Partition,
) -> Result<WgpuKernel, OffloadError> {
    check_partition(&context.device.limits(), partition)?;
    // The group extent is a compile-time constant in WGSL, so it is
    // baked into the source before compiling.
    let program = source.render(partition.group());

    // Parse and validate the module.  The compilation info is fetched
    // even on success so warnings never hide an error message.
    let (module, module_error) = context.scoped(wgpu::ErrorFilter::Validation, || {
        context.device.create_shader_module(ShaderModuleDescriptor {
            label: Some("matmul_shader"),
            source: ShaderSource::Wgsl(program.as_str().into()),
        })
    });
    let messages = compilation_log(&pollster::block_on(module.get_compilation_info()));
    if let Some(error) = module_error {
        let log = if messages.is_empty() {
            error.to_string()
        } else {
            messages
        };
        return Err(OffloadError::Compilation { log });
    }

    // Describe the four bindings explicitly instead of relying on
    // layout inference, so the argument order is fixed here.
    let bind_group_layout = context
        .device
        .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("matmul_bind_group_layout"),
            entries: &[
                uniform_entry(0),
                storage_entry(1, true),
                storage_entry(2, true),
                storage_entry(3, false),
            ],
        });
    let pipeline_layout = context
        .device
        .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("matmul_pipeline_layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });
    let (pipeline, pipeline_error) = context.scoped(wgpu::ErrorFilter::Validation, || {
        context
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some("matmul_pipeline"),
                layout: Some(&pipeline_layout),
                module: &module,
                entry_point: Some(source.entry_point),
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                cache: None,
            })
    });
    if let Some(error) = pipeline_error {
        return Err(OffloadError::Compilation {
            log: error.to_string(),
        });
    }
    debug!("built pipeline for group extent {}", partition.group());

    Ok(WgpuKernel {
        pipeline,
        bind_group_layout,
        group: partition.group(),
    })
}

/// Bind the six arguments and record one compute pass over `partition`.
pub fn record_dispatch(
    context: &GpuContext,
    kernel: &WgpuKernel,
    args: KernelArgs<'_, GpuBuffer<f32>>,
    partition: &Partition,
) -> Result<WgpuLaunch, OffloadError> {
    if kernel.group != partition.group() {
        return Err(OffloadError::InvalidPartition {
            reason: format!(
                "pipeline was built for group extent {} but launched with {}",
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
    for (what, buffer, expected) in [
        ("matrix A", args.a, args.dims.a_len()),
        ("matrix B", args.b, args.dims.b_len()),
        ("matrix C", args.c, args.dims.c_len()),
    ] {
        if buffer.len != expected {
            return Err(OffloadError::BufferLength {
                what,
                expected,
                actual: buffer.len,
            });
        }
    }
    if args.c.access != Access::ReadWrite {
        return Err(OffloadError::Dispatch {
            reason: "output buffer is not writable".into(),
        });
    }

    // The three scalar arguments travel in one uniform buffer.
    let dims = GpuBuffer::uniform(context, "kernel dimensions", &args.dims)?;
    let (bind_group, bind_error) = context.scoped(wgpu::ErrorFilter::Validation, || {
        context.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("matmul_bind_group"),
            layout: &kernel.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: dims.buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: args.a.buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: args.b.buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: args.c.buffer.as_entire_binding(),
                },
            ],
        })
    });
    if let Some(error) = bind_error {
        return Err(OffloadError::Dispatch {
            reason: error.to_string(),
        });
    }

    // Record a single compute pass.  Nothing runs until the command
    // buffer is submitted, so the timed span starts at submission.
    let mut encoder = context
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("matmul_encoder"),
        });
    {
        let mut cpass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("matmul_pass"),
            timestamp_writes: None,
        });
        cpass.set_pipeline(&kernel.pipeline);
        cpass.set_bind_group(0, &bind_group, &[]);
        // One workgroup per W×W tile of C.
        let (groups_x, groups_y) = partition.groups();
        cpass.dispatch_workgroups(groups_x, groups_y, 1);
    }
    // Recording errors surface when the encoder is finished.
    let (commands, finish_error) =
        context.scoped(wgpu::ErrorFilter::Validation, || encoder.finish());
    if let Some(error) = finish_error {
        return Err(OffloadError::Dispatch {
            reason: error.to_string(),
        });
    }
    Ok(WgpuLaunch {
        commands,
        _dims: dims,
        _bind_group: bind_group,
    })
}

/// Submit a recorded launch and wait for the queue to drain.
pub fn submit_and_wait(context: &GpuContext, launch: WgpuLaunch) -> Result<(), OffloadError> {
    let (_, error) = context.scoped(wgpu::ErrorFilter::Validation, || {
        context.queue.submit([launch.commands]);
    });
    if let Some(error) = error {
        return Err(OffloadError::Dispatch {
            reason: error.to_string(),
        });
    }
    context
        .drain()
        .map_err(|reason| OffloadError::Dispatch { reason })
}

/// Copy `buffer` into `out` through a staging buffer.
pub fn download(context: &GpuContext, buffer: &GpuBuffer<f32>, out: &mut [f32]) -> Result<(), OffloadError> {
    if buffer.len != out.len() {
        return Err(OffloadError::BufferLength {
            what: "readback destination",
            expected: buffer.len,
            actual: out.len(),
        });
    }
    // Storage buffers cannot be mapped, so copy C into a MAP_READ
    // staging buffer first.
    let staging = GpuBuffer::<f32>::new_download(context, buffer.len)?;
    let mut encoder = context
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("readback_encoder"),
        });
    encoder.copy_buffer_to_buffer(&buffer.buffer, 0, &staging.buffer, 0, buffer.byte_len());
    let (_, error) = context.scoped(wgpu::ErrorFilter::Validation, || {
        context.queue.submit([encoder.finish()]);
    });
    if let Some(error) = error {
        return Err(OffloadError::Readback {
            reason: error.to_string(),
        });
    }
    let values = staging.read_to_vec(context)?;
    out.copy_from_slice(&values);
    Ok(())
}

impl ExecutionContext for GpuContext {
    type Kernel = WgpuKernel;
    type Buffer = GpuBuffer<f32>;
    type Launch = WgpuLaunch;

    fn device(&self) -> &DeviceInfo {
        self.info()
    }

    fn build_kernel(
        &self,
        source: &KernelSource,
        partition: &Partition,
    ) -> Result<WgpuKernel, OffloadError> {
        compile_kernel(self, source, partition)
    }

    fn upload(
        &self,
        what: &'static str,
        data: &[f32],
        access: Access,
    ) -> Result<GpuBuffer<f32>, OffloadError> {
        GpuBuffer::from_slice(self, what, data, access)
    }

    fn record(
        &self,
        kernel: &WgpuKernel,
        args: KernelArgs<'_, GpuBuffer<f32>>,
        partition: &Partition,
    ) -> Result<WgpuLaunch, OffloadError> {
        record_dispatch(self, kernel, args, partition)
    }

    fn submit_and_wait(&self, launch: WgpuLaunch) -> Result<(), OffloadError> {
        submit_and_wait(self, launch)
    }

    fn download(&self, buffer: &GpuBuffer<f32>, out: &mut [f32]) -> Result<(), OffloadError> {
        download(self, buffer, out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downlevel_limits_reject_large_groups() {
        let limits = wgpu::Limits::downlevel_defaults();
        let fits = Partition::new(64, 64, 16).unwrap();
        assert!(check_partition(&limits, &fits).is_ok());
        let too_many_invocations = Partition::new(64, 64, 32).unwrap();
        assert!(matches!(
            check_partition(&limits, &too_many_invocations),
            Err(OffloadError::InvalidPartition { .. })
        ));
        let reference_default = Partition::new(1024, 1024, 64).unwrap();
        assert!(check_partition(&limits, &reference_default).is_err());
    }

    #[test]
    fn grid_dimension_limit() {
        let mut limits = wgpu::Limits::downlevel_defaults();
        limits.max_compute_workgroups_per_dimension = 4;
        let partition = Partition::new(10, 2, 2).unwrap();
        assert!(check_partition(&limits, &partition).is_err());
    }
}
