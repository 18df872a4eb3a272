//! Typed GPU buffers and host readback utilities.
//!
//! This module defines a [`GpuBuffer`] wrapper around [`wgpu::Buffer`]
//! that tracks the number of typed elements stored in the buffer and the
//! access mode the kernel sees it with.  Allocation is checked against
//! the device limits and wrapped in out-of-memory and validation error
//! scopes, so a failed allocation comes back as an
//! [`OffloadError::Allocation`] instead of a panic.

use std::marker::PhantomData;
use std::sync::mpsc;

use bytemuck::{cast_slice, Pod};
use log::debug;
use wgpu::util::{BufferInitDescriptor, DeviceExt};
use wgpu::{Buffer, BufferDescriptor, BufferUsages};

use crate::backend::Access;
use crate::error::OffloadError;
use crate::GpuContext;

/// A typed GPU buffer.
///
/// The underlying buffer size in bytes is
/// `len * std::mem::size_of::<T>()`.  The wgpu buffer is released when
/// this value is dropped.
pub struct GpuBuffer<T: Pod> {
    pub buffer: Buffer,
    pub len: usize,
    pub access: Access,
    _marker: PhantomData<T>,
}

impl<T: Pod> GpuBuffer<T> {
    /// Create a storage buffer initialised with `data`.
    ///
    /// The contents are copied while the buffer is mapped at creation,
    /// so they are in place before any command is submitted.  Writable
    /// buffers also get `COPY_SRC` so they can be read back.
    pub fn from_slice(
        context: &GpuContext,
        what: &'static str,
        data: &[T],
        access: Access,
    ) -> Result<Self, OffloadError> {
        let bytes: &[u8] = cast_slice(data);
        let size = bytes.len() as u64;
        check_storage_size(context, what, size)?;
        let usage = match access {
            Access::ReadOnly => BufferUsages::STORAGE,
            Access::ReadWrite => BufferUsages::STORAGE | BufferUsages::COPY_SRC,
        };
        let buffer = allocate(context, what, size, || {
            context.device.create_buffer_init(&BufferInitDescriptor {
                label: Some(what),
                contents: bytes,
                usage,
            })
        })?;
        debug!("uploaded {what}: {} elements ({size} bytes, {access:?})", data.len());
        Ok(Self {
            buffer,
            len: data.len(),
            access,
            _marker: PhantomData,
        })
    }

    /// Create a uniform buffer holding a single value.
    pub fn uniform(context: &GpuContext, what: &'static str, value: &T) -> Result<Self, OffloadError> {
        let bytes = bytemuck::bytes_of(value);
        let buffer = allocate(context, what, bytes.len() as u64, || {
            context.device.create_buffer_init(&BufferInitDescriptor {
                label: Some(what),
                contents: bytes,
                usage: BufferUsages::UNIFORM,
            })
        })?;
        Ok(Self {
            buffer,
            len: 1,
            access: Access::ReadOnly,
            _marker: PhantomData,
        })
    }

    /// Create a download buffer sized to hold `len` elements.  It is
    /// mappable for reading by the CPU and cannot be bound to a shader.
    pub fn new_download(context: &GpuContext, len: usize) -> Result<Self, OffloadError> {
        let size = (len * std::mem::size_of::<T>()) as u64;
        let buffer = allocate(context, "readback staging", size, || {
            context.device.create_buffer(&BufferDescriptor {
                label: Some("readback_staging"),
                size,
                usage: BufferUsages::COPY_DST | BufferUsages::MAP_READ,
                mapped_at_creation: false,
            })
        })?;
        Ok(Self {
            buffer,
            len,
            access: Access::ReadWrite,
            _marker: PhantomData,
        })
    }

    /// Size of the buffer in bytes.
    pub fn byte_len(&self) -> u64 {
        (self.len * std::mem::size_of::<T>()) as u64
    }

    /// Read the contents of a `MAP_READ` buffer back to the CPU.
    ///
    /// Blocks until the device has finished all submitted work and the
    /// mapping is ready.  The buffer is unmapped again before returning.
    pub fn read_to_vec(&self, context: &GpuContext) -> Result<Vec<T>, OffloadError> {
        // Request a mapping of the whole buffer.  The callback only fires
        // while the device is polled, so poll until the queue is idle and
        // then collect the mapping result from the channel.
        let slice = self.buffer.slice(..);
        let (sender, receiver) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        context
            .drain()
            .map_err(|reason| OffloadError::Readback { reason })?;
        receiver
            .recv()
            .map_err(|_| OffloadError::Readback {
                reason: "mapping callback was dropped".into(),
            })?
            .map_err(|e| OffloadError::Readback {
                reason: e.to_string(),
            })?;

        let data = slice.get_mapped_range();
        let result: Vec<T> = cast_slice(&data).to_vec();
        // The mapped view must be gone before unmapping.
        drop(data);
        self.buffer.unmap();
        Ok(result)
    }
}

fn check_storage_size(context: &GpuContext, what: &'static str, size: u64) -> Result<(), OffloadError> {
    // A storage buffer must both exist and be bindable in one piece.
    let limits = context.device.limits();
    let binding_limit = u64::from(limits.max_storage_buffer_binding_size);
    if size > limits.max_buffer_size || size > binding_limit {
        return Err(OffloadError::Allocation {
            what,
            bytes: size,
            reason: format!(
                "exceeds device limits (max_buffer_size {}, max_storage_buffer_binding_size {})",
                limits.max_buffer_size, binding_limit
            ),
        });
    }
    Ok(())
}

fn allocate(
    context: &GpuContext,
    what: &'static str,
    size: u64,
    create: impl FnOnce() -> Buffer,
) -> Result<Buffer, OffloadError> {
    // Scopes nest: the inner one catches validation errors such as a
    // size over the limits, the outer one a failed allocation.
    let ((buffer, validation), out_of_memory) = context.scoped(wgpu::ErrorFilter::OutOfMemory, || {
        context.scoped(wgpu::ErrorFilter::Validation, create)
    });
    match out_of_memory.or(validation) {
        None => Ok(buffer),
        Some(error) => Err(OffloadError::Allocation {
            what,
            bytes: size,
            reason: error.to_string(),
        }),
    }
}
