// Copyright (c) 2024 The vkcompute developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The hardware abstraction layer that command buffers are translated into.
//!
//! The HAL is an eagerly-executing, lower-level interface: it knows about command buffers that
//! hold kernel launches and buffer transfers, binary fences and semaphores, executables created
//! from a binary blob, and raw memory. It knows nothing about pipeline barriers, descriptor sets
//! or events; those are resolved by the [command buffer](crate::command_buffer) layer before any
//! HAL call is made.
//!
//! Implementations are used through `Arc<dyn Hal>`. The objects created through the trait are
//! identified by raw handles; the [`objects`] module provides owning wrappers that destroy them
//! on drop.
//!
//! The [`host`] module contains an implementation that runs entirely on the CPU.

pub use self::objects::{
    HalBuffer, HalCommandBuffer, HalExecutable, HalFence, HalKernel, HalMemory, HalSemaphore,
};
use crate::{sync::PipelineStages, DeviceSize, VulkanError};
use std::{
    error::Error,
    fmt::{Debug, Display, Error as FmtError, Formatter},
    num::NonZeroU64,
    sync::Arc,
    time::Duration,
};

pub mod host;
mod objects;

macro_rules! raw_handles {
    ($($(#[doc = $doc:literal])* $name:ident,)+) => {
        $(
            $(#[doc = $doc])*
            #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
            #[repr(transparent)]
            pub struct $name(NonZeroU64);

            impl $name {
                /// Wraps a raw handle value produced by a HAL implementation.
                #[inline]
                pub const fn from_raw(raw: NonZeroU64) -> Self {
                    Self(raw)
                }

                /// Returns the raw handle value.
                #[inline]
                pub const fn as_raw(self) -> NonZeroU64 {
                    self.0
                }
            }
        )+
    };
}

raw_handles! {
    /// A HAL command buffer.
    RawCommandBuffer,
    /// A binary fence that the host can wait on.
    RawFence,
    /// A binary semaphore used to order HAL submissions against each other.
    RawSemaphore,
    /// An executable created from a kernel binary.
    RawExecutable,
    /// A kernel entry point of an executable.
    RawKernel,
    /// A device memory allocation.
    RawMemory,
    /// A buffer object that can be bound to device memory.
    RawBuffer,
}

/// A callback executed on the device timeline. It may block, which stalls the HAL command buffer
/// it was enqueued into.
pub type UserCallback = Arc<dyn Fn() + Send + Sync>;

/// The interface to a lower-level device execution layer.
///
/// Every method that creates an object may fail; failures are reported as [`HalError`]. Enqueue
/// methods append to a HAL command buffer and don't execute anything until the command buffer is
/// [submitted](Hal::submit). HAL command buffers keep their operations after a submission, so
/// the same command buffer can be submitted again.
pub trait Hal: Send + Sync + Debug {
    /// Returns the properties of the memory that buffers are allocated from.
    fn memory_properties(&self) -> MemoryProperties;

    fn create_command_buffer(&self) -> Result<RawCommandBuffer, HalError>;

    /// Removes every operation recorded into `command_buffer`.
    fn reset_command_buffer(&self, command_buffer: RawCommandBuffer) -> Result<(), HalError>;

    fn destroy_command_buffer(&self, command_buffer: RawCommandBuffer);

    fn create_fence(&self, signaled: bool) -> Result<RawFence, HalError>;

    /// Returns whether `fence` is signaled, without blocking.
    fn fence_status(&self, fence: RawFence) -> Result<bool, HalError>;

    /// Blocks until `fence` is signaled or `timeout` elapses. Returns `false` on timeout.
    fn wait_fence(&self, fence: RawFence, timeout: Option<Duration>) -> Result<bool, HalError>;

    fn reset_fence(&self, fence: RawFence) -> Result<(), HalError>;

    fn destroy_fence(&self, fence: RawFence);

    fn create_semaphore(&self) -> Result<RawSemaphore, HalError>;

    /// Puts `semaphore` back into the unsignaled state.
    fn reset_semaphore(&self, semaphore: RawSemaphore) -> Result<(), HalError>;

    fn destroy_semaphore(&self, semaphore: RawSemaphore);

    /// Creates an executable from a finalized kernel binary.
    fn create_executable(&self, binary: &[u8]) -> Result<RawExecutable, HalError>;

    fn destroy_executable(&self, executable: RawExecutable);

    /// Looks up the kernel called `name` in `executable`.
    fn create_kernel(&self, executable: RawExecutable, name: &str) -> Result<RawKernel, HalError>;

    fn destroy_kernel(&self, kernel: RawKernel);

    fn allocate_memory(&self, size: DeviceSize) -> Result<RawMemory, HalError>;

    fn free_memory(&self, memory: RawMemory);

    fn create_buffer(&self, size: DeviceSize) -> Result<RawBuffer, HalError>;

    fn bind_buffer_memory(
        &self,
        buffer: RawBuffer,
        memory: RawMemory,
        offset: DeviceSize,
    ) -> Result<(), HalError>;

    fn destroy_buffer(&self, buffer: RawBuffer);

    /// Maps a range of host-visible memory.
    fn map_memory(
        &self,
        memory: RawMemory,
        offset: DeviceSize,
        size: DeviceSize,
    ) -> Result<(), HalError>;

    /// Writes through the current mapping of `memory`. `offset` is relative to the allocation.
    fn write_mapped_memory(
        &self,
        memory: RawMemory,
        offset: DeviceSize,
        data: &[u8],
    ) -> Result<(), HalError>;

    /// Reads through the current mapping of `memory`. `offset` is relative to the allocation.
    fn read_mapped_memory(
        &self,
        memory: RawMemory,
        offset: DeviceSize,
        data: &mut [u8],
    ) -> Result<(), HalError>;

    /// Makes host writes to a mapped range visible to the device. Only needed if the memory is not
    /// [host-coherent](MemoryProperties::host_coherent).
    fn flush_mapped_memory(
        &self,
        memory: RawMemory,
        offset: DeviceSize,
        size: DeviceSize,
    ) -> Result<(), HalError>;

    /// Makes device writes to a mapped range visible to the host. Only needed if the memory is not
    /// [host-coherent](MemoryProperties::host_coherent).
    fn invalidate_mapped_memory(
        &self,
        memory: RawMemory,
        offset: DeviceSize,
        size: DeviceSize,
    ) -> Result<(), HalError>;

    fn unmap_memory(&self, memory: RawMemory);

    /// Appends a kernel launch.
    fn enqueue_ndrange(
        &self,
        command_buffer: RawCommandBuffer,
        kernel: RawKernel,
        ndrange: &NdRange,
        args: &[KernelArg],
    ) -> Result<(), HalError>;

    fn enqueue_copy_buffer(
        &self,
        command_buffer: RawCommandBuffer,
        src_buffer: RawBuffer,
        dst_buffer: RawBuffer,
        regions: &[BufferCopy],
    ) -> Result<(), HalError>;

    /// Appends a fill of `size` bytes of `dst_buffer` at `offset` with the repeated word `data`.
    fn enqueue_fill_buffer(
        &self,
        command_buffer: RawCommandBuffer,
        dst_buffer: RawBuffer,
        offset: DeviceSize,
        size: DeviceSize,
        data: u32,
    ) -> Result<(), HalError>;

    /// Appends a write of `data`, captured at the time of this call, into `dst_buffer`.
    fn enqueue_write_buffer(
        &self,
        command_buffer: RawCommandBuffer,
        dst_buffer: RawBuffer,
        offset: DeviceSize,
        data: &[u8],
    ) -> Result<(), HalError>;

    /// Appends a callback that is run on the device timeline when execution reaches it.
    fn enqueue_user_callback(
        &self,
        command_buffer: RawCommandBuffer,
        callback: UserCallback,
    ) -> Result<(), HalError>;

    /// Submits a command buffer for execution.
    fn submit(&self, batch: &SubmitBatch<'_>) -> Result<(), HalError>;

    /// Blocks until every submission made so far has finished executing.
    fn wait_idle(&self) -> Result<(), HalError>;
}

/// Properties of the memory that a HAL allocates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryProperties {
    /// Whether host writes through a mapping are visible to the device without a flush, and
    /// device writes are visible through a mapping without an invalidate.
    pub host_coherent: bool,
}

/// The launch geometry of a kernel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct NdRange {
    pub global_offset: [u32; 3],
    pub global_size: [u32; 3],
    pub local_size: [u32; 3],
}

impl NdRange {
    /// Returns the number of workgroups in each dimension.
    #[inline]
    pub fn group_counts(&self) -> [u32; 3] {
        [0, 1, 2].map(|i| {
            if self.local_size[i] == 0 {
                0
            } else {
                self.global_size[i] / self.local_size[i]
            }
        })
    }
}

/// An argument passed to a kernel launch, in the order the kernel expects its arguments.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KernelArg {
    /// A range of a buffer bound through a descriptor.
    Buffer {
        buffer: RawBuffer,
        offset: DeviceSize,
        range: DeviceSize,
    },

    /// The push-constant block of the dispatch.
    PushConstants { buffer: RawBuffer, size: DeviceSize },

    /// An array of `u32` holding the byte size of each bound buffer, in binding order, which the
    /// device code uses for bounds checking.
    BufferSizes { buffer: RawBuffer, count: u32 },
}

/// A region of a buffer-to-buffer copy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BufferCopy {
    pub src_offset: DeviceSize,
    pub dst_offset: DeviceSize,
    pub size: DeviceSize,
}

/// Parameters of a [`Hal::submit`] call.
#[derive(Clone, Copy, Debug)]
pub struct SubmitBatch<'a> {
    pub command_buffer: RawCommandBuffer,

    /// Semaphores to wait on before the command buffer starts executing, together with the
    /// stages of the command buffer that have to wait.
    pub wait_semaphores: &'a [(RawSemaphore, PipelineStages)],

    /// Semaphores signaled once the command buffer has finished executing.
    pub signal_semaphores: &'a [RawSemaphore],

    /// Fences signaled once the command buffer has finished executing.
    pub signal_fences: &'a [RawFence],
}

/// Error that can happen in a HAL call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HalError {
    OutOfHostMemory,
    OutOfDeviceMemory,
    /// The binary handed to [`Hal::create_executable`] could not be loaded.
    InvalidBinary,
    /// The executable has no kernel with the requested name.
    KernelNotFound(String),
    /// A handle or parameter passed to the HAL was not valid for the call.
    InvalidArgument(&'static str),
    MemoryMapFailed,
    DeviceLost,
}

impl Error for HalError {}

impl Display for HalError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        match self {
            Self::OutOfHostMemory => write!(f, "the HAL ran out of host memory"),
            Self::OutOfDeviceMemory => write!(f, "the HAL ran out of device memory"),
            Self::InvalidBinary => write!(f, "the kernel binary could not be loaded"),
            Self::KernelNotFound(name) => {
                write!(f, "the executable does not contain a kernel named `{}`", name)
            }
            Self::InvalidArgument(what) => {
                write!(f, "invalid argument passed to the HAL: {}", what)
            }
            Self::MemoryMapFailed => write!(f, "mapping of a memory object has failed"),
            Self::DeviceLost => write!(f, "the device has been lost"),
        }
    }
}

impl From<HalError> for VulkanError {
    fn from(err: HalError) -> Self {
        match err {
            HalError::OutOfHostMemory => Self::OutOfHostMemory,
            HalError::OutOfDeviceMemory => Self::OutOfDeviceMemory,
            HalError::InvalidBinary | HalError::KernelNotFound(_) => Self::InvalidShader,
            HalError::InvalidArgument(_) => Self::InitializationFailed,
            HalError::MemoryMapFailed => Self::MemoryMapFailed,
            HalError::DeviceLost => Self::DeviceLost,
        }
    }
}
