// Copyright (c) 2024 The vkcompute developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Compute command submission for a Vulkan-style driver.
//!
//! This crate translates API-level command buffers into work on a lower-level hardware
//! abstraction layer (the [HAL](crate::hal)), while keeping the ordering and synchronization
//! guarantees of the Vulkan compute queue.
//!
//! # Brief summary
//!
//! - A [`Device`](crate::device::Device) bundles a HAL implementation, a
//!   [kernel compiler](crate::shader::KernelCompiler) and the device limits. Creating one also
//!   returns the [`Queue`](crate::device::Queue) that command buffers are submitted to.
//!
//! - [Buffers](crate::buffer) hold the data kernels operate on. They are made visible to kernels
//!   through [descriptor sets](crate::descriptor_set).
//!
//! - A [`ComputePipeline`](crate::pipeline::ComputePipeline) names a kernel entry point, its
//!   workgroup size and its [`PipelineLayout`](crate::pipeline::PipelineLayout). If the shader
//!   module carries no precompiled binary, a kernel is specialized for every dispatch.
//!
//! - [Command buffers](crate::command_buffer) are allocated from a
//!   [`CommandPool`](crate::command_buffer::CommandPool), recorded, ended, and submitted.
//!   Pipeline barriers split a command buffer into several HAL command buffers chained by
//!   semaphores.
//!
//! - [Events, fences and semaphores](crate::sync) synchronize work between the host, the
//!   device, and the segments of a submission.
//!
//! The [`host`](crate::hal::host) HAL backend executes everything on the CPU. It is what the
//! tests run against, and is a reasonable reference when writing a HAL for real hardware.

use std::{
    borrow::Cow,
    error::Error,
    fmt::{Display, Error as FmtError, Formatter},
    sync::Arc,
};

pub use ash::vk::DeviceSize;

#[macro_use]
mod tests;
pub(crate) mod macros;

pub mod buffer;
pub mod command_buffer;
pub mod descriptor_set;
pub mod device;
pub mod hal;
pub mod pipeline;
pub mod shader;
pub mod sync;

use crate::device::Device;

/// Implemented on objects that belong to a Vulkan device.
pub unsafe trait DeviceOwned {
    /// Returns the device that owns `self`.
    fn device(&self) -> &Arc<Device>;
}

/// Gives access to the raw HAL handle of an object.
pub trait VulkanObject {
    /// The type of the object.
    type Handle: Copy;

    /// Returns the raw HAL handle of the object.
    fn handle(&self) -> Self::Handle;
}

unsafe impl<T> DeviceOwned for T
where
    T: std::ops::Deref,
    T::Target: DeviceOwned,
{
    #[inline]
    fn device(&self) -> &Arc<Device> {
        (**self).device()
    }
}

/// An enumeration of runtime errors that can be returned to the application.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum VulkanError {
    OutOfHostMemory,
    OutOfDeviceMemory,
    InitializationFailed,
    DeviceLost,
    MemoryMapFailed,
    FeatureNotPresent,
    /// A kernel could not be specialized or finalized for its launch configuration.
    InvalidShader,
    Timeout,
    Unnamed(ash::vk::Result),
}

impl VulkanError {
    /// Returns whether the error is an out-of-memory condition on either the host or the device.
    #[inline]
    pub fn is_out_of_memory(self) -> bool {
        matches!(self, Self::OutOfHostMemory | Self::OutOfDeviceMemory)
    }
}

impl Error for VulkanError {}

impl Display for VulkanError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        match self {
            VulkanError::OutOfHostMemory => write!(f, "a host memory allocation has failed"),
            VulkanError::OutOfDeviceMemory => write!(f, "a device memory allocation has failed"),
            VulkanError::InitializationFailed => write!(
                f,
                "initialization of an object could not be completed for implementation-specific \
                reasons",
            ),
            VulkanError::DeviceLost => write!(f, "the logical or physical device has been lost"),
            VulkanError::MemoryMapFailed => write!(f, "mapping of a memory object has failed"),
            VulkanError::FeatureNotPresent => write!(f, "a requested feature is not supported"),
            VulkanError::InvalidShader => write!(
                f,
                "a kernel could not be specialized or finalized for its launch configuration",
            ),
            VulkanError::Timeout => write!(f, "a wait operation has not completed in time"),
            VulkanError::Unnamed(result) => {
                write!(f, "unnamed error, VkResult value {}", result.as_raw())
            }
        }
    }
}

impl From<ash::vk::Result> for VulkanError {
    fn from(val: ash::vk::Result) -> VulkanError {
        match val {
            ash::vk::Result::ERROR_OUT_OF_HOST_MEMORY => Self::OutOfHostMemory,
            ash::vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => Self::OutOfDeviceMemory,
            ash::vk::Result::ERROR_INITIALIZATION_FAILED => Self::InitializationFailed,
            ash::vk::Result::ERROR_DEVICE_LOST => Self::DeviceLost,
            ash::vk::Result::ERROR_MEMORY_MAP_FAILED => Self::MemoryMapFailed,
            ash::vk::Result::ERROR_FEATURE_NOT_PRESENT => Self::FeatureNotPresent,
            ash::vk::Result::ERROR_INVALID_SHADER_NV => Self::InvalidShader,
            ash::vk::Result::TIMEOUT => Self::Timeout,
            x => Self::Unnamed(x),
        }
    }
}

impl From<VulkanError> for ash::vk::Result {
    fn from(val: VulkanError) -> ash::vk::Result {
        match val {
            VulkanError::OutOfHostMemory => Self::ERROR_OUT_OF_HOST_MEMORY,
            VulkanError::OutOfDeviceMemory => Self::ERROR_OUT_OF_DEVICE_MEMORY,
            VulkanError::InitializationFailed => Self::ERROR_INITIALIZATION_FAILED,
            VulkanError::DeviceLost => Self::ERROR_DEVICE_LOST,
            VulkanError::MemoryMapFailed => Self::ERROR_MEMORY_MAP_FAILED,
            VulkanError::FeatureNotPresent => Self::ERROR_FEATURE_NOT_PRESENT,
            VulkanError::InvalidShader => Self::ERROR_INVALID_SHADER_NV,
            VulkanError::Timeout => Self::TIMEOUT,
            VulkanError::Unnamed(x) => x,
        }
    }
}

/// A wrapper for error types of functions that can return validation errors.
#[derive(Clone)]
pub enum Validated<E> {
    /// A non-validation error occurred.
    Error(E),

    /// A validation error occurred.
    ValidationError(Box<ValidationError>),
}

impl<E> Validated<E> {
    /// Maps the inner `Error` value using the provided function, or does nothing if the value is
    /// `ValidationError`.
    #[inline]
    pub fn map<F>(self, f: impl FnOnce(E) -> F) -> Validated<F> {
        match self {
            Self::Error(err) => Validated::Error(f(err)),
            Self::ValidationError(err) => Validated::ValidationError(err),
        }
    }

    /// Returns the inner `Error` value, or panics if it contains `ValidationError`.
    #[inline(always)]
    #[track_caller]
    pub fn unwrap(self) -> E {
        match self {
            Self::Error(err) => err,
            Self::ValidationError(err) => {
                panic!(
                    "called `Validated::unwrap` on a `ValidationError` value: {:?}",
                    err
                )
            }
        }
    }
}

impl<E> Error for Validated<E>
where
    E: Error + 'static,
{
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Error(err) => Some(err),
            Self::ValidationError(err) => Some(err),
        }
    }
}

impl<E> Display for Validated<E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        match self {
            Self::Error(_) => write!(f, "a non-validation error occurred"),
            Self::ValidationError(_) => write!(f, "a validation error occurred"),
        }
    }
}

impl<E> std::fmt::Debug for Validated<E>
where
    E: Display,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        match self {
            Self::Error(err) => write!(f, "a non-validation error occurred: {err}"),
            Self::ValidationError(err) => {
                write!(f, "a validation error occurred\n\nCaused by:\n    {err:?}")
            }
        }
    }
}

impl<E> From<Box<ValidationError>> for Validated<E> {
    fn from(err: Box<ValidationError>) -> Self {
        Self::ValidationError(err)
    }
}

impl From<VulkanError> for Validated<VulkanError> {
    fn from(err: VulkanError) -> Self {
        Self::Error(err)
    }
}

/// The arguments or other context of a call did not match the requirements of the API.
#[derive(Clone, Default)]
pub struct ValidationError {
    /// The context in which the problem exists (e.g. a specific parameter).
    pub context: Cow<'static, str>,

    /// A description of the problem.
    pub problem: Cow<'static, str>,

    /// *Valid Usage IDs* (VUIDs) in the Vulkan specification that relate to the problem.
    pub vuids: &'static [&'static str],
}

impl ValidationError {
    pub(crate) fn add_context(
        mut self: Box<Self>,
        context: impl Into<Cow<'static, str>>,
    ) -> Box<Self> {
        if self.context.is_empty() {
            self.context = context.into();
        } else {
            self.context = format!("{}.{}", context.into(), self.context).into();
        }

        self
    }

    pub(crate) fn set_vuids(mut self: Box<Self>, vuids: &'static [&'static str]) -> Box<Self> {
        self.vuids = vuids;
        self
    }
}

impl std::fmt::Debug for ValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        if self.context.is_empty() {
            write!(f, "{}", self.problem)?;
        } else {
            write!(f, "{}: {}", self.context, self.problem)?;
        }

        if !self.vuids.is_empty() {
            write!(f, "\n\nVulkan VUIDs:")?;

            for vuid in self.vuids {
                write!(f, "\n    {}", vuid)?;
            }
        }

        Ok(())
    }
}

impl Display for ValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        if self.context.is_empty() {
            write!(f, "{}", self.problem)
        } else {
            write!(f, "{}: {}", self.context, self.problem)
        }
    }
}

impl Error for ValidationError {}

/// A helper type for non-exhaustive structs.
///
/// This type cannot be constructed outside this crate. Structures with a field of this type can
/// only be constructed by calling a constructor function or `Default::default()`. The effect is
/// similar to the standard Rust `#[non_exhaustive]` attribute, except that it does not prevent
/// update syntax from being used.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)] // add traits as needed
pub struct NonExhaustive(pub(crate) ());
