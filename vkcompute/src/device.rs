// Copyright (c) 2024 The vkcompute developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The device and its queue.
//!
//! A [`Device`] ties together the [HAL](crate::hal) that work is executed on, the
//! [`KernelCompiler`] used to specialize kernels, and the limits that command recording is
//! validated against. Every other object of this crate belongs to a device.
//!
//! ```
//! use std::sync::Arc;
//! use vkcompute::{
//!     device::{Device, DeviceCreateInfo},
//!     hal::host::{HostCompiler, HostHal, HostHalCreateInfo},
//! };
//!
//! let hal = Arc::new(HostHal::new(HostHalCreateInfo::default()));
//! let compiler = Arc::new(HostCompiler::new());
//! let (device, queue) = Device::new(hal, compiler, DeviceCreateInfo::default()).unwrap();
//! assert_eq!(device.properties().max_push_constants_size, 128);
//! ```

pub use crate::DeviceOwned;
use crate::{
    command_buffer::{CommandBuffer, SubmitInfo},
    hal::Hal,
    macros::impl_id_counter,
    shader::KernelCompiler,
    DeviceSize, Validated, ValidationError, VulkanError,
};
use std::{num::NonZeroU64, sync::Arc};

/// The largest amount of data that a single `update_buffer` command can write.
pub const MAX_UPDATE_BUFFER_SIZE: DeviceSize = 65536;

/// Represents a device that compute work is executed on.
#[derive(Debug)]
pub struct Device {
    id: NonZeroU64,
    hal: Arc<dyn Hal>,
    compiler: Arc<dyn KernelCompiler>,
    properties: DeviceProperties,
}

impl Device {
    /// Creates a new `Device` on top of `hal`, together with its queue.
    pub fn new(
        hal: Arc<dyn Hal>,
        compiler: Arc<dyn KernelCompiler>,
        create_info: DeviceCreateInfo,
    ) -> Result<(Arc<Device>, Arc<Queue>), Validated<VulkanError>> {
        create_info
            .validate()
            .map_err(|err| err.add_context("create_info"))?;

        let DeviceCreateInfo {
            max_push_constants_size,
            max_compute_work_group_size,
            max_compute_work_group_invocations,
            _ne: _,
        } = create_info;

        let host_coherent_memory = hal.memory_properties().host_coherent;
        let device = Arc::new(Device {
            id: Self::next_id(),
            hal,
            compiler,
            properties: DeviceProperties {
                max_push_constants_size,
                max_compute_work_group_size,
                max_compute_work_group_invocations,
                max_update_buffer_size: MAX_UPDATE_BUFFER_SIZE,
                host_coherent_memory,
            },
        });

        log::debug!("created device {:?} on {:?}", device.id, device.hal);

        let queue = Arc::new(Queue {
            id: Queue::next_id(),
            device: device.clone(),
        });

        Ok((device, queue))
    }

    /// Returns the HAL that the device executes work on.
    #[inline]
    pub fn hal(&self) -> &Arc<dyn Hal> {
        &self.hal
    }

    /// Returns the compiler used to specialize kernels.
    #[inline]
    pub fn compiler(&self) -> &Arc<dyn KernelCompiler> {
        &self.compiler
    }

    #[inline]
    pub fn properties(&self) -> &DeviceProperties {
        &self.properties
    }

    /// Blocks until all work submitted to the device has finished.
    pub fn wait_idle(&self) -> Result<(), VulkanError> {
        self.hal.wait_idle().map_err(Into::into)
    }
}

impl_id_counter!(Device);

/// Parameters to create a new `Device`.
#[derive(Clone, Debug)]
pub struct DeviceCreateInfo {
    /// The maximum size in bytes of the push constants of a pipeline layout.
    ///
    /// The default value is `128`.
    pub max_push_constants_size: u32,

    /// The maximum workgroup size of a compute pipeline in each dimension.
    ///
    /// The default value is `[1024, 1024, 64]`.
    pub max_compute_work_group_size: [u32; 3],

    /// The maximum number of invocations in one workgroup.
    ///
    /// The default value is `1024`.
    pub max_compute_work_group_invocations: u32,

    pub _ne: crate::NonExhaustive,
}

impl Default for DeviceCreateInfo {
    #[inline]
    fn default() -> Self {
        Self {
            max_push_constants_size: 128,
            max_compute_work_group_size: [1024, 1024, 64],
            max_compute_work_group_invocations: 1024,
            _ne: crate::NonExhaustive(()),
        }
    }
}

impl DeviceCreateInfo {
    pub(crate) fn validate(&self) -> Result<(), Box<ValidationError>> {
        let &Self {
            max_push_constants_size,
            max_compute_work_group_size,
            max_compute_work_group_invocations,
            _ne: _,
        } = self;

        if max_push_constants_size < 128 {
            return Err(Box::new(ValidationError {
                context: "max_push_constants_size".into(),
                problem: "is less than 128".into(),
                ..Default::default()
            }));
        }

        if max_push_constants_size % 4 != 0 {
            return Err(Box::new(ValidationError {
                context: "max_push_constants_size".into(),
                problem: "is not a multiple of 4".into(),
                ..Default::default()
            }));
        }

        if max_compute_work_group_size.contains(&0) || max_compute_work_group_invocations == 0 {
            return Err(Box::new(ValidationError {
                context: "max_compute_work_group_size".into(),
                problem: "contains zero, or `max_compute_work_group_invocations` is zero".into(),
                ..Default::default()
            }));
        }

        Ok(())
    }
}

/// The limits and properties of a device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub struct DeviceProperties {
    pub max_push_constants_size: u32,
    pub max_compute_work_group_size: [u32; 3],
    pub max_compute_work_group_invocations: u32,

    /// The largest amount of data that one `update_buffer` command can write.
    pub max_update_buffer_size: DeviceSize,

    /// Whether buffer memory is host-coherent, in which case uploads skip the flush.
    pub host_coherent_memory: bool,
}

/// Represents a queue where command buffers can be submitted.
#[derive(Debug)]
pub struct Queue {
    id: NonZeroU64,
    device: Arc<Device>,
}

impl Queue {
    /// Submits a primary command buffer for execution.
    ///
    /// The segments of the command buffer that pipeline barriers split it into are submitted to
    /// the HAL as a chain, each waiting on the semaphore of the previous one. The first segment
    /// waits on `submit_info.wait_semaphores`, the last signals `submit_info.signal_semaphores`
    /// and `submit_info.fence`.
    ///
    /// If an error was recorded while the command buffer was being recorded, that error is
    /// returned and nothing is submitted.
    pub fn submit(
        &self,
        command_buffer: &mut CommandBuffer,
        submit_info: SubmitInfo,
    ) -> Result<(), Validated<VulkanError>> {
        submit_info
            .validate(&self.device)
            .map_err(|err| err.add_context("submit_info"))?;

        command_buffer.submit(self, submit_info)
    }

    /// Blocks until all work submitted to the queue has finished.
    #[inline]
    pub fn wait_idle(&self) -> Result<(), VulkanError> {
        self.device.wait_idle()
    }
}

unsafe impl DeviceOwned for Queue {
    #[inline]
    fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

impl_id_counter!(Queue);

#[cfg(test)]
mod tests {
    use super::{Device, DeviceCreateInfo};
    use crate::{
        hal::host::{HostCompiler, HostHal, HostHalCreateInfo},
        Validated,
    };
    use std::sync::Arc;

    #[test]
    fn reports_memory_coherence() {
        let (_host, _compiler, device, _queue) = host_device!(HostHalCreateInfo {
            host_coherent: false,
            ..Default::default()
        });

        assert!(!device.properties().host_coherent_memory);
        assert_eq!(device.properties().max_update_buffer_size, 65536);
    }

    #[test]
    fn push_constant_limit_too_small() {
        let result = Device::new(
            Arc::new(HostHal::new(HostHalCreateInfo::default())),
            Arc::new(HostCompiler::new()),
            DeviceCreateInfo {
                max_push_constants_size: 64,
                ..Default::default()
            },
        );

        assert!(matches!(result, Err(Validated::ValidationError(_))));
    }
}
