// Copyright (c) 2024 The vkcompute developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The pool that command buffers are allocated from.
//!
//! The pool decides whether its command buffers may be reset individually, either explicitly
//! with [`CommandBuffer::reset`] or implicitly by beginning a command buffer that was already
//! recorded.

use super::{sys::CommandBuffer, CommandBufferLevel};
use crate::{
    device::Device,
    macros::{impl_id_counter, vulkan_bitflags},
    DeviceOwned, Validated, VulkanError,
};
use std::{num::NonZeroU64, sync::Arc};

/// Owns the command buffers allocated from it, in the sense that it determines how they may be
/// reset.
#[derive(Debug)]
pub struct CommandPool {
    device: Arc<Device>,
    id: NonZeroU64,
    flags: CommandPoolCreateFlags,
}

impl CommandPool {
    /// Creates a new `CommandPool`.
    pub fn new(
        device: Arc<Device>,
        create_info: CommandPoolCreateInfo,
    ) -> Result<Arc<CommandPool>, Validated<VulkanError>> {
        let CommandPoolCreateInfo { flags, _ne: _ } = create_info;

        Ok(Arc::new(CommandPool {
            device,
            id: Self::next_id(),
            flags,
        }))
    }

    /// Returns the flags that the command pool was created with.
    #[inline]
    pub fn flags(&self) -> CommandPoolCreateFlags {
        self.flags
    }

    /// Allocates command buffers.
    ///
    /// Every primary command buffer creates the HAL command buffer, fence and semaphore of its
    /// main segment right away. If that fails for one of them, the ones allocated so far are
    /// freed again.
    pub fn allocate_command_buffers(
        self: &Arc<Self>,
        allocate_info: CommandBufferAllocateInfo,
    ) -> Result<Vec<CommandBuffer>, VulkanError> {
        let CommandBufferAllocateInfo {
            level,
            command_buffer_count,
            _ne: _,
        } = allocate_info;

        let command_buffers = (0..command_buffer_count)
            .map(|_| CommandBuffer::new(self.clone(), level))
            .collect::<Result<Vec<_>, _>>()?;

        log::debug!(
            "allocated {} {:?} command buffers from pool {:?}",
            command_buffers.len(),
            level,
            self.id,
        );

        Ok(command_buffers)
    }
}

unsafe impl DeviceOwned for CommandPool {
    #[inline]
    fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

impl_id_counter!(CommandPool);

/// Parameters to create a `CommandPool`.
#[derive(Clone, Debug)]
pub struct CommandPoolCreateInfo {
    /// Additional properties of the command pool.
    ///
    /// The default value is empty.
    pub flags: CommandPoolCreateFlags,

    pub _ne: crate::NonExhaustive,
}

impl Default for CommandPoolCreateInfo {
    #[inline]
    fn default() -> Self {
        Self {
            flags: CommandPoolCreateFlags::empty(),
            _ne: crate::NonExhaustive(()),
        }
    }
}

vulkan_bitflags! {
    /// Additional properties of the command pool.
    CommandPoolCreateFlags = CommandPoolCreateFlags(u32);

    /// A hint that the command buffers will be short-lived.
    TRANSIENT = TRANSIENT,

    /// Command buffers may be reset individually, and recorded again after they have been
    /// recorded once.
    RESET_COMMAND_BUFFER = RESET_COMMAND_BUFFER,
}

/// Parameters to allocate command buffers from a `CommandPool`.
#[derive(Clone, Debug)]
pub struct CommandBufferAllocateInfo {
    /// The level of command buffer to allocate.
    ///
    /// The default value is [`CommandBufferLevel::Primary`].
    pub level: CommandBufferLevel,

    /// The number of command buffers to allocate.
    ///
    /// The default value is `1`.
    pub command_buffer_count: u32,

    pub _ne: crate::NonExhaustive,
}

impl Default for CommandBufferAllocateInfo {
    #[inline]
    fn default() -> Self {
        Self {
            level: CommandBufferLevel::Primary,
            command_buffer_count: 1,
            _ne: crate::NonExhaustive(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{CommandBufferAllocateInfo, CommandPool, CommandPoolCreateInfo};
    use crate::{
        command_buffer::{CommandBufferLevel, CommandBufferState},
        VulkanError,
    };

    #[test]
    fn allocate_primary_and_secondary() {
        let (host, _compiler, device, _queue) = host_device!();
        let pool = CommandPool::new(device, CommandPoolCreateInfo::default()).unwrap();
        let objects_before = host.live_object_count();

        let primaries = pool
            .allocate_command_buffers(CommandBufferAllocateInfo {
                command_buffer_count: 2,
                ..Default::default()
            })
            .unwrap();
        // Command buffer, fence and semaphore of the main segment of each.
        assert_eq!(host.live_object_count(), objects_before + 6);

        let secondaries = pool
            .allocate_command_buffers(CommandBufferAllocateInfo {
                level: CommandBufferLevel::Secondary,
                command_buffer_count: 3,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(host.live_object_count(), objects_before + 6);

        assert_eq!(primaries.len(), 2);
        assert_eq!(secondaries.len(), 3);
        assert!(secondaries
            .iter()
            .all(|cb| cb.level() == CommandBufferLevel::Secondary
                && cb.state() == CommandBufferState::Initial));

        drop(primaries);
        assert_eq!(host.live_object_count(), objects_before);
    }

    #[test]
    fn allocation_failure_frees_partial_allocations() {
        let (host, _compiler, device, _queue) = host_device!();
        let pool = CommandPool::new(device, CommandPoolCreateInfo::default()).unwrap();
        let objects_before = host.live_object_count();

        // Enough for the first command buffer and part of the second.
        host.set_object_budget(Some(4));
        let result = pool.allocate_command_buffers(CommandBufferAllocateInfo {
            command_buffer_count: 2,
            ..Default::default()
        });
        host.set_object_budget(None);

        assert!(matches!(result, Err(VulkanError::OutOfHostMemory)));
        assert_eq!(host.live_object_count(), objects_before);
    }
}
