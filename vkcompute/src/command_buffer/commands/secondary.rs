// Copyright (c) 2024 The vkcompute developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use crate::{
    command_buffer::{CommandBuffer, CommandBufferLevel, CommandBufferState},
    DeviceOwned, ValidationError,
};

/// # Commands to execute a secondary command buffer inside a primary command buffer.
impl CommandBuffer {
    /// Executes secondary command buffers as part of this primary command buffer.
    ///
    /// The commands of each secondary command buffer are recorded into `self` as if they had
    /// been recorded directly, including the state they bind and any pipeline barriers. An error
    /// that happened while recording a secondary command buffer becomes the error of `self`.
    pub fn execute_commands(
        &mut self,
        command_buffers: &[&CommandBuffer],
    ) -> Result<&mut Self, Box<ValidationError>> {
        self.validate_execute_commands(command_buffers)?;

        for command_buffer in command_buffers {
            if let Some(err) = command_buffer.error() {
                self.set_error(err);
            }

            log::trace!(
                "executing {} commands of secondary command buffer {:?}",
                command_buffer.commands().len(),
                command_buffer.id,
            );

            for command in command_buffer.commands() {
                self.record(command.clone());
            }
        }

        Ok(self)
    }

    fn validate_execute_commands(
        &self,
        command_buffers: &[&CommandBuffer],
    ) -> Result<(), Box<ValidationError>> {
        self.validate_recording().map_err(|err| {
            err.set_vuids(&["VUID-vkCmdExecuteCommands-commandBuffer-recording"])
        })?;

        if self.level() != CommandBufferLevel::Primary {
            return Err(Box::new(ValidationError {
                problem: "the command buffer is not a primary command buffer".into(),
                vuids: &["VUID-vkCmdExecuteCommands-bufferlevel"],
                ..Default::default()
            }));
        }

        if command_buffers.is_empty() {
            return Err(Box::new(ValidationError {
                context: "command_buffers".into(),
                problem: "is empty".into(),
                vuids: &["VUID-vkCmdExecuteCommands-commandBufferCount-arraylength"],
            }));
        }

        for (index, command_buffer) in command_buffers.iter().enumerate() {
            if command_buffer.device().id() != self.device().id() {
                return Err(Box::new(ValidationError {
                    context: format!("command_buffers[{}]", index).into(),
                    problem: "does not belong to the same device as the command buffer".into(),
                    vuids: &["VUID-vkCmdExecuteCommands-commonparent"],
                }));
            }

            if command_buffer.level() != CommandBufferLevel::Secondary {
                return Err(Box::new(ValidationError {
                    context: format!("command_buffers[{}]", index).into(),
                    problem: "is not a secondary command buffer".into(),
                    vuids: &["VUID-vkCmdExecuteCommands-pCommandBuffers-00088"],
                }));
            }

            if command_buffer.state() != CommandBufferState::Executable {
                return Err(Box::new(ValidationError {
                    context: format!("command_buffers[{}]", index).into(),
                    problem: "is not in the executable state".into(),
                    vuids: &["VUID-vkCmdExecuteCommands-pCommandBuffers-00089"],
                }));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        command_buffer::{
            CommandBufferAllocateInfo, CommandBufferBeginInfo, CommandBufferLevel, CommandPool,
            CommandPoolCreateInfo,
        },
        sync::{DependencyFlags, PipelineStages},
        VulkanError,
    };

    #[test]
    fn replays_barriers_and_errors() {
        let (_host, _compiler, device, _queue) = host_device!();
        let pool = CommandPool::new(device, CommandPoolCreateInfo::default()).unwrap();
        let mut secondary = pool
            .allocate_command_buffers(CommandBufferAllocateInfo {
                level: CommandBufferLevel::Secondary,
                ..Default::default()
            })
            .unwrap()
            .remove(0);
        let mut primary = pool
            .allocate_command_buffers(CommandBufferAllocateInfo::default())
            .unwrap()
            .remove(0);

        secondary.begin(CommandBufferBeginInfo::default()).unwrap();
        secondary
            .pipeline_barrier(
                PipelineStages::COMPUTE_SHADER,
                PipelineStages::TRANSFER,
                DependencyFlags::empty(),
            )
            .unwrap();
        secondary.copy_image(ash::vk::Image::null(), ash::vk::Image::null()).unwrap();

        primary.begin(CommandBufferBeginInfo::default()).unwrap();
        // Still recording.
        assert!(primary.execute_commands(&[&secondary]).is_err());
        assert!(secondary.end().is_err());

        // Not a secondary.
        let other = pool
            .allocate_command_buffers(CommandBufferAllocateInfo::default())
            .unwrap()
            .remove(0);
        assert!(primary.execute_commands(&[&other]).is_err());
        assert!(primary.execute_commands(&[]).is_err());

        primary
            .execute_commands(&[&secondary, &secondary])
            .unwrap();
        assert_eq!(primary.barrier_group_count(), 2);
        assert_eq!(primary.error(), Some(VulkanError::FeatureNotPresent));
    }
}
