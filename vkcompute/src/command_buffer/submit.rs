// Copyright (c) 2024 The vkcompute developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Submission of a primary command buffer as a chain of segments.
//!
//! The main segment and every barrier group are submitted in order. Each segment after the first
//! waits on the semaphore of the segment before it, for the stages of its own commands. The user's
//! wait semaphores gate the first segment, and the user's signal semaphores and fence are signaled
//! by the last one.

use super::{
    barrier::{Segment, Target},
    sys::CommandBuffer,
    CommandBufferLevel, CommandBufferState, CommandBufferUsage, SubmitInfo,
};
use crate::{
    device::Queue,
    hal::{Hal, HalFence, RawFence, RawSemaphore, SubmitBatch},
    sync::PipelineStages,
    DeviceOwned, Validated, ValidationError, VulkanError, VulkanObject,
};
use smallvec::{smallvec, SmallVec};
use std::{iter, mem, sync::Arc};

impl CommandBuffer {
    pub(crate) fn submit(
        &mut self,
        queue: &Queue,
        submit_info: SubmitInfo,
    ) -> Result<(), Validated<VulkanError>> {
        self.retire();
        self.validate_submit(queue)?;

        if let Some(err) = self.error {
            return Err(Validated::Error(err));
        }

        Ok(self.submit_unchecked(&submit_info)?)
    }

    fn validate_submit(&self, queue: &Queue) -> Result<(), Box<ValidationError>> {
        if self.level != CommandBufferLevel::Primary {
            return Err(Box::new(ValidationError {
                problem: "the command buffer is not a primary command buffer".into(),
                vuids: &["VUID-VkSubmitInfo-pCommandBuffers-00075"],
                ..Default::default()
            }));
        }

        if queue.device().id() != self.device().id() {
            return Err(Box::new(ValidationError {
                problem: "the command buffer and the queue do not belong to the same device"
                    .into(),
                vuids: &["VUID-vkQueueSubmit-commonparent"],
                ..Default::default()
            }));
        }

        match self.state {
            CommandBufferState::Executable => (),
            CommandBufferState::Pending | CommandBufferState::Resolving => {
                if self.usage != CommandBufferUsage::SimultaneousUse {
                    return Err(Box::new(ValidationError {
                        problem: "the command buffer is still executing, and was not begun \
                            with `CommandBufferUsage::SimultaneousUse`"
                            .into(),
                        vuids: &["VUID-vkQueueSubmit-pCommandBuffers-00071"],
                        ..Default::default()
                    }));
                }
            }
            CommandBufferState::Initial | CommandBufferState::Recording => {
                return Err(Box::new(ValidationError {
                    problem: "the command buffer is not in the executable state".into(),
                    vuids: &["VUID-vkQueueSubmit-pCommandBuffers-00070"],
                    ..Default::default()
                }));
            }
        }

        if self.usage == CommandBufferUsage::OneTimeSubmit && self.primary().submit_count > 0 {
            return Err(Box::new(ValidationError {
                problem: "the command buffer was begun with `CommandBufferUsage::OneTimeSubmit`, \
                    and has already been submitted"
                    .into(),
                vuids: &["VUID-vkQueueSubmit-pCommandBuffers-00072"],
                ..Default::default()
            }));
        }

        Ok(())
    }

    fn submit_unchecked(&mut self, submit_info: &SubmitInfo) -> Result<(), VulkanError> {
        let executing = self.primary().is_executing();

        if !self.primary().resolved {
            self.resolve()?;
        }

        let hal = self.device().hal().clone();
        let id = self.id;
        let primary = self.primary_mut();

        let result = if executing {
            let mut chain = primary
                .segments()
                .map(|source| -> Result<Segment, VulkanError> {
                    let mut segment = Segment::new(&hal)?;

                    for entry in &source.replay {
                        segment.write(&entry.command, entry.kernel.as_deref())?;
                    }

                    Ok(segment)
                })
                .collect::<Result<Vec<_>, _>>()?;

            log::debug!(
                "command buffer {:?}: still executing, submitting a replayed chain of {} segments",
                id,
                chain.len(),
            );

            let result = submit_chain(&hal, chain.iter_mut().collect(), submit_info);
            primary.transient_chains.push(chain);

            result
        } else {
            log::debug!(
                "command buffer {:?}: submitting a chain of {} segments",
                id,
                primary.barrier_groups.len() + 1,
            );

            let chain = iter::once(&mut primary.main)
                .chain(
                    primary
                        .barrier_groups
                        .iter_mut()
                        .map(|group| &mut group.segment),
                )
                .collect();

            submit_chain(&hal, chain, submit_info)
        };

        primary.submit_count += 1;
        let still_executing = primary.is_executing();

        match result {
            Ok(()) => {
                self.state = CommandBufferState::Pending;
                Ok(())
            }
            Err(err) => {
                self.state = if still_executing {
                    CommandBufferState::Pending
                } else {
                    CommandBufferState::Executable
                };
                Err(err)
            }
        }
    }

    /// Writes every command still in the log into its segment, in program order.
    fn resolve(&mut self) -> Result<(), VulkanError> {
        let log = mem::take(&mut self.primary_mut().log);
        let count = log.len();

        for entry in log {
            self.state = match entry.target {
                Target::Main => CommandBufferState::Pending,
                Target::Group(_) => CommandBufferState::Resolving,
            };

            if let Err(err) = self.materialize(entry) {
                self.state = CommandBufferState::Executable;
                self.set_error(err);

                return Err(err);
            }
        }

        self.state = CommandBufferState::Pending;
        self.primary_mut().resolved = true;

        log::debug!(
            "command buffer {:?}: wrote out {} deferred commands",
            self.id,
            count,
        );

        Ok(())
    }
}

/// Submits `segments` in order, linked by their semaphores.
///
/// The fence of each segment is reset right before the segment is submitted. If submitting a
/// segment fails, the segments before it are executing and those after it are never submitted;
/// the failed segment gets a new signaled fence so that it doesn't appear to be executing.
fn submit_chain(
    hal: &Arc<dyn Hal>,
    mut segments: SmallVec<[&mut Segment; 4]>,
    submit_info: &SubmitInfo,
) -> Result<(), VulkanError> {
    let SubmitInfo {
        wait_semaphores: user_waits,
        signal_semaphores: user_signals,
        fence: user_fence,
        _ne: _,
    } = submit_info;

    let last = segments.len() - 1;
    let mut previous: Option<RawSemaphore> = None;

    for (index, segment) in segments.iter_mut().enumerate() {
        let wait_semaphores: SmallVec<[(RawSemaphore, PipelineStages); 4]> = match previous {
            Some(semaphore) => smallvec![(semaphore, segment.wait_stages())],
            None => user_waits
                .iter()
                .map(|info| (info.semaphore.handle(), info.stages))
                .collect(),
        };

        let mut signal_fences: SmallVec<[RawFence; 2]> = smallvec![segment.fence.raw()];
        let signal_semaphores: SmallVec<[RawSemaphore; 4]> = if index == last {
            signal_fences.extend(user_fence.as_ref().map(|fence| fence.handle()));
            user_signals
                .iter()
                .map(|semaphore| semaphore.handle())
                .collect()
        } else {
            smallvec![segment.semaphore.raw()]
        };

        segment.semaphore.reset()?;
        segment.fence.reset()?;

        let result = hal.submit(&SubmitBatch {
            command_buffer: segment.command_buffer.raw(),
            wait_semaphores: &wait_semaphores,
            signal_semaphores: &signal_semaphores,
            signal_fences: &signal_fences,
        });

        if let Err(err) = result {
            log::warn!(
                "submitting segment {} of {} failed: {}",
                index,
                last + 1,
                err,
            );

            match HalFence::new(hal, true) {
                Ok(fence) => segment.fence = fence,
                Err(_) => log::warn!("the fence of the failed segment could not be replaced"),
            }

            return Err(err.into());
        }

        log::trace!(
            "submitted segment {}, waiting on {} semaphores for {:?}",
            index,
            wait_semaphores.len(),
            wait_semaphores
                .iter()
                .fold(PipelineStages::empty(), |stages, &(_, s)| stages | s),
        );

        previous = Some(segment.semaphore.raw());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::{
        command_buffer::{
            CommandBufferAllocateInfo, CommandBufferBeginInfo, CommandBufferLevel,
            CommandBufferState, CommandBufferUsage, CommandPool, CommandPoolCreateInfo,
            SubmitInfo,
        },
        sync::{DependencyFlags, Fence, FenceCreateInfo, PipelineStages},
        Validated,
    };

    #[test]
    fn submit_requires_executable_primary() {
        let (_host, _compiler, device, queue) = host_device!();
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
        secondary.end().unwrap();
        assert!(matches!(
            queue.submit(&mut secondary, SubmitInfo::default()),
            Err(Validated::ValidationError(_)),
        ));

        assert!(matches!(
            queue.submit(&mut primary, SubmitInfo::default()),
            Err(Validated::ValidationError(_)),
        ));
    }

    #[test]
    fn one_time_submit_only_once() {
        let (_host, _compiler, device, queue) = host_device!();
        let pool = CommandPool::new(device.clone(), CommandPoolCreateInfo::default()).unwrap();
        let mut cb = pool
            .allocate_command_buffers(CommandBufferAllocateInfo::default())
            .unwrap()
            .remove(0);

        cb.begin(CommandBufferBeginInfo {
            usage: CommandBufferUsage::OneTimeSubmit,
            ..Default::default()
        })
        .unwrap();
        cb.end().unwrap();

        queue.submit(&mut cb, SubmitInfo::default()).unwrap();
        queue.wait_idle().unwrap();
        assert_eq!(cb.state(), CommandBufferState::Executable);

        assert!(matches!(
            queue.submit(&mut cb, SubmitInfo::default()),
            Err(Validated::ValidationError(_)),
        ));
    }

    #[test]
    fn chain_signals_user_fence() {
        let (_host, _compiler, device, queue) = host_device!();
        let pool = CommandPool::new(device.clone(), CommandPoolCreateInfo::default()).unwrap();
        let mut cb = pool
            .allocate_command_buffers(CommandBufferAllocateInfo::default())
            .unwrap()
            .remove(0);

        cb.begin(CommandBufferBeginInfo::default()).unwrap();
        for _ in 0..3 {
            cb.pipeline_barrier(
                PipelineStages::ALL_COMMANDS,
                PipelineStages::ALL_COMMANDS,
                DependencyFlags::empty(),
            )
            .unwrap();
        }
        cb.end().unwrap();
        assert_eq!(cb.barrier_group_count(), 3);

        let fence = Fence::new(device, FenceCreateInfo::default()).unwrap();

        for _ in 0..2 {
            fence.reset().unwrap();
            queue
                .submit(
                    &mut cb,
                    SubmitInfo {
                        fence: Some(fence.clone()),
                        ..Default::default()
                    },
                )
                .unwrap();
            fence.wait(None).unwrap();
            queue.wait_idle().unwrap();
            assert_eq!(cb.state(), CommandBufferState::Executable);
        }
    }
}
