// Copyright (c) 2024 The vkcompute developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Recording compute commands and submitting them to the HAL.
//!
//! A [`CommandBuffer`] is allocated from a [`CommandPool`], recorded between
//! [`begin`](CommandBuffer::begin) and [`end`](CommandBuffer::end), and then submitted to a
//! [`Queue`](crate::device::Queue).
//!
//! # Barrier groups
//!
//! The HAL has no notion of a pipeline barrier. A primary command buffer is therefore split into
//! *segments*: the main segment, plus one *barrier group* per
//! [`pipeline_barrier`](CommandBuffer::pipeline_barrier) call. Each segment is a separate HAL
//! command buffer, and at submission the segments are chained with semaphores so that each one
//! starts only once the previous one has finished.
//!
//! Commands are not written into a segment right away. They are kept in a log, and a pipeline
//! barrier moves every logged command whose stages are in the barrier's source scope into its
//! segment. Whatever is still in the log when the command buffer is first submitted is written
//! out then, in program order. Compute and transfer work is sent to the newest barrier group
//! whose destination scope covered that stage, so that work recorded after a barrier can't start
//! before the work the barrier waits for.
//!
//! # Secondary command buffers
//!
//! Secondary command buffers own no HAL objects. They only keep the list of [`CommandInfo`]s
//! recorded into them, which [`execute_commands`](CommandBuffer::execute_commands) replays into a
//! primary command buffer as if it had recorded them itself.
//!
//! # Errors
//!
//! Recording methods return a [`ValidationError`](crate::ValidationError) when they are misused.
//! Runtime failures that happen while recording, such as running out of memory while
//! specializing a kernel, don't fail the call. The first of them is kept, and returned by `end`
//! and by every later submission.

pub use self::{
    command_info::CommandInfo,
    pool::{
        CommandBufferAllocateInfo, CommandPool, CommandPoolCreateFlags, CommandPoolCreateInfo,
    },
    sys::CommandBuffer,
};
pub use crate::hal::BufferCopy;
use crate::{
    device::Device,
    macros::vulkan_bitflags,
    sync::{Fence, PipelineStages, Semaphore},
    DeviceOwned, ValidationError,
};
use std::sync::Arc;

mod barrier;
mod command_info;
mod commands;
mod kernel;
mod pool;
mod submit;
mod sys;

/// The level of a command buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(i32)]
pub enum CommandBufferLevel {
    /// Can be submitted to a queue.
    Primary = ash::vk::CommandBufferLevel::PRIMARY.as_raw(),

    /// Can only be executed from a primary command buffer.
    Secondary = ash::vk::CommandBufferLevel::SECONDARY.as_raw(),
}

impl Default for CommandBufferLevel {
    #[inline]
    fn default() -> Self {
        CommandBufferLevel::Primary
    }
}

impl From<CommandBufferLevel> for ash::vk::CommandBufferLevel {
    #[inline]
    fn from(val: CommandBufferLevel) -> Self {
        Self::from_raw(val as i32)
    }
}

/// Usage flags to pass when beginning a command buffer.
// NOTE: The ordering is important: the variants are listed from least to most permissive!
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u32)]
pub enum CommandBufferUsage {
    /// The command buffer can only be submitted once per recording.
    OneTimeSubmit = ash::vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT.as_raw(),

    /// The command buffer can be submitted multiple times, but a submission must have finished
    /// executing before the next one is made.
    MultipleSubmit = 0,

    /// The command buffer can be submitted again while earlier submissions are still executing.
    /// Every segment keeps the commands it received, so that a fresh chain of HAL command
    /// buffers can be built for each overlapping submission.
    SimultaneousUse = ash::vk::CommandBufferUsageFlags::SIMULTANEOUS_USE.as_raw(),
}

impl From<CommandBufferUsage> for ash::vk::CommandBufferUsageFlags {
    #[inline]
    fn from(val: CommandBufferUsage) -> Self {
        Self::from_raw(val as u32)
    }
}

/// Parameters to begin recording a command buffer.
#[derive(Clone, Debug)]
pub struct CommandBufferBeginInfo {
    /// How the command buffer will be used.
    ///
    /// The default value is [`CommandBufferUsage::MultipleSubmit`].
    pub usage: CommandBufferUsage,

    pub _ne: crate::NonExhaustive,
}

impl Default for CommandBufferBeginInfo {
    #[inline]
    fn default() -> Self {
        Self {
            usage: CommandBufferUsage::MultipleSubmit,
            _ne: crate::NonExhaustive(()),
        }
    }
}

/// The lifecycle state of a command buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommandBufferState {
    /// Freshly allocated or reset.
    Initial,

    /// Between `begin` and `end`.
    Recording,

    /// Recorded, and not currently executing.
    Executable,

    /// Submitted, and at least one segment has not finished executing yet.
    Pending,

    /// Commands that land in a barrier group are being written out during a submission.
    Resolving,
}

vulkan_bitflags! {
    /// Flags controlling what a command buffer reset releases.
    CommandBufferResetFlags = CommandBufferResetFlags(u32);

    /// Also release the descriptor set bindings and the cached buffer-size arrays.
    RELEASE_RESOURCES = RELEASE_RESOURCES,
}

/// Parameters of a [`Queue::submit`](crate::device::Queue::submit) call.
#[derive(Clone, Debug)]
pub struct SubmitInfo {
    /// The semaphores to wait for before the command buffer starts executing.
    ///
    /// The default value is empty.
    pub wait_semaphores: Vec<SemaphoreSubmitInfo>,

    /// The semaphores to signal once the command buffer has finished executing.
    ///
    /// The default value is empty.
    pub signal_semaphores: Vec<Arc<Semaphore>>,

    /// The fence to signal once the command buffer has finished executing.
    ///
    /// The default value is `None`.
    pub fence: Option<Arc<Fence>>,

    pub _ne: crate::NonExhaustive,
}

impl Default for SubmitInfo {
    #[inline]
    fn default() -> Self {
        Self {
            wait_semaphores: Vec::new(),
            signal_semaphores: Vec::new(),
            fence: None,
            _ne: crate::NonExhaustive(()),
        }
    }
}

impl SubmitInfo {
    pub(crate) fn validate(&self, device: &Device) -> Result<(), Box<ValidationError>> {
        let Self {
            wait_semaphores,
            signal_semaphores,
            fence,
            _ne: _,
        } = self;

        for (index, semaphore_submit_info) in wait_semaphores.iter().enumerate() {
            semaphore_submit_info
                .validate(device)
                .map_err(|err| err.add_context(format!("wait_semaphores[{}]", index)))?;
        }

        for (index, semaphore) in signal_semaphores.iter().enumerate() {
            if semaphore.device().id() != device.id() {
                return Err(Box::new(ValidationError {
                    context: format!("signal_semaphores[{}]", index).into(),
                    problem: "was not created from the same device as the queue".into(),
                    vuids: &["VUID-vkQueueSubmit-commonparent"],
                }));
            }
        }

        if let Some(fence) = fence {
            if fence.device().id() != device.id() {
                return Err(Box::new(ValidationError {
                    context: "fence".into(),
                    problem: "was not created from the same device as the queue".into(),
                    vuids: &["VUID-vkQueueSubmit-commonparent"],
                }));
            }
        }

        Ok(())
    }
}

/// A semaphore to wait for in a submission, and the stages that have to wait.
#[derive(Clone, Debug)]
pub struct SemaphoreSubmitInfo {
    /// The semaphore to wait for.
    ///
    /// There is no default value.
    pub semaphore: Arc<Semaphore>,

    /// The stages of the command buffer that wait for the semaphore.
    ///
    /// The default value is [`PipelineStages::ALL_COMMANDS`].
    pub stages: PipelineStages,

    pub _ne: crate::NonExhaustive,
}

impl SemaphoreSubmitInfo {
    /// Returns a `SemaphoreSubmitInfo` with the specified `semaphore`.
    #[inline]
    pub fn new(semaphore: Arc<Semaphore>) -> Self {
        Self {
            semaphore,
            stages: PipelineStages::ALL_COMMANDS,
            _ne: crate::NonExhaustive(()),
        }
    }

    pub(crate) fn validate(&self, device: &Device) -> Result<(), Box<ValidationError>> {
        if self.semaphore.device().id() != device.id() {
            return Err(Box::new(ValidationError {
                context: "semaphore".into(),
                problem: "was not created from the same device as the queue".into(),
                vuids: &["VUID-vkQueueSubmit-commonparent"],
            }));
        }

        if self.stages.intersects(PipelineStages::HOST) {
            return Err(Box::new(ValidationError {
                context: "stages".into(),
                problem: "contains `PipelineStages::HOST`".into(),
                vuids: &["VUID-VkSubmitInfo-pWaitDstStageMask-00078"],
            }));
        }

        Ok(())
    }
}
