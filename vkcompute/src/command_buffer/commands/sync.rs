// Copyright (c) 2024 The vkcompute developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use crate::{
    command_buffer::{CommandBuffer, CommandInfo},
    sync::{DependencyFlags, Event, PipelineStages},
    DeviceOwned, ValidationError,
};
use smallvec::SmallVec;
use std::sync::Arc;

/// # Commands to synchronize commands with each other and with the host.
impl CommandBuffer {
    /// Makes the commands recorded after the barrier in `dst_stages` wait for the commands
    /// recorded before it in `src_stages`.
    ///
    /// In a primary command buffer, this starts a new barrier group.
    pub fn pipeline_barrier(
        &mut self,
        src_stages: PipelineStages,
        dst_stages: PipelineStages,
        dependency_flags: DependencyFlags,
    ) -> Result<&mut Self, Box<ValidationError>> {
        self.validate_pipeline_barrier(src_stages, dst_stages)?;

        self.record(CommandInfo::PipelineBarrier {
            src_stages,
            dst_stages,
            dependency_flags,
        });

        Ok(self)
    }

    fn validate_pipeline_barrier(
        &self,
        src_stages: PipelineStages,
        dst_stages: PipelineStages,
    ) -> Result<(), Box<ValidationError>> {
        self.validate_recording().map_err(|err| {
            err.set_vuids(&["VUID-vkCmdPipelineBarrier-commandBuffer-recording"])
        })?;

        if src_stages.is_empty() {
            return Err(Box::new(ValidationError {
                context: "src_stages".into(),
                problem: "is empty".into(),
                vuids: &["VUID-vkCmdPipelineBarrier-srcStageMask-03937"],
            }));
        }

        if dst_stages.is_empty() {
            return Err(Box::new(ValidationError {
                context: "dst_stages".into(),
                problem: "is empty".into(),
                vuids: &["VUID-vkCmdPipelineBarrier-dstStageMask-03937"],
            }));
        }

        Ok(())
    }

    /// Signals `event` once the commands recorded before this one in `stages` have completed.
    pub fn set_event(
        &mut self,
        event: Arc<Event>,
        stages: PipelineStages,
    ) -> Result<&mut Self, Box<ValidationError>> {
        self.validate_event_command(&event, stages, &["VUID-vkCmdSetEvent-stageMask-01149"])?;

        self.record(CommandInfo::SetEvent { event, stages });

        Ok(self)
    }

    /// Unsignals `event` once the commands recorded before this one in `stages` have completed.
    pub fn reset_event(
        &mut self,
        event: Arc<Event>,
        stages: PipelineStages,
    ) -> Result<&mut Self, Box<ValidationError>> {
        self.validate_event_command(&event, stages, &["VUID-vkCmdResetEvent-stageMask-01153"])?;

        self.record(CommandInfo::ResetEvent { event, stages });

        Ok(self)
    }

    fn validate_event_command(
        &self,
        event: &Event,
        stages: PipelineStages,
        host_stage_vuids: &'static [&'static str],
    ) -> Result<(), Box<ValidationError>> {
        self.validate_recording()?;

        if event.device().id() != self.device().id() {
            return Err(Box::new(ValidationError {
                context: "event".into(),
                problem: "does not belong to the same device as the command buffer".into(),
                vuids: &["VUID-vkCmdSetEvent-commonparent"],
            }));
        }

        if stages.is_empty() {
            return Err(Box::new(ValidationError {
                context: "stages".into(),
                problem: "is empty".into(),
                vuids: &["VUID-vkCmdSetEvent-stageMask-03937"],
            }));
        }

        if stages.intersects(PipelineStages::HOST) {
            return Err(Box::new(ValidationError {
                context: "stages".into(),
                problem: "contains `PipelineStages::HOST`".into(),
                vuids: host_stage_vuids,
            }));
        }

        Ok(())
    }

    /// Makes the commands recorded after this one in `dst_stages` wait until every event in
    /// `events` is signaled.
    ///
    /// When the command executes, only events that are unsignaled and were last set in
    /// `src_stages` (or any event, if `src_stages` contains `ALL_COMMANDS` or `HOST`) are waited
    /// for. An event that nothing will set is ignored unless it is waited for from the host
    /// stage.
    pub fn wait_events(
        &mut self,
        events: impl IntoIterator<Item = Arc<Event>>,
        src_stages: PipelineStages,
        dst_stages: PipelineStages,
    ) -> Result<&mut Self, Box<ValidationError>> {
        let events: SmallVec<_> = events.into_iter().collect();
        self.validate_wait_events(&events, src_stages, dst_stages)?;

        self.record(CommandInfo::WaitEvents {
            events,
            src_stages,
            dst_stages,
        });

        Ok(self)
    }

    fn validate_wait_events(
        &self,
        events: &[Arc<Event>],
        src_stages: PipelineStages,
        dst_stages: PipelineStages,
    ) -> Result<(), Box<ValidationError>> {
        self.validate_recording()
            .map_err(|err| err.set_vuids(&["VUID-vkCmdWaitEvents-commandBuffer-recording"]))?;

        if events.is_empty() {
            return Err(Box::new(ValidationError {
                context: "events".into(),
                problem: "is empty".into(),
                vuids: &["VUID-vkCmdWaitEvents-eventCount-arraylength"],
            }));
        }

        for (index, event) in events.iter().enumerate() {
            if event.device().id() != self.device().id() {
                return Err(Box::new(ValidationError {
                    context: format!("events[{}]", index).into(),
                    problem: "does not belong to the same device as the command buffer".into(),
                    vuids: &["VUID-vkCmdWaitEvents-commonparent"],
                }));
            }
        }

        if src_stages.is_empty() {
            return Err(Box::new(ValidationError {
                context: "src_stages".into(),
                problem: "is empty".into(),
                vuids: &["VUID-vkCmdWaitEvents-srcStageMask-03937"],
            }));
        }

        if dst_stages.is_empty() {
            return Err(Box::new(ValidationError {
                context: "dst_stages".into(),
                problem: "is empty".into(),
                vuids: &["VUID-vkCmdWaitEvents-dstStageMask-03937"],
            }));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        command_buffer::{
            barrier::Target, CommandBufferAllocateInfo, CommandBufferBeginInfo, CommandPool,
            CommandPoolCreateInfo,
        },
        sync::{DependencyFlags, Event, PipelineStages},
    };

    #[test]
    fn event_stage_validation() {
        let (_host, _compiler, device, _queue) = host_device!();
        let event = Event::new(device.clone(), Default::default()).unwrap();
        let pool = CommandPool::new(device, CommandPoolCreateInfo::default()).unwrap();
        let mut cb = pool
            .allocate_command_buffers(CommandBufferAllocateInfo::default())
            .unwrap()
            .remove(0);
        cb.begin(CommandBufferBeginInfo::default()).unwrap();

        let err = cb
            .set_event(event.clone(), PipelineStages::HOST)
            .unwrap_err();
        assert_eq!(err.vuids, ["VUID-vkCmdSetEvent-stageMask-01149"]);
        let err = cb
            .reset_event(event.clone(), PipelineStages::HOST | PipelineStages::TRANSFER)
            .unwrap_err();
        assert_eq!(err.vuids, ["VUID-vkCmdResetEvent-stageMask-01153"]);
        assert!(cb
            .set_event(event.clone(), PipelineStages::empty())
            .is_err());
        assert!(cb
            .wait_events([], PipelineStages::ALL_COMMANDS, PipelineStages::ALL_COMMANDS)
            .is_err());

        cb.set_event(event.clone(), PipelineStages::COMPUTE_SHADER)
            .unwrap()
            .wait_events(
                [event],
                PipelineStages::COMPUTE_SHADER,
                PipelineStages::TRANSFER,
            )
            .unwrap();
        cb.end().unwrap();
    }

    #[test]
    fn event_commands_follow_their_stages() {
        let (_host, _compiler, device, _queue) = host_device!();
        let event = Event::new(device.clone(), Default::default()).unwrap();
        let pool = CommandPool::new(device, CommandPoolCreateInfo::default()).unwrap();
        let mut cb = pool
            .allocate_command_buffers(CommandBufferAllocateInfo::default())
            .unwrap()
            .remove(0);
        cb.begin(CommandBufferBeginInfo::default()).unwrap();

        cb.pipeline_barrier(
            PipelineStages::TRANSFER,
            PipelineStages::TRANSFER,
            DependencyFlags::empty(),
        )
        .unwrap()
        .set_event(event.clone(), PipelineStages::COMPUTE_SHADER)
        .unwrap()
        .set_event(event.clone(), PipelineStages::TRANSFER)
        .unwrap()
        .wait_events(
            [event],
            PipelineStages::TRANSFER,
            PipelineStages::ALL_COMMANDS,
        )
        .unwrap();

        let targets: Vec<_> = cb.primary().log.iter().map(|entry| entry.target).collect();
        assert_eq!(
            targets,
            [Target::Main, Target::Group(0), Target::Group(0)],
        );
        cb.end().unwrap();
    }
}
