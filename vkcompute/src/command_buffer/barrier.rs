// Copyright (c) 2024 The vkcompute developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Segments of a primary command buffer, and the bookkeeping that decides which segment a
//! command lands in.

use super::{command_info::CommandInfo, kernel::RecordedKernel};
use crate::{
    hal::{Hal, HalCommandBuffer, HalError, HalFence, HalSemaphore},
    sync::{event::wait_for_events, Event, PipelineStages},
    VulkanObject,
};
use smallvec::SmallVec;
use std::sync::Arc;

/// A HAL command buffer with the fence and semaphore that are signaled when it finishes.
///
/// The fence is signaled whenever the segment is not executing; it is reset right before the
/// segment is submitted.
#[derive(Debug)]
pub(crate) struct Segment {
    pub(crate) command_buffer: HalCommandBuffer,
    pub(crate) fence: HalFence,
    pub(crate) semaphore: HalSemaphore,

    /// The stages of the commands written into the segment.
    pub(crate) stage_flags: PipelineStages,

    /// The stages named by the event commands written into the segment.
    pub(crate) user_wait_flags: PipelineStages,

    /// The commands written into the segment, kept only for simultaneous-use command buffers.
    pub(crate) replay: Vec<ReplayEntry>,
}

impl Segment {
    pub(crate) fn new(hal: &Arc<dyn Hal>) -> Result<Self, HalError> {
        Ok(Segment {
            command_buffer: HalCommandBuffer::new(hal)?,
            fence: HalFence::new(hal, true)?,
            semaphore: HalSemaphore::new(hal)?,
            stage_flags: PipelineStages::empty(),
            user_wait_flags: PipelineStages::empty(),
            replay: Vec::new(),
        })
    }

    /// Writes `command` into the HAL command buffer of the segment.
    ///
    /// `kernel` must be `Some` for a dispatch.
    pub(crate) fn write(
        &mut self,
        command: &CommandInfo,
        kernel: Option<&RecordedKernel>,
    ) -> Result<(), HalError> {
        let hal = self.command_buffer.hal();
        let raw = self.command_buffer.raw();

        match command {
            CommandInfo::Dispatch { .. } => {
                let kernel =
                    kernel.unwrap_or_else(|| panic!("dispatch written without its kernel"));
                kernel.enqueue(&self.command_buffer)?;
                self.stage_flags |= PipelineStages::COMPUTE_SHADER;
            }
            CommandInfo::CopyBuffer {
                src_buffer,
                dst_buffer,
                regions,
            } => {
                hal.enqueue_copy_buffer(raw, src_buffer.handle(), dst_buffer.handle(), regions)?;
                self.stage_flags |= PipelineStages::TRANSFER;
            }
            CommandInfo::UpdateBuffer {
                dst_buffer,
                dst_offset,
                data,
            } => {
                hal.enqueue_write_buffer(raw, dst_buffer.handle(), *dst_offset, data)?;
                self.stage_flags |= PipelineStages::TRANSFER;
            }
            &CommandInfo::FillBuffer {
                ref dst_buffer,
                dst_offset,
                size,
                data,
            } => {
                hal.enqueue_fill_buffer(raw, dst_buffer.handle(), dst_offset, size, data)?;
                self.stage_flags |= PipelineStages::TRANSFER;
            }
            &CommandInfo::SetEvent { ref event, stages } => {
                event.record_set_stages(stages);
                let event = event.clone();
                hal.enqueue_user_callback(raw, Arc::new(move || event.set_from_device()))?;
                self.user_wait_flags |= stages;
            }
            &CommandInfo::ResetEvent { ref event, stages } => {
                let event = event.clone();
                hal.enqueue_user_callback(raw, Arc::new(move || event.reset_from_device()))?;
                self.user_wait_flags |= stages;
            }
            &CommandInfo::WaitEvents {
                ref events,
                src_stages,
                dst_stages,
            } => {
                let relevant: SmallVec<[Arc<Event>; 4]> = events
                    .iter()
                    .filter(|event| event.is_relevant_to(src_stages))
                    .cloned()
                    .collect();

                // Events that are signaled by the time the device gets here don't block it.
                if relevant.is_empty() {
                    log::trace!("wait_events: no event can be set at the source stages");
                } else {
                    hal.enqueue_user_callback(
                        raw,
                        Arc::new(move || wait_for_events(&relevant)),
                    )?;
                }

                self.user_wait_flags |= dst_stages;
            }
            CommandInfo::BindPipeline { .. }
            | CommandInfo::BindDescriptorSets { .. }
            | CommandInfo::PushConstants { .. }
            | CommandInfo::PipelineBarrier { .. } => (),
        }

        Ok(())
    }

    /// Returns the stages that have to wait for the previous segment.
    pub(crate) fn wait_stages(&self) -> PipelineStages {
        let stages = self.stage_flags | self.user_wait_flags;

        if stages.is_empty() {
            PipelineStages::ALL_COMMANDS
        } else {
            stages
        }
    }

    /// Returns whether a submission of the segment is still executing.
    pub(crate) fn is_executing(&self) -> bool {
        !self.fence.is_signaled().unwrap_or(true)
    }

    /// Clears the segment for a new recording. Both HAL objects are reset even if resetting the
    /// first one fails; the first failure is returned.
    pub(crate) fn reset(&mut self) -> Result<(), HalError> {
        let results = [self.command_buffer.reset(), self.semaphore.reset()];
        self.stage_flags = PipelineStages::empty();
        self.user_wait_flags = PipelineStages::empty();
        self.replay.clear();

        results.into_iter().collect()
    }
}

/// A command written into a segment, as kept for replaying it into a new segment.
#[derive(Debug)]
pub(crate) struct ReplayEntry {
    pub(crate) command: CommandInfo,
    pub(crate) kernel: Option<Arc<RecordedKernel>>,
}

/// The segment created by a pipeline barrier.
#[derive(Debug)]
pub(crate) struct BarrierGroup {
    pub(crate) segment: Segment,
    pub(crate) src_stages: PipelineStages,
    pub(crate) dst_stages: PipelineStages,
}

/// Identifies a segment of a primary command buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Target {
    Main,
    Group(usize),
}

impl Target {
    /// Returns the position of the segment in the submission chain.
    #[inline]
    pub(crate) fn position(self) -> usize {
        match self {
            Target::Main => 0,
            Target::Group(index) => index + 1,
        }
    }
}

/// The segments that compute and transfer work currently land in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Targets {
    pub(crate) compute: Target,
    pub(crate) transfer: Target,
}

impl Default for Targets {
    #[inline]
    fn default() -> Self {
        Targets {
            compute: Target::Main,
            transfer: Target::Main,
        }
    }
}

impl Targets {
    /// Sends the stages of `dst_stages` to `group` from now on.
    pub(crate) fn redirect(&mut self, dst_stages: PipelineStages, group: Target) {
        let dst_stages = dst_stages.expand_second_scope();

        if dst_stages.intersects(PipelineStages::COMPUTE) {
            self.compute = group;
        }

        if dst_stages.intersects(PipelineStages::TRANSFER) {
            self.transfer = group;
        }
    }

    /// Returns the segment that a command executing in `stages` lands in.
    ///
    /// If compute and transfer work land in the same segment, that is the one. Otherwise a
    /// command in only one of the two stages goes where that stage goes, and any other command
    /// goes to whichever of the two segments comes later in the chain.
    pub(crate) fn for_stages(&self, stages: PipelineStages) -> Target {
        if self.compute == self.transfer {
            return self.compute;
        }

        let compute = stages.intersects(PipelineStages::COMPUTE);
        let transfer = stages.intersects(PipelineStages::TRANSFER);

        match (compute, transfer) {
            (true, false) => self.compute,
            (false, true) => self.transfer,
            _ => self.latest(),
        }
    }

    fn latest(&self) -> Target {
        if self.compute.position() >= self.transfer.position() {
            self.compute
        } else {
            self.transfer
        }
    }
}

/// A command waiting in the log of a primary command buffer, with the segment it will be written
/// into.
#[derive(Debug)]
pub(crate) struct LoggedCommand {
    pub(crate) command: CommandInfo,
    pub(crate) target: Target,
}

/// Removes the commands up to and including the last one that executes in a stage of
/// `src_stages` from `log`, in order.
///
/// Earlier commands go with it even if they execute in other stages, so that every segment
/// receives its commands in program order.
pub(crate) fn drain_source_scope(
    log: &mut Vec<LoggedCommand>,
    src_stages: PipelineStages,
) -> Vec<LoggedCommand> {
    let src_stages = src_stages.expand_first_scope();
    let end = log
        .iter()
        .rposition(|entry| {
            entry
                .command
                .stages()
                .expand_first_scope()
                .intersects(src_stages)
        })
        .map_or(0, |index| index + 1);

    log.drain(..end).collect()
}

#[cfg(test)]
mod tests {
    use super::{drain_source_scope, LoggedCommand, Segment, Target, Targets};
    use crate::{
        command_buffer::command_info::CommandInfo,
        sync::{DependencyFlags, PipelineStages},
    };

    fn dispatch(target: Target) -> LoggedCommand {
        LoggedCommand {
            command: CommandInfo::Dispatch {
                group_counts: [1, 1, 1],
            },
            target,
        }
    }

    #[test]
    fn no_barrier_targets_main() {
        let targets = Targets::default();

        for stages in [
            PipelineStages::COMPUTE_SHADER,
            PipelineStages::TRANSFER,
            PipelineStages::ALL_COMMANDS,
        ] {
            assert_eq!(targets.for_stages(stages), Target::Main);
        }
    }

    #[test]
    fn one_group_owning_both_stages() {
        let mut targets = Targets::default();
        targets.redirect(PipelineStages::ALL_COMMANDS, Target::Group(0));

        assert_eq!(targets.for_stages(PipelineStages::TRANSFER), Target::Group(0));
        assert_eq!(targets.for_stages(PipelineStages::HOST), Target::Group(0));
    }

    #[test]
    fn multi_stage_requests_pick_the_later_group() {
        let mut targets = Targets::default();
        targets.redirect(PipelineStages::TRANSFER, Target::Group(0));
        targets.redirect(PipelineStages::COMPUTE_SHADER, Target::Group(1));

        assert_eq!(
            targets.for_stages(PipelineStages::COMPUTE_SHADER),
            Target::Group(1),
        );
        assert_eq!(targets.for_stages(PipelineStages::TRANSFER), Target::Group(0));
        assert_eq!(
            targets.for_stages(PipelineStages::ALL_COMMANDS.expand_first_scope()),
            Target::Group(1),
        );

        // Transfer redirected past compute.
        targets.redirect(PipelineStages::TRANSFER, Target::Group(2));
        assert_eq!(
            targets.for_stages(PipelineStages::COMPUTE_SHADER | PipelineStages::TRANSFER),
            Target::Group(2),
        );

        // Only compute went to a group: the main segment comes first.
        let mut targets = Targets::default();
        targets.redirect(PipelineStages::COMPUTE_SHADER, Target::Group(0));
        assert_eq!(targets.for_stages(PipelineStages::HOST), Target::Group(0));
    }

    #[test]
    fn drain_takes_everything_up_to_the_last_match() {
        let barrier = |target| LoggedCommand {
            command: CommandInfo::PipelineBarrier {
                src_stages: PipelineStages::TRANSFER,
                dst_stages: PipelineStages::TRANSFER,
                dependency_flags: DependencyFlags::empty(),
            },
            target,
        };
        let mut log = vec![
            barrier(Target::Main),
            dispatch(Target::Main),
            barrier(Target::Group(0)),
        ];

        let drained = drain_source_scope(&mut log, PipelineStages::COMPUTE_SHADER);
        assert_eq!(
            drained
                .iter()
                .map(|entry| (entry.command.name(), entry.target))
                .collect::<Vec<_>>(),
            [
                ("pipeline_barrier", Target::Main),
                ("dispatch", Target::Main),
            ],
        );
        assert_eq!(log.len(), 1);

        let drained = drain_source_scope(&mut log, PipelineStages::TOP_OF_PIPE);
        assert!(drained.is_empty());
        assert_eq!(log.len(), 1);

        log.push(dispatch(Target::Group(0)));
        assert!(drain_source_scope(&mut log, PipelineStages::TRANSFER).is_empty());
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn segment_wait_stages() {
        let (_host, _compiler, device, _queue) = host_device!();
        let mut segment = Segment::new(device.hal()).unwrap();
        assert_eq!(segment.wait_stages(), PipelineStages::ALL_COMMANDS);

        segment.user_wait_flags = PipelineStages::TRANSFER;
        assert_eq!(segment.wait_stages(), PipelineStages::TRANSFER);

        segment.reset().unwrap();
        assert_eq!(segment.wait_stages(), PipelineStages::ALL_COMMANDS);
        assert!(!segment.is_executing());
    }
}
