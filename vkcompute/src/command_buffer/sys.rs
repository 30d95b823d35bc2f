// Copyright (c) 2024 The vkcompute developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use super::{
    barrier::{
        drain_source_scope, BarrierGroup, LoggedCommand, ReplayEntry, Segment, Target, Targets,
    },
    command_info::CommandInfo,
    kernel::{BoundDescriptorSet, RecordedKernel, SizeBufferCache},
    pool::{CommandPool, CommandPoolCreateFlags},
    CommandBufferBeginInfo, CommandBufferLevel, CommandBufferResetFlags, CommandBufferState,
    CommandBufferUsage,
};
use crate::{
    device::Device,
    hal::{Hal, HalError},
    macros::impl_id_counter,
    pipeline::ComputePipeline,
    sync::{DependencyFlags, PipelineStages},
    DeviceOwned, Validated, ValidationError, VulkanError,
};
use std::{
    collections::VecDeque,
    iter, mem,
    num::NonZeroU64,
    sync::Arc,
};

/// A command buffer, allocated from a [`CommandPool`].
///
/// Recording methods return `&mut Self` so that calls can be chained:
///
/// ```
/// # use std::sync::Arc;
/// # use vkcompute::{
/// #     command_buffer::{CommandBufferAllocateInfo, CommandBufferBeginInfo, CommandPool,
/// #         CommandPoolCreateInfo},
/// #     device::{Device, DeviceCreateInfo},
/// #     hal::host::{HostCompiler, HostHal, HostHalCreateInfo},
/// #     sync::{DependencyFlags, PipelineStages},
/// # };
/// # let hal = Arc::new(HostHal::new(HostHalCreateInfo::default()));
/// # let (device, queue) =
/// #     Device::new(hal, Arc::new(HostCompiler::new()), DeviceCreateInfo::default()).unwrap();
/// let pool = CommandPool::new(device, CommandPoolCreateInfo::default()).unwrap();
/// let mut command_buffer = pool
///     .allocate_command_buffers(CommandBufferAllocateInfo::default())
///     .unwrap()
///     .pop()
///     .unwrap();
///
/// command_buffer.begin(CommandBufferBeginInfo::default()).unwrap();
/// command_buffer
///     .pipeline_barrier(
///         PipelineStages::COMPUTE_SHADER,
///         PipelineStages::TRANSFER,
///         DependencyFlags::empty(),
///     )
///     .unwrap();
/// command_buffer.end().unwrap();
///
/// assert_eq!(command_buffer.barrier_group_count(), 1);
/// ```
#[derive(Debug)]
pub struct CommandBuffer {
    pub(super) pool: Arc<CommandPool>,
    pub(super) id: NonZeroU64,
    pub(super) level: CommandBufferLevel,
    pub(super) state: CommandBufferState,
    pub(super) usage: CommandBufferUsage,
    pub(super) error: Option<VulkanError>,
    pub(super) bindings: Bindings,
    pub(super) inner: LevelState,
}

/// The state that commands set for the commands recorded after them.
#[derive(Debug)]
pub(super) struct Bindings {
    pub(super) pipeline: Option<Arc<ComputePipeline>>,

    /// Indexed by set number. Grows as sets are bound, and never shrinks.
    pub(super) descriptor_sets: Vec<Option<BoundDescriptorSet>>,

    /// As large as the push constant limit of the device.
    pub(super) push_constants: Vec<u8>,
}

#[derive(Debug)]
pub(super) enum LevelState {
    Primary(Box<PrimaryState>),
    Secondary(Vec<CommandInfo>),
}

#[derive(Debug)]
pub(super) struct PrimaryState {
    pub(super) main: Segment,
    pub(super) barrier_groups: Vec<BarrierGroup>,
    pub(super) targets: Targets,

    /// Commands that have not been written into their segment yet, in program order.
    pub(super) log: Vec<LoggedCommand>,

    /// Kernels of dispatches that are in `log`, in program order.
    pub(super) specialized_kernels: VecDeque<Arc<RecordedKernel>>,

    /// Kernels of dispatches that were written into their segment.
    pub(super) dispatched_kernels: Vec<Arc<RecordedKernel>>,

    pub(super) size_buffers: SizeBufferCache,

    /// Whether `log` has been written out by a submission since the last `begin`.
    pub(super) resolved: bool,

    /// The number of submissions since the last `begin`.
    pub(super) submit_count: u32,

    /// Segment chains built for submissions that overlapped an earlier one.
    pub(super) transient_chains: Vec<Vec<Segment>>,
}

/// How the commands of a command buffer are currently processed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum ExecutionContext {
    /// Commands are kept as they are, to be replayed into a primary command buffer.
    Secondary,

    /// Commands of a primary command buffer are logged together with the segment they will be
    /// written into.
    Recording,

    /// The log of a primary command buffer is being written into the segments.
    Submitting,
}

impl CommandBuffer {
    pub(super) fn new(
        pool: Arc<CommandPool>,
        level: CommandBufferLevel,
    ) -> Result<CommandBuffer, VulkanError> {
        let device = pool.device().clone();
        let inner = match level {
            CommandBufferLevel::Primary => {
                LevelState::Primary(Box::new(PrimaryState::new(device.hal())?))
            }
            CommandBufferLevel::Secondary => LevelState::Secondary(Vec::new()),
        };

        Ok(CommandBuffer {
            pool,
            id: Self::next_id(),
            level,
            state: CommandBufferState::Initial,
            usage: CommandBufferUsage::MultipleSubmit,
            error: None,
            bindings: Bindings::new(&device),
            inner,
        })
    }

    /// Returns the pool that the command buffer was allocated from.
    #[inline]
    pub fn pool(&self) -> &Arc<CommandPool> {
        &self.pool
    }

    #[inline]
    pub fn level(&self) -> CommandBufferLevel {
        self.level
    }

    /// Returns the usage that the command buffer was last begun with.
    #[inline]
    pub fn usage(&self) -> CommandBufferUsage {
        self.usage
    }

    /// Returns the current state of the command buffer.
    ///
    /// A submitted command buffer reports [`CommandBufferState::Pending`] until every segment of
    /// every submission has finished executing, and [`CommandBufferState::Executable`] after.
    pub fn state(&self) -> CommandBufferState {
        match (&self.inner, self.state) {
            (LevelState::Primary(primary), CommandBufferState::Pending)
                if !primary.is_executing() =>
            {
                CommandBufferState::Executable
            }
            (_, state) => state,
        }
    }

    /// Returns the first error that happened while recording, if any.
    #[inline]
    pub fn error(&self) -> Option<VulkanError> {
        self.error
    }

    /// Returns the commands recorded into a secondary command buffer. Always empty for a primary
    /// command buffer.
    pub fn commands(&self) -> &[CommandInfo] {
        match &self.inner {
            LevelState::Primary(_) => &[],
            LevelState::Secondary(commands) => commands,
        }
    }

    /// Returns the number of barrier groups that pipeline barriers have split the command buffer
    /// into. Always zero for a secondary command buffer.
    pub fn barrier_group_count(&self) -> usize {
        match &self.inner {
            LevelState::Primary(primary) => primary.barrier_groups.len(),
            LevelState::Secondary(_) => 0,
        }
    }

    /// Begins recording.
    ///
    /// A command buffer that was already recorded is reset first. This is only allowed if the
    /// pool was created with [`CommandPoolCreateFlags::RESET_COMMAND_BUFFER`], and only once the
    /// command buffer has finished executing.
    pub fn begin(
        &mut self,
        begin_info: CommandBufferBeginInfo,
    ) -> Result<(), Validated<VulkanError>> {
        self.retire();
        self.validate_begin()?;

        if self.state != CommandBufferState::Initial {
            self.reset_unchecked(CommandBufferResetFlags::empty())?;
        }

        let CommandBufferBeginInfo { usage, _ne: _ } = begin_info;
        self.usage = usage;
        self.state = CommandBufferState::Recording;

        log::debug!(
            "command buffer {:?}: begin recording with {:?}",
            self.id,
            usage,
        );

        Ok(())
    }

    fn validate_begin(&self) -> Result<(), Box<ValidationError>> {
        match self.state {
            CommandBufferState::Initial => Ok(()),
            CommandBufferState::Recording => Err(Box::new(ValidationError {
                problem: "the command buffer is already in the recording state".into(),
                vuids: &["VUID-vkBeginCommandBuffer-commandBuffer-00049"],
                ..Default::default()
            })),
            CommandBufferState::Pending | CommandBufferState::Resolving => {
                Err(Box::new(ValidationError {
                    problem: "the command buffer is still executing".into(),
                    vuids: &["VUID-vkBeginCommandBuffer-commandBuffer-00049"],
                    ..Default::default()
                }))
            }
            CommandBufferState::Executable => {
                if !self
                    .pool
                    .flags()
                    .intersects(CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
                {
                    return Err(Box::new(ValidationError {
                        problem: "the command buffer is not in the initial state, and its pool \
                            was not created with `CommandPoolCreateFlags::RESET_COMMAND_BUFFER`"
                            .into(),
                        vuids: &["VUID-vkBeginCommandBuffer-commandBuffer-00050"],
                        ..Default::default()
                    }));
                }

                Ok(())
            }
        }
    }

    /// Ends recording.
    ///
    /// If an error happened while recording, the command buffer still becomes executable, and the
    /// first such error is returned.
    pub fn end(&mut self) -> Result<(), Validated<VulkanError>> {
        if self.state != CommandBufferState::Recording {
            return Err(Box::new(ValidationError {
                problem: "the command buffer is not in the recording state".into(),
                vuids: &["VUID-vkEndCommandBuffer-commandBuffer-00059"],
                ..Default::default()
            })
            .into());
        }

        self.state = CommandBufferState::Executable;

        match &self.inner {
            LevelState::Primary(primary) => log::debug!(
                "command buffer {:?}: end recording, {} barrier groups, {} deferred commands",
                self.id,
                primary.barrier_groups.len(),
                primary.log.len(),
            ),
            LevelState::Secondary(commands) => log::debug!(
                "command buffer {:?}: end recording, {} commands",
                self.id,
                commands.len(),
            ),
        }

        match self.error {
            Some(err) => Err(Validated::Error(err)),
            None => Ok(()),
        }
    }

    /// Resets the command buffer to the initial state.
    ///
    /// Every barrier group and every recorded kernel is released. The descriptor set bindings and
    /// the cached buffer-size arrays are kept, unless `flags` contains
    /// [`CommandBufferResetFlags::RELEASE_RESOURCES`].
    pub fn reset(&mut self, flags: CommandBufferResetFlags) -> Result<(), Validated<VulkanError>> {
        self.retire();
        self.validate_reset()?;

        Ok(self.reset_unchecked(flags)?)
    }

    fn validate_reset(&self) -> Result<(), Box<ValidationError>> {
        if !self
            .pool
            .flags()
            .intersects(CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
        {
            return Err(Box::new(ValidationError {
                problem: "the pool of the command buffer was not created with \
                    `CommandPoolCreateFlags::RESET_COMMAND_BUFFER`"
                    .into(),
                vuids: &["VUID-vkResetCommandBuffer-commandBuffer-00046"],
                ..Default::default()
            }));
        }

        if matches!(
            self.state,
            CommandBufferState::Pending | CommandBufferState::Resolving
        ) {
            return Err(Box::new(ValidationError {
                problem: "the command buffer is still executing".into(),
                vuids: &["VUID-vkResetCommandBuffer-commandBuffer-00045"],
                ..Default::default()
            }));
        }

        Ok(())
    }

    fn reset_unchecked(&mut self, flags: CommandBufferResetFlags) -> Result<(), VulkanError> {
        let release_resources = flags.intersects(CommandBufferResetFlags::RELEASE_RESOURCES);

        let result = match &mut self.inner {
            LevelState::Primary(primary) => primary.reset(release_resources),
            LevelState::Secondary(commands) => {
                commands.clear();
                Ok(())
            }
        };

        self.bindings.reset(release_resources);
        self.state = CommandBufferState::Initial;
        self.error = None;

        log::debug!("command buffer {:?}: reset ({:?})", self.id, flags);

        result.map_err(VulkanError::from)
    }

    /// Moves a command buffer whose submissions have all finished back to the executable state,
    /// and releases the segment chains of finished overlapping submissions.
    pub(super) fn retire(&mut self) {
        if let LevelState::Primary(primary) = &mut self.inner {
            primary
                .transient_chains
                .retain(|chain| chain.iter().any(Segment::is_executing));

            if self.state == CommandBufferState::Pending && !primary.is_executing() {
                self.state = CommandBufferState::Executable;
            }
        }
    }

    pub(super) fn execution_context(&self) -> ExecutionContext {
        match (&self.inner, self.state) {
            (LevelState::Secondary(_), _) => ExecutionContext::Secondary,
            (
                LevelState::Primary(_),
                CommandBufferState::Pending | CommandBufferState::Resolving,
            ) => ExecutionContext::Submitting,
            (LevelState::Primary(_), _) => ExecutionContext::Recording,
        }
    }

    pub(super) fn validate_recording(&self) -> Result<(), Box<ValidationError>> {
        if self.state != CommandBufferState::Recording {
            return Err(Box::new(ValidationError {
                problem: "the command buffer is not in the recording state".into(),
                ..Default::default()
            }));
        }

        Ok(())
    }

    /// Records the first error of the command buffer. Later errors are dropped.
    pub(super) fn set_error(&mut self, err: VulkanError) {
        if self.error.is_none() {
            log::warn!("command buffer {:?}: recording failed: {}", self.id, err);
            self.error = Some(err);
        } else {
            log::debug!("command buffer {:?}: ignoring later error: {}", self.id, err);
        }
    }

    /// Fails the command buffer for a command that the HAL has no equivalent of.
    pub(super) fn record_unsupported(&mut self, command: &'static str) {
        log::warn!("command buffer {:?}: `{}` is not supported", self.id, command);
        self.set_error(VulkanError::FeatureNotPresent);
    }

    /// Records `command`, which must have been validated.
    pub(super) fn record(&mut self, command: CommandInfo) {
        self.bindings.apply(&command);

        match self.execution_context() {
            ExecutionContext::Secondary => {
                if let LevelState::Secondary(commands) = &mut self.inner {
                    commands.push(command);
                }
            }
            ExecutionContext::Recording => self.record_primary(command),
            ExecutionContext::Submitting => {
                panic!("`{}` recorded while the command buffer is submitting", command.name())
            }
        }
    }

    fn record_primary(&mut self, command: CommandInfo) {
        match command {
            CommandInfo::BindPipeline { .. }
            | CommandInfo::BindDescriptorSets { .. }
            | CommandInfo::PushConstants { .. } => (),
            CommandInfo::Dispatch { group_counts } => self.record_dispatch(command, group_counts),
            CommandInfo::PipelineBarrier {
                src_stages,
                dst_stages,
                dependency_flags,
            } => self.record_barrier(src_stages, dst_stages, dependency_flags),
            CommandInfo::CopyBuffer { .. }
            | CommandInfo::UpdateBuffer { .. }
            | CommandInfo::FillBuffer { .. } => {
                let primary = self.primary_mut();
                let target = primary.targets.transfer;
                primary.log.push(LoggedCommand { command, target });
            }
            CommandInfo::SetEvent { stages, .. } | CommandInfo::ResetEvent { stages, .. } => {
                let primary = self.primary_mut();
                let target = primary.targets.for_stages(stages.expand_first_scope());
                primary.log.push(LoggedCommand { command, target });
            }
            CommandInfo::WaitEvents { dst_stages, .. } => {
                let primary = self.primary_mut();
                let target = primary.targets.for_stages(dst_stages.expand_second_scope());
                primary.log.push(LoggedCommand { command, target });
            }
        }
    }

    fn record_dispatch(&mut self, command: CommandInfo, group_counts: [u32; 3]) {
        let device = self.pool.device().clone();
        let Self {
            bindings, inner, ..
        } = self;
        let primary = match inner {
            LevelState::Primary(primary) => primary,
            LevelState::Secondary(_) => unreachable!(),
        };
        let pipeline = bindings
            .pipeline
            .as_ref()
            .unwrap_or_else(|| panic!("dispatch recorded without a bound pipeline"));

        let result = RecordedKernel::assemble(
            &device,
            pipeline,
            &bindings.descriptor_sets,
            &bindings.push_constants,
            group_counts,
            &mut primary.size_buffers,
        );

        match result {
            Ok(kernel) => {
                log::trace!(
                    "dispatch {:?}: {:?}, {} arguments, specialized: {}",
                    group_counts,
                    kernel.ndrange(),
                    kernel.args().len(),
                    kernel.is_specialized(),
                );

                primary.specialized_kernels.push_back(Arc::new(kernel));
                let target = primary.targets.compute;
                primary.log.push(LoggedCommand { command, target });
            }
            Err(err) => self.set_error(err),
        }
    }

    fn record_barrier(
        &mut self,
        src_stages: PipelineStages,
        dst_stages: PipelineStages,
        dependency_flags: DependencyFlags,
    ) {
        let segment = match Segment::new(self.pool.device().hal()) {
            Ok(segment) => segment,
            Err(err) => {
                log::debug!("creating a barrier group failed: {}", err);
                self.set_error(VulkanError::OutOfHostMemory);
                return;
            }
        };

        let keep_replay = self.usage == CommandBufferUsage::SimultaneousUse;
        let id = self.id;
        let primary = self.primary_mut();
        let target = Target::Group(primary.barrier_groups.len());
        let mut group = BarrierGroup {
            segment,
            src_stages,
            dst_stages,
        };

        if keep_replay {
            group.segment.replay.push(ReplayEntry {
                command: CommandInfo::PipelineBarrier {
                    src_stages,
                    dst_stages,
                    dependency_flags,
                },
                kernel: None,
            });
        }

        primary.barrier_groups.push(group);
        primary.targets.redirect(dst_stages, target);
        let drained = drain_source_scope(&mut primary.log, src_stages);

        log::debug!(
            "command buffer {:?}: pipeline barrier {:?} -> {:?} created {:?}, writing out {} \
            commands",
            id,
            src_stages,
            dst_stages,
            target,
            drained.len(),
        );

        for entry in drained {
            if let Err(err) = self.materialize(entry) {
                self.set_error(err);
                break;
            }
        }
    }

    /// Writes a logged command into its segment.
    pub(super) fn materialize(&mut self, entry: LoggedCommand) -> Result<(), VulkanError> {
        let keep_replay = self.usage == CommandBufferUsage::SimultaneousUse;
        let primary = self.primary_mut();
        let LoggedCommand { command, target } = entry;

        let kernel = match command {
            CommandInfo::Dispatch { .. } => Some(
                primary
                    .specialized_kernels
                    .pop_front()
                    .unwrap_or_else(|| panic!("no recorded kernel left for a dispatch")),
            ),
            _ => None,
        };

        let segment = primary.segment_mut(target);
        segment.write(&command, kernel.as_deref())?;
        log::trace!("wrote {} into {:?}", command.name(), target);

        if keep_replay {
            segment.replay.push(ReplayEntry {
                command,
                kernel: kernel.clone(),
            });
        }

        if let Some(kernel) = kernel {
            primary.dispatched_kernels.push(kernel);
        }

        Ok(())
    }

    pub(super) fn primary(&self) -> &PrimaryState {
        match &self.inner {
            LevelState::Primary(primary) => primary,
            LevelState::Secondary(_) => panic!("secondary command buffers have no segments"),
        }
    }

    pub(super) fn primary_mut(&mut self) -> &mut PrimaryState {
        match &mut self.inner {
            LevelState::Primary(primary) => primary,
            LevelState::Secondary(_) => panic!("secondary command buffers have no segments"),
        }
    }
}

unsafe impl DeviceOwned for CommandBuffer {
    #[inline]
    fn device(&self) -> &Arc<Device> {
        self.pool.device()
    }
}

impl_id_counter!(CommandBuffer);

impl Bindings {
    fn new(device: &Device) -> Self {
        Bindings {
            pipeline: None,
            descriptor_sets: Vec::new(),
            push_constants: vec![0; device.properties().max_push_constants_size as usize],
        }
    }

    fn apply(&mut self, command: &CommandInfo) {
        match command {
            CommandInfo::BindPipeline { pipeline } => self.pipeline = Some(pipeline.clone()),
            CommandInfo::BindDescriptorSets {
                first_set,
                descriptor_sets,
                dynamic_offsets,
                ..
            } => {
                let mut dynamic_offsets = dynamic_offsets.iter().copied();

                for (set_num, descriptor_set) in (*first_set as usize..).zip(descriptor_sets) {
                    if self.descriptor_sets.len() <= set_num {
                        self.descriptor_sets.resize(set_num + 1, None);
                    }

                    let dynamic_count = descriptor_set.layout().dynamic_descriptor_count();
                    self.descriptor_sets[set_num] = Some(BoundDescriptorSet {
                        descriptor_set: descriptor_set.clone(),
                        dynamic_offsets: dynamic_offsets
                            .by_ref()
                            .take(dynamic_count as usize)
                            .collect(),
                    });
                }
            }
            CommandInfo::PushConstants { offset, data, .. } => {
                let offset = *offset as usize;
                self.push_constants[offset..offset + data.len()].copy_from_slice(data);
            }
            _ => (),
        }
    }

    fn reset(&mut self, release_resources: bool) {
        self.pipeline = None;
        self.push_constants.fill(0);

        if release_resources {
            self.descriptor_sets = Vec::new();
        }
    }
}

impl PrimaryState {
    fn new(hal: &Arc<dyn Hal>) -> Result<Self, HalError> {
        Ok(PrimaryState {
            main: Segment::new(hal)?,
            barrier_groups: Vec::new(),
            targets: Targets::default(),
            log: Vec::new(),
            specialized_kernels: VecDeque::new(),
            dispatched_kernels: Vec::new(),
            size_buffers: SizeBufferCache::default(),
            resolved: false,
            submit_count: 0,
            transient_chains: Vec::new(),
        })
    }

    /// Returns the segment that `target` identifies.
    ///
    /// # Panics
    ///
    /// - Panics if `target` is a barrier group that doesn't exist.
    pub(super) fn segment_mut(&mut self, target: Target) -> &mut Segment {
        match target {
            Target::Main => &mut self.main,
            Target::Group(index) => {
                let group_count = self.barrier_groups.len();

                &mut self
                    .barrier_groups
                    .get_mut(index)
                    .unwrap_or_else(|| {
                        panic!(
                            "barrier group {} does not exist, there are {}",
                            index, group_count,
                        )
                    })
                    .segment
            }
        }
    }

    /// Returns the segments in submission order.
    pub(super) fn segments(&self) -> impl Iterator<Item = &Segment> {
        iter::once(&self.main).chain(self.barrier_groups.iter().map(|group| &group.segment))
    }

    /// Returns whether any submission is still executing.
    pub(super) fn is_executing(&self) -> bool {
        self.segments().any(Segment::is_executing)
            || self.transient_chains.iter().flatten().any(Segment::is_executing)
    }

    fn reset(&mut self, release_resources: bool) -> Result<(), HalError> {
        let result = self.main.reset();

        self.barrier_groups.clear();
        self.targets = Targets::default();
        self.log.clear();
        self.specialized_kernels.clear();
        self.dispatched_kernels.clear();
        self.transient_chains.clear();
        self.resolved = false;
        self.submit_count = 0;

        if release_resources {
            self.size_buffers.clear();
        }

        result
    }
}
