// Copyright (c) 2024 The vkcompute developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use super::BufferCopy;
use crate::{
    buffer::Buffer,
    descriptor_set::DescriptorSet,
    pipeline::{ComputePipeline, PipelineLayout},
    sync::{DependencyFlags, Event, PipelineStages},
    DeviceSize,
};
use smallvec::SmallVec;
use std::sync::Arc;

/// A command as it was recorded into a command buffer.
///
/// Secondary command buffers keep their commands in this form until they are executed from a
/// primary command buffer. See [`CommandBuffer::commands`](super::CommandBuffer::commands).
#[derive(Clone, Debug)]
pub enum CommandInfo {
    BindPipeline {
        pipeline: Arc<ComputePipeline>,
    },
    BindDescriptorSets {
        pipeline_layout: Arc<PipelineLayout>,
        first_set: u32,
        descriptor_sets: SmallVec<[Arc<DescriptorSet>; 4]>,
        dynamic_offsets: SmallVec<[u32; 4]>,
    },
    Dispatch {
        group_counts: [u32; 3],
    },
    CopyBuffer {
        src_buffer: Arc<Buffer>,
        dst_buffer: Arc<Buffer>,
        regions: SmallVec<[BufferCopy; 1]>,
    },
    UpdateBuffer {
        dst_buffer: Arc<Buffer>,
        dst_offset: DeviceSize,
        data: Arc<[u8]>,
    },
    FillBuffer {
        dst_buffer: Arc<Buffer>,
        dst_offset: DeviceSize,
        size: DeviceSize,
        data: u32,
    },
    SetEvent {
        event: Arc<Event>,
        stages: PipelineStages,
    },
    ResetEvent {
        event: Arc<Event>,
        stages: PipelineStages,
    },
    WaitEvents {
        events: SmallVec<[Arc<Event>; 4]>,
        src_stages: PipelineStages,
        dst_stages: PipelineStages,
    },
    PushConstants {
        pipeline_layout: Arc<PipelineLayout>,
        offset: u32,
        data: Arc<[u8]>,
    },
    PipelineBarrier {
        src_stages: PipelineStages,
        dst_stages: PipelineStages,
        dependency_flags: DependencyFlags,
    },
}

impl CommandInfo {
    /// Returns the stages that the command executes in.
    ///
    /// State-setting commands and barriers execute in no stage. Event commands execute in the
    /// stages they name: the set stages for `SetEvent` and `ResetEvent`, the destination stages
    /// for `WaitEvents`.
    pub fn stages(&self) -> PipelineStages {
        match self {
            Self::Dispatch { .. } => PipelineStages::COMPUTE_SHADER,
            Self::CopyBuffer { .. } | Self::UpdateBuffer { .. } | Self::FillBuffer { .. } => {
                PipelineStages::TRANSFER
            }
            Self::SetEvent { stages, .. } | Self::ResetEvent { stages, .. } => *stages,
            Self::WaitEvents { dst_stages, .. } => *dst_stages,
            Self::BindPipeline { .. }
            | Self::BindDescriptorSets { .. }
            | Self::PushConstants { .. }
            | Self::PipelineBarrier { .. } => PipelineStages::empty(),
        }
    }

    /// Returns the name of the command, as used in log messages.
    pub fn name(&self) -> &'static str {
        match self {
            Self::BindPipeline { .. } => "bind_pipeline_compute",
            Self::BindDescriptorSets { .. } => "bind_descriptor_sets",
            Self::Dispatch { .. } => "dispatch",
            Self::CopyBuffer { .. } => "copy_buffer",
            Self::UpdateBuffer { .. } => "update_buffer",
            Self::FillBuffer { .. } => "fill_buffer",
            Self::SetEvent { .. } => "set_event",
            Self::ResetEvent { .. } => "reset_event",
            Self::WaitEvents { .. } => "wait_events",
            Self::PushConstants { .. } => "push_constants",
            Self::PipelineBarrier { .. } => "pipeline_barrier",
        }
    }
}
