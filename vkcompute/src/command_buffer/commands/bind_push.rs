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
    descriptor_set::DescriptorSet,
    pipeline::{ComputePipeline, PipelineLayout},
    DeviceOwned, DeviceSize, ValidationError,
};
use smallvec::SmallVec;
use std::sync::Arc;

/// Dynamic offsets must be multiples of this.
const DYNAMIC_OFFSET_ALIGNMENT: u32 = 4;

/// # Commands to bind or push state for dispatches.
///
/// State set by these commands applies to every dispatch recorded after them, until it is set
/// again.
impl CommandBuffer {
    /// Binds a compute pipeline for future dispatches.
    pub fn bind_pipeline_compute(
        &mut self,
        pipeline: Arc<ComputePipeline>,
    ) -> Result<&mut Self, Box<ValidationError>> {
        self.validate_bind_pipeline_compute(&pipeline)?;

        self.record(CommandInfo::BindPipeline { pipeline });

        Ok(self)
    }

    fn validate_bind_pipeline_compute(
        &self,
        pipeline: &ComputePipeline,
    ) -> Result<(), Box<ValidationError>> {
        self.validate_recording()
            .map_err(|err| err.set_vuids(&["VUID-vkCmdBindPipeline-commandBuffer-recording"]))?;

        if pipeline.device().id() != self.device().id() {
            return Err(Box::new(ValidationError {
                context: "pipeline".into(),
                problem: "does not belong to the same device as the command buffer".into(),
                vuids: &["VUID-vkCmdBindPipeline-commonparent"],
            }));
        }

        Ok(())
    }

    /// Binds descriptor sets for future dispatches.
    ///
    /// `descriptor_sets` are bound to the set numbers starting at `first_set`. `dynamic_offsets`
    /// holds one offset for every dynamic descriptor of the sets, in set, binding and array
    /// element order. Each offset is added to the start of the range of its descriptor.
    pub fn bind_descriptor_sets(
        &mut self,
        pipeline_layout: Arc<PipelineLayout>,
        first_set: u32,
        descriptor_sets: impl IntoIterator<Item = Arc<DescriptorSet>>,
        dynamic_offsets: impl IntoIterator<Item = u32>,
    ) -> Result<&mut Self, Box<ValidationError>> {
        let descriptor_sets: SmallVec<_> = descriptor_sets.into_iter().collect();
        let dynamic_offsets: SmallVec<_> = dynamic_offsets.into_iter().collect();
        self.validate_bind_descriptor_sets(
            &pipeline_layout,
            first_set,
            &descriptor_sets,
            &dynamic_offsets,
        )?;

        self.record(CommandInfo::BindDescriptorSets {
            pipeline_layout,
            first_set,
            descriptor_sets,
            dynamic_offsets,
        });

        Ok(self)
    }

    fn validate_bind_descriptor_sets(
        &self,
        pipeline_layout: &PipelineLayout,
        first_set: u32,
        descriptor_sets: &[Arc<DescriptorSet>],
        dynamic_offsets: &[u32],
    ) -> Result<(), Box<ValidationError>> {
        self.validate_recording().map_err(|err| {
            err.set_vuids(&["VUID-vkCmdBindDescriptorSets-commandBuffer-recording"])
        })?;

        if pipeline_layout.device().id() != self.device().id() {
            return Err(Box::new(ValidationError {
                context: "pipeline_layout".into(),
                problem: "does not belong to the same device as the command buffer".into(),
                vuids: &["VUID-vkCmdBindDescriptorSets-commonparent"],
            }));
        }

        if descriptor_sets.is_empty() {
            return Err(Box::new(ValidationError {
                context: "descriptor_sets".into(),
                problem: "is empty".into(),
                vuids: &["VUID-vkCmdBindDescriptorSets-descriptorSetCount-arraylength"],
            }));
        }

        if first_set as usize + descriptor_sets.len() > pipeline_layout.set_layouts().len() {
            return Err(Box::new(ValidationError {
                problem: "`first_set + descriptor_sets.len()` is greater than the number of set \
                    layouts of `pipeline_layout`"
                    .into(),
                vuids: &["VUID-vkCmdBindDescriptorSets-firstSet-00360"],
                ..Default::default()
            }));
        }

        let mut dynamic_offsets = dynamic_offsets.iter().copied().enumerate();
        let required_offsets: u32 = descriptor_sets
            .iter()
            .map(|set| set.layout().dynamic_descriptor_count())
            .sum();

        if dynamic_offsets.len() != required_offsets as usize {
            return Err(Box::new(ValidationError {
                problem: format!(
                    "`dynamic_offsets` has {} elements, but the descriptor sets have {} dynamic \
                    descriptors",
                    dynamic_offsets.len(),
                    required_offsets,
                )
                .into(),
                vuids: &["VUID-vkCmdBindDescriptorSets-dynamicOffsetCount-00359"],
                ..Default::default()
            }));
        }

        for (index, descriptor_set) in descriptor_sets.iter().enumerate() {
            let set_num = first_set as usize + index;
            let set_layout = &pipeline_layout.set_layouts()[set_num];

            if descriptor_set.layout().id() != set_layout.id() {
                return Err(Box::new(ValidationError {
                    context: format!("descriptor_sets[{}]", index).into(),
                    problem: format!(
                        "was not created with the set layout of set {} of `pipeline_layout`",
                        set_num,
                    )
                    .into(),
                    vuids: &["VUID-vkCmdBindDescriptorSets-pDescriptorSets-00358"],
                }));
            }

            for (&binding_num, binding) in descriptor_set.layout().bindings() {
                if !binding.descriptor_type.is_dynamic() {
                    continue;
                }

                for info in &descriptor_set.resources()[&binding_num] {
                    let Some((offset_index, offset)) = dynamic_offsets.next() else {
                        unreachable!("the offset count was checked above");
                    };

                    if offset % DYNAMIC_OFFSET_ALIGNMENT != 0 {
                        return Err(Box::new(ValidationError {
                            context: format!("dynamic_offsets[{}]", offset_index).into(),
                            problem: format!(
                                "is not a multiple of {}",
                                DYNAMIC_OFFSET_ALIGNMENT,
                            )
                            .into(),
                            vuids: &["VUID-vkCmdBindDescriptorSets-pDynamicOffsets-01971"],
                        }));
                    }

                    if info.range.end + DeviceSize::from(offset) > info.buffer.size() {
                        return Err(Box::new(ValidationError {
                            context: format!("dynamic_offsets[{}]", offset_index).into(),
                            problem: format!(
                                "moves the range of binding {} of set {} past the end of its \
                                buffer",
                                binding_num, set_num,
                            )
                            .into(),
                            vuids: &["VUID-vkCmdBindDescriptorSets-pDescriptorSets-01979"],
                        }));
                    }
                }
            }
        }

        Ok(())
    }

    /// Sets push constants for future dispatches.
    ///
    /// The push-constant block is kept per command buffer, so `data` updates only the bytes
    /// `offset..offset + data.len()` of it.
    pub fn push_constants(
        &mut self,
        pipeline_layout: Arc<PipelineLayout>,
        offset: u32,
        data: &[u8],
    ) -> Result<&mut Self, Box<ValidationError>> {
        self.validate_push_constants(&pipeline_layout, offset, data)?;

        self.record(CommandInfo::PushConstants {
            pipeline_layout,
            offset,
            data: data.into(),
        });

        Ok(self)
    }

    fn validate_push_constants(
        &self,
        pipeline_layout: &PipelineLayout,
        offset: u32,
        data: &[u8],
    ) -> Result<(), Box<ValidationError>> {
        self.validate_recording()
            .map_err(|err| err.set_vuids(&["VUID-vkCmdPushConstants-commandBuffer-recording"]))?;

        if data.is_empty() {
            return Err(Box::new(ValidationError {
                context: "data".into(),
                problem: "is empty".into(),
                vuids: &["VUID-vkCmdPushConstants-size-arraylength"],
            }));
        }

        if offset % 4 != 0 {
            return Err(Box::new(ValidationError {
                context: "offset".into(),
                problem: "is not a multiple of 4".into(),
                vuids: &["VUID-vkCmdPushConstants-offset-00368"],
            }));
        }

        if data.len() % 4 != 0 {
            return Err(Box::new(ValidationError {
                context: "data".into(),
                problem: "the size is not a multiple of 4".into(),
                vuids: &["VUID-vkCmdPushConstants-size-00369"],
            }));
        }

        let max_size = self.device().properties().max_push_constants_size;

        if offset as usize + data.len() > max_size as usize {
            return Err(Box::new(ValidationError {
                problem: format!(
                    "`offset + data.len()` is greater than the `max_push_constants_size` limit \
                    ({})",
                    max_size,
                )
                .into(),
                vuids: &["VUID-vkCmdPushConstants-size-00371"],
                ..Default::default()
            }));
        }

        let mut word = offset;
        let end = offset + data.len() as u32;

        while word < end {
            let covered = pipeline_layout
                .push_constant_ranges()
                .iter()
                .any(|range| (range.offset..range.offset + range.size).contains(&word));

            if !covered {
                return Err(Box::new(ValidationError {
                    problem: format!(
                        "byte {} of the push-constant block is not covered by any push-constant \
                        range of `pipeline_layout`",
                        word,
                    )
                    .into(),
                    vuids: &["VUID-vkCmdPushConstants-offset-01796"],
                    ..Default::default()
                }));
            }

            word += 4;
        }

        Ok(())
    }
}
