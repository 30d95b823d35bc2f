// Copyright (c) 2024 The vkcompute developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Compute pipelines and their layouts.
//!
//! A [`PipelineLayout`] lists the descriptor set layouts a kernel expects, and the ranges of the
//! push-constant block it reads. A [`ComputePipeline`] combines a layout with a kernel entry
//! point and its workgroup size.
//!
//! If the shader module of a pipeline carries a precompiled binary, the HAL kernel is created
//! once, together with the pipeline. Otherwise a kernel is specialized by the device's compiler
//! for each dispatch, since the compiler needs to know the exact launch configuration.

use crate::{
    descriptor_set::DescriptorSetLayout,
    device::Device,
    hal::HalKernel,
    macros::impl_id_counter,
    shader::ShaderModule,
    DeviceOwned, Validated, ValidationError, VulkanError,
};
use smallvec::SmallVec;
use std::{num::NonZeroU64, sync::Arc};

/// Describes the descriptor sets and push constants a pipeline uses.
#[derive(Debug)]
pub struct PipelineLayout {
    device: Arc<Device>,
    id: NonZeroU64,
    set_layouts: Vec<Arc<DescriptorSetLayout>>,
    push_constant_ranges: SmallVec<[PushConstantRange; 2]>,
    total_push_constant_size: u32,
}

impl PipelineLayout {
    /// Creates a new `PipelineLayout`.
    pub fn new(
        device: Arc<Device>,
        create_info: PipelineLayoutCreateInfo,
    ) -> Result<Arc<PipelineLayout>, Validated<VulkanError>> {
        create_info
            .validate(&device)
            .map_err(|err| err.add_context("create_info"))?;

        let PipelineLayoutCreateInfo {
            set_layouts,
            push_constant_ranges,
            _ne: _,
        } = create_info;

        let total_push_constant_size = push_constant_ranges
            .iter()
            .map(|range| range.offset + range.size)
            .max()
            .unwrap_or(0);

        Ok(Arc::new(PipelineLayout {
            device,
            id: Self::next_id(),
            set_layouts,
            push_constant_ranges: push_constant_ranges.into_iter().collect(),
            total_push_constant_size,
        }))
    }

    /// Returns the descriptor set layouts, indexed by set number.
    #[inline]
    pub fn set_layouts(&self) -> &[Arc<DescriptorSetLayout>] {
        &self.set_layouts
    }

    #[inline]
    pub fn push_constant_ranges(&self) -> &[PushConstantRange] {
        &self.push_constant_ranges
    }

    /// Returns the size of the push-constant block, which is the largest end offset of all
    /// push-constant ranges.
    #[inline]
    pub fn total_push_constant_size(&self) -> u32 {
        self.total_push_constant_size
    }
}

unsafe impl DeviceOwned for PipelineLayout {
    #[inline]
    fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

impl_id_counter!(PipelineLayout);

/// Parameters to create a new `PipelineLayout`.
#[derive(Clone, Debug)]
pub struct PipelineLayoutCreateInfo {
    /// The descriptor set layouts, indexed by set number.
    ///
    /// The default value is empty.
    pub set_layouts: Vec<Arc<DescriptorSetLayout>>,

    /// The ranges of the push-constant block that the pipeline accesses.
    ///
    /// The default value is empty.
    pub push_constant_ranges: Vec<PushConstantRange>,

    pub _ne: crate::NonExhaustive,
}

impl Default for PipelineLayoutCreateInfo {
    #[inline]
    fn default() -> Self {
        Self {
            set_layouts: Vec::new(),
            push_constant_ranges: Vec::new(),
            _ne: crate::NonExhaustive(()),
        }
    }
}

impl PipelineLayoutCreateInfo {
    pub(crate) fn validate(&self, device: &Device) -> Result<(), Box<ValidationError>> {
        for (index, set_layout) in self.set_layouts.iter().enumerate() {
            if set_layout.device().id() != device.id() {
                return Err(Box::new(ValidationError {
                    context: format!("set_layouts[{}]", index).into(),
                    problem: "does not belong to the device".into(),
                    ..Default::default()
                }));
            }
        }

        let max_push_constants_size = device.properties().max_push_constants_size;

        for (index, range) in self.push_constant_ranges.iter().enumerate() {
            let &PushConstantRange { offset, size } = range;

            if offset % 4 != 0 {
                return Err(Box::new(ValidationError {
                    context: format!("push_constant_ranges[{}].offset", index).into(),
                    problem: "is not a multiple of 4".into(),
                    vuids: &["VUID-VkPushConstantRange-offset-00295"],
                }));
            }

            if size == 0 || size % 4 != 0 {
                return Err(Box::new(ValidationError {
                    context: format!("push_constant_ranges[{}].size", index).into(),
                    problem: "is zero, or is not a multiple of 4".into(),
                    vuids: &[
                        "VUID-VkPushConstantRange-size-00296",
                        "VUID-VkPushConstantRange-size-00297",
                    ],
                }));
            }

            if offset + size > max_push_constants_size {
                return Err(Box::new(ValidationError {
                    context: format!("push_constant_ranges[{}]", index).into(),
                    problem: "`offset` + `size` is greater than the `max_push_constants_size` \
                        device limit"
                        .into(),
                    vuids: &["VUID-VkPushConstantRange-size-00298"],
                }));
            }
        }

        Ok(())
    }
}

/// A range of the push-constant block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PushConstantRange {
    /// Offset in bytes from the start of the push-constant block. Must be a multiple of 4.
    pub offset: u32,

    /// Size in bytes of the range. Must be a non-zero multiple of 4.
    pub size: u32,
}

/// A kernel entry point, its workgroup size and its layout.
#[derive(Debug)]
pub struct ComputePipeline {
    device: Arc<Device>,
    id: NonZeroU64,
    module: Arc<ShaderModule>,
    entry_point: String,
    workgroup_size: [u32; 3],
    layout: Arc<PipelineLayout>,
    precompiled_kernel: Option<Arc<HalKernel>>,
}

impl ComputePipeline {
    /// Creates a new `ComputePipeline`.
    ///
    /// If the shader module carries a precompiled binary, the HAL executable and kernel are
    /// created here.
    pub fn new(
        device: Arc<Device>,
        create_info: ComputePipelineCreateInfo,
    ) -> Result<Arc<ComputePipeline>, Validated<VulkanError>> {
        create_info
            .validate(&device)
            .map_err(|err| err.add_context("create_info"))?;

        let ComputePipelineCreateInfo {
            module,
            entry_point,
            workgroup_size,
            layout,
            _ne: _,
        } = create_info;

        let precompiled_kernel = module
            .precompiled_binary()
            .map(|binary| HalKernel::from_binary(device.hal(), binary, &entry_point))
            .transpose()
            .map_err(VulkanError::from)?
            .map(Arc::new);

        log::debug!(
            "created compute pipeline for `{}` with workgroup size {:?} ({})",
            entry_point,
            workgroup_size,
            if precompiled_kernel.is_some() {
                "precompiled"
            } else {
                "specialized per dispatch"
            },
        );

        Ok(Arc::new(ComputePipeline {
            device,
            id: Self::next_id(),
            module,
            entry_point,
            workgroup_size,
            layout,
            precompiled_kernel,
        }))
    }

    #[inline]
    pub fn module(&self) -> &Arc<ShaderModule> {
        &self.module
    }

    #[inline]
    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    /// Returns the number of invocations in one workgroup, in each dimension.
    #[inline]
    pub fn workgroup_size(&self) -> [u32; 3] {
        self.workgroup_size
    }

    #[inline]
    pub fn layout(&self) -> &Arc<PipelineLayout> {
        &self.layout
    }

    /// Returns the kernel created from the precompiled binary of the module, if it has one.
    #[inline]
    pub(crate) fn precompiled_kernel(&self) -> Option<&Arc<HalKernel>> {
        self.precompiled_kernel.as_ref()
    }
}

unsafe impl DeviceOwned for ComputePipeline {
    #[inline]
    fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

impl_id_counter!(ComputePipeline);

/// Parameters to create a new `ComputePipeline`.
#[derive(Clone, Debug)]
pub struct ComputePipelineCreateInfo {
    /// The shader module containing the entry point.
    ///
    /// There is no default value.
    pub module: Arc<ShaderModule>,

    /// The name of the entry point.
    ///
    /// There is no default value.
    pub entry_point: String,

    /// The number of invocations in one workgroup, in each dimension.
    ///
    /// The default value is `[1, 1, 1]`.
    pub workgroup_size: [u32; 3],

    /// The layout of the pipeline.
    ///
    /// There is no default value.
    pub layout: Arc<PipelineLayout>,

    pub _ne: crate::NonExhaustive,
}

impl ComputePipelineCreateInfo {
    /// Returns a `ComputePipelineCreateInfo` with the specified entry point and layout.
    #[inline]
    pub fn new(
        module: Arc<ShaderModule>,
        entry_point: impl Into<String>,
        layout: Arc<PipelineLayout>,
    ) -> Self {
        Self {
            module,
            entry_point: entry_point.into(),
            workgroup_size: [1, 1, 1],
            layout,
            _ne: crate::NonExhaustive(()),
        }
    }

    pub(crate) fn validate(&self, device: &Device) -> Result<(), Box<ValidationError>> {
        let &Self {
            ref module,
            ref entry_point,
            workgroup_size,
            ref layout,
            _ne: _,
        } = self;

        if module.device().id() != device.id() || layout.device().id() != device.id() {
            return Err(Box::new(ValidationError {
                problem: "`module` or `layout` does not belong to the device".into(),
                ..Default::default()
            }));
        }

        if entry_point.is_empty() {
            return Err(Box::new(ValidationError {
                context: "entry_point".into(),
                problem: "is empty".into(),
                ..Default::default()
            }));
        }

        let properties = device.properties();

        for (dim, (&size, &max)) in workgroup_size
            .iter()
            .zip(&properties.max_compute_work_group_size)
            .enumerate()
        {
            if size == 0 || size > max {
                return Err(Box::new(ValidationError {
                    context: format!("workgroup_size[{}]", dim).into(),
                    problem: "is zero, or is greater than the `max_compute_work_group_size` \
                        device limit"
                        .into(),
                    ..Default::default()
                }));
            }
        }

        let invocations = workgroup_size.iter().map(|&size| u64::from(size)).product::<u64>();

        if invocations > u64::from(properties.max_compute_work_group_invocations) {
            return Err(Box::new(ValidationError {
                context: "workgroup_size".into(),
                problem: "the product of the dimensions is greater than the \
                    `max_compute_work_group_invocations` device limit"
                    .into(),
                ..Default::default()
            }));
        }

        Ok(())
    }
}
