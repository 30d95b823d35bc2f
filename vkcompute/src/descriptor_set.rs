// Copyright (c) 2024 The vkcompute developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Bindings between kernels and the buffers they access.
//!
//! A [`DescriptorSetLayout`] describes the bindings of a set: for each binding number, the type
//! of descriptor and how many array elements it has. A [`DescriptorSet`] is created from a
//! layout and a list of writes that fill in every descriptor.
//!
//! Only buffer descriptors exist. When a dispatch is recorded, the descriptors of every bound set
//! are flattened into the argument list of the kernel: sets in set order, bindings in binding
//! order, array elements in order. Dynamic descriptors have the dynamic offset given at bind time
//! added to their offset.

use crate::{
    buffer::Buffer,
    device::Device,
    macros::impl_id_counter,
    DeviceOwned, DeviceSize, Validated, ValidationError, VulkanError,
};
use smallvec::SmallVec;
use std::{collections::BTreeMap, num::NonZeroU64, ops::Range, sync::Arc};

/// Describes to the device how a descriptor set is laid out.
#[derive(Debug)]
pub struct DescriptorSetLayout {
    device: Arc<Device>,
    id: NonZeroU64,
    bindings: BTreeMap<u32, DescriptorSetLayoutBinding>,
    descriptor_count: u32,
    dynamic_descriptor_count: u32,
}

impl DescriptorSetLayout {
    /// Creates a new `DescriptorSetLayout`.
    pub fn new(
        device: Arc<Device>,
        create_info: DescriptorSetLayoutCreateInfo,
    ) -> Result<Arc<DescriptorSetLayout>, Validated<VulkanError>> {
        create_info
            .validate()
            .map_err(|err| err.add_context("create_info"))?;

        let DescriptorSetLayoutCreateInfo { bindings, _ne: _ } = create_info;

        let descriptor_count = bindings
            .values()
            .map(|binding| binding.descriptor_count)
            .sum();
        let dynamic_descriptor_count = bindings
            .values()
            .filter(|binding| binding.descriptor_type.is_dynamic())
            .map(|binding| binding.descriptor_count)
            .sum();

        Ok(Arc::new(DescriptorSetLayout {
            device,
            id: Self::next_id(),
            bindings,
            descriptor_count,
            dynamic_descriptor_count,
        }))
    }

    /// Returns the bindings of the layout.
    #[inline]
    pub fn bindings(&self) -> &BTreeMap<u32, DescriptorSetLayoutBinding> {
        &self.bindings
    }

    /// Returns the total number of descriptors over all bindings.
    #[inline]
    pub fn descriptor_count(&self) -> u32 {
        self.descriptor_count
    }

    /// Returns the number of descriptors with a dynamic descriptor type.
    #[inline]
    pub fn dynamic_descriptor_count(&self) -> u32 {
        self.dynamic_descriptor_count
    }
}

unsafe impl DeviceOwned for DescriptorSetLayout {
    #[inline]
    fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

impl_id_counter!(DescriptorSetLayout);

/// Parameters to create a new `DescriptorSetLayout`.
#[derive(Clone, Debug)]
pub struct DescriptorSetLayoutCreateInfo {
    /// The bindings of the descriptor set layout, keyed by binding number.
    ///
    /// The default value is empty.
    pub bindings: BTreeMap<u32, DescriptorSetLayoutBinding>,

    pub _ne: crate::NonExhaustive,
}

impl Default for DescriptorSetLayoutCreateInfo {
    #[inline]
    fn default() -> Self {
        Self {
            bindings: BTreeMap::new(),
            _ne: crate::NonExhaustive(()),
        }
    }
}

impl DescriptorSetLayoutCreateInfo {
    pub(crate) fn validate(&self) -> Result<(), Box<ValidationError>> {
        for (&binding_num, binding) in &self.bindings {
            if binding.descriptor_count == 0 {
                return Err(Box::new(ValidationError {
                    context: format!("bindings[{}].descriptor_count", binding_num).into(),
                    problem: "is zero".into(),
                    ..Default::default()
                }));
            }
        }

        Ok(())
    }
}

/// A binding in a descriptor set layout.
#[derive(Clone, Debug)]
pub struct DescriptorSetLayoutBinding {
    /// The type of the descriptors in this binding.
    ///
    /// There is no default value.
    pub descriptor_type: DescriptorType,

    /// The number of descriptors in this binding. If greater than 1, the binding is an array.
    ///
    /// The default value is `1`.
    pub descriptor_count: u32,

    pub _ne: crate::NonExhaustive,
}

impl DescriptorSetLayoutBinding {
    /// Returns a `DescriptorSetLayoutBinding` with the given type.
    #[inline]
    pub fn descriptor_type(descriptor_type: DescriptorType) -> Self {
        Self {
            descriptor_type,
            descriptor_count: 1,
            _ne: crate::NonExhaustive(()),
        }
    }
}

/// Describes what kind of resource may later be bound to a descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[non_exhaustive]
pub enum DescriptorType {
    UniformBuffer,
    StorageBuffer,
    UniformBufferDynamic,
    StorageBufferDynamic,
}

impl DescriptorType {
    /// Returns whether the descriptor type takes a dynamic offset when bound.
    #[inline]
    pub fn is_dynamic(self) -> bool {
        matches!(self, Self::UniformBufferDynamic | Self::StorageBufferDynamic)
    }
}

impl From<DescriptorType> for ash::vk::DescriptorType {
    #[inline]
    fn from(val: DescriptorType) -> Self {
        match val {
            DescriptorType::UniformBuffer => Self::UNIFORM_BUFFER,
            DescriptorType::StorageBuffer => Self::STORAGE_BUFFER,
            DescriptorType::UniformBufferDynamic => Self::UNIFORM_BUFFER_DYNAMIC,
            DescriptorType::StorageBufferDynamic => Self::STORAGE_BUFFER_DYNAMIC,
        }
    }
}

/// A collection of descriptors that can be bound to a command buffer.
#[derive(Debug)]
pub struct DescriptorSet {
    id: NonZeroU64,
    layout: Arc<DescriptorSetLayout>,
    resources: BTreeMap<u32, SmallVec<[DescriptorBufferInfo; 1]>>,
}

impl DescriptorSet {
    /// Creates a new `DescriptorSet`. Every descriptor of `layout` must be written by `writes`.
    pub fn new(
        layout: Arc<DescriptorSetLayout>,
        writes: impl IntoIterator<Item = WriteDescriptorSet>,
    ) -> Result<Arc<DescriptorSet>, Validated<VulkanError>> {
        let mut resources: BTreeMap<u32, SmallVec<[Option<DescriptorBufferInfo>; 1]>> = layout
            .bindings
            .iter()
            .map(|(&num, binding)| (num, (0..binding.descriptor_count).map(|_| None).collect()))
            .collect();

        for (index, write) in writes.into_iter().enumerate() {
            write
                .validate(&layout)
                .map_err(|err| err.add_context(format!("writes[{}]", index)))?;

            let WriteDescriptorSet {
                binding,
                first_array_element,
                elements,
            } = write;
            let slots = resources
                .get_mut(&binding)
                .unwrap_or_else(|| unreachable!("validated above"));

            for (slot, element) in slots[first_array_element as usize..].iter_mut().zip(elements) {
                *slot = Some(element);
            }
        }

        let resources = resources
            .into_iter()
            .map(|(num, slots)| {
                slots
                    .into_iter()
                    .enumerate()
                    .map(|(element, slot)| {
                        slot.ok_or_else(|| {
                            Box::new(ValidationError {
                                context: "writes".into(),
                                problem: format!(
                                    "array element {} of binding {} was not written",
                                    element, num,
                                )
                                .into(),
                                ..Default::default()
                            })
                        })
                    })
                    .collect::<Result<SmallVec<_>, _>>()
                    .map(|elements| (num, elements))
            })
            .collect::<Result<_, _>>()?;

        Ok(Arc::new(DescriptorSet {
            id: Self::next_id(),
            layout,
            resources,
        }))
    }

    #[inline]
    pub fn layout(&self) -> &Arc<DescriptorSetLayout> {
        &self.layout
    }

    /// Returns the buffers bound to each binding, by binding number.
    #[inline]
    pub fn resources(&self) -> &BTreeMap<u32, SmallVec<[DescriptorBufferInfo; 1]>> {
        &self.resources
    }
}

unsafe impl DeviceOwned for DescriptorSet {
    #[inline]
    fn device(&self) -> &Arc<Device> {
        self.layout.device()
    }
}

impl_id_counter!(DescriptorSet);

/// A buffer range bound to a descriptor.
#[derive(Clone, Debug)]
pub struct DescriptorBufferInfo {
    /// The buffer to bind.
    pub buffer: Arc<Buffer>,

    /// The byte range of the buffer that is visible to the kernel. For dynamic descriptors, the
    /// dynamic offset is added to the start of the range when the set is bound.
    pub range: Range<DeviceSize>,
}

impl DescriptorBufferInfo {
    /// Binds the whole buffer.
    #[inline]
    pub fn whole(buffer: Arc<Buffer>) -> Self {
        let range = 0..buffer.size();

        Self { buffer, range }
    }
}

/// Represents a single write operation to the bindings of a descriptor set.
#[derive(Clone, Debug)]
pub struct WriteDescriptorSet {
    binding: u32,
    first_array_element: u32,
    elements: SmallVec<[DescriptorBufferInfo; 1]>,
}

impl WriteDescriptorSet {
    /// Write a single whole buffer to array element 0.
    #[inline]
    pub fn buffer(binding: u32, buffer: Arc<Buffer>) -> Self {
        Self::buffer_with_range(binding, DescriptorBufferInfo::whole(buffer))
    }

    /// Write a number of consecutive whole buffers.
    pub fn buffer_array(
        binding: u32,
        first_array_element: u32,
        elements: impl IntoIterator<Item = Arc<Buffer>>,
    ) -> Self {
        Self::buffer_with_range_array(
            binding,
            first_array_element,
            elements.into_iter().map(DescriptorBufferInfo::whole),
        )
    }

    /// Write a single buffer range to array element 0.
    #[inline]
    pub fn buffer_with_range(binding: u32, buffer_info: DescriptorBufferInfo) -> Self {
        Self::buffer_with_range_array(binding, 0, [buffer_info])
    }

    /// Write a number of consecutive buffer ranges.
    pub fn buffer_with_range_array(
        binding: u32,
        first_array_element: u32,
        elements: impl IntoIterator<Item = DescriptorBufferInfo>,
    ) -> Self {
        Self {
            binding,
            first_array_element,
            elements: elements.into_iter().collect(),
        }
    }

    #[inline]
    pub fn binding(&self) -> u32 {
        self.binding
    }

    fn validate(&self, layout: &DescriptorSetLayout) -> Result<(), Box<ValidationError>> {
        let layout_binding = layout.bindings.get(&self.binding).ok_or_else(|| {
            Box::new(ValidationError {
                context: "binding".into(),
                problem: "does not exist in the descriptor set layout".into(),
                vuids: &["VUID-VkWriteDescriptorSet-dstBinding-00315"],
            })
        })?;

        if self.elements.is_empty() {
            return Err(Box::new(ValidationError {
                context: "elements".into(),
                problem: "is empty".into(),
                ..Default::default()
            }));
        }

        if self.first_array_element as usize + self.elements.len()
            > layout_binding.descriptor_count as usize
        {
            return Err(Box::new(ValidationError {
                problem: "`first_array_element` + the number of elements is greater than the \
                    number of descriptors in the binding"
                    .into(),
                vuids: &["VUID-VkWriteDescriptorSet-dstArrayElement-00321"],
                ..Default::default()
            }));
        }

        for (index, element) in self.elements.iter().enumerate() {
            if element.buffer.device() != layout.device() {
                return Err(Box::new(ValidationError {
                    context: format!("elements[{}].buffer", index).into(),
                    problem: "does not belong to the same device as the layout".into(),
                    ..Default::default()
                }));
            }

            if element.range.is_empty() || element.range.end > element.buffer.size() {
                return Err(Box::new(ValidationError {
                    context: format!("elements[{}].range", index).into(),
                    problem: "is empty, or is out of the bounds of the buffer".into(),
                    vuids: &["VUID-VkDescriptorBufferInfo-range-00341"],
                }));
            }
        }

        Ok(())
    }
}
