// Copyright (c) 2024 The vkcompute developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Turning a dispatch into a HAL kernel launch.
//!
//! When a dispatch is recorded, everything the launch needs is captured right away in a
//! [`RecordedKernel`]: the flattened buffer arguments, a copy of the push constants, the array of
//! buffer sizes, and the HAL kernel itself. Later changes to the bindings of the command buffer
//! therefore don't affect dispatches that were already recorded.

use crate::{
    buffer::Buffer,
    descriptor_set::DescriptorSet,
    device::Device,
    hal::{HalBuffer, HalCommandBuffer, HalError, HalKernel, KernelArg, NdRange},
    pipeline::ComputePipeline,
    shader::NdRangeOptions,
    DeviceSize, VulkanError, VulkanObject,
};
use foldhash::HashMap;
use smallvec::SmallVec;
use std::sync::Arc;

/// A descriptor set bound to a command buffer, with the dynamic offsets of its dynamic
/// descriptors.
#[derive(Clone, Debug)]
pub(crate) struct BoundDescriptorSet {
    pub(crate) descriptor_set: Arc<DescriptorSet>,
    pub(crate) dynamic_offsets: SmallVec<[u32; 4]>,
}

/// Buffer-size arrays already uploaded by a command buffer, keyed by their contents.
pub(crate) type SizeBufferCache = HashMap<SmallVec<[u32; 8]>, Arc<HalBuffer>>;

/// Everything needed to launch one dispatch.
#[derive(Debug)]
pub(crate) struct RecordedKernel {
    kernel: Arc<HalKernel>,
    ndrange: NdRange,
    args: SmallVec<[KernelArg; 8]>,
    specialized: bool,

    // Kept alive for as long as the launch may execute.
    _buffers: SmallVec<[Arc<Buffer>; 4]>,
    _push_constants: Option<HalBuffer>,
    _buffer_sizes: Option<Arc<HalBuffer>>,
}

impl RecordedKernel {
    /// Assembles the launch of `group_counts` workgroups of `pipeline`.
    ///
    /// The bound buffers of every set of the pipeline layout are passed in set, binding and
    /// array element order. They are followed by the array of their sizes, if there is at least
    /// one, and by the push constants, if the layout has any.
    ///
    /// # Panics
    ///
    /// - Panics if a set of the pipeline layout is not bound.
    pub(crate) fn assemble(
        device: &Device,
        pipeline: &ComputePipeline,
        descriptor_sets: &[Option<BoundDescriptorSet>],
        push_constants: &[u8],
        group_counts: [u32; 3],
        size_buffers: &mut SizeBufferCache,
    ) -> Result<RecordedKernel, VulkanError> {
        let hal = device.hal();
        let layout = pipeline.layout();
        let workgroup_size = pipeline.workgroup_size();

        let mut args = SmallVec::new();
        let mut sizes: SmallVec<[u32; 8]> = SmallVec::new();
        let mut buffers = SmallVec::new();

        for set_num in 0..layout.set_layouts().len() {
            let bound = descriptor_sets
                .get(set_num)
                .and_then(Option::as_ref)
                .unwrap_or_else(|| panic!("descriptor set {} is not bound", set_num));
            let mut dynamic_offsets = bound.dynamic_offsets.iter().copied();

            for (binding_num, elements) in bound.descriptor_set.resources() {
                let is_dynamic = bound.descriptor_set.layout().bindings()[binding_num]
                    .descriptor_type
                    .is_dynamic();

                for element in elements {
                    let dynamic_offset = if is_dynamic {
                        dynamic_offsets.next().unwrap_or(0)
                    } else {
                        0
                    };
                    let range = element.range.end - element.range.start;

                    args.push(KernelArg::Buffer {
                        buffer: element.buffer.handle(),
                        offset: element.range.start + DeviceSize::from(dynamic_offset),
                        range,
                    });
                    sizes.push(u32::try_from(range).unwrap_or(u32::MAX));
                    buffers.push(element.buffer.clone());
                }
            }
        }

        let buffer_sizes = if sizes.is_empty() {
            None
        } else {
            let count = sizes.len() as u32;
            let buffer = match size_buffers.get(&sizes) {
                Some(buffer) => buffer.clone(),
                None => {
                    let buffer = HalBuffer::new(hal, (sizes.len() * 4) as DeviceSize)
                        .and_then(|buffer| {
                            buffer
                                .memory()
                                .upload(0, bytemuck::cast_slice(&sizes))
                                .map(|()| Arc::new(buffer))
                        })
                        .map_err(dispatch_error)?;
                    size_buffers.insert(sizes, buffer.clone());

                    buffer
                }
            };
            args.push(KernelArg::BufferSizes {
                buffer: buffer.raw(),
                count,
            });

            Some(buffer)
        };

        let push_constants_size = layout.total_push_constant_size() as usize;
        let push_constants = if push_constants_size == 0 {
            None
        } else {
            let buffer = HalBuffer::new(hal, push_constants_size as DeviceSize)
                .and_then(|buffer| {
                    buffer
                        .memory()
                        .upload(0, &push_constants[..push_constants_size])
                        .map(|()| buffer)
                })
                .map_err(dispatch_error)?;
            args.push(KernelArg::PushConstants {
                buffer: buffer.raw(),
                size: push_constants_size as DeviceSize,
            });

            Some(buffer)
        };

        let ndrange = NdRange {
            global_offset: [0; 3],
            global_size: [0, 1, 2].map(|i| group_counts[i] * workgroup_size[i]),
            local_size: workgroup_size,
        };

        let (kernel, specialized) = match pipeline.precompiled_kernel() {
            Some(kernel) => (kernel.clone(), false),
            None => {
                let binary = device.compiler().create_specialized_kernel(
                    pipeline.module(),
                    pipeline.entry_point(),
                    &NdRangeOptions {
                        global_offset: ndrange.global_offset,
                        global_size: ndrange.global_size,
                        local_size: ndrange.local_size,
                    },
                )?;
                let kernel = HalKernel::from_binary(hal, &binary, pipeline.entry_point())
                    .map_err(dispatch_error)?;

                (Arc::new(kernel), true)
            }
        };

        Ok(RecordedKernel {
            kernel,
            ndrange,
            args,
            specialized,
            _buffers: buffers,
            _push_constants: push_constants,
            _buffer_sizes: buffer_sizes,
        })
    }

    #[inline]
    pub(crate) fn ndrange(&self) -> &NdRange {
        &self.ndrange
    }

    #[inline]
    pub(crate) fn args(&self) -> &[KernelArg] {
        &self.args
    }

    /// Returns whether the kernel was specialized for this launch, rather than being the
    /// precompiled kernel of the pipeline.
    #[inline]
    pub(crate) fn is_specialized(&self) -> bool {
        self.specialized
    }

    /// Appends the launch to `command_buffer`.
    pub(crate) fn enqueue(&self, command_buffer: &HalCommandBuffer) -> Result<(), HalError> {
        command_buffer.hal().enqueue_ndrange(
            command_buffer.raw(),
            self.kernel.raw(),
            &self.ndrange,
            &self.args,
        )
    }
}

// Kernel binaries that fail to load count as a finalization failure, every other HAL failure
// while assembling a dispatch as running out of memory.
fn dispatch_error(err: HalError) -> VulkanError {
    match err {
        HalError::InvalidBinary | HalError::KernelNotFound(_) => VulkanError::InvalidShader,
        _ => VulkanError::OutOfHostMemory,
    }
}
