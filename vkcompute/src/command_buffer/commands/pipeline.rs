// Copyright (c) 2024 The vkcompute developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use crate::{
    buffer::Buffer,
    command_buffer::{CommandBuffer, CommandInfo},
    DeviceOwned, DeviceSize, ValidationError,
};
use std::sync::Arc;

/// # Commands to execute a bound pipeline.
impl CommandBuffer {
    /// Dispatches `group_counts` workgroups of the bound compute pipeline.
    ///
    /// The kernel is specialized for the workgroup size of the pipeline, and its arguments are
    /// gathered from the bound descriptor sets and push constants, at the time of this call.
    /// Binding other state afterwards doesn't affect the dispatch.
    ///
    /// If specializing the kernel or gathering its arguments fails, the error becomes the error
    /// of the command buffer and the dispatch is dropped.
    pub fn dispatch(&mut self, group_counts: [u32; 3]) -> Result<&mut Self, Box<ValidationError>> {
        self.validate_dispatch(group_counts)?;

        self.record(CommandInfo::Dispatch { group_counts });

        Ok(self)
    }

    fn validate_dispatch(&self, group_counts: [u32; 3]) -> Result<(), Box<ValidationError>> {
        self.validate_recording()
            .map_err(|err| err.set_vuids(&["VUID-vkCmdDispatch-commandBuffer-recording"]))?;

        let pipeline = self.bindings.pipeline.as_ref().ok_or_else(|| {
            Box::new(ValidationError {
                problem: "no compute pipeline is bound".into(),
                vuids: &["VUID-vkCmdDispatch-None-08606"],
                ..Default::default()
            })
        })?;

        for (set_num, set_layout) in pipeline.layout().set_layouts().iter().enumerate() {
            let compatible = self
                .bindings
                .descriptor_sets
                .get(set_num)
                .and_then(Option::as_ref)
                .is_some_and(|bound| bound.descriptor_set.layout().id() == set_layout.id());

            if !compatible {
                return Err(Box::new(ValidationError {
                    problem: format!(
                        "the bound pipeline uses descriptor set {}, but no descriptor set with a \
                        matching layout is bound to it",
                        set_num,
                    )
                    .into(),
                    vuids: &["VUID-vkCmdDispatch-None-08600"],
                    ..Default::default()
                }));
            }
        }

        let workgroup_size = pipeline.workgroup_size();

        for (dim, (count, size)) in group_counts.into_iter().zip(workgroup_size).enumerate() {
            if count.checked_mul(size).is_none() {
                return Err(Box::new(ValidationError {
                    context: format!("group_counts[{}]", dim).into(),
                    problem: "multiplied by the workgroup size of the bound pipeline, is greater \
                        than `u32::MAX`"
                        .into(),
                    vuids: &["VUID-vkCmdDispatch-groupCountX-00386"],
                }));
            }
        }

        Ok(())
    }

    /// Dispatches workgroups of the bound compute pipeline, with the group counts read from
    /// `buffer` at `offset` when the command executes.
    ///
    /// Not supported: recording this command makes the command buffer fail with
    /// [`VulkanError::FeatureNotPresent`](crate::VulkanError::FeatureNotPresent).
    pub fn dispatch_indirect(
        &mut self,
        buffer: Arc<Buffer>,
        offset: DeviceSize,
    ) -> Result<&mut Self, Box<ValidationError>> {
        self.validate_dispatch_indirect(&buffer, offset)?;

        self.record_unsupported("dispatch_indirect");

        Ok(self)
    }

    fn validate_dispatch_indirect(
        &self,
        buffer: &Buffer,
        offset: DeviceSize,
    ) -> Result<(), Box<ValidationError>> {
        self.validate_recording().map_err(|err| {
            err.set_vuids(&["VUID-vkCmdDispatchIndirect-commandBuffer-recording"])
        })?;

        if buffer.device().id() != self.device().id() {
            return Err(Box::new(ValidationError {
                context: "buffer".into(),
                problem: "does not belong to the same device as the command buffer".into(),
                vuids: &["VUID-vkCmdDispatchIndirect-commonparent"],
            }));
        }

        if offset % 4 != 0 {
            return Err(Box::new(ValidationError {
                context: "offset".into(),
                problem: "is not a multiple of 4".into(),
                vuids: &["VUID-vkCmdDispatchIndirect-offset-02710"],
            }));
        }

        if offset.checked_add(12).map_or(true, |end| end > buffer.size()) {
            return Err(Box::new(ValidationError {
                problem: "`offset + 12` is greater than the size of `buffer`".into(),
                vuids: &["VUID-vkCmdDispatchIndirect-offset-00407"],
                ..Default::default()
            }));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        buffer::Buffer,
        command_buffer::{
            CommandBufferAllocateInfo, CommandBufferBeginInfo, CommandPool,
            CommandPoolCreateInfo,
        },
        descriptor_set::{DescriptorSet, WriteDescriptorSet},
        Validated, VulkanError,
    };

    #[test]
    fn dispatch_requires_pipeline_and_sets() {
        let (host, _compiler, device, _queue) = host_device!();
        host.register_kernel("k", |_| ());
        let (pipeline, set_layout) = storage_pipeline!(device, "k", 1, 0, [64, 1, 1]);
        let buffer = Buffer::from_data(device.clone(), &[0; 16]).unwrap();
        let set = DescriptorSet::new(set_layout, [WriteDescriptorSet::buffer(0, buffer)]).unwrap();

        let pool = CommandPool::new(device, CommandPoolCreateInfo::default()).unwrap();
        let mut cb = pool
            .allocate_command_buffers(CommandBufferAllocateInfo::default())
            .unwrap()
            .remove(0);
        cb.begin(CommandBufferBeginInfo::default()).unwrap();

        assert!(cb.dispatch([1, 1, 1]).is_err());
        cb.bind_pipeline_compute(pipeline.clone()).unwrap();
        assert!(cb.dispatch([1, 1, 1]).is_err());
        cb.bind_descriptor_sets(pipeline.layout().clone(), 0, [set], [])
            .unwrap();

        // 64 * 2^26 overflows.
        assert!(cb.dispatch([1 << 26, 1, 1]).is_err());

        cb.dispatch([2, 1, 1]).unwrap();
        assert_eq!(cb.primary().specialized_kernels.len(), 1);
        assert_eq!(
            cb.primary().specialized_kernels[0].ndrange().global_size,
            [128, 1, 1],
        );
        cb.end().unwrap();
    }

    #[test]
    fn failed_specialization_drops_the_dispatch() {
        let (_host, compiler, device, _queue) = host_device!();
        let (pipeline, set_layout) = storage_pipeline!(device, "k", 0);
        compiler.reject_entry_point("k");

        let pool = CommandPool::new(device, CommandPoolCreateInfo::default()).unwrap();
        let mut cb = pool
            .allocate_command_buffers(CommandBufferAllocateInfo::default())
            .unwrap()
            .remove(0);
        cb.begin(CommandBufferBeginInfo::default()).unwrap();
        cb.bind_pipeline_compute(pipeline.clone())
            .unwrap()
            .bind_descriptor_sets(
                pipeline.layout().clone(),
                0,
                [DescriptorSet::new(set_layout, []).unwrap()],
                [],
            )
            .unwrap()
            .dispatch([1, 1, 1])
            .unwrap();

        assert!(cb.primary().specialized_kernels.is_empty());
        assert!(cb.primary().log.is_empty());
        assert!(matches!(
            cb.end(),
            Err(Validated::Error(VulkanError::InvalidShader)),
        ));
    }

    #[test]
    fn dispatch_indirect_is_unsupported() {
        let (_host, _compiler, device, _queue) = host_device!();
        let buffer = Buffer::from_data(device.clone(), &[0; 12]).unwrap();
        let pool = CommandPool::new(device, CommandPoolCreateInfo::default()).unwrap();
        let mut cb = pool
            .allocate_command_buffers(CommandBufferAllocateInfo::default())
            .unwrap()
            .remove(0);
        cb.begin(CommandBufferBeginInfo::default()).unwrap();

        assert!(cb.dispatch_indirect(buffer.clone(), 4).is_err());
        let err = cb
            .dispatch_indirect(buffer.clone(), u64::MAX - 3)
            .unwrap_err();
        assert_eq!(err.vuids, ["VUID-vkCmdDispatchIndirect-offset-00407"]);
        assert_eq!(cb.error(), None);
        cb.dispatch_indirect(buffer, 0).unwrap();

        assert_eq!(cb.error(), Some(VulkanError::FeatureNotPresent));
        assert!(matches!(
            cb.end(),
            Err(Validated::Error(VulkanError::FeatureNotPresent)),
        ));
    }
}
