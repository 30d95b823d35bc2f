// Copyright (c) 2024 The vkcompute developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

#![cfg(test)]

/// Creates a host HAL, a host compiler, and a device and queue on top of them.
///
/// Evaluates to `(Arc<HostHal>, Arc<HostCompiler>, Arc<Device>, Arc<Queue>)`.
macro_rules! host_device {
    () => {
        host_device!($crate::hal::host::HostHalCreateInfo::default())
    };
    ($create_info:expr) => {{
        let _ = env_logger::builder().is_test(true).try_init();

        let host = std::sync::Arc::new($crate::hal::host::HostHal::new($create_info));
        let compiler = std::sync::Arc::new($crate::hal::host::HostCompiler::new());
        let (device, queue) = $crate::device::Device::new(
            host.clone(),
            compiler.clone(),
            $crate::device::DeviceCreateInfo::default(),
        )
        .unwrap();

        (host, compiler, device, queue)
    }};
}

/// Creates a compute pipeline whose single set has `$bindings` storage buffers at bindings
/// `0..$bindings`, with a push-constant block of `$push_constants` bytes.
///
/// Evaluates to `(Arc<ComputePipeline>, Arc<DescriptorSetLayout>)`.
macro_rules! storage_pipeline {
    ($device:expr, $entry_point:expr, $bindings:expr) => {
        storage_pipeline!($device, $entry_point, $bindings, 0, [1, 1, 1])
    };
    ($device:expr, $entry_point:expr, $bindings:expr, $push_constants:expr, $workgroup_size:expr) => {{
        use $crate::{
            descriptor_set::{
                DescriptorSetLayout, DescriptorSetLayoutBinding, DescriptorSetLayoutCreateInfo,
                DescriptorType,
            },
            pipeline::{
                ComputePipeline, ComputePipelineCreateInfo, PipelineLayout,
                PipelineLayoutCreateInfo, PushConstantRange,
            },
            shader::{ShaderModule, ShaderModuleCreateInfo},
        };

        let device: std::sync::Arc<$crate::device::Device> = $device.clone();
        let entry_point: &str = $entry_point;
        let push_constants: u32 = $push_constants;

        let set_layout = DescriptorSetLayout::new(
            device.clone(),
            DescriptorSetLayoutCreateInfo {
                bindings: (0..$bindings)
                    .map(|binding| {
                        (
                            binding,
                            DescriptorSetLayoutBinding::descriptor_type(
                                DescriptorType::StorageBuffer,
                            ),
                        )
                    })
                    .collect(),
                ..Default::default()
            },
        )
        .unwrap();
        let layout = PipelineLayout::new(
            device.clone(),
            PipelineLayoutCreateInfo {
                set_layouts: vec![set_layout.clone()],
                push_constant_ranges: if push_constants == 0 {
                    Vec::new()
                } else {
                    vec![PushConstantRange {
                        offset: 0,
                        size: push_constants,
                    }]
                },
                ..Default::default()
            },
        )
        .unwrap();
        let module =
            ShaderModule::new(device.clone(), ShaderModuleCreateInfo::new(entry_point.as_bytes()))
                .unwrap();
        let pipeline = ComputePipeline::new(
            device,
            ComputePipelineCreateInfo {
                workgroup_size: $workgroup_size,
                ..ComputePipelineCreateInfo::new(module, entry_point, layout)
            },
        )
        .unwrap();

        (pipeline, set_layout)
    }};
}
