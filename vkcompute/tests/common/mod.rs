// Copyright (c) 2024 The vkcompute developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

#![allow(dead_code)]

use std::{sync::Arc, time::Duration};
use vkcompute::{
    buffer::Buffer,
    command_buffer::{
        CommandBuffer, CommandBufferAllocateInfo, CommandBufferLevel, CommandPool,
        CommandPoolCreateFlags, CommandPoolCreateInfo, SubmitInfo,
    },
    descriptor_set::{
        DescriptorSet, DescriptorSetLayout, DescriptorSetLayoutBinding,
        DescriptorSetLayoutCreateInfo, DescriptorType, WriteDescriptorSet,
    },
    device::{Device, DeviceCreateInfo, Queue},
    hal::host::{HostArgKind, HostCompiler, HostHal, HostHalCreateInfo},
    pipeline::{
        ComputePipeline, ComputePipelineCreateInfo, PipelineLayout, PipelineLayoutCreateInfo,
        PushConstantRange,
    },
    shader::{ShaderModule, ShaderModuleCreateInfo},
    sync::{Fence, FenceCreateInfo},
    DeviceOwned,
};

pub const TIMEOUT: Duration = Duration::from_secs(10);

pub struct Context {
    pub host: Arc<HostHal>,
    pub compiler: Arc<HostCompiler>,
    pub device: Arc<Device>,
    pub queue: Arc<Queue>,
    pub pool: Arc<CommandPool>,
}

/// Creates a device on a host HAL, with the kernels every test uses already registered.
pub fn context() -> Context {
    context_with(HostHalCreateInfo::default())
}

pub fn context_with(create_info: HostHalCreateInfo) -> Context {
    let _ = env_logger::builder().is_test(true).try_init();

    let host = Arc::new(HostHal::new(create_info));
    let compiler = Arc::new(HostCompiler::new());
    let (device, queue) =
        Device::new(host.clone(), compiler.clone(), DeviceCreateInfo::default()).unwrap();
    let pool = CommandPool::new(
        device.clone(),
        CommandPoolCreateInfo {
            flags: CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            ..Default::default()
        },
    )
    .unwrap();

    register_kernels(&host);

    Context {
        host,
        compiler,
        device,
        queue,
        pool,
    }
}

fn register_kernels(host: &HostHal) {
    // Writes 42 to the first word of binding 0.
    host.register_kernel("write_42", |inv| inv.arg(0).write_u32(0, 42));

    // Binding 1 receives the first word of binding 0, plus one.
    host.register_kernel("increment", |inv| {
        let value = inv.arg(0).read_u32(0);
        inv.arg(1).write_u32(0, value + 1);
    });

    // Adds one to every word of binding 0, once per work item.
    host.register_kernel("add_one", |inv| {
        let buffer = inv.arg(0);

        for [x, _, _] in inv.global_ids() {
            let index = x as usize;
            buffer.write_u32(index, buffer.read_u32(index) + 1);
        }
    });

    // Copies the buffer-size array into the last bound buffer.
    host.register_kernel("copy_sizes", |inv| {
        let sizes = inv.arg_of_kind(HostArgKind::BufferSizes).unwrap();
        let out = inv
            .args()
            .iter()
            .rev()
            .find(|arg| arg.kind() == HostArgKind::Buffer)
            .unwrap();

        for index in 0..(sizes.len() / 4) as usize {
            out.write_u32(index, sizes.read_u32(index));
        }
    });

    // Writes push constant word 0 to the word of binding 0 named by push constant word 1.
    host.register_kernel("store_push", |inv| {
        let push_constants = inv.arg_of_kind(HostArgKind::PushConstants).unwrap();
        inv.arg(0)
            .write_u32(push_constants.read_u32(1) as usize, push_constants.read_u32(0));
    });
}

/// Creates a pipeline running `entry_point`, whose single set has `bindings` storage buffers.
pub fn pipeline(
    device: &Arc<Device>,
    entry_point: &str,
    bindings: u32,
    push_constants: u32,
    workgroup_size: [u32; 3],
) -> (Arc<ComputePipeline>, Arc<DescriptorSetLayout>) {
    let set_layout = DescriptorSetLayout::new(
        device.clone(),
        DescriptorSetLayoutCreateInfo {
            bindings: (0..bindings)
                .map(|binding| {
                    (
                        binding,
                        DescriptorSetLayoutBinding::descriptor_type(DescriptorType::StorageBuffer),
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
    let module = ShaderModule::new(
        device.clone(),
        ShaderModuleCreateInfo::new(entry_point.as_bytes()),
    )
    .unwrap();
    let pipeline = ComputePipeline::new(
        device.clone(),
        ComputePipelineCreateInfo {
            workgroup_size,
            ..ComputePipelineCreateInfo::new(module, entry_point, layout)
        },
    )
    .unwrap();

    (pipeline, set_layout)
}

/// Creates a descriptor set writing `buffers` to bindings `0..buffers.len()`.
pub fn descriptor_set(
    layout: &Arc<DescriptorSetLayout>,
    buffers: &[&Arc<Buffer>],
) -> Arc<DescriptorSet> {
    DescriptorSet::new(
        layout.clone(),
        buffers
            .iter()
            .enumerate()
            .map(|(binding, &buffer)| WriteDescriptorSet::buffer(binding as u32, buffer.clone())),
    )
    .unwrap()
}

pub fn zeroed_buffer(device: &Arc<Device>, words: usize) -> Arc<Buffer> {
    Buffer::from_data(device.clone(), &vec![0u8; words * 4]).unwrap()
}

pub fn primary(pool: &Arc<CommandPool>) -> CommandBuffer {
    pool.allocate_command_buffers(CommandBufferAllocateInfo::default())
        .unwrap()
        .remove(0)
}

pub fn secondary(pool: &Arc<CommandPool>) -> CommandBuffer {
    pool.allocate_command_buffers(CommandBufferAllocateInfo {
        level: CommandBufferLevel::Secondary,
        ..Default::default()
    })
    .unwrap()
    .remove(0)
}

pub fn fence(device: &Arc<Device>) -> Arc<Fence> {
    Fence::new(device.clone(), FenceCreateInfo::default()).unwrap()
}

/// Submits `command_buffer` and waits for it to finish.
pub fn submit_and_wait(queue: &Queue, command_buffer: &mut CommandBuffer) {
    let fence = fence(queue.device());
    queue
        .submit(
            command_buffer,
            SubmitInfo {
                fence: Some(fence.clone()),
                ..Default::default()
            },
        )
        .unwrap();
    fence.wait(Some(TIMEOUT)).unwrap();
}
