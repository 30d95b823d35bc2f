// Copyright (c) 2024 The vkcompute developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use common::{
    context, context_with, descriptor_set, pipeline, primary, secondary, submit_and_wait,
    zeroed_buffer,
};
use std::sync::Arc;
use vkcompute::{
    buffer::Buffer,
    command_buffer::{
        BufferCopy, CommandBuffer, CommandBufferBeginInfo, CommandBufferResetFlags,
    },
    descriptor_set::{DescriptorBufferInfo, DescriptorSet, WriteDescriptorSet},
    hal::host::HostHalCreateInfo,
    pipeline::ComputePipeline,
    sync::{DependencyFlags, PipelineStages},
};

mod common;

#[test]
fn buffer_sizes_follow_binding_order() {
    let ctx = context();
    let small = zeroed_buffer(&ctx.device, 4);
    let medium = zeroed_buffer(&ctx.device, 8);
    let out = zeroed_buffer(&ctx.device, 16);

    let (copy_sizes, layout) = pipeline(&ctx.device, "copy_sizes", 3, 0, [1, 1, 1]);
    let set = DescriptorSet::new(
        layout,
        [
            WriteDescriptorSet::buffer(0, small),
            WriteDescriptorSet::buffer_with_range(
                1,
                DescriptorBufferInfo {
                    buffer: medium,
                    range: 8..20,
                },
            ),
            WriteDescriptorSet::buffer(2, out.clone()),
        ],
    )
    .unwrap();

    let mut cb = primary(&ctx.pool);
    cb.begin(CommandBufferBeginInfo::default()).unwrap();
    cb.bind_pipeline_compute(copy_sizes.clone())
        .unwrap()
        .bind_descriptor_sets(copy_sizes.layout().clone(), 0, [set], [])
        .unwrap()
        .dispatch([1, 1, 1])
        .unwrap();
    cb.end().unwrap();
    submit_and_wait(&ctx.queue, &mut cb);

    let sizes = out.read_u32s().unwrap();
    assert_eq!(sizes[..3], [16, 12, 64]);
    assert!(sizes[3..].iter().all(|&size| size == 0));
}

#[test]
fn push_constants_follow_program_order() {
    let ctx = context();
    let out = zeroed_buffer(&ctx.device, 3);
    let (store_push, layout) = pipeline(&ctx.device, "store_push", 1, 8, [1, 1, 1]);
    let set = descriptor_set(&layout, &[&out]);
    let pipeline_layout = store_push.layout().clone();

    let mut cb = primary(&ctx.pool);
    cb.begin(CommandBufferBeginInfo::default()).unwrap();
    cb.bind_pipeline_compute(store_push.clone())
        .unwrap()
        .bind_descriptor_sets(pipeline_layout.clone(), 0, [set], [])
        .unwrap()
        .push_constants(pipeline_layout.clone(), 0, bytemuck::cast_slice(&[10u32, 0]))
        .unwrap()
        .dispatch([1, 1, 1])
        .unwrap()
        .push_constants(pipeline_layout.clone(), 0, bytemuck::cast_slice(&[20u32, 1]))
        .unwrap()
        .dispatch([1, 1, 1])
        .unwrap()
        // Only the first word changes.
        .push_constants(pipeline_layout, 0, bytemuck::bytes_of(&30u32))
        .unwrap()
        .dispatch([1, 1, 1])
        .unwrap();
    cb.end().unwrap();
    submit_and_wait(&ctx.queue, &mut cb);

    assert_eq!(out.read_u32s().unwrap(), [10, 30, 0]);
}

fn record_write_increment(
    cb: &mut CommandBuffer,
    write: &Arc<ComputePipeline>,
    write_set: &Arc<DescriptorSet>,
    increment: &Arc<ComputePipeline>,
    increment_set: &Arc<DescriptorSet>,
) {
    cb.begin(CommandBufferBeginInfo::default()).unwrap();
    cb.bind_pipeline_compute(write.clone())
        .unwrap()
        .bind_descriptor_sets(write.layout().clone(), 0, [write_set.clone()], [])
        .unwrap()
        .dispatch([1, 1, 1])
        .unwrap()
        .pipeline_barrier(
            PipelineStages::COMPUTE_SHADER,
            PipelineStages::COMPUTE_SHADER,
            DependencyFlags::empty(),
        )
        .unwrap()
        .bind_pipeline_compute(increment.clone())
        .unwrap()
        .bind_descriptor_sets(increment.layout().clone(), 0, [increment_set.clone()], [])
        .unwrap()
        .dispatch([1, 1, 1])
        .unwrap();
    cb.end().unwrap();
}

#[test]
fn reset_command_buffer_behaves_like_a_fresh_one() {
    let ctx = context();
    let (write, write_layout) = pipeline(&ctx.device, "write_42", 1, 0, [1, 1, 1]);
    let (increment, increment_layout) = pipeline(&ctx.device, "increment", 2, 0, [1, 1, 1]);

    let buffers: Vec<_> = (0..4).map(|_| zeroed_buffer(&ctx.device, 1)).collect();
    let first_write = descriptor_set(&write_layout, &[&buffers[0]]);
    let first_increment = descriptor_set(&increment_layout, &[&buffers[0], &buffers[1]]);
    let second_write = descriptor_set(&write_layout, &[&buffers[2]]);
    let second_increment = descriptor_set(&increment_layout, &[&buffers[2], &buffers[3]]);

    let mut used = primary(&ctx.pool);
    let objects_after_allocation = ctx.host.live_object_count();

    record_write_increment(
        &mut used,
        &write,
        &first_write,
        &increment,
        &first_increment,
    );
    submit_and_wait(&ctx.queue, &mut used);
    assert_eq!(buffers[1].read_u32s().unwrap(), [43]);

    used.reset(CommandBufferResetFlags::RELEASE_RESOURCES)
        .unwrap();
    assert_eq!(used.barrier_group_count(), 0);
    assert_eq!(ctx.host.live_object_count(), objects_after_allocation);

    // An empty recording does nothing.
    buffers[1].write(0, &[0; 4]).unwrap();
    used.begin(CommandBufferBeginInfo::default()).unwrap();
    used.end().unwrap();
    submit_and_wait(&ctx.queue, &mut used);
    assert_eq!(buffers[1].read_u32s().unwrap(), [0]);

    let mut fresh = primary(&ctx.pool);
    record_write_increment(
        &mut used,
        &write,
        &second_write,
        &increment,
        &second_increment,
    );
    record_write_increment(
        &mut fresh,
        &write,
        &first_write,
        &increment,
        &first_increment,
    );
    assert_eq!(used.barrier_group_count(), fresh.barrier_group_count());

    submit_and_wait(&ctx.queue, &mut used);
    submit_and_wait(&ctx.queue, &mut fresh);

    assert_eq!(buffers[1].read_u32s().unwrap(), [43]);
    assert_eq!(buffers[3].read_u32s().unwrap(), [43]);
}

fn record_pipeline_work(
    cb: &mut CommandBuffer,
    add_one: &Arc<ComputePipeline>,
    set: Arc<DescriptorSet>,
    data: &Arc<Buffer>,
    out: &Arc<Buffer>,
) {
    cb.fill_buffer(data.clone(), 0, 16, 3)
        .unwrap()
        .pipeline_barrier(
            PipelineStages::TRANSFER,
            PipelineStages::COMPUTE_SHADER,
            DependencyFlags::empty(),
        )
        .unwrap()
        .bind_pipeline_compute(add_one.clone())
        .unwrap()
        .bind_descriptor_sets(add_one.layout().clone(), 0, [set], [])
        .unwrap()
        .dispatch([1, 1, 1])
        .unwrap()
        .pipeline_barrier(
            PipelineStages::COMPUTE_SHADER,
            PipelineStages::TRANSFER,
            DependencyFlags::empty(),
        )
        .unwrap()
        .copy_buffer(
            data.clone(),
            out.clone(),
            [BufferCopy {
                size: 16,
                ..Default::default()
            }],
        )
        .unwrap();
}

#[test]
fn secondary_command_buffers_replay_like_direct_recording() {
    let ctx = context();
    let (add_one, layout) = pipeline(&ctx.device, "add_one", 1, 0, [4, 1, 1]);

    let direct_data = zeroed_buffer(&ctx.device, 4);
    let direct_out = zeroed_buffer(&ctx.device, 4);
    let mut direct = primary(&ctx.pool);
    direct.begin(CommandBufferBeginInfo::default()).unwrap();
    record_pipeline_work(
        &mut direct,
        &add_one,
        descriptor_set(&layout, &[&direct_data]),
        &direct_data,
        &direct_out,
    );
    direct.end().unwrap();

    let replayed_data = zeroed_buffer(&ctx.device, 4);
    let replayed_out = zeroed_buffer(&ctx.device, 4);
    let mut inner = secondary(&ctx.pool);
    inner.begin(CommandBufferBeginInfo::default()).unwrap();
    record_pipeline_work(
        &mut inner,
        &add_one,
        descriptor_set(&layout, &[&replayed_data]),
        &replayed_data,
        &replayed_out,
    );
    inner.end().unwrap();

    let mut replayed = primary(&ctx.pool);
    replayed.begin(CommandBufferBeginInfo::default()).unwrap();
    replayed.execute_commands(&[&inner]).unwrap();
    replayed.end().unwrap();

    assert_eq!(direct.barrier_group_count(), replayed.barrier_group_count());

    submit_and_wait(&ctx.queue, &mut direct);
    submit_and_wait(&ctx.queue, &mut replayed);

    assert_eq!(direct_out.read_u32s().unwrap(), [4; 4]);
    assert_eq!(
        replayed_out.read_u32s().unwrap(),
        direct_out.read_u32s().unwrap(),
    );
}

#[test]
fn non_coherent_uploads_reach_the_kernel() {
    let ctx = context_with(HostHalCreateInfo {
        host_coherent: false,
        ..Default::default()
    });
    assert!(!ctx.device.properties().host_coherent_memory);

    let pushed = zeroed_buffer(&ctx.device, 2);
    let (store_push, push_layout) = pipeline(&ctx.device, "store_push", 1, 8, [1, 1, 1]);
    let push_set = descriptor_set(&push_layout, &[&pushed]);

    let sized = zeroed_buffer(&ctx.device, 3);
    let sizes = zeroed_buffer(&ctx.device, 2);
    let (copy_sizes, sizes_layout) = pipeline(&ctx.device, "copy_sizes", 2, 0, [1, 1, 1]);
    let sizes_set = descriptor_set(&sizes_layout, &[&sized, &sizes]);

    let mut cb = primary(&ctx.pool);
    cb.begin(CommandBufferBeginInfo::default()).unwrap();
    cb.bind_pipeline_compute(store_push.clone())
        .unwrap()
        .bind_descriptor_sets(store_push.layout().clone(), 0, [push_set], [])
        .unwrap()
        .push_constants(
            store_push.layout().clone(),
            0,
            bytemuck::cast_slice(&[7u32, 1]),
        )
        .unwrap()
        .dispatch([1, 1, 1])
        .unwrap()
        .bind_pipeline_compute(copy_sizes.clone())
        .unwrap()
        .bind_descriptor_sets(copy_sizes.layout().clone(), 0, [sizes_set], [])
        .unwrap()
        .dispatch([1, 1, 1])
        .unwrap();
    cb.end().unwrap();
    submit_and_wait(&ctx.queue, &mut cb);

    assert_eq!(pushed.read_u32s().unwrap(), [0, 7]);
    assert_eq!(sizes.read_u32s().unwrap(), [12, 8]);
}
