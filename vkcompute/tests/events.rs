// Copyright (c) 2024 The vkcompute developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use common::{
    context, descriptor_set, fence, pipeline, primary, submit_and_wait, zeroed_buffer, TIMEOUT,
};
use std::{thread, time::Duration};
use vkcompute::{
    command_buffer::{BufferCopy, CommandBufferBeginInfo, SubmitInfo},
    sync::{DependencyFlags, Event, PipelineStages},
    VulkanError,
};

mod common;

#[test]
fn wait_ignores_events_set_at_other_stages() {
    let ctx = context();
    let never_set = Event::new(ctx.device.clone(), Default::default()).unwrap();
    let out = zeroed_buffer(&ctx.device, 1);
    let (write, layout) = pipeline(&ctx.device, "write_42", 1, 0, [1, 1, 1]);
    let set = descriptor_set(&layout, &[&out]);

    let mut cb = primary(&ctx.pool);
    cb.begin(CommandBufferBeginInfo::default()).unwrap();
    cb.wait_events(
        [never_set.clone()],
        PipelineStages::TRANSFER,
        PipelineStages::COMPUTE_SHADER,
    )
    .unwrap()
    .bind_pipeline_compute(write.clone())
    .unwrap()
    .bind_descriptor_sets(write.layout().clone(), 0, [set], [])
    .unwrap()
    .dispatch([1, 1, 1])
    .unwrap();
    cb.end().unwrap();

    let fence = fence(&ctx.device);
    ctx.queue
        .submit(
            &mut cb,
            SubmitInfo {
                fence: Some(fence.clone()),
                ..Default::default()
            },
        )
        .unwrap();

    fence.wait(Some(TIMEOUT)).unwrap();
    assert!(!never_set.is_signaled());
    assert_eq!(out.read_u32s().unwrap(), [42]);
}

#[test]
fn host_set_event_releases_the_device() {
    let ctx = context();
    let gate = Event::new(ctx.device.clone(), Default::default()).unwrap();
    let out = zeroed_buffer(&ctx.device, 1);
    let (write, layout) = pipeline(&ctx.device, "write_42", 1, 0, [1, 1, 1]);
    let set = descriptor_set(&layout, &[&out]);

    let mut cb = primary(&ctx.pool);
    cb.begin(CommandBufferBeginInfo::default()).unwrap();
    cb.wait_events(
        [gate.clone()],
        PipelineStages::HOST,
        PipelineStages::COMPUTE_SHADER,
    )
    .unwrap()
    .bind_pipeline_compute(write.clone())
    .unwrap()
    .bind_descriptor_sets(write.layout().clone(), 0, [set], [])
    .unwrap()
    .dispatch([1, 1, 1])
    .unwrap();
    cb.end().unwrap();

    let fence = fence(&ctx.device);
    ctx.queue
        .submit(
            &mut cb,
            SubmitInfo {
                fence: Some(fence.clone()),
                ..Default::default()
            },
        )
        .unwrap();

    assert_eq!(
        fence.wait(Some(Duration::from_millis(50))),
        Err(VulkanError::Timeout),
    );
    assert_eq!(out.read_u32s().unwrap(), [0]);

    gate.set();

    fence.wait(Some(TIMEOUT)).unwrap();
    assert_eq!(out.read_u32s().unwrap(), [42]);
}

#[test]
fn device_set_event_orders_later_work() {
    let ctx = context();
    ctx.host.register_kernel("slow_write", |inv| {
        thread::sleep(Duration::from_millis(30));
        inv.arg(0).write_u32(0, 7);
    });

    let event = Event::new(ctx.device.clone(), Default::default()).unwrap();
    let src = zeroed_buffer(&ctx.device, 1);
    let dst = zeroed_buffer(&ctx.device, 1);
    let (slow_write, layout) = pipeline(&ctx.device, "slow_write", 1, 0, [1, 1, 1]);
    let set = descriptor_set(&layout, &[&src]);

    let mut cb = primary(&ctx.pool);
    cb.begin(CommandBufferBeginInfo::default()).unwrap();
    cb.bind_pipeline_compute(slow_write.clone())
        .unwrap()
        .bind_descriptor_sets(slow_write.layout().clone(), 0, [set], [])
        .unwrap()
        .dispatch([1, 1, 1])
        .unwrap()
        .set_event(event.clone(), PipelineStages::COMPUTE_SHADER)
        .unwrap()
        .wait_events(
            [event.clone()],
            PipelineStages::COMPUTE_SHADER,
            PipelineStages::TRANSFER,
        )
        .unwrap()
        .copy_buffer(
            src.clone(),
            dst.clone(),
            [BufferCopy {
                size: 4,
                ..Default::default()
            }],
        )
        .unwrap();
    cb.end().unwrap();

    let fence = fence(&ctx.device);
    ctx.queue
        .submit(
            &mut cb,
            SubmitInfo {
                fence: Some(fence.clone()),
                ..Default::default()
            },
        )
        .unwrap();
    fence.wait(Some(TIMEOUT)).unwrap();

    assert!(event.is_signaled());
    assert_eq!(event.set_stages(), PipelineStages::COMPUTE_SHADER);
    assert_eq!(dst.read_u32s().unwrap(), [7]);
}

#[test]
fn events_after_a_barrier_land_in_its_group() {
    let ctx = context();
    let event = Event::new(ctx.device.clone(), Default::default()).unwrap();
    let data = zeroed_buffer(&ctx.device, 1);

    let mut cb = primary(&ctx.pool);
    cb.begin(CommandBufferBeginInfo::default()).unwrap();
    cb.fill_buffer(data.clone(), 0, 4, 1)
        .unwrap()
        .pipeline_barrier(
            PipelineStages::TRANSFER,
            PipelineStages::TRANSFER,
            DependencyFlags::empty(),
        )
        .unwrap()
        .fill_buffer(data.clone(), 0, 4, 2)
        .unwrap()
        .set_event(event.clone(), PipelineStages::TRANSFER)
        .unwrap()
        .reset_event(event.clone(), PipelineStages::TRANSFER)
        .unwrap()
        .set_event(event.clone(), PipelineStages::ALL_COMMANDS)
        .unwrap();
    cb.end().unwrap();

    let fence = fence(&ctx.device);
    ctx.queue
        .submit(
            &mut cb,
            SubmitInfo {
                fence: Some(fence.clone()),
                ..Default::default()
            },
        )
        .unwrap();
    fence.wait(Some(TIMEOUT)).unwrap();

    assert!(event.is_signaled());
    assert_eq!(data.read_u32s().unwrap(), [2]);

    event.reset();
    assert!(!event.is_signaled());
}

#[test]
fn resubmission_waits_again_after_a_host_reset() {
    let ctx = context();
    let gate = Event::new(ctx.device.clone(), Default::default()).unwrap();
    let out = zeroed_buffer(&ctx.device, 1);
    let (write, layout) = pipeline(&ctx.device, "write_42", 1, 0, [1, 1, 1]);
    let set = descriptor_set(&layout, &[&out]);

    let mut cb = primary(&ctx.pool);
    cb.begin(CommandBufferBeginInfo::default()).unwrap();
    cb.wait_events(
        [gate.clone()],
        PipelineStages::HOST,
        PipelineStages::COMPUTE_SHADER,
    )
    .unwrap()
    .bind_pipeline_compute(write.clone())
    .unwrap()
    .bind_descriptor_sets(write.layout().clone(), 0, [set], [])
    .unwrap()
    .dispatch([1, 1, 1])
    .unwrap();
    cb.end().unwrap();

    // Already signaled when the commands are first written out.
    gate.set();
    submit_and_wait(&ctx.queue, &mut cb);
    assert_eq!(out.read_u32s().unwrap(), [42]);

    gate.reset();
    out.write(0, &[0; 4]).unwrap();

    let fence = fence(&ctx.device);
    ctx.queue
        .submit(
            &mut cb,
            SubmitInfo {
                fence: Some(fence.clone()),
                ..Default::default()
            },
        )
        .unwrap();

    assert_eq!(
        fence.wait(Some(Duration::from_millis(50))),
        Err(VulkanError::Timeout),
    );
    assert_eq!(out.read_u32s().unwrap(), [0]);

    gate.set();
    fence.wait(Some(TIMEOUT)).unwrap();
    assert_eq!(out.read_u32s().unwrap(), [42]);
}

#[test]
fn barrier_keeps_earlier_commands_ahead_of_the_ones_it_writes_out() {
    let ctx = context();
    let gate = Event::new(ctx.device.clone(), Default::default()).unwrap();
    let copied = Event::new(ctx.device.clone(), Default::default()).unwrap();
    let src = zeroed_buffer(&ctx.device, 1);
    let dst = zeroed_buffer(&ctx.device, 1);

    let mut cb = primary(&ctx.pool);
    cb.begin(CommandBufferBeginInfo::default()).unwrap();
    cb.fill_buffer(src.clone(), 0, 4, 7)
        .unwrap()
        .wait_events(
            [gate.clone()],
            PipelineStages::HOST,
            PipelineStages::TRANSFER,
        )
        .unwrap()
        .copy_buffer(
            src.clone(),
            dst.clone(),
            [BufferCopy {
                size: 4,
                ..Default::default()
            }],
        )
        .unwrap()
        // Only this one is in the source scope of the barrier.
        .set_event(
            copied.clone(),
            PipelineStages::COMPUTE_SHADER | PipelineStages::TRANSFER,
        )
        .unwrap()
        .pipeline_barrier(
            PipelineStages::COMPUTE_SHADER,
            PipelineStages::COMPUTE_SHADER,
            DependencyFlags::empty(),
        )
        .unwrap();
    cb.end().unwrap();

    let fence = fence(&ctx.device);
    ctx.queue
        .submit(
            &mut cb,
            SubmitInfo {
                fence: Some(fence.clone()),
                ..Default::default()
            },
        )
        .unwrap();

    assert_eq!(
        fence.wait(Some(Duration::from_millis(50))),
        Err(VulkanError::Timeout),
    );
    assert!(!copied.is_signaled());
    assert_eq!(dst.read_u32s().unwrap(), [0]);

    gate.set();
    fence.wait(Some(TIMEOUT)).unwrap();

    assert!(copied.is_signaled());
    assert_eq!(dst.read_u32s().unwrap(), [7]);
}
