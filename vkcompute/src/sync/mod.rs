// Copyright (c) 2024 The vkcompute developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Synchronization between the host, the device, and the parts of a submission.
//!
//! There are three kinds of synchronization objects:
//!
//! - [`Fence`]s are signaled by the device when a submission has finished executing, and can be
//!   waited on by the host.
//! - [`Semaphore`]s order submissions against each other on the device. A submission can wait on
//!   semaphores that an earlier submission signals.
//! - [`Event`]s can be set and reset by the host or by a command buffer, and waited on by a command
//!   buffer. A wait blocks the device, never the host thread that records it.
//!
//! Within a command buffer, pipeline barriers order the commands recorded before the barrier
//! against those recorded after it. They are described with [`PipelineStages`] masks.

pub use self::{
    event::{Event, EventCreateInfo},
    fence::{Fence, FenceCreateInfo},
    pipeline::{DependencyFlags, PipelineStages},
    semaphore::{Semaphore, SemaphoreCreateInfo},
};

pub(crate) mod event;
mod fence;
mod pipeline;
mod semaphore;
