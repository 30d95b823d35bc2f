// Copyright (c) 2024 The vkcompute developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! An event provides fine-grained synchronization within a command buffer, or between the host
//! and a command buffer.
//!
//! An event is either signaled or unsignaled. The host can change its state with [`Event::set`]
//! and [`Event::reset`]; a command buffer can do the same with its `set_event` and `reset_event`
//! commands, in which case the state changes when the device reaches the command. A command
//! buffer's `wait_events` command blocks the device until the events are signaled.
//!
//! Each event also remembers the stages it was last set at. A wait only blocks on events that
//! can possibly be set by the stages it waits for, so an event that was never set at any of
//! those stages never holds up a wait.

use super::PipelineStages;
use crate::{device::Device, macros::impl_id_counter, DeviceOwned, Validated, VulkanError};
use parking_lot::{Condvar, Mutex};
use std::{num::NonZeroU64, sync::Arc};

/// Used to block the device until an event on the host or earlier in a command buffer occurs.
#[derive(Debug)]
pub struct Event {
    device: Arc<Device>,
    id: NonZeroU64,
    state: Mutex<EventState>,
}

impl Event {
    /// Creates a new `Event`, in the unsignaled state.
    pub fn new(
        device: Arc<Device>,
        create_info: EventCreateInfo,
    ) -> Result<Arc<Event>, Validated<VulkanError>> {
        let EventCreateInfo { _ne: _ } = create_info;

        Ok(Arc::new(Event {
            device,
            id: Self::next_id(),
            state: Mutex::new(EventState::default()),
        }))
    }

    /// Returns whether the event is signaled.
    #[inline]
    pub fn is_signaled(&self) -> bool {
        self.state.lock().signaled
    }

    /// Returns the stages the event was last set at. Empty if it was never set.
    #[inline]
    pub fn set_stages(&self) -> PipelineStages {
        self.state.lock().set_stages
    }

    /// Changes the event to the signaled state from the host.
    ///
    /// Command buffers waiting on the event are unblocked.
    pub fn set(&self) {
        let mut state = self.state.lock();
        state.set_stages = PipelineStages::HOST;
        state.signal();
    }

    /// Changes the event to the unsignaled state from the host.
    pub fn reset(&self) {
        self.state.lock().signaled = false;
    }

    /// Records the stages that a command buffer sets the event at. Called when the `set_event`
    /// command is written into a HAL command buffer, ahead of the device executing it.
    pub(crate) fn record_set_stages(&self, stages: PipelineStages) {
        self.state.lock().set_stages = stages;
    }

    /// Signals the event from the device timeline.
    pub(crate) fn set_from_device(&self) {
        self.state.lock().signal();
    }

    /// Unsignals the event from the device timeline.
    pub(crate) fn reset_from_device(&self) {
        self.state.lock().signaled = false;
    }

    /// Returns whether a wait with source stages `src_stages` can be satisfied by this event.
    ///
    /// That is the case if the wait names every stage or the host, or the event was last set at
    /// one of the stages in `src_stages`. Whether the event is signaled is only decided when the
    /// device reaches the wait.
    pub(crate) fn is_relevant_to(&self, src_stages: PipelineStages) -> bool {
        src_stages.intersects(PipelineStages::ALL_COMMANDS | PipelineStages::HOST)
            || self
                .state
                .lock()
                .set_stages
                .intersects(src_stages.expand_first_scope())
    }

    /// Adds `registration` to the waiters of the event. Returns `false` without registering if
    /// the event is already signaled.
    fn register(&self, registration: &Arc<WaitRegistration>) -> bool {
        let mut state = self.state.lock();

        if state.signaled {
            false
        } else {
            state.waiters.push(registration.clone());
            true
        }
    }
}

unsafe impl DeviceOwned for Event {
    #[inline]
    fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

impl_id_counter!(Event);

/// Parameters to create a new `Event`.
#[derive(Clone, Debug)]
pub struct EventCreateInfo {
    pub _ne: crate::NonExhaustive,
}

impl Default for EventCreateInfo {
    #[inline]
    fn default() -> Self {
        Self {
            _ne: crate::NonExhaustive(()),
        }
    }
}

#[derive(Debug, Default)]
struct EventState {
    signaled: bool,
    set_stages: PipelineStages,
    waiters: Vec<Arc<WaitRegistration>>,
}

impl EventState {
    fn signal(&mut self) {
        self.signaled = true;

        for waiter in self.waiters.drain(..) {
            waiter.notify();
        }
    }
}

/// A pending wait on a number of events. Each event it is registered with decrements the
/// counter once when it is signaled.
#[derive(Debug)]
struct WaitRegistration {
    outstanding: Mutex<usize>,
    condvar: Condvar,
}

impl WaitRegistration {
    fn notify(&self) {
        let mut outstanding = self.outstanding.lock();
        *outstanding = outstanding.saturating_sub(1);

        if *outstanding == 0 {
            self.condvar.notify_all();
        }
    }

    fn wait(&self) {
        let mut outstanding = self.outstanding.lock();

        while *outstanding != 0 {
            self.condvar.wait(&mut outstanding);
        }
    }
}

/// Blocks the calling thread until every event in `events` is signaled. Runs on the device
/// timeline, inside a HAL user callback.
pub(crate) fn wait_for_events(events: &[Arc<Event>]) {
    let registration = Arc::new(WaitRegistration {
        outstanding: Mutex::new(events.len()),
        condvar: Condvar::new(),
    });

    for event in events {
        if !event.register(&registration) {
            registration.notify();
        }
    }

    registration.wait();
}
