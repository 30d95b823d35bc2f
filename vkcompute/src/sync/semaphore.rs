// Copyright (c) 2024 The vkcompute developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use crate::{
    device::Device,
    hal::{HalSemaphore, RawSemaphore},
    macros::impl_id_counter,
    DeviceOwned, Validated, VulkanError, VulkanObject,
};
use std::{num::NonZeroU64, sync::Arc};

/// Used to provide synchronization between submissions on the device.
///
/// A semaphore is binary: a submission that waits on it consumes the signal of the submission
/// that signaled it.
#[derive(Debug)]
pub struct Semaphore {
    device: Arc<Device>,
    id: NonZeroU64,
    inner: HalSemaphore,
}

impl Semaphore {
    /// Creates a new `Semaphore`.
    pub fn new(
        device: Arc<Device>,
        create_info: SemaphoreCreateInfo,
    ) -> Result<Arc<Semaphore>, Validated<VulkanError>> {
        let SemaphoreCreateInfo { _ne: _ } = create_info;
        let inner = HalSemaphore::new(device.hal()).map_err(VulkanError::from)?;

        Ok(Arc::new(Semaphore {
            device,
            id: Self::next_id(),
            inner,
        }))
    }
}

unsafe impl DeviceOwned for Semaphore {
    #[inline]
    fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

impl VulkanObject for Semaphore {
    type Handle = RawSemaphore;

    #[inline]
    fn handle(&self) -> Self::Handle {
        self.inner.raw()
    }
}

impl_id_counter!(Semaphore);

/// Parameters to create a new `Semaphore`.
#[derive(Clone, Debug)]
pub struct SemaphoreCreateInfo {
    pub _ne: crate::NonExhaustive,
}

impl Default for SemaphoreCreateInfo {
    #[inline]
    fn default() -> Self {
        Self {
            _ne: crate::NonExhaustive(()),
        }
    }
}
