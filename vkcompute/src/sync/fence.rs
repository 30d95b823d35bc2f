// Copyright (c) 2024 The vkcompute developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! A fence provides synchronization between the device and the host, or between submissions.

use crate::{
    device::Device,
    hal::{HalFence, RawFence},
    macros::impl_id_counter,
    DeviceOwned, Validated, VulkanError, VulkanObject,
};
use std::{num::NonZeroU64, sync::Arc, time::Duration};

/// A two-state synchronization primitive that is signaled by the device and waited on by the
/// host.
#[derive(Debug)]
pub struct Fence {
    device: Arc<Device>,
    id: NonZeroU64,
    inner: HalFence,
}

impl Fence {
    /// Creates a new `Fence`.
    pub fn new(
        device: Arc<Device>,
        create_info: FenceCreateInfo,
    ) -> Result<Arc<Fence>, Validated<VulkanError>> {
        let FenceCreateInfo { signaled, _ne: _ } = create_info;
        let inner = HalFence::new(device.hal(), signaled).map_err(VulkanError::from)?;

        Ok(Arc::new(Fence {
            device,
            id: Self::next_id(),
            inner,
        }))
    }

    /// Returns true if the fence is signaled.
    #[inline]
    pub fn is_signaled(&self) -> Result<bool, VulkanError> {
        self.inner.is_signaled().map_err(Into::into)
    }

    /// Waits until the fence is signaled, or at least until the timeout duration has elapsed.
    ///
    /// Returns [`VulkanError::Timeout`] if the timeout elapsed first. If you pass a duration of
    /// 0, then the function will return without blocking.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<(), VulkanError> {
        if self.inner.wait(timeout)? {
            Ok(())
        } else {
            Err(VulkanError::Timeout)
        }
    }

    /// Resets the fence.
    ///
    /// The fence must not be in use by a pending submission.
    #[inline]
    pub fn reset(&self) -> Result<(), VulkanError> {
        self.inner.reset().map_err(Into::into)
    }
}

unsafe impl DeviceOwned for Fence {
    #[inline]
    fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

impl VulkanObject for Fence {
    type Handle = RawFence;

    #[inline]
    fn handle(&self) -> Self::Handle {
        self.inner.raw()
    }
}

impl_id_counter!(Fence);

/// Parameters to create a new `Fence`.
#[derive(Clone, Debug)]
pub struct FenceCreateInfo {
    /// Whether the fence should be created in the signaled state.
    ///
    /// The default value is `false`.
    pub signaled: bool,

    pub _ne: crate::NonExhaustive,
}

impl Default for FenceCreateInfo {
    #[inline]
    fn default() -> Self {
        Self {
            signaled: false,
            _ne: crate::NonExhaustive(()),
        }
    }
}
