// Copyright (c) 2024 The vkcompute developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Location in memory that contains data.
//!
//! A `Buffer` is a HAL buffer with dedicated, host-visible memory bound to it. Kernels access
//! buffers through [descriptor sets](crate::descriptor_set), and transfer commands read and write
//! them directly. The host can read and write the contents with [`Buffer::read`] and
//! [`Buffer::write`], which map the memory for the duration of the call; the caller is
//! responsible for not doing so while the device is accessing the same range.

use crate::{
    device::Device,
    hal::{HalBuffer, RawBuffer},
    macros::impl_id_counter,
    DeviceOwned, DeviceSize, Validated, ValidationError, VulkanError, VulkanObject,
};
use std::{num::NonZeroU64, sync::Arc};

/// A buffer backed by dedicated device memory.
#[derive(Debug)]
pub struct Buffer {
    device: Arc<Device>,
    id: NonZeroU64,
    inner: HalBuffer,
}

impl Buffer {
    /// Creates a new `Buffer` and allocates memory for it.
    pub fn new(
        device: Arc<Device>,
        create_info: BufferCreateInfo,
    ) -> Result<Arc<Buffer>, Validated<VulkanError>> {
        create_info
            .validate()
            .map_err(|err| err.add_context("create_info"))?;

        let BufferCreateInfo { size, _ne: _ } = create_info;
        let inner = HalBuffer::new(device.hal(), size).map_err(VulkanError::from)?;

        Ok(Arc::new(Buffer {
            device,
            id: Self::next_id(),
            inner,
        }))
    }

    /// Creates a new `Buffer` holding `data`.
    pub fn from_data(
        device: Arc<Device>,
        data: &[u8],
    ) -> Result<Arc<Buffer>, Validated<VulkanError>> {
        let buffer = Buffer::new(
            device,
            BufferCreateInfo {
                size: data.len() as DeviceSize,
                ..Default::default()
            },
        )?;
        buffer.write(0, data)?;

        Ok(buffer)
    }

    /// Returns the size of the buffer in bytes.
    #[inline]
    pub fn size(&self) -> DeviceSize {
        self.inner.size()
    }

    /// Writes `data` into the buffer at `offset`.
    pub fn write(&self, offset: DeviceSize, data: &[u8]) -> Result<(), Validated<VulkanError>> {
        self.validate_range(offset, data.len() as DeviceSize)?;

        self.inner
            .memory()
            .upload(offset, data)
            .map_err(|err| Validated::Error(err.into()))
    }

    /// Reads `len` bytes of the buffer starting at `offset`.
    pub fn read(
        &self,
        offset: DeviceSize,
        len: DeviceSize,
    ) -> Result<Vec<u8>, Validated<VulkanError>> {
        self.validate_range(offset, len)?;

        let mut data = vec![0; len as usize];
        self.inner
            .memory()
            .download(offset, &mut data)
            .map_err(|err| Validated::Error(err.into()))?;

        Ok(data)
    }

    /// Reads the whole buffer as a vector of `u32`. Trailing bytes that don't fill a whole `u32`
    /// are ignored.
    pub fn read_u32s(&self) -> Result<Vec<u32>, Validated<VulkanError>> {
        let bytes = self.read(0, self.size())?;

        Ok(bytes
            .chunks_exact(4)
            .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect())
    }

    pub(crate) fn hal_buffer(&self) -> &HalBuffer {
        &self.inner
    }

    fn validate_range(
        &self,
        offset: DeviceSize,
        len: DeviceSize,
    ) -> Result<(), Box<ValidationError>> {
        if offset.checked_add(len).map_or(true, |end| end > self.size()) {
            return Err(Box::new(ValidationError {
                problem: format!(
                    "the range {}..{} is out of the bounds of the buffer (size {})",
                    offset,
                    offset.saturating_add(len),
                    self.size(),
                )
                .into(),
                ..Default::default()
            }));
        }

        Ok(())
    }
}

unsafe impl DeviceOwned for Buffer {
    #[inline]
    fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

impl VulkanObject for Buffer {
    type Handle = RawBuffer;

    #[inline]
    fn handle(&self) -> Self::Handle {
        self.inner.raw()
    }
}

impl_id_counter!(Buffer);

/// Parameters to create a new `Buffer`.
#[derive(Clone, Debug)]
pub struct BufferCreateInfo {
    /// The size in bytes of the buffer.
    ///
    /// The default value is `0`, which must be overridden.
    pub size: DeviceSize,

    pub _ne: crate::NonExhaustive,
}

impl Default for BufferCreateInfo {
    #[inline]
    fn default() -> Self {
        Self {
            size: 0,
            _ne: crate::NonExhaustive(()),
        }
    }
}

impl BufferCreateInfo {
    pub(crate) fn validate(&self) -> Result<(), Box<ValidationError>> {
        if self.size == 0 {
            return Err(Box::new(ValidationError {
                context: "size".into(),
                problem: "is zero".into(),
                vuids: &["VUID-VkBufferCreateInfo-size-00912"],
            }));
        }

        Ok(())
    }
}
