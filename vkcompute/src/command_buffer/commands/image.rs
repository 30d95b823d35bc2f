// Copyright (c) 2024 The vkcompute developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use crate::{buffer::Buffer, command_buffer::CommandBuffer, ValidationError};
use ash::vk::Image;
use std::sync::Arc;

/// # Commands that operate on images.
///
/// The HAL only knows buffers. Each of these commands is accepted while recording, and makes the
/// command buffer fail with [`VulkanError::FeatureNotPresent`](crate::VulkanError).
impl CommandBuffer {
    pub fn copy_image(
        &mut self,
        _src_image: Image,
        _dst_image: Image,
    ) -> Result<&mut Self, Box<ValidationError>> {
        self.validate_recording()
            .map_err(|err| err.set_vuids(&["VUID-vkCmdCopyImage-commandBuffer-recording"]))?;
        self.record_unsupported("copy_image");

        Ok(self)
    }

    pub fn copy_buffer_to_image(
        &mut self,
        _src_buffer: Arc<Buffer>,
        _dst_image: Image,
    ) -> Result<&mut Self, Box<ValidationError>> {
        self.validate_recording().map_err(|err| {
            err.set_vuids(&["VUID-vkCmdCopyBufferToImage-commandBuffer-recording"])
        })?;
        self.record_unsupported("copy_buffer_to_image");

        Ok(self)
    }

    pub fn copy_image_to_buffer(
        &mut self,
        _src_image: Image,
        _dst_buffer: Arc<Buffer>,
    ) -> Result<&mut Self, Box<ValidationError>> {
        self.validate_recording().map_err(|err| {
            err.set_vuids(&["VUID-vkCmdCopyImageToBuffer-commandBuffer-recording"])
        })?;
        self.record_unsupported("copy_image_to_buffer");

        Ok(self)
    }

    pub fn blit_image(
        &mut self,
        _src_image: Image,
        _dst_image: Image,
    ) -> Result<&mut Self, Box<ValidationError>> {
        self.validate_recording()
            .map_err(|err| err.set_vuids(&["VUID-vkCmdBlitImage-commandBuffer-recording"]))?;
        self.record_unsupported("blit_image");

        Ok(self)
    }

    pub fn clear_color_image(
        &mut self,
        _image: Image,
        _clear_value: [f32; 4],
    ) -> Result<&mut Self, Box<ValidationError>> {
        self.validate_recording().map_err(|err| {
            err.set_vuids(&["VUID-vkCmdClearColorImage-commandBuffer-recording"])
        })?;
        self.record_unsupported("clear_color_image");

        Ok(self)
    }
}
