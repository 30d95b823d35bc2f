// Copyright (c) 2024 The vkcompute developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use crate::{
    buffer::Buffer, command_buffer::CommandBuffer, sync::PipelineStages, DeviceSize,
    ValidationError,
};
use ash::vk::QueryPool;
use std::{ops::Range, sync::Arc};

/// # Commands related to queries.
///
/// The HAL has no query support. These commands are accepted while recording, and make the
/// command buffer fail with [`VulkanError::FeatureNotPresent`](crate::VulkanError).
impl CommandBuffer {
    pub fn reset_query_pool(
        &mut self,
        _query_pool: QueryPool,
        _queries: Range<u32>,
    ) -> Result<&mut Self, Box<ValidationError>> {
        self.validate_recording().map_err(|err| {
            err.set_vuids(&["VUID-vkCmdResetQueryPool-commandBuffer-recording"])
        })?;
        self.record_unsupported("reset_query_pool");

        Ok(self)
    }

    pub fn begin_query(
        &mut self,
        _query_pool: QueryPool,
        _query: u32,
    ) -> Result<&mut Self, Box<ValidationError>> {
        self.validate_recording()
            .map_err(|err| err.set_vuids(&["VUID-vkCmdBeginQuery-commandBuffer-recording"]))?;
        self.record_unsupported("begin_query");

        Ok(self)
    }

    pub fn end_query(
        &mut self,
        _query_pool: QueryPool,
        _query: u32,
    ) -> Result<&mut Self, Box<ValidationError>> {
        self.validate_recording()
            .map_err(|err| err.set_vuids(&["VUID-vkCmdEndQuery-commandBuffer-recording"]))?;
        self.record_unsupported("end_query");

        Ok(self)
    }

    pub fn write_timestamp(
        &mut self,
        _query_pool: QueryPool,
        _query: u32,
        _stage: PipelineStages,
    ) -> Result<&mut Self, Box<ValidationError>> {
        self.validate_recording().map_err(|err| {
            err.set_vuids(&["VUID-vkCmdWriteTimestamp-commandBuffer-recording"])
        })?;
        self.record_unsupported("write_timestamp");

        Ok(self)
    }

    pub fn copy_query_pool_results(
        &mut self,
        _query_pool: QueryPool,
        _queries: Range<u32>,
        _dst_buffer: Arc<Buffer>,
        _dst_offset: DeviceSize,
    ) -> Result<&mut Self, Box<ValidationError>> {
        self.validate_recording().map_err(|err| {
            err.set_vuids(&["VUID-vkCmdCopyQueryPoolResults-commandBuffer-recording"])
        })?;
        self.record_unsupported("copy_query_pool_results");

        Ok(self)
    }
}
