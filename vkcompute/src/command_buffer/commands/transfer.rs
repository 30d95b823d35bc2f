// Copyright (c) 2024 The vkcompute developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use crate::{
    buffer::Buffer,
    command_buffer::{BufferCopy, CommandBuffer, CommandInfo},
    DeviceOwned, DeviceSize, ValidationError,
};
use smallvec::SmallVec;
use std::sync::Arc;

/// The largest amount of data that one `update_buffer` command can write.
const MAX_UPDATE_SIZE: DeviceSize = 65536;

/// # Commands to transfer data between buffers.
///
/// These commands execute in the [`TRANSFER`](crate::sync::PipelineStages::TRANSFER) stage.
impl CommandBuffer {
    /// Copies regions of `src_buffer` into `dst_buffer`.
    ///
    /// `src_buffer` and `dst_buffer` may be the same buffer, as long as no source region
    /// overlaps a destination region.
    pub fn copy_buffer(
        &mut self,
        src_buffer: Arc<Buffer>,
        dst_buffer: Arc<Buffer>,
        regions: impl IntoIterator<Item = BufferCopy>,
    ) -> Result<&mut Self, Box<ValidationError>> {
        let regions: SmallVec<_> = regions.into_iter().collect();
        self.validate_copy_buffer(&src_buffer, &dst_buffer, &regions)?;

        self.record(CommandInfo::CopyBuffer {
            src_buffer,
            dst_buffer,
            regions,
        });

        Ok(self)
    }

    fn validate_copy_buffer(
        &self,
        src_buffer: &Buffer,
        dst_buffer: &Buffer,
        regions: &[BufferCopy],
    ) -> Result<(), Box<ValidationError>> {
        self.validate_recording()
            .map_err(|err| err.set_vuids(&["VUID-vkCmdCopyBuffer-commandBuffer-recording"]))?;

        for (context, buffer) in [("src_buffer", src_buffer), ("dst_buffer", dst_buffer)] {
            if buffer.device().id() != self.device().id() {
                return Err(Box::new(ValidationError {
                    context: context.into(),
                    problem: "does not belong to the same device as the command buffer".into(),
                    vuids: &["VUID-vkCmdCopyBuffer-commonparent"],
                }));
            }
        }

        if regions.is_empty() {
            return Err(Box::new(ValidationError {
                context: "regions".into(),
                problem: "is empty".into(),
                vuids: &["VUID-vkCmdCopyBuffer-regionCount-arraylength"],
            }));
        }

        let same_buffer = src_buffer.id() == dst_buffer.id();

        for (index, region) in regions.iter().enumerate() {
            let &BufferCopy {
                src_offset,
                dst_offset,
                size,
            } = region;

            if size == 0 {
                return Err(Box::new(ValidationError {
                    context: format!("regions[{}].size", index).into(),
                    problem: "is zero".into(),
                    vuids: &["VUID-VkBufferCopy-size-01988"],
                }));
            }

            if src_offset
                .checked_add(size)
                .map_or(true, |end| end > src_buffer.size())
            {
                return Err(Box::new(ValidationError {
                    problem: format!(
                        "`regions[{0}].src_offset + regions[{0}].size` is greater than the size \
                        of `src_buffer`",
                        index,
                    )
                    .into(),
                    vuids: &["VUID-vkCmdCopyBuffer-size-00115"],
                    ..Default::default()
                }));
            }

            if dst_offset
                .checked_add(size)
                .map_or(true, |end| end > dst_buffer.size())
            {
                return Err(Box::new(ValidationError {
                    problem: format!(
                        "`regions[{0}].dst_offset + regions[{0}].size` is greater than the size \
                        of `dst_buffer`",
                        index,
                    )
                    .into(),
                    vuids: &["VUID-vkCmdCopyBuffer-size-00116"],
                    ..Default::default()
                }));
            }

            if same_buffer {
                for (other_index, other) in regions.iter().enumerate() {
                    let src = src_offset..src_offset + size;
                    let dst = other.dst_offset..other.dst_offset + other.size;

                    if src.start < dst.end && dst.start < src.end {
                        return Err(Box::new(ValidationError {
                            problem: format!(
                                "`src_buffer` and `dst_buffer` are the same buffer, and the \
                                source range of `regions[{}]` overlaps the destination range of \
                                `regions[{}]`",
                                index, other_index,
                            )
                            .into(),
                            vuids: &["VUID-vkCmdCopyBuffer-pRegions-00117"],
                            ..Default::default()
                        }));
                    }
                }
            }
        }

        Ok(())
    }

    /// Writes `data` into `dst_buffer` at `dst_offset`.
    ///
    /// The data is copied into the command buffer, so it can be changed or dropped after this
    /// call.
    pub fn update_buffer(
        &mut self,
        dst_buffer: Arc<Buffer>,
        dst_offset: DeviceSize,
        data: &[u8],
    ) -> Result<&mut Self, Box<ValidationError>> {
        self.validate_update_buffer(&dst_buffer, dst_offset, data)?;

        self.record(CommandInfo::UpdateBuffer {
            dst_buffer,
            dst_offset,
            data: data.into(),
        });

        Ok(self)
    }

    fn validate_update_buffer(
        &self,
        dst_buffer: &Buffer,
        dst_offset: DeviceSize,
        data: &[u8],
    ) -> Result<(), Box<ValidationError>> {
        self.validate_recording()
            .map_err(|err| err.set_vuids(&["VUID-vkCmdUpdateBuffer-commandBuffer-recording"]))?;

        if dst_buffer.device().id() != self.device().id() {
            return Err(Box::new(ValidationError {
                context: "dst_buffer".into(),
                problem: "does not belong to the same device as the command buffer".into(),
                vuids: &["VUID-vkCmdUpdateBuffer-commonparent"],
            }));
        }

        let size = data.len() as DeviceSize;

        if size == 0 || size > MAX_UPDATE_SIZE {
            return Err(Box::new(ValidationError {
                context: "data".into(),
                problem: format!("the size is zero or greater than {}", MAX_UPDATE_SIZE).into(),
                vuids: &["VUID-vkCmdUpdateBuffer-dataSize-00037"],
            }));
        }

        if size % 4 != 0 {
            return Err(Box::new(ValidationError {
                context: "data".into(),
                problem: "the size is not a multiple of 4".into(),
                vuids: &["VUID-vkCmdUpdateBuffer-dataSize-00038"],
            }));
        }

        if dst_offset % 4 != 0 {
            return Err(Box::new(ValidationError {
                context: "dst_offset".into(),
                problem: "is not a multiple of 4".into(),
                vuids: &["VUID-vkCmdUpdateBuffer-dstOffset-00036"],
            }));
        }

        if dst_offset
            .checked_add(size)
            .map_or(true, |end| end > dst_buffer.size())
        {
            return Err(Box::new(ValidationError {
                problem: "`dst_offset + data.len()` is greater than the size of `dst_buffer`"
                    .into(),
                vuids: &["VUID-vkCmdUpdateBuffer-dataSize-00033"],
                ..Default::default()
            }));
        }

        Ok(())
    }

    /// Fills `size` bytes of `dst_buffer` starting at `dst_offset` with copies of `data`.
    pub fn fill_buffer(
        &mut self,
        dst_buffer: Arc<Buffer>,
        dst_offset: DeviceSize,
        size: DeviceSize,
        data: u32,
    ) -> Result<&mut Self, Box<ValidationError>> {
        self.validate_fill_buffer(&dst_buffer, dst_offset, size)?;

        self.record(CommandInfo::FillBuffer {
            dst_buffer,
            dst_offset,
            size,
            data,
        });

        Ok(self)
    }

    fn validate_fill_buffer(
        &self,
        dst_buffer: &Buffer,
        dst_offset: DeviceSize,
        size: DeviceSize,
    ) -> Result<(), Box<ValidationError>> {
        self.validate_recording()
            .map_err(|err| err.set_vuids(&["VUID-vkCmdFillBuffer-commandBuffer-recording"]))?;

        if dst_buffer.device().id() != self.device().id() {
            return Err(Box::new(ValidationError {
                context: "dst_buffer".into(),
                problem: "does not belong to the same device as the command buffer".into(),
                vuids: &["VUID-vkCmdFillBuffer-commonparent"],
            }));
        }

        if dst_offset % 4 != 0 {
            return Err(Box::new(ValidationError {
                context: "dst_offset".into(),
                problem: "is not a multiple of 4".into(),
                vuids: &["VUID-vkCmdFillBuffer-dstOffset-00025"],
            }));
        }

        if size == 0 {
            return Err(Box::new(ValidationError {
                context: "size".into(),
                problem: "is zero".into(),
                vuids: &["VUID-vkCmdFillBuffer-size-00026"],
            }));
        }

        if size % 4 != 0 {
            return Err(Box::new(ValidationError {
                context: "size".into(),
                problem: "is not a multiple of 4".into(),
                vuids: &["VUID-vkCmdFillBuffer-size-00028"],
            }));
        }

        if dst_offset
            .checked_add(size)
            .map_or(true, |end| end > dst_buffer.size())
        {
            return Err(Box::new(ValidationError {
                problem: "`dst_offset + size` is greater than the size of `dst_buffer`".into(),
                vuids: &["VUID-vkCmdFillBuffer-size-00027"],
                ..Default::default()
            }));
        }

        Ok(())
    }
}
