// Copyright (c) 2024 The vkcompute developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Owning wrappers around HAL objects.
//!
//! Each wrapper destroys its object when dropped, so objects created on an error path are
//! released as soon as the path returns.

use super::{
    Hal, HalError, RawBuffer, RawCommandBuffer, RawExecutable, RawFence, RawKernel, RawMemory,
    RawSemaphore,
};
use crate::DeviceSize;
use std::{
    fmt::{Debug, Error as FmtError, Formatter},
    sync::Arc,
    time::Duration,
};

macro_rules! hal_object {
    ($(#[doc = $doc:literal])* $name:ident($raw:ident) => $destroy:ident $({ $($field:ident: $field_ty:ty),* $(,)? })?) => {
        $(#[doc = $doc])*
        pub struct $name {
            hal: Arc<dyn Hal>,
            raw: $raw,
            $($($field: $field_ty,)*)?
        }

        impl $name {
            /// Returns the raw handle of the object.
            #[inline]
            pub fn raw(&self) -> $raw {
                self.raw
            }

            /// Returns the HAL that owns the object.
            #[inline]
            pub fn hal(&self) -> &Arc<dyn Hal> {
                &self.hal
            }
        }

        impl Drop for $name {
            #[inline]
            fn drop(&mut self) {
                self.hal.$destroy(self.raw);
            }
        }

        impl Debug for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
                f.debug_tuple(stringify!($name)).field(&self.raw).finish()
            }
        }
    };
}

hal_object! {
    /// An owned HAL command buffer.
    HalCommandBuffer(RawCommandBuffer) => destroy_command_buffer
}

impl HalCommandBuffer {
    pub fn new(hal: &Arc<dyn Hal>) -> Result<Self, HalError> {
        let raw = hal.create_command_buffer()?;

        Ok(HalCommandBuffer {
            hal: hal.clone(),
            raw,
        })
    }

    /// Removes every operation recorded so far.
    #[inline]
    pub fn reset(&self) -> Result<(), HalError> {
        self.hal.reset_command_buffer(self.raw)
    }
}

hal_object! {
    /// An owned HAL fence.
    HalFence(RawFence) => destroy_fence
}

impl HalFence {
    pub fn new(hal: &Arc<dyn Hal>, signaled: bool) -> Result<Self, HalError> {
        let raw = hal.create_fence(signaled)?;

        Ok(HalFence {
            hal: hal.clone(),
            raw,
        })
    }

    #[inline]
    pub fn is_signaled(&self) -> Result<bool, HalError> {
        self.hal.fence_status(self.raw)
    }

    /// Blocks until the fence is signaled. Returns `false` if `timeout` elapsed first.
    #[inline]
    pub fn wait(&self, timeout: Option<Duration>) -> Result<bool, HalError> {
        self.hal.wait_fence(self.raw, timeout)
    }

    #[inline]
    pub fn reset(&self) -> Result<(), HalError> {
        self.hal.reset_fence(self.raw)
    }
}

hal_object! {
    /// An owned HAL semaphore.
    HalSemaphore(RawSemaphore) => destroy_semaphore
}

impl HalSemaphore {
    pub fn new(hal: &Arc<dyn Hal>) -> Result<Self, HalError> {
        let raw = hal.create_semaphore()?;

        Ok(HalSemaphore {
            hal: hal.clone(),
            raw,
        })
    }

    #[inline]
    pub fn reset(&self) -> Result<(), HalError> {
        self.hal.reset_semaphore(self.raw)
    }
}

hal_object! {
    /// An owned HAL executable.
    HalExecutable(RawExecutable) => destroy_executable
}

impl HalExecutable {
    pub fn new(hal: &Arc<dyn Hal>, binary: &[u8]) -> Result<Self, HalError> {
        let raw = hal.create_executable(binary)?;

        Ok(HalExecutable {
            hal: hal.clone(),
            raw,
        })
    }
}

hal_object! {
    /// An owned HAL kernel. Keeps the executable it was created from alive.
    HalKernel(RawKernel) => destroy_kernel {
        executable: Arc<HalExecutable>,
        name: String,
    }
}

impl HalKernel {
    pub fn new(executable: Arc<HalExecutable>, name: &str) -> Result<Self, HalError> {
        let hal = executable.hal.clone();
        let raw = hal.create_kernel(executable.raw, name)?;

        Ok(HalKernel {
            hal,
            raw,
            executable,
            name: name.to_owned(),
        })
    }

    /// Creates an executable from `binary` and looks up the kernel called `name` in it.
    pub fn from_binary(hal: &Arc<dyn Hal>, binary: &[u8], name: &str) -> Result<Self, HalError> {
        let executable = Arc::new(HalExecutable::new(hal, binary)?);
        Self::new(executable, name)
    }

    #[inline]
    pub fn executable(&self) -> &Arc<HalExecutable> {
        &self.executable
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }
}

hal_object! {
    /// An owned HAL memory allocation.
    HalMemory(RawMemory) => free_memory {
        size: DeviceSize,
    }
}

impl HalMemory {
    pub fn new(hal: &Arc<dyn Hal>, size: DeviceSize) -> Result<Self, HalError> {
        let raw = hal.allocate_memory(size)?;

        Ok(HalMemory {
            hal: hal.clone(),
            raw,
            size,
        })
    }

    #[inline]
    pub fn size(&self) -> DeviceSize {
        self.size
    }

    /// Copies `data` into the memory at `offset` with a map, write, flush, unmap sequence. The
    /// flush is skipped if the memory is host-coherent.
    pub fn upload(&self, offset: DeviceSize, data: &[u8]) -> Result<(), HalError> {
        let size = data.len() as DeviceSize;

        if offset + size > self.size {
            return Err(HalError::InvalidArgument("upload range is out of bounds"));
        }

        self.hal.map_memory(self.raw, offset, size)?;

        let result = self
            .hal
            .write_mapped_memory(self.raw, offset, data)
            .and_then(|()| {
                if self.hal.memory_properties().host_coherent {
                    Ok(())
                } else {
                    self.hal.flush_mapped_memory(self.raw, offset, size)
                }
            });

        self.hal.unmap_memory(self.raw);

        result
    }

    /// Copies the memory at `offset` into `data` with a map, invalidate, read, unmap sequence.
    pub fn download(&self, offset: DeviceSize, data: &mut [u8]) -> Result<(), HalError> {
        let size = data.len() as DeviceSize;

        if offset + size > self.size {
            return Err(HalError::InvalidArgument("download range is out of bounds"));
        }

        self.hal.map_memory(self.raw, offset, size)?;

        let result = if self.hal.memory_properties().host_coherent {
            Ok(())
        } else {
            self.hal.invalidate_mapped_memory(self.raw, offset, size)
        }
        .and_then(|()| self.hal.read_mapped_memory(self.raw, offset, data));

        self.hal.unmap_memory(self.raw);

        result
    }
}

hal_object! {
    /// An owned HAL buffer together with the memory bound to it.
    HalBuffer(RawBuffer) => destroy_buffer {
        memory: HalMemory,
        size: DeviceSize,
    }
}

impl HalBuffer {
    /// Allocates dedicated memory of `size` bytes, creates a buffer and binds the two.
    pub fn new(hal: &Arc<dyn Hal>, size: DeviceSize) -> Result<Self, HalError> {
        let memory = HalMemory::new(hal, size)?;
        let raw = hal.create_buffer(size)?;

        // Wrap before binding so that the buffer is destroyed if the bind fails.
        let buffer = HalBuffer {
            hal: hal.clone(),
            raw,
            memory,
            size,
        };
        hal.bind_buffer_memory(raw, buffer.memory.raw(), 0)?;

        Ok(buffer)
    }

    #[inline]
    pub fn memory(&self) -> &HalMemory {
        &self.memory
    }

    #[inline]
    pub fn size(&self) -> DeviceSize {
        self.size
    }
}
