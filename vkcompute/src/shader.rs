// Copyright (c) 2024 The vkcompute developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Shader modules and the kernel compiler interface.
//!
//! A [`ShaderModule`] holds the code of one or more compute entry points. The code is opaque to
//! this crate; it is only ever handed to the device's [`KernelCompiler`], which turns an entry
//! point into a HAL kernel binary specialized for one exact launch configuration.
//!
//! A module can additionally carry a precompiled binary. Pipelines created from such a module
//! use that binary verbatim and never call the compiler.

use crate::{
    device::Device, macros::impl_id_counter, DeviceOwned, Validated, ValidationError,
    VulkanError,
};
use std::{
    error::Error,
    fmt::{Debug, Display, Error as FmtError, Formatter},
    num::NonZeroU64,
    sync::Arc,
};

/// Contains the code of compute kernels.
#[derive(Debug)]
pub struct ShaderModule {
    device: Arc<Device>,
    id: NonZeroU64,
    code: Arc<[u8]>,
    precompiled_binary: Option<Arc<[u8]>>,
}

impl ShaderModule {
    /// Creates a new shader module.
    pub fn new(
        device: Arc<Device>,
        create_info: ShaderModuleCreateInfo<'_>,
    ) -> Result<Arc<ShaderModule>, Validated<VulkanError>> {
        create_info
            .validate()
            .map_err(|err| err.add_context("create_info"))?;

        let ShaderModuleCreateInfo {
            code,
            precompiled_binary,
            _ne: _,
        } = create_info;

        Ok(Arc::new(ShaderModule {
            device,
            id: Self::next_id(),
            code: code.into(),
            precompiled_binary: precompiled_binary.map(Into::into),
        }))
    }

    /// Returns the code of the module.
    #[inline]
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Returns the precompiled binary of the module, if it has one.
    #[inline]
    pub fn precompiled_binary(&self) -> Option<&[u8]> {
        self.precompiled_binary.as_deref()
    }
}

unsafe impl DeviceOwned for ShaderModule {
    #[inline]
    fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

impl_id_counter!(ShaderModule);

/// Parameters to create a new `ShaderModule`.
#[derive(Clone, Debug)]
pub struct ShaderModuleCreateInfo<'a> {
    /// The code of the shader module.
    ///
    /// There is no default value.
    pub code: &'a [u8],

    /// A finalized kernel binary that pipelines use instead of specializing `code`.
    ///
    /// The default value is `None`.
    pub precompiled_binary: Option<&'a [u8]>,

    pub _ne: crate::NonExhaustive,
}

impl<'a> ShaderModuleCreateInfo<'a> {
    /// Returns a `ShaderModuleCreateInfo` with the specified `code`.
    #[inline]
    pub fn new(code: &'a [u8]) -> Self {
        Self {
            code,
            precompiled_binary: None,
            _ne: crate::NonExhaustive(()),
        }
    }

    pub(crate) fn validate(&self) -> Result<(), Box<ValidationError>> {
        if self.code.is_empty() {
            return Err(Box::new(ValidationError {
                context: "code".into(),
                problem: "is empty".into(),
                vuids: &["VUID-VkShaderModuleCreateInfo-codeSize-01085"],
            }));
        }

        if self.precompiled_binary.is_some_and(<[u8]>::is_empty) {
            return Err(Box::new(ValidationError {
                context: "precompiled_binary".into(),
                problem: "is `Some` but empty".into(),
                ..Default::default()
            }));
        }

        Ok(())
    }
}

/// The launch configuration a kernel is specialized for.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct NdRangeOptions {
    pub global_offset: [u32; 3],
    pub global_size: [u32; 3],
    pub local_size: [u32; 3],
}

/// The compiler front end that specializes kernels.
pub trait KernelCompiler: Send + Sync + Debug {
    /// Produces a finalized kernel binary for `entry_point` of `module`, bound to the launch
    /// configuration `options`. The binary is passed to
    /// [`Hal::create_executable`](crate::hal::Hal::create_executable).
    fn create_specialized_kernel(
        &self,
        module: &ShaderModule,
        entry_point: &str,
        options: &NdRangeOptions,
    ) -> Result<Vec<u8>, CompileError>;
}

/// Error that can happen when specializing a kernel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CompileError {
    /// The code of the module could not be parsed.
    InvalidModule,

    /// The module has no entry point with the given name.
    EntryPointNotFound(String),

    /// Finalizing the kernel for the requested launch configuration failed.
    Finalize(String),
}

impl Error for CompileError {}

impl Display for CompileError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        match self {
            Self::InvalidModule => write!(f, "the shader module could not be parsed"),
            Self::EntryPointNotFound(name) => {
                write!(f, "the shader module has no entry point named `{}`", name)
            }
            Self::Finalize(reason) => write!(f, "finalizing the kernel failed: {}", reason),
        }
    }
}

impl From<CompileError> for VulkanError {
    #[inline]
    fn from(_: CompileError) -> Self {
        VulkanError::InvalidShader
    }
}
