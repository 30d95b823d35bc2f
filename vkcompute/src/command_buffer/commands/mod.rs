// Copyright (c) 2024 The vkcompute developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The recording methods of [`CommandBuffer`](super::CommandBuffer), grouped by kind of
//! command.

mod bind_push;
mod image;
mod pipeline;
mod query;
mod secondary;
mod sync;
mod transfer;
