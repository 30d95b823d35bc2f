// Copyright (c) 2024 The vkcompute developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use crate::macros::vulkan_bitflags;

vulkan_bitflags! {
    /// A set of pipeline stages of the compute queue.
    PipelineStages impl {
        /// The stages that commands of a compute command buffer execute in.
        pub const COMMAND_STAGES: Self = Self::COMPUTE_SHADER
            .union(Self::DRAW_INDIRECT)
            .union(Self::TRANSFER);

        /// The stages that a dispatch executes in.
        pub const COMPUTE: Self = Self::COMPUTE_SHADER.union(Self::DRAW_INDIRECT);

        /// Replaces the pseudo-stages with the stages they stand for, when `self` is used as the
        /// first synchronization scope of a dependency (the source stages of a barrier or an
        /// event wait).
        ///
        /// `ALL_COMMANDS` and `BOTTOM_OF_PIPE` stand for every command stage, `TOP_OF_PIPE` for
        /// none.
        #[inline]
        pub const fn expand_first_scope(self) -> Self {
            Self::expand(self, Self::BOTTOM_OF_PIPE)
        }

        /// Replaces the pseudo-stages with the stages they stand for, when `self` is used as the
        /// second synchronization scope of a dependency (the destination stages of a barrier or
        /// an event wait).
        ///
        /// `ALL_COMMANDS` and `TOP_OF_PIPE` stand for every command stage, `BOTTOM_OF_PIPE` for
        /// none.
        #[inline]
        pub const fn expand_second_scope(self) -> Self {
            Self::expand(self, Self::TOP_OF_PIPE)
        }

        const fn expand(self, all_stages_alias: Self) -> Self {
            let pseudo = Self::ALL_COMMANDS
                .union(Self::TOP_OF_PIPE)
                .union(Self::BOTTOM_OF_PIPE);
            let result = self.difference(pseudo);

            if self.intersects(Self::ALL_COMMANDS.union(all_stages_alias)) {
                result.union(Self::COMMAND_STAGES)
            } else {
                result
            }
        }
    }
    = PipelineStageFlags(u32);

    /// The start of the queue. Has no work of its own.
    TOP_OF_PIPE = TOP_OF_PIPE,

    /// Reading the parameters of indirect dispatches.
    DRAW_INDIRECT = DRAW_INDIRECT,

    /// Execution of compute kernels.
    COMPUTE_SHADER = COMPUTE_SHADER,

    /// Copy, update and fill commands.
    TRANSFER = TRANSFER,

    /// The end of the queue. Has no work of its own.
    BOTTOM_OF_PIPE = BOTTOM_OF_PIPE,

    /// Host reads and writes, and host-side event operations.
    HOST = HOST,

    /// Every stage of every command.
    ALL_COMMANDS = ALL_COMMANDS,
}

vulkan_bitflags! {
    /// Flags that modify how a dependency is formed.
    DependencyFlags = DependencyFlags(u32);

    /// The dependency is only framebuffer-local. It has no effect on compute work.
    BY_REGION = BY_REGION,
}

#[cfg(test)]
mod tests {
    use super::PipelineStages;

    #[test]
    fn pseudo_stages_expand_per_scope() {
        assert_eq!(
            PipelineStages::ALL_COMMANDS.expand_first_scope(),
            PipelineStages::COMMAND_STAGES,
        );
        assert_eq!(
            PipelineStages::BOTTOM_OF_PIPE.expand_first_scope(),
            PipelineStages::COMMAND_STAGES,
        );
        assert!(PipelineStages::TOP_OF_PIPE.expand_first_scope().is_empty());

        assert_eq!(
            PipelineStages::TOP_OF_PIPE.expand_second_scope(),
            PipelineStages::COMMAND_STAGES,
        );
        assert!(PipelineStages::BOTTOM_OF_PIPE.expand_second_scope().is_empty());

        assert_eq!(
            (PipelineStages::HOST | PipelineStages::TRANSFER).expand_first_scope(),
            PipelineStages::HOST | PipelineStages::TRANSFER,
        );
    }

    #[test]
    fn converts_to_ash() {
        let stages = PipelineStages::COMPUTE_SHADER | PipelineStages::TRANSFER;
        let raw = ash::vk::PipelineStageFlags::from(stages);

        assert_eq!(
            raw,
            ash::vk::PipelineStageFlags::COMPUTE_SHADER | ash::vk::PipelineStageFlags::TRANSFER,
        );
        assert_eq!(PipelineStages::from(raw), stages);
        assert_eq!(format!("{:?}", stages), "COMPUTE_SHADER | TRANSFER");
    }
}
