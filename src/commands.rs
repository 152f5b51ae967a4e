// Command buffer and synchronization helpers
//
// Small wrappers over recording, submission and the synchronization-2
// barrier structs. The draw orchestrator strings dozens of barriers per
// frame together out of these.

use ash::vk;

use crate::{BlitzenError, Result};

/// Resets a command buffer and starts recording into it
pub fn begin_command_buffer(
    dev: &ash::Device,
    cbuf: vk::CommandBuffer,
    flags: vk::CommandBufferUsageFlags,
) -> Result<()> {
    unsafe {
        dev.reset_command_buffer(cbuf, vk::CommandBufferResetFlags::empty())
            .map_err(|_| BlitzenError::FRAME_RECORD_FAILED)?;
        let info = vk::CommandBufferBeginInfo::builder().flags(flags).build();
        dev.begin_command_buffer(cbuf, &info)
            .map_err(|_| BlitzenError::FRAME_RECORD_FAILED)
    }
}

pub fn end_command_buffer(dev: &ash::Device, cbuf: vk::CommandBuffer) -> Result<()> {
    unsafe {
        dev.end_command_buffer(cbuf)
            .map_err(|_| BlitzenError::FRAME_RECORD_FAILED)
    }
}

/// Semaphore plus the stage it gates, for queue submission
pub fn semaphore_submit_info(
    semaphore: vk::Semaphore,
    stage: vk::PipelineStageFlags2,
) -> vk::SemaphoreSubmitInfo {
    vk::SemaphoreSubmitInfo::builder()
        .semaphore(semaphore)
        .stage_mask(stage)
        .build()
}

/// Single command buffer submission through vkQueueSubmit2
pub fn submit_command_buffer(
    dev: &ash::Device,
    queue: vk::Queue,
    cbuf: vk::CommandBuffer,
    wait_semaphores: &[vk::SemaphoreSubmitInfo],
    signal_semaphores: &[vk::SemaphoreSubmitInfo],
    fence: vk::Fence,
) -> Result<()> {
    let cbuf_info = vk::CommandBufferSubmitInfo::builder()
        .command_buffer(cbuf)
        .build();
    let submit = vk::SubmitInfo2::builder()
        .wait_semaphore_infos(wait_semaphores)
        .command_buffer_infos(std::slice::from_ref(&cbuf_info))
        .signal_semaphore_infos(signal_semaphores)
        .build();

    unsafe {
        dev.queue_submit2(queue, &[submit], fence)
            .map_err(|_| BlitzenError::QUEUE_SUBMIT_FAILED)
    }
}

/// A buffer memory barrier over `[offset, offset + size)`
pub fn buffer_barrier(
    buffer: vk::Buffer,
    src_stage: vk::PipelineStageFlags2,
    src_access: vk::AccessFlags2,
    dst_stage: vk::PipelineStageFlags2,
    dst_access: vk::AccessFlags2,
    offset: vk::DeviceSize,
    size: vk::DeviceSize,
) -> vk::BufferMemoryBarrier2 {
    vk::BufferMemoryBarrier2::builder()
        .buffer(buffer)
        .src_stage_mask(src_stage)
        .src_access_mask(src_access)
        .dst_stage_mask(dst_stage)
        .dst_access_mask(dst_access)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .offset(offset)
        .size(size)
        .build()
}

/// An image memory barrier over every mip of the given aspect
pub fn image_barrier(
    image: vk::Image,
    src_stage: vk::PipelineStageFlags2,
    src_access: vk::AccessFlags2,
    dst_stage: vk::PipelineStageFlags2,
    dst_access: vk::AccessFlags2,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
    aspect: vk::ImageAspectFlags,
) -> vk::ImageMemoryBarrier2 {
    vk::ImageMemoryBarrier2::builder()
        .image(image)
        .src_stage_mask(src_stage)
        .src_access_mask(src_access)
        .dst_stage_mask(dst_stage)
        .dst_access_mask(dst_access)
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .subresource_range(
            vk::ImageSubresourceRange::builder()
                .aspect_mask(aspect)
                .base_mip_level(0)
                .level_count(vk::REMAINING_MIP_LEVELS)
                .base_array_layer(0)
                .layer_count(1)
                .build(),
        )
        .build()
}

/// Executes buffer and image barriers in one dependency
pub fn pipeline_barrier(
    dev: &ash::Device,
    cbuf: vk::CommandBuffer,
    buffer_barriers: &[vk::BufferMemoryBarrier2],
    image_barriers: &[vk::ImageMemoryBarrier2],
) {
    let dependency = vk::DependencyInfo::builder()
        .buffer_memory_barriers(buffer_barriers)
        .image_memory_barriers(image_barriers)
        .build();
    unsafe {
        dev.cmd_pipeline_barrier2(cbuf, &dependency);
    }
}

pub fn copy_buffer_to_buffer(
    dev: &ash::Device,
    cbuf: vk::CommandBuffer,
    src: vk::Buffer,
    dst: vk::Buffer,
    size: vk::DeviceSize,
    src_offset: vk::DeviceSize,
    dst_offset: vk::DeviceSize,
) {
    let region = vk::BufferCopy::builder()
        .src_offset(src_offset)
        .dst_offset(dst_offset)
        .size(size)
        .build();
    unsafe {
        dev.cmd_copy_buffer(cbuf, src, dst, &[region]);
    }
}

/// Reinterprets a push constant struct as the byte slice
/// vkCmdPushConstants wants
pub fn push_constant_bytes<T: Copy>(value: &T) -> &[u8] {
    unsafe {
        std::slice::from_raw_parts(value as *const T as *const u8, std::mem::size_of::<T>())
    }
}

/// Work group count for a 1D dispatch with the given local size
pub fn group_count(invocations: u32, local_size: u32) -> u32 {
    invocations / local_size + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_count_always_covers_every_invocation() {
        assert_eq!(group_count(0, 64), 1);
        assert_eq!(group_count(63, 64), 1);
        assert_eq!(group_count(64, 64), 2);
        assert_eq!(group_count(4_000_000, 64), 62501);
        // every invocation id fits below groups * local size
        for count in [1u32, 64, 65, 127, 128, 1000].iter() {
            assert!(group_count(*count, 64) * 64 >= *count);
        }
    }
}
