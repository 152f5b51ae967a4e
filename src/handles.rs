// Scoped wrappers for plain Vulkan handles
//
// Each wrapper owns exactly one device object and releases it through
// the process wide handle triple when dropped. Creation helpers exist
// for the handles the frame tools build in bulk; everything else wraps
// a handle produced elsewhere.

use ash::vk;

use crate::allocator::crucials;
use crate::{BlitzenError, Result};
use utils::log;

macro_rules! scoped_handle {
    ($name:ident, $handle:ty, $destroy:ident) => {
        pub struct $name {
            pub handle: $handle,
        }

        impl $name {
            pub fn wrap(handle: $handle) -> Self {
                Self { handle }
            }
        }

        impl Drop for $name {
            fn drop(&mut self) {
                match crucials() {
                    Ok(crucials) => unsafe {
                        crucials.device.$destroy(self.handle, None);
                    },
                    Err(_) => log::error!(concat!(
                        "A ",
                        stringify!($name),
                        " outlived the renderer and leaks"
                    )),
                }
            }
        }
    };
}

scoped_handle!(Fence, vk::Fence, destroy_fence);
scoped_handle!(Semaphore, vk::Semaphore, destroy_semaphore);
scoped_handle!(CommandPool, vk::CommandPool, destroy_command_pool);
scoped_handle!(Pipeline, vk::Pipeline, destroy_pipeline);
scoped_handle!(PipelineLayout, vk::PipelineLayout, destroy_pipeline_layout);
scoped_handle!(
    DescriptorSetLayout,
    vk::DescriptorSetLayout,
    destroy_descriptor_set_layout
);
scoped_handle!(DescriptorPool, vk::DescriptorPool, destroy_descriptor_pool);
scoped_handle!(Sampler, vk::Sampler, destroy_sampler);
scoped_handle!(ShaderModule, vk::ShaderModule, destroy_shader_module);
scoped_handle!(ImageView, vk::ImageView, destroy_image_view);

impl Fence {
    /// In flight fences start signaled so the first frame's wait passes
    pub fn new(signaled: bool) -> Result<Self> {
        let crucials = crucials()?;
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let info = vk::FenceCreateInfo::builder().flags(flags).build();
        let handle = unsafe {
            crucials
                .device
                .create_fence(&info, None)
                .map_err(|_| BlitzenError::SYNC_OBJECT_CREATION_FAILED)?
        };
        Ok(Self::wrap(handle))
    }
}

impl Semaphore {
    pub fn new() -> Result<Self> {
        let crucials = crucials()?;
        let info = vk::SemaphoreCreateInfo::builder().build();
        let handle = unsafe {
            crucials
                .device
                .create_semaphore(&info, None)
                .map_err(|_| BlitzenError::SYNC_OBJECT_CREATION_FAILED)?
        };
        Ok(Self::wrap(handle))
    }
}

impl CommandPool {
    pub fn new(queue_family: u32) -> Result<Self> {
        let crucials = crucials()?;
        let info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(queue_family)
            .build();
        let handle = unsafe {
            crucials
                .device
                .create_command_pool(&info, None)
                .map_err(|_| BlitzenError::COMMAND_POOL_CREATION_FAILED)?
        };
        Ok(Self::wrap(handle))
    }

    /// Allocates primary command buffers out of this pool. They are
    /// freed with the pool.
    pub fn allocate(&self, count: u32) -> Result<Vec<vk::CommandBuffer>> {
        let crucials = crucials()?;
        let info = vk::CommandBufferAllocateInfo::builder()
            .command_buffer_count(count)
            .command_pool(self.handle)
            .level(vk::CommandBufferLevel::PRIMARY)
            .build();
        unsafe {
            crucials
                .device
                .allocate_command_buffers(&info)
                .map_err(|_| BlitzenError::COMMAND_POOL_CREATION_FAILED)
        }
    }
}
