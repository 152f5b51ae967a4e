// Swapchain and frame attachments
//
// Owns the surface, the swapchain images, and the three offscreen
// images every frame renders through: an fp16 color attachment, a D32
// depth attachment, and the mip chained R32F depth pyramid the late
// cull samples. All of them are rebuilt together on window resize.

use ash::extensions::khr;
use ash::vk;

use crate::allocator::AllocImage;
use crate::device::{Device, ACQUIRE_TIMEOUT_NS};
use crate::handles;
use crate::instance::Instance;
use crate::{BlitzenError, Result};
use utils::log;

use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

pub const COLOR_ATTACHMENT_FORMAT: vk::Format = vk::Format::R16G16B16A16_SFLOAT;
pub const DEPTH_ATTACHMENT_FORMAT: vk::Format = vk::Format::D32_SFLOAT;
pub const DEPTH_PYRAMID_FORMAT: vk::Format = vk::Format::R32_SFLOAT;

/// What the composite pass paints when nothing is drawn
pub const WINDOW_CLEAR_COLOR: [f32; 4] = [0.0, 0.2, 0.4, 1.0];

pub const MAX_DEPTH_PYRAMID_MIPS: u32 = 16;

/// The window surface, created from the platform handle pair
pub struct Surface {
    pub(crate) loader: khr::Surface,
    pub handle: vk::SurfaceKHR,
}

impl Surface {
    pub fn new(
        instance: &Instance,
        display_handle: RawDisplayHandle,
        window_handle: RawWindowHandle,
    ) -> Result<Self> {
        let loader = khr::Surface::new(&instance.loader, &instance.inst);
        let handle = unsafe {
            ash_window::create_surface(
                &instance.loader,
                &instance.inst,
                display_handle,
                window_handle,
                None,
            )
            .map_err(|e| {
                log::error!("Surface creation failed: {:?}", e);
                BlitzenError::VK_SURFACE_CREATION_FAILED
            })?
        };
        Ok(Self { loader, handle })
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        unsafe {
            self.loader.destroy_surface(self.handle, None);
        }
    }
}

/// The swapchain and its image views. The images are written by the
/// composite compute shader, so STORAGE usage is required of the
/// surface format.
pub struct Swapchain {
    loader: khr::Swapchain,
    pub handle: vk::SwapchainKHR,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub images: Vec<vk::Image>,
    pub views: Vec<handles::ImageView>,
}

impl Swapchain {
    pub fn new(
        device: &Device,
        surface: &Surface,
        window_width: u32,
        window_height: u32,
        old_swapchain: Option<vk::SwapchainKHR>,
    ) -> Result<Self> {
        let caps = unsafe {
            surface
                .loader
                .get_physical_device_surface_capabilities(device.pdev, surface.handle)
                .map_err(|_| BlitzenError::VK_SWAPCHAIN_CREATION_FAILED)?
        };
        let formats = unsafe {
            surface
                .loader
                .get_physical_device_surface_formats(device.pdev, surface.handle)
                .map_err(|_| BlitzenError::VK_SWAPCHAIN_CREATION_FAILED)?
        };
        let present_modes = unsafe {
            surface
                .loader
                .get_physical_device_surface_present_modes(device.pdev, surface.handle)
                .map_err(|_| BlitzenError::VK_SWAPCHAIN_CREATION_FAILED)?
        };

        // The composite shader writes the swapchain image directly, so
        // a storage capable UNORM format is required
        let surface_format = formats
            .iter()
            .find(|f| {
                f.format == vk::Format::B8G8R8A8_UNORM || f.format == vk::Format::R8G8B8A8_UNORM
            })
            .or_else(|| formats.first())
            .copied()
            .ok_or(BlitzenError::VK_SWAPCHAIN_CREATION_FAILED)?;

        // Mailbox when the platform offers it outside of debug builds,
        // otherwise the always available FIFO
        let desired_mode = if cfg!(debug_assertions) {
            vk::PresentModeKHR::FIFO
        } else {
            vk::PresentModeKHR::MAILBOX
        };
        let present_mode = if present_modes.contains(&desired_mode) {
            desired_mode
        } else {
            vk::PresentModeKHR::FIFO
        };

        let mut image_count = caps.min_image_count + 1;
        if caps.max_image_count > 0 && image_count > caps.max_image_count {
            image_count = caps.max_image_count;
        }

        let extent = if caps.current_extent.width != u32::MAX {
            caps.current_extent
        } else {
            vk::Extent2D {
                width: window_width
                    .max(caps.min_image_extent.width)
                    .min(caps.max_image_extent.width),
                height: window_height
                    .max(caps.min_image_extent.height)
                    .min(caps.max_image_extent.height),
            }
        };

        let transform = if caps
            .supported_transforms
            .contains(vk::SurfaceTransformFlagsKHR::IDENTITY)
        {
            vk::SurfaceTransformFlagsKHR::IDENTITY
        } else {
            caps.current_transform
        };

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(surface.handle)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::STORAGE)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .image_array_layers(1)
            .old_swapchain(old_swapchain.unwrap_or(vk::SwapchainKHR::null()))
            .build();

        let loader = khr::Swapchain::new(&device.inst.inst, &device.dev);
        let handle = unsafe {
            loader.create_swapchain(&create_info, None).map_err(|e| {
                log::error!("Swapchain creation failed: {:?}", e);
                BlitzenError::VK_SWAPCHAIN_CREATION_FAILED
            })?
        };

        let images = unsafe {
            loader
                .get_swapchain_images(handle)
                .map_err(|_| BlitzenError::VK_SWAPCHAIN_CREATION_FAILED)?
        };

        let mut views = Vec::with_capacity(images.len());
        for image in images.iter() {
            let view_info = vk::ImageViewCreateInfo::builder()
                .image(*image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(surface_format.format)
                .subresource_range(
                    vk::ImageSubresourceRange::builder()
                        .aspect_mask(vk::ImageAspectFlags::COLOR)
                        .level_count(1)
                        .layer_count(1)
                        .build(),
                )
                .build();
            let view = unsafe {
                device
                    .dev
                    .create_image_view(&view_info, None)
                    .map_err(|_| BlitzenError::VK_SWAPCHAIN_CREATION_FAILED)?
            };
            views.push(handles::ImageView::wrap(view));
        }

        Ok(Self {
            loader,
            handle,
            format: surface_format.format,
            extent,
            images,
            views,
        })
    }

    /// Swap in a new swapchain for the resized window, reusing the old
    /// one as `oldSwapchain` so in flight presentation can finish.
    /// The caller has already waited for the device to go idle.
    pub fn recreate(
        &mut self,
        device: &Device,
        surface: &Surface,
        window_width: u32,
        window_height: u32,
    ) -> Result<()> {
        let replacement = Self::new(device, surface, window_width, window_height, Some(self.handle))?;
        let old = std::mem::replace(self, replacement);
        // `old` drops here, destroying the retired handle and views
        drop(old);
        Ok(())
    }

    /// Acquires the next image index, signaling `semaphore` when the
    /// image is actually ready. Out of date surfaces are consumed
    /// silently; the resize flag drives recreation.
    pub fn acquire(&self, semaphore: vk::Semaphore) -> Result<u32> {
        unsafe {
            match self.loader.acquire_next_image(
                self.handle,
                ACQUIRE_TIMEOUT_NS,
                semaphore,
                vk::Fence::null(),
            ) {
                Ok((index, _suboptimal)) => Ok(index),
                Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Err(BlitzenError::SWAPCHAIN_OUT_OF_DATE),
                Err(_) => Err(BlitzenError::COULD_NOT_ACQUIRE_IMAGE),
            }
        }
    }

    pub fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> Result<()> {
        let swapchains = [self.handle];
        let waits = [wait_semaphore];
        let indices = [image_index];
        let info = vk::PresentInfoKHR::builder()
            .swapchains(&swapchains)
            .wait_semaphores(&waits)
            .image_indices(&indices)
            .build();
        unsafe {
            match self.loader.queue_present(queue, &info) {
                Ok(_) => Ok(()),
                // Consumed internally; the collaborator's resize flag
                // triggers the rebuild
                Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(()),
                Err(vk::Result::SUBOPTIMAL_KHR) => Ok(()),
                Err(_) => Err(BlitzenError::PRESENT_FAILED),
            }
        }
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        self.views.clear();
        unsafe {
            self.loader.destroy_swapchain(self.handle, None);
        }
    }
}

/// The offscreen images of one draw extent, recreated on resize
pub struct Attachments {
    pub color: AllocImage,
    pub depth: AllocImage,

    pub pyramid: AllocImage,
    /// One view per pyramid mip, for the per level reduction dispatches
    pub pyramid_mips: Vec<handles::ImageView>,
    pub pyramid_mip_count: u32,
    pub pyramid_extent: vk::Extent2D,

    /// Linear sampler the composite pass reads the color attachment with
    pub color_sampler: handles::Sampler,
    /// Min reduction sampler; a 2x2 min is conservative for reverse-Z
    /// occlusion
    pub depth_sampler: handles::Sampler,
}

impl Attachments {
    pub fn new(device: &Device, draw_extent: vk::Extent2D) -> Result<Self> {
        // STORAGE because the background fill writes the color image
        // from a compute shader when nothing is drawn
        let color = AllocImage::new(
            draw_extent,
            COLOR_ATTACHMENT_FORMAT,
            vk::ImageUsageFlags::COLOR_ATTACHMENT
                | vk::ImageUsageFlags::SAMPLED
                | vk::ImageUsageFlags::STORAGE,
            vk::ImageAspectFlags::COLOR,
            1,
        )?;
        let depth = AllocImage::new(
            draw_extent,
            DEPTH_ATTACHMENT_FORMAT,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
            vk::ImageAspectFlags::DEPTH,
            1,
        )?;

        let pyramid_extent = vk::Extent2D {
            width: previous_pow2(draw_extent.width),
            height: previous_pow2(draw_extent.height),
        };
        let pyramid_mip_count = pyramid_mip_levels(pyramid_extent);
        let pyramid = AllocImage::new(
            pyramid_extent,
            DEPTH_PYRAMID_FORMAT,
            vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::SAMPLED,
            vk::ImageAspectFlags::COLOR,
            pyramid_mip_count,
        )?;

        let mut pyramid_mips = Vec::with_capacity(pyramid_mip_count as usize);
        for mip in 0..pyramid_mip_count {
            let view_info = vk::ImageViewCreateInfo::builder()
                .image(pyramid.image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(DEPTH_PYRAMID_FORMAT)
                .subresource_range(
                    vk::ImageSubresourceRange::builder()
                        .aspect_mask(vk::ImageAspectFlags::COLOR)
                        .base_mip_level(mip)
                        .level_count(1)
                        .layer_count(1)
                        .build(),
                )
                .build();
            let view = unsafe {
                device
                    .dev
                    .create_image_view(&view_info, None)
                    .map_err(|_| BlitzenError::ALLOCATION_FAILED)?
            };
            pyramid_mips.push(handles::ImageView::wrap(view));
        }

        let color_sampler = create_sampler(device, None)?;
        let mut reduction = vk::SamplerReductionModeCreateInfo::builder()
            .reduction_mode(vk::SamplerReductionMode::MIN)
            .build();
        let depth_sampler = create_sampler(device, Some(&mut reduction))?;

        Ok(Self {
            color,
            depth,
            pyramid,
            pyramid_mips,
            pyramid_mip_count,
            pyramid_extent,
            color_sampler,
            depth_sampler,
        })
    }
}

fn create_sampler(
    device: &Device,
    reduction: Option<&mut vk::SamplerReductionModeCreateInfo>,
) -> Result<handles::Sampler> {
    let mut info = vk::SamplerCreateInfo::builder()
        .mag_filter(vk::Filter::LINEAR)
        .min_filter(vk::Filter::LINEAR)
        .mipmap_mode(vk::SamplerMipmapMode::NEAREST)
        .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
        .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
        .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE)
        .min_lod(0.0)
        .max_lod(MAX_DEPTH_PYRAMID_MIPS as f32);
    if let Some(reduction) = reduction {
        info = info.push_next(reduction);
    }
    let handle = unsafe {
        device
            .dev
            .create_sampler(&info.build(), None)
            .map_err(|_| BlitzenError::ALLOCATION_FAILED)?
    };
    Ok(handles::Sampler::wrap(handle))
}

/// Largest power of two at or below `v`
pub fn previous_pow2(v: u32) -> u32 {
    if v == 0 {
        return 0;
    }
    let mut result = 1;
    while result * 2 <= v {
        result *= 2;
    }
    result
}

/// Mips down to 1x1 of the pyramid extent, capped at the image limit
pub fn pyramid_mip_levels(extent: vk::Extent2D) -> u32 {
    let mut levels = 1;
    let mut size = utils::partial_max(extent.width, extent.height);
    while size > 1 {
        size /= 2;
        levels += 1;
    }
    utils::partial_min(levels, MAX_DEPTH_PYRAMID_MIPS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn previous_pow2_rounds_down() {
        assert_eq!(previous_pow2(1), 1);
        assert_eq!(previous_pow2(2), 2);
        assert_eq!(previous_pow2(3), 2);
        assert_eq!(previous_pow2(1024), 1024);
        assert_eq!(previous_pow2(1080), 1024);
        assert_eq!(previous_pow2(1920), 1024);
        assert_eq!(previous_pow2(1280), 1024);
        assert_eq!(previous_pow2(720), 512);
    }

    #[test]
    fn resize_produces_the_expected_pyramid() {
        // The 1920x1080 resize scenario: both dimensions round down to 1024
        let extent = vk::Extent2D {
            width: previous_pow2(1920),
            height: previous_pow2(1080),
        };
        assert_eq!(extent.width, 1024);
        assert_eq!(extent.height, 1024);
        assert_eq!(pyramid_mip_levels(extent), 11);
    }

    #[test]
    fn mip_chain_bottoms_out_at_one_by_one() {
        assert_eq!(
            pyramid_mip_levels(vk::Extent2D {
                width: 1,
                height: 1
            }),
            1
        );
        assert_eq!(
            pyramid_mip_levels(vk::Extent2D {
                width: 512,
                height: 256
            }),
            10
        );
        // Wildly wide extents stay within the image's mip budget
        assert_eq!(
            pyramid_mip_levels(vk::Extent2D {
                width: u32::MAX,
                height: 1
            }),
            MAX_DEPTH_PYRAMID_MIPS
        );
    }
}
