// GPU memory allocation
//
// A thin wrapper over gpu-allocator. Buffers and images are requested
// with a (usage, memory location, mapped?) triple and come back as
// scoped objects. The scoped destructors consult a process wide
// (instance, device, allocator) triple which the renderer registers at
// construction and unregisters at destruction; no resource may outlive
// the renderer.

use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;

use crate::{BlitzenError, Result};
use utils::log;

use std::sync::{Arc, Mutex, RwLock};

/// The handle triple every scoped resource needs at destruction time.
///
/// The device and instance entries are handle clones; ownership stays
/// with the renderer. The allocator is owned here and dies when the
/// renderer unregisters the triple.
pub struct MemoryCrucials {
    pub instance: ash::Instance,
    pub device: ash::Device,
    pub allocator: Mutex<Allocator>,
}

lazy_static::lazy_static! {
    static ref CRUCIALS: RwLock<Option<Arc<MemoryCrucials>>> = RwLock::new(None);
}

/// Registers the process wide triple. Called once at renderer
/// construction, before any scoped resource exists.
pub fn register(
    instance: &ash::Instance,
    device: &ash::Device,
    pdev: vk::PhysicalDevice,
) -> Result<()> {
    let allocator = Allocator::new(&AllocatorCreateDesc {
        instance: instance.clone(),
        device: device.clone(),
        physical_device: pdev,
        debug_settings: Default::default(),
        buffer_device_address: true,
    })
    .map_err(|e| {
        log::error!("Could not create the gpu allocator: {:?}", e);
        BlitzenError::ALLOCATION_FAILED
    })?;

    let mut slot = CRUCIALS.write().unwrap();
    if slot.is_some() {
        return Err(BlitzenError::RENDERER_ALREADY_EXISTS);
    }
    *slot = Some(Arc::new(MemoryCrucials {
        instance: instance.clone(),
        device: device.clone(),
        allocator: Mutex::new(allocator),
    }));
    Ok(())
}

/// Drops the triple (and with it the allocator). Every scoped resource
/// must already be gone.
pub fn unregister() {
    *CRUCIALS.write().unwrap() = None;
}

/// Grabs the registered triple for a scoped resource's constructor or
/// destructor
pub fn crucials() -> Result<Arc<MemoryCrucials>> {
    CRUCIALS
        .read()
        .unwrap()
        .clone()
        .ok_or(BlitzenError::NO_RENDERER_REGISTERED)
}

/// A buffer with its memory allocation
///
/// Mapped pointers are persistent for host visible locations.
pub struct AllocBuffer {
    pub buffer: vk::Buffer,
    pub size: vk::DeviceSize,
    allocation: Option<Allocation>,
}

impl AllocBuffer {
    pub fn new(size: vk::DeviceSize, usage: vk::BufferUsageFlags, location: MemoryLocation) -> Result<Self> {
        let crucials = crucials()?;

        let create_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .build();
        let buffer = unsafe {
            crucials
                .device
                .create_buffer(&create_info, None)
                .map_err(|_| BlitzenError::ALLOCATION_FAILED)?
        };
        let requirements = unsafe { crucials.device.get_buffer_memory_requirements(buffer) };

        let allocation = crucials
            .allocator
            .lock()
            .unwrap()
            .allocate(&AllocationCreateDesc {
                name: "buffer",
                requirements,
                location,
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| {
                log::error!("Buffer allocation of {} bytes failed: {:?}", size, e);
                unsafe { crucials.device.destroy_buffer(buffer, None) };
                BlitzenError::ALLOCATION_FAILED
            })?;

        unsafe {
            crucials
                .device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
                .map_err(|_| BlitzenError::ALLOCATION_FAILED)?;
        }

        Ok(Self {
            buffer,
            size,
            allocation: Some(allocation),
        })
    }

    /// Allocates a device local buffer and returns its device address.
    /// The usage must include SHADER_DEVICE_ADDRESS.
    pub fn device_address(&self) -> vk::DeviceAddress {
        let crucials = crucials().expect("buffer outlived the renderer");
        let info = vk::BufferDeviceAddressInfo::builder()
            .buffer(self.buffer)
            .build();
        unsafe { crucials.device.get_buffer_device_address(&info) }
    }

    /// The persistently mapped pointer of a host visible allocation
    pub fn mapped_ptr(&self) -> Option<*mut u8> {
        self.allocation
            .as_ref()
            .and_then(|a| a.mapped_ptr())
            .map(|p| p.as_ptr() as *mut u8)
    }

    /// Writes `data` through the persistent mapping.
    ///
    /// The location has to be host visible; coherent memory means no
    /// flush is needed before the device reads it.
    pub fn write<T: Copy>(&self, byte_offset: usize, data: &[T]) {
        if data.is_empty() {
            return;
        }
        let ptr = self
            .mapped_ptr()
            .expect("writing to a buffer that is not host visible");
        unsafe {
            let dst = ptr.add(byte_offset) as *mut T;
            let dst_slice = std::slice::from_raw_parts_mut(dst, data.len());
            dst_slice.copy_from_slice(data);
        }
    }
}

impl Drop for AllocBuffer {
    fn drop(&mut self) {
        match crucials() {
            Ok(crucials) => unsafe {
                if let Some(allocation) = self.allocation.take() {
                    let _ = crucials.allocator.lock().unwrap().free(allocation);
                }
                crucials.device.destroy_buffer(self.buffer, None);
            },
            Err(_) => log::error!("A buffer outlived the renderer and leaks"),
        }
    }
}

/// A 2D image with its memory, plus a view covering every mip
pub struct AllocImage {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub mip_levels: u32,
    allocation: Option<Allocation>,
}

impl AllocImage {
    pub fn new(
        extent: vk::Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        aspect: vk::ImageAspectFlags,
        mip_levels: u32,
    ) -> Result<Self> {
        let crucials = crucials()?;

        let create_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(mip_levels)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .build();
        let image = unsafe {
            crucials
                .device
                .create_image(&create_info, None)
                .map_err(|_| BlitzenError::ALLOCATION_FAILED)?
        };
        let requirements = unsafe { crucials.device.get_image_memory_requirements(image) };

        let allocation = crucials
            .allocator
            .lock()
            .unwrap()
            .allocate(&AllocationCreateDesc {
                name: "image",
                requirements,
                location: MemoryLocation::GpuOnly,
                linear: false,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| {
                log::error!(
                    "Image allocation of {}x{} {:?} failed: {:?}",
                    extent.width,
                    extent.height,
                    format,
                    e
                );
                unsafe { crucials.device.destroy_image(image, None) };
                BlitzenError::ALLOCATION_FAILED
            })?;

        unsafe {
            crucials
                .device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
                .map_err(|_| BlitzenError::ALLOCATION_FAILED)?;
        }

        let view_info = vk::ImageViewCreateInfo::builder()
            .subresource_range(
                vk::ImageSubresourceRange::builder()
                    .aspect_mask(aspect)
                    .base_mip_level(0)
                    .level_count(mip_levels)
                    .layer_count(1)
                    .build(),
            )
            .image(image)
            .format(format)
            .view_type(vk::ImageViewType::TYPE_2D)
            .build();
        let view = unsafe {
            crucials
                .device
                .create_image_view(&view_info, None)
                .map_err(|_| BlitzenError::ALLOCATION_FAILED)?
        };

        Ok(Self {
            image,
            view,
            extent,
            format,
            mip_levels,
            allocation: Some(allocation),
        })
    }
}

impl Drop for AllocImage {
    fn drop(&mut self) {
        match crucials() {
            Ok(crucials) => unsafe {
                crucials.device.destroy_image_view(self.view, None);
                crucials.device.destroy_image(self.image, None);
                if let Some(allocation) = self.allocation.take() {
                    let _ = crucials.allocator.lock().unwrap().free(allocation);
                }
            },
            Err(_) => log::error!("An image outlived the renderer and leaks"),
        }
    }
}
