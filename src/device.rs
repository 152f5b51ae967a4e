// Vulkan device selection and creation
//
// Picks a physical device that carries the hard required feature set of
// the GPU driven pipeline, probes the optional ones, and enumerates the
// four logical queues: graphics, present, dedicated transfer and
// dedicated compute.

use ash::extensions::khr;
use ash::vk;

use crate::instance::Instance;
use crate::{BlitzenError, Result};
use utils::log;

use std::ffi::CStr;
use std::sync::Arc;

/// Fence waits use a one second timeout; blowing through it is fatal
pub const FENCE_TIMEOUT_NS: u64 = 1_000_000_000;
/// Swapchain image acquisition shares the same patience
pub const ACQUIRE_TIMEOUT_NS: u64 = 1_000_000_000;

bitflags::bitflags! {
    /// Capabilities probed at init, never required
    pub struct OptionalFeatures: u32 {
        const MESH_SHADERS     = 1 << 0;
        const RAY_TRACING      = 1 << 1;
        const SHADER_PRINTF    = 1 << 2;
    }
}

#[derive(Copy, Clone)]
pub struct Queue {
    pub family: u32,
    pub handle: vk::Queue,
}

/// What the selected device turned out to support
#[derive(Copy, Clone)]
pub struct DeviceCaps {
    pub discrete_gpu: bool,
    pub optional: OptionalFeatures,
    /// Whether the compute queue is a dedicated family rather than an
    /// alias of the graphics queue
    pub dedicated_compute: bool,
}

/// The logical device and its queues
pub struct Device {
    pub(crate) inst: Arc<Instance>,
    pub(crate) dev: ash::Device,
    pub(crate) pdev: vk::PhysicalDevice,
    pub(crate) caps: DeviceCaps,

    pub(crate) graphics_queue: Queue,
    pub(crate) present_queue: Queue,
    pub(crate) transfer_queue: Queue,
    pub(crate) compute_queue: Queue,

    /// Push descriptors drive every per frame binding
    pub(crate) push_desc_loader: khr::PushDescriptor,
    /// Present only when ray tracing was probed successfully
    pub(crate) accel_loader: Option<khr::AccelerationStructure>,
}

struct QueueFamilies {
    graphics: u32,
    present: u32,
    transfer: u32,
    compute: Option<u32>,
}

impl Device {
    /// Creates the logical device for the first physical device that
    /// meets the requirements, preferring a discrete GPU.
    pub fn new(
        instance: Arc<Instance>,
        surface_loader: &khr::Surface,
        surface: vk::SurfaceKHR,
        require_compute: bool,
    ) -> Result<Self> {
        let inst = &instance.inst;
        let pdevices = unsafe {
            inst.enumerate_physical_devices()
                .map_err(|_| BlitzenError::VK_DEVICE_CREATION_FAILED)?
        };

        let mut fallback = None;
        let mut chosen = None;
        for pdev in pdevices.iter() {
            if !Self::check_required_features(inst, *pdev)
                || !Self::has_extension(inst, *pdev, khr::Swapchain::name())
                || !Self::has_extension(inst, *pdev, khr::PushDescriptor::name())
            {
                continue;
            }
            let props = unsafe { inst.get_physical_device_properties(*pdev) };
            if props.device_type == vk::PhysicalDeviceType::DISCRETE_GPU {
                chosen = Some((*pdev, true));
                break;
            }
            if fallback.is_none() {
                fallback = Some((*pdev, false));
            }
        }
        let (pdev, discrete_gpu) = chosen.or(fallback).ok_or_else(|| {
            log::error!("No physical device meets the required feature set");
            BlitzenError::VK_NOT_ALL_FEATURES_SUPPORTED
        })?;

        let families = Self::select_queue_families(
            inst,
            pdev,
            surface_loader,
            surface,
            require_compute,
        )?;

        let mut optional = OptionalFeatures::empty();
        if Self::has_extension(inst, pdev, vk::ExtMeshShaderFn::name()) {
            optional |= OptionalFeatures::MESH_SHADERS;
        }
        if Self::has_extension(inst, pdev, vk::KhrAccelerationStructureFn::name())
            && Self::has_extension(inst, pdev, vk::KhrRayQueryFn::name())
            && Self::has_extension(inst, pdev, vk::KhrDeferredHostOperationsFn::name())
        {
            optional |= OptionalFeatures::RAY_TRACING;
        }
        if Self::has_extension(inst, pdev, vk::KhrShaderNonSemanticInfoFn::name()) {
            optional |= OptionalFeatures::SHADER_PRINTF;
        }

        let dev = Self::create_device(inst, pdev, &families, optional)?;

        let graphics_queue = Queue {
            family: families.graphics,
            handle: unsafe { dev.get_device_queue(families.graphics, 0) },
        };
        let present_queue = Queue {
            family: families.present,
            handle: unsafe { dev.get_device_queue(families.present, 0) },
        };
        let transfer_queue = Queue {
            family: families.transfer,
            handle: unsafe { dev.get_device_queue(families.transfer, 0) },
        };
        let compute_queue = match families.compute {
            Some(family) => Queue {
                family,
                handle: unsafe { dev.get_device_queue(family, 0) },
            },
            // The cluster path was not requested; alias graphics so the
            // handle is always valid
            None => graphics_queue,
        };

        let push_desc_loader = khr::PushDescriptor::new(inst, &dev);
        let accel_loader = if optional.contains(OptionalFeatures::RAY_TRACING) {
            Some(khr::AccelerationStructure::new(inst, &dev))
        } else {
            None
        };

        log::info!(
            "Device ready: discrete={} optional={:?} queues g={} p={} t={} c={:?}",
            discrete_gpu,
            optional,
            families.graphics,
            families.present,
            families.transfer,
            families.compute
        );

        Ok(Self {
            inst: instance,
            dev,
            pdev,
            caps: DeviceCaps {
                discrete_gpu,
                optional,
                dedicated_compute: families.compute.is_some(),
            },
            graphics_queue,
            present_queue,
            transfer_queue,
            compute_queue,
            push_desc_loader,
            accel_loader,
        })
    }

    /// The hard required feature set. Every miss is logged by name so
    /// an unsupported device report says which feature failed.
    fn check_required_features(inst: &ash::Instance, pdev: vk::PhysicalDevice) -> bool {
        let mut vk11 = vk::PhysicalDeviceVulkan11Features::default();
        let mut vk12 = vk::PhysicalDeviceVulkan12Features::default();
        let mut vk13 = vk::PhysicalDeviceVulkan13Features::default();
        let mut features2 = vk::PhysicalDeviceFeatures2::builder()
            .push_next(&mut vk11)
            .push_next(&mut vk12)
            .push_next(&mut vk13)
            .build();
        unsafe { inst.get_physical_device_features2(pdev, &mut features2) };
        let base = features2.features;

        let required = [
            ("multiDrawIndirect", base.multi_draw_indirect),
            ("shaderInt16", base.shader_int16),
            ("storageBuffer16BitAccess", vk11.storage_buffer16_bit_access),
            ("shaderDrawParameters", vk11.shader_draw_parameters),
            ("bufferDeviceAddress", vk12.buffer_device_address),
            ("drawIndirectCount", vk12.draw_indirect_count),
            ("samplerFilterMinmax", vk12.sampler_filter_minmax),
            ("storageBuffer8BitAccess", vk12.storage_buffer8_bit_access),
            ("shaderInt8", vk12.shader_int8),
            ("runtimeDescriptorArray", vk12.runtime_descriptor_array),
            (
                "descriptorBindingPartiallyBound",
                vk12.descriptor_binding_partially_bound,
            ),
            (
                "descriptorBindingVariableDescriptorCount",
                vk12.descriptor_binding_variable_descriptor_count,
            ),
            (
                "shaderSampledImageArrayNonUniformIndexing",
                vk12.shader_sampled_image_array_non_uniform_indexing,
            ),
            ("synchronization2", vk13.synchronization2),
            ("dynamicRendering", vk13.dynamic_rendering),
        ];

        let mut ok = true;
        for (name, supported) in required.iter() {
            if *supported == vk::FALSE {
                log::error!("Device is missing the required feature {}", name);
                ok = false;
            }
        }
        ok
    }

    fn has_extension(inst: &ash::Instance, pdev: vk::PhysicalDevice, name: &CStr) -> bool {
        let props = match unsafe { inst.enumerate_device_extension_properties(pdev) } {
            Ok(props) => props,
            Err(_) => return false,
        };
        props.iter().any(|p| {
            let ext = unsafe { CStr::from_ptr(p.extension_name.as_ptr()) };
            ext == name
        })
    }

    /// Queue family enumeration. Transfer and compute prefer dedicated
    /// families so copies and cluster culling overlap graphics work;
    /// when the cluster path is off the compute family is not needed.
    fn select_queue_families(
        inst: &ash::Instance,
        pdev: vk::PhysicalDevice,
        surface_loader: &khr::Surface,
        surface: vk::SurfaceKHR,
        require_compute: bool,
    ) -> Result<QueueFamilies> {
        let props = unsafe { inst.get_physical_device_queue_family_properties(pdev) };

        let graphics = props
            .iter()
            .position(|p| p.queue_flags.contains(vk::QueueFlags::GRAPHICS))
            .ok_or(BlitzenError::VK_NO_SUITABLE_QUEUE)? as u32;

        let supports_present = |family: u32| unsafe {
            surface_loader
                .get_physical_device_surface_support(pdev, family, surface)
                .unwrap_or(false)
        };
        let present = if supports_present(graphics) {
            graphics
        } else {
            (0..props.len() as u32)
                .find(|f| supports_present(*f))
                .ok_or(BlitzenError::VK_NO_SUITABLE_QUEUE)?
        };

        let dedicated = |flags: vk::QueueFlags| {
            props.iter().position(|p| {
                p.queue_flags.contains(flags) && !p.queue_flags.contains(vk::QueueFlags::GRAPHICS)
            })
        };

        let transfer = match dedicated(vk::QueueFlags::TRANSFER) {
            Some(f) => f as u32,
            None => {
                log::info!("No dedicated transfer family, sharing the graphics family");
                graphics
            }
        };

        let compute = if require_compute {
            match dedicated(vk::QueueFlags::COMPUTE) {
                Some(f) => Some(f as u32),
                None => {
                    log::error!("The cluster path needs a dedicated compute queue family");
                    return Err(BlitzenError::VK_NO_SUITABLE_QUEUE);
                }
            }
        } else {
            None
        };

        Ok(QueueFamilies {
            graphics,
            present,
            transfer,
            compute,
        })
    }

    fn create_device(
        inst: &ash::Instance,
        pdev: vk::PhysicalDevice,
        families: &QueueFamilies,
        optional: OptionalFeatures,
    ) -> Result<ash::Device> {
        let mut unique_families = vec![families.graphics];
        for family in [
            Some(families.present),
            Some(families.transfer),
            families.compute,
        ]
        .iter()
        .flatten()
        {
            if !unique_families.contains(family) {
                unique_families.push(*family);
            }
        }

        let priorities = [1.0];
        let queue_infos: Vec<vk::DeviceQueueCreateInfo> = unique_families
            .iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(*family)
                    .queue_priorities(&priorities)
                    .build()
            })
            .collect();

        let mut extension_names = vec![
            khr::Swapchain::name().as_ptr(),
            khr::PushDescriptor::name().as_ptr(),
        ];
        if optional.contains(OptionalFeatures::RAY_TRACING) {
            extension_names.push(vk::KhrAccelerationStructureFn::name().as_ptr());
            extension_names.push(vk::KhrRayQueryFn::name().as_ptr());
            extension_names.push(vk::KhrDeferredHostOperationsFn::name().as_ptr());
        }
        if optional.contains(OptionalFeatures::SHADER_PRINTF) {
            extension_names.push(vk::KhrShaderNonSemanticInfoFn::name().as_ptr());
        }

        let features = vk::PhysicalDeviceFeatures::builder()
            .multi_draw_indirect(true)
            .shader_int16(true)
            .build();
        let mut vk11 = vk::PhysicalDeviceVulkan11Features::builder()
            .storage_buffer16_bit_access(true)
            .shader_draw_parameters(true)
            .build();
        let mut vk12 = vk::PhysicalDeviceVulkan12Features::builder()
            .buffer_device_address(true)
            .draw_indirect_count(true)
            .sampler_filter_minmax(true)
            .storage_buffer8_bit_access(true)
            .shader_int8(true)
            .runtime_descriptor_array(true)
            .descriptor_binding_partially_bound(true)
            .descriptor_binding_variable_descriptor_count(true)
            .shader_sampled_image_array_non_uniform_indexing(true)
            .build();
        let mut vk13 = vk::PhysicalDeviceVulkan13Features::builder()
            .synchronization2(true)
            .dynamic_rendering(true)
            .build();
        let mut accel_features = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::builder()
            .acceleration_structure(true)
            .build();
        let mut ray_query_features = vk::PhysicalDeviceRayQueryFeaturesKHR::builder()
            .ray_query(true)
            .build();

        let mut devinfo_builder = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extension_names)
            .enabled_features(&features)
            .push_next(&mut vk11)
            .push_next(&mut vk12)
            .push_next(&mut vk13);
        if optional.contains(OptionalFeatures::RAY_TRACING) {
            devinfo_builder = devinfo_builder
                .push_next(&mut accel_features)
                .push_next(&mut ray_query_features);
        }

        unsafe {
            inst.create_device(pdev, &devinfo_builder.build(), None)
                .map_err(|e| {
                    log::error!("Logical device creation failed: {:?}", e);
                    BlitzenError::VK_DEVICE_CREATION_FAILED
                })
        }
    }

    /// Blocks on a fence. A timeout is fatal per the frame contract.
    pub fn wait_fence(&self, fence: vk::Fence) -> Result<()> {
        unsafe {
            self.dev
                .wait_for_fences(&[fence], true, FENCE_TIMEOUT_NS)
                .map_err(|e| {
                    log::error!("Fence wait blew the one second budget: {:?}", e);
                    BlitzenError::FENCE_TIMEOUT
                })
        }
    }

    pub fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        unsafe {
            self.dev
                .reset_fences(&[fence])
                .map_err(|_| BlitzenError::FENCE_TIMEOUT)
        }
    }

    pub fn wait_and_reset_fence(&self, fence: vk::Fence) -> Result<()> {
        self.wait_fence(fence)?;
        self.reset_fence(fence)
    }

    pub fn wait_idle(&self) {
        unsafe {
            let _ = self.dev.device_wait_idle();
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        unsafe {
            // Everything allocated from this device is already gone;
            // drop the allocator before the device it allocates from
            self.dev.device_wait_idle().unwrap();
            crate::allocator::unregister();
            self.dev.destroy_device(None);
        }
    }
}
