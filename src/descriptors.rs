// Descriptor layouts and the binding id contract
//
// One push descriptor layout is shared by the culling and geometry
// pipelines; its slot numbers are the contract with the shaders and
// never change at runtime. The texture array is the only conventionally
// allocated set, written once after the scene's textures upload.

use ash::vk;

use crate::device::Device;
use crate::handles;
use crate::{BlitzenError, Result};

/// The bindless texture array capacity
pub const MAX_TEXTURE_COUNT: u32 = 1024;

/// Set index of the shared push descriptor layout
pub const PUSH_DESCRIPTOR_SET_ID: u32 = 0;
/// Set index of the texture array for the graphics pipelines
pub const TEXTURE_DESCRIPTOR_SET_ID: u32 = 1;

/// The stable slot ids of the shared layout. The discriminants are the
/// shader-side `binding` qualifiers.
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BindingId {
    ViewData = 0,
    Vertices = 1,
    Surfaces = 2,
    DepthPyramid = 3,
    Lods = 4,
    Transforms = 5,
    Materials = 6,
    IndirectDraws = 7,
    IndirectCount = 9,
    Visibility = 10,
    Clusters = 12,
    ClusterIndices = 13,
    OnpcObjects = 14,
    Tlas = 15,
}

/// Every descriptor layout the pipelines bind against, plus the one
/// allocated texture set
pub struct Descriptors {
    /// The shared push descriptor layout for culling and geometry
    pub shared: handles::DescriptorSetLayout,
    /// Two bindings per depth pyramid reduction step: dst mip then src
    pub pyramid: handles::DescriptorSetLayout,
    /// Swapchain composite: dst swapchain image then src color sampler
    pub composite: handles::DescriptorSetLayout,
    /// Background fill: just the color attachment as a storage image
    pub background: handles::DescriptorSetLayout,

    pub textures: handles::DescriptorSetLayout,
    pub texture_pool: handles::DescriptorPool,
    pub texture_set: vk::DescriptorSet,
}

impl Descriptors {
    pub fn new(device: &Device, rt_supported: bool) -> Result<Self> {
        let shared = Self::create_shared_layout(device, rt_supported)?;
        let pyramid = Self::create_two_image_layout(
            device,
            vk::DescriptorType::STORAGE_IMAGE,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        )?;
        let composite = Self::create_two_image_layout(
            device,
            vk::DescriptorType::STORAGE_IMAGE,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        )?;
        let background = Self::create_background_layout(device)?;
        let (textures, texture_pool, texture_set) = Self::create_texture_set(device)?;

        Ok(Self {
            shared,
            pyramid,
            composite,
            background,
            textures,
            texture_pool,
            texture_set,
        })
    }

    /// The shared layout. Stage visibility follows who actually reads
    /// each slot; the TLAS slot exists only on ray tracing devices so
    /// no write array ever carries a dangling acceleration structure
    /// pointer on the others.
    fn create_shared_layout(
        device: &Device,
        rt_supported: bool,
    ) -> Result<handles::DescriptorSetLayout> {
        let storage = vk::DescriptorType::STORAGE_BUFFER;
        let graphics_compute =
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::COMPUTE;

        let mut bindings = vec![
            binding(
                BindingId::ViewData as u32,
                vk::DescriptorType::UNIFORM_BUFFER,
                vk::ShaderStageFlags::VERTEX
                    | vk::ShaderStageFlags::FRAGMENT
                    | vk::ShaderStageFlags::COMPUTE,
            ),
            binding(
                BindingId::Vertices as u32,
                storage,
                vk::ShaderStageFlags::VERTEX,
            ),
            binding(BindingId::Surfaces as u32, storage, graphics_compute),
            binding(
                BindingId::DepthPyramid as u32,
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                vk::ShaderStageFlags::COMPUTE,
            ),
            binding(BindingId::Lods as u32, storage, graphics_compute),
            binding(BindingId::Transforms as u32, storage, graphics_compute),
            binding(
                BindingId::Materials as u32,
                storage,
                vk::ShaderStageFlags::FRAGMENT,
            ),
            binding(BindingId::IndirectDraws as u32, storage, graphics_compute),
            binding(
                BindingId::IndirectCount as u32,
                storage,
                vk::ShaderStageFlags::COMPUTE,
            ),
            binding(
                BindingId::Visibility as u32,
                storage,
                vk::ShaderStageFlags::COMPUTE,
            ),
            binding(
                BindingId::Clusters as u32,
                storage,
                vk::ShaderStageFlags::COMPUTE,
            ),
            binding(
                BindingId::ClusterIndices as u32,
                storage,
                vk::ShaderStageFlags::COMPUTE,
            ),
            binding(BindingId::OnpcObjects as u32, storage, graphics_compute),
        ];
        if rt_supported {
            bindings.push(binding(
                BindingId::Tlas as u32,
                vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
                vk::ShaderStageFlags::FRAGMENT,
            ));
        }

        let info = vk::DescriptorSetLayoutCreateInfo::builder()
            .flags(vk::DescriptorSetLayoutCreateFlags::PUSH_DESCRIPTOR_KHR)
            .bindings(&bindings)
            .build();
        let layout = unsafe {
            device
                .dev
                .create_descriptor_set_layout(&info, None)
                .map_err(|_| BlitzenError::DESCRIPTOR_SETUP_FAILED)?
        };
        Ok(handles::DescriptorSetLayout::wrap(layout))
    }

    /// Push descriptor layout with a destination image at binding 0 and
    /// a sampled source at binding 1 (depth pyramid and composite both
    /// have this shape)
    fn create_two_image_layout(
        device: &Device,
        dst_type: vk::DescriptorType,
        src_type: vk::DescriptorType,
    ) -> Result<handles::DescriptorSetLayout> {
        let bindings = [
            binding(0, dst_type, vk::ShaderStageFlags::COMPUTE),
            binding(1, src_type, vk::ShaderStageFlags::COMPUTE),
        ];
        let info = vk::DescriptorSetLayoutCreateInfo::builder()
            .flags(vk::DescriptorSetLayoutCreateFlags::PUSH_DESCRIPTOR_KHR)
            .bindings(&bindings)
            .build();
        let layout = unsafe {
            device
                .dev
                .create_descriptor_set_layout(&info, None)
                .map_err(|_| BlitzenError::DESCRIPTOR_SETUP_FAILED)?
        };
        Ok(handles::DescriptorSetLayout::wrap(layout))
    }

    fn create_background_layout(device: &Device) -> Result<handles::DescriptorSetLayout> {
        let bindings = [binding(
            0,
            vk::DescriptorType::STORAGE_IMAGE,
            vk::ShaderStageFlags::COMPUTE,
        )];
        let info = vk::DescriptorSetLayoutCreateInfo::builder()
            .flags(vk::DescriptorSetLayoutCreateFlags::PUSH_DESCRIPTOR_KHR)
            .bindings(&bindings)
            .build();
        let layout = unsafe {
            device
                .dev
                .create_descriptor_set_layout(&info, None)
                .map_err(|_| BlitzenError::DESCRIPTOR_SETUP_FAILED)?
        };
        Ok(handles::DescriptorSetLayout::wrap(layout))
    }

    /// The texture array set: one binding holding a variable sized,
    /// partially bound sampler array, allocated from its own one shot
    /// pool and bound at set 1 for the graphics passes.
    fn create_texture_set(
        device: &Device,
    ) -> Result<(
        handles::DescriptorSetLayout,
        handles::DescriptorPool,
        vk::DescriptorSet,
    )> {
        let bindings = [vk::DescriptorSetLayoutBinding::builder()
            .binding(0)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .descriptor_count(MAX_TEXTURE_COUNT)
            .stage_flags(vk::ShaderStageFlags::FRAGMENT)
            .build()];
        let binding_flags = [vk::DescriptorBindingFlags::PARTIALLY_BOUND
            | vk::DescriptorBindingFlags::VARIABLE_DESCRIPTOR_COUNT];
        let mut flags_info = vk::DescriptorSetLayoutBindingFlagsCreateInfo::builder()
            .binding_flags(&binding_flags)
            .build();
        let info = vk::DescriptorSetLayoutCreateInfo::builder()
            .bindings(&bindings)
            .push_next(&mut flags_info)
            .build();
        let layout = unsafe {
            device
                .dev
                .create_descriptor_set_layout(&info, None)
                .map_err(|_| BlitzenError::DESCRIPTOR_SETUP_FAILED)?
        };
        let layout = handles::DescriptorSetLayout::wrap(layout);

        let sizes = [vk::DescriptorPoolSize::builder()
            .ty(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .descriptor_count(MAX_TEXTURE_COUNT)
            .build()];
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .pool_sizes(&sizes)
            .max_sets(1)
            .build();
        let pool = unsafe {
            device
                .dev
                .create_descriptor_pool(&pool_info, None)
                .map_err(|_| BlitzenError::DESCRIPTOR_SETUP_FAILED)?
        };
        let pool = handles::DescriptorPool::wrap(pool);

        let counts = [MAX_TEXTURE_COUNT];
        let mut count_info = vk::DescriptorSetVariableDescriptorCountAllocateInfo::builder()
            .descriptor_counts(&counts)
            .build();
        let layouts = [layout.handle];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool.handle)
            .set_layouts(&layouts)
            .push_next(&mut count_info)
            .build();
        let set = unsafe {
            device
                .dev
                .allocate_descriptor_sets(&alloc_info)
                .map_err(|_| BlitzenError::DESCRIPTOR_SETUP_FAILED)?[0]
        };

        Ok((layout, pool, set))
    }

    /// Writes every loaded texture into the array. Called once when the
    /// scene freezes; the set is immutable afterwards.
    pub fn write_texture_array(
        &self,
        device: &Device,
        image_infos: &[vk::DescriptorImageInfo],
    ) {
        if image_infos.is_empty() {
            return;
        }
        let write = vk::WriteDescriptorSet::builder()
            .dst_set(self.texture_set)
            .dst_binding(0)
            .dst_array_element(0)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .image_info(image_infos)
            .build();
        unsafe {
            device.dev.update_descriptor_sets(&[write], &[]);
        }
    }
}

fn binding(
    id: u32,
    ty: vk::DescriptorType,
    stages: vk::ShaderStageFlags,
) -> vk::DescriptorSetLayoutBinding {
    vk::DescriptorSetLayoutBinding::builder()
        .binding(id)
        .descriptor_type(ty)
        .descriptor_count(1)
        .stage_flags(stages)
        .build()
}

/// Whole buffer descriptor info
pub fn buffer_info(buffer: vk::Buffer) -> vk::DescriptorBufferInfo {
    vk::DescriptorBufferInfo::builder()
        .buffer(buffer)
        .offset(0)
        .range(vk::WHOLE_SIZE)
        .build()
}

/// A push descriptor write for one buffer slot
pub fn buffer_write(
    id: BindingId,
    ty: vk::DescriptorType,
    info: &vk::DescriptorBufferInfo,
) -> vk::WriteDescriptorSet {
    vk::WriteDescriptorSet::builder()
        .dst_binding(id as u32)
        .dst_array_element(0)
        .descriptor_type(ty)
        .buffer_info(std::slice::from_ref(info))
        .build()
}

/// A push descriptor write for one image slot
pub fn image_write(
    binding: u32,
    ty: vk::DescriptorType,
    info: &vk::DescriptorImageInfo,
) -> vk::WriteDescriptorSet {
    vk::WriteDescriptorSet::builder()
        .dst_binding(binding)
        .dst_array_element(0)
        .descriptor_type(ty)
        .image_info(std::slice::from_ref(info))
        .build()
}
