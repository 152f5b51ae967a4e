// GPU buffer resources
//
// The static buffers hold the frozen scene: geometry, LODs, clusters,
// materials and the three render object lists, uploaded once through a
// staging buffer on the transfer queue. The variable buffers exist per
// frame in flight: a persistently mapped view uniform and the transform
// staging that restages the dynamic prefix every frame.

use ash::vk;
use gpu_allocator::MemoryLocation;
use memoffset::offset_of;

use crate::allocator::AllocBuffer;
use crate::commands;
use crate::device::Device;
use crate::handles;
use crate::resources::{CameraViewData, MeshTransform, SceneResources};
use crate::textures::DdsTexture;
use crate::Result;
use utils::log;

use std::mem;

/// One element of the indirect draw buffer: the draw id the vertex
/// shader uses to find its render object, then the indirect command the
/// hardware consumes.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct IndirectDraw {
    pub draw_id: u32,
    pub command: vk::DrawIndexedIndirectCommand,
}

pub const INDIRECT_DRAW_STRIDE: u32 = mem::size_of::<IndirectDraw>() as u32;

/// Byte offset vkCmdDrawIndexedIndirectCount reads commands at
pub fn indirect_command_offset() -> vk::DeviceSize {
    offset_of!(IndirectDraw, command) as vk::DeviceSize
}

/// What the pre-cluster cull emits for every visible object: which
/// clusters the cluster cull has to test
#[repr(C)]
#[derive(Copy, Clone)]
pub struct ClusterDispatch {
    pub object_id: u32,
    pub lod_index: u32,
    pub cluster_id: u32,
}

/// Buffers only the cluster path needs, for one object list
pub struct ClusterListBuffers {
    pub dispatch: AllocBuffer,
    pub dispatch_address: vk::DeviceAddress,
    pub count: AllocBuffer,
    pub count_address: vk::DeviceAddress,
    /// Host visible copy of the count word, read by the CPU between the
    /// compute and graphics submissions
    pub count_copy: AllocBuffer,
}

impl ClusterListBuffers {
    fn new(cluster_capacity: u32) -> Result<Self> {
        let dispatch = AllocBuffer::new(
            (cluster_capacity.max(1) as u64) * mem::size_of::<ClusterDispatch>() as u64,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::GpuOnly,
        )?;
        let count = AllocBuffer::new(
            mem::size_of::<u32>() as u64,
            vk::BufferUsageFlags::STORAGE_BUFFER
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
                | vk::BufferUsageFlags::TRANSFER_DST
                | vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::GpuOnly,
        )?;
        let count_copy = AllocBuffer::new(
            mem::size_of::<u32>() as u64,
            vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuToCpu,
        )?;

        let dispatch_address = dispatch.device_address();
        let count_address = count.device_address();
        Ok(Self {
            dispatch,
            dispatch_address,
            count,
            count_address,
            count_copy,
        })
    }

    /// The cluster count the last compute submission wrote
    pub fn read_count(&self) -> u32 {
        let ptr = self
            .count_copy
            .mapped_ptr()
            .expect("cluster count copy is host visible") as *const u32;
        unsafe { ptr.read_volatile() }
    }
}

/// The once-uploaded scene buffers
pub struct StaticBuffers {
    pub vertex: AllocBuffer,
    pub index: AllocBuffer,
    pub surface: AllocBuffer,
    pub lod: AllocBuffer,
    pub material: AllocBuffer,
    pub cluster: AllocBuffer,
    pub cluster_index: AllocBuffer,

    pub opaque_objects: AllocBuffer,
    pub opaque_address: vk::DeviceAddress,
    pub opaque_count: u32,
    pub transparent_objects: AllocBuffer,
    pub transparent_address: vk::DeviceAddress,
    pub transparent_count: u32,
    pub onpc_objects: AllocBuffer,
    pub onpc_address: vk::DeviceAddress,
    pub onpc_count: u32,

    /// One word per opaque object: was it visible last frame. The GPU
    /// owns every write after the setup zero fill.
    pub visibility: AllocBuffer,
    pub indirect_draw: AllocBuffer,
    pub indirect_count: AllocBuffer,
    /// How many commands the indirect draw buffer can hold
    pub indirect_capacity: u32,

    pub opaque_clusters: Option<ClusterListBuffers>,
    pub transparent_clusters: Option<ClusterListBuffers>,
}

impl StaticBuffers {
    /// Creates every device local buffer and uploads the scene through
    /// one staging buffer on the transfer queue. Blocks until the copy
    /// completes; this happens once per scene.
    pub fn build(device: &Device, scene: &SceneResources, enable_clusters: bool) -> Result<Self> {
        scene.validate()?;

        let storage_dst =
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST;
        let object_usage = storage_dst | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;

        let vertex = AllocBuffer::new(device_size(&scene.vertices), storage_dst, MemoryLocation::GpuOnly)?;
        let index = AllocBuffer::new(
            device_size(&scene.indices),
            storage_dst | vk::BufferUsageFlags::INDEX_BUFFER,
            MemoryLocation::GpuOnly,
        )?;
        let surface =
            AllocBuffer::new(device_size(&scene.surfaces), storage_dst, MemoryLocation::GpuOnly)?;
        let lod = AllocBuffer::new(device_size(&scene.lods), storage_dst, MemoryLocation::GpuOnly)?;
        let material =
            AllocBuffer::new(device_size(&scene.materials), storage_dst, MemoryLocation::GpuOnly)?;
        let cluster =
            AllocBuffer::new(device_size(&scene.clusters), storage_dst, MemoryLocation::GpuOnly)?;
        let cluster_index = AllocBuffer::new(
            device_size(&scene.cluster_indices),
            storage_dst | vk::BufferUsageFlags::INDEX_BUFFER,
            MemoryLocation::GpuOnly,
        )?;

        let opaque_objects = AllocBuffer::new(
            device_size(&scene.opaque_objects),
            object_usage,
            MemoryLocation::GpuOnly,
        )?;
        let transparent_objects = AllocBuffer::new(
            device_size(&scene.transparent_objects),
            object_usage,
            MemoryLocation::GpuOnly,
        )?;
        let onpc_objects = AllocBuffer::new(
            device_size(&scene.onpc_objects),
            object_usage,
            MemoryLocation::GpuOnly,
        )?;

        let opaque_count = scene.opaque_objects.len() as u32;
        let transparent_count = scene.transparent_objects.len() as u32;
        let onpc_count = scene.onpc_objects.len() as u32;

        // The cluster path can emit one command per cluster, the object
        // path at most one per object of the longest list
        let indirect_capacity = if enable_clusters {
            (scene.clusters.len() as u32).max(1)
        } else {
            opaque_count.max(transparent_count).max(onpc_count).max(1)
        };

        let visibility = AllocBuffer::new(
            (opaque_count.max(1) as u64) * mem::size_of::<u32>() as u64,
            storage_dst,
            MemoryLocation::GpuOnly,
        )?;
        let indirect_draw = AllocBuffer::new(
            indirect_capacity as u64 * INDIRECT_DRAW_STRIDE as u64,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::INDIRECT_BUFFER,
            MemoryLocation::GpuOnly,
        )?;
        let indirect_count = AllocBuffer::new(
            mem::size_of::<u32>() as u64,
            vk::BufferUsageFlags::STORAGE_BUFFER
                | vk::BufferUsageFlags::INDIRECT_BUFFER
                | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuOnly,
        )?;

        let (opaque_clusters, transparent_clusters) = if enable_clusters {
            let capacity = scene.clusters.len() as u32;
            (
                Some(ClusterListBuffers::new(capacity)?),
                Some(ClusterListBuffers::new(capacity)?),
            )
        } else {
            (None, None)
        };

        let buffers = Self {
            opaque_address: opaque_objects.device_address(),
            transparent_address: transparent_objects.device_address(),
            onpc_address: onpc_objects.device_address(),
            vertex,
            index,
            surface,
            lod,
            material,
            cluster,
            cluster_index,
            opaque_objects,
            opaque_count,
            transparent_objects,
            transparent_count,
            onpc_objects,
            onpc_count,
            visibility,
            indirect_draw,
            indirect_count,
            indirect_capacity,
            opaque_clusters,
            transparent_clusters,
        };
        buffers.upload(device, scene)?;
        Ok(buffers)
    }

    /// Fills one staging buffer with every scene array and records the
    /// copies plus the visibility zero fill in a single transfer queue
    /// submission.
    fn upload(&self, device: &Device, scene: &SceneResources) -> Result<()> {
        struct Copy {
            staging_offset: u64,
            dst: vk::Buffer,
            size: u64,
        }

        let mut total = 0u64;
        let mut copies = Vec::new();
        let mut plan = |size: u64, dst: vk::Buffer| {
            if size > 0 {
                copies.push(Copy {
                    staging_offset: total,
                    dst,
                    size,
                });
                total += size;
            }
        };
        plan(byte_len(&scene.vertices), self.vertex.buffer);
        plan(byte_len(&scene.indices), self.index.buffer);
        plan(byte_len(&scene.surfaces), self.surface.buffer);
        plan(byte_len(&scene.lods), self.lod.buffer);
        plan(byte_len(&scene.materials), self.material.buffer);
        plan(byte_len(&scene.clusters), self.cluster.buffer);
        plan(byte_len(&scene.cluster_indices), self.cluster_index.buffer);
        plan(byte_len(&scene.opaque_objects), self.opaque_objects.buffer);
        plan(
            byte_len(&scene.transparent_objects),
            self.transparent_objects.buffer,
        );
        plan(byte_len(&scene.onpc_objects), self.onpc_objects.buffer);

        let staging = AllocBuffer::new(
            total.max(1),
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
        )?;
        let mut cursor = 0usize;
        let mut stage = |bytes: &[u8]| {
            if !bytes.is_empty() {
                staging.write(cursor, bytes);
                cursor += bytes.len();
            }
        };
        stage(as_bytes(&scene.vertices));
        stage(as_bytes(&scene.indices));
        stage(as_bytes(&scene.surfaces));
        stage(as_bytes(&scene.lods));
        stage(as_bytes(&scene.materials));
        stage(as_bytes(&scene.clusters));
        stage(as_bytes(&scene.cluster_indices));
        stage(as_bytes(&scene.opaque_objects));
        stage(as_bytes(&scene.transparent_objects));
        stage(as_bytes(&scene.onpc_objects));

        let pool = handles::CommandPool::new(device.transfer_queue.family)?;
        let cbuf = pool.allocate(1)?[0];
        commands::begin_command_buffer(
            &device.dev,
            cbuf,
            vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
        )?;
        for copy in copies.iter() {
            commands::copy_buffer_to_buffer(
                &device.dev,
                cbuf,
                staging.buffer,
                copy.dst,
                copy.size,
                copy.staging_offset,
                0,
            );
        }
        // The once-per-scene visibility zero fill; the GPU owns every
        // write afterwards
        unsafe {
            device
                .dev
                .cmd_fill_buffer(cbuf, self.visibility.buffer, 0, vk::WHOLE_SIZE, 0);
        }
        commands::end_command_buffer(&device.dev, cbuf)?;

        let fence = handles::Fence::new(false)?;
        commands::submit_command_buffer(
            &device.dev,
            device.transfer_queue.handle,
            cbuf,
            &[],
            &[],
            fence.handle,
        )?;
        device.wait_and_reset_fence(fence.handle)?;

        log::info!(
            "Scene upload done: {} bytes across {} buffers",
            total,
            copies.len()
        );
        Ok(())
    }
}

/// Per frame-in-flight buffers: the view uniform and the transform
/// chain. Each slot owns its own device transform buffer so restaging
/// never races a frame still in flight.
pub struct VarBuffers {
    pub view_uniform: AllocBuffer,
    pub transform_device: AllocBuffer,
    pub transform_staging: AllocBuffer,
    /// Bytes of the dynamic prefix recopied every frame
    pub dynamic_transform_bytes: u64,
}

impl VarBuffers {
    pub fn new(scene: &SceneResources) -> Result<Self> {
        let view_uniform = AllocBuffer::new(
            mem::size_of::<CameraViewData>() as u64,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            MemoryLocation::CpuToGpu,
        )?;

        let transform_bytes = byte_len(&scene.transforms).max(1);
        let transform_device = AllocBuffer::new(
            transform_bytes,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuOnly,
        )?;
        let transform_staging = AllocBuffer::new(
            transform_bytes,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
        )?;
        // Static tail transforms ride along with the first frame's copy;
        // afterwards only the dynamic prefix matters
        transform_staging.write(0, &scene.transforms);

        Ok(Self {
            view_uniform,
            transform_device,
            transform_staging,
            dynamic_transform_bytes: byte_len(
                &scene.transforms[..scene.dynamic_transform_count.min(scene.transforms.len())],
            ),
        })
    }

    /// Writes the frame's view data through the persistent mapping.
    ///
    /// In the freeze frustum debug mode only the projection view matrix
    /// moves; the cull facing fields keep their stale values so the
    /// culling volume can be inspected from outside.
    pub fn write_view(&self, data: &CameraViewData, freeze_frustum: bool) {
        if freeze_frustum {
            self.view_uniform.write(
                offset_of!(CameraViewData, projection_view),
                &[data.projection_view],
            );
        } else {
            self.view_uniform.write(0, &[*data]);
        }
    }

    pub fn write_transform(&self, transform_id: u32, transform: &MeshTransform) {
        self.transform_staging.write(
            transform_id as usize * mem::size_of::<MeshTransform>(),
            &[*transform],
        );
    }

    /// Bytes the per frame transfer submission copies staging to device.
    /// The first frames copy everything so the static tail lands too.
    pub fn transform_copy_bytes(&self, first_frames: bool) -> u64 {
        if first_frames {
            self.transform_staging.size
        } else {
            self.dynamic_transform_bytes
        }
    }
}

/// Uploads a parsed DDS texture: one staging buffer, one buffer-image
/// copy per mip, and the layout transitions around them. Runs on the
/// graphics queue and blocks; textures load before the scene freezes.
pub fn upload_dds_texture(
    device: &Device,
    dds: &DdsTexture,
) -> Result<crate::allocator::AllocImage> {
    let image = crate::allocator::AllocImage::new(
        vk::Extent2D {
            width: dds.width,
            height: dds.height,
        },
        dds.format,
        vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
        vk::ImageAspectFlags::COLOR,
        dds.mip_levels,
    )?;

    let staging = AllocBuffer::new(
        dds.byte_size() as u64,
        vk::BufferUsageFlags::TRANSFER_SRC,
        MemoryLocation::CpuToGpu,
    )?;
    staging.write(0, &dds.data[..dds.byte_size()]);

    let regions: Vec<vk::BufferImageCopy> = dds
        .mip_regions()
        .iter()
        .enumerate()
        .map(|(mip, region)| {
            vk::BufferImageCopy::builder()
                .buffer_offset(region.offset as u64)
                .image_subresource(
                    vk::ImageSubresourceLayers::builder()
                        .aspect_mask(vk::ImageAspectFlags::COLOR)
                        .mip_level(mip as u32)
                        .base_array_layer(0)
                        .layer_count(1)
                        .build(),
                )
                .image_extent(vk::Extent3D {
                    width: region.width,
                    height: region.height,
                    depth: 1,
                })
                .build()
        })
        .collect();

    let pool = handles::CommandPool::new(device.graphics_queue.family)?;
    let cbuf = pool.allocate(1)?[0];
    commands::begin_command_buffer(
        &device.dev,
        cbuf,
        vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
    )?;

    let to_transfer = commands::image_barrier(
        image.image,
        vk::PipelineStageFlags2::TOP_OF_PIPE,
        vk::AccessFlags2::NONE,
        vk::PipelineStageFlags2::TRANSFER,
        vk::AccessFlags2::TRANSFER_WRITE,
        vk::ImageLayout::UNDEFINED,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        vk::ImageAspectFlags::COLOR,
    );
    commands::pipeline_barrier(&device.dev, cbuf, &[], &[to_transfer]);

    unsafe {
        device.dev.cmd_copy_buffer_to_image(
            cbuf,
            staging.buffer,
            image.image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &regions,
        );
    }

    let to_sampled = commands::image_barrier(
        image.image,
        vk::PipelineStageFlags2::TRANSFER,
        vk::AccessFlags2::TRANSFER_WRITE,
        vk::PipelineStageFlags2::FRAGMENT_SHADER,
        vk::AccessFlags2::SHADER_READ,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        vk::ImageAspectFlags::COLOR,
    );
    commands::pipeline_barrier(&device.dev, cbuf, &[], &[to_sampled]);

    commands::end_command_buffer(&device.dev, cbuf)?;
    let fence = handles::Fence::new(false)?;
    commands::submit_command_buffer(
        &device.dev,
        device.graphics_queue.handle,
        cbuf,
        &[],
        &[],
        fence.handle,
    )?;
    device.wait_and_reset_fence(fence.handle)?;

    Ok(image)
}

/// Device buffers cannot be zero sized; empty scene arrays still get
/// a one byte placeholder so the descriptor writes stay valid
fn device_size<T>(slice: &[T]) -> u64 {
    byte_len(slice).max(1)
}

fn byte_len<T>(slice: &[T]) -> u64 {
    (slice.len() * mem::size_of::<T>()) as u64
}

fn as_bytes<T: Copy>(slice: &[T]) -> &[u8] {
    unsafe {
        std::slice::from_raw_parts(slice.as_ptr() as *const u8, slice.len() * mem::size_of::<T>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indirect_draw_matches_the_shader_side_six_words() {
        assert_eq!(mem::size_of::<IndirectDraw>(), 24);
        assert_eq!(INDIRECT_DRAW_STRIDE, 24);
        // Commands start right after the draw id word
        assert_eq!(indirect_command_offset(), 4);
    }

    #[test]
    fn cluster_dispatch_is_three_words() {
        assert_eq!(mem::size_of::<ClusterDispatch>(), 12);
    }
}
