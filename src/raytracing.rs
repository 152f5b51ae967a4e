// Acceleration structures for the ray query path
//
// Built once at scene load on devices that probed ray tracing support:
// one BLAS per primitive surface over its finest LOD, packed into a
// shared buffer, then a TLAS over per object instances. The TLAS feeds
// the fragment stage through the conditional descriptor slot.

use ash::extensions::khr;
use ash::vk;

use crate::allocator::AllocBuffer;
use crate::buffers::StaticBuffers;
use crate::commands;
use crate::device::Device;
use crate::handles;
use crate::resources::{transform_to_rows, SceneResources, Vertex};
use crate::{BlitzenError, Result};
use utils::log;

use gpu_allocator::MemoryLocation;

use std::mem;

/// Acceleration structure buffer offsets need this alignment
const ACCEL_ALIGNMENT: u64 = 256;

/// A scoped acceleration structure handle. Destruction goes through the
/// extension loader, so the wrapper carries its own clone of it.
pub struct AccelStructure {
    loader: khr::AccelerationStructure,
    pub handle: vk::AccelerationStructureKHR,
}

impl Drop for AccelStructure {
    fn drop(&mut self) {
        unsafe {
            self.loader.destroy_acceleration_structure(self.handle, None);
        }
    }
}

/// Everything the ray query path owns for the scene's lifetime
pub struct RayTracing {
    pub blas_buffer: AllocBuffer,
    pub blas: Vec<AccelStructure>,
    /// Kept alive for the TLAS which references it
    pub instance_buffer: AllocBuffer,
    pub tlas_buffer: AllocBuffer,
    pub tlas: AccelStructure,
}

impl RayTracing {
    /// Builds the BLAS array and the TLAS. Blocks on the graphics queue
    /// twice; this runs once inside scene setup.
    pub fn build(
        device: &Device,
        static_buffers: &StaticBuffers,
        scene: &SceneResources,
    ) -> Result<Self> {
        let loader = device
            .accel_loader
            .as_ref()
            .ok_or(BlitzenError::VK_NOT_ALL_FEATURES_SUPPORTED)?
            .clone();
        if scene.surfaces.is_empty() {
            log::error!("Cannot build acceleration structures without any meshes");
            return Err(BlitzenError::INVALID_GEOMETRY);
        }

        let (blas_buffer, blas) = Self::build_blas(device, &loader, static_buffers, scene)?;

        let blas_addresses: Vec<vk::DeviceAddress> = blas
            .iter()
            .map(|b| {
                let info = vk::AccelerationStructureDeviceAddressInfoKHR::builder()
                    .acceleration_structure(b.handle)
                    .build();
                unsafe { loader.get_acceleration_structure_device_address(&info) }
            })
            .collect();

        let (instance_buffer, tlas_buffer, tlas) =
            Self::build_tlas(device, &loader, scene, &blas_addresses)?;

        Ok(Self {
            blas_buffer,
            blas,
            instance_buffer,
            tlas_buffer,
            tlas,
        })
    }

    fn build_blas(
        device: &Device,
        loader: &khr::AccelerationStructure,
        static_buffers: &StaticBuffers,
        scene: &SceneResources,
    ) -> Result<(AllocBuffer, Vec<AccelStructure>)> {
        let surface_count = scene.surfaces.len();
        let vertex_address = static_buffers.vertex.device_address();
        let index_address = static_buffers.index.device_address();

        let mut geometries = Vec::with_capacity(surface_count);
        let mut primitive_counts = Vec::with_capacity(surface_count);
        for (i, surface) in scene.surfaces.iter().enumerate() {
            // The finest LOD is the ray tracing geometry
            let lod0 = scene.lods[surface.lod_offset as usize];

            // This surface's vertex range ends where the next one begins
            let vertex_end = scene
                .surfaces
                .get(i + 1)
                .map(|s| s.vertex_offset)
                .unwrap_or(scene.vertices.len() as u32);

            let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::builder()
                .vertex_format(vk::Format::R32G32B32_SFLOAT)
                .vertex_data(vk::DeviceOrHostAddressConstKHR {
                    device_address: vertex_address
                        + surface.vertex_offset as u64 * mem::size_of::<Vertex>() as u64,
                })
                .vertex_stride(mem::size_of::<Vertex>() as u64)
                .max_vertex(vertex_end - surface.vertex_offset)
                .index_type(vk::IndexType::UINT32)
                .index_data(vk::DeviceOrHostAddressConstKHR {
                    device_address: index_address
                        + lod0.first_index as u64 * mem::size_of::<u32>() as u64,
                })
                .build();
            geometries.push(
                vk::AccelerationStructureGeometryKHR::builder()
                    .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
                    .flags(vk::GeometryFlagsKHR::OPAQUE)
                    .geometry(vk::AccelerationStructureGeometryDataKHR { triangles })
                    .build(),
            );
            primitive_counts.push(lod0.index_count / 3);
        }

        // Size every build up front so one buffer and one scratch serve
        // the whole array
        let mut accel_offsets = Vec::with_capacity(surface_count);
        let mut accel_sizes = Vec::with_capacity(surface_count);
        let mut scratch_offsets = Vec::with_capacity(surface_count);
        let mut total_accel = 0u64;
        let mut total_scratch = 0u64;
        let mut build_infos = Vec::with_capacity(surface_count);
        for i in 0..surface_count {
            let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::builder()
                .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL)
                .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
                .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
                .geometries(std::slice::from_ref(&geometries[i]))
                .build();

            let sizes = unsafe {
                loader.get_acceleration_structure_build_sizes(
                    vk::AccelerationStructureBuildTypeKHR::DEVICE,
                    &build_info,
                    &[primitive_counts[i]],
                )
            };
            accel_offsets.push(total_accel);
            accel_sizes.push(sizes.acceleration_structure_size);
            scratch_offsets.push(total_scratch);
            total_accel = align_up(total_accel + sizes.acceleration_structure_size);
            total_scratch = align_up(total_scratch + sizes.build_scratch_size);
            build_infos.push(build_info);
        }

        let blas_buffer = AllocBuffer::new(
            total_accel,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::GpuOnly,
        )?;
        let scratch = AllocBuffer::new(
            total_scratch,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::GpuOnly,
        )?;
        let scratch_address = scratch.device_address();

        let mut blas = Vec::with_capacity(surface_count);
        let mut ranges = Vec::with_capacity(surface_count);
        for i in 0..surface_count {
            let create_info = vk::AccelerationStructureCreateInfoKHR::builder()
                .buffer(blas_buffer.buffer)
                .offset(accel_offsets[i])
                .size(accel_sizes[i])
                .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL)
                .build();
            let handle = unsafe {
                loader
                    .create_acceleration_structure(&create_info, None)
                    .map_err(|_| BlitzenError::ALLOCATION_FAILED)?
            };
            blas.push(AccelStructure {
                loader: loader.clone(),
                handle,
            });

            build_infos[i].dst_acceleration_structure = handle;
            build_infos[i].scratch_data = vk::DeviceOrHostAddressKHR {
                device_address: scratch_address + scratch_offsets[i],
            };
            ranges.push(
                vk::AccelerationStructureBuildRangeInfoKHR::builder()
                    .primitive_count(primitive_counts[i])
                    .build(),
            );
        }

        let range_refs: Vec<&[vk::AccelerationStructureBuildRangeInfoKHR]> =
            ranges.iter().map(std::slice::from_ref).collect();

        Self::build_on_graphics_queue(device, |cbuf| unsafe {
            loader.cmd_build_acceleration_structures(cbuf, &build_infos, &range_refs);
        })?;

        Ok((blas_buffer, blas))
    }

    fn build_tlas(
        device: &Device,
        loader: &khr::AccelerationStructure,
        scene: &SceneResources,
        blas_addresses: &[vk::DeviceAddress],
    ) -> Result<(AllocBuffer, AllocBuffer, AccelStructure)> {
        let draw_count = scene.opaque_objects.len().max(1) as u32;

        let instance_buffer = AllocBuffer::new(
            draw_count as u64 * mem::size_of::<vk::AccelerationStructureInstanceKHR>() as u64,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::CpuToGpu,
        )?;

        for (i, object) in scene.opaque_objects.iter().enumerate() {
            let transform = &scene.transforms[object.transform_id as usize];
            let instance = vk::AccelerationStructureInstanceKHR {
                transform: transform_to_rows(transform),
                instance_custom_index_and_mask: vk::Packed24_8::new(i as u32, 1),
                instance_shader_binding_table_record_offset_and_flags: vk::Packed24_8::new(0, 0),
                acceleration_structure_reference: vk::AccelerationStructureReferenceKHR {
                    device_handle: blas_addresses[object.surface_id as usize],
                },
            };
            instance_buffer.write(
                i * mem::size_of::<vk::AccelerationStructureInstanceKHR>(),
                &[instance],
            );
        }

        let instances_data = vk::AccelerationStructureGeometryInstancesDataKHR::builder()
            .array_of_pointers(false)
            .data(vk::DeviceOrHostAddressConstKHR {
                device_address: instance_buffer.device_address(),
            })
            .build();
        let geometry = vk::AccelerationStructureGeometryKHR::builder()
            .geometry_type(vk::GeometryTypeKHR::INSTANCES)
            .geometry(vk::AccelerationStructureGeometryDataKHR {
                instances: instances_data,
            })
            .build();

        let mut build_info = vk::AccelerationStructureBuildGeometryInfoKHR::builder()
            .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL)
            .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(std::slice::from_ref(&geometry))
            .build();

        let instance_count = scene.opaque_objects.len() as u32;
        let sizes = unsafe {
            loader.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &build_info,
                &[instance_count],
            )
        };

        let tlas_buffer = AllocBuffer::new(
            sizes.acceleration_structure_size,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::GpuOnly,
        )?;
        let scratch = AllocBuffer::new(
            sizes.build_scratch_size,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::GpuOnly,
        )?;

        let create_info = vk::AccelerationStructureCreateInfoKHR::builder()
            .buffer(tlas_buffer.buffer)
            .size(sizes.acceleration_structure_size)
            .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL)
            .build();
        let handle = unsafe {
            loader
                .create_acceleration_structure(&create_info, None)
                .map_err(|_| BlitzenError::ALLOCATION_FAILED)?
        };
        let tlas = AccelStructure {
            loader: loader.clone(),
            handle,
        };

        build_info.dst_acceleration_structure = tlas.handle;
        build_info.scratch_data = vk::DeviceOrHostAddressKHR {
            device_address: scratch.device_address(),
        };
        let range = vk::AccelerationStructureBuildRangeInfoKHR::builder()
            .primitive_count(instance_count)
            .build();

        Self::build_on_graphics_queue(device, |cbuf| unsafe {
            loader.cmd_build_acceleration_structures(
                cbuf,
                std::slice::from_ref(&build_info),
                &[std::slice::from_ref(&range)],
            );
        })?;

        Ok((instance_buffer, tlas_buffer, tlas))
    }

    /// Records one build batch and blocks until the queue drains it
    fn build_on_graphics_queue<F: FnOnce(vk::CommandBuffer)>(
        device: &Device,
        record: F,
    ) -> Result<()> {
        let pool = handles::CommandPool::new(device.graphics_queue.family)?;
        let cbuf = pool.allocate(1)?[0];
        commands::begin_command_buffer(
            &device.dev,
            cbuf,
            vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
        )?;
        record(cbuf);
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
        device.wait_and_reset_fence(fence.handle)
    }
}

fn align_up(v: u64) -> u64 {
    (v + ACCEL_ALIGNMENT - 1) & !(ACCEL_ALIGNMENT - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acceleration_offsets_respect_the_spec_alignment() {
        assert_eq!(align_up(0), 0);
        assert_eq!(align_up(1), 256);
        assert_eq!(align_up(256), 256);
        assert_eq!(align_up(257), 512);
    }
}
