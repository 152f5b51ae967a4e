// The draw orchestrator
//
// Records the per frame command stream in the prescribed order with the
// prescribed barriers: transform upload on the transfer queue, first
// (frustum + LOD) cull, first opaque draw, depth pyramid reduction,
// second (occlusion) cull of previously invisible objects, second draw,
// the optional reflective and transparent passes, and the compute
// composite into the swapchain image. The cluster path splices a
// compute queue submission in front of the graphics work.

use ash::vk;
use cgmath::Matrix4;

use crate::allocator::AllocImage;
use crate::buffers::{
    indirect_command_offset, upload_dds_texture, StaticBuffers, VarBuffers, INDIRECT_DRAW_STRIDE,
};
use crate::commands::{self, group_count, push_constant_bytes};
use crate::descriptors::{
    buffer_info, buffer_write, image_write, BindingId, Descriptors, PUSH_DESCRIPTOR_SET_ID,
    TEXTURE_DESCRIPTOR_SET_ID,
};
use crate::device::{Device, OptionalFeatures};
use crate::frame::{FrameTools, FRAMES_IN_FLIGHT};
use crate::handles;
use crate::instance::Instance;
use crate::pipelines::{
    BackgroundPushConstant, ClusterCullPushConstant, CullPushConstant, ExtentPushConstant,
    GraphicsPushConstant, LoadingPushConstant, Pipelines,
};
use crate::raytracing::RayTracing;
use crate::resources::{MeshTransform, SceneResources};
use crate::swapchain::{Attachments, Surface, Swapchain, WINDOW_CLEAR_COLOR};
use crate::textures::DdsTexture;
use crate::{BlitzenError, CreateInfo, DrawContext, Result};
use utils::log;

use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use utils::timing::StopWatch;

use std::path::{Path, PathBuf};
use std::sync::Arc;

/// The culling shaders run 64 wide
const CULL_LOCAL_SIZE: u32 = 64;
/// Depth pyramid reduction tiles
const PYRAMID_TILE: u32 = 32;
/// Swapchain composite tiles
const COMPOSITE_TILE: u32 = 8;
/// Background fill tiles
const BACKGROUND_TILE: u32 = 16;

/// How the renderer is doing, queryable by the collaborator
#[derive(Copy, Clone, Default)]
pub struct RendererStats {
    pub discrete_gpu: bool,
    pub mesh_shader_support: bool,
    pub ray_tracing_supported: bool,
    pub transparent_objects_exist: bool,
    pub onpc_objects_exist: bool,
}

pub struct Renderer {
    r_scene_ready: bool,
    r_stats: RendererStats,
    r_current_frame: usize,
    r_frame_count: u64,
    /// Zero extent resize parks the renderer until a real extent shows up
    r_suspended: bool,
    r_enable_clusters: bool,
    /// Accumulated loading screen time, drives the triangle pulse
    r_loading_time: f32,
    r_shader_dir: PathBuf,

    // Scene owned resources. Everything here must drop before the
    // device unregisters the handle triple, which field order
    // guarantees.
    r_static: Option<StaticBuffers>,
    r_rt: Option<RayTracing>,
    r_var_buffers: Vec<VarBuffers>,
    r_textures: Vec<AllocImage>,
    r_texture_sampler: handles::Sampler,

    r_frame_tools: Vec<FrameTools>,
    r_idle_pool: handles::CommandPool,
    r_idle_cbuf: vk::CommandBuffer,

    r_pipelines: Pipelines,
    r_descriptors: Descriptors,
    r_attachments: Attachments,
    r_draw_extent: vk::Extent2D,
    r_swapchain: Swapchain,
    r_surface: Surface,

    r_dev: Arc<Device>,
    r_inst: Arc<Instance>,
}

impl Renderer {
    pub fn new(
        window_width: u32,
        window_height: u32,
        display_handle: RawDisplayHandle,
        window_handle: RawWindowHandle,
        info: &CreateInfo,
    ) -> Result<Self> {
        let instance = Arc::new(Instance::new(display_handle)?);
        let surface = Surface::new(&instance, display_handle, window_handle)?;
        let device = Arc::new(Device::new(
            instance.clone(),
            &surface.loader,
            surface.handle,
            info.enable_clusters,
        )?);

        // The handle triple every scoped resource consults from here on
        crate::allocator::register(&instance.inst, &device.dev, device.pdev)?;

        let swapchain = Swapchain::new(&device, &surface, window_width, window_height, None)?;
        let draw_extent = swapchain.extent;
        let attachments = Attachments::new(&device, draw_extent)?;

        let rt_supported = device.caps.optional.contains(OptionalFeatures::RAY_TRACING);
        let descriptors = Descriptors::new(&device, rt_supported)?;
        let pipelines = Pipelines::new(
            &device,
            &descriptors,
            &info.shader_dir,
            swapchain.format,
            info.enable_clusters,
        )?;

        let mut frame_tools = Vec::with_capacity(FRAMES_IN_FLIGHT);
        for _ in 0..FRAMES_IN_FLIGHT {
            frame_tools.push(FrameTools::new(&device, info.enable_clusters)?);
        }
        let idle_pool = handles::CommandPool::new(device.graphics_queue.family)?;
        let idle_cbuf = idle_pool.allocate(1)?[0];

        let texture_sampler = create_texture_sampler(&device)?;

        let stats = RendererStats {
            discrete_gpu: device.caps.discrete_gpu,
            mesh_shader_support: device.caps.optional.contains(OptionalFeatures::MESH_SHADERS),
            ray_tracing_supported: rt_supported,
            ..Default::default()
        };

        Ok(Self {
            r_scene_ready: false,
            r_stats: stats,
            r_current_frame: 0,
            r_frame_count: 0,
            r_suspended: false,
            r_enable_clusters: info.enable_clusters,
            r_loading_time: 0.0,
            r_shader_dir: info.shader_dir.clone(),
            r_static: None,
            r_rt: None,
            r_var_buffers: Vec::new(),
            r_textures: Vec::new(),
            r_texture_sampler: texture_sampler,
            r_frame_tools: frame_tools,
            r_idle_pool: idle_pool,
            r_idle_cbuf: idle_cbuf,
            r_pipelines: pipelines,
            r_descriptors: descriptors,
            r_attachments: attachments,
            r_draw_extent: draw_extent,
            r_swapchain: swapchain,
            r_surface: surface,
            r_dev: device,
            r_inst: instance,
        })
    }

    pub fn stats(&self) -> RendererStats {
        self.r_stats
    }

    pub fn draw_extent(&self) -> (u32, u32) {
        (self.r_draw_extent.width, self.r_draw_extent.height)
    }

    /// What the view uniform's pyramidWidth/pyramidHeight have to carry
    pub fn pyramid_extent(&self) -> (u32, u32) {
        (
            self.r_attachments.pyramid_extent.width,
            self.r_attachments.pyramid_extent.height,
        )
    }

    /// Loads a DDS texture into the bindless array. Only legal before
    /// the scene freezes; the returned tag indexes the array.
    pub fn upload_texture(&mut self, filepath: &Path) -> Result<u32> {
        if self.r_scene_ready {
            return Err(BlitzenError::SCENE_ALREADY_FROZEN);
        }
        let dds = DdsTexture::load(filepath)?;
        let image = upload_dds_texture(&self.r_dev, &dds)?;
        self.r_textures.push(image);
        Ok(self.r_textures.len() as u32 - 1)
    }

    /// Freezes the scene: uploads the static buffers, builds the per
    /// frame variable buffers, the acceleration structures on capable
    /// devices, and the texture array descriptors. One shot.
    pub fn setup_for_rendering(&mut self, scene: &SceneResources) -> Result<()> {
        if self.r_scene_ready {
            log::error!("setup_for_rendering called twice; the scene is already frozen");
            return Err(BlitzenError::SCENE_ALREADY_FROZEN);
        }

        let static_buffers = StaticBuffers::build(&self.r_dev, scene, self.r_enable_clusters)?;

        let mut var_buffers = Vec::with_capacity(FRAMES_IN_FLIGHT);
        for _ in 0..FRAMES_IN_FLIGHT {
            var_buffers.push(VarBuffers::new(scene)?);
        }

        // Ray tracing is probed, never required: a failed build logs
        // and the TLAS binding simply stays absent
        let rt = if self.r_stats.ray_tracing_supported && !scene.surfaces.is_empty() {
            match RayTracing::build(&self.r_dev, &static_buffers, scene) {
                Ok(rt) => Some(rt),
                Err(e) => {
                    log::error!("Acceleration structure build failed: {:?}", e);
                    None
                }
            }
        } else {
            None
        };

        let image_infos: Vec<vk::DescriptorImageInfo> = self
            .r_textures
            .iter()
            .map(|t| {
                vk::DescriptorImageInfo::builder()
                    .sampler(self.r_texture_sampler.handle)
                    .image_view(t.view)
                    .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                    .build()
            })
            .collect();
        self.r_descriptors.write_texture_array(&self.r_dev, &image_infos);

        self.r_stats.transparent_objects_exist = static_buffers.transparent_count > 0;
        self.r_stats.onpc_objects_exist = static_buffers.onpc_count > 0;

        self.r_static = Some(static_buffers);
        self.r_rt = rt;
        self.r_var_buffers = var_buffers;
        self.r_scene_ready = true;
        Ok(())
    }

    /// Dynamic prefix transform update. Writes the staging copy of both
    /// frame slots so the change survives the double buffering.
    pub fn update_object_transform(&mut self, transform_id: u32, transform: &MeshTransform) {
        for vars in self.r_var_buffers.iter() {
            vars.write_transform(transform_id, transform);
        }
    }

    /// Window resize handling, before the frame records. Rebuilds the
    /// swapchain and every extent dependent image and pushes the new
    /// pyramid extent back into the view uniform's source.
    pub fn update(&mut self, context: &mut DrawContext) -> Result<()> {
        if !context.camera.window_resize {
            return Ok(());
        }

        let width = context.camera.window_width;
        let height = context.camera.window_height;
        if width == 0 || height == 0 {
            self.r_suspended = true;
            return Ok(());
        }
        self.r_suspended = false;

        self.r_dev.wait_idle();
        self.r_swapchain
            .recreate(&self.r_dev, &self.r_surface, width, height)?;
        self.r_draw_extent = self.r_swapchain.extent;
        self.r_attachments = Attachments::new(&self.r_dev, self.r_draw_extent)?;

        context.camera.view_data.pyramid_width = self.r_attachments.pyramid_extent.width as f32;
        context.camera.view_data.pyramid_height = self.r_attachments.pyramid_extent.height as f32;
        Ok(())
    }

    /// The loading screen: one triangle straight onto the swapchain
    /// image while the scene is still loading.
    pub fn draw_while_waiting(&mut self, delta_time: f32) -> Result<()> {
        if self.r_suspended {
            return Ok(());
        }
        self.r_loading_time += delta_time;

        let dev = &self.r_dev.dev;
        let fence = self.r_frame_tools[0].in_flight_fence.handle;
        let image_acquired = self.r_frame_tools[0].image_acquired.handle;
        let ready_to_present = self.r_frame_tools[0].ready_to_present.handle;

        self.r_dev.wait_fence(fence)?;
        let image_index = match self.r_swapchain.acquire(image_acquired) {
            Ok(index) => index,
            Err(BlitzenError::SWAPCHAIN_OUT_OF_DATE) => return Ok(()),
            Err(e) => return Err(e),
        };
        self.r_dev.reset_fence(fence)?;

        let cbuf = self.r_idle_cbuf;
        commands::begin_command_buffer(dev, cbuf, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
        self.set_viewport_and_scissor(cbuf, self.r_swapchain.extent);

        let image = self.r_swapchain.images[image_index as usize];
        let to_color = commands::image_barrier(
            image,
            vk::PipelineStageFlags2::ALL_COMMANDS,
            vk::AccessFlags2::NONE,
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageAspectFlags::COLOR,
        );
        commands::pipeline_barrier(dev, cbuf, &[], &[to_color]);

        let color_info = attachment_info(
            self.r_swapchain.views[image_index as usize].handle,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::AttachmentLoadOp::CLEAR,
            clear_color(WINDOW_CLEAR_COLOR),
        );
        let rendering_info = vk::RenderingInfo::builder()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: self.r_swapchain.extent,
            })
            .layer_count(1)
            .color_attachments(std::slice::from_ref(&color_info))
            .build();
        unsafe {
            dev.cmd_begin_rendering(cbuf, &rendering_info);
            dev.cmd_bind_pipeline(
                cbuf,
                vk::PipelineBindPoint::GRAPHICS,
                self.r_pipelines.loading_triangle.handle,
            );
            let pulse = (self.r_loading_time * 2.0).sin() * 0.5 + 0.5;
            let pc = LoadingPushConstant {
                color: [0.1, pulse * 0.6, 0.8, 1.0],
            };
            dev.cmd_push_constants(
                cbuf,
                self.r_pipelines.loading_layout.handle,
                vk::ShaderStageFlags::FRAGMENT,
                0,
                push_constant_bytes(&pc),
            );
            dev.cmd_draw(cbuf, 3, 1, 0, 0);
            dev.cmd_end_rendering(cbuf);
        }

        let to_present = commands::image_barrier(
            image,
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
            vk::PipelineStageFlags2::NONE,
            vk::AccessFlags2::NONE,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::PRESENT_SRC_KHR,
            vk::ImageAspectFlags::COLOR,
        );
        commands::pipeline_barrier(dev, cbuf, &[], &[to_present]);
        commands::end_command_buffer(dev, cbuf)?;

        let waits = [commands::semaphore_submit_info(
            image_acquired,
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
        )];
        let signals = [commands::semaphore_submit_info(
            ready_to_present,
            vk::PipelineStageFlags2::ALL_GRAPHICS,
        )];
        commands::submit_command_buffer(
            dev,
            self.r_dev.graphics_queue.handle,
            cbuf,
            &waits,
            &signals,
            fence,
        )?;

        self.r_swapchain
            .present(self.r_dev.present_queue.handle, image_index, ready_to_present)
    }

    /// Records and submits one frame
    pub fn draw_frame(&mut self, context: &DrawContext) -> Result<()> {
        if !self.r_scene_ready {
            return Err(BlitzenError::SCENE_NOT_READY);
        }
        if self.r_suspended {
            return Ok(());
        }

        let mut stopwatch = StopWatch::new();
        stopwatch.start();

        let frame = self.r_current_frame;
        let fence = self.r_frame_tools[frame].in_flight_fence.handle;
        let image_acquired = self.r_frame_tools[frame].image_acquired.handle;
        let ready_to_present = self.r_frame_tools[frame].ready_to_present.handle;

        // The acquire happens before the fence reset so a dead surface
        // leaves the slot reusable. An out of date surface skips the
        // frame; the collaborator's resize flag drives the rebuild.
        self.r_dev.wait_fence(fence)?;
        let image_index = match self.r_swapchain.acquire(image_acquired) {
            Ok(index) => index,
            Err(BlitzenError::SWAPCHAIN_OUT_OF_DATE) => return Ok(()),
            Err(e) => return Err(e),
        };
        self.r_dev.reset_fence(fence)?;

        self.update_buffers(frame)?;
        self.r_var_buffers[frame]
            .write_view(&context.camera.view_data, context.camera.freeze_frustum);

        if self.r_enable_clusters {
            self.draw_frame_clusters(context, frame, image_index)?;
        } else {
            self.draw_frame_classic(context, frame, image_index)?;
        }

        self.r_swapchain
            .present(self.r_dev.present_queue.handle, image_index, ready_to_present)?;

        self.r_frame_count += 1;
        self.r_current_frame = (self.r_current_frame + 1) % FRAMES_IN_FLIGHT;

        stopwatch.end();
        log::profiling!("frame {} recorded in {}ms", self.r_frame_count, stopwatch.get_duration());
        Ok(())
    }

    /// The transform restage: staging to device copy on the transfer
    /// queue, signaling buffersReady for whoever consumes it first.
    fn update_buffers(&mut self, frame: usize) -> Result<()> {
        let dev = &self.r_dev.dev;
        let tools = &self.r_frame_tools[frame];
        let vars = &self.r_var_buffers[frame];

        commands::begin_command_buffer(
            dev,
            tools.transfer_cbuf,
            vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
        )?;
        // The first pass through each slot copies the whole array so
        // the static tail lands on the device
        let bytes = vars.transform_copy_bytes(self.r_frame_count < FRAMES_IN_FLIGHT as u64);
        if bytes > 0 {
            commands::copy_buffer_to_buffer(
                dev,
                tools.transfer_cbuf,
                vars.transform_staging.buffer,
                vars.transform_device.buffer,
                bytes,
                0,
                0,
            );
        }
        commands::end_command_buffer(dev, tools.transfer_cbuf)?;

        // ALL_COMMANDS because the signal comes from a transfer queue;
        // shader stage masks are invalid there
        let signals = [commands::semaphore_submit_info(
            tools.buffers_ready.handle,
            vk::PipelineStageFlags2::ALL_COMMANDS,
        )];
        commands::submit_command_buffer(
            dev,
            self.r_dev.transfer_queue.handle,
            tools.transfer_cbuf,
            &[],
            &signals,
            vk::Fence::null(),
        )
    }

    /// The single submission path: both cull passes and every draw on
    /// the graphics queue.
    fn draw_frame_classic(
        &mut self,
        context: &DrawContext,
        frame: usize,
        image_index: u32,
    ) -> Result<()> {
        let dev = &self.r_dev.dev;
        let cbuf = self.r_frame_tools[frame].main_cbuf;
        let statics = self.r_static.as_ref().unwrap();

        let opaque_count = context.renders.opaque_count.min(statics.opaque_count);
        let transparent_count = context
            .renders
            .transparent_count
            .min(statics.transparent_count);
        let onpc_count = context.renders.onpc_count.min(statics.onpc_count);

        commands::begin_command_buffer(dev, cbuf, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
        self.set_viewport_and_scissor(cbuf, self.r_swapchain.extent);

        // Empty scenes write the color attachment from a compute shader
        // instead of the raster pipeline
        let color_working_layout = if opaque_count == 0 {
            vk::ImageLayout::GENERAL
        } else {
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
        };
        self.prepare_attachments(cbuf, color_working_layout);

        if opaque_count == 0 {
            self.dispatch_background(cbuf);
        } else {
            // First cull: previously visible objects, frustum + LOD only
            self.dispatch_draw_cull(
                cbuf,
                frame,
                self.r_pipelines.initial_cull.handle,
                opaque_count,
                statics.opaque_address,
                false,
                false,
            );
            self.draw_geometry(
                cbuf,
                frame,
                self.r_pipelines.opaque.handle,
                statics.opaque_address,
                vk::AttachmentLoadOp::CLEAR,
            );

            self.generate_depth_pyramid(cbuf);

            // Second cull: previously invisible objects get their draws,
            // everyone gets this frame's visibility verdict
            self.dispatch_draw_cull(
                cbuf,
                frame,
                self.r_pipelines.late_cull.handle,
                opaque_count,
                statics.opaque_address,
                true,
                false,
            );
            self.draw_geometry(
                cbuf,
                frame,
                self.r_pipelines.opaque.handle,
                statics.opaque_address,
                vk::AttachmentLoadOp::LOAD,
            );

            if self.r_stats.onpc_objects_exist && onpc_count > 0 {
                self.dispatch_draw_cull(
                    cbuf,
                    frame,
                    self.r_pipelines.onpc_cull.handle,
                    onpc_count,
                    statics.onpc_address,
                    true,
                    false,
                );
                self.draw_geometry_onpc(cbuf, frame, &context.camera.onpc_projection);
            }

            if self.r_stats.transparent_objects_exist && transparent_count > 0 {
                // Frustum only; transparents neither read nor write the
                // visibility buffer and are never occlusion culled
                self.dispatch_draw_cull(
                    cbuf,
                    frame,
                    self.r_pipelines.transparent_cull.handle,
                    transparent_count,
                    statics.transparent_address,
                    false,
                    true,
                );
                self.draw_geometry(
                    cbuf,
                    frame,
                    self.r_pipelines.post_pass.handle,
                    statics.transparent_address,
                    vk::AttachmentLoadOp::LOAD,
                );
            }
        }

        self.composite_to_swapchain(cbuf, image_index, color_working_layout, context)?;
        commands::end_command_buffer(dev, cbuf)?;

        let tools = &self.r_frame_tools[frame];
        let waits = [
            commands::semaphore_submit_info(
                tools.image_acquired.handle,
                vk::PipelineStageFlags2::COMPUTE_SHADER,
            ),
            commands::semaphore_submit_info(
                tools.buffers_ready.handle,
                vk::PipelineStageFlags2::ALL_COMMANDS,
            ),
        ];
        let signals = [commands::semaphore_submit_info(
            tools.ready_to_present.handle,
            vk::PipelineStageFlags2::ALL_GRAPHICS,
        )];
        commands::submit_command_buffer(
            dev,
            self.r_dev.graphics_queue.handle,
            cbuf,
            &waits,
            &signals,
            tools.in_flight_fence.handle,
        )
    }

    /// The cluster path: a compute queue submission expands visible
    /// objects into per cluster dispatch records, the CPU reads the
    /// counts back across a fence, then the graphics submission culls
    /// clusters and draws.
    fn draw_frame_clusters(
        &mut self,
        context: &DrawContext,
        frame: usize,
        image_index: u32,
    ) -> Result<()> {
        let dev = &self.r_dev.dev;
        let statics = self.r_static.as_ref().unwrap();

        let opaque_count = context.renders.opaque_count.min(statics.opaque_count);
        let transparent_count = context
            .renders
            .transparent_count
            .min(statics.transparent_count);

        // Compute submission: pre cluster culls for both object lists
        let compute_cbuf = self.r_frame_tools[frame].compute_cbuf;
        commands::begin_command_buffer(
            dev,
            compute_cbuf,
            vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
        )?;
        self.dispatch_pre_cluster_cull(
            compute_cbuf,
            frame,
            opaque_count,
            self.r_static.as_ref().unwrap().opaque_address,
            false,
        );
        if self.r_stats.transparent_objects_exist && transparent_count > 0 {
            self.dispatch_pre_cluster_cull(
                compute_cbuf,
                frame,
                transparent_count,
                self.r_static.as_ref().unwrap().transparent_address,
                true,
            );
        }
        commands::end_command_buffer(dev, compute_cbuf)?;

        let tools = &self.r_frame_tools[frame];
        let pre_cluster_fence = tools.pre_cluster_fence.as_ref().unwrap().handle;
        let pre_cluster_done = tools.pre_cluster_done.as_ref().unwrap().handle;
        let compute_waits = [commands::semaphore_submit_info(
            tools.buffers_ready.handle,
            vk::PipelineStageFlags2::COMPUTE_SHADER,
        )];
        let compute_signals = [commands::semaphore_submit_info(
            pre_cluster_done,
            vk::PipelineStageFlags2::COMPUTE_SHADER,
        )];
        commands::submit_command_buffer(
            dev,
            self.r_dev.compute_queue.handle,
            compute_cbuf,
            &compute_waits,
            &compute_signals,
            pre_cluster_fence,
        )?;

        // The hot path fence: the cluster counts have to land in host
        // memory before the cluster cull dispatch size is known
        self.r_dev.wait_fence(pre_cluster_fence)?;
        self.r_dev.reset_fence(pre_cluster_fence)?;

        let statics = self.r_static.as_ref().unwrap();
        let dispatch_count = statics.opaque_clusters.as_ref().unwrap().read_count();
        let transparent_dispatch_count = statics
            .transparent_clusters
            .as_ref()
            .unwrap()
            .read_count();

        // Graphics submission
        let cbuf = self.r_frame_tools[frame].main_cbuf;
        commands::begin_command_buffer(dev, cbuf, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
        self.set_viewport_and_scissor(cbuf, self.r_swapchain.extent);

        let color_working_layout = if opaque_count == 0 {
            vk::ImageLayout::GENERAL
        } else {
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
        };
        self.prepare_attachments(cbuf, color_working_layout);

        if opaque_count == 0 {
            self.dispatch_background(cbuf);
        } else {
            self.dispatch_cluster_cull(cbuf, frame, dispatch_count, false);
            self.draw_geometry(
                cbuf,
                frame,
                self.r_pipelines.opaque.handle,
                self.r_static.as_ref().unwrap().opaque_address,
                vk::AttachmentLoadOp::CLEAR,
            );

            if self.r_stats.transparent_objects_exist && transparent_dispatch_count > 0 {
                self.dispatch_cluster_cull(cbuf, frame, transparent_dispatch_count, true);
                self.draw_geometry(
                    cbuf,
                    frame,
                    self.r_pipelines.post_pass.handle,
                    self.r_static.as_ref().unwrap().transparent_address,
                    vk::AttachmentLoadOp::LOAD,
                );
            }
        }

        self.composite_to_swapchain(cbuf, image_index, color_working_layout, context)?;
        commands::end_command_buffer(dev, cbuf)?;

        let tools = &self.r_frame_tools[frame];
        let waits = [
            commands::semaphore_submit_info(
                tools.image_acquired.handle,
                vk::PipelineStageFlags2::COMPUTE_SHADER,
            ),
            commands::semaphore_submit_info(
                pre_cluster_done,
                vk::PipelineStageFlags2::COMPUTE_SHADER,
            ),
        ];
        let signals = [commands::semaphore_submit_info(
            tools.ready_to_present.handle,
            vk::PipelineStageFlags2::ALL_GRAPHICS,
        )];
        commands::submit_command_buffer(
            dev,
            self.r_dev.graphics_queue.handle,
            cbuf,
            &waits,
            &signals,
            tools.in_flight_fence.handle,
        )
    }

    /// The viewport is authored with negative height: origin sits at
    /// the full height and the extent walks back up, flipping y.
    fn set_viewport_and_scissor(&self, cbuf: vk::CommandBuffer, extent: vk::Extent2D) {
        let viewport = vk::Viewport {
            x: 0.0,
            y: extent.height as f32,
            width: extent.width as f32,
            height: -(extent.height as f32),
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let scissor = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };
        unsafe {
            self.r_dev.dev.cmd_set_viewport(cbuf, 0, &[viewport]);
            self.r_dev.dev.cmd_set_scissor(cbuf, 0, &[scissor]);
        }
    }

    /// Layout transitions that open the frame: color to its working
    /// layout, depth to depth attachment optimal.
    fn prepare_attachments(&self, cbuf: vk::CommandBuffer, color_layout: vk::ImageLayout) {
        let color_dst_stage = if color_layout == vk::ImageLayout::GENERAL {
            vk::PipelineStageFlags2::COMPUTE_SHADER
        } else {
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT
        };
        let color_dst_access = if color_layout == vk::ImageLayout::GENERAL {
            vk::AccessFlags2::SHADER_WRITE
        } else {
            vk::AccessFlags2::COLOR_ATTACHMENT_WRITE
        };
        let barriers = [
            commands::image_barrier(
                self.r_attachments.color.image,
                vk::PipelineStageFlags2::ALL_COMMANDS,
                vk::AccessFlags2::NONE,
                color_dst_stage,
                color_dst_access,
                vk::ImageLayout::UNDEFINED,
                color_layout,
                vk::ImageAspectFlags::COLOR,
            ),
            commands::image_barrier(
                self.r_attachments.depth.image,
                vk::PipelineStageFlags2::ALL_COMMANDS,
                vk::AccessFlags2::NONE,
                vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS,
                vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
                vk::ImageAspectFlags::DEPTH,
            ),
        ];
        commands::pipeline_barrier(&self.r_dev.dev, cbuf, &[], &barriers);
    }

    /// One object culling dispatch with its full barrier envelope.
    ///
    /// `late` adds the depth pyramid descriptor and flips the
    /// visibility barrier direction: the first pass only reads the
    /// bits, the late pass is the only writer.
    fn dispatch_draw_cull(
        &self,
        cbuf: vk::CommandBuffer,
        frame: usize,
        pipeline: vk::Pipeline,
        draw_count: u32,
        object_address: vk::DeviceAddress,
        late: bool,
        post_pass: bool,
    ) {
        let dev = &self.r_dev.dev;
        let statics = self.r_static.as_ref().unwrap();

        // The count word resets only after last frame's indirect read
        let count_reset = commands::buffer_barrier(
            statics.indirect_count.buffer,
            vk::PipelineStageFlags2::DRAW_INDIRECT,
            vk::AccessFlags2::INDIRECT_COMMAND_READ,
            vk::PipelineStageFlags2::TRANSFER,
            vk::AccessFlags2::TRANSFER_WRITE,
            0,
            vk::WHOLE_SIZE,
        );
        commands::pipeline_barrier(dev, cbuf, &[count_reset], &[]);
        unsafe {
            dev.cmd_fill_buffer(
                cbuf,
                statics.indirect_count.buffer,
                0,
                std::mem::size_of::<u32>() as u64,
                0,
            );
        }

        // Before the dispatch: the zero fill must be visible, the
        // command buffer must be done feeding last frame's draws, and
        // the visibility words must serialize compute to compute
        let (vis_src, vis_dst) = if late {
            (vk::AccessFlags2::SHADER_READ, vk::AccessFlags2::SHADER_WRITE)
        } else {
            (vk::AccessFlags2::SHADER_WRITE, vk::AccessFlags2::SHADER_READ)
        };
        let dispatch_barriers = [
            commands::buffer_barrier(
                statics.indirect_count.buffer,
                vk::PipelineStageFlags2::TRANSFER,
                vk::AccessFlags2::TRANSFER_WRITE,
                vk::PipelineStageFlags2::COMPUTE_SHADER,
                vk::AccessFlags2::SHADER_READ | vk::AccessFlags2::SHADER_WRITE,
                0,
                vk::WHOLE_SIZE,
            ),
            commands::buffer_barrier(
                statics.indirect_draw.buffer,
                vk::PipelineStageFlags2::DRAW_INDIRECT | vk::PipelineStageFlags2::VERTEX_SHADER,
                vk::AccessFlags2::INDIRECT_COMMAND_READ | vk::AccessFlags2::SHADER_READ,
                vk::PipelineStageFlags2::COMPUTE_SHADER,
                vk::AccessFlags2::SHADER_WRITE,
                0,
                vk::WHOLE_SIZE,
            ),
            commands::buffer_barrier(
                statics.visibility.buffer,
                vk::PipelineStageFlags2::COMPUTE_SHADER,
                vis_src,
                vk::PipelineStageFlags2::COMPUTE_SHADER,
                vis_dst,
                0,
                vk::WHOLE_SIZE,
            ),
        ];
        if late {
            // The reduction chain has to finish writing before sampling
            let pyramid_ready = commands::image_barrier(
                self.r_attachments.pyramid.image,
                vk::PipelineStageFlags2::COMPUTE_SHADER,
                vk::AccessFlags2::SHADER_WRITE,
                vk::PipelineStageFlags2::COMPUTE_SHADER,
                vk::AccessFlags2::SHADER_READ,
                vk::ImageLayout::GENERAL,
                vk::ImageLayout::GENERAL,
                vk::ImageAspectFlags::COLOR,
            );
            commands::pipeline_barrier(dev, cbuf, &dispatch_barriers, &[pyramid_ready]);
        } else {
            commands::pipeline_barrier(dev, cbuf, &dispatch_barriers, &[]);
        }

        self.push_shared_descriptors(
            cbuf,
            frame,
            vk::PipelineBindPoint::COMPUTE,
            self.r_pipelines.cull_layout.handle,
            late,
        );

        unsafe {
            dev.cmd_bind_pipeline(cbuf, vk::PipelineBindPoint::COMPUTE, pipeline);
            let pc = CullPushConstant {
                object_buffer_address: object_address,
                draw_count,
                post_pass: post_pass as u32,
            };
            dev.cmd_push_constants(
                cbuf,
                self.r_pipelines.cull_layout.handle,
                vk::ShaderStageFlags::COMPUTE,
                0,
                push_constant_bytes(&pc),
            );
            dev.cmd_dispatch(cbuf, group_count(draw_count, CULL_LOCAL_SIZE), 1, 1);
        }

        // After the dispatch: commands and count serialize against the
        // indirect read stage
        let post_barriers = [
            commands::buffer_barrier(
                statics.indirect_count.buffer,
                vk::PipelineStageFlags2::COMPUTE_SHADER,
                vk::AccessFlags2::SHADER_WRITE,
                vk::PipelineStageFlags2::DRAW_INDIRECT,
                vk::AccessFlags2::INDIRECT_COMMAND_READ,
                0,
                vk::WHOLE_SIZE,
            ),
            commands::buffer_barrier(
                statics.indirect_draw.buffer,
                vk::PipelineStageFlags2::COMPUTE_SHADER,
                vk::AccessFlags2::SHADER_WRITE,
                vk::PipelineStageFlags2::DRAW_INDIRECT | vk::PipelineStageFlags2::VERTEX_SHADER,
                vk::AccessFlags2::INDIRECT_COMMAND_READ | vk::AccessFlags2::SHADER_READ,
                0,
                vk::WHOLE_SIZE,
            ),
        ];
        commands::pipeline_barrier(dev, cbuf, &post_barriers, &[]);
    }

    /// Pre cluster cull (cluster path, compute queue): visible objects
    /// append per cluster dispatch records, then the count word is
    /// copied down to its host visible twin.
    fn dispatch_pre_cluster_cull(
        &self,
        cbuf: vk::CommandBuffer,
        frame: usize,
        draw_count: u32,
        object_address: vk::DeviceAddress,
        transparent: bool,
    ) {
        let dev = &self.r_dev.dev;
        let statics = self.r_static.as_ref().unwrap();
        let list = if transparent {
            statics.transparent_clusters.as_ref().unwrap()
        } else {
            statics.opaque_clusters.as_ref().unwrap()
        };
        let word = std::mem::size_of::<u32>() as u64;

        let count_reset = commands::buffer_barrier(
            list.count.buffer,
            vk::PipelineStageFlags2::COPY,
            vk::AccessFlags2::TRANSFER_READ,
            vk::PipelineStageFlags2::TRANSFER,
            vk::AccessFlags2::TRANSFER_WRITE,
            0,
            word,
        );
        commands::pipeline_barrier(dev, cbuf, &[count_reset], &[]);
        unsafe {
            dev.cmd_fill_buffer(cbuf, list.count.buffer, 0, word, 0);
        }

        let dispatch_barriers = [
            commands::buffer_barrier(
                list.count.buffer,
                vk::PipelineStageFlags2::TRANSFER,
                vk::AccessFlags2::TRANSFER_WRITE,
                vk::PipelineStageFlags2::COMPUTE_SHADER,
                vk::AccessFlags2::SHADER_READ | vk::AccessFlags2::SHADER_WRITE,
                0,
                word,
            ),
            commands::buffer_barrier(
                list.dispatch.buffer,
                vk::PipelineStageFlags2::COMPUTE_SHADER,
                vk::AccessFlags2::SHADER_READ,
                vk::PipelineStageFlags2::COMPUTE_SHADER,
                vk::AccessFlags2::SHADER_WRITE,
                0,
                vk::WHOLE_SIZE,
            ),
        ];
        commands::pipeline_barrier(dev, cbuf, &dispatch_barriers, &[]);

        self.push_shared_descriptors(
            cbuf,
            frame,
            vk::PipelineBindPoint::COMPUTE,
            self.r_pipelines.cluster_cull_layout.handle,
            false,
        );

        unsafe {
            dev.cmd_bind_pipeline(
                cbuf,
                vk::PipelineBindPoint::COMPUTE,
                self.r_pipelines.cluster.as_ref().unwrap().pre_cluster_cull.handle,
            );
            let pc = ClusterCullPushConstant {
                object_buffer_address: object_address,
                dispatch_buffer_address: list.dispatch_address,
                count_buffer_address: list.count_address,
                draw_count,
                padding0: 0,
            };
            dev.cmd_push_constants(
                cbuf,
                self.r_pipelines.cluster_cull_layout.handle,
                vk::ShaderStageFlags::COMPUTE,
                0,
                push_constant_bytes(&pc),
            );
            dev.cmd_dispatch(cbuf, group_count(draw_count, CULL_LOCAL_SIZE), 1, 1);
        }

        // Cluster records stay device side, the count rides down to the
        // host visible copy
        let dispatch_read = commands::buffer_barrier(
            list.dispatch.buffer,
            vk::PipelineStageFlags2::COMPUTE_SHADER,
            vk::AccessFlags2::SHADER_WRITE,
            vk::PipelineStageFlags2::COMPUTE_SHADER,
            vk::AccessFlags2::SHADER_READ,
            0,
            vk::WHOLE_SIZE,
        );
        commands::pipeline_barrier(dev, cbuf, &[dispatch_read], &[]);

        let count_to_copy = commands::buffer_barrier(
            list.count.buffer,
            vk::PipelineStageFlags2::COMPUTE_SHADER,
            vk::AccessFlags2::SHADER_WRITE,
            vk::PipelineStageFlags2::COPY,
            vk::AccessFlags2::TRANSFER_READ,
            0,
            word,
        );
        commands::pipeline_barrier(dev, cbuf, &[count_to_copy], &[]);
        commands::copy_buffer_to_buffer(
            dev,
            cbuf,
            list.count.buffer,
            list.count_copy.buffer,
            word,
            0,
            0,
        );
    }

    /// Cluster cull (cluster path, graphics queue): one thread per
    /// dispatch record, survivors emit one indirect draw per cluster.
    fn dispatch_cluster_cull(
        &self,
        cbuf: vk::CommandBuffer,
        frame: usize,
        dispatch_count: u32,
        transparent: bool,
    ) {
        let dev = &self.r_dev.dev;
        let statics = self.r_static.as_ref().unwrap();
        let list = if transparent {
            statics.transparent_clusters.as_ref().unwrap()
        } else {
            statics.opaque_clusters.as_ref().unwrap()
        };
        let object_address = if transparent {
            statics.transparent_address
        } else {
            statics.opaque_address
        };
        let pipeline = if transparent {
            &self.r_pipelines.cluster.as_ref().unwrap().transparent_cluster_cull
        } else {
            &self.r_pipelines.cluster.as_ref().unwrap().cluster_cull
        };

        let count_reset = commands::buffer_barrier(
            statics.indirect_count.buffer,
            vk::PipelineStageFlags2::DRAW_INDIRECT,
            vk::AccessFlags2::INDIRECT_COMMAND_READ,
            vk::PipelineStageFlags2::TRANSFER,
            vk::AccessFlags2::TRANSFER_WRITE,
            0,
            std::mem::size_of::<u32>() as u64,
        );
        commands::pipeline_barrier(dev, cbuf, &[count_reset], &[]);
        unsafe {
            dev.cmd_fill_buffer(
                cbuf,
                statics.indirect_count.buffer,
                0,
                std::mem::size_of::<u32>() as u64,
                0,
            );
        }

        let dispatch_barriers = [
            commands::buffer_barrier(
                statics.indirect_count.buffer,
                vk::PipelineStageFlags2::TRANSFER,
                vk::AccessFlags2::TRANSFER_WRITE,
                vk::PipelineStageFlags2::COMPUTE_SHADER,
                vk::AccessFlags2::SHADER_READ | vk::AccessFlags2::SHADER_WRITE,
                0,
                vk::WHOLE_SIZE,
            ),
            commands::buffer_barrier(
                statics.indirect_draw.buffer,
                vk::PipelineStageFlags2::DRAW_INDIRECT | vk::PipelineStageFlags2::VERTEX_SHADER,
                vk::AccessFlags2::INDIRECT_COMMAND_READ | vk::AccessFlags2::SHADER_READ,
                vk::PipelineStageFlags2::COMPUTE_SHADER,
                vk::AccessFlags2::SHADER_WRITE,
                0,
                vk::WHOLE_SIZE,
            ),
            commands::buffer_barrier(
                list.dispatch.buffer,
                vk::PipelineStageFlags2::COMPUTE_SHADER,
                vk::AccessFlags2::SHADER_WRITE,
                vk::PipelineStageFlags2::COMPUTE_SHADER,
                vk::AccessFlags2::SHADER_READ,
                0,
                vk::WHOLE_SIZE,
            ),
        ];
        commands::pipeline_barrier(dev, cbuf, &dispatch_barriers, &[]);

        self.push_shared_descriptors(
            cbuf,
            frame,
            vk::PipelineBindPoint::COMPUTE,
            self.r_pipelines.cluster_cull_layout.handle,
            false,
        );

        unsafe {
            dev.cmd_bind_pipeline(cbuf, vk::PipelineBindPoint::COMPUTE, pipeline.handle);
            let pc = ClusterCullPushConstant {
                object_buffer_address: object_address,
                dispatch_buffer_address: list.dispatch_address,
                count_buffer_address: 0,
                draw_count: dispatch_count,
                padding0: 0,
            };
            dev.cmd_push_constants(
                cbuf,
                self.r_pipelines.cluster_cull_layout.handle,
                vk::ShaderStageFlags::COMPUTE,
                0,
                push_constant_bytes(&pc),
            );
            dev.cmd_dispatch(cbuf, group_count(dispatch_count, CULL_LOCAL_SIZE), 1, 1);
        }

        let post_barriers = [
            commands::buffer_barrier(
                statics.indirect_count.buffer,
                vk::PipelineStageFlags2::COMPUTE_SHADER,
                vk::AccessFlags2::SHADER_WRITE,
                vk::PipelineStageFlags2::DRAW_INDIRECT,
                vk::AccessFlags2::INDIRECT_COMMAND_READ,
                0,
                vk::WHOLE_SIZE,
            ),
            commands::buffer_barrier(
                statics.indirect_draw.buffer,
                vk::PipelineStageFlags2::COMPUTE_SHADER,
                vk::AccessFlags2::SHADER_WRITE,
                vk::PipelineStageFlags2::DRAW_INDIRECT | vk::PipelineStageFlags2::VERTEX_SHADER,
                vk::AccessFlags2::INDIRECT_COMMAND_READ | vk::AccessFlags2::SHADER_READ,
                0,
                vk::WHOLE_SIZE,
            ),
        ];
        commands::pipeline_barrier(dev, cbuf, &post_barriers, &[]);
    }

    /// One geometry pass: dynamic rendering over the color and depth
    /// attachments, indirect draws up to the GPU authored count.
    fn draw_geometry(
        &self,
        cbuf: vk::CommandBuffer,
        frame: usize,
        pipeline: vk::Pipeline,
        object_address: vk::DeviceAddress,
        load_op: vk::AttachmentLoadOp,
    ) {
        let dev = &self.r_dev.dev;
        let statics = self.r_static.as_ref().unwrap();

        self.begin_geometry_rendering(cbuf, load_op);
        self.push_shared_descriptors(
            cbuf,
            frame,
            vk::PipelineBindPoint::GRAPHICS,
            self.r_pipelines.graphics_layout.handle,
            false,
        );

        unsafe {
            dev.cmd_bind_descriptor_sets(
                cbuf,
                vk::PipelineBindPoint::GRAPHICS,
                self.r_pipelines.graphics_layout.handle,
                TEXTURE_DESCRIPTOR_SET_ID,
                &[self.r_descriptors.texture_set],
                &[],
            );
            let pc = GraphicsPushConstant {
                object_buffer_address: object_address,
            };
            dev.cmd_push_constants(
                cbuf,
                self.r_pipelines.graphics_layout.handle,
                vk::ShaderStageFlags::VERTEX,
                0,
                push_constant_bytes(&pc),
            );
            dev.cmd_bind_pipeline(cbuf, vk::PipelineBindPoint::GRAPHICS, pipeline);
            // The cluster path's commands index the cluster index
            // buffer, the object path the regular one
            let index_buffer = if self.r_enable_clusters {
                statics.cluster_index.buffer
            } else {
                statics.index.buffer
            };
            dev.cmd_bind_index_buffer(cbuf, index_buffer, 0, vk::IndexType::UINT32);
            dev.cmd_draw_indexed_indirect_count(
                cbuf,
                statics.indirect_draw.buffer,
                indirect_command_offset(),
                statics.indirect_count.buffer,
                0,
                statics.indirect_capacity,
                INDIRECT_DRAW_STRIDE,
            );
            dev.cmd_end_rendering(cbuf);
        }
    }

    /// The reflective pass pushes an oblique near-plane projection in
    /// place of the ordinary vertex push constant
    fn draw_geometry_onpc(
        &self,
        cbuf: vk::CommandBuffer,
        frame: usize,
        onpc_projection: &Matrix4<f32>,
    ) {
        let dev = &self.r_dev.dev;
        let statics = self.r_static.as_ref().unwrap();

        self.begin_geometry_rendering(cbuf, vk::AttachmentLoadOp::LOAD);
        self.push_shared_descriptors(
            cbuf,
            frame,
            vk::PipelineBindPoint::GRAPHICS,
            self.r_pipelines.onpc_layout.handle,
            false,
        );

        unsafe {
            dev.cmd_bind_descriptor_sets(
                cbuf,
                vk::PipelineBindPoint::GRAPHICS,
                self.r_pipelines.onpc_layout.handle,
                TEXTURE_DESCRIPTOR_SET_ID,
                &[self.r_descriptors.texture_set],
                &[],
            );
            dev.cmd_push_constants(
                cbuf,
                self.r_pipelines.onpc_layout.handle,
                vk::ShaderStageFlags::VERTEX,
                0,
                push_constant_bytes(onpc_projection),
            );
            dev.cmd_bind_pipeline(
                cbuf,
                vk::PipelineBindPoint::GRAPHICS,
                self.r_pipelines.onpc_reflective.handle,
            );
            dev.cmd_bind_index_buffer(cbuf, statics.index.buffer, 0, vk::IndexType::UINT32);
            dev.cmd_draw_indexed_indirect_count(
                cbuf,
                statics.indirect_draw.buffer,
                indirect_command_offset(),
                statics.indirect_count.buffer,
                0,
                statics.indirect_capacity,
                INDIRECT_DRAW_STRIDE,
            );
            dev.cmd_end_rendering(cbuf);
        }
    }

    fn begin_geometry_rendering(&self, cbuf: vk::CommandBuffer, load_op: vk::AttachmentLoadOp) {
        let color_info = attachment_info(
            self.r_attachments.color.view,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            load_op,
            clear_color(WINDOW_CLEAR_COLOR),
        );
        // reverse-Z clears depth to zero
        let depth_info = attachment_info(
            self.r_attachments.depth.view,
            vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
            load_op,
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 0.0,
                    stencil: 0,
                },
            },
        );
        let rendering_info = vk::RenderingInfo::builder()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: self.r_draw_extent,
            })
            .layer_count(1)
            .color_attachments(std::slice::from_ref(&color_info))
            .depth_attachment(&depth_info)
            .build();
        unsafe {
            self.r_dev.dev.cmd_begin_rendering(cbuf, &rendering_info);
        }
    }

    /// The depth pyramid reduction chain. Each mip min-reduces the
    /// previous level (mip zero reads the depth attachment), with an
    /// image barrier between iterations because level n is level n+1's
    /// source.
    fn generate_depth_pyramid(&self, cbuf: vk::CommandBuffer) {
        let dev = &self.r_dev.dev;
        let attachments = &self.r_attachments;

        let entry_barriers = [
            commands::image_barrier(
                attachments.depth.image,
                vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS,
                vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
                vk::PipelineStageFlags2::COMPUTE_SHADER,
                vk::AccessFlags2::SHADER_READ,
                vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                vk::ImageAspectFlags::DEPTH,
            ),
            commands::image_barrier(
                attachments.pyramid.image,
                vk::PipelineStageFlags2::COMPUTE_SHADER,
                vk::AccessFlags2::SHADER_READ,
                vk::PipelineStageFlags2::COMPUTE_SHADER,
                vk::AccessFlags2::SHADER_WRITE,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::GENERAL,
                vk::ImageAspectFlags::COLOR,
            ),
        ];
        commands::pipeline_barrier(dev, cbuf, &[], &entry_barriers);

        unsafe {
            dev.cmd_bind_pipeline(
                cbuf,
                vk::PipelineBindPoint::COMPUTE,
                self.r_pipelines.depth_pyramid.handle,
            );
        }

        for mip in 0..attachments.pyramid_mip_count {
            // Mip zero samples the depth attachment, later levels the
            // previous pyramid mip
            let (src_view, src_layout) = if mip == 0 {
                (
                    attachments.depth.view,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                )
            } else {
                (
                    attachments.pyramid_mips[mip as usize - 1].handle,
                    vk::ImageLayout::GENERAL,
                )
            };

            let dst_info = vk::DescriptorImageInfo::builder()
                .image_view(attachments.pyramid_mips[mip as usize].handle)
                .image_layout(vk::ImageLayout::GENERAL)
                .build();
            let src_info = vk::DescriptorImageInfo::builder()
                .sampler(attachments.depth_sampler.handle)
                .image_view(src_view)
                .image_layout(src_layout)
                .build();
            let writes = [
                image_write(0, vk::DescriptorType::STORAGE_IMAGE, &dst_info),
                image_write(1, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, &src_info),
            ];
            unsafe {
                self.r_dev.push_desc_loader.cmd_push_descriptor_set(
                    cbuf,
                    vk::PipelineBindPoint::COMPUTE,
                    self.r_pipelines.pyramid_layout.handle,
                    0,
                    &writes,
                );
            }

            let level_width = utils::partial_max(1, attachments.pyramid_extent.width >> mip);
            let level_height = utils::partial_max(1, attachments.pyramid_extent.height >> mip);
            let pc = ExtentPushConstant {
                width: level_width as f32,
                height: level_height as f32,
            };
            unsafe {
                dev.cmd_push_constants(
                    cbuf,
                    self.r_pipelines.pyramid_layout.handle,
                    vk::ShaderStageFlags::COMPUTE,
                    0,
                    push_constant_bytes(&pc),
                );
                dev.cmd_dispatch(
                    cbuf,
                    group_count(level_width, PYRAMID_TILE),
                    group_count(level_height, PYRAMID_TILE),
                    1,
                );
            }

            let level_done = commands::image_barrier(
                attachments.pyramid.image,
                vk::PipelineStageFlags2::COMPUTE_SHADER,
                vk::AccessFlags2::SHADER_WRITE,
                vk::PipelineStageFlags2::COMPUTE_SHADER,
                vk::AccessFlags2::SHADER_READ,
                vk::ImageLayout::GENERAL,
                vk::ImageLayout::GENERAL,
                vk::ImageAspectFlags::COLOR,
            );
            commands::pipeline_barrier(dev, cbuf, &[], &[level_done]);
        }

        // Hand the depth attachment back to the raster passes
        let depth_back = commands::image_barrier(
            attachments.depth.image,
            vk::PipelineStageFlags2::COMPUTE_SHADER,
            vk::AccessFlags2::SHADER_READ,
            vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS,
            vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
            vk::ImageAspectFlags::DEPTH,
        );
        commands::pipeline_barrier(dev, cbuf, &[], &[depth_back]);
    }

    /// Paints the clear color gradient when there is nothing to draw
    fn dispatch_background(&self, cbuf: vk::CommandBuffer) {
        let dev = &self.r_dev.dev;
        let info = vk::DescriptorImageInfo::builder()
            .image_view(self.r_attachments.color.view)
            .image_layout(vk::ImageLayout::GENERAL)
            .build();
        let writes = [image_write(0, vk::DescriptorType::STORAGE_IMAGE, &info)];
        unsafe {
            dev.cmd_bind_pipeline(
                cbuf,
                vk::PipelineBindPoint::COMPUTE,
                self.r_pipelines.background.handle,
            );
            self.r_dev.push_desc_loader.cmd_push_descriptor_set(
                cbuf,
                vk::PipelineBindPoint::COMPUTE,
                self.r_pipelines.background_layout.handle,
                0,
                &writes,
            );
            let pc = BackgroundPushConstant {
                data1: WINDOW_CLEAR_COLOR,
                data2: WINDOW_CLEAR_COLOR,
                data3: [0.0; 4],
                data4: [0.0; 4],
            };
            dev.cmd_push_constants(
                cbuf,
                self.r_pipelines.background_layout.handle,
                vk::ShaderStageFlags::COMPUTE,
                0,
                push_constant_bytes(&pc),
            );
            dev.cmd_dispatch(
                cbuf,
                group_count(self.r_draw_extent.width, BACKGROUND_TILE),
                group_count(self.r_draw_extent.height, BACKGROUND_TILE),
                1,
            );
        }
    }

    /// Final hop: the color attachment (or a pyramid mip in the debug
    /// view) is sampled into the swapchain image, which then
    /// transitions for presentation.
    fn composite_to_swapchain(
        &self,
        cbuf: vk::CommandBuffer,
        image_index: u32,
        color_layout: vk::ImageLayout,
        context: &DrawContext,
    ) -> Result<()> {
        let dev = &self.r_dev.dev;
        let swapchain_image = self.r_swapchain.images[image_index as usize];

        let (color_src_stage, color_src_access) = if color_layout == vk::ImageLayout::GENERAL {
            (
                vk::PipelineStageFlags2::COMPUTE_SHADER,
                vk::AccessFlags2::SHADER_WRITE,
            )
        } else {
            (
                vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
            )
        };
        let transfer_barriers = [
            commands::image_barrier(
                self.r_attachments.color.image,
                color_src_stage,
                color_src_access,
                vk::PipelineStageFlags2::COMPUTE_SHADER,
                vk::AccessFlags2::SHADER_READ,
                color_layout,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                vk::ImageAspectFlags::COLOR,
            ),
            commands::image_barrier(
                swapchain_image,
                vk::PipelineStageFlags2::COMPUTE_SHADER,
                vk::AccessFlags2::NONE,
                vk::PipelineStageFlags2::COMPUTE_SHADER,
                vk::AccessFlags2::SHADER_WRITE,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::GENERAL,
                vk::ImageAspectFlags::COLOR,
            ),
        ];
        commands::pipeline_barrier(dev, cbuf, &[], &transfer_barriers);

        // The debug view samples a chosen pyramid mip instead of the
        // frame's color output
        let src_info = match context.camera.debug_pyramid_level {
            Some(level) => {
                let mip = utils::partial_min(level, self.r_attachments.pyramid_mip_count - 1);
                vk::DescriptorImageInfo::builder()
                    .sampler(self.r_attachments.depth_sampler.handle)
                    .image_view(self.r_attachments.pyramid_mips[mip as usize].handle)
                    .image_layout(vk::ImageLayout::GENERAL)
                    .build()
            }
            None => vk::DescriptorImageInfo::builder()
                .sampler(self.r_attachments.color_sampler.handle)
                .image_view(self.r_attachments.color.view)
                .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                .build(),
        };
        let dst_info = vk::DescriptorImageInfo::builder()
            .image_view(self.r_swapchain.views[image_index as usize].handle)
            .image_layout(vk::ImageLayout::GENERAL)
            .build();
        let writes = [
            image_write(0, vk::DescriptorType::STORAGE_IMAGE, &dst_info),
            image_write(1, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, &src_info),
        ];

        unsafe {
            self.r_dev.push_desc_loader.cmd_push_descriptor_set(
                cbuf,
                vk::PipelineBindPoint::COMPUTE,
                self.r_pipelines.composite_layout.handle,
                0,
                &writes,
            );
            let pc = ExtentPushConstant {
                width: self.r_draw_extent.width as f32,
                height: self.r_draw_extent.height as f32,
            };
            dev.cmd_push_constants(
                cbuf,
                self.r_pipelines.composite_layout.handle,
                vk::ShaderStageFlags::COMPUTE,
                0,
                push_constant_bytes(&pc),
            );
            dev.cmd_bind_pipeline(
                cbuf,
                vk::PipelineBindPoint::COMPUTE,
                self.r_pipelines.composite.handle,
            );
            dev.cmd_dispatch(
                cbuf,
                group_count(self.r_draw_extent.width, COMPOSITE_TILE),
                group_count(self.r_draw_extent.height, COMPOSITE_TILE),
                1,
            );
        }

        let to_present = commands::image_barrier(
            swapchain_image,
            vk::PipelineStageFlags2::COMPUTE_SHADER,
            vk::AccessFlags2::SHADER_WRITE,
            vk::PipelineStageFlags2::NONE,
            vk::AccessFlags2::NONE,
            vk::ImageLayout::GENERAL,
            vk::ImageLayout::PRESENT_SRC_KHR,
            vk::ImageAspectFlags::COLOR,
        );
        commands::pipeline_barrier(dev, cbuf, &[], &[to_present]);
        Ok(())
    }

    /// Pushes the full shared descriptor set for the current pass. Only
    /// the two variable buffer slots change between frames; the rest of
    /// the table is the same handles every time, which is what keeps
    /// the binding contract stable.
    fn push_shared_descriptors(
        &self,
        cbuf: vk::CommandBuffer,
        frame: usize,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        with_pyramid: bool,
    ) {
        let statics = self.r_static.as_ref().unwrap();
        let vars = &self.r_var_buffers[frame];

        let view_info = buffer_info(vars.view_uniform.buffer);
        let vertex_info = buffer_info(statics.vertex.buffer);
        let surface_info = buffer_info(statics.surface.buffer);
        let lod_info = buffer_info(statics.lod.buffer);
        let transform_info = buffer_info(vars.transform_device.buffer);
        let material_info = buffer_info(statics.material.buffer);
        let draw_info = buffer_info(statics.indirect_draw.buffer);
        let count_info = buffer_info(statics.indirect_count.buffer);
        let visibility_info = buffer_info(statics.visibility.buffer);
        let cluster_info = buffer_info(statics.cluster.buffer);
        let cluster_index_info = buffer_info(statics.cluster_index.buffer);
        let onpc_info = buffer_info(statics.onpc_objects.buffer);

        let uniform = vk::DescriptorType::UNIFORM_BUFFER;
        let storage = vk::DescriptorType::STORAGE_BUFFER;
        let mut writes = vec![
            buffer_write(BindingId::ViewData, uniform, &view_info),
            buffer_write(BindingId::Vertices, storage, &vertex_info),
            buffer_write(BindingId::Surfaces, storage, &surface_info),
            buffer_write(BindingId::Lods, storage, &lod_info),
            buffer_write(BindingId::Transforms, storage, &transform_info),
            buffer_write(BindingId::Materials, storage, &material_info),
            buffer_write(BindingId::IndirectDraws, storage, &draw_info),
            buffer_write(BindingId::IndirectCount, storage, &count_info),
            buffer_write(BindingId::Visibility, storage, &visibility_info),
            buffer_write(BindingId::Clusters, storage, &cluster_info),
            buffer_write(BindingId::ClusterIndices, storage, &cluster_index_info),
            buffer_write(BindingId::OnpcObjects, storage, &onpc_info),
        ];

        let pyramid_info = vk::DescriptorImageInfo::builder()
            .sampler(self.r_attachments.depth_sampler.handle)
            .image_view(self.r_attachments.pyramid.view)
            .image_layout(vk::ImageLayout::GENERAL)
            .build();
        if with_pyramid {
            writes.push(image_write(
                BindingId::DepthPyramid as u32,
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                &pyramid_info,
            ));
        }

        // The TLAS write only exists on ray tracing devices, where the
        // layout carries the slot
        let tlas_handles;
        let mut tlas_write_info;
        if let Some(rt) = self.r_rt.as_ref() {
            tlas_handles = [rt.tlas.handle];
            tlas_write_info = vk::WriteDescriptorSetAccelerationStructureKHR::builder()
                .acceleration_structures(&tlas_handles)
                .build();
            let mut write = vk::WriteDescriptorSet::builder()
                .dst_binding(BindingId::Tlas as u32)
                .descriptor_type(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
                .push_next(&mut tlas_write_info)
                .build();
            write.descriptor_count = 1;
            writes.push(write);
        }

        unsafe {
            self.r_dev.push_desc_loader.cmd_push_descriptor_set(
                cbuf,
                bind_point,
                layout,
                PUSH_DESCRIPTOR_SET_ID,
                &writes,
            );
        }
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        // Scoped resources consult the handle triple while dropping, so
        // quiesce the device first; the triple itself unregisters when
        // the Device drops after every field above it.
        self.r_dev.wait_idle();
    }
}

fn create_texture_sampler(device: &Device) -> Result<handles::Sampler> {
    let info = vk::SamplerCreateInfo::builder()
        .mag_filter(vk::Filter::LINEAR)
        .min_filter(vk::Filter::LINEAR)
        .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
        .address_mode_u(vk::SamplerAddressMode::REPEAT)
        .address_mode_v(vk::SamplerAddressMode::REPEAT)
        .address_mode_w(vk::SamplerAddressMode::REPEAT)
        .min_lod(0.0)
        .max_lod(vk::LOD_CLAMP_NONE)
        .build();
    let handle = unsafe {
        device
            .dev
            .create_sampler(&info, None)
            .map_err(|_| BlitzenError::ALLOCATION_FAILED)?
    };
    Ok(handles::Sampler::wrap(handle))
}

fn attachment_info(
    view: vk::ImageView,
    layout: vk::ImageLayout,
    load_op: vk::AttachmentLoadOp,
    clear: vk::ClearValue,
) -> vk::RenderingAttachmentInfo {
    vk::RenderingAttachmentInfo::builder()
        .image_view(view)
        .image_layout(layout)
        .load_op(load_op)
        .store_op(vk::AttachmentStoreOp::STORE)
        .clear_value(clear)
        .build()
}

fn clear_color(rgba: [f32; 4]) -> vk::ClearValue {
    vk::ClearValue {
        color: vk::ClearColorValue { float32: rgba },
    }
}
