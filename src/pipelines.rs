// Pipeline objects and their layouts
//
// Shaders are pre-compiled SPIR-V assets read from a fixed relative
// path; the renderer never compiles them. One opaque, one transparent
// and one reflective graphics pipeline exist, everything else is
// compute. Depth runs reverse-Z, so the depth compare is GREATER and
// depth clears to zero.

use ash::{util, vk};
use cgmath::Matrix4;

use crate::descriptors::Descriptors;
use crate::device::Device;
use crate::handles;
use crate::swapchain::{COLOR_ATTACHMENT_FORMAT, DEPTH_ATTACHMENT_FORMAT};
use crate::{BlitzenError, Result};
use utils::log;

use std::ffi::CString;
use std::fs::File;
use std::mem;
use std::path::{Path, PathBuf};

/// Culling shaders receive this as their push constant
#[repr(C, align(16))]
#[derive(Copy, Clone)]
pub struct CullPushConstant {
    pub object_buffer_address: vk::DeviceAddress,
    pub draw_count: u32,
    pub post_pass: u32,
}

/// The cluster path adds the dispatch and count buffer addresses
#[repr(C, align(16))]
#[derive(Copy, Clone)]
pub struct ClusterCullPushConstant {
    pub object_buffer_address: vk::DeviceAddress,
    pub dispatch_buffer_address: vk::DeviceAddress,
    pub count_buffer_address: vk::DeviceAddress,
    pub draw_count: u32,
    pub padding0: u32,
}

/// The graphics passes only need the render object list's address
#[repr(C)]
#[derive(Copy, Clone)]
pub struct GraphicsPushConstant {
    pub object_buffer_address: vk::DeviceAddress,
}

/// Depth pyramid reduction and composite push their target extent
#[repr(C)]
#[derive(Copy, Clone)]
pub struct ExtentPushConstant {
    pub width: f32,
    pub height: f32,
}

/// Gradient colors for the empty scene background fill
#[repr(C)]
#[derive(Copy, Clone)]
pub struct BackgroundPushConstant {
    pub data1: [f32; 4],
    pub data2: [f32; 4],
    pub data3: [f32; 4],
    pub data4: [f32; 4],
}

/// Loading triangle tint
#[repr(C)]
#[derive(Copy, Clone)]
pub struct LoadingPushConstant {
    pub color: [f32; 4],
}

/// The compute pipelines the cluster path adds
pub struct ClusterPipelines {
    pub pre_cluster_cull: handles::Pipeline,
    pub cluster_cull: handles::Pipeline,
    pub transparent_cluster_cull: handles::Pipeline,
}

/// Every pipeline the frame loop binds, built once at init
pub struct Pipelines {
    pub graphics_layout: handles::PipelineLayout,
    pub onpc_layout: handles::PipelineLayout,
    pub cull_layout: handles::PipelineLayout,
    pub cluster_cull_layout: handles::PipelineLayout,
    pub pyramid_layout: handles::PipelineLayout,
    pub composite_layout: handles::PipelineLayout,
    pub background_layout: handles::PipelineLayout,
    pub loading_layout: handles::PipelineLayout,

    pub initial_cull: handles::Pipeline,
    pub late_cull: handles::Pipeline,
    pub transparent_cull: handles::Pipeline,
    pub onpc_cull: handles::Pipeline,
    pub cluster: Option<ClusterPipelines>,

    pub depth_pyramid: handles::Pipeline,
    pub composite: handles::Pipeline,
    pub background: handles::Pipeline,

    pub opaque: handles::Pipeline,
    pub post_pass: handles::Pipeline,
    pub onpc_reflective: handles::Pipeline,
    pub loading_triangle: handles::Pipeline,
}

impl Pipelines {
    pub fn new(
        device: &Device,
        descriptors: &Descriptors,
        shader_dir: &Path,
        swapchain_format: vk::Format,
        enable_clusters: bool,
    ) -> Result<Self> {
        // Layout section. The graphics layouts bind the shared push
        // descriptor set plus the texture array.
        let graphics_sets = [descriptors.shared.handle, descriptors.textures.handle];
        let graphics_layout = create_pipeline_layout(
            device,
            &graphics_sets,
            &[push_range(
                vk::ShaderStageFlags::VERTEX,
                mem::size_of::<GraphicsPushConstant>(),
            )],
        )?;
        // ONPC replaces the address push with an oblique projection
        let onpc_layout = create_pipeline_layout(
            device,
            &graphics_sets,
            &[push_range(
                vk::ShaderStageFlags::VERTEX,
                mem::size_of::<Matrix4<f32>>(),
            )],
        )?;

        let shared_set = [descriptors.shared.handle];
        let cull_layout = create_pipeline_layout(
            device,
            &shared_set,
            &[push_range(
                vk::ShaderStageFlags::COMPUTE,
                mem::size_of::<CullPushConstant>(),
            )],
        )?;
        let cluster_cull_layout = create_pipeline_layout(
            device,
            &shared_set,
            &[push_range(
                vk::ShaderStageFlags::COMPUTE,
                mem::size_of::<ClusterCullPushConstant>(),
            )],
        )?;

        let pyramid_set = [descriptors.pyramid.handle];
        let pyramid_layout = create_pipeline_layout(
            device,
            &pyramid_set,
            &[push_range(
                vk::ShaderStageFlags::COMPUTE,
                mem::size_of::<ExtentPushConstant>(),
            )],
        )?;
        let composite_set = [descriptors.composite.handle];
        let composite_layout = create_pipeline_layout(
            device,
            &composite_set,
            &[push_range(
                vk::ShaderStageFlags::COMPUTE,
                mem::size_of::<ExtentPushConstant>(),
            )],
        )?;
        let background_set = [descriptors.background.handle];
        let background_layout = create_pipeline_layout(
            device,
            &background_set,
            &[push_range(
                vk::ShaderStageFlags::COMPUTE,
                mem::size_of::<BackgroundPushConstant>(),
            )],
        )?;
        let loading_layout = create_pipeline_layout(
            device,
            &[],
            &[push_range(
                vk::ShaderStageFlags::FRAGMENT,
                mem::size_of::<LoadingPushConstant>(),
            )],
        )?;

        // Compute section
        let initial_cull = create_compute_pipeline(
            device,
            cull_layout.handle,
            shader_dir,
            "InitialDrawCull.comp.glsl.spv",
        )?;
        let late_cull = create_compute_pipeline(
            device,
            cull_layout.handle,
            shader_dir,
            "LateDrawCull.comp.glsl.spv",
        )?;
        let transparent_cull = create_compute_pipeline(
            device,
            cull_layout.handle,
            shader_dir,
            "TransparentDrawCull.comp.glsl.spv",
        )?;
        let onpc_cull = create_compute_pipeline(
            device,
            cull_layout.handle,
            shader_dir,
            "OnpcDrawCull.comp.glsl.spv",
        )?;

        let cluster = if enable_clusters {
            Some(ClusterPipelines {
                pre_cluster_cull: create_compute_pipeline(
                    device,
                    cluster_cull_layout.handle,
                    shader_dir,
                    "PreClusterCull.comp.glsl.spv",
                )?,
                cluster_cull: create_compute_pipeline(
                    device,
                    cluster_cull_layout.handle,
                    shader_dir,
                    "InitialClusterCull.comp.glsl.spv",
                )?,
                transparent_cluster_cull: create_compute_pipeline(
                    device,
                    cluster_cull_layout.handle,
                    shader_dir,
                    "TransparentClusterCull.comp.glsl.spv",
                )?,
            })
        } else {
            None
        };

        let depth_pyramid = create_compute_pipeline(
            device,
            pyramid_layout.handle,
            shader_dir,
            "DepthPyramidGeneration.comp.glsl.spv",
        )?;
        let composite = create_compute_pipeline(
            device,
            composite_layout.handle,
            shader_dir,
            "GeneratePresentation.comp.glsl.spv",
        )?;
        let background = create_compute_pipeline(
            device,
            background_layout.handle,
            shader_dir,
            "BasicBackground.comp.glsl.spv",
        )?;

        // Graphics section
        let opaque = create_graphics_pipeline(
            device,
            &GraphicsPipelineDesc {
                vert: "MainObject.vert.glsl.spv",
                frag: "MainObject.frag.glsl.spv",
                layout: graphics_layout.handle,
                color_format: COLOR_ATTACHMENT_FORMAT,
                depth_format: Some(DEPTH_ATTACHMENT_FORMAT),
                depth_write: true,
                blend: false,
                alpha_discard: false,
            },
            shader_dir,
        )?;
        // Same shader pair; the specialization constant turns on alpha
        // discard and the attachment state blends
        let post_pass = create_graphics_pipeline(
            device,
            &GraphicsPipelineDesc {
                vert: "MainObject.vert.glsl.spv",
                frag: "MainObject.frag.glsl.spv",
                layout: graphics_layout.handle,
                color_format: COLOR_ATTACHMENT_FORMAT,
                depth_format: Some(DEPTH_ATTACHMENT_FORMAT),
                depth_write: false,
                blend: true,
                alpha_discard: true,
            },
            shader_dir,
        )?;
        let onpc_reflective = create_graphics_pipeline(
            device,
            &GraphicsPipelineDesc {
                vert: "OnpcReflective.vert.glsl.spv",
                frag: "MainObject.frag.glsl.spv",
                layout: onpc_layout.handle,
                color_format: COLOR_ATTACHMENT_FORMAT,
                depth_format: Some(DEPTH_ATTACHMENT_FORMAT),
                depth_write: true,
                blend: false,
                alpha_discard: false,
            },
            shader_dir,
        )?;
        // The loading triangle draws straight onto the swapchain image
        let loading_triangle = create_graphics_pipeline(
            device,
            &GraphicsPipelineDesc {
                vert: "LoadingTriangle.vert.glsl.spv",
                frag: "LoadingTriangle.frag.glsl.spv",
                layout: loading_layout.handle,
                color_format: swapchain_format,
                depth_format: None,
                depth_write: false,
                blend: false,
                alpha_discard: false,
            },
            shader_dir,
        )?;

        Ok(Self {
            graphics_layout,
            onpc_layout,
            cull_layout,
            cluster_cull_layout,
            pyramid_layout,
            composite_layout,
            background_layout,
            loading_layout,
            initial_cull,
            late_cull,
            transparent_cull,
            onpc_cull,
            cluster,
            depth_pyramid,
            composite,
            background,
            opaque,
            post_pass,
            onpc_reflective,
            loading_triangle,
        })
    }
}

struct GraphicsPipelineDesc<'a> {
    vert: &'a str,
    frag: &'a str,
    layout: vk::PipelineLayout,
    color_format: vk::Format,
    depth_format: Option<vk::Format>,
    depth_write: bool,
    blend: bool,
    alpha_discard: bool,
}

/// Reads a pre-compiled SPIR-V binary from the shader asset directory
fn load_shader_module(
    device: &Device,
    shader_dir: &Path,
    name: &str,
) -> Result<handles::ShaderModule> {
    let path: PathBuf = shader_dir.join(name);
    let mut file = File::open(&path).map_err(|_| {
        log::error!("Could not open shader asset {:?}", path);
        BlitzenError::SHADER_LOAD_FAILED
    })?;
    let code = util::read_spv(&mut file).map_err(|_| {
        log::error!("Shader asset {:?} is not valid SPIR-V", path);
        BlitzenError::SHADER_LOAD_FAILED
    })?;

    let info = vk::ShaderModuleCreateInfo::builder().code(&code).build();
    let module = unsafe {
        device
            .dev
            .create_shader_module(&info, None)
            .map_err(|_| BlitzenError::SHADER_LOAD_FAILED)?
    };
    Ok(handles::ShaderModule::wrap(module))
}

fn push_range(stages: vk::ShaderStageFlags, size: usize) -> vk::PushConstantRange {
    vk::PushConstantRange::builder()
        .stage_flags(stages)
        .offset(0)
        .size(size as u32)
        .build()
}

fn create_pipeline_layout(
    device: &Device,
    set_layouts: &[vk::DescriptorSetLayout],
    push_ranges: &[vk::PushConstantRange],
) -> Result<handles::PipelineLayout> {
    let info = vk::PipelineLayoutCreateInfo::builder()
        .set_layouts(set_layouts)
        .push_constant_ranges(push_ranges)
        .build();
    let layout = unsafe {
        device
            .dev
            .create_pipeline_layout(&info, None)
            .map_err(|_| BlitzenError::PIPELINE_CREATION_FAILED)?
    };
    Ok(handles::PipelineLayout::wrap(layout))
}

fn create_compute_pipeline(
    device: &Device,
    layout: vk::PipelineLayout,
    shader_dir: &Path,
    shader_name: &str,
) -> Result<handles::Pipeline> {
    let module = load_shader_module(device, shader_dir, shader_name)?;
    let entry = CString::new("main").unwrap();

    let stage = vk::PipelineShaderStageCreateInfo::builder()
        .stage(vk::ShaderStageFlags::COMPUTE)
        .module(module.handle)
        .name(&entry)
        .build();
    let info = vk::ComputePipelineCreateInfo::builder()
        .stage(stage)
        .layout(layout)
        .build();

    let pipeline = unsafe {
        device
            .dev
            .create_compute_pipelines(vk::PipelineCache::null(), &[info], None)
            .map_err(|(_, e)| {
                log::error!("Compute pipeline {} failed: {:?}", shader_name, e);
                BlitzenError::PIPELINE_CREATION_FAILED
            })?[0]
    };
    // `module` drops here; the pipeline keeps its own reference
    Ok(handles::Pipeline::wrap(pipeline))
}

/// Builds one of the dynamic rendering graphics pipelines.
///
/// There is no vertex input state: vertices are pulled from the vertex
/// SSBO by index. Viewport and scissor are dynamic, the viewport is
/// authored with negative height at record time.
fn create_graphics_pipeline(
    device: &Device,
    desc: &GraphicsPipelineDesc,
    shader_dir: &Path,
) -> Result<handles::Pipeline> {
    let vert_module = load_shader_module(device, shader_dir, desc.vert)?;
    let frag_module = load_shader_module(device, shader_dir, desc.frag)?;
    let entry = CString::new("main").unwrap();

    // The fragment shader reads constant id 0 as its alpha discard switch
    let discard_value: u32 = desc.alpha_discard as u32;
    let spec_entries = [vk::SpecializationMapEntry {
        constant_id: 0,
        offset: 0,
        size: mem::size_of::<u32>(),
    }];
    let spec_data = discard_value.to_ne_bytes();
    let spec_info = vk::SpecializationInfo::builder()
        .map_entries(&spec_entries)
        .data(&spec_data)
        .build();

    let stages = [
        vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(vert_module.handle)
            .name(&entry)
            .build(),
        vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::FRAGMENT)
            .module(frag_module.handle)
            .name(&entry)
            .specialization_info(&spec_info)
            .build(),
    ];

    let vertex_input = vk::PipelineVertexInputStateCreateInfo::builder().build();
    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
        .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
        .build();
    let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
        .viewport_count(1)
        .scissor_count(1)
        .build();
    let raster = vk::PipelineRasterizationStateCreateInfo::builder()
        .polygon_mode(vk::PolygonMode::FILL)
        .cull_mode(vk::CullModeFlags::BACK)
        .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
        .line_width(1.0)
        .build();
    let multisample = vk::PipelineMultisampleStateCreateInfo::builder()
        .rasterization_samples(vk::SampleCountFlags::TYPE_1)
        .build();

    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
        .depth_test_enable(desc.depth_format.is_some())
        .depth_write_enable(desc.depth_write)
        // reverse-Z: near is one, far is zero
        .depth_compare_op(vk::CompareOp::GREATER)
        .build();

    let blend_attachment = if desc.blend {
        vk::PipelineColorBlendAttachmentState::builder()
            .blend_enable(true)
            .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
            .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .color_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(vk::BlendFactor::ONE)
            .dst_alpha_blend_factor(vk::BlendFactor::ZERO)
            .alpha_blend_op(vk::BlendOp::ADD)
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .build()
    } else {
        vk::PipelineColorBlendAttachmentState::builder()
            .blend_enable(false)
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .build()
    };
    let blend_attachments = [blend_attachment];
    let color_blend = vk::PipelineColorBlendStateCreateInfo::builder()
        .attachments(&blend_attachments)
        .build();

    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic = vk::PipelineDynamicStateCreateInfo::builder()
        .dynamic_states(&dynamic_states)
        .build();

    let color_formats = [desc.color_format];
    let mut rendering_info = vk::PipelineRenderingCreateInfo::builder()
        .color_attachment_formats(&color_formats)
        .depth_attachment_format(desc.depth_format.unwrap_or(vk::Format::UNDEFINED))
        .build();

    let info = vk::GraphicsPipelineCreateInfo::builder()
        .stages(&stages)
        .vertex_input_state(&vertex_input)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&raster)
        .multisample_state(&multisample)
        .depth_stencil_state(&depth_stencil)
        .color_blend_state(&color_blend)
        .dynamic_state(&dynamic)
        .layout(desc.layout)
        .render_pass(vk::RenderPass::null())
        .push_next(&mut rendering_info)
        .build();

    let pipeline = unsafe {
        device
            .dev
            .create_graphics_pipelines(vk::PipelineCache::null(), &[info], None)
            .map_err(|(_, e)| {
                log::error!("Graphics pipeline {}/{} failed: {:?}", desc.vert, desc.frag, e);
                BlitzenError::PIPELINE_CREATION_FAILED
            })?[0]
    };
    Ok(handles::Pipeline::wrap(pipeline))
}
