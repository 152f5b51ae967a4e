// The Blitzen renderer
//
// A GPU driven mesh renderer: a two pass occlusion culled, LOD
// selecting, indirect draw engine. Compute shaders author the draw
// command stream on the device; the CPU's per frame job is a transform
// restage, a view uniform write and one command buffer of dispatches,
// draws and barriers.
#![allow(dead_code)]

mod allocator;
mod buffers;
mod commands;
mod cull;
mod descriptors;
mod device;
mod frame;
mod handles;
mod instance;
mod pipelines;
mod raytracing;
mod renderer;
mod resources;
mod swapchain;
mod textures;

pub use cull::{occlusion_mip, project_sphere, select_lod, sphere_in_frustum};
pub use renderer::RendererStats;
pub use resources::{
    bounding_sphere, CameraViewData, Cluster, LodData, Material, MeshTransform, PrimitiveSurface,
    RenderObject, RenderPassType, SceneResources, Vertex, MAX_LOD_COUNT,
};
pub use textures::DdsTexture;

use cgmath::{Matrix4, SquareMatrix};
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use thiserror::Error;

use std::path::{Path, PathBuf};

/// Errors at the renderer boundary. Everything except the swapchain
/// conditions is fatal to the caller.
#[allow(non_camel_case_types)]
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum BlitzenError {
    #[error("Could not create a Vulkan instance")]
    VK_INSTANCE_CREATION_FAILED,
    #[error("Could not create the window surface")]
    VK_SURFACE_CREATION_FAILED,
    #[error("No device meets the required feature set")]
    VK_NOT_ALL_FEATURES_SUPPORTED,
    #[error("No queue family fits the requested work")]
    VK_NO_SUITABLE_QUEUE,
    #[error("Logical device creation failed")]
    VK_DEVICE_CREATION_FAILED,
    #[error("Swapchain creation failed")]
    VK_SWAPCHAIN_CREATION_FAILED,
    #[error("The swapchain no longer matches the surface")]
    SWAPCHAIN_OUT_OF_DATE,
    #[error("Could not acquire the next swapchain image")]
    COULD_NOT_ACQUIRE_IMAGE,
    #[error("Presentation failed")]
    PRESENT_FAILED,
    #[error("GPU memory allocation failed")]
    ALLOCATION_FAILED,
    #[error("No renderer is registered for scoped resources")]
    NO_RENDERER_REGISTERED,
    #[error("A renderer already owns the process wide device handles")]
    RENDERER_ALREADY_EXISTS,
    #[error("Semaphore or fence creation failed")]
    SYNC_OBJECT_CREATION_FAILED,
    #[error("Command pool creation failed")]
    COMMAND_POOL_CREATION_FAILED,
    #[error("Descriptor layout or set creation failed")]
    DESCRIPTOR_SETUP_FAILED,
    #[error("Pipeline creation failed")]
    PIPELINE_CREATION_FAILED,
    #[error("A shader asset could not be loaded")]
    SHADER_LOAD_FAILED,
    #[error("A texture could not be parsed or uploaded")]
    TEXTURE_LOAD_FAILED,
    #[error("Geometry violates the resource invariants")]
    INVALID_GEOMETRY,
    #[error("A render object references a missing transform or surface")]
    INVALID_RENDER_OBJECT,
    #[error("A fence wait timed out")]
    FENCE_TIMEOUT,
    #[error("Command buffer recording failed")]
    FRAME_RECORD_FAILED,
    #[error("Queue submission failed")]
    QUEUE_SUBMIT_FAILED,
    #[error("The scene is already frozen")]
    SCENE_ALREADY_FROZEN,
    #[error("setup_for_rendering has not run yet")]
    SCENE_NOT_READY,
}

pub type Result<T> = std::result::Result<T, BlitzenError>;

/// Renderer construction options
#[derive(Clone)]
pub struct CreateInfo {
    /// Run the meshlet cluster path (needs a dedicated compute queue)
    pub enable_clusters: bool,
    /// Where the pre-compiled SPIR-V assets live
    pub shader_dir: PathBuf,
}

impl Default for CreateInfo {
    fn default() -> Self {
        Self {
            enable_clusters: false,
            shader_dir: PathBuf::from("VulkanShaders"),
        }
    }
}

/// The camera collaborator's per frame output
pub struct CameraContext {
    pub view_data: CameraViewData,
    /// Projection with the reflective plane folded into the near plane
    pub onpc_projection: Matrix4<f32>,
    /// Debug: keep culling against the last unfrozen frustum
    pub freeze_frustum: bool,
    /// Debug: composite the given depth pyramid mip instead of the frame
    pub debug_pyramid_level: Option<u32>,

    pub window_resize: bool,
    pub window_width: u32,
    pub window_height: u32,
}

impl Default for CameraContext {
    fn default() -> Self {
        Self {
            view_data: CameraViewData::default(),
            onpc_projection: Matrix4::identity(),
            freeze_frustum: false,
            debug_pyramid_level: None,
            window_resize: false,
            window_width: 0,
            window_height: 0,
        }
    }
}

/// How many of each frozen render object list to consider this frame
#[derive(Copy, Clone, Default)]
pub struct RenderListCounts {
    pub opaque_count: u32,
    pub transparent_count: u32,
    pub onpc_count: u32,
}

/// Everything `update`/`draw_frame` consume each frame
#[derive(Default)]
pub struct DrawContext {
    pub camera: CameraContext,
    pub renders: RenderListCounts,
}

/// The public facing renderer handle, wrapping the draw orchestrator.
///
/// The expected call sequence: `new`, any number of `upload_texture`,
/// `setup_for_rendering` once, then `update` + `draw_frame` per frame
/// (`draw_while_waiting` until setup has happened).
pub struct Blitzen {
    rend: renderer::Renderer,
}

impl Blitzen {
    /// Initializes the whole stack against the platform window
    pub fn new<W>(
        window_width: u32,
        window_height: u32,
        window: &W,
        info: &CreateInfo,
    ) -> Result<Blitzen>
    where
        W: HasRawWindowHandle + HasRawDisplayHandle,
    {
        let rend = renderer::Renderer::new(
            window_width,
            window_height,
            window.raw_display_handle(),
            window.raw_window_handle(),
            info,
        )?;
        Ok(Blitzen { rend })
    }

    /// Loads a DDS texture into the bindless array and returns its tag.
    /// Only legal before the scene freezes.
    pub fn upload_texture(&mut self, filepath: &Path) -> Result<u32> {
        self.rend.upload_texture(filepath)
    }

    /// Uploads the scene and freezes it; afterwards only the dynamic
    /// transform prefix may change
    pub fn setup_for_rendering(&mut self, scene: &SceneResources) -> Result<()> {
        self.rend.setup_for_rendering(scene)
    }

    /// Updates one transform in the dynamic prefix
    pub fn update_object_transform(&mut self, transform_id: u32, transform: &MeshTransform) {
        self.rend.update_object_transform(transform_id, transform)
    }

    /// Loading screen frame, until `setup_for_rendering` has run
    pub fn draw_while_waiting(&mut self, delta_time: f32) -> Result<()> {
        self.rend.draw_while_waiting(delta_time)
    }

    /// Pre-frame maintenance: consumes the resize flag and rebuilds the
    /// swapchain, attachments and depth pyramid when it is set
    pub fn update(&mut self, context: &mut DrawContext) -> Result<()> {
        self.rend.update(context)
    }

    /// Records and submits one frame
    pub fn draw_frame(&mut self, context: &DrawContext) -> Result<()> {
        self.rend.draw_frame(context)
    }

    pub fn stats(&self) -> RendererStats {
        self.rend.stats()
    }

    /// Current draw extent, the swapchain's
    pub fn draw_extent(&self) -> (u32, u32) {
        self.rend.draw_extent()
    }

    /// Depth pyramid extent the camera has to mirror into its view data
    pub fn pyramid_extent(&self) -> (u32, u32) {
        self.rend.pyramid_extent()
    }
}
