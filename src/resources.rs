// CPU side rendering resources and their build-time preparation
//
// Everything the GPU buffers are filled from lives here: the packed
// vertex format, primitive surfaces with their LOD chains and bounding
// spheres, meshlet clusters, materials, transforms and render objects.
// The geometry preparation (cache/fetch optimization, LOD simplification,
// clustering) runs once at scene load through the meshoptimizer bindings.

use ash::vk;
use cgmath::{InnerSpace, Matrix3, Matrix4, Quaternion, Rotation, SquareMatrix, Vector3};

use crate::{BlitzenError, Result};
use utils::log;

use std::mem;

/// Hard cap on the LOD chain length of a single primitive
pub const MAX_LOD_COUNT: u32 = 8;

/// Meshlet limits. These have to match the cluster culling shader's
/// expectations about cluster shape.
pub const MESHLET_MAX_VERTICES: usize = 64;
pub const MESHLET_MAX_TRIANGLES: usize = 124;
const MESHLET_CONE_WEIGHT: f32 = 0.25;

/// Each simplification round targets 65% of the previous index count
const LOD_INDEX_SHRINK: f64 = 0.65;
/// A new LOD within 5% of the previous one is not worth keeping
const LOD_MIN_REDUCTION: f64 = 0.95;
/// Object space error cap handed to the simplifier
const LOD_MAX_ERROR: f32 = 0.1;

/// The packed vertex format shared by every pipeline.
///
/// 32 bytes: position, float UVs, and 8 bit packed normal/tangent.
/// The tangent w component carries the bitangent handedness.
#[repr(C, align(16))]
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Vertex {
    pub position: [f32; 3],
    pub uv_x: f32,
    pub uv_y: f32,
    pub normal: [u8; 4],
    pub tangent: [u8; 4],
    pub padding0: u32,
}

impl Vertex {
    /// Packs a [-1, 1] component into the 8 bit form the shaders decode
    /// with `x / 127 - 1`.
    pub fn pack_snorm(v: f32) -> u8 {
        let clamped = if v < -1.0 {
            -1.0
        } else if v > 1.0 {
            1.0
        } else {
            v
        };
        ((clamped + 1.0) * 127.0 + 0.5) as u8
    }

    pub fn unpack_snorm(v: u8) -> f32 {
        v as f32 / 127.0 - 1.0
    }

    pub fn new(position: [f32; 3], uv: [f32; 2], normal: [f32; 3], tangent: [f32; 4]) -> Self {
        Self {
            position,
            uv_x: uv[0],
            uv_y: uv[1],
            normal: [
                Self::pack_snorm(normal[0]),
                Self::pack_snorm(normal[1]),
                Self::pack_snorm(normal[2]),
                0,
            ],
            tangent: [
                Self::pack_snorm(tangent[0]),
                Self::pack_snorm(tangent[1]),
                Self::pack_snorm(tangent[2]),
                Self::pack_snorm(tangent[3]),
            ],
            padding0: 0,
        }
    }
}

/// One drawable primitive: a bounding sphere, a material and a window
/// into the LOD table. The culling shaders read these directly.
#[repr(C, align(16))]
#[derive(Copy, Clone, Debug, Default)]
pub struct PrimitiveSurface {
    pub center: [f32; 3],
    pub radius: f32,

    pub material_id: u32,

    // Each primitive can be drawn in multiple ways depending on its LODs.
    // The LOD is selected in the culling shaders.
    pub lod_offset: u32,
    pub lod_count: u32,

    pub vertex_offset: u32,
}

/// One level of detail. The classic path consumes `(index_count,
/// first_index)`, the cluster path `(cluster_offset, cluster_count)`.
/// `error` is the simplifier's geometric error pre-scaled by
/// `meshopt_simplifyScale`, non-decreasing along a chain.
#[repr(C, align(16))]
#[derive(Copy, Clone, Debug, Default)]
pub struct LodData {
    pub index_count: u32,
    pub first_index: u32,

    pub cluster_offset: u32,
    pub cluster_count: u32,

    pub error: f32,

    pub padding0: u32,
    pub padding1: u32,
    pub padding2: u32,
}

/// A meshlet: bounding sphere, backface cone and a window into the
/// cluster index buffer.
#[repr(C, align(16))]
#[derive(Copy, Clone, Debug, Default)]
pub struct Cluster {
    pub center: [f32; 3],
    pub radius: f32,

    pub cone_axis_x: i8,
    pub cone_axis_y: i8,
    pub cone_axis_z: i8,
    pub cone_cutoff: i8,

    // Offset into the cluster index buffer
    pub data_offset: u32,

    pub vertex_count: u8,
    pub triangle_count: u8,
    pub padding0: u8,
    pub padding1: u8,
}

/// Texture ids into the bindless texture array plus the material's own
/// index for draw-time lookup.
#[repr(C, align(16))]
#[derive(Copy, Clone, Debug, Default)]
pub struct Material {
    pub albedo_tag: u32,
    pub normal_tag: u32,
    pub specular_tag: u32,
    pub emissive_tag: u32,

    pub material_id: u32,
    pub padding0: u32,
    pub padding1: u32,
    pub padding2: u32,
}

/// Per mesh transform, passed to the GPU and accessed through render
/// objects. Only uniform scale is supported; the scene loader collapses
/// non-uniform scale before it gets here.
#[repr(C, align(16))]
#[derive(Copy, Clone, Debug)]
pub struct MeshTransform {
    pub pos: Vector3<f32>,
    pub scale: f32,
    pub orientation: Quaternion<f32>,
}

impl Default for MeshTransform {
    fn default() -> Self {
        Self {
            pos: Vector3::new(0.0, 0.0, 0.0),
            scale: 1.0,
            orientation: Quaternion::new(1.0, 0.0, 0.0, 0.0),
        }
    }
}

impl MeshTransform {
    pub fn new(pos: Vector3<f32>, scale: f32, orientation: Quaternion<f32>) -> Self {
        Self {
            pos,
            scale,
            orientation,
        }
    }

    /// The model matrix: `Translate(pos) * Mat4(orientation) * Scale(scale)`
    pub fn to_matrix(&self) -> Matrix4<f32> {
        Matrix4::from_translation(self.pos)
            * Matrix4::from(self.orientation)
            * Matrix4::from_scale(self.scale)
    }

    /// Rebuilds a transform from a uniform-scale model matrix.
    ///
    /// The scale is recovered from the basis column lengths, which only
    /// round trips for uniform scale. That is the renderer-wide contract.
    pub fn from_matrix(m: &Matrix4<f32>) -> Self {
        let scale = m.x.truncate().magnitude();
        let inv = 1.0 / scale;
        let rot = Matrix3::from_cols(
            m.x.truncate() * inv,
            m.y.truncate() * inv,
            m.z.truncate() * inv,
        );
        Self {
            pos: m.w.truncate(),
            scale,
            orientation: Quaternion::from(rot).normalize(),
        }
    }

    /// World-space bounding sphere of a surface under this transform
    pub fn transform_sphere(&self, center: Vector3<f32>, radius: f32) -> (Vector3<f32>, f32) {
        (
            self.pos + self.orientation.rotate_vector(center) * self.scale,
            radius * self.scale,
        )
    }
}

/// `(transformId, surfaceId)`. The opaque, transparent and ONPC lists
/// are disjoint arrays so each pass reads a dense list.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct RenderObject {
    pub transform_id: u32,
    pub surface_id: u32,
}

/// The per-frame view uniform. The layout is the shader-side contract;
/// the camera collaborator fills it in.
#[repr(C, align(16))]
#[derive(Copy, Clone, Debug)]
pub struct CameraViewData {
    pub view: Matrix4<f32>,
    pub projection_view: Matrix4<f32>,

    pub position: Vector3<f32>,

    // Frustum data created from the transpose of the projection matrix
    pub frustum_right: f32,
    pub frustum_left: f32,
    pub frustum_top: f32,
    pub frustum_bottom: f32,

    // First and sixth elements of the projection matrix, used by the
    // occlusion pass to project bounding spheres
    pub proj0: f32,
    pub proj5: f32,

    pub znear: f32,
    pub zfar: f32,

    pub pyramid_width: f32,
    pub pyramid_height: f32,

    // Screen-projected-size threshold for LOD selection
    pub lod_target: f32,
}

impl Default for CameraViewData {
    fn default() -> Self {
        Self {
            view: Matrix4::identity(),
            projection_view: Matrix4::identity(),
            position: Vector3::new(0.0, 0.0, 0.0),
            frustum_right: 0.0,
            frustum_left: 0.0,
            frustum_top: 0.0,
            frustum_bottom: 0.0,
            proj0: 1.0,
            proj5: 1.0,
            znear: 0.1,
            zfar: 1000.0,
            pyramid_width: 0.0,
            pyramid_height: 0.0,
            lod_target: 1.0,
        }
    }
}

/// Where a render object is drawn
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RenderPassType {
    Opaque,
    Transparent,
    /// Oblique near-plane clipped reflective geometry
    OnpcReflective,
}

/// Everything `setup_for_rendering` uploads. Built once by the scene
/// loading collaborator through the `add_*` methods, then frozen except
/// for the dynamic transform prefix.
#[derive(Default)]
pub struct SceneResources {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
    pub surfaces: Vec<PrimitiveSurface>,
    pub lods: Vec<LodData>,
    pub clusters: Vec<Cluster>,
    pub cluster_indices: Vec<u32>,
    pub materials: Vec<Material>,

    pub transforms: Vec<MeshTransform>,
    /// Transforms below this index may change per frame and are restaged
    /// every frame; the rest are static for the scene's life.
    pub dynamic_transform_count: usize,

    pub opaque_objects: Vec<RenderObject>,
    pub transparent_objects: Vec<RenderObject>,
    pub onpc_objects: Vec<RenderObject>,
}

impl SceneResources {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs the full build-time preparation for one primitive and
    /// registers it as a surface. Returns the surface id.
    ///
    /// The vertex/index data is consumed: vertices are renumbered by the
    /// fetch optimizer before landing in the global vertex buffer.
    pub fn add_primitive(
        &mut self,
        mut vertices: Vec<Vertex>,
        mut indices: Vec<u32>,
        material_id: u32,
        build_clusters: bool,
    ) -> Result<u32> {
        if vertices.is_empty() || indices.len() < 3 || indices.len() % 3 != 0 {
            return Err(BlitzenError::INVALID_GEOMETRY);
        }

        meshopt::optimize_vertex_cache_in_place(&mut indices, vertices.len());
        meshopt::optimize_vertex_fetch_in_place(&mut indices, &mut vertices);

        let mut surface = PrimitiveSurface::default();
        surface.material_id = material_id;
        surface.vertex_offset = self.vertices.len() as u32;

        let (center, radius) = bounding_sphere(&vertices);
        surface.center = [center.x, center.y, center.z];
        surface.radius = radius;

        log::info!(
            "Building LOD chain for a surface of {} triangles",
            indices.len() / 3
        );
        self.build_lod_chain(&mut surface, &vertices, &indices, build_clusters)?;

        self.vertices.extend_from_slice(&vertices);
        self.surfaces.push(surface);

        Ok(self.surfaces.len() as u32 - 1)
    }

    pub fn add_material(
        &mut self,
        albedo_tag: u32,
        normal_tag: u32,
        specular_tag: u32,
        emissive_tag: u32,
    ) -> u32 {
        let id = self.materials.len() as u32;
        self.materials.push(Material {
            albedo_tag,
            normal_tag,
            specular_tag,
            emissive_tag,
            material_id: id,
            ..Default::default()
        });
        id
    }

    pub fn add_transform(&mut self, transform: MeshTransform) -> u32 {
        self.transforms.push(transform);
        self.transforms.len() as u32 - 1
    }

    pub fn add_render_object(
        &mut self,
        transform_id: u32,
        surface_id: u32,
        pass: RenderPassType,
    ) -> Result<()> {
        if transform_id as usize >= self.transforms.len()
            || surface_id as usize >= self.surfaces.len()
        {
            return Err(BlitzenError::INVALID_RENDER_OBJECT);
        }

        let obj = RenderObject {
            transform_id,
            surface_id,
        };
        match pass {
            RenderPassType::Opaque => self.opaque_objects.push(obj),
            RenderPassType::Transparent => self.transparent_objects.push(obj),
            RenderPassType::OnpcReflective => self.onpc_objects.push(obj),
        }
        Ok(())
    }

    /// Checks the cross-array invariants before anything is uploaded.
    /// Setup refuses a scene that fails this.
    pub fn validate(&self) -> Result<()> {
        for obj in self
            .opaque_objects
            .iter()
            .chain(self.transparent_objects.iter())
            .chain(self.onpc_objects.iter())
        {
            if obj.transform_id as usize >= self.transforms.len()
                || obj.surface_id as usize >= self.surfaces.len()
            {
                return Err(BlitzenError::INVALID_RENDER_OBJECT);
            }
        }

        for surface in self.surfaces.iter() {
            if surface.lod_count < 1 || surface.lod_count > MAX_LOD_COUNT {
                return Err(BlitzenError::INVALID_GEOMETRY);
            }
            let lod_end = (surface.lod_offset + surface.lod_count) as usize;
            if lod_end > self.lods.len() {
                return Err(BlitzenError::INVALID_GEOMETRY);
            }
            let lods = &self.lods[surface.lod_offset as usize..lod_end];
            let mut prev_error = 0.0f32;
            for (i, lod) in lods.iter().enumerate() {
                if i == 0 && lod.error != 0.0 {
                    return Err(BlitzenError::INVALID_GEOMETRY);
                }
                if lod.error < prev_error {
                    return Err(BlitzenError::INVALID_GEOMETRY);
                }
                prev_error = lod.error;

                let end = lod.first_index as usize + lod.index_count as usize;
                if end > self.indices.len() {
                    return Err(BlitzenError::INVALID_GEOMETRY);
                }
                for &index in &self.indices[lod.first_index as usize..end] {
                    if index as usize >= self.vertices.len() {
                        return Err(BlitzenError::INVALID_GEOMETRY);
                    }
                }
            }
        }

        Ok(())
    }

    /// LOD chain construction: start from the loaded indices as LOD 0
    /// (error 0) and keep simplifying towards 65% of the previous index
    /// count until the error cap stops the simplifier, a round reduces
    /// by less than 5%, or the chain is full.
    fn build_lod_chain(
        &mut self,
        surface: &mut PrimitiveSurface,
        vertices: &[Vertex],
        indices: &[u32],
        build_clusters: bool,
    ) -> Result<()> {
        let adapter = vertex_adapter(vertices)?;
        let lod_scale = meshopt::simplify_scale(&adapter);
        let mut lod_error = 0.0f32;

        let mut lod_indices: Vec<u32> = indices.to_vec();
        let mut all_lod_indices: Vec<u32> = Vec::new();

        surface.lod_offset = self.lods.len() as u32;
        while surface.lod_count < MAX_LOD_COUNT {
            surface.lod_count += 1;

            let mut lod = LodData::default();
            lod.first_index = (self.indices.len() + all_lod_indices.len()) as u32;
            lod.index_count = lod_indices.len() as u32;

            lod.cluster_offset = self.clusters.len() as u32;
            lod.cluster_count = if build_clusters {
                self.build_clusters(vertices, &lod_indices, surface.vertex_offset)? as u32
            } else {
                0
            };

            lod.error = lod_error * lod_scale;
            self.lods.push(lod);

            all_lod_indices.extend_from_slice(&lod_indices);

            // Start generating the next level of detail
            if surface.lod_count < MAX_LOD_COUNT {
                let next_indices_target =
                    ((lod_indices.len() as f64 * LOD_INDEX_SHRINK) / 3.0) as usize * 3;
                let mut next_error = 0.0f32;

                let next_indices = meshopt::simplify(
                    &lod_indices,
                    &adapter,
                    next_indices_target,
                    LOD_MAX_ERROR,
                    meshopt::SimplifyOptions::empty(),
                    Some(&mut next_error),
                );

                if next_indices.len() > lod_indices.len() {
                    log::error!("LOD generation failed");
                    break;
                }
                // Reached the error bounds
                if next_indices.len() == lod_indices.len() || next_indices.is_empty() {
                    break;
                }
                // While this LOD could be kept, it is too close to the last
                // one (and it can't go below that due to the error cap)
                if next_indices.len() >= (lod_indices.len() as f64 * LOD_MIN_REDUCTION) as usize {
                    break;
                }

                lod_indices = next_indices;
                meshopt::optimize_vertex_cache_in_place(&mut lod_indices, vertices.len());

                // The next round starts from this LOD, so the error accumulates
                lod_error = if next_error > lod_error {
                    next_error
                } else {
                    lod_error
                };
            }
        }

        // Shift into the global vertex buffer before appending the chain
        // to the global index buffer
        let vertex_offset = surface.vertex_offset;
        for index in all_lod_indices.iter_mut() {
            *index += vertex_offset;
        }
        self.indices.extend_from_slice(&all_lod_indices);

        Ok(())
    }

    /// Partitions one LOD's index list into meshlets and records their
    /// bounding spheres and backface cones. Returns how many clusters
    /// were appended.
    fn build_clusters(
        &mut self,
        vertices: &[Vertex],
        indices: &[u32],
        vertex_offset: u32,
    ) -> Result<usize> {
        let adapter = vertex_adapter(vertices)?;
        let meshlets = meshopt::build_meshlets(
            indices,
            &adapter,
            MESHLET_MAX_VERTICES,
            MESHLET_MAX_TRIANGLES,
            MESHLET_CONE_WEIGHT,
        );

        let mut count = 0;
        for meshlet in meshlets.iter() {
            let data_offset = self.cluster_indices.len() as u32;
            let vertex_count = meshlet.vertices.len() as u8;
            let triangle_count = (meshlet.triangles.len() / 3) as u8;

            // Each triangle holds three indices into the meshlet-local
            // vertex list; resolve them to global vertex buffer indices
            for t in 0..meshlet.triangles.len() / 3 {
                for j in 0..3 {
                    let local = meshlet.triangles[t * 3 + j] as usize;
                    self.cluster_indices
                        .push(meshlet.vertices[local] + vertex_offset);
                }
            }

            let bounds = meshopt::compute_meshlet_bounds(meshlet, &adapter);

            self.clusters.push(Cluster {
                center: bounds.center,
                radius: bounds.radius,
                cone_axis_x: bounds.cone_axis_s8[0],
                cone_axis_y: bounds.cone_axis_s8[1],
                cone_axis_z: bounds.cone_axis_s8[2],
                cone_cutoff: bounds.cone_cutoff_s8,
                data_offset,
                vertex_count,
                triangle_count,
                padding0: 0,
                padding1: 0,
            });
            count += 1;
        }

        Ok(count)
    }
}

/// Centroid-based bounding sphere: the centre is the vertex centroid,
/// the radius the largest distance from it.
pub fn bounding_sphere(vertices: &[Vertex]) -> (Vector3<f32>, f32) {
    let mut center = Vector3::new(0.0f32, 0.0, 0.0);
    for v in vertices.iter() {
        center += Vector3::new(v.position[0], v.position[1], v.position[2]);
    }
    center /= vertices.len() as f32;

    let mut radius = 0.0f32;
    for v in vertices.iter() {
        let pos = Vector3::new(v.position[0], v.position[1], v.position[2]);
        radius = utils::partial_max(radius, (pos - center).magnitude());
    }

    (center, radius)
}

/// The row-major 3x4 matrix layout acceleration structure instances use
pub fn transform_to_rows(transform: &MeshTransform) -> vk::TransformMatrixKHR {
    let m = transform.to_matrix();
    // cgmath stores columns; the instance wants the top three rows
    vk::TransformMatrixKHR {
        matrix: [
            m.x.x, m.y.x, m.z.x, m.w.x, //
            m.x.y, m.y.y, m.z.y, m.w.y, //
            m.x.z, m.y.z, m.z.z, m.w.z,
        ],
    }
}

fn vertex_adapter(vertices: &[Vertex]) -> Result<meshopt::VertexDataAdapter> {
    let bytes = unsafe {
        std::slice::from_raw_parts(
            vertices.as_ptr() as *const u8,
            vertices.len() * mem::size_of::<Vertex>(),
        )
    };
    meshopt::VertexDataAdapter::new(bytes, mem::size_of::<Vertex>(), 0)
        .map_err(|_| BlitzenError::INVALID_GEOMETRY)
}

// The shader-side structs are std430 mirrors of these; a size drift
// here is a silent GPU corruption, so pin them at compile time
const _: [u8; 32] = [0; mem::size_of::<Vertex>()];
const _: [u8; 32] = [0; mem::size_of::<PrimitiveSurface>()];
const _: [u8; 32] = [0; mem::size_of::<LodData>()];
const _: [u8; 32] = [0; mem::size_of::<Cluster>()];
const _: [u8; 32] = [0; mem::size_of::<Material>()];
const _: [u8; 32] = [0; mem::size_of::<MeshTransform>()];
const _: [u8; 8] = [0; mem::size_of::<RenderObject>()];

#[cfg(test)]
mod tests {
    use super::*;
    use cgmath::{Deg, Rotation3};

    fn cube() -> (Vec<Vertex>, Vec<u32>) {
        let positions = [
            [-1.0, -1.0, -1.0],
            [1.0, -1.0, -1.0],
            [1.0, 1.0, -1.0],
            [-1.0, 1.0, -1.0],
            [-1.0, -1.0, 1.0],
            [1.0, -1.0, 1.0],
            [1.0, 1.0, 1.0],
            [-1.0, 1.0, 1.0],
        ];
        let vertices = positions
            .iter()
            .map(|p| Vertex::new(*p, [0.0, 0.0], [0.0, 0.0, 1.0], [1.0, 0.0, 0.0, 1.0]))
            .collect();
        let indices = vec![
            0, 1, 2, 2, 3, 0, // back
            4, 6, 5, 6, 4, 7, // front
            0, 3, 7, 7, 4, 0, // left
            1, 5, 6, 6, 2, 1, // right
            3, 2, 6, 6, 7, 3, // top
            0, 4, 5, 5, 1, 0, // bottom
        ];
        (vertices, indices)
    }

    /// A densely tessellated plane, big enough for the simplifier to
    /// actually produce a chain
    fn grid(n: u32) -> (Vec<Vertex>, Vec<u32>) {
        let mut vertices = Vec::new();
        let mut indices = Vec::new();
        for y in 0..=n {
            for x in 0..=n {
                vertices.push(Vertex::new(
                    [x as f32 / n as f32, y as f32 / n as f32, 0.0],
                    [0.0, 0.0],
                    [0.0, 0.0, 1.0],
                    [1.0, 0.0, 0.0, 1.0],
                ));
            }
        }
        for y in 0..n {
            for x in 0..n {
                let base = y * (n + 1) + x;
                indices.extend_from_slice(&[base, base + 1, base + n + 1]);
                indices.extend_from_slice(&[base + 1, base + n + 2, base + n + 1]);
            }
        }
        (vertices, indices)
    }

    #[test]
    fn lod_errors_are_monotone() {
        let (vertices, indices) = grid(32);
        let mut scene = SceneResources::new();
        let surf = scene.add_primitive(vertices, indices, 0, false).unwrap();

        let surface = scene.surfaces[surf as usize];
        assert!(surface.lod_count >= 2);
        assert!(surface.lod_count <= MAX_LOD_COUNT);

        let lods = &scene.lods
            [surface.lod_offset as usize..(surface.lod_offset + surface.lod_count) as usize];
        assert_eq!(lods[0].error, 0.0);
        for pair in lods.windows(2) {
            assert!(pair[0].error <= pair[1].error);
            // No LOD within 5% of its predecessor
            assert!((pair[1].index_count as f64) < pair[0].index_count as f64 * 0.95);
        }

        scene.validate().unwrap();
    }

    #[test]
    fn lod_ranges_stay_inside_the_index_buffer() {
        let mut scene = SceneResources::new();
        let (vertices, indices) = grid(16);
        scene.add_primitive(vertices, indices, 0, false).unwrap();
        let (vertices, indices) = cube();
        scene.add_primitive(vertices, indices, 0, false).unwrap();

        for lod in scene.lods.iter() {
            let end = (lod.first_index + lod.index_count) as usize;
            assert!(end <= scene.indices.len());
            for &i in &scene.indices[lod.first_index as usize..end] {
                assert!((i as usize) < scene.vertices.len());
            }
        }
    }

    #[test]
    fn cube_keeps_a_single_lod() {
        // 12 triangles cannot be simplified under the error cap without
        // collapsing, so the chain stops at LOD 0
        let (vertices, indices) = cube();
        let mut scene = SceneResources::new();
        let surf = scene.add_primitive(vertices, indices, 0, false).unwrap();
        let surface = scene.surfaces[surf as usize];
        assert_eq!(scene.lods[surface.lod_offset as usize].index_count, 36);
        assert_eq!(scene.lods[surface.lod_offset as usize].error, 0.0);
    }

    #[test]
    fn bounding_sphere_covers_all_vertices() {
        let (vertices, _) = cube();
        let (center, radius) = bounding_sphere(&vertices);
        assert!((center - Vector3::new(0.0, 0.0, 0.0)).magnitude() < 1e-5);
        for v in vertices.iter() {
            let p = Vector3::new(v.position[0], v.position[1], v.position[2]);
            assert!((p - center).magnitude() <= radius + 1e-5);
        }
        assert!((radius - 3.0f32.sqrt()).abs() < 1e-5);
    }

    #[test]
    fn clusters_respect_meshlet_limits() {
        let (vertices, indices) = grid(24);
        let mut scene = SceneResources::new();
        let surf = scene.add_primitive(vertices, indices, 0, true).unwrap();

        let surface = scene.surfaces[surf as usize];
        let lod0 = scene.lods[surface.lod_offset as usize];
        assert!(lod0.cluster_count > 0);

        for cluster in scene.clusters.iter() {
            assert!(cluster.vertex_count as usize <= MESHLET_MAX_VERTICES);
            assert!(cluster.triangle_count as usize <= MESHLET_MAX_TRIANGLES);
            let end = cluster.data_offset as usize + cluster.triangle_count as usize * 3;
            assert!(end <= scene.cluster_indices.len());
        }

        // Every cluster index resolves into the global vertex buffer
        for &i in scene.cluster_indices.iter() {
            assert!((i as usize) < scene.vertices.len());
        }
    }

    #[test]
    fn transform_matrix_matches_the_factor_product() {
        let t = MeshTransform::new(
            Vector3::new(1.0, -2.0, 3.0),
            2.5,
            Quaternion::from_angle_y(Deg(40.0)),
        );
        let expected = Matrix4::from_translation(t.pos)
            * Matrix4::from(t.orientation)
            * Matrix4::from_scale(t.scale);
        let got = t.to_matrix();
        for col in 0..4 {
            for row in 0..4 {
                assert!((got[col][row] - expected[col][row]).abs() <= 1e-5);
            }
        }
    }

    #[test]
    fn transform_decompose_round_trips() {
        let t = MeshTransform::new(
            Vector3::new(-4.0, 0.25, 9.0),
            0.75,
            Quaternion::from_angle_x(Deg(25.0)) * Quaternion::from_angle_z(Deg(-60.0)),
        );
        let back = MeshTransform::from_matrix(&t.to_matrix());

        assert!((back.pos - t.pos).magnitude() <= 1e-5);
        assert!((back.scale - t.scale).abs() <= 1e-5);
        // q and -q encode the same rotation
        let dot = back.orientation.dot(t.orientation).abs();
        assert!((dot - 1.0).abs() <= 1e-5);
    }

    #[test]
    fn snorm_packing_round_trips_the_endpoints() {
        assert_eq!(Vertex::unpack_snorm(Vertex::pack_snorm(1.0)), 1.0);
        assert_eq!(Vertex::unpack_snorm(Vertex::pack_snorm(-1.0)), -1.0);
        assert!(Vertex::unpack_snorm(Vertex::pack_snorm(0.0)).abs() < 0.01);
    }

    #[test]
    fn render_object_ids_are_validated() {
        let mut scene = SceneResources::new();
        let (vertices, indices) = cube();
        let surf = scene.add_primitive(vertices, indices, 0, false).unwrap();
        let xform = scene.add_transform(MeshTransform::default());

        scene
            .add_render_object(xform, surf, RenderPassType::Opaque)
            .unwrap();
        assert!(scene
            .add_render_object(xform + 1, surf, RenderPassType::Opaque)
            .is_err());
        assert!(scene
            .add_render_object(xform, surf + 1, RenderPassType::Transparent)
            .is_err());
    }

    #[test]
    fn instance_rows_place_translation_in_the_last_column() {
        let t = MeshTransform::new(
            Vector3::new(5.0, 6.0, 7.0),
            1.0,
            Quaternion::new(1.0, 0.0, 0.0, 0.0),
        );
        let rows = transform_to_rows(&t).matrix;
        assert_eq!(rows[3], 5.0);
        assert_eq!(rows[7], 6.0);
        assert_eq!(rows[11], 7.0);
        // identity basis
        assert_eq!(rows[0], 1.0);
        assert_eq!(rows[5], 1.0);
        assert_eq!(rows[10], 1.0);
    }
}
