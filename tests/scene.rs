// Scene level tests against the public API
//
// Everything here runs without a device: the resource builder, the
// culling contract and the visibility protocol are all CPU observable.

extern crate blitzen;
use blitzen::{
    bounding_sphere, select_lod, sphere_in_frustum, CameraViewData, MeshTransform, RenderPassType,
    SceneResources, Vertex,
};

extern crate cgmath;
use cgmath::{Deg, InnerSpace, Matrix4, Quaternion, Rotation3, SquareMatrix, Vector3};

fn cube_primitive() -> (Vec<Vertex>, Vec<u32>) {
    let positions: [[f32; 3]; 8] = [
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
        0, 1, 2, 2, 3, 0, //
        4, 6, 5, 6, 4, 7, //
        0, 3, 7, 7, 4, 0, //
        1, 5, 6, 6, 2, 1, //
        3, 2, 6, 6, 7, 3, //
        0, 4, 5, 5, 1, 0,
    ];
    (vertices, indices)
}

fn grid_primitive(n: u32) -> (Vec<Vertex>, Vec<u32>) {
    let mut vertices = Vec::new();
    let mut indices = Vec::new();
    for y in 0..=n {
        for x in 0..=n {
            vertices.push(Vertex::new(
                [x as f32, y as f32, 0.0],
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

/// A symmetric 90 degree view volume looking down -z
fn test_view() -> CameraViewData {
    let side = 1.0f32 / 2.0f32.sqrt();
    CameraViewData {
        view: Matrix4::identity(),
        frustum_right: side,
        frustum_left: side,
        frustum_top: side,
        frustum_bottom: side,
        proj0: 1.0,
        proj5: 1.0,
        znear: 0.1,
        zfar: 200.0,
        lod_target: 0.02,
        ..Default::default()
    }
}

#[test]
fn a_whole_scene_assembles_and_validates() {
    let mut scene = SceneResources::new();

    let material = scene.add_material(0, 0, 0, 0);
    let (vertices, indices) = cube_primitive();
    let cube = scene
        .add_primitive(vertices, indices, material, false)
        .unwrap();
    let (vertices, indices) = grid_primitive(24);
    let terrain = scene
        .add_primitive(vertices, indices, material, false)
        .unwrap();

    // A couple thousand instances, the dynamic prefix first
    scene.dynamic_transform_count = 16;
    for i in 0..2048u32 {
        let transform = MeshTransform::new(
            Vector3::new((i % 64) as f32 * 4.0, 0.0, (i / 64) as f32 * 4.0),
            1.0,
            Quaternion::from_angle_y(Deg(i as f32)),
        );
        let id = scene.add_transform(transform);
        let surface = if i % 3 == 0 { terrain } else { cube };
        let pass = if i % 16 == 0 {
            RenderPassType::Transparent
        } else {
            RenderPassType::Opaque
        };
        scene.add_render_object(id, surface, pass).unwrap();
    }

    scene.validate().unwrap();
    assert_eq!(
        scene.opaque_objects.len() + scene.transparent_objects.len(),
        2048
    );

    // Both surfaces share the one global vertex and index buffer
    let s0 = scene.surfaces[cube as usize];
    let s1 = scene.surfaces[terrain as usize];
    assert_eq!(s0.vertex_offset, 0);
    assert!(s1.vertex_offset >= 8);
    assert_ne!(s0.lod_offset, s1.lod_offset);
}

#[test]
fn world_space_spheres_follow_their_transforms() {
    let (vertices, _) = cube_primitive();
    let (center, radius) = bounding_sphere(&vertices);

    let transform = MeshTransform::new(
        Vector3::new(10.0, 0.0, 0.0),
        2.0,
        Quaternion::from_angle_z(Deg(90.0)),
    );
    let (world_center, world_radius) = transform.transform_sphere(center, radius);

    assert!((world_center - Vector3::new(10.0, 0.0, 0.0)).magnitude() < 1e-4);
    assert!((world_radius - radius * 2.0).abs() < 1e-5);
}

#[test]
fn frustum_verdicts_match_the_draw_scenarios() {
    let view = test_view();

    // One cube at the origin of an identity view sits on the camera;
    // push it ahead so the scenario has a clean verdict
    assert!(sphere_in_frustum(&view, Vector3::new(0.0, 0.0, -5.0), 1.7));
    // An object far outside the frustum is culled by both passes and
    // never draws
    assert!(!sphere_in_frustum(
        &view,
        Vector3::new(1000.0, 0.0, -5.0),
        1.7
    ));
    // Behind the camera
    assert!(!sphere_in_frustum(&view, Vector3::new(0.0, 0.0, 50.0), 1.7));
}

#[test]
fn lod_selection_walks_the_chain_with_distance() {
    let mut scene = SceneResources::new();
    let (vertices, indices) = grid_primitive(32);
    let surface_id = scene.add_primitive(vertices, indices, 0, false).unwrap();
    let surface = scene.surfaces[surface_id as usize];
    let lods = &scene.lods
        [surface.lod_offset as usize..(surface.lod_offset + surface.lod_count) as usize];

    let view = test_view();
    let near = select_lod(&view, lods, Vector3::new(0.0, 0.0, -2.0), 1.0);
    let far = select_lod(&view, lods, Vector3::new(0.0, 0.0, -190.0), 1.0);
    assert_eq!(near, 0);
    assert!(far >= near);

    // Walking away never selects a finer LOD
    let mut last = 0;
    for d in 1..40 {
        let pick = select_lod(&view, lods, Vector3::new(0.0, 0.0, -(d as f32) * 5.0), 1.0);
        assert!(pick >= last);
        last = pick;
    }
}

#[test]
fn transform_matrices_hold_to_the_tolerance() {
    for i in 0..16 {
        let t = MeshTransform::new(
            Vector3::new(i as f32, -(i as f32) * 0.5, 3.0),
            0.5 + i as f32 * 0.25,
            Quaternion::from_angle_y(Deg(i as f32 * 23.0))
                * Quaternion::from_angle_x(Deg(i as f32 * 7.0)),
        );
        let m = t.to_matrix();
        let expected = Matrix4::from_translation(t.pos)
            * Matrix4::from(t.orientation)
            * Matrix4::from_scale(t.scale);
        for col in 0..4 {
            for row in 0..4 {
                assert!((m[col][row] - expected[col][row]).abs() <= 1e-5);
            }
        }

        let back = MeshTransform::from_matrix(&m);
        assert!((back.pos - t.pos).magnitude() <= 1e-5);
        assert!((back.scale - t.scale).abs() <= 1e-5);
        assert!((back.orientation.dot(t.orientation).abs() - 1.0).abs() <= 1e-5);
    }
}
