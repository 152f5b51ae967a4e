// CPU reference of the culling shader contract
//
// The culling itself runs in compute shaders; these functions define the
// exact math those shaders implement against the view uniform. Keeping
// the reference on the CPU pins the contract down, lets the scene side
// predict visibility, and makes the per-frame semantics testable without
// a device.

use cgmath::{InnerSpace, Matrix4, Vector3, Vector4};

use crate::resources::{CameraViewData, LodData};

/// Frustum test of a world-space bounding sphere.
///
/// The view uniform stores the side planes of a symmetric projection as
/// four scalars: `frustum_right/frustum_left` are the x/z coefficients
/// of the folded left-right plane pair, `frustum_top/frustum_bottom` the
/// y/z coefficients of the folded top-bottom pair. The sphere is culled
/// in view space, with znear/zfar closing the volume.
pub fn sphere_in_frustum(view_data: &CameraViewData, center: Vector3<f32>, radius: f32) -> bool {
    let c = view_point(&view_data.view, center);

    let mut visible = true;
    visible = visible && c.z * view_data.frustum_left - c.x.abs() * view_data.frustum_right > -radius;
    visible = visible && c.z * view_data.frustum_bottom - c.y.abs() * view_data.frustum_top > -radius;
    visible = visible && c.z + radius > view_data.znear && c.z - radius < view_data.zfar;
    visible
}

/// Distance-based LOD pick.
///
/// A LOD is acceptable when its object-space error, projected at the
/// sphere's distance, stays under the lod target. Errors are
/// non-decreasing along the chain, so the coarsest acceptable LOD is the
/// last one under the threshold; LOD 0 has error 0 and is always the
/// fallback. The pick is monotone in distance.
pub fn select_lod(view_data: &CameraViewData, lods: &[LodData], center: Vector3<f32>, radius: f32) -> usize {
    let c = view_point(&view_data.view, center);
    let distance = utils::partial_max(c.magnitude() - radius, view_data.znear);
    let threshold = distance * view_data.lod_target;

    let mut pick = 0;
    for (i, lod) in lods.iter().enumerate() {
        if lod.error <= threshold {
            pick = i;
        }
    }
    pick
}

/// Projects a view-space sphere to a screen-space AABB in [0, 1] UV.
///
/// Returns `None` when the sphere crosses the near plane, in which case
/// the occlusion pass must treat the object as visible. This is the 2D
/// projection the late cull uses to select a depth pyramid mip.
pub fn project_sphere(
    center: Vector3<f32>,
    radius: f32,
    znear: f32,
    proj0: f32,
    proj5: f32,
) -> Option<[f32; 4]> {
    if center.z < radius + znear {
        return None;
    }

    let cx = Vector3::new(center.x, 0.0, center.z);
    let vx = (cx.dot(cx) - radius * radius).sqrt();
    let min_x = (vx * center.x - radius * center.z) / (vx * center.z + radius * center.x);
    let max_x = (vx * center.x + radius * center.z) / (vx * center.z - radius * center.x);

    let cy = Vector3::new(0.0, center.y, center.z);
    let vy = (cy.dot(cy) - radius * radius).sqrt();
    let min_y = (vy * center.y - radius * center.z) / (vy * center.z + radius * center.y);
    let max_y = (vy * center.y + radius * center.z) / (vy * center.z - radius * center.y);

    // clip space -> uv space, y flipped to match the pyramid's origin
    Some([
        min_x * proj0 * 0.5 + 0.5,
        max_y * proj5 * -0.5 + 0.5,
        max_x * proj0 * 0.5 + 0.5,
        min_y * proj5 * -0.5 + 0.5,
    ])
}

/// Depth pyramid mip for an AABB of the given pixel footprint:
/// `ceil(log2(max(w, h)))`, so one sample conservatively covers the box.
pub fn occlusion_mip(width_px: f32, height_px: f32) -> u32 {
    let level = utils::partial_max(width_px, height_px).max(1.0).log2().ceil();
    level as u32
}

fn view_point(view: &Matrix4<f32>, p: Vector3<f32>) -> Vector3<f32> {
    let v = view * Vector4::new(p.x, p.y, p.z, 1.0);
    // The cull volume faces +z in view space
    Vector3::new(v.x, v.y, -v.z)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::CameraViewData;
    use cgmath::SquareMatrix;

    /// A 90 degree symmetric view volume looking down -z
    fn identity_view() -> CameraViewData {
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
            zfar: 100.0,
            lod_target: 0.05,
            ..Default::default()
        }
    }

    #[test]
    fn sphere_ahead_of_the_camera_is_visible() {
        let vd = identity_view();
        assert!(sphere_in_frustum(&vd, Vector3::new(0.0, 0.0, -10.0), 1.0));
    }

    #[test]
    fn sphere_far_off_axis_is_culled() {
        let vd = identity_view();
        // Far outside the 45 degree half angle
        assert!(!sphere_in_frustum(&vd, Vector3::new(50.0, 0.0, -5.0), 1.0));
        assert!(!sphere_in_frustum(&vd, Vector3::new(0.0, -50.0, -5.0), 1.0));
    }

    #[test]
    fn sphere_behind_the_camera_is_culled() {
        let vd = identity_view();
        assert!(!sphere_in_frustum(&vd, Vector3::new(0.0, 0.0, 10.0), 1.0));
        // Beyond the far plane
        assert!(!sphere_in_frustum(&vd, Vector3::new(0.0, 0.0, -500.0), 1.0));
    }

    #[test]
    fn sphere_straddling_a_plane_is_kept() {
        let vd = identity_view();
        // Center sits right on the right plane; the radius keeps it visible
        assert!(sphere_in_frustum(&vd, Vector3::new(5.0, 0.0, -5.0), 1.0));
    }

    fn chain() -> Vec<LodData> {
        [0.0f32, 0.01, 0.05, 0.2]
            .iter()
            .map(|&error| LodData {
                error,
                ..Default::default()
            })
            .collect()
    }

    #[test]
    fn lod_pick_is_monotone_in_distance() {
        let vd = identity_view();
        let lods = chain();
        let mut last = 0;
        for dist in [1.0f32, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0].iter() {
            let pick = select_lod(&vd, &lods, Vector3::new(0.0, 0.0, -dist), 0.5);
            assert!(pick >= last);
            last = pick;
        }
        // Far away the coarsest LOD wins
        assert_eq!(last, lods.len() - 1);
    }

    #[test]
    fn lod_zero_is_the_close_range_fallback() {
        let vd = identity_view();
        let lods = chain();
        let pick = select_lod(&vd, &lods, Vector3::new(0.0, 0.0, -0.2), 0.5);
        assert_eq!(pick, 0);
    }

    #[test]
    fn sphere_crossing_the_near_plane_does_not_project() {
        assert!(project_sphere(Vector3::new(0.0, 0.0, 0.5), 1.0, 0.1, 1.0, 1.0).is_none());
    }

    #[test]
    fn projected_aabb_is_ordered_and_centered() {
        let aabb = project_sphere(Vector3::new(0.0, 0.0, 10.0), 1.0, 0.1, 1.0, 1.0).unwrap();
        assert!(aabb[0] < aabb[2]);
        assert!(aabb[1] < aabb[3]);
        // A centered sphere projects symmetrically around uv 0.5
        assert!((aabb[0] + aabb[2] - 1.0).abs() < 1e-4);
        assert!((aabb[1] + aabb[3] - 1.0).abs() < 1e-4);
    }

    /// CPU model of the two pass protocol: the first pass draws only
    /// previously visible objects after a frustum test, the late pass
    /// draws the previously invisible survivors and rewrites every
    /// visibility bit with this frame's verdict.
    struct TwoPassModel {
        visibility: Vec<u32>,
    }

    impl TwoPassModel {
        fn new(count: usize) -> Self {
            Self {
                visibility: vec![0; count],
            }
        }

        /// Returns (first pass draws, late pass draws)
        fn frame(&mut self, in_frustum: &[bool], unoccluded: &[bool]) -> (usize, usize) {
            let mut first = 0;
            for (i, visible) in self.visibility.iter().enumerate() {
                if *visible == 1 && in_frustum[i] {
                    first += 1;
                }
            }

            let mut late = 0;
            for i in 0..self.visibility.len() {
                let passed = in_frustum[i] && unoccluded[i];
                if self.visibility[i] == 0 && passed {
                    late += 1;
                }
                self.visibility[i] = passed as u32;
            }
            (first, late)
        }
    }

    #[test]
    fn single_object_draws_once_then_moves_to_the_first_pass() {
        let mut model = TwoPassModel::new(1);
        // Nothing was visible last frame, so the late pass draws it
        assert_eq!(model.frame(&[true], &[true]), (0, 1));
        assert_eq!(model.visibility, vec![1]);
        // From now on the first pass owns it and the late pass is quiet
        assert_eq!(model.frame(&[true], &[true]), (1, 0));
        assert_eq!(model.visibility, vec![1]);
    }

    #[test]
    fn occluded_object_stops_being_drawn_after_one_stale_frame() {
        // Object 0 in front, object 1 hidden behind it
        let mut model = TwoPassModel::new(2);

        // First frame has no depth pyramid history: both pass and both
        // get drawn by the late pass
        assert_eq!(model.frame(&[true, true], &[true, true]), (0, 2));
        assert_eq!(model.visibility, vec![1, 1]);

        // The pyramid now knows the occluder; the hidden object is
        // still drawn by the first pass this frame but loses its bit
        assert_eq!(model.frame(&[true, true], &[true, false]), (2, 0));
        assert_eq!(model.visibility, vec![1, 0]);

        // Steady state: only the front object draws
        assert_eq!(model.frame(&[true, true], &[true, false]), (1, 0));
        assert_eq!(model.visibility, vec![1, 0]);
    }

    #[test]
    fn object_outside_the_frustum_is_never_drawn() {
        let mut model = TwoPassModel::new(1);
        for _ in 0..3 {
            assert_eq!(model.frame(&[false], &[true]), (0, 0));
            assert_eq!(model.visibility, vec![0]);
        }
    }

    #[test]
    fn draws_across_both_passes_are_never_duplicated() {
        let mut model = TwoPassModel::new(4);
        let frustum = [true, true, false, true];
        let depth = [true, false, true, true];

        let mut total = 0;
        for _ in 0..4 {
            let (first, late) = model.frame(&frustum, &depth);
            // An object is drawn by at most one pass per frame
            assert!(first + late <= 4);
            total += first + late;
        }
        // Only objects 0 and 3 survive both tests; each draws exactly
        // once per frame, through one pass or the other
        assert_eq!(total, 8);
    }

    #[test]
    fn occlusion_mip_covers_the_footprint() {
        assert_eq!(occlusion_mip(1.0, 1.0), 0);
        assert_eq!(occlusion_mip(2.0, 2.0), 1);
        assert_eq!(occlusion_mip(3.0, 1.0), 2);
        assert_eq!(occlusion_mip(100.0, 640.0), 10);
        // The coarsest tail still issues a 1x1 sample
        assert_eq!(occlusion_mip(0.0, 0.0), 0);
    }
}
