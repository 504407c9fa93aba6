//! CPU transform building.
//!
//! Converts one cell's raw placement records into world-space instance
//! transforms, builds the cluster tree over them and physically reorders
//! both arrays to the tree's permutation. Each record derives its own
//! random stream from its centimeter-rounded position, so rebuilding the
//! same cell places identical jitter and the per-record loop can run in
//! parallel without ordering effects.

use std::sync::Weak;

use log::trace;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;

use crate::builder::cluster::{self, ClusterTreeBuild};
use crate::builder::BuilderOutput;
use crate::cache::GrassCompKey;
use crate::core::types::{Mat4, Quat, Vec3};
use crate::foliage::FoliageComponent;
use crate::instance::{apply_reorder, InstanceBuffer};
use crate::landscape::SurfaceProbe;
use crate::variety::{FloatInterval, GrassScaling, GrassVariety};

/// Deterministic seed for a placement position, centimeter precision.
pub fn position_seed(x: f32, y: f32) -> u64 {
    let x_cm = x.round() as i64;
    let y_cm = y.round() as i64;
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&x_cm.to_le_bytes());
    hasher.update(&y_cm.to_le_bytes());
    hasher.finalize() as u64
}

/// Whether any scale interval actually varies for this variety's mode.
pub fn random_scale_enabled(variety: &GrassVariety) -> bool {
    match variety.scaling {
        GrassScaling::Uniform => variety.scale_x.size() > 0.0,
        GrassScaling::Free => {
            variety.scale_x.size() > 0.0
                || variety.scale_y.size() > 0.0
                || variety.scale_z.size() > 0.0
        }
        GrassScaling::LockXy => variety.scale_x.size() > 0.0 || variety.scale_z.size() > 0.0,
    }
}

/// Scale used when no interval varies: each axis takes its fixed minimum
/// if positive, else 1, collapsed per the scaling mode.
pub fn default_scale(variety: &GrassVariety) -> Vec3 {
    let fixed = |iv: FloatInterval| {
        if iv.min > 0.0 && iv.size().abs() < 1e-6 {
            iv.min
        } else {
            1.0
        }
    };
    let mut scale = Vec3::new(
        fixed(variety.scale_x),
        fixed(variety.scale_y),
        fixed(variety.scale_z),
    );
    match variety.scaling {
        GrassScaling::Uniform => {
            scale.y = scale.x;
            scale.z = scale.x;
        }
        GrassScaling::Free => {}
        GrassScaling::LockXy => scale.y = scale.x,
    }
    scale
}

/// Randomized scale for one instance. `alpha` is the GPU-computed scale
/// seed; above the Voronoi validity threshold it flips to `1 - alpha`
/// and narrows the ranges so out-of-band noise shrinks instances instead
/// of rejecting them.
pub fn random_scale(variety: &GrassVariety, rng: &mut ChaCha8Rng, alpha: f32) -> Vec3 {
    let mut new_alpha = alpha;
    let mut range_x = variety.scale_x;
    let mut range_y = variety.scale_y;
    let mut range_z = variety.scale_z;

    if variety.use_voronoi_noise && alpha > variety.voronoi_valid_range.max {
        new_alpha = 1.0 - alpha;
        range_x.min = (range_x.min * new_alpha).max(1.0);
        range_y.min = (range_y.min * new_alpha).max(1.0);
        range_z.min = (range_z.min * new_alpha).max(0.5);
    }

    let interp_alpha = new_alpha + rng.gen_range(0.0f32..1.0);
    match variety.scaling {
        GrassScaling::Uniform => {
            let x = range_x.lerp(interp_alpha);
            Vec3::splat(x)
        }
        GrassScaling::Free => Vec3::new(
            range_x.lerp(interp_alpha),
            range_y.lerp(interp_alpha),
            range_z.lerp(interp_alpha),
        ),
        GrassScaling::LockXy => {
            let x = range_x.lerp(interp_alpha);
            Vec3::new(x, x, range_z.lerp(interp_alpha))
        }
    }
}

/// Rotation aligning the mesh's up axis to the surface normal, with the
/// tilt from vertical clamped to `align_max_angle` whole degrees when
/// positive.
pub fn align_to_normal(normal: Vec3, align_max_angle: f32) -> Mat4 {
    // Normals always point away from the underside.
    let up = normal * normal.z.signum();
    let up = up.normalize_or_zero();
    if up == Vec3::ZERO {
        return Mat4::IDENTITY;
    }
    let mut angle = Vec3::Z.angle_between(up);
    if align_max_angle > 0.0 {
        let max = (align_max_angle as i32 as f32).to_radians();
        angle = angle.min(max);
    }
    let axis = Vec3::Z.cross(up);
    if axis.length_squared() < 1e-12 {
        return Mat4::IDENTITY;
    }
    Mat4::from_quat(Quat::from_axis_angle(axis.normalize(), angle))
}

fn rotation_quat(variety: &GrassVariety, fraction: f32) -> Quat {
    let degrees = if variety.random_rotation {
        fraction * 180.0
    } else {
        0.0
    };
    let rot = variety.rotation_axis * degrees;
    // Axis components select pitch (y), yaw (z) and roll (x) shares.
    Quat::from_rotation_z(rot.y.to_radians())
        * Quat::from_rotation_y(rot.x.to_radians())
        * Quat::from_rotation_x(rot.z.to_radians())
}

/// Output of one cell's transform build. Empty when the build aborted
/// early (dead foliage reference or missing mesh); the cell still counts
/// as done so the orchestrator can retire it.
#[derive(Debug)]
pub struct TransformBuild {
    pub key: GrassCompKey,
    pub foliage: Weak<FoliageComponent>,
    pub transforms: Vec<Mat4>,
    pub instance_buffer: InstanceBuffer,
    pub tree: ClusterTreeBuild,
}

impl TransformBuild {
    fn empty(key: GrassCompKey, foliage: Weak<FoliageComponent>) -> Self {
        Self {
            key,
            foliage,
            transforms: Vec::new(),
            instance_buffer: InstanceBuffer::default(),
            tree: ClusterTreeBuild::default(),
        }
    }

    pub fn instance_count(&self) -> usize {
        self.instance_buffer.len()
    }
}

/// Build instance transforms, the cluster tree and the sorted instance
/// buffer for one completed readback.
pub fn build(output: &BuilderOutput, probe: Option<&dyn SurfaceProbe>) -> TransformBuild {
    let Some(foliage) = output.foliage.upgrade() else {
        return TransformBuild::empty(output.key, output.foliage.clone());
    };
    let Some(mesh) = foliage.mesh.clone() else {
        return TransformBuild::empty(output.key, output.foliage.clone());
    };

    let variety = &output.variety;
    let default = default_scale(variety);
    let check_landscape = variety.check_close_landscape && probe.is_some();

    let built: Vec<(Mat4, f32)> = output
        .records
        .par_iter()
        .filter_map(|record| {
            let mut location = record.position_vec();
            let mut rng = ChaCha8Rng::seed_from_u64(position_seed(location.x, location.y));

            let scale = if output.random_scale {
                random_scale(variety, &mut rng, record.scale_seed)
            } else {
                default
            };
            let offset_z = variety.z_offset.lerp(rng.gen_range(0.0f32..1.0));
            let rotation = rotation_quat(variety, rng.gen_range(0.0f32..1.0));
            let random_id: f32 = rng.gen_range(0.0f32..1.0);

            if check_landscape {
                let world = output.xform.transform_point3(location);
                if !probe.unwrap().is_on_landscape(world) {
                    return None;
                }
            }

            let base = Mat4::from_scale_rotation_translation(scale, rotation, Vec3::ZERO);
            let normal = record.normal_vec();
            let oriented = if variety.align_to_surface && normal.length_squared() > 1e-8 {
                align_to_normal(normal, variety.align_max_angle) * base
            } else {
                base
            };
            let axis_z = oriented.z_axis.truncate().normalize_or_zero();
            location += axis_z * (offset_z * scale.z);
            let out = output.xform * Mat4::from_translation(location) * oriented;
            Some((out, random_id))
        })
        .collect();

    if built.is_empty() {
        return TransformBuild::empty(output.key, output.foliage.clone());
    }

    let mut transforms: Vec<Mat4> = built.iter().map(|(m, _)| *m).collect();
    let mut instance_buffer = InstanceBuffer::with_capacity(built.len());
    for (transform, random_id) in &built {
        instance_buffer.push(transform, *random_id);
    }

    let mut tree = cluster::build_tree(
        &transforms,
        &mesh.bounds,
        mesh.desired_instances_per_leaf,
    );
    apply_reorder(
        &mut tree.sorted_instances,
        &mut tree.reorder_table,
        &mut transforms,
        &mut instance_buffer,
    );

    trace!(
        "transform build: {} instances, {} tree nodes",
        transforms.len(),
        tree.nodes.len()
    );
    TransformBuild {
        key: output.key,
        foliage: output.foliage.clone(),
        transforms,
        instance_buffer,
        tree,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::core::types::IVec2;
    use crate::instance::PlacementRecord;
    use crate::landscape::{test_fixtures, ComponentId};
    use crate::math::Aabb;
    use crate::variety::MeshAsset;

    fn test_variety() -> GrassVariety {
        let mut v = GrassVariety::default();
        v.mesh = Some(Arc::new(MeshAsset::new(
            "blade",
            Aabb::new(Vec3::splat(-5.0), Vec3::splat(5.0)),
        )));
        v
    }

    fn test_output(
        records: Vec<PlacementRecord>,
    ) -> (
        BuilderOutput,
        crate::foliage::FoliageRegistry,
        Arc<crate::landscape::LandscapeComponent>,
    ) {
        let variety = Arc::new(test_variety());
        let mut registry = crate::foliage::FoliageRegistry::default();
        let foliage = registry.create(variety.mesh.clone(), false, Mat4::IDENTITY);
        let landscape = test_fixtures::component(1, "lc", IVec2::ZERO, vec![]);
        let output = BuilderOutput {
            key: GrassCompKey {
                component: ComponentId(1),
                sqrt_subsections: 1,
                max_instances_per_component: 65536,
                sub_x: 0,
                sub_y: 0,
                num_varieties: 1,
                variety_index: 0,
            },
            landscape: Arc::downgrade(&landscape),
            foliage: Arc::downgrade(&foliage),
            xform: Mat4::IDENTITY,
            random_scale: random_scale_enabled(&variety),
            variety,
            records,
        };
        (output, registry, landscape)
    }

    fn records(n: u32) -> Vec<PlacementRecord> {
        (0..n)
            .map(|i| PlacementRecord {
                position: [(i % 16) as f32 * 50.0, (i / 16) as f32 * 50.0, 10.0],
                normal: [0.0, 0.0, 1.0],
                scale_seed: (i as f32 * 0.13).fract(),
            })
            .collect()
    }

    #[test]
    fn test_position_seed_deterministic() {
        assert_eq!(position_seed(10.4, -3.2), position_seed(10.4, -3.2));
        // Sub-centimeter differences round to the same seed.
        assert_eq!(position_seed(10.4, -3.2), position_seed(10.1, -3.4));
        assert_ne!(position_seed(10.4, -3.2), position_seed(11.0, -3.2));
    }

    #[test]
    fn test_default_scale_modes() {
        let mut v = GrassVariety::default();
        v.scale_x = FloatInterval::new(2.0, 2.0);
        v.scale_z = FloatInterval::new(3.0, 3.0);
        v.scaling = GrassScaling::Uniform;
        assert_eq!(default_scale(&v), Vec3::splat(2.0));
        v.scaling = GrassScaling::LockXy;
        assert_eq!(default_scale(&v), Vec3::new(2.0, 2.0, 3.0));
        v.scaling = GrassScaling::Free;
        assert_eq!(default_scale(&v), Vec3::new(2.0, 1.0, 3.0));
    }

    #[test]
    fn test_voronoi_narrowing_floors_minimums() {
        let mut v = GrassVariety::default();
        v.use_voronoi_noise = true;
        v.voronoi_valid_range = FloatInterval::new(0.0, 0.6);
        v.scaling = GrassScaling::LockXy;
        v.scale_x = FloatInterval::new(0.4, 0.4);
        v.scale_z = FloatInterval::new(0.2, 0.2);

        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let fraction: f32 = rng.clone().gen_range(0.0f32..1.0);
        // alpha 0.9 exceeds the valid range: it flips to 0.1 and the
        // interval minimums floor to 1.0 (XY) and 0.5 (Z).
        let scale = random_scale(&v, &mut rng, 0.9);
        let interp = 0.1 + fraction;
        assert!((scale.x - (1.0 + (0.4 - 1.0) * interp)).abs() < 1e-5);
        assert_eq!(scale.y, scale.x);
        assert!((scale.z - (0.5 + (0.2 - 0.5) * interp)).abs() < 1e-5);
    }

    #[test]
    fn test_align_clamps_tilt() {
        let steep = Vec3::new(1.0, 0.0, 1.0).normalize();
        let unclamped = align_to_normal(steep, 0.0);
        let tilted_z = unclamped.z_axis.truncate();
        assert!((Vec3::Z.angle_between(tilted_z).to_degrees() - 45.0).abs() < 0.1);

        let clamped = align_to_normal(steep, 10.0);
        let clamped_z = clamped.z_axis.truncate();
        assert!(Vec3::Z.angle_between(clamped_z).to_degrees() <= 10.01);
    }

    #[test]
    fn test_build_is_deterministic() {
        let (output, _registry, _landscape) = test_output(records(64));
        let a = build(&output, None);
        let b = build(&output, None);
        assert_eq!(a.transforms, b.transforms);
        assert_eq!(a.instance_buffer.instances(), b.instance_buffer.instances());
    }

    #[test]
    fn test_build_aborts_on_dead_foliage() {
        let (output, mut registry, _landscape) = test_output(records(8));
        let id = registry.ids().next().unwrap();
        registry.destroy(id);
        let built = build(&output, None);
        assert_eq!(built.instance_count(), 0);
        assert!(built.tree.nodes.is_empty());
    }

    #[test]
    fn test_build_orders_buffer_to_tree() {
        let (output, _registry, _landscape) = test_output(records(100));
        let built = build(&output, None);
        assert_eq!(built.instance_count(), 100);
        assert!(!built.tree.nodes.is_empty());
        // After the reorder both permutation tables are identity.
        assert!(built
            .tree
            .sorted_instances
            .iter()
            .enumerate()
            .all(|(i, &v)| v == i as i32));
        // Root covers every instance.
        let root = &built.tree.nodes[0];
        assert_eq!(root.first_instance, 0);
        assert_eq!(root.last_instance, 99);
    }

    struct RejectAll;
    impl SurfaceProbe for RejectAll {
        fn is_on_landscape(&self, _point: Vec3) -> bool {
            false
        }
    }

    #[test]
    fn test_close_landscape_probe_filters() {
        let (mut output, _registry, _landscape) = test_output(records(8));
        let mut variety = (*output.variety).clone();
        variety.check_close_landscape = true;
        output.variety = Arc::new(variety);
        let built = build(&output, Some(&RejectAll));
        assert_eq!(built.instance_count(), 0);
    }
}
