//! Per-species placement configuration.
//!
//! A [`GrassVariety`] describes how one species is scattered: density,
//! sampling pattern, cull distances, scale/rotation/alignment rules and
//! the optional Voronoi modulation. Varieties are grouped into a
//! [`ScatterKind`], the unit assigned to terrains. All of it is immutable
//! while placement runs.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::types::Vec3;
use crate::math::Aabb;

/// Closed float range with unclamped interpolation.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct FloatInterval {
    pub min: f32,
    pub max: f32,
}

impl FloatInterval {
    pub const fn new(min: f32, max: f32) -> Self {
        Self { min, max }
    }

    pub fn size(&self) -> f32 {
        self.max - self.min
    }

    /// Linear interpolation; `alpha` is not clamped, callers rely on
    /// overshoot for the Voronoi narrowing rule.
    pub fn lerp(&self, alpha: f32) -> f32 {
        self.min + self.size() * alpha
    }
}

/// How per-instance scale is randomized across the three axes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum GrassScaling {
    /// One random scale applied to X, Y and Z.
    #[default]
    Uniform,
    /// Independent random scale per axis.
    Free,
    /// X and Y share one random scale, Z gets another.
    LockXy,
}

/// The mesh rendered for a variety. The actual asset lives in the host
/// engine; this carries what the cluster build and culling need.
#[derive(Clone, Debug)]
pub struct MeshAsset {
    pub name: String,
    /// Mesh-local bounds, expanded per instance when building leaves.
    pub bounds: Aabb,
    /// Target leaf size for the cluster tree built over instances.
    pub desired_instances_per_leaf: u32,
}

impl MeshAsset {
    pub fn new(name: &str, bounds: Aabb) -> Self {
        Self {
            name: name.to_string(),
            bounds,
            desired_instances_per_leaf: 256,
        }
    }
}

/// Static per-species placement parameters. Distances and offsets are in
/// world centimeters, density is instances per 10 square meters.
#[derive(Clone, Debug)]
pub struct GrassVariety {
    pub mesh: Option<Arc<MeshAsset>>,
    pub density: f32,
    /// Jittered grid sampling when true, halton sequence otherwise.
    pub use_grid: bool,
    /// 0..=1 jitter amount for grid sampling.
    pub placement_jitter: f32,
    /// Fade-in start distance; 0 disables fading.
    pub start_cull_distance: i32,
    /// Distance at which instances are fully culled; 0 disables the variety.
    pub end_cull_distance: i32,
    pub scaling: GrassScaling,
    pub scale_x: FloatInterval,
    pub scale_y: FloatInterval,
    pub scale_z: FloatInterval,
    /// Accepted surface slope in degrees, evaluated on the GPU.
    pub slope: FloatInterval,
    /// Accepted world height band, evaluated on the GPU.
    pub height: FloatInterval,
    pub height_falloff_range: f32,
    /// Vertical offset range applied along the instance up axis.
    pub z_offset: FloatInterval,
    pub use_voronoi_noise: bool,
    /// Noise values above `max` narrow the scale ranges instead of
    /// rejecting the sample.
    pub voronoi_valid_range: FloatInterval,
    pub voronoi_scale: f32,
    pub voronoi_group_size: f32,
    pub align_to_surface: bool,
    /// Max tilt away from vertical when aligning, degrees. 0 = unclamped.
    pub align_max_angle: f32,
    pub random_rotation: bool,
    pub rotation_axis: Vec3,
    /// Probe the collision world and drop samples not resting on
    /// landscape geometry. Expensive, off by default.
    pub check_close_landscape: bool,
    /// Foliage components for this variety carry collision.
    pub enable_collision: bool,
}

impl Default for GrassVariety {
    fn default() -> Self {
        Self {
            mesh: None,
            density: 400.0,
            use_grid: true,
            placement_jitter: 1.0,
            start_cull_distance: 10000,
            end_cull_distance: 10000,
            scaling: GrassScaling::Uniform,
            scale_x: FloatInterval::new(1.0, 1.0),
            scale_y: FloatInterval::new(1.0, 1.0),
            scale_z: FloatInterval::new(1.0, 1.0),
            slope: FloatInterval::new(0.0, 90.0),
            height: FloatInterval::new(-1_000_000.0, 1_000_000.0),
            height_falloff_range: 1000.0,
            z_offset: FloatInterval::new(0.0, 0.0),
            use_voronoi_noise: false,
            voronoi_valid_range: FloatInterval::new(0.0, 1.0),
            voronoi_scale: 10.0,
            voronoi_group_size: 8192.0,
            align_to_surface: true,
            align_max_angle: 0.0,
            random_rotation: true,
            rotation_axis: Vec3::new(0.0, 1.0, 0.0),
            check_close_landscape: false,
            enable_collision: false,
        }
    }
}

impl GrassVariety {
    /// Whether this variety produces any instances at all. Disabled
    /// varieties are skipped during dispatch building, never an error.
    pub fn is_active(&self) -> bool {
        self.mesh.is_some() && self.density > 0.0 && self.end_cull_distance > 0
    }
}

/// A scattering-type asset: an ordered set of varieties plus the optional
/// weightmap layer that gates where they spawn.
#[derive(Clone, Debug, Default)]
pub struct ScatterKind {
    pub enabled: bool,
    /// When set, instances only spawn where a weightmap layer whose name
    /// contains this string has weight.
    pub spawn_layer: Option<String>,
    pub varieties: Vec<GrassVariety>,
}

impl ScatterKind {
    pub fn new(varieties: Vec<GrassVariety>) -> Self {
        Self {
            enabled: true,
            spawn_layer: None,
            varieties,
        }
    }
}
