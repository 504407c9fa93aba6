//! Axis-aligned bounding box

use crate::core::types::{Mat4, Vec3};

/// Axis-aligned bounding box defined by min and max corners
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    /// Create AABB from min and max corners
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// Get center point
    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    /// Get size (max - min)
    pub fn size(&self) -> Vec3 {
        self.max - self.min
    }

    /// Check if two AABBs overlap when projected onto the XY plane
    pub fn intersects_xy(&self, other: &Aabb) -> bool {
        self.min.x <= other.max.x && self.max.x >= other.min.x &&
        self.min.y <= other.max.y && self.max.y >= other.min.y
    }

    /// Expand AABB to include point
    pub fn expand(&mut self, point: Vec3) {
        self.min = self.min.min(point);
        self.max = self.max.max(point);
    }

    /// Return merged AABB containing both
    pub fn merged(&self, other: &Aabb) -> Aabb {
        Aabb {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    /// Squared distance from the box to a point; zero when the point is
    /// inside the box. Used for camera distance culling.
    pub fn distance_squared_to_point(&self, p: Vec3) -> f32 {
        let clamped = p.clamp(self.min, self.max);
        (p - clamped).length_squared()
    }

    /// Transform all eight corners and return the enclosing AABB
    pub fn transformed(&self, m: &Mat4) -> Aabb {
        let mut out = Aabb::new(Vec3::INFINITY, Vec3::NEG_INFINITY);
        for i in 0..8 {
            let corner = Vec3::new(
                if i & 1 != 0 { self.max.x } else { self.min.x },
                if i & 2 != 0 { self.max.y } else { self.min.y },
                if i & 4 != 0 { self.max.z } else { self.min.z },
            );
            out.expand(m.transform_point3(corner));
        }
        out
    }
}
