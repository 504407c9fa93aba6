//! Terrain collaborator model.
//!
//! The host engine owns the actual landscape actors, heightmap storage and
//! collision world. This module models the slice of them the scattering
//! system needs: per-component geometry/section info, opaque texture
//! handles for the compute dispatch, and a liveness-checked handle scheme
//! (`Arc` on the host side, `Weak` inside cache entries).

use std::sync::Arc;

use crate::core::types::{IVec2, Mat4, Vec3};
use crate::math::Aabb;

/// Opaque reference to a GPU texture owned by the host (heightmap or
/// weightmap). The compute driver resolves it; this crate never reads it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TextureHandle(pub u64);

/// Stable identity of one landscape surface component. Part of the cache
/// key; must not be reused while any cache may still reference it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentId(pub u64);

/// Stable identity of one terrain (a group of landscape components sharing
/// an origin and draw scale).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TerrainId(pub u64);

/// One named weightmap channel allocation on a landscape component.
#[derive(Clone, Debug)]
pub struct WeightmapLayer {
    pub layer_name: String,
    /// Index into `LandscapeComponent::weightmaps`.
    pub texture_index: usize,
    /// Channel within that texture (0..=3).
    pub channel: u32,
}

/// One landscape surface component: a square patch of `size_quads` quads
/// with its own heightmap region and weightmap allocations.
#[derive(Debug)]
pub struct LandscapeComponent {
    pub id: ComponentId,
    pub name: String,
    /// Section base in quad coordinates, terrain-relative.
    pub section_base: IVec2,
    pub size_quads: i32,
    /// Bounds in component-local space.
    pub local_bounds: Aabb,
    /// Component-local to world.
    pub transform: Mat4,
    pub heightmap: TextureHandle,
    pub weightmaps: Vec<TextureHandle>,
    pub weightmap_layers: Vec<WeightmapLayer>,
}

impl LandscapeComponent {
    /// World-space bounds of this component.
    pub fn world_bounds(&self) -> Aabb {
        self.local_bounds.transformed(&self.transform)
    }

    /// Find the weightmap texture/channel whose layer name contains
    /// `spawn_layer`, case-sensitive, the same way the terrain paint
    /// tooling names layers. When several allocations match, the last
    /// one wins.
    pub fn find_spawn_layer(&self, spawn_layer: &str) -> Option<(TextureHandle, u32)> {
        let mut found = None;
        for layer in &self.weightmap_layers {
            if layer.layer_name.contains(spawn_layer) {
                if let Some(texture) = self.weightmaps.get(layer.texture_index) {
                    found = Some((*texture, layer.channel));
                }
            }
        }
        found
    }
}

/// A terrain: shared origin, scale and section offset plus its surface
/// components. Components are `Arc`-shared so cache entries can hold weak
/// references and detect removal.
#[derive(Debug)]
pub struct Terrain {
    pub id: TerrainId,
    pub name: String,
    pub location: Vec3,
    /// Per-axis world units per quad.
    pub draw_scale: Vec3,
    /// Section offset of this terrain within the world grid.
    pub section_offset: IVec2,
    /// Terrain-to-world with scale removed; foliage components are placed
    /// at this transform so instance data stays in unscaled terrain space.
    pub transform_no_scale: Mat4,
    pub components: Vec<Arc<LandscapeComponent>>,
}

impl Terrain {
    /// Union of all component world bounds. Used for region assignment.
    pub fn world_bounds(&self) -> Aabb {
        let mut out = Aabb::new(Vec3::INFINITY, Vec3::NEG_INFINITY);
        for comp in &self.components {
            out = out.merged(&comp.world_bounds());
        }
        out
    }
}

/// Narrow-phase collision probe against landscape geometry, used by the
/// optional close-landscape check during transform builds. Implemented by
/// the host; expensive, off by default.
pub trait SurfaceProbe: Send + Sync {
    /// Whether a short vertical sweep around `point` hits landscape
    /// geometry.
    fn is_on_landscape(&self, point: Vec3) -> bool;
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_spawn_layer() {
        let comp = test_fixtures::component(
            1,
            "lc_0",
            IVec2::ZERO,
            vec![
                WeightmapLayer {
                    layer_name: "Rock".into(),
                    texture_index: 0,
                    channel: 0,
                },
                WeightmapLayer {
                    layer_name: "GrassMeadow".into(),
                    texture_index: 0,
                    channel: 2,
                },
            ],
        );
        let (tex, channel) = comp.find_spawn_layer("Grass").unwrap();
        assert_eq!(tex, TextureHandle(0));
        assert_eq!(channel, 2);
        assert!(comp.find_spawn_layer("Sand").is_none());
    }

    #[test]
    fn test_find_spawn_layer_last_match_wins() {
        let comp = test_fixtures::component(
            1,
            "lc_0",
            IVec2::ZERO,
            vec![
                WeightmapLayer {
                    layer_name: "GrassA".into(),
                    texture_index: 0,
                    channel: 0,
                },
                WeightmapLayer {
                    layer_name: "GrassB".into(),
                    texture_index: 0,
                    channel: 2,
                },
            ],
        );
        let (_, channel) = comp.find_spawn_layer("Grass").unwrap();
        assert_eq!(channel, 2);
    }

    #[test]
    fn test_world_bounds_offset() {
        let comp = test_fixtures::component(2, "lc_1", IVec2::new(63, 0), vec![]);
        let bounds = comp.world_bounds();
        assert_eq!(bounds.min.x, 63.0);
        assert_eq!(bounds.max.x, 126.0);
    }
}
