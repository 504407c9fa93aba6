//! Spatial cache of placement cells.
//!
//! Each entry maps one (landscape component, subsection, variety) cell to
//! its foliage component, its persistent GPU buffer triple and its usage
//! stamps. Eviction runs once per tick and reclaims entries whose
//! collaborators died or that have gone unused past both the frame and
//! time thresholds; the joint check keeps reduced-interval ticking from
//! evicting entries that are merely updated less often.

use std::collections::{HashMap, HashSet};
use std::sync::Weak;

use log::debug;

use crate::core::config::ScatterConfig;
use crate::foliage::{FoliageComponent, FoliageId};
use crate::gpu::dispatch::ScatterBuffers;
use crate::landscape::{ComponentId, LandscapeComponent};

/// Composite identity of one placement cell. Stable across frames while
/// the landscape structure, subsection grid and variety list are
/// unchanged; any field differing yields a distinct cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GrassCompKey {
    pub component: ComponentId,
    pub sqrt_subsections: i32,
    pub max_instances_per_component: i32,
    pub sub_x: i32,
    pub sub_y: i32,
    pub num_varieties: i32,
    pub variety_index: i32,
}

/// One cached cell.
#[derive(Debug)]
pub struct GrassComp {
    pub key: GrassCompKey,
    pub landscape: Weak<LandscapeComponent>,
    pub foliage: Weak<FoliageComponent>,
    pub foliage_id: FoliageId,
    /// Allocated on the first dispatch, reused across redispatches.
    pub buffers: Option<ScatterBuffers>,
    pub last_used_frame: u32,
    pub last_used_time: f64,
    /// True while a dispatch or build for this cell is outstanding.
    /// Pending entries are never evicted.
    pub pending: bool,
}

impl GrassComp {
    pub fn new(
        key: GrassCompKey,
        landscape: Weak<LandscapeComponent>,
        foliage: Weak<FoliageComponent>,
        foliage_id: FoliageId,
        frame: u32,
        now: f64,
    ) -> Self {
        Self {
            key,
            landscape,
            foliage,
            foliage_id,
            buffers: None,
            last_used_frame: frame,
            last_used_time: now,
            pending: true,
        }
    }

    pub fn touch(&mut self, frame: u32, now: f64) {
        self.last_used_frame = frame;
        self.last_used_time = now;
    }

    fn is_stale(&self, oldest_keep_frame: u32, oldest_keep_time: f64) -> bool {
        if self.pending {
            return false;
        }
        self.landscape.strong_count() == 0
            || self.foliage.strong_count() == 0
            || (self.last_used_frame < oldest_keep_frame && self.last_used_time < oldest_keep_time)
    }
}

#[derive(Debug, Default)]
pub struct GrassCache {
    entries: HashMap<GrassCompKey, GrassComp>,
}

impl GrassCache {
    pub fn get_mut(&mut self, key: &GrassCompKey) -> Option<&mut GrassComp> {
        self.entries.get_mut(key)
    }

    pub fn contains(&self, key: &GrassCompKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn insert(&mut self, entry: GrassComp) {
        self.entries.insert(entry.key, entry);
    }

    pub fn touch(&mut self, key: &GrassCompKey, frame: u32, now: f64) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.touch(frame, now);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &GrassComp> {
        self.entries.values()
    }

    /// Remove stale entries, dropping their buffer triples. Returns the
    /// number evicted. Stale means not pending and either a dead
    /// landscape or foliage reference, or both usage stamps older than
    /// the keep thresholds.
    pub fn evict_stale(&mut self, frame: u32, now: f64, config: &ScatterConfig) -> usize {
        let keep_frames =
            (config.min_time_to_keep_seconds * config.update_interval.max(1) as f32) as u32;
        let oldest_keep_frame = frame.saturating_sub(keep_frames);
        let oldest_keep_time = now - config.min_time_to_keep_seconds as f64;

        let before = self.entries.len();
        self.entries
            .retain(|_, entry| !entry.is_stale(oldest_keep_frame, oldest_keep_time));
        let evicted = before - self.entries.len();
        if evicted > 0 {
            debug!("evicted {evicted} stale grass cells ({} remain)", self.entries.len());
        }
        evicted
    }

    /// Foliage components still referenced by a live cache entry. Anything
    /// the registry owns beyond this set is unowned and may be destroyed.
    pub fn used_foliage(&self) -> HashSet<FoliageId> {
        self.entries
            .values()
            .filter(|e| e.foliage.strong_count() > 0)
            .map(|e| e.foliage_id)
            .collect()
    }

    /// Drop every entry and with them all cached buffer handles.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    use std::sync::Arc;

    use super::*;
    use crate::core::types::{IVec2, Mat4};
    use crate::foliage::FoliageRegistry;
    use crate::landscape::test_fixtures;

    fn key(sub_x: i32, variety_index: i32) -> GrassCompKey {
        GrassCompKey {
            component: ComponentId(1),
            sqrt_subsections: 2,
            max_instances_per_component: 65536,
            sub_x,
            sub_y: 0,
            num_varieties: 3,
            variety_index,
        }
    }

    fn hash_of(key: &GrassCompKey) -> u64 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn test_key_equality_and_hash() {
        let a = key(1, 2);
        let b = key(1, 2);
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));

        let variants = [
            GrassCompKey { component: ComponentId(9), ..a },
            GrassCompKey { sqrt_subsections: 4, ..a },
            GrassCompKey { max_instances_per_component: 1024, ..a },
            GrassCompKey { sub_x: 0, ..a },
            GrassCompKey { sub_y: 1, ..a },
            GrassCompKey { num_varieties: 4, ..a },
            GrassCompKey { variety_index: 0, ..a },
        ];
        for other in variants {
            assert_ne!(a, other);
        }
    }

    #[test]
    fn test_eviction_thresholds() {
        let mut config = ScatterConfig::default();
        config.min_time_to_keep_seconds = 5.0;
        config.update_interval = 1;

        let landscape = test_fixtures::component(1, "lc", IVec2::ZERO, vec![]);
        let mut registry = FoliageRegistry::default();
        let foliage = registry.create(None, false, Mat4::IDENTITY);

        let mut cache = GrassCache::default();
        let mut entry = GrassComp::new(
            key(0, 0),
            Arc::downgrade(&landscape),
            Arc::downgrade(&foliage),
            foliage.id,
            100,
            100.0,
        );
        entry.pending = false;
        cache.insert(entry);

        // Frame-old but not time-old: retained.
        assert_eq!(cache.evict_stale(200, 104.0, &config), 0);
        // Time-old but not frame-old: retained.
        assert_eq!(cache.evict_stale(103, 200.0, &config), 0);
        // Both thresholds exceeded: evicted.
        assert_eq!(cache.evict_stale(200, 200.0, &config), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_pending_never_evicted() {
        let config = ScatterConfig::default();
        let landscape = test_fixtures::component(1, "lc", IVec2::ZERO, vec![]);
        let mut cache = GrassCache::default();
        // Dead foliage weak reference, but pending.
        let entry = GrassComp::new(
            key(0, 0),
            Arc::downgrade(&landscape),
            Weak::new(),
            FoliageId(0),
            0,
            0.0,
        );
        cache.insert(entry);
        assert_eq!(cache.evict_stale(10_000, 10_000.0, &config), 0);
        cache.get_mut(&key(0, 0)).unwrap().pending = false;
        assert_eq!(cache.evict_stale(10_000, 10_000.0, &config), 1);
    }

    #[test]
    fn test_dead_landscape_evicts_immediately() {
        let config = ScatterConfig::default();
        let mut registry = FoliageRegistry::default();
        let foliage = registry.create(None, false, Mat4::IDENTITY);
        let mut cache = GrassCache::default();
        let landscape_weak = {
            let landscape = test_fixtures::component(1, "lc", IVec2::ZERO, vec![]);
            Arc::downgrade(&landscape)
        };
        let mut entry = GrassComp::new(
            key(0, 0),
            landscape_weak,
            Arc::downgrade(&foliage),
            foliage.id,
            u32::MAX,
            f64::MAX,
        );
        entry.pending = false;
        cache.insert(entry);
        // Stamps are fresh; the dead landscape alone triggers eviction.
        assert_eq!(cache.evict_stale(0, 0.0, &config), 1);
    }

    #[test]
    fn test_used_foliage_set() {
        let landscape = test_fixtures::component(1, "lc", IVec2::ZERO, vec![]);
        let mut registry = FoliageRegistry::default();
        let keep = registry.create(None, false, Mat4::IDENTITY);
        let gone = registry.create(None, false, Mat4::IDENTITY);
        let gone_id = gone.id;

        let mut cache = GrassCache::default();
        cache.insert(GrassComp::new(
            key(0, 0),
            Arc::downgrade(&landscape),
            Arc::downgrade(&keep),
            keep.id,
            0,
            0.0,
        ));
        cache.insert(GrassComp::new(
            key(1, 0),
            Arc::downgrade(&landscape),
            Arc::downgrade(&gone),
            gone_id,
            0,
            0.0,
        ));
        drop(gone);
        registry.destroy(gone_id);

        let used = cache.used_foliage();
        assert!(used.contains(&keep.id));
        assert!(!used.contains(&gone_id));
    }
}
