//! Foliage component sink.
//!
//! Stand-in for the host engine's hierarchical instanced mesh component:
//! it accepts a prebuilt cluster tree plus instance buffer and holds them
//! for the renderer. The registry plays the host object system's
//! create/destroy role; cache entries hold `Weak` references so a
//! destroyed component reads as dead, never dangling.

use std::sync::{Arc, Mutex};

use log::trace;

use crate::core::types::Mat4;
use crate::instance::{ClusterNode, InstanceBuffer};
use crate::variety::MeshAsset;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FoliageId(pub u64);

/// A finished render batch: sorted instances plus the matching tree.
#[derive(Clone, Debug)]
pub struct RenderBatch {
    pub instance_buffer: InstanceBuffer,
    pub cluster_tree: Vec<ClusterNode>,
    pub occlusion_layer_count: u32,
    pub instance_count: u32,
    /// Per-instance transforms kept for components with collision, in the
    /// same order as the instance buffer. Empty otherwise.
    pub collision_transforms: Vec<Mat4>,
}

/// One instanced-mesh rendering component. Shared as `Arc`; the batch is
/// behind a mutex because the apply step runs on the orchestration
/// context while the renderer reads from wherever the host drives it.
#[derive(Debug)]
pub struct FoliageComponent {
    pub id: FoliageId,
    pub mesh: Option<Arc<MeshAsset>>,
    pub enable_collision: bool,
    /// Component-to-world; instance transforms are relative to this.
    pub transform: Mat4,
    batch: Mutex<Option<RenderBatch>>,
}

impl FoliageComponent {
    /// Install a prebuilt tree and instance buffer, replacing any
    /// previous batch.
    pub fn accept_prebuilt_tree(&self, batch: RenderBatch) {
        trace!(
            "foliage {} accepted batch: {} instances, {} nodes",
            self.id.0,
            batch.instance_count,
            batch.cluster_tree.len()
        );
        *self.batch.lock().unwrap() = Some(batch);
    }

    pub fn instance_count(&self) -> u32 {
        self.batch
            .lock()
            .unwrap()
            .as_ref()
            .map_or(0, |b| b.instance_count)
    }

    pub fn with_batch<R>(&self, f: impl FnOnce(Option<&RenderBatch>) -> R) -> R {
        f(self.batch.lock().unwrap().as_ref())
    }
}

/// Owns the live foliage components for one terrain builder.
#[derive(Debug, Default)]
pub struct FoliageRegistry {
    next_id: u64,
    components: Vec<Arc<FoliageComponent>>,
}

impl FoliageRegistry {
    pub fn create(
        &mut self,
        mesh: Option<Arc<MeshAsset>>,
        enable_collision: bool,
        transform: Mat4,
    ) -> Arc<FoliageComponent> {
        let id = FoliageId(self.next_id);
        self.next_id += 1;
        let comp = Arc::new(FoliageComponent {
            id,
            mesh,
            enable_collision,
            transform,
            batch: Mutex::new(None),
        });
        self.components.push(comp.clone());
        comp
    }

    pub fn get(&self, id: FoliageId) -> Option<&Arc<FoliageComponent>> {
        self.components.iter().find(|c| c.id == id)
    }

    /// Drop the registry's ownership of one component. Outstanding weak
    /// references die with the last `Arc`.
    pub fn destroy(&mut self, id: FoliageId) -> bool {
        if let Some(pos) = self.components.iter().position(|c| c.id == id) {
            trace!("destroying foliage component {}", id.0);
            self.components.swap_remove(pos);
            true
        } else {
            false
        }
    }

    pub fn destroy_all(&mut self) {
        self.components.clear();
    }

    pub fn ids(&self) -> impl Iterator<Item = FoliageId> + '_ {
        self.components.iter().map(|c| c.id)
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }
}
