//! Per-terrain scatter orchestration.
//!
//! A [`ScatterBuilder`] owns one terrain's placement state: the cell
//! cache, the foliage components it has created and the worker pool
//! finishing transforms. Each update it walks the terrain's landscape
//! components nearest-first, creates missing cells under a shared budget,
//! submits their compute dispatches and later applies finished builds,
//! at most one per tick so a burst of results never hitches a frame.

pub mod cluster;
pub mod transform;
pub mod worker;

use std::sync::{Arc, Weak};

use log::debug;

use crate::cache::{GrassCache, GrassComp, GrassCompKey};
use crate::core::config::ScatterConfig;
use crate::core::types::{Mat4, Result, Vec3};
use crate::foliage::{FoliageComponent, FoliageRegistry, RenderBatch};
use crate::gpu::dispatch::{
    DispatchVariant, ScatterBuffers, ScatterDispatch, ScatterInput, ScatterParams,
};
use crate::gpu::readback::{Readback, ReadbackManager};
use crate::gpu::ScatterDriver;
use crate::instance::PlacementRecord;
use crate::landscape::{LandscapeComponent, SurfaceProbe, Terrain};
use crate::math::Aabb;
use crate::builder::transform::TransformBuild;
use crate::builder::worker::BuildWorker;
use crate::variety::{GrassVariety, ScatterKind};

/// Everything a transform build needs from the dispatch that produced
/// it. Travels through the readback manager, which fills `records`, and
/// then to the worker pool.
#[derive(Clone, Debug)]
pub struct BuilderOutput {
    pub key: GrassCompKey,
    pub landscape: Weak<LandscapeComponent>,
    pub foliage: Weak<FoliageComponent>,
    /// Terrain space to foliage component space.
    pub xform: Mat4,
    pub variety: Arc<GrassVariety>,
    /// Whether any scale interval varies; fixed-scale varieties skip the
    /// per-instance scale draw.
    pub random_scale: bool,
    pub records: Vec<PlacementRecord>,
}

/// Deterministic per-cell seed fed to the compute pass, derived the same
/// way the host names cells. Never zero.
pub fn variety_seed(component_name: &str, sub_x: i32, sub_y: i32, variety_index: i32) -> i32 {
    let text = format!(
        "{}{} {} {}",
        component_name.to_lowercase(),
        sub_x,
        sub_y,
        variety_index
    );
    let seed = crc32fast::hash(text.as_bytes()) as i32;
    if seed == 0 { 1 } else { seed }
}

/// Draw-scaled origin/extent of one subsection cell plus its sample grid
/// resolution.
struct SubsectionMath {
    origin: [f32; 2],
    extent: [f32; 2],
    sqrt_max_instances: i32,
}

impl SubsectionMath {
    fn new(
        terrain: &Terrain,
        component: &LandscapeComponent,
        density: f32,
        sqrt_subsections: i32,
        sub_x: i32,
        sub_y: i32,
    ) -> Self {
        let scale = terrain.draw_scale;
        let mut origin = [
            scale.x * component.section_base.x as f32,
            scale.y * component.section_base.y as f32,
        ];
        let mut extent = [
            scale.x * component.size_quads as f32,
            scale.y * component.size_quads as f32,
        ];
        // Density is instances per 10 square meters of
        // draw-scaled surface.
        let mut sqrt_max_instances =
            (extent[0] * extent[1] * density / 1_000_000.0).abs().sqrt().ceil() as i32;

        if sqrt_max_instances != 0 && sqrt_subsections != 1 {
            debug_assert!(sqrt_max_instances > 2 * sqrt_subsections);
            sqrt_max_instances /= sqrt_subsections;
            extent[0] /= sqrt_subsections as f32;
            extent[1] /= sqrt_subsections as f32;
            origin[0] += extent[0] * sub_x as f32;
            origin[1] += extent[1] * sub_y as f32;
        }

        Self {
            origin,
            extent,
            sqrt_max_instances,
        }
    }
}

fn min_distance_sq(bounds: &Aabb, cameras: &[Vec3]) -> f32 {
    if cameras.is_empty() {
        return 0.0;
    }
    cameras
        .iter()
        .map(|c| bounds.distance_squared_to_point(*c))
        .fold(f32::MAX, f32::min)
}

/// Scatter state for one terrain.
pub struct ScatterBuilder {
    terrain: Arc<Terrain>,
    kinds: Vec<ScatterKind>,
    cache: GrassCache,
    foliage: FoliageRegistry,
    worker: BuildWorker,
    /// Finished builds waiting for their apply slot.
    done: Vec<TransformBuild>,
}

impl ScatterBuilder {
    pub fn new(terrain: Arc<Terrain>, probe: Option<Arc<dyn SurfaceProbe>>) -> Self {
        Self {
            terrain,
            kinds: Vec::new(),
            cache: GrassCache::default(),
            foliage: FoliageRegistry::default(),
            worker: BuildWorker::new(2, probe),
            done: Vec::new(),
        }
    }

    pub fn terrain(&self) -> &Arc<Terrain> {
        &self.terrain
    }

    pub fn add_kinds(&mut self, kinds: impl IntoIterator<Item = ScatterKind>) {
        self.kinds.extend(kinds);
    }

    pub fn cache(&self) -> &GrassCache {
        &self.cache
    }

    pub fn foliage(&self) -> &FoliageRegistry {
        &self.foliage
    }

    /// Whether a readback output belongs to this builder's terrain.
    pub fn owns(&self, key: &GrassCompKey) -> bool {
        self.terrain.components.iter().any(|c| c.id == key.component)
    }

    /// Nearest squared camera distance to the terrain, for prioritizing
    /// builders when several share the create budget.
    pub fn min_camera_distance_sq(&self, cameras: &[Vec3]) -> f32 {
        min_distance_sq(&self.terrain.world_bounds(), cameras)
    }

    /// Largest distance at which any variety here can still be seen,
    /// with the discard guard band applied.
    fn max_discard_distance(&self, config: &ScatterConfig) -> f32 {
        let mut max_end = 0.0f32;
        for kind in &self.kinds {
            for variety in &kind.varieties {
                max_end = max_end.max(variety.end_cull_distance as f32);
            }
        }
        max_end
            * config.cull_distance_scale
            * config
                .discard_guard_band_multiplier
                .max(config.guard_band_multiplier)
    }

    /// Walk the terrain nearest-component-first and create missing cells:
    /// register a cache entry, allocate the cell's buffer triple, submit
    /// the compute dispatch and queue its readback. `creates` is the
    /// cross-builder budget of new cells this tick.
    #[allow(clippy::too_many_arguments)]
    pub fn build_dispatches(
        &mut self,
        cameras: &[Vec3],
        driver: &dyn ScatterDriver,
        readbacks: &mut ReadbackManager,
        frame: u32,
        now: f64,
        config: &ScatterConfig,
        creates: &mut i32,
    ) -> Result<()> {
        if self.kinds.is_empty() {
            return Ok(());
        }

        let max_discard = self.max_discard_distance(config);
        let max_discard_sq = max_discard * max_discard;

        let mut sorted: Vec<(Arc<LandscapeComponent>, f32)> = self
            .terrain
            .components
            .iter()
            .filter_map(|component| {
                let dist_sq = min_distance_sq(&component.world_bounds(), cameras);
                if dist_sq > max_discard_sq {
                    None
                } else {
                    Some((component.clone(), dist_sq.sqrt()))
                }
            })
            .collect();
        sorted.sort_by(|a, b| a.1.total_cmp(&b.1));

        let max_instances_per_component = config.instance_cap();

        for (component, min_dist) in sorted {
            let mut halton_base: u32 = 1;
            let mut variety_index: i32 = -1;

            for kind in &self.kinds {
                if !kind.enabled {
                    continue;
                }
                for variety in &kind.varieties {
                    variety_index += 1;
                    if !variety.is_active() {
                        continue;
                    }

                    let end_cull = variety.end_cull_distance as f32;
                    let discard_distance = config.discard_guard_band_multiplier
                        * end_cull
                        * config.cull_distance_scale;
                    let use_halton = !variety.use_grid;
                    if !use_halton && min_dist > discard_distance {
                        continue;
                    }

                    let density = variety.density * config.density_scale;
                    let base = SubsectionMath::new(&self.terrain, &component, density, 1, 0, 0);
                    let mut sqrt_subsections = 1;
                    if base.sqrt_max_instances > 0 {
                        sqrt_subsections = ((base.sqrt_max_instances as f32
                            / (max_instances_per_component as f32).sqrt())
                        .ceil() as i32)
                            .clamp(1, 16);
                    }
                    let max_instances_sub =
                        (base.sqrt_max_instances / sqrt_subsections).pow(2);

                    // Out-of-range halton varieties still advance the
                    // sequence so in-range cells stay stable.
                    if use_halton && min_dist > discard_distance {
                        halton_base +=
                            (max_instances_sub * sqrt_subsections * sqrt_subsections) as u32;
                        continue;
                    }

                    let local = &component.local_bounds;
                    let extent_div = Vec3::new(
                        local.size().x / sqrt_subsections as f32,
                        local.size().y / sqrt_subsections as f32,
                        local.size().z,
                    );

                    for sub_x in 0..sqrt_subsections {
                        for sub_y in 0..sqrt_subsections {
                            let mut min_dist_sub = min_dist;
                            if config.cull_subsections && sqrt_subsections > 1 {
                                let sub_box = Aabb::new(
                                    Vec3::new(
                                        local.min.x + extent_div.x * sub_x as f32,
                                        local.min.y + extent_div.y * sub_y as f32,
                                        local.min.z,
                                    ),
                                    Vec3::new(
                                        local.min.x + extent_div.x * (sub_x + 1) as f32,
                                        local.min.y + extent_div.y * (sub_y + 1) as f32,
                                        local.max.z,
                                    ),
                                );
                                let world_sub = sub_box.transformed(&component.transform);
                                min_dist_sub = min_distance_sq(&world_sub, cameras).sqrt();
                            }

                            // Pre-incremented for every cell; subtracted
                            // back out when the cell actually dispatches.
                            if use_halton {
                                halton_base += max_instances_sub as u32;
                            }
                            if min_dist_sub > discard_distance {
                                continue;
                            }

                            let key = GrassCompKey {
                                component: component.id,
                                sqrt_subsections,
                                max_instances_per_component,
                                sub_x,
                                sub_y,
                                num_varieties: kind.varieties.len() as i32,
                                variety_index,
                            };
                            if self.cache.contains(&key) {
                                self.cache.touch(&key, frame, now);
                                continue;
                            }
                            if *creates >= config.max_creates_per_frame {
                                continue;
                            }
                            *creates += 1;

                            let halton_for_sub = if use_halton {
                                debug_assert!(halton_base > max_instances_sub as u32);
                                halton_base - max_instances_sub as u32
                            } else {
                                0
                            };

                            let seed = variety_seed(
                                &component.name,
                                sub_x,
                                sub_y,
                                variety_index,
                            );
                            let foliage_comp = self.foliage.create(
                                variety.mesh.clone(),
                                variety.enable_collision,
                                self.terrain.transform_no_scale,
                            );
                            let mut entry = GrassComp::new(
                                key,
                                Arc::downgrade(&component),
                                Arc::downgrade(&foliage_comp),
                                foliage_comp.id,
                                frame,
                                now,
                            );

                            let weightmap = kind
                                .spawn_layer
                                .as_deref()
                                .map(|layer| component.find_spawn_layer(layer));
                            if let Some(None) = weightmap {
                                // Spawn layer never painted here: the cell
                                // can produce nothing, so it is cached
                                // settled and ages out normally.
                                debug!(
                                    "cell {:?} has no spawn layer allocation, settling empty",
                                    key.component
                                );
                                entry.pending = false;
                                self.cache.insert(entry);
                                continue;
                            }
                            let weightmap = weightmap.flatten();

                            let sub = SubsectionMath::new(
                                &self.terrain,
                                &component,
                                density,
                                sqrt_subsections,
                                sub_x,
                                sub_y,
                            );
                            let max_instances =
                                (sub.sqrt_max_instances * sub.sqrt_max_instances) as u32;

                            let label = format!(
                                "scatter.{}.{}_{}.v{}",
                                component.name, sub_x, sub_y, variety_index
                            );
                            let buffers =
                                ScatterBuffers::allocate(driver, &label, max_instances);

                            let offset = self.terrain.section_offset;
                            let input = ScatterInput {
                                origin: sub.origin,
                                extent: sub.extent,
                                offset: [offset.x as f32, offset.y as f32],
                                section_base: [
                                    component.section_base.x as f32,
                                    component.section_base.y as f32,
                                ],
                                draw_scale: self.terrain.draw_scale.to_array(),
                                sqrt_max_instances: sub.sqrt_max_instances as u32,
                                halton_base_index: halton_for_sub,
                                stride: (component.size_quads + 1) as u32,
                            };
                            let params = ScatterParams::from_variety(
                                variety,
                                seed,
                                weightmap.map(|(_, channel)| channel + 1).unwrap_or(0),
                            );
                            let variant = match weightmap {
                                Some((texture, _)) => DispatchVariant::WithWeightmap {
                                    heightmap: component.heightmap,
                                    weightmap: texture,
                                },
                                None => DispatchVariant::WithoutWeightmap {
                                    heightmap: component.heightmap,
                                },
                            };

                            let dispatch = ScatterDispatch {
                                input,
                                params,
                                variant,
                                buffers: buffers.clone(),
                                max_instances,
                            };
                            dispatch.submit(driver)?;

                            let xform = foliage_comp.transform.inverse()
                                * self.terrain.transform_no_scale;
                            let output = BuilderOutput {
                                key,
                                landscape: Arc::downgrade(&component),
                                foliage: Arc::downgrade(&foliage_comp),
                                xform,
                                variety: Arc::new(variety.clone()),
                                random_scale: transform::random_scale_enabled(variety),
                                records: Vec::new(),
                            };
                            readbacks.add(Readback::new(
                                output,
                                &buffers,
                                max_instances,
                                driver,
                                frame,
                            ));

                            entry.buffers = Some(buffers);
                            self.cache.insert(entry);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Hand a completed readback to the worker pool.
    pub fn submit_output(&mut self, output: BuilderOutput) {
        self.worker.submit(output);
    }

    /// Retirement half of the tick: evict stale cells, tear down at most
    /// one orphaned foliage component and apply at most one finished
    /// transform build.
    pub fn wait_and_apply(&mut self, frame: u32, now: f64, config: &ScatterConfig) {
        let evicted = self.cache.evict_stale(frame, now, config);
        if evicted > 0 {
            debug!("evicted {evicted} stale scatter cells");
        }

        let used = self.cache.used_foliage();
        let orphan = self.foliage.ids().find(|id| !used.contains(id));
        if let Some(id) = orphan {
            self.foliage.destroy(id);
        }

        self.done.extend(self.worker.poll_results());
        if !self.done.is_empty() {
            // Collision components block gameplay until populated, so
            // their results jump the queue.
            let index = self
                .done
                .iter()
                .position(|b| b.foliage.upgrade().is_some_and(|f| f.enable_collision))
                .unwrap_or(0);
            let build = self.done.remove(index);
            self.apply_build(build, frame, now);
        }
    }

    fn apply_build(&mut self, build: TransformBuild, frame: u32, now: f64) {
        let Some(entry) = self.cache.get_mut(&build.key) else {
            return;
        };
        // The cell settles whether or not the component survived; a dead
        // component just means the result has nowhere to go.
        entry.pending = false;
        entry.touch(frame, now);

        let Some(foliage) = build.foliage.upgrade() else {
            return;
        };
        if build.instance_count() == 0 {
            return;
        }

        let instance_count = build.instance_buffer.len() as u32;
        foliage.accept_prebuilt_tree(RenderBatch {
            collision_transforms: if foliage.enable_collision {
                build.transforms
            } else {
                Vec::new()
            },
            cluster_tree: build.tree.nodes,
            occlusion_layer_count: build.tree.occlusion_layer_count,
            instance_count,
            instance_buffer: build.instance_buffer,
        });
    }

    /// Tear down everything this builder created. Blocks until in-flight
    /// transform builds finish; their results are discarded.
    pub fn flush(&mut self) {
        let discarded = self.worker.flush();
        if !discarded.is_empty() {
            debug!("flush discarded {} in-flight builds", discarded.len());
        }
        self.done.clear();
        self.cache.clear();
        self.foliage.destroy_all();
    }

    #[cfg(test)]
    fn join_builds(&mut self) {
        let results = self.worker.flush();
        self.done.extend(results);
    }
}
