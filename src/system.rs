//! Top-level scattering system.
//!
//! Owns the driver handle, config, clock and readback manager, and runs
//! one [`ScatterBuilder`] per registered terrain. The host calls
//! [`ScatterSystem::tick`] once per frame with its camera positions;
//! everything else happens here: polling readbacks, routing finished
//! outputs to their builders, sharing the creation budget across
//! builders nearest-first, and the retire/apply pass.

use std::sync::Arc;

use log::{debug, info};

use crate::builder::ScatterBuilder;
use crate::core::config::ScatterConfig;
use crate::core::time::FrameClock;
use crate::core::types::{Result, Vec3};
use crate::gpu::readback::ReadbackManager;
use crate::gpu::ScatterDriver;
use crate::landscape::{SurfaceProbe, Terrain};
use crate::math::Aabb;
use crate::variety::ScatterKind;

/// A placement volume: terrains whose bounds cross it receive its
/// scatter kinds.
#[derive(Clone, Debug)]
pub struct ScatterRegion {
    /// XY extent; Z is ignored during assignment.
    pub bounds: Aabb,
    pub kinds: Vec<ScatterKind>,
}

pub struct ScatterSystem {
    driver: Arc<dyn ScatterDriver>,
    config: ScatterConfig,
    clock: FrameClock,
    readbacks: ReadbackManager,
    builders: Vec<ScatterBuilder>,
    probe: Option<Arc<dyn SurfaceProbe>>,
}

impl ScatterSystem {
    pub fn new(driver: Arc<dyn ScatterDriver>, config: ScatterConfig) -> Self {
        Self {
            driver,
            config,
            clock: FrameClock::new(),
            readbacks: ReadbackManager::default(),
            builders: Vec::new(),
            probe: None,
        }
    }

    /// Collision probe handed to every builder created afterwards.
    pub fn set_surface_probe(&mut self, probe: Arc<dyn SurfaceProbe>) {
        self.probe = Some(probe);
    }

    pub fn config(&self) -> &ScatterConfig {
        &self.config
    }

    /// Live config access; changes apply from the next tick.
    pub fn config_mut(&mut self) -> &mut ScatterConfig {
        &mut self.config
    }

    pub fn frame(&self) -> u32 {
        self.clock.frame()
    }

    pub fn builders(&self) -> &[ScatterBuilder] {
        &self.builders
    }

    pub fn add_terrain(&mut self, terrain: Arc<Terrain>) {
        info!("registering terrain '{}'", terrain.name);
        self.builders
            .push(ScatterBuilder::new(terrain, self.probe.clone()));
    }

    /// Assign the region's kinds to every terrain it overlaps in XY.
    pub fn add_region(&mut self, region: ScatterRegion) {
        let mut assigned = 0;
        for builder in &mut self.builders {
            if builder.terrain().world_bounds().intersects_xy(&region.bounds) {
                builder.add_kinds(region.kinds.iter().cloned());
                assigned += 1;
            }
        }
        debug!("region assigned to {assigned} of {} terrains", self.builders.len());
    }

    /// One orchestration frame.
    pub fn tick(&mut self, cameras: &[Vec3]) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }
        self.clock.tick();
        let frame = self.clock.frame();
        let now = self.clock.now_seconds();

        // Finished readbacks go to their builder's worker pool first so
        // this tick's apply pass can already see early completions.
        let outputs = self
            .readbacks
            .poll(self.driver.as_ref(), frame, &self.config);
        for output in outputs {
            if let Some(builder) = self.builders.iter_mut().find(|b| b.owns(&output.key)) {
                builder.submit_output(output);
            }
        }

        // Nearest terrains get first claim on the creation budget.
        let mut order: Vec<usize> = (0..self.builders.len()).collect();
        order.sort_by(|&a, &b| {
            self.builders[a]
                .min_camera_distance_sq(cameras)
                .total_cmp(&self.builders[b].min_camera_distance_sq(cameras))
        });

        let interval = self.config.update_interval.max(1);
        let mut creates = 0;
        for index in order {
            // Staggered so builders with a long interval spread across
            // frames instead of piling onto one.
            if (frame + index as u32) % interval != 0 {
                continue;
            }
            self.builders[index].build_dispatches(
                cameras,
                self.driver.as_ref(),
                &mut self.readbacks,
                frame,
                now,
                &self.config,
                &mut creates,
            )?;
        }

        for builder in &mut self.builders {
            builder.wait_and_apply(frame, now, &self.config);
        }
        Ok(())
    }

    /// Drop every cached cell, in-flight readback and foliage component.
    /// Blocks until worker builds join; their results are discarded.
    pub fn flush_cache(&mut self) {
        info!("flushing scatter cache ({} builders)", self.builders.len());
        self.readbacks.clear_all();
        for builder in &mut self.builders {
            builder.flush();
        }
    }
}
