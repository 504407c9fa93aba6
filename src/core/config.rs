//! Runtime tunables for the scattering system.
//!
//! One flat struct holding every knob the components consume, threaded by
//! reference through the orchestrator instead of living in globals. All
//! fields are hot-swappable between ticks; `ScatterSystem::config_mut`
//! exposes them at runtime, and a JSON file can override the defaults.

use serde::{Deserialize, Serialize};

/// User-facing scattering configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ScatterConfig {
    /// Master on/off.
    pub enabled: bool,
    /// Whether editor (non-game) ticks drive the system.
    pub tick_in_editor: bool,
    /// Minimum seconds before a cached cell may be discarded; prevents
    /// thrashing at cull boundaries.
    pub min_time_to_keep_seconds: f32,
    /// Multiplied by the cull distance to control when cells are created.
    /// Approximate range 1-4.
    pub guard_band_multiplier: f32,
    /// Multiplied by the cull distance to control when cells are discarded.
    /// Approximate range 1-4.
    pub discard_guard_band_multiplier: f32,
    /// true: cull each subsection cell; false: cull only whole landscape
    /// components.
    pub cull_subsections: bool,
    /// Multiplier on all cull distances.
    pub cull_distance_scale: f32,
    /// Instance cap per foliage component. Larger is more efficient but can
    /// hitch as new components come into range.
    pub max_instances_per_component: i32,
    /// How many in-flight readbacks are polled per frame.
    pub max_readbacks_per_frame: i32,
    /// Frames to wait between polls of the same readback.
    pub readback_delay_frames: u32,
    /// Multiplier on all variety densities.
    pub density_scale: f32,
    /// Tick divisor: builders only run on frames divisible by this.
    pub update_interval: u32,
    /// New foliage components allowed per tick, shared across builders.
    pub max_creates_per_frame: i32,
}

impl Default for ScatterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_in_editor: true,
            min_time_to_keep_seconds: 5.0,
            guard_band_multiplier: 1.3,
            discard_guard_band_multiplier: 1.4,
            cull_subsections: true,
            cull_distance_scale: 1.0,
            max_instances_per_component: 65536,
            max_readbacks_per_frame: 10,
            readback_delay_frames: 2,
            density_scale: 1.0,
            update_interval: 1,
            max_creates_per_frame: 1,
        }
    }
}

impl ScatterConfig {
    /// Parse a config from JSON, falling back to defaults for absent fields.
    pub fn from_json(json: &str) -> crate::core::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Effective instance cap, floored so degenerate configs cannot produce
    /// zero-sized dispatches.
    pub fn instance_cap(&self) -> i32 {
        self.max_instances_per_component.max(1024)
    }
}
