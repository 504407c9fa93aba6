//! Scatter dispatch assembly.
//!
//! Packs one placement cell's parameters into the structures the compute
//! pass consumes and pairs them with the cell's cached buffer triple.
//! Two shader variants exist, with and without a weightmap binding; the
//! variant is chosen once per dispatch.

use bytemuck::{Pod, Zeroable};
use log::debug;

use crate::core::types::Result;
use crate::gpu::{BufferHandle, ScatterDriver};
use crate::landscape::TextureHandle;
use crate::variety::GrassVariety;

/// Compute threads per group axis; group count is derived from
/// `sqrt_max_instances`.
pub const THREADS_PER_GROUP: u32 = 32;

/// Per-cell input record uploaded as a one-element structured buffer.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct ScatterInput {
    /// Subsection origin in terrain space (draw-scaled quads).
    pub origin: [f32; 2],
    /// Subsection extent in terrain space.
    pub extent: [f32; 2],
    /// Terrain section offset.
    pub offset: [f32; 2],
    /// Component section base in quads.
    pub section_base: [f32; 2],
    pub draw_scale: [f32; 3],
    pub sqrt_max_instances: u32,
    pub halton_base_index: u32,
    /// Heightmap row stride, `size_quads + 1`.
    pub stride: u32,
}

/// The progress counter the compute pass maintains; read back first to
/// learn whether the result buffer is fully populated.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct ProgressInfo {
    pub count: u32,
    pub max_instances: u32,
}

/// Loose per-dispatch shader parameters, packed from the variety.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct ScatterParams {
    /// 1-based weightmap channel; 0 means no weightmap gating.
    pub weightmap_channel_idx: u32,
    pub use_voronoi_noise: u32,
    /// (group size, scale, valid min, valid max); zeros when disabled.
    pub voronoi_setting: [f32; 4],
    pub slope_min_max: [f32; 2],
    pub height_min_max: [f32; 2],
    pub height_falloff_range: f32,
    pub placement_jitter: f32,
    pub instancing_random_seed: i32,
    pub use_grid: u32,
    pub align_to_surface: u32,
}

impl ScatterParams {
    pub fn from_variety(variety: &GrassVariety, seed: i32, weightmap_channel: u32) -> Self {
        Self {
            weightmap_channel_idx: weightmap_channel,
            use_voronoi_noise: variety.use_voronoi_noise as u32,
            voronoi_setting: if variety.use_voronoi_noise {
                [
                    variety.voronoi_group_size,
                    variety.voronoi_scale,
                    variety.voronoi_valid_range.min,
                    variety.voronoi_valid_range.max,
                ]
            } else {
                [0.0; 4]
            },
            slope_min_max: [variety.slope.min, variety.slope.max],
            height_min_max: [variety.height.min, variety.height.max],
            height_falloff_range: variety.height_falloff_range,
            placement_jitter: variety.placement_jitter,
            instancing_random_seed: seed,
            use_grid: variety.use_grid as u32,
            align_to_surface: variety.align_to_surface as u32,
        }
    }
}

/// Texture bindings for the two shader variants.
#[derive(Clone, Debug)]
pub enum DispatchVariant {
    WithWeightmap {
        heightmap: TextureHandle,
        weightmap: TextureHandle,
    },
    WithoutWeightmap {
        heightmap: TextureHandle,
    },
}

/// The cell's persistent GPU buffer triple, allocated on the first
/// dispatch and reused across redispatches to avoid reallocation.
#[derive(Clone, Debug)]
pub struct ScatterBuffers {
    pub input: BufferHandle,
    pub progress: BufferHandle,
    pub result: BufferHandle,
}

impl ScatterBuffers {
    /// Allocate the triple sized for `max_instances` results.
    pub fn allocate(driver: &dyn ScatterDriver, label: &str, max_instances: u32) -> Self {
        let input = std::mem::size_of::<ScatterInput>() as u64;
        let progress = std::mem::size_of::<ProgressInfo>() as u64;
        let result =
            max_instances as u64 * std::mem::size_of::<crate::instance::PlacementRecord>() as u64;
        Self {
            input: driver.create_buffer(&format!("{label}.input"), input),
            progress: driver.create_buffer(&format!("{label}.progress"), progress),
            result: driver.create_buffer(&format!("{label}.result"), result),
        }
    }
}

/// One assembled dispatch request.
#[derive(Clone, Debug)]
pub struct ScatterDispatch {
    pub input: ScatterInput,
    pub params: ScatterParams,
    pub variant: DispatchVariant,
    pub buffers: ScatterBuffers,
    pub max_instances: u32,
}

impl ScatterDispatch {
    /// Thread group count per axis, covering `sqrt_max_instances`
    /// samples on a square grid.
    pub fn group_count(&self) -> u32 {
        self.input.sqrt_max_instances.div_ceil(THREADS_PER_GROUP)
    }

    pub fn submit(&self, driver: &dyn ScatterDriver) -> Result<()> {
        debug!(
            "scatter dispatch: {}x{} groups, {} max instances, seed {}",
            self.group_count(),
            self.group_count(),
            self.max_instances,
            self.params.instancing_random_seed
        );
        driver.dispatch(self)
    }
}
