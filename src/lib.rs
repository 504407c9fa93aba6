//! Veldt - GPU-driven grass scattering for large terrains
//!
//! Scatters dense foliage instances across terrain surfaces with a GPU
//! compute pass, streams placement results back asynchronously, and builds
//! spatially-sorted instance buffers plus cluster trees for hierarchical
//! instanced rendering. The compute shader execution engine and the
//! renderer itself are external collaborators behind narrow traits.

pub mod core;
pub mod math;
pub mod landscape;
pub mod variety;
pub mod foliage;
pub mod instance;
pub mod cache;
pub mod gpu;
pub mod builder;
pub mod system;
