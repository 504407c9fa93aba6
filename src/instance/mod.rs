//! Instance records and buffers.
//!
//! [`PlacementRecord`] is the raw per-sample result read back from the
//! scatter compute pass. [`InstanceBuffer`] is the packed structured
//! buffer handed to the instanced renderer, paired with a cluster tree
//! over the same instance order. The tree build returns a permutation,
//! not reordered data, so [`apply_reorder`] physically reorders both
//! arrays to match it afterwards.

use bytemuck::{Pod, Zeroable};

use crate::core::types::{Mat4, Vec3};

/// One raw scatter sample: world position, surface normal and the
/// GPU-computed scale seed. Matches the compute output layout exactly.
///
/// A `normal.z` greater than 1.0 marks an invalid sample (the compute
/// pass writes the sentinel for points outside the valid placement area).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct PlacementRecord {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub scale_seed: f32,
}

impl PlacementRecord {
    pub fn is_valid(&self) -> bool {
        self.normal[2] <= 1.0
    }

    pub fn position_vec(&self) -> Vec3 {
        Vec3::from_array(self.position)
    }

    pub fn normal_vec(&self) -> Vec3 {
        Vec3::from_array(self.normal)
    }
}

/// Drop sentinel-flagged records, keeping the survivors in input order.
pub fn retain_valid(records: &mut Vec<PlacementRecord>) {
    records.retain(PlacementRecord::is_valid);
}

/// One packed instance as the renderer consumes it: the affine transform
/// as three rows (translation in the last column) plus a per-instance
/// random fraction for material variation.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct GpuInstance {
    pub transform: [[f32; 4]; 3],
    pub random_id: f32,
    pub _pad: [f32; 3],
}

impl GpuInstance {
    pub fn new(transform: &Mat4, random_id: f32) -> Self {
        let rows = transform.transpose().to_cols_array_2d();
        Self {
            transform: [rows[0], rows[1], rows[2]],
            random_id,
            _pad: [0.0; 3],
        }
    }
}

/// The structured instance buffer uploaded to the renderer.
#[derive(Clone, Debug, Default)]
pub struct InstanceBuffer {
    instances: Vec<GpuInstance>,
}

impl InstanceBuffer {
    pub fn with_capacity(n: usize) -> Self {
        Self {
            instances: Vec::with_capacity(n),
        }
    }

    pub fn push(&mut self, transform: &Mat4, random_id: f32) {
        self.instances.push(GpuInstance::new(transform, random_id));
    }

    pub fn swap_instance(&mut self, a: usize, b: usize) {
        self.instances.swap(a, b);
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn instances(&self) -> &[GpuInstance] {
        &self.instances
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.instances)
    }
}

/// One node of the bounding-volume hierarchy over instances. Child and
/// instance ranges are inclusive; -1 marks a leaf's child range.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct ClusterNode {
    pub bound_min: [f32; 3],
    pub first_child: i32,
    pub bound_max: [f32; 3],
    pub last_child: i32,
    pub first_instance: i32,
    pub last_instance: i32,
}

impl ClusterNode {
    pub fn is_leaf(&self) -> bool {
        self.first_child < 0
    }
}

/// Physically reorder `transforms` and `buffer` to match the permutation
/// the cluster-tree build produced, in place.
///
/// `sorted_instances[i]` names the input index whose data belongs at
/// output slot `i`; `reorder_table` is its inverse. Each displaced
/// element is swapped into place exactly once by following the
/// permutation cycles, so the pass is O(n) swaps. Both tables end up as
/// the identity. Returns the number of swaps performed.
pub fn apply_reorder(
    sorted_instances: &mut [i32],
    reorder_table: &mut [i32],
    transforms: &mut [Mat4],
    buffer: &mut InstanceBuffer,
) -> usize {
    debug_assert_eq!(sorted_instances.len(), reorder_table.len());
    debug_assert_eq!(sorted_instances.len(), transforms.len());
    debug_assert_eq!(sorted_instances.len(), buffer.len());

    let mut swaps = 0;
    for i in 0..sorted_instances.len() {
        let load_from = sorted_instances[i] as usize;
        if load_from == i {
            continue;
        }
        debug_assert!(load_from > i);
        buffer.swap_instance(i, load_from);
        transforms.swap(i, load_from);
        swaps += 1;

        let swap_goes_to = reorder_table[i] as usize;
        debug_assert!(swap_goes_to > i);
        debug_assert_eq!(sorted_instances[swap_goes_to] as usize, i);
        sorted_instances[swap_goes_to] = load_from as i32;
        reorder_table[load_from] = swap_goes_to as i32;

        reorder_table[i] = i as i32;
        sorted_instances[i] = i as i32;
    }
    swaps
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_layout() {
        assert_eq!(std::mem::size_of::<PlacementRecord>(), 28);
        assert_eq!(std::mem::size_of::<GpuInstance>(), 64);
        assert_eq!(std::mem::size_of::<ClusterNode>(), 40);

        let mut buffer = InstanceBuffer::with_capacity(2);
        buffer.push(&Mat4::IDENTITY, 0.25);
        buffer.push(&Mat4::IDENTITY, 0.75);
        assert_eq!(buffer.as_bytes().len(), 128);
    }

    #[test]
    fn test_sentinel_filter_preserves_order() {
        let rec = |x: f32, nz: f32| PlacementRecord {
            position: [x, 0.0, 0.0],
            normal: [0.0, 0.0, nz],
            scale_seed: 0.5,
        };
        let mut records = vec![
            rec(0.0, 1.0),
            rec(1.0, 2.0),
            rec(2.0, 0.8),
            rec(3.0, 1.5),
            rec(4.0, -1.0),
        ];
        retain_valid(&mut records);
        assert_eq!(records.len(), 3);
        let xs: Vec<f32> = records.iter().map(|r| r.position[0]).collect();
        assert_eq!(xs, vec![0.0, 2.0, 4.0]);
    }

    #[test]
    fn test_apply_reorder_matches_permutation() {
        // Output slot i should receive input element sorted[i].
        let sorted = vec![2i32, 0, 3, 1];
        let mut sorted_instances = sorted.clone();
        // Inverse permutation.
        let mut reorder_table = vec![0i32; sorted.len()];
        for (slot, &src) in sorted.iter().enumerate() {
            reorder_table[src as usize] = slot as i32;
        }

        let mut transforms: Vec<Mat4> = (0..4)
            .map(|i| Mat4::from_translation(Vec3::new(i as f32, 0.0, 0.0)))
            .collect();
        let input = transforms.clone();
        let mut buffer = InstanceBuffer::with_capacity(4);
        for t in &transforms {
            buffer.push(t, 0.0);
        }
        let input_buf = buffer.instances().to_vec();

        let swaps = apply_reorder(
            &mut sorted_instances,
            &mut reorder_table,
            &mut transforms,
            &mut buffer,
        );

        for (i, &src) in sorted.iter().enumerate() {
            assert_eq!(transforms[i], input[src as usize]);
            assert_eq!(buffer.instances()[i], input_buf[src as usize]);
        }
        // Every element was displaced; one swap per displaced element,
        // minus the one that falls into place on the final cycle step.
        assert_eq!(swaps, 3);
        assert!(sorted_instances.iter().enumerate().all(|(i, &v)| v == i as i32));
        assert!(reorder_table.iter().enumerate().all(|(i, &v)| v == i as i32));
    }

    #[test]
    fn test_apply_reorder_identity_is_noop() {
        let mut sorted_instances = vec![0i32, 1, 2];
        let mut reorder_table = vec![0i32, 1, 2];
        let mut transforms = vec![Mat4::IDENTITY; 3];
        let mut buffer = InstanceBuffer::with_capacity(3);
        for t in &transforms {
            buffer.push(t, 0.0);
        }
        let swaps = apply_reorder(
            &mut sorted_instances,
            &mut reorder_table,
            &mut transforms,
            &mut buffer,
        );
        assert_eq!(swaps, 0);
    }
}
