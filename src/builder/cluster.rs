//! Cluster tree construction.
//!
//! Builds the bounding-volume hierarchy the hierarchical instanced
//! renderer walks: instances are sorted along a Morton curve, chunked
//! into leaves, and grouped sixteen wide per level up to a single root.
//! The node array is laid out root first. The build returns a
//! permutation, not reordered data; callers apply it afterwards with
//! [`crate::instance::apply_reorder`].

use crate::core::types::{Mat4, Vec3};
use crate::instance::ClusterNode;
use crate::math::{morton, Aabb};

/// Max children per internal node.
const BRANCHING: usize = 16;

/// Everything the tree build produces. `sorted_instances[i]` is the
/// input index whose instance belongs at slot `i`; `reorder_table` is
/// the inverse mapping.
#[derive(Debug, Default)]
pub struct ClusterTreeBuild {
    pub nodes: Vec<ClusterNode>,
    pub sorted_instances: Vec<i32>,
    pub reorder_table: Vec<i32>,
    pub occlusion_layer_count: u32,
}

/// Build the hierarchy over `transforms`, expanding `mesh_bounds` by each
/// instance transform for leaf bounds.
pub fn build_tree(
    transforms: &[Mat4],
    mesh_bounds: &Aabb,
    desired_instances_per_leaf: u32,
) -> ClusterTreeBuild {
    let n = transforms.len();
    if n == 0 {
        return ClusterTreeBuild::default();
    }
    let leaf_size = desired_instances_per_leaf.max(1) as usize;

    // Morton order over instance origins.
    let positions: Vec<Vec3> = transforms
        .iter()
        .map(|t| t.w_axis.truncate())
        .collect();
    let mut scene = Aabb::new(Vec3::INFINITY, Vec3::NEG_INFINITY);
    for p in &positions {
        scene.expand(*p);
    }
    let extent = (scene.max - scene.min).max(Vec3::splat(1e-6));
    let key = |p: Vec3| {
        let norm = (p - scene.min) / extent;
        morton::morton_key_normalized(norm.x, norm.y, norm.z)
    };

    let mut sorted_instances: Vec<i32> = (0..n as i32).collect();
    sorted_instances.sort_by_key(|&i| key(positions[i as usize]));

    let mut reorder_table = vec![0i32; n];
    for (slot, &src) in sorted_instances.iter().enumerate() {
        reorder_table[src as usize] = slot as i32;
    }

    // Leaves over the sorted order; instance ranges are post-reorder
    // slots, inclusive.
    let instance_bounds = |slot: usize| {
        mesh_bounds.transformed(&transforms[sorted_instances[slot] as usize])
    };
    let mut leaves: Vec<ClusterNode> = Vec::with_capacity(n.div_ceil(leaf_size));
    let mut start = 0;
    while start < n {
        let end = (start + leaf_size).min(n);
        let mut bounds = instance_bounds(start);
        for slot in start + 1..end {
            bounds = bounds.merged(&instance_bounds(slot));
        }
        leaves.push(ClusterNode {
            bound_min: bounds.min.to_array(),
            first_child: -1,
            bound_max: bounds.max.to_array(),
            last_child: -1,
            first_instance: start as i32,
            last_instance: end as i32 - 1,
        });
        start = end;
    }

    // Levels bottom-up, sixteen children per parent, until one root.
    // Child indices are per-level here and patched to final positions
    // when flattening.
    let mut levels: Vec<Vec<ClusterNode>> = vec![leaves];
    while levels.last().unwrap().len() > 1 {
        let below = levels.last().unwrap();
        let mut level = Vec::with_capacity(below.len().div_ceil(BRANCHING));
        let mut first = 0;
        while first < below.len() {
            let last = (first + BRANCHING).min(below.len()) - 1;
            let mut bounds = Aabb::new(
                Vec3::from_array(below[first].bound_min),
                Vec3::from_array(below[first].bound_max),
            );
            for child in &below[first + 1..=last] {
                bounds = bounds.merged(&Aabb::new(
                    Vec3::from_array(child.bound_min),
                    Vec3::from_array(child.bound_max),
                ));
            }
            level.push(ClusterNode {
                bound_min: bounds.min.to_array(),
                first_child: first as i32,
                bound_max: bounds.max.to_array(),
                last_child: last as i32,
                first_instance: below[first].first_instance,
                last_instance: below[last].last_instance,
            });
            first = last + 1;
        }
        levels.push(level);
    }

    // Flatten root first. Level k (from the root down) starts after all
    // shallower levels, so child ranges shift by the next level's offset.
    let mut nodes = Vec::with_capacity(levels.iter().map(Vec::len).sum());
    let mut offset = 0;
    for depth in (0..levels.len()).rev() {
        let child_offset = offset + levels[depth].len() as i32;
        for node in &levels[depth] {
            let mut out = *node;
            if out.first_child >= 0 {
                out.first_child += child_offset;
                out.last_child += child_offset;
            }
            nodes.push(out);
        }
        offset = child_offset;
    }

    ClusterTreeBuild {
        nodes,
        sorted_instances,
        reorder_table,
        // Internal levels above the leaves; the renderer issues occlusion
        // queries against these.
        occlusion_layer_count: levels.len() as u32 - 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid_transforms(n: usize) -> Vec<Mat4> {
        (0..n)
            .map(|i| {
                Mat4::from_translation(Vec3::new(
                    (i % 10) as f32 * 100.0,
                    (i / 10) as f32 * 100.0,
                    0.0,
                ))
            })
            .collect()
    }

    fn mesh_bounds() -> Aabb {
        Aabb::new(Vec3::splat(-5.0), Vec3::splat(5.0))
    }

    #[test]
    fn test_empty_build() {
        let built = build_tree(&[], &mesh_bounds(), 16);
        assert!(built.nodes.is_empty());
        assert!(built.sorted_instances.is_empty());
    }

    #[test]
    fn test_single_leaf() {
        let transforms = grid_transforms(8);
        let built = build_tree(&transforms, &mesh_bounds(), 16);
        assert_eq!(built.nodes.len(), 1);
        let root = &built.nodes[0];
        assert!(root.is_leaf());
        assert_eq!(root.first_instance, 0);
        assert_eq!(root.last_instance, 7);
        assert_eq!(built.occlusion_layer_count, 0);
    }

    #[test]
    fn test_permutation_is_bijective() {
        let transforms = grid_transforms(100);
        let built = build_tree(&transforms, &mesh_bounds(), 8);
        let mut seen = vec![false; 100];
        for &src in &built.sorted_instances {
            assert!(!seen[src as usize]);
            seen[src as usize] = true;
        }
        for (src, &slot) in built.reorder_table.iter().enumerate() {
            assert_eq!(built.sorted_instances[slot as usize] as usize, src);
        }
    }

    #[test]
    fn test_root_first_and_instance_coverage() {
        let transforms = grid_transforms(100);
        let built = build_tree(&transforms, &mesh_bounds(), 8);

        let root = &built.nodes[0];
        assert_eq!(root.first_instance, 0);
        assert_eq!(root.last_instance, 99);
        assert!(!root.is_leaf());

        // Leaves tile the instance range without gaps or overlap.
        let mut leaves: Vec<&ClusterNode> =
            built.nodes.iter().filter(|n| n.is_leaf()).collect();
        leaves.sort_by_key(|n| n.first_instance);
        assert_eq!(leaves.len(), 13);
        let mut next = 0;
        for leaf in leaves {
            assert_eq!(leaf.first_instance, next);
            next = leaf.last_instance + 1;
        }
        assert_eq!(next, 100);
    }

    #[test]
    fn test_node_bounds_contain_children() {
        let transforms = grid_transforms(100);
        let built = build_tree(&transforms, &mesh_bounds(), 4);
        for node in &built.nodes {
            if node.is_leaf() {
                continue;
            }
            for child_index in node.first_child..=node.last_child {
                let child = &built.nodes[child_index as usize];
                for axis in 0..3 {
                    assert!(node.bound_min[axis] <= child.bound_min[axis]);
                    assert!(node.bound_max[axis] >= child.bound_max[axis]);
                }
            }
        }
    }

    #[test]
    fn test_deep_tree_has_occlusion_layers() {
        // 100 instances, 4 per leaf: 25 leaves -> 2 internal -> 1 root.
        let built = build_tree(&grid_transforms(100), &mesh_bounds(), 4);
        assert_eq!(built.occlusion_layer_count, 2);
        assert_eq!(built.nodes.len(), 1 + 2 + 25);
    }
}
