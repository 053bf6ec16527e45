//! Octree node record

use crate::math::Aabb;
use super::arena::{NodeId, SegmentId};

/// One node of the sparse voxel octree.
///
/// The child array is allocated lazily on first subdivision; a present array
/// may still hold empty slots. The segment handle points into the tree's
/// segment arena and is exclusively owned by this node.
#[derive(Debug)]
pub struct SvoNode {
    pub bounds: Aabb,
    pub parent: Option<NodeId>,
    pub children: Option<Box<[Option<NodeId>; 8]>>,
    pub segment: Option<SegmentId>,
    /// Scene geometry under this node changed; recreate on next walk.
    pub force_recreate: bool,
    /// Octants proven empty by a completed stream; never re-allocated.
    pub children_not_needed: u8,
    /// Frame at which a render-metadata refresh was requested.
    pub segment_update_frame: u32,
}

impl SvoNode {
    pub fn new(bounds: Aabb, parent: Option<NodeId>) -> Self {
        Self {
            bounds,
            parent,
            children: None,
            segment: None,
            force_recreate: false,
            children_not_needed: 0,
            segment_update_frame: 0,
        }
    }

    /// Bounding box of one child octant.
    pub fn child_bounds(&self, child_id: u8) -> Aabb {
        self.bounds.child_octant(child_id)
    }

    pub fn child(&self, child_id: u8) -> Option<NodeId> {
        self.children.as_ref().and_then(|c| c[child_id as usize])
    }

    pub fn has_children(&self) -> bool {
        self.children.is_some()
    }

    /// Set a child slot, allocating the child array if absent.
    pub fn set_child(&mut self, child_id: u8, node: Option<NodeId>) {
        let children = self
            .children
            .get_or_insert_with(|| Box::new([None; 8]));
        children[child_id as usize] = node;
    }

    pub fn child_not_needed(&self, child_id: u8) -> bool {
        self.children_not_needed & (1 << child_id) != 0
    }

    pub fn set_child_not_needed(&mut self, child_id: u8) {
        self.children_not_needed |= 1 << child_id;
    }

    /// Node edge length in world units (nodes are cubes).
    pub fn size(&self) -> f32 {
        self.bounds.size().x
    }
}
