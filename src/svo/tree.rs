//! Octree container: subdivision, invalidation, lookup.

use crate::config::SvoConfig;
use crate::core::types::{IVec3, Vec3};
use crate::math::Aabb;
use crate::scene::SceneSources;
use crate::segment::brick::BRICK_DIM;
use crate::segment::voxelize;
use crate::segment::{Segment, StreamingStatus};

use crate::atlas::BlockId;

use super::arena::{Arena, NodeId, SegmentId};
use super::node::SvoNode;

/// The sparse voxel octree. Nodes and segments live in arenas; all links
/// between them are handles. Mutation happens on the main thread only.
pub struct SvoTree {
    nodes: Arena<SvoNode>,
    segments: Arena<Segment>,
    root: NodeId,
    world_bounds: Aabb,
    next_segment_id: u32,
    /// Atlas blocks whose owning segment was freed with the subtree; the
    /// environment returns these to the packer once per frame.
    orphaned_blocks: Vec<BlockId>,
}

impl SvoTree {
    pub fn new(world_bounds: Aabb) -> Self {
        let mut nodes = Arena::new();
        let root = NodeId(nodes.insert(SvoNode::new(world_bounds, None)));
        Self {
            nodes,
            segments: Arena::new(),
            root,
            world_bounds,
            next_segment_id: 0,
            orphaned_blocks: Vec::new(),
        }
    }

    /// Atlas blocks stranded by subtree deallocation since the last call.
    pub fn take_orphaned_blocks(&mut self) -> Vec<BlockId> {
        std::mem::take(&mut self.orphaned_blocks)
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn world_bounds(&self) -> Aabb {
        self.world_bounds
    }

    /// Panics on a stale handle; node handles are only freed through
    /// subtree deallocation, so a dangling one is a programming error.
    pub fn node(&self, id: NodeId) -> &SvoNode {
        self.nodes.get(id.0).expect("stale node handle")
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut SvoNode {
        self.nodes.get_mut(id.0).expect("stale node handle")
    }

    pub fn segment(&self, id: SegmentId) -> &Segment {
        self.segments.get(id.0).expect("stale segment handle")
    }

    pub fn segment_mut(&mut self, id: SegmentId) -> &mut Segment {
        self.segments.get_mut(id.0).expect("stale segment handle")
    }

    /// Segment lookup tolerating handles that were freed by an unload.
    pub fn try_segment(&self, id: SegmentId) -> Option<&Segment> {
        self.segments.get(id.0)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn node_segment(&self, node: NodeId) -> Option<&Segment> {
        self.node(node).segment.map(|s| self.segment(s))
    }

    /// Allocate the node's segment: object-space box around the node
    /// center, parent-segment link, geometry checksum stamp.
    pub fn allocate_segment(&mut self, node_id: NodeId, geometry_checksum: IVec3) -> SegmentId {
        debug_assert!(self.node(node_id).segment.is_none());
        let bounds = self.node(node_id).bounds;
        let parent_seg = self
            .node(node_id)
            .parent
            .and_then(|p| self.node(p).segment);

        let id = self.next_segment_id;
        self.next_segment_id += 1;

        let mut segment = Segment::new(id, node_id, parent_seg, bounds);
        segment.geometry_checksum = geometry_checksum;

        let handle = SegmentId(self.segments.insert(segment));
        self.node_mut(node_id).segment = Some(handle);
        handle
    }

    /// Keep freshly allocated segment ids clear of ids read from a file.
    pub fn note_persisted_segment_id(&mut self, id: u32) {
        self.next_segment_id = self.next_segment_id.max(id + 1);
    }

    /// Create an (empty) child node under `parent`.
    pub fn create_child(&mut self, parent: NodeId, child_id: u8) -> NodeId {
        debug_assert!(self.node(parent).child(child_id).is_none());
        let bounds = self.node(parent).child_bounds(child_id);
        let node = NodeId(self.nodes.insert(SvoNode::new(bounds, Some(parent))));
        self.node_mut(parent).set_child(child_id, Some(node));
        node
    }

    /// Drop a node's segment, if any.
    pub fn remove_segment(&mut self, node: NodeId) {
        if let Some(seg) = self.node_mut(node).segment.take() {
            if let Some(removed) = self.segments.remove(seg.0) {
                if let Some(block) = removed.block {
                    self.orphaned_blocks.push(block);
                }
            }
        }
    }

    /// Recursively free a subtree: children first, then the segment.
    /// The parent's child slot is not touched; use `detach_and_free_child`
    /// when the parent survives.
    pub fn free_subtree(&mut self, id: NodeId) {
        let Some(node) = self.nodes.remove(id.0) else {
            return;
        };
        if let Some(children) = node.children {
            for child in children.iter().flatten() {
                self.free_subtree(*child);
            }
        }
        if let Some(seg) = node.segment {
            if let Some(removed) = self.segments.remove(seg.0) {
                if let Some(block) = removed.block {
                    self.orphaned_blocks.push(block);
                }
            }
        }
    }

    pub fn detach_and_free_child(&mut self, parent: NodeId, child_id: u8) {
        if let Some(child) = self.node(parent).child(child_id) {
            self.node_mut(parent).set_child(child_id, None);
            self.free_subtree(child);
        }
    }

    /// Descend by octant comparison. Returns `None` when a needed child is
    /// absent before the target level is reached.
    pub fn find_node_at_level(&self, position: Vec3, target_level: u32) -> Option<NodeId> {
        let mut id = self.root;
        for _ in 0..target_level {
            let node = self.node(id);
            let octant = node.bounds.octant_of_point(position);
            id = node.child(octant)?;
        }
        Some(id)
    }

    /// Find the node whose segment holds the given atlas offset.
    pub fn find_node_by_atlas_offset(&self, offset: i32) -> Option<NodeId> {
        self.find_by_offset_from(self.root, offset)
    }

    fn find_by_offset_from(&self, id: NodeId, offset: i32) -> Option<NodeId> {
        let node = self.node(id);
        if let Some(seg) = node.segment {
            if self.segment(seg).atlas_offset == offset {
                return Some(id);
            }
        }
        for child_id in 0..8 {
            if let Some(child) = node.child(child_id) {
                if let Some(found) = self.find_by_offset_from(child, offset) {
                    return Some(found);
                }
            }
        }
        None
    }

    /// Geometry moved inside `bounds`: force-recreate every overlapping
    /// loaded node and its ancestors up to (and including) the first one
    /// at or above `max_node_size`.
    pub fn register_movement(&mut self, bounds: &Aabb, max_node_size: f32) {
        self.register_movement_from(self.root, bounds, max_node_size);
    }

    fn register_movement_from(&mut self, id: NodeId, bounds: &Aabb, max_node_size: f32) {
        if !self.node(id).bounds.intersects(bounds) {
            return;
        }

        let loaded = self
            .node(id)
            .segment
            .map(|s| self.segment(s).status != StreamingStatus::NotLoaded)
            .unwrap_or(false);
        if loaded && self.node(id).size() <= max_node_size {
            let mut cursor = Some(id);
            while let Some(n) = cursor {
                self.node_mut(n).force_recreate = true;
                if self.node(n).size() >= max_node_size {
                    break;
                }
                cursor = self.node(n).parent;
            }
        }

        for child_id in 0..8 {
            if let Some(child) = self.node(id).child(child_id) {
                self.register_movement_from(child, bounds, max_node_size);
            }
        }
    }

    /// Static light inside `bounds` changed: flag every overlapping
    /// segment for a lighting refresh.
    pub fn on_static_lights_changed(&mut self, bounds: &Aabb) {
        self.on_lights_changed_from(self.root, bounds);
    }

    fn on_lights_changed_from(&mut self, id: NodeId, bounds: &Aabb) {
        if !self.node(id).bounds.intersects(bounds) {
            return;
        }
        if let Some(seg) = self.node(id).segment {
            self.segment_mut(seg).static_lights_changed = true;
        }
        for child_id in 0..8 {
            if let Some(child) = self.node(id).child(child_id) {
                self.on_lights_changed_from(child, bounds);
            }
        }
    }

    pub fn is_streaming_in_progress(&self, id: NodeId) -> bool {
        let node = self.node(id);
        if let Some(seg) = node.segment {
            if self.segment(seg).status == StreamingStatus::InProgress {
                return true;
            }
        }
        for child_id in 0..8 {
            if let Some(child) = node.child(child_id) {
                if self.is_streaming_in_progress(child) {
                    return true;
                }
            }
        }
        false
    }

    /// A completed stream found the segment empty: flag its slot in the
    /// parent so the subtree is pruned instead of re-requested.
    pub fn mark_child_not_needed(&mut self, node: NodeId) {
        let Some(parent) = self.node(node).parent else {
            return;
        };
        for child_id in 0..8 {
            if self.node(parent).child(child_id) == Some(node) {
                self.node_mut(parent).set_child_not_needed(child_id);
            }
        }
    }

    /// Subdivide a ready node: allocate missing children (and their empty
    /// segments), refresh existing ones, drop not-needed octants.
    ///
    /// With postponement enabled, a max-size child whose scene geometry is
    /// not fully streamed in is skipped this frame; the next walk retries
    /// naturally. Returns the number of postponed octants.
    pub fn check_allocate_children(
        &mut self,
        id: NodeId,
        frame: u32,
        cfg: &SvoConfig,
        sources: &SceneSources,
    ) -> usize {
        if self.node(id).size() <= cfg.min_node_size {
            return 0;
        }

        if let Some(seg) = self.node(id).segment {
            self.segment_mut(seg).last_rendered_frame = frame;
        }

        let mut postponed = 0;

        for child_id in 0..8 {
            if self.node(id).child_not_needed(child_id) {
                self.detach_and_free_child(id, child_id);
                continue;
            }

            let child_bounds = self.node(id).child_bounds(child_id);

            if cfg.postpone_voxelization
                && self.node(id).child(child_id).is_none()
                && (child_bounds.size().z - cfg.max_node_size).abs() < 1e-3
                && !voxelize::probe_scene_ready(sources, &child_bounds)
            {
                postponed += 1;
                continue;
            }

            if let Some(child) = self.node(id).child(child_id) {
                if let Some(seg) = self.node(child).segment {
                    self.segment_mut(seg).last_rendered_frame = frame;
                }
                continue;
            }

            let child = self.create_child(id, child_id);
            let border = child_bounds.size().x / BRICK_DIM as f32;
            let checksum = sources.geometry_checksum(&child_bounds, cfg.max_node_size, border);
            self.allocate_segment(child, checksum);
        }

        postponed
    }
}
