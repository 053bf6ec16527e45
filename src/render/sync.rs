//! Per-frame tree/render synchronisation.
//!
//! One walk per frame decides which nodes draw directly and which recurse,
//! queues not-ready segments for streaming bucketed by tree level and
//! distance, requests atlas slots for ready segments under a per-frame
//! budget, and propagates child-offset dirty flags up the tree.

use crate::atlas::{BlockId, BlockPacker, EvictScore, BLOCK_DIM};
use crate::config::SvoConfig;
use crate::core::types::{Mat4, Vec3, Vec4};
use crate::math::Aabb;
use crate::scene::SceneSources;
use crate::segment::{ProxyVertex, StreamingStatus, BRICK_DIM};
use crate::svo::arena::{NodeId, SegmentId};
use crate::svo::SvoTree;

use super::boundary::{BrickChannelKind, ChildRef, NodeMetadata, RenderBackend};

/// Streaming queues are bucketed `[tree level][distance bucket]`, both
/// clamped to this dimension.
pub const STREAM_QUEUE_DIM: usize = 8;
/// Brick-update lists are bucketed by tree level.
pub const BRICK_UPDATE_LEVELS: usize = 16;

pub type StreamingQueues = [[Vec<SegmentId>; STREAM_QUEUE_DIM]; STREAM_QUEUE_DIM];
pub type BrickUpdateQueues = [Vec<SegmentId>; BRICK_UPDATE_LEVELS];

pub fn new_streaming_queues() -> StreamingQueues {
    std::array::from_fn(|_| std::array::from_fn(|_| Vec::new()))
}

pub fn new_brick_update_queues() -> BrickUpdateQueues {
    std::array::from_fn(|_| Vec::new())
}

/// View frustum used to cull node boxes during the walk.
///
/// Six inward-facing planes stored as `Vec4` (xyz = unit normal, w =
/// offset), extracted from a view-projection matrix by summing matrix rows.
#[derive(Clone, Copy, Debug)]
pub struct Frustum {
    planes: [Vec4; 6],
}

impl Frustum {
    pub fn from_view_projection(vp: &Mat4) -> Self {
        let mut planes = [
            vp.row(3) + vp.row(0), // left
            vp.row(3) - vp.row(0), // right
            vp.row(3) + vp.row(1), // bottom
            vp.row(3) - vp.row(1), // top
            vp.row(3) + vp.row(2), // near
            vp.row(3) - vp.row(2), // far
        ];
        for plane in &mut planes {
            let len = plane.truncate().length();
            *plane /= len;
        }
        Self { planes }
    }

    /// How far `bounds` sits fully behind the frustum: zero while any part
    /// of the box may be inside, otherwise the deepest plane clearance.
    pub fn outside_distance(&self, bounds: &Aabb) -> f32 {
        let mut worst = 0.0f32;
        for plane in &self.planes {
            let n = plane.truncate();
            // box corner furthest along the plane normal
            let corner = Vec3::new(
                if n.x >= 0.0 { bounds.max.x } else { bounds.min.x },
                if n.y >= 0.0 { bounds.max.y } else { bounds.min.y },
                if n.z >= 0.0 { bounds.max.z } else { bounds.min.z },
            );
            let clearance = n.dot(corner) + plane.w;
            if clearance < 0.0 {
                worst = worst.max(-clearance);
            }
        }
        worst
    }

    pub fn intersects_aabb(&self, bounds: &Aabb) -> bool {
        self.outside_distance(bounds) == 0.0
    }
}

/// Camera state driving LOD and visibility decisions.
#[derive(Clone, Copy, Debug)]
pub struct Camera {
    pub position: Vec3,
    pub frustum: Option<Frustum>,
}

impl Camera {
    pub fn at(position: Vec3) -> Self {
        Self {
            position,
            frustum: None,
        }
    }

    pub fn is_visible(&self, bounds: &Aabb) -> bool {
        match &self.frustum {
            Some(frustum) => frustum.intersects_aabb(bounds),
            None => true,
        }
    }

    /// True when `bounds` is fully outside the frustum by more than
    /// `margin` world units. Without a frustum nothing is ever outside.
    pub fn outside_by(&self, bounds: &Aabb, margin: f32) -> bool {
        match &self.frustum {
            Some(frustum) => frustum.outside_distance(bounds) > margin,
            None => false,
        }
    }
}

/// Per-frame counters surfaced to the host.
#[derive(Clone, Copy, Debug, Default)]
pub struct FrameStats {
    pub checked_ready: u32,
    pub postponed: u32,
    pub emitted_vertices: u32,
    pub stream_started: u32,
    pub brick_updates: u32,
    pub evicted_blocks: u32,
    pub unloaded_segments: u32,
    pub streaming_in_flight: usize,
    pub loaded_segments: usize,
    pub atlas_blocks: usize,
    pub atlas_volume_used: u32,
    pub pool_buffers_in_use: usize,
    pub nodes: usize,
    pub segments: usize,
}

/// Shared state for one frame's walk.
pub struct WalkContext<'a> {
    pub tree: &'a mut SvoTree,
    pub queues: &'a mut StreamingQueues,
    pub brick_updates: &'a mut BrickUpdateQueues,
    pub camera: Camera,
    pub cfg: &'a SvoConfig,
    pub sources: &'a SceneSources,
    pub frame: u32,
    /// Per-bucket streaming queue depth this frame.
    pub stream_cap: usize,
    /// Per-level brick-update list depth this frame.
    pub brick_update_cap: usize,
    pub out_vertices: &'a mut Vec<ProxyVertex>,
    pub stats: &'a mut FrameStats,
}

/// Readiness check for one node's segment; queues streaming and atlas work
/// as side effects. A node without a segment is vacuously ready.
pub fn check_ready_for_rendering(ctx: &mut WalkContext, node_id: NodeId, level: usize) -> bool {
    let Some(seg_id) = ctx.tree.node(node_id).segment else {
        return true;
    };

    if ctx.frame > 1 {
        let seg = ctx.tree.segment_mut(seg_id);
        seg.last_rendered_frame = seg.last_rendered_frame.max(ctx.frame - 1);
    }
    ctx.stats.checked_ready += 1;

    let status = ctx.tree.segment(seg_id).status;
    let mut all_ready = true;

    if status == StreamingStatus::NotLoaded {
        let bounds = ctx.tree.node(node_id).bounds;
        let box_size = bounds.size().x;
        let distance = bounds.distance_to_point(ctx.camera.position);
        let dist_id = ((distance / box_size) as usize).min(STREAM_QUEUE_DIM - 1);
        let level_id = level.min(STREAM_QUEUE_DIM - 1);
        if ctx.queues[level_id][dist_id].len() < ctx.stream_cap {
            ctx.queues[level_id][dist_id].push(seg_id);
        }
    }

    if status != StreamingStatus::Ready {
        all_ready = false;
    }

    if status == StreamingStatus::Ready && !ctx.tree.segment(seg_id).has_atlas_slot() {
        let level_id = level.min(BRICK_UPDATE_LEVELS - 1);
        if ctx.brick_updates[level_id].len() < ctx.brick_update_cap {
            ctx.brick_updates[level_id].push(seg_id);
        }
        all_ready = false;
    }

    all_ready
}

/// Per-frame render walk from `node_id`.
pub fn render_walk(ctx: &mut WalkContext, node_id: NodeId, level: usize) {
    let bounds = ctx.tree.node(node_id).bounds;
    let box_size = bounds.size().x;

    let dist_rated = bounds.center().distance(ctx.camera.position) / 1.5 * 1.25;
    let size_rated = box_size * ctx.cfg.lod_ratio / 1.5 * 1.25;

    // drop children invalidated by scene changes once they are idle
    for child_id in 0..8 {
        if let Some(child) = ctx.tree.node(node_id).child(child_id) {
            if ctx.tree.node(child).force_recreate && !ctx.tree.is_streaming_in_progress(child) {
                log::debug!("recreating octant {} of node at {:?}", child_id, bounds.min);
                ctx.tree.detach_and_free_child(node_id, child_id);
            }
        }
    }

    // subdivide close-enough nodes whose brick indicates more detail below
    if let Some(seg_id) = ctx.tree.node(node_id).segment {
        let seg = ctx.tree.segment(seg_id);
        if seg.status == StreamingStatus::Ready && seg.has_atlas_slot() {
            let wants_children =
                seg.child_tris_mask != 0 || seg.box_size() > ctx.cfg.max_node_size;
            if wants_children && dist_rated < size_rated {
                ctx.stats.postponed +=
                    ctx.tree
                        .check_allocate_children(node_id, ctx.frame, ctx.cfg, ctx.sources)
                        as u32;
            }
        }
    }

    let visible = ctx.camera.is_visible(&bounds);
    let has_children = ctx.tree.node(node_id).has_children();

    // a node clear of the frustum by half its own size draws coarse
    // instead of recursing; a box straddling the boundary keeps refining
    let mut draw = !has_children
        || dist_rated > size_rated
        || box_size <= ctx.cfg.min_node_size
        || ctx.camera.outside_by(&bounds, box_size * 0.5);

    let level = level + 1;

    if !draw && has_children {
        if ctx.cfg.reduced_update {
            // check one child per frame, round-robin
            let child_id = (ctx.frame % 8) as u8;
            if let Some(child) = ctx.tree.node(node_id).child(child_id) {
                if ctx.tree.node(child).segment.is_some()
                    && !check_ready_for_rendering(ctx, child, level)
                {
                    draw = true;
                }
            }
        } else {
            for child_id in 0..8 {
                if let Some(child) = ctx.tree.node(node_id).child(child_id) {
                    if ctx.tree.node(child).segment.is_some()
                        && !check_ready_for_rendering(ctx, child, level)
                    {
                        // draw this node as a fallback while children stream
                        draw = true;
                    }
                }
            }
        }
    }

    if draw {
        if let Some(seg_id) = ctx.tree.node(node_id).segment {
            if visible {
                emit_proxy(ctx, seg_id);
            }
        }
    } else if has_children {
        // visit children nearest octant first
        let first = bounds.octant_of_point(ctx.camera.position);
        for xor in [0u8, 1, 2, 4, 3, 5, 6, 7] {
            let child_id = first ^ xor;
            if let Some(child) = ctx.tree.node(node_id).child(child_id) {
                render_walk(ctx, child, level);
            }
        }
    }
}

fn emit_proxy(ctx: &mut WalkContext, seg_id: SegmentId) {
    let seg = ctx.tree.segment_mut(seg_id);
    seg.last_rendered_frame = ctx.frame;

    if seg.status != StreamingStatus::Ready || !seg.has_atlas_slot() {
        return;
    }
    if seg.box_size() > ctx.cfg.max_node_size {
        return;
    }
    // bricks with no visible coverage contribute nothing to the proxy pass
    if seg.max_alpha <= 0.05 {
        return;
    }

    ctx.out_vertices.push(seg.proxy_vertex);
    ctx.stats.emitted_vertices += 1;
}

/// Give `seg_id` an atlas slot and push its render data, evicting cold
/// blocks under pressure. Returns false when the atlas stays full; the
/// caller retries on a later frame.
pub fn update_brick_render_data(
    tree: &mut SvoTree,
    packer: &mut BlockPacker,
    backend: &mut dyn RenderBackend,
    seg_id: SegmentId,
    frame: u32,
    cfg: &SvoConfig,
    stats: &mut FrameStats,
) -> bool {
    release_atlas_block(tree, packer, seg_id);

    let crop = tree.segment(seg_id).crop;
    let blocks = |texels: u32| -> u32 { texels.div_ceil(BLOCK_DIM).max(1) };
    let (w, h, d) = (blocks(crop.size.x), blocks(crop.size.y), blocks(crop.size.z));
    let byte_cost = crop.volume() as u32 * 4;

    let horizon = frame.saturating_sub(16);
    let mut block_id: Option<BlockId> = None;

    for _pass in 0..16 {
        if let Some(id) = packer.add_block(w, h, d, seg_id, frame, byte_cost) {
            block_id = Some(id);
            break;
        }

        let victims = packer.select_eviction_candidates(horizon, 4, |owner| {
            let seg = tree.try_segment(owner)?;
            if seg.status == StreamingStatus::InProgress {
                return None;
            }
            let size_weight = (seg.box_size() / cfg.min_node_size) as u32;
            Some(EvictScore {
                weighted_frame: seg.last_rendered_frame + size_weight,
                last_rendered_frame: seg.last_rendered_frame,
                last_tex_update_frame: seg.last_tex_update_frame,
            })
        });

        if victims.is_empty() {
            break;
        }
        for victim in victims {
            let owner = packer.block(victim).expect("live candidate").owner;
            let owner_holds_victim = tree
                .try_segment(owner)
                .map(|s| s.block == Some(victim))
                .unwrap_or(false);
            if owner_holds_victim {
                release_atlas_block(tree, packer, owner);
            } else {
                // stranded block whose segment slot was since reused
                packer.remove_block(victim);
            }
            stats.evicted_blocks += 1;
        }
    }

    let Some(block_id) = block_id else {
        log::trace!("atlas allocation postponed at frame {}", frame);
        return false;
    };

    let block_min = packer.block(block_id).expect("just packed").min;
    let dim_xy = packer.dim_xy();
    let atlas_offset =
        (block_min.z * dim_xy * dim_xy + block_min.y * dim_xy + block_min.x) as i32;

    {
        let node_id = tree.segment(seg_id).node;
        let node = tree.node_mut(node_id);
        node.segment_update_frame = node.segment_update_frame.max(frame + 1);
    }

    let seg = tree.segment_mut(seg_id);
    seg.block = Some(block_id);
    seg.atlas_offset = atlas_offset;
    seg.last_tex_update_frame = frame;
    seg.last_rendered_frame = frame;
    seg.lights_checksum = crate::core::types::IVec3::ZERO;

    // world-space box of the cropped region
    let ws = seg.bounds_ws();
    let box_size = seg.box_size();
    let clip_min = ws.min
        + Vec3::new(crop.min.x as f32, crop.min.y as f32, crop.min.z as f32)
            / BRICK_DIM as f32
            * box_size;
    let clip_max = clip_min
        + Vec3::new(crop.size.x as f32, crop.size.y as f32, crop.size.z as f32)
            / BRICK_DIM as f32
            * box_size;
    seg.clipped_bounds = Aabb::new(clip_min, clip_max);

    // pack the proxy vertex
    let clip_size = seg.clipped_bounds.size();
    let frac = |v: f32| -> u8 { ((v / box_size * 255.0) as i32).clamp(0, 255) as u8 };
    seg.proxy_vertex = ProxyVertex {
        position: clip_min,
        uv: [0.5 + atlas_offset as f32, box_size],
        color: [
            frac(clip_size.x),
            frac(clip_size.y),
            frac(clip_size.z),
            ((seg.max_alpha * 255.0) as i32).clamp(0, 255) as u8,
        ],
    };

    // push voxel channels
    if !crop.is_empty() {
        if let Some(channels) = &tree.segment(seg_id).channels {
            let texel_offset = block_min * BLOCK_DIM;
            for (kind, data) in [
                (BrickChannelKind::Opacity, &*channels.opacity),
                (BrickChannelKind::Normal, &*channels.normal),
                (BrickChannelKind::Albedo, &*channels.albedo),
            ] {
                backend.upload_brick(kind, texel_offset, crop.size, data);
            }
        }
    }

    // push the node metadata record
    let meta = build_node_metadata(tree, seg_id, frame);
    backend.update_node_metadata(block_min, &meta);

    true
}

/// Release a segment's atlas block and flag ancestors for a metadata
/// rewrite. Safe to call when no block is held.
pub fn release_atlas_block(tree: &mut SvoTree, packer: &mut BlockPacker, seg_id: SegmentId) {
    let seg = tree.segment_mut(seg_id);
    if let Some(block) = seg.block.take() {
        packer.remove_block(block);
    }
    seg.atlas_offset = crate::segment::ATLAS_OFFSET_UNALLOCATED;
    seg.lights_checksum = crate::core::types::IVec3::ZERO;

    let node_id = seg.node;
    tree.node_mut(node_id).segment_update_frame = 0;

    propagate_dirty(tree, seg_id);
}

/// A segment gained or lost its atlas slot: the parent (and grandparent)
/// need their metadata rewritten, everyone above an eventual refresh.
pub fn propagate_dirty(tree: &mut SvoTree, seg_id: SegmentId) {
    let Some(parent) = tree.segment(seg_id).parent else {
        return;
    };
    if tree.try_segment(parent).is_none() {
        return;
    }
    tree.segment_mut(parent).child_offsets_dirty = 2;

    let mut cursor = tree.segment(parent).parent;
    let mut first = true;
    while let Some(ancestor) = cursor {
        let Some(seg) = tree.try_segment(ancestor) else {
            break;
        };
        let next = seg.parent;
        let seg = tree.segment_mut(ancestor);
        if first {
            seg.child_offsets_dirty = 2;
            first = false;
        } else {
            seg.child_offsets_dirty = seg.child_offsets_dirty.max(1);
        }
        cursor = next;
    }
}

/// Issue queued atlas/render-data updates under the frame budget.
pub fn process_brick_updates(
    tree: &mut SvoTree,
    packer: &mut BlockPacker,
    backend: &mut dyn RenderBackend,
    brick_updates: &mut BrickUpdateQueues,
    frame: u32,
    cfg: &SvoConfig,
    budget: usize,
    stats: &mut FrameStats,
) {
    let mut updates_done = 0usize;

    for level in 0..BRICK_UPDATE_LEVELS {
        for i in 0..brick_updates[level].len() {
            if updates_done >= budget {
                break;
            }
            let seg_id = brick_updates[level][i];
            let Some(seg) = tree.try_segment(seg_id) else {
                continue; // unloaded since it was queued
            };
            if seg.status != StreamingStatus::Ready {
                continue;
            }

            updates_done += 1;
            let had_slot = seg.has_atlas_slot();
            if !update_brick_render_data(tree, packer, backend, seg_id, frame, cfg, stats) {
                break;
            }
            if !had_slot {
                propagate_dirty(tree, seg_id);
            }
        }
        brick_updates[level].clear();
    }

    stats.brick_updates = updates_done as u32;
}

/// Walk dirty nodes, recompute each child slot's atlas offset and
/// readiness, and rewrite metadata records where required.
pub fn update_node_render_ptrs(
    tree: &mut SvoTree,
    packer: &BlockPacker,
    backend: &mut dyn RenderBackend,
    node_id: NodeId,
    frame: u32,
) {
    let Some(seg_id) = tree.node(node_id).segment else {
        return;
    };
    if !tree.node(node_id).has_children()
        || tree.segment(seg_id).block.is_none()
        || tree.segment(seg_id).child_offsets_dirty == 0
    {
        return;
    }

    let mut child_offsets = [crate::segment::ATLAS_OFFSET_UNALLOCATED; 8];
    let mut ready_mask = 0u8;

    for child_id in 0..8 {
        let Some(child) = tree.node(node_id).child(child_id) else {
            continue;
        };
        let Some(child_seg_id) = tree.node(child).segment else {
            continue;
        };

        update_node_render_ptrs(tree, packer, backend, child, frame);

        let child_seg = tree.segment(child_seg_id);
        if !child_seg.has_atlas_slot() {
            continue;
        }
        child_offsets[child_id as usize] = child_seg.atlas_offset;

        let mut all_grandchildren = 0;
        let mut ready_grandchildren = 0;
        for grandchild_id in 0..8 {
            if let Some(grandchild) = tree.node(child).child(grandchild_id) {
                if let Some(gseg) = tree.node(grandchild).segment {
                    all_grandchildren += 1;
                    if tree.segment(gseg).has_atlas_slot() {
                        ready_grandchildren += 1;
                    }
                }
            }
        }
        if all_grandchildren > 0 && all_grandchildren == ready_grandchildren {
            ready_mask |= 1 << child_id;
        }
    }

    let dirty = {
        let seg = tree.segment_mut(seg_id);
        seg.child_offsets = child_offsets;
        seg.child_ready_mask = ready_mask;
        let dirty = seg.child_offsets_dirty;
        seg.child_offsets_dirty = 0;
        dirty
    };

    if dirty == 2 {
        if let Some(block) = tree.segment(seg_id).block {
            if let Some(block) = packer.block(block) {
                let meta = build_node_metadata(tree, seg_id, frame);
                backend.update_node_metadata(block.min, &meta);
            }
        }
    }
}

/// Assemble the render-facing metadata record for a segment.
pub fn build_node_metadata(tree: &SvoTree, seg_id: SegmentId, frame: u32) -> NodeMetadata {
    let seg = tree.segment(seg_id);

    let parent_offset = seg
        .parent
        .and_then(|p| tree.try_segment(p))
        .filter(|p| p.has_atlas_slot())
        .map(|p| p.atlas_offset);

    let mut children = [ChildRef::default(); 8];
    for (i, child) in children.iter_mut().enumerate() {
        child.atlas_offset = seg.child_offsets[i];
        child.ready = seg.child_ready_mask & (1 << i) != 0;
    }

    NodeMetadata {
        box_min: seg.clipped_bounds.min,
        box_max: seg.clipped_bounds.max,
        node_size: seg.box_size(),
        parent_offset,
        children,
        frame,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::IVec3;
    use crate::render::boundary::RecordingBackend;
    use crate::segment::brick::{crop_to_bounds, texel_index, BrickChannels};
    use crate::segment::pool::BrickBufferPool;

    fn ready_segment(tree: &mut SvoTree, node: NodeId, pool: &std::sync::Arc<BrickBufferPool>) -> SegmentId {
        let seg_id = match tree.node(node).segment {
            Some(s) => s,
            None => tree.allocate_segment(node, IVec3::ZERO),
        };
        let mut channels = BrickChannels::allocate(pool);
        channels.opacity[texel_index(8, 8, 8)] = [255, 255, 255, 1];
        let crop = crop_to_bounds(&mut channels);
        let seg = tree.segment_mut(seg_id);
        seg.channels = Some(channels);
        seg.crop = crop;
        seg.max_alpha = 1.0;
        seg.status = StreamingStatus::Ready;
        seg_id
    }

    fn test_tree() -> SvoTree {
        SvoTree::new(Aabb::new(Vec3::ZERO, Vec3::splat(64.0)))
    }

    #[test]
    fn test_update_brick_render_data_uploads() {
        let pool = BrickBufferPool::new(16);
        let mut tree = test_tree();
        let child = tree.create_child(tree.root(), 0);
        let seg_id = ready_segment(&mut tree, child, &pool);

        let mut packer = BlockPacker::new(8, 8);
        let mut backend = RecordingBackend::default();
        let cfg = SvoConfig::default();
        let mut stats = FrameStats::default();

        assert!(update_brick_render_data(
            &mut tree,
            &mut packer,
            &mut backend,
            seg_id,
            10,
            &cfg,
            &mut stats
        ));

        let seg = tree.segment(seg_id);
        assert!(seg.has_atlas_slot());
        assert_eq!(packer.num_blocks(), 1);

        // three channel uploads plus one metadata record
        assert_eq!(backend.uploads.len(), 3);
        assert_eq!(backend.node_updates.len(), 1);
        let (_, _, size, texels) = backend.uploads[0];
        assert_eq!(size, seg.crop.size);
        assert_eq!(texels, seg.crop.volume());

        // proxy vertex points at the granted slot
        assert_eq!(seg.proxy_vertex.uv[0], 0.5 + seg.atlas_offset as f32);
        assert_eq!(seg.proxy_vertex.uv[1], 32.0);
    }

    #[test]
    fn test_eviction_frees_stale_then_packs() {
        let pool = BrickBufferPool::new(64);
        let mut tree = test_tree();
        let mut packer = BlockPacker::new(1, 1); // room for exactly one 1-block brick
        let mut backend = RecordingBackend::default();
        let cfg = SvoConfig::default();
        let mut stats = FrameStats::default();

        let a = tree.create_child(tree.root(), 0);
        let seg_a = ready_segment(&mut tree, a, &pool);
        assert!(update_brick_render_data(
            &mut tree, &mut packer, &mut backend, seg_a, 10, &cfg, &mut stats
        ));

        // second brick cannot fit until the first is old enough
        let b = tree.create_child(tree.root(), 1);
        let seg_b = ready_segment(&mut tree, b, &pool);
        assert!(!update_brick_render_data(
            &mut tree, &mut packer, &mut backend, seg_b, 12, &cfg, &mut stats
        ));
        assert!(tree.segment(seg_a).has_atlas_slot());

        // far in the future the stale block is evicted
        assert!(update_brick_render_data(
            &mut tree, &mut packer, &mut backend, seg_b, 100, &cfg, &mut stats
        ));
        assert!(!tree.segment(seg_a).has_atlas_slot());
        assert!(tree.segment(seg_b).has_atlas_slot());
        assert_eq!(stats.evicted_blocks, 1);
    }

    #[test]
    fn test_dirty_propagation_levels() {
        let pool = BrickBufferPool::new(16);
        let mut tree = test_tree();

        // chain: root(64) -> a(32) -> b(16) -> c(8), all with segments
        tree.allocate_segment(tree.root(), IVec3::ZERO);
        let a = tree.create_child(tree.root(), 0);
        tree.allocate_segment(a, IVec3::ZERO);
        let b = tree.create_child(a, 0);
        tree.allocate_segment(b, IVec3::ZERO);
        let c = tree.create_child(b, 0);
        let seg_c = ready_segment(&mut tree, c, &pool);

        propagate_dirty(&mut tree, seg_c);

        let seg_of = |t: &SvoTree, n: NodeId| {
            let s = t.node(n).segment.expect("segment");
            t.segment(s).child_offsets_dirty
        };
        assert_eq!(seg_of(&tree, b), 2, "parent rewrites its record");
        assert_eq!(seg_of(&tree, a), 2, "grandparent rewrites its record");
        assert_eq!(seg_of(&tree, tree.root()), 1, "ancestors refresh eventually");
    }

    #[test]
    fn test_check_ready_buckets_by_level_and_distance() {
        let mut tree = test_tree();
        let far = tree.create_child(tree.root(), 0); // box [0,32)^3
        tree.allocate_segment(far, IVec3::ZERO);

        let mut queues = new_streaming_queues();
        let mut brick_updates = new_brick_update_queues();
        let cfg = SvoConfig::default();
        let sources = SceneSources::empty();
        let mut verts = Vec::new();
        let mut stats = FrameStats::default();

        // camera ~3 box-sizes away from the child box
        let mut ctx = WalkContext {
            tree: &mut tree,
            queues: &mut queues,
            brick_updates: &mut brick_updates,
            camera: Camera::at(Vec3::new(32.0 + 96.0, 16.0, 16.0)),
            cfg: &cfg,
            sources: &sources,
            frame: 5,
            stream_cap: 8,
            brick_update_cap: 8,
            out_vertices: &mut verts,
            stats: &mut stats,
        };

        assert!(!check_ready_for_rendering(&mut ctx, far, 1));
        assert_eq!(queues[1][3].len(), 1, "level 1, distance bucket 96/32");
    }

    #[test]
    fn test_check_ready_respects_bucket_cap() {
        let mut tree = test_tree();
        let mut seg_nodes = Vec::new();
        for child_id in 0..4 {
            let child = tree.create_child(tree.root(), child_id);
            tree.allocate_segment(child, IVec3::ZERO);
            seg_nodes.push(child);
        }

        let mut queues = new_streaming_queues();
        let mut brick_updates = new_brick_update_queues();
        let cfg = SvoConfig::default();
        let sources = SceneSources::empty();
        let mut verts = Vec::new();
        let mut stats = FrameStats::default();
        let mut ctx = WalkContext {
            tree: &mut tree,
            queues: &mut queues,
            brick_updates: &mut brick_updates,
            camera: Camera::at(Vec3::splat(16.0)),
            cfg: &cfg,
            sources: &sources,
            frame: 5,
            stream_cap: 2,
            brick_update_cap: 8,
            out_vertices: &mut verts,
            stats: &mut stats,
        };

        for node in seg_nodes {
            check_ready_for_rendering(&mut ctx, node, 1);
        }
        let queued: usize = queues.iter().flatten().map(|q| q.len()).sum();
        assert_eq!(queued, 2, "bucket cap limits queued requests");
    }

    #[test]
    fn test_render_walk_emits_ready_nodes() {
        let pool = BrickBufferPool::new(16);
        let mut tree = test_tree();
        let root = tree.root();
        let seg_id = ready_segment(&mut tree, root, &pool);

        let mut packer = BlockPacker::new(8, 8);
        let mut backend = RecordingBackend::default();
        let cfg = SvoConfig::default();
        let mut stats = FrameStats::default();
        assert!(update_brick_render_data(
            &mut tree, &mut packer, &mut backend, seg_id, 3, &cfg, &mut stats
        ));

        // make the root drawable despite its size for this test
        let mut cfg = SvoConfig::default();
        cfg.max_node_size = 64.0;
        cfg.max_area_size = 64.0;

        let mut queues = new_streaming_queues();
        let mut brick_updates = new_brick_update_queues();
        let sources = SceneSources::empty();
        let mut verts = Vec::new();
        let mut stats = FrameStats::default();
        let root = tree.root();
        let mut ctx = WalkContext {
            tree: &mut tree,
            queues: &mut queues,
            brick_updates: &mut brick_updates,
            camera: Camera::at(Vec3::splat(200.0)),
            cfg: &cfg,
            sources: &sources,
            frame: 4,
            stream_cap: 8,
            brick_update_cap: 8,
            out_vertices: &mut verts,
            stats: &mut stats,
        };
        render_walk(&mut ctx, root, 0);

        assert_eq!(verts.len(), 1);
        assert_eq!(stats.emitted_vertices, 1);
    }

    #[test]
    fn test_frustum_outside_distance() {
        let vp = Mat4::perspective_rh(60f32.to_radians(), 1.0, 0.1, 100.0)
            * Mat4::look_at_rh(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO, Vec3::Y);
        let frustum = Frustum::from_view_projection(&vp);

        let visible = Aabb::new(Vec3::splat(-1.0), Vec3::splat(1.0));
        assert_eq!(frustum.outside_distance(&visible), 0.0);
        assert!(frustum.intersects_aabb(&visible));

        // box behind the camera: clearance grows with depth past the near plane
        let behind = Aabb::new(Vec3::new(-1.0, -1.0, 8.0), Vec3::new(1.0, 1.0, 10.0));
        assert!(frustum.outside_distance(&behind) > 2.0);
        assert!(!frustum.intersects_aabb(&behind));
    }

    #[test]
    fn test_out_of_frustum_node_draws_itself() {
        let pool = BrickBufferPool::new(16);
        let mut tree = test_tree();
        let root = tree.root();
        let root_seg = ready_segment(&mut tree, root, &pool);

        let mut packer = BlockPacker::new(8, 8);
        let mut backend = RecordingBackend::default();
        let cfg0 = SvoConfig::default();
        let mut stats = FrameStats::default();
        assert!(update_brick_render_data(
            &mut tree, &mut packer, &mut backend, root_seg, 3, &cfg0, &mut stats
        ));

        // a not-loaded child the walk would queue for streaming if it recursed
        let child = tree.create_child(tree.root(), 0);
        tree.allocate_segment(child, IVec3::ZERO);

        let mut cfg = SvoConfig::default();
        cfg.lod_ratio = 2.0; // keep the root recursion-eligible at this range
        cfg.max_node_size = 64.0;
        cfg.max_area_size = 64.0;

        let eye = Vec3::new(140.0, 32.0, 32.0);
        let proj = Mat4::perspective_rh(60f32.to_radians(), 1.0, 0.1, 1000.0);
        let away = proj * Mat4::look_at_rh(eye, Vec3::new(300.0, 32.0, 32.0), Vec3::Y);
        let toward = proj * Mat4::look_at_rh(eye, Vec3::new(32.0, 32.0, 32.0), Vec3::Y);

        let walk = |tree: &mut SvoTree, camera: Camera| {
            let mut queues = new_streaming_queues();
            let mut brick_updates = new_brick_update_queues();
            let sources = SceneSources::empty();
            let mut verts = Vec::new();
            let mut stats = FrameStats::default();
            let root = tree.root();
            let mut ctx = WalkContext {
                tree,
                queues: &mut queues,
                brick_updates: &mut brick_updates,
                camera,
                cfg: &cfg,
                sources: &sources,
                frame: 4,
                stream_cap: 8,
                brick_update_cap: 8,
                out_vertices: &mut verts,
                stats: &mut stats,
            };
            render_walk(&mut ctx, root, 0);
            let queued: usize = queues.iter().flatten().map(|q| q.len()).sum();
            (verts, queued)
        };

        // whole tree behind the camera: the root draws itself, never visits
        // the child, and the emit gate suppresses its proxy vertex
        let camera = Camera {
            position: eye,
            frustum: Some(Frustum::from_view_projection(&away)),
        };
        let (verts, queued) = walk(&mut tree, camera);
        assert!(verts.is_empty(), "no proxy vertex for a culled node");
        assert_eq!(queued, 0, "recursion must stop at the culled node");

        // same camera turned toward the box: the walk recurses, queues the
        // not-ready child, and falls back to drawing the root
        let camera = Camera {
            position: eye,
            frustum: Some(Frustum::from_view_projection(&toward)),
        };
        let (verts, queued) = walk(&mut tree, camera);
        assert_eq!(queued, 1, "the not-loaded child is queued for streaming");
        assert_eq!(verts.len(), 1, "fallback draw emits the root proxy");
    }

    #[test]
    fn test_update_node_render_ptrs_writes_offsets() {
        let pool = BrickBufferPool::new(32);
        let mut tree = test_tree();
        let mut packer = BlockPacker::new(8, 8);
        let mut backend = RecordingBackend::default();
        let cfg = SvoConfig::default();
        let mut stats = FrameStats::default();

        let root = tree.root();
        let root_seg = ready_segment(&mut tree, root, &pool);
        let child = tree.create_child(tree.root(), 3);
        let child_seg = ready_segment(&mut tree, child, &pool);

        for seg in [root_seg, child_seg] {
            assert!(update_brick_render_data(
                &mut tree, &mut packer, &mut backend, seg, 5, &cfg, &mut stats
            ));
        }
        propagate_dirty(&mut tree, child_seg);
        assert_eq!(tree.segment(root_seg).child_offsets_dirty, 2);

        backend.node_updates.clear();
        let root = tree.root();
        update_node_render_ptrs(&mut tree, &packer, &mut backend, root, 6);

        assert_eq!(tree.segment(root_seg).child_offsets_dirty, 0);
        let offsets = tree.segment(root_seg).child_offsets;
        assert_eq!(offsets[3], tree.segment(child_seg).atlas_offset);
        assert!(offsets[3] >= 0);
        // child has no grandchildren with slots: not marked fully ready
        assert_eq!(tree.segment(root_seg).child_ready_mask, 0);

        assert_eq!(backend.node_updates.len(), 1);
        let (_, meta) = &backend.node_updates[0];
        assert_eq!(meta.children[3].atlas_offset, offsets[3]);
        assert!(!meta.children[3].ready);
    }
}
