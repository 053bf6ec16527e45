//! 3D bin packer for the voxel brick atlas.
//!
//! Packs variable-size blocks into a fixed block grid with first-fit
//! placement. Eviction candidate selection prefers old, small bricks:
//! larger bricks cost more to rebuild so their effective age is reduced by
//! a size-derived weight.

use crate::core::types::UVec3;
use crate::svo::arena::SegmentId;

/// Atlas block granularity in texels per axis.
pub const BLOCK_DIM: u32 = 8;

/// Handle to a live atlas block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlockId(pub u32);

/// One packed block.
#[derive(Clone, Copy, Debug)]
pub struct AtlasBlock {
    /// Min corner in block units.
    pub min: UVec3,
    /// Extent in block units.
    pub size: UVec3,
    pub owner: SegmentId,
    pub last_visible_frame: u32,
    pub byte_cost: u32,
}

impl AtlasBlock {
    pub fn volume(&self) -> u32 {
        self.size.x * self.size.y * self.size.z
    }
}

/// Eviction scoring input for one block owner.
#[derive(Clone, Copy, Debug)]
pub struct EvictScore {
    /// Owner's last-rendered frame plus its size weight.
    pub weighted_frame: u32,
    pub last_rendered_frame: u32,
    pub last_tex_update_frame: u32,
}

/// Capacity-bounded 3D block packer.
pub struct BlockPacker {
    dim_xy: u32,
    dim_z: u32,
    /// Occupancy per grid cell.
    grid: Vec<bool>,
    blocks: Vec<Option<AtlasBlock>>,
    free_ids: Vec<u32>,
    live: usize,
    used_volume: u32,
}

impl BlockPacker {
    pub fn new(dim_xy: u32, dim_z: u32) -> Self {
        Self {
            dim_xy,
            dim_z,
            grid: vec![false; (dim_xy * dim_xy * dim_z) as usize],
            blocks: Vec::new(),
            free_ids: Vec::new(),
            live: 0,
            used_volume: 0,
        }
    }

    pub fn dim_xy(&self) -> u32 {
        self.dim_xy
    }

    pub fn dim_z(&self) -> u32 {
        self.dim_z
    }

    pub fn num_blocks(&self) -> usize {
        self.live
    }

    pub fn capacity_volume(&self) -> u32 {
        self.dim_xy * self.dim_xy * self.dim_z
    }

    pub fn used_volume(&self) -> u32 {
        self.used_volume
    }

    pub fn block(&self, id: BlockId) -> Option<&AtlasBlock> {
        self.blocks.get(id.0 as usize).and_then(|b| b.as_ref())
    }

    /// Iterate live blocks.
    pub fn iter(&self) -> impl Iterator<Item = (BlockId, &AtlasBlock)> {
        self.blocks
            .iter()
            .enumerate()
            .filter_map(|(i, b)| b.as_ref().map(|b| (BlockId(i as u32), b)))
    }

    fn cell(&self, x: u32, y: u32, z: u32) -> usize {
        (z * self.dim_xy * self.dim_xy + y * self.dim_xy + x) as usize
    }

    fn region_free(&self, min: UVec3, size: UVec3) -> bool {
        for z in min.z..min.z + size.z {
            for y in min.y..min.y + size.y {
                for x in min.x..min.x + size.x {
                    if self.grid[self.cell(x, y, z)] {
                        return false;
                    }
                }
            }
        }
        true
    }

    fn mark_region(&mut self, min: UVec3, size: UVec3, occupied: bool) {
        for z in min.z..min.z + size.z {
            for y in min.y..min.y + size.y {
                for x in min.x..min.x + size.x {
                    let cell = self.cell(x, y, z);
                    debug_assert_ne!(self.grid[cell], occupied);
                    self.grid[cell] = occupied;
                }
            }
        }
    }

    /// First-fit placement. Returns `None` when no gap fits; the caller
    /// runs an eviction pass and retries (normal backpressure, not an
    /// error).
    pub fn add_block(
        &mut self,
        w: u32,
        h: u32,
        d: u32,
        owner: SegmentId,
        frame: u32,
        byte_cost: u32,
    ) -> Option<BlockId> {
        debug_assert!(w >= 1 && h >= 1 && d >= 1);
        if w > self.dim_xy || h > self.dim_xy || d > self.dim_z {
            return None;
        }
        let size = UVec3::new(w, h, d);

        for z in 0..=self.dim_z - d {
            for y in 0..=self.dim_xy - h {
                for x in 0..=self.dim_xy - w {
                    let min = UVec3::new(x, y, z);
                    if !self.region_free(min, size) {
                        continue;
                    }

                    self.mark_region(min, size, true);
                    let block = AtlasBlock {
                        min,
                        size,
                        owner,
                        last_visible_frame: frame,
                        byte_cost,
                    };
                    let id = match self.free_ids.pop() {
                        Some(slot) => {
                            self.blocks[slot as usize] = Some(block);
                            slot
                        }
                        None => {
                            self.blocks.push(Some(block));
                            (self.blocks.len() - 1) as u32
                        }
                    };
                    self.live += 1;
                    self.used_volume += w * h * d;
                    return Some(BlockId(id));
                }
            }
        }

        None
    }

    /// Release a block and its grid cells.
    pub fn remove_block(&mut self, id: BlockId) {
        let Some(block) = self.blocks.get_mut(id.0 as usize).and_then(|b| b.take()) else {
            return;
        };
        self.mark_region(block.min, block.size, false);
        self.free_ids.push(id.0);
        self.live -= 1;
        self.used_volume -= block.volume();
    }

    /// Pick up to `max` eviction victims among blocks last visible before
    /// `max_allowed_frame`.
    ///
    /// `score` returns the owner's eviction score, or `None` for owners
    /// that must not be evicted (mid-stream). Owners must also not have
    /// been rendered or texture-updated since `max_allowed_frame`; each
    /// considered block refreshes its visibility stamp from the owner.
    pub fn select_eviction_candidates(
        &mut self,
        max_allowed_frame: u32,
        max: usize,
        mut score: impl FnMut(SegmentId) -> Option<EvictScore>,
    ) -> Vec<BlockId> {
        let mut slots: Vec<(BlockId, u32)> = Vec::with_capacity(max);

        for i in 0..self.blocks.len() {
            let Some(block) = &self.blocks[i] else { continue };
            if block.last_visible_frame >= max_allowed_frame {
                continue;
            }
            let Some(s) = score(block.owner) else { continue };

            let block = self.blocks[i].as_mut().expect("checked above");
            block.last_visible_frame = s.last_rendered_frame;

            if s.last_rendered_frame >= max_allowed_frame
                || s.last_tex_update_frame >= max_allowed_frame
            {
                continue;
            }

            let id = BlockId(i as u32);
            if slots.len() < max {
                slots.push((id, s.weighted_frame));
            } else {
                let mut newest = 0;
                for (k, slot) in slots.iter().enumerate() {
                    if slot.1 > slots[newest].1 {
                        newest = k;
                    }
                }
                if s.weighted_frame < slots[newest].1 {
                    slots[newest] = (id, s.weighted_frame);
                }
            }
        }

        slots.into_iter().map(|(id, _)| id).collect()
    }
}
