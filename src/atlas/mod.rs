//! Fixed-capacity 3D texture atlas allocation

pub mod packer;

pub use packer::{AtlasBlock, BlockId, BlockPacker, EvictScore, BLOCK_DIM};
