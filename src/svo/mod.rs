//! Sparse voxel octree: arena storage, nodes, tree operations, persistence

pub mod arena;
pub mod node;
pub mod persist;
pub mod tree;

pub use arena::{Arena, NodeId, SegmentId};
pub use node::SvoNode;
pub use persist::TextureFormat;
pub use tree::SvoTree;
