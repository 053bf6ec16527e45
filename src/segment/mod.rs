//! Per-node voxel payload: brick channels, the pooled buffer allocator,
//! the super-mesh triangle accumulator, and CPU voxelization.

pub mod brick;
pub mod pool;
pub mod segment;
pub mod supermesh;
pub mod voxelize;

pub use brick::{BrickChannels, CropInfo, Texel, BRICK_DIM, BRICK_VOXELS};
pub use pool::{BrickBufferPool, PooledBrick};
pub use segment::{BrickPayload, ProxyVertex, Segment, StreamingStatus, ATLAS_OFFSET_UNALLOCATED};
pub use supermesh::{HitObjectType, HitTriangle, HitVertex, RawTriangle, SuperMesh};
pub use voxelize::{BuildOutput, MeshShare, VoxelizeConfig, VoxelizeJob, VoxelizeParams};
