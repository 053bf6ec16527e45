//! Render-facing boundary and the per-frame tree/render sync engine

pub mod boundary;
pub mod sync;

pub use boundary::{
    atlas_coord, BrickChannelKind, ChildRef, NodeMetadata, NullBackend, RecordingBackend,
    RenderBackend,
};
pub use sync::{Camera, FrameStats, Frustum};
