//! Background streaming of brick data

pub mod engine;

pub use engine::{StreamEngine, StreamEngineConfig, StreamJob, StreamOutcome, StreamResult};
