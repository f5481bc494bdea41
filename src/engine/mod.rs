//! Control surface: the engine actor and its async handle.
//!
//! All engine state lives inside a single actor task; the rest of the
//! process talks to it through [`EngineHandle`], which serializes
//! operations over a command channel. Status events flow the other way
//! on a broadcast channel.

pub mod actor;
pub mod commands;
pub mod core;
pub mod handle;

pub use actor::spawn_engine;
pub use commands::{
    EngineCommand, FileSummary, SessionSnapshot, StatusUpdate, StreamTarget, TorrentCatalog,
};
pub use core::StreamEngine;
pub use handle::EngineHandle;
