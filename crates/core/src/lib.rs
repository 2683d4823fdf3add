//! Core crate for krafity storyboard orchestration.

pub mod angle;
pub mod canvas;
pub mod config;
pub mod graph;
pub mod jobs;
pub mod logging;
pub mod media;
pub mod merge;
pub mod rotator;
pub mod session;
pub mod types;
