//! Core utilities shared by the frameslot crates.
//!
//! This crate provides foundational types used across the workspace:
//! - Error types and result aliases
//! - Logging initialization
//! - Smoothed frame timing
//! - Configuration loading

mod config;
mod error;
mod logging;
mod timer;

pub use config::{
    AppSettings, Config, FrameSettings, ImageFormat, LoggingSettings, ReadbackSettings,
    SessionSettings,
};
pub use error::{Error, Result};
pub use logging::{init_logging, init_logging_with};
pub use timer::FrameTimer;
