//! Frameslot demo - main entry point
//!
//! Runs the computer-vision render loop on the headless device: a synthetic
//! camera feed is drawn as the background with several frames in flight,
//! and every frame the camera image is read back at low resolution for edge
//! detection on the CPU.

mod app;

use anyhow::{Context, Result};
use tracing::info;

use frameslot_core::Config;

use crate::app::App;

fn main() -> Result<()> {
    // An explicit path must exist and parse; the default file is optional
    let config = match std::env::args_os().nth(1) {
        Some(path) => Config::load_from_path(&path)
            .with_context(|| format!("Failed to load config {:?}", path))?,
        None => Config::load(),
    };

    frameslot_core::init_logging_with(&config.logging.filter);
    info!("Starting frameslot demo");

    let mut app = App::new(&config).context("Failed to initialize")?;
    app.run(config.app.frames)?;
    app.report();

    Ok(())
}
