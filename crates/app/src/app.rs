//! Demo application state and render loop.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use frameslot_core::{Config, FrameTimer};
use frameslot_renderer::edge::EDGE;
use frameslot_renderer::{
    BackgroundRenderer, CpuImage, EdgeDetector, FrameContext, FrameCycler, FrameOutcome,
    ReadbackPipeline, ReaderConfig, RenderResult,
};
use frameslot_resources::FsAssetLoader;
use frameslot_rhi::headless::{HeadlessDevice, HeadlessSwapchain};
use frameslot_rhi::{PixelFormat, TexCoordRect};
use frameslot_session::{ArFrame, ArSession, SyntheticSession};

/// Frames between two progress reports.
const REPORT_INTERVAL: u64 = 60;

/// Application state.
///
/// Fields drop in declaration order: the cycler and the readback pipeline
/// wait for the device to go idle before the camera texture and swapchain
/// they reference are destroyed.
pub struct App {
    cycler: FrameCycler<HeadlessDevice>,
    pipeline: ReadbackPipeline<HeadlessDevice>,
    background: BackgroundRenderer<HeadlessDevice>,
    session: SyntheticSession<HeadlessDevice>,
    swapchain: HeadlessSwapchain,
    device: Arc<HeadlessDevice>,
    edges: Option<EdgeDetector>,
    edge_image: CpuImage,
    edge_pixels: usize,
    harvested: u64,
    timer: FrameTimer,
}

impl App {
    pub fn new(config: &Config) -> Result<Self> {
        let device = Arc::new(HeadlessDevice::new());

        let session = SyntheticSession::new(device.clone(), &config.session, &FsAssetLoader::default())
            .context("Failed to start camera session")?;
        let swapchain = HeadlessSwapchain::new(
            device.clone(),
            session.display_extent(),
            config.app.swapchain_images,
        )?;

        let cycler = FrameCycler::new(device.clone(), &config.frames)?;
        let background = BackgroundRenderer::new(device.clone(), cycler.frames_in_flight())?;

        let reader_config = ReaderConfig::from(&config.readback);
        let edges = if reader_config.format == PixelFormat::R8 {
            Some(EdgeDetector::new())
        } else {
            warn!("Readback format is {:?}, edge detection disabled", reader_config.format);
            None
        };
        let edge_image = CpuImage::new(reader_config.extent(), PixelFormat::R8);
        let pipeline = ReadbackPipeline::new(device.clone(), reader_config)?;

        info!(
            "Initialized: camera {}x{}, display {}x{}, {} frames in flight",
            session.camera_extent().width,
            session.camera_extent().height,
            session.display_extent().width,
            session.display_extent().height,
            cycler.frames_in_flight()
        );

        Ok(Self {
            cycler,
            pipeline,
            background,
            session,
            swapchain,
            device,
            edges,
            edge_image,
            edge_pixels: 0,
            harvested: 0,
            timer: FrameTimer::new(),
        })
    }

    /// Draws `frames` frames, then waits for all outstanding work.
    pub fn run(&mut self, frames: u64) -> Result<()> {
        for number in 0..frames {
            self.frame().with_context(|| format!("Frame {} failed", number))?;

            self.timer.next_frame();
            if (number + 1) % REPORT_INTERVAL == 0 {
                info!(
                    "Frame {}: {:.1} fps, {} edge pixels",
                    number + 1,
                    self.timer.smoothed_frame_rate(),
                    self.edge_pixels
                );
            }
        }

        self.cycler.wait_all()?;
        // Collect the last read-back so its slot is free again
        self.harvest()?;
        Ok(())
    }

    fn frame(&mut self) -> Result<()> {
        let frame = self.session.update()?;
        if frame.display_geometry_changed() {
            let uvs = frame.transform_uv(&TexCoordRect::FULL.corners());
            debug!("Display geometry changed, new uvs {:?}", uvs);
            self.background.update_geometry(uvs);
        }

        let camera = frame.camera_texture();
        let background = &mut self.background;
        let mut renderer = |ctx: &FrameContext<'_, HeadlessDevice>| -> RenderResult<()> {
            ctx.commands.clear([0.0, 0.0, 0.0, 1.0])?;
            background.draw(ctx, camera)
        };
        if let FrameOutcome::Skipped { slot } =
            self.cycler.draw_frame(&mut self.swapchain, &mut renderer)?
        {
            debug!("Frame skipped on slot {}", slot);
        }

        // Edges of the previous camera frame, then read back the current one
        let edges = self.edges;
        let output = &mut self.edge_image;
        let detected = self.pipeline.process(camera, frame.camera_extent(), |image| {
            edges.map(|detector| detector.detect(image, output))
        })?;
        if let Some(result) = detected {
            self.harvested += 1;
            if result.transpose()?.is_some() {
                self.edge_pixels = self.edge_image.pixels().iter().filter(|&&p| p == EDGE).count();
            }
        }
        Ok(())
    }

    fn harvest(&mut self) -> Result<()> {
        let edges = self.edges;
        let output = &mut self.edge_image;
        if let Some(result) = self
            .pipeline
            .harvest(|image| edges.map(|detector| detector.detect(image, output)))?
        {
            self.harvested += 1;
            result.transpose()?;
        }
        Ok(())
    }

    /// Logs frame and device counters.
    pub fn report(&self) {
        let stats = self.cycler.stats();
        info!(
            "Drew {} frames ({} skipped, {} suboptimal), harvested {} read-backs",
            stats.frames_drawn, stats.frames_skipped, stats.suboptimal, self.harvested
        );
        info!("Device: {:?}", self.device.stats());
    }
}
