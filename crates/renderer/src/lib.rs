//! Frame-resource slot pools.
//!
//! This crate pipelines GPU work across frames with fixed pools of reusable
//! slots, each tracked as free, submitted or acquired:
//! - [`TextureReader`] reads textures back into host memory
//! - [`ReadbackPipeline`] keeps one readback in flight per frame
//! - [`FrameCycler`] drives frames in flight through a swapchain
//! - [`BackgroundRenderer`] draws the camera image with per-slot geometry
//! - [`EdgeDetector`] processes harvested images on the CPU

pub mod background;
pub mod crop;
pub mod cycler;
pub mod edge;
pub mod error;
pub mod geometry;
pub mod image;
pub mod pipeline;
pub mod pool;
pub mod readback;

pub use background::BackgroundRenderer;
pub use crop::{Crop, CropPolicy};
pub use cycler::{CyclerStats, FrameContext, FrameCycler, FrameOutcome, FrameRenderer};
pub use edge::EdgeDetector;
pub use error::{RenderError, RenderResult};
pub use geometry::GeometryCache;
pub use image::{CpuImage, ReadbackImage};
pub use pipeline::ReadbackPipeline;
pub use pool::{SlotPool, SlotState};
pub use readback::{ReaderConfig, TextureReader};
