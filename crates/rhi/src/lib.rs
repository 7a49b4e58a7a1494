//! Render Hardware Interface for the frameslot crates.
//!
//! The frame-resource pools in `frameslot-renderer` are written against the
//! [`GpuDevice`] and [`PresentTarget`] traits defined here. This crate provides:
//! - Typed resource handles and pixel formats
//! - The device and presentation traits
//! - RAII wrappers that destroy their handle on drop
//! - A scoped [`BindGuard`] for the device's global bind state
//! - A software [`headless`] backend used by tests and the demo
//! - A Vulkan backend behind the `vulkan` feature

mod error;

pub mod bind;
pub mod buffer;
pub mod command;
pub mod device;
pub mod format;
pub mod handle;
pub mod headless;
pub mod sync;
pub mod texture;

#[cfg(feature = "vulkan")]
pub mod vulkan;

pub use bind::BindGuard;
pub use device::{
    AcquiredImage, BindState, BufferUsage, GpuDevice, MappedRange, PresentTarget, Submission,
    TextureDesc,
};
pub use error::{RhiError, RhiResult};
pub use format::{Extent2D, PixelFormat, QuadVertex, Rect, TexCoordRect, Viewport};
pub use handle::{
    BufferHandle, CommandBufferHandle, FenceHandle, FramebufferHandle, SemaphoreHandle,
    TextureHandle,
};

// Re-export ash types that users of the Vulkan backend might need
#[cfg(feature = "vulkan")]
pub use ash::vk;
