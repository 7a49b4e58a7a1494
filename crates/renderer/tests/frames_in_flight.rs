//! Integration tests for the frame cycler and per-slot background geometry.

use std::sync::Arc;
use std::time::Duration;

use frameslot_renderer::{
    BackgroundRenderer, FrameContext, FrameCycler, FrameOutcome, RenderResult, SlotState,
};
use frameslot_rhi::headless::{HeadlessDevice, HeadlessSwapchain};
use frameslot_rhi::texture::Texture;
use frameslot_rhi::{Extent2D, PixelFormat, TextureDesc, TextureHandle};

fn clear(frame: &FrameContext<'_, HeadlessDevice>) -> RenderResult<()> {
    frame.commands.clear([0.0, 0.0, 0.0, 1.0])?;
    Ok(())
}

fn draw_background(
    cycler: &mut FrameCycler<HeadlessDevice>,
    swapchain: &mut HeadlessSwapchain,
    background: &mut BackgroundRenderer<HeadlessDevice>,
    camera: TextureHandle,
    frames: usize,
) -> Vec<FrameOutcome> {
    let mut renderer = |frame: &FrameContext<'_, HeadlessDevice>| -> RenderResult<()> {
        frame.commands.clear([0.0, 0.0, 0.0, 1.0])?;
        background.draw(frame, camera)
    };
    (0..frames)
        .map(|_| cycler.draw_frame(&mut *swapchain, &mut renderer).unwrap())
        .collect()
}

#[test]
fn test_submitted_frames_never_exceed_depth() {
    let device = Arc::new(HeadlessDevice::new());
    let mut swapchain = HeadlessSwapchain::new(device.clone(), Extent2D::new(8, 8), 4).unwrap();
    let mut cycler = FrameCycler::with_depth(device.clone(), 2, Duration::from_millis(100)).unwrap();
    let mut renderer = clear;

    cycler.draw_frame(&mut swapchain, &mut renderer).unwrap();
    cycler.draw_frame(&mut swapchain, &mut renderer).unwrap();
    assert_eq!(cycler.frames_in_progress(), 2);
    assert_eq!(device.stats().blocking_waits, 0);
    assert_eq!(device.stats().completed_submissions, 0);

    // The third frame reuses slot 0 and must wait for its first use
    cycler.draw_frame(&mut swapchain, &mut renderer).unwrap();
    assert_eq!(device.stats().blocking_waits, 1);
    assert!(device.stats().completed_submissions >= 1);
    assert_eq!(cycler.frames_in_progress(), 2);
    assert_eq!(cycler.slot_state(0).unwrap(), SlotState::Submitted);

    for _ in 0..20 {
        cycler.draw_frame(&mut swapchain, &mut renderer).unwrap();
        let stats = device.stats();
        assert!(stats.submissions - stats.completed_submissions <= 2);
        assert!(cycler.frames_in_progress() <= 2);
    }
    assert_eq!(device.stats().semaphore_misuse, 0);
}

#[test]
fn test_frames_present_in_order() {
    let device = Arc::new(HeadlessDevice::new());
    let mut swapchain = HeadlessSwapchain::new(device.clone(), Extent2D::new(8, 8), 3).unwrap();
    let mut cycler = FrameCycler::with_depth(device.clone(), 2, Duration::from_millis(100)).unwrap();
    let mut renderer = clear;

    for _ in 0..6 {
        cycler.draw_frame(&mut swapchain, &mut renderer).unwrap();
    }
    cycler.wait_all().unwrap();
    device.flush();

    assert_eq!(swapchain.presented(), vec![0, 1, 2, 0, 1, 2]);
    assert_eq!(cycler.stats().frames_drawn, 6);
}

#[test]
fn test_background_geometry_refreshes_each_slot_once() {
    let device = Arc::new(HeadlessDevice::new());
    let camera = Texture::new_with_data(
        device.clone(),
        TextureDesc::new(4, 4, PixelFormat::R8),
        &[100; 16],
    )
    .unwrap();
    let mut swapchain = HeadlessSwapchain::new(device.clone(), Extent2D::new(8, 8), 4).unwrap();
    let mut cycler = FrameCycler::with_depth(device.clone(), 3, Duration::from_millis(100)).unwrap();
    let mut background = BackgroundRenderer::new(device.clone(), 3).unwrap();

    draw_background(&mut cycler, &mut swapchain, &mut background, camera.handle(), 3);
    assert_eq!(background.refresh_count(), 3);

    draw_background(&mut cycler, &mut swapchain, &mut background, camera.handle(), 6);
    assert_eq!(background.refresh_count(), 3);

    // A skipped frame in the middle does not leave a slot stale
    background.update_geometry([[1.0, 0.0], [0.0, 0.0], [1.0, 1.0], [0.0, 1.0]]);
    draw_background(&mut cycler, &mut swapchain, &mut background, camera.handle(), 1);
    swapchain.invalidate();
    let outcomes = draw_background(&mut cycler, &mut swapchain, &mut background, camera.handle(), 3);
    assert!(matches!(outcomes[0], FrameOutcome::Skipped { .. }));
    assert_eq!(background.refresh_count(), 6);
    assert_eq!(background.geometry().stale_slots(), 0);
}

#[test]
fn test_background_fills_swapchain_image() {
    let device = Arc::new(HeadlessDevice::new());
    let camera = Texture::new_with_data(
        device.clone(),
        TextureDesc::new(4, 4, PixelFormat::R8),
        &[100; 16],
    )
    .unwrap();
    let mut swapchain = HeadlessSwapchain::new(device.clone(), Extent2D::new(8, 8), 3).unwrap();
    let mut cycler = FrameCycler::with_depth(device.clone(), 2, Duration::from_millis(100)).unwrap();
    let mut background = BackgroundRenderer::new(device.clone(), 2).unwrap();

    let outcomes = draw_background(&mut cycler, &mut swapchain, &mut background, camera.handle(), 1);
    let FrameOutcome::Presented { image_index, .. } = outcomes[0] else {
        panic!("frame skipped");
    };
    cycler.wait_all().unwrap();

    let image = swapchain.image(image_index).unwrap();
    let pixels = device.read_texture(image.handle()).unwrap();
    assert_eq!(pixels.len(), 8 * 8 * 4);
    assert!(pixels.chunks_exact(4).all(|p| p == [100, 100, 100, 255]));
}
