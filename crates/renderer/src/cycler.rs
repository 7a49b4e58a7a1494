//! Frames-in-flight render loop.
//!
//! This module provides the [`FrameCycler`], which drives a fixed number of
//! frame slots through acquire, record, submit and present so the CPU can
//! record frame N+1 while the GPU still works on frame N.
//!
//! # Overview
//!
//! Each slot owns a command buffer and a [`FrameSync`]. One call to
//! [`FrameCycler::draw_frame`] runs one slot through:
//!
//! 1. **Wait** for the slot's fence, bounding the overlap to N frames
//! 2. **Acquire** a swapchain image, skipping the frame if the surface is
//!    out of date
//! 3. **Record** through a [`FrameRenderer`], inside a [`BindGuard`]
//! 4. **Submit**, after resetting the slot's fence
//! 5. **Present**
//! 6. **Advance** to the next slot
//!
//! Slots are only reused after their own fence signals. Nothing assumes that
//! slots complete in submission order.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use frameslot_core::FrameSettings;
//! use frameslot_renderer::{FrameContext, FrameCycler, RenderResult};
//! use frameslot_rhi::headless::{HeadlessDevice, HeadlessSwapchain};
//! use frameslot_rhi::Extent2D;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let device = Arc::new(HeadlessDevice::new());
//! let mut swapchain = HeadlessSwapchain::new(device.clone(), Extent2D::new(64, 64), 3)?;
//! let mut cycler = FrameCycler::new(device, &FrameSettings::default())?;
//!
//! let mut clear = |frame: &FrameContext<'_, HeadlessDevice>| -> RenderResult<()> {
//!     frame.commands.clear([0.1, 0.2, 0.3, 1.0])?;
//!     Ok(())
//! };
//! for _ in 0..8 {
//!     cycler.draw_frame(&mut swapchain, &mut clear)?;
//! }
//! assert_eq!(cycler.stats().frames_drawn, 8);
//! # Ok(())
//! # }
//! # example().unwrap();
//! ```

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, trace, warn};

use frameslot_core::FrameSettings;
use frameslot_rhi::command::CommandBuffer;
use frameslot_rhi::sync::FrameSync;
use frameslot_rhi::{
    BindGuard, Extent2D, FramebufferHandle, GpuDevice, PresentTarget, RhiError, Submission,
    Viewport,
};

use crate::error::{RenderError, RenderResult};
use crate::pool::{SlotPool, SlotState};

/// Everything a renderer needs to record one frame.
///
/// The frame's framebuffer and a full-target viewport are bound while
/// [`FrameRenderer::record`] runs, and the command buffer is recording.
pub struct FrameContext<'a, D: GpuDevice + ?Sized> {
    /// Frame slot being recorded. Use it to index per-slot resources.
    pub slot: usize,
    /// Number of frames drawn before this one.
    pub frame_index: u64,
    /// Swapchain image rendered into.
    pub image_index: u32,
    pub extent: Extent2D,
    pub framebuffer: FramebufferHandle,
    pub commands: &'a CommandBuffer<D>,
    pub device: &'a D,
}

/// Records the draw work of one frame.
pub trait FrameRenderer<D: GpuDevice + ?Sized> {
    fn record(&mut self, frame: &FrameContext<'_, D>) -> RenderResult<()>;
}

impl<D, F> FrameRenderer<D> for F
where
    D: GpuDevice + ?Sized,
    F: FnMut(&FrameContext<'_, D>) -> RenderResult<()>,
{
    fn record(&mut self, frame: &FrameContext<'_, D>) -> RenderResult<()> {
        self(frame)
    }
}

/// Result of one [`FrameCycler::draw_frame`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameOutcome {
    /// The frame was submitted and queued for presentation.
    Presented {
        slot: usize,
        image_index: u32,
        /// The swapchain should be rebuilt.
        suboptimal: bool,
    },
    /// No swapchain image could be acquired; nothing was submitted and the
    /// same slot is used next time.
    Skipped { slot: usize },
}

/// Frame counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CyclerStats {
    pub frames_drawn: u64,
    pub frames_skipped: u64,
    /// Frames presented to a suboptimal or out-of-date swapchain.
    pub suboptimal: u64,
}

/// Per-slot rendering resources.
struct FrameSlot<D: GpuDevice + ?Sized> {
    commands: CommandBuffer<D>,
    sync: FrameSync<D>,
}

impl<D: GpuDevice + ?Sized> FrameSlot<D> {
    fn new(device: &Arc<D>) -> RenderResult<Self> {
        Ok(Self {
            commands: CommandBuffer::new(device.clone())?,
            sync: FrameSync::new(device.clone())?,
        })
    }
}

/// Drives a fixed number of frames in flight.
///
/// # Thread Safety
///
/// The cycler is not thread-safe. It should only be driven from one thread
/// (typically the render thread).
pub struct FrameCycler<D: GpuDevice + ?Sized> {
    device: Arc<D>,
    slots: SlotPool<FrameSlot<D>>,
    /// Slot the next frame is drawn with.
    current_slot: usize,
    frame_index: u64,
    fence_timeout: Duration,
    stats: CyclerStats,
}

impl<D: GpuDevice + ?Sized> FrameCycler<D> {
    /// Creates `settings.frames_in_flight` frame slots.
    pub fn new(device: Arc<D>, settings: &FrameSettings) -> RenderResult<Self> {
        Self::with_depth(
            device,
            settings.frames_in_flight,
            Duration::from_millis(settings.fence_timeout_ms),
        )
    }

    /// Creates `frames_in_flight` frame slots whose fence waits give up
    /// after `fence_timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError::InvalidConfig`] for zero slots and the device
    /// error if a command buffer or synchronization object cannot be created.
    pub fn with_depth(
        device: Arc<D>,
        frames_in_flight: usize,
        fence_timeout: Duration,
    ) -> RenderResult<Self> {
        let slots = SlotPool::new(frames_in_flight, |_| FrameSlot::new(&device))?;

        info!(
            "Frame cycler ready on {}: {} frame(s) in flight, {:?} fence timeout",
            device.name(),
            frames_in_flight,
            fence_timeout
        );

        Ok(Self {
            device,
            slots,
            current_slot: 0,
            frame_index: 0,
            fence_timeout,
            stats: CyclerStats::default(),
        })
    }

    /// Draws one frame into `target`.
    ///
    /// A swapchain that cannot hand out an image (out of date, or not ready
    /// in time) skips the frame and returns [`FrameOutcome::Skipped`].
    ///
    /// # Errors
    ///
    /// A fence wait that times out and any non-transient device error are
    /// returned and are fatal. Any error between acquiring the image and
    /// submitting, including errors returned by `renderer`, is returned as
    /// [`RenderError::FrameAbandoned`], which is fatal as well.
    pub fn draw_frame<P, R>(&mut self, target: &mut P, renderer: &mut R) -> RenderResult<FrameOutcome>
    where
        P: PresentTarget + ?Sized,
        R: FrameRenderer<D> + ?Sized,
    {
        let slot = self.current_slot;
        self.wait_for_slot(slot)?;

        let frame = self.slots.resource(slot)?;
        let image = match target.acquire_next_image(
            frame.sync.image_available_handle(),
            self.fence_timeout,
        ) {
            Ok(image) => image,
            Err(err) if err.is_transient() || matches!(err, RhiError::Timeout(_)) => {
                warn!("Skipping frame {}: {}", self.frame_index, err);
                self.stats.frames_skipped += 1;
                return Ok(FrameOutcome::Skipped { slot });
            }
            Err(err) => return Err(err.into()),
        };

        // A failure from here on leaves the image acquired and its semaphore
        // signaled
        self.record_and_submit(slot, target, image.index, renderer)
            .map_err(|err| {
                error!("Frame {} abandoned after acquire: {}", self.frame_index, err);
                RenderError::FrameAbandoned {
                    frame: self.frame_index,
                    source: Box::new(err),
                }
            })?;

        let frame = self.slots.resource(slot)?;
        let signal = frame.sync.render_finished_handle();
        let suboptimal = match target.present(image.index, signal) {
            Ok(suboptimal) => suboptimal || image.suboptimal,
            Err(err) if err.is_transient() => {
                debug!("Present of frame {} reported: {}", self.frame_index, err);
                true
            }
            Err(err) => return Err(err.into()),
        };

        trace!(
            "Frame {} drawn with slot {} into image {}",
            self.frame_index, slot, image.index
        );

        self.stats.frames_drawn += 1;
        if suboptimal {
            self.stats.suboptimal += 1;
        }
        self.frame_index += 1;
        self.current_slot = (slot + 1) % self.slots.capacity();

        Ok(FrameOutcome::Presented {
            slot,
            image_index: image.index,
            suboptimal,
        })
    }

    /// Records slot `slot` into swapchain image `image_index` and submits it.
    fn record_and_submit<P, R>(
        &mut self,
        slot: usize,
        target: &mut P,
        image_index: u32,
        renderer: &mut R,
    ) -> RenderResult<()>
    where
        P: PresentTarget + ?Sized,
        R: FrameRenderer<D> + ?Sized,
    {
        let frame = self.slots.resource(slot)?;
        let extent = target.extent();
        let framebuffer = target.framebuffer(image_index)?;

        frame.commands.begin()?;
        {
            let _guard = BindGuard::new(&*self.device);
            self.device.bind_framebuffer(Some(framebuffer));
            self.device.set_viewport(Viewport::from_extent(extent));

            renderer.record(&FrameContext {
                slot,
                frame_index: self.frame_index,
                image_index,
                extent,
                framebuffer,
                commands: &frame.commands,
                device: &*self.device,
            })?;
        }
        frame.commands.end()?;

        // Reset only now that work is certain to be submitted
        frame.sync.in_flight_fence().reset()?;

        let command_buffers = [frame.commands.handle()];
        let wait_semaphores = [frame.sync.image_available_handle()];
        let signal_semaphores = [frame.sync.render_finished_handle()];
        self.device.submit(&Submission {
            command_buffers: &command_buffers,
            wait_semaphores: &wait_semaphores,
            signal_semaphores: &signal_semaphores,
            fence: Some(frame.sync.in_flight_fence_handle()),
        })?;
        self.slots.mark_submitted(slot)?;
        Ok(())
    }

    /// Blocks until slot `slot` is no longer in use by the GPU, then frees it.
    fn wait_for_slot(&mut self, slot: usize) -> RenderResult<()> {
        if self.slots.state(slot)? != SlotState::Submitted {
            return Ok(());
        }

        let frame = self.slots.resource(slot)?;
        frame
            .sync
            .in_flight_fence()
            .wait(self.fence_timeout)
            .inspect_err(|e| error!("Frame slot {} did not finish: {}", slot, e))?;
        self.slots.release(slot)
    }

    /// Waits for every submitted frame and frees all slots.
    pub fn wait_all(&mut self) -> RenderResult<()> {
        for slot in 0..self.slots.capacity() {
            self.wait_for_slot(slot)?;
        }
        Ok(())
    }

    /// Number of frame slots, fixed at construction.
    #[inline]
    pub fn frames_in_flight(&self) -> usize {
        self.slots.capacity()
    }

    #[inline]
    pub fn current_slot(&self) -> usize {
        self.current_slot
    }

    /// Number of frames drawn so far.
    #[inline]
    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    pub fn slot_state(&self, slot: usize) -> RenderResult<SlotState> {
        self.slots.state(slot)
    }

    /// Number of frames submitted but not yet known to be complete.
    pub fn frames_in_progress(&self) -> usize {
        self.slots.count(SlotState::Submitted)
    }

    #[inline]
    pub fn stats(&self) -> CyclerStats {
        self.stats
    }

    #[inline]
    pub fn device(&self) -> &Arc<D> {
        &self.device
    }
}

impl<D: GpuDevice + ?Sized> Drop for FrameCycler<D> {
    fn drop(&mut self) {
        if let Err(e) = self.device.wait_idle() {
            error!("Failed to wait for frames in flight before teardown: {}", e);
        }
        info!(
            "Frame cycler destroyed after {} frame(s), {} skipped",
            self.stats.frames_drawn, self.stats.frames_skipped
        );
    }
}

#[cfg(test)]
mod tests {
    use frameslot_rhi::headless::{HeadlessDevice, HeadlessSwapchain};

    use super::*;

    fn clear(frame: &FrameContext<'_, HeadlessDevice>) -> RenderResult<()> {
        frame.commands.clear([1.0, 0.0, 0.0, 1.0])?;
        Ok(())
    }

    fn setup(
        frames_in_flight: usize,
        images: usize,
    ) -> (Arc<HeadlessDevice>, HeadlessSwapchain, FrameCycler<HeadlessDevice>) {
        let device = Arc::new(HeadlessDevice::new());
        let swapchain = HeadlessSwapchain::new(device.clone(), Extent2D::new(8, 8), images).unwrap();
        let cycler =
            FrameCycler::with_depth(device.clone(), frames_in_flight, Duration::from_millis(100))
                .unwrap();
        (device, swapchain, cycler)
    }

    #[test]
    fn test_zero_depth_is_rejected() {
        let device = Arc::new(HeadlessDevice::new());
        assert!(matches!(
            FrameCycler::with_depth(device, 0, Duration::from_millis(100)),
            Err(RenderError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_slots_advance_round_robin() {
        let (_device, mut swapchain, mut cycler) = setup(2, 3);
        let mut renderer = clear;

        let slots: Vec<usize> = (0..5)
            .map(|_| match cycler.draw_frame(&mut swapchain, &mut renderer).unwrap() {
                FrameOutcome::Presented { slot, .. } => slot,
                FrameOutcome::Skipped { .. } => panic!("frame skipped"),
            })
            .collect();
        assert_eq!(slots, vec![0, 1, 0, 1, 0]);
        assert_eq!(cycler.frame_index(), 5);
    }

    #[test]
    fn test_out_of_date_skips_without_advancing() {
        let (device, mut swapchain, mut cycler) = setup(2, 3);
        let mut renderer = clear;

        cycler.draw_frame(&mut swapchain, &mut renderer).unwrap();
        swapchain.invalidate();
        let submissions = device.stats().submissions;

        assert_eq!(
            cycler.draw_frame(&mut swapchain, &mut renderer).unwrap(),
            FrameOutcome::Skipped { slot: 1 }
        );
        assert_eq!(device.stats().submissions, submissions);
        assert_eq!(cycler.current_slot(), 1);
        assert_eq!(cycler.stats().frames_skipped, 1);

        assert!(matches!(
            cycler.draw_frame(&mut swapchain, &mut renderer).unwrap(),
            FrameOutcome::Presented { slot: 1, .. }
        ));
    }

    #[test]
    fn test_record_restores_bind_state() {
        let (device, mut swapchain, mut cycler) = setup(2, 3);
        device.set_viewport(Viewport::new(0, 0, 1280, 720));
        let before = device.bind_state();

        let mut renderer = |frame: &FrameContext<'_, HeadlessDevice>| -> RenderResult<()> {
            assert_eq!(frame.device.bind_state().framebuffer, Some(frame.framebuffer));
            assert_eq!(frame.device.bind_state().viewport, Viewport::new(0, 0, 8, 8));
            frame.commands.clear([0.0; 4])?;
            Ok(())
        };
        cycler.draw_frame(&mut swapchain, &mut renderer).unwrap();
        assert_eq!(device.bind_state(), before);
    }

    #[test]
    fn test_renderer_error_abandons_frame() {
        let (_device, mut swapchain, mut cycler) = setup(2, 3);
        let mut renderer = |_: &FrameContext<'_, HeadlessDevice>| -> RenderResult<()> {
            Err(RenderError::UnsupportedImage("broken".to_string()))
        };
        let err = cycler.draw_frame(&mut swapchain, &mut renderer).unwrap_err();
        assert!(matches!(
            &err,
            RenderError::FrameAbandoned { frame: 0, source }
                if matches!(**source, RenderError::UnsupportedImage(_))
        ));
        assert_eq!(cycler.frames_in_progress(), 0);
    }

    #[test]
    fn test_transient_error_after_acquire_is_fatal() {
        let (device, mut swapchain, mut cycler) = setup(2, 3);
        let mut renderer = |_: &FrameContext<'_, HeadlessDevice>| -> RenderResult<()> {
            Err(RhiError::OutOfDate.into())
        };

        // The image stays acquired, so the loop must not carry on drawing
        let err = cycler.draw_frame(&mut swapchain, &mut renderer).unwrap_err();
        assert!(matches!(err, RenderError::FrameAbandoned { .. }));
        assert!(err.is_fatal());
        assert_eq!(cycler.current_slot(), 0);
        assert_eq!(cycler.stats().frames_drawn, 0);
        assert_eq!(device.stats().submissions, 0);
    }

    #[test]
    fn test_out_of_order_completion_gates_only_own_slot() {
        let (device, mut swapchain, mut cycler) = setup(2, 4);
        let mut renderer = clear;

        cycler.draw_frame(&mut swapchain, &mut renderer).unwrap();
        cycler.draw_frame(&mut swapchain, &mut renderer).unwrap();

        let fence = |slot: usize| {
            cycler
                .slots
                .resource(slot)
                .unwrap()
                .sync
                .in_flight_fence_handle()
        };
        let (fence0, fence1) = (fence(0), fence(1));

        // Slot 1 finishes before slot 0
        assert!(device.complete_fence(fence1));
        assert!(device.fence_signaled(fence1).unwrap());
        assert!(!device.fence_signaled(fence0).unwrap());
        assert_eq!(device.stats().blocking_waits, 0);

        // Slot 0 is still gated by its own fence
        cycler.draw_frame(&mut swapchain, &mut renderer).unwrap();
        assert_eq!(device.stats().blocking_waits, 1);

        // Slot 1 is reused without waiting
        let outcome = cycler.draw_frame(&mut swapchain, &mut renderer).unwrap();
        assert!(matches!(outcome, FrameOutcome::Presented { slot: 1, .. }));
        assert_eq!(device.stats().blocking_waits, 1);
        assert_eq!(device.stats().semaphore_misuse, 0);
    }

    #[test]
    fn test_hung_gpu_times_out_fatally() {
        let (device, mut swapchain, mut cycler) = setup(2, 4);
        let mut renderer = clear;

        cycler.draw_frame(&mut swapchain, &mut renderer).unwrap();
        cycler.draw_frame(&mut swapchain, &mut renderer).unwrap();
        device.set_hung(true);

        let err = cycler.draw_frame(&mut swapchain, &mut renderer).unwrap_err();
        assert!(matches!(err, RenderError::Rhi(RhiError::Timeout(_))));
        assert!(err.is_fatal());
        device.set_hung(false);
    }

    #[test]
    fn test_wait_all_frees_every_slot() {
        let (device, mut swapchain, mut cycler) = setup(3, 4);
        let mut renderer = clear;
        for _ in 0..3 {
            cycler.draw_frame(&mut swapchain, &mut renderer).unwrap();
        }
        assert_eq!(cycler.frames_in_progress(), 3);

        cycler.wait_all().unwrap();
        assert_eq!(cycler.frames_in_progress(), 0);
        assert_eq!(device.stats().completed_submissions, 3);
    }
}
