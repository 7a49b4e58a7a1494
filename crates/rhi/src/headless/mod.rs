//! Software implementation of [`GpuDevice`] and [`PresentTarget`].
//!
//! The headless device keeps every resource in host memory and executes
//! recorded commands with a small rasterizer, so the frame-resource pools can
//! be exercised without a GPU. It models the parts of a real queue that the
//! pools depend on:
//!
//! - Submissions, texture uploads and presents execute in FIFO order.
//! - With [`CompletionMode::Deferred`] work only runs when the CPU blocks on
//!   it: a fence wait runs the queue up to that fence, mapping a buffer runs
//!   it up to the last write into the buffer, and acquiring a swapchain image
//!   runs it until an image is presented.
//! - [`HeadlessDevice::complete_fence`] finishes one submission out of order,
//!   for testing code that must not assume FIFO completion across slots.
//!
//! Misuse that a real driver would not report (waiting on a semaphore nobody
//! signaled, reading back into a mapped buffer, destroying resources that
//! queued work still uses) is counted in [`HeadlessStats`].
//!
//! [`PresentTarget`]: crate::PresentTarget

mod raster;
mod swapchain;

pub use swapchain::HeadlessSwapchain;

use std::collections::{HashMap, VecDeque};
use std::ptr::NonNull;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::device::{BindState, BufferUsage, GpuDevice, MappedRange, Submission, TextureDesc};
use crate::error::{RhiError, RhiResult};
use crate::format::{PixelFormat, QUAD_BYTES, QuadVertex, Rect, Viewport};
use crate::handle::{
    BufferHandle, CommandBufferHandle, FenceHandle, FramebufferHandle, SemaphoreHandle,
    TextureHandle,
};
use raster::TextureData;

/// When queued work is executed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CompletionMode {
    /// Work executes as soon as it is queued.
    Immediate,
    /// Work executes only when the CPU waits for it.
    #[default]
    Deferred,
}

/// Counters describing how the device has been used.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeadlessStats {
    /// Queue submissions accepted.
    pub submissions: u64,
    /// Submissions that have finished executing.
    pub completed_submissions: u64,
    /// Quads rasterized.
    pub draws: u64,
    /// Pixel reads into readback buffers.
    pub readbacks: u64,
    /// Swapchain images presented.
    pub presents: u64,
    /// Fence waits that had to run queued work.
    pub blocking_waits: u64,
    /// Buffer maps that had to run queued work because nobody waited on a
    /// fence first.
    pub implicit_flushes: u64,
    /// Queue operations that waited on an unsignaled semaphore.
    pub semaphore_misuse: u64,
    /// Pixel reads dropped because the destination buffer was mapped.
    pub mapped_writes: u64,
    /// Resources destroyed while queued work still referenced them.
    pub destroyed_while_pending: u64,
}

struct BufferData {
    usage: BufferUsage,
    bytes: Box<[u8]>,
    mapped: bool,
}

#[derive(Default)]
struct CommandBufferData {
    recording: bool,
    commands: Vec<Command>,
}

/// A recorded command, with the bind state resolved at record time.
#[derive(Clone, Debug)]
enum Command {
    Clear {
        target: TextureHandle,
        color: [f32; 4],
    },
    DrawQuad {
        target: TextureHandle,
        viewport: Viewport,
        source: TextureHandle,
        vertices: BufferHandle,
    },
    ReadPixels {
        source: TextureHandle,
        rect: Rect,
        format: PixelFormat,
        buffer: BufferHandle,
    },
}

impl Command {
    fn references(&self, raw: u64) -> bool {
        match *self {
            Command::Clear { target, .. } => target.raw() == raw,
            Command::DrawQuad {
                target,
                source,
                vertices,
                ..
            } => target.raw() == raw || source.raw() == raw || vertices.raw() == raw,
            Command::ReadPixels { source, buffer, .. } => {
                source.raw() == raw || buffer.raw() == raw
            }
        }
    }
}

enum QueuedOp {
    Submit {
        command_buffers: Vec<CommandBufferHandle>,
        commands: Vec<Command>,
        wait: Vec<SemaphoreHandle>,
        signal: Vec<SemaphoreHandle>,
        fence: Option<FenceHandle>,
    },
    Upload {
        texture: TextureHandle,
        data: Vec<u8>,
    },
    Present {
        swapchain: u64,
        index: u32,
        wait: SemaphoreHandle,
    },
}

impl QueuedOp {
    fn signals_fence(&self, fence: FenceHandle) -> bool {
        matches!(self, QueuedOp::Submit { fence: Some(f), .. } if *f == fence)
    }

    fn writes_buffer(&self, buffer: BufferHandle) -> bool {
        match self {
            QueuedOp::Submit { commands, .. } => commands
                .iter()
                .any(|c| matches!(c, Command::ReadPixels { buffer: b, .. } if *b == buffer)),
            _ => false,
        }
    }

    fn uses_command_buffer(&self, command_buffer: CommandBufferHandle) -> bool {
        matches!(self, QueuedOp::Submit { command_buffers, .. } if command_buffers.contains(&command_buffer))
    }

    fn references(&self, raw: u64) -> bool {
        match self {
            QueuedOp::Submit {
                command_buffers,
                commands,
                wait,
                signal,
                fence,
            } => {
                command_buffers.iter().any(|c| c.raw() == raw)
                    || commands.iter().any(|c| c.references(raw))
                    || wait.iter().chain(signal).any(|s| s.raw() == raw)
                    || fence.is_some_and(|f| f.raw() == raw)
            }
            QueuedOp::Upload { texture, .. } => texture.raw() == raw,
            QueuedOp::Present { wait, .. } => wait.raw() == raw,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ImageState {
    Available,
    Acquired,
    Queued,
}

struct SwapchainData {
    images: Vec<ImageState>,
    next: usize,
    invalidated: bool,
    presented: Vec<u32>,
}

#[derive(Default)]
struct Faults {
    fail_next_allocation: bool,
    unsupported_formats: Vec<PixelFormat>,
    hung: bool,
}

#[derive(Default)]
struct State {
    next_id: u64,
    mode: CompletionMode,
    textures: HashMap<u64, TextureData>,
    framebuffers: HashMap<u64, TextureHandle>,
    buffers: HashMap<u64, BufferData>,
    fences: HashMap<u64, bool>,
    semaphores: HashMap<u64, bool>,
    command_buffers: HashMap<u64, CommandBufferData>,
    swapchains: HashMap<u64, SwapchainData>,
    bind: BindState,
    queue: VecDeque<QueuedOp>,
    stats: HeadlessStats,
    faults: Faults,
}

impl State {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn check_allocation(&mut self) -> RhiResult<()> {
        if std::mem::take(&mut self.faults.fail_next_allocation) {
            warn!("Injected allocation failure");
            return Err(RhiError::OutOfDeviceMemory);
        }
        Ok(())
    }

    fn note_destroy(&mut self, raw: u64, kind: &str) {
        if self.queue.iter().any(|op| op.references(raw)) {
            self.stats.destroyed_while_pending += 1;
            warn!("Destroyed {} #{} while queued work still uses it", kind, raw);
        }
    }

    fn recording(&mut self, command_buffer: CommandBufferHandle) -> RhiResult<&mut CommandBufferData> {
        let data = self
            .command_buffers
            .get_mut(&command_buffer.raw())
            .ok_or_else(|| RhiError::InvalidHandle(format!("{:?}", command_buffer)))?;
        if !data.recording {
            return Err(RhiError::InvalidArgument(format!(
                "{:?} is not recording",
                command_buffer
            )));
        }
        Ok(data)
    }

    fn bound_target(&self) -> RhiResult<TextureHandle> {
        let framebuffer = self
            .bind
            .framebuffer
            .ok_or_else(|| RhiError::InvalidArgument("No framebuffer bound".to_string()))?;
        self.framebuffers
            .get(&framebuffer.raw())
            .copied()
            .ok_or_else(|| RhiError::InvalidHandle(format!("{:?}", framebuffer)))
    }

    fn enqueue(&mut self, op: QueuedOp) {
        if self.mode == CompletionMode::Immediate && !self.faults.hung {
            self.execute(op);
        } else {
            self.queue.push_back(op);
        }
    }

    /// Runs queued operations up to and including `position`.
    fn drain_through(&mut self, position: usize) {
        for _ in 0..=position {
            match self.queue.pop_front() {
                Some(op) => self.execute(op),
                None => break,
            }
        }
    }

    fn drain_all(&mut self) {
        while let Some(op) = self.queue.pop_front() {
            self.execute(op);
        }
    }

    fn consume_semaphore(&mut self, semaphore: SemaphoreHandle) {
        match self.semaphores.get_mut(&semaphore.raw()) {
            Some(signaled) if *signaled => *signaled = false,
            _ => {
                self.stats.semaphore_misuse += 1;
                warn!("Queue waited on unsignaled {:?}", semaphore);
            }
        }
    }

    fn execute(&mut self, op: QueuedOp) {
        match op {
            QueuedOp::Submit {
                commands,
                wait,
                signal,
                fence,
                ..
            } => {
                for semaphore in wait {
                    self.consume_semaphore(semaphore);
                }
                for command in &commands {
                    self.execute_command(command);
                }
                for semaphore in signal {
                    if let Some(signaled) = self.semaphores.get_mut(&semaphore.raw()) {
                        *signaled = true;
                    }
                }
                if let Some(fence) = fence
                    && let Some(signaled) = self.fences.get_mut(&fence.raw())
                {
                    *signaled = true;
                }
                self.stats.completed_submissions += 1;
            }
            QueuedOp::Upload { texture, data } => {
                if let Some(texture) = self.textures.get_mut(&texture.raw()) {
                    texture.pixels.copy_from_slice(&data);
                }
            }
            QueuedOp::Present {
                swapchain,
                index,
                wait,
            } => {
                self.consume_semaphore(wait);
                if let Some(chain) = self.swapchains.get_mut(&swapchain)
                    && let Some(image) = chain.images.get_mut(index as usize)
                {
                    *image = ImageState::Available;
                    chain.presented.push(index);
                }
                self.stats.presents += 1;
            }
        }
    }

    fn execute_command(&mut self, command: &Command) {
        match *command {
            Command::Clear { target, color } => {
                if let Some(texture) = self.textures.get_mut(&target.raw()) {
                    raster::clear(texture, color);
                }
            }
            Command::DrawQuad {
                target,
                viewport,
                source,
                vertices,
            } => {
                let Some(buffer) = self.buffers.get(&vertices.raw()) else {
                    warn!("Draw skipped: vertex buffer {:?} is gone", vertices);
                    return;
                };
                let quad: [QuadVertex; 4] = bytemuck::pod_read_unaligned(&buffer.bytes[..QUAD_BYTES]);

                if source == target {
                    warn!("Draw skipped: {:?} samples its own render target", target);
                    return;
                }
                let Some(mut target_data) = self.textures.remove(&target.raw()) else {
                    return;
                };
                if let Some(source_data) = self.textures.get(&source.raw()) {
                    raster::draw_quad(&mut target_data, viewport, source_data, &quad);
                    self.stats.draws += 1;
                }
                self.textures.insert(target.raw(), target_data);
            }
            Command::ReadPixels {
                source,
                rect,
                format,
                buffer,
            } => {
                let Some(texture) = self.textures.get(&source.raw()) else {
                    return;
                };
                let Some(buffer_data) = self.buffers.get_mut(&buffer.raw()) else {
                    return;
                };
                if buffer_data.mapped {
                    self.stats.mapped_writes += 1;
                    warn!("Pixel read into mapped {:?} dropped", buffer);
                    return;
                }
                raster::read_pixels(texture, rect, format, &mut buffer_data.bytes);
                self.stats.readbacks += 1;
            }
        }
    }
}

/// Software GPU device.
///
/// # Thread Safety
///
/// All state sits behind one mutex, so the device can be shared through
/// `Arc` like a hardware device.
#[derive(Default)]
pub struct HeadlessDevice {
    state: Mutex<State>,
}

impl HeadlessDevice {
    /// Creates a device in [`CompletionMode::Deferred`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a device with the given completion mode.
    pub fn with_mode(mode: CompletionMode) -> Self {
        let device = Self::default();
        device.lock().mode = mode;
        device
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn completion_mode(&self) -> CompletionMode {
        self.lock().mode
    }

    /// Switches the completion mode. Switching to immediate mode runs the
    /// queued work.
    pub fn set_completion_mode(&self, mode: CompletionMode) {
        let mut state = self.lock();
        state.mode = mode;
        if mode == CompletionMode::Immediate && !state.faults.hung {
            state.drain_all();
        }
    }

    /// Returns a copy of the usage counters.
    pub fn stats(&self) -> HeadlessStats {
        self.lock().stats
    }

    /// Number of queued operations that have not executed yet.
    pub fn pending_operations(&self) -> usize {
        self.lock().queue.len()
    }

    /// Number of live resources and synchronization objects.
    pub fn live_objects(&self) -> usize {
        let state = self.lock();
        state.textures.len()
            + state.framebuffers.len()
            + state.buffers.len()
            + state.fences.len()
            + state.semaphores.len()
            + state.command_buffers.len()
    }

    /// Executes all queued work.
    pub fn flush(&self) {
        let mut state = self.lock();
        if !state.faults.hung {
            state.drain_all();
        }
    }

    /// Executes the oldest queued submission that signals `fence`, ahead of
    /// anything queued before it.
    ///
    /// Returns `false` if no such submission is queued.
    pub fn complete_fence(&self, fence: FenceHandle) -> bool {
        let mut state = self.lock();
        if state.faults.hung {
            return false;
        }
        let Some(position) = state.queue.iter().position(|op| op.signals_fence(fence)) else {
            return false;
        };
        if let Some(op) = state.queue.remove(position) {
            debug!("Completing {:?} out of order", fence);
            state.execute(op);
        }
        true
    }

    /// Returns the texture contents as last written by executed work.
    pub fn read_texture(&self, texture: TextureHandle) -> RhiResult<Vec<u8>> {
        self.lock()
            .textures
            .get(&texture.raw())
            .map(|t| t.pixels.clone())
            .ok_or_else(|| RhiError::InvalidHandle(format!("{:?}", texture)))
    }

    /// Makes the next texture or buffer allocation fail with
    /// [`RhiError::OutOfDeviceMemory`].
    pub fn fail_next_allocation(&self) {
        self.lock().faults.fail_next_allocation = true;
    }

    /// Marks a pixel format as unsupported for new textures.
    pub fn set_format_supported(&self, format: PixelFormat, supported: bool) {
        let mut state = self.lock();
        state.faults.unsupported_formats.retain(|f| *f != format);
        if !supported {
            state.faults.unsupported_formats.push(format);
        }
    }

    /// Simulates a hung GPU: nothing executes and fence waits time out.
    pub fn set_hung(&self, hung: bool) {
        self.lock().faults.hung = hung;
    }

    pub(crate) fn register_swapchain(&self, image_count: usize) -> u64 {
        let mut state = self.lock();
        let id = state.allocate_id();
        state.swapchains.insert(
            id,
            SwapchainData {
                images: vec![ImageState::Available; image_count],
                next: 0,
                invalidated: false,
                presented: Vec::new(),
            },
        );
        id
    }

    pub(crate) fn unregister_swapchain(&self, swapchain: u64) {
        self.lock().swapchains.remove(&swapchain);
    }

    pub(crate) fn invalidate_swapchain(&self, swapchain: u64) {
        if let Some(chain) = self.lock().swapchains.get_mut(&swapchain) {
            chain.invalidated = true;
        }
    }

    pub(crate) fn presented_images(&self, swapchain: u64) -> Vec<u32> {
        self.lock()
            .swapchains
            .get(&swapchain)
            .map(|chain| chain.presented.clone())
            .unwrap_or_default()
    }

    pub(crate) fn acquire_swapchain_image(
        &self,
        swapchain: u64,
        signal: SemaphoreHandle,
    ) -> RhiResult<u32> {
        let mut guard = self.lock();
        let state = &mut *guard;

        if !state.semaphores.contains_key(&signal.raw()) {
            return Err(RhiError::InvalidHandle(format!("{:?}", signal)));
        }

        loop {
            let chain = state
                .swapchains
                .get_mut(&swapchain)
                .ok_or_else(|| RhiError::SwapchainError("Swapchain destroyed".to_string()))?;

            if std::mem::take(&mut chain.invalidated) {
                return Err(RhiError::OutOfDate);
            }

            let count = chain.images.len();
            let free = (0..count)
                .map(|offset| (chain.next + offset) % count)
                .find(|&i| chain.images[i] == ImageState::Available);

            if let Some(index) = free {
                chain.images[index] = ImageState::Acquired;
                chain.next = (index + 1) % count;

                if let Some(signaled) = state.semaphores.get_mut(&signal.raw()) {
                    if *signaled {
                        state.stats.semaphore_misuse += 1;
                        warn!("Acquire signaled {:?} which was already signaled", signal);
                    }
                    *signaled = true;
                }
                trace!("Acquired swapchain image {}", index);
                return Ok(index as u32);
            }

            let queued_present = state.queue.iter().position(
                |op| matches!(op, QueuedOp::Present { swapchain: s, .. } if *s == swapchain),
            );
            match queued_present {
                Some(_) if state.faults.hung => return Err(RhiError::DeviceLost),
                Some(position) => {
                    state.stats.blocking_waits += 1;
                    state.drain_through(position);
                }
                None => {
                    return Err(RhiError::SwapchainError(
                        "All swapchain images are acquired".to_string(),
                    ));
                }
            }
        }
    }

    pub(crate) fn queue_present(
        &self,
        swapchain: u64,
        index: u32,
        wait: SemaphoreHandle,
    ) -> RhiResult<()> {
        let mut state = self.lock();
        let chain = state
            .swapchains
            .get_mut(&swapchain)
            .ok_or_else(|| RhiError::SwapchainError("Swapchain destroyed".to_string()))?;

        match chain.images.get_mut(index as usize) {
            Some(image) if *image == ImageState::Acquired => *image = ImageState::Queued,
            _ => {
                return Err(RhiError::InvalidArgument(format!(
                    "Swapchain image {} is not acquired",
                    index
                )));
            }
        }

        state.enqueue(QueuedOp::Present {
            swapchain,
            index,
            wait,
        });
        Ok(())
    }
}

impl GpuDevice for HeadlessDevice {
    fn name(&self) -> &str {
        "headless"
    }

    fn create_texture(&self, desc: &TextureDesc) -> RhiResult<TextureHandle> {
        let mut state = self.lock();
        if state.faults.unsupported_formats.contains(&desc.format) {
            return Err(RhiError::UnsupportedFormat(desc.format));
        }
        state.check_allocation()?;

        let id = state.allocate_id();
        state.textures.insert(id, TextureData::new(*desc));
        Ok(TextureHandle::from_raw(id))
    }

    fn write_texture(&self, texture: TextureHandle, data: &[u8]) -> RhiResult<()> {
        let mut state = self.lock();
        let expected = state
            .textures
            .get(&texture.raw())
            .map(|t| t.desc.byte_size())
            .ok_or_else(|| RhiError::InvalidHandle(format!("{:?}", texture)))?;
        if data.len() != expected {
            return Err(RhiError::InvalidArgument(format!(
                "Texture upload of {} bytes, expected {}",
                data.len(),
                expected
            )));
        }
        state.enqueue(QueuedOp::Upload {
            texture,
            data: data.to_vec(),
        });
        Ok(())
    }

    fn texture_desc(&self, texture: TextureHandle) -> RhiResult<TextureDesc> {
        self.lock()
            .textures
            .get(&texture.raw())
            .map(|t| t.desc)
            .ok_or_else(|| RhiError::InvalidHandle(format!("{:?}", texture)))
    }

    fn destroy_texture(&self, texture: TextureHandle) {
        let mut state = self.lock();
        state.note_destroy(texture.raw(), "texture");
        state.textures.remove(&texture.raw());
    }

    fn create_framebuffer(&self, color: TextureHandle) -> RhiResult<FramebufferHandle> {
        let mut state = self.lock();
        if !state.textures.contains_key(&color.raw()) {
            return Err(RhiError::InvalidHandle(format!("{:?}", color)));
        }
        let id = state.allocate_id();
        state.framebuffers.insert(id, color);
        Ok(FramebufferHandle::from_raw(id))
    }

    fn destroy_framebuffer(&self, framebuffer: FramebufferHandle) {
        let mut state = self.lock();
        state.framebuffers.remove(&framebuffer.raw());
        if state.bind.framebuffer == Some(framebuffer) {
            state.bind.framebuffer = None;
        }
    }

    fn create_buffer(&self, size: usize, usage: BufferUsage) -> RhiResult<BufferHandle> {
        if size == 0 {
            return Err(RhiError::InvalidArgument(
                "Buffer size must be greater than 0".to_string(),
            ));
        }
        let mut state = self.lock();
        state.check_allocation()?;

        let id = state.allocate_id();
        state.buffers.insert(
            id,
            BufferData {
                usage,
                bytes: vec![0; size].into_boxed_slice(),
                mapped: false,
            },
        );
        Ok(BufferHandle::from_raw(id))
    }

    fn write_buffer(&self, buffer: BufferHandle, offset: usize, data: &[u8]) -> RhiResult<()> {
        let mut state = self.lock();
        let target = state
            .buffers
            .get_mut(&buffer.raw())
            .ok_or_else(|| RhiError::InvalidHandle(format!("{:?}", buffer)))?;
        if target.mapped {
            return Err(RhiError::InvalidArgument(format!(
                "{:?} is mapped for reading",
                buffer
            )));
        }
        let end = offset
            .checked_add(data.len())
            .filter(|&end| end <= target.bytes.len())
            .ok_or_else(|| {
                RhiError::InvalidArgument(format!(
                    "Write of {} bytes at {} exceeds {:?}",
                    data.len(),
                    offset,
                    buffer
                ))
            })?;
        target.bytes[offset..end].copy_from_slice(data);
        Ok(())
    }

    fn destroy_buffer(&self, buffer: BufferHandle) {
        let mut state = self.lock();
        state.note_destroy(buffer.raw(), "buffer");
        state.buffers.remove(&buffer.raw());
    }

    fn create_fence(&self, signaled: bool) -> RhiResult<FenceHandle> {
        let mut state = self.lock();
        let id = state.allocate_id();
        state.fences.insert(id, signaled);
        Ok(FenceHandle::from_raw(id))
    }

    fn destroy_fence(&self, fence: FenceHandle) {
        let mut state = self.lock();
        state.note_destroy(fence.raw(), "fence");
        state.fences.remove(&fence.raw());
    }

    fn create_semaphore(&self) -> RhiResult<SemaphoreHandle> {
        let mut state = self.lock();
        let id = state.allocate_id();
        state.semaphores.insert(id, false);
        Ok(SemaphoreHandle::from_raw(id))
    }

    fn destroy_semaphore(&self, semaphore: SemaphoreHandle) {
        let mut state = self.lock();
        state.note_destroy(semaphore.raw(), "semaphore");
        state.semaphores.remove(&semaphore.raw());
    }

    fn allocate_command_buffer(&self) -> RhiResult<CommandBufferHandle> {
        let mut state = self.lock();
        let id = state.allocate_id();
        state.command_buffers.insert(id, CommandBufferData::default());
        Ok(CommandBufferHandle::from_raw(id))
    }

    fn free_command_buffer(&self, command_buffer: CommandBufferHandle) {
        let mut state = self.lock();
        state.note_destroy(command_buffer.raw(), "command buffer");
        state.command_buffers.remove(&command_buffer.raw());
    }

    fn bind_state(&self) -> BindState {
        self.lock().bind
    }

    fn set_bind_state(&self, bind: &BindState) {
        self.lock().bind = *bind;
    }

    fn bind_framebuffer(&self, framebuffer: Option<FramebufferHandle>) {
        self.lock().bind.framebuffer = framebuffer;
    }

    fn set_viewport(&self, viewport: Viewport) {
        self.lock().bind.viewport = viewport;
    }

    fn bind_texture(&self, texture: Option<TextureHandle>) {
        self.lock().bind.texture = texture;
    }

    fn begin_commands(&self, command_buffer: CommandBufferHandle) -> RhiResult<()> {
        let mut state = self.lock();
        if state
            .queue
            .iter()
            .any(|op| op.uses_command_buffer(command_buffer))
        {
            return Err(RhiError::InvalidArgument(format!(
                "{:?} is pending execution",
                command_buffer
            )));
        }
        let data = state
            .command_buffers
            .get_mut(&command_buffer.raw())
            .ok_or_else(|| RhiError::InvalidHandle(format!("{:?}", command_buffer)))?;
        data.recording = true;
        data.commands.clear();
        Ok(())
    }

    fn end_commands(&self, command_buffer: CommandBufferHandle) -> RhiResult<()> {
        let mut state = self.lock();
        state.recording(command_buffer)?.recording = false;
        Ok(())
    }

    fn cmd_clear(&self, command_buffer: CommandBufferHandle, color: [f32; 4]) -> RhiResult<()> {
        let mut state = self.lock();
        let target = state.bound_target()?;
        state
            .recording(command_buffer)?
            .commands
            .push(Command::Clear { target, color });
        Ok(())
    }

    fn cmd_draw_quad(
        &self,
        command_buffer: CommandBufferHandle,
        vertex_buffer: BufferHandle,
    ) -> RhiResult<()> {
        let mut state = self.lock();
        let target = state.bound_target()?;
        let viewport = state.bind.viewport;
        let source = state
            .bind
            .texture
            .ok_or_else(|| RhiError::InvalidArgument("No texture bound".to_string()))?;

        if !state.textures.contains_key(&source.raw()) {
            return Err(RhiError::InvalidHandle(format!("{:?}", source)));
        }
        if source == target {
            return Err(RhiError::InvalidArgument(format!(
                "{:?} is both sampled and rendered to",
                source
            )));
        }
        match state.buffers.get(&vertex_buffer.raw()) {
            Some(buffer) if buffer.bytes.len() >= QUAD_BYTES => {}
            Some(_) => {
                return Err(RhiError::InvalidArgument(format!(
                    "{:?} is smaller than one quad",
                    vertex_buffer
                )));
            }
            None => return Err(RhiError::InvalidHandle(format!("{:?}", vertex_buffer))),
        }

        state.recording(command_buffer)?.commands.push(Command::DrawQuad {
            target,
            viewport,
            source,
            vertices: vertex_buffer,
        });
        Ok(())
    }

    fn cmd_read_pixels(
        &self,
        command_buffer: CommandBufferHandle,
        rect: Rect,
        format: PixelFormat,
        buffer: BufferHandle,
    ) -> RhiResult<()> {
        let mut state = self.lock();
        let source = state.bound_target()?;

        let extent = state
            .textures
            .get(&source.raw())
            .map(|t| t.desc.extent)
            .ok_or_else(|| RhiError::InvalidHandle(format!("{:?}", source)))?;
        if !rect.fits_in(extent) {
            return Err(RhiError::InvalidArgument(format!(
                "Read rectangle {:?} exceeds {}x{} target",
                rect, extent.width, extent.height
            )));
        }

        let required = rect.extent().byte_size(format);
        match state.buffers.get(&buffer.raw()) {
            Some(data) if data.usage != BufferUsage::Readback => {
                return Err(RhiError::InvalidArgument(format!(
                    "{:?} is not a readback buffer",
                    buffer
                )));
            }
            Some(data) if data.bytes.len() < required => {
                return Err(RhiError::InvalidArgument(format!(
                    "{:?} holds {} bytes, read needs {}",
                    buffer,
                    data.bytes.len(),
                    required
                )));
            }
            Some(_) => {}
            None => return Err(RhiError::InvalidHandle(format!("{:?}", buffer))),
        }

        state
            .recording(command_buffer)?
            .commands
            .push(Command::ReadPixels {
                source,
                rect,
                format,
                buffer,
            });
        Ok(())
    }

    fn submit(&self, submission: &Submission<'_>) -> RhiResult<()> {
        let mut state = self.lock();

        let mut commands = Vec::new();
        for command_buffer in submission.command_buffers {
            let data = state
                .command_buffers
                .get(&command_buffer.raw())
                .ok_or_else(|| RhiError::InvalidHandle(format!("{:?}", command_buffer)))?;
            if data.recording {
                return Err(RhiError::InvalidArgument(format!(
                    "{:?} is still recording",
                    command_buffer
                )));
            }
            commands.extend(data.commands.iter().cloned());
        }

        for semaphore in submission
            .wait_semaphores
            .iter()
            .chain(submission.signal_semaphores)
        {
            if !state.semaphores.contains_key(&semaphore.raw()) {
                return Err(RhiError::InvalidHandle(format!("{:?}", semaphore)));
            }
        }

        if let Some(fence) = submission.fence {
            match state.fences.get(&fence.raw()) {
                None => return Err(RhiError::InvalidHandle(format!("{:?}", fence))),
                Some(true) => {
                    return Err(RhiError::InvalidArgument(format!(
                        "{:?} submitted while signaled",
                        fence
                    )));
                }
                Some(false) if state.queue.iter().any(|op| op.signals_fence(fence)) => {
                    return Err(RhiError::InvalidArgument(format!(
                        "{:?} is already pending",
                        fence
                    )));
                }
                Some(false) => {}
            }
        }

        state.stats.submissions += 1;
        trace!(
            "Submitting {} command(s), fence {:?}",
            commands.len(),
            submission.fence
        );
        state.enqueue(QueuedOp::Submit {
            command_buffers: submission.command_buffers.to_vec(),
            commands,
            wait: submission.wait_semaphores.to_vec(),
            signal: submission.signal_semaphores.to_vec(),
            fence: submission.fence,
        });
        Ok(())
    }

    fn wait_for_fence(&self, fence: FenceHandle, timeout: Duration) -> RhiResult<()> {
        let mut state = self.lock();
        match state.fences.get(&fence.raw()) {
            None => return Err(RhiError::InvalidHandle(format!("{:?}", fence))),
            Some(true) => return Ok(()),
            Some(false) => {}
        }

        if state.faults.hung {
            return Err(RhiError::Timeout(timeout));
        }

        if let Some(position) = state.queue.iter().position(|op| op.signals_fence(fence)) {
            state.stats.blocking_waits += 1;
            state.drain_through(position);
        }

        if state.fences.get(&fence.raw()).copied().unwrap_or(false) {
            Ok(())
        } else {
            // Nothing queued will ever signal it
            Err(RhiError::Timeout(timeout))
        }
    }

    fn reset_fence(&self, fence: FenceHandle) -> RhiResult<()> {
        let mut state = self.lock();
        if state.queue.iter().any(|op| op.signals_fence(fence)) {
            return Err(RhiError::InvalidArgument(format!(
                "{:?} is pending and cannot be reset",
                fence
            )));
        }
        let signaled = state
            .fences
            .get_mut(&fence.raw())
            .ok_or_else(|| RhiError::InvalidHandle(format!("{:?}", fence)))?;
        *signaled = false;
        Ok(())
    }

    fn fence_signaled(&self, fence: FenceHandle) -> RhiResult<bool> {
        self.lock()
            .fences
            .get(&fence.raw())
            .copied()
            .ok_or_else(|| RhiError::InvalidHandle(format!("{:?}", fence)))
    }

    fn wait_idle(&self) -> RhiResult<()> {
        let mut state = self.lock();
        if state.faults.hung && !state.queue.is_empty() {
            return Err(RhiError::DeviceLost);
        }
        state.drain_all();
        Ok(())
    }

    fn map_buffer(&self, buffer: BufferHandle) -> RhiResult<MappedRange> {
        let mut state = self.lock();
        match state.buffers.get(&buffer.raw()) {
            None => return Err(RhiError::InvalidHandle(format!("{:?}", buffer))),
            Some(data) if data.mapped => {
                return Err(RhiError::InvalidArgument(format!(
                    "{:?} is already mapped",
                    buffer
                )));
            }
            Some(_) => {}
        }

        if let Some(position) = state.queue.iter().rposition(|op| op.writes_buffer(buffer)) {
            if state.faults.hung {
                return Err(RhiError::DeviceLost);
            }
            state.stats.implicit_flushes += 1;
            debug!("Mapping {:?} flushed pending work", buffer);
            state.drain_through(position);
        }

        let data = state
            .buffers
            .get_mut(&buffer.raw())
            .ok_or_else(|| RhiError::InvalidHandle(format!("{:?}", buffer)))?;
        data.mapped = true;
        let ptr = NonNull::from(&mut *data.bytes).cast::<u8>();
        // Safety: the boxed slice is not reallocated while the buffer exists,
        // and writes into it are refused while it is mapped.
        Ok(unsafe { MappedRange::new(ptr, data.bytes.len()) })
    }

    fn unmap_buffer(&self, buffer: BufferHandle) -> RhiResult<()> {
        let mut state = self.lock();
        let data = state
            .buffers
            .get_mut(&buffer.raw())
            .ok_or_else(|| RhiError::InvalidHandle(format!("{:?}", buffer)))?;
        if !data.mapped {
            return Err(RhiError::InvalidArgument(format!("{:?} is not mapped", buffer)));
        }
        data.mapped = false;
        Ok(())
    }
}
