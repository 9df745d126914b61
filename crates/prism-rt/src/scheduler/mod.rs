//! Frame pipelining.
//!
//! [`FrameScheduler`] keeps a ring of frame slots, each with its own command
//! buffer, image-ready and render-complete semaphores and a work-done fence.
//! For slot `i` a frame waits on the fence, acquires an image, records,
//! submits and presents, then moves the cursor to `(i + 1) % N`. The fence
//! wait is the only point where the host blocks.
//!
//! Once an image is acquired the frame must reach submission: the slot's
//! image-ready semaphore has a signal pending and the image belongs to the
//! application. A failure past that point leaves the scheduler failed, and
//! every later [`advance`](FrameScheduler::advance) is rejected until the
//! scheduler (and its swapchain) is recreated.

mod vulkan;

pub(crate) use vulkan::color_range;
pub use vulkan::{record_present_transition, VulkanFrameDevice, VulkanFrameSlot};

use ash::vk;
use prism_gpu::{GpuError, PresentOutcome, Result, DEFAULT_FENCE_TIMEOUT_NS};

/// Scheduler configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Number of frame slots.
    pub frames_in_flight: usize,
    /// Upper bound on a fence wait before the device is reported hung.
    pub fence_timeout_ns: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: 2,
            fence_timeout_ns: DEFAULT_FENCE_TIMEOUT_NS,
        }
    }
}

impl SchedulerConfig {
    /// Set the number of frame slots.
    pub fn frames_in_flight(mut self, frames: usize) -> Self {
        self.frames_in_flight = frames;
        self
    }

    /// Set the fence wait timeout in nanoseconds.
    pub fn fence_timeout_ns(mut self, timeout_ns: u64) -> Self {
        self.fence_timeout_ns = timeout_ns;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.frames_in_flight == 0 {
            return Err(GpuError::InvalidState(
                "at least one frame slot is required".to_string(),
            ));
        }
        if self.fence_timeout_ns == 0 {
            return Err(GpuError::InvalidState(
                "fence timeout must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// An image handed out by the presentation engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquiredImage {
    pub index: u32,
    pub image: vk::Image,
    pub extent: vk::Extent2D,
    /// The swapchain still works but no longer matches the surface.
    pub suboptimal: bool,
}

/// What a recorder sees for the frame it records.
#[derive(Debug, Clone, Copy)]
pub struct FrameContext {
    /// Slot being recorded.
    pub slot: usize,
    /// Frames submitted before this one.
    pub frame: u64,
    /// Command buffer in the recording state.
    pub command_buffer: vk::CommandBuffer,
    /// Swapchain image this frame presents.
    pub image: AcquiredImage,
}

/// Outcome of [`FrameScheduler::advance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    /// The frame was submitted and presented.
    Presented { slot: usize, image_index: u32 },
    /// The swapchain must be recreated. Returned without side effects when
    /// acquisition fails, or after submission when presentation reports it.
    SurfaceOutOfDate,
}

/// Whether a slot has device work outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    InFlight,
}

/// Device operations the scheduler depends on.
pub trait FrameDevice {
    /// Per-slot command buffer and synchronization objects.
    type Slot;

    /// Create the objects for slot `index`. The fence starts signaled.
    fn create_slot(&mut self, index: usize) -> Result<Self::Slot>;

    /// Block until the slot's fence signals, or fail with [`GpuError::Timeout`].
    fn wait(&mut self, slot: &Self::Slot, timeout_ns: u64) -> Result<()>;

    /// Acquire the next image, signaling the slot's image-ready semaphore.
    /// An out-of-date surface is [`GpuError::SurfaceOutOfDate`].
    fn acquire(&mut self, slot: &Self::Slot, timeout_ns: u64) -> Result<AcquiredImage>;

    /// Reset the slot's command buffer and begin recording.
    fn begin(&mut self, slot: &Self::Slot) -> Result<vk::CommandBuffer>;

    /// Finish recording.
    fn end(&mut self, slot: &Self::Slot) -> Result<()>;

    /// Reset the slot's fence to unsignaled.
    fn reset_fence(&mut self, slot: &Self::Slot) -> Result<()>;

    /// Submit the slot's command buffer waiting on image-ready, signaling
    /// render-complete and the fence.
    fn submit(&mut self, slot: &Self::Slot) -> Result<()>;

    /// Present `image_index` once render-complete signals.
    fn present(&mut self, slot: &Self::Slot, image_index: u32) -> Result<PresentOutcome>;

    /// Release the slot's objects. Its fence has signaled.
    fn destroy_slot(&mut self, slot: Self::Slot);
}

struct FrameSlot<S> {
    index: usize,
    state: SlotState,
    /// Fence was reset but its submission never reached the queue.
    fence_orphaned: bool,
    sync: S,
}

/// Ring of frame slots driving submission and presentation.
pub struct FrameScheduler<D: FrameDevice> {
    device: D,
    slots: Vec<FrameSlot<D::Slot>>,
    cursor: usize,
    frame_count: u64,
    config: SchedulerConfig,
    failed: bool,
}

impl<D: FrameDevice> FrameScheduler<D> {
    /// Create `config.frames_in_flight` slots on `device`.
    pub fn new(mut device: D, config: SchedulerConfig) -> Result<Self> {
        config.validate()?;

        let mut slots = Vec::with_capacity(config.frames_in_flight);
        for index in 0..config.frames_in_flight {
            match device.create_slot(index) {
                Ok(sync) => slots.push(FrameSlot {
                    index,
                    state: SlotState::Idle,
                    fence_orphaned: false,
                    sync,
                }),
                Err(e) => {
                    while let Some(slot) = slots.pop() {
                        device.destroy_slot(slot.sync);
                    }
                    return Err(e);
                }
            }
        }

        tracing::info!(
            "Frame scheduler ready: {} frames in flight",
            config.frames_in_flight
        );

        Ok(Self {
            device,
            slots,
            cursor: 0,
            frame_count: 0,
            config,
            failed: false,
        })
    }

    /// Slot the next frame uses. Always `frame_count % frames_in_flight`.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Frames submitted so far.
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Number of slots.
    pub fn frames_in_flight(&self) -> usize {
        self.slots.len()
    }

    /// Configuration in effect.
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Whether a frame failed after acquiring its image.
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// State of slot `index`, if it exists.
    pub fn slot_state(&self, index: usize) -> Option<SlotState> {
        self.slots.get(index).map(|slot| slot.state)
    }

    /// The underlying device.
    pub fn device(&self) -> &D {
        &self.device
    }

    /// Mutable access to the device, e.g. to recreate the swapchain.
    ///
    /// Call [`wait_all`](Self::wait_all) before replacing anything an
    /// in-flight frame might use.
    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    /// Run one frame on the current slot.
    ///
    /// `record` is called between begin and end of the slot's command buffer.
    /// Any error after acquisition fails the scheduler.
    pub fn advance<F>(&mut self, record: F) -> Result<FrameStatus>
    where
        F: FnOnce(&FrameContext) -> Result<()>,
    {
        if self.failed {
            return Err(GpuError::InvalidState(
                "frame scheduler failed after acquiring an image".to_string(),
            ));
        }

        let timeout_ns = self.config.fence_timeout_ns;
        let slot = &mut self.slots[self.cursor];

        // 1. The slot's previous submission must be finished before reuse
        self.device.wait(&slot.sync, timeout_ns)?;
        slot.state = SlotState::Idle;

        // 2. Acquire; a stale surface leaves the slot and cursor untouched
        let image = match self.device.acquire(&slot.sync, timeout_ns) {
            Ok(image) => image,
            Err(GpuError::SurfaceOutOfDate) => {
                tracing::debug!("Surface out of date at acquire (slot {})", slot.index);
                return Ok(FrameStatus::SurfaceOutOfDate);
            }
            Err(e) => return Err(e),
        };

        // 3-6. Record, submit and present
        let outcome =
            match Self::submit_frame(&mut self.device, slot, self.frame_count, image, record) {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!(
                        "Frame {} failed on slot {} after acquiring image {}: {e}",
                        self.frame_count,
                        slot.index,
                        image.index
                    );
                    self.failed = true;
                    return Err(e);
                }
            };

        // 7. Advance
        let slot_index = slot.index;
        self.cursor = (self.cursor + 1) % self.slots.len();
        self.frame_count += 1;

        tracing::trace!(
            "Frame {} submitted on slot {slot_index}, image {}",
            self.frame_count - 1,
            image.index
        );

        if image.suboptimal || outcome.needs_recreate() {
            return Ok(FrameStatus::SurfaceOutOfDate);
        }
        Ok(FrameStatus::Presented {
            slot: slot_index,
            image_index: image.index,
        })
    }

    fn submit_frame<F>(
        device: &mut D,
        slot: &mut FrameSlot<D::Slot>,
        frame: u64,
        image: AcquiredImage,
        record: F,
    ) -> Result<PresentOutcome>
    where
        F: FnOnce(&FrameContext) -> Result<()>,
    {
        let command_buffer = device.begin(&slot.sync)?;
        record(&FrameContext {
            slot: slot.index,
            frame,
            command_buffer,
            image,
        })?;
        device.end(&slot.sync)?;

        // The fence is reset only once a submission will signal it
        device.reset_fence(&slot.sync)?;
        if let Err(e) = device.submit(&slot.sync) {
            slot.fence_orphaned = true;
            return Err(e);
        }
        slot.state = SlotState::InFlight;

        device.present(&slot.sync, image.index)
    }

    /// Wait for every slot's outstanding work.
    pub fn wait_all(&mut self) -> Result<()> {
        let timeout_ns = self.config.fence_timeout_ns;
        for slot in &mut self.slots {
            if slot.fence_orphaned {
                tracing::debug!("Skipping wait on slot {}: nothing was submitted", slot.index);
                continue;
            }
            self.device.wait(&slot.sync, timeout_ns)?;
            slot.state = SlotState::Idle;
        }
        Ok(())
    }

    /// Wait for all work, then release every slot in reverse creation order.
    pub fn destroy(mut self) -> Result<()> {
        let waited = self.wait_all();
        self.release_slots();
        waited
    }

    fn release_slots(&mut self) {
        while let Some(slot) = self.slots.pop() {
            if slot.state == SlotState::InFlight {
                tracing::error!("Releasing frame slot {} with work in flight", slot.index);
            }
            self.device.destroy_slot(slot.sync);
        }
    }
}

impl<D: FrameDevice> Drop for FrameScheduler<D> {
    fn drop(&mut self) {
        if self.slots.is_empty() {
            return;
        }
        if let Err(e) = self.wait_all() {
            tracing::error!("Failed to wait for frames during teardown: {e}");
        }
        self.release_slots();
    }
}
