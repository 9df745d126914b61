//! Application context.

use std::sync::Arc;
use std::time::Instant;

use ash::vk;
use prism_gpu::{GpuContext, SurfaceContext};
use prism_rt::{FrameScheduler, SchedulerConfig, VulkanFrameDevice};
use winit::window::Window;

/// Application context shared across all app methods.
///
/// Field order is drop order: the frame slots, swapchain and surface go
/// before the GPU context, and the window outlives the surface.
pub struct AppContext {
    /// Frame slots and the swapchain they present to.
    pub scheduler: FrameScheduler<VulkanFrameDevice>,
    /// GPU context with device and queues.
    pub gpu: GpuContext,
    /// The window handle.
    pub window: Arc<Window>,
    /// Time of last frame (for delta time calculation).
    pub(crate) last_frame_time: Instant,
}

impl AppContext {
    /// Create the surface, swapchain and frame slots for `window`.
    ///
    /// # Safety
    /// The window must have valid handles and outlive the returned context.
    pub(crate) unsafe fn new(
        window: Arc<Window>,
        gpu: GpuContext,
        vsync: bool,
        scheduler_config: SchedulerConfig,
    ) -> anyhow::Result<Self> {
        // SAFETY: caller guarantees the window has valid handles
        let surface = unsafe { SurfaceContext::from_window(&gpu, window.as_ref())? };

        let size = window.inner_size();
        let device = VulkanFrameDevice::new(&gpu, surface, size.width, size.height, vsync)?;
        let scheduler = FrameScheduler::new(device, scheduler_config)?;

        Ok(Self {
            scheduler,
            gpu,
            window,
            last_frame_time: Instant::now(),
        })
    }

    /// Get the current swapchain extent.
    pub fn extent(&self) -> vk::Extent2D {
        self.scheduler.device().extent()
    }

    /// Get the swapchain width.
    pub fn width(&self) -> u32 {
        self.extent().width
    }

    /// Get the swapchain height.
    pub fn height(&self) -> u32 {
        self.extent().height
    }

    /// Get the aspect ratio (width / height).
    pub fn aspect_ratio(&self) -> f32 {
        let extent = self.extent();
        extent.width as f32 / extent.height.max(1) as f32
    }

    /// Frames submitted so far.
    pub fn frame_count(&self) -> u64 {
        self.scheduler.frame_count()
    }

    /// Get the number of frames in flight.
    pub fn frames_in_flight(&self) -> usize {
        self.scheduler.frames_in_flight()
    }

    /// Wait for every in-flight frame to complete.
    pub fn wait_for_all_in_flight_frames(&mut self) -> anyhow::Result<()> {
        self.scheduler.wait_all()?;
        Ok(())
    }

    /// Recreate the swapchain (e.g. after resize) once all frames are idle.
    pub(crate) fn recreate_swapchain(&mut self, width: u32, height: u32) -> anyhow::Result<()> {
        self.scheduler.wait_all()?;
        self.scheduler
            .device_mut()
            .recreate_swapchain(&self.gpu, width, height)?;
        Ok(())
    }
}
