//! Swapchain-backed [`FrameDevice`].

use std::sync::Arc;

use ash::vk;
use prism_gpu::{
    command::{begin_command_buffer, end_command_buffer, submit_command_buffers},
    CommandPool, Fence, GpuContext, PresentOutcome, Result, Semaphore, SurfaceContext, Swapchain,
};

use super::{AcquiredImage, FrameContext, FrameDevice};

/// Stages that wait on image acquisition. The frame writes the swapchain
/// image either by transfer or as a color attachment.
const ACQUIRE_WAIT_STAGES: vk::PipelineStageFlags = vk::PipelineStageFlags::from_raw(
    vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT.as_raw()
        | vk::PipelineStageFlags::TRANSFER.as_raw(),
);

/// Command buffer and synchronization objects of one frame slot.
pub struct VulkanFrameSlot {
    command_buffer: vk::CommandBuffer,
    image_ready: Semaphore,
    render_complete: Semaphore,
    work_done: Fence,
    name: String,
}

impl VulkanFrameSlot {
    /// Command buffer recorded for this slot.
    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.command_buffer
    }
}

/// Presents to a window surface on the render queue.
///
/// Owns the surface, swapchain and the command pool that frame slots
/// allocate from. Must be dropped before the [`GpuContext`].
pub struct VulkanFrameDevice {
    device: Arc<ash::Device>,
    queue: vk::Queue,
    pool: CommandPool,
    surface: SurfaceContext,
    swapchain: Swapchain,
    vsync: bool,
}

impl VulkanFrameDevice {
    /// Create a swapchain for `surface` and a command pool for frame slots.
    pub fn new(
        gpu: &GpuContext,
        surface: SurfaceContext,
        width: u32,
        height: u32,
        vsync: bool,
    ) -> Result<Self> {
        // SAFETY: the surface was created from this context
        let swapchain =
            match unsafe { surface.create_swapchain(gpu, width.max(1), height.max(1), vsync, None) } {
                Ok(swapchain) => swapchain,
                Err(e) => {
                    // SAFETY: nothing was created from the surface yet
                    unsafe { surface.destroy() };
                    return Err(e);
                }
            };

        // SAFETY: the queue family belongs to this device
        let pool = match unsafe {
            CommandPool::new(
                gpu.device(),
                gpu.graphics_queue_family(),
                vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            )
        } {
            Ok(pool) => pool,
            Err(e) => {
                // SAFETY: the swapchain was never used
                unsafe {
                    swapchain.destroy(gpu.device(), &surface.swapchain_loader);
                    surface.destroy();
                }
                return Err(e);
            }
        };

        tracing::info!(
            "Swapchain created: {}x{} ({} images)",
            swapchain.extent.width,
            swapchain.extent.height,
            swapchain.image_count()
        );

        Ok(Self {
            device: gpu.shared_device(),
            queue: gpu.graphics_queue(),
            pool,
            surface,
            swapchain,
            vsync,
        })
    }

    /// The current swapchain.
    pub fn swapchain(&self) -> &Swapchain {
        &self.swapchain
    }

    /// Extent of the current swapchain.
    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain.extent
    }

    /// Replace the swapchain after a resize or an out-of-date report.
    ///
    /// Every frame slot must be idle; call
    /// [`FrameScheduler::wait_all`](super::FrameScheduler::wait_all) first.
    pub fn recreate_swapchain(&mut self, gpu: &GpuContext, width: u32, height: u32) -> Result<()> {
        // SAFETY: the caller has waited for every submission using the swapchain
        let replacement = unsafe {
            self.surface.recreate_swapchain(
                gpu,
                &mut self.swapchain,
                width.max(1),
                height.max(1),
                self.vsync,
            )?
        };
        self.swapchain = replacement;

        tracing::info!(
            "Swapchain recreated: {}x{}",
            self.swapchain.extent.width,
            self.swapchain.extent.height
        );
        Ok(())
    }
}

impl FrameDevice for VulkanFrameDevice {
    type Slot = VulkanFrameSlot;

    fn create_slot(&mut self, index: usize) -> Result<VulkanFrameSlot> {
        let image_ready = Semaphore::new(self.device.clone())?;
        let render_complete = Semaphore::new(self.device.clone())?;
        // Signaled so the first wait on the slot returns immediately
        let work_done = Fence::new(self.device.clone(), true)?;
        // SAFETY: the pool belongs to this device
        let command_buffer = unsafe { self.pool.allocate_command_buffer(&self.device)? };

        Ok(VulkanFrameSlot {
            command_buffer,
            image_ready,
            render_complete,
            work_done,
            name: format!("frame slot {index}"),
        })
    }

    fn wait(&mut self, slot: &VulkanFrameSlot, timeout_ns: u64) -> Result<()> {
        slot.work_done.wait(timeout_ns, &slot.name)
    }

    fn acquire(&mut self, slot: &VulkanFrameSlot, timeout_ns: u64) -> Result<AcquiredImage> {
        // SAFETY: the swapchain is live and the semaphore has no pending signal
        let (index, suboptimal) = unsafe {
            self.swapchain.acquire_next_image(
                &self.surface.swapchain_loader,
                slot.image_ready.handle(),
                timeout_ns,
            )?
        };

        Ok(AcquiredImage {
            index,
            image: self.swapchain.images[index as usize],
            extent: self.swapchain.extent,
            suboptimal,
        })
    }

    fn begin(&mut self, slot: &VulkanFrameSlot) -> Result<vk::CommandBuffer> {
        // SAFETY: the slot's fence has signaled, so the buffer is not pending
        unsafe {
            self.device
                .reset_command_buffer(slot.command_buffer, vk::CommandBufferResetFlags::empty())?;
            begin_command_buffer(
                &self.device,
                slot.command_buffer,
                vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            )?;
        }
        Ok(slot.command_buffer)
    }

    fn end(&mut self, slot: &VulkanFrameSlot) -> Result<()> {
        // SAFETY: the buffer is in the recording state
        unsafe { end_command_buffer(&self.device, slot.command_buffer) }
    }

    fn reset_fence(&mut self, slot: &VulkanFrameSlot) -> Result<()> {
        slot.work_done.reset()
    }

    fn submit(&mut self, slot: &VulkanFrameSlot) -> Result<()> {
        // SAFETY: all handles belong to this device and the buffer is executable
        unsafe {
            submit_command_buffers(
                &self.device,
                self.queue,
                &[slot.command_buffer],
                &[slot.image_ready.handle()],
                &[ACQUIRE_WAIT_STAGES],
                &[slot.render_complete.handle()],
                slot.work_done.handle(),
            )
        }
    }

    fn present(&mut self, slot: &VulkanFrameSlot, image_index: u32) -> Result<PresentOutcome> {
        // SAFETY: the image was acquired this frame and its render is submitted
        unsafe {
            self.swapchain.present(
                &self.surface.swapchain_loader,
                self.queue,
                image_index,
                &[slot.render_complete.handle()],
            )
        }
    }

    fn destroy_slot(&mut self, slot: VulkanFrameSlot) {
        // SAFETY: the slot's fence has signaled
        unsafe { self.pool.free_command_buffer(&self.device, slot.command_buffer) };
        // Semaphores and fence are released on drop
    }
}

impl Drop for VulkanFrameDevice {
    fn drop(&mut self) {
        // SAFETY: slots are destroyed by the scheduler before its device drops
        unsafe {
            self.pool.destroy(&self.device);
            self.swapchain
                .destroy(&self.device, &self.surface.swapchain_loader);
            self.surface.destroy();
        }
    }
}

/// Minimal recorder: move the acquired image to `PRESENT_SRC_KHR` without
/// drawing into it.
pub fn record_present_transition(device: &ash::Device, frame: &FrameContext) {
    let barrier = vk::ImageMemoryBarrier::default()
        .src_access_mask(vk::AccessFlags::empty())
        .dst_access_mask(vk::AccessFlags::empty())
        .old_layout(vk::ImageLayout::UNDEFINED)
        .new_layout(vk::ImageLayout::PRESENT_SRC_KHR)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(frame.image.image)
        .subresource_range(color_range());

    // SAFETY: the command buffer is recording and the image was acquired
    unsafe {
        device.cmd_pipeline_barrier(
            frame.command_buffer,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        );
    }
}

pub(crate) fn color_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange::default()
        .aspect_mask(vk::ImageAspectFlags::COLOR)
        .base_mip_level(0)
        .level_count(1)
        .base_array_layer(0)
        .layer_count(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_waits_cover_transfer_and_color_output() {
        assert!(ACQUIRE_WAIT_STAGES.contains(vk::PipelineStageFlags::TRANSFER));
        assert!(ACQUIRE_WAIT_STAGES.contains(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT));
    }

    #[test]
    fn color_range_is_single_level() {
        let range = color_range();
        assert_eq!(range.aspect_mask, vk::ImageAspectFlags::COLOR);
        assert_eq!(range.level_count, 1);
        assert_eq!(range.layer_count, 1);
    }
}
