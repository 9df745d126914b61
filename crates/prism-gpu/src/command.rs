//! Command buffer management.

use std::sync::Arc;

use ash::vk;

use crate::error::Result;
use crate::sync::Fence;

/// Command pool for allocating command buffers.
pub struct CommandPool {
    pool: vk::CommandPool,
    queue_family: u32,
}

impl CommandPool {
    /// Create a new command pool.
    ///
    /// # Safety
    /// The device must be valid and the queue family must exist.
    pub unsafe fn new(
        device: &ash::Device,
        queue_family: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> Result<Self> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(flags);

        let pool = device.create_command_pool(&create_info, None)?;

        Ok(Self { pool, queue_family })
    }

    /// Get the raw pool handle.
    pub fn handle(&self) -> vk::CommandPool {
        self.pool
    }

    /// Get the queue family index.
    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// Allocate a single primary command buffer.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn allocate_command_buffer(&self, device: &ash::Device) -> Result<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let buffers = device.allocate_command_buffers(&alloc_info)?;
        Ok(buffers[0])
    }

    /// Free a command buffer back to the pool.
    ///
    /// # Safety
    /// The command buffer must belong to this pool and must not be pending.
    pub unsafe fn free_command_buffer(&self, device: &ash::Device, cmd: vk::CommandBuffer) {
        device.free_command_buffers(self.pool, &[cmd]);
    }

    /// Destroy the command pool.
    ///
    /// # Safety
    /// The device must be valid and the pool must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_command_pool(self.pool, None);
    }
}

/// Begin recording a command buffer.
///
/// # Safety
/// The device and command buffer must be valid.
pub unsafe fn begin_command_buffer(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    flags: vk::CommandBufferUsageFlags,
) -> Result<()> {
    let begin_info = vk::CommandBufferBeginInfo::default().flags(flags);
    device.begin_command_buffer(cmd, &begin_info)?;
    Ok(())
}

/// End recording a command buffer.
///
/// # Safety
/// The device and command buffer must be valid.
pub unsafe fn end_command_buffer(device: &ash::Device, cmd: vk::CommandBuffer) -> Result<()> {
    device.end_command_buffer(cmd)?;
    Ok(())
}

/// Submit command buffers to a queue.
///
/// # Safety
/// All handles must be valid.
pub unsafe fn submit_command_buffers(
    device: &ash::Device,
    queue: vk::Queue,
    command_buffers: &[vk::CommandBuffer],
    wait_semaphores: &[vk::Semaphore],
    wait_stages: &[vk::PipelineStageFlags],
    signal_semaphores: &[vk::Semaphore],
    fence: vk::Fence,
) -> Result<()> {
    let submit_info = vk::SubmitInfo::default()
        .command_buffers(command_buffers)
        .wait_semaphores(wait_semaphores)
        .wait_dst_stage_mask(wait_stages)
        .signal_semaphores(signal_semaphores);

    device.queue_submit(queue, &[submit_info], fence)?;
    Ok(())
}

/// Records a single command sequence, submits it and blocks until the device
/// has finished executing it.
///
/// Used for setup work such as acceleration structure builds. Completion is
/// tracked with a dedicated fence rather than a queue idle, so other queue work
/// is not serialized behind it.
pub struct OneShotCommandExecutor {
    device: Arc<ash::Device>,
    pool: CommandPool,
    queue: vk::Queue,
    timeout_ns: u64,
}

impl OneShotCommandExecutor {
    /// Create an executor with its own transient command pool.
    pub fn new(
        device: Arc<ash::Device>,
        queue_family: u32,
        queue: vk::Queue,
        timeout_ns: u64,
    ) -> Result<Self> {
        // SAFETY: the device is valid and the queue family comes from it
        let pool = unsafe {
            CommandPool::new(&device, queue_family, vk::CommandPoolCreateFlags::TRANSIENT)?
        };

        Ok(Self {
            device,
            pool,
            queue,
            timeout_ns,
        })
    }

    /// Record with `record`, submit, and wait for completion.
    ///
    /// `what` describes the work for diagnostics.
    pub fn submit<F>(&self, what: &str, record: F) -> Result<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer),
    {
        let device = &*self.device;

        // SAFETY: pool and queue belong to this device; the command buffer is
        // only freed once its fence has signaled
        unsafe {
            let cmd = self.pool.allocate_command_buffer(device)?;

            begin_command_buffer(device, cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
            record(device, cmd);
            end_command_buffer(device, cmd)?;

            let fence = Fence::new(self.device.clone(), false)?;
            submit_command_buffers(device, self.queue, &[cmd], &[], &[], &[], fence.handle())?;
            fence.wait(self.timeout_ns, what)?;

            self.pool.free_command_buffer(device, cmd);
        }

        tracing::trace!("One-shot submission complete: {what}");
        Ok(())
    }
}

impl Drop for OneShotCommandExecutor {
    fn drop(&mut self) {
        // SAFETY: every submission was waited on before `submit` returned
        unsafe { self.pool.destroy(&self.device) };
    }
}
