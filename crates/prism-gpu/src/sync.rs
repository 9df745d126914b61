//! Synchronization primitives.
//!
//! [`Fence`] and [`Semaphore`] own their Vulkan handle and destroy it on drop.
//! They hold a clone of the device so they can be torn down in any scope, but
//! they must still be dropped before the [`GpuContext`](crate::GpuContext)
//! that created the device.

use std::sync::Arc;

use ash::vk;

use crate::error::{GpuError, Result};

/// Owning wrapper around a binary semaphore.
pub struct Semaphore {
    device: Arc<ash::Device>,
    raw: vk::Semaphore,
}

impl Semaphore {
    /// Create a semaphore.
    pub fn new(device: Arc<ash::Device>) -> Result<Self> {
        let create_info = vk::SemaphoreCreateInfo::default();
        // SAFETY: the device is alive for as long as the Arc is held
        let raw = unsafe { device.create_semaphore(&create_info, None)? };
        Ok(Self { device, raw })
    }

    /// Get the raw handle.
    pub fn handle(&self) -> vk::Semaphore {
        self.raw
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        // SAFETY: the handle was created from this device and is no longer in use
        unsafe { self.device.destroy_semaphore(self.raw, None) };
    }
}

/// Owning wrapper around a fence.
pub struct Fence {
    device: Arc<ash::Device>,
    raw: vk::Fence,
}

impl Fence {
    /// Create a fence, optionally already signaled.
    pub fn new(device: Arc<ash::Device>, signaled: bool) -> Result<Self> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };

        let create_info = vk::FenceCreateInfo::default().flags(flags);
        // SAFETY: the device is alive for as long as the Arc is held
        let raw = unsafe { device.create_fence(&create_info, None)? };
        Ok(Self { device, raw })
    }

    /// Get the raw handle.
    pub fn handle(&self) -> vk::Fence {
        self.raw
    }

    /// Block until the fence is signaled.
    ///
    /// `what` names the guarded work in the timeout diagnostic.
    pub fn wait(&self, timeout_ns: u64, what: &str) -> Result<()> {
        // SAFETY: the fence belongs to this device
        let result = unsafe { self.device.wait_for_fences(&[self.raw], true, timeout_ns) };
        match result {
            Ok(()) => Ok(()),
            Err(vk::Result::TIMEOUT) => Err(GpuError::Timeout(what.to_string())),
            Err(e) => Err(GpuError::from(e)),
        }
    }

    /// Reset the fence to unsignaled.
    pub fn reset(&self) -> Result<()> {
        // SAFETY: the fence belongs to this device and is not pending
        unsafe { self.device.reset_fences(&[self.raw])? };
        Ok(())
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        // SAFETY: the handle was created from this device and is no longer in use
        unsafe { self.device.destroy_fence(self.raw, None) };
    }
}
