//! Vulkan abstraction layer for the Prism ray tracer.
//!
//! This crate provides:
//! - Vulkan instance and device management with ray tracing extensions
//! - GPU capability detection
//! - Memory allocation via gpu-allocator
//! - Command buffer management and one-shot submission
//! - Owning synchronization primitives
//! - Descriptor set helpers
//! - Surface and swapchain handling

pub mod capabilities;
pub mod command;
pub mod context;
pub mod descriptors;
pub mod error;
pub mod instance;
pub mod memory;
pub mod surface;
pub mod swapchain;
pub mod sync;

pub use capabilities::{GpuCapabilities, GpuVendor, RayTracingCapabilities};
pub use command::{CommandPool, OneShotCommandExecutor};
pub use context::{GpuContext, GpuContextBuilder};
pub use descriptors::{DescriptorPool, DescriptorSetLayoutBuilder};
pub use error::{GpuError, Result};
pub use memory::{GpuAllocator, GpuBuffer, GpuImage};
pub use surface::{SurfaceCapabilities, SurfaceContext};
pub use swapchain::{PresentOutcome, Swapchain};
pub use sync::{Fence, Semaphore};

/// Default timeout for host-side fence waits (5 seconds).
///
/// Waits that exceed this are reported as a hung device, never retried.
pub const DEFAULT_FENCE_TIMEOUT_NS: u64 = 5_000_000_000;
