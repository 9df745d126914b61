//! GPU error types.

use ash::vk;
use prism_core::GeometryError;
use thiserror::Error;

/// GPU-related errors.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(vk::Result),

    /// No suitable GPU found.
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// Required extension not supported.
    #[error("Required extension not supported: {0}")]
    ExtensionNotSupported(String),

    /// Memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// Surface creation failed.
    #[error("Surface creation failed: {0}")]
    SurfaceCreation(String),

    /// Swapchain creation failed.
    #[error("Swapchain creation failed: {0}")]
    SwapchainCreation(String),

    /// Geometry rejected before any device work was issued.
    #[error("Invalid geometry: {0}")]
    InvalidGeometry(#[from] GeometryError),

    /// A build size query reported a size that cannot be allocated.
    #[error("Invalid build size for {what}: storage {storage} bytes, scratch {scratch} bytes")]
    InvalidBuildSize {
        what: String,
        storage: u64,
        scratch: u64,
    },

    /// Acceleration structure creation failed.
    #[error("Failed to create {what}: {source}")]
    StructureCreation { what: String, source: vk::Result },

    /// The device did not complete a build.
    #[error("Build of {what} failed: {source}")]
    BuildFailed { what: String, source: vk::Result },

    /// A fence wait exceeded its timeout.
    #[error("Timed out waiting for {0}; device may be hung")]
    Timeout(String),

    /// The surface changed and the swapchain must be recreated.
    #[error("Surface out of date")]
    SurfaceOutOfDate,

    /// The logical device was lost.
    #[error("Device lost")]
    DeviceLost,

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl From<vk::Result> for GpuError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_DATE_KHR => Self::SurfaceOutOfDate,
            vk::Result::ERROR_DEVICE_LOST => Self::DeviceLost,
            other => Self::Vulkan(other),
        }
    }
}

impl GpuError {
    /// Whether the caller can recover by recreating the swapchain.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::SurfaceOutOfDate)
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;
