//! Vulkan instance creation and physical device selection.

use std::ffi::{CStr, CString};

use ash::vk;

use crate::capabilities::GpuCapabilities;
use crate::error::{GpuError, Result};

const ENGINE_NAME: &CStr = c"Prism";
const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Instance extensions needed to present to a window on this platform.
pub fn surface_extensions() -> Vec<&'static CStr> {
    let mut extensions = vec![ash::khr::surface::NAME];
    if cfg!(target_os = "windows") {
        extensions.push(ash::khr::win32_surface::NAME);
    }
    if cfg!(target_os = "linux") {
        extensions.push(ash::khr::xlib_surface::NAME);
        extensions.push(ash::khr::wayland_surface::NAME);
    }
    if cfg!(target_os = "macos") {
        extensions.push(ash::ext::metal_surface::NAME);
        extensions.push(ash::khr::portability_enumeration::NAME);
    }
    extensions
}

/// Create a Vulkan 1.3 instance.
///
/// Validation is enabled only when requested and the layer is installed.
///
/// # Safety
/// The entry must be a valid Vulkan entry point.
pub unsafe fn create_instance(
    entry: &ash::Entry,
    app_name: &str,
    enable_validation: bool,
) -> Result<ash::Instance> {
    let app_name = CString::new(app_name)
        .map_err(|e| GpuError::Other(format!("Invalid application name: {e}")))?;
    let version = vk::make_api_version(0, 0, 1, 0);
    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(version)
        .engine_name(ENGINE_NAME)
        .engine_version(version)
        .api_version(vk::API_VERSION_1_3);

    let extensions: Vec<*const i8> = surface_extensions().iter().map(|e| e.as_ptr()).collect();

    let mut layers = Vec::new();
    if enable_validation {
        if layer_available(entry, VALIDATION_LAYER)? {
            layers.push(VALIDATION_LAYER.as_ptr());
        } else {
            tracing::warn!("Validation requested but {VALIDATION_LAYER:?} is not installed");
        }
    }

    let flags = if cfg!(target_os = "macos") {
        vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR
    } else {
        vk::InstanceCreateFlags::empty()
    };

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extensions)
        .enabled_layer_names(&layers)
        .flags(flags);

    let instance = entry.create_instance(&create_info, None)?;
    tracing::debug!(
        "Vulkan instance created ({} extensions, validation {})",
        extensions.len(),
        if layers.is_empty() { "off" } else { "on" }
    );
    Ok(instance)
}

unsafe fn layer_available(entry: &ash::Entry, name: &CStr) -> Result<bool> {
    let available = entry.enumerate_instance_layer_properties()?;
    Ok(available
        .iter()
        .any(|props| props.layer_name_as_c_str().is_ok_and(|layer| layer == name)))
}

/// Pick the highest-ranked device able to run the ray tracer.
///
/// # Safety
/// The instance must be valid.
pub unsafe fn select_physical_device(instance: &ash::Instance) -> Result<vk::PhysicalDevice> {
    let mut best: Option<(u64, vk::PhysicalDevice)> = None;

    for device in instance.enumerate_physical_devices()? {
        let capabilities = GpuCapabilities::query(instance, device);
        match device_rank(&capabilities) {
            Some(rank) => {
                tracing::debug!("Candidate {} (rank {rank})", capabilities.summary());
                if best.map_or(true, |(best_rank, _)| rank > best_rank) {
                    best = Some((rank, device));
                }
            }
            None => tracing::debug!("Skipping {}", capabilities.summary()),
        }
    }

    best.map(|(_, device)| device)
        .ok_or(GpuError::NoSuitableDevice)
}

/// Rank a device for selection, or `None` if it cannot run the ray tracer.
///
/// Device type dominates; device-local memory breaks ties at 1 point per GiB.
pub fn device_rank(capabilities: &GpuCapabilities) -> Option<u64> {
    if !capabilities.meets_requirements() {
        return None;
    }
    let type_rank = match capabilities.device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 50,
        _ => 0,
    };
    Some(type_rank + capabilities.device_local_memory_mb / 1024)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{GpuVendor, RayTracingCapabilities};
    use std::collections::HashSet;

    fn device(
        device_type: vk::PhysicalDeviceType,
        memory_mb: u64,
        ray_tracing: bool,
    ) -> GpuCapabilities {
        GpuCapabilities {
            vendor: GpuVendor::Other(0),
            device_name: "candidate".to_string(),
            device_type,
            api_version: vk::API_VERSION_1_3,
            driver_version: 0,
            supports_buffer_device_address: true,
            supports_descriptor_indexing: true,
            device_local_memory_mb: memory_mb,
            ray_tracing: ray_tracing.then(RayTracingCapabilities::default),
            available_extensions: HashSet::new(),
        }
    }

    #[test]
    fn surface_extension_always_present() {
        assert_eq!(surface_extensions()[0], ash::khr::surface::NAME);
    }

    #[test]
    fn discrete_beats_integrated() {
        let discrete = device(vk::PhysicalDeviceType::DISCRETE_GPU, 4096, true);
        let integrated = device(vk::PhysicalDeviceType::INTEGRATED_GPU, 65536, true);
        assert!(device_rank(&discrete) > device_rank(&integrated));
    }

    #[test]
    fn memory_breaks_ties() {
        let small = device(vk::PhysicalDeviceType::DISCRETE_GPU, 8192, true);
        let large = device(vk::PhysicalDeviceType::DISCRETE_GPU, 16384, true);
        assert_eq!(device_rank(&small), Some(1008));
        assert_eq!(device_rank(&large), Some(1016));
    }

    #[test]
    fn no_ray_tracing_never_ranked() {
        let device = device(vk::PhysicalDeviceType::DISCRETE_GPU, 24576, false);
        assert_eq!(device_rank(&device), None);
    }
}
