//! GPU capability detection.

use ash::vk;
use std::collections::HashSet;
use std::ffi::CStr;

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }
}

/// Device extensions a ray tracing device must expose.
pub const RAY_TRACING_EXTENSIONS: [&CStr; 3] = [
    ash::khr::acceleration_structure::NAME,
    ash::khr::ray_tracing_pipeline::NAME,
    ash::khr::deferred_host_operations::NAME,
];

/// Hardware ray tracing limits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RayTracingCapabilities {
    /// Alignment required for scratch buffer device addresses.
    pub min_scratch_offset_alignment: u32,
    /// Maximum instances in a top-level structure.
    pub max_instance_count: u64,
    /// Maximum primitives across all geometries of a bottom-level structure.
    pub max_primitive_count: u64,
    /// Maximum geometries per bottom-level structure.
    pub max_geometry_count: u64,
    /// Size of a shader group handle in bytes.
    pub shader_group_handle_size: u32,
    /// Maximum ray recursion depth.
    pub max_ray_recursion_depth: u32,
}

/// Detected GPU capabilities.
#[derive(Debug, Clone)]
pub struct GpuCapabilities {
    /// GPU vendor
    pub vendor: GpuVendor,
    /// Device name
    pub device_name: String,
    /// Discrete, integrated, virtual or CPU.
    pub device_type: vk::PhysicalDeviceType,
    /// Vulkan API version
    pub api_version: u32,
    /// Driver version
    pub driver_version: u32,

    /// Buffer device address support
    pub supports_buffer_device_address: bool,
    /// Descriptor indexing support
    pub supports_descriptor_indexing: bool,

    /// Device-local memory in MB
    pub device_local_memory_mb: u64,

    /// Ray tracing limits, present only when every ray tracing extension is available.
    pub ray_tracing: Option<RayTracingCapabilities>,

    // Available extensions
    pub available_extensions: HashSet<String>,
}

impl GpuCapabilities {
    /// Query capabilities from a physical device.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        let memory_properties = instance.get_physical_device_memory_properties(physical_device);

        // Get available extensions
        let extensions = instance
            .enumerate_device_extension_properties(physical_device)
            .unwrap_or_default();

        let available_extensions: HashSet<String> = extensions
            .iter()
            .filter_map(|ext| {
                CStr::from_ptr(ext.extension_name.as_ptr())
                    .to_str()
                    .ok()
                    .map(String::from)
            })
            .collect();

        let has_ray_tracing = RAY_TRACING_EXTENSIONS.iter().all(|ext| {
            ext.to_str()
                .map(|name| available_extensions.contains(name))
                .unwrap_or(false)
        });

        // Chain the ray tracing property structs; the driver ignores them when unsupported
        let mut as_properties = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
        let mut rt_properties = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
        let mut properties2 = vk::PhysicalDeviceProperties2::default();
        if has_ray_tracing {
            properties2 = properties2
                .push_next(&mut as_properties)
                .push_next(&mut rt_properties);
        }
        instance.get_physical_device_properties2(physical_device, &mut properties2);
        let properties = properties2.properties;
        drop(properties2);

        let ray_tracing = has_ray_tracing.then(|| RayTracingCapabilities {
            min_scratch_offset_alignment: as_properties
                .min_acceleration_structure_scratch_offset_alignment,
            max_instance_count: as_properties.max_instance_count,
            max_primitive_count: as_properties.max_primitive_count,
            max_geometry_count: as_properties.max_geometry_count,
            shader_group_handle_size: rt_properties.shader_group_handle_size,
            max_ray_recursion_depth: rt_properties.max_ray_recursion_depth,
        });

        // Parse device info
        let vendor = GpuVendor::from_vendor_id(properties.vendor_id);
        let device_name = CStr::from_ptr(properties.device_name.as_ptr())
            .to_string_lossy()
            .into_owned();

        // Calculate device-local memory
        let device_local_memory_mb: u64 = memory_properties
            .memory_heaps
            .iter()
            .take(memory_properties.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size / (1024 * 1024))
            .sum();

        let api_version = properties.api_version;
        let has_vulkan_1_2 =
            vk::api_version_major(api_version) >= 1 && vk::api_version_minor(api_version) >= 2;

        Self {
            vendor,
            device_name,
            device_type: properties.device_type,
            api_version,
            driver_version: properties.driver_version,

            supports_buffer_device_address: has_vulkan_1_2
                || available_extensions.contains("VK_KHR_buffer_device_address"),
            supports_descriptor_indexing: has_vulkan_1_2
                || available_extensions.contains("VK_EXT_descriptor_indexing"),

            device_local_memory_mb,
            ray_tracing,
            available_extensions,
        }
    }

    /// Check if the GPU can run the ray tracer.
    pub fn meets_requirements(&self) -> bool {
        // Require Vulkan 1.3 for synchronization2
        let api_major = vk::api_version_major(self.api_version);
        let api_minor = vk::api_version_minor(self.api_version);

        if api_major < 1 || (api_major == 1 && api_minor < 3) {
            return false;
        }

        // Acceleration structures are referenced by device address
        if !self.supports_buffer_device_address {
            return false;
        }

        self.ray_tracing.is_some()
    }

    /// Get a human-readable summary of capabilities.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}) - Vulkan {}.{}.{} - {} MB VRAM - ray tracing: {}",
            self.device_name,
            self.vendor,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.device_local_memory_mb,
            if self.ray_tracing.is_some() { "yes" } else { "no" },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capabilities(api_version: u32, ray_tracing: bool) -> GpuCapabilities {
        GpuCapabilities {
            vendor: GpuVendor::Nvidia,
            device_name: "Test GPU".to_string(),
            device_type: vk::PhysicalDeviceType::DISCRETE_GPU,
            api_version,
            driver_version: 0,
            supports_buffer_device_address: true,
            supports_descriptor_indexing: true,
            device_local_memory_mb: 8192,
            ray_tracing: ray_tracing.then(RayTracingCapabilities::default),
            available_extensions: HashSet::new(),
        }
    }

    #[test]
    fn vendor_identification() {
        assert_eq!(GpuVendor::from_vendor_id(0x10DE), GpuVendor::Nvidia);
        assert_eq!(GpuVendor::from_vendor_id(0x1002), GpuVendor::Amd);
        assert_eq!(GpuVendor::from_vendor_id(0x8086), GpuVendor::Intel);
        assert_eq!(GpuVendor::from_vendor_id(0x1234), GpuVendor::Other(0x1234));
    }

    #[test]
    fn ray_tracing_required() {
        assert!(capabilities(vk::API_VERSION_1_3, true).meets_requirements());
        assert!(!capabilities(vk::API_VERSION_1_3, false).meets_requirements());
    }

    #[test]
    fn vulkan_1_3_required() {
        assert!(!capabilities(vk::API_VERSION_1_2, true).meets_requirements());
    }

    #[test]
    fn summary_mentions_ray_tracing() {
        let summary = capabilities(vk::API_VERSION_1_3, true).summary();
        assert!(summary.starts_with("Test GPU (Nvidia) - Vulkan 1.3.0"));
        assert!(summary.ends_with("ray tracing: yes"));
    }
}
