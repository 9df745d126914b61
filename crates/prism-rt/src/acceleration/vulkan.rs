//! Vulkan implementation of [`AccelerationDevice`].

use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;
use prism_gpu::{GpuAllocator, GpuBuffer, GpuContext, GpuError, OneShotCommandExecutor, Result};

use super::description::{BuildDescription, BuildSizes, StructureKind};
use super::device::{AccelerationDevice, BufferRole};

/// Builds acceleration structures on a [`GpuContext`]'s render queue.
///
/// Holds shared handles only, so it can live alongside the context. It must
/// be dropped before the context.
pub struct VulkanAccelerationDevice {
    device: Arc<ash::Device>,
    allocator: Arc<Mutex<GpuAllocator>>,
    loader: ash::khr::acceleration_structure::Device,
    executor: OneShotCommandExecutor,
    scratch_alignment: u64,
}

impl VulkanAccelerationDevice {
    /// Create a device bound to `context`, waiting at most `timeout_ns` per build.
    pub fn new(context: &GpuContext, timeout_ns: u64) -> Result<Self> {
        let executor = OneShotCommandExecutor::new(
            context.shared_device(),
            context.graphics_queue_family(),
            context.graphics_queue(),
            timeout_ns,
        )?;

        Ok(Self {
            device: context.shared_device(),
            allocator: context.shared_allocator(),
            loader: context.acceleration_structure_loader().clone(),
            executor,
            scratch_alignment: u64::from(context.ray_tracing().min_scratch_offset_alignment),
        })
    }
}

/// Translate a description into the single Vulkan geometry it describes.
fn geometry(description: &BuildDescription) -> vk::AccelerationStructureGeometryKHR<'static> {
    match *description {
        BuildDescription::Triangles {
            vertex_address,
            vertex_stride,
            max_vertex,
            index_address,
            transform_address,
            ..
        } => vk::AccelerationStructureGeometryKHR::default()
            .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
            .flags(vk::GeometryFlagsKHR::OPAQUE)
            .geometry(vk::AccelerationStructureGeometryDataKHR {
                triangles: vk::AccelerationStructureGeometryTrianglesDataKHR::default()
                    .vertex_format(BuildDescription::VERTEX_FORMAT)
                    .vertex_data(vk::DeviceOrHostAddressConstKHR {
                        device_address: vertex_address,
                    })
                    .vertex_stride(vertex_stride)
                    .max_vertex(max_vertex)
                    .index_type(BuildDescription::INDEX_TYPE)
                    .index_data(vk::DeviceOrHostAddressConstKHR {
                        device_address: index_address,
                    })
                    .transform_data(vk::DeviceOrHostAddressConstKHR {
                        device_address: transform_address,
                    }),
            }),
        BuildDescription::Instances { data_address, .. } => {
            vk::AccelerationStructureGeometryKHR::default()
                .geometry_type(vk::GeometryTypeKHR::INSTANCES)
                .flags(vk::GeometryFlagsKHR::OPAQUE)
                .geometry(vk::AccelerationStructureGeometryDataKHR {
                    instances: vk::AccelerationStructureGeometryInstancesDataKHR::default()
                        .array_of_pointers(false)
                        .data(vk::DeviceOrHostAddressConstKHR {
                            device_address: data_address,
                        }),
                })
        }
    }
}

impl AccelerationDevice for VulkanAccelerationDevice {
    type Buffer = GpuBuffer;

    fn build_sizes(&self, description: &BuildDescription) -> BuildSizes {
        let geometry = geometry(description);
        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(description.kind().vk_type())
            .flags(BuildDescription::BUILD_FLAGS)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(std::slice::from_ref(&geometry));

        let mut build_sizes = vk::AccelerationStructureBuildSizesInfoKHR::default();
        // SAFETY: the loader belongs to a live device and the geometry is fully initialized
        unsafe {
            self.loader.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &build_info,
                &[description.primitive_count()],
                &mut build_sizes,
            );
        }

        BuildSizes {
            storage: build_sizes.acceleration_structure_size,
            scratch: build_sizes.build_scratch_size,
        }
    }

    fn allocate(&mut self, role: BufferRole, size: u64, name: &str) -> Result<GpuBuffer> {
        let alignment = match role {
            BufferRole::Scratch => self.scratch_alignment,
            // Structures must start on a 256-byte boundary within their buffer
            BufferRole::Storage => 256,
            BufferRole::BuildInput => 16,
        };
        self.allocator.lock().create_buffer_aligned(
            size,
            role.usage(),
            role.location(),
            name,
            alignment,
        )
    }

    fn write(&mut self, buffer: &GpuBuffer, offset: u64, bytes: &[u8]) -> Result<()> {
        buffer.write_bytes(offset, bytes)
    }

    fn buffer_size(&self, buffer: &GpuBuffer) -> u64 {
        buffer.size
    }

    fn buffer_address(&self, buffer: &GpuBuffer) -> vk::DeviceAddress {
        buffer.device_address(&self.device)
    }

    fn create_structure(
        &mut self,
        kind: StructureKind,
        storage: &GpuBuffer,
        size: u64,
    ) -> Result<vk::AccelerationStructureKHR> {
        let create_info = vk::AccelerationStructureCreateInfoKHR::default()
            .buffer(storage.buffer)
            .offset(0)
            .size(size)
            .ty(kind.vk_type());

        // SAFETY: storage is a live ACCELERATION_STRUCTURE_STORAGE buffer of at least `size` bytes
        unsafe { self.loader.create_acceleration_structure(&create_info, None) }.map_err(
            |source| GpuError::StructureCreation {
                what: kind.label().to_string(),
                source,
            },
        )
    }

    fn structure_address(&self, structure: vk::AccelerationStructureKHR) -> vk::DeviceAddress {
        let address_info =
            vk::AccelerationStructureDeviceAddressInfoKHR::default().acceleration_structure(structure);
        // SAFETY: the structure was created from this loader and is not destroyed
        unsafe {
            self.loader
                .get_acceleration_structure_device_address(&address_info)
        }
    }

    fn build_and_wait(
        &mut self,
        what: &str,
        target: vk::AccelerationStructureKHR,
        description: &BuildDescription,
        scratch_address: vk::DeviceAddress,
    ) -> Result<()> {
        let geometry = geometry(description);
        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(description.kind().vk_type())
            .flags(BuildDescription::BUILD_FLAGS)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .dst_acceleration_structure(target)
            .geometries(std::slice::from_ref(&geometry))
            .scratch_data(vk::DeviceOrHostAddressKHR {
                device_address: scratch_address,
            });

        let build_range = vk::AccelerationStructureBuildRangeInfoKHR::default()
            .primitive_count(description.primitive_count())
            .primitive_offset(0)
            .first_vertex(0)
            .transform_offset(0);

        // Make the result visible to later builds and to ray tracing shaders
        let barrier = vk::MemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR)
            .dst_access_mask(
                vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR | vk::AccessFlags::SHADER_READ,
            );

        let loader = &self.loader;
        let result = self.executor.submit(what, |device, cmd| unsafe {
            loader.cmd_build_acceleration_structures(
                cmd,
                std::slice::from_ref(&build_info),
                &[std::slice::from_ref(&build_range)],
            );
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
                vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR
                    | vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
                vk::DependencyFlags::empty(),
                std::slice::from_ref(&barrier),
                &[],
                &[],
            );
        });

        result.map_err(|e| match e {
            GpuError::Vulkan(source) => GpuError::BuildFailed {
                what: what.to_string(),
                source,
            },
            other => other,
        })
    }

    fn destroy_structure(&mut self, structure: vk::AccelerationStructureKHR) {
        // SAFETY: no pending work references the structure once its build was waited on
        unsafe { self.loader.destroy_acceleration_structure(structure, None) };
    }

    fn free(&mut self, mut buffer: GpuBuffer) -> Result<()> {
        self.allocator.lock().free_buffer(&mut buffer)
    }
}
