//! The device seam used by the acceleration structure builder.

use ash::vk;
use gpu_allocator::MemoryLocation;
use prism_gpu::Result;

use super::description::{BuildDescription, BuildSizes, StructureKind};

/// What an allocation made on behalf of the builder is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferRole {
    /// Backing storage of a structure.
    Storage,
    /// Scratch memory for one build.
    Scratch,
    /// Host-written build input: vertices, indices, transforms or instances.
    BuildInput,
}

impl BufferRole {
    /// Buffer usage flags for the role.
    pub fn usage(self) -> vk::BufferUsageFlags {
        let usage = match self {
            Self::Storage => vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR,
            Self::Scratch => vk::BufferUsageFlags::STORAGE_BUFFER,
            Self::BuildInput => {
                vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
                    | vk::BufferUsageFlags::STORAGE_BUFFER
            }
        };
        usage | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
    }

    /// Memory location for the role.
    pub fn location(self) -> MemoryLocation {
        match self {
            Self::Storage | Self::Scratch => MemoryLocation::GpuOnly,
            Self::BuildInput => MemoryLocation::CpuToGpu,
        }
    }
}

/// Device operations the builder depends on.
///
/// Every build goes through the same two-phase protocol on top of these:
/// query sizes, allocate exactly those sizes, create, build and wait.
pub trait AccelerationDevice {
    /// Buffer allocation owned by whoever requested it.
    type Buffer;

    /// Query storage and scratch sizes for a description.
    fn build_sizes(&self, description: &BuildDescription) -> BuildSizes;

    /// Allocate a buffer of at least `size` bytes for `role`.
    fn allocate(&mut self, role: BufferRole, size: u64, name: &str) -> Result<Self::Buffer>;

    /// Copy bytes into a host-visible buffer.
    fn write(&mut self, buffer: &Self::Buffer, offset: u64, bytes: &[u8]) -> Result<()>;

    /// Allocated size of a buffer.
    fn buffer_size(&self, buffer: &Self::Buffer) -> u64;

    /// Device address of a buffer.
    fn buffer_address(&self, buffer: &Self::Buffer) -> vk::DeviceAddress;

    /// Create a structure occupying the first `size` bytes of `storage`.
    fn create_structure(
        &mut self,
        kind: StructureKind,
        storage: &Self::Buffer,
        size: u64,
    ) -> Result<vk::AccelerationStructureKHR>;

    /// Device address of a created structure.
    fn structure_address(&self, structure: vk::AccelerationStructureKHR) -> vk::DeviceAddress;

    /// Record and submit a full build of `target`, blocking until the device
    /// confirms completion.
    fn build_and_wait(
        &mut self,
        what: &str,
        target: vk::AccelerationStructureKHR,
        description: &BuildDescription,
        scratch_address: vk::DeviceAddress,
    ) -> Result<()>;

    /// Destroy a structure handle. Its storage must still be live.
    fn destroy_structure(&mut self, structure: vk::AccelerationStructureKHR);

    /// Release a buffer.
    fn free(&mut self, buffer: Self::Buffer) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_role_is_addressable() {
        for role in [BufferRole::Storage, BufferRole::Scratch, BufferRole::BuildInput] {
            assert!(role
                .usage()
                .contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS));
        }
    }

    #[test]
    fn build_inputs_are_host_visible() {
        assert_eq!(BufferRole::BuildInput.location(), MemoryLocation::CpuToGpu);
        assert_eq!(BufferRole::Storage.location(), MemoryLocation::GpuOnly);
        assert_eq!(BufferRole::Scratch.location(), MemoryLocation::GpuOnly);
    }
}
