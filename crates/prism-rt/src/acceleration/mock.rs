//! In-memory [`AccelerationDevice`] for tests.

use std::collections::{HashMap, HashSet};

use ash::vk;
use ash::vk::Handle;
use prism_gpu::{GpuError, Result};

use super::description::{BuildDescription, BuildSizes, StructureKind};
use super::device::{AccelerationDevice, BufferRole};
use super::instance::InstanceRecord;

const BUFFER_ADDRESS_BASE: u64 = 0x1_0000_0000;
const STRUCTURE_ADDRESS_BASE: u64 = 0xA000_0000_0000;
const ALLOCATION_GRANULARITY: u64 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Allocate { id: u64, role: BufferRole, size: u64 },
    Write { id: u64, len: usize },
    Create(vk::AccelerationStructureKHR),
    Build {
        target: vk::AccelerationStructureKHR,
        scratch: u64,
    },
    DestroyStructure(vk::AccelerationStructureKHR),
    Free(u64),
}

#[derive(Debug)]
pub struct MockBuffer {
    id: u64,
    size: u64,
}

struct LiveBuffer {
    role: BufferRole,
    contents: Vec<u8>,
}

struct LiveStructure {
    storage: u64,
}

enum SizePolicy {
    Fixed(BuildSizes),
    PerPrimitive(u64),
}

pub struct MockAccelerationDevice {
    next_id: u64,
    sizes: SizePolicy,
    fail_builds: bool,
    buffers: HashMap<u64, LiveBuffer>,
    structures: HashMap<u64, LiveStructure>,
    completed: HashSet<vk::DeviceAddress>,
    events: Vec<Event>,
    allocations: Vec<(BufferRole, u64, u64)>,
    built: Vec<BuildDescription>,
    referenced: Vec<vk::DeviceAddress>,
}

impl MockAccelerationDevice {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            sizes: SizePolicy::Fixed(BuildSizes {
                storage: 4096,
                scratch: 2048,
            }),
            fail_builds: false,
            buffers: HashMap::new(),
            structures: HashMap::new(),
            completed: HashSet::new(),
            events: Vec::new(),
            allocations: Vec::new(),
            built: Vec::new(),
            referenced: Vec::new(),
        }
    }

    pub fn with_sizes(mut self, sizes: BuildSizes) -> Self {
        self.sizes = SizePolicy::Fixed(sizes);
        self
    }

    pub fn with_storage_per_primitive(mut self, bytes: u64) -> Self {
        self.sizes = SizePolicy::PerPrimitive(bytes);
        self
    }

    pub fn failing_builds(mut self) -> Self {
        self.fail_builds = true;
        self
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    pub fn live_structures(&self) -> usize {
        self.structures.len()
    }

    /// `(requested, allocated)` sizes for every allocation made for `role`.
    pub fn allocations(&self, role: BufferRole) -> Vec<(u64, u64)> {
        self.allocations
            .iter()
            .filter(|(r, _, _)| *r == role)
            .map(|&(_, requested, allocated)| (requested, allocated))
            .collect()
    }

    pub fn built_descriptions(&self) -> &[BuildDescription] {
        &self.built
    }

    /// Bottom-level addresses read from instance buffers at build time.
    pub fn referenced_blases(&self) -> Vec<vk::DeviceAddress> {
        self.referenced.clone()
    }

    fn buffer_by_address(&self, address: vk::DeviceAddress) -> Option<(u64, &LiveBuffer)> {
        let id = address.checked_sub(BUFFER_ADDRESS_BASE)? / ALLOCATION_GRANULARITY / 1024;
        self.buffers.get(&id).map(|buffer| (id, buffer))
    }

    fn check_instances(&mut self, data_address: u64, count: u32) -> Result<()> {
        let (_, buffer) = self
            .buffer_by_address(data_address)
            .ok_or_else(|| GpuError::InvalidState("unknown instance buffer".to_string()))?;
        let len = count as usize * InstanceRecord::SIZE as usize;
        let bytes = buffer
            .contents
            .get(..len)
            .ok_or_else(|| GpuError::InvalidState("instance buffer too small".to_string()))?;

        let mut references = Vec::new();
        for chunk in bytes.chunks_exact(InstanceRecord::SIZE as usize) {
            let record: InstanceRecord = bytemuck::pod_read_unaligned(chunk);
            let reference = record.acceleration_structure_reference;
            if !self.completed.contains(&reference) {
                return Err(GpuError::InvalidState(format!(
                    "instance references unbuilt structure {reference:#x}"
                )));
            }
            references.push(reference);
        }
        self.referenced.extend(references);
        Ok(())
    }
}

impl AccelerationDevice for MockAccelerationDevice {
    type Buffer = MockBuffer;

    fn build_sizes(&self, description: &BuildDescription) -> BuildSizes {
        match self.sizes {
            SizePolicy::Fixed(sizes) => sizes,
            SizePolicy::PerPrimitive(bytes) => BuildSizes {
                storage: bytes * u64::from(description.primitive_count()),
                scratch: 128,
            },
        }
    }

    fn allocate(&mut self, role: BufferRole, size: u64, _name: &str) -> Result<MockBuffer> {
        if size == 0 {
            return Err(GpuError::AllocationFailed("zero-sized buffer".to_string()));
        }
        let id = self.next_id;
        self.next_id += 1;

        let allocated = size.div_ceil(ALLOCATION_GRANULARITY) * ALLOCATION_GRANULARITY;
        self.buffers.insert(
            id,
            LiveBuffer {
                role,
                contents: vec![0; allocated as usize],
            },
        );
        self.allocations.push((role, size, allocated));
        self.events.push(Event::Allocate { id, role, size });
        Ok(MockBuffer {
            id,
            size: allocated,
        })
    }

    fn write(&mut self, buffer: &MockBuffer, offset: u64, bytes: &[u8]) -> Result<()> {
        let live = self
            .buffers
            .get_mut(&buffer.id)
            .ok_or_else(|| GpuError::InvalidState("write to freed buffer".to_string()))?;
        if live.role != BufferRole::BuildInput {
            return Err(GpuError::InvalidState("buffer not mapped".to_string()));
        }
        let start = offset as usize;
        let target = live
            .contents
            .get_mut(start..start + bytes.len())
            .ok_or_else(|| GpuError::InvalidState("write out of bounds".to_string()))?;
        target.copy_from_slice(bytes);
        self.events.push(Event::Write {
            id: buffer.id,
            len: bytes.len(),
        });
        Ok(())
    }

    fn buffer_size(&self, buffer: &MockBuffer) -> u64 {
        buffer.size
    }

    fn buffer_address(&self, buffer: &MockBuffer) -> vk::DeviceAddress {
        BUFFER_ADDRESS_BASE + buffer.id * ALLOCATION_GRANULARITY * 1024
    }

    fn create_structure(
        &mut self,
        _kind: StructureKind,
        storage: &MockBuffer,
        size: u64,
    ) -> Result<vk::AccelerationStructureKHR> {
        assert!(size <= storage.size, "structure larger than its storage");
        let raw = self.next_id;
        self.next_id += 1;
        self.structures.insert(
            raw,
            LiveStructure {
                storage: storage.id,
            },
        );
        let handle = vk::AccelerationStructureKHR::from_raw(raw);
        self.events.push(Event::Create(handle));
        Ok(handle)
    }

    fn structure_address(&self, structure: vk::AccelerationStructureKHR) -> vk::DeviceAddress {
        match self.structures.get(&structure.as_raw()) {
            Some(_) => STRUCTURE_ADDRESS_BASE + structure.as_raw() * 0x100,
            None => 0,
        }
    }

    fn build_and_wait(
        &mut self,
        what: &str,
        target: vk::AccelerationStructureKHR,
        description: &BuildDescription,
        scratch_address: vk::DeviceAddress,
    ) -> Result<()> {
        let scratch = match self.buffer_by_address(scratch_address) {
            Some((id, buffer)) if buffer.role == BufferRole::Scratch => id,
            _ => return Err(GpuError::InvalidState("bad scratch address".to_string())),
        };
        if !self.structures.contains_key(&target.as_raw()) {
            return Err(GpuError::InvalidState("build of unknown structure".to_string()));
        }
        self.events.push(Event::Build { target, scratch });

        if self.fail_builds {
            return Err(GpuError::BuildFailed {
                what: what.to_string(),
                source: vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
            });
        }

        if let BuildDescription::Instances {
            data_address,
            instance_count,
        } = *description
        {
            self.check_instances(data_address, instance_count)?;
        }

        let address = self.structure_address(target);
        self.completed.insert(address);
        self.built.push(*description);
        Ok(())
    }

    fn destroy_structure(&mut self, structure: vk::AccelerationStructureKHR) {
        let address = self.structure_address(structure);
        self.completed.remove(&address);
        self.structures.remove(&structure.as_raw());
        self.events.push(Event::DestroyStructure(structure));
    }

    fn free(&mut self, buffer: MockBuffer) -> Result<()> {
        let backs_live_structure = self
            .structures
            .values()
            .any(|structure| structure.storage == buffer.id);
        assert!(
            !backs_live_structure,
            "storage released while its structure is live"
        );
        self.buffers
            .remove(&buffer.id)
            .ok_or_else(|| GpuError::InvalidState("double free".to_string()))?;
        self.events.push(Event::Free(buffer.id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addresses_round_trip() {
        let mut device = MockAccelerationDevice::new();
        let buffer = device.allocate(BufferRole::Scratch, 100, "s").unwrap();
        let address = device.buffer_address(&buffer);
        assert_eq!(device.buffer_by_address(address).map(|(id, _)| id), Some(buffer.id));
        assert_eq!(device.buffer_size(&buffer), 256);
        device.free(buffer).unwrap();
    }
}
