//! Top-level instances.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use prism_core::AffineTransform;
use prism_gpu::{GpuError, Result};

use super::description::StructureKind;
use super::structure::AccelerationStructure;

/// Largest value that fits a 24-bit packed field.
const MAX_24_BIT: u32 = (1 << 24) - 1;

/// One instance as the device reads it.
///
/// Byte-identical to `VkAccelerationStructureInstanceKHR` (64 bytes).
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct InstanceRecord {
    /// Row-major 3x4 object-to-world transform.
    pub transform: AffineTransform,
    /// Custom index in the low 24 bits, visibility mask in the high 8.
    pub custom_index_and_mask: u32,
    /// Shader binding table record offset in the low 24 bits, flags in the high 8.
    pub sbt_offset_and_flags: u32,
    /// Device address of the referenced bottom-level structure.
    pub acceleration_structure_reference: u64,
}

impl InstanceRecord {
    /// Size of one record in bytes.
    pub const SIZE: u64 = std::mem::size_of::<Self>() as u64;

    /// Custom index field.
    pub fn custom_index(&self) -> u32 {
        self.custom_index_and_mask & MAX_24_BIT
    }

    /// Visibility mask field.
    pub fn mask(&self) -> u8 {
        (self.custom_index_and_mask >> 24) as u8
    }

    /// Shader binding table record offset field.
    pub fn sbt_offset(&self) -> u32 {
        self.sbt_offset_and_flags & MAX_24_BIT
    }

    /// Instance flags field.
    pub fn flags(&self) -> vk::GeometryInstanceFlagsKHR {
        vk::GeometryInstanceFlagsKHR::from_raw(self.sbt_offset_and_flags >> 24)
    }
}

fn pack_24_8(low: u32, high: u8) -> u32 {
    (low & MAX_24_BIT) | (u32::from(high) << 24)
}

/// A placement of a built bottom-level structure in a top-level build.
///
/// Only constructible from a built bottom-level structure, so a top-level
/// build can never reference a structure whose build has not completed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Instance {
    blas_address: vk::DeviceAddress,
    transform: AffineTransform,
    mask: u8,
    custom_index: u32,
    sbt_offset: u32,
    flags: vk::GeometryInstanceFlagsKHR,
}

impl Instance {
    /// Reference `blas` with an identity transform, full mask and culling disabled.
    pub fn new<B>(blas: &AccelerationStructure<B>) -> Result<Self> {
        blas.expect_built(StructureKind::BottomLevel)?;
        let blas_address = blas
            .device_address()
            .filter(|&address| address != 0)
            .ok_or_else(|| GpuError::InvalidState("blas has no device address".to_string()))?;

        Ok(Self {
            blas_address,
            transform: AffineTransform::IDENTITY,
            mask: 0xFF,
            custom_index: 0,
            sbt_offset: 0,
            flags: vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE,
        })
    }

    /// Set the placement transform.
    pub fn with_transform(mut self, transform: AffineTransform) -> Self {
        self.transform = transform;
        self
    }

    /// Set the visibility mask.
    pub fn with_mask(mut self, mask: u8) -> Self {
        self.mask = mask;
        self
    }

    /// Set the custom index reported to shaders. Must fit in 24 bits.
    pub fn with_custom_index(mut self, index: u32) -> Result<Self> {
        if index > MAX_24_BIT {
            return Err(GpuError::InvalidState(format!(
                "custom index {index} does not fit in 24 bits"
            )));
        }
        self.custom_index = index;
        Ok(self)
    }

    /// Set the shader binding table record offset. Must fit in 24 bits.
    pub fn with_sbt_offset(mut self, offset: u32) -> Result<Self> {
        if offset > MAX_24_BIT {
            return Err(GpuError::InvalidState(format!(
                "binding table offset {offset} does not fit in 24 bits"
            )));
        }
        self.sbt_offset = offset;
        Ok(self)
    }

    /// Replace the instance flags.
    pub fn with_flags(mut self, flags: vk::GeometryInstanceFlagsKHR) -> Self {
        self.flags = flags;
        self
    }

    /// Device address of the referenced bottom-level structure.
    pub fn blas_address(&self) -> vk::DeviceAddress {
        self.blas_address
    }

    /// Placement transform.
    pub fn transform(&self) -> &AffineTransform {
        &self.transform
    }

    /// Encode for the instance buffer.
    pub fn record(&self) -> InstanceRecord {
        InstanceRecord {
            transform: self.transform,
            custom_index_and_mask: pack_24_8(self.custom_index, self.mask),
            // Instance flags occupy the low 8 bits of the Vulkan enum
            sbt_offset_and_flags: pack_24_8(self.sbt_offset, self.flags.as_raw() as u8),
            acceleration_structure_reference: self.blas_address,
        }
    }
}

/// Flatten instances into the contiguous byte layout of an instance buffer.
pub fn pack_instances(instances: &[Instance]) -> Vec<u8> {
    let records: Vec<InstanceRecord> = instances.iter().map(Instance::record).collect();
    bytemuck::cast_slice(&records).to_vec()
}
