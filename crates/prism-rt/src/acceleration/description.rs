//! Device-agnostic build descriptions.
//!
//! A [`BuildDescription`] carries everything a size query or a build needs,
//! expressed as device addresses and counts. The Vulkan backend translates it
//! into `VkAccelerationStructureGeometryKHR`; test devices inspect it directly.

use ash::vk;
use prism_core::GeometryData;

/// Which level of the two-level hierarchy a structure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StructureKind {
    /// Built from triangle geometry.
    BottomLevel,
    /// Built from instances of bottom-level structures.
    TopLevel,
}

impl StructureKind {
    /// Vulkan structure type.
    pub fn vk_type(self) -> vk::AccelerationStructureTypeKHR {
        match self {
            Self::BottomLevel => vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            Self::TopLevel => vk::AccelerationStructureTypeKHR::TOP_LEVEL,
        }
    }

    /// Short label used in logs and allocation names.
    pub fn label(self) -> &'static str {
        match self {
            Self::BottomLevel => "blas",
            Self::TopLevel => "tlas",
        }
    }
}

/// Sizes reported by a build size query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildSizes {
    /// Backing storage for the structure itself.
    pub storage: u64,
    /// Scratch memory consumed by a full build.
    pub scratch: u64,
}

impl BuildSizes {
    /// Whether either size is zero, which no build can use.
    pub fn is_degenerate(&self) -> bool {
        self.storage == 0 || self.scratch == 0
    }
}

/// Geometry for a single build, referenced by device address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildDescription {
    /// Indexed triangles with a per-geometry transform.
    Triangles {
        vertex_address: vk::DeviceAddress,
        vertex_stride: u64,
        /// Highest vertex index referenced.
        max_vertex: u32,
        index_address: vk::DeviceAddress,
        transform_address: vk::DeviceAddress,
        primitive_count: u32,
    },
    /// A tightly packed array of instance records.
    Instances {
        data_address: vk::DeviceAddress,
        instance_count: u32,
    },
}

impl BuildDescription {
    /// Vertex format of triangle geometry.
    pub const VERTEX_FORMAT: vk::Format = vk::Format::R32G32B32_SFLOAT;
    /// Index type of triangle geometry.
    pub const INDEX_TYPE: vk::IndexType = vk::IndexType::UINT32;
    /// Flags applied to every build.
    pub const BUILD_FLAGS: vk::BuildAccelerationStructureFlagsKHR =
        vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE;

    /// Describe indexed triangles already resident at the given addresses.
    pub fn triangles(
        vertex_address: vk::DeviceAddress,
        vertex_count: u32,
        index_address: vk::DeviceAddress,
        transform_address: vk::DeviceAddress,
        primitive_count: u32,
    ) -> Self {
        Self::Triangles {
            vertex_address,
            vertex_stride: GeometryData::VERTEX_STRIDE,
            max_vertex: vertex_count.saturating_sub(1),
            index_address,
            transform_address,
            primitive_count,
        }
    }

    /// Structure level this description builds.
    pub fn kind(&self) -> StructureKind {
        match self {
            Self::Triangles { .. } => StructureKind::BottomLevel,
            Self::Instances { .. } => StructureKind::TopLevel,
        }
    }

    /// Primitives (triangles or instances) covered by the single geometry.
    pub fn primitive_count(&self) -> u32 {
        match *self {
            Self::Triangles {
                primitive_count, ..
            } => primitive_count,
            Self::Instances { instance_count, .. } => instance_count,
        }
    }

    /// Every description holds exactly one geometry.
    pub fn geometry_count(&self) -> u32 {
        1
    }
}
