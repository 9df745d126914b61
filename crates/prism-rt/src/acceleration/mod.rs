//! Two-level acceleration structures.
//!
//! Bottom-level structures are built from triangle geometry, top-level
//! structures from [`Instance`]s that reference built bottom-level structures
//! by device address. All device work goes through [`AccelerationDevice`];
//! [`VulkanAccelerationDevice`] is the production implementation.

mod builder;
mod description;
mod device;
mod instance;
mod structure;
mod vulkan;

#[cfg(test)]
pub(crate) mod mock;

pub use builder::AccelerationStructureBuilder;
pub use description::{BuildDescription, BuildSizes, StructureKind};
pub use device::{AccelerationDevice, BufferRole};
pub use instance::{pack_instances, Instance, InstanceRecord};
pub use structure::{AccelerationStructure, StructureState};
pub use vulkan::VulkanAccelerationDevice;
