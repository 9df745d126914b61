//! Hardware ray tracing core for the Prism renderer.
//!
//! This crate provides:
//! - Two-level acceleration structure builds (triangle BLAS, instance TLAS)
//! - Device-resident geometry upload
//! - The scene descriptor set (output image, TLAS, camera)
//! - Frame pipelining over N frames in flight
//! - Scene setup and teardown tying the above together
//!
//! Device work goes through the [`AccelerationDevice`] and [`FrameDevice`]
//! traits, so the build and scheduling protocols run against in-memory
//! devices in tests.

pub mod acceleration;
pub mod binder;
pub mod geometry;
pub mod scene;
pub mod scheduler;

pub use acceleration::{
    pack_instances, AccelerationDevice, AccelerationStructure, AccelerationStructureBuilder,
    BufferRole, BuildDescription, BuildSizes, Instance, InstanceRecord, StructureKind,
    StructureState, VulkanAccelerationDevice,
};
pub use binder::{BindingWrite, BoundResource, DescriptorBinder, SceneBindings};
pub use geometry::GeometryBuffer;
pub use scene::{Scene, SceneStructures};
pub use scheduler::{
    record_present_transition, AcquiredImage, FrameContext, FrameDevice, FrameScheduler,
    FrameStatus, SchedulerConfig, SlotState, VulkanFrameDevice, VulkanFrameSlot,
};
