//! Acceleration structure ownership and lifecycle.

use ash::vk;
use ash::vk::Handle;
use prism_gpu::{GpuError, GpuBuffer, Result};

use super::description::{BuildSizes, StructureKind};

/// Lifecycle of an acceleration structure.
///
/// `Unbuilt -> Building -> Built -> Destroyed`, with `Built -> Building` only
/// for an explicit rebuild. Any live state may move to `Destroyed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructureState {
    /// Created and bound to storage, never built.
    Unbuilt,
    /// A build has been issued and not yet confirmed.
    Building,
    /// The device confirmed the build; the device address is valid.
    Built,
    /// Handle and allocations released.
    Destroyed,
}

impl StructureState {
    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition(self, next: Self) -> bool {
        use StructureState::*;
        matches!(
            (self, next),
            (Unbuilt, Building)
                | (Building, Built)
                | (Built, Building)
                | (Unbuilt | Building | Built, Destroyed)
        )
    }
}

/// A device acceleration structure with its exclusively owned allocations.
///
/// `B` is the device's buffer type. The backing storage is released only
/// after the handle, and only through the builder that created it.
pub struct AccelerationStructure<B = GpuBuffer> {
    pub(crate) handle: vk::AccelerationStructureKHR,
    pub(crate) kind: StructureKind,
    pub(crate) state: StructureState,
    pub(crate) storage: Option<B>,
    pub(crate) storage_capacity: u64,
    pub(crate) scratch: Option<B>,
    pub(crate) instance_buffer: Option<B>,
    pub(crate) instance_capacity: u64,
    pub(crate) sizes: BuildSizes,
    pub(crate) geometry_count: u32,
    pub(crate) primitive_count: u32,
    pub(crate) device_address: vk::DeviceAddress,
}

impl<B> AccelerationStructure<B> {
    /// Wrap a freshly created, unbuilt structure.
    pub(crate) fn new(
        kind: StructureKind,
        handle: vk::AccelerationStructureKHR,
        storage: B,
        sizes: BuildSizes,
        primitive_count: u32,
    ) -> Self {
        Self {
            handle,
            kind,
            state: StructureState::Unbuilt,
            storage: Some(storage),
            storage_capacity: sizes.storage,
            scratch: None,
            instance_buffer: None,
            instance_capacity: 0,
            sizes,
            geometry_count: 1,
            primitive_count,
            device_address: 0,
        }
    }

    /// Raw handle.
    pub fn handle(&self) -> vk::AccelerationStructureKHR {
        self.handle
    }

    /// Bottom or top level.
    pub fn kind(&self) -> StructureKind {
        self.kind
    }

    /// Current lifecycle state.
    pub fn state(&self) -> StructureState {
        self.state
    }

    /// Whether the device has confirmed the latest build.
    pub fn is_built(&self) -> bool {
        self.state == StructureState::Built
    }

    /// Sizes from the most recent size query.
    pub fn sizes(&self) -> BuildSizes {
        self.sizes
    }

    /// Size of the backing storage allocation.
    pub fn storage_capacity(&self) -> u64 {
        self.storage_capacity
    }

    /// Geometries in the structure.
    pub fn geometry_count(&self) -> u32 {
        self.geometry_count
    }

    /// Triangles (bottom level) or instances (top level).
    pub fn primitive_count(&self) -> u32 {
        self.primitive_count
    }

    /// Device address, available only once built.
    pub fn device_address(&self) -> Option<vk::DeviceAddress> {
        self.is_built().then_some(self.device_address)
    }

    /// Whether a scratch allocation is currently held.
    pub fn holds_scratch(&self) -> bool {
        self.scratch.is_some()
    }

    /// Move to `next`, rejecting illegal transitions.
    pub(crate) fn transition(&mut self, next: StructureState) -> Result<()> {
        if !self.state.can_transition(next) {
            return Err(GpuError::InvalidState(format!(
                "{} cannot move from {:?} to {:?}",
                self.kind.label(),
                self.state,
                next
            )));
        }
        tracing::trace!(
            "{} {:#x}: {:?} -> {:?}",
            self.kind.label(),
            self.handle.as_raw(),
            self.state,
            next
        );
        self.state = next;
        Ok(())
    }

    /// Require a built structure of the given kind.
    pub(crate) fn expect_built(&self, kind: StructureKind) -> Result<()> {
        if self.kind != kind {
            return Err(GpuError::InvalidState(format!(
                "expected a {}, found a {}",
                kind.label(),
                self.kind.label()
            )));
        }
        if !self.is_built() {
            return Err(GpuError::InvalidState(format!(
                "{} is {:?}, not built",
                self.kind.label(),
                self.state
            )));
        }
        Ok(())
    }
}

impl<B> Drop for AccelerationStructure<B> {
    fn drop(&mut self) {
        if self.state != StructureState::Destroyed && self.storage.is_some() {
            tracing::error!(
                "{} {:#x} dropped without being destroyed; its device memory leaks",
                self.kind.label(),
                self.handle.as_raw()
            );
        }
    }
}

impl<B> std::fmt::Debug for AccelerationStructure<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccelerationStructure")
            .field("handle", &self.handle)
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("sizes", &self.sizes)
            .field("geometry_count", &self.geometry_count)
            .field("primitive_count", &self.primitive_count)
            .field("device_address", &self.device_address)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn structure() -> AccelerationStructure<()> {
        AccelerationStructure::new(
            StructureKind::BottomLevel,
            vk::AccelerationStructureKHR::from_raw(7),
            (),
            BuildSizes {
                storage: 1024,
                scratch: 512,
            },
            1,
        )
    }

    #[test]
    fn legal_transitions() {
        use StructureState::*;
        assert!(Unbuilt.can_transition(Building));
        assert!(Building.can_transition(Built));
        assert!(Built.can_transition(Building));
        assert!(Built.can_transition(Destroyed));
        assert!(Unbuilt.can_transition(Destroyed));
    }

    #[test]
    fn illegal_transitions() {
        use StructureState::*;
        assert!(!Unbuilt.can_transition(Built));
        assert!(!Built.can_transition(Unbuilt));
        assert!(!Destroyed.can_transition(Building));
        assert!(!Destroyed.can_transition(Destroyed));
    }

    #[test]
    fn address_hidden_until_built() {
        let mut blas = structure();
        blas.device_address = 0xABC0;
        assert_eq!(blas.device_address(), None);

        blas.transition(StructureState::Building).unwrap();
        assert_eq!(blas.device_address(), None);

        blas.transition(StructureState::Built).unwrap();
        assert_eq!(blas.device_address(), Some(0xABC0));

        blas.transition(StructureState::Destroyed).unwrap();
    }

    #[test]
    fn transition_rejects_skipping_build() {
        let mut blas = structure();
        let err = blas.transition(StructureState::Built).unwrap_err();
        assert!(matches!(err, GpuError::InvalidState(_)));
        assert_eq!(blas.state(), StructureState::Unbuilt);
        blas.transition(StructureState::Destroyed).unwrap();
    }

    #[test]
    fn expect_built_checks_kind_and_state() {
        let mut blas = structure();
        assert!(blas.expect_built(StructureKind::BottomLevel).is_err());

        blas.transition(StructureState::Building).unwrap();
        blas.transition(StructureState::Built).unwrap();
        assert!(blas.expect_built(StructureKind::BottomLevel).is_ok());
        assert!(blas.expect_built(StructureKind::TopLevel).is_err());

        blas.transition(StructureState::Destroyed).unwrap();
    }
}
