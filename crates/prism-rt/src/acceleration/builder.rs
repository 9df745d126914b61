//! Two-level acceleration structure builds.

use ash::vk::Handle;
use prism_core::GeometryData;
use prism_gpu::{GpuError, Result};

use super::description::{BuildDescription, BuildSizes, StructureKind};
use super::device::{AccelerationDevice, BufferRole};
use super::instance::{pack_instances, Instance, InstanceRecord};
use super::structure::{AccelerationStructure, StructureState};
use crate::geometry::GeometryBuffer;

/// Builds bottom-level structures from geometry and top-level structures from
/// instances.
///
/// Each build queries sizes, allocates exactly those sizes, creates the
/// structure on its storage, and submits the build as a one-shot command that
/// is waited on before the call returns. Scratch memory is private to a single
/// build and released as soon as the device confirms it.
pub struct AccelerationStructureBuilder<D: AccelerationDevice> {
    device: D,
    completed_builds: u64,
}

impl<D: AccelerationDevice> AccelerationStructureBuilder<D> {
    /// Create a builder over `device`.
    pub fn new(device: D) -> Self {
        Self {
            device,
            completed_builds: 0,
        }
    }

    /// The underlying device.
    pub fn device(&self) -> &D {
        &self.device
    }

    /// Builds confirmed by the device so far.
    pub fn completed_builds(&self) -> u64 {
        self.completed_builds
    }

    /// Upload geometry for a later bottom-level build.
    pub fn upload(&mut self, data: &GeometryData) -> Result<GeometryBuffer<D::Buffer>> {
        GeometryBuffer::upload(&mut self.device, data)
    }

    /// Release uploaded geometry. Structures built from it must be destroyed first.
    pub fn release_geometry(&mut self, geometry: GeometryBuffer<D::Buffer>) -> Result<()> {
        geometry.release(&mut self.device)
    }

    /// Build a bottom-level structure holding one triangle geometry.
    pub fn build_bottom_level(
        &mut self,
        geometry: &GeometryBuffer<D::Buffer>,
    ) -> Result<AccelerationStructure<D::Buffer>> {
        if geometry.primitive_count() == 0 {
            return Err(GpuError::InvalidGeometry(
                prism_core::GeometryError::NoPrimitives,
            ));
        }

        let description = geometry.description();
        let sizes = self.query_sizes(&description)?;
        let mut blas = self.create(&description, sizes)?;

        match self.execute(&mut blas, &description) {
            Ok(()) => Ok(blas),
            Err(e) => {
                self.discard(blas);
                Err(e)
            }
        }
    }

    /// Build a top-level structure over `instances`.
    ///
    /// Instances can only be made from built bottom-level structures, so every
    /// reference written here points at a completed build.
    pub fn build_top_level(
        &mut self,
        instances: &[Instance],
    ) -> Result<AccelerationStructure<D::Buffer>> {
        let bytes = pack_top_level(instances)?;

        let instance_buffer =
            self.device
                .allocate(BufferRole::BuildInput, bytes.len() as u64, "tlas_instances")?;
        if let Err(e) = self.device.write(&instance_buffer, 0, &bytes) {
            self.release(instance_buffer);
            return Err(e);
        }

        let description = BuildDescription::Instances {
            data_address: self.device.buffer_address(&instance_buffer),
            instance_count: instances.len() as u32,
        };

        let sizes = match self.query_sizes(&description) {
            Ok(sizes) => sizes,
            Err(e) => {
                self.release(instance_buffer);
                return Err(e);
            }
        };
        let mut tlas = match self.create(&description, sizes) {
            Ok(tlas) => tlas,
            Err(e) => {
                self.release(instance_buffer);
                return Err(e);
            }
        };
        tlas.instance_capacity = self.device.buffer_size(&instance_buffer);
        tlas.instance_buffer = Some(instance_buffer);

        match self.execute(&mut tlas, &description) {
            Ok(()) => Ok(tlas),
            Err(e) => {
                self.discard(tlas);
                Err(e)
            }
        }
    }

    /// Rebuild a built top-level structure in place over a new instance set.
    ///
    /// The new build must fit the existing storage. Callers must ensure no
    /// in-flight frame references the structure.
    pub fn rebuild_top_level(
        &mut self,
        tlas: &mut AccelerationStructure<D::Buffer>,
        instances: &[Instance],
    ) -> Result<()> {
        tlas.expect_built(StructureKind::TopLevel)?;
        let bytes = pack_top_level(instances)?;

        if let Some(scratch) = tlas.scratch.take() {
            self.device.free(scratch)?;
        }

        let current_address = tlas
            .instance_buffer
            .as_ref()
            .map_or(0, |buffer| self.device.buffer_address(buffer));
        let sizes = self.query_sizes(&BuildDescription::Instances {
            data_address: current_address,
            instance_count: instances.len() as u32,
        })?;
        if sizes.storage > tlas.storage_capacity {
            return Err(GpuError::InvalidState(format!(
                "rebuild needs {} bytes of storage, tlas has {}",
                sizes.storage, tlas.storage_capacity
            )));
        }

        if tlas.instance_capacity < bytes.len() as u64 {
            if let Some(old) = tlas.instance_buffer.take() {
                self.device.free(old)?;
            }
            tlas.instance_capacity = 0;
            let buffer =
                self.device
                    .allocate(BufferRole::BuildInput, bytes.len() as u64, "tlas_instances")?;
            tlas.instance_capacity = self.device.buffer_size(&buffer);
            tlas.instance_buffer = Some(buffer);
        }
        let instance_buffer = tlas
            .instance_buffer
            .as_ref()
            .ok_or_else(|| GpuError::InvalidState("tlas has no instance buffer".to_string()))?;
        self.device.write(instance_buffer, 0, &bytes)?;

        let description = BuildDescription::Instances {
            data_address: self.device.buffer_address(instance_buffer),
            instance_count: instances.len() as u32,
        };
        tlas.sizes = sizes;
        tlas.primitive_count = description.primitive_count();

        self.execute(tlas, &description)
    }

    /// Destroy a structure: handle first, then storage, then instance data.
    ///
    /// Release continues past failures; the first error is returned.
    pub fn destroy(&mut self, mut structure: AccelerationStructure<D::Buffer>) -> Result<()> {
        let label = structure.kind.label();
        let handle = structure.handle;
        let mut result = structure.transition(StructureState::Destroyed);

        if !handle.is_null() {
            self.device.destroy_structure(handle);
        }
        for buffer in [
            structure.storage.take(),
            structure.instance_buffer.take(),
            structure.scratch.take(),
        ]
        .into_iter()
        .flatten()
        {
            let freed = self.device.free(buffer);
            result = result.and(freed);
        }
        structure.state = StructureState::Destroyed;

        tracing::debug!("Destroyed {label} {:#x}", handle.as_raw());
        result
    }

    /// Query and validate the sizes for a build.
    fn query_sizes(&self, description: &BuildDescription) -> Result<BuildSizes> {
        let kind = description.kind();
        let sizes = self.device.build_sizes(description);
        tracing::debug!(
            "{} size query: storage {} bytes, scratch {} bytes, {} primitives",
            kind.label(),
            sizes.storage,
            sizes.scratch,
            description.primitive_count()
        );

        if sizes.is_degenerate() {
            return Err(GpuError::InvalidBuildSize {
                what: kind.label().to_string(),
                storage: sizes.storage,
                scratch: sizes.scratch,
            });
        }
        Ok(sizes)
    }

    /// Allocate storage and create an unbuilt structure on it.
    fn create(
        &mut self,
        description: &BuildDescription,
        sizes: BuildSizes,
    ) -> Result<AccelerationStructure<D::Buffer>> {
        let kind = description.kind();
        let storage = self.device.allocate(
            BufferRole::Storage,
            sizes.storage,
            &format!("{}_storage", kind.label()),
        )?;

        let allocated = self.device.buffer_size(&storage);
        if allocated < sizes.storage {
            self.release(storage);
            return Err(GpuError::AllocationFailed(format!(
                "{} storage: got {allocated} bytes, need {}",
                kind.label(),
                sizes.storage
            )));
        }

        let handle = match self.device.create_structure(kind, &storage, sizes.storage) {
            Ok(handle) => handle,
            Err(e) => {
                self.release(storage);
                return Err(e);
            }
        };

        Ok(AccelerationStructure::new(
            kind,
            handle,
            storage,
            sizes,
            description.primitive_count(),
        ))
    }

    /// Build `structure` from `description` and wait for the device.
    fn execute(
        &mut self,
        structure: &mut AccelerationStructure<D::Buffer>,
        description: &BuildDescription,
    ) -> Result<()> {
        let label = structure.kind.label();
        structure.transition(StructureState::Building)?;

        let scratch = self.device.allocate(
            BufferRole::Scratch,
            structure.sizes.scratch,
            &format!("{label}_scratch"),
        )?;
        let scratch_address = self.device.buffer_address(&scratch);
        structure.scratch = Some(scratch);

        self.device
            .build_and_wait(label, structure.handle, description, scratch_address)?;

        if let Some(scratch) = structure.scratch.take() {
            self.device.free(scratch)?;
        }

        let address = self.device.structure_address(structure.handle);
        if address == 0 {
            return Err(GpuError::InvalidState(format!(
                "{label} has a null device address after its build"
            )));
        }
        structure.device_address = address;
        structure.geometry_count = description.geometry_count();
        structure.transition(StructureState::Built)?;
        self.completed_builds += 1;

        tracing::info!(
            "Built {label}: {} primitives, storage {} bytes, scratch {} bytes, address {:#x}",
            structure.primitive_count,
            structure.sizes.storage,
            structure.sizes.scratch,
            address
        );
        Ok(())
    }

    /// Destroy a structure on an error path, logging secondary failures.
    fn discard(&mut self, structure: AccelerationStructure<D::Buffer>) {
        if let Err(e) = self.destroy(structure) {
            tracing::error!("Failed to release structure after a failed build: {e}");
        }
    }

    /// Free a buffer on an error path, logging secondary failures.
    fn release(&mut self, buffer: D::Buffer) {
        if let Err(e) = self.device.free(buffer) {
            tracing::error!("Failed to release buffer after a failed build: {e}");
        }
    }
}

/// Validate and pack instances for a top-level build.
fn pack_top_level(instances: &[Instance]) -> Result<Vec<u8>> {
    if instances.is_empty() {
        return Err(GpuError::InvalidState(
            "a top-level build needs at least one instance".to_string(),
        ));
    }
    let bytes = pack_instances(instances);
    debug_assert_eq!(bytes.len() as u64, instances.len() as u64 * InstanceRecord::SIZE);
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acceleration::mock::{Event, MockAccelerationDevice};
    use glam::Vec3;
    use prism_core::AffineTransform;

    fn builder() -> AccelerationStructureBuilder<MockAccelerationDevice> {
        AccelerationStructureBuilder::new(MockAccelerationDevice::new())
    }

    #[test]
    fn single_triangle_blas() {
        let mut builder = builder();
        let geometry = builder.upload(&GeometryData::triangle()).unwrap();
        let blas = builder.build_bottom_level(&geometry).unwrap();

        assert_eq!(blas.kind(), StructureKind::BottomLevel);
        assert_eq!(blas.state(), StructureState::Built);
        assert_eq!(blas.geometry_count(), 1);
        assert_eq!(blas.primitive_count(), 1);
        assert!(matches!(blas.device_address(), Some(address) if address != 0));
        assert!(!blas.holds_scratch());

        builder.destroy(blas).unwrap();
        builder.release_geometry(geometry).unwrap();
        assert_eq!(builder.device().live_buffers(), 0);
        assert_eq!(builder.device().live_structures(), 0);
    }

    #[test]
    fn triangle_description_reaches_device() {
        let mut builder = builder();
        let geometry = builder.upload(&GeometryData::triangle()).unwrap();
        let blas = builder.build_bottom_level(&geometry).unwrap();

        let built = builder.device().built_descriptions();
        assert_eq!(built.len(), 1);
        match built[0] {
            BuildDescription::Triangles {
                vertex_stride,
                max_vertex,
                primitive_count,
                vertex_address,
                index_address,
                transform_address,
            } => {
                assert_eq!(vertex_stride, 12);
                assert_eq!(max_vertex, 2);
                assert_eq!(primitive_count, 1);
                assert_eq!(vertex_address, geometry.vertex_address());
                assert_eq!(index_address, geometry.index_address());
                assert_eq!(transform_address, geometry.transform_address());
            }
            BuildDescription::Instances { .. } => panic!("expected a triangle build"),
        }

        builder.destroy(blas).unwrap();
        builder.release_geometry(geometry).unwrap();
    }

    #[test]
    fn allocations_cover_queried_sizes() {
        let mut builder = AccelerationStructureBuilder::new(
            MockAccelerationDevice::new().with_sizes(BuildSizes {
                storage: 1000,
                scratch: 300,
            }),
        );
        let geometry = builder.upload(&GeometryData::triangle()).unwrap();
        let blas = builder.build_bottom_level(&geometry).unwrap();
        let tlas = builder
            .build_top_level(&[Instance::new(&blas).unwrap()])
            .unwrap();

        let device = builder.device();
        let storage = device.allocations(BufferRole::Storage);
        let scratch = device.allocations(BufferRole::Scratch);
        assert_eq!(storage.len(), 2);
        assert_eq!(scratch.len(), 2);
        assert!(storage.iter().all(|&(requested, allocated)| requested == 1000
            && allocated >= requested));
        assert!(scratch.iter().all(|&(requested, allocated)| requested == 300
            && allocated >= requested));
        assert_eq!(tlas.storage_capacity(), 1000);

        builder.destroy(tlas).unwrap();
        builder.destroy(blas).unwrap();
        builder.release_geometry(geometry).unwrap();
    }

    #[test]
    fn scratch_is_never_shared() {
        let mut builder = builder();
        let geometry = builder.upload(&GeometryData::triangle()).unwrap();
        let blas = builder.build_bottom_level(&geometry).unwrap();
        let tlas = builder
            .build_top_level(&[Instance::new(&blas).unwrap()])
            .unwrap();

        let scratch_ids: Vec<u64> = builder
            .device()
            .events()
            .iter()
            .filter_map(|event| match event {
                Event::Build { scratch, .. } => Some(*scratch),
                _ => None,
            })
            .collect();
        assert_eq!(scratch_ids.len(), 2);
        assert_ne!(scratch_ids[0], scratch_ids[1]);

        builder.destroy(tlas).unwrap();
        builder.destroy(blas).unwrap();
        builder.release_geometry(geometry).unwrap();
    }

    #[test]
    fn scratch_released_after_build() {
        let mut builder = builder();
        let geometry = builder.upload(&GeometryData::triangle()).unwrap();
        let blas = builder.build_bottom_level(&geometry).unwrap();

        let events = builder.device().events();
        let build = events
            .iter()
            .position(|e| matches!(e, Event::Build { .. }))
            .unwrap();
        let scratch = match events[build] {
            Event::Build { scratch, .. } => scratch,
            _ => unreachable!(),
        };
        let freed = events
            .iter()
            .position(|e| *e == Event::Free(scratch))
            .unwrap();
        assert!(freed > build);

        builder.destroy(blas).unwrap();
        builder.release_geometry(geometry).unwrap();
    }

    #[test]
    fn tlas_references_only_completed_builds() {
        let mut builder = builder();
        let geometry = builder.upload(&GeometryData::triangle()).unwrap();
        let blas = builder.build_bottom_level(&geometry).unwrap();
        let instance = Instance::new(&blas)
            .unwrap()
            .with_transform(AffineTransform::from_translation(Vec3::X));
        let tlas = builder.build_top_level(&[instance, instance]).unwrap();

        assert_eq!(tlas.kind(), StructureKind::TopLevel);
        assert_eq!(tlas.primitive_count(), 2);
        // The mock rejects any instance build whose references were not built
        // and waited on first
        assert_eq!(builder.device().referenced_blases(), vec![
            blas.device_address().unwrap();
            2
        ]);

        builder.destroy(tlas).unwrap();
        builder.destroy(blas).unwrap();
        builder.release_geometry(geometry).unwrap();
    }

    #[test]
    fn empty_instance_list_rejected() {
        let mut builder = builder();
        let err = builder.build_top_level(&[]).unwrap_err();
        assert!(matches!(err, GpuError::InvalidState(_)));
        assert!(builder.device().events().is_empty());
    }

    #[test]
    fn zero_size_query_rejected() {
        let mut builder = AccelerationStructureBuilder::new(
            MockAccelerationDevice::new().with_sizes(BuildSizes {
                storage: 0,
                scratch: 64,
            }),
        );
        let geometry = builder.upload(&GeometryData::triangle()).unwrap();
        let err = builder.build_bottom_level(&geometry).unwrap_err();
        assert!(matches!(
            err,
            GpuError::InvalidBuildSize {
                storage: 0,
                scratch: 64,
                ..
            }
        ));
        assert_eq!(builder.device().allocations(BufferRole::Storage).len(), 0);
        builder.release_geometry(geometry).unwrap();
    }

    #[test]
    fn failed_build_releases_everything() {
        let mut builder =
            AccelerationStructureBuilder::new(MockAccelerationDevice::new().failing_builds());
        let geometry = builder.upload(&GeometryData::triangle()).unwrap();
        let err = builder.build_bottom_level(&geometry).unwrap_err();
        assert!(matches!(err, GpuError::BuildFailed { .. }));

        builder.release_geometry(geometry).unwrap();
        assert_eq!(builder.device().live_buffers(), 0);
        assert_eq!(builder.device().live_structures(), 0);
        assert_eq!(builder.completed_builds(), 0);
    }

    #[test]
    fn destroy_releases_handle_before_storage() {
        let mut builder = builder();
        let geometry = builder.upload(&GeometryData::triangle()).unwrap();
        let blas = builder.build_bottom_level(&geometry).unwrap();
        let tlas = builder
            .build_top_level(&[Instance::new(&blas).unwrap()])
            .unwrap();
        let handle = tlas.handle();
        let start = builder.device().events().len();

        builder.destroy(tlas).unwrap();

        let events = &builder.device().events()[start..];
        assert!(matches!(events[0], Event::DestroyStructure(h) if h == handle));
        assert!(matches!(events[1], Event::Free(_)));
        assert!(matches!(events[2], Event::Free(_)));
        assert_eq!(events.len(), 3);

        builder.destroy(blas).unwrap();
        builder.release_geometry(geometry).unwrap();
    }

    #[test]
    fn rebuild_in_place() {
        let mut builder = builder();
        let geometry = builder.upload(&GeometryData::triangle()).unwrap();
        let blas = builder.build_bottom_level(&geometry).unwrap();
        let instance = Instance::new(&blas).unwrap();
        let mut tlas = builder.build_top_level(&[instance]).unwrap();
        let handle = tlas.handle();

        let moved = instance.with_transform(AffineTransform::from_translation(Vec3::Y));
        builder.rebuild_top_level(&mut tlas, &[moved]).unwrap();

        assert_eq!(tlas.handle(), handle);
        assert!(tlas.is_built());
        assert!(!tlas.holds_scratch());
        assert_eq!(builder.completed_builds(), 3);

        builder.destroy(tlas).unwrap();
        builder.destroy(blas).unwrap();
        builder.release_geometry(geometry).unwrap();
        assert_eq!(builder.device().live_buffers(), 0);
    }

    #[test]
    fn rebuild_grows_instance_buffer() {
        let mut builder = builder();
        let geometry = builder.upload(&GeometryData::triangle()).unwrap();
        let blas = builder.build_bottom_level(&geometry).unwrap();
        let instance = Instance::new(&blas).unwrap();
        let mut tlas = builder.build_top_level(&[instance]).unwrap();

        builder
            .rebuild_top_level(&mut tlas, &[instance, instance, instance])
            .unwrap();
        assert_eq!(tlas.primitive_count(), 3);

        builder.destroy(tlas).unwrap();
        builder.destroy(blas).unwrap();
        builder.release_geometry(geometry).unwrap();
        assert_eq!(builder.device().live_buffers(), 0);
    }

    #[test]
    fn rebuild_rejects_storage_growth() {
        let mut builder = AccelerationStructureBuilder::new(
            MockAccelerationDevice::new().with_storage_per_primitive(256),
        );
        let geometry = builder.upload(&GeometryData::triangle()).unwrap();
        let blas = builder.build_bottom_level(&geometry).unwrap();
        let instance = Instance::new(&blas).unwrap();
        let mut tlas = builder.build_top_level(&[instance]).unwrap();

        let err = builder
            .rebuild_top_level(&mut tlas, &[instance, instance])
            .unwrap_err();
        assert!(matches!(err, GpuError::InvalidState(_)));
        assert!(tlas.is_built());

        builder.destroy(tlas).unwrap();
        builder.destroy(blas).unwrap();
        builder.release_geometry(geometry).unwrap();
    }

    #[test]
    fn rebuild_requires_built_tlas() {
        let mut builder = builder();
        let geometry = builder.upload(&GeometryData::triangle()).unwrap();
        let mut blas = builder.build_bottom_level(&geometry).unwrap();
        let instance = Instance::new(&blas).unwrap();

        let err = builder
            .rebuild_top_level(&mut blas, &[instance])
            .unwrap_err();
        assert!(matches!(err, GpuError::InvalidState(_)));

        builder.destroy(blas).unwrap();
        builder.release_geometry(geometry).unwrap();
    }
}
