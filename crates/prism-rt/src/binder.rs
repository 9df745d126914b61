//! Scene descriptor set.
//!
//! One set with a fixed layout that ray generation shaders read:
//!
//! | Binding | Resource |
//! |---|---|
//! | 0 | output storage image, `GENERAL` layout |
//! | 1 | top-level acceleration structure |
//! | 2 | camera uniform buffer |

use std::sync::Arc;

use ash::vk;
use prism_gpu::{DescriptorPool, DescriptorSetLayoutBuilder, GpuError, Result};

use crate::acceleration::{AccelerationStructure, StructureKind};

/// Binding of the output storage image.
pub const OUTPUT_IMAGE_BINDING: u32 = 0;
/// Binding of the top-level acceleration structure.
pub const ACCELERATION_STRUCTURE_BINDING: u32 = 1;
/// Binding of the camera uniform buffer.
pub const CAMERA_BINDING: u32 = 2;

/// Stages that read the scene set.
pub const SCENE_STAGES: vk::ShaderStageFlags = vk::ShaderStageFlags::RAYGEN_KHR;

/// Layout of the scene set.
pub fn scene_layout() -> DescriptorSetLayoutBuilder<'static> {
    DescriptorSetLayoutBuilder::new()
        .storage_image(OUTPUT_IMAGE_BINDING, SCENE_STAGES)
        .acceleration_structure(ACCELERATION_STRUCTURE_BINDING, SCENE_STAGES)
        .uniform_buffer(CAMERA_BINDING, SCENE_STAGES)
}

/// Resource written to one binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundResource {
    StorageImage {
        view: vk::ImageView,
        layout: vk::ImageLayout,
    },
    AccelerationStructure(vk::AccelerationStructureKHR),
    UniformBuffer {
        buffer: vk::Buffer,
        offset: u64,
        range: u64,
    },
}

impl BoundResource {
    /// Descriptor type the resource is written as.
    pub fn descriptor_type(&self) -> vk::DescriptorType {
        match self {
            Self::StorageImage { .. } => vk::DescriptorType::STORAGE_IMAGE,
            Self::AccelerationStructure(_) => vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
            Self::UniformBuffer { .. } => vk::DescriptorType::UNIFORM_BUFFER,
        }
    }
}

/// A single descriptor write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingWrite {
    pub binding: u32,
    pub resource: BoundResource,
}

/// Resources published to shaders through the scene set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SceneBindings {
    output_view: vk::ImageView,
    structure: vk::AccelerationStructureKHR,
    camera_buffer: vk::Buffer,
    camera_range: u64,
}

impl SceneBindings {
    /// Collect the resources, requiring a built top-level structure.
    pub fn new<B>(
        output_view: vk::ImageView,
        tlas: &AccelerationStructure<B>,
        camera_buffer: vk::Buffer,
        camera_range: u64,
    ) -> Result<Self> {
        tlas.expect_built(StructureKind::TopLevel)?;
        Ok(Self {
            output_view,
            structure: tlas.handle(),
            camera_buffer,
            camera_range,
        })
    }

    /// Write to the output image binding.
    pub fn output_image_write(&self) -> BindingWrite {
        BindingWrite {
            binding: OUTPUT_IMAGE_BINDING,
            resource: BoundResource::StorageImage {
                view: self.output_view,
                layout: vk::ImageLayout::GENERAL,
            },
        }
    }

    /// Write to the acceleration structure binding.
    pub fn structure_write(&self) -> BindingWrite {
        BindingWrite {
            binding: ACCELERATION_STRUCTURE_BINDING,
            resource: BoundResource::AccelerationStructure(self.structure),
        }
    }

    /// Write to the camera binding.
    pub fn camera_write(&self) -> BindingWrite {
        BindingWrite {
            binding: CAMERA_BINDING,
            resource: BoundResource::UniformBuffer {
                buffer: self.camera_buffer,
                offset: 0,
                range: self.camera_range,
            },
        }
    }

    /// Every write needed to populate a fresh set, in binding order.
    pub fn writes(&self) -> [BindingWrite; 3] {
        [
            self.output_image_write(),
            self.structure_write(),
            self.camera_write(),
        ]
    }
}

/// Descriptor infos backing a batch of [`BindingWrite`]s, grouped by type.
#[derive(Debug, Default)]
pub(crate) struct WriteInfos {
    images: Vec<vk::DescriptorImageInfo>,
    buffers: Vec<vk::DescriptorBufferInfo>,
    structures: Vec<vk::AccelerationStructureKHR>,
}

impl WriteInfos {
    pub(crate) fn new(writes: &[BindingWrite]) -> Self {
        let mut infos = Self::default();
        for write in writes {
            match write.resource {
                BoundResource::StorageImage { view, layout } => infos.images.push(
                    vk::DescriptorImageInfo::default()
                        .image_view(view)
                        .image_layout(layout),
                ),
                BoundResource::AccelerationStructure(handle) => infos.structures.push(handle),
                BoundResource::UniformBuffer {
                    buffer,
                    offset,
                    range,
                } => infos.buffers.push(
                    vk::DescriptorBufferInfo::default()
                        .buffer(buffer)
                        .offset(offset)
                        .range(range),
                ),
            }
        }
        infos
    }

    /// One acceleration structure extension struct per structure write.
    pub(crate) fn structure_infos(&self) -> Vec<vk::WriteDescriptorSetAccelerationStructureKHR<'_>> {
        self.structures
            .iter()
            .map(|handle| {
                vk::WriteDescriptorSetAccelerationStructureKHR::default()
                    .acceleration_structures(std::slice::from_ref(handle))
            })
            .collect()
    }
}

/// Translate `writes` into Vulkan writes targeting `set`, one per binding,
/// each with a descriptor count of 1.
pub(crate) fn descriptor_writes<'a>(
    set: vk::DescriptorSet,
    writes: &[BindingWrite],
    infos: &'a WriteInfos,
    structure_infos: &'a mut [vk::WriteDescriptorSetAccelerationStructureKHR<'a>],
) -> Vec<vk::WriteDescriptorSet<'a>> {
    let mut images = infos.images.iter();
    let mut buffers = infos.buffers.iter();
    let mut structure_infos = structure_infos.iter_mut();
    let mut vk_writes = Vec::with_capacity(writes.len());
    for write in writes {
        let base = vk::WriteDescriptorSet::default()
            .dst_set(set)
            .dst_binding(write.binding)
            .descriptor_type(write.resource.descriptor_type());
        let vk_write = match write.resource {
            BoundResource::StorageImage { .. } => images
                .next()
                .map(|info| base.image_info(std::slice::from_ref(info))),
            BoundResource::UniformBuffer { .. } => buffers
                .next()
                .map(|info| base.buffer_info(std::slice::from_ref(info))),
            BoundResource::AccelerationStructure(_) => structure_infos
                .next()
                .map(|info| base.descriptor_count(1).push_next(info)),
        };
        vk_writes.extend(vk_write);
    }
    vk_writes
}

/// Apply `writes` to `set` in a single update.
///
/// # Safety
/// The device, set and every referenced resource must be valid, and the set
/// must not be in use by pending command buffers.
pub unsafe fn apply_writes(device: &ash::Device, set: vk::DescriptorSet, writes: &[BindingWrite]) {
    let infos = WriteInfos::new(writes);
    let mut structure_infos = infos.structure_infos();
    let vk_writes = descriptor_writes(set, writes, &infos, &mut structure_infos);
    device.update_descriptor_sets(&vk_writes, &[]);
}

/// Owns the scene set, its pool and its layout.
pub struct DescriptorBinder {
    device: Arc<ash::Device>,
    layout: vk::DescriptorSetLayout,
    pool: DescriptorPool,
    set: vk::DescriptorSet,
    bindings: SceneBindings,
}

impl DescriptorBinder {
    /// Create the layout, a pool for exactly one set, allocate the set and
    /// write all three bindings.
    pub fn initialize(device: Arc<ash::Device>, bindings: SceneBindings) -> Result<Self> {
        let layout_builder = scene_layout();
        let pool_sizes = layout_builder.pool_sizes();

        // SAFETY: the device is live; each object is destroyed on the error
        // paths below before returning
        unsafe {
            let layout = layout_builder.build(&device)?;
            let pool = match DescriptorPool::new(&device, 1, &pool_sizes) {
                Ok(pool) => pool,
                Err(e) => {
                    device.destroy_descriptor_set_layout(layout, None);
                    return Err(e);
                }
            };
            let set = match pool.allocate(&device, &[layout]) {
                Ok(sets) => sets.first().copied(),
                Err(e) => {
                    pool.destroy(&device);
                    device.destroy_descriptor_set_layout(layout, None);
                    return Err(e);
                }
            };
            let Some(set) = set else {
                pool.destroy(&device);
                device.destroy_descriptor_set_layout(layout, None);
                return Err(GpuError::InvalidState(
                    "descriptor pool returned no set".to_string(),
                ));
            };

            apply_writes(&device, set, &bindings.writes());
            tracing::debug!("Scene descriptor set written");

            Ok(Self {
                device,
                layout,
                pool,
                set,
                bindings,
            })
        }
    }

    /// Layout for pipeline creation.
    pub fn layout(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    /// The populated set.
    pub fn set(&self) -> vk::DescriptorSet {
        self.set
    }

    /// Resources currently published.
    pub fn bindings(&self) -> &SceneBindings {
        &self.bindings
    }

    /// Point binding 1 at a rebuilt or replaced top-level structure.
    ///
    /// Every in-flight frame must have completed first.
    pub fn rebind_structure<B>(&mut self, tlas: &AccelerationStructure<B>) -> Result<()> {
        tlas.expect_built(StructureKind::TopLevel)?;
        self.bindings.structure = tlas.handle();

        // SAFETY: the caller guarantees no pending frame uses the set
        unsafe { apply_writes(&self.device, self.set, &[self.bindings.structure_write()]) };
        Ok(())
    }
}

impl Drop for DescriptorBinder {
    fn drop(&mut self) {
        // SAFETY: the set is freed with its pool; no frame is in flight at teardown
        unsafe {
            self.pool.destroy(&self.device);
            self.device
                .destroy_descriptor_set_layout(self.layout, None);
        }
    }
}
