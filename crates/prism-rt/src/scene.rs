//! Scene setup and teardown.
//!
//! [`SceneStructures`] is the geometry → BLAS → TLAS chain for one mesh.
//! [`Scene`] adds the camera buffer, the output storage image and the scene
//! descriptor set on top of it, and records the per-frame copy of the output
//! image to the swapchain.

use std::sync::Arc;

use ash::vk;
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use prism_core::{Camera, CameraUniform, GeometryData};
use prism_gpu::{
    GpuAllocator, GpuBuffer, GpuContext, GpuError, GpuImage, OneShotCommandExecutor, Result,
    DEFAULT_FENCE_TIMEOUT_NS,
};

use crate::acceleration::{
    AccelerationDevice, AccelerationStructure, AccelerationStructureBuilder, Instance,
    VulkanAccelerationDevice,
};
use crate::binder::{DescriptorBinder, SceneBindings};
use crate::geometry::GeometryBuffer;
use crate::scheduler::{color_range, FrameContext};

/// Format of the output storage image.
pub const OUTPUT_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;

/// Color the output image holds before anything is traced into it.
const CLEAR_COLOR: [f32; 4] = [0.05, 0.05, 0.1, 1.0];

/// Uploaded geometry with one BLAS over it and a TLAS holding one instance of
/// that BLAS.
pub struct SceneStructures<B> {
    geometry: GeometryBuffer<B>,
    blas: AccelerationStructure<B>,
    tlas: AccelerationStructure<B>,
}

impl<B> SceneStructures<B> {
    /// Upload `data` and build both levels. Partial results are released on failure.
    pub fn build<D>(builder: &mut AccelerationStructureBuilder<D>, data: &GeometryData) -> Result<Self>
    where
        D: AccelerationDevice<Buffer = B>,
    {
        let geometry = builder.upload(data)?;

        let blas = match builder.build_bottom_level(&geometry) {
            Ok(blas) => blas,
            Err(e) => {
                release_logged(builder.release_geometry(geometry));
                return Err(e);
            }
        };

        let tlas = match Instance::new(&blas).and_then(|instance| builder.build_top_level(&[instance])) {
            Ok(tlas) => tlas,
            Err(e) => {
                release_logged(builder.destroy(blas));
                release_logged(builder.release_geometry(geometry));
                return Err(e);
            }
        };

        Ok(Self {
            geometry,
            blas,
            tlas,
        })
    }

    /// The uploaded geometry.
    pub fn geometry(&self) -> &GeometryBuffer<B> {
        &self.geometry
    }

    /// The bottom-level structure.
    pub fn blas(&self) -> &AccelerationStructure<B> {
        &self.blas
    }

    /// The top-level structure published to shaders.
    pub fn tlas(&self) -> &AccelerationStructure<B> {
        &self.tlas
    }

    /// Destroy in reverse creation order: TLAS, BLAS, geometry.
    ///
    /// Continues past failures and returns the first.
    pub fn release<D>(self, builder: &mut AccelerationStructureBuilder<D>) -> Result<()>
    where
        D: AccelerationDevice<Buffer = B>,
    {
        let tlas = builder.destroy(self.tlas);
        let blas = builder.destroy(self.blas);
        let geometry = builder.release_geometry(self.geometry);
        tlas.and(blas).and(geometry)
    }
}

fn release_logged(result: Result<()>) {
    if let Err(e) = result {
        tracing::error!("Failed to release scene resource: {e}");
    }
}

struct OutputImage {
    image: GpuImage,
    view: vk::ImageView,
}

/// Everything a frame needs to read the scene on the device.
///
/// Fields are filled in creation order; teardown (explicit or on drop) walks
/// them in reverse, so a partially constructed scene cleans up after itself.
pub struct Scene {
    device: Arc<ash::Device>,
    allocator: Arc<Mutex<GpuAllocator>>,
    builder: AccelerationStructureBuilder<VulkanAccelerationDevice>,
    structures: Option<SceneStructures<GpuBuffer>>,
    camera_buffer: Option<GpuBuffer>,
    output: Option<OutputImage>,
    binder: Option<DescriptorBinder>,
    camera: Camera,
}

impl Scene {
    /// Build the acceleration structures for `data`, create the output image
    /// at `extent`, and publish both with the camera through the scene set.
    pub fn new(context: &GpuContext, data: &GeometryData, extent: vk::Extent2D) -> Result<Self> {
        let device = VulkanAccelerationDevice::new(context, DEFAULT_FENCE_TIMEOUT_NS)?;
        let mut scene = Self {
            device: context.shared_device(),
            allocator: context.shared_allocator(),
            builder: AccelerationStructureBuilder::new(device),
            structures: None,
            camera_buffer: None,
            output: None,
            binder: None,
            camera: Camera::looking_at_origin(extent.width, extent.height),
        };

        let structures = SceneStructures::build(&mut scene.builder, data)?;
        scene.structures = Some(structures);

        let camera_buffer = scene.allocator.lock().create_buffer(
            CameraUniform::SIZE,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            MemoryLocation::CpuToGpu,
            "camera_uniform",
        )?;
        camera_buffer.write(&[scene.camera.uniform()])?;
        scene.camera_buffer = Some(camera_buffer);

        scene.output = Some(scene.create_output(context, extent)?);

        let bindings = match (&scene.structures, &scene.output, &scene.camera_buffer) {
            (Some(structures), Some(output), Some(camera)) => SceneBindings::new(
                output.view,
                structures.tlas(),
                camera.buffer,
                CameraUniform::SIZE,
            )?,
            _ => {
                return Err(GpuError::InvalidState(
                    "scene resources missing before binding".to_string(),
                ))
            }
        };
        scene.binder = Some(DescriptorBinder::initialize(
            context.shared_device(),
            bindings,
        )?);

        tracing::info!(
            "Scene ready: {} triangles, output {}x{}",
            data.primitive_count(),
            extent.width,
            extent.height
        );
        Ok(scene)
    }

    fn create_output(&self, context: &GpuContext, extent: vk::Extent2D) -> Result<OutputImage> {
        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(OUTPUT_FORMAT)
            .extent(vk::Extent3D {
                width: extent.width.max(1),
                height: extent.height.max(1),
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(
                vk::ImageUsageFlags::STORAGE
                    | vk::ImageUsageFlags::TRANSFER_SRC
                    | vk::ImageUsageFlags::TRANSFER_DST,
            )
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let mut image =
            self.allocator
                .lock()
                .create_image(&image_info, MemoryLocation::GpuOnly, "output_image")?;

        let view_info = vk::ImageViewCreateInfo::default()
            .image(image.image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(OUTPUT_FORMAT)
            .subresource_range(color_range());
        // SAFETY: the image was just created on this device
        let view = match unsafe { self.device.create_image_view(&view_info, None) } {
            Ok(view) => view,
            Err(e) => {
                release_logged(self.allocator.lock().free_image(&mut image));
                return Err(e.into());
            }
        };

        let initialized = OneShotCommandExecutor::new(
            context.shared_device(),
            context.graphics_queue_family(),
            context.graphics_queue(),
            DEFAULT_FENCE_TIMEOUT_NS,
        )
        .and_then(|executor| {
            executor.submit("output image init", |device, cmd| {
                record_output_init(device, cmd, image.image);
            })
        });
        if let Err(e) = initialized {
            // SAFETY: the submission either never happened or has completed
            unsafe { self.device.destroy_image_view(view, None) };
            release_logged(self.allocator.lock().free_image(&mut image));
            return Err(e);
        }

        Ok(OutputImage { image, view })
    }

    /// The top-level structure.
    pub fn tlas(&self) -> Option<&AccelerationStructure> {
        self.structures.as_ref().map(SceneStructures::tlas)
    }

    /// The scene descriptor set binder.
    pub fn binder(&self) -> Option<&DescriptorBinder> {
        self.binder.as_ref()
    }

    /// The camera currently in the uniform buffer.
    pub fn camera(&self) -> &Camera {
        &self.camera
    }

    /// Replace the camera and write its uniform block.
    ///
    /// The camera buffer is host-visible and not double-buffered; callers
    /// update it between frames after waiting on the slot that last read it.
    pub fn update_camera(&mut self, camera: Camera) -> Result<()> {
        if let Some(buffer) = &self.camera_buffer {
            buffer.write(&[camera.uniform()])?;
        }
        self.camera = camera;
        Ok(())
    }

    /// Copy the output image into the frame's swapchain image and leave it
    /// ready for presentation.
    pub fn record_frame(&self, frame: &FrameContext) {
        let Some(output) = &self.output else {
            return;
        };
        record_output_blit(&self.device, frame, &output.image);
    }

    /// Release everything in reverse creation order: binding set, TLAS, BLAS,
    /// geometry, then the camera buffer and output image.
    ///
    /// Every frame that reads the scene must have completed.
    pub fn destroy(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        let mut result = Ok(());

        drop(self.binder.take());

        if let Some(structures) = self.structures.take() {
            result = result.and(structures.release(&mut self.builder));
        }

        let mut allocator = self.allocator.lock();
        if let Some(mut output) = self.output.take() {
            // SAFETY: no frame reads the output image any more
            unsafe { self.device.destroy_image_view(output.view, None) };
            result = result.and(allocator.free_image(&mut output.image));
        }
        if let Some(mut buffer) = self.camera_buffer.take() {
            result = result.and(allocator.free_buffer(&mut buffer));
        }
        result
    }
}

impl Drop for Scene {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            tracing::error!("Failed to release scene: {e}");
        }
    }
}

/// Move the output image to `GENERAL` and clear it.
fn record_output_init(device: &ash::Device, cmd: vk::CommandBuffer, image: vk::Image) {
    let to_transfer = vk::ImageMemoryBarrier::default()
        .src_access_mask(vk::AccessFlags::empty())
        .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
        .old_layout(vk::ImageLayout::UNDEFINED)
        .new_layout(vk::ImageLayout::GENERAL)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(color_range());
    let to_shader = vk::ImageMemoryBarrier::default()
        .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
        .dst_access_mask(vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE)
        .old_layout(vk::ImageLayout::GENERAL)
        .new_layout(vk::ImageLayout::GENERAL)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(color_range());
    let clear = vk::ClearColorValue {
        float32: CLEAR_COLOR,
    };

    // SAFETY: the command buffer is recording and the image belongs to its device
    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::TRANSFER,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[to_transfer],
        );
        device.cmd_clear_color_image(
            cmd,
            image,
            vk::ImageLayout::GENERAL,
            &clear,
            &[color_range()],
        );
        device.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[to_shader],
        );
    }
}

fn record_output_blit(device: &ash::Device, frame: &FrameContext, output: &GpuImage) {
    let target = frame.image.image;

    let output_readable = vk::ImageMemoryBarrier::default()
        .src_access_mask(vk::AccessFlags::SHADER_WRITE)
        .dst_access_mask(vk::AccessFlags::TRANSFER_READ)
        .old_layout(vk::ImageLayout::GENERAL)
        .new_layout(vk::ImageLayout::GENERAL)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(output.image)
        .subresource_range(color_range());
    let target_writable = vk::ImageMemoryBarrier::default()
        .src_access_mask(vk::AccessFlags::empty())
        .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
        .old_layout(vk::ImageLayout::UNDEFINED)
        .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(target)
        .subresource_range(color_range());

    let subresource = vk::ImageSubresourceLayers::default()
        .aspect_mask(vk::ImageAspectFlags::COLOR)
        .mip_level(0)
        .base_array_layer(0)
        .layer_count(1);
    let blit = vk::ImageBlit::default()
        .src_subresource(subresource)
        .src_offsets([vk::Offset3D::default(), far_corner(output.extent)])
        .dst_subresource(subresource)
        .dst_offsets([
            vk::Offset3D::default(),
            far_corner(vk::Extent3D {
                width: frame.image.extent.width,
                height: frame.image.extent.height,
                depth: 1,
            }),
        ]);

    let target_presentable = vk::ImageMemoryBarrier::default()
        .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
        .dst_access_mask(vk::AccessFlags::empty())
        .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
        .new_layout(vk::ImageLayout::PRESENT_SRC_KHR)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(target)
        .subresource_range(color_range());

    // SAFETY: the frame's command buffer is recording; the swapchain image
    // was acquired for this frame and the output image outlives the scene set
    unsafe {
        device.cmd_pipeline_barrier(
            frame.command_buffer,
            vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR | vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::TRANSFER,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[output_readable, target_writable],
        );
        device.cmd_blit_image(
            frame.command_buffer,
            output.image,
            vk::ImageLayout::GENERAL,
            target,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &[blit],
            vk::Filter::LINEAR,
        );
        device.cmd_pipeline_barrier(
            frame.command_buffer,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[target_presentable],
        );
    }
}

fn far_corner(extent: vk::Extent3D) -> vk::Offset3D {
    vk::Offset3D {
        x: extent.width as i32,
        y: extent.height as i32,
        z: 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acceleration::mock::{Event, MockAccelerationDevice};
    use crate::acceleration::{BufferRole, StructureKind, StructureState};

    #[test]
    fn builds_both_levels() {
        let mut builder = AccelerationStructureBuilder::new(MockAccelerationDevice::new());
        let scene = SceneStructures::build(&mut builder, &GeometryData::triangle()).unwrap();

        assert_eq!(scene.blas().kind(), StructureKind::BottomLevel);
        assert_eq!(scene.tlas().kind(), StructureKind::TopLevel);
        assert!(scene.tlas().is_built());
        assert_eq!(scene.geometry().primitive_count(), 1);
        assert_eq!(
            builder.device().referenced_blases(),
            vec![scene.blas().device_address().unwrap()]
        );

        scene.release(&mut builder).unwrap();
    }

    #[test]
    fn release_runs_tlas_blas_geometry() {
        let mut builder = AccelerationStructureBuilder::new(MockAccelerationDevice::new());
        let scene = SceneStructures::build(&mut builder, &GeometryData::triangle()).unwrap();
        let tlas = scene.tlas().handle();
        let blas = scene.blas().handle();
        let start = builder.device().events().len();

        scene.release(&mut builder).unwrap();

        let events = &builder.device().events()[start..];
        let position = |wanted: Event| events.iter().position(|event| *event == wanted).unwrap();
        let tlas_destroyed = position(Event::DestroyStructure(tlas));
        let blas_destroyed = position(Event::DestroyStructure(blas));
        let last_structure_free = events
            .iter()
            .rposition(|event| matches!(event, Event::Free(_)))
            .unwrap();
        assert!(tlas_destroyed < blas_destroyed);
        assert!(blas_destroyed < last_structure_free);

        // The final three frees are the geometry buffers
        let geometry_frees = events[events.len() - 3..]
            .iter()
            .all(|event| matches!(event, Event::Free(_)));
        assert!(geometry_frees);
        assert_eq!(builder.device().live_buffers(), 0);
        assert_eq!(builder.device().live_structures(), 0);
    }

    #[test]
    fn failed_build_releases_geometry() {
        let mut builder =
            AccelerationStructureBuilder::new(MockAccelerationDevice::new().failing_builds());
        let result = SceneStructures::build(&mut builder, &GeometryData::triangle());

        assert!(result.is_err());
        assert_eq!(builder.device().live_buffers(), 0);
        assert_eq!(builder.device().live_structures(), 0);
        // Vertices, indices and transform; no instance buffer was reached
        assert_eq!(builder.device().allocations(BufferRole::BuildInput).len(), 3);
    }

    #[test]
    fn released_structures_are_destroyed() {
        let mut builder = AccelerationStructureBuilder::new(MockAccelerationDevice::new());
        let scene = SceneStructures::build(&mut builder, &GeometryData::triangle()).unwrap();
        assert_eq!(scene.blas().state(), StructureState::Built);
        scene.release(&mut builder).unwrap();
        assert_eq!(builder.completed_builds(), 2);
    }

    #[test]
    fn far_corner_spans_extent() {
        let corner = far_corner(vk::Extent3D {
            width: 640,
            height: 480,
            depth: 1,
        });
        assert_eq!((corner.x, corner.y, corner.z), (640, 480, 1));
    }
}
