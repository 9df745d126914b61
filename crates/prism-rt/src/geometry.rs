//! Triangle geometry resident on the device.

use ash::vk;
use prism_core::GeometryData;
use prism_gpu::{GpuBuffer, Result};

use crate::acceleration::{AccelerationDevice, BufferRole, BuildDescription};

/// Host-visible vertex, index and transform buffers uploaded from [`GeometryData`].
///
/// Owned by the caller and released with [`GeometryBuffer::release`] after
/// every structure built from it has been destroyed.
pub struct GeometryBuffer<B = GpuBuffer> {
    vertices: B,
    indices: B,
    transform: B,
    vertex_count: u32,
    primitive_count: u32,
    vertex_address: vk::DeviceAddress,
    index_address: vk::DeviceAddress,
    transform_address: vk::DeviceAddress,
}

impl<B> GeometryBuffer<B> {
    /// Upload a copy of `data`.
    pub fn upload<D>(device: &mut D, data: &GeometryData) -> Result<Self>
    where
        D: AccelerationDevice<Buffer = B>,
    {
        let vertices = upload_bytes(device, data.vertex_bytes(), "geometry_vertices")?;
        let indices = match upload_bytes(device, data.index_bytes(), "geometry_indices") {
            Ok(buffer) => buffer,
            Err(e) => {
                release_quietly(device, vertices);
                return Err(e);
            }
        };
        let transform = match upload_bytes(
            device,
            bytemuck::bytes_of(data.transform()),
            "geometry_transform",
        ) {
            Ok(buffer) => buffer,
            Err(e) => {
                release_quietly(device, indices);
                release_quietly(device, vertices);
                return Err(e);
            }
        };

        tracing::debug!(
            "Uploaded geometry: {} vertices, {} triangles",
            data.vertex_count(),
            data.primitive_count()
        );

        Ok(Self {
            vertex_address: device.buffer_address(&vertices),
            index_address: device.buffer_address(&indices),
            transform_address: device.buffer_address(&transform),
            vertices,
            indices,
            transform,
            vertex_count: data.vertex_count(),
            primitive_count: data.primitive_count(),
        })
    }

    /// Number of vertices.
    pub fn vertex_count(&self) -> u32 {
        self.vertex_count
    }

    /// Number of triangles.
    pub fn primitive_count(&self) -> u32 {
        self.primitive_count
    }

    /// Device address of the vertex buffer.
    pub fn vertex_address(&self) -> vk::DeviceAddress {
        self.vertex_address
    }

    /// Device address of the index buffer.
    pub fn index_address(&self) -> vk::DeviceAddress {
        self.index_address
    }

    /// Device address of the transform buffer.
    pub fn transform_address(&self) -> vk::DeviceAddress {
        self.transform_address
    }

    /// Triangle build description for these buffers.
    pub fn description(&self) -> BuildDescription {
        BuildDescription::triangles(
            self.vertex_address,
            self.vertex_count,
            self.index_address,
            self.transform_address,
            self.primitive_count,
        )
    }

    /// Release the buffers, transform first.
    pub fn release<D>(self, device: &mut D) -> Result<()>
    where
        D: AccelerationDevice<Buffer = B>,
    {
        let transform = device.free(self.transform);
        let indices = device.free(self.indices);
        let vertices = device.free(self.vertices);
        transform.and(indices).and(vertices)
    }
}

fn upload_bytes<D: AccelerationDevice>(device: &mut D, bytes: &[u8], name: &str) -> Result<D::Buffer> {
    let buffer = device.allocate(BufferRole::BuildInput, bytes.len() as u64, name)?;
    if let Err(e) = device.write(&buffer, 0, bytes) {
        release_quietly(device, buffer);
        return Err(e);
    }
    Ok(buffer)
}

fn release_quietly<D: AccelerationDevice>(device: &mut D, buffer: D::Buffer) {
    if let Err(e) = device.free(buffer) {
        tracing::error!("Failed to release geometry buffer: {e}");
    }
}
