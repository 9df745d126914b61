//! Triangle geometry handed to the acceleration structure builder.

use glam::Vec3;

use crate::error::{GeometryError, Result};
use crate::math::{Aabb, AffineTransform};

/// Indexed triangle list with a placement transform.
///
/// Validated on construction and immutable afterwards, so anything holding a
/// `GeometryData` can rely on it describing at least one complete triangle.
#[derive(Debug, Clone, PartialEq)]
pub struct GeometryData {
    positions: Vec<Vec3>,
    indices: Vec<u32>,
    transform: AffineTransform,
}

impl GeometryData {
    /// Byte stride between consecutive vertex positions.
    pub const VERTEX_STRIDE: u64 = std::mem::size_of::<Vec3>() as u64;

    /// Create validated geometry with an identity transform.
    pub fn new(positions: Vec<Vec3>, indices: Vec<u32>) -> Result<Self> {
        Self::with_transform(positions, indices, AffineTransform::IDENTITY)
    }

    /// Create validated geometry with an explicit transform.
    pub fn with_transform(
        positions: Vec<Vec3>,
        indices: Vec<u32>,
        transform: AffineTransform,
    ) -> Result<Self> {
        validate(&positions, &indices)?;
        Ok(Self {
            positions,
            indices,
            transform,
        })
    }

    /// A single triangle at (1, 1, 0), (-1, 1, 0), (0, -1, 0).
    pub fn triangle() -> Self {
        Self {
            positions: vec![
                Vec3::new(1.0, 1.0, 0.0),
                Vec3::new(-1.0, 1.0, 0.0),
                Vec3::new(0.0, -1.0, 0.0),
            ],
            indices: vec![0, 1, 2],
            transform: AffineTransform::IDENTITY,
        }
    }

    /// Vertex positions.
    pub fn positions(&self) -> &[Vec3] {
        &self.positions
    }

    /// Triangle indices.
    pub fn indices(&self) -> &[u32] {
        &self.indices
    }

    /// Placement transform applied during the bottom-level build.
    pub fn transform(&self) -> &AffineTransform {
        &self.transform
    }

    /// Number of vertices.
    pub fn vertex_count(&self) -> u32 {
        // Bounded by `validate`.
        self.positions.len() as u32
    }

    /// Number of indices.
    pub fn index_count(&self) -> u32 {
        self.indices.len() as u32
    }

    /// Number of triangles.
    pub fn primitive_count(&self) -> u32 {
        self.index_count() / 3
    }

    /// Highest addressable vertex index.
    pub fn max_vertex(&self) -> u32 {
        self.vertex_count() - 1
    }

    /// Vertex positions as raw bytes.
    pub fn vertex_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.positions)
    }

    /// Indices as raw bytes.
    pub fn index_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.indices)
    }

    /// Object-space bounds (before the transform).
    pub fn bounds(&self) -> Aabb {
        Aabb::from_points(&self.positions).unwrap_or(Aabb::new(Vec3::ZERO, Vec3::ZERO))
    }
}

fn validate(positions: &[Vec3], indices: &[u32]) -> Result<()> {
    if positions.len() > u32::MAX as usize || indices.len() > u32::MAX as usize {
        return Err(GeometryError::TooLarge(format!(
            "{} vertices, {} indices",
            positions.len(),
            indices.len()
        )));
    }
    if indices.len() % 3 != 0 {
        return Err(GeometryError::IncompleteTriangle(indices.len()));
    }
    if indices.is_empty() || positions.is_empty() {
        return Err(GeometryError::NoPrimitives);
    }
    if let Some(position) = indices
        .iter()
        .position(|&i| i as usize >= positions.len())
    {
        return Err(GeometryError::IndexOutOfRange {
            index: indices[position],
            position,
            vertex_count: positions.len(),
        });
    }
    Ok(())
}
