//! Math utilities and helpers.

use glam::{Affine3A, Mat4, Vec3, Vec4};

/// Affine transform stored as a 3x4 row-major matrix.
///
/// Byte-identical to `VkTransformMatrixKHR`: each row holds the three
/// linear components followed by the translation.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct AffineTransform {
    pub rows: [[f32; 4]; 3],
}

impl AffineTransform {
    /// The identity transform.
    pub const IDENTITY: Self = Self {
        rows: [
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
        ],
    };

    /// Size in bytes (48).
    pub const SIZE: usize = std::mem::size_of::<Self>();

    /// Create a transform from explicit rows.
    #[inline]
    pub const fn from_rows(rows: [[f32; 4]; 3]) -> Self {
        Self { rows }
    }

    /// Create a pure translation.
    pub fn from_translation(translation: Vec3) -> Self {
        Self::from_affine(&Affine3A::from_translation(translation))
    }

    /// Convert from a glam affine transform.
    pub fn from_affine(affine: &Affine3A) -> Self {
        Self::from_mat4(&Mat4::from(*affine))
    }

    /// Convert from a 4x4 matrix, dropping the projective row.
    pub fn from_mat4(m: &Mat4) -> Self {
        let row = |r: usize| -> [f32; 4] { m.row(r).to_array() };
        Self {
            rows: [row(0), row(1), row(2)],
        }
    }

    /// Expand to a 4x4 matrix with `[0, 0, 0, 1]` as the last row.
    pub fn to_mat4(&self) -> Mat4 {
        Mat4::from_cols(
            Vec4::new(self.rows[0][0], self.rows[1][0], self.rows[2][0], 0.0),
            Vec4::new(self.rows[0][1], self.rows[1][1], self.rows[2][1], 0.0),
            Vec4::new(self.rows[0][2], self.rows[1][2], self.rows[2][2], 0.0),
            Vec4::new(self.rows[0][3], self.rows[1][3], self.rows[2][3], 1.0),
        )
    }

    /// Transform a point.
    #[inline]
    pub fn transform_point(&self, p: Vec3) -> Vec3 {
        self.to_mat4().transform_point3(p)
    }
}

impl Default for AffineTransform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl From<Affine3A> for AffineTransform {
    fn from(affine: Affine3A) -> Self {
        Self::from_affine(&affine)
    }
}

/// Axis-Aligned Bounding Box.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Aabb {
    /// Minimum corner
    pub min: Vec3,
    /// Maximum corner
    pub max: Vec3,
}

impl Aabb {
    /// An inverted box that any point expands.
    pub const EMPTY: Self = Self {
        min: Vec3::splat(f32::INFINITY),
        max: Vec3::splat(f32::NEG_INFINITY),
    };

    /// Create a new AABB from min and max corners
    #[inline]
    pub const fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// Bounds of a point set. Returns `None` for an empty set.
    pub fn from_points(points: &[Vec3]) -> Option<Self> {
        if points.is_empty() {
            return None;
        }
        let mut aabb = Self::EMPTY;
        for &p in points {
            aabb.expand_to_include(p);
        }
        Some(aabb)
    }

    /// Get the center of the AABB
    #[inline]
    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    /// Get the size of the AABB
    #[inline]
    pub fn size(&self) -> Vec3 {
        self.max - self.min
    }

    /// Expand AABB to include a point
    #[inline]
    pub fn expand_to_include(&mut self, point: Vec3) {
        self.min = self.min.min(point);
        self.max = self.max.max(point);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn transform_size_matches_vulkan() {
        assert_eq!(AffineTransform::SIZE, 48);
    }

    #[test]
    fn identity_bytes_round_trip() {
        let bytes = bytemuck::bytes_of(&AffineTransform::IDENTITY).to_vec();
        let back: AffineTransform = *bytemuck::from_bytes(&bytes);
        assert_eq!(back, AffineTransform::IDENTITY);
    }

    #[test]
    fn translation_lands_in_last_column() {
        let t = AffineTransform::from_translation(Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(t.rows[0][3], 1.0);
        assert_eq!(t.rows[1][3], 2.0);
        assert_eq!(t.rows[2][3], 3.0);
        assert_eq!(t.rows[0][0], 1.0);
    }

    #[test]
    fn mat4_conversion_is_row_major() {
        let m = Mat4::from_rotation_z(std::f32::consts::FRAC_PI_2)
            * Mat4::from_translation(Vec3::new(0.0, 0.0, 5.0));
        let t = AffineTransform::from_mat4(&m);
        let p = Vec3::new(1.0, 0.0, 0.0);
        let expected = m.transform_point3(p);
        let actual = t.transform_point(p);
        assert_relative_eq!(actual.x, expected.x, epsilon = 1e-6);
        assert_relative_eq!(actual.y, expected.y, epsilon = 1e-6);
        assert_relative_eq!(actual.z, expected.z, epsilon = 1e-6);
        assert_eq!(t.to_mat4(), m);
    }

    #[test]
    fn aabb_from_points() {
        let aabb = Aabb::from_points(&[
            Vec3::new(1.0, 1.0, 0.0),
            Vec3::new(-1.0, 1.0, 0.0),
            Vec3::new(0.0, -1.0, 0.0),
        ])
        .unwrap();
        assert_eq!(aabb.min, Vec3::new(-1.0, -1.0, 0.0));
        assert_eq!(aabb.max, Vec3::new(1.0, 1.0, 0.0));
        assert_eq!(aabb.center(), Vec3::new(0.0, 0.0, 0.0));
        assert!(Aabb::from_points(&[]).is_none());
    }
}
