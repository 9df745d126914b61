//! Core host-side types for the Prism ray tracer.
//!
//! This crate provides the data that is handed to the GPU layer:
//! - Triangle geometry and its validation
//! - Row-major affine transforms in the layout acceleration structures consume
//! - Camera and the camera uniform block read by the ray generation stage
//!
//! Nothing here touches the device.

pub mod camera;
pub mod error;
pub mod geometry;
pub mod math;

pub use camera::{Camera, CameraUniform};
pub use error::{GeometryError, Result};
pub use geometry::GeometryData;
pub use math::{Aabb, AffineTransform};
