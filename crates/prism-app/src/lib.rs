//! Application framework for the Prism ray tracer.
//!
//! This crate provides a trait-based application framework that handles:
//! - Logging setup
//! - Window creation and management
//! - GPU context initialization
//! - Frame scheduling over N frames in flight
//! - Swapchain recreation on resize or out-of-date surfaces
//! - Event loop handling
//!
//! # Example
//!
//! ```no_run
//! use prism_app::{run_app, AppConfig, AppContext, FrameContext, GpuContext, RayTraceApp};
//!
//! struct MyApp;
//!
//! impl RayTraceApp for MyApp {
//!     fn init(_ctx: &mut AppContext) -> anyhow::Result<Self> {
//!         Ok(MyApp)
//!     }
//!
//!     fn render(&mut self, gpu: &GpuContext, frame: &FrameContext) -> anyhow::Result<()> {
//!         prism_app::record_present_transition(gpu.device(), frame);
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> anyhow::Result<()> {
//!     run_app::<MyApp>(AppConfig::default())
//! }
//! ```

mod app;
mod context;
mod runner;

pub use app::RayTraceApp;
pub use context::AppContext;
pub use runner::{init_logging, run_app, AppConfig};

// Re-export commonly used types for convenience
pub use prism_core::{Camera, GeometryData};
pub use prism_gpu::{GpuContext, GpuContextBuilder};
pub use prism_rt::{record_present_transition, FrameContext, FrameStatus};
pub use winit::event::WindowEvent;
