//! `RayTraceApp` trait definition.

use prism_gpu::GpuContext;
use prism_rt::FrameContext;
use winit::event::WindowEvent;

use crate::context::AppContext;

/// Trait for Prism applications.
///
/// The framework creates the window, GPU context and frame scheduler, then
/// calls into the application once per frame.
pub trait RayTraceApp: Sized {
    /// Initialize the application.
    ///
    /// Called once after the GPU context, swapchain and frame slots exist.
    fn init(ctx: &mut AppContext) -> anyhow::Result<Self>;

    /// Update application state.
    ///
    /// Called every frame before the frame slot is waited on. `dt` is the time
    /// in seconds since the previous frame.
    #[allow(unused_variables)]
    fn update(&mut self, ctx: &AppContext, dt: f32) {}

    /// Record a frame.
    ///
    /// The command buffer in `frame` is recording; the framework submits it
    /// and presents `frame.image` afterwards. The recorded commands must leave
    /// the image in `PRESENT_SRC_KHR`.
    fn render(&mut self, gpu: &GpuContext, frame: &FrameContext) -> anyhow::Result<()>;

    /// Handle window resize.
    ///
    /// Called after the swapchain has been recreated and every frame slot is
    /// idle.
    #[allow(unused_variables)]
    fn on_resize(&mut self, ctx: &mut AppContext, width: u32, height: u32) -> anyhow::Result<()> {
        Ok(())
    }

    /// Handle window events. Return `true` to stop further processing.
    #[allow(unused_variables)]
    fn on_event(&mut self, event: &WindowEvent) -> bool {
        false
    }

    /// Release resources before shutdown.
    ///
    /// Every frame slot is idle when this is called.
    #[allow(unused_variables)]
    fn cleanup(&mut self, ctx: &mut AppContext) {}
}
