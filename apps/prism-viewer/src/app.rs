//! Viewer application state.

use prism_app::{AppContext, Camera, FrameContext, GeometryData, GpuContext, RayTraceApp};
use prism_rt::Scene;

/// One triangle behind a static camera.
pub struct Viewer {
    scene: Option<Scene>,
}

impl RayTraceApp for Viewer {
    fn init(ctx: &mut AppContext) -> anyhow::Result<Self> {
        let scene = Scene::new(&ctx.gpu, &GeometryData::triangle(), ctx.extent())?;

        tracing::info!(
            "Viewer initialized: {} frames in flight, {}x{}",
            ctx.frames_in_flight(),
            ctx.width(),
            ctx.height()
        );

        Ok(Self { scene: Some(scene) })
    }

    fn render(&mut self, _gpu: &GpuContext, frame: &FrameContext) -> anyhow::Result<()> {
        if let Some(scene) = &self.scene {
            scene.record_frame(frame);
        }
        Ok(())
    }

    fn on_resize(&mut self, ctx: &mut AppContext, width: u32, height: u32) -> anyhow::Result<()> {
        // Frames are idle here, so the unbuffered camera block can be rewritten
        if let Some(scene) = &mut self.scene {
            scene.update_camera(Camera::looking_at_origin(width, height))?;
        }
        tracing::debug!("Camera aspect now {:.3}", ctx.aspect_ratio());
        Ok(())
    }

    fn cleanup(&mut self, _ctx: &mut AppContext) {
        if let Some(scene) = self.scene.take() {
            if let Err(e) = scene.destroy() {
                tracing::error!("Failed to destroy scene: {e}");
            }
        }
    }
}
