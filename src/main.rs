mod allocator;
mod camera;
mod config;
mod context;
mod device;
mod error;
mod frame;
mod overlay;
mod pipeline;
mod recorder;
mod renderer;
mod scene;
mod swapchain;

use std::env;

use anyhow::Result;
use winit::dpi::LogicalSize;
use winit::event::{Event, WindowEvent};
use winit::event_loop::{ControlFlow, EventLoop};
use winit::window::WindowBuilder;

use crate::config::{Config, INITIAL_WINDOW_HEIGHT, INITIAL_WINDOW_WIDTH};
use crate::context::AppContext;
use crate::frame::FrameOutcome;
use crate::renderer::Renderer;
use crate::scene::SceneData;

fn main() -> Result<()> {
    pretty_env_logger::init();

    let config = Config::from_args(env::args().skip(1))?;
    let scene = match &config.scene {
        Some(path) => scene::load_gltf(path)?,
        None => {
            log::info!("No scene given, using the built-in one");
            SceneData::builtin()
        }
    };

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Wait);
    let window = WindowBuilder::new()
        .with_title("VK Scene Viewer")
        .with_inner_size(LogicalSize::new(INITIAL_WINDOW_WIDTH, INITIAL_WINDOW_HEIGHT))
        .build(&event_loop)?;

    let mut app = AppContext::new(window.inner_size());
    let mut renderer =
        unsafe { Renderer::create(&window, &config, &scene, app.framebuffer_extent())? };
    drop(scene);

    let mut failure = None;
    let result = event_loop.run(|event, target| match event {
        Event::WindowEvent { event, .. } => {
            app.on_window_event(&event);
            match event {
                WindowEvent::CloseRequested => target.exit(),
                WindowEvent::RedrawRequested if !target.exiting() => {
                    app.tick();
                    match unsafe { renderer.render(&mut app) } {
                        Ok(FrameOutcome::Deferred) => {
                            log::debug!("Nothing to present to, waiting for a resize");
                        }
                        Ok(_) => {}
                        Err(error) => {
                            log::error!("Frame failed: {:#}", error);
                            failure = Some(error);
                            target.exit();
                        }
                    }
                }
                _ => {}
            }
        }
        Event::DeviceEvent { event, .. } => app.on_device_event(&event),
        Event::AboutToWait => {
            // While minimized no redraw is requested, so the loop blocks on
            // events until the window has an area again.
            let extent = app.framebuffer_extent();
            if extent.width > 0 && extent.height > 0 {
                window.request_redraw();
            }
        }
        _ => {}
    });

    unsafe { renderer.destroy() };

    result?;
    match failure {
        Some(error) => Err(error),
        None => Ok(()),
    }
}
