use std::time::Instant;

use glam::Vec3;
use vulkanalia::vk;
use winit::dpi::PhysicalSize;
use winit::event::{DeviceEvent, ElementState, KeyEvent, MouseButton, WindowEvent};
use winit::keyboard::{KeyCode, PhysicalKey};

use crate::camera::Camera;

/// Movement keys currently held.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Movement {
    forward: bool,
    back: bool,
    left: bool,
    right: bool,
    up: bool,
    down: bool,
}

impl Movement {
    fn velocity(&self) -> Vec3 {
        let axis = |pos: bool, neg: bool| pos as i32 as f32 - neg as i32 as f32;
        Vec3::new(
            axis(self.right, self.left),
            axis(self.up, self.down),
            axis(self.back, self.forward),
        )
    }
}

/// Application state shared by the window event handler and the render loop.
#[derive(Debug)]
pub struct AppContext {
    pub camera: Camera,
    pub overlay_visible: bool,
    framebuffer: PhysicalSize<u32>,
    resized: bool,
    movement: Movement,
    looking: bool,
    started: Instant,
    last_tick: Option<Instant>,
    last_frame_ms: Option<f32>,
}

impl AppContext {
    pub fn new(framebuffer: PhysicalSize<u32>) -> Self {
        Self {
            camera: Camera::default(),
            overlay_visible: true,
            framebuffer,
            resized: false,
            movement: Movement::default(),
            looking: false,
            started: Instant::now(),
            last_tick: None,
            last_frame_ms: None,
        }
    }

    pub fn framebuffer_extent(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.framebuffer.width,
            height: self.framebuffer.height,
        }
    }

    /// Returns the resize flag and clears it.
    pub fn take_resized(&mut self) -> bool {
        std::mem::take(&mut self.resized)
    }

    /// Seconds since startup.
    pub fn elapsed(&self) -> f32 {
        self.started.elapsed().as_secs_f32()
    }

    pub fn last_frame_ms(&self) -> Option<f32> {
        self.last_frame_ms
    }

    pub fn on_window_event(&mut self, event: &WindowEvent) {
        match event {
            WindowEvent::Resized(size) => self.on_resize(*size),
            WindowEvent::KeyboardInput {
                event:
                    KeyEvent {
                        physical_key: PhysicalKey::Code(code),
                        state,
                        repeat,
                        ..
                    },
                ..
            } => self.on_key(*code, *state == ElementState::Pressed, *repeat),
            WindowEvent::MouseInput { state, button, .. } => {
                self.on_mouse_button(*button, *state == ElementState::Pressed)
            }
            WindowEvent::Focused(false) => {
                self.movement = Movement::default();
                self.looking = false;
                self.camera.velocity = Vec3::ZERO;
            }
            _ => {}
        }
    }

    pub fn on_device_event(&mut self, event: &DeviceEvent) {
        if let DeviceEvent::MouseMotion { delta: (dx, dy) } = event {
            if self.looking {
                self.camera.look(*dx as f32, *dy as f32);
            }
        }
    }

    pub fn on_resize(&mut self, size: PhysicalSize<u32>) {
        self.framebuffer = size;
        self.resized = true;
    }

    pub fn on_key(&mut self, code: KeyCode, pressed: bool, repeat: bool) {
        let held = match code {
            KeyCode::KeyW => &mut self.movement.forward,
            KeyCode::KeyS => &mut self.movement.back,
            KeyCode::KeyA => &mut self.movement.left,
            KeyCode::KeyD => &mut self.movement.right,
            KeyCode::KeyE => &mut self.movement.up,
            KeyCode::KeyQ => &mut self.movement.down,
            KeyCode::F1 => {
                if pressed && !repeat {
                    self.overlay_visible = !self.overlay_visible;
                }
                return;
            }
            _ => return,
        };
        *held = pressed;
        self.camera.velocity = self.movement.velocity();
    }

    pub fn on_mouse_button(&mut self, button: MouseButton, pressed: bool) {
        if button == MouseButton::Right {
            self.looking = pressed;
        }
    }

    /// Advances the camera by the time since the previous tick.
    pub fn tick(&mut self) {
        self.tick_at(Instant::now());
    }

    fn tick_at(&mut self, now: Instant) {
        if let Some(last) = self.last_tick {
            let dt = now.saturating_duration_since(last).as_secs_f32();
            self.camera.update(dt);
            self.last_frame_ms = Some(dt * 1000.0);
        }
        self.last_tick = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn context() -> AppContext {
        AppContext::new(PhysicalSize::new(800, 600))
    }

    #[test]
    fn resize_flag_is_edge_triggered() {
        let mut ctx = context();
        assert!(!ctx.take_resized());

        ctx.on_resize(PhysicalSize::new(1024, 0));
        assert_eq!(ctx.framebuffer_extent().height, 0);
        assert!(ctx.take_resized());
        assert!(!ctx.take_resized());
    }

    #[test]
    fn wasd_sets_camera_space_velocity() {
        let mut ctx = context();
        ctx.on_key(KeyCode::KeyW, true, false);
        ctx.on_key(KeyCode::KeyD, true, false);
        assert_eq!(ctx.camera.velocity, Vec3::new(1.0, 0.0, -1.0));

        ctx.on_key(KeyCode::KeyS, true, false);
        assert_eq!(ctx.camera.velocity, Vec3::new(1.0, 0.0, 0.0));

        ctx.on_key(KeyCode::KeyD, false, false);
        ctx.on_key(KeyCode::KeyQ, true, false);
        assert_eq!(ctx.camera.velocity, Vec3::new(0.0, -1.0, 0.0));
    }

    #[test]
    fn f1_toggles_overlay_once_per_press() {
        let mut ctx = context();
        assert!(ctx.overlay_visible);
        ctx.on_key(KeyCode::F1, true, false);
        ctx.on_key(KeyCode::F1, true, true);
        ctx.on_key(KeyCode::F1, false, false);
        assert!(!ctx.overlay_visible);
    }

    #[test]
    fn mouse_look_needs_right_button() {
        let mut ctx = context();
        let motion = DeviceEvent::MouseMotion { delta: (100.0, 0.0) };

        ctx.on_device_event(&motion);
        assert_eq!(ctx.camera.yaw, 0.0);

        ctx.on_mouse_button(MouseButton::Right, true);
        ctx.on_device_event(&motion);
        assert!(ctx.camera.yaw > 0.0);
    }

    #[test]
    fn tick_moves_camera_by_elapsed_time() {
        let mut ctx = context();
        let start = Instant::now();
        ctx.tick_at(start);
        assert_eq!(ctx.last_frame_ms(), None);

        ctx.camera.pitch = 0.0;
        let before = ctx.camera.position;
        ctx.on_key(KeyCode::KeyE, true, false);
        ctx.tick_at(start + Duration::from_millis(500));

        assert!(ctx.camera.position.y > before.y);
        let ms = ctx.last_frame_ms().unwrap();
        assert!((ms - 500.0).abs() < 1e-3);
    }
}
