use std::f32::consts::FRAC_PI_2;

use glam::{Mat4, Quat, Vec3};

/// World units per second at full velocity.
const MOVE_SPEED: f32 = 3.0;
/// Radians per pixel of mouse motion.
const LOOK_SENSITIVITY: f32 = 0.005;
const PITCH_LIMIT: f32 = FRAC_PI_2 - 0.01;

/// Free-flying camera. `velocity` is in camera space: -Z forward, +X right,
/// +Y up.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Camera {
    pub position: Vec3,
    pub velocity: Vec3,
    pub pitch: f32,
    pub yaw: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            position: Vec3::new(0.0, 1.5, 4.0),
            velocity: Vec3::ZERO,
            pitch: -0.25,
            yaw: 0.0,
        }
    }
}

impl Camera {
    pub fn rotation(&self) -> Mat4 {
        let pitch = Quat::from_axis_angle(Vec3::X, self.pitch);
        let yaw = Quat::from_axis_angle(Vec3::NEG_Y, self.yaw);
        Mat4::from_quat(yaw * pitch)
    }

    pub fn view(&self) -> Mat4 {
        (Mat4::from_translation(self.position) * self.rotation()).inverse()
    }

    pub fn look(&mut self, dx: f32, dy: f32) {
        self.yaw += dx * LOOK_SENSITIVITY;
        self.pitch = (self.pitch - dy * LOOK_SENSITIVITY).clamp(-PITCH_LIMIT, PITCH_LIMIT);
    }

    pub fn update(&mut self, dt: f32) {
        let step = self.velocity * MOVE_SPEED * dt;
        self.position += self.rotation().transform_vector3(step);
    }
}

/// Vulkan clip space: Y down, depth in [0, 1].
pub fn projection(extent_width: u32, extent_height: u32) -> Mat4 {
    let aspect = extent_width as f32 / extent_height.max(1) as f32;
    let mut proj = Mat4::perspective_rh(70f32.to_radians(), aspect, 0.1, 100.0);
    proj.y_axis.y *= -1.0;
    proj
}
