use thiserror::Error;
use vulkanalia::vk;

/// Fatal conditions with a name of their own. Everything here terminates the
/// application; swapchain staleness is handled by rebuilding and never shows up
/// as an error.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("Failed to find a suitable physical device.")]
    NoSuitableDevice,
    #[error("Requested layer `{0}` is not supported.")]
    MissingLayer(String),
    #[error("Missing required {kind} extension `{name}`.")]
    MissingExtension { kind: &'static str, name: String },
    #[error("No memory type in {type_bits:#b} with properties {properties:?}.")]
    NoSuitableMemoryType {
        type_bits: u32,
        properties: vk::MemoryPropertyFlags,
    },
    #[error("Unsupported layout transition {old:?} -> {new:?}.")]
    UnsupportedLayoutTransition {
        old: vk::ImageLayout,
        new: vk::ImageLayout,
    },
    #[error("Unsupported format: {0}.")]
    UnsupportedFormat(String),
    #[error("Drawable {drawable} references texture {texture}, but only {available} are loaded.")]
    MissingTexture {
        drawable: usize,
        texture: usize,
        available: usize,
    },
    #[error("Invalid shader bytecode: {0}.")]
    InvalidShader(String),
    #[error("Failed to acquire swapchain image: {0}")]
    Acquire(vk::ErrorCode),
    #[error("Failed to submit frame: {0}")]
    Submit(vk::ErrorCode),
    #[error("Failed to present swapchain image: {0}")]
    Present(vk::ErrorCode),
}
