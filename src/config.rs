use std::path::PathBuf;

use anyhow::{anyhow, Result};
use vulkanalia::prelude::v1_3::*;

pub const VALIDATION_LAYER: vk::ExtensionName =
    vk::ExtensionName::from_bytes(b"VK_LAYER_KHRONOS_validation");

pub const DEVICE_EXTENSIONS: &[vk::ExtensionName] = &[
    vk::KHR_SWAPCHAIN_EXTENSION.name,
    vk::KHR_SPIRV_1_4_EXTENSION.name,
    vk::KHR_SYNCHRONIZATION2_EXTENSION.name,
    vk::KHR_CREATE_RENDERPASS2_EXTENSION.name,
    vk::EXT_EXTENDED_DYNAMIC_STATE_EXTENSION.name,
];

/// Lowest device API version accepted during adapter selection.
pub const MIN_API_VERSION: u32 = vk::make_version(1, 3, 0);

pub const MAX_FRAMES_IN_FLIGHT: usize = 2;
pub const MIN_SWAPCHAIN_IMAGES: u32 = 3;

// Fence waits poll with this timeout and retry
pub const FENCE_TIMEOUT_NS: u64 = 1_000_000_000;

pub const INITIAL_WINDOW_WIDTH: u32 = 800;
pub const INITIAL_WINDOW_HEIGHT: u32 = 600;

pub const DEFAULT_SHADER: &str = "shaders/scene";

/// Runtime options taken from the command line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// glTF file to display; the built-in scene is used when absent.
    pub scene: Option<PathBuf>,
    /// Either a precompiled `.spv` blob or the stem of a `.vert`/`.frag` GLSL pair.
    pub shader: PathBuf,
    pub validation: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scene: None,
            shader: PathBuf::from(DEFAULT_SHADER),
            validation: cfg!(debug_assertions),
        }
    }
}

impl Config {
    pub fn from_args<I>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut config = Self::default();
        let mut args = args.into_iter();

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--shader" => {
                    let path = args
                        .next()
                        .ok_or_else(|| anyhow!("`--shader` expects a path"))?;
                    config.shader = PathBuf::from(path);
                }
                "--validation" => config.validation = true,
                "--no-validation" => config.validation = false,
                flag if flag.starts_with("--") => {
                    return Err(anyhow!("Unknown option `{}`", flag));
                }
                path => {
                    if config.scene.is_some() {
                        return Err(anyhow!("Only one scene path may be given"));
                    }
                    config.scene = Some(PathBuf::from(path));
                }
            }
        }

        Ok(config)
    }
}
