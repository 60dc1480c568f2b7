use anyhow::{ensure, Result};
use vulkanalia::prelude::v1_3::*;
use vulkanalia::vk::{Handle, KhrSurfaceExtension, KhrSwapchainExtension};

use crate::allocator::create_image_view;
use crate::config::MIN_SWAPCHAIN_IMAGES;
use crate::device::DeviceContext;

#[derive(Clone, Debug)]
pub struct SwapchainSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SwapchainSupport {
    pub unsafe fn get(context: &DeviceContext) -> Result<Self> {
        let instance = &context.instance;
        let physical_device = context.physical_device;
        let surface = context.surface;
        Ok(Self {
            capabilities: instance
                .get_physical_device_surface_capabilities_khr(physical_device, surface)?,
            formats: instance.get_physical_device_surface_formats_khr(physical_device, surface)?,
            present_modes: instance
                .get_physical_device_surface_present_modes_khr(physical_device, surface)?,
        })
    }
}

/// Everything derived from the surface before a swapchain is created.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SwapchainParams {
    pub surface_format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    pub image_count: u32,
}

impl SwapchainParams {
    /// `framebuffer` is the window's pixel size and only matters when the
    /// surface leaves the extent up to the application.
    pub fn derive(support: &SwapchainSupport, framebuffer: vk::Extent2D) -> Self {
        Self {
            surface_format: get_swapchain_surface_format(&support.formats),
            present_mode: get_swapchain_present_mode(&support.present_modes),
            extent: get_swapchain_extent(framebuffer, support.capabilities),
            image_count: get_swapchain_image_count(support.capabilities),
        }
    }

    /// A minimized window can report a fixed 0x0 surface extent.
    pub fn has_area(&self) -> bool {
        self.extent.width > 0 && self.extent.height > 0
    }
}

pub fn get_swapchain_surface_format(formats: &[vk::SurfaceFormatKHR]) -> vk::SurfaceFormatKHR {
    formats
        .iter()
        .cloned()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .unwrap_or_else(|| formats[0])
}

pub fn get_swapchain_present_mode(present_modes: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
    present_modes
        .iter()
        .cloned()
        .find(|m| *m == vk::PresentModeKHR::MAILBOX)
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

pub fn get_swapchain_extent(
    framebuffer: vk::Extent2D,
    capabilities: vk::SurfaceCapabilitiesKHR,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        let clamp = |min: u32, max: u32, v: u32| min.max(max.min(v));
        vk::Extent2D::builder()
            .width(clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
                framebuffer.width,
            ))
            .height(clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
                framebuffer.height,
            ))
            .build()
    }
}

/// At least three images, capped by the surface maximum (0 means unbounded).
pub fn get_swapchain_image_count(capabilities: vk::SurfaceCapabilitiesKHR) -> u32 {
    let image_count = MIN_SWAPCHAIN_IMAGES.max(capabilities.min_image_count);
    if capabilities.max_image_count != 0 && image_count > capabilities.max_image_count {
        capabilities.max_image_count
    } else {
        image_count
    }
}

/// The swapchain with its images and one view per image.
pub struct Swapchain {
    pub handle: vk::SwapchainKHR,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub present_mode: vk::PresentModeKHR,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
}

impl Swapchain {
    pub unsafe fn create(context: &DeviceContext, framebuffer: vk::Extent2D) -> Result<Self> {
        let support = SwapchainSupport::get(context)?;
        let params = SwapchainParams::derive(&support, framebuffer);
        ensure!(params.has_area(), "Surface has no area to present to.");

        let mut swapchain = Self {
            handle: vk::SwapchainKHR::null(),
            format: vk::Format::UNDEFINED,
            extent: vk::Extent2D::default(),
            present_mode: vk::PresentModeKHR::FIFO,
            images: Vec::new(),
            image_views: Vec::new(),
        };
        swapchain.build(&context.device, context.surface, &support, params)?;
        Ok(swapchain)
    }

    /// Replaces the swapchain and its views for a new framebuffer size. The
    /// caller must have drained the device. Returns `false` and leaves
    /// everything in place when the surface currently has no area.
    pub unsafe fn recreate(&mut self, context: &DeviceContext, framebuffer: vk::Extent2D) -> Result<bool> {
        let support = SwapchainSupport::get(context)?;
        let params = SwapchainParams::derive(&support, framebuffer);
        if !params.has_area() {
            log::debug!("Surface has no area, swapchain rebuild deferred");
            return Ok(false);
        }

        self.destroy_image_views(&context.device);
        self.build(&context.device, context.surface, &support, params)?;
        Ok(true)
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    unsafe fn build(
        &mut self,
        device: &Device,
        surface: vk::SurfaceKHR,
        support: &SwapchainSupport,
        params: SwapchainParams,
    ) -> Result<()> {
        if self.format != vk::Format::UNDEFINED && self.format != params.surface_format.format {
            log::warn!(
                "Surface format changed from {:?} to {:?}",
                self.format,
                params.surface_format.format
            );
        }

        let old_swapchain = self.handle;
        let info = vk::SwapchainCreateInfoKHR::builder()
            .surface(surface)
            .min_image_count(params.image_count)
            .image_format(params.surface_format.format)
            .image_color_space(params.surface_format.color_space)
            .image_extent(params.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(support.capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(params.present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        self.handle = device.create_swapchain_khr(&info, None)?;
        if !old_swapchain.is_null() {
            device.destroy_swapchain_khr(old_swapchain, None);
        }

        self.images = device.get_swapchain_images_khr(self.handle)?;
        self.format = params.surface_format.format;
        self.extent = params.extent;
        self.present_mode = params.present_mode;

        self.image_views = self
            .images
            .iter()
            .map(|i| create_image_view(device, *i, self.format, vk::ImageAspectFlags::COLOR, 1))
            .collect::<Result<Vec<_>>>()?;

        log::info!(
            "Swapchain built: {}x{}, {} images, {:?}, {:?}",
            self.extent.width,
            self.extent.height,
            self.images.len(),
            self.format,
            self.present_mode
        );

        Ok(())
    }

    unsafe fn destroy_image_views(&mut self, device: &Device) {
        for image_view in &self.image_views {
            device.destroy_image_view(*image_view, None);
        }
        self.image_views.clear();
    }

    /// Views go before the swapchain that owns their images.
    pub unsafe fn destroy(&mut self, device: &Device) {
        self.destroy_image_views(device);
        device.destroy_swapchain_khr(self.handle, None);
        self.handle = vk::SwapchainKHR::null();
        self.images.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn surface_format(format: vk::Format, color_space: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space,
        }
    }

    fn capabilities(
        current: (u32, u32),
        min_extent: (u32, u32),
        max_extent: (u32, u32),
        min_images: u32,
        max_images: u32,
    ) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: current.0,
                height: current.1,
            },
            min_image_extent: vk::Extent2D {
                width: min_extent.0,
                height: min_extent.1,
            },
            max_image_extent: vk::Extent2D {
                width: max_extent.0,
                height: max_extent.1,
            },
            min_image_count: min_images,
            max_image_count: max_images,
            ..Default::default()
        }
    }

    fn extent(width: u32, height: u32) -> vk::Extent2D {
        vk::Extent2D { width, height }
    }

    #[test]
    fn prefers_bgra8_srgb_nonlinear() {
        let formats = [
            surface_format(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            surface_format(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        assert_eq!(get_swapchain_surface_format(&formats), formats[1]);
    }

    #[test]
    fn falls_back_to_first_reported_format() {
        let formats = [
            surface_format(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            surface_format(vk::Format::B8G8R8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        assert_eq!(get_swapchain_surface_format(&formats), formats[0]);
    }

    #[test]
    fn prefers_mailbox_then_fifo() {
        let with_mailbox = [
            vk::PresentModeKHR::FIFO,
            vk::PresentModeKHR::IMMEDIATE,
            vk::PresentModeKHR::MAILBOX,
        ];
        assert_eq!(
            get_swapchain_present_mode(&with_mailbox),
            vk::PresentModeKHR::MAILBOX
        );

        let without = [vk::PresentModeKHR::IMMEDIATE, vk::PresentModeKHR::FIFO_RELAXED];
        assert_eq!(get_swapchain_present_mode(&without), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn fixed_surface_extent_is_used_directly() {
        let caps = capabilities((1024, 768), (1, 1), (4096, 4096), 2, 8);
        assert_eq!(get_swapchain_extent(extent(800, 600), caps), extent(1024, 768));
    }

    #[test]
    fn sentinel_extent_clamps_framebuffer_size() {
        let caps = capabilities((u32::MAX, u32::MAX), (64, 64), (2048, 1024), 2, 8);
        assert_eq!(get_swapchain_extent(extent(800, 600), caps), extent(800, 600));
        assert_eq!(get_swapchain_extent(extent(4000, 10), caps), extent(2048, 64));
    }

    #[test]
    fn image_count_is_at_least_three_and_capped() {
        let unbounded = capabilities((800, 600), (1, 1), (800, 600), 2, 0);
        assert_eq!(get_swapchain_image_count(unbounded), 3);

        let capped = capabilities((800, 600), (1, 1), (800, 600), 1, 2);
        assert_eq!(get_swapchain_image_count(capped), 2);

        let demanding = capabilities((800, 600), (1, 1), (800, 600), 4, 6);
        assert_eq!(get_swapchain_image_count(demanding), 4);
    }

    #[test]
    fn deriving_twice_with_same_window_is_idempotent() {
        let support = SwapchainSupport {
            capabilities: capabilities((u32::MAX, u32::MAX), (1, 1), (4096, 4096), 2, 0),
            formats: vec![surface_format(
                vk::Format::B8G8R8A8_SRGB,
                vk::ColorSpaceKHR::SRGB_NONLINEAR,
            )],
            present_modes: vec![vk::PresentModeKHR::FIFO],
        };

        let first = SwapchainParams::derive(&support, extent(1280, 720));
        let second = SwapchainParams::derive(&support, extent(1280, 720));
        assert_eq!(first, second);
        assert_eq!(first.extent, extent(1280, 720));
        assert_eq!(first.image_count, 3);
    }

    #[test]
    fn zero_surface_extent_has_no_area() {
        let support = SwapchainSupport {
            capabilities: capabilities((0, 0), (0, 0), (4096, 4096), 2, 0),
            formats: vec![surface_format(
                vk::Format::B8G8R8A8_SRGB,
                vk::ColorSpaceKHR::SRGB_NONLINEAR,
            )],
            present_modes: vec![vk::PresentModeKHR::FIFO],
        };

        // The window still reports its last size while the surface is 0x0.
        let params = SwapchainParams::derive(&support, extent(800, 600));
        assert_eq!(params.extent, extent(0, 0));
        assert!(!params.has_area());

        let flat = SwapchainSupport {
            capabilities: capabilities((800, 0), (1, 1), (4096, 4096), 2, 0),
            ..support.clone()
        };
        assert!(!SwapchainParams::derive(&flat, extent(800, 600)).has_area());

        let sentinel = SwapchainSupport {
            capabilities: capabilities((u32::MAX, u32::MAX), (1, 1), (4096, 4096), 2, 0),
            ..support
        };
        assert!(SwapchainParams::derive(&sentinel, extent(800, 600)).has_area());
    }
}
