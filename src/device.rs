use std::collections::HashSet;
use std::ffi::{c_void, CStr};

use anyhow::{anyhow, Result};
use vulkanalia::prelude::v1_3::*;
use vulkanalia::vk::{ExtDebugUtilsExtension, Handle, KhrSurfaceExtension};
use vulkanalia::{
    loader::{LibloadingLoader, LIBRARY},
    window as vk_window,
};
use winit::window::Window;

use crate::config::{Config, DEVICE_EXTENSIONS, MIN_API_VERSION, VALIDATION_LAYER};
use crate::error::RenderError;

/// Instance, surface, adapter and the single combined queue.
///
/// Built once at startup. Everything else in the renderer borrows the device
/// from here, so this is the last thing torn down.
pub struct DeviceContext {
    #[allow(dead_code)]
    entry: Entry,
    pub instance: Instance,
    messenger: vk::DebugUtilsMessengerEXT,
    pub surface: vk::SurfaceKHR,
    pub physical_device: vk::PhysicalDevice,
    pub device: Device,
    /// Graphics, compute, transfer and present all go through this queue.
    pub queue: vk::Queue,
    pub queue_family: u32,
}

impl DeviceContext {
    pub unsafe fn create(window: &Window, config: &Config) -> Result<Self> {
        let loader = LibloadingLoader::new(LIBRARY)?;
        let entry = Entry::new(loader).map_err(|b| anyhow!("{}", b))?;

        let instance = create_instance(window, &entry, config.validation)?;
        let messenger = if config.validation {
            create_debug_messenger(&instance)?
        } else {
            vk::DebugUtilsMessengerEXT::null()
        };

        let surface = vk_window::create_surface(&instance, window, window)?;
        let (physical_device, queue_family) = pick_physical_device(&instance, surface)?;
        let device = create_logical_device(&instance, physical_device, queue_family, config)?;
        let queue = device.get_device_queue(queue_family, 0);

        Ok(Self {
            entry,
            instance,
            messenger,
            surface,
            physical_device,
            device,
            queue,
            queue_family,
        })
    }

    pub unsafe fn limits(&self) -> vk::PhysicalDeviceLimits {
        self.instance
            .get_physical_device_properties(self.physical_device)
            .limits
    }

    /// Caller must have destroyed every object created from `device` first.
    pub unsafe fn destroy(&mut self) {
        self.device.destroy_device(None);
        if !self.messenger.is_null() {
            self.instance
                .destroy_debug_utils_messenger_ext(self.messenger, None);
        }
        self.instance.destroy_surface_khr(self.surface, None);
        self.instance.destroy_instance(None);
    }
}

unsafe fn create_instance(window: &Window, entry: &Entry, validation: bool) -> Result<Instance> {
    let loader_version = entry
        .enumerate_instance_version()
        .unwrap_or(vk::make_version(1, 0, 0));
    log::info!(
        "Vulkan loader version: {}.{}.{}",
        vk::version_major(loader_version),
        vk::version_minor(loader_version),
        vk::version_patch(loader_version)
    );

    let application_info = vk::ApplicationInfo::builder()
        .application_name(b"VK Scene Viewer\0")
        .application_version(vk::make_version(1, 0, 0))
        .engine_name(b"No Engine\0")
        .engine_version(vk::make_version(1, 0, 0))
        .api_version(MIN_API_VERSION);

    let mut extensions = vk_window::get_required_instance_extensions(window)
        .iter()
        .map(|e| e.as_ptr())
        .collect::<Vec<_>>();

    let mut layers = Vec::new();
    if validation {
        check_validation_layer_support(entry)?;
        layers.push(VALIDATION_LAYER.as_ptr());
        extensions.push(vk::EXT_DEBUG_UTILS_EXTENSION.name.as_ptr());
    }

    let info = vk::InstanceCreateInfo::builder()
        .application_info(&application_info)
        .enabled_layer_names(&layers)
        .enabled_extension_names(&extensions);

    Ok(entry.create_instance(&info, None)?)
}

unsafe fn check_validation_layer_support(entry: &Entry) -> Result<()> {
    let available_layers = entry
        .enumerate_instance_layer_properties()?
        .iter()
        .map(|l| l.layer_name)
        .collect::<HashSet<_>>();

    if available_layers.contains(&VALIDATION_LAYER) {
        Ok(())
    } else {
        Err(RenderError::MissingLayer(VALIDATION_LAYER.to_string()).into())
    }
}

unsafe fn create_debug_messenger(instance: &Instance) -> Result<vk::DebugUtilsMessengerEXT> {
    let info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
        .message_severity(vk::DebugUtilsMessageSeverityFlagsEXT::all())
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .user_callback(Some(debug_callback));

    Ok(instance.create_debug_utils_messenger_ext(&info, None)?)
}

extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    type_: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _: *mut c_void,
) -> vk::Bool32 {
    let data = unsafe { *data };
    let message = unsafe { CStr::from_ptr(data.message) }.to_string_lossy();

    if severity >= vk::DebugUtilsMessageSeverityFlagsEXT::ERROR {
        log::error!("({:?}) {}", type_, message);
    } else if severity >= vk::DebugUtilsMessageSeverityFlagsEXT::WARNING {
        log::warn!("({:?}) {}", type_, message);
    } else if severity >= vk::DebugUtilsMessageSeverityFlagsEXT::INFO {
        log::debug!("({:?}) {}", type_, message);
    } else {
        log::trace!("({:?}) {}", type_, message);
    }

    vk::FALSE
}

/// Returns the first adapter meeting the capability contract, with the index
/// of its combined graphics+compute+present queue family. There is no
/// fallback tier.
unsafe fn pick_physical_device(
    instance: &Instance,
    surface: vk::SurfaceKHR,
) -> Result<(vk::PhysicalDevice, u32)> {
    for physical_device in instance.enumerate_physical_devices()? {
        let properties = instance.get_physical_device_properties(physical_device);
        let device_version = properties.api_version;
        log::info!(
            "Physical device `{}` supports Vulkan {}.{}.{}",
            properties.device_name,
            vk::version_major(device_version),
            vk::version_minor(device_version),
            vk::version_patch(device_version)
        );

        match check_physical_device(instance, surface, physical_device) {
            Ok(queue_family) => {
                log::info!("Selected physical device (`{}`).", properties.device_name);
                return Ok((physical_device, queue_family));
            }
            Err(error) => log::warn!(
                "Skipping physical device (`{}`): {}",
                properties.device_name,
                error
            ),
        }
    }

    Err(RenderError::NoSuitableDevice.into())
}

unsafe fn check_physical_device(
    instance: &Instance,
    surface: vk::SurfaceKHR,
    physical_device: vk::PhysicalDevice,
) -> Result<u32> {
    let properties = instance.get_physical_device_properties(physical_device);
    if properties.api_version < MIN_API_VERSION {
        return Err(anyhow!("Vulkan 1.3 is not supported."));
    }

    let families = instance.get_physical_device_queue_family_properties(physical_device);
    let queue_family = select_queue_family(&families, |index| {
        Ok(instance.get_physical_device_surface_support_khr(physical_device, index, surface)?)
    })?
    .ok_or_else(|| anyhow!("No queue family supports graphics, compute and present."))?;

    check_physical_device_extensions(instance, physical_device)?;
    check_physical_device_features(instance, physical_device)?;

    let formats = instance.get_physical_device_surface_formats_khr(physical_device, surface)?;
    let present_modes =
        instance.get_physical_device_surface_present_modes_khr(physical_device, surface)?;
    if formats.is_empty() || present_modes.is_empty() {
        return Err(anyhow!("Insufficient swapchain support."));
    }

    Ok(queue_family)
}

/// First family that can do graphics and compute and also present to the
/// surface.
pub fn select_queue_family<F>(
    families: &[vk::QueueFamilyProperties],
    mut supports_present: F,
) -> Result<Option<u32>>
where
    F: FnMut(u32) -> Result<bool>,
{
    let required = vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE;
    for (index, family) in families.iter().enumerate() {
        let index = index as u32;
        if family.queue_count > 0
            && family.queue_flags.contains(required)
            && supports_present(index)?
        {
            return Ok(Some(index));
        }
    }
    Ok(None)
}

unsafe fn check_physical_device_extensions(
    instance: &Instance,
    physical_device: vk::PhysicalDevice,
) -> Result<()> {
    let extensions = instance
        .enumerate_device_extension_properties(physical_device, None)?
        .iter()
        .map(|e| e.extension_name)
        .collect::<HashSet<_>>();

    match DEVICE_EXTENSIONS.iter().find(|e| !extensions.contains(e)) {
        Some(missing) => Err(RenderError::MissingExtension {
            kind: "device",
            name: missing.to_string(),
        }
        .into()),
        None => Ok(()),
    }
}

unsafe fn check_physical_device_features(
    instance: &Instance,
    physical_device: vk::PhysicalDevice,
) -> Result<()> {
    let mut vulkan_13 = vk::PhysicalDeviceVulkan13Features::default();
    let mut extended_dynamic_state = vk::PhysicalDeviceExtendedDynamicStateFeaturesEXT::default();
    let mut features = vk::PhysicalDeviceFeatures2::builder()
        .push_next(&mut vulkan_13)
        .push_next(&mut extended_dynamic_state);
    instance.get_physical_device_features2(physical_device, &mut features);

    let anisotropy = features.features.sampler_anisotropy == vk::TRUE;
    if !anisotropy {
        return Err(anyhow!("Missing sampler anisotropy."));
    }
    if vulkan_13.dynamic_rendering != vk::TRUE || vulkan_13.synchronization2 != vk::TRUE {
        return Err(anyhow!("Missing dynamic rendering or synchronization2."));
    }
    if extended_dynamic_state.extended_dynamic_state != vk::TRUE {
        return Err(anyhow!("Missing extended dynamic state."));
    }

    Ok(())
}

unsafe fn create_logical_device(
    instance: &Instance,
    physical_device: vk::PhysicalDevice,
    queue_family: u32,
    config: &Config,
) -> Result<Device> {
    let queue_priorities = &[1.0];
    let queue_infos = &[vk::DeviceQueueCreateInfo::builder()
        .queue_family_index(queue_family)
        .queue_priorities(queue_priorities)];

    let layers = if config.validation {
        vec![VALIDATION_LAYER.as_ptr()]
    } else {
        vec![]
    };

    let extensions = DEVICE_EXTENSIONS
        .iter()
        .map(|n| n.as_ptr())
        .collect::<Vec<_>>();

    let mut vulkan_13_features = vk::PhysicalDeviceVulkan13Features::builder()
        .dynamic_rendering(true)
        .synchronization2(true);

    let mut extended_dynamic_state_features =
        vk::PhysicalDeviceExtendedDynamicStateFeaturesEXT::builder().extended_dynamic_state(true);

    let features = vk::PhysicalDeviceFeatures::builder().sampler_anisotropy(true);

    let info = vk::DeviceCreateInfo::builder()
        .queue_create_infos(queue_infos)
        .enabled_layer_names(&layers)
        .enabled_extension_names(&extensions)
        .enabled_features(&features)
        .push_next(&mut vulkan_13_features)
        .push_next(&mut extended_dynamic_state_features);

    Ok(instance.create_device(physical_device, &info, None)?)
}
