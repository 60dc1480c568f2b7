use std::mem::size_of_val;

use anyhow::Result;
use vulkanalia::prelude::v1_3::*;

use crate::error::RenderError;

/// Linear scan for the first memory type allowed by `type_bits` whose flags
/// include every bit of `properties`.
pub fn find_memory_type(
    memory: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    properties: vk::MemoryPropertyFlags,
) -> Result<u32, RenderError> {
    (0..memory.memory_type_count)
        .find(|i| {
            let suitable = (type_bits & (1 << i)) != 0;
            let memory_type = memory.memory_types[*i as usize];
            suitable && memory_type.property_flags.contains(properties)
        })
        .ok_or(RenderError::NoSuitableMemoryType {
            type_bits,
            properties,
        })
}

/// Access and stage masks for the two image layout transitions uploads need.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LayoutTransition {
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_access_mask: vk::AccessFlags,
    pub dst_access_mask: vk::AccessFlags,
    pub src_stage_mask: vk::PipelineStageFlags,
    pub dst_stage_mask: vk::PipelineStageFlags,
}

impl LayoutTransition {
    pub fn between(
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    ) -> Result<Self, RenderError> {
        let (src_access_mask, dst_access_mask, src_stage_mask, dst_stage_mask) =
            match (old_layout, new_layout) {
                (vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL) => (
                    vk::AccessFlags::empty(),
                    vk::AccessFlags::TRANSFER_WRITE,
                    vk::PipelineStageFlags::TOP_OF_PIPE,
                    vk::PipelineStageFlags::TRANSFER,
                ),
                (
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                ) => (
                    vk::AccessFlags::TRANSFER_WRITE,
                    vk::AccessFlags::SHADER_READ,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::FRAGMENT_SHADER,
                ),
                _ => {
                    return Err(RenderError::UnsupportedLayoutTransition {
                        old: old_layout,
                        new: new_layout,
                    })
                }
            };

        Ok(Self {
            old_layout,
            new_layout,
            src_access_mask,
            dst_access_mask,
            src_stage_mask,
            dst_stage_mask,
        })
    }
}

/// A buffer and the single allocation backing it.
#[derive(Clone, Copy, Debug, Default)]
pub struct Buffer {
    pub handle: vk::Buffer,
    pub memory: vk::DeviceMemory,
    pub size: vk::DeviceSize,
}

impl Buffer {
    pub unsafe fn destroy(&self, device: &Device) {
        device.destroy_buffer(self.handle, None);
        device.free_memory(self.memory, None);
    }
}

/// An image and the single allocation backing it. Views are owned by
/// whoever created them and must be destroyed before the image.
#[derive(Clone, Copy, Debug, Default)]
pub struct Image {
    pub handle: vk::Image,
    pub memory: vk::DeviceMemory,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub mip_levels: u32,
}

impl Image {
    pub unsafe fn destroy(&self, device: &Device) {
        device.destroy_image(self.handle, None);
        device.free_memory(self.memory, None);
    }
}

/// Creates buffers and images with dedicated allocations and performs staged
/// uploads through one-time command buffers on the shared queue.
pub struct Allocator {
    device: Device,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    queue: vk::Queue,
    command_pool: vk::CommandPool,
}

impl Allocator {
    pub unsafe fn create(
        instance: &Instance,
        device: &Device,
        physical_device: vk::PhysicalDevice,
        queue: vk::Queue,
        queue_family: u32,
    ) -> Result<Self> {
        let memory_properties = instance.get_physical_device_memory_properties(physical_device);

        let info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::TRANSIENT)
            .queue_family_index(queue_family);
        let command_pool = device.create_command_pool(&info, None)?;

        Ok(Self {
            device: device.clone(),
            memory_properties,
            queue,
            command_pool,
        })
    }

    pub unsafe fn destroy(&mut self) {
        self.device.destroy_command_pool(self.command_pool, None);
    }

    pub fn memory_type(
        &self,
        type_bits: u32,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<u32, RenderError> {
        find_memory_type(&self.memory_properties, type_bits, properties)
    }

    pub unsafe fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<Buffer> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let handle = self.device.create_buffer(&buffer_info, None)?;

        let requirements = self.device.get_buffer_memory_requirements(handle);
        let memory_type = match self.memory_type(requirements.memory_type_bits, properties) {
            Ok(memory_type) => memory_type,
            Err(error) => {
                self.device.destroy_buffer(handle, None);
                return Err(error.into());
            }
        };

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type);

        let memory = self.device.allocate_memory(&alloc_info, None)?;
        self.device.bind_buffer_memory(handle, memory, 0)?;

        Ok(Buffer {
            handle,
            memory,
            size,
        })
    }

    pub unsafe fn create_image(
        &self,
        extent: vk::Extent2D,
        mip_levels: u32,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<Image> {
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::_2D)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(mip_levels)
            .array_layers(1)
            .format(format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .samples(vk::SampleCountFlags::_1);

        let handle = self.device.create_image(&image_info, None)?;

        let requirements = self.device.get_image_memory_requirements(handle);
        let memory_type = match self.memory_type(requirements.memory_type_bits, properties) {
            Ok(memory_type) => memory_type,
            Err(error) => {
                self.device.destroy_image(handle, None);
                return Err(error.into());
            }
        };

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type);

        let memory = self.device.allocate_memory(&alloc_info, None)?;
        self.device.bind_image_memory(handle, memory, 0)?;

        Ok(Image {
            handle,
            memory,
            format,
            extent,
            mip_levels,
        })
    }

    pub unsafe fn create_image_view(
        &self,
        image: &Image,
        aspect_mask: vk::ImageAspectFlags,
    ) -> Result<vk::ImageView> {
        create_image_view(&self.device, image.handle, image.format, aspect_mask, image.mip_levels)
    }

    /// Host-visible, coherent buffer filled with `bytes`. The caller owns it.
    unsafe fn create_staging_buffer(&self, bytes: &[u8]) -> Result<Buffer> {
        let size = bytes.len() as vk::DeviceSize;
        let staging = self.create_buffer(
            size,
            vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;

        let memory = self
            .device
            .map_memory(staging.memory, 0, size, vk::MemoryMapFlags::empty())?;
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), memory.cast(), bytes.len());
        self.device.unmap_memory(staging.memory);

        Ok(staging)
    }

    /// Device-local buffer holding `bytes`. `usage` gets TRANSFER_DST added.
    pub unsafe fn upload_buffer(&self, bytes: &[u8], usage: vk::BufferUsageFlags) -> Result<Buffer> {
        let size = bytes.len() as vk::DeviceSize;
        let staging = self.create_staging_buffer(bytes)?;

        let result = self
            .create_buffer(
                size,
                usage | vk::BufferUsageFlags::TRANSFER_DST,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
            )
            .and_then(|buffer| {
                match self.copy_buffer(staging.handle, buffer.handle, size) {
                    Ok(()) => Ok(buffer),
                    Err(error) => {
                        buffer.destroy(&self.device);
                        Err(error)
                    }
                }
            });

        staging.destroy(&self.device);
        result
    }

    /// Device-local, sampled image holding tightly packed `pixels`, left in
    /// SHADER_READ_ONLY_OPTIMAL.
    pub unsafe fn upload_image(
        &self,
        pixels: &[u8],
        extent: vk::Extent2D,
        mip_levels: u32,
        format: vk::Format,
    ) -> Result<Image> {
        // Both barriers are validated before anything is recorded.
        let to_transfer =
            LayoutTransition::between(vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL)?;
        let to_sampled = LayoutTransition::between(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )?;

        let staging = self.create_staging_buffer(pixels)?;

        let result = self
            .create_image(
                extent,
                mip_levels,
                format,
                vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
            )
            .and_then(|image| {
                let copied = self.submit_one_time(|command_buffer| {
                    self.cmd_transition(command_buffer, &image, to_transfer);
                    self.cmd_copy_buffer_to_image(command_buffer, staging.handle, &image);
                    self.cmd_transition(command_buffer, &image, to_sampled);
                });
                match copied {
                    Ok(()) => Ok(image),
                    Err(error) => {
                        image.destroy(&self.device);
                        Err(error)
                    }
                }
            });

        staging.destroy(&self.device);
        result
    }

    pub unsafe fn copy_buffer(
        &self,
        src_buffer: vk::Buffer,
        dst_buffer: vk::Buffer,
        size: vk::DeviceSize,
    ) -> Result<()> {
        self.submit_one_time(|command_buffer| {
            let regions = vk::BufferCopy::builder()
                .src_offset(0)
                .dst_offset(0)
                .size(size);
            self.device
                .cmd_copy_buffer(command_buffer, src_buffer, dst_buffer, &[regions]);
        })
    }

    /// Copies a device-local buffer back through a staging buffer.
    #[cfg(test)]
    pub unsafe fn read_buffer(&self, buffer: &Buffer) -> Result<Vec<u8>> {
        let mut bytes = vec![0u8; buffer.size as usize];
        let staging = self.create_staging_buffer(&bytes)?;

        let result = self
            .copy_buffer(buffer.handle, staging.handle, buffer.size)
            .and_then(|()| {
                let memory = self.device.map_memory(
                    staging.memory,
                    0,
                    buffer.size,
                    vk::MemoryMapFlags::empty(),
                )?;
                std::ptr::copy_nonoverlapping(memory.cast(), bytes.as_mut_ptr(), bytes.len());
                self.device.unmap_memory(staging.memory);
                Ok(())
            });

        staging.destroy(&self.device);
        result.map(|()| bytes)
    }

    /// Records `record` into a fresh primary command buffer, submits it and
    /// blocks until the queue drains.
    unsafe fn submit_one_time<F>(&self, record: F) -> Result<()>
    where
        F: FnOnce(vk::CommandBuffer),
    {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_pool(self.command_pool)
            .command_buffer_count(1);

        let command_buffer = self.device.allocate_command_buffers(&alloc_info)?[0];

        let result = (|| -> Result<()> {
            let info = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            self.device.begin_command_buffer(command_buffer, &info)?;

            record(command_buffer);

            self.device.end_command_buffer(command_buffer)?;

            let command_buffers = &[command_buffer];
            let info = vk::SubmitInfo::builder().command_buffers(command_buffers);

            self.device
                .queue_submit(self.queue, &[info], vk::Fence::null())?;
            self.device.queue_wait_idle(self.queue)?;
            Ok(())
        })();

        self.device
            .free_command_buffers(self.command_pool, &[command_buffer]);

        result
    }

    unsafe fn cmd_transition(
        &self,
        command_buffer: vk::CommandBuffer,
        image: &Image,
        transition: LayoutTransition,
    ) {
        let barrier = vk::ImageMemoryBarrier::builder()
            .old_layout(transition.old_layout)
            .new_layout(transition.new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image.handle)
            .subresource_range(subresource_range(
                vk::ImageAspectFlags::COLOR,
                image.mip_levels,
            ))
            .src_access_mask(transition.src_access_mask)
            .dst_access_mask(transition.dst_access_mask);

        self.device.cmd_pipeline_barrier(
            command_buffer,
            transition.src_stage_mask,
            transition.dst_stage_mask,
            vk::DependencyFlags::empty(),
            &[] as &[vk::MemoryBarrier],
            &[] as &[vk::BufferMemoryBarrier],
            &[barrier],
        );
    }

    unsafe fn cmd_copy_buffer_to_image(
        &self,
        command_buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        image: &Image,
    ) {
        let region = vk::BufferImageCopy::builder()
            .buffer_offset(0)
            .buffer_row_length(0)
            .buffer_image_height(0)
            .image_subresource(
                vk::ImageSubresourceLayers::builder()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .mip_level(0)
                    .base_array_layer(0)
                    .layer_count(1)
                    .build(),
            )
            .image_offset(vk::Offset3D { x: 0, y: 0, z: 0 })
            .image_extent(vk::Extent3D {
                width: image.extent.width,
                height: image.extent.height,
                depth: 1,
            });

        self.device.cmd_copy_buffer_to_image(
            command_buffer,
            buffer,
            image.handle,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &[region],
        );
    }
}

pub fn subresource_range(
    aspect_mask: vk::ImageAspectFlags,
    level_count: u32,
) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange::builder()
        .aspect_mask(aspect_mask)
        .base_mip_level(0)
        .level_count(level_count)
        .base_array_layer(0)
        .layer_count(1)
        .build()
}

pub unsafe fn create_image_view(
    device: &Device,
    image: vk::Image,
    format: vk::Format,
    aspect_mask: vk::ImageAspectFlags,
    mip_levels: u32,
) -> Result<vk::ImageView> {
    let info = vk::ImageViewCreateInfo::builder()
        .image(image)
        .view_type(vk::ImageViewType::_2D)
        .format(format)
        .subresource_range(subresource_range(aspect_mask, mip_levels));

    Ok(device.create_image_view(&info, None)?)
}

/// Byte view of a `Pod` slice, for uploads.
pub fn as_bytes<T: bytemuck::Pod>(values: &[T]) -> &[u8] {
    let bytes: &[u8] = bytemuck::cast_slice(values);
    debug_assert_eq!(bytes.len(), size_of_val(values));
    bytes
}
