use std::mem::size_of;

use anyhow::Result;
use bytemuck::{Pod, Zeroable};
use glam::Mat4;
use vulkanalia::prelude::v1_3::*;
use vulkanalia::vk::KhrSwapchainExtension;
use winit::window::Window;

use crate::allocator::{as_bytes, Allocator, Buffer, Image};
use crate::camera::projection;
use crate::config::{Config, MAX_FRAMES_IN_FLIGHT};
use crate::context::AppContext;
use crate::device::DeviceContext;
use crate::error::RenderError;
use crate::frame::{AcquireOutcome, FenceStatus, FrameBackend, FrameOutcome, FrameSync, PresentOutcome};
use crate::overlay::{FrameTimeOverlay, Overlay};
use crate::pipeline::{get_depth_format, Pipeline, ShaderCode};
use crate::recorder::{depth_aspect, record_frame, Drawable, FrameTargets, SceneBindings};
use crate::scene::SceneData;
use crate::swapchain::Swapchain;

/// Radians per second the scene model turns around +Y.
const MODEL_SPIN: f32 = 0.25;

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
struct UniformBufferObject {
    model: [[f32; 4]; 4],
    view: [[f32; 4]; 4],
    proj: [[f32; 4]; 4],
}

impl UniformBufferObject {
    fn new(elapsed: f32, view: Mat4, extent: vk::Extent2D) -> Self {
        Self {
            model: Mat4::from_rotation_y(elapsed * MODEL_SPIN).to_cols_array_2d(),
            view: view.to_cols_array_2d(),
            proj: projection(extent.width, extent.height).to_cols_array_2d(),
        }
    }
}

/// Resources owned by one entry of the frames-in-flight ring.
struct FrameSlot {
    command_buffer: vk::CommandBuffer,
    in_flight: vk::Fence,
    uniforms: Buffer,
    /// Persistently mapped; only written after `in_flight` was waited on.
    mapped: *mut UniformBufferObject,
}

/// Uploaded scene. Read-only once the render loop starts.
struct GpuScene {
    vertex_buffer: Buffer,
    textures: Vec<Image>,
    texture_views: Vec<vk::ImageView>,
    sampler: vk::Sampler,
    descriptor_pool: vk::DescriptorPool,
    drawables: Vec<Drawable>,
}

#[derive(Debug, Default)]
struct DepthTarget {
    image: Image,
    view: vk::ImageView,
}

impl DepthTarget {
    /// Moves the handles out and leaves null ones behind.
    fn retire(&mut self) -> DepthTarget {
        std::mem::take(self)
    }

    /// Safe to call again after a failed rebuild; null handles are ignored
    /// by the driver.
    unsafe fn destroy(&mut self, device: &Device) {
        let retired = self.retire();
        device.destroy_image_view(retired.view, None);
        retired.image.destroy(device);
    }
}

/// Everything the frame protocol touches on the GPU side.
pub struct GpuState {
    context: DeviceContext,
    allocator: Allocator,
    swapchain: Swapchain,
    depth_format: vk::Format,
    depth: DepthTarget,
    pipeline: Pipeline,
    scene: GpuScene,
    command_pool: vk::CommandPool,
    slots: Vec<FrameSlot>,
    /// Indexed by the semaphore ring, sized by the swapchain image count.
    present_complete: Vec<vk::Semaphore>,
    /// Indexed by swapchain image.
    render_finished: Vec<vk::Semaphore>,
    overlay: Box<dyn Overlay>,
    framebuffer: vk::Extent2D,
    view: Mat4,
    elapsed: f32,
}

pub struct Renderer {
    frames: FrameSync,
    gpu: GpuState,
}

impl Renderer {
    pub unsafe fn create(
        window: &Window,
        config: &Config,
        scene: &SceneData,
        framebuffer: vk::Extent2D,
    ) -> Result<Self> {
        let context = DeviceContext::create(window, config)?;
        let allocator = Allocator::create(
            &context.instance,
            &context.device,
            context.physical_device,
            context.queue,
            context.queue_family,
        )?;

        let swapchain = Swapchain::create(&context, framebuffer)?;
        let depth_format = get_depth_format(&context.instance, context.physical_device)?;
        let depth = create_depth_target(&allocator, depth_format, swapchain.extent)?;

        let shaders = ShaderCode::load(&config.shader)?;
        let pipeline = Pipeline::create(&context.device, &shaders, swapchain.format, depth_format)?;

        let command_pool = create_command_pool(&context)?;
        let slots = create_frame_slots(&context.device, &allocator, command_pool)?;
        let (present_complete, render_finished) =
            create_semaphores(&context.device, swapchain.image_count())?;

        let scene = upload_scene(&context, &allocator, &pipeline, &slots, scene)?;

        let frames = FrameSync::new(MAX_FRAMES_IN_FLIGHT, swapchain.image_count());

        Ok(Self {
            frames,
            gpu: GpuState {
                context,
                allocator,
                swapchain,
                depth_format,
                depth,
                pipeline,
                scene,
                command_pool,
                slots,
                present_complete,
                render_finished,
                overlay: Box::new(FrameTimeOverlay::default()),
                framebuffer,
                view: Mat4::IDENTITY,
                elapsed: 0.0,
            },
        })
    }

    /// Renders one frame from the current application state.
    pub unsafe fn render(&mut self, app: &mut AppContext) -> Result<FrameOutcome> {
        if app.take_resized() {
            self.frames.notify_resized();
        }

        self.gpu.framebuffer = app.framebuffer_extent();
        self.gpu.view = app.camera.view();
        self.gpu.elapsed = app.elapsed();
        self.gpu.overlay.update(app);

        self.frames.draw_frame(&mut self.gpu)
    }

    /// Waits for the device to go idle, then releases everything in reverse
    /// order of creation.
    pub unsafe fn destroy(&mut self) {
        self.gpu.destroy();
    }
}

impl GpuState {
    unsafe fn destroy(&mut self) {
        let device = &self.context.device;
        if let Err(error) = device.device_wait_idle() {
            log::error!("Failed to wait for device idle during teardown: {}", error);
        }

        let scene = &mut self.scene;
        for drawable in scene.drawables.drain(..) {
            drawable.index_buffer.destroy(device);
        }
        device.destroy_descriptor_pool(scene.descriptor_pool, None);
        device.destroy_sampler(scene.sampler, None);
        for view in scene.texture_views.drain(..) {
            device.destroy_image_view(view, None);
        }
        for texture in scene.textures.drain(..) {
            texture.destroy(device);
        }
        scene.vertex_buffer.destroy(device);

        for slot in self.slots.drain(..) {
            device.unmap_memory(slot.uniforms.memory);
            slot.uniforms.destroy(device);
            device.destroy_fence(slot.in_flight, None);
        }
        destroy_semaphores(device, &mut self.present_complete, &mut self.render_finished);
        device.destroy_command_pool(self.command_pool, None);

        self.pipeline.destroy(device);

        self.depth.destroy(device);
        self.swapchain.destroy(device);

        self.allocator.destroy();
        self.context.destroy();
    }

    fn targets(&self, image_index: usize) -> FrameTargets {
        FrameTargets {
            color_image: self.swapchain.images[image_index],
            color_view: self.swapchain.image_views[image_index],
            depth_image: self.depth.image.handle,
            depth_view: self.depth.view,
            depth_format: self.depth_format,
            extent: self.swapchain.extent,
        }
    }
}

impl FrameBackend for GpuState {
    fn framebuffer_extent(&self) -> vk::Extent2D {
        self.framebuffer
    }

    unsafe fn wait_for_fence(&mut self, slot: usize, timeout: u64) -> Result<FenceStatus> {
        let fence = self.slots[slot].in_flight;
        match self.context.device.wait_for_fences(&[fence], true, timeout)? {
            vk::SuccessCode::TIMEOUT => Ok(FenceStatus::TimedOut),
            _ => Ok(FenceStatus::Signaled),
        }
    }

    unsafe fn acquire_image(&mut self, semaphore: usize) -> Result<AcquireOutcome> {
        let result = self.context.device.acquire_next_image_khr(
            self.swapchain.handle,
            u64::MAX,
            self.present_complete[semaphore],
            vk::Fence::null(),
        );

        match result {
            Ok((image_index, code)) => Ok(AcquireOutcome::Acquired {
                image_index: image_index as usize,
                suboptimal: code == vk::SuccessCode::SUBOPTIMAL_KHR,
            }),
            Err(vk::ErrorCode::OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
            Err(error) => Err(RenderError::Acquire(error).into()),
        }
    }

    unsafe fn update_uniforms(&mut self, slot: usize) -> Result<()> {
        let ubo = UniformBufferObject::new(self.elapsed, self.view, self.swapchain.extent);
        std::ptr::copy_nonoverlapping(&ubo, self.slots[slot].mapped, 1);
        Ok(())
    }

    unsafe fn reset_fence(&mut self, slot: usize) -> Result<()> {
        self.context
            .device
            .reset_fences(&[self.slots[slot].in_flight])?;
        Ok(())
    }

    unsafe fn record(&mut self, slot: usize, image_index: usize) -> Result<()> {
        let targets = self.targets(image_index);
        let bindings = SceneBindings {
            pipeline: &self.pipeline,
            vertex_buffer: self.scene.vertex_buffer.handle,
            drawables: &self.scene.drawables,
        };

        record_frame(
            &self.context.device,
            self.slots[slot].command_buffer,
            slot,
            &targets,
            &bindings,
            self.overlay.as_mut(),
        )
    }

    unsafe fn submit(&mut self, slot: usize, semaphore: usize, image_index: usize) -> Result<()> {
        let frame = &self.slots[slot];

        let wait_semaphore_info = vk::SemaphoreSubmitInfo::builder()
            .semaphore(self.present_complete[semaphore])
            .stage_mask(vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT);

        let command_buffer_info =
            vk::CommandBufferSubmitInfo::builder().command_buffer(frame.command_buffer);

        let signal_semaphore_info = vk::SemaphoreSubmitInfo::builder()
            .semaphore(self.render_finished[image_index])
            .stage_mask(vk::PipelineStageFlags2::ALL_GRAPHICS);

        let submit_info = vk::SubmitInfo2::builder()
            .wait_semaphore_infos(std::slice::from_ref(&wait_semaphore_info))
            .command_buffer_infos(std::slice::from_ref(&command_buffer_info))
            .signal_semaphore_infos(std::slice::from_ref(&signal_semaphore_info));

        self.context
            .device
            .queue_submit2(self.context.queue, &[submit_info], frame.in_flight)
            .map_err(RenderError::Submit)?;

        Ok(())
    }

    unsafe fn present(&mut self, image_index: usize) -> Result<PresentOutcome> {
        let swapchains = &[self.swapchain.handle];
        let image_indices = &[image_index as u32];
        let wait_semaphores = &[self.render_finished[image_index]];
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(wait_semaphores)
            .swapchains(swapchains)
            .image_indices(image_indices);

        match self
            .context
            .device
            .queue_present_khr(self.context.queue, &present_info)
        {
            Ok(vk::SuccessCode::SUBOPTIMAL_KHR) => Ok(PresentOutcome::Stale),
            Ok(_) => Ok(PresentOutcome::Presented),
            Err(vk::ErrorCode::OUT_OF_DATE_KHR) => Ok(PresentOutcome::Stale),
            Err(error) => Err(RenderError::Present(error).into()),
        }
    }

    unsafe fn rebuild(&mut self) -> Result<Option<usize>> {
        let device = &self.context.device;
        device.device_wait_idle()?;

        if !self.swapchain.recreate(&self.context, self.framebuffer)? {
            return Ok(None);
        }

        // Released handles are nulled first so a failure below leaves
        // nothing for `destroy` to free twice.
        self.depth.destroy(device);
        destroy_semaphores(device, &mut self.present_complete, &mut self.render_finished);

        self.depth = create_depth_target(&self.allocator, self.depth_format, self.swapchain.extent)?;
        let (present_complete, render_finished) =
            create_semaphores(device, self.swapchain.image_count())?;
        self.present_complete = present_complete;
        self.render_finished = render_finished;

        Ok(Some(self.swapchain.image_count()))
    }
}

unsafe fn create_depth_target(
    allocator: &Allocator,
    format: vk::Format,
    extent: vk::Extent2D,
) -> Result<DepthTarget> {
    let image = allocator.create_image(
        extent,
        1,
        format,
        vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
    )?;
    let view = allocator.create_image_view(&image, vk::ImageAspectFlags::DEPTH)?;
    log::debug!(
        "Depth target {:?} {}x{} (aspect {:?})",
        format,
        extent.width,
        extent.height,
        depth_aspect(format)
    );
    Ok(DepthTarget { image, view })
}

unsafe fn create_command_pool(context: &DeviceContext) -> Result<vk::CommandPool> {
    let info = vk::CommandPoolCreateInfo::builder()
        .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
        .queue_family_index(context.queue_family);

    Ok(context.device.create_command_pool(&info, None)?)
}

unsafe fn create_frame_slots(
    device: &Device,
    allocator: &Allocator,
    command_pool: vk::CommandPool,
) -> Result<Vec<FrameSlot>> {
    let allocate_info = vk::CommandBufferAllocateInfo::builder()
        .command_pool(command_pool)
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_buffer_count(MAX_FRAMES_IN_FLIGHT as u32);
    let command_buffers = device.allocate_command_buffers(&allocate_info)?;

    // Signaled so the first wait on each slot returns at once.
    let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);
    let size = size_of::<UniformBufferObject>() as vk::DeviceSize;

    let mut slots = Vec::with_capacity(MAX_FRAMES_IN_FLIGHT);
    for command_buffer in command_buffers {
        let uniforms = allocator.create_buffer(
            size,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        let mapped = device
            .map_memory(uniforms.memory, 0, size, vk::MemoryMapFlags::empty())?
            .cast();
        slots.push(FrameSlot {
            command_buffer,
            in_flight: device.create_fence(&fence_info, None)?,
            uniforms,
            mapped,
        });
    }

    Ok(slots)
}

unsafe fn create_semaphores(
    device: &Device,
    image_count: usize,
) -> Result<(Vec<vk::Semaphore>, Vec<vk::Semaphore>)> {
    let info = vk::SemaphoreCreateInfo::builder();
    let mut present_complete = Vec::with_capacity(image_count);
    let mut render_finished = Vec::with_capacity(image_count);
    for _ in 0..image_count {
        present_complete.push(device.create_semaphore(&info, None)?);
        render_finished.push(device.create_semaphore(&info, None)?);
    }
    Ok((present_complete, render_finished))
}

unsafe fn destroy_semaphores(
    device: &Device,
    present_complete: &mut Vec<vk::Semaphore>,
    render_finished: &mut Vec<vk::Semaphore>,
) {
    for semaphore in present_complete.drain(..).chain(render_finished.drain(..)) {
        device.destroy_semaphore(semaphore, None);
    }
}

/// Pool sizes for one descriptor set per drawable per frame slot.
fn descriptor_pool_sizes(drawables: usize, frames: usize) -> (u32, [vk::DescriptorPoolSize; 2]) {
    let sets = (drawables * frames).max(1) as u32;
    (
        sets,
        [
            vk::DescriptorPoolSize {
                type_: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: sets,
            },
            vk::DescriptorPoolSize {
                type_: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                descriptor_count: sets,
            },
        ],
    )
}

unsafe fn upload_scene(
    context: &DeviceContext,
    allocator: &Allocator,
    pipeline: &Pipeline,
    slots: &[FrameSlot],
    scene: &SceneData,
) -> Result<GpuScene> {
    scene.validate()?;
    let device = &context.device;

    let vertex_buffer =
        allocator.upload_buffer(as_bytes(&scene.vertices), vk::BufferUsageFlags::VERTEX_BUFFER)?;

    let mut textures = Vec::with_capacity(scene.textures.len());
    let mut texture_views = Vec::with_capacity(scene.textures.len());
    for texture in &scene.textures {
        let image = allocator.upload_image(
            &texture.pixels,
            vk::Extent2D {
                width: texture.width,
                height: texture.height,
            },
            texture.mip_levels,
            vk::Format::R8G8B8A8_SRGB,
        )?;
        texture_views.push(allocator.create_image_view(&image, vk::ImageAspectFlags::COLOR)?);
        textures.push(image);
    }

    let max_lod = scene.textures.iter().map(|t| t.mip_levels).max().unwrap_or(1);
    let sampler = create_sampler(context, max_lod as f32)?;

    let meshes = scene
        .meshes
        .iter()
        .filter(|m| !m.indices.is_empty())
        .collect::<Vec<_>>();
    if meshes.len() < scene.meshes.len() {
        log::warn!("Skipping {} drawables without indices", scene.meshes.len() - meshes.len());
    }

    let (max_sets, pool_sizes) = descriptor_pool_sizes(meshes.len(), slots.len());
    let pool_info = vk::DescriptorPoolCreateInfo::builder()
        .pool_sizes(&pool_sizes)
        .max_sets(max_sets);
    let descriptor_pool = device.create_descriptor_pool(&pool_info, None)?;

    let mut drawables = Vec::with_capacity(meshes.len());
    for (drawable, mesh) in meshes.into_iter().enumerate() {
        let view = *texture_views
            .get(mesh.texture)
            .ok_or(RenderError::MissingTexture {
                drawable,
                texture: mesh.texture,
                available: texture_views.len(),
            })?;

        let index_buffer =
            allocator.upload_buffer(as_bytes(&mesh.indices), vk::BufferUsageFlags::INDEX_BUFFER)?;

        let layouts = vec![pipeline.descriptor_set_layout; slots.len()];
        let allocate_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(descriptor_pool)
            .set_layouts(&layouts);
        let descriptor_sets = device.allocate_descriptor_sets(&allocate_info)?;

        for (set, slot) in descriptor_sets.iter().zip(slots) {
            let buffer_info = vk::DescriptorBufferInfo::builder()
                .buffer(slot.uniforms.handle)
                .offset(0)
                .range(slot.uniforms.size);

            let image_info = vk::DescriptorImageInfo::builder()
                .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                .image_view(view)
                .sampler(sampler);

            let ubo_write = vk::WriteDescriptorSet::builder()
                .dst_set(*set)
                .dst_binding(0)
                .dst_array_element(0)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .buffer_info(std::slice::from_ref(&buffer_info));

            let sampler_write = vk::WriteDescriptorSet::builder()
                .dst_set(*set)
                .dst_binding(1)
                .dst_array_element(0)
                .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .image_info(std::slice::from_ref(&image_info));

            device.update_descriptor_sets(
                &[ubo_write, sampler_write],
                &[] as &[vk::CopyDescriptorSet],
            );
        }

        drawables.push(Drawable {
            index_buffer,
            index_count: mesh.indices.len() as u32,
            texture: mesh.texture,
            descriptor_sets,
        });
    }

    for (i, drawable) in drawables.iter().enumerate() {
        log::debug!(
            "Drawable {}: {} indices, texture {}",
            i,
            drawable.index_count,
            drawable.texture
        );
    }
    log::info!(
        "Scene uploaded: {} vertices, {} drawables, {} textures",
        scene.vertices.len(),
        drawables.len(),
        textures.len()
    );

    Ok(GpuScene {
        vertex_buffer,
        textures,
        texture_views,
        sampler,
        descriptor_pool,
        drawables,
    })
}

unsafe fn create_sampler(context: &DeviceContext, max_lod: f32) -> Result<vk::Sampler> {
    let info = vk::SamplerCreateInfo::builder()
        .mag_filter(vk::Filter::LINEAR)
        .min_filter(vk::Filter::LINEAR)
        .address_mode_u(vk::SamplerAddressMode::REPEAT)
        .address_mode_v(vk::SamplerAddressMode::REPEAT)
        .address_mode_w(vk::SamplerAddressMode::REPEAT)
        .anisotropy_enable(true)
        .max_anisotropy(context.limits().max_sampler_anisotropy)
        .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
        .unnormalized_coordinates(false)
        .compare_enable(false)
        .compare_op(vk::CompareOp::ALWAYS)
        .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
        .mip_lod_bias(0.0)
        .min_lod(0.0)
        .max_lod(max_lod);

    Ok(context.device.create_sampler(&info, None)?)
}

#[cfg(test)]
mod tests {
    use glam::Vec3;
    use vulkanalia::vk::Handle;

    use super::*;

    #[test]
    fn uniform_block_is_three_packed_matrices() {
        assert_eq!(size_of::<UniformBufferObject>(), 3 * 64);
    }

    #[test]
    fn model_turns_around_y_over_time() {
        let extent = vk::Extent2D {
            width: 800,
            height: 600,
        };
        let still = UniformBufferObject::new(0.0, Mat4::IDENTITY, extent);
        assert_eq!(still.model, Mat4::IDENTITY.to_cols_array_2d());

        let quarter = std::f32::consts::FRAC_PI_2 / MODEL_SPIN;
        let turned = UniformBufferObject::new(quarter, Mat4::IDENTITY, extent);
        let x = Mat4::from_cols_array_2d(&turned.model).transform_vector3(Vec3::X);
        assert!((x - Vec3::NEG_Z).length() < 1e-5);
        assert_eq!(turned.model[1][1], 1.0);
    }

    #[test]
    fn retired_depth_target_leaves_only_null_handles() {
        let mut depth = DepthTarget {
            image: Image {
                handle: vk::Image::from_raw(7),
                memory: vk::DeviceMemory::from_raw(8),
                ..Default::default()
            },
            view: vk::ImageView::from_raw(9),
        };

        let retired = depth.retire();
        assert_eq!(retired.view, vk::ImageView::from_raw(9));
        assert_eq!(retired.image.handle, vk::Image::from_raw(7));

        assert!(depth.view.is_null());
        assert!(depth.image.handle.is_null());
        assert!(depth.image.memory.is_null());

        let again = depth.retire();
        assert!(again.view.is_null() && again.image.handle.is_null());
    }

    #[test]
    fn descriptor_pool_covers_every_drawable_and_frame() {
        let (sets, sizes) = descriptor_pool_sizes(5, MAX_FRAMES_IN_FLIGHT);
        assert_eq!(sets, 10);
        assert!(sizes.iter().all(|s| s.descriptor_count == 10));

        let (sets, _) = descriptor_pool_sizes(0, MAX_FRAMES_IN_FLIGHT);
        assert_eq!(sets, 1);
    }
}
