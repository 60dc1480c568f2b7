use anyhow::Result;
use vulkanalia::prelude::v1_3::*;

use crate::allocator::{subresource_range, Buffer};
use crate::overlay::Overlay;
use crate::pipeline::Pipeline;

const CLEAR_COLOR: [f32; 4] = [0.1, 0.12, 0.16, 1.0];

/// A scene object as the GPU sees it. The index buffer holds absolute indices
/// into the shared vertex buffer; `texture` indexes the shared texture table.
pub struct Drawable {
    pub index_buffer: Buffer,
    pub index_count: u32,
    pub texture: usize,
    /// One per frame slot, each pointing at that slot's uniform buffer.
    pub descriptor_sets: Vec<vk::DescriptorSet>,
}

/// One step of a frame's command buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    /// Swapchain image: undefined -> color attachment.
    ColorToAttachment,
    /// Depth image: undefined -> depth attachment. The old contents are
    /// discarded and cleared by the pass.
    DepthToAttachment,
    BeginRendering,
    SetViewport,
    SetScissor,
    BindPipeline,
    BindVertexBuffer,
    BindIndexBuffer(usize),
    BindDescriptorSet(usize),
    DrawIndexed { drawable: usize, index_count: u32 },
    Overlay,
    EndRendering,
    /// Swapchain image: color attachment -> present source.
    ColorToPresent,
}

/// The command sequence for one frame. Barriers precede the pass, the overlay
/// is the last thing inside it, and the present transition ends the buffer.
/// Drawables without indices are skipped.
pub fn plan_frame<I>(index_counts: I) -> Vec<Command>
where
    I: IntoIterator<Item = u32>,
{
    let mut commands = vec![
        Command::ColorToAttachment,
        Command::DepthToAttachment,
        Command::BeginRendering,
        Command::SetViewport,
        Command::SetScissor,
        Command::BindPipeline,
        Command::BindVertexBuffer,
    ];

    for (drawable, index_count) in index_counts.into_iter().enumerate() {
        if index_count == 0 {
            continue;
        }
        commands.push(Command::BindIndexBuffer(drawable));
        commands.push(Command::BindDescriptorSet(drawable));
        commands.push(Command::DrawIndexed {
            drawable,
            index_count,
        });
    }

    commands.push(Command::Overlay);
    commands.push(Command::EndRendering);
    commands.push(Command::ColorToPresent);
    commands
}

/// Attachments rendered by one frame.
#[derive(Clone, Copy, Debug)]
pub struct FrameTargets {
    pub color_image: vk::Image,
    pub color_view: vk::ImageView,
    pub depth_image: vk::Image,
    pub depth_view: vk::ImageView,
    pub depth_format: vk::Format,
    pub extent: vk::Extent2D,
}

/// Read-only scene state shared by every frame.
pub struct SceneBindings<'a> {
    pub pipeline: &'a Pipeline,
    pub vertex_buffer: vk::Buffer,
    pub drawables: &'a [Drawable],
}

pub fn depth_aspect(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D32_SFLOAT_S8_UINT | vk::Format::D24_UNORM_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        _ => vk::ImageAspectFlags::DEPTH,
    }
}

/// Resets and records `command_buffer` for frame slot `frame`.
pub unsafe fn record_frame(
    device: &Device,
    command_buffer: vk::CommandBuffer,
    frame: usize,
    targets: &FrameTargets,
    scene: &SceneBindings,
    overlay: &mut dyn Overlay,
) -> Result<()> {
    device.reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())?;

    let info =
        vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
    device.begin_command_buffer(command_buffer, &info)?;

    let render_area = vk::Rect2D {
        offset: vk::Offset2D::default(),
        extent: targets.extent,
    };

    for command in plan_frame(scene.drawables.iter().map(|d| d.index_count)) {
        match command {
            Command::ColorToAttachment => {
                let barrier = vk::ImageMemoryBarrier2::builder()
                    .src_stage_mask(vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT)
                    .src_access_mask(vk::AccessFlags2::empty())
                    .dst_stage_mask(vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT)
                    .dst_access_mask(vk::AccessFlags2::COLOR_ATTACHMENT_WRITE)
                    .old_layout(vk::ImageLayout::UNDEFINED)
                    .new_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                    .image(targets.color_image)
                    .subresource_range(subresource_range(vk::ImageAspectFlags::COLOR, 1));
                pipeline_barrier(device, command_buffer, &barrier);
            }
            Command::DepthToAttachment => {
                let stages = vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS
                    | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS;
                let barrier = vk::ImageMemoryBarrier2::builder()
                    .src_stage_mask(stages)
                    .src_access_mask(vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE)
                    .dst_stage_mask(stages)
                    .dst_access_mask(
                        vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ
                            | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
                    )
                    .old_layout(vk::ImageLayout::UNDEFINED)
                    .new_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                    .image(targets.depth_image)
                    .subresource_range(subresource_range(depth_aspect(targets.depth_format), 1));
                pipeline_barrier(device, command_buffer, &barrier);
            }
            Command::BeginRendering => {
                let color_attachment = vk::RenderingAttachmentInfo::builder()
                    .image_view(targets.color_view)
                    .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                    .load_op(vk::AttachmentLoadOp::CLEAR)
                    .store_op(vk::AttachmentStoreOp::STORE)
                    .clear_value(vk::ClearValue {
                        color: vk::ClearColorValue {
                            float32: CLEAR_COLOR,
                        },
                    });

                let depth_attachment = vk::RenderingAttachmentInfo::builder()
                    .image_view(targets.depth_view)
                    .image_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                    .load_op(vk::AttachmentLoadOp::CLEAR)
                    .store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .clear_value(vk::ClearValue {
                        depth_stencil: vk::ClearDepthStencilValue {
                            depth: 1.0,
                            stencil: 0,
                        },
                    });

                let color_attachments = &[color_attachment];
                let rendering_info = vk::RenderingInfo::builder()
                    .render_area(render_area)
                    .layer_count(1)
                    .color_attachments(color_attachments)
                    .depth_attachment(&depth_attachment);

                device.cmd_begin_rendering(command_buffer, &rendering_info);
            }
            Command::SetViewport => {
                let viewport = vk::Viewport::builder()
                    .x(0.0)
                    .y(0.0)
                    .width(targets.extent.width as f32)
                    .height(targets.extent.height as f32)
                    .min_depth(0.0)
                    .max_depth(1.0);
                device.cmd_set_viewport(command_buffer, 0, &[viewport]);
            }
            Command::SetScissor => {
                device.cmd_set_scissor(command_buffer, 0, &[render_area]);
            }
            Command::BindPipeline => {
                device.cmd_bind_pipeline(
                    command_buffer,
                    vk::PipelineBindPoint::GRAPHICS,
                    scene.pipeline.handle,
                );
            }
            Command::BindVertexBuffer => {
                device.cmd_bind_vertex_buffers(command_buffer, 0, &[scene.vertex_buffer], &[0]);
            }
            Command::BindIndexBuffer(drawable) => {
                device.cmd_bind_index_buffer(
                    command_buffer,
                    scene.drawables[drawable].index_buffer.handle,
                    0,
                    vk::IndexType::UINT32,
                );
            }
            Command::BindDescriptorSet(drawable) => {
                device.cmd_bind_descriptor_sets(
                    command_buffer,
                    vk::PipelineBindPoint::GRAPHICS,
                    scene.pipeline.layout,
                    0,
                    &[scene.drawables[drawable].descriptor_sets[frame]],
                    &[],
                );
            }
            Command::DrawIndexed { index_count, .. } => {
                device.cmd_draw_indexed(command_buffer, index_count, 1, 0, 0, 0);
            }
            Command::Overlay => {
                overlay.record(device, command_buffer, frame, targets.extent)?;
            }
            Command::EndRendering => {
                device.cmd_end_rendering(command_buffer);
            }
            Command::ColorToPresent => {
                let barrier = vk::ImageMemoryBarrier2::builder()
                    .src_stage_mask(vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT)
                    .src_access_mask(vk::AccessFlags2::COLOR_ATTACHMENT_WRITE)
                    .dst_stage_mask(vk::PipelineStageFlags2::BOTTOM_OF_PIPE)
                    .dst_access_mask(vk::AccessFlags2::empty())
                    .old_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                    .new_layout(vk::ImageLayout::PRESENT_SRC_KHR)
                    .image(targets.color_image)
                    .subresource_range(subresource_range(vk::ImageAspectFlags::COLOR, 1));
                pipeline_barrier(device, command_buffer, &barrier);
            }
        }
    }

    device.end_command_buffer(command_buffer)?;

    Ok(())
}

unsafe fn pipeline_barrier(
    device: &Device,
    command_buffer: vk::CommandBuffer,
    barrier: &vk::ImageMemoryBarrier2,
) {
    let dependency_info =
        vk::DependencyInfo::builder().image_memory_barriers(std::slice::from_ref(barrier));
    device.cmd_pipeline_barrier2(command_buffer, &dependency_info);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(plan: &[Command], command: Command) -> usize {
        plan.iter().position(|c| *c == command).unwrap()
    }

    #[test]
    fn barriers_precede_the_pass() {
        let plan = plan_frame([36, 6]);
        let begin = position(&plan, Command::BeginRendering);
        assert!(position(&plan, Command::ColorToAttachment) < begin);
        assert!(position(&plan, Command::DepthToAttachment) < begin);
    }

    #[test]
    fn overlay_is_last_inside_the_pass_and_present_is_last_overall() {
        let plan = plan_frame([36, 6, 3]);
        let overlay = position(&plan, Command::Overlay);
        let end = position(&plan, Command::EndRendering);

        assert_eq!(overlay + 1, end);
        assert!(plan[..overlay]
            .iter()
            .all(|c| !matches!(c, Command::EndRendering)));
        assert_eq!(plan.last(), Some(&Command::ColorToPresent));
        assert_eq!(
            plan.iter().filter(|c| **c == Command::ColorToPresent).count(),
            1
        );
    }

    #[test]
    fn each_drawable_binds_then_draws_in_order() {
        let plan = plan_frame([36, 0, 6]);
        let draws = plan
            .iter()
            .filter_map(|c| match c {
                Command::DrawIndexed {
                    drawable,
                    index_count,
                } => Some((*drawable, *index_count)),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(draws, vec![(0, 36), (2, 6)]);

        let draw = position(
            &plan,
            Command::DrawIndexed {
                drawable: 2,
                index_count: 6,
            },
        );
        assert_eq!(plan[draw - 2], Command::BindIndexBuffer(2));
        assert_eq!(plan[draw - 1], Command::BindDescriptorSet(2));
        assert!(position(&plan, Command::BindPipeline) < draw);
        assert!(position(&plan, Command::BindVertexBuffer) < draw);
    }

    #[test]
    fn empty_scene_still_clears_and_presents() {
        assert_eq!(
            plan_frame([]),
            vec![
                Command::ColorToAttachment,
                Command::DepthToAttachment,
                Command::BeginRendering,
                Command::SetViewport,
                Command::SetScissor,
                Command::BindPipeline,
                Command::BindVertexBuffer,
                Command::Overlay,
                Command::EndRendering,
                Command::ColorToPresent,
            ]
        );
    }

    #[test]
    fn plan_is_deterministic() {
        assert_eq!(plan_frame([12, 24]), plan_frame([12, 24]));
    }

    #[test]
    fn stencil_formats_include_the_stencil_aspect() {
        assert_eq!(
            depth_aspect(vk::Format::D32_SFLOAT),
            vk::ImageAspectFlags::DEPTH
        );
        assert!(depth_aspect(vk::Format::D24_UNORM_S8_UINT).contains(vk::ImageAspectFlags::STENCIL));
    }
}
