use std::collections::VecDeque;

use anyhow::Result;
use vulkanalia::prelude::v1_3::*;

use crate::context::AppContext;

/// Draw commands layered over the scene. Called inside the active rendering
/// pass after all scene geometry, with the frame's command buffer.
pub trait Overlay {
    /// Sees the application state once per frame, before recording.
    fn update(&mut self, _context: &AppContext) {}

    unsafe fn record(
        &mut self,
        device: &Device,
        command_buffer: vk::CommandBuffer,
        frame: usize,
        extent: vk::Extent2D,
    ) -> Result<()>;
}

const SAMPLES: usize = 120;
const BAR_WIDTH: u32 = 2;
const GRAPH_HEIGHT: u32 = 64;
const MARGIN: u32 = 8;
const PADDING: u32 = 4;
/// Frame time that fills the whole graph height.
const GRAPH_CEILING_MS: f32 = 50.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Shade {
    Panel,
    Fast,
    Slow,
    Stall,
}

impl Shade {
    fn for_frame_time(ms: f32) -> Self {
        if ms <= 1000.0 / 60.0 + 0.5 {
            Shade::Fast
        } else if ms <= 1000.0 / 30.0 + 0.5 {
            Shade::Slow
        } else {
            Shade::Stall
        }
    }

    fn color(self) -> [f32; 4] {
        match self {
            Shade::Panel => [0.05, 0.05, 0.08, 1.0],
            Shade::Fast => [0.2, 0.8, 0.3, 1.0],
            Shade::Slow => [0.9, 0.75, 0.1, 1.0],
            Shade::Stall => [0.9, 0.2, 0.15, 1.0],
        }
    }
}

/// Bar graph of recent frame times in the lower left corner, toggled with F1.
#[derive(Clone, Debug)]
pub struct FrameTimeOverlay {
    samples: VecDeque<f32>,
    visible: bool,
}

impl Default for FrameTimeOverlay {
    fn default() -> Self {
        Self {
            samples: VecDeque::with_capacity(SAMPLES),
            visible: true,
        }
    }
}

impl FrameTimeOverlay {
    pub fn push_sample(&mut self, ms: f32) {
        if self.samples.len() == SAMPLES {
            self.samples.pop_front();
        }
        self.samples.push_back(ms);
    }

    /// Clear rectangles for the current samples, oldest bar on the left.
    /// Empty when the graph does not fit.
    pub fn rects(&self, extent: vk::Extent2D) -> Vec<(Shade, vk::Rect2D)> {
        let panel_width = SAMPLES as u32 * BAR_WIDTH + 2 * PADDING;
        let panel_height = GRAPH_HEIGHT + 2 * PADDING;
        if !self.visible
            || extent.width < panel_width + 2 * MARGIN
            || extent.height < panel_height + 2 * MARGIN
        {
            return Vec::new();
        }

        let panel_x = MARGIN;
        let panel_y = extent.height - MARGIN - panel_height;
        let baseline = panel_y + PADDING + GRAPH_HEIGHT;

        let mut rects = vec![(Shade::Panel, rect(panel_x, panel_y, panel_width, panel_height))];
        for (i, ms) in self.samples.iter().enumerate() {
            let fraction = (ms / GRAPH_CEILING_MS).clamp(0.0, 1.0);
            let height = ((fraction * GRAPH_HEIGHT as f32).round() as u32).max(1);
            let x = panel_x + PADDING + i as u32 * BAR_WIDTH;
            rects.push((
                Shade::for_frame_time(*ms),
                rect(x, baseline - height, BAR_WIDTH, height),
            ));
        }
        rects
    }
}

fn rect(x: u32, y: u32, width: u32, height: u32) -> vk::Rect2D {
    vk::Rect2D {
        offset: vk::Offset2D {
            x: x as i32,
            y: y as i32,
        },
        extent: vk::Extent2D { width, height },
    }
}

impl Overlay for FrameTimeOverlay {
    fn update(&mut self, context: &AppContext) {
        self.visible = context.overlay_visible;
        if let Some(ms) = context.last_frame_ms() {
            self.push_sample(ms);
        }
    }

    unsafe fn record(
        &mut self,
        device: &Device,
        command_buffer: vk::CommandBuffer,
        _frame: usize,
        extent: vk::Extent2D,
    ) -> Result<()> {
        let mut rects = self.rects(extent);
        if rects.is_empty() {
            return Ok(());
        }

        // One clear per shade, panel first so the bars land on top.
        rects.sort_by_key(|(shade, _)| *shade);
        for chunk in rects.chunk_by(|a, b| a.0 == b.0) {
            let attachment = vk::ClearAttachment::builder()
                .aspect_mask(vk::ImageAspectFlags::COLOR)
                .color_attachment(0)
                .clear_value(vk::ClearValue {
                    color: vk::ClearColorValue {
                        float32: chunk[0].0.color(),
                    },
                });
            let clear_rects = chunk
                .iter()
                .map(|(_, r)| {
                    vk::ClearRect::builder()
                        .rect(*r)
                        .base_array_layer(0)
                        .layer_count(1)
                        .build()
                })
                .collect::<Vec<_>>();
            device.cmd_clear_attachments(command_buffer, &[attachment], &clear_rects);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extent(width: u32, height: u32) -> vk::Extent2D {
        vk::Extent2D { width, height }
    }

    fn contains(outer: vk::Rect2D, inner: vk::Rect2D) -> bool {
        inner.offset.x >= outer.offset.x
            && inner.offset.y >= outer.offset.y
            && inner.offset.x as u32 + inner.extent.width
                <= outer.offset.x as u32 + outer.extent.width
            && inner.offset.y as u32 + inner.extent.height
                <= outer.offset.y as u32 + outer.extent.height
    }

    #[test]
    fn bars_stay_inside_panel_and_framebuffer() {
        let mut overlay = FrameTimeOverlay::default();
        for ms in [1.0, 16.0, 25.0, 40.0, 500.0] {
            overlay.push_sample(ms);
        }

        let screen = rect(0, 0, 800, 600);
        let rects = overlay.rects(screen.extent);
        assert_eq!(rects.len(), 6);
        assert_eq!(rects[0].0, Shade::Panel);
        for (_, r) in &rects[1..] {
            assert!(contains(rects[0].1, *r));
            assert!(contains(screen, *r));
        }
        assert_eq!(rects[1].0, Shade::Fast);
        assert_eq!(rects[3].0, Shade::Slow);
        assert_eq!(rects[5].0, Shade::Stall);
        assert_eq!(rects[5].1.extent.height, GRAPH_HEIGHT);
    }

    #[test]
    fn keeps_only_the_latest_samples() {
        let mut overlay = FrameTimeOverlay::default();
        for i in 0..SAMPLES + 10 {
            overlay.push_sample(i as f32);
        }
        assert_eq!(overlay.samples.len(), SAMPLES);
        assert_eq!(overlay.samples.front(), Some(&10.0));
    }

    #[test]
    fn hidden_or_cramped_overlay_draws_nothing() {
        let mut overlay = FrameTimeOverlay::default();
        overlay.push_sample(10.0);
        assert!(overlay.rects(extent(100, 50)).is_empty());

        overlay.visible = false;
        assert!(overlay.rects(extent(800, 600)).is_empty());
    }
}
