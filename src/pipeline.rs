use std::fs;
use std::mem::size_of_val;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use vulkanalia::prelude::v1_3::*;

use crate::error::RenderError;
use crate::scene::Vertex;

/// SPIR-V for the scene's vertex and fragment stages.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ShaderCode {
    /// One module holding both stages as `vertMain` and `fragMain`.
    Combined(Vec<u32>),
    /// Separate modules, each with a `main` entry point.
    Split { vertex: Vec<u32>, fragment: Vec<u32> },
}

impl ShaderCode {
    /// A `.spv` path is read as a precompiled blob. Anything else names the
    /// stem of a `.vert`/`.frag` GLSL pair, compiled here.
    pub fn load(path: &Path) -> Result<Self> {
        if path.extension().is_some_and(|e| e == "spv") {
            let bytes =
                fs::read(path).with_context(|| format!("Failed to read `{}`", path.display()))?;
            return Ok(Self::Combined(spirv_words(&bytes)?));
        }

        let compiler = shaderc::Compiler::new().context("Failed to create shader compiler")?;
        let compile = |extension: &str, kind: shaderc::ShaderKind| -> Result<Vec<u32>> {
            let path = with_extension(path, extension);
            let source = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read `{}`", path.display()))?;
            let artifact = compiler
                .compile_into_spirv(&source, kind, &path.to_string_lossy(), "main", None)
                .map_err(|e| anyhow!("Failed to compile `{}`: {}", path.display(), e))?;
            if artifact.get_num_warnings() > 0 {
                log::warn!("{}", artifact.get_warning_messages());
            }
            Ok(artifact.as_binary().to_vec())
        };

        Ok(Self::Split {
            vertex: compile("vert", shaderc::ShaderKind::Vertex)?,
            fragment: compile("frag", shaderc::ShaderKind::Fragment)?,
        })
    }
}

/// `shaders/scene` + `vert` -> `shaders/scene.vert`, keeping any dots in the stem.
fn with_extension(stem: &Path, extension: &str) -> PathBuf {
    let mut path = stem.as_os_str().to_owned();
    path.push(".");
    path.push(extension);
    PathBuf::from(path)
}

/// Reinterprets a little-endian bytecode blob as SPIR-V words.
pub fn spirv_words(bytes: &[u8]) -> Result<Vec<u32>, RenderError> {
    if bytes.is_empty() || bytes.len() % 4 != 0 {
        return Err(RenderError::InvalidShader(format!(
            "{} bytes is not a whole number of words",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
        .collect())
}

unsafe fn create_shader_module(device: &Device, code: &[u32]) -> Result<vk::ShaderModule> {
    let info = vk::ShaderModuleCreateInfo::builder()
        .code_size(size_of_val(code))
        .code(code);

    Ok(device.create_shader_module(&info, None)?)
}

/// First candidate whose optimal-tiling features cover `features`.
pub fn pick_format<F>(
    candidates: &[vk::Format],
    features: vk::FormatFeatureFlags,
    mut properties: F,
) -> Result<vk::Format, RenderError>
where
    F: FnMut(vk::Format) -> vk::FormatProperties,
{
    candidates
        .iter()
        .cloned()
        .find(|f| properties(*f).optimal_tiling_features.contains(features))
        .ok_or_else(|| {
            RenderError::UnsupportedFormat(format!(
                "none of {:?} support {:?}",
                candidates, features
            ))
        })
}

pub unsafe fn get_depth_format(
    instance: &Instance,
    physical_device: vk::PhysicalDevice,
) -> Result<vk::Format> {
    let candidates = &[
        vk::Format::D32_SFLOAT,
        vk::Format::D32_SFLOAT_S8_UINT,
        vk::Format::D24_UNORM_S8_UINT,
    ];

    Ok(pick_format(
        candidates,
        vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
        |f| instance.get_physical_device_format_properties(physical_device, f),
    )?)
}

/// The scene pipeline and the layouts its descriptor sets are allocated from.
pub struct Pipeline {
    pub descriptor_set_layout: vk::DescriptorSetLayout,
    pub layout: vk::PipelineLayout,
    pub handle: vk::Pipeline,
}

impl Pipeline {
    pub unsafe fn create(
        device: &Device,
        shaders: &ShaderCode,
        color_format: vk::Format,
        depth_format: vk::Format,
    ) -> Result<Self> {
        let descriptor_set_layout = create_descriptor_set_layout(device)?;

        let set_layouts = &[descriptor_set_layout];
        let layout_info = vk::PipelineLayoutCreateInfo::builder().set_layouts(set_layouts);
        let layout = device.create_pipeline_layout(&layout_info, None)?;

        let (modules, entry_points): (Vec<vk::ShaderModule>, [&[u8]; 2]) = match shaders {
            ShaderCode::Combined(code) => (
                vec![create_shader_module(device, code)?],
                [&b"vertMain\0"[..], &b"fragMain\0"[..]],
            ),
            ShaderCode::Split { vertex, fragment } => (
                vec![
                    create_shader_module(device, vertex)?,
                    create_shader_module(device, fragment)?,
                ],
                [&b"main\0"[..], &b"main\0"[..]],
            ),
        };

        let vert_stage = vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(modules[0])
            .name(entry_points[0]);

        let frag_stage = vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::FRAGMENT)
            .module(modules[modules.len() - 1])
            .name(entry_points[1]);

        let binding_descriptions = &[Vertex::binding_description()];
        let attribute_descriptions = &Vertex::attribute_descriptions();
        let vertex_input_state = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(binding_descriptions)
            .vertex_attribute_descriptions(attribute_descriptions);

        let input_assembly_state = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
            .primitive_restart_enable(false);

        // Viewport and scissor are dynamic.
        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1);

        let rasterization_state = vk::PipelineRasterizationStateCreateInfo::builder()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(vk::PolygonMode::FILL)
            .line_width(1.0)
            .cull_mode(vk::CullModeFlags::BACK)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .depth_bias_enable(false);

        let multisample_state = vk::PipelineMultisampleStateCreateInfo::builder()
            .sample_shading_enable(false)
            .rasterization_samples(vk::SampleCountFlags::_1);

        let depth_stencil_state = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(true)
            .depth_write_enable(true)
            .depth_compare_op(vk::CompareOp::LESS)
            .depth_bounds_test_enable(false)
            .stencil_test_enable(false);

        let attachment = vk::PipelineColorBlendAttachmentState::builder()
            .color_write_mask(vk::ColorComponentFlags::all())
            .blend_enable(false);

        let attachments = &[attachment];
        let color_blend_state = vk::PipelineColorBlendStateCreateInfo::builder()
            .logic_op_enable(false)
            .logic_op(vk::LogicOp::COPY)
            .attachments(attachments)
            .blend_constants([0.0, 0.0, 0.0, 0.0]);

        let dynamic_states = &[vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(dynamic_states);

        let stages = &[vert_stage, frag_stage];
        let color_attachment_formats = &[color_format];
        let mut rendering_info = vk::PipelineRenderingCreateInfo::builder()
            .color_attachment_formats(color_attachment_formats)
            .depth_attachment_format(depth_format);

        let info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(stages)
            .vertex_input_state(&vertex_input_state)
            .input_assembly_state(&input_assembly_state)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization_state)
            .multisample_state(&multisample_state)
            .depth_stencil_state(&depth_stencil_state)
            .color_blend_state(&color_blend_state)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .push_next(&mut rendering_info);

        let result = device.create_graphics_pipelines(vk::PipelineCache::null(), &[info], None);

        for module in modules {
            device.destroy_shader_module(module, None);
        }

        let handle = result?.0[0];
        log::debug!("Scene pipeline created for {:?} + {:?}", color_format, depth_format);

        Ok(Self {
            descriptor_set_layout,
            layout,
            handle,
        })
    }

    pub unsafe fn destroy(&self, device: &Device) {
        device.destroy_pipeline(self.handle, None);
        device.destroy_pipeline_layout(self.layout, None);
        device.destroy_descriptor_set_layout(self.descriptor_set_layout, None);
    }
}

/// Binding 0: per-frame uniforms for the vertex stage. Binding 1: the
/// drawable's texture.
unsafe fn create_descriptor_set_layout(device: &Device) -> Result<vk::DescriptorSetLayout> {
    let bindings = &[
        vk::DescriptorSetLayoutBinding::builder()
            .binding(0)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::VERTEX)
            .build(),
        vk::DescriptorSetLayoutBinding::builder()
            .binding(1)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::FRAGMENT)
            .build(),
    ];

    let info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(bindings);
    Ok(device.create_descriptor_set_layout(&info, None)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spirv_blob_must_be_whole_words() {
        assert!(matches!(
            spirv_words(&[0x03, 0x02, 0x23, 0x07, 0x00]),
            Err(RenderError::InvalidShader(_))
        ));
        assert!(spirv_words(&[]).is_err());
        assert_eq!(
            spirv_words(&[0x03, 0x02, 0x23, 0x07]).unwrap(),
            vec![0x0723_0203]
        );
    }

    #[test]
    fn glsl_pair_paths_keep_the_stem() {
        assert_eq!(
            with_extension(Path::new("shaders/scene"), "vert"),
            PathBuf::from("shaders/scene.vert")
        );
        assert_eq!(
            with_extension(Path::new("shaders/scene.v2"), "frag"),
            PathBuf::from("shaders/scene.v2.frag")
        );
    }

    #[test]
    fn missing_blob_names_the_file() {
        let error = ShaderCode::load(Path::new("does/not/exist.spv")).unwrap_err();
        assert!(error.to_string().contains("does/not/exist.spv"));
    }

    #[test]
    fn depth_format_prefers_earliest_supported_candidate() {
        let supported = |format: vk::Format| vk::FormatProperties {
            optimal_tiling_features: if format == vk::Format::D32_SFLOAT {
                vk::FormatFeatureFlags::SAMPLED_IMAGE
            } else {
                vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT
            },
            ..Default::default()
        };
        let candidates = [
            vk::Format::D32_SFLOAT,
            vk::Format::D32_SFLOAT_S8_UINT,
            vk::Format::D24_UNORM_S8_UINT,
        ];
        assert_eq!(
            pick_format(&candidates, vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT, supported)
                .unwrap(),
            vk::Format::D32_SFLOAT_S8_UINT
        );

        let nothing = |_| vk::FormatProperties::default();
        assert!(matches!(
            pick_format(&candidates, vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT, nothing),
            Err(RenderError::UnsupportedFormat(_))
        ));
    }
}
