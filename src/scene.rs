use std::mem::size_of;
use std::path::Path;

use anyhow::{Context, Result};
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};
use vulkanalia::prelude::v1_3::*;

use crate::error::RenderError;

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub pos: [f32; 3],
    pub tex_coord: [f32; 2],
}

impl Vertex {
    pub const fn new(pos: [f32; 3], tex_coord: [f32; 2]) -> Self {
        Self { pos, tex_coord }
    }

    pub fn binding_description() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription::builder()
            .binding(0)
            .stride(size_of::<Vertex>() as u32)
            .input_rate(vk::VertexInputRate::VERTEX)
            .build()
    }

    pub fn attribute_descriptions() -> [vk::VertexInputAttributeDescription; 2] {
        [
            vk::VertexInputAttributeDescription::builder()
                .binding(0)
                .location(0)
                .format(vk::Format::R32G32B32_SFLOAT)
                .offset(0)
                .build(),
            vk::VertexInputAttributeDescription::builder()
                .binding(0)
                .location(1)
                .format(vk::Format::R32G32_SFLOAT)
                .offset(size_of::<[f32; 3]>() as u32)
                .build(),
        ]
    }
}

/// One drawable: indices into the shared vertex pool plus a texture index.
#[derive(Clone, Debug, PartialEq)]
pub struct MeshData {
    /// Absolute indices into `SceneData::vertices`.
    pub indices: Vec<u32>,
    pub texture: usize,
}

/// Decoded RGBA8 pixels ready for upload.
#[derive(Clone, Debug, PartialEq)]
pub struct TextureData {
    pub width: u32,
    pub height: u32,
    pub mip_levels: u32,
    pub pixels: Vec<u8>,
}

impl TextureData {
    pub fn rgba8(image: image::RgbaImage) -> Self {
        Self {
            width: image.width(),
            height: image.height(),
            mip_levels: 1,
            pixels: image.into_raw(),
        }
    }

    pub fn solid(color: [u8; 4]) -> Self {
        Self::rgba8(image::RgbaImage::from_pixel(1, 1, image::Rgba(color)))
    }

    pub fn checkerboard(size: u32, cell: u32, a: [u8; 4], b: [u8; 4]) -> Self {
        Self::rgba8(image::RgbaImage::from_fn(size, size, |x, y| {
            if (x / cell + y / cell) % 2 == 0 {
                image::Rgba(a)
            } else {
                image::Rgba(b)
            }
        }))
    }
}

/// What the asset side hands the renderer once at startup.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SceneData {
    pub vertices: Vec<Vertex>,
    pub meshes: Vec<MeshData>,
    pub textures: Vec<TextureData>,
}

impl SceneData {
    /// Appends a primitive to the pool, rebasing its indices onto the shared
    /// vertex buffer.
    pub fn push_mesh(&mut self, vertices: &[Vertex], indices: &[u32], texture: usize) {
        let base = self.vertices.len() as u32;
        self.vertices.extend_from_slice(vertices);
        self.meshes.push(MeshData {
            indices: indices.iter().map(|i| base + i).collect(),
            texture,
        });
    }

    /// The vertex pool must be non-empty, every texture reference must
    /// resolve and every index must land in the pool. A violation here is a
    /// load-time failure.
    pub fn validate(&self) -> Result<(), RenderError> {
        if self.vertices.is_empty() {
            return Err(RenderError::UnsupportedFormat(
                "scene has no triangle geometry".into(),
            ));
        }
        for (drawable, mesh) in self.meshes.iter().enumerate() {
            if mesh.texture >= self.textures.len() {
                return Err(RenderError::MissingTexture {
                    drawable,
                    texture: mesh.texture,
                    available: self.textures.len(),
                });
            }
            if let Some(index) = mesh
                .indices
                .iter()
                .find(|i| **i as usize >= self.vertices.len())
            {
                return Err(RenderError::UnsupportedFormat(format!(
                    "drawable {} indexes vertex {} of {}",
                    drawable,
                    index,
                    self.vertices.len()
                )));
            }
        }
        Ok(())
    }

    /// Textured cube resting on a checkered floor.
    pub fn builtin() -> Self {
        let mut scene = Self::default();
        scene.textures.push(TextureData::checkerboard(
            256,
            32,
            [235, 120, 40, 255],
            [250, 220, 180, 255],
        ));
        scene.textures.push(TextureData::checkerboard(
            512,
            64,
            [60, 60, 70, 255],
            [150, 150, 160, 255],
        ));

        // (normal, up) per face; corners are generated around the normal
        let faces = [
            (Vec3::X, Vec3::Y),
            (Vec3::NEG_X, Vec3::Y),
            (Vec3::Y, Vec3::NEG_Z),
            (Vec3::NEG_Y, Vec3::Z),
            (Vec3::Z, Vec3::Y),
            (Vec3::NEG_Z, Vec3::Y),
        ];
        let mut vertices = Vec::new();
        let mut indices = Vec::new();
        for (normal, up) in faces {
            let right = up.cross(normal);
            let base = vertices.len() as u32;
            for (u, v) in [(0.0, 1.0), (1.0, 1.0), (1.0, 0.0), (0.0, 0.0)] {
                let pos = normal * 0.5 + right * (u - 0.5) + up * (0.5 - v) + Vec3::Y * 0.5;
                vertices.push(Vertex::new(pos.to_array(), [u, v]));
            }
            indices.extend_from_slice(&[base, base + 1, base + 2, base + 2, base + 3, base]);
        }
        scene.push_mesh(&vertices, &indices, 0);

        let floor = [
            Vertex::new([-5.0, 0.0, 5.0], [0.0, 5.0]),
            Vertex::new([5.0, 0.0, 5.0], [5.0, 5.0]),
            Vertex::new([5.0, 0.0, -5.0], [5.0, 0.0]),
            Vertex::new([-5.0, 0.0, -5.0], [0.0, 0.0]),
        ];
        scene.push_mesh(&floor, &[0, 1, 2, 2, 3, 0], 1);

        scene
    }
}

/// Flattens the default scene of a glTF file into a `SceneData`.
pub fn load_gltf(path: &Path) -> Result<SceneData> {
    let (document, buffers, images) =
        gltf::import(path).with_context(|| format!("Failed to import `{}`", path.display()))?;

    let mut scene = SceneData::default();
    for image in &images {
        scene.textures.push(convert_image(image)?);
    }

    let root = document
        .default_scene()
        .or_else(|| document.scenes().next())
        .ok_or_else(|| RenderError::UnsupportedFormat("glTF file has no scenes".into()))?;

    let mut fallback_texture = None;
    for node in root.nodes() {
        load_node(&node, Mat4::IDENTITY, &buffers, &mut scene, &mut fallback_texture)?;
    }

    log::info!(
        "Loaded `{}`: {} vertices, {} drawables, {} textures",
        path.display(),
        scene.vertices.len(),
        scene.meshes.len(),
        scene.textures.len()
    );

    scene.validate()?;
    Ok(scene)
}

fn load_node(
    node: &gltf::Node,
    parent: Mat4,
    buffers: &[gltf::buffer::Data],
    scene: &mut SceneData,
    fallback_texture: &mut Option<usize>,
) -> Result<()> {
    let transform = parent * Mat4::from_cols_array_2d(&node.transform().matrix());

    if let Some(mesh) = node.mesh() {
        for primitive in mesh.primitives() {
            if primitive.mode() != gltf::mesh::Mode::Triangles {
                log::warn!("Skipping non-triangle primitive in mesh {:?}", mesh.name());
                continue;
            }

            let reader = primitive.reader(|buffer| Some(&buffers[buffer.index()]));
            let Some(positions) = reader.read_positions() else {
                log::warn!("Skipping primitive without positions in mesh {:?}", mesh.name());
                continue;
            };

            let positions = positions.collect::<Vec<_>>();
            let tex_coords = reader
                .read_tex_coords(0)
                .map(|t| t.into_f32().collect::<Vec<_>>())
                .unwrap_or_else(|| vec![[0.0, 0.0]; positions.len()]);

            let vertices = positions
                .iter()
                .zip(tex_coords.iter().chain(std::iter::repeat(&[0.0, 0.0])))
                .map(|(pos, uv)| {
                    let pos = transform.transform_point3(Vec3::from_array(*pos));
                    Vertex::new(pos.to_array(), *uv)
                })
                .collect::<Vec<_>>();

            let indices = match reader.read_indices() {
                Some(indices) => indices.into_u32().collect::<Vec<_>>(),
                None => (0..vertices.len() as u32).collect(),
            };

            let texture = match primitive
                .material()
                .pbr_metallic_roughness()
                .base_color_texture()
            {
                Some(info) => info.texture().source().index(),
                None => *fallback_texture.get_or_insert_with(|| {
                    scene.textures.push(TextureData::solid([255, 255, 255, 255]));
                    scene.textures.len() - 1
                }),
            };

            scene.push_mesh(&vertices, &indices, texture);
        }
    }

    for child in node.children() {
        load_node(&child, transform, buffers, scene, fallback_texture)?;
    }

    Ok(())
}

fn convert_image(image: &gltf::image::Data) -> Result<TextureData> {
    use gltf::image::Format;

    let (width, height) = (image.width, image.height);
    let pixels = image.pixels.clone();
    let rgba = match image.format {
        Format::R8G8B8A8 => image::RgbaImage::from_raw(width, height, pixels),
        Format::R8G8B8 => image::RgbImage::from_raw(width, height, pixels)
            .map(|i| image::DynamicImage::ImageRgb8(i).to_rgba8()),
        Format::R8G8 => image::GrayAlphaImage::from_raw(width, height, pixels)
            .map(|i| image::DynamicImage::ImageLumaA8(i).to_rgba8()),
        Format::R8 => image::GrayImage::from_raw(width, height, pixels)
            .map(|i| image::DynamicImage::ImageLuma8(i).to_rgba8()),
        other => {
            return Err(RenderError::UnsupportedFormat(format!("texture format {:?}", other)).into());
        }
    };

    rgba.map(TextureData::rgba8).ok_or_else(|| {
        RenderError::UnsupportedFormat(format!(
            "texture data does not match its {}x{} size",
            width, height
        ))
        .into()
    })
}
