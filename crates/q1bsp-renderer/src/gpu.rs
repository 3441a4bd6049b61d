// gpu.rs — graphics backend seam: textures, buffers and draw submission

use bytemuck::{Pod, Zeroable};

use q1bsp_common::model_texture::SrcFormat;

use crate::light::EntityPose;
use crate::settings::LightmapFormat;

pub type TextureId = u32;
pub type BufferId = u32;

/// Interleaved world vertex: position, diffuse coords, lightmap coords.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct BrushVertex {
    pub xyz: [f32; 3],
    pub st: [f32; 2],
    pub lm: [f32; 2],
}

/// What the backend can do, queried once per map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Programmable pipeline available; the shader path is used when set.
    pub glsl: bool,
    /// Two texture units for diffuse x lightmap in one pass.
    pub multitexture: bool,
    /// Can sample shared-exponent lightmaps.
    pub hdr_lightmaps: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            glsl: true,
            multitexture: true,
            hdr_lightmaps: true,
        }
    }
}

/// Which pipeline a batch goes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawPass {
    /// Shader path: diffuse, lightmap and optional fullbright in one pass.
    Shaded,
    /// Fixed-function diffuse modulated by the lightmap.
    Multitexture,
    /// Diffuse only; lightmaps follow in a separate blended pass.
    TextureOnly,
    LightmapOnly,
    Fullbright,
    /// Flat-shaded debug view, `color` is per-surface.
    Flat { color: [u8; 3] },
    /// Turbulent liquid.
    Water,
    /// Scrolling sky; `fullbright` carries the cloud layer.
    Sky,
    /// Depth-only sky so later passes are clipped against it.
    SkyDepth,
    /// Wireframe overlay.
    Tris,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexSource {
    /// Indices assembled this frame.
    Client(Vec<u32>),
    /// Range of a prebuilt index buffer.
    Cached { buffer: BufferId, offset: usize, count: usize },
}

impl IndexSource {
    pub fn count(&self) -> usize {
        match self {
            IndexSource::Client(v) => v.len(),
            IndexSource::Cached { count, .. } => *count,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DrawCall {
    pub pass: DrawPass,
    pub texture: Option<TextureId>,
    pub fullbright: Option<TextureId>,
    pub lightmap: Option<TextureId>,
    pub indices: IndexSource,
    pub alpha: f32,
    pub alpha_test: bool,
    pub overbright: bool,
    /// Model transform; identity for the world.
    pub pose: EntityPose,
}

impl DrawCall {
    pub fn new(pass: DrawPass, indices: IndexSource) -> Self {
        Self {
            pass,
            texture: None,
            fullbright: None,
            lightmap: None,
            indices,
            alpha: 1.0,
            alpha_test: false,
            overbright: false,
            pose: EntityPose::default(),
        }
    }
}

// ============================================================
// Backend trait (implemented by the host's GL or Vulkan layer)
// ============================================================

pub trait GpuBackend {
    fn capabilities(&self) -> Capabilities;

    /// Creates a lightmap page texture filled with `data`.
    fn create_lightmap(&mut self, name: &str, width: usize, height: usize, format: LightmapFormat, data: &[u8]) -> TextureId;

    /// Replaces `rows` full rows starting at `first_row`.
    fn update_lightmap(&mut self, texture: TextureId, first_row: usize, rows: usize, format: LightmapFormat, data: &[u8]);

    /// Creates a diffuse or glow texture. `format` is `Rgba` for anything
    /// converted on the CPU; block-compressed data is passed through as is.
    fn create_texture(&mut self, name: &str, width: u32, height: u32, format: SrcFormat, data: &[u8]) -> TextureId;

    /// Uploads the map's static vertex buffer. Byte layout is `BrushVertex`.
    fn upload_vertices(&mut self, bytes: &[u8]) -> BufferId;

    fn upload_indices(&mut self, indices: &[u32]) -> BufferId;

    fn delete_buffer(&mut self, _buffer: BufferId) {}

    fn draw(&mut self, call: DrawCall);
}

/// Sends `vertices` to the backend as raw bytes.
pub fn upload_brush_vertices<B: GpuBackend + ?Sized>(gpu: &mut B, vertices: &[BrushVertex]) -> BufferId {
    gpu.upload_vertices(bytemuck::cast_slice(vertices))
}

// ============================================================
// Recording backend
// ============================================================

#[derive(Debug, Clone, PartialEq)]
pub enum Recorded {
    CreateLightmap { texture: TextureId, name: String, format: LightmapFormat },
    UpdateLightmap { texture: TextureId, first_row: usize, rows: usize, bytes: usize },
    CreateTexture { texture: TextureId, name: String, format: SrcFormat },
    Vertices { buffer: BufferId, bytes: usize },
    Indices { buffer: BufferId, count: usize },
    DeleteBuffer(BufferId),
    Draw(DrawCall),
}

/// Backend that keeps a log of everything asked of it. Used by tools that
/// replay a frame offline and by the tests.
#[derive(Debug, Default)]
pub struct RecordingBackend {
    pub caps: Capabilities,
    pub events: Vec<Recorded>,
    next_id: u32,
}

impl RecordingBackend {
    pub fn with_capabilities(caps: Capabilities) -> Self {
        Self {
            caps,
            ..Default::default()
        }
    }

    fn alloc(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    pub fn draws(&self) -> impl Iterator<Item = &DrawCall> {
        self.events.iter().filter_map(|e| match e {
            Recorded::Draw(call) => Some(call),
            _ => None,
        })
    }

    pub fn lightmaps_created(&self) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e, Recorded::CreateLightmap { .. }))
            .count()
    }

    pub fn textures_named(&self, name: &str) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e, Recorded::CreateTexture { name: n, .. } if n == name))
            .count()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}

impl GpuBackend for RecordingBackend {
    fn capabilities(&self) -> Capabilities {
        self.caps
    }

    fn create_lightmap(&mut self, name: &str, _width: usize, _height: usize, format: LightmapFormat, _data: &[u8]) -> TextureId {
        let texture = self.alloc();
        self.events.push(Recorded::CreateLightmap {
            texture,
            name: name.to_string(),
            format,
        });
        texture
    }

    fn update_lightmap(&mut self, texture: TextureId, first_row: usize, rows: usize, _format: LightmapFormat, data: &[u8]) {
        self.events.push(Recorded::UpdateLightmap {
            texture,
            first_row,
            rows,
            bytes: data.len(),
        });
    }

    fn create_texture(&mut self, name: &str, _width: u32, _height: u32, format: SrcFormat, _data: &[u8]) -> TextureId {
        let texture = self.alloc();
        self.events.push(Recorded::CreateTexture {
            texture,
            name: name.to_string(),
            format,
        });
        texture
    }

    fn upload_vertices(&mut self, bytes: &[u8]) -> BufferId {
        let buffer = self.alloc();
        self.events.push(Recorded::Vertices {
            buffer,
            bytes: bytes.len(),
        });
        buffer
    }

    fn upload_indices(&mut self, indices: &[u32]) -> BufferId {
        let buffer = self.alloc();
        self.events.push(Recorded::Indices {
            buffer,
            count: indices.len(),
        });
        buffer
    }

    fn delete_buffer(&mut self, buffer: BufferId) {
        self.events.push(Recorded::DeleteBuffer(buffer));
    }

    fn draw(&mut self, call: DrawCall) {
        self.events.push(Recorded::Draw(call));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vertex_layout() {
        assert_eq!(std::mem::size_of::<BrushVertex>(), 7 * 4);
        let mut gpu = RecordingBackend::default();
        let v = BrushVertex {
            xyz: [1.0, 2.0, 3.0],
            st: [0.5, 0.5],
            lm: [0.0, 1.0],
        };
        let id = upload_brush_vertices(&mut gpu, &[v, v]);
        assert_eq!(gpu.events, vec![Recorded::Vertices { buffer: id, bytes: 56 }]);
    }

    #[test]
    fn test_recording_ids_are_unique() {
        let mut gpu = RecordingBackend::default();
        let a = gpu.create_texture("a", 1, 1, SrcFormat::Rgba, &[0; 4]);
        let b = gpu.upload_indices(&[0, 1, 2]);
        assert_ne!(a, b);
        gpu.draw(DrawCall::new(DrawPass::Water, IndexSource::Cached { buffer: b, offset: 0, count: 3 }));
        assert_eq!(gpu.draws().count(), 1);
        assert_eq!(gpu.draws().next().unwrap().indices.count(), 3);
    }
}
