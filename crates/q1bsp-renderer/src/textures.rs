// textures.rs — world texture upload: palette expansion and external replacements

use rayon::prelude::*;
use thiserror::Error;

use q1bsp_common::common::{com_dprintf, com_warning};
use q1bsp_common::files::FileSystem;
use q1bsp_common::model::BrushData;
use q1bsp_common::model_texture::{SrcFormat, Texture};
use q1bsp_common::q_shared::com_strip_extension;

use crate::gpu::{GpuBackend, TextureId};

/// First palette index drawn at full brightness.
pub const FULLBRIGHT_START: u8 = 224;
/// Index that is see-through on fence textures.
pub const TRANSPARENT_INDEX: u8 = 255;

const IMAGE_EXTENSIONS: [(&str, image::ImageFormat); 3] = [
    ("tga", image::ImageFormat::Tga),
    ("png", image::ImageFormat::Png),
    ("jpg", image::ImageFormat::Jpeg),
];

#[derive(Debug, Error)]
pub enum TextureError {
    #[error("{name}: {source}")]
    Decode {
        name: String,
        #[source]
        source: image::ImageError,
    },
}

// ============================================================
// Palette
// ============================================================

/// Which pixels survive palette expansion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaletteMode {
    All,
    /// Fullbright indices become black; the glow layer draws them.
    NoBright,
    /// Only fullbright indices, everything else transparent.
    FullbrightOnly,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Palette {
    colors: [[u8; 3]; 256],
}

impl Default for Palette {
    fn default() -> Self {
        Self::grayscale()
    }
}

impl Palette {
    pub fn grayscale() -> Palette {
        let mut colors = [[0u8; 3]; 256];
        for (i, c) in colors.iter_mut().enumerate() {
            *c = [i as u8; 3];
        }
        Palette { colors }
    }

    /// Parses a 768-byte `palette.lmp`.
    pub fn from_lmp(raw: &[u8]) -> Option<Palette> {
        if raw.len() < 768 {
            return None;
        }
        let mut colors = [[0u8; 3]; 256];
        for (c, rgb) in colors.iter_mut().zip(raw.chunks_exact(3)) {
            c.copy_from_slice(rgb);
        }
        Some(Palette { colors })
    }

    pub fn load(fs: &FileSystem) -> Palette {
        match fs.load_file("gfx/palette.lmp").and_then(|f| Palette::from_lmp(&f.data)) {
            Some(p) => p,
            None => {
                com_warning("Couldn't load gfx/palette.lmp, using a grey ramp\n");
                Palette::grayscale()
            }
        }
    }

    pub fn expand(&self, pixels: &[u8], mode: PaletteMode, fence: bool) -> Vec<u8> {
        let mut out = Vec::with_capacity(pixels.len() * 4);
        for &p in pixels {
            let bright = p >= FULLBRIGHT_START && !(fence && p == TRANSPARENT_INDEX);
            let [r, g, b] = self.colors[p as usize];
            let rgba = if fence && p == TRANSPARENT_INDEX {
                [0, 0, 0, 0]
            } else {
                match mode {
                    PaletteMode::All => [r, g, b, 255],
                    PaletteMode::NoBright if bright => [0, 0, 0, 255],
                    PaletteMode::NoBright => [r, g, b, 255],
                    PaletteMode::FullbrightOnly if bright => [r, g, b, 255],
                    PaletteMode::FullbrightOnly => [0, 0, 0, 0],
                }
            };
            out.extend_from_slice(&rgba);
        }
        out
    }
}

// ============================================================
// External images
// ============================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedImage {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

pub fn decode_image(name: &str, raw: &[u8], format: image::ImageFormat) -> Result<DecodedImage, TextureError> {
    let img = image::load_from_memory_with_format(raw, format).map_err(|source| TextureError::Decode {
        name: name.to_string(),
        source,
    })?;
    let rgba = img.to_rgba8();
    Ok(DecodedImage {
        name: name.to_string(),
        width: rgba.width(),
        height: rgba.height(),
        rgba: rgba.into_raw(),
    })
}

/// Tries `<base>.tga`, `.png` and `.jpg` in that order.
pub fn load_external_image(fs: &FileSystem, base: &str) -> Option<DecodedImage> {
    for (ext, format) in IMAGE_EXTENSIONS {
        let name = format!("{}.{}", base, ext);
        let Some(file) = fs.load_file(&name) else {
            continue;
        };
        match decode_image(base, &file.data, format) {
            Ok(img) => return Some(img),
            Err(e) => com_warning(&format!("{}\n", e)),
        }
    }
    None
}

/// Lookup bases for a texture, map directory first. Liquids are stored
/// with '#' since '*' is not allowed in file names.
pub fn replacement_bases(mapname: &str, texname: &str) -> [String; 2] {
    let name = match texname.strip_prefix('*') {
        Some(rest) => format!("#{}", rest),
        None => texname.to_string(),
    };
    [format!("textures/{}/{}", mapname, name), format!("textures/{}", name)]
}

#[derive(Debug, Default)]
pub struct Replacement {
    pub diffuse: Option<DecodedImage>,
    pub glow: Option<DecodedImage>,
}

/// Finds external images for `tex`. Glow layers come from the same place as
/// the diffuse image, `_glow` before `_luma`. Sky is never replaced here.
pub fn find_replacement(fs: &FileSystem, mapname: &str, tex: &Texture) -> Replacement {
    if tex.is_sky() {
        return Replacement::default();
    }
    for base in replacement_bases(mapname, &tex.name) {
        let Some(diffuse) = load_external_image(fs, &base) else {
            continue;
        };
        let glow = if tex.is_liquid() {
            None
        } else {
            load_external_image(fs, &format!("{}_glow", base))
                .or_else(|| load_external_image(fs, &format!("{}_luma", base)))
        };
        return Replacement {
            diffuse: Some(diffuse),
            glow,
        };
    }
    Replacement::default()
}

// ============================================================
// Upload
// ============================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TextureHandles {
    pub diffuse: Option<TextureId>,
    pub fullbright: Option<TextureId>,
}

/// Map name as used in replacement paths: `maps/e1m1.bsp` is `e1m1`.
pub fn replacement_map_name(model_name: &str) -> String {
    com_strip_extension(model_name.strip_prefix("maps/").unwrap_or(model_name))
}

fn upload_embedded<B: GpuBackend>(gpu: &mut B, model: &str, tex: &Texture, palette: &Palette) -> TextureHandles {
    let name = format!("{}:{}", model, tex.name);
    let (w, h) = (tex.data_width, tex.data_height);
    match tex.format {
        SrcFormat::Indexed => {
            let fence = tex.is_fence();
            if tex.has_fullbright && !tex.is_liquid() && !tex.is_sky() {
                let base = palette.expand(&tex.pixels, PaletteMode::NoBright, fence);
                let glow = palette.expand(&tex.pixels, PaletteMode::FullbrightOnly, fence);
                TextureHandles {
                    diffuse: Some(gpu.create_texture(&name, w, h, SrcFormat::Rgba, &base)),
                    fullbright: Some(gpu.create_texture(&format!("{}_glow", name), w, h, SrcFormat::Rgba, &glow)),
                }
            } else {
                let base = palette.expand(&tex.pixels, PaletteMode::All, fence);
                TextureHandles {
                    diffuse: Some(gpu.create_texture(&name, w, h, SrcFormat::Rgba, &base)),
                    fullbright: None,
                }
            }
        }
        SrcFormat::Rgb => {
            let rgba: Vec<u8> = tex.pixels.chunks_exact(3).flat_map(|c| [c[0], c[1], c[2], 255]).collect();
            TextureHandles {
                diffuse: Some(gpu.create_texture(&name, w, h, SrcFormat::Rgba, &rgba)),
                fullbright: None,
            }
        }
        format => TextureHandles {
            diffuse: Some(gpu.create_texture(&name, w, h, format, &tex.pixels)),
            fullbright: None,
        },
    }
}

/// Uploads every texture of a brush data set. Replacement images are
/// searched and decoded in parallel; GPU uploads stay on the calling
/// thread. The result is indexed like `data.textures`.
pub fn upload_textures<B: GpuBackend>(
    gpu: &mut B,
    fs: &FileSystem,
    data: &BrushData,
    palette: &Palette,
    load24bit: bool,
) -> Vec<TextureHandles> {
    let mapname = replacement_map_name(&data.name);

    let replacements: Vec<Replacement> = if load24bit {
        data.textures
            .par_iter()
            .map(|t| match t {
                Some(tex) => find_replacement(fs, &mapname, tex),
                None => Replacement::default(),
            })
            .collect()
    } else {
        data.textures.iter().map(|_| Replacement::default()).collect()
    };

    let mut handles = Vec::with_capacity(data.textures.len());
    let mut external = 0;
    for (tex, rep) in data.textures.iter().zip(replacements) {
        let Some(tex) = tex else {
            handles.push(TextureHandles::default());
            continue;
        };
        let h = match rep.diffuse {
            Some(img) => {
                external += 1;
                let diffuse = gpu.create_texture(&img.name, img.width, img.height, SrcFormat::Rgba, &img.rgba);
                let fullbright = rep
                    .glow
                    .map(|g| gpu.create_texture(&g.name, g.width, g.height, SrcFormat::Rgba, &g.rgba));
                TextureHandles {
                    diffuse: Some(diffuse),
                    fullbright,
                }
            }
            None => upload_embedded(gpu, &data.name, tex, palette),
        };
        handles.push(h);
    }
    if external > 0 {
        com_dprintf(&format!("{}: {} external textures\n", data.name, external));
    }
    handles
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{Recorded, RecordingBackend};
    use q1bsp_common::files::{build_pack, Pack};

    /// Uncompressed 32-bit top-left TGA of one colour.
    fn solid_tga(width: u16, height: u16, bgra: [u8; 4]) -> Vec<u8> {
        let mut out = vec![0u8, 0, 2, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        out.extend_from_slice(&width.to_le_bytes());
        out.extend_from_slice(&height.to_le_bytes());
        out.extend_from_slice(&[32, 0x28]);
        for _ in 0..width as usize * height as usize {
            out.extend_from_slice(&bgra);
        }
        out
    }

    fn fs_with(entries: &[(&str, &[u8])]) -> FileSystem {
        let mut fs = FileSystem::new();
        fs.add_pack(Pack::from_bytes("test.pak", build_pack(entries)).unwrap());
        fs
    }

    #[test]
    fn test_palette_modes() {
        let pal = Palette::grayscale();
        let px = [10u8, 230, 255];
        assert_eq!(
            pal.expand(&px, PaletteMode::All, false),
            vec![10, 10, 10, 255, 230, 230, 230, 255, 255, 255, 255, 255]
        );
        assert_eq!(&pal.expand(&px, PaletteMode::NoBright, false)[4..8], &[0, 0, 0, 255]);
        assert_eq!(&pal.expand(&px, PaletteMode::FullbrightOnly, false)[..4], &[0, 0, 0, 0]);
        // index 255 on a fence is a hole in every mode
        assert_eq!(&pal.expand(&px, PaletteMode::All, true)[8..], &[0, 0, 0, 0]);
        assert_eq!(Palette::from_lmp(&[0; 10]), None);
    }

    #[test]
    fn test_replacement_bases() {
        assert_eq!(
            replacement_bases("e1m1", "*water1"),
            ["textures/e1m1/#water1".to_string(), "textures/#water1".to_string()]
        );
        assert_eq!(replacement_bases("e1m1", "wall")[1], "textures/wall");
        assert_eq!(replacement_map_name("maps/e1m1.bsp"), "e1m1");
    }

    #[test]
    fn test_external_image_with_luma() {
        let diffuse = solid_tga(2, 2, [0, 0, 255, 255]);
        let luma = solid_tga(2, 2, [0, 255, 0, 255]);
        let fs = fs_with(&[("textures/wall.tga", &diffuse), ("textures/wall_luma.tga", &luma)]);
        let mut tex = Texture::placeholder("wall");
        let rep = find_replacement(&fs, "e1m1", &tex);
        let img = rep.diffuse.unwrap();
        assert_eq!((img.width, img.height), (2, 2));
        assert_eq!(&img.rgba[..4], &[255, 0, 0, 255]);
        assert_eq!(rep.glow.unwrap().name, "textures/wall_luma");

        tex.name = "sky1".to_string();
        assert!(find_replacement(&fs, "e1m1", &tex).diffuse.is_none());
    }

    #[test]
    fn test_map_directory_wins() {
        let generic = solid_tga(1, 1, [0, 0, 0, 255]);
        let local = solid_tga(1, 1, [255, 255, 255, 255]);
        let fs = fs_with(&[("textures/wall.tga", &generic), ("textures/start/wall.tga", &local)]);
        let rep = find_replacement(&fs, "start", &Texture::placeholder("wall"));
        assert_eq!(rep.diffuse.unwrap().name, "textures/start/wall");
    }

    #[test]
    fn test_corrupt_image_falls_through() {
        let fs = fs_with(&[("textures/wall.tga", b"not an image")]);
        assert!(load_external_image(&fs, "textures/wall").is_none());
    }

    #[test]
    fn test_upload_splits_fullbrights() {
        let mut data = BrushData::default();
        data.name = "maps/start.bsp".to_string();
        let mut bright = Texture::placeholder("lamp");
        bright.pixels[0] = 250;
        bright.has_fullbright = true;
        data.textures = vec![Some(bright), None, Some(Texture::placeholder("floor"))];

        let mut gpu = RecordingBackend::default();
        let handles = upload_textures(&mut gpu, &FileSystem::new(), &data, &Palette::grayscale(), true);
        assert_eq!(handles.len(), 3);
        assert!(handles[0].fullbright.is_some());
        assert_eq!(handles[1], TextureHandles::default());
        assert!(handles[2].diffuse.is_some() && handles[2].fullbright.is_none());
        assert_eq!(gpu.textures_named("maps/start.bsp:lamp_glow"), 1);
        assert!(gpu
            .events
            .iter()
            .all(|e| !matches!(e, Recorded::CreateTexture { format, .. } if *format != SrcFormat::Rgba)));
    }
}
