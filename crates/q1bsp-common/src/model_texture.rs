// model_texture.rs — miptex lump decoding, animation sequencing and texinfo

use crate::bspfile::{read_i32_at, ByteReader, DTexinfo};
use crate::common::{com_dprintf, com_printf, com_warning};
use crate::error::{LoadError, LoadResult};
use crate::model::TexInfo;
use crate::qfiles::*;

/// Pixel encoding of the data carried in a texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SrcFormat {
    /// 8-bit palette indices.
    Indexed,
    Rgba,
    Rgb,
    Bc1,
    Bc2,
    Bc3,
    Bc4,
    Bc5,
    Bc6,
    Bc7,
}

impl SrcFormat {
    /// Maps a four-byte extension code ("RGBA", "BC1\0", ...) to a format.
    pub fn from_code(code: &[u8]) -> Option<SrcFormat> {
        let end = code.iter().position(|&b| b == 0).unwrap_or(code.len());
        let fmt = match &code[..end] {
            b"RGBA" => SrcFormat::Rgba,
            b"RGB" => SrcFormat::Rgb,
            b"BC1" => SrcFormat::Bc1,
            b"BC2" => SrcFormat::Bc2,
            b"BC3" => SrcFormat::Bc3,
            b"BC4" => SrcFormat::Bc4,
            b"BC5" => SrcFormat::Bc5,
            b"BC6" => SrcFormat::Bc6,
            b"BC7" => SrcFormat::Bc7,
            _ => return None,
        };
        Some(fmt)
    }

    /// Size in bytes of a single mip level.
    pub fn image_size(self, width: u32, height: u32) -> usize {
        let (w, h) = (width as usize, height as usize);
        let blocks = w.div_ceil(4) * h.div_ceil(4);
        match self {
            SrcFormat::Indexed => w * h,
            SrcFormat::Rgb => w * h * 3,
            SrcFormat::Rgba => w * h * 4,
            SrcFormat::Bc1 | SrcFormat::Bc4 => blocks * 8,
            SrcFormat::Bc2 | SrcFormat::Bc3 | SrcFormat::Bc5 | SrcFormat::Bc6 | SrcFormat::Bc7 => blocks * 16,
        }
    }

    pub fn is_compressed(self) -> bool {
        !matches!(self, SrcFormat::Indexed | SrcFormat::Rgb | SrcFormat::Rgba)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Texture {
    pub name: String,
    /// Size as declared by the miptex header (texture-space units).
    pub width: u32,
    pub height: u32,
    /// Quake64 texture coordinate shift.
    pub shift: u32,
    pub format: SrcFormat,
    /// Size of `pixels`, which may differ from the declared size when an
    /// embedded replacement was used.
    pub data_width: u32,
    pub data_height: u32,
    pub pixels: Vec<u8>,
    pub has_fullbright: bool,

    pub anim_total: i32,
    pub anim_min: i32,
    pub anim_max: i32,
    pub anim_next: Option<usize>,
    pub alternate_anims: Option<usize>,
}

impl Texture {
    /// 16x16 checkerboard used for the placeholder slots.
    pub fn placeholder(name: &str) -> Texture {
        let (width, height) = (16, 16);
        Texture {
            name: name.to_string(),
            width,
            height,
            shift: 0,
            format: SrcFormat::Indexed,
            data_width: width,
            data_height: height,
            pixels: checkerboard(width, height),
            has_fullbright: false,
            anim_total: 0,
            anim_min: 0,
            anim_max: 0,
            anim_next: None,
            alternate_anims: None,
        }
    }

    pub fn is_sky(&self) -> bool {
        self.name.len() >= 3 && self.name[..3].eq_ignore_ascii_case("sky")
    }

    pub fn is_liquid(&self) -> bool {
        self.name.starts_with('*')
    }

    pub fn is_fence(&self) -> bool {
        self.name.starts_with('{')
    }

    pub fn is_animated(&self) -> bool {
        self.anim_total != 0
    }
}

fn checkerboard(width: u32, height: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity((width * height) as usize);
    for y in 0..height {
        for x in 0..width {
            out.push(if ((x >> 2) ^ (y >> 2)) & 1 != 0 { 6 } else { 2 });
        }
    }
    out
}

fn check_fullbrights(pixels: &[u8]) -> bool {
    pixels.iter().any(|&p| p > 223)
}

struct MiptexHeader {
    name: String,
    width: u32,
    height: u32,
    offsets: [u32; MIPLEVELS],
    shift: u32,
}

fn read_miptex_header(mt: &[u8], is_q64: bool) -> LoadResult<MiptexHeader> {
    let mut r = ByteReader::new(mt);
    let mut name = r.name(MIPTEX_NAME_LEN)?;
    name.truncate(MIPTEX_NAME_LEN - 1);
    let width = r.u32()?;
    let height = r.u32()?;
    let mut offsets = [0u32; MIPLEVELS];
    for o in offsets.iter_mut() {
        *o = r.u32()?;
    }
    let shift = if is_q64 { r.u32()? } else { 0 };
    Ok(MiptexHeader {
        name,
        width,
        height,
        offsets,
        shift,
    })
}

/// Where the extension block would start. `mt.len()` means "no room".
fn ext_data_offset(h: &MiptexHeader, end: usize, is_q64: bool) -> usize {
    if is_q64 {
        return end;
    }
    if h.offsets[0] == 0 {
        return MIPTEX_SIZE;
    }
    let (w, ht, o) = (h.width as u64, h.height as u64, h.offsets.map(|v| v as u64));
    let standard = o[0] == MIPTEX_SIZE as u64
        && o[1] == o[0] + w * ht
        && o[2] == o[1] + (w >> 1) * (ht >> 1)
        && o[3] == o[2] + (w >> 2) * (ht >> 2);
    if standard {
        (o[3] + (w >> 3) * (ht >> 3)).min(end as u64) as usize
    } else {
        end
    }
}

/// Finds an embedded replacement whose declared size matches its format.
fn scan_extensions(mt: &[u8], ext: usize) -> Option<(SrcFormat, u32, u32, usize)> {
    let end = mt.len();
    if ext + 4 > end || mt[ext..ext + 4] != MIPTEX_EXT_MAGIC {
        return None;
    }
    let mut p = ext + 4;
    while p + 8 < end {
        let sz = read_i32_at(mt, p)? as u32 as usize;
        if sz < 8 || sz > end - p {
            break;
        }
        if sz <= 16 {
            p += sz;
            continue;
        }
        let Some(fmt) = SrcFormat::from_code(&mt[p + 4..p + 8]) else {
            p += sz;
            continue;
        };
        let width = read_i32_at(mt, p + 8)? as u32;
        let height = read_i32_at(mt, p + 12)? as u32;
        if width == 0 || height == 0 {
            p += sz;
            continue;
        }
        if 16 + fmt.image_size(width, height) == sz {
            return Some((fmt, width, height, p + 16));
        }
        break;
    }
    None
}

/// Decodes one miptex record. `mt` runs from the record to the start of the
/// next one (or the end of the lump).
fn load_mip_tex(mt: &[u8], is_q64: bool) -> LoadResult<Texture> {
    let h = read_miptex_header(mt, is_q64)?;
    let end = mt.len();

    let ext = ext_data_offset(&h, end, is_q64);
    let (format, data_width, data_height, src) = match scan_extensions(mt, ext) {
        Some((fmt, w, hh, ofs)) => (fmt, w, hh, Some(ofs)),
        None => {
            let src = if is_q64 {
                Some(MIPTEX64_SIZE)
            } else if h.offsets[0] != 0 {
                Some(h.offsets[0] as usize)
            } else {
                None
            };
            (SrcFormat::Indexed, h.width, h.height, src)
        }
    };

    let pixelbytes = format.image_size(data_width, data_height);
    let pixels = match src {
        Some(src) => {
            let mut pixels = vec![0u8; pixelbytes];
            let mut n = pixelbytes;
            if src + pixelbytes > end {
                com_dprintf(&format!("Texture {} extends past end of lump\n", h.name));
                n = end.saturating_sub(src);
            }
            if n > 0 {
                pixels[..n].copy_from_slice(&mt[src..src + n]);
            }
            pixels
        }
        None => checkerboard(h.width, h.height),
    };

    let has_fullbright = format == SrcFormat::Indexed && check_fullbrights(&pixels);
    Ok(Texture {
        name: h.name,
        width: h.width,
        height: h.height,
        shift: h.shift,
        format,
        data_width,
        data_height,
        pixels,
        has_fullbright,
        anim_total: 0,
        anim_min: 0,
        anim_max: 0,
        anim_next: None,
        alternate_anims: None,
    })
}

/// Decodes the texture lump. The returned table has two trailing placeholder
/// slots: one for lightmapped surfaces and one for tiled surfaces whose
/// texture is missing.
pub fn load_textures(model: &str, lump: &[u8], is_q64: bool) -> LoadResult<Vec<Option<Texture>>> {
    let nummiptex = if lump.is_empty() {
        com_printf("Mod_LoadTextures: no textures in bsp file\n");
        0
    } else {
        let n = read_i32_at(lump, 0).unwrap_or(0);
        if n < 0 || 4 + 4 * n as usize > lump.len() {
            return Err(LoadError::BadIndex {
                model: model.to_string(),
                what: "miptex count",
                index: n as i64,
                count: lump.len() / 4,
            });
        }
        n as usize
    };

    let mut textures: Vec<Option<Texture>> = vec![None; nummiptex + 2];

    // walk backwards so each record ends where the next one starts
    let mut mipend = lump.len();
    for i in (0..nummiptex).rev() {
        let dataofs = read_i32_at(lump, 4 + 4 * i).unwrap_or(-1);
        if dataofs == -1 {
            continue;
        }
        if dataofs < 0 || dataofs as usize + MIPTEX_SIZE > lump.len() {
            com_warning(&format!("Texture {} in {} has a bad offset\n", i, model));
            continue;
        }
        let dataofs = dataofs as usize;
        if dataofs >= mipend {
            mipend = lump.len();
        }

        let mt = &lump[dataofs..mipend];
        let h = read_miptex_header(mt, is_q64)?;
        if h.width == 0 || h.height == 0 {
            com_warning(&format!("Zero sized texture {} in {}!\n", h.name, model));
            continue;
        }
        if ((h.width & 15) != 0 || (h.height & 15) != 0) && !is_q64 {
            com_warning(&format!(
                "Texture {} ({} x {}) is not 16 aligned\n",
                h.name, h.width, h.height
            ));
        }

        textures[i] = Some(load_mip_tex(mt, is_q64)?);
        mipend = dataofs;
    }

    textures[nummiptex] = Some(Texture::placeholder("notexture"));
    textures[nummiptex + 1] = Some(Texture::placeholder("notexture2"));

    for err in sequence_animations(&mut textures[..nummiptex], is_q64) {
        com_warning(&format!("{}\n", err));
    }
    Ok(textures)
}

const ANIM_CYCLE: i32 = 2;
const MAX_ANIM_FRAMES: usize = 10;

/// Frame slot for an animation name: `+0`..`+9` are primary frames,
/// `+A`..`+J` (either case) alternates.
fn anim_frame(name: &str) -> Option<(bool, usize)> {
    let c = name.as_bytes().get(1)?.to_ascii_uppercase();
    match c {
        b'0'..=b'9' => Some((false, (c - b'0') as usize)),
        b'A'..=b'J' => Some((true, (c - b'A') as usize)),
        _ => None,
    }
}

/// Links `+N` / `+L` frames sharing a suffix into cycles. Sets with a missing
/// frame are reported and left unanimated.
pub fn sequence_animations(textures: &mut [Option<Texture>], is_q64: bool) -> Vec<LoadError> {
    let mut errors = Vec::new();
    let mut done = vec![false; textures.len()];

    for i in 0..textures.len() {
        let Some(tx) = textures[i].as_ref() else { continue };
        if !tx.name.starts_with('+') || done[i] {
            continue;
        }
        let base = tx.name.clone();
        let suffix = base.get(2..).unwrap_or("");

        let mut anims: [Option<usize>; MAX_ANIM_FRAMES] = [None; MAX_ANIM_FRAMES];
        let mut altanims: [Option<usize>; MAX_ANIM_FRAMES] = [None; MAX_ANIM_FRAMES];
        let mut maxanim = 0;
        let mut altmax = 0;
        let mut bad = false;

        for (j, other) in textures.iter().enumerate().skip(i) {
            let Some(tx2) = other.as_ref() else { continue };
            if !tx2.name.starts_with('+') || tx2.name.get(2..).unwrap_or("") != suffix {
                continue;
            }
            done[j] = true;
            match anim_frame(&tx2.name) {
                Some((false, n)) => {
                    anims[n] = Some(j);
                    maxanim = maxanim.max(n + 1);
                }
                Some((true, n)) => {
                    altanims[n] = Some(j);
                    altmax = altmax.max(n + 1);
                }
                None => {
                    errors.push(LoadError::BadAnimatingTexture { name: tx2.name.clone() });
                    bad = true;
                }
            }
        }
        if bad {
            continue;
        }

        if is_q64 && anims[..maxanim].iter().any(|a| a.is_none()) {
            continue;
        }
        let missing = anims[..maxanim]
            .iter()
            .chain(altanims[..altmax].iter())
            .position(|a| a.is_none());
        if let Some(pos) = missing {
            let frame = if pos < maxanim { pos } else { pos - maxanim };
            errors.push(LoadError::MissingAnimationFrame { name: base, frame });
            continue;
        }

        link_chain(textures, &anims[..maxanim], altanims[..altmax].first().copied().flatten());
        link_chain(textures, &altanims[..altmax], anims[..maxanim].first().copied().flatten());
    }
    errors
}

fn link_chain(textures: &mut [Option<Texture>], frames: &[Option<usize>], alternate: Option<usize>) {
    let count = frames.len();
    for (j, frame) in frames.iter().enumerate() {
        let (Some(idx), Some(next)) = (*frame, frames[(j + 1) % count]) else {
            continue;
        };
        if let Some(tx) = textures[idx].as_mut() {
            tx.anim_total = count as i32 * ANIM_CYCLE;
            tx.anim_min = j as i32 * ANIM_CYCLE;
            tx.anim_max = (j as i32 + 1) * ANIM_CYCLE;
            tx.anim_next = Some(next);
            tx.alternate_anims = alternate;
        }
    }
}

/// Decodes texinfo records. References to missing textures are pointed at
/// one of the placeholder slots and flagged `TEX_MISSING`.
pub fn load_texinfo(model: &str, lump: &[u8], textures: &[Option<Texture>]) -> LoadResult<Vec<TexInfo>> {
    let raw = crate::bspfile::decode_records(model, "texinfo", lump, TEXINFO_SIZE, DTexinfo::decode)?;
    let numtextures = textures.len();
    let mut missing = 0;

    let out = raw
        .into_iter()
        .map(|d| {
            let mut flags = d.flags;
            let valid = d.miptex >= 0
                && (d.miptex as usize) < numtextures.saturating_sub(1)
                && textures[d.miptex as usize].is_some();
            let texture = if valid {
                d.miptex as usize
            } else {
                flags |= TEX_MISSING;
                missing += 1;
                if d.flags & TEX_SPECIAL != 0 {
                    numtextures - 1
                } else {
                    numtextures - 2
                }
            };
            TexInfo {
                vecs: d.vecs,
                texture,
                flags,
            }
        })
        .collect();

    if missing > 0 {
        com_printf(&format!("Mod_LoadTexinfo: {} texture(s) missing from BSP file\n", missing));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{build_miptex, build_texture_lump};

    fn named(names: &[&str]) -> Vec<Option<Texture>> {
        names
            .iter()
            .map(|n| {
                let mut t = Texture::placeholder(n);
                t.name = n.to_string();
                Some(t)
            })
            .collect()
    }

    fn next_of(t: &[Option<Texture>], i: usize) -> Option<usize> {
        t[i].as_ref().unwrap().anim_next
    }

    #[test]
    fn test_animation_order_and_cycle() {
        // deliberately shuffled in the lump
        let mut tex = named(&["+2lava", "+0lava", "wall", "+1lava"]);
        let errors = sequence_animations(&mut tex, false);
        assert!(errors.is_empty());

        // +0 -> +1 -> +2 -> +0
        assert_eq!(next_of(&tex, 1), Some(3));
        assert_eq!(next_of(&tex, 3), Some(0));
        assert_eq!(next_of(&tex, 0), Some(1));

        let f0 = tex[1].as_ref().unwrap();
        assert_eq!((f0.anim_total, f0.anim_min, f0.anim_max), (6, 0, 2));
        let f2 = tex[0].as_ref().unwrap();
        assert_eq!((f2.anim_min, f2.anim_max), (4, 6));
        assert!(!tex[2].as_ref().unwrap().is_animated());
    }

    #[test]
    fn test_animation_gap_is_reported() {
        let mut tex = named(&["+0door", "+2door"]);
        let errors = sequence_animations(&mut tex, false);
        assert_eq!(errors.len(), 1);
        assert!(matches!(
            &errors[0],
            LoadError::MissingAnimationFrame { frame: 1, .. }
        ));
        assert!(next_of(&tex, 0).is_none());
    }

    #[test]
    fn test_alternate_animations_cross_link() {
        let mut tex = named(&["+0btn", "+a_btn_wrong", "+1btn", "+abtn"]);
        let errors = sequence_animations(&mut tex, false);
        assert!(errors.is_empty());
        let f0 = tex[0].as_ref().unwrap();
        assert_eq!(f0.alternate_anims, Some(3));
        let alt = tex[3].as_ref().unwrap();
        assert_eq!(alt.alternate_anims, Some(0));
        assert_eq!(alt.anim_next, Some(3));
        assert_eq!(alt.anim_total, 2);
    }

    #[test]
    fn test_bad_animation_name() {
        let mut tex = named(&["+xfoo"]);
        let errors = sequence_animations(&mut tex, false);
        assert!(matches!(&errors[0], LoadError::BadAnimatingTexture { .. }));
    }

    #[test]
    fn test_q64_incomplete_set_stays_static() {
        let mut tex = named(&["+0q", "+2q"]);
        assert!(sequence_animations(&mut tex, true).is_empty());
        assert!(next_of(&tex, 0).is_none());
    }

    #[test]
    fn test_load_textures_placeholders_and_fullbright() {
        let mut bright = vec![5u8; 16 * 16];
        bright[17] = 240;
        let lump = build_texture_lump(&[
            Some(build_miptex("wall", 16, 16, Some(&vec![1u8; 256]))),
            None,
            Some(build_miptex("light1", 16, 16, Some(&bright))),
        ]);
        let tex = load_textures("maps/t.bsp", &lump, false).unwrap();
        assert_eq!(tex.len(), 5);
        assert!(tex[1].is_none());
        let wall = tex[0].as_ref().unwrap();
        assert_eq!(wall.name, "wall");
        assert!(!wall.has_fullbright);
        assert!(tex[2].as_ref().unwrap().has_fullbright);
        assert_eq!(tex[3].as_ref().unwrap().name, "notexture");
        assert_eq!(tex[4].as_ref().unwrap().name, "notexture2");
    }

    #[test]
    fn test_missing_pixels_become_checkerboard() {
        let lump = build_texture_lump(&[Some(build_miptex("blank", 16, 16, None))]);
        let tex = load_textures("maps/t.bsp", &lump, false).unwrap();
        let t = tex[0].as_ref().unwrap();
        assert_eq!(t.pixels[0], 2);
        assert_eq!(t.pixels[4], 6);
        assert_eq!(t.pixels[4 * 16], 6);
        assert_eq!(t.pixels[4 * 16 + 4], 2);
    }

    #[test]
    fn test_embedded_rgba_replacement() {
        let mut mt = build_miptex("hires", 16, 16, Some(&vec![3u8; 256]));
        // the standard mips must be complete for the extension to be found
        mt.resize(MIPTEX_SIZE + 256 + 64 + 16 + 4, 0);
        mt.extend_from_slice(&MIPTEX_EXT_MAGIC);
        let (w, h) = (2u32, 2u32);
        let payload = vec![0xAAu8; 16];
        mt.extend_from_slice(&((16 + payload.len()) as u32).to_le_bytes());
        mt.extend_from_slice(b"RGBA");
        mt.extend_from_slice(&w.to_le_bytes());
        mt.extend_from_slice(&h.to_le_bytes());
        mt.extend_from_slice(&payload);

        let lump = build_texture_lump(&[Some(mt)]);
        let tex = load_textures("maps/t.bsp", &lump, false).unwrap();
        let t = tex[0].as_ref().unwrap();
        assert_eq!(t.format, SrcFormat::Rgba);
        assert_eq!((t.width, t.height), (16, 16));
        assert_eq!((t.data_width, t.data_height), (2, 2));
        assert_eq!(t.pixels, payload);
    }

    #[test]
    fn test_truncated_pixels_are_clamped() {
        let mut mt = build_miptex("short", 16, 16, Some(&vec![9u8; 256]));
        mt.truncate(MIPTEX_SIZE + 100);
        let lump = build_texture_lump(&[Some(mt)]);
        let tex = load_textures("maps/t.bsp", &lump, false).unwrap();
        let t = tex[0].as_ref().unwrap();
        assert_eq!(t.pixels.len(), 256);
        assert_eq!(t.pixels[99], 9);
        assert_eq!(t.pixels[100], 0);
    }

    #[test]
    fn test_image_sizes() {
        assert_eq!(SrcFormat::Bc1.image_size(16, 16), 128);
        assert_eq!(SrcFormat::Bc7.image_size(6, 6), 64);
        assert_eq!(SrcFormat::Rgb.image_size(2, 3), 18);
        assert_eq!(SrcFormat::from_code(b"BC4\0"), Some(SrcFormat::Bc4));
        assert_eq!(SrcFormat::from_code(b"XYZW"), None);
    }

    #[test]
    fn test_texinfo_missing_uses_placeholders() {
        let tex = named(&["a", "notexture", "notexture2"]);
        let mut lump = Vec::new();
        for (miptex, flags) in [(0i32, 0i32), (7, 0), (9, TEX_SPECIAL)] {
            for _ in 0..8 {
                lump.extend_from_slice(&0f32.to_le_bytes());
            }
            lump.extend_from_slice(&miptex.to_le_bytes());
            lump.extend_from_slice(&flags.to_le_bytes());
        }
        let ti = load_texinfo("maps/t.bsp", &lump, &tex).unwrap();
        assert_eq!(ti[0].texture, 0);
        assert_eq!(ti[1].texture, 1);
        assert_eq!(ti[1].flags & TEX_MISSING, TEX_MISSING);
        assert_eq!(ti[2].texture, 2);
    }
}
