// model_load.rs — brush model loader: lumps, sidecar files and submodel setup
//
// Every stage takes the loader context plus the parts of `BrushData` decoded
// so far, and returns its own piece.

use std::sync::Arc;

use crate::bspfile::*;
use crate::cmodel::decompress_vis;
use crate::common::{com_dprintf, com_dprintf2, com_printf, com_warning};
use crate::crc::entity_lump_crc;
use crate::error::{LoadError, LoadResult};
use crate::lightgrid::LightGrid;
use crate::model::*;
use crate::model_texture::{load_texinfo, load_textures};
use crate::q_shared::*;
use crate::qfiles::*;

/// Per-load state threaded through every stage.
pub struct LoadContext<'a> {
    /// Full model name, e.g. "maps/e1m1.bsp".
    pub name: &'a str,
    /// Base name, e.g. "e1m1".
    pub loadname: String,
    pub path_id: u32,
    pub bsp: BspFile<'a>,
    pub env: LoadEnv<'a>,
}

impl<'a> LoadContext<'a> {
    pub fn is_q64(&self) -> bool {
        self.bsp.version == BSPVERSION_QUAKE64
    }

    fn layout(&self) -> BspLayout {
        self.bsp.layout
    }

    fn bad_index(&self, what: &'static str, index: i64, count: usize) -> LoadError {
        LoadError::BadIndex {
            model: self.name.to_string(),
            what,
            index,
            count,
        }
    }

    /// Loads a sidecar file, honoring the search path priority rule.
    fn load_sidecar(&self, filename: &str) -> Option<Vec<u8>> {
        let file = self.env.fs.load_file(filename)?;
        if file.path_id < self.path_id {
            com_dprintf(&format!("ignored {} from a gamedir with lower priority\n", filename));
            return None;
        }
        Some(file.data)
    }
}

// ============================================================
// Geometry lumps
// ============================================================

pub fn load_vertexes(ctx: &LoadContext) -> LoadResult<Vec<Vec3>> {
    ctx.bsp.records(ctx.name, LUMP_VERTEXES, DVERTEX_SIZE, |r| r.vec3())
}

pub fn load_edges(ctx: &LoadContext, data: &BrushData) -> LoadResult<Vec<[u32; 2]>> {
    let edges = match ctx.layout() {
        BspLayout::Short => ctx.bsp.records(ctx.name, LUMP_EDGES, DSEDGE_SIZE, decode_short_edge)?,
        _ => ctx.bsp.records(ctx.name, LUMP_EDGES, DLEDGE_SIZE, decode_long_edge)?,
    };
    let numvertexes = data.vertexes.len();
    if let Some(v) = edges.iter().flatten().find(|&&v| v as usize >= numvertexes) {
        return Err(ctx.bad_index("vertex", *v as i64, numvertexes));
    }
    Ok(edges)
}

pub fn load_surfedges(ctx: &LoadContext, data: &BrushData) -> LoadResult<Vec<i32>> {
    let surfedges = ctx.bsp.records(ctx.name, LUMP_SURFEDGES, SURFEDGE_SIZE, |r| r.i32())?;
    let numedges = data.edges.len();
    if let Some(e) = surfedges.iter().find(|&&e| e.unsigned_abs() as usize >= numedges) {
        return Err(ctx.bad_index("edge", *e as i64, numedges));
    }
    Ok(surfedges)
}

pub fn load_planes(ctx: &LoadContext) -> LoadResult<Vec<Plane>> {
    let raw = ctx.bsp.records(ctx.name, LUMP_PLANES, DPLANE_SIZE, DPlane::decode)?;
    Ok(raw
        .into_iter()
        .map(|p| Plane::new(p.normal, p.dist, p.plane_type as u8))
        .collect())
}

// ============================================================
// Lighting
// ============================================================

/// Static light samples, in priority order: `.lit` sidecar, Quake64 packed
/// colour, BSPX HDR, BSPX RGB, then the mono lump expanded to RGB.
pub fn load_lighting(ctx: &LoadContext) -> LightData {
    let lump = ctx.bsp.lump(LUMP_LIGHTING);
    let filelen = lump.len();

    let litfilename = format!("{}.lit", com_strip_extension(ctx.name));
    if let Some(lit) = ctx.load_sidecar(&litfilename) {
        if lit.len() >= LIT_HEADER_SIZE && &lit[0..4] == LIT_IDENT {
            let version = read_i32_at(&lit, 4).unwrap_or(0);
            match version {
                LIT_VERSION_LDR => {
                    if LIT_HEADER_SIZE + filelen * 3 == lit.len() {
                        com_dprintf2(&format!("{} loaded (ldr)\n", litfilename));
                        return LightData::Ldr(lit[LIT_HEADER_SIZE..].to_vec());
                    }
                    com_printf(&format!(
                        "Outdated .lit file ({} should be {} bytes, not {})\n",
                        litfilename,
                        LIT_HEADER_SIZE + filelen * 3,
                        lit.len()
                    ));
                }
                LIT_VERSION_HDR => {
                    if LIT_HEADER_SIZE + filelen * 4 == lit.len() {
                        com_dprintf2(&format!("{} loaded (hdr)\n", litfilename));
                        return LightData::Hdr(words(&lit[LIT_HEADER_SIZE..]));
                    }
                    com_printf(&format!(
                        "Outdated .lit file ({} should be {} bytes, not {})\n",
                        litfilename,
                        LIT_HEADER_SIZE + filelen * 4,
                        lit.len()
                    ));
                }
                other => com_printf(&format!("Unknown .lit file version ({})\n", other)),
            }
        } else {
            com_printf("Corrupt .lit file (old version?), ignoring\n");
        }
    }

    if ctx.is_q64() && filelen > 0 {
        // RRRRRGGG GGBBBBBB
        let mut out = Vec::with_capacity(filelen / 2 * 3);
        for pair in lump.chunks_exact(2) {
            let (b0, b1) = (pair[0], pair[1]);
            out.push(b0 & 0xf8);
            out.push(((b0 & 0x07) << 5) + ((b1 & 0xc0) >> 5));
            out.push((b1 & 0x3f) << 2);
        }
        return LightData::Ldr(out);
    }

    if let Some(hdr) = ctx.bsp.bspx_lump(BSPX_LIGHTING_E5BGR9) {
        if filelen == 0 || (!hdr.is_empty() && hdr.len() == filelen * 4) {
            com_dprintf("bspx hdr lighting loaded\n");
            return LightData::Hdr(words(hdr));
        }
    }
    if let Some(rgb) = ctx.bsp.bspx_lump(BSPX_RGBLIGHTING) {
        if filelen == 0 || (!rgb.is_empty() && rgb.len() == filelen * 3) {
            com_dprintf("bspx ldr lighting loaded\n");
            return LightData::Ldr(rgb.to_vec());
        }
    }
    if filelen > 0 {
        return LightData::Ldr(lump.iter().flat_map(|&d| [d, d, d]).collect());
    }
    LightData::None
}

fn words(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

// ============================================================
// Entities
// ============================================================

fn lump_text(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// The entity string, from `maps/<map>@<crc>.ent`, `maps/<map>.ent` or the
/// embedded lump.
pub fn load_entities(ctx: &LoadContext) -> String {
    let lump = ctx.bsp.lump(LUMP_ENTITIES);

    if ctx.env.settings.external_ents {
        let crc = if lump.is_empty() { 0 } else { entity_lump_crc(lump) };
        let basemapname = com_strip_extension(ctx.name);
        let candidates = [
            format!("{}@{:04x}.ent", basemapname, crc),
            format!("{}.ent", basemapname),
        ];
        for entfilename in candidates.iter() {
            com_dprintf2(&format!("trying to load {}\n", entfilename));
            if ctx.env.fs.file_exists(entfilename).is_none() {
                continue;
            }
            if let Some(ents) = ctx.load_sidecar(entfilename) {
                com_dprintf(&format!("Loaded external entity file {}\n", entfilename));
                return lump_text(&ents);
            }
            break;
        }
    }

    lump_text(lump)
}

/// Scans the first (worldspawn) entity for `wantkey`. Keys written with a
/// leading underscore match too.
pub fn parse_worldspawn_key(entities: &str, wantkey: &str) -> Option<String> {
    let (token, mut data) = com_parse(entities)?;
    if token != "{" {
        return None;
    }
    loop {
        let (key, rest) = com_parse(data)?;
        if key == "}" {
            return None;
        }
        let foundkey = key.strip_prefix('_').unwrap_or(&key);
        let (value, rest) = com_parse(rest)?;
        if foundkey == wantkey {
            return Some(value);
        }
        data = rest;
    }
}

/// Vanilla lightmaps are 16 texels per luxel.
const DEFAULT_LMSHIFT: u32 = 4;
/// Largest accepted lightmap shift; one luxel then spans 65536 texels.
const MAX_LMSHIFT: u32 = 16;

/// Default lightmap shift from the worldspawn `lightmap_scale` key.
fn worldspawn_lightmap_shift(entities: &str) -> Option<u32> {
    let scalebuf = parse_worldspawn_key(entities, "lightmap_scale")?;
    let trimmed = scalebuf.trim_start();
    let value = if trimmed.is_empty() { Some(0) } else { trimmed.parse::<i64>().ok() };
    match value {
        Some(i) if i >= 0 => {
            if i == 0 {
                return None;
            }
            let mut i = i;
            let mut shift = 0;
            while i > 1 {
                i >>= 1;
                shift += 1;
            }
            if shift > MAX_LMSHIFT {
                com_dprintf(&format!("lightmap_scale {} is too large, using 16.\n", scalebuf));
                return None;
            }
            Some(shift)
        }
        _ => {
            com_warning(&format!(
                "Incorrect value for lightmap_scale field - {} - should be texels-per-luxel (and power-of-two), use 16 (or omit) to match vanilla quake.\n",
                scalebuf
            ));
            None
        }
    }
}

// ============================================================
// Faces
// ============================================================

/// Lightmap extents and basis for a surface.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SurfaceExtents {
    pub extents: [i32; 2],
    pub lmvecs: [[f32; 4]; 2],
    pub lmvecscale: [f32; 2],
}

/// Projects the winding onto the texture axes and derives the lightmap
/// rectangle. The projection is done in double precision and stored as
/// single, matching the light compilers; changing this shifts lightmaps.
pub fn calc_surface_extents(points: &[Vec3], tex: &TexInfo, lmshift: u32, lightscale_broken: bool) -> SurfaceExtents {
    let mut mins = [f32::MAX; 2];
    let mut maxs = [-f32::MAX; 2];

    for v in points {
        for j in 0..2 {
            let val = dot_product_f64(v, &tex.vecs[j][..3]) + tex.vecs[j][3] as f64;
            let val = val as f32;
            if val < mins[j] {
                mins[j] = val;
            }
            if val > maxs[j] {
                maxs[j] = val;
            }
        }
    }

    let lmscale = (1u32 << lmshift) as f32;
    let mut out = SurfaceExtents {
        extents: [0; 2],
        lmvecs: [[0.0; 4]; 2],
        lmvecscale: [0.0; 2],
    };

    for i in 0..2 {
        let bmins = (mins[i] / lmscale).floor() as i32;
        let bmaxs = (maxs[i] / lmscale).ceil() as i32;

        for k in 0..3 {
            out.lmvecs[i][k] = tex.vecs[i][k] / lmscale;
        }
        out.lmvecs[i][3] = tex.vecs[i][3] / lmscale - bmins as f32;

        out.lmvecscale[i] = if lightscale_broken {
            16.0
        } else {
            1.0 / vector_length(&[out.lmvecs[i][0], out.lmvecs[i][1], out.lmvecs[i][2]])
        };

        out.extents[i] = bmaxs - bmins;
        let limit = if i == 0 { LMBLOCK_WIDTH } else { LMBLOCK_HEIGHT };
        if tex.flags & TEX_SPECIAL == 0 && out.extents[i] >= limit {
            out.extents[i] = 1;
        }
    }
    out
}

fn calc_surface_bounds(points: &[Vec3]) -> (Vec3, Vec3) {
    let mut mins = [f32::MAX; 3];
    let mut maxs = [-f32::MAX; 3];
    for p in points {
        add_point_to_bounds(p, &mut mins, &mut maxs);
    }
    (mins, maxs)
}

/// Per-face overrides from BSPX lumps.
struct FaceOverrides<'a> {
    decoupled: Option<&'a [u8]>,
    lmshift: Option<&'a [u8]>,
    lmoffset: Option<&'a [u8]>,
    lmstyle16: Option<&'a [u8]>,
    lmstyle8: Option<&'a [u8]>,
    stylesperface: usize,
    defaultshift: u32,
}

impl<'a> FaceOverrides<'a> {
    fn find(ctx: &LoadContext<'a>, entities: &str, count: usize) -> FaceOverrides<'a> {
        let mut o = FaceOverrides {
            decoupled: None,
            lmshift: None,
            lmoffset: None,
            lmstyle16: None,
            lmstyle8: None,
            stylesperface: MAXLIGHTMAPS,
            defaultshift: DEFAULT_LMSHIFT,
        };
        if ctx.env.settings.ignore_lmscale || count == 0 {
            return o;
        }
        let bsp = &ctx.bsp;

        o.decoupled = bsp
            .bspx_lump(BSPX_DECOUPLED_LM)
            .filter(|l| l.len() == count * DECOUPLED_LM_SIZE);
        if o.decoupled.is_none() {
            o.lmshift = bsp.bspx_lump(BSPX_LMSHIFT).filter(|l| l.len() == count);
            o.lmoffset = bsp.bspx_lump(BSPX_LMOFFSET).filter(|l| l.len() == count * 4);
            if let Some(shift) = worldspawn_lightmap_shift(entities) {
                o.defaultshift = shift;
            }
        }

        if let Some(l) = bsp.bspx_lump(BSPX_LMSTYLE16) {
            let per = l.len() / (2 * count);
            if per > 0 && l.len() == 2 * per * count {
                o.lmstyle16 = Some(l);
                o.stylesperface = per;
            }
        }
        if o.lmstyle16.is_none() {
            if let Some(l) = bsp.bspx_lump(BSPX_LMSTYLE) {
                let per = l.len() / count;
                if per > 0 && l.len() == per * count {
                    o.lmstyle8 = Some(l);
                    o.stylesperface = per;
                }
            }
        }
        o
    }

    fn styles(&self, surfnum: usize, base: [u16; MAXLIGHTMAPS]) -> [u16; MAXLIGHTMAPS] {
        let mut styles = base;
        let per = self.stylesperface;
        let used = if let Some(l16) = self.lmstyle16 {
            for i in 0..per.min(MAXLIGHTMAPS) {
                let ofs = 2 * (surfnum * per + i);
                styles[i] = u16::from_le_bytes([l16[ofs], l16[ofs + 1]]);
            }
            per.min(MAXLIGHTMAPS)
        } else if let Some(l8) = self.lmstyle8 {
            for i in 0..per.min(MAXLIGHTMAPS) {
                let s = l8[surfnum * per + i];
                styles[i] = if s == INVALID_LIGHTSTYLE_OLD { INVALID_LIGHTSTYLE } else { s as u16 };
            }
            per.min(MAXLIGHTMAPS)
        } else {
            MAXLIGHTMAPS
        };
        for s in styles.iter_mut().skip(used) {
            *s = INVALID_LIGHTSTYLE;
        }
        styles
    }
}

fn surface_flags(tex_name: &str, texinfo_flags: i32, has_samples: bool) -> SurfFlags {
    let mut flags = SurfFlags::empty();
    if tex_name.get(..3).is_some_and(|p| p.eq_ignore_ascii_case("sky")) {
        flags |= SurfFlags::DRAWSKY | SurfFlags::DRAWTILED;
    } else if tex_name.starts_with('*') {
        flags |= SurfFlags::DRAWTURB;
        if texinfo_flags & TEX_SPECIAL != 0 {
            flags |= SurfFlags::DRAWTILED;
        }
        flags |= if tex_name.starts_with("*lava") {
            SurfFlags::DRAWLAVA
        } else if tex_name.starts_with("*slime") {
            SurfFlags::DRAWSLIME
        } else if tex_name.starts_with("*tele") {
            SurfFlags::DRAWTELE
        } else {
            SurfFlags::DRAWWATER
        };
    } else if tex_name.starts_with('{') {
        flags |= SurfFlags::DRAWFENCE;
    } else if texinfo_flags & TEX_MISSING != 0 {
        flags |= SurfFlags::NOTEXTURE;
        if !has_samples {
            flags |= SurfFlags::DRAWTILED;
        }
    }
    flags
}

pub fn load_faces(ctx: &LoadContext, data: &BrushData) -> LoadResult<Vec<Surface>> {
    let faces = match ctx.layout() {
        BspLayout::Short => ctx.bsp.records(ctx.name, LUMP_FACES, DSFACE_SIZE, DFace::decode_short)?,
        _ => ctx.bsp.records(ctx.name, LUMP_FACES, DLFACE_SIZE, DFace::decode_long)?,
    };
    let count = faces.len();
    if count > MAX_STANDARD_FACES && !ctx.layout().is_bsp2() {
        com_dprintf(&format!("{} faces exceeds standard limit of {}.\n", count, MAX_STANDARD_FACES));
    }

    let overrides = FaceOverrides::find(ctx, &data.entities, count);
    let lightdatasamples = data.lightdata.num_samples() as i64;
    let lightscale_broken = ctx.env.settings.lightscale_broken;

    let mut badshifts = 0;
    let mut surfaces = Vec::with_capacity(count);
    for (surfnum, f) in faces.iter().enumerate() {
        if f.planenum as usize >= data.planes.len() {
            return Err(ctx.bad_index("plane", f.planenum as i64, data.planes.len()));
        }
        if f.texinfo as usize >= data.texinfo.len() {
            return Err(ctx.bad_index("texinfo", f.texinfo as i64, data.texinfo.len()));
        }
        let firstedge = f.firstedge.max(0) as usize;
        let numedges = f.numedges as usize;
        if f.firstedge < 0 || firstedge + numedges > data.surfedges.len() {
            return Err(ctx.bad_index("surfedge", f.firstedge as i64, data.surfedges.len()));
        }

        let base = f.styles.map(|s| if s == INVALID_LIGHTSTYLE_OLD { INVALID_LIGHTSTYLE } else { s as u16 });
        let styles = overrides.styles(surfnum, base);

        let mut lofs = f.lightofs as i64;
        let mut shift = overrides.defaultshift;
        if let Some(l) = overrides.lmshift {
            shift = l[surfnum] as u32;
            if shift > MAX_LMSHIFT {
                badshifts += 1;
                shift = overrides.defaultshift;
            }
        }
        if let Some(l) = overrides.lmoffset {
            lofs = read_i32_at(l, surfnum * 4).unwrap_or(-1) as i64;
        }

        let tex = &data.texinfo[f.texinfo as usize];
        let mut surf = Surface {
            plane: f.planenum as usize,
            flags: SurfFlags::empty(),
            firstedge,
            numedges,
            texinfo: f.texinfo as usize,
            styles,
            samples: None,
            extents: [0; 2],
            lmvecs: [[0.0; 4]; 2],
            lmvecscale: [0.0; 2],
            mins: [0.0; 3],
            maxs: [0.0; 3],
        };
        if f.side != 0 {
            surf.flags |= SurfFlags::PLANEBACK;
        }

        let points: Vec<Vec3> = (0..numedges).map(|i| data.surface_vertex(&surf, i)).collect();

        if let Some(dlm) = overrides.decoupled {
            let mut r = ByteReader::at(dlm, surfnum * DECOUPLED_LM_SIZE);
            let lmsize = [r.u16()?, r.u16()?];
            lofs = r.i32()? as i64;
            for row in surf.lmvecs.iter_mut() {
                for v in row.iter_mut() {
                    *v = r.f32()?;
                }
            }
            surf.extents = [lmsize[0] as i32 - 1, lmsize[1] as i32 - 1];
            for i in 0..2 {
                let v = &surf.lmvecs[i];
                surf.lmvecscale[i] = 1.0 / vector_length(&[v[0], v[1], v[2]]);
            }
            if surf.extents[0] >= LMBLOCK_WIDTH || surf.extents[1] >= LMBLOCK_HEIGHT {
                com_warning(&format!(
                    "{}: Bad surface extents ({}*{}, max {}*{}).\n",
                    ctx.name, surf.extents[0], surf.extents[1], LMBLOCK_WIDTH, LMBLOCK_HEIGHT
                ));
                surf.extents = [1, 1];
            }
        } else {
            let e = calc_surface_extents(&points, tex, shift, lightscale_broken);
            surf.extents = e.extents;
            surf.lmvecs = e.lmvecs;
            surf.lmvecscale = e.lmvecscale;
        }

        let (mins, maxs) = calc_surface_bounds(&points);
        surf.mins = mins;
        surf.maxs = maxs;

        if ctx.is_q64() {
            lofs /= 2;
        }
        let facestyles = surf.num_styles() as i64;
        let size = (surf.extents[0] as i64 + 1) * (surf.extents[1] as i64 + 1);
        surf.samples = if lofs < 0 || lofs + facestyles * size > lightdatasamples {
            None
        } else {
            Some(lofs as usize)
        };

        let tex_name = data.texture(tex.texture).map(|t| t.name.as_str()).unwrap_or("");
        surf.flags |= surface_flags(tex_name, tex.flags, surf.samples.is_some());

        surfaces.push(surf);
    }
    if badshifts > 0 {
        com_dprintf(&format!("{}: {} faces with an invalid LMSHIFT, using the default.\n", ctx.name, badshifts));
    }
    Ok(surfaces)
}

pub fn load_marksurfaces(ctx: &LoadContext, data: &BrushData) -> LoadResult<Vec<usize>> {
    let marks: Vec<u32> = match ctx.layout() {
        BspLayout::Short => ctx
            .bsp
            .records(ctx.name, LUMP_MARKSURFACES, DSMARKSURF_SIZE, |r| Ok(r.u16()? as u32))?,
        _ => ctx.bsp.records(ctx.name, LUMP_MARKSURFACES, DLMARKSURF_SIZE, |r| r.u32())?,
    };
    if !ctx.layout().is_bsp2() && marks.len() > MAX_STANDARD_MARKSURFACES {
        com_dprintf(&format!(
            "{} marksurfaces exceeds standard limit of {}.\n",
            marks.len(),
            MAX_STANDARD_MARKSURFACES
        ));
    }
    let numsurfaces = data.surfaces.len();
    marks
        .into_iter()
        .map(|j| {
            if j as usize >= numsurfaces {
                Err(ctx.bad_index("marksurface", j as i64, numsurfaces))
            } else {
                Ok(j as usize)
            }
        })
        .collect()
}

// ============================================================
// Visibility and leafs
// ============================================================

/// Decodes leaf records. Visibility offsets outside `vislen` are treated
/// as "no vis data".
pub fn process_leafs(
    ctx: &LoadContext,
    layout: BspLayout,
    lump: &[u8],
    vislen: usize,
    nummarksurfaces: usize,
) -> LoadResult<Vec<Leaf>> {
    let raw = decode_records(ctx.name, "leafs", lump, DLeaf::record_size(layout), |r| DLeaf::decode(layout, r))?;
    if layout == BspLayout::Short && raw.len() > MAX_BSP29_LEAFS {
        return Err(LoadError::TooManyLeafs {
            model: ctx.name.to_string(),
            count: raw.len(),
            limit: MAX_BSP29_LEAFS,
        });
    }

    raw.into_iter()
        .map(|l| {
            let first = l.firstmarksurface as usize;
            let num = l.nummarksurfaces as usize;
            if first + num > nummarksurfaces {
                return Err(ctx.bad_index("leaf marksurface", first as i64, nummarksurfaces));
            }
            let compressed_vis = match l.visofs {
                v if v < 0 => None,
                v if (v as usize) < vislen => Some(v as usize),
                _ => None,
            };
            Ok(Leaf {
                contents: Contents::from_raw(l.contents),
                mins: l.mins,
                maxs: l.maxs,
                firstmarksurface: first,
                nummarksurfaces: num,
                compressed_vis,
                ambient_sound_level: l.ambient_level,
            })
        })
        .collect()
}

pub fn load_leafs(ctx: &LoadContext, data: &BrushData) -> LoadResult<Vec<Leaf>> {
    process_leafs(
        ctx,
        ctx.layout(),
        ctx.bsp.lump(LUMP_LEAFS),
        data.visdata.len(),
        data.marksurfaces.len(),
    )
}

/// Looks for a vis patch for this map in `maps/<map>.vis` or
/// `<gamedir>.vis`. Returns replacement vis data and BSP29 leafs.
pub fn find_visibility_external(ctx: &LoadContext, data: &BrushData) -> Option<(Vec<u8>, Vec<Leaf>)> {
    let mut visfilename = format!("maps/{}.vis", ctx.loadname);
    let mut found = ctx.env.fs.file_exists(&visfilename);
    if found.is_none() {
        let gamedir = com_skip_path(&ctx.env.fs.gamedir).to_string();
        com_dprintf(&format!("{} not found, trying {}.vis\n", visfilename, gamedir));
        visfilename = format!("{}.vis", gamedir);
        found = ctx.env.fs.file_exists(&visfilename);
    }
    if found.is_none() {
        com_dprintf("external vis not found\n");
        return None;
    }
    let file = ctx.load_sidecar(&visfilename)?;
    com_dprintf(&format!("Found external VIS {}\n", visfilename));

    let shortname = com_skip_path(ctx.name);
    let mut pos = 0usize;
    let mut r = ByteReader::new(&file);
    loop {
        r.seek(pos);
        let Ok(mapname) = r.name(VISPATCH_MAPNAME_LEN) else {
            com_dprintf(&format!("{} not found in {}\n", shortname, visfilename));
            return None;
        };
        let Ok(filelen) = r.i32() else {
            com_dprintf(&format!("{} not found in {}\n", shortname, visfilename));
            return None;
        };
        if filelen <= 0 {
            return None;
        }
        if mapname.eq_ignore_ascii_case(shortname) {
            break;
        }
        pos += filelen as usize + VISPATCH_HEADER_LEN;
    }

    let result = (|| -> LoadResult<(Vec<u8>, Vec<Leaf>)> {
        let vislen = r.i32()?;
        if vislen <= 0 {
            return Err(ctx.bad_index("external vis length", vislen as i64, 0));
        }
        com_dprintf(&format!("...{} bytes visibility data\n", vislen));
        let visdata = r.bytes(vislen as usize)?.to_vec();
        let leaflen = r.i32()?;
        if leaflen <= 0 {
            return Err(ctx.bad_index("external leaf length", leaflen as i64, 0));
        }
        com_dprintf(&format!("...{} bytes leaf data\n", leaflen));
        let leafdata = r.bytes(leaflen as usize)?;
        let leafs = process_leafs(ctx, BspLayout::Short, leafdata, visdata.len(), data.marksurfaces.len())?;
        Ok((visdata, leafs))
    })();

    match result {
        Ok((vis, leafs)) if !leafs.is_empty() => Some((vis, leafs)),
        _ => {
            com_dprintf("External VIS data failed, using standard vis.\n");
            None
        }
    }
}

// ============================================================
// Nodes and hulls
// ============================================================

pub fn load_nodes(ctx: &LoadContext, data: &BrushData) -> LoadResult<Vec<Node>> {
    let layout = ctx.layout();
    let raw = ctx
        .bsp
        .records(ctx.name, LUMP_NODES, DNode::record_size(layout), |r| DNode::decode(layout, r))?;
    let count = raw.len();
    if layout == BspLayout::Short && count > MAX_STANDARD_NODES {
        com_dprintf(&format!("{} nodes exceeds standard limit of {}.\n", count, MAX_STANDARD_NODES));
    }
    let numleafs = data.leafs.len();

    let leaf_child = |leaf: u64| -> NodeChild {
        if (leaf as usize) < numleafs {
            NodeChild::Leaf(leaf as usize)
        } else {
            com_printf(&format!(
                "Mod_LoadNodes: invalid leaf index {} (file has only {} leafs)\n",
                leaf, numleafs
            ));
            NodeChild::Leaf(0)
        }
    };

    raw.into_iter()
        .map(|n| {
            if n.planenum < 0 || n.planenum as usize >= data.planes.len() {
                return Err(ctx.bad_index("node plane", n.planenum as i64, data.planes.len()));
            }
            if n.firstface as usize + n.numfaces as usize > data.surfaces.len() {
                return Err(ctx.bad_index("node face", n.firstface as i64, data.surfaces.len()));
            }
            let children = n.children.map(|p| match layout {
                // leafs are stored as 65535 - index; leaf 0 is 65535
                BspLayout::Short if (p as usize) < count => NodeChild::Node(p as usize),
                BspLayout::Short => leaf_child(65535 - p as u64),
                BspLayout::Long1 if (p as i32) >= 0 && (p as usize) < count => NodeChild::Node(p as usize),
                BspLayout::Long2 if p > 0 && (p as usize) < count => NodeChild::Node(p as usize),
                _ => leaf_child((u32::MAX - p) as u64),
            });
            Ok(Node {
                plane: n.planenum as usize,
                children,
                mins: n.mins,
                maxs: n.maxs,
                firstsurface: n.firstface as usize,
                numsurfaces: n.numfaces as usize,
            })
        })
        .collect()
}

pub fn load_clipnodes(ctx: &LoadContext, data: &BrushData) -> LoadResult<Vec<ClipNode>> {
    let layout = ctx.layout();
    let raw = ctx.bsp.records(ctx.name, LUMP_CLIPNODES, DClipnode::record_size(layout), |r| {
        DClipnode::decode(layout, r)
    })?;
    let count = raw.len();
    if layout == BspLayout::Short && count > MAX_STANDARD_CLIPNODES {
        com_dprintf(&format!(
            "{} clipnodes exceeds standard limit of {}.\n",
            count, MAX_STANDARD_CLIPNODES
        ));
    }

    let mut clamped = 0;
    let out = raw
        .into_iter()
        .map(|c| {
            if c.planenum < 0 || c.planenum as usize >= data.planes.len() {
                return Err(ctx.bad_index("clipnode plane", c.planenum as i64, data.planes.len()));
            }
            let children = c.children.map(|mut v| {
                // 16-bit children above the node count wrap to content values
                if layout == BspLayout::Short && v as usize >= count {
                    v -= 65536;
                }
                if v < 0 {
                    ClipChild::Contents(Contents::from_raw(v))
                } else if (v as usize) < count {
                    ClipChild::Node(v as usize)
                } else {
                    clamped += 1;
                    ClipChild::Contents(Contents::Solid)
                }
            });
            Ok(ClipNode {
                plane: c.planenum as usize,
                children,
            })
        })
        .collect::<LoadResult<Vec<_>>>()?;

    if clamped > 0 {
        com_warning(&format!(
            "Mod_LoadClipnodes: {} out of range children in {} treated as solid\n",
            clamped, ctx.name
        ));
    }
    Ok(out)
}

/// Duplicates the draw tree as clipping hull 0.
pub fn make_hull0(nodes: &[Node], leafs: &[Leaf]) -> Vec<ClipNode> {
    nodes
        .iter()
        .map(|n| ClipNode {
            plane: n.plane,
            children: n.children.map(|c| match c {
                NodeChild::Node(i) => ClipChild::Node(i),
                NodeChild::Leaf(l) => ClipChild::Contents(leafs[l].contents),
            }),
        })
        .collect()
}

const DMODELH2_SIZE: usize = 80;

/// Decodes the models lump, also accepting the 8-hull layout.
pub fn load_submodels(ctx: &LoadContext) -> LoadResult<Vec<Submodel>> {
    let lump = ctx.bsp.lump(LUMP_MODELS);

    // an 8-hull lump has the world's q1 numfaces slot zeroed and the next
    // record's firstface slot set
    let is_h2 = lump.len() >= DMODELH2_SIZE
        && lump.len() % DMODELH2_SIZE == 0
        && read_i32_at(lump, 60) == Some(0)
        && read_i32_at(lump, DMODEL_SIZE + 56).is_some_and(|v| v != 0);

    fn decode_h2(r: &mut ByteReader) -> LoadResult<DModel> {
        let mins = r.vec3()?;
        let maxs = r.vec3()?;
        let origin = r.vec3()?;
        let mut headnode = [0i32; MAX_MAP_HULLS];
        for j in 0..8 {
            let h = r.i32()?;
            if j < MAX_MAP_HULLS {
                headnode[j] = h;
            }
        }
        Ok(DModel {
            mins,
            maxs,
            origin,
            headnode,
            visleafs: r.i32()?,
            firstface: r.i32()?,
            numfaces: r.i32()?,
        })
    }

    let raw = if is_h2 {
        decode_records(ctx.name, "models", lump, DMODELH2_SIZE, decode_h2)?
    } else {
        ctx.bsp.records(ctx.name, LUMP_MODELS, DMODEL_SIZE, DModel::decode)?
    };

    let out: Vec<Submodel> = raw
        .into_iter()
        .map(|m| Submodel {
            // spread the bounds by a unit
            mins: m.mins.map(|v| v - 1.0),
            maxs: m.maxs.map(|v| v + 1.0),
            origin: m.origin,
            headnode: m.headnode,
            visleafs: m.visleafs.max(0) as usize,
            firstface: m.firstface.max(0) as usize,
            numfaces: m.numfaces.max(0) as usize,
        })
        .collect();

    if let Some(world) = out.first() {
        if world.visleafs > MAX_STANDARD_VISLEAFS {
            com_dprintf(&format!(
                "{} visleafs exceeds standard limit of {}.\n",
                world.visleafs, MAX_STANDARD_VISLEAFS
            ));
        }
    }
    Ok(out)
}

// ============================================================
// Water vis
// ============================================================

/// Works out which liquid types can be seen through. Types that never
/// appear in a vised liquid leaf are assumed transparent.
pub fn check_water_vis(data: &BrushData, novis: bool) -> SurfFlags {
    let all = SurfFlags::LIQUID_TYPES;
    if novis {
        return all;
    }

    let numclusters = data
        .submodels
        .first()
        .map(|m| m.visleafs)
        .unwrap_or(0)
        .min(data.leafs.len().saturating_sub(1));
    let mut contentfound = SurfFlags::empty();
    let mut transparent = SurfFlags::empty();
    let mut has_liquid = false;

    for leaf in data.leafs.iter().skip(1).take(numclusters) {
        let contenttype = match leaf.contents {
            Contents::Water => {
                has_liquid = true;
                if transparent.contains(SurfFlags::DRAWWATER | SurfFlags::DRAWTELE) {
                    continue;
                }
                let marks = &data.marksurfaces[leaf.firstmarksurface..leaf.firstmarksurface + leaf.nummarksurfaces];
                let found = marks
                    .iter()
                    .map(|&m| data.surfaces[m].flags & (SurfFlags::DRAWWATER | SurfFlags::DRAWTELE))
                    .find(|f| !f.is_empty());
                match found {
                    Some(f) => f,
                    None => continue,
                }
            }
            Contents::Slime => {
                has_liquid = true;
                SurfFlags::DRAWSLIME
            }
            Contents::Lava => {
                has_liquid = true;
                SurfFlags::DRAWLAVA
            }
            _ => continue,
        };
        if transparent.intersects(contenttype) {
            continue;
        }
        contentfound |= contenttype;

        let compressed = leaf.compressed_vis.map(|ofs| &data.visdata[ofs..]);
        let vis = decompress_vis(compressed, numclusters, &data.viswarn, &data.name);
        let sees_other = (0..numclusters).any(|i| {
            vis[i >> 3] & (1 << (i & 7)) != 0 && data.leafs[i + 1].contents != leaf.contents
        });
        if sees_other {
            transparent |= contenttype;
        }
    }

    if transparent.is_empty() {
        if has_liquid {
            com_dprintf(&format!("{} is not watervised\n", data.name));
        }
    } else {
        let mut kinds = String::new();
        for (flag, label) in [
            (SurfFlags::DRAWWATER, " water"),
            (SurfFlags::DRAWTELE, " tele"),
            (SurfFlags::DRAWLAVA, " lava"),
            (SurfFlags::DRAWSLIME, " slime"),
        ] {
            if transparent.contains(flag) {
                kinds.push_str(label);
            }
        }
        com_dprintf2(&format!("{} is vised for transparent{}\n", data.name, kinds));
    }

    transparent | (!contentfound & all)
}

// ============================================================
// Top level
// ============================================================

const HULL1_MINS: Vec3 = [-16.0, -16.0, -24.0];
const HULL1_MAXS: Vec3 = [16.0, 16.0, 32.0];
const HULL2_MINS: Vec3 = [-32.0, -32.0, -24.0];
const HULL2_MAXS: Vec3 = [32.0, 32.0, 64.0];

fn setup_hulls(data: &BrushData, headnode: &[i32; MAX_MAP_HULLS]) -> [HullDef; MAX_MAP_HULLS] {
    let hull0_last = data.nodes.len() as i32 - 1;
    let clip_last = data.clipnodes.len() as i32 - 1;
    let noclip = data.clipnodes.is_empty();

    let mut hulls = [HullDef::default(); MAX_MAP_HULLS];
    hulls[0] = HullDef {
        nodes: HullNodes::Draw,
        firstclipnode: headnode[0],
        lastclipnode: hull0_last,
        clip_mins: [0.0; 3],
        clip_maxs: [0.0; 3],
    };
    for (j, (mins, maxs)) in [(HULL1_MINS, HULL1_MAXS), (HULL2_MINS, HULL2_MAXS)].into_iter().enumerate() {
        let hull = &mut hulls[j + 1];
        hull.firstclipnode = headnode[j + 1];
        if noclip {
            // point-sized, biased to mid-bottom so view offsets still work
            hull.nodes = HullNodes::Draw;
            hull.lastclipnode = hull0_last;
            hull.clip_mins = [mins[0], mins[1], 0.0];
            hull.clip_maxs = [maxs[0], maxs[1], maxs[2] - mins[2]];
        } else {
            hull.nodes = HullNodes::Clip;
            hull.lastclipnode = clip_last;
            hull.clip_mins = mins;
            hull.clip_maxs = maxs;
        }
    }
    hulls[3] = HullDef {
        nodes: if noclip { HullNodes::Draw } else { HullNodes::Clip },
        firstclipnode: headnode[3],
        lastclipnode: if noclip { hull0_last } else { clip_last },
        clip_mins: [0.0; 3],
        clip_maxs: [0.0; 3],
    };
    hulls
}

/// One `BrushModel` per submodel; index 0 is the world.
pub fn setup_submodels(data: &Arc<BrushData>) -> LoadResult<Vec<BrushModel>> {
    let max_visleafs = data.leafs.len().saturating_sub(1);
    data.submodels
        .iter()
        .enumerate()
        .map(|(i, bm)| {
            if bm.firstface + bm.numfaces > data.surfaces.len() {
                return Err(LoadError::BadIndex {
                    model: data.name.clone(),
                    what: "submodel face",
                    index: bm.firstface as i64,
                    count: data.surfaces.len(),
                });
            }
            let radius = radius_from_bounds(&bm.mins, &bm.maxs);
            Ok(BrushModel {
                data: Arc::clone(data),
                submodel_index: i,
                hulls: setup_hulls(data, &bm.headnode),
                firstmodelsurface: bm.firstface,
                nummodelsurfaces: bm.numfaces,
                numleafs: bm.visleafs.min(max_visleafs),
                mins: bm.mins,
                maxs: bm.maxs,
                rmins: [-radius; 3],
                rmaxs: [radius; 3],
                ymins: [-radius; 3],
                ymaxs: [radius; 3],
                clipmins: bm.mins,
                clipmaxs: bm.maxs,
                radius,
            })
        })
        .collect()
}

/// Decodes a BSP image into the world and its inline submodels.
pub fn load_brush_model(name: &str, buffer: &[u8], path_id: u32, env: &LoadEnv) -> LoadResult<Vec<BrushModel>> {
    let bsp = BspFile::parse(name, buffer)?;
    let ctx = LoadContext {
        name,
        loadname: com_file_base(name),
        path_id,
        bsp,
        env: *env,
    };

    let mut d = BrushData {
        name: name.to_string(),
        bspversion: ctx.bsp.version,
        layout: Some(ctx.layout()),
        path_id,
        ..BrushData::default()
    };

    d.vertexes = load_vertexes(&ctx)?;
    d.edges = load_edges(&ctx, &d)?;
    d.surfedges = load_surfedges(&ctx, &d)?;
    d.textures = load_textures(name, ctx.bsp.lump(LUMP_TEXTURES), ctx.is_q64())?;
    d.lightdata = load_lighting(&ctx);
    d.planes = load_planes(&ctx)?;
    d.texinfo = load_texinfo(name, ctx.bsp.lump(LUMP_TEXINFO), &d.textures)?;
    d.entities = load_entities(&ctx);
    d.surfaces = load_faces(&ctx, &d)?;
    d.lightgrid = ctx.bsp.bspx_lump(BSPX_LIGHTGRID_OCTREE).and_then(LightGrid::load);
    d.marksurfaces = load_marksurfaces(&ctx, &d)?;

    let wants_external_vis = ctx.bsp.version == BSPVERSION
        && ctx.env.settings.external_vis
        && env.server_map.is_some_and(|m| m.eq_ignore_ascii_case(&ctx.loadname));
    let external = if wants_external_vis {
        com_dprintf("trying to open external vis file\n");
        find_visibility_external(&ctx, &d)
    } else {
        None
    };
    match external {
        Some((visdata, leafs)) => {
            com_dprintf("found valid external .vis file for map\n");
            d.visdata = visdata;
            d.leafs = leafs;
        }
        None => {
            d.visdata = ctx.bsp.lump(LUMP_VISIBILITY).to_vec();
            d.leafs = load_leafs(&ctx, &d)?;
        }
    }

    d.nodes = load_nodes(&ctx, &d)?;
    d.clipnodes = load_clipnodes(&ctx, &d)?;
    d.submodels = load_submodels(&ctx)?;
    if d.submodels.is_empty() {
        return Err(ctx.bad_index("submodel", 0, 0));
    }
    if d.nodes.is_empty() || d.leafs.is_empty() {
        return Err(ctx.bad_index("node", 0, d.nodes.len()));
    }
    d.hull0 = make_hull0(&d.nodes, &d.leafs);
    d.contents_transparent = check_water_vis(&d, ctx.env.settings.novis);

    setup_submodels(&Arc::new(d))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cvar::LoaderSettings;
    use crate::files::{build_pack, FileSystem, Pack};
    use crate::testutil::BspBuilder;

    fn load(bsp: &[u8], fs: &FileSystem, settings: LoaderSettings) -> Vec<BrushModel> {
        let env = LoadEnv::new(fs, settings);
        load_brush_model("maps/test.bsp", bsp, 1, &env).unwrap()
    }

    fn texinfo(s: [f32; 4], t: [f32; 4], flags: i32) -> TexInfo {
        TexInfo {
            vecs: [s, t],
            texture: 0,
            flags,
        }
    }

    #[test]
    fn test_surface_extents_basic() {
        let pts = [[0.0, 0.0, 0.0], [64.0, 0.0, 0.0], [64.0, 32.0, 0.0], [0.0, 32.0, 0.0]];
        let tex = texinfo([1.0, 0.0, 0.0, 0.0], [0.0, 1.0, 0.0, 0.0], 0);
        let e = calc_surface_extents(&pts, &tex, 4, true);
        assert_eq!(e.extents, [4, 2]);
        assert_eq!(e.lmvecs[0], [1.0 / 16.0, 0.0, 0.0, 0.0]);
        assert_eq!(e.lmvecscale, [16.0, 16.0]);

        let e = calc_surface_extents(&pts, &tex, 4, false);
        assert!((e.lmvecscale[0] - 16.0).abs() < 1e-4);
    }

    #[test]
    fn test_surface_extents_offset_and_clamp() {
        let pts = [[-8.0, 0.0, 0.0], [8.0, 0.0, 0.0], [8.0, 5000.0, 0.0]];
        let tex = texinfo([1.0, 0.0, 0.0, 4.0], [0.0, 1.0, 0.0, 0.0], 0);
        let e = calc_surface_extents(&pts, &tex, 4, true);
        // s spans -4..12 -> floor(-0.25)=-1 .. ceil(0.75)=1
        assert_eq!(e.extents[0], 2);
        assert_eq!(e.lmvecs[0][3], 4.0 / 16.0 + 1.0);
        // t spans 5000 units, far past a lightmap block
        assert_eq!(e.extents[1], 1);

        let special = texinfo([1.0, 0.0, 0.0, 4.0], [0.0, 1.0, 0.0, 0.0], TEX_SPECIAL);
        assert_eq!(calc_surface_extents(&pts, &special, 4, true).extents[1], 313);
    }

    #[test]
    fn test_worldspawn_key() {
        let ents = "{\n\"classname\" \"worldspawn\"\n\"_lightmap_scale\" \"8\"\n}\n{\n\"classname\" \"light\"\n}";
        assert_eq!(parse_worldspawn_key(ents, "lightmap_scale").as_deref(), Some("8"));
        assert_eq!(parse_worldspawn_key(ents, "classname").as_deref(), Some("worldspawn"));
        assert_eq!(parse_worldspawn_key(ents, "message"), None);
        assert_eq!(worldspawn_lightmap_shift(ents), Some(3));
        assert_eq!(worldspawn_lightmap_shift("{ \"lightmap_scale\" \"0\" }"), None);
        assert_eq!(worldspawn_lightmap_shift("{ \"lightmap_scale\" \"16x\" }"), None);
        assert_eq!(worldspawn_lightmap_shift("{ \"lightmap_scale\" \"65536\" }"), Some(16));
        assert_eq!(worldspawn_lightmap_shift("{ \"lightmap_scale\" \"131072\" }"), None);
        assert_eq!(worldspawn_lightmap_shift("{ \"_lightmap_scale\" \"4294967296\" }"), None);
        assert_eq!(parse_worldspawn_key("garbage", "x"), None);
    }

    #[test]
    fn test_oversized_lightmap_shift_falls_back() {
        let fs = FileSystem::new();
        let vanilla = load(&BspBuilder::two_room_world().build(), &fs, LoaderSettings::default());
        let expected = vanilla[0].data.surfaces[0].extents;

        let bsp = BspBuilder::two_room_world().with_bspx(BSPX_LMSHIFT, vec![40]).build();
        let w = &load(&bsp, &fs, LoaderSettings::default())[0];
        assert_eq!(w.data.surfaces[0].extents, expected);

        let bsp = BspBuilder::two_room_world()
            .with_entities("{\n\"classname\" \"worldspawn\"\n\"_lightmap_scale\" \"4294967296\"\n}\n")
            .build();
        let w = &load(&bsp, &fs, LoaderSettings::default())[0];
        assert_eq!(w.data.surfaces[0].extents, expected);

        // a sane per-face shift still applies
        let bsp = BspBuilder::two_room_world().with_bspx(BSPX_LMSHIFT, vec![5]).build();
        let w = &load(&bsp, &fs, LoaderSettings::default())[0];
        assert_eq!(w.data.surfaces[0].extents, [expected[0] / 2, expected[1] / 2]);
    }

    #[test]
    fn test_load_two_room_world() {
        let _ = env_logger::builder().is_test(true).try_init();
        let bsp = BspBuilder::two_room_world().build();
        let fs = FileSystem::new();
        let models = load(&bsp, &fs, LoaderSettings::default());
        assert_eq!(models.len(), 1);
        let world = &models[0];
        let d = &world.data;

        assert_eq!(d.leafs.len(), 3);
        assert_eq!(world.numleafs, 2);
        assert_eq!(d.nodes.len(), 1);
        assert_eq!(d.nodes[0].children, [NodeChild::Leaf(1), NodeChild::Leaf(2)]);
        assert_eq!(d.hull0[0].children[0], ClipChild::Contents(Contents::Empty));
        assert_eq!(d.surfaces.len(), 1);
        assert!(d.surfaces[0].samples.is_some());
        assert_eq!(d.surfaces[0].styles, [0, INVALID_LIGHTSTYLE, INVALID_LIGHTSTYLE, INVALID_LIGHTSTYLE]);
        assert!(matches!(d.lightdata, LightData::Ldr(_)));
        assert!(d.entities.contains("worldspawn"));
        // no clipnodes in the builder: hulls 1 and 2 fall back to the draw tree
        assert_eq!(world.hulls[1].nodes, HullNodes::Draw);
        assert_eq!(world.hulls[1].clip_mins[2], 0.0);
        assert_eq!(world.hulls[1].clip_maxs[2], 56.0);
        assert!(world.radius > 0.0);
    }

    #[test]
    fn test_lit_sidecar_priority() {
        let bsp = BspBuilder::two_room_world().build();
        let samples = BspBuilder::two_room_world().light_samples();
        let mut lit = b"QLIT".to_vec();
        lit.extend_from_slice(&1i32.to_le_bytes());
        for _ in 0..samples {
            lit.extend_from_slice(&[10, 20, 30]);
        }

        // same priority as the map: used
        let mut fs = FileSystem::new();
        fs.add_pack(Pack::from_bytes("a.pak", build_pack(&[("maps/test.lit", &lit)])).unwrap());
        let w = &load(&bsp, &fs, LoaderSettings::default())[0];
        match &w.data.lightdata {
            LightData::Ldr(d) => assert_eq!(&d[..3], &[10, 20, 30]),
            other => panic!("unexpected {:?}", other),
        }

        // lower priority than the map: ignored
        let env = LoadEnv::new(&fs, LoaderSettings::default());
        let w = &load_brush_model("maps/test.bsp", &bsp, 5, &env).unwrap()[0];
        match &w.data.lightdata {
            LightData::Ldr(d) => assert_ne!(&d[..3], &[10, 20, 30]),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_outdated_lit_falls_back() {
        let bsp = BspBuilder::two_room_world().build();
        let mut lit = b"QLIT".to_vec();
        lit.extend_from_slice(&1i32.to_le_bytes());
        lit.extend_from_slice(&[1, 2, 3]);
        let mut fs = FileSystem::new();
        fs.add_pack(Pack::from_bytes("a.pak", build_pack(&[("maps/test.lit", &lit)])).unwrap());
        let w = &load(&bsp, &fs, LoaderSettings::default())[0];
        match &w.data.lightdata {
            LightData::Ldr(d) => assert_eq!(d[0], d[1]),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_external_entities() {
        let bsp = BspBuilder::two_room_world().build();
        let mut fs = FileSystem::new();
        fs.add_pack(
            Pack::from_bytes(
                "a.pak",
                build_pack(&[("maps/test.ent", b"{ \"classname\" \"worldspawn\" \"message\" \"patched\" }")]),
            )
            .unwrap(),
        );
        let w = &load(&bsp, &fs, LoaderSettings::default())[0];
        assert_eq!(parse_worldspawn_key(&w.data.entities, "message").as_deref(), Some("patched"));

        let settings = LoaderSettings {
            external_ents: false,
            ..LoaderSettings::default()
        };
        let w = &load(&bsp, &fs, settings)[0];
        assert_eq!(parse_worldspawn_key(&w.data.entities, "message"), None);
    }

    #[test]
    fn test_bspx_rgb_lighting_and_lmstyle() {
        let builder = BspBuilder::two_room_world();
        let n = builder.light_samples();
        let rgb: Vec<u8> = (0..n).flat_map(|_| [200u8, 100, 50]).collect();
        let bsp = builder
            .with_bspx(BSPX_RGBLIGHTING, rgb)
            .with_bspx(BSPX_LMSTYLE, vec![0u8, 5, 255])
            .build();
        let fs = FileSystem::new();
        let w = &load(&bsp, &fs, LoaderSettings::default())[0];
        match &w.data.lightdata {
            LightData::Ldr(d) => assert_eq!(&d[..3], &[200, 100, 50]),
            other => panic!("unexpected {:?}", other),
        }
        let s = &w.data.surfaces[0];
        assert_eq!(s.styles, [0, 5, INVALID_LIGHTSTYLE, INVALID_LIGHTSTYLE]);
        // two styles no longer fit in the lighting lump
        assert!(s.samples.is_none());
    }

    #[test]
    fn test_marksurface_out_of_range_is_error() {
        let bsp = BspBuilder::two_room_world().with_marksurface(7).build();
        let fs = FileSystem::new();
        let env = LoadEnv::new(&fs, LoaderSettings::default());
        assert!(matches!(
            load_brush_model("maps/test.bsp", &bsp, 1, &env),
            Err(LoadError::BadIndex { what: "marksurface", .. })
        ));
    }

    #[test]
    fn test_funny_lump_size() {
        let bsp = BspBuilder::two_room_world().with_raw_lump(LUMP_PLANES, vec![0u8; 21]).build();
        let fs = FileSystem::new();
        let env = LoadEnv::new(&fs, LoaderSettings::default());
        assert!(matches!(
            load_brush_model("maps/test.bsp", &bsp, 1, &env),
            Err(LoadError::FunnyLumpSize { .. })
        ));
    }

    #[test]
    fn test_water_vis() {
        let fs = FileSystem::new();

        // a water leaf that sees the empty leaf
        let bsp = BspBuilder::two_room_world().with_water_room(true).build();
        let w = &load(&bsp, &fs, LoaderSettings::default())[0];
        assert!(w.data.contents_transparent.contains(SurfFlags::DRAWWATER));

        // a water leaf that sees nothing else
        let bsp = BspBuilder::two_room_world().with_water_room(false).build();
        let w = &load(&bsp, &fs, LoaderSettings::default())[0];
        assert!(!w.data.contents_transparent.contains(SurfFlags::DRAWWATER));
        // never observed, assumed transparent
        assert!(w.data.contents_transparent.contains(SurfFlags::DRAWLAVA));

        let settings = LoaderSettings {
            novis: true,
            ..LoaderSettings::default()
        };
        let w = &load(&bsp, &fs, settings)[0];
        assert_eq!(w.data.contents_transparent, SurfFlags::LIQUID_TYPES);
    }

    #[test]
    fn test_external_vis_patch() {
        let builder = BspBuilder::two_room_world();
        let bsp = builder.build();

        // patch: both leafs see nothing
        let mut entry = Vec::new();
        let vis = vec![0x00u8, 0x01, 0x00, 0x01];
        entry.extend_from_slice(&(vis.len() as i32).to_le_bytes());
        entry.extend_from_slice(&vis);
        let leafs = builder.leaf_lump_with_visofs(&[-1, 0, 2]);
        entry.extend_from_slice(&(leafs.len() as i32).to_le_bytes());
        entry.extend_from_slice(&leafs);

        let mut patch = Vec::new();
        let mut mapname = [0u8; 32];
        mapname[..8].copy_from_slice(b"TEST.BSP");
        patch.extend_from_slice(&mapname);
        patch.extend_from_slice(&(entry.len() as i32).to_le_bytes());
        patch.extend_from_slice(&entry);

        let mut fs = FileSystem::new();
        fs.add_pack(Pack::from_bytes("a.pak", build_pack(&[("maps/test.vis", &patch)])).unwrap());
        let env = LoadEnv::new(&fs, LoaderSettings::default()).with_server_map("test");
        let w = &load_brush_model("maps/test.bsp", &bsp, 1, &env).unwrap()[0];
        assert_eq!(w.data.visdata, vis);
        assert_eq!(w.data.leafs[1].compressed_vis, Some(0));

        // not the server map: patch ignored
        let env = LoadEnv::new(&fs, LoaderSettings::default()).with_server_map("other");
        let w = &load_brush_model("maps/test.bsp", &bsp, 1, &env).unwrap()[0];
        assert_ne!(w.data.visdata, vis);
    }

    #[test]
    fn test_submodel_setup() {
        let bsp = BspBuilder::two_room_world().with_door_submodel().build();
        let fs = FileSystem::new();
        let models = load(&bsp, &fs, LoaderSettings::default());
        assert_eq!(models.len(), 2);
        let door = &models[1];
        assert_eq!(door.submodel_index, 1);
        assert_eq!(door.nummodelsurfaces, 1);
        assert_eq!(door.rmins, [-door.radius; 3]);
        assert_eq!(door.clipmins, door.mins);
    }
}
