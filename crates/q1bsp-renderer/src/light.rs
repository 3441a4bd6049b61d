// light.rs — light styles, dynamic lights, point sampling and lightmap baking

use q1bsp_common::model::{BrushData, BrushModel, LightData, NodeChild, SurfFlags, Surface};
use q1bsp_common::q_shared::*;
use q1bsp_common::qfiles::{INVALID_LIGHTSTYLE, MAXLIGHTMAPS};

use crate::settings::{LightmapFormat, StyleMode};

pub const MAX_LIGHTSTYLES: usize = 1024;
pub const MAX_STYLESTRING: usize = 64;
pub const MAX_DLIGHTS: usize = 64;
pub const DLIGHT_WORDS: usize = (MAX_DLIGHTS + 31) >> 5;

/// Value of a style with no string: full 8.8 brightness.
pub const STYLE_UNSET: i32 = 256;
/// Brightness step per character above 'a'. 'm' is 264.
pub const STYLE_STEP: i32 = 22;

/// Length of the downward probe used by `light_point`.
pub const LIGHT_PROBE_LENGTH: f32 = 8192.0;
/// Extra probe distance allowed past a lightmapped surface that has no samples.
const NEARBY_SEARCH: f32 = 8.0;

// ============================================================
// Light styles
// ============================================================

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LightStyle {
    pub map: Vec<u8>,
    pub average: u8,
    pub peak: u8,
}

/// Style strings and their current 8.8 brightness values.
#[derive(Debug, Clone)]
pub struct LightStyles {
    styles: Vec<LightStyle>,
    values: Vec<i32>,
}

impl Default for LightStyles {
    fn default() -> Self {
        Self::new()
    }
}

impl LightStyles {
    pub fn new() -> Self {
        Self {
            styles: vec![LightStyle::default(); MAX_LIGHTSTYLES],
            values: vec![STYLE_UNSET; MAX_LIGHTSTYLES],
        }
    }

    /// Sets a style string and precomputes its average and peak.
    /// Out-of-range indices are ignored.
    pub fn update(&mut self, idx: usize, s: &str) {
        let Some(style) = self.styles.get_mut(idx) else {
            return;
        };
        style.map = s.bytes().take(MAX_STYLESTRING - 1).collect();
        if style.map.is_empty() {
            style.average = b'm';
            style.peak = b'm';
            return;
        }
        let total: i32 = style.map.iter().map(|&c| c as i32 - b'a' as i32).sum();
        style.peak = style.map.iter().copied().fold(b'a', u8::max);
        style.average = (total / style.map.len() as i32 + b'a' as i32) as u8;
    }

    pub fn style(&self, idx: usize) -> Option<&LightStyle> {
        self.styles.get(idx)
    }

    /// Recomputes every value for `time` (seconds). Characters advance at 10Hz.
    pub fn animate(&mut self, time: f64, mode: StyleMode) {
        let frame = (time * 10.0) as i64;
        for (style, value) in self.styles.iter().zip(self.values.iter_mut()) {
            if style.map.is_empty() {
                *value = STYLE_UNSET;
                continue;
            }
            let c = match mode {
                StyleMode::Peak => style.peak,
                StyleMode::Average => style.average,
                StyleMode::Animated => style.map[frame.rem_euclid(style.map.len() as i64) as usize],
            };
            *value = (c as i32 - b'a' as i32) * STYLE_STEP;
        }
    }

    #[inline]
    pub fn value(&self, style: u16) -> i32 {
        self.values.get(style as usize).copied().unwrap_or(STYLE_UNSET)
    }

    pub fn values(&self) -> &[i32] {
        &self.values
    }
}

// ============================================================
// Dynamic lights
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DLight {
    pub key: i32,
    pub origin: Vec3,
    pub radius: f32,
    /// Client time at which the light stops.
    pub die: f64,
    pub decay: f32,
    pub minlight: f32,
    pub color: Vec3,
}

impl Default for DLight {
    fn default() -> Self {
        Self {
            key: 0,
            origin: [0.0; 3],
            radius: 0.0,
            die: 0.0,
            decay: 0.0,
            minlight: 0.0,
            color: [1.0; 3],
        }
    }
}

impl DLight {
    pub fn new(origin: Vec3, radius: f32, color: Vec3) -> Self {
        Self {
            origin,
            radius,
            color,
            die: f64::MAX,
            ..Default::default()
        }
    }

    #[inline]
    pub fn is_active(&self, time: f64) -> bool {
        !(self.die < time) && self.radius != 0.0
    }
}

/// Per-surface lighting cache: which dlights touch it this frame and the
/// style values its lightmap was last built with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SurfaceLight {
    pub dlightframe: i32,
    pub dlightbits: [u32; DLIGHT_WORDS],
    pub cached_light: [i32; MAXLIGHTMAPS],
    pub cached_dlight: bool,
}

impl SurfaceLight {
    #[inline]
    pub fn lit_by(&self, num: usize) -> bool {
        self.dlightbits[num >> 5] & (1u32 << (num & 31)) != 0
    }

    fn mark(&mut self, num: usize, framecount: i32) {
        if self.dlightframe != framecount {
            self.dlightbits = [0; DLIGHT_WORDS];
            self.dlightframe = framecount;
        }
        self.dlightbits[num >> 5] |= 1u32 << (num & 31);
    }

    /// True when the baked texels no longer match the current style values
    /// or dynamic lights.
    pub fn needs_rebuild(&self, surf: &Surface, styles: &LightStyles, framecount: i32) -> bool {
        let changed = active_styles(surf)
            .enumerate()
            .any(|(maps, style)| styles.value(style) != self.cached_light[maps]);
        changed || self.dlightframe == framecount || self.cached_dlight
    }
}

/// Where a brush entity sits. The world uses the identity pose.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EntityPose {
    pub origin: Vec3,
    pub angles: Vec3,
}

impl EntityPose {
    pub fn is_rotated(&self) -> bool {
        !vector_is_zero(&self.angles)
    }

    /// `p` expressed in the entity's local frame.
    pub fn to_local(&self, p: &Vec3) -> Vec3 {
        let temp = vector_subtract(p, &self.origin);
        if !self.is_rotated() {
            return temp;
        }
        let (forward, right, up) = angle_vectors_tuple(&self.angles);
        [dot_product(&temp, &forward), -dot_product(&temp, &right), dot_product(&temp, &up)]
    }
}

fn active_styles(surf: &Surface) -> impl Iterator<Item = u16> + '_ {
    surf.styles.iter().copied().take_while(|&s| s != INVALID_LIGHTSTYLE)
}

#[inline]
fn lm_dot(v: &Vec3, lmvec: &[f32; 4]) -> f32 {
    v[0] * lmvec[0] + v[1] * lmvec[1] + v[2] * lmvec[2] + lmvec[3]
}

/// The draw-tree node a model's surfaces hang from.
pub fn model_headnode(model: &BrushModel) -> NodeChild {
    let head = model.hulls[0].firstclipnode;
    if head < 0 || head as usize >= model.data.nodes.len() {
        NodeChild::Leaf(0)
    } else {
        NodeChild::Node(head as usize)
    }
}

/// Flags every surface within reach of `light` under `node`.
pub fn mark_lights(
    data: &BrushData,
    node: NodeChild,
    light: &DLight,
    lightorg: &Vec3,
    framecount: i32,
    num: usize,
    lights: &mut [SurfaceLight],
) {
    let mut node = node;
    loop {
        let NodeChild::Node(n) = node else {
            return;
        };
        let nd = &data.nodes[n];
        let dist = data.planes[nd.plane].distance(lightorg);

        if dist > light.radius {
            node = nd.children[0];
            continue;
        }
        if dist < -light.radius {
            node = nd.children[1];
            continue;
        }

        let maxdist = light.radius * light.radius;
        let normal = &data.planes[nd.plane].normal;
        for i in nd.firstsurface..nd.firstsurface + nd.numsurfaces {
            let surf = &data.surfaces[i];
            let impact = [
                lightorg[0] - normal[0] * dist,
                lightorg[1] - normal[1] * dist,
                lightorg[2] - normal[2] * dist,
            ];
            // clamp center of light to corner and check brightness
            let l = lm_dot(&impact, &surf.lmvecs[0]);
            let s = (l - ((l as i32).clamp(0, surf.extents[0].max(0))) as f32) as i32;
            let l = lm_dot(&impact, &surf.lmvecs[1]);
            let t = (l - ((l as i32).clamp(0, surf.extents[1].max(0))) as f32) as i32;

            if (s as f32) * (s as f32) + (t as f32) * (t as f32) + dist * dist < maxdist {
                if let Some(state) = lights.get_mut(i) {
                    state.mark(num, framecount);
                }
            }
        }

        for child in nd.children {
            if matches!(child, NodeChild::Node(_)) {
                mark_lights(data, child, light, lightorg, framecount, num, lights);
            }
        }
        return;
    }
}

/// Marks the world surfaces touched by every live dynamic light.
pub fn push_dlights(world: &BrushModel, dlights: &[DLight], time: f64, framecount: i32, lights: &mut [SurfaceLight]) {
    let head = model_headnode(world);
    for (i, l) in dlights.iter().enumerate().take(MAX_DLIGHTS) {
        if !l.is_active(time) {
            continue;
        }
        mark_lights(&world.data, head, l, &l.origin, framecount, i, lights);
    }
}

// ============================================================
// Point sampling
// ============================================================

/// Multiplier for a 9-bit mantissa under biased exponent `e`.
#[inline]
fn e5_scale(e: u32) -> f32 {
    2f32.powi(e as i32 - 24)
}

/// Unpacks an E5BGR9 word to linear RGB where 1.0 is nominal brightness.
pub fn decode_e5bgr9(w: u32) -> [f32; 3] {
    let e = e5_scale(w >> 27);
    [
        (w & 0x1ff) as f32 * e,
        ((w >> 9) & 0x1ff) as f32 * e,
        ((w >> 18) & 0x1ff) as f32 * e,
    ]
}

/// Packs 8.8 accumulators into E5BGR9. `identity` is the accumulator value
/// that maps to 1.0.
pub fn pack_e5bgr9(bl: &[u32], identity: f32) -> u32 {
    let m = bl[0].max(bl[1]).max(bl[2]) as f32 / identity;
    let mut e: i32 = 0;
    if m >= 0.5 {
        while m >= 2f32.powi(e) && e < 15 {
            e += 1;
        }
    } else {
        while m < 2f32.powi(e - 1) && e > -15 {
            e -= 1;
        }
    }
    let scale = 2f32.powi(e - 9) * identity;
    let q = |v: u32| ((v as f32 / scale + 0.5) as i32).clamp(0, 0x1ff) as u32;
    (((e + 15) as u32) << 27) | q(bl[0]) | (q(bl[1]) << 9) | (q(bl[2]) << 18)
}

/// Styled light at the four luxels around `(ds, dt)`, summed over styles.
/// Each corner truncates to an integer after every style, like the
/// lightmap accumulators.
fn corner_samples(data: &BrushData, surf: &Surface, first: usize, ds: i32, dt: i32, styles: &LightStyles) -> [[i32; 3]; 4] {
    let smax = (surf.extents[0] + 1) as usize;
    let size = smax * (surf.extents[1] + 1) as usize;
    let ds1 = (ds + 1).min(surf.extents[0]) as usize;
    let dt1 = (dt + 1).min(surf.extents[1]) as usize;
    let (ds, dt) = (ds as usize, dt as usize);
    let offs = [dt * smax + ds, dt * smax + ds1, dt1 * smax + ds, dt1 * smax + ds1];

    let mut acc = [[0i32; 3]; 4];
    for (maps, style) in active_styles(surf).enumerate() {
        let base = first + maps * size;
        match &data.lightdata {
            LightData::Ldr(bytes) => {
                let scale = styles.value(style) as f32 / 256.0;
                for (k, ofs) in offs.iter().enumerate() {
                    for c in 0..3 {
                        let v = bytes.get((base + ofs) * 3 + c).copied().unwrap_or(0) as f32;
                        acc[k][c] = (acc[k][c] as f32 + v * scale) as i32;
                    }
                }
            }
            LightData::Hdr(words) => {
                let scale = 128.0 * styles.value(style) as f32 / 256.0;
                for (k, ofs) in offs.iter().enumerate() {
                    let w = words.get(base + ofs).copied().unwrap_or(0);
                    let e = e5_scale(w >> 27) * scale;
                    for c in 0..3 {
                        let m = ((w >> (9 * c)) & 0x1ff) as f32;
                        acc[k][c] = (acc[k][c] as f32 + m * e) as i32;
                    }
                }
            }
            LightData::None => {}
        }
    }
    acc
}

/// Traces `start..end` down the draw tree and adds the bilinearly filtered
/// lightmap value of the first lit surface hit to `color`. Returns true once
/// a surface was hit.
pub fn recursive_light_point(
    data: &BrushData,
    styles: &LightStyles,
    node: NodeChild,
    rayorg: &Vec3,
    start: &Vec3,
    end: &Vec3,
    maxdist: &mut f32,
    color: &mut Vec3,
) -> bool {
    let mut node = node;
    let (n, front, back) = loop {
        let NodeChild::Node(n) = node else {
            return false;
        };
        let nd = &data.nodes[n];
        let plane = &data.planes[nd.plane];
        let front = plane.distance(start);
        let back = plane.distance(end);
        if (back < 0.0) == (front < 0.0) {
            node = nd.children[(front < 0.0) as usize];
            continue;
        }
        break (n, front, back);
    };
    let nd = &data.nodes[n];

    let frac = front / (front - back);
    let mid = [
        start[0] + (end[0] - start[0]) * frac,
        start[1] + (end[1] - start[1]) * frac,
        start[2] + (end[2] - start[2]) * frac,
    ];

    // near side first
    if recursive_light_point(data, styles, nd.children[(front < 0.0) as usize], rayorg, start, &mid, maxdist, color) {
        return true;
    }

    for surf in &data.surfaces[nd.firstsurface..nd.firstsurface + nd.numsurfaces] {
        if surf.flags.contains(SurfFlags::DRAWTILED) {
            continue;
        }

        // double precision keeps models near luxel edges from flickering
        let mut dsfrac = dot_product_f64(&mid, &surf.lmvecs[0][..3]) + surf.lmvecs[0][3] as f64;
        let mut dtfrac = dot_product_f64(&mid, &surf.lmvecs[1][..3]) + surf.lmvecs[1][3] as f64;
        if dsfrac < 0.0 || dtfrac < 0.0 {
            continue;
        }
        if dsfrac > surf.extents[0] as f64 || dtfrac > surf.extents[1] as f64 {
            continue;
        }
        let ds = dsfrac as i32;
        let dt = dtfrac as i32;
        dsfrac -= ds as f64;
        dtfrac -= dt as f64;

        let splane = &data.planes[surf.plane];
        let sfront = splane.distance(rayorg);
        let sback = splane.distance(end);
        let mut dist = sfront / (sfront - sback) * vector_length(&vector_subtract(end, rayorg));

        let Some(first) = surf.samples else {
            // lightmapped but sampleless: keep looking a little further
            dist += NEARBY_SEARCH;
            *maxdist = maxdist.min(dist);
            continue;
        };

        if dist < *maxdist {
            let [c00, c01, c10, c11] = corner_samples(data, surf, first, ds, dt, styles);
            for c in 0..3 {
                let top = (c01[c] - c00[c]) as f64 * dsfrac + c00[c] as f64;
                let bottom = (c11[c] - c10[c]) as f64 * dsfrac + c10[c] as f64;
                color[c] += ((bottom - top) * dtfrac + top) as i32 as f32;
            }
        }
        return true;
    }

    recursive_light_point(data, styles, nd.children[(front >= 0.0) as usize], rayorg, &mid, end, maxdist, color)
}

/// Light level at `p` for shading models: `(average, rgb)`. Maps without
/// light data are fully bright.
pub fn light_point(world: &BrushModel, styles: &LightStyles, p: &Vec3, use_grid: bool) -> (i32, Vec3) {
    let data = &world.data;
    if data.lightdata.is_none() {
        return (255, [255.0; 3]);
    }

    let color = match &data.lightgrid {
        Some(grid) if use_grid => grid.value(p, styles.values()),
        _ => {
            let mut maxdist = LIGHT_PROBE_LENGTH;
            let end = [p[0], p[1], p[2] - maxdist];
            let mut color = [0.0; 3];
            if !data.nodes.is_empty() {
                recursive_light_point(data, styles, NodeChild::Node(0), p, p, &end, &mut maxdist, &mut color);
            }
            color
        }
    };
    (((color[0] + color[1] + color[2]) / 3.0) as i32, color)
}

// ============================================================
// Lightmap baking
// ============================================================

/// Everything a lightmap rebuild reads besides the surface itself.
#[derive(Debug, Clone, Copy)]
pub struct LightContext<'a> {
    pub styles: &'a LightStyles,
    pub dlights: &'a [DLight],
    pub pose: EntityPose,
    pub framecount: i32,
    pub format: LightmapFormat,
    pub overbright: bool,
}

/// Adds every dlight flagged on the surface into the 8.8 accumulators.
/// Falloff uses `max + min/2` of the per-axis luxel distances, not the
/// Euclidean distance; baked maps rely on its shape.
pub fn add_dynamic_lights(
    surf: &Surface,
    plane: &Plane,
    light: &SurfaceLight,
    dlights: &[DLight],
    pose: &EntityPose,
    blocklights: &mut [u32],
) {
    let smax = (surf.extents[0] + 1).max(0) as usize;
    let tmax = (surf.extents[1] + 1).max(0) as usize;

    for (lnum, dl) in dlights.iter().enumerate().take(MAX_DLIGHTS) {
        if !light.lit_by(lnum) {
            continue;
        }

        let lightofs = pose.to_local(&dl.origin);
        let dist = dot_product(&lightofs, &plane.normal) - plane.dist;
        let rad = dl.radius - dist.abs();
        if rad < dl.minlight {
            continue;
        }
        let minlight = rad - dl.minlight;

        let impact = [
            lightofs[0] - plane.normal[0] * dist,
            lightofs[1] - plane.normal[1] * dist,
            lightofs[2] - plane.normal[2] * dist,
        ];
        let local = [lm_dot(&impact, &surf.lmvecs[0]), lm_dot(&impact, &surf.lmvecs[1])];
        let cred = dl.color[0] * 256.0;
        let cgreen = dl.color[1] * 256.0;
        let cblue = dl.color[2] * 256.0;

        let mut bl = 0;
        for t in 0..tmax {
            let td = (((local[1] - t as f32) * surf.lmvecscale[1]) as i32).abs();
            for s in 0..smax {
                let sd = (((local[0] - s as f32) * surf.lmvecscale[0]) as i32).abs();
                let d = if sd > td { sd + (td >> 1) } else { td + (sd >> 1) } as f32;
                if d < minlight {
                    let brightness = rad - d;
                    // negative colors darken, wrapping like the unsigned accumulators
                    blocklights[bl] = blocklights[bl].wrapping_add((brightness * cred) as i32 as u32);
                    blocklights[bl + 1] = blocklights[bl + 1].wrapping_add((brightness * cgreen) as i32 as u32);
                    blocklights[bl + 2] = blocklights[bl + 2].wrapping_add((brightness * cblue) as i32 as u32);
                }
                bl += 3;
            }
        }
    }
}

/// Combines the styled static samples and dynamic lights of one surface and
/// writes them to `dest` in the atlas format. `dest` starts at the
/// surface's first texel; rows are `stride` bytes apart.
pub fn build_light_map(
    data: &BrushData,
    surf: &Surface,
    light: &mut SurfaceLight,
    ctx: &LightContext,
    dest: &mut [u8],
    stride: usize,
) {
    light.cached_dlight = light.dlightframe == ctx.framecount;

    let ([smax, tmax], size) = surf.lightmap_size();
    let mut blocklights = vec![0u32; size * 3];

    if !data.lightdata.is_none() {
        if let Some(first) = surf.samples {
            for (maps, style) in active_styles(surf).enumerate() {
                let scale = ctx.styles.value(style);
                light.cached_light[maps] = scale;
                let base = first + maps * size;
                match &data.lightdata {
                    LightData::Ldr(bytes) => {
                        let scale = scale.max(0) as u32;
                        let src = bytes.get(base * 3..(base + size) * 3).unwrap_or(&[]);
                        for (bl, &b) in blocklights.iter_mut().zip(src) {
                            *bl += b as u32 * scale;
                        }
                    }
                    LightData::Hdr(words) => {
                        let src = words.get(base..base + size).unwrap_or(&[]);
                        for (bl, &w) in blocklights.chunks_exact_mut(3).zip(src) {
                            let e = e5_scale(w >> 27) * 128.0 * scale as f32;
                            for c in 0..3 {
                                let m = ((w >> (9 * c)) & 0x1ff) as f32;
                                bl[c] = (bl[c] as f32 + e * m) as u32;
                            }
                        }
                    }
                    LightData::None => {}
                }
            }
        }

        if light.dlightframe == ctx.framecount {
            add_dynamic_lights(surf, &data.planes[surf.plane], light, ctx.dlights, &ctx.pose, &mut blocklights);
        }
    } else {
        // no light data: fully bright, without saturating HDR
        blocklights.fill(0xffff);
    }

    let shift = if ctx.overbright { 8 } else { 7 };
    for t in 0..tmax {
        let row = &mut dest[t * stride..t * stride + smax * 4];
        let src = &blocklights[t * smax * 3..(t + 1) * smax * 3];
        for (texel, bl) in row.chunks_exact_mut(4).zip(src.chunks_exact(3)) {
            match ctx.format {
                LightmapFormat::Rgba8 | LightmapFormat::Bgra8 => {
                    let r = (bl[0] >> shift).min(255) as u8;
                    let g = (bl[1] >> shift).min(255) as u8;
                    let b = (bl[2] >> shift).min(255) as u8;
                    let rgba = if ctx.format == LightmapFormat::Rgba8 { [r, g, b, 255] } else { [b, g, r, 255] };
                    texel.copy_from_slice(&rgba);
                }
                LightmapFormat::E5bgr9 => {
                    let identity = (1u32 << (shift + 8)) as f32;
                    texel.copy_from_slice(&pack_e5bgr9(bl, identity).to_le_bytes());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::load_world;
    use q1bsp_common::qfiles::LUMP_LIGHTING;
    use q1bsp_common::testutil::BspBuilder;

    fn styles_with(idx: usize, s: &str) -> LightStyles {
        let mut styles = LightStyles::new();
        styles.update(idx, s);
        styles.animate(0.0, StyleMode::Animated);
        styles
    }

    #[test]
    fn test_style_values() {
        let mut styles = LightStyles::new();
        styles.update(0, "m");
        styles.update(1, "abc");
        styles.update(2, "");
        styles.animate(0.15, StyleMode::Animated);
        assert_eq!(styles.value(0), 264);
        assert_eq!(styles.value(1), 22);
        assert_eq!(styles.value(2), STYLE_UNSET);
        assert_eq!(styles.value(5000), STYLE_UNSET);

        styles.animate(0.15, StyleMode::Average);
        assert_eq!(styles.value(1), 22);
        styles.animate(0.15, StyleMode::Peak);
        assert_eq!(styles.value(1), 44);
        assert_eq!(styles.style(2).unwrap().peak, b'm');
    }

    #[test]
    fn test_style_wraps_and_ignores_bad_index() {
        let mut styles = LightStyles::new();
        styles.update(3, "az");
        styles.update(MAX_LIGHTSTYLES, "z");
        styles.animate(0.25, StyleMode::Animated);
        // frame 2 wraps back to 'a'
        assert_eq!(styles.value(3), 0);
        styles.animate(0.35, StyleMode::Animated);
        assert_eq!(styles.value(3), 25 * STYLE_STEP);
    }

    #[test]
    fn test_dlight_activity() {
        let mut l = DLight::new([0.0; 3], 100.0, [1.0; 3]);
        assert!(l.is_active(10.0));
        l.die = 5.0;
        assert!(!l.is_active(10.0));
        l.die = 20.0;
        l.radius = 0.0;
        assert!(!l.is_active(10.0));
    }

    #[test]
    fn test_mark_lights_reaches_floor() {
        let world = load_world(BspBuilder::two_room_world());
        let mut lights = vec![SurfaceLight::default(); world.data.surfaces.len()];
        let near = DLight::new([32.0, 32.0, 16.0], 100.0, [1.0; 3]);
        let far = DLight::new([500.0, 32.0, 16.0], 100.0, [1.0; 3]);

        push_dlights(&world, &[far, near], 0.0, 7, &mut lights);
        assert_eq!(lights[0].dlightframe, 7);
        assert!(lights[0].lit_by(1));
        assert!(!lights[0].lit_by(0));

        // a new frame resets the bits before marking
        push_dlights(&world, &[near], 0.0, 8, &mut lights);
        assert!(lights[0].lit_by(0));
        assert!(!lights[0].lit_by(1));
    }

    #[test]
    fn test_dynamic_falloff_is_not_euclidean() {
        let world = load_world(BspBuilder::two_room_world());
        let surf = &world.data.surfaces[0];
        let plane = &world.data.planes[surf.plane];
        let mut light = SurfaceLight::default();
        light.dlightbits[0] = 1;

        let dl = DLight::new([32.0, 32.0, 10.0], 100.0, [1.0; 3]);
        let mut bl = vec![0u32; 25 * 3];
        add_dynamic_lights(surf, plane, &light, &[dl], &EntityPose::default(), &mut bl);

        // luxel (2,2) sits under the light: rad 90, distance 0
        assert_eq!(bl[(2 * 5 + 2) * 3], 90 * 256);
        // corner: per-axis 32 units each, 32 + 16 = 48 rather than 45.25
        assert_eq!(bl[0], (90 - 48) * 256);
        assert_eq!(bl[(4 * 5 + 4) * 3 + 2], (90 - 48) * 256);
    }

    #[test]
    fn test_build_light_map_rgba_overbright() {
        let world = load_world(BspBuilder::two_room_world());
        let styles = styles_with(0, "m");
        let surf = &world.data.surfaces[0];
        let mut light = SurfaceLight::default();
        let mut ctx = LightContext {
            styles: &styles,
            dlights: &[],
            pose: EntityPose::default(),
            framecount: 1,
            format: LightmapFormat::Rgba8,
            overbright: true,
        };

        let stride = 8 * 4;
        let mut dest = vec![0u8; stride * 5];
        build_light_map(&world.data, surf, &mut light, &ctx, &mut dest, stride);
        // 64 * 264 >> 8
        assert_eq!(&dest[..4], &[66, 66, 66, 255]);
        assert_eq!(&dest[4 * stride + 16..4 * stride + 20], &[66, 66, 66, 255]);
        // bytes past the surface's width are untouched
        assert_eq!(dest[20], 0);
        assert_eq!(light.cached_light[0], 264);
        assert!(!light.cached_dlight);

        ctx.overbright = false;
        build_light_map(&world.data, surf, &mut light, &ctx, &mut dest, stride);
        assert_eq!(&dest[..4], &[132, 132, 132, 255]);
    }

    #[test]
    fn test_needs_rebuild_tracks_styles() {
        let world = load_world(BspBuilder::two_room_world());
        let mut styles = styles_with(0, "m");
        let surf = &world.data.surfaces[0];
        let mut light = SurfaceLight::default();
        let ctx = LightContext {
            styles: &styles,
            dlights: &[],
            pose: EntityPose::default(),
            framecount: 1,
            format: LightmapFormat::Bgra8,
            overbright: true,
        };
        let mut dest = vec![0u8; 20 * 5];
        build_light_map(&world.data, surf, &mut light, &ctx, &mut dest, 20);
        assert!(!light.needs_rebuild(surf, &styles, 2));

        styles.update(0, "a");
        styles.animate(0.0, StyleMode::Animated);
        assert!(light.needs_rebuild(surf, &styles, 2));
    }

    #[test]
    fn test_unlit_map_is_fullbright() {
        let world = load_world(BspBuilder::two_room_world().with_raw_lump(LUMP_LIGHTING, Vec::new()));
        let styles = styles_with(0, "m");
        assert_eq!(light_point(&world, &styles, &[32.0, 32.0, 16.0], true), (255, [255.0; 3]));

        let surf = &world.data.surfaces[0];
        let mut light = SurfaceLight::default();
        let ctx = LightContext {
            styles: &styles,
            dlights: &[],
            pose: EntityPose::default(),
            framecount: 1,
            format: LightmapFormat::Rgba8,
            overbright: true,
        };
        let mut dest = vec![0u8; 20 * 5];
        build_light_map(&world.data, surf, &mut light, &ctx, &mut dest, 20);
        assert_eq!(&dest[..4], &[255, 255, 255, 255]);
    }

    #[test]
    fn test_light_point_on_lit_floor() {
        let world = load_world(BspBuilder::two_room_world().with_floor_node());
        let styles = styles_with(0, "m");
        // 64 * 264 / 256 at the middle of the floor
        let (level, color) = light_point(&world, &styles, &[32.0, 32.0, 16.0], true);
        assert_eq!(level, 66);
        assert_eq!(color, [66.0; 3]);

        // below the floor nothing is hit
        let (level, _) = light_point(&world, &styles, &[32.0, 32.0, -16.0], true);
        assert_eq!(level, 0);
    }

    #[test]
    fn test_light_point_interpolates_between_luxels() {
        let mut lighting = vec![0u8; 25];
        lighting[2 * 5 + 2] = 100;
        lighting[2 * 5 + 3] = 200;
        let world = load_world(
            BspBuilder::two_room_world()
                .with_floor_node()
                .with_raw_lump(LUMP_LIGHTING, lighting),
        );
        let styles = styles_with(0, "");
        // half way between luxel 2 and 3 along s
        let (level, _) = light_point(&world, &styles, &[40.0, 32.0, 16.0], false);
        assert_eq!(level, 150);
    }

    #[test]
    fn test_e5bgr9_pack_decode() {
        let identity = (1u32 << 16) as f32;
        for v in [0.25f32, 1.0, 3.5, 100.0] {
            let acc = (v * identity) as u32;
            let w = pack_e5bgr9(&[acc, acc / 2, 0], identity);
            let rgb = decode_e5bgr9(w);
            assert!((rgb[0] - v).abs() / v < 0.01, "{} -> {:?}", v, rgb);
            assert!((rgb[1] - v / 2.0).abs() / v < 0.01);
            assert_eq!(rgb[2], 0.0);
        }
        assert_eq!(decode_e5bgr9(pack_e5bgr9(&[0, 0, 0], identity)), [0.0; 3]);
    }

    #[test]
    fn test_pose_to_local() {
        let pose = EntityPose {
            origin: [10.0, 0.0, 0.0],
            angles: [0.0, 90.0, 0.0],
        };
        let local = pose.to_local(&[10.0, 5.0, 0.0]);
        assert!((local[0] - 5.0).abs() < 1e-4);
        assert!(local[1].abs() < 1e-4);
        assert_eq!(EntityPose::default().to_local(&[1.0, 2.0, 3.0]), [1.0, 2.0, 3.0]);
    }
}
