// rsurf.rs — surface display lists, texture chains, culling and chain submission

use q1bsp_common::model::{BrushData, SurfFlags, Surface};
use q1bsp_common::model_texture::Texture;
use q1bsp_common::q_shared::{Plane, Vec3};

use crate::gpu::{BrushVertex, Capabilities, DrawCall, DrawPass, GpuBackend, IndexSource, TextureId};
use crate::light::{build_light_map, EntityPose, LightContext, SurfaceLight};
use crate::lightmap::{AtlasError, LightmapAtlas, LightmapSlot, BLOCK_HEIGHT, BLOCK_WIDTH};
use crate::settings::RenderSettings;
use crate::textures::TextureHandles;

/// Indices per client-side batch before it is drawn.
pub const MAX_BATCH_SIZE: usize = 65536;
/// Brush entity faces closer than this to edge-on are not drawn.
pub const BACKFACE_EPSILON: f32 = 0.01;
const MAX_ANIMATION_STEPS: usize = 100;

/// Placement of one surface in the shared vertex buffer and the atlas.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SurfaceGeometry {
    /// `None` for surfaces drawn without a lightmap (sky, unlit liquids).
    pub lightmap: Option<LightmapSlot>,
    pub first_vertex: u32,
}

impl SurfaceGeometry {
    pub fn page(&self) -> Option<usize> {
        self.lightmap.map(|s| s.page)
    }
}

// ============================================================
// Display lists
// ============================================================

#[inline]
fn dot4(v: &Vec3, vec: &[f32; 4]) -> f32 {
    v[0] * vec[0] + v[1] * vec[1] + v[2] * vec[2]
}

/// Builds the fan of interleaved vertices for one surface. Lightmap
/// coordinates address the surface's slot in its atlas page.
pub fn build_surface_display_list(
    data: &BrushData,
    surf: &Surface,
    slot: Option<LightmapSlot>,
    brokenturbbias: bool,
) -> Vec<BrushVertex> {
    let texinfo = &data.texinfo[surf.texinfo];
    let (width, height, shift) = data
        .texture(texinfo.texture)
        .map(|t| (t.width.max(1) as f32, t.height.max(1) as f32, t.shift))
        .unwrap_or((1.0, 1.0, 0));

    // unlit liquids were always warped without the texture offset
    let (s0, t0) = if surf.flags.contains(SurfFlags::DRAWTURB) && brokenturbbias {
        (0.0, 0.0)
    } else {
        (texinfo.vecs[0][3], texinfo.vecs[1][3])
    };
    let (light_s, light_t) = slot.map(|s| (s.s as f32, s.t as f32)).unwrap_or((0.0, 0.0));

    (0..surf.numedges)
        .map(|i| {
            let v = data.surface_vertex(surf, i);

            let mut s = (dot4(&v, &texinfo.vecs[0]) + s0) / width;
            let mut t = (dot4(&v, &texinfo.vecs[1]) + t0) / height;
            if shift > 0 {
                s /= (2 * shift) as f32;
                t /= (2 * shift) as f32;
            }

            let ls = (dot4(&v, &surf.lmvecs[0]) + surf.lmvecs[0][3] + 0.5 + light_s) / BLOCK_WIDTH as f32;
            let lt = (dot4(&v, &surf.lmvecs[1]) + surf.lmvecs[1][3] + 0.5 + light_t) / BLOCK_HEIGHT as f32;

            BrushVertex {
                xyz: v,
                st: [s, t],
                lm: [ls, lt],
            }
        })
        .collect()
}

/// Reserves atlas space for a surface and bakes its initial lightmap.
/// Tiled surfaces get no slot.
pub fn create_surface_lightmap(
    data: &BrushData,
    surf: &Surface,
    atlas: &mut LightmapAtlas,
    light: &mut SurfaceLight,
    ctx: &LightContext,
) -> Result<Option<LightmapSlot>, AtlasError> {
    if surf.flags.contains(SurfFlags::DRAWTILED) {
        return Ok(None);
    }
    let ([smax, tmax], _) = surf.lightmap_size();
    let slot = atlas.alloc_block(smax, tmax)?;
    let stride = atlas.stride();
    if let Some(dest) = atlas.texels_mut(slot) {
        build_light_map(data, surf, light, ctx, dest, stride);
    }
    Ok(Some(slot))
}

// ============================================================
// Texture animation
// ============================================================

/// Resolves the frame of an animated texture for the current time. `frame`
/// selects the alternate sequence of buttons and the like.
pub fn texture_animation(textures: &[Option<Texture>], base: usize, frame: i32, time: f64) -> Result<usize, AtlasError> {
    let lookup = |i: usize| textures.get(i).and_then(|t| t.as_ref());

    let mut index = base;
    let Some(mut tex) = lookup(index) else {
        return Ok(base);
    };

    if frame != 0 {
        if let Some(alt) = tex.alternate_anims {
            if let Some(t) = lookup(alt) {
                index = alt;
                tex = t;
            }
        }
    }

    if tex.anim_total == 0 {
        return Ok(index);
    }

    let relative = ((time * 10.0) as i32).rem_euclid(tex.anim_total);
    let mut count = 0;
    while tex.anim_min > relative || tex.anim_max <= relative {
        let next = tex.anim_next.ok_or(AtlasError::BrokenAnimationCycle)?;
        tex = lookup(next).ok_or(AtlasError::BrokenAnimationCycle)?;
        index = next;
        count += 1;
        if count > MAX_ANIMATION_STEPS {
            return Err(AtlasError::InfiniteAnimationCycle);
        }
    }
    Ok(index)
}

// ============================================================
// Texture chains
// ============================================================

/// Which pass a chain set belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainKind {
    World = 0,
    /// The brush entity currently being drawn.
    Model = 1,
}

/// Per-texture lists of the surfaces to draw this frame, one set per chain
/// kind.
#[derive(Debug, Default, Clone)]
pub struct TextureChains {
    chains: [Vec<Vec<usize>>; 2],
}

impl TextureChains {
    pub fn new(numtextures: usize) -> Self {
        Self {
            chains: [vec![Vec::new(); numtextures], vec![Vec::new(); numtextures]],
        }
    }

    /// Empties every list of `kind`, keeping their storage.
    pub fn clear(&mut self, kind: ChainKind) {
        for chain in &mut self.chains[kind as usize] {
            chain.clear();
        }
    }

    /// Appends a surface to the chain of its base texture.
    pub fn chain_surface(&mut self, data: &BrushData, surf: usize, kind: ChainKind) {
        let tex = data.surface_texture(&data.surfaces[surf]);
        let set = &mut self.chains[kind as usize];
        if set.len() <= tex {
            set.resize_with(tex + 1, Vec::new);
        }
        set[tex].push(surf);
    }

    pub fn chain(&self, kind: ChainKind, tex: usize) -> &[usize] {
        self.chains[kind as usize].get(tex).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Non-empty chains with their texture index.
    pub fn iter(&self, kind: ChainKind) -> impl Iterator<Item = (usize, &[usize])> + '_ {
        self.chains[kind as usize]
            .iter()
            .enumerate()
            .filter(|(_, c)| !c.is_empty())
            .map(|(i, c)| (i, c.as_slice()))
    }

    pub fn surface_count(&self, kind: ChainKind) -> usize {
        self.chains[kind as usize].iter().map(Vec::len).sum()
    }
}

// ============================================================
// Culling
// ============================================================

/// True when the viewer is behind the surface.
pub fn back_face_cull(plane: &Plane, flags: SurfFlags, vieworg: &Vec3) -> bool {
    let dot = plane.distance(vieworg);
    (dot < 0.0) ^ flags.contains(SurfFlags::PLANEBACK)
}

/// Brush entity variant: the surface must face `modelorg` by more than
/// `BACKFACE_EPSILON`.
pub fn faces_viewer(plane: &Plane, flags: SurfFlags, modelorg: &Vec3) -> bool {
    let dot = plane.distance(modelorg);
    if flags.contains(SurfFlags::PLANEBACK) {
        dot < -BACKFACE_EPSILON
    } else {
        dot > BACKFACE_EPSILON
    }
}

/// Returns 1 (front), 2 (back), or 3 (crossing) for a box vs. plane test.
pub fn box_on_plane_side(emins: &Vec3, emaxs: &Vec3, p: &Plane) -> i32 {
    // fast axial cases
    if p.is_axial() {
        let t = p.plane_type as usize;
        if p.dist <= emins[t] {
            return 1;
        }
        if p.dist >= emaxs[t] {
            return 2;
        }
        return 3;
    }

    // pick the box corners nearest and farthest along the normal
    let mut near = [0.0f32; 3];
    let mut far = [0.0f32; 3];
    for i in 0..3 {
        if p.signbits & (1 << i) != 0 {
            far[i] = emins[i];
            near[i] = emaxs[i];
        } else {
            far[i] = emaxs[i];
            near[i] = emins[i];
        }
    }
    let dist1 = p.normal[0] * far[0] + p.normal[1] * far[1] + p.normal[2] * far[2];
    let dist2 = p.normal[0] * near[0] + p.normal[1] * near[1] + p.normal[2] * near[2];

    let mut sides = 0;
    if dist1 >= p.dist {
        sides = 1;
    }
    if dist2 < p.dist {
        sides |= 2;
    }
    sides
}

/// View frustum planes facing inward. An empty frustum culls nothing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frustum {
    pub planes: Vec<Plane>,
}

impl Frustum {
    /// True if the box is completely outside the frustum.
    pub fn cull_box(&self, mins: &Vec3, maxs: &Vec3) -> bool {
        self.planes.iter().any(|p| box_on_plane_side(mins, maxs, p) == 2)
    }
}

// ============================================================
// Batching
// ============================================================

/// Appends the triangle-list indices of a convex fan.
pub fn triangle_indices(first_vertex: u32, numedges: usize, out: &mut Vec<u32>) {
    for i in 2..numedges as u32 {
        out.extend_from_slice(&[first_vertex, first_vertex + i - 1, first_vertex + i]);
    }
}

/// Indices owed by a fan of `numedges` vertices.
#[inline]
pub fn triangle_index_count(numedges: usize) -> usize {
    3 * numedges.saturating_sub(2)
}

/// Client-side index accumulator. Everything pushed between two flushes
/// shares the draw state of the flush.
#[derive(Debug, Default)]
pub struct Batch {
    indices: Vec<u32>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Adds a surface, drawing what is pending first if it would not fit.
    /// Empty fans and fans larger than a whole batch are dropped.
    pub fn push<B: GpuBackend + ?Sized>(&mut self, gpu: &mut B, state: &DrawCall, first_vertex: u32, numedges: usize) {
        let n = triangle_index_count(numedges);
        if n == 0 || n > MAX_BATCH_SIZE {
            return;
        }
        if self.indices.len() + n > MAX_BATCH_SIZE {
            self.flush(gpu, state);
        }
        triangle_indices(first_vertex, numedges, &mut self.indices);
    }

    pub fn flush<B: GpuBackend + ?Sized>(&mut self, gpu: &mut B, state: &DrawCall) {
        if self.indices.is_empty() {
            return;
        }
        let mut call = state.clone();
        call.indices = IndexSource::Client(std::mem::take(&mut self.indices));
        gpu.draw(call);
    }
}

// ============================================================
// Chain submission
// ============================================================

/// What the chain passes read besides the chains themselves.
#[derive(Clone, Copy)]
pub struct ChainContext<'a> {
    pub data: &'a BrushData,
    /// Indexed like `data.surfaces`.
    pub geometry: &'a [SurfaceGeometry],
    /// Indexed like `data.textures`.
    pub textures: &'a [TextureHandles],
    pub atlas: &'a LightmapAtlas,
    pub settings: &'a RenderSettings,
    pub caps: Capabilities,
    /// Entity frame, selects alternate texture animations.
    pub frame: i32,
    pub time: f64,
    /// Entity alpha override; `None` for the world.
    pub alpha: Option<f32>,
    pub pose: EntityPose,
}

impl<'a> ChainContext<'a> {
    fn entity_alpha(&self) -> f32 {
        self.alpha.unwrap_or(1.0)
    }

    fn animated(&self, tex: usize) -> Result<usize, AtlasError> {
        texture_animation(&self.data.textures, tex, self.frame, self.time)
    }

    fn handles(&self, tex: usize) -> TextureHandles {
        self.textures.get(tex).copied().unwrap_or_default()
    }

    fn lightmap_texture(&self, page: Option<usize>) -> Option<TextureId> {
        page.and_then(|p| self.atlas.page(p)).and_then(|p| p.texture)
    }

    /// Flags of a chain; every surface on it shares its texture's flags.
    fn chain_flags(&self, chain: &[usize]) -> SurfFlags {
        chain
            .first()
            .map(|&s| self.data.surfaces[s].flags)
            .unwrap_or_else(SurfFlags::empty)
    }

    fn state(&self, pass: DrawPass) -> DrawCall {
        let mut call = DrawCall::new(pass, IndexSource::Client(Vec::new()));
        call.pose = self.pose;
        call.alpha = self.entity_alpha();
        call.overbright = self.settings.overbright;
        call
    }

    fn push(&self, batch: &mut Batch, gpu: &mut (impl GpuBackend + ?Sized), state: &DrawCall, surf: usize) {
        let first_vertex = self.geometry.get(surf).map(|g| g.first_vertex).unwrap_or(0);
        batch.push(gpu, state, first_vertex, self.data.surfaces[surf].numedges);
    }
}

/// Shader path: diffuse, lightmap and fullbright in one pass, flushing
/// whenever the lightmap page changes.
pub fn draw_chains_glsl<B: GpuBackend + ?Sized>(
    gpu: &mut B,
    ctx: &ChainContext,
    chains: &TextureChains,
    kind: ChainKind,
) -> Result<(), AtlasError> {
    draw_chains_lightmapped(gpu, ctx, chains, kind, DrawPass::Shaded)
}

/// Fixed-function diffuse x lightmap. Same batching as the shader path but
/// without the fullbright layer.
pub fn draw_chains_multitexture<B: GpuBackend + ?Sized>(
    gpu: &mut B,
    ctx: &ChainContext,
    chains: &TextureChains,
    kind: ChainKind,
) -> Result<(), AtlasError> {
    draw_chains_lightmapped(gpu, ctx, chains, kind, DrawPass::Multitexture)
}

fn draw_chains_lightmapped<B: GpuBackend + ?Sized>(
    gpu: &mut B,
    ctx: &ChainContext,
    chains: &TextureChains,
    kind: ChainKind,
    pass: DrawPass,
) -> Result<(), AtlasError> {
    let mut batch = Batch::new();
    for (tex, chain) in chains.iter(kind) {
        let flags = ctx.chain_flags(chain);
        if flags.intersects(SurfFlags::DRAWTURB | SurfFlags::DRAWTILED | SurfFlags::NOTEXTURE) {
            continue;
        }

        let handles = ctx.handles(ctx.animated(tex)?);
        let mut state = ctx.state(pass);
        state.texture = handles.diffuse;
        if pass == DrawPass::Shaded && ctx.settings.fullbrights {
            state.fullbright = handles.fullbright;
        }
        state.alpha_test = flags.contains(SurfFlags::DRAWFENCE);

        let mut last_page = None;
        for &s in chain {
            let page = ctx.geometry.get(s).and_then(|g| g.page());
            if last_page != Some(page) {
                batch.flush(gpu, &state);
                state.lightmap = ctx.lightmap_texture(page);
                last_page = Some(page);
            }
            ctx.push(&mut batch, gpu, &state, s);
        }
        batch.flush(gpu, &state);
    }
    Ok(())
}

/// Diffuse only, one batch per texture.
pub fn draw_chains_texture_only<B: GpuBackend + ?Sized>(
    gpu: &mut B,
    ctx: &ChainContext,
    chains: &TextureChains,
    kind: ChainKind,
) -> Result<(), AtlasError> {
    let mut batch = Batch::new();
    for (tex, chain) in chains.iter(kind) {
        let flags = ctx.chain_flags(chain);
        if flags.intersects(SurfFlags::DRAWTURB | SurfFlags::DRAWSKY) {
            continue;
        }
        let mut state = ctx.state(DrawPass::TextureOnly);
        state.texture = ctx.handles(ctx.animated(tex)?).diffuse;
        state.alpha_test = flags.contains(SurfFlags::DRAWFENCE);
        for &s in chain {
            ctx.push(&mut batch, gpu, &state, s);
        }
        batch.flush(gpu, &state);
    }
    Ok(())
}

/// Surfaces whose texture was missing from the map, drawn with the
/// placeholder.
pub fn draw_chains_notexture<B: GpuBackend + ?Sized>(gpu: &mut B, ctx: &ChainContext, chains: &TextureChains, kind: ChainKind) {
    let mut batch = Batch::new();
    for (tex, chain) in chains.iter(kind) {
        if !ctx.chain_flags(chain).contains(SurfFlags::NOTEXTURE) {
            continue;
        }
        let mut state = ctx.state(DrawPass::TextureOnly);
        state.texture = ctx.handles(tex).diffuse;
        for &s in chain {
            ctx.push(&mut batch, gpu, &state, s);
        }
        batch.flush(gpu, &state);
    }
}

/// Lightmaps alone, grouped by atlas page.
pub fn draw_lightmap_chains<B: GpuBackend + ?Sized>(gpu: &mut B, ctx: &ChainContext, chains: &TextureChains, kind: ChainKind) {
    let mut by_page: Vec<Vec<usize>> = vec![Vec::new(); ctx.atlas.page_count()];
    for (_, chain) in chains.iter(kind) {
        for &s in chain {
            if let Some(page) = ctx.geometry.get(s).and_then(|g| g.page()) {
                if let Some(list) = by_page.get_mut(page) {
                    list.push(s);
                }
            }
        }
    }

    let mut batch = Batch::new();
    for (page, surfaces) in by_page.iter().enumerate() {
        if surfaces.is_empty() {
            continue;
        }
        let mut state = ctx.state(DrawPass::LightmapOnly);
        state.lightmap = ctx.lightmap_texture(Some(page));
        for &s in surfaces {
            ctx.push(&mut batch, gpu, &state, s);
        }
        batch.flush(gpu, &state);
    }
}

/// Tiled surfaces (sky, unlit liquids) as plain white in the lightmap view.
pub fn draw_chains_white<B: GpuBackend + ?Sized>(gpu: &mut B, ctx: &ChainContext, chains: &TextureChains, kind: ChainKind) {
    let mut batch = Batch::new();
    let state = ctx.state(DrawPass::Flat { color: [255, 255, 255] });
    for (_, chain) in chains.iter(kind) {
        if !ctx.chain_flags(chain).contains(SurfFlags::DRAWTILED) {
            continue;
        }
        for &s in chain {
            ctx.push(&mut batch, gpu, &state, s);
        }
    }
    batch.flush(gpu, &state);
}

/// Stable pseudo-random colour for a surface in the flat view.
pub fn flat_color(surf: usize) -> [u8; 3] {
    let mut x = (surf as u32).wrapping_add(1).wrapping_mul(0x9e37_79b9);
    x ^= x >> 15;
    x = x.wrapping_mul(0x85eb_ca6b);
    x ^= x >> 13;
    [(x >> 16) as u8, (x >> 8) as u8, x as u8]
}

/// One flat-coloured draw per surface.
pub fn draw_chains_drawflat<B: GpuBackend + ?Sized>(gpu: &mut B, ctx: &ChainContext, chains: &TextureChains, kind: ChainKind) {
    let mut batch = Batch::new();
    for (_, chain) in chains.iter(kind) {
        for &s in chain {
            let state = ctx.state(DrawPass::Flat { color: flat_color(s) });
            ctx.push(&mut batch, gpu, &state, s);
            batch.flush(gpu, &state);
        }
    }
}

/// Additive fullbright layer for textures that have one.
pub fn draw_chains_glow<B: GpuBackend + ?Sized>(
    gpu: &mut B,
    ctx: &ChainContext,
    chains: &TextureChains,
    kind: ChainKind,
) -> Result<(), AtlasError> {
    let mut batch = Batch::new();
    for (tex, chain) in chains.iter(kind) {
        let Some(glow) = ctx.handles(ctx.animated(tex)?).fullbright else {
            continue;
        };
        let mut state = ctx.state(DrawPass::Fullbright);
        state.texture = Some(glow);
        for &s in chain {
            ctx.push(&mut batch, gpu, &state, s);
        }
        batch.flush(gpu, &state);
    }
    Ok(())
}

/// Turbulent liquids. Lit liquids switch lightmap per page; the alpha
/// comes from the entity when it overrides it, else from the liquid type.
pub fn draw_chains_water<B: GpuBackend + ?Sized>(gpu: &mut B, ctx: &ChainContext, chains: &TextureChains, kind: ChainKind) {
    if ctx.settings.drawflat || ctx.settings.lightmap {
        return;
    }

    let mut batch = Batch::new();
    for (tex, chain) in chains.iter(kind) {
        let flags = ctx.chain_flags(chain);
        if !flags.contains(SurfFlags::DRAWTURB) {
            continue;
        }

        let mut state = ctx.state(DrawPass::Water);
        state.texture = ctx.handles(tex).diffuse;
        state.alpha = match ctx.alpha {
            Some(a) => a,
            None => ctx.settings.liquid_alpha.for_flags(flags),
        };

        if !ctx.caps.glsl {
            for &s in chain {
                ctx.push(&mut batch, gpu, &state, s);
            }
            batch.flush(gpu, &state);
            continue;
        }

        let mut last_page = None;
        for &s in chain {
            let page = ctx.geometry.get(s).and_then(|g| g.page());
            if last_page != Some(page) {
                batch.flush(gpu, &state);
                state.lightmap = if ctx.settings.fullbright { None } else { ctx.lightmap_texture(page) };
                last_page = Some(page);
            }
            ctx.push(&mut batch, gpu, &state, s);
        }
        batch.flush(gpu, &state);
    }
}

/// Wireframe overlay of every chained surface.
pub fn draw_chains_showtris<B: GpuBackend + ?Sized>(gpu: &mut B, ctx: &ChainContext, chains: &TextureChains, kind: ChainKind) {
    let mut batch = Batch::new();
    let state = ctx.state(DrawPass::Tris);
    for (_, chain) in chains.iter(kind) {
        for &s in chain {
            ctx.push(&mut batch, gpu, &state, s);
        }
    }
    batch.flush(gpu, &state);
}

/// Draws the opaque chains of `kind` through the path the settings and
/// backend capabilities select. Liquids are left to `draw_chains_water`.
pub fn draw_texture_chains<B: GpuBackend + ?Sized>(
    gpu: &mut B,
    ctx: &ChainContext,
    chains: &TextureChains,
    kind: ChainKind,
) -> Result<(), AtlasError> {
    let settings = ctx.settings;

    if settings.drawflat {
        draw_chains_drawflat(gpu, ctx, chains, kind);
        return Ok(());
    }

    if settings.fullbright {
        draw_chains_texture_only(gpu, ctx, chains, kind)?;
    } else if settings.lightmap {
        draw_lightmap_chains(gpu, ctx, chains, kind);
        draw_chains_white(gpu, ctx, chains, kind);
        return Ok(());
    } else {
        draw_chains_notexture(gpu, ctx, chains, kind);

        if ctx.caps.glsl {
            return draw_chains_glsl(gpu, ctx, chains, kind);
        }

        if ctx.caps.multitexture {
            draw_chains_multitexture(gpu, ctx, chains, kind)?;
        } else if ctx.entity_alpha() < 1.0 {
            // a second blended pass cannot be layered under entity alpha
            draw_chains_texture_only(gpu, ctx, chains, kind)?;
        } else {
            draw_chains_texture_only(gpu, ctx, chains, kind)?;
            draw_lightmap_chains(gpu, ctx, chains, kind);
        }
    }

    if settings.fullbrights {
        draw_chains_glow(gpu, ctx, chains, kind)?;
    }
    Ok(())
}
