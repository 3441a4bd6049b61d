// rmain.rs — world renderer front end: map setup, surface marking and draw entry points

use std::sync::Arc;

use q1bsp_common::common::{com_dprintf, com_printf};
use q1bsp_common::files::FileSystem;
use q1bsp_common::model::{BrushData, BrushModel, SurfFlags};
use q1bsp_common::q_shared::{vector_add, vector_subtract, Contents, Vec3};

use crate::gpu::{upload_brush_vertices, BufferId, Capabilities, GpuBackend};
use crate::light::{self, build_light_map, mark_lights, model_headnode, push_dlights, DLight, EntityPose, LightContext,
    LightStyles, SurfaceLight, MAX_DLIGHTS};
use crate::lightmap::{AtlasError, LightmapAtlas, BLOCK_HEIGHT, BLOCK_WIDTH};
use crate::rsurf::{
    back_face_cull, build_surface_display_list, create_surface_lightmap, draw_chains_showtris, draw_chains_water,
    draw_texture_chains, faces_viewer, ChainContext, ChainKind, Frustum, SurfaceGeometry, TextureChains,
};
use crate::scenecache::{CacheFrame, QueueInput, SceneCache};
use crate::settings::{LightmapFormat, RenderSettings, SceneCacheMode};
use crate::textures::{upload_textures, Palette, TextureHandles};

/// Radius of the fat PVS used near water portals or when the scene cache
/// is on.
const FAT_PVS_RADIUS: f32 = 8.0;
/// Lightmap area, in 128x128 blocks, that old renderers could hold.
const STANDARD_LIGHTMAP_LIMIT: usize = 64;

/// A brush model placed in the scene.
#[derive(Debug, Clone)]
pub struct BrushEntity {
    pub model: BrushModel,
    pub pose: EntityPose,
    /// Non-zero selects alternate texture animations.
    pub frame: i32,
    /// Opacity override; `None` draws the model opaque.
    pub alpha: Option<f32>,
    pub effects: i32,
    /// Attached to the view rather than the world.
    pub viewmodel: bool,
}

impl BrushEntity {
    pub fn new(model: BrushModel) -> Self {
        Self {
            model,
            pose: EntityPose::default(),
            frame: 0,
            alpha: None,
            effects: 0,
            viewmodel: false,
        }
    }

    /// World-space bounds, widened for rotation.
    pub fn bounds(&self) -> (Vec3, Vec3) {
        let m = &self.model;
        let a = &self.pose.angles;
        let (mins, maxs) = if a[0] != 0.0 || a[2] != 0.0 {
            (m.rmins, m.rmaxs)
        } else if a[1] != 0.0 {
            (m.ymins, m.ymaxs)
        } else {
            (m.mins, m.maxs)
        };
        (vector_add(&self.pose.origin, &mins), vector_add(&self.pose.origin, &maxs))
    }
}

/// Per-map render state of one brush data set (the world or a standalone
/// brush model file).
pub struct ModelState {
    pub data: Arc<BrushData>,
    pub geometry: Arc<Vec<SurfaceGeometry>>,
    pub lights: Vec<SurfaceLight>,
    pub visframe: Vec<i32>,
    pub chains: TextureChains,
    pub textures: Vec<TextureHandles>,
}

impl ModelState {
    fn new(data: Arc<BrushData>, textures: Vec<TextureHandles>) -> Self {
        let n = data.surfaces.len();
        Self {
            geometry: Arc::new(vec![SurfaceGeometry::default(); n]),
            lights: vec![SurfaceLight::default(); n],
            visframe: vec![0; n],
            chains: TextureChains::new(data.textures.len()),
            textures,
            data,
        }
    }
}

/// Rebuilds one surface's lightmap if its styles or dlights changed.
fn relight_surface(
    data: &BrushData,
    s: usize,
    geometry: &[SurfaceGeometry],
    light: &mut SurfaceLight,
    atlas: &mut LightmapAtlas,
    ctx: &LightContext,
    dynamic: bool,
) {
    let surf = &data.surfaces[s];
    if surf.flags.contains(SurfFlags::DRAWTILED) {
        return;
    }
    let Some(slot) = geometry.get(s).and_then(|g| g.lightmap) else {
        return;
    };
    if !dynamic || !light.needs_rebuild(surf, ctx.styles, ctx.framecount) {
        return;
    }
    let ([smax, tmax], _) = surf.lightmap_size();
    atlas.mark_dirty(slot, smax, tmax);
    let stride = atlas.stride();
    if let Some(dest) = atlas.texels_mut(slot) {
        build_light_map(data, surf, light, ctx, dest, stride);
    }
}

/// Draw context for a model's world-space chains; callers override the
/// entity fields.
fn chain_context<'a>(
    state: &'a ModelState,
    atlas: &'a LightmapAtlas,
    settings: &'a RenderSettings,
    caps: Capabilities,
    time: f64,
) -> ChainContext<'a> {
    ChainContext {
        data: &state.data,
        geometry: &state.geometry,
        textures: &state.textures,
        atlas,
        settings,
        caps,
        frame: 0,
        time,
        alpha: None,
        pose: EntityPose::default(),
    }
}

pub struct Renderer<B: GpuBackend> {
    pub gpu: B,
    pub settings: RenderSettings,
    caps: Capabilities,
    pub atlas: LightmapAtlas,
    world: Option<BrushModel>,
    /// Index 0 is the world once a map is loaded.
    models: Vec<ModelState>,
    vertex_buffer: Option<BufferId>,
    pub styles: LightStyles,
    pub dlights: Vec<DLight>,
    pub time: f64,
    framecount: i32,
    visframecount: i32,
    hostframe: i32,
    pub vieworg: Vec3,
    pub frustum: Frustum,
    /// Surfaces submitted this frame.
    pub brushpolys: usize,
    scene_cache: SceneCache,
    /// The scene cache owns lightmap uploads while it is drawing.
    skip_lightmap_updates: bool,
}

impl<B: GpuBackend> Renderer<B> {
    pub fn new(gpu: B, settings: RenderSettings) -> Self {
        let caps = gpu.capabilities();
        Self {
            gpu,
            settings,
            caps,
            atlas: LightmapAtlas::new(LightmapFormat::Rgba8),
            world: None,
            models: Vec::new(),
            vertex_buffer: None,
            styles: LightStyles::new(),
            dlights: Vec::new(),
            time: 0.0,
            framecount: 0,
            visframecount: 0,
            hostframe: 0,
            vieworg: [0.0; 3],
            frustum: Frustum::default(),
            brushpolys: 0,
            scene_cache: SceneCache::new(),
            skip_lightmap_updates: false,
        }
    }

    pub fn world(&self) -> Option<&BrushModel> {
        self.world.as_ref()
    }

    pub fn model_state(&self, data: &Arc<BrushData>) -> Option<&ModelState> {
        self.models.iter().find(|m| Arc::ptr_eq(&m.data, data))
    }

    fn model_index(&self, data: &Arc<BrushData>) -> Option<usize> {
        self.models.iter().position(|m| Arc::ptr_eq(&m.data, data))
    }

    pub fn vertex_buffer(&self) -> Option<BufferId> {
        self.vertex_buffer
    }

    pub fn scene_cache(&self) -> &SceneCache {
        &self.scene_cache
    }

    pub fn set_lightstyle(&mut self, idx: usize, map: &str) {
        self.styles.update(idx, map);
    }

    /// Applies a new settings snapshot. A change of overbright rebakes every
    /// lightmap.
    pub fn set_settings(&mut self, settings: RenderSettings) {
        let rebuild = settings.overbright != self.settings.overbright;
        self.settings = settings;
        if rebuild {
            self.rebuild_all_lightmaps();
        }
    }

    /// Takes over a freshly loaded map. `others` are standalone brush
    /// models (ammo boxes and the like); inline submodels share the
    /// world's data and need no entry.
    pub fn new_map(&mut self, fs: &FileSystem, palette: &Palette, world: BrushModel, others: &[BrushModel]) -> Result<(), AtlasError> {
        if let Some(old) = self.world.take() {
            self.scene_cache.cleanup(&mut self.gpu, &old.data);
        }
        self.models.clear();

        for m in std::iter::once(&world).chain(others) {
            if !m.is_world() || self.model_index(&m.data).is_some() {
                continue;
            }
            let textures = upload_textures(&mut self.gpu, fs, &m.data, palette, self.settings.load24bit);
            self.models.push(ModelState::new(Arc::clone(&m.data), textures));
        }
        self.world = Some(world);
        self.build_lightmaps()
    }

    /// Packs and bakes the lightmaps of every loaded model, then builds
    /// the shared vertex buffer.
    pub fn build_lightmaps(&mut self) -> Result<(), AtlasError> {
        self.scene_cache.release(&mut self.gpu);
        self.framecount = 1;

        let hdr = self.world.as_ref().is_some_and(|w| w.data.is_hdr());
        let format = LightmapFormat::resolve(&self.settings.lightmap_format, self.caps.hdr_lightmaps && hdr);
        self.atlas.reset(format);

        let ctx = LightContext {
            styles: &self.styles,
            dlights: &self.dlights,
            pose: EntityPose::default(),
            framecount: self.framecount,
            format,
            overbright: self.settings.overbright,
        };

        let mut vertices = Vec::new();
        for m in &mut self.models {
            let mut geometry = Vec::with_capacity(m.data.surfaces.len());
            for (i, surf) in m.data.surfaces.iter().enumerate() {
                let lightmap = create_surface_lightmap(&m.data, surf, &mut self.atlas, &mut m.lights[i], &ctx)?;
                let first_vertex = vertices.len() as u32;
                vertices.extend(build_surface_display_list(&m.data, surf, lightmap, self.settings.brokenturbbias));
                geometry.push(SurfaceGeometry { lightmap, first_vertex });
            }
            m.geometry = Arc::new(geometry);
        }

        self.atlas.upload_all(&mut self.gpu);

        let blocks = self.atlas.page_count() * (BLOCK_WIDTH / 128) * (BLOCK_HEIGHT / 128);
        if blocks > STANDARD_LIGHTMAP_LIMIT {
            com_dprintf(&format!("WARNING: {} lightmaps exceeds standard limit of 64.\n", blocks));
        }

        if let Some(old) = self.vertex_buffer.take() {
            self.gpu.delete_buffer(old);
        }
        self.vertex_buffer = Some(upload_brush_vertices(&mut self.gpu, &vertices));
        Ok(())
    }

    /// Re-bakes every lightmap with the current settings and re-sends the
    /// pages.
    pub fn rebuild_all_lightmaps(&mut self) {
        if self.world.is_none() {
            return;
        }
        let ctx = LightContext {
            styles: &self.styles,
            dlights: &self.dlights,
            pose: EntityPose::default(),
            framecount: self.framecount,
            format: self.atlas.format(),
            overbright: self.settings.overbright,
        };
        for m in &mut self.models {
            for (i, surf) in m.data.surfaces.iter().enumerate() {
                if surf.flags.contains(SurfFlags::DRAWTILED) {
                    continue;
                }
                let Some(slot) = m.geometry.get(i).and_then(|g| g.lightmap) else {
                    continue;
                };
                let ([smax, tmax], _) = surf.lightmap_size();
                self.atlas.mark_dirty(slot, smax, tmax);
                let stride = self.atlas.stride();
                if let Some(dest) = self.atlas.texels_mut(slot) {
                    build_light_map(&m.data, surf, &mut m.lights[i], &ctx, dest, stride);
                }
            }
        }
        self.atlas.upload_all_dirty(&mut self.gpu);
    }

    /// Sends modified lightmap rows, unless the scene cache is in charge.
    pub fn upload_lightmaps(&mut self) {
        if self.skip_lightmap_updates {
            return;
        }
        self.atlas.upload_all_dirty(&mut self.gpu);
    }

    /// Starts a frame: advances counters and animates light styles.
    pub fn begin_frame(&mut self, time: f64, vieworg: Vec3, frustum: Frustum) {
        self.time = time;
        self.framecount += 1;
        self.hostframe += 1;
        self.vieworg = vieworg;
        self.frustum = frustum;
        self.brushpolys = 0;
        self.styles.animate(time, self.settings.style_mode);
    }

    /// Rebakes a marked surface's lightmap when its light changed.
    pub fn render_dynamic_lightmaps(&mut self, model: usize, s: usize, pose: EntityPose) {
        let Some(m) = self.models.get_mut(model) else {
            return;
        };
        let ctx = LightContext {
            styles: &self.styles,
            dlights: &self.dlights,
            pose,
            framecount: self.framecount,
            format: self.atlas.format(),
            overbright: self.settings.overbright,
        };
        relight_surface(&m.data, s, &m.geometry, &mut m.lights[s], &mut self.atlas, &ctx, self.settings.dynamic);
    }

    /// Builds the world's texture chains for the current view. When the
    /// scene cache takes the frame the chains stay empty.
    pub fn mark_surfaces(&mut self, entities: &[BrushEntity]) {
        let Some(world) = self.world.clone() else {
            return;
        };
        let Some(w) = self.model_index(&world.data) else {
            return;
        };
        let data = Arc::clone(&world.data);

        let viewleaf = world.point_in_leaf(&self.vieworg);
        let leaf = &data.leafs[viewleaf];

        // check this leaf for water portals; the scene cache always takes the
        // fat PVS so its entries cover nearby viewpoints too
        let marks = data
            .marksurfaces
            .get(leaf.firstmarksurface..leaf.firstmarksurface + leaf.nummarksurfaces)
            .unwrap_or(&[]);
        let nearwaterportal = self.settings.scenecache != SceneCacheMode::Off
            || marks.iter().any(|&s| data.surfaces[s].flags.contains(SurfFlags::DRAWTURB));

        let vis = if self.settings.novis || leaf.contents == Contents::Solid || leaf.contents == Contents::Sky {
            world.novis_pvs()
        } else if nearwaterportal {
            world.fat_pvs(&self.vieworg, FAT_PVS_RADIUS)
        } else {
            world.leaf_pvs(viewleaf)
        };

        self.visframecount += 1;
        self.models[w].chains.clear(ChainKind::World);

        let queued = {
            let m = &self.models[w];
            self.scene_cache.queue(&QueueInput {
                world: &world,
                entities,
                geometry: &m.geometry,
                lights: &m.lights,
                styles: &self.styles,
                dlights: &self.dlights,
                settings: &self.settings,
                format: self.atlas.format(),
                lightmap_pages: self.atlas.page_count(),
                pvs: &vis,
                vieworg: self.vieworg,
                time: self.time,
                framecount: self.framecount,
                hostframe: self.hostframe,
            })
        };
        if queued {
            self.skip_lightmap_updates = true;
            return;
        }
        self.skip_lightmap_updates = false;

        push_dlights(&world, &self.dlights, self.time, self.framecount, &mut self.models[w].lights);

        for i in 0..world.numleafs {
            if vis.get(i >> 3).map_or(true, |b| b & (1 << (i & 7)) == 0) {
                continue;
            }
            let Some(leaf) = data.leafs.get(i + 1) else {
                break;
            };
            if self.frustum.cull_box(&leaf.mins, &leaf.maxs) {
                continue;
            }
            if leaf.contents == Contents::Sky && !self.settings.oldskyleaf {
                continue;
            }
            let marks = data
                .marksurfaces
                .get(leaf.firstmarksurface..leaf.firstmarksurface + leaf.nummarksurfaces)
                .unwrap_or(&[]);
            for &s in marks {
                if self.models[w].visframe[s] == self.visframecount {
                    continue;
                }
                self.models[w].visframe[s] = self.visframecount;
                let surf = &data.surfaces[s];
                if self.frustum.cull_box(&surf.mins, &surf.maxs)
                    || back_face_cull(&data.planes[surf.plane], surf.flags, &self.vieworg)
                {
                    continue;
                }
                self.brushpolys += 1;
                self.models[w].chains.chain_surface(&data, s, ChainKind::World);
                self.render_dynamic_lightmaps(w, s, EntityPose::default());
            }
        }
    }

    /// Draws a brush entity through the model chain, unless the scene cache
    /// already baked it into the world.
    pub fn draw_brush_model(&mut self, e: &BrushEntity) -> Result<(), AtlasError> {
        let model = &e.model;
        if self.scene_cache.skips_submodel(model) {
            return Ok(());
        }
        let Some(mi) = self.model_index(&model.data) else {
            return Ok(());
        };
        let (mins, maxs) = e.bounds();
        if self.frustum.cull_box(&mins, &maxs) {
            return Ok(());
        }

        let modelorg = e.pose.to_local(&self.vieworg);
        let data = Arc::clone(&model.data);

        // calculate dynamic lighting for bmodel
        if model.firstmodelsurface != 0 {
            let head = model_headnode(model);
            for (k, dl) in self.dlights.iter().enumerate().take(MAX_DLIGHTS) {
                if !dl.is_active(self.time) {
                    continue;
                }
                let lightorg = vector_subtract(&dl.origin, &e.pose.origin);
                mark_lights(&data, head, dl, &lightorg, self.framecount, k, &mut self.models[mi].lights);
            }
        }

        self.models[mi].chains.clear(ChainKind::Model);
        for s in model.surfaces() {
            let surf = &data.surfaces[s];
            if !faces_viewer(&data.planes[surf.plane], surf.flags, &modelorg) {
                continue;
            }
            self.models[mi].chains.chain_surface(&data, s, ChainKind::Model);
            self.render_dynamic_lightmaps(mi, s, e.pose);
            self.brushpolys += 1;
        }

        self.upload_lightmaps();
        let ctx = ChainContext {
            frame: e.frame,
            alpha: e.alpha,
            pose: e.pose,
            ..chain_context(&self.models[mi], &self.atlas, &self.settings, self.caps, self.time)
        };
        let chains = &self.models[mi].chains;
        draw_texture_chains(&mut self.gpu, &ctx, chains, ChainKind::Model)?;
        draw_chains_water(&mut self.gpu, &ctx, chains, ChainKind::Model);
        Ok(())
    }

    fn cache_frame(&mut self, water: bool) -> Result<(), AtlasError> {
        let Some(world) = self.world.as_ref() else {
            return Ok(());
        };
        let Some(w) = self.models.iter().position(|m| Arc::ptr_eq(&m.data, &world.data)) else {
            return Ok(());
        };
        let m = &mut self.models[w];
        let mut frame = CacheFrame {
            atlas: &mut self.atlas,
            lights: &mut m.lights,
            textures: &m.textures,
            settings: &self.settings,
            time: self.time,
        };
        self.scene_cache.draw(&mut self.gpu, water, &mut frame)
    }

    /// Opaque world surfaces: the marked chains, then the cached batches.
    pub fn draw_world(&mut self) -> Result<(), AtlasError> {
        let Some(w) = self.world.as_ref().and_then(|world| self.model_index(&world.data)) else {
            return Ok(());
        };
        self.upload_lightmaps();
        let ctx = chain_context(&self.models[w], &self.atlas, &self.settings, self.caps, self.time);
        draw_texture_chains(&mut self.gpu, &ctx, &self.models[w].chains, ChainKind::World)?;

        self.cache_frame(false)?;
        self.brushpolys += self.scene_cache.brushpolys();
        Ok(())
    }

    /// Liquid world surfaces, after the opaque pass.
    pub fn draw_world_water(&mut self) -> Result<(), AtlasError> {
        let Some(w) = self.world.as_ref().and_then(|world| self.model_index(&world.data)) else {
            return Ok(());
        };
        let ctx = chain_context(&self.models[w], &self.atlas, &self.settings, self.caps, self.time);
        draw_chains_water(&mut self.gpu, &ctx, &self.models[w].chains, ChainKind::World);
        self.cache_frame(true)
    }

    /// Wireframe overlay of the marked world surfaces.
    pub fn draw_world_showtris(&mut self) {
        if !self.settings.showtris {
            return;
        }
        let Some(w) = self.world.as_ref().and_then(|world| self.model_index(&world.data)) else {
            return;
        };
        let ctx = chain_context(&self.models[w], &self.atlas, &self.settings, self.caps, self.time);
        draw_chains_showtris(&mut self.gpu, &ctx, &self.models[w].chains, ChainKind::World);
    }

    /// Light level at `p` for shading models.
    pub fn light_point(&self, p: &Vec3) -> (i32, Vec3) {
        match &self.world {
            Some(world) => light::light_point(world, &self.styles, p, self.settings.lightgrid),
            None => (0, [0.0; 3]),
        }
    }

    /// Stops the scene cache and frees its buffers.
    pub fn shutdown(&mut self) {
        self.scene_cache.release(&mut self.gpu);
        if self.world.is_some() {
            com_printf("world renderer shut down\n");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{DrawPass, IndexSource, Recorded, RecordingBackend};
    use crate::settings::StyleMode;
    use crate::test_support::load_models;
    use q1bsp_common::testutil::BspBuilder;

    const VIEW: Vec3 = [32.0, 32.0, 16.0];

    fn renderer(builder: BspBuilder, settings: RenderSettings) -> (Renderer<RecordingBackend>, Vec<BrushModel>) {
        let models = load_models(builder);
        let mut r = Renderer::new(RecordingBackend::default(), settings);
        r.set_lightstyle(0, "m");
        r.styles.animate(0.0, StyleMode::Animated);
        r.new_map(&FileSystem::new(), &Palette::grayscale(), models[0].clone(), &models[1..])
            .unwrap();
        (r, models)
    }

    fn uncached() -> RenderSettings {
        RenderSettings {
            scenecache: SceneCacheMode::Off,
            ..Default::default()
        }
    }

    #[test]
    fn test_build_lightmaps_and_vertex_buffer() {
        let (r, models) = renderer(BspBuilder::two_room_world().with_door_submodel(), uncached());
        assert_eq!(r.atlas.page_count(), 1);
        assert_eq!(r.gpu.lightmaps_created(), 1);
        assert!(r
            .gpu
            .events
            .iter()
            .any(|e| matches!(e, Recorded::Vertices { bytes, .. } if *bytes == 8 * 28)));

        let state = r.model_state(&models[0].data).unwrap();
        assert_eq!(state.geometry[0].first_vertex, 0);
        assert_eq!(state.geometry[1].first_vertex, 4);
        assert_eq!(&r.atlas.pages()[0].data[..4], &[66, 66, 66, 255]);
        assert!(r.vertex_buffer().is_some());
    }

    #[test]
    fn test_mark_and_draw_world() {
        let (mut r, _) = renderer(BspBuilder::two_room_world(), uncached());
        r.begin_frame(0.0, VIEW, Frustum::default());
        r.mark_surfaces(&[]);
        assert_eq!(r.brushpolys, 1);

        r.gpu.clear();
        r.draw_world().unwrap();
        let draws: Vec<_> = r.gpu.draws().collect();
        assert_eq!(draws.len(), 1);
        assert_eq!(draws[0].pass, DrawPass::Shaded);
        assert_eq!(draws[0].indices, IndexSource::Client(vec![0, 1, 2, 0, 2, 3]));
    }

    #[test]
    fn test_floor_seen_from_below_is_culled() {
        let (mut r, _) = renderer(BspBuilder::two_room_world(), uncached());
        r.begin_frame(0.0, [32.0, 32.0, -16.0], Frustum::default());
        r.mark_surfaces(&[]);
        assert_eq!(r.brushpolys, 0);
        r.gpu.clear();
        r.draw_world().unwrap();
        assert_eq!(r.gpu.draws().count(), 0);
    }

    #[test]
    fn test_dlight_relights_and_uploads() {
        let (mut r, _) = renderer(BspBuilder::two_room_world(), uncached());
        r.dlights.push(DLight::new([32.0, 32.0, 8.0], 200.0, [1.0; 3]));
        r.begin_frame(0.0, VIEW, Frustum::default());
        r.mark_surfaces(&[]);
        assert!(r.atlas.pages()[0].modified);

        r.gpu.clear();
        r.draw_world().unwrap();
        assert!(r.gpu.events.iter().any(|e| matches!(e, Recorded::UpdateLightmap { .. })));
        assert!(r.atlas.pages()[0].data[0] > 66);
    }

    #[test]
    fn test_overbright_toggle_rebuilds() {
        let (mut r, _) = renderer(BspBuilder::two_room_world(), uncached());
        r.gpu.clear();
        r.set_settings(RenderSettings {
            overbright: false,
            ..uncached()
        });
        assert_eq!(&r.atlas.pages()[0].data[..4], &[132, 132, 132, 255]);
        assert!(r.gpu.events.iter().any(|e| matches!(e, Recorded::UpdateLightmap { .. })));
    }

    #[test]
    fn test_brush_model_facing() {
        let (mut r, models) = renderer(BspBuilder::two_room_world().with_door_submodel(), uncached());
        let door = BrushEntity::new(models[1].clone());

        r.begin_frame(0.0, [48.0, 16.0, 16.0], Frustum::default());
        r.gpu.clear();
        r.draw_brush_model(&door).unwrap();
        let draws: Vec<_> = r.gpu.draws().collect();
        assert_eq!(draws.len(), 1);
        assert_eq!(draws[0].indices, IndexSource::Client(vec![4, 5, 6, 4, 6, 7]));

        r.begin_frame(0.1, [-10.0, 16.0, 16.0], Frustum::default());
        r.gpu.clear();
        r.draw_brush_model(&door).unwrap();
        assert_eq!(r.gpu.draws().count(), 0);
    }

    #[test]
    fn test_entity_alpha_reaches_draws() {
        let (mut r, models) = renderer(BspBuilder::two_room_world().with_door_submodel(), uncached());
        let door = BrushEntity {
            alpha: Some(0.5),
            pose: EntityPose {
                origin: [8.0, 0.0, 0.0],
                ..Default::default()
            },
            ..BrushEntity::new(models[1].clone())
        };
        r.begin_frame(0.0, [48.0, 16.0, 16.0], Frustum::default());
        r.gpu.clear();
        r.draw_brush_model(&door).unwrap();
        let draws: Vec<_> = r.gpu.draws().collect();
        assert_eq!(draws.len(), 1);
        assert_eq!(draws[0].alpha, 0.5);
        assert_eq!(draws[0].pose.origin, [8.0, 0.0, 0.0]);
    }

    #[test]
    fn test_scene_cache_takes_world_and_baked_doors() {
        let (mut r, models) = renderer(BspBuilder::two_room_world().with_door_submodel(), RenderSettings::default());
        let door = BrushEntity::new(models[1].clone());

        r.begin_frame(0.0, VIEW, Frustum::default());
        r.mark_surfaces(std::slice::from_ref(&door));
        r.gpu.clear();
        r.draw_world().unwrap();
        let draws: Vec<_> = r.gpu.draws().collect();
        assert_eq!(draws.len(), 1);
        assert!(matches!(draws[0].indices, IndexSource::Cached { count: 12, .. }));
        assert_eq!(r.brushpolys, 2);

        r.gpu.clear();
        r.draw_brush_model(&door).unwrap();
        assert_eq!(r.gpu.draws().count(), 0);
        r.shutdown();
    }

    #[test]
    fn test_water_and_showtris() {
        let settings = RenderSettings {
            showtris: true,
            ..uncached()
        };
        let (mut r, _) = renderer(BspBuilder::two_room_world().with_water_room(true), settings);
        r.begin_frame(0.0, VIEW, Frustum::default());
        r.mark_surfaces(&[]);
        r.gpu.clear();
        r.draw_world().unwrap();
        assert_eq!(r.gpu.draws().count(), 0);

        r.draw_world_water().unwrap();
        r.draw_world_showtris();
        let passes: Vec<_> = r.gpu.draws().map(|d| d.pass).collect();
        assert_eq!(passes, vec![DrawPass::Water, DrawPass::Tris]);
    }

    #[test]
    fn test_light_point_on_floor() {
        let (r, _) = renderer(BspBuilder::two_room_world().with_floor_node(), uncached());
        assert_eq!(r.light_point(&[32.0, 32.0, 16.0]), (66, [66.0; 3]));
    }
}
