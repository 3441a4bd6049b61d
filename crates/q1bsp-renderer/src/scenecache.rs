// scenecache.rs — worker thread that prebuilds per-PVS world index batches

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex, MutexGuard};
use thiserror::Error;

use q1bsp_common::cmodel::vis_row_bytes;
use q1bsp_common::common::{com_dprintf, com_printf};
use q1bsp_common::model::{BrushData, BrushModel, NodeChild, SurfFlags};
use q1bsp_common::q_shared::{dot_product, vector_is_zero, vector_subtract, Contents, Vec3};

use crate::gpu::{BufferId, DrawCall, DrawPass, GpuBackend, IndexSource};
use crate::light::{
    build_light_map, mark_lights, model_headnode, DLight, EntityPose, LightContext, LightStyles, SurfaceLight, MAX_DLIGHTS,
};
use crate::lightmap::{AtlasError, LightmapAtlas, LightmapSlot};
use crate::rmain::BrushEntity;
use crate::rsurf::{texture_animation, triangle_index_count, triangle_indices, SurfaceGeometry};
use crate::settings::{LightmapFormat, RenderSettings, SceneCacheMode};
use crate::textures::TextureHandles;

/// Entries unused for this many host frames may be recycled.
const MIN_REUSE_AGE: i32 = 3;
/// Slack added whenever a batch has to grow.
const BATCH_GROWTH: usize = 4096;
/// Squared distance charged for a mismatched set of baked brush entities.
const SUBMODEL_PENALTY: f32 = 100.0;

#[derive(Debug, Error)]
pub enum SceneCacheError {
    #[error("couldn't start the scene cache thread: {0}")]
    Spawn(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// Handed to the worker, or queued for it.
    Building,
    /// Batches are back on the main thread but not uploaded yet.
    Computed,
    /// Batches live in the entry's index buffer.
    Finished,
    /// Dropped from the queue before the worker picked it up.
    Discarded,
}

/// Lightmap texels rebuilt by the worker, waiting to be copied into the
/// atlas on the main thread.
#[derive(Debug, Clone)]
pub struct RelitSurface {
    pub surface: usize,
    pub slot: LightmapSlot,
    pub size: [usize; 2],
    pub light: SurfaceLight,
    /// `size[1]` rows of `size[0]` texels, tightly packed.
    pub texels: Vec<u8>,
}

/// Everything the worker needs, copied or shared at queue time so the main
/// thread can carry on changing its own state.
struct Job {
    id: u64,
    world: BrushModel,
    submodels: Vec<BrushModel>,
    geometry: Arc<Vec<SurfaceGeometry>>,
    lights: Vec<SurfaceLight>,
    pvs: Vec<u8>,
    dlights: Vec<DLight>,
    styles: LightStyles,
    time: f64,
    framecount: i32,
    format: LightmapFormat,
    overbright: bool,
    dynamic: bool,
    oldskyleaf: bool,
    numtextures: usize,
    lightmaps: usize,
    batches: Vec<Vec<u32>>,
}

struct JobResult {
    id: u64,
    batches: Vec<Vec<u32>>,
    brushpolys: usize,
    relit: Vec<RelitSurface>,
}

#[derive(Default)]
struct WorkerState {
    die: bool,
    ready: bool,
    processing: Option<Job>,
    done: Vec<JobResult>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<WorkerState>,
    /// Work available.
    wt: Condvar,
    /// Worker ready, or a result is available.
    rt: Condvar,
}

struct CacheEntry {
    id: u64,
    data: Arc<BrushData>,
    pos: Vec3,
    hostframe: i32,
    pvs: Vec<u8>,
    submodels: Vec<u8>,
    status: CacheStatus,
    numtextures: usize,
    /// Atlas pages plus one column for surfaces without a lightmap.
    lightmaps: usize,
    /// `numtextures * lightmaps` index lists; empty while the worker has them.
    batches: Vec<Vec<u32>>,
    ebo: Option<BufferId>,
    /// `(offset, count)` of each batch inside `ebo`.
    ranges: Vec<(usize, usize)>,
    brushpolys: usize,
}

impl CacheEntry {
    fn batch_count(&self, i: usize) -> usize {
        self.ranges
            .get(i)
            .map(|r| r.1)
            .unwrap_or_else(|| self.batches.get(i).map_or(0, Vec::len))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Notice {
    Off,
    Enabled,
    Conflict,
}

/// What `queue` looks at to pick or build a cache entry.
pub struct QueueInput<'a> {
    pub world: &'a BrushModel,
    /// Visible brush entities, used to decide which ones get baked in.
    pub entities: &'a [BrushEntity],
    pub geometry: &'a Arc<Vec<SurfaceGeometry>>,
    pub lights: &'a [SurfaceLight],
    pub styles: &'a LightStyles,
    pub dlights: &'a [DLight],
    pub settings: &'a RenderSettings,
    pub format: LightmapFormat,
    pub lightmap_pages: usize,
    pub pvs: &'a [u8],
    pub vieworg: Vec3,
    pub time: f64,
    pub framecount: i32,
    pub hostframe: i32,
}

/// Main-thread state `finish` and the draw calls update or read.
pub struct CacheFrame<'a> {
    pub atlas: &'a mut LightmapAtlas,
    /// World surface light state, indexed like the world's surfaces.
    pub lights: &'a mut [SurfaceLight],
    pub textures: &'a [TextureHandles],
    pub settings: &'a RenderSettings,
    pub time: f64,
}

pub struct SceneCache {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
    /// Most favoured first.
    entries: Vec<CacheEntry>,
    drawing: Option<u64>,
    next_id: u64,
    notice: Notice,
    /// Style values the newest entry was built with.
    old_styles: Vec<i32>,
    /// Thread creation failed; stays off until restart.
    disabled: bool,
    /// Results collected since the atlas was last refreshed.
    relit: Vec<RelitSurface>,
    processed: bool,
    jobs_posted: usize,
    /// Index buffers of entries dropped by `shutdown`, freed on the next
    /// call that has the backend.
    orphaned: Vec<BufferId>,
}

impl Default for SceneCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds the set of world submodels that can be folded into the cached
/// batches: untransformed, opaque, on frame 0 and without effects.
pub fn bakeable_submodels(world: &BrushModel, entities: &[BrushEntity], mode: SceneCacheMode) -> (Vec<u8>, Vec<BrushModel>) {
    let numsubmodels = world.data.submodels.len();
    let mut bits = vec![0u8; (numsubmodels + 7) >> 3];
    let mut models = Vec::new();
    if mode == SceneCacheMode::NoSubmodels {
        return (bits, models);
    }

    for ent in entities {
        let m = &ent.model;
        if !Arc::ptr_eq(&m.data, &world.data)
            || m.is_world()
            || !vector_is_zero(&ent.pose.origin)
            || !vector_is_zero(&ent.pose.angles)
            || ent.viewmodel
            || ent.frame != 0
            || ent.alpha.is_some()
            || ent.effects != 0
        {
            continue;
        }
        let i = m.submodel_index;
        if i >= numsubmodels || bits[i >> 3] & (1 << (i & 7)) != 0 {
            continue;
        }
        bits[i >> 3] |= 1 << (i & 7);
        models.push(m.clone());
    }
    (bits, models)
}

impl SceneCache {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            thread: None,
            entries: Vec::new(),
            drawing: None,
            next_id: 0,
            notice: Notice::Enabled,
            old_styles: Vec::new(),
            disabled: false,
            relit: Vec::new(),
            processed: false,
            jobs_posted: 0,
            orphaned: Vec::new(),
        }
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn jobs_posted(&self) -> usize {
        self.jobs_posted
    }

    pub fn is_drawing(&self) -> bool {
        self.drawing.is_some()
    }

    fn entry(&self, id: u64) -> Option<&CacheEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    fn entry_mut(&mut self, id: u64) -> Option<&mut CacheEntry> {
        self.entries.iter_mut().find(|e| e.id == id)
    }

    /// Status of the entry being drawn this frame.
    pub fn drawing_status(&self) -> Option<CacheStatus> {
        self.drawing.and_then(|id| self.entry(id)).map(|e| e.status)
    }

    /// Index counts of every batch of the entry being drawn.
    pub fn drawing_batch_counts(&self) -> Vec<usize> {
        match self.drawing.and_then(|id| self.entry(id)) {
            Some(e) => (0..e.numtextures * e.lightmaps).map(|i| e.batch_count(i)).collect(),
            None => Vec::new(),
        }
    }

    /// Polygons the entry being drawn covers.
    pub fn brushpolys(&self) -> usize {
        self.drawing.and_then(|id| self.entry(id)).map_or(0, |e| e.brushpolys)
    }

    /// True when a world submodel is already part of the drawn batches.
    pub fn skips_submodel(&self, model: &BrushModel) -> bool {
        let Some(e) = self.drawing.and_then(|id| self.entry(id)) else {
            return false;
        };
        if model.is_world() || !Arc::ptr_eq(&e.data, &model.data) {
            return false;
        }
        let i = model.submodel_index;
        e.submodels.get(i >> 3).is_some_and(|b| b & (1 << (i & 7)) != 0)
    }

    /// Moves finished worker results into their entries.
    fn absorb(&mut self, done: Vec<JobResult>) {
        for r in done {
            self.processed = true;
            self.relit.extend(r.relit);
            if let Some(e) = self.entries.iter_mut().find(|e| e.id == r.id) {
                e.batches = r.batches;
                e.ranges.clear();
                e.brushpolys = r.brushpolys;
                e.status = CacheStatus::Computed;
            }
        }
    }

    fn poll(&mut self) {
        let done = std::mem::take(&mut self.shared.state.lock().done);
        self.absorb(done);
    }

    /// Blocks until the worker hands back entry `id`.
    fn wait_for(&mut self, id: u64) {
        let shared = Arc::clone(&self.shared);
        let mut state = shared.state.lock();
        loop {
            let done = std::mem::take(&mut state.done);
            self.absorb(done);
            match self.entry(id) {
                Some(e) if e.status == CacheStatus::Building && self.thread.is_some() => shared.rt.wait(&mut state),
                _ => break,
            }
        }
    }

    fn spawn(&mut self) -> Result<(), SceneCacheError> {
        let shared = Arc::new(Shared::default());
        let worker = Arc::clone(&shared);
        let mut state = shared.state.lock();
        let handle = thread::Builder::new()
            .name("scenecache".to_string())
            .spawn(move || worker_loop(worker))?;
        while !state.ready {
            shared.rt.wait(&mut state);
        }
        drop(state);
        self.shared = shared;
        self.thread = Some(handle);
        Ok(())
    }

    /// Picks the cache entry to draw this frame for `pvs`, posting a new
    /// build to the worker when nothing suitable exists. Returns false when
    /// the caller should walk the world itself.
    pub fn queue(&mut self, input: &QueueInput) -> bool {
        self.drawing = None;
        let settings = input.settings;

        if settings.scenecache == SceneCacheMode::Off || self.disabled {
            self.notice = Notice::Off;
            if self.thread.is_some() {
                self.shutdown();
            }
            return false;
        }
        if settings.debug_view() || settings.showtris {
            if self.notice != Notice::Conflict {
                self.notice = Notice::Conflict;
                com_printf("r_scenecache: Disabling due to conflicting settings\n");
            }
            if self.thread.is_some() {
                self.shutdown();
            }
            return false;
        }
        if self.notice != Notice::Enabled {
            self.notice = Notice::Enabled;
            com_dprintf("r_scenecache: Enabled\n");
        }

        self.poll();

        let world = input.world;
        let (bake_bits, baked) = bakeable_submodels(world, input.entities, settings.scenecache);
        let rowbytes = vis_row_bytes(world.numleafs);
        let mut pvs = input.pvs[..rowbytes.min(input.pvs.len())].to_vec();
        pvs.resize(rowbytes, 0);

        let mut best: Option<u64> = None;
        let mut bdist = f32::MAX;
        let mut building: Option<u64> = None;
        let mut perfect = false;

        for e in self.entries.iter_mut() {
            if !Arc::ptr_eq(&e.data, &world.data) {
                if e.status == CacheStatus::Building {
                    building = Some(e.id);
                }
                continue;
            }

            if e.pvs == pvs {
                e.pos = input.vieworg;
                if e.status == CacheStatus::Building {
                    // can't be used yet, but no point building it twice
                    building = Some(e.id);
                    best.get_or_insert(e.id);
                    continue;
                }
                if e.submodels == bake_bits {
                    best = Some(e.id);
                    bdist = 0.0;
                    perfect = true;
                    break;
                }
                if bdist > SUBMODEL_PENALTY {
                    best = Some(e.id);
                    bdist = SUBMODEL_PENALTY;
                }
                continue;
            }

            if e.status == CacheStatus::Building {
                building = Some(e.id);
                continue;
            }

            let offset = vector_subtract(&input.vieworg, &e.pos);
            let mut d = dot_product(&offset, &offset);
            if e.submodels != bake_bits {
                d += SUBMODEL_PENALTY;
            }
            if d < bdist {
                bdist = d;
                best = Some(e.id);
            }
        }

        if building.is_none() {
            if let Some(b) = best {
                building = self
                    .entries
                    .iter()
                    .skip_while(|e| e.id != b)
                    .find(|e| e.status == CacheStatus::Building)
                    .map(|e| e.id);
            }
        }

        let mut keep = perfect;
        if !settings.dynamic {
            self.force_style_regen();
        } else if building.is_none() {
            if self.old_styles.as_slice() != input.styles.values() {
                self.force_style_regen();
                keep = false;
            } else if input.dlights.iter().take(MAX_DLIGHTS).any(|l| l.is_active(input.time)) {
                keep = false;
            }
        }

        let mut fresh = None;
        if best.is_none() || (!keep && building.is_none()) {
            match self.post(input, best, pvs, bake_bits, baked) {
                Some(id) => fresh = Some(id),
                None => return false,
            }
        }

        let Some(id) = best.or(fresh) else {
            return false;
        };
        if let Some(e) = self.entry_mut(id) {
            e.hostframe = input.hostframe;
        }
        self.drawing = Some(id);
        true
    }

    fn force_style_regen(&mut self) {
        match self.old_styles.first_mut() {
            Some(v) => *v = i32::MIN,
            None => self.old_styles.push(i32::MIN),
        }
    }

    /// Claims an entry for a new build and hands it to the worker.
    fn post(&mut self, input: &QueueInput, best: Option<u64>, pvs: Vec<u8>, submodels: Vec<u8>, baked: Vec<BrushModel>) -> Option<u64> {
        self.old_styles = input.styles.values().to_vec();

        // a queued job nobody started yet is stale now
        let stale = self.shared.state.lock().processing.take();
        if let Some(job) = stale {
            if let Some(e) = self.entry_mut(job.id) {
                e.status = CacheStatus::Discarded;
                e.batches = job.batches;
            }
        }

        let world = input.world;
        let lightmaps = input.lightmap_pages + 1;
        let numtextures = world.data.textures.len();

        let mut oldest = None;
        for (i, e) in self.entries.iter().enumerate() {
            if e.status == CacheStatus::Building || Some(e.id) == best {
                continue;
            }
            if e.lightmaps != lightmaps || e.numtextures != numtextures {
                continue;
            }
            if e.status == CacheStatus::Discarded {
                oldest = Some(i);
                break;
            }
            if input.hostframe - e.hostframe >= MIN_REUSE_AGE {
                oldest = Some(i);
            }
        }

        let id = self.next_id;
        self.next_id += 1;
        let mut entry = match oldest {
            Some(i) => {
                let mut e = self.entries.remove(i);
                e.batches.resize_with(numtextures * lightmaps, Vec::new);
                for b in &mut e.batches {
                    b.clear();
                }
                e
            }
            None => CacheEntry {
                id,
                data: Arc::clone(&world.data),
                pos: input.vieworg,
                hostframe: input.hostframe,
                pvs: Vec::new(),
                submodels: Vec::new(),
                status: CacheStatus::Building,
                numtextures,
                lightmaps,
                batches: vec![Vec::new(); numtextures * lightmaps],
                ebo: None,
                ranges: Vec::new(),
                brushpolys: 0,
            },
        };
        entry.id = id;
        entry.data = Arc::clone(&world.data);
        entry.status = CacheStatus::Building;
        entry.pos = input.vieworg;
        entry.hostframe = input.hostframe;
        entry.pvs = pvs;
        entry.submodels = submodels;
        entry.ranges.clear();

        let job = Job {
            id,
            world: world.clone(),
            submodels: baked,
            geometry: Arc::clone(input.geometry),
            lights: input.lights.to_vec(),
            pvs: entry.pvs.clone(),
            dlights: input.dlights.to_vec(),
            styles: input.styles.clone(),
            time: input.time,
            framecount: input.framecount,
            format: input.format,
            overbright: input.settings.overbright,
            dynamic: input.settings.dynamic,
            oldskyleaf: input.settings.oldskyleaf,
            numtextures,
            lightmaps,
            batches: std::mem::take(&mut entry.batches),
        };
        self.entries.insert(0, entry);

        if self.thread.is_none() {
            if let Err(e) = self.spawn() {
                com_dprintf(&format!("r_scenecache: {}\n", e));
                self.disabled = true;
                self.shutdown();
                return None;
            }
        }

        let shared = Arc::clone(&self.shared);
        let mut state = shared.state.lock();
        while state.processing.is_some() {
            shared.rt.wait(&mut state);
        }
        state.processing = Some(job);
        shared.wt.notify_one();
        drop(state);

        self.jobs_posted += 1;
        Some(id)
    }

    /// Makes the entry being drawn usable: waits for the worker if needed,
    /// uploads its batches as one index buffer, and refreshes any lightmaps
    /// the worker rebuilt.
    pub fn finish<B: GpuBackend>(&mut self, gpu: &mut B, frame: &mut CacheFrame) {
        let Some(id) = self.drawing else {
            return;
        };

        if self.entry(id).is_some_and(|e| e.status == CacheStatus::Building) {
            self.wait_for(id);
        } else {
            self.poll();
        }

        if let Some(e) = self.entry_mut(id) {
            if e.status == CacheStatus::Computed {
                let mut all = Vec::with_capacity(e.batches.iter().map(Vec::len).sum());
                e.ranges.clear();
                for b in &e.batches {
                    e.ranges.push((all.len(), b.len()));
                    all.extend_from_slice(b);
                }
                if let Some(old) = e.ebo.take() {
                    gpu.delete_buffer(old);
                }
                e.ebo = Some(gpu.upload_indices(&all));
                e.status = CacheStatus::Finished;
            }
        }

        if self.processed {
            self.processed = false;
            for r in self.relit.drain(..) {
                apply_relit(frame.atlas, frame.lights, &r);
            }
            frame.atlas.upload_all_dirty(gpu);
        }
    }

    /// Submits the cached batches: liquids when `water` is set, everything
    /// else otherwise.
    pub fn draw<B: GpuBackend>(&mut self, gpu: &mut B, water: bool, frame: &mut CacheFrame) -> Result<(), AtlasError> {
        self.free_orphans(gpu);
        if self.drawing.is_none() {
            return Ok(());
        }
        self.finish(gpu, frame);
        let Some(e) = self.drawing.and_then(|id| self.entry(id)) else {
            return Ok(());
        };
        let Some(buffer) = e.ebo else {
            return Ok(());
        };

        let settings = frame.settings;
        for i in 0..e.numtextures {
            let Some(tex) = e.data.texture(i) else {
                continue;
            };
            if tex.name.starts_with('*') != water {
                continue;
            }

            let mut base: Option<DrawCall> = None;
            for j in 0..e.lightmaps {
                let (offset, count) = e.ranges.get(i * e.lightmaps + j).copied().unwrap_or((0, 0));
                if count == 0 {
                    continue;
                }

                if base.is_none() {
                    let anim = texture_animation(&e.data.textures, i, 0, frame.time)?;
                    let handles = frame.textures.get(anim).copied().unwrap_or_default();
                    let name = e.data.texture(anim).map_or(tex.name.as_str(), |t| t.name.as_str());

                    let mut call = if name.starts_with('*') {
                        let mut call = DrawCall::new(DrawPass::Water, IndexSource::Client(Vec::new()));
                        call.alpha = settings.liquid_alpha.for_texture_name(name);
                        call
                    } else if name.starts_with("sky") {
                        let mut call = DrawCall::new(DrawPass::Sky, IndexSource::Client(Vec::new()));
                        call.fullbright = handles.fullbright;
                        call
                    } else {
                        let mut call = DrawCall::new(DrawPass::Shaded, IndexSource::Client(Vec::new()));
                        call.alpha_test = name.starts_with('{');
                        if settings.fullbrights {
                            call.fullbright = handles.fullbright;
                        }
                        call
                    };
                    call.texture = handles.diffuse;
                    call.overbright = settings.overbright;
                    base = Some(call);
                }

                if let Some(state) = &base {
                    let mut call = state.clone();
                    call.lightmap = if j == 0 {
                        None
                    } else {
                        frame.atlas.page(j - 1).and_then(|p| p.texture)
                    };
                    call.indices = IndexSource::Cached { buffer, offset, count };
                    gpu.draw(call);
                }
            }
        }
        Ok(())
    }

    /// True if the entry being drawn can contain sky surfaces.
    pub fn has_sky(&self) -> bool {
        self.drawing
            .and_then(|id| self.entry(id))
            .is_some_and(|e| e.data.textures.iter().flatten().any(|t| t.name.starts_with("sky")))
    }

    /// Lays down depth for every cached sky batch. Returns whether anything
    /// was drawn.
    pub fn draw_sky_surf_depth<B: GpuBackend>(&mut self, gpu: &mut B, frame: &mut CacheFrame) -> bool {
        self.free_orphans(gpu);
        if self.drawing.is_none() {
            return false;
        }
        self.finish(gpu, frame);
        let Some(e) = self.drawing.and_then(|id| self.entry(id)) else {
            return false;
        };
        let Some(buffer) = e.ebo else {
            return false;
        };

        let mut drew = false;
        for i in 0..e.numtextures {
            if !e.data.texture(i).is_some_and(|t| t.name.starts_with("sky")) {
                continue;
            }
            for j in 0..e.lightmaps {
                let (offset, count) = e.ranges.get(i * e.lightmaps + j).copied().unwrap_or((0, 0));
                if count == 0 {
                    continue;
                }
                gpu.draw(DrawCall::new(DrawPass::SkyDepth, IndexSource::Cached { buffer, offset, count }));
                drew = true;
            }
        }
        drew
    }

    fn uncache<B: GpuBackend>(&mut self, gpu: &mut B, index: usize) {
        let id = self.entries[index].id;
        if self.entries[index].status == CacheStatus::Building {
            self.wait_for(id);
        }
        let Some(pos) = self.entries.iter().position(|e| e.id == id) else {
            return;
        };
        let e = self.entries.remove(pos);
        if self.drawing == Some(id) {
            self.drawing = None;
        }
        if let Some(ebo) = e.ebo {
            gpu.delete_buffer(ebo);
        }
    }

    /// Drops every entry built for `data`, e.g. when its map is unloaded.
    pub fn cleanup<B: GpuBackend>(&mut self, gpu: &mut B, data: &Arc<BrushData>) {
        while let Some(i) = self.entries.iter().position(|e| Arc::ptr_eq(&e.data, data)) {
            self.uncache(gpu, i);
        }
        self.relit.clear();
        self.free_orphans(gpu);
    }

    /// Frees every entry's index buffer, then stops the worker.
    pub fn release<B: GpuBackend>(&mut self, gpu: &mut B) {
        while !self.entries.is_empty() {
            self.uncache(gpu, 0);
        }
        self.shutdown();
        self.free_orphans(gpu);
    }

    fn free_orphans<B: GpuBackend>(&mut self, gpu: &mut B) {
        for buffer in self.orphaned.drain(..) {
            gpu.delete_buffer(buffer);
        }
    }

    /// Stops the worker and forgets every entry. Their index buffers are
    /// kept aside until the next `draw`, `cleanup` or `release`.
    pub fn shutdown(&mut self) {
        if let Some(handle) = self.thread.take() {
            {
                let mut state = self.shared.state.lock();
                state.die = true;
                self.shared.wt.notify_all();
            }
            if handle.join().is_err() {
                com_printf("r_scenecache: worker thread panicked\n");
            }
        }
        self.shared = Arc::new(Shared::default());
        self.orphaned.extend(self.entries.drain(..).filter_map(|e| e.ebo));
        self.relit.clear();
        self.processed = false;
        self.drawing = None;
    }
}

impl Drop for SceneCache {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Copies a worker-built lightmap block into the atlas.
pub fn apply_relit(atlas: &mut LightmapAtlas, lights: &mut [SurfaceLight], r: &RelitSurface) {
    let [smax, tmax] = r.size;
    let bpp = atlas.format().bytes_per_texel();
    let row = smax * bpp;
    let stride = atlas.stride();
    let Some(dest) = atlas.texels_mut(r.slot) else {
        return;
    };
    for (t, src) in r.texels.chunks_exact(row).take(tmax).enumerate() {
        if let Some(d) = dest.get_mut(t * stride..t * stride + row) {
            d.copy_from_slice(src);
        }
    }
    atlas.mark_dirty(r.slot, smax, tmax);
    if let Some(l) = lights.get_mut(r.surface) {
        *l = r.light;
    }
}

// ============================================================
// Worker
// ============================================================

fn worker_loop(shared: Arc<Shared>) {
    let mut state = shared.state.lock();
    state.ready = true;
    shared.rt.notify_all();
    while !state.die {
        let Some(job) = state.processing.take() else {
            shared.wt.wait(&mut state);
            continue;
        };
        let result = MutexGuard::unlocked(&mut state, || build_scene(job));
        state.done.push(result);
        shared.rt.notify_all();
    }
}

fn mark_cached_dlights(data: &BrushData, head: NodeChild, dlights: &[DLight], time: f64, framecount: i32, lights: &mut [SurfaceLight]) {
    for (i, l) in dlights.iter().enumerate().take(MAX_DLIGHTS) {
        if l.is_active(time) {
            mark_lights(data, head, l, &l.origin, framecount, i, lights);
        }
    }
}

struct SceneBuilder<'a> {
    data: &'a BrushData,
    geometry: &'a [SurfaceGeometry],
    ctx: LightContext<'a>,
    dynamic: bool,
    numtextures: usize,
    lightmaps: usize,
    batches: Vec<Vec<u32>>,
    lights: Vec<SurfaceLight>,
    relit: Vec<RelitSurface>,
}

impl SceneBuilder<'_> {
    fn add_surface(&mut self, s: usize) {
        let surf = &self.data.surfaces[s];
        if surf.numedges < 3 {
            return;
        }
        let geom = self.geometry.get(s).copied().unwrap_or_default();
        let column = geom.page().map_or(0, |p| p + 1);
        if column >= self.lightmaps {
            return;
        }
        let tex = self.data.surface_texture(surf);
        if tex >= self.numtextures {
            return;
        }

        let batch = &mut self.batches[tex * self.lightmaps + column];
        let n = triangle_index_count(surf.numedges);
        if batch.len() + n > batch.capacity() {
            batch.reserve_exact(n + BATCH_GROWTH);
        }
        triangle_indices(geom.first_vertex, surf.numedges, batch);

        self.relight(s, geom);
    }

    fn relight(&mut self, s: usize, geom: SurfaceGeometry) {
        let surf = &self.data.surfaces[s];
        if surf.flags.contains(SurfFlags::DRAWTILED) || !self.dynamic {
            return;
        }
        let Some(slot) = geom.lightmap else {
            return;
        };
        let Some(light) = self.lights.get_mut(s) else {
            return;
        };
        if !light.needs_rebuild(surf, self.ctx.styles, self.ctx.framecount) {
            return;
        }
        let ([smax, tmax], _) = surf.lightmap_size();
        let stride = smax * self.ctx.format.bytes_per_texel();
        let mut texels = vec![0u8; stride * tmax];
        build_light_map(self.data, surf, light, &self.ctx, &mut texels, stride);
        self.relit.push(RelitSurface {
            surface: s,
            slot,
            size: [smax, tmax],
            light: *light,
            texels,
        });
    }
}

/// Walks the PVS and the baked submodels into per texture/lightmap index
/// batches. Runs on the worker; touches nothing but the job.
fn build_scene(job: Job) -> JobResult {
    let Job {
        id,
        world,
        submodels,
        geometry,
        mut lights,
        pvs,
        dlights,
        styles,
        time,
        framecount,
        format,
        overbright,
        dynamic,
        oldskyleaf,
        numtextures,
        lightmaps,
        mut batches,
    } = job;
    let data = &*world.data;

    batches.resize_with(numtextures * lightmaps, Vec::new);
    mark_cached_dlights(data, model_headnode(&world), &dlights, time, framecount, &mut lights);

    let mut builder = SceneBuilder {
        data,
        geometry: &geometry,
        ctx: LightContext {
            styles: &styles,
            dlights: &dlights,
            pose: EntityPose::default(),
            framecount,
            format,
            overbright,
        },
        dynamic,
        numtextures,
        lightmaps,
        batches,
        lights,
        relit: Vec::new(),
    };

    let mut seen = vec![false; data.surfaces.len()];
    let mut brushpolys = 0;
    for i in 0..world.numleafs {
        if pvs.get(i >> 3).map_or(true, |b| b & (1 << (i & 7)) == 0) {
            continue;
        }
        let Some(leaf) = data.leafs.get(i + 1) else {
            break;
        };
        if leaf.contents == Contents::Sky && !oldskyleaf {
            continue;
        }
        let marks = data
            .marksurfaces
            .get(leaf.firstmarksurface..leaf.firstmarksurface + leaf.nummarksurfaces)
            .unwrap_or(&[]);
        for &s in marks {
            if seen[s] {
                continue;
            }
            seen[s] = true;
            brushpolys += 1;
            builder.add_surface(s);
        }
    }

    for sub in &submodels {
        mark_cached_dlights(data, model_headnode(sub), &dlights, time, framecount, &mut builder.lights);
        for s in sub.surfaces() {
            brushpolys += 1;
            builder.add_surface(s);
        }
    }

    JobResult {
        id,
        batches: builder.batches,
        brushpolys,
        relit: builder.relit,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{Recorded, RecordingBackend};
    use crate::settings::StyleMode;
    use crate::test_support::load_models;
    use q1bsp_common::testutil::BspBuilder;

    struct Fixture {
        models: Vec<BrushModel>,
        geometry: Arc<Vec<SurfaceGeometry>>,
        lights: Vec<SurfaceLight>,
        atlas: LightmapAtlas,
        styles: LightStyles,
        settings: RenderSettings,
        textures: Vec<TextureHandles>,
    }

    fn fixture(gpu: &mut RecordingBackend) -> Fixture {
        let models = load_models(BspBuilder::two_room_world().with_door_submodel());
        let data = &models[0].data;
        let mut atlas = LightmapAtlas::new(LightmapFormat::Rgba8);
        let mut next = 0u32;
        let geometry = data
            .surfaces
            .iter()
            .map(|s| {
                let ([w, h], _) = s.lightmap_size();
                let g = SurfaceGeometry {
                    lightmap: Some(atlas.alloc_block(w, h).unwrap()),
                    first_vertex: next,
                };
                next += s.numedges as u32;
                g
            })
            .collect();
        atlas.upload_all(gpu);
        let mut styles = LightStyles::new();
        styles.update(0, "m");
        styles.animate(0.0, StyleMode::Animated);
        Fixture {
            lights: vec![SurfaceLight::default(); data.surfaces.len()],
            textures: vec![TextureHandles::default(); data.textures.len()],
            models,
            geometry: Arc::new(geometry),
            atlas,
            styles,
            settings: RenderSettings::default(),
        }
    }

    fn input<'a>(f: &'a Fixture, entities: &'a [BrushEntity], pvs: &'a [u8], hostframe: i32) -> QueueInput<'a> {
        QueueInput {
            world: &f.models[0],
            entities,
            geometry: &f.geometry,
            lights: &f.lights,
            styles: &f.styles,
            dlights: &[],
            settings: &f.settings,
            format: LightmapFormat::Rgba8,
            lightmap_pages: f.atlas.page_count(),
            pvs,
            vieworg: [32.0, 32.0, 16.0],
            time: 1.0,
            framecount: hostframe,
            hostframe,
        }
    }

    fn draw_frame(cache: &mut SceneCache, gpu: &mut RecordingBackend, f: &mut Fixture) {
        let mut frame = CacheFrame {
            atlas: &mut f.atlas,
            lights: &mut f.lights,
            textures: &f.textures,
            settings: &f.settings,
            time: 1.0,
        };
        cache.draw(gpu, false, &mut frame).unwrap();
    }

    #[test]
    fn test_same_pvs_reuses_entry() {
        let mut gpu = RecordingBackend::default();
        let mut f = fixture(&mut gpu);
        let mut cache = SceneCache::new();
        let pvs = f.models[0].leaf_pvs(1);

        assert!(cache.queue(&input(&f, &[], &pvs, 1)));
        assert_eq!(cache.jobs_posted(), 1);
        draw_frame(&mut cache, &mut gpu, &mut f);
        assert_eq!(cache.drawing_status(), Some(CacheStatus::Finished));
        let first = cache.drawing_batch_counts();
        assert_eq!(first.iter().sum::<usize>(), 6);
        assert_eq!(cache.brushpolys(), 1);

        assert!(cache.queue(&input(&f, &[], &pvs, 2)));
        assert_eq!(cache.jobs_posted(), 1);
        assert_eq!(cache.entry_count(), 1);
        draw_frame(&mut cache, &mut gpu, &mut f);
        assert_eq!(cache.drawing_batch_counts(), first);

        cache.shutdown();
    }

    #[test]
    fn test_cached_draw_uses_one_index_buffer() {
        let mut gpu = RecordingBackend::default();
        let mut f = fixture(&mut gpu);
        let mut cache = SceneCache::new();
        let pvs = f.models[0].leaf_pvs(1);

        assert!(cache.queue(&input(&f, &[], &pvs, 1)));
        gpu.clear();
        draw_frame(&mut cache, &mut gpu, &mut f);

        let draws: Vec<_> = gpu.draws().collect();
        assert_eq!(draws.len(), 1);
        assert_eq!(draws[0].pass, DrawPass::Shaded);
        assert!(matches!(draws[0].indices, IndexSource::Cached { offset: 0, count: 6, .. }));
        assert_eq!(draws[0].lightmap, f.atlas.pages()[0].texture);
        assert!(!cache.has_sky());
        cache.shutdown();
    }

    #[test]
    fn test_baked_submodel_is_skipped() {
        let mut gpu = RecordingBackend::default();
        let mut f = fixture(&mut gpu);
        let mut cache = SceneCache::new();
        let pvs = f.models[0].leaf_pvs(1);
        let door = BrushEntity::new(f.models[1].clone());

        let (bits, baked) = bakeable_submodels(&f.models[0], std::slice::from_ref(&door), SceneCacheMode::On);
        assert_eq!(bits, vec![0b10]);
        assert_eq!(baked.len(), 1);
        let (bits, _) = bakeable_submodels(&f.models[0], std::slice::from_ref(&door), SceneCacheMode::NoSubmodels);
        assert_eq!(bits, vec![0]);

        let moved = BrushEntity {
            pose: EntityPose {
                origin: [0.0, 0.0, 8.0],
                ..Default::default()
            },
            ..door.clone()
        };
        assert!(bakeable_submodels(&f.models[0], &[moved], SceneCacheMode::On).1.is_empty());

        assert!(cache.queue(&input(&f, std::slice::from_ref(&door), &pvs, 1)));
        draw_frame(&mut cache, &mut gpu, &mut f);
        assert!(cache.skips_submodel(&f.models[1]));
        assert!(!cache.skips_submodel(&f.models[0]));
        assert_eq!(cache.brushpolys(), 2);
        assert_eq!(cache.drawing_batch_counts().iter().sum::<usize>(), 12);
        cache.shutdown();
    }

    #[test]
    fn test_style_change_queues_rebuild() {
        let mut gpu = RecordingBackend::default();
        let mut f = fixture(&mut gpu);
        let mut cache = SceneCache::new();
        let pvs = f.models[0].leaf_pvs(1);

        assert!(cache.queue(&input(&f, &[], &pvs, 1)));
        draw_frame(&mut cache, &mut gpu, &mut f);
        assert_eq!(f.lights[0].cached_light[0], 264);

        f.styles.update(0, "z");
        f.styles.animate(0.0, StyleMode::Animated);
        assert!(cache.queue(&input(&f, &[], &pvs, 2)));
        assert_eq!(cache.jobs_posted(), 2);
        draw_frame(&mut cache, &mut gpu, &mut f);
        // the old entry keeps being drawn until the new one is picked
        assert!(cache.entry_count() >= 1);
        cache.shutdown();
    }

    #[test]
    fn test_debug_view_disables_cache() {
        let mut gpu = RecordingBackend::default();
        let mut f = fixture(&mut gpu);
        f.settings.drawflat = true;
        let mut cache = SceneCache::new();
        let pvs = f.models[0].leaf_pvs(1);
        assert!(!cache.queue(&input(&f, &[], &pvs, 1)));
        assert_eq!(cache.jobs_posted(), 0);

        f.settings.drawflat = false;
        f.settings.scenecache = SceneCacheMode::Off;
        assert!(!cache.queue(&input(&f, &[], &pvs, 1)));
    }

    fn undeleted_index_buffers(gpu: &RecordingBackend) -> Vec<BufferId> {
        let deleted: Vec<BufferId> = gpu
            .events
            .iter()
            .filter_map(|e| match e {
                Recorded::DeleteBuffer(b) => Some(*b),
                _ => None,
            })
            .collect();
        gpu.events
            .iter()
            .filter_map(|e| match e {
                Recorded::Indices { buffer, .. } if !deleted.contains(buffer) => Some(*buffer),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_turning_cache_off_frees_index_buffers() {
        let mut gpu = RecordingBackend::default();
        let mut f = fixture(&mut gpu);
        let mut cache = SceneCache::new();
        let pvs = f.models[0].leaf_pvs(1);

        assert!(cache.queue(&input(&f, &[], &pvs, 1)));
        draw_frame(&mut cache, &mut gpu, &mut f);
        assert_eq!(undeleted_index_buffers(&gpu).len(), 1);

        f.settings.scenecache = SceneCacheMode::Off;
        assert!(!cache.queue(&input(&f, &[], &pvs, 2)));
        assert_eq!(cache.entry_count(), 0);
        draw_frame(&mut cache, &mut gpu, &mut f);
        assert!(undeleted_index_buffers(&gpu).is_empty());

        // a debug view stops the worker the same way; release frees the rest
        f.settings.scenecache = SceneCacheMode::On;
        assert!(cache.queue(&input(&f, &[], &pvs, 3)));
        draw_frame(&mut cache, &mut gpu, &mut f);
        f.settings.showtris = true;
        assert!(!cache.queue(&input(&f, &[], &pvs, 4)));
        assert_eq!(undeleted_index_buffers(&gpu).len(), 1);
        cache.release(&mut gpu);
        assert!(undeleted_index_buffers(&gpu).is_empty());
    }

    #[test]
    fn test_cleanup_drops_entries() {
        let mut gpu = RecordingBackend::default();
        let mut f = fixture(&mut gpu);
        let mut cache = SceneCache::new();
        let pvs = f.models[0].leaf_pvs(1);
        assert!(cache.queue(&input(&f, &[], &pvs, 1)));
        draw_frame(&mut cache, &mut gpu, &mut f);

        let data = Arc::clone(&f.models[0].data);
        cache.cleanup(&mut gpu, &data);
        assert_eq!(cache.entry_count(), 0);
        assert!(!cache.is_drawing());
        cache.release(&mut gpu);
    }

    #[test]
    fn test_apply_relit_copies_rows() {
        let mut atlas = LightmapAtlas::new(LightmapFormat::Rgba8);
        let slot = atlas.alloc_block(2, 2).unwrap();
        let slot = LightmapSlot { s: 1, ..slot };
        let mut lights = vec![SurfaceLight::default()];
        let r = RelitSurface {
            surface: 0,
            slot,
            size: [2, 2],
            light: SurfaceLight {
                cached_dlight: true,
                ..Default::default()
            },
            texels: (0..16).collect(),
        };
        apply_relit(&mut atlas, &mut lights, &r);
        let stride = atlas.stride();
        let page = &atlas.pages()[0];
        assert_eq!(&page.data[4..12], &[0, 1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(&page.data[stride + 4..stride + 12], &[8, 9, 10, 11, 12, 13, 14, 15]);
        assert!(page.modified);
        assert!(lights[0].cached_dlight);
    }
}
