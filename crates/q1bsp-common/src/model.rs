// model.rs — in-memory brush model data and the model registry

use std::collections::HashMap;
use std::sync::Arc;

use bitflags::bitflags;

use crate::common::{com_dprintf, com_warning, WarnOnce};
use crate::cvar::LoaderSettings;
use crate::error::{LoadError, LoadResult};
use crate::files::FileSystem;
use crate::lightgrid::LightGrid;
use crate::model_load::load_brush_model;
use crate::model_texture::Texture;
use crate::q_shared::{Contents, Plane, Vec3};
use crate::qfiles::{foreign_model_format, BspLayout, MAXLIGHTMAPS, MAX_MAP_HULLS, NUM_AMBIENTS};

/// Default lightmap atlas page size. Surface extents at or above it are
/// clamped by the loader.
pub const LMBLOCK_WIDTH: i32 = 256;
pub const LMBLOCK_HEIGHT: i32 = 256;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct SurfFlags: u32 {
        const PLANEBACK      = 0x0002;
        const DRAWSKY        = 0x0004;
        const DRAWSPRITE     = 0x0008;
        const DRAWTURB       = 0x0010;
        const DRAWTILED      = 0x0020;
        const DRAWBACKGROUND = 0x0040;
        const UNDERWATER     = 0x0080;
        const NOTEXTURE      = 0x0100;
        const DRAWFENCE      = 0x0200;
        const DRAWLAVA       = 0x0400;
        const DRAWSLIME      = 0x0800;
        const DRAWTELE       = 0x1000;
        const DRAWWATER      = 0x2000;

        const LIQUID_TYPES = Self::DRAWWATER.bits()
            | Self::DRAWTELE.bits()
            | Self::DRAWSLIME.bits()
            | Self::DRAWLAVA.bits();
    }
}

// ============================================================
// Geometry
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TexInfo {
    pub vecs: [[f32; 4]; 2],
    /// Index into `BrushData::textures`. Always valid: missing textures
    /// point at one of the two trailing placeholders.
    pub texture: usize,
    pub flags: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Surface {
    pub plane: usize,
    pub flags: SurfFlags,
    pub firstedge: usize,
    pub numedges: usize,
    pub texinfo: usize,
    pub styles: [u16; MAXLIGHTMAPS],
    /// Offset of the first light sample (in samples, not bytes).
    pub samples: Option<usize>,
    /// Lightmap size minus one, in luxels.
    pub extents: [i32; 2],
    pub lmvecs: [[f32; 4]; 2],
    /// Luxel to world-unit scale, used for dlight spread.
    pub lmvecscale: [f32; 2],
    pub mins: Vec3,
    pub maxs: Vec3,
}

impl Surface {
    /// Number of active light styles.
    pub fn num_styles(&self) -> usize {
        self.styles
            .iter()
            .take_while(|&&s| s != crate::qfiles::INVALID_LIGHTSTYLE)
            .count()
    }

    /// Luxels per style.
    pub fn lightmap_size(&self) -> ([usize; 2], usize) {
        let smax = (self.extents[0] + 1).max(0) as usize;
        let tmax = (self.extents[1] + 1).max(0) as usize;
        ([smax, tmax], smax * tmax)
    }
}

/// Child of a draw node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeChild {
    Node(usize),
    Leaf(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub plane: usize,
    pub children: [NodeChild; 2],
    pub mins: Vec3,
    pub maxs: Vec3,
    pub firstsurface: usize,
    pub numsurfaces: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Leaf {
    pub contents: Contents,
    pub mins: Vec3,
    pub maxs: Vec3,
    pub firstmarksurface: usize,
    pub nummarksurfaces: usize,
    /// Offset into `BrushData::visdata`; `None` means "sees everything".
    pub compressed_vis: Option<usize>,
    pub ambient_sound_level: [u8; NUM_AMBIENTS],
}

/// Child of a clip node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClipChild {
    Node(usize),
    Contents(Contents),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClipNode {
    pub plane: usize,
    pub children: [ClipChild; 2],
}

/// Which clipnode array a hull walks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HullNodes {
    /// Hull 0, generated from the draw nodes.
    Draw,
    /// The clipnodes lump.
    Clip,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HullDef {
    pub nodes: HullNodes,
    /// Negative values are content codes (a hull that is a single leaf).
    pub firstclipnode: i32,
    pub lastclipnode: i32,
    pub clip_mins: Vec3,
    pub clip_maxs: Vec3,
}

impl Default for HullDef {
    fn default() -> Self {
        Self {
            nodes: HullNodes::Draw,
            firstclipnode: 0,
            lastclipnode: 0,
            clip_mins: [0.0; 3],
            clip_maxs: [0.0; 3],
        }
    }
}

/// A submodel record with its bounds spread by one unit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Submodel {
    pub mins: Vec3,
    pub maxs: Vec3,
    pub origin: Vec3,
    pub headnode: [i32; MAX_MAP_HULLS],
    pub visleafs: usize,
    pub firstface: usize,
    pub numfaces: usize,
}

/// Static light samples.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum LightData {
    #[default]
    None,
    /// Three bytes per sample.
    Ldr(Vec<u8>),
    /// One packed E5BGR9 word per sample.
    Hdr(Vec<u32>),
}

impl LightData {
    pub fn num_samples(&self) -> usize {
        match self {
            LightData::None => 0,
            LightData::Ldr(d) => d.len() / 3,
            LightData::Hdr(d) => d.len(),
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, LightData::None)
    }

    pub fn is_hdr(&self) -> bool {
        matches!(self, LightData::Hdr(_))
    }
}

/// Everything decoded from one BSP file. Shared read-only between the world
/// model and its inline submodels.
#[derive(Debug, Default)]
pub struct BrushData {
    pub name: String,
    pub bspversion: i32,
    pub layout: Option<BspLayout>,
    pub path_id: u32,

    pub planes: Vec<Plane>,
    pub vertexes: Vec<Vec3>,
    pub edges: Vec<[u32; 2]>,
    pub surfedges: Vec<i32>,
    pub textures: Vec<Option<Texture>>,
    pub texinfo: Vec<TexInfo>,
    pub surfaces: Vec<Surface>,
    pub marksurfaces: Vec<usize>,
    pub nodes: Vec<Node>,
    pub leafs: Vec<Leaf>,
    pub clipnodes: Vec<ClipNode>,
    /// Hull 0 built from the draw nodes.
    pub hull0: Vec<ClipNode>,
    pub submodels: Vec<Submodel>,

    pub visdata: Vec<u8>,
    pub lightdata: LightData,
    pub entities: String,
    pub lightgrid: Option<LightGrid>,

    /// Liquid surface types that can be seen through.
    pub contents_transparent: SurfFlags,
    pub viswarn: WarnOnce,
}

impl BrushData {
    /// World-space position of the `i`th vertex of a surface, honoring the
    /// winding direction of the edge.
    pub fn surface_vertex(&self, surf: &Surface, i: usize) -> Vec3 {
        let e = self.surfedges[surf.firstedge + i];
        let v = if e >= 0 {
            self.edges[e as usize][0]
        } else {
            self.edges[e.unsigned_abs() as usize][1]
        };
        self.vertexes[v as usize]
    }

    pub fn surface_texture(&self, surf: &Surface) -> usize {
        self.texinfo[surf.texinfo].texture
    }

    pub fn texture(&self, index: usize) -> Option<&Texture> {
        self.textures.get(index).and_then(|t| t.as_ref())
    }

    pub fn is_hdr(&self) -> bool {
        self.lightdata.is_hdr()
    }
}

/// One entry of the registry: the world or an inline `*N` submodel.
#[derive(Debug, Clone)]
pub struct BrushModel {
    pub data: Arc<BrushData>,
    pub submodel_index: usize,
    pub hulls: [HullDef; MAX_MAP_HULLS],
    pub firstmodelsurface: usize,
    pub nummodelsurfaces: usize,
    /// Leafs addressed by this model's PVS rows (leaf 0 excluded).
    pub numleafs: usize,
    pub mins: Vec3,
    pub maxs: Vec3,
    /// Bounds when rotated on any axis.
    pub rmins: Vec3,
    pub rmaxs: Vec3,
    /// Bounds when rotated on yaw only.
    pub ymins: Vec3,
    pub ymaxs: Vec3,
    pub clipmins: Vec3,
    pub clipmaxs: Vec3,
    pub radius: f32,
}

impl BrushModel {
    pub fn surfaces(&self) -> std::ops::Range<usize> {
        self.firstmodelsurface..self.firstmodelsurface + self.nummodelsurfaces
    }

    pub fn is_world(&self) -> bool {
        self.submodel_index == 0
    }
}

#[derive(Debug, Clone)]
pub enum ModelKind {
    Brush(BrushModel),
    /// Placeholder for anything that failed to load. Renders and collides as
    /// nothing.
    Invalid,
}

#[derive(Debug, Clone)]
pub struct Model {
    pub name: String,
    pub path_id: u32,
    pub kind: ModelKind,
}

impl Model {
    pub fn invalid(name: &str) -> Model {
        Model {
            name: name.to_string(),
            path_id: 0,
            kind: ModelKind::Invalid,
        }
    }

    pub fn brush(&self) -> Option<&BrushModel> {
        match &self.kind {
            ModelKind::Brush(b) => Some(b),
            ModelKind::Invalid => None,
        }
    }

    pub fn is_invalid(&self) -> bool {
        matches!(self.kind, ModelKind::Invalid)
    }
}

// ============================================================
// Registry
// ============================================================

/// What the loader needs from the host for one load call.
#[derive(Clone, Copy)]
pub struct LoadEnv<'a> {
    pub fs: &'a FileSystem,
    pub settings: LoaderSettings,
    /// Base name of the map the server is running, for external vis.
    pub server_map: Option<&'a str>,
}

impl<'a> LoadEnv<'a> {
    pub fn new(fs: &'a FileSystem, settings: LoaderSettings) -> Self {
        Self {
            fs,
            settings,
            server_map: None,
        }
    }

    pub fn with_server_map(mut self, map: &'a str) -> Self {
        self.server_map = Some(map);
        self
    }
}

#[derive(Debug)]
struct Slot {
    name: String,
    model: Option<Arc<Model>>,
    needload: bool,
}

/// Owns every model loaded for the current level.
#[derive(Debug, Default)]
pub struct ModelRegistry {
    slots: Vec<Slot>,
    index: HashMap<String, usize>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn find_name(&mut self, name: &str) -> usize {
        if let Some(&idx) = self.index.get(name) {
            return idx;
        }
        let idx = self.slots.len();
        self.slots.push(Slot {
            name: name.to_string(),
            model: None,
            needload: true,
        });
        self.index.insert(name.to_string(), idx);
        idx
    }

    fn store(&mut self, idx: usize, model: Model) -> Arc<Model> {
        let model = Arc::new(model);
        let slot = &mut self.slots[idx];
        slot.model = Some(Arc::clone(&model));
        slot.needload = false;
        model
    }

    /// Registers the name without loading anything.
    pub fn touch(&mut self, name: &str) {
        self.find_name(name);
    }

    /// A loaded model, without attempting to load it.
    pub fn get(&self, name: &str) -> Option<Arc<Model>> {
        let slot = &self.slots[*self.index.get(name)?];
        if slot.needload {
            return None;
        }
        slot.model.clone()
    }

    /// Loads (or returns the cached) model. With `crash` set, any failure is
    /// returned as an error; otherwise it is logged and an invalid
    /// placeholder is returned.
    pub fn for_name(&mut self, name: &str, crash: bool, env: &LoadEnv) -> LoadResult<Arc<Model>> {
        if name.is_empty() {
            return Err(LoadError::NotFound { name: String::new() });
        }
        let idx = self.find_name(name);
        if !self.slots[idx].needload {
            if let Some(model) = &self.slots[idx].model {
                return Ok(Arc::clone(model));
            }
        }

        // inline models only come into existence with their world
        let file = if name.starts_with('*') { None } else { env.fs.load_file(name) };

        let file = match file {
            Some(f) => f,
            None => {
                if crash {
                    return Err(LoadError::NotFound { name: name.to_string() });
                }
                let bytes = name.as_bytes();
                let unnumbered_inline = bytes[0] == b'*' && !bytes.get(1).is_some_and(|c| c.is_ascii_digit());
                if !unnumbered_inline {
                    com_warning(&format!("Mod_LoadModel: {} not found\n", name));
                }
                return Ok(self.store(idx, Model::invalid(name)));
            }
        };

        let magic = i32::from_le_bytes([
            file.data.first().copied().unwrap_or(0),
            file.data.get(1).copied().unwrap_or(0),
            file.data.get(2).copied().unwrap_or(0),
            file.data.get(3).copied().unwrap_or(0),
        ]);
        if let Some(format) = foreign_model_format(magic) {
            let err = LoadError::UnsupportedFormat {
                model: name.to_string(),
                format,
            };
            if crash {
                return Err(err);
            }
            com_warning(&format!("{}\n", err));
            return Ok(self.store(idx, Model::invalid(name)));
        }

        match load_brush_model(name, &file.data, file.path_id, env) {
            Ok(models) => {
                let mut world = None;
                for (i, bm) in models.into_iter().enumerate() {
                    if i == 0 {
                        world = Some(self.store(
                            idx,
                            Model {
                                name: name.to_string(),
                                path_id: file.path_id,
                                kind: ModelKind::Brush(bm),
                            },
                        ));
                    } else {
                        let subname = format!("*{}", i);
                        let subidx = self.find_name(&subname);
                        self.store(
                            subidx,
                            Model {
                                name: subname,
                                path_id: file.path_id,
                                kind: ModelKind::Brush(bm),
                            },
                        );
                    }
                }
                match world {
                    Some(w) => Ok(w),
                    None => Ok(self.store(idx, Model::invalid(name))),
                }
            }
            Err(e) => {
                if crash {
                    return Err(e);
                }
                com_warning(&format!("Mod_LoadModel: {}\n", e));
                Ok(self.store(idx, Model::invalid(name)))
            }
        }
    }

    /// Marks every model for reload. Returns the models that were resident
    /// so their GPU-side resources can be released.
    pub fn clear_all(&mut self) -> Vec<Arc<Model>> {
        let mut released = Vec::new();
        for slot in self.slots.iter_mut() {
            if !slot.needload {
                if let Some(m) = slot.model.take() {
                    released.push(m);
                }
            }
            slot.needload = true;
        }
        com_dprintf(&format!("Mod_ClearAll: {} models released\n", released.len()));
        released
    }

    /// Forgets every model, including names.
    pub fn reset_all(&mut self) -> Vec<Arc<Model>> {
        let released = self
            .slots
            .drain(..)
            .filter(|s| !s.needload)
            .filter_map(|s| s.model)
            .collect();
        self.index.clear();
        released
    }

    /// Visits every known name, loaded or not.
    pub fn for_each(&self, mut f: impl FnMut(&str, Option<&Arc<Model>>)) {
        for slot in &self.slots {
            let model = if slot.needload { None } else { slot.model.as_ref() };
            f(&slot.name, model);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::{build_pack, Pack};
    use crate::testutil::BspBuilder;

    fn fs_with(entries: &[(&str, &[u8])]) -> FileSystem {
        let mut fs = FileSystem::new();
        fs.add_pack(Pack::from_bytes("test.pak", build_pack(entries)).unwrap());
        fs
    }

    #[test]
    fn test_missing_model_is_invalid_unless_crash() {
        let fs = FileSystem::new();
        let env = LoadEnv::new(&fs, LoaderSettings::default());
        let mut reg = ModelRegistry::new();

        let m = reg.for_name("progs/none.mdl", false, &env).unwrap();
        assert!(m.is_invalid());
        assert!(matches!(
            reg.for_name("maps/none.bsp", true, &env),
            Err(LoadError::NotFound { .. })
        ));
    }

    #[test]
    fn test_foreign_format_rejected() {
        let fs = fs_with(&[("progs/player.mdl", b"IDPO\x06\0\0\0")]);
        let env = LoadEnv::new(&fs, LoaderSettings::default());
        let mut reg = ModelRegistry::new();
        assert!(reg.for_name("progs/player.mdl", false, &env).unwrap().is_invalid());
        reg.clear_all();
        assert!(matches!(
            reg.for_name("progs/player.mdl", true, &env),
            Err(LoadError::UnsupportedFormat { .. })
        ));
    }

    #[test]
    fn test_world_registers_inline_submodels() {
        let bsp = BspBuilder::two_room_world().with_door_submodel().build();
        let fs = fs_with(&[("maps/test.bsp", &bsp)]);
        let env = LoadEnv::new(&fs, LoaderSettings::default());
        let mut reg = ModelRegistry::new();

        let world = reg.for_name("maps/test.bsp", true, &env).unwrap();
        let wb = world.brush().unwrap();
        assert!(wb.is_world());

        let door = reg.get("*1").expect("submodel registered with the world");
        let db = door.brush().unwrap();
        assert_eq!(db.submodel_index, 1);
        assert!(Arc::ptr_eq(&wb.data, &db.data));

        // cached on the second request
        let again = reg.for_name("maps/test.bsp", true, &env).unwrap();
        assert!(Arc::ptr_eq(&world, &again));
    }

    #[test]
    fn test_clear_and_reset() {
        let bsp = BspBuilder::two_room_world().build();
        let fs = fs_with(&[("maps/test.bsp", &bsp)]);
        let env = LoadEnv::new(&fs, LoaderSettings::default());
        let mut reg = ModelRegistry::new();
        reg.for_name("maps/test.bsp", true, &env).unwrap();
        reg.touch("progs/later.mdl");

        let mut names = Vec::new();
        reg.for_each(|name, m| names.push((name.to_string(), m.is_some())));
        assert_eq!(
            names,
            vec![("maps/test.bsp".to_string(), true), ("progs/later.mdl".to_string(), false)]
        );

        let released = reg.clear_all();
        assert_eq!(released.len(), 1);
        assert!(reg.get("maps/test.bsp").is_none());
        assert_eq!(reg.len(), 2);

        reg.for_name("maps/test.bsp", true, &env).unwrap();
        assert_eq!(reg.reset_all().len(), 1);
        assert!(reg.is_empty());
    }

    #[test]
    fn test_unknown_inline_model_without_world() {
        let fs = FileSystem::new();
        let env = LoadEnv::new(&fs, LoaderSettings::default());
        let mut reg = ModelRegistry::new();
        assert!(reg.for_name("*3", false, &env).unwrap().is_invalid());
    }
}
