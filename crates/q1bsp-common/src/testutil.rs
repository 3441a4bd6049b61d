// testutil.rs — synthetic BSP images and miptex lumps for tests

use crate::qfiles::*;

/// Writes one miptex record. With pixels, only mip 0 is stored and the
/// other offsets point at where the smaller levels would be; without, all
/// offsets are zero.
pub fn build_miptex(name: &str, width: u32, height: u32, pixels: Option<&[u8]>) -> Vec<u8> {
    let mut out = Vec::with_capacity(MIPTEX_SIZE);
    let mut raw = [0u8; MIPTEX_NAME_LEN];
    let n = name.len().min(MIPTEX_NAME_LEN - 1);
    raw[..n].copy_from_slice(&name.as_bytes()[..n]);
    out.extend_from_slice(&raw);
    out.extend_from_slice(&width.to_le_bytes());
    out.extend_from_slice(&height.to_le_bytes());

    match pixels {
        Some(p) => {
            let area = width * height;
            let mut ofs = MIPTEX_SIZE as u32;
            for level in 0..MIPLEVELS as u32 {
                out.extend_from_slice(&ofs.to_le_bytes());
                ofs += area >> (2 * level);
            }
            out.extend_from_slice(p);
        }
        None => out.extend_from_slice(&[0u8; 4 * MIPLEVELS]),
    }
    out
}

/// Texture lump: count, per-texture offsets (-1 for holes), then records.
pub fn build_texture_lump(textures: &[Option<Vec<u8>>]) -> Vec<u8> {
    let header = 4 + 4 * textures.len();
    let mut out = Vec::new();
    out.extend_from_slice(&(textures.len() as i32).to_le_bytes());
    let mut ofs = header;
    for t in textures {
        match t {
            Some(data) => {
                out.extend_from_slice(&(ofs as i32).to_le_bytes());
                ofs += data.len();
            }
            None => out.extend_from_slice(&(-1i32).to_le_bytes()),
        }
    }
    for data in textures.iter().flatten() {
        out.extend_from_slice(data);
    }
    out
}

#[derive(Debug, Clone)]
struct TestFace {
    plane: u16,
    firstedge: i32,
    numedges: u16,
    styles: [u8; 4],
    lightofs: i32,
}

#[derive(Debug, Clone)]
struct TestLeaf {
    contents: i32,
    visofs: i32,
    firstmark: u16,
    nummarks: u16,
}

#[derive(Debug, Clone)]
struct TestModel {
    mins: [f32; 3],
    maxs: [f32; 3],
    visleafs: i32,
    firstface: i32,
    numfaces: i32,
}

/// Builds BSP29 images. The default world is two rooms split by the plane
/// x = 0: leaf 1 in front (+x), leaf 2 behind, each seeing the other, with
/// a single lit 64x64 floor face in room 1.
#[derive(Debug, Clone)]
pub struct BspBuilder {
    entities: String,
    planes: Vec<([f32; 3], f32, i32)>,
    texture_name: String,
    vertexes: Vec<[f32; 3]>,
    edges: Vec<[u16; 2]>,
    surfedges: Vec<i32>,
    faces: Vec<TestFace>,
    lighting: Vec<u8>,
    visibility: Vec<u8>,
    leafs: Vec<TestLeaf>,
    marksurfaces: Vec<u16>,
    models: Vec<TestModel>,
    node_plane: i32,
    raw_lumps: Vec<(usize, Vec<u8>)>,
    bspx: Vec<(String, Vec<u8>)>,
}

impl BspBuilder {
    pub fn two_room_world() -> Self {
        Self {
            entities: "{\n\"classname\" \"worldspawn\"\n\"wad\" \"gfx/base.wad\"\n}\n".to_string(),
            planes: vec![([1.0, 0.0, 0.0], 0.0, PLANE_X_TYPE), ([0.0, 0.0, 1.0], 0.0, PLANE_Z_TYPE)],
            texture_name: "ground1_1".to_string(),
            vertexes: vec![[0.0, 0.0, 0.0], [64.0, 0.0, 0.0], [64.0, 64.0, 0.0], [0.0, 64.0, 0.0]],
            edges: vec![[0, 0], [0, 1], [1, 2], [2, 3], [3, 0]],
            surfedges: vec![1, 2, 3, 4],
            faces: vec![TestFace {
                plane: 1,
                firstedge: 0,
                numedges: 4,
                styles: [0, 255, 255, 255],
                lightofs: 0,
            }],
            // 64 units at 16 per luxel is 5x5 samples
            lighting: vec![64; 25],
            visibility: vec![0x03],
            leafs: vec![
                TestLeaf {
                    contents: -2,
                    visofs: -1,
                    firstmark: 0,
                    nummarks: 0,
                },
                TestLeaf {
                    contents: -1,
                    visofs: 0,
                    firstmark: 0,
                    nummarks: 1,
                },
                TestLeaf {
                    contents: -1,
                    visofs: 0,
                    firstmark: 1,
                    nummarks: 0,
                },
            ],
            marksurfaces: vec![0],
            models: vec![TestModel {
                mins: [-128.0, -128.0, -64.0],
                maxs: [128.0, 128.0, 64.0],
                visleafs: 2,
                firstface: 0,
                numfaces: 1,
            }],
            node_plane: 0,
            raw_lumps: Vec::new(),
            bspx: Vec::new(),
        }
    }

    /// Adds a 32x32 vertical face as inline model `*1`. It has no light data.
    pub fn with_door_submodel(mut self) -> Self {
        let base = self.vertexes.len() as u16;
        self.vertexes.extend_from_slice(&[
            [32.0, 0.0, 0.0],
            [32.0, 32.0, 0.0],
            [32.0, 32.0, 32.0],
            [32.0, 0.0, 32.0],
        ]);
        let firstedge = self.edges.len() as i32;
        for i in 0..4u16 {
            self.edges.push([base + i, base + (i + 1) % 4]);
        }
        let firstsurfedge = self.surfedges.len() as i32;
        self.surfedges.extend(firstedge..firstedge + 4);
        self.faces.push(TestFace {
            plane: 0,
            firstedge: firstsurfedge,
            numedges: 4,
            styles: [255; 4],
            lightofs: -1,
        });
        self.models.push(TestModel {
            mins: [32.0, 0.0, 0.0],
            maxs: [32.0, 32.0, 32.0],
            visleafs: 0,
            firstface: self.faces.len() as i32 - 1,
            numfaces: 1,
        });
        self
    }

    /// Turns room 2 into water holding the floor face. When `sees_out` is
    /// false the water leaf's PVS contains only itself.
    pub fn with_water_room(mut self, sees_out: bool) -> Self {
        self.texture_name = "*water1".to_string();
        self.leafs[2].contents = -3;
        self.leafs[2].firstmark = 0;
        self.leafs[2].nummarks = 1;
        if !sees_out {
            self.visibility = vec![0x03, 0x02];
            self.leafs[2].visofs = 1;
        }
        self
    }

    /// Splits the rooms on the floor plane instead: leaf 1 above z = 0,
    /// leaf 2 below. Light probes cast straight down then land on the floor.
    pub fn with_floor_node(mut self) -> Self {
        self.node_plane = 1;
        self
    }

    pub fn with_marksurface(mut self, index: u16) -> Self {
        self.marksurfaces.push(index);
        self
    }

    /// Replaces a lump's bytes outright.
    pub fn with_raw_lump(mut self, lump: usize, data: Vec<u8>) -> Self {
        self.raw_lumps.push((lump, data));
        self
    }

    pub fn with_bspx(mut self, name: &str, data: Vec<u8>) -> Self {
        self.bspx.push((name.to_string(), data));
        self
    }

    pub fn with_entities(mut self, entities: &str) -> Self {
        self.entities = entities.to_string();
        self
    }

    /// Bytes in the mono lighting lump.
    pub fn light_samples(&self) -> usize {
        self.lighting.len()
    }

    /// The leafs lump in BSP29 layout, with visibility offsets replaced.
    pub fn leaf_lump_with_visofs(&self, visofs: &[i32]) -> Vec<u8> {
        let mut leafs = self.leafs.clone();
        for (leaf, &ofs) in leafs.iter_mut().zip(visofs) {
            leaf.visofs = ofs;
        }
        encode_leafs(&leafs)
    }

    pub fn build(&self) -> Vec<u8> {
        let mut lumps: Vec<Vec<u8>> = vec![Vec::new(); HEADER_LUMPS];

        let mut ents = self.entities.clone().into_bytes();
        ents.push(0);
        lumps[LUMP_ENTITIES] = ents;

        for (normal, dist, ty) in &self.planes {
            let l = &mut lumps[LUMP_PLANES];
            for v in normal {
                l.extend_from_slice(&v.to_le_bytes());
            }
            l.extend_from_slice(&dist.to_le_bytes());
            l.extend_from_slice(&ty.to_le_bytes());
        }

        let pixels = vec![7u8; 16 * 16];
        lumps[LUMP_TEXTURES] = build_texture_lump(&[Some(build_miptex(&self.texture_name, 16, 16, Some(&pixels)))]);

        for v in &self.vertexes {
            for c in v {
                lumps[LUMP_VERTEXES].extend_from_slice(&c.to_le_bytes());
            }
        }

        lumps[LUMP_VISIBILITY] = self.visibility.clone();

        // one node: front is leaf 1, back is leaf 2
        {
            let l = &mut lumps[LUMP_NODES];
            l.extend_from_slice(&self.node_plane.to_le_bytes());
            l.extend_from_slice(&(65535u16 - 1).to_le_bytes());
            l.extend_from_slice(&(65535u16 - 2).to_le_bytes());
            for v in [-128i16, -128, -64, 128, 128, 64] {
                l.extend_from_slice(&v.to_le_bytes());
            }
            l.extend_from_slice(&0u16.to_le_bytes());
            l.extend_from_slice(&1u16.to_le_bytes());
        }

        {
            let l = &mut lumps[LUMP_TEXINFO];
            for v in [1.0f32, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0] {
                l.extend_from_slice(&v.to_le_bytes());
            }
            l.extend_from_slice(&0i32.to_le_bytes());
            l.extend_from_slice(&0i32.to_le_bytes());
        }

        for f in &self.faces {
            let l = &mut lumps[LUMP_FACES];
            l.extend_from_slice(&f.plane.to_le_bytes());
            l.extend_from_slice(&0u16.to_le_bytes());
            l.extend_from_slice(&f.firstedge.to_le_bytes());
            l.extend_from_slice(&f.numedges.to_le_bytes());
            l.extend_from_slice(&0u16.to_le_bytes());
            l.extend_from_slice(&f.styles);
            l.extend_from_slice(&f.lightofs.to_le_bytes());
        }

        lumps[LUMP_LIGHTING] = self.lighting.clone();
        lumps[LUMP_LEAFS] = encode_leafs(&self.leafs);

        for m in &self.marksurfaces {
            lumps[LUMP_MARKSURFACES].extend_from_slice(&m.to_le_bytes());
        }
        for e in &self.edges {
            for v in e {
                lumps[LUMP_EDGES].extend_from_slice(&v.to_le_bytes());
            }
        }
        for s in &self.surfedges {
            lumps[LUMP_SURFEDGES].extend_from_slice(&s.to_le_bytes());
        }

        for m in &self.models {
            let l = &mut lumps[LUMP_MODELS];
            for v in m.mins.iter().chain(m.maxs.iter()).chain([0.0f32; 3].iter()) {
                l.extend_from_slice(&v.to_le_bytes());
            }
            for _ in 0..MAX_MAP_HULLS {
                l.extend_from_slice(&0i32.to_le_bytes());
            }
            l.extend_from_slice(&m.visleafs.to_le_bytes());
            l.extend_from_slice(&m.firstface.to_le_bytes());
            l.extend_from_slice(&m.numfaces.to_le_bytes());
        }

        for (idx, data) in &self.raw_lumps {
            lumps[*idx] = data.clone();
        }

        let mut out = vec![0u8; DHEADER_SIZE];
        out[0..4].copy_from_slice(&BSPVERSION.to_le_bytes());
        for (i, data) in lumps.iter().enumerate() {
            while out.len() % 4 != 0 {
                out.push(0);
            }
            let ofs = out.len() as i32;
            let h = 4 + i * 8;
            out[h..h + 4].copy_from_slice(&ofs.to_le_bytes());
            out[h + 4..h + 8].copy_from_slice(&(data.len() as i32).to_le_bytes());
            out.extend_from_slice(data);
        }

        if !self.bspx.is_empty() {
            append_bspx(&mut out, &self.bspx);
        }
        out
    }
}

const PLANE_X_TYPE: i32 = 0;
const PLANE_Z_TYPE: i32 = 2;

fn encode_leafs(leafs: &[TestLeaf]) -> Vec<u8> {
    let mut l = Vec::with_capacity(leafs.len() * DSLEAF_SIZE);
    for leaf in leafs {
        l.extend_from_slice(&leaf.contents.to_le_bytes());
        l.extend_from_slice(&leaf.visofs.to_le_bytes());
        for v in [-128i16, -128, -64, 128, 128, 64] {
            l.extend_from_slice(&v.to_le_bytes());
        }
        l.extend_from_slice(&leaf.firstmark.to_le_bytes());
        l.extend_from_slice(&leaf.nummarks.to_le_bytes());
        l.extend_from_slice(&[0u8; NUM_AMBIENTS]);
    }
    l
}

fn append_bspx(out: &mut Vec<u8>, entries: &[(String, Vec<u8>)]) {
    while out.len() % 4 != 0 {
        out.push(0);
    }
    let dir_start = out.len();
    let mut ofs = dir_start + 8 + entries.len() * BSPX_LUMP_SIZE;
    out.extend_from_slice(BSPX_IDENT);
    out.extend_from_slice(&(entries.len() as i32).to_le_bytes());
    for (name, data) in entries {
        let mut raw = [0u8; BSPX_LUMPNAME_LEN];
        let n = name.len().min(BSPX_LUMPNAME_LEN - 1);
        raw[..n].copy_from_slice(&name.as_bytes()[..n]);
        out.extend_from_slice(&raw);
        out.extend_from_slice(&(ofs as u32).to_le_bytes());
        out.extend_from_slice(&(data.len() as u32).to_le_bytes());
        ofs += (data.len() + 3) & !3;
    }
    for (_, data) in entries {
        out.extend_from_slice(data);
        while out.len() % 4 != 0 {
            out.push(0);
        }
    }
}
