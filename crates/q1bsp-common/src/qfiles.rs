// qfiles.rs — Quake BSP file format constants and on-disk record layouts

// ============================================================
// PAK files
// ============================================================

/// PAK file magic: "PACK" in little-endian
pub const IDPAKHEADER: i32 = (b'K' as i32) << 24 | (b'C' as i32) << 16 | (b'A' as i32) << 8 | b'P' as i32;

pub const DPACKHEADER_SIZE: usize = 12;
/// name[56] + filepos + filelen
pub const DPACKFILE_SIZE: usize = 64;
pub const PACK_NAME_LEN: usize = 56;

pub const MAX_FILES_IN_PACK: usize = 4096;

// ============================================================
// Model magics
// ============================================================

const fn fourcc(s: &[u8; 4]) -> i32 {
    (s[0] as i32) | (s[1] as i32) << 8 | (s[2] as i32) << 16 | (s[3] as i32) << 24
}

pub const IDPOLYHEADER: i32 = fourcc(b"IDPO");
pub const IDSPRITEHEADER: i32 = fourcc(b"IDSP");
pub const QF16HEADER: i32 = fourcc(b"MD16");
pub const MD2HEADER: i32 = fourcc(b"IDP2");
pub const MD3HEADER: i32 = fourcc(b"IDP3");
pub const MD5HEADER: i32 = fourcc(b"MD5V");
pub const IQMHEADER: i32 = fourcc(b"INTE");
pub const H2MPHEADER: i32 = fourcc(b"RAPO");
pub const DPMHEADER: i32 = fourcc(b"DARK");
pub const PSKHEADER: i32 = fourcc(b"ACTR");
pub const IBSPHEADER: i32 = fourcc(b"IBSP");

/// Human-readable name for a non-brush model magic, if it is one.
pub fn foreign_model_format(magic: i32) -> Option<&'static str> {
    Some(match magic {
        IDPOLYHEADER | QF16HEADER => "alias model",
        IDSPRITEHEADER => "sprite",
        MD2HEADER => "md2",
        MD3HEADER => "md3",
        MD5HEADER => "md5",
        IQMHEADER => "iqm",
        H2MPHEADER => "hexen2-missionpack model",
        DPMHEADER => "dpm",
        PSKHEADER => "psk",
        IBSPHEADER => "q2/q3bsp",
        _ => return None,
    })
}

// ============================================================
// BSP versions
// ============================================================

pub const BSPVERSION: i32 = 29;
/// First BSP2 revision: 32-bit indices, 16-bit bounds.
pub const BSP2VERSION_2PSB: i32 = fourcc(b"2PSB");
/// Second BSP2 revision: 32-bit indices, float bounds.
pub const BSP2VERSION_BSP2: i32 = fourcc(b"BSP2");
/// Quake64 rerelease.
pub const BSPVERSION_QUAKE64: i32 = fourcc(b" 46Q");

/// Which record layout the index-bearing lumps use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BspLayout {
    /// 16-bit indices and bounds.
    Short,
    /// 32-bit indices, 16-bit bounds (2PSB).
    Long1,
    /// 32-bit indices, float bounds (BSP2).
    Long2,
}

impl BspLayout {
    pub fn for_version(version: i32) -> Option<BspLayout> {
        match version {
            BSPVERSION | BSPVERSION_QUAKE64 => Some(BspLayout::Short),
            BSP2VERSION_2PSB => Some(BspLayout::Long1),
            BSP2VERSION_BSP2 => Some(BspLayout::Long2),
            _ => None,
        }
    }

    pub fn is_bsp2(self) -> bool {
        self != BspLayout::Short
    }
}

// ============================================================
// Lumps
// ============================================================

pub const LUMP_ENTITIES: usize = 0;
pub const LUMP_PLANES: usize = 1;
pub const LUMP_TEXTURES: usize = 2;
pub const LUMP_VERTEXES: usize = 3;
pub const LUMP_VISIBILITY: usize = 4;
pub const LUMP_NODES: usize = 5;
pub const LUMP_TEXINFO: usize = 6;
pub const LUMP_FACES: usize = 7;
pub const LUMP_LIGHTING: usize = 8;
pub const LUMP_CLIPNODES: usize = 9;
pub const LUMP_LEAFS: usize = 10;
pub const LUMP_MARKSURFACES: usize = 11;
pub const LUMP_EDGES: usize = 12;
pub const LUMP_SURFEDGES: usize = 13;
pub const LUMP_MODELS: usize = 14;
pub const HEADER_LUMPS: usize = 15;

/// version + 15 (fileofs, filelen) pairs
pub const DHEADER_SIZE: usize = 4 + HEADER_LUMPS * 8;

pub const LUMP_NAMES: [&str; HEADER_LUMPS] = [
    "entities",
    "planes",
    "textures",
    "vertexes",
    "visibility",
    "nodes",
    "texinfo",
    "faces",
    "lighting",
    "clipnodes",
    "leafs",
    "marksurfaces",
    "edges",
    "surfedges",
    "models",
];

// ============================================================
// BSPX
// ============================================================

pub const BSPX_IDENT: &[u8; 4] = b"BSPX";
pub const BSPX_LUMPNAME_LEN: usize = 24;
/// name[24] + fileofs + filelen
pub const BSPX_LUMP_SIZE: usize = BSPX_LUMPNAME_LEN + 8;
/// id[4] + numlumps + one lump entry
pub const BSPX_HEADER_SIZE: usize = 8 + BSPX_LUMP_SIZE;

pub const BSPX_RGBLIGHTING: &str = "RGBLIGHTING";
pub const BSPX_LIGHTING_E5BGR9: &str = "LIGHTING_E5BGR9";
pub const BSPX_LMSHIFT: &str = "LMSHIFT";
pub const BSPX_LMOFFSET: &str = "LMOFFSET";
pub const BSPX_LMSTYLE: &str = "LMSTYLE";
pub const BSPX_LMSTYLE16: &str = "LMSTYLE16";
pub const BSPX_DECOUPLED_LM: &str = "DECOUPLED_LM";
pub const BSPX_LIGHTGRID_OCTREE: &str = "LIGHTGRID_OCTREE";

// ============================================================
// Record sizes
// ============================================================

pub const DPLANE_SIZE: usize = 20;
pub const DVERTEX_SIZE: usize = 12;
pub const TEXINFO_SIZE: usize = 40;
pub const DMODEL_SIZE: usize = 64;
pub const DSEDGE_SIZE: usize = 4;
pub const DLEDGE_SIZE: usize = 8;
pub const SURFEDGE_SIZE: usize = 4;
pub const DSMARKSURF_SIZE: usize = 2;
pub const DLMARKSURF_SIZE: usize = 4;
pub const DSFACE_SIZE: usize = 20;
pub const DLFACE_SIZE: usize = 28;
pub const DSNODE_SIZE: usize = 24;
pub const DL1NODE_SIZE: usize = 32;
pub const DL2NODE_SIZE: usize = 44;
pub const DSLEAF_SIZE: usize = 28;
pub const DL1LEAF_SIZE: usize = 32;
pub const DL2LEAF_SIZE: usize = 44;
pub const DSCLIPNODE_SIZE: usize = 8;
pub const DLCLIPNODE_SIZE: usize = 12;
/// lmsize u16[2] + lmoffset + lmvecs f32[2][4]
pub const DECOUPLED_LM_SIZE: usize = 40;

pub const MIPLEVELS: usize = 4;
/// name[16] + width + height + offsets[4]
pub const MIPTEX_SIZE: usize = 40;
/// Quake64 adds a `shift` field before the pixel data.
pub const MIPTEX64_SIZE: usize = 44;
pub const MIPTEX_NAME_LEN: usize = 16;

/// Magic that introduces the extension block after the legacy mip data.
pub const MIPTEX_EXT_MAGIC: [u8; 4] = [0x00, 0xfb, 0x2b, 0xaf];

// ============================================================
// Limits
// ============================================================

pub const MAX_MAP_HULLS: usize = 4;
pub const MAXLIGHTMAPS: usize = 4;
pub const NUM_AMBIENTS: usize = 4;

pub const INVALID_LIGHTSTYLE_OLD: u8 = 255;
pub const INVALID_LIGHTSTYLE: u16 = 0xffff;

pub const MAX_STANDARD_FACES: usize = 32767;
pub const MAX_STANDARD_NODES: usize = 32767;
pub const MAX_STANDARD_CLIPNODES: usize = 32767;
pub const MAX_STANDARD_MARKSURFACES: usize = 32767;
pub const MAX_STANDARD_VISLEAFS: usize = 8192;
/// Hard limit for BSP29 leafs, the short child encoding can't address more.
pub const MAX_BSP29_LEAFS: usize = 32767;

// texinfo flags
pub const TEX_SPECIAL: i32 = 1;
/// Set by the loader when the texture is not present in the file.
pub const TEX_MISSING: i32 = 2;

// ============================================================
// External vis patch
// ============================================================

/// mapname[32] + filelen
pub const VISPATCH_HEADER_LEN: usize = 36;
pub const VISPATCH_MAPNAME_LEN: usize = 32;

// ============================================================
// .lit sidecar
// ============================================================

pub const LIT_IDENT: &[u8; 4] = b"QLIT";
pub const LIT_VERSION_LDR: i32 = 1;
pub const LIT_VERSION_HDR: i32 = 0x10001;
pub const LIT_HEADER_SIZE: usize = 8;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_versions_map_to_layouts() {
        assert_eq!(BspLayout::for_version(29), Some(BspLayout::Short));
        assert_eq!(BspLayout::for_version(BSPVERSION_QUAKE64), Some(BspLayout::Short));
        assert_eq!(BspLayout::for_version(BSP2VERSION_2PSB), Some(BspLayout::Long1));
        assert_eq!(BspLayout::for_version(BSP2VERSION_BSP2), Some(BspLayout::Long2));
        assert_eq!(BspLayout::for_version(30), None);
    }

    #[test]
    fn test_fourcc_is_little_endian() {
        assert_eq!(BSP2VERSION_BSP2.to_le_bytes(), *b"BSP2");
        assert_eq!(BSPVERSION_QUAKE64.to_le_bytes(), *b" 46Q");
        assert_eq!(IDPAKHEADER.to_le_bytes(), *b"PACK");
    }

    #[test]
    fn test_foreign_formats() {
        assert_eq!(foreign_model_format(IDPOLYHEADER), Some("alias model"));
        assert_eq!(foreign_model_format(IBSPHEADER), Some("q2/q3bsp"));
        assert_eq!(foreign_model_format(BSPVERSION), None);
    }
}
