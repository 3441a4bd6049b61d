// bspfile.rs — bounds-checked readers for the BSP container, its lumps and the BSPX directory

use rayon::prelude::*;

use crate::common::com_dprintf;
use crate::error::{LoadError, LoadResult};
use crate::q_shared::Vec3;
use crate::qfiles::*;

// ============================================================
// Cursor
// ============================================================

/// Little-endian cursor over a byte slice. Every read is bounds-checked.
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn at(data: &'a [u8], pos: usize) -> Self {
        Self { data, pos }
    }

    #[inline]
    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn seek(&mut self, pos: usize) {
        self.pos = pos;
    }

    pub fn bytes(&mut self, n: usize) -> LoadResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&e| e <= self.data.len())
            .ok_or(LoadError::BadFileRange {
                offset: self.pos,
                len: n,
                size: self.data.len(),
            })?;
        let out = &self.data[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    pub fn skip(&mut self, n: usize) -> LoadResult<()> {
        self.bytes(n).map(|_| ())
    }

    fn array<const N: usize>(&mut self) -> LoadResult<[u8; N]> {
        let b = self.bytes(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(b);
        Ok(out)
    }

    pub fn u8(&mut self) -> LoadResult<u8> {
        Ok(self.array::<1>()?[0])
    }

    pub fn i16(&mut self) -> LoadResult<i16> {
        Ok(i16::from_le_bytes(self.array()?))
    }

    pub fn u16(&mut self) -> LoadResult<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    pub fn i32(&mut self) -> LoadResult<i32> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    pub fn u32(&mut self) -> LoadResult<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub fn f32(&mut self) -> LoadResult<f32> {
        Ok(f32::from_le_bytes(self.array()?))
    }

    pub fn vec3(&mut self) -> LoadResult<Vec3> {
        Ok([self.f32()?, self.f32()?, self.f32()?])
    }

    /// Three shorts widened to floats (16-bit bounding boxes).
    pub fn short_vec3(&mut self) -> LoadResult<Vec3> {
        Ok([self.i16()? as f32, self.i16()? as f32, self.i16()? as f32])
    }

    /// A fixed-size, NUL-padded name field.
    pub fn name(&mut self, len: usize) -> LoadResult<String> {
        let raw = self.bytes(len)?;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(len);
        Ok(String::from_utf8_lossy(&raw[..end]).into_owned())
    }
}

/// Reads a little-endian i32 at `ofs`, if it fits.
pub fn read_i32_at(data: &[u8], ofs: usize) -> Option<i32> {
    let b = data.get(ofs..ofs.checked_add(4)?)?;
    Some(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

// ============================================================
// Lump records
// ============================================================

/// Lumps with more records than this are decoded on the rayon pool.
pub const PARALLEL_THRESHOLD: usize = 64;

/// Splits a lump into fixed-size records and decodes each one.
pub fn decode_records<T, F>(model: &str, lump: &'static str, data: &[u8], record: usize, decode: F) -> LoadResult<Vec<T>>
where
    T: Send,
    F: Fn(&mut ByteReader) -> LoadResult<T> + Sync,
{
    if data.len() % record != 0 {
        return Err(LoadError::FunnyLumpSize {
            model: model.to_string(),
            lump,
            len: data.len(),
            record,
        });
    }
    let count = data.len() / record;
    if count > PARALLEL_THRESHOLD {
        data.par_chunks(record)
            .map(|chunk| decode(&mut ByteReader::new(chunk)))
            .collect()
    } else {
        data.chunks(record)
            .map(|chunk| decode(&mut ByteReader::new(chunk)))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DPlane {
    pub normal: Vec3,
    pub dist: f32,
    pub plane_type: i32,
}

impl DPlane {
    pub fn decode(r: &mut ByteReader) -> LoadResult<Self> {
        Ok(Self {
            normal: r.vec3()?,
            dist: r.f32()?,
            plane_type: r.i32()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DTexinfo {
    pub vecs: [[f32; 4]; 2],
    pub miptex: i32,
    pub flags: i32,
}

impl DTexinfo {
    pub fn decode(r: &mut ByteReader) -> LoadResult<Self> {
        let mut vecs = [[0.0f32; 4]; 2];
        for row in vecs.iter_mut() {
            for v in row.iter_mut() {
                *v = r.f32()?;
            }
        }
        Ok(Self {
            vecs,
            miptex: r.i32()?,
            flags: r.i32()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DModel {
    pub mins: Vec3,
    pub maxs: Vec3,
    pub origin: Vec3,
    pub headnode: [i32; MAX_MAP_HULLS],
    pub visleafs: i32,
    pub firstface: i32,
    pub numfaces: i32,
}

impl DModel {
    pub fn decode(r: &mut ByteReader) -> LoadResult<Self> {
        let mins = r.vec3()?;
        let maxs = r.vec3()?;
        let origin = r.vec3()?;
        let mut headnode = [0i32; MAX_MAP_HULLS];
        for h in headnode.iter_mut() {
            *h = r.i32()?;
        }
        Ok(Self {
            mins,
            maxs,
            origin,
            headnode,
            visleafs: r.i32()?,
            firstface: r.i32()?,
            numfaces: r.i32()?,
        })
    }
}

pub fn decode_short_edge(r: &mut ByteReader) -> LoadResult<[u32; 2]> {
    Ok([r.u16()? as u32, r.u16()? as u32])
}

pub fn decode_long_edge(r: &mut ByteReader) -> LoadResult<[u32; 2]> {
    Ok([r.u32()?, r.u32()?])
}

/// A face record widened to 32-bit fields.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DFace {
    pub planenum: u32,
    pub side: i32,
    pub firstedge: i32,
    pub numedges: u32,
    pub texinfo: u32,
    pub styles: [u8; MAXLIGHTMAPS],
    pub lightofs: i32,
}

impl DFace {
    pub fn decode_short(r: &mut ByteReader) -> LoadResult<Self> {
        Ok(Self {
            planenum: r.u16()? as u32,
            side: r.i16()? as i32,
            firstedge: r.i32()?,
            numedges: r.u16()? as u32,
            texinfo: r.u16()? as u32,
            styles: [r.u8()?, r.u8()?, r.u8()?, r.u8()?],
            lightofs: r.i32()?,
        })
    }

    pub fn decode_long(r: &mut ByteReader) -> LoadResult<Self> {
        Ok(Self {
            planenum: r.u32()?,
            side: r.i32()?,
            firstedge: r.i32()?,
            numedges: r.u32()?,
            texinfo: r.u32()?,
            styles: [r.u8()?, r.u8()?, r.u8()?, r.u8()?],
            lightofs: r.i32()?,
        })
    }
}

/// A node record. Children are kept raw; their meaning depends on the
/// layout and the node/leaf counts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DNode {
    pub planenum: i32,
    pub children: [u32; 2],
    pub mins: Vec3,
    pub maxs: Vec3,
    pub firstface: u32,
    pub numfaces: u32,
}

impl DNode {
    pub fn decode(layout: BspLayout, r: &mut ByteReader) -> LoadResult<Self> {
        let planenum = r.i32()?;
        let children = match layout {
            BspLayout::Short => [r.u16()? as u32, r.u16()? as u32],
            _ => [r.u32()?, r.u32()?],
        };
        let (mins, maxs) = match layout {
            BspLayout::Long2 => (r.vec3()?, r.vec3()?),
            _ => (r.short_vec3()?, r.short_vec3()?),
        };
        let (firstface, numfaces) = match layout {
            BspLayout::Short => (r.u16()? as u32, r.u16()? as u32),
            _ => (r.u32()?, r.u32()?),
        };
        Ok(Self {
            planenum,
            children,
            mins,
            maxs,
            firstface,
            numfaces,
        })
    }

    pub fn record_size(layout: BspLayout) -> usize {
        match layout {
            BspLayout::Short => DSNODE_SIZE,
            BspLayout::Long1 => DL1NODE_SIZE,
            BspLayout::Long2 => DL2NODE_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DLeaf {
    pub contents: i32,
    pub visofs: i32,
    pub mins: Vec3,
    pub maxs: Vec3,
    pub firstmarksurface: u32,
    pub nummarksurfaces: u32,
    pub ambient_level: [u8; NUM_AMBIENTS],
}

impl DLeaf {
    pub fn decode(layout: BspLayout, r: &mut ByteReader) -> LoadResult<Self> {
        let contents = r.i32()?;
        let visofs = r.i32()?;
        let (mins, maxs) = match layout {
            BspLayout::Long2 => (r.vec3()?, r.vec3()?),
            _ => (r.short_vec3()?, r.short_vec3()?),
        };
        let (firstmarksurface, nummarksurfaces) = match layout {
            BspLayout::Short => (r.u16()? as u32, r.u16()? as u32),
            _ => (r.u32()?, r.u32()?),
        };
        Ok(Self {
            contents,
            visofs,
            mins,
            maxs,
            firstmarksurface,
            nummarksurfaces,
            ambient_level: [r.u8()?, r.u8()?, r.u8()?, r.u8()?],
        })
    }

    pub fn record_size(layout: BspLayout) -> usize {
        match layout {
            BspLayout::Short => DSLEAF_SIZE,
            BspLayout::Long1 => DL1LEAF_SIZE,
            BspLayout::Long2 => DL2LEAF_SIZE,
        }
    }
}

/// A clipnode record. Short children are zero-extended; the loader folds
/// them back into content values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DClipnode {
    pub planenum: i32,
    pub children: [i32; 2],
}

impl DClipnode {
    pub fn decode(layout: BspLayout, r: &mut ByteReader) -> LoadResult<Self> {
        let planenum = r.i32()?;
        let children = match layout {
            BspLayout::Short => [r.u16()? as i32, r.u16()? as i32],
            _ => [r.i32()?, r.i32()?],
        };
        Ok(Self { planenum, children })
    }

    pub fn record_size(layout: BspLayout) -> usize {
        match layout {
            BspLayout::Short => DSCLIPNODE_SIZE,
            _ => DLCLIPNODE_SIZE,
        }
    }
}

// ============================================================
// Container
// ============================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Lump {
    pub fileofs: i32,
    pub filelen: i32,
}

impl Lump {
    pub fn end(&self) -> i64 {
        self.fileofs as i64 + self.filelen as i64
    }
}

/// A parsed BSP header over the raw file image.
#[derive(Debug, Clone)]
pub struct BspFile<'a> {
    pub data: &'a [u8],
    pub version: i32,
    pub layout: BspLayout,
    pub lumps: [Lump; HEADER_LUMPS],
    pub bspx: Option<BspxDirectory>,
}

impl<'a> BspFile<'a> {
    pub fn parse(model: &str, data: &'a [u8]) -> LoadResult<BspFile<'a>> {
        let mut r = ByteReader::new(data);
        let version = r.i32()?;
        let layout = BspLayout::for_version(version).ok_or_else(|| LoadError::UnsupportedVersion {
            model: model.to_string(),
            version,
        })?;

        let mut lumps = [Lump::default(); HEADER_LUMPS];
        for lump in lumps.iter_mut() {
            lump.fileofs = r.i32()?;
            lump.filelen = r.i32()?;
            if lump.fileofs < 0 || lump.filelen < 0 || lump.end() > data.len() as i64 {
                return Err(LoadError::BadFileRange {
                    offset: lump.fileofs.max(0) as usize,
                    len: lump.filelen.max(0) as usize,
                    size: data.len(),
                });
            }
        }

        let bspx = BspxDirectory::parse(model, data, &lumps);
        Ok(BspFile {
            data,
            version,
            layout,
            lumps,
            bspx,
        })
    }

    pub fn lump(&self, index: usize) -> &'a [u8] {
        let l = self.lumps[index];
        &self.data[l.fileofs as usize..l.end() as usize]
    }

    pub fn lump_offset(&self, index: usize) -> usize {
        self.lumps[index].fileofs as usize
    }

    /// Decodes a fixed-record lump.
    pub fn records<T, F>(&self, model: &str, index: usize, record: usize, decode: F) -> LoadResult<Vec<T>>
    where
        T: Send,
        F: Fn(&mut ByteReader) -> LoadResult<T> + Sync,
    {
        decode_records(model, LUMP_NAMES[index], self.lump(index), record, decode)
    }

    /// Contents of a named BSPX lump.
    pub fn bspx_lump(&self, name: &str) -> Option<&'a [u8]> {
        let entry = self.bspx.as_ref()?.find(name)?;
        self.data.get(entry.fileofs as usize..entry.fileofs as usize + entry.filelen as usize)
    }
}

// ============================================================
// BSPX
// ============================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BspxLump {
    pub name: String,
    pub fileofs: u32,
    pub filelen: u32,
}

/// The optional extension directory stored after the last standard lump.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BspxDirectory {
    pub lumps: Vec<BspxLump>,
}

impl BspxDirectory {
    /// Locates and validates the directory. Returns `None` if there is no
    /// room for one, the magic is wrong, or any entry points outside the file.
    pub fn parse(model: &str, data: &[u8], lumps: &[Lump]) -> Option<BspxDirectory> {
        let filelen = data.len();
        let mut offs: i64 = 0;
        let mut misaligned = false;
        for (i, l) in lumps.iter().enumerate() {
            if (l.fileofs & 3) != 0 && i != LUMP_ENTITIES {
                misaligned = true;
            }
            offs = offs.max(l.end());
        }
        if misaligned {
            com_dprintf(&format!("{} contains misaligned lumps\n", model));
        }
        let offs = ((offs + 3) & !3) as usize;
        if offs + BSPX_HEADER_SIZE > filelen {
            return None;
        }

        let mut r = ByteReader::at(data, offs);
        if r.bytes(4).ok()? != BSPX_IDENT {
            return None;
        }
        let numlumps = r.i32().ok()?;
        if numlumps < 0 || offs + 8 + BSPX_LUMP_SIZE * numlumps as usize > filelen {
            return None;
        }

        let mut out = Vec::with_capacity(numlumps as usize);
        for _ in 0..numlumps {
            let name = r.name(BSPX_LUMPNAME_LEN).ok()?;
            let fileofs = r.u32().ok()?;
            let filelen_entry = r.u32().ok()?;
            if fileofs & 3 != 0 {
                com_dprintf(&format!("{} contains misaligned bspx lump {}\n", model, name));
            }
            if fileofs as u64 + filelen_entry as u64 > filelen as u64 {
                return None;
            }
            out.push(BspxLump {
                name,
                fileofs,
                filelen: filelen_entry,
            });
        }
        Some(BspxDirectory { lumps: out })
    }

    /// Unknown names are simply not found.
    pub fn find(&self, name: &str) -> Option<&BspxLump> {
        self.lumps.iter().find(|l| l.name == name)
    }
}
