// files.rs — virtual filesystem: ordered search paths over directories and PACK archives
//
// Every search path gets a `path_id` when it is added. Later paths have
// higher ids and are searched first. Loaders compare the id of a sidecar
// file against the id of the map it belongs to.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Cursor, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rayon::prelude::*;

use crate::common::{com_dprintf, com_printf};
use crate::error::{LoadError, LoadResult};
use crate::qfiles::{DPACKFILE_SIZE, DPACKHEADER_SIZE, IDPAKHEADER, MAX_FILES_IN_PACK, PACK_NAME_LEN};

// ============================================================
// Packs
// ============================================================

/// A file entry within a pack.
#[derive(Debug, Clone)]
pub struct PackFile {
    pub name: String,
    pub filepos: u32,
    pub filelen: u32,
}

#[derive(Debug, Clone)]
enum PackSource {
    Disk(PathBuf),
    Memory(Arc<[u8]>),
}

/// A loaded .pak archive.
#[derive(Debug)]
pub struct Pack {
    pub filename: String,
    pub files: Vec<PackFile>,
    source: PackSource,
    /// lowercase filename -> index in `files`
    file_index: HashMap<String, usize>,
}

fn le_i32(b: &[u8], ofs: usize) -> i32 {
    i32::from_le_bytes([b[ofs], b[ofs + 1], b[ofs + 2], b[ofs + 3]])
}

fn decode_pack_entry(entry: &[u8]) -> PackFile {
    let name_bytes = &entry[..PACK_NAME_LEN];
    let name_end = name_bytes.iter().position(|&b| b == 0).unwrap_or(PACK_NAME_LEN);
    PackFile {
        name: String::from_utf8_lossy(&name_bytes[..name_end]).into_owned(),
        filepos: le_i32(entry, PACK_NAME_LEN) as u32,
        filelen: le_i32(entry, PACK_NAME_LEN + 4) as u32,
    }
}

impl Pack {
    fn new(filename: String, files: Vec<PackFile>, source: PackSource) -> Self {
        let file_index = files
            .iter()
            .enumerate()
            .map(|(i, pf)| (pf.name.to_lowercase(), i))
            .collect();
        Self {
            filename,
            files,
            source,
            file_index,
        }
    }

    fn read_directory<R: Read + Seek>(filename: &str, reader: &mut R) -> LoadResult<Vec<PackFile>> {
        let mut header = [0u8; DPACKHEADER_SIZE];
        reader.read_exact(&mut header)?;

        if le_i32(&header, 0) != IDPAKHEADER {
            return Err(LoadError::UnsupportedFormat {
                model: filename.to_string(),
                format: "non-PACK archive",
            });
        }

        let dirofs = le_i32(&header, 4);
        let dirlen = le_i32(&header, 8);
        if dirofs < 0 || dirlen < 0 {
            return Err(LoadError::BadFileRange {
                offset: dirofs.max(0) as usize,
                len: dirlen.max(0) as usize,
                size: 0,
            });
        }
        let numpackfiles = dirlen as usize / DPACKFILE_SIZE;
        if numpackfiles > MAX_FILES_IN_PACK {
            com_printf(&format!("{} has {} files\n", filename, numpackfiles));
        }

        reader.seek(SeekFrom::Start(dirofs as u64))?;
        let mut dir = vec![0u8; numpackfiles * DPACKFILE_SIZE];
        reader.read_exact(&mut dir)?;

        // large packs are decoded in parallel
        const PARALLEL_THRESHOLD: usize = 64;
        let files = if numpackfiles >= PARALLEL_THRESHOLD {
            dir.par_chunks(DPACKFILE_SIZE).map(decode_pack_entry).collect()
        } else {
            dir.chunks(DPACKFILE_SIZE).map(decode_pack_entry).collect()
        };
        Ok(files)
    }

    /// Opens a .pak file on disk. Only the directory is read.
    pub fn open(path: &Path) -> LoadResult<Pack> {
        let filename = path.to_string_lossy().into_owned();
        let mut f = File::open(path)?;
        let files = Self::read_directory(&filename, &mut f)?;
        com_printf(&format!("Added packfile {} ({} files)\n", filename, files.len()));
        Ok(Pack::new(filename, files, PackSource::Disk(path.to_path_buf())))
    }

    /// Wraps an in-memory pack image.
    pub fn from_bytes(filename: &str, data: Vec<u8>) -> LoadResult<Pack> {
        let data: Arc<[u8]> = data.into();
        let files = Self::read_directory(filename, &mut Cursor::new(&data[..]))?;
        Ok(Pack::new(filename.to_string(), files, PackSource::Memory(data)))
    }

    /// Case-insensitive lookup.
    #[inline]
    pub fn find_file(&self, filename: &str) -> Option<&PackFile> {
        self.file_index
            .get(&filename.to_lowercase())
            .map(|&idx| &self.files[idx])
    }

    fn read_entry(&self, pf: &PackFile) -> LoadResult<Vec<u8>> {
        let start = pf.filepos as usize;
        let len = pf.filelen as usize;
        match &self.source {
            PackSource::Memory(data) => {
                let end = start.checked_add(len).filter(|&e| e <= data.len()).ok_or(
                    LoadError::BadFileRange {
                        offset: start,
                        len,
                        size: data.len(),
                    },
                )?;
                Ok(data[start..end].to_vec())
            }
            PackSource::Disk(path) => {
                let mut f = File::open(path)?;
                f.seek(SeekFrom::Start(start as u64))?;
                let mut buf = vec![0u8; len];
                f.read_exact(&mut buf)?;
                Ok(buf)
            }
        }
    }
}

/// Builds a PACK image in memory. Used by tests and tools that synthesize
/// game data.
pub fn build_pack(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut data = vec![0u8; DPACKHEADER_SIZE];
    let mut dir = Vec::with_capacity(entries.len() * DPACKFILE_SIZE);
    for (name, contents) in entries {
        let mut raw_name = [0u8; PACK_NAME_LEN];
        let n = name.len().min(PACK_NAME_LEN - 1);
        raw_name[..n].copy_from_slice(&name.as_bytes()[..n]);
        dir.extend_from_slice(&raw_name);
        dir.extend_from_slice(&(data.len() as i32).to_le_bytes());
        dir.extend_from_slice(&(contents.len() as i32).to_le_bytes());
        data.extend_from_slice(contents);
    }
    let dirofs = data.len() as i32;
    data.extend_from_slice(&dir);
    data[0..4].copy_from_slice(&IDPAKHEADER.to_le_bytes());
    data[4..8].copy_from_slice(&dirofs.to_le_bytes());
    data[8..12].copy_from_slice(&(dir.len() as i32).to_le_bytes());
    data
}

// ============================================================
// Search paths
// ============================================================

#[derive(Debug)]
pub enum SearchPathKind {
    Directory(PathBuf),
    Pack(Pack),
}

#[derive(Debug)]
pub struct SearchPath {
    pub path_id: u32,
    pub kind: SearchPathKind,
}

/// A file pulled through the search path.
#[derive(Debug, Clone)]
pub struct LoadedFile {
    pub data: Vec<u8>,
    /// Priority of the search path it came from.
    pub path_id: u32,
}

#[derive(Debug, Default)]
pub struct FileSystem {
    /// In insertion order; searched back to front.
    pub search_paths: Vec<SearchPath>,
    /// Game directory name, used for `<gamedir>.vis`.
    pub gamedir: String,
    next_path_id: u32,
}

impl FileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&mut self) -> u32 {
        self.next_path_id += 1;
        self.next_path_id
    }

    pub fn add_directory(&mut self, dir: impl Into<PathBuf>) -> u32 {
        let path_id = self.next_id();
        self.search_paths.push(SearchPath {
            path_id,
            kind: SearchPathKind::Directory(dir.into()),
        });
        path_id
    }

    pub fn add_pack(&mut self, pack: Pack) -> u32 {
        let path_id = self.next_id();
        self.search_paths.push(SearchPath {
            path_id,
            kind: SearchPathKind::Pack(pack),
        });
        path_id
    }

    /// Adds a game directory: the directory itself, then pak0.pak, pak1.pak,
    /// ... found inside it, so the packs take priority over loose files.
    pub fn add_game_directory(&mut self, dir: &Path) {
        self.gamedir = dir
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.add_directory(dir);
        for i in 0.. {
            let pakfile = dir.join(format!("pak{}.pak", i));
            if !pakfile.is_file() {
                break;
            }
            match Pack::open(&pakfile) {
                Ok(pack) => {
                    self.add_pack(pack);
                }
                Err(e) => com_printf(&format!("{}: {}\n", pakfile.display(), e)),
            }
        }
    }

    /// Looks a file up without reading it. Returns the id of the path it
    /// would be loaded from.
    pub fn file_exists(&self, name: &str) -> Option<u32> {
        self.search_paths.iter().rev().find_map(|sp| {
            let found = match &sp.kind {
                SearchPathKind::Pack(pack) => pack.find_file(name).is_some(),
                SearchPathKind::Directory(dir) => dir.join(name).is_file(),
            };
            found.then_some(sp.path_id)
        })
    }

    pub fn load_file(&self, name: &str) -> Option<LoadedFile> {
        for sp in self.search_paths.iter().rev() {
            match &sp.kind {
                SearchPathKind::Pack(pack) => {
                    if let Some(pf) = pack.find_file(name) {
                        com_dprintf(&format!("PackFile: {} : {}\n", pack.filename, name));
                        return match pack.read_entry(pf) {
                            Ok(data) => Some(LoadedFile {
                                data,
                                path_id: sp.path_id,
                            }),
                            Err(e) => {
                                com_printf(&format!("FS_LoadFile: {}: {}\n", name, e));
                                None
                            }
                        };
                    }
                }
                SearchPathKind::Directory(dir) => {
                    let netpath = dir.join(name);
                    match fs::read(&netpath) {
                        Ok(data) => {
                            com_dprintf(&format!("FindFile: {}\n", netpath.display()));
                            return Some(LoadedFile {
                                data,
                                path_id: sp.path_id,
                            });
                        }
                        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                        Err(e) => {
                            com_printf(&format!("FS_LoadFile: {}: {}\n", netpath.display(), e));
                        }
                    }
                }
            }
        }
        com_dprintf(&format!("FindFile: can't find {}\n", name));
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_roundtrip_and_case_insensitive_lookup() {
        let image = build_pack(&[("maps/e1m1.bsp", b"abc"), ("maps/E1M1.lit", b"QLIT")]);
        let pack = Pack::from_bytes("mem.pak", image).unwrap();
        assert_eq!(pack.files.len(), 2);
        let pf = pack.find_file("MAPS/e1m1.lit").unwrap();
        assert_eq!(pack.read_entry(pf).unwrap(), b"QLIT");
    }

    #[test]
    fn test_bad_pack_magic() {
        let mut image = build_pack(&[("a", b"1")]);
        image[0] = b'X';
        assert!(Pack::from_bytes("bad.pak", image).is_err());
    }

    #[test]
    fn test_later_paths_win_and_report_their_id() {
        let mut fs = FileSystem::new();
        let low = fs.add_pack(Pack::from_bytes("a.pak", build_pack(&[("x.txt", b"low")])).unwrap());
        let high = fs.add_pack(Pack::from_bytes("b.pak", build_pack(&[("x.txt", b"high")])).unwrap());
        assert!(high > low);

        let f = fs.load_file("x.txt").unwrap();
        assert_eq!(f.data, b"high");
        assert_eq!(f.path_id, high);
        assert_eq!(fs.file_exists("x.txt"), Some(high));
        assert!(fs.load_file("missing.txt").is_none());
        assert_eq!(fs.file_exists("missing.txt"), None);
    }

    #[test]
    fn test_directory_search_path() {
        let dir = std::env::temp_dir().join(format!("q1bsp_fs_test_{}", std::process::id()));
        fs::create_dir_all(dir.join("maps")).unwrap();
        fs::write(dir.join("maps/test.ent"), b"{ }").unwrap();

        let mut fs = FileSystem::new();
        let id = fs.add_directory(&dir);
        let f = fs.load_file("maps/test.ent").unwrap();
        assert_eq!(f.data, b"{ }");
        assert_eq!(f.path_id, id);

        let _ = fs::remove_dir_all(&dir);
    }
}
