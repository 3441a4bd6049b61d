// lightmap.rs — lightmap atlas pages, skyline allocation and dirty-rect uploads

use thiserror::Error;

use q1bsp_common::model::{LMBLOCK_HEIGHT, LMBLOCK_WIDTH};

use crate::gpu::{GpuBackend, TextureId};
use crate::settings::LightmapFormat;

pub const BLOCK_WIDTH: usize = LMBLOCK_WIDTH as usize;
pub const BLOCK_HEIGHT: usize = LMBLOCK_HEIGHT as usize;
pub const MAX_LIGHTMAP_PAGES: usize = 1 << 20;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AtlasError {
    #[error("AllocBlock: {0}x{1} block does not fit in a {BLOCK_WIDTH}x{BLOCK_HEIGHT} page")]
    BlockTooLarge(usize, usize),
    #[error("AllocBlock: full")]
    AtlasFull,
    #[error("R_TextureAnimation: broken cycle")]
    BrokenAnimationCycle,
    #[error("R_TextureAnimation: infinite cycle")]
    InfiniteAnimationCycle,
}

/// Where a surface's lightmap lives in the atlas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LightmapSlot {
    pub page: usize,
    pub s: usize,
    pub t: usize,
}

/// Union of modified texels since the last upload. An empty rect has
/// `l == BLOCK_WIDTH`, `t == BLOCK_HEIGHT` and zero size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirtyRect {
    pub l: usize,
    pub t: usize,
    pub w: usize,
    pub h: usize,
}

impl DirtyRect {
    pub const EMPTY: DirtyRect = DirtyRect {
        l: BLOCK_WIDTH,
        t: BLOCK_HEIGHT,
        w: 0,
        h: 0,
    };
    pub const FULL: DirtyRect = DirtyRect {
        l: 0,
        t: 0,
        w: BLOCK_WIDTH,
        h: BLOCK_HEIGHT,
    };

    pub fn is_empty(&self) -> bool {
        self.w == 0 || self.h == 0
    }

    /// Grows the rect to cover `smax` x `tmax` texels at `(s, t)`.
    pub fn include(&mut self, s: usize, t: usize, smax: usize, tmax: usize) {
        if t < self.t {
            if self.h != 0 {
                self.h += self.t - t;
            }
            self.t = t;
        }
        if s < self.l {
            if self.w != 0 {
                self.w += self.l - s;
            }
            self.l = s;
        }
        if t + tmax > self.t + self.h {
            self.h = t + tmax - self.t;
        }
        if s + smax > self.l + self.w {
            self.w = s + smax - self.l;
        }
    }
}

#[derive(Debug)]
pub struct LightmapPage {
    pub data: Vec<u8>,
    pub modified: bool,
    pub rect: DirtyRect,
    pub texture: Option<TextureId>,
}

impl LightmapPage {
    fn new(format: LightmapFormat) -> Self {
        Self {
            data: vec![0; BLOCK_WIDTH * BLOCK_HEIGHT * format.bytes_per_texel()],
            modified: true,
            rect: DirtyRect::FULL,
            texture: None,
        }
    }
}

/// Pages of `BLOCK_WIDTH` x `BLOCK_HEIGHT` texels. Allocation only ever
/// looks at the newest page; earlier pages are never revisited.
#[derive(Debug)]
pub struct LightmapAtlas {
    format: LightmapFormat,
    pages: Vec<LightmapPage>,
    allocated: [usize; BLOCK_WIDTH],
    last_allocated: Option<usize>,
}

impl LightmapAtlas {
    pub fn new(format: LightmapFormat) -> Self {
        Self {
            format,
            pages: Vec::new(),
            allocated: [0; BLOCK_WIDTH],
            last_allocated: None,
        }
    }

    /// Drops every page. GPU textures of the old pages are the caller's to free.
    pub fn reset(&mut self, format: LightmapFormat) {
        *self = Self::new(format);
    }

    pub fn format(&self) -> LightmapFormat {
        self.format
    }

    pub fn stride(&self) -> usize {
        BLOCK_WIDTH * self.format.bytes_per_texel()
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn pages(&self) -> &[LightmapPage] {
        &self.pages
    }

    pub fn page(&self, page: usize) -> Option<&LightmapPage> {
        self.pages.get(page)
    }

    /// Finds room for a `w` x `h` block, opening a new page when the
    /// current one has no space left.
    pub fn alloc_block(&mut self, w: usize, h: usize) -> Result<LightmapSlot, AtlasError> {
        if w > BLOCK_WIDTH || h > BLOCK_HEIGHT {
            return Err(AtlasError::BlockTooLarge(w, h));
        }

        let first = self.last_allocated.unwrap_or(0);
        for texnum in first..MAX_LIGHTMAP_PAGES {
            if Some(texnum) != self.last_allocated {
                self.last_allocated = Some(texnum);
                self.allocated = [0; BLOCK_WIDTH];
            }

            let mut best = BLOCK_HEIGHT;
            let mut x = 0;
            for i in 0..=BLOCK_WIDTH - w {
                let best2 = self.allocated[i..i + w].iter().copied().max().unwrap_or(0);
                if best2 < best {
                    best = best2;
                    x = i;
                }
            }
            if best + h > BLOCK_HEIGHT {
                continue;
            }

            self.allocated[x..x + w].fill(best + h);
            while self.pages.len() <= texnum {
                self.pages.push(LightmapPage::new(self.format));
            }
            return Ok(LightmapSlot {
                page: texnum,
                s: x,
                t: best,
            });
        }

        Err(AtlasError::AtlasFull)
    }

    /// Texels for a `smax` x `tmax` block at `slot`, starting at its first
    /// texel and running to the end of the page. Rows are `stride()` apart.
    pub fn texels_mut(&mut self, slot: LightmapSlot) -> Option<&mut [u8]> {
        let bpp = self.format.bytes_per_texel();
        let stride = self.stride();
        let page = self.pages.get_mut(slot.page)?;
        page.data.get_mut(slot.t * stride + slot.s * bpp..)
    }

    pub fn mark_dirty(&mut self, slot: LightmapSlot, smax: usize, tmax: usize) {
        if let Some(page) = self.pages.get_mut(slot.page) {
            page.modified = true;
            page.rect.include(slot.s, slot.t, smax, tmax);
        }
    }

    /// Creates textures for every page, replacing any from a previous map.
    pub fn upload_all<B: GpuBackend>(&mut self, gpu: &mut B) {
        let format = self.format;
        for (i, page) in self.pages.iter_mut().enumerate() {
            let id = gpu.create_lightmap(&page_name(i), BLOCK_WIDTH, BLOCK_HEIGHT, format, &page.data);
            page.texture = Some(id);
            page.modified = false;
            page.rect = DirtyRect::EMPTY;
        }
    }

    /// Sends the dirty rows of one page to its texture.
    pub fn upload_dirty<B: GpuBackend>(&mut self, gpu: &mut B, page: usize) {
        let stride = self.stride();
        let format = self.format;
        let Some(p) = self.pages.get_mut(page) else {
            return;
        };
        if !p.modified {
            return;
        }
        p.modified = false;
        let rect = std::mem::replace(&mut p.rect, DirtyRect::EMPTY);
        if rect.is_empty() {
            return;
        }
        match p.texture {
            Some(id) => {
                let rows = &p.data[rect.t * stride..(rect.t + rect.h) * stride];
                gpu.update_lightmap(id, rect.t, rect.h, format, rows);
            }
            None => {
                p.texture = Some(gpu.create_lightmap(&page_name(page), BLOCK_WIDTH, BLOCK_HEIGHT, format, &p.data));
            }
        }
    }

    pub fn upload_all_dirty<B: GpuBackend>(&mut self, gpu: &mut B) {
        for i in 0..self.pages.len() {
            self.upload_dirty(gpu, i);
        }
    }
}

pub fn page_name(page: usize) -> String {
    format!("lightmap{:07}", page)
}
