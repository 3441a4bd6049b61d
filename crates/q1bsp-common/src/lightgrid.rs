// lightgrid.rs — BSPX volumetric light grid (octree of sample blocks)

use crate::common::com_dprintf;
use crate::q_shared::Vec3;

pub const LGNODE_LEAF: u32 = 1 << 31;
pub const LGNODE_MISSING: u32 = 1 << 30;

const NO_STYLE: u8 = 0xff;
const SAMPLE_STYLES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridNode {
    pub mid: [i32; 3],
    pub child: [u32; 8],
}

/// Up to four (style, rgb) pairs; unused slots have style 255.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridSample {
    pub map: [(u8, [u8; 3]); SAMPLE_STYLES],
}

impl GridSample {
    const MISSING: GridSample = GridSample {
        map: [(NO_STYLE, [0xff; 3]); SAMPLE_STYLES],
    };
}

#[derive(Debug, Clone, PartialEq)]
pub struct GridLeaf {
    pub mins: [i32; 3],
    pub size: [i32; 3],
    pub samples: Vec<GridSample>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LightGrid {
    pub gridscale: Vec3,
    pub count: [u32; 3],
    pub mins: Vec3,
    pub numstyles: u8,
    pub rootnode: u32,
    pub nodes: Vec<GridNode>,
    pub leafs: Vec<GridLeaf>,
}

/// Reads past the end yield zero but still advance, so a truncated blob is
/// caught by the final length check.
struct GridReader<'a> {
    data: &'a [u8],
    ofs: usize,
}

impl<'a> GridReader<'a> {
    fn byte(&mut self) -> u8 {
        let b = self.data.get(self.ofs).copied().unwrap_or(0);
        self.ofs = self.ofs.saturating_add(1);
        b
    }

    fn int(&mut self) -> i32 {
        i32::from_le_bytes([self.byte(), self.byte(), self.byte(), self.byte()])
    }

    fn uint(&mut self) -> u32 {
        self.int() as u32
    }

    fn float(&mut self) -> f32 {
        f32::from_bits(self.uint())
    }
}

impl LightGrid {
    /// Parses a `LIGHTGRID_OCTREE` blob. Returns `None` unless the parse
    /// consumes exactly the whole lump.
    pub fn load(data: &[u8]) -> Option<LightGrid> {
        let mut r = GridReader { data, ofs: 0 };

        let step = [r.float(), r.float(), r.float()];
        let count = [r.uint(), r.uint(), r.uint()];
        let mins = [r.float(), r.float(), r.float()];
        let numstyles = r.byte();
        let rootnode = r.uint();
        let numnodes = r.uint() as usize;

        // each node is 44 bytes; don't allocate for a count the lump can't hold
        if numnodes.saturating_mul(44) > data.len() {
            com_dprintf("light grid: bad node count\n");
            return None;
        }
        let mut nodes = Vec::with_capacity(numnodes);
        for _ in 0..numnodes {
            let mid = [r.int(), r.int(), r.int()];
            let mut child = [0u32; 8];
            for c in child.iter_mut() {
                *c = r.uint();
            }
            nodes.push(GridNode { mid, child });
        }

        let numleafs = r.uint() as usize;
        if numleafs.saturating_mul(24) > data.len() {
            com_dprintf("light grid: bad leaf count\n");
            return None;
        }
        let mut leafs = Vec::with_capacity(numleafs);
        for _ in 0..numleafs {
            let lmins = [r.int(), r.int(), r.int()];
            let size = [r.int(), r.int(), r.int()];
            let total = size
                .iter()
                .try_fold(1usize, |acc, &s| acc.checked_mul(usize::try_from(s).ok()?))?;
            // at least one byte per sample
            if total > data.len() {
                return None;
            }

            let mut samples = Vec::with_capacity(total);
            for _ in 0..total {
                let s = r.byte();
                if s == NO_STYLE {
                    samples.push(GridSample::MISSING);
                    continue;
                }
                let mut samp = GridSample {
                    map: [(NO_STYLE, [0; 3]); SAMPLE_STYLES],
                };
                for k in 0..s as usize {
                    if k >= SAMPLE_STYLES {
                        r.int();
                    } else {
                        samp.map[k] = (r.byte(), [r.byte(), r.byte(), r.byte()]);
                    }
                }
                samples.push(samp);
            }
            leafs.push(GridLeaf {
                mins: lmins,
                size,
                samples,
            });
        }

        if r.ofs != data.len() {
            com_dprintf("light grid: size mismatch, ignoring\n");
            return None;
        }

        Some(LightGrid {
            gridscale: [1.0 / step[0], 1.0 / step[1], 1.0 / step[2]],
            count,
            mins,
            numstyles,
            rootnode,
            nodes,
            leafs,
        })
    }

    /// Adds one cell's light into `res`, weighted by `w`. Returns false if
    /// the cell is absent.
    fn single_value(&self, x: i32, y: i32, z: i32, w: f32, styles: &[i32], res: &mut Vec3) -> bool {
        let mut node = self.rootnode;
        while node & LGNODE_LEAF == 0 {
            if node & LGNODE_MISSING != 0 {
                return false;
            }
            let Some(n) = self.nodes.get(node as usize) else {
                return false;
            };
            let idx = ((x >= n.mid[0]) as usize) << 2 | ((y >= n.mid[1]) as usize) << 1 | (z >= n.mid[2]) as usize;
            node = n.child[idx];
        }

        let Some(leaf) = self.leafs.get((node & !LGNODE_LEAF) as usize) else {
            return false;
        };
        let (x, y, z) = (x - leaf.mins[0], y - leaf.mins[1], z - leaf.mins[2]);
        if x < 0 || y < 0 || z < 0 || x >= leaf.size[0] || y >= leaf.size[1] || z >= leaf.size[2] {
            return false;
        }
        let i = (x + leaf.size[0] * (y + leaf.size[1] * z)) as usize;
        let Some(samp) = leaf.samples.get(i) else {
            return false;
        };

        let w = w * (1.0 / 256.0);
        for &(style, rgb) in samp.map.iter() {
            if style == NO_STYLE {
                break;
            }
            let lev = styles.get(style as usize).copied().unwrap_or(0) as f32 * w;
            for c in 0..3 {
                res[c] += rgb[c] as f32 * lev;
            }
        }
        true
    }

    /// Trilinearly filtered light at `point`. Cells missing from the octree
    /// are skipped and the remaining weights renormalized.
    pub fn value(&self, point: &Vec3, styles: &[i32]) -> Vec3 {
        let mut res = [0.0f32; 3];
        let mut tile = [0i32; 3];
        let mut frac = [0.0f32; 3];
        for i in 0..3 {
            let t = (point[i] - self.mins[i]) * self.gridscale[i];
            tile[i] = t.floor() as i32;
            frac[i] = t - tile[i] as f32;
        }

        let mut s = 0.0f32;
        for i in 0..8 {
            let w = (if i & 1 != 0 { frac[0] } else { 1.0 - frac[0] })
                * (if i & 2 != 0 { frac[1] } else { 1.0 - frac[1] })
                * (if i & 4 != 0 { frac[2] } else { 1.0 - frac[2] });
            let hit = self.single_value(
                tile[0] + (i & 1 != 0) as i32,
                tile[1] + (i & 2 != 0) as i32,
                tile[2] + (i & 4 != 0) as i32,
                w,
                styles,
                &mut res,
            );
            if hit {
                s += w;
            }
        }
        if s != 0.0 {
            let inv = 1.0 / s;
            for c in res.iter_mut() {
                *c *= inv;
            }
        }
        res
    }
}

/// Serializes a grid made of a single leaf covering `size` cells at the
/// origin. Samples are `(style, rgb)` lists; `None` writes a missing cell.
#[cfg(any(test, feature = "testutil"))]
pub fn build_single_leaf_grid(step: f32, size: [i32; 3], samples: &[Option<Vec<(u8, [u8; 3])>>]) -> Vec<u8> {
    let mut out = Vec::new();
    for _ in 0..3 {
        out.extend_from_slice(&step.to_le_bytes());
    }
    for s in size {
        out.extend_from_slice(&s.to_le_bytes());
    }
    for _ in 0..3 {
        out.extend_from_slice(&0f32.to_le_bytes());
    }
    out.push(1); // numstyles
    out.extend_from_slice(&LGNODE_LEAF.to_le_bytes()); // root is leaf 0
    out.extend_from_slice(&0u32.to_le_bytes()); // numnodes
    out.extend_from_slice(&1u32.to_le_bytes()); // numleafs
    for _ in 0..3 {
        out.extend_from_slice(&0i32.to_le_bytes());
    }
    for s in size {
        out.extend_from_slice(&s.to_le_bytes());
    }
    for samp in samples {
        match samp {
            None => out.push(0xff),
            Some(list) => {
                out.push(list.len() as u8);
                for (style, rgb) in list {
                    out.push(*style);
                    out.extend_from_slice(rgb);
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn styles_normal() -> Vec<i32> {
        vec![256; 64]
    }

    #[test]
    fn test_uniform_grid_returns_sample() {
        let cells: Vec<_> = (0..8).map(|_| Some(vec![(0u8, [100u8, 50, 25])])).collect();
        let grid = LightGrid::load(&build_single_leaf_grid(32.0, [2, 2, 2], &cells)).unwrap();
        let v = grid.value(&[10.0, 10.0, 10.0], &styles_normal());
        assert!((v[0] - 100.0).abs() < 1e-3);
        assert!((v[1] - 50.0).abs() < 1e-3);
        assert!((v[2] - 25.0).abs() < 1e-3);
    }

    #[test]
    fn test_missing_cells_are_renormalized() {
        // only the x=0 column is present; x=1 cells are out of the leaf
        let cells: Vec<_> = (0..4).map(|_| Some(vec![(0u8, [80u8, 80, 80])])).collect();
        let grid = LightGrid::load(&build_single_leaf_grid(16.0, [1, 2, 2], &cells)).unwrap();
        // frac x = 0.75: only 25% of the weight lands on present cells
        let v = grid.value(&[12.0, 0.0, 0.0], &styles_normal());
        assert!((v[0] - 80.0).abs() < 1e-3);
    }

    #[test]
    fn test_style_scale_and_terminator() {
        let cells = vec![Some(vec![(0u8, [100u8, 0, 0]), (1, [0, 100, 0])])];
        let grid = LightGrid::load(&build_single_leaf_grid(8.0, [1, 1, 1], &cells)).unwrap();
        let mut styles = vec![0; 64];
        styles[0] = 512;
        styles[1] = 128;
        let v = grid.value(&[0.0, 0.0, 0.0], &styles);
        assert!((v[0] - 200.0).abs() < 1e-3);
        assert!((v[1] - 50.0).abs() < 1e-3);
    }

    #[test]
    fn test_missing_sample_and_outside_grid() {
        let cells = vec![None];
        let grid = LightGrid::load(&build_single_leaf_grid(8.0, [1, 1, 1], &cells)).unwrap();
        // a missing cell still counts as present but contributes nothing
        assert_eq!(grid.value(&[0.0, 0.0, 0.0], &styles_normal()), [0.0; 3]);
        assert_eq!(grid.value(&[-500.0, 0.0, 0.0], &styles_normal()), [0.0; 3]);
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let cells = vec![Some(vec![(0u8, [1u8, 2, 3])])];
        let mut blob = build_single_leaf_grid(8.0, [1, 1, 1], &cells);
        blob.push(0);
        assert!(LightGrid::load(&blob).is_none());
        blob.truncate(blob.len() - 3);
        assert!(LightGrid::load(&blob).is_none());
    }

    #[test]
    fn test_octree_descent() {
        // root node splitting at x=1 into two single-cell leafs
        let mut blob = Vec::new();
        for _ in 0..3 {
            blob.extend_from_slice(&1f32.to_le_bytes());
        }
        for s in [2i32, 1, 1] {
            blob.extend_from_slice(&s.to_le_bytes());
        }
        for _ in 0..3 {
            blob.extend_from_slice(&0f32.to_le_bytes());
        }
        blob.push(1);
        blob.extend_from_slice(&0u32.to_le_bytes()); // root = node 0
        blob.extend_from_slice(&1u32.to_le_bytes());
        for m in [1i32, 1 << 20, 1 << 20] {
            blob.extend_from_slice(&m.to_le_bytes());
        }
        for c in 0..8u32 {
            let leaf = if c & 4 != 0 { 1 } else { 0 };
            blob.extend_from_slice(&(LGNODE_LEAF | leaf).to_le_bytes());
        }
        blob.extend_from_slice(&2u32.to_le_bytes());
        for (x, val) in [(0i32, 10u8), (1, 20)] {
            for m in [x, 0, 0] {
                blob.extend_from_slice(&m.to_le_bytes());
            }
            for s in [1i32, 1, 1] {
                blob.extend_from_slice(&s.to_le_bytes());
            }
            blob.push(1);
            blob.extend_from_slice(&[0, val, val, val]);
        }

        let grid = LightGrid::load(&blob).unwrap();
        let styles = styles_normal();
        assert_eq!(grid.value(&[0.0, 0.0, 0.0], &styles)[0], 10.0);
        assert_eq!(grid.value(&[1.0, 0.0, 0.0], &styles)[0], 20.0);
        let mid = grid.value(&[0.5, 0.0, 0.0], &styles)[0];
        assert!((mid - 15.0).abs() < 1e-3);
    }
}
