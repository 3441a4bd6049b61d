// cmodel.rs — point/leaf queries, PVS decompression and clip hull traces

use crate::common::{com_dprintf, com_warning, WarnOnce};
use crate::model::*;
use crate::q_shared::*;

/// Keeps trace end points this far off the impact plane.
pub const DIST_EPSILON: f32 = 0.03125;

// ============================================================
// PVS
// ============================================================

/// Bytes in one PVS row for `numleafs` visible leafs.
#[inline]
pub fn vis_row_bytes(numleafs: usize) -> usize {
    (numleafs + 7) >> 3
}

/// Run-length decodes one PVS row. `None` means "no vis data" and yields a
/// fully visible row. Zero runs are clamped to the row, and a short or
/// overrunning input is reported once per model through `viswarn`.
pub fn decompress_vis(input: Option<&[u8]>, numleafs: usize, viswarn: &WarnOnce, name: &str) -> Vec<u8> {
    let row = vis_row_bytes(numleafs);
    let Some(input) = input else {
        return vec![0xff; row];
    };

    let mut out = Vec::with_capacity(row);
    let mut inp = 0;
    let mut overrun = false;
    while out.len() < row {
        let Some(&b) = input.get(inp) else {
            overrun = true;
            break;
        };
        if b != 0 {
            out.push(b);
            inp += 1;
            continue;
        }

        let Some(&count) = input.get(inp + 1) else {
            overrun = true;
            break;
        };
        inp += 2;
        let mut c = count as usize;
        if c > row - out.len() {
            c = row - out.len();
            overrun = true;
        }
        out.resize(out.len() + c, 0);
    }

    if overrun && viswarn.first() {
        com_warning(&format!("Mod_DecompressVis: output overrun on model \"{}\"\n", name));
    }
    out.resize(row, 0);
    out
}

impl BrushModel {
    /// Walks the draw tree to the leaf containing `p`. Points exactly on a
    /// plane go to the back side.
    pub fn point_in_leaf(&self, p: &Vec3) -> usize {
        let d = &self.data;
        let mut child = match usize::try_from(self.hulls[0].firstclipnode) {
            Ok(n) if n < d.nodes.len() => NodeChild::Node(n),
            _ => return 0,
        };
        loop {
            match child {
                NodeChild::Leaf(l) => return l,
                NodeChild::Node(n) => {
                    let node = &d.nodes[n];
                    let dist = d.planes[node.plane].distance(p);
                    child = if dist > 0.0 { node.children[0] } else { node.children[1] };
                }
            }
        }
    }

    /// An all-visible row sized for this model.
    pub fn novis_pvs(&self) -> Vec<u8> {
        vec![0xff; vis_row_bytes(self.numleafs)]
    }

    /// Decompressed PVS of a leaf. Leaf 0 is the shared outside leaf and
    /// sees everything.
    pub fn leaf_pvs(&self, leaf: usize) -> Vec<u8> {
        if leaf == 0 {
            return self.novis_pvs();
        }
        let d = &self.data;
        let Some(l) = d.leafs.get(leaf) else {
            return self.novis_pvs();
        };
        let compressed = l.compressed_vis.and_then(|ofs| d.visdata.get(ofs..));
        decompress_vis(compressed, self.numleafs, &d.viswarn, &d.name)
    }

    /// Union of the PVS of every non-solid leaf within `radius` of `org`.
    pub fn fat_pvs(&self, org: &Vec3, radius: f32) -> Vec<u8> {
        let mut fat = vec![0u8; vis_row_bytes(self.numleafs)];
        let root = match usize::try_from(self.hulls[0].firstclipnode) {
            Ok(n) if n < self.data.nodes.len() => NodeChild::Node(n),
            _ => return fat,
        };
        self.add_to_fat_pvs(org, radius, root, &mut fat);
        fat
    }

    fn add_to_fat_pvs(&self, org: &Vec3, radius: f32, mut child: NodeChild, fat: &mut [u8]) {
        let d = &self.data;
        loop {
            match child {
                NodeChild::Leaf(l) => {
                    if d.leafs[l].contents != Contents::Solid {
                        let pvs = self.leaf_pvs(l);
                        for (f, p) in fat.iter_mut().zip(pvs.iter()) {
                            *f |= *p;
                        }
                    }
                    return;
                }
                NodeChild::Node(n) => {
                    let node = &d.nodes[n];
                    let dist = d.planes[node.plane].distance(org);
                    if dist > radius {
                        child = node.children[0];
                    } else if dist < -radius {
                        child = node.children[1];
                    } else {
                        self.add_to_fat_pvs(org, radius, node.children[0], fat);
                        child = node.children[1];
                    }
                }
            }
        }
    }

    /// Borrowed view of one of the four clipping hulls.
    pub fn hull(&self, index: usize) -> Hull<'_> {
        let def = &self.hulls[index.min(self.hulls.len() - 1)];
        let d = &self.data;
        Hull {
            clipnodes: match def.nodes {
                HullNodes::Draw => &d.hull0,
                HullNodes::Clip => &d.clipnodes,
            },
            planes: &d.planes,
            firstclipnode: def.firstclipnode,
            lastclipnode: def.lastclipnode,
            clip_mins: def.clip_mins,
            clip_maxs: def.clip_maxs,
        }
    }

    /// Contents at a point in the model's hull 0, with currents folded into
    /// water.
    pub fn point_contents(&self, p: &Vec3) -> Contents {
        self.hull(0).point_contents(p).without_current()
    }
}

// ============================================================
// Clip hulls
// ============================================================

/// A clipping hull: a tree of clip nodes over a plane array.
#[derive(Debug, Clone, Copy)]
pub struct Hull<'a> {
    pub clipnodes: &'a [ClipNode],
    pub planes: &'a [Plane],
    /// Root node. Negative values are content codes.
    pub firstclipnode: i32,
    pub lastclipnode: i32,
    pub clip_mins: Vec3,
    pub clip_maxs: Vec3,
}

impl<'a> Hull<'a> {
    fn root(&self) -> ClipChild {
        if self.firstclipnode < 0 {
            ClipChild::Contents(Contents::from_raw(self.firstclipnode))
        } else {
            ClipChild::Node(self.firstclipnode as usize)
        }
    }

    fn node(&self, num: usize) -> Option<(&'a ClipNode, &'a Plane)> {
        if num as i64 > self.lastclipnode as i64 {
            return None;
        }
        let node = self.clipnodes.get(num)?;
        Some((node, self.planes.get(node.plane)?))
    }

    fn bad_node(num: usize) -> Contents {
        com_warning(&format!("SV_HullPointContents: bad node number {}\n", num));
        Contents::Solid
    }

    /// Contents at `p`, starting from the hull root.
    pub fn point_contents(&self, p: &Vec3) -> Contents {
        self.child_contents(self.root(), p)
    }

    /// Contents at `p` starting from an arbitrary child. Points on a plane
    /// go to the front side.
    pub fn child_contents(&self, mut child: ClipChild, p: &Vec3) -> Contents {
        loop {
            match child {
                ClipChild::Contents(c) => return c,
                ClipChild::Node(num) => {
                    let Some((node, plane)) = self.node(num) else {
                        return Self::bad_node(num);
                    };
                    child = if plane.distance(p) < 0.0 { node.children[1] } else { node.children[0] };
                }
            }
        }
    }

    /// Sweeps a point from `start` to `end` through the hull.
    pub fn trace(&self, start: &Vec3, end: &Vec3) -> Trace {
        let mut trace = Trace::begin(end);
        self.recursive_hull_check(self.root(), 0.0, 1.0, start, end, &mut trace);
        trace
    }

    /// Splits the segment at each node plane and descends the near side
    /// first. Returns false once an impact has been recorded, which stops
    /// the far side from being examined.
    pub fn recursive_hull_check(
        &self,
        child: ClipChild,
        p1f: f32,
        p2f: f32,
        p1: &Vec3,
        p2: &Vec3,
        trace: &mut Trace,
    ) -> bool {
        let num = match child {
            ClipChild::Contents(c) => {
                if c != Contents::Solid {
                    trace.allsolid = false;
                    if c == Contents::Empty {
                        trace.inopen = true;
                    } else {
                        trace.inwater = true;
                    }
                } else {
                    trace.startsolid = true;
                }
                return true;
            }
            ClipChild::Node(num) => num,
        };

        let Some((node, plane)) = self.node(num) else {
            Self::bad_node(num);
            trace.startsolid = true;
            return true;
        };

        let (t1, t2) = if plane.is_axial() {
            let axis = plane.plane_type as usize;
            (p1[axis] - plane.dist, p2[axis] - plane.dist)
        } else {
            (
                dot_product(&plane.normal, p1) - plane.dist,
                dot_product(&plane.normal, p2) - plane.dist,
            )
        };

        if t1 >= 0.0 && t2 >= 0.0 {
            return self.recursive_hull_check(node.children[0], p1f, p2f, p1, p2, trace);
        }
        if t1 < 0.0 && t2 < 0.0 {
            return self.recursive_hull_check(node.children[1], p1f, p2f, p1, p2, trace);
        }

        // crosspoint sits DIST_EPSILON on the near side
        let mut frac = if t1 < 0.0 {
            (t1 + DIST_EPSILON) / (t1 - t2)
        } else {
            (t1 - DIST_EPSILON) / (t1 - t2)
        };
        frac = frac.clamp(0.0, 1.0);

        let mut midf = p1f + (p2f - p1f) * frac;
        let mut mid = lerp(p1, p2, frac);
        let side = usize::from(t1 < 0.0);

        if !self.recursive_hull_check(node.children[side], p1f, midf, p1, &mid, trace) {
            return false;
        }

        if self.child_contents(node.children[side ^ 1], &mid) != Contents::Solid {
            return self.recursive_hull_check(node.children[side ^ 1], midf, p2f, &mid, p2, trace);
        }

        if trace.allsolid {
            return false;
        }

        // the far side is solid: this is the impact
        trace.plane = if side == 0 {
            TracePlane {
                normal: plane.normal,
                dist: plane.dist,
            }
        } else {
            TracePlane {
                normal: vector_scale(&plane.normal, -1.0),
                dist: -plane.dist,
            }
        };

        while self.point_contents(&mid) == Contents::Solid {
            frac -= 0.1;
            if frac < 0.0 {
                trace.fraction = midf;
                trace.endpos = mid;
                com_dprintf("backup past 0\n");
                return false;
            }
            midf = p1f + (p2f - p1f) * frac;
            mid = lerp(p1, p2, frac);
        }

        trace.fraction = midf;
        trace.endpos = mid;
        false
    }
}

#[inline]
fn lerp(a: &Vec3, b: &Vec3, frac: f32) -> Vec3 {
    [
        a[0] + frac * (b[0] - a[0]),
        a[1] + frac * (b[1] - a[1]),
        a[2] + frac * (b[2] - a[2]),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cvar::LoaderSettings;
    use crate::files::FileSystem;
    use crate::model_load::load_brush_model;
    use crate::testutil::BspBuilder;

    fn world() -> BrushModel {
        let bsp = BspBuilder::two_room_world().build();
        let fs = FileSystem::new();
        let env = LoadEnv::new(&fs, LoaderSettings::default());
        load_brush_model("maps/test.bsp", &bsp, 1, &env).unwrap().remove(0)
    }

    #[test]
    fn test_decompress_plain_and_runs() {
        let warn = WarnOnce::new();
        assert_eq!(decompress_vis(None, 20, &warn, "m"), vec![0xff; 3]);
        assert_eq!(decompress_vis(Some(&[0x05, 0x00, 0x02]), 20, &warn, "m"), vec![0x05, 0, 0]);
        assert_eq!(decompress_vis(Some(&[0x01, 0x02, 0x03]), 20, &warn, "m"), vec![1, 2, 3]);
        assert!(!warn.has_fired());
    }

    #[test]
    fn test_decompress_clamps_overrun() {
        let warn = WarnOnce::new();
        // run of 200 zeros into a 2-byte row
        let out = decompress_vis(Some(&[0x00, 200, 0xff, 0xff]), 16, &warn, "m");
        assert_eq!(out, vec![0, 0]);
        assert!(warn.has_fired());

        // truncated input is padded, not read past
        let warn = WarnOnce::new();
        let out = decompress_vis(Some(&[0x07]), 24, &warn, "m");
        assert_eq!(out, vec![0x07, 0, 0]);
        assert!(warn.has_fired());
    }

    #[test]
    fn test_decompress_vis_row_length_random() {
        use rand::{Rng, SeedableRng};
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);
        let warn = WarnOnce::new();
        for _ in 0..200 {
            let numleafs = rng.gen_range(1..600);
            let len = rng.gen_range(0..64);
            let data: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
            let out = decompress_vis(Some(&data), numleafs, &warn, "fuzz");
            assert_eq!(out.len(), vis_row_bytes(numleafs));
        }
    }

    #[test]
    fn test_point_in_leaf_and_pvs() {
        let w = world();
        // room A is x < 0, room B is x >= 0 (plane x = 0, front is +x)
        assert_eq!(w.point_in_leaf(&[64.0, 0.0, 0.0]), 1);
        assert_eq!(w.point_in_leaf(&[-64.0, 0.0, 0.0]), 2);
        // on the plane goes to the back
        assert_eq!(w.point_in_leaf(&[0.0, 0.0, 0.0]), 2);

        assert_eq!(w.leaf_pvs(0), vec![0xff]);
        assert_eq!(w.leaf_pvs(1).len(), 1);
        assert_eq!(w.leaf_pvs(1)[0] & 0b11, 0b11);
        assert_eq!(w.novis_pvs(), vec![0xff]);
    }

    #[test]
    fn test_fat_pvs() {
        let w = world();
        let fat = w.fat_pvs(&[2.0, 0.0, 0.0], 8.0);
        assert_eq!(fat[0] & 0b11, 0b11);
    }

    #[test]
    fn test_hull_point_contents() {
        let w = world();
        let hull = w.hull(0);
        assert_eq!(hull.point_contents(&[64.0, 0.0, 0.0]), Contents::Empty);
        assert_eq!(w.point_contents(&[-64.0, 0.0, 0.0]), Contents::Empty);
    }

    fn wall_hull_nodes() -> (Vec<ClipNode>, Vec<Plane>) {
        // solid for x >= 100
        let planes = vec![Plane::new([1.0, 0.0, 0.0], 100.0, PLANE_X)];
        let nodes = vec![ClipNode {
            plane: 0,
            children: [
                ClipChild::Contents(Contents::Solid),
                ClipChild::Contents(Contents::Empty),
            ],
        }];
        (nodes, planes)
    }

    fn hull<'a>(nodes: &'a [ClipNode], planes: &'a [Plane]) -> Hull<'a> {
        Hull {
            clipnodes: nodes,
            planes,
            firstclipnode: 0,
            lastclipnode: nodes.len() as i32 - 1,
            clip_mins: [0.0; 3],
            clip_maxs: [0.0; 3],
        }
    }

    #[test]
    fn test_trace_hits_wall() {
        let (nodes, planes) = wall_hull_nodes();
        let h = hull(&nodes, &planes);
        let tr = h.trace(&[0.0, 0.0, 0.0], &[200.0, 0.0, 0.0]);
        assert!(!tr.allsolid);
        assert!(!tr.startsolid);
        assert!(tr.fraction < 0.5 && tr.fraction > 0.49);
        assert!(tr.endpos[0] < 100.0);
        assert_eq!(tr.plane.normal, [-1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_trace_start_equals_end() {
        let (nodes, planes) = wall_hull_nodes();
        let h = hull(&nodes, &planes);
        let tr = h.trace(&[10.0, 0.0, 0.0], &[10.0, 0.0, 0.0]);
        assert_eq!(tr.fraction, 1.0);
        assert!(!tr.allsolid);
        assert!(tr.inopen);
        assert_eq!(tr.endpos, [10.0, 0.0, 0.0]);
    }

    #[test]
    fn test_trace_starts_solid() {
        let (nodes, planes) = wall_hull_nodes();
        let h = hull(&nodes, &planes);
        // solid into the open: the far side is reached, so not all solid
        let tr = h.trace(&[150.0, 0.0, 0.0], &[10.0, 0.0, 0.0]);
        assert!(tr.startsolid);
        assert!(!tr.allsolid);
        assert!(tr.inopen);

        // never leaves the wall; the hull check itself reports no impact
        let tr = h.trace(&[150.0, 0.0, 0.0], &[160.0, 0.0, 0.0]);
        assert!(tr.startsolid);
        assert!(tr.allsolid);
        assert_eq!(tr.fraction, 1.0);

        // starting in the open and ending in solid is a clean impact
        let tr = h.trace(&[10.0, 0.0, 0.0], &[150.0, 0.0, 0.0]);
        assert!(!tr.startsolid);
        assert!(!tr.allsolid);
        assert!(tr.fraction < 1.0);
    }

    #[test]
    fn test_trace_nearest_hit_wins() {
        // two walls, x >= 100 and x >= 50 on the same axis
        let planes = vec![
            Plane::new([1.0, 0.0, 0.0], 100.0, PLANE_X),
            Plane::new([1.0, 0.0, 0.0], 50.0, PLANE_X),
        ];
        let nodes = vec![
            ClipNode {
                plane: 0,
                children: [ClipChild::Contents(Contents::Solid), ClipChild::Node(1)],
            },
            ClipNode {
                plane: 1,
                children: [
                    ClipChild::Contents(Contents::Solid),
                    ClipChild::Contents(Contents::Empty),
                ],
            },
        ];
        let h = hull(&nodes, &planes);
        let tr = h.trace(&[0.0, 0.0, 0.0], &[200.0, 0.0, 0.0]);
        assert!(tr.endpos[0] < 50.0);
        assert!(tr.fraction < 0.25);
    }

    #[test]
    fn test_bad_node_is_solid() {
        let (nodes, planes) = wall_hull_nodes();
        let mut h = hull(&nodes, &planes);
        h.firstclipnode = 9;
        assert_eq!(h.point_contents(&[0.0; 3]), Contents::Solid);
    }
}
