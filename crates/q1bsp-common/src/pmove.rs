// pmove.rs — player traces against the world and a bounded set of physics entities

use crate::cmodel::Hull;
use crate::common::com_dprintf;
use crate::model::{BrushModel, ClipChild, ClipNode};
use crate::q_shared::*;

pub const MAX_PHYSENTS: usize = 64;

/// One bit per content type, so masks can be combined.
#[inline]
pub const fn content_bit(c: Contents) -> u32 {
    1u32 << (-(c as i32)) as u32
}

pub const CONTENTBIT_EMPTY: u32 = content_bit(Contents::Empty);
pub const CONTENTBIT_SOLID: u32 = content_bit(Contents::Solid);
pub const CONTENTBIT_WATER: u32 = content_bit(Contents::Water);
pub const CONTENTBIT_SLIME: u32 = content_bit(Contents::Slime);
pub const CONTENTBIT_LAVA: u32 = content_bit(Contents::Lava);
pub const CONTENTBIT_SKY: u32 = content_bit(Contents::Sky);
pub const CONTENTBIT_CLIP: u32 = content_bit(Contents::Clip);
pub const CONTENTBITS_FLUID: u32 = CONTENTBIT_WATER | CONTENTBIT_SLIME | CONTENTBIT_LAVA;
pub const MASK_PLAYERSOLID: u32 = CONTENTBIT_SOLID | CONTENTBIT_CLIP;

// ============================================================
// Box hull
// ============================================================

/// Six axial planes and clipnodes that turn a bounding box into a tiny BSP
/// tree, so boxes go through the same sweep as brush models.
#[derive(Debug, Clone)]
pub struct BoxHull {
    planes: [Plane; 6],
    clipnodes: [ClipNode; 6],
}

impl Default for BoxHull {
    fn default() -> Self {
        Self::new()
    }
}

impl BoxHull {
    pub fn new() -> Self {
        let planes = std::array::from_fn(|i| Plane::axial(i >> 1, 0.0));
        let clipnodes = std::array::from_fn(|i| {
            let side = i & 1;
            let mut children = [ClipChild::Contents(Contents::Empty); 2];
            children[side ^ 1] = if i != 5 {
                ClipChild::Node(i + 1)
            } else {
                ClipChild::Contents(Contents::Solid)
            };
            ClipNode { plane: i, children }
        });
        Self { planes, clipnodes }
    }

    /// Sets the box and returns it as a hull.
    pub fn hull_for_box(&mut self, mins: &Vec3, maxs: &Vec3) -> Hull<'_> {
        for axis in 0..3 {
            self.planes[axis * 2].dist = maxs[axis];
            self.planes[axis * 2 + 1].dist = mins[axis];
        }
        self.hull()
    }

    pub fn hull(&self) -> Hull<'_> {
        Hull {
            clipnodes: &self.clipnodes,
            planes: &self.planes,
            firstclipnode: 0,
            lastclipnode: 5,
            clip_mins: [0.0; 3],
            clip_maxs: [0.0; 3],
        }
    }

    fn maxs(&self, axis: usize) -> f32 {
        self.planes[axis * 2].dist
    }

    fn mins(&self, axis: usize) -> f32 {
        self.planes[axis * 2 + 1].dist
    }
}

// ============================================================
// Physics entities
// ============================================================

/// A collidable object: a brush model placed in the world, or a plain box.
#[derive(Debug, Clone, Copy)]
pub struct PhysEnt<'a> {
    pub origin: Vec3,
    pub angles: Vec3,
    /// Brush geometry. `None` means the `mins`/`maxs` box is used.
    pub model: Option<&'a BrushModel>,
    pub mins: Vec3,
    pub maxs: Vec3,
    /// Caller's identifier, compared against `PlayerMove::skipent`.
    pub info: i32,
    /// Overrides the contents reported for this entity when nonzero.
    pub forcecontentsmask: u32,
}

impl<'a> PhysEnt<'a> {
    pub fn brush(model: &'a BrushModel, origin: Vec3, angles: Vec3, info: i32) -> Self {
        Self {
            origin,
            angles,
            model: Some(model),
            mins: [0.0; 3],
            maxs: [0.0; 3],
            info,
            forcecontentsmask: 0,
        }
    }

    pub fn bbox(origin: Vec3, mins: Vec3, maxs: Vec3, info: i32) -> Self {
        Self {
            origin,
            angles: [0.0; 3],
            model: None,
            mins,
            maxs,
            info,
            forcecontentsmask: 0,
        }
    }

    fn has_rotation(&self) -> bool {
        !vector_is_zero(&self.angles)
    }

    fn contains(&self, p: &Vec3, mins: &Vec3, maxs: &Vec3) -> bool {
        (0..3).all(|i| p[i] >= self.origin[i] + mins[i] && p[i] <= self.origin[i] + maxs[i])
    }
}

/// Trace state for one moving player box. Physent 0 is the world.
#[derive(Debug, Clone)]
pub struct PlayerMove<'a> {
    pub physents: Vec<PhysEnt<'a>>,
    pub player_mins: Vec3,
    pub player_maxs: Vec3,
    /// `info` of the entity to ignore, usually the player itself.
    pub skipent: Option<i32>,
    pub origin: Vec3,
    pub safeorigin: Vec3,
    pub safeorigin_known: bool,
    box_hull: BoxHull,
}

impl<'a> PlayerMove<'a> {
    pub fn new(world: Option<&'a BrushModel>) -> Self {
        let mut pm = Self {
            physents: Vec::with_capacity(MAX_PHYSENTS),
            player_mins: [-16.0, -16.0, -24.0],
            player_maxs: [16.0, 16.0, 32.0],
            skipent: None,
            origin: [0.0; 3],
            safeorigin: [0.0; 3],
            safeorigin_known: false,
            box_hull: BoxHull::new(),
        };
        if let Some(w) = world {
            pm.physents.push(PhysEnt::brush(w, [0.0; 3], [0.0; 3], 0));
        }
        pm
    }

    /// Adds a physics entity. Returns false once the list is full.
    pub fn add_physent(&mut self, pe: PhysEnt<'a>) -> bool {
        if self.physents.len() >= MAX_PHYSENTS {
            com_dprintf(&format!("PM: too many physents, dropping {}\n", pe.info));
            return false;
        }
        self.physents.push(pe);
        true
    }

    fn skipped(&self, pe: &PhysEnt) -> bool {
        self.skipent == Some(pe.info)
    }

    /// Sweeps the player box from `start` to `end` against every physent and
    /// keeps the earliest impact. A trace that starts in solid wins over a
    /// later fractional hit.
    pub fn player_trace(&mut self, start: &Vec3, end: &Vec3, solidmask: u32) -> Trace {
        let mut total = Trace {
            endpos: *end,
            ..Trace::default()
        };

        for (i, pe) in self.physents.iter().enumerate() {
            if self.skipent == Some(pe.info) {
                continue;
            }
            if pe.forcecontentsmask != 0 && pe.forcecontentsmask & solidmask == 0 {
                continue;
            }

            if pe.model.is_none() {
                let mins = vector_subtract(&pe.mins, &self.player_maxs);
                let maxs = vector_subtract(&pe.maxs, &self.player_mins);
                self.box_hull.hull_for_box(&mins, &maxs);
            }
            let Some(mut trace) = transformed_hull_check(
                pe,
                &self.box_hull,
                start,
                end,
                &self.player_mins,
                &self.player_maxs,
            ) else {
                continue;
            };

            if trace.allsolid {
                trace.startsolid = true;
            }
            if trace.fraction < total.fraction || (trace.startsolid && !total.startsolid) {
                total = trace;
                total.ent = Some(i);
            }
        }

        if total.startsolid {
            total.fraction = 0.0;
        }
        total
    }

    /// Line trace with a zero-size box.
    pub fn trace_line(&mut self, start: &Vec3, end: &Vec3) -> Trace {
        self.player_mins = [0.0; 3];
        self.player_maxs = [0.0; 3];
        self.player_trace(start, end, MASK_PLAYERSOLID)
    }

    /// False if the player box at `pos` is inside something solid. A valid
    /// position is remembered as the safe origin.
    pub fn test_player_position(&mut self, pos: &Vec3) -> bool {
        for pe in self.physents.iter() {
            if self.skipent == Some(pe.info) {
                continue;
            }
            if pe.forcecontentsmask != 0 && pe.forcecontentsmask & MASK_PLAYERSOLID == 0 {
                continue;
            }

            if pe.model.is_some() {
                let Some(trace) =
                    transformed_hull_check(pe, &self.box_hull, pos, pos, &self.player_mins, &self.player_maxs)
                else {
                    continue;
                };
                if trace.allsolid {
                    return false;
                }
            } else {
                let mins = vector_subtract(&pe.mins, &self.player_maxs);
                let maxs = vector_subtract(&pe.maxs, &self.player_mins);
                let hull = self.box_hull.hull_for_box(&mins, &maxs);
                let local = vector_subtract(pos, &pe.origin);
                if content_bit(hull.point_contents(&local)) & MASK_PLAYERSOLID != 0 {
                    return false;
                }
            }
        }

        self.safeorigin_known = true;
        self.safeorigin = self.origin;
        true
    }

    /// Content bits at a point: the world, plus any entity whose bounds
    /// contain it.
    pub fn point_contents(&self, p: &Vec3) -> u32 {
        let Some(world) = self.physents.first().and_then(|pe| pe.model) else {
            return CONTENTBIT_EMPTY;
        };
        let mut pc = content_bit(world.point_contents(p));

        for pe in self.physents.iter().skip(1) {
            if self.skipped(pe) {
                continue;
            }
            match pe.model {
                Some(model) => {
                    if pe.contains(p, &model.mins, &model.maxs) {
                        let c = transformed_model_point_contents(model, p, &pe.origin, &pe.angles);
                        if pe.forcecontentsmask != 0 {
                            if c != CONTENTBIT_EMPTY {
                                pc |= pe.forcecontentsmask;
                            }
                        } else {
                            pc |= c;
                        }
                    }
                }
                None => {
                    if pe.forcecontentsmask != 0 && pe.contains(p, &pe.mins, &pe.maxs) {
                        pc |= pe.forcecontentsmask;
                    }
                }
            }
        }
        pc
    }
}

fn transformed_model_point_contents(model: &BrushModel, p: &Vec3, origin: &Vec3, angles: &Vec3) -> u32 {
    let mut local = vector_subtract(p, origin);
    if !vector_is_zero(angles) {
        local = rotate_into_frame(&local, angles);
    }
    content_bit(model.hull(0).point_contents(&local))
}

/// Sweeps the player box through one physent. Returns `None` when the
/// sweep's bounds never touch the entity, so no trace was done. Box
/// physents use `box_hull`, which the caller has already sized.
fn transformed_hull_check(
    pe: &PhysEnt,
    box_hull: &BoxHull,
    start: &Vec3,
    end: &Vec3,
    player_mins: &Vec3,
    player_maxs: &Vec3,
) -> Option<Trace> {
    let start_l = vector_subtract(start, &pe.origin);
    let end_l = vector_subtract(end, &pe.origin);

    let mut trace = match pe.model {
        Some(model) => {
            let hull = model.hull(if player_maxs[0] - player_mins[0] < 3.0 { 0 } else { 1 });
            if pe.has_rotation() {
                let start_t = rotate_into_frame(&start_l, &pe.angles);
                let end_t = rotate_into_frame(&end_l, &pe.angles);
                let mut trace = hull.trace(&start_t, &end_t);
                trace.plane.normal = rotate_out_of_frame(&trace.plane.normal, &pe.angles);
                trace.endpos = rotate_out_of_frame(&trace.endpos, &pe.angles);
                trace
            } else {
                for i in 0..3 {
                    if start_l[i] + player_mins[i] > model.maxs[i] && end_l[i] + player_mins[i] > model.maxs[i] {
                        return None;
                    }
                    if start_l[i] + player_maxs[i] < model.mins[i] && end_l[i] + player_maxs[i] < model.mins[i] {
                        return None;
                    }
                }
                hull.trace(&start_l, &end_l)
            }
        }
        None => {
            for i in 0..3 {
                if start_l[i] + player_mins[i] > box_hull.maxs(i) && end_l[i] + player_mins[i] > box_hull.maxs(i) {
                    return None;
                }
                if start_l[i] + player_maxs[i] < box_hull.mins(i) && end_l[i] + player_maxs[i] < box_hull.mins(i) {
                    return None;
                }
            }
            box_hull.hull().trace(&start_l, &end_l)
        }
    };

    trace.endpos = vector_add(&trace.endpos, &pe.origin);
    Some(trace)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cvar::LoaderSettings;
    use crate::files::FileSystem;
    use crate::model::LoadEnv;
    use crate::model_load::load_brush_model;
    use crate::testutil::BspBuilder;

    const SMALL: Vec3 = [-8.0, -8.0, -8.0];
    const SMALL_MAX: Vec3 = [8.0, 8.0, 8.0];

    fn point_mover<'a>() -> PlayerMove<'a> {
        let mut pm = PlayerMove::new(None);
        pm.player_mins = [0.0; 3];
        pm.player_maxs = [0.0; 3];
        pm
    }

    #[test]
    fn test_content_bits() {
        assert_eq!(CONTENTBIT_EMPTY, 2);
        assert_eq!(CONTENTBIT_SOLID, 4);
        assert_eq!(CONTENTBITS_FLUID & CONTENTBIT_SOLID, 0);
    }

    #[test]
    fn test_box_hull_contents() {
        let mut bh = BoxHull::new();
        let hull = bh.hull_for_box(&SMALL, &SMALL_MAX);
        assert_eq!(hull.point_contents(&[0.0, 0.0, 0.0]), Contents::Solid);
        assert_eq!(hull.point_contents(&[7.0, -7.0, 7.0]), Contents::Solid);
        assert_eq!(hull.point_contents(&[9.0, 0.0, 0.0]), Contents::Empty);
        assert_eq!(hull.point_contents(&[0.0, 0.0, -9.0]), Contents::Empty);
    }

    #[test]
    fn test_trace_hits_box() {
        let mut pm = point_mover();
        pm.add_physent(PhysEnt::bbox([100.0, 0.0, 0.0], SMALL, SMALL_MAX, 1));
        let tr = pm.player_trace(&[0.0; 3], &[200.0, 0.0, 0.0], MASK_PLAYERSOLID);
        assert_eq!(tr.ent, Some(0));
        assert!(tr.fraction > 0.45 && tr.fraction < 0.47, "{}", tr.fraction);
        assert!(tr.endpos[0] < 92.0);
        assert_eq!(tr.plane.normal[0], -1.0);
    }

    #[test]
    fn test_earliest_impact_wins() {
        let mut pm = point_mover();
        pm.add_physent(PhysEnt::bbox([100.0, 0.0, 0.0], SMALL, SMALL_MAX, 1));
        pm.add_physent(PhysEnt::bbox([50.0, 0.0, 0.0], SMALL, SMALL_MAX, 2));
        let tr = pm.player_trace(&[0.0; 3], &[200.0, 0.0, 0.0], MASK_PLAYERSOLID);
        assert_eq!(tr.ent, Some(1));
        assert!(tr.endpos[0] < 42.0);
    }

    #[test]
    fn test_startsolid_takes_priority() {
        let mut pm = point_mover();
        pm.add_physent(PhysEnt::bbox([100.0, 0.0, 0.0], SMALL, SMALL_MAX, 1));
        pm.add_physent(PhysEnt::bbox([0.0, 0.0, 0.0], SMALL, SMALL_MAX, 2));
        let tr = pm.player_trace(&[0.0; 3], &[200.0, 0.0, 0.0], MASK_PLAYERSOLID);
        assert_eq!(tr.ent, Some(1));
        assert!(tr.startsolid);
        assert_eq!(tr.fraction, 0.0);
    }

    #[test]
    fn test_start_inside_box_makes_no_progress() {
        let mut pm = point_mover();
        pm.add_physent(PhysEnt::bbox([100.0, 0.0, 0.0], SMALL, SMALL_MAX, 1));

        // entirely inside
        let tr = pm.player_trace(&[100.0, 0.0, 0.0], &[104.0, 0.0, 0.0], MASK_PLAYERSOLID);
        assert!(tr.startsolid);
        assert_eq!(tr.fraction, 0.0);
        assert_eq!(tr.ent, Some(0));

        // leaving the box still counts as stuck
        let tr = pm.player_trace(&[100.0, 0.0, 0.0], &[200.0, 0.0, 0.0], MASK_PLAYERSOLID);
        assert!(tr.startsolid);
        assert_eq!(tr.fraction, 0.0);
    }

    #[test]
    fn test_skipent_and_mask() {
        let mut pm = point_mover();
        pm.add_physent(PhysEnt::bbox([100.0, 0.0, 0.0], SMALL, SMALL_MAX, 7));
        pm.skipent = Some(7);
        let tr = pm.player_trace(&[0.0; 3], &[200.0, 0.0, 0.0], MASK_PLAYERSOLID);
        assert_eq!(tr.fraction, 1.0);
        assert_eq!(tr.ent, None);
        assert_eq!(tr.endpos, [200.0, 0.0, 0.0]);

        pm.skipent = None;
        pm.physents[0].forcecontentsmask = CONTENTBIT_WATER;
        let tr = pm.player_trace(&[0.0; 3], &[200.0, 0.0, 0.0], MASK_PLAYERSOLID);
        assert_eq!(tr.fraction, 1.0);
    }

    #[test]
    fn test_box_outside_sweep_is_skipped() {
        let mut pm = point_mover();
        pm.add_physent(PhysEnt::bbox([100.0, 500.0, 0.0], SMALL, SMALL_MAX, 1));
        let tr = pm.player_trace(&[0.0; 3], &[200.0, 0.0, 0.0], MASK_PLAYERSOLID);
        assert_eq!(tr.fraction, 1.0);
    }

    #[test]
    fn test_player_position() {
        let mut pm = PlayerMove::new(None);
        pm.add_physent(PhysEnt::bbox([0.0; 3], SMALL, SMALL_MAX, 1));
        assert!(!pm.test_player_position(&[0.0, 0.0, 0.0]));
        // player box is 16 wide, so 20 units away still overlaps
        assert!(!pm.test_player_position(&[20.0, 0.0, 0.0]));
        assert!(!pm.safeorigin_known);

        pm.origin = [64.0, 0.0, 0.0];
        assert!(pm.test_player_position(&[64.0, 0.0, 0.0]));
        assert!(pm.safeorigin_known);
        assert_eq!(pm.safeorigin, [64.0, 0.0, 0.0]);
    }

    #[test]
    fn test_physent_limit() {
        let mut pm = point_mover();
        for i in 0..MAX_PHYSENTS {
            assert!(pm.add_physent(PhysEnt::bbox([0.0; 3], SMALL, SMALL_MAX, i as i32)));
        }
        assert!(!pm.add_physent(PhysEnt::bbox([0.0; 3], SMALL, SMALL_MAX, 99)));
        assert_eq!(pm.physents.len(), MAX_PHYSENTS);
    }

    #[test]
    fn test_world_contents_and_forced_mask() {
        let bsp = BspBuilder::two_room_world().build();
        let fs = FileSystem::new();
        let env = LoadEnv::new(&fs, LoaderSettings::default());
        let world = load_brush_model("maps/test.bsp", &bsp, 1, &env).unwrap().remove(0);

        let mut pm = PlayerMove::new(Some(&world));
        assert_eq!(pm.point_contents(&[64.0, 0.0, 0.0]), CONTENTBIT_EMPTY);

        let mut pool = PhysEnt::bbox([64.0, 0.0, 0.0], SMALL, SMALL_MAX, 3);
        pool.forcecontentsmask = CONTENTBIT_WATER;
        pm.add_physent(pool);
        assert_eq!(pm.point_contents(&[64.0, 0.0, 0.0]), CONTENTBIT_EMPTY | CONTENTBIT_WATER);
        assert_eq!(pm.point_contents(&[-64.0, 0.0, 0.0]), CONTENTBIT_EMPTY);

        assert_eq!(PlayerMove::new(None).point_contents(&[0.0; 3]), CONTENTBIT_EMPTY);
    }

    #[test]
    fn test_rotated_brush_open_trace() {
        let bsp = BspBuilder::two_room_world().build();
        let fs = FileSystem::new();
        let env = LoadEnv::new(&fs, LoaderSettings::default());
        let world = load_brush_model("maps/test.bsp", &bsp, 1, &env).unwrap().remove(0);

        let mut pm = PlayerMove::new(None);
        pm.add_physent(PhysEnt::brush(&world, [10.0, 0.0, 0.0], [0.0, 90.0, 0.0], 1));
        let tr = pm.player_trace(&[0.0; 3], &[32.0, 16.0, 0.0], MASK_PLAYERSOLID);
        assert_eq!(tr.fraction, 1.0);
        assert!((tr.endpos[0] - 32.0).abs() < 1e-3);
        assert!((tr.endpos[1] - 16.0).abs() < 1e-3);
    }
}
