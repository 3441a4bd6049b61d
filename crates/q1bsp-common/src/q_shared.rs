// q_shared.rs — foundational types and math shared by the loader, collision and renderer

// ============================================================
// Basic types
// ============================================================

pub type Vec3 = [f32; 3];

pub const PITCH: usize = 0;
pub const YAW: usize = 1;
pub const ROLL: usize = 2;

// ============================================================
// Plane
// ============================================================

pub const PLANE_X: u8 = 0;
pub const PLANE_Y: u8 = 1;
pub const PLANE_Z: u8 = 2;
pub const PLANE_ANYX: u8 = 3;
pub const PLANE_ANYY: u8 = 4;
pub const PLANE_ANYZ: u8 = 5;

/// In-memory plane with the axial type and sign bits precomputed for fast
/// half-space tests.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Plane {
    pub normal: Vec3,
    pub dist: f32,
    pub plane_type: u8,
    pub signbits: u8,
}

impl Default for Plane {
    fn default() -> Self {
        Self {
            normal: [0.0; 3],
            dist: 0.0,
            plane_type: PLANE_ANYZ,
            signbits: 0,
        }
    }
}

impl Plane {
    pub fn new(normal: Vec3, dist: f32, plane_type: u8) -> Self {
        Self {
            normal,
            dist,
            plane_type,
            signbits: signbits_for_plane(&normal),
        }
    }

    /// Axis-aligned plane `coordinate[axis] == dist` facing the positive axis.
    pub fn axial(axis: usize, dist: f32) -> Self {
        let mut normal = [0.0; 3];
        normal[axis] = 1.0;
        Self::new(normal, dist, axis as u8)
    }

    #[inline]
    pub fn is_axial(&self) -> bool {
        self.plane_type < 3
    }

    /// Signed distance `dot(point, normal) - dist`, using the axial shortcut
    /// when possible.
    #[inline]
    pub fn distance(&self, point: &Vec3) -> f32 {
        if self.is_axial() {
            point[self.plane_type as usize] - self.dist
        } else {
            dot_product(point, &self.normal) - self.dist
        }
    }
}

pub fn signbits_for_plane(normal: &Vec3) -> u8 {
    let mut bits = 0;
    for (j, n) in normal.iter().enumerate() {
        if *n < 0.0 {
            bits |= 1 << j;
        }
    }
    bits
}

// ============================================================
// Contents
// ============================================================

/// Leaf / hull content classification. The discriminants match the values
/// stored on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Contents {
    Empty = -1,
    Solid = -2,
    Water = -3,
    Slime = -4,
    Lava = -5,
    Sky = -6,
    Origin = -7,
    Clip = -8,
    Current0 = -9,
    Current90 = -10,
    Current180 = -11,
    Current270 = -12,
    CurrentUp = -13,
    CurrentDown = -14,
}

impl Contents {
    /// Decode an on-disk content value. Anything outside the known range is
    /// treated as solid.
    pub fn from_raw(value: i32) -> Contents {
        match value {
            -1 => Contents::Empty,
            -2 => Contents::Solid,
            -3 => Contents::Water,
            -4 => Contents::Slime,
            -5 => Contents::Lava,
            -6 => Contents::Sky,
            -7 => Contents::Origin,
            -8 => Contents::Clip,
            -9 => Contents::Current0,
            -10 => Contents::Current90,
            -11 => Contents::Current180,
            -12 => Contents::Current270,
            -13 => Contents::CurrentUp,
            -14 => Contents::CurrentDown,
            _ => Contents::Solid,
        }
    }

    #[inline]
    pub fn raw(self) -> i32 {
        self as i32
    }

    /// Water, slime or lava (the leaf types that get special vis handling).
    pub fn is_liquid(self) -> bool {
        matches!(self, Contents::Water | Contents::Slime | Contents::Lava)
    }

    /// Water currents collapse to plain water for movement queries.
    pub fn without_current(self) -> Contents {
        match self {
            Contents::Current0
            | Contents::Current90
            | Contents::Current180
            | Contents::Current270
            | Contents::CurrentUp
            | Contents::CurrentDown => Contents::Water,
            other => other,
        }
    }
}

// ============================================================
// Trace
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TracePlane {
    pub normal: Vec3,
    pub dist: f32,
}

/// Result of a hull sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct Trace {
    /// The whole sweep was inside solid.
    pub allsolid: bool,
    /// The sweep started inside solid.
    pub startsolid: bool,
    pub inopen: bool,
    pub inwater: bool,
    /// 1.0 means nothing was hit.
    pub fraction: f32,
    pub endpos: Vec3,
    pub plane: TracePlane,
    /// Index of the physics entity that was hit, if any.
    pub ent: Option<usize>,
}

impl Default for Trace {
    fn default() -> Self {
        Self {
            allsolid: false,
            startsolid: false,
            inopen: false,
            inwater: false,
            fraction: 1.0,
            endpos: [0.0; 3],
            plane: TracePlane::default(),
            ent: None,
        }
    }
}

impl Trace {
    /// Initial state for a sweep: everything is assumed solid until an open
    /// leaf is reached.
    pub fn begin(end: &Vec3) -> Self {
        Self {
            allsolid: true,
            endpos: *end,
            ..Self::default()
        }
    }
}

// ============================================================
// MATHLIB — Vector operations
// ============================================================

#[inline]
pub fn dot_product(a: &Vec3, b: &Vec3) -> f32 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

/// Dot product evaluated in double precision, for lightmap projections that
/// must match the light compiler's rounding.
#[inline]
pub fn dot_product_f64(a: &Vec3, b: &[f32]) -> f64 {
    a[0] as f64 * b[0] as f64 + a[1] as f64 * b[1] as f64 + a[2] as f64 * b[2] as f64
}

#[inline]
pub fn vector_subtract(a: &Vec3, b: &Vec3) -> Vec3 {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

#[inline]
pub fn vector_add(a: &Vec3, b: &Vec3) -> Vec3 {
    [a[0] + b[0], a[1] + b[1], a[2] + b[2]]
}

/// veca + scale * vecb
#[inline]
pub fn vector_ma(veca: &Vec3, scale: f32, vecb: &Vec3) -> Vec3 {
    [
        veca[0] + scale * vecb[0],
        veca[1] + scale * vecb[1],
        veca[2] + scale * vecb[2],
    ]
}

#[inline]
pub fn vector_scale(v: &Vec3, scale: f32) -> Vec3 {
    [v[0] * scale, v[1] * scale, v[2] * scale]
}

pub fn vector_length(v: &Vec3) -> f32 {
    (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt()
}

pub fn vector_compare(v1: &Vec3, v2: &Vec3) -> bool {
    v1[0] == v2[0] && v1[1] == v2[1] && v1[2] == v2[2]
}

#[inline]
pub fn vector_is_zero(v: &Vec3) -> bool {
    v[0] == 0.0 && v[1] == 0.0 && v[2] == 0.0
}

pub fn add_point_to_bounds(v: &Vec3, mins: &mut Vec3, maxs: &mut Vec3) {
    for i in 0..3 {
        if v[i] < mins[i] {
            mins[i] = v[i];
        }
        if v[i] > maxs[i] {
            maxs[i] = v[i];
        }
    }
}

/// Radius of the sphere around the origin enclosing the box.
pub fn radius_from_bounds(mins: &Vec3, maxs: &Vec3) -> f32 {
    let mut corner = [0.0f32; 3];
    for i in 0..3 {
        corner[i] = mins[i].abs().max(maxs[i].abs());
    }
    vector_length(&corner)
}

// ============================================================
// Angle functions
// ============================================================

pub fn angle_vectors(
    angles: &Vec3,
    forward: Option<&mut Vec3>,
    right: Option<&mut Vec3>,
    up: Option<&mut Vec3>,
) {
    let angle_yaw = angles[YAW].to_radians();
    let sy = angle_yaw.sin();
    let cy = angle_yaw.cos();

    let angle_pitch = angles[PITCH].to_radians();
    let sp = angle_pitch.sin();
    let cp = angle_pitch.cos();

    let angle_roll = angles[ROLL].to_radians();
    let sr = angle_roll.sin();
    let cr = angle_roll.cos();

    if let Some(fwd) = forward {
        fwd[0] = cp * cy;
        fwd[1] = cp * sy;
        fwd[2] = -sp;
    }
    if let Some(r) = right {
        r[0] = -sr * sp * cy + -cr * -sy;
        r[1] = -sr * sp * sy + -cr * cy;
        r[2] = -sr * cp;
    }
    if let Some(u) = up {
        u[0] = cr * sp * cy + -sr * -sy;
        u[1] = cr * sp * sy + -sr * cy;
        u[2] = cr * cp;
    }
}

/// Convenience version of angle_vectors that returns a tuple (forward, right, up).
pub fn angle_vectors_tuple(angles: &Vec3) -> (Vec3, Vec3, Vec3) {
    let mut forward = [0.0f32; 3];
    let mut right = [0.0f32; 3];
    let mut up = [0.0f32; 3];
    angle_vectors(angles, Some(&mut forward), Some(&mut right), Some(&mut up));
    (forward, right, up)
}

/// Express a world-space offset in the local frame described by `angles`
/// (forward, left, up).
pub fn rotate_into_frame(v: &Vec3, angles: &Vec3) -> Vec3 {
    let (forward, right, up) = angle_vectors_tuple(angles);
    [
        dot_product(v, &forward),
        -dot_product(v, &right),
        dot_product(v, &up),
    ]
}

/// Inverse of [`rotate_into_frame`].
pub fn rotate_out_of_frame(v: &Vec3, angles: &Vec3) -> Vec3 {
    let (forward, right, up) = angle_vectors_tuple(angles);
    [
        v[0] * forward[0] - v[1] * right[0] + v[2] * up[0],
        v[0] * forward[1] - v[1] * right[1] + v[2] * up[1],
        v[0] * forward[2] - v[1] * right[2] + v[2] * up[2],
    ]
}

/// Returns 1 (front), 2 (back), or 3 (crossing) for a box vs. plane test.
pub fn box_on_plane_side(emins: &Vec3, emaxs: &Vec3, p: &Plane) -> i32 {
    // fast axial cases
    if p.is_axial() {
        let t = p.plane_type as usize;
        if p.dist <= emins[t] {
            return 1;
        }
        if p.dist >= emaxs[t] {
            return 2;
        }
        return 3;
    }

    // general case: pick the near and far corners from the sign bits
    let mut near = [0.0f32; 3];
    let mut far = [0.0f32; 3];
    for i in 0..3 {
        if p.signbits & (1 << i) != 0 {
            far[i] = emins[i];
            near[i] = emaxs[i];
        } else {
            far[i] = emaxs[i];
            near[i] = emins[i];
        }
    }
    let dist1 = dot_product(&p.normal, &far);
    let dist2 = dot_product(&p.normal, &near);

    let mut sides = 0;
    if dist1 >= p.dist {
        sides = 1;
    }
    if dist2 < p.dist {
        sides |= 2;
    }
    sides
}

// ============================================================
// Path / string utilities
// ============================================================

/// Return the filename portion after the last '/'.
pub fn com_skip_path(pathname: &str) -> &str {
    match pathname.rfind('/') {
        Some(pos) => &pathname[pos + 1..],
        None => pathname,
    }
}

/// Strip file extension (everything from the last '.' after the last '/').
pub fn com_strip_extension(input: &str) -> String {
    let slash = input.rfind('/').map(|p| p + 1).unwrap_or(0);
    match input[slash..].rfind('.') {
        Some(pos) => input[..slash + pos].to_string(),
        None => input.to_string(),
    }
}

/// Return file extension without the dot.
pub fn com_file_extension(input: &str) -> &str {
    let base = com_skip_path(input);
    match base.rfind('.') {
        Some(pos) => &base[pos + 1..],
        None => "",
    }
}

/// Filename without directory or extension ("maps/e1m1.bsp" -> "e1m1").
pub fn com_file_base(input: &str) -> String {
    com_strip_extension(com_skip_path(input))
}

// ============================================================
// Token parser (COM_Parse equivalent)
// ============================================================

pub const MAX_TOKEN_CHARS: usize = 1024;

/// Parse one whitespace-delimited token from `data`, handling // comments,
/// "quoted strings" and the single-character tokens `{ } ( ) ' :`.
/// Returns `None` at end of data.
pub fn com_parse(data: &str) -> Option<(String, &str)> {
    let bytes = data.as_bytes();
    let mut pos = 0;

    // skip whitespace and comments
    loop {
        while pos < bytes.len() && bytes[pos] <= b' ' {
            pos += 1;
        }
        if pos >= bytes.len() {
            return None;
        }
        if bytes[pos] == b'/' && bytes.get(pos + 1) == Some(&b'/') {
            while pos < bytes.len() && bytes[pos] != b'\n' {
                pos += 1;
            }
            continue;
        }
        break;
    }

    let mut token = String::new();

    // handle quoted strings
    if bytes[pos] == b'"' {
        pos += 1;
        while pos < bytes.len() && bytes[pos] != b'"' {
            if token.len() < MAX_TOKEN_CHARS {
                token.push(bytes[pos] as char);
            }
            pos += 1;
        }
        if pos < bytes.len() {
            pos += 1; // skip closing quote
        }
        return Some((token, &data[pos..]));
    }

    // single character tokens
    if matches!(bytes[pos], b'{' | b'}' | b'(' | b')' | b'\'' | b':') {
        token.push(bytes[pos] as char);
        return Some((token, &data[pos + 1..]));
    }

    // parse regular word
    while pos < bytes.len() && bytes[pos] > b' ' {
        if matches!(bytes[pos], b'{' | b'}' | b'(' | b')' | b'\'' | b':') {
            break;
        }
        if token.len() < MAX_TOKEN_CHARS {
            token.push(bytes[pos] as char);
        }
        pos += 1;
    }
    Some((token, &data[pos..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plane_distance_axial_and_general() {
        let p = Plane::axial(2, 64.0);
        assert_eq!(p.distance(&[10.0, 20.0, 100.0]), 36.0);

        let n = [0.6, 0.8, 0.0];
        let q = Plane::new(n, 10.0, PLANE_ANYX);
        assert!((q.distance(&[10.0, 10.0, 0.0]) - 4.0).abs() < 1e-5);
        assert_eq!(q.signbits, 0);

        let r = Plane::new([-1.0, 0.0, 0.0], 0.0, PLANE_ANYX);
        assert_eq!(r.signbits, 1);
    }

    #[test]
    fn test_contents_round_trip_and_unknown() {
        for raw in -14..=-1 {
            assert_eq!(Contents::from_raw(raw).raw(), raw);
        }
        assert_eq!(Contents::from_raw(-99), Contents::Solid);
        assert_eq!(Contents::Current90.without_current(), Contents::Water);
        assert!(Contents::Lava.is_liquid());
        assert!(!Contents::Sky.is_liquid());
    }

    #[test]
    fn test_box_on_plane_side() {
        let p = Plane::axial(0, 0.0);
        assert_eq!(box_on_plane_side(&[1.0, 0.0, 0.0], &[2.0, 1.0, 1.0], &p), 1);
        assert_eq!(box_on_plane_side(&[-2.0, 0.0, 0.0], &[-1.0, 1.0, 1.0], &p), 2);
        assert_eq!(box_on_plane_side(&[-1.0, 0.0, 0.0], &[1.0, 1.0, 1.0], &p), 3);

        let d = Plane::new([0.70710677, 0.70710677, 0.0], 0.0, PLANE_ANYX);
        assert_eq!(box_on_plane_side(&[1.0, 1.0, 0.0], &[2.0, 2.0, 1.0], &d), 1);
        assert_eq!(box_on_plane_side(&[-1.0, -1.0, 0.0], &[1.0, 1.0, 1.0], &d), 3);
    }

    #[test]
    fn test_rotation_round_trip() {
        let angles = [10.0, 45.0, 0.0];
        let v = [3.0, -7.0, 2.0];
        let local = rotate_into_frame(&v, &angles);
        let back = rotate_out_of_frame(&local, &angles);
        for i in 0..3 {
            assert!((back[i] - v[i]).abs() < 1e-4, "axis {} mismatch", i);
        }
    }

    #[test]
    fn test_path_helpers() {
        assert_eq!(com_skip_path("maps/e1m1.bsp"), "e1m1.bsp");
        assert_eq!(com_strip_extension("maps/e1m1.bsp"), "maps/e1m1");
        assert_eq!(com_strip_extension("id1.dir/e1m1"), "id1.dir/e1m1");
        assert_eq!(com_file_extension("maps/e1m1.bsp"), "bsp");
        assert_eq!(com_file_base("maps/e1m1.bsp"), "e1m1");
    }

    #[test]
    fn test_com_parse_tokens() {
        let data = "{ \"classname\" \"worldspawn\" // comment\n \"_lightmap_scale\" 8 }";
        let mut rest = data;
        let mut tokens = Vec::new();
        while let Some((tok, r)) = com_parse(rest) {
            tokens.push(tok);
            rest = r;
        }
        assert_eq!(
            tokens,
            vec!["{", "classname", "worldspawn", "_lightmap_scale", "8", "}"]
        );
    }

    #[test]
    fn test_radius_from_bounds() {
        let r = radius_from_bounds(&[-3.0, -1.0, 0.0], &[1.0, 4.0, 0.0]);
        assert!((r - 5.0).abs() < 1e-6);
    }
}
