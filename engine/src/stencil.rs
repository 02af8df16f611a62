//! Direction tables for the 27-cell neighbour stencil.
//!
//! A relative cell displacement `(dx, dy, dz)` with components in
//! `{-1, 0, 1}` is indexed as `9*(dz+1) + 3*(dy+1) + (dx+1)` and folded
//! onto one of 13 canonical directions; a displacement and its negation
//! share an id. Ids 4, 10 and 12 are the z, y and x axes, ids 0, 2, 6
//! and 8 the four space diagonals.

/// Number of distinct directions after folding.
pub const NR_DIRECTIONS: usize = 13;

/// Bitmask selecting all 13 directions.
pub const ALL_DIRECTIONS: u32 = 0x1fff;

/// Folded direction id per raw displacement index.
pub const SORTLIST_ID: [u8; 27] = [
    /* ( -1 , -1 , -1 ) */ 0,
    /* (  0 , -1 , -1 ) */ 1,
    /* (  1 , -1 , -1 ) */ 2,
    /* ( -1 ,  0 , -1 ) */ 3,
    /* (  0 ,  0 , -1 ) */ 4,
    /* (  1 ,  0 , -1 ) */ 5,
    /* ( -1 ,  1 , -1 ) */ 6,
    /* (  0 ,  1 , -1 ) */ 7,
    /* (  1 ,  1 , -1 ) */ 8,
    /* ( -1 , -1 ,  0 ) */ 9,
    /* (  0 , -1 ,  0 ) */ 10,
    /* (  1 , -1 ,  0 ) */ 11,
    /* ( -1 ,  0 ,  0 ) */ 12,
    /* (  0 ,  0 ,  0 ) */ 0,
    /* (  1 ,  0 ,  0 ) */ 12,
    /* ( -1 ,  1 ,  0 ) */ 11,
    /* (  0 ,  1 ,  0 ) */ 10,
    /* (  1 ,  1 ,  0 ) */ 9,
    /* ( -1 , -1 ,  1 ) */ 8,
    /* (  0 , -1 ,  1 ) */ 7,
    /* (  1 , -1 ,  1 ) */ 6,
    /* ( -1 ,  0 ,  1 ) */ 5,
    /* (  0 ,  0 ,  1 ) */ 4,
    /* (  1 ,  0 ,  1 ) */ 3,
    /* ( -1 ,  1 ,  1 ) */ 2,
    /* (  0 ,  1 ,  1 ) */ 1,
    /* (  1 ,  1 ,  1 ) */ 0,
];

/// Raw indices whose displacement is not the canonical representative of
/// its direction; pairs with such a displacement get their cells swapped.
pub const RUNNER_FLIP: [bool; 27] = [
    true, true, true, true, true, true, true, true, true, true, true, true, true, false, false,
    false, false, false, false, false, false, false, false, false, false, false, false,
];

/// Unit projection axis per direction id, as `(x, y, z)` components.
pub const SORT_AXES: [[f32; 3]; 13] = [
    [0.577_350_3, 0.577_350_3, 0.577_350_3],
    [0.0, 0.707_106_77, 0.707_106_77],
    [-0.577_350_3, 0.577_350_3, 0.577_350_3],
    [0.707_106_77, 0.0, 0.707_106_77],
    [0.0, 0.0, 1.0],
    [-0.707_106_77, 0.0, 0.707_106_77],
    [0.577_350_3, -0.577_350_3, 0.577_350_3],
    [0.0, -0.707_106_77, 0.707_106_77],
    [-0.577_350_3, -0.577_350_3, 0.577_350_3],
    [0.707_106_77, 0.707_106_77, 0.0],
    [0.0, 1.0, 0.0],
    [-0.707_106_77, 0.707_106_77, 0.0],
    [1.0, 0.0, 0.0],
];

/// Direction id for the unordered progeny pair `(j, k)` with `j < k`.
/// Progeny are indexed by the bit pattern `4*x + 2*y + z`.
pub const PTS: [[i8; 8]; 7] = [
    [-1, 4, 10, 1, 12, 3, 9, 0],
    [-1, -1, 7, 10, 5, 12, 8, 9],
    [-1, -1, -1, 4, 11, 6, 12, 3],
    [-1, -1, -1, -1, 2, 11, 5, 12],
    [-1, -1, -1, -1, -1, 4, 10, 1],
    [-1, -1, -1, -1, -1, -1, 7, 10],
    [-1, -1, -1, -1, -1, -1, -1, 4],
];

/// One entry of a pair refinement: which progeny of the two cells touch
/// across the interface, and the direction of the resulting pair.
#[derive(Debug, Clone, Copy)]
pub struct ChildPair {
    /// Progeny index within the first cell.
    pub pi: u8,
    /// Progeny index within the second cell.
    pub pj: u8,
    /// Direction id of the resulting pair.
    pub sid: u8,
    /// Store the pair as `(cj.progeny[pj], ci.progeny[pi])` so that its
    /// displacement stays the canonical representative.
    pub flip: bool,
}

const fn cp(pi: u8, pj: u8, sid: u8) -> ChildPair {
    ChildPair { pi, pj, sid, flip: false }
}

const fn cpf(pi: u8, pj: u8, sid: u8) -> ChildPair {
    ChildPair { pi, pj, sid, flip: true }
}

const SPLITS_0: [ChildPair; 1] = [cp(7, 0, 0)];
const SPLITS_1: [ChildPair; 4] = [cp(3, 0, 1), cp(3, 4, 0), cp(7, 0, 2), cp(7, 4, 1)];
const SPLITS_2: [ChildPair; 1] = [cp(3, 4, 2)];
const SPLITS_3: [ChildPair; 4] = [cp(5, 0, 3), cp(5, 2, 0), cp(7, 0, 6), cp(7, 2, 3)];
const SPLITS_4: [ChildPair; 16] = [
    cp(1, 0, 4),
    cp(1, 2, 1),
    cp(1, 4, 3),
    cp(1, 6, 0),
    cp(3, 0, 7),
    cp(3, 2, 4),
    cp(3, 4, 6),
    cp(3, 6, 3),
    cp(5, 0, 5),
    cp(5, 2, 2),
    cp(5, 4, 4),
    cp(5, 6, 1),
    cp(7, 0, 8),
    cp(7, 2, 5),
    cp(7, 4, 7),
    cp(7, 6, 4),
];
const SPLITS_5: [ChildPair; 4] = [cp(1, 4, 5), cp(1, 6, 2), cp(3, 4, 8), cp(3, 6, 5)];
const SPLITS_6: [ChildPair; 1] = [cp(5, 2, 6)];
const SPLITS_7: [ChildPair; 4] = [cp(1, 2, 7), cp(1, 6, 6), cp(5, 2, 8), cp(5, 6, 7)];
const SPLITS_8: [ChildPair; 1] = [cp(1, 6, 8)];
const SPLITS_9: [ChildPair; 4] = [cp(6, 0, 9), cp(6, 1, 0), cpf(7, 0, 8), cp(7, 1, 9)];
const SPLITS_10: [ChildPair; 16] = [
    cp(2, 0, 10),
    cp(2, 1, 1),
    cp(2, 4, 9),
    cp(2, 5, 0),
    cpf(3, 0, 7),
    cp(3, 1, 10),
    cpf(3, 4, 8),
    cp(3, 5, 9),
    cp(6, 0, 11),
    cp(6, 1, 2),
    cp(6, 4, 10),
    cp(6, 5, 1),
    cpf(7, 0, 6),
    cp(7, 1, 11),
    cpf(7, 4, 7),
    cp(7, 5, 10),
];
const SPLITS_11: [ChildPair; 4] = [cp(2, 4, 11), cp(2, 5, 2), cpf(3, 4, 6), cp(3, 5, 11)];
const SPLITS_12: [ChildPair; 16] = [
    cp(4, 0, 12),
    cp(4, 1, 3),
    cp(4, 2, 9),
    cp(4, 3, 0),
    cpf(5, 0, 5),
    cp(5, 1, 12),
    cpf(5, 2, 8),
    cp(5, 3, 9),
    cpf(6, 0, 11),
    cp(6, 1, 6),
    cp(6, 2, 12),
    cp(6, 3, 3),
    cpf(7, 0, 2),
    cpf(7, 1, 11),
    cpf(7, 2, 5),
    cp(7, 3, 12),
];

/// Child-to-child pair enumeration per direction id: 1 pair for the space
/// diagonals, 4 for edges, 16 for the axis faces.
pub static PAIR_SPLITS: [&[ChildPair]; 13] = [
    &SPLITS_0, &SPLITS_1, &SPLITS_2, &SPLITS_3, &SPLITS_4, &SPLITS_5, &SPLITS_6, &SPLITS_7,
    &SPLITS_8, &SPLITS_9, &SPLITS_10, &SPLITS_11, &SPLITS_12,
];

/// Raw displacement index of `(dx, dy, dz)`, components in `{-1, 0, 1}`.
pub fn raw_index(dx: i32, dy: i32, dz: i32) -> usize {
    debug_assert!(dx.abs() <= 1 && dy.abs() <= 1 && dz.abs() <= 1);
    (9 * (dz + 1) + 3 * (dy + 1) + (dx + 1)) as usize
}

/// The canonical displacement of a direction id.
pub fn direction_vector(sid: u8) -> [i32; 3] {
    debug_assert!((sid as usize) < NR_DIRECTIONS);
    for raw in 14..27 {
        if SORTLIST_ID[raw] == sid {
            return [(raw % 3) as i32 - 1, ((raw / 3) % 3) as i32 - 1, (raw / 9) as i32 - 1];
        }
    }
    unreachable!("no canonical displacement for direction {}", sid)
}

/// Whether a direction is one of the four space diagonals of the stencil.
/// Diagonal pairs only touch at a point and are never turned into subs.
pub fn is_corner(sid: u8) -> bool {
    matches!(sid, 0 | 2 | 6 | 8)
}
