//! The space: particle arrays, the cell tree, and its rebuild.

use crate::datastr::cell::{Cell, CellId};
use crate::datastr::task::TaskArena;
use crate::report::benchmark::measure;
use crate::stencil;
use crate::util::in_range_option::InRangeOption;
use std::sync::Mutex;

mod maketasks;
pub mod parallel_sort;

/// A fluid sample. Fields beyond position, smoothing length and the time
/// step hint are physics payload the core never reads.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Part {
    pub x: [f64; 3],
    /// Smoothing length, the kernel cut-off radius.
    pub h: f32,
    /// Proposed time step.
    pub dt: f32,
    pub rho: f32,
    pub a: [f32; 3],
}

/// Condensed mirror of a particle, packed for the neighbour sweeps.
/// After a rebuild `cparts[i]` mirrors `parts[i]`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CPart {
    pub x: [f64; 3],
    pub h: f32,
    pub dt: f32,
}

/// Tunables of the cell tree and task generator.
#[derive(Debug, Clone, Copy)]
pub struct SpaceParams {
    /// Minimum particle count before a cell is considered for splitting.
    pub split_size: usize,
    /// Fraction of particles that must fit below half the cell side.
    pub split_ratio: f64,
    /// Cell size below which self and pair tasks become recursive subs.
    pub sub_size: usize,
    /// Safety margin on the top-level cell size relative to `h_max`.
    pub stretch: f64,
    /// Batch size for cell arena growth.
    pub cell_alloc_chunk: usize,
}

impl Default for SpaceParams {
    fn default() -> Self {
        SpaceParams {
            split_size: 400,
            split_ratio: 0.5,
            sub_size: 5000,
            stretch: 1.1,
            cell_alloc_chunk: 1000,
        }
    }
}

/// The root container: domain, particles, cell arena and task arena.
pub struct Space {
    pub dim: [f64; 3],
    pub periodic: bool,
    /// Top-level grid dimensions.
    pub cdim: [usize; 3],
    /// Top-level cell side lengths.
    pub h: [f64; 3],
    pub h_min: f32,
    pub h_max: f32,
    /// Deepest cell level reached by the last rebuild.
    pub maxdepth: u8,
    pub params: SpaceParams,
    pub parts: Vec<Part>,
    pub cparts: Vec<CPart>,
    /// Cell arena; ids index into it and stay valid until the next regrid.
    pub cells: Vec<Cell>,
    /// Free-list of recycled cells, guarded by the space mutex.
    free_cells: Mutex<Vec<CellId>>,
    /// Ids of the top-level grid cells, x-major.
    pub grid: Vec<CellId>,
    pub tasks: TaskArena,
}

impl Space {
    /// Set up a space over the given domain. `h_max` seeds the grid sizing
    /// until the first rebuild derives it from the particles themselves.
    pub fn new(dim: [f64; 3], parts: Vec<Part>, periodic: bool, h_max: f32, params: SpaceParams) -> Space {
        for k in 0..3 {
            assert!(dim[k] > 0.0, "non-positive domain extent in axis {}", k);
        }
        let cparts = parts.iter().map(CPart::mirror).collect();
        Space {
            dim,
            periodic,
            cdim: [0; 3],
            h: [0.0; 3],
            h_min: h_max,
            h_max,
            maxdepth: 0,
            params,
            parts,
            cparts,
            cells: Vec::new(),
            free_cells: Mutex::new(Vec::new()),
            grid: Vec::new(),
            tasks: TaskArena::default(),
        }
    }

    /// Rebuild the cell tree. Returns whether any cell appeared,
    /// disappeared or changed its split state, which is what gates task
    /// regeneration.
    pub fn rebuild(&mut self, force: bool, cell_max: f64) -> bool {
        measure("space_rebuild", || self.do_rebuild(force, cell_max))
    }

    fn do_rebuild(&mut self, force: bool, cell_max: f64) -> bool {
        let mut changes = false;

        // refresh the global smoothing length bounds
        if !self.parts.is_empty() {
            let mut h_min = f32::MAX;
            let mut h_max = 0.0f32;
            for p in &self.parts {
                assert!(p.h > 0.0, "non-positive smoothing length");
                h_min = h_min.min(p.h);
                h_max = h_max.max(p.h);
            }
            self.h_min = h_min;
            self.h_max = h_max;
        }

        // size the top-level grid; the stretch guards against particles
        // straddling a cell boundary between rebuilds
        let target = (self.h_max as f64 * self.params.stretch).max(cell_max);
        assert!(target > 0.0, "cannot size the top-level grid, h_max and cell_max are both zero");
        let mut cdim_new = [0usize; 3];
        for k in 0..3 {
            cdim_new[k] = ((self.dim[k] / target).floor() as usize).max(1);
        }

        // the grid is reallocated when it has to shrink, and reused when
        // it would merely grow finer
        let regrid = force || self.grid.is_empty() || (0..3).any(|k| cdim_new[k] < self.cdim[k]);
        if regrid {
            if self.periodic {
                for k in 0..3 {
                    assert!(cdim_new[k] >= 3, "periodic domains need at least three cells per axis");
                }
            }
            self.cells.clear();
            self.free_cells.lock().unwrap().clear();
            self.grid.clear();
            self.cdim = cdim_new;
            for k in 0..3 {
                self.h[k] = self.dim[k] / cdim_new[k] as f64;
            }
            for i in 0..self.cdim[0] {
                for j in 0..self.cdim[1] {
                    for k in 0..self.cdim[2] {
                        let cid = self.getcell();
                        let loc = [i as f64 * self.h[0], j as f64 * self.h[1], k as f64 * self.h[2]];
                        self.cells[cid as usize].init(loc, self.h, 0, InRangeOption::NONE);
                        self.grid.push(cid);
                    }
                }
            }
            changes = true;
        }

        // bin the particles and hand each top-level cell its range
        self.maxdepth = 0;
        let n = self.parts.len();
        if n > 0 {
            let mut ind: Vec<u32> = Vec::with_capacity(n);
            for p in &self.parts {
                ind.push(self.bin_of(&p.x) as u32);
            }
            parallel_sort::sort_by_bin(&mut ind, &mut self.parts);
            let mut start = 0;
            for bin in 0..self.grid.len() {
                let mut end = start;
                while end < n && ind[end] as usize == bin {
                    end += 1;
                }
                let cell = &mut self.cells[self.grid[bin] as usize];
                let was_empty = cell.count == 0;
                cell.parts_offset = start;
                cell.count = end - start;
                if was_empty != (cell.count == 0) {
                    changes = true;
                }
                start = end;
            }
            assert_eq!(start, n, "particles binned outside the grid");
        } else {
            for bin in 0..self.grid.len() {
                let cell = &mut self.cells[self.grid[bin] as usize];
                if cell.count != 0 {
                    changes = true;
                }
                cell.parts_offset = 0;
                cell.count = 0;
            }
        }

        // split or dismantle each top-level tree
        for bin in 0..self.grid.len() {
            let cid = self.grid[bin];
            if self.cells[cid as usize].count > 0 {
                changes |= self.split_cell(cid);
            } else {
                if self.cells[cid as usize].split {
                    self.dismantle(cid);
                    changes = true;
                }
                self.cells[cid as usize].h_max = 0.0;
            }
        }

        // refresh the condensed mirror
        self.cparts.clear();
        self.cparts.extend(self.parts.iter().map(CPart::mirror));

        changes
    }

    /// Recursively split a cell while enough of its particles have
    /// smoothing lengths below half its side.
    fn split_cell(&mut self, cid: CellId) -> bool {
        let (offset, count, loc, h, depth, was_split) = {
            let c = &self.cells[cid as usize];
            (c.parts_offset, c.count, c.loc, c.h, c.depth, c.split)
        };
        if depth > self.maxdepth {
            self.maxdepth = depth;
        }

        let h_limit = (h[0].min(h[1]).min(h[2]) / 2.0) as f32;
        let mut h_max = 0.0f32;
        let mut small = 0;
        for p in &self.parts[offset..offset + count] {
            if p.h <= h_limit {
                small += 1;
            }
            h_max = h_max.max(p.h);
        }
        self.cells[cid as usize].h_max = h_max;

        let do_split =
            count > self.params.split_size && small as f64 > count as f64 * self.params.split_ratio;
        let mut changes = false;

        if do_split {
            changes |= !was_split;
            self.cells[cid as usize].split = true;
            let mid = [loc[0] + h[0] / 2.0, loc[1] + h[1] / 2.0, loc[2] + h[2] / 2.0];
            let half = [h[0] / 2.0, h[1] / 2.0, h[2] / 2.0];
            let bounds = partition8(&mut self.parts[offset..offset + count], mid);
            for k in 0..8 {
                let ccount = bounds[k + 1] - bounds[k];
                let existing = self.cells[cid as usize].progeny[k].value();
                if ccount == 0 {
                    if let Some(child) = existing {
                        self.recycle_tree(child);
                        self.cells[cid as usize].progeny[k] = InRangeOption::NONE;
                        changes = true;
                    }
                    continue;
                }
                let child = match existing {
                    Some(child) => child,
                    None => {
                        changes = true;
                        let child = self.getcell();
                        let cloc = [
                            loc[0] + half[0] * ((k >> 2) & 1) as f64,
                            loc[1] + half[1] * ((k >> 1) & 1) as f64,
                            loc[2] + half[2] * (k & 1) as f64,
                        ];
                        self.cells[child as usize].init(cloc, half, depth + 1, InRangeOption::some(cid));
                        self.cells[cid as usize].progeny[k] = InRangeOption::some(child);
                        child
                    }
                };
                {
                    let c = &mut self.cells[child as usize];
                    c.parts_offset = offset + bounds[k];
                    c.count = ccount;
                }
                changes |= self.split_cell(child);
            }
        } else if was_split {
            self.dismantle(cid);
            changes = true;
        }

        changes
    }

    /// Recycle all progeny of a cell and mark it unsplit.
    fn dismantle(&mut self, cid: CellId) {
        for k in 0..8 {
            if let Some(child) = self.cells[cid as usize].progeny[k].value() {
                self.recycle_tree(child);
            }
        }
        self.cells[cid as usize].progeny = Default::default();
        self.cells[cid as usize].split = false;
    }

    fn recycle_tree(&mut self, cid: CellId) {
        for k in 0..8 {
            if let Some(child) = self.cells[cid as usize].progeny[k].value() {
                self.recycle_tree(child);
            }
        }
        self.cells[cid as usize].progeny = Default::default();
        self.cells[cid as usize].split = false;
        self.free_cells.lock().unwrap().push(cid);
    }

    /// Take a cell off the free-list, growing the arena by a chunk if
    /// necessary. The space mutex covers both.
    fn getcell(&mut self) -> CellId {
        let mut free = self.free_cells.lock().unwrap();
        if free.is_empty() {
            let start = self.cells.len();
            for _ in 0..self.params.cell_alloc_chunk.max(1) {
                self.cells.push(Cell::default());
            }
            free.extend((start..self.cells.len()).rev().map(|i| i as CellId));
        }
        free.pop().unwrap()
    }

    /// Number of live cells.
    pub fn tot_cells(&self) -> usize {
        self.cells.len() - self.free_cells.lock().unwrap().len()
    }

    /// Top-level grid index of a position.
    pub fn bin_of(&self, x: &[f64; 3]) -> usize {
        let mut coords = [0usize; 3];
        for k in 0..3 {
            let mut xi = x[k];
            if self.periodic {
                while xi < 0.0 {
                    xi += self.dim[k];
                }
                while xi >= self.dim[k] {
                    xi -= self.dim[k];
                }
            } else {
                debug_assert!(
                    (0.0..=self.dim[k]).contains(&xi),
                    "particle outside the non-periodic domain"
                );
            }
            coords[k] = ((xi / self.h[k]) as usize).min(self.cdim[k] - 1);
        }
        (coords[0] * self.cdim[1] + coords[1]) * self.cdim[2] + coords[2]
    }

    /// Fold the displacement between two cells onto a canonical stencil
    /// direction. Returns the direction id, the shift to add to `cj`'s
    /// positions when the pair wraps around the periodic boundary, and
    /// whether the cells must be swapped to make the displacement
    /// canonical.
    pub fn getsid(&self, ci: CellId, cj: CellId) -> (u8, [f64; 3], bool) {
        let (li, lj) = (self.cells[ci as usize].loc, self.cells[cj as usize].loc);
        let mut shift = [0.0f64; 3];
        let mut sign = [0i32; 3];
        for k in 0..3 {
            let mut d = lj[k] - li[k];
            if self.periodic {
                if d < -self.dim[k] / 2.0 {
                    shift[k] = self.dim[k];
                } else if d > self.dim[k] / 2.0 {
                    shift[k] = -self.dim[k];
                }
                d += shift[k];
            }
            sign[k] = if d < 0.0 {
                -1
            } else if d > 0.0 {
                1
            } else {
                0
            };
        }
        let raw = stencil::raw_index(sign[0], sign[1], sign[2]);
        let flip = stencil::RUNNER_FLIP[raw];
        if flip {
            for s in &mut shift {
                *s = -*s;
            }
        }
        (stencil::SORTLIST_ID[raw], shift, flip)
    }

    /// Top-level ancestor of a cell.
    pub fn top_of(&self, cid: CellId) -> CellId {
        let mut finger = cid;
        while let Some(parent) = self.cells[finger as usize].parent.value() {
            finger = parent;
        }
        finger
    }
}

impl CPart {
    fn mirror(p: &Part) -> CPart {
        CPart { x: p.x, h: p.h, dt: p.dt }
    }
}

/// Partition a particle range into the 8 progeny buckets, x then y then z,
/// matching the progeny bit pattern. Returns the 9 bucket boundaries.
fn partition8(parts: &mut [Part], mid: [f64; 3]) -> [usize; 9] {
    let mut bounds = [0usize; 9];
    bounds[8] = parts.len();
    let mx = partition(parts, 0, mid[0]);
    bounds[4] = mx;
    let (lo_x, hi_x) = parts.split_at_mut(mx);
    let my0 = partition(lo_x, 1, mid[1]);
    let my1 = partition(hi_x, 1, mid[1]);
    bounds[2] = my0;
    bounds[6] = mx + my1;
    let (q00, q01) = lo_x.split_at_mut(my0);
    let (q10, q11) = hi_x.split_at_mut(my1);
    bounds[1] = partition(q00, 2, mid[2]);
    bounds[3] = bounds[2] + partition(q01, 2, mid[2]);
    bounds[5] = bounds[4] + partition(q10, 2, mid[2]);
    bounds[7] = bounds[6] + partition(q11, 2, mid[2]);
    bounds
}

/// Two-way in-place partition; returns the size of the `< pivot` side.
fn partition(parts: &mut [Part], axis: usize, pivot: f64) -> usize {
    let mut i = 0;
    let mut j = parts.len();
    while i < j {
        if parts[i].x[axis] < pivot {
            i += 1;
        } else {
            j -= 1;
            parts.swap(i, j);
        }
    }
    i
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;

    fn part_at(x: [f64; 3], h: f32) -> Part {
        Part { x, h, dt: 0.1, ..Default::default() }
    }

    #[test]
    fn partition8_produces_the_progeny_order() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut parts: Vec<Part> = (0..256)
            .map(|_| part_at([rng.gen::<f64>(), rng.gen::<f64>(), rng.gen::<f64>()], 0.01))
            .collect();
        let bounds = partition8(&mut parts, [0.5; 3]);
        assert_eq!(bounds[0], 0);
        assert_eq!(bounds[8], 256);
        for k in 0..8 {
            for p in &parts[bounds[k]..bounds[k + 1]] {
                assert_eq!(p.x[0] >= 0.5, k >> 2 & 1 == 1);
                assert_eq!(p.x[1] >= 0.5, k >> 1 & 1 == 1);
                assert_eq!(p.x[2] >= 0.5, k & 1 == 1);
            }
        }
    }

    #[test]
    fn rebuild_partitions_all_particles() {
        let mut rng = StdRng::seed_from_u64(7);
        let parts: Vec<Part> = (0..500)
            .map(|_| part_at([rng.gen::<f64>(), rng.gen::<f64>(), rng.gen::<f64>()], 0.05))
            .collect();
        let mut space = Space::new([1.0; 3], parts, false, 0.05, SpaceParams::default());
        space.rebuild(true, 0.25);
        assert_eq!(space.cdim, [4, 4, 4]);
        let total: usize = space.grid.iter().map(|&cid| space.cells[cid as usize].count).sum();
        assert_eq!(total, 500);
        for &cid in &space.grid {
            let cell = &space.cells[cid as usize];
            for p in &space.parts[cell.parts_offset..cell.parts_offset + cell.count] {
                for k in 0..3 {
                    assert!(p.x[k] >= cell.loc[k] && p.x[k] <= cell.loc[k] + cell.h[k]);
                }
            }
            // the mirror must match after the rebuild
            for i in cell.parts_offset..cell.parts_offset + cell.count {
                assert_eq!(space.parts[i].x, space.cparts[i].x);
            }
        }
    }

    #[test]
    fn split_trigger_and_dismantling() {
        let mut rng = StdRng::seed_from_u64(3);
        // 800 small particles spread over all octants of one cell
        let parts: Vec<Part> = (0..800)
            .map(|_| part_at([rng.gen::<f64>() * 0.5, rng.gen::<f64>() * 0.5, rng.gen::<f64>() * 0.5], 0.05))
            .collect();
        let mut space = Space::new([1.0; 3], parts, false, 0.05, SpaceParams::default());
        space.rebuild(true, 0.5);
        let root = space.grid[0];
        assert!(space.cells[root as usize].split);
        let progeny_total: usize = space.cells[root as usize]
            .progeny
            .iter()
            .filter_map(|c| c.value())
            .map(|c| space.cells[c as usize].count)
            .sum();
        assert_eq!(progeny_total, 800);

        // growing the smoothing lengths past the split limit dismantles it
        for p in &mut space.parts {
            p.h = 0.4;
        }
        let changes = space.rebuild(false, 0.5);
        assert!(changes);
        assert!(!space.cells[space.grid[0] as usize].split);
    }
}
