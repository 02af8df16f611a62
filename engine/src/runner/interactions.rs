//! Task bodies: directional sorts, self and pair sweeps, recursive sub
//! bundles, and the ghost barrier.

use super::SpacePtr;
use crate::datastr::cell::{Cell, CellId, SortEntry};
use crate::datastr::task::{TaskId, TaskKind, TaskSubtype};
use crate::kernels::SphKernels;
use crate::space::Space;
use crate::stencil::{NR_DIRECTIONS, PAIR_SPLITS, PTS, SORT_AXES};

pub(super) fn execute(shared: SpacePtr, tid: TaskId, kernels: &impl SphKernels) {
    let space = unsafe { shared.space() };
    let task = &space.tasks[tid];
    let ci = task.ci.value().expect("task without a cell");
    match (task.kind, task.subtype) {
        (TaskKind::Sort, _) => do_sort(shared, ci, task.flags),
        (TaskKind::SelfInteraction, subtype) => {
            let parts = unsafe { shared.parts_mut(ci) };
            let cparts = unsafe { shared.cparts(ci) };
            match subtype {
                TaskSubtype::Density => kernels.density_self(parts, cparts),
                TaskSubtype::Force => kernels.force_self(parts, cparts),
                TaskSubtype::None => unreachable!("interaction without a phase"),
            }
        }
        (TaskKind::Pair, subtype) => {
            let cj = task.cj.value().expect("pair without a second cell");
            do_pair(shared, ci, cj, subtype, kernels);
        }
        (TaskKind::Sub, subtype) => match task.cj.value() {
            Some(cj) => do_sub_pair(shared, ci, cj, subtype, kernels),
            None => do_sub_self(shared, ci, subtype, kernels),
        },
        (TaskKind::Ghost, _) => do_ghost(shared, ci, kernels),
        (TaskKind::None, _) => unreachable!("removed task scheduled"),
    }
}

/// Produce the projected-distance orderings requested by `flags`. Split
/// cells merge the already sorted streams of their progeny, leaves sort
/// directly. Ties break on the particle index, giving a deterministic
/// total order independent of the merge shape.
fn do_sort(shared: SpacePtr, cid: CellId, flags: u32) {
    let space = unsafe { shared.space() };
    let split = space.cells[cid as usize].split;
    for sid in 0..NR_DIRECTIONS {
        if flags & (1 << sid) == 0 {
            continue;
        }
        let cell = &space.cells[cid as usize];
        let entries = if split {
            merge_child_streams(space, cell, sid)
        } else {
            direct_sort(space, cell, sid)
        };
        debug_assert!(
            entries
                .windows(2)
                .all(|w| w[0].d < w[1].d || (w[0].d == w[1].d && w[0].i < w[1].i)),
            "sort produced an out-of-order stream"
        );
        unsafe { shared.cell_mut(cid) }.sort[sid] = entries;
    }
}

fn direct_sort(space: &Space, cell: &Cell, sid: usize) -> Vec<SortEntry> {
    let axis = SORT_AXES[sid];
    let cparts = &space.cparts[cell.parts_offset..cell.parts_offset + cell.count];
    let mut entries: Vec<SortEntry> = cparts
        .iter()
        .enumerate()
        .map(|(i, p)| SortEntry {
            i: i as u32,
            d: (p.x[0] * axis[0] as f64 + p.x[1] * axis[1] as f64 + p.x[2] * axis[2] as f64) as f32,
        })
        .collect();
    entries.sort_unstable_by(|a, b| a.d.total_cmp(&b.d).then(a.i.cmp(&b.i)));
    entries
}

fn merge_child_streams(space: &Space, cell: &Cell, sid: usize) -> Vec<SortEntry> {
    let mut sources: Vec<(&[SortEntry], u32)> = Vec::with_capacity(8);
    for k in 0..8 {
        if let Some(child) = cell.progeny[k].value() {
            let c = &space.cells[child as usize];
            sources.push((&c.sort[sid], (c.parts_offset - cell.parts_offset) as u32));
        }
    }
    let mut cursors = vec![0usize; sources.len()];
    let mut merged = Vec::with_capacity(cell.count);
    loop {
        let mut best: Option<(usize, SortEntry)> = None;
        for (s, &(list, delta)) in sources.iter().enumerate() {
            if cursors[s] >= list.len() {
                continue;
            }
            let entry = list[cursors[s]];
            let candidate = SortEntry { i: entry.i + delta, d: entry.d };
            let better = match best {
                None => true,
                Some((_, b)) => candidate.d < b.d || (candidate.d == b.d && candidate.i < b.i),
            };
            if better {
                best = Some((s, candidate));
            }
        }
        match best {
            Some((s, entry)) => {
                merged.push(entry);
                cursors[s] += 1;
            }
            None => break,
        }
    }
    debug_assert_eq!(merged.len(), cell.count, "merge lost particles");
    merged
}

fn do_pair(shared: SpacePtr, ci: CellId, cj: CellId, subtype: TaskSubtype, kernels: &impl SphKernels) {
    let space = unsafe { shared.space() };
    let (_sid, shift, flip) = space.getsid(ci, cj);
    debug_assert!(!flip, "pair stored in a non-canonical orientation");
    let parts_i = unsafe { shared.parts_mut(ci) };
    let cparts_i = unsafe { shared.cparts(ci) };
    let parts_j = unsafe { shared.parts_mut(cj) };
    let cparts_j = unsafe { shared.cparts(cj) };
    match subtype {
        TaskSubtype::Density => kernels.density_pair(parts_i, cparts_i, parts_j, cparts_j, shift),
        TaskSubtype::Force => kernels.force_pair(parts_i, cparts_i, parts_j, cparts_j, shift),
        TaskSubtype::None => unreachable!("interaction without a phase"),
    }
}

fn do_sub_self(shared: SpacePtr, cid: CellId, subtype: TaskSubtype, kernels: &impl SphKernels) {
    let space = unsafe { shared.space() };
    let cell = &space.cells[cid as usize];
    if cell.split {
        let progeny = cell.progeny;
        for j in 0..8 {
            if let Some(child) = progeny[j].value() {
                do_sub_self(shared, child, subtype, kernels);
                for k in (j + 1)..8 {
                    if let Some(other) = progeny[k].value() {
                        debug_assert_eq!(
                            space.getsid(child, other).0,
                            PTS[j][k] as u8,
                            "progeny pair direction mismatch"
                        );
                        do_sub_pair(shared, child, other, subtype, kernels);
                    }
                }
            }
        }
    } else {
        let parts = unsafe { shared.parts_mut(cid) };
        let cparts = unsafe { shared.cparts(cid) };
        match subtype {
            TaskSubtype::Density => kernels.density_self(parts, cparts),
            TaskSubtype::Force => kernels.force_self(parts, cparts),
            TaskSubtype::None => unreachable!("interaction without a phase"),
        }
    }
}

/// Recurse a pair bundle. The refinement predicate is re-checked at every
/// level, so the bundle degrades to a direct pair sweep wherever progeny
/// smoothing lengths leave no room to descend further.
fn do_sub_pair(shared: SpacePtr, ci: CellId, cj: CellId, subtype: TaskSubtype, kernels: &impl SphKernels) {
    let space = unsafe { shared.space() };
    let (sid, shift, flip) = space.getsid(ci, cj);
    let (ci, cj) = if flip { (cj, ci) } else { (ci, cj) };
    let a = &space.cells[ci as usize];
    let b = &space.cells[cj as usize];
    let stretch = space.params.stretch;
    let refinable = a.split
        && b.split
        && (a.h_max as f64) * stretch < a.min_side() / 2.0
        && (b.h_max as f64) * stretch < b.min_side() / 2.0;
    if refinable {
        for entry in PAIR_SPLITS[sid as usize] {
            if let (Some(pi), Some(pj)) = (
                a.progeny[entry.pi as usize].value(),
                b.progeny[entry.pj as usize].value(),
            ) {
                let (pi, pj) = if entry.flip { (pj, pi) } else { (pi, pj) };
                do_sub_pair(shared, pi, pj, subtype, kernels);
            }
        }
    } else {
        // getsid already returns the shift for the canonical orientation
        let parts_i = unsafe { shared.parts_mut(ci) };
        let cparts_i = unsafe { shared.cparts(ci) };
        let parts_j = unsafe { shared.parts_mut(cj) };
        let cparts_j = unsafe { shared.cparts(cj) };
        match subtype {
            TaskSubtype::Density => kernels.density_pair(parts_i, cparts_i, parts_j, cparts_j, shift),
            TaskSubtype::Force => kernels.force_pair(parts_i, cparts_i, parts_j, cparts_j, shift),
            TaskSubtype::None => unreachable!("interaction without a phase"),
        }
    }
}

/// Ghosts are synchronisation nodes; the per-particle ghost kernel runs
/// here for every particle not covered by a deeper ghost, so post-density
/// work is applied exactly once per particle.
fn do_ghost(shared: SpacePtr, cid: CellId, kernels: &impl SphKernels) {
    let space = unsafe { shared.space() };
    let cell = &space.cells[cid as usize];
    if cell.count == 0 {
        return;
    }
    let mut covered = Vec::new();
    collect_ghost_ranges(space, cell, &mut covered);
    covered.sort_unstable();
    let mut cursor = cell.parts_offset;
    let end = cell.parts_offset + cell.count;
    for &(offset, count) in &covered {
        if offset > cursor {
            kernels.ghost(unsafe { shared.parts_range_mut(cursor, offset - cursor) });
        }
        cursor = offset + count;
    }
    if cursor < end {
        kernels.ghost(unsafe { shared.parts_range_mut(cursor, end - cursor) });
    }
}

/// Particle ranges of the maximal ghost-bearing strict descendants.
fn collect_ghost_ranges(space: &Space, cell: &Cell, out: &mut Vec<(usize, usize)>) {
    for k in 0..8 {
        if let Some(child) = cell.progeny[k].value() {
            let c = &space.cells[child as usize];
            if c.ghost.is_some() {
                out.push((c.parts_offset, c.count));
            } else {
                collect_ghost_ranges(space, c, out);
            }
        }
    }
}
