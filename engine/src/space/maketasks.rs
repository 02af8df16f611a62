//! The task generator: compiles the cell tree and the 27-cell stencil
//! into a dependency graph of sort, self, pair, sub and ghost tasks.

use crate::datastr::cell::CellId;
use crate::datastr::task::{Task, TaskId, TaskKind, TaskSubtype};
use crate::report::benchmark::measure;
use crate::report::report;
use crate::space::Space;
use crate::stencil::{self, ALL_DIRECTIONS, NR_DIRECTIONS, PAIR_SPLITS, PTS};
use crate::util::in_range_option::InRangeOption;

/// Tasks per live cell the arena must be able to hold.
const TASKS_PER_CELL: usize = 43;

impl Space {
    /// Regenerate the full task graph for the current cell tree.
    pub fn maketasks(&mut self) {
        measure("space_maketasks", || self.do_maketasks())
    }

    fn do_maketasks(&mut self) {
        let tot_cells = self.tot_cells();
        self.tasks.reset(tot_cells * TASKS_PER_CELL);
        for i in 0..self.grid.len() {
            let cid = self.grid[i];
            self.reset_cell_tasks(cid);
        }

        // sorts first so interactions can depend on them as they appear
        for i in 0..self.grid.len() {
            let cid = self.grid[i];
            self.make_sorts(cid);
        }
        self.make_base_graph();
        self.splittasks();
        self.cleanup_sorts();
        self.count_cell_tasks();
        for i in 0..self.grid.len() {
            let cid = self.grid[i];
            self.set_supers(cid);
        }
        for i in 0..self.grid.len() {
            let cid = self.grid[i];
            self.make_ghosts(cid, None);
        }
        self.make_force_tasks();
        self.tasks.rewait();

        report("nr_cells", tot_cells);
        report(
            "nr_tasks",
            self.tasks.iter().filter(|t| t.kind != TaskKind::None).count(),
        );
    }

    fn reset_cell_tasks(&mut self, cid: CellId) {
        self.cells[cid as usize].reset_tasks();
        for k in 0..8 {
            if let Some(child) = self.cells[cid as usize].progeny[k].value() {
                self.reset_cell_tasks(child);
            }
        }
    }

    fn addtask(
        &mut self,
        kind: TaskKind,
        subtype: TaskSubtype,
        flags: u32,
        ci: CellId,
        cj: Option<CellId>,
    ) -> TaskId {
        self.tasks.add(Task::new(kind, subtype, flags, ci, cj))
    }

    /// Make `task` depend on `cid`'s sort for the given direction.
    fn add_sort_dep(&mut self, cid: CellId, direction: usize, task: TaskId) {
        if let Some(sort) = self.cells[cid as usize].sorts[direction].value() {
            self.tasks.addunlock(sort, task);
        }
    }

    /// Make `task` depend on every distinct sort task of `cid`.
    fn add_all_sort_deps(&mut self, cid: CellId, task: TaskId) {
        for sort in self.cells[cid as usize].distinct_sorts() {
            self.tasks.addunlock(sort, task);
        }
    }

    /// Attach sort tasks to every cell with particles. Small cells get a
    /// single task covering all 13 directions, large cells split the
    /// directions over several tasks so the sorting itself parallelises.
    fn make_sorts(&mut self, cid: CellId) {
        let (count, split) = {
            let c = &self.cells[cid as usize];
            (c.count, c.split)
        };
        if count == 0 {
            return;
        }

        let mut sorts = [InRangeOption::NONE; 14];
        if count < 1000 {
            let t = self.addtask(TaskKind::Sort, TaskSubtype::None, ALL_DIRECTIONS, cid, None);
            for entry in sorts.iter_mut().take(NR_DIRECTIONS) {
                *entry = InRangeOption::some(t);
            }
        } else if count < 5000 {
            let t_low = self.addtask(TaskKind::Sort, TaskSubtype::None, 0x7f, cid, None);
            let t_high = self.addtask(TaskKind::Sort, TaskSubtype::None, 0x1f80, cid, None);
            for (d, entry) in sorts.iter_mut().enumerate().take(NR_DIRECTIONS) {
                *entry = InRangeOption::some(if d < 7 { t_low } else { t_high });
            }
        } else {
            // seven tasks of two directions each, the x axis on its own
            for group in 0..7 {
                let mask = if group < 6 { 0x3 << (2 * group) } else { 0x1000 };
                let t = self.addtask(TaskKind::Sort, TaskSubtype::None, mask, cid, None);
                sorts[2 * group] = InRangeOption::some(t);
                if group < 6 {
                    sorts[2 * group + 1] = InRangeOption::some(t);
                }
            }
        }
        self.cells[cid as usize].sorts = sorts;

        if split {
            for k in 0..8 {
                if let Some(child) = self.cells[cid as usize].progeny[k].value() {
                    self.make_sorts(child);
                    // the parent merges the sorted child streams
                    for d in 0..NR_DIRECTIONS {
                        let child_sort = self.cells[child as usize].sorts[d].value();
                        let own_sort = self.cells[cid as usize].sorts[d].value();
                        if let (Some(cs), Some(ps)) = (child_sort, own_sort) {
                            self.tasks.addunlock(cs, ps);
                        }
                    }
                }
            }
        }
    }

    /// One self task per occupied top-level cell plus one pair task per
    /// occupied stencil neighbour with a higher grid index.
    fn make_base_graph(&mut self) {
        let cdim = self.cdim;
        let periodic = self.periodic;
        for i in 0..cdim[0] {
            for j in 0..cdim[1] {
                for k in 0..cdim[2] {
                    let bin = (i * cdim[1] + j) * cdim[2] + k;
                    let cid = self.grid[bin];
                    if self.cells[cid as usize].count == 0 {
                        continue;
                    }
                    self.addtask(TaskKind::SelfInteraction, TaskSubtype::Density, 0, cid, None);
                    for dx in -1i32..=1 {
                        for dy in -1i32..=1 {
                            for dz in -1i32..=1 {
                                if dx == 0 && dy == 0 && dz == 0 {
                                    continue;
                                }
                                let neighbour = match (
                                    wrap(i, dx, cdim[0], periodic),
                                    wrap(j, dy, cdim[1], periodic),
                                    wrap(k, dz, cdim[2], periodic),
                                ) {
                                    (Some(ii), Some(jj), Some(kk)) => {
                                        (ii * cdim[1] + jj) * cdim[2] + kk
                                    }
                                    _ => continue,
                                };
                                if neighbour <= bin {
                                    continue;
                                }
                                let ncid = self.grid[neighbour];
                                if self.cells[ncid as usize].count == 0 {
                                    continue;
                                }
                                let raw = stencil::raw_index(dx, dy, dz);
                                let sid = stencil::SORTLIST_ID[raw] as u32;
                                let (ci, cj) = if stencil::RUNNER_FLIP[raw] {
                                    (ncid, cid)
                                } else {
                                    (cid, ncid)
                                };
                                let t =
                                    self.addtask(TaskKind::Pair, TaskSubtype::Density, sid, ci, Some(cj));
                                self.add_sort_dep(ci, sid as usize, t);
                                self.add_sort_dep(cj, sid as usize, t);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Refine the graph. The task list grows while it is being walked and
    /// appended tasks are picked up by the same sweep; tasks converted in
    /// place are re-examined at the same index.
    fn splittasks(&mut self) {
        let mut tid: TaskId = 0;
        while (tid as usize) < self.tasks.len() {
            if !self.splittask(tid) {
                tid += 1;
            }
        }
    }

    /// Returns whether the task was replaced in place and needs another look.
    fn splittask(&mut self, tid: TaskId) -> bool {
        let (kind, subtype, ci, cj) = {
            let t = &self.tasks[tid];
            (t.kind, t.subtype, t.ci.value(), t.cj.value())
        };
        match (kind, ci, cj) {
            (TaskKind::SelfInteraction, Some(ci), None) => self.split_self_task(tid, subtype, ci),
            (TaskKind::Pair, Some(ci), Some(cj)) => self.split_pair_task(tid, subtype, ci, cj),
            _ => false,
        }
    }

    fn split_self_task(&mut self, tid: TaskId, subtype: TaskSubtype, ci: CellId) -> bool {
        if !self.cells[ci as usize].split {
            return false;
        }

        if self.cells[ci as usize].count < self.params.sub_size {
            // bundle the whole subtree into one sub; the cell's own sorts
            // cover every descendant direction through the merge chain
            self.tasks[tid].kind = TaskKind::Sub;
            self.tasks[tid].flags = 0;
            self.add_all_sort_deps(ci, tid);
            return false;
        }

        // one self task per occupied child, the original task becoming
        // the first of them
        let progeny = self.cells[ci as usize].progeny;
        let mut first = None;
        for k in 0..8 {
            if let Some(child) = progeny[k].value() {
                if first.is_none() {
                    first = Some(child);
                } else {
                    self.addtask(TaskKind::SelfInteraction, subtype, 0, child, None);
                }
            }
        }
        let first = first.expect("split cell with no occupied progeny");
        {
            let t = &mut self.tasks[tid];
            t.ci = InRangeOption::some(first);
            t.relink_cells();
        }

        // plus one pair per unordered pair of occupied children
        for j in 0..7 {
            if let Some(child_j) = progeny[j].value() {
                for k in (j + 1)..8 {
                    if let Some(child_k) = progeny[k].value() {
                        let sid = PTS[j][k] as u32;
                        let t = self.addtask(TaskKind::Pair, subtype, sid, child_j, Some(child_k));
                        self.add_sort_dep(child_j, sid as usize, t);
                        self.add_sort_dep(child_k, sid as usize, t);
                    }
                }
            }
        }
        true
    }

    fn split_pair_task(&mut self, tid: TaskId, subtype: TaskSubtype, ci: CellId, cj: CellId) -> bool {
        // canonicalise the orientation; pairs from the self split are
        // stored in progeny order and may need the swap
        let (sid, _shift, flip) = self.getsid(ci, cj);
        let (ci, cj) = if flip { (cj, ci) } else { (ci, cj) };
        {
            let t = &mut self.tasks[tid];
            t.ci = InRangeOption::some(ci);
            t.cj = InRangeOption::some(cj);
            t.flags = sid as u32;
        }

        let refinable = {
            let a = &self.cells[ci as usize];
            let b = &self.cells[cj as usize];
            a.split
                && b.split
                && (a.h_max as f64) * self.params.stretch < a.min_side() / 2.0
                && (b.h_max as f64) * self.params.stretch < b.min_side() / 2.0
        };
        if !refinable {
            return false;
        }

        let small = self.cells[ci as usize].count < self.params.sub_size
            && self.cells[cj as usize].count < self.params.sub_size;
        if small && !stencil::is_corner(sid) {
            // bundle into a sub; every occupied child of both cells must
            // be fully sorted before it runs
            self.tasks[tid].kind = TaskKind::Sub;
            for side in [ci, cj] {
                let progeny = self.cells[side as usize].progeny;
                for k in 0..8 {
                    if let Some(child) = progeny[k].value() {
                        self.add_all_sort_deps(child, tid);
                    }
                }
            }
            return false;
        }

        // replace by the explicit child pairs of this direction
        let progeny_i = self.cells[ci as usize].progeny;
        let progeny_j = self.cells[cj as usize].progeny;
        let mut replaced = false;
        for entry in PAIR_SPLITS[sid as usize] {
            let pair = match (
                progeny_i[entry.pi as usize].value(),
                progeny_j[entry.pj as usize].value(),
            ) {
                (Some(a), Some(b)) => {
                    if entry.flip {
                        (b, a)
                    } else {
                        (a, b)
                    }
                }
                _ => continue,
            };
            let target = if !replaced {
                replaced = true;
                let t = &mut self.tasks[tid];
                t.ci = InRangeOption::some(pair.0);
                t.cj = InRangeOption::some(pair.1);
                t.flags = entry.sid as u32;
                t.relink_cells();
                tid
            } else {
                self.addtask(TaskKind::Pair, subtype, entry.sid as u32, pair.0, Some(pair.1))
            };
            self.add_sort_dep(pair.0, entry.sid as usize, target);
            self.add_sort_dep(pair.1, entry.sid as usize, target);
        }
        if !replaced {
            // no child pair survives, the interface is empty
            let t = &mut self.tasks[tid];
            t.kind = TaskKind::None;
            t.unlock_tasks.clear();
            t.unlock_cells.clear();
            return false;
        }
        true
    }

    /// Remove sort tasks nothing depends on. A parent sort is examined
    /// before its children, so a child stream feeding a dead parent dies
    /// with it unless an interaction needs the child directly.
    fn cleanup_sorts(&mut self) {
        let mut keep = vec![false; self.tasks.len()];
        for i in 0..self.grid.len() {
            let cid = self.grid[i];
            self.sweep_sorts(cid, &mut keep);
        }
        for tid in 0..self.tasks.len() {
            let t = &mut self.tasks[tid as TaskId];
            if t.kind == TaskKind::Sort && !keep[tid] {
                t.kind = TaskKind::None;
                t.unlock_tasks.clear();
            }
        }
        // strip dangling edges into the removed tasks
        let removed: Vec<bool> = self.tasks.iter().map(|t| t.kind == TaskKind::None).collect();
        for tid in 0..self.tasks.len() {
            self.tasks[tid as TaskId]
                .unlock_tasks
                .retain(|&succ| !removed[succ as usize]);
        }
    }

    fn sweep_sorts(&mut self, cid: CellId, keep: &mut Vec<bool>) {
        for sort in self.cells[cid as usize].distinct_sorts() {
            let keep_it = self.tasks[sort].unlock_tasks.iter().any(|&succ| {
                self.tasks[succ].kind != TaskKind::Sort || keep[succ as usize]
            });
            keep[sort as usize] = keep_it;
        }
        for k in 0..8 {
            if let Some(child) = self.cells[cid as usize].progeny[k].value() {
                self.sweep_sorts(child, keep);
            }
        }
    }

    /// Rebuild the per-cell task counts and density lists from the final
    /// interaction set.
    fn count_cell_tasks(&mut self) {
        for tid in 0..self.tasks.len() as TaskId {
            let (kind, subtype, ci, cj) = {
                let t = &self.tasks[tid];
                (t.kind, t.subtype, t.ci.value(), t.cj.value())
            };
            if kind == TaskKind::None {
                continue;
            }
            let interaction = matches!(
                kind,
                TaskKind::SelfInteraction | TaskKind::Pair | TaskKind::Sub
            );
            for cell in [ci, cj].into_iter().flatten() {
                let c = &mut self.cells[cell as usize];
                c.nr_tasks += 1;
                if kind == TaskKind::Pair {
                    c.nr_pairs += 1;
                }
                if interaction && subtype == TaskSubtype::Density {
                    c.density.push(tid);
                }
            }
        }
    }

    /// The super of a cell is its highest ancestor still hosting density
    /// work; parents are resolved before their progeny. Sort tasks do not
    /// count here, every populated cell has those, and gating on them
    /// would push every super to the top of the grid.
    fn set_supers(&mut self, cid: CellId) {
        let super_ = match self.cells[cid as usize].parent.value() {
            Some(parent) if self.cells[parent as usize].nr_density() > 0 => {
                self.cells[parent as usize].super_
            }
            _ => InRangeOption::some(cid),
        };
        self.cells[cid as usize].super_ = super_;
        for k in 0..8 {
            if let Some(child) = self.cells[cid as usize].progeny[k].value() {
                self.set_supers(child);
            }
        }
    }

    /// Ghosts separate the density phase from the force phase. Every
    /// ghost below a super depends on its nearest ancestor ghost, so the
    /// super's ghost gates the whole subtree.
    fn make_ghosts(&mut self, cid: CellId, ancestor_ghost: Option<TaskId>) {
        let is_super = self.cells[cid as usize].super_ == InRangeOption::some(cid);
        let mut nearest = ancestor_ghost;
        if is_super || self.cells[cid as usize].nr_density() > 0 {
            let ghost = self.addtask(TaskKind::Ghost, TaskSubtype::None, 0, cid, None);
            self.cells[cid as usize].ghost = InRangeOption::some(ghost);
            self.cells[cid as usize].nr_tasks += 1;
            if let Some(above) = ancestor_ghost {
                self.tasks.addunlock(above, ghost);
            }
            nearest = Some(ghost);
        }
        for k in 0..8 {
            if let Some(child) = self.cells[cid as usize].progeny[k].value() {
                self.make_ghosts(child, nearest);
            }
        }
    }

    /// For every density task create a force twin gated through the
    /// ghosts of the acting cells' supers: all density contributions to a
    /// particle complete before any of its force interactions start.
    fn make_force_tasks(&mut self) {
        let nr_tasks = self.tasks.len() as TaskId;
        for tid in 0..nr_tasks {
            let (kind, subtype, flags, ci, cj) = {
                let t = &self.tasks[tid];
                (t.kind, t.subtype, t.flags, t.ci.value(), t.cj.value())
            };
            if subtype != TaskSubtype::Density {
                continue;
            }
            if !matches!(
                kind,
                TaskKind::SelfInteraction | TaskKind::Pair | TaskKind::Sub
            ) {
                continue;
            }
            let ci = ci.expect("interaction task without a cell");
            let twin = self.addtask(kind, TaskSubtype::Force, flags, ci, cj);
            let mut gates = Vec::new();
            for cell in [Some(ci), cj].into_iter().flatten() {
                let super_ = self.cells[cell as usize].super_.value().expect("cell without super");
                let ghost = self.cells[super_ as usize]
                    .ghost
                    .value()
                    .expect("super cell without ghost");
                self.tasks.addunlock(tid, ghost);
                self.ghosts_covering(cell, &mut gates);
                let c = &mut self.cells[cell as usize];
                c.nr_tasks += 1;
                if kind == TaskKind::Pair {
                    c.nr_pairs += 1;
                }
            }
            // the twin waits for every ghost whose per-particle range can
            // overlap its cells, not just the supers'
            for &gate in &gates {
                self.tasks.addunlock(gate, twin);
            }
        }
    }

    /// Ghosts whose per-particle range can overlap the cell's particles:
    /// those on the chain from the cell up to its super, plus every ghost
    /// in the cell's subtree.
    fn ghosts_covering(&self, cid: CellId, out: &mut Vec<TaskId>) {
        let super_ = self.cells[cid as usize].super_.value();
        let mut finger = Some(cid);
        while let Some(cell) = finger {
            if let Some(ghost) = self.cells[cell as usize].ghost.value() {
                if !out.contains(&ghost) {
                    out.push(ghost);
                }
            }
            if Some(cell) == super_ {
                break;
            }
            finger = self.cells[cell as usize].parent.value();
        }
        self.subtree_ghosts(cid, out);
    }

    fn subtree_ghosts(&self, cid: CellId, out: &mut Vec<TaskId>) {
        for k in 0..8 {
            if let Some(child) = self.cells[cid as usize].progeny[k].value() {
                if let Some(ghost) = self.cells[child as usize].ghost.value() {
                    if !out.contains(&ghost) {
                        out.push(ghost);
                    }
                }
                self.subtree_ghosts(child, out);
            }
        }
    }
}

fn wrap(i: usize, d: i32, n: usize, periodic: bool) -> Option<usize> {
    let raw = i as i32 + d;
    if raw < 0 {
        if periodic {
            Some(n - 1)
        } else {
            None
        }
    } else if raw >= n as i32 {
        if periodic {
            Some(0)
        } else {
            None
        }
    } else {
        Some(raw as usize)
    }
}
