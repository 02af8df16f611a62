//! The worker pool draining the task graph.

use crate::datastr::cell::{Cell, CellId};
use crate::datastr::queue::ReadyQueue;
use crate::datastr::task::{TaskId, TaskKind};
use crate::kernels::SphKernels;
use crate::report::benchmark::measure;
use crate::report::{report, with_run_report};
use crate::space::{CPart, Part, Space};
use std::sync::atomic::{AtomicUsize, Ordering};

mod interactions;

/// A fixed pool of workers executing a space's task graph.
pub struct Runner {
    nr_workers: usize,
}

impl Runner {
    pub fn new(nr_workers: usize) -> Runner {
        assert!(nr_workers > 0, "need at least one worker");
        Runner { nr_workers }
    }

    /// One engine step: rebuild the tree, regenerate the graph if the
    /// tree changed, and drain it.
    pub fn step(&self, space: &mut Space, kernels: &impl SphKernels, cell_max: f64) {
        let changes = space.rebuild(false, cell_max);
        if changes || space.tasks.is_empty() {
            space.maketasks();
        }
        self.run(space, kernels);
    }

    /// Drain the current task graph. The graph is left intact and can be
    /// drained again.
    pub fn run(&self, space: &mut Space, kernels: &impl SphKernels) {
        with_run_report("engine_run", || measure("space_run", || self.do_run(space, kernels)))
    }

    fn do_run(&self, space: &mut Space, kernels: &impl SphKernels) {
        // every wait counter equals its predecessor count at submission
        space.tasks.rewait();
        let queue = ReadyQueue::new(space.tasks.len());
        let mut nr_live = 0;
        for (tid, task) in space.tasks.iter().enumerate() {
            if task.kind == TaskKind::None {
                continue;
            }
            nr_live += 1;
            if task.wait.load(Ordering::Relaxed) == 0 {
                queue.push(tid as TaskId);
            }
        }
        report("nr_executed", nr_live);
        report("nr_workers", self.nr_workers);
        if nr_live == 0 {
            return;
        }

        let pending = AtomicUsize::new(nr_live);
        let retries = AtomicUsize::new(0);
        let shared = SpacePtr(space as *mut Space);
        let core_ids = core_affinity::get_core_ids().unwrap_or_default();
        std::thread::scope(|s| {
            for w in 0..self.nr_workers {
                let core = core_ids.get(w % core_ids.len().max(1)).copied();
                let queue = &queue;
                let pending = &pending;
                let retries = &retries;
                s.spawn(move || {
                    if let Some(core) = core {
                        core_affinity::set_for_current(core);
                    }
                    worker(shared, queue, pending, retries, kernels);
                });
            }
        });
        report("nr_lock_retries", retries.load(Ordering::Relaxed));
        debug_assert!(queue.is_empty());
    }
}

/// The task graph guarantees that concurrently executing tasks touch
/// disjoint particle ranges (cell tree-locks) and disjoint sort storage
/// (sort dependencies). There is no way to express that in safe rust, so
/// the workers share the space through a raw pointer.
#[derive(Clone, Copy)]
pub(crate) struct SpacePtr(*mut Space);

unsafe impl Send for SpacePtr {}
unsafe impl Sync for SpacePtr {}

impl SpacePtr {
    /// Shared view of the space for topology and task bookkeeping.
    pub(crate) unsafe fn space<'a>(self) -> &'a Space {
        &*self.0
    }

    pub(crate) unsafe fn cell_mut<'a>(self, cid: CellId) -> &'a mut Cell {
        &mut (&mut (*self.0).cells)[cid as usize]
    }

    /// The particle range of a cell, writable under the cell's tree-lock.
    pub(crate) unsafe fn parts_mut<'a>(self, cid: CellId) -> &'a mut [Part] {
        let cell = &(&(*self.0).cells)[cid as usize];
        self.parts_range_mut(cell.parts_offset, cell.count)
    }

    pub(crate) unsafe fn parts_range_mut<'a>(self, offset: usize, count: usize) -> &'a mut [Part] {
        debug_assert!(offset + count <= (*self.0).parts.len());
        std::slice::from_raw_parts_mut((*self.0).parts.as_mut_ptr().add(offset), count)
    }

    pub(crate) unsafe fn cparts<'a>(self, cid: CellId) -> &'a [CPart] {
        let space = &*self.0;
        let cell = &space.cells[cid as usize];
        &space.cparts[cell.parts_offset..cell.parts_offset + cell.count]
    }
}

fn worker(
    shared: SpacePtr,
    queue: &ReadyQueue,
    pending: &AtomicUsize,
    retries: &AtomicUsize,
    kernels: &impl SphKernels,
) {
    let space = unsafe { shared.space() };
    loop {
        if pending.load(Ordering::Acquire) == 0 {
            return;
        }
        let tid = match queue.pop() {
            Some(tid) => tid,
            None => {
                std::thread::yield_now();
                continue;
            }
        };
        let task = &space.tasks[tid];

        // take the tree-locks of the acting cells in id order; on any
        // contention hand the task back to the queue and move on
        let mut locked = 0;
        for &cell in &task.unlock_cells {
            if lock_tree(space, cell) {
                locked += 1;
            } else {
                break;
            }
        }
        if locked < task.unlock_cells.len() {
            for &cell in task.unlock_cells.iter().take(locked) {
                unlock_tree(space, cell);
            }
            retries.fetch_add(1, Ordering::Relaxed);
            queue.push(tid);
            std::thread::yield_now();
            continue;
        }

        interactions::execute(shared, tid, kernels);

        for &cell in &task.unlock_cells {
            unlock_tree(space, cell);
        }
        for &succ in &task.unlock_tasks {
            if space.tasks[succ].wait.fetch_sub(1, Ordering::AcqRel) == 1 {
                queue.push(succ);
            }
        }
        pending.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Try to lock a cell for an interaction: the cell's own spin lock plus a
/// hold on every ancestor, so no task can lock an enclosing cell while
/// this one runs.
fn lock_tree(space: &Space, cid: CellId) -> bool {
    let cell = &space.cells[cid as usize];
    if cell.hold.load(Ordering::Acquire) > 0 || !cell.lock.try_lock() {
        return false;
    }
    // a descendant task may have taken a hold between the two checks
    if cell.hold.load(Ordering::Acquire) > 0 {
        cell.lock.unlock();
        return false;
    }
    let mut finger = cell.parent;
    while let Some(up) = finger.value() {
        let ancestor = &space.cells[up as usize];
        if !ancestor.lock.try_lock() {
            // hit a locked ancestor, unwind the holds taken so far
            let mut finger2 = cell.parent;
            while finger2 != finger {
                let held = &space.cells[finger2.value().unwrap() as usize];
                held.hold.fetch_sub(1, Ordering::Release);
                finger2 = held.parent;
            }
            cell.lock.unlock();
            return false;
        }
        ancestor.hold.fetch_add(1, Ordering::AcqRel);
        ancestor.lock.unlock();
        finger = ancestor.parent;
    }
    true
}

fn unlock_tree(space: &Space, cid: CellId) {
    let cell = &space.cells[cid as usize];
    cell.lock.unlock();
    let mut finger = cell.parent;
    while let Some(up) = finger.value() {
        let ancestor = &space.cells[up as usize];
        ancestor.hold.fetch_sub(1, Ordering::Release);
        finger = ancestor.parent;
    }
}
