//! Dependency-graph executor plus the two bounded worker pools that do the
//! actual Git I/O (§4.10 Scheduler).
//!
//! Nodes live in an arena (`Vec<Node>`) addressed by index rather than the
//! bidirectional owning references the original `dependency_node` class
//! used — matches §9's "arena of nodes with integer indices" note and avoids
//! a cyclic `Rc`/`Weak` graph. A node's actual work, if any, runs on one of
//! two `threadpool::ThreadPool`s; completion is reported back to the main
//! thread over an `mpsc` channel, mirroring `async_workitem`'s
//! future-with-completion-callback pattern.

use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, Sender};

use threadpool::ThreadPool;
use tracing::trace;

pub type NodeId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeState {
    Pending,
    Ready,
    Completed,
    Cancelled,
}

/// Which pool, if any, runs a node's work when it becomes unblocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pool {
    /// Cooperative: runs inline on the scheduler's driving thread.
    Main,
    /// Bounded `max(4, min(16, cores))` pool for `hash-object` calls.
    Hashing,
    /// Single-worker pool serialising `write-tree` on a branch's index file.
    WriteTree,
}

struct Node {
    depends_on: Vec<NodeId>,
    dependents: Vec<NodeId>,
    state: NodeState,
    pool: Pool,
    work: Option<Box<dyn FnOnce() + Send>>,
    callback: Option<Box<dyn FnOnce() + Send>>,
    on_cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Node {
    fn new(pool: Pool) -> Self {
        Node {
            depends_on: Vec::new(),
            dependents: Vec::new(),
            state: NodeState::Pending,
            pool,
            work: None,
            callback: None,
            on_cancel: None,
        }
    }

    fn blocked(&self) -> bool {
        !(self.state == NodeState::Ready || self.state == NodeState::Cancelled) || !self.depends_on.is_empty()
    }
}

/// Owns the dependency arena, the ready-to-run queue, and the two worker
/// pools. All graph mutation happens on whichever thread calls these
/// methods — per the resource model (§5) that is always the main thread.
pub struct Scheduler {
    nodes: Vec<Node>,
    queue: VecDeque<NodeId>,
    hashing: ThreadPool,
    write_tree: ThreadPool,
    tx: Sender<NodeId>,
    rx: Receiver<NodeId>,
    cancelled: bool,
}

impl Scheduler {
    pub fn new() -> Scheduler {
        let cores = num_cpus::get();
        let hashing_size = 4.max(16.min(cores));
        let (tx, rx) = mpsc::channel();
        Scheduler {
            nodes: Vec::new(),
            queue: VecDeque::new(),
            hashing: ThreadPool::new(hashing_size),
            write_tree: ThreadPool::new(1),
            tx,
            rx,
            cancelled: false,
        }
    }

    pub fn add_node(&mut self, pool: Pool) -> NodeId {
        self.nodes.push(Node::new(pool));
        self.nodes.len() - 1
    }

    pub fn set_work(&mut self, id: NodeId, work: impl FnOnce() + Send + 'static) {
        debug_assert_ne!(self.nodes[id].pool, Pool::Main, "Main-pool nodes run inline, not via set_work");
        self.nodes[id].work = Some(Box::new(work));
    }

    pub fn set_callback(&mut self, id: NodeId, cb: impl FnOnce() + Send + 'static) {
        self.nodes[id].callback = Some(Box::new(cb));
    }

    pub fn set_on_cancel(&mut self, id: NodeId, cb: impl FnOnce() + Send + 'static) {
        self.nodes[id].on_cancel = Some(Box::new(cb));
    }

    /// May not be called once `id` is completed. A dependency that's already
    /// completed is simply not recorded (mirrors `add_dependency`).
    pub fn add_dependency(&mut self, id: NodeId, dep: NodeId) {
        assert!(self.nodes[id].state != NodeState::Completed, "add_dependency on a completed node");
        if self.nodes[dep].state != NodeState::Completed {
            self.nodes[id].depends_on.push(dep);
            self.nodes[dep].dependents.push(id);
        }
    }

    /// Marks `id` runnable. If it has no outstanding dependencies it is
    /// dispatched immediately (inline for `Pool::Main`, or handed to a
    /// worker pool).
    pub fn ready(&mut self, id: NodeId) {
        if self.nodes[id].state != NodeState::Cancelled {
            self.nodes[id].state = NodeState::Ready;
        }
        if !self.nodes[id].blocked() {
            self.dispatch(id);
        }
    }

    pub fn cancel(&mut self, id: NodeId, force: bool) {
        if self.nodes[id].state == NodeState::Completed {
            return;
        }
        self.nodes[id].state = NodeState::Cancelled;
        if force || !self.nodes[id].blocked() {
            self.dispatch(id);
        }
    }

    /// Propagates a fatal error: every not-yet-completed node will be
    /// cancelled as it's reached, instead of completed, so no ref updates
    /// are ever submitted (§7).
    pub fn cancel_all(&mut self) {
        self.cancelled = true;
    }

    fn dependency_done(&mut self, id: NodeId, dep: NodeId) {
        self.nodes[id].depends_on.retain(|&d| d != dep);
        if !self.nodes[id].blocked() {
            self.dispatch(id);
        }
    }

    /// A cancelled node always goes straight to the completion queue (so
    /// `run` can call `do_cancel` on it) instead of to a worker pool.
    fn dispatch(&mut self, id: NodeId) {
        if self.nodes[id].state == NodeState::Cancelled {
            self.queue.push_back(id);
            return;
        }
        match self.nodes[id].pool {
            Pool::Main => self.queue.push_back(id),
            Pool::Hashing | Pool::WriteTree => {
                let work = self.nodes[id].work.take();
                let tx = self.tx.clone();
                let job = move || {
                    if let Some(work) = work {
                        work();
                    }
                    let _ = tx.send(id);
                };
                match self.nodes[id].pool {
                    Pool::Hashing => self.hashing.execute(job),
                    Pool::WriteTree => self.write_tree.execute(job),
                    Pool::Main => unreachable!(),
                }
            }
        }
    }

    fn complete(&mut self, id: NodeId) {
        if let Some(cb) = self.nodes[id].callback.take() {
            cb();
        }
        self.nodes[id].state = NodeState::Completed;
        let dependents = std::mem::take(&mut self.nodes[id].dependents);
        for dep in dependents {
            self.dependency_done(dep, id);
        }
    }

    fn do_cancel(&mut self, id: NodeId) {
        let depends_on = std::mem::take(&mut self.nodes[id].depends_on);
        for dep in depends_on {
            self.nodes[dep].dependents.retain(|&d| d != id);
        }
        let dependents = std::mem::take(&mut self.nodes[id].dependents);
        for dep in dependents {
            self.nodes[dep].depends_on.retain(|&d| d != id);
            self.cancel(dep, false);
        }
        if let Some(cb) = self.nodes[id].on_cancel.take() {
            cb();
        }
    }

    /// Moves any worker-pool results that have arrived since the last call
    /// onto the ready queue. `block` waits for at least one if the queue is
    /// currently empty; returns the number of results absorbed.
    pub fn poll_async(&mut self, block: bool) -> usize {
        let mut moved = 0;
        if block && self.queue.is_empty() {
            if let Ok(id) = self.rx.recv() {
                self.queue.push_back(id);
                moved += 1;
            }
        }
        while let Ok(id) = self.rx.try_recv() {
            self.queue.push_back(id);
            moved += 1;
        }
        moved
    }

    /// Drains the ready queue, completing or cancelling each node in turn.
    /// Returns `false` if there was nothing to do.
    pub fn run(&mut self) -> bool {
        if self.queue.is_empty() {
            return false;
        }
        while !self.queue.is_empty() {
            let to_execute: Vec<NodeId> = self.queue.drain(..).collect();
            for id in to_execute {
                if self.nodes[id].state == NodeState::Cancelled {
                    trace!(node = id, "cancelling node");
                    self.do_cancel(id);
                } else if self.cancelled {
                    self.cancel(id, false);
                } else {
                    self.complete(id);
                }
            }
        }
        true
    }

    /// Runs to quiescence: alternates draining the ready queue and blocking
    /// for the next async completion, until both are empty and no worker
    /// pool has outstanding jobs.
    pub fn run_to_completion(&mut self) {
        loop {
            self.run();
            if self.hashing.active_count() == 0 && self.write_tree.active_count() == 0 && self.queue.is_empty() {
                break;
            }
            self.poll_async(true);
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Scheduler::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_independent_nodes_both_complete() {
        let mut s = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let a = s.add_node(Pool::Main);
        let b = s.add_node(Pool::Main);
        let c1 = Arc::clone(&counter);
        let c2 = Arc::clone(&counter);
        s.set_callback(a, move || { c1.fetch_add(1, Ordering::SeqCst); });
        s.set_callback(b, move || { c2.fetch_add(1, Ordering::SeqCst); });
        s.ready(a);
        s.ready(b);
        s.run();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_dependent_runs_after_dependency_completes() {
        let mut s = Scheduler::new();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let a = s.add_node(Pool::Main);
        let b = s.add_node(Pool::Main);
        s.add_dependency(b, a);
        let o1 = Arc::clone(&order);
        let o2 = Arc::clone(&order);
        s.set_callback(a, move || o1.lock().unwrap().push("a"));
        s.set_callback(b, move || o2.lock().unwrap().push("b"));
        s.ready(b);
        s.ready(a);
        s.run();
        assert_eq!(*order.lock().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_cancel_propagates_to_dependents() {
        let mut s = Scheduler::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let a = s.add_node(Pool::Main);
        let b = s.add_node(Pool::Main);
        s.add_dependency(b, a);
        let r = Arc::clone(&ran);
        s.set_callback(b, move || { r.fetch_add(1, Ordering::SeqCst); });
        s.ready(b);
        s.cancel(a, true);
        s.run();
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_force_cancel_detaches_from_dependencies() {
        let mut s = Scheduler::new();
        let cancelled_ran = Arc::new(AtomicUsize::new(0));
        let a = s.add_node(Pool::Main); // never made ready
        let b = s.add_node(Pool::Main);
        s.add_dependency(b, a);
        let r = Arc::clone(&cancelled_ran);
        s.set_on_cancel(b, move || { r.fetch_add(1, Ordering::SeqCst); });
        s.cancel(b, true);
        s.run();
        assert_eq!(cancelled_ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_hashing_pool_job_completes_via_channel() {
        let mut s = Scheduler::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let h = s.add_node(Pool::Hashing);
        let r1 = Arc::clone(&ran);
        s.set_work(h, move || { r1.fetch_add(1, Ordering::SeqCst); });
        let r2 = Arc::clone(&ran);
        s.set_callback(h, move || { r2.fetch_add(10, Ordering::SeqCst); });
        s.ready(h);
        s.poll_async(true);
        s.run();
        assert_eq!(ran.load(Ordering::SeqCst), 11);
    }
}
