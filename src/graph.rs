//! A concurrent dag of fallible build actions.
//!
//! Planning inserts nodes with [`DepGraph::add_node`]; execution starts when
//! [`DepGraph::run_on`] posts every ready node to a worker pool. A node is
//! posted strictly after all of its dependencies finished. Finished nodes are
//! removed from the graph, so a node added later with an already-finished
//! dependency starts immediately.
//!
//! The first failing task terminates the graph: nodes that never started have
//! their futures resolved with [`BuildError::Terminated`], running tasks
//! finish but their results are discarded by [`FutureList::get`].

use crate::error::{BuildError, Result};
use std::{
    collections::HashMap,
    sync::{Arc, Condvar, Mutex},
};

/// A unit of work scheduled on the graph.
pub type Task = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

/// Identifies a node within its [`DepGraph`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum NodeState {
    Pending,
    Running,
}

struct NodeData {
    task: Option<Task>,
    /// Nodes waiting on this one.
    parents: Vec<NodeId>,
    /// Number of dependencies that have not finished yet.
    unmet: usize,
    state: NodeState,
    future: Arc<FutureSlot>,
}

#[derive(Default)]
struct State {
    nodes: HashMap<NodeId, NodeData>,
    pool: Option<Arc<rayon::ThreadPool>>,
    next_id: u64,
}

/// The shared task graph of one build invocation.
#[derive(Clone, Default)]
pub struct DepGraph {
    state: Arc<Mutex<State>>,
}

impl std::fmt::Debug for DepGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().expect("graph lock poisoned");
        f.debug_struct("DepGraph").field("nodes", &state.nodes.len()).finish()
    }
}

impl DepGraph {
    /// Inserts a pending node depending on the given nodes.
    ///
    /// Dependencies that already finished (and were therefore removed from
    /// the graph) are not counted; a node whose dependencies all finished is
    /// ready as soon as the pool runs.
    pub fn add_node(&self, task: Task, deps: impl IntoIterator<Item = NodeId>) -> NodeHandle {
        let mut state = self.state.lock().expect("graph lock poisoned");
        let id = NodeId(state.next_id);
        state.next_id += 1;

        let mut unmet = 0;
        for dep in deps {
            if let Some(dep_node) = state.nodes.get_mut(&dep) {
                dep_node.parents.push(id);
                unmet += 1;
            }
        }

        let future = Arc::new(FutureSlot::default());
        let node = NodeData {
            task: Some(task),
            parents: Vec::new(),
            unmet,
            state: NodeState::Pending,
            future: Arc::clone(&future),
        };
        state.nodes.insert(id, node);
        trace!(?id, unmet, "added node");

        NodeHandle { id, future: Some(TaskFuture { slot: future }) }
    }

    /// Posts every currently-ready node to the pool. Non-blocking.
    ///
    /// The pool is retained: nodes becoming ready later (through completion
    /// of their dependencies) are posted to it as well.
    pub fn run_on(&self, pool: &Arc<rayon::ThreadPool>) {
        let mut ready = Vec::new();
        {
            let mut state = self.state.lock().expect("graph lock poisoned");
            state.pool = Some(Arc::clone(pool));
            let ids: Vec<_> = state.nodes.keys().copied().collect();
            for id in ids {
                let node = state.nodes.get_mut(&id).expect("node exists");
                if node.state == NodeState::Pending && node.unmet == 0 {
                    node.state = NodeState::Running;
                    let task = node.task.take().expect("pending node owns its task");
                    ready.push(Ready { id, task, future: Arc::clone(&node.future) });
                }
            }
        }
        debug!(count = ready.len(), "posting ready nodes");
        for item in ready {
            self.post(pool, item);
        }
    }

    /// Clears the node list, detaches the pool and poisons the futures of
    /// every node that never started.
    pub fn terminate(&self) {
        let poisoned = {
            let mut state = self.state.lock().expect("graph lock poisoned");
            state.pool = None;
            let nodes = std::mem::take(&mut state.nodes);
            nodes
                .into_values()
                .filter(|node| node.task.is_some())
                .map(|node| node.future)
                .collect::<Vec<_>>()
        };
        debug!(count = poisoned.len(), "terminating graph");
        for future in poisoned {
            future.fulfill(Err(BuildError::Terminated));
        }
    }

    /// Number of nodes currently in the graph (pending or running).
    pub fn len(&self) -> usize {
        self.state.lock().expect("graph lock poisoned").nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn post(&self, pool: &Arc<rayon::ThreadPool>, item: Ready) {
        let graph = self.clone();
        pool.spawn(move || graph.execute(item));
    }

    /// Runs a node and walks the completion protocol, possibly executing a
    /// sole released successor inline on this worker.
    fn execute(&self, item: Ready) {
        let mut current = Some(item);
        while let Some(Ready { id, task, future }) = current.take() {
            let result = task();
            let failed = result.is_err();
            future.fulfill(result);

            if failed {
                self.terminate();
                return;
            }

            let mut released = Vec::new();
            let pool = {
                let mut state = self.state.lock().expect("graph lock poisoned");
                if let Some(node) = state.nodes.remove(&id) {
                    let pool_attached = state.pool.is_some();
                    for parent_id in node.parents {
                        let Some(parent) = state.nodes.get_mut(&parent_id) else { continue };
                        parent.unmet -= 1;
                        if parent.unmet == 0 && parent.state == NodeState::Pending && pool_attached
                        {
                            parent.state = NodeState::Running;
                            let task = parent.task.take().expect("pending node owns its task");
                            released.push(Ready {
                                id: parent_id,
                                task,
                                future: Arc::clone(&parent.future),
                            });
                        }
                    }
                }
                state.pool.clone()
            };

            match (released.len(), pool) {
                (0, _) | (_, None) => {}
                // a single released successor runs inline on this worker
                (1, Some(_)) => current = released.pop(),
                // multiple waiters are released in parallel
                (_, Some(pool)) => {
                    for item in released {
                        self.post(&pool, item);
                    }
                }
            }
        }
    }
}

struct Ready {
    id: NodeId,
    task: Task,
    future: Arc<FutureSlot>,
}

/// Handle to an inserted node, exposing its id for dependency wiring and its
/// one-shot completion future.
pub struct NodeHandle {
    id: NodeId,
    future: Option<TaskFuture>,
}

impl NodeHandle {
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Takes the completion future. Callable once.
    pub fn take_future(&mut self) -> TaskFuture {
        self.future.take().expect("future already taken")
    }
}

enum SlotState {
    Empty,
    Ready(Result<()>),
    Taken,
}

struct FutureSlot {
    state: Mutex<SlotState>,
    cv: Condvar,
}

impl Default for FutureSlot {
    fn default() -> Self {
        Self { state: Mutex::new(SlotState::Empty), cv: Condvar::new() }
    }
}

impl FutureSlot {
    /// First fulfillment wins; later ones are dropped. A running task that
    /// completes after its graph was terminated does not clobber anything.
    fn fulfill(&self, result: Result<()>) {
        let mut state = self.state.lock().expect("future lock poisoned");
        if matches!(*state, SlotState::Empty) {
            *state = SlotState::Ready(result);
            self.cv.notify_all();
        }
    }

    fn wait(&self) {
        let mut state = self.state.lock().expect("future lock poisoned");
        while matches!(*state, SlotState::Empty) {
            state = self.cv.wait(state).expect("future lock poisoned");
        }
    }

    fn take(&self) -> Result<()> {
        let mut state = self.state.lock().expect("future lock poisoned");
        loop {
            match std::mem::replace(&mut *state, SlotState::Taken) {
                SlotState::Empty => {
                    *state = SlotState::Empty;
                    state = self.cv.wait(state).expect("future lock poisoned");
                }
                SlotState::Ready(result) => return result,
                SlotState::Taken => return Err(BuildError::Terminated),
            }
        }
    }
}

/// One-shot completion future of a scheduler node.
pub struct TaskFuture {
    slot: Arc<FutureSlot>,
}

impl TaskFuture {
    /// Blocks until the node finished or was terminated.
    pub fn wait(&self) {
        self.slot.wait();
    }

    /// Blocks and returns the node's result.
    pub fn get(self) -> Result<()> {
        self.slot.take()
    }
}

/// The futures of all actions planned by one build call.
#[derive(Default)]
pub struct FutureList(Vec<TaskFuture>);

impl FutureList {
    pub fn push(&mut self, future: TaskFuture) {
        self.0.push(future);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Blocks until every planned action finished or was terminated.
    pub fn wait(&self) {
        for future in &self.0 {
            future.wait();
        }
    }

    /// Blocks and re-raises the first originating error.
    ///
    /// `Terminated` poison values only surface when no real error exists,
    /// which happens when the graph was terminated from the outside.
    pub fn get(self) -> Result<()> {
        let mut terminated = None;
        let mut first_error = None;
        for future in self.0 {
            match future.get() {
                Ok(()) => {}
                Err(err) if err.is_terminated() => {
                    terminated.get_or_insert(err);
                }
                Err(err) => {
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }
        match first_error.or(terminated) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Extend<TaskFuture> for FutureList {
    fn extend<T: IntoIterator<Item = TaskFuture>>(&mut self, iter: T) {
        self.0.extend(iter);
    }
}
