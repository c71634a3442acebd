use std::any::Any;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

use tracing::{debug, trace, warn};

use super::{
    Claim, RootTask, TaskContext, TaskError, TaskHandler, TaskId, TaskState, DISCONNECTED_TEXT,
    ERR_DISCONNECTED,
};
use crate::client::Client;
use crate::stanza::{StanzaError, NS_CLIENT};
use crate::xml::Element;

type FinishedFn = Box<dyn FnMut(&mut TaskTree, TaskId)>;

/// Work that must wait until the current event has been fully handled.
#[derive(Debug, Clone, Copy)]
enum Deferred {
    /// Run the completion transition of a task failed by a disconnect.
    Complete(TaskId),
    /// Destroy a task marked for deletion.
    Destroy(TaskId),
}

struct TaskNode {
    parent: Option<TaskId>,
    children: Vec<TaskId>,
    state: TaskState,
    kind: &'static str,
    /// Checked out while one of its hooks runs.
    handler: Option<Box<dyn TaskHandler>>,
    listeners: Vec<FinishedFn>,
    in_hook: bool,
    /// Completion requested from inside a hook; delivered when it returns.
    completion_pending: bool,
    /// A `Deferred::Complete` for this task sits in the queue.
    completion_queued: bool,
}

impl TaskNode {
    /// Pinned tasks are never freed; destruction waits for them.
    fn pinned(&self) -> bool {
        self.state.insig || self.in_hook || self.completion_queued
    }
}

struct Slot {
    generation: u32,
    node: Option<TaskNode>,
}

fn short_type_name<H>() -> &'static str {
    let full = std::any::type_name::<H>();
    full.rsplit("::").next().unwrap_or(full)
}

/// Owner of every task of one session.
///
/// Tasks live in an arena addressed by [`TaskId`]. A parent owns its
/// children: destroying a task destroys its whole subtree. The tree keeps
/// only a weak reference to its [`Client`].
pub struct TaskTree {
    client: Weak<dyn Client>,
    slots: Vec<Slot>,
    free: Vec<u32>,
    root: TaskId,
    deferred: VecDeque<Deferred>,
}

impl TaskTree {
    /// Tree whose root only fans stanzas out to its children.
    pub fn new<C: Client + 'static>(client: &Rc<C>) -> Self {
        Self::with_root(client, RootTask)
    }

    /// Tree with a custom root handler, offered every stanza first.
    pub fn with_root<C: Client + 'static, H: TaskHandler>(client: &Rc<C>, root: H) -> Self {
        let client: Rc<dyn Client> = client.clone();
        let mut tree = Self {
            client: Rc::downgrade(&client),
            slots: Vec::new(),
            free: Vec::new(),
            root: TaskId {
                index: 0,
                generation: 0,
            },
            deferred: VecDeque::new(),
        };
        tree.root = tree.insert(None, String::new(), Box::new(root), short_type_name::<H>());
        tree
    }

    pub fn root(&self) -> TaskId {
        self.root
    }

    pub fn client(&self) -> Option<Rc<dyn Client>> {
        self.client.upgrade()
    }

    pub(super) fn base_ns(&self) -> String {
        self.client
            .upgrade()
            .map(|c| c.stream_base_ns())
            .unwrap_or_else(|| NS_CLIENT.to_string())
    }

    fn node(&self, task: TaskId) -> Option<&TaskNode> {
        let slot = self.slots.get(task.index as usize)?;
        if slot.generation != task.generation {
            return None;
        }
        slot.node.as_ref()
    }

    fn node_mut(&mut self, task: TaskId) -> Option<&mut TaskNode> {
        let slot = self.slots.get_mut(task.index as usize)?;
        if slot.generation != task.generation {
            return None;
        }
        slot.node.as_mut()
    }

    fn insert(
        &mut self,
        parent: Option<TaskId>,
        id: String,
        handler: Box<dyn TaskHandler>,
        kind: &'static str,
    ) -> TaskId {
        let node = TaskNode {
            parent,
            children: Vec::new(),
            state: TaskState::new(id),
            kind,
            handler: Some(handler),
            listeners: Vec::new(),
            in_hook: false,
            completion_pending: false,
            completion_queued: false,
        };

        let task = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.node = Some(node);
                TaskId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    node: Some(node),
                });
                TaskId {
                    index: (self.slots.len() - 1) as u32,
                    generation: 0,
                }
            }
        };

        if let Some(parent) = parent.and_then(|p| self.node_mut(p)) {
            parent.children.push(task);
        }
        task
    }

    fn release(&mut self, task: TaskId) {
        if let Some(slot) = self.slots.get_mut(task.index as usize) {
            if slot.generation == task.generation && slot.node.take().is_some() {
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(task.index);
            }
        }
    }

    /// Whether `task` is still alive.
    pub fn contains(&self, task: TaskId) -> bool {
        self.node(task).is_some()
    }

    /// Number of live tasks, root included.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.node.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Short type name of the task's handler.
    pub(super) fn kind(&self, task: TaskId) -> &'static str {
        self.node(task).map(|n| n.kind).unwrap_or("Task")
    }

    pub fn task(&self, task: TaskId) -> Option<&TaskState> {
        self.node(task).map(|n| &n.state)
    }

    pub fn parent(&self, task: TaskId) -> Option<TaskId> {
        self.node(task)?.parent.filter(|&p| self.contains(p))
    }

    /// Live children in creation order.
    pub fn children(&self, task: TaskId) -> Vec<TaskId> {
        self.node(task)
            .map(|n| {
                n.children
                    .iter()
                    .copied()
                    .filter(|&c| self.contains(c))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Concrete handler of `task`, if it is an `H`. Not available while one
    /// of the task's own hooks runs.
    pub fn handler<H: TaskHandler>(&self, task: TaskId) -> Option<&H> {
        let handler: &dyn Any = self.node(task)?.handler.as_deref()?;
        handler.downcast_ref::<H>()
    }

    pub fn handler_mut<H: TaskHandler>(&mut self, task: TaskId) -> Option<&mut H> {
        let handler: &mut dyn Any = self.node_mut(task)?.handler.as_deref_mut()?;
        handler.downcast_mut::<H>()
    }

    /// Create a task under `parent` with an id from the client.
    pub fn spawn<H: TaskHandler>(&mut self, parent: TaskId, handler: H) -> Result<TaskId, TaskError> {
        let client = self.client.upgrade().ok_or(TaskError::ClientGone)?;
        if !self.contains(parent) {
            return Err(TaskError::NoSuchTask);
        }
        let id = client.gen_unique_id();
        self.spawn_with_id(parent, id, handler)
    }

    /// Create a task under `parent` with a caller-supplied id.
    pub fn spawn_with_id<H: TaskHandler>(
        &mut self,
        parent: TaskId,
        id: impl Into<String>,
        handler: H,
    ) -> Result<TaskId, TaskError> {
        if !self.contains(parent) {
            return Err(TaskError::NoSuchTask);
        }
        let kind = short_type_name::<H>();
        let task = self.insert(Some(parent), id.into(), Box::new(handler), kind);
        trace!(task = ?task, kind, "task created");
        Ok(task)
    }

    /// Register a completion listener. Listeners run once, in registration
    /// order, with the tree available for follow-up work.
    pub fn on_finished<F>(&mut self, task: TaskId, listener: F) -> Result<(), TaskError>
    where
        F: FnMut(&mut TaskTree, TaskId) + 'static,
    {
        let node = self.node_mut(task).ok_or(TaskError::NoSuchTask)?;
        node.listeners.push(Box::new(listener));
        Ok(())
    }

    /// Send the task's request.
    ///
    /// On a broken connection the task stays pending and
    /// [`TaskError::BrokenConnection`] is returned; with `auto_delete` it is
    /// also destroyed on the next [`run_deferred`](Self::run_deferred).
    pub fn go(&mut self, task: TaskId, auto_delete: bool) -> Result<(), TaskError> {
        let usable = self.client.upgrade().is_some_and(|c| c.is_connected());

        let node = self.node_mut(task).ok_or(TaskError::NoSuchTask)?;
        if node.state.sent || node.state.done {
            return Err(TaskError::AlreadySent);
        }
        node.state.auto_delete = auto_delete;

        if !usable {
            warn!(task = %node.state.id, kind = node.kind, "attempted to send a task over the broken connection");
            if auto_delete && !node.state.deleteme {
                node.state.deleteme = true;
                self.deferred.push_back(Deferred::Destroy(task));
            }
            return Err(TaskError::BrokenConnection);
        }

        node.state.sent = true;
        self.with_handler(task, |handler, ctx| handler.on_go(ctx));
        Ok(())
    }

    /// Offer `stanza` to the whole tree. Returns whether a task claimed it.
    pub fn dispatch(&mut self, stanza: &Element) -> bool {
        let root = self.root;
        let claimed = self.take(root, stanza);
        if !claimed {
            debug!(stanza = %stanza.name(), id = ?stanza.attribute("id"), "stanza not claimed by any task");
        }
        claimed
    }

    /// Offer `stanza` to `task` and then to its subtree, depth-first in
    /// creation order, stopping at the first claim. A task that is already
    /// done is skipped, but its children are still offered the stanza.
    /// Tasks marked for deletion are skipped together with their subtree.
    pub fn take(&mut self, task: TaskId, stanza: &Element) -> bool {
        let Some(node) = self.node(task) else {
            return false;
        };
        if node.state.deleteme {
            return false;
        }

        if !node.state.done {
            let claim = self.with_handler(task, |handler, ctx| handler.take(ctx, stanza));
            if claim == Some(Claim::Claimed) {
                trace!(task = ?task, "stanza claimed");
                return true;
            }
        }

        let children = match self.node(task) {
            Some(node) => node.children.clone(),
            None => return false,
        };
        children.into_iter().any(|child| self.take(child, stanza))
    }

    pub fn set_success(&mut self, task: TaskId, code: i32, text: &str) {
        let Some(node) = self.node_mut(task) else {
            return;
        };
        if node.state.done || node.completion_pending {
            return;
        }
        node.state.success = true;
        node.state.status_code = code;
        node.state.status_string = text.to_string();
        self.done(task);
    }

    pub fn set_error(&mut self, task: TaskId, code: i32, text: &str) {
        let Some(node) = self.node_mut(task) else {
            return;
        };
        if node.state.done || node.completion_pending {
            return;
        }
        node.state.success = false;
        node.state.status_code = code;
        node.state.status_string = text.to_string();
        self.done(task);
    }

    /// Fail the task from an error reply. An `<error/>` child is decoded
    /// into the task's [`StanzaError`] and status; without one the status
    /// is left as it was.
    pub fn set_error_from_element(&mut self, task: TaskId, element: &Element) {
        let base_ns = self.base_ns();
        let Some(node) = self.node_mut(task) else {
            return;
        };
        if node.state.done || node.completion_pending {
            return;
        }
        node.state.success = false;
        if let Some(tag) = element.first_child("error") {
            let mut err = StanzaError::default();
            if !err.from_xml(&tag, &base_ns) {
                warn!(task = %node.state.id, "malformed error element in reply");
            }
            node.state.status_code = i32::from(err.code());
            node.state.status_string = err.status_string();
            node.state.error = Some(err);
        }
        self.done(task);
    }

    /// Fail the task because the connection dropped. The completion itself
    /// is queued so a disconnect fanning out to many tasks never tears the
    /// tree down while it is still being delivered.
    pub(super) fn fail_disconnected(&mut self, task: TaskId) {
        let Some(node) = self.node_mut(task) else {
            return;
        };
        if node.state.done || node.completion_pending {
            return;
        }
        node.state.success = false;
        node.state.status_code = ERR_DISCONNECTED;
        node.state.status_string = DISCONNECTED_TEXT.to_string();
        if node.completion_queued {
            return;
        }
        node.completion_queued = true;
        self.deferred.push_back(Deferred::Complete(task));
    }

    /// Completion transition: runs at most once per task.
    fn done(&mut self, task: TaskId) {
        let Some(node) = self.node_mut(task) else {
            return;
        };
        node.completion_queued = false;
        if node.state.done || node.state.insig {
            return;
        }
        if node.in_hook {
            node.completion_pending = true;
            return;
        }
        node.completion_pending = false;
        node.state.done = true;
        if node.state.auto_delete {
            node.state.deleteme = true;
        }
        debug!(
            task = %node.state.id,
            kind = node.kind,
            success = node.state.success,
            code = node.state.status_code,
            "task finished"
        );

        node.state.insig = true;
        let mut listeners = std::mem::take(&mut node.listeners);
        for listener in listeners.iter_mut() {
            listener(self, task);
        }
        drop(listeners);

        let Some(node) = self.node_mut(task) else {
            return;
        };
        node.state.insig = false;
        if node.state.deleteme {
            self.destroy(task);
        }
    }

    /// Run `f` with the task's handler checked out of the arena.
    fn with_handler<R>(
        &mut self,
        task: TaskId,
        f: impl FnOnce(&mut dyn TaskHandler, &mut TaskContext<'_>) -> R,
    ) -> Option<R> {
        let node = self.node_mut(task)?;
        if node.in_hook {
            return None;
        }
        let mut handler = node.handler.take()?;
        node.in_hook = true;

        let result = f(handler.as_mut(), &mut TaskContext::new(self, task));

        if let Some(node) = self.node_mut(task) {
            node.handler = Some(handler);
            node.in_hook = false;
            if node.completion_pending {
                self.done(task);
            } else {
                self.settle(task);
            }
        }
        Some(result)
    }

    /// Destroy `task` as soon as it is safe. Idempotent. A pinned task
    /// (notifying, running a hook or waiting for a queued completion) is
    /// detached from its parent and marked; it goes away right after that
    /// work finishes.
    pub fn safe_delete(&mut self, task: TaskId) {
        let Some(node) = self.node_mut(task) else {
            return;
        };
        if node.state.deleteme {
            return;
        }
        node.state.deleteme = true;
        if node.pinned() {
            trace!(task = %node.state.id, "deletion deferred");
            self.detach(task);
            return;
        }
        self.destroy(task);
    }

    fn detach(&mut self, task: TaskId) {
        let Some(parent) = self.node_mut(task).and_then(|n| n.parent.take()) else {
            return;
        };
        if let Some(parent) = self.node_mut(parent) {
            parent.children.retain(|&c| c != task);
        }
    }

    fn settle(&mut self, task: TaskId) {
        if let Some(node) = self.node(task) {
            if node.state.deleteme && !node.pinned() {
                self.destroy(task);
            }
        }
    }

    /// Free `task` and its subtree. Pinned tasks inside the subtree are
    /// detached and marked instead, so no dispatch can reach them.
    fn destroy(&mut self, task: TaskId) {
        if !self.contains(task) {
            return;
        }
        self.detach(task);

        let mut freed = 0usize;
        let mut stack = vec![task];
        while let Some(current) = stack.pop() {
            let Some(node) = self.node_mut(current) else {
                continue;
            };
            stack.append(&mut node.children);
            if node.pinned() {
                node.parent = None;
                node.state.deleteme = true;
                continue;
            }
            self.release(current);
            freed += 1;
        }
        trace!(task = ?task, freed, "task subtree destroyed");
    }

    /// Notify every live task below the root that the connection dropped.
    /// Completions are queued; call [`run_deferred`](Self::run_deferred)
    /// once the notification has been handled.
    pub fn client_disconnected(&mut self) {
        let tasks = self.descendants(self.root);
        debug!(count = tasks.len(), "connection lost, failing pending tasks");
        for task in tasks {
            self.with_handler(task, |handler, ctx| handler.on_disconnect(ctx));
        }
    }

    fn descendants(&self, task: TaskId) -> Vec<TaskId> {
        let mut out = Vec::new();
        let mut stack: Vec<TaskId> = self.children(task).into_iter().rev().collect();
        while let Some(current) = stack.pop() {
            out.push(current);
            stack.extend(self.children(current).into_iter().rev());
        }
        out
    }

    pub fn has_deferred(&self) -> bool {
        !self.deferred.is_empty()
    }

    /// Drain the deferred-work queue, including work queued while draining.
    /// Returns how many items ran.
    pub fn run_deferred(&mut self) -> usize {
        let mut ran = 0;
        while let Some(work) = self.deferred.pop_front() {
            ran += 1;
            let task = match work {
                Deferred::Complete(task) => {
                    self.done(task);
                    task
                }
                Deferred::Destroy(task) => task,
            };
            self.settle(task);
        }
        ran
    }
}
