//! Request tracking: a tree of tasks that each send at most one request and
//! claim the reply correlated to it.
//!
//! The [`TaskTree`] owns every task. Inbound stanzas are offered to the tree
//! with [`TaskTree::dispatch`]; the walk goes depth-first in creation order
//! and stops at the first [`TaskHandler`] that claims the stanza. A task
//! completes exactly once, notifies its listeners, and is destroyed once it
//! is safe to do so (never while its own notification is running).
//!
//! Everything runs on one thread. Work that must not happen in the middle
//! of a broadcast (completion after a disconnect, deletion of a task whose
//! `go()` failed) is queued and run by [`TaskTree::run_deferred`], which the
//! owning scheduler calls once the current event has been handled.

mod context;
mod iq;
mod tree;
mod verify;

#[cfg(test)]
pub(crate) mod testing;

pub use context::TaskContext;
pub use iq::{IqRequest, IqType};
pub use tree::TaskTree;
pub use verify::{iq_verify, query_ns};

use std::any::Any;

use thiserror::Error;

use crate::stanza::{ErrorCondition, ErrorType, StanzaError};
use crate::xml::Element;

/// Status code of a task failed by a dropped connection.
pub const ERR_DISCONNECTED: i32 = 0;

/// Status string of a task failed by a dropped connection.
pub const DISCONNECTED_TEXT: &str = "Disconnected";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("no such task")]
    NoSuchTask,

    #[error("client is gone")]
    ClientGone,

    #[error("attempted to send a task over a broken connection")]
    BrokenConnection,

    #[error("task was already sent")]
    AlreadySent,
}

/// Stable handle to a task in a [`TaskTree`]. Handles of destroyed tasks
/// never resolve again, even after their slot is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId {
    index: u32,
    generation: u32,
}

/// Outcome of offering a stanza to a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// The stanza was this task's reply; stop the walk.
    Claimed,
    /// Not for this task; keep offering it.
    NotMine,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPhase {
    /// Created, not sent yet.
    Pending,
    /// `go()` ran the send hook; awaiting a reply.
    Sent,
    /// Completed, successfully or not.
    Done,
}

/// Behaviour of a concrete task type.
///
/// Every hook receives a [`TaskContext`] bound to the task being driven.
/// Completion requested from a hook (`set_success`, `set_error`, …) is
/// recorded at once and its notification delivered as soon as the hook
/// returns.
pub trait TaskHandler: Any {
    /// Build and send the request. Runs once per task, from `go()`.
    fn on_go(&mut self, _task: &mut TaskContext<'_>) {}

    /// Inspect an inbound stanza. A handler claiming it is expected to have
    /// completed the task before returning [`Claim::Claimed`].
    fn take(&mut self, _task: &mut TaskContext<'_>, _stanza: &Element) -> Claim {
        Claim::NotMine
    }

    /// The connection dropped before the task completed.
    fn on_disconnect(&mut self, task: &mut TaskContext<'_>) {
        task.fail_disconnected();
    }
}

/// Handler of the root task: claims nothing and only fans stanzas out.
#[derive(Debug, Default)]
pub struct RootTask;

impl TaskHandler for RootTask {}

/// Observable state of one task.
#[derive(Debug, Clone, Default)]
pub struct TaskState {
    id: String,
    success: bool,
    status_code: i32,
    status_string: String,
    error: Option<StanzaError>,
    sent: bool,
    done: bool,
    deleteme: bool,
    auto_delete: bool,
    insig: bool,
}

impl TaskState {
    fn new(id: String) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    /// Stanza id used for the request.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn success(&self) -> bool {
        self.success
    }

    pub fn status_code(&self) -> i32 {
        self.status_code
    }

    pub fn status_string(&self) -> &str {
        &self.status_string
    }

    /// Error decoded from an error reply.
    pub fn error(&self) -> Option<&StanzaError> {
        self.error.as_ref()
    }

    pub fn error_type(&self) -> Option<ErrorType> {
        self.error.as_ref().map(|e| e.error_type)
    }

    pub fn error_condition(&self) -> Option<ErrorCondition> {
        self.error.as_ref().map(|e| e.condition)
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Destruction has been requested and will happen once it is safe.
    pub fn is_marked_for_deletion(&self) -> bool {
        self.deleteme
    }

    pub fn auto_delete(&self) -> bool {
        self.auto_delete
    }

    /// The completion notification is being delivered right now.
    pub fn in_notification(&self) -> bool {
        self.insig
    }

    pub fn phase(&self) -> TaskPhase {
        if self.done {
            TaskPhase::Done
        } else if self.sent {
            TaskPhase::Sent
        } else {
            TaskPhase::Pending
        }
    }
}
