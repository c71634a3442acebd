use std::rc::Rc;

use tracing::debug;

use super::{verify, TaskError, TaskHandler, TaskId, TaskState, TaskTree};
use crate::client::Client;
use crate::jid::Jid;
use crate::xml::{Document, Element};

/// A task's view of the tree while one of its hooks runs.
///
/// All operations act on the task the context is bound to. The handler
/// itself is checked out for the duration of the hook, so
/// [`TaskTree::handler`] does not see it from here.
pub struct TaskContext<'a> {
    tree: &'a mut TaskTree,
    task: TaskId,
}

impl<'a> TaskContext<'a> {
    pub(super) fn new(tree: &'a mut TaskTree, task: TaskId) -> Self {
        Self { tree, task }
    }

    pub fn handle(&self) -> TaskId {
        self.task
    }

    /// Stanza id of the task.
    pub fn id(&self) -> &str {
        self.tree.task(self.task).map(TaskState::id).unwrap_or_default()
    }

    pub fn state(&self) -> Option<&TaskState> {
        self.tree.task(self.task)
    }

    pub fn tree(&mut self) -> &mut TaskTree {
        &mut *self.tree
    }

    pub fn client(&self) -> Option<Rc<dyn Client>> {
        self.tree.client()
    }

    /// Send `element` through the client. Dropped when the client is gone.
    pub fn send(&self, element: &Element) {
        match self.tree.client() {
            Some(client) => client.send(element),
            None => debug!(task = %self.id(), "client gone, dropping outbound stanza"),
        }
    }

    pub fn jid(&self) -> Jid {
        self.client().map(|c| c.jid()).unwrap_or_default()
    }

    pub fn host(&self) -> Jid {
        self.client().map(|c| c.host()).unwrap_or_default()
    }

    pub fn base_ns(&self) -> String {
        self.tree.base_ns()
    }

    /// Document outbound stanzas are built in.
    pub fn doc(&self) -> Option<Document> {
        self.client().map(|c| c.doc())
    }

    /// [`iq_verify`](super::iq_verify) against our own JID and server.
    pub fn iq_verify(&self, stanza: &Element, to: &Jid, id: &str, xmlns: &str) -> bool {
        let Some(client) = self.client() else {
            return false;
        };
        verify::iq_verify(stanza, to, id, xmlns, &client.jid(), &client.host())
    }

    pub fn set_success(&mut self, code: i32, text: &str) {
        self.tree.set_success(self.task, code, text);
    }

    pub fn set_error(&mut self, code: i32, text: &str) {
        self.tree.set_error(self.task, code, text);
    }

    pub fn set_error_from_element(&mut self, element: &Element) {
        self.tree.set_error_from_element(self.task, element);
    }

    /// Mark the task for deletion; it goes away once the hook returns.
    pub fn safe_delete(&mut self) {
        self.tree.safe_delete(self.task);
    }

    /// Fail with the disconnect status. Completion is deferred.
    pub fn fail_disconnected(&mut self) {
        self.tree.fail_disconnected(self.task);
    }

    /// Create a child task.
    pub fn spawn<H: TaskHandler>(&mut self, handler: H) -> Result<TaskId, TaskError> {
        self.tree.spawn(self.task, handler)
    }

    pub fn debug(&self, message: &str) {
        let kind = self.tree.kind(self.task);
        debug!(task = %self.id(), kind, "{}", message);
        if let Some(client) = self.client() {
            client.debug(&format!("{}: {}", kind, message));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::testing::MockClient;
    use crate::task::Claim;
    use pretty_assertions::assert_eq;

    #[derive(Default)]
    struct Chatty {
        child: Option<TaskId>,
    }

    struct Quiet;
    impl TaskHandler for Quiet {}

    impl TaskHandler for Chatty {
        fn on_go(&mut self, task: &mut TaskContext<'_>) {
            task.debug("sending");
            self.child = task.spawn(Quiet).ok();
            assert_eq!(task.jid().to_string(), "me@example.com/desk");
            assert_eq!(task.host().to_string(), "example.com");
            assert_eq!(task.base_ns(), "jabber:client");
        }

        fn take(&mut self, task: &mut TaskContext<'_>, _stanza: &Element) -> Claim {
            task.set_error(42, "nope");
            Claim::Claimed
        }
    }

    #[test]
    fn test_debug_is_prefixed_with_type_name() {
        let client = MockClient::new("me@example.com/desk", "example.com");
        let mut tree = TaskTree::new(&client);
        let task = tree.spawn(tree.root(), Chatty::default()).unwrap();
        tree.go(task, false).unwrap();

        assert_eq!(client.debug_lines(), vec!["Chatty: sending".to_string()]);
        let child = tree.handler::<Chatty>(task).unwrap().child.unwrap();
        assert_eq!(tree.parent(child), Some(task));
    }

    #[test]
    fn test_context_completion() {
        let client = MockClient::new("me@example.com/desk", "example.com");
        let mut tree = TaskTree::new(&client);
        let task = tree.spawn(tree.root(), Chatty::default()).unwrap();
        let stanza = Document::parse("<iq/>").unwrap();

        assert!(tree.dispatch(&stanza));
        let state = tree.task(task).unwrap();
        assert!(!state.success());
        assert_eq!(state.status_code(), 42);
        assert_eq!(state.status_string(), "nope");
    }
}
