//! Offline session driving a [`TaskTree`] from a recorded inbound stream.
//!
//! The [`ReplayClient`] stands in for a live connection: it hands out stanza
//! ids and records what the tasks send. [`Session::feed`] cuts inbound
//! bytes into frames, dispatches every stanza to the tree and runs deferred
//! work after each one, the way a live event loop would.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::client::Client;
use crate::config::{QuerySpec, ReplayConfig};
use crate::jid::Jid;
use crate::task::{IqRequest, TaskError, TaskId, TaskTree};
use crate::xml::{Document, Element, Frame, Framer, XmlError};

const ID_SEED_START: u32 = 0xaaaa;
const ID_SEED_STEP: u32 = 0x10;

/// Client side of a replayed session.
pub struct ReplayClient {
    jid: Jid,
    host: Jid,
    base_ns: String,
    doc: Document,
    id_seed: Cell<u32>,
    connected: Cell<bool>,
    sent: RefCell<Vec<String>>,
}

impl ReplayClient {
    pub fn new(jid: Jid, host: Jid, base_ns: &str) -> Rc<Self> {
        Rc::new(Self {
            jid,
            host,
            base_ns: base_ns.to_string(),
            doc: Document::new(),
            id_seed: Cell::new(ID_SEED_START),
            connected: Cell::new(true),
            sent: RefCell::default(),
        })
    }

    /// Outbound stanzas in send order.
    pub fn sent(&self) -> Vec<String> {
        self.sent.borrow().clone()
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.set(connected);
    }
}

impl Client for ReplayClient {
    fn gen_unique_id(&self) -> String {
        let seed = self.id_seed.get();
        self.id_seed.set(seed.wrapping_add(ID_SEED_STEP));
        format!("a{:x}", seed)
    }

    fn send(&self, element: &Element) {
        let xml = element.to_xml_in_scope(&self.base_ns);
        debug!(stanza = %xml, "send");
        self.sent.borrow_mut().push(xml);
    }

    fn jid(&self) -> Jid {
        self.jid.clone()
    }

    fn host(&self) -> Jid {
        self.host.clone()
    }

    fn stream_base_ns(&self) -> String {
        self.base_ns.clone()
    }

    fn doc(&self) -> Document {
        self.doc.clone()
    }

    fn is_connected(&self) -> bool {
        self.connected.get()
    }

    fn debug(&self, message: &str) {
        debug!("{}", message);
    }
}

/// Outcome of one finished request, printed as a JSON line.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskReport {
    pub id: String,
    pub to: String,
    #[serde(rename = "type")]
    pub iq_type: String,
    pub xmlns: String,
    pub success: bool,
    pub status_code: i32,
    pub status_string: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_condition: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
}

pub struct Session {
    client: Rc<ReplayClient>,
    tree: TaskTree,
    requests: Vec<TaskId>,
    reports: Rc<RefCell<Vec<TaskReport>>>,
    framer: Framer,
    closed: bool,
}

impl Session {
    pub fn new(config: &ReplayConfig) -> Self {
        let client = ReplayClient::new(config.jid.clone(), config.server.clone(), &config.base_ns);
        let tree = TaskTree::new(&client);
        Self {
            client,
            tree,
            requests: Vec::new(),
            reports: Rc::default(),
            framer: Framer::new(),
            closed: false,
        }
    }

    pub fn client(&self) -> &Rc<ReplayClient> {
        &self.client
    }

    pub fn tree(&self) -> &TaskTree {
        &self.tree
    }

    /// Issue a request. It reports itself once finished and is then deleted.
    pub fn request(&mut self, spec: &QuerySpec) -> Result<TaskId, TaskError> {
        let handler = IqRequest::new(spec.to.clone(), spec.iq_type, spec.xmlns.clone());
        let task = self.tree.spawn(self.tree.root(), handler)?;

        let reports = self.reports.clone();
        let base_ns = self.client.stream_base_ns();
        self.tree.on_finished(task, move |tree, task| {
            let (Some(state), Some(request)) = (tree.task(task), tree.handler::<IqRequest>(task)) else {
                return;
            };
            reports.borrow_mut().push(TaskReport {
                id: state.id().to_string(),
                to: request.to().to_string(),
                iq_type: request.iq_type().to_string(),
                xmlns: request.xmlns().to_string(),
                success: state.success(),
                status_code: state.status_code(),
                status_string: state.status_string().to_string(),
                error_type: state.error_type().map(|t| t.as_str().to_string()),
                error_condition: state.error_condition().map(|c| c.as_str().to_string()),
                response: request.response().map(|r| r.to_xml_in_scope(&base_ns)),
            });
        })?;

        self.requests.push(task);
        if let Err(e) = self.tree.go(task, true) {
            self.tree.run_deferred();
            return Err(e);
        }
        self.tree.run_deferred();
        Ok(task)
    }

    /// Feed inbound bytes. Returns how many stanzas were dispatched.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<usize, XmlError> {
        self.framer.push(bytes);
        let mut dispatched = 0;

        while !self.closed {
            let Some(frame) = self.framer.next_frame() else {
                break;
            };

            match frame {
                Frame::StreamOpen(header) => {
                    debug!(from = %header.from, id = %header.id, version = %header.version, "stream opened");
                    if !header.default_ns.is_empty() && header.default_ns != self.client.base_ns {
                        warn!(
                            stream = %header.default_ns,
                            configured = %self.client.base_ns,
                            "stream namespace differs from the configured one"
                        );
                    }
                }
                Frame::StreamClose => {
                    info!("stream closed by peer");
                    self.disconnect();
                }
                Frame::StreamError { condition, xml } => {
                    warn!(condition = %condition, stanza = %xml, "stream error");
                    self.disconnect();
                }
                Frame::Features(xml) => debug!(features = %xml, "stream features"),
                Frame::StreamElement(xml) => {
                    debug!(element = %xml, "skipping stream-level element");
                }
                Frame::Stanza(xml) => {
                    debug!(stanza = %xml, "recv");
                    let element = Document::parse_with_default_ns(&xml, &self.client.base_ns)?;
                    self.tree.dispatch(&element);
                    self.tree.run_deferred();
                    dispatched += 1;
                }
            }
        }
        Ok(dispatched)
    }

    /// The connection dropped: fail every request still waiting.
    pub fn disconnect(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if self.framer.has_partial() {
            warn!("discarding incomplete inbound data");
        }
        self.framer.clear();
        self.client.set_connected(false);
        self.tree.client_disconnected();
        self.tree.run_deferred();
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Requests issued so far that have not finished.
    pub fn pending(&self) -> usize {
        self.requests
            .iter()
            .filter(|&&task| self.tree.task(task).is_some_and(|s| !s.is_done()))
            .count()
    }

    /// Reports of finished requests, in completion order.
    pub fn reports(&self) -> Vec<TaskReport> {
        self.reports.borrow().clone()
    }

    /// Whether every issued request finished successfully.
    pub fn all_succeeded(&self) -> bool {
        let reports = self.reports.borrow();
        reports.len() == self.requests.len() && reports.iter().all(|r| r.success)
    }
}
