use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::client::Client;
use crate::jid::Jid;
use crate::stanza::NS_CLIENT;
use crate::xml::{Document, Element};

/// In-memory client recording everything the tasks send.
pub(crate) struct MockClient {
    jid: Jid,
    host: Jid,
    doc: Document,
    next_id: Cell<u32>,
    connected: Cell<bool>,
    sent: RefCell<Vec<String>>,
    debug_lines: RefCell<Vec<String>>,
}

impl MockClient {
    pub(crate) fn new(jid: &str, host: &str) -> Rc<Self> {
        Rc::new(Self {
            jid: Jid::new(jid),
            host: Jid::new(host),
            doc: Document::new(),
            next_id: Cell::new(0),
            connected: Cell::new(true),
            sent: RefCell::default(),
            debug_lines: RefCell::default(),
        })
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.connected.set(connected);
    }

    pub(crate) fn sent(&self) -> Vec<String> {
        self.sent.borrow().clone()
    }

    pub(crate) fn debug_lines(&self) -> Vec<String> {
        self.debug_lines.borrow().clone()
    }
}

impl Client for MockClient {
    fn gen_unique_id(&self) -> String {
        let n = self.next_id.get() + 1;
        self.next_id.set(n);
        format!("t{}", n)
    }

    fn send(&self, element: &Element) {
        self.sent
            .borrow_mut()
            .push(element.to_xml_in_scope(NS_CLIENT));
    }

    fn jid(&self) -> Jid {
        self.jid.clone()
    }

    fn host(&self) -> Jid {
        self.host.clone()
    }

    fn stream_base_ns(&self) -> String {
        NS_CLIENT.to_string()
    }

    fn doc(&self) -> Document {
        self.doc.clone()
    }

    fn is_connected(&self) -> bool {
        self.connected.get()
    }

    fn debug(&self, message: &str) {
        self.debug_lines.borrow_mut().push(message.to_string());
    }
}
