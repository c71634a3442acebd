use std::fmt;

use tracing::warn;

use super::{Claim, TaskContext, TaskHandler};
use crate::jid::Jid;
use crate::stanza::{Kind, Stanza};
use crate::xml::{Element, XmlError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IqType {
    Get,
    Set,
}

impl IqType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::Set => "set",
        }
    }
}

impl fmt::Display for IqType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Generic `<iq/>` request carrying one `<query/>` payload.
///
/// A `result` reply completes the task successfully and is kept for
/// inspection; an `error` reply fails it with the decoded stanza error.
pub struct IqRequest {
    to: Jid,
    iq_type: IqType,
    xmlns: String,
    payload: Vec<Element>,
    response: Option<Element>,
}

impl IqRequest {
    pub fn new(to: Jid, iq_type: IqType, xmlns: impl Into<String>) -> Self {
        Self {
            to,
            iq_type,
            xmlns: xmlns.into(),
            payload: Vec::new(),
            response: None,
        }
    }

    pub fn get(to: Jid, xmlns: impl Into<String>) -> Self {
        Self::new(to, IqType::Get, xmlns)
    }

    pub fn set(to: Jid, xmlns: impl Into<String>) -> Self {
        Self::new(to, IqType::Set, xmlns)
    }

    /// Content of the `<query/>` element. Copied into the client's
    /// document when the request is sent.
    pub fn with_payload(mut self, element: Element) -> Self {
        self.payload.push(element);
        self
    }

    pub fn to(&self) -> &Jid {
        &self.to
    }

    pub fn iq_type(&self) -> IqType {
        self.iq_type
    }

    pub fn xmlns(&self) -> &str {
        &self.xmlns
    }

    /// The `result` reply, once received.
    pub fn response(&self) -> Option<&Element> {
        self.response.as_ref()
    }

    fn build(&self, task: &TaskContext<'_>) -> Result<Stanza, XmlError> {
        let doc = task.doc().ok_or(XmlError::NullStanza)?;
        let iq = Stanza::new(
            &doc,
            &task.base_ns(),
            Kind::Iq,
            &self.to,
            self.iq_type.as_str(),
            task.id(),
        );
        let query = iq.create_element(&self.xmlns, "query")?;
        for element in &self.payload {
            query.append_copy(element);
        }
        iq.append_child(&query)?;
        Ok(iq)
    }
}

impl TaskHandler for IqRequest {
    fn on_go(&mut self, task: &mut TaskContext<'_>) {
        match self.build(task) {
            Ok(iq) => {
                if let Some(element) = iq.element() {
                    task.send(element);
                }
            }
            Err(e) => {
                warn!(task = %task.id(), error = ?e, "failed to build iq request");
                task.set_error(-1, &e.to_string());
            }
        }
    }

    fn take(&mut self, task: &mut TaskContext<'_>, stanza: &Element) -> Claim {
        let id = task.id().to_string();
        if !task.iq_verify(stanza, &self.to, &id, "") {
            return Claim::NotMine;
        }

        match stanza.attribute("type").as_deref() {
            Some("result") => {
                self.response = Some(stanza.clone());
                task.set_success(0, "");
            }
            Some("error") => task.set_error_from_element(stanza),
            _ => return Claim::NotMine,
        }
        Claim::Claimed
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::stanza::ErrorCondition;
    use crate::client::Client;
    use crate::task::testing::MockClient;
    use crate::task::{TaskTree, DISCONNECTED_TEXT, ERR_DISCONNECTED};
    use crate::xml::Document;
    use pretty_assertions::assert_eq;

    fn setup() -> (Rc<MockClient>, TaskTree) {
        let client = MockClient::new("me@example.com/desk", "example.com");
        let tree = TaskTree::new(&client);
        (client, tree)
    }

    fn inbound(xml: &str) -> Element {
        Document::parse_with_default_ns(xml, "jabber:client").unwrap()
    }

    #[test]
    fn test_sends_query() {
        let (client, mut tree) = setup();
        let task = tree
            .spawn(tree.root(), IqRequest::get(Jid::new("example.com"), "jabber:iq:version"))
            .unwrap();
        tree.go(task, false).unwrap();

        assert_eq!(
            client.sent(),
            vec![r#"<iq to="example.com" type="get" id="t1"><query xmlns="jabber:iq:version"/></iq>"#.to_string()]
        );
    }

    #[test]
    fn test_sends_payload_from_another_document() {
        let (client, mut tree) = setup();
        let item = Document::parse("<item jid='juliet@capulet.lit' name='Juliet'/>").unwrap();
        let request = IqRequest::set(Jid::default(), "jabber:iq:roster").with_payload(item);
        let task = tree.spawn_with_id(tree.root(), "r1", request).unwrap();
        tree.go(task, false).unwrap();

        assert_eq!(
            client.sent(),
            vec![r#"<iq type="set" id="r1"><query xmlns="jabber:iq:roster"><item xmlns="" jid="juliet@capulet.lit" name="Juliet"/></query></iq>"#.to_string()]
        );
    }

    #[test]
    fn test_result_reply() {
        let (_client, mut tree) = setup();
        let task = tree
            .spawn(tree.root(), IqRequest::get(Jid::new("example.com"), "jabber:iq:version"))
            .unwrap();
        tree.go(task, false).unwrap();

        let reply = inbound(
            "<iq type='result' id='t1' from='example.com'><query xmlns='jabber:iq:version'><name>srv</name></query></iq>",
        );
        assert!(tree.dispatch(&reply));

        let state = tree.task(task).unwrap();
        assert!(state.success());
        assert_eq!(state.status_code(), 0);
        let response = tree.handler::<IqRequest>(task).unwrap().response().unwrap();
        assert_eq!(
            response.first_child("query").unwrap().first_child("name").unwrap().text(),
            "srv"
        );
    }

    #[test]
    fn test_error_reply() {
        let (_client, mut tree) = setup();
        let task = tree
            .spawn(tree.root(), IqRequest::get(Jid::new("juliet@capulet.lit/balcony"), "jabber:iq:version"))
            .unwrap();
        tree.go(task, false).unwrap();

        let reply = inbound(
            "<iq type='error' id='t1' from='juliet@capulet.lit/balcony'><error type='cancel'><service-unavailable xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/><text xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'>busy</text></error></iq>",
        );
        assert!(tree.dispatch(&reply));

        let state = tree.task(task).unwrap();
        assert!(!state.success());
        assert_eq!(state.status_code(), 503);
        assert!(state.status_string().ends_with("\nbusy"));
        assert_eq!(state.error_condition(), Some(ErrorCondition::ServiceUnavailable));
    }

    #[test]
    fn test_ignores_requests_and_spoofed_senders() {
        let (_client, mut tree) = setup();
        let task = tree
            .spawn(tree.root(), IqRequest::get(Jid::new("juliet@capulet.lit/balcony"), "jabber:iq:version"))
            .unwrap();
        tree.go(task, false).unwrap();

        assert!(!tree.dispatch(&inbound("<iq type='get' id='t1' from='juliet@capulet.lit/balcony'/>")));
        assert!(!tree.dispatch(&inbound("<iq type='result' id='t1' from='romeo@montague.lit'/>")));
        assert!(!tree.dispatch(&inbound("<iq type='result' id='t1'/>")));
        assert!(!tree.task(task).unwrap().is_done());
    }

    #[test]
    fn test_finished_requests_release_their_stanzas() {
        let (client, mut tree) = setup();
        let doc = client.doc();
        for n in 0..200 {
            let payload = Document::parse("<item jid='juliet@capulet.lit'/>").unwrap();
            let request = IqRequest::set(Jid::default(), "jabber:iq:roster").with_payload(payload);
            let task = tree.spawn(tree.root(), request).unwrap();
            tree.go(task, true).unwrap();

            let reply = if n % 2 == 0 {
                format!("<iq type='result' id='t{}'/>", n + 1)
            } else {
                format!(
                    "<iq type='error' id='t{}'><error type='cancel'><not-allowed xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/></error></iq>",
                    n + 1
                )
            };
            assert!(tree.dispatch(&inbound(&reply)));
            assert!(!tree.contains(task));
        }

        assert_eq!(tree.len(), 1);
        assert_eq!(client.sent().len(), 200);
        assert_eq!(doc.node_count(), 0);
    }

    #[test]
    fn test_disconnect_fails_pending_request() {
        let (_client, mut tree) = setup();
        let task = tree
            .spawn(tree.root(), IqRequest::get(Jid::new("example.com"), "jabber:iq:version"))
            .unwrap();
        tree.go(task, true).unwrap();

        tree.client_disconnected();
        assert!(tree.contains(task));
        tree.run_deferred();
        assert!(!tree.contains(task));

        let task = tree
            .spawn(tree.root(), IqRequest::get(Jid::new("example.com"), "jabber:iq:version"))
            .unwrap();
        tree.client_disconnected();
        tree.run_deferred();
        let state = tree.task(task).unwrap();
        assert_eq!(state.status_code(), ERR_DISCONNECTED);
        assert_eq!(state.status_string(), DISCONNECTED_TEXT);
    }
}
