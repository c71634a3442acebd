//! The session-side collaborator the task tree talks to.

use crate::jid::Jid;
use crate::xml::{Document, Element};

/// What a [`TaskTree`](crate::task::TaskTree) needs from the object owning
/// the connection. The tree only holds a weak reference to it.
pub trait Client {
    /// A fresh stanza id. Never repeats within one session.
    fn gen_unique_id(&self) -> String;

    /// Best-effort send of a complete outbound element.
    fn send(&self, element: &Element);

    /// Our own full JID.
    fn jid(&self) -> Jid;

    /// The server we are connected to.
    fn host(&self) -> Jid;

    /// Namespace qualifying stanzas on this stream (`jabber:client`).
    fn stream_base_ns(&self) -> String;

    /// Document outbound stanzas are built in.
    fn doc(&self) -> Document;

    /// Whether the underlying stream can carry a request right now.
    fn is_connected(&self) -> bool;

    /// Sink for task debug lines.
    fn debug(&self, _message: &str) {}
}
