//! Request/reply correlation for XMPP IQ exchanges.
//!
//! A [`TaskTree`] tracks outstanding requests. Each task sends one stanza,
//! claims the inbound reply that matches it (see [`iq_verify`]) and completes
//! exactly once, successfully or with a decoded [`StanzaError`]. Replies are
//! built and read through the [`Stanza`] envelope over a shared
//! [`Document`].

pub mod client;
pub mod config;
pub mod error;
pub mod jid;
pub mod replay;
pub mod stanza;
pub mod task;
pub mod xml;

pub use client::Client;
pub use error::{Error, Result};
pub use crate::jid::{Jid, JidError};
pub use stanza::{ErrorCondition, ErrorType, Kind, Stanza, StanzaError};
pub use task::{
    iq_verify, Claim, IqRequest, IqType, TaskContext, TaskError, TaskHandler, TaskId, TaskState,
    TaskTree,
};
pub use xml::{Document, Element, XmlError};
