//! Stanza-level errors (RFC 6120 §8.3) and their legacy numeric codes.

use std::fmt;

use crate::xml::{Document, Element};

/// Namespace of defined conditions and the `<text/>` element.
pub const NS_STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";

/// How the requester should react to the error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ErrorType {
    /// Do not retry.
    #[default]
    Cancel = 1,
    /// Warning only, proceed.
    Continue,
    /// Retry after changing the data sent.
    Modify,
    /// Retry after providing credentials.
    Auth,
    /// Retry after waiting.
    Wait,
}

impl ErrorType {
    pub const ALL: [ErrorType; 5] = [
        ErrorType::Cancel,
        ErrorType::Continue,
        ErrorType::Modify,
        ErrorType::Auth,
        ErrorType::Wait,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cancel => "cancel",
            Self::Continue => "continue",
            Self::Modify => "modify",
            Self::Auth => "auth",
            Self::Wait => "wait",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Defined error conditions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ErrorCondition {
    BadRequest = 1,
    Conflict,
    FeatureNotImplemented,
    Forbidden,
    Gone,
    InternalServerError,
    ItemNotFound,
    JidMalformed,
    NotAcceptable,
    NotAllowed,
    NotAuthorized,
    PaymentRequired,
    RecipientUnavailable,
    Redirect,
    RegistrationRequired,
    RemoteServerNotFound,
    RemoteServerTimeout,
    ResourceConstraint,
    ServiceUnavailable,
    SubscriptionRequired,
    #[default]
    UndefinedCondition,
    UnexpectedRequest,
}

impl ErrorCondition {
    pub const ALL: [ErrorCondition; 22] = [
        ErrorCondition::BadRequest,
        ErrorCondition::Conflict,
        ErrorCondition::FeatureNotImplemented,
        ErrorCondition::Forbidden,
        ErrorCondition::Gone,
        ErrorCondition::InternalServerError,
        ErrorCondition::ItemNotFound,
        ErrorCondition::JidMalformed,
        ErrorCondition::NotAcceptable,
        ErrorCondition::NotAllowed,
        ErrorCondition::NotAuthorized,
        ErrorCondition::PaymentRequired,
        ErrorCondition::RecipientUnavailable,
        ErrorCondition::Redirect,
        ErrorCondition::RegistrationRequired,
        ErrorCondition::RemoteServerNotFound,
        ErrorCondition::RemoteServerTimeout,
        ErrorCondition::ResourceConstraint,
        ErrorCondition::ServiceUnavailable,
        ErrorCondition::SubscriptionRequired,
        ErrorCondition::UndefinedCondition,
        ErrorCondition::UnexpectedRequest,
    ];

    /// Element name of the condition.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadRequest => "bad-request",
            Self::Conflict => "conflict",
            Self::FeatureNotImplemented => "feature-not-implemented",
            Self::Forbidden => "forbidden",
            Self::Gone => "gone",
            Self::InternalServerError => "internal-server-error",
            Self::ItemNotFound => "item-not-found",
            Self::JidMalformed => "jid-malformed",
            Self::NotAcceptable => "not-acceptable",
            Self::NotAllowed => "not-allowed",
            Self::NotAuthorized => "not-authorized",
            Self::PaymentRequired => "payment-required",
            Self::RecipientUnavailable => "recipient-unavailable",
            Self::Redirect => "redirect",
            Self::RegistrationRequired => "registration-required",
            Self::RemoteServerNotFound => "remote-server-not-found",
            Self::RemoteServerTimeout => "remote-server-timeout",
            Self::ResourceConstraint => "resource-constraint",
            Self::ServiceUnavailable => "service-unavailable",
            Self::SubscriptionRequired => "subscription-required",
            Self::UndefinedCondition => "undefined-condition",
            Self::UnexpectedRequest => "unexpected-request",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == s)
    }
}

impl fmt::Display for ErrorCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Legacy (pre-RFC 3920) code table. Order matters: reverse lookups take the
/// first row carrying a code.
const CODE_TABLE: [(ErrorCondition, ErrorType, u16); 22] = [
    (ErrorCondition::BadRequest, ErrorType::Modify, 400),
    (ErrorCondition::Conflict, ErrorType::Cancel, 409),
    (ErrorCondition::FeatureNotImplemented, ErrorType::Cancel, 501),
    (ErrorCondition::Forbidden, ErrorType::Auth, 403),
    (ErrorCondition::Gone, ErrorType::Modify, 302),
    (ErrorCondition::InternalServerError, ErrorType::Wait, 500),
    (ErrorCondition::ItemNotFound, ErrorType::Cancel, 404),
    (ErrorCondition::JidMalformed, ErrorType::Modify, 400),
    (ErrorCondition::NotAcceptable, ErrorType::Modify, 406),
    (ErrorCondition::NotAllowed, ErrorType::Cancel, 405),
    (ErrorCondition::NotAuthorized, ErrorType::Auth, 401),
    (ErrorCondition::PaymentRequired, ErrorType::Auth, 402),
    (ErrorCondition::RecipientUnavailable, ErrorType::Wait, 404),
    (ErrorCondition::Redirect, ErrorType::Modify, 302),
    (ErrorCondition::RegistrationRequired, ErrorType::Auth, 407),
    (ErrorCondition::RemoteServerNotFound, ErrorType::Cancel, 404),
    (ErrorCondition::RemoteServerTimeout, ErrorType::Wait, 504),
    (ErrorCondition::ResourceConstraint, ErrorType::Wait, 500),
    (ErrorCondition::ServiceUnavailable, ErrorType::Cancel, 503),
    (ErrorCondition::SubscriptionRequired, ErrorType::Auth, 407),
    (ErrorCondition::UndefinedCondition, ErrorType::Wait, 500),
    (ErrorCondition::UnexpectedRequest, ErrorType::Wait, 400),
];

fn condition_to_code(condition: ErrorCondition) -> u16 {
    CODE_TABLE
        .iter()
        .find(|(c, _, _)| *c == condition)
        .map(|(_, _, code)| *code)
        .unwrap_or(0)
}

fn code_to_entry(code: u16) -> Option<(ErrorCondition, ErrorType)> {
    CODE_TABLE
        .iter()
        .find(|(_, _, c)| *c == code)
        .map(|(condition, error_type, _)| (*condition, *error_type))
}

/// An error carried by a stanza.
#[derive(Clone, Default)]
pub struct StanzaError {
    pub error_type: ErrorType,
    pub condition: ErrorCondition,
    pub text: String,
    /// `xml:lang` of the text, empty when unspecified.
    pub lang: String,
    /// Application-specific condition element, owned by a private document.
    pub app_spec: Option<Element>,
    raw_code: Option<u16>,
}

impl StanzaError {
    pub fn new(error_type: ErrorType, condition: ErrorCondition, text: impl Into<String>) -> Self {
        Self {
            error_type,
            condition,
            text: text.into(),
            lang: String::new(),
            app_spec: None,
            raw_code: None,
        }
    }

    pub fn with_lang(mut self, lang: impl Into<String>) -> Self {
        self.lang = lang.into();
        self
    }

    /// Attach an application-specific element. A private copy is taken.
    pub fn with_app_spec(mut self, element: &Element) -> Self {
        self.app_spec = Some(Document::new().import(element));
        self
    }

    /// Legacy numeric code. A code recorded by [`from_code`](Self::from_code)
    /// or read from the wire wins over the table value.
    pub fn code(&self) -> u16 {
        self.raw_code
            .unwrap_or_else(|| condition_to_code(self.condition))
    }

    /// Fill type and condition from a legacy code. Unknown codes leave the
    /// error untouched and return `false`.
    pub fn from_code(&mut self, code: u16) -> bool {
        let Some((condition, error_type)) = code_to_entry(code) else {
            return false;
        };
        self.condition = condition;
        self.error_type = error_type;
        self.raw_code = Some(code);
        true
    }

    /// Short title and explanation of the condition, for display.
    pub fn description(&self) -> (&'static str, &'static str) {
        match self.condition {
            ErrorCondition::BadRequest => (
                "Bad request",
                "The sender has sent XML that is malformed or that cannot be processed.",
            ),
            ErrorCondition::Conflict => (
                "Conflict",
                "Access cannot be granted because an existing resource or session exists with the same name or address.",
            ),
            ErrorCondition::FeatureNotImplemented => (
                "Feature not implemented",
                "The feature requested is not implemented by the recipient or server and therefore cannot be processed.",
            ),
            ErrorCondition::Forbidden => (
                "Forbidden",
                "The requesting entity does not possess the required permissions to perform the action.",
            ),
            ErrorCondition::Gone => (
                "Gone",
                "The recipient or server can no longer be contacted at this address.",
            ),
            ErrorCondition::InternalServerError => (
                "Internal server error",
                "The server could not process the stanza because of a misconfiguration or an otherwise-undefined internal server error.",
            ),
            ErrorCondition::ItemNotFound => (
                "Item not found",
                "The addressed JID or item requested cannot be found.",
            ),
            ErrorCondition::JidMalformed => (
                "JID malformed",
                "The sending entity has provided or communicated an XMPP address or aspect thereof that does not adhere to the syntax defined in Addressing Scheme.",
            ),
            ErrorCondition::NotAcceptable => (
                "Not acceptable",
                "The recipient or server understands the request but is refusing to process it because it does not meet criteria defined by the recipient or server.",
            ),
            ErrorCondition::NotAllowed => (
                "Not allowed",
                "The recipient or server does not allow any entity to perform the action.",
            ),
            ErrorCondition::NotAuthorized => (
                "Not authorized",
                "The sender must provide proper credentials before being allowed to perform the action, or has provided improper credentials.",
            ),
            ErrorCondition::PaymentRequired => (
                "Payment required",
                "The requesting entity is not authorized to access the requested service because payment is required.",
            ),
            ErrorCondition::RecipientUnavailable => (
                "Recipient unavailable",
                "The intended recipient is temporarily unavailable.",
            ),
            ErrorCondition::Redirect => (
                "Redirect",
                "The recipient or server is redirecting requests for this information to another entity, usually temporarily.",
            ),
            ErrorCondition::RegistrationRequired => (
                "Registration required",
                "The requesting entity is not authorized to access the requested service because registration is required.",
            ),
            ErrorCondition::RemoteServerNotFound => (
                "Remote server not found",
                "A remote server or service specified as part or all of the JID of the intended recipient does not exist.",
            ),
            ErrorCondition::RemoteServerTimeout => (
                "Remote server timeout",
                "A remote server or service specified as part or all of the JID of the intended recipient could not be contacted within a reasonable amount of time.",
            ),
            ErrorCondition::ResourceConstraint => (
                "Resource constraint",
                "The server or recipient lacks the system resources necessary to service the request.",
            ),
            ErrorCondition::ServiceUnavailable => (
                "Service unavailable",
                "The server or recipient does not currently provide the requested service.",
            ),
            ErrorCondition::SubscriptionRequired => (
                "Subscription required",
                "The requesting entity is not authorized to access the requested service because a subscription is required.",
            ),
            ErrorCondition::UndefinedCondition => (
                "Undefined condition",
                "The error condition is not one of those defined by the other conditions in this list.",
            ),
            ErrorCondition::UnexpectedRequest => (
                "Unexpected request",
                "The recipient or server understood the request but was not expecting it at this time.",
            ),
        }
    }

    /// Human-readable status line: title, explanation and any server text.
    pub fn status_string(&self) -> String {
        let (title, explanation) = self.description();
        if self.text.is_empty() {
            format!("{}.\n{}", title, explanation)
        } else {
            format!("{}.\n{}\n{}", title, explanation, self.text)
        }
    }

    /// Build the `<error/>` element in `doc`, qualified by `base_ns`.
    pub fn to_xml(&self, doc: &Document, base_ns: &str) -> Element {
        let error = doc.create_element(base_ns, "error");
        error.set_attribute("type", self.error_type.as_str());
        let code = self.code();
        if code != 0 {
            error.set_attribute("code", &code.to_string());
        }

        error.append_element(NS_STANZAS, self.condition.as_str());
        if !self.text.is_empty() {
            let text = error.append_text_element(NS_STANZAS, "text", &self.text);
            text.set_attribute("xml:lang", &self.lang);
        }
        if let Some(app_spec) = &self.app_spec {
            error.append_copy(app_spec);
        }
        error
    }

    /// Decode an `<error/>` element qualified by `base_ns`.
    ///
    /// Returns `false` and resets to the default error when `e` is not an
    /// error element. Unknown condition tags map to `undefined-condition`,
    /// unknown children are ignored.
    pub fn from_xml(&mut self, e: &Element, base_ns: &str) -> bool {
        *self = Self::default();
        if e.name() != "error" || e.namespace() != base_ns {
            return false;
        }

        let legacy_code = e.attribute("code").and_then(|c| c.trim().parse::<u16>().ok());
        let wire_type = e.attribute("type").and_then(|t| ErrorType::from_name(t.trim()));

        let mut condition = None;
        let mut saw_stanza_child = false;
        for child in e.children() {
            if child.namespace() == NS_STANZAS {
                saw_stanza_child = true;
                if child.name() == "text" {
                    self.text = child.text();
                    self.lang = child.attribute("xml:lang").unwrap_or_default();
                } else if condition.is_none() {
                    condition = Some(
                        ErrorCondition::from_name(&child.name())
                            .unwrap_or(ErrorCondition::UndefinedCondition),
                    );
                }
            } else if self.app_spec.is_none() {
                self.app_spec = Some(Document::new().import(&child));
            }
        }

        if let Some(code) = legacy_code {
            if let Some((table_condition, table_type)) = code_to_entry(code) {
                if wire_type.is_none() {
                    self.error_type = table_type;
                }
                if condition.is_none() {
                    condition = Some(table_condition);
                }
            }
            self.raw_code = Some(code);
        }
        if let Some(t) = wire_type {
            self.error_type = t;
        }
        self.condition = condition.unwrap_or(ErrorCondition::UndefinedCondition);

        // Legacy errors carry their text directly inside <error/>
        if !saw_stanza_child && self.text.is_empty() {
            self.text = e.text().trim().to_string();
        }
        true
    }
}

impl PartialEq for StanzaError {
    fn eq(&self, other: &Self) -> bool {
        self.error_type == other.error_type
            && self.condition == other.condition
            && self.text == other.text
            && self.lang == other.lang
            && self.code() == other.code()
            && self.app_spec.as_ref().map(Element::to_xml) == other.app_spec.as_ref().map(Element::to_xml)
    }
}

impl fmt::Debug for StanzaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StanzaError")
            .field("type", &self.error_type)
            .field("condition", &self.condition)
            .field("text", &self.text)
            .field("lang", &self.lang)
            .field("code", &self.code())
            .field("app_spec", &self.app_spec.as_ref().map(Element::to_xml))
            .finish()
    }
}

impl fmt::Display for StanzaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.condition, self.error_type)?;
        if !self.text.is_empty() {
            write!(f, ": {}", self.text)?;
        }
        Ok(())
    }
}
