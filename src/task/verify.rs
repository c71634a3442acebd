use crate::jid::Jid;
use crate::xml::Element;

/// Namespace of the first `<query/>` child, or empty.
pub fn query_ns(stanza: &Element) -> String {
    stanza
        .first_child("query")
        .map(|q| q.namespace())
        .unwrap_or_default()
}

/// Decide whether `stanza` is the reply to an iq sent to `to` with `id`.
///
/// `local` is our own JID and `server` the server we are connected to.
/// An empty `id` or `xmlns` is not checked.
pub fn iq_verify(
    stanza: &Element,
    to: &Jid,
    id: &str,
    xmlns: &str,
    local: &Jid,
    server: &Jid,
) -> bool {
    if stanza.name() != "iq" {
        return false;
    }

    let from = Jid::new(&stanza.attribute("from").unwrap_or_default());
    if from.is_empty() {
        // servers may omit the sender on their own replies
        if !to.is_empty() && !to.compare(server, true) {
            return false;
        }
    } else if from.compare(local, false) || from.compare(&local.domain_jid(), false) {
        if !to.is_empty() && !to.compare(local, false) && !to.compare(server, true) {
            return false;
        }
    } else if !from.compare(to, true) {
        return false;
    }

    if !id.is_empty() && stanza.attribute("id").as_deref() != Some(id) {
        return false;
    }

    if !xmlns.is_empty() && query_ns(stanza) != xmlns {
        return false;
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xml::Document;
    use rstest::rstest;

    const LOCAL: &str = "me@example.com/desk";
    const SERVER: &str = "example.com";

    fn check(xml: &str, to: &str, id: &str, xmlns: &str) -> bool {
        let stanza = Document::parse_with_default_ns(xml, "jabber:client").unwrap();
        iq_verify(
            &stanza,
            &Jid::new(to),
            id,
            xmlns,
            &Jid::new(LOCAL),
            &Jid::new(SERVER),
        )
    }

    #[rstest]
    #[case::empty_from_empty_to("<iq id='1'/>", "", true)]
    #[case::empty_from_server_to("<iq id='1'/>", "example.com", true)]
    #[case::empty_from_other_to("<iq id='1'/>", "pubsub.example.com", false)]
    #[case::own_bare_from_empty_to("<iq from='me@example.com' id='1'/>", "", true)]
    #[case::own_full_from_own_to("<iq from='me@example.com/desk' id='1'/>", "me@example.com", true)]
    #[case::own_from_server_to("<iq from='me@example.com' id='1'/>", "example.com", true)]
    #[case::own_from_other_to("<iq from='me@example.com' id='1'/>", "juliet@capulet.lit", false)]
    #[case::domain_from_server_to("<iq from='example.com' id='1'/>", "example.com", true)]
    #[case::domain_from_empty_to("<iq from='example.com' id='1'/>", "", true)]
    #[case::other_from_matches_to("<iq from='juliet@capulet.lit/balcony' id='1'/>", "juliet@capulet.lit/balcony", true)]
    #[case::other_from_differs_by_resource("<iq from='juliet@capulet.lit/balcony' id='1'/>", "juliet@capulet.lit/garden", false)]
    #[case::other_from_bare_to("<iq from='juliet@capulet.lit/balcony' id='1'/>", "juliet@capulet.lit", false)]
    #[case::other_from_empty_to("<iq from='juliet@capulet.lit' id='1'/>", "", false)]
    #[case::case_insensitive_domain("<iq from='PubSub.Example.com' id='1'/>", "pubsub.example.com", true)]
    fn test_addressing(#[case] xml: &str, #[case] to: &str, #[case] accepted: bool) {
        assert_eq!(check(xml, to, "1", ""), accepted);
    }

    #[rstest]
    #[case::matching("<iq id='abc'/>", "abc", true)]
    #[case::mismatched("<iq id='abd'/>", "abc", false)]
    #[case::missing("<iq/>", "abc", false)]
    #[case::unchecked("<iq id='zzz'/>", "", true)]
    fn test_id(#[case] xml: &str, #[case] id: &str, #[case] accepted: bool) {
        assert_eq!(check(xml, "", id, ""), accepted);
    }

    #[rstest]
    #[case::matching("<iq id='1'><query xmlns='jabber:iq:roster'/></iq>", "jabber:iq:roster", true)]
    #[case::mismatched("<iq id='1'><query xmlns='jabber:iq:version'/></iq>", "jabber:iq:roster", false)]
    #[case::no_query("<iq id='1'><ping xmlns='urn:xmpp:ping'/></iq>", "urn:xmpp:ping", false)]
    #[case::unchecked("<iq id='1'/>", "", true)]
    fn test_namespace(#[case] xml: &str, #[case] xmlns: &str, #[case] accepted: bool) {
        assert_eq!(check(xml, "", "1", xmlns), accepted);
    }

    #[test]
    fn test_address_match_does_not_excuse_bad_id() {
        assert!(!check(
            "<iq from='juliet@capulet.lit' id='2'/>",
            "juliet@capulet.lit",
            "1",
            ""
        ));
    }

    #[rstest]
    #[case("<message id='1'/>")]
    #[case("<presence id='1'/>")]
    fn test_non_iq_rejected(#[case] xml: &str) {
        assert!(!check(xml, "", "1", ""));
    }

    #[test]
    fn test_query_ns() {
        let e = Document::parse("<iq><x/><query xmlns='jabber:iq:last'/></iq>").unwrap();
        assert_eq!(query_ns(&e), "jabber:iq:last");
        let e = Document::parse("<iq/>").unwrap();
        assert_eq!(query_ns(&e), "");
    }
}
