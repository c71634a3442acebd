//! Command-line configuration of the replay tool.

use std::path::PathBuf;

use thiserror::Error;

use crate::jid::{Jid, JidError};
use crate::stanza::NS_CLIENT;
use crate::task::IqType;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("missing required option --jid=JID")]
    MissingJid,

    #[error("invalid JID '{value}': {source}")]
    InvalidJid { value: String, source: JidError },

    #[error("invalid request '{0}', expected TO,NAMESPACE")]
    InvalidRequest(String),

    #[error("unknown option '{0}'")]
    UnknownOption(String),
}

/// One request to issue: `--get=TO,NS` or `--set=TO,NS`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuerySpec {
    pub to: Jid,
    pub iq_type: IqType,
    pub xmlns: String,
}

impl QuerySpec {
    fn parse(iq_type: IqType, value: &str) -> Result<Self, ConfigError> {
        let (to, xmlns) = value
            .split_once(',')
            .ok_or_else(|| ConfigError::InvalidRequest(value.to_string()))?;
        let xmlns = xmlns.trim();
        if xmlns.is_empty() {
            return Err(ConfigError::InvalidRequest(value.to_string()));
        }
        let to = to.trim();
        let to = if to.is_empty() {
            Jid::default()
        } else {
            Jid::parse(to).map_err(|source| ConfigError::InvalidJid {
                value: to.to_string(),
                source,
            })?
        };
        Ok(Self {
            to,
            iq_type,
            xmlns: xmlns.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayConfig {
    pub jid: Jid,
    pub server: Jid,
    pub base_ns: String,
    pub requests: Vec<QuerySpec>,
    /// Transcript to replay; stdin when absent.
    pub transcript: Option<PathBuf>,
    /// `Some("default")` for `--verbose`, `Some("xmpp")` for `--verbose=xmpp`.
    pub verbose_level: Option<String>,
    pub log_file: Option<PathBuf>,
    pub help: bool,
}

fn parse_jid(value: &str) -> Result<Jid, ConfigError> {
    Jid::parse(value).map_err(|source| ConfigError::InvalidJid {
        value: value.to_string(),
        source,
    })
}

impl ReplayConfig {
    /// Parse process arguments, program name excluded.
    pub fn from_args(args: &[String]) -> Result<Self, ConfigError> {
        let mut jid = None;
        let mut server = None;
        let mut base_ns = None;
        let mut requests = Vec::new();
        let mut transcript = None;
        let mut verbose_level = None;
        let mut log_file = None;
        let mut help = false;

        for arg in args {
            if arg == "--help" || arg == "-h" {
                help = true;
            } else if arg == "--verbose" || arg == "-v" {
                verbose_level = Some("default".to_string());
            } else if let Some(level) = arg.strip_prefix("--verbose=") {
                verbose_level = Some(level.to_string());
            } else if let Some(path) = arg.strip_prefix("--log-file=") {
                log_file = Some(PathBuf::from(path));
            } else if let Some(value) = arg.strip_prefix("--jid=") {
                jid = Some(parse_jid(value)?);
            } else if let Some(value) = arg.strip_prefix("--server=") {
                server = Some(parse_jid(value)?);
            } else if let Some(value) = arg.strip_prefix("--base-ns=") {
                base_ns = Some(value.to_string());
            } else if let Some(value) = arg.strip_prefix("--get=") {
                requests.push(QuerySpec::parse(IqType::Get, value)?);
            } else if let Some(value) = arg.strip_prefix("--set=") {
                requests.push(QuerySpec::parse(IqType::Set, value)?);
            } else if let Some(path) = arg.strip_prefix("--transcript=") {
                transcript = Some(PathBuf::from(path));
            } else {
                return Err(ConfigError::UnknownOption(arg.clone()));
            }
        }

        let jid = match jid {
            Some(jid) => jid,
            None if help => Jid::default(),
            None => return Err(ConfigError::MissingJid),
        };
        let server = server.unwrap_or_else(|| jid.domain_jid());
        Ok(Self {
            jid,
            server,
            base_ns: base_ns.unwrap_or_else(|| NS_CLIENT.to_string()),
            requests,
            transcript,
            verbose_level,
            log_file,
            help,
        })
    }

    pub fn verbose(&self) -> bool {
        self.verbose_level.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_defaults_from_jid() {
        let config = ReplayConfig::from_args(&args(&[
            "--jid=me@example.com/desk",
            "--get=example.com,jabber:iq:version",
            "--set=,jabber:iq:roster",
        ]))
        .unwrap();

        assert_eq!(config.server, Jid::new("example.com"));
        assert_eq!(config.base_ns, "jabber:client");
        assert_eq!(
            config.requests,
            vec![
                QuerySpec {
                    to: Jid::new("example.com"),
                    iq_type: IqType::Get,
                    xmlns: "jabber:iq:version".to_string(),
                },
                QuerySpec {
                    to: Jid::default(),
                    iq_type: IqType::Set,
                    xmlns: "jabber:iq:roster".to_string(),
                },
            ]
        );
        assert!(!config.verbose());
        assert!(config.transcript.is_none());
    }

    #[test]
    fn test_explicit_options() {
        let config = ReplayConfig::from_args(&args(&[
            "--jid=me@example.com",
            "--server=xmpp.example.net",
            "--base-ns=jabber:server",
            "--transcript=session.xml",
            "--verbose=xmpp",
            "--log-file=/tmp/replay.log",
        ]))
        .unwrap();

        assert_eq!(config.server, Jid::new("xmpp.example.net"));
        assert_eq!(config.base_ns, "jabber:server");
        assert_eq!(config.transcript, Some(PathBuf::from("session.xml")));
        assert_eq!(config.verbose_level.as_deref(), Some("xmpp"));
        assert_eq!(config.log_file, Some(PathBuf::from("/tmp/replay.log")));
    }

    #[test]
    fn test_help_does_not_need_jid() {
        let config = ReplayConfig::from_args(&args(&["-h"])).unwrap();
        assert!(config.help);
    }

    #[rstest]
    #[case::missing_jid(&["--get=a,b"], ConfigError::MissingJid)]
    #[case::unknown(&["--jid=a@b", "--frobnicate"], ConfigError::UnknownOption("--frobnicate".into()))]
    #[case::no_namespace(&["--jid=a@b", "--get=example.com"], ConfigError::InvalidRequest("example.com".into()))]
    #[case::empty_namespace(&["--jid=a@b", "--set=example.com,"], ConfigError::InvalidRequest("example.com,".into()))]
    fn test_rejected(#[case] list: &[&str], #[case] expected: ConfigError) {
        assert_eq!(ReplayConfig::from_args(&args(list)).unwrap_err(), expected);
    }

    #[test]
    fn test_invalid_jid() {
        let err = ReplayConfig::from_args(&args(&["--jid=@example.com"])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidJid { .. }));
    }
}
