use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Characters left verbatim when a channel is embedded in a URL path segment.
const CHANNEL_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("invalid channel: {raw:?}")]
    InvalidChannel { raw: String },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Runs,
    Run,
    Approvals,
    Audit,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Runs => "runs",
            ChannelKind::Run => "run",
            ChannelKind::Approvals => "approvals",
            ChannelKind::Audit => "audit",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelKind {
    type Err = ();

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input {
            "runs" => Ok(ChannelKind::Runs),
            "run" => Ok(ChannelKind::Run),
            "approvals" => Ok(ChannelKind::Approvals),
            "audit" => Ok(ChannelKind::Audit),
            _ => Err(()),
        }
    }
}

/// A named event stream scoped to one entity or entity class, e.g.
/// `runs:ws_42` (all runs in a workspace) or `run:run_01ABC` (one run).
///
/// The raw form is exactly `<kind>:<identifier>` with both parts non-empty.
/// The identifier is opaque and may itself contain colons.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelName {
    kind: ChannelKind,
    identifier: String,
}

impl ChannelName {
    pub fn new(kind: ChannelKind, identifier: impl Into<String>) -> Result<Self, ChannelError> {
        let identifier = identifier.into();
        if identifier.is_empty() {
            return Err(ChannelError::InvalidChannel {
                raw: format!("{kind}:"),
            });
        }
        Ok(Self { kind, identifier })
    }

    /// Parse the raw `<kind>:<identifier>` form. Unknown kinds, a missing
    /// colon, or an empty segment reject with `InvalidChannel`.
    pub fn parse(raw: &str) -> Result<Self, ChannelError> {
        let invalid = || ChannelError::InvalidChannel {
            raw: raw.to_string(),
        };
        let trimmed = raw.trim();
        let (kind_raw, identifier) = trimmed.split_once(':').ok_or_else(invalid)?;
        if kind_raw.is_empty() || identifier.is_empty() {
            return Err(invalid());
        }
        let kind = ChannelKind::from_str(kind_raw).map_err(|_| invalid())?;
        Ok(Self {
            kind,
            identifier: identifier.to_string(),
        })
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn to_raw(&self) -> String {
        format!("{}:{}", self.kind.as_str(), self.identifier)
    }

    /// Percent-encoded raw form, safe to splice into a URL path.
    pub fn path_segment(&self) -> String {
        utf8_percent_encode(&self.to_raw(), CHANNEL_SEGMENT).to_string()
    }
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.identifier)
    }
}

impl FromStr for ChannelName {
    type Err = ChannelError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        Self::parse(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_known_kinds() {
        let cases = [
            ("runs:ws_42", ChannelKind::Runs, "ws_42"),
            ("run:run_01ABC", ChannelKind::Run, "run_01ABC"),
            ("approvals:ws_42", ChannelKind::Approvals, "ws_42"),
            ("audit:ws_42", ChannelKind::Audit, "ws_42"),
        ];
        for (raw, kind, identifier) in cases {
            let channel = ChannelName::parse(raw).expect(raw);
            assert_eq!(channel.kind(), kind);
            assert_eq!(channel.identifier(), identifier);
            assert_eq!(channel.to_raw(), raw);
        }
    }

    #[test]
    fn parse_rejects_malformed_input() {
        let cases = [
            "",
            "invalid_id",
            "foo:bar",
            "runs:",
            ":ws_42",
            ":",
            "RUNS:ws_42",
            "runs ws_42",
        ];
        for raw in cases {
            assert_eq!(
                ChannelName::parse(raw),
                Err(ChannelError::InvalidChannel {
                    raw: raw.to_string()
                }),
                "expected reject: {raw:?}"
            );
        }
    }

    #[test]
    fn parse_trims_surrounding_whitespace() {
        let channel = ChannelName::parse("  run:run_9  ").expect("trimmed input");
        assert_eq!(channel.to_raw(), "run:run_9");
    }

    #[test]
    fn identifier_may_contain_colons() {
        let channel = ChannelName::parse("audit:ws:shard:3").expect("colon identifier");
        assert_eq!(channel.kind(), ChannelKind::Audit);
        assert_eq!(channel.identifier(), "ws:shard:3");
        assert_eq!(channel.to_raw(), "audit:ws:shard:3");
    }

    #[test]
    fn path_segment_encodes_separator() {
        let channel = ChannelName::parse("runs:ws_42").expect("valid");
        assert_eq!(channel.path_segment(), "runs%3Aws_42");
    }

    #[test]
    fn new_rejects_empty_identifier() {
        assert!(ChannelName::new(ChannelKind::Run, "").is_err());
    }
}
