//! Channel filtering for a path end.
//!
//! A policy either allows or denies a list of port/channel matches, each
//! side of a match being a literal identifier or a `*` glob. The serde
//! form is the one relayer configurations use: a policy tag plus a list
//! of `['port', 'channel']` pairs.

use core::fmt::{Display, Error as FmtError, Formatter};
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ident::{ChannelId, PortId};

/// Which channels a path end relays.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(
    rename_all = "lowercase",
    tag = "policy",
    content = "list",
    deny_unknown_fields
)]
pub enum ChannelPolicy {
    /// Relay only the matching channels.
    Allow(Vec<ChannelMatch>),
    /// Relay everything except the matching channels.
    Deny(Vec<ChannelMatch>),
    /// Relay any & all channels.
    #[default]
    AllowAll,
}

impl ChannelPolicy {
    /// Whether traffic on the channel with this [`PortId`] and
    /// [`ChannelId`] is relayed under the policy.
    pub fn is_allowed(&self, port_id: &PortId, channel_id: &ChannelId) -> bool {
        match self {
            ChannelPolicy::Allow(list) => matches_any(list, port_id, channel_id),
            ChannelPolicy::Deny(list) => !matches_any(list, port_id, channel_id),
            ChannelPolicy::AllowAll => true,
        }
    }
}

fn matches_any(list: &[ChannelMatch], port_id: &PortId, channel_id: &ChannelId) -> bool {
    list.iter().any(|m| m.matches(port_id, channel_id))
}

/// One filter entry: a port pattern paired with a channel pattern. The
/// serde form is the two patterns as a pair.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelMatch(pub Pattern, pub Pattern);

impl ChannelMatch {
    pub fn matches(&self, port_id: &PortId, channel_id: &ChannelId) -> bool {
        self.0.matches(port_id.as_str()) && self.1.matches(channel_id.as_str())
    }
}

impl Display for ChannelMatch {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        write!(f, "{}/{}", self.0, self.1)
    }
}

/// A port or channel pattern. Without a `*` it matches one identifier
/// exactly; with one, each `*` matches any run of characters.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Pattern {
    text: String,
    // Compiled form, present only for globs.
    regex: Option<regex::Regex>,
}

impl Pattern {
    pub fn new(text: impl Into<String>) -> Result<Self, regex::Error> {
        let text = text.into();
        let regex = if text.contains('*') {
            let escaped = regex::escape(&text).replace("\\*", ".*");
            Some(format!("^{escaped}$").parse()?)
        } else {
            None
        };
        Ok(Self { text, regex })
    }

    pub fn matches(&self, value: &str) -> bool {
        match &self.regex {
            Some(regex) => regex.is_match(value),
            None => self.text == value,
        }
    }

    /// Whether the pattern contains a wildcard.
    pub fn is_glob(&self) -> bool {
        self.regex.is_some()
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }
}

// Two patterns are the same filter iff they were written the same way.
impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.text == other.text
    }
}

impl Eq for Pattern {}

impl Display for Pattern {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        write!(f, "{}", self.text)
    }
}

impl FromStr for Pattern {
    type Err = regex::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Pattern::new(s)
    }
}

impl TryFrom<String> for Pattern {
    type Error = regex::Error;

    fn try_from(text: String) -> Result<Self, Self::Error> {
        Pattern::new(text)
    }
}

impl From<Pattern> for String {
    fn from(pattern: Pattern) -> String {
        pattern.text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_literals_and_globs() {
        let literal = Pattern::new("transfer").unwrap();
        assert!(!literal.is_glob());
        assert!(literal.matches("transfer"));
        assert!(!literal.matches("transfers"));

        let glob = Pattern::new("ica*").unwrap();
        assert!(glob.is_glob());
        assert!(glob.matches("ica-host"));
        assert!(glob.matches("ica"));
        assert!(!glob.matches("transfer"));

        // Regex metacharacters in the written form stay literal.
        let dotted = Pattern::new("a.b*").unwrap();
        assert!(dotted.matches("a.b-1"));
        assert!(!dotted.matches("axb-1"));
    }

    #[test]
    fn allow_policy_from_toml() {
        let toml_content = r#"
            policy = 'allow'
            list = [
              ['ica*', '*'],
              ['transfer', 'channel-0'],
            ]
            "#;

        let policy: ChannelPolicy =
            toml::from_str(toml_content).expect("could not parse filter policy");

        assert!(policy.is_allowed(&PortId::new("transfer"), &ChannelId::new("channel-0")));
        assert!(policy.is_allowed(&PortId::new("ica-host"), &ChannelId::new("channel-9")));
        assert!(!policy.is_allowed(&PortId::new("transfer"), &ChannelId::new("channel-1")));
    }

    #[test]
    fn deny_policy_inverts_matches() {
        let toml_content = r#"
            policy = 'deny'
            list = [
              ['transfer', 'channel-0'],
            ]
            "#;

        let policy: ChannelPolicy =
            toml::from_str(toml_content).expect("could not parse filter policy");

        assert!(!policy.is_allowed(&PortId::new("transfer"), &ChannelId::new("channel-0")));
        assert!(policy.is_allowed(&PortId::new("transfer"), &ChannelId::new("channel-1")));
    }

    #[test]
    fn policy_round_trips_through_toml() {
        let policy = ChannelPolicy::Allow(vec![
            ChannelMatch(
                Pattern::new("transfer").unwrap(),
                Pattern::new("channel-0").unwrap(),
            ),
            ChannelMatch(Pattern::new("ica*").unwrap(), Pattern::new("*").unwrap()),
        ]);

        let toml_str = toml::to_string_pretty(&policy).expect("could not serialize filter");
        let back: ChannelPolicy = toml::from_str(&toml_str).expect("could not parse back");

        assert!(back.is_allowed(&PortId::new("ica-controller"), &ChannelId::new("channel-3")));
        assert!(!back.is_allowed(&PortId::new("transfer"), &ChannelId::new("channel-5")));
    }

    #[test]
    fn channel_match_displays_as_port_slash_channel() {
        let entry = ChannelMatch(
            Pattern::new("transfer").unwrap(),
            Pattern::new("channel-*").unwrap(),
        );
        assert_eq!(entry.to_string(), "transfer/channel-*");
    }
}
