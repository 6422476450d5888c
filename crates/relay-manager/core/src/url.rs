use core::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::RelayError;

const SECURE_SCHEME: &str = "wss://";
const KNOWN_SCHEMES: [&str; 4] = ["wss://", "ws://", "https://", "http://"];

/// A normalized relay address.
///
/// Two inputs that differ only in scheme (`ws://`, `wss://`, or none), scheme or
/// host case, or trailing slashes produce the same `RelayUrl`. The scheme is
/// always `wss://`, the host is lowercased and a root path is dropped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelayUrl(String);

impl RelayUrl {
    pub fn parse(input: &str) -> Result<Self, RelayError> {
        normalize(input).map(Self)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Normalizes a relay address into its canonical `wss://host[:port][/path]` form.
pub fn normalize(input: &str) -> Result<String, RelayError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(RelayError::InvalidUrl(input.to_string()));
    }

    let without_scheme = KNOWN_SCHEMES
        .iter()
        .find_map(|scheme| strip_prefix_ignore_case(trimmed, scheme))
        .unwrap_or(trimmed);

    let (authority, path) = match without_scheme.find('/') {
        Some(idx) => without_scheme.split_at(idx),
        None => (without_scheme, ""),
    };

    let host = authority.to_ascii_lowercase();
    if host.is_empty()
        || host.starts_with(':')
        || host.contains("://")
        || host.chars().any(|c| c.is_whitespace() || c == '@')
    {
        return Err(RelayError::InvalidUrl(input.to_string()));
    }

    let path = path.trim_end_matches('/');
    Ok(format!("{SECURE_SCHEME}{host}{path}"))
}

fn strip_prefix_ignore_case<'a>(value: &'a str, prefix: &str) -> Option<&'a str> {
    let head = value.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix)
        .then(|| &value[prefix.len()..])
}

impl fmt::Display for RelayUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RelayUrl {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for RelayUrl {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&RelayUrl> for nostr::RelayUrl {
    type Error = RelayError;

    fn try_from(value: &RelayUrl) -> Result<Self, Self::Error> {
        nostr::RelayUrl::parse(value.as_str())
            .map_err(|e| RelayError::InvalidUrl(format!("{value}: {e}")))
    }
}

impl Serialize for RelayUrl {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for RelayUrl {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        RelayUrl::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_host_gets_secure_scheme() {
        let url = RelayUrl::parse("relay.example.com").unwrap();
        assert_eq!(url.as_str(), "wss://relay.example.com");
    }

    #[test]
    fn test_equivalent_forms_normalize_identically() {
        let forms = [
            "wss://relay.example.com",
            "wss://relay.example.com/",
            "ws://relay.example.com",
            "WSS://Relay.Example.com//",
            "Ws://RELAY.example.COM/",
            "  relay.example.com  ",
        ];
        for form in forms {
            assert_eq!(
                normalize(form).unwrap(),
                "wss://relay.example.com",
                "form {form} did not normalize"
            );
        }
    }

    #[test]
    fn test_path_and_port_are_kept() {
        assert_eq!(
            normalize("wss://Relay.Example.com:4848/Nostr/").unwrap(),
            "wss://relay.example.com:4848/Nostr"
        );
        assert_eq!(
            RelayUrl::parse("jskitty.cat/nostr").unwrap().as_str(),
            "wss://jskitty.cat/nostr"
        );
    }

    #[test]
    fn test_invalid_inputs_are_rejected() {
        for input in ["", "   ", "wss://", "wss:///path", "wss://user@host", "wss://a b"] {
            assert!(
                matches!(normalize(input), Err(RelayError::InvalidUrl(_))),
                "{input:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_serde_normalizes_on_read() {
        let urls: Vec<RelayUrl> =
            serde_json::from_str(r#"["ws://Relay.Damus.io/", "nos.lol"]"#).unwrap();
        assert_eq!(urls[0].as_str(), "wss://relay.damus.io");
        assert_eq!(urls[1].as_str(), "wss://nos.lol");
        assert_eq!(
            serde_json::to_string(&urls[0]).unwrap(),
            r#""wss://relay.damus.io""#
        );
    }

    #[test]
    fn test_converts_into_nostr_relay_url() {
        let url = RelayUrl::parse("relay.primal.net").unwrap();
        let nostr_url = nostr::RelayUrl::try_from(&url).unwrap();
        assert_eq!(
            nostr_url.as_str().trim_end_matches('/'),
            "wss://relay.primal.net"
        );
    }
}
