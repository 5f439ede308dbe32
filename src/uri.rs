//! Pairing URI
//!
//! The out-of-band channel that boots the protocol:
//! `wc:{topic}@{version}?controller={0|1}&publicKey={hex}&relay={urlenc-JSON}`.
//! A responder scans or pastes this, parses it back into a pairing proposal
//! and responds on the embedded topic.

use url::Url;

use crate::error::{Error, Result};
use crate::sequence::types::Relay;
use crate::Topic;

/// Protocol version carried in the URI
pub const URI_VERSION: u32 = 2;

/// The decoded fields of a pairing URI
#[derive(Clone, Debug, PartialEq)]
pub struct ProposalUri {
    /// Proposal topic
    pub topic: Topic,
    /// Protocol version
    pub version: u32,
    /// The proposer's controller claim
    pub controller: bool,
    /// The proposer's public key, hex-encoded
    pub public_key: String,
    /// Relay descriptor
    pub relay: Relay,
}

impl ProposalUri {
    /// Render as a `wc:` URI
    pub fn format(&self) -> Result<String> {
        let relay_json = serde_json::to_string(&self.relay)?;
        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("controller", if self.controller { "1" } else { "0" })
            .append_pair("publicKey", &self.public_key)
            .append_pair("relay", &relay_json)
            .finish();
        Ok(format!("wc:{}@{}?{}", self.topic, self.version, query))
    }

    /// Parse a `wc:` URI
    pub fn parse(uri: &str) -> Result<Self> {
        let url = Url::parse(uri).map_err(|_| invalid("uri"))?;
        if url.scheme() != "wc" {
            return Err(invalid("uri scheme"));
        }

        let (topic, version) = url.path().split_once('@').ok_or_else(|| invalid("uri version"))?;
        if topic.is_empty() || hex::decode(topic).is_err() {
            return Err(invalid("topic"));
        }
        let version: u32 = version.parse().map_err(|_| invalid("uri version"))?;

        let mut controller = None;
        let mut public_key = None;
        let mut relay = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "controller" => {
                    controller = Some(match value.as_ref() {
                        "1" => true,
                        "0" => false,
                        _ => return Err(invalid("controller")),
                    })
                }
                "publicKey" => {
                    if hex::decode(value.as_bytes()).is_err() {
                        return Err(invalid("publicKey"));
                    }
                    public_key = Some(value.into_owned());
                }
                "relay" => {
                    relay = Some(serde_json::from_str(&value).map_err(|_| invalid("relay"))?)
                }
                _ => {}
            }
        }

        Ok(ProposalUri {
            topic: topic.to_string(),
            version,
            controller: controller.ok_or_else(|| invalid("controller"))?,
            public_key: public_key.ok_or_else(|| invalid("publicKey"))?,
            relay: relay.ok_or_else(|| invalid("relay"))?,
        })
    }
}

fn invalid(field: &str) -> Error {
    Error::MissingOrInvalid {
        field: field.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ProposalUri {
        ProposalUri {
            topic: "aa".repeat(32),
            version: URI_VERSION,
            controller: false,
            public_key: "bb".repeat(32),
            relay: Relay::default(),
        }
    }

    #[test]
    fn test_roundtrip() {
        let uri = sample();
        let text = uri.format().unwrap();
        assert!(text.starts_with("wc:"));
        assert!(text.contains("@2?"));

        let parsed = ProposalUri::parse(&text).unwrap();
        assert_eq!(parsed, uri);
    }

    #[test]
    fn test_relay_json_is_percent_encoded() {
        let text = sample().format().unwrap();
        // The relay JSON braces must not appear raw in the query.
        let query = text.split('?').nth(1).unwrap();
        assert!(!query.contains('{'));
        assert!(query.contains("relay=%7B"));
    }

    #[test]
    fn test_rejects_wrong_scheme() {
        assert!(ProposalUri::parse("http://example.com").is_err());
    }

    #[test]
    fn test_rejects_missing_fields() {
        let uri = format!("wc:{}@2?controller=1", "aa".repeat(32));
        assert!(matches!(
            ProposalUri::parse(&uri),
            Err(Error::MissingOrInvalid { .. })
        ));
    }

    #[test]
    fn test_rejects_bad_controller_flag() {
        let uri = format!(
            "wc:{}@2?controller=yes&publicKey={}&relay=%7B%22protocol%22%3A%22waku%22%7D",
            "aa".repeat(32),
            "bb".repeat(32)
        );
        assert!(ProposalUri::parse(&uri).is_err());
    }
}
