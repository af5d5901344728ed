//! One-line coordinator descriptors, e.g.
//! `name=Example&network=main&coordinatorUri=https://example.org/&absoluteMinInputCount=21&readMore=https://example.org/about`.
//!
//! Values escape `%`, `&`, `=` and whitespace as `%XX`. Unknown keys are
//! kept in order so a descriptor written by a newer client survives a
//! parse and print unchanged.

use crate::core::types::Network;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DescriptorError {
    #[error("missing required field '{0}'")]
    MissingField(&'static str),
    #[error("'{0}' is not a key=value pair")]
    MalformedPair(String),
    #[error("field '{0}' appears twice")]
    DuplicateField(String),
    #[error("invalid value '{value}' for '{field}'")]
    InvalidValue { field: String, value: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CoordinatorDescriptor {
    pub name: String,
    pub network: Network,
    pub coordinator_uri: String,
    pub absolute_min_input_count: usize,
    pub read_more: String,
    /// Parts per million.
    pub coordination_fee_rate: Option<u32>,
    pub min_input_count: Option<usize>,
    pub extra: Vec<(String, String)>,
}

const NAME: &str = "name";
const NETWORK: &str = "network";
const COORDINATOR_URI: &str = "coordinatorUri";
const ABSOLUTE_MIN_INPUT_COUNT: &str = "absoluteMinInputCount";
const READ_MORE: &str = "readMore";
const COORDINATION_FEE_RATE: &str = "coordinationFeeRate";
const MIN_INPUT_COUNT: &str = "minInputCount";

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '%' | '&' | '=' | '+' => out.push_str(&format!("%{:02X}", c as u32)),
            c if c.is_ascii_whitespace() => out.push_str(&format!("%{:02X}", c as u32)),
            c => out.push(c),
        }
    }
    out
}

fn unescape(value: &str) -> Option<String> {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = value.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

fn parse_field<T: FromStr>(field: &str, value: &str) -> Result<T, DescriptorError> {
    value.parse().map_err(|_| DescriptorError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
    })
}

impl CoordinatorDescriptor {
    pub fn parse(s: &str) -> Result<Self, DescriptorError> {
        let mut pairs: Vec<(String, String)> = Vec::new();
        for part in s.trim().split('&').filter(|p| !p.is_empty()) {
            let (key, raw) = part
                .split_once('=')
                .ok_or_else(|| DescriptorError::MalformedPair(part.to_string()))?;
            let value = unescape(raw).ok_or_else(|| DescriptorError::InvalidValue {
                field: key.to_string(),
                value: raw.to_string(),
            })?;
            if pairs.iter().any(|(k, _)| k == key) {
                return Err(DescriptorError::DuplicateField(key.to_string()));
            }
            pairs.push((key.to_string(), value));
        }

        let mut take = |key: &'static str| -> Option<String> {
            let pos = pairs.iter().position(|(k, _)| k == key)?;
            Some(pairs.remove(pos).1)
        };
        let name = take(NAME).ok_or(DescriptorError::MissingField(NAME))?;
        let network = take(NETWORK).ok_or(DescriptorError::MissingField(NETWORK))?;
        let coordinator_uri = take(COORDINATOR_URI).ok_or(DescriptorError::MissingField(COORDINATOR_URI))?;
        let absolute_min_input_count =
            take(ABSOLUTE_MIN_INPUT_COUNT).ok_or(DescriptorError::MissingField(ABSOLUTE_MIN_INPUT_COUNT))?;
        let read_more = take(READ_MORE).ok_or(DescriptorError::MissingField(READ_MORE))?;
        let coordination_fee_rate = take(COORDINATION_FEE_RATE);
        let min_input_count = take(MIN_INPUT_COUNT);

        if name.is_empty() {
            return Err(DescriptorError::MissingField(NAME));
        }
        if coordinator_uri.is_empty() {
            return Err(DescriptorError::MissingField(COORDINATOR_URI));
        }

        Ok(Self {
            name,
            network: parse_field(NETWORK, &network)?,
            coordinator_uri,
            absolute_min_input_count: parse_field(ABSOLUTE_MIN_INPUT_COUNT, &absolute_min_input_count)?,
            read_more,
            coordination_fee_rate: coordination_fee_rate
                .map(|v| parse_field(COORDINATION_FEE_RATE, &v))
                .transpose()?,
            min_input_count: min_input_count
                .map(|v| parse_field(MIN_INPUT_COUNT, &v))
                .transpose()?,
            extra: pairs,
        })
    }
}

impl FromStr for CoordinatorDescriptor {
    type Err = DescriptorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CoordinatorDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut fields = vec![
            (NAME.to_string(), self.name.clone()),
            (NETWORK.to_string(), self.network.to_string()),
            (COORDINATOR_URI.to_string(), self.coordinator_uri.clone()),
            (ABSOLUTE_MIN_INPUT_COUNT.to_string(), self.absolute_min_input_count.to_string()),
            (READ_MORE.to_string(), self.read_more.clone()),
        ];
        if let Some(rate) = self.coordination_fee_rate {
            fields.push((COORDINATION_FEE_RATE.to_string(), rate.to_string()));
        }
        if let Some(n) = self.min_input_count {
            fields.push((MIN_INPUT_COUNT.to_string(), n.to_string()));
        }
        fields.extend(self.extra.iter().cloned());
        let line = fields
            .iter()
            .map(|(k, v)| format!("{}={}", k, escape(v)))
            .collect::<Vec<_>>()
            .join("&");
        f.write_str(&line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "name=Example Coordinator&network=main&coordinatorUri=https://coinjoin.example.org/&absoluteMinInputCount=21&readMore=https://example.org/about?a=1&b=2";

    fn sample() -> CoordinatorDescriptor {
        CoordinatorDescriptor {
            name: "Example Coordinator".into(),
            network: Network::Main,
            coordinator_uri: "https://coinjoin.example.org/".into(),
            absolute_min_input_count: 21,
            read_more: "https://example.org/about?a=1&b=2".into(),
            coordination_fee_rate: Some(3000),
            min_input_count: None,
            extra: vec![("contact".into(), "ops@example.org".into())],
        }
    }

    #[test]
    fn print_then_parse_is_lossless() {
        let d = sample();
        let line = d.to_string();
        assert!(!line.contains(' '));
        assert_eq!(CoordinatorDescriptor::parse(&line).unwrap(), d);
    }

    #[test]
    fn every_required_field_is_enforced() {
        let line = sample().to_string();
        for field in [NAME, NETWORK, COORDINATOR_URI, ABSOLUTE_MIN_INPUT_COUNT, READ_MORE] {
            let without: Vec<&str> = line
                .split('&')
                .filter(|p| !p.starts_with(&format!("{}=", field)))
                .collect();
            assert_eq!(
                CoordinatorDescriptor::parse(&without.join("&")),
                Err(DescriptorError::MissingField(field))
            );
        }
    }

    #[test]
    fn raw_ampersand_splits_the_value() {
        let parsed = CoordinatorDescriptor::parse(SAMPLE).unwrap();
        assert_eq!(parsed.read_more, "https://example.org/about?a=1");
        assert_eq!(parsed.extra, vec![("b".to_string(), "2".to_string())]);
    }

    #[test]
    fn bad_values_are_reported() {
        let line = sample().to_string().replace("absoluteMinInputCount=21", "absoluteMinInputCount=lots");
        assert!(matches!(
            CoordinatorDescriptor::parse(&line),
            Err(DescriptorError::InvalidValue { .. })
        ));
        assert!(matches!(
            CoordinatorDescriptor::parse("name"),
            Err(DescriptorError::MalformedPair(_))
        ));
    }
}
