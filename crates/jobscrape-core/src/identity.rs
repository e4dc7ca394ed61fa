//! Listing fingerprints used as the deduplication key.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Lowercase hex MD5 digest of a listing's canonical identity fields.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ListingIdentity(String);

impl ListingIdentity {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Wrap a digest read back from storage.
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }
}

impl fmt::Display for ListingIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fingerprint of the fields that make a listing unique: its title and its link.
pub fn listing_identity(title: Option<&str>, link: Option<&str>) -> ListingIdentity {
    let mut fields = BTreeMap::new();
    fields.insert("title", title);
    fields.insert("link", link);
    let canonical = canonical_json(&fields);
    ListingIdentity(hex::encode(md5::compute(canonical.as_bytes()).0))
}

/// Sorted-key JSON with `", "` / `": "` separators and ASCII-only output, so digests match rows
/// written by earlier deployments.
fn canonical_json(fields: &BTreeMap<&str, Option<&str>>) -> String {
    let body = fields
        .iter()
        .map(|(key, value)| {
            let value = value.map_or_else(|| "null".to_string(), json_string);
            format!("{}: {}", json_string(key), value)
        })
        .collect::<Vec<_>>()
        .join(", ");
    format!("{{{body}}}")
}

fn json_string(value: &str) -> String {
    let encoded = serde_json::to_string(value).unwrap_or_else(|_| "\"\"".to_string());
    let mut out = String::with_capacity(encoded.len());
    for ch in encoded.chars() {
        if ch.is_ascii() {
            out.push(ch);
        } else {
            let mut units = [0u16; 2];
            for unit in ch.encode_utf16(&mut units) {
                out.push_str(&format!("\\u{unit:04x}"));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_deterministic() {
        assert_eq!(
            listing_identity(Some("A"), Some("L")),
            listing_identity(Some("A"), Some("L"))
        );
        assert_ne!(
            listing_identity(Some("A"), Some("L")),
            listing_identity(Some("B"), Some("L"))
        );
    }

    #[test]
    fn digests_match_sorted_key_json_layout() {
        assert_eq!(
            listing_identity(Some("A"), Some("L")).as_str(),
            "b338684fea3238e1a06260b01dfd628e"
        );
        assert_eq!(
            listing_identity(Some("Senior Engineer"), Some("https://acme.example/jobs/42")).as_str(),
            "f77ce5787819e023bc844c9d81592d36"
        );
        assert_eq!(
            listing_identity(None, None).as_str(),
            "b03256e467fe87b1304cad7934169eb3"
        );
    }

    #[test]
    fn non_ascii_titles_are_escaped_before_hashing() {
        assert_eq!(
            listing_identity(Some("Café"), Some("x")).as_str(),
            "964ab93aa6752d4069957b4723de9e33"
        );
    }

    #[test]
    fn absent_and_empty_fields_differ() {
        assert_ne!(
            listing_identity(None, Some("L")),
            listing_identity(Some(""), Some("L"))
        );
        assert_eq!(listing_identity(None, Some("L")).as_str().len(), 32);
    }
}
