use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::OnceLock;

/// Per-message identifier allocated by the store's UID sequence
pub type Uid = u64;

/// Backend-native document identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DocId(pub u64);

impl DocId {
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl From<u64> for DocId {
    fn from(id: u64) -> Self {
        DocId(id)
    }
}

/// Everything a backend needs to register one message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailData {
    pub uid: Uid,
    pub text: String,
    pub attributes: BTreeMap<String, String>,
    pub flags: String,
}

impl MailData {
    pub fn new(uid: Uid, text: impl Into<String>) -> Self {
        MailData {
            uid,
            text: text.into(),
            attributes: BTreeMap::new(),
            flags: String::new(),
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn with_flags(mut self, flags: impl Into<String>) -> Self {
        self.flags = flags.into();
        self
    }
}

/// Join flags as `<flag1><flag2>` for the denormalized flags attribute
pub fn encode_flags(flags: &str) -> String {
    let words: Vec<&str> = flags.split_whitespace().collect();
    if words.is_empty() {
        return String::new();
    }
    format!("<{}>", words.join("><"))
}

/// Render a `<flag1><flag2>` attribute back to space-joined words
pub fn decode_flags(encoded: &str) -> String {
    static FLAG_PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = FLAG_PATTERN.get_or_init(|| Regex::new(r"<([^<>]*)>").expect("flag pattern"));
    pattern
        .captures_iter(encoded)
        .map(|c| c[1].to_string())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}
