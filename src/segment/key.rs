use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};

const NAME_LABEL: &str = "__name__";

/// Errors produced when parsing a segment key.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseKeyError {
    /// The key has no application name.
    #[error("application name is required")]
    AppNameRequired,

    /// The application name contains a character that is not allowed.
    #[error("invalid application name `{0}`")]
    InvalidAppName(String),

    /// A label has no key.
    #[error("tag key is required")]
    TagKeyRequired,

    /// A label key contains a character that is not allowed.
    #[error("invalid tag key `{0}`")]
    InvalidTagKey(String),

    /// A label key is reserved for internal use.
    #[error("tag key `{0}` is reserved")]
    TagKeyReserved(String),

    /// The label set is not closed.
    #[error("unexpected end of key, expected `}}`")]
    Unterminated,

    /// Something follows the closing `}`.
    #[error("unexpected `{0}` after the label set")]
    TrailingInput(String),
}

/// The identity of a segment: an application name plus a set of labels, written as
/// `app.name{env=prod,region=eu}`.
///
/// Labels are kept sorted, so two keys with the same labels in a different order are equal and
/// normalize to the same string.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key {
    labels: BTreeMap<String, String>,
}

fn is_tag_key_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '.'
}

fn is_app_name_char(c: char) -> bool {
    is_tag_key_char(c) || c == '-' || c == '/'
}

fn check_tag_key(k: &str) -> Result<(), ParseKeyError> {
    if k.is_empty() {
        return Err(ParseKeyError::TagKeyRequired);
    }
    if k == NAME_LABEL {
        return Err(ParseKeyError::TagKeyReserved(k.to_string()));
    }
    if !k.chars().all(is_tag_key_char) {
        return Err(ParseKeyError::InvalidTagKey(k.to_string()));
    }
    Ok(())
}

fn check_app_name(name: &str) -> Result<(), ParseKeyError> {
    if name.is_empty() {
        return Err(ParseKeyError::AppNameRequired);
    }
    if !name.chars().all(is_app_name_char) {
        return Err(ParseKeyError::InvalidAppName(name.to_string()));
    }
    Ok(())
}

impl Key {
    /// A key made of `labels`; the application name goes under `__name__`.
    pub fn new(labels: BTreeMap<String, String>) -> Self {
        Key { labels }
    }

    /// Parses `name{key=value,...}`. The label set is optional and whitespace around names,
    /// keys and values is ignored.
    pub fn parse(s: &str) -> Result<Self, ParseKeyError> {
        let (name, rest) = match s.find('{') {
            Some(i) => (&s[..i], Some(&s[i + 1..])),
            None => (s, None),
        };
        let name = name.trim();
        check_app_name(name)?;

        let mut labels = BTreeMap::new();
        labels.insert(NAME_LABEL.to_string(), name.to_string());

        let rest = match rest {
            Some(rest) => rest,
            None => return Ok(Key { labels }),
        };
        let close = rest.find('}').ok_or(ParseKeyError::Unterminated)?;
        let trailing = rest[close + 1..].trim();
        if !trailing.is_empty() {
            return Err(ParseKeyError::TrailingInput(trailing.to_string()));
        }

        for pair in rest[..close].split(',') {
            if pair.trim().is_empty() {
                continue;
            }
            let (k, v) = match pair.find('=') {
                Some(i) => (pair[..i].trim(), pair[i + 1..].trim()),
                None => (pair.trim(), ""),
            };
            check_tag_key(k)?;
            labels.insert(k.to_string(), v.to_string());
        }
        Ok(Key { labels })
    }

    /// The application name, or `""` if the key has none.
    pub fn app_name(&self) -> &str {
        self.labels.get(NAME_LABEL).map_or("", String::as_str)
    }

    /// All labels, the application name included.
    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }

    /// Sets label `k` to `v`.
    pub fn add(&mut self, k: impl Into<String>, v: impl Into<String>) {
        self.labels.insert(k.into(), v.into());
    }

    /// The canonical form: the application name followed by the remaining labels, sorted.
    pub fn normalized(&self) -> String {
        let mut s = String::from(self.app_name());
        s.push('{');
        let mut first = true;
        for (k, v) in self.labels.iter().filter(|(k, _)| *k != NAME_LABEL) {
            if !first {
                s.push(',');
            }
            first = false;
            s.push_str(k);
            s.push('=');
            s.push_str(v);
        }
        s.push('}');
        s
    }

    /// The key a segment is stored under.
    pub fn segment_key(&self) -> String {
        self.normalized()
    }

    /// The key of the profile data attached to the segment node at `(depth, t)`.
    pub fn tree_key(&self, depth: usize, t: DateTime<Utc>) -> String {
        segment_key_to_tree_key(&self.segment_key(), depth, t)
    }
}

pub(crate) fn segment_key_to_tree_key(segment_key: &str, depth: usize, t: DateTime<Utc>) -> String {
    let mut buf = itoa::Buffer::new();
    let mut key = String::with_capacity(segment_key.len() + 24);
    key.push_str(segment_key);
    key.push(':');
    key.push_str(buf.format(depth));
    key.push(':');
    key.push_str(buf.format(t.timestamp()));
    key
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.normalized())
    }
}

impl FromStr for Key {
    type Err = ParseKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Key::parse(s)
    }
}
