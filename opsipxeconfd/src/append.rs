//! The ordered `key[=value]` bag that becomes the bootloader command line.

use std::fmt;

use crate::types::Confidential;

/// One value in an [`AppendBag`].
///
/// An empty value renders as a bare flag (`key` instead of `key=value`).
/// Confidential values render normally into the pipe payload but are masked
/// by every `Display`/`Debug` path.
#[derive(Clone, PartialEq, Eq)]
pub struct AppendValue {
    raw: String,
    confidential: bool,
}

impl AppendValue {
    pub fn plain(raw: impl Into<String>) -> Self {
        Self {
            raw: raw.into(),
            confidential: false,
        }
    }

    pub fn confidential(raw: Confidential) -> Self {
        Self {
            raw: raw.expose().to_string(),
            confidential: true,
        }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    pub fn is_confidential(&self) -> bool {
        self.confidential
    }
}

impl fmt::Debug for AppendValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.confidential {
            write!(f, "***confidential***")
        } else {
            write!(f, "{:?}", self.raw)
        }
    }
}

/// Ordered mapping from append key to value.
///
/// Keys keep the position of their first insertion; re-inserting an existing
/// key replaces the value in place. This is what makes the rendered `append`
/// line stable across merges.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct AppendBag {
    entries: Vec<(String, AppendValue)>,
}

impl AppendBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, key: &str) -> Option<&AppendValue> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Insert or replace; an existing key keeps its position.
    pub fn insert(&mut self, key: impl Into<String>, value: AppendValue) {
        let key = key.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => *slot = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn insert_plain(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.insert(key, AppendValue::plain(value));
    }

    /// Insert a bare flag (`key` with no `=value`).
    pub fn insert_flag(&mut self, key: impl Into<String>) {
        self.insert(key, AppendValue::plain(""));
    }

    pub fn remove(&mut self, key: &str) -> Option<AppendValue> {
        let idx = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(idx).1)
    }

    /// Merge `other` over `self`: `other` wins on key collision, colliding
    /// keys keep their position in `self`, new keys append in `other`'s order.
    pub fn merge(&mut self, other: &AppendBag) {
        for (key, value) in &other.entries {
            self.insert(key.clone(), value.clone());
        }
    }

    /// Parse whitespace-separated `key` / `key=value` tokens.
    ///
    /// `normalise` lower-cases and trims keys and trims values, the treatment
    /// applied to `opsi-linux-bootimage.append` config states.
    pub fn parse_tokens(input: &str, normalise: bool) -> Self {
        let mut bag = Self::new();
        for token in input.split_whitespace() {
            let (key, value) = match token.split_once('=') {
                Some((k, v)) => (k, v),
                None => (token, ""),
            };
            if normalise {
                bag.insert_plain(key.trim().to_ascii_lowercase(), value.trim());
            } else {
                bag.insert_plain(key, value);
            }
        }
        bag
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &AppendValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Render as the space-separated token list of an `append` line,
    /// with confidential values in the clear.
    pub fn to_line(&self) -> String {
        let mut tokens = Vec::with_capacity(self.entries.len());
        for (key, value) in &self.entries {
            if value.is_empty() {
                tokens.push(key.clone());
            } else {
                tokens.push(format!("{}={}", key, value.raw()));
            }
        }
        tokens.join(" ")
    }
}

impl fmt::Display for AppendBag {
    /// Loggable form: confidential values are masked.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (key, value) in &self.entries {
            if !first {
                write!(f, " ")?;
            }
            first = false;
            if value.is_confidential() {
                write!(f, "{}=***confidential***", key)?;
            } else if value.is_empty() {
                write!(f, "{}", key)?;
            } else {
                write!(f, "{}={}", key, value.raw())?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for AppendBag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AppendBag({})", self)
    }
}
