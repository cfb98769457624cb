//! Flattened test parameter bags.
//!
//! Every layer of vt-grid is keyed by a flat string-to-string parameter bag:
//! test nodes expose one as their run recipe, state backends read their
//! policies from one, and the control door ships one to remote slots. Key
//! concepts:
//!
//! - **Bare key**: a plain parameter such as `get_state`.
//! - **Suffixed key**: an object-scoped override such as `get_state_vm1`,
//!   resolved by [`Params::object_params`].
//! - **Object list**: a whitespace-separated value such as `vms = "vm1 vm2"`,
//!   read by [`Params::objects`].
//!
//! # Invariants
//!
//! - Lookups never fall back silently: typed getters fail on malformed
//!   values instead of guessing.
//! - Suffix resolution keeps the suffixed keys in place, so repeated
//!   resolution over compound suffixes stays well-defined.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Parameter access and conversion errors.
#[derive(Debug, Error)]
pub enum ParamsError {
    /// A required key is absent.
    #[error("required parameter missing: {0}")]
    MissingKey(String),

    /// A boolean-typed parameter holds an unrecognized token.
    #[error("parameter {key} is not a boolean: {value:?}")]
    InvalidBoolean { key: String, value: String },

    /// A numeric-typed parameter does not parse as an integer.
    #[error("parameter {key} is not numeric: {value:?}")]
    InvalidNumeric { key: String, value: String },
}

/// A flat, ordered parameter bag.
///
/// Ordering is stable (sorted by key) so logs, payloads, and test
/// expectations are deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Params {
    entries: BTreeMap<String, String>,
}

impl Params {
    /// Create an empty bag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Look up a key, falling back to a default.
    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    /// Look up a key that must be present.
    pub fn require(&self, key: &str) -> Result<&str, ParamsError> {
        self.get(key)
            .ok_or_else(|| ParamsError::MissingKey(key.to_owned()))
    }

    /// Whether a key is present.
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Insert or replace a value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    /// Remove a key, returning its previous value.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.entries.remove(key)
    }

    /// Merge another bag into this one, overriding on collision.
    pub fn update(&mut self, other: &Params) {
        for (key, value) in &other.entries {
            self.entries.insert(key.clone(), value.clone());
        }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the bag holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over `(key, value)` pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Iterate over keys in order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Interpret a parameter as a boolean.
    ///
    /// Accepts `yes`/`no`, `true`/`false`, `on`/`off`, and `1`/`0` in any
    /// case; a missing key yields the default.
    pub fn get_boolean(&self, key: &str, default: bool) -> Result<bool, ParamsError> {
        let Some(value) = self.get(key) else {
            return Ok(default);
        };
        match value.to_ascii_lowercase().as_str() {
            "yes" | "true" | "on" | "1" => Ok(true),
            "no" | "false" | "off" | "0" => Ok(false),
            _ => Err(ParamsError::InvalidBoolean {
                key: key.to_owned(),
                value: value.to_owned(),
            }),
        }
    }

    /// Interpret a parameter as a signed integer.
    pub fn get_numeric(&self, key: &str, default: i64) -> Result<i64, ParamsError> {
        let Some(value) = self.get(key) else {
            return Ok(default);
        };
        value
            .trim()
            .parse::<i64>()
            .map_err(|_| ParamsError::InvalidNumeric {
                key: key.to_owned(),
                value: value.to_owned(),
            })
    }

    /// Split a parameter into a trimmed list on the given delimiter.
    ///
    /// A missing key or an empty value yields an empty list.
    pub fn get_list(&self, key: &str, delimiter: char) -> Vec<String> {
        match self.get(key) {
            None | Some("") => Vec::new(),
            Some(value) => value
                .split(delimiter)
                .map(str::trim)
                .filter(|entry| !entry.is_empty())
                .map(str::to_owned)
                .collect(),
        }
    }

    /// Split a parameter into the whitespace-separated object list.
    pub fn objects(&self, key: &str) -> Vec<String> {
        match self.get(key) {
            None => Vec::new(),
            Some(value) => value.split_whitespace().map(str::to_owned).collect(),
        }
    }

    /// Resolve one object suffix: keys ending in `_<suffix>` override their
    /// bare counterpart. Both spellings stay present afterwards so a further
    /// resolution pass over a compound suffix keeps working.
    pub fn object_params(&self, suffix: &str) -> Params {
        let marker = format!("_{suffix}");
        let mut resolved = self.clone();
        for (key, value) in &self.entries {
            if let Some(bare) = key.strip_suffix(&marker) {
                if !bare.is_empty() {
                    resolved.entries.insert(bare.to_owned(), value.clone());
                }
            }
        }
        resolved
    }
}

impl FromIterator<(String, String)> for Params {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Params {
            entries: iter.into_iter().collect(),
        }
    }
}

impl From<BTreeMap<String, String>> for Params {
    fn from(entries: BTreeMap<String, String>) -> Self {
        Params { entries }
    }
}

impl IntoIterator for Params {
    type Item = (String, String);
    type IntoIter = std::collections::btree_map::IntoIter<String, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// Build a [`Params`] bag from string literals.
///
/// ```
/// use vtgrid_params::params;
///
/// let p = params! {
///     "vms" => "vm1 vm2",
///     "get_state_vm1" => "launch",
/// };
/// assert_eq!(p.get("vms"), Some("vm1 vm2"));
/// ```
#[macro_export]
macro_rules! params {
    () => { $crate::Params::new() };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut bag = $crate::Params::new();
        $(bag.insert($key, $value);)+
        bag
    }};
}
