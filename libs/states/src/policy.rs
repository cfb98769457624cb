//! Mode strings steering the reaction of state operations.
//!
//! Every state operation carries a compact mode of two to four characters
//! out of the alphabet `a` (abort), `r` (reuse), `f` (force), and `i`
//! (ignore). The first two characters choose the reaction toward a
//! present and toward an absent state; the optional trailing pair does
//! the same for the object root, the object itself seen as a state.
//!
//! # Invariants
//! - Parsing validates length and alphabet only. Whether a character is
//!   legal for a particular branch is decided by the operation that
//!   consults it, at the branch actually taken.
//! - A missing root pair completes as reuse-on-present, abort-on-absent.

use std::fmt;

use crate::error::StateError;

/// One branch choice inside a mode string.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PolicyChar {
    /// End the current run over the encountered situation.
    Abort,
    /// Accept what is already there.
    Reuse,
    /// Make the wanted situation true, creating or destroying as needed.
    Force,
    /// Skip the object and carry on.
    Ignore,
}

impl PolicyChar {
    fn from_char(c: char) -> Option<Self> {
        match c {
            'a' => Some(PolicyChar::Abort),
            'r' => Some(PolicyChar::Reuse),
            'f' => Some(PolicyChar::Force),
            'i' => Some(PolicyChar::Ignore),
            _ => None,
        }
    }

    pub fn as_char(&self) -> char {
        match self {
            PolicyChar::Abort => 'a',
            PolicyChar::Reuse => 'r',
            PolicyChar::Force => 'f',
            PolicyChar::Ignore => 'i',
        }
    }
}

impl fmt::Display for PolicyChar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let word = match self {
            PolicyChar::Abort => "abort",
            PolicyChar::Reuse => "reuse",
            PolicyChar::Force => "force",
            PolicyChar::Ignore => "ignore",
        };
        f.write_str(word)
    }
}

/// A parsed operation mode.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModeString {
    source: String,
    chars: Vec<PolicyChar>,
}

impl ModeString {
    pub fn parse(mode: &str) -> Result<Self, StateError> {
        let chars: Vec<PolicyChar> = mode
            .chars()
            .map(PolicyChar::from_char)
            .collect::<Option<_>>()
            .ok_or_else(|| StateError::UnparsableMode {
                mode: mode.to_string(),
                reason: "allowed characters are a, r, f, and i",
            })?;
        if !(2..=4).contains(&chars.len()) {
            return Err(StateError::UnparsableMode {
                mode: mode.to_string(),
                reason: "expected two to four characters",
            });
        }
        Ok(ModeString {
            source: mode.to_string(),
            chars,
        })
    }

    /// Reaction toward a state that is already present.
    pub fn present(&self) -> PolicyChar {
        self.chars[0]
    }

    /// Reaction toward a state that is absent.
    pub fn absent(&self) -> PolicyChar {
        self.chars[1]
    }

    /// Reaction toward a present object root.
    pub fn root_present(&self) -> PolicyChar {
        self.chars.get(2).copied().unwrap_or(PolicyChar::Reuse)
    }

    /// Reaction toward an absent object root.
    pub fn root_absent(&self) -> PolicyChar {
        self.chars.get(3).copied().unwrap_or(PolicyChar::Abort)
    }

    /// The root pair rendered as its own two-character mode, suitable for
    /// passing down to a nested existence probe.
    pub fn root_mode(&self) -> ModeString {
        let chars = vec![self.root_present(), self.root_absent()];
        let source = chars.iter().map(PolicyChar::as_char).collect();
        ModeString { source, chars }
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl fmt::Display for ModeString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}
