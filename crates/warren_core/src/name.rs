//! Agent naming and addressing.
//!
//! An agent is identified by `(class, name)`. Class names are normalized to
//! kebab-case for URL routing; instance names are opaque UTF-8. The pair
//! derives a deterministic identifier used as the store filename.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Normalize a class name to its kebab-case routing form.
///
/// A `-` is inserted before an uppercase letter that follows a lowercase
/// letter or digit; runs of `_` (and `-`) collapse to a single `-`;
/// trailing separators are dropped. The conversion is idempotent.
pub fn kebab_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    let mut prev: Option<char> = None;

    for ch in name.chars() {
        if ch == '_' || ch == '-' {
            if !out.is_empty() && !out.ends_with('-') {
                out.push('-');
            }
            prev = Some('-');
            continue;
        }
        if ch.is_ascii_uppercase() {
            if let Some(p) = prev {
                if p.is_ascii_lowercase() || p.is_ascii_digit() {
                    out.push('-');
                }
            }
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push(ch);
        }
        prev = Some(ch);
    }

    while out.ends_with('-') {
        out.pop();
    }
    out
}

/// The `(class, name)` identity of an agent instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentAddress {
    /// Kebab-case class segment.
    pub class: String,
    /// Opaque instance name.
    pub name: String,
}

impl AgentAddress {
    /// Build an address, normalizing the class segment.
    pub fn new(class: impl AsRef<str>, name: impl Into<String>) -> Self {
        Self {
            class: kebab_case(class.as_ref()),
            name: name.into(),
        }
    }

    /// Deterministic identifier derived from `(class, name)`.
    ///
    /// Stable across restarts and hosts; doubles as the store filename so
    /// arbitrary instance names never reach the filesystem.
    pub fn ident(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.class.as_bytes());
        hasher.update([0x1f]);
        hasher.update(self.name.as_bytes());
        let digest = hasher.finalize();
        hex_prefix(&digest, 16)
    }

    /// Path of this agent's database under the runtime data directory.
    pub fn db_path(&self, data_dir: &Path) -> PathBuf {
        data_dir.join(&self.class).join(format!("{}.db", self.ident()))
    }

    /// Registry key, unique per instance.
    pub(crate) fn key(&self) -> String {
        format!("{}/{}", self.class, self.name)
    }
}

impl std::fmt::Display for AgentAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.class, self.name)
    }
}

fn hex_prefix(bytes: &[u8], n: usize) -> String {
    bytes
        .iter()
        .take(n)
        .map(|b| format!("{b:02x}"))
        .collect::<String>()
}
