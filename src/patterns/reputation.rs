//! Known mixing-service addresses.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;

/// Source of address reputation used by the risk scorer.
pub trait AddressReputation: Send + Sync {
    /// Whether the address belongs to a known mixing service.
    fn is_known_mixer(&self, address: &str) -> bool;
}

/// Deny/allow lists; an allow-listed address is never flagged.
#[derive(Debug, Clone, Default)]
pub struct AddressList {
    deny: HashSet<String>,
    allow: HashSet<String>,
}

impl AddressList {
    pub fn new<D, A>(deny: D, allow: A) -> Self
    where
        D: IntoIterator,
        D::Item: Into<String>,
        A: IntoIterator,
        A::Item: Into<String>,
    {
        Self {
            deny: deny.into_iter().map(Into::into).collect(),
            allow: allow.into_iter().map(Into::into).collect(),
        }
    }

    /// Load lists from text files: one address per line, `#` starts a comment.
    pub fn load(deny_path: Option<&str>, allow_path: Option<&str>) -> Result<Self> {
        let deny = match deny_path {
            Some(p) => read_list(p)?,
            None => HashSet::new(),
        };
        let allow = match allow_path {
            Some(p) => read_list(p)?,
            None => HashSet::new(),
        };
        info!(denied = deny.len(), allowed = allow.len(), "Address lists loaded");
        Ok(Self { deny, allow })
    }

    pub fn len(&self) -> usize {
        self.deny.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deny.is_empty()
    }
}

impl AddressReputation for AddressList {
    fn is_known_mixer(&self, address: &str) -> bool {
        self.deny.contains(address) && !self.allow.contains(address)
    }
}

fn read_list(path: impl AsRef<Path>) -> Result<HashSet<String>> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read address list: {}", path.display()))?;
    Ok(parse_list(&content))
}

fn parse_list(content: &str) -> HashSet<String> {
    content
        .lines()
        .map(|l| l.split('#').next().unwrap_or_default().trim())
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}
