//! Deterministic cache key construction

use crate::cache::types::CacheKey;
use std::collections::BTreeMap;
use std::fmt;

/// Family a cache key belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyKind {
    /// Direct `(scope, scopeId, key)` lookup
    Setting,

    /// Hierarchy resolution for a caller context
    Resolve,

    /// Any other conditionally fetched resource
    Custom(String),
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyKind::Setting => write!(f, "setting"),
            KeyKind::Resolve => write!(f, "resolve"),
            KeyKind::Custom(s) => write!(f, "custom:{}", escape(s)),
        }
    }
}

/// Builds canonical cache keys.
///
/// Parameters are sorted by name and blank values are dropped, so two
/// builders fed the same logical request in any order produce the same key.
#[derive(Debug, Clone)]
pub struct CacheKeyBuilder {
    kind: KeyKind,
    identifier: String,
    params: BTreeMap<String, String>,
}

impl CacheKeyBuilder {
    pub fn new(kind: KeyKind) -> Self {
        Self {
            kind,
            identifier: String::new(),
            params: BTreeMap::new(),
        }
    }

    /// Set the primary identifier (the setting key)
    pub fn identifier(mut self, id: impl Into<String>) -> Self {
        self.identifier = id.into();
        self
    }

    /// Add a parameter; blank values are ignored
    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let value = value.into();
        let value = value.trim();
        if !value.is_empty() {
            self.params.insert(name.into(), value.to_string());
        }
        self
    }

    pub fn build(self) -> CacheKey {
        let mut key = format!("{}:{}", self.kind, escape(&self.identifier));

        if !self.params.is_empty() {
            let params: Vec<String> = self
                .params
                .iter()
                .map(|(k, v)| format!("{}={}", escape(k), escape(v)))
                .collect();
            key.push('?');
            key.push_str(&params.join("&"));
        }

        key
    }
}

/// Percent-escape the characters that carry structure in a key
fn escape(component: &str) -> String {
    let mut out = String::with_capacity(component.len());
    for c in component.chars() {
        match c {
            '%' => out.push_str("%25"),
            ':' => out.push_str("%3A"),
            '?' => out.push_str("%3F"),
            '&' => out.push_str("%26"),
            '=' => out.push_str("%3D"),
            _ => out.push(c),
        }
    }
    out
}
