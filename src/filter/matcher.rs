//! Suffix-aware domain matching.
//!
//! Blocked domains are stored in a trie keyed by labels from the TLD
//! inwards, so a lookup walks at most one node per label of the queried
//! name. Blocking `facebook.com` also blocks `m.facebook.com` but never
//! `notfacebook.com`, because matching only happens on whole labels.

use std::collections::HashMap;
use std::sync::Arc;

use crate::models::BlockedEntry;

/// Names with more labels than this are not looked up
pub const MAX_LABELS: usize = 127;

/// Lower-case, trim whitespace and trailing dot, strip a leading `www.`
pub fn normalize(name: &str) -> String {
    let lowered = name.trim().trim_end_matches('.').to_lowercase();
    match lowered.strip_prefix("www.") {
        Some(rest) => rest.to_string(),
        None => lowered,
    }
}

#[derive(Debug, Default)]
struct Node {
    children: HashMap<Box<str>, Node>,
    /// Set when the path from the root to here is a blocked domain
    rule: Option<Arc<str>>,
}

/// Immutable set of blocked domains, built once per configuration push
#[derive(Debug, Default)]
pub struct DomainMatcher {
    root: Node,
    len: usize,
}

impl DomainMatcher {
    /// Build from raw domain strings; each one is normalized first
    pub fn new<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut matcher = Self::default();
        for domain in domains {
            matcher.insert(&normalize(domain.as_ref()));
        }
        matcher
    }

    /// Build from store entries, skipping disabled ones
    pub fn from_entries(entries: &[BlockedEntry]) -> Self {
        Self::new(entries.iter().filter(|e| e.enabled).map(|e| e.domain.as_str()))
    }

    fn insert(&mut self, domain: &str) {
        if domain.is_empty() {
            return;
        }
        let labels: Vec<&str> = domain.rsplit('.').collect();
        if labels.len() > MAX_LABELS || labels.iter().any(|l| l.is_empty()) {
            return;
        }

        let mut node = &mut self.root;
        for label in labels {
            node = node.children.entry(label.into()).or_default();
        }
        if node.rule.is_none() {
            node.rule = Some(Arc::from(domain));
            self.len += 1;
        }
    }

    /// Whether `name` or one of its parent domains is blocked
    pub fn is_blocked(&self, name: &str) -> bool {
        self.matching_rule(name).is_some()
    }

    /// The most specific blocked domain covering `name`, if any
    pub fn matching_rule(&self, name: &str) -> Option<Arc<str>> {
        let name = normalize(name);
        if name.is_empty() {
            return None;
        }

        let mut node = &self.root;
        let mut found = None;
        for (depth, label) in name.rsplit('.').enumerate() {
            if depth >= MAX_LABELS || label.is_empty() {
                break;
            }
            match node.children.get(label) {
                Some(child) => node = child,
                None => break,
            }
            if let Some(rule) = &node.rule {
                found = Some(Arc::clone(rule));
            }
        }
        found
    }

    /// Number of distinct blocked domains
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
