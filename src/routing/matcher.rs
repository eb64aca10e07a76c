use std::sync::Arc;

use crate::config::CompiledUpstream;

/// Maps an inbound URL path to exactly one upstream by longest-prefix match
/// over the union of `/api/<id>` and every configured alias. Aliases match
/// both under `/api` and at the root, so `gemini` with alias `/gem` serves
/// `/api/gemini/…`, `/api/gem/…`, and `/gem/…`.
///
/// Rebuilt per config generation; lookups are read-only.
pub struct RouteTable {
    entries: Vec<RouteEntry>,
}

struct RouteEntry {
    prefix: String,
    upstream: Arc<CompiledUpstream>,
}

impl RouteTable {
    pub fn build(upstreams: &[Arc<CompiledUpstream>]) -> Self {
        let mut entries = Vec::new();
        for upstream in upstreams {
            entries.push(RouteEntry {
                prefix: format!("/api/{}", upstream.id),
                upstream: upstream.clone(),
            });
            for alias in &upstream.aliases {
                entries.push(RouteEntry {
                    prefix: format!("/api{}", alias),
                    upstream: upstream.clone(),
                });
                entries.push(RouteEntry {
                    prefix: alias.clone(),
                    upstream: upstream.clone(),
                });
            }
        }
        // Longest prefix wins; ties cannot happen (prefixes are unique).
        entries.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
        Self { entries }
    }

    /// Resolve a path to `(upstream, suffix)`. The matched prefix is
    /// stripped; the suffix keeps its leading `/` (empty when the path is
    /// exactly the prefix).
    pub fn resolve<'a>(&self, path: &'a str) -> Option<(Arc<CompiledUpstream>, &'a str)> {
        for entry in &self.entries {
            let prefix = entry.prefix.as_str();
            if let Some(suffix) = path.strip_prefix(prefix) {
                // Boundary check: "/gem" must not capture "/gemini2".
                if suffix.is_empty() || suffix.starts_with('/') {
                    return Some((entry.upstream.clone(), suffix));
                }
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
