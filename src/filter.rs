//! NIP-01 subscription filters.
//!
//! A filter is a conjunction over event fields; a subscription's filter list
//! is a disjunction. The same predicate decides both backfill post-filtering
//! and live fan-out, so the two paths cannot disagree.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::event::Event;

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Filter {
    /// Event id hex prefixes. Odd-length prefixes are legal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,

    /// Author pubkey hex prefixes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u16>>,

    /// Inclusive lower bound on created_at.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<i64>,

    /// Inclusive upper bound on created_at.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<i64>,

    /// Cap on backfill results. `Some(0)` means live-only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,

    /// NIP-50 case-insensitive substring search.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,

    /// Tag queries, keyed with their `#` prefix (`"#e": [...]`).
    #[serde(flatten)]
    pub tags: HashMap<String, Vec<String>>,
}

impl Filter {
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.iter().any(|p| event.id.starts_with(p.as_str())) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.iter().any(|p| event.pubkey.starts_with(p.as_str())) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if event.created_at > until {
                return false;
            }
        }
        for (key, values) in &self.tags {
            let Some(name) = key.strip_prefix('#') else {
                // Non-tag extension fields are ignored.
                continue;
            };
            // An empty value set is unsatisfiable.
            let hit = event.tags.iter().any(|tag| {
                tag.first().map(String::as_str) == Some(name)
                    && tag.get(1).is_some_and(|v| values.contains(v))
            });
            if !hit {
                return false;
            }
        }
        if let Some(search) = &self.search {
            if !search_matches(event, search) {
                return false;
            }
        }
        true
    }

    /// True when matching needs fields the store cannot push into SQL.
    pub(crate) fn needs_post_scan(&self) -> bool {
        self.search.is_some() || self.tags.keys().any(|k| k.starts_with('#'))
    }
}

pub fn matches_any(event: &Event, filters: &[Filter]) -> bool {
    filters.iter().any(|f| f.matches(event))
}

/// Substring search over content and tag values, case-insensitive.
fn search_matches(event: &Event, needle: &str) -> bool {
    let needle = needle.to_lowercase();
    event.content.to_lowercase().contains(&needle)
        || event
            .tags
            .iter()
            .any(|tag| tag.iter().skip(1).any(|v| v.to_lowercase().contains(&needle)))
}
