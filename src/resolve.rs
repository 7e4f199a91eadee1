// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Glob resolution of configuration entries.
//!
//! A configuration entry may carry the wildcard token `*` in one of its
//! values. Resolving the entry means asking a registry for every object that
//! matches the pattern, and producing one concrete entry per match with the
//! pattern swapped for the matched value.
//!
//! # Algorithm
//!
//! Entries are processed in input order:
//!
//! 1. Unless the wildcard form is to be removed, the entry is kept as is.
//!    The wildcard form stays useful to write operations that target the
//!    namespace the pattern describes.
//! 2. The globbable key becomes the object kind to query, and the pattern
//!    becomes the value of the search key filter.
//! 3. Each returned row yields a copy of the entry whose globbable value is
//!    replaced by the row's value under the search key.
//!
//! The accumulated entries are finally deduplicated, keeping the first
//! occurrence of each.
//!
//! Resolution is all or nothing. Every entry is checked before the first
//! query goes out, and any failed query fails the whole resolution.

use crate::{
    config::user::ConfigEntry,
    registry::{QueryError, RegistryQuery, Row},
};

use serde_json::Value;
use std::collections::HashSet;
use tracing::{debug, instrument};

/// Field matched against wildcard patterns by default.
pub const DEFAULT_SEARCH_KEY: &str = "name";

/// Knobs of glob resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobOptions {
    /// Field of registry rows the pattern is matched under.
    pub search_key: String,

    /// Drop the wildcard form of an entry from the result once expanded.
    pub remove_wildcard: bool,
}

impl Default for GlobOptions {
    fn default() -> Self {
        Self {
            search_key: DEFAULT_SEARCH_KEY.into(),
            remove_wildcard: false,
        }
    }
}

impl GlobOptions {
    pub fn with_search_key(mut self, search_key: impl Into<String>) -> Self {
        self.search_key = search_key.into();
        self
    }

    pub fn remove_wildcard(mut self, remove: bool) -> Self {
        self.remove_wildcard = remove;
        self
    }
}

/// Expand wildcard entries against a registry.
#[derive(Debug)]
pub struct GlobResolver<'q, Q: RegistryQuery> {
    query: &'q Q,
}

impl<'q, Q: RegistryQuery> GlobResolver<'q, Q> {
    /// Construct new resolver querying through `query`.
    pub fn new(query: &'q Q) -> Self {
        Self { query }
    }

    /// Resolve every wildcard entry.
    ///
    /// # Errors
    ///
    /// - Return [`ResolveError::MultipleWildcards`] if any entry has more
    ///   than one globbable value. Nothing is queried in that case.
    /// - Return [`ResolveError::Query`] if a registry query fails.
    /// - Return [`ResolveError::InvalidRow`] if a returned row has no usable
    ///   value under the search key.
    #[instrument(skip(self, entries), level = "debug")]
    pub async fn resolve(
        &self,
        entries: &[ConfigEntry],
        options: &GlobOptions,
    ) -> Result<Vec<ConfigEntry>> {
        let globs = globbable_fields(entries)?;
        let mut resolved = Vec::with_capacity(entries.len());

        for (entry, glob) in entries.iter().zip(globs) {
            if !options.remove_wildcard {
                resolved.push(entry.clone());
            }

            let Some((kind, pattern)) = glob else {
                if options.remove_wildcard {
                    resolved.push(entry.clone());
                }
                continue;
            };

            let rows = self
                .query
                .list(kind, &[(options.search_key.as_str(), pattern)])
                .await?;
            debug!("{kind} pattern {pattern:?} matched {} objects", rows.len());

            for row in &rows {
                let value = row_value(row, &options.search_key).ok_or_else(|| {
                    ResolveError::InvalidRow {
                        kind: kind.into(),
                        key: options.search_key.clone(),
                    }
                })?;
                resolved.push(entry.with_value(kind, value));
            }
        }

        Ok(dedup_entries(resolved))
    }
}

/// Remove duplicate entries, keeping the first occurrence of each.
pub fn dedup_entries(entries: impl IntoIterator<Item = ConfigEntry>) -> Vec<ConfigEntry> {
    let mut seen = HashSet::new();
    entries
        .into_iter()
        .filter(|entry| seen.insert(entry.clone()))
        .collect()
}

/// Globbable key-value pair of each entry, if any.
fn globbable_fields(entries: &[ConfigEntry]) -> Result<Vec<Option<(&str, &str)>>> {
    entries
        .iter()
        .enumerate()
        .map(|(index, entry)| {
            let mut fields = entry.wildcard_fields();
            match fields.len() {
                0 => Ok(None),
                1 => Ok(fields.pop()),
                _ => Err(ResolveError::MultipleWildcards {
                    index,
                    fields: fields.into_iter().map(|(key, _)| key.to_string()).collect(),
                }),
            }
        })
        .collect()
}

fn row_value(row: &Row, key: &str) -> Option<String> {
    match row.get(key)? {
        Value::String(value) => Some(value.clone()),
        Value::Number(value) => Some(value.to_string()),
        _ => None,
    }
}

/// Glob resolution error types.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    /// Entry has more than one globbable value.
    #[error(
        "entry {index} has globbable values in {fields:?}, only one key-value pair \
         per entry may contain a wildcard"
    )]
    MultipleWildcards { index: usize, fields: Vec<String> },

    /// Registry query failed.
    #[error(transparent)]
    Query(#[from] QueryError),

    /// Registry row lacks the search key.
    #[error("registry returned {kind} without a value for {key:?}")]
    InvalidRow { kind: String, key: String },
}

/// Friendly result alias :3
type Result<T, E = ResolveError> = std::result::Result<T, E>;
