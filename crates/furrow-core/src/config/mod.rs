//! Runtime configuration for the sync subsystem.
//!
//! Values come from `FURROW_*` environment variables. Everything except the
//! remote endpoint has a default, so a local-only setup needs no variables.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::env;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::util::{is_http_url, normalize_text_option};

const DEFAULT_CACHE_TTL_SECS: u64 = 300;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 15;
const DEFAULT_COMPLETED_RETENTION_SECS: u64 = 24 * 60 * 60;

/// Server-owned columns never compared during conflict detection.
pub const DEFAULT_IGNORED_FIELDS: [&str; 4] = ["id", "created_at", "updated_at", "farm_id"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Per-collection freshness windows for cached data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachePolicy {
    pub default_ttl: Duration,
    pub collections: BTreeMap<String, Duration>,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(DEFAULT_CACHE_TTL_SECS),
            collections: BTreeMap::new(),
        }
    }
}

impl CachePolicy {
    #[must_use]
    pub fn with_collection_ttl(mut self, collection: impl Into<String>, ttl: Duration) -> Self {
        self.collections.insert(collection.into(), ttl);
        self
    }

    pub fn ttl_for(&self, collection: &str) -> Duration {
        self.collections
            .get(collection)
            .copied()
            .unwrap_or(self.default_ttl)
    }

    /// Whether a value written at `last_updated` is still fresh at `now` (both Unix ms).
    pub fn is_fresh(&self, collection: &str, last_updated: i64, now: i64) -> bool {
        let ttl_ms = i64::try_from(self.ttl_for(collection).as_millis()).unwrap_or(i64::MAX);
        now.saturating_sub(last_updated) < ttl_ms
    }
}

/// How newly detected conflicts are handled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Surface every conflict and wait for an explicit choice
    #[default]
    Manual,
    /// Resolve with the per-field merge as soon as the conflict is recorded
    AutoMerge,
}

/// Configuration for the sync engine and its stores.
#[derive(Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Base URL of the remote store API
    pub remote_url: Option<String>,
    /// Bearer token sent to the remote store
    pub remote_token: Option<String>,
    pub request_timeout: Duration,
    pub cache: CachePolicy,
    pub ignored_fields: BTreeSet<String>,
    pub conflict_policy: ConflictPolicy,
    /// How long completed queue items are kept before purging
    pub completed_retention: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            remote_url: None,
            remote_token: None,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            cache: CachePolicy::default(),
            ignored_fields: DEFAULT_IGNORED_FIELDS
                .iter()
                .map(|field| (*field).to_string())
                .collect(),
            conflict_policy: ConflictPolicy::default(),
            completed_retention: Duration::from_secs(DEFAULT_COMPLETED_RETENTION_SECS),
        }
    }
}

impl fmt::Debug for SyncConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("SyncConfig")
            .field("remote_url", &self.remote_url)
            .field(
                "remote_token",
                &self.remote_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("request_timeout", &self.request_timeout)
            .field("cache", &self.cache)
            .field("ignored_fields", &self.ignored_fields)
            .field("conflict_policy", &self.conflict_policy)
            .field("completed_retention", &self.completed_retention)
            .finish()
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let remote_url = optional_trimmed(&lookup, "FURROW_REMOTE_URL")
            .map(|url| url.trim_end_matches('/').to_string());
        if let Some(url) = remote_url.as_deref() {
            if !is_http_url(url) {
                return Err(ConfigError::Invalid(
                    "FURROW_REMOTE_URL must start with http:// or https://".to_string(),
                ));
            }
        }
        let remote_token = optional_trimmed(&lookup, "FURROW_REMOTE_TOKEN");

        let request_timeout_secs = parse_secs(
            &lookup,
            "FURROW_REQUEST_TIMEOUT_SECS",
            DEFAULT_REQUEST_TIMEOUT_SECS,
        )?;
        if !(1..=300).contains(&request_timeout_secs) {
            return Err(ConfigError::Invalid(
                "FURROW_REQUEST_TIMEOUT_SECS must be in [1, 300]".to_string(),
            ));
        }

        let cache_ttl_secs = parse_secs(&lookup, "FURROW_CACHE_TTL_SECS", DEFAULT_CACHE_TTL_SECS)?;
        let mut cache = CachePolicy {
            default_ttl: Duration::from_secs(cache_ttl_secs),
            collections: BTreeMap::new(),
        };
        if let Some(overrides) = optional_trimmed(&lookup, "FURROW_CACHE_TTL_OVERRIDES") {
            cache.collections = parse_ttl_overrides(&overrides)?;
        }

        let ignored_fields = optional_trimmed(&lookup, "FURROW_IGNORED_FIELDS").map_or(
            defaults.ignored_fields,
            |value| {
                value
                    .split(',')
                    .filter_map(|field| normalize_text_option(Some(field.to_string())))
                    .collect()
            },
        );

        let conflict_policy = match optional_trimmed(&lookup, "FURROW_CONFLICT_POLICY").as_deref()
        {
            None | Some("manual") => ConflictPolicy::Manual,
            Some("auto_merge") => ConflictPolicy::AutoMerge,
            Some(other) => {
                return Err(ConfigError::Invalid(format!(
                    "FURROW_CONFLICT_POLICY must be 'manual' or 'auto_merge', got '{other}'"
                )))
            }
        };

        let completed_retention_secs = parse_secs(
            &lookup,
            "FURROW_COMPLETED_RETENTION_SECS",
            DEFAULT_COMPLETED_RETENTION_SECS,
        )?;

        Ok(Self {
            remote_url,
            remote_token,
            request_timeout: Duration::from_secs(request_timeout_secs),
            cache,
            ignored_fields,
            conflict_policy,
            completed_retention: Duration::from_secs(completed_retention_secs),
        })
    }

    /// Check if a remote store is configured
    pub const fn has_remote(&self) -> bool {
        self.remote_url.is_some()
    }
}

/// Parse `collection=seconds` pairs separated by commas.
fn parse_ttl_overrides(raw: &str) -> Result<BTreeMap<String, Duration>, ConfigError> {
    let mut overrides = BTreeMap::new();
    for pair in raw.split(',').filter(|pair| !pair.trim().is_empty()) {
        let (collection, secs) = pair.split_once('=').ok_or_else(|| {
            ConfigError::Invalid(format!(
                "FURROW_CACHE_TTL_OVERRIDES entry '{pair}' must look like collection=seconds"
            ))
        })?;
        let collection = collection.trim();
        if collection.is_empty() {
            return Err(ConfigError::Invalid(
                "FURROW_CACHE_TTL_OVERRIDES has an empty collection name".to_string(),
            ));
        }
        let secs = secs.trim().parse::<u64>().map_err(|_| {
            ConfigError::Invalid(format!(
                "FURROW_CACHE_TTL_OVERRIDES ttl for '{collection}' must be an integer"
            ))
        })?;
        overrides.insert(collection.to_string(), Duration::from_secs(secs));
    }
    Ok(overrides)
}

fn parse_secs(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
    default: u64,
) -> Result<u64, ConfigError> {
    optional_trimmed(lookup, name).map_or(Ok(default), |value| {
        value
            .parse::<u64>()
            .map_err(|_| ConfigError::Invalid(format!("{name} must be a non-negative integer")))
    })
}

fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    normalize_text_option(lookup(name))
}
