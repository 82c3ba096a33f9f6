//! Feed configuration.
//!
//! One `FeedConfig` is created at startup (defaults, or a JSON file) and
//! split into the per-component configs below.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;

/// Upper bound on lookup chunks accepted by the document store.
const MAX_LOOKUP_CHUNK: usize = 30;

/// Collection names in the remote document store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionNames {
    pub posts: String,
    pub users: String,
    pub likes: String,
    pub follows: String,
}

impl Default for CollectionNames {
    fn default() -> Self {
        Self {
            posts: "posts".to_string(),
            users: "users".to_string(),
            likes: "likes".to_string(),
            follows: "follows".to_string(),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub collections: CollectionNames,
    /// Field the posts subscription is ordered by (descending).
    pub order_key: String,
    /// Ids per batched lookup
    pub lookup_chunk_size: usize,
    /// Display name used when an author cannot be resolved
    pub unknown_author_name: String,
    /// How long the first toggle of a burst waits for more toggles
    pub like_coalesce_window_ms: u64,
    /// How long a confirmed comment waits for its echo before the
    /// temporary copy is kept as-is
    pub comment_confirm_timeout_ms: u64,
    /// Max clock distance for matching a temporary comment to its echo
    pub comment_match_window_ms: u64,
    /// Object storage prefix for uploaded post media
    pub media_path_prefix: String,
    /// Capacity of the session event channel
    pub event_channel_capacity: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            collections: CollectionNames::default(),
            order_key: "timestamp".to_string(),
            lookup_chunk_size: 10,
            unknown_author_name: "Unknown".to_string(),
            like_coalesce_window_ms: 150,
            comment_confirm_timeout_ms: 10_000,
            comment_match_window_ms: 60_000,
            media_path_prefix: "post_images".to_string(),
            event_channel_capacity: 256,
        }
    }
}

impl FeedConfig {
    /// Config for tests: short windows so async tests stay fast.
    pub fn for_testing() -> Self {
        Self {
            like_coalesce_window_ms: 20,
            comment_confirm_timeout_ms: 200,
            event_channel_capacity: 64,
            ..Self::default()
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: FeedConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON config file. Missing keys take defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lookup_chunk_size == 0 || self.lookup_chunk_size > MAX_LOOKUP_CHUNK {
            return Err(ConfigError::Invalid(format!(
                "lookup_chunk_size must be within 1..={MAX_LOOKUP_CHUNK}, got {}",
                self.lookup_chunk_size
            )));
        }
        if self.event_channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "event_channel_capacity must be positive".to_string(),
            ));
        }
        let names = [
            &self.collections.posts,
            &self.collections.users,
            &self.collections.likes,
            &self.collections.follows,
            &self.order_key,
        ];
        if names.iter().any(|n| n.trim().is_empty()) {
            return Err(ConfigError::Invalid(
                "collection names and order_key must be non-empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn enrichment(&self) -> EnrichmentConfig {
        EnrichmentConfig {
            users_collection: self.collections.users.clone(),
            likes_collection: self.collections.likes.clone(),
            follows_collection: self.collections.follows.clone(),
            chunk_size: self.lookup_chunk_size,
            unknown_author_name: self.unknown_author_name.clone(),
        }
    }

    pub fn mutator(&self) -> MutatorConfig {
        MutatorConfig {
            collections: self.collections.clone(),
            coalesce_window: Duration::from_millis(self.like_coalesce_window_ms),
            comment_confirm_timeout: Duration::from_millis(self.comment_confirm_timeout_ms),
            media_path_prefix: self.media_path_prefix.clone(),
        }
    }

    pub fn store(&self) -> StoreConfig {
        StoreConfig {
            comment_match_window_ms: self.comment_match_window_ms,
        }
    }
}

/// Settings for [`crate::enrich::EnrichmentResolver`].
#[derive(Debug, Clone)]
pub struct EnrichmentConfig {
    pub users_collection: String,
    pub likes_collection: String,
    pub follows_collection: String,
    pub chunk_size: usize,
    pub unknown_author_name: String,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        FeedConfig::default().enrichment()
    }
}

/// Settings for [`crate::mutator::OptimisticMutator`].
#[derive(Debug, Clone)]
pub struct MutatorConfig {
    pub collections: CollectionNames,
    pub coalesce_window: Duration,
    pub comment_confirm_timeout: Duration,
    pub media_path_prefix: String,
}

impl Default for MutatorConfig {
    fn default() -> Self {
        FeedConfig::default().mutator()
    }
}

/// Settings for [`crate::store::LocalFeedStore`].
#[derive(Debug, Clone, Copy)]
pub struct StoreConfig {
    pub comment_match_window_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        FeedConfig::default().store()
    }
}
