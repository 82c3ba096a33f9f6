//! Turns raw post records into viewer-relative feed entries.
//!
//! For one batch of raw records the resolver runs three batched lookups
//! concurrently: author profiles, the viewer's follow records and the
//! viewer's like records. Every lookup is split into chunks of
//! `chunk_size` ids. A failed chunk is retried id by id so only the ids
//! that really fail degrade; a failed author falls back to the cached
//! profile, or to the "Unknown" placeholder. Enrichment never fails as a
//! whole.

use futures_util::future;
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::config::EnrichmentConfig;
use crate::document::{follow_document_id, like_document_id, Document};
use crate::model::{AuxiliaryUserInfo, FeedEntry, RawEntry, Timestamp, UserId};
use crate::ports::DocumentStore;

/// Profile fields read from the users collection.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserRecord {
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    avatar_url: Option<String>,
}

/// Outcome of looking up one document id.
#[derive(Debug)]
enum Lookup {
    Found(Document),
    Missing,
    Failed,
}

impl Lookup {
    /// Whether the record exists; `None` when the lookup failed.
    fn exists(&self) -> Option<bool> {
        match self {
            Lookup::Found(_) => Some(true),
            Lookup::Missing => Some(false),
            Lookup::Failed => None,
        }
    }
}

/// Resolved profile for one author, before it is applied to entries.
struct AuthorResolution {
    /// `None` when the user lookup failed and nothing was cached.
    profile: Option<(Option<String>, Option<String>)>,
    is_following: bool,
}

#[derive(Default)]
struct AuthorCache {
    users: HashMap<UserId, AuxiliaryUserInfo>,
    /// Follow states this viewer wrote, stamped with `clock`.
    follows: HashMap<UserId, (bool, u64)>,
    clock: u64,
}

impl AuthorCache {
    /// Follow state recorded after an enrichment that started at `mark`.
    fn follow_recorded_after(&self, author: &UserId, mark: u64) -> Option<bool> {
        self.follows
            .get(author)
            .filter(|(_, at)| *at > mark)
            .map(|(following, _)| *following)
    }
}

pub struct EnrichmentResolver {
    store: Arc<dyn DocumentStore>,
    config: EnrichmentConfig,
    cache: RwLock<AuthorCache>,
}

impl EnrichmentResolver {
    pub fn new(store: Arc<dyn DocumentStore>, config: EnrichmentConfig) -> Self {
        Self {
            store,
            config,
            cache: RwLock::new(AuthorCache::default()),
        }
    }

    pub fn config(&self) -> &EnrichmentConfig {
        &self.config
    }

    /// Enrich `raw` for `viewer`. Returns one entry per input record, in
    /// input order. The input is not modified.
    pub async fn enrich(&self, raw: &[RawEntry], viewer: &UserId) -> Vec<FeedEntry> {
        if raw.is_empty() {
            return Vec::new();
        }

        let authors: BTreeSet<&UserId> = raw.iter().map(|r| &r.author_id).collect();
        let user_ids: Vec<String> = authors.iter().map(|a| a.to_string()).collect();
        let follow_ids: Vec<String> = authors
            .iter()
            .copied()
            .filter(|a| *a != viewer)
            .map(|a| follow_document_id(viewer, a))
            .collect();
        let like_ids: Vec<String> = raw
            .iter()
            .map(|r| like_document_id(&r.id, viewer))
            .collect();

        let mark = self.cache.read().await.clock;
        let (users, follows, likes) = future::join3(
            self.lookup(&self.config.users_collection, user_ids),
            self.lookup(&self.config.follows_collection, follow_ids),
            self.lookup(&self.config.likes_collection, like_ids),
        )
        .await;

        let mut resolved: HashMap<&UserId, AuthorResolution> = HashMap::new();
        {
            let mut cache = self.cache.write().await;
            for author in &authors {
                let follow = if *author == viewer {
                    Some(false)
                } else {
                    cache.follow_recorded_after(author, mark).or_else(|| {
                        follows
                            .get(&follow_document_id(viewer, author))
                            .and_then(Lookup::exists)
                    })
                };
                let user = users.get(author.as_str()).unwrap_or(&Lookup::Failed);
                let cached = cache.users.get(*author);
                let is_following = follow
                    .or_else(|| cached.map(|c| c.is_following))
                    .or_else(|| cache.follows.get(*author).map(|(following, _)| *following))
                    .unwrap_or(false);

                let profile = match user {
                    Lookup::Found(doc) => match doc.decode::<UserRecord>() {
                        Ok(record) => Some((record.display_name, record.avatar_url)),
                        Err(e) => {
                            log::warn!("ignoring user record for {author}: {e}");
                            Some((None, None))
                        }
                    },
                    Lookup::Missing => Some((None, None)),
                    Lookup::Failed => cached.map(|c| (Some(c.display_name.clone()), c.avatar_url.clone())),
                };

                if let (Some((name, avatar)), Some(following), false) =
                    (&profile, follow, matches!(user, Lookup::Failed))
                {
                    let post = raw.iter().find(|r| &r.author_id == *author);
                    let info = AuxiliaryUserInfo {
                        display_name: name
                            .clone()
                            .or_else(|| post.and_then(|p| p.author.clone()))
                            .unwrap_or_else(|| self.config.unknown_author_name.clone()),
                        avatar_url: avatar.clone().or_else(|| post.and_then(|p| p.avatar.clone())),
                        is_following: following,
                    };
                    cache.users.insert((*author).clone(), info);
                }

                resolved.insert(*author, AuthorResolution { profile, is_following });
            }
        }

        raw.iter()
            .map(|record| {
                let liked = match likes.get(&like_document_id(&record.id, viewer)) {
                    Some(Lookup::Found(_)) => true,
                    Some(Lookup::Failed) => {
                        log::warn!("like state of {} unknown, showing as not liked", record.id);
                        false
                    }
                    _ => false,
                };
                let author = resolved.get(&record.author_id);
                self.build_entry(record, author, liked)
            })
            .collect()
    }

    fn build_entry(&self, raw: &RawEntry, author: Option<&AuthorResolution>, liked: bool) -> FeedEntry {
        let (author_name, author_avatar) = match author.and_then(|a| a.profile.as_ref()) {
            Some((name, avatar)) => (
                name.clone()
                    .or_else(|| raw.author.clone())
                    .unwrap_or_else(|| self.config.unknown_author_name.clone()),
                avatar.clone().or_else(|| raw.avatar.clone()),
            ),
            None => (self.config.unknown_author_name.clone(), None),
        };

        FeedEntry {
            id: raw.id.clone(),
            author_id: raw.author_id.clone(),
            author_name,
            author_avatar,
            body: raw.content.clone(),
            media: raw.media(),
            like_count: u64::try_from(raw.likes).unwrap_or(0),
            liked_by_viewer: liked,
            comments: raw.comments.clone(),
            created_at: raw.timestamp.unwrap_or_else(Timestamp::now),
            confirmed: raw.timestamp.is_some(),
            is_following_author: author.is_some_and(|a| a.is_following),
        }
    }

    /// Look up `ids` in chunks. Ids of a failed chunk are retried one by
    /// one.
    async fn lookup(&self, collection: &str, ids: Vec<String>) -> HashMap<String, Lookup> {
        let mut results = HashMap::with_capacity(ids.len());
        let chunk_size = self.config.chunk_size.max(1);

        for chunk in ids.chunks(chunk_size) {
            match self.store.get_batch(collection, chunk).await {
                Ok(docs) => collect_chunk(&mut results, chunk, docs),
                Err(e) if chunk.len() == 1 => {
                    log::warn!("lookup of {collection}/{} failed: {e}", chunk[0]);
                    results.insert(chunk[0].clone(), Lookup::Failed);
                }
                Err(e) => {
                    log::warn!(
                        "lookup chunk of {} ids in {collection} failed, retrying individually: {e}",
                        chunk.len()
                    );
                    for id in chunk {
                        let single = std::slice::from_ref(id);
                        match self.store.get_batch(collection, single).await {
                            Ok(docs) => collect_chunk(&mut results, single, docs),
                            Err(e) => {
                                log::warn!("lookup of {collection}/{id} failed: {e}");
                                results.insert(id.clone(), Lookup::Failed);
                            }
                        }
                    }
                }
            }
        }
        results
    }

    /// Cached profile of `author`, if one was resolved.
    pub async fn user_info(&self, author: &UserId) -> Option<AuxiliaryUserInfo> {
        self.cache.read().await.users.get(author).cloned()
    }

    /// Best known follow state of `author`: the last one recorded, else
    /// the cached profile's.
    pub async fn follow_state(&self, author: &UserId) -> Option<bool> {
        let cache = self.cache.read().await;
        cache
            .follows
            .get(author)
            .map(|(following, _)| *following)
            .or_else(|| cache.users.get(author).map(|info| info.is_following))
    }

    /// Record a confirmed follow state change. Enrichments already
    /// running keep it over what they looked up.
    pub async fn record_follow(&self, author: &UserId, following: bool) {
        let mut cache = self.cache.write().await;
        cache.clock += 1;
        let at = cache.clock;
        cache.follows.insert(author.clone(), (following, at));
        if let Some(info) = cache.users.get_mut(author) {
            info.is_following = following;
        }
    }

    pub async fn clear_cache(&self) {
        let mut cache = self.cache.write().await;
        cache.users.clear();
        cache.follows.clear();
    }

    pub async fn cached_authors(&self) -> usize {
        self.cache.read().await.users.len()
    }
}

fn collect_chunk(results: &mut HashMap<String, Lookup>, chunk: &[String], docs: Vec<Document>) {
    let mut found: HashMap<String, Document> = docs.into_iter().map(|d| (d.id.clone(), d)).collect();
    for id in chunk {
        let lookup = match found.remove(id) {
            Some(doc) => Lookup::Found(doc),
            None => Lookup::Missing,
        };
        results.insert(id.clone(), lookup);
    }
}
