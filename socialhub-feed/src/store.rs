//! The local, ordered feed and its pending optimistic mutations.
//!
//! `LocalFeedStore` is the single writer of UI-visible state. Entries are
//! kept in a `BTreeMap` keyed by [`SortKey`] (newest first, ties by id
//! descending) with a side index from id to key, so every merge leaves
//! the collection sorted and free of duplicate ids.
//!
//! Each speculative edit registers a pending mutation keyed by
//! `(target, kind)`:
//!
//! ```text
//!              apply_speculative
//!   Stable ───────────────────────► Pending ──┬── resolve / confirmed echo ──► Stable
//!                                     │  ▲    └── rollback ──────────────────► Stable
//!                                     └──┘ toggle again (coalesced)
//! ```
//!
//! While a mutation is pending, merges keep the speculative value of the
//! mutated aspect and take every other field from the incoming record.
//! A confirmed follow also outlives its pending record: records enriched
//! before the confirmation (see [`LocalFeedStore::merge_enriched`]) show
//! the confirmed state, since the follows collection has no echo.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, OnceLock};
use tokio::sync::RwLock;

use crate::config::StoreConfig;
use crate::error::PreconditionViolation;
use crate::model::{Comment, CommentId, EntryId, FeedEntry, SortKey, UserId};

/// Store shared between the session loop and the mutator.
pub type SharedFeedStore = Arc<RwLock<LocalFeedStore>>;

/// Kind of an optimistic mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum MutationKind {
    LikeToggle,
    CommentAdd,
    FollowToggle,
    Delete,
    Create,
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MutationKind::LikeToggle => "like-toggle",
            MutationKind::CommentAdd => "comment-add",
            MutationKind::FollowToggle => "follow-toggle",
            MutationKind::Delete => "delete",
            MutationKind::Create => "create",
        };
        f.write_str(name)
    }
}

/// What a pending mutation is about.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MutationTarget {
    Entry(EntryId),
    /// Follow state is per author and spans every entry they wrote.
    Author(UserId),
    Comment { entry_id: EntryId, comment_id: CommentId },
}

impl MutationTarget {
    fn entry_id(&self) -> Option<&EntryId> {
        match self {
            MutationTarget::Entry(id) | MutationTarget::Comment { entry_id: id, .. } => Some(id),
            MutationTarget::Author(_) => None,
        }
    }
}

/// Identifies one pending mutation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PendingKey {
    pub target: MutationTarget,
    pub kind: MutationKind,
}

impl PendingKey {
    pub fn new(target: MutationTarget, kind: MutationKind) -> Self {
        Self { target, kind }
    }

    pub fn like(entry_id: &EntryId) -> Self {
        Self::new(MutationTarget::Entry(entry_id.clone()), MutationKind::LikeToggle)
    }

    pub fn follow(author_id: &UserId) -> Self {
        Self::new(MutationTarget::Author(author_id.clone()), MutationKind::FollowToggle)
    }

    pub fn comment(entry_id: &EntryId, comment_id: &CommentId) -> Self {
        Self::new(
            MutationTarget::Comment {
                entry_id: entry_id.clone(),
                comment_id: comment_id.clone(),
            },
            MutationKind::CommentAdd,
        )
    }

    pub fn delete(entry_id: &EntryId) -> Self {
        Self::new(MutationTarget::Entry(entry_id.clone()), MutationKind::Delete)
    }

    pub fn create(entry_id: &EntryId) -> Self {
        Self::new(MutationTarget::Entry(entry_id.clone()), MutationKind::Create)
    }
}

impl fmt::Display for PendingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            MutationTarget::Entry(id) => write!(f, "{} on {id}", self.kind),
            MutationTarget::Author(id) => write!(f, "{} on author {id}", self.kind),
            MutationTarget::Comment { entry_id, comment_id } => {
                write!(f, "{} {comment_id} on {entry_id}", self.kind)
            }
        }
    }
}

/// Values of the fields a mutation touches.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldSnapshot {
    Like { liked: bool, like_count: u64 },
    /// `entries` holds the per-entry values at capture time; entries
    /// loaded later take `following`.
    Follow { following: bool, entries: Vec<(EntryId, bool)> },
    Comment(Comment),
    CommentAbsent(CommentId),
    Entry(Box<FeedEntry>),
    Absent(EntryId),
}

impl FieldSnapshot {
    fn toggle_state(&self) -> Option<bool> {
        match self {
            FieldSnapshot::Like { liked, .. } => Some(*liked),
            FieldSnapshot::Follow { following, .. } => Some(*following),
            _ => None,
        }
    }
}

/// A local edit to apply ahead of remote confirmation.
#[derive(Debug, Clone)]
pub enum SpeculativeEdit {
    ToggleLike(EntryId),
    AddComment { entry_id: EntryId, comment: Comment },
    /// `fallback_following` is used when no entry by the author is loaded.
    ToggleFollow { author_id: UserId, fallback_following: bool },
    Delete(EntryId),
    Create(FeedEntry),
}

impl SpeculativeEdit {
    pub fn key(&self) -> PendingKey {
        match self {
            SpeculativeEdit::ToggleLike(id) => PendingKey::like(id),
            SpeculativeEdit::AddComment { entry_id, comment } => PendingKey::comment(entry_id, &comment.id),
            SpeculativeEdit::ToggleFollow { author_id, .. } => PendingKey::follow(author_id),
            SpeculativeEdit::Delete(id) => PendingKey::delete(id),
            SpeculativeEdit::Create(entry) => PendingKey::create(&entry.id),
        }
    }
}

/// Result of [`LocalFeedStore::apply_speculative`].
#[derive(Debug, Clone)]
pub struct Speculation {
    pub key: PendingKey,
    /// Fields as they were before the pending mutation began.
    pub previous: FieldSnapshot,
    /// The edit was folded into an already pending toggle.
    pub coalesced: bool,
}

/// Lifecycle of a pending mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingPhase {
    /// Waiting for the coalescing window to close.
    Scheduled,
    InFlight,
    /// Written; waiting for the server copy to arrive via a merge.
    AwaitingEcho,
    /// The echo never arrived in time; the local copy stays visible.
    Kept,
}

#[derive(Debug, Clone)]
struct Pending {
    previous: FieldSnapshot,
    current: FieldSnapshot,
    phase: PendingPhase,
    /// Toggle state of the write in flight.
    writing: Option<bool>,
    /// Latest remote value masked by the speculative one.
    remote: Option<FieldSnapshot>,
}

impl Pending {
    fn new(previous: FieldSnapshot, current: FieldSnapshot, phase: PendingPhase) -> Self {
        Self {
            previous,
            current,
            phase,
            writing: None,
            remote: None,
        }
    }
}

/// Counts from one [`LocalFeedStore::merge`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeSummary {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub removed: usize,
    /// Records ignored because a delete of that entry is pending.
    pub suppressed: usize,
    /// Pending mutations settled by the incoming records.
    pub resolved: usize,
}

impl MergeSummary {
    pub fn changed(&self) -> bool {
        self.inserted + self.updated + self.removed + self.resolved > 0
    }
}

/// Immutable ordered view for rendering.
#[derive(Debug, Clone)]
pub struct FeedSnapshot {
    entries: Arc<[FeedEntry]>,
    version: u64,
}

impl FeedSnapshot {
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn entries(&self) -> &[FeedEntry] {
        &self.entries
    }

    pub fn iter(&self) -> impl Iterator<Item = &FeedEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &EntryId) -> Option<&FeedEntry> {
        self.entries.iter().find(|e| &e.id == id)
    }

    pub fn position(&self, id: &EntryId) -> Option<usize> {
        self.entries.iter().position(|e| &e.id == id)
    }

    pub fn ids(&self) -> Vec<&EntryId> {
        self.entries.iter().map(|e| &e.id).collect()
    }
}

/// A follow state this viewer wrote, stamped with the follow clock at
/// confirmation.
#[derive(Debug, Clone, Copy)]
struct ConfirmedFollow {
    following: bool,
    at: u64,
}

pub struct LocalFeedStore {
    entries: BTreeMap<SortKey, FeedEntry>,
    index: HashMap<EntryId, SortKey>,
    pending: HashMap<PendingKey, Pending>,
    /// Confirmed follows that enrichments started earlier cannot know.
    confirmed_follows: HashMap<UserId, ConfirmedFollow>,
    follow_clock: u64,
    config: StoreConfig,
    version: u64,
    cached: OnceLock<FeedSnapshot>,
}

impl Default for LocalFeedStore {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

impl LocalFeedStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            entries: BTreeMap::new(),
            index: HashMap::new(),
            pending: HashMap::new(),
            confirmed_follows: HashMap::new(),
            follow_clock: 0,
            config,
            version: 0,
            cached: OnceLock::new(),
        }
    }

    pub fn shared(config: StoreConfig) -> SharedFeedStore {
        Arc::new(RwLock::new(Self::new(config)))
    }

    // ─── Reads ───────────────────────────────────────────────────

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn contains(&self, id: &EntryId) -> bool {
        self.index.contains_key(id)
    }

    pub fn get(&self, id: &EntryId) -> Option<&FeedEntry> {
        self.index.get(id).and_then(|key| self.entries.get(key))
    }

    pub fn entries_by<'a>(&'a self, author: &'a UserId) -> impl Iterator<Item = &'a FeedEntry> + 'a {
        self.entries.values().filter(move |e| &e.author_id == author)
    }

    /// Ordered view of the feed. Cached until the next change.
    pub fn snapshot(&self) -> FeedSnapshot {
        self.cached
            .get_or_init(|| FeedSnapshot {
                entries: self.entries.values().cloned().collect(),
                version: self.version,
            })
            .clone()
    }

    pub fn pending_state(&self, key: &PendingKey) -> Option<PendingPhase> {
        self.pending.get(key).map(|p| p.phase)
    }

    /// Pending mutations still waiting on the remote.
    pub fn outstanding(&self) -> usize {
        self.pending
            .values()
            .filter(|p| p.phase != PendingPhase::Kept)
            .count()
    }

    /// Follow clock to pass to [`merge_enriched`](Self::merge_enriched)
    /// for records whose enrichment starts now.
    pub fn enrichment_mark(&self) -> u64 {
        self.follow_clock
    }

    // ─── Merge ───────────────────────────────────────────────────

    /// Merge authoritative records enriched just now. Removals are
    /// applied first.
    pub fn merge(&mut self, added: Vec<FeedEntry>, modified: Vec<FeedEntry>, removed: &[EntryId]) -> MergeSummary {
        let mark = self.follow_clock;
        self.merge_enriched(added, modified, removed, mark)
    }

    /// Merge records whose enrichment started at `mark`. Follow states
    /// confirmed after `mark` override the enriched ones.
    pub fn merge_enriched(
        &mut self,
        added: Vec<FeedEntry>,
        modified: Vec<FeedEntry>,
        removed: &[EntryId],
        mark: u64,
    ) -> MergeSummary {
        let mut summary = MergeSummary::default();

        for id in removed {
            summary.resolved += self.settle_removed(id);
            if self.remove_entry(id).is_some() {
                summary.removed += 1;
            }
        }
        for incoming in added.into_iter().chain(modified) {
            self.upsert_one(incoming, mark, &mut summary);
        }

        if summary.changed() {
            self.touch();
        }
        log::debug!(
            "merge: +{} ~{} ={} -{} suppressed={} resolved={} (v{})",
            summary.inserted,
            summary.updated,
            summary.unchanged,
            summary.removed,
            summary.suppressed,
            summary.resolved,
            self.version
        );
        summary
    }

    pub fn upsert(&mut self, entry: FeedEntry) -> MergeSummary {
        self.merge(vec![entry], Vec::new(), &[])
    }

    pub fn remove(&mut self, id: &EntryId) -> MergeSummary {
        self.merge(Vec::new(), Vec::new(), std::slice::from_ref(id))
    }

    fn upsert_one(&mut self, mut incoming: FeedEntry, mark: u64, summary: &mut MergeSummary) {
        let id = incoming.id.clone();
        if self.pending.contains_key(&PendingKey::delete(&id)) {
            summary.suppressed += 1;
            return;
        }

        let existing = self.remove_entry(&id);
        if !incoming.confirmed {
            if let Some(existing) = &existing {
                incoming.created_at = existing.created_at;
                incoming.confirmed = existing.confirmed;
            }
        }
        if incoming.confirmed && self.pending.remove(&PendingKey::create(&id)).is_some() {
            log::debug!("create of {id} confirmed");
            summary.resolved += 1;
        }

        if let Some(pending) = self.pending.get_mut(&PendingKey::like(&id)) {
            pending.remote = Some(FieldSnapshot::Like {
                liked: incoming.liked_by_viewer,
                like_count: incoming.like_count,
            });
            if let FieldSnapshot::Like { liked, like_count } = pending.current {
                incoming.liked_by_viewer = liked;
                incoming.like_count = like_count;
            }
        }
        if let Some(confirmed) = self.confirmed_follows.get(&incoming.author_id).copied() {
            if confirmed.at > mark {
                incoming.is_following_author = confirmed.following;
            } else {
                // Enriched after the write; the lookup already reflects it.
                self.confirmed_follows.remove(&incoming.author_id);
            }
        }
        if let Some(pending) = self.pending.get(&PendingKey::follow(&incoming.author_id)) {
            if let FieldSnapshot::Follow { following, .. } = pending.current {
                incoming.is_following_author = following;
            }
        }
        summary.resolved += self.reconcile_comments(&mut incoming, existing.as_ref());

        match &existing {
            None => summary.inserted += 1,
            Some(existing) if *existing == incoming => summary.unchanged += 1,
            Some(_) => summary.updated += 1,
        }
        self.insert_entry(incoming);
    }

    /// Match local comments against the incoming list. A matched local
    /// comment is replaced by its server copy; an unmatched one stays
    /// appended. Returns how many were matched.
    fn reconcile_comments(&mut self, incoming: &mut FeedEntry, existing: Option<&FeedEntry>) -> usize {
        let mut locals: Vec<(PendingKey, Comment)> = self
            .pending
            .iter()
            .filter_map(|(key, pending)| match (&key.target, &pending.current) {
                (MutationTarget::Comment { entry_id, .. }, FieldSnapshot::Comment(comment))
                    if *entry_id == incoming.id =>
                {
                    Some((key.clone(), comment.clone()))
                }
                _ => None,
            })
            .collect();
        if locals.is_empty() {
            return 0;
        }
        locals.sort_by_key(|(_, comment)| comment.timestamp);

        // Only comments new to this store can be the echo of a local one.
        let known: HashSet<&CommentId> = existing
            .map(|e| e.comments.iter().map(|c| &c.id).collect())
            .unwrap_or_default();
        let window = self.config.comment_match_window_ms;
        let mut claimed: HashSet<CommentId> = HashSet::new();
        let mut matched = 0;

        for (key, local) in locals {
            let echo = incoming.comments.iter().find(|c| {
                !c.id.is_temporary()
                    && !known.contains(&c.id)
                    && !claimed.contains(&c.id)
                    && local.matches(c, window)
            });
            if let Some(echo) = echo {
                log::debug!("comment {} confirmed as {}", local.id, echo.id);
                claimed.insert(echo.id.clone());
                self.pending.remove(&key);
                matched += 1;
            } else if !incoming.comments.iter().any(|c| c.id == local.id) {
                incoming.comments.push(local);
            }
        }
        matched
    }

    /// Drop pending state tied to an entry the remote removed. Returns
    /// how many pending mutations that settles.
    fn settle_removed(&mut self, id: &EntryId) -> usize {
        let before = self.pending.len();
        self.pending
            .retain(|key, _| key.target.entry_id() != Some(id));
        before - self.pending.len()
    }

    // ─── Speculative edits ───────────────────────────────────────

    /// Apply `edit` locally and register it as pending. A like or follow
    /// toggle on a target that is already pending is composed onto the
    /// pending value.
    pub fn apply_speculative(&mut self, edit: SpeculativeEdit) -> Result<Speculation, PreconditionViolation> {
        let key = edit.key();
        let speculation = match edit {
            SpeculativeEdit::ToggleLike(entry_id) => self.speculate_like(key, &entry_id)?,
            SpeculativeEdit::AddComment { entry_id, comment } => {
                self.speculate_comment(key, &entry_id, comment)?
            }
            SpeculativeEdit::ToggleFollow {
                author_id,
                fallback_following,
            } => self.speculate_follow(key, &author_id, fallback_following),
            SpeculativeEdit::Delete(entry_id) => self.speculate_delete(key, &entry_id)?,
            SpeculativeEdit::Create(entry) => self.speculate_create(key, entry)?,
        };
        self.touch();
        Ok(speculation)
    }

    fn speculate_like(&mut self, key: PendingKey, id: &EntryId) -> Result<Speculation, PreconditionViolation> {
        let entry = self
            .entry_mut(id)
            .ok_or_else(|| PreconditionViolation::UnknownEntry(id.clone()))?;
        let before = FieldSnapshot::Like {
            liked: entry.liked_by_viewer,
            like_count: entry.like_count,
        };
        entry.toggle_like();
        let current = FieldSnapshot::Like {
            liked: entry.liked_by_viewer,
            like_count: entry.like_count,
        };
        Ok(self.register_toggle(key, before, current))
    }

    fn speculate_follow(&mut self, key: PendingKey, author: &UserId, fallback: bool) -> Speculation {
        let pending_state = self.pending.get(&key).and_then(|p| p.current.toggle_state());
        let loaded_state = self.entries_by(author).next().map(|e| e.is_following_author);
        let following = pending_state.or(loaded_state).unwrap_or(fallback);

        let captured: Vec<(EntryId, bool)> = self
            .entries_by(author)
            .map(|e| (e.id.clone(), e.is_following_author))
            .collect();
        for entry in self.entries.values_mut().filter(|e| &e.author_id == author) {
            entry.is_following_author = !following;
        }

        let before = FieldSnapshot::Follow {
            following,
            entries: captured,
        };
        let current = FieldSnapshot::Follow {
            following: !following,
            entries: Vec::new(),
        };
        self.register_toggle(key, before, current)
    }

    fn register_toggle(&mut self, key: PendingKey, before: FieldSnapshot, current: FieldSnapshot) -> Speculation {
        if let Some(pending) = self.pending.get_mut(&key) {
            pending.current = current;
            log::debug!("{key} coalesced");
            return Speculation {
                key,
                previous: pending.previous.clone(),
                coalesced: true,
            };
        }
        self.pending.insert(
            key.clone(),
            Pending::new(before.clone(), current, PendingPhase::Scheduled),
        );
        Speculation {
            key,
            previous: before,
            coalesced: false,
        }
    }

    fn speculate_comment(&mut self, key: PendingKey, id: &EntryId, comment: Comment) -> Result<Speculation, PreconditionViolation> {
        let entry = self
            .entry_mut(id)
            .ok_or_else(|| PreconditionViolation::UnknownEntry(id.clone()))?;
        entry.comments.push(comment.clone());

        let previous = FieldSnapshot::CommentAbsent(comment.id.clone());
        self.pending.insert(
            key.clone(),
            Pending::new(previous.clone(), FieldSnapshot::Comment(comment), PendingPhase::InFlight),
        );
        Ok(Speculation {
            key,
            previous,
            coalesced: false,
        })
    }

    fn speculate_delete(&mut self, key: PendingKey, id: &EntryId) -> Result<Speculation, PreconditionViolation> {
        let entry = self
            .remove_entry(id)
            .ok_or_else(|| PreconditionViolation::UnknownEntry(id.clone()))?;
        let previous = FieldSnapshot::Entry(Box::new(entry));
        self.pending.insert(
            key.clone(),
            Pending::new(previous.clone(), FieldSnapshot::Absent(id.clone()), PendingPhase::InFlight),
        );
        Ok(Speculation {
            key,
            previous,
            coalesced: false,
        })
    }

    fn speculate_create(&mut self, key: PendingKey, entry: FeedEntry) -> Result<Speculation, PreconditionViolation> {
        if self.contains(&entry.id) {
            return Err(PreconditionViolation::DuplicateEntry(entry.id));
        }
        let previous = FieldSnapshot::Absent(entry.id.clone());
        let current = FieldSnapshot::Entry(Box::new(entry.clone()));
        self.insert_entry(entry);
        self.pending.insert(
            key.clone(),
            Pending::new(previous.clone(), current, PendingPhase::InFlight),
        );
        Ok(Speculation {
            key,
            previous,
            coalesced: false,
        })
    }

    // ─── Toggle write protocol ───────────────────────────────────

    /// Close the coalescing window of a pending toggle. Returns the state
    /// to write, or `None` when the toggles cancelled out (the pending
    /// mutation is then resolved and the fields restored).
    pub fn begin_toggle_write(&mut self, key: &PendingKey) -> Option<bool> {
        let pending = self.pending.get_mut(key)?;
        let desired = pending.current.toggle_state()?;
        let committed = pending.previous.toggle_state()?;

        if desired == committed {
            let pending = self.pending.remove(key)?;
            let restore = pending.remote.unwrap_or(pending.previous);
            self.restore(&key.target, &restore);
            self.touch();
            log::debug!("{key} cancelled out, nothing to write");
            return None;
        }
        pending.phase = PendingPhase::InFlight;
        pending.writing = Some(desired);
        Some(desired)
    }

    /// The toggle write succeeded. Returns the state of a follow-up write
    /// when toggles arrived while it was in flight; otherwise the pending
    /// mutation resolves and `None` is returned.
    pub fn confirm_toggle_write(&mut self, key: &PendingKey) -> Option<bool> {
        let pending = self.pending.get_mut(key)?;
        let written = pending.writing.take()?;
        let desired = pending.current.toggle_state()?;

        if let MutationTarget::Author(author) = &key.target {
            self.follow_clock += 1;
            self.confirmed_follows.insert(
                author.clone(),
                ConfirmedFollow {
                    following: written,
                    at: self.follow_clock,
                },
            );
        }

        if desired == written {
            if let Some(pending) = self.pending.remove(key) {
                // An echo merged mid-write that already shows our write wins.
                if let Some(remote) = pending.remote.filter(|r| r.toggle_state() == Some(written)) {
                    if self.restore(&key.target, &remote) {
                        self.touch();
                    }
                }
            }
            log::debug!("{key} committed");
            return None;
        }

        let pending = self.pending.get_mut(key)?;
        // The written state is now the baseline a later failure restores.
        pending.previous = match &pending.current {
            FieldSnapshot::Like { like_count, .. } => FieldSnapshot::Like {
                liked: written,
                like_count: if written {
                    like_count + 1
                } else {
                    like_count.saturating_sub(1)
                },
            },
            _ => FieldSnapshot::Follow {
                following: written,
                entries: Vec::new(),
            },
        };
        pending.writing = Some(desired);
        log::debug!("{key} changed while in flight, writing {desired}");
        Some(desired)
    }

    /// The toggle write failed: restore the baseline. Returns whether a
    /// pending toggle existed.
    pub fn fail_toggle_write(&mut self, key: &PendingKey) -> bool {
        match self.pending.remove(key) {
            Some(pending) => {
                self.restore(&key.target, &pending.previous);
                self.touch();
                true
            }
            None => false,
        }
    }

    // ─── Resolution ──────────────────────────────────────────────

    /// Restore the fields captured in `previous` and drop the pending
    /// mutation. No-op when the target no longer exists.
    pub fn rollback(&mut self, key: &PendingKey, previous: &FieldSnapshot) -> bool {
        self.pending.remove(key);
        let restored = self.restore(&key.target, previous);
        if restored {
            self.touch();
        }
        restored
    }

    /// Drop a pending mutation, keeping the speculative value.
    pub fn resolve(&mut self, key: &PendingKey) -> bool {
        self.pending.remove(key).is_some()
    }

    /// A comment write succeeded; wait for its echo. Returns `false`
    /// when the echo was already merged.
    pub fn await_echo(&mut self, key: &PendingKey) -> bool {
        match self.pending.get_mut(key) {
            Some(pending) if pending.phase == PendingPhase::InFlight => {
                pending.phase = PendingPhase::AwaitingEcho;
                true
            }
            _ => false,
        }
    }

    /// Give up waiting for a comment echo. The local comment stays
    /// visible and is still replaced if the echo turns up later.
    pub fn expire_comment(&mut self, key: &PendingKey) -> bool {
        match self.pending.get_mut(key) {
            Some(pending) if pending.phase == PendingPhase::AwaitingEcho => {
                pending.phase = PendingPhase::Kept;
                true
            }
            _ => false,
        }
    }

    /// Forget everything, e.g. on sign-out.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
        self.pending.clear();
        self.confirmed_follows.clear();
        self.touch();
    }

    // ─── Internals ───────────────────────────────────────────────

    fn restore(&mut self, target: &MutationTarget, snapshot: &FieldSnapshot) -> bool {
        match (target, snapshot) {
            (MutationTarget::Entry(id), FieldSnapshot::Like { liked, like_count }) => {
                match self.entry_mut(id) {
                    Some(entry) => {
                        entry.liked_by_viewer = *liked;
                        entry.like_count = *like_count;
                        true
                    }
                    None => false,
                }
            }
            (MutationTarget::Author(author), FieldSnapshot::Follow { following, entries }) => {
                let mut restored = false;
                for entry in self.entries.values_mut().filter(|e| &e.author_id == author) {
                    entry.is_following_author = entries
                        .iter()
                        .find(|(id, _)| *id == entry.id)
                        .map_or(*following, |(_, f)| *f);
                    restored = true;
                }
                restored
            }
            (MutationTarget::Comment { entry_id, .. }, FieldSnapshot::CommentAbsent(comment_id)) => {
                match self.entry_mut(entry_id) {
                    Some(entry) => {
                        let before = entry.comments.len();
                        entry.comments.retain(|c| &c.id != comment_id);
                        entry.comments.len() != before
                    }
                    None => false,
                }
            }
            (_, FieldSnapshot::Entry(entry)) => {
                if self.contains(&entry.id) {
                    return false;
                }
                self.insert_entry((**entry).clone());
                true
            }
            (_, FieldSnapshot::Absent(id)) => self.remove_entry(id).is_some(),
            _ => {
                log::warn!("snapshot {snapshot:?} does not apply to {target:?}");
                false
            }
        }
    }

    /// Mutable access for fields that are not part of the sort key.
    fn entry_mut(&mut self, id: &EntryId) -> Option<&mut FeedEntry> {
        let key = self.index.get(id)?;
        self.entries.get_mut(key)
    }

    fn insert_entry(&mut self, entry: FeedEntry) {
        let key = entry.sort_key();
        self.index.insert(entry.id.clone(), key.clone());
        self.entries.insert(key, entry);
    }

    fn remove_entry(&mut self, id: &EntryId) -> Option<FeedEntry> {
        let key = self.index.remove(id)?;
        self.entries.remove(&key)
    }

    fn touch(&mut self) {
        self.version += 1;
        self.cached = OnceLock::new();
    }
}
