//! Offline mailbox (helper cache).
//!
//! Store-and-forward transports park every durable event in a key/value
//! mailbox so peers that were away can fetch it later. The mailbox itself is
//! a remote service; [`HelperCache`] wraps it with timeouts, retries and
//! not-found normalisation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use threadkey_core::ThreadId;
use tokio::time::Instant;

use crate::error::{MailboxError, Result, TransportError};
use crate::events::Frame;
use crate::retry::{retry_async, RetryPolicy};

/// Frames kept per thread inbox; older ones are dropped first.
pub const INBOX_CAPACITY: usize = 256;

/// Health summary of a mailbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxStatus {
    pub status: String,
    /// Seconds since the mailbox started.
    pub uptime: u64,
    pub entries: usize,
}

/// Storage quota of a mailbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MailboxQuota {
    pub limit_bytes: u64,
    pub used_bytes: u64,
    pub ttl_seconds: u64,
    pub entry_limit: usize,
    pub entry_count: usize,
    pub oldest_entry_iso: Option<String>,
    pub newest_entry_iso: Option<String>,
}

/// A key/value offline mailbox.
///
/// `get` and `delete` report absent keys as [`MailboxError::NotFound`].
#[async_trait]
pub trait Mailbox: Send + Sync {
    async fn status(&self) -> std::result::Result<MailboxStatus, MailboxError>;

    async fn quota(&self) -> std::result::Result<MailboxQuota, MailboxError>;

    async fn put(&self, key: &str, value: Bytes) -> std::result::Result<(), MailboxError>;

    async fn get(&self, key: &str) -> std::result::Result<Bytes, MailboxError>;

    async fn delete(&self, key: &str) -> std::result::Result<(), MailboxError>;
}

/// Retrying, time-bounded front for an optional [`Mailbox`].
#[derive(Clone)]
pub struct HelperCache {
    mailbox: Option<Arc<dyn Mailbox>>,
    policy: RetryPolicy,
    timeout: Duration,
    append_lock: Arc<tokio::sync::Mutex<()>>,
}

impl HelperCache {
    pub fn new(mailbox: Arc<dyn Mailbox>, policy: RetryPolicy, timeout: Duration) -> Self {
        Self {
            mailbox: Some(mailbox),
            policy,
            timeout,
            append_lock: Arc::default(),
        }
    }

    /// A cache with no mailbox behind it; every call fails with
    /// `CacheUnavailable`.
    pub fn disabled() -> Self {
        Self {
            mailbox: None,
            policy: RetryPolicy::none(),
            timeout: Duration::from_secs(8),
            append_lock: Arc::default(),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.mailbox.is_some()
    }

    pub async fn status(&self) -> Result<MailboxStatus> {
        let mailbox = self.mailbox()?;
        self.call("mailbox.status", move || mailbox.status()).await
    }

    pub async fn quota(&self) -> Result<MailboxQuota> {
        let mailbox = self.mailbox()?;
        self.call("mailbox.quota", move || mailbox.quota()).await
    }

    pub async fn put(&self, key: &str, value: Bytes) -> Result<()> {
        let mailbox = self.mailbox()?;
        self.call("mailbox.put", move || mailbox.put(key, value.clone()))
            .await
    }

    /// Fetch `key`; an absent key is `None`.
    pub async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let mailbox = self.mailbox()?;
        self.call("mailbox.get", move || async move {
            match mailbox.get(key).await {
                Ok(value) => Ok(Some(value)),
                Err(MailboxError::NotFound(_)) => Ok(None),
                Err(err) => Err(err),
            }
        })
        .await
    }

    /// Delete `key`; deleting an absent key succeeds.
    pub async fn delete(&self, key: &str) -> Result<()> {
        let mailbox = self.mailbox()?;
        self.call("mailbox.delete", move || async move {
            match mailbox.delete(key).await {
                Ok(()) | Err(MailboxError::NotFound(_)) => Ok(()),
                Err(err) => Err(err),
            }
        })
        .await
    }

    /// Append `frame` to the inbox of `thread_id`.
    ///
    /// Appends from this cache are serialised. Concurrent writers on other
    /// clients race on the same key and the last write wins.
    pub async fn append_to_inbox(&self, thread_id: &ThreadId, frame: &Frame) -> Result<()> {
        let _guard = self.append_lock.lock().await;
        let key = inbox_key(thread_id);
        let mut frames = self.read_frames(&key).await?;
        frames.push(frame.clone());
        if frames.len() > INBOX_CAPACITY {
            let excess = frames.len() - INBOX_CAPACITY;
            frames.drain(..excess);
        }
        let encoded = serde_json::to_vec(&frames)?;
        self.put(&key, Bytes::from(encoded)).await
    }

    /// Frames parked for `thread_id`, oldest first.
    pub async fn read_inbox(&self, thread_id: &ThreadId) -> Result<Vec<Frame>> {
        self.read_frames(&inbox_key(thread_id)).await
    }

    /// Frames parked for `thread_id` that `reader` has not drained yet.
    ///
    /// If the cursor frame has aged out of the inbox, every frame is
    /// returned again.
    pub async fn read_inbox_since(&self, thread_id: &ThreadId, reader: &str) -> Result<Vec<Frame>> {
        let mut frames = self.read_inbox(thread_id).await?;
        let cursor = self.get(&cursor_key(thread_id, reader)).await?;
        if let Some(last) = cursor {
            if let Some(pos) = frames.iter().position(|f| f.id.as_bytes() == last.as_ref()) {
                frames.drain(..=pos);
            }
        }
        Ok(frames)
    }

    /// Record that `reader` drained `thread_id` up to and including `frame_id`.
    pub async fn advance_cursor(&self, thread_id: &ThreadId, reader: &str, frame_id: &str) -> Result<()> {
        let key = cursor_key(thread_id, reader);
        self.put(&key, Bytes::copy_from_slice(frame_id.as_bytes()))
            .await
    }

    async fn read_frames(&self, key: &str) -> Result<Vec<Frame>> {
        match self.get(key).await? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(Vec::new()),
        }
    }

    fn mailbox(&self) -> Result<&Arc<dyn Mailbox>> {
        self.mailbox
            .as_ref()
            .ok_or_else(|| TransportError::CacheUnavailable("no offline mailbox configured".into()))
    }

    async fn call<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<T, MailboxError>>,
    {
        let budget = self.timeout;
        let outcome = retry_async(label, &self.policy, |_| {
            let fut = op();
            async move {
                tokio::time::timeout(budget, fut)
                    .await
                    .map_err(|_| MailboxError::Timeout(budget))?
            }
        })
        .await;
        outcome.map_err(TransportError::from)
    }
}

impl std::fmt::Debug for HelperCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HelperCache")
            .field("configured", &self.is_configured())
            .field("policy", &self.policy)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Mailbox key holding the parked frames of a thread.
pub fn inbox_key(thread_id: &ThreadId) -> String {
    format!("inbox/{}", thread_id)
}

/// Mailbox key holding the id of the last frame `reader` drained.
pub fn cursor_key(thread_id: &ThreadId, reader: &str) -> String {
    format!("cursor/{}/{}", thread_id, reader.to_ascii_lowercase())
}

// ─────────────────────────────────────────────────────────────────────────────
// In-memory mailbox
// ─────────────────────────────────────────────────────────────────────────────

/// Limits of a [`MemoryMailbox`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailboxLimits {
    pub ttl: Duration,
    pub entry_limit: usize,
    pub limit_bytes: u64,
}

impl Default for MailboxLimits {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(7 * 24 * 3600),
            entry_limit: 10_000,
            limit_bytes: 64 * 1024 * 1024,
        }
    }
}

struct Entry {
    value: Bytes,
    stored_at: DateTime<Utc>,
    expires_at: Instant,
}

/// In-process mailbox with TTL, quotas and failure injection.
pub struct MemoryMailbox {
    entries: Mutex<HashMap<String, Entry>>,
    limits: MailboxLimits,
    started: Instant,
    fail_next: AtomicU32,
    offline: AtomicBool,
    calls: AtomicU64,
}

impl MemoryMailbox {
    pub fn new() -> Self {
        Self::with_limits(MailboxLimits::default())
    }

    pub fn with_limits(limits: MailboxLimits) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            limits,
            started: Instant::now(),
            fail_next: AtomicU32::new(0),
            offline: AtomicBool::new(false),
            calls: AtomicU64::new(0),
        }
    }

    /// Fail the next `n` calls with HTTP 503.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// While offline every call fails with `Unavailable`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Calls received, including failed ones.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        entries.retain(|_, entry| entry.expires_at > now);
        entries
    }

    fn admit(&self) -> std::result::Result<(), MailboxError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(MailboxError::Unavailable("mailbox offline".into()));
        }
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(MailboxError::Http {
                status: 503,
                message: "injected failure".into(),
            });
        }
        Ok(())
    }
}

impl Default for MemoryMailbox {
    fn default() -> Self {
        Self::new()
    }
}

fn iso(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[async_trait]
impl Mailbox for MemoryMailbox {
    async fn status(&self) -> std::result::Result<MailboxStatus, MailboxError> {
        self.admit()?;
        Ok(MailboxStatus {
            status: "ok".into(),
            uptime: self.started.elapsed().as_secs(),
            entries: self.entries().len(),
        })
    }

    async fn quota(&self) -> std::result::Result<MailboxQuota, MailboxError> {
        self.admit()?;
        let entries = self.entries();
        let used_bytes = entries.values().map(|e| e.value.len() as u64).sum();
        let oldest = entries.values().map(|e| e.stored_at).min();
        let newest = entries.values().map(|e| e.stored_at).max();
        Ok(MailboxQuota {
            limit_bytes: self.limits.limit_bytes,
            used_bytes,
            ttl_seconds: self.limits.ttl.as_secs(),
            entry_limit: self.limits.entry_limit,
            entry_count: entries.len(),
            oldest_entry_iso: oldest.as_ref().map(iso),
            newest_entry_iso: newest.as_ref().map(iso),
        })
    }

    async fn put(&self, key: &str, value: Bytes) -> std::result::Result<(), MailboxError> {
        self.admit()?;
        let mut entries = self.entries();
        let replaced = entries.get(key).map(|e| e.value.len() as u64);
        if replaced.is_none() && entries.len() >= self.limits.entry_limit {
            return Err(MailboxError::QuotaExceeded(format!(
                "entry limit {} reached",
                self.limits.entry_limit
            )));
        }
        let used: u64 = entries.values().map(|e| e.value.len() as u64).sum();
        let projected = used - replaced.unwrap_or(0) + value.len() as u64;
        if projected > self.limits.limit_bytes {
            return Err(MailboxError::QuotaExceeded(format!(
                "{projected} bytes exceeds limit {}",
                self.limits.limit_bytes
            )));
        }
        entries.insert(
            key.to_string(),
            Entry {
                value,
                stored_at: Utc::now(),
                expires_at: Instant::now() + self.limits.ttl,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> std::result::Result<Bytes, MailboxError> {
        self.admit()?;
        self.entries()
            .get(key)
            .map(|entry| entry.value.clone())
            .ok_or_else(|| MailboxError::NotFound(key.to_string()))
    }

    async fn delete(&self, key: &str) -> std::result::Result<(), MailboxError> {
        self.admit()?;
        self.entries()
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| MailboxError::NotFound(key.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ThreadEvent, TypingPayload};

    fn cache(mailbox: Arc<MemoryMailbox>) -> HelperCache {
        HelperCache::new(
            mailbox,
            RetryPolicy::new(2, [Duration::from_millis(5)]),
            Duration::from_secs(1),
        )
    }

    #[tokio::test]
    async fn test_not_found_is_normalised() {
        let mailbox = Arc::new(MemoryMailbox::new());
        let cache = cache(mailbox.clone());

        assert_eq!(cache.get("missing").await.unwrap(), None);
        cache.delete("missing").await.unwrap();
        // Not-found is an answer, not a failure: one call each.
        assert_eq!(mailbox.calls(), 2);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let mailbox = Arc::new(MemoryMailbox::new());
        let cache = cache(mailbox.clone());
        mailbox.fail_next(2);

        cache.put("k", Bytes::from_static(b"v")).await.unwrap();
        assert_eq!(mailbox.calls(), 3);
        assert_eq!(cache.get("k").await.unwrap().unwrap(), Bytes::from_static(b"v"));
    }

    #[tokio::test]
    async fn test_failures_surface_after_exhaustion() {
        let mailbox = Arc::new(MemoryMailbox::new());
        let cache = cache(mailbox.clone());
        mailbox.fail_next(10);

        let err = cache.put("k", Bytes::new()).await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::Cache(MailboxError::Http { status: 503, .. })
        ));
        assert_eq!(mailbox.calls(), 3);
    }

    #[tokio::test]
    async fn test_offline_maps_to_cache_unavailable() {
        let mailbox = Arc::new(MemoryMailbox::new());
        mailbox.set_offline(true);
        let err = cache(mailbox).status().await.unwrap_err();
        assert!(matches!(err, TransportError::CacheUnavailable(_)));
    }

    #[tokio::test]
    async fn test_disabled_cache() {
        let cache = HelperCache::disabled();
        assert!(!cache.is_configured());
        assert!(matches!(
            cache.get("k").await,
            Err(TransportError::CacheUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_quota_limits() {
        let mailbox = MemoryMailbox::with_limits(MailboxLimits {
            ttl: Duration::from_secs(60),
            entry_limit: 2,
            limit_bytes: 8,
        });
        mailbox.put("a", Bytes::from_static(b"1234")).await.unwrap();
        mailbox.put("b", Bytes::from_static(b"1234")).await.unwrap();
        assert!(matches!(
            mailbox.put("c", Bytes::from_static(b"1")).await,
            Err(MailboxError::QuotaExceeded(_))
        ));
        // Replacing an entry only counts the difference.
        mailbox.put("a", Bytes::from_static(b"12")).await.unwrap();
        assert!(matches!(
            mailbox.put("b", Bytes::from_static(b"1234567")).await,
            Err(MailboxError::QuotaExceeded(_))
        ));

        let quota = mailbox.quota().await.unwrap();
        assert_eq!(quota.entry_count, 2);
        assert_eq!(quota.used_bytes, 6);
        assert_eq!(quota.ttl_seconds, 60);
        assert!(quota.oldest_entry_iso.unwrap() <= quota.newest_entry_iso.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire() {
        let mailbox = MemoryMailbox::with_limits(MailboxLimits {
            ttl: Duration::from_secs(10),
            ..MailboxLimits::default()
        });
        mailbox.put("k", Bytes::from_static(b"v")).await.unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(matches!(
            mailbox.get("k").await,
            Err(MailboxError::NotFound(_))
        ));
        assert_eq!(mailbox.status().await.unwrap().entries, 0);
    }

    #[tokio::test]
    async fn test_inbox_keeps_order_and_capacity() {
        let cache = cache(Arc::new(MemoryMailbox::new()));
        let thread = ThreadId::new("t1");
        let mut ids = Vec::new();
        for i in 0..(INBOX_CAPACITY + 3) {
            let frame = Frame::new(
                "alice",
                ThreadEvent::Typing(TypingPayload {
                    author: format!("a{i}"),
                    typing: true,
                }),
            );
            ids.push(frame.id.clone());
            cache.append_to_inbox(&thread, &frame).await.unwrap();
        }

        let frames = cache.read_inbox(&thread).await.unwrap();
        assert_eq!(frames.len(), INBOX_CAPACITY);
        assert_eq!(frames[0].id, ids[3]);
        assert_eq!(frames.last().unwrap().id, *ids.last().unwrap());
        assert!(cache.read_inbox(&ThreadId::new("t2")).await.unwrap().is_empty());
    }

    fn typing_frame(author: &str) -> Frame {
        Frame::new(
            "alice",
            ThreadEvent::Typing(TypingPayload {
                author: author.to_string(),
                typing: true,
            }),
        )
    }

    #[tokio::test]
    async fn test_cursor_is_per_reader() {
        let cache = cache(Arc::new(MemoryMailbox::new()));
        let thread = ThreadId::new("t1");
        let first = typing_frame("a");
        let second = typing_frame("b");
        cache.append_to_inbox(&thread, &first).await.unwrap();
        cache.append_to_inbox(&thread, &second).await.unwrap();

        assert_eq!(cache.read_inbox_since(&thread, "bob").await.unwrap().len(), 2);
        cache.advance_cursor(&thread, "bob", &first.id).await.unwrap();

        let rest = cache.read_inbox_since(&thread, "BOB").await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].id, second.id);
        assert_eq!(cache.read_inbox_since(&thread, "carol").await.unwrap().len(), 2);

        cache.advance_cursor(&thread, "bob", &second.id).await.unwrap();
        assert!(cache.read_inbox_since(&thread, "bob").await.unwrap().is_empty());
        // The frames stay parked for everyone else.
        assert_eq!(cache.read_inbox(&thread).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_stale_cursor_replays_inbox() {
        let cache = cache(Arc::new(MemoryMailbox::new()));
        let thread = ThreadId::new("t1");
        cache.append_to_inbox(&thread, &typing_frame("a")).await.unwrap();
        cache.advance_cursor(&thread, "bob", "gone").await.unwrap();
        assert_eq!(cache.read_inbox_since(&thread, "bob").await.unwrap().len(), 1);
    }
}
