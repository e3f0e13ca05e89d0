use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Credentials and target URLs the worker needs for one job.
///
/// Field names on the wire match what the worker reads from its descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobConfig {
    pub username: String,
    pub password: String,
    pub class_url: String,
    pub submission_url: String,
    pub headless: bool,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            username: String::new(),
            password: String::new(),
            class_url: String::new(),
            submission_url: String::new(),
            headless: true,
        }
    }
}

/// A partial config write. Omitted or empty strings keep the stored value.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigUpdate {
    pub username: Option<String>,
    pub password: Option<String>,
    pub class_url: Option<String>,
    pub submission_url: Option<String>,
    pub headless: Option<bool>,
}

impl JobConfig {
    /// Merge a partial update into this config.
    ///
    /// `headless` is not sticky: it becomes `false` only when the update
    /// says so explicitly.
    pub fn apply(&mut self, update: ConfigUpdate) {
        fn merge(slot: &mut String, value: Option<String>) {
            if let Some(v) = value {
                if !v.is_empty() {
                    *slot = v;
                }
            }
        }
        merge(&mut self.username, update.username);
        merge(&mut self.password, update.password);
        merge(&mut self.class_url, update.class_url);
        merge(&mut self.submission_url, update.submission_url);
        self.headless = update.headless != Some(false);
    }

    /// Names of the required fields that are still empty.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.username.trim().is_empty() {
            missing.push("username");
        }
        if self.password.is_empty() {
            missing.push("password");
        }
        if self.submission_url.trim().is_empty() {
            missing.push("submissionUrl");
        }
        missing
    }
}

/// Count the entries of a target list: non-empty lines that are not `#` comments.
pub fn count_targets(text: &str) -> usize {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .count()
}

#[derive(Debug, Default)]
struct SessionData {
    config: JobConfig,
    targets: String,
}

/// One caller's isolated execution context.
///
/// Config and target list sit behind a per-session mutex. The running flag
/// is a standalone atomic so the single-flight check never contends with
/// config reads.
pub struct Session {
    id: String,
    data: Mutex<SessionData>,
    running: AtomicBool,
    last_access: Mutex<Instant>,
    /// Fires when the session is evicted or drained. Jobs run under a child
    /// of this token.
    cancelled: CancellationToken,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

/// RAII guard for the running flag. Clears it on drop.
#[derive(Debug)]
pub struct RunGuard {
    session: Arc<Session>,
}

impl RunGuard {
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.session.running.store(false, Ordering::Release);
        tracing::debug!(session = %self.session.id, "running flag cleared");
    }
}

impl Session {
    pub fn new(id: String) -> Self {
        Self {
            id,
            data: Mutex::new(SessionData::default()),
            running: AtomicBool::new(false),
            last_access: Mutex::new(Instant::now()),
            cancelled: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> JobConfig {
        self.data.lock().config.clone()
    }

    /// Apply a partial update and return the resulting config.
    pub fn update_config(&self, update: ConfigUpdate) -> JobConfig {
        let mut data = self.data.lock();
        data.config.apply(update);
        data.config.clone()
    }

    pub fn targets(&self) -> String {
        self.data.lock().targets.clone()
    }

    /// Replace the target list wholesale, returning the number of entries.
    pub fn set_targets(&self, text: String) -> usize {
        let count = count_targets(&text);
        self.data.lock().targets = text;
        count
    }

    /// Config and target list read under one lock.
    pub fn snapshot(&self) -> (JobConfig, String) {
        let data = self.data.lock();
        (data.config.clone(), data.targets.clone())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Mark a job as running if none is.
    ///
    /// A single compare-exchange: of two concurrent callers exactly one gets
    /// the guard. The flag stays set until the guard is dropped.
    pub fn try_start(self: &Arc<Self>) -> Option<RunGuard> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunGuard {
                session: Arc::clone(self),
            })
    }

    pub fn touch(&self) {
        self.touch_at(Instant::now());
    }

    pub fn touch_at(&self, now: Instant) {
        let mut last = self.last_access.lock();
        if now > *last {
            *last = now;
        }
    }

    pub fn last_access(&self) -> Instant {
        *self.last_access.lock()
    }

    /// Idle time as of `now`. Zero if `now` precedes the last access.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_access())
    }

    /// Token cancelled when the session is removed from the registry.
    pub fn cancelled(&self) -> &CancellationToken {
        &self.cancelled
    }
}

/// Generate a fresh session identifier: 122 random bits, hex encoded.
pub fn mint_session_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Outcome of [`SessionRegistry::resolve`].
#[derive(Debug, Clone)]
pub struct Resolved {
    pub session: Arc<Session>,
    /// True when the identifier was absent or unknown and a session was minted.
    pub created: bool,
}

/// Maps session identifiers to session state.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<RwLock<HashMap<String, Arc<Session>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up `candidate`, or mint a new session if it is absent or unknown.
    ///
    /// An unknown identifier is never adopted; the caller always receives a
    /// server-generated one. The session's last access is refreshed either way.
    pub fn resolve(&self, candidate: Option<&str>) -> Resolved {
        if let Some(id) = candidate {
            if let Some(session) = self.inner.read().get(id).cloned() {
                session.touch();
                return Resolved {
                    session,
                    created: false,
                };
            }
        }

        let mut inner = self.inner.write();
        let id = loop {
            let id = mint_session_id();
            if !inner.contains_key(&id) {
                break id;
            }
        };
        let session = Arc::new(Session::new(id.clone()));
        inner.insert(id, Arc::clone(&session));
        tracing::info!(session = %session.id(), "session created");
        Resolved {
            session,
            created: true,
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.inner.read().get(id).cloned()
    }

    /// Remove a session, cancelling anything running under it.
    pub fn remove(&self, id: &str) -> Option<Arc<Session>> {
        let removed = self.inner.write().remove(id);
        if let Some(ref session) = removed {
            session.cancelled.cancel();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every session idle for longer than `ttl` as of `now`.
    ///
    /// Selection and removal happen under one write lock, so a request that
    /// touches a session concurrently either lands before (and keeps it) or
    /// finds it gone and gets a fresh one.
    pub fn evict_idle(&self, ttl: Duration, now: Instant) -> Vec<Arc<Session>> {
        let mut inner = self.inner.write();
        let expired: Vec<String> = inner
            .iter()
            .filter(|(_, s)| s.idle_for(now) > ttl)
            .map(|(id, _)| id.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|id| inner.remove(&id))
            .inspect(|session| session.cancelled.cancel())
            .collect()
    }

    /// Remove all sessions, cancelling their jobs. Used on shutdown.
    pub fn drain(&self) -> Vec<Arc<Session>> {
        let drained: Vec<Arc<Session>> = {
            let mut inner = self.inner.write();
            inner.drain().map(|(_, s)| s).collect()
        };
        for session in &drained {
            session.cancelled.cancel();
        }
        drained
    }
}
