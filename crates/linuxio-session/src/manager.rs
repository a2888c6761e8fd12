//! Session manager: store, timeouts, refresh, GC sweep, delete hooks.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::cookie::{CookieConfig, parse_cookie_header};
use crate::error::SessionError;
use crate::session::{BridgeLink, DeleteReason, Session, SessionUser, generate_session_id};

/// Session manager tuning knobs.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Maximum inactivity before a session is collected.
    pub idle_timeout: Duration,
    /// Hard lifetime of a session.
    pub absolute_timeout: Duration,
    /// Minimum interval between idle-deadline extensions.
    pub refresh_throttle: Duration,
    /// Interval of the background idle sweep.
    pub gc_interval: Duration,
    /// Allow at most one live session per account.
    pub single_session: bool,
    /// Cookie attributes.
    pub cookie: CookieConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(30 * 60),
            absolute_timeout: Duration::from_secs(12 * 60 * 60),
            refresh_throttle: Duration::from_secs(60),
            gc_interval: Duration::from_secs(15),
            single_session: false,
            cookie: CookieConfig::default(),
        }
    }
}

type Hook = dyn Fn(Session, DeleteReason) + Send + Sync;

struct Entry {
    user: SessionUser,
    privileged: bool,
    created: Instant,
    last_access: Instant,
    last_refresh: Instant,
    idle_until: Instant,
    absolute_until: Instant,
    link: Option<Arc<dyn BridgeLink>>,
}

struct ManagerInner {
    sessions: DashMap<String, Entry>,
    hooks: std::sync::RwLock<Vec<Arc<Hook>>>,
    config: SessionConfig,
}

impl ManagerInner {
    /// Remove a session and fan its deletion out to hooks. Idempotent;
    /// returns whether a session was actually removed.
    fn delete(self: &Arc<Self>, id: &str, reason: DeleteReason) -> bool {
        let Some((id, entry)) = self.sessions.remove(id) else {
            return false;
        };
        tracing::info!(session = %id, user = %entry.user.name, reason = %reason, "session deleted");

        if let Some(link) = &entry.link {
            link.close();
        }

        let snapshot = snapshot(&id, &entry, None);
        let hooks: Vec<Arc<Hook>> = match self.hooks.read() {
            Ok(guard) => guard.clone(),
            Err(_) => Vec::new(),
        };
        for hook in hooks {
            let session = snapshot.clone();
            // One task per hook; a panicking hook dies alone.
            tokio::spawn(async move {
                hook(session, reason);
            });
        }
        true
    }

    fn terminator(self: &Arc<Self>, id: &str) -> Arc<dyn Fn(DeleteReason) + Send + Sync> {
        let weak = Arc::downgrade(self);
        let id = id.to_string();
        Arc::new(move |reason| {
            if let Some(inner) = weak.upgrade() {
                inner.delete(&id, reason);
            }
        })
    }
}

fn snapshot(
    id: &str,
    entry: &Entry,
    terminate: Option<Arc<dyn Fn(DeleteReason) + Send + Sync>>,
) -> Session {
    Session {
        id: id.to_string(),
        user: entry.user.clone(),
        privileged: entry.privileged,
        created: entry.created,
        last_access: entry.last_access,
        last_refresh: entry.last_refresh,
        idle_until: entry.idle_until,
        absolute_until: entry.absolute_until,
        terminate,
    }
}

/// Process-wide session registry.
///
/// Cloning is cheap; clones share the same store.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

impl SessionManager {
    /// Create a manager with the given configuration.
    #[must_use]
    pub fn new(config: SessionConfig) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                sessions: DashMap::new(),
                hooks: std::sync::RwLock::new(Vec::new()),
                config,
            }),
        }
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Register a delete hook. Hooks run concurrently on deletion and
    /// must be side-effect-independent of one another.
    pub fn on_delete<F>(&self, hook: F)
    where
        F: Fn(Session, DeleteReason) + Send + Sync + 'static,
    {
        if let Ok(mut hooks) = self.inner.hooks.write() {
            hooks.push(Arc::new(hook));
        }
    }

    /// Create a session for a freshly authenticated user.
    ///
    /// With single-session enabled, existing sessions for the same
    /// account are deleted with reason `Manual` before the new one is
    /// committed.
    pub fn create(&self, user: SessionUser, privileged: bool) -> Session {
        if self.inner.config.single_session {
            let displaced: Vec<String> = self
                .inner
                .sessions
                .iter()
                .filter(|entry| entry.user.name == user.name)
                .map(|entry| entry.key().clone())
                .collect();
            for id in displaced {
                self.inner.delete(&id, DeleteReason::Manual);
            }
        }

        let id = generate_session_id();
        let now = Instant::now();
        let absolute_until = now + self.inner.config.absolute_timeout;
        let idle_until = (now + self.inner.config.idle_timeout).min(absolute_until);
        let entry = Entry {
            user,
            privileged,
            created: now,
            last_access: now,
            last_refresh: now,
            idle_until,
            absolute_until,
            link: None,
        };
        tracing::info!(session = %id, user = %entry.user.name, privileged, "session created");

        let session = snapshot(&id, &entry, Some(self.inner.terminator(&id)));
        self.inner.sessions.insert(id, entry);
        session
    }

    /// Load a session without refreshing it.
    ///
    /// An absolutely expired entry behaves as if it were already gone:
    /// it is deleted with reason `GcAbsolute` and `NotFound` is returned.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::NotFound` for unknown or TTL-expired ids.
    pub fn get(&self, id: &str) -> Result<Session, SessionError> {
        {
            let entry = self.inner.sessions.get(id).ok_or(SessionError::NotFound)?;
            if Instant::now() < entry.absolute_until {
                return Ok(snapshot(id, &entry, Some(self.inner.terminator(id))));
            }
        }
        // Past the absolute deadline the TTL treats the entry as gone.
        self.inner.delete(id, DeleteReason::GcAbsolute);
        Err(SessionError::NotFound)
    }

    /// Extend a session's life on activity.
    ///
    /// Within the refresh throttle only `last_access` moves; outside it
    /// `last_refresh` and `idle_until` move too, with the idle deadline
    /// clamped to the absolute one.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::NotFound` for unknown ids.
    pub fn refresh(&self, id: &str) -> Result<(), SessionError> {
        let mut entry = self
            .inner
            .sessions
            .get_mut(id)
            .ok_or(SessionError::NotFound)?;
        let now = Instant::now();
        entry.last_access = now;
        if now.duration_since(entry.last_refresh) >= self.inner.config.refresh_throttle {
            entry.last_refresh = now;
            entry.idle_until = (now + self.inner.config.idle_timeout).min(entry.absolute_until);
        }
        Ok(())
    }

    /// Validate a session id from a request: expire it if a deadline has
    /// passed, refresh it otherwise, and return the decoded session.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::NotFound` for unknown ids and
    /// `SessionError::Expired` when a deadline passed (the session is
    /// deleted with reason `GcIdle` or `GcAbsolute`).
    pub fn validate(&self, id: &str) -> Result<Session, SessionError> {
        let expiry = {
            let entry = self.inner.sessions.get(id).ok_or(SessionError::NotFound)?;
            let now = Instant::now();
            if now >= entry.absolute_until {
                Some(DeleteReason::GcAbsolute)
            } else if now >= entry.idle_until {
                Some(DeleteReason::GcIdle)
            } else {
                None
            }
        };

        if let Some(reason) = expiry {
            self.inner.delete(id, reason);
            return Err(SessionError::Expired);
        }

        self.refresh(id)?;
        let entry = self.inner.sessions.get(id).ok_or(SessionError::NotFound)?;
        Ok(snapshot(id, &entry, Some(self.inner.terminator(id))))
    }

    /// Validate the session named by a request's `Cookie` header.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::MissingCookie` when the header carries no
    /// session cookie, otherwise as [`SessionManager::validate`].
    pub fn validate_from_request(&self, cookie_header: &str) -> Result<Session, SessionError> {
        let id = parse_cookie_header(cookie_header, &self.inner.config.cookie.name)
            .ok_or(SessionError::MissingCookie)?;
        self.validate(id)
    }

    /// Delete a session. Idempotent; closes any attached bridge link and
    /// fires delete hooks asynchronously.
    pub fn delete(&self, id: &str, reason: DeleteReason) -> bool {
        self.inner.delete(id, reason)
    }

    /// Attach a bridge link to a session; it is closed on delete. Any
    /// previous link is closed immediately.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::NotFound` for unknown ids.
    pub fn attach_bridge(
        &self,
        id: &str,
        link: Arc<dyn BridgeLink>,
    ) -> Result<(), SessionError> {
        let mut entry = self
            .inner
            .sessions
            .get_mut(id)
            .ok_or(SessionError::NotFound)?;
        if let Some(previous) = entry.link.replace(link) {
            previous.close();
        }
        Ok(())
    }

    /// Decoded, non-expired sessions.
    #[must_use]
    pub fn active_sessions(&self) -> Vec<Session> {
        let now = Instant::now();
        self.inner
            .sessions
            .iter()
            .filter(|entry| now < entry.idle_until && now < entry.absolute_until)
            .map(|entry| snapshot(entry.key(), &entry, None))
            .collect()
    }

    /// Number of stored sessions, including ones awaiting the sweep.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.sessions.is_empty()
    }

    /// Render the session cookie for a freshly created session.
    #[must_use]
    pub fn cookie_for(&self, session: &Session) -> String {
        self.inner
            .config
            .cookie
            .build(&session.id, self.inner.config.absolute_timeout)
    }

    /// Start the background sweep collecting expired sessions. The task
    /// stops on its own once the manager is dropped.
    pub fn spawn_gc(&self) -> tokio::task::JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let interval = self.inner.config.gc_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let now = Instant::now();
                let mut absolute = Vec::new();
                let mut idle = Vec::new();
                for entry in inner.sessions.iter() {
                    if now >= entry.absolute_until {
                        absolute.push(entry.key().clone());
                    } else if now >= entry.idle_until {
                        idle.push(entry.key().clone());
                    }
                }
                for id in absolute {
                    inner.delete(&id, DeleteReason::GcAbsolute);
                }
                for id in idle {
                    inner.delete(&id, DeleteReason::GcIdle);
                }
            }
        })
    }

    /// Delete every session with reason `ServerQuit`.
    pub fn shutdown(&self) {
        let ids: Vec<String> = self
            .inner
            .sessions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for id in ids {
            self.inner.delete(&id, DeleteReason::ServerQuit);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    fn test_user() -> SessionUser {
        SessionUser {
            name: "alice".to_string(),
            uid: 1000,
            gid: 1000,
        }
    }

    fn short_config(idle_ms: u64, absolute_ms: u64) -> SessionConfig {
        SessionConfig {
            idle_timeout: Duration::from_millis(idle_ms),
            absolute_timeout: Duration::from_millis(absolute_ms),
            refresh_throttle: Duration::from_millis(0),
            gc_interval: Duration::from_millis(5),
            ..SessionConfig::default()
        }
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let manager = SessionManager::new(SessionConfig::default());
        let session = manager.create(test_user(), true);

        assert_eq!(session.id.len(), 32);
        assert!(session.idle_until <= session.absolute_until);

        let loaded = manager.get(&session.id).unwrap();
        assert_eq!(loaded.user.name, "alice");
        assert!(loaded.privileged);
    }

    #[tokio::test]
    async fn test_get_unknown_id() {
        let manager = SessionManager::new(SessionConfig::default());
        assert_eq!(manager.get("deadbeef"), Err(SessionError::NotFound));
    }

    #[tokio::test]
    async fn test_idle_clamped_to_absolute() {
        // Idle timeout longer than absolute: idle deadline must clamp.
        let manager = SessionManager::new(short_config(10_000, 100));
        let session = manager.create(test_user(), false);
        assert!(session.idle_until <= session.absolute_until);
    }

    #[tokio::test]
    async fn test_idle_expiry_deletes_with_gc_idle() {
        let manager = SessionManager::new(short_config(20, 500));
        let (tx, mut rx) = mpsc::unbounded_channel();
        manager.on_delete(move |session, reason| {
            let _ = tx.send((session.id.clone(), reason));
        });

        let session = manager.create(test_user(), false);
        tokio::time::sleep(Duration::from_millis(25)).await;

        let header = format!("session_id={}", session.id);
        assert_eq!(
            manager.validate_from_request(&header),
            Err(SessionError::Expired)
        );
        assert_eq!(manager.get(&session.id), Err(SessionError::NotFound));

        let (hook_id, hook_reason) = rx.recv().await.unwrap();
        assert_eq!(hook_id, session.id);
        assert_eq!(hook_reason, DeleteReason::GcIdle);
        // Exactly once.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_absolute_expiry_reason() {
        let manager = SessionManager::new(short_config(500, 20));
        let (tx, mut rx) = mpsc::unbounded_channel();
        manager.on_delete(move |_, reason| {
            let _ = tx.send(reason);
        });

        let session = manager.create(test_user(), false);
        tokio::time::sleep(Duration::from_millis(25)).await;

        assert_eq!(manager.validate(&session.id), Err(SessionError::Expired));
        assert_eq!(rx.recv().await.unwrap(), DeleteReason::GcAbsolute);
    }

    #[tokio::test]
    async fn test_single_session_displaces_previous() {
        let config = SessionConfig {
            single_session: true,
            ..SessionConfig::default()
        };
        let manager = SessionManager::new(config);
        let (tx, mut rx) = mpsc::unbounded_channel();
        manager.on_delete(move |session, reason| {
            let _ = tx.send((session.id.clone(), reason));
        });

        let first = manager.create(test_user(), false);
        let second = manager.create(test_user(), false);

        assert_eq!(manager.get(&first.id), Err(SessionError::NotFound));
        assert!(manager.get(&second.id).is_ok());

        let (hook_id, hook_reason) = rx.recv().await.unwrap();
        assert_eq!(hook_id, first.id);
        assert_eq!(hook_reason, DeleteReason::Manual);
    }

    #[tokio::test]
    async fn test_single_session_leaves_other_users_alone() {
        let config = SessionConfig {
            single_session: true,
            ..SessionConfig::default()
        };
        let manager = SessionManager::new(config);

        let alice = manager.create(test_user(), false);
        let bob = manager.create(
            SessionUser {
                name: "bob".to_string(),
                uid: 1001,
                gid: 1001,
            },
            false,
        );

        assert!(manager.get(&alice.id).is_ok());
        assert!(manager.get(&bob.id).is_ok());
    }

    #[tokio::test]
    async fn test_delete_idempotent() {
        let manager = SessionManager::new(SessionConfig::default());
        let counter = Arc::new(AtomicUsize::new(0));
        let hook_counter = Arc::clone(&counter);
        manager.on_delete(move |_, _| {
            hook_counter.fetch_add(1, Ordering::SeqCst);
        });

        let session = manager.create(test_user(), false);
        assert!(manager.delete(&session.id, DeleteReason::Logout));
        assert!(!manager.delete(&session.id, DeleteReason::Logout));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(manager.get(&session.id), Err(SessionError::NotFound));
    }

    #[tokio::test]
    async fn test_panicking_hook_does_not_break_teardown() {
        let manager = SessionManager::new(SessionConfig::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        manager.on_delete(|_, _| panic!("bad subscriber"));
        manager.on_delete(move |_, reason| {
            let _ = tx.send(reason);
        });

        let session = manager.create(test_user(), false);
        assert!(manager.delete(&session.id, DeleteReason::Logout));
        assert_eq!(rx.recv().await.unwrap(), DeleteReason::Logout);
        assert_eq!(manager.get(&session.id), Err(SessionError::NotFound));
    }

    #[tokio::test]
    async fn test_refresh_throttle() {
        let config = SessionConfig {
            refresh_throttle: Duration::from_secs(60),
            ..SessionConfig::default()
        };
        let manager = SessionManager::new(config);
        let session = manager.create(test_user(), false);

        tokio::time::sleep(Duration::from_millis(15)).await;
        manager.refresh(&session.id).unwrap();
        let first = manager.get(&session.id).unwrap();

        tokio::time::sleep(Duration::from_millis(15)).await;
        manager.refresh(&session.id).unwrap();
        let second = manager.get(&session.id).unwrap();

        // Within the throttle: last_access moves both times, the idle
        // deadline at most once.
        assert!(second.last_access > first.last_access);
        assert_eq!(second.last_refresh, first.last_refresh);
        assert_eq!(second.idle_until, first.idle_until);
    }

    #[tokio::test]
    async fn test_refresh_outside_throttle_moves_idle_deadline() {
        let config = SessionConfig {
            refresh_throttle: Duration::from_millis(10),
            ..SessionConfig::default()
        };
        let manager = SessionManager::new(config);
        let session = manager.create(test_user(), false);

        tokio::time::sleep(Duration::from_millis(15)).await;
        manager.refresh(&session.id).unwrap();
        let refreshed = manager.get(&session.id).unwrap();

        assert!(refreshed.last_refresh > session.last_refresh);
        assert!(refreshed.idle_until > session.idle_until);
        assert!(refreshed.idle_until <= refreshed.absolute_until);
    }

    #[tokio::test]
    async fn test_gc_sweep_collects_idle_sessions() {
        let manager = SessionManager::new(short_config(20, 10_000));
        let (tx, mut rx) = mpsc::unbounded_channel();
        manager.on_delete(move |_, reason| {
            let _ = tx.send(reason);
        });
        let gc = manager.spawn_gc();

        let session = manager.create(test_user(), false);
        let reason = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("sweep collects the session")
            .unwrap();
        assert_eq!(reason, DeleteReason::GcIdle);
        assert_eq!(manager.get(&session.id), Err(SessionError::NotFound));

        gc.abort();
    }

    #[tokio::test]
    async fn test_terminate_snapshot_deletes_session() {
        let manager = SessionManager::new(SessionConfig::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        manager.on_delete(move |_, reason| {
            let _ = tx.send(reason);
        });

        let session = manager.create(test_user(), false);
        session.terminate(DeleteReason::BridgeFailure);

        assert_eq!(rx.recv().await.unwrap(), DeleteReason::BridgeFailure);
        assert_eq!(manager.get(&session.id), Err(SessionError::NotFound));
    }

    #[tokio::test]
    async fn test_bridge_link_closed_on_delete() {
        struct Link(Arc<AtomicUsize>);
        impl BridgeLink for Link {
            fn close(&self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let manager = SessionManager::new(SessionConfig::default());
        let closed = Arc::new(AtomicUsize::new(0));
        let session = manager.create(test_user(), false);
        manager
            .attach_bridge(&session.id, Arc::new(Link(Arc::clone(&closed))))
            .unwrap();

        manager.delete(&session.id, DeleteReason::Logout);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_active_sessions_excludes_expired() {
        let manager = SessionManager::new(short_config(20, 10_000));
        manager.create(test_user(), false);
        assert_eq!(manager.active_sessions().len(), 1);

        tokio::time::sleep(Duration::from_millis(25)).await;
        assert!(manager.active_sessions().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_reason() {
        let manager = SessionManager::new(SessionConfig::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        manager.on_delete(move |_, reason| {
            let _ = tx.send(reason);
        });

        manager.create(test_user(), false);
        manager.shutdown();

        assert_eq!(rx.recv().await.unwrap(), DeleteReason::ServerQuit);
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_missing_cookie() {
        let manager = SessionManager::new(SessionConfig::default());
        assert_eq!(
            manager.validate_from_request("theme=dark"),
            Err(SessionError::MissingCookie)
        );
    }
}
