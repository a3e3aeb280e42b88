//! Session management for the hub.
//!
//! Sessions are server-assigned, opaque, and expire after an idle TTL
//! enforced by a sweeper task. Share tokens let an additional client attach
//! to an existing session; each session keeps a bounded history ring for
//! debugging.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{HubError, Result};

/// Configuration for session management
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Maximum number of sessions to track
    pub max_sessions: usize,
    /// Idle TTL; sessions untouched for longer are removed by the sweeper
    pub idle_ttl: Duration,
    /// Sweeper cadence
    pub sweep_interval: Duration,
    /// Maximum history entries kept per session
    pub max_history: usize,
    /// TTL for share tokens
    pub share_token_ttl: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions: 1000,
            idle_ttl: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(60),
            max_history: 64,
            share_token_ttl: Duration::from_secs(600),
        }
    }
}

/// One entry in a session's debug history
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    /// Entry timestamp
    pub timestamp: DateTime<Utc>,
    /// Method that was invoked
    pub method: String,
    /// Whether the call succeeded
    pub success: bool,
}

/// A tracked session
#[derive(Debug, Clone)]
pub struct Session {
    /// Server-assigned opaque identifier
    pub id: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last activity time
    pub last_used_at: DateTime<Utc>,
    /// Optional client identifier
    pub client_id: Option<String>,
    /// Optional share token currently attached to this session
    pub share_token: Option<String>,
    /// Connected client identifiers
    pub clients: HashSet<String>,
    /// Bounded history ring
    pub history: VecDeque<HistoryEntry>,
}

impl Session {
    fn new(client_id: Option<String>) -> Self {
        let now = Utc::now();
        let mut clients = HashSet::new();
        if let Some(ref id) = client_id {
            clients.insert(id.clone());
        }
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            last_used_at: now,
            client_id,
            share_token: None,
            clients,
            history: VecDeque::new(),
        }
    }
}

#[derive(Debug, Clone)]
struct ShareToken {
    session_id: String,
    expires_at: DateTime<Utc>,
}

/// Idle-TTL session table with share tokens and a sweeper task
#[derive(Debug)]
pub struct SessionManager {
    config: SessionConfig,
    sessions: Arc<DashMap<String, Session>>,
    share_tokens: Arc<DashMap<String, ShareToken>>,
    sweeper: RwLock<Option<tokio::task::JoinHandle<()>>>,
}

impl SessionManager {
    /// Create a new session manager
    #[must_use]
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            sessions: Arc::new(DashMap::new()),
            share_tokens: Arc::new(DashMap::new()),
            sweeper: RwLock::new(None),
        }
    }

    /// Create a session, evicting the least recently used one at capacity
    pub fn create(&self, client_id: Option<String>) -> Session {
        self.enforce_capacity();
        let session = Session::new(client_id);
        self.sessions.insert(session.id.clone(), session.clone());
        tracing::debug!(session = %session.id, "session created");
        session
    }

    /// Refresh a session's last-used timestamp
    pub fn touch(&self, session_id: &str) -> Result<()> {
        match self.sessions.get_mut(session_id) {
            Some(mut session) => {
                session.last_used_at = Utc::now();
                Ok(())
            }
            None => Err(HubError::session(format!(
                "session not found: {session_id}"
            ))),
        }
    }

    /// Look up a session by id
    #[must_use]
    pub fn get(&self, session_id: &str) -> Option<Session> {
        self.sessions.get(session_id).map(|s| s.clone())
    }

    /// Remove a session, returning whether it existed
    pub fn remove(&self, session_id: &str) -> bool {
        let removed = self.sessions.remove(session_id).is_some();
        if removed {
            self.share_tokens
                .retain(|_, token| token.session_id != session_id);
            tracing::debug!(session = %session_id, "session removed");
        }
        removed
    }

    /// Append a history entry to a session's bounded ring
    pub fn record(&self, session_id: &str, method: &str, success: bool) {
        if let Some(mut session) = self.sessions.get_mut(session_id) {
            if session.history.len() >= self.config.max_history {
                session.history.pop_front();
            }
            session.history.push_back(HistoryEntry {
                timestamp: Utc::now(),
                method: method.to_string(),
                success,
            });
        }
    }

    /// Issue a share token for an existing session
    pub fn issue_share_token(&self, session_id: &str) -> Result<String> {
        let mut session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| HubError::session(format!("session not found: {session_id}")))?;

        let token = Uuid::new_v4().to_string();
        session.share_token = Some(token.clone());
        let ttl = chrono::Duration::from_std(self.config.share_token_ttl)
            .unwrap_or_else(|_| chrono::Duration::seconds(600));
        self.share_tokens.insert(
            token.clone(),
            ShareToken {
                session_id: session_id.to_string(),
                expires_at: Utc::now() + ttl,
            },
        );
        Ok(token)
    }

    /// Attach a new client to a session via a share token
    pub fn join_by_token(&self, token: &str, client_id: &str) -> Result<Session> {
        let entry = self
            .share_tokens
            .get(token)
            .ok_or_else(|| HubError::session("share token not found"))?;

        if entry.expires_at < Utc::now() {
            drop(entry);
            self.share_tokens.remove(token);
            return Err(HubError::session("share token expired"));
        }

        let session_id = entry.session_id.clone();
        drop(entry);

        let mut session = self
            .sessions
            .get_mut(&session_id)
            .ok_or_else(|| HubError::session("session behind share token is gone"))?;
        session.clients.insert(client_id.to_string());
        session.last_used_at = Utc::now();
        Ok(session.clone())
    }

    /// Remove sessions idle beyond the TTL and expired share tokens.
    ///
    /// Returns the number of sessions removed.
    pub fn sweep(&self) -> usize {
        let ttl = chrono::Duration::from_std(self.config.idle_ttl)
            .unwrap_or_else(|_| chrono::Duration::seconds(3600));
        let cutoff = Utc::now() - ttl;

        // Collect in bounded chunks so the table is never held during removal.
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| entry.last_used_at < cutoff)
            .map(|entry| entry.id.clone())
            .collect();

        let count = expired.len();
        for id in expired {
            self.remove(&id);
        }

        let now = Utc::now();
        self.share_tokens.retain(|_, token| token.expires_at > now);

        if count > 0 {
            tracing::debug!(removed = count, "session sweep completed");
        }
        count
    }

    /// Start the sweeper task; it stops when `cancel` is triggered
    pub fn start_sweeper(self: &Arc<Self>, cancel: CancellationToken) {
        let manager = Arc::clone(self);
        let interval = manager.config.sweep_interval;
        let handle = tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = timer.tick() => {
                        manager.sweep();
                    }
                }
            }
        });
        *self.sweeper.write() = Some(handle);
    }

    /// Stop the sweeper task if running
    pub fn stop_sweeper(&self) {
        if let Some(handle) = self.sweeper.write().take() {
            handle.abort();
        }
    }

    /// Number of live sessions
    #[must_use]
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// All live session ids
    #[must_use]
    pub fn session_ids(&self) -> Vec<String> {
        self.sessions.iter().map(|s| s.id.clone()).collect()
    }

    fn enforce_capacity(&self) {
        if self.sessions.len() < self.config.max_sessions {
            return;
        }

        let mut entries: Vec<(String, DateTime<Utc>)> = self
            .sessions
            .iter()
            .map(|entry| (entry.id.clone(), entry.last_used_at))
            .collect();
        entries.sort_by_key(|(_, ts)| *ts);

        let mut to_evict = self.sessions.len().saturating_sub(self.config.max_sessions) + 1;
        for (id, _) in entries {
            if to_evict == 0 {
                break;
            }
            if self.remove(&id) {
                tracing::debug!(session = %id, "session evicted at capacity");
                to_evict -= 1;
            }
        }
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}
