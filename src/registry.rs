//! Process-wide session and user activity bookkeeping.
//!
//! The registry tracks which sessions exist, which are *active* (between
//! `Recording` and `Speaking` inclusive), and per-user conversation
//! activity. The background analyzer reads it to gate and pace its cycles;
//! controllers write it on every state transition.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// How many turn timestamps to keep per user for frequency estimation.
const TURN_HISTORY_LIMIT: usize = 64;

#[derive(Debug)]
struct SessionEntry {
    user_id: String,
}

#[derive(Debug, Default)]
struct UserActivity {
    session_count: usize,
    active_count: usize,
    last_detach: Option<Instant>,
    last_turn_finished: Option<Instant>,
    turn_history: VecDeque<Instant>,
}

#[derive(Debug, Default)]
struct Inner {
    sessions: HashMap<String, SessionEntry>,
    active: HashSet<String>,
    users: HashMap<String, UserActivity>,
}

/// Shared registry. All methods take `&self`; the inner map lock is held
/// only for the duration of the bookkeeping.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    inner: Mutex<Inner>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Record a new session for the user. Returns whether this is the
    /// user's first live session (used to start their analyzer).
    pub fn register(&self, session_id: &str, user_id: &str) -> bool {
        let mut inner = self.lock();
        inner.sessions.insert(
            session_id.to_owned(),
            SessionEntry {
                user_id: user_id.to_owned(),
            },
        );
        let user = inner.users.entry(user_id.to_owned()).or_default();
        user.session_count += 1;
        user.session_count == 1
    }

    /// Remove a session. Returns whether the user now has no sessions.
    pub fn unregister(&self, session_id: &str) -> bool {
        let mut inner = self.lock();
        let Some(entry) = inner.sessions.remove(session_id) else {
            return false;
        };
        let was_active = inner.active.remove(session_id);
        let Some(user) = inner.users.get_mut(&entry.user_id) else {
            return false;
        };
        user.session_count = user.session_count.saturating_sub(1);
        if was_active {
            user.active_count = user.active_count.saturating_sub(1);
        }
        if user.session_count == 0 {
            user.last_detach = Some(Instant::now());
            return true;
        }
        false
    }

    /// Mark a session active (entering `Recording`). Idempotent.
    pub fn mark_active(&self, session_id: &str) {
        let mut inner = self.lock();
        if !inner.active.insert(session_id.to_owned()) {
            return;
        }
        if let Some(user_id) = inner.sessions.get(session_id).map(|e| e.user_id.clone()) {
            if let Some(user) = inner.users.get_mut(&user_id) {
                user.active_count += 1;
            }
        }
    }

    /// Mark a session idle (returning to `Idle`). Idempotent.
    pub fn mark_idle(&self, session_id: &str) {
        let mut inner = self.lock();
        if !inner.active.remove(session_id) {
            return;
        }
        if let Some(user_id) = inner.sessions.get(session_id).map(|e| e.user_id.clone()) {
            if let Some(user) = inner.users.get_mut(&user_id) {
                user.active_count = user.active_count.saturating_sub(1);
            }
        }
    }

    /// Whether the session is currently in the active set.
    pub fn is_active(&self, session_id: &str) -> bool {
        self.lock().active.contains(session_id)
    }

    /// Whether any of the user's sessions is active.
    pub fn is_user_active(&self, user_id: &str) -> bool {
        self.lock()
            .users
            .get(user_id)
            .is_some_and(|u| u.active_count > 0)
    }

    /// Number of live sessions for the user.
    pub fn user_session_count(&self, user_id: &str) -> usize {
        self.lock()
            .users
            .get(user_id)
            .map_or(0, |u| u.session_count)
    }

    /// Record a finished turn for the user.
    pub fn note_turn_finished(&self, user_id: &str) {
        let mut inner = self.lock();
        let user = inner.users.entry(user_id.to_owned()).or_default();
        let now = Instant::now();
        user.last_turn_finished = Some(now);
        user.turn_history.push_back(now);
        while user.turn_history.len() > TURN_HISTORY_LIMIT {
            user.turn_history.pop_front();
        }
    }

    /// Whether the user had a turn finish within `window`.
    pub fn turn_finished_within(&self, user_id: &str, window: Duration) -> bool {
        self.lock().users.get(user_id).is_some_and(|u| {
            u.last_turn_finished
                .is_some_and(|at| at.elapsed() < window)
        })
    }

    /// Number of turns the user finished within `window`.
    pub fn turns_within(&self, user_id: &str, window: Duration) -> usize {
        self.lock().users.get(user_id).map_or(0, |u| {
            u.turn_history
                .iter()
                .filter(|at| at.elapsed() < window)
                .count()
        })
    }

    /// How long the user has had no sessions, if currently detached.
    pub fn detached_for(&self, user_id: &str) -> Option<Duration> {
        let inner = self.lock();
        let user = inner.users.get(user_id)?;
        if user.session_count > 0 {
            return None;
        }
        user.last_detach.map(|at| at.elapsed())
    }

    /// Drop the user's activity record. Called when their analyzer stops.
    pub fn forget_user(&self, user_id: &str) {
        let mut inner = self.lock();
        if inner
            .users
            .get(user_id)
            .is_some_and(|u| u.session_count == 0)
        {
            inner.users.remove(user_id);
        }
    }

    /// Session ids currently active. Test and diagnostics helper.
    pub fn active_session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().active.iter().cloned().collect();
        ids.sort();
        ids
    }
}
