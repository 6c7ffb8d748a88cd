//! Per-user background analysis.
//!
//! Each user with at least one live session gets an analyzer task. On an
//! adaptive interval it searches the memory store on three fixed themes,
//! synthesizes a profile, and submits it through the scaffold cache's
//! background write path (so the freshness guard arbitrates against
//! realtime updates). Cycles are skipped while the user is mid-conversation.
//!
//! The task also serves one-shot scaffold warms for sessions that hit a
//! cold cache: a single search plus a background write, allowed to run even
//! while the session is active since there is no realtime entry to protect.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use rand::Rng;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AnalyzerConfig;
use crate::memory::ops::{MemoryOpKind, MemoryOperation};
use crate::memory::writer::MemoryWriter;
use crate::registry::SessionRegistry;
use crate::scaffold::{Scaffold, ScaffoldCache, ScaffoldValue};
use crate::vendor::{MemoryHit, MemoryVendor};

/// The fixed analysis themes. Exactly three searches per cycle; query text
/// may be personalized, the count never varies.
const THEMES: [(&str, &str); 3] = [
    ("attachment", "attachment patterns and moments of closeness"),
    ("vulnerability", "expressions of vulnerability and unmet needs"),
    ("growth", "signs of growth and changing self-perception"),
];

struct UserTask {
    cancel: CancellationToken,
    warm_tx: mpsc::UnboundedSender<()>,
    handle: JoinHandle<()>,
}

/// Starts and stops per-user analyzer tasks.
pub struct AnalyzerManager {
    config: AnalyzerConfig,
    registry: Arc<SessionRegistry>,
    cache: Arc<ScaffoldCache>,
    store: Arc<dyn MemoryVendor>,
    writer: MemoryWriter,
    tasks: StdMutex<HashMap<String, UserTask>>,
    shutdown: CancellationToken,
}

impl AnalyzerManager {
    #[must_use]
    pub fn new(
        config: AnalyzerConfig,
        registry: Arc<SessionRegistry>,
        cache: Arc<ScaffoldCache>,
        store: Arc<dyn MemoryVendor>,
        writer: MemoryWriter,
    ) -> Self {
        Self {
            config,
            registry,
            cache,
            store,
            writer,
            tasks: StdMutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, HashMap<String, UserTask>> {
        match self.tasks.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Ensure the user's analyzer task is running. Called on session
    /// attach.
    pub fn ensure_started(&self, user_id: &str) {
        let mut tasks = self.lock_tasks();
        if let Some(task) = tasks.get(user_id) {
            if !task.handle.is_finished() {
                return;
            }
            tasks.remove(user_id);
        }

        let cancel = self.shutdown.child_token();
        let (warm_tx, warm_rx) = mpsc::unbounded_channel();
        let ctx = TaskContext {
            user_id: user_id.to_owned(),
            config: self.config.clone(),
            registry: self.registry.clone(),
            cache: self.cache.clone(),
            store: self.store.clone(),
            writer: self.writer.clone(),
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(run_analyzer_task(ctx, warm_rx));
        tasks.insert(
            user_id.to_owned(),
            UserTask {
                cancel,
                warm_tx,
                handle,
            },
        );
        info!(user = user_id, "analyzer started");
    }

    /// Request a one-shot scaffold warm for the user, starting the task if
    /// needed.
    pub fn request_warm(&self, user_id: &str) {
        self.ensure_started(user_id);
        if let Some(task) = self.lock_tasks().get(user_id) {
            let _ = task.warm_tx.send(());
        }
    }

    /// Whether the user currently has a live analyzer task. Test helper.
    pub fn is_running(&self, user_id: &str) -> bool {
        self.lock_tasks()
            .get(user_id)
            .is_some_and(|t| !t.handle.is_finished())
    }

    /// Stop every analyzer task.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks: Vec<UserTask> = {
            let mut guard = self.lock_tasks();
            guard.drain().map(|(_, t)| t).collect()
        };
        for task in tasks {
            task.cancel.cancel();
            let _ = task.handle.await;
        }
    }
}

struct TaskContext {
    user_id: String,
    config: AnalyzerConfig,
    registry: Arc<SessionRegistry>,
    cache: Arc<ScaffoldCache>,
    store: Arc<dyn MemoryVendor>,
    writer: MemoryWriter,
    cancel: CancellationToken,
}

async fn run_analyzer_task(ctx: TaskContext, mut warm_rx: mpsc::UnboundedReceiver<()>) {
    loop {
        let interval = next_interval(&ctx);
        tokio::select! {
            () = ctx.cancel.cancelled() => break,
            warm = warm_rx.recv() => {
                if warm.is_none() {
                    break;
                }
                run_warm(&ctx).await;
            }
            () = tokio::time::sleep(interval) => {
                if let Some(detached) = ctx.registry.detached_for(&ctx.user_id) {
                    if detached >= Duration::from_secs(ctx.config.grace_period_secs) {
                        debug!(user = %ctx.user_id, "grace period expired");
                        break;
                    }
                }
                let guard = Duration::from_secs(ctx.config.recent_turn_guard_secs);
                if ctx.registry.is_user_active(&ctx.user_id)
                    || ctx.registry.turn_finished_within(&ctx.user_id, guard)
                {
                    debug!(user = %ctx.user_id, "user busy, skipping analysis cycle");
                    continue;
                }
                run_cycle(&ctx).await;
            }
        }
    }
    ctx.registry.forget_user(&ctx.user_id);
    info!(user = %ctx.user_id, "analyzer stopped");
}

/// Adaptive cycle interval: frequent conversation shortens it toward the
/// minimum, quiet users settle at the maximum. Jittered ±10% so idle users
/// don't tick in lockstep.
fn next_interval(ctx: &TaskContext) -> Duration {
    let window = Duration::from_secs(ctx.config.frequency_window_secs);
    let turns = ctx.registry.turns_within(&ctx.user_id, window) as u64;
    let base = (ctx.config.max_interval_secs / (1 + turns))
        .clamp(ctx.config.min_interval_secs, ctx.config.max_interval_secs);
    let jitter = rand::thread_rng().gen_range(0.9..1.1);
    Duration::from_secs_f64(base as f64 * jitter)
}

async fn run_cycle(ctx: &TaskContext) {
    let snapshot = ctx.cache.get_for_session(&ctx.user_id).await;
    let undercurrent = snapshot.as_ref().and_then(|s| {
        match s.scaffold.fields.get("emotional_undercurrent") {
            Some(ScaffoldValue::Text(t)) => Some(t.clone()),
            _ => None,
        }
    });

    let mut theme_hits: Vec<(&str, Vec<MemoryHit>)> = Vec::with_capacity(THEMES.len());
    for (theme, query) in THEMES {
        let query = personalize_query(query, undercurrent.as_deref());
        match ctx.store.search(&ctx.user_id, &query).await {
            Ok(hits) => theme_hits.push((theme, hits)),
            Err(e) => {
                warn!(user = %ctx.user_id, theme, "analysis search failed: {e}");
                theme_hits.push((theme, Vec::new()));
            }
        }
    }

    let profile = synthesize_profile(&theme_hits);
    let total_hits: usize = theme_hits.iter().map(|(_, h)| h.len()).sum();
    let origin = ctx.cache.apply_background(&ctx.user_id, profile).await;

    ctx.writer.enqueue(MemoryOperation::new(
        MemoryOpKind::RelationshipEvolution,
        &ctx.user_id,
        json!({
            "cycle_at": chrono::Utc::now().to_rfc3339(),
            "themes": THEMES.iter().map(|(t, _)| *t).collect::<Vec<_>>(),
            "hits": total_hits,
            "applied_as": match origin {
                crate::scaffold::ScaffoldOrigin::Realtime => "realtime",
                crate::scaffold::ScaffoldOrigin::Background => "background",
                crate::scaffold::ScaffoldOrigin::Merged => "merged",
            },
        }),
    ));
    debug!(user = %ctx.user_id, total_hits, "analysis cycle complete");
}

async fn run_warm(ctx: &TaskContext) {
    if ctx.cache.has_entry(&ctx.user_id).await {
        return;
    }
    match ctx.store.search(&ctx.user_id, "relationship overview").await {
        Ok(hits) => {
            let profile = synthesize_profile(&[("overview", hits)]);
            ctx.cache.apply_background(&ctx.user_id, profile).await;
            debug!(user = %ctx.user_id, "scaffold warmed");
        }
        Err(e) => warn!(user = %ctx.user_id, "scaffold warm failed: {e}"),
    }
}

fn personalize_query(base: &str, undercurrent: Option<&str>) -> String {
    match undercurrent {
        Some(mood) => format!("{base} while feeling {mood}"),
        None => base.to_owned(),
    }
}

/// Fold search hits into a profile. The fields are opaque downstream; what
/// matters is that richer histories produce higher intimacy and that each
/// theme with evidence contributes a focus field.
fn synthesize_profile(theme_hits: &[(&str, Vec<MemoryHit>)]) -> Scaffold {
    let mut scaffold = Scaffold::empty();
    let total: usize = theme_hits.iter().map(|(_, h)| h.len()).sum();
    scaffold.intimacy = (0.3 + 0.05 * total as f64).min(0.95);

    let mut observed = std::collections::BTreeSet::new();
    for (theme, hits) in theme_hits {
        let Some(top) = hits.first() else { continue };
        observed.insert((*theme).to_owned());
        let mut focus = String::with_capacity(top.text.len().min(120));
        for ch in top.text.chars() {
            if focus.len() + ch.len_utf8() > 120 {
                break;
            }
            focus.push(ch);
        }
        scaffold
            .fields
            .insert(format!("{theme}_focus"), ScaffoldValue::Text(focus));
    }
    if !observed.is_empty() {
        scaffold
            .fields
            .insert("themes_observed".into(), ScaffoldValue::List(observed));
    }
    scaffold
}
