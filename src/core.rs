//! Process-wide wiring.
//!
//! `Core` owns every shared service (registry, scaffold cache, memory
//! writer, analyzer manager) and the vendor singletons. It is built once
//! at process start and drained at shutdown; sessions attach and detach
//! through it. Nothing here is lazily initialized on the hot path.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::mpsc;
use tracing::info;

use crate::analyzer::AnalyzerManager;
use crate::config::CompanionConfig;
use crate::frames::OutboundFrame;
use crate::memory::writer::MemoryWriter;
use crate::registry::SessionRegistry;
use crate::scaffold::ScaffoldCache;
use crate::session::controller::{SessionController, SessionDeps};
use crate::vendor::{LlmClient, MemoryVendor, SttClient, TtsClient};

/// The vendor singletons. Each must tolerate many concurrent requests.
#[derive(Clone)]
pub struct VendorSet {
    pub stt: Arc<dyn SttClient>,
    pub llm: Arc<dyn LlmClient>,
    pub tts: Arc<dyn TtsClient>,
    pub memory: Arc<dyn MemoryVendor>,
}

/// The process-wide session orchestration core.
pub struct Core {
    config: Arc<CompanionConfig>,
    vendors: VendorSet,
    registry: Arc<SessionRegistry>,
    scaffolds: Arc<ScaffoldCache>,
    writer: MemoryWriter,
    analyzers: Arc<AnalyzerManager>,
    sessions: StdMutex<HashMap<String, Arc<SessionController>>>,
}

impl Core {
    /// Wire all shared services. Called once at process start.
    #[must_use]
    pub fn new(config: CompanionConfig, vendors: VendorSet) -> Self {
        let config = Arc::new(config);
        let registry = Arc::new(SessionRegistry::new());
        let scaffolds = Arc::new(ScaffoldCache::new(config.scaffold.clone()));
        let writer = MemoryWriter::spawn(vendors.memory.clone(), config.writer.clone());
        let analyzers = Arc::new(AnalyzerManager::new(
            config.analyzer.clone(),
            registry.clone(),
            scaffolds.clone(),
            vendors.memory.clone(),
            writer.clone(),
        ));
        info!("core initialized");
        Self {
            config,
            vendors,
            registry,
            scaffolds,
            writer,
            analyzers,
            sessions: StdMutex::new(HashMap::new()),
        }
    }

    fn lock_sessions(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<SessionController>>> {
        match self.sessions.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Attach a session for `user_id`. Outbound frames are delivered on
    /// `sink`; the returned controller is also reachable by id through
    /// [`Core::session`].
    pub fn attach(&self, user_id: &str, sink: mpsc::Sender<OutboundFrame>) -> Arc<SessionController> {
        let deps = SessionDeps {
            config: self.config.clone(),
            stt: self.vendors.stt.clone(),
            llm: self.vendors.llm.clone(),
            tts: self.vendors.tts.clone(),
            scaffolds: self.scaffolds.clone(),
            writer: self.writer.clone(),
            registry: self.registry.clone(),
            analyzers: self.analyzers.clone(),
        };
        let controller = Arc::new(SessionController::attach(deps, user_id, sink));
        self.lock_sessions()
            .insert(controller.session_id().to_owned(), controller.clone());
        controller
    }

    /// Look up a live session by id.
    pub fn session(&self, session_id: &str) -> Option<Arc<SessionController>> {
        self.lock_sessions().get(session_id).cloned()
    }

    /// Detach and tear down one session. Returns whether it existed.
    pub async fn detach(&self, session_id: &str) -> bool {
        let controller = self.lock_sessions().remove(session_id);
        match controller {
            Some(controller) => {
                controller.detach().await;
                true
            }
            None => false,
        }
    }

    /// Shared registry, for gating checks and diagnostics.
    #[must_use]
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Shared scaffold cache.
    #[must_use]
    pub fn scaffolds(&self) -> &Arc<ScaffoldCache> {
        &self.scaffolds
    }

    /// Shared memory writer handle.
    #[must_use]
    pub fn writer(&self) -> &MemoryWriter {
        &self.writer
    }

    /// Drain and stop every shared service: sessions first, then the
    /// analyzers, then the writer (which flushes pending batches).
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<SessionController>> =
            self.lock_sessions().drain().map(|(_, c)| c).collect();
        for session in sessions {
            session.detach().await;
        }
        self.analyzers.shutdown().await;
        self.writer.shutdown().await;
        info!("core shut down");
    }
}
