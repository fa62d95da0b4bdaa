use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info};

use crate::broadcast::Subscription;
use crate::config::Config;
use crate::error::SourceError;
use crate::models::domain::{HostId, Protocol};
use crate::models::dto::{DetailedPacket, GraphSnapshot};
use crate::pipeline::Pipeline;
use crate::source::SourceSpec;

pub type SessionId = u64;

/// Tracks which traffic source each viewer session watches.
///
/// Sessions asking for the same source share one pipeline. Live and replay
/// pipelines stop once no session watches them; synthetic ones stay up and
/// pause themselves.
pub struct SessionManager {
    config: Arc<Config>,
    inner: Mutex<Inner>,
    next_id: AtomicU64,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<SessionId, Option<SourceSpec>>,
    pipelines: HashMap<SourceSpec, Pipeline>,
}

impl Inner {
    fn watched(&self, spec: &SourceSpec) -> bool {
        self.sessions.values().any(|active| active.as_ref() == Some(spec))
    }

    fn release(&mut self, spec: &SourceSpec) {
        if spec.is_synthetic() || self.watched(spec) {
            return;
        }
        if let Some(mut pipeline) = self.pipelines.remove(spec) {
            info!(source = %spec, "last viewer left; stopping source");
            pipeline.stop();
        }
    }
}

impl SessionManager {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner::default()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn open_session(&self) -> SessionId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.lock().sessions.insert(id, None);
        debug!(session = id, "session opened");
        id
    }

    /// Points the session at the requested source, starting it if needed.
    /// On failure the session keeps its previous source.
    pub fn start_capture(&self, session: SessionId, request: &str) -> Result<Subscription, SourceError> {
        let spec = SourceSpec::parse(request, &self.config)?;
        let mut inner = self.lock();
        let previous = inner.sessions.get(&session).cloned().flatten();

        let config = self.config.clone();
        let pipeline = inner
            .pipelines
            .entry(spec.clone())
            .or_insert_with(|| Pipeline::new(spec.clone(), config));
        // subscribe first so the source starts with a viewer
        let subscription = pipeline.subscribe();
        if let Err(err) = pipeline.start() {
            drop(subscription);
            inner.release(&spec);
            return Err(err);
        }

        inner.sessions.insert(session, Some(spec.clone()));
        if let Some(previous) = previous.filter(|previous| *previous != spec) {
            inner.release(&previous);
        }
        info!(session, source = %spec, "session watching source");
        Ok(subscription)
    }

    /// Stops every synthetic source. Viewers see an empty graph.
    pub fn stop_synthetic(&self) -> usize {
        let mut inner = self.lock();
        let mut stopped = 0;
        for pipeline in inner.pipelines.values_mut() {
            if pipeline.spec().is_synthetic() && pipeline.is_running() {
                pipeline.stop();
                stopped += 1;
            }
        }
        info!(stopped, "synthetic traffic stopped");
        stopped
    }

    pub fn close_session(&self, session: SessionId) {
        let mut inner = self.lock();
        if let Some(Some(spec)) = inner.sessions.remove(&session) {
            inner.release(&spec);
        }
        debug!(session, "session closed");
    }

    pub fn active_source(&self, session: SessionId) -> Option<SourceSpec> {
        self.lock().sessions.get(&session).cloned().flatten()
    }

    pub fn snapshot(&self, session: SessionId) -> Option<Arc<GraphSnapshot>> {
        let inner = self.lock();
        let spec = inner.sessions.get(&session)?.as_ref()?;
        inner.pipelines.get(spec).map(Pipeline::snapshot)
    }

    /// Detailed packets for the flow in the session's current graph.
    pub fn packet_details(
        &self,
        session: SessionId,
        source: HostId,
        dest: HostId,
        protocol: Protocol,
    ) -> Vec<DetailedPacket> {
        let inner = self.lock();
        inner
            .sessions
            .get(&session)
            .and_then(Option::as_ref)
            .and_then(|spec| inner.pipelines.get(spec))
            .map(|pipeline| pipeline.packet_details(source, dest, protocol))
            .unwrap_or_default()
    }

    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn log_stats(&self) {
        let inner = self.lock();
        for (spec, pipeline) in &inner.pipelines {
            let stats = pipeline.stats();
            let snapshot = pipeline.snapshot();
            info!(
                source = %spec,
                running = pipeline.is_running(),
                viewers = pipeline.viewers(),
                packets = stats.total_packets,
                bytes = stats.total_bytes,
                dropped = stats.dropped,
                protocols = ?stats.protocol_counts,
                hosts = snapshot.hosts.len(),
                flows = snapshot.flows.len(),
                "ingest stats"
            );
        }
    }

    /// Stops every source; used on process shutdown.
    pub fn shutdown(&self) {
        let mut inner = self.lock();
        inner.sessions.clear();
        for (spec, mut pipeline) in inner.pipelines.drain() {
            debug!(source = %spec, "stopping source for shutdown");
            pipeline.stop();
        }
        info!("all sources stopped");
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `f` with the session table locked, as a slow capture start would.
    #[cfg(test)]
    pub(crate) fn while_locked(&self, f: impl FnOnce()) {
        let _inner = self.lock();
        f();
    }
}
