use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use tracing::{debug, error, info};

use crate::aggregator::{Aggregator, GraphState};
use crate::broadcast::{Broadcaster, Subscription};
use crate::config::Config;
use crate::db::PacketStore;
use crate::error::{AggregateError, SourceError};
use crate::models::domain::{FlowKey, HostId, PacketRecord, Protocol};
use crate::models::dto::{CaptureState, DetailedPacket, ErrorKind, GraphSnapshot, StatusEvent};
use crate::source::{SourceSpec, StopSignal, StopToken, TrafficSource};

/// Running totals for one pipeline, reported by the periodic stats log.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NetworkStats {
    pub total_packets: u64,
    pub total_bytes: u64,
    pub dropped: u64,
    pub protocol_counts: HashMap<Protocol, u64>,
}

impl NetworkStats {
    fn update(&mut self, record: &PacketRecord) {
        self.total_packets += 1;
        self.total_bytes += record.length;
        *self.protocol_counts.entry(record.protocol).or_insert(0) += 1;
    }
}

// Shared between the pipeline handle and its ingest worker.
#[derive(Clone)]
struct Sinks {
    broadcaster: Broadcaster,
    details: Arc<Mutex<PacketStore>>,
    stats: Arc<Mutex<NetworkStats>>,
}

struct Running {
    stop: StopSignal,
    worker: JoinHandle<Box<dyn GraphState>>,
}

/// One traffic source feeding its own aggregator and broadcaster.
///
/// The ingest worker owns the aggregator while running, so applying a record
/// never takes a lock. Stopping joins the worker before the graph is reset.
pub struct Pipeline {
    spec: SourceSpec,
    config: Arc<Config>,
    sinks: Sinks,
    graph: Option<Box<dyn GraphState>>,
    running: Option<Running>,
}

impl Pipeline {
    pub fn new(spec: SourceSpec, config: Arc<Config>) -> Self {
        let details = PacketStore::new(config.detail_limit);
        Self {
            spec,
            config,
            sinks: Sinks {
                broadcaster: Broadcaster::new(),
                details: Arc::new(Mutex::new(details)),
                stats: Arc::default(),
            },
            graph: Some(Box::new(Aggregator::new())),
            running: None,
        }
    }

    pub fn spec(&self) -> &SourceSpec {
        &self.spec
    }

    /// Opens the source and starts ingesting. A no-op while already running.
    pub fn start(&mut self) -> Result<(), SourceError> {
        if self.is_running() {
            return Ok(());
        }
        self.reap();
        let source = self.spec.open(&self.config, self.sinks.broadcaster.presence())?;
        self.start_with(source)
    }

    /// Starts ingesting from an already opened source.
    pub fn start_with(&mut self, source: Box<dyn TrafficSource>) -> Result<(), SourceError> {
        if self.is_running() {
            return Ok(());
        }
        self.reap();
        let graph = self.take_graph();
        let (stop, token) = StopToken::pair();
        let sinks = self.sinks.clone();
        let worker = thread::Builder::new()
            .name(format!("ingest-{}", self.spec))
            .spawn(move || ingest(source, graph, token, sinks))?;
        self.running = Some(Running { stop, worker });
        Ok(())
    }

    /// True while the ingest worker is alive. A source that ended or failed
    /// leaves the pipeline stopped.
    pub fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .map_or(false, |running| !running.worker.is_finished())
    }

    /// Stops the source, waits for in-flight records, then clears the graph
    /// and publishes the empty snapshot.
    pub fn stop(&mut self) {
        let was_running = self.is_running();
        self.reap();
        let mut graph = self.take_graph();
        graph.reset();
        lock(&self.sinks.details).clear();
        self.sinks.broadcaster.publish(graph.publish());
        self.graph = Some(graph);
        if was_running {
            info!(source = %self.spec, "pipeline stopped");
            self.sinks.broadcaster.publish_status(StatusEvent::capture(
                CaptureState::Stopped,
                format!("Capture stopped: {}", self.spec),
            ));
        }
    }

    pub fn subscribe(&self) -> Subscription {
        self.sinks.broadcaster.subscribe()
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.sinks.broadcaster
    }

    pub fn snapshot(&self) -> Arc<GraphSnapshot> {
        self.sinks.broadcaster.latest()
    }

    pub fn viewers(&self) -> usize {
        self.sinks.broadcaster.viewers()
    }

    /// Retained packets of the conversation between two hosts, both directions.
    pub fn packet_details(&self, source: HostId, dest: HostId, protocol: Protocol) -> Vec<DetailedPacket> {
        lock(&self.sinks.details).packets_for(FlowKey::new(source, dest, protocol))
    }

    pub fn stats(&self) -> NetworkStats {
        lock(&self.sinks.stats).clone()
    }

    // Signals the worker (if any) and collects the graph it owned.
    fn reap(&mut self) {
        let Some(Running { stop, worker }) = self.running.take() else {
            return;
        };
        stop.stop();
        match worker.join() {
            Ok(graph) => self.graph = Some(graph),
            Err(_) => {
                error!(source = %self.spec, "ingest worker panicked; graph state lost");
                let version = self.sinks.broadcaster.latest().version;
                self.graph = Some(Box::new(Aggregator::resume_from(version)));
            }
        }
    }

    fn take_graph(&mut self) -> Box<dyn GraphState> {
        self.graph.take().unwrap_or_else(|| {
            let version = self.sinks.broadcaster.latest().version;
            Box::new(Aggregator::resume_from(version))
        })
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.reap();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn count_drop(sinks: &Sinks) -> u64 {
    let mut stats = lock(&sinks.stats);
    stats.dropped += 1;
    stats.dropped
}

// The single writer: pulls records, folds them in, publishes snapshots.
fn ingest(
    mut source: Box<dyn TrafficSource>,
    mut graph: Box<dyn GraphState>,
    stop: StopToken,
    sinks: Sinks,
) -> Box<dyn GraphState> {
    let description = source.describe();
    info!(source = %description, "ingest started");
    sinks.broadcaster.publish_status(StatusEvent::capture(
        CaptureState::Started,
        format!("Capture started: {description}"),
    ));

    loop {
        match source.next_record(&stop) {
            Ok(Some(record)) => match graph.ingest(&record) {
                Ok(key) => {
                    lock(&sinks.details).store_event(key, &record);
                    lock(&sinks.stats).update(&record);
                    sinks.broadcaster.publish(graph.publish());
                }
                Err(AggregateError::Malformed(err)) => {
                    let dropped = count_drop(&sinks);
                    debug!(%err, dropped, "dropping record");
                }
                Err(err) => {
                    error!(%err, source = %description, "resetting graph");
                    graph.reset();
                    lock(&sinks.details).clear();
                    sinks.broadcaster.publish(graph.publish());
                    sinks.broadcaster.publish_status(StatusEvent::Error {
                        kind: ErrorKind::Internal,
                        message: format!("Graph state was reset: {err}"),
                    });
                }
            },
            Ok(None) => {
                if !stop.is_stopped() {
                    info!(source = %description, "source ended");
                    sinks.broadcaster.publish_status(StatusEvent::capture(
                        CaptureState::Ended,
                        format!("Capture ended: {description}"),
                    ));
                }
                break;
            }
            Err(err) if !err.is_fatal() => {
                let dropped = count_drop(&sinks);
                debug!(%err, dropped, source = %description, "skipping malformed record");
            }
            Err(err) => {
                error!(%err, source = %description, "source failed");
                sinks.broadcaster.publish_status(StatusEvent::from(&err));
                break;
            }
        }
    }
    source.shutdown();
    graph
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::Profile;
    use std::collections::VecDeque;
    use std::time::Duration;
    use tokio::sync::broadcast::error::TryRecvError;

    /// Hands out a fixed list of results, then ends.
    struct Scripted(VecDeque<Result<PacketRecord, SourceError>>);

    impl TrafficSource for Scripted {
        fn describe(&self) -> String {
            "scripted".into()
        }

        fn next_record(&mut self, _stop: &StopToken) -> Result<Option<PacketRecord>, SourceError> {
            self.0.pop_front().transpose()
        }
    }

    fn pipeline() -> Pipeline {
        Pipeline::new(SourceSpec::Synthetic(Profile::Uniform), Arc::new(Config::default()))
    }

    fn wait_until_idle(pipeline: &Pipeline) {
        for _ in 0..500 {
            if !pipeline.is_running() {
                return;
            }
            thread::sleep(Duration::from_millis(2));
        }
        panic!("worker did not finish");
    }

    fn tcp(src: &str, dst: &str, len: u64) -> PacketRecord {
        PacketRecord::new(1.0, src, dst, Protocol::Tcp, len)
    }

    #[test]
    fn ingests_records_and_reports_end() {
        let mut pipeline = pipeline();
        let mut status = pipeline.broadcaster().status_events();
        let source = Scripted(VecDeque::from(vec![
            Ok(tcp("A", "B", 100)),
            Err(SourceError::Malformed(crate::error::MalformedRecord::missing("ip"))),
            Ok(tcp("B", "A", 50)),
            Ok(tcp("A", "", 1)),
        ]));
        pipeline.start_with(Box::new(source)).unwrap();
        wait_until_idle(&pipeline);

        let snapshot = pipeline.snapshot();
        assert_eq!(snapshot.hosts.len(), 2);
        assert_eq!(snapshot.flows.len(), 2);

        let stats = pipeline.stats();
        assert_eq!(stats.total_packets, 2);
        assert_eq!(stats.total_bytes, 150);
        assert_eq!(stats.dropped, 2);
        assert_eq!(stats.protocol_counts.get(&Protocol::Tcp), Some(&2));

        let details = pipeline.packet_details(HostId(1), HostId(2), Protocol::Tcp);
        assert_eq!(details.len(), 2);

        assert!(matches!(
            status.try_recv(),
            Ok(StatusEvent::Capture { state: CaptureState::Started, .. })
        ));
        assert!(matches!(
            status.try_recv(),
            Ok(StatusEvent::Capture { state: CaptureState::Ended, .. })
        ));
    }

    #[test]
    fn fatal_source_error_is_reported() {
        let mut pipeline = pipeline();
        let mut status = pipeline.broadcaster().status_events();
        let source = Scripted(VecDeque::from(vec![
            Ok(tcp("A", "B", 1)),
            Err(SourceError::PermissionDenied("eth0".into())),
            Ok(tcp("A", "C", 1)),
        ]));
        pipeline.start_with(Box::new(source)).unwrap();
        wait_until_idle(&pipeline);

        assert_eq!(pipeline.snapshot().hosts.len(), 2);
        let _started = status.try_recv();
        assert!(matches!(
            status.try_recv(),
            Ok(StatusEvent::Error { kind: ErrorKind::PermissionDenied, .. })
        ));
        assert!(matches!(status.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn stop_resets_graph_and_details() {
        let mut pipeline = pipeline();
        let source = Scripted(VecDeque::from(vec![Ok(tcp("A", "B", 1))]));
        pipeline.start_with(Box::new(source)).unwrap();
        wait_until_idle(&pipeline);
        let before = pipeline.snapshot();
        assert!(!before.is_empty());

        pipeline.stop();
        let after = pipeline.snapshot();
        assert!(after.is_empty());
        assert!(after.version > before.version);
        assert!(pipeline
            .packet_details(HostId(1), HostId(2), Protocol::Tcp)
            .is_empty());

        // restarting keeps versions moving forward
        let source = Scripted(VecDeque::from(vec![Ok(tcp("C", "D", 1))]));
        pipeline.start_with(Box::new(source)).unwrap();
        wait_until_idle(&pipeline);
        let restarted = pipeline.snapshot();
        assert!(restarted.version > after.version);
        assert_eq!(restarted.host(HostId(1)).map(|h| &*h.address), Some("C"));
    }
}
