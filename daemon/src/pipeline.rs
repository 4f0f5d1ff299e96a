//! Polling loop
//!
//! Drives a streaming `ProbeSession`: every tick drains the kernel buffer,
//! decodes each record and hands it to the broadcaster. Ticks never
//! overlap, a slow poll delays the next one instead.

use crate::broadcast::Broadcaster;
use crate::codec;
use crate::error::PollError;
use crate::loader::{PollSummary, ProbeLoader};
use crate::session::{ChannelHandle, ProbeSession};
use crate::types::RawRecord;
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Counters updated by the record handler and the polling loop
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub records_decoded: AtomicU64,
    pub decode_failures: AtomicU64,
    pub records_lost: AtomicU64,
    pub bytes_received: AtomicU64,
    pub polls: AtomicU64,
}

/// Receive throughput in kilobits per second
pub fn throughput_kbps(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    bytes as f64 * 8.0 / 1000.0 / secs
}

/// Decode-and-broadcast stage shared by the handler and the loop
#[derive(Debug, Clone)]
pub struct Pipeline {
    broadcaster: Arc<Broadcaster>,
    stats: Arc<PipelineStats>,
}

impl Pipeline {
    pub fn new(broadcaster: Arc<Broadcaster>) -> Self {
        Self {
            broadcaster,
            stats: Arc::new(PipelineStats::default()),
        }
    }

    pub fn stats(&self) -> &Arc<PipelineStats> {
        &self.stats
    }

    /// Handler to register with `ProbeSession::open_event_channel`
    ///
    /// Malformed records are logged, counted and dropped.
    pub fn record_handler(&self) -> impl FnMut(RawRecord<'_>) + Send + 'static {
        let broadcaster = Arc::clone(&self.broadcaster);
        let stats = Arc::clone(&self.stats);

        move |record: RawRecord<'_>| match codec::decode(record) {
            Ok(event) => {
                stats.records_decoded.fetch_add(1, Ordering::Relaxed);
                stats
                    .bytes_received
                    .fetch_add(event.byte_count(), Ordering::Relaxed);

                let report = broadcaster.broadcast(&event);
                debug!(
                    "pid {} received {} bytes -> {}/{} subscribers",
                    event.process_id(),
                    event.byte_count(),
                    report.delivered,
                    report.attempted
                );
            }
            Err(e) => {
                stats.decode_failures.fetch_add(1, Ordering::Relaxed);
                warn!("Dropping record from CPU {}: {}", record.cpu, e);
            }
        }
    }

    /// Drain `session` once and account the outcome
    pub fn poll_once<L: ProbeLoader>(
        &self,
        session: &mut ProbeSession<L>,
        handle: ChannelHandle,
    ) -> Result<PollSummary, PollError> {
        let summary = session.poll(handle)?;
        self.stats.polls.fetch_add(1, Ordering::Relaxed);
        self.stats
            .records_lost
            .fetch_add(summary.lost as u64, Ordering::Relaxed);
        Ok(summary)
    }

    /// Poll `session` every `poll_interval` until `shutdown` fires
    ///
    /// The session is detached before returning. A poll failure ends the
    /// loop and is returned; there is no retry.
    pub async fn run<L: ProbeLoader>(
        &self,
        mut session: ProbeSession<L>,
        handle: ChannelHandle,
        poll_interval: Duration,
        shutdown: CancellationToken,
    ) -> Result<(), PollError> {
        let mut ticker = interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Polling {} every {:?}",
            session.target().kernel_symbol,
            poll_interval
        );

        let result = loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested, stopping poll loop");
                    break Ok(());
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once(&mut session, handle) {
                        error!("Poll loop terminated: {}", e);
                        break Err(e);
                    }
                }
            }
        };

        session.detach();
        result
    }

    /// Log a progress line every `every` until `shutdown` fires
    pub fn spawn_progress_reporter(
        &self,
        every: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let stats = Arc::clone(&self.stats);
        let broadcaster = Arc::clone(&self.broadcaster);

        tokio::spawn(async move {
            let mut ticker = interval(every);
            // First tick completes immediately
            ticker.tick().await;

            let mut window_start = Instant::now();
            let mut window_bytes = stats.bytes_received.load(Ordering::Relaxed);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let bytes = stats.bytes_received.load(Ordering::Relaxed);
                let kbps = throughput_kbps(bytes.saturating_sub(window_bytes), window_start.elapsed());
                window_start = Instant::now();
                window_bytes = bytes;

                info!(
                    "📈 Progress: {} events, {} decode failures, {} lost, {} delivered, {} subscribers, {:.1} kbps",
                    stats.records_decoded.load(Ordering::Relaxed),
                    stats.decode_failures.load(Ordering::Relaxed),
                    stats.records_lost.load(Ordering::Relaxed),
                    broadcaster.stats().delivered.load(Ordering::Relaxed),
                    broadcaster.registry().len(),
                    kbps
                );
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::OverflowPolicy;
    use crate::registry::{Subscriber, SubscriberRegistry};
    use crate::session::SessionState;
    use crate::testing::{fake_target, push_raw, push_record, FakeLoader};
    use crate::types::{ByteCountEncoding, WireEvent, WireMessage};
    use tokio::sync::mpsc;

    fn pipeline() -> (Pipeline, mpsc::Receiver<WireMessage>) {
        let registry = Arc::new(SubscriberRegistry::new());
        let (subscriber, rx) = Subscriber::new(None, 64);
        registry.register(subscriber);

        let broadcaster = Broadcaster::new(
            registry,
            ByteCountEncoding::Number,
            OverflowPolicy::DropSubscriber,
        );
        (Pipeline::new(Arc::new(broadcaster)), rx)
    }

    fn decode_message(message: &str) -> (u32, u64) {
        let event = serde_json::from_str::<WireEvent>(message)
            .unwrap()
            .into_event()
            .unwrap();
        (event.process_id(), event.byte_count())
    }

    #[tokio::test]
    async fn test_one_poll_three_broadcasts_in_order() {
        let (pipeline, mut rx) = pipeline();
        let loader = FakeLoader::default();
        let mut session = ProbeSession::attach(loader.clone(), fake_target()).unwrap();
        let handle = session
            .open_event_channel("EVENTS", pipeline.record_handler())
            .unwrap();

        push_record(&loader, 0, 10, 100);
        push_record(&loader, 0, 11, 200);
        push_record(&loader, 0, 12, 300);
        session.poll(handle).unwrap();

        for expected in [(10, 100), (11, 200), (12, 300)] {
            let message = rx.recv().await.unwrap();
            assert_eq!(decode_message(&message), expected);
        }
        assert_eq!(pipeline.stats().records_decoded.load(Ordering::Relaxed), 3);
        assert_eq!(pipeline.stats().bytes_received.load(Ordering::Relaxed), 600);
    }

    #[tokio::test]
    async fn test_malformed_record_dropped() {
        let (pipeline, mut rx) = pipeline();
        let loader = FakeLoader::default();
        let mut session = ProbeSession::attach(loader.clone(), fake_target()).unwrap();
        let handle = session
            .open_event_channel("EVENTS", pipeline.record_handler())
            .unwrap();

        push_raw(&loader, 0, &[1, 2, 3]);
        push_record(&loader, 0, 5, 50);
        session.poll(handle).unwrap();

        // The short record is skipped, the next one still flows
        let message = rx.recv().await.unwrap();
        assert_eq!(decode_message(&message), (5, 50));
        assert!(rx.try_recv().is_err());
        assert_eq!(pipeline.stats().decode_failures.load(Ordering::Relaxed), 1);
        assert_eq!(session.state(), SessionState::Streaming);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown_and_detaches() {
        let (pipeline, mut rx) = pipeline();
        let loader = FakeLoader::default();
        let mut session = ProbeSession::attach(loader.clone(), fake_target()).unwrap();
        let handle = session
            .open_event_channel("EVENTS", pipeline.record_handler())
            .unwrap();
        push_record(&loader, 1, 42, 4096);

        let shutdown = CancellationToken::new();
        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        pipeline
            .run(session, handle, Duration::from_millis(5), shutdown)
            .await
            .unwrap();

        let message = rx.recv().await.unwrap();
        assert_eq!(decode_message(&message), (42, 4096));
        assert!(pipeline.stats().polls.load(Ordering::Relaxed) >= 1);

        let journal = loader.journal.lock().unwrap();
        assert_eq!(journal.buffers_alive, 0);
        assert_eq!(journal.probes_alive, 0);
    }

    #[tokio::test]
    async fn test_run_returns_poll_failure() {
        let (pipeline, _rx) = pipeline();
        let loader = FakeLoader::default();
        let mut session = ProbeSession::attach(loader.clone(), fake_target()).unwrap();
        let handle = session
            .open_event_channel("EVENTS", pipeline.record_handler())
            .unwrap();
        loader.journal.lock().unwrap().fail_next_poll = true;

        let result = pipeline
            .run(session, handle, Duration::from_millis(5), CancellationToken::new())
            .await;

        assert!(matches!(result, Err(PollError::ReadFailed { .. })));
        assert_eq!(loader.journal.lock().unwrap().probes_alive, 0);
    }

    #[tokio::test]
    async fn test_lost_records_accumulate() {
        let (pipeline, mut rx) = pipeline();
        let loader = FakeLoader::default();
        let mut session = ProbeSession::attach(loader.clone(), fake_target()).unwrap();
        let handle = session
            .open_event_channel("EVENTS", pipeline.record_handler())
            .unwrap();

        loader.journal.lock().unwrap().lost = 3;
        push_record(&loader, 0, 1, 10);
        let summary = pipeline.poll_once(&mut session, handle).unwrap();
        assert_eq!(summary.lost, 3);

        loader.journal.lock().unwrap().lost = 2;
        pipeline.poll_once(&mut session, handle).unwrap();

        // Overruns are counted, never fatal
        assert_eq!(pipeline.stats().records_lost.load(Ordering::Relaxed), 5);
        assert_eq!(pipeline.stats().polls.load(Ordering::Relaxed), 2);
        assert_eq!(session.state(), SessionState::Streaming);
        assert_eq!(decode_message(&rx.recv().await.unwrap()), (1, 10));
    }

    #[tokio::test]
    async fn test_progress_reporter_stops_on_shutdown() {
        let (pipeline, _rx) = pipeline();
        let shutdown = CancellationToken::new();

        let reporter = pipeline.spawn_progress_reporter(Duration::from_millis(10), shutdown.clone());
        tokio::time::sleep(Duration::from_millis(35)).await;
        assert!(!reporter.is_finished());

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), reporter)
            .await
            .expect("reporter kept running after shutdown")
            .unwrap();
    }

    #[test]
    fn test_throughput_kbps() {
        assert_eq!(throughput_kbps(1000, Duration::from_secs(1)), 8.0);
        assert_eq!(throughput_kbps(125_000, Duration::from_secs(2)), 500.0);
        assert_eq!(throughput_kbps(1000, Duration::ZERO), 0.0);
    }
}
