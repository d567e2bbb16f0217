//! Scan loop
//!
//! Drives the lock state machine from frames, runs local identification and
//! cloud calls as background tasks and turns the resulting actions into
//! [`ScanEvent`]s. Background completions come back over an mpsc channel and
//! are applied at the start of the next tick.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::capture::{Frame, FrameSource};
use crate::catalog::{Catalog, SpeciesList};
use crate::config::{ConfigError, ScannerConfig};
use crate::identify::{CatalogMatcher, CloudCard, CloudError, CloudIdentifier, CloudRequest};
use crate::pipeline::lock::{LockAction, LockState, LockStateMachine};
use crate::shared::{EventSink, ScanEvent, ScannerStatus, SharedStatus};
use crate::vision::{BoundaryDetector, CanonicalCard, Quadrilateral, Rectifier, RegionTextExtractor, TextRecognizer};

/// Result of a background job, tagged with the lock that started it
#[derive(Debug)]
enum Completion {
    /// Catalog index of the local match, if any
    Local { lock_id: Uuid, entry: Option<usize> },
    Cloud {
        lock_id: Uuid,
        outcome: Result<CloudCard, CloudError>,
    },
}

/// Extraction plus catalog lookup, shared with background tasks
struct LocalIdentifier {
    extractor: RegionTextExtractor,
    matcher: CatalogMatcher,
    catalog: Catalog,
}

impl LocalIdentifier {
    async fn identify(&self, card: &CanonicalCard) -> Option<usize> {
        let extracted = self.extractor.extract(card).await;
        self.matcher.find(&extracted, &self.catalog).map(|m| m.index)
    }
}

/// The card scanning pipeline
pub struct ScanPipeline {
    detector: BoundaryDetector,
    rectifier: Rectifier,
    local: Arc<LocalIdentifier>,
    cloud: Option<Arc<dyn CloudIdentifier>>,
    machine: LockStateMachine,
    freeze_on_lock: bool,
    tick_interval: Duration,
    jpeg_quality: u8,
    instruction: String,
    completions_tx: UnboundedSender<Completion>,
    completions_rx: UnboundedReceiver<Completion>,
    jobs: JoinSet<()>,
    /// Frame that triggered the current lock
    frozen: Option<Frame>,
    /// Canonical card of the current lock
    canonical: Option<(Uuid, Arc<CanonicalCard>)>,
    canonical_dir: Option<PathBuf>,
    status: SharedStatus,
}

impl ScanPipeline {
    /// Build a pipeline; the configuration is validated up front
    pub fn new(
        config: ScannerConfig,
        catalog: Catalog,
        species: SpeciesList,
        recognizer: Arc<dyn TextRecognizer>,
        cloud: Option<Arc<dyn CloudIdentifier>>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let (completions_tx, completions_rx) = unbounded_channel();
        let local = LocalIdentifier {
            extractor: RegionTextExtractor::new(recognizer, species, config.regions.clone()),
            matcher: CatalogMatcher::new(&config.matcher),
            catalog,
        };

        info!(
            "Scan pipeline ready: {} catalog entries, cloud fallback {}",
            local.catalog.len(),
            if cloud.is_some() { "enabled" } else { "disabled" }
        );

        Ok(Self {
            detector: BoundaryDetector::new(config.detection.clone()),
            rectifier: Rectifier::new(config.canonical.clone()),
            local: Arc::new(local),
            machine: LockStateMachine::new(&config.lock, config.cloud.cooldown(), cloud.is_some()),
            cloud,
            freeze_on_lock: config.lock.freeze_on_lock,
            tick_interval: config.lock.tick_interval(),
            jpeg_quality: config.canonical.jpeg_quality,
            instruction: config.cloud.instruction.clone(),
            completions_tx,
            completions_rx,
            jobs: JoinSet::new(),
            frozen: None,
            canonical: None,
            canonical_dir: None,
            status: ScannerStatus::shared(),
        })
    }

    /// Also write every canonical card to `dir` as `<lock id>.png`
    pub fn with_canonical_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.canonical_dir = Some(dir.into());
        self
    }

    pub fn status(&self) -> SharedStatus {
        Arc::clone(&self.status)
    }

    pub fn state(&self) -> &LockState {
        self.machine.state()
    }

    /// Number of background jobs not yet reaped
    pub fn pending_jobs(&self) -> usize {
        self.jobs.len()
    }

    /// Process one frame. Never fails: per-tick problems are logged and
    /// folded into the lock cycle.
    pub fn tick(&mut self, frame: &Frame, now: Instant) -> Vec<ScanEvent> {
        let start = Instant::now();
        self.reap_jobs();

        let mut actions: VecDeque<LockAction> = self.drain_completions(now).into();

        let source = match (&self.frozen, self.machine.current_lock()) {
            (Some(frozen), Some(_)) => frozen,
            _ => frame,
        };
        let detection = self.detector.detect(source);
        actions.extend(self.machine.tick(detection, now));

        let events = self.execute(actions, Some(frame), now);
        {
            let mut status = self.status.write();
            status.ticks += 1;
            status.current_quad = detection;
        }
        self.publish(&events);

        debug!(
            "Tick in {:?}: phase {}, {} event(s), {} job(s) pending",
            start.elapsed(),
            self.machine.state().name(),
            events.len(),
            self.jobs.len()
        );
        events
    }

    /// Wait for every outstanding job and apply its completion, including
    /// any follow-up work it triggers. At most one new cloud call is admitted
    /// while settling, so this always returns.
    pub async fn settle(&mut self, now: Instant) -> Vec<ScanEvent> {
        let mut events = Vec::new();
        let admitted_before = self.machine.dispatcher().admitted_total();
        loop {
            while let Some(joined) = self.jobs.join_next().await {
                if let Err(e) = joined {
                    warn!("Identification job failed: {}", e);
                }
            }
            let actions = self.drain_completions(now);
            if actions.is_empty() {
                break;
            }
            let new_events = self.execute(actions.into(), None, now);
            self.publish(&new_events);
            events.extend(new_events);

            if self.machine.dispatcher().admitted_total() > admitted_before {
                self.machine.pause_cloud(true);
            }
        }
        self.machine.pause_cloud(false);
        events
    }

    /// Run the tick loop until the source is exhausted or `cancel` fires
    pub async fn run<S, K>(&mut self, mut source: S, mut sink: K, cancel: CancellationToken)
    where
        S: FrameSource,
        K: EventSink,
    {
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("Scan loop started, ticking every {:?}", self.tick_interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Scan loop cancelled");
                    break;
                }
                _ = interval.tick() => {
                    let Some(frame) = source.next_frame() else {
                        info!("Frame source exhausted");
                        break;
                    };
                    for event in self.tick(&frame, frame.captured_at) {
                        sink.emit(event);
                    }
                }
            }
        }

        for event in self.settle(Instant::now()).await {
            sink.emit(event);
        }
        let status = self.status.read();
        info!(
            "Scan loop stopped: {} lock(s), {} local hit(s), {} cloud hit(s), {} miss(es), hit rate {:.0}%",
            status.locks,
            status.local_hits,
            status.cloud_hits,
            status.misses,
            status.hit_rate() * 100.0
        );
    }

    fn reap_jobs(&mut self) {
        while let Some(joined) = self.jobs.try_join_next() {
            if let Err(e) = joined {
                warn!("Identification job failed: {}", e);
            }
        }
    }

    fn drain_completions(&mut self, now: Instant) -> Vec<LockAction> {
        let mut actions = Vec::new();
        while let Ok(completion) = self.completions_rx.try_recv() {
            match completion {
                Completion::Local { lock_id, entry } => {
                    let entry = entry.and_then(|index| self.local.catalog.get(index));
                    actions.extend(self.machine.on_local_result(lock_id, entry, now));
                }
                Completion::Cloud { lock_id, outcome } => {
                    actions.extend(self.machine.on_cloud_result(lock_id, outcome, now));
                }
            }
        }
        actions
    }

    fn execute(&mut self, mut actions: VecDeque<LockAction>, frame: Option<&Frame>, now: Instant) -> Vec<ScanEvent> {
        let mut events = Vec::new();
        while let Some(action) = actions.pop_front() {
            match action {
                LockAction::Locked { lock_id, quad } => {
                    if self.freeze_on_lock {
                        self.frozen = frame.cloned();
                    }
                    events.push(ScanEvent::Locked { lock_id, quad });
                }
                LockAction::StartLocal { lock_id, quad } => {
                    if !self.start_local(lock_id, &quad, frame) {
                        actions.extend(self.machine.on_local_result(lock_id, None, now));
                    }
                }
                LockAction::StartCloud { lock_id } => {
                    if let Err(e) = self.start_cloud(lock_id) {
                        actions.extend(self.machine.on_cloud_result(lock_id, Err(e), now));
                    }
                }
                LockAction::Identified { lock_id, result } => {
                    self.clear_lock();
                    events.push(ScanEvent::Identified { lock_id, result });
                }
                LockAction::Missed { lock_id } => {
                    self.clear_lock();
                    events.push(ScanEvent::Missed { lock_id });
                }
                LockAction::CloudDegraded { reason, retryable } => {
                    events.push(ScanEvent::CloudDegraded { reason, retryable });
                }
            }
        }
        events
    }

    /// Rectify and spawn the local attempt. Returns false when no canonical
    /// card could be produced.
    fn start_local(&mut self, lock_id: Uuid, quad: &Quadrilateral, frame: Option<&Frame>) -> bool {
        let Some(source) = self.frozen.as_ref().or(frame) else {
            return false;
        };
        let card = match self.rectifier.rectify(source, quad) {
            Ok(card) => Arc::new(card),
            Err(e) => {
                debug!("Rectification for {} failed: {}", lock_id, e);
                return false;
            }
        };

        self.save_canonical(lock_id, &card);
        self.canonical = Some((lock_id, Arc::clone(&card)));

        let local = Arc::clone(&self.local);
        let tx = self.completions_tx.clone();
        self.jobs.spawn(async move {
            let entry = local.identify(&card).await;
            // The pipeline may be gone by now
            let _ = tx.send(Completion::Local { lock_id, entry });
        });
        true
    }

    fn start_cloud(&mut self, lock_id: Uuid) -> Result<(), CloudError> {
        let cloud = self
            .cloud
            .as_ref()
            .map(Arc::clone)
            .ok_or_else(|| CloudError::Encode("no cloud identifier configured".to_string()))?;
        let card = match &self.canonical {
            Some((id, card)) if *id == lock_id => Arc::clone(card),
            _ => return Err(CloudError::Encode("no canonical card for this lock".to_string())),
        };

        let quality = self.jpeg_quality;
        let instruction = self.instruction.clone();
        let tx = self.completions_tx.clone();
        self.jobs.spawn(async move {
            let outcome = match card.to_jpeg(quality) {
                Ok(jpeg) => cloud.identify(CloudRequest { jpeg, instruction }).await,
                Err(e) => Err(CloudError::Encode(e.to_string())),
            };
            let _ = tx.send(Completion::Cloud { lock_id, outcome });
        });
        Ok(())
    }

    fn save_canonical(&self, lock_id: Uuid, card: &CanonicalCard) {
        let Some(dir) = &self.canonical_dir else {
            return;
        };
        let path = dir.join(format!("{}.png", lock_id));
        match card.image().save(&path) {
            Ok(()) => debug!("Saved canonical card to {:?}", path),
            Err(e) => warn!("Failed to save canonical card to {:?}: {}", path, e),
        }
    }

    fn clear_lock(&mut self) {
        self.frozen = None;
        self.canonical = None;
    }

    fn publish(&self, events: &[ScanEvent]) {
        let mut status = self.status.write();
        for event in events {
            status.record(event);
        }
        status.phase = self.machine.state().name();
        status.cloud_calls = self.machine.dispatcher().admitted_total();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identify::ConfidenceSource;
    use crate::vision::detection::tests::synthetic_frame;
    use crate::vision::RecognizeError;
    use async_trait::async_trait;
    use image::{GrayImage, RgbImage};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Answers with fixed text per band; the number band is the one whose
    /// whitelist allows a slash
    struct FixedRecognizer {
        name: String,
        number: String,
    }

    impl FixedRecognizer {
        fn new(name: &str, number: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                number: number.to_string(),
            })
        }
    }

    #[async_trait]
    impl TextRecognizer for FixedRecognizer {
        async fn recognize(&self, _image: &GrayImage, whitelist: &str, _single_line: bool) -> Result<String, RecognizeError> {
            if whitelist.contains('/') {
                Ok(self.number.clone())
            } else {
                Ok(self.name.clone())
            }
        }
    }

    struct FakeCloud {
        replies: Mutex<VecDeque<Result<CloudCard, CloudError>>>,
        calls: AtomicUsize,
    }

    impl FakeCloud {
        fn new(replies: Vec<Result<CloudCard, CloudError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl CloudIdentifier for FakeCloud {
        async fn identify(&self, request: CloudRequest) -> Result<CloudCard, CloudError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert_eq!(&request.jpeg[..2], &[0xFF, 0xD8]);
            self.replies.lock().pop_front().unwrap_or(Err(CloudError::RateLimited))
        }
    }

    fn card_frame() -> Frame {
        synthetic_frame(640, 480, [(220, 100), (420, 100), (420, 380), (220, 380)])
    }

    fn blank_frame() -> Frame {
        Frame::new(RgbImage::new(640, 480))
    }

    fn named(name: &str) -> CloudCard {
        CloudCard {
            name: Some(name.to_string()),
            ..Default::default()
        }
    }

    fn pipeline(
        config: ScannerConfig,
        recognizer: Arc<dyn TextRecognizer>,
        cloud: Option<Arc<dyn CloudIdentifier>>,
    ) -> ScanPipeline {
        let catalog = Catalog::sample().unwrap();
        let species = SpeciesList::from_catalog(&catalog);
        ScanPipeline::new(config, catalog, species, recognizer, cloud).unwrap()
    }

    fn ms(start: Instant, millis: u64) -> Instant {
        start + Duration::from_millis(millis)
    }

    fn identified(events: &[ScanEvent]) -> Vec<&crate::identify::IdentificationResult> {
        events
            .iter()
            .filter_map(|e| match e {
                ScanEvent::Identified { result, .. } => Some(result),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = ScannerConfig::default();
        config.lock.timeout_ms = 0;
        let catalog = Catalog::sample().unwrap();
        let result = ScanPipeline::new(
            config,
            catalog,
            SpeciesList::builtin(),
            FixedRecognizer::new("", ""),
            None,
        );
        assert!(matches!(result, Err(ConfigError::NonPositiveDuration(_))));
    }

    #[tokio::test]
    async fn test_local_identification() {
        let mut p = pipeline(ScannerConfig::default(), FixedRecognizer::new("Vikavolt", "019/191"), None);
        let start = Instant::now();

        let events = p.tick(&card_frame(), start);
        assert!(matches!(&events[..], [ScanEvent::Locked { .. }]));
        assert!(matches!(p.state(), LockState::Locked(_)));

        let events = p.settle(ms(start, 100)).await;
        let results = identified(&events);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].name, "Vikavolt");
        assert_eq!(results[0].number, "019/191");
        assert_eq!(results[0].source, ConfidenceSource::Local);
        assert_eq!(p.state(), &LockState::Searching);

        let status = p.status();
        let status = status.read();
        assert_eq!(status.locks, 1);
        assert_eq!(status.local_hits, 1);
        assert_eq!(status.phase, "searching");
    }

    #[tokio::test]
    async fn test_completion_applied_on_next_tick() {
        let mut p = pipeline(ScannerConfig::default(), FixedRecognizer::new("Vikavolt", "019/191"), None);
        let start = Instant::now();
        p.tick(&card_frame(), start);

        // Tick until the local job has reported back
        let mut results = Vec::new();
        for i in 1..=50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let events = p.tick(&card_frame(), ms(start, 10 * i));
            results.extend(identified(&events).into_iter().cloned());
            if !results.is_empty() {
                break;
            }
        }
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].name, "Vikavolt");
    }

    #[tokio::test]
    async fn test_cloud_fallback() {
        let cloud = FakeCloud::new(vec![Ok(named("Latias ex"))]);
        let mut p = pipeline(
            ScannerConfig::default(),
            FixedRecognizer::new("", ""),
            Some(cloud.clone()),
        );
        let start = Instant::now();
        p.tick(&card_frame(), start);

        let events = p.settle(ms(start, 200)).await;
        let results = identified(&events);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].name, "Latias ex");
        assert_eq!(results[0].source, ConfidenceSource::Cloud);
        assert_eq!(cloud.calls.load(Ordering::SeqCst), 1);
        assert_eq!(p.status().read().cloud_calls, 1);
    }

    #[tokio::test]
    async fn test_cloud_failure_then_timeout() {
        let cloud = FakeCloud::new(vec![Err(CloudError::RateLimited)]);
        let mut p = pipeline(
            ScannerConfig::default(),
            FixedRecognizer::new("", ""),
            Some(cloud.clone()),
        );
        let start = Instant::now();
        p.tick(&card_frame(), start);

        let events = p.settle(ms(start, 200)).await;
        assert!(matches!(
            &events[..],
            [ScanEvent::CloudDegraded { retryable: true, .. }]
        ));
        assert!(matches!(p.state(), LockState::Resolving(_)));
        assert!(p.status().read().last_warning.is_some());

        let events = p.tick(&blank_frame(), ms(start, 5000));
        assert!(matches!(&events[..], [ScanEvent::Missed { .. }]));
        assert_eq!(p.state(), &LockState::Searching);
        assert_eq!(p.status().read().misses, 1);
    }

    #[tokio::test]
    async fn test_settle_returns_while_cloud_keeps_failing() {
        // Every reply is a retryable failure
        let cloud = FakeCloud::new(Vec::new());
        let mut p = pipeline(
            ScannerConfig::default(),
            FixedRecognizer::new("", ""),
            Some(cloud.clone()),
        );
        let start = Instant::now();
        p.tick(&card_frame(), start);

        let settled = tokio::time::timeout(Duration::from_secs(5), p.settle(ms(start, 100))).await;
        let events = settled.expect("settle should finish");
        assert_eq!(cloud.calls.load(Ordering::SeqCst), 1);
        assert!(matches!(&events[..], [ScanEvent::CloudDegraded { .. }]));
        assert_eq!(p.pending_jobs(), 0);

        // Cloud admission resumes on the next tick once the cooldown passed
        p.tick(&blank_frame(), ms(start, 3200));
        assert_eq!(p.status().read().cloud_calls, 2);
    }

    #[tokio::test]
    async fn test_eager_mode_emits_one_result() {
        let mut config = ScannerConfig::default();
        config.lock.local_first = false;
        let cloud = FakeCloud::new(vec![Ok(named("Vikavolt"))]);
        let mut p = pipeline(config, FixedRecognizer::new("Vikavolt", "019/191"), Some(cloud.clone()));
        let start = Instant::now();

        p.tick(&card_frame(), start);
        assert_eq!(cloud.calls.load(Ordering::SeqCst), 0);
        let events = p.settle(ms(start, 300)).await;

        assert_eq!(identified(&events).len(), 1);
        assert_eq!(cloud.calls.load(Ordering::SeqCst), 1);
        assert_eq!(p.state(), &LockState::Searching);
    }

    #[tokio::test]
    async fn test_frozen_frame_keeps_tracking() {
        let mut p = pipeline(ScannerConfig::default(), FixedRecognizer::new("", ""), None);
        let start = Instant::now();
        let lock = p.tick(&card_frame(), start)[0].lock_id();

        // The live feed goes dark but detection runs on the frozen frame
        assert!(p.tick(&blank_frame(), ms(start, 150)).is_empty());
        assert!(p.status().read().current_quad.is_some());
        assert_eq!(p.machine.current_lock(), lock);
    }

    #[tokio::test]
    async fn test_unfrozen_lost_detection_keeps_lock() {
        let mut config = ScannerConfig::default();
        config.lock.freeze_on_lock = false;
        let mut p = pipeline(config, FixedRecognizer::new("", ""), None);
        let start = Instant::now();
        p.tick(&card_frame(), start);

        assert!(p.tick(&blank_frame(), ms(start, 150)).is_empty());
        assert!(p.status().read().current_quad.is_none());
        assert!(p.machine.current_lock().is_some());
    }

    #[tokio::test]
    async fn test_relock_after_miss() {
        let mut p = pipeline(ScannerConfig::default(), FixedRecognizer::new("", ""), None);
        let start = Instant::now();
        let first = p.tick(&card_frame(), start)[0].lock_id();
        p.settle(ms(start, 100)).await;

        let events = p.tick(&card_frame(), ms(start, 5000));
        assert_eq!(events, vec![ScanEvent::Missed { lock_id: first.unwrap() }]);

        let events = p.tick(&card_frame(), ms(start, 5150));
        let second = events[0].lock_id();
        assert!(second.is_some());
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_saves_canonical_cards() {
        let dir = tempfile::tempdir().unwrap();
        let mut p = pipeline(ScannerConfig::default(), FixedRecognizer::new("", ""), None)
            .with_canonical_dir(dir.path());
        let lock = p.tick(&card_frame(), Instant::now())[0].lock_id().unwrap();

        let saved = image::open(dir.path().join(format!("{}.png", lock))).unwrap();
        assert_eq!((saved.width(), saved.height()), (400, 560));
    }

    struct VecSource(VecDeque<Frame>);

    impl FrameSource for VecSource {
        fn next_frame(&mut self) -> Option<Frame> {
            self.0.pop_front()
        }
    }

    #[tokio::test]
    async fn test_run_until_source_exhausted() {
        let mut config = ScannerConfig::default();
        config.lock.tick_interval_ms = 5;
        let mut p = pipeline(config, FixedRecognizer::new("Grubbin", "017/191"), None);

        let frames: VecDeque<Frame> = (0..4).map(|_| card_frame()).collect();
        let (tx, rx) = crossbeam_channel::unbounded::<ScanEvent>();
        p.run(VecSource(frames), tx, CancellationToken::new()).await;

        let events: Vec<ScanEvent> = rx.try_iter().collect();
        assert!(matches!(events.first(), Some(ScanEvent::Locked { .. })));
        let results = identified(&events);
        assert!(!results.is_empty());
        assert!(results.iter().all(|r| r.name == "Grubbin"));
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let mut p = pipeline(ScannerConfig::default(), FixedRecognizer::new("", ""), None);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let frames: VecDeque<Frame> = (0..100).map(|_| blank_frame()).collect();
        // A pre-cancelled token may still race the first tick
        p.run(VecSource(frames), Vec::new(), cancel).await;
        assert!(p.status().read().ticks <= 1);
    }
}
