//! Playback loop: dequeues speak requests, drives synthesis and reports one
//! outcome per dequeued request. A watcher thread turns `TtsInterrupt` into a
//! cancellation of the in-flight synthesis.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::{
    ControlSignals, Flag, PlaybackQueue, QueueItem, RequestId, Result, SpeakRequest,
    SpeechCallback, SpeechError, Synthesizer,
};

#[derive(Clone, Copy, Debug)]
struct ActiveSynthesis {
    generation: u64,
    epoch: u64,
    request_id: RequestId,
}

#[derive(Debug, Default)]
struct SlotState {
    generation: u64,
    active: Option<ActiveSynthesis>,
    outcome: Option<bool>,
    /// Requests queued under an older epoch are refused or cancelled.
    floor_epoch: u64,
    closed: bool,
    /// Set between cancelling a synthesis and the engine acknowledging the
    /// stop, so the next synthesis cannot be caught by that stop.
    halting: bool,
}

/// Tracks the single in-flight synthesis. The first outcome reported for a
/// generation wins; later reports for it, or for older generations, are
/// dropped.
#[derive(Debug, Default)]
struct SynthesisSlot {
    state: Mutex<SlotState>,
    settled: Condvar,
}

impl SynthesisSlot {
    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin(&self, request: &SpeakRequest) -> Option<u64> {
        let mut state = self.lock();
        while state.halting {
            state = self
                .settled
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        if state.closed || request.epoch < state.floor_epoch {
            return None;
        }
        state.generation += 1;
        let generation = state.generation;
        state.active = Some(ActiveSynthesis {
            generation,
            epoch: request.epoch,
            request_id: request.id,
        });
        state.outcome = None;
        Some(generation)
    }

    fn settle(&self, generation: u64, success: bool) -> bool {
        let mut state = self.lock();
        let current = matches!(state.active, Some(active) if active.generation == generation);
        if !current || state.outcome.is_some() {
            return false;
        }
        state.outcome = Some(success);
        self.settled.notify_all();
        true
    }

    /// Block until the active synthesis has an outcome and retire it.
    fn wait(&self) -> bool {
        let mut state = self.lock();
        loop {
            if let Some(success) = state.outcome.take() {
                state.active = None;
                return success;
            }
            if state.active.is_none() {
                return false;
            }
            state = self
                .settled
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn cancel_superseded(&self, floor_epoch: u64) -> Option<RequestId> {
        let mut state = self.lock();
        state.floor_epoch = state.floor_epoch.max(floor_epoch);
        let floor = state.floor_epoch;
        self.cancel_active(&mut state, |active| active.epoch < floor)
    }

    /// Refuse all further syntheses and cancel the current one.
    fn close(&self) -> Option<RequestId> {
        let mut state = self.lock();
        state.closed = true;
        self.cancel_active(&mut state, |_| true)
    }

    fn cancel_active(
        &self,
        state: &mut SlotState,
        should_cancel: impl Fn(&ActiveSynthesis) -> bool,
    ) -> Option<RequestId> {
        match state.active {
            Some(active) if state.outcome.is_none() && should_cancel(&active) => {
                state.outcome = Some(false);
                state.halting = true;
                self.settled.notify_all();
                Some(active.request_id)
            }
            _ => None,
        }
    }

    fn halted(&self) {
        self.lock().halting = false;
        self.settled.notify_all();
    }
}

/// Handed to the engine with every synthesis; reports how it ended.
#[derive(Clone, Debug)]
pub struct SynthesisNotifier {
    slot: Arc<SynthesisSlot>,
    generation: u64,
}

impl SynthesisNotifier {
    pub fn completed(&self) {
        if self.slot.settle(self.generation, true) {
            debug!(generation = self.generation, "synthesis completed");
        }
    }

    pub fn canceled(&self) {
        if self.slot.settle(self.generation, false) {
            debug!(generation = self.generation, "synthesis canceled");
        }
    }
}

pub struct TtsManager {
    signals: Arc<ControlSignals>,
    queue: Arc<PlaybackQueue>,
    synthesizer: Arc<dyn Synthesizer>,
    callback: Arc<dyn SpeechCallback>,
    slot: Arc<SynthesisSlot>,
}

impl TtsManager {
    pub fn new(
        signals: Arc<ControlSignals>,
        queue: Arc<PlaybackQueue>,
        synthesizer: Arc<dyn Synthesizer>,
        callback: Arc<dyn SpeechCallback>,
    ) -> Self {
        Self {
            signals,
            queue,
            synthesizer,
            callback,
            slot: Arc::new(SynthesisSlot::default()),
        }
    }

    /// Start the interrupt watcher and the playback loop. Without the
    /// watcher nothing could cut a synthesis short, so failing to start it
    /// is an error.
    pub fn spawn(self) -> Result<JoinHandle<()>> {
        let watcher = self.spawn_watcher()?;
        let signals = Arc::clone(&self.signals);
        thread::Builder::new()
            .name("speech-tts".to_string())
            .spawn(move || self.run(watcher))
            .map_err(|e| {
                release_watcher(&signals);
                SpeechError::Worker(format!("spawning playback loop: {e}"))
            })
    }

    fn spawn_watcher(&self) -> Result<JoinHandle<()>> {
        let signals = Arc::clone(&self.signals);
        let queue = Arc::clone(&self.queue);
        let slot = Arc::clone(&self.slot);
        let synthesizer = Arc::clone(&self.synthesizer);
        thread::Builder::new()
            .name("speech-tts-interrupt".to_string())
            .spawn(move || watch_interrupts(&signals, &queue, &slot, synthesizer.as_ref()))
            .map_err(|e| SpeechError::Worker(format!("spawning interrupt watcher: {e}")))
    }

    /// Run until a termination marker is dequeued.
    fn run(self, watcher: JoinHandle<()>) {
        info!("playback loop started");
        self.speak_loop();

        release_watcher(&self.signals);
        if watcher.join().is_err() {
            warn!("interrupt watcher panicked");
        }
        info!("playback loop exited");
    }

    fn speak_loop(&self) {
        loop {
            let request = match self.queue.pop() {
                QueueItem::Terminate => {
                    debug!("termination marker dequeued");
                    break;
                }
                QueueItem::Speak(request) => request,
            };
            let success = self.play(&request);
            self.callback.on_synthesis_done(request.id, success);
        }
    }

    fn play(&self, request: &SpeakRequest) -> bool {
        if self.signals.is_set(Flag::TtsStop) {
            debug!(request_id = %request.id, "shutting down, request not spoken");
            return false;
        }
        let Some(generation) = self.slot.begin(request) else {
            debug!(request_id = %request.id, epoch = request.epoch, "request superseded before playback");
            return false;
        };

        let queued = OffsetDateTime::now_utc() - request.enqueued_at;
        debug!(
            request_id = %request.id,
            epoch = request.epoch,
            queued_s = queued.as_seconds_f64(),
            "speaking"
        );
        let notifier = SynthesisNotifier {
            slot: Arc::clone(&self.slot),
            generation,
        };
        if let Err(e) = self.synthesizer.speak(&request.text, notifier.clone()) {
            warn!(request_id = %request.id, error = %e, "synthesis failed to start");
            notifier.canceled();
        }
        let success = self.slot.wait();
        debug!(request_id = %request.id, success, "synthesis finished");
        success
    }
}

fn release_watcher(signals: &ControlSignals) {
    signals.set(Flag::TtsStop);
    signals.set(Flag::TtsInterrupt);
}

fn watch_interrupts(
    signals: &ControlSignals,
    queue: &PlaybackQueue,
    slot: &SynthesisSlot,
    synthesizer: &dyn Synthesizer,
) {
    loop {
        signals.wait_until_set(Flag::TtsInterrupt);
        signals.clear(Flag::TtsInterrupt);
        let stopping = signals.is_set(Flag::TtsStop);
        let canceled = if stopping {
            slot.close()
        } else {
            slot.cancel_superseded(queue.epoch())
        };
        if let Some(request_id) = canceled {
            info!(%request_id, stopping, "interrupting playback");
            if let Err(e) = synthesizer.stop_speaking() {
                warn!(error = %e, "engine failed to stop speaking");
            }
            slot.halted();
        }
        if stopping {
            break;
        }
    }
    debug!("interrupt watcher exited");
}

#[cfg(all(test, feature = "mock"))]
mod tests {
    use super::*;
    use crate::mock::{join_within, EventLog, MockEngine, SpeechEvent, SynthesisMode};
    use crate::SpeechHandle;
    use std::collections::{HashMap, HashSet};
    use std::time::{Duration, Instant};

    const WAIT: Duration = Duration::from_secs(5);

    struct Harness {
        signals: Arc<ControlSignals>,
        queue: Arc<PlaybackQueue>,
        engine: MockEngine,
        events: Arc<EventLog>,
        worker: Option<JoinHandle<()>>,
    }

    impl Harness {
        fn start(mode: SynthesisMode) -> Self {
            let signals = Arc::new(ControlSignals::new());
            let queue = Arc::new(PlaybackQueue::new());
            let engine = MockEngine::new();
            engine.set_synthesis_mode(mode);
            let events = EventLog::new();
            let manager = TtsManager::new(
                Arc::clone(&signals),
                Arc::clone(&queue),
                engine.mock_synthesizer(),
                events.clone(),
            );
            let worker = Some(manager.spawn().unwrap());
            Self {
                signals,
                queue,
                engine,
                events,
                worker,
            }
        }

        fn push(&self, text: &str) -> RequestId {
            let request = SpeakRequest::new(text);
            let id = request.id;
            self.queue.push(request);
            id
        }

        fn push_immediate(&self, text: &str) -> RequestId {
            let request = SpeakRequest::new(text);
            let id = request.id;
            self.queue.preempt(request);
            self.signals.set(Flag::TtsInterrupt);
            id
        }

        fn shutdown(&mut self) {
            self.signals.set(Flag::TtsStop);
            self.signals.set(Flag::TtsInterrupt);
            self.queue.push_terminate();
            let worker = self.worker.take().unwrap();
            worker.join().unwrap();
        }
    }

    #[test]
    fn every_request_reports_exactly_once_in_order() {
        let mut h = Harness::start(SynthesisMode::Immediate);
        let ids: Vec<_> = ["one", "two", "three"].iter().map(|t| h.push(t)).collect();
        assert!(h.events.wait_until(|e| e.len() == 3, WAIT));
        h.shutdown();

        let outcomes = h.events.synthesis_outcomes();
        assert_eq!(outcomes, ids.iter().map(|id| (*id, true)).collect::<Vec<_>>());
        assert_eq!(h.engine.spoken(), vec!["one", "two", "three"]);
    }

    #[test]
    fn interrupt_cancels_superseded_synthesis_but_not_the_new_head() {
        let mut h = Harness::start(SynthesisMode::Hold);
        let old = h.push("long story");
        assert_eq!(
            h.engine.wait_for_pending_synthesis(WAIT).as_deref(),
            Some("long story")
        );

        let urgent = h.push_immediate("stop that");
        assert!(h.events.wait_until(|e| e.len() == 1, WAIT));
        assert!(h.engine.wait_for_synthesis_of("stop that", WAIT));
        assert!(h.engine.complete_pending());
        assert!(h.events.wait_until(|e| e.len() == 2, WAIT));
        h.shutdown();

        assert_eq!(h.events.synthesis_outcomes(), vec![(old, false), (urgent, true)]);
        assert!(h.engine.stop_speaking_calls() >= 1);
    }

    #[test]
    fn interrupt_with_nothing_playing_is_harmless() {
        let mut h = Harness::start(SynthesisMode::Immediate);
        h.signals.set(Flag::TtsInterrupt);
        let id = h.push("hello");
        assert!(h.events.wait_until(|e| e.len() == 1, WAIT));
        h.shutdown();
        assert_eq!(h.events.synthesis_outcomes(), vec![(id, true)]);
    }

    #[test]
    fn bare_interrupt_leaves_current_playback_running() {
        let mut h = Harness::start(SynthesisMode::Hold);
        let id = h.push("keep going");
        assert!(h.engine.wait_for_synthesis_of("keep going", WAIT));

        h.signals.set(Flag::TtsInterrupt);
        let deadline = Instant::now() + WAIT;
        while h.signals.is_set(Flag::TtsInterrupt) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!h.signals.is_set(Flag::TtsInterrupt));
        thread::sleep(Duration::from_millis(50));
        assert!(h.events.events().is_empty());
        assert_eq!(h.engine.stop_speaking_calls(), 0);

        assert!(h.engine.complete_pending());
        assert!(h.events.wait_until(|e| e.len() == 1, WAIT));
        h.shutdown();
        assert_eq!(h.events.synthesis_outcomes(), vec![(id, true)]);
    }

    #[test]
    fn immediate_request_ahead_of_termination_is_reported() {
        let mut h = Harness::start(SynthesisMode::Hold);
        let held = h.push("held");
        assert!(h.engine.wait_for_synthesis_of("held", WAIT));

        // Stop with the interrupt still pending, then jump the queue.
        h.signals.set(Flag::TtsStop);
        h.queue.push_terminate();
        let speech = SpeechHandle::new(Arc::clone(&h.signals), Arc::clone(&h.queue));
        let late = speech.enqueue("late", true);

        assert!(h.events.wait_until(|e| e.len() == 2, WAIT));
        h.shutdown();
        assert_eq!(
            h.events.synthesis_outcomes(),
            vec![(held, false), (late, false)]
        );
        assert_eq!(h.engine.spoken(), vec!["held"]);
    }

    #[test]
    fn racing_producers_get_exactly_one_outcome_per_surviving_request() {
        let mut h = Harness::start(SynthesisMode::Paced(Duration::from_micros(200)));
        let producers: Vec<_> = (0..4)
            .map(|p| {
                let queue = Arc::clone(&h.queue);
                let signals = Arc::clone(&h.signals);
                thread::spawn(move || {
                    let mut ids = Vec::new();
                    let mut discarded = Vec::new();
                    for i in 0..25 {
                        let request = SpeakRequest::new(format!("p{p} r{i}"));
                        ids.push(request.id);
                        if (i + p) % 6 == 0 {
                            discarded.extend(queue.preempt(request).into_iter().map(|r| r.id));
                            signals.set(Flag::TtsInterrupt);
                        } else {
                            queue.push(request);
                        }
                        if i % 5 == 0 {
                            thread::sleep(Duration::from_millis(1));
                        }
                    }
                    (ids, discarded)
                })
            })
            .collect();

        let mut ids = HashSet::new();
        let mut discarded = HashSet::new();
        for producer in producers {
            let (produced, dropped) = producer.join().unwrap();
            ids.extend(produced);
            for id in dropped {
                // A request is discarded at most once.
                assert!(discarded.insert(id));
            }
        }
        h.shutdown();

        let mut counts: HashMap<RequestId, usize> = HashMap::new();
        for (id, _) in h.events.synthesis_outcomes() {
            *counts.entry(id).or_default() += 1;
        }
        assert!(counts.values().all(|&n| n == 1), "duplicate outcome");
        assert!(counts.keys().all(|id| ids.contains(id)), "unknown id");
        assert!(counts.keys().all(|id| !discarded.contains(id)));
        for id in ids.difference(&discarded) {
            assert!(counts.contains_key(id), "request {id} never reported");
        }
        assert_eq!(counts.len(), ids.len() - discarded.len());
    }

    #[test]
    fn releasing_the_watcher_closes_the_slot_and_ends_it() {
        let signals = Arc::new(ControlSignals::new());
        let engine = MockEngine::new();
        let manager = TtsManager::new(
            Arc::clone(&signals),
            Arc::new(PlaybackQueue::new()),
            engine.mock_synthesizer(),
            EventLog::new(),
        );
        let watcher = manager.spawn_watcher().unwrap();

        release_watcher(&signals);
        assert!(join_within(watcher, WAIT));
        assert!(signals.is_set(Flag::TtsStop));
        assert!(manager.slot.begin(&SpeakRequest::new("late")).is_none());
    }

    #[test]
    fn engine_start_failure_reports_unsuccessful_outcome() {
        let mut h = Harness::start(SynthesisMode::Fail);
        let first = h.push("one");
        let second = h.push("two");
        assert!(h.events.wait_until(|e| e.len() == 2, WAIT));
        h.shutdown();
        assert_eq!(
            h.events.synthesis_outcomes(),
            vec![(first, false), (second, false)]
        );
    }

    #[test]
    fn shutdown_cancels_held_synthesis_and_fails_the_rest() {
        let mut h = Harness::start(SynthesisMode::Hold);
        let playing = h.push("playing");
        let waiting = h.push("waiting");
        assert!(h.engine.wait_for_pending_synthesis(WAIT).is_some());

        h.shutdown();
        assert_eq!(
            h.events.synthesis_outcomes(),
            vec![(playing, false), (waiting, false)]
        );
        assert_eq!(h.engine.spoken(), vec!["playing"]);
    }

    #[test]
    fn engine_cancellation_is_reported_as_failure() {
        let mut h = Harness::start(SynthesisMode::Hold);
        let id = h.push("hello");
        assert!(h.engine.wait_for_pending_synthesis(WAIT).is_some());
        assert!(h.engine.cancel_pending());
        assert!(h.events.wait_until(|e| e.len() == 1, WAIT));
        h.shutdown();
        assert_eq!(
            h.events.events(),
            vec![SpeechEvent::SynthesisDone {
                request_id: id,
                success: false
            }]
        );
    }

    #[test]
    fn slot_refuses_requests_from_an_older_epoch() {
        let slot = SynthesisSlot::default();
        let mut old = SpeakRequest::new("old");
        old.epoch = 0;
        let generation = slot.begin(&old).unwrap();
        assert_eq!(slot.cancel_superseded(1), Some(old.id));
        assert!(!slot.wait());
        slot.halted();
        // A late report for the retired generation is ignored.
        assert!(!slot.settle(generation, true));

        assert!(slot.begin(&old).is_none());
        let mut fresh = SpeakRequest::new("fresh");
        fresh.epoch = 1;
        let generation = slot.begin(&fresh).unwrap();
        assert_eq!(slot.cancel_superseded(1), None);
        assert!(slot.settle(generation, true));
        assert!(slot.wait());
    }

    #[test]
    fn first_outcome_wins() {
        let slot = Arc::new(SynthesisSlot::default());
        let generation = slot.begin(&SpeakRequest::new("x")).unwrap();
        let notifier = SynthesisNotifier {
            slot: Arc::clone(&slot),
            generation,
        };
        notifier.canceled();
        notifier.completed();
        assert!(!slot.wait());
    }

    #[test]
    fn closed_slot_refuses_new_work() {
        let slot = SynthesisSlot::default();
        assert_eq!(slot.close(), None);
        assert!(slot.begin(&SpeakRequest::new("late")).is_none());
    }
}
