//! Public control surface: owns the shared signals and playback queue, starts
//! the two worker loops and stops them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use tracing::{debug, info, warn};

use crate::devices::{resolve_input_device, resolve_output_device};
use crate::{
    load_subscription_key, AudioBackend, CaptureSource, ControlSignals, EngineSettings, Flag,
    PlaybackQueue, RequestId, Result, SpeakRequest, SpeechCallback, SpeechConfig, SpeechEngine,
    SpeechError, SttManager, TtsManager,
};

/// Cloneable handle for enqueueing speech and steering the listen loop.
///
/// Handed to callbacks so they can reply without a reference to the
/// [`SpeechLoop`] itself.
#[derive(Clone, Debug)]
pub struct SpeechHandle {
    signals: Arc<ControlSignals>,
    queue: Arc<PlaybackQueue>,
    stopped: Arc<AtomicBool>,
}

impl SpeechHandle {
    pub fn new(signals: Arc<ControlSignals>, queue: Arc<PlaybackQueue>) -> Self {
        Self {
            signals,
            queue,
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Shared flags. Raising [`Flag::TtsInterrupt`] directly only cancels
    /// playback superseded by an immediate enqueue; use
    /// [`SpeechHandle::enqueue`] or [`SpeechHandle::shutdown`] to cut the
    /// current synthesis.
    pub fn signals(&self) -> &Arc<ControlSignals> {
        &self.signals
    }

    pub fn queue(&self) -> &Arc<PlaybackQueue> {
        &self.queue
    }

    /// Queue `text` for playback. With `immediate`, everything still queued is
    /// dropped without a callback, the request becomes the next one played and
    /// the current synthesis is cancelled. Never blocks on playback.
    pub fn enqueue(&self, text: impl Into<String>, immediate: bool) -> RequestId {
        let request = SpeakRequest::new(text);
        let request_id = request.id;
        if immediate {
            let discarded = self.queue.preempt(request);
            self.signals.set(Flag::TtsInterrupt);
            debug!(%request_id, discarded = discarded.len(), "immediate enqueue");
        } else {
            self.queue.push(request);
            debug!(%request_id, "enqueued");
            if self.is_stopping() {
                debug!(%request_id, "enqueued after stop, will not be played");
            }
        }
        request_id
    }

    /// Let the listen loop go straight to recognition. Applies to the current
    /// keyword wait, or to the next one if none is active.
    pub fn skip_keyword_wait(&self) {
        self.signals.set(Flag::KeywordDone);
    }

    pub fn is_stopping(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Ask both loops to exit. Idempotent.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            debug!("stop already requested");
            return;
        }
        info!("stopping speech loop");
        self.signals.set(Flag::SttStop);
        self.signals.set(Flag::TtsStop);
        self.signals.set(Flag::TtsInterrupt);
        self.queue.push_terminate();
    }
}

#[derive(Default)]
struct Workers {
    started: bool,
    tts: Option<JoinHandle<()>>,
    stt: Option<JoinHandle<()>>,
    /// Set once the handles have been joined; `failure` is final from then on.
    joined: bool,
    failure: Option<String>,
}

/// Duplex voice loop: keyword-gated recognition on one worker thread,
/// queued interruptible playback on another.
pub struct SpeechLoop {
    config: SpeechConfig,
    engine: Arc<dyn SpeechEngine>,
    audio: Arc<dyn AudioBackend>,
    callback: Arc<dyn SpeechCallback>,
    speech: SpeechHandle,
    workers: Mutex<Workers>,
    exited: Condvar,
}

impl SpeechLoop {
    pub fn new(
        config: SpeechConfig,
        engine: Arc<dyn SpeechEngine>,
        audio: Arc<dyn AudioBackend>,
        callback: Arc<dyn SpeechCallback>,
    ) -> Self {
        Self {
            config,
            engine,
            audio,
            callback,
            speech: SpeechHandle::new(
                Arc::new(ControlSignals::new()),
                Arc::new(PlaybackQueue::new()),
            ),
            workers: Mutex::new(Workers::default()),
            exited: Condvar::new(),
        }
    }

    pub fn handle(&self) -> SpeechHandle {
        self.speech.clone()
    }

    fn workers(&self) -> MutexGuard<'_, Workers> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolve credentials and devices, build the engine collaborators and
    /// spawn both loops. Configuration problems are reported here, before
    /// the engine is touched.
    pub fn start(&self) -> Result<()> {
        let mut workers = self.workers();
        if workers.started {
            return Err(SpeechError::Worker("speech loop already started".to_string()));
        }
        if self.speech.is_stopping() {
            return Err(SpeechError::Worker("speech loop has been stopped".to_string()));
        }

        self.config.validate()?;
        let subscription_key = load_subscription_key(&self.config.key_env_var)?;
        let devices = self.audio.devices()?;
        let microphone = resolve_input_device(&devices, &self.config.microphone)?;
        let output_device = resolve_output_device(&devices, &self.config.speaker)?;
        info!(
            microphone = %microphone.name,
            output_device = %output_device,
            "audio devices resolved"
        );

        let settings = EngineSettings {
            subscription_key,
            region: self.config.region.clone(),
            voice_name: self.config.voice_name.clone(),
            keyword_model: self.config.wake_word_model.clone(),
            output_device,
            silence_timeout: self.config.silence_timeout(),
        };
        let synthesizer = self.engine.synthesizer(&settings)?;
        let listener = self.engine.listener(&settings)?;

        let tts = TtsManager::new(
            Arc::clone(&self.speech.signals),
            Arc::clone(&self.speech.queue),
            synthesizer,
            Arc::clone(&self.callback),
        )
        .spawn();
        let tts = match tts {
            Ok(handle) => handle,
            Err(e) => {
                self.speech.shutdown();
                return Err(e);
            }
        };
        let stt = SttManager::new(
            self.speech.clone(),
            Arc::clone(&self.callback),
            listener,
            CaptureSource {
                backend: Arc::clone(&self.audio),
                device: microphone,
                sample_rate_hz: self.config.sample_rate_hz,
            },
            settings.keyword_model.clone(),
        )
        .spawn();
        let stt = match stt {
            Ok(handle) => handle,
            Err(e) => {
                self.speech.shutdown();
                if tts.join().is_err() {
                    warn!("playback loop panicked");
                }
                return Err(e);
            }
        };

        workers.started = true;
        workers.tts = Some(tts);
        workers.stt = Some(stt);
        info!("speech loop started");
        Ok(())
    }

    /// See [`SpeechHandle::shutdown`]. Safe before `start`.
    pub fn stop(&self) {
        self.speech.shutdown();
    }

    /// Wait for both loops to exit. Returns at once if they were never
    /// started; otherwise blocks until someone calls [`SpeechLoop::stop`].
    /// Any number of threads may join; all of them wait for the loops.
    pub fn join(&self) -> Result<()> {
        let (tts, stt) = {
            let mut workers = self.workers();
            loop {
                if !workers.started || workers.joined {
                    return joined_result(&workers);
                }
                if workers.tts.is_some() || workers.stt.is_some() {
                    break (workers.tts.take(), workers.stt.take());
                }
                // Another caller holds the handles.
                workers = self
                    .exited
                    .wait(workers)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };

        let mut panicked = Vec::new();
        if let Some(handle) = tts {
            if handle.join().is_err() {
                panicked.push("playback");
            }
        }
        if let Some(handle) = stt {
            if handle.join().is_err() {
                panicked.push("listen");
            }
        }

        let mut workers = self.workers();
        workers.joined = true;
        if !panicked.is_empty() {
            workers.failure = Some(format!("{} loop panicked", panicked.join(" and ")));
        }
        self.exited.notify_all();
        debug!("speech loop joined");
        joined_result(&workers)
    }

    pub fn enqueue(&self, text: impl Into<String>, immediate: bool) -> RequestId {
        self.speech.enqueue(text, immediate)
    }

    pub fn skip_keyword_wait(&self) {
        self.speech.skip_keyword_wait();
    }
}

fn joined_result(workers: &Workers) -> Result<()> {
    match &workers.failure {
        Some(failure) => Err(SpeechError::Worker(failure.clone())),
        None => Ok(()),
    }
}

impl Drop for SpeechLoop {
    fn drop(&mut self) {
        self.stop();
        if let Err(e) = self.join() {
            warn!(error = %e, "speech loop did not shut down cleanly");
        }
    }
}
