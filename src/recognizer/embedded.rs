//! In-process recognizer variant.
//!
//! The speech engine itself is an external collaborator behind the
//! [`SpeechEngine`] trait; this module hosts it on a dedicated worker thread
//! so its blocking, single-threaded lifecycle never touches the async
//! domain. Audio chunks flow to the worker through an internal command
//! queue; interim text is routed to the registered callback and completed
//! utterances into the blocking transcript queue.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;

use bytes::Bytes;
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, info, warn};

use super::base::{InterimCallback, Recognizer, RecognizerError, RecognizerParams};
use super::queue::TranscriptQueue;
use crate::audio::AudioFormat;

pub use super::base::EngineError;

/// Output of one engine processing step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// Partial text for the utterance in progress.
    Interim(String),
    /// Completed utterance.
    Final(String),
}

/// Contract for an in-process speech engine.
///
/// The engine is owned by a single worker thread: `load` is called once
/// before any audio, `process` once per chunk in feed order, `reset` on
/// abort, and `unload` exactly once at shutdown.
pub trait SpeechEngine: Send {
    /// Load models and allocate resources.
    fn load(&mut self, params: &RecognizerParams) -> Result<(), EngineError>;

    /// Consume one chunk of PCM audio and return any events it produced.
    fn process(&mut self, chunk: &[u8]) -> Result<Vec<EngineEvent>, EngineError>;

    /// Discard the in-flight utterance without unloading models.
    fn reset(&mut self);

    /// Release all engine resources.
    fn unload(&mut self);
}

/// Commands handled by the engine worker.
enum WorkerCommand {
    Audio(Bytes),
    Abort,
    Stop,
}

/// Blocking command queue feeding the engine worker.
#[derive(Default)]
struct CommandQueue {
    state: Mutex<VecDeque<WorkerCommand>>,
    available: Condvar,
}

impl CommandQueue {
    fn push(&self, command: WorkerCommand) {
        self.state.lock().push_back(command);
        self.available.notify_one();
    }

    fn pop(&self) -> WorkerCommand {
        let mut state = self.state.lock();
        loop {
            if let Some(command) = state.pop_front() {
                return command;
            }
            self.available.wait(&mut state);
        }
    }

    /// Drop queued audio without disturbing queued control commands.
    fn discard_audio(&self) {
        self.state
            .lock()
            .retain(|command| !matches!(command, WorkerCommand::Audio(_)));
    }
}

/// Recognizer backed by an engine running on a worker thread in this
/// process.
pub struct EmbeddedRecognizer {
    commands: Arc<CommandQueue>,
    transcripts: Arc<TranscriptQueue>,
    interim: Arc<RwLock<Option<InterimCallback>>>,
    stopped: AtomicBool,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl EmbeddedRecognizer {
    /// Spawn the engine worker and load the engine.
    ///
    /// Blocks until the engine reports the outcome of `load`, so call it
    /// from a blocking-capable context. Load failure consumes the engine.
    ///
    /// # Arguments
    /// * `engine` - The engine instance the worker will own
    /// * `params` - Validated before the worker is spawned
    pub fn start(
        engine: Box<dyn SpeechEngine>,
        params: &RecognizerParams,
    ) -> Result<Self, RecognizerError> {
        params.validate()?;

        let commands = Arc::new(CommandQueue::default());
        let transcripts = Arc::new(TranscriptQueue::new());
        let interim: Arc<RwLock<Option<InterimCallback>>> = Arc::new(RwLock::new(None));

        let (ready_tx, ready_rx) = mpsc::channel();
        let worker_commands = commands.clone();
        let worker_transcripts = transcripts.clone();
        let worker_interim = interim.clone();
        let worker_params = params.clone();

        let handle = thread::Builder::new()
            .name("voxtream-engine".to_string())
            .spawn(move || {
                let mut engine = engine;
                if let Err(e) = engine.load(&worker_params) {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
                let _ = ready_tx.send(Ok(()));
                run_engine(engine, worker_commands, worker_transcripts, worker_interim);
            })
            .map_err(|e| RecognizerError::Init(format!("failed to spawn engine worker: {e}")))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = handle.join();
                return Err(RecognizerError::Engine(e));
            }
            Err(_) => {
                let _ = handle.join();
                return Err(RecognizerError::Init(
                    "engine worker exited during startup".to_string(),
                ));
            }
        }

        info!(
            model = %params.model,
            compute_type = %params.compute_type,
            realtime = params.enable_realtime,
            "speech engine loaded"
        );

        Ok(Self {
            commands,
            transcripts,
            interim,
            stopped: AtomicBool::new(false),
            worker: Mutex::new(Some(handle)),
        })
    }
}

fn run_engine(
    mut engine: Box<dyn SpeechEngine>,
    commands: Arc<CommandQueue>,
    transcripts: Arc<TranscriptQueue>,
    interim: Arc<RwLock<Option<InterimCallback>>>,
) {
    loop {
        match commands.pop() {
            WorkerCommand::Audio(chunk) => match engine.process(&chunk) {
                Ok(events) => {
                    for event in events {
                        match event {
                            EngineEvent::Interim(text) => {
                                let callback = interim.read().clone();
                                if let Some(callback) = callback {
                                    callback(&text);
                                }
                            }
                            EngineEvent::Final(text) => transcripts.push_text(text),
                        }
                    }
                }
                Err(e) => {
                    warn!("speech engine failed to process chunk: {e}");
                    transcripts.push_failure(e.to_string());
                }
            },
            WorkerCommand::Abort => engine.reset(),
            WorkerCommand::Stop => break,
        }
    }
    engine.unload();
    debug!("speech engine worker finished");
}

impl Recognizer for EmbeddedRecognizer {
    fn feed_audio(
        &self,
        chunk: Bytes,
        _format: Option<AudioFormat>,
    ) -> Result<(), RecognizerError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(RecognizerError::Stopped);
        }
        self.commands.push(WorkerCommand::Audio(chunk));
        Ok(())
    }

    fn read_text(&self) -> Result<String, RecognizerError> {
        self.transcripts.pop()
    }

    fn on_interim(&self, callback: InterimCallback) {
        *self.interim.write() = Some(callback);
    }

    fn abort(&self) {
        self.transcripts.abort();
        self.commands.discard_audio();
        self.commands.push(WorkerCommand::Abort);
    }

    fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.commands.push(WorkerCommand::Stop);
        self.transcripts.stop();
        info!("embedded recognizer stopped");
    }
}

impl Drop for EmbeddedRecognizer {
    fn drop(&mut self) {
        self.stop();
        // The worker exits on the queued Stop; join only when it already
        // has, to keep drop from blocking on a slow engine.
        if let Some(handle) = self.worker.lock().take() {
            if handle.is_finished() {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    /// Engine whose `process` pops scripted outcomes in order.
    struct ScriptedEngine {
        script: VecDeque<Result<Vec<EngineEvent>, EngineError>>,
        fail_load: bool,
        loaded: Arc<AtomicBool>,
        resets: Arc<AtomicUsize>,
        unloaded: Arc<AtomicBool>,
    }

    impl ScriptedEngine {
        fn new(script: Vec<Result<Vec<EngineEvent>, EngineError>>) -> Self {
            Self {
                script: script.into(),
                fail_load: false,
                loaded: Arc::new(AtomicBool::new(false)),
                resets: Arc::new(AtomicUsize::new(0)),
                unloaded: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    impl SpeechEngine for ScriptedEngine {
        fn load(&mut self, _params: &RecognizerParams) -> Result<(), EngineError> {
            if self.fail_load {
                return Err(EngineError::Load("model file missing".to_string()));
            }
            self.loaded.store(true, Ordering::Release);
            Ok(())
        }

        fn process(&mut self, _chunk: &[u8]) -> Result<Vec<EngineEvent>, EngineError> {
            self.script.pop_front().unwrap_or_else(|| Ok(Vec::new()))
        }

        fn reset(&mut self) {
            self.resets.fetch_add(1, Ordering::AcqRel);
        }

        fn unload(&mut self) {
            self.unloaded.store(true, Ordering::Release);
        }
    }

    fn wait_for(condition: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not met in time");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_start_loads_engine() {
        let engine = ScriptedEngine::new(vec![]);
        let loaded = engine.loaded.clone();

        let recognizer =
            EmbeddedRecognizer::start(Box::new(engine), &RecognizerParams::default()).unwrap();
        assert!(loaded.load(Ordering::Acquire));
        recognizer.stop();
    }

    #[test]
    fn test_load_failure_surfaces_as_engine_error() {
        let mut engine = ScriptedEngine::new(vec![]);
        engine.fail_load = true;

        let result = EmbeddedRecognizer::start(Box::new(engine), &RecognizerParams::default());
        match result {
            Err(RecognizerError::Engine(e)) => {
                assert!(e.to_string().contains("model file missing"))
            }
            other => panic!("expected engine error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_invalid_params_rejected_before_spawn() {
        let engine = ScriptedEngine::new(vec![]);
        let params = RecognizerParams {
            use_microphone: true,
            ..Default::default()
        };
        assert!(matches!(
            EmbeddedRecognizer::start(Box::new(engine), &params),
            Err(RecognizerError::Init(_))
        ));
    }

    #[test]
    fn test_final_events_reach_read_text() {
        let engine = ScriptedEngine::new(vec![Ok(vec![EngineEvent::Final("hello".to_string())])]);
        let recognizer =
            EmbeddedRecognizer::start(Box::new(engine), &RecognizerParams::default()).unwrap();

        recognizer
            .feed_audio(Bytes::from_static(&[0u8; 1600]), None)
            .unwrap();
        assert_eq!(recognizer.read_text().unwrap(), "hello");
        recognizer.stop();
    }

    #[test]
    fn test_interim_events_reach_callback() {
        let engine = ScriptedEngine::new(vec![Ok(vec![
            EngineEvent::Interim("hel".to_string()),
            EngineEvent::Final("hello".to_string()),
        ])]);
        let recognizer =
            EmbeddedRecognizer::start(Box::new(engine), &RecognizerParams::default()).unwrap();

        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        recognizer.on_interim(Arc::new(move |text| sink.lock().push(text.to_string())));

        recognizer
            .feed_audio(Bytes::from_static(&[0u8; 1600]), None)
            .unwrap();
        assert_eq!(recognizer.read_text().unwrap(), "hello");
        wait_for(|| seen.lock().len() == 1);
        assert_eq!(seen.lock()[0], "hel");
        recognizer.stop();
    }

    #[test]
    fn test_process_failure_becomes_transient_read_error() {
        let engine = ScriptedEngine::new(vec![
            Err(EngineError::Process("decoder hiccup".to_string())),
            Ok(vec![EngineEvent::Final("recovered".to_string())]),
        ]);
        let recognizer =
            EmbeddedRecognizer::start(Box::new(engine), &RecognizerParams::default()).unwrap();

        recognizer
            .feed_audio(Bytes::from_static(&[0u8; 1600]), None)
            .unwrap();
        recognizer
            .feed_audio(Bytes::from_static(&[0u8; 1600]), None)
            .unwrap();

        assert!(matches!(
            recognizer.read_text(),
            Err(RecognizerError::Transient(_))
        ));
        assert_eq!(recognizer.read_text().unwrap(), "recovered");
        recognizer.stop();
    }

    #[test]
    fn test_abort_resets_engine_and_discards_results() {
        let engine = ScriptedEngine::new(vec![Ok(vec![EngineEvent::Final("stale".to_string())])]);
        let resets = engine.resets.clone();
        let recognizer =
            EmbeddedRecognizer::start(Box::new(engine), &RecognizerParams::default()).unwrap();

        recognizer
            .feed_audio(Bytes::from_static(&[0u8; 1600]), None)
            .unwrap();
        // Let the stale final land before aborting.
        thread::sleep(Duration::from_millis(50));
        recognizer.abort();
        wait_for(|| resets.load(Ordering::Acquire) == 1);

        // The stale final was discarded; the queue blocks until stop.
        recognizer.stop();
        assert!(matches!(
            recognizer.read_text(),
            Err(RecognizerError::Stopped)
        ));
    }

    #[test]
    fn test_stop_unloads_engine_and_parks_reads() {
        let engine = ScriptedEngine::new(vec![]);
        let unloaded = engine.unloaded.clone();
        let recognizer =
            EmbeddedRecognizer::start(Box::new(engine), &RecognizerParams::default()).unwrap();

        recognizer.stop();
        recognizer.stop();
        wait_for(|| unloaded.load(Ordering::Acquire));

        assert!(matches!(
            recognizer.read_text(),
            Err(RecognizerError::Stopped)
        ));
        assert!(matches!(
            recognizer.feed_audio(Bytes::from_static(&[0u8; 4]), None),
            Err(RecognizerError::Stopped)
        ));
    }
}
