//! Speech-to-text service.
//!
//! An [`Stt`] owns one recognizer backend and every stream opened against
//! it. The backend is initialized lazily by the first `stream()` or
//! `prewarm()` call and reused afterwards; streams register themselves in a
//! weak registry so the service can fan out option updates and close them
//! all without keeping dropped handles alive.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::audio::AudioFrame;
use crate::events::SpeechEvent;
use crate::recognizer::{
    EmbeddedRecognizer, Recognizer, RecognizerError, RecognizerParams, RemoteRecognizer,
    SpeechEngine,
};
use crate::stream::{SpeechStream, StreamRegistry};

/// Errors surfaced by the service API.
#[derive(Debug, Error)]
pub enum SttError {
    /// Batch recognition is not offered by this service; use a stream.
    #[error("non-streaming speech-to-text is not supported")]
    NonStreamingUnsupported,

    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),

    /// The stream no longer accepts audio.
    #[error("stream input closed")]
    InputClosed,
}

pub type SttResult<T> = Result<T, SttError>;

/// Service options. Only the language default is mutable after
/// construction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SttOptions {
    /// Default language tag for new streams; empty for auto-detection.
    pub language: String,
    /// Whether streams emit interim transcripts.
    pub realtime: bool,
}

/// What this service supports, derived from its options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SttCapabilities {
    pub streaming: bool,
    pub interim_results: bool,
}

/// Recognizer backend, initialized on first use.
pub enum RecognizerBackend {
    /// In-process speech engine. The engine instance is handed to its
    /// worker thread on first initialization and cannot be reused after a
    /// failed load.
    Embedded { engine: Box<dyn SpeechEngine> },
    /// Recognition server reachable over WebSocket.
    Remote { endpoint: String },
}

struct BackendSlot {
    source: Option<RecognizerBackend>,
    recognizer: Option<Arc<dyn Recognizer>>,
}

/// Speech-to-text service bridging pushed audio to speech events.
pub struct Stt {
    options: RwLock<SttOptions>,
    params: RecognizerParams,
    backend: Mutex<BackendSlot>,
    registry: Arc<StreamRegistry>,
}

impl Stt {
    pub fn new(backend: RecognizerBackend, options: SttOptions) -> Self {
        Self::with_params(backend, options, RecognizerParams::default())
    }

    /// Service with explicit backend parameters.
    ///
    /// The service options always win where they overlap: realtime
    /// enablement and the language default are taken from `options` when
    /// the backend is initialized.
    pub fn with_params(
        backend: RecognizerBackend,
        options: SttOptions,
        params: RecognizerParams,
    ) -> Self {
        Self {
            options: RwLock::new(options),
            params,
            backend: Mutex::new(BackendSlot {
                source: Some(backend),
                recognizer: None,
            }),
            registry: Arc::new(StreamRegistry::default()),
        }
    }

    /// Service over an in-process engine.
    pub fn embedded(engine: Box<dyn SpeechEngine>, options: SttOptions) -> Self {
        Self::new(RecognizerBackend::Embedded { engine }, options)
    }

    /// Service over a recognition server.
    pub fn remote(endpoint: impl Into<String>, options: SttOptions) -> Self {
        Self::new(
            RecognizerBackend::Remote {
                endpoint: endpoint.into(),
            },
            options,
        )
    }

    pub fn capabilities(&self) -> SttCapabilities {
        SttCapabilities {
            streaming: true,
            interim_results: self.options.read().realtime,
        }
    }

    pub fn options(&self) -> SttOptions {
        self.options.read().clone()
    }

    /// Initialize the backend eagerly instead of on the first stream.
    pub async fn prewarm(&self) -> SttResult<()> {
        self.ensure_recognizer().await.map(|_| ())
    }

    /// Open a new speech stream.
    ///
    /// Initializes the backend if this is the first stream. On
    /// initialization failure the error propagates and nothing is
    /// registered.
    ///
    /// # Arguments
    /// * `language` - Overrides the service's default language for this
    ///   stream only
    pub async fn stream(&self, language: Option<String>) -> SttResult<SpeechStream> {
        let recognizer = self.ensure_recognizer().await?;
        let options = self.options.read().clone();
        let language = language.unwrap_or(options.language);
        Ok(SpeechStream::spawn(
            recognizer,
            self.registry.clone(),
            language,
            options.realtime,
        ))
    }

    /// Batch recognition entry point. Always fails: these backends only
    /// transcribe continuous streams.
    pub fn recognize(
        &self,
        _frames: &[AudioFrame],
        _language: Option<String>,
    ) -> SttResult<SpeechEvent> {
        Err(SttError::NonStreamingUnsupported)
    }

    /// Update the default language for future streams and forward it to
    /// every live stream. `None` leaves everything unchanged.
    pub fn update_options(&self, language: Option<String>) {
        if let Some(language) = language {
            self.options.write().language = language.clone();
            let live = self.registry.live();
            let streams = live.len();
            for shared in live {
                shared.set_language(language.clone());
            }
            debug!(language = %language, streams, "updated language");
        }
    }

    /// Close every registered stream and release the backend.
    ///
    /// Streams whose handles were already dropped are skipped silently; a
    /// backend that was never initialized is left untouched.
    pub async fn close(&self) -> SttResult<()> {
        let streams = self.registry.drain();
        if !streams.is_empty() {
            info!(count = streams.len(), "closing registered streams");
        }
        for shared in &streams {
            shared.begin_close();
        }

        let slot = self.backend.lock().await;
        if let Some(recognizer) = slot.recognizer.as_ref() {
            recognizer.abort();
            recognizer.stop();
        }
        info!("speech service closed");
        Ok(())
    }

    /// Return the recognizer, initializing it on first call. Serialized by
    /// the backend lock so concurrent first streams initialize exactly once.
    async fn ensure_recognizer(&self) -> Result<Arc<dyn Recognizer>, SttError> {
        let mut slot = self.backend.lock().await;
        if let Some(recognizer) = slot.recognizer.as_ref() {
            return Ok(recognizer.clone());
        }

        let backend = slot.source.take().ok_or_else(|| {
            RecognizerError::Init("backend was consumed by a failed initialization".to_string())
        })?;

        let mut params = self.params.clone();
        {
            let options = self.options.read();
            params.enable_realtime = options.realtime;
            params.language = options.language.clone();
        }

        let recognizer: Arc<dyn Recognizer> = match backend {
            RecognizerBackend::Embedded { engine } => {
                // Engine loading can take seconds; keep it off the
                // executor.
                let load_params = params.clone();
                let started = tokio::task::spawn_blocking(move || {
                    EmbeddedRecognizer::start(engine, &load_params)
                })
                .await
                .map_err(|e| {
                    RecognizerError::Init(format!("engine startup task failed: {e}"))
                })??;
                Arc::new(started)
            }
            RecognizerBackend::Remote { endpoint } => {
                match RemoteRecognizer::connect(&endpoint, &params).await {
                    Ok(recognizer) => Arc::new(recognizer) as Arc<dyn Recognizer>,
                    Err(e) => {
                        // Connection failures are retryable; keep the
                        // endpoint for the next attempt.
                        slot.source = Some(RecognizerBackend::Remote { endpoint });
                        return Err(e.into());
                    }
                }
            }
        };

        // Fan interim text out to every live stream; each stream applies
        // its own realtime gate.
        let registry = self.registry.clone();
        recognizer.on_interim(Arc::new(move |text| {
            for shared in registry.live() {
                shared.interim_transcript(text);
            }
        }));

        slot.recognizer = Some(recognizer.clone());
        Ok(recognizer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recognizer::{EngineError, EngineEvent};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Engine that counts lifecycle calls and emits one final per chunk.
    struct CountingEngine {
        loads: Arc<AtomicUsize>,
        fail_load: Arc<AtomicBool>,
        chunks: Arc<AtomicUsize>,
    }

    impl CountingEngine {
        fn new() -> (Self, Arc<AtomicUsize>, Arc<AtomicUsize>) {
            let loads = Arc::new(AtomicUsize::new(0));
            let chunks = Arc::new(AtomicUsize::new(0));
            (
                Self {
                    loads: loads.clone(),
                    fail_load: Arc::new(AtomicBool::new(false)),
                    chunks: chunks.clone(),
                },
                loads,
                chunks,
            )
        }
    }

    impl SpeechEngine for CountingEngine {
        fn load(&mut self, _params: &RecognizerParams) -> Result<(), EngineError> {
            self.loads.fetch_add(1, Ordering::AcqRel);
            if self.fail_load.load(Ordering::Acquire) {
                return Err(EngineError::Load("no model".to_string()));
            }
            Ok(())
        }

        fn process(&mut self, _chunk: &[u8]) -> Result<Vec<EngineEvent>, EngineError> {
            let n = self.chunks.fetch_add(1, Ordering::AcqRel);
            Ok(vec![EngineEvent::Final(format!("utterance {n}"))])
        }

        fn reset(&mut self) {}
        fn unload(&mut self) {}
    }

    #[test]
    fn test_capabilities_follow_realtime_option() {
        let (engine, _, _) = CountingEngine::new();
        let stt = Stt::embedded(
            Box::new(engine),
            SttOptions {
                realtime: true,
                ..Default::default()
            },
        );
        assert_eq!(
            stt.capabilities(),
            SttCapabilities {
                streaming: true,
                interim_results: true,
            }
        );

        let (engine, _, _) = CountingEngine::new();
        let stt = Stt::embedded(Box::new(engine), SttOptions::default());
        assert!(!stt.capabilities().interim_results);
        assert!(stt.capabilities().streaming);
    }

    #[tokio::test]
    async fn test_recognize_fails_without_touching_backend() {
        let (engine, loads, _) = CountingEngine::new();
        let stt = Stt::embedded(Box::new(engine), SttOptions::default());

        let frames = vec![AudioFrame::linear16(vec![0u8; 1600])];
        assert!(matches!(
            stt.recognize(&frames, None),
            Err(SttError::NonStreamingUnsupported)
        ));
        assert_eq!(loads.load(Ordering::Acquire), 0);
    }

    #[tokio::test]
    async fn test_backend_initialized_once_across_streams() {
        let (engine, loads, _) = CountingEngine::new();
        let stt = Stt::embedded(Box::new(engine), SttOptions::default());
        assert_eq!(loads.load(Ordering::Acquire), 0);

        let mut first = stt.stream(None).await.unwrap();
        let mut second = stt.stream(None).await.unwrap();
        assert_eq!(loads.load(Ordering::Acquire), 1);

        first.close().await;
        second.close().await;
        stt.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_prewarm_initializes_backend() {
        let (engine, loads, _) = CountingEngine::new();
        let stt = Stt::embedded(Box::new(engine), SttOptions::default());

        stt.prewarm().await.unwrap();
        assert_eq!(loads.load(Ordering::Acquire), 1);

        stt.prewarm().await.unwrap();
        assert_eq!(loads.load(Ordering::Acquire), 1);
        stt.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_init_propagates_and_registers_nothing() {
        let (engine, _, _) = CountingEngine::new();
        engine.fail_load.store(true, Ordering::Release);
        let stt = Stt::embedded(Box::new(engine), SttOptions::default());

        assert!(matches!(
            stt.stream(None).await,
            Err(SttError::Recognizer(RecognizerError::Engine(_)))
        ));
        assert!(stt.registry.live().is_empty());

        // The engine was consumed by the failed load.
        match stt.stream(None).await {
            Err(SttError::Recognizer(RecognizerError::Init(message))) => {
                assert!(message.contains("consumed"));
            }
            other => panic!("expected init error, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_close_without_initialization_is_a_no_op() {
        let (engine, loads, _) = CountingEngine::new();
        let stt = Stt::embedded(Box::new(engine), SttOptions::default());

        stt.close().await.unwrap();
        assert_eq!(loads.load(Ordering::Acquire), 0);
    }

    #[tokio::test]
    async fn test_update_options_applies_to_new_and_live_streams() {
        let (engine, _, _) = CountingEngine::new();
        let stt = Stt::embedded(
            Box::new(engine),
            SttOptions {
                language: "en".to_string(),
                realtime: false,
            },
        );

        let mut live = stt.stream(None).await.unwrap();
        stt.update_options(Some("de".to_string()));
        assert_eq!(stt.options().language, "de");

        // The live stream tags its next final with the new language.
        live.push_frame(AudioFrame::linear16(vec![0u8; 1600])).unwrap();
        let start = live.next_event().await.unwrap();
        assert_eq!(start, SpeechEvent::StartOfSpeech);
        let event = live.next_event().await.unwrap();
        assert_eq!(event.transcript().unwrap().language, "de");
        live.close().await;

        // New streams pick up the new default.
        let mut fresh = stt.stream(None).await.unwrap();
        fresh.push_frame(AudioFrame::linear16(vec![0u8; 1600])).unwrap();
        fresh.next_event().await.unwrap();
        let event = fresh.next_event().await.unwrap();
        assert_eq!(event.transcript().unwrap().language, "de");

        fresh.close().await;
        stt.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_stream_language_override_is_per_stream() {
        let (engine, _, _) = CountingEngine::new();
        let stt = Stt::embedded(
            Box::new(engine),
            SttOptions {
                language: "en".to_string(),
                realtime: false,
            },
        );

        let mut stream = stt.stream(Some("fr".to_string())).await.unwrap();
        stream.push_frame(AudioFrame::linear16(vec![0u8; 1600])).unwrap();
        stream.next_event().await.unwrap();
        let event = stream.next_event().await.unwrap();
        assert_eq!(event.transcript().unwrap().language, "fr");

        // The default is untouched.
        assert_eq!(stt.options().language, "en");

        stream.close().await;
        stt.close().await.unwrap();
    }
}
