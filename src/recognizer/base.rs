//! Core recognizer abstraction shared by the embedded and remote variants.
//!
//! A recognizer accepts audio from the asynchronous ingest side and hands
//! completed utterances to blocking readers. The two sides run in different
//! concurrency domains, so every method here must be callable from both
//! async tasks and plain threads without blocking the caller (except
//! `read_text`, whose whole point is to block).

use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::audio::AudioFormat;

/// Errors surfaced by recognizer backends.
#[derive(Debug, Error)]
pub enum RecognizerError {
    /// Backend construction or connection failed. Surfaced to the caller
    /// that triggered initialization.
    #[error("backend initialization failed: {0}")]
    Init(String),

    /// The in-process speech engine reported a failure.
    #[error("speech engine error: {0}")]
    Engine(#[from] EngineError),

    /// The transport to a remote backend failed or was closed.
    #[error("transport failure: {0}")]
    Transport(String),

    /// A single recognition attempt failed; later attempts may succeed.
    #[error("transient recognition failure: {0}")]
    Transient(String),

    /// A blocking read was cancelled by `abort`.
    #[error("recognition read interrupted")]
    Interrupted,

    /// The backend has been stopped and released its resources.
    #[error("recognizer stopped")]
    Stopped,
}

/// Errors reported by an in-process speech engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("model load failed: {0}")]
    Load(String),
    #[error("audio processing failed: {0}")]
    Process(String),
}

/// Callback invoked with partial transcription text while an utterance is
/// still in progress. Only active when realtime transcription is enabled.
pub type InterimCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Quantization applied to recognition models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputeType {
    Int8,
    Int8Float16,
    Float16,
    Float32,
}

impl std::fmt::Display for ComputeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ComputeType::Int8 => write!(f, "int8"),
            ComputeType::Int8Float16 => write!(f, "int8_float16"),
            ComputeType::Float16 => write!(f, "float16"),
            ComputeType::Float32 => write!(f, "float32"),
        }
    }
}

impl FromStr for ComputeType {
    type Err = RecognizerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "int8" => Ok(ComputeType::Int8),
            "int8_float16" => Ok(ComputeType::Int8Float16),
            "float16" => Ok(ComputeType::Float16),
            "float32" => Ok(ComputeType::Float32),
            _ => Err(RecognizerError::Init(format!(
                "Unsupported compute type: {s}. Supported types: int8, int8_float16, float16, float32"
            ))),
        }
    }
}

/// Construction parameters for recognizer backends.
///
/// Defaults mirror the reference deployment: a `large-v2` main model with a
/// `base` realtime model, int8 quantization, no microphone capture (audio
/// arrives exclusively through the stream feed), and language auto-detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecognizerParams {
    /// Main transcription model identifier.
    pub model: String,
    /// Prompt prepended to main-model transcriptions.
    pub initial_prompt: String,
    /// Smaller model used for interim transcription.
    pub realtime_model: String,
    /// Prompt prepended to interim transcriptions.
    pub realtime_initial_prompt: String,
    /// Model quantization.
    pub compute_type: ComputeType,
    /// Language tag, empty for auto-detection.
    pub language: String,
    /// Whether the backend should produce interim transcripts.
    pub enable_realtime: bool,
    /// Whether the backend may capture microphone audio directly. Always
    /// false here; audio arrives through the stream feed.
    pub use_microphone: bool,
    /// Remote variant only: ask the client to start a local server process
    /// when none is reachable. Not honored in-process.
    pub autostart_server: bool,
}

impl Default for RecognizerParams {
    fn default() -> Self {
        Self {
            model: "large-v2".to_string(),
            initial_prompt: String::new(),
            realtime_model: "base".to_string(),
            realtime_initial_prompt: String::new(),
            compute_type: ComputeType::Int8,
            language: String::new(),
            enable_realtime: false,
            use_microphone: false,
            autostart_server: false,
        }
    }
}

impl RecognizerParams {
    /// Validate invariants that hold for every backend.
    ///
    /// # Returns
    /// * `Ok(())` when the parameters are usable
    /// * `Err(RecognizerError::Init)` describing the first violation
    pub fn validate(&self) -> Result<(), RecognizerError> {
        if self.model.is_empty() {
            return Err(RecognizerError::Init(
                "model identifier must not be empty".to_string(),
            ));
        }
        if self.enable_realtime && self.realtime_model.is_empty() {
            return Err(RecognizerError::Init(
                "realtime transcription requires a realtime model".to_string(),
            ));
        }
        if self.use_microphone {
            return Err(RecognizerError::Init(
                "microphone capture is not supported; push audio through the stream".to_string(),
            ));
        }
        Ok(())
    }
}

/// Capability interface over a recognition backend.
///
/// Implementations bridge two concurrency domains: `feed_audio`, `abort` and
/// `stop` are non-blocking and safe from async tasks; `read_text` blocks the
/// calling thread and belongs on a dedicated one.
pub trait Recognizer: Send + Sync {
    /// Enqueue one chunk of PCM audio for recognition.
    ///
    /// Never blocks. Failures mean the chunk was not accepted (for example
    /// the backend already stopped); callers on the ingest path treat them
    /// as non-fatal.
    fn feed_audio(&self, chunk: Bytes, format: Option<AudioFormat>)
        -> Result<(), RecognizerError>;

    /// Block until the next completed utterance.
    ///
    /// # Returns
    /// * `Ok(text)` - the finished utterance
    /// * `Err(Interrupted)` - an `abort` cancelled the wait
    /// * `Err(Stopped)` - the backend released its resources
    /// * `Err(Transient)` / `Err(Transport)` - this attempt failed; the
    ///   caller decides whether to retry
    fn read_text(&self) -> Result<String, RecognizerError>;

    /// Register the callback invoked with interim transcription text.
    /// Replaces any previously registered callback.
    fn on_interim(&self, callback: InterimCallback);

    /// Cancel in-flight recognition: discard buffered results and promptly
    /// unblock any thread waiting in `read_text`.
    fn abort(&self);

    /// Release backend resources. Idempotent; reads after `stop` fail with
    /// `Stopped` once buffered utterances drain.
    fn stop(&self);
}
