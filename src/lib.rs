pub mod audio;
pub mod events;
pub mod recognizer;
pub mod stream;
pub mod stt;

// Re-export commonly used items for convenience
pub use audio::{
    AudioChunker, AudioFormat, AudioFrame, BITS_PER_SAMPLE, CHUNK_DURATION_MS, NUM_CHANNELS,
    SAMPLE_RATE,
};
pub use events::{SpeechEvent, TranscriptData};
pub use recognizer::{
    ComputeType, EmbeddedRecognizer, EngineError, EngineEvent, InterimCallback, Recognizer,
    RecognizerError, RecognizerParams, RemoteRecognizer, SpeechEngine,
};
pub use stream::SpeechStream;
pub use stt::{RecognizerBackend, Stt, SttCapabilities, SttError, SttOptions, SttResult};
