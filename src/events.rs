//! Speech events emitted by a recognition stream.
//!
//! Events form an ordered sequence per utterance: a `StartOfSpeech` marker,
//! zero or more interim transcripts, and exactly one final transcript that
//! returns the stream to the idle state.

use serde::{Deserialize, Serialize};

/// Transcript payload carried by interim and final events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptData {
    /// Recognized text. Interim text may be revised by later events;
    /// final text is stable.
    pub text: String,
    /// Language tag the stream was configured with when the event was
    /// emitted. Empty when the backend auto-detects the language.
    pub language: String,
}

impl TranscriptData {
    pub fn new(text: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            language: language.into(),
        }
    }
}

/// Event published on a stream's outbound channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum SpeechEvent {
    /// The recognizer produced text while the stream was idle; an
    /// utterance has begun.
    StartOfSpeech,
    /// Partial transcript for the in-progress utterance. Only emitted when
    /// realtime transcription is enabled.
    InterimTranscript(TranscriptData),
    /// Completed utterance. Terminates the current speech segment.
    FinalTranscript(TranscriptData),
}

impl SpeechEvent {
    /// Transcript payload for interim and final events, `None` for markers.
    pub fn transcript(&self) -> Option<&TranscriptData> {
        match self {
            SpeechEvent::StartOfSpeech => None,
            SpeechEvent::InterimTranscript(data) | SpeechEvent::FinalTranscript(data) => Some(data),
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self, SpeechEvent::FinalTranscript(_))
    }
}
