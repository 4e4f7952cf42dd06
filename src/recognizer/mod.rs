//! Recognition backends behind the [`Recognizer`] capability interface.
//!
//! Two variants ship here: [`embedded::EmbeddedRecognizer`] hosts a speech
//! engine on a worker thread inside this process, and
//! [`remote::RemoteRecognizer`] speaks to a recognition server over
//! WebSocket. Both expose the same contract: non-blocking audio feed,
//! blocking utterance reads, a registrable interim callback, and
//! `abort`/`stop` lifecycle controls.

mod base;
pub mod embedded;
pub(crate) mod queue;
pub mod remote;

pub use base::{
    ComputeType, EngineError, InterimCallback, Recognizer, RecognizerError, RecognizerParams,
};
pub use embedded::{EmbeddedRecognizer, EngineEvent, SpeechEngine};
pub use remote::RemoteRecognizer;
