//! Per-session speech stream.
//!
//! A [`SpeechStream`] bridges two concurrency domains. On the async side an
//! ingest task chunks pushed frames and feeds the recognizer without ever
//! blocking the producer. On a dedicated thread a transcript loop performs
//! the backend's blocking reads and hands completed utterances to the event
//! emitter, which maintains the idle/speaking state machine and guarantees
//! that a start-of-speech marker precedes every utterance's transcripts.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::thread;
use std::time::Duration;

use futures::Stream;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::audio::{AudioChunker, AudioFormat, AudioFrame};
use crate::events::{SpeechEvent, TranscriptData};
use crate::recognizer::{Recognizer, RecognizerError};
use crate::stt::SttError;

/// Bound on waiting for the transcript thread during close.
const READ_JOIN_TIMEOUT: Duration = Duration::from_secs(5);
/// Pause between retries after a failed transcript read.
const READ_RETRY_DELAY: Duration = Duration::from_millis(100);
/// Consecutive read failures before a warning is logged.
const READ_FAILURE_WARN_THRESHOLD: u32 = 10;

/// Items travelling from the stream handle to the ingest task.
enum StreamItem {
    Frame(AudioFrame),
    Flush,
}

/// State shared between the stream handle, its background workers, and the
/// owning service.
pub(crate) struct StreamShared {
    event_tx: mpsc::UnboundedSender<SpeechEvent>,
    /// True between a start-of-speech and the final that ends the
    /// utterance. Held while emitting so the marker and its transcript
    /// cannot interleave with other emissions.
    speaking: Mutex<bool>,
    language: RwLock<String>,
    interim_enabled: bool,
    recording: AtomicBool,
    closing: AtomicBool,
}

impl StreamShared {
    fn new(
        event_tx: mpsc::UnboundedSender<SpeechEvent>,
        language: String,
        interim_enabled: bool,
    ) -> Self {
        Self {
            event_tx,
            speaking: Mutex::new(false),
            language: RwLock::new(language),
            interim_enabled,
            recording: AtomicBool::new(true),
            closing: AtomicBool::new(false),
        }
    }

    /// Replace the language tag carried by subsequently emitted events.
    pub(crate) fn set_language(&self, language: String) {
        *self.language.write() = language;
    }

    fn transcript(&self, text: &str) -> TranscriptData {
        TranscriptData::new(text, self.language.read().clone())
    }

    /// Emit an interim transcript, inserting a start-of-speech marker when
    /// the stream was idle. Ignored unless realtime transcription is on.
    pub(crate) fn interim_transcript(&self, text: &str) {
        if !self.interim_enabled || text.is_empty() || self.is_closing() {
            return;
        }
        let mut speaking = self.speaking.lock();
        if !*speaking {
            *speaking = true;
            let _ = self.event_tx.send(SpeechEvent::StartOfSpeech);
        }
        let _ = self
            .event_tx
            .send(SpeechEvent::InterimTranscript(self.transcript(text)));
    }

    /// Emit a final transcript and return the stream to idle. A final
    /// arriving while idle still opens the utterance with a marker first.
    pub(crate) fn final_transcript(&self, text: &str) {
        if self.is_closing() {
            return;
        }
        let mut speaking = self.speaking.lock();
        if !*speaking {
            let _ = self.event_tx.send(SpeechEvent::StartOfSpeech);
        }
        *speaking = false;
        let _ = self
            .event_tx
            .send(SpeechEvent::FinalTranscript(self.transcript(text)));
    }

    /// Stop recording and silence the emitter. Safe to call repeatedly.
    pub(crate) fn begin_close(&self) {
        self.closing.store(true, Ordering::Release);
        self.recording.store(false, Ordering::Release);
    }

    fn recording(&self) -> bool {
        self.recording.load(Ordering::Acquire)
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    fn reset_speaking(&self) {
        *self.speaking.lock() = false;
    }
}

/// Registry of live streams, keyed by stream id.
///
/// Holds weak references so a dropped stream handle never keeps its shared
/// state alive; dead entries are pruned whenever the registry is walked.
#[derive(Default)]
pub(crate) struct StreamRegistry {
    streams: RwLock<HashMap<u64, Weak<StreamShared>>>,
    next_id: AtomicU64,
}

impl StreamRegistry {
    pub(crate) fn register(&self, shared: &Arc<StreamShared>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.streams.write().insert(id, Arc::downgrade(shared));
        id
    }

    pub(crate) fn deregister(&self, id: u64) {
        self.streams.write().remove(&id);
    }

    /// Upgrade every registered stream, pruning the dead ones.
    pub(crate) fn live(&self) -> Vec<Arc<StreamShared>> {
        let mut live = Vec::new();
        self.streams.write().retain(|_, weak| match weak.upgrade() {
            Some(shared) => {
                live.push(shared);
                true
            }
            None => false,
        });
        live
    }

    /// Empty the registry, returning the streams that were still alive.
    pub(crate) fn drain(&self) -> Vec<Arc<StreamShared>> {
        self.streams
            .write()
            .drain()
            .filter_map(|(_, weak)| weak.upgrade())
            .collect()
    }
}

/// Handle to one logical audio session.
///
/// Obtained from [`crate::Stt::stream`]. Push frames in, consume speech
/// events out; `close` tears both sides down in order.
pub struct SpeechStream {
    id: u64,
    input_tx: Option<mpsc::UnboundedSender<StreamItem>>,
    event_rx: mpsc::UnboundedReceiver<SpeechEvent>,
    shared: Arc<StreamShared>,
    recognizer: Arc<dyn Recognizer>,
    registry: Arc<StreamRegistry>,
    ingest_handle: Option<tokio::task::JoinHandle<()>>,
    read_handle: Option<thread::JoinHandle<()>>,
    closed: bool,
}

impl SpeechStream {
    /// Spawn the ingest task and transcript thread for a new stream and
    /// register it with the owning service.
    pub(crate) fn spawn(
        recognizer: Arc<dyn Recognizer>,
        registry: Arc<StreamRegistry>,
        language: String,
        interim_enabled: bool,
    ) -> Self {
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(StreamShared::new(event_tx, language, interim_enabled));
        let id = registry.register(&shared);

        let ingest_handle = tokio::spawn(run_ingest(input_rx, recognizer.clone(), shared.clone()));

        let thread_recognizer = recognizer.clone();
        let thread_shared = shared.clone();
        let read_handle =
            thread::spawn(move || run_transcript_loop(thread_recognizer, thread_shared));

        debug!(stream_id = id, "speech stream opened");

        Self {
            id,
            input_tx: Some(input_tx),
            event_rx,
            shared,
            recognizer,
            registry,
            ingest_handle: Some(ingest_handle),
            read_handle: Some(read_handle),
            closed: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Queue one audio frame for recognition. Never blocks.
    pub fn push_frame(&mut self, frame: AudioFrame) -> Result<(), SttError> {
        let sender = self.input_tx.as_ref().ok_or(SttError::InputClosed)?;
        sender
            .send(StreamItem::Frame(frame))
            .map_err(|_| SttError::InputClosed)
    }

    /// Force out the buffered partial chunk, if any.
    pub fn flush(&mut self) -> Result<(), SttError> {
        let sender = self.input_tx.as_ref().ok_or(SttError::InputClosed)?;
        sender
            .send(StreamItem::Flush)
            .map_err(|_| SttError::InputClosed)
    }

    /// Signal that no more audio will be pushed. Recognition of already
    /// queued audio continues; events keep flowing until `close`.
    pub fn end_input(&mut self) {
        self.input_tx = None;
    }

    /// Next speech event, or `None` once the stream is closed and drained.
    pub async fn next_event(&mut self) -> Option<SpeechEvent> {
        self.event_rx.recv().await
    }

    /// Replace the language tag on subsequently emitted events.
    pub fn update_options(&self, language: Option<String>) {
        if let Some(language) = language {
            self.shared.set_language(language);
        }
    }

    /// Close the stream: deregister it, stop both workers, and silence the
    /// event channel. Idempotent.
    ///
    /// The transcript thread may be parked inside the backend's blocking
    /// read; `abort` unblocks it, and the join is bounded so a wedged
    /// backend cannot hang the caller.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        self.registry.deregister(self.id);
        self.shared.begin_close();
        self.input_tx = None;

        // The recording flag alone cannot unblock a read already parked in
        // the backend.
        self.recognizer.abort();

        if let Some(handle) = self.read_handle.take() {
            let join = tokio::task::spawn_blocking(move || handle.join());
            if timeout(READ_JOIN_TIMEOUT, join).await.is_err() {
                warn!(
                    stream_id = self.id,
                    "transcript thread did not finish within the close timeout"
                );
            }
        }
        if let Some(handle) = self.ingest_handle.take() {
            let _ = handle.await;
        }

        self.shared.reset_speaking();
        self.event_rx.close();
        while self.event_rx.try_recv().is_ok() {}

        debug!(stream_id = self.id, "speech stream closed");
    }
}

impl Stream for SpeechStream {
    type Item = SpeechEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().event_rx.poll_recv(cx)
    }
}

impl Drop for SpeechStream {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        self.registry.deregister(self.id);
        self.shared.begin_close();
        self.recognizer.abort();
        if let Some(handle) = self.ingest_handle.take() {
            handle.abort();
        }
        // The transcript thread exits on its own once the abort unblocks
        // it; a blocking join has no place in drop.
        let _ = self.read_handle.take();
    }
}

/// Consume pushed frames, chunk them, and feed the recognizer.
async fn run_ingest(
    mut input_rx: mpsc::UnboundedReceiver<StreamItem>,
    recognizer: Arc<dyn Recognizer>,
    shared: Arc<StreamShared>,
) {
    let format = AudioFormat::linear16();
    let mut chunker = AudioChunker::for_format(format);

    while let Some(item) = input_rx.recv().await {
        if shared.is_closing() {
            break;
        }
        match item {
            StreamItem::Frame(frame) => {
                if frame.format() != format {
                    warn!(
                        sample_rate = frame.sample_rate,
                        channels = frame.channels,
                        bits_per_sample = frame.bits_per_sample,
                        "dropping audio frame with mismatched format"
                    );
                    continue;
                }
                for chunk in chunker.write(&frame.data) {
                    if let Err(e) = recognizer.feed_audio(chunk, Some(format)) {
                        debug!("recognizer rejected audio chunk: {e}");
                    }
                }
            }
            StreamItem::Flush => {
                if let Some(chunk) = chunker.flush() {
                    if let Err(e) = recognizer.feed_audio(chunk, Some(format)) {
                        debug!("recognizer rejected flushed chunk: {e}");
                    }
                }
            }
        }
    }
    debug!("audio ingest task finished");
}

/// Blocking read loop: pull completed utterances until the stream stops
/// recording. Transient failures are retried, not surfaced.
fn run_transcript_loop(recognizer: Arc<dyn Recognizer>, shared: Arc<StreamShared>) {
    let mut consecutive_failures: u32 = 0;
    while shared.recording() {
        match recognizer.read_text() {
            Ok(text) => {
                consecutive_failures = 0;
                shared.final_transcript(&text);
            }
            // Delivered by abort; recheck the recording flag immediately.
            Err(RecognizerError::Interrupted) => continue,
            // The backend is gone for good; no further reads can succeed.
            Err(RecognizerError::Stopped) => break,
            Err(e) => {
                consecutive_failures += 1;
                if consecutive_failures == READ_FAILURE_WARN_THRESHOLD {
                    warn!(
                        failures = consecutive_failures,
                        error = %e,
                        "transcript reads keep failing"
                    );
                }
                thread::sleep(READ_RETRY_DELAY);
            }
        }
    }
    debug!("transcript thread finished");
}
