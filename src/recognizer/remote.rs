//! Remote recognizer variant: a WebSocket client to a recognition server.
//!
//! The server contract is small: binary frames carry a 4-byte little-endian
//! metadata length, a JSON metadata object (currently just the sample rate)
//! and the raw PCM chunk; text frames carry JSON commands upstream and
//! `realtime` / `fullSentence` / `error` messages downstream. A single
//! connection task owns the socket and bridges it to the same blocking
//! transcript queue the embedded variant uses.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::{BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use url::Url;

use super::base::{InterimCallback, Recognizer, RecognizerError, RecognizerParams};
use super::queue::TranscriptQueue;
use crate::audio::{AudioFormat, SAMPLE_RATE};

/// Message received from the recognition server.
#[derive(Debug, Deserialize)]
struct ServerMessage {
    #[serde(rename = "type")]
    message_type: String,
    text: Option<String>,
    message: Option<String>,
}

/// Recognizer backed by a recognition server over WebSocket.
pub struct RemoteRecognizer {
    /// Outbound messages for the connection task.
    ws_sender: mpsc::UnboundedSender<Message>,
    /// Shutdown signal for the connection task.
    shutdown_tx: broadcast::Sender<()>,
    transcripts: Arc<TranscriptQueue>,
    interim: Arc<RwLock<Option<InterimCallback>>>,
    /// Sample rate advertised in audio metadata when the caller gives no
    /// format hint.
    sample_rate: u32,
    stopped: AtomicBool,
}

impl RemoteRecognizer {
    /// Connect to the recognition server and start the connection task.
    ///
    /// # Arguments
    /// * `endpoint` - WebSocket URL of the server (`ws://` or `wss://`)
    /// * `params` - Session parameters; language and realtime enablement are
    ///   sent to the server before any audio
    ///
    /// # Returns
    /// * `Err(RecognizerError::Init)` when the URL is invalid or the
    ///   connection cannot be established
    pub async fn connect(
        endpoint: &str,
        params: &RecognizerParams,
    ) -> Result<Self, RecognizerError> {
        params.validate()?;
        if params.autostart_server {
            warn!("autostart_server is not honored in-process; expecting a reachable server");
        }

        let url = Url::parse(endpoint).map_err(|e| {
            RecognizerError::Init(format!("invalid recognition server URL {endpoint}: {e}"))
        })?;

        let (ws_stream, _) = connect_async(url.as_str()).await.map_err(|e| {
            RecognizerError::Init(format!(
                "failed to connect to recognition server at {endpoint}: {e}"
            ))
        })?;
        info!(endpoint, "connected to recognition server");

        let (ws_tx, mut ws_rx) = mpsc::unbounded_channel::<Message>();
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);
        let transcripts = Arc::new(TranscriptQueue::new());
        let interim: Arc<RwLock<Option<InterimCallback>>> = Arc::new(RwLock::new(None));

        // Configure the session before any audio goes out; queued commands
        // are drained in order by the connection task.
        if !params.language.is_empty() {
            let _ = ws_tx.send(set_parameter_message(
                "language",
                json!(params.language.clone()),
            ));
        }
        let _ = ws_tx.send(set_parameter_message(
            "enable_realtime_transcription",
            json!(params.enable_realtime),
        ));
        if params.enable_realtime {
            let _ = ws_tx.send(set_parameter_message(
                "realtime_model_type",
                json!(params.realtime_model.clone()),
            ));
        }

        let task_transcripts = transcripts.clone();
        let task_interim = interim.clone();
        tokio::spawn(async move {
            let (mut ws_sink, mut ws_stream) = ws_stream.split();
            loop {
                tokio::select! {
                    Some(message) = ws_rx.recv() => {
                        if let Err(e) = ws_sink.send(message).await {
                            error!("failed to send to recognition server: {e}");
                            task_transcripts.poison(format!("send failed: {e}"));
                            break;
                        }
                    }

                    message = ws_stream.next() => {
                        match message {
                            Some(Ok(Message::Text(text))) => {
                                handle_server_message(text.as_str(), &task_transcripts, &task_interim);
                            }
                            Some(Ok(Message::Ping(payload))) => {
                                let _ = ws_sink.send(Message::Pong(payload)).await;
                            }
                            Some(Ok(Message::Close(_))) => {
                                info!("recognition server closed the connection");
                                task_transcripts.poison("server closed the connection".to_string());
                                break;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                error!("recognition server connection error: {e}");
                                task_transcripts.poison(format!("connection error: {e}"));
                                break;
                            }
                            None => {
                                info!("recognition server stream ended");
                                task_transcripts.poison("connection closed".to_string());
                                break;
                            }
                        }
                    }

                    _ = shutdown_rx.recv() => {
                        let _ = ws_sink.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            debug!("recognition server connection task finished");
        });

        Ok(Self {
            ws_sender: ws_tx,
            shutdown_tx,
            transcripts,
            interim,
            sample_rate: SAMPLE_RATE,
            stopped: AtomicBool::new(false),
        })
    }
}

/// Route one text message from the server.
fn handle_server_message(
    text: &str,
    transcripts: &TranscriptQueue,
    interim: &RwLock<Option<InterimCallback>>,
) {
    let parsed: ServerMessage = match serde_json::from_str(text) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!("unparseable message from recognition server: {e}");
            return;
        }
    };

    match parsed.message_type.as_str() {
        "realtime" => {
            if let Some(text) = parsed.text {
                let callback = interim.read().clone();
                if let Some(callback) = callback {
                    callback(&text);
                }
            }
        }
        "fullSentence" => {
            if let Some(text) = parsed.text {
                transcripts.push_text(text);
            }
        }
        "error" => {
            let message = parsed
                .message
                .unwrap_or_else(|| "unspecified server error".to_string());
            warn!("recognition server reported an error: {message}");
            transcripts.push_failure(message);
        }
        other => debug!(message_type = other, "ignoring message from recognition server"),
    }
}

/// Binary audio frame: metadata length (LE u32), JSON metadata, PCM payload.
fn audio_message(chunk: &[u8], sample_rate: u32) -> Message {
    let metadata = json!({ "sampleRate": sample_rate }).to_string();
    let mut frame = BytesMut::with_capacity(4 + metadata.len() + chunk.len());
    frame.put_u32_le(metadata.len() as u32);
    frame.put_slice(metadata.as_bytes());
    frame.put_slice(chunk);
    Message::Binary(frame.freeze())
}

fn call_method_message(method: &str) -> Message {
    Message::Text(
        json!({ "command": "call_method", "method": method })
            .to_string()
            .into(),
    )
}

fn set_parameter_message(parameter: &str, value: serde_json::Value) -> Message {
    Message::Text(
        json!({ "command": "set_parameter", "parameter": parameter, "value": value })
            .to_string()
            .into(),
    )
}

impl Recognizer for RemoteRecognizer {
    fn feed_audio(&self, chunk: Bytes, format: Option<AudioFormat>) -> Result<(), RecognizerError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(RecognizerError::Stopped);
        }
        let sample_rate = format.map_or(self.sample_rate, |f| f.sample_rate);
        self.ws_sender
            .send(audio_message(&chunk, sample_rate))
            .map_err(|_| RecognizerError::Transport("connection task is gone".to_string()))
    }

    fn read_text(&self) -> Result<String, RecognizerError> {
        self.transcripts.pop()
    }

    fn on_interim(&self, callback: InterimCallback) {
        *self.interim.write() = Some(callback);
    }

    fn abort(&self) {
        let _ = self.ws_sender.send(call_method_message("abort"));
        self.transcripts.abort();
    }

    fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        // Best effort: ask the server to stop, then take the connection down.
        let _ = self.ws_sender.send(call_method_message("stop"));
        let _ = self.shutdown_tx.send(());
        self.transcripts.stop();
        info!("remote recognizer stopped");
    }
}

impl Drop for RemoteRecognizer {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}
