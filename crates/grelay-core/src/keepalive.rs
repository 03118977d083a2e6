//! Heartbeat pump keeping the SSE response open while a non-streaming
//! upstream call is in flight.
//!
//! All frames go through one mpsc channel, so a heartbeat can never land
//! inside another frame; ordering on the wire is the channel order.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use grelay_protocol::openai::chat::{
    CHAT_COMPLETION_CHUNK_OBJECT, ChatCompletionChunk, ChatCompletionResponse, ChunkChoice,
    ChunkDelta,
};
use grelay_protocol::openai::error::ErrorEnvelope;
use grelay_protocol::sse;

pub const HEARTBEAT_ID: &str = "keepalive";
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(3);

pub struct KeepAliveHandle {
    tx: mpsc::Sender<Bytes>,
    model: String,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
    finished: AtomicBool,
}

impl KeepAliveHandle {
    /// Begin emitting heartbeat frames on `tx`. The first frame is sent
    /// immediately, then one every [`HEARTBEAT_INTERVAL`].
    pub fn start(tx: mpsc::Sender<Bytes>, model: impl Into<String>) -> Self {
        let model = model.into();
        let heartbeat_tx = tx.clone();
        let heartbeat_model = model.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(frame) = sse::json_frame(&heartbeat_chunk(&heartbeat_model)) else {
                    break;
                };
                if heartbeat_tx.send(frame).await.is_err() {
                    // Client went away; nothing left to keep alive.
                    debug!("keepalive writer closed, stopping heartbeat");
                    break;
                }
            }
        });

        Self {
            tx,
            model,
            heartbeat: Mutex::new(Some(task)),
            finished: AtomicBool::new(false),
        }
    }

    /// Stop the heartbeat. Safe to call any number of times.
    pub fn stop(&self) {
        if let Ok(mut guard) = self.heartbeat.lock()
            && let Some(task) = guard.take()
        {
            task.abort();
        }
    }

    /// Repackage the full completion as one terminal chunk and close the
    /// stream. Later calls are no-ops.
    pub async fn send_final(&self, completion: &ChatCompletionResponse) {
        self.stop();
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }

        let choice = completion.choices.first();
        let chunk = ChatCompletionChunk {
            id: completion.id.clone(),
            object: CHAT_COMPLETION_CHUNK_OBJECT.to_string(),
            created: completion.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: ChunkDelta {
                    role: Some("assistant".to_string()),
                    content: choice.and_then(|choice| choice.message.content.clone()),
                    tool_calls: None,
                },
                finish_reason: choice.and_then(|choice| choice.finish_reason),
            }],
        };

        if let Some(frame) = sse::json_frame(&chunk) {
            let _ = self.tx.send(frame).await;
        }
        let _ = self.tx.send(sse::done_frame()).await;
    }

    /// Emit one error frame and close the stream. Later calls are no-ops.
    pub async fn send_error(&self, error: &ErrorEnvelope) {
        self.stop();
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(frame) = sse::json_frame(error) {
            let _ = self.tx.send(frame).await;
        }
        let _ = self.tx.send(sse::done_frame()).await;
    }
}

impl Drop for KeepAliveHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

fn heartbeat_chunk(model: &str) -> ChatCompletionChunk {
    ChatCompletionChunk {
        id: HEARTBEAT_ID.to_string(),
        object: CHAT_COMPLETION_CHUNK_OBJECT.to_string(),
        created: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_secs() as i64)
            .unwrap_or_default(),
        model: model.to_string(),
        choices: vec![ChunkChoice {
            index: 0,
            delta: ChunkDelta::default(),
            finish_reason: None,
        }],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grelay_protocol::openai::chat::{
        CHAT_COMPLETION_OBJECT, ChatChoice, CompletionUsage, FinishReason, ResponseMessage,
    };

    fn completion(content: &str) -> ChatCompletionResponse {
        ChatCompletionResponse {
            id: "chatcmpl-final".to_string(),
            object: CHAT_COMPLETION_OBJECT.to_string(),
            created: 7,
            model: "m".to_string(),
            choices: vec![ChatChoice {
                index: 0,
                message: ResponseMessage {
                    role: "assistant".to_string(),
                    content: Some(content.to_string()),
                    tool_calls: None,
                },
                finish_reason: Some(FinishReason::Stop),
            }],
            usage: CompletionUsage::default(),
            system_fingerprint: None,
        }
    }

    fn frame_json(frame: &Bytes) -> serde_json::Value {
        let text = std::str::from_utf8(frame).unwrap();
        let payload = text
            .strip_prefix("data: ")
            .and_then(|rest| rest.strip_suffix("\n\n"))
            .unwrap();
        serde_json::from_str(payload).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeats_then_final_then_done() {
        let (tx, mut rx) = mpsc::channel::<Bytes>(32);
        let handle = KeepAliveHandle::start(tx, "m");

        for _ in 0..7 {
            tokio::time::advance(Duration::from_millis(1000)).await;
            tokio::task::yield_now().await;
        }

        let mut heartbeats = 0;
        while let Ok(frame) = rx.try_recv() {
            let value = frame_json(&frame);
            assert_eq!(value["id"], HEARTBEAT_ID);
            assert!(value["choices"][0]["delta"].as_object().unwrap().is_empty());
            assert!(value["choices"][0]["finish_reason"].is_null());
            heartbeats += 1;
        }
        // 6.5 s of upstream silence means at least two heartbeats.
        assert!(heartbeats >= 2, "only {heartbeats} heartbeats");

        handle.send_final(&completion("ok")).await;
        drop(handle);

        let mut frames = Vec::new();
        while let Some(frame) = rx.recv().await {
            frames.push(frame);
        }
        assert_eq!(frames.len(), 2);

        let final_chunk = frame_json(&frames[0]);
        assert_eq!(final_chunk["object"], "chat.completion.chunk");
        assert_eq!(final_chunk["choices"][0]["delta"]["role"], "assistant");
        assert_eq!(final_chunk["choices"][0]["delta"]["content"], "ok");
        assert_eq!(final_chunk["choices"][0]["finish_reason"], "stop");

        assert_eq!(&frames[1][..], sse::DONE_FRAME);
    }

    #[tokio::test(start_paused = true)]
    async fn no_heartbeats_after_stop() {
        let (tx, mut rx) = mpsc::channel::<Bytes>(32);
        let handle = KeepAliveHandle::start(tx, "m");
        tokio::task::yield_now().await;
        handle.stop();
        handle.stop(); // idempotent

        while rx.try_recv().is_ok() {}
        for _ in 0..4 {
            tokio::time::advance(Duration::from_millis(1000)).await;
            tokio::task::yield_now().await;
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn final_is_sent_at_most_once() {
        let (tx, mut rx) = mpsc::channel::<Bytes>(32);
        let handle = KeepAliveHandle::start(tx, "m");
        handle.send_final(&completion("ok")).await;
        handle.send_final(&completion("again")).await;
        handle
            .send_error(&ErrorEnvelope::upstream("late error"))
            .await;
        drop(handle);

        let mut done_frames = 0;
        let mut frames = 0;
        while let Some(frame) = rx.recv().await {
            frames += 1;
            if &frame[..] == sse::DONE_FRAME {
                done_frames += 1;
            }
        }
        assert_eq!(done_frames, 1);
        assert_eq!(frames, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn error_path_emits_error_then_done() {
        let (tx, mut rx) = mpsc::channel::<Bytes>(32);
        let handle = KeepAliveHandle::start(tx, "m");
        handle
            .send_error(&ErrorEnvelope::upstream("boom"))
            .await;
        drop(handle);

        let first = rx.recv().await.unwrap();
        let value = frame_json(&first);
        assert_eq!(value["error"]["type"], "upstream_error");
        let second = rx.recv().await.unwrap();
        assert_eq!(&second[..], sse::DONE_FRAME);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn client_disconnect_stops_pump() {
        let (tx, rx) = mpsc::channel::<Bytes>(32);
        let handle = KeepAliveHandle::start(tx, "m");
        drop(rx);
        // Must not hang or panic once the reader is gone.
        handle.send_final(&completion("ok")).await;
    }
}
