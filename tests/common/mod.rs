//! Scripted completion backend shared by the integration tests.
//!
//! Each `open_stream` call consumes the next scripted reply. A streamed
//! reply is fed by the test through an unbounded channel, so the test
//! decides exactly when each chunk arrives and when the body ends.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;

use streamchat::decoder::ByteStream;
use streamchat::observer::{ObservedEvent, RecordingObserver};
use streamchat::providers::{error_detail, ChatRequest, EndpointTarget};
use streamchat::{ChatApp, ChatError, CompletionBackend, MemoryStore};

pub enum Reply {
    Stream(mpsc::UnboundedReceiver<Bytes>),
    Status(u16, String),
}

#[derive(Default)]
pub struct ScriptedBackend {
    replies: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<(EndpointTarget, ChatRequest)>>,
}

impl ScriptedBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue a streamed reply; the returned sender feeds its body.
    pub fn stream(&self) -> mpsc::UnboundedSender<Bytes> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.replies.lock().expect("replies").push_back(Reply::Stream(rx));
        tx
    }

    /// Queue a streamed reply whose whole body is already known.
    pub fn complete(&self, chunks: &[Bytes]) {
        let tx = self.stream();
        for chunk in chunks {
            tx.send(chunk.clone()).expect("send");
        }
    }

    pub fn status(&self, status: u16, body: &str) {
        self.replies.lock().expect("replies").push_back(Reply::Status(status, body.to_string()));
    }

    pub fn requests(&self) -> Vec<(EndpointTarget, ChatRequest)> {
        self.requests.lock().expect("requests").clone()
    }
}

#[async_trait]
impl CompletionBackend for ScriptedBackend {
    async fn open_stream(&self, target: &EndpointTarget, request: &ChatRequest) -> Result<ByteStream, ChatError> {
        self.requests.lock().expect("requests").push((target.clone(), request.clone()));
        let reply = self.replies.lock().expect("replies").pop_front();
        match reply {
            Some(Reply::Stream(rx)) => Ok(Box::pin(UnboundedReceiverStream::new(rx).map(Ok::<Bytes, ChatError>))),
            Some(Reply::Status(status, body)) => Err(ChatError::Transport {
                status: Some(status),
                message: error_detail(status, &body),
            }),
            None => Err(ChatError::Transport { status: None, message: "no scripted reply".into() }),
        }
    }
}

/// One SSE event carrying a content delta.
pub fn delta(content: &str) -> Bytes {
    let payload = serde_json::json!({ "choices": [{ "delta": { "content": content } }] });
    Bytes::from(format!("data: {payload}\n\n"))
}

pub fn done() -> Bytes {
    Bytes::from_static(b"data: [DONE]\n\n")
}

/// App over an in-memory store, local partition active, primary
/// credential configured.
pub fn app(backend: Arc<ScriptedBackend>, observer: Arc<RecordingObserver>) -> ChatApp {
    let app = ChatApp::new(Box::new(MemoryStore::new()), backend, observer);
    app.activate(None);
    app.update_settings(|s| {
        s.api_key = "sk-test".into();
        s.api_base_url = "http://primary.test/v1".into();
        Ok(())
    })
    .expect("settings");
    app
}

pub fn delta_count(observer: &RecordingObserver, target: &str) -> usize {
    observer
        .events()
        .iter()
        .filter(|e| matches!(e, ObservedEvent::Delta { target: t, .. } if t == target))
        .count()
}

pub fn started_targets(observer: &RecordingObserver) -> Vec<String> {
    observer
        .events()
        .into_iter()
        .filter_map(|e| match e {
            ObservedEvent::Started { target, .. } => Some(target),
            _ => None,
        })
        .collect()
}

/// Poll `cond` until it holds, failing the test after five seconds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
