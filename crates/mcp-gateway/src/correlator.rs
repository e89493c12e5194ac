//! Request correlation between concurrent callers and the child's single
//! response stream.
//!
//! One pending table maps in-flight request ids to completion slots. The
//! three paths that can resolve an entry (a response frame, the timeout
//! sweep, child exit) all remove it under the same lock, so exactly one of
//! them ever reaches a given caller.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::error::BridgeError;
use crate::process::ExitStatusInfo;
use crate::rpc::codec::ContentLengthCodec;
use crate::rpc::protocol::{RequestId, RpcRequest, response_id};

/// Outcome delivered to a waiting caller: the raw response frame, or the
/// bridge failure that ended the wait.
pub type CallOutcome = Result<Value, BridgeError>;

const SWEEP_INTERVAL: Duration = Duration::from_millis(100);

type ChildWriter = FramedWrite<Box<dyn AsyncWrite + Send + Unpin>, ContentLengthCodec<RpcRequest>>;

struct PendingRequest {
    created_at: Instant,
    deadline: Instant,
    slot: oneshot::Sender<CallOutcome>,
}

/// Correlates concurrent callers with the child's single response stream.
pub struct RequestCorrelator {
    pending: StdMutex<HashMap<u64, PendingRequest>>,
    next_id: AtomicU64,
    /// Holding this across the send keeps each frame write atomic.
    writer: tokio::sync::Mutex<ChildWriter>,
    /// Flips to true when the correlator is torn down; ends the sweep task.
    closed: watch::Sender<bool>,
}

impl RequestCorrelator {
    /// Wire a correlator to the child's stdin.
    pub fn new(stdin: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        let stdin: Box<dyn AsyncWrite + Send + Unpin> = Box::new(stdin);
        let (closed, _) = watch::channel(false);
        Self {
            pending: StdMutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            writer: tokio::sync::Mutex::new(FramedWrite::new(stdin, ContentLengthCodec::new())),
            closed,
        }
    }

    /// Number of requests currently in flight.
    pub fn pending_count(&self) -> usize {
        self.lock_pending().len()
    }

    /// Send `method` to the child and register the caller for the response.
    ///
    /// The entry is registered before the frame is written; a failed write
    /// deregisters it and fails the call instead of leaving it to time out.
    pub async fn issue(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<oneshot::Receiver<CallOutcome>, BridgeError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = RpcRequest::call(RequestId(id), method, params);

        let (slot_tx, slot_rx) = oneshot::channel();
        let now = Instant::now();
        self.lock_pending().insert(
            id,
            PendingRequest {
                created_at: now,
                deadline: now + timeout,
                slot: slot_tx,
            },
        );

        tracing::debug!(id, method, timeout_secs = timeout.as_secs_f64(), "Issuing request");
        let written = {
            let mut writer = self.writer.lock().await;
            writer.send(request).await
        };
        if let Err(e) = written {
            self.lock_pending().remove(&id);
            return Err(BridgeError::Transport(format!(
                "failed to write request {id}: {e}"
            )));
        }
        Ok(slot_rx)
    }

    /// Fire-and-forget notification: no id, no pending entry.
    pub async fn send_notification(&self, method: &str) -> Result<(), BridgeError> {
        let request = RpcRequest::notification(method);
        let mut writer = self.writer.lock().await;
        writer
            .send(request)
            .await
            .map_err(|e| BridgeError::Transport(format!("failed to write notification: {e}")))
    }

    /// Route one inbound frame to its waiting caller.
    ///
    /// Frames without a matching pending id are logged and dropped; the
    /// child may emit notifications or late replies at any time.
    pub fn resolve_frame(&self, frame: Value) {
        let Some(id) = response_id(&frame) else {
            tracing::debug!(
                method = frame.get("method").and_then(serde_json::Value::as_str).unwrap_or_default(),
                "Discarding frame without a usable id"
            );
            return;
        };
        match self.lock_pending().remove(&id) {
            Some(entry) => {
                tracing::debug!(id, "Response received");
                let _ = entry.slot.send(Ok(frame));
            }
            None => {
                tracing::warn!(id, "Discarding response with no matching request");
            }
        }
    }

    /// Fail every outstanding request with the child's exit status and mark
    /// the correlator closed. Returns how many were failed; a second call
    /// finds an empty table.
    pub fn fail_all(&self, status: ExitStatusInfo) -> usize {
        let drained: Vec<(u64, PendingRequest)> = self.lock_pending().drain().collect();
        let _ = self.closed.send(true);

        if !drained.is_empty() {
            tracing::warn!(count = drained.len(), %status, "Failing all in-flight requests");
        }
        let count = drained.len();
        for (_, entry) in drained {
            let _ = entry.slot.send(Err(BridgeError::ChildExited { status }));
        }
        count
    }

    /// Consume the child's stdout until it closes.
    ///
    /// A framing error stops the loop; outstanding requests are then
    /// resolved by their timeouts or by the exit watcher.
    pub async fn drive_reader(&self, stdout: impl AsyncRead + Unpin) {
        let mut frames = FramedRead::new(stdout, ContentLengthCodec::<Value>::new());
        while let Some(next) = frames.next().await {
            match next {
                Ok(frame) => self.resolve_frame(frame),
                Err(e) => {
                    tracing::error!(error = %e, "Stopped reading server stdout");
                    return;
                }
            }
        }
        tracing::info!("Server stdout closed");
    }

    pub fn spawn_reader(
        self: &std::sync::Arc<Self>,
        stdout: impl AsyncRead + Send + Unpin + 'static,
    ) -> JoinHandle<()> {
        let correlator = self.clone();
        tokio::spawn(async move { correlator.drive_reader(stdout).await })
    }

    /// Background task expiring pending requests past their deadline.
    ///
    /// One expiry leaves every other in-flight request untouched. The task
    /// ends when the correlator closes or is dropped.
    pub fn spawn_timeout_sweep(self: &std::sync::Arc<Self>) -> JoinHandle<()> {
        let correlator = std::sync::Arc::downgrade(self);
        let mut closed_rx = self.closed.subscribe();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = tick.tick() => {}
                    _ = closed_rx.changed() => break,
                }
                let Some(correlator) = correlator.upgrade() else {
                    break;
                };
                correlator.expire_due();
            }
        })
    }

    fn expire_due(&self) {
        let now = Instant::now();
        let expired: Vec<(u64, PendingRequest)> = {
            let mut pending = self.lock_pending();
            let due: Vec<u64> = pending
                .iter()
                .filter(|(_, entry)| entry.deadline <= now)
                .map(|(id, _)| *id)
                .collect();
            due.into_iter()
                .filter_map(|id| pending.remove(&id).map(|entry| (id, entry)))
                .collect()
        };

        for (id, entry) in expired {
            let waited = entry.deadline - entry.created_at;
            tracing::warn!(id, timeout_secs = waited.as_secs_f64(), "Request timed out");
            let _ = entry.slot.send(Err(BridgeError::Timeout(waited)));
        }
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<u64, PendingRequest>> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("Pending table mutex poisoned - recovering");
                poisoned.into_inner()
            }
        }
    }
}
