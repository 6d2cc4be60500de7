//! Framed duplex channel.
//!
//! ```text
//!   callers ──send/start_call──► outbound queue ──► writer task ──► stream
//!                                                   (keep-alive when idle)
//!
//!   stream ──► reader task ──┬─ Response ──► pending table ──► PendingCall
//!                            └─ other ─────► inbound receiver (owner)
//! ```
//!
//! One writer drains the queue so frames never interleave; one reader owns
//! the receive side. The pending table maps call ids to completion slots.
//! Each slot is removed exactly once, by its response or by channel failure.
//! A failure is recorded once and handed to every call still pending.

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use crate::address::EndpointAddress;
use crate::ipc::codec::{read_frame, write_frame, write_keepalive, Frame};
use crate::ipc::message::Envelope;
use crate::ipc::WireFormat;
use crate::types::{CallId, ChannelConfig, ChannelId, Error, Result};

/// A queued frame plus an optional flush acknowledgement.
#[derive(Debug)]
struct Outbound {
    bytes: Vec<u8>,
    flushed: Option<oneshot::Sender<()>>,
}

#[derive(Debug)]
struct PendingTable {
    next_id: u64,
    calls: HashMap<CallId, oneshot::Sender<Result<Bytes>>>,
    closed: bool,
}

#[derive(Debug)]
struct Shared {
    id: ChannelId,
    pending: Mutex<PendingTable>,
    reason: OnceLock<Error>,
    token: CancellationToken,
}

impl Shared {
    /// Record the failure cause and fail every pending call with it.
    async fn fail(&self, cause: Error) {
        let drained = {
            let mut table = self.pending.lock().await;
            if table.closed {
                return;
            }
            table.closed = true;
            std::mem::take(&mut table.calls)
        };
        let _ = self.reason.set(cause.clone());
        self.token.cancel();

        if matches!(cause, Error::Protocol(_)) {
            tracing::warn!("Channel {} failed: {}", self.id, cause);
        } else {
            tracing::debug!("Channel {} closed: {}", self.id, cause);
        }
        for (_, slot) in drained {
            let _ = slot.send(Err(cause.clone()));
        }
    }

    /// Resolve a pending call. An id with no slot is a protocol violation.
    async fn complete(&self, call_id: CallId, payload: Bytes) -> Result<()> {
        let slot = self.pending.lock().await.calls.remove(&call_id);
        match slot {
            Some(slot) => {
                // The caller may have stopped waiting; the slot is gone either way.
                let _ = slot.send(Ok(payload));
                Ok(())
            }
            None => Err(Error::protocol(format!(
                "response for unknown call id {}",
                call_id
            ))),
        }
    }

    fn closed_error(&self) -> Error {
        self.reason
            .get()
            .cloned()
            .unwrap_or_else(|| Error::channel_closed(format!("channel {} closed", self.id)))
    }
}

/// Handle to a framed channel. Cheap to clone; all clones share one connection.
///
/// Dropping the last handle closes the channel.
#[derive(Debug, Clone)]
pub struct Channel {
    shared: Arc<Shared>,
    outbound: mpsc::UnboundedSender<Outbound>,
    format: WireFormat,
}

impl Channel {
    /// Start the reader and writer tasks over a duplex stream.
    ///
    /// Returns the channel and the stream of every inbound envelope except
    /// responses, which resolve pending calls directly.
    pub fn open<R, W>(
        reader: R,
        writer: W,
        config: &ChannelConfig,
        format: WireFormat,
    ) -> (Channel, mpsc::UnboundedReceiver<Envelope>)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let shared = Arc::new(Shared {
            id: ChannelId::next(),
            pending: Mutex::new(PendingTable {
                next_id: 1,
                calls: HashMap::new(),
                closed: false,
            }),
            reason: OnceLock::new(),
            token: CancellationToken::new(),
        });
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();

        tokio::spawn(write_loop(
            writer,
            out_rx,
            shared.clone(),
            config.keepalive_interval,
        ));
        tokio::spawn(read_loop(
            reader,
            in_tx,
            shared.clone(),
            config.max_frame_bytes,
            config.peer_timeout(),
            format,
        ));
        tracing::debug!(
            "Channel {} opened (format={}, keepalive={:?})",
            shared.id,
            format.name(),
            config.keepalive_interval
        );

        (
            Channel {
                shared,
                outbound: out_tx,
                format,
            },
            in_rx,
        )
    }

    pub fn id(&self) -> ChannelId {
        self.shared.id
    }

    pub fn format(&self) -> WireFormat {
        self.format
    }

    pub fn is_closed(&self) -> bool {
        self.shared.token.is_cancelled()
    }

    /// Failure cause, once the channel is closed.
    pub fn close_reason(&self) -> Option<Error> {
        self.shared.reason.get().cloned()
    }

    /// Resolves when the channel is closed for any reason.
    pub async fn closed(&self) {
        self.shared.token.cancelled().await
    }

    /// Close the channel, failing every pending call with `cause`.
    pub async fn close(&self, cause: Error) {
        self.shared.fail(cause).await
    }

    /// Send a message that expects no response. Completes once flushed.
    pub async fn send(&self, envelope: &Envelope) -> Result<()> {
        let bytes = self.format.encode(envelope)?;
        self.send_raw(bytes).await
    }

    /// Send pre-encoded envelope bytes. Completes once flushed.
    pub async fn send_raw(&self, bytes: Vec<u8>) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(Outbound {
            bytes,
            flushed: Some(tx),
        })?;
        // A flush that completed counts even if the channel closed since.
        tokio::select! {
            biased;
            ack = rx => ack.map_err(|_| self.shared.closed_error()),
            _ = self.shared.token.cancelled() => Err(self.shared.closed_error()),
        }
    }

    /// Issue a request and register its pending slot.
    pub async fn start_call(
        &self,
        target: EndpointAddress,
        timeout_ms: Option<u64>,
        payload: Bytes,
    ) -> Result<PendingCall> {
        let (tx, rx) = oneshot::channel();
        let call_id = {
            let mut table = self.shared.pending.lock().await;
            if table.closed {
                return Err(self.shared.closed_error());
            }
            let mut raw = table.next_id;
            let call_id = loop {
                match CallId::new(raw) {
                    Some(id) if table.calls.contains_key(&id) => raw += 1,
                    Some(id) => break Some(id),
                    None => break None,
                }
            };
            match call_id {
                Some(id) => {
                    table.next_id = raw + 1;
                    table.calls.insert(id, tx);
                    id
                }
                None => {
                    drop(table);
                    let err = Error::protocol("call id space exhausted");
                    self.shared.fail(err.clone()).await;
                    return Err(err);
                }
            }
        };

        let envelope = Envelope::Request {
            call_id,
            target: target.clone(),
            timeout_ms,
            payload,
        };
        let queued = self
            .format
            .encode(&envelope)
            .and_then(|bytes| self.enqueue(Outbound { bytes, flushed: None }));
        if let Err(e) = queued {
            self.shared.pending.lock().await.calls.remove(&call_id);
            return Err(e);
        }

        Ok(PendingCall {
            channel: self.clone(),
            call_id,
            target,
            rx,
        })
    }

    /// Number of calls still waiting for a response.
    pub async fn pending_count(&self) -> usize {
        self.shared.pending.lock().await.calls.len()
    }

    fn enqueue(&self, item: Outbound) -> Result<()> {
        if self.is_closed() {
            return Err(self.shared.closed_error());
        }
        self.outbound
            .send(item)
            .map_err(|_| self.shared.closed_error())
    }

    #[cfg(test)]
    pub(crate) async fn set_next_call_id(&self, raw: u64) {
        self.shared.pending.lock().await.next_id = raw;
    }
}

/// The caller's side of an outstanding request.
#[derive(Debug)]
pub struct PendingCall {
    channel: Channel,
    call_id: CallId,
    target: EndpointAddress,
    rx: oneshot::Receiver<Result<Bytes>>,
}

impl PendingCall {
    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    /// Wait for the response payload, or the channel's failure cause.
    pub async fn response(&mut self) -> Result<Bytes> {
        match (&mut self.rx).await {
            Ok(result) => result,
            Err(_) => Err(self.channel.shared.closed_error()),
        }
    }

    /// Ask the callee to cancel. The call still resolves through [`Self::response`].
    pub fn cancel(&self) -> Result<()> {
        let envelope = Envelope::Cancel {
            call_id: self.call_id,
            target: self.target.clone(),
        };
        let bytes = self.channel.format.encode(&envelope)?;
        self.channel.enqueue(Outbound {
            bytes,
            flushed: None,
        })
    }
}

async fn write_loop<W>(
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    shared: Arc<Shared>,
    keepalive: Option<Duration>,
) where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let cause = loop {
        let next = tokio::select! {
            _ = shared.token.cancelled() => break None,
            next = next_outbound(&mut outbound, keepalive) => next,
        };
        let written = match next {
            Next::Frame(item) => write_frame(&mut writer, &item.bytes).await.map(|()| {
                if let Some(ack) = item.flushed {
                    let _ = ack.send(());
                }
            }),
            Next::Idle => write_keepalive(&mut writer).await,
            Next::Dropped => break Some(Error::channel_closed("channel dropped")),
        };
        if let Err(e) = written {
            break Some(e);
        }
    };

    if let Some(cause) = cause {
        shared.fail(cause).await;
    }
    let _ = writer.shutdown().await;
}

enum Next {
    Frame(Outbound),
    Idle,
    Dropped,
}

async fn next_outbound(
    outbound: &mut mpsc::UnboundedReceiver<Outbound>,
    keepalive: Option<Duration>,
) -> Next {
    let item = match keepalive {
        Some(interval) => match tokio::time::timeout(interval, outbound.recv()).await {
            Ok(item) => item,
            Err(_) => return Next::Idle,
        },
        None => outbound.recv().await,
    };
    item.map_or(Next::Dropped, Next::Frame)
}

async fn read_loop<R>(
    mut reader: R,
    inbound: mpsc::UnboundedSender<Envelope>,
    shared: Arc<Shared>,
    max_frame_bytes: u32,
    peer_timeout: Option<Duration>,
    format: WireFormat,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    let cause = loop {
        let read = async {
            match peer_timeout {
                Some(limit) => tokio::time::timeout(limit, read_frame(&mut reader, max_frame_bytes))
                    .await
                    .map_err(|_| {
                        Error::channel_closed(format!("no traffic from peer for {:?}", limit))
                    })?,
                None => read_frame(&mut reader, max_frame_bytes).await,
            }
        };
        let frame = tokio::select! {
            _ = shared.token.cancelled() => return,
            frame = read => frame,
        };

        let bytes = match frame {
            // An empty frame carries no envelope; it only counts as traffic.
            Ok(Some(Frame::Data(bytes))) if bytes.is_empty() => continue,
            Ok(Some(Frame::Data(bytes))) => bytes,
            Ok(Some(Frame::KeepAlive)) => continue,
            Ok(None) => break Error::channel_closed("peer closed the channel"),
            Err(e) => break e,
        };
        let envelope: Envelope = match format.decode(&bytes) {
            Ok(envelope) => envelope,
            Err(e) => break Error::protocol(format!("undecodable envelope: {}", e)),
        };
        match envelope {
            Envelope::Response { call_id, payload } => {
                if let Err(e) = shared.complete(call_id, payload).await {
                    break e;
                }
            }
            other => {
                if inbound.send(other).is_err() {
                    tracing::trace!("Channel {} inbound receiver gone, dropping message", shared.id);
                }
            }
        }
    };
    shared.fail(cause).await;
}
