//! Duplex transport to the proxy whose underlying stream can be swapped in place
//!
//! A background listener task drains the read half into the response channel,
//! one [`TransportEvent::Data`] per inbound chunk. Swapping the stream (for the
//! TLS upgrade) stops the listener, reunites the halves, and starts a new
//! listener that keeps feeding the *same* channel, so readers never notice
//! the swap apart from the bytes now being decrypted.
//!
//! The channel sender is owned by exactly one listener at a time. It is dropped,
//! closing the channel, when the stream ends or fails, or when the transport is closed.
//!
//! [`Transport::abort`] cancels every pending write, flush, swap and read without
//! taking the stream lock, so a peer that stopped reading cannot keep it alive.

use futures_util::StreamExt;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{self, AsyncRead, AsyncWrite, AsyncWriteExt, BufWriter, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::codec::{BytesCodec, FramedRead};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::connection::TransportEvent;
use crate::{Error, Result};

/// Any byte stream the engine can run over: plain TCP, TLS, in-memory pipes.
pub trait ProxyStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ProxyStream for T {}

pub type BoxedStream = Box<dyn ProxyStream>;

pub type EventSender = mpsc::UnboundedSender<TransportEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

type Writer = BufWriter<WriteHalf<BoxedStream>>;

struct Listener {
    stop: oneshot::Sender<()>,
    task: JoinHandle<Option<Detached>>,
}

/// What a stopped listener hands back so the stream can be reassembled.
struct Detached {
    reader: ReadHalf<BoxedStream>,
    events: EventSender,
}

struct Inner {
    writer: Option<Writer>,
    listener: Option<Listener>,
}

pub struct Transport {
    inner: Mutex<Inner>,
    generation: AtomicU64,
    closed: AtomicBool,
    /// Set by a listener, before it drops the sender, when the stream ends or fails
    ended: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("generation", &self.generation())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Transport {
    /// Bind to an open stream and start delivering inbound chunks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn attach<S: ProxyStream + 'static>(stream: S) -> (Self, EventReceiver) {
        let (events, receiver) = mpsc::unbounded_channel();
        let ended = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();
        let (writer, listener) = start(Box::new(stream), events, ended.clone(), cancel.clone());

        let transport = Self {
            inner: Mutex::new(Inner {
                writer: Some(writer),
                listener: Some(listener),
            }),
            generation: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            ended,
            cancel,
        };
        (transport, receiver)
    }

    /// Number of times the underlying stream has been swapped.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// True once the peer ended the stream or a read failed.
    pub fn stream_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    /// Enqueue bytes; they are only guaranteed to be on the wire after [`flush`](Self::flush).
    pub async fn write(&self, bytes: &[u8]) -> Result<()> {
        self.cancellable(async {
            let mut inner = self.inner.lock().await;
            if self.is_closed() || self.stream_ended() {
                return Err(Error::Closed);
            }
            let writer = inner.writer.as_mut().ok_or(Error::Closed)?;
            writer.write_all(bytes).await?;
            Ok(())
        })
        .await
    }

    pub async fn flush(&self) -> Result<()> {
        self.cancellable(async {
            let mut inner = self.inner.lock().await;
            let writer = inner.writer.as_mut().ok_or(Error::Closed)?;
            writer.flush().await?;
            Ok(())
        })
        .await
    }

    /// Swap in `stream`, returning the previous one.
    ///
    /// Inbound data keeps flowing through the channel created by [`attach`](Self::attach).
    pub async fn replace<S: ProxyStream + 'static>(&self, stream: S) -> Result<BoxedStream> {
        self.cancellable(async {
            let mut inner = self.inner.lock().await;
            let (old, events) = self.detach(&mut inner).await?;
            self.install(&mut inner, Box::new(stream), events);
            Ok(old)
        })
        .await
    }

    /// Hand the current stream to `wrap` and install whatever it returns.
    ///
    /// No other write can interleave while `wrap` runs. If it fails the old
    /// stream is gone and the transport is closed.
    pub async fn upgrade<F, Fut, S>(&self, wrap: F) -> Result<()>
    where
        F: FnOnce(BoxedStream) -> Fut,
        Fut: Future<Output = Result<S>>,
        S: ProxyStream + 'static,
    {
        self.cancellable(async {
            let mut inner = self.inner.lock().await;
            let (raw, events) = self.detach(&mut inner).await?;

            match wrap(raw).await {
                Ok(upgraded) => {
                    self.install(&mut inner, Box::new(upgraded), events);
                    Ok(())
                }
                Err(e) => {
                    warn!("Transport upgrade failed: {}", e);
                    self.closed.store(true, Ordering::SeqCst);
                    drop(events);
                    Err(e)
                }
            }
        })
        .await
    }

    /// Mark the transport closed and cancel whatever is pending on it.
    ///
    /// Blocked writes and flushes fail with [`Error::Closed`] and the listener
    /// stops, which closes the response channel. Nothing is flushed. Follow with
    /// [`close`](Self::close) to release the stream itself.
    pub fn abort(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("Transport aborted");
        }
        self.cancel.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Flush, then release the stream. Safe to call any number of times.
    ///
    /// After [`abort`](Self::abort) the flush is skipped.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        if self.closed.swap(true, Ordering::SeqCst) && inner.writer.is_none() {
            return;
        }

        if let Some(mut writer) = inner.writer.take() {
            let graceful = async {
                writer.flush().await?;
                writer.shutdown().await
            };
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => debug!("Dropping unflushed output of aborted transport"),
                result = graceful => {
                    if let Err(e) = result {
                        debug!("Flush during close failed: {}", e);
                    }
                }
            }
        }

        if let Some(listener) = inner.listener.take() {
            let _ = listener.stop.send(());
            // dropping the detached halves drops the sender and closes the channel
            let _ = listener.task.await;
        }
        debug!("Transport closed");
    }

    /// Run `fut` unless the transport is aborted first.
    async fn cancellable<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Closed),
            result = fut => result,
        }
    }

    async fn detach(&self, inner: &mut Inner) -> Result<(BoxedStream, EventSender)> {
        if self.is_closed() {
            return Err(Error::Closed);
        }

        let result = detach_stream(inner).await;
        if result.is_err() {
            self.closed.store(true, Ordering::SeqCst);
        }
        result
    }

    fn install(&self, inner: &mut Inner, stream: BoxedStream, events: EventSender) {
        let (writer, listener) = start(stream, events, self.ended.clone(), self.cancel.clone());
        inner.writer = Some(writer);
        inner.listener = Some(listener);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("Transport stream swapped (generation {})", generation);
    }
}

async fn detach_stream(inner: &mut Inner) -> Result<(BoxedStream, EventSender)> {
    let mut writer = inner.writer.take().ok_or(Error::Closed)?;
    let listener = inner.listener.take().ok_or(Error::Closed)?;

    writer.flush().await?;

    let _ = listener.stop.send(());
    let detached = listener
        .task
        .await
        .map_err(|e| Error::transport(format!("listener task failed: {}", e)))?
        .ok_or_else(|| Error::transport("stream ended before it could be swapped"))?;

    let stream = detached.reader.unsplit(writer.into_inner());
    Ok((stream, detached.events))
}

fn start(
    stream: BoxedStream,
    events: EventSender,
    ended: Arc<AtomicBool>,
    cancel: CancellationToken,
) -> (Writer, Listener) {
    let (reader, writer) = io::split(stream);
    let (stop, stopped) = oneshot::channel();
    let task = tokio::spawn(listen(reader, events, stopped, ended, cancel));
    (BufWriter::new(writer), Listener { stop, task })
}

async fn listen(
    reader: ReadHalf<BoxedStream>,
    events: EventSender,
    mut stopped: oneshot::Receiver<()>,
    ended: Arc<AtomicBool>,
    cancel: CancellationToken,
) -> Option<Detached> {
    let mut frames = FramedRead::new(reader, BytesCodec::new());

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Transport aborted, stopping listener");
                return None;
            }
            _ = &mut stopped => {
                let residual = frames.read_buffer_mut().split();
                if !residual.is_empty() {
                    let _ = events.send(TransportEvent::Data(residual.freeze()));
                }
                return Some(Detached {
                    reader: frames.into_inner(),
                    events,
                });
            }
            frame = frames.next() => match frame {
                Some(Ok(chunk)) => {
                    debug!("Received {} bytes from proxy", chunk.len());
                    if events.send(TransportEvent::Data(chunk.freeze())).is_err() {
                        debug!("Response channel closed, stopping listener");
                        return None;
                    }
                }
                Some(Err(e)) => {
                    warn!("Transport read failed: {}", e);
                    ended.store(true, Ordering::SeqCst);
                    let _ = events.send(TransportEvent::Error(e));
                    return None;
                }
                None => {
                    debug!("Transport reached end of stream");
                    ended.store(true, Ordering::SeqCst);
                    return None;
                }
            }
        }
    }
}
