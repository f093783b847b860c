//! Server-Sent Events adapter.
//!
//! A [`StreamSession`] serves one long-lived `text/event-stream` response.
//! Each bound source gets its own bounded channel and drain task; every drain
//! writes whole frames under one lock so events from different sources never
//! interleave. The session ends when all sources have finished (server
//! closed, or source panic if one of them panicked), when the client goes
//! away, or when a write fails.

use std::convert::Infallible;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{FutureExt, StreamExt};
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Frame;
use hyper::Response;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_stream::wrappers::ReceiverStream;
use tracing::Instrument;

use crate::controller::StreamSource;
use crate::error::Error;
use crate::serve::dispatch::panic_error;
use crate::serve::request::RequestContext;
use crate::serve::response::Body;

/// One server-push message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Event {
    pub name: Option<String>,
    pub id: Option<String>,
    pub data: String,
}

impl Event {
    pub fn new(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            ..Self::default()
        }
    }

    pub fn named(name: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            data: data.into(),
            id: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Wire encoding: optional `event:` and `id:` lines, one `data:` line per
    /// payload line, then a blank line. Line breaks in the name and id are
    /// dropped so they cannot start new fields.
    pub fn encode(&self) -> Bytes {
        let mut frame = String::with_capacity(self.data.len() + 16);
        if let Some(name) = &self.name {
            push_field(&mut frame, "event", name);
        }
        if let Some(id) = &self.id {
            push_field(&mut frame, "id", id);
        }
        for line in self.data.split('\n') {
            frame.push_str("data: ");
            frame.push_str(line.strip_suffix('\r').unwrap_or(line));
            frame.push('\n');
        }
        frame.push('\n');
        Bytes::from(frame)
    }
}

fn push_field(frame: &mut String, field: &str, value: &str) {
    frame.push_str(field);
    frame.push_str(": ");
    frame.extend(value.chars().filter(|c| !matches!(c, '\r' | '\n')));
    frame.push('\n');
}

/// Sending half handed to a [`StreamSource`].
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::Sender<Event>,
    source: Option<Arc<str>>,
}

impl EventSender {
    /// Send a data-only event. Fails once the session is gone.
    pub async fn send(&self, data: impl Into<String>) -> Result<(), Error> {
        self.send_event(Event::new(data)).await
    }

    /// Send an event; unnamed events take the source's name.
    pub async fn send_event(&self, mut event: Event) -> Result<(), Error> {
        if event.name.is_none() {
            event.name = self.source.as_deref().map(str::to_string);
        }
        self.tx
            .send(event)
            .await
            .map_err(|_| Error::internal("event stream closed"))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Where encoded frames go.
#[async_trait]
pub trait EventTransport: Send + 'static {
    async fn write_frame(&mut self, frame: Bytes) -> std::io::Result<()>;
    async fn flush(&mut self) -> std::io::Result<()>;
}

/// Transport feeding a hyper streaming body.
///
/// Each frame is handed to the body as soon as it is written, so `flush`
/// has nothing left to do.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::Sender<Bytes>,
}

impl ChannelTransport {
    pub fn new(tx: mpsc::Sender<Bytes>) -> Self {
        Self { tx }
    }

    /// Resolves when the receiving side (the client connection) is dropped.
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}

#[async_trait]
impl EventTransport for ChannelTransport {
    async fn write_frame(&mut self, frame: Bytes) -> std::io::Result<()> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "client disconnected"))
    }

    async fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Every source finished and closed its channel.
    ServerClosed,
    /// The client disconnected.
    ClientClosed,
    /// Writing to the transport failed.
    WriteFailed,
    /// A source panicked; the other sources ran to completion.
    SourcePanicked,
}

impl Termination {
    pub fn as_str(self) -> &'static str {
        match self {
            Termination::ServerClosed => "server",
            Termination::ClientClosed => "client",
            Termination::WriteFailed => "write_error",
            Termination::SourcePanicked => "source_panic",
        }
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub(crate) type Sources = Vec<(Option<String>, Arc<dyn StreamSource>)>;

/// One open event stream.
pub struct StreamSession<T: EventTransport> {
    transport: Arc<Mutex<T>>,
    sources: Sources,
    buffer: usize,
}

impl<T: EventTransport> StreamSession<T> {
    pub fn new(transport: T, sources: Sources, buffer: usize) -> Self {
        Self {
            transport: Arc::new(Mutex::new(transport)),
            sources,
            buffer: buffer.max(1),
        }
    }

    /// Drive every source until the session terminates.
    ///
    /// `client_closed` resolves when the client disconnects. All spawned
    /// tasks are finished or cancelled before this returns.
    pub async fn run<F>(self, ctx: Arc<RequestContext>, client_closed: F) -> Termination
    where
        F: std::future::Future<Output = ()> + Send,
    {
        let request_id = ctx.request_id();
        tracing::info!(
            event = "stream_opened",
            %request_id,
            path = ctx.path(),
            sources = self.sources.len()
        );

        let mut producers = JoinSet::new();
        let mut drains = JoinSet::new();

        for (name, source) in self.sources {
            let (tx, rx) = mpsc::channel(self.buffer);
            let sender = EventSender {
                tx,
                source: name.as_deref().map(Arc::from),
            };
            let ctx = Arc::clone(&ctx);
            producers.spawn(async move {
                let source_name = name.as_deref().unwrap_or("default");
                match AssertUnwindSafe(source.stream(sender, &ctx)).catch_unwind().await {
                    Ok(Ok(())) => false,
                    Ok(Err(e)) => {
                        tracing::warn!(
                            event = "stream_source_error",
                            request_id = %ctx.request_id(),
                            source = source_name,
                            error = %e
                        );
                        false
                    }
                    Err(payload) => {
                        let error = panic_error(payload);
                        tracing::error!(
                            event = "panic_recovered",
                            request_id = %ctx.request_id(),
                            source = source_name,
                            error = %error,
                            backtrace = error.backtrace().unwrap_or_default(),
                        );
                        true
                    }
                }
            }
            .in_current_span());
            drains.spawn(drain(rx, Arc::clone(&self.transport)).in_current_span());
        }

        let all_drained = async {
            let mut termination = Termination::ServerClosed;
            while let Some(result) = drains.join_next().await {
                if let Ok(Termination::WriteFailed) = result {
                    termination = Termination::WriteFailed;
                    break;
                }
            }
            termination
        };

        let mut termination = tokio::select! {
            biased;
            _ = client_closed => Termination::ClientClosed,
            t = all_drained => t,
        };

        // Every channel is closed, so the producers are finishing too.
        if termination == Termination::ServerClosed {
            while let Some(result) = producers.join_next().await {
                if matches!(result, Ok(true)) {
                    termination = Termination::SourcePanicked;
                }
            }
        }

        producers.shutdown().await;
        drains.shutdown().await;

        tracing::info!(event = "stream_closed", %request_id, reason = %termination);
        termination
    }
}

async fn drain<T: EventTransport>(
    mut rx: mpsc::Receiver<Event>,
    transport: Arc<Mutex<T>>,
) -> Termination {
    while let Some(event) = rx.recv().await {
        let frame = event.encode();
        let mut transport = transport.lock().await;
        if transport.write_frame(frame).await.is_err() || transport.flush().await.is_err() {
            return Termination::WriteFailed;
        }
    }
    Termination::ServerClosed
}

/// Start a session over a hyper streaming body and return the response head.
pub fn respond(ctx: RequestContext, sources: Sources, buffer: usize) -> Response<Body> {
    let request_id = ctx.request_id();
    let (tx, rx) = mpsc::channel::<Bytes>(buffer.max(1));
    let transport = ChannelTransport::new(tx);
    let watcher = transport.clone();
    let session = StreamSession::new(transport, sources, buffer);

    tokio::spawn(async move {
        session
            .run(Arc::new(ctx), async move { watcher.closed().await })
            .await;
    });

    let stream = ReceiverStream::new(rx).map(|bytes| Ok::<_, Infallible>(Frame::data(bytes)));
    let body = BodyExt::boxed(StreamBody::new(stream));

    let mut response = Response::new(body);
    let headers = response.headers_mut();
    headers.insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(
        hyper::header::CACHE_CONTROL,
        hyper::header::HeaderValue::from_static("no-cache"),
    );
    if let Ok(value) = hyper::header::HeaderValue::from_str(&request_id.to_string()) {
        headers.insert("x-request-id", value);
    }
    response
}
