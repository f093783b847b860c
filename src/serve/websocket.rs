//! Full-duplex adapter.
//!
//! Every inbound text frame becomes a synthetic `GET` to the socket's path,
//! runs through the ordinary dispatcher with the frame's fields attached, and
//! the response body goes back as one text frame. Binary and ping frames are
//! ignored; a close frame ends the session; a parse or write failure tears it
//! down immediately.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use http_body_util::BodyExt;
use hyper::{header, HeaderMap, Request, Uri};
use indexmap::IndexMap;
use serde_json::Value;
use tungstenite::Message;

use crate::error::Error;
use crate::serve::dispatch::Dispatcher;
use crate::serve::request::RequestContext;

/// Turns one text frame into the form fields of a synthetic request.
pub trait FrameParser: Send + Sync + 'static {
    fn parse(&self, frame: &str) -> Result<IndexMap<String, String>, Error>;
}

/// JSON objects map scalar fields to form fields; anything that is not an
/// object is delivered as a single `message` field.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonFrameParser;

impl FrameParser for JsonFrameParser {
    fn parse(&self, frame: &str) -> Result<IndexMap<String, String>, Error> {
        if !frame.trim_start().starts_with('{') {
            return Ok(IndexMap::from([("message".to_string(), frame.to_string())]));
        }

        let object = match serde_json::from_str::<Value>(frame).map_err(Error::decode)? {
            Value::Object(object) => object,
            _ => return Err(Error::decode("frame is not a JSON object")),
        };
        let fields = object
            .into_iter()
            .filter_map(|(key, value)| {
                let value = match value {
                    Value::String(s) => s,
                    Value::Number(n) => n.to_string(),
                    Value::Bool(b) => b.to_string(),
                    Value::Null => String::new(),
                    Value::Array(_) | Value::Object(_) => return None,
                };
                Some((key, value))
            })
            .collect();
        Ok(fields)
    }
}

/// Why a socket session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketClose {
    /// Close frame or end of the inbound stream.
    Client,
    ParseFailed,
    WriteFailed,
    ReadFailed,
}

impl SocketClose {
    pub fn as_str(self) -> &'static str {
        match self {
            SocketClose::Client => "client",
            SocketClose::ParseFailed => "parse_error",
            SocketClose::WriteFailed => "write_error",
            SocketClose::ReadFailed => "read_error",
        }
    }
}

impl fmt::Display for SocketClose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One upgraded connection bound to the path it was opened on.
pub struct SocketSession {
    dispatcher: Arc<Dispatcher>,
    parser: Arc<dyn FrameParser>,
    uri: Uri,
    headers: HeaderMap,
}

impl SocketSession {
    /// `headers` are the upgrade request's; handshake headers are dropped so
    /// synthetic requests only carry what guards and controllers care about.
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        parser: Arc<dyn FrameParser>,
        uri: Uri,
        mut headers: HeaderMap,
    ) -> Self {
        headers.remove(header::CONNECTION);
        headers.remove(header::UPGRADE);
        let handshake: Vec<_> = headers
            .keys()
            .filter(|name| name.as_str().starts_with("sec-websocket-"))
            .cloned()
            .collect();
        for name in handshake {
            headers.remove(name);
        }
        Self {
            dispatcher,
            parser,
            uri,
            headers,
        }
    }

    pub async fn run<R, W>(self, mut inbound: R, mut outbound: W) -> SocketClose
    where
        R: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
        W: Sink<Message, Error = tungstenite::Error> + Unpin,
    {
        let path = self.uri.path().to_string();
        tracing::info!(event = "socket_opened", path = %path);

        let reason = loop {
            let text = match inbound.next().await {
                None => break SocketClose::Client,
                Some(Err(e)) => {
                    tracing::debug!(path = %path, error = %e, "socket read failed");
                    break SocketClose::ReadFailed;
                }
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Close(_))) => break SocketClose::Client,
                Some(Ok(_)) => continue,
            };

            let fields = match self.parser.parse(&text) {
                Ok(fields) => fields,
                Err(e) => {
                    tracing::warn!(path = %path, error = %e, "unparseable socket frame");
                    break SocketClose::ParseFailed;
                }
            };

            let reply = self.respond(fields).await;
            if outbound.send(Message::Text(reply)).await.is_err() {
                break SocketClose::WriteFailed;
            }
        };

        let _ = outbound.close().await;
        tracing::info!(event = "socket_closed", path = %path, reason = %reason);
        reason
    }

    async fn respond(&self, fields: IndexMap<String, String>) -> String {
        let mut request = Request::new(Bytes::new());
        *request.uri_mut() = self.uri.clone();
        *request.headers_mut() = self.headers.clone();

        let mut ctx = RequestContext::new(request);
        ctx.set_fields(fields);
        let response = self.dispatcher.dispatch(ctx).await;
        let body = match response.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(never) => match never {},
        };
        String::from_utf8_lossy(&body).into_owned()
    }
}
