//! Response sink shared by every role that writes output.

use std::convert::Infallible;

use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::{header, Response, StatusCode};
use serde::Serialize;

use crate::error::Error;

/// Body type of every response the framework produces.
pub type Body = BoxBody<Bytes, Infallible>;

pub fn full(body: impl Into<Bytes>) -> Body {
    Full::new(body.into()).boxed()
}

pub fn empty() -> Body {
    Empty::<Bytes>::new().boxed()
}

pub const HTML: &str = "text/html; charset=utf-8";

/// Buffered response under construction.
///
/// Headers are kept as plain strings and validated once in
/// [`into_response`](Self::into_response).
#[derive(Debug, Clone)]
pub struct ResponseWriter {
    status: StatusCode,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Default for ResponseWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseWriter {
    pub fn new() -> Self {
        Self {
            status: StatusCode::OK,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn status(&mut self, status: StatusCode) -> &mut Self {
        self.status = status;
        self
    }

    pub fn current_status(&self) -> StatusCode {
        self.status
    }

    /// Set a header, replacing any earlier value with the same name.
    pub fn header(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        let name = name.into();
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(&name));
        self.headers.push((name, value.into()));
        self
    }

    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Append raw bytes to the body.
    pub fn write(&mut self, bytes: impl AsRef<[u8]>) -> &mut Self {
        self.body.extend_from_slice(bytes.as_ref());
        self
    }

    /// Replace the body with an HTML document.
    pub fn html(&mut self, html: impl Into<String>) -> &mut Self {
        self.body = html.into().into_bytes();
        self.header(header::CONTENT_TYPE.as_str(), HTML)
    }

    pub fn text(&mut self, text: impl Into<String>) -> &mut Self {
        self.body = text.into().into_bytes();
        self.header(header::CONTENT_TYPE.as_str(), "text/plain; charset=utf-8")
    }

    pub fn json<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<&mut Self, Error> {
        self.body = serde_json::to_vec(value)?;
        Ok(self.header(header::CONTENT_TYPE.as_str(), "application/json"))
    }

    /// `303 See Other` to `location`.
    pub fn redirect(&mut self, location: &str) -> &mut Self {
        self.body.clear();
        self.status(StatusCode::SEE_OTHER)
            .header(header::LOCATION.as_str(), location)
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub(crate) fn take_body(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.body)
    }

    /// Copy headers from `other` that this writer has not set itself.
    pub(crate) fn inherit_headers(&mut self, other: &ResponseWriter) {
        for (name, value) in &other.headers {
            if self.header_value(name).is_none() {
                self.headers.push((name.clone(), value.clone()));
            }
        }
    }

    pub(crate) fn clear_body(&mut self) {
        self.body.clear();
    }

    /// Build the wire response. An invalid header degrades to a bare 500.
    pub fn into_response(self) -> Response<Body> {
        let mut builder = Response::builder().status(self.status);
        let has_type = self.header_value(header::CONTENT_TYPE.as_str()).is_some();
        for (name, value) in &self.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !has_type && !self.body.is_empty() {
            builder = builder.header(header::CONTENT_TYPE, HTML);
        }

        match builder.body(full(self.body)) {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(error = %e, "invalid response header");
                bare_status(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }
}

/// Response with only a status line.
pub fn bare_status(status: StatusCode) -> Response<Body> {
    let mut response = Response::new(empty());
    *response.status_mut() = status;
    response
}
