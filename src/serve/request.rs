//! Per-request context handed to every controller role.

use std::collections::HashMap;

use bytes::Bytes;
use hyper::http::request::Parts;
use hyper::{header, HeaderMap, Method, Request, Uri};
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::error::Error;
use crate::serve::codec::{self, parse_urlencoded, Codec};

/// Everything known about one request. Created at entry, dropped at
/// completion, never shared between requests.
#[derive(Debug)]
pub struct RequestContext {
    parts: Parts,
    body: Bytes,
    params: HashMap<String, String>,
    query: IndexMap<String, String>,
    fields: IndexMap<String, String>,
    codec: Codec,
    request_id: Uuid,
    error: Option<String>,
}

impl RequestContext {
    pub fn new(request: Request<Bytes>) -> Self {
        let (parts, body) = request.into_parts();
        let query = parts
            .uri
            .query()
            .map(parse_urlencoded)
            .unwrap_or_default();

        let is_form = parts
            .headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| codec::media_type(ct) == codec::FORM);
        let fields = if is_form {
            parse_urlencoded(&String::from_utf8_lossy(&body))
        } else {
            IndexMap::new()
        };

        Self {
            parts,
            body,
            params: HashMap::new(),
            query,
            fields,
            codec: Codec,
            request_id: Uuid::new_v4(),
            error: None,
        }
    }

    pub(crate) fn set_params(&mut self, params: HashMap<String, String>) {
        self.params = params;
    }

    pub(crate) fn set_fields(&mut self, fields: IndexMap<String, String>) {
        self.fields = fields;
    }

    pub(crate) fn record_error(&mut self, error: &Error) {
        self.error = Some(error.to_string());
    }

    pub fn method(&self) -> &Method {
        &self.parts.method
    }

    pub fn uri(&self) -> &Uri {
        &self.parts.uri
    }

    pub fn path(&self) -> &str {
        self.parts.uri.path()
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.parts.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.parts.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Named path parameter (`:id`, `*rest`).
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub fn params(&self) -> &HashMap<String, String> {
        &self.params
    }

    pub fn query(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }

    pub fn query_params(&self) -> &IndexMap<String, String> {
        &self.query
    }

    /// Form field from a urlencoded body or a socket frame.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    pub fn fields(&self) -> &IndexMap<String, String> {
        &self.fields
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    /// Decode the request payload into `T`.
    ///
    /// Frame fields take precedence over the raw body when present.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, Error> {
        if !self.fields.is_empty() {
            return self.codec.decode_fields(&self.fields);
        }
        self.codec
            .decode(self.header(header::CONTENT_TYPE.as_str()), &self.body)
    }

    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    /// Message of the error being recovered, if any.
    pub fn last_error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn wants_json(&self) -> bool {
        self.accepts(codec::JSON)
    }

    pub fn wants_event_stream(&self) -> bool {
        self.accepts("text/event-stream")
    }

    fn accepts(&self, media: &str) -> bool {
        self.parts
            .headers
            .get_all(header::ACCEPT)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|item| codec::media_type(item).eq_ignore_ascii_case(media) && !refused(item))
    }
}

/// An Accept item with `q=0` explicitly refuses the media type.
fn refused(item: &str) -> bool {
    item.split(';').skip(1).any(|param| {
        let Some((name, value)) = param.split_once('=') else {
            return false;
        };
        name.trim().eq_ignore_ascii_case("q")
            && value.trim().parse::<f32>().is_ok_and(|q| q <= 0.0)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    fn context(builder: hyper::http::request::Builder, body: &'static str) -> RequestContext {
        RequestContext::new(builder.body(Bytes::from_static(body.as_bytes())).unwrap())
    }

    #[test]
    fn test_query_and_form_fields() {
        let ctx = context(
            Request::post("/users?page=2&q=a+b").header("content-type", "application/x-www-form-urlencoded"),
            "name=Ann&role=admin",
        );
        assert_eq!(ctx.path(), "/users");
        assert_eq!(ctx.query("page"), Some("2"));
        assert_eq!(ctx.query("q"), Some("a b"));
        assert_eq!(ctx.field("name"), Some("Ann"));
        assert_eq!(ctx.fields().len(), 2);
    }

    #[test]
    fn test_accept_negotiation() {
        let ctx = context(Request::get("/").header("accept", "text/html, application/json;q=0.9"), "");
        assert!(ctx.wants_json());
        assert!(!ctx.wants_event_stream());

        let ctx = context(Request::get("/").header("accept", "text/event-stream"), "");
        assert!(ctx.wants_event_stream());
        assert!(!ctx.wants_json());
    }

    #[test]
    fn test_zero_quality_refuses_media_type() {
        let ctx = context(
            Request::get("/").header("accept", "text/html, application/json;q=0, text/event-stream; Q=0.000"),
            "",
        );
        assert!(!ctx.wants_json());
        assert!(!ctx.wants_event_stream());

        let ctx = context(Request::get("/").header("accept", "application/json; q=0.1"), "");
        assert!(ctx.wants_json());
    }

    #[test]
    fn test_decode_prefers_frame_fields() {
        #[derive(Deserialize)]
        struct Msg {
            message: String,
        }

        let mut ctx = context(Request::get("/chat"), "");
        ctx.set_fields(IndexMap::from([("message".to_string(), "hi".to_string())]));
        assert_eq!(ctx.decode::<Msg>().unwrap().message, "hi");
    }

    #[test]
    fn test_request_ids_are_unique() {
        let a = context(Request::get("/"), "");
        let b = context(Request::get("/"), "");
        assert_ne!(a.request_id(), b.request_id());
        assert!(a.last_error().is_none());
    }
}
