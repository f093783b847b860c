//! Request body decoding and response encoding.

use bytes::Bytes;
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::Error;

pub const JSON: &str = "application/json";
pub const FORM: &str = "application/x-www-form-urlencoded";

/// Decoder/encoder pair attached to every request.
#[derive(Debug, Clone, Copy, Default)]
pub struct Codec;

impl Codec {
    /// Decode `body` according to `content_type`.
    ///
    /// Form bodies decode through a JSON object of string fields, so the
    /// target type sees the same shape either way.
    pub fn decode<T: DeserializeOwned>(
        &self,
        content_type: Option<&str>,
        body: &[u8],
    ) -> Result<T, Error> {
        match content_type.map(media_type) {
            Some(FORM) => self.decode_fields(&parse_urlencoded(&String::from_utf8_lossy(body))),
            Some(JSON) | None => serde_json::from_slice(body).map_err(Error::decode),
            Some(other) => Err(Error::decode(format!("unsupported content type '{}'", other))),
        }
    }

    pub fn decode_fields<T: DeserializeOwned>(
        &self,
        fields: &IndexMap<String, String>,
    ) -> Result<T, Error> {
        let object: Map<String, Value> = fields
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        serde_json::from_value(Value::Object(object)).map_err(Error::decode)
    }

    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Bytes, Error> {
        Ok(Bytes::from(serde_json::to_vec(value)?))
    }
}

/// `text/html; charset=utf-8` -> `text/html`
pub fn media_type(content_type: &str) -> &str {
    content_type
        .split(';')
        .next()
        .unwrap_or(content_type)
        .trim()
}

/// Parse `a=1&b=two+words` style input. Later keys win.
pub fn parse_urlencoded(input: &str) -> IndexMap<String, String> {
    let mut result = IndexMap::new();
    if input.is_empty() {
        return result;
    }

    for pair in input.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        result.insert(decode_component(key), decode_component(value));
    }

    result
}

fn decode_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    match urlencoding::decode(&spaced) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => spaced,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Signup {
        email: String,
        plan: String,
    }

    #[test]
    fn test_parse_urlencoded() {
        let q = parse_urlencoded("q=hello+world&tag=a%26b&flag&q=again");
        assert_eq!(q.get("q").map(String::as_str), Some("again"));
        assert_eq!(q.get("tag").map(String::as_str), Some("a&b"));
        assert_eq!(q.get("flag").map(String::as_str), Some(""));
        assert!(parse_urlencoded("").is_empty());
    }

    #[test]
    fn test_decode_json_and_form() {
        let codec = Codec;
        let json: Signup = codec
            .decode(Some("application/json"), br#"{"email":"a@b.c","plan":"pro"}"#)
            .unwrap();
        let form: Signup = codec
            .decode(
                Some("application/x-www-form-urlencoded; charset=utf-8"),
                b"email=a%40b.c&plan=pro",
            )
            .unwrap();
        assert_eq!(json, form);
    }

    #[test]
    fn test_decode_errors_are_bad_requests() {
        let err = Codec.decode::<Signup>(Some(JSON), b"{").unwrap_err();
        assert_eq!(err.status(), hyper::StatusCode::BAD_REQUEST);
        let err = Codec.decode::<Signup>(Some("text/csv"), b"").unwrap_err();
        assert!(err.to_string().contains("text/csv"));
    }
}
