//! Stored-entry payload type and the headers/payload codec shared by the
//! persistent backends.
//!
//! Both backends persist an entry as two independent JSON strings, one for
//! the headers and one for the payload. The payload carries a discriminator
//! so that a stored byte sequence deserializes back into bytes rather than
//! text — structural fidelity the cache-hit path depends on when serving
//! binary responses.

use serde::{Deserialize, Serialize};

use crate::http::{Body, Chunk, Headers};

/// A cached response body.
///
/// # Examples
///
/// ```
/// use rendercache::cache::Payload;
///
/// let payload = Payload::Binary(vec![0xFF, 0x00]);
/// let json = serde_json::to_string(&payload).unwrap();
/// let back: Payload = serde_json::from_str(&json).unwrap();
/// assert_eq!(back, payload);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Payload {
    /// A textual body.
    Text(String),
    /// A raw byte body.
    Binary(Vec<u8>),
}

impl Payload {
    /// Returns `true` if the payload carries no data.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(s) => s.is_empty(),
            Self::Binary(b) => b.is_empty(),
        }
    }

    /// Returns the payload contents as a byte slice.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(s) => s.as_bytes(),
            Self::Binary(b) => b,
        }
    }

    /// Converts an accumulated body into a payload, or `None` when nothing
    /// was accumulated (an empty body is never cached).
    pub fn from_body(body: &Body) -> Option<Self> {
        match body {
            Body::Empty => None,
            Body::Text(s) => Some(Self::Text(s.clone())),
            Body::Binary(b) => Some(Self::Binary(b.to_vec())),
        }
    }

    /// Converts the payload back into a response body chunk for serving.
    pub fn into_chunk(self) -> Chunk {
        match self {
            Self::Text(s) => Chunk::Text(s),
            Self::Binary(b) => Chunk::Bytes(b.into()),
        }
    }
}

impl From<Payload> for Body {
    fn from(payload: Payload) -> Self {
        match payload {
            Payload::Text(s) => Body::from(s),
            Payload::Binary(b) => Body::from(b),
        }
    }
}

/// Serializes a `(headers, payload)` pair into the two JSON strings the
/// persistent backends store.
pub fn encode(
    headers: &Headers,
    payload: &Payload,
) -> Result<(String, String), serde_json::Error> {
    Ok((
        serde_json::to_string(headers)?,
        serde_json::to_string(payload)?,
    ))
}

/// Deserializes the stored JSON strings back into a `(headers, payload)`
/// pair. The pair is decoded as a unit: if either half is malformed the
/// whole entry is rejected.
pub fn decode(
    headers_json: &str,
    payload_json: &str,
) -> Result<(Headers, Payload), serde_json::Error> {
    Ok((
        serde_json::from_str(headers_json)?,
        serde_json::from_str(payload_json)?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_payload_round_trips_as_text() {
        let mut headers = Headers::new();
        headers.insert("Content-Type", "text/html");
        let payload = Payload::Text("<html></html>".into());

        let (h, p) = encode(&headers, &payload).unwrap();
        let (headers_back, payload_back) = decode(&h, &p).unwrap();

        assert_eq!(headers_back, headers);
        assert_eq!(payload_back, payload);
        assert!(matches!(payload_back, Payload::Text(_)));
    }

    #[test]
    fn binary_payload_round_trips_as_binary() {
        let headers = Headers::new();
        let payload = Payload::Binary(vec![0x00, 0xFF, 0x1F, 0x8B]);

        let (h, p) = encode(&headers, &payload).unwrap();
        let (_, payload_back) = decode(&h, &p).unwrap();

        assert!(matches!(payload_back, Payload::Binary(_)));
        assert_eq!(payload_back.as_bytes(), &[0x00, 0xFF, 0x1F, 0x8B]);
    }

    #[test]
    fn malformed_entry_is_rejected_as_a_unit() {
        let (h, _) = encode(&Headers::new(), &Payload::Text("x".into())).unwrap();
        assert!(decode(&h, "not json").is_err());
        assert!(decode("not json", "{\"kind\":\"text\",\"data\":\"x\"}").is_err());
    }

    #[test]
    fn body_conversion_preserves_representation() {
        let body: Body = Body::from("page".to_owned());
        let payload = Payload::from_body(&body).unwrap();
        assert_eq!(payload, Payload::Text("page".into()));

        let body: Body = Body::from(vec![1u8, 2, 3]);
        let payload = Payload::from_body(&body).unwrap();
        assert_eq!(payload, Payload::Binary(vec![1, 2, 3]));

        assert!(Payload::from_body(&Body::Empty).is_none());
    }
}
