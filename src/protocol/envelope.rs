//! Envelope codec.
//!
//! Converts between the protobuf wire form in [`super::message`] and the
//! typed [`Envelope`] used by the rest of the crate.

use std::collections::HashMap;

use bytes::Bytes;
use prost::Message;

use crate::error::ProtocolError;
use crate::protocol::message::{
    MessageType, WebSocketMessage, WebSocketRequestMessage, WebSocketResponseMessage,
};

/// Largest id representable on the wire (63 bits).
pub const MAX_REQUEST_ID: u64 = i64::MAX as u64;

/// One framed protocol unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    Request(RequestMessage),
    Response(ResponseMessage),
    /// Framed but unrecognised traffic. Produced only by [`decode`].
    Unknown,
}

/// An HTTP-like request carried over the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestMessage {
    pub verb: String,
    pub path: String,
    /// Raw `"Name: value"` lines, duplicates and order preserved.
    pub headers: Vec<String>,
    pub body: Option<Bytes>,
    /// Absent for fire-and-forget requests.
    pub id: Option<u64>,
}

/// The answer to a [`RequestMessage`] with a matching `id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseMessage {
    pub id: u64,
    pub status: i32,
    pub message: String,
    pub headers: Vec<String>,
    pub body: Option<Bytes>,
}

impl RequestMessage {
    pub fn new(verb: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            verb: verb.into(),
            path: path.into(),
            headers: Vec::new(),
            body: None,
            id: None,
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push(format!("{}: {}", name, value));
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_id(mut self, id: u64) -> Self {
        self.id = Some(id);
        self
    }

    /// First value of the named header, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn header_map(&self) -> HashMap<String, String> {
        header_map(&self.headers)
    }

    /// True when the sender expects a response.
    pub fn expects_response(&self) -> bool {
        self.id.is_some()
    }
}

impl ResponseMessage {
    pub fn new(id: u64, status: i32, message: impl Into<String>) -> Self {
        Self {
            id,
            status,
            message: message.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push(format!("{}: {}", name, value));
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn header_map(&self) -> HashMap<String, String> {
        header_map(&self.headers)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

impl Envelope {
    pub fn encode(&self) -> Bytes {
        encode(self)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        decode(buf)
    }
}

/// Encode an envelope into its wire form.
pub fn encode(envelope: &Envelope) -> Bytes {
    let message = match envelope {
        Envelope::Request(request) => WebSocketMessage {
            r#type: Some(MessageType::Request as i32),
            request: Some(WebSocketRequestMessage {
                verb: Some(request.verb.clone()),
                path: Some(request.path.clone()),
                body: request.body.clone(),
                headers: request.headers.clone(),
                id: request.id,
            }),
            response: None,
        },
        Envelope::Response(response) => WebSocketMessage {
            r#type: Some(MessageType::Response as i32),
            request: None,
            response: Some(WebSocketResponseMessage {
                id: Some(response.id),
                status: Some(response.status),
                message: Some(response.message.clone()),
                headers: response.headers.clone(),
                body: response.body.clone(),
            }),
        },
        Envelope::Unknown => WebSocketMessage {
            r#type: Some(MessageType::Unknown as i32),
            request: None,
            response: None,
        },
    };
    Bytes::from(message.encode_to_vec())
}

/// Decode one frame.
///
/// Empty or truncated buffers fail with [`ProtocolError::InvalidMessage`];
/// an unrecognised discriminator yields [`Envelope::Unknown`].
pub fn decode(buf: &[u8]) -> Result<Envelope, ProtocolError> {
    if buf.is_empty() {
        return Err(ProtocolError::invalid("empty frame"));
    }

    let message =
        WebSocketMessage::decode(buf).map_err(|e| ProtocolError::invalid(e.to_string()))?;

    let kind = message.r#type.and_then(|raw| MessageType::try_from(raw).ok());
    match kind {
        Some(MessageType::Request) => {
            let request = message
                .request
                .ok_or_else(|| ProtocolError::invalid("request envelope without request"))?;
            decode_request(request).map(Envelope::Request)
        }
        Some(MessageType::Response) => {
            let response = message
                .response
                .ok_or_else(|| ProtocolError::invalid("response envelope without response"))?;
            decode_response(response).map(Envelope::Response)
        }
        Some(MessageType::Unknown) | None => Ok(Envelope::Unknown),
    }
}

fn decode_request(wire: WebSocketRequestMessage) -> Result<RequestMessage, ProtocolError> {
    let verb = wire
        .verb
        .ok_or_else(|| ProtocolError::invalid("request without verb"))?;
    let path = wire
        .path
        .ok_or_else(|| ProtocolError::invalid("request without path"))?;
    if let Some(id) = wire.id {
        check_id(id)?;
    }

    Ok(RequestMessage {
        verb,
        path,
        headers: wire.headers,
        body: wire.body,
        id: wire.id,
    })
}

fn decode_response(wire: WebSocketResponseMessage) -> Result<ResponseMessage, ProtocolError> {
    let id = wire
        .id
        .ok_or_else(|| ProtocolError::invalid("response without id"))?;
    check_id(id)?;
    let status = wire
        .status
        .ok_or_else(|| ProtocolError::invalid("response without status"))?;

    Ok(ResponseMessage {
        id,
        status,
        message: wire.message.unwrap_or_default(),
        headers: wire.headers,
        body: wire.body,
    })
}

fn check_id(id: u64) -> Result<(), ProtocolError> {
    if id > MAX_REQUEST_ID {
        return Err(ProtocolError::invalid(format!("request id {} exceeds 63 bits", id)));
    }
    Ok(())
}

/// Split a `"Name: value"` line on its first colon.
pub fn parse_header_line(line: &str) -> Option<(&str, &str)> {
    match line.split_once(':') {
        Some((name, value)) => Some((name.trim(), value.trim())),
        None => {
            tracing::trace!(line = %line, "Ignoring header line without ':'");
            None
        }
    }
}

/// Lookup map keyed by lower-cased header name. The first occurrence of a
/// name wins.
pub fn header_map(lines: &[String]) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in lines {
        if let Some((name, value)) = parse_header_line(line) {
            map.entry(name.to_ascii_lowercase())
                .or_insert_with(|| value.to_string());
        }
    }
    map
}

fn find_header<'a>(lines: &'a [String], name: &str) -> Option<&'a str> {
    lines
        .iter()
        .filter_map(|line| parse_header_line(line))
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> RequestMessage {
        RequestMessage::new("PUT", "/v1/messages")
            .with_header("Content-Type", "application/json")
            .with_header("X-Trace", "a")
            .with_header("X-Trace", "b")
            .with_body(&b"{\"k\":1}"[..])
            .with_id(42)
    }

    #[test]
    fn request_round_trip() {
        let envelope = Envelope::Request(sample_request());
        assert_eq!(decode(&encode(&envelope)).unwrap(), envelope);
    }

    #[test]
    fn response_round_trip_with_empty_body() {
        let envelope = Envelope::Response(ResponseMessage::new(0, 204, "No Content").with_body(Bytes::new()));
        let decoded = decode(&encode(&envelope)).unwrap();
        assert_eq!(decoded, envelope);
        match decoded {
            Envelope::Response(r) => assert_eq!(r.body, Some(Bytes::new())),
            other => panic!("expected response, got {:?}", other),
        }
    }

    #[test]
    fn unknown_round_trip() {
        assert_eq!(decode(&encode(&Envelope::Unknown)).unwrap(), Envelope::Unknown);
    }

    #[test]
    fn absent_id_is_omitted_on_the_wire() {
        let request = RequestMessage::new("PUT", "/v1/queue/empty");
        let bytes = encode(&Envelope::Request(request));
        let wire = WebSocketMessage::decode(bytes.as_ref()).unwrap();
        assert_eq!(wire.request.unwrap().id, None);
    }

    #[test]
    fn zero_id_is_preserved() {
        let request = RequestMessage::new("GET", "/").with_id(0);
        match decode(&encode(&Envelope::Request(request))).unwrap() {
            Envelope::Request(r) => assert_eq!(r.id, Some(0)),
            other => panic!("expected request, got {:?}", other),
        }
    }

    #[test]
    fn empty_buffer_is_invalid() {
        assert!(matches!(decode(&[]), Err(ProtocolError::InvalidMessage(_))));
    }

    #[test]
    fn truncated_buffer_is_invalid() {
        let bytes = encode(&Envelope::Request(sample_request()));
        let truncated = &bytes[..bytes.len() - 3];
        assert!(matches!(decode(truncated), Err(ProtocolError::InvalidMessage(_))));
    }

    #[test]
    fn unrecognised_discriminator_is_unknown() {
        let wire = WebSocketMessage {
            r#type: Some(9),
            request: None,
            response: None,
        };
        assert_eq!(decode(&wire.encode_to_vec()).unwrap(), Envelope::Unknown);
    }

    #[test]
    fn missing_discriminator_is_unknown() {
        let wire = WebSocketMessage {
            r#type: None,
            request: Some(WebSocketRequestMessage {
                verb: Some("GET".into()),
                path: Some("/".into()),
                ..Default::default()
            }),
            response: None,
        };
        assert_eq!(decode(&wire.encode_to_vec()).unwrap(), Envelope::Unknown);
    }

    #[test]
    fn request_type_without_payload_is_invalid() {
        let wire = WebSocketMessage {
            r#type: Some(MessageType::Request as i32),
            request: None,
            response: None,
        };
        assert!(matches!(
            decode(&wire.encode_to_vec()),
            Err(ProtocolError::InvalidMessage(_))
        ));
    }

    #[test]
    fn oversized_id_is_invalid() {
        let wire = WebSocketMessage {
            r#type: Some(MessageType::Response as i32),
            request: None,
            response: Some(WebSocketResponseMessage {
                id: Some(u64::MAX),
                status: Some(200),
                ..Default::default()
            }),
        };
        assert!(matches!(
            decode(&wire.encode_to_vec()),
            Err(ProtocolError::InvalidMessage(_))
        ));
    }

    #[test]
    fn header_lookup() {
        let mut request = sample_request().with_header("malformed", "x");
        request.headers.push("no colon here".to_string());

        assert_eq!(request.header("content-type"), Some("application/json"));
        assert_eq!(request.header("x-trace"), Some("a"));
        assert_eq!(request.header("missing"), None);

        let map = request.header_map();
        assert_eq!(map.get("x-trace").map(String::as_str), Some("a"));
        assert_eq!(map.len(), 3);
    }

    #[test]
    fn header_value_keeps_later_colons() {
        assert_eq!(
            parse_header_line("Location: http://example.com:8080/"),
            Some(("Location", "http://example.com:8080/"))
        );
    }
}
