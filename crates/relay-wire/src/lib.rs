// Line-oriented wire protocol for the relay broker.
//
// Inbound command lines and outbound response/delivery frames are ASCII,
// LF-terminated, with fields separated by a colon. Parsing and formatting are
// pure; framing (splitting the byte stream at LF) is the transport's job.
use bytes::{BufMut, Bytes, BytesMut};

pub type Result<T> = std::result::Result<T, Error>;

/// Protocol errors reported back to the client as `ERROR:<CODE>` lines.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("empty message")]
    EmptyMessage,
    #[error("invalid format")]
    InvalidFormat,
    #[error("empty topic")]
    EmptyTopic,
    #[error("unknown command")]
    UnknownCommand,
}

impl Error {
    // Wire code carried in the ERROR response line.
    pub fn code(&self) -> &'static str {
        match self {
            Error::EmptyMessage => "EMPTY_MESSAGE",
            Error::InvalidFormat => "INVALID_FORMAT",
            Error::EmptyTopic => "EMPTY_TOPIC",
            Error::UnknownCommand => "UNKNOWN_COMMAND",
        }
    }
}

const PUBLISH_PREFIX: &[u8] = b"PUBLISH:";
const SUBSCRIBE_PREFIX: &[u8] = b"SUBSCRIBE:";
const UNSUBSCRIBE_PREFIX: &[u8] = b"UNSUBSCRIBE:";

/// One parsed command line.
///
/// ```
/// use relay_wire::Request;
///
/// let request = Request::parse(b"PUBLISH:metrics:cpu=0.93").expect("parse");
/// assert_eq!(
///     request,
///     Request::Publish {
///         topic: "metrics".into(),
///         payload: "cpu=0.93".into(),
///     }
/// );
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Publish { topic: Bytes, payload: Bytes },
    Subscribe { topic: Bytes },
    Unsubscribe { topic: Bytes },
    Ping,
}

impl Request {
    /// Parse one command line. `line` excludes the terminating LF; a trailing
    /// CR is tolerated and stripped.
    pub fn parse(line: &[u8]) -> Result<Request> {
        let line = match line {
            [head @ .., b'\r'] => head,
            _ => line,
        };
        if line.is_empty() {
            return Err(Error::EmptyMessage);
        }
        if let Some(rest) = line.strip_prefix(PUBLISH_PREFIX) {
            // Topic runs to the first colon after the prefix; everything past
            // that colon is payload, further colons included.
            let split = rest
                .iter()
                .position(|&b| b == b':')
                .ok_or(Error::InvalidFormat)?;
            let (topic, payload) = (&rest[..split], &rest[split + 1..]);
            if topic.is_empty() {
                return Err(Error::EmptyTopic);
            }
            return Ok(Request::Publish {
                topic: Bytes::copy_from_slice(topic),
                payload: Bytes::copy_from_slice(payload),
            });
        }
        // UNSUBSCRIBE is checked ahead of SUBSCRIBE so the shared suffix of
        // the two command names can never misclassify a line.
        if let Some(topic) = line.strip_prefix(UNSUBSCRIBE_PREFIX) {
            return Ok(Request::Unsubscribe {
                topic: parse_topic(topic)?,
            });
        }
        if let Some(topic) = line.strip_prefix(SUBSCRIBE_PREFIX) {
            return Ok(Request::Subscribe {
                topic: parse_topic(topic)?,
            });
        }
        if line.starts_with(b"PING") {
            return Ok(Request::Ping);
        }
        Err(Error::UnknownCommand)
    }
}

// Topic names are opaque byte strings, but the field delimiter must not
// appear in one; reject at parse time rather than routing on a name that can
// never round-trip.
fn parse_topic(topic: &[u8]) -> Result<Bytes> {
    if topic.is_empty() {
        return Err(Error::EmptyTopic);
    }
    if topic.contains(&b':') {
        return Err(Error::InvalidFormat);
    }
    Ok(Bytes::copy_from_slice(topic))
}

/// One outbound response line. Every command receives exactly one of these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Published,
    Subscribed(Bytes),
    Unsubscribed(Bytes),
    Pong,
    Error(Error),
}

impl Response {
    pub fn encode(&self) -> Bytes {
        match self {
            Response::Published => Bytes::from_static(b"OK:PUBLISHED\n"),
            Response::Subscribed(topic) => ack_frame(b"OK:SUBSCRIBED:", topic),
            Response::Unsubscribed(topic) => ack_frame(b"OK:UNSUBSCRIBED:", topic),
            Response::Pong => Bytes::from_static(b"PONG\n"),
            Response::Error(err) => {
                let code = err.code();
                let mut buf = BytesMut::with_capacity(b"ERROR:".len() + code.len() + 1);
                buf.put_slice(b"ERROR:");
                buf.put_slice(code.as_bytes());
                buf.put_u8(b'\n');
                buf.freeze()
            }
        }
    }
}

fn ack_frame(prefix: &[u8], topic: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(prefix.len() + topic.len() + 1);
    buf.put_slice(prefix);
    buf.put_slice(topic);
    buf.put_u8(b'\n');
    buf.freeze()
}

/// Format the fan-out frame sent to each subscriber of a published topic.
///
/// ```
/// let frame = relay_wire::delivery_frame(b"logs", b"ready");
/// assert_eq!(frame.as_ref(), b"MESSAGE:logs:ready\n");
/// ```
pub fn delivery_frame(topic: &[u8], payload: &[u8]) -> Bytes {
    const PREFIX: &[u8] = b"MESSAGE:";
    let mut buf = BytesMut::with_capacity(PREFIX.len() + topic.len() + 1 + payload.len() + 1);
    buf.put_slice(PREFIX);
    buf.put_slice(topic);
    buf.put_u8(b':');
    buf.put_slice(payload);
    buf.put_u8(b'\n');
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_publish_with_payload_colons() {
        // Only the first colon after the prefix delimits topic from payload.
        let request = Request::parse(b"PUBLISH:t:a:b:c").expect("parse");
        assert_eq!(
            request,
            Request::Publish {
                topic: "t".into(),
                payload: "a:b:c".into(),
            }
        );
    }

    #[test]
    fn parses_publish_with_empty_payload() {
        let request = Request::parse(b"PUBLISH:t:").expect("parse");
        assert_eq!(
            request,
            Request::Publish {
                topic: "t".into(),
                payload: Bytes::new(),
            }
        );
    }

    #[test]
    fn publish_without_second_colon_is_invalid() {
        let err = Request::parse(b"PUBLISH:t").expect_err("no payload delimiter");
        assert!(matches!(err, Error::InvalidFormat));
    }

    #[test]
    fn publish_with_empty_topic_is_rejected() {
        let err = Request::parse(b"PUBLISH::x").expect_err("empty topic");
        assert!(matches!(err, Error::EmptyTopic));
    }

    #[test]
    fn parses_subscribe_and_unsubscribe() {
        assert_eq!(
            Request::parse(b"SUBSCRIBE:ch").expect("parse"),
            Request::Subscribe { topic: "ch".into() }
        );
        assert_eq!(
            Request::parse(b"UNSUBSCRIBE:ch").expect("parse"),
            Request::Unsubscribe { topic: "ch".into() }
        );
    }

    #[test]
    fn subscribe_with_empty_topic_is_rejected() {
        let err = Request::parse(b"SUBSCRIBE:").expect_err("empty topic");
        assert!(matches!(err, Error::EmptyTopic));
        let err = Request::parse(b"UNSUBSCRIBE:").expect_err("empty topic");
        assert!(matches!(err, Error::EmptyTopic));
    }

    #[test]
    fn subscribe_topic_with_delimiter_is_rejected() {
        let err = Request::parse(b"SUBSCRIBE:a:b").expect_err("delimiter in topic");
        assert!(matches!(err, Error::InvalidFormat));
    }

    #[test]
    fn ping_ignores_trailing_bytes() {
        assert_eq!(Request::parse(b"PING").expect("parse"), Request::Ping);
        assert_eq!(Request::parse(b"PING anything").expect("parse"), Request::Ping);
    }

    #[test]
    fn trailing_cr_is_stripped() {
        assert_eq!(
            Request::parse(b"SUBSCRIBE:ch\r").expect("parse"),
            Request::Subscribe { topic: "ch".into() }
        );
    }

    #[test]
    fn empty_line_is_rejected() {
        let err = Request::parse(b"").expect_err("empty line");
        assert!(matches!(err, Error::EmptyMessage));
        // A bare CR frames as an empty line too.
        let err = Request::parse(b"\r").expect_err("bare cr");
        assert!(matches!(err, Error::EmptyMessage));
    }

    #[test]
    fn unknown_command_is_rejected() {
        let err = Request::parse(b"HELLO:world").expect_err("unknown");
        assert!(matches!(err, Error::UnknownCommand));
        // Case-sensitive: lowercase commands are not recognized.
        let err = Request::parse(b"publish:t:p").expect_err("lowercase");
        assert!(matches!(err, Error::UnknownCommand));
    }

    #[test]
    fn responses_encode_expected_lines() {
        assert_eq!(Response::Published.encode().as_ref(), b"OK:PUBLISHED\n");
        assert_eq!(
            Response::Subscribed("ch".into()).encode().as_ref(),
            b"OK:SUBSCRIBED:ch\n"
        );
        assert_eq!(
            Response::Unsubscribed("ch".into()).encode().as_ref(),
            b"OK:UNSUBSCRIBED:ch\n"
        );
        assert_eq!(Response::Pong.encode().as_ref(), b"PONG\n");
        assert_eq!(
            Response::Error(Error::UnknownCommand).encode().as_ref(),
            b"ERROR:UNKNOWN_COMMAND\n"
        );
    }

    #[test]
    fn delivery_frame_carries_empty_payload() {
        assert_eq!(delivery_frame(b"t", b"").as_ref(), b"MESSAGE:t:\n");
    }
}
