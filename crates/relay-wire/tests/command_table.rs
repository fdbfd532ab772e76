use relay_wire::{Request, Response};

// Each malformed line must map to exactly one ERROR response line, and the
// mapping is part of the wire contract.
#[test]
fn error_lines_match_wire_codes() {
    let vectors: &[(&[u8], &[u8])] = &[
        (b"", b"ERROR:EMPTY_MESSAGE\n"),
        (b"PUBLISH:t", b"ERROR:INVALID_FORMAT\n"),
        (b"PUBLISH:", b"ERROR:INVALID_FORMAT\n"),
        (b"PUBLISH::payload", b"ERROR:EMPTY_TOPIC\n"),
        (b"SUBSCRIBE:", b"ERROR:EMPTY_TOPIC\n"),
        (b"UNSUBSCRIBE:", b"ERROR:EMPTY_TOPIC\n"),
        (b"SUBSCRIBE:a:b", b"ERROR:INVALID_FORMAT\n"),
        (b"SUBSCRIBE", b"ERROR:UNKNOWN_COMMAND\n"),
        (b"UNSUBSCRIBE", b"ERROR:UNKNOWN_COMMAND\n"),
        (b"NOPE", b"ERROR:UNKNOWN_COMMAND\n"),
    ];
    for (line, expected) in vectors {
        let err = Request::parse(line).expect_err("line must be rejected");
        assert_eq!(
            Response::Error(err).encode().as_ref(),
            *expected,
            "wrong error line for {:?}",
            String::from_utf8_lossy(line)
        );
    }
}

// Valid lines from the command table parse to the expected request and the
// matching acknowledgement encodes to the expected line.
#[test]
fn command_acks_round_trip() {
    let request = Request::parse(b"SUBSCRIBE:alerts").expect("parse");
    let Request::Subscribe { topic } = request else {
        panic!("expected subscribe");
    };
    assert_eq!(
        Response::Subscribed(topic).encode().as_ref(),
        b"OK:SUBSCRIBED:alerts\n"
    );

    let request = Request::parse(b"UNSUBSCRIBE:alerts").expect("parse");
    let Request::Unsubscribe { topic } = request else {
        panic!("expected unsubscribe");
    };
    assert_eq!(
        Response::Unsubscribed(topic).encode().as_ref(),
        b"OK:UNSUBSCRIBED:alerts\n"
    );
}
