#![allow(clippy::unwrap_used)]

//! Property tests for the real-time frame codec and send validation.
//!
//! 1. Arbitrary text never panics the decoder.
//! 2. A send frame keeps its correlation id and body exactly.
//! 3. Whitespace-only bodies are always rejected, and so are bodies over the
//!    size limit.

use courier_proto::frame::{self, ClientFrame, ServerFrame};
use courier_proto::message::{Identity, ValidationError, validate_send};
use proptest::prelude::*;

proptest! {
    #[test]
    fn decode_never_panics(text in ".{0,256}") {
        let _ = frame::decode::<ClientFrame>(&text);
        let _ = frame::decode::<ServerFrame>(&text);
    }

    #[test]
    fn send_frame_preserves_correlation_and_body(
        request_id in any::<u64>(),
        receiver in "[a-z]{1,16}",
        body in "\\PC{1,512}",
    ) {
        let sent = ClientFrame::SendMessage {
            request_id,
            receiver: Identity::new(receiver),
            body,
        };
        let text = frame::encode(&sent).unwrap();
        prop_assert!(text.contains("\"send-message\""));
        let back: ClientFrame = frame::decode(&text).unwrap();
        prop_assert_eq!(back, sent);
    }

    #[test]
    fn blank_bodies_rejected(body in "[ \t\r\n]{0,32}") {
        prop_assert_eq!(
            validate_send(&Identity::new("bob"), &body, 1024),
            Err(ValidationError::EmptyBody)
        );
    }

    #[test]
    fn oversized_bodies_rejected(extra in 1usize..64) {
        let max = 128;
        let body = "x".repeat(max + extra);
        let rejected = matches!(
            validate_send(&Identity::new("bob"), &body, max),
            Err(ValidationError::TooLarge { size, max: 128 }) if size == max + extra
        );
        prop_assert!(rejected);
    }
}
