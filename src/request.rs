//! The external request-handling capability.
//!
//! The core never interprets mailbox payloads itself -- it hands each
//! drained request off to a `RequestHandler`, the same way an
//! `ivshmem-server` deployment defers to whatever switch or control-plane
//! logic sits above the bare protocol.

use crate::mailbox::Mailbox;
use crate::notifier::Notifier;
use crate::peer::PeerId;

/// Given a requester's payload and the means to answer it, perform side
/// effects and optionally refill the mailbox and signal the requester back.
///
/// `responder_notifier` is the descriptor the server uses to wake the
/// requesting peer once a response has been placed in its slot.
pub trait RequestHandler {
    fn handle(
        &mut self,
        payload: &[u8],
        requester_id: PeerId,
        server_id: PeerId,
        responder_notifier: &Notifier,
        mailbox: &Mailbox,
    );
}

/// The default request handler: answers a literal `ping` payload with
/// `PONG`, written into the server's own mailbox slot and signalled back to
/// the requester. Anything else is logged and dropped -- no payload ever
/// propagates an error back across the wire.
#[derive(Debug, Default)]
pub struct PingPongHandler;

impl RequestHandler for PingPongHandler {
    fn handle(
        &mut self,
        payload: &[u8],
        requester_id: PeerId,
        server_id: PeerId,
        responder_notifier: &Notifier,
        mailbox: &Mailbox,
    ) {
        if payload == b"ping" {
            if let Err(err) = mailbox.fill(server_id, "Z-server", b"PONG") {
                log::warn!("famez-hub: PONG reply to peer {requester_id} truncated: {err}");
            }
            if let Err(err) = responder_notifier.signal(1) {
                log::warn!("famez-hub: failed to signal peer {requester_id} back: {err}");
            }
        } else {
            log::debug!(
                "famez-hub: unrecognized request from peer {requester_id} ({} bytes), dropping",
                payload.len()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::PeerId;

    fn unique_name(tag: &str) -> String {
        format!("/famez-hub-test-request-{tag}-{}", std::process::id())
    }

    #[test]
    fn ping_pong_handler_writes_pong_and_signals() {
        let name = unique_name("pingpong");
        let mailbox = Mailbox::open_or_create(&name, 4).unwrap();
        let notifier = Notifier::create().unwrap();
        let server_id = PeerId(3);

        let mut handler = PingPongHandler;
        handler.handle(b"ping", PeerId(1), server_id, &notifier, &mailbox);

        let (name_written, message) = mailbox.retrieve(server_id);
        assert_eq!(name_written, "Z-server");
        assert_eq!(message, b"PONG");
        assert_eq!(notifier.drain().unwrap(), Some(1));

        unsafe {
            libc::shm_unlink(std::ffi::CString::new(name).unwrap().as_ptr());
        }
    }

    #[test]
    fn unrecognized_payload_is_dropped_without_signalling() {
        let name = unique_name("unknown");
        let mailbox = Mailbox::open_or_create(&name, 4).unwrap();
        let notifier = Notifier::create().unwrap();

        let mut handler = PingPongHandler;
        handler.handle(b"something-else", PeerId(1), PeerId(3), &notifier, &mailbox);

        assert_eq!(notifier.drain().unwrap(), None);

        unsafe {
            libc::shm_unlink(std::ffi::CString::new(name).unwrap().as_ptr());
        }
    }
}
