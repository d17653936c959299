//! The handshake and disconnect lifecycles: the fixed descriptor-exchange
//! script a newly accepted connection is driven through, and the teardown
//! that runs when a peer goes away.
//!
//! These are free functions over `&Registry`/`&Mailbox` rather than methods
//! on `Server` so the strict step ordering reads top-to-bottom without the
//! reactor's bookkeeping in the way -- the same separation
//! `ivshmem_twisted`'s `connectionMade`/`connectionLost` draw between "the
//! script" and "the factory holding the socket".

use crate::channel::{self, FD_CARRIER};
use crate::config::ServerConfig;
use crate::error::HubResult;
use crate::mailbox::Mailbox;
use crate::notifier::Notifier;
use crate::peer::{Peer, PeerId};
use crate::registry::Registry;

/// The server's advertised ivshmem protocol version. Clients that receive
/// anything else during the initial triplet treat it as a hard mismatch.
pub const SERVER_IVSHMEM_PROTOCOL_VERSION: i64 = 0;

/// Step 3: reject a connection because the registry is at capacity.
///
/// Sends the abort frame (`-1`, no fd) and returns; the caller is
/// responsible for closing the transport afterwards.
pub fn reject_for_capacity(socket: &std::os::unix::net::UnixStream) -> HubResult<()> {
    channel::send(socket, FD_CARRIER, None)
}

/// Steps 5a-5c: the initial-info triplet, sent in fixed order.
pub fn send_initial_info(peer: &Peer, mailbox: &Mailbox) -> HubResult<()> {
    channel::send(peer.socket(), SERVER_IVSHMEM_PROTOCOL_VERSION, None)?;
    channel::send(peer.socket(), peer.id().0, None)?;
    channel::send(peer.socket(), FD_CARRIER, Some(mailbox.fd()))?;
    Ok(())
}

/// Step 6: advertise the new peer to every peer already in the registry.
/// Skipped entirely when the new peer is a recycled reconnect.
///
/// A write failure here is a fault in an *existing* peer's transport (a full
/// send buffer, a peer that died without the server noticing yet), not in
/// the newcomer's -- it must never abort the newcomer's own admission. Each
/// broken existing peer is logged, skipped, and its id collected for the
/// caller to tear down through the normal disconnect path; the broadcast
/// continues to every other peer regardless.
pub fn advertise_new_peer_to_others(registry: &Registry, new_peer: &Peer) -> Vec<PeerId> {
    let mut broken = Vec::new();
    for existing in registry.all() {
        for notifier in new_peer.notifiers() {
            if let Err(e) =
                channel::send(existing.socket(), new_peer.id().0, Some(notifier.transmittable_fd()))
            {
                log::warn!(
                    "famez-hub: advertising peer {} to peer {} failed, disconnecting {}: {e}",
                    new_peer.id(),
                    existing.id(),
                    existing.id()
                );
                broken.push(existing.id());
                break;
            }
        }
    }
    broken
}

/// Step 7: advertise every other peer already in the registry to the new peer.
pub fn advertise_others_to_new_peer(registry: &Registry, new_peer: &Peer) -> HubResult<()> {
    for existing in registry.all() {
        for notifier in existing.notifiers() {
            channel::send(new_peer.socket(), existing.id().0, Some(notifier.transmittable_fd()))?;
        }
    }
    Ok(())
}

/// Step 8: advertise the server's own pseudo-peer to the new peer. Only
/// called when the server is not in silent mode.
pub fn advertise_server_to_new_peer(
    server_id: PeerId,
    server_notifiers: &[Notifier],
    new_peer: &Peer,
) -> HubResult<()> {
    for notifier in server_notifiers {
        channel::send(new_peer.socket(), server_id.0, Some(notifier.transmittable_fd()))?;
    }
    Ok(())
}

/// Step 9: advertise the new peer to itself -- the sentinel batch. The
/// receipt of an fd whose embedded id equals the peer's own id (step 5b)
/// is the client-side signal that the handshake is complete.
pub fn advertise_new_peer_to_self(new_peer: &Peer) -> HubResult<()> {
    for notifier in new_peer.notifiers() {
        channel::send(new_peer.socket(), new_peer.id().0, Some(notifier.transmittable_fd()))?;
    }
    Ok(())
}

/// Drive a newly accepted, non-rejected peer through steps 5-9 of the
/// handshake. `recycled` skips step 6 (the peer was already advertised to
/// everyone else on its first connection).
///
/// Returns the ids of any already-admitted peers whose transport broke
/// during step 6 -- the caller must tear those down through the normal
/// disconnect path. A failure writing to `new_peer` itself (steps 5, 7, 8,
/// 9) is the newcomer's own fault and is propagated as `Err` instead,
/// aborting its admission.
pub fn run_handshake(
    config: &ServerConfig,
    registry: &Registry,
    mailbox: &Mailbox,
    server_notifiers: Option<&[Notifier]>,
    new_peer: &Peer,
    recycled: bool,
) -> HubResult<Vec<PeerId>> {
    send_initial_info(new_peer, mailbox)?;

    let broken_peers = if recycled {
        Vec::new()
    } else {
        advertise_new_peer_to_others(registry, new_peer)
    };

    advertise_others_to_new_peer(registry, new_peer)?;

    if let Some(server_notifiers) = server_notifiers {
        advertise_server_to_new_peer(config.server_id(), server_notifiers, new_peer)?;
    }

    advertise_new_peer_to_self(new_peer)?;

    Ok(broken_peers)
}

/// Whether a disconnect looked clean (peer closed gracefully, read
/// returned EOF) or dirty (reset, I/O error).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectKind {
    Clean,
    Dirty,
}

/// Steps 1-7 of the disconnect lifecycle for an already-removed peer: tell
/// the remaining peers it's gone (unless recycling), destroy its notifiers
/// (by dropping it), and clear its mailbox slot.
///
/// The peer must already have been removed from the registry by the caller;
/// this only handles the broadcast, the mailbox clear, and deciding whether
/// to park the record for recycling.
pub fn disconnect(
    registry: &mut Registry,
    mailbox: &Mailbox,
    peer: Peer,
    kind: DisconnectKind,
    recycle: bool,
) -> HubResult<()> {
    log::info!(
        "famez-hub: {} disconnect from peer {}",
        if kind == DisconnectKind::Clean { "clean" } else { "dirty" },
        peer.id()
    );

    if recycle {
        registry.recycle(peer);
        return Ok(());
    }

    let dead_id = peer.id();
    for remaining in registry.all() {
        channel::send(remaining.socket(), dead_id.0, None)?;
    }

    mailbox.clear_slot(dead_id);
    // `peer` drops here, closing its transport and its notifier vector.
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel;
    use std::os::unix::net::UnixStream;

    fn make_peer(id: PeerId, n_notifiers: usize) -> (Peer, UnixStream) {
        let (server_side, client_side) = UnixStream::pair().unwrap();
        let notifiers = (0..n_notifiers).map(|_| Notifier::create().unwrap()).collect();
        (Peer::new(id, server_side, notifiers), client_side)
    }

    #[test]
    fn initial_info_triplet_is_sent_in_order() {
        let name = format!("/famez-hub-test-initinfo-{}", std::process::id());
        let mailbox = Mailbox::open_or_create(&name, 4).unwrap();
        let (peer, client) = make_peer(PeerId(1), 4);

        send_initial_info(&peer, &mailbox).unwrap();

        let (v, fd) = channel::recv(&client).unwrap();
        assert_eq!(v, SERVER_IVSHMEM_PROTOCOL_VERSION);
        assert!(fd.is_none());

        let (v, fd) = channel::recv(&client).unwrap();
        assert_eq!(v, 1);
        assert!(fd.is_none());

        let (v, fd) = channel::recv(&client).unwrap();
        assert_eq!(v, FD_CARRIER);
        assert!(fd.is_some());
        unsafe {
            libc::close(fd.unwrap());
        }

        unsafe {
            libc::shm_unlink(std::ffi::CString::new(name).unwrap().as_ptr());
        }
    }

    #[test]
    fn sentinel_batch_carries_new_peers_own_id() {
        let (peer, client) = make_peer(PeerId(2), 3);
        advertise_new_peer_to_self(&peer).unwrap();

        for _ in 0..3 {
            let (v, fd) = channel::recv(&client).unwrap();
            assert_eq!(v, 2);
            assert!(fd.is_some());
            unsafe {
                libc::close(fd.unwrap());
            }
        }
    }

    #[test]
    fn broken_existing_peer_is_reported_not_propagated_as_error() {
        let (broken_peer, broken_client) = make_peer(PeerId(2), 2);
        drop(broken_client); // close the far end so sends to `broken_peer` fail

        let (healthy_peer, healthy_client) = make_peer(PeerId(4), 2);

        let mut registry = Registry::new(4, PeerId(5));
        registry.insert(broken_peer);
        registry.insert(healthy_peer);

        let (new_peer, _new_client) = make_peer(PeerId(1), 2);

        let broken = advertise_new_peer_to_others(&registry, &new_peer);
        assert_eq!(broken, vec![PeerId(2)]);

        // The healthy peer still received its advertisement batch, even
        // though the broken one came first in registry order.
        for _ in 0..2 {
            let (id, fd) = channel::recv(&healthy_client).unwrap();
            assert_eq!(id, 1);
            unsafe {
                libc::close(fd.unwrap());
            }
        }
    }

    #[test]
    fn reject_for_capacity_sends_bare_abort_frame() {
        let (a, b) = UnixStream::pair().unwrap();
        reject_for_capacity(&a).unwrap();
        let (v, fd) = channel::recv(&b).unwrap();
        assert_eq!(v, FD_CARRIER);
        assert!(fd.is_none());
    }
}
