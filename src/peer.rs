//! Peer identifiers and peer records.

use std::fmt;
use std::os::unix::net::UnixStream;

use crate::notifier::Notifier;

/// A peer id, as carried on the wire: a small integer, signed so the
/// "rejected" sentinel (`-1`) and the "no fd attached" frame convention
/// share the same representation the protocol uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId(pub i64);

impl PeerId {
    /// Id `0`: reserved for the mailbox globals slot, never assigned to a peer.
    pub const UNUSED: PeerId = PeerId(0);
    /// Sentinel assigned when the registry is at capacity.
    pub const REJECTED: PeerId = PeerId(-1);

    pub fn is_rejected(self) -> bool {
        self == PeerId::REJECTED
    }

    /// Index of this id within a notifier vector / mailbox slot array.
    pub fn as_index(self) -> usize {
        debug_assert!(self.0 >= 0);
        self.0 as usize
    }
}

impl From<i64> for PeerId {
    fn from(v: i64) -> PeerId {
        PeerId(v)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Subsidiary attributes the external request layer attaches to a peer.
///
/// The core never requires these before dispatch runs; it only guarantees
/// the struct exists on every peer record.
#[derive(Debug, Clone, Default)]
pub struct PeerAttributes {
    pub node_name: String,
    pub class: String,
}

/// A connected peer: the id assigned to it, the transport that owns it, and
/// the notifier vector created for it at admission.
///
/// `notifiers[k]` is the descriptor other peers are handed so they can
/// signal this peer as "from k". Index `k` is the logical source id.
pub struct Peer {
    id: PeerId,
    socket: UnixStream,
    notifiers: Vec<Notifier>,
    attributes: PeerAttributes,
}

impl Peer {
    pub fn new(id: PeerId, socket: UnixStream, notifiers: Vec<Notifier>) -> Peer {
        Peer {
            id,
            socket,
            notifiers,
            attributes: PeerAttributes::default(),
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn socket(&self) -> &UnixStream {
        &self.socket
    }

    pub fn notifiers(&self) -> &[Notifier] {
        &self.notifiers
    }

    /// The notifier this peer holds for waking a given source id.
    pub fn notifier(&self, source: PeerId) -> &Notifier {
        &self.notifiers[source.as_index()]
    }

    pub fn attributes(&self) -> &PeerAttributes {
        &self.attributes
    }

    pub fn attributes_mut(&mut self) -> &mut PeerAttributes {
        &mut self.attributes
    }

    /// Replace this peer's notifier vector, used when adopting a recycled
    /// vector at reconnect.
    pub fn set_notifiers(&mut self, notifiers: Vec<Notifier>) {
        self.notifiers = notifiers;
    }

    /// Take the notifier vector out, used when parking a disconnected peer
    /// for later recycling.
    pub fn into_notifiers(self) -> Vec<Notifier> {
        self.notifiers
    }
}
