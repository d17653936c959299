//! The reactor: a single-threaded `mio::Poll` loop that owns the listening
//! socket, the mailbox, the server's own notifier vector, the registry, and
//! the boxed request-handling capability, and dispatches readiness events
//! to the handshake/disconnect/receive logic in `handler`.
//!
//! Token layout (a fixed arithmetic scheme rather than a lookup table,
//! since the address space is small and entirely known up front):
//!   - `Token(0)`                          the listening socket
//!   - `Token(1 ..= slot_count - 1)`        the server's own notifier vector,
//!                                          index == token - 1 (index 0, the
//!                                          globals slot, is never armed)
//!   - `Token(1_000_000 + peer_id)`         a peer's stream, post-handshake

use std::io::{self, Read};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

use crate::config::ServerConfig;
use crate::error::{HubError, HubResult};
use crate::handler::{self, DisconnectKind};
use crate::mailbox::Mailbox;
use crate::notifier::Notifier;
use crate::peer::{Peer, PeerId};
use crate::registry::Registry;
use crate::request::RequestHandler;

const LISTENER_TOKEN: Token = Token(0);
const NOTIFIER_TOKEN_BASE: usize = 1;
const PEER_TOKEN_BASE: usize = 1_000_000;

fn notifier_token(index: usize) -> Token {
    Token(NOTIFIER_TOKEN_BASE + index)
}

fn peer_token(id: PeerId) -> Token {
    Token(PEER_TOKEN_BASE + id.0 as usize)
}

fn peer_id_from_token(token: Token) -> PeerId {
    PeerId((token.0 - PEER_TOKEN_BASE) as i64)
}

/// The hub server: owns every shared resource and runs the single
/// cooperative I/O loop that drives the connection-admission state machine.
pub struct Server {
    config: ServerConfig,
    registry: Registry,
    mailbox: Mailbox,
    server_notifiers: Option<Vec<Notifier>>,
    listener: UnixListener,
    lockfile_fd: std::os::unix::io::RawFd,
    poll: Poll,
    request_handler: Box<dyn RequestHandler>,
}

impl Server {
    /// Build a server from configuration: creates (or reopens) the mailbox,
    /// binds the listening socket, and -- unless `silent` -- arms the
    /// server's own notifier vector.
    pub fn new(config: ServerConfig, request_handler: Box<dyn RequestHandler>) -> HubResult<Server> {
        let mailbox = Mailbox::open_or_create(config.mailbox_name(), config.slot_count())?;
        let lockfile_fd = acquire_lockfile(config.socket_path())?;
        let listener = bind_listener(config.socket_path())?;
        let poll = Poll::new().map_err(|e| HubError::fatal("mio::Poll::new", e))?;

        let server_notifiers = if config.silent() {
            None
        } else {
            let mut notifiers = Vec::with_capacity(config.slot_count());
            for _ in 0..config.slot_count() {
                notifiers.push(Notifier::create()?);
            }
            Some(notifiers)
        };

        let registry = Registry::new(config.n_clients(), config.server_id());

        Ok(Server {
            config,
            registry,
            mailbox,
            server_notifiers,
            listener,
            lockfile_fd,
            poll,
            request_handler,
        })
    }

    /// Run the I/O loop. Only returns on a `Fatal` error (bind/shm failures
    /// are surfaced from `new`; this can still fail if `mio::Poll::poll`
    /// itself errors out irrecoverably).
    pub fn run(&mut self) -> HubResult<()> {
        self.poll
            .registry()
            .register(&mut SourceFd(&self.listener.as_raw_fd()), LISTENER_TOKEN, Interest::READABLE)
            .map_err(|e| HubError::fatal("register listener", e))?;

        if let Some(notifiers) = &self.server_notifiers {
            for (index, notifier) in notifiers.iter().enumerate() {
                if index == 0 {
                    continue;
                }
                self.poll
                    .registry()
                    .register(
                        &mut SourceFd(&notifier.readable_fd()),
                        notifier_token(index),
                        Interest::READABLE,
                    )
                    .map_err(|e| HubError::fatal("register server notifier", e))?;
            }
        }

        log::info!(
            "famez-hub server (id={}) listening for up to {} clients on {}",
            self.config.server_id(),
            self.config.n_clients(),
            self.config.socket_path().display()
        );

        let mut events = Events::with_capacity(1024);
        loop {
            match self.poll.poll(&mut events, None) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(HubError::fatal("poll", e)),
            }

            for event in events.iter() {
                let token = event.token();
                let outcome = if token == LISTENER_TOKEN {
                    self.handle_accept()
                } else if token.0 >= PEER_TOKEN_BASE {
                    self.handle_peer_event(peer_id_from_token(token))
                } else {
                    self.handle_notifier_readable(token.0 - NOTIFIER_TOKEN_BASE)
                };

                if let Err(e) = outcome {
                    log::warn!("famez-hub: event handling error: {e}");
                }
            }
        }
    }

    fn handle_accept(&mut self) -> HubResult<()> {
        loop {
            match self.listener.accept() {
                Ok((stream, _addr)) => {
                    if let Err(e) = self.admit(stream) {
                        log::warn!("famez-hub: admitting connection failed: {e}");
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(HubError::transport(None, e)),
            }
        }
        Ok(())
    }

    /// Steps 1-11 of the accept lifecycle: allocate or reject an id, check
    /// the recycle table, run the descriptor-exchange script, and register
    /// the peer's stream with the reactor.
    fn admit(&mut self, stream: UnixStream) -> HubResult<()> {
        stream
            .set_nonblocking(true)
            .map_err(|e| HubError::transport(None, e))?;

        // Step 1: allocate (or reject for) an id.
        let id = self.registry.allocate_id();
        if id.is_rejected() {
            log::info!("famez-hub: max clients reached, rejecting new connection");
            let _ = handler::reject_for_capacity(&stream);
            return Ok(());
        }

        // Step 2: check the recycle table.
        let recycled_peer = self.registry.reclaim(id);
        let (notifiers, recycled) = match recycled_peer {
            Some(old) => (old.into_notifiers(), true),
            None => match (0..self.config.slot_count())
                .map(|_| Notifier::create())
                .collect::<HubResult<Vec<Notifier>>>()
            {
                Ok(v) => (v, false),
                Err(e) => {
                    log::error!("famez-hub: event notifiers failed for peer {id}: {e}");
                    let _ = handler::reject_for_capacity(&stream);
                    return Ok(());
                }
            },
        };

        let peer = Peer::new(id, stream, notifiers);

        // Steps 5-9: the descriptor-exchange script. A transport fault in an
        // already-admitted peer discovered during step 6 is that peer's
        // fault, not the newcomer's; it comes back as an id to tear down
        // rather than an `Err`, which is reserved for faults in `peer`'s own
        // transport.
        let broken_peers = match handler::run_handshake(
            &self.config,
            &self.registry,
            &self.mailbox,
            self.server_notifiers.as_deref(),
            &peer,
            recycled,
        ) {
            Ok(broken) => broken,
            Err(e) => {
                log::warn!("famez-hub: handshake failed for peer {id}: {e}");
                return Ok(()); // `peer` drops here, closing its transport and notifiers.
            }
        };

        for broken_id in broken_peers {
            self.teardown_peer(broken_id, DisconnectKind::Dirty)?;
        }

        self.poll
            .registry()
            .register(
                &mut SourceFd(&peer.socket().as_raw_fd()),
                peer_token(id),
                Interest::READABLE,
            )
            .map_err(|e| HubError::transport(Some(id), e))?;

        // Step 10.
        self.registry.insert(peer);

        // Step 11: post an initial attribute message and wake the peer.
        if let Some(peer) = self.registry.get(id) {
            let _ = self
                .mailbox
                .fill(self.config.server_id(), "Z-switch", b"Link CTL Peer-Attribute");
            let _ = peer.notifier(self.config.server_id()).signal(1);
        }

        Ok(())
    }

    /// Any readiness event on an admitted peer's stream after handshake: the
    /// server never expects application bytes there, so a readable event
    /// means either the peer closed (EOF) or sent something it shouldn't
    /// have (`ProtocolMisuse`) -- both end the connection.
    fn handle_peer_event(&mut self, id: PeerId) -> HubResult<()> {
        let mut probe = [0u8; 1];
        let read_result = match self.registry.get(id) {
            Some(peer) => {
                let mut socket_ref = peer.socket();
                socket_ref.read(&mut probe)
            }
            None => return Ok(()),
        };

        match read_result {
            Ok(0) => self.teardown_peer(id, DisconnectKind::Clean),
            Ok(_) => {
                log::warn!("famez-hub: peer {id} sent unexpected post-handshake bytes");
                self.teardown_peer(id, DisconnectKind::Dirty)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(_) => self.teardown_peer(id, DisconnectKind::Dirty),
        }
    }

    fn teardown_peer(&mut self, id: PeerId, kind: DisconnectKind) -> HubResult<()> {
        let peer = match self.registry.remove(id) {
            Some(p) => p,
            None => return Ok(()),
        };
        let _ = self
            .poll
            .registry()
            .deregister(&mut SourceFd(&peer.socket().as_raw_fd()));
        handler::disconnect(&mut self.registry, &self.mailbox, peer, kind, self.config.recycle())
    }

    /// The receive path: one of the server's own notifiers fired.
    fn handle_notifier_readable(&mut self, index: usize) -> HubResult<()> {
        let drained = match &self.server_notifiers {
            Some(notifiers) => notifiers[index].drain()?,
            None => return Ok(()),
        };
        if drained.is_none() {
            return Ok(());
        }

        let requester_id = PeerId(index as i64);
        let (requester_name, payload) = self.mailbox.retrieve(requester_id);
        let server_id = self.config.server_id();

        // Populate the peer's subsidiary attributes from its own mailbox
        // write the first time it's seen -- the core never requires this,
        // but a populated node-name is useful to the request handler and to
        // operator tooling (e.g. the Commander console) built atop it.
        if let Some(peer) = self.registry.get_mut(requester_id) {
            if peer.attributes().node_name.is_empty() && !requester_name.is_empty() {
                peer.attributes_mut().node_name = requester_name.clone();
            }
        }

        match self.registry.get(requester_id) {
            Some(peer) => {
                let responder_notifier = peer.notifier(server_id);
                log::debug!(
                    "famez-hub: {requester_name}@{requester_id} -> {} bytes",
                    payload.len()
                );
                self.request_handler
                    .handle(&payload, requester_id, server_id, responder_notifier, &self.mailbox);
            }
            None => {
                log::info!("famez-hub: disappearing act by peer {requester_id}");
            }
        }

        Ok(())
    }

    /// Close the listening socket and every peer socket in registry order,
    /// unregistering notifiers before closing their descriptors. Idempotent.
    pub fn shutdown(&mut self) {
        log::info!("famez-hub: shutting down");

        let ids: Vec<PeerId> = self.registry.ids().collect();
        for id in ids {
            if let Some(peer) = self.registry.remove(id) {
                let _ = self
                    .poll
                    .registry()
                    .deregister(&mut SourceFd(&peer.socket().as_raw_fd()));
            }
        }

        if let Some(notifiers) = self.server_notifiers.take() {
            for (index, notifier) in notifiers.iter().enumerate() {
                if index == 0 {
                    continue;
                }
                let _ = self.poll.registry().deregister(&mut SourceFd(&notifier.readable_fd()));
            }
        }

        let _ = self.poll.registry().deregister(&mut SourceFd(&self.listener.as_raw_fd()));
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
        let _ = std::fs::remove_file(self.config.socket_path());
        unsafe {
            libc::close(self.lockfile_fd);
        }
        let mut lock_path = self.config.socket_path().as_os_str().to_owned();
        lock_path.push(".lock");
        let _ = std::fs::remove_file(lock_path);
    }
}

/// Take an advisory `flock` on `<path>.lock`, creating it if needed, the
/// companion lockfile a qemu `ivshmem-server` keeps alongside its listen
/// socket. Held for the lifetime of the `Server`; released (and the fd
/// closed) on `Drop`.
fn acquire_lockfile(socket_path: &Path) -> HubResult<std::os::unix::io::RawFd> {
    let mut lock_path = socket_path.as_os_str().to_owned();
    lock_path.push(".lock");

    let c_path = std::ffi::CString::new(lock_path.as_encoded_bytes())
        .map_err(|e| HubError::fatal("lockfile path", io::Error::new(io::ErrorKind::InvalidInput, e)))?;

    let fd = unsafe { libc::open(c_path.as_ptr(), libc::O_CREAT | libc::O_RDWR, 0o666) };
    if fd < 0 {
        return Err(HubError::fatal("open lockfile", io::Error::last_os_error()));
    }

    if unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) } != 0 {
        let err = io::Error::last_os_error();
        unsafe {
            libc::close(fd);
        }
        return Err(HubError::fatal("flock lockfile", err));
    }

    Ok(fd)
}

/// Bind the listening UNIX socket at `path`, clearing a stale socket file
/// left behind by a previous crash, and set the permissive `0o666` mode
/// qemu's `ivshmem-server` uses so any locally-running VMM can connect.
fn bind_listener(path: &Path) -> HubResult<UnixListener> {
    let listener = match UnixListener::bind(path) {
        Ok(l) => l,
        Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
            let _ = std::fs::remove_file(path);
            UnixListener::bind(path).map_err(|e| HubError::fatal("bind socket", e))?
        }
        Err(e) => return Err(HubError::fatal("bind socket", e)),
    };

    listener
        .set_nonblocking(true)
        .map_err(|e| HubError::fatal("set listener nonblocking", e))?;

    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666))
        .map_err(|e| HubError::fatal("chmod socket", e))?;

    Ok(listener)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel;
    use crate::request::PingPongHandler;
    use std::thread;
    use std::time::Duration;

    fn unique_paths(tag: &str) -> (std::path::PathBuf, String) {
        let pid = std::process::id();
        (
            std::env::temp_dir().join(format!("famez-hub-test-{tag}-{pid}.sock")),
            format!("/famez-hub-test-{tag}-{pid}"),
        )
    }

    #[test]
    fn first_client_receives_initial_info_and_sentinel_batch() {
        let (sock_path, mailbox_name) = unique_paths("e2e-first");
        let _ = std::fs::remove_file(&sock_path);

        let config = ServerConfig::default()
            .with_socket_path(&sock_path)
            .with_mailbox_name(&mailbox_name)
            .with_n_clients(2);

        let mut server = Server::new(config, Box::new(PingPongHandler)).unwrap();
        let handle = thread::spawn(move || {
            let _ = server.run();
        });

        thread::sleep(Duration::from_millis(50));
        let client = UnixStream::connect(&sock_path).unwrap();

        let (version, fd) = channel::recv(&client).unwrap();
        assert_eq!(version, 0);
        assert!(fd.is_none());

        let (id, fd) = channel::recv(&client).unwrap();
        assert_eq!(id, 1);
        assert!(fd.is_none());

        let (marker, fd) = channel::recv(&client).unwrap();
        assert_eq!(marker, -1);
        assert!(fd.is_some());
        unsafe {
            libc::close(fd.unwrap());
        }

        // Server-advertisement batch: 4 frames (server_id=3, N=2 -> slot_count=4).
        for _ in 0..4 {
            let (advertised_id, fd) = channel::recv(&client).unwrap();
            assert_eq!(advertised_id, 3);
            assert!(fd.is_some());
            unsafe {
                libc::close(fd.unwrap());
            }
        }

        // Sentinel batch: 4 frames carrying the client's own id.
        for _ in 0..4 {
            let (advertised_id, fd) = channel::recv(&client).unwrap();
            assert_eq!(advertised_id, 1);
            assert!(fd.is_some());
            unsafe {
                libc::close(fd.unwrap());
            }
        }

        drop(client);
        drop(handle); // the server thread runs forever; let it die with the process
        let _ = std::fs::remove_file(&sock_path);
        unsafe {
            libc::shm_unlink(std::ffi::CString::new(mailbox_name).unwrap().as_ptr());
        }
    }
}
