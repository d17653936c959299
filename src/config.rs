//! Configuration recognized by the hub server.

use std::path::PathBuf;

const DEFAULT_SOCKET_PATH: &str = "/tmp/ivshmem_socket";
const DEFAULT_MAILBOX_NAME: &str = "ivshmem_mailbox";
const DEFAULT_LOG_FILE: &str = "/tmp/ivshmem_log";
const DEFAULT_N_CLIENTS: u32 = 2;

/// Configures the hub server's listen socket, mailbox, capacity, and
/// behavioral flags.
///
/// Mirrors the fluent `with_*` / `Default` shape used elsewhere in this
/// codebase for configuration structs; construct with `ServerConfig::default()`
/// and override only what you need.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    socket_path: PathBuf,
    mailbox_name: String,
    n_clients: u32,
    silent: bool,
    recycle: bool,
    foreground: bool,
    log_file: PathBuf,
}

impl ServerConfig {
    /// Sets the filesystem path for the listening UNIX socket.
    pub fn with_socket_path<P: Into<PathBuf>>(mut self, path: P) -> ServerConfig {
        self.socket_path = path.into();
        self
    }

    /// Sets the name of the POSIX shared-memory mailbox object.
    pub fn with_mailbox_name<S: Into<String>>(mut self, name: S) -> ServerConfig {
        self.mailbox_name = name.into();
        self
    }

    /// Sets the client capacity `N`. The server occupies id `N+1`; the
    /// mailbox holds `N+2` slots.
    pub fn with_n_clients(mut self, n: u32) -> ServerConfig {
        self.n_clients = n;
        self
    }

    /// When true, the server does not participate in messaging: no server
    /// notifiers are advertised and no receive callbacks are registered.
    pub fn with_silent(mut self, silent: bool) -> ServerConfig {
        self.silent = silent;
        self
    }

    /// When true, a disconnected peer's notifier vector is retained under
    /// its id for a subsequent reconnection.
    pub fn with_recycle(mut self, recycle: bool) -> ServerConfig {
        self.recycle = recycle;
        self
    }

    /// Controls the logging destination: stderr when foregrounded, a
    /// rotating file otherwise.
    pub fn with_foreground(mut self, foreground: bool) -> ServerConfig {
        self.foreground = foreground;
        self
    }

    /// Sets the path for the rotating log file used when not foregrounded.
    pub fn with_log_file<P: Into<PathBuf>>(mut self, path: P) -> ServerConfig {
        self.log_file = path.into();
        self
    }

    pub fn socket_path(&self) -> &std::path::Path {
        &self.socket_path
    }

    pub fn mailbox_name(&self) -> &str {
        &self.mailbox_name
    }

    pub fn n_clients(&self) -> u32 {
        self.n_clients
    }

    pub fn silent(&self) -> bool {
        self.silent
    }

    pub fn recycle(&self) -> bool {
        self.recycle
    }

    pub fn foreground(&self) -> bool {
        self.foreground
    }

    pub fn log_file(&self) -> &std::path::Path {
        &self.log_file
    }

    /// The server's own reserved peer id, `n_clients + 1`.
    pub fn server_id(&self) -> crate::peer::PeerId {
        crate::peer::PeerId(self.n_clients as i64 + 1)
    }

    /// Mailbox slot count / notifier vector length, `n_clients + 2`.
    pub fn slot_count(&self) -> usize {
        self.n_clients as usize + 2
    }
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            mailbox_name: DEFAULT_MAILBOX_NAME.to_owned(),
            n_clients: DEFAULT_N_CLIENTS,
            silent: false,
            recycle: false,
            foreground: true,
            log_file: PathBuf::from(DEFAULT_LOG_FILE),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_id_and_slot_count_follow_n_clients() {
        let cfg = ServerConfig::default().with_n_clients(2);
        assert_eq!(cfg.server_id(), crate::peer::PeerId(3));
        assert_eq!(cfg.slot_count(), 4);
    }

    #[test]
    fn builder_methods_override_defaults() {
        let cfg = ServerConfig::default()
            .with_socket_path("/tmp/custom.sock")
            .with_mailbox_name("custom")
            .with_silent(true)
            .with_recycle(true);

        assert_eq!(cfg.socket_path(), std::path::Path::new("/tmp/custom.sock"));
        assert_eq!(cfg.mailbox_name(), "custom");
        assert!(cfg.silent());
        assert!(cfg.recycle());
    }
}
