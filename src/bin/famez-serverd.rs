//! `famez-serverd`: parses the recognized command-line options, installs
//! logging, and runs the hub server to completion.

use std::path::PathBuf;

use clap::Parser;
use flexi_logger::{Age, Cleanup, Criterion, FileSpec, Logger, Naming};

use famez_hub::{HubResult, PingPongHandler, Server, ServerConfig};

/// FAME-Z ivshmem mailbox hub server.
#[derive(Parser, Debug)]
#[command(name = "famez-serverd", about = "FAME-Z inter-VM shared-memory messaging hub server")]
struct Cli {
    /// Filesystem path for the listening UNIX socket.
    #[arg(long = "socket-path")]
    socket_path: Option<PathBuf>,

    /// Name of the POSIX shared-memory mailbox object.
    #[arg(long = "mailbox")]
    mailbox: Option<String>,

    /// Client capacity N. The server occupies id N+1.
    #[arg(long = "clients")]
    clients: Option<u32>,

    /// Don't participate in messaging: no server notifiers, no dispatch.
    #[arg(long)]
    silent: bool,

    /// Retain a disconnected peer's notifiers for a reconnect under the same id.
    #[arg(long)]
    recycle: bool,

    /// Log to a daily-rotating file instead of stderr.
    #[arg(long)]
    background: bool,

    /// Path for the rotating log file, used only with --background.
    #[arg(long = "logfile")]
    logfile: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();

    let mut config = ServerConfig::default();
    if let Some(socket_path) = cli.socket_path {
        config = config.with_socket_path(socket_path);
    }
    if let Some(mailbox) = cli.mailbox {
        config = config.with_mailbox_name(mailbox);
    }
    if let Some(clients) = cli.clients {
        config = config.with_n_clients(clients);
    }
    if let Some(logfile) = cli.logfile {
        config = config.with_log_file(logfile);
    }
    config = config
        .with_silent(cli.silent)
        .with_recycle(cli.recycle)
        .with_foreground(!cli.background);

    if let Err(e) = init_logging(&config) {
        eprintln!("famez-serverd: failed to initialize logging: {e}");
        std::process::exit(1);
    }

    let mut server = match Server::new(config, Box::new(PingPongHandler)) {
        Ok(server) => server,
        Err(e) => {
            log::error!("famez-serverd: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = server.run() {
        log::error!("famez-serverd: fatal: {e}");
        std::process::exit(1);
    }
}

/// Console logging when foregrounded, a daily-rotating file otherwise --
/// the direct analogue of the original's
/// `TPlog.startLogging(sys.stdout, ...)` vs.
/// `TPlog.startLogging(DailyLogFile.fromFullPath(...), ...)` split.
fn init_logging(config: &ServerConfig) -> HubResult<()> {
    if config.foreground() {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
        return Ok(());
    }

    eprintln!("Logging to {}", config.log_file().display());
    let file_spec = FileSpec::try_from(config.log_file())
        .map_err(|e| famez_hub::HubError::fatal("logfile path", std::io::Error::new(std::io::ErrorKind::InvalidInput, e)))?;

    Logger::try_with_str("info")
        .map_err(|e| famez_hub::HubError::fatal("logger init", std::io::Error::new(std::io::ErrorKind::Other, e)))?
        .log_to_file(file_spec)
        .rotate(Criterion::Age(Age::Day), Naming::Timestamps, Cleanup::KeepLogFiles(7))
        .duplicate_to_stderr(flexi_logger::Duplicate::Warn)
        .start()
        .map_err(|e| famez_hub::HubError::fatal("logger start", std::io::Error::new(std::io::ErrorKind::Other, e)))?;

    Ok(())
}
