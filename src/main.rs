use std::io::ErrorKind;
use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use clap::Parser;
use log::Level::{Error, Info, Warn};

use gnss_accelmeter::config::{Config, SourceKind};
use gnss_accelmeter::gnss::GnssAcquisition;
use gnss_accelmeter::gnss::source::{SourceFactory, factory_from_config};
use gnss_accelmeter::session::Session;
use gnss_accelmeter::{client_log, logging, session_log};

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// GNSS acceleration timer: measures 0-to-checkpoint times for one TCP client at a time
#[derive(Parser, Debug)]
#[clap(version, about)]
struct Cli {
    /// YAML configuration file
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// address to listen on, overrides the configuration file
    #[clap(short, long)]
    listen: Option<String>,

    /// where NMEA sentences come from, overrides the configuration file
    #[clap(short, long, value_enum)]
    source: Option<SourceKind>,

    /// log sentence decoding, state transitions and per-run sample traces
    #[clap(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();
    logging::init_logging(cli.verbose);

    let mut config = match &cli.config {
        Some(path) => Config::from_yaml_file(path)?,
        None => Config::default(),
    };
    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
    }
    if let Some(source) = cli.source {
        config.gnss.source = source;
    }
    config.validate()?;
    let config = Arc::new(config);

    let listener = TcpListener::bind(&config.listen_addr)?;
    listener.set_nonblocking(true)?;
    session_log!(
        Info,
        "Listening on {} with {:?} source",
        config.listen_addr,
        config.gnss.source
    );

    let teardown = Arc::new(AtomicBool::new(false));
    let mut server = tokio::task::spawn_blocking({
        let config = Arc::clone(&config);
        let teardown = Arc::clone(&teardown);
        move || serve(listener, config, teardown)
    });

    tokio::select! {
        result = &mut server => {
            result?;
            return Ok(());
        }
        _ = shutdown_signal() => session_log!(Info, "Shutdown requested"),
    }

    teardown.store(true, Ordering::Release);
    server.await?;
    session_log!(Info, "Server stopped");
    Ok(())
}

/// Accept connections one at a time until teardown; each gets a fresh
/// acquisition service and runs to completion on this thread.
fn serve(listener: TcpListener, config: Arc<Config>, teardown: Arc<AtomicBool>) {
    let factory: SourceFactory = factory_from_config(&config.gnss);

    while !teardown.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, peer)) => {
                client_log!(Info, "Client connected from {}", peer);
                let gnss = Arc::new(GnssAcquisition::new(
                    Arc::clone(&factory),
                    config.gnss.module_start_script.clone(),
                ));
                match Session::new(stream, Arc::clone(&config), gnss, Arc::clone(&teardown)) {
                    Ok(session) => {
                        let state = session.run();
                        if state.is_terminal() {
                            client_log!(Warn, "Session with {} failed ({:?})", peer, state);
                        } else {
                            client_log!(Info, "Client {} disconnected ({:?})", peer, state);
                        }
                    }
                    Err(e) => client_log!(Error, "Failed to set up session for {}: {}", peer, e),
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL_INTERVAL),
            Err(e) => {
                client_log!(Error, "Failed to accept connection: {}", e);
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
                return;
            }
            Err(e) => session_log!(Error, "Failed to install SIGTERM handler: {}", e),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        session_log!(Error, "Failed to listen for ctrl-c: {}", e);
    }
}
