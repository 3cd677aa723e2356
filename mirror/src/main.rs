use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use voice_mirror::config::MirrorConfig;
use voice_mirror::credentials::TokenStore;
use voice_mirror::engine::handler::HandlerEvent;
use voice_mirror::remote::connection::RemoteConnection;
use voice_mirror::session::{MirrorSession, SessionError};

/// Mirror the servers, channels and clients of a locally running voice client.
#[derive(Parser, Debug)]
#[command(name = "voice-mirror", version, about)]
struct Args {
    /// Path to the TOML config file.
    #[arg(short, long, default_value = "voice-mirror.toml")]
    config: PathBuf,

    /// Companion app host.
    #[arg(long)]
    host: Option<String>,

    /// Companion app port.
    #[arg(short, long)]
    port: Option<u16>,

    /// Suffix that tells several instances apart in the companion app.
    #[arg(long)]
    custom_id: Option<String>,

    /// Where the pairing credential is kept.
    #[arg(long)]
    token_file: Option<PathBuf>,

    /// Ignore the stored credential and pair again.
    #[arg(long)]
    pair: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = MirrorConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if let Some(host) = args.host {
        config.remote.host = host;
    }
    if let Some(port) = args.port {
        config.remote.port = port;
    }
    if let Some(custom_id) = args.custom_id {
        config.app.custom_id = Some(custom_id);
    }
    if let Some(token_file) = args.token_file {
        config.credentials.token_file = token_file;
    }

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log.filter)),
        )
        .init();

    let store = TokenStore::new(&config.credentials.token_file);
    let stored = if args.pair {
        None
    } else {
        store
            .load()
            .with_context(|| format!("reading {}", store.path().display()))?
    };

    let connection = RemoteConnection::new(config.remote_settings(), config.identity());
    let mut session = MirrorSession::new(connection, stored);

    let mut active = session.handler().watch_active_server();
    session.handler_mut().subscribe(|event| {
        if let HandlerEvent::ServerRemoved(id) = event {
            info!(server = %id, "no longer mirroring server");
        }
    });
    tokio::spawn(async move {
        while active.changed().await.is_ok() {
            let current = *active.borrow_and_update();
            match current {
                Some(id) => info!(server = %id, "presenting server"),
                None => info!("no server to present"),
            }
        }
    });

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            shutdown.cancel();
        }
    });

    info!(
        url = %config.remote_settings().url(),
        identifier = %config.identity().identifier,
        "voice-mirror starting"
    );

    let mut attempt = session.connect_or_pair().await;
    loop {
        let failure = match attempt {
            Ok(api_key) => {
                if let Err(e) = store.save(&api_key) {
                    warn!(path = %store.path().display(), error = %e, "failed to store credential");
                }
                match session.run(cancel.clone()).await {
                    Ok(()) => break,
                    Err(SessionError::Sync(e)) => {
                        warn!(error = %e, "mirror out of sync, resynchronizing");
                        attempt = session.restart().await;
                        continue;
                    }
                    Err(e) => anyhow::Error::from(e),
                }
            }
            Err(e) => anyhow::Error::from(e),
        };

        let Some(delay) = config.reconnect_delay() else {
            error!(error = %failure, "giving up");
            return Err(failure);
        };
        warn!(error = %failure, ?delay, "reconnecting");
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
        attempt = session.connect_or_pair().await;
    }

    session.disconnect();
    info!("voice-mirror stopped");
    Ok(())
}
