use anyhow::Result;
use clap::Parser;
use log::{info, warn, LevelFilter};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Notify;

use parley::call::UnsupportedMediaStack;
use parley::credentials::{load_credentials, save_credentials, Credentials};
use parley::events::{UiEvent, UiEventKind};
use parley::sync::SyncClient;
use parley::transport::{spawn_event_reader, LineTransport};
use parley::utils;

/// Command line arguments for Parley
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Parley: a headless messaging sync engine.",
    long_about = "Parley keeps a local view of contacts, message threads, and call\n\
    sessions synchronized with a messaging provider. It speaks JSON-lines on\n\
    stdin/stdout: one provider event per line in, one command per line out,\n\
    so a gateway process can drive it as a sidecar."
)]
struct Args {
    /// Write the log to this file instead of stdout
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// Our own party identifier (overrides stored credentials)
    #[arg(long, value_name = "ID")]
    self_id: Option<String>,
}

/// Resolve credentials: environment variables win, then the stored config
/// file, then an interactive prompt.
fn resolve_credentials() -> Result<Credentials> {
    let from_env = match (
        std::env::var("PARLEY_GATEWAY"),
        std::env::var("PARLEY_SELF_ID"),
    ) {
        (Ok(gateway), Ok(self_id)) => {
            let token = std::env::var("PARLEY_ACCESS_TOKEN").unwrap_or_default();
            Some(Credentials::new(&gateway, &self_id, &token))
        }
        _ => None,
    };
    if let Some(credentials) = from_env {
        return Ok(credentials);
    }

    if let Some(credentials) = load_credentials()? {
        return Ok(credentials);
    }

    eprintln!("Enter gateway endpoint (e.g. wss://gateway.example.com):");
    let gateway = utils::read_line()?;
    eprintln!("Enter your party identifier:");
    let self_id = utils::read_line()?;
    eprintln!("Enter access token (input will be stored obscured):");
    let token = utils::read_line()?;

    let credentials = Credentials::new(&gateway, &self_id, &token);
    if let Err(e) = save_credentials(&credentials) {
        warn!("Could not persist credentials: {:#}", e);
    }
    Ok(credentials)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    utils::setup_logging(
        args.log_file.as_deref().and_then(|p| p.to_str()),
        LevelFilter::Debug,
    )?;

    info!("Parley sync engine starting up");
    info!(
        "System information: {} {}",
        std::env::consts::OS,
        std::env::consts::ARCH
    );

    let credentials = resolve_credentials()?;
    let self_id = args.self_id.unwrap_or_else(|| credentials.self_id.clone());
    info!(
        "Operating as {} against gateway {}",
        self_id, credentials.gateway
    );

    // Commands go out as JSON lines on stdout, events come in on stdin. No
    // audio device is reachable in this mode, so call operations are
    // rejected by the media stack.
    let transport = Arc::new(LineTransport::stdout());
    let media = Arc::new(UnsupportedMediaStack);
    let mut client = SyncClient::new(self_id, transport, media);

    // Surface engine activity in the log; a UI layer would subscribe here.
    client.bus_mut().subscribe(
        UiEventKind::Contacts,
        Box::new(|event| {
            if let UiEvent::ContactsUpdated(contacts) = event {
                info!("Contact list updated: {} contact(s)", contacts.len());
            }
        }),
    );
    client.bus_mut().subscribe(
        UiEventKind::Call,
        Box::new(|event| {
            if let UiEvent::CallChanged { state, .. } = event {
                info!("Call state: {:?}", state);
            }
        }),
    );
    client.bus_mut().subscribe(
        UiEventKind::TransportError,
        Box::new(|event| {
            if let UiEvent::TransportError { message } = event {
                warn!("Provider error: {}", message);
            }
        }),
    );

    let events = spawn_event_reader(tokio::io::stdin());

    let shutdown = Arc::new(Notify::new());
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received; shutting down");
            shutdown_signal.notify_waiters();
        }
    });

    client.run(events, shutdown).await;
    info!("Parley sync engine stopped");
    Ok(())
}
