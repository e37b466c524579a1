//! CLI binary exercising the library: `scan` discovers cameras on the
//! network, `connect` opens a session and prints the handshake result,
//! `monitor` connects and streams detected/downloaded photos to a
//! directory. Grounded on the teacher's own `structopt`-driven binary
//! (`main.rs` + `cli::repl`), rebuilt on `clap`'s derive API with
//! `tracing-subscriber` for logging instead of `log`.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use ptpip_camera_client::config::ClientConfig;
use ptpip_camera_client::scanner::{self, Scanner};
use ptpip_camera_client::session::{Session, SessionEvent};

#[derive(Parser)]
#[command(name = "ptpip-camera-client", about = "PTP/IP camera discovery and capture client")]
struct Cli {
    /// Path to a config file (defaults to `ptpip-camera-client.toml` in the
    /// current directory, if present).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Scan for cameras and print each as it's discovered.
    Scan {
        /// Extra IPs to probe before the built-in candidate set.
        #[arg(long = "ip")]
        extra_ips: Vec<IpAddr>,
    },
    /// Connect to a camera at a specific address and print its device info.
    Connect {
        ip: IpAddr,
    },
    /// Connect to a camera and stream detected photos to `out_dir`.
    Monitor {
        ip: IpAddr,
        #[arg(long, default_value = "./photos")]
        out_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => ClientConfig::read_from_path(path.clone()).context("loading config file")?,
        None => ClientConfig::read().context("loading config")?,
    };

    let guid_store_path = config
        .guid_store_path
        .clone()
        .unwrap_or_else(ptpip_camera_client::guid::default_store_path);
    let guid = ptpip_camera_client::guid::load_or_create(&guid_store_path)
        .context("loading persistent client GUID")?;

    match cli.command {
        Command::Scan { extra_ips } => run_scan(guid, config, extra_ips).await,
        Command::Connect { ip } => run_connect(guid, config, ip).await,
        Command::Monitor { ip, out_dir } => run_monitor(guid, config, ip, out_dir).await,
    }
}

async fn run_scan(guid: uuid::Uuid, config: ClientConfig, extra_ips: Vec<IpAddr>) -> anyhow::Result<()> {
    let scanner = Scanner::new(guid, config);
    let discovered = scanner.discovered();
    let state_events = scanner.state_events();

    let targets = {
        let mut targets = extra_ips
            .into_iter()
            .map(|ip| scanner::ScanTarget {
                ip,
                source: scanner::CandidateSource::Cached,
            })
            .collect::<Vec<_>>();
        targets.extend(scanner::default_candidates(&[], None));
        targets
    };

    let printer = tokio::spawn(async move {
        while let Ok(camera) = discovered.recv_async().await {
            println!(
                "found camera {:?} at {} (connection {})",
                camera.name, camera.ip, camera.connection_number
            );
            let _ = camera.session.disconnect().await;
        }
    });

    let state_printer = tokio::spawn(async move {
        while let Ok(state) = state_events.recv_async().await {
            tracing::info!(?state, "scan state");
        }
    });

    let final_state = scanner.run(targets).await;
    tracing::info!(?final_state, "scan complete");

    printer.await.ok();
    state_printer.await.ok();
    Ok(())
}

async fn run_connect(guid: uuid::Uuid, config: ClientConfig, ip: IpAddr) -> anyhow::Result<()> {
    let addr = SocketAddr::new(ip, scanner::PTPIP_PORT);
    let session = Session::connect(addr, guid, config)
        .await
        .context("connecting to camera")?;

    println!("connected to {:?}", session.device_info());
    session.disconnect().await.ok();
    Ok(())
}

async fn run_monitor(
    guid: uuid::Uuid,
    config: ClientConfig,
    ip: IpAddr,
    out_dir: PathBuf,
) -> anyhow::Result<()> {
    std::fs::create_dir_all(&out_dir).context("creating output directory")?;

    let addr = SocketAddr::new(ip, scanner::PTPIP_PORT);
    let session = Session::connect(addr, guid, config)
        .await
        .context("connecting to camera")?;
    let events = session.events();
    session.start().await.context("starting session")?;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                tracing::info!("shutting down on ctrl-c");
                session.disconnect().await.ok();
                break;
            }
            event = events.recv_async() => {
                match event {
                    Ok(SessionEvent::Connected(info)) => {
                        tracing::info!(manufacturer = %info.manufacturer, model = %info.model, "connected");
                    }
                    Ok(SessionEvent::DetectedPhoto { handle, filename, .. }) => {
                        tracing::info!(handle, ?filename, "photo detected");
                    }
                    Ok(SessionEvent::CompletedDownload { handle, bytes }) => {
                        let name = format!("object-{handle:08x}.bin");
                        let path = out_dir.join(name);
                        if let Err(e) = std::fs::write(&path, &bytes) {
                            tracing::error!(error = %e, path = %path.display(), "failed to write photo");
                        } else {
                            tracing::info!(path = %path.display(), bytes = bytes.len(), "photo saved");
                        }
                    }
                    Ok(SessionEvent::SkippedRaw { filename }) => {
                        tracing::info!(%filename, "skipped raw object");
                    }
                    Ok(SessionEvent::Failed(error)) => {
                        tracing::warn!(error = %error, "session error");
                    }
                    Ok(SessionEvent::Disconnected) => {
                        tracing::info!("session disconnected");
                        break;
                    }
                    Err(_) => break,
                }
            }
        }
    }

    Ok(())
}
