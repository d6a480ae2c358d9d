//! Minimal Wisp client: opens one stream and pipes it to stdin/stdout.

use anyhow::{Context, bail};
use clap::Parser;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio_util::codec::{BytesCodec, FramedRead};
use tracing::{debug, info};
use wisp_mux::extensions::PasswordClientPayload;
use wisp_mux::packet::{CloseReason, StreamType, WispVersion};
use wisp_mux::{ClientConfig, ClientMux, MuxStream};

#[derive(Debug, Parser)]
#[command(version, about = "Open a TCP or UDP stream through a Wisp server")]
struct Args {
    /// Wisp server URL, e.g. ws://127.0.0.1:3030/wisp/
    url: String,
    /// Destination host
    host: String,
    /// Destination port
    port: u16,
    /// Open a UDP stream instead of TCP
    #[arg(long)]
    udp: bool,
    /// Speak protocol version 1 only
    #[arg(long)]
    v1: bool,
    #[arg(long, requires = "password")]
    username: Option<String>,
    #[arg(long, requires = "username")]
    password: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let args = Args::parse();

    let (ws, _) = tokio_websockets::ClientBuilder::new()
        .uri(&args.url)
        .with_context(|| format!("Invalid URL: {}", args.url))?
        .connect()
        .await
        .with_context(|| format!("Failed to connect to {}", args.url))?;
    let (read, write) = wisp_mux::ws::split(ws);

    let config = ClientConfig {
        version: if args.v1 {
            WispVersion::V1
        } else {
            WispVersion::V2
        },
        udp_extension: true,
        credentials: args
            .username
            .zip(args.password)
            .map(|(username, password)| PasswordClientPayload { username, password }),
    };
    let (mux, mux_task) = ClientMux::new(read, write, config)
        .await
        .context("Wisp handshake failed")?;
    let mux_task = tokio::spawn(mux_task);

    if let Some(motd) = mux.motd() {
        info!("Server MOTD: {}", motd);
        eprintln!("{}", motd);
    }

    let stream_type = if args.udp {
        StreamType::Udp
    } else {
        StreamType::Tcp
    };
    let stream = mux
        .connect(stream_type, args.host.as_str(), args.port)
        .await
        .context("Failed to open stream")?;
    debug!("Opened stream {} to {}:{}", stream.id(), args.host, args.port);

    tokio::select! {
        result = stdin_to_stream(&stream) => result?,
        result = stream_to_stdout(&stream) => result?,
    }

    if let Some(reason) = stream.close_reason() {
        if reason != CloseReason::Voluntary {
            eprintln!("Stream closed: {:?}", reason);
        }
    }
    let _ = mux.close().await;
    match mux_task.await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => bail!("Wisp connection failed: {}", e),
        Err(e) => bail!("Wisp connection task panicked: {}", e),
    }
}

async fn stdin_to_stream(stream: &MuxStream) -> anyhow::Result<()> {
    let mut stdin = FramedRead::new(tokio::io::stdin(), BytesCodec::new());
    while let Some(chunk) = stdin.next().await {
        let chunk = chunk.context("Failed to read stdin")?;
        stream.send(chunk.freeze()).await?;
    }
    // no half-close in wisp, keep printing until the server closes
    std::future::pending().await
}

async fn stream_to_stdout(stream: &MuxStream) -> anyhow::Result<()> {
    let mut stdout = tokio::io::stdout();
    while let Some(data) = stream.recv().await {
        stdout.write_all(&data).await?;
        stdout.flush().await?;
    }
    Ok(())
}
