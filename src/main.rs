use chrono::Local;
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use peercall::config::CoreConfig;
use peercall::http::UreqHttpClient;
use peercall::ice::{HttpIceServerSource, IceConfigProvider};
use peercall::signaling::{
    AesGcmFilter, NoopFilter, PayloadFilter, Signal, Signaler, SignalingCodec,
};
use peercall::ws::{SignalingEvent, WebSocketSignalingTransport};
use peercall::{CallError, PeerId};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "peercall", about = "Call signaling diagnostics")]
struct Cli {
    /// JSON file with core settings.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Shared secret for encrypted signaling bodies.
    #[arg(long, global = true)]
    secret: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch and print the ICE server list.
    Ice {
        #[arg(long)]
        url: Option<String>,
        #[arg(long)]
        token: Option<String>,
    },
    /// Decode one signaling frame.
    Decode { frame: String },
    /// Connect to a signaling server and log inbound traffic.
    Listen {
        #[arg(long)]
        url: String,
        #[arg(long)]
        identity: String,
        /// Answer every call offer with CALL_BUSY.
        #[arg(long)]
        busy: bool,
    },
}

fn codec(secret: Option<&str>) -> Result<SignalingCodec, CallError> {
    let filter: Arc<dyn PayloadFilter> = match secret {
        Some(secret) => Arc::new(AesGcmFilter::from_shared_secret(secret.as_bytes())?),
        None => Arc::new(NoopFilter),
    };
    Ok(SignalingCodec::new(filter))
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = match &cli.config {
        Some(path) => CoreConfig::load(path)?,
        None => CoreConfig::default(),
    };
    let codec = codec(cli.secret.as_deref())?;

    match cli.command {
        Command::Ice { url, token } => {
            let Some(url) = url.or_else(|| config.ice_servers_url.clone()) else {
                anyhow::bail!("no ICE server URL given (--url or ice_servers_url)");
            };
            let mut source = HttpIceServerSource::new(Arc::new(UreqHttpClient::new()), url);
            if let Some(token) = token {
                source = source.with_auth_token(token);
            }
            let provider = IceConfigProvider::new(Arc::new(source), &config);
            let servers = provider.ice_servers().await;
            println!("{}", serde_json::to_string_pretty(&servers)?);
        }
        Command::Decode { frame } => {
            let envelope = codec.decode(&frame)?;
            println!("{envelope:#?}");
        }
        Command::Listen {
            url,
            identity,
            busy,
        } => {
            let (transport, mut events) = WebSocketSignalingTransport::connect(&url).await?;
            let signaler = Signaler::new(PeerId::new(identity), codec.clone(), transport.clone());

            while let Some(event) = events.recv().await {
                match event {
                    SignalingEvent::Connected => info!("Connected to {url}"),
                    SignalingEvent::Disconnected => {
                        warn!("Signaling connection lost");
                        break;
                    }
                    SignalingEvent::FrameReceived(frame) => match codec.decode(&frame) {
                        Ok(envelope) => {
                            info!(
                                "{} from {} to {}",
                                envelope.signaling_type(),
                                envelope.sender,
                                envelope
                                    .target
                                    .as_ref()
                                    .map(PeerId::as_str)
                                    .unwrap_or("room")
                            );
                            let new_call = matches!(
                                envelope.signal,
                                Signal::CallOffer {
                                    renegotiate: false,
                                    ..
                                }
                            );
                            if busy && new_call {
                                signaler
                                    .send(
                                        Some(&envelope.sender),
                                        Signal::CallBusy {
                                            reason: Some(peercall::call::BUSY_REASON.into()),
                                        },
                                    )
                                    .await;
                            }
                        }
                        Err(e) => warn!("Undecodable frame: {e}"),
                    },
                }
            }
            transport.disconnect().await;
        }
    }
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let cli = Cli::parse();

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!("Failed to build tokio runtime: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = rt.block_on(run(cli)) {
        error!("{e:#}");
        std::process::exit(1);
    }
}
