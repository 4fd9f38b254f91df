mod logging;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::oneshot;
use tracing::{info, warn};
use webrtc::api::APIBuilder;
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;

use webrtc_signaler::rpc::{FramePipe, ProcedureNames, RpcSignalerSet};
use webrtc_signaler::rtc::RtcPeer;
use webrtc_signaler::{NegotiationResult, Signaler, SignalerConfig};

use logging::{LogConfig, LogLevel};

/// Pairs two in-process peer connections through RPC-bound signalers and renegotiates them.
#[derive(Parser, Debug)]
#[command(name = "signal-pair")]
struct Cli {
    #[arg(long, default_value_t = 3, env = "SIGNAL_PAIR_ROUNDS")]
    rounds: usize,

    #[arg(long, help = "Start every round from both sides at once")]
    glare: bool,

    #[arg(long, help = "Host candidates only; no STUN server")]
    localhost: bool,

    #[arg(long, default_value = "stun:stun.l.google.com:19302", env = "SIGNAL_PAIR_STUN")]
    stun: String,

    #[arg(long, default_value_t = 10, help = "Seconds to wait for the data channel")]
    open_timeout: u64,

    #[arg(long, value_enum, default_value_t = LogLevel::Info, env = "SIGNAL_LOG_LEVEL")]
    log_level: LogLevel,

    #[arg(long, env = "SIGNAL_LOG_FILE")]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&LogConfig {
        level: cli.log_level,
        file: cli.log_file.clone(),
    })?;

    let ice_servers = if cli.localhost {
        Vec::new()
    } else {
        vec![RTCIceServer {
            urls: vec![cli.stun.clone()],
            ..Default::default()
        }]
    };
    let left_pc = peer_connection(ice_servers.clone()).await?;
    let right_pc = peer_connection(ice_servers).await?;

    let channel = left_pc
        .create_data_channel("signal-pair", None)
        .await
        .context("create data channel")?;
    let (opened_tx, opened_rx) = oneshot::channel();
    channel.on_open(Box::new(move || {
        Box::pin(async move {
            let _ = opened_tx.send(());
        })
    }));
    right_pc.on_data_channel(Box::new(|dc: Arc<RTCDataChannel>| {
        Box::pin(async move {
            let label = dc.label().to_string();
            dc.on_message(Box::new(move |msg: DataChannelMessage| {
                let label = label.clone();
                Box::pin(async move {
                    let text = String::from_utf8_lossy(&msg.data).into_owned();
                    info!(channel = %label, %text, "right peer received message");
                })
            }));
        })
    }));

    let (left_end, right_end) = FramePipe::pair();
    let (to_right, left_inbound) = RpcSignalerSet::new(left_end, ProcedureNames::default());
    let (to_left, right_inbound) = RpcSignalerSet::new(right_end, ProcedureNames::default());
    let left = Signaler::new(RtcPeer::new(left_pc.clone()), to_right, SignalerConfig::new(false));
    let right = Signaler::new(RtcPeer::new(right_pc.clone()), to_left, SignalerConfig::new(true));
    let left_serve = left_inbound.serve(&left);
    let right_serve = right_inbound.serve(&right);

    let mut opened = Some(opened_rx);
    for round in 1..=cli.rounds {
        if cli.glare {
            let (from_left, from_right) = tokio::join!(left.negotiate(), right.negotiate());
            report(round, "left", &from_left);
            report(round, "right", &from_right);
        } else {
            let initiator = if round % 2 == 1 { &left } else { &right };
            let side = if initiator.priority() { "right" } else { "left" };
            report(round, side, &initiator.negotiate().await);
        }

        if let Some(rx) = opened.take() {
            match tokio::time::timeout(Duration::from_secs(cli.open_timeout), rx).await {
                Ok(Ok(())) => {
                    info!("data channel open");
                    if let Err(err) = channel.send_text(format!("hello after round {round}")).await {
                        warn!(error = %err, "failed to send greeting");
                    }
                }
                Ok(Err(_)) => warn!("data channel dropped before opening"),
                Err(_) => warn!(timeout = cli.open_timeout, "data channel did not open"),
            }
        }
    }

    left.close();
    right.close();
    left_serve.abort();
    right_serve.abort();
    let _ = left_pc.close().await;
    let _ = right_pc.close().await;
    Ok(())
}

async fn peer_connection(ice_servers: Vec<RTCIceServer>) -> Result<Arc<RTCPeerConnection>> {
    let api = APIBuilder::new().build();
    let config = RTCConfiguration {
        ice_servers,
        ..Default::default()
    };
    let pc = api
        .new_peer_connection(config)
        .await
        .context("create peer connection")?;
    Ok(Arc::new(pc))
}

fn report(round: usize, side: &str, outcome: &NegotiationResult) {
    match outcome {
        Ok(()) => info!(round, side, "negotiation complete"),
        Err(err) => warn!(round, side, error = %err, "negotiation failed"),
    }
}
