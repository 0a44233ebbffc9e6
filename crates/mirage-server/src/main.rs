use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{debug, info};

use mirage_proto::up_message::Payload;
use mirage_server::peer::PeerManager;
use mirage_server::pipeline::{FanOut, VideoPipeline};
use mirage_server::record::DebugRecorder;
use mirage_server::signal::SignalingServer;
use mirage_server::stamp::DownMessageSlot;
use mirage_server::ingest;

#[derive(Parser, Debug)]
#[command(name = "mirage-server")]
struct Args {
    /// Signaling listen address.
    #[arg(long, default_value = "127.0.0.1:8080")]
    listen: SocketAddr,

    /// Record the encoded stream to an MP4 file for debugging.
    #[arg(long)]
    record: Option<PathBuf>,

    /// Nominal frame width written to the debug recording's track header.
    #[arg(long, default_value_t = 2560)]
    record_width: u16,

    /// Nominal frame height written to the debug recording's track header.
    #[arg(long, default_value_t = 720)]
    record_height: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    mirage_common::init_tracing();
    let args = Args::parse();

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let signaling = SignalingServer::bind(args.listen, event_tx).await?;
    info!("signaling on ws://{}/ws", signaling.local_addr());

    let slot = Arc::new(DownMessageSlot::new());
    let fanout = Arc::new(FanOut::new());
    let recorder = args
        .record
        .map(|path| {
            info!("recording encoded stream to {}", path.display());
            DebugRecorder::new(path, args.record_width, args.record_height, 60)
        })
        .transpose()?;
    let pipeline = VideoPipeline::new(Arc::clone(&slot), Arc::clone(&fanout), recorder);

    let (tracking_tx, mut tracking_rx) = mpsc::unbounded_channel();
    let mut peers = PeerManager::new(signaling.handle(), fanout, tracking_tx)?;

    // Encoded frames arrive length-framed on stdin from the renderer
    // process; the reader is reopened on end-of-stream.
    tokio::spawn(ingest::run(tokio::io::stdin, pipeline));

    // Tracking sink: the integration point for the tracked-device side.
    tokio::spawn(async move {
        while let Some(up) = tracking_rx.recv().await {
            match up.payload {
                Some(Payload::Tracking(tracking)) => {
                    debug!(id = up.up_message_id, pose = ?tracking.pose, "pose report");
                }
                Some(Payload::Frame(frame)) => {
                    debug!(
                        id = up.up_message_id,
                        frame = frame.frame_sequence_id,
                        display_time = frame.display_time,
                        "frame timing report"
                    );
                }
                None => {}
            }
        }
    });

    loop {
        tokio::select! {
            maybe_event = event_rx.recv() => match maybe_event {
                Some(event) => peers.handle_event(event).await,
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
        }
    }

    Ok(())
}
