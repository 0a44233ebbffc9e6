//! Stream client: owns the receive pipeline on a dedicated thread.
//!
//! RTP packets from the remote track are depacketized into access units
//! (boundary on the marker bit), the header extension at the shared
//! element id is lifted and decoded next to the decoded texture, and the
//! result is published as a [`Sample`] in a one-deep slot the render
//! thread pulls from.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::thread::JoinHandle;

use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use webrtc::rtp::codecs::h264::H264Packet;
use webrtc::rtp::packet::Packet;
use webrtc::rtp::packetizer::Depacketizer;
use webrtc::track::track_remote::TrackRemote;

use mirage_common::{Error, Result};
use mirage_proto::{EnvBlendMode, FrameMeta, RTP_EXTENSION_ID};

use crate::connection::{transport_main, Connection};
use crate::decoder::{DecodedTexture, VideoDecoder};
use crate::egl::{EglContext, EglError, EglLock, EglScope};
use crate::sample::{Sample, SampleSlot};
use crate::xr::{now_monotonic, Pose};

/// Source of decoded samples; implemented by [`StreamClient`] and by the
/// scripted sources the render-loop tests use.
pub trait SampleSource: Send {
    /// Non-blocking. The caller owns the returned sample and must hand it
    /// back through [`release_sample`](Self::release_sample) exactly once.
    fn try_pull_sample(&self) -> Option<Sample>;

    fn release_sample(&self, sample: Sample);

    /// Scoped acquisition of the shared EGL context on the calling thread.
    fn egl_begin_pbuffer(&self) -> std::result::Result<EglScope<'_>, EglError>;
}

struct StreamInner {
    slot: SampleSlot,
    decoder: StdMutex<Box<dyn VideoDecoder>>,
    egl: EglLock,
    stop: watch::Sender<bool>,
}

impl StreamInner {
    fn deliver(&self, au: AccessUnit, last_sequence_id: &mut Option<i64>) {
        let decode_start = now_monotonic().unwrap_or_default();

        let meta: Option<FrameMeta> = au
            .meta
            .as_ref()
            .and_then(|bytes| match mirage_proto::decode_down(bytes) {
                Ok(down) => down.frame,
                Err(err) => {
                    warn!(%err, "undecodable frame metadata dropped");
                    None
                }
            });

        if let Some(meta) = &meta {
            if let Some(last) = *last_sequence_id {
                if meta.frame_sequence_id <= last {
                    debug!(
                        last,
                        got = meta.frame_sequence_id,
                        "frame sequence id went backwards"
                    );
                }
            }
            *last_sequence_id = Some(meta.frame_sequence_id);
        }

        let texture = {
            let mut decoder = self.decoder.lock().expect("decoder poisoned");
            match decoder.decode(&au.data) {
                Ok(texture) => texture,
                Err(err) => {
                    warn!(%err, "frame dropped by decoder");
                    return;
                }
            }
        };

        let mut poses = [Pose::IDENTITY; 2];
        let mut env_blend_mode = EnvBlendMode::Unset;
        let mut additive_black_threshold = None;
        let mut frame_sequence_id = 0;
        if let Some(meta) = meta {
            for (slot, pose) in poses.iter_mut().zip(meta.poses.iter()) {
                *slot = Pose::from_proto(pose);
            }
            env_blend_mode = meta.blend_mode();
            additive_black_threshold = meta.additive_black_threshold;
            frame_sequence_id = meta.frame_sequence_id;
        }

        let sample = Sample {
            frame_texture_id: texture.id,
            frame_texture_target: texture.target,
            poses,
            env_blend_mode,
            additive_black_threshold,
            frame_sequence_id,
            decode_complete_time: now_monotonic().unwrap_or(decode_start),
        };

        if let Some(displaced) = self.slot.put(sample) {
            self.release(displaced);
        }
    }

    fn release(&self, sample: Sample) {
        self.decoder
            .lock()
            .expect("decoder poisoned")
            .release(DecodedTexture {
                id: sample.frame_texture_id,
                target: sample.frame_texture_target,
            });
    }

    fn clear_slot(&self) {
        if let Some(sample) = self.slot.take() {
            self.release(sample);
        }
    }
}

pub struct StreamClient {
    inner: Arc<StreamInner>,
    connection: StdMutex<Option<Connection>>,
    thread: StdMutex<Option<JoinHandle<()>>>,
}

impl StreamClient {
    pub fn new(decoder: Box<dyn VideoDecoder>, egl_context: Box<dyn EglContext>) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                slot: SampleSlot::new(),
                decoder: StdMutex::new(decoder),
                egl: EglLock::new(egl_context),
                stop: watch::Sender::new(false),
            }),
            connection: StdMutex::new(None),
            thread: StdMutex::new(None),
        }
    }

    /// Start the pipeline main loop on a dedicated thread. The thread also
    /// drives the connection's transport task.
    pub fn spawn_thread(
        &self,
        connection: Connection,
        tracks: mpsc::UnboundedReceiver<Arc<TrackRemote>>,
    ) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        let transport_inner = connection.inner();
        *self.connection.lock().expect("connection slot poisoned") = Some(connection);

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let handle = std::thread::Builder::new()
            .name("mirage-stream".into())
            .spawn(move || {
                runtime.block_on(async {
                    tokio::join!(transport_main(transport_inner), stream_main(inner, tracks));
                });
            })
            .map_err(Error::internal)?;
        *self.thread.lock().expect("thread slot poisoned") = Some(handle);
        Ok(())
    }

    /// Terminate the pipeline. After return no further samples will be
    /// produced and the slot is drained.
    pub fn stop(&self) {
        if let Some(connection) = self
            .connection
            .lock()
            .expect("connection slot poisoned")
            .take()
        {
            connection.shutdown();
        }
        self.inner.stop.send_replace(true);
        if let Some(handle) = self.thread.lock().expect("thread slot poisoned").take() {
            if handle.join().is_err() {
                warn!("stream thread panicked");
            }
        }
        self.inner.clear_slot();
    }

    #[cfg(test)]
    pub(crate) fn inject_sample_for_tests(&self, sample: Sample) {
        if let Some(displaced) = self.inner.slot.put(sample) {
            self.inner.release(displaced);
        }
    }
}

impl SampleSource for StreamClient {
    fn try_pull_sample(&self) -> Option<Sample> {
        self.inner.slot.take()
    }

    fn release_sample(&self, sample: Sample) {
        self.inner.release(sample);
    }

    fn egl_begin_pbuffer(&self) -> std::result::Result<EglScope<'_>, EglError> {
        self.inner.egl.acquire_pbuffer()
    }
}

impl Drop for StreamClient {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn stream_main(
    inner: Arc<StreamInner>,
    mut tracks: mpsc::UnboundedReceiver<Arc<TrackRemote>>,
) {
    let mut stop_rx = inner.stop.subscribe();
    loop {
        tokio::select! {
            _ = stop_rx.changed() => {
                if *stop_rx.borrow() {
                    break;
                }
            }
            maybe_track = tracks.recv() => match maybe_track {
                Some(track) => {
                    read_track(&inner, track, &mut stop_rx).await;
                    // The session this track belonged to is gone; a stale
                    // sample must not outlive it.
                    inner.clear_slot();
                }
                None => break,
            }
        }
    }
    inner.clear_slot();
}

async fn read_track(
    inner: &Arc<StreamInner>,
    track: Arc<TrackRemote>,
    stop_rx: &mut watch::Receiver<bool>,
) {
    info!(id = %track.id(), "reading remote track");
    let mut assembler = AccessUnitAssembler::new();
    let mut last_sequence_id = None;
    loop {
        tokio::select! {
            _ = stop_rx.changed() => {
                if *stop_rx.borrow() {
                    return;
                }
            }
            result = track.read_rtp() => match result {
                Ok((packet, _attributes)) => {
                    if let Some(au) = assembler.push(&packet) {
                        inner.deliver(au, &mut last_sequence_id);
                    }
                }
                Err(err) => {
                    debug!(%err, "remote track ended");
                    return;
                }
            }
        }
    }
}

/// One depacketized access unit plus the extension bytes lifted from its
/// marker packet.
pub(crate) struct AccessUnit {
    pub data: Bytes,
    pub meta: Option<Bytes>,
}

/// Reassembles H.264 access units from RTP packets. The marker bit closes
/// an AU; the metadata extension rides on exactly that packet.
pub(crate) struct AccessUnitAssembler {
    depacketizer: H264Packet,
    buffer: BytesMut,
}

impl AccessUnitAssembler {
    pub fn new() -> Self {
        Self {
            depacketizer: H264Packet::default(),
            buffer: BytesMut::new(),
        }
    }

    pub fn push(&mut self, packet: &Packet) -> Option<AccessUnit> {
        match self.depacketizer.depacketize(&packet.payload) {
            Ok(fragment) => self.buffer.extend_from_slice(&fragment),
            Err(err) => debug!(%err, "undecodable RTP payload skipped"),
        }

        if !packet.header.marker {
            return None;
        }

        let meta = packet.header.get_extension(RTP_EXTENSION_ID);
        let data = std::mem::take(&mut self.buffer).freeze();
        if data.is_empty() {
            return None;
        }
        Some(AccessUnit { data, meta })
    }
}
