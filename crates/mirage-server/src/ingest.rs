//! Frame ingest: the seam between the renderer/encoder process and the
//! streaming pipeline.
//!
//! Records are length-framed on a byte stream:
//!
//! ```text
//! [u32 meta_len][DownMessage bytes][u32 au_len][Annex-B access unit]
//! ```
//!
//! The DownMessage carries the render pose and blend hints for the access
//! unit that follows; its sequence id is ignored, the pipeline latches its
//! own. On end-of-stream or a framing error the source is reopened rather
//! than tearing the pipeline down.

use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{info, warn};

use mirage_common::{Error, Result};
use mirage_proto::DownMessage;

use crate::pipeline::{RenderedFrame, VideoPipeline};
use crate::record::is_h264_keyframe;

const MAX_META_LEN: u32 = 64 * 1024;
const MAX_AU_LEN: u32 = 16 * 1024 * 1024;
const RESTART_DELAY: Duration = Duration::from_millis(500);

/// Drive the pipeline from a restartable byte source until the task is
/// cancelled.
pub async fn run<R, F>(mut make_source: F, mut pipeline: VideoPipeline)
where
    F: FnMut() -> R,
    R: AsyncRead + Unpin,
{
    loop {
        let mut source = make_source();
        info!("ingest source opened");
        loop {
            match read_record(&mut source).await {
                Ok(Some(frame)) => {
                    if let Err(err) = pipeline.push_frame(frame).await {
                        warn!(%err, "frame dropped");
                    }
                }
                Ok(None) => {
                    info!("ingest source reached end of stream, restarting");
                    break;
                }
                Err(err) => {
                    warn!(%err, "ingest framing error, restarting source");
                    break;
                }
            }
        }
        tokio::time::sleep(RESTART_DELAY).await;
    }
}

/// Read one framed record. `Ok(None)` is a clean end-of-stream at a record
/// boundary.
async fn read_record<R: AsyncRead + Unpin>(source: &mut R) -> Result<Option<RenderedFrame>> {
    let meta_len = match source.read_u32().await {
        Ok(len) => len,
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    if meta_len > MAX_META_LEN {
        return Err(Error::pipeline(format!("metadata record too large: {meta_len}")));
    }
    let mut meta_buf = vec![0u8; meta_len as usize];
    source.read_exact(&mut meta_buf).await?;
    let meta: DownMessage =
        mirage_proto::decode_down(&meta_buf).map_err(Error::serialization)?;

    let au_len = source.read_u32().await?;
    if au_len == 0 || au_len > MAX_AU_LEN {
        return Err(Error::pipeline(format!("access unit length out of range: {au_len}")));
    }
    let mut au = vec![0u8; au_len as usize];
    source.read_exact(&mut au).await?;

    let frame = meta.frame.unwrap_or_default();
    let keyframe = is_h264_keyframe(&au);
    Ok(Some(RenderedFrame {
        access_unit: Bytes::from(au),
        poses: frame.poses.clone(),
        env_blend_mode: frame.blend_mode(),
        additive_black_threshold: frame.additive_black_threshold,
        keyframe,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mirage_proto::{EnvBlendMode, FrameMeta, Pose, Quat, Vec3};
    use std::io::Cursor;

    fn record(meta: &DownMessage, au: &[u8]) -> Vec<u8> {
        let meta_bytes = mirage_proto::encode_down(meta);
        let mut out = Vec::new();
        out.extend_from_slice(&(meta_bytes.len() as u32).to_be_bytes());
        out.extend_from_slice(&meta_bytes);
        out.extend_from_slice(&(au.len() as u32).to_be_bytes());
        out.extend_from_slice(au);
        out
    }

    fn meta() -> DownMessage {
        DownMessage {
            frame: Some(FrameMeta {
                frame_sequence_id: 0,
                poses: vec![Pose {
                    position: Some(Vec3 { x: 1.0, y: 2.0, z: 3.0 }),
                    orientation: Some(Quat { w: 1.0, x: 0.0, y: 0.0, z: 0.0 }),
                }],
                env_blend_mode: EnvBlendMode::Additive as i32,
                additive_black_threshold: Some(0.02),
            }),
        }
    }

    #[tokio::test]
    async fn reads_framed_records() {
        let au = [0x00, 0x00, 0x00, 0x01, 0x65, 0xAA];
        let bytes = record(&meta(), &au);
        let mut cursor = Cursor::new(bytes);

        let frame = read_record(&mut cursor).await.unwrap().unwrap();
        assert_eq!(&frame.access_unit[..], &au);
        assert_eq!(frame.env_blend_mode, EnvBlendMode::Additive);
        assert_eq!(frame.additive_black_threshold, Some(0.02));
        assert!(frame.keyframe);

        // Clean EOS at the record boundary.
        assert!(read_record(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn truncated_record_is_an_error() {
        let au = [0x00, 0x00, 0x00, 0x01, 0x41];
        let mut bytes = record(&meta(), &au);
        bytes.truncate(bytes.len() - 2);
        let mut cursor = Cursor::new(bytes);
        assert!(read_record(&mut cursor).await.is_err());
    }

    #[tokio::test]
    async fn oversize_lengths_are_rejected() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(MAX_META_LEN + 1).to_be_bytes());
        let mut cursor = Cursor::new(bytes);
        assert!(read_record(&mut cursor).await.is_err());
    }
}
