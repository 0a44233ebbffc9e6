//! Debug capture of the encoded stream.
//!
//! When the server is started with a record path, the pipeline forks each
//! access unit into an MP4 file alongside the network branches. Writer
//! initialization is lazy and the file is finalized on drop.

use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;

use anyhow::Result;
use mp4::{AvcConfig, MediaConfig, Mp4Config, Mp4Sample, Mp4Writer, TrackConfig};

pub struct DebugRecorder {
    path: PathBuf,
    writer: Option<Mp4Writer<BufWriter<File>>>,
    video_track_id: u32,
    frame_count: u64,
    width: u16,
    height: u16,
    fps: u32,
}

impl DebugRecorder {
    pub fn new(path: PathBuf, width: u16, height: u16, fps: u32) -> Result<Self> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                std::fs::create_dir_all(dir)?;
            }
        }
        Ok(Self {
            path,
            writer: None,
            video_track_id: 0,
            frame_count: 0,
            width,
            height,
            fps: fps.max(1),
        })
    }

    fn init_writer(&mut self) -> Result<()> {
        let file = File::create(&self.path)?;
        let writer = BufWriter::new(file);

        let config = Mp4Config {
            major_brand: str::parse("isom").unwrap(),
            minor_version: 512,
            compatible_brands: vec![
                str::parse("isom").unwrap(),
                str::parse("iso2").unwrap(),
                str::parse("avc1").unwrap(),
                str::parse("mp41").unwrap(),
            ],
            timescale: 1000,
        };

        let mut mp4_writer = Mp4Writer::write_start(writer, &config)?;

        let video_track_config = TrackConfig {
            track_type: mp4::TrackType::Video,
            timescale: 1000,
            language: String::from("und"),
            media_conf: MediaConfig::AvcConfig(AvcConfig {
                width: self.width,
                height: self.height,
                seq_param_set: vec![],
                pic_param_set: vec![],
            }),
        };
        mp4_writer.add_track(&video_track_config)?;
        self.video_track_id = 1;

        self.writer = Some(mp4_writer);
        self.frame_count = 0;
        Ok(())
    }

    pub fn write_frame(&mut self, access_unit: &[u8], keyframe: bool) -> Result<()> {
        if self.writer.is_none() {
            self.init_writer()?;
        }

        if let Some(ref mut writer) = self.writer {
            let duration = 1000 / u64::from(self.fps);
            let sample = Mp4Sample {
                start_time: self.frame_count * duration,
                duration: duration as u32,
                rendering_offset: 0,
                is_sync: keyframe,
                bytes: access_unit.to_vec().into(),
            };
            writer.write_sample(self.video_track_id, &sample)?;
            self.frame_count += 1;
        }
        Ok(())
    }

    pub fn finalize(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.write_end()?;
        }
        Ok(())
    }
}

impl Drop for DebugRecorder {
    fn drop(&mut self) {
        let _ = self.finalize();
    }
}

/// Check if an Annex-B access unit contains a keyframe (IDR NAL unit).
pub fn is_h264_keyframe(data: &[u8]) -> bool {
    let mut i = 0;
    while i < data.len() {
        if i + 3 < data.len() && data[i] == 0 && data[i + 1] == 0 {
            let nal_start = if data[i + 2] == 1 {
                i + 3
            } else if i + 4 < data.len() && data[i + 2] == 0 && data[i + 3] == 1 {
                i + 4
            } else {
                i += 1;
                continue;
            };

            if nal_start < data.len() && data[nal_start] & 0x1F == 5 {
                return true;
            }
            i = nal_start;
        } else {
            i += 1;
        }
    }
    false
}
