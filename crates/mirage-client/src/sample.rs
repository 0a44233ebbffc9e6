//! Decoded samples and the one-deep ready queue.

use std::sync::Mutex;

use mirage_proto::EnvBlendMode;

use crate::xr::{MonotonicTime, Pose};

/// One decoded frame paired with the metadata it was stamped with. The
/// texture is owned by the decoder and must be released exactly once,
/// which is why samples are not cloneable.
#[derive(Debug)]
pub struct Sample {
    pub frame_texture_id: u32,
    pub frame_texture_target: u32,
    pub poses: [Pose; 2],
    pub env_blend_mode: EnvBlendMode,
    pub additive_black_threshold: Option<f32>,
    pub frame_sequence_id: i64,
    pub decode_complete_time: MonotonicTime,
}

/// One-deep queue between the decode thread and the render thread.
///
/// A newly decoded sample displaces an unconsumed one; the displaced sample
/// is handed back to the caller so its texture can be returned to the
/// decoder before anything else observes the slot. A sample checked out via
/// [`SampleSlot::take`] is untouchable by the decode side until released.
#[derive(Default)]
pub struct SampleSlot {
    ready: Mutex<Option<Sample>>,
}

impl SampleSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a sample, returning the displaced one (to be released).
    pub fn put(&self, sample: Sample) -> Option<Sample> {
        self.ready
            .lock()
            .expect("sample slot poisoned")
            .replace(sample)
    }

    /// Non-blocking: the most recent unconsumed sample, if any.
    pub fn take(&self) -> Option<Sample> {
        self.ready.lock().expect("sample slot poisoned").take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: u32) -> Sample {
        Sample {
            frame_texture_id: id,
            frame_texture_target: 0x0DE1,
            poses: [Pose::IDENTITY; 2],
            env_blend_mode: EnvBlendMode::Unset,
            additive_black_threshold: None,
            frame_sequence_id: i64::from(id),
            decode_complete_time: MonotonicTime::default(),
        }
    }

    #[test]
    fn take_empties_the_slot() {
        let slot = SampleSlot::new();
        assert!(slot.take().is_none());
        assert!(slot.put(sample(1)).is_none());
        assert_eq!(slot.take().unwrap().frame_texture_id, 1);
        assert!(slot.take().is_none());
    }

    #[test]
    fn put_displaces_unconsumed_sample() {
        let slot = SampleSlot::new();
        assert!(slot.put(sample(1)).is_none());
        let displaced = slot.put(sample(2)).unwrap();
        assert_eq!(displaced.frame_texture_id, 1);
        assert_eq!(slot.take().unwrap().frame_texture_id, 2);
    }
}
