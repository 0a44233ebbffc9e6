//! The remote experience: one XR frame loop iteration at a time.
//!
//! Each `poll_and_render_frame` waits for the compositor's display-time
//! prediction, composites the freshest decoded sample (or freeze-frames
//! the previous one), submits the layer stack at the predicted time, and
//! reports head pose plus frame timing back on the data channel.

use std::process;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, error, warn};

use mirage_proto::{
    up_message::Payload, EnvBlendMode, FrameTimingReport, TrackingReport, UpMessage,
};

use crate::connection::MessageSink;
use crate::passthrough::{PassthroughPolicy, DEFAULT_BLACK_THRESHOLD};
use crate::sample::Sample;
use crate::stream::SampleSource;
use crate::swapchain::SwapchainFramebuffers;
use crate::xr::{
    now_monotonic, BlendMode, EyeExtents, LayerPlan, MonotonicTime, ProjectionLayerDesc,
    ProjectionView, SessionState, View, XrDriver, XrError, XrTime,
};

/// Swapchain image waits longer than this get logged.
const SWAPCHAIN_WAIT_WARN: Duration = Duration::from_millis(2);

/// Parameters for the composited draw of one sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrawInfo {
    pub texture: u32,
    pub texture_target: u32,
    /// When set, the shader keys luma below this threshold to transparent
    /// (additive emulated over alpha-blend).
    pub alpha_for_additive: Option<f32>,
}

#[derive(Debug, thiserror::Error)]
#[error("render error: {0}")]
pub struct RenderError(pub String);

/// The composited-draw contract; the GL shader path behind it is an
/// external collaborator.
pub trait FrameRenderer: Send {
    fn draw(
        &mut self,
        framebuffer: u32,
        viewport: (i32, i32),
        clear_color: [f32; 4],
        info: &DrawInfo,
    ) -> Result<(), RenderError>;
}

/// Transient per-frame failures. Fatal ones abort instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    WaitFrame,
    LocateViews,
    Egl,
    Clock,
}

/// Outcome of one loop iteration, so the caller can reason about layer
/// inclusion and stream health.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollRenderResult {
    NewSample,
    ReusedSample,
    NoSample,
    ShouldNotRender,
    Error(FrameError),
}

impl PollRenderResult {
    pub fn includes_layer(self) -> bool {
        matches!(self, Self::NewSample | Self::ReusedSample)
    }
}

struct PendingTiming {
    frame_sequence_id: i64,
    decode_complete_time: MonotonicTime,
}

pub struct RemoteExperience {
    sink: Box<dyn MessageSink>,
    stream: Box<dyn SampleSource>,
    driver: Box<dyn XrDriver>,
    renderer: Box<dyn FrameRenderer>,
    buffers: SwapchainFramebuffers,
    passthrough: Box<dyn PassthroughPolicy>,
    eye_extents: EyeExtents,
    prev_sample: Option<Sample>,
    pending_timing: Option<PendingTiming>,
    next_up_message_id: AtomicI64,
}

impl RemoteExperience {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sink: Box<dyn MessageSink>,
        stream: Box<dyn SampleSource>,
        driver: Box<dyn XrDriver>,
        renderer: Box<dyn FrameRenderer>,
        buffers: SwapchainFramebuffers,
        mut passthrough: Box<dyn PassthroughPolicy>,
        eye_extents: EyeExtents,
    ) -> Self {
        // Start with passthrough enabled where the device allows it.
        passthrough.set_blend_mode(BlendMode::Additive);

        Self {
            sink,
            stream,
            driver,
            renderer,
            buffers,
            passthrough,
            eye_extents,
            prev_sample: None,
            pending_timing: None,
            next_up_message_id: AtomicI64::new(1),
        }
    }

    /// Drain runtime events; the returned state gates the frame loop.
    pub fn poll_session_state(&mut self) -> Result<SessionState, XrError> {
        self.driver.poll_session_state()
    }

    /// One frame-loop iteration.
    pub fn poll_and_render_frame(&mut self) -> PollRenderResult {
        let frame_state = match self.driver.wait_frame() {
            Ok(state) => state,
            Err(err) => {
                error!(%err, "wait_frame failed");
                return PollRenderResult::Error(FrameError::WaitFrame);
            }
        };

        if let Err(err) = self.driver.begin_frame() {
            // The frame interlock is broken; the runtime state is
            // inconsistent beyond recovery.
            error!(%err, "begin_frame failed");
            process::abort();
        }

        let Some(begin_frame_time) = now_monotonic() else {
            error!("monotonic clock read failed, skipping frame");
            return PollRenderResult::Error(FrameError::Clock);
        };

        let views = match self.driver.locate_views(frame_state.predicted_display_time) {
            Ok(views) => views,
            Err(err) => {
                error!(%err, "failed to locate views");
                return PollRenderResult::Error(FrameError::LocateViews);
            }
        };

        let egl_scope = match self.stream.egl_begin_pbuffer() {
            Ok(scope) => scope,
            Err(err) => {
                error!(%err, "failed to make EGL context current");
                return PollRenderResult::Error(FrameError::Egl);
            }
        };

        let mut result = PollRenderResult::ShouldNotRender;
        let mut blend_mode = BlendMode::Opaque;
        let mut plan = LayerPlan::empty();

        if frame_state.should_render {
            let mut projection_views = self.projection_views(&views);
            result = Self::inner_render(
                self.stream.as_ref(),
                self.driver.as_mut(),
                self.renderer.as_mut(),
                &self.buffers,
                self.passthrough.as_mut(),
                self.eye_extents,
                &mut self.prev_sample,
                &mut self.pending_timing,
                &mut projection_views,
            );

            let contribution = self.passthrough.composition_layer();
            blend_mode = contribution.env_blend_mode;
            plan.passthrough = contribution.include_passthrough;
            if result.includes_layer() {
                plan.projection = Some(ProjectionLayerDesc {
                    flags: contribution.projection_layer_flags,
                    views: projection_views,
                });
            }
        }

        if let Err(err) =
            self.driver
                .end_frame(frame_state.predicted_display_time, blend_mode, &plan)
        {
            error!(%err, "end_frame failed");
        }

        drop(egl_scope);

        self.report_pose(frame_state.predicted_display_time);
        if let Some(timing) = self.pending_timing.take() {
            self.report_frame_timing(timing, begin_frame_time, frame_state.predicted_display_time);
        }

        result
    }

    /// Side-by-side halves of the single swapchain image. The only site to
    /// change for an array/multiview swapchain.
    fn projection_views(&self, views: &[View; 2]) -> [ProjectionView; 2] {
        let EyeExtents { width, height } = self.eye_extents;
        [
            ProjectionView {
                pose: views[0].pose,
                fov: views[0].fov,
                x_offset: 0,
                width,
                height,
            },
            ProjectionView {
                pose: views[1].pose,
                fov: views[1].fov,
                x_offset: width,
                width,
                height,
            },
        ]
    }

    /// Takes disjoint field borrows rather than `&mut self` so that a live
    /// [`crate::egl::EglScope`] borrowing `self.stream` at the call site
    /// doesn't conflict with the rest of the frame's field access.
    #[allow(clippy::too_many_arguments)]
    fn inner_render(
        stream: &dyn SampleSource,
        driver: &mut dyn XrDriver,
        renderer: &mut dyn FrameRenderer,
        buffers: &SwapchainFramebuffers,
        passthrough: &mut dyn PassthroughPolicy,
        eye_extents: EyeExtents,
        prev_sample: &mut Option<Sample>,
        pending_timing: &mut Option<PendingTiming>,
        projection_views: &mut [ProjectionView; 2],
    ) -> PollRenderResult {
        let sample = match stream.try_pull_sample() {
            Some(sample) => sample,
            None => {
                if let Some(prev) = prev_sample.as_ref() {
                    // Freeze-frame fallback: recomposite the held texture
                    // with its original render poses against the current
                    // predicted views.
                    projection_views[0].pose = prev.poses[0];
                    projection_views[1].pose = prev.poses[1];
                    return PollRenderResult::ReusedSample;
                }
                return PollRenderResult::NoSample;
            }
        };

        let mut black_threshold = DEFAULT_BLACK_THRESHOLD;
        if sample.env_blend_mode != EnvBlendMode::Unset {
            if let Some(mode) = BlendMode::from_env(sample.env_blend_mode) {
                passthrough.set_blend_mode(mode);
            }
            if let Some(threshold) = sample.additive_black_threshold {
                black_threshold = threshold;
            }
        }

        projection_views[0].pose = sample.poses[0];
        projection_views[1].pose = sample.poses[1];

        let image_index = match driver.acquire_swapchain_image() {
            Ok(index) => index,
            Err(err) => {
                error!(%err, "failed to acquire swapchain image");
                process::abort();
            }
        };

        let wait_start = Instant::now();
        if let Err(err) = driver.wait_swapchain_image() {
            error!(%err, "failed to wait for swapchain image");
            process::abort();
        }
        let waited = wait_start.elapsed();
        if waited > SWAPCHAIN_WAIT_WARN {
            warn!("swapchain image wait took {:.2} ms", waited.as_secs_f64() * 1e3);
        }

        let Some(framebuffer) = buffers.framebuffer_at(image_index) else {
            // The mapping was built from this swapchain's own images; an
            // unknown index means the runtime handed us garbage.
            error!(image_index, "no framebuffer for swapchain image");
            process::abort();
        };

        let EyeExtents { width, height } = eye_extents;
        let info = DrawInfo {
            texture: sample.frame_texture_id,
            texture_target: sample.frame_texture_target,
            alpha_for_additive: passthrough
                .use_alpha_blend_for_additive()
                .then_some(black_threshold),
        };
        if let Err(err) = renderer.draw(
            framebuffer,
            (width * 2, height),
            passthrough.clear_color(),
            &info,
        ) {
            error!(%err, "composite draw failed");
        }

        if let Err(err) = driver.release_swapchain_image() {
            error!(%err, "failed to release swapchain image");
        }

        *pending_timing = Some(PendingTiming {
            frame_sequence_id: sample.frame_sequence_id,
            decode_complete_time: sample.decode_complete_time,
        });

        if let Some(prev) = prev_sample.take() {
            stream.release_sample(prev);
        }
        *prev_sample = Some(sample);

        PollRenderResult::NewSample
    }

    fn emit_up_message(&self, payload: Payload) -> bool {
        let msg = UpMessage {
            up_message_id: self.next_up_message_id.fetch_add(1, Ordering::Relaxed),
            payload: Some(payload),
        };
        debug!(id = msg.up_message_id, "sending up message");
        self.sink.send_bytes(encode(&msg))
    }

    fn report_pose(&mut self, display_time: XrTime) {
        let pose = match self.driver.locate_view_in_world(display_time) {
            Ok(pose) => pose,
            Err(err) => {
                error!(%err, "failed to locate view space");
                return;
            }
        };
        let sent = self.emit_up_message(Payload::Tracking(TrackingReport {
            pose: Some(pose.to_proto()),
        }));
        if !sent {
            debug!("pose report not sent");
        }
    }

    fn report_frame_timing(
        &mut self,
        timing: PendingTiming,
        begin_frame_time: MonotonicTime,
        display_time: XrTime,
    ) {
        let decode_complete_time = match self.driver.to_xr_time(timing.decode_complete_time) {
            Ok(time) => time,
            Err(err) => {
                warn!(%err, "failed to convert decode-complete time");
                return;
            }
        };
        let begin_frame_time = match self.driver.to_xr_time(begin_frame_time) {
            Ok(time) => time,
            Err(err) => {
                warn!(%err, "failed to convert begin-frame time");
                return;
            }
        };
        self.emit_up_message(Payload::Frame(FrameTimingReport {
            frame_sequence_id: timing.frame_sequence_id,
            decode_complete_time,
            begin_frame_time,
            display_time,
        }));
    }
}

impl Drop for RemoteExperience {
    fn drop(&mut self) {
        if let Some(prev) = self.prev_sample.take() {
            self.stream.release_sample(prev);
        }
    }
}

fn encode(msg: &UpMessage) -> Bytes {
    mirage_proto::encode_up_framed(msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::egl::{EglError, EglLock, EglScope, NullEglContext};
    use crate::passthrough::BlendModePassthrough;
    use crate::xr::{FrameState, Fov, Pose};
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, PartialEq)]
    enum DriverCall {
        WaitFrame,
        BeginFrame,
        LocateViews,
        Acquire,
        WaitImage,
        Release,
        EndFrame {
            blend_mode: BlendMode,
            layer_count: usize,
            projection_poses: Option<[Pose; 2]>,
        },
    }

    struct ScriptedDriver {
        should_render: Vec<bool>,
        frame: usize,
        calls: Arc<Mutex<Vec<DriverCall>>>,
    }

    impl ScriptedDriver {
        fn new(should_render: Vec<bool>, calls: Arc<Mutex<Vec<DriverCall>>>) -> Self {
            Self {
                should_render,
                frame: 0,
                calls,
            }
        }

        fn log(&self, call: DriverCall) {
            self.calls.lock().unwrap().push(call);
        }
    }

    impl XrDriver for ScriptedDriver {
        fn poll_session_state(&mut self) -> Result<SessionState, XrError> {
            Ok(SessionState::Focused)
        }

        fn wait_frame(&mut self) -> Result<FrameState, XrError> {
            self.log(DriverCall::WaitFrame);
            let should_render = self.should_render.get(self.frame).copied().unwrap_or(true);
            self.frame += 1;
            Ok(FrameState {
                predicted_display_time: 1_000_000 * self.frame as i64,
                should_render,
            })
        }

        fn begin_frame(&mut self) -> Result<(), XrError> {
            self.log(DriverCall::BeginFrame);
            Ok(())
        }

        fn locate_views(&mut self, _display_time: XrTime) -> Result<[View; 2], XrError> {
            self.log(DriverCall::LocateViews);
            let view = View {
                pose: Pose::IDENTITY,
                fov: Fov {
                    angle_left: -0.8,
                    angle_right: 0.8,
                    angle_up: 0.8,
                    angle_down: -0.8,
                },
            };
            Ok([view; 2])
        }

        fn acquire_swapchain_image(&mut self) -> Result<u32, XrError> {
            self.log(DriverCall::Acquire);
            Ok(0)
        }

        fn wait_swapchain_image(&mut self) -> Result<(), XrError> {
            self.log(DriverCall::WaitImage);
            Ok(())
        }

        fn release_swapchain_image(&mut self) -> Result<(), XrError> {
            self.log(DriverCall::Release);
            Ok(())
        }

        fn end_frame(
            &mut self,
            _display_time: XrTime,
            blend_mode: BlendMode,
            plan: &LayerPlan,
        ) -> Result<(), XrError> {
            self.log(DriverCall::EndFrame {
                blend_mode,
                layer_count: plan.layer_count(),
                projection_poses: plan.projection.map(|p| [p.views[0].pose, p.views[1].pose]),
            });
            Ok(())
        }

        fn locate_view_in_world(&mut self, _time: XrTime) -> Result<Pose, XrError> {
            Ok(Pose {
                position: [0.0, 1.6, 0.0],
                orientation: [0.0, 0.0, 0.0, 1.0],
            })
        }

        fn to_xr_time(&self, time: MonotonicTime) -> Result<XrTime, XrError> {
            Ok(time.secs * 1_000_000_000 + time.nanos)
        }
    }

    struct QueueSource {
        queue: Mutex<VecDeque<Sample>>,
        released: Arc<Mutex<Vec<u32>>>,
        egl: EglLock,
    }

    impl QueueSource {
        fn new(samples: Vec<Sample>, released: Arc<Mutex<Vec<u32>>>) -> Self {
            Self {
                queue: Mutex::new(samples.into()),
                released,
                egl: EglLock::new(Box::new(NullEglContext)),
            }
        }
    }

    impl SampleSource for QueueSource {
        fn try_pull_sample(&self) -> Option<Sample> {
            self.queue.lock().unwrap().pop_front()
        }

        fn release_sample(&self, sample: Sample) {
            self.released.lock().unwrap().push(sample.frame_texture_id);
        }

        fn egl_begin_pbuffer(&self) -> Result<EglScope<'_>, EglError> {
            self.egl.acquire_pbuffer()
        }
    }

    struct RecordingSink {
        sent: Arc<Mutex<Vec<UpMessage>>>,
    }

    impl MessageSink for RecordingSink {
        fn send_bytes(&self, payload: Bytes) -> bool {
            let msg = mirage_proto::decode_up_framed(&payload).unwrap();
            self.sent.lock().unwrap().push(msg);
            true
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Draw {
        framebuffer: u32,
        viewport: (i32, i32),
        clear_color: [f32; 4],
        info: DrawInfo,
    }

    struct RecordingRenderer {
        draws: Arc<Mutex<Vec<Draw>>>,
    }

    impl FrameRenderer for RecordingRenderer {
        fn draw(
            &mut self,
            framebuffer: u32,
            viewport: (i32, i32),
            clear_color: [f32; 4],
            info: &DrawInfo,
        ) -> Result<(), RenderError> {
            self.draws.lock().unwrap().push(Draw {
                framebuffer,
                viewport,
                clear_color,
                info: *info,
            });
            Ok(())
        }
    }

    fn sample(seq: i64, texture: u32, blend: EnvBlendMode, threshold: Option<f32>) -> Sample {
        let pose = Pose {
            position: [0.0, 1.6, 0.0],
            orientation: [0.0, 0.0, 0.0, 1.0],
        };
        Sample {
            frame_texture_id: texture,
            frame_texture_target: 0x0DE1,
            poses: [pose; 2],
            env_blend_mode: blend,
            additive_black_threshold: threshold,
            frame_sequence_id: seq,
            decode_complete_time: MonotonicTime { secs: 1, nanos: 0 },
        }
    }

    struct Harness {
        experience: RemoteExperience,
        calls: Arc<Mutex<Vec<DriverCall>>>,
        sent: Arc<Mutex<Vec<UpMessage>>>,
        released: Arc<Mutex<Vec<u32>>>,
        draws: Arc<Mutex<Vec<Draw>>>,
    }

    fn harness(
        samples: Vec<Sample>,
        should_render: Vec<bool>,
        available_modes: Vec<BlendMode>,
    ) -> Harness {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sent = Arc::new(Mutex::new(Vec::new()));
        let released = Arc::new(Mutex::new(Vec::new()));
        let draws = Arc::new(Mutex::new(Vec::new()));

        let buffers = SwapchainFramebuffers::from_images(&[7, 8, 9], &mut |image| Ok(image + 100))
            .unwrap();

        let experience = RemoteExperience::new(
            Box::new(RecordingSink {
                sent: Arc::clone(&sent),
            }),
            Box::new(QueueSource::new(samples, Arc::clone(&released))),
            Box::new(ScriptedDriver::new(should_render, Arc::clone(&calls))),
            Box::new(RecordingRenderer {
                draws: Arc::clone(&draws),
            }),
            buffers,
            Box::new(BlendModePassthrough::new(available_modes)),
            EyeExtents {
                width: 1280,
                height: 720,
            },
        );

        Harness {
            experience,
            calls,
            sent,
            released,
            draws,
        }
    }

    fn end_frames(calls: &Arc<Mutex<Vec<DriverCall>>>) -> Vec<DriverCall> {
        calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| matches!(c, DriverCall::EndFrame { .. }))
            .cloned()
            .collect()
    }

    #[test]
    fn should_not_render_still_pairs_begin_and_end_with_no_layers() {
        let mut h = harness(vec![], vec![false], vec![BlendMode::Opaque]);
        let result = h.experience.poll_and_render_frame();
        assert_eq!(result, PollRenderResult::ShouldNotRender);

        let calls = h.calls.lock().unwrap().clone();
        assert!(calls.contains(&DriverCall::BeginFrame));
        match calls.last().unwrap() {
            DriverCall::EndFrame {
                blend_mode,
                layer_count,
                ..
            } => {
                assert_eq!(*blend_mode, BlendMode::Opaque);
                assert_eq!(*layer_count, 0);
            }
            other => panic!("unexpected final call: {other:?}"),
        }
        // No sample was composited, so no swapchain traffic either.
        assert!(!calls.contains(&DriverCall::Acquire));
    }

    #[test]
    fn new_sample_renders_and_reports_timing() {
        let mut h = harness(
            vec![sample(42, 5, EnvBlendMode::Unset, None)],
            vec![true],
            vec![BlendMode::Opaque],
        );
        let result = h.experience.poll_and_render_frame();
        assert_eq!(result, PollRenderResult::NewSample);

        // Acquire/wait/draw/release happened in order.
        let calls = h.calls.lock().unwrap().clone();
        let order: Vec<usize> = [
            DriverCall::Acquire,
            DriverCall::WaitImage,
            DriverCall::Release,
        ]
        .iter()
        .map(|c| calls.iter().position(|x| x == c).unwrap())
        .collect();
        assert!(order[0] < order[1] && order[1] < order[2]);

        let draws = h.draws.lock().unwrap();
        assert_eq!(draws.len(), 1);
        assert_eq!(draws[0].framebuffer, 107);
        assert_eq!(draws[0].viewport, (2560, 720));
        assert_eq!(draws[0].info.texture, 5);

        // One pose report and one frame-timing report, in that order,
        // with distinct monotonic ids.
        let sent = h.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert!(matches!(sent[0].payload, Some(Payload::Tracking(_))));
        match &sent[1].payload {
            Some(Payload::Frame(report)) => {
                assert_eq!(report.frame_sequence_id, 42);
                assert!(report.display_time > 0);
                assert_eq!(report.decode_complete_time, 1_000_000_000);
            }
            other => panic!("unexpected payload: {other:?}"),
        }
        assert!(sent[1].up_message_id > sent[0].up_message_id);
    }

    #[test]
    fn freeze_frame_reuses_previous_sample() {
        let mut h = harness(
            vec![sample(1, 5, EnvBlendMode::Unset, None)],
            vec![true, true, true],
            vec![BlendMode::Opaque],
        );

        assert_eq!(
            h.experience.poll_and_render_frame(),
            PollRenderResult::NewSample
        );
        // The stream stalls; the loop keeps compositing the held sample.
        assert_eq!(
            h.experience.poll_and_render_frame(),
            PollRenderResult::ReusedSample
        );
        assert_eq!(
            h.experience.poll_and_render_frame(),
            PollRenderResult::ReusedSample
        );

        // The projection layer stays included with the sample's poses.
        let ends = end_frames(&h.calls);
        for end in &ends {
            match end {
                DriverCall::EndFrame {
                    layer_count,
                    projection_poses,
                    ..
                } => {
                    assert_eq!(*layer_count, 1);
                    let poses = projection_poses.unwrap();
                    assert_eq!(poses[0].position, [0.0, 1.6, 0.0]);
                }
                _ => unreachable!(),
            }
        }

        // Pose reports every frame, frame-timing only for the new sample.
        let sent = h.sent.lock().unwrap();
        let timing_reports = sent
            .iter()
            .filter(|m| matches!(m.payload, Some(Payload::Frame(_))))
            .count();
        let pose_reports = sent
            .iter()
            .filter(|m| matches!(m.payload, Some(Payload::Tracking(_))))
            .count();
        assert_eq!(timing_reports, 1);
        assert_eq!(pose_reports, 3);

        // The held texture was never released mid-reuse.
        assert!(h.released.lock().unwrap().is_empty());
    }

    #[test]
    fn no_sample_and_no_history_yields_no_layer() {
        let mut h = harness(vec![], vec![true], vec![BlendMode::Opaque]);
        assert_eq!(
            h.experience.poll_and_render_frame(),
            PollRenderResult::NoSample
        );
        match end_frames(&h.calls).last().unwrap() {
            DriverCall::EndFrame { layer_count, .. } => assert_eq!(*layer_count, 0),
            _ => unreachable!(),
        }
    }

    #[test]
    fn additive_metadata_drives_policy_and_shader_path() {
        // Device without native additive: emulation over alpha-blend.
        let mut h = harness(
            vec![sample(7, 3, EnvBlendMode::Additive, Some(0.02))],
            vec![true],
            vec![BlendMode::Opaque, BlendMode::AlphaBlend],
        );
        assert_eq!(
            h.experience.poll_and_render_frame(),
            PollRenderResult::NewSample
        );

        assert_eq!(h.experience.passthrough.blend_mode(), BlendMode::Additive);

        let draws = h.draws.lock().unwrap();
        assert_eq!(draws[0].clear_color[3], 0.0);
        assert_eq!(draws[0].info.alpha_for_additive, Some(0.02));

        match end_frames(&h.calls).last().unwrap() {
            DriverCall::EndFrame { blend_mode, .. } => {
                assert_eq!(*blend_mode, BlendMode::AlphaBlend);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn superseded_sample_is_released_exactly_once() {
        let mut h = harness(
            vec![
                sample(1, 11, EnvBlendMode::Unset, None),
                sample(2, 22, EnvBlendMode::Unset, None),
            ],
            vec![true, true],
            vec![BlendMode::Opaque],
        );
        assert_eq!(
            h.experience.poll_and_render_frame(),
            PollRenderResult::NewSample
        );
        assert_eq!(
            h.experience.poll_and_render_frame(),
            PollRenderResult::NewSample
        );
        assert_eq!(*h.released.lock().unwrap(), vec![11]);
    }

    #[test]
    fn held_sample_is_released_on_drop() {
        let released = {
            let mut h = harness(
                vec![sample(1, 11, EnvBlendMode::Unset, None)],
                vec![true],
                vec![BlendMode::Opaque],
            );
            h.experience.poll_and_render_frame();
            let released = Arc::clone(&h.released);
            drop(h);
            released
        };
        assert_eq!(*released.lock().unwrap(), vec![11]);
    }

    /// A stalled stream over many frames: pose telemetry continues at the
    /// frame rate, no frame-timing reports are emitted.
    #[test]
    fn stall_keeps_pose_telemetry_flowing() {
        let mut h = harness(
            vec![sample(1, 1, EnvBlendMode::Unset, None)],
            vec![true; 60],
            vec![BlendMode::Opaque],
        );
        assert_eq!(
            h.experience.poll_and_render_frame(),
            PollRenderResult::NewSample
        );
        for _ in 0..59 {
            assert_eq!(
                h.experience.poll_and_render_frame(),
                PollRenderResult::ReusedSample
            );
        }
        let sent = h.sent.lock().unwrap();
        let pose_reports = sent
            .iter()
            .filter(|m| matches!(m.payload, Some(Payload::Tracking(_))))
            .count();
        let timing_reports = sent
            .iter()
            .filter(|m| matches!(m.payload, Some(Payload::Frame(_))))
            .count();
        assert_eq!(pose_reports, 60);
        assert_eq!(timing_reports, 1);
    }
}
