//! The XR runtime seam.
//!
//! The render loop is written against [`XrDriver`], a narrow trait covering
//! exactly the runtime operations one loop iteration needs. The
//! OpenXR-backed implementation lives in [`crate::openxr_driver`]; tests
//! drive the loop with a scripted driver.

use mirage_proto::EnvBlendMode;

/// A point in the XR time domain, in nanoseconds.
pub type XrTime = i64;

/// A reading of the monotonic system clock, convertible into XR time via
/// the runtime's timespec conversion extension.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonotonicTime {
    pub secs: i64,
    pub nanos: i64,
}

/// Read the monotonic clock. `None` when the clock read fails, which the
/// render loop treats as "skip this frame".
#[cfg(unix)]
pub fn now_monotonic() -> Option<MonotonicTime> {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: clock_gettime writes the out-param on success only.
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    if rc != 0 {
        return None;
    }
    Some(MonotonicTime {
        secs: ts.tv_sec as i64,
        nanos: ts.tv_nsec as i64,
    })
}

#[cfg(not(unix))]
pub fn now_monotonic() -> Option<MonotonicTime> {
    None
}

/// Rigid pose: position in meters, orientation quaternion as `[x, y, z, w]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub position: [f32; 3],
    pub orientation: [f32; 4],
}

impl Pose {
    pub const IDENTITY: Pose = Pose {
        position: [0.0; 3],
        orientation: [0.0, 0.0, 0.0, 1.0],
    };

    pub fn from_proto(pose: &mirage_proto::Pose) -> Self {
        let position = pose.position.map_or([0.0; 3], |p| [p.x, p.y, p.z]);
        let orientation = pose
            .orientation
            .map_or([0.0, 0.0, 0.0, 1.0], |q| [q.x, q.y, q.z, q.w]);
        Pose {
            position,
            orientation,
        }
    }

    pub fn to_proto(self) -> mirage_proto::Pose {
        mirage_proto::Pose {
            position: Some(mirage_proto::Vec3 {
                x: self.position[0],
                y: self.position[1],
                z: self.position[2],
            }),
            orientation: Some(mirage_proto::Quat {
                w: self.orientation[3],
                x: self.orientation[0],
                y: self.orientation[1],
                z: self.orientation[2],
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Fov {
    pub angle_left: f32,
    pub angle_right: f32,
    pub angle_up: f32,
    pub angle_down: f32,
}

/// A located view: where one eye is and what it sees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct View {
    pub pose: Pose,
    pub fov: Fov,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameState {
    pub predicted_display_time: XrTime,
    pub should_render: bool,
}

/// Per-eye render target size of the single side-by-side swapchain image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EyeExtents {
    pub width: i32,
    pub height: i32,
}

/// Compositor blend mode. Values track the runtime's numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlendMode {
    Opaque,
    Additive,
    AlphaBlend,
}

impl BlendMode {
    /// `None` for [`EnvBlendMode::Unset`], which means "keep current mode".
    pub fn from_env(mode: EnvBlendMode) -> Option<BlendMode> {
        match mode {
            EnvBlendMode::Unset => None,
            EnvBlendMode::Opaque => Some(BlendMode::Opaque),
            EnvBlendMode::Additive => Some(BlendMode::Additive),
            EnvBlendMode::AlphaBlend => Some(BlendMode::AlphaBlend),
        }
    }
}

/// Composition-layer flag bits, matching the runtime's values.
pub const LAYER_CORRECT_CHROMATIC_ABERRATION: u64 = 0x1;
pub const LAYER_BLEND_TEXTURE_SOURCE_ALPHA: u64 = 0x2;
pub const LAYER_UNPREMULTIPLIED_ALPHA: u64 = 0x4;

/// One eye's contribution to the projection layer. The sub-image rect is a
/// side-by-side half of the single swapchain image; this is the only site
/// that changes if the swapchain moves to an array/multiview layout.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProjectionView {
    pub pose: Pose,
    pub fov: Fov,
    pub x_offset: i32,
    pub width: i32,
    pub height: i32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProjectionLayerDesc {
    pub flags: u64,
    pub views: [ProjectionView; 2],
}

/// What gets submitted at end-of-frame: an optional environment-passthrough
/// layer underneath an optional projection layer.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LayerPlan {
    pub passthrough: bool,
    pub projection: Option<ProjectionLayerDesc>,
}

impl LayerPlan {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn layer_count(&self) -> usize {
        usize::from(self.passthrough) + usize::from(self.projection.is_some())
    }
}

/// XR session lifecycle, ordered the way the runtime orders it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Idle,
    Ready,
    Synchronized,
    Visible,
    Focused,
    Stopping,
    LossPending,
    Exiting,
}

#[derive(Debug, thiserror::Error)]
pub enum XrError {
    #[error("wait_frame failed: {0}")]
    WaitFrame(String),
    #[error("begin_frame failed: {0}")]
    BeginFrame(String),
    #[error("locate_views failed: {0}")]
    LocateViews(String),
    #[error("swapchain image acquire failed: {0}")]
    AcquireImage(String),
    #[error("swapchain image wait failed: {0}")]
    WaitImage(String),
    #[error("swapchain image release failed: {0}")]
    ReleaseImage(String),
    #[error("end_frame failed: {0}")]
    EndFrame(String),
    #[error("locate_space failed: {0}")]
    LocateSpace(String),
    #[error("time conversion failed: {0}")]
    TimeConversion(String),
    #[error("event polling failed: {0}")]
    PollEvent(String),
    #[error("session transition failed: {0}")]
    SessionTransition(String),
    #[error("swapchain creation failed: {0}")]
    CreateSwapchain(String),
    #[error("reference space creation failed: {0}")]
    CreateSpace(String),
}

/// The runtime operations one render-loop iteration needs.
///
/// Implementations own the session, swapchain and reference spaces; the
/// loop only sees indices, times and value types.
pub trait XrDriver: Send {
    /// Drain pending runtime events. Implementations begin the session on
    /// `Ready` and end it on `Stopping`; the returned state gates whether
    /// the frame loop runs at all.
    fn poll_session_state(&mut self) -> Result<SessionState, XrError>;

    /// Blocks until the compositor predicts the next display time.
    fn wait_frame(&mut self) -> Result<FrameState, XrError>;

    fn begin_frame(&mut self) -> Result<(), XrError>;

    fn locate_views(&mut self, display_time: XrTime) -> Result<[View; 2], XrError>;

    fn acquire_swapchain_image(&mut self) -> Result<u32, XrError>;

    /// Blocks until the acquired image is writable (infinite timeout).
    fn wait_swapchain_image(&mut self) -> Result<(), XrError>;

    fn release_swapchain_image(&mut self) -> Result<(), XrError>;

    fn end_frame(
        &mut self,
        display_time: XrTime,
        blend_mode: BlendMode,
        plan: &LayerPlan,
    ) -> Result<(), XrError>;

    /// viewSpace expressed in worldSpace at `time`.
    fn locate_view_in_world(&mut self, time: XrTime) -> Result<Pose, XrError>;

    /// Convert a monotonic clock reading into the XR time domain.
    fn to_xr_time(&self, time: MonotonicTime) -> Result<XrTime, XrError>;
}
