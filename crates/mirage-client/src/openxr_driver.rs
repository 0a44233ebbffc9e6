//! [`XrDriver`] backed by the `openxr` crate.
//!
//! The platform layer brings up the loader, instance and session (with the
//! graphics binding current on the EGL context); this driver owns the
//! swapchain, the STAGE and VIEW reference spaces, and the session-state
//! pump. Construction fails when `XR_KHR_convert_timespec_time` was not
//! enabled, since frame-timing reports cannot be produced without it.

use openxr as xr;
use tracing::{info, warn};

use crate::xr::{
    BlendMode, EyeExtents, FrameState, Fov, LayerPlan, MonotonicTime, Pose, SessionState, View,
    XrDriver, XrError, XrTime,
};

pub struct OpenXrDriver<G: xr::Graphics> {
    instance: xr::Instance,
    session: xr::Session<G>,
    frame_waiter: xr::FrameWaiter,
    frame_stream: xr::FrameStream<G>,
    swapchain: xr::Swapchain<G>,
    world_space: xr::Space,
    view_space: xr::Space,
    session_state: SessionState,
    convert_timespec: xr::sys::pfn::ConvertTimespecTimeToTimeKHR,
}

impl<G: xr::Graphics> OpenXrDriver<G> {
    /// Build the driver over an already-created session. The EGL context
    /// must be current on the calling thread: some runtimes require it for
    /// swapchain creation.
    pub fn new(
        instance: xr::Instance,
        session: xr::Session<G>,
        frame_waiter: xr::FrameWaiter,
        frame_stream: xr::FrameStream<G>,
        swapchain_format: G::Format,
        eye_extents: EyeExtents,
    ) -> Result<Self, XrError> {
        let convert_timespec = instance
            .exts()
            .khr_convert_timespec_time
            .ok_or_else(|| {
                XrError::TimeConversion("XR_KHR_convert_timespec_time not enabled".into())
            })?
            .convert_timespec_time_to_time;

        info!("creating side-by-side swapchain");
        let swapchain = session
            .create_swapchain(&xr::SwapchainCreateInfo {
                create_flags: xr::SwapchainCreateFlags::EMPTY,
                usage_flags: xr::SwapchainUsageFlags::COLOR_ATTACHMENT,
                format: swapchain_format,
                sample_count: 1,
                width: (eye_extents.width * 2) as u32,
                height: eye_extents.height as u32,
                face_count: 1,
                array_size: 1,
                mip_count: 1,
            })
            .map_err(|e| XrError::CreateSwapchain(format!("{e:?}")))?;

        let world_space = session
            .create_reference_space(xr::ReferenceSpaceType::STAGE, xr::Posef::IDENTITY)
            .map_err(|e| XrError::CreateSpace(format!("world: {e:?}")))?;
        let view_space = session
            .create_reference_space(xr::ReferenceSpaceType::VIEW, xr::Posef::IDENTITY)
            .map_err(|e| XrError::CreateSpace(format!("view: {e:?}")))?;

        Ok(Self {
            instance,
            session,
            frame_waiter,
            frame_stream,
            swapchain,
            world_space,
            view_space,
            session_state: SessionState::Idle,
            convert_timespec,
        })
    }

    /// Blend modes the system advertises for stereo rendering, for seeding
    /// the passthrough policy.
    pub fn enumerate_blend_modes(
        instance: &xr::Instance,
        system: xr::SystemId,
    ) -> Result<Vec<BlendMode>, XrError> {
        let modes = instance
            .enumerate_environment_blend_modes(
                system,
                xr::ViewConfigurationType::PRIMARY_STEREO,
            )
            .map_err(|e| XrError::PollEvent(format!("{e:?}")))?;
        Ok(modes
            .into_iter()
            .filter_map(|mode| match mode {
                xr::EnvironmentBlendMode::OPAQUE => Some(BlendMode::Opaque),
                xr::EnvironmentBlendMode::ADDITIVE => Some(BlendMode::Additive),
                xr::EnvironmentBlendMode::ALPHA_BLEND => Some(BlendMode::AlphaBlend),
                _ => None,
            })
            .collect())
    }

    /// The swapchain's images, for building the framebuffer table.
    pub fn enumerate_images(&self) -> Result<Vec<G::SwapchainImage>, XrError> {
        self.swapchain
            .enumerate_images()
            .map_err(|e| XrError::CreateSwapchain(format!("{e:?}")))
    }
}

impl<G: xr::Graphics + Send> XrDriver for OpenXrDriver<G> {
    fn poll_session_state(&mut self) -> Result<SessionState, XrError> {
        let mut event_buffer = xr::EventDataBuffer::new();
        while let Some(event) = self
            .instance
            .poll_event(&mut event_buffer)
            .map_err(|e| XrError::PollEvent(format!("{e:?}")))?
        {
            if let xr::Event::SessionStateChanged(changed) = event {
                let state = changed.state();
                info!(?state, "session state changed");
                match state {
                    xr::SessionState::READY => {
                        self.session
                            .begin(xr::ViewConfigurationType::PRIMARY_STEREO)
                            .map_err(|e| {
                                XrError::SessionTransition(format!("begin: {e:?}"))
                            })?;
                    }
                    xr::SessionState::STOPPING => {
                        self.session
                            .end()
                            .map_err(|e| XrError::SessionTransition(format!("end: {e:?}")))?;
                    }
                    _ => {}
                }
                self.session_state = map_session_state(state);
            }
        }
        Ok(self.session_state)
    }

    fn wait_frame(&mut self) -> Result<FrameState, XrError> {
        let state = self
            .frame_waiter
            .wait()
            .map_err(|e| XrError::WaitFrame(format!("{e:?}")))?;
        Ok(FrameState {
            predicted_display_time: state.predicted_display_time.as_nanos(),
            should_render: state.should_render,
        })
    }

    fn begin_frame(&mut self) -> Result<(), XrError> {
        self.frame_stream
            .begin()
            .map_err(|e| XrError::BeginFrame(format!("{e:?}")))
    }

    fn locate_views(&mut self, display_time: XrTime) -> Result<[View; 2], XrError> {
        let (_flags, views) = self
            .session
            .locate_views(
                xr::ViewConfigurationType::PRIMARY_STEREO,
                xr::Time::from_nanos(display_time),
                &self.world_space,
            )
            .map_err(|e| XrError::LocateViews(format!("{e:?}")))?;
        if views.len() < 2 {
            return Err(XrError::LocateViews(format!(
                "expected 2 views, got {}",
                views.len()
            )));
        }
        Ok([from_xr_view(&views[0]), from_xr_view(&views[1])])
    }

    fn acquire_swapchain_image(&mut self) -> Result<u32, XrError> {
        self.swapchain
            .acquire_image()
            .map_err(|e| XrError::AcquireImage(format!("{e:?}")))
    }

    fn wait_swapchain_image(&mut self) -> Result<(), XrError> {
        self.swapchain
            .wait_image(xr::Duration::INFINITE)
            .map_err(|e| XrError::WaitImage(format!("{e:?}")))
    }

    fn release_swapchain_image(&mut self) -> Result<(), XrError> {
        self.swapchain
            .release_image()
            .map_err(|e| XrError::ReleaseImage(format!("{e:?}")))
    }

    fn end_frame(
        &mut self,
        display_time: XrTime,
        blend_mode: BlendMode,
        plan: &LayerPlan,
    ) -> Result<(), XrError> {
        let time = xr::Time::from_nanos(display_time);
        let blend = to_xr_blend_mode(blend_mode);

        if plan.passthrough {
            // Vendor passthrough layers need their extension objects; the
            // blend-mode policy never asks for one.
            warn!("passthrough layer requested but no vendor layer is wired");
        }

        match &plan.projection {
            Some(projection) => {
                let views: Vec<xr::CompositionLayerProjectionView<G>> = projection
                    .views
                    .iter()
                    .map(|view| {
                        xr::CompositionLayerProjectionView::new()
                            .pose(to_xr_pose(view.pose))
                            .fov(to_xr_fov(view.fov))
                            .sub_image(
                                xr::SwapchainSubImage::new()
                                    .swapchain(&self.swapchain)
                                    .image_rect(xr::Rect2Di {
                                        offset: xr::Offset2Di {
                                            x: view.x_offset,
                                            y: 0,
                                        },
                                        extent: xr::Extent2Di {
                                            width: view.width,
                                            height: view.height,
                                        },
                                    })
                                    .image_array_index(0),
                            )
                    })
                    .collect();
                let layer = xr::CompositionLayerProjection::new()
                    .layer_flags(xr::CompositionLayerFlags::from_raw(projection.flags))
                    .space(&self.world_space)
                    .views(&views);
                let layers: [&xr::CompositionLayerBase<G>; 1] = [&layer];
                self.frame_stream
                    .end(time, blend, &layers)
                    .map_err(|e| XrError::EndFrame(format!("{e:?}")))
            }
            None => {
                let layers: [&xr::CompositionLayerBase<G>; 0] = [];
                self.frame_stream
                    .end(time, blend, &layers)
                    .map_err(|e| XrError::EndFrame(format!("{e:?}")))
            }
        }
    }

    fn locate_view_in_world(&mut self, time: XrTime) -> Result<Pose, XrError> {
        let location = self
            .view_space
            .locate(&self.world_space, xr::Time::from_nanos(time))
            .map_err(|e| XrError::LocateSpace(format!("{e:?}")))?;
        Ok(from_xr_pose(location.pose))
    }

    fn to_xr_time(&self, time: MonotonicTime) -> Result<XrTime, XrError> {
        let timespec = libc::timespec {
            tv_sec: time.secs as libc::time_t,
            tv_nsec: time.nanos as libc::c_long,
        };
        let mut out = xr::Time::from_nanos(0);
        // SAFETY: the function pointer was loaded for this instance and
        // both pointers outlive the call.
        let result = unsafe {
            (self.convert_timespec)(self.instance.as_raw(), &timespec, &mut out)
        };
        if result.into_raw() < 0 {
            return Err(XrError::TimeConversion(format!("{result:?}")));
        }
        Ok(out.as_nanos())
    }
}

fn map_session_state(state: xr::SessionState) -> SessionState {
    match state {
        xr::SessionState::READY => SessionState::Ready,
        xr::SessionState::SYNCHRONIZED => SessionState::Synchronized,
        xr::SessionState::VISIBLE => SessionState::Visible,
        xr::SessionState::FOCUSED => SessionState::Focused,
        xr::SessionState::STOPPING => SessionState::Stopping,
        xr::SessionState::LOSS_PENDING => SessionState::LossPending,
        xr::SessionState::EXITING => SessionState::Exiting,
        _ => SessionState::Idle,
    }
}

fn to_xr_blend_mode(mode: BlendMode) -> xr::EnvironmentBlendMode {
    match mode {
        BlendMode::Opaque => xr::EnvironmentBlendMode::OPAQUE,
        BlendMode::Additive => xr::EnvironmentBlendMode::ADDITIVE,
        BlendMode::AlphaBlend => xr::EnvironmentBlendMode::ALPHA_BLEND,
    }
}

fn to_xr_pose(pose: Pose) -> xr::Posef {
    xr::Posef {
        orientation: xr::Quaternionf {
            x: pose.orientation[0],
            y: pose.orientation[1],
            z: pose.orientation[2],
            w: pose.orientation[3],
        },
        position: xr::Vector3f {
            x: pose.position[0],
            y: pose.position[1],
            z: pose.position[2],
        },
    }
}

fn from_xr_pose(pose: xr::Posef) -> Pose {
    Pose {
        position: [pose.position.x, pose.position.y, pose.position.z],
        orientation: [
            pose.orientation.x,
            pose.orientation.y,
            pose.orientation.z,
            pose.orientation.w,
        ],
    }
}

fn to_xr_fov(fov: Fov) -> xr::Fovf {
    xr::Fovf {
        angle_left: fov.angle_left,
        angle_right: fov.angle_right,
        angle_up: fov.angle_up,
        angle_down: fov.angle_down,
    }
}

fn from_xr_view(view: &xr::View) -> View {
    View {
        pose: from_xr_pose(view.pose),
        fov: Fov {
            angle_left: view.fov.angle_left,
            angle_right: view.fov.angle_right,
            angle_up: view.fov.angle_up,
            angle_down: view.fov.angle_down,
        },
    }
}
