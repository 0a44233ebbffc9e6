//! Lifecycle-driven outer loop.
//!
//! The platform layer (activity glue on device) feeds [`LifecycleEvent`]s;
//! the loop gates rendering on the XR session state and tears the
//! connection down on stop/term-window, rebuilding it on resume.

use std::sync::mpsc::{Receiver, TryRecvError};
use std::time::Duration;

use tracing::{error, info};

use crate::connection::Connection;
use crate::experience::RemoteExperience;
use crate::xr::SessionState;

/// Platform lifecycle commands, in the order the host delivers them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Start,
    Resume,
    Pause,
    Stop,
    TermWindow,
    Destroy,
}

const IDLE_POLL: Duration = Duration::from_millis(100);

/// Drive the experience until the host requests destruction or the
/// session is lost. Returns cleanly in both cases; the caller tears down
/// the stream client afterwards.
pub fn run_loop(
    experience: &mut RemoteExperience,
    connection: &Connection,
    lifecycle: &Receiver<LifecycleEvent>,
) {
    loop {
        loop {
            match lifecycle.try_recv() {
                Ok(LifecycleEvent::Stop) | Ok(LifecycleEvent::TermWindow) => {
                    info!("host stopping, shutting down connection");
                    connection.disconnect();
                }
                Ok(LifecycleEvent::Resume) => {
                    info!("host resumed, connecting");
                    connection.connect();
                }
                Ok(LifecycleEvent::Destroy) => return,
                Ok(LifecycleEvent::Start) | Ok(LifecycleEvent::Pause) => {}
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return,
            }
        }

        match experience.poll_session_state() {
            Ok(SessionState::LossPending) | Ok(SessionState::Exiting) => {
                info!("session ending, leaving render loop");
                return;
            }
            Ok(state) if state >= SessionState::Ready => {
                experience.poll_and_render_frame();
            }
            Ok(_) => {
                // Session not ready yet; events will advance it.
                std::thread::sleep(IDLE_POLL);
            }
            Err(err) => {
                error!(%err, "session event polling failed");
                std::thread::sleep(IDLE_POLL);
            }
        }
    }
}
