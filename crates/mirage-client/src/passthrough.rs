//! Passthrough policy: decides the compositor blend mode, whether an
//! environment-passthrough layer sits under the projection layer, and how
//! additive content is emulated on devices without a native additive mode.

use tracing::debug;

use crate::xr::{BlendMode, LAYER_BLEND_TEXTURE_SOURCE_ALPHA, LAYER_UNPREMULTIPLIED_ALPHA};

/// Luma below this is keyed to transparent when additive content is drawn
/// through the alpha-blend emulation path.
pub const DEFAULT_BLACK_THRESHOLD: f32 = 16.0 / 255.0;

const DEFAULT_PROJECTION_LAYER_FLAGS: u64 =
    LAYER_BLEND_TEXTURE_SOURCE_ALPHA | LAYER_UNPREMULTIPLIED_ALPHA;

/// The policy's contribution to one frame's layer stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyLayer {
    /// Insert an environment-passthrough layer beneath the projection.
    /// Only vendor passthrough policies ever set this; the blend-mode
    /// policy composites through the runtime's blend mode alone.
    pub include_passthrough: bool,
    /// Blend mode to submit with the frame.
    pub env_blend_mode: BlendMode,
    /// Flags to OR into the projection layer.
    pub projection_layer_flags: u64,
}

pub trait PassthroughPolicy: Send {
    /// Request a blend mode. Returns false when the mode is already active
    /// or the device can neither provide nor emulate it.
    fn set_blend_mode(&mut self, mode: BlendMode) -> bool;

    /// The currently requested mode.
    fn blend_mode(&self) -> BlendMode;

    fn composition_layer(&self) -> PolicyLayer;

    /// Clear color for the composited draw: transparent for see-through
    /// modes, opaque black otherwise.
    fn clear_color(&self) -> [f32; 4];

    /// Whether additive content must be drawn through the alpha-key path
    /// (black-to-transparent) instead of a native additive mode.
    fn use_alpha_blend_for_additive(&self) -> bool;
}

/// Policy backed purely by the runtime's advertised environment blend
/// modes. Additive is emulated over alpha-blend when the device lacks a
/// native additive mode but offers alpha.
pub struct BlendModePassthrough {
    available: Vec<BlendMode>,
    mode: BlendMode,
    emulate_additive: bool,
}

impl BlendModePassthrough {
    pub fn new(available: Vec<BlendMode>) -> Self {
        let emulate_additive = !available.contains(&BlendMode::Additive)
            && available.contains(&BlendMode::AlphaBlend);
        Self {
            available,
            mode: BlendMode::Opaque,
            emulate_additive,
        }
    }

    fn supports(&self, mode: BlendMode) -> bool {
        self.available.contains(&mode)
            || (mode == BlendMode::Additive && self.emulate_additive)
    }
}

impl PassthroughPolicy for BlendModePassthrough {
    fn set_blend_mode(&mut self, mode: BlendMode) -> bool {
        if mode == self.mode {
            return false;
        }
        if !self.supports(mode) {
            debug!(?mode, "blend mode not available, keeping current");
            return false;
        }
        self.mode = mode;
        true
    }

    fn blend_mode(&self) -> BlendMode {
        self.mode
    }

    fn composition_layer(&self) -> PolicyLayer {
        let effective = match self.mode {
            BlendMode::Additive if self.emulate_additive => BlendMode::AlphaBlend,
            mode => mode,
        };
        let projection_layer_flags = if effective == BlendMode::AlphaBlend {
            DEFAULT_PROJECTION_LAYER_FLAGS
        } else {
            0
        };
        PolicyLayer {
            include_passthrough: false,
            env_blend_mode: effective,
            projection_layer_flags,
        }
    }

    fn clear_color(&self) -> [f32; 4] {
        match self.mode {
            BlendMode::Additive | BlendMode::AlphaBlend => [0.0, 0.0, 0.0, 0.0],
            BlendMode::Opaque => [0.0, 0.0, 0.0, 1.0],
        }
    }

    fn use_alpha_blend_for_additive(&self) -> bool {
        self.mode == BlendMode::Additive && self.emulate_additive
    }
}
