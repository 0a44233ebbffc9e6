//! Fixed mapping from swapchain image index to a reusable framebuffer.
//!
//! Swapchain images are enumerated once at startup; each gets a framebuffer
//! with the image attached as its color target, created through the binder
//! contract (the GL wrapper is an external collaborator). The mapping never
//! changes for the life of the swapchain.

#[derive(Debug, thiserror::Error)]
#[error("framebuffer setup failed: {0}")]
pub struct FramebufferError(pub String);

pub struct SwapchainFramebuffers {
    framebuffers: Vec<u32>,
}

impl SwapchainFramebuffers {
    /// Build the index table. `bind` receives each swapchain image (a GL
    /// texture name) and returns the framebuffer bound to it.
    pub fn from_images(
        images: &[u32],
        bind: &mut dyn FnMut(u32) -> Result<u32, FramebufferError>,
    ) -> Result<Self, FramebufferError> {
        let mut framebuffers = Vec::with_capacity(images.len());
        for &image in images {
            framebuffers.push(bind(image)?);
        }
        Ok(Self { framebuffers })
    }

    /// O(1) lookup of the framebuffer for an acquired image index.
    pub fn framebuffer_at(&self, index: u32) -> Option<u32> {
        self.framebuffers.get(index as usize).copied()
    }

    pub fn len(&self) -> usize {
        self.framebuffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.framebuffers.is_empty()
    }
}
