//! Contract for the hardware video decoder.
//!
//! The decoder lives behind the shared EGL context and turns complete
//! access units into GL textures it continues to own. Every texture handed
//! out must come back through [`VideoDecoder::release`] exactly once.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedTexture {
    /// GL texture name in the shared context.
    pub id: u32,
    /// GL texture target; external-OES targets pass through untouched.
    pub target: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("decoder error: {0}")]
    Backend(String),
}

pub trait VideoDecoder: Send {
    /// Decode one Annex-B access unit into a decoder-owned texture.
    fn decode(&mut self, access_unit: &[u8]) -> Result<DecodedTexture, DecodeError>;

    /// Return a texture to the decoder's pool.
    fn release(&mut self, texture: DecodedTexture);
}
