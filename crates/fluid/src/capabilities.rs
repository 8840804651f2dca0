//! Render-target format selection.

use crate::backend::{Backend, TextureFormat};
use crate::error::EngineError;

/// Candidate formats per channel layout, narrowest first.
const RGBA_CHAIN: &[TextureFormat] = &[TextureFormat::Rgba16Float];
const RG_CHAIN: &[TextureFormat] = &[TextureFormat::Rg16Float, TextureFormat::Rgba16Float];
const R_CHAIN: &[TextureFormat] = &[
    TextureFormat::R16Float,
    TextureFormat::Rg16Float,
    TextureFormat::Rgba16Float,
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Capabilities {
    pub rgba: TextureFormat,
    pub rg: TextureFormat,
    pub r: TextureFormat,
    pub linear_filtering: bool,
}

impl Capabilities {
    pub fn detect<B: Backend + ?Sized>(backend: &B) -> Result<Self, EngineError> {
        let caps = Self {
            rgba: pick(backend, RGBA_CHAIN)?,
            rg: pick(backend, RG_CHAIN)?,
            r: pick(backend, R_CHAIN)?,
            linear_filtering: backend
                .format_support(TextureFormat::Rgba16Float)
                .filterable,
        };
        tracing::info!(
            backend = backend.name(),
            rgba = ?caps.rgba,
            rg = ?caps.rg,
            r = ?caps.r,
            linear_filtering = caps.linear_filtering,
            "detected render-target capabilities"
        );
        Ok(caps)
    }
}

fn pick<B: Backend + ?Sized>(
    backend: &B,
    chain: &[TextureFormat],
) -> Result<TextureFormat, EngineError> {
    for (index, format) in chain.iter().enumerate() {
        if backend.format_support(*format).renderable {
            if index > 0 {
                tracing::debug!(requested = ?chain[0], using = ?format, "render-target format fallback");
            }
            return Ok(*format);
        }
    }
    // Every chain ends in the 4-channel format, which is mandatory.
    Err(EngineError::UnsupportedFormat(TextureFormat::Rgba16Float))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::software::SoftwareBackend;

    #[test]
    fn native_formats_are_preferred() {
        let caps = Capabilities::detect(&SoftwareBackend::new(4, 4)).unwrap();
        assert_eq!(caps.rgba, TextureFormat::Rgba16Float);
        assert_eq!(caps.rg, TextureFormat::Rg16Float);
        assert_eq!(caps.r, TextureFormat::R16Float);
        assert!(caps.linear_filtering);
    }

    #[test]
    fn narrow_formats_fall_back_to_wider_ones() {
        let backend = SoftwareBackend::new(4, 4).without_format(TextureFormat::R16Float);
        let caps = Capabilities::detect(&backend).unwrap();
        assert_eq!(caps.r, TextureFormat::Rg16Float);

        let backend = SoftwareBackend::new(4, 4)
            .without_format(TextureFormat::R16Float)
            .without_format(TextureFormat::Rg16Float);
        let caps = Capabilities::detect(&backend).unwrap();
        assert_eq!(caps.r, TextureFormat::Rgba16Float);
        assert_eq!(caps.rg, TextureFormat::Rgba16Float);
    }

    #[test]
    fn missing_rgba_float_is_fatal() {
        let backend = SoftwareBackend::new(4, 4).without_format(TextureFormat::Rgba16Float);
        assert!(matches!(
            Capabilities::detect(&backend),
            Err(EngineError::UnsupportedFormat(TextureFormat::Rgba16Float))
        ));
    }

    #[test]
    fn reports_missing_linear_filtering() {
        let backend = SoftwareBackend::new(4, 4).without_linear_filtering();
        assert!(!Capabilities::detect(&backend).unwrap().linear_filtering);
    }
}
