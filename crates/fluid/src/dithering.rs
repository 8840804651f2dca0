//! Blue-noise dithering texture used by the bloom composite. The image is
//! decoded on a worker thread; a neutral 1x1 placeholder stands in until then.

use std::path::{Path, PathBuf};
use std::thread;

use crossbeam_channel::{Receiver, TryRecvError};
use image::RgbaImage;

use crate::backend::{Backend, Filter, TextureDesc, TextureFormat, TextureId, Wrap};
use crate::error::EngineError;

const PLACEHOLDER: [u8; 4] = [128, 128, 128, 255];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DitheringTexture {
    texture: TextureId,
    width: u32,
    height: u32,
}

impl DitheringTexture {
    pub fn placeholder<B: Backend + ?Sized>(backend: &mut B) -> Result<Self, EngineError> {
        Self::upload(backend, 1, 1, &PLACEHOLDER)
    }

    pub fn from_image<B: Backend + ?Sized>(
        backend: &mut B,
        image: &RgbaImage,
    ) -> Result<Self, EngineError> {
        Self::upload(backend, image.width(), image.height(), image.as_raw())
    }

    fn upload<B: Backend + ?Sized>(
        backend: &mut B,
        width: u32,
        height: u32,
        pixels: &[u8],
    ) -> Result<Self, EngineError> {
        let texture = backend.upload_rgba8(
            &TextureDesc {
                label: "dithering",
                width,
                height,
                format: TextureFormat::Rgba8Unorm,
                filter: Filter::Linear,
                wrap: Wrap::Repeat,
            },
            pixels,
        )?;
        Ok(Self {
            texture,
            width,
            height,
        })
    }

    pub fn texture(&self) -> TextureId {
        self.texture
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Tiling factor that maps one texel of noise onto one output pixel.
    pub fn scale(&self, width: u32, height: u32) -> [f32; 2] {
        [
            width as f32 / self.width as f32,
            height as f32 / self.height as f32,
        ]
    }

    pub fn release<B: Backend + ?Sized>(self, backend: &mut B) {
        backend.destroy_texture(self.texture);
    }
}

/// Decodes an image file in the background.
#[derive(Debug)]
pub struct DitheringLoader {
    path: PathBuf,
    receiver: Receiver<Result<RgbaImage, image::ImageError>>,
}

impl DitheringLoader {
    pub fn spawn(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let (sender, receiver) = crossbeam_channel::bounded(1);
        let worker_path = path.clone();
        let spawned = thread::Builder::new()
            .name("dithering-loader".into())
            .spawn(move || {
                let result = image::open(&worker_path).map(|image| image.to_rgba8());
                if sender.send(result).is_err() {
                    tracing::debug!(
                        path = %worker_path.display(),
                        "dithering texture decoded after the simulation was destroyed"
                    );
                }
            });
        if let Err(err) = spawned {
            tracing::warn!(path = %path.display(), %err, "failed to spawn dithering loader");
        }
        tracing::debug!(path = %path.display(), "loading dithering texture");
        Self { path, receiver }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `None` while decoding is still in flight.
    pub fn poll(&self) -> Option<Result<RgbaImage, String>> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result.map_err(|err| err.to_string())),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                Some(Err("loader exited without a result".to_string()))
            }
        }
    }

    /// Blocks until the worker finishes.
    pub fn wait(self) -> Result<RgbaImage, String> {
        self.receiver
            .recv()
            .map_err(|_| "loader exited without a result".to_string())?
            .map_err(|err| err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::software::SoftwareBackend;

    #[test]
    fn placeholder_is_mid_grey_and_tiles() {
        let mut backend = SoftwareBackend::new(4, 4);
        let dithering = DitheringTexture::placeholder(&mut backend).unwrap();
        assert_eq!(dithering.size(), (1, 1));
        assert_eq!(dithering.scale(64, 32), [64.0, 32.0]);
        let texture = backend.texture(dithering.texture()).unwrap();
        assert_eq!(texture.desc().wrap, Wrap::Repeat);
        assert!((texture.data()[0][0] - 128.0 / 255.0).abs() < 1e-6);
        dithering.release(&mut backend);
        assert!(backend.live_resources().is_empty());
    }

    #[test]
    fn loads_png_in_background() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("noise.png");
        RgbaImage::from_pixel(8, 4, image::Rgba([10, 20, 30, 255]))
            .save(&path)
            .unwrap();

        let image = DitheringLoader::spawn(&path).wait().unwrap();
        assert_eq!(image.dimensions(), (8, 4));

        let mut backend = SoftwareBackend::new(4, 4);
        let dithering = DitheringTexture::from_image(&mut backend, &image).unwrap();
        assert_eq!(dithering.scale(16, 16), [2.0, 4.0]);
    }

    #[test]
    fn missing_file_reports_error() {
        let dir = tempfile::tempdir().unwrap();
        let loader = DitheringLoader::spawn(dir.path().join("absent.png"));
        assert!(loader.wait().is_err());
    }

    #[test]
    fn abandoned_loader_finishes_quietly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("noise.png");
        RgbaImage::from_pixel(2, 2, image::Rgba([1, 2, 3, 255]))
            .save(&path)
            .unwrap();
        drop(DitheringLoader::spawn(&path));

        let loader = DitheringLoader::spawn(&path);
        assert_eq!(loader.wait().unwrap().dimensions(), (2, 2));
    }
}
