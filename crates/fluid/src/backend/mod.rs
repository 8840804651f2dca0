//! Graphics backend abstraction used by the engine.
//!
//! The engine only speaks in terms of textures, compiled kernels, linked
//! programs and full-screen passes. Two implementations exist:
//! - `gpu` drives a real GPU and presents into a window surface.
//! - `software` evaluates every kernel on the CPU; it backs headless runs and
//!   the test-suite.

pub mod gpu;
pub mod software;

use std::fmt;

use image::RgbaImage;

use crate::error::EngineError;
use crate::kernels::{KernelKind, KernelUniforms, KeywordSet};

/// Number of texture units a single pass can sample from.
pub const MAX_TEXTURE_UNITS: usize = 4;

macro_rules! handle_type {
    ($name:ident, $kind:literal) => {
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub(crate) u64);

        impl $name {
            pub fn raw(self) -> u64 {
                self.0
            }

            pub(crate) fn unknown(self) -> EngineError {
                EngineError::UnknownHandle {
                    kind: $kind,
                    id: self.0,
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}#{}", $kind, self.0)
            }
        }
    };
}

handle_type!(TextureId, "texture");
handle_type!(ShaderId, "shader");
handle_type!(ProgramId, "program");

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    Rgba16Float,
    Rg16Float,
    R16Float,
    Rgba8Unorm,
}

impl TextureFormat {
    pub fn channels(self) -> usize {
        match self {
            TextureFormat::Rgba16Float | TextureFormat::Rgba8Unorm => 4,
            TextureFormat::Rg16Float => 2,
            TextureFormat::R16Float => 1,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Filter {
    Linear,
    Nearest,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Wrap {
    Clamp,
    Repeat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TextureDesc {
    pub label: &'static str,
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub filter: Filter,
    pub wrap: Wrap,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FormatSupport {
    pub renderable: bool,
    pub filterable: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShaderStage {
    Vertex,
    Fragment,
}

/// Source handed to [`Backend::compile_kernel`]. `text` already carries the
/// keyword `#define` lines; `kind` and `keywords` identify the same kernel for
/// backends that do not consume GLSL.
#[derive(Clone, Copy, Debug)]
pub struct KernelSource<'a> {
    pub label: &'a str,
    pub stage: ShaderStage,
    pub kind: Option<KernelKind>,
    pub keywords: KeywordSet,
    pub text: &'a str,
}

/// Result of a compile or link step. A failed step still yields a handle; the
/// diagnostic carries the backend's log.
#[derive(Clone, Debug)]
pub struct Compiled<T> {
    pub handle: T,
    pub diagnostic: Option<String>,
}

impl<T> Compiled<T> {
    pub fn ok(handle: T) -> Self {
        Self {
            handle,
            diagnostic: None,
        }
    }

    pub fn failed(handle: T, log: impl Into<String>) -> Self {
        Self {
            handle,
            diagnostic: Some(log.into()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Blend {
    Replace,
    /// `ONE, ONE`; used by the bloom upsample chain.
    Additive,
    /// `ONE, ONE_MINUS_SRC_ALPHA`; used when compositing onto the surface.
    PremultipliedOver,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Target {
    Texture(TextureId),
    Surface,
}

/// One full-screen draw.
#[derive(Clone, Copy, Debug)]
pub struct Pass<'a> {
    pub label: &'a str,
    pub program: ProgramId,
    pub target: Target,
    pub inputs: [Option<TextureId>; MAX_TEXTURE_UNITS],
    pub uniforms: &'a KernelUniforms,
    pub blend: Blend,
}

impl Pass<'_> {
    pub fn check_feedback(&self) -> Result<(), EngineError> {
        if let Target::Texture(target) = self.target {
            if self.inputs.iter().flatten().any(|input| *input == target) {
                return Err(EngineError::FeedbackLoop(self.label.to_string()));
            }
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResourceCounts {
    pub textures: usize,
    pub shaders: usize,
    pub programs: usize,
}

impl ResourceCounts {
    pub fn is_empty(&self) -> bool {
        self.textures == 0 && self.shaders == 0 && self.programs == 0
    }
}

pub trait Backend {
    fn name(&self) -> &'static str;

    fn format_support(&self, format: TextureFormat) -> FormatSupport;

    fn surface_size(&self) -> (u32, u32);

    fn resize_surface(&mut self, width: u32, height: u32);

    /// Allocates a zero-initialised texture usable as both render target and
    /// sampled input.
    fn create_texture(&mut self, desc: &TextureDesc) -> Result<TextureId, EngineError>;

    /// Allocates a sampled texture initialised with tightly packed RGBA8 data.
    fn upload_rgba8(&mut self, desc: &TextureDesc, pixels: &[u8])
        -> Result<TextureId, EngineError>;

    fn destroy_texture(&mut self, id: TextureId);

    fn compile_kernel(
        &mut self,
        source: &KernelSource<'_>,
    ) -> Result<Compiled<ShaderId>, EngineError>;

    fn link_program(
        &mut self,
        label: &str,
        vertex: ShaderId,
        fragment: ShaderId,
    ) -> Result<Compiled<ProgramId>, EngineError>;

    fn destroy_shader(&mut self, id: ShaderId);

    fn destroy_program(&mut self, id: ProgramId);

    fn draw(&mut self, pass: &Pass<'_>) -> Result<(), EngineError>;

    /// Reads an `Rgba8Unorm` texture back into host memory, top row first.
    fn read_pixels(&mut self, id: TextureId) -> Result<RgbaImage, EngineError>;

    /// Flushes the passes recorded since the previous call and presents the
    /// surface if it was drawn to.
    fn end_frame(&mut self) -> Result<(), EngineError>;

    fn live_resources(&self) -> ResourceCounts;
}
