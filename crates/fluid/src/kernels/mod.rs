//! Kernel registry: compiles and links every full-screen program the solver
//! and compositor use, and resolves each program's uniform and sampler
//! tables once at link time.

mod glsl;
mod material;
mod uniforms;

use std::collections::HashMap;

pub use material::{Keyword, KeywordSet, Material};
pub use uniforms::{KernelUniforms, Uniform, UniformTable, UNIFORM_SLOTS};

use crate::backend::{
    Backend, Blend, KernelSource, Pass, ProgramId, ShaderId, ShaderStage, Target, TextureId,
    MAX_TEXTURE_UNITS,
};
use crate::error::EngineError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum KernelKind {
    Copy,
    Clear,
    Color,
    Checkerboard,
    Display,
    BloomPrefilter,
    BloomBlur,
    BloomFinal,
    SunraysMask,
    Sunrays,
    Blur,
    Splat,
    Advection,
    Divergence,
    Curl,
    Vorticity,
    Pressure,
    GradientSubtract,
}

impl KernelKind {
    /// Kernels compiled as plain programs at start-up. `Display` is served by
    /// a [`Material`] and `Advection` picks its variant from capabilities.
    pub const PLAIN: [KernelKind; 16] = [
        KernelKind::Copy,
        KernelKind::Clear,
        KernelKind::Color,
        KernelKind::Checkerboard,
        KernelKind::BloomPrefilter,
        KernelKind::BloomBlur,
        KernelKind::BloomFinal,
        KernelKind::SunraysMask,
        KernelKind::Sunrays,
        KernelKind::Blur,
        KernelKind::Splat,
        KernelKind::Divergence,
        KernelKind::Curl,
        KernelKind::Vorticity,
        KernelKind::Pressure,
        KernelKind::GradientSubtract,
    ];

    pub fn label(self) -> &'static str {
        match self {
            KernelKind::Copy => "copy",
            KernelKind::Clear => "clear",
            KernelKind::Color => "color",
            KernelKind::Checkerboard => "checkerboard",
            KernelKind::Display => "display",
            KernelKind::BloomPrefilter => "bloom prefilter",
            KernelKind::BloomBlur => "bloom blur",
            KernelKind::BloomFinal => "bloom final",
            KernelKind::SunraysMask => "sunrays mask",
            KernelKind::Sunrays => "sunrays",
            KernelKind::Blur => "blur",
            KernelKind::Splat => "splat",
            KernelKind::Advection => "advection",
            KernelKind::Divergence => "divergence",
            KernelKind::Curl => "curl",
            KernelKind::Vorticity => "vorticity",
            KernelKind::Pressure => "pressure",
            KernelKind::GradientSubtract => "gradient subtract",
        }
    }

    /// Texture units in binding order.
    pub fn samplers(self) -> &'static [Sampler] {
        match self {
            KernelKind::Copy
            | KernelKind::Clear
            | KernelKind::BloomPrefilter
            | KernelKind::BloomBlur
            | KernelKind::BloomFinal
            | KernelKind::SunraysMask
            | KernelKind::Sunrays
            | KernelKind::Blur => &[Sampler::Texture],
            KernelKind::Color | KernelKind::Checkerboard => &[],
            KernelKind::Display => &[
                Sampler::Texture,
                Sampler::Bloom,
                Sampler::Sunrays,
                Sampler::Dithering,
            ],
            KernelKind::Splat => &[Sampler::Target],
            KernelKind::Advection => &[Sampler::Velocity, Sampler::Source],
            KernelKind::Divergence | KernelKind::Curl => &[Sampler::Velocity],
            KernelKind::Vorticity => &[Sampler::Velocity, Sampler::Curl],
            KernelKind::Pressure => &[Sampler::Pressure, Sampler::Divergence],
            KernelKind::GradientSubtract => &[Sampler::Pressure, Sampler::Velocity],
        }
    }

    pub fn unit_of(self, sampler: Sampler) -> Option<usize> {
        self.samplers().iter().position(|s| *s == sampler)
    }

    pub fn glsl_body(self) -> &'static str {
        glsl::body(self)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Sampler {
    Texture,
    Target,
    Velocity,
    Source,
    Curl,
    Pressure,
    Divergence,
    Bloom,
    Sunrays,
    Dithering,
}

impl Sampler {
    pub fn glsl_name(&self) -> &'static str {
        match self {
            Sampler::Texture => "uTexture",
            Sampler::Target => "uTarget",
            Sampler::Velocity => "uVelocity",
            Sampler::Source => "uSource",
            Sampler::Curl => "uCurl",
            Sampler::Pressure => "uPressure",
            Sampler::Divergence => "uDivergence",
            Sampler::Bloom => "uBloom",
            Sampler::Sunrays => "uSunrays",
            Sampler::Dithering => "uDithering",
        }
    }
}

/// What to do when a kernel fails to compile or a program fails to link.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum KernelFailurePolicy {
    /// Surface the failure as an error.
    #[default]
    FailFast,
    /// Log the diagnostic and keep the broken handle; draws with it are
    /// skipped by the backend.
    Continue,
}

/// A linked program and the tables resolved for it.
#[derive(Debug, Clone)]
pub struct Program {
    id: ProgramId,
    fragment: ShaderId,
    kind: KernelKind,
    keywords: KeywordSet,
    uniforms: UniformTable,
}

impl Program {
    pub fn id(&self) -> ProgramId {
        self.id
    }

    pub fn kind(&self) -> KernelKind {
        self.kind
    }

    pub fn keywords(&self) -> KeywordSet {
        self.keywords
    }

    pub fn uniforms(&self) -> UniformTable {
        self.uniforms
    }

    pub fn pass(&self) -> PassBuilder<'_> {
        PassBuilder::new(self)
    }
}

/// Compiles kernels against a backend under a failure policy.
#[derive(Debug, Clone, Copy)]
pub struct KernelCompiler {
    vertex: ShaderId,
    policy: KernelFailurePolicy,
}

impl KernelCompiler {
    pub fn new<B: Backend + ?Sized>(
        backend: &mut B,
        policy: KernelFailurePolicy,
    ) -> Result<Self, EngineError> {
        let compiled = backend.compile_kernel(&KernelSource {
            label: "base vertex",
            stage: ShaderStage::Vertex,
            kind: None,
            keywords: KeywordSet::EMPTY,
            text: glsl::VERTEX,
        })?;
        if let Some(log) = compiled.diagnostic {
            tracing::error!(kernel = "base vertex", %log, "kernel failed to compile");
            if policy == KernelFailurePolicy::FailFast {
                backend.destroy_shader(compiled.handle);
                return Err(EngineError::KernelCompile {
                    kernel: "base vertex".into(),
                    log,
                });
            }
        }
        Ok(Self {
            vertex: compiled.handle,
            policy,
        })
    }

    pub fn policy(&self) -> KernelFailurePolicy {
        self.policy
    }

    pub fn compile<B: Backend + ?Sized>(
        &self,
        backend: &mut B,
        kind: KernelKind,
        keywords: KeywordSet,
    ) -> Result<Program, EngineError> {
        let text = glsl::fragment_source(kind, keywords);
        let label = kind.label();
        let compiled = backend.compile_kernel(&KernelSource {
            label,
            stage: ShaderStage::Fragment,
            kind: Some(kind),
            keywords,
            text: &text,
        })?;
        if let Some(log) = compiled.diagnostic {
            tracing::error!(kernel = label, %keywords, %log, "kernel failed to compile");
            if self.policy == KernelFailurePolicy::FailFast {
                backend.destroy_shader(compiled.handle);
                return Err(EngineError::KernelCompile {
                    kernel: label.to_string(),
                    log,
                });
            }
        }

        let fragment = compiled.handle;
        let linked = backend.link_program(label, self.vertex, fragment)?;
        if let Some(log) = linked.diagnostic {
            tracing::error!(program = label, %keywords, %log, "program failed to link");
            if self.policy == KernelFailurePolicy::FailFast {
                backend.destroy_program(linked.handle);
                backend.destroy_shader(fragment);
                return Err(EngineError::KernelLink {
                    program: label.to_string(),
                    log,
                });
            }
        }

        let uniforms = UniformTable::resolve(glsl::body(kind));
        tracing::debug!(
            kernel = label,
            %keywords,
            program = %linked.handle,
            uniforms = uniforms.len(),
            "kernel linked"
        );
        Ok(Program {
            id: linked.handle,
            fragment,
            kind,
            keywords,
            uniforms,
        })
    }

    pub fn release<B: Backend + ?Sized>(&self, backend: &mut B, program: Program) {
        backend.destroy_program(program.id);
        backend.destroy_shader(program.fragment);
    }

    pub fn release_vertex<B: Backend + ?Sized>(&self, backend: &mut B) {
        backend.destroy_shader(self.vertex);
    }
}

/// Every program the engine draws with.
#[derive(Debug)]
pub struct KernelRegistry {
    compiler: KernelCompiler,
    programs: HashMap<KernelKind, Program>,
    display: Material,
}

impl KernelRegistry {
    /// Compiles all plain kernels, the advection variant matching
    /// `advection_keywords`, and an empty display material.
    pub fn new<B: Backend + ?Sized>(
        backend: &mut B,
        policy: KernelFailurePolicy,
        advection_keywords: KeywordSet,
    ) -> Result<Self, EngineError> {
        let compiler = KernelCompiler::new(backend, policy)?;
        let mut registry = Self {
            compiler,
            programs: HashMap::new(),
            display: Material::new(KernelKind::Display),
        };

        let kinds = KernelKind::PLAIN
            .iter()
            .map(|kind| (*kind, KeywordSet::EMPTY))
            .chain(std::iter::once((KernelKind::Advection, advection_keywords)));
        for (kind, keywords) in kinds {
            match compiler.compile(backend, kind, keywords) {
                Ok(program) => {
                    registry.programs.insert(kind, program);
                }
                Err(err) => {
                    registry.release(backend);
                    return Err(err);
                }
            }
        }

        tracing::debug!(programs = registry.programs.len(), "kernel registry ready");
        Ok(registry)
    }

    pub fn program(&self, kind: KernelKind) -> Result<&Program, EngineError> {
        self.programs
            .get(&kind)
            .ok_or_else(|| EngineError::MissingKernel(kind.label().to_string()))
    }

    /// Activates the display variant for `keywords`, compiling it on first use.
    pub fn select_display<B: Backend + ?Sized>(
        &mut self,
        backend: &mut B,
        keywords: KeywordSet,
    ) -> Result<&Program, EngineError> {
        self.display.select_variant(backend, &self.compiler, keywords)
    }

    pub fn display(&self) -> &Material {
        &self.display
    }

    pub fn policy(&self) -> KernelFailurePolicy {
        self.compiler.policy()
    }

    /// Releases every program, cached variant and the shared vertex kernel.
    pub fn release<B: Backend + ?Sized>(&mut self, backend: &mut B) {
        for (_, program) in self.programs.drain() {
            self.compiler.release(backend, program);
        }
        self.display.release(backend, &self.compiler);
        self.compiler.release_vertex(backend);
    }
}

/// Collects uniforms and texture bindings for one draw with a program.
/// Names the program does not reference are ignored.
pub struct PassBuilder<'a> {
    program: &'a Program,
    uniforms: KernelUniforms,
    inputs: [Option<TextureId>; MAX_TEXTURE_UNITS],
    blend: Blend,
}

impl<'a> PassBuilder<'a> {
    pub fn new(program: &'a Program) -> Self {
        Self {
            program,
            uniforms: KernelUniforms::default(),
            inputs: [None; MAX_TEXTURE_UNITS],
            blend: Blend::Replace,
        }
    }

    pub fn set(mut self, uniform: Uniform, values: &[f32]) -> Self {
        if self.program.uniforms.contains(uniform) {
            self.uniforms.set(uniform, values);
        }
        self
    }

    pub fn set_f32(self, uniform: Uniform, value: f32) -> Self {
        self.set(uniform, &[value])
    }

    pub fn bind(mut self, sampler: Sampler, texture: TextureId) -> Self {
        if let Some(unit) = self.program.kind.unit_of(sampler) {
            self.inputs[unit] = Some(texture);
        }
        self
    }

    pub fn blend(mut self, blend: Blend) -> Self {
        self.blend = blend;
        self
    }

    pub fn uniforms(&self) -> &KernelUniforms {
        &self.uniforms
    }

    pub fn draw<B: Backend + ?Sized>(self, backend: &mut B, target: Target) -> Result<(), EngineError> {
        let pass = Pass {
            label: self.program.kind.label(),
            program: self.program.id,
            target,
            inputs: self.inputs,
            uniforms: &self.uniforms,
            blend: self.blend,
        };
        pass.check_feedback()?;
        backend.draw(&pass)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::software::SoftwareBackend;

    #[test]
    fn every_kernel_declares_its_samplers() {
        for kind in KernelKind::PLAIN
            .iter()
            .copied()
            .chain([KernelKind::Display, KernelKind::Advection])
        {
            let source = glsl::fragment_source(kind, KeywordSet::EMPTY);
            for sampler in kind.samplers() {
                let decl = format!("uniform texture2D {}_texture", sampler.glsl_name());
                assert!(source.contains(&decl), "{kind:?} is missing {decl}");
            }
            assert!(source.starts_with("#version 450\n"));
        }
    }

    #[test]
    fn keywords_are_prepended_as_defines() {
        let keywords = KeywordSet::EMPTY.with(Keyword::Shading).with(Keyword::Bloom);
        let source = glsl::fragment_source(KernelKind::Display, keywords);
        let header: Vec<&str> = source.lines().take(3).collect();
        assert_eq!(header, ["#version 450", "#define SHADING", "#define BLOOM"]);
    }

    #[test]
    fn registry_compiles_every_plain_kernel() {
        let mut backend = SoftwareBackend::new(32, 32);
        let mut registry =
            KernelRegistry::new(&mut backend, KernelFailurePolicy::FailFast, KeywordSet::EMPTY)
                .unwrap();
        for kind in KernelKind::PLAIN {
            registry.program(kind).unwrap();
        }
        let advection = registry.program(KernelKind::Advection).unwrap();
        assert!(advection.uniforms().contains(Uniform::Dissipation));
        assert!(registry.program(KernelKind::Display).is_err());

        registry.release(&mut backend);
        assert!(backend.live_resources().is_empty());
    }

    #[test]
    fn fail_fast_surfaces_compile_errors() {
        let mut backend = SoftwareBackend::new(16, 16);
        backend.fail_kernel(KernelKind::Vorticity);
        let err = KernelRegistry::new(&mut backend, KernelFailurePolicy::FailFast, KeywordSet::EMPTY)
            .unwrap_err();
        assert!(matches!(err, EngineError::KernelCompile { ref kernel, .. } if kernel == "vorticity"));
        assert!(backend.live_resources().is_empty());
    }

    #[test]
    fn continue_policy_keeps_broken_handle() {
        let mut backend = SoftwareBackend::new(16, 16);
        backend.fail_kernel(KernelKind::Vorticity);
        let mut registry =
            KernelRegistry::new(&mut backend, KernelFailurePolicy::Continue, KeywordSet::EMPTY)
                .unwrap();
        assert!(registry.program(KernelKind::Vorticity).is_ok());
        registry.release(&mut backend);
        assert!(backend.live_resources().is_empty());
    }

    #[test]
    fn pass_builder_ignores_unreferenced_names() {
        let mut backend = SoftwareBackend::new(16, 16);
        let mut registry =
            KernelRegistry::new(&mut backend, KernelFailurePolicy::FailFast, KeywordSet::EMPTY)
                .unwrap();
        let copy = registry.program(KernelKind::Copy).unwrap();
        let builder = copy
            .pass()
            .set_f32(Uniform::Curl, 30.0)
            .set_f32(Uniform::Dt, 0.5);
        assert_eq!(builder.uniforms(), &KernelUniforms::default());
        registry.release(&mut backend);
    }
}
