use std::fmt;

use crate::backend::Backend;
use crate::error::EngineError;

use super::{KernelCompiler, KernelKind, Program};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Keyword {
    ManualFiltering,
    Shading,
    Bloom,
    Sunrays,
}

impl Keyword {
    pub const ALL: [Keyword; 4] = [
        Keyword::ManualFiltering,
        Keyword::Shading,
        Keyword::Bloom,
        Keyword::Sunrays,
    ];

    pub fn define(self) -> &'static str {
        match self {
            Keyword::ManualFiltering => "MANUAL_FILTERING",
            Keyword::Shading => "SHADING",
            Keyword::Bloom => "BLOOM",
            Keyword::Sunrays => "SUNRAYS",
        }
    }

    fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

/// Order-independent set of active keywords.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct KeywordSet(u8);

/// Number of distinct keyword sets; sizes the material cache.
pub const VARIANT_COUNT: usize = 1 << Keyword::ALL.len();

impl KeywordSet {
    pub const EMPTY: KeywordSet = KeywordSet(0);

    pub fn from_keywords(keywords: impl IntoIterator<Item = Keyword>) -> Self {
        keywords.into_iter().fold(Self::EMPTY, Self::with)
    }

    pub fn with(self, keyword: Keyword) -> Self {
        Self(self.0 | keyword.bit())
    }

    pub fn with_if(self, keyword: Keyword, enabled: bool) -> Self {
        if enabled {
            self.with(keyword)
        } else {
            self
        }
    }

    pub fn contains(self, keyword: Keyword) -> bool {
        self.0 & keyword.bit() != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Cache index; identical for any insertion order.
    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn names(self) -> impl Iterator<Item = &'static str> {
        Keyword::ALL
            .into_iter()
            .filter(move |keyword| self.contains(*keyword))
            .map(Keyword::define)
    }
}

impl fmt::Display for KeywordSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("-");
        }
        let names: Vec<&str> = self.names().collect();
        f.write_str(&names.join("|"))
    }
}

/// Keyword-variant cache for one kernel. Variants compile lazily and carry
/// their own uniform tables.
#[derive(Debug)]
pub struct Material {
    kind: KernelKind,
    variants: [Option<Program>; VARIANT_COUNT],
    active: Option<KeywordSet>,
}

impl Material {
    pub fn new(kind: KernelKind) -> Self {
        Self {
            kind,
            variants: Default::default(),
            active: None,
        }
    }

    pub fn select_variant<B: Backend + ?Sized>(
        &mut self,
        backend: &mut B,
        compiler: &KernelCompiler,
        keywords: KeywordSet,
    ) -> Result<&Program, EngineError> {
        let index = keywords.index();
        if self.variants[index].is_none() {
            let program = compiler.compile(backend, self.kind, keywords)?;
            self.variants[index] = Some(program);
            tracing::debug!(
                kernel = self.kind.label(),
                %keywords,
                variants = self.compiled_variants(),
                "compiled material variant"
            );
        }

        let program = self.variants[index]
            .as_ref()
            .ok_or_else(|| EngineError::MissingKernel(self.kind.label().to_string()))?;
        if self.active != Some(keywords) {
            tracing::trace!(kernel = self.kind.label(), %keywords, "material variant selected");
            self.active = Some(keywords);
        }
        Ok(program)
    }

    pub fn active(&self) -> Option<KeywordSet> {
        self.active
    }

    pub fn compiled_variants(&self) -> usize {
        self.variants.iter().flatten().count()
    }

    pub fn release<B: Backend + ?Sized>(&mut self, backend: &mut B, compiler: &KernelCompiler) {
        for slot in self.variants.iter_mut() {
            if let Some(program) = slot.take() {
                compiler.release(backend, program);
            }
        }
        self.active = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::software::SoftwareBackend;
    use crate::kernels::{KernelFailurePolicy, Uniform};

    #[test]
    fn keyword_order_does_not_matter() {
        let a = KeywordSet::from_keywords([Keyword::Bloom, Keyword::Shading]);
        let b = KeywordSet::from_keywords([Keyword::Shading, Keyword::Bloom]);
        assert_eq!(a, b);
        assert_eq!(a.index(), b.index());
        assert_eq!(a.to_string(), "SHADING|BLOOM");
    }

    #[test]
    fn variants_compile_once_and_carry_their_tables() {
        let mut backend = SoftwareBackend::new(8, 8);
        let compiler = KernelCompiler::new(&mut backend, KernelFailurePolicy::FailFast).unwrap();
        let mut material = Material::new(KernelKind::Display);

        let shaded = KeywordSet::EMPTY.with(Keyword::Shading);
        let plain = KeywordSet::EMPTY;

        material.select_variant(&mut backend, &compiler, shaded).unwrap();
        let program = material.select_variant(&mut backend, &compiler, shaded).unwrap();
        assert!(program.uniforms().contains(Uniform::TexelSize));
        assert_eq!(material.compiled_variants(), 1);

        material.select_variant(&mut backend, &compiler, plain).unwrap();
        assert_eq!(material.active(), Some(plain));
        let program = material.select_variant(&mut backend, &compiler, shaded).unwrap();
        assert_eq!(program.keywords(), shaded);
        assert_eq!(material.compiled_variants(), 2);
        assert_eq!(material.active(), Some(shaded));

        material.release(&mut backend, &compiler);
        compiler.release_vertex(&mut backend);
        assert!(backend.live_resources().is_empty());
    }
}
