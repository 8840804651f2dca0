//! Post-processing and final composite: bloom, sunrays, background and the
//! display material, onto the surface or into an offscreen capture.

use fluidconfig::Config;
use image::RgbaImage;

use crate::backend::{Backend, Blend, Filter, Target, TextureFormat};
use crate::dithering::DitheringTexture;
use crate::error::EngineError;
use crate::kernels::{KernelKind, KernelRegistry, Keyword, KeywordSet, Sampler, Uniform};
use crate::targets::{get_resolution, FluidTargets, RenderTarget, TargetPool};

/// Where a composite lands.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Destination {
    pub target: Target,
    pub width: u32,
    pub height: u32,
}

impl Destination {
    pub fn surface<B: Backend + ?Sized>(backend: &B) -> Self {
        let (width, height) = backend.surface_size();
        Self {
            target: Target::Surface,
            width,
            height,
        }
    }

    pub fn texture(target: &RenderTarget) -> Self {
        Self {
            target: target.target(),
            width: target.width(),
            height: target.height(),
        }
    }

    fn is_surface(&self) -> bool {
        self.target == Target::Surface
    }
}

/// Display material keywords implied by the config.
pub fn display_keywords(config: &Config) -> KeywordSet {
    KeywordSet::EMPTY
        .with_if(Keyword::Shading, config.shading)
        .with_if(Keyword::Bloom, config.bloom)
        .with_if(Keyword::Sunrays, config.sunrays)
}

pub fn render<B: Backend + ?Sized>(
    backend: &mut B,
    kernels: &mut KernelRegistry,
    targets: &FluidTargets,
    config: &Config,
    dithering: &DitheringTexture,
    destination: Destination,
) -> Result<(), EngineError> {
    if config.bloom {
        apply_bloom(backend, kernels, targets, config)?;
    }
    if config.sunrays {
        apply_sunrays(backend, kernels, targets, config)?;
        blur(
            backend,
            kernels,
            &targets.sunrays,
            &targets.sunrays_temp,
            1,
        )?;
    }

    let blend = if destination.is_surface() || !config.transparent {
        Blend::PremultipliedOver
    } else {
        Blend::Replace
    };

    if !config.transparent {
        let [r, g, b] = config.back_color.normalized();
        kernels
            .program(KernelKind::Color)?
            .pass()
            .set(Uniform::Color, &[r, g, b, 1.0])
            .blend(blend)
            .draw(backend, destination.target)?;
    }
    if destination.is_surface() && config.transparent {
        kernels
            .program(KernelKind::Checkerboard)?
            .pass()
            .set_f32(
                Uniform::AspectRatio,
                destination.width as f32 / destination.height.max(1) as f32,
            )
            .blend(blend)
            .draw(backend, destination.target)?;
    }

    draw_display(backend, kernels, targets, config, dithering, destination, blend)
}

fn draw_display<B: Backend + ?Sized>(
    backend: &mut B,
    kernels: &mut KernelRegistry,
    targets: &FluidTargets,
    config: &Config,
    dithering: &DitheringTexture,
    destination: Destination,
    blend: Blend,
) -> Result<(), EngineError> {
    let keywords = display_keywords(config);
    let width = destination.width.max(1);
    let height = destination.height.max(1);
    let program = kernels.select_display(backend, keywords)?;

    let mut pass = program
        .pass()
        .bind(Sampler::Texture, targets.dye.read().texture())
        .blend(blend);
    if config.shading {
        pass = pass.set(
            Uniform::TexelSize,
            &[1.0 / width as f32, 1.0 / height as f32],
        );
    }
    if config.bloom {
        pass = pass
            .bind(Sampler::Bloom, targets.bloom.texture())
            .bind(Sampler::Dithering, dithering.texture())
            .set(Uniform::DitherScale, &dithering.scale(width, height));
    }
    if config.sunrays {
        pass = pass.bind(Sampler::Sunrays, targets.sunrays.texture());
    }
    pass.draw(backend, destination.target)
}

/// Soft-knee threshold curve: `(threshold - knee, 2 * knee, 0.25 / knee)`.
pub fn bloom_curve(config: &Config) -> [f32; 3] {
    let knee = config.bloom_threshold * config.bloom_soft_knee + 0.0001;
    [config.bloom_threshold - knee, knee * 2.0, 0.25 / knee]
}

fn apply_bloom<B: Backend + ?Sized>(
    backend: &mut B,
    kernels: &KernelRegistry,
    targets: &FluidTargets,
    config: &Config,
) -> Result<(), EngineError> {
    let frames = &targets.bloom_frames;
    if frames.len() < 2 {
        return Ok(());
    }
    let destination = &targets.bloom;

    kernels
        .program(KernelKind::BloomPrefilter)?
        .pass()
        .set(Uniform::Curve, &bloom_curve(config))
        .set_f32(Uniform::Threshold, config.bloom_threshold)
        .bind(Sampler::Texture, targets.dye.read().texture())
        .draw(backend, destination.target())?;

    let blur = kernels.program(KernelKind::BloomBlur)?;
    let mut last = destination;
    for frame in frames {
        blur.pass()
            .set(Uniform::TexelSize, &last.texel_size())
            .bind(Sampler::Texture, last.texture())
            .draw(backend, frame.target())?;
        last = frame;
    }

    for frame in frames.iter().rev().skip(1) {
        blur.pass()
            .set(Uniform::TexelSize, &last.texel_size())
            .bind(Sampler::Texture, last.texture())
            .blend(Blend::Additive)
            .draw(backend, frame.target())?;
        last = frame;
    }

    kernels
        .program(KernelKind::BloomFinal)?
        .pass()
        .set(Uniform::TexelSize, &last.texel_size())
        .set_f32(Uniform::Intensity, config.bloom_intensity)
        .bind(Sampler::Texture, last.texture())
        .draw(backend, destination.target())
}

fn apply_sunrays<B: Backend + ?Sized>(
    backend: &mut B,
    kernels: &KernelRegistry,
    targets: &FluidTargets,
    config: &Config,
) -> Result<(), EngineError> {
    // The dye write buffer is free between steps and holds the mask.
    let mask = targets.dye.write();
    kernels
        .program(KernelKind::SunraysMask)?
        .pass()
        .bind(Sampler::Texture, targets.dye.read().texture())
        .draw(backend, mask.target())?;
    kernels
        .program(KernelKind::Sunrays)?
        .pass()
        .set_f32(Uniform::Weight, config.sunrays_weight)
        .bind(Sampler::Texture, mask.texture())
        .draw(backend, targets.sunrays.target())
}

/// Separable blur of `target`, ping-ponging through `temp`.
fn blur<B: Backend + ?Sized>(
    backend: &mut B,
    kernels: &KernelRegistry,
    target: &RenderTarget,
    temp: &RenderTarget,
    iterations: u32,
) -> Result<(), EngineError> {
    let program = kernels.program(KernelKind::Blur)?;
    let [tx, ty] = target.texel_size();
    for _ in 0..iterations {
        program
            .pass()
            .set(Uniform::TexelSize, &[tx, 0.0])
            .bind(Sampler::Texture, target.texture())
            .draw(backend, temp.target())?;
        program
            .pass()
            .set(Uniform::TexelSize, &[0.0, ty])
            .bind(Sampler::Texture, temp.texture())
            .draw(backend, target.target())?;
    }
    Ok(())
}

/// Renders the composite offscreen at `CAPTURE_RESOLUTION` and reads it back.
/// The capture target is released whether or not rendering succeeds.
pub fn capture<B: Backend + ?Sized>(
    backend: &mut B,
    kernels: &mut KernelRegistry,
    pool: &mut TargetPool,
    targets: &FluidTargets,
    config: &Config,
    dithering: &DitheringTexture,
) -> Result<RgbaImage, EngineError> {
    let (width, height) = backend.surface_size();
    let size = get_resolution(config.capture_resolution, width, height);
    let target = pool.create(
        backend,
        "capture",
        size,
        TextureFormat::Rgba8Unorm,
        Filter::Nearest,
    )?;
    let result = render(
        backend,
        kernels,
        targets,
        config,
        dithering,
        Destination::texture(&target),
    )
    .and_then(|()| backend.read_pixels(target.texture()));
    pool.release(backend, target);
    if let Ok(image) = &result {
        tracing::info!(width = image.width(), height = image.height(), "captured frame");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::software::SoftwareBackend;
    use crate::kernels::KernelFailurePolicy;
    use crate::capabilities::Capabilities;
    use crate::targets::TargetPlan;

    struct Fixture {
        backend: SoftwareBackend,
        kernels: KernelRegistry,
        pool: TargetPool,
        targets: FluidTargets,
        dithering: DitheringTexture,
        config: Config,
    }

    fn fixture(config: Config) -> Fixture {
        let mut backend = SoftwareBackend::new(16, 8);
        let caps = Capabilities::detect(&backend).unwrap();
        let kernels =
            KernelRegistry::new(&mut backend, KernelFailurePolicy::FailFast, KeywordSet::EMPTY)
                .unwrap();
        let mut pool = TargetPool::new();
        let plan = TargetPlan {
            config: &config,
            caps: &caps,
            surface: backend.surface_size(),
        };
        let targets = FluidTargets::allocate(&mut pool, &mut backend, &plan).unwrap();
        let dithering = DitheringTexture::placeholder(&mut backend).unwrap();
        backend.take_passes();
        Fixture {
            backend,
            kernels,
            pool,
            targets,
            dithering,
            config,
        }
    }

    fn small() -> Config {
        Config {
            sim_resolution: 4,
            dye_resolution: 8,
            bloom_resolution: 16,
            bloom_iterations: 8,
            sunrays_resolution: 4,
            capture_resolution: 4,
            ..Config::default()
        }
    }

    impl Fixture {
        fn render(&mut self, destination: Destination) {
            render(
                &mut self.backend,
                &mut self.kernels,
                &self.targets,
                &self.config,
                &self.dithering,
                destination,
            )
            .unwrap();
        }

        fn kernels_drawn(&mut self) -> Vec<KernelKind> {
            self.backend
                .take_passes()
                .into_iter()
                .map(|pass| pass.kernel)
                .collect()
        }
    }

    #[test]
    fn curve_matches_soft_knee() {
        let config = Config::default();
        let curve = bloom_curve(&config);
        let knee = 0.6 * 0.7 + 0.0001;
        assert!((curve[0] - (0.6 - knee)).abs() < 1e-6);
        assert!((curve[1] - 2.0 * knee).abs() < 1e-6);
        assert!((curve[2] - 0.25 / knee).abs() < 1e-4);
    }

    #[test]
    fn full_composite_runs_every_stage() {
        let mut fx = fixture(small());
        let levels = fx.targets.bloom_frames.len();
        assert!(levels >= 2);
        fx.render(Destination::surface(&fx.backend));

        let mut expected = vec![KernelKind::BloomPrefilter];
        expected.extend(std::iter::repeat(KernelKind::BloomBlur).take(2 * levels - 1));
        expected.extend([
            KernelKind::BloomFinal,
            KernelKind::SunraysMask,
            KernelKind::Sunrays,
            KernelKind::Blur,
            KernelKind::Blur,
            KernelKind::Color,
            KernelKind::Display,
        ]);
        assert_eq!(fx.kernels_drawn(), expected);
    }

    #[test]
    fn upsample_chain_blends_additively() {
        let mut fx = fixture(small());
        fx.render(Destination::surface(&fx.backend));
        let additive = fx
            .backend
            .passes()
            .iter()
            .filter(|pass| pass.blend == Blend::Additive)
            .count();
        assert_eq!(additive, fx.targets.bloom_frames.len() - 1);
    }

    #[test]
    fn bloom_is_skipped_without_enough_levels() {
        let mut fx = fixture(Config {
            bloom_iterations: 1,
            sunrays: false,
            ..small()
        });
        fx.render(Destination::surface(&fx.backend));
        assert_eq!(
            fx.kernels_drawn(),
            [KernelKind::Color, KernelKind::Display]
        );
    }

    #[test]
    fn transparent_surface_gets_checkerboard() {
        let mut fx = fixture(Config {
            transparent: true,
            bloom: false,
            sunrays: false,
            ..small()
        });
        fx.render(Destination::surface(&fx.backend));
        let passes = fx.backend.take_passes();
        let kernels: Vec<_> = passes.iter().map(|pass| pass.kernel).collect();
        assert_eq!(kernels, [KernelKind::Checkerboard, KernelKind::Display]);
        assert!(passes
            .iter()
            .all(|pass| pass.blend == Blend::PremultipliedOver));
    }

    #[test]
    fn display_variant_follows_feature_flags() {
        let mut fx = fixture(Config {
            bloom: false,
            ..small()
        });
        fx.render(Destination::surface(&fx.backend));
        let display = fx.backend.passes().last().cloned().unwrap();
        assert_eq!(display.kernel, KernelKind::Display);
        assert!(display.keywords.contains(Keyword::Shading));
        assert!(display.keywords.contains(Keyword::Sunrays));
        assert!(!display.keywords.contains(Keyword::Bloom));
    }

    #[test]
    fn capture_reads_back_background_and_releases_target() {
        let mut fx = fixture(Config {
            back_color: fluidconfig::Color::new(255.0, 0.0, 0.0),
            bloom: false,
            sunrays: false,
            shading: false,
            ..small()
        });
        let live = fx.pool.live_count();
        let image = capture(
            &mut fx.backend,
            &mut fx.kernels,
            &mut fx.pool,
            &fx.targets,
            &fx.config,
            &fx.dithering,
        )
        .unwrap();
        assert_eq!(image.dimensions(), (8, 4));
        assert!(image.pixels().all(|p| p.0 == [255, 0, 0, 255]));
        assert_eq!(fx.pool.live_count(), live);
    }
}
