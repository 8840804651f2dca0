//! Render-target pool: single and double-buffered targets, resize with
//! content preservation, and the full set of targets the engine renders into.

use std::collections::BTreeSet;

use fluidconfig::{Config, ConfigChanges};

use crate::backend::{Backend, Filter, Target, TextureDesc, TextureFormat, TextureId, Wrap};
use crate::error::EngineError;
use crate::kernels::{KernelKind, KernelRegistry, Sampler};
use crate::capabilities::Capabilities;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RenderTarget {
    texture: TextureId,
    width: u32,
    height: u32,
    texel_size: [f32; 2],
    format: TextureFormat,
    filter: Filter,
    label: &'static str,
}

impl RenderTarget {
    pub fn texture(&self) -> TextureId {
        self.texture
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// `(1 / width, 1 / height)`.
    pub fn texel_size(&self) -> [f32; 2] {
        self.texel_size
    }

    pub fn format(&self) -> TextureFormat {
        self.format
    }

    pub fn filter(&self) -> Filter {
        self.filter
    }

    pub fn target(&self) -> Target {
        Target::Texture(self.texture)
    }
}

/// Read/write pair. Passes sample `read` and render into `write`, then swap.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DoubleTarget {
    read: RenderTarget,
    write: RenderTarget,
}

impl DoubleTarget {
    pub fn read(&self) -> &RenderTarget {
        &self.read
    }

    pub fn write(&self) -> &RenderTarget {
        &self.write
    }

    pub fn swap(&mut self) {
        std::mem::swap(&mut self.read, &mut self.write);
    }

    pub fn width(&self) -> u32 {
        self.read.width
    }

    pub fn height(&self) -> u32 {
        self.read.height
    }

    pub fn texel_size(&self) -> [f32; 2] {
        self.read.texel_size
    }
}

/// Size of a target whose short side is `resolution`, following the aspect
/// ratio of a `width` x `height` surface.
pub fn get_resolution(resolution: u32, width: u32, height: u32) -> (u32, u32) {
    let width = width.max(1) as f32;
    let height = height.max(1) as f32;
    let mut aspect = width / height;
    if aspect < 1.0 {
        aspect = 1.0 / aspect;
    }
    let min = (resolution as f32).round() as u32;
    let max = (resolution as f32 * aspect).round() as u32;
    if width > height {
        (max, min)
    } else {
        (min, max)
    }
}

/// Tracks every texture it hands out so teardown can release all of them.
#[derive(Debug, Default)]
pub struct TargetPool {
    live: BTreeSet<TextureId>,
}

impl TargetPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create<B: Backend + ?Sized>(
        &mut self,
        backend: &mut B,
        label: &'static str,
        (width, height): (u32, u32),
        format: TextureFormat,
        filter: Filter,
    ) -> Result<RenderTarget, EngineError> {
        let texture = backend.create_texture(&TextureDesc {
            label,
            width,
            height,
            format,
            filter,
            wrap: Wrap::Clamp,
        })?;
        self.live.insert(texture);
        tracing::trace!(label, width, height, ?format, texture = %texture, "allocated render target");
        Ok(RenderTarget {
            texture,
            width,
            height,
            texel_size: [1.0 / width as f32, 1.0 / height as f32],
            format,
            filter,
            label,
        })
    }

    pub fn create_double<B: Backend + ?Sized>(
        &mut self,
        backend: &mut B,
        label: &'static str,
        size: (u32, u32),
        format: TextureFormat,
        filter: Filter,
    ) -> Result<DoubleTarget, EngineError> {
        let read = self.create(backend, label, size, format, filter)?;
        let write = match self.create(backend, label, size, format, filter) {
            Ok(write) => write,
            Err(err) => {
                self.release(backend, read);
                return Err(err);
            }
        };
        Ok(DoubleTarget { read, write })
    }

    /// Resizes `target` to `size`, carrying the read side's contents over
    /// with the copy kernel. Unchanged dimensions leave the pair untouched.
    pub fn resize_double<B: Backend + ?Sized>(
        &mut self,
        backend: &mut B,
        kernels: &KernelRegistry,
        target: &mut DoubleTarget,
        size: (u32, u32),
    ) -> Result<(), EngineError> {
        if (target.width(), target.height()) == size {
            return Ok(());
        }
        let old = *target;
        let resized = self.create(backend, old.read.label, size, old.read.format, old.read.filter)?;
        let copied = kernels.program(KernelKind::Copy).and_then(|copy| {
            copy.pass()
                .bind(Sampler::Texture, old.read.texture)
                .draw(backend, resized.target())
        });
        if let Err(err) = copied {
            self.release(backend, resized);
            return Err(err);
        }
        let fresh = match self.create(backend, old.read.label, size, old.read.format, old.read.filter)
        {
            Ok(fresh) => fresh,
            Err(err) => {
                self.release(backend, resized);
                return Err(err);
            }
        };

        self.release_double(backend, old);
        target.read = resized;
        target.write = fresh;
        tracing::debug!(
            label = old.read.label,
            from = ?(old.width(), old.height()),
            to = ?size,
            "resized double target"
        );
        Ok(())
    }

    pub fn release<B: Backend + ?Sized>(&mut self, backend: &mut B, target: RenderTarget) {
        if self.live.remove(&target.texture) {
            backend.destroy_texture(target.texture);
        }
    }

    pub fn release_double<B: Backend + ?Sized>(&mut self, backend: &mut B, target: DoubleTarget) {
        self.release(backend, target.read);
        self.release(backend, target.write);
    }

    pub fn release_all<B: Backend + ?Sized>(&mut self, backend: &mut B) {
        let count = self.live.len();
        for texture in std::mem::take(&mut self.live) {
            backend.destroy_texture(texture);
        }
        if count > 0 {
            tracing::debug!(count, "released all render targets");
        }
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }
}

/// Every target the solver and compositor use.
#[derive(Debug)]
pub struct FluidTargets {
    pub dye: DoubleTarget,
    pub velocity: DoubleTarget,
    pub divergence: RenderTarget,
    pub curl: RenderTarget,
    pub pressure: DoubleTarget,
    pub bloom: RenderTarget,
    pub bloom_frames: Vec<RenderTarget>,
    pub sunrays: RenderTarget,
    pub sunrays_temp: RenderTarget,
}

struct SimTargets {
    divergence: RenderTarget,
    curl: RenderTarget,
    pressure: DoubleTarget,
}

struct BloomTargets {
    bloom: RenderTarget,
    frames: Vec<RenderTarget>,
}

struct SunraysTargets {
    sunrays: RenderTarget,
    temp: RenderTarget,
}

/// Sizes and formats derived from config, capabilities and surface size.
pub struct TargetPlan<'a> {
    pub config: &'a Config,
    pub caps: &'a Capabilities,
    pub surface: (u32, u32),
}

impl TargetPlan<'_> {
    fn size(&self, resolution: u32) -> (u32, u32) {
        get_resolution(resolution, self.surface.0, self.surface.1)
    }

    fn filter(&self) -> Filter {
        if self.caps.linear_filtering {
            Filter::Linear
        } else {
            Filter::Nearest
        }
    }
}

impl FluidTargets {
    pub fn allocate<B: Backend + ?Sized>(
        pool: &mut TargetPool,
        backend: &mut B,
        plan: &TargetPlan<'_>,
    ) -> Result<Self, EngineError> {
        let caps = plan.caps;
        let dye = pool.create_double(
            backend,
            "dye",
            plan.size(plan.config.dye_resolution),
            caps.rgba,
            plan.filter(),
        )?;
        let velocity = pool.create_double(
            backend,
            "velocity",
            plan.size(plan.config.sim_resolution),
            caps.rg,
            plan.filter(),
        )?;
        let sim = SimTargets::allocate(pool, backend, plan)?;
        let bloom = BloomTargets::allocate(pool, backend, plan)?;
        let sunrays = SunraysTargets::allocate(pool, backend, plan)?;
        tracing::debug!(
            dye = ?(dye.width(), dye.height()),
            velocity = ?(velocity.width(), velocity.height()),
            bloom_levels = bloom.frames.len(),
            live = pool.live_count(),
            "allocated fluid targets"
        );
        Ok(Self {
            dye,
            velocity,
            divergence: sim.divergence,
            curl: sim.curl,
            pressure: sim.pressure,
            bloom: bloom.bloom,
            bloom_frames: bloom.frames,
            sunrays: sunrays.sunrays,
            sunrays_temp: sunrays.temp,
        })
    }

    /// Reallocates only the groups named in `changes`. Dye and velocity keep
    /// their contents; transient and derived targets are recreated empty.
    pub fn reallocate<B: Backend + ?Sized>(
        &mut self,
        pool: &mut TargetPool,
        backend: &mut B,
        kernels: &KernelRegistry,
        plan: &TargetPlan<'_>,
        changes: &ConfigChanges,
    ) -> Result<(), EngineError> {
        if changes.dye_resolution {
            pool.resize_double(
                backend,
                kernels,
                &mut self.dye,
                plan.size(plan.config.dye_resolution),
            )?;
        }
        if changes.sim_resolution {
            pool.resize_double(
                backend,
                kernels,
                &mut self.velocity,
                plan.size(plan.config.sim_resolution),
            )?;
            let sim = SimTargets::allocate(pool, backend, plan)?;
            pool.release(backend, self.divergence);
            pool.release(backend, self.curl);
            pool.release_double(backend, self.pressure);
            self.divergence = sim.divergence;
            self.curl = sim.curl;
            self.pressure = sim.pressure;
        }
        if changes.bloom_targets {
            let bloom = BloomTargets::allocate(pool, backend, plan)?;
            pool.release(backend, self.bloom);
            for frame in self.bloom_frames.drain(..) {
                pool.release(backend, frame);
            }
            self.bloom = bloom.bloom;
            self.bloom_frames = bloom.frames;
        }
        if changes.sunrays_resolution {
            let sunrays = SunraysTargets::allocate(pool, backend, plan)?;
            pool.release(backend, self.sunrays);
            pool.release(backend, self.sunrays_temp);
            self.sunrays = sunrays.sunrays;
            self.sunrays_temp = sunrays.temp;
        }
        Ok(())
    }

    /// Change set that touches every group; used after a surface resize.
    pub fn all_changes() -> ConfigChanges {
        ConfigChanges {
            sim_resolution: true,
            dye_resolution: true,
            bloom_targets: true,
            sunrays_resolution: true,
            keywords: false,
        }
    }
}

impl SimTargets {
    fn allocate<B: Backend + ?Sized>(
        pool: &mut TargetPool,
        backend: &mut B,
        plan: &TargetPlan<'_>,
    ) -> Result<Self, EngineError> {
        let size = plan.size(plan.config.sim_resolution);
        let r = plan.caps.r;
        Ok(Self {
            divergence: pool.create(backend, "divergence", size, r, Filter::Nearest)?,
            curl: pool.create(backend, "curl", size, r, Filter::Nearest)?,
            pressure: pool.create_double(backend, "pressure", size, r, Filter::Nearest)?,
        })
    }
}

impl BloomTargets {
    fn allocate<B: Backend + ?Sized>(
        pool: &mut TargetPool,
        backend: &mut B,
        plan: &TargetPlan<'_>,
    ) -> Result<Self, EngineError> {
        let (width, height) = plan.size(plan.config.bloom_resolution);
        let format = plan.caps.rgba;
        let filter = plan.filter();
        let bloom = pool.create(backend, "bloom", (width, height), format, filter)?;
        let mut frames = Vec::new();
        for level in 0..plan.config.bloom_iterations.min(31) {
            let w = width >> (level + 1);
            let h = height >> (level + 1);
            if w < 2 || h < 2 {
                break;
            }
            frames.push(pool.create(backend, "bloom frame", (w, h), format, filter)?);
        }
        Ok(Self { bloom, frames })
    }
}

impl SunraysTargets {
    fn allocate<B: Backend + ?Sized>(
        pool: &mut TargetPool,
        backend: &mut B,
        plan: &TargetPlan<'_>,
    ) -> Result<Self, EngineError> {
        let size = plan.size(plan.config.sunrays_resolution);
        let r = plan.caps.r;
        let filter = plan.filter();
        Ok(Self {
            sunrays: pool.create(backend, "sunrays", size, r, filter)?,
            temp: pool.create(backend, "sunrays temp", size, r, filter)?,
        })
    }
}
