//! The simulation facade: owns the backend and every engine resource, drives
//! the per-frame tick and exposes the pointer and command API.

use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::time::Instant;

use crossbeam_channel::Receiver;
use fluidconfig::{Config, ConfigChanges, ConfigPatch};
use image::RgbaImage;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use scheduler::{FrameScheduler, MAX_FRAME_DELTA};

use crate::backend::{Backend, TextureId};
use crate::compositor::{self, Destination};
use crate::dithering::{DitheringLoader, DitheringTexture};
use crate::error::EngineError;
use crate::kernels::{KernelFailurePolicy, KernelRegistry, Keyword, KeywordSet};
use crate::pointer::{Pointer, PointerSource, Pointers};
use crate::capabilities::Capabilities;
use crate::remote::{self, InputEvent, RemoteCommand, RemoteEvent, RemoteMessage};
use crate::solver;
use crate::splat::{self, Pattern, Splat};
use crate::targets::{FluidTargets, TargetPlan, TargetPool};

/// Dye resolution used when the device cannot filter float targets.
const FALLBACK_DYE_RESOLUTION: u32 = 512;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    Initializing,
    /// Frames are being scheduled.
    Running,
    /// Initialized, but no frames are scheduled.
    Paused,
    Destroyed,
}

impl LifecycleState {
    pub fn name(self) -> &'static str {
        match self {
            LifecycleState::Uninitialized => "uninitialized",
            LifecycleState::Initializing => "initializing",
            LifecycleState::Running => "running",
            LifecycleState::Paused => "paused",
            LifecycleState::Destroyed => "destroyed",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Default)]
pub struct SimulationOptions {
    /// Seed for splat positions and colors; entropy when absent.
    pub seed: Option<u64>,
    pub kernel_failures: KernelFailurePolicy,
    /// Image decoded in the background and used as the bloom dithering noise.
    pub dithering: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum QueuedOp {
    RandomSplats(u32),
    Pattern(Pattern),
}

struct Engine {
    caps: Capabilities,
    kernels: KernelRegistry,
    pool: TargetPool,
    targets: FluidTargets,
    dithering: DitheringTexture,
    loader: Option<DitheringLoader>,
}

pub struct Simulation<B: Backend> {
    backend: B,
    state: LifecycleState,
    config: Config,
    options: SimulationOptions,
    engine: Option<Engine>,
    pointers: Pointers,
    queue: VecDeque<QueuedOp>,
    remote: Option<Receiver<RemoteEvent>>,
    scheduler: FrameScheduler,
    rng: StdRng,
    color_timer: f32,
    surface: (u32, u32),
}

impl<B: Backend> Simulation<B> {
    /// Merges `patch` over the defaults. No backend resources are touched
    /// until [`Simulation::initialize`].
    pub fn new(
        backend: B,
        patch: &ConfigPatch,
        options: SimulationOptions,
    ) -> Result<Self, EngineError> {
        let mut config = Config::default();
        config.apply(patch)?;
        let rng = match options.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let surface = backend.surface_size();
        Ok(Self {
            backend,
            state: LifecycleState::Uninitialized,
            config,
            options,
            engine: None,
            pointers: Pointers::new(),
            queue: VecDeque::new(),
            remote: None,
            scheduler: FrameScheduler::new(),
            rng,
            color_timer: 0.0,
            surface,
        })
    }

    /// `new` followed by `initialize`.
    pub fn create(
        backend: B,
        patch: &ConfigPatch,
        options: SimulationOptions,
    ) -> Result<Self, EngineError> {
        let mut simulation = Self::new(backend, patch, options)?;
        simulation.initialize()?;
        Ok(simulation)
    }

    /// Detects capabilities, compiles every kernel, allocates every target and
    /// seeds the first splats. Any failure leaves the simulation destroyed.
    pub fn initialize(&mut self) -> Result<(), EngineError> {
        if self.state != LifecycleState::Uninitialized {
            return Err(self.invalid("initialize"));
        }
        self.state = LifecycleState::Initializing;
        match self.build_engine() {
            Ok(engine) => {
                tracing::info!(
                    backend = self.backend.name(),
                    surface = ?self.surface,
                    linear_filtering = engine.caps.linear_filtering,
                    live_targets = engine.pool.live_count(),
                    "simulation initialized"
                );
                self.engine = Some(engine);
                self.state = LifecycleState::Paused;
                Ok(())
            }
            Err(err) => {
                tracing::error!(%err, "simulation failed to initialize");
                self.state = LifecycleState::Destroyed;
                Err(err)
            }
        }
    }

    fn build_engine(&mut self) -> Result<Engine, EngineError> {
        let caps = Capabilities::detect(&self.backend)?;
        apply_fallbacks(&mut self.config, &caps);
        let advection = KeywordSet::EMPTY.with_if(Keyword::ManualFiltering, !caps.linear_filtering);
        let mut kernels =
            KernelRegistry::new(&mut self.backend, self.options.kernel_failures, advection)?;
        let mut pool = TargetPool::new();
        self.surface = self.backend.surface_size();

        let allocated = allocate_resources(
            &mut self.backend,
            &mut kernels,
            &mut pool,
            &self.config,
            &caps,
            &mut self.rng,
        );
        let (targets, dithering) = match allocated {
            Ok(resources) => resources,
            Err(err) => {
                pool.release_all(&mut self.backend);
                kernels.release(&mut self.backend);
                return Err(err);
            }
        };

        let loader = self.options.dithering.as_ref().map(DitheringLoader::spawn);
        Ok(Engine {
            caps,
            kernels,
            pool,
            targets,
            dithering,
            loader,
        })
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn is_alive(&self) -> bool {
        self.engine.is_some()
    }

    fn invalid(&self, operation: &'static str) -> EngineError {
        match self.state {
            LifecycleState::Destroyed => EngineError::Destroyed,
            state => EngineError::InvalidState {
                operation,
                state: state.name(),
            },
        }
    }

    /// Begins frame scheduling.
    pub fn start(&mut self, now: Instant) -> Result<(), EngineError> {
        match self.state {
            LifecycleState::Running => Ok(()),
            LifecycleState::Paused => {
                self.scheduler.start(now);
                self.state = LifecycleState::Running;
                Ok(())
            }
            _ => Err(self.invalid("start")),
        }
    }

    /// Cancels the pending frame. The simulation keeps its resources.
    pub fn stop(&mut self) {
        if self.state == LifecycleState::Running {
            self.scheduler.stop();
            self.state = LifecycleState::Paused;
        }
    }

    /// Releases every target, program and kernel. Safe to call repeatedly
    /// and before the dithering texture has finished loading.
    pub fn destroy(&mut self) {
        if self.state == LifecycleState::Destroyed {
            return;
        }
        self.teardown();
        tracing::info!("simulation destroyed");
    }

    fn teardown(&mut self) {
        self.scheduler.stop();
        if let Some(mut engine) = self.engine.take() {
            engine.pool.release_all(&mut self.backend);
            engine.kernels.release(&mut self.backend);
            engine.dithering.release(&mut self.backend);
            if let Some(loader) = engine.loader.take() {
                tracing::debug!(path = %loader.path().display(), "abandoning dithering load");
            }
        }
        self.queue.clear();
        self.remote = None;
        self.state = LifecycleState::Destroyed;
    }

    /// Switches between display-driven frames and the fallback timer.
    pub fn set_visible(&mut self, visible: bool, now: Instant) {
        self.scheduler.set_visible(visible, now);
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.scheduler.next_deadline()
    }

    pub fn frames(&self) -> u64 {
        self.scheduler.frames()
    }

    pub fn get_config(&self) -> &Config {
        &self.config
    }

    /// Flat TOML that `update_config` accepts back.
    pub fn export_config(&self) -> Result<String, EngineError> {
        Ok(self.config.to_toml_string()?)
    }

    /// Merges `patch`, reallocating targets whose resolution changed and
    /// reselecting the display variant when a keyword flag changed. A display
    /// variant that fails to compile leaves the config unchanged; a failed
    /// reallocation destroys the simulation.
    pub fn update_config(&mut self, patch: &ConfigPatch) -> Result<ConfigChanges, EngineError> {
        let Some(engine) = self.engine.as_mut() else {
            return Err(self.invalid("update config"));
        };
        let mut next = self.config.clone();
        let changes = next.apply(patch)?;
        apply_fallbacks(&mut next, &engine.caps);

        if changes.needs_recompile() {
            let keywords = compositor::display_keywords(&next);
            if let Err(err) = engine.kernels.select_display(&mut self.backend, keywords) {
                tracing::error!(%err, %keywords, "display variant unavailable; config unchanged");
                return Err(err);
            }
        }
        self.config = next;

        if changes.needs_realloc() {
            let plan = TargetPlan {
                config: &self.config,
                caps: &engine.caps,
                surface: self.backend.surface_size(),
            };
            let reallocated = engine.targets.reallocate(
                &mut engine.pool,
                &mut self.backend,
                &engine.kernels,
                &plan,
                &changes,
            );
            if let Err(err) = reallocated {
                tracing::error!(%err, "reallocation failed; destroying simulation");
                self.teardown();
                return Err(err);
            }
        }
        tracing::debug!(?changes, "config updated");
        Ok(changes)
    }

    /// Freezes or resumes the solver. Splats and rendering continue.
    pub fn set_paused(&mut self, paused: bool) {
        self.config.paused = paused;
    }

    fn aspect(&self) -> f32 {
        let (width, height) = self.backend.surface_size();
        width.max(1) as f32 / height.max(1) as f32
    }

    /// Presses a pointer at texture coordinates `(x, y)`, origin top-left.
    pub fn handle_pointer_down(
        &mut self,
        source: PointerSource,
        x: f32,
        y: f32,
        color: Option<[f32; 3]>,
        colorful: Option<bool>,
    ) {
        if !self.is_alive() {
            return;
        }
        let color = color.unwrap_or_else(|| splat::generate_color(&mut self.rng, &self.config));
        self.pointers
            .down(source, [x, y], color, colorful.unwrap_or(true));
    }

    pub fn handle_pointer_move(&mut self, source: &PointerSource, x: f32, y: f32) {
        if !self.is_alive() {
            return;
        }
        let aspect = self.aspect();
        self.pointers.moved(source, [x, y], aspect);
    }

    pub fn handle_pointer_up(&mut self, source: &PointerSource) {
        self.pointers.up(source);
    }

    pub fn set_pointer_color(&mut self, source: &PointerSource, color: [f32; 3]) -> bool {
        self.pointers.set_color(source, color)
    }

    pub fn set_pointer_colorful(&mut self, source: &PointerSource, colorful: bool) -> bool {
        self.pointers.set_colorful(source, colorful)
    }

    pub fn pointer(&self, source: &PointerSource) -> Option<&Pointer> {
        self.pointers.get(source)
    }

    /// Queues a preset; it is injected on the next frame.
    pub fn create_pattern(&mut self, pattern: Pattern) {
        if self.is_alive() {
            self.queue.push_back(QueuedOp::Pattern(pattern));
        }
    }

    /// Queues `count` random splats for the next frame.
    pub fn create_random_splats(&mut self, count: u32) {
        if self.is_alive() && count > 0 {
            self.queue.push_back(QueuedOp::RandomSplats(count));
        }
    }

    /// Remote events are drained once per frame.
    pub fn attach_remote(&mut self, receiver: Receiver<RemoteEvent>) {
        self.remote = Some(receiver);
    }

    /// Runs a frame if the scheduler says one is due. Returns whether a frame
    /// was rendered. The next frame stays scheduled after a failed one unless
    /// the failure destroyed the simulation.
    pub fn tick(&mut self, now: Instant) -> Result<bool, EngineError> {
        if self.state != LifecycleState::Running {
            return Ok(false);
        }
        let Some(tick) = self.scheduler.begin_frame(now) else {
            return Ok(false);
        };
        let rendered = self.frame(tick.dt);
        if self.state == LifecycleState::Running {
            self.scheduler.finish_frame(now);
        }
        rendered.map(|()| true)
    }

    /// Runs one frame with an explicit timestep, independent of scheduling.
    pub fn advance(&mut self, dt: f32) -> Result<(), EngineError> {
        if !self.is_alive() {
            return Err(self.invalid("advance"));
        }
        self.frame(dt.clamp(0.0, MAX_FRAME_DELTA))
    }

    fn frame(&mut self, dt: f32) -> Result<(), EngineError> {
        self.check_resize()?;
        self.update_colors(dt);
        self.poll_dithering();
        self.drain_remote();
        self.apply_queued()?;
        self.apply_pointers()?;

        let destination = Destination::surface(&self.backend);
        let engine = self.engine.as_mut().ok_or(EngineError::Destroyed)?;
        if !self.config.paused {
            solver::step(
                &mut self.backend,
                &engine.kernels,
                &mut engine.targets,
                &self.config,
                &engine.caps,
                dt,
            )?;
        }
        compositor::render(
            &mut self.backend,
            &mut engine.kernels,
            &engine.targets,
            &self.config,
            &engine.dithering,
            destination,
        )?;
        self.backend.end_frame()
    }

    /// Reallocates every target group when the surface size changed.
    fn check_resize(&mut self) -> Result<(), EngineError> {
        let surface = self.backend.surface_size();
        if surface == self.surface {
            return Ok(());
        }
        let engine = self.engine.as_mut().ok_or(EngineError::Destroyed)?;
        let plan = TargetPlan {
            config: &self.config,
            caps: &engine.caps,
            surface,
        };
        let reallocated = engine.targets.reallocate(
            &mut engine.pool,
            &mut self.backend,
            &engine.kernels,
            &plan,
            &FluidTargets::all_changes(),
        );
        if let Err(err) = reallocated {
            tracing::error!(%err, ?surface, "resize failed; destroying simulation");
            self.teardown();
            return Err(err);
        }
        tracing::debug!(from = ?self.surface, to = ?surface, "surface resized");
        self.surface = surface;
        Ok(())
    }

    fn update_colors(&mut self, dt: f32) {
        if !self.config.colorful {
            return;
        }
        self.color_timer += dt * self.config.color_update_speed;
        if self.color_timer < 1.0 {
            return;
        }
        self.color_timer = self.color_timer.fract();
        for (_, pointer) in self.pointers.iter_mut() {
            if pointer.colorful {
                pointer.color = splat::generate_color(&mut self.rng, &self.config);
            }
        }
    }

    fn poll_dithering(&mut self) {
        let Some(engine) = self.engine.as_mut() else {
            return;
        };
        let Some(result) = engine.loader.as_ref().and_then(DitheringLoader::poll) else {
            return;
        };
        let path = engine
            .loader
            .take()
            .map(|loader| loader.path().display().to_string())
            .unwrap_or_default();
        let image = match result {
            Ok(image) => image,
            Err(err) => {
                tracing::warn!(%path, %err, "dithering texture failed to load; keeping placeholder");
                return;
            }
        };
        match DitheringTexture::from_image(&mut self.backend, &image) {
            Ok(texture) => {
                let placeholder = std::mem::replace(&mut engine.dithering, texture);
                placeholder.release(&mut self.backend);
                tracing::info!(%path, size = ?image.dimensions(), "dithering texture loaded");
            }
            Err(err) => {
                tracing::warn!(%path, %err, "dithering texture upload failed; keeping placeholder");
            }
        }
    }

    fn drain_remote(&mut self) {
        let events: Vec<RemoteEvent> = match &self.remote {
            Some(receiver) => receiver.try_iter().collect(),
            None => return,
        };
        for event in events {
            self.apply_remote(event);
        }
    }

    fn apply_remote(&mut self, event: RemoteEvent) {
        let (session, message) = match event {
            RemoteEvent::SessionClosed { session } => {
                let released = self.pointers.release_session(session);
                tracing::debug!(session, released, "released remote pointers");
                return;
            }
            RemoteEvent::Message { session, message } => (session, message),
        };
        match message {
            RemoteMessage::RemoteInput(input) => {
                let source = PointerSource::remote(session, input.pointer_id.to_string());
                let position = input.position.map(|position| (position.x, position.y));
                match (input.event_type, position) {
                    (InputEvent::Down, Some((x, y))) => self.handle_pointer_down(
                        source,
                        x,
                        y,
                        input.color.as_ref().map(splat::scaled_color),
                        input.colorful,
                    ),
                    (InputEvent::Move, Some((x, y))) => self.handle_pointer_move(&source, x, y),
                    (InputEvent::Up, _) => self.handle_pointer_up(&source),
                    (event, None) => {
                        tracing::warn!(session, %event, "remote input without position")
                    }
                }
            }
            RemoteMessage::Command(command) => self.apply_command(session, command),
            RemoteMessage::Beat { intensity } => {
                self.create_random_splats(remote::beat_splats(intensity))
            }
        }
    }

    fn apply_command(&mut self, session: u64, command: RemoteCommand) {
        let patch = match command {
            RemoteCommand::RandomSplats { count } => {
                self.create_random_splats(count);
                return;
            }
            RemoteCommand::PresetPattern { pattern } => {
                match pattern.parse::<Pattern>() {
                    Ok(pattern) => self.create_pattern(pattern),
                    Err(err) => tracing::warn!(session, %err, "ignoring remote pattern"),
                }
                return;
            }
            RemoteCommand::SetSplatColor { color } => ConfigPatch {
                splat_color: Some(color),
                ..ConfigPatch::default()
            },
            RemoteCommand::SetRainbowMode { enabled } => ConfigPatch {
                rainbow_mode: Some(enabled),
                ..ConfigPatch::default()
            },
        };
        if let Err(err) = self.update_config(&patch) {
            tracing::warn!(session, %err, "remote config command rejected");
        }
    }

    fn apply_queued(&mut self) -> Result<(), EngineError> {
        while let Some(op) = self.queue.pop_front() {
            let splats = match op {
                QueuedOp::RandomSplats(count) => {
                    splat::random_splats(&mut self.rng, &self.config, count)
                }
                QueuedOp::Pattern(pattern) => pattern.splats(&mut self.rng, &self.config),
            };
            tracing::trace!(?op, splats = splats.len(), "applying queued splats");
            self.inject_all(&splats)?;
        }
        Ok(())
    }

    fn apply_pointers(&mut self) -> Result<(), EngineError> {
        let force = self.config.splat_force;
        let splats: Vec<Splat> = self
            .pointers
            .iter_mut()
            .filter(|(_, pointer)| pointer.moved)
            .map(|(_, pointer)| {
                pointer.moved = false;
                Splat {
                    x: pointer.texcoord[0],
                    y: pointer.texcoord[1],
                    dx: pointer.delta[0] * force,
                    dy: pointer.delta[1] * force,
                    color: pointer.color,
                }
            })
            .collect();
        self.inject_all(&splats)
    }

    fn inject_all(&mut self, splats: &[Splat]) -> Result<(), EngineError> {
        let aspect = self.aspect();
        let engine = self.engine.as_mut().ok_or(EngineError::Destroyed)?;
        for splat in splats {
            splat::inject(
                &mut self.backend,
                &engine.kernels,
                &mut engine.targets,
                &self.config,
                aspect,
                splat,
            )?;
        }
        Ok(())
    }

    /// Renders the current composite offscreen at `CAPTURE_RESOLUTION`.
    pub fn capture(&mut self) -> Result<RgbaImage, EngineError> {
        let Some(engine) = self.engine.as_mut() else {
            return Err(self.invalid("capture"));
        };
        compositor::capture(
            &mut self.backend,
            &mut engine.kernels,
            &mut engine.pool,
            &engine.targets,
            &self.config,
            &engine.dithering,
        )
    }

    /// Blocks until the dithering image is decoded and installs it.
    pub fn wait_for_dithering(&mut self) {
        let Some(engine) = self.engine.as_mut() else {
            return;
        };
        let Some(loader) = engine.loader.take() else {
            return;
        };
        let path = loader.path().display().to_string();
        let installed = loader
            .wait()
            .and_then(|image| {
                DitheringTexture::from_image(&mut self.backend, &image).map_err(|err| err.to_string())
            });
        match installed {
            Ok(texture) => std::mem::replace(&mut engine.dithering, texture).release(&mut self.backend),
            Err(err) => tracing::warn!(%path, %err, "dithering texture failed to load; keeping placeholder"),
        }
    }

    pub fn capabilities(&self) -> Option<&Capabilities> {
        self.engine.as_ref().map(|engine| &engine.caps)
    }

    pub fn targets(&self) -> Option<&FluidTargets> {
        self.engine.as_ref().map(|engine| &engine.targets)
    }

    pub fn kernels(&self) -> Option<&KernelRegistry> {
        self.engine.as_ref().map(|engine| &engine.kernels)
    }

    pub fn dithering(&self) -> Option<&DitheringTexture> {
        self.engine.as_ref().map(|engine| &engine.dithering)
    }

    /// The dye texture holding the current visible field.
    pub fn dye_texture(&self) -> Option<TextureId> {
        self.targets().map(|targets| targets.dye.read().texture())
    }

    pub fn live_targets(&self) -> usize {
        self.engine
            .as_ref()
            .map_or(0, |engine| engine.pool.live_count())
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Resizes the surface; targets follow on the next frame.
    pub fn resize(&mut self, width: u32, height: u32) {
        self.backend.resize_surface(width, height);
    }
}

impl<B: Backend> Drop for Simulation<B> {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Without linear filtering the dye is kept small and the effects that
/// depend on filtered reads are switched off.
fn apply_fallbacks(config: &mut Config, caps: &Capabilities) {
    if caps.linear_filtering {
        return;
    }
    config.dye_resolution = FALLBACK_DYE_RESOLUTION;
    config.shading = false;
    config.bloom = false;
    config.sunrays = false;
}

fn allocate_resources<B: Backend + ?Sized>(
    backend: &mut B,
    kernels: &mut KernelRegistry,
    pool: &mut TargetPool,
    config: &Config,
    caps: &Capabilities,
    rng: &mut StdRng,
) -> Result<(FluidTargets, DitheringTexture), EngineError> {
    let plan = TargetPlan {
        config,
        caps,
        surface: backend.surface_size(),
    };
    let mut targets = FluidTargets::allocate(pool, backend, &plan)?;
    kernels.select_display(backend, compositor::display_keywords(config))?;

    let (width, height) = backend.surface_size();
    let aspect = width.max(1) as f32 / height.max(1) as f32;
    let count = rng.gen_range(5..=25);
    for seed in splat::random_splats(rng, config, count) {
        splat::inject(backend, kernels, &mut targets, config, aspect, &seed)?;
    }
    tracing::debug!(count, "seeded initial splats");

    let dithering = DitheringTexture::placeholder(backend)?;
    Ok((targets, dithering))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::software::SoftwareBackend;
    use crate::kernels::KernelKind;
    use crate::remote::remote_channel;

    fn small() -> ConfigPatch {
        ConfigPatch {
            sim_resolution: Some(8),
            dye_resolution: Some(16),
            bloom_resolution: Some(8),
            sunrays_resolution: Some(8),
            capture_resolution: Some(8),
            pressure_iterations: Some(4),
            ..ConfigPatch::default()
        }
    }

    fn options() -> SimulationOptions {
        SimulationOptions {
            seed: Some(7),
            ..SimulationOptions::default()
        }
    }

    fn simulation(backend: SoftwareBackend) -> Simulation<SoftwareBackend> {
        Simulation::create(backend, &small(), options()).unwrap()
    }

    fn kernels_since(sim: &mut Simulation<SoftwareBackend>) -> Vec<KernelKind> {
        sim.backend_mut()
            .take_passes()
            .into_iter()
            .map(|pass| pass.kernel)
            .collect()
    }

    #[test]
    fn lifecycle_transitions() {
        let mut sim =
            Simulation::new(SoftwareBackend::new(16, 16), &small(), options()).unwrap();
        assert_eq!(sim.state(), LifecycleState::Uninitialized);
        assert!(matches!(
            sim.start(Instant::now()),
            Err(EngineError::InvalidState { .. })
        ));

        sim.initialize().unwrap();
        assert_eq!(sim.state(), LifecycleState::Paused);
        assert!(sim.initialize().is_err());

        let now = Instant::now();
        sim.start(now).unwrap();
        assert_eq!(sim.state(), LifecycleState::Running);
        assert!(sim.tick(now).unwrap());
        assert_eq!(sim.frames(), 1);

        sim.stop();
        assert_eq!(sim.state(), LifecycleState::Paused);
        assert_eq!(sim.next_deadline(), None);
        assert!(!sim.tick(now).unwrap());

        sim.destroy();
        assert_eq!(sim.state(), LifecycleState::Destroyed);
        assert!(matches!(sim.start(now), Err(EngineError::Destroyed)));
    }

    #[test]
    fn failed_frame_keeps_the_next_one_scheduled() {
        let mut sim = simulation(SoftwareBackend::new(16, 16));
        let now = Instant::now();
        sim.start(now).unwrap();
        sim.backend_mut().fail_next_present();

        assert!(matches!(sim.tick(now), Err(EngineError::Surface(_))));
        assert_eq!(sim.state(), LifecycleState::Running);
        assert_eq!(sim.next_deadline(), Some(now));
        assert!(sim.tick(now).unwrap());
        assert_eq!(sim.frames(), 2);
    }

    #[test]
    fn create_seeds_between_five_and_twenty_five_splats() {
        let mut backend = SoftwareBackend::new(16, 16);
        backend.take_passes();
        let sim = Simulation::create(backend, &small(), options()).unwrap();
        let splat_passes = sim
            .backend()
            .passes()
            .iter()
            .filter(|pass| pass.kernel == KernelKind::Splat)
            .count();
        assert_eq!(splat_passes % 2, 0);
        assert!((10..=50).contains(&splat_passes), "{splat_passes}");
    }

    #[test]
    fn paused_config_skips_the_whole_solver_step() {
        let mut sim = simulation(SoftwareBackend::new(16, 16));
        sim.set_paused(true);
        kernels_since(&mut sim);
        sim.advance(1.0 / 60.0).unwrap();
        let kernels = kernels_since(&mut sim);
        assert!(!kernels.contains(&KernelKind::Curl));
        assert!(!kernels.contains(&KernelKind::Advection));
        assert_eq!(kernels.last(), Some(&KernelKind::Display));

        sim.set_paused(false);
        sim.advance(1.0 / 60.0).unwrap();
        let kernels = kernels_since(&mut sim);
        assert_eq!(
            kernels
                .iter()
                .filter(|kind| **kind == KernelKind::Pressure)
                .count(),
            4
        );
    }

    #[test]
    fn queued_ops_apply_on_next_frame() {
        let mut sim = simulation(SoftwareBackend::new(16, 16));
        kernels_since(&mut sim);
        sim.create_random_splats(3);
        sim.create_pattern(Pattern::Corners);
        assert!(kernels_since(&mut sim).is_empty());

        sim.advance(1.0 / 60.0).unwrap();
        let splats = kernels_since(&mut sim)
            .into_iter()
            .filter(|kind| *kind == KernelKind::Splat)
            .count();
        assert_eq!(splats, 2 * (3 + 4));
    }

    #[test]
    fn pointer_motion_splats_once() {
        let mut sim = simulation(SoftwareBackend::new(16, 16));
        sim.handle_pointer_down(PointerSource::Local, 0.5, 0.5, None, None);
        sim.handle_pointer_move(&PointerSource::Local, 0.6, 0.5);
        assert!(sim.pointer(&PointerSource::Local).unwrap().moved);
        kernels_since(&mut sim);

        sim.advance(1.0 / 60.0).unwrap();
        let first = kernels_since(&mut sim);
        assert_eq!(first.iter().filter(|k| **k == KernelKind::Splat).count(), 2);
        assert!(!sim.pointer(&PointerSource::Local).unwrap().moved);

        sim.advance(1.0 / 60.0).unwrap();
        let second = kernels_since(&mut sim);
        assert!(!second.contains(&KernelKind::Splat));
    }

    #[test]
    fn colorful_pointers_recolor_on_schedule() {
        let mut patch = small();
        patch.color_update_speed = Some(10.0);
        let mut sim =
            Simulation::create(SoftwareBackend::new(16, 16), &patch, options()).unwrap();
        let fixed = PointerSource::Touch(1);
        let cycling = PointerSource::Touch(2);
        sim.handle_pointer_down(fixed.clone(), 0.2, 0.2, Some([0.0; 3]), Some(false));
        sim.handle_pointer_down(cycling.clone(), 0.8, 0.8, Some([0.0; 3]), None);

        // 0.1 s of simulated time at speed 10 crosses one update.
        for _ in 0..7 {
            sim.advance(1.0 / 60.0).unwrap();
        }
        assert_eq!(sim.pointer(&fixed).unwrap().color, [0.0; 3]);
        assert_ne!(sim.pointer(&cycling).unwrap().color, [0.0; 3]);
    }

    #[test]
    fn resolution_update_reallocates_only_sim_targets() {
        let mut sim = simulation(SoftwareBackend::new(16, 16));
        let before_dye = sim.targets().unwrap().dye;
        let before_velocity = sim.targets().unwrap().velocity;
        let before_bloom = sim.targets().unwrap().bloom;
        let live = sim.live_targets();

        let changes = sim
            .update_config(&ConfigPatch {
                sim_resolution: Some(4),
                ..ConfigPatch::default()
            })
            .unwrap();
        assert!(changes.sim_resolution);
        assert!(!changes.dye_resolution);

        let targets = sim.targets().unwrap();
        assert_eq!(targets.dye, before_dye);
        assert_eq!(targets.bloom, before_bloom);
        assert_ne!(targets.velocity.read(), before_velocity.read());
        assert_eq!((targets.velocity.width(), targets.velocity.height()), (4, 4));
        assert_eq!((targets.curl.width(), targets.divergence.width()), (4, 4));
        assert_eq!(sim.live_targets(), live);
    }

    #[test]
    fn invalid_update_leaves_config_untouched() {
        let mut sim = simulation(SoftwareBackend::new(16, 16));
        let before = sim.get_config().clone();
        let result = sim.update_config(&ConfigPatch {
            pressure_iterations: Some(0),
            ..ConfigPatch::default()
        });
        assert!(matches!(result, Err(EngineError::Config(_))));
        assert_eq!(sim.get_config(), &before);
        assert!(sim.is_alive());
    }

    #[test]
    fn failed_reallocation_is_fatal_and_leak_free() {
        let mut sim = simulation(SoftwareBackend::new(16, 16));
        sim.backend_mut().fail_next_allocation();
        let result = sim.update_config(&ConfigPatch {
            dye_resolution: Some(8),
            ..ConfigPatch::default()
        });
        assert!(matches!(result, Err(EngineError::Allocation { .. })));
        assert_eq!(sim.state(), LifecycleState::Destroyed);
        assert!(sim.backend().live_resources().is_empty());
    }

    #[test]
    fn keyword_change_selects_new_display_variant() {
        let mut sim = simulation(SoftwareBackend::new(16, 16));
        let before = sim.kernels().unwrap().display().active();
        sim.update_config(&ConfigPatch {
            shading: Some(false),
            ..ConfigPatch::default()
        })
        .unwrap();
        let after = sim.kernels().unwrap().display().active().unwrap();
        assert_ne!(Some(after), before);
        assert!(!after.contains(Keyword::Shading));
    }

    #[test]
    fn failed_display_variant_keeps_previous_config() {
        let mut sim = simulation(SoftwareBackend::new(16, 16));
        let before = sim.get_config().clone();
        let active = sim.kernels().unwrap().display().active();
        sim.backend_mut().fail_kernel(KernelKind::Display);

        let result = sim.update_config(&ConfigPatch {
            bloom: Some(false),
            curl: Some(3.0),
            ..ConfigPatch::default()
        });
        assert!(matches!(result, Err(EngineError::KernelCompile { .. })));
        assert_eq!(sim.get_config(), &before);
        assert_eq!(sim.kernels().unwrap().display().active(), active);
        assert!(sim.is_alive());
        sim.advance(1.0 / 60.0).unwrap();
    }

    #[test]
    fn broken_display_variant_is_accepted_under_continue() {
        let mut sim = Simulation::create(
            SoftwareBackend::new(16, 16),
            &small(),
            SimulationOptions {
                kernel_failures: KernelFailurePolicy::Continue,
                ..options()
            },
        )
        .unwrap();
        sim.backend_mut().fail_kernel(KernelKind::Display);

        sim.update_config(&ConfigPatch {
            bloom: Some(false),
            ..ConfigPatch::default()
        })
        .unwrap();
        assert!(!sim.get_config().bloom);
        let active = sim.kernels().unwrap().display().active().unwrap();
        assert!(!active.contains(Keyword::Bloom));
    }

    #[test]
    fn missing_linear_filtering_forces_fallbacks() {
        let sim = simulation(SoftwareBackend::new(16, 16).without_linear_filtering());
        let config = sim.get_config();
        assert_eq!(config.dye_resolution, FALLBACK_DYE_RESOLUTION);
        assert!(!config.shading && !config.bloom && !config.sunrays);
        let advection = sim
            .kernels()
            .unwrap()
            .program(KernelKind::Advection)
            .unwrap();
        assert!(advection.keywords().contains(Keyword::ManualFiltering));
    }

    #[test]
    fn surface_resize_reallocates_before_the_frame() {
        let mut sim = simulation(SoftwareBackend::new(16, 16));
        sim.resize(32, 16);
        sim.advance(1.0 / 60.0).unwrap();
        let targets = sim.targets().unwrap();
        assert_eq!((targets.velocity.width(), targets.velocity.height()), (16, 8));
        assert_eq!((targets.dye.width(), targets.dye.height()), (32, 16));
    }

    #[test]
    fn remote_events_drive_pointers_and_commands() {
        let mut sim = simulation(SoftwareBackend::new(16, 16));
        let (sender, receiver) = remote_channel();
        sim.attach_remote(receiver);

        sender
            .send_line(
                3,
                r#"{"type":"remote_input","eventType":"down","position":{"x":0.5,"y":0.5},"controllerId":"pad"}"#,
            )
            .unwrap();
        sender
            .send_line(
                3,
                r#"{"type":"command","command":"set_rainbow_mode","parameters":{"enabled":false}}"#,
            )
            .unwrap();
        sender
            .send_line(3, r#"{"type":"beat","intensity":0.6}"#)
            .unwrap();
        kernels_since(&mut sim);
        sim.advance(1.0 / 60.0).unwrap();

        let source = PointerSource::remote(3, "pad");
        assert!(sim.pointer(&source).unwrap().down);
        assert!(!sim.get_config().rainbow_mode);
        let splats = kernels_since(&mut sim)
            .into_iter()
            .filter(|kind| *kind == KernelKind::Splat)
            .count();
        assert_eq!(splats, 2 * 3);

        sender.close_session(3).unwrap();
        sim.advance(1.0 / 60.0).unwrap();
        assert!(sim.pointer(&source).is_none());
    }

    #[test]
    fn export_round_trips_through_update() {
        let mut sim = simulation(SoftwareBackend::new(16, 16));
        sim.update_config(&ConfigPatch {
            curl: Some(12.0),
            mirror_mode: Some(true),
            ..ConfigPatch::default()
        })
        .unwrap();
        let exported = sim.export_config().unwrap();

        let mut other = simulation(SoftwareBackend::new(16, 16));
        other
            .update_config(&ConfigPatch::from_toml_str(&exported).unwrap())
            .unwrap();
        assert_eq!(other.get_config(), sim.get_config());
    }

    #[test]
    fn capture_matches_capture_resolution() {
        let mut sim = simulation(SoftwareBackend::new(32, 16));
        let live = sim.live_targets();
        let image = sim.capture().unwrap();
        assert_eq!(image.dimensions(), (16, 8));
        assert_eq!(sim.live_targets(), live);
    }

    #[test]
    fn dithering_image_replaces_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("noise.png");
        image::RgbaImage::from_pixel(4, 4, image::Rgba([1, 2, 3, 255]))
            .save(&path)
            .unwrap();
        let mut sim = Simulation::create(
            SoftwareBackend::new(16, 16),
            &small(),
            SimulationOptions {
                dithering: Some(path),
                ..options()
            },
        )
        .unwrap();
        sim.wait_for_dithering();
        assert_eq!(sim.dithering().unwrap().size(), (4, 4));
        sim.destroy();
        assert!(sim.backend().live_resources().is_empty());
    }

    #[test]
    fn destroy_before_dithering_load_is_safe() {
        let dir = tempfile::tempdir().unwrap();
        let mut sim = Simulation::create(
            SoftwareBackend::new(16, 16),
            &small(),
            SimulationOptions {
                dithering: Some(dir.path().join("missing.png")),
                ..options()
            },
        )
        .unwrap();
        sim.destroy();
        sim.destroy();
        assert!(sim.backend().live_resources().is_empty());
        assert!(sim.advance(1.0 / 60.0).is_err());
    }
}
