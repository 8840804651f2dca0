//! Interactive preview: a winit window presenting the simulation through the
//! wgpu backend. Mouse drives the local pointer, touches drive touch pointers.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::Receiver;
use fluidconfig::ConfigPatch;
use image::RgbaImage;
use rand::Rng;
use winit::dpi::{PhysicalPosition, PhysicalSize};
use winit::event::{ElementState, Event, KeyEvent, MouseButton, Touch, TouchPhase, WindowEvent};
use winit::event_loop::{ControlFlow, EventLoop};
use winit::keyboard::{Key, NamedKey};
use winit::window::{Window, WindowBuilder};

use crate::backend::gpu::GpuBackend;
use crate::pointer::PointerSource;
use crate::remote::RemoteEvent;
use crate::simulation::{Simulation, SimulationOptions};

pub struct PreviewOptions {
    pub title: String,
    pub size: (u32, u32),
    pub patch: ConfigPatch,
    pub simulation: SimulationOptions,
    pub remote: Option<Receiver<RemoteEvent>>,
    /// Directory `C` writes captures into.
    pub capture_dir: PathBuf,
}

/// The simulation is declared first so it drops before the window its
/// surface was created from.
struct Preview {
    simulation: Simulation<GpuBackend>,
    window: Arc<Window>,
    cursor: PhysicalPosition<f64>,
    mouse_down: bool,
    capture_dir: PathBuf,
}

impl Preview {
    fn texcoord(&self, position: PhysicalPosition<f64>) -> (f32, f32) {
        let size = self.window.inner_size();
        (
            position.x as f32 / size.width.max(1) as f32,
            position.y as f32 / size.height.max(1) as f32,
        )
    }

    fn handle_cursor(&mut self, position: PhysicalPosition<f64>) {
        self.cursor = position;
        if self.mouse_down {
            let (x, y) = self.texcoord(position);
            self.simulation
                .handle_pointer_move(&PointerSource::Local, x, y);
        }
    }

    fn handle_mouse(&mut self, state: ElementState) {
        match state {
            ElementState::Pressed => {
                self.mouse_down = true;
                let (x, y) = self.texcoord(self.cursor);
                self.simulation
                    .handle_pointer_down(PointerSource::Local, x, y, None, None);
            }
            ElementState::Released => {
                self.mouse_down = false;
                self.simulation.handle_pointer_up(&PointerSource::Local);
            }
        }
    }

    fn handle_touch(&mut self, touch: Touch) {
        let source = PointerSource::Touch(touch.id);
        let (x, y) = self.texcoord(touch.location);
        match touch.phase {
            TouchPhase::Started => self.simulation.handle_pointer_down(source, x, y, None, None),
            TouchPhase::Moved => self.simulation.handle_pointer_move(&source, x, y),
            TouchPhase::Ended | TouchPhase::Cancelled => self.simulation.handle_pointer_up(&source),
        }
    }

    fn handle_key(&mut self, event: &KeyEvent) {
        if event.state != ElementState::Pressed || event.repeat {
            return;
        }
        match &event.logical_key {
            Key::Named(NamedKey::Space) => {
                let count = rand::thread_rng().gen_range(5..=25);
                self.simulation.create_random_splats(count);
            }
            Key::Character(value) if value.eq_ignore_ascii_case("p") => {
                let paused = !self.simulation.get_config().paused;
                self.simulation.set_paused(paused);
                tracing::info!(paused, "toggled pause");
            }
            Key::Character(value) if value.eq_ignore_ascii_case("c") => {
                match self.capture() {
                    Ok(path) => tracing::info!(path = %path.display(), "capture saved"),
                    Err(err) => tracing::error!("capture failed: {err:?}"),
                }
            }
            _ => {}
        }
    }

    fn capture(&mut self) -> Result<PathBuf> {
        let image = self.simulation.capture()?;
        save_capture(&image, &self.capture_dir)
    }

    fn resize(&mut self, size: PhysicalSize<u32>) {
        if size.width > 0 && size.height > 0 {
            self.simulation.resize(size.width, size.height);
        }
    }
}

/// Writes `image` as a timestamped PNG inside `dir`.
pub fn save_capture(image: &RgbaImage, dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create capture directory {}", dir.display()))?;
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis())
        .unwrap_or_default();
    let path = dir.join(format!("dyeflow-{stamp}.png"));
    image
        .save(&path)
        .with_context(|| format!("failed to write capture {}", path.display()))?;
    Ok(path)
}

/// Opens the preview window and runs until it is closed.
pub fn run_preview(options: PreviewOptions) -> Result<()> {
    let PreviewOptions {
        title,
        size,
        patch,
        simulation,
        remote,
        capture_dir,
    } = options;

    let event_loop = EventLoop::new().map_err(|err| anyhow!("failed to create event loop: {err}"))?;
    let window = WindowBuilder::new()
        .with_title(title)
        .with_inner_size(PhysicalSize::new(size.0, size.1))
        .build(&event_loop)
        .map_err(|err| anyhow!("failed to create preview window: {err}"))?;
    let window = Arc::new(window);

    let inner = window.inner_size();
    let backend = GpuBackend::with_window(window.as_ref(), inner.width.max(1), inner.height.max(1))
        .context("failed to initialise GPU backend")?;
    let mut simulation = Simulation::create(backend, &patch, simulation)
        .context("failed to create fluid simulation")?;
    if let Some(receiver) = remote {
        simulation.attach_remote(receiver);
    }
    simulation.start(Instant::now())?;

    let mut preview = Preview {
        simulation,
        window,
        cursor: PhysicalPosition::new(0.0, 0.0),
        mouse_down: false,
        capture_dir,
    };
    preview.window.request_redraw();

    event_loop
        .run(move |event, elwt| match event {
            Event::WindowEvent { window_id, event } if window_id == preview.window.id() => {
                match event {
                    WindowEvent::CloseRequested | WindowEvent::Destroyed => {
                        preview.simulation.destroy();
                        elwt.exit();
                    }
                    WindowEvent::Resized(size) => preview.resize(size),
                    WindowEvent::Occluded(occluded) => {
                        preview.simulation.set_visible(!occluded, Instant::now());
                    }
                    WindowEvent::CursorMoved { position, .. } => preview.handle_cursor(position),
                    WindowEvent::MouseInput {
                        state,
                        button: MouseButton::Left,
                        ..
                    } => preview.handle_mouse(state),
                    WindowEvent::Touch(touch) => preview.handle_touch(touch),
                    WindowEvent::KeyboardInput { event, .. } => preview.handle_key(&event),
                    WindowEvent::RedrawRequested => {
                        if let Err(err) = preview.simulation.tick(Instant::now()) {
                            tracing::error!(%err, "frame failed");
                            if !preview.simulation.is_alive() {
                                elwt.exit();
                            }
                        }
                    }
                    _ => {}
                }
            }
            Event::AboutToWait => match preview.simulation.next_deadline() {
                Some(deadline) if deadline <= Instant::now() => {
                    preview.window.request_redraw();
                    elwt.set_control_flow(ControlFlow::Wait);
                }
                Some(deadline) => elwt.set_control_flow(ControlFlow::WaitUntil(deadline)),
                None => elwt.set_control_flow(ControlFlow::Wait),
            },
            _ => {}
        })
        .map_err(|err| anyhow!("window event loop error: {err}"))
}
