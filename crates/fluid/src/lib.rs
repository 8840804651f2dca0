//! Real-time 2D stable-fluids engine.
//!
//! The simulation runs entirely as full-screen passes over floating-point
//! render targets:
//!
//! ```text
//!   pointers / remote inbox / queued splats
//!          │
//!          ▼
//!   Simulation::tick ──▶ splat::inject ──▶ solver::step ──▶ compositor::render
//!          │                                                      │
//!          └── TargetPool + KernelRegistry (via Backend) ◀────────┘
//! ```
//!
//! `Simulation` owns a [`backend::Backend`] and everything allocated through
//! it. The `gpu` backend drives wgpu and a window surface; the `software`
//! backend evaluates the same kernels on the CPU for headless runs and tests.

pub mod backend;
pub mod capabilities;
pub mod compositor;
pub mod dithering;
mod error;
pub mod kernels;
pub mod pointer;
pub mod remote;
pub mod simulation;
pub mod solver;
pub mod splat;
pub mod targets;
pub mod window;

pub use error::EngineError;
pub use fluidconfig::{Color, Config, ConfigChanges, ConfigError, ConfigPatch};
pub use kernels::KernelFailurePolicy;
pub use pointer::PointerSource;
pub use remote::{remote_channel, RemoteEvent, RemoteSender};
pub use simulation::{LifecycleState, Simulation, SimulationOptions};
pub use splat::Pattern;
pub use window::{run_preview, PreviewOptions};
