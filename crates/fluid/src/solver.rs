//! One stable-fluids timestep as a fixed sequence of full-screen passes.

use fluidconfig::Config;

use crate::backend::Backend;
use crate::error::EngineError;
use crate::kernels::{KernelKind, KernelRegistry, Sampler, Uniform};
use crate::capabilities::Capabilities;
use crate::targets::FluidTargets;

/// Advances velocity and dye by `dt` seconds.
///
/// Pass order: curl, vorticity confinement, divergence, pressure warm start,
/// `PRESSURE_ITERATIONS` Jacobi iterations, gradient subtraction, then
/// advection of velocity and of dye through the updated velocity.
pub fn step<B: Backend + ?Sized>(
    backend: &mut B,
    kernels: &KernelRegistry,
    targets: &mut FluidTargets,
    config: &Config,
    caps: &Capabilities,
    dt: f32,
) -> Result<(), EngineError> {
    let texel = targets.velocity.texel_size();

    kernels
        .program(KernelKind::Curl)?
        .pass()
        .set(Uniform::TexelSize, &texel)
        .bind(Sampler::Velocity, targets.velocity.read().texture())
        .draw(backend, targets.curl.target())?;

    kernels
        .program(KernelKind::Vorticity)?
        .pass()
        .set(Uniform::TexelSize, &texel)
        .set_f32(Uniform::Curl, config.curl)
        .set_f32(Uniform::Dt, dt)
        .bind(Sampler::Velocity, targets.velocity.read().texture())
        .bind(Sampler::Curl, targets.curl.texture())
        .draw(backend, targets.velocity.write().target())?;
    targets.velocity.swap();

    kernels
        .program(KernelKind::Divergence)?
        .pass()
        .set(Uniform::TexelSize, &texel)
        .bind(Sampler::Velocity, targets.velocity.read().texture())
        .draw(backend, targets.divergence.target())?;

    kernels
        .program(KernelKind::Clear)?
        .pass()
        .set_f32(Uniform::Value, config.pressure)
        .bind(Sampler::Texture, targets.pressure.read().texture())
        .draw(backend, targets.pressure.write().target())?;
    targets.pressure.swap();

    let pressure = kernels.program(KernelKind::Pressure)?;
    for _ in 0..config.pressure_iterations {
        pressure
            .pass()
            .set(Uniform::TexelSize, &texel)
            .bind(Sampler::Divergence, targets.divergence.texture())
            .bind(Sampler::Pressure, targets.pressure.read().texture())
            .draw(backend, targets.pressure.write().target())?;
        targets.pressure.swap();
    }

    kernels
        .program(KernelKind::GradientSubtract)?
        .pass()
        .set(Uniform::TexelSize, &texel)
        .bind(Sampler::Pressure, targets.pressure.read().texture())
        .bind(Sampler::Velocity, targets.velocity.read().texture())
        .draw(backend, targets.velocity.write().target())?;
    targets.velocity.swap();

    let advection = kernels.program(KernelKind::Advection)?;
    let mut velocity_pass = advection
        .pass()
        .set(Uniform::TexelSize, &texel)
        .set_f32(Uniform::Dt, dt)
        .set_f32(Uniform::Dissipation, config.velocity_dissipation)
        .bind(Sampler::Velocity, targets.velocity.read().texture())
        .bind(Sampler::Source, targets.velocity.read().texture());
    if !caps.linear_filtering {
        velocity_pass = velocity_pass.set(Uniform::DyeTexelSize, &texel);
    }
    velocity_pass.draw(backend, targets.velocity.write().target())?;
    targets.velocity.swap();

    let mut dye_pass = advection
        .pass()
        .set(Uniform::TexelSize, &texel)
        .set_f32(Uniform::Dt, dt)
        .set_f32(Uniform::Dissipation, config.density_dissipation)
        .bind(Sampler::Velocity, targets.velocity.read().texture())
        .bind(Sampler::Source, targets.dye.read().texture());
    if !caps.linear_filtering {
        dye_pass = dye_pass.set(Uniform::DyeTexelSize, &targets.dye.texel_size());
    }
    dye_pass.draw(backend, targets.dye.write().target())?;
    targets.dye.swap();

    Ok(())
}
