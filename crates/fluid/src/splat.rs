//! Gaussian velocity/dye injection, mirror symmetry, random splats and the
//! directional presets.

use std::fmt;
use std::str::FromStr;

use fluidconfig::{Color, Config};
use rand::Rng;

use crate::backend::Backend;
use crate::error::EngineError;
use crate::kernels::{KernelKind, KernelRegistry, Sampler, Uniform};
use crate::targets::FluidTargets;

/// Pattern and random splats boost their color by this factor.
const SPLAT_COLOR_BOOST: f32 = 10.0;
/// Colors are pre-scaled into this range for additive blending.
const COLOR_SCALE: f32 = 0.15;

/// One impulse in texture space: position, velocity, and dye color.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Splat {
    pub x: f32,
    pub y: f32,
    pub dx: f32,
    pub dy: f32,
    pub color: [f32; 3],
}

impl Splat {
    fn moved(&self, x: f32, y: f32, dx: f32, dy: f32) -> Self {
        Self {
            x,
            y,
            dx,
            dy,
            color: self.color,
        }
    }
}

/// The base splat plus every reflected or rotated copy the mirror settings
/// ask for. Positions rotate about the center; velocities rotate with them.
pub fn mirror_points(splat: &Splat, config: &Config) -> Vec<Splat> {
    let Splat { x, y, dx, dy, .. } = *splat;
    let mut points = vec![*splat];
    if !config.mirror_mode {
        return points;
    }
    match config.mirror_segments {
        0 | 1 => {}
        2 | 3 => points.push(splat.moved(1.0 - x, y, -dx, dy)),
        segments => {
            points.push(splat.moved(1.0 - y, x, -dy, dx));
            points.push(splat.moved(1.0 - x, 1.0 - y, -dx, -dy));
            points.push(splat.moved(y, 1.0 - x, dy, -dx));
            if segments >= 8 {
                points.push(splat.moved(y, x, dy, dx));
                points.push(splat.moved(1.0 - y, 1.0 - x, -dy, -dx));
            }
        }
    }
    points
}

/// Splat radius in texture space, stretched along x on wide surfaces.
pub fn corrected_radius(config: &Config, aspect: f32) -> f32 {
    let radius = config.splat_radius / 100.0;
    if aspect > 1.0 {
        radius * aspect
    } else {
        radius
    }
}

/// Injects `splat` and its mirror copies. Returns the number of injections.
pub fn inject<B: Backend + ?Sized>(
    backend: &mut B,
    kernels: &KernelRegistry,
    targets: &mut FluidTargets,
    config: &Config,
    aspect: f32,
    splat: &Splat,
) -> Result<usize, EngineError> {
    let points = mirror_points(splat, config);
    let radius = corrected_radius(config, aspect);
    let program = kernels.program(KernelKind::Splat)?;
    for point in &points {
        program
            .pass()
            .set(Uniform::AspectRatio, &[aspect])
            .set(Uniform::Point, &[point.x, point.y])
            .set(Uniform::Color, &[point.dx, point.dy, 0.0, 1.0])
            .set_f32(Uniform::Radius, radius)
            .bind(Sampler::Target, targets.velocity.read().texture())
            .draw(backend, targets.velocity.write().target())?;
        targets.velocity.swap();

        program
            .pass()
            .set(Uniform::AspectRatio, &[aspect])
            .set(Uniform::Point, &[point.x, point.y])
            .set(
                Uniform::Color,
                &[point.color[0], point.color[1], point.color[2], 1.0],
            )
            .set_f32(Uniform::Radius, radius)
            .bind(Sampler::Target, targets.dye.read().texture())
            .draw(backend, targets.dye.write().target())?;
        targets.dye.swap();
    }
    Ok(points.len())
}

/// A fully saturated random hue, or the configured splat color.
pub fn generate_color<R: Rng + ?Sized>(rng: &mut R, config: &Config) -> [f32; 3] {
    if config.rainbow_mode {
        hsv_to_rgb(rng.gen::<f32>(), 1.0, 1.0).map(|c| c * COLOR_SCALE)
    } else {
        scaled_color(&config.splat_color)
    }
}

/// A 0–255 color in the range splats inject.
pub fn scaled_color(color: &Color) -> [f32; 3] {
    color.normalized().map(|c| c * COLOR_SCALE)
}

fn boosted_color<R: Rng + ?Sized>(rng: &mut R, config: &Config) -> [f32; 3] {
    generate_color(rng, config).map(|c| c * SPLAT_COLOR_BOOST)
}

pub fn hsv_to_rgb(h: f32, s: f32, v: f32) -> [f32; 3] {
    let i = (h * 6.0).floor();
    let f = h * 6.0 - i;
    let p = v * (1.0 - s);
    let q = v * (1.0 - f * s);
    let t = v * (1.0 - (1.0 - f) * s);
    match (i as i32).rem_euclid(6) {
        0 => [v, t, p],
        1 => [q, v, p],
        2 => [p, v, t],
        3 => [p, q, v],
        4 => [t, p, v],
        _ => [v, p, q],
    }
}

/// `count` splats at random positions with `SPLAT_SPEED`-scaled velocities.
pub fn random_splats<R: Rng + ?Sized>(rng: &mut R, config: &Config, count: u32) -> Vec<Splat> {
    (0..count)
        .map(|_| {
            let color = boosted_color(rng, config);
            Splat {
                x: rng.gen(),
                y: rng.gen(),
                dx: config.splat_speed * (rng.gen::<f32>() - 0.5),
                dy: config.splat_speed * (rng.gen::<f32>() - 0.5),
                color,
            }
        })
        .collect()
}

#[derive(Debug, thiserror::Error)]
#[error("unknown pattern '{0}'; expected one of right, left, up, down, horizontal, vertical, corners")]
pub struct UnknownPattern(pub String);

/// Preset splat layouts. Directions are as seen on screen; texture-space y
/// grows downward, so "up" injects negative `dy`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Pattern {
    Right,
    Left,
    Up,
    Down,
    Horizontal,
    Vertical,
    Corners,
}

impl Pattern {
    pub const ALL: [Pattern; 7] = [
        Pattern::Right,
        Pattern::Left,
        Pattern::Up,
        Pattern::Down,
        Pattern::Horizontal,
        Pattern::Vertical,
        Pattern::Corners,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Pattern::Right => "right",
            Pattern::Left => "left",
            Pattern::Up => "up",
            Pattern::Down => "down",
            Pattern::Horizontal => "horizontal",
            Pattern::Vertical => "vertical",
            Pattern::Corners => "corners",
        }
    }

    pub fn splats<R: Rng + ?Sized>(self, rng: &mut R, config: &Config) -> Vec<Splat> {
        let speed = config.splat_speed;
        let count = config.splat_count.max(1);
        let spaced = |i: u32| (i + 1) as f32 / (count + 1) as f32;
        let mut splats = Vec::new();
        let mut line = |rng: &mut R, fixed: f32, vertical: bool, velocity: f32| {
            for i in 0..count {
                let color = boosted_color(rng, config);
                let along = spaced(i);
                splats.push(if vertical {
                    Splat {
                        x: along,
                        y: fixed,
                        dx: 0.0,
                        dy: velocity,
                        color,
                    }
                } else {
                    Splat {
                        x: fixed,
                        y: along,
                        dx: velocity,
                        dy: 0.0,
                        color,
                    }
                });
            }
        };
        match self {
            Pattern::Right => line(rng, 0.1, false, speed),
            Pattern::Left => line(rng, 0.9, false, -speed),
            Pattern::Up => line(rng, 0.9, true, -speed),
            Pattern::Down => line(rng, 0.1, true, speed),
            Pattern::Horizontal => {
                line(rng, 0.1, false, speed);
                line(rng, 0.9, false, -speed);
            }
            Pattern::Vertical => {
                line(rng, 0.9, true, -speed);
                line(rng, 0.1, true, speed);
            }
            Pattern::Corners => {
                let diagonal = speed * std::f32::consts::FRAC_1_SQRT_2;
                for (x, y) in [(0.1, 0.1), (0.9, 0.1), (0.1, 0.9), (0.9, 0.9)] {
                    let color = boosted_color(rng, config);
                    splats.push(Splat {
                        x,
                        y,
                        dx: if x < 0.5 { diagonal } else { -diagonal },
                        dy: if y < 0.5 { diagonal } else { -diagonal },
                        color,
                    });
                }
            }
        }
        splats
    }
}

impl FromStr for Pattern {
    type Err = UnknownPattern;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Pattern::ALL
            .into_iter()
            .find(|pattern| pattern.name() == wanted)
            .ok_or_else(|| UnknownPattern(s.to_string()))
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn base() -> Splat {
        Splat {
            x: 0.2,
            y: 0.3,
            dx: 5.0,
            dy: -2.0,
            color: [0.1, 0.2, 0.3],
        }
    }

    fn mirrored(segments: u32) -> Config {
        Config {
            mirror_mode: true,
            mirror_segments: segments,
            ..Config::default()
        }
    }

    #[test]
    fn mirror_off_or_single_segment_injects_once() {
        assert_eq!(mirror_points(&base(), &Config::default()).len(), 1);
        assert_eq!(mirror_points(&base(), &mirrored(1)).len(), 1);
    }

    #[test]
    fn two_segments_reflect_horizontally() {
        let points = mirror_points(&base(), &mirrored(2));
        assert_eq!(points.len(), 2);
        assert!((points[1].x - 0.8).abs() < 1e-6);
        assert_eq!(points[1].y, 0.3);
        assert_eq!((points[1].dx, points[1].dy), (-5.0, -2.0));
    }

    #[test]
    fn four_segments_are_quarter_turns_about_centre() {
        let points = mirror_points(&base(), &mirrored(4));
        assert_eq!(points.len(), 4);
        for pair in points.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            // (x, y) -> (1 - y, x) and (dx, dy) -> (-dy, dx)
            assert!((b.x - (1.0 - a.y)).abs() < 1e-6);
            assert!((b.y - a.x).abs() < 1e-6);
            assert!((b.dx + a.dy).abs() < 1e-6);
            assert!((b.dy - a.dx).abs() < 1e-6);
        }
        assert!(points.iter().all(|p| p.color == base().color));
    }

    #[test]
    fn eight_segments_add_diagonals() {
        let points = mirror_points(&base(), &mirrored(8));
        assert_eq!(points.len(), 6);
        assert_eq!((points[4].x, points[4].y), (0.3, 0.2));
        assert_eq!((points[4].dx, points[4].dy), (-2.0, 5.0));
    }

    #[test]
    fn radius_stretches_on_wide_surfaces() {
        let config = Config::default();
        assert!((corrected_radius(&config, 0.5) - 0.0025).abs() < 1e-7);
        assert!((corrected_radius(&config, 2.0) - 0.005).abs() < 1e-7);
    }

    #[test]
    fn fixed_color_is_scaled_config_color() {
        let config = Config {
            rainbow_mode: false,
            ..Config::default()
        };
        let mut rng = StdRng::seed_from_u64(1);
        let color = generate_color(&mut rng, &config);
        assert!((color[0] - 0.15).abs() < 1e-6);
        assert_eq!(color[1], 0.0);
    }

    #[test]
    fn rainbow_colors_are_saturated() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..20 {
            let color = generate_color(&mut rng, &Config::default());
            let max = color.iter().cloned().fold(0.0, f32::max);
            let min = color.iter().cloned().fold(1.0, f32::min);
            assert!((max - COLOR_SCALE).abs() < 1e-6);
            assert_eq!(min, 0.0);
        }
    }

    #[test]
    fn patterns_parse_and_use_splat_count() {
        let config = Config {
            splat_count: 3,
            ..Config::default()
        };
        let mut rng = StdRng::seed_from_u64(3);
        assert_eq!("Up".parse::<Pattern>().unwrap(), Pattern::Up);
        assert!("sideways".parse::<Pattern>().is_err());

        let up = Pattern::Up.splats(&mut rng, &config);
        assert_eq!(up.len(), 3);
        assert!(up.iter().all(|s| s.dy == -config.splat_speed && s.dx == 0.0));
        assert_eq!(Pattern::Horizontal.splats(&mut rng, &config).len(), 6);

        let corners = Pattern::Corners.splats(&mut rng, &config);
        assert_eq!(corners.len(), 4);
        for splat in corners {
            assert!((0.5 - splat.x) * splat.dx > 0.0);
            assert!((0.5 - splat.y) * splat.dy > 0.0);
        }
    }

    #[test]
    fn random_splats_are_deterministic_per_seed() {
        let config = Config::default();
        let a = random_splats(&mut StdRng::seed_from_u64(9), &config, 4);
        let b = random_splats(&mut StdRng::seed_from_u64(9), &config, 4);
        assert_eq!(a, b);
        assert!(a
            .iter()
            .all(|s| s.dx.abs() <= config.splat_speed / 2.0 && (0.0..1.0).contains(&s.x)));
    }
}
