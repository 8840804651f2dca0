//! CPU implementation of [`Backend`].
//!
//! Each kernel is evaluated per texel with the same arithmetic as its GLSL
//! counterpart, sampling with the texture's own filter and wrap modes. The
//! backend records every pass it executes and can be told to fail specific
//! kernels, formats or allocations.

use std::collections::{HashMap, HashSet};

use image::RgbaImage;

use super::{
    Backend, Blend, Compiled, Filter, FormatSupport, KernelSource, Pass, ProgramId,
    ResourceCounts, ShaderId, ShaderStage, Target, TextureDesc, TextureFormat, TextureId, Wrap,
    MAX_TEXTURE_UNITS,
};
use crate::error::EngineError;
use crate::kernels::{Keyword, KernelKind, KernelUniforms, KeywordSet, Uniform};

type Vec4 = [f32; 4];

const TRANSPARENT: Vec4 = [0.0, 0.0, 0.0, 0.0];

#[derive(Clone, Debug)]
pub struct SoftTexture {
    desc: TextureDesc,
    data: Vec<Vec4>,
}

impl SoftTexture {
    fn new(desc: TextureDesc) -> Self {
        let len = desc.width as usize * desc.height as usize;
        Self {
            desc,
            data: vec![TRANSPARENT; len],
        }
    }

    pub fn desc(&self) -> &TextureDesc {
        &self.desc
    }

    pub fn data(&self) -> &[Vec4] {
        &self.data
    }

    fn texel(&self, x: i64, y: i64) -> Vec4 {
        let w = self.desc.width as i64;
        let h = self.desc.height as i64;
        let (x, y) = match self.desc.wrap {
            Wrap::Clamp => (x.clamp(0, w - 1), y.clamp(0, h - 1)),
            Wrap::Repeat => (x.rem_euclid(w), y.rem_euclid(h)),
        };
        self.data[(y * w + x) as usize]
    }

    fn sample(&self, uv: [f32; 2]) -> Vec4 {
        let w = self.desc.width as f32;
        let h = self.desc.height as f32;
        match self.desc.filter {
            Filter::Nearest => {
                self.texel((uv[0] * w).floor() as i64, (uv[1] * h).floor() as i64)
            }
            Filter::Linear => {
                let sx = uv[0] * w - 0.5;
                let sy = uv[1] * h - 0.5;
                let x0 = sx.floor();
                let y0 = sy.floor();
                let fx = sx - x0;
                let fy = sy - y0;
                let (x0, y0) = (x0 as i64, y0 as i64);
                let a = self.texel(x0, y0);
                let b = self.texel(x0 + 1, y0);
                let c = self.texel(x0, y0 + 1);
                let d = self.texel(x0 + 1, y0 + 1);
                mix4(mix4(a, b, fx), mix4(c, d, fx), fy)
            }
        }
    }

    fn store(&mut self, index: usize, src: Vec4, blend: Blend) {
        let dst = self.data[index];
        let blended = match blend {
            Blend::Replace => src,
            Blend::Additive => add4(src, dst),
            Blend::PremultipliedOver => add4(src, scale4(dst, 1.0 - src[3])),
        };
        self.data[index] = encode(self.desc.format, blended);
    }
}

fn encode(format: TextureFormat, value: Vec4) -> Vec4 {
    match format {
        TextureFormat::Rgba16Float => value,
        TextureFormat::Rg16Float => [value[0], value[1], 0.0, 1.0],
        TextureFormat::R16Float => [value[0], 0.0, 0.0, 1.0],
        TextureFormat::Rgba8Unorm => value.map(|c| (c.clamp(0.0, 1.0) * 255.0).round() / 255.0),
    }
}

#[derive(Debug)]
struct SoftShader {
    kind: Option<KernelKind>,
    keywords: KeywordSet,
    broken: bool,
}

#[derive(Debug)]
struct SoftProgram {
    fragment: ShaderId,
    broken: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PassRecord {
    pub kernel: KernelKind,
    pub keywords: KeywordSet,
    pub target: Target,
    pub blend: Blend,
    pub skipped: bool,
}

#[derive(Debug)]
pub struct SoftwareBackend {
    surface: SoftTexture,
    textures: HashMap<TextureId, SoftTexture>,
    shaders: HashMap<ShaderId, SoftShader>,
    programs: HashMap<ProgramId, SoftProgram>,
    next_id: u64,
    linear_filtering: bool,
    unsupported: HashSet<TextureFormat>,
    failing_kernels: HashSet<KernelKind>,
    fail_next_allocation: bool,
    fail_next_present: bool,
    passes: Vec<PassRecord>,
    frames: u64,
}

impl SoftwareBackend {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            surface: SoftTexture::new(surface_desc(width, height)),
            textures: HashMap::new(),
            shaders: HashMap::new(),
            programs: HashMap::new(),
            next_id: 1,
            linear_filtering: true,
            unsupported: HashSet::new(),
            failing_kernels: HashSet::new(),
            fail_next_allocation: false,
            fail_next_present: false,
            passes: Vec::new(),
            frames: 0,
        }
    }

    /// Reports float formats as unfilterable, as on devices without
    /// half-float linear filtering.
    pub fn without_linear_filtering(mut self) -> Self {
        self.linear_filtering = false;
        self
    }

    pub fn without_format(mut self, format: TextureFormat) -> Self {
        self.unsupported.insert(format);
        self
    }

    /// Makes every later compile of `kind` report a diagnostic.
    pub fn fail_kernel(&mut self, kind: KernelKind) {
        self.failing_kernels.insert(kind);
    }

    pub fn fail_next_allocation(&mut self) {
        self.fail_next_allocation = true;
    }

    /// Makes the next `end_frame` report a lost surface.
    pub fn fail_next_present(&mut self) {
        self.fail_next_present = true;
    }

    pub fn texture(&self, id: TextureId) -> Option<&SoftTexture> {
        self.textures.get(&id)
    }

    pub fn surface(&self) -> &SoftTexture {
        &self.surface
    }

    pub fn passes(&self) -> &[PassRecord] {
        &self.passes
    }

    pub fn take_passes(&mut self) -> Vec<PassRecord> {
        std::mem::take(&mut self.passes)
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn allocate(&mut self, desc: &TextureDesc) -> Result<SoftTexture, EngineError> {
        let failed = std::mem::take(&mut self.fail_next_allocation);
        if failed || desc.width == 0 || desc.height == 0 || self.unsupported.contains(&desc.format)
        {
            return Err(EngineError::Allocation {
                width: desc.width,
                height: desc.height,
                format: desc.format,
                reason: if failed {
                    "allocation refused".into()
                } else {
                    "unsupported size or format".into()
                },
            });
        }
        Ok(SoftTexture::new(*desc))
    }
}

fn surface_desc(width: u32, height: u32) -> TextureDesc {
    TextureDesc {
        label: "surface",
        width: width.max(1),
        height: height.max(1),
        format: TextureFormat::Rgba8Unorm,
        filter: Filter::Nearest,
        wrap: Wrap::Clamp,
    }
}

impl Backend for SoftwareBackend {
    fn name(&self) -> &'static str {
        "software"
    }

    fn format_support(&self, format: TextureFormat) -> FormatSupport {
        if self.unsupported.contains(&format) {
            return FormatSupport::default();
        }
        let filterable = match format {
            TextureFormat::Rgba8Unorm => true,
            _ => self.linear_filtering,
        };
        FormatSupport {
            renderable: true,
            filterable,
        }
    }

    fn surface_size(&self) -> (u32, u32) {
        (self.surface.desc.width, self.surface.desc.height)
    }

    fn resize_surface(&mut self, width: u32, height: u32) {
        self.surface = SoftTexture::new(surface_desc(width, height));
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> Result<TextureId, EngineError> {
        let texture = self.allocate(desc)?;
        let id = TextureId(self.next_id());
        self.textures.insert(id, texture);
        Ok(id)
    }

    fn upload_rgba8(
        &mut self,
        desc: &TextureDesc,
        pixels: &[u8],
    ) -> Result<TextureId, EngineError> {
        let mut texture = self.allocate(desc)?;
        for (texel, chunk) in texture.data.iter_mut().zip(pixels.chunks_exact(4)) {
            *texel = [
                f32::from(chunk[0]) / 255.0,
                f32::from(chunk[1]) / 255.0,
                f32::from(chunk[2]) / 255.0,
                f32::from(chunk[3]) / 255.0,
            ];
        }
        let id = TextureId(self.next_id());
        self.textures.insert(id, texture);
        Ok(id)
    }

    fn destroy_texture(&mut self, id: TextureId) {
        if self.textures.remove(&id).is_none() {
            tracing::warn!(texture = %id, "destroying unknown texture");
        }
    }

    fn compile_kernel(
        &mut self,
        source: &KernelSource<'_>,
    ) -> Result<Compiled<ShaderId>, EngineError> {
        let broken = source.stage == ShaderStage::Fragment
            && source
                .kind
                .is_some_and(|kind| self.failing_kernels.contains(&kind));
        let id = ShaderId(self.next_id());
        self.shaders.insert(
            id,
            SoftShader {
                kind: source.kind,
                keywords: source.keywords,
                broken,
            },
        );
        if broken {
            Ok(Compiled::failed(
                id,
                format!("0:1: '{}' : kernel rejected by backend", source.label),
            ))
        } else {
            Ok(Compiled::ok(id))
        }
    }

    fn link_program(
        &mut self,
        label: &str,
        vertex: ShaderId,
        fragment: ShaderId,
    ) -> Result<Compiled<ProgramId>, EngineError> {
        let vertex_broken = self.shaders.get(&vertex).ok_or(vertex.unknown())?.broken;
        let fragment_broken = self.shaders.get(&fragment).ok_or(fragment.unknown())?.broken;
        let broken = vertex_broken || fragment_broken;
        let id = ProgramId(self.next_id());
        self.programs.insert(id, SoftProgram { fragment, broken });
        if broken {
            Ok(Compiled::failed(
                id,
                format!("program '{label}' has an attached shader that did not compile"),
            ))
        } else {
            Ok(Compiled::ok(id))
        }
    }

    fn destroy_shader(&mut self, id: ShaderId) {
        self.shaders.remove(&id);
    }

    fn destroy_program(&mut self, id: ProgramId) {
        self.programs.remove(&id);
    }

    fn draw(&mut self, pass: &Pass<'_>) -> Result<(), EngineError> {
        pass.check_feedback()?;
        let program = self.programs.get(&pass.program).ok_or(pass.program.unknown())?;
        let shader = self
            .shaders
            .get(&program.fragment)
            .ok_or(program.fragment.unknown())?;
        let kind = shader
            .kind
            .ok_or_else(|| EngineError::MissingKernel(pass.label.to_string()))?;
        let keywords = shader.keywords;

        if program.broken {
            tracing::warn!(pass = pass.label, "skipping draw with broken program");
            self.passes.push(PassRecord {
                kernel: kind,
                keywords,
                target: pass.target,
                blend: pass.blend,
                skipped: true,
            });
            return Ok(());
        }

        let mut target = match pass.target {
            Target::Texture(id) => self.textures.remove(&id).ok_or(id.unknown())?,
            Target::Surface => {
                let desc = self.surface.desc;
                std::mem::replace(&mut self.surface, SoftTexture::new(desc))
            }
        };

        let mut inputs: [Option<&SoftTexture>; MAX_TEXTURE_UNITS] = [None; MAX_TEXTURE_UNITS];
        for (slot, input) in inputs.iter_mut().zip(pass.inputs.iter()) {
            if let Some(id) = input {
                *slot = Some(self.textures.get(id).ok_or(id.unknown())?);
            }
        }

        let shader = Shader {
            kind,
            keywords,
            uniforms: pass.uniforms,
            inputs,
        };
        let width = target.desc.width as usize;
        let height = target.desc.height as usize;
        for y in 0..height {
            for x in 0..width {
                let uv = [
                    (x as f32 + 0.5) / width as f32,
                    (y as f32 + 0.5) / height as f32,
                ];
                let color = shader.shade(uv);
                target.store(y * width + x, color, pass.blend);
            }
        }

        match pass.target {
            Target::Texture(id) => {
                self.textures.insert(id, target);
            }
            Target::Surface => self.surface = target,
        }
        self.passes.push(PassRecord {
            kernel: kind,
            keywords,
            target: pass.target,
            blend: pass.blend,
            skipped: false,
        });
        Ok(())
    }

    fn read_pixels(&mut self, id: TextureId) -> Result<RgbaImage, EngineError> {
        let texture = self.textures.get(&id).ok_or(id.unknown())?;
        if texture.desc.format != TextureFormat::Rgba8Unorm {
            return Err(EngineError::Readback(format!(
                "{id} has format {:?}; only Rgba8Unorm can be read back",
                texture.desc.format
            )));
        }
        let bytes: Vec<u8> = texture
            .data
            .iter()
            .flat_map(|texel| texel.map(|c| (c.clamp(0.0, 1.0) * 255.0).round() as u8))
            .collect();
        RgbaImage::from_raw(texture.desc.width, texture.desc.height, bytes)
            .ok_or_else(|| EngineError::Readback(format!("{id} has an inconsistent size")))
    }

    fn end_frame(&mut self) -> Result<(), EngineError> {
        if std::mem::take(&mut self.fail_next_present) {
            return Err(EngineError::Surface("surface lost".into()));
        }
        self.frames += 1;
        Ok(())
    }

    fn live_resources(&self) -> ResourceCounts {
        ResourceCounts {
            textures: self.textures.len(),
            shaders: self.shaders.len(),
            programs: self.programs.len(),
        }
    }
}

/// One kernel invocation bound to its inputs.
struct Shader<'a> {
    kind: KernelKind,
    keywords: KeywordSet,
    uniforms: &'a KernelUniforms,
    inputs: [Option<&'a SoftTexture>; MAX_TEXTURE_UNITS],
}

impl Shader<'_> {
    fn tex(&self, unit: usize, uv: [f32; 2]) -> Vec4 {
        self.inputs[unit].map_or(TRANSPARENT, |texture| texture.sample(uv))
    }

    fn u(&self, uniform: Uniform) -> f32 {
        self.uniforms.scalar(uniform)
    }

    fn neighbours(&self, uv: [f32; 2]) -> [[f32; 2]; 4] {
        let [tx, ty] = self.uniforms.vec2(Uniform::TexelSize);
        [
            [uv[0] - tx, uv[1]],
            [uv[0] + tx, uv[1]],
            [uv[0], uv[1] + ty],
            [uv[0], uv[1] - ty],
        ]
    }

    fn shade(&self, uv: [f32; 2]) -> Vec4 {
        match self.kind {
            KernelKind::Copy => self.tex(0, uv),
            KernelKind::Clear => scale4(self.tex(0, uv), self.u(Uniform::Value)),
            KernelKind::Color => self.uniforms.vec4(Uniform::Color),
            KernelKind::Checkerboard => {
                let aspect = self.u(Uniform::AspectRatio);
                let cx = (uv[0] * 25.0 * aspect).floor();
                let cy = (uv[1] * 25.0).floor();
                let v = (cx + cy).rem_euclid(2.0) * 0.1 + 0.8;
                [v, v, v, 1.0]
            }
            KernelKind::Display => self.display(uv),
            KernelKind::BloomPrefilter => {
                let c = self.tex(0, uv);
                let curve = self.uniforms.vec4(Uniform::Curve);
                let br = c[0].max(c[1]).max(c[2]);
                let rq = (br - curve[0]).clamp(0.0, curve[1]);
                let rq = curve[2] * rq * rq;
                let k = rq.max(br - self.u(Uniform::Threshold)) / br.max(0.0001);
                [c[0] * k, c[1] * k, c[2] * k, 0.0]
            }
            KernelKind::BloomBlur => self.four_tap(uv),
            KernelKind::BloomFinal => scale4(self.four_tap(uv), self.u(Uniform::Intensity)),
            KernelKind::SunraysMask => {
                let mut c = self.tex(0, uv);
                let br = c[0].max(c[1]).max(c[2]);
                c[3] = 1.0 - (br * 20.0).max(0.0).min(0.8);
                c
            }
            KernelKind::Sunrays => self.sunrays(uv),
            KernelKind::Blur => {
                let [ox, oy] = self.uniforms.vec2(Uniform::TexelSize).map(|t| t * 1.333_333_3);
                let mut sum = scale4(self.tex(0, uv), 0.294_117_64);
                sum = add4(
                    sum,
                    scale4(self.tex(0, [uv[0] - ox, uv[1] - oy]), 0.352_941_17),
                );
                add4(
                    sum,
                    scale4(self.tex(0, [uv[0] + ox, uv[1] + oy]), 0.352_941_17),
                )
            }
            KernelKind::Splat => {
                let [px, py] = self.uniforms.vec2(Uniform::Point);
                let mut p = [uv[0] - px, uv[1] - py];
                p[0] *= self.u(Uniform::AspectRatio);
                let falloff = (-(p[0] * p[0] + p[1] * p[1]) / self.u(Uniform::Radius)).exp();
                let color = self.uniforms.vec4(Uniform::Color);
                let base = self.tex(0, uv);
                [
                    base[0] + falloff * color[0],
                    base[1] + falloff * color[1],
                    base[2] + falloff * color[2],
                    1.0,
                ]
            }
            KernelKind::Advection => self.advect(uv),
            KernelKind::Divergence => {
                let [l, r, t, b] = self.neighbours(uv);
                let c = self.tex(0, uv);
                let mut vl = self.tex(0, l)[0];
                let mut vr = self.tex(0, r)[0];
                let mut vt = self.tex(0, t)[1];
                let mut vb = self.tex(0, b)[1];
                if l[0] < 0.0 {
                    vl = -c[0];
                }
                if r[0] > 1.0 {
                    vr = -c[0];
                }
                if t[1] > 1.0 {
                    vt = -c[1];
                }
                if b[1] < 0.0 {
                    vb = -c[1];
                }
                [0.5 * (vr - vl + vt - vb), 0.0, 0.0, 1.0]
            }
            KernelKind::Curl => {
                let [l, r, t, b] = self.neighbours(uv);
                let vorticity =
                    self.tex(0, r)[1] - self.tex(0, l)[1] - self.tex(0, t)[0] + self.tex(0, b)[0];
                [0.5 * vorticity, 0.0, 0.0, 1.0]
            }
            KernelKind::Vorticity => {
                let [l, r, t, b] = self.neighbours(uv);
                let cl = self.tex(1, l)[0];
                let cr = self.tex(1, r)[0];
                let ct = self.tex(1, t)[0];
                let cb = self.tex(1, b)[0];
                let c = self.tex(1, uv)[0];
                let mut force = [0.5 * (ct.abs() - cb.abs()), 0.5 * (cr.abs() - cl.abs())];
                let len = (force[0] * force[0] + force[1] * force[1]).sqrt() + 0.0001;
                let k = self.u(Uniform::Curl) * c / len;
                force = [force[0] * k, -force[1] * k];
                let v = self.tex(0, uv);
                let step = self.u(Uniform::Dt);
                [
                    (v[0] + force[0] * step).clamp(-1000.0, 1000.0),
                    (v[1] + force[1] * step).clamp(-1000.0, 1000.0),
                    0.0,
                    1.0,
                ]
            }
            KernelKind::Pressure => {
                let [l, r, t, b] = self.neighbours(uv);
                let sum = self.tex(0, l)[0] + self.tex(0, r)[0] + self.tex(0, b)[0] + self.tex(0, t)[0];
                let divergence = self.tex(1, uv)[0];
                [(sum - divergence) * 0.25, 0.0, 0.0, 1.0]
            }
            KernelKind::GradientSubtract => {
                let [l, r, t, b] = self.neighbours(uv);
                let pl = self.tex(0, l)[0];
                let pr = self.tex(0, r)[0];
                let pt = self.tex(0, t)[0];
                let pb = self.tex(0, b)[0];
                let v = self.tex(1, uv);
                [v[0] - (pr - pl), v[1] - (pt - pb), 0.0, 1.0]
            }
        }
    }

    fn four_tap(&self, uv: [f32; 2]) -> Vec4 {
        let sum = self
            .neighbours(uv)
            .iter()
            .fold(TRANSPARENT, |acc, coord| add4(acc, self.tex(0, *coord)));
        scale4(sum, 0.25)
    }

    fn sunrays(&self, uv: [f32; 2]) -> Vec4 {
        const ITERATIONS: usize = 16;
        const DENSITY: f32 = 0.3;
        const DECAY: f32 = 0.95;
        const EXPOSURE: f32 = 0.7;

        let weight = self.u(Uniform::Weight);
        let step = 1.0 / ITERATIONS as f32 * DENSITY;
        let dir = [(uv[0] - 0.5) * step, (uv[1] - 0.5) * step];
        let mut coord = uv;
        let mut decay = 1.0;
        let mut acc = self.tex(0, uv)[3];
        for _ in 0..ITERATIONS {
            coord = [coord[0] - dir[0], coord[1] - dir[1]];
            acc += self.tex(0, coord)[3] * decay * weight;
            decay *= DECAY;
        }
        [acc * EXPOSURE, 0.0, 0.0, 1.0]
    }

    fn bilerp(&self, unit: usize, uv: [f32; 2], tsize: [f32; 2]) -> Vec4 {
        let st = [uv[0] / tsize[0] - 0.5, uv[1] / tsize[1] - 0.5];
        let iuv = [st[0].floor(), st[1].floor()];
        let fuv = [st[0] - iuv[0], st[1] - iuv[1]];
        let at = |ox: f32, oy: f32| self.tex(unit, [(iuv[0] + ox) * tsize[0], (iuv[1] + oy) * tsize[1]]);
        let a = at(0.5, 0.5);
        let b = at(1.5, 0.5);
        let c = at(0.5, 1.5);
        let d = at(1.5, 1.5);
        mix4(mix4(a, b, fuv[0]), mix4(c, d, fuv[0]), fuv[1])
    }

    fn advect(&self, uv: [f32; 2]) -> Vec4 {
        let texel = self.uniforms.vec2(Uniform::TexelSize);
        let step = self.u(Uniform::Dt);
        let result = if self.keywords.contains(Keyword::ManualFiltering) {
            let v = self.bilerp(0, uv, texel);
            let coord = [uv[0] - step * v[0] * texel[0], uv[1] - step * v[1] * texel[1]];
            self.bilerp(1, coord, self.uniforms.vec2(Uniform::DyeTexelSize))
        } else {
            let v = self.tex(0, uv);
            let coord = [uv[0] - step * v[0] * texel[0], uv[1] - step * v[1] * texel[1]];
            self.tex(1, coord)
        };
        let decay = 1.0 + self.u(Uniform::Dissipation) * step;
        scale4(result, 1.0 / decay)
    }

    fn display(&self, uv: [f32; 2]) -> Vec4 {
        let base = self.tex(0, uv);
        let mut c = [base[0], base[1], base[2]];

        if self.keywords.contains(Keyword::Shading) {
            let [l, r, t, b] = self.neighbours(uv);
            let len3 = |v: Vec4| (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt();
            let dx = len3(self.tex(0, r)) - len3(self.tex(0, l));
            let dy = len3(self.tex(0, t)) - len3(self.tex(0, b));
            let [tx, ty] = self.uniforms.vec2(Uniform::TexelSize);
            let dz = (tx * tx + ty * ty).sqrt();
            let n_len = (dx * dx + dy * dy + dz * dz).sqrt();
            let nz = if n_len > 0.0 { dz / n_len } else { 0.0 };
            let diffuse = (nz + 0.7).clamp(0.7, 1.0);
            c = c.map(|v| v * diffuse);
        }

        let bloom_enabled = self.keywords.contains(Keyword::Bloom);
        let mut bloom = if bloom_enabled {
            let b = self.tex(1, uv);
            [b[0], b[1], b[2]]
        } else {
            [0.0; 3]
        };

        if self.keywords.contains(Keyword::Sunrays) {
            let sunrays = self.tex(2, uv)[0];
            c = c.map(|v| v * sunrays);
            if bloom_enabled {
                bloom = bloom.map(|v| v * sunrays);
            }
        }

        if bloom_enabled {
            let [sx, sy] = self.uniforms.vec2(Uniform::DitherScale);
            let noise = self.tex(3, [uv[0] * sx, uv[1] * sy])[0] * 2.0 - 1.0;
            for (channel, glow) in c.iter_mut().zip(bloom) {
                let glow = (glow + noise / 255.0).max(0.0);
                *channel += (1.055 * glow.powf(0.416_666_67) - 0.055).max(0.0);
            }
        }

        let a = c[0].max(c[1]).max(c[2]);
        [c[0], c[1], c[2], a]
    }
}

fn add4(a: Vec4, b: Vec4) -> Vec4 {
    [a[0] + b[0], a[1] + b[1], a[2] + b[2], a[3] + b[3]]
}

fn scale4(a: Vec4, k: f32) -> Vec4 {
    a.map(|c| c * k)
}

fn mix4(a: Vec4, b: Vec4, t: f32) -> Vec4 {
    [
        a[0] + (b[0] - a[0]) * t,
        a[1] + (b[1] - a[1]) * t,
        a[2] + (b[2] - a[2]) * t,
        a[3] + (b[3] - a[3]) * t,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::{KernelFailurePolicy, KernelRegistry};

    fn desc(width: u32, height: u32, format: TextureFormat, filter: Filter) -> TextureDesc {
        TextureDesc {
            label: "test",
            width,
            height,
            format,
            filter,
            wrap: Wrap::Clamp,
        }
    }

    #[test]
    fn linear_sampling_interpolates_between_texel_centres() {
        let mut texture = SoftTexture::new(desc(2, 1, TextureFormat::Rgba16Float, Filter::Linear));
        texture.data = vec![[0.0; 4], [1.0; 4]];
        let mid = texture.sample([0.5, 0.5]);
        assert!((mid[0] - 0.5).abs() < 1e-6);
        assert_eq!(texture.sample([0.0, 0.5])[0], 0.0);
        assert_eq!(texture.sample([1.0, 0.5])[0], 1.0);
    }

    #[test]
    fn repeat_wrap_tiles_texture() {
        let mut texture = SoftTexture::new(TextureDesc {
            wrap: Wrap::Repeat,
            ..desc(2, 1, TextureFormat::Rgba8Unorm, Filter::Nearest)
        });
        texture.data = vec![[0.0; 4], [1.0; 4]];
        assert_eq!(texture.sample([1.25, 0.5])[0], 0.0);
        assert_eq!(texture.sample([1.75, 0.5])[0], 1.0);
    }

    #[test]
    fn narrow_formats_mask_unused_channels() {
        assert_eq!(
            encode(TextureFormat::R16Float, [3.0, 4.0, 5.0, 6.0]),
            [3.0, 0.0, 0.0, 1.0]
        );
        assert_eq!(
            encode(TextureFormat::Rg16Float, [3.0, 4.0, 5.0, 6.0]),
            [3.0, 4.0, 0.0, 1.0]
        );
        assert_eq!(
            encode(TextureFormat::Rgba8Unorm, [2.0, -1.0, 0.5, 1.0]),
            [1.0, 0.0, 128.0 / 255.0, 1.0]
        );
    }

    #[test]
    fn draw_rejects_feedback_loops() {
        let mut backend = SoftwareBackend::new(8, 8);
        let mut registry =
            KernelRegistry::new(&mut backend, KernelFailurePolicy::FailFast, KeywordSet::EMPTY)
                .unwrap();
        let texture = backend
            .create_texture(&desc(4, 4, TextureFormat::Rgba16Float, Filter::Linear))
            .unwrap();
        let uniforms = KernelUniforms::default();
        let pass = Pass {
            label: "copy",
            program: registry.program(KernelKind::Copy).unwrap().id(),
            target: Target::Texture(texture),
            inputs: [Some(texture), None, None, None],
            uniforms: &uniforms,
            blend: Blend::Replace,
        };
        assert!(matches!(
            backend.draw(&pass),
            Err(EngineError::FeedbackLoop(_))
        ));
        registry.release(&mut backend);
    }

    #[test]
    fn color_pass_fills_target_and_is_logged() {
        let mut backend = SoftwareBackend::new(8, 8);
        let mut registry =
            KernelRegistry::new(&mut backend, KernelFailurePolicy::FailFast, KeywordSet::EMPTY)
                .unwrap();
        let texture = backend
            .create_texture(&desc(3, 2, TextureFormat::Rgba8Unorm, Filter::Nearest))
            .unwrap();
        registry
            .program(KernelKind::Color)
            .unwrap()
            .pass()
            .set(Uniform::Color, &[1.0, 0.0, 0.0, 1.0])
            .draw(&mut backend, Target::Texture(texture))
            .unwrap();

        let image = backend.read_pixels(texture).unwrap();
        assert_eq!(image.dimensions(), (3, 2));
        assert!(image.pixels().all(|p| p.0 == [255, 0, 0, 255]));
        assert_eq!(backend.passes().len(), 1);
        assert_eq!(backend.passes()[0].kernel, KernelKind::Color);
        registry.release(&mut backend);
    }

    #[test]
    fn refused_allocation_reports_error() {
        let mut backend = SoftwareBackend::new(8, 8);
        backend.fail_next_allocation();
        let err = backend
            .create_texture(&desc(4, 4, TextureFormat::Rgba16Float, Filter::Linear))
            .unwrap_err();
        assert!(matches!(err, EngineError::Allocation { .. }));
        backend
            .create_texture(&desc(4, 4, TextureFormat::Rgba16Float, Filter::Linear))
            .unwrap();
    }
}
