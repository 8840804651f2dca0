//! wgpu implementation of [`Backend`]. Kernels are compiled from GLSL through
//! naga; passes recorded during a frame share one command encoder that is
//! submitted in [`Backend::end_frame`] or before a read-back. Textures released
//! while that encoder is open are destroyed only after it is submitted.

mod context;
mod pipeline;

use std::collections::HashMap;

use image::RgbaImage;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use wgpu::util::DeviceExt;

use self::context::{GpuContext, Output};
use self::pipeline::{PipelineLayouts, Samplers};
use super::{
    Backend, Blend, Compiled, Filter, FormatSupport, KernelSource, Pass, ProgramId,
    ResourceCounts, ShaderId, Target, TextureDesc, TextureFormat, TextureId, Wrap,
    MAX_TEXTURE_UNITS,
};
use crate::error::EngineError;
use crate::kernels::KernelUniforms;

struct GpuTexture {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    desc: TextureDesc,
}

struct ShaderRecord {
    module: wgpu::ShaderModule,
    broken: bool,
}

struct ProgramRecord {
    label: String,
    vertex: wgpu::ShaderModule,
    fragment: wgpu::ShaderModule,
    broken: bool,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
struct PipelineKey {
    program: ProgramId,
    format: wgpu::TextureFormat,
    blend: Blend,
}

struct SurfaceFrame {
    frame: wgpu::SurfaceTexture,
    view: wgpu::TextureView,
}

pub struct GpuBackend {
    context: GpuContext,
    layouts: PipelineLayouts,
    samplers: Samplers,
    uniform_buffer: wgpu::Buffer,
    uniform_bind_group: wgpu::BindGroup,
    placeholder: wgpu::TextureView,
    textures: HashMap<TextureId, GpuTexture>,
    shaders: HashMap<ShaderId, ShaderRecord>,
    programs: HashMap<ProgramId, ProgramRecord>,
    pipelines: HashMap<PipelineKey, wgpu::RenderPipeline>,
    encoder: Option<wgpu::CommandEncoder>,
    /// Released textures still referenced by the open encoder.
    retired: Vec<wgpu::Texture>,
    surface_frame: Option<SurfaceFrame>,
    surface_drawn: bool,
    next_id: u64,
}

fn wgpu_format(format: TextureFormat) -> wgpu::TextureFormat {
    match format {
        TextureFormat::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
        TextureFormat::Rg16Float => wgpu::TextureFormat::Rg16Float,
        TextureFormat::R16Float => wgpu::TextureFormat::R16Float,
        TextureFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
    }
}

fn init_error(err: anyhow::Error) -> EngineError {
    EngineError::Init(format!("{err:#}"))
}

impl GpuBackend {
    pub fn with_window<T>(target: &T, width: u32, height: u32) -> Result<Self, EngineError>
    where
        T: HasDisplayHandle + HasWindowHandle,
    {
        let context = GpuContext::with_surface(target, width, height).map_err(init_error)?;
        Ok(Self::from_context(context))
    }

    pub fn headless(width: u32, height: u32) -> Result<Self, EngineError> {
        let context = GpuContext::headless(width, height).map_err(init_error)?;
        Ok(Self::from_context(context))
    }

    fn from_context(context: GpuContext) -> Self {
        let device = &context.device;
        let layouts = PipelineLayouts::new(device);
        let samplers = Samplers::new(device);

        let uniform_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("kernel uniforms"),
            size: std::mem::size_of::<KernelUniforms>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let uniform_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("kernel uniform bind group"),
            layout: &layouts.uniform_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: uniform_buffer.as_entire_binding(),
            }],
        });

        let placeholder = device
            .create_texture_with_data(
                &context.queue,
                &wgpu::TextureDescriptor {
                    label: Some("unbound texture unit"),
                    size: wgpu::Extent3d {
                        width: 1,
                        height: 1,
                        depth_or_array_layers: 1,
                    },
                    mip_level_count: 1,
                    sample_count: 1,
                    dimension: wgpu::TextureDimension::D2,
                    format: wgpu::TextureFormat::Rgba8Unorm,
                    usage: wgpu::TextureUsages::TEXTURE_BINDING,
                    view_formats: &[],
                },
                wgpu::util::TextureDataOrder::LayerMajor,
                &[0, 0, 0, 0],
            )
            .create_view(&wgpu::TextureViewDescriptor::default());

        Self {
            context,
            layouts,
            samplers,
            uniform_buffer,
            uniform_bind_group,
            placeholder,
            textures: HashMap::new(),
            shaders: HashMap::new(),
            programs: HashMap::new(),
            pipelines: HashMap::new(),
            encoder: None,
            retired: Vec::new(),
            surface_frame: None,
            surface_drawn: false,
            next_id: 1,
        }
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Runs `f` inside a validation error scope and returns its result along
    /// with any captured error.
    fn scoped<T>(&self, f: impl FnOnce(&wgpu::Device) -> T) -> (T, Option<wgpu::Error>) {
        self.context
            .device
            .push_error_scope(wgpu::ErrorFilter::Validation);
        let value = f(&self.context.device);
        let error = pollster::block_on(self.context.device.pop_error_scope());
        (value, error)
    }

    fn pipeline(&mut self, key: PipelineKey) -> Result<&wgpu::RenderPipeline, EngineError> {
        if !self.pipelines.contains_key(&key) {
            let program = self.programs.get(&key.program).ok_or(key.program.unknown())?;
            let pipeline = pipeline::create_pipeline(
                &self.context.device,
                &self.layouts,
                &program.label,
                &program.vertex,
                &program.fragment,
                key.format,
                key.blend,
            );
            tracing::debug!(program = %key.program, format = ?key.format, blend = ?key.blend, "created pipeline");
            self.pipelines.insert(key, pipeline);
        }
        self.pipelines
            .get(&key)
            .ok_or_else(|| EngineError::MissingKernel(key.program.to_string()))
    }

    fn acquire_surface(&mut self) -> Result<(), EngineError> {
        if self.surface_frame.is_some() {
            return Ok(());
        }
        let Output::Window { surface, config } = &self.context.output else {
            return Ok(());
        };
        let frame = match surface.get_current_texture() {
            Ok(frame) => frame,
            Err(wgpu::SurfaceError::Outdated | wgpu::SurfaceError::Lost) => {
                tracing::warn!("surface outdated; reconfiguring");
                surface.configure(&self.context.device, config);
                surface
                    .get_current_texture()
                    .map_err(|err| EngineError::Surface(err.to_string()))?
            }
            Err(err) => return Err(EngineError::Surface(err.to_string())),
        };
        let view = frame
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());
        self.surface_frame = Some(SurfaceFrame { frame, view });
        Ok(())
    }

    fn flush(&mut self) {
        if let Some(encoder) = self.encoder.take() {
            self.context.queue.submit(Some(encoder.finish()));
        }
        for texture in self.retired.drain(..) {
            texture.destroy();
        }
    }
}

impl Backend for GpuBackend {
    fn name(&self) -> &'static str {
        "wgpu"
    }

    fn format_support(&self, format: TextureFormat) -> FormatSupport {
        let features = self.context.format_features(wgpu_format(format));
        FormatSupport {
            renderable: features
                .allowed_usages
                .contains(wgpu::TextureUsages::RENDER_ATTACHMENT),
            filterable: features
                .flags
                .contains(wgpu::TextureFormatFeatureFlags::FILTERABLE),
        }
    }

    fn surface_size(&self) -> (u32, u32) {
        self.context.size()
    }

    fn resize_surface(&mut self, width: u32, height: u32) {
        self.surface_frame = None;
        self.context.resize(width, height);
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> Result<TextureId, EngineError> {
        let max = self.context.max_dimension;
        if desc.width == 0 || desc.height == 0 || desc.width > max || desc.height > max {
            return Err(EngineError::Allocation {
                width: desc.width,
                height: desc.height,
                format: desc.format,
                reason: format!("dimensions must be within 1..={max}"),
            });
        }
        let (texture, error) = self.scoped(|device| {
            device.create_texture(&wgpu::TextureDescriptor {
                label: Some(desc.label),
                size: wgpu::Extent3d {
                    width: desc.width,
                    height: desc.height,
                    depth_or_array_layers: 1,
                },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: wgpu_format(desc.format),
                usage: wgpu::TextureUsages::TEXTURE_BINDING
                    | wgpu::TextureUsages::RENDER_ATTACHMENT
                    | wgpu::TextureUsages::COPY_SRC
                    | wgpu::TextureUsages::COPY_DST,
                view_formats: &[],
            })
        });
        if let Some(err) = error {
            return Err(EngineError::Allocation {
                width: desc.width,
                height: desc.height,
                format: desc.format,
                reason: err.to_string(),
            });
        }
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let id = TextureId(self.next_id());
        self.textures.insert(
            id,
            GpuTexture {
                texture,
                view,
                desc: *desc,
            },
        );
        Ok(id)
    }

    fn upload_rgba8(
        &mut self,
        desc: &TextureDesc,
        pixels: &[u8],
    ) -> Result<TextureId, EngineError> {
        let id = self.create_texture(&TextureDesc {
            format: TextureFormat::Rgba8Unorm,
            ..*desc
        })?;
        let texture = self.textures.get(&id).ok_or(id.unknown())?;
        self.context.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &texture.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            pixels,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(desc.width * 4),
                rows_per_image: Some(desc.height),
            },
            wgpu::Extent3d {
                width: desc.width,
                height: desc.height,
                depth_or_array_layers: 1,
            },
        );
        Ok(id)
    }

    fn destroy_texture(&mut self, id: TextureId) {
        match self.textures.remove(&id) {
            Some(texture) if self.encoder.is_some() => self.retired.push(texture.texture),
            Some(texture) => texture.texture.destroy(),
            None => tracing::warn!(texture = %id, "destroying unknown texture"),
        }
    }

    fn compile_kernel(
        &mut self,
        source: &KernelSource<'_>,
    ) -> Result<Compiled<ShaderId>, EngineError> {
        let (module, error) = self.scoped(|device| {
            pipeline::create_shader_module(device, source.label, source.stage, source.text)
        });
        let id = ShaderId(self.next_id());
        self.shaders.insert(
            id,
            ShaderRecord {
                module,
                broken: error.is_some(),
            },
        );
        Ok(match error {
            Some(err) => Compiled::failed(id, err.to_string()),
            None => Compiled::ok(id),
        })
    }

    fn link_program(
        &mut self,
        label: &str,
        vertex: ShaderId,
        fragment: ShaderId,
    ) -> Result<Compiled<ProgramId>, EngineError> {
        let vertex_record = self.shaders.get(&vertex).ok_or(vertex.unknown())?;
        let fragment_record = self.shaders.get(&fragment).ok_or(fragment.unknown())?;
        let record = ProgramRecord {
            label: label.to_owned(),
            vertex: vertex_record.module.clone(),
            fragment: fragment_record.module.clone(),
            broken: vertex_record.broken || fragment_record.broken,
        };

        let id = ProgramId(self.next_id());
        let diagnostic = if record.broken {
            Some(format!("program '{label}' has an attached shader that did not compile"))
        } else {
            // Linking is validated by building the pipeline for the common
            // simulation target.
            let (pipeline, error) = self.scoped(|device| {
                pipeline::create_pipeline(
                    device,
                    &self.layouts,
                    label,
                    &record.vertex,
                    &record.fragment,
                    wgpu::TextureFormat::Rgba16Float,
                    Blend::Replace,
                )
            });
            match error {
                Some(err) => Some(err.to_string()),
                None => {
                    self.pipelines.insert(
                        PipelineKey {
                            program: id,
                            format: wgpu::TextureFormat::Rgba16Float,
                            blend: Blend::Replace,
                        },
                        pipeline,
                    );
                    None
                }
            }
        };

        self.programs.insert(
            id,
            ProgramRecord {
                broken: diagnostic.is_some(),
                ..record
            },
        );
        Ok(match diagnostic {
            Some(log) => Compiled::failed(id, log),
            None => Compiled::ok(id),
        })
    }

    fn destroy_shader(&mut self, id: ShaderId) {
        self.shaders.remove(&id);
    }

    fn destroy_program(&mut self, id: ProgramId) {
        self.programs.remove(&id);
        self.pipelines.retain(|key, _| key.program != id);
    }

    fn draw(&mut self, pass: &Pass<'_>) -> Result<(), EngineError> {
        pass.check_feedback()?;
        let program = self.programs.get(&pass.program).ok_or(pass.program.unknown())?;
        if program.broken {
            tracing::warn!(pass = pass.label, "skipping draw with broken program");
            return Ok(());
        }

        let format = match pass.target {
            Target::Texture(id) => {
                wgpu_format(self.textures.get(&id).ok_or(id.unknown())?.desc.format)
            }
            Target::Surface => {
                self.acquire_surface()?;
                self.context.surface_format()
            }
        };
        let key = PipelineKey {
            program: pass.program,
            format,
            blend: pass.blend,
        };
        self.pipeline(key)?;

        let mut entries = Vec::with_capacity(MAX_TEXTURE_UNITS * 2);
        for (unit, input) in pass.inputs.iter().enumerate() {
            let (view, sampler) = match input {
                Some(id) => {
                    let texture = self.textures.get(id).ok_or(id.unknown())?;
                    (
                        &texture.view,
                        self.samplers.get(texture.desc.filter, texture.desc.wrap),
                    )
                }
                None => (
                    &self.placeholder,
                    self.samplers.get(Filter::Nearest, Wrap::Clamp),
                ),
            };
            entries.push(wgpu::BindGroupEntry {
                binding: unit as u32 * 2,
                resource: wgpu::BindingResource::TextureView(view),
            });
            entries.push(wgpu::BindGroupEntry {
                binding: unit as u32 * 2 + 1,
                resource: wgpu::BindingResource::Sampler(sampler),
            });
        }
        let bind_group = self
            .context
            .device
            .create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(pass.label),
                layout: &self.layouts.texture_layout,
                entries: &entries,
            });
        let staging = self
            .context
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("kernel uniform staging"),
                contents: bytemuck::bytes_of(pass.uniforms),
                usage: wgpu::BufferUsages::COPY_SRC,
            });

        let (view, load) = match pass.target {
            Target::Texture(id) => (
                &self.textures.get(&id).ok_or(id.unknown())?.view,
                wgpu::LoadOp::Load,
            ),
            Target::Surface => {
                let load = if self.surface_drawn {
                    wgpu::LoadOp::Load
                } else {
                    wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT)
                };
                let view = match (&self.surface_frame, &self.context.output) {
                    (Some(frame), _) => &frame.view,
                    (None, Output::Offscreen { view, .. }) => view,
                    (None, Output::Window { .. }) => {
                        return Err(EngineError::Surface("no frame acquired".into()))
                    }
                };
                (view, load)
            }
        };
        let pipeline = self
            .pipelines
            .get(&key)
            .ok_or_else(|| EngineError::MissingKernel(pass.label.to_string()))?;

        let encoder = self.encoder.get_or_insert_with(|| {
            self.context
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("dyeflow frame encoder"),
                })
        });
        encoder.copy_buffer_to_buffer(
            &staging,
            0,
            &self.uniform_buffer,
            0,
            std::mem::size_of::<KernelUniforms>() as u64,
        );
        {
            let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some(pass.label),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view,
                    depth_slice: None,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load,
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            render_pass.set_pipeline(pipeline);
            render_pass.set_bind_group(0, &self.uniform_bind_group, &[]);
            render_pass.set_bind_group(1, &bind_group, &[]);
            render_pass.draw(0..3, 0..1);
        }
        if pass.target == Target::Surface {
            self.surface_drawn = true;
        }
        Ok(())
    }

    fn read_pixels(&mut self, id: TextureId) -> Result<RgbaImage, EngineError> {
        self.flush();
        let texture = self.textures.get(&id).ok_or(id.unknown())?;
        if texture.desc.format != TextureFormat::Rgba8Unorm {
            return Err(EngineError::Readback(format!(
                "{id} has format {:?}; only Rgba8Unorm can be read back",
                texture.desc.format
            )));
        }
        let width = texture.desc.width;
        let height = texture.desc.height;
        let unpadded = width * 4;
        let padded = unpadded.div_ceil(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT)
            * wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;

        let device = &self.context.device;
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback"),
            size: u64::from(padded) * u64::from(height),
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("readback encoder"),
        });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &texture.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &buffer,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        self.context.queue.submit(Some(encoder.finish()));

        let (sender, receiver) = crossbeam_channel::bounded(1);
        let slice = buffer.slice(..);
        slice.map_async(wgpu::MapMode::Read, move |result| {
            if sender.send(result).is_err() {
                tracing::debug!("readback receiver dropped before mapping finished");
            }
        });
        device
            .poll(wgpu::PollType::Wait)
            .map_err(|err| EngineError::Readback(err.to_string()))?;
        receiver
            .recv()
            .map_err(|err| EngineError::Readback(err.to_string()))?
            .map_err(|err| EngineError::Readback(err.to_string()))?;

        let mut pixels = Vec::with_capacity((unpadded * height) as usize);
        {
            let mapped = slice.get_mapped_range();
            for row in mapped.chunks_exact(padded as usize) {
                pixels.extend_from_slice(&row[..unpadded as usize]);
            }
        }
        buffer.unmap();
        RgbaImage::from_raw(width, height, pixels)
            .ok_or_else(|| EngineError::Readback(format!("{id} has an inconsistent size")))
    }

    fn end_frame(&mut self) -> Result<(), EngineError> {
        self.flush();
        if let Some(surface) = self.surface_frame.take() {
            surface.frame.present();
        }
        self.surface_drawn = false;
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::{KernelFailurePolicy, KernelKind, KernelRegistry, KeywordSet, Uniform};
    use crate::targets::TargetPool;

    fn backend() -> Option<GpuBackend> {
        match GpuBackend::headless(16, 16) {
            Ok(backend) => Some(backend),
            Err(err) => {
                eprintln!("no GPU adapter, skipping: {err}");
                None
            }
        }
    }

    #[test]
    fn resize_keeps_contents_of_released_textures_until_submit() {
        let Some(mut backend) = backend() else {
            return;
        };
        let kernels =
            KernelRegistry::new(&mut backend, KernelFailurePolicy::FailFast, KeywordSet::EMPTY)
                .unwrap();
        let mut pool = TargetPool::new();
        let mut pair = pool
            .create_double(&mut backend, "p", (8, 4), TextureFormat::Rgba8Unorm, Filter::Linear)
            .unwrap();
        kernels
            .program(KernelKind::Color)
            .unwrap()
            .pass()
            .set(Uniform::Color, &[0.25, 0.5, 0.75, 1.0])
            .draw(&mut backend, pair.read().target())
            .unwrap();

        pool.resize_double(&mut backend, &kernels, &mut pair, (16, 8))
            .unwrap();
        assert_eq!(backend.retired.len(), 2);
        backend.end_frame().unwrap();
        assert!(backend.retired.is_empty());
        assert_eq!(backend.live_resources().textures, 2);

        let image = backend.read_pixels(pair.read().texture()).unwrap();
        assert_eq!(image.dimensions(), (16, 8));
        assert!(image
            .pixels()
            .all(|pixel| (i16::from(pixel[1]) - 128).abs() <= 1));
    }
}
