use std::borrow::Cow;

use wgpu::naga::ShaderStage as NagaStage;

use crate::backend::{Blend, Filter, ShaderStage, Wrap, MAX_TEXTURE_UNITS};

/// Bind group layouts shared by every kernel: the uniform block in set 0 and
/// `MAX_TEXTURE_UNITS` texture/sampler pairs in set 1.
pub(crate) struct PipelineLayouts {
    pub uniform_layout: wgpu::BindGroupLayout,
    pub texture_layout: wgpu::BindGroupLayout,
    pub pipeline_layout: wgpu::PipelineLayout,
}

impl PipelineLayouts {
    pub fn new(device: &wgpu::Device) -> Self {
        let uniform_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("kernel uniform layout"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            }],
        });
        let texture_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("kernel texture layout"),
            entries: &texture_layout_entries(),
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("kernel pipeline layout"),
            bind_group_layouts: &[&uniform_layout, &texture_layout],
            push_constant_ranges: &[],
        });
        Self {
            uniform_layout,
            texture_layout,
            pipeline_layout,
        }
    }
}

fn texture_layout_entries() -> Vec<wgpu::BindGroupLayoutEntry> {
    let mut entries = Vec::with_capacity(MAX_TEXTURE_UNITS * 2);
    for unit in 0..MAX_TEXTURE_UNITS as u32 {
        entries.push(wgpu::BindGroupLayoutEntry {
            binding: unit * 2,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Texture {
                sample_type: wgpu::TextureSampleType::Float { filterable: true },
                view_dimension: wgpu::TextureViewDimension::D2,
                multisampled: false,
            },
            count: None,
        });
        entries.push(wgpu::BindGroupLayoutEntry {
            binding: unit * 2 + 1,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
            count: None,
        });
    }
    entries
}

pub(crate) fn create_shader_module(
    device: &wgpu::Device,
    label: &str,
    stage: ShaderStage,
    text: &str,
) -> wgpu::ShaderModule {
    let stage = match stage {
        ShaderStage::Vertex => NagaStage::Vertex,
        ShaderStage::Fragment => NagaStage::Fragment,
    };
    device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(label),
        source: wgpu::ShaderSource::Glsl {
            shader: Cow::Owned(text.to_owned()),
            stage,
            defines: &[],
        },
    })
}

pub(crate) fn blend_state(blend: Blend) -> Option<wgpu::BlendState> {
    let component = |dst_factor| wgpu::BlendComponent {
        src_factor: wgpu::BlendFactor::One,
        dst_factor,
        operation: wgpu::BlendOperation::Add,
    };
    match blend {
        Blend::Replace => None,
        Blend::Additive => Some(wgpu::BlendState {
            color: component(wgpu::BlendFactor::One),
            alpha: component(wgpu::BlendFactor::One),
        }),
        Blend::PremultipliedOver => Some(wgpu::BlendState {
            color: component(wgpu::BlendFactor::OneMinusSrcAlpha),
            alpha: component(wgpu::BlendFactor::OneMinusSrcAlpha),
        }),
    }
}

pub(crate) fn create_pipeline(
    device: &wgpu::Device,
    layouts: &PipelineLayouts,
    label: &str,
    vertex: &wgpu::ShaderModule,
    fragment: &wgpu::ShaderModule,
    format: wgpu::TextureFormat,
    blend: Blend,
) -> wgpu::RenderPipeline {
    device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some(label),
        layout: Some(&layouts.pipeline_layout),
        vertex: wgpu::VertexState {
            module: vertex,
            entry_point: Some("main"),
            buffers: &[],
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        },
        primitive: wgpu::PrimitiveState {
            topology: wgpu::PrimitiveTopology::TriangleList,
            strip_index_format: None,
            front_face: wgpu::FrontFace::Ccw,
            cull_mode: None,
            polygon_mode: wgpu::PolygonMode::Fill,
            unclipped_depth: false,
            conservative: false,
        },
        depth_stencil: None,
        multisample: wgpu::MultisampleState::default(),
        fragment: Some(wgpu::FragmentState {
            module: fragment,
            entry_point: Some("main"),
            targets: &[Some(wgpu::ColorTargetState {
                format,
                blend: blend_state(blend),
                write_mask: wgpu::ColorWrites::ALL,
            })],
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        }),
        multiview: None,
        cache: None,
    })
}

/// One sampler per filter/wrap combination.
pub(crate) struct Samplers {
    samplers: [wgpu::Sampler; 4],
}

impl Samplers {
    pub fn new(device: &wgpu::Device) -> Self {
        let make = |filter: Filter, wrap: Wrap| {
            let address_mode = match wrap {
                Wrap::Clamp => wgpu::AddressMode::ClampToEdge,
                Wrap::Repeat => wgpu::AddressMode::Repeat,
            };
            let filter_mode = match filter {
                Filter::Linear => wgpu::FilterMode::Linear,
                Filter::Nearest => wgpu::FilterMode::Nearest,
            };
            device.create_sampler(&wgpu::SamplerDescriptor {
                label: Some("kernel sampler"),
                address_mode_u: address_mode,
                address_mode_v: address_mode,
                address_mode_w: address_mode,
                mag_filter: filter_mode,
                min_filter: filter_mode,
                mipmap_filter: wgpu::FilterMode::Nearest,
                ..Default::default()
            })
        };
        Self {
            samplers: [
                make(Filter::Linear, Wrap::Clamp),
                make(Filter::Linear, Wrap::Repeat),
                make(Filter::Nearest, Wrap::Clamp),
                make(Filter::Nearest, Wrap::Repeat),
            ],
        }
    }

    pub fn get(&self, filter: Filter, wrap: Wrap) -> &wgpu::Sampler {
        let index = match (filter, wrap) {
            (Filter::Linear, Wrap::Clamp) => 0,
            (Filter::Linear, Wrap::Repeat) => 1,
            (Filter::Nearest, Wrap::Clamp) => 2,
            (Filter::Nearest, Wrap::Repeat) => 3,
        };
        &self.samplers[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replace_disables_blending() {
        assert!(blend_state(Blend::Replace).is_none());
    }

    #[test]
    fn premultiplied_over_keeps_destination_behind_source() {
        let state = blend_state(Blend::PremultipliedOver).unwrap();
        assert_eq!(state.color.src_factor, wgpu::BlendFactor::One);
        assert_eq!(state.color.dst_factor, wgpu::BlendFactor::OneMinusSrcAlpha);
    }

    #[test]
    fn texture_layout_pairs_textures_with_samplers() {
        let entries = texture_layout_entries();
        assert_eq!(entries.len(), MAX_TEXTURE_UNITS * 2);
        assert!(matches!(entries[2].ty, wgpu::BindingType::Texture { .. }));
        assert!(matches!(entries[3].ty, wgpu::BindingType::Sampler(_)));
    }
}
