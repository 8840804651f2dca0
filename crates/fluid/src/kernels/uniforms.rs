use bytemuck::{Pod, Zeroable};

/// Number of `vec4` slots in the shared kernel uniform block.
pub const UNIFORM_SLOTS: usize = 6;

/// Named kernel parameters. Every kernel shares one std140 block; each name is
/// a `#define` alias onto a component range of one slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Uniform {
    TexelSize,
    DyeTexelSize,
    Dt,
    Dissipation,
    Curl,
    AspectRatio,
    Radius,
    Intensity,
    Threshold,
    Weight,
    Point,
    DitherScale,
    Color,
    Curve,
    Value,
}

impl Uniform {
    pub const ALL: [Uniform; 15] = [
        Uniform::TexelSize,
        Uniform::DyeTexelSize,
        Uniform::Dt,
        Uniform::Dissipation,
        Uniform::Curl,
        Uniform::AspectRatio,
        Uniform::Radius,
        Uniform::Intensity,
        Uniform::Threshold,
        Uniform::Weight,
        Uniform::Point,
        Uniform::DitherScale,
        Uniform::Color,
        Uniform::Curve,
        Uniform::Value,
    ];

    pub fn glsl_name(self) -> &'static str {
        match self {
            Uniform::TexelSize => "texelSize",
            Uniform::DyeTexelSize => "dyeTexelSize",
            Uniform::Dt => "dt",
            Uniform::Dissipation => "dissipation",
            Uniform::Curl => "curl",
            Uniform::AspectRatio => "aspectRatio",
            Uniform::Radius => "radius",
            Uniform::Intensity => "intensity",
            Uniform::Threshold => "threshold",
            Uniform::Weight => "weight",
            Uniform::Point => "point",
            Uniform::DitherScale => "ditherScale",
            Uniform::Color => "color",
            Uniform::Curve => "curve",
            Uniform::Value => "value",
        }
    }

    /// `(slot, first component, component count)` inside the block.
    pub const fn location(self) -> (usize, usize, usize) {
        match self {
            Uniform::TexelSize => (0, 0, 2),
            Uniform::DyeTexelSize => (0, 2, 2),
            Uniform::Dt => (1, 0, 1),
            Uniform::Dissipation => (1, 1, 1),
            Uniform::Curl => (1, 2, 1),
            Uniform::AspectRatio => (1, 3, 1),
            Uniform::Radius => (2, 0, 1),
            Uniform::Intensity => (2, 1, 1),
            Uniform::Threshold => (2, 2, 1),
            Uniform::Weight => (2, 3, 1),
            Uniform::Point => (3, 0, 2),
            Uniform::DitherScale => (3, 2, 2),
            Uniform::Color => (4, 0, 4),
            Uniform::Curve => (5, 0, 3),
            Uniform::Value => (5, 3, 1),
        }
    }

    fn bit(self) -> u16 {
        1 << (self as u16)
    }
}

#[repr(C, align(16))]
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct KernelUniforms {
    slots: [[f32; 4]; UNIFORM_SLOTS],
}

unsafe impl Zeroable for KernelUniforms {}
unsafe impl Pod for KernelUniforms {}

impl KernelUniforms {
    pub fn set(&mut self, uniform: Uniform, values: &[f32]) {
        let (slot, offset, len) = uniform.location();
        let count = len.min(values.len());
        self.slots[slot][offset..offset + count].copy_from_slice(&values[..count]);
    }

    pub fn get(&self, uniform: Uniform) -> &[f32] {
        let (slot, offset, len) = uniform.location();
        &self.slots[slot][offset..offset + len]
    }

    pub fn scalar(&self, uniform: Uniform) -> f32 {
        self.get(uniform)[0]
    }

    pub fn vec2(&self, uniform: Uniform) -> [f32; 2] {
        let values = self.get(uniform);
        [values[0], values.get(1).copied().unwrap_or(0.0)]
    }

    pub fn vec4(&self, uniform: Uniform) -> [f32; 4] {
        let mut out = [0.0; 4];
        let values = self.get(uniform);
        out[..values.len()].copy_from_slice(values);
        out
    }
}

/// The set of uniforms a program actually references, resolved once when the
/// program is linked.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UniformTable(u16);

/// Neighbour-coordinate macros from the kernel header; they read `texelSize`.
const NEIGHBOUR_MACROS: [&str; 4] = ["vL", "vR", "vT", "vB"];

impl UniformTable {
    pub fn resolve(source: &str) -> Self {
        let mut mask = Uniform::ALL
            .iter()
            .filter(|uniform| contains_identifier(source, uniform.glsl_name()))
            .fold(0u16, |mask, uniform| mask | uniform.bit());
        if NEIGHBOUR_MACROS
            .iter()
            .any(|name| contains_identifier(source, name))
        {
            mask |= Uniform::TexelSize.bit();
        }
        Self(mask)
    }

    pub fn contains(&self, uniform: Uniform) -> bool {
        self.0 & uniform.bit() != 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

pub(crate) fn contains_identifier(source: &str, name: &str) -> bool {
    let is_ident = |ch: char| ch.is_ascii_alphanumeric() || ch == '_';
    source.match_indices(name).any(|(start, _)| {
        let before = source[..start].chars().next_back();
        let after = source[start + name.len()..].chars().next();
        !before.is_some_and(is_ident) && !after.is_some_and(is_ident)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{align_of, size_of};

    #[test]
    fn block_matches_std140_layout() {
        assert_eq!(size_of::<KernelUniforms>(), UNIFORM_SLOTS * 16);
        assert_eq!(align_of::<KernelUniforms>(), 16);
    }

    #[test]
    fn locations_do_not_overlap() {
        let mut used = [[false; 4]; UNIFORM_SLOTS];
        for uniform in Uniform::ALL {
            let (slot, offset, len) = uniform.location();
            assert!(offset + len <= 4, "{uniform:?} spills out of its slot");
            for component in offset..offset + len {
                assert!(!used[slot][component], "{uniform:?} overlaps");
                used[slot][component] = true;
            }
        }
    }

    #[test]
    fn set_truncates_to_uniform_width() {
        let mut uniforms = KernelUniforms::default();
        uniforms.set(Uniform::Dt, &[0.5, 9.0, 9.0]);
        uniforms.set(Uniform::TexelSize, &[0.25, 0.125]);
        assert_eq!(uniforms.scalar(Uniform::Dt), 0.5);
        assert_eq!(uniforms.scalar(Uniform::Dissipation), 0.0);
        assert_eq!(uniforms.vec2(Uniform::TexelSize), [0.25, 0.125]);

        let bytes = bytemuck::bytes_of(&uniforms);
        let dt = f32::from_ne_bytes(bytes[16..20].try_into().unwrap());
        assert_eq!(dt, 0.5);
    }

    #[test]
    fn table_matches_whole_identifiers_only() {
        let table = UniformTable::resolve("float dtx = width; vec2 p = point * aspectRatio;");
        assert!(!table.contains(Uniform::Dt));
        assert!(table.contains(Uniform::Point));
        assert!(table.contains(Uniform::AspectRatio));
        assert!(!table.contains(Uniform::TexelSize));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn neighbour_lookups_imply_texel_size() {
        let table = UniformTable::resolve("float L = texture(uPressure, vL).x;");
        assert!(table.contains(Uniform::TexelSize));
    }
}
