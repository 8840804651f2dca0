//! GLSL sources for every kernel.
//!
//! Kernel bodies only contain `main` and helpers. [`fragment_source`] wraps a
//! body with the keyword defines, the shared uniform block, and the sampler
//! declarations for the kernel's texture units.

use std::fmt::Write as _;

use super::{KernelKind, KeywordSet};

/// Full-screen triangle. `v_uv` has its origin at the top-left texel so that
/// texture rows and framebuffer rows line up.
pub(crate) const VERTEX: &str = r"#version 450
layout(location = 0) out vec2 v_uv;

const vec2 positions[3] = vec2[3](
    vec2(-1.0, -3.0),
    vec2(3.0, 1.0),
    vec2(-1.0, 1.0)
);

void main() {
    uint vertex_index = uint(gl_VertexIndex);
    vec2 pos = positions[vertex_index];
    v_uv = vec2(pos.x * 0.5 + 0.5, 0.5 - pos.y * 0.5);
    gl_Position = vec4(pos, 0.0, 1.0);
}
";

/// Must mirror [`super::KernelUniforms`] and [`super::Uniform::location`].
const HEADER: &str = r"layout(location = 0) in vec2 v_uv;
layout(location = 0) out vec4 fragColor;

layout(std140, set = 0, binding = 0) uniform KernelParams {
    vec4 _texel;
    vec4 _step;
    vec4 _shape;
    vec4 _point;
    vec4 _color;
    vec4 _curve;
} ubo;

#define texelSize ubo._texel.xy
#define dyeTexelSize ubo._texel.zw
#define dt ubo._step.x
#define dissipation ubo._step.y
#define curl ubo._step.z
#define aspectRatio ubo._step.w
#define radius ubo._shape.x
#define intensity ubo._shape.y
#define threshold ubo._shape.z
#define weight ubo._shape.w
#define point ubo._point.xy
#define ditherScale ubo._point.zw
#define color ubo._color
#define curve ubo._curve.xyz
#define value ubo._curve.w

#define vUv v_uv
#define vL (v_uv - vec2(texelSize.x, 0.0))
#define vR (v_uv + vec2(texelSize.x, 0.0))
#define vT (v_uv + vec2(0.0, texelSize.y))
#define vB (v_uv - vec2(0.0, texelSize.y))
";

pub(crate) fn fragment_source(kind: KernelKind, keywords: KeywordSet) -> String {
    let mut source = String::from("#version 450\n");
    for name in keywords.names() {
        let _ = writeln!(source, "#define {name}");
    }
    source.push_str(HEADER);
    for (unit, sampler) in kind.samplers().iter().enumerate() {
        let name = sampler.glsl_name();
        let _ = writeln!(
            source,
            "layout(set = 1, binding = {tex}) uniform texture2D {name}_texture;\n\
             layout(set = 1, binding = {samp}) uniform sampler {name}_sampler;\n\
             #define {name} sampler2D({name}_texture, {name}_sampler)",
            tex = unit * 2,
            samp = unit * 2 + 1,
        );
    }
    source.push_str("#line 1\n");
    source.push_str(body(kind));
    source
}

pub(crate) fn body(kind: KernelKind) -> &'static str {
    match kind {
        KernelKind::Copy => COPY,
        KernelKind::Clear => CLEAR,
        KernelKind::Color => COLOR,
        KernelKind::Checkerboard => CHECKERBOARD,
        KernelKind::Display => DISPLAY,
        KernelKind::BloomPrefilter => BLOOM_PREFILTER,
        KernelKind::BloomBlur => BLOOM_BLUR,
        KernelKind::BloomFinal => BLOOM_FINAL,
        KernelKind::SunraysMask => SUNRAYS_MASK,
        KernelKind::Sunrays => SUNRAYS,
        KernelKind::Blur => BLUR,
        KernelKind::Splat => SPLAT,
        KernelKind::Advection => ADVECTION,
        KernelKind::Divergence => DIVERGENCE,
        KernelKind::Curl => CURL,
        KernelKind::Vorticity => VORTICITY,
        KernelKind::Pressure => PRESSURE,
        KernelKind::GradientSubtract => GRADIENT_SUBTRACT,
    }
}

const COPY: &str = r"
void main() {
    fragColor = texture(uTexture, vUv);
}
";

const CLEAR: &str = r"
void main() {
    fragColor = value * texture(uTexture, vUv);
}
";

const COLOR: &str = r"
void main() {
    fragColor = color;
}
";

const CHECKERBOARD: &str = r"
const float SCALE = 25.0;

void main() {
    vec2 cell = floor(vUv * SCALE * vec2(aspectRatio, 1.0));
    float v = mod(cell.x + cell.y, 2.0);
    v = v * 0.1 + 0.8;
    fragColor = vec4(vec3(v), 1.0);
}
";

const DISPLAY: &str = r"
vec3 linearToGamma(vec3 c) {
    c = max(c, vec3(0.0));
    return max(1.055 * pow(c, vec3(0.416666667)) - 0.055, vec3(0.0));
}

void main() {
    vec3 c = texture(uTexture, vUv).rgb;

#ifdef SHADING
    vec3 lc = texture(uTexture, vL).rgb;
    vec3 rc = texture(uTexture, vR).rgb;
    vec3 tc = texture(uTexture, vT).rgb;
    vec3 bc = texture(uTexture, vB).rgb;

    float dx = length(rc) - length(lc);
    float dy = length(tc) - length(bc);

    vec3 n = normalize(vec3(dx, dy, length(texelSize)));
    vec3 l = vec3(0.0, 0.0, 1.0);

    float diffuse = clamp(dot(n, l) + 0.7, 0.7, 1.0);
    c *= diffuse;
#endif

#ifdef BLOOM
    vec3 bloom = texture(uBloom, vUv).rgb;
#endif

#ifdef SUNRAYS
    float sunrays = texture(uSunrays, vUv).r;
    c *= sunrays;
#ifdef BLOOM
    bloom *= sunrays;
#endif
#endif

#ifdef BLOOM
    float noise = texture(uDithering, vUv * ditherScale).r;
    noise = noise * 2.0 - 1.0;
    bloom += noise / 255.0;
    bloom = linearToGamma(bloom);
    c += bloom;
#endif

    float a = max(c.r, max(c.g, c.b));
    fragColor = vec4(c, a);
}
";

const BLOOM_PREFILTER: &str = r"
void main() {
    vec3 c = texture(uTexture, vUv).rgb;
    float br = max(c.r, max(c.g, c.b));
    float rq = clamp(br - curve.x, 0.0, curve.y);
    rq = curve.z * rq * rq;
    c *= max(rq, br - threshold) / max(br, 0.0001);
    fragColor = vec4(c, 0.0);
}
";

const BLOOM_BLUR: &str = r"
void main() {
    vec4 sum = vec4(0.0);
    sum += texture(uTexture, vL);
    sum += texture(uTexture, vR);
    sum += texture(uTexture, vT);
    sum += texture(uTexture, vB);
    sum *= 0.25;
    fragColor = sum;
}
";

const BLOOM_FINAL: &str = r"
void main() {
    vec4 sum = vec4(0.0);
    sum += texture(uTexture, vL);
    sum += texture(uTexture, vR);
    sum += texture(uTexture, vT);
    sum += texture(uTexture, vB);
    sum *= 0.25;
    fragColor = sum * intensity;
}
";

const SUNRAYS_MASK: &str = r"
void main() {
    vec4 c = texture(uTexture, vUv);
    float br = max(c.r, max(c.g, c.b));
    c.a = 1.0 - min(max(br * 20.0, 0.0), 0.8);
    fragColor = c;
}
";

const SUNRAYS: &str = r"
const int ITERATIONS = 16;

void main() {
    float Density = 0.3;
    float Decay = 0.95;
    float Exposure = 0.7;

    vec2 coord = vUv;
    vec2 dir = vUv - 0.5;

    dir *= 1.0 / float(ITERATIONS) * Density;
    float illuminationDecay = 1.0;

    float acc = texture(uTexture, vUv).a;

    for (int i = 0; i < ITERATIONS; i++) {
        coord -= dir;
        float col = texture(uTexture, coord).a;
        acc += col * illuminationDecay * weight;
        illuminationDecay *= Decay;
    }

    fragColor = vec4(acc * Exposure, 0.0, 0.0, 1.0);
}
";

const BLUR: &str = r"
void main() {
    vec2 offset = texelSize * 1.33333333;
    vec4 sum = texture(uTexture, vUv) * 0.29411764;
    sum += texture(uTexture, vUv - offset) * 0.35294117;
    sum += texture(uTexture, vUv + offset) * 0.35294117;
    fragColor = sum;
}
";

const SPLAT: &str = r"
void main() {
    vec2 p = vUv - point;
    p.x *= aspectRatio;
    vec3 splat = exp(-dot(p, p) / radius) * color.rgb;
    vec3 base = texture(uTarget, vUv).xyz;
    fragColor = vec4(base + splat, 1.0);
}
";

const ADVECTION: &str = r"
vec4 bilerp(vec2 uv, vec2 tsize, int which) {
    vec2 st = uv / tsize - 0.5;

    vec2 iuv = floor(st);
    vec2 fuv = fract(st);

    vec4 a;
    vec4 b;
    vec4 c;
    vec4 d;
    if (which == 0) {
        a = texture(uVelocity, (iuv + vec2(0.5, 0.5)) * tsize);
        b = texture(uVelocity, (iuv + vec2(1.5, 0.5)) * tsize);
        c = texture(uVelocity, (iuv + vec2(0.5, 1.5)) * tsize);
        d = texture(uVelocity, (iuv + vec2(1.5, 1.5)) * tsize);
    } else {
        a = texture(uSource, (iuv + vec2(0.5, 0.5)) * tsize);
        b = texture(uSource, (iuv + vec2(1.5, 0.5)) * tsize);
        c = texture(uSource, (iuv + vec2(0.5, 1.5)) * tsize);
        d = texture(uSource, (iuv + vec2(1.5, 1.5)) * tsize);
    }

    return mix(mix(a, b, fuv.x), mix(c, d, fuv.x), fuv.y);
}

void main() {
#ifdef MANUAL_FILTERING
    vec2 coord = vUv - dt * bilerp(vUv, texelSize, 0).xy * texelSize;
    vec4 result = bilerp(coord, dyeTexelSize, 1);
#else
    vec2 coord = vUv - dt * texture(uVelocity, vUv).xy * texelSize;
    vec4 result = texture(uSource, coord);
#endif
    float decay = 1.0 + dissipation * dt;
    fragColor = result / decay;
}
";

const DIVERGENCE: &str = r"
void main() {
    float L = texture(uVelocity, vL).x;
    float R = texture(uVelocity, vR).x;
    float T = texture(uVelocity, vT).y;
    float B = texture(uVelocity, vB).y;

    vec2 C = texture(uVelocity, vUv).xy;
    if (vL.x < 0.0) { L = -C.x; }
    if (vR.x > 1.0) { R = -C.x; }
    if (vT.y > 1.0) { T = -C.y; }
    if (vB.y < 0.0) { B = -C.y; }

    float div = 0.5 * (R - L + T - B);
    fragColor = vec4(div, 0.0, 0.0, 1.0);
}
";

const CURL: &str = r"
void main() {
    float L = texture(uVelocity, vL).y;
    float R = texture(uVelocity, vR).y;
    float T = texture(uVelocity, vT).x;
    float B = texture(uVelocity, vB).x;
    float vorticity = R - L - T + B;
    fragColor = vec4(0.5 * vorticity, 0.0, 0.0, 1.0);
}
";

const VORTICITY: &str = r"
void main() {
    float L = texture(uCurl, vL).x;
    float R = texture(uCurl, vR).x;
    float T = texture(uCurl, vT).x;
    float B = texture(uCurl, vB).x;
    float C = texture(uCurl, vUv).x;

    vec2 force = 0.5 * vec2(abs(T) - abs(B), abs(R) - abs(L));
    force /= length(force) + 0.0001;
    force *= curl * C;
    force.y *= -1.0;

    vec2 velocity = texture(uVelocity, vUv).xy;
    velocity += force * dt;
    velocity = min(max(velocity, vec2(-1000.0)), vec2(1000.0));
    fragColor = vec4(velocity, 0.0, 1.0);
}
";

const PRESSURE: &str = r"
void main() {
    float L = texture(uPressure, vL).x;
    float R = texture(uPressure, vR).x;
    float T = texture(uPressure, vT).x;
    float B = texture(uPressure, vB).x;
    float divergence = texture(uDivergence, vUv).x;
    float pressure = (L + R + B + T - divergence) * 0.25;
    fragColor = vec4(pressure, 0.0, 0.0, 1.0);
}
";

const GRADIENT_SUBTRACT: &str = r"
void main() {
    float L = texture(uPressure, vL).x;
    float R = texture(uPressure, vR).x;
    float T = texture(uPressure, vT).x;
    float B = texture(uPressure, vB).x;
    vec2 velocity = texture(uVelocity, vUv).xy;
    velocity.xy -= vec2(R - L, T - B);
    fragColor = vec4(velocity, 0.0, 1.0);
}
";
