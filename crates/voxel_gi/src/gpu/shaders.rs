//! WGSL compute kernels. Every kernel is one-dimensional over a linear
//! invocation index; large launches spill into the `y` workgroup dimension.

macro_rules! linear_index {
    () => {
        r#"
override WORKGROUP_SIZE: u32 = 64u;

fn linear_index(gid: vec3<u32>, nwg: vec3<u32>) -> u32 {
  return gid.x + gid.y * nwg.x * WORKGROUP_SIZE;
}
"#
    };
}

macro_rules! rgba8 {
    () => {
        r#"
fn unpack_rgba(c: u32) -> vec4<u32> {
  return vec4<u32>(c & 255u, (c >> 8u) & 255u, (c >> 16u) & 255u, c >> 24u);
}

fn pack_rgba(c: vec4<u32>) -> u32 {
  return (c.x & 255u) | ((c.y & 255u) << 8u) | ((c.z & 255u) << 16u) | ((c.w & 255u) << 24u);
}
"#
    };
}

macro_rules! triangle_box {
    () => {
        r#"
fn axis_test(axis: vec3<f32>, v0: vec3<f32>, v1: vec3<f32>, v2: vec3<f32>, half: vec3<f32>) -> bool {
  let p0 = dot(v0, axis);
  let p1 = dot(v1, axis);
  let p2 = dot(v2, axis);
  let r = half.x * abs(axis.x) + half.y * abs(axis.y) + half.z * abs(axis.z);
  return !(min(p0, min(p1, p2)) > r || max(p0, max(p1, p2)) < -r);
}

fn triangle_box_overlap(center: vec3<f32>, half: vec3<f32>, a: vec3<f32>, b: vec3<f32>, c: vec3<f32>) -> bool {
  let v0 = a - center;
  let v1 = b - center;
  let v2 = c - center;
  let lo = min(v0, min(v1, v2));
  let hi = max(v0, max(v1, v2));
  if (any(lo > half) || any(hi < -half)) {
    return false;
  }

  let e0 = v1 - v0;
  let e1 = v2 - v1;
  let e2 = v0 - v2;
  let normal = cross(e0, e1);
  let r = half.x * abs(normal.x) + half.y * abs(normal.y) + half.z * abs(normal.z);
  if (abs(dot(normal, v0)) > r) {
    return false;
  }

  let axes = array<vec3<f32>, 9>(
    vec3<f32>(0.0, -e0.z, e0.y),
    vec3<f32>(0.0, -e1.z, e1.y),
    vec3<f32>(0.0, -e2.z, e2.y),
    vec3<f32>(e0.z, 0.0, -e0.x),
    vec3<f32>(e1.z, 0.0, -e1.x),
    vec3<f32>(e2.z, 0.0, -e2.x),
    vec3<f32>(-e0.y, e0.x, 0.0),
    vec3<f32>(-e1.y, e1.x, 0.0),
    vec3<f32>(-e2.y, e2.x, 0.0)
  );
  for (var i = 0u; i < 9u; i = i + 1u) {
    if (!axis_test(axes[i], v0, v1, v2, half)) {
      return false;
    }
  }
  return true;
}
"#
    };
}

macro_rules! clip_texel {
    () => {
        r#"
fn wrap_coord(v: i32, res: i32) -> i32 {
  return ((v % res) + res) % res;
}

// Stacked padded levels; world voxel v of a level lives at border + (v mod res).
fn world_texel(level: u32, v: vec3<i32>) -> u32 {
  let res = i32(params.resolution);
  let padded = params.resolution + 2u * params.border;
  let p = vec3<u32>(
    u32(wrap_coord(v.x, res)) + params.border,
    u32(wrap_coord(v.y, res)) + params.border,
    u32(wrap_coord(v.z, res)) + params.border
  );
  return level * padded * padded * padded + p.x + padded * (p.y + padded * p.z);
}
"#
    };
}

macro_rules! octree_walk {
    () => {
        r#"
const NODE_FLAG: u32 = 0x80000000u;
const NODE_CHILD_MASK: u32 = 0x7fffffffu;

fn fragment_position(packed: u32) -> vec3<u32> {
  let p = vec3<u32>(packed & 1023u, (packed >> 10u) & 1023u, (packed >> 20u) & 1023u);
  return p >> vec3<u32>(params.fragment_shift);
}

fn octant(p: vec3<u32>, bit: u32) -> u32 {
  return ((p.x >> bit) & 1u) | (((p.y >> bit) & 1u) << 1u) | (((p.z >> bit) & 1u) << 2u);
}
"#
    };
}

macro_rules! octree_params {
    () => {
        r#"
struct Params {
  level: u32,
  octree_level: u32,
  fragment_shift: u32,
  mode: u32,
  max_nodes: u32,
  max_bricks: u32,
  max_fragments: u32,
  _pad0: u32,
};
"#
    };
}

macro_rules! clip_pass_params {
    () => {
        r#"
struct Params {
  region_min: vec4<i32>,
  region_extent: vec4<u32>,
  level: u32,
  resolution: u32,
  border: u32,
  mode: u32,
};
"#
    };
}

pub const VOXELIZE_FRAGMENTS_WGSL: &str = concat!(
    linear_index!(),
    triangle_box!(),
    r#"
struct Params {
  origin: vec4<f32>,
  resolution: u32,
  num_triangles: u32,
  max_fragments: u32,
  _pad0: u32,
};

@group(0) @binding(0) var<storage, read> tris: array<vec4<u32>>;
@group(0) @binding(1) var<storage, read_write> frag_counter: array<atomic<u32>>;
@group(0) @binding(2) var<storage, read_write> fragments: array<u32>;
@group(0) @binding(3) var<uniform> params: Params;

fn grid_vertex(tri: u32, k: u32) -> vec3<f32> {
  let w = tris[tri * 3u + k];
  return (bitcast<vec3<f32>>(w.xyz) - params.origin.xyz) * params.origin.w;
}

@compute @workgroup_size(WORKGROUP_SIZE)
fn main(@builtin(global_invocation_id) gid: vec3<u32>, @builtin(num_workgroups) nwg: vec3<u32>) {
  let tri = linear_index(gid, nwg);
  if (tri >= params.num_triangles) {
    return;
  }
  let a = grid_vertex(tri, 0u);
  let b = grid_vertex(tri, 1u);
  let c = grid_vertex(tri, 2u);
  let color = tris[tri * 3u].w;

  let res = f32(params.resolution);
  let tri_min = min(a, min(b, c));
  let tri_max = max(a, max(b, c));
  if (any(tri_max < vec3<f32>(0.0)) || any(tri_min >= vec3<f32>(res))) {
    return;
  }
  let lo = vec3<u32>(clamp(floor(tri_min), vec3<f32>(0.0), vec3<f32>(res - 1.0)));
  let hi = vec3<u32>(clamp(floor(tri_max), vec3<f32>(0.0), vec3<f32>(res - 1.0)));
  let half = vec3<f32>(0.5);

  for (var z = lo.z; z <= hi.z; z = z + 1u) {
    for (var y = lo.y; y <= hi.y; y = y + 1u) {
      for (var x = lo.x; x <= hi.x; x = x + 1u) {
        let center = vec3<f32>(f32(x), f32(y), f32(z)) + half;
        if (triangle_box_overlap(center, half, a, b, c)) {
          let slot = atomicAdd(&frag_counter[0], 1u);
          if (slot < params.max_fragments) {
            fragments[slot * 2u] = x | (y << 10u) | (z << 20u);
            fragments[slot * 2u + 1u] = color;
          }
        }
      }
    }
  }
}
"#
);

pub const VOXELIZE_CLIPMAP_WGSL: &str = concat!(
    linear_index!(),
    triangle_box!(),
    clip_texel!(),
    r#"
struct Params {
  region_min: vec4<i32>,
  region_extent: vec4<u32>,
  voxel_size: f32,
  resolution: u32,
  border: u32,
  num_triangles: u32,
};

@group(0) @binding(0) var<storage, read> tris: array<vec4<u32>>;
@group(0) @binding(1) var<storage, read_write> opacity: array<atomic<u32>>;
@group(0) @binding(2) var<storage, read_write> radiance: array<atomic<u32>>;
@group(0) @binding(3) var<uniform> params: Params;

fn level_vertex(tri: u32, k: u32) -> vec3<f32> {
  return bitcast<vec3<f32>>(tris[tri * 3u + k].xyz) / params.voxel_size;
}

@compute @workgroup_size(WORKGROUP_SIZE)
fn main(@builtin(global_invocation_id) gid: vec3<u32>, @builtin(num_workgroups) nwg: vec3<u32>) {
  let tri = linear_index(gid, nwg);
  if (tri >= params.num_triangles) {
    return;
  }
  let a = level_vertex(tri, 0u);
  let b = level_vertex(tri, 1u);
  let c = level_vertex(tri, 2u);
  let color = tris[tri * 3u].w | 0xff000000u;
  let level = u32(params.region_min.w);

  let region_lo = vec3<f32>(params.region_min.xyz);
  let region_hi = region_lo + vec3<f32>(params.region_extent.xyz) - vec3<f32>(1.0);
  let lo = vec3<i32>(max(floor(min(a, min(b, c))), region_lo));
  let hi = vec3<i32>(min(floor(max(a, max(b, c))), region_hi));
  if (any(lo > hi)) {
    return;
  }
  let half = vec3<f32>(0.5);

  for (var z = lo.z; z <= hi.z; z = z + 1) {
    for (var y = lo.y; y <= hi.y; y = y + 1) {
      for (var x = lo.x; x <= hi.x; x = x + 1) {
        let center = vec3<f32>(f32(x), f32(y), f32(z)) + half;
        if (triangle_box_overlap(center, half, a, b, c)) {
          let t = world_texel(level, vec3<i32>(x, y, z));
          atomicMax(&opacity[t], 0xffffffffu);
          atomicMax(&radiance[t], color);
        }
      }
    }
  }
}
"#
);

pub const CLEAR_REGION_WGSL: &str = concat!(
    linear_index!(),
    clip_pass_params!(),
    clip_texel!(),
    r#"
@group(0) @binding(0) var<storage, read_write> opacity: array<u32>;
@group(0) @binding(1) var<storage, read_write> radiance: array<u32>;
@group(0) @binding(2) var<uniform> params: Params;

@compute @workgroup_size(WORKGROUP_SIZE)
fn main(@builtin(global_invocation_id) gid: vec3<u32>, @builtin(num_workgroups) nwg: vec3<u32>) {
  let index = linear_index(gid, nwg);
  let e = params.region_extent;
  if (index >= e.x * e.y * e.z) {
    return;
  }
  let offset = vec3<i32>(vec3<u32>(index % e.x, (index / e.x) % e.y, index / (e.x * e.y)));
  let t = world_texel(params.level, params.region_min.xyz + offset);
  opacity[t] = 0u;
  radiance[t] = 0u;
}
"#
);

pub const BORDER_WRAP_WGSL: &str = concat!(
    linear_index!(),
    clip_pass_params!(),
    r#"
@group(0) @binding(0) var<storage, read_write> opacity: array<u32>;
@group(0) @binding(1) var<storage, read_write> radiance: array<u32>;
@group(0) @binding(2) var<uniform> params: Params;

fn wrap_axis(p: u32) -> u32 {
  let res = i32(params.resolution);
  let v = i32(p) - i32(params.border);
  return u32(((v % res) + res) % res) + params.border;
}

@compute @workgroup_size(WORKGROUP_SIZE)
fn main(@builtin(global_invocation_id) gid: vec3<u32>, @builtin(num_workgroups) nwg: vec3<u32>) {
  let index = linear_index(gid, nwg);
  let padded = params.resolution + 2u * params.border;
  if (index >= padded * padded * padded) {
    return;
  }
  let p = vec3<u32>(index % padded, (index / padded) % padded, index / (padded * padded));
  let b = params.border;
  let end = b + params.resolution;
  if (all(p >= vec3<u32>(b)) && all(p < vec3<u32>(end))) {
    return;
  }
  let q = vec3<u32>(wrap_axis(p.x), wrap_axis(p.y), wrap_axis(p.z));
  let base = params.level * padded * padded * padded;
  let src = base + q.x + padded * (q.y + padded * q.z);
  let dst = base + index;
  opacity[dst] = opacity[src];
  radiance[dst] = radiance[src];
}
"#
);

pub const DOWN_SAMPLE_WGSL: &str = concat!(
    linear_index!(),
    clip_pass_params!(),
    clip_texel!(),
    rgba8!(),
    r#"
const MODE_OPACITY: u32 = 0u;

@group(0) @binding(0) var<storage, read_write> volume: array<u32>;
@group(0) @binding(1) var<uniform> params: Params;

@compute @workgroup_size(WORKGROUP_SIZE)
fn main(@builtin(global_invocation_id) gid: vec3<u32>, @builtin(num_workgroups) nwg: vec3<u32>) {
  let index = linear_index(gid, nwg);
  let e = params.region_extent;
  if (index >= e.x * e.y * e.z) {
    return;
  }
  let offset = vec3<i32>(vec3<u32>(index % e.x, (index / e.x) % e.y, index / (e.x * e.y)));
  let coarse = params.region_min.xyz + offset;

  var alpha_sum = 0u;
  var rgb_sum = vec3<u32>(0u);
  for (var k = 0u; k < 8u; k = k + 1u) {
    let child = coarse * 2 + vec3<i32>(vec3<u32>(k & 1u, (k >> 1u) & 1u, (k >> 2u) & 1u));
    let c = unpack_rgba(volume[world_texel(params.level, child)]);
    alpha_sum = alpha_sum + c.w;
    rgb_sum = rgb_sum + c.xyz * c.w;
  }

  let alpha = (alpha_sum + 4u) / 8u;
  var out = 0u;
  if (params.mode == MODE_OPACITY) {
    out = pack_rgba(vec4<u32>(alpha));
  } else if (alpha_sum > 0u) {
    let rgb = (rgb_sum + vec3<u32>(alpha_sum / 2u)) / alpha_sum;
    out = pack_rgba(vec4<u32>(rgb, alpha));
  }
  volume[world_texel(params.level + 1u, coarse)] = out;
}
"#
);

pub const COPY_ALPHA_WGSL: &str = concat!(
    linear_index!(),
    clip_pass_params!(),
    r#"
@group(0) @binding(0) var<storage, read> opacity: array<u32>;
@group(0) @binding(1) var<storage, read_write> radiance: array<u32>;
@group(0) @binding(2) var<uniform> params: Params;

@compute @workgroup_size(WORKGROUP_SIZE)
fn main(@builtin(global_invocation_id) gid: vec3<u32>, @builtin(num_workgroups) nwg: vec3<u32>) {
  let index = linear_index(gid, nwg);
  let padded = params.resolution + 2u * params.border;
  let texels = padded * padded * padded;
  if (index >= texels) {
    return;
  }
  let t = params.level * texels + index;
  radiance[t] = (radiance[t] & 0x00ffffffu) | (opacity[t] & 0xff000000u);
}
"#
);

macro_rules! linear_args {
    () => {
        r#"
const MAX_WORKGROUPS: u32 = 65535u;

fn write_linear_args(at: u32, invocations: u32) {
  let groups = (invocations + WORKGROUP_SIZE - 1u) / WORKGROUP_SIZE;
  dispatch_args[at] = min(groups, MAX_WORKGROUPS);
  dispatch_args[at + 1u] = max((groups + MAX_WORKGROUPS - 1u) / MAX_WORKGROUPS, 1u);
  dispatch_args[at + 2u] = 1u;
}
"#
    };
}

pub const OCTREE_INIT_WGSL: &str = concat!(
    linear_index!(),
    octree_params!(),
    linear_args!(),
    r#"
const STATE_LEVEL_BEGIN: u32 = 4u;
const ARGS_LEVEL_BASE: u32 = 3u;

@group(0) @binding(0) var<storage, read_write> nodes: array<u32>;
@group(0) @binding(1) var<storage, read_write> node_counter: array<u32>;
@group(0) @binding(2) var<storage, read_write> brick_counter: array<u32>;
@group(0) @binding(3) var<storage, read_write> build_state: array<u32>;
@group(0) @binding(4) var<storage, read_write> dispatch_args: array<u32>;
@group(0) @binding(5) var<storage, read> frag_counter: array<u32>;
@group(0) @binding(6) var<uniform> params: Params;

@compute @workgroup_size(WORKGROUP_SIZE)
fn main(@builtin(global_invocation_id) gid: vec3<u32>, @builtin(num_workgroups) nwg: vec3<u32>) {
  if (linear_index(gid, nwg) != 0u) {
    return;
  }
  nodes[0] = 0u;
  nodes[1] = 0u;
  node_counter[0] = 1u;
  brick_counter[0] = 0u;

  let fragments = min(frag_counter[0], params.max_fragments);
  build_state[0] = 0u;
  build_state[1] = fragments;
  build_state[2] = 0u;
  build_state[3] = 0u;
  for (var l = 0u; l <= params.octree_level + 1u; l = l + 1u) {
    build_state[STATE_LEVEL_BEGIN + l] = 0u;
  }
  build_state[STATE_LEVEL_BEGIN + 1u] = 1u;

  write_linear_args(0u, fragments);
  for (var l = 0u; l <= params.octree_level; l = l + 1u) {
    write_linear_args(ARGS_LEVEL_BASE + 3u * l, 0u);
  }
  write_linear_args(ARGS_LEVEL_BASE, 1u);
}
"#
);

pub const OCTREE_FLAG_WGSL: &str = concat!(
    linear_index!(),
    octree_params!(),
    octree_walk!(),
    r#"
@group(0) @binding(0) var<storage, read> fragments: array<u32>;
@group(0) @binding(1) var<storage, read> frag_counter: array<u32>;
@group(0) @binding(2) var<storage, read_write> nodes: array<atomic<u32>>;
@group(0) @binding(3) var<uniform> params: Params;

@compute @workgroup_size(WORKGROUP_SIZE)
fn main(@builtin(global_invocation_id) gid: vec3<u32>, @builtin(num_workgroups) nwg: vec3<u32>) {
  let index = linear_index(gid, nwg);
  if (index >= min(frag_counter[0], params.max_fragments)) {
    return;
  }
  let p = fragment_position(fragments[index * 2u]);
  var node = 0u;
  for (var d = 0u; d < params.level; d = d + 1u) {
    let child = atomicLoad(&nodes[node * 2u]) & NODE_CHILD_MASK;
    if (child == 0u) {
      return;
    }
    node = child + octant(p, params.octree_level - 1u - d);
  }
  atomicOr(&nodes[node * 2u], NODE_FLAG);
}
"#
);

pub const OCTREE_ALLOC_WGSL: &str = concat!(
    linear_index!(),
    octree_params!(),
    r#"
const NODE_FLAG: u32 = 0x80000000u;
const OVERFLOW_NODES: u32 = 1u;
const STATE_LEVEL_BEGIN: u32 = 4u;

@group(0) @binding(0) var<storage, read_write> nodes: array<u32>;
@group(0) @binding(1) var<storage, read_write> node_counter: array<atomic<u32>>;
@group(0) @binding(2) var<storage, read_write> build_state: array<atomic<u32>>;
@group(0) @binding(3) var<uniform> params: Params;

@compute @workgroup_size(WORKGROUP_SIZE)
fn main(@builtin(global_invocation_id) gid: vec3<u32>, @builtin(num_workgroups) nwg: vec3<u32>) {
  if (atomicLoad(&build_state[0]) != 0u) {
    return;
  }
  let node = atomicLoad(&build_state[STATE_LEVEL_BEGIN + params.level]) + linear_index(gid, nwg);
  if (node >= atomicLoad(&build_state[STATE_LEVEL_BEGIN + params.level + 1u])) {
    return;
  }
  if ((nodes[node * 2u] & NODE_FLAG) == 0u) {
    return;
  }
  let base = atomicAdd(&node_counter[0], 8u);
  if (base + 8u > params.max_nodes) {
    atomicOr(&build_state[0], OVERFLOW_NODES);
    return;
  }
  for (var k = 0u; k < 8u; k = k + 1u) {
    nodes[(base + k) * 2u] = 0u;
    nodes[(base + k) * 2u + 1u] = 0u;
  }
  nodes[node * 2u] = NODE_FLAG | base;
}
"#
);

pub const OCTREE_MODIFY_ARGS_WGSL: &str = concat!(
    linear_index!(),
    octree_params!(),
    linear_args!(),
    r#"
const STATE_LEVEL_BEGIN: u32 = 4u;
const ARGS_LEVEL_BASE: u32 = 3u;

@group(0) @binding(0) var<storage, read> node_counter: array<u32>;
@group(0) @binding(1) var<storage, read_write> build_state: array<u32>;
@group(0) @binding(2) var<storage, read_write> dispatch_args: array<u32>;
@group(0) @binding(3) var<uniform> params: Params;

@compute @workgroup_size(WORKGROUP_SIZE)
fn main(@builtin(global_invocation_id) gid: vec3<u32>, @builtin(num_workgroups) nwg: vec3<u32>) {
  if (linear_index(gid, nwg) != 0u) {
    return;
  }
  let end = min(node_counter[0], params.max_nodes);
  let begin = build_state[STATE_LEVEL_BEGIN + params.level + 1u];
  build_state[STATE_LEVEL_BEGIN + params.level + 2u] = end;
  write_linear_args(ARGS_LEVEL_BASE + 3u * (params.level + 1u), end - begin);
}
"#
);

pub const OCTREE_LEAF_ALLOC_WGSL: &str = concat!(
    linear_index!(),
    octree_params!(),
    r#"
const NODE_FLAG: u32 = 0x80000000u;
const OVERFLOW_BRICKS: u32 = 2u;
const STATE_LEVEL_BEGIN: u32 = 4u;

@group(0) @binding(0) var<storage, read_write> nodes: array<u32>;
@group(0) @binding(1) var<storage, read_write> brick_counter: array<atomic<u32>>;
@group(0) @binding(2) var<storage, read_write> bricks: array<u32>;
@group(0) @binding(3) var<storage, read_write> build_state: array<atomic<u32>>;
@group(0) @binding(4) var<uniform> params: Params;

@compute @workgroup_size(WORKGROUP_SIZE)
fn main(@builtin(global_invocation_id) gid: vec3<u32>, @builtin(num_workgroups) nwg: vec3<u32>) {
  if (atomicLoad(&build_state[0]) != 0u) {
    return;
  }
  let node = atomicLoad(&build_state[STATE_LEVEL_BEGIN + params.level]) + linear_index(gid, nwg);
  if (node >= atomicLoad(&build_state[STATE_LEVEL_BEGIN + params.level + 1u])) {
    return;
  }
  if ((nodes[node * 2u] & NODE_FLAG) == 0u) {
    return;
  }
  let brick = atomicAdd(&brick_counter[0], 1u);
  if (brick >= params.max_bricks) {
    atomicOr(&build_state[0], OVERFLOW_BRICKS);
    return;
  }
  for (var k = 0u; k < 7u; k = k + 1u) {
    bricks[brick * 8u + k] = 0u;
  }
  bricks[brick * 8u + 7u] = params.level;
  nodes[node * 2u + 1u] = brick + 1u;
}
"#
);

pub const OCTREE_LEAF_WRITE_WGSL: &str = concat!(
    linear_index!(),
    octree_params!(),
    octree_walk!(),
    rgba8!(),
    r#"
@group(0) @binding(0) var<storage, read> fragments: array<u32>;
@group(0) @binding(1) var<storage, read> frag_counter: array<u32>;
@group(0) @binding(2) var<storage, read> nodes: array<u32>;
@group(0) @binding(3) var<storage, read_write> bricks: array<atomic<u32>>;
@group(0) @binding(4) var<uniform> params: Params;

@compute @workgroup_size(WORKGROUP_SIZE)
fn main(@builtin(global_invocation_id) gid: vec3<u32>, @builtin(num_workgroups) nwg: vec3<u32>) {
  let index = linear_index(gid, nwg);
  if (index >= min(frag_counter[0], params.max_fragments)) {
    return;
  }
  let p = fragment_position(fragments[index * 2u]);
  var node = 0u;
  for (var d = 0u; d < params.octree_level; d = d + 1u) {
    let child = nodes[node * 2u] & NODE_CHILD_MASK;
    if (child == 0u) {
      return;
    }
    node = child + octant(p, params.octree_level - 1u - d);
  }
  let payload = nodes[node * 2u + 1u];
  if (payload == 0u) {
    return;
  }
  let base = (payload - 1u) * 8u;
  let c = unpack_rgba(fragments[index * 2u + 1u]);
  atomicAdd(&bricks[base], c.x);
  atomicAdd(&bricks[base + 1u], c.y);
  atomicAdd(&bricks[base + 2u], c.z);
  atomicAdd(&bricks[base + 3u], c.w);
  atomicAdd(&bricks[base + 4u], 1u);
}
"#
);

pub const OCTREE_MIPMAP_WGSL: &str = concat!(
    linear_index!(),
    octree_params!(),
    rgba8!(),
    r#"
const NODE_CHILD_MASK: u32 = 0x7fffffffu;
const OVERFLOW_BRICKS: u32 = 2u;
const STATE_LEVEL_BEGIN: u32 = 4u;
const MODE_FINALIZE_LEAVES: u32 = 0u;

@group(0) @binding(0) var<storage, read_write> nodes: array<u32>;
@group(0) @binding(1) var<storage, read_write> brick_counter: array<atomic<u32>>;
@group(0) @binding(2) var<storage, read_write> bricks: array<u32>;
@group(0) @binding(3) var<storage, read_write> build_state: array<atomic<u32>>;
@group(0) @binding(4) var<uniform> params: Params;

fn finalize_leaf(node: u32) {
  let payload = nodes[node * 2u + 1u];
  if (payload == 0u) {
    return;
  }
  let base = (payload - 1u) * 8u;
  let count = bricks[base + 4u];
  if (count == 0u) {
    return;
  }
  let sum = vec4<u32>(bricks[base], bricks[base + 1u], bricks[base + 2u], bricks[base + 3u]);
  bricks[base + 5u] = pack_rgba((sum + vec4<u32>(count / 2u)) / count);
}

fn mip_interior(node: u32) {
  let child = nodes[node * 2u] & NODE_CHILD_MASK;
  if (child == 0u) {
    return;
  }
  var mask = 0u;
  var present = 0u;
  var count = 0u;
  var sum = vec4<u32>(0u);
  for (var k = 0u; k < 8u; k = k + 1u) {
    let payload = nodes[(child + k) * 2u + 1u];
    if (payload != 0u) {
      let base = (payload - 1u) * 8u;
      sum = sum + unpack_rgba(bricks[base + 5u]);
      count = count + bricks[base + 4u];
      mask = mask | (1u << k);
      present = present + 1u;
    }
  }
  if (present == 0u) {
    return;
  }
  let brick = atomicAdd(&brick_counter[0], 1u);
  if (brick >= params.max_bricks) {
    atomicOr(&build_state[0], OVERFLOW_BRICKS);
    return;
  }
  let base = brick * 8u;
  bricks[base] = sum.x;
  bricks[base + 1u] = sum.y;
  bricks[base + 2u] = sum.z;
  bricks[base + 3u] = sum.w;
  bricks[base + 4u] = count;
  let rgb = (sum.xyz + vec3<u32>(present / 2u)) / present;
  bricks[base + 5u] = pack_rgba(vec4<u32>(rgb, (sum.w + 4u) / 8u));
  bricks[base + 6u] = mask;
  bricks[base + 7u] = params.level;
  nodes[node * 2u + 1u] = brick + 1u;
}

@compute @workgroup_size(WORKGROUP_SIZE)
fn main(@builtin(global_invocation_id) gid: vec3<u32>, @builtin(num_workgroups) nwg: vec3<u32>) {
  let node = atomicLoad(&build_state[STATE_LEVEL_BEGIN + params.level]) + linear_index(gid, nwg);
  if (node >= atomicLoad(&build_state[STATE_LEVEL_BEGIN + params.level + 1u])) {
    return;
  }
  if (params.mode == MODE_FINALIZE_LEAVES) {
    finalize_leaf(node);
  } else if (atomicLoad(&build_state[0]) == 0u) {
    mip_interior(node);
  }
}
"#
);
