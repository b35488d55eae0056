//! One function per WGSL kernel, run once per invocation index.
//!
//! Out-of-bounds loads return zero and out-of-bounds stores are dropped, the
//! way robust buffer access behaves on the device.

use bytemuck::Pod;
use glam::{IVec3, UVec3, Vec3};

use crate::clipmap::texel_index;
use crate::config::WORKGROUP_SIZE;
use crate::core::{octant, pack_position, pack_rgba8, triangle_box_overlap, unpack_position, unpack_rgba8};
use crate::error::{Result, VoxelGiError};
use crate::gpu::params::*;
use crate::gpu::{linear_workgroups, PipelineKind};

fn load(buffer: &[u32], index: u32) -> u32 {
    buffer.get(index as usize).copied().unwrap_or(0)
}

fn store(buffer: &mut [u32], index: u32, value: u32) {
    if let Some(slot) = buffer.get_mut(index as usize) {
        *slot = value;
    }
}

fn store_at(buffer: &mut [u32], index: usize, value: u32) {
    if let Some(slot) = buffer.get_mut(index) {
        *slot = value;
    }
}

fn load_at(buffer: &[u32], index: usize) -> u32 {
    buffer.get(index).copied().unwrap_or(0)
}

fn read_params<P: Pod>(kind: PipelineKind, bytes: &[u8]) -> Result<P> {
    if bytes.len() != std::mem::size_of::<P>() {
        return Err(VoxelGiError::Device(format!(
            "{} params are {} bytes, expected {}",
            kind.label(),
            bytes.len(),
            std::mem::size_of::<P>()
        )));
    }
    Ok(bytemuck::pod_read_unaligned(bytes))
}

fn for_each_invocation(workgroups: [u32; 3], mut kernel: impl FnMut(u32)) {
    let per_layer = workgroups[0] as u64 * workgroups[1] as u64 * WORKGROUP_SIZE as u64;
    for _ in 0..workgroups[2] {
        for index in 0..per_layer {
            kernel(index as u32);
        }
    }
}

pub(crate) fn run(kind: PipelineKind, params: &[u8], b: &mut [Vec<u32>], workgroups: [u32; 3]) -> Result<()> {
    if b.len() != kind.storage_bindings().len() {
        return Err(VoxelGiError::Device(format!(
            "{} bound {} buffers, expected {}",
            kind.label(),
            b.len(),
            kind.storage_bindings().len()
        )));
    }
    match kind {
        PipelineKind::VoxelizeFragments => {
            let p: VoxelizeFragmentParams = read_params(kind, params)?;
            for_each_invocation(workgroups, |i| voxelize_fragments(i, &p, b));
        }
        PipelineKind::VoxelizeClipmap => {
            let p: ClipmapVoxelizeParams = read_params(kind, params)?;
            for_each_invocation(workgroups, |i| voxelize_clipmap(i, &p, b));
        }
        PipelineKind::ClearRegion => {
            let p: ClipmapPassParams = read_params(kind, params)?;
            for_each_invocation(workgroups, |i| clear_region(i, &p, b));
        }
        PipelineKind::BorderWrap => {
            let p: ClipmapPassParams = read_params(kind, params)?;
            for_each_invocation(workgroups, |i| border_wrap(i, &p, b));
        }
        PipelineKind::DownSample => {
            let p: ClipmapPassParams = read_params(kind, params)?;
            for_each_invocation(workgroups, |i| down_sample(i, &p, b));
        }
        PipelineKind::CopyAlpha => {
            let p: ClipmapPassParams = read_params(kind, params)?;
            for_each_invocation(workgroups, |i| copy_alpha(i, &p, b));
        }
        PipelineKind::OctreeInit => {
            let p: OctreeParams = read_params(kind, params)?;
            for_each_invocation(workgroups, |i| octree_init(i, &p, b));
        }
        PipelineKind::OctreeFlag => {
            let p: OctreeParams = read_params(kind, params)?;
            for_each_invocation(workgroups, |i| octree_flag(i, &p, b));
        }
        PipelineKind::OctreeAlloc => {
            let p: OctreeParams = read_params(kind, params)?;
            for_each_invocation(workgroups, |i| octree_alloc(i, &p, b));
        }
        PipelineKind::OctreeModifyArgs => {
            let p: OctreeParams = read_params(kind, params)?;
            for_each_invocation(workgroups, |i| octree_modify_args(i, &p, b));
        }
        PipelineKind::OctreeLeafAlloc => {
            let p: OctreeParams = read_params(kind, params)?;
            for_each_invocation(workgroups, |i| octree_leaf_alloc(i, &p, b));
        }
        PipelineKind::OctreeLeafWrite => {
            let p: OctreeParams = read_params(kind, params)?;
            for_each_invocation(workgroups, |i| octree_leaf_write(i, &p, b));
        }
        PipelineKind::OctreeMipmap => {
            let p: OctreeParams = read_params(kind, params)?;
            for_each_invocation(workgroups, |i| octree_mipmap(i, &p, b));
        }
    }
    Ok(())
}

fn triangle_vertex(tris: &[u32], tri: u32, k: u32) -> Vec3 {
    let base = (tri * 3 + k) * 4;
    Vec3::new(
        f32::from_bits(load(tris, base)),
        f32::from_bits(load(tris, base + 1)),
        f32::from_bits(load(tris, base + 2)),
    )
}

fn triangle_color(tris: &[u32], tri: u32) -> u32 {
    load(tris, tri * 12 + 3)
}

// tris, frag_counter, fragments
fn voxelize_fragments(i: u32, p: &VoxelizeFragmentParams, b: &mut [Vec<u32>]) {
    if i >= p.num_triangles {
        return;
    }
    let origin = Vec3::new(p.origin[0], p.origin[1], p.origin[2]);
    let grid = |k| (triangle_vertex(&b[0], i, k) - origin) * p.origin[3];
    let (v0, v1, v2) = (grid(0), grid(1), grid(2));
    let color = triangle_color(&b[0], i);

    let res = p.resolution as f32;
    let tri_min = v0.min(v1).min(v2);
    let tri_max = v0.max(v1).max(v2);
    if tri_max.cmplt(Vec3::ZERO).any() || tri_min.cmpge(Vec3::splat(res)).any() {
        return;
    }
    let lo = tri_min.floor().clamp(Vec3::ZERO, Vec3::splat(res - 1.0)).as_uvec3();
    let hi = tri_max.floor().clamp(Vec3::ZERO, Vec3::splat(res - 1.0)).as_uvec3();
    let half = Vec3::splat(0.5);

    for z in lo.z..=hi.z {
        for y in lo.y..=hi.y {
            for x in lo.x..=hi.x {
                let center = UVec3::new(x, y, z).as_vec3() + half;
                if triangle_box_overlap(center, half, v0, v1, v2) {
                    let slot = load(&b[1], 0);
                    store(&mut b[1], 0, slot.wrapping_add(1));
                    if slot < p.max_fragments {
                        store(&mut b[2], slot * 2, pack_position(UVec3::new(x, y, z)));
                        store(&mut b[2], slot * 2 + 1, color);
                    }
                }
            }
        }
    }
}

// tris, opacity, radiance
fn voxelize_clipmap(i: u32, p: &ClipmapVoxelizeParams, b: &mut [Vec<u32>]) {
    if i >= p.num_triangles {
        return;
    }
    let scale = |k| triangle_vertex(&b[0], i, k) / p.voxel_size;
    let (v0, v1, v2) = (scale(0), scale(1), scale(2));
    let color = triangle_color(&b[0], i) | 0xff00_0000;
    let level = p.region_min[3] as u32;

    let region_lo = Vec3::new(p.region_min[0] as f32, p.region_min[1] as f32, p.region_min[2] as f32);
    let region_hi = region_lo
        + Vec3::new(p.region_extent[0] as f32, p.region_extent[1] as f32, p.region_extent[2] as f32)
        - Vec3::ONE;
    let lo = v0.min(v1).min(v2).floor().max(region_lo).as_ivec3();
    let hi = v0.max(v1).max(v2).floor().min(region_hi).as_ivec3();
    if lo.cmpgt(hi).any() {
        return;
    }
    let half = Vec3::splat(0.5);

    for z in lo.z..=hi.z {
        for y in lo.y..=hi.y {
            for x in lo.x..=hi.x {
                let v = IVec3::new(x, y, z);
                if triangle_box_overlap(v.as_vec3() + half, half, v0, v1, v2) {
                    let t = texel_index(level, v, p.resolution, p.border);
                    let opacity = load_at(&b[1], t).max(0xffff_ffff);
                    store_at(&mut b[1], t, opacity);
                    let radiance = load_at(&b[2], t).max(color);
                    store_at(&mut b[2], t, radiance);
                }
            }
        }
    }
}

fn region_offset(i: u32, extent: [u32; 4]) -> Option<IVec3> {
    let count = extent[0].wrapping_mul(extent[1]).wrapping_mul(extent[2]);
    if i >= count {
        return None;
    }
    Some(
        UVec3::new(
            i % extent[0],
            (i / extent[0]) % extent[1],
            i / (extent[0] * extent[1]),
        )
        .as_ivec3(),
    )
}

fn region_min(p: &ClipmapPassParams) -> IVec3 {
    IVec3::new(p.region_min[0], p.region_min[1], p.region_min[2])
}

// opacity, radiance
fn clear_region(i: u32, p: &ClipmapPassParams, b: &mut [Vec<u32>]) {
    let Some(offset) = region_offset(i, p.region_extent) else {
        return;
    };
    let t = texel_index(p.level, region_min(p) + offset, p.resolution, p.border);
    store_at(&mut b[0], t, 0);
    store_at(&mut b[1], t, 0);
}

// opacity, radiance
fn border_wrap(i: u32, p: &ClipmapPassParams, b: &mut [Vec<u32>]) {
    let padded = p.resolution + 2 * p.border;
    if i >= padded * padded * padded {
        return;
    }
    let pos = UVec3::new(i % padded, (i / padded) % padded, i / (padded * padded));
    let end = p.border + p.resolution;
    if pos.cmpge(UVec3::splat(p.border)).all() && pos.cmplt(UVec3::splat(end)).all() {
        return;
    }
    let res = p.resolution as i32;
    let wrap = |c: u32| ((c as i32 - p.border as i32).rem_euclid(res)) as u32 + p.border;
    let q = UVec3::new(wrap(pos.x), wrap(pos.y), wrap(pos.z));
    let base = p.level * padded * padded * padded;
    let src = base + q.x + padded * (q.y + padded * q.z);
    let dst = base + i;
    let opacity = load(&b[0], src);
    store(&mut b[0], dst, opacity);
    let radiance = load(&b[1], src);
    store(&mut b[1], dst, radiance);
}

// volume
fn down_sample(i: u32, p: &ClipmapPassParams, b: &mut [Vec<u32>]) {
    let Some(offset) = region_offset(i, p.region_extent) else {
        return;
    };
    let coarse = region_min(p) + offset;
    let mut alpha_sum = 0u32;
    let mut rgb_sum = UVec3::ZERO;
    for k in 0..8u32 {
        let child = coarse * 2 + UVec3::new(k & 1, (k >> 1) & 1, (k >> 2) & 1).as_ivec3();
        let c = unpack_rgba8(load_at(&b[0], texel_index(p.level, child, p.resolution, p.border)));
        let alpha = c[3] as u32;
        alpha_sum += alpha;
        rgb_sum += UVec3::new(c[0] as u32, c[1] as u32, c[2] as u32) * alpha;
    }

    let alpha = (alpha_sum + 4) / 8;
    let out = if p.mode == DOWN_SAMPLE_OPACITY {
        pack_rgba8([alpha as u8; 4])
    } else if alpha_sum > 0 {
        let rgb = (rgb_sum + UVec3::splat(alpha_sum / 2)) / alpha_sum;
        pack_rgba8([rgb.x as u8, rgb.y as u8, rgb.z as u8, alpha as u8])
    } else {
        0
    };
    let t = texel_index(p.level + 1, coarse, p.resolution, p.border);
    store_at(&mut b[0], t, out);
}

// opacity, radiance
fn copy_alpha(i: u32, p: &ClipmapPassParams, b: &mut [Vec<u32>]) {
    let padded = p.resolution + 2 * p.border;
    let texels = padded * padded * padded;
    if i >= texels {
        return;
    }
    let t = p.level * texels + i;
    let value = (load(&b[1], t) & 0x00ff_ffff) | (load(&b[0], t) & 0xff00_0000);
    store(&mut b[1], t, value);
}

fn write_linear_args(args: &mut [u32], at: u32, invocations: u32) {
    let [x, y, z] = linear_workgroups(invocations);
    store(args, at, x);
    store(args, at + 1, y.max(1));
    store(args, at + 2, z);
}

fn level_begin(level: u32) -> u32 {
    STATE_LEVEL_BEGIN as u32 + level
}

fn level_args(level: u32) -> u32 {
    ARGS_LEVEL_BASE as u32 + 3 * level
}

// nodes, node_counter, brick_counter, build_state, dispatch_args, frag_counter
fn octree_init(i: u32, p: &OctreeParams, b: &mut [Vec<u32>]) {
    if i != 0 {
        return;
    }
    store(&mut b[0], 0, 0);
    store(&mut b[0], 1, 0);
    store(&mut b[1], 0, 1);
    store(&mut b[2], 0, 0);

    let fragments = load(&b[5], 0).min(p.max_fragments);
    store(&mut b[3], STATE_OVERFLOW as u32, 0);
    store(&mut b[3], STATE_FRAGMENT_COUNT as u32, fragments);
    store(&mut b[3], 2, 0);
    store(&mut b[3], 3, 0);
    for level in 0..=p.octree_level + 1 {
        store(&mut b[3], level_begin(level), 0);
    }
    store(&mut b[3], level_begin(1), 1);

    write_linear_args(&mut b[4], ARGS_FRAGMENTS as u32, fragments);
    for level in 0..=p.octree_level {
        write_linear_args(&mut b[4], level_args(level), 0);
    }
    write_linear_args(&mut b[4], level_args(0), 1);
}

fn fragment_position(packed: u32, shift: u32) -> UVec3 {
    unpack_position(packed) >> shift
}

// fragments, frag_counter, nodes
fn octree_flag(i: u32, p: &OctreeParams, b: &mut [Vec<u32>]) {
    if i >= load(&b[1], 0).min(p.max_fragments) {
        return;
    }
    let pos = fragment_position(load(&b[0], i * 2), p.fragment_shift);
    let mut node = 0u32;
    for depth in 0..p.level {
        let child = load(&b[2], node * 2) & NODE_CHILD_MASK;
        if child == 0 {
            return;
        }
        node = child + octant(pos, p.octree_level - 1 - depth);
    }
    let flagged = load(&b[2], node * 2) | NODE_FLAG;
    store(&mut b[2], node * 2, flagged);
}

// nodes, node_counter, build_state
fn octree_alloc(i: u32, p: &OctreeParams, b: &mut [Vec<u32>]) {
    if load(&b[2], STATE_OVERFLOW as u32) != 0 {
        return;
    }
    let node = load(&b[2], level_begin(p.level)) + i;
    if node >= load(&b[2], level_begin(p.level + 1)) {
        return;
    }
    let word = load(&b[0], node * 2);
    if word & NODE_FLAG == 0 {
        return;
    }
    let base = load(&b[1], 0);
    store(&mut b[1], 0, base.wrapping_add(8));
    if base.saturating_add(8) > p.max_nodes {
        let overflow = load(&b[2], STATE_OVERFLOW as u32) | OVERFLOW_NODES;
        store(&mut b[2], STATE_OVERFLOW as u32, overflow);
        return;
    }
    for k in 0..8 {
        store(&mut b[0], (base + k) * 2, 0);
        store(&mut b[0], (base + k) * 2 + 1, 0);
    }
    store(&mut b[0], node * 2, NODE_FLAG | base);
}

// node_counter, build_state, dispatch_args
fn octree_modify_args(i: u32, p: &OctreeParams, b: &mut [Vec<u32>]) {
    if i != 0 {
        return;
    }
    let end = load(&b[0], 0).min(p.max_nodes);
    let begin = load(&b[1], level_begin(p.level + 1));
    store(&mut b[1], level_begin(p.level + 2), end);
    write_linear_args(&mut b[2], level_args(p.level + 1), end.saturating_sub(begin));
}

// nodes, brick_counter, bricks, build_state
fn octree_leaf_alloc(i: u32, p: &OctreeParams, b: &mut [Vec<u32>]) {
    if load(&b[3], STATE_OVERFLOW as u32) != 0 {
        return;
    }
    let node = load(&b[3], level_begin(p.level)) + i;
    if node >= load(&b[3], level_begin(p.level + 1)) {
        return;
    }
    if load(&b[0], node * 2) & NODE_FLAG == 0 {
        return;
    }
    let brick = load(&b[1], 0);
    store(&mut b[1], 0, brick.wrapping_add(1));
    if brick >= p.max_bricks {
        let overflow = load(&b[3], STATE_OVERFLOW as u32) | OVERFLOW_BRICKS;
        store(&mut b[3], STATE_OVERFLOW as u32, overflow);
        return;
    }
    for k in 0..7 {
        store(&mut b[2], brick * 8 + k, 0);
    }
    store(&mut b[2], brick * 8 + BRICK_LEVEL as u32, p.level);
    store(&mut b[0], node * 2 + 1, brick + 1);
}

// fragments, frag_counter, nodes, bricks
fn octree_leaf_write(i: u32, p: &OctreeParams, b: &mut [Vec<u32>]) {
    if i >= load(&b[1], 0).min(p.max_fragments) {
        return;
    }
    let pos = fragment_position(load(&b[0], i * 2), p.fragment_shift);
    let mut node = 0u32;
    for depth in 0..p.octree_level {
        let child = load(&b[2], node * 2) & NODE_CHILD_MASK;
        if child == 0 {
            return;
        }
        node = child + octant(pos, p.octree_level - 1 - depth);
    }
    let payload = load(&b[2], node * 2 + 1);
    if payload == 0 {
        return;
    }
    let base = (payload - 1) * 8;
    let color = unpack_rgba8(load(&b[0], i * 2 + 1));
    for (channel, value) in color.iter().enumerate() {
        let at = base + (BRICK_SUM + channel) as u32;
        let sum = load(&b[3], at).wrapping_add(*value as u32);
        store(&mut b[3], at, sum);
    }
    let count = load(&b[3], base + BRICK_COUNT as u32) + 1;
    store(&mut b[3], base + BRICK_COUNT as u32, count);
}

fn finalize_leaf(node: u32, b: &mut [Vec<u32>]) {
    let payload = load(&b[0], node * 2 + 1);
    if payload == 0 {
        return;
    }
    let base = (payload - 1) * 8;
    let count = load(&b[2], base + BRICK_COUNT as u32);
    if count == 0 {
        return;
    }
    let mut average = [0u8; 4];
    for (channel, out) in average.iter_mut().enumerate() {
        let sum = load(&b[2], base + (BRICK_SUM + channel) as u32);
        *out = ((sum + count / 2) / count) as u8;
    }
    store(&mut b[2], base + BRICK_AVERAGE as u32, pack_rgba8(average));
}

fn mip_interior(node: u32, p: &OctreeParams, b: &mut [Vec<u32>]) {
    let child = load(&b[0], node * 2) & NODE_CHILD_MASK;
    if child == 0 {
        return;
    }
    let mut mask = 0u32;
    let mut present = 0u32;
    let mut count = 0u32;
    let mut sum = [0u32; 4];
    for k in 0..8 {
        let payload = load(&b[0], (child + k) * 2 + 1);
        if payload == 0 {
            continue;
        }
        let base = (payload - 1) * 8;
        let average = unpack_rgba8(load(&b[2], base + BRICK_AVERAGE as u32));
        for (total, value) in sum.iter_mut().zip(average) {
            *total += value as u32;
        }
        count += load(&b[2], base + BRICK_COUNT as u32);
        mask |= 1 << k;
        present += 1;
    }
    if present == 0 {
        return;
    }
    let brick = load(&b[1], 0);
    store(&mut b[1], 0, brick.wrapping_add(1));
    if brick >= p.max_bricks {
        let overflow = load(&b[3], STATE_OVERFLOW as u32) | OVERFLOW_BRICKS;
        store(&mut b[3], STATE_OVERFLOW as u32, overflow);
        return;
    }
    let base = brick * 8;
    for (channel, total) in sum.iter().enumerate() {
        store(&mut b[2], base + (BRICK_SUM + channel) as u32, *total);
    }
    store(&mut b[2], base + BRICK_COUNT as u32, count);
    let rgb = |channel: usize| ((sum[channel] + present / 2) / present) as u8;
    let average = pack_rgba8([rgb(0), rgb(1), rgb(2), ((sum[3] + 4) / 8) as u8]);
    store(&mut b[2], base + BRICK_AVERAGE as u32, average);
    store(&mut b[2], base + BRICK_CHILD_MASK as u32, mask);
    store(&mut b[2], base + BRICK_LEVEL as u32, p.level);
    store(&mut b[0], node * 2 + 1, brick + 1);
}

// nodes, brick_counter, bricks, build_state
fn octree_mipmap(i: u32, p: &OctreeParams, b: &mut [Vec<u32>]) {
    let node = load(&b[3], level_begin(p.level)) + i;
    if node >= load(&b[3], level_begin(p.level + 1)) {
        return;
    }
    if p.mode == MIPMAP_FINALIZE_LEAVES {
        finalize_leaf(node, b);
    } else if load(&b[3], STATE_OVERFLOW as u32) == 0 {
        mip_interior(node, p, b);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clip_params(resolution: u32, level: u32) -> ClipmapPassParams {
        ClipmapPassParams {
            region_min: [0; 4],
            region_extent: [0; 4],
            level,
            resolution,
            border: 1,
            mode: 0,
        }
    }

    #[test]
    fn border_wrap_copies_opposite_interior_face() {
        let resolution = 4;
        let padded = resolution + 2;
        let texels = (padded * padded * padded) as usize;
        let mut bufs = vec![vec![0u32; texels], vec![0u32; texels]];
        let source = texel_index(0, IVec3::new(3, 1, 2), resolution, 1);
        bufs[0][source] = 0xdead_beef;
        bufs[1][source] = 0x1234_5678;

        let p = clip_params(resolution, 0);
        for_each_invocation(linear_workgroups(texels as u32), |i| border_wrap(i, &p, &mut bufs));

        // World x = -1 wraps to interior x = 3 and is stored in border column 0.
        let border = (padded * (2 + padded * 3)) as usize;
        assert_eq!(bufs[0][border], 0xdead_beef);
        assert_eq!(bufs[1][border], 0x1234_5678);
    }

    #[test]
    fn copy_alpha_only_touches_alpha() {
        let resolution = 4;
        let padded = resolution + 2;
        let texels = (padded * padded * padded) as usize;
        let mut bufs = vec![vec![0xaa00_0000u32; texels], vec![0x0011_2233u32; texels]];
        let p = clip_params(resolution, 0);
        for_each_invocation(linear_workgroups(texels as u32), |i| copy_alpha(i, &p, &mut bufs));
        assert!(bufs[1].iter().all(|&t| t == 0xaa11_2233));
    }

    #[test]
    fn radiance_down_sample_weights_by_alpha() {
        let resolution = 4;
        let padded = resolution + 2;
        let texels = (padded * padded * padded) as usize;
        let mut bufs = vec![vec![0u32; texels * 2]];
        bufs[0][texel_index(0, IVec3::new(0, 0, 0), resolution, 1)] = pack_rgba8([200, 0, 0, 255]);
        bufs[0][texel_index(0, IVec3::new(1, 0, 0), resolution, 1)] = pack_rgba8([0, 200, 0, 0]);

        let p = ClipmapPassParams {
            region_min: [0; 4],
            region_extent: [1, 1, 1, 0],
            mode: DOWN_SAMPLE_RADIANCE,
            ..clip_params(resolution, 0)
        };
        for_each_invocation([1, 1, 1], |i| down_sample(i, &p, &mut bufs));
        let coarse = unpack_rgba8(bufs[0][texel_index(1, IVec3::ZERO, resolution, 1)]);
        assert_eq!(coarse, [200, 0, 0, 32]);
    }
}
