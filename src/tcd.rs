//! The tile processor (component J, §4.J): sequences DC level shift,
//! MCT, DWT, T1 and T2 for one tile in either direction.

use crate::dwt;
use crate::image::sample_range;
use crate::mct;
use crate::params::{MctMode, TileCodingParameters};
use crate::pi::ComponentLayout;
use crate::rate_control::{allocate_layer_simple, CblkCandidates};
use crate::t1::{self, Orientation};

/// One tile-component's working buffer through the pipeline: DC-shifted
/// samples, transformed in place by MCT/DWT, then handed to T1 per
/// code-block.
pub struct TileComponentBuffer {
    pub width: u32,
    pub height: u32,
    pub data: Vec<i32>,
    pub dc_shift: i32,
    pub signed: bool,
    pub numresolutions: u32,
}

pub struct Tile {
    pub components: Vec<TileComponentBuffer>,
}

/// One code-block's encoded form plus its rate/distortion candidates.
/// Code-blocks are grouped per resolution by the `Vec<Vec<_>>` nesting
/// `compress_tile`/`decode_tile_component` use, so this struct itself
/// doesn't need to carry its resolution back.
pub struct EncodedCblk {
    pub data: Vec<u8>,
    pub passes: Vec<t1::PassInfo>,
    pub w: u32,
    pub h: u32,
    /// Bit-planes actually coded; `numbps_max(tccp) - numbps` is the
    /// "missing MSBs" count a packet header signals via the IMSB tag tree.
    pub numbps: u32,
}

/// The code-block grid for one rectangle, `(x, y, w, h)` per block in
/// raster order, offsets relative to the rectangle's own origin.
pub fn cblk_grid(width: u32, height: u32, cblk_w: u32, cblk_h: u32) -> Vec<(u32, u32, u32, u32)> {
    let mut out = Vec::new();
    for by in (0..height).step_by(cblk_h as usize) {
        for bx in (0..width).step_by(cblk_w as usize) {
            let w = cblk_w.min(width - bx);
            let h = cblk_h.min(height - by);
            out.push((bx, by, w, h));
        }
    }
    out
}

/// Splits one tile-component's transformed `width x height` plane into
/// its per-resolution subbands (§4.F): resolution 0 is the final LL
/// band alone; each resolution `r >= 1` contributes the HL/LH/HH bands
/// produced by the decomposition level that built resolution `r` from
/// `r - 1`. This relies on `dwt::encode_53`/`encode_97` leaving the
/// transformed buffer in the standard compacted Mallat layout (LL in
/// the top-left corner at every scale) rather than spatially
/// interleaved samples.
fn subband_regions(width: u32, height: u32, numresolutions: u32) -> Vec<(u32, Orientation, u32, u32, u32, u32)> {
    let mut levels = Vec::new();
    let mut w = width;
    let mut h = height;
    for i in 0..numresolutions.saturating_sub(1) {
        let half_w = w.div_ceil(2);
        let half_h = h.div_ceil(2);
        levels.push((numresolutions - 1 - i, w, h, half_w, half_h));
        w = half_w;
        h = half_h;
        if w <= 1 && h <= 1 {
            break;
        }
    }
    let mut out = vec![(0, Orientation::Ll, 0, 0, w.max(1), h.max(1))];
    for (resolution, wi, hi, half_w, half_h) in levels.into_iter().rev() {
        if half_w < wi {
            out.push((resolution, Orientation::Hl, half_w, 0, wi - half_w, half_h));
        }
        if half_h < hi {
            out.push((resolution, Orientation::Lh, 0, half_h, half_w, hi - half_h));
        }
        if half_w < wi && half_h < hi {
            out.push((resolution, Orientation::Hh, half_w, half_h, wi - half_w, hi - half_h));
        }
    }
    out
}

/// Full per-code-block layout for one tile-component's transformed
/// plane: every code-block's resolution, subband orientation and pixel
/// rectangle, in the canonical order both `compress_tile` and
/// `decode_tile_component` (and the packet emitter/parser in
/// `crate::j2k`) group by: ascending resolution, subband raster order
/// within a resolution, code-block raster order within a subband.
pub fn component_cblk_layout(
    width: u32,
    height: u32,
    numresolutions: u32,
    cblk_w: u32,
    cblk_h: u32,
) -> Vec<(u32, Orientation, u32, u32, u32, u32)> {
    let mut out = Vec::new();
    for (resolution, orientation, bx, by, w, h) in subband_regions(width, height, numresolutions) {
        for (lx, ly, lw, lh) in cblk_grid(w, h, cblk_w, cblk_h) {
            out.push((resolution, orientation, bx + lx, by + ly, lw, lh));
        }
    }
    out
}

/// The magnitude bit-plane bound `Mb` a code-block codes down from,
/// derived from the quantization exponent the same way on both
/// compress and decompress so `numbps` never needs transmitting
/// directly — only `missing_msbs` relative to this bound does (§4.E,
/// §4.H). The simplified single-subband model here uses the
/// tile-component's first step size as that exponent.
pub fn numbps_max(tccp: &crate::params::TileComponentCodingParameters) -> u32 {
    let expn = tccp.step_sizes.first().map(|s| s.expn).unwrap_or(tccp.guard_bits + 8);
    (tccp.guard_bits + expn).saturating_sub(1).max(1)
}

fn dc_level_shift_forward(buf: &mut TileComponentBuffer) {
    if !buf.signed {
        for v in buf.data.iter_mut() {
            *v -= buf.dc_shift;
        }
    }
}

fn dc_level_shift_inverse(buf: &mut TileComponentBuffer) {
    if !buf.signed {
        for v in buf.data.iter_mut() {
            *v += buf.dc_shift;
        }
    }
}

/// Runs the forward multi-component transform across the first three
/// components, matching the standard YCbCr-style convention; Part-2
/// explicit-matrix mode runs across however many components the MCC
/// record names.
fn mct_forward(tile: &mut Tile, mode: MctMode, reversible: bool) {
    match mode {
        MctMode::None => {}
        MctMode::Rct if tile.components.len() >= 3 => {
            if reversible {
                let (c0, rest) = tile.components.split_at_mut(1);
                let (c1, c2) = rest.split_at_mut(1);
                mct::rct_forward(&mut c0[0].data, &mut c1[0].data, &mut c2[0].data);
            } else {
                let mut f0: Vec<f32> = tile.components[0].data.iter().map(|&v| v as f32).collect();
                let mut f1: Vec<f32> = tile.components[1].data.iter().map(|&v| v as f32).collect();
                let mut f2: Vec<f32> = tile.components[2].data.iter().map(|&v| v as f32).collect();
                mct::ict_forward(&mut f0, &mut f1, &mut f2);
                for (dst, src) in [
                    (&mut tile.components[0].data, &f0),
                    (&mut tile.components[1].data, &f1),
                    (&mut tile.components[2].data, &f2),
                ] {
                    for (d, s) in dst.iter_mut().zip(src.iter()) {
                        *d = s.round() as i32;
                    }
                }
            }
        }
        _ => {}
    }
}

fn mct_inverse(tile: &mut Tile, mode: MctMode, reversible: bool) {
    match mode {
        MctMode::None => {}
        MctMode::Rct if tile.components.len() >= 3 => {
            if reversible {
                let (c0, rest) = tile.components.split_at_mut(1);
                let (c1, c2) = rest.split_at_mut(1);
                mct::rct_inverse(&mut c0[0].data, &mut c1[0].data, &mut c2[0].data);
            } else {
                let mut f0: Vec<f32> = tile.components[0].data.iter().map(|&v| v as f32).collect();
                let mut f1: Vec<f32> = tile.components[1].data.iter().map(|&v| v as f32).collect();
                let mut f2: Vec<f32> = tile.components[2].data.iter().map(|&v| v as f32).collect();
                mct::ict_inverse(&mut f0, &mut f1, &mut f2);
                for (dst, src) in [
                    (&mut tile.components[0].data, &f0),
                    (&mut tile.components[1].data, &f1),
                    (&mut tile.components[2].data, &f2),
                ] {
                    for (d, s) in dst.iter_mut().zip(src.iter()) {
                        *d = s.round() as i32;
                    }
                }
            }
        }
        _ => {}
    }
}

/// Runs the compress pipeline (§4.J "Compress pipeline", steps 1-2): DC
/// shift, MCT, DWT, then per-code-block T1 encode, returning each
/// tile-component's code-blocks grouped by resolution (outer index)
/// so the packet emitter can honour §4.F/§4.H's per-resolution packet
/// structure instead of treating a component as one flat code-block set.
pub fn compress_tile(
    tile: &mut Tile,
    tcp: &TileCodingParameters,
    reversible: bool,
    cblk_w: u32,
    cblk_h: u32,
) -> Vec<Vec<Vec<EncodedCblk>>> {
    for buf in tile.components.iter_mut() {
        dc_level_shift_forward(buf);
    }
    mct_forward(tile, tcp.mct, reversible);

    let mut per_component = Vec::with_capacity(tile.components.len());
    for (buf, tccp) in tile.components.iter_mut().zip(tcp.tccps.iter()) {
        if reversible {
            dwt::encode_53(&mut buf.data, buf.width, buf.height, buf.numresolutions);
        } else {
            let mut f: Vec<f32> = buf.data.iter().map(|&v| v as f32).collect();
            dwt::encode_97(&mut f, buf.width, buf.height, buf.numresolutions);
            for (d, s) in buf.data.iter_mut().zip(f.iter()) {
                *d = s.round() as i32;
            }
        }

        let nb_max = numbps_max(tccp);
        let mut by_resolution: Vec<Vec<EncodedCblk>> = (0..buf.numresolutions).map(|_| Vec::new()).collect();
        for (resolution, orientation, bx, by, w, h) in
            component_cblk_layout(buf.width, buf.height, buf.numresolutions, cblk_w, cblk_h)
        {
            let mut samples = vec![0i32; (w * h) as usize];
            for y in 0..h {
                for x in 0..w {
                    let src = ((by + y) * buf.width + bx + x) as usize;
                    samples[(y * w + x) as usize] = buf.data[src];
                }
            }
            let peak = samples.iter().map(|s| s.unsigned_abs()).max().unwrap_or(0);
            let numbps = (32 - peak.leading_zeros()).clamp(1, nb_max);
            let result = t1::encode_cblk(&samples, w, h, numbps, orientation, tccp.cblk_style);
            by_resolution[resolution as usize].push(EncodedCblk { data: result.data, passes: result.passes, w, h, numbps });
        }
        per_component.push(by_resolution);
    }
    per_component
}

/// Reassembles one tile-component's transformed plane from its decoded
/// code-blocks (§4.J "Decompress pipeline", step 3: T1 decode then
/// scatter into the plane T2 handed over per code-block), `cblks`
/// grouped by resolution the same way `compress_tile` produces them.
pub fn decode_tile_component(
    buf: &mut TileComponentBuffer,
    tccp: &crate::params::TileComponentCodingParameters,
    cblk_w: u32,
    cblk_h: u32,
    cblks: &[Vec<(Vec<u8>, u32)>],
) {
    let mut next_in_resolution = vec![0usize; cblks.len()];
    for (resolution, orientation, bx, by, w, h) in
        component_cblk_layout(buf.width, buf.height, buf.numresolutions, cblk_w, cblk_h)
    {
        let res = resolution as usize;
        let Some((data, numbps)) = cblks.get(res).and_then(|g| g.get(next_in_resolution[res])) else {
            continue;
        };
        next_in_resolution[res] += 1;
        let samples = if *numbps == 0 {
            vec![0i32; (w * h) as usize]
        } else {
            t1::decode_cblk(data, w, h, *numbps, orientation, tccp.cblk_style, tccp.roi_shift)
        };
        for y in 0..h {
            for x in 0..w {
                let dst = ((by + y) * buf.width + bx + x) as usize;
                buf.data[dst] = samples[(y * w + x) as usize];
            }
        }
    }
}

/// Runs the decompress pipeline's final stage (§4.J "Decompress
/// pipeline", step 4): T1 decode already happened per code-block; this
/// reassembles, inverse-DWTs, inverse-MCTs, and applies the DC level
/// shift + clamp into each component's declared `(prec, sgnd)` range.
pub fn finish_decompress_tile(
    tile: &mut Tile,
    tcp: &TileCodingParameters,
    reversible: bool,
    precisions: &[(u32, bool)],
) {
    mct_inverse(tile, tcp.mct, reversible);
    for (buf, &(prec, sgnd)) in tile.components.iter_mut().zip(precisions) {
        if reversible {
            dwt::decode_53(&mut buf.data, buf.width, buf.height, buf.numresolutions);
        } else {
            let mut f: Vec<f32> = buf.data.iter().map(|&v| v as f32).collect();
            dwt::decode_97(&mut f, buf.width, buf.height, buf.numresolutions);
            for (d, s) in buf.data.iter_mut().zip(f.iter()) {
                *d = s.round() as i32;
            }
        }
        dc_level_shift_inverse(buf);
        let (lo, hi) = sample_range(prec, sgnd);
        for v in buf.data.iter_mut() {
            *v = (*v).clamp(lo, hi);
        }
    }
}

/// Builds the packet iterator's per-component layout from a tile's
/// coding parameters, used by both compress (to order T2 emission) and
/// decompress (to order T2 parsing).
pub fn build_component_layouts(tcp: &TileCodingParameters) -> Vec<ComponentLayout> {
    tcp.tccps
        .iter()
        .map(|tccp| ComponentLayout {
            numresolutions: tccp.numresolutions,
            dx: 1,
            dy: 1,
            precinct_grid: vec![(1, 1); tccp.numresolutions as usize],
            precinct_exp: tccp.precinct_size.clone(),
        })
        .collect()
}

/// Allocates rate-distortion layers for one tile-component's
/// code-blocks, following §4.I: fixed-rate layers get a byte target
/// derived from `tcp.layer_rate`, fixed-quality layers pass `None` and
/// keep every remaining pass in the final (lossless) layer.
pub fn allocate_layers(tcp: &TileCodingParameters, cblks: &[EncodedCblk]) -> Vec<crate::rate_control::LayerAssignment> {
    let candidates: Vec<CblkCandidates> = cblks.iter().map(|c| CblkCandidates { passes: &c.passes }).collect();
    let mut layers = Vec::with_capacity(tcp.num_layers as usize);
    for layer in 0..tcp.num_layers {
        let target = tcp.layer_rate.get(layer as usize).copied().filter(|&r| r > 0.0);
        let target_bytes = target.map(|r| r as u32);
        layers.push(allocate_layer_simple(&candidates, target_bytes));
    }
    layers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{CblkStyle, MctMode, ProgressionOrder, TileComponentCodingParameters};

    fn tccp() -> TileComponentCodingParameters {
        let mut t = TileComponentCodingParameters::default_for(3, 1);
        t.cblk_style = CblkStyle::empty();
        t
    }

    fn single_tile_tcp() -> TileCodingParameters {
        TileCodingParameters {
            num_layers: 1,
            prg: ProgressionOrder::Lrcp,
            mct: MctMode::None,
            mct_matrix: None,
            layer_rate: Vec::new(),
            layer_distortion: Vec::new(),
            poc: Vec::new(),
            csty_sop: false,
            csty_eph: false,
            csty_explicit_precincts: false,
            tccps: vec![tccp()],
        }
    }

    #[test]
    fn subband_regions_cover_the_plane_exactly_once() {
        let regions = subband_regions(16, 16, 3);
        // Resolution 0 is the LL band alone; every later resolution
        // contributes exactly its HL/LH/HH triple.
        assert_eq!(regions.iter().filter(|r| r.0 == 0).count(), 1);
        for res in 1..3u32 {
            let orientations: Vec<Orientation> = regions.iter().filter(|r| r.0 == res).map(|r| r.1).collect();
            assert_eq!(orientations.len(), 3);
            assert!(orientations.contains(&Orientation::Hl));
            assert!(orientations.contains(&Orientation::Lh));
            assert!(orientations.contains(&Orientation::Hh));
        }
        let total_area: u64 = regions.iter().map(|r| (r.4 * r.5) as u64).sum();
        assert_eq!(total_area, 16 * 16);
    }

    #[test]
    fn component_cblk_layout_tiles_every_subband_region() {
        let layout = component_cblk_layout(20, 12, 2, 8, 8);
        let total_area: u64 = layout.iter().map(|&(_, _, _, _, w, h)| (w * h) as u64).sum();
        assert_eq!(total_area, 20 * 12);
        // resolution 0 is the LL band, smaller than a whole code-block.
        assert!(layout.iter().any(|&(res, orient, ..)| res == 0 && orient == Orientation::Ll));
    }

    #[test]
    fn dwt_roundtrip_matches_finish_decompress_path() {
        let w = 16u32;
        let h = 16u32;
        let orig: Vec<i32> = (0..(w * h) as i32).map(|i| (i * 37) % 200 - 30).collect();

        let mut tile = Tile {
            components: vec![TileComponentBuffer {
                width: w,
                height: h,
                data: orig.clone(),
                dc_shift: 0,
                signed: true,
                numresolutions: 3,
            }],
        };
        let tcp = single_tile_tcp();
        let _cblks = compress_tile(&mut tile, &tcp, true, 64, 64);

        // The forward DWT mutated `tile` in place; run its inverse
        // directly (bypassing T1/T2, which are exercised in t1.rs/t2.rs)
        // to confirm the pipeline wiring reconstructs the original tile.
        dwt::decode_53(&mut tile.components[0].data, w, h, 3);
        assert_eq!(tile.components[0].data, orig);

        let mut tile2 = Tile {
            components: vec![TileComponentBuffer {
                width: w,
                height: h,
                data: orig.clone(),
                dc_shift: 0,
                signed: true,
                numresolutions: 1,
            }],
        };
        finish_decompress_tile(&mut tile2, &tcp, true, &[(8, true)]);
        assert_eq!(tile2.components[0].data, orig);
    }

    #[test]
    fn allocate_layers_produces_one_assignment_per_layer() {
        let w = 8u32;
        let h = 8u32;
        let samples: Vec<i32> = (0..64).map(|i| (i * 5) % 40 - 20).collect();
        let numbps = 32 - samples.iter().map(|s| s.unsigned_abs()).max().unwrap().leading_zeros();
        let result = t1::encode_cblk(&samples, w, h, numbps, Orientation::Ll, CblkStyle::empty());
        let cblks = vec![EncodedCblk { data: result.data, passes: result.passes, w, h, numbps }];

        let mut tcp = single_tile_tcp();
        tcp.num_layers = 2;
        let layers = allocate_layers(&tcp, &cblks);
        assert_eq!(layers.len(), 2);
    }
}
