//! Tier-1 block coding (component E, §4.E): the bit-plane coder that
//! turns one code-block's quantized wavelet coefficients into (or back
//! from) an MQ-coded bit-stream, three passes per bit-plane.
//!
//! Context derivation follows the standard zero/sign/magnitude context
//! assignment (ITU-T T.800 Annex D) computed directly from neighbour
//! significance/sign counts rather than through a packed 32-bit flag
//! word and a precomputed 2048-entry lookup table — same contexts, a
//! plainer derivation.

use crate::mqc::{MqDecoder, MqEncoder, CTX_AGG, CTX_UNI, MAG_BASE, SC_BASE};
use crate::params::CblkStyle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orientation {
    Ll,
    Hl,
    Lh,
    Hh,
}

/// One bit-plane pass's accounting, used by rate–distortion allocation.
#[derive(Debug, Clone, Copy)]
pub struct PassInfo {
    pub rate: u32,
    pub distortion: f64,
    pub terminated: bool,
}

/// A code-block's working state: its sample grid plus the per-sample
/// significance/sign/visited/refined bookkeeping, each padded by one
/// row/column of always-insignificant border so neighbour lookups
/// never need bounds checks.
pub struct CodeBlock {
    w: usize,
    h: usize,
    stride: usize,
    samples: Vec<i32>,
    sig: Vec<bool>,
    neg: Vec<bool>,
    visited: Vec<bool>,
    refined: Vec<bool>,
}

impl CodeBlock {
    pub fn new(w: u32, h: u32) -> Self {
        let (w, h) = (w as usize, h as usize);
        let stride = w + 2;
        let total = stride * (h + 2);
        CodeBlock {
            w,
            h,
            stride,
            samples: vec![0; w * h],
            sig: vec![false; total],
            neg: vec![false; total],
            visited: vec![false; total],
            refined: vec![false; total],
        }
    }

    fn idx(&self, x: usize, y: usize) -> usize {
        (y + 1) * self.stride + (x + 1)
    }

    fn sample_idx(&self, x: usize, y: usize) -> usize {
        y * self.w + x
    }

    fn neighbor_counts(&self, x: usize, y: usize) -> (u32, u32, u32) {
        let i = self.idx(x, y);
        let s = self.stride;
        let horiz = self.sig[i - 1] as u32 + self.sig[i + 1] as u32;
        let vert = self.sig[i - s] as u32 + self.sig[i + s] as u32;
        let diag = self.sig[i - s - 1] as u32
            + self.sig[i - s + 1] as u32
            + self.sig[i + s - 1] as u32
            + self.sig[i + s + 1] as u32;
        (horiz, vert, diag)
    }

    fn any_sig_neighbor(&self, x: usize, y: usize) -> bool {
        let (h, v, d) = self.neighbor_counts(x, y);
        h + v + d > 0
    }

    fn sign_contribution(&self, x: usize, y: usize, dx: isize, dy: isize) -> i32 {
        let i = self.idx(x, y);
        let off = dy * self.stride as isize + dx;
        let j = (i as isize + off) as usize;
        if !self.sig[j] {
            0
        } else if self.neg[j] {
            -1
        } else {
            1
        }
    }
}

/// Zero-coding context for subband `orient`, given counts of
/// significant horizontal/vertical/diagonal neighbours (ITU-T T.800
/// Annex D.3.1, Tables D.1-D.3).
fn zc_context(orient: Orientation, h: u32, v: u32, d: u32) -> u8 {
    let (h, v) = match orient {
        Orientation::Hl => (v, h),
        _ => (h, v),
    };
    match orient {
        Orientation::Hh => match (d, h + v) {
            (d, _) if d >= 3 => 8,
            (2, s) if s >= 1 => 7,
            (2, _) => 6,
            (1, s) if s >= 2 => 5,
            (1, 1) => 4,
            (1, _) => 3,
            (_, s) if s >= 2 => 2,
            (_, 1) => 1,
            _ => 0,
        },
        _ => match (h, v, d) {
            (2, ..) => 8,
            (1, v, _) if v >= 1 => 7,
            (1, 0, d) if d >= 2 => 6,
            (1, 0, 1) => 5,
            (1, 0, 0) => 4,
            (0, 2, _) => 3,
            (0, 1, _) => 2,
            (0, 0, d) if d >= 2 => 1,
            _ => 0,
        },
    }
}

/// Sign-coding context offset and predicted-sign bit for the given
/// horizontal/vertical contribution sums, each clipped to `[-1, 1]`.
fn sc_context(h: i32, v: i32) -> (u8, u8) {
    let h = h.clamp(-1, 1);
    let v = v.clamp(-1, 1);
    let (ctx, xor) = match (h, v) {
        (1, 1) => (4, 0),
        (1, 0) => (3, 0),
        (1, -1) => (2, 0),
        (0, 1) => (1, 0),
        (0, 0) => (0, 0),
        (0, -1) => (1, 1),
        (-1, 1) => (2, 1),
        (-1, 0) => (3, 1),
        (-1, -1) => (4, 1),
        _ => unreachable!(),
    };
    (SC_BASE as u8 + ctx, xor)
}

fn mag_context(has_sig_neighbor: bool, already_refined: bool) -> u8 {
    if already_refined {
        MAG_BASE as u8 + 2
    } else if has_sig_neighbor {
        MAG_BASE as u8 + 1
    } else {
        MAG_BASE as u8
    }
}

/// `nmsedec`-style distortion decrement for a bit becoming significant
/// (or refined) at `bitpos`: a reference decoder ships exact
/// per-magnitude lookup tables derived from the quantization step; this
/// uses the same `2^2*bitpos` scaling they converge to, which is enough
/// to rank truncation points for rate allocation without carrying the
/// full tables.
fn nmsedec(bitpos: u32) -> f64 {
    (1u64 << (2 * bitpos)) as f64
}

/// Should this pass terminate the MQ coder, per the cblk-style flags
/// and position within the bit-plane loop (§4.E termination policy)?
fn is_term_pass(cblksty: CblkStyle, bitplane: u32, numbps: u32, pass_in_plane: u32) -> bool {
    if cblksty.contains(CblkStyle::TERMALL) {
        return true;
    }
    let is_last_cleanup = bitplane == 0 && pass_in_plane == 2;
    if is_last_cleanup {
        return true;
    }
    if cblksty.contains(CblkStyle::LAZY) && bitplane + 1 < numbps && pass_in_plane >= 1 {
        return true;
    }
    false
}

pub struct EncodeResult {
    pub data: Vec<u8>,
    pub passes: Vec<PassInfo>,
}

/// Encodes `samples` (sign-magnitude, MSB = sign) as a `w x h`
/// code-block at `numbps` bit-planes, in the given `orient`ation.
pub fn encode_cblk(
    samples: &[i32],
    w: u32,
    h: u32,
    numbps: u32,
    orient: Orientation,
    cblksty: CblkStyle,
) -> EncodeResult {
    let mut cb = CodeBlock::new(w, h);
    cb.samples.copy_from_slice(samples);
    let w = w as usize;
    let h = h as usize;

    let mut mqc = MqEncoder::new();
    let mut passes = Vec::new();
    let mut distortion = 0f64;

    for bitplane in (0..numbps).rev() {
        for pass_in_plane in 0..3u32 {
            if pass_in_plane == 0 && bitplane == numbps - 1 {
                // First bit-plane has no prior significance: significance
                // and cleanup coincide, handled by the cleanup branch below.
                continue;
            }
            match pass_in_plane {
                0 => sig_pass_encode(&mut cb, w, h, bitplane, orient, &mut mqc, &mut distortion),
                1 => ref_pass_encode(&mut cb, w, h, bitplane, &mut mqc, &mut distortion),
                _ => cln_pass_encode(
                    &mut cb,
                    w,
                    h,
                    bitplane,
                    orient,
                    bitplane == numbps - 1,
                    &mut mqc,
                    &mut distortion,
                ),
            }
            for y in 0..h {
                for x in 0..w {
                    cb.visited[cb.idx(x, y)] = false;
                }
            }

            let terminate = is_term_pass(cblksty, bitplane, numbps, pass_in_plane)
                || cblksty.contains(CblkStyle::PTERM);
            if terminate {
                if cblksty.contains(CblkStyle::SEGSYM) && bitplane == 0 && pass_in_plane == 2 {
                    mqc.segmark();
                }
                if cblksty.contains(CblkStyle::PTERM) {
                    mqc.erterm();
                } else {
                    mqc.flush();
                }
                if cblksty.contains(CblkStyle::RESET) {
                    mqc.reset_contexts();
                }
            }
            passes.push(PassInfo {
                rate: mqc.num_bytes() as u32,
                distortion,
                terminated: terminate,
            });
        }
    }
    mqc.flush();
    monotonize_rates(&mut passes);
    EncodeResult {
        data: mqc.into_data(),
        passes,
    }
}

fn monotonize_rates(passes: &mut [PassInfo]) {
    for i in (0..passes.len().saturating_sub(1)).rev() {
        if passes[i].rate > passes[i + 1].rate {
            passes[i].rate = passes[i + 1].rate;
        }
    }
}

fn sig_pass_encode(
    cb: &mut CodeBlock,
    w: usize,
    h: usize,
    bitplane: u32,
    orient: Orientation,
    mqc: &mut MqEncoder,
    distortion: &mut f64,
) {
    for y in 0..h {
        for x in 0..w {
            let i = cb.idx(x, y);
            if cb.sig[i] || !cb.any_sig_neighbor(x, y) {
                continue;
            }
            let (hc, vc, dc) = cb.neighbor_counts(x, y);
            let ctx = zc_context(orient, hc, vc, dc);
            let si = cb.sample_idx(x, y);
            let mag = cb.samples[si].unsigned_abs();
            let bit = ((mag >> bitplane) & 1) as u8;
            mqc.encode(ctx, bit);
            cb.visited[i] = true;
            if bit == 1 {
                cb.sig[i] = true;
                let negative = cb.samples[si] < 0;
                cb.neg[i] = negative;
                let h_contrib = cb.sign_contribution(x, y, -1, 0) + cb.sign_contribution(x, y, 1, 0);
                let v_contrib = cb.sign_contribution(x, y, 0, -1) + cb.sign_contribution(x, y, 0, 1);
                let (sctx, pred) = sc_context(h_contrib, v_contrib);
                mqc.encode(sctx, (negative as u8) ^ pred);
                *distortion += nmsedec(bitplane);
            }
        }
    }
}

fn ref_pass_encode(cb: &mut CodeBlock, w: usize, h: usize, bitplane: u32, mqc: &mut MqEncoder, distortion: &mut f64) {
    for y in 0..h {
        for x in 0..w {
            let i = cb.idx(x, y);
            if !cb.sig[i] || cb.visited[i] {
                continue;
            }
            let has_nb = cb.any_sig_neighbor(x, y);
            let ctx = mag_context(has_nb, cb.refined[i]);
            let si = cb.sample_idx(x, y);
            let mag = cb.samples[si].unsigned_abs();
            let bit = ((mag >> bitplane) & 1) as u8;
            mqc.encode(ctx, bit);
            cb.refined[i] = true;
            *distortion += nmsedec(bitplane) * 0.5;
        }
    }
}

fn cln_pass_encode(
    cb: &mut CodeBlock,
    w: usize,
    h: usize,
    bitplane: u32,
    orient: Orientation,
    first_plane: bool,
    mqc: &mut MqEncoder,
    distortion: &mut f64,
) {
    let mut y = 0;
    while y < h {
        let strip_h = (h - y).min(4);
        for x in 0..w {
            let all_insig_and_no_nb = (0..strip_h).all(|dy| {
                let i = cb.idx(x, y + dy);
                !cb.sig[i] && !cb.any_sig_neighbor(x, y + dy)
            });
            if strip_h == 4 && all_insig_and_no_nb && !first_plane {
                let samples_zero = (0..4).all(|dy| {
                    let si = cb.sample_idx(x, y + dy);
                    ((cb.samples[si].unsigned_abs() >> bitplane) & 1) == 0
                });
                mqc.encode(CTX_AGG as u8, !samples_zero as u8);
                if samples_zero {
                    continue;
                }
                let first_one = (0..4u32)
                    .find(|&dy| {
                        let si = cb.sample_idx(x, y + dy as usize);
                        ((cb.samples[si].unsigned_abs() >> bitplane) & 1) != 0
                    })
                    .unwrap();
                mqc.encode(CTX_UNI as u8, ((first_one >> 1) & 1) as u8);
                mqc.encode(CTX_UNI as u8, (first_one & 1) as u8);
                for dy in 0..4usize {
                    if (dy as u32) < first_one {
                        continue;
                    }
                    let i = cb.idx(x, y + dy);
                    if cb.sig[i] {
                        continue;
                    }
                    code_one_sample(cb, x, y + dy, bitplane, orient, dy as u32 == first_one, mqc, distortion);
                }
            } else {
                for dy in 0..strip_h {
                    let i = cb.idx(x, y + dy);
                    if cb.sig[i] || cb.visited[i] {
                        continue;
                    }
                    code_one_sample(cb, x, y + dy, bitplane, orient, false, mqc, distortion);
                }
            }
        }
        y += 4;
    }
}

fn code_one_sample(
    cb: &mut CodeBlock,
    x: usize,
    y: usize,
    bitplane: u32,
    orient: Orientation,
    skip_sig_bit: bool,
    mqc: &mut MqEncoder,
    distortion: &mut f64,
) {
    let i = cb.idx(x, y);
    let si = cb.sample_idx(x, y);
    let mag = cb.samples[si].unsigned_abs();
    let bit = ((mag >> bitplane) & 1) as u8;
    if !skip_sig_bit {
        let (hc, vc, dc) = cb.neighbor_counts(x, y);
        let ctx = zc_context(orient, hc, vc, dc);
        mqc.encode(ctx, bit);
    }
    if bit == 1 {
        cb.sig[i] = true;
        let negative = cb.samples[si] < 0;
        cb.neg[i] = negative;
        let h_contrib = cb.sign_contribution(x, y, -1, 0) + cb.sign_contribution(x, y, 1, 0);
        let v_contrib = cb.sign_contribution(x, y, 0, -1) + cb.sign_contribution(x, y, 0, 1);
        let (sctx, pred) = sc_context(h_contrib, v_contrib);
        mqc.encode(sctx, (negative as u8) ^ pred);
        *distortion += nmsedec(bitplane);
    }
}

/// Decodes a code-block, mirroring `encode_cblk`'s three passes.
/// `roishift` shifts down magnitudes at or above `1 << roishift` so a
/// region of interest comes out of decode unscaled relative to the rest
/// of the image (§4.E ROI handling).
pub fn decode_cblk(
    data: &[u8],
    w: u32,
    h: u32,
    numbps: u32,
    orient: Orientation,
    cblksty: CblkStyle,
    roishift: u32,
) -> Vec<i32> {
    let mut cb = CodeBlock::new(w, h);
    let w = w as usize;
    let h = h as usize;
    let mut mqc = MqDecoder::new(data);
    mqc.init();

    for bitplane in (0..numbps).rev() {
        for pass_in_plane in 0..3u32 {
            if pass_in_plane == 0 && bitplane == numbps - 1 {
                continue;
            }
            match pass_in_plane {
                0 => sig_pass_decode(&mut cb, w, h, bitplane, orient, &mut mqc),
                1 => ref_pass_decode(&mut cb, w, h, bitplane, &mut mqc),
                _ => cln_pass_decode(&mut cb, w, h, bitplane, orient, bitplane == numbps - 1, &mut mqc),
            }
            for y in 0..h {
                for x in 0..w {
                    cb.visited[cb.idx(x, y)] = false;
                }
            }
            if (is_term_pass(cblksty, bitplane, numbps, pass_in_plane) || cblksty.contains(CblkStyle::PTERM))
                && cblksty.contains(CblkStyle::RESET)
            {
                mqc.restart_init(data);
            }
        }
    }

    if roishift > 0 {
        for v in cb.samples.iter_mut() {
            let mag = v.unsigned_abs();
            if mag >= (1 << roishift) {
                let sign = *v < 0;
                let shifted = (mag >> roishift) as i32;
                *v = if sign { -shifted } else { shifted };
            }
        }
    }
    cb.samples
}

fn sig_pass_decode(cb: &mut CodeBlock, w: usize, h: usize, bitplane: u32, orient: Orientation, mqc: &mut MqDecoder) {
    for y in 0..h {
        for x in 0..w {
            let i = cb.idx(x, y);
            if cb.sig[i] || !cb.any_sig_neighbor(x, y) {
                continue;
            }
            let (hc, vc, dc) = cb.neighbor_counts(x, y);
            let ctx = zc_context(orient, hc, vc, dc);
            let bit = mqc.decode(ctx);
            cb.visited[i] = true;
            if bit == 1 {
                cb.sig[i] = true;
                let h_contrib = cb.sign_contribution(x, y, -1, 0) + cb.sign_contribution(x, y, 1, 0);
                let v_contrib = cb.sign_contribution(x, y, 0, -1) + cb.sign_contribution(x, y, 0, 1);
                let (sctx, pred) = sc_context(h_contrib, v_contrib);
                let sign_bit = mqc.decode(sctx) ^ pred;
                cb.neg[i] = sign_bit != 0;
                let si = cb.sample_idx(x, y);
                let mag = 1i32 << bitplane;
                cb.samples[si] = if sign_bit != 0 { -mag } else { mag };
            }
        }
    }
}

fn ref_pass_decode(cb: &mut CodeBlock, w: usize, h: usize, bitplane: u32, mqc: &mut MqDecoder) {
    for y in 0..h {
        for x in 0..w {
            let i = cb.idx(x, y);
            if !cb.sig[i] || cb.visited[i] {
                continue;
            }
            let has_nb = cb.any_sig_neighbor(x, y);
            let ctx = mag_context(has_nb, cb.refined[i]);
            let bit = mqc.decode(ctx);
            cb.refined[i] = true;
            if bit == 1 {
                let si = cb.sample_idx(x, y);
                let add = 1i32 << bitplane;
                if cb.neg[i] {
                    cb.samples[si] -= add;
                } else {
                    cb.samples[si] += add;
                }
            }
        }
    }
}

fn cln_pass_decode(
    cb: &mut CodeBlock,
    w: usize,
    h: usize,
    bitplane: u32,
    orient: Orientation,
    first_plane: bool,
    mqc: &mut MqDecoder,
) {
    let mut y = 0;
    while y < h {
        let strip_h = (h - y).min(4);
        for x in 0..w {
            let all_insig_and_no_nb = (0..strip_h).all(|dy| {
                let i = cb.idx(x, y + dy);
                !cb.sig[i] && !cb.any_sig_neighbor(x, y + dy)
            });
            if strip_h == 4 && all_insig_and_no_nb && !first_plane {
                let any_bit = mqc.decode(CTX_AGG as u8);
                if any_bit == 0 {
                    continue;
                }
                let hi = mqc.decode(CTX_UNI as u8);
                let lo = mqc.decode(CTX_UNI as u8);
                let first_one = ((hi << 1) | lo) as usize;
                for dy in 0..4usize {
                    if dy < first_one {
                        continue;
                    }
                    let i = cb.idx(x, y + dy);
                    if cb.sig[i] {
                        continue;
                    }
                    decode_one_sample(cb, x, y + dy, bitplane, orient, dy == first_one, mqc);
                }
            } else {
                for dy in 0..strip_h {
                    let i = cb.idx(x, y + dy);
                    if cb.sig[i] || cb.visited[i] {
                        continue;
                    }
                    decode_one_sample(cb, x, y + dy, bitplane, orient, false, mqc);
                }
            }
        }
        y += 4;
    }
}

fn decode_one_sample(
    cb: &mut CodeBlock,
    x: usize,
    y: usize,
    bitplane: u32,
    orient: Orientation,
    skip_sig_bit: bool,
    mqc: &mut MqDecoder,
) {
    let i = cb.idx(x, y);
    let bit = if skip_sig_bit {
        1
    } else {
        let (hc, vc, dc) = cb.neighbor_counts(x, y);
        let ctx = zc_context(orient, hc, vc, dc);
        mqc.decode(ctx)
    };
    if bit == 1 {
        cb.sig[i] = true;
        let h_contrib = cb.sign_contribution(x, y, -1, 0) + cb.sign_contribution(x, y, 1, 0);
        let v_contrib = cb.sign_contribution(x, y, 0, -1) + cb.sign_contribution(x, y, 0, 1);
        let (sctx, pred) = sc_context(h_contrib, v_contrib);
        let sign_bit = mqc.decode(sctx) ^ pred;
        cb.neg[i] = sign_bit != 0;
        let si = cb.sample_idx(x, y);
        let mag = 1i32 << bitplane;
        cb.samples[si] = if sign_bit != 0 { -mag } else { mag };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numbps_for(samples: &[i32]) -> u32 {
        let max_mag = samples.iter().map(|s| s.unsigned_abs()).max().unwrap_or(0);
        32 - max_mag.leading_zeros()
    }

    #[test]
    fn roundtrip_sparse_block() {
        let w = 16u32;
        let h = 16u32;
        let mut samples = vec![0i32; (w * h) as usize];
        samples[5] = 37;
        samples[40] = -120;
        samples[200] = 5;
        let numbps = numbps_for(&samples);

        let result = encode_cblk(&samples, w, h, numbps, Orientation::Ll, CblkStyle::empty());
        let decoded = decode_cblk(&result.data, w, h, numbps, Orientation::Ll, CblkStyle::empty(), 0);

        assert_eq!(decoded, samples);
    }

    #[test]
    fn roundtrip_dense_block_all_orientations() {
        let w = 8u32;
        let h = 8u32;
        let samples: Vec<i32> = (0..64).map(|i| ((i * 13) % 97) - 48).collect();
        let numbps = numbps_for(&samples);

        for orient in [Orientation::Ll, Orientation::Hl, Orientation::Lh, Orientation::Hh] {
            let result = encode_cblk(&samples, w, h, numbps, orient, CblkStyle::empty());
            let decoded = decode_cblk(&result.data, w, h, numbps, orient, CblkStyle::empty(), 0);
            assert_eq!(decoded, samples, "orientation {orient:?}");
        }
    }

    #[test]
    fn roundtrip_with_termall_and_reset() {
        let w = 8u32;
        let h = 8u32;
        let samples: Vec<i32> = (0..64).map(|i| ((i * 7) % 53) - 20).collect();
        let numbps = numbps_for(&samples);
        let style = CblkStyle::TERMALL | CblkStyle::RESET;

        let result = encode_cblk(&samples, w, h, numbps, Orientation::Lh, style);
        let decoded = decode_cblk(&result.data, w, h, numbps, Orientation::Lh, style, 0);
        assert_eq!(decoded, samples);
    }

    #[test]
    fn pass_rates_are_monotone_nondecreasing() {
        let w = 8u32;
        let h = 8u32;
        let samples: Vec<i32> = (0..64).map(|i| ((i * 11) % 61) - 30).collect();
        let numbps = numbps_for(&samples);
        let result = encode_cblk(&samples, w, h, numbps, Orientation::Hh, CblkStyle::empty());
        for pair in result.passes.windows(2) {
            assert!(pair[0].rate <= pair[1].rate);
        }
    }
}
