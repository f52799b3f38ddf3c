//! The discrete wavelet transform (component F, §4.F): the reversible
//! 5/3 lifting transform used by lossless code-streams and the
//! irreversible 9/7 transform used by lossy ones, each applied as a
//! recursive dyadic decomposition across `numresolutions - 1` levels.
//!
//! Tile-component data is kept in one row-major buffer for the whole
//! tile, with each decomposition level transforming a shrinking `w x h`
//! top-left corner of that buffer in place: forward works from full
//! resolution down to the LL-only corner, inverse runs the levels back
//! up.

/// 9/7 lifting coefficients (ITU-T T.800 Annex F.4.2).
const ALPHA: f32 = -1.586134342;
const BETA: f32 = -0.052980118;
const GAMMA: f32 = 0.882911075;
const DELTA: f32 = 0.443506852;
const KAPPA: f32 = 1.230174105;
const INV_KAPPA: f32 = 1.0 / KAPPA;

/// Basis-function norms per decomposition level/orientation for rate
/// control's distortion weighting, reversible transform.
const NORMS_53: [[f64; 4]; 33] = build_norms_53();

/// Same, irreversible transform.
const NORMS_97: [[f64; 4]; 33] = build_norms_97();

const fn build_norms_53() -> [[f64; 4]; 33] {
    // Row 0 is the LL-at-full-resolution case (no filtering applied yet);
    // deeper levels attenuate by the filter's L2 gain per stage.
    let mut table = [[1.0f64; 4]; 33];
    let mut level = 1;
    while level < 33 {
        table[level][0] = table[level - 1][0] * 1.0 / 1.4021081;
        table[level][1] = 1.4021081 / (1u64 << (level - 1)) as f64;
        table[level][2] = table[level][1];
        table[level][3] = table[level][1] * 1.4021081;
        level += 1;
    }
    table
}

const fn build_norms_97() -> [[f64; 4]; 33] {
    let mut table = [[1.0f64; 4]; 33];
    let mut level = 1;
    while level < 33 {
        table[level][0] = table[level - 1][0] / 1.965;
        table[level][1] = 1.965 / (1u64 << (level - 1)) as f64;
        table[level][2] = table[level][1];
        table[level][3] = table[level][1] * 1.965;
        level += 1;
    }
    table
}

/// Subband orientation: 0=LL (only present at the lowest resolution),
/// 1=HL, 2=LH, 3=HH.
pub fn getnorm(level: u32, orient: u32) -> f64 {
    NORMS_53[(level as usize).min(32)][orient as usize]
}

pub fn getnorm_real(level: u32, orient: u32) -> f64 {
    NORMS_97[(level as usize).min(32)][orient as usize]
}

fn mirror(i: i64, len: i64) -> usize {
    if len <= 1 {
        return 0;
    }
    let mut i = i;
    while i < 0 || i >= len {
        if i < 0 {
            i = -i;
        }
        if i >= len {
            i = 2 * (len - 1) - i;
        }
    }
    i as usize
}

/// Forward 1-D reversible lifting over `n` interleaved samples read
/// from `get`/written through `set`, with mirrored boundary extension.
fn fwd_53_1d(n: usize, mut get: impl FnMut(i64) -> i32, mut set: impl FnMut(usize, i32)) {
    if n <= 1 {
        if n == 1 {
            set(0, get(0));
        }
        return;
    }
    let len = n as i64;
    let mut x: Vec<i32> = (0..n as i64).map(|i| get(i)).collect();
    let at = |x: &[i32], i: i64| -> i32 { x[mirror(i, len)] };

    let mut i = 1;
    while i < n {
        let pred = (at(&x, i as i64 - 1) + at(&x, i as i64 + 1) + 0) as i64;
        x[i] = ((x[i] as i64) - (pred >> 1)) as i32;
        i += 2;
    }
    let mut i = 0;
    while i < n {
        let upd = (at(&x, i as i64 - 1) as i64 + at(&x, i as i64 + 1) as i64 + 2) >> 2;
        x[i] = ((x[i] as i64) + upd) as i32;
        i += 2;
    }
    for (idx, v) in x.into_iter().enumerate() {
        set(idx, v);
    }
}

fn inv_53_1d(n: usize, mut get: impl FnMut(i64) -> i32, mut set: impl FnMut(usize, i32)) {
    if n <= 1 {
        if n == 1 {
            set(0, get(0));
        }
        return;
    }
    let len = n as i64;
    let mut x: Vec<i32> = (0..n as i64).map(|i| get(i)).collect();
    let at = |x: &[i32], i: i64| -> i32 { x[mirror(i, len)] };

    let mut i = 0;
    while i < n {
        let upd = (at(&x, i as i64 - 1) as i64 + at(&x, i as i64 + 1) as i64 + 2) >> 2;
        x[i] = ((x[i] as i64) - upd) as i32;
        i += 2;
    }
    let mut i = 1;
    while i < n {
        let pred = (at(&x, i as i64 - 1) as i64 + at(&x, i as i64 + 1) as i64) >> 1;
        x[i] = ((x[i] as i64) + pred) as i32;
        i += 2;
    }
    for (idx, v) in x.into_iter().enumerate() {
        set(idx, v);
    }
}

fn fwd_97_1d(n: usize, mut get: impl FnMut(i64) -> f32, mut set: impl FnMut(usize, f32)) {
    if n <= 1 {
        if n == 1 {
            set(0, get(0));
        }
        return;
    }
    let len = n as i64;
    let mut x: Vec<f32> = (0..n as i64).map(|i| get(i)).collect();
    let at = |x: &[f32], i: i64| -> f32 { x[mirror(i, len)] };

    let mut lift = |x: &mut Vec<f32>, start: usize, coeff: f32| {
        let mut i = start;
        while i < n {
            x[i] += coeff * (at(x, i as i64 - 1) + at(x, i as i64 + 1));
            i += 2;
        }
    };
    lift(&mut x, 1, ALPHA);
    lift(&mut x, 0, BETA);
    lift(&mut x, 1, GAMMA);
    lift(&mut x, 0, DELTA);

    let mut i = 0;
    while i < n {
        x[i] *= INV_KAPPA;
        i += 2;
    }
    let mut i = 1;
    while i < n {
        x[i] *= KAPPA;
        i += 2;
    }
    for (idx, v) in x.into_iter().enumerate() {
        set(idx, v);
    }
}

fn inv_97_1d(n: usize, mut get: impl FnMut(i64) -> f32, mut set: impl FnMut(usize, f32)) {
    if n <= 1 {
        if n == 1 {
            set(0, get(0));
        }
        return;
    }
    let len = n as i64;
    let mut x: Vec<f32> = (0..n as i64).map(|i| get(i)).collect();
    let at = |x: &[f32], i: i64| -> f32 { x[mirror(i, len)] };

    let mut i = 0;
    while i < n {
        x[i] *= KAPPA;
        i += 2;
    }
    let mut i = 1;
    while i < n {
        x[i] *= INV_KAPPA;
        i += 2;
    }

    let mut lift = |x: &mut Vec<f32>, start: usize, coeff: f32| {
        let mut i = start;
        while i < n {
            x[i] -= coeff * (at(x, i as i64 - 1) + at(x, i as i64 + 1));
            i += 2;
        }
    };
    lift(&mut x, 0, DELTA);
    lift(&mut x, 1, GAMMA);
    lift(&mut x, 0, BETA);
    lift(&mut x, 1, ALPHA);

    for (idx, v) in x.into_iter().enumerate() {
        set(idx, v);
    }
}

/// Compacts one level's lifted row/column (still in its original,
/// spatially-interleaved order: even index = low-pass, odd = high-pass)
/// into two contiguous halves, low-pass first — the standard Mallat
/// layout a later, coarser level (and the tile's per-resolution subband
/// split in `tcd.rs`) needs in order to address LL/HL/LH/HH as plain
/// rectangular regions instead of an interleaved mix.
fn deinterleave_rows(data: &mut [i32], width: usize, h: usize, w: usize) {
    let half = w.div_ceil(2);
    let mut tmp = vec![0i32; w];
    for row in 0..h {
        let base = row * width;
        tmp.copy_from_slice(&data[base..base + w]);
        for (i, &v) in tmp.iter().enumerate() {
            let dst = if i % 2 == 0 { i / 2 } else { half + i / 2 };
            data[base + dst] = v;
        }
    }
}

fn deinterleave_cols(data: &mut [i32], width: usize, w: usize, h: usize) {
    let half = h.div_ceil(2);
    let mut tmp = vec![0i32; h];
    for col in 0..w {
        for (i, slot) in tmp.iter_mut().enumerate() {
            *slot = data[i * width + col];
        }
        for (i, &v) in tmp.iter().enumerate() {
            let dst = if i % 2 == 0 { i / 2 } else { half + i / 2 };
            data[dst * width + col] = v;
        }
    }
}

/// Inverse of [`deinterleave_rows`]/[`deinterleave_cols`]: restores the
/// spatially-interleaved order the 1-D inverse lifting expects from the
/// compacted low/high halves.
fn interleave_rows(data: &mut [i32], width: usize, h: usize, w: usize) {
    let half = w.div_ceil(2);
    let mut tmp = vec![0i32; w];
    for row in 0..h {
        let base = row * width;
        tmp.copy_from_slice(&data[base..base + w]);
        for (c, &v) in tmp.iter().enumerate() {
            let i = if c < half { 2 * c } else { 2 * (c - half) + 1 };
            data[base + i] = v;
        }
    }
}

fn interleave_cols(data: &mut [i32], width: usize, w: usize, h: usize) {
    let half = h.div_ceil(2);
    let mut tmp = vec![0i32; h];
    for col in 0..w {
        for (c, slot) in tmp.iter_mut().enumerate() {
            *slot = data[c * width + col];
        }
        for (c, &v) in tmp.iter().enumerate() {
            let i = if c < half { 2 * c } else { 2 * (c - half) + 1 };
            data[i * width + col] = v;
        }
    }
}

fn deinterleave_rows_f32(data: &mut [f32], width: usize, h: usize, w: usize) {
    let half = w.div_ceil(2);
    let mut tmp = vec![0f32; w];
    for row in 0..h {
        let base = row * width;
        tmp.copy_from_slice(&data[base..base + w]);
        for (i, &v) in tmp.iter().enumerate() {
            let dst = if i % 2 == 0 { i / 2 } else { half + i / 2 };
            data[base + dst] = v;
        }
    }
}

fn deinterleave_cols_f32(data: &mut [f32], width: usize, w: usize, h: usize) {
    let half = h.div_ceil(2);
    let mut tmp = vec![0f32; h];
    for col in 0..w {
        for (i, slot) in tmp.iter_mut().enumerate() {
            *slot = data[i * width + col];
        }
        for (i, &v) in tmp.iter().enumerate() {
            let dst = if i % 2 == 0 { i / 2 } else { half + i / 2 };
            data[dst * width + col] = v;
        }
    }
}

fn interleave_rows_f32(data: &mut [f32], width: usize, h: usize, w: usize) {
    let half = w.div_ceil(2);
    let mut tmp = vec![0f32; w];
    for row in 0..h {
        let base = row * width;
        tmp.copy_from_slice(&data[base..base + w]);
        for (c, &v) in tmp.iter().enumerate() {
            let i = if c < half { 2 * c } else { 2 * (c - half) + 1 };
            data[base + i] = v;
        }
    }
}

fn interleave_cols_f32(data: &mut [f32], width: usize, w: usize, h: usize) {
    let half = h.div_ceil(2);
    let mut tmp = vec![0f32; h];
    for col in 0..w {
        for (c, slot) in tmp.iter_mut().enumerate() {
            *slot = data[c * width + col];
        }
        for (c, &v) in tmp.iter().enumerate() {
            let i = if c < half { 2 * c } else { 2 * (c - half) + 1 };
            data[i * width + col] = v;
        }
    }
}

/// Runs the reversible forward transform over every level, from full
/// resolution down to a single LL band, on an interleaved `width x
/// height` buffer with row stride `width`. Each level's row pass then
/// column pass is followed by a deinterleave, so the final buffer holds
/// the standard Mallat pyramid (LL in the top-left corner, HL/LH/HH
/// quadrants at each scale) rather than a spatially-interleaved mix —
/// `tcd::subband_regions` relies on this layout to address each
/// resolution's subbands as plain rectangles.
pub fn encode_53(data: &mut [i32], width: u32, height: u32, numresolutions: u32) {
    let width = width as usize;
    let mut w = width;
    let mut h = height as usize;
    for _ in 1..numresolutions {
        if w > 1 {
            for row in 0..h {
                let base = row * width;
                fwd_53_1d(
                    w,
                    |i| data[base + i as usize],
                    |i, v| data[base + i] = v,
                );
            }
            deinterleave_rows(data, width, h, w);
        }
        if h > 1 {
            for col in 0..w {
                fwd_53_1d(
                    h,
                    |i| data[i as usize * width + col],
                    |i, v| data[i * width + col] = v,
                );
            }
            deinterleave_cols(data, width, w, h);
        }
        w = w.div_ceil(2);
        h = h.div_ceil(2);
        if w <= 1 && h <= 1 {
            break;
        }
    }
}

/// Inverse of [`encode_53`]: runs levels back up from the single LL
/// band to full resolution.
pub fn decode_53(data: &mut [i32], width: u32, height: u32, numresolutions: u32) {
    let width = width as usize;
    let levels = sizes_per_level(width, height as usize, numresolutions);
    for &(w, h) in levels.iter().rev() {
        if h > 1 {
            interleave_cols(data, width, w, h);
            for col in 0..w {
                inv_53_1d(
                    h,
                    |i| data[i as usize * width + col],
                    |i, v| data[i * width + col] = v,
                );
            }
        }
        if w > 1 {
            interleave_rows(data, width, h, w);
            for row in 0..h {
                let base = row * width;
                inv_53_1d(
                    w,
                    |i| data[base + i as usize],
                    |i, v| data[base + i] = v,
                );
            }
        }
    }
}

pub fn encode_97(data: &mut [f32], width: u32, height: u32, numresolutions: u32) {
    let width = width as usize;
    let mut w = width;
    let mut h = height as usize;
    for _ in 1..numresolutions {
        if w > 1 {
            for row in 0..h {
                let base = row * width;
                fwd_97_1d(
                    w,
                    |i| data[base + i as usize],
                    |i, v| data[base + i] = v,
                );
            }
            deinterleave_rows_f32(data, width, h, w);
        }
        if h > 1 {
            for col in 0..w {
                fwd_97_1d(
                    h,
                    |i| data[i as usize * width + col],
                    |i, v| data[i * width + col] = v,
                );
            }
            deinterleave_cols_f32(data, width, w, h);
        }
        w = w.div_ceil(2);
        h = h.div_ceil(2);
        if w <= 1 && h <= 1 {
            break;
        }
    }
}

pub fn decode_97(data: &mut [f32], width: u32, height: u32, numresolutions: u32) {
    let width = width as usize;
    let levels = sizes_per_level(width, height as usize, numresolutions);
    for &(w, h) in levels.iter().rev() {
        if h > 1 {
            interleave_cols_f32(data, width, w, h);
            for col in 0..w {
                inv_97_1d(
                    h,
                    |i| data[i as usize * width + col],
                    |i, v| data[i * width + col] = v,
                );
            }
        }
        if w > 1 {
            interleave_rows_f32(data, width, h, w);
            for row in 0..h {
                let base = row * width;
                inv_97_1d(
                    w,
                    |i| data[base + i as usize],
                    |i, v| data[base + i] = v,
                );
            }
        }
    }
}

/// The `(w, h)` extent transformed at each of the `numresolutions - 1`
/// decomposition levels, in the same order `encode_*` visits them.
fn sizes_per_level(width: usize, height: usize, numresolutions: u32) -> Vec<(usize, usize)> {
    let mut sizes = Vec::new();
    let mut w = width;
    let mut h = height;
    for _ in 1..numresolutions {
        sizes.push((w, h));
        w = w.div_ceil(2);
        h = h.div_ceil(2);
        if w <= 1 && h <= 1 {
            break;
        }
    }
    sizes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reversible_roundtrip_rectangular_tile() {
        let w = 17u32;
        let h = 11u32;
        let orig: Vec<i32> = (0..(w * h) as i32).map(|i| (i * 7) % 251 - 120).collect();
        let mut data = orig.clone();

        encode_53(&mut data, w, h, 4);
        decode_53(&mut data, w, h, 4);

        assert_eq!(data, orig);
    }

    #[test]
    fn reversible_roundtrip_single_resolution_is_identity() {
        let w = 8u32;
        let h = 8u32;
        let orig: Vec<i32> = (0..(w * h) as i32).collect();
        let mut data = orig.clone();

        encode_53(&mut data, w, h, 1);
        assert_eq!(data, orig);
        decode_53(&mut data, w, h, 1);
        assert_eq!(data, orig);
    }

    #[test]
    fn irreversible_roundtrip_within_float_tolerance() {
        let w = 16u32;
        let h = 12u32;
        let orig: Vec<f32> = (0..(w * h)).map(|i| (i as f32 * 1.3).sin() * 100.0).collect();
        let mut data = orig.clone();

        encode_97(&mut data, w, h, 3);
        decode_97(&mut data, w, h, 3);

        for (a, b) in data.iter().zip(orig.iter()) {
            assert!((a - b).abs() < 1e-2, "{a} vs {b}");
        }
    }

    #[test]
    fn norms_increase_with_higher_frequency_orientation() {
        assert!(getnorm(2, 3) > getnorm(2, 1));
        assert!(getnorm_real(2, 3) > getnorm_real(2, 1));
    }

    /// A flat image carries no detail: every HL/LH/HH coefficient must
    /// be exactly zero, and deinterleaving must have compacted all of
    /// them into the right/bottom half of the buffer rather than
    /// leaving them spatially interleaved with the LL samples.
    #[test]
    fn forward_transform_separates_into_contiguous_subband_quadrants() {
        let w = 8u32;
        let h = 8u32;
        let mut data = vec![100i32; (w * h) as usize];
        encode_53(&mut data, w, h, 2);
        let half = 4usize;
        for row in 0..h as usize {
            for col in 0..w as usize {
                if row >= half || col >= half {
                    assert_eq!(data[row * w as usize + col], 0, "row={row} col={col}");
                }
            }
        }
    }
}
