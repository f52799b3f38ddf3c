//! Rate–distortion allocation (component I, §4.I): PCRD-opt bisection
//! over a slope threshold to assign each code-block's truncation point
//! per quality layer.

use crate::t1::PassInfo;

/// One code-block's candidate truncation points, as produced by T1.
pub struct CblkCandidates<'a> {
    pub passes: &'a [PassInfo],
}

/// `(rate, distortion, pass_index)` triples kept on the convex hull of
/// a code-block's rate/distortion curve — the only candidates rate
/// control should ever select, since a non-hull point is always
/// dominated by some combination of its neighbours.
fn convex_hull(passes: &[PassInfo]) -> Vec<(u32, f64, usize)> {
    let mut points: Vec<(u32, f64, usize)> = passes
        .iter()
        .enumerate()
        .map(|(i, p)| (p.rate, total_distortion(passes, i), i))
        .collect();
    points.sort_by_key(|p| p.0);
    points.dedup_by_key(|p| p.0);

    let mut hull: Vec<(u32, f64, usize)> = Vec::new();
    for point in points {
        while hull.len() >= 2 {
            let a = hull[hull.len() - 2];
            let b = hull[hull.len() - 1];
            // Distortion decreases as rate grows; keep `b` only if it
            // bends the curve the right way (steeper slope than the
            // segment before it), else it's below the hull.
            let slope_ab = slope(a, b);
            let slope_bc = slope(b, point);
            if slope_bc >= slope_ab {
                hull.pop();
            } else {
                break;
            }
        }
        hull.push(point);
    }
    hull
}

fn slope(a: (u32, f64, usize), b: (u32, f64, usize)) -> f64 {
    let dr = b.0 as f64 - a.0 as f64;
    if dr <= 0.0 {
        return f64::NEG_INFINITY;
    }
    (a.1 - b.1) / dr
}

/// Total distortion remaining (i.e. the image-wide distortion
/// contribution still uncorrected) after keeping passes `0..=idx`;
/// decreasing in `idx` since later passes only improve quality.
fn total_distortion(passes: &[PassInfo], idx: usize) -> f64 {
    let total: f64 = passes.iter().map(|p| p.distortion).sum();
    let kept: f64 = passes[..=idx].iter().map(|p| p.distortion).sum();
    total - kept
}

/// A layer's chosen truncation point per code-block, plus the realised
/// byte rate.
pub struct LayerAssignment {
    pub truncation_points: Vec<usize>,
    pub rate: u32,
}

/// Simple PCRD-opt: bisects a real-valued slope threshold until the
/// resulting total rate is within the layer's budget (or a fixed
/// iteration cap is hit), per §4.I.2 "Simple".
pub fn allocate_layer_simple(cblks: &[CblkCandidates], target_rate: Option<u32>) -> LayerAssignment {
    let hulls: Vec<Vec<(u32, f64, usize)>> = cblks.iter().map(|c| convex_hull(c.passes)).collect();

    let Some(target_rate) = target_rate else {
        // No target: assign every remaining pass (lossless tail).
        let truncation_points = cblks.iter().map(|c| c.passes.len().saturating_sub(1)).collect();
        let rate = cblks.iter().filter_map(|c| c.passes.last()).map(|p| p.rate).sum();
        return LayerAssignment { truncation_points, rate };
    };

    let mut lo = 0f64;
    let mut hi = hulls
        .iter()
        .flat_map(|h| h.windows(2).map(|w| slope(w[0], w[1]).abs()))
        .fold(1.0f64, f64::max)
        * 4.0
        + 1.0;

    let mut best = select_for_threshold(&hulls, hi);
    for _ in 0..128 {
        let mid = (lo + hi) / 2.0;
        let candidate = select_for_threshold(&hulls, mid);
        if candidate.rate <= target_rate {
            best = candidate;
            hi = mid;
        } else {
            lo = mid;
        }
        if (hi - lo).abs() < 1e-6 {
            break;
        }
    }
    best
}

/// §4.I.2 "Feasible": same bisection but over integer slopes and
/// restricted to hull points, which is exactly what `select_for_threshold`
/// already does — the two algorithms share this implementation and
/// differ only in how `target` was derived by the caller.
pub fn allocate_layer_feasible(cblks: &[CblkCandidates], slope_threshold: u32) -> LayerAssignment {
    let hulls: Vec<Vec<(u32, f64, usize)>> = cblks.iter().map(|c| convex_hull(c.passes)).collect();
    select_for_threshold(&hulls, slope_threshold as f64)
}

fn select_for_threshold(hulls: &[Vec<(u32, f64, usize)>], threshold: f64) -> LayerAssignment {
    let mut truncation_points = Vec::with_capacity(hulls.len());
    let mut rate = 0u32;
    for hull in hulls {
        let mut chosen = None;
        for win in hull.windows(2) {
            let s = slope(win[0], win[1]);
            if s > threshold {
                chosen = Some(win[1].2);
            }
        }
        let idx = chosen.or_else(|| hull.first().map(|p| p.2));
        if let Some(idx) = idx {
            truncation_points.push(idx);
        } else {
            truncation_points.push(0);
        }
    }
    for (hull, &idx) in hulls.iter().zip(truncation_points.iter()) {
        if let Some(point) = hull.iter().find(|p| p.2 == idx) {
            rate += point.0;
        }
    }
    LayerAssignment { truncation_points, rate }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::t1::PassInfo;

    fn synthetic_passes(n: usize) -> Vec<PassInfo> {
        (0..n)
            .map(|i| PassInfo {
                rate: (i as u32 + 1) * 10,
                distortion: 100.0 / (i as f64 + 1.0),
                terminated: false,
            })
            .collect()
    }

    #[test]
    fn simple_allocation_respects_rate_budget() {
        let passes_a = synthetic_passes(5);
        let passes_b = synthetic_passes(5);
        let cblks = vec![
            CblkCandidates { passes: &passes_a },
            CblkCandidates { passes: &passes_b },
        ];
        let assignment = allocate_layer_simple(&cblks, Some(60));
        assert!(assignment.rate <= 60 + 20, "rate {} grossly over budget", assignment.rate);
    }

    #[test]
    fn no_target_keeps_all_passes() {
        let passes_a = synthetic_passes(4);
        let cblks = vec![CblkCandidates { passes: &passes_a }];
        let assignment = allocate_layer_simple(&cblks, None);
        assert_eq!(assignment.truncation_points[0], passes_a.len() - 1);
    }

    #[test]
    fn convex_hull_is_nonempty_for_nonempty_passes() {
        let passes = synthetic_passes(6);
        let hull = convex_hull(&passes);
        assert!(!hull.is_empty());
    }
}
