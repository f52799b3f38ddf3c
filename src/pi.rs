//! Packet iteration (component G, §4.G): walks a tile's `(layer,
//! resolution, component, precinct)` tuples in one of the five
//! progression orders, honouring POC overrides and tracking which
//! packets have already been emitted so a later POC range can't
//! duplicate one.

use crate::params::{PocEntry, ProgressionOrder, TileCodingParameters};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketId {
    pub layer: u32,
    pub resolution: u32,
    pub component: u32,
    pub precinct: u32,
}

/// Per-component layout the iterator needs: resolution count and, for
/// each resolution, the precinct grid size and subsampling.
#[derive(Debug, Clone)]
pub struct ComponentLayout {
    pub numresolutions: u32,
    pub dx: u32,
    pub dy: u32,
    /// `(precincts_wide, precincts_high)` per resolution, lowest-resolution first.
    pub precinct_grid: Vec<(u32, u32)>,
    /// `(pp_x, pp_y)` precinct exponents per resolution.
    pub precinct_exp: Vec<(u32, u32)>,
}

impl ComponentLayout {
    fn max_precinct(&self, res: u32) -> u32 {
        let (pw, ph) = self.precinct_grid[res as usize];
        pw * ph
    }

    /// Precinct pitch at `res`, projected onto the tile's reference-grid
    /// canvas: a precinct spans `2^(ppx + levels)` reference-grid samples
    /// horizontally, where `levels` is how many further decompositions
    /// separate `res` from the highest resolution. Projecting every
    /// resolution's pitch onto the same canvas is what lets the
    /// precinct-varying orders (§4.G) walk one shared `(x, y)` position
    /// across resolutions and components of differing subsampling.
    fn precinct_step(&self, res: u32) -> (u32, u32) {
        let (ppx, ppy) = self.precinct_exp[res as usize];
        let levels = self.numresolutions.saturating_sub(1 + res);
        (self.dx << (ppx + levels), self.dy << (ppy + levels))
    }

    /// The precinct index covering canvas position `(x, y)` at `res`, or
    /// `None` if `(x, y)` doesn't land on that resolution's precinct grid.
    fn precinct_at(&self, res: u32, x: u32, y: u32) -> Option<u32> {
        let (step_x, step_y) = self.precinct_step(res);
        if x % step_x != 0 || y % step_y != 0 {
            return None;
        }
        let (pw, ph) = self.precinct_grid[res as usize];
        let px = x / step_x;
        let py = y / step_y;
        if px >= pw || py >= ph {
            return None;
        }
        Some(py * pw + px)
    }
}

/// Smallest per-axis precinct step across `idxs`' components, over
/// resolutions `res_s..res_e`: the canvas-walk increment a
/// precinct-varying order must use so it doesn't step past a finer
/// component's precinct boundary.
fn min_step(components: &[ComponentLayout], idxs: &[u32], res_s: u32, res_e: u32) -> (u32, u32) {
    let mut min_x = 0u32;
    let mut min_y = 0u32;
    for &c in idxs {
        let layout = &components[c as usize];
        for res in res_s..res_e.min(layout.numresolutions) {
            let (sx, sy) = layout.precinct_step(res);
            min_x = if min_x == 0 { sx } else { min_x.min(sx) };
            min_y = if min_y == 0 { sy } else { min_y.min(sy) };
        }
    }
    (min_x.max(1), min_y.max(1))
}

/// Canvas extent (in reference-grid samples) the walk must cover to
/// reach every precinct across `idxs`' components over `res_s..res_e`.
fn canvas_extent(components: &[ComponentLayout], idxs: &[u32], res_s: u32, res_e: u32) -> (u32, u32) {
    let mut max_x = 0u32;
    let mut max_y = 0u32;
    for &c in idxs {
        let layout = &components[c as usize];
        for res in res_s..res_e.min(layout.numresolutions) {
            let (sx, sy) = layout.precinct_step(res);
            let (pw, ph) = layout.precinct_grid[res as usize];
            max_x = max_x.max(sx * pw);
            max_y = max_y.max(sy * ph);
        }
    }
    (max_x.max(1), max_y.max(1))
}

/// A single progression-order range, either the tile's whole default
/// range or one POC entry.
struct Range {
    layer_e: u32,
    res_s: u32,
    res_e: u32,
    comp_s: u32,
    comp_e: u32,
    prg: ProgressionOrder,
}

pub struct PacketIterator<'a> {
    components: &'a [ComponentLayout],
    ranges: Vec<Range>,
    included: Vec<Vec<bool>>,
    max_res: u32,
}

impl<'a> PacketIterator<'a> {
    pub fn new(tcp: &TileCodingParameters, components: &'a [ComponentLayout]) -> Self {
        let max_res = components.iter().map(|c| c.numresolutions).max().unwrap_or(1);
        let ranges = if tcp.poc.is_empty() {
            vec![Range {
                layer_e: tcp.num_layers,
                res_s: 0,
                res_e: max_res,
                comp_s: 0,
                comp_e: components.len() as u32,
                prg: tcp.prg,
            }]
        } else {
            tcp.poc.iter().map(Range::from_poc).collect()
        };

        let total_precincts: usize = components.iter().map(|c| c.precinct_grid.len().max(1)).sum();
        PacketIterator {
            components,
            ranges,
            included: vec![vec![false; (tcp.num_layers as usize).max(1)]; total_precincts.max(1)],
            max_res,
        }
    }

    fn inclusion_slot(&self, comp: u32, res: u32, precinct: u32) -> usize {
        let mut base = 0usize;
        for c in 0..comp as usize {
            base += self.components[c].precinct_grid.len();
        }
        base + res as usize * 1000000 + precinct as usize
    }

    /// True if this packet has not yet been emitted under an earlier
    /// POC range; marks it emitted as a side effect.
    fn try_mark(&mut self, id: PacketId) -> bool {
        let idx = self.inclusion_slot(id.component, id.resolution, id.precinct) % self.included.len();
        let layer = id.layer as usize;
        if layer >= self.included[idx].len() {
            return true;
        }
        if self.included[idx][layer] {
            return false;
        }
        self.included[idx][layer] = true;
        true
    }

    /// Produces every packet tuple across all ranges, in order,
    /// skipping resolutions a component doesn't have and packets
    /// already emitted under an earlier range.
    pub fn collect(&mut self) -> Vec<PacketId> {
        let mut out = Vec::new();
        for range_idx in 0..self.ranges.len() {
            let (layer_e, res_s, res_e, comp_s, comp_e, prg) = {
                let r = &self.ranges[range_idx];
                (r.layer_e, r.res_s, r.res_e, r.comp_s, r.comp_e, r.prg)
            };
            let ids = match prg {
                ProgressionOrder::Lrcp => self.lrcp(layer_e, res_s, res_e, comp_s, comp_e),
                ProgressionOrder::Rlcp => self.rlcp(layer_e, res_s, res_e, comp_s, comp_e),
                ProgressionOrder::Rpcl => self.rpcl(layer_e, res_s, res_e, comp_s, comp_e),
                ProgressionOrder::Pcrl => self.pcrl(layer_e, res_s, res_e, comp_s, comp_e),
                ProgressionOrder::Cprl => self.cprl(layer_e, res_s, res_e, comp_s, comp_e),
            };
            for id in ids {
                if id.resolution >= self.components[id.component as usize].numresolutions {
                    continue;
                }
                if self.try_mark(id) {
                    out.push(id);
                }
            }
        }
        out
    }

    fn lrcp(&self, layer_e: u32, res_s: u32, res_e: u32, comp_s: u32, comp_e: u32) -> Vec<PacketId> {
        let mut v = Vec::new();
        for layer in 0..layer_e {
            for resolution in res_s..res_e.min(self.max_res) {
                for component in comp_s..comp_e {
                    let layout = &self.components[component as usize];
                    for precinct in 0..layout.max_precinct(resolution.min(layout.numresolutions - 1)) {
                        v.push(PacketId { layer, resolution, component, precinct });
                    }
                }
            }
        }
        v
    }

    fn rlcp(&self, layer_e: u32, res_s: u32, res_e: u32, comp_s: u32, comp_e: u32) -> Vec<PacketId> {
        let mut v = Vec::new();
        for resolution in res_s..res_e.min(self.max_res) {
            for layer in 0..layer_e {
                for component in comp_s..comp_e {
                    let layout = &self.components[component as usize];
                    if resolution >= layout.numresolutions {
                        continue;
                    }
                    for precinct in 0..layout.max_precinct(resolution) {
                        v.push(PacketId { layer, resolution, component, precinct });
                    }
                }
            }
        }
        v
    }

    /// Resolution, Precinct, Component, Layer: for each resolution in
    /// turn, walk the shared canvas grid and visit every component's
    /// precinct at that position before moving to the next position.
    fn rpcl(&self, layer_e: u32, res_s: u32, res_e: u32, comp_s: u32, comp_e: u32) -> Vec<PacketId> {
        let mut v = Vec::new();
        let comps: Vec<u32> = (comp_s..comp_e).collect();
        for resolution in res_s..res_e.min(self.max_res) {
            let active: Vec<u32> = comps
                .iter()
                .copied()
                .filter(|&c| resolution < self.components[c as usize].numresolutions)
                .collect();
            if active.is_empty() {
                continue;
            }
            let (step_x, step_y) = min_step(self.components, &active, resolution, resolution + 1);
            let (max_x, max_y) = canvas_extent(self.components, &active, resolution, resolution + 1);
            let mut y = 0;
            while y < max_y {
                let mut x = 0;
                while x < max_x {
                    for &component in &active {
                        let layout = &self.components[component as usize];
                        if let Some(precinct) = layout.precinct_at(resolution, x, y) {
                            for layer in 0..layer_e {
                                v.push(PacketId { layer, resolution, component, precinct });
                            }
                        }
                    }
                    x += step_x;
                }
                y += step_y;
            }
        }
        v
    }

    /// Precinct, Component, Resolution, Layer: walk the canvas grid
    /// (over the full resolution range, so the same position is visited
    /// once regardless of resolution), and at each position visit every
    /// component's every resolution before moving on.
    fn pcrl(&self, layer_e: u32, res_s: u32, res_e: u32, comp_s: u32, comp_e: u32) -> Vec<PacketId> {
        let mut v = Vec::new();
        let comps: Vec<u32> = (comp_s..comp_e).collect();
        let (step_x, step_y) = min_step(self.components, &comps, res_s, res_e);
        let (max_x, max_y) = canvas_extent(self.components, &comps, res_s, res_e);
        let mut y = 0;
        while y < max_y {
            let mut x = 0;
            while x < max_x {
                for &component in &comps {
                    let layout = &self.components[component as usize];
                    for resolution in res_s..res_e.min(layout.numresolutions) {
                        if let Some(precinct) = layout.precinct_at(resolution, x, y) {
                            for layer in 0..layer_e {
                                v.push(PacketId { layer, resolution, component, precinct });
                            }
                        }
                    }
                }
                x += step_x;
            }
            y += step_y;
        }
        v
    }

    /// Component, Precinct, Resolution, Layer: for each component in
    /// turn, walk that component's own canvas grid and visit every
    /// resolution at that position before moving on. Unlike PCRL, the
    /// canvas step and extent are computed per component rather than
    /// across all components at once, so the two orders only coincide
    /// when every component shares the same subsampling and precinct
    /// geometry.
    fn cprl(&self, layer_e: u32, res_s: u32, res_e: u32, comp_s: u32, comp_e: u32) -> Vec<PacketId> {
        let mut v = Vec::new();
        for component in comp_s..comp_e {
            let layout = &self.components[component as usize];
            let idx = [component];
            let (step_x, step_y) = min_step(self.components, &idx, res_s, res_e);
            let (max_x, max_y) = canvas_extent(self.components, &idx, res_s, res_e);
            let mut y = 0;
            while y < max_y {
                let mut x = 0;
                while x < max_x {
                    for resolution in res_s..res_e.min(layout.numresolutions) {
                        if let Some(precinct) = layout.precinct_at(resolution, x, y) {
                            for layer in 0..layer_e {
                                v.push(PacketId { layer, resolution, component, precinct });
                            }
                        }
                    }
                    x += step_x;
                }
                y += step_y;
            }
        }
        v
    }
}

impl Range {
    fn from_poc(poc: &PocEntry) -> Self {
        Range {
            layer_e: poc.lay_e as u32,
            res_s: poc.res_s as u32,
            res_e: poc.res_e as u32,
            comp_s: poc.comp_s as u32,
            comp_e: poc.comp_e as u32,
            prg: poc.prg,
        }
    }
}

/// Which axis a new tile-part starts on, for tile-part generation
/// during compression: the iterator flushes a tile-part whenever the
/// selected axis wraps back to its start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TilePartDivider {
    Layer,
    Resolution,
    Component,
    Precinct,
}

impl TilePartDivider {
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            'L' => Some(TilePartDivider::Layer),
            'R' => Some(TilePartDivider::Resolution),
            'C' => Some(TilePartDivider::Component),
            'P' => Some(TilePartDivider::Precinct),
            _ => None,
        }
    }

    /// True if `id` starts a new tile-part relative to `prev` under
    /// this divider axis (the axis "wrapped").
    pub fn wraps(&self, prev: Option<PacketId>, id: PacketId) -> bool {
        let Some(prev) = prev else { return false };
        match self {
            TilePartDivider::Layer => id.layer != prev.layer,
            TilePartDivider::Resolution => id.resolution != prev.resolution,
            TilePartDivider::Component => id.component != prev.component,
            TilePartDivider::Precinct => id.precinct != prev.precinct,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{MctMode, ProgressionOrder, TileCodingParameters};

    fn single_component_layout(numresolutions: u32) -> ComponentLayout {
        ComponentLayout {
            numresolutions,
            dx: 1,
            dy: 1,
            precinct_grid: vec![(1, 1); numresolutions as usize],
            precinct_exp: vec![(15, 15); numresolutions as usize],
        }
    }

    /// A single-resolution component with a `pw`-wide precinct row, so
    /// the canvas walk visits `pw` distinct precincts at step 1.
    fn wide_component_layout(dx: u32, pw: u32) -> ComponentLayout {
        ComponentLayout {
            numresolutions: 1,
            dx,
            dy: 1,
            precinct_grid: vec![(pw, 1)],
            precinct_exp: vec![(0, 0)],
        }
    }

    fn tcp(prg: ProgressionOrder, num_layers: u32) -> TileCodingParameters {
        TileCodingParameters {
            num_layers,
            prg,
            mct: MctMode::None,
            mct_matrix: None,
            layer_rate: Vec::new(),
            layer_distortion: Vec::new(),
            poc: Vec::new(),
            csty_sop: false,
            csty_eph: false,
            csty_explicit_precincts: false,
            tccps: Vec::new(),
        }
    }

    #[test]
    fn lrcp_visits_every_packet_exactly_once() {
        let comps = vec![single_component_layout(3), single_component_layout(3)];
        let t = tcp(ProgressionOrder::Lrcp, 2);
        let mut pi = PacketIterator::new(&t, &comps);
        let packets = pi.collect();
        assert_eq!(packets.len(), 2 * 3 * 2);
        // LRCP: layer varies slowest.
        assert_eq!(packets[0].layer, 0);
        assert_eq!(packets.last().unwrap().layer, 1);
    }

    #[test]
    fn rpcl_groups_by_resolution_before_layer() {
        let comps = vec![single_component_layout(2)];
        let t = tcp(ProgressionOrder::Rpcl, 3);
        let mut pi = PacketIterator::new(&t, &comps);
        let packets = pi.collect();
        assert_eq!(packets.len(), 2 * 3);
        assert_eq!(packets[0].resolution, 0);
        // Each resolution contributes a full run of `layer_e` packets
        // before the next resolution starts.
        assert_eq!(packets[2].resolution, 0);
        assert_eq!(packets[3].resolution, 1);
    }

    /// RPCL nests Resolution, Precinct, Component, Layer: at a fixed
    /// resolution, every component's precinct 0 must appear before any
    /// component's precinct 1. A component/precinct axis swap would
    /// instead finish one component's precincts before moving to the
    /// next component.
    #[test]
    fn rpcl_visits_every_component_at_one_precinct_before_the_next_precinct() {
        let comps = vec![wide_component_layout(1, 2), wide_component_layout(1, 2)];
        let t = tcp(ProgressionOrder::Rpcl, 1);
        let mut pi = PacketIterator::new(&t, &comps);
        let packets = pi.collect();
        let tuples: Vec<(u32, u32)> = packets.iter().map(|p| (p.component, p.precinct)).collect();
        assert_eq!(tuples, vec![(0, 0), (1, 0), (0, 1), (1, 1)]);
    }

    /// PCRL (Precinct, Component, Resolution, Layer) and CPRL
    /// (Component, Precinct, Resolution, Layer) must produce genuinely
    /// different orders for a multi-component tile: PCRL groups every
    /// component's packet at one canvas position before moving to the
    /// next position, CPRL finishes one component's whole canvas walk
    /// before moving to the next component.
    #[test]
    fn pcrl_and_cprl_produce_distinct_orders_for_multi_component_tiles() {
        let comps = vec![wide_component_layout(1, 2), wide_component_layout(1, 2)];

        let t_pcrl = tcp(ProgressionOrder::Pcrl, 1);
        let mut pi_pcrl = PacketIterator::new(&t_pcrl, &comps);
        let pcrl_order: Vec<(u32, u32)> = pi_pcrl
            .collect()
            .iter()
            .map(|p| (p.component, p.precinct))
            .collect();
        assert_eq!(pcrl_order, vec![(0, 0), (1, 0), (0, 1), (1, 1)]);

        let t_cprl = tcp(ProgressionOrder::Cprl, 1);
        let mut pi_cprl = PacketIterator::new(&t_cprl, &comps);
        let cprl_order: Vec<(u32, u32)> = pi_cprl
            .collect()
            .iter()
            .map(|p| (p.component, p.precinct))
            .collect();
        assert_eq!(cprl_order, vec![(0, 0), (0, 1), (1, 0), (1, 1)]);

        assert_ne!(pcrl_order, cprl_order);
    }

    #[test]
    fn fewer_resolutions_component_is_skipped_at_higher_levels() {
        let comps = vec![single_component_layout(3), single_component_layout(1)];
        let t = tcp(ProgressionOrder::Rlcp, 1);
        let mut pi = PacketIterator::new(&t, &comps);
        let packets = pi.collect();
        assert!(packets.iter().all(|p| p.resolution < comps[p.component as usize].numresolutions));
    }

    #[test]
    fn tile_part_divider_detects_wrap() {
        let a = PacketId { layer: 0, resolution: 0, component: 0, precinct: 0 };
        let b = PacketId { layer: 1, resolution: 0, component: 0, precinct: 0 };
        assert!(TilePartDivider::Layer.wraps(Some(a), b));
        assert!(!TilePartDivider::Resolution.wraps(Some(a), b));
    }
}
