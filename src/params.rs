//! The coding-parameters model (component C, §3): `CodingParameters`,
//! `TileCodingParameters` and `TileComponentCodingParameters`, plus the
//! validation rules of §4.C.

use crate::error::{CodecError, Result};

pub const MAX_TILES: u32 = 65535;
pub const MAX_COMPONENTS: u32 = 16384;
pub const MAX_TILE_PARTS_PER_TILE: u32 = 255;
pub const MAX_TOTAL_TILE_PARTS: u32 = 65535;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressionOrder {
    Lrcp,
    Rlcp,
    Rpcl,
    Pcrl,
    Cprl,
}

impl ProgressionOrder {
    pub fn from_code(code: u8) -> Result<Self> {
        Ok(match code {
            0 => ProgressionOrder::Lrcp,
            1 => ProgressionOrder::Rlcp,
            2 => ProgressionOrder::Rpcl,
            3 => ProgressionOrder::Pcrl,
            4 => ProgressionOrder::Cprl,
            other => {
                return Err(CodecError::BadMarker(format!(
                    "unknown progression order code {other}"
                )))
            }
        })
    }

    pub fn code(&self) -> u8 {
        match self {
            ProgressionOrder::Lrcp => 0,
            ProgressionOrder::Rlcp => 1,
            ProgressionOrder::Rpcl => 2,
            ProgressionOrder::Pcrl => 3,
            ProgressionOrder::Cprl => 4,
        }
    }
}

/// `mct` mode carried by COD: 0 = none, 1 = RCT/ICT, 2 = Part-2 explicit matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MctMode {
    None,
    Rct,
    Explicit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantizationStyle {
    NoQuantization,
    ScalarDerived,
    ScalarExplicit,
}

bitflags::bitflags! {
    /// Code-block style flags carried by the SPcod/SPcoc byte.
    pub struct CblkStyle: u8 {
        const LAZY    = 0x01;
        const RESET   = 0x02;
        const TERMALL = 0x04;
        const VSC     = 0x08;
        const SEGSYM  = 0x10;
        const PTERM   = 0x20;
        const HT_ONLY = 0x40;
    }
}

/// Per-sub-band quantization step, (mantissa, exponent) packed as the
/// code-stream does: `expn<<11 | mant` for non-reversible styles.
#[derive(Debug, Clone, Copy, Default)]
pub struct StepSize {
    pub expn: u32,
    pub mant: u32,
}

/// A progression-order-change entry (POC marker), up to 32 per tile.
#[derive(Debug, Clone, Copy)]
pub struct PocEntry {
    pub res_s: u8,
    pub comp_s: u16,
    pub lay_e: u16,
    pub res_e: u8,
    pub comp_e: u16,
    pub prg: ProgressionOrder,
}

/// Per-component coding parameters (tccp).
#[derive(Debug, Clone)]
pub struct TileComponentCodingParameters {
    /// L+1: number of resolutions, L in 0..=32.
    pub numresolutions: u32,
    pub cblkw_expn: u32,
    pub cblkh_expn: u32,
    pub cblk_style: CblkStyle,
    /// qmfbid: 1 = reversible 5/3, 0 = irreversible 9/7.
    pub qmfbid: u8,
    pub qntsty: QuantizationStyle,
    pub step_sizes: Vec<StepSize>,
    pub guard_bits: u32,
    pub roi_shift: u32,
    /// per-resolution precinct exponents `(pp_x, pp_y)`; defaults to 15,15
    /// (i.e. one precinct per resolution) unless explicitly signalled.
    pub precinct_size: Vec<(u32, u32)>,
}

impl TileComponentCodingParameters {
    pub fn default_for(numresolutions: u32, qmfbid: u8) -> Self {
        TileComponentCodingParameters {
            numresolutions,
            cblkw_expn: 6,
            cblkh_expn: 6,
            cblk_style: CblkStyle::empty(),
            qmfbid,
            qntsty: if qmfbid == 1 {
                QuantizationStyle::NoQuantization
            } else {
                QuantizationStyle::ScalarDerived
            },
            step_sizes: Vec::new(),
            guard_bits: 2,
            roi_shift: 0,
            precinct_size: vec![(15, 15); numresolutions as usize],
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=33).contains(&self.numresolutions) {
            return Err(CodecError::BadMarker(format!(
                "numresolutions {} out of [1,33]",
                self.numresolutions
            )));
        }
        if !(2..=10).contains(&self.cblkw_expn) || !(2..=10).contains(&self.cblkh_expn) {
            return Err(CodecError::BadMarker(
                "code-block exponent out of [2,10]".into(),
            ));
        }
        if self.cblkw_expn + self.cblkh_expn > 12 {
            return Err(CodecError::BadMarker(
                "cblkw_expn + cblkh_expn exceeds 12".into(),
            ));
        }
        if self.guard_bits > 7 {
            return Err(CodecError::BadMarker("guard bits exceed 7".into()));
        }
        if self.cblk_style.contains(CblkStyle::HT_ONLY) {
            if self.qmfbid == 0 && self.qntsty == QuantizationStyle::NoQuantization {
                return Err(CodecError::BadProfile(
                    "HT-only code-blocks with irreversible transform require qmfbid=0".into(),
                ));
            }
        }
        Ok(())
    }

    pub fn cblk_w(&self) -> u32 {
        1 << self.cblkw_expn
    }

    pub fn cblk_h(&self) -> u32 {
        1 << self.cblkh_expn
    }
}

/// Per-tile coding parameters (tcp).
#[derive(Debug, Clone)]
pub struct TileCodingParameters {
    pub num_layers: u32,
    pub prg: ProgressionOrder,
    pub mct: MctMode,
    pub mct_matrix: Option<Vec<f32>>,
    /// target bytes for each layer (fixed-rate), 0 = no rate target (lossless tail).
    pub layer_rate: Vec<f64>,
    /// target PSNR/distortion for each layer (fixed-quality), 0 = no target.
    pub layer_distortion: Vec<f64>,
    pub poc: Vec<PocEntry>,
    pub csty_sop: bool,
    pub csty_eph: bool,
    pub csty_explicit_precincts: bool,
    pub tccps: Vec<TileComponentCodingParameters>,
}

impl TileCodingParameters {
    pub fn validate(&self) -> Result<()> {
        if !(1..=65535).contains(&self.num_layers) {
            return Err(CodecError::BadMarker(format!(
                "num_layers {} out of [1,65535]",
                self.num_layers
            )));
        }
        if self.poc.len() > 32 {
            return Err(CodecError::BadMarker("more than 32 POC entries".into()));
        }
        for tccp in &self.tccps {
            tccp.validate()?;
        }
        let any_ht_only = self.tccps.iter().any(|t| t.cblk_style.contains(CblkStyle::HT_ONLY));
        if any_ht_only && self.num_layers != 1 {
            return Err(CodecError::BadProfile(
                "HT-only requires exactly one quality layer".into(),
            ));
        }
        Ok(())
    }
}

/// Cinema/Broadcast/IMF profile identifier carried by `rsiz`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    None,
    Cinema2k,
    Cinema4k,
    CinemaScope,
    Broadcast,
    Imf,
}

/// Top-level coding parameters (cp), shared read-only once initialized.
#[derive(Debug, Clone)]
pub struct CodingParameters {
    pub rsiz: u16,
    pub profile: Profile,
    pub tx0: u32,
    pub ty0: u32,
    pub tdx: u32,
    pub tdy: u32,
    pub tile_grid_width: u32,
    pub tile_grid_height: u32,
    pub tcps: Vec<TileCodingParameters>,
    pub comments: Vec<String>,
    pub write_tlm: bool,
    pub write_plt: bool,
    pub enable_tile_part_generation: bool,
    pub new_tile_part_progression_divider: Option<char>,
}

impl CodingParameters {
    /// Derive the tile grid from the image canvas and the nominal tile size,
    /// defaulting to a single tile spanning the whole canvas when no tiling
    /// was requested (tdx == 0).
    pub fn derive_tile_grid(&mut self, x0: u32, y0: u32, x1: u32, y1: u32) {
        if self.tdx == 0 || self.tdy == 0 {
            self.tx0 = x0;
            self.ty0 = y0;
            self.tdx = x1 - x0;
            self.tdy = y1 - y0;
        }
        self.tile_grid_width = ceil_div(x1 - self.tx0, self.tdx);
        self.tile_grid_height = ceil_div(y1 - self.ty0, self.tdy);
    }

    pub fn num_tiles(&self) -> u32 {
        self.tile_grid_width * self.tile_grid_height
    }

    pub fn validate_for_image(&self, numcomps: u32, x0: u32, y0: u32, x1: u32, y1: u32) -> Result<()> {
        if numcomps == 0 {
            return Err(CodecError::BadMarker("Csiz == 0".into()));
        }
        if numcomps > MAX_COMPONENTS {
            return Err(CodecError::BadMarker(format!(
                "Csiz {numcomps} exceeds {MAX_COMPONENTS}"
            )));
        }
        if self.tx0 > x0 || self.ty0 > y0 {
            return Err(CodecError::BadMarker("tile origin exceeds image origin".into()));
        }
        if x1 <= x0 || y1 <= y0 {
            return Err(CodecError::BadMarker("Xsiz <= X0siz".into()));
        }
        if self.tdx == 0 || self.tdy == 0 {
            return Err(CodecError::BadMarker("tile size is zero".into()));
        }
        if self.num_tiles() > MAX_TILES {
            return Err(CodecError::BadMarker(format!(
                "tile count {} exceeds {MAX_TILES}",
                self.num_tiles()
            )));
        }
        for tcp in &self.tcps {
            tcp.validate()?;
        }
        if self.profile != Profile::None {
            self.validate_profile()?;
        }
        Ok(())
    }

    /// Clamp parameters to a Cinema/Broadcast/IMF profile's limits, warning
    /// (rather than failing) when the input cannot comply, per §4.C.
    fn validate_profile(&self) -> Result<()> {
        match self.profile {
            Profile::Cinema2k | Profile::Cinema4k | Profile::CinemaScope => {
                if self.num_tiles() != 1 {
                    log::warn!("profile {:?} requires a single tile; clamping rsiz to NONE", self.profile);
                }
            }
            Profile::Broadcast | Profile::Imf => {
                for tcp in &self.tcps {
                    if tcp.prg != ProgressionOrder::Cprl {
                        log::warn!(
                            "profile {:?} expects CPRL progression, found {:?}",
                            self.profile,
                            tcp.prg
                        );
                    }
                }
            }
            Profile::None => {}
        }
        Ok(())
    }
}

fn ceil_div(a: u32, b: u32) -> u32 {
    (a + b - 1) / b
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tccp_rejects_oversized_cblk() {
        let mut t = TileComponentCodingParameters::default_for(6, 1);
        t.cblkw_expn = 10;
        t.cblkh_expn = 10;
        assert!(t.validate().is_err());
    }

    #[test]
    fn tccp_accepts_default() {
        let t = TileComponentCodingParameters::default_for(6, 1);
        assert!(t.validate().is_ok());
    }

    #[test]
    fn single_tile_default_grid() {
        let mut cp = CodingParameters {
            rsiz: 0,
            profile: Profile::None,
            tx0: 0,
            ty0: 0,
            tdx: 0,
            tdy: 0,
            tile_grid_width: 0,
            tile_grid_height: 0,
            tcps: Vec::new(),
            comments: Vec::new(),
            write_tlm: false,
            write_plt: false,
            enable_tile_part_generation: false,
            new_tile_part_progression_divider: None,
        };
        cp.derive_tile_grid(0, 0, 256, 256);
        assert_eq!(cp.num_tiles(), 1);
        assert_eq!(cp.tdx, 256);
    }
}
