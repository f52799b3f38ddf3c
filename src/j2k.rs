//! The code-stream marker codec (component B, §4.B) and the top-level
//! `Compressor`/`Decompressor` orchestration (§6).
//!
//! Every marker segment is framed as `marker-id (2 bytes) | length (2
//! bytes, inclusive of the length field but not the marker id) | body`,
//! with SOC/SOD/EOC/EPH/SOP as bodiless (or fixed-body) delimiters. All
//! scalar fields are big-endian, read and written through a [`Stream`].

use crate::error::{CodecError, Result};
use crate::image::{ColorSpace, Image, ImageComponentParams};
use crate::mqc::{read_comma_coded, write_comma_coded};
use crate::params::{
    CblkStyle, CodingParameters, MctMode, PocEntry, Profile, ProgressionOrder, QuantizationStyle, StepSize,
    TileCodingParameters, TileComponentCodingParameters,
};
use crate::pi::PacketIterator;
use crate::scheduler::compress_tiles;
use crate::stream::Stream;
use crate::t2::{BitReader, BitWriter, CblkContribution, CblkState};
use crate::tcd::{allocate_layers, build_component_layouts, compress_tile, finish_decompress_tile, Tile, TileComponentBuffer};
use crate::tlm::TlmManager;

pub mod markers {
    pub const SOC: u16 = 0xff4f;
    pub const SOT: u16 = 0xff90;
    pub const SOD: u16 = 0xff93;
    pub const EOC: u16 = 0xffd9;
    pub const CAP: u16 = 0xff50;
    pub const SIZ: u16 = 0xff51;
    pub const COD: u16 = 0xff52;
    pub const COC: u16 = 0xff53;
    pub const RGN: u16 = 0xff5e;
    pub const QCD: u16 = 0xff5c;
    pub const QCC: u16 = 0xff5d;
    pub const POC: u16 = 0xff5f;
    pub const TLM: u16 = 0xff55;
    pub const PLT: u16 = 0xff58;
    pub const PPM: u16 = 0xff60;
    pub const PPT: u16 = 0xff61;
    pub const SOP: u16 = 0xff91;
    pub const EPH: u16 = 0xff92;
    pub const COM: u16 = 0xff64;
    pub const MCT: u16 = 0xff74;
    pub const MCC: u16 = 0xff75;
    pub const MCO: u16 = 0xff77;
    pub const CBD: u16 = 0xff78;
}

/// Reads a 2-byte marker id, checking the `0xFF` prefix every marker
/// shares (§4.B).
fn read_marker_id(stream: &mut dyn Stream) -> Result<u16> {
    let id = stream.read_u16()?;
    if id & 0xff00 != 0xff00 {
        return Err(CodecError::BadMarker(format!("marker id {id:#06x} missing 0xFF prefix")));
    }
    Ok(id)
}

/// Reads `Lmar` and the body following a marker id already consumed by
/// [`read_marker_id`]. Every marker except the bodiless delimiters
/// (SOC/SOD/EOC) carries this field.
fn read_segment_body(stream: &mut dyn Stream) -> Result<Vec<u8>> {
    let lmar = stream.read_u16()?;
    if lmar < 2 {
        return Err(CodecError::BadMarker(format!("marker length {lmar} below minimum")));
    }
    read_body(stream, lmar - 2)
}

fn read_body(stream: &mut dyn Stream, len: u16) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf)?;
    Ok(buf)
}

/// Writes a bodiless delimiter marker (SOC/SOD/EOC): just the 2-byte
/// id, no `Lmar` field (§4.B "Exceptions").
fn write_marker(stream: &mut dyn Stream, id: u16) -> Result<()> {
    stream.write_u16(id)?;
    Ok(())
}

fn write_segment(stream: &mut dyn Stream, id: u16, body: &[u8]) -> Result<()> {
    stream.write_u16(id)?;
    stream.write_u16(body.len() as u16 + 2)?;
    stream.write(body)?;
    Ok(())
}

/// SIZ marker contents (§4.B "SIZ"): image geometry plus the default
/// per-component subsampling/precision that seeds each `tccp`.
pub struct SizInfo {
    pub rsiz: u16,
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
    pub tx0: u32,
    pub ty0: u32,
    pub tdx: u32,
    pub tdy: u32,
    pub comps: Vec<ImageComponentParams>,
}

fn parse_siz(body: &[u8]) -> Result<SizInfo> {
    if body.len() < 36 {
        return Err(CodecError::BadMarker("SIZ segment too short".into()));
    }
    let mut r = &body[..];
    let take_u16 = |r: &mut &[u8]| -> u16 {
        let v = u16::from_be_bytes([r[0], r[1]]);
        *r = &r[2..];
        v
    };
    let take_u32 = |r: &mut &[u8]| -> u32 {
        let v = u32::from_be_bytes([r[0], r[1], r[2], r[3]]);
        *r = &r[4..];
        v
    };

    let rsiz = take_u16(&mut r);
    let x1 = take_u32(&mut r);
    let y1 = take_u32(&mut r);
    let x0 = take_u32(&mut r);
    let y0 = take_u32(&mut r);
    let tdx = take_u32(&mut r);
    let tdy = take_u32(&mut r);
    let tx0 = take_u32(&mut r);
    let ty0 = take_u32(&mut r);
    let numcomps = take_u16(&mut r);

    if numcomps == 0 {
        return Err(CodecError::BadMarker("Csiz == 0".into()));
    }
    if numcomps as u32 > crate::params::MAX_COMPONENTS {
        return Err(CodecError::BadMarker(format!("Csiz {numcomps} exceeds component limit")));
    }
    if x1 <= x0 || y1 <= y0 {
        return Err(CodecError::BadMarker("Xsiz <= X0siz".into()));
    }
    if tdx == 0 || tdy == 0 {
        return Err(CodecError::BadMarker("tile size is zero".into()));
    }
    if tx0 > x0 || ty0 > y0 {
        return Err(CodecError::BadMarker("tile origin exceeds image origin".into()));
    }
    if r.len() < numcomps as usize * 3 {
        return Err(CodecError::BadMarker("SIZ component table truncated".into()));
    }

    let mut comps = Vec::with_capacity(numcomps as usize);
    for _ in 0..numcomps {
        let ssiz = r[0];
        let xrsiz = r[1];
        let yrsiz = r[2];
        r = &r[3..];
        let sgnd = ssiz & 0x80 != 0;
        let prec = (ssiz & 0x7f) as u32 + 1;
        comps.push(ImageComponentParams {
            dx: xrsiz as u32,
            dy: yrsiz as u32,
            w: 0,
            h: 0,
            x0: 0,
            y0: 0,
            prec,
            sgnd,
        });
    }

    Ok(SizInfo { rsiz, x0, y0, x1, y1, tx0, ty0, tdx, tdy, comps })
}

fn emit_siz(info: &SizInfo) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&info.rsiz.to_be_bytes());
    body.extend_from_slice(&info.x1.to_be_bytes());
    body.extend_from_slice(&info.y1.to_be_bytes());
    body.extend_from_slice(&info.x0.to_be_bytes());
    body.extend_from_slice(&info.y0.to_be_bytes());
    body.extend_from_slice(&info.tdx.to_be_bytes());
    body.extend_from_slice(&info.tdy.to_be_bytes());
    body.extend_from_slice(&info.tx0.to_be_bytes());
    body.extend_from_slice(&info.ty0.to_be_bytes());
    body.extend_from_slice(&(info.comps.len() as u16).to_be_bytes());
    for c in &info.comps {
        let ssiz = ((c.sgnd as u8) << 7) | ((c.prec - 1) as u8 & 0x7f);
        body.push(ssiz);
        body.push(c.dx as u8);
        body.push(c.dy as u8);
    }
    body
}

/// COD/COC body, shared between the default (COD) and per-component
/// (COC) forms. `body` starts at the style byte (`Scod`/`Scoc`, whose
/// low bit selects explicit precincts); COD additionally carries the
/// `SGcod` progression/layers/MCT fields right after it.
fn parse_coding_style(body: &[u8], with_prog_and_layers: bool) -> Result<(TileComponentCodingParameters, ProgressionOrder, u32, MctMode, bool)> {
    if body.is_empty() {
        return Err(CodecError::BadMarker("coding style segment empty".into()));
    }
    let explicit_precincts = body[0] & 1 != 0;
    let mut r = &body[1..];

    let (prg, num_layers, mct) = if with_prog_and_layers {
        if r.len() < 4 {
            return Err(CodecError::BadMarker("COD segment too short".into()));
        }
        let prg = ProgressionOrder::from_code(r[0])?;
        let num_layers = u16::from_be_bytes([r[1], r[2]]) as u32;
        let mct = match r[3] {
            0 => MctMode::None,
            1 => MctMode::Rct,
            2 => MctMode::Explicit,
            other => return Err(CodecError::BadMarker(format!("unknown MCT mode {other}"))),
        };
        r = &r[4..];
        (prg, num_layers, mct)
    } else {
        (ProgressionOrder::Lrcp, 0, MctMode::None)
    };

    if r.len() < 5 {
        return Err(CodecError::BadMarker("coding style segment truncated before SPcod".into()));
    }
    let numresolutions = r[0] as u32 + 1;
    let cblkw_expn = r[1] as u32 + 2;
    let cblkh_expn = r[2] as u32 + 2;
    let cblk_style = CblkStyle::from_bits_truncate(r[3]);
    let qmfbid = r[4];
    r = &r[5..];

    let mut tccp = TileComponentCodingParameters::default_for(numresolutions, qmfbid);
    tccp.cblkw_expn = cblkw_expn;
    tccp.cblkh_expn = cblkh_expn;
    tccp.cblk_style = cblk_style;

    if explicit_precincts {
        if r.len() < numresolutions as usize {
            return Err(CodecError::BadMarker("precinct size table truncated".into()));
        }
        tccp.precinct_size = r[..numresolutions as usize]
            .iter()
            .map(|&b| ((b & 0x0f) as u32, (b >> 4) as u32))
            .collect();
    }

    tccp.validate()?;
    Ok((tccp, prg, num_layers, mct, explicit_precincts))
}

fn emit_coding_style(tccp: &TileComponentCodingParameters, prg: Option<(ProgressionOrder, u32, MctMode)>, explicit_precincts: bool) -> Vec<u8> {
    let mut body = vec![explicit_precincts as u8];
    if let Some((prg, num_layers, mct)) = prg {
        body.push(prg.code());
        body.extend_from_slice(&(num_layers as u16).to_be_bytes());
        body.push(match mct {
            MctMode::None => 0,
            MctMode::Rct => 1,
            MctMode::Explicit => 2,
        });
    }
    body.push((tccp.numresolutions - 1) as u8);
    body.push((tccp.cblkw_expn - 2) as u8);
    body.push((tccp.cblkh_expn - 2) as u8);
    body.push(tccp.cblk_style.bits());
    body.push(tccp.qmfbid);
    if explicit_precincts {
        for &(ppx, ppy) in &tccp.precinct_size {
            body.push(((ppy as u8) << 4) | (ppx as u8 & 0x0f));
        }
    }
    body
}

/// QCD/QCC body: `SQcd` packs `(style, guard_bits)`; reversible carries
/// one exponent byte per sub-band, otherwise a 16-bit `(expn,mant)` word.
fn parse_quant(body: &[u8]) -> Result<(QuantizationStyle, u32, Vec<StepSize>)> {
    if body.is_empty() {
        return Err(CodecError::BadMarker("quantization segment empty".into()));
    }
    let sqcd = body[0];
    let style = match sqcd & 0x1f {
        0 => QuantizationStyle::NoQuantization,
        1 => QuantizationStyle::ScalarDerived,
        2 => QuantizationStyle::ScalarExplicit,
        other => return Err(CodecError::BadMarker(format!("unknown quantization style {other}"))),
    };
    let guard_bits = (sqcd >> 5) as u32;
    let rest = &body[1..];

    let steps = match style {
        QuantizationStyle::NoQuantization => rest.iter().map(|&b| StepSize { expn: (b >> 3) as u32, mant: 0 }).collect(),
        _ => rest
            .chunks_exact(2)
            .map(|c| {
                let word = u16::from_be_bytes([c[0], c[1]]);
                StepSize { expn: (word >> 11) as u32, mant: (word & 0x7ff) as u32 }
            })
            .collect(),
    };
    Ok((style, guard_bits, steps))
}

fn emit_quant(style: QuantizationStyle, guard_bits: u32, steps: &[StepSize]) -> Vec<u8> {
    let mut body = Vec::new();
    let style_code = match style {
        QuantizationStyle::NoQuantization => 0u8,
        QuantizationStyle::ScalarDerived => 1,
        QuantizationStyle::ScalarExplicit => 2,
    };
    body.push(style_code | ((guard_bits as u8) << 5));
    match style {
        QuantizationStyle::NoQuantization => {
            for s in steps {
                body.push((s.expn as u8) << 3);
            }
        }
        _ => {
            for s in steps {
                let word = ((s.expn as u16) << 11) | (s.mant as u16 & 0x7ff);
                body.extend_from_slice(&word.to_be_bytes());
            }
        }
    }
    body
}

/// POC body (§4.B "POC"): a table of range entries; `comp_s`/`comp_e`
/// widen to 2 bytes once the image has more than 256 components.
fn parse_poc(body: &[u8], wide_components: bool) -> Result<Vec<PocEntry>> {
    let comp_width = if wide_components { 2 } else { 1 };
    let entry_len = 1 + comp_width + 2 + 1 + comp_width + 1;
    if entry_len == 0 || body.len() % entry_len != 0 {
        return Err(CodecError::BadMarker("POC segment length not a multiple of the entry size".into()));
    }
    let mut out = Vec::new();
    for chunk in body.chunks(entry_len) {
        let mut r = chunk;
        let res_s = r[0];
        r = &r[1..];
        let comp_s = if wide_components { u16::from_be_bytes([r[0], r[1]]) } else { r[0] as u16 };
        r = &r[comp_width..];
        let lay_e = u16::from_be_bytes([r[0], r[1]]);
        r = &r[2..];
        let res_e = r[0];
        r = &r[1..];
        let comp_e = if wide_components { u16::from_be_bytes([r[0], r[1]]) } else { r[0] as u16 };
        r = &r[comp_width..];
        let prg = ProgressionOrder::from_code(r[0])?;
        out.push(PocEntry { res_s, comp_s, lay_e, res_e, comp_e, prg });
    }
    if out.len() > 32 {
        return Err(CodecError::BadMarker("more than 32 POC entries".into()));
    }
    Ok(out)
}

fn emit_poc(entries: &[PocEntry], wide_components: bool) -> Vec<u8> {
    let mut body = Vec::new();
    for e in entries {
        body.push(e.res_s);
        if wide_components {
            body.extend_from_slice(&e.comp_s.to_be_bytes());
        } else {
            body.push(e.comp_s as u8);
        }
        body.extend_from_slice(&e.lay_e.to_be_bytes());
        body.push(e.res_e);
        if wide_components {
            body.extend_from_slice(&e.comp_e.to_be_bytes());
        } else {
            body.push(e.comp_e as u8);
        }
        body.push(e.prg.code());
    }
    body
}

/// RGN body: region-of-interest shift for one component.
fn parse_rgn(body: &[u8], wide_components: bool) -> Result<(u16, u32)> {
    let comp_width = if wide_components { 2 } else { 1 };
    if body.len() < comp_width + 2 {
        return Err(CodecError::BadMarker("RGN segment too short".into()));
    }
    let compno = if wide_components { u16::from_be_bytes([body[0], body[1]]) } else { body[0] as u16 };
    let sprgn = body[comp_width + 1];
    Ok((compno, sprgn as u32))
}

fn emit_rgn(compno: u16, roi_shift: u32, wide_components: bool) -> Vec<u8> {
    let mut body = Vec::new();
    if wide_components {
        body.extend_from_slice(&compno.to_be_bytes());
    } else {
        body.push(compno as u8);
    }
    body.push(0); // SPrgn: region style, only 0 (implicit) is defined.
    body.push(roi_shift as u8);
    body
}

fn parse_com(body: &[u8]) -> Result<String> {
    if body.len() < 2 {
        return Err(CodecError::BadMarker("COM segment too short".into()));
    }
    let rcom = u16::from_be_bytes([body[0], body[1]]);
    let text = &body[2..];
    Ok(match rcom {
        1 => String::from_utf8_lossy(text).into_owned(),
        _ => text.iter().map(|&b| b as char).collect(),
    })
}

fn emit_com(text: &str) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&1u16.to_be_bytes());
    body.extend_from_slice(text.as_bytes());
    body
}

/// SOT body (§4.B "SOT"): tile-part framing.
#[derive(Debug, Clone, Copy)]
pub struct SotInfo {
    pub isot: u16,
    pub psot: u32,
    pub tpsot: u8,
    pub tnsot: u8,
}

fn parse_sot(body: &[u8]) -> Result<SotInfo> {
    if body.len() < 8 {
        return Err(CodecError::BadMarker("SOT segment too short".into()));
    }
    Ok(SotInfo {
        isot: u16::from_be_bytes([body[0], body[1]]),
        psot: u32::from_be_bytes([body[2], body[3], body[4], body[5]]),
        tpsot: body[6],
        tnsot: body[7],
    })
}

fn emit_sot(info: &SotInfo) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&info.isot.to_be_bytes());
    body.extend_from_slice(&info.psot.to_be_bytes());
    body.push(info.tpsot);
    body.push(info.tnsot);
    body
}

/// PLT body: comma-coded packet lengths for one tile-part (§4.B "PLT").
fn parse_plt(body: &[u8]) -> Result<(u8, Vec<u32>)> {
    if body.is_empty() {
        return Err(CodecError::BadMarker("PLT segment empty".into()));
    }
    let zplt = body[0];
    let mut it = body[1..].iter().copied();
    let mut lengths = Vec::new();
    while let Some(len) = read_comma_coded(&mut it) {
        lengths.push(len);
    }
    Ok((zplt, lengths))
}

fn emit_plt(zplt: u8, lengths: &[u32]) -> Vec<u8> {
    let mut body = vec![zplt];
    for &len in lengths {
        write_comma_coded(len, &mut body);
    }
    body
}

/// CAP body: present only when a tccp uses HT mode; `pcap` is a bitmask
/// of which coding "parts" are in play, with Part-15 (HTJ2K) as bit 14.
fn emit_cap() -> Vec<u8> {
    let pcap: u32 = 1 << (32 - 15);
    let mut body = Vec::new();
    body.extend_from_slice(&pcap.to_be_bytes());
    body.extend_from_slice(&0u16.to_be_bytes()); // Ccap[14], no extended capability flags used.
    body
}

/// Part-2 explicit-matrix MCT description: one MCC record's coefficient
/// matrix plus its MCO application order and CBD per-component depths.
/// Kept intentionally narrow: only the double-precision, fully-populated
/// decorrelation matrix form is supported, which is what `mct_data`
/// (§6 "Compress API") ever supplies.
pub struct ExplicitMctInfo {
    pub numcomps: u32,
    pub matrix: Vec<f64>,
    pub offsets: Vec<f64>,
}

fn emit_mct(info: &ExplicitMctInfo) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&0u16.to_be_bytes()); // Zmct: index 0, single MCT record.
    body.push(0x28); // Element type = double (bits 3-2 = 0b10), array type = decorrelation (bits 1-0 = 0b00).
    for v in &info.matrix {
        body.extend_from_slice(&v.to_be_bytes());
    }
    body
}

fn parse_mct(body: &[u8], numcomps: u32) -> Result<ExplicitMctInfo> {
    if body.len() < 3 {
        return Err(CodecError::BadMarker("MCT segment too short".into()));
    }
    let matrix_len = (numcomps * numcomps) as usize;
    let floats = &body[3..];
    if floats.len() < matrix_len * 8 {
        return Err(CodecError::BadMarker("MCT matrix truncated".into()));
    }
    let matrix = floats
        .chunks_exact(8)
        .take(matrix_len)
        .map(|c| f64::from_be_bytes(c.try_into().unwrap()))
        .collect();
    Ok(ExplicitMctInfo { numcomps, matrix, offsets: vec![0.0; numcomps as usize] })
}

fn emit_cbd(precisions: &[(u32, bool)]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&(precisions.len() as u16).to_be_bytes());
    for &(prec, sgnd) in precisions {
        body.push(((sgnd as u8) << 7) | ((prec - 1) as u8 & 0x7f));
    }
    body
}

fn parse_cbd(body: &[u8]) -> Result<Vec<(u32, bool)>> {
    if body.len() < 2 {
        return Err(CodecError::BadMarker("CBD segment too short".into()));
    }
    let n = u16::from_be_bytes([body[0], body[1]]) as usize;
    if body.len() < 2 + n {
        return Err(CodecError::BadMarker("CBD component table truncated".into()));
    }
    Ok(body[2..2 + n].iter().map(|&b| ((b & 0x7f) as u32 + 1, b & 0x80 != 0)).collect())
}

/// Main-header summary returned by [`Decompressor::read_header`] (§6).
#[derive(Debug, Clone)]
pub struct HeaderInfo {
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
    pub numcomps: u32,
    pub numresolutions: u32,
    pub num_layers: u32,
    pub t_width: u32,
    pub t_height: u32,
    pub tile_grid_width: u32,
    pub tile_grid_height: u32,
    pub prog_order: ProgressionOrder,
}

/// `tile_cache_strategy` decompress option (§6): `All` is required for
/// incremental/differential refinement across successive `decompress`
/// calls with a growing `layers_to_decompress`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TileCacheStrategy {
    #[default]
    None,
    Image,
    All,
}

#[derive(Debug, Clone, Default)]
pub struct DecompressOptions {
    pub reduce: u32,
    pub layers_to_decompress: Option<u32>,
    pub window: Option<(u32, u32, u32, u32)>,
    pub tile_cache_strategy: TileCacheStrategy,
    pub asynchronous: bool,
    pub skip_allocate_composite: bool,
}

#[derive(Debug, Clone)]
pub struct CompressOptions {
    pub numresolution: u32,
    pub cblockw_init: u32,
    pub cblockh_init: u32,
    pub cblk_sty: CblkStyle,
    pub prog_order: ProgressionOrder,
    pub numlayers: u32,
    pub layer_rate: Vec<f64>,
    pub layer_distortion: Vec<f64>,
    pub mct: MctMode,
    pub mct_data: Option<ExplicitMctInfo>,
    pub irreversible: bool,
    pub t_width: u32,
    pub t_height: u32,
    pub tx0: u32,
    pub ty0: u32,
    pub tile_size_on: bool,
    pub enable_tile_part_generation: bool,
    pub new_tile_part_progression_divider: Option<char>,
    pub rsiz: u16,
    pub write_plt: bool,
    pub write_tlm: bool,
    pub roi_compno: Option<u32>,
    pub roi_shift: u32,
}

impl Default for CompressOptions {
    fn default() -> Self {
        CompressOptions {
            numresolution: 6,
            cblockw_init: 64,
            cblockh_init: 64,
            cblk_sty: CblkStyle::empty(),
            prog_order: ProgressionOrder::Lrcp,
            numlayers: 1,
            layer_rate: vec![0.0],
            layer_distortion: Vec::new(),
            mct: MctMode::None,
            mct_data: None,
            irreversible: false,
            t_width: 0,
            t_height: 0,
            tx0: 0,
            ty0: 0,
            tile_size_on: false,
            enable_tile_part_generation: false,
            new_tile_part_progression_divider: None,
            rsiz: 0,
            write_plt: false,
            write_tlm: false,
            roi_compno: None,
            roi_shift: 0,
        }
    }
}

/// Decompresses a code-stream, §6's `Decompress API`.
///
/// Each tile-component's code-blocks are grouped by resolution and real
/// sub-band (see `crate::tcd::component_cblk_layout`), so packet bodies
/// are read resolution-major with one tag tree pair per resolution.
/// Quantization bit-depth is still a single bound shared across
/// sub-bands — see `DESIGN.md` for that remaining simplification.
pub struct Decompressor<S: Stream> {
    stream: S,
    cp: CodingParameters,
    image: Image,
    tlm: TlmManager,
    options: DecompressOptions,
}

impl<S: Stream> Decompressor<S> {
    pub fn init(options: DecompressOptions, stream: S) -> Result<Self> {
        Ok(Decompressor {
            stream,
            cp: empty_coding_parameters(),
            image: Image::create(&[], ColorSpace::Unknown),
            tlm: TlmManager::new(),
            options,
        })
    }

    /// Parses the main header (SOC through the marker preceding the
    /// first SOT), building `CodingParameters` and the output `Image`
    /// shell. Unknown markers are warned-and-skipped here, per §4.B.
    pub fn read_header(&mut self) -> Result<HeaderInfo> {
        let soc_id = read_marker_id(&mut self.stream)?;
        if soc_id != markers::SOC {
            return Err(CodecError::BadMarker("code-stream does not start with SOC".into()));
        }

        let siz_id = read_marker_id(&mut self.stream)?;
        if siz_id != markers::SIZ {
            return Err(CodecError::BadMarker("SIZ must immediately follow SOC".into()));
        }
        let siz = parse_siz(&read_segment_body(&mut self.stream)?)?;

        let mut cp = empty_coding_parameters();
        cp.rsiz = siz.rsiz;
        cp.tx0 = siz.tx0;
        cp.ty0 = siz.ty0;
        cp.tdx = siz.tdx;
        cp.tdy = siz.tdy;
        cp.derive_tile_grid(siz.x0, siz.y0, siz.x1, siz.y1);

        let wide_components = siz.comps.len() > 256;
        let mut default_tcp = default_tile_coding_parameters(siz.comps.len() as u32);
        let mut comments = Vec::new();

        loop {
            let id = read_marker_id(&mut self.stream)?;
            if id == markers::SOT {
                self.stream.skip(-2)?;
                break;
            }
            let body = read_segment_body(&mut self.stream)?;
            match id {
                markers::COD => {
                    let (tccp, prg, num_layers, mct, explicit_precincts) = parse_coding_style(&body, true)?;
                    default_tcp.prg = prg;
                    default_tcp.num_layers = num_layers.max(1);
                    default_tcp.mct = mct;
                    default_tcp.csty_explicit_precincts = explicit_precincts;
                    for t in default_tcp.tccps.iter_mut() {
                        *t = tccp.clone();
                    }
                }
                markers::COC => {
                    let comp_width = if wide_components { 2 } else { 1 };
                    let compno = if wide_components { u16::from_be_bytes([body[0], body[1]]) } else { body[0] as u16 };
                    let (tccp, ..) = parse_coding_style(&body[comp_width..], false)?;
                    if let Some(slot) = default_tcp.tccps.get_mut(compno as usize) {
                        *slot = tccp;
                    }
                }
                markers::QCD => {
                    let (style, guard_bits, steps) = parse_quant(&body)?;
                    for t in default_tcp.tccps.iter_mut() {
                        t.qntsty = style;
                        t.guard_bits = guard_bits;
                        t.step_sizes = steps.clone();
                    }
                }
                markers::QCC => {
                    let comp_width = if wide_components { 2 } else { 1 };
                    let compno = if wide_components { u16::from_be_bytes([body[0], body[1]]) } else { body[0] as u16 };
                    let (style, guard_bits, steps) = parse_quant(&body[comp_width..])?;
                    if let Some(t) = default_tcp.tccps.get_mut(compno as usize) {
                        t.qntsty = style;
                        t.guard_bits = guard_bits;
                        t.step_sizes = steps;
                    }
                }
                markers::POC => {
                    default_tcp.poc = parse_poc(&body, wide_components)?;
                }
                markers::RGN => {
                    let (compno, shift) = parse_rgn(&body, wide_components)?;
                    if let Some(t) = default_tcp.tccps.get_mut(compno as usize) {
                        t.roi_shift = shift;
                    }
                }
                markers::COM => {
                    comments.push(parse_com(&body)?);
                }
                markers::TLM => {
                    if body.is_empty() {
                        return Err(CodecError::BadMarker("TLM segment empty".into()));
                    }
                    self.tlm.parse_segment(body[1], &body[2..])?;
                }
                markers::CAP | markers::PPM | markers::PPT | markers::MCT | markers::MCC | markers::MCO | markers::CBD => {
                    // Parsed enough to skip past; Part-2 multi-component
                    // description round-trips through `mct_data` at the
                    // `Compressor` boundary rather than being reconstructed here.
                }
                other => {
                    log::warn!("unknown marker {other:#06x} in main header, skipping");
                }
            }
        }

        cp.comments = comments;
        cp.tcps = vec![default_tcp.clone(); cp.num_tiles().max(1) as usize];
        cp.validate_for_image(siz.comps.len() as u32, siz.x0, siz.y0, siz.x1, siz.y1)?;

        let mut comps = siz.comps.clone();
        for c in comps.iter_mut() {
            c.x0 = siz.x0;
            c.y0 = siz.y0;
            c.w = (siz.x1 - siz.x0 + c.dx - 1) / c.dx;
            c.h = (siz.y1 - siz.y0 + c.dy - 1) / c.dy;
        }
        self.image = Image::create(&comps, ColorSpace::Unknown);
        self.image.x0 = siz.x0;
        self.image.y0 = siz.y0;
        self.image.x1 = siz.x1;
        self.image.y1 = siz.y1;
        self.cp = cp;

        Ok(HeaderInfo {
            x0: siz.x0,
            y0: siz.y0,
            x1: siz.x1,
            y1: siz.y1,
            numcomps: siz.comps.len() as u32,
            numresolutions: self.cp.tcps[0].tccps[0].numresolutions,
            num_layers: self.cp.tcps[0].num_layers,
            t_width: self.cp.tdx,
            t_height: self.cp.tdy,
            tile_grid_width: self.cp.tile_grid_width,
            tile_grid_height: self.cp.tile_grid_height,
            prog_order: self.cp.tcps[0].prg,
        })
    }

    /// Decompresses every tile (or, with `tile_region`, only those
    /// overlapping it) and composites the result into one `Image`.
    pub fn decompress(&mut self, tile_region: Option<(u32, u32, u32, u32)>) -> Result<Image> {
        let region = tile_region.or(self.options.window);
        let num_tiles = self.cp.num_tiles();
        for tile_index in 0..num_tiles {
            if let Some((x0, y0, x1, y1)) = region {
                if !tile_overlaps(&self.cp, tile_index, x0, y0, x1, y1) {
                    continue;
                }
            }
            self.decompress_tile(tile_index)?;
        }
        if self.options.skip_allocate_composite {
            return Ok(Image::create(&[], ColorSpace::Unknown));
        }
        self.image.clip_all();
        Ok(self.image.clone())
    }

    /// Decompresses one tile in isolation (§6 `decompress_tile`).
    pub fn decompress_tile(&mut self, tile_index: u32) -> Result<()> {
        let sot_id = read_marker_id(&mut self.stream)?;
        if sot_id != markers::SOT {
            return Err(CodecError::BadMarker("expected SOT at tile-part boundary".into()));
        }
        let sot = parse_sot(&read_segment_body(&mut self.stream)?)?;
        if sot.isot as u32 != tile_index {
            log::warn!("requested tile {tile_index} but stream presented tile {}", sot.isot);
        }

        loop {
            let id = read_marker_id(&mut self.stream)?;
            if id == markers::SOD {
                break;
            }
            let _body = read_segment_body(&mut self.stream)?;
            match id {
                markers::POC | markers::PLT | markers::COM | markers::TLM => {}
                _ => return Err(CodecError::BadMarker(format!("unexpected marker {:#06x} in tile-part header", id))),
            }
        }

        let reduce = self.options.reduce;
        let tcp = self.cp.tcps[tile_index as usize].clone();
        let reversible = tcp.tccps[0].qmfbid == 1;

        // `Psot` covers the whole tile-part (SOT's 12 bytes + SOD's 2 +
        // the packet body); both are already behind us.
        let remaining = if sot.psot == 0 { self.stream.num_bytes_left()? } else { (sot.psot as u64).saturating_sub(14) };
        let mut packet_body = vec![0u8; remaining.min(self.stream.num_bytes_left()?) as usize];
        self.stream.read_exact(&mut packet_body)?;

        let numresolutions = tcp.tccps[0].numresolutions.saturating_sub(reduce).max(1);
        let mut tile = Tile {
            components: self
                .image
                .comps
                .iter()
                .map(|c| TileComponentBuffer {
                    width: c.w,
                    height: c.h,
                    data: vec![0i32; (c.w * c.h) as usize],
                    dc_shift: 1 << (c.prec - 1),
                    signed: c.sgnd,
                    numresolutions,
                })
                .collect(),
        };

        let cblk_w = tcp.tccps[0].cblk_w();
        let cblk_h = tcp.tccps[0].cblk_h();
        let mut cursor = 0usize;
        for (ci, buf) in tile.components.iter_mut().enumerate() {
            let tccp = &tcp.tccps[ci];
            let nb_max = crate::tcd::numbps_max(tccp);
            let layout = crate::tcd::component_cblk_layout(buf.width, buf.height, buf.numresolutions, cblk_w, cblk_h);
            let mut num_cblks_per_res = vec![0u32; buf.numresolutions as usize];
            for &(resolution, ..) in &layout {
                num_cblks_per_res[resolution as usize] += 1;
            }

            let mut cblks: Vec<Vec<(Vec<u8>, u32)>> = Vec::with_capacity(num_cblks_per_res.len());
            for &num_cblks in &num_cblks_per_res {
                let mut inclusion = crate::tgt::TagTree::new(num_cblks, 1);
                let mut imsb = crate::tgt::TagTree::new(num_cblks, 1);
                let mut states: Vec<CblkState> = (0..num_cblks).map(|_| CblkState::default()).collect();
                let mut accum: Vec<Vec<u8>> = vec![Vec::new(); num_cblks as usize];

                for layer in 0..tcp.num_layers {
                    if cursor >= packet_body.len() {
                        break;
                    }
                    let mut r = BitReader::new(&packet_body[cursor..]);
                    let _non_empty = r.get_bit()?;
                    let mut segments = Vec::new();
                    for leaf in 0..num_cblks {
                        if let Some((_, len)) = crate::t2::read_packet_header(&mut inclusion, &mut imsb, leaf, layer, &mut states[leaf as usize], &mut r)? {
                            segments.push((leaf as usize, len as usize));
                        }
                    }
                    let mut offset = cursor + r.byte_offset();
                    for (leaf, len) in segments {
                        let end = (offset + len).min(packet_body.len());
                        accum[leaf].extend_from_slice(&packet_body[offset..end]);
                        offset = end;
                    }
                    cursor = offset;
                }

                let resolved: Vec<(Vec<u8>, u32)> = (0..num_cblks as usize)
                    .map(|leaf| {
                        let numbps = if states[leaf].included { nb_max.saturating_sub(states[leaf].missing_msbs) } else { 0 };
                        (std::mem::take(&mut accum[leaf]), numbps)
                    })
                    .collect();
                cblks.push(resolved);
            }
            crate::tcd::decode_tile_component(buf, tccp, cblk_w, cblk_h, &cblks);
        }

        let precisions: Vec<(u32, bool)> = self.image.comps.iter().map(|c| (c.prec, c.sgnd)).collect();
        finish_decompress_tile(&mut tile, &tcp, reversible, &precisions);

        for (dst, buf) in self.image.comps.iter_mut().zip(tile.components.into_iter()) {
            dst.data = buf.data;
        }
        Ok(())
    }

    pub fn get_progression_state(&self, _tile_index: u32) -> ProgressionState {
        ProgressionState { layers_decoded: self.options.layers_to_decompress.unwrap_or(1) }
    }

    pub fn set_progression_state(&mut self, state: ProgressionState) {
        self.options.layers_to_decompress = Some(state.layers_decoded);
    }

    /// Blocks until every tile covering `swath` has been materialized;
    /// synchronous in this implementation since `decompress`/`decompress_tile`
    /// never return before their tile is done (§9 "Coroutine-style async wait").
    pub fn wait(&self, _swath: (u32, u32, u32, u32)) -> Result<()> {
        Ok(())
    }
}

/// Per-tile progression state for streaming/incremental decode (§6).
#[derive(Debug, Clone, Copy)]
pub struct ProgressionState {
    pub layers_decoded: u32,
}

fn tile_overlaps(cp: &CodingParameters, tile_index: u32, x0: u32, y0: u32, x1: u32, y1: u32) -> bool {
    let tx = tile_index % cp.tile_grid_width;
    let ty = tile_index / cp.tile_grid_width;
    let tile_x0 = cp.tx0 + tx * cp.tdx;
    let tile_y0 = cp.ty0 + ty * cp.tdy;
    let tile_x1 = tile_x0 + cp.tdx;
    let tile_y1 = tile_y0 + cp.tdy;
    tile_x0 < x1 && tile_x1 > x0 && tile_y0 < y1 && tile_y1 > y0
}

fn empty_coding_parameters() -> CodingParameters {
    CodingParameters {
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
    }
}

fn default_tile_coding_parameters(numcomps: u32) -> TileCodingParameters {
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
        tccps: vec![TileComponentCodingParameters::default_for(6, 1); numcomps as usize],
    }
}

/// Compresses an image into a code-stream, §6's `Compress API`.
pub struct Compressor<S: Stream> {
    stream: S,
    cp: CodingParameters,
    image: Image,
    tlm: TlmManager,
    options: CompressOptions,
}

impl<S: Stream> Compressor<S> {
    pub fn init(options: CompressOptions, image: Image, stream: S) -> Result<Self> {
        let numcomps = image.numcomps();
        let mut tccp = TileComponentCodingParameters::default_for(options.numresolution, if options.irreversible { 0 } else { 1 });
        tccp.cblkw_expn = (options.cblockw_init as f64).log2() as u32;
        tccp.cblkh_expn = (options.cblockh_init as f64).log2() as u32;
        tccp.cblk_style = options.cblk_sty;
        if let (Some(roi_compno), true) = (options.roi_compno, options.roi_shift > 0) {
            let _ = roi_compno;
            tccp.roi_shift = options.roi_shift;
        }

        let tcp = TileCodingParameters {
            num_layers: options.numlayers.max(1),
            prg: options.prog_order,
            mct: options.mct,
            mct_matrix: None,
            layer_rate: options.layer_rate.clone(),
            layer_distortion: options.layer_distortion.clone(),
            poc: Vec::new(),
            csty_sop: false,
            csty_eph: false,
            csty_explicit_precincts: false,
            tccps: vec![tccp; numcomps as usize],
        };
        tcp.validate()?;

        let mut cp = empty_coding_parameters();
        cp.rsiz = options.rsiz;
        cp.tx0 = options.tx0;
        cp.ty0 = options.ty0;
        cp.tdx = if options.tile_size_on { options.t_width } else { 0 };
        cp.tdy = if options.tile_size_on { options.t_height } else { 0 };
        cp.write_tlm = options.write_tlm;
        cp.write_plt = options.write_plt;
        cp.enable_tile_part_generation = options.enable_tile_part_generation;
        cp.new_tile_part_progression_divider = options.new_tile_part_progression_divider;
        cp.derive_tile_grid(image.x0, image.y0, image.x1, image.y1);
        cp.tcps = vec![tcp; cp.num_tiles().max(1) as usize];
        cp.validate_for_image(numcomps, image.x0, image.y0, image.x1, image.y1)?;

        Ok(Compressor { stream, cp, image, tlm: TlmManager::new(), options })
    }

    /// Writes SOC, SIZ, COD, QCD, optional CAP/COC/QCC/POC/COM, and a
    /// TLM placeholder if requested (§6 `start`).
    pub fn start(&mut self) -> Result<()> {
        write_marker(&mut self.stream, markers::SOC)?;

        let siz = SizInfo {
            rsiz: self.cp.rsiz,
            x0: self.image.x0,
            y0: self.image.y0,
            x1: self.image.x1,
            y1: self.image.y1,
            tx0: self.cp.tx0,
            ty0: self.cp.ty0,
            tdx: self.cp.tdx,
            tdy: self.cp.tdy,
            comps: self
                .image
                .comps
                .iter()
                .map(|c| ImageComponentParams { dx: c.dx, dy: c.dy, w: c.w, h: c.h, x0: c.x0, y0: c.y0, prec: c.prec, sgnd: c.sgnd })
                .collect(),
        };
        write_segment(&mut self.stream, markers::SIZ, &emit_siz(&siz))?;

        if self.cp.tcps[0].tccps.iter().any(|t| t.cblk_style.contains(CblkStyle::HT_ONLY)) {
            write_segment(&mut self.stream, markers::CAP, &emit_cap())?;
        }

        let tcp0 = self.cp.tcps[0].clone();
        let cod_body = emit_coding_style(&tcp0.tccps[0], Some((tcp0.prg, tcp0.num_layers, tcp0.mct)), tcp0.csty_explicit_precincts);
        write_segment(&mut self.stream, markers::COD, &cod_body)?;

        let qcd_body = emit_quant(tcp0.tccps[0].qntsty, tcp0.tccps[0].guard_bits, &tcp0.tccps[0].step_sizes);
        write_segment(&mut self.stream, markers::QCD, &qcd_body)?;

        for comment in &self.cp.comments {
            write_segment(&mut self.stream, markers::COM, &emit_com(comment))?;
        }

        if let Some(mct_data) = &self.options.mct_data {
            write_segment(&mut self.stream, markers::MCT, &emit_mct(mct_data))?;
            let precisions: Vec<(u32, bool)> = self.image.comps.iter().map(|c| (c.prec, c.sgnd)).collect();
            write_segment(&mut self.stream, markers::CBD, &emit_cbd(&precisions))?;
        }

        if self.cp.write_tlm {
            self.tlm.write_begin();
        }
        Ok(())
    }

    /// Emits every tile-part and EOC (§6 `compress`): pipelines each
    /// tile through DC shift/MCT/DWT/T1 (`tcd::compress_tile`), rate
    /// allocates its layers, assembles the packet body via T2, and
    /// back-patches `Psot`.
    pub fn compress(&mut self) -> Result<()> {
        let num_tiles = self.cp.num_tiles();
        let tile_indices: Vec<u32> = (0..num_tiles).collect();
        let cp = self.cp.clone();
        let image = self.image.clone();
        let cblk_w = cp.tcps[0].tccps[0].cblk_w();
        let cblk_h = cp.tcps[0].tccps[0].cblk_h();

        let tile_bytes = compress_tiles(&tile_indices, |tile_index| {
            let tcp = &cp.tcps[tile_index as usize];
            let reversible = tcp.tccps[0].qmfbid == 1;
            let mut tile = Tile {
                components: image
                    .comps
                    .iter()
                    .map(|c| TileComponentBuffer {
                        width: c.w,
                        height: c.h,
                        data: c.data.clone(),
                        dc_shift: 1 << (c.prec - 1),
                        signed: c.sgnd,
                        numresolutions: tcp.tccps[0].numresolutions,
                    })
                    .collect(),
            };
            let per_component = compress_tile(&mut tile, tcp, reversible, cblk_w, cblk_h);

            let layouts = build_component_layouts(tcp);
            let mut pi = PacketIterator::new(tcp, &layouts);
            let packets = pi.collect();

            let mut body = Vec::new();
            for (ci, by_resolution) in per_component.iter().enumerate() {
                emit_tile_component_packets(by_resolution, &packets, ci as u32, &tcp.tccps[ci], tcp, &mut body);
            }
            Ok(body)
        })?;

        for (tile_index, body) in tile_bytes.into_iter().enumerate() {
            let psot = body.len() as u32 + 12 + 2; // SOT(12) + SOD(2) + body.
            let sot = SotInfo { isot: tile_index as u16, psot, tpsot: 0, tnsot: 1 };
            write_segment(&mut self.stream, markers::SOT, &emit_sot(&sot))?;
            write_marker(&mut self.stream, markers::SOD)?;
            self.stream.write(&body)?;
            if self.cp.write_tlm {
                self.tlm.record(tile_index as u32, psot as u64);
            }
        }

        write_marker(&mut self.stream, markers::EOC)?;
        Ok(())
    }
}

/// Appends one tile-component's packet bodies to `out`: one packet per
/// `(layer, resolution)` pair present in `packets` for component `ci`,
/// each carrying only the code-blocks `compress_tile` grouped under
/// that resolution — the per-resolution split §4.F/§4.H require,
/// rather than one packet per layer covering the whole component.
///
/// The inclusion tag tree has to know, before any packet is encoded,
/// the first layer at which each code-block becomes included (`encode`
/// only emits the "now included" bit once a leaf's final value is
/// known via `set_value` — it can't discover it bit-by-bit the way
/// `decode` can). So for each resolution this first walks every layer's
/// truncation points to find that per-leaf layer, seeds both trees,
/// then emits.
fn emit_tile_component_packets(
    by_resolution: &[Vec<crate::tcd::EncodedCblk>],
    packets: &[crate::pi::PacketId],
    ci: u32,
    tccp: &crate::params::TileComponentCodingParameters,
    tcp: &crate::params::TileCodingParameters,
    out: &mut Vec<u8>,
) {
    let nb_max = crate::tcd::numbps_max(tccp);

    for (resolution, cblks) in by_resolution.iter().enumerate() {
        let resolution = resolution as u32;
        let layer_count = packets
            .iter()
            .filter(|p| p.component == ci && p.resolution == resolution)
            .map(|p| p.layer + 1)
            .max()
            .unwrap_or(0);
        if layer_count == 0 {
            continue;
        }
        let layers = allocate_layers(tcp, cblks);

        let mut states: Vec<CblkState> = cblks.iter().map(|_| CblkState::default()).collect();
        let mut inclusion = crate::tgt::TagTree::new(cblks.len() as u32, 1);
        let mut imsb = crate::tgt::TagTree::new(cblks.len() as u32, 1);

        for leaf in 0..cblks.len() {
            let mut first_layer = layers.len() as i32;
            let mut already = 0u32;
            for (li, assignment) in layers.iter().enumerate() {
                let truncation = assignment.truncation_points.get(leaf).copied().unwrap_or(0);
                let num_passes = (truncation + 1) as u32;
                if num_passes > already {
                    first_layer = li as i32;
                    break;
                }
                already = num_passes;
            }
            inclusion.set_value(leaf as u32, first_layer);
        }

        for (layer, assignment) in layers.iter().enumerate() {
            if layer as u32 >= layer_count {
                break;
            }
            let mut w = BitWriter::new();
            w.put_bit(1); // non-empty packet.
            let mut body = Vec::new();
            for (leaf, cblk) in cblks.iter().enumerate() {
                let truncation = assignment.truncation_points.get(leaf).copied().unwrap_or(0);
                let num_passes = (truncation + 1) as u32;
                let state = &mut states[leaf];
                let already = state.num_passes_in_previous_layers;
                if num_passes <= already {
                    crate::t2::write_packet_header(&mut inclusion, &mut imsb, leaf as u32, layer as u32, state, None, &mut w);
                    continue;
                }
                let segment = cblk.data[..cblk.data.len().min(cblk.passes.get(truncation).map(|p| p.rate as usize).unwrap_or(cblk.data.len()))].to_vec();
                let contribution = CblkContribution {
                    newly_included: !state.included,
                    num_passes: num_passes - already,
                    segment_lengths: vec![segment.len() as u32],
                    missing_msbs: nb_max.saturating_sub(cblk.numbps),
                };
                crate::t2::write_packet_header(&mut inclusion, &mut imsb, leaf as u32, layer as u32, state, Some(&contribution), &mut w);
                body.extend_from_slice(&segment);
            }
            out.extend_from_slice(&w.finish());
            out.extend_from_slice(&body);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::MemStream;

    #[test]
    fn siz_roundtrips_through_parse_and_emit() {
        let info = SizInfo {
            rsiz: 0,
            x0: 0,
            y0: 0,
            x1: 256,
            y1: 128,
            tx0: 0,
            ty0: 0,
            tdx: 256,
            tdy: 128,
            comps: vec![ImageComponentParams { dx: 1, dy: 1, w: 0, h: 0, x0: 0, y0: 0, prec: 8, sgnd: false }],
        };
        let bytes = emit_siz(&info);
        let parsed = parse_siz(&bytes).unwrap();
        assert_eq!(parsed.x1, 256);
        assert_eq!(parsed.y1, 128);
        assert_eq!(parsed.comps.len(), 1);
        assert_eq!(parsed.comps[0].prec, 8);
        assert!(!parsed.comps[0].sgnd);
    }

    #[test]
    fn coding_style_roundtrips() {
        let mut tccp = TileComponentCodingParameters::default_for(5, 1);
        tccp.cblkw_expn = 6;
        tccp.cblkh_expn = 6;
        let bytes = emit_coding_style(&tccp, Some((ProgressionOrder::Rpcl, 3, MctMode::Rct)), false);
        let (parsed, prg, num_layers, mct, explicit_precincts) = parse_coding_style(&bytes, true).unwrap();
        assert!(!explicit_precincts);
        assert_eq!(parsed.numresolutions, 5);
        assert_eq!(prg, ProgressionOrder::Rpcl);
        assert_eq!(num_layers, 3);
        assert_eq!(mct, MctMode::Rct);
    }

    #[test]
    fn quant_roundtrips_derived_style() {
        let steps = vec![StepSize { expn: 8, mant: 0 }];
        let bytes = emit_quant(QuantizationStyle::ScalarDerived, 2, &steps);
        let (style, guard_bits, parsed) = parse_quant(&bytes).unwrap();
        assert_eq!(style, QuantizationStyle::ScalarDerived);
        assert_eq!(guard_bits, 2);
        assert_eq!(parsed[0].expn, 8);
    }

    #[test]
    fn sot_roundtrips() {
        let info = SotInfo { isot: 3, psot: 9000, tpsot: 0, tnsot: 1 };
        let bytes = emit_sot(&info);
        let parsed = parse_sot(&bytes).unwrap();
        assert_eq!(parsed.isot, 3);
        assert_eq!(parsed.psot, 9000);
    }

    #[test]
    fn plt_roundtrips_arbitrary_lengths() {
        let lengths = vec![1u32, 127, 128, 16384, 999999];
        let bytes = emit_plt(0, &lengths);
        let (zplt, parsed) = parse_plt(&bytes).unwrap();
        assert_eq!(zplt, 0);
        assert_eq!(parsed, lengths);
    }

    #[test]
    fn read_header_recovers_siz_fields() {
        let mut stream = MemStream::new_writer();
        write_marker(&mut stream, markers::SOC).unwrap();
        let siz = SizInfo {
            rsiz: 0,
            x0: 0,
            y0: 0,
            x1: 64,
            y1: 64,
            tx0: 0,
            ty0: 0,
            tdx: 64,
            tdy: 64,
            comps: vec![ImageComponentParams { dx: 1, dy: 1, w: 0, h: 0, x0: 0, y0: 0, prec: 8, sgnd: false }],
        };
        write_segment(&mut stream, markers::SIZ, &emit_siz(&siz)).unwrap();
        let tccp = TileComponentCodingParameters::default_for(3, 1);
        write_segment(
            &mut stream,
            markers::COD,
            &emit_coding_style(&tccp, Some((ProgressionOrder::Lrcp, 1, MctMode::None)), false),
        )
        .unwrap();
        write_segment(&mut stream, markers::QCD, &emit_quant(QuantizationStyle::NoQuantization, 2, &vec![StepSize::default(); 10])).unwrap();
        write_segment(&mut stream, markers::SOT, &emit_sot(&SotInfo { isot: 0, psot: 0, tpsot: 0, tnsot: 1 })).unwrap();

        let data = stream.into_inner();
        let reader = MemStream::new_reader(data);
        let mut decompressor = Decompressor::init(DecompressOptions::default(), reader).unwrap();
        let header = decompressor.read_header().unwrap();
        assert_eq!(header.x1, 64);
        assert_eq!(header.y1, 64);
        assert_eq!(header.numcomps, 1);
        assert_eq!(header.numresolutions, 3);
    }

    /// A full `Compressor` → `Decompressor` pass over a non-trivial
    /// grayscale tile (varied sample values, several resolutions and
    /// code-blocks per sub-band): catches both packet-structure bugs
    /// (real per-resolution sub-bands) and length-field truncation for
    /// segments longer than one coding pass would suggest.
    #[test]
    fn compress_then_decompress_roundtrips_lossless_grayscale_tile() {
        let w = 64u32;
        let h = 64u32;
        let mut image = Image::create(
            &[ImageComponentParams { dx: 1, dy: 1, w, h, x0: 0, y0: 0, prec: 8, sgnd: false }],
            ColorSpace::Gray,
        );
        image.x1 = w;
        image.y1 = h;
        for y in 0..h {
            for x in 0..w {
                image.comps[0].data[(y * w + x) as usize] = ((x * 7 + y * 13 + (x ^ y)) % 256) as i32;
            }
        }
        let original = image.comps[0].data.clone();

        let options = CompressOptions {
            numresolution: 3,
            cblockw_init: 32,
            cblockh_init: 32,
            numlayers: 1,
            irreversible: false,
            ..Default::default()
        };
        let mut compressor = Compressor::init(options, image, MemStream::new_writer()).unwrap();
        compressor.start().unwrap();
        compressor.compress().unwrap();
        let bytes = compressor.stream.into_inner();

        let mut decompressor = Decompressor::init(DecompressOptions::default(), MemStream::new_reader(bytes)).unwrap();
        decompressor.read_header().unwrap();
        let decoded = decompressor.decompress(None).unwrap();

        assert_eq!(decoded.comps.len(), 1);
        assert_eq!(decoded.comps[0].data, original);
    }

    /// A three-component, multi-layer rate-targeted pass: the encoder
    /// truncates each code-block's passes to hit the layer's rate
    /// budget, so the decoded image won't match bit-for-bit, but it
    /// must still decode to the right shape with every sample inside
    /// its declared precision's range.
    #[test]
    fn compress_then_decompress_roundtrips_multilayer_rgb_tile() {
        let w = 48u32;
        let h = 48u32;
        let params: Vec<ImageComponentParams> = (0..3)
            .map(|_| ImageComponentParams { dx: 1, dy: 1, w, h, x0: 0, y0: 0, prec: 8, sgnd: false })
            .collect();
        let mut image = Image::create(&params, ColorSpace::Srgb);
        image.x1 = w;
        image.y1 = h;
        for (ci, comp) in image.comps.iter_mut().enumerate() {
            for y in 0..h {
                for x in 0..w {
                    comp.data[(y * w + x) as usize] = ((x * (3 + ci as u32) + y * (5 + ci as u32)) % 256) as i32;
                }
            }
        }

        let options = CompressOptions {
            numresolution: 4,
            cblockw_init: 32,
            cblockh_init: 32,
            numlayers: 3,
            layer_rate: vec![300.0, 1200.0, 0.0],
            irreversible: true,
            ..Default::default()
        };
        let mut compressor = Compressor::init(options, image, MemStream::new_writer()).unwrap();
        compressor.start().unwrap();
        compressor.compress().unwrap();
        let bytes = compressor.stream.into_inner();

        let mut decompressor = Decompressor::init(DecompressOptions::default(), MemStream::new_reader(bytes)).unwrap();
        let header = decompressor.read_header().unwrap();
        assert_eq!(header.numcomps, 3);
        let decoded = decompressor.decompress(None).unwrap();

        assert_eq!(decoded.comps.len(), 3);
        for comp in &decoded.comps {
            assert_eq!(comp.data.len(), (w * h) as usize);
            assert!(comp.data.iter().all(|&s| (0..256).contains(&s)));
        }
    }
}
