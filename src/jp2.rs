//! The JP2 box-format container (§6 "JP2 container"): wraps a raw
//! code-stream in `jP`/`ftyp`/`jp2h`/`jp2c` boxes so a reader can find
//! colour-space and bit-depth metadata without parsing SIZ/COD.
//!
//! Every box is framed as `length (4 bytes) | type (4 bytes) | content`,
//! with `length == 1` signalling an 8-byte `XLBox` length follows
//! immediately and `length == 0` meaning "runs to end of file" — both
//! forms are accepted on read; only the fixed 4-byte form (or XL, for a
//! code-stream past the 4 GiB boundary) is ever written.

use crate::error::{CodecError, Result};
use crate::image::ColorSpace;
use crate::stream::Stream;

fn box_type(bytes: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*bytes)
}

pub mod box_types {
    pub const JP: u32 = 0x6a502020;
    pub const FTYP: u32 = 0x66747970;
    pub const JP2H: u32 = 0x6a703268;
    pub const JP2C: u32 = 0x6a703263;
    pub const IHDR: u32 = 0x69686472;
    pub const BPCC: u32 = 0x62706363;
    pub const COLR: u32 = 0x636f6c72;
    pub const PCLR: u32 = 0x70636c72;
    pub const CMAP: u32 = 0x636d6170;
    pub const CDEF: u32 = 0x63646566;
    pub const RES: u32 = 0x72657320;
}

const JP2_SIGNATURE: [u8; 4] = [0x0d, 0x0a, 0x87, 0x0a];
const JP2_BRAND: u32 = 0x6a703220; // "jp2 "

/// One box's framing, already separated from its content (§6 "Box framing").
#[derive(Debug, Clone, Copy)]
struct BoxHeader {
    ty: u32,
    /// content length, i.e. box length minus the 8 (or 16, for XL) byte header.
    content_len: u64,
}

fn read_box_header(stream: &mut dyn Stream) -> Result<BoxHeader> {
    let length = stream.read_u32()?;
    let ty = stream.read_u32()?;
    match length {
        0 => {
            let remaining = stream.num_bytes_left()?;
            Ok(BoxHeader { ty, content_len: remaining })
        }
        1 => {
            let xl = stream.read_u64()?;
            if xl < 16 {
                return Err(CodecError::BadMarker("JP2 XLBox length below minimum".into()));
            }
            Ok(BoxHeader { ty, content_len: xl - 16 })
        }
        n if n < 8 => Err(CodecError::BadMarker(format!("JP2 box length {n} below minimum"))),
        n => Ok(BoxHeader { ty, content_len: (n - 8) as u64 }),
    }
}

fn write_box(stream: &mut dyn Stream, ty: u32, content: &[u8]) -> Result<()> {
    let total = content.len() as u64 + 8;
    if total <= u32::MAX as u64 {
        stream.write_u32(total as u32)?;
        stream.write_u32(ty)?;
    } else {
        stream.write_u32(1)?;
        stream.write_u32(ty)?;
        stream.write_u64(total + 8)?;
    }
    stream.write(content)?;
    Ok(())
}

/// IHDR box contents (§6 "Image Header box").
#[derive(Debug, Clone, Copy)]
pub struct ImageHeaderBox {
    pub height: u32,
    pub width: u32,
    pub numcomps: u16,
    /// `0xff` means per-component depths are in a following BPCC box.
    pub bpc: u8,
    pub compression_type: u8,
    pub unknown_colorspace: bool,
    pub intellectual_property: bool,
}

fn parse_ihdr(body: &[u8]) -> Result<ImageHeaderBox> {
    if body.len() < 14 {
        return Err(CodecError::BadMarker("IHDR box too short".into()));
    }
    Ok(ImageHeaderBox {
        height: u32::from_be_bytes([body[0], body[1], body[2], body[3]]),
        width: u32::from_be_bytes([body[4], body[5], body[6], body[7]]),
        numcomps: u16::from_be_bytes([body[8], body[9]]),
        bpc: body[10],
        compression_type: body[11],
        unknown_colorspace: body[12] != 0,
        intellectual_property: body[13] != 0,
    })
}

fn emit_ihdr(ihdr: &ImageHeaderBox) -> Vec<u8> {
    let mut body = Vec::with_capacity(14);
    body.extend_from_slice(&ihdr.height.to_be_bytes());
    body.extend_from_slice(&ihdr.width.to_be_bytes());
    body.extend_from_slice(&ihdr.numcomps.to_be_bytes());
    body.push(ihdr.bpc);
    body.push(ihdr.compression_type);
    body.push(ihdr.unknown_colorspace as u8);
    body.push(ihdr.intellectual_property as u8);
    body
}

fn parse_bpcc(body: &[u8]) -> Vec<(u32, bool)> {
    body.iter().map(|&b| ((b & 0x7f) as u32 + 1, b & 0x80 != 0)).collect()
}

fn emit_bpcc(depths: &[(u32, bool)]) -> Vec<u8> {
    depths.iter().map(|&(prec, sgnd)| ((sgnd as u8) << 7) | ((prec - 1) as u8 & 0x7f)).collect()
}

/// COLR box contents (§6 "Colour Specification box"): either a
/// registered enumerated colourspace or an embedded ICC profile.
#[derive(Debug, Clone)]
pub enum ColourSpecification {
    Enumerated(ColorSpace),
    IccProfile(Vec<u8>),
}

fn enum_cs_to_u32(cs: ColorSpace) -> Option<u32> {
    match cs {
        ColorSpace::Srgb => Some(16),
        ColorSpace::Gray => Some(17),
        ColorSpace::Sycc => Some(18),
        ColorSpace::EYcc => Some(19),
        ColorSpace::CmykNative => Some(12),
        ColorSpace::Unknown => None,
    }
}

fn u32_to_enum_cs(v: u32) -> ColorSpace {
    match v {
        16 => ColorSpace::Srgb,
        17 => ColorSpace::Gray,
        18 => ColorSpace::Sycc,
        19 => ColorSpace::EYcc,
        12 => ColorSpace::CmykNative,
        _ => ColorSpace::Unknown,
    }
}

fn parse_colr(body: &[u8]) -> Result<ColourSpecification> {
    if body.is_empty() {
        return Err(CodecError::BadMarker("COLR box empty".into()));
    }
    let method = body[0];
    match method {
        1 => {
            if body.len() < 7 {
                return Err(CodecError::BadMarker("COLR enumerated form too short".into()));
            }
            let enumcs = u32::from_be_bytes([body[3], body[4], body[5], body[6]]);
            Ok(ColourSpecification::Enumerated(u32_to_enum_cs(enumcs)))
        }
        2 => Ok(ColourSpecification::IccProfile(body[3..].to_vec())),
        other => Err(CodecError::BadMarker(format!("unknown COLR method {other}"))),
    }
}

fn emit_colr(spec: &ColourSpecification) -> Vec<u8> {
    let mut body = Vec::new();
    match spec {
        ColourSpecification::Enumerated(cs) => {
            body.push(1); // METH: enumerated.
            body.push(0); // PREC
            body.push(0); // APPROX
            let enumcs = enum_cs_to_u32(*cs).unwrap_or(16);
            body.extend_from_slice(&enumcs.to_be_bytes());
        }
        ColourSpecification::IccProfile(icc) => {
            body.push(2); // METH: restricted ICC profile.
            body.push(0);
            body.push(0);
            body.extend_from_slice(icc);
        }
    }
    body
}

/// Parsed `jp2h` metadata plus the raw code-stream bytes from `jp2c`
/// (§6 "JP2 container" `read` operation).
pub struct Jp2File {
    pub ihdr: ImageHeaderBox,
    pub component_depths: Vec<(u32, bool)>,
    pub colour: Option<ColourSpecification>,
    pub codestream: Vec<u8>,
}

/// Reads a JP2 file's boxes up through (and including) `jp2c`; any box
/// type this container doesn't recognise is warned-and-skipped, since a
/// reader that rejects unknown boxes can't tolerate future extensions.
pub fn read_jp2(stream: &mut dyn Stream) -> Result<Jp2File> {
    let sig = read_box_header(stream)?;
    if sig.ty != box_type(&[b'j', b'P', b' ', b' ']) {
        return Err(CodecError::BadMarker("JP2 file does not start with the jP signature box".into()));
    }
    let mut sig_body = vec![0u8; sig.content_len as usize];
    stream.read_exact(&mut sig_body)?;
    if sig_body != JP2_SIGNATURE {
        return Err(CodecError::BadMarker("JP2 signature box content mismatch".into()));
    }

    let ftyp = read_box_header(stream)?;
    if ftyp.ty != box_types::FTYP {
        return Err(CodecError::BadMarker("ftyp must follow jP".into()));
    }
    stream.skip(ftyp.content_len as i64)?;

    let mut ihdr = None;
    let mut component_depths = Vec::new();
    let mut colour = None;

    loop {
        let hdr = read_box_header(stream)?;
        match hdr.ty {
            box_types::JP2H => {
                let end = stream.tell()? + hdr.content_len;
                while stream.tell()? < end {
                    let sub = read_box_header(stream)?;
                    let mut body = vec![0u8; sub.content_len as usize];
                    stream.read_exact(&mut body)?;
                    match sub.ty {
                        box_types::IHDR => ihdr = Some(parse_ihdr(&body)?),
                        box_types::BPCC => component_depths = parse_bpcc(&body),
                        box_types::COLR => colour = Some(parse_colr(&body)?),
                        _ => log::debug!("ignoring jp2h sub-box {:#010x}", sub.ty),
                    }
                }
            }
            box_types::JP2C => {
                let mut codestream = vec![0u8; hdr.content_len as usize];
                stream.read_exact(&mut codestream)?;
                let ihdr = ihdr.ok_or_else(|| CodecError::BadMarker("jp2c appeared before jp2h/ihdr".into()))?;
                if component_depths.is_empty() {
                    component_depths = vec![((ihdr.bpc & 0x7f) as u32 + 1, ihdr.bpc & 0x80 != 0); ihdr.numcomps as usize];
                }
                return Ok(Jp2File { ihdr, component_depths, colour, codestream });
            }
            other if other & 0xffff0000 == 0 => {
                return Err(CodecError::BadMarker(format!("malformed JP2 box type {other:#010x}")));
            }
            _ => {
                log::warn!("skipping unrecognised top-level JP2 box {:#010x}", hdr.ty);
                stream.skip(hdr.content_len as i64)?;
            }
        }
    }
}

/// Writes a minimal but complete JP2 file: `jP`, `ftyp`, `jp2h` (with
/// `ihdr`, an optional `bpcc` when component depths vary, and `colr`),
/// then `jp2c` wrapping the already-compressed code-stream.
pub fn write_jp2(
    stream: &mut dyn Stream,
    ihdr: &ImageHeaderBox,
    component_depths: &[(u32, bool)],
    colour: &ColourSpecification,
    codestream: &[u8],
) -> Result<()> {
    write_box(stream, box_type(&[b'j', b'P', b' ', b' ']), &JP2_SIGNATURE)?;

    let mut ftyp_body = Vec::new();
    ftyp_body.extend_from_slice(&JP2_BRAND.to_be_bytes());
    ftyp_body.extend_from_slice(&0u32.to_be_bytes()); // minor version.
    ftyp_body.extend_from_slice(&JP2_BRAND.to_be_bytes()); // one compatible brand.
    write_box(stream, box_types::FTYP, &ftyp_body)?;

    let uniform_depth = component_depths.iter().all(|d| *d == component_depths[0]);
    let mut jp2h_body = Vec::new();
    write_box(&mut VecStream(&mut jp2h_body), box_types::IHDR, &emit_ihdr(ihdr))?;
    if !uniform_depth {
        write_box(&mut VecStream(&mut jp2h_body), box_types::BPCC, &emit_bpcc(component_depths))?;
    }
    write_box(&mut VecStream(&mut jp2h_body), box_types::COLR, &emit_colr(colour))?;
    write_box(stream, box_types::JP2H, &jp2h_body)?;

    write_box(stream, box_types::JP2C, codestream)?;
    Ok(())
}

/// Adapts a `&mut Vec<u8>` to the `Stream` trait so box-writing helpers
/// can be reused for both the top-level stream and a `jp2h` sub-buffer.
struct VecStream<'a>(&'a mut Vec<u8>);

impl<'a> Stream for VecStream<'a> {
    fn read(&mut self, _buf: &mut [u8]) -> Result<usize> {
        Ok(0)
    }
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.0.extend_from_slice(buf);
        Ok(buf.len())
    }
    fn skip(&mut self, _n: i64) -> Result<()> {
        Ok(())
    }
    fn seek(&mut self, _pos: u64) -> Result<()> {
        Ok(())
    }
    fn tell(&mut self) -> Result<u64> {
        Ok(self.0.len() as u64)
    }
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
    fn num_bytes_left(&mut self) -> Result<u64> {
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::MemStream;

    #[test]
    fn ihdr_roundtrips() {
        let ihdr = ImageHeaderBox {
            height: 480,
            width: 640,
            numcomps: 3,
            bpc: 7, // 8-bit unsigned.
            compression_type: 7,
            unknown_colorspace: false,
            intellectual_property: false,
        };
        let body = emit_ihdr(&ihdr);
        let parsed = parse_ihdr(&body).unwrap();
        assert_eq!(parsed.width, 640);
        assert_eq!(parsed.height, 480);
        assert_eq!(parsed.numcomps, 3);
    }

    #[test]
    fn colr_enumerated_roundtrips() {
        let spec = ColourSpecification::Enumerated(ColorSpace::Srgb);
        let body = emit_colr(&spec);
        match parse_colr(&body).unwrap() {
            ColourSpecification::Enumerated(cs) => assert_eq!(cs, ColorSpace::Srgb),
            _ => panic!("expected enumerated colourspace"),
        }
    }

    #[test]
    fn write_then_read_jp2_recovers_codestream_and_ihdr() {
        let ihdr = ImageHeaderBox {
            height: 16,
            width: 16,
            numcomps: 1,
            bpc: 7,
            compression_type: 7,
            unknown_colorspace: false,
            intellectual_property: false,
        };
        let codestream = vec![0xffu8, 0x4f, 0xff, 0xd9]; // SOC, EOC: a minimal stand-in.
        let mut writer = MemStream::new_writer();
        write_jp2(
            &mut writer,
            &ihdr,
            &[(8, false)],
            &ColourSpecification::Enumerated(ColorSpace::Gray),
            &codestream,
        )
        .unwrap();

        let bytes = writer.into_inner();
        let mut reader = MemStream::new_reader(bytes);
        let parsed = read_jp2(&mut reader).unwrap();
        assert_eq!(parsed.ihdr.width, 16);
        assert_eq!(parsed.ihdr.height, 16);
        assert_eq!(parsed.codestream, codestream);
        match parsed.colour {
            Some(ColourSpecification::Enumerated(cs)) => assert_eq!(cs, ColorSpace::Gray),
            _ => panic!("expected enumerated colourspace"),
        }
    }
}
