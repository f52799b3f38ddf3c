//! The `Image` data model (§3): a canvas shared by `numcomps` components,
//! each with its own subsampling, precision and signedness.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorSpace {
    Unknown,
    Srgb,
    Gray,
    Sycc,
    EYcc,
    CmykNative,
}

/// One image component's geometry and sample buffer.
#[derive(Debug, Clone)]
pub struct ImageComponent {
    /// horizontal/vertical subsampling factor relative to the canvas.
    pub dx: u32,
    pub dy: u32,
    pub w: u32,
    pub h: u32,
    pub x0: u32,
    pub y0: u32,
    /// bit depth, 1..=38.
    pub prec: u32,
    pub bpp: u32,
    pub sgnd: bool,
    pub data: Vec<i32>,
}

impl ImageComponent {
    pub fn new(dx: u32, dy: u32, prec: u32, sgnd: bool) -> Self {
        ImageComponent {
            dx,
            dy,
            w: 0,
            h: 0,
            x0: 0,
            y0: 0,
            prec,
            bpp: prec,
            sgnd,
            data: Vec::new(),
        }
    }

    pub fn set_dims(&mut self, w: u32, h: u32) {
        self.w = w;
        self.h = h;
        self.data.resize((w as usize) * (h as usize), 0);
    }

    /// Clamp every sample into the representable range for `prec`/`sgnd`.
    pub fn clip(&mut self) {
        let (lo, hi) = sample_range(self.prec, self.sgnd);
        for s in self.data.iter_mut() {
            *s = (*s).clamp(lo, hi);
        }
    }
}

/// Inclusive sample range for a given precision/signedness, used both to
/// validate decoded output and to clamp after the inverse DC level shift.
pub fn sample_range(prec: u32, sgnd: bool) -> (i32, i32) {
    if sgnd {
        let half = 1i64 << (prec - 1);
        (-(half as i32), (half - 1) as i32)
    } else {
        let max = (1i64 << prec) - 1;
        (0, max as i32)
    }
}

/// Parameters supplied by a caller to construct a fresh (compress-side)
/// image component, mirroring `opj_image_comptparm`.
#[derive(Debug, Clone, Copy)]
pub struct ImageComponentParams {
    pub dx: u32,
    pub dy: u32,
    pub w: u32,
    pub h: u32,
    pub x0: u32,
    pub y0: u32,
    pub prec: u32,
    pub sgnd: bool,
}

/// The shared canvas `(x0,y0)-(x1,y1)` plus its components.
#[derive(Debug, Clone)]
pub struct Image {
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
    pub color_space: ColorSpace,
    pub comps: Vec<ImageComponent>,
    pub icc_profile: Option<Vec<u8>>,
}

impl Image {
    pub fn create(params: &[ImageComponentParams], color_space: ColorSpace) -> Self {
        let comps = params
            .iter()
            .map(|p| {
                let mut c = ImageComponent::new(p.dx, p.dy, p.prec, p.sgnd);
                c.x0 = p.x0;
                c.y0 = p.y0;
                c.set_dims(p.w, p.h);
                c
            })
            .collect();
        Image {
            x0: 0,
            y0: 0,
            x1: 0,
            y1: 0,
            color_space,
            comps,
            icc_profile: None,
        }
    }

    pub fn numcomps(&self) -> u32 {
        self.comps.len() as u32
    }

    /// Clamp every component's samples to its declared precision/signedness.
    pub fn clip_all(&mut self) {
        for c in self.comps.iter_mut() {
            c.clip();
        }
    }
}
