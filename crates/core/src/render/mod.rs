use image::RgbaImage;
use tracing::debug;

use crate::{
    assets::ClipLibrary,
    config::{ChromaKeyConfig, OutputConfig},
    scheduler::RenderLayer,
};

/// Placement of a source inside the output surface, in surface pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitRect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// Largest rectangle with the source's aspect ratio that fits inside the
/// target, centred (letterbox or pillarbox, never cropped).
pub fn aspect_fit(source: (u32, u32), target: (u32, u32)) -> FitRect {
    let (sw, sh) = (source.0.max(1) as f32, source.1.max(1) as f32);
    let (tw, th) = (target.0 as f32, target.1 as f32);
    let scale = (tw / sw).min(th / sh);
    let (width, height) = (sw * scale, sh * scale);
    FitRect {
        x: (tw - width) / 2.0,
        y: (th - height) / 2.0,
        width,
        height,
    }
}

/// Green-dominance key colour test.
pub fn is_key_color(r: u8, g: u8, b: u8, config: &ChromaKeyConfig) -> bool {
    let green = f32::from(g);
    g > config.green_floor
        && green > f32::from(r) * config.dominance
        && green > f32::from(b) * config.dominance
}

/// Zeroes the alpha of every key-coloured pixel in an RGBA8 buffer.
pub fn apply_chroma_key(rgba: &mut [u8], config: &ChromaKeyConfig) {
    for px in rgba.chunks_exact_mut(4) {
        if is_key_color(px[0], px[1], px[2], config) {
            px[3] = 0;
        }
    }
}

/// Straight-alpha source-over of one pixel.
pub fn over(dst: [u8; 4], src: [u8; 4], opacity: f32) -> [u8; 4] {
    let sa = f32::from(src[3]) / 255.0 * opacity.clamp(0.0, 1.0);
    if sa <= 0.0 {
        return dst;
    }
    let da = f32::from(dst[3]) / 255.0;
    let out_a = sa + da * (1.0 - sa);

    let mut out = [0u8; 4];
    for i in 0..3 {
        let c = (f32::from(src[i]) * sa + f32::from(dst[i]) * da * (1.0 - sa)) / out_a;
        out[i] = c.round().clamp(0.0, 255.0) as u8;
    }
    out[3] = (out_a * 255.0).round().clamp(0.0, 255.0) as u8;
    out
}

/// Nearest-neighbour scales `src` into `rect` on `dst`, blending with `over`.
pub fn draw_scaled(dst: &mut RgbaImage, src: &RgbaImage, rect: FitRect, opacity: f32) {
    let (src_w, src_h) = src.dimensions();
    if src_w == 0 || src_h == 0 || rect.width <= 0.0 || rect.height <= 0.0 || opacity <= 0.0 {
        return;
    }

    let (dst_w, dst_h) = dst.dimensions();
    let x0 = rect.x.round().max(0.0) as u32;
    let y0 = rect.y.round().max(0.0) as u32;
    let x1 = ((rect.x + rect.width).round().max(0.0) as u32).min(dst_w);
    let y1 = ((rect.y + rect.height).round().max(0.0) as u32).min(dst_h);

    for y in y0..y1 {
        let v = ((y as f32 + 0.5 - rect.y) / rect.height * src_h as f32) as u32;
        let sy = v.min(src_h - 1);
        for x in x0..x1 {
            let u = ((x as f32 + 0.5 - rect.x) / rect.width * src_w as f32) as u32;
            let sx = u.min(src_w - 1);
            let s = src.get_pixel(sx, sy).0;
            let d = dst.get_pixel_mut(x, y);
            d.0 = over(d.0, s, opacity);
        }
    }
}

/// Number of keyed frames kept alive at once: one per crossfade layer.
const SCRATCH_SLOTS: usize = 2;

/// Reusable buffers for the chroma-key pass. One image is kept per source
/// resolution, up to one per crossfade layer, so a fade between clips of
/// different sizes reuses both buffers every frame. A new image is allocated
/// only when a resolution not currently held shows up.
#[derive(Debug, Default)]
pub struct ScratchBuffer {
    // Least recently used first.
    images: Vec<RgbaImage>,
    reallocations: usize,
}

impl ScratchBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies `source` into the buffer matching its resolution and returns it.
    pub fn load(&mut self, source: &RgbaImage) -> &mut RgbaImage {
        let dims = source.dimensions();
        let image = match self.images.iter().position(|image| image.dimensions() == dims) {
            Some(index) => self.images.remove(index),
            None => {
                if self.images.len() >= SCRATCH_SLOTS {
                    self.images.remove(0);
                }
                self.reallocations += 1;
                debug!(width = dims.0, height = dims.1, "scratch buffer allocated");
                RgbaImage::new(dims.0, dims.1)
            }
        };
        self.images.push(image);
        let last = self.images.len() - 1;
        let image = &mut self.images[last];
        image.copy_from_slice(source.as_raw());
        image
    }

    /// Allocations made since creation.
    pub fn reallocations(&self) -> usize {
        self.reallocations
    }

    /// Resolution of the most recently loaded frame.
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        self.images.last().map(RgbaImage::dimensions)
    }

    /// Number of buffers currently held.
    pub fn held(&self) -> usize {
        self.images.len()
    }
}

/// Draws the scheduler's active clip(s) onto the output surface.
#[derive(Debug)]
pub struct Compositor {
    width: u32,
    height: u32,
    surface: Option<RgbaImage>,
    scratch: ScratchBuffer,
    chroma: ChromaKeyConfig,
}

impl Compositor {
    pub fn new(output: &OutputConfig, chroma: ChromaKeyConfig) -> Self {
        Self {
            width: output.width,
            height: output.height,
            surface: None,
            scratch: ScratchBuffer::new(),
            chroma,
        }
    }

    /// The last composited frame; `None` until the first render.
    pub fn surface(&self) -> Option<&RgbaImage> {
        self.surface.as_ref()
    }

    /// Chroma-key buffers, exposed for allocation accounting.
    pub fn scratch(&self) -> &ScratchBuffer {
        &self.scratch
    }

    pub fn chroma(&self) -> &ChromaKeyConfig {
        &self.chroma
    }

    pub fn set_chroma_enabled(&mut self, enabled: bool) {
        self.chroma.enabled = enabled;
    }

    /// Clears the surface, draws the background when keying composites it,
    /// then draws each layer in order, outgoing clip first.
    pub fn render<I>(&mut self, layers: I, library: &ClipLibrary)
    where
        I: IntoIterator<Item = RenderLayer>,
    {
        let (width, height) = (self.width, self.height);
        let surface = self
            .surface
            .get_or_insert_with(|| RgbaImage::new(width, height));
        surface.fill(0);

        if self.chroma.enabled && self.chroma.composite_background {
            if let Some(background) = library.background() {
                let full = FitRect {
                    x: 0.0,
                    y: 0.0,
                    width: width as f32,
                    height: height as f32,
                };
                draw_scaled(surface, background.image(), full, 1.0);
            }
        }

        for layer in layers {
            let Some(frame) = library.frame(layer.handle) else {
                continue;
            };
            let rect = aspect_fit(frame.dimensions(), (width, height));
            if self.chroma.enabled {
                let keyed = self.scratch.load(frame);
                apply_chroma_key(keyed, &self.chroma);
                draw_scaled(surface, keyed, rect, layer.opacity);
            } else {
                draw_scaled(surface, frame, rect, layer.opacity);
            }
        }
    }
}
