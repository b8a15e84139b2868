//! Render engine seam and the built-in software rasterizer.

use std::collections::HashMap;

use framebridge_common::error::{BridgeError, BridgeResult};

use crate::layer::{BackgroundMode, Layer, LayerContent, Rgba, CHROMA_GREEN};
use crate::protocol::BackgroundPolicy;

/// 75% SMPTE colour bars, left to right.
const COLOR_BARS: [Rgba; 7] = [
    [191, 191, 191, 255],
    [191, 191, 0, 255],
    [0, 191, 191, 255],
    [0, 191, 0, 255],
    [191, 0, 191, 255],
    [191, 0, 0, 255],
    [0, 0, 191, 255],
];

/// Straight-alpha RGBA8 pixel buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Surface {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl Surface {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![0u8; width as usize * height as usize * 4],
        }
    }

    /// Resize in place, keeping the allocation when possible.
    pub fn reset(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
        self.pixels.clear();
        self.pixels.resize(width as usize * height as usize * 4, 0);
    }

    pub fn clear(&mut self, color: Rgba) {
        for px in self.pixels.chunks_exact_mut(4) {
            px.copy_from_slice(&color);
        }
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<Rgba> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = (y as usize * self.width as usize + x as usize) * 4;
        Some([
            self.pixels[i],
            self.pixels[i + 1],
            self.pixels[i + 2],
            self.pixels[i + 3],
        ])
    }

    /// Nearest-neighbour copy of `src` stretched over the whole surface.
    fn stretch_from(&mut self, src_width: u32, src_height: u32, src: &[u8]) {
        if src_width == 0 || src_height == 0 {
            return;
        }
        for y in 0..self.height {
            let sy = (y as u64 * src_height as u64 / self.height.max(1) as u64) as usize;
            for x in 0..self.width {
                let sx = (x as u64 * src_width as u64 / self.width.max(1) as u64) as usize;
                let s = (sy * src_width as usize + sx) * 4;
                let d = (y as usize * self.width as usize + x as usize) * 4;
                let over = [src[s], src[s + 1], src[s + 2], src[s + 3]];
                let under = [
                    self.pixels[d],
                    self.pixels[d + 1],
                    self.pixels[d + 2],
                    self.pixels[d + 3],
                ];
                self.pixels[d..d + 4].copy_from_slice(&source_over(over, under, 1.0));
            }
        }
    }

    /// Composite `src` onto this surface at `(x, y)` scaled by `scale`.
    pub fn composite(&mut self, src: &Surface, x: f32, y: f32, scale: f32, opacity: f32) {
        if src.width == 0 || src.height == 0 || opacity <= 0.0 {
            return;
        }
        let dst_w = (src.width as f32 * scale).round().max(0.0) as i64;
        let dst_h = (src.height as f32 * scale).round().max(0.0) as i64;
        let origin_x = x.round() as i64;
        let origin_y = y.round() as i64;

        let x0 = origin_x.max(0);
        let y0 = origin_y.max(0);
        let x1 = (origin_x + dst_w).min(self.width as i64);
        let y1 = (origin_y + dst_h).min(self.height as i64);

        for dy in y0..y1 {
            let sy = (((dy - origin_y) as f32 / scale) as u32).min(src.height - 1);
            for dx in x0..x1 {
                let sx = (((dx - origin_x) as f32 / scale) as u32).min(src.width - 1);
                let s = (sy as usize * src.width as usize + sx as usize) * 4;
                let d = (dy as usize * self.width as usize + dx as usize) * 4;
                let over = [
                    src.pixels[s],
                    src.pixels[s + 1],
                    src.pixels[s + 2],
                    src.pixels[s + 3],
                ];
                let under = [
                    self.pixels[d],
                    self.pixels[d + 1],
                    self.pixels[d + 2],
                    self.pixels[d + 3],
                ];
                self.pixels[d..d + 4].copy_from_slice(&source_over(over, under, opacity));
            }
        }
    }
}

/// Porter-Duff source-over on straight alpha.
fn source_over(src: Rgba, dst: Rgba, opacity: f32) -> Rgba {
    let sa = src[3] as f32 / 255.0 * opacity;
    if sa >= 1.0 {
        return src;
    }
    if sa <= 0.0 {
        return dst;
    }
    let da = dst[3] as f32 / 255.0;
    let out_a = sa + da * (1.0 - sa);
    let mut out = [0u8; 4];
    for c in 0..3 {
        let v = (src[c] as f32 * sa + dst[c] as f32 * da * (1.0 - sa)) / out_a;
        out[c] = v.round().clamp(0.0, 255.0) as u8;
    }
    out[3] = (out_a * 255.0).round().clamp(0.0, 255.0) as u8;
    out
}

/// Layers in paint order plus the frame background.
#[derive(Debug)]
pub struct Scene<'a> {
    pub width: u32,
    pub height: u32,
    pub background: BackgroundPolicy,
    /// Sorted bottom to top.
    pub layers: Vec<&'a Layer>,
}

impl<'a> Scene<'a> {
    pub fn new(width: u32, height: u32, background: BackgroundPolicy, mut layers: Vec<&'a Layer>) -> Self {
        layers.sort_by_key(|l| (l.z_index, l.order));
        Self {
            width,
            height,
            background,
            layers,
        }
    }

    pub fn clear_color(&self) -> Rgba {
        match self.background.mode {
            BackgroundMode::Transparent => [0, 0, 0, 0],
            BackgroundMode::Solid => self.background.clear_color,
            BackgroundMode::ChromaKey => CHROMA_GREEN,
        }
    }
}

/// Rasterizes a scene into an RGBA8 frame.
///
/// Markup layout and typography belong to engines that embed a browser or
/// text stack; the host only depends on this trait.
pub trait RenderEngine: Send {
    /// Engine identifier.
    fn name(&self) -> &str;

    /// Prepare for frames of the given size.
    fn initialize(&mut self, width: u32, height: u32) -> BridgeResult<()>;

    fn is_initialized(&self) -> bool;

    /// Render `scene` into `frame`, which is already sized to the scene.
    /// Scenes may differ in size from the initialized one while earlier
    /// regions are still being fed.
    fn render(&mut self, scene: &Scene<'_>, frame: &mut Surface) -> BridgeResult<()>;

    /// Forget cached state for a removed layer.
    fn release_layer(&mut self, _layer_id: &str) {}
}

/// CPU rasterizer: boxes, fills, images and colour bars.
#[derive(Debug, Default)]
pub struct SoftwareEngine {
    size: Option<(u32, u32)>,
    layer_surfaces: HashMap<String, Surface>,
}

impl SoftwareEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn draw_layer(layer: &Layer, frame_width: u32, frame_height: u32, surface: &mut Surface) -> f32 {
        match layer.content {
            LayerContent::TestPattern => {
                surface.reset(frame_width, frame_height);
                let bar_width = (frame_width as usize).div_ceil(COLOR_BARS.len()).max(1);
                for y in 0..frame_height as usize {
                    for x in 0..frame_width as usize {
                        let color = COLOR_BARS[(x / bar_width).min(COLOR_BARS.len() - 1)];
                        let i = (y * frame_width as usize + x) * 4;
                        surface.pixels[i..i + 4].copy_from_slice(&color);
                    }
                }
                1.0
            }
            LayerContent::Template => {
                let layer_box = layer.resolve_box(frame_width, frame_height);
                surface.reset(layer_box.width, layer_box.height);
                if let Some(fill) = layer_box.fill {
                    surface.clear(fill);
                }
                if let Some(asset) = &layer.asset {
                    surface.stretch_from(asset.width, asset.height, &asset.pixels);
                }
                layer_box.opacity
            }
        }
    }
}

impl RenderEngine for SoftwareEngine {
    fn name(&self) -> &str {
        "software"
    }

    fn initialize(&mut self, width: u32, height: u32) -> BridgeResult<()> {
        if width == 0 || height == 0 {
            return Err(BridgeError::compositor(format!(
                "Cannot initialize renderer at {width}x{height}"
            )));
        }
        self.layer_surfaces.clear();
        self.size = Some((width, height));
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.size.is_some()
    }

    fn render(&mut self, scene: &Scene<'_>, frame: &mut Surface) -> BridgeResult<()> {
        if self.size.is_none() || scene.width == 0 || scene.height == 0 {
            return Err(BridgeError::compositor("Render engine not initialized"));
        }
        if frame.width != scene.width || frame.height != scene.height {
            frame.reset(scene.width, scene.height);
        }
        frame.clear(scene.clear_color());

        for layer in &scene.layers {
            let surface = self
                .layer_surfaces
                .entry(layer.id.clone())
                .or_insert_with(|| Surface::new(0, 0));
            let opacity = Self::draw_layer(layer, scene.width, scene.height, surface);
            frame.composite(surface, layer.layout.x, layer.layout.y, layer.layout.scale, opacity);
        }
        Ok(())
    }

    fn release_layer(&mut self, layer_id: &str) {
        self.layer_surfaces.remove(layer_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::LayerSpec;

    fn solid_layer(id: &str, color: &str, w: u32, h: u32, z: i32, order: u64) -> Layer {
        let mut spec = LayerSpec::new(id, "");
        spec.css = format!("width: {w}px; height: {h}px; background: {color};");
        spec.z_index = z;
        Layer::from_spec(spec, None, order)
    }

    #[test]
    fn source_over_blends_half_alpha() {
        let out = source_over([255, 0, 0, 128], [0, 0, 255, 255], 1.0);
        assert_eq!(out[3], 255);
        assert!(out[0] > 120 && out[0] < 135);
        assert!(out[2] > 120 && out[2] < 135);
    }

    #[test]
    fn layers_composite_in_z_order() {
        let mut engine = SoftwareEngine::new();
        engine.initialize(8, 8).unwrap();
        let top = solid_layer("top", "#ff0000", 4, 4, 10, 0);
        let bottom = solid_layer("bottom", "#0000ff", 8, 8, 0, 1);
        let scene = Scene::new(8, 8, BackgroundPolicy::default(), vec![&top, &bottom]);
        let mut frame = Surface::new(8, 8);
        engine.render(&scene, &mut frame).unwrap();

        assert_eq!(frame.pixel(0, 0), Some([255, 0, 0, 255]));
        assert_eq!(frame.pixel(7, 7), Some([0, 0, 255, 255]));
    }

    #[test]
    fn layout_moves_and_scales() {
        let mut engine = SoftwareEngine::new();
        engine.initialize(10, 10).unwrap();
        let mut layer = solid_layer("box", "#ffffff", 2, 2, 0, 0);
        layer.update_layout(crate::layer::LayerLayout {
            x: 4.0,
            y: 4.0,
            scale: 2.0,
        });
        let scene = Scene::new(10, 10, BackgroundPolicy::default(), vec![&layer]);
        let mut frame = Surface::new(10, 10);
        engine.render(&scene, &mut frame).unwrap();

        assert_eq!(frame.pixel(3, 3), Some([0, 0, 0, 0]));
        assert_eq!(frame.pixel(4, 4), Some([255, 255, 255, 255]));
        assert_eq!(frame.pixel(7, 7), Some([255, 255, 255, 255]));
        assert_eq!(frame.pixel(8, 8), Some([0, 0, 0, 0]));
    }

    #[test]
    fn background_policies() {
        let mut engine = SoftwareEngine::new();
        engine.initialize(2, 2).unwrap();
        let mut frame = Surface::new(2, 2);

        let chroma = BackgroundPolicy {
            mode: BackgroundMode::ChromaKey,
            clear_color: [0; 4],
        };
        engine.render(&Scene::new(2, 2, chroma, vec![]), &mut frame).unwrap();
        assert_eq!(frame.pixel(1, 1), Some(CHROMA_GREEN));

        let solid = BackgroundPolicy {
            mode: BackgroundMode::Solid,
            clear_color: [10, 20, 30, 255],
        };
        engine.render(&Scene::new(2, 2, solid, vec![]), &mut frame).unwrap();
        assert_eq!(frame.pixel(0, 0), Some([10, 20, 30, 255]));
    }

    #[test]
    fn test_pattern_draws_bars() {
        let mut engine = SoftwareEngine::new();
        engine.initialize(14, 2).unwrap();
        let bars = Layer::test_pattern(0);
        let scene = Scene::new(14, 2, BackgroundPolicy::default(), vec![&bars]);
        let mut frame = Surface::new(14, 2);
        engine.render(&scene, &mut frame).unwrap();
        assert_eq!(frame.pixel(0, 0), Some(COLOR_BARS[0]));
        assert_eq!(frame.pixel(13, 1), Some(COLOR_BARS[6]));
    }

    #[test]
    fn render_requires_initialization() {
        let mut engine = SoftwareEngine::new();
        let scene = Scene::new(2, 2, BackgroundPolicy::default(), vec![]);
        assert!(engine.render(&scene, &mut Surface::new(2, 2)).is_err());
    }
}
