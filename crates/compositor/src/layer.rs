//! Layer model.
//!
//! A layer is a markup template plus a stylesheet that only applies to
//! that layer. Values sent by the caller are bound into the template as
//! text and exposed to the stylesheet as custom properties; nothing one
//! layer declares is visible to another.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::protocol::{AssetDescriptor, LayerSpec, ValueMap};

/// Reserved id of the colour-bar layer.
pub const TEST_PATTERN_LAYER_ID: &str = "__test_pattern__";

/// Maximum depth when resolving `var(--x)` chains.
const MAX_VAR_DEPTH: usize = 8;

/// Position and scale of a layer inside the frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LayerLayout {
    #[serde(default)]
    pub x: f32,
    #[serde(default)]
    pub y: f32,
    #[serde(default = "default_scale")]
    pub scale: f32,
}

fn default_scale() -> f32 {
    1.0
}

impl Default for LayerLayout {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            scale: 1.0,
        }
    }
}

impl LayerLayout {
    /// Negative or non-finite scales collapse to 1.
    pub fn sanitized(self) -> Self {
        let scale = if self.scale.is_finite() && self.scale > 0.0 {
            self.scale
        } else {
            1.0
        };
        Self {
            x: if self.x.is_finite() { self.x } else { 0.0 },
            y: if self.y.is_finite() { self.y } else { 0.0 },
            scale,
        }
    }
}

/// Background treatment, used both for the whole frame and per layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackgroundMode {
    #[default]
    Transparent,
    Solid,
    ChromaKey,
}

/// Straight-alpha RGBA colour.
pub type Rgba = [u8; 4];

/// Key green used for chroma-key backgrounds.
pub const CHROMA_GREEN: Rgba = [0, 255, 0, 255];

/// Declarations parsed from one layer's stylesheet.
///
/// Selectors are ignored: every declaration in the sheet applies to the
/// layer root, and custom properties (`--name`) stay inside the layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopedStyle {
    properties: BTreeMap<String, String>,
}

impl ScopedStyle {
    pub fn parse(css: &str) -> Self {
        let css = strip_comments(css);
        let mut properties = BTreeMap::new();
        for block in css.split('}') {
            let body = match block.rfind('{') {
                Some(idx) => &block[idx + 1..],
                None => block,
            };
            for decl in body.split(';') {
                if let Some((name, value)) = decl.split_once(':') {
                    let name = name.trim();
                    let value = value.trim();
                    if !name.is_empty() && !value.is_empty() && !name.contains(char::is_whitespace) {
                        properties.insert(name.to_ascii_lowercase(), value.to_string());
                    }
                }
            }
        }
        Self { properties }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.properties.get(name).map(String::as_str)
    }

    /// Custom properties declared by the sheet.
    pub fn custom_properties(&self) -> impl Iterator<Item = (&str, &str)> {
        self.properties
            .iter()
            .filter(|(k, _)| k.starts_with("--"))
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

fn strip_comments(css: &str) -> String {
    let mut out = String::with_capacity(css.len());
    let mut rest = css;
    while let Some(start) = rest.find("/*") {
        out.push_str(&rest[..start]);
        match rest[start + 2..].find("*/") {
            Some(end) => rest = &rest[start + 2 + end + 2..],
            None => return out,
        }
    }
    out.push_str(rest);
    out
}

/// Data derived from a layer's template, style and values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayerBindings {
    /// Custom properties visible to this layer's stylesheet.
    pub css_vars: BTreeMap<String, String>,
    /// Markup with `{{key}}` placeholders replaced.
    pub text: String,
    pub animation_class: Option<String>,
}

impl LayerBindings {
    pub fn derive(html: &str, style: &ScopedStyle, values: &ValueMap) -> Self {
        let mut css_vars: BTreeMap<String, String> = style
            .custom_properties()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        for (key, value) in values {
            css_vars.insert(format!("--{}", key.trim_start_matches("--")), value_to_string(value));
        }

        let animation_class = values
            .get("animation")
            .map(value_to_string)
            .filter(|s| !s.is_empty())
            .or_else(|| style.get("animation-name").map(str::to_string));

        Self {
            css_vars,
            text: bind_text(html, values),
            animation_class,
        }
    }

    /// Resolve a property value, following `var(--name, fallback)`.
    pub fn resolve(&self, value: &str) -> Option<String> {
        let mut current = value.trim().to_string();
        for _ in 0..MAX_VAR_DEPTH {
            let inner = match current
                .strip_prefix("var(")
                .and_then(|s| s.strip_suffix(')'))
            {
                Some(inner) => inner,
                None => return Some(current),
            };
            let (name, fallback) = match inner.split_once(',') {
                Some((name, fallback)) => (name.trim(), Some(fallback.trim())),
                None => (inner.trim(), None),
            };
            current = match (self.css_vars.get(name), fallback) {
                (Some(v), _) => v.clone(),
                (None, Some(f)) => f.to_string(),
                (None, None) => return None,
            };
        }
        None
    }
}

fn value_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Replace `{{ key }}` placeholders. Unknown keys bind to empty text.
fn bind_text(template: &str, values: &ValueMap) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let key = after[..end].trim();
                if let Some(value) = values.get(key) {
                    out.push_str(&value_to_string(value));
                }
                rest = &after[end + 2..];
            }
            None => {
                out.push_str(&rest[start..]);
                return out;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Parse a CSS colour. Supports hex, `rgb()`, `rgba()` and a few names.
pub fn parse_color(value: &str) -> Option<Rgba> {
    let value = value.trim().to_ascii_lowercase();
    if let Some(hex) = value.strip_prefix('#') {
        let digits: Vec<u8> = hex
            .chars()
            .map(|c| c.to_digit(16).map(|d| d as u8))
            .collect::<Option<_>>()?;
        return match digits.len() {
            3 => Some([digits[0] * 17, digits[1] * 17, digits[2] * 17, 255]),
            6 => Some([
                digits[0] * 16 + digits[1],
                digits[2] * 16 + digits[3],
                digits[4] * 16 + digits[5],
                255,
            ]),
            8 => Some([
                digits[0] * 16 + digits[1],
                digits[2] * 16 + digits[3],
                digits[4] * 16 + digits[5],
                digits[6] * 16 + digits[7],
            ]),
            _ => None,
        };
    }

    let args = value
        .strip_prefix("rgba(")
        .or_else(|| value.strip_prefix("rgb("))
        .and_then(|s| s.strip_suffix(')'));
    if let Some(args) = args {
        let parts: Vec<&str> = args.split(',').map(str::trim).collect();
        if parts.len() != 3 && parts.len() != 4 {
            return None;
        }
        let channel = |s: &str| s.parse::<f32>().ok().map(|v| v.clamp(0.0, 255.0).round() as u8);
        let alpha = match parts.get(3) {
            Some(a) => (a.parse::<f32>().ok()?.clamp(0.0, 1.0) * 255.0).round() as u8,
            None => 255,
        };
        return Some([channel(parts[0])?, channel(parts[1])?, channel(parts[2])?, alpha]);
    }

    match value.as_str() {
        "transparent" => Some([0, 0, 0, 0]),
        "black" => Some([0, 0, 0, 255]),
        "white" => Some([255, 255, 255, 255]),
        "red" => Some([255, 0, 0, 255]),
        "green" => Some([0, 128, 0, 255]),
        "lime" => Some(CHROMA_GREEN),
        "blue" => Some([0, 0, 255, 255]),
        _ => None,
    }
}

fn parse_px(value: &str) -> Option<u32> {
    let value = value.trim();
    let number = value.strip_suffix("px").unwrap_or(value).trim();
    number
        .parse::<f32>()
        .ok()
        .filter(|v| v.is_finite() && *v >= 0.0)
        .map(|v| v.round() as u32)
}

/// Raw RGBA image attached to a layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerAsset {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl LayerAsset {
    pub fn from_payload(descriptor: AssetDescriptor, payload: Vec<u8>) -> Option<Self> {
        (descriptor.width > 0 && descriptor.height > 0 && payload.len() == descriptor.byte_len())
            .then_some(Self {
                width: descriptor.width,
                height: descriptor.height,
                pixels: payload,
            })
    }
}

/// What a layer draws.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerContent {
    Template,
    TestPattern,
}

/// Size and fill a layer resolves to before compositing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LayerBox {
    pub width: u32,
    pub height: u32,
    pub fill: Option<Rgba>,
    pub opacity: f32,
}

/// A compositor layer.
#[derive(Debug, Clone)]
pub struct Layer {
    pub id: String,
    pub html: String,
    pub style: ScopedStyle,
    pub values: ValueMap,
    pub bindings: LayerBindings,
    pub layout: LayerLayout,
    pub z_index: i32,
    pub background_mode: BackgroundMode,
    pub asset: Option<LayerAsset>,
    pub content: LayerContent,
    /// Insertion order; breaks z-index ties.
    pub order: u64,
}

impl Layer {
    pub fn from_spec(spec: LayerSpec, asset: Option<LayerAsset>, order: u64) -> Self {
        let style = ScopedStyle::parse(&spec.css);
        let bindings = LayerBindings::derive(&spec.html, &style, &spec.values);
        Self {
            id: spec.layer_id,
            html: spec.html,
            style,
            values: spec.values,
            bindings,
            layout: spec.layout.sanitized(),
            z_index: spec.z_index,
            background_mode: spec.background_mode,
            asset,
            content: LayerContent::Template,
            order,
        }
    }

    pub fn test_pattern(order: u64) -> Self {
        Self {
            id: TEST_PATTERN_LAYER_ID.to_string(),
            html: String::new(),
            style: ScopedStyle::default(),
            values: ValueMap::new(),
            bindings: LayerBindings::default(),
            layout: LayerLayout::default(),
            z_index: i32::MAX,
            background_mode: BackgroundMode::Solid,
            asset: None,
            content: LayerContent::TestPattern,
            order,
        }
    }

    /// Merge new values and rebuild bindings.
    pub fn update_values(&mut self, values: ValueMap) {
        self.values.extend(values);
        self.bindings = LayerBindings::derive(&self.html, &self.style, &self.values);
    }

    pub fn update_layout(&mut self, layout: LayerLayout) {
        self.layout = layout.sanitized();
    }

    fn property(&self, name: &str) -> Option<String> {
        let raw = self
            .style
            .get(name)
            .map(str::to_string)
            .or_else(|| self.bindings.css_vars.get(&format!("--{name}")).cloned())?;
        self.bindings.resolve(&raw)
    }

    /// Resolve the layer's box against the frame size.
    pub fn resolve_box(&self, frame_width: u32, frame_height: u32) -> LayerBox {
        let (default_w, default_h) = match &self.asset {
            Some(asset) => (asset.width, asset.height),
            None => (frame_width, frame_height),
        };
        let width = self
            .property("width")
            .and_then(|v| parse_px(&v))
            .unwrap_or(default_w);
        let height = self
            .property("height")
            .and_then(|v| parse_px(&v))
            .unwrap_or(default_h);

        let declared = self
            .property("background-color")
            .or_else(|| self.property("background"))
            .and_then(|v| parse_color(&v));
        let fill = match self.background_mode {
            BackgroundMode::Transparent => declared,
            BackgroundMode::Solid => Some(declared.unwrap_or([0, 0, 0, 255])),
            BackgroundMode::ChromaKey => Some(CHROMA_GREEN),
        };

        let opacity = self
            .property("opacity")
            .and_then(|v| v.trim().parse::<f32>().ok())
            .filter(|v| v.is_finite())
            .map(|v| v.clamp(0.0, 1.0))
            .unwrap_or(1.0);

        LayerBox {
            width,
            height,
            fill,
            opacity,
        }
    }
}
