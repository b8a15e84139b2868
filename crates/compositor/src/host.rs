//! Compositing host state.
//!
//! Owns the layers, the render engine and the Frame Bus writer. The
//! server drives it with decoded commands and the frame loop calls
//! [`CompositorHost::render_frame`] once per tick.

use std::collections::{BTreeMap, HashSet};

use framebridge_common::clock::SessionClock;
use framebridge_common::error::{BridgeError, BridgeResult};
use framebridge_frame_bus::{create_writer, FrameBusWriter, PixelFormat, WriterConfig};

use crate::engine::{RenderEngine, Scene, Surface};
use crate::layer::{Layer, LayerAsset, TEST_PATTERN_LAYER_ID};
use crate::protocol::{ControlCommand, HostEvent, HostStatus, LayerSpec, RendererConfig};

struct ActiveRenderer {
    config: RendererConfig,
    writer: FrameBusWriter,
    frame: Surface,
}

impl ActiveRenderer {
    /// Same region with the same frame geometry, so it can be reused as is.
    fn serves(&self, config: &RendererConfig) -> bool {
        let current = &self.config;
        current.framebus.name == config.framebus.name
            && current.width == config.width
            && current.height == config.height
            && current.fps == config.fps
            && current.pixel_format == config.pixel_format
            && current.framebus.slot_count == config.framebus.slot_count
    }

    fn publish(
        &mut self,
        engine: &mut dyn RenderEngine,
        layers: &BTreeMap<String, Layer>,
        timestamp_ns: u64,
    ) -> BridgeResult<()> {
        let scene = Scene::new(
            self.config.width,
            self.config.height,
            self.config.background,
            layers.values().collect(),
        );
        engine.render(&scene, &mut self.frame)?;
        self.writer.write_frame(&self.frame.pixels, timestamp_ns)?;
        Ok(())
    }

    fn close(mut self) {
        if let Err(e) = self.writer.close() {
            tracing::warn!(framebus = %self.config.framebus.name, error = %e, "Failed to close Frame Bus writer");
        }
    }
}

/// Where the region for a `renderer_configure` comes from.
enum Region {
    Primary,
    Retained(usize),
    Fresh(FrameBusWriter),
}

/// Outcome of applying one command.
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    /// Nothing to report beyond the ack.
    Done,
    /// Renderer is configured; emit this `ready` event.
    Ready(HostEvent),
    Status(HostStatus),
    /// Caller asked the host to exit.
    Shutdown,
}

/// Layer compositor writing to one Frame Bus region, plus any earlier
/// regions kept alive while an output transition is staged.
pub struct CompositorHost {
    engine: Box<dyn RenderEngine>,
    renderer: Option<ActiveRenderer>,
    retained: Vec<ActiveRenderer>,
    layers: BTreeMap<String, Layer>,
    rendered: HashSet<String>,
    next_order: u64,
    frames_written: u64,
    clock: SessionClock,
}

impl CompositorHost {
    pub fn new(engine: Box<dyn RenderEngine>) -> Self {
        Self {
            engine,
            renderer: None,
            retained: Vec::new(),
            layers: BTreeMap::new(),
            rendered: HashSet::new(),
            next_order: 0,
            frames_written: 0,
            clock: SessionClock::start(),
        }
    }

    /// Renderer configured, engine initialized and writer open.
    pub fn is_ready(&self) -> bool {
        self.renderer.is_some() && self.engine.is_initialized()
    }

    /// Configured frame rate, if ready.
    pub fn fps(&self) -> Option<u32> {
        self.renderer
            .as_ref()
            .filter(|_| self.engine.is_initialized())
            .map(|r| r.config.fps)
    }

    pub fn has_layer(&self, layer_id: &str) -> bool {
        self.layers.contains_key(layer_id)
    }

    /// Apply one decoded command. `hello` is handled by the server.
    pub fn apply(&mut self, command: ControlCommand, payload: Vec<u8>) -> BridgeResult<Applied> {
        match command {
            ControlCommand::Hello { .. } => Err(BridgeError::protocol("Unexpected hello after handshake")),
            ControlCommand::RendererConfigure(config) => self.configure_renderer(config).map(Applied::Ready),
            ControlCommand::GetStatus => Ok(Applied::Status(self.status())),
            ControlCommand::Shutdown => {
                self.shutdown();
                Ok(Applied::Shutdown)
            }
            other => {
                if !self.is_ready() {
                    return Err(BridgeError::compositor(format!(
                        "renderer_configure must precede {}",
                        other.kind()
                    )));
                }
                match other {
                    ControlCommand::CreateLayer(spec) => self.create_layer(spec, payload)?,
                    ControlCommand::UpdateValues { layer_id, values } => {
                        match self.layers.get_mut(&layer_id) {
                            Some(layer) => layer.update_values(values),
                            None => tracing::debug!(layer_id = %layer_id, "update_values for unknown layer ignored"),
                        }
                    }
                    ControlCommand::UpdateLayout { layer_id, layout } => {
                        match self.layers.get_mut(&layer_id) {
                            Some(layer) => layer.update_layout(layout),
                            None => tracing::debug!(layer_id = %layer_id, "update_layout for unknown layer ignored"),
                        }
                    }
                    ControlCommand::RemoveLayer { layer_id } => self.remove_layer(&layer_id),
                    ControlCommand::TestPattern { enabled } => self.set_test_pattern(enabled),
                    _ => {}
                }
                Ok(Applied::Done)
            }
        }
    }

    /// Select dimensions, rate and shared-memory target.
    ///
    /// A region already serving the same name and geometry is reused, so a
    /// background change never recreates it. Otherwise a new writer is
    /// created before anything else changes; on failure the previous
    /// renderer keeps running. Earlier regions are closed unless
    /// `retain_previous` is set. The returned `ready` event is only
    /// produced once both the engine and the writer are up.
    pub fn configure_renderer(&mut self, config: RendererConfig) -> BridgeResult<HostEvent> {
        if config.pixel_format != PixelFormat::Rgba8 {
            return Err(BridgeError::compositor(format!(
                "Unsupported pixel format {:?}; only RGBA8 is rendered",
                config.pixel_format
            )));
        }
        if config.width == 0 || config.height == 0 || config.fps == 0 {
            return Err(BridgeError::compositor(format!(
                "Invalid renderer geometry {}x{}@{}",
                config.width, config.height, config.fps
            )));
        }

        let region = if self.renderer.as_ref().is_some_and(|r| r.serves(&config)) {
            Region::Primary
        } else if let Some(index) = self.retained.iter().position(|r| r.serves(&config)) {
            Region::Retained(index)
        } else {
            Region::Fresh(create_writer(&WriterConfig {
                name: config.framebus.name.clone(),
                width: config.width,
                height: config.height,
                fps: config.fps,
                pixel_format: config.pixel_format,
                slot_count: config.framebus.slot_count,
                force_recreate: config.framebus.force_recreate,
                shm_dir: config.framebus.shm_dir.clone(),
            })?)
        };

        if !matches!(region, Region::Primary) {
            if let Err(e) = self.engine.initialize(config.width, config.height) {
                if let Some(current) = &self.renderer {
                    if let Err(restore) = self.engine.initialize(current.config.width, current.config.height) {
                        tracing::warn!(error = %restore, "Failed to restore render engine size");
                    }
                }
                return Err(e);
            }
        }

        match region {
            Region::Primary => {
                if let Some(current) = self.renderer.as_mut() {
                    current.config = config.clone();
                }
            }
            Region::Retained(index) => {
                let promoted = self.retained.remove(index);
                self.install(promoted, &config);
            }
            Region::Fresh(writer) => {
                let fresh = ActiveRenderer {
                    frame: Surface::new(config.width, config.height),
                    config: config.clone(),
                    writer,
                };
                self.install(fresh, &config);
                // Layers already on screen must be reported again for the new output.
                self.rendered.clear();
            }
        }
        if !config.retain_previous {
            for region in self.retained.drain(..) {
                region.close();
            }
        }

        tracing::info!(
            width = config.width,
            height = config.height,
            fps = config.fps,
            framebus = %config.framebus.name,
            retained = self.retained.len(),
            engine = self.engine.name(),
            "Renderer configured"
        );
        Ok(HostEvent::Ready {
            width: config.width,
            height: config.height,
            fps: config.fps,
            framebus_name: config.framebus.name,
        })
    }

    /// Make `next` the primary renderer, keeping or closing the old one.
    fn install(&mut self, mut next: ActiveRenderer, config: &RendererConfig) {
        next.config = config.clone();
        if let Some(previous) = self.renderer.replace(next) {
            if config.retain_previous {
                self.retained.push(previous);
            } else {
                previous.close();
            }
        }
    }

    fn create_layer(&mut self, spec: LayerSpec, payload: Vec<u8>) -> BridgeResult<()> {
        if spec.layer_id.is_empty() {
            return Err(BridgeError::compositor("Layer id is empty"));
        }
        if spec.layer_id == TEST_PATTERN_LAYER_ID {
            return Err(BridgeError::compositor(format!(
                "Layer id '{TEST_PATTERN_LAYER_ID}' is reserved"
            )));
        }
        let asset = match spec.asset {
            Some(descriptor) => Some(LayerAsset::from_payload(descriptor, payload).ok_or_else(|| {
                BridgeError::compositor(format!(
                    "Asset for layer '{}' does not match {}x{} RGBA",
                    spec.layer_id, descriptor.width, descriptor.height
                ))
            })?),
            None => None,
        };

        let id = spec.layer_id.clone();
        let layer = Layer::from_spec(spec, asset, self.next_order);
        self.next_order += 1;
        if self.layers.insert(id.clone(), layer).is_some() {
            self.rendered.remove(&id);
            tracing::debug!(layer_id = %id, "Layer replaced");
        } else {
            tracing::debug!(layer_id = %id, "Layer created");
        }
        Ok(())
    }

    fn remove_layer(&mut self, layer_id: &str) {
        if self.layers.remove(layer_id).is_some() {
            self.rendered.remove(layer_id);
            self.engine.release_layer(layer_id);
            tracing::debug!(layer_id = %layer_id, "Layer removed");
        } else {
            tracing::debug!(layer_id = %layer_id, "remove_layer for unknown layer ignored");
        }
    }

    fn set_test_pattern(&mut self, enabled: bool) {
        if enabled {
            if !self.layers.contains_key(TEST_PATTERN_LAYER_ID) {
                let layer = Layer::test_pattern(self.next_order);
                self.next_order += 1;
                self.layers.insert(TEST_PATTERN_LAYER_ID.to_string(), layer);
            }
        } else {
            self.remove_layer(TEST_PATTERN_LAYER_ID);
        }
    }

    /// Render one frame and publish it to every live region. Returns ids
    /// of layers appearing in a published frame for the first time.
    pub fn render_frame(&mut self) -> BridgeResult<Vec<String>> {
        if !self.engine.is_initialized() {
            return Ok(Vec::new());
        }
        let Some(renderer) = self.renderer.as_mut() else {
            return Ok(Vec::new());
        };

        let timestamp_ns = self.clock.elapsed_ns();
        renderer.publish(self.engine.as_mut(), &self.layers, timestamp_ns)?;
        for region in &mut self.retained {
            if let Err(e) = region.publish(self.engine.as_mut(), &self.layers, timestamp_ns) {
                tracing::debug!(framebus = %region.config.framebus.name, error = %e, "Retained region not updated");
            }
        }
        self.frames_written += 1;

        let fresh: Vec<String> = self
            .layers
            .keys()
            .filter(|id| !self.rendered.contains(*id))
            .cloned()
            .collect();
        self.rendered.extend(fresh.iter().cloned());
        Ok(fresh)
    }

    pub fn status(&self) -> HostStatus {
        let config = self.renderer.as_ref().map(|r| &r.config);
        HostStatus {
            ready: self.is_ready(),
            width: config.map(|c| c.width).unwrap_or(0),
            height: config.map(|c| c.height).unwrap_or(0),
            fps: config.map(|c| c.fps).unwrap_or(0),
            framebus_name: config.map(|c| c.framebus.name.clone()),
            retained_framebus: self
                .retained
                .iter()
                .map(|r| r.config.framebus.name.clone())
                .collect(),
            frames_written: self.frames_written,
            layer_ids: self
                .layers
                .keys()
                .filter(|id| id.as_str() != TEST_PATTERN_LAYER_ID)
                .cloned()
                .collect(),
            test_pattern: self.layers.contains_key(TEST_PATTERN_LAYER_ID),
            engine: self.engine.name().to_string(),
        }
    }

    /// Drop all layers and close every writer.
    pub fn shutdown(&mut self) {
        if let Some(renderer) = self.renderer.take() {
            renderer.close();
        }
        for region in self.retained.drain(..) {
            region.close();
        }
        self.layers.clear();
        self.rendered.clear();
        tracing::info!(frames = self.frames_written, "Compositing host shut down");
    }
}
