// ABOUTME: Viewport fit calculator proposing the largest cell grid that fits the container
// Registered on every session as the "fit" addon

use crate::config::FitConfig;
use crate::terminal::addons::Addon;
use crate::terminal::protocol::GridSize;
use crate::terminal::renderer::{CellMetrics, PixelSize, Renderer};
use parking_lot::Mutex;
use tracing::debug;

/// Registry name of the fit addon.
pub const FIT_ADDON: &str = "fit";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Geometry {
    pub cell: CellMetrics,
    pub container: PixelSize,
}

impl Geometry {
    pub fn new(cell: CellMetrics, container: PixelSize) -> Self {
        Self { cell, container }
    }
}

pub struct FitAddon {
    options: FitConfig,
    /// Cell size keyed by the renderer's font epoch
    cached_cell: Mutex<Option<(u64, CellMetrics)>>,
}

impl FitAddon {
    pub fn new(options: FitConfig) -> Self {
        Self {
            options,
            cached_cell: Mutex::new(None),
        }
    }

    /// Grid size for `geometry`, or `None` while the container has no area.
    pub fn propose(&self, geometry: &Geometry) -> Option<GridSize> {
        let Geometry { cell, container } = *geometry;
        if !(container.width > 0.0 && container.height > 0.0) {
            return None;
        }
        if !(cell.width > 0.0 && cell.height > 0.0) {
            return None;
        }

        let available_width =
            container.width - self.options.padding * 2.0 - self.options.scrollbar_width;
        let available_height = container.height - self.options.padding * 2.0;

        Some(GridSize {
            columns: cells_in(available_width, cell.width),
            rows: cells_in(available_height, cell.height),
        })
    }

    /// Measure the renderer and propose a size, re-measuring cells only after font changes.
    pub fn propose_for(&self, renderer: &dyn Renderer) -> Option<GridSize> {
        let epoch = renderer.font_epoch();
        let cell = {
            let mut cached = self.cached_cell.lock();
            match *cached {
                Some((cached_epoch, cell)) if cached_epoch == epoch => cell,
                _ => {
                    let cell = renderer.measure_cell();
                    debug!("Measured cell {}x{} for font epoch {}", cell.width, cell.height, epoch);
                    *cached = Some((epoch, cell));
                    cell
                }
            }
        };
        self.propose(&Geometry::new(cell, renderer.container_size()))
    }

    pub fn invalidate(&self) {
        self.cached_cell.lock().take();
    }
}

impl Default for FitAddon {
    fn default() -> Self {
        Self::new(FitConfig::default())
    }
}

impl Addon for FitAddon {
    fn dispose(&self) {
        self.invalidate();
    }
}

fn cells_in(available: f64, cell: f64) -> u16 {
    let count = (available / cell).floor();
    if count.is_nan() || count < 1.0 {
        1
    } else if count >= f64::from(u16::MAX) {
        u16::MAX
    } else {
        count as u16
    }
}
