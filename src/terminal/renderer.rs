// ABOUTME: Renderer collaborator contract: the terminal emulator that displays output and emits keystrokes
// The emulator itself is a black box; the session only needs these operations

use crate::terminal::protocol::GridSize;
use tokio::sync::mpsc;

/// Pixel size of one character cell.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellMetrics {
    pub width: f64,
    pub height: f64,
}

impl CellMetrics {
    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }
}

/// Pixel size of the visible container element.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PixelSize {
    pub width: f64,
    pub height: f64,
}

impl PixelSize {
    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }
}

pub trait Renderer: Send + Sync {
    /// Display raw output bytes exactly as received.
    fn write(&self, data: &[u8]);

    /// Apply a new grid size locally.
    fn resize(&self, size: GridSize);

    fn container_size(&self) -> PixelSize;

    /// Measure the current cell size. May be expensive.
    fn measure_cell(&self) -> CellMetrics;

    /// Bumped whenever font or zoom changes invalidate the cell size.
    fn font_epoch(&self) -> u64 {
        0
    }

    /// Hand out the stream of keystroke and paste bytes.
    fn subscribe_input(&self) -> mpsc::UnboundedReceiver<Vec<u8>>;

    fn set_visible(&self, _visible: bool) {}
}
