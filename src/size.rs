//! Window size for PTY

use serde::{Deserialize, Serialize};

/// Window size in character cells
///
/// Pixel dimensions are not tracked; they are always reported to the kernel
/// as zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WindowSize {
    /// Number of columns (characters)
    pub cols: u16,
    /// Number of rows (characters)
    pub rows: u16,
}

impl WindowSize {
    /// Create a new window size
    pub fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }

    /// Convert to libc winsize structure
    pub fn to_winsize(&self) -> libc::winsize {
        libc::winsize {
            ws_row: self.rows,
            ws_col: self.cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        }
    }
}

impl Default for WindowSize {
    fn default() -> Self {
        Self::new(80, 24)
    }
}

impl From<libc::winsize> for WindowSize {
    fn from(ws: libc::winsize) -> Self {
        Self {
            cols: ws.ws_col,
            rows: ws.ws_row,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_size_default() {
        let size = WindowSize::default();
        assert_eq!(size.cols, 80);
        assert_eq!(size.rows, 24);
    }

    #[test]
    fn test_to_winsize_zeroes_pixels() {
        let ws = WindowSize::new(132, 43).to_winsize();
        assert_eq!(ws.ws_col, 132);
        assert_eq!(ws.ws_row, 43);
        assert_eq!(ws.ws_xpixel, 0);
        assert_eq!(ws.ws_ypixel, 0);
    }

    #[test]
    fn test_from_winsize_drops_pixels() {
        let ws = libc::winsize {
            ws_row: 40,
            ws_col: 120,
            ws_xpixel: 960,
            ws_ypixel: 640,
        };
        assert_eq!(WindowSize::from(ws), WindowSize::new(120, 40));
    }

    #[test]
    fn test_serde_field_names() {
        let json = serde_json::to_string(&WindowSize::new(100, 30)).unwrap();
        assert_eq!(json, r#"{"cols":100,"rows":30}"#);
    }
}
