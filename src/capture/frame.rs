use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Pooled frame buffer.
///
/// The payload is allocated once when its pool is created and then overwritten
/// in place for every reuse. Moving a `Frame` between pools or threads moves
/// the boxed slice, never the pixels.
#[derive(Debug)]
pub struct Frame {
    /// Slot identity within the pool that allocated it
    pub slot: u32,

    /// Capture timestamp in seconds on the session clock
    pub timestamp: f64,

    data: Box<[u8]>,
}

impl Frame {
    pub(crate) fn new(slot: u32, size: usize) -> Self {
        Self {
            slot,
            timestamp: 0.0,
            data: vec![0u8; size].into_boxed_slice(),
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Raw frame pushed by the camera source
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    Rgba32,
    Nv12,
}

impl PixelFormat {
    /// Bytes needed for a `width` x `height` image in this format
    pub fn frame_len(self, width: u32, height: u32) -> usize {
        let pixels = width as usize * height as usize;
        match self {
            PixelFormat::Rgba32 => pixels * 4,
            PixelFormat::Nv12 => pixels + pixels / 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_is_zeroed() {
        let frame = Frame::new(3, 16);
        assert_eq!(frame.slot, 3);
        assert_eq!(frame.timestamp, 0.0);
        assert_eq!(frame.len(), 16);
        assert!(frame.data().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_frame_len() {
        assert_eq!(PixelFormat::Rgba32.frame_len(4, 2), 32);
        assert_eq!(PixelFormat::Nv12.frame_len(4, 2), 12);
    }
}
