use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

pub const RGB_CHANNELS: u8 = 3;

/// Raw interleaved 8-bit frame as it travels between decoder, engines and encoder.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    data: Vec<u8>,
    width: u32,
    height: u32,
    channels: u8,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, channels: u8) -> Result<Self, PipelineError> {
        let expected = frame_len(width, height, channels);
        if data.len() != expected {
            return Err(PipelineError::ShapeMismatch {
                expected,
                actual: data.len(),
            });
        }

        Ok(Self {
            data,
            width,
            height,
            channels,
        })
    }

    pub fn rgb(data: Vec<u8>, width: u32, height: u32) -> Result<Self, PipelineError> {
        Self::new(data, width, height, RGB_CHANNELS)
    }

    pub fn filled(width: u32, height: u32, channels: u8, value: u8) -> Self {
        Self {
            data: vec![value; frame_len(width, height, channels)],
            width,
            height,
            channels,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn channels(&self) -> u8 {
        self.channels
    }

    pub fn dimensions(&self) -> FrameDimensions {
        FrameDimensions {
            width: self.width,
            height: self.height,
            channels: self.channels,
        }
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("channels", &self.channels)
            .field("bytes", &self.data.len())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameDimensions {
    pub width: u32,
    pub height: u32,
    pub channels: u8,
}

impl FrameDimensions {
    pub fn frame_len(&self) -> usize {
        frame_len(self.width, self.height, self.channels)
    }
}

impl std::fmt::Display for FrameDimensions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}x{}", self.width, self.height, self.channels)
    }
}

pub fn frame_len(width: u32, height: u32, channels: u8) -> usize {
    width as usize * height as usize * channels as usize
}

/// Stream properties probed once before the run starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoProperties {
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
    pub frame_count: Option<u64>,
    pub pixel_format: String,
    pub channels: u8,
}

impl VideoProperties {
    pub fn rgb24(width: u32, height: u32, frame_rate: f64) -> Self {
        Self {
            width,
            height,
            frame_rate,
            frame_count: None,
            pixel_format: "rgb24".to_string(),
            channels: RGB_CHANNELS,
        }
    }

    pub fn dimensions(&self) -> FrameDimensions {
        FrameDimensions {
            width: self.width,
            height: self.height,
            channels: self.channels,
        }
    }

    pub fn frame_len(&self) -> usize {
        self.dimensions().frame_len()
    }
}
