#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Parameters {
    pub format: FrameFormat,
    pub last_frame: bool,
    pub bytes_per_line: usize,
    pub pixels_per_line: usize,
    /// `None` when the device cannot tell in advance (hand scanners).
    pub lines: Option<usize>,
    pub depth: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFormat {
    Gray,
    RGB,
    Red,
    Green,
    Blue,
}

impl FrameFormat {
    /// Channel slot of a single-colour frame inside an interleaved RGB pixel.
    pub fn channel(&self) -> Option<usize> {
        match self {
            FrameFormat::Red => Some(0),
            FrameFormat::Green => Some(1),
            FrameFormat::Blue => Some(2),
            FrameFormat::Gray | FrameFormat::RGB => None,
        }
    }
}

impl Parameters {
    /// Bytes of one full frame, if the line count is known.
    pub fn frame_size(&self) -> Option<usize> {
        self.lines.map(|lines| lines * self.bytes_per_line)
    }
}

#[cfg(feature = "sys")]
impl From<libsane_sys::SANE_Frame> for FrameFormat {
    fn from(value: libsane_sys::SANE_Frame) -> Self {
        use libsane_sys::*;

        match value {
            SANE_Frame_SANE_FRAME_GRAY => Self::Gray,
            SANE_Frame_SANE_FRAME_RGB => Self::RGB,
            SANE_Frame_SANE_FRAME_RED => Self::Red,
            SANE_Frame_SANE_FRAME_GREEN => Self::Green,
            SANE_Frame_SANE_FRAME_BLUE => Self::Blue,
            _ => {
                log::warn!("Unknown sane frame format {value}, treat as gray");
                Self::Gray
            }
        }
    }
}
