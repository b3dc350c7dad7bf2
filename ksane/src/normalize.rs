//! Conversion of raw device frames into displayable 8-bit RGB rasters.

use crate::error::NormalizeError;
use libsane::{FrameFormat, Parameters};
use strum::{Display, IntoStaticStr};

/// Pixel layout of a scanned image as delivered to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, IntoStaticStr)]
pub enum ImageFormat {
    /// 1 bit per pixel, a set bit is black.
    BlackWhite,
    GrayScale8,
    GrayScale16,
    /// Interleaved RGB, one byte per sample.
    Rgb8,
    /// Interleaved RGB, two native-endian bytes per sample.
    Rgb16,
    #[default]
    None,
}

impl ImageFormat {
    pub fn from_frame(frame: FrameFormat, depth: usize) -> Self {
        match (frame, depth) {
            (FrameFormat::Gray, 1) => Self::BlackWhite,
            (FrameFormat::Gray, 8) => Self::GrayScale8,
            (FrameFormat::Gray, 16) => Self::GrayScale16,
            (FrameFormat::Gray, _) => Self::None,
            (_, 8) => Self::Rgb8,
            (_, 16) => Self::Rgb16,
            (_, _) => Self::None,
        }
    }

    /// Bytes of one unpadded row of `width` pixels.
    pub fn row_bytes(&self, width: usize) -> usize {
        match self {
            Self::BlackWhite => width.div_ceil(8),
            Self::GrayScale8 => width,
            Self::GrayScale16 => width * 2,
            Self::Rgb8 => width * 3,
            Self::Rgb16 => width * 6,
            Self::None => 0,
        }
    }

    pub fn is_16_bit(&self) -> bool {
        matches!(self, Self::GrayScale16 | Self::Rgb16)
    }
}

pub fn image_format(parameters: &Parameters) -> ImageFormat {
    ImageFormat::from_frame(parameters.format, parameters.depth)
}

/// Row stride of the image the session hands out for frames with these
/// parameters. Separate colour frames are interleaved, so their stride is
/// that of an RGB frame.
pub fn bytes_per_line(parameters: &Parameters) -> usize {
    let format = image_format(parameters);
    match format {
        ImageFormat::BlackWhite | ImageFormat::GrayScale8 | ImageFormat::GrayScale16 => {
            parameters.bytes_per_line
        }
        ImageFormat::Rgb8 | ImageFormat::Rgb16 => format.row_bytes(parameters.pixels_per_line),
        ImageFormat::None => 0,
    }
}

/// An 8-bit RGB image, rows packed without padding.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Raster {
    width: usize,
    height: usize,
    data: Vec<u8>,
}

const WHITE: [u8; 3] = [0xff; 3];

impl Raster {
    /// A white raster.
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            data: vec![0xff; width * height * 3],
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn stride(&self) -> usize {
        self.width * 3
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn pixel(&self, x: usize, y: usize) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = y * self.stride() + x * 3;
        Some([self.data[offset], self.data[offset + 1], self.data[offset + 2]])
    }

    pub fn row_mut(&mut self, y: usize) -> Option<&mut [u8]> {
        let stride = self.stride();
        self.data.get_mut(y * stride..(y + 1) * stride)
    }

    pub fn fill_white(&mut self) {
        self.data.fill(0xff);
    }

    pub fn invert(&mut self) {
        self.data.iter_mut().for_each(|byte| *byte = !*byte);
    }

    /// Changes the dimensions. Rows survive when only the height changes;
    /// new pixels are white.
    pub fn resize(&mut self, width: usize, height: usize) {
        if width == self.width && height == self.height {
            return;
        }

        if width == self.width {
            self.data.resize(width * height * 3, 0xff);
        } else {
            self.data = vec![0xff; width * height * 3];
        }

        self.width = width;
        self.height = height;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Normalized {
    pub format: ImageFormat,
    pub raster: Raster,
    /// 16-bit samples were cut down to their high byte.
    pub truncated: bool,
}

pub fn normalize(
    raw: &[u8],
    width: usize,
    height: usize,
    stride: usize,
    frame: FrameFormat,
    depth: usize,
) -> Result<Normalized, NormalizeError> {
    let format = ImageFormat::from_frame(frame, depth);
    if format == ImageFormat::None {
        return Err(NormalizeError::Unsupported {
            frame: format!("{frame:?}"),
            depth,
        });
    }

    let row = format.row_bytes(width);
    if stride < row {
        return Err(NormalizeError::Stride { stride, row });
    }

    let expected = match height {
        0 => 0,
        height => stride * (height - 1) + row,
    };
    if raw.len() < expected {
        return Err(NormalizeError::ShortBuffer {
            expected,
            actual: raw.len(),
        });
    }

    let mut raster = Raster::new(width, height);
    for y in 0..height {
        let src = &raw[y * stride..y * stride + row];
        if let Some(dst) = raster.row_mut(y) {
            convert_row(format, src, dst, false);
        }
    }

    Ok(Normalized {
        format,
        raster,
        truncated: format.is_16_bit(),
    })
}

/// Converts one device row into an RGB8 row of the same pixel width.
pub(crate) fn convert_row(format: ImageFormat, src: &[u8], dst: &mut [u8], invert: bool) {
    let high = |bytes: &[u8]| (u16::from_ne_bytes([bytes[0], bytes[1]]) >> 8) as u8;

    for (x, pixel) in dst.chunks_exact_mut(3).enumerate() {
        let rgb = match format {
            ImageFormat::BlackWhite => match src.get(x / 8) {
                Some(byte) if byte & (0x80 >> (x % 8)) != 0 => [0, 0, 0],
                Some(_) => WHITE,
                None => break,
            },
            ImageFormat::GrayScale8 => match src.get(x) {
                Some(gray) => [*gray; 3],
                None => break,
            },
            ImageFormat::GrayScale16 => match src.get(x * 2..x * 2 + 2) {
                Some(sample) => [high(sample); 3],
                None => break,
            },
            ImageFormat::Rgb8 => match src.get(x * 3..x * 3 + 3) {
                Some(rgb) => [rgb[0], rgb[1], rgb[2]],
                None => break,
            },
            ImageFormat::Rgb16 => match src.get(x * 6..x * 6 + 6) {
                Some(rgb) => [high(&rgb[0..2]), high(&rgb[2..4]), high(&rgb[4..6])],
                None => break,
            },
            ImageFormat::None => break,
        };

        let rgb = if invert { rgb.map(|c| !c) } else { rgb };
        pixel.copy_from_slice(&rgb);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(format: FrameFormat, depth: usize, ppl: usize, bpl: usize) -> Parameters {
        Parameters {
            format,
            last_frame: true,
            bytes_per_line: bpl,
            pixels_per_line: ppl,
            lines: Some(2),
            depth,
        }
    }

    #[test]
    fn format_table() {
        use FrameFormat::*;

        assert_eq!(image_format(&params(Gray, 1, 10, 2)), ImageFormat::BlackWhite);
        assert_eq!(image_format(&params(Gray, 8, 10, 10)), ImageFormat::GrayScale8);
        assert_eq!(image_format(&params(Gray, 16, 10, 20)), ImageFormat::GrayScale16);
        assert_eq!(image_format(&params(RGB, 8, 10, 30)), ImageFormat::Rgb8);
        assert_eq!(image_format(&params(Red, 16, 10, 20)), ImageFormat::Rgb16);
        assert_eq!(image_format(&params(RGB, 1, 10, 4)), ImageFormat::None);
        assert_eq!(image_format(&params(Gray, 4, 10, 5)), ImageFormat::None);
    }

    #[test]
    fn stride_table() {
        use FrameFormat::*;

        // Gray formats keep the device stride, padding included.
        assert_eq!(bytes_per_line(&params(Gray, 1, 10, 4)), 4);
        assert_eq!(bytes_per_line(&params(Gray, 8, 10, 12)), 12);
        assert_eq!(bytes_per_line(&params(Gray, 16, 10, 20)), 20);
        assert_eq!(bytes_per_line(&params(RGB, 8, 10, 32)), 30);
        assert_eq!(bytes_per_line(&params(Green, 8, 10, 10)), 30);
        assert_eq!(bytes_per_line(&params(RGB, 16, 10, 60)), 60);
        assert_eq!(bytes_per_line(&params(RGB, 2, 10, 60)), 0);
    }

    #[test]
    fn black_white_set_bit_is_black() {
        let raw = [0b1010_0000, 0x00];
        let out = normalize(&raw, 3, 2, 1, FrameFormat::Gray, 1).unwrap();

        assert_eq!(out.format, ImageFormat::BlackWhite);
        assert!(!out.truncated);
        assert_eq!(out.raster.pixel(0, 0), Some([0, 0, 0]));
        assert_eq!(out.raster.pixel(1, 0), Some([0xff; 3]));
        assert_eq!(out.raster.pixel(2, 0), Some([0, 0, 0]));
        assert_eq!(out.raster.pixel(0, 1), Some([0xff; 3]));
    }

    #[test]
    fn gray8_is_replicated_and_padding_skipped() {
        let raw = [10, 20, 99, 30, 40, 99];
        let out = normalize(&raw, 2, 2, 3, FrameFormat::Gray, 8).unwrap();

        assert_eq!(out.raster.width(), 2);
        assert_eq!(out.raster.height(), 2);
        assert_eq!(out.raster.stride(), 6);
        assert_eq!(out.raster.pixel(1, 0), Some([20; 3]));
        assert_eq!(out.raster.pixel(0, 1), Some([30; 3]));
        assert!(!out.truncated);
    }

    #[test]
    fn sixteen_bit_keeps_high_byte_and_flags_truncation() {
        let sample = 0xab12u16.to_ne_bytes();
        let raw: Vec<u8> = sample.iter().chain(sample.iter()).chain(sample.iter()).copied().collect();

        let gray = normalize(&raw[..2], 1, 1, 2, FrameFormat::Gray, 16).unwrap();
        assert_eq!(gray.format, ImageFormat::GrayScale16);
        assert!(gray.truncated);
        assert_eq!(gray.raster.pixel(0, 0), Some([0xab; 3]));

        let rgb = normalize(&raw, 1, 1, 6, FrameFormat::RGB, 16).unwrap();
        assert_eq!(rgb.format, ImageFormat::Rgb16);
        assert!(rgb.truncated);
        assert_eq!(rgb.raster.pixel(0, 0), Some([0xab; 3]));
    }

    #[test]
    fn rgb8_is_copied() {
        let raw = [1, 2, 3, 4, 5, 6];
        let out = normalize(&raw, 2, 1, 6, FrameFormat::RGB, 8).unwrap();
        assert_eq!(out.raster.data(), &raw);
        assert!(!out.truncated);
    }

    #[test]
    fn rejects_short_buffers_and_unknown_layouts() {
        // The last row needs no padding.
        assert!(normalize(&[0; 5], 2, 2, 3, FrameFormat::Gray, 8).is_ok());
        assert!(matches!(
            normalize(&[0; 4], 2, 2, 3, FrameFormat::Gray, 8),
            Err(NormalizeError::ShortBuffer { expected: 5, actual: 4 })
        ));
        assert!(matches!(
            normalize(&[0; 4], 2, 2, 1, FrameFormat::Gray, 8),
            Err(NormalizeError::Stride { stride: 1, row: 2 })
        ));
        assert!(matches!(
            normalize(&[0; 4], 2, 2, 2, FrameFormat::RGB, 1),
            Err(NormalizeError::Unsupported { .. })
        ));
    }

    #[test]
    fn resize_keeps_rows_when_width_is_unchanged() {
        let mut raster = Raster::new(2, 1);
        raster.row_mut(0).unwrap().copy_from_slice(&[1, 2, 3, 4, 5, 6]);
        raster.resize(2, 3);
        assert_eq!(raster.pixel(1, 0), Some([4, 5, 6]));
        assert_eq!(raster.pixel(1, 2), Some([0xff; 3]));

        raster.resize(1, 1);
        assert_eq!(raster.pixel(0, 0), Some([0xff; 3]));
    }

    #[test]
    fn invert_flips_every_sample() {
        let mut raster = Raster::new(1, 1);
        raster.invert();
        assert_eq!(raster.pixel(0, 0), Some([0, 0, 0]));
    }
}
