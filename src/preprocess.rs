use std::io::Cursor;
use std::str::FromStr;

use image::{imageops::FilterType, io::Reader, ImageError, RgbImage};
use ndarray::Array4;

use crate::error::PredictError;

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Memory order of the model input tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputLayout {
    /// (1, H, W, 3), the Keras convention.
    Nhwc,
    /// (1, 3, H, W), the PyTorch convention.
    Nchw,
}

impl InputLayout {
    pub fn shape(&self, size: u32) -> [usize; 4] {
        let s = size as usize;
        match self {
            InputLayout::Nhwc => [1, s, s, 3],
            InputLayout::Nchw => [1, 3, s, s],
        }
    }
}

impl FromStr for InputLayout {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "nhwc" => Ok(InputLayout::Nhwc),
            "nchw" => Ok(InputLayout::Nchw),
            other => Err(format!("unknown layout {other:?}, expected nhwc or nchw")),
        }
    }
}

/// Pixel value normalization expected by the model weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputScaling {
    /// Untouched 0..=255 values. MobileNetV3 rescales inside the graph.
    Raw,
    /// 0..=1
    Unit,
    /// -1..=1, as for MobileNetV2 and Inception.
    Symmetric,
    /// Per-channel ImageNet mean/std on 0..=1 values.
    ImageNet,
}

impl InputScaling {
    #[inline]
    fn apply(&self, value: u8, channel: usize) -> f32 {
        let v = value as f32;
        match self {
            InputScaling::Raw => v,
            InputScaling::Unit => v / 255.0,
            InputScaling::Symmetric => v / 127.5 - 1.0,
            InputScaling::ImageNet => (v / 255.0 - IMAGENET_MEAN[channel]) / IMAGENET_STD[channel],
        }
    }
}

impl FromStr for InputScaling {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "raw" => Ok(InputScaling::Raw),
            "unit" => Ok(InputScaling::Unit),
            "symmetric" => Ok(InputScaling::Symmetric),
            "imagenet" => Ok(InputScaling::ImageNet),
            other => Err(format!(
                "unknown scaling {other:?}, expected raw, unit, symmetric or imagenet"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PreProcessor {
    size: u32,
    layout: InputLayout,
    scaling: InputScaling,
}

impl PreProcessor {
    pub fn new(size: u32, layout: InputLayout, scaling: InputScaling) -> Self {
        Self {
            size,
            layout,
            scaling,
        }
    }

    pub fn input_shape(&self) -> [usize; 4] {
        self.layout.shape(self.size)
    }

    /// Decode, convert to RGB, resize and normalize an uploaded image into a
    /// batch of one.
    pub fn preprocess(&self, bytes: &[u8]) -> Result<Array4<f32>, PredictError> {
        let rgb = decode_rgb(bytes)?;
        let resized = image::imageops::resize(&rgb, self.size, self.size, FilterType::CatmullRom);
        Ok(self.to_tensor(&resized))
    }

    fn to_tensor(&self, img: &RgbImage) -> Array4<f32> {
        let scaling = self.scaling;
        match self.layout {
            InputLayout::Nhwc => Array4::from_shape_fn(self.input_shape(), |(_, y, x, c)| {
                scaling.apply(img.get_pixel(x as u32, y as u32)[c], c)
            }),
            InputLayout::Nchw => Array4::from_shape_fn(self.input_shape(), |(_, c, y, x)| {
                scaling.apply(img.get_pixel(x as u32, y as u32)[c], c)
            }),
        }
    }
}

/// Sniff the format from the content and decode to 8-bit RGB, dropping any
/// alpha channel.
///
/// Failing to read the header means the upload is not an image we know. A
/// failure once the header is accepted is a broken image of a known format.
pub fn decode_rgb(bytes: &[u8]) -> Result<RgbImage, PredictError> {
    let reader = || Reader::new(Cursor::new(bytes)).with_guessed_format();

    let header = reader().map_err(PredictError::internal)?;
    if header.format().is_none() {
        return Err(PredictError::UnrecognizedImageFormat);
    }
    header
        .into_dimensions()
        .map_err(|_| PredictError::UnrecognizedImageFormat)?;

    let img = reader()
        .map_err(PredictError::internal)?
        .decode()
        .map_err(|e| match e {
            ImageError::Unsupported(_) => PredictError::UnrecognizedImageFormat,
            other => PredictError::internal(other),
        })?;
    Ok(img.into_rgb8())
}

#[cfg(test)]
pub(crate) fn encode(img: image::DynamicImage, format: image::ImageOutputFormat) -> Vec<u8> {
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, format).expect("image encoding");
    buf.into_inner()
}

#[cfg(test)]
pub(crate) fn encode_png(img: image::DynamicImage) -> Vec<u8> {
    encode(img, image::ImageOutputFormat::Png)
}

/// Noisy so the compressed pixel data spans well past its chunk header.
#[cfg(test)]
pub(crate) fn noisy_rgba(width: u32, height: u32) -> image::RgbaImage {
    image::RgbaImage::from_fn(width, height, |x, y| {
        let v = x.wrapping_mul(2_654_435_761).wrapping_add(y.wrapping_mul(40_503)) >> 7;
        image::Rgba([v as u8, (v >> 8) as u8, (v >> 16) as u8, 255])
    })
}

/// A PNG whose header is intact but whose IDAT data stops halfway.
#[cfg(test)]
pub(crate) fn truncated_in_pixel_data() -> Vec<u8> {
    let bytes = encode_png(image::DynamicImage::ImageRgba8(noisy_rgba(64, 64)));
    let idat = bytes
        .windows(4)
        .position(|w| w == b"IDAT")
        .expect("png has an IDAT chunk");
    let data_len = u32::from_be_bytes(bytes[idat - 4..idat].try_into().unwrap()) as usize;
    bytes[..idat + 4 + data_len / 2].to_vec()
}
