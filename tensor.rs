use crate::error::{Error, Result};
use crate::loader::ImageLoader;
use crate::models::ResolvedHandle;
use crate::profile::CapabilityProfile;
use crate::resolver::FileAccess;
use image::{ImageFormat, RgbImage};
use ndarray::Array4;
use std::sync::Arc;

pub const CHANNELS: usize = 3;

/// `[1, edge, edge, 3]` float32 input, channels in R, G, B order with the
/// decoded 0..=255 sample values.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTensor {
    data: Array4<f32>,
}

impl ImageTensor {
    pub fn shape(&self) -> [usize; 4] {
        let dims = self.data.dim();
        [dims.0, dims.1, dims.2, dims.3]
    }

    pub fn dtype(&self) -> &'static str {
        "float32"
    }

    pub fn data(&self) -> &Array4<f32> {
        &self.data
    }

    pub fn into_array(self) -> Array4<f32> {
        self.data
    }
}

pub struct TensorBuilder {
    files: Arc<dyn FileAccess>,
    loader: Arc<dyn ImageLoader>,
}

impl TensorBuilder {
    pub fn new(files: Arc<dyn FileAccess>, loader: Arc<dyn ImageLoader>) -> Self {
        Self { files, loader }
    }

    pub async fn build_tensor(
        &self,
        resolved: &ResolvedHandle,
        profile: &CapabilityProfile,
    ) -> Result<ImageTensor> {
        let bytes = match resolved {
            ResolvedHandle::LocalPath(path) => {
                self.files.read_all_bytes(path).await.map_err(|e| {
                    Error::Decode(format!("Failed to read {}: {e}", path.display()))
                })?
            }
            ResolvedHandle::Remote(url) => self.loader.load(url).await?,
        };
        let edge = profile.target_edge;
        tokio::task::spawn_blocking(move || tensor_from_bytes(&bytes, edge))
            .await
            .map_err(|e| Error::Decode(format!("Task join error: {e}")))?
    }
}

pub fn tensor_from_bytes(bytes: &[u8], edge: u32) -> Result<ImageTensor> {
    let image = decode_rgb(bytes)?;
    resize_nearest(&image, edge)
}

/// Decodes JPEG (or PNG) bytes into an RGB grid; alpha is dropped.
pub fn decode_rgb(bytes: &[u8]) -> Result<RgbImage> {
    let format = image::guess_format(bytes)?;
    if !matches!(format, ImageFormat::Jpeg | ImageFormat::Png) {
        return Err(Error::Decode(format!("Unsupported image format: {format:?}")));
    }
    let image = image::load_from_memory_with_format(bytes, format)?.to_rgb8();
    if image.width() == 0 || image.height() == 0 {
        return Err(Error::Decode("Image has no pixels".into()));
    }
    Ok(image)
}

/// Nearest-neighbour resample to `edge x edge` without corner alignment or
/// half-pixel offsets, then adds the batch axis.
pub fn resize_nearest(image: &RgbImage, edge: u32) -> Result<ImageTensor> {
    if edge == 0 {
        return Err(Error::Decode("Target edge must be positive".into()));
    }
    let (width, height) = image.dimensions();
    let xs: Vec<u32> = (0..edge).map(|x| nearest_source(x, width, edge)).collect();
    let ys: Vec<u32> = (0..edge).map(|y| nearest_source(y, height, edge)).collect();
    let edge = edge as usize;
    let data = Array4::from_shape_fn((1, edge, edge, CHANNELS), |(_, y, x, c)| {
        image.get_pixel(xs[x], ys[y])[c] as f32
    });
    Ok(ImageTensor { data })
}

fn nearest_source(dst: u32, src_len: u32, dst_len: u32) -> u32 {
    let scaled = dst as u64 * src_len as u64 / dst_len as u64;
    (scaled as u32).min(src_len - 1)
}
