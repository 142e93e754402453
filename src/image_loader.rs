//! Image loading utilities

use crate::encoder::Frame;
use crate::{Error, Result};
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageReader, RgbaImage};
use std::path::Path;

/// Load an image file as an RGBA frame
pub fn load_frame<P: AsRef<Path>>(path: P) -> Result<Frame> {
    let path = path.as_ref();
    let img = ImageReader::open(path).map_err(Error::Io)?.decode()?;
    log::trace!("Loaded {} ({:?})", path.display(), img.dimensions());
    Ok(Frame::from_rgba_image(img.to_rgba8()))
}

/// Load images and normalize them to one shared geometry.
///
/// The first image decides the size, rounded down to even dimensions so
/// the stream can be chroma-subsampled. Every other image is scaled to it.
pub fn load_frames<P: AsRef<Path>>(paths: &[P]) -> Result<Vec<Frame>> {
    let Some(first) = paths.first() else {
        return Err(Error::InvalidInput("No images provided".to_string()));
    };

    let first = load_frame(first)?;
    let (width, height) = even_dimensions(first.width(), first.height())?;

    let mut frames = Vec::with_capacity(paths.len());
    frames.push(resize(first, width, height)?);
    for path in &paths[1..] {
        frames.push(resize(load_frame(path)?, width, height)?);
    }

    Ok(frames)
}

/// Scale a frame to exactly `width` x `height`
pub fn resize(frame: Frame, width: u32, height: u32) -> Result<Frame> {
    if frame.width() == width && frame.height() == height {
        return Ok(frame);
    }

    let (src_width, src_height) = (frame.width(), frame.height());
    let img = RgbaImage::from_raw(src_width, src_height, frame.data().to_vec()).ok_or_else(
        || Error::InvalidInput(format!("Invalid {}x{} image data", src_width, src_height)),
    )?;

    let resized = DynamicImage::ImageRgba8(img).resize_exact(width, height, FilterType::Lanczos3);
    Ok(Frame::from_rgba_image(resized.to_rgba8()))
}

fn even_dimensions(width: u32, height: u32) -> Result<(u32, u32)> {
    let (even_width, even_height) = (width & !1, height & !1);
    if even_width == 0 || even_height == 0 {
        return Err(Error::InvalidInput(format!(
            "Image {}x{} is too small to encode",
            width, height
        )));
    }
    Ok((even_width, even_height))
}
