use crate::error::ImageError;
use image::{DynamicImage, GrayAlphaImage, GrayImage, ImageFormat, RgbImage, RgbaImage};
use std::fs;
use std::path::{Path, PathBuf};

pub const THUMBNAIL_SUFFIX: &str = "_thumb";
pub const BROWSE_SUFFIX: &str = "_browse";
const PREVIEW_EXTENSION: &str = "jpg";

fn preview_path(source: &Path, browse_dir: Option<&Path>, suffix: &str) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    let dir = browse_dir
        .map(Path::to_path_buf)
        .or_else(|| source.parent().map(Path::to_path_buf))
        .unwrap_or_default();
    dir.join(format!("{stem}{suffix}.{PREVIEW_EXTENSION}"))
}

/// `<browse_dir or parent>/<stem>_thumb.jpg`
pub fn thumbnail_path(source: &Path, browse_dir: Option<&Path>) -> PathBuf {
    preview_path(source, browse_dir, THUMBNAIL_SUFFIX)
}

/// `<browse_dir or parent>/<stem>_browse.jpg`
pub fn browse_path(source: &Path, browse_dir: Option<&Path>) -> PathBuf {
    preview_path(source, browse_dir, BROWSE_SUFFIX)
}

/// Full-resolution 8-bit rendition of `image`.
pub fn make_browse_image(image: &DynamicImage) -> DynamicImage {
    to_eight_bit(image)
}

/// Bounded-size 8-bit preview of `image`, aspect ratio preserved.
pub fn make_thumbnail(image: &DynamicImage, max_size: (u32, u32)) -> DynamicImage {
    let preview = to_eight_bit(image);
    let (max_width, max_height) = max_size;
    if preview.width() <= max_width && preview.height() <= max_height {
        return preview;
    }
    preview.thumbnail(max_width.max(1), max_height.max(1))
}

fn rescale(samples: &[u16]) -> Vec<u8> {
    samples
        .iter()
        .map(|&v| (u32::from(v) * 255 / u32::from(u16::MAX)) as u8)
        .collect()
}

fn to_eight_bit(image: &DynamicImage) -> DynamicImage {
    let (width, height) = (image.width(), image.height());
    let rescaled = match image {
        DynamicImage::ImageLuma16(buf) => {
            GrayImage::from_raw(width, height, rescale(buf.as_raw())).map(DynamicImage::ImageLuma8)
        }
        DynamicImage::ImageLumaA16(buf) => GrayAlphaImage::from_raw(width, height, rescale(buf.as_raw()))
            .map(DynamicImage::ImageLumaA8),
        DynamicImage::ImageRgb16(buf) => {
            RgbImage::from_raw(width, height, rescale(buf.as_raw())).map(DynamicImage::ImageRgb8)
        }
        DynamicImage::ImageRgba16(buf) => {
            RgbaImage::from_raw(width, height, rescale(buf.as_raw())).map(DynamicImage::ImageRgba8)
        }
        DynamicImage::ImageRgb32F(_) | DynamicImage::ImageRgba32F(_) => {
            Some(DynamicImage::ImageRgb8(image.to_rgb8()))
        }
        _ => None,
    };
    rescaled.unwrap_or_else(|| image.clone())
}

fn save_jpeg(image: DynamicImage, target: &Path) -> Result<(), ImageError> {
    // JPEG has no alpha channel
    let image = if image.color().has_alpha() {
        DynamicImage::ImageRgb8(image.to_rgb8())
    } else {
        image
    };
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    image
        .save_with_format(target, ImageFormat::Jpeg)
        .map_err(|source| ImageError::Encode {
            path: target.to_path_buf(),
            source,
        })
}

/// JPEG previews written for one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Previews {
    pub browse: PathBuf,
    pub thumbnail: PathBuf,
}

/// Writes a full-resolution browse image and a bounded thumbnail for each
/// frame it is given.
#[derive(Debug, Clone)]
pub struct Thumbnailer {
    browse_dir: Option<PathBuf>,
    max_size: (u32, u32),
}

impl Thumbnailer {
    pub fn new(browse_dir: Option<PathBuf>, max_size: (u32, u32)) -> Self {
        Self {
            browse_dir,
            max_size,
        }
    }

    pub fn accepts(&self, path: &Path) -> bool {
        let is_tiff = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("tif") || ext.eq_ignore_ascii_case("tiff"))
            .unwrap_or(false);
        let is_preview = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .map(|stem| stem.ends_with(THUMBNAIL_SUFFIX) || stem.ends_with(BROWSE_SUFFIX))
            .unwrap_or(false);
        is_tiff && !is_preview
    }

    /// Blocking: reads `source` once and writes both previews.
    pub fn write_previews(&self, source: &Path) -> Result<Previews, ImageError> {
        let full = image::open(source).map_err(ImageError::Decode)?;
        let browse = browse_path(source, self.browse_dir.as_deref());
        save_jpeg(make_browse_image(&full), &browse)?;
        let thumbnail = thumbnail_path(source, self.browse_dir.as_deref());
        save_jpeg(make_thumbnail(&full, self.max_size), &thumbnail)?;
        Ok(Previews { browse, thumbnail })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Luma};

    fn gradient(width: u32, height: u32) -> DynamicImage {
        let buffer: ImageBuffer<Luma<u16>, Vec<u16>> = ImageBuffer::from_fn(width, height, |x, _| {
            Luma([(x * u32::from(u16::MAX) / (width - 1)) as u16])
        });
        DynamicImage::ImageLuma16(buffer)
    }

    #[test]
    fn thumbnail_keeps_contrast_order() {
        let source = gradient(960, 120);
        let thumb = make_thumbnail(&source, (240, 240));
        assert_eq!(thumb.width(), 240);
        assert_eq!(thumb.height(), 30);

        let gray = thumb.to_luma8();
        let row: Vec<u8> = (0..gray.width()).map(|x| gray.get_pixel(x, 15)[0]).collect();
        assert!(row.windows(2).all(|pair| pair[0] <= pair[1]));
        assert!(row[0] < row[row.len() - 1]);
    }

    #[test]
    fn rescale_maps_full_range() {
        assert_eq!(rescale(&[0, 32_767, u16::MAX]), vec![0, 127, 255]);
    }

    #[test]
    fn small_frames_are_not_upscaled() {
        let thumb = make_thumbnail(&gradient(16, 8), (240, 240));
        assert_eq!((thumb.width(), thumb.height()), (16, 8));
        assert!(matches!(thumb, DynamicImage::ImageLuma8(_)));
    }

    #[test]
    fn thumbnail_path_uses_browse_dir() {
        let path = thumbnail_path(
            Path::new("/data/products/navcam_left_1.tif"),
            Some(Path::new("/data/browse")),
        );
        assert_eq!(path, PathBuf::from("/data/browse/navcam_left_1_thumb.jpg"));

        let beside = thumbnail_path(Path::new("/data/products/a.tif"), None);
        assert_eq!(beside, PathBuf::from("/data/products/a_thumb.jpg"));

        let browse = browse_path(
            Path::new("/data/products/navcam_left_1.tif"),
            Some(Path::new("/data/browse")),
        );
        assert_eq!(browse, PathBuf::from("/data/browse/navcam_left_1_browse.jpg"));
    }

    #[test]
    fn browse_image_keeps_full_resolution() {
        let browse = make_browse_image(&gradient(960, 120));
        assert_eq!((browse.width(), browse.height()), (960, 120));
        assert!(matches!(browse, DynamicImage::ImageLuma8(_)));
        let gray = browse.to_luma8();
        assert_eq!(gray.get_pixel(0, 0)[0], 0);
        assert_eq!(gray.get_pixel(959, 0)[0], 255);
    }

    #[test]
    fn writes_jpeg_previews_for_tiff_frames() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("frame.tif");
        gradient(480, 64).save_with_format(&source, ImageFormat::Tiff).unwrap();

        let thumbnailer = Thumbnailer::new(Some(dir.path().join("browse")), (240, 240));
        assert!(thumbnailer.accepts(&source));
        assert!(!thumbnailer.accepts(&dir.path().join("frame.json")));
        assert!(!thumbnailer.accepts(&dir.path().join("frame_browse.tif")));

        let written = thumbnailer.write_previews(&source).unwrap();
        let thumb = image::open(&written.thumbnail).unwrap();
        assert_eq!((thumb.width(), thumb.height()), (240, 32));
        let browse = image::open(&written.browse).unwrap();
        assert_eq!((browse.width(), browse.height()), (480, 64));
        assert_eq!(written.browse, dir.path().join("browse").join("frame_browse.jpg"));
    }
}
