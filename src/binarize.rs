use image::{DynamicImage, GrayImage, Luma, RgbaImage};
use imageproc::contrast::threshold_mut;
use logging_timer::time;

/// Threshold used when an image has too few distinct levels for Otsu's
/// method to split.
pub const DEFAULT_THRESHOLD: u8 = 127;

/// A page image in one of the two pixel layouts the interpreter accepts.
#[derive(Debug, Clone, PartialEq)]
pub enum PageImage {
    Gray(GrayImage),
    Rgba(RgbaImage),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BinarizeError {
    #[error("unsupported channel count: {0} (expected 1 or 4)")]
    UnsupportedChannelCount(u8),

    #[error("destination size {destination_size:?} does not match source size {source_size:?}")]
    SizeMismatch {
        source_size: (u32, u32),
        destination_size: (u32, u32),
    },

    #[error("destination has {destination_channels} channel(s) but source has {source_channels}")]
    ChannelMismatch {
        source_channels: u8,
        destination_channels: u8,
    },
}

impl PageImage {
    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            PageImage::Gray(img) => img.dimensions(),
            PageImage::Rgba(img) => img.dimensions(),
        }
    }

    pub fn width(&self) -> u32 {
        self.dimensions().0
    }

    pub fn height(&self) -> u32 {
        self.dimensions().1
    }

    pub const fn channels(&self) -> u8 {
        match self {
            PageImage::Gray(_) => 1,
            PageImage::Rgba(_) => 4,
        }
    }

    /// Grayscale rendition of the image using luminosity weighting.
    pub fn to_luma(&self) -> GrayImage {
        match self {
            PageImage::Gray(img) => img.clone(),
            PageImage::Rgba(img) => GrayImage::from_fn(img.width(), img.height(), |x, y| {
                let [r, g, b, _] = img.get_pixel(x, y).0;
                Luma([luminosity(r, g, b)])
            }),
        }
    }

    pub fn into_luma(self) -> GrayImage {
        match self {
            PageImage::Gray(img) => img,
            rgba @ PageImage::Rgba(_) => rgba.to_luma(),
        }
    }
}

impl From<GrayImage> for PageImage {
    fn from(img: GrayImage) -> Self {
        PageImage::Gray(img)
    }
}

impl From<RgbaImage> for PageImage {
    fn from(img: RgbaImage) -> Self {
        PageImage::Rgba(img)
    }
}

impl TryFrom<DynamicImage> for PageImage {
    type Error = BinarizeError;

    fn try_from(img: DynamicImage) -> Result<Self, Self::Error> {
        match img {
            DynamicImage::ImageLuma8(img) => Ok(PageImage::Gray(img)),
            DynamicImage::ImageRgba8(img) => Ok(PageImage::Rgba(img)),
            other => Err(BinarizeError::UnsupportedChannelCount(
                other.color().channel_count(),
            )),
        }
    }
}

/// Luminosity-weighted gray level: R·0.21 + G·0.72 + B·0.07.
pub fn luminosity(r: u8, g: u8, b: u8) -> u8 {
    ((21 * r as u32 + 72 * g as u32 + 7 * b as u32) / 100) as u8
}

pub fn histogram<I: IntoIterator<Item = u8>>(levels: I) -> [u32; 256] {
    let mut histogram = [0u32; 256];
    for level in levels {
        histogram[level as usize] += 1;
    }
    histogram
}

/// Otsu's method over a 256-bin histogram. Pixels at or below the returned
/// level form the dark class. Candidates are visited from 255 downward and
/// only a strictly greater inter-class variance replaces the best so far.
pub fn otsu_level_from_histogram(histogram: &[u32; 256]) -> u8 {
    let total: f64 = histogram.iter().map(|&count| count as f64).sum();
    let weighted_total: f64 = histogram
        .iter()
        .enumerate()
        .map(|(level, &count)| level as f64 * count as f64)
        .sum();

    let mut best: Option<(u8, f64)> = None;
    let mut dark_count = total;
    let mut dark_sum = weighted_total;

    for level in (0..=255usize).rev() {
        if level < 255 {
            // drop level + 1 from the dark class
            let count = histogram[level + 1] as f64;
            dark_count -= count;
            dark_sum -= (level + 1) as f64 * count;
        }

        let light_count = total - dark_count;
        if dark_count == 0.0 || light_count == 0.0 {
            continue;
        }

        let q1 = dark_count / total;
        let q2 = light_count / total;
        let m1 = dark_sum / dark_count;
        let m2 = (weighted_total - dark_sum) / light_count;
        let variance = q1 * q2 * (m1 - m2) * (m1 - m2);

        if best.map_or(true, |(_, best_variance)| variance > best_variance) {
            best = Some((level as u8, variance));
        }
    }

    best.map_or(DEFAULT_THRESHOLD, |(level, _)| level)
}

pub fn otsu_level<I: IntoIterator<Item = u8>>(levels: I) -> u8 {
    otsu_level_from_histogram(&histogram(levels))
}

/// Binarizes `image` in place, returning the threshold that was applied.
#[time]
pub fn binarize(image: &mut PageImage, threshold: Option<u8>) -> u8 {
    match image {
        PageImage::Gray(img) => binarize_gray_mut(img, threshold),
        PageImage::Rgba(img) => {
            let threshold = threshold.unwrap_or_else(|| {
                otsu_level(img.pixels().map(|p| luminosity(p.0[0], p.0[1], p.0[2])))
            });
            for pixel in img.pixels_mut() {
                let [r, g, b, a] = pixel.0;
                let level = binary_level(luminosity(r, g, b), threshold);
                pixel.0 = [level, level, level, a];
            }
            threshold
        }
    }
}

/// Binarizes `source` into `destination`, which must have the same size and
/// channel count.
pub fn binarize_into(
    source: &PageImage,
    destination: &mut PageImage,
    threshold: Option<u8>,
) -> Result<u8, BinarizeError> {
    if source.dimensions() != destination.dimensions() {
        return Err(BinarizeError::SizeMismatch {
            source_size: source.dimensions(),
            destination_size: destination.dimensions(),
        });
    }

    if source.channels() != destination.channels() {
        return Err(BinarizeError::ChannelMismatch {
            source_channels: source.channels(),
            destination_channels: destination.channels(),
        });
    }

    destination.clone_from(source);
    Ok(binarize(destination, threshold))
}

pub fn binarize_gray_mut(img: &mut GrayImage, threshold: Option<u8>) -> u8 {
    let threshold = threshold.unwrap_or_else(|| otsu_level(img.as_raw().iter().copied()));
    threshold_mut(img, threshold);
    threshold
}

/// Returns a binarized copy of a grayscale image.
pub fn binarize_gray(img: &GrayImage) -> GrayImage {
    let mut out = img.clone();
    binarize_gray_mut(&mut out, None);
    out
}

const fn binary_level(level: u8, threshold: u8) -> u8 {
    if level > threshold {
        u8::MAX
    } else {
        u8::MIN
    }
}

#[cfg(test)]
mod tests {
    use image::Rgba;
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_otsu_level() {
        assert_eq!(otsu_level([1, 2, 35, 98, 244, 255, 255, 255]), 243);
    }

    #[test]
    fn test_otsu_level_single_level() {
        assert_eq!(otsu_level([9, 9, 9]), DEFAULT_THRESHOLD);
        assert_eq!(otsu_level(Vec::new()), DEFAULT_THRESHOLD);
    }

    #[test]
    fn test_luminosity() {
        assert_eq!(luminosity(255, 255, 255), 255);
        assert_eq!(luminosity(0, 0, 0), 0);
        assert_eq!(luminosity(100, 0, 0), 21);
    }

    #[test]
    fn test_binarize_gray_explicit_threshold() {
        let mut image = PageImage::Gray(GrayImage::from_raw(4, 1, vec![0, 100, 101, 255]).unwrap());
        assert_eq!(binarize(&mut image, Some(100)), 100);
        assert_eq!(
            image,
            PageImage::Gray(GrayImage::from_raw(4, 1, vec![0, 0, 255, 255]).unwrap())
        );
    }

    #[test]
    fn test_binarize_rgba_keeps_alpha() {
        let mut img = RgbaImage::from_pixel(2, 1, Rgba([250, 250, 250, 128]));
        img.put_pixel(1, 0, Rgba([10, 20, 30, 255]));
        let mut image = PageImage::Rgba(img);
        binarize(&mut image, None);
        let PageImage::Rgba(img) = image else {
            panic!("expected rgba image");
        };
        assert_eq!(img.get_pixel(0, 0).0, [255, 255, 255, 128]);
        assert_eq!(img.get_pixel(1, 0).0, [0, 0, 0, 255]);
    }

    #[test]
    fn test_binarize_into_checks_size_and_channels() {
        let source = PageImage::Gray(GrayImage::new(3, 3));
        let mut wrong_size = PageImage::Gray(GrayImage::new(3, 4));
        assert_eq!(
            binarize_into(&source, &mut wrong_size, None),
            Err(BinarizeError::SizeMismatch {
                source_size: (3, 3),
                destination_size: (3, 4)
            })
        );

        let mut wrong_channels = PageImage::Rgba(RgbaImage::new(3, 3));
        assert_eq!(
            binarize_into(&source, &mut wrong_channels, None),
            Err(BinarizeError::ChannelMismatch {
                source_channels: 1,
                destination_channels: 4
            })
        );

        let mut destination = PageImage::Gray(GrayImage::new(3, 3));
        assert!(binarize_into(&source, &mut destination, None).is_ok());
    }

    #[test]
    fn test_mismatch_errors_describe_both_images() {
        use std::error::Error;

        let error = BinarizeError::SizeMismatch {
            source_size: (3, 3),
            destination_size: (3, 4),
        };
        assert_eq!(
            error.to_string(),
            "destination size (3, 4) does not match source size (3, 3)"
        );
        assert!(error.source().is_none());

        let error = BinarizeError::ChannelMismatch {
            source_channels: 1,
            destination_channels: 4,
        };
        assert_eq!(
            error.to_string(),
            "destination has 4 channel(s) but source has 1"
        );
        assert!(error.source().is_none());
    }

    #[test]
    fn test_rejects_unsupported_formats() {
        let rgb = DynamicImage::new_rgb8(2, 2);
        assert_eq!(
            PageImage::try_from(rgb),
            Err(BinarizeError::UnsupportedChannelCount(3))
        );
    }

    proptest! {
        #[test]
        fn test_binarize_gray_is_idempotent(
            (width, height, pixels) in (1u32..12, 1u32..12)
                .prop_flat_map(|(w, h)| {
                    (Just(w), Just(h), prop::collection::vec(any::<u8>(), (w * h) as usize))
                })
        ) {
            let mut once = PageImage::Gray(GrayImage::from_raw(width, height, pixels).unwrap());
            binarize(&mut once, None);
            let mut twice = once.clone();
            binarize(&mut twice, None);
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn test_binarize_rgba_is_idempotent(
            (width, height, pixels) in (1u32..8, 1u32..8)
                .prop_flat_map(|(w, h)| {
                    (Just(w), Just(h), prop::collection::vec(any::<u8>(), (w * h * 4) as usize))
                })
        ) {
            let mut once = PageImage::Rgba(RgbaImage::from_raw(width, height, pixels).unwrap());
            binarize(&mut once, None);
            let mut twice = once.clone();
            binarize(&mut twice, None);
            prop_assert_eq!(once, twice);
        }
    }
}
