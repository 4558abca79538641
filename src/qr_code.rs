use image::GrayImage;
use log::debug;
use rqrr::PreparedImage;

use crate::metadata::{DetectQrCode, QrCodeDetection};

/// QR code detection backed by `rqrr`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RqrrDetector;

impl DetectQrCode for RqrrDetector {
    fn detect(&self, img: &GrayImage) -> Option<QrCodeDetection> {
        let (width, height) = img.dimensions();
        let mut prepared = PreparedImage::prepare_from_greyscale(
            width as usize,
            height as usize,
            |x, y| img.get_pixel(x as u32, y as u32).0[0],
        );

        prepared.detect_grids().into_iter().find_map(|grid| {
            let mut data = vec![];
            match grid.decode_to(&mut data) {
                Ok(_) => {
                    // corners run clockwise from the code's own top-left, so
                    // that corner sits above and left of the opposite one
                    // when the code is upright
                    let [top_left, _, bottom_right, _] = grid.bounds;
                    let right_side_up =
                        top_left.x + top_left.y <= bottom_right.x + bottom_right.y;
                    Some(QrCodeDetection {
                        data,
                        right_side_up: Some(right_side_up),
                    })
                }
                Err(err) => {
                    debug!("failed to decode QR code grid: {err:?}");
                    None
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use imageproc::drawing::draw_filled_rect_mut;
    use qrcode::{Color, QrCode};

    use super::*;
    use crate::geometry::Rect;
    use crate::image_utils::{flip_in_place, BLACK, WHITE};
    use crate::metadata::{detect_metadata, CompactMetadataCodec};
    use crate::test_utils::{election_for_pages, ContestSpec, PageSpec};

    const PAYLOAD: &str = "https://ballot.page/?t=_&pr=23&bs=1&p=1-1";
    const MODULE_SIZE: u32 = 4;
    const QUIET_ZONE: u32 = 4;

    fn render_qr_code(payload: &[u8]) -> GrayImage {
        let code = QrCode::new(payload).unwrap();
        let modules = code.width() as u32;
        let size = (modules + 2 * QUIET_ZONE) * MODULE_SIZE;
        let mut img = GrayImage::from_pixel(size, size, WHITE);
        for (index, color) in code.to_colors().into_iter().enumerate() {
            if color != Color::Dark {
                continue;
            }
            let column = index as u32 % modules + QUIET_ZONE;
            let row = index as u32 / modules + QUIET_ZONE;
            let module = Rect::new(
                (column * MODULE_SIZE) as i32,
                (row * MODULE_SIZE) as i32,
                MODULE_SIZE,
                MODULE_SIZE,
            );
            draw_filled_rect_mut(&mut img, module.into(), BLACK);
        }
        img
    }

    /// A 600x800 page with the code printed near its bottom-right corner.
    fn page_with_code(code: &GrayImage) -> GrayImage {
        let mut page = GrayImage::from_pixel(600, 800, WHITE);
        let x = page.width() - code.width() - 10;
        let y = page.height() - code.height() - 10;
        image::imageops::overlay(&mut page, code, x.into(), y.into());
        page
    }

    fn codec() -> CompactMetadataCodec {
        let page = PageSpec::new(vec![ContestSpec::new(0, 3)]);
        CompactMetadataCodec::new(&election_for_pages(&[&page]))
    }

    #[test]
    fn test_blank_image_has_no_code() {
        let img = GrayImage::from_pixel(120, 120, WHITE);
        assert_eq!(RqrrDetector.detect(&img), None);
    }

    #[test]
    fn test_upright_code() {
        let code = render_qr_code(PAYLOAD.as_bytes());
        assert_eq!(
            RqrrDetector.detect(&code),
            Some(QrCodeDetection {
                data: PAYLOAD.as_bytes().to_vec(),
                right_side_up: Some(true),
            })
        );
    }

    #[test]
    fn test_upside_down_code() {
        let mut code = render_qr_code(PAYLOAD.as_bytes());
        flip_in_place(&mut code);
        assert_eq!(
            RqrrDetector.detect(&code),
            Some(QrCodeDetection {
                data: PAYLOAD.as_bytes().to_vec(),
                right_side_up: Some(false),
            })
        );
    }

    #[test]
    fn test_detect_metadata_on_upright_and_flipped_pages() {
        let codec = codec();
        let mut page = page_with_code(&render_qr_code(PAYLOAD.as_bytes()));

        let upright = detect_metadata(&page, &RqrrDetector, &codec).unwrap();
        assert!(!upright.flipped);
        assert_eq!(upright.metadata.page_number, 1);
        assert_eq!(upright.metadata.precinct_id.as_str(), "23");

        flip_in_place(&mut page);
        let flipped = detect_metadata(&page, &RqrrDetector, &codec).unwrap();
        assert!(flipped.flipped);
        assert_eq!(flipped.metadata, upright.metadata);
    }

    #[test]
    fn test_code_orientation_overrides_search_region() {
        let mut code = render_qr_code(PAYLOAD.as_bytes());
        flip_in_place(&mut code);
        let page = page_with_code(&code);
        let detected = detect_metadata(&page, &RqrrDetector, &codec()).unwrap();
        assert!(detected.flipped);
    }
}
