use image::{GrayImage, Luma};
use log::{debug, warn};
use logging_timer::time;
use nalgebra::{DMatrix, Matrix3, SMatrix, SVector, Vector3};

use crate::binarize::binarize_gray_mut;
use crate::geometry::Point;
use crate::image_utils::{resize_to, WHITE};

/// A projective transform between two image planes.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Homography {
    pub h: Matrix3<f64>,
}

impl Homography {
    pub const fn new(h: Matrix3<f64>) -> Self {
        Self { h }
    }

    pub fn identity() -> Self {
        Self::new(Matrix3::identity())
    }

    pub fn apply(&self, p: Point<f32>) -> Point<f32> {
        let v = self.h * Vector3::new(p.x as f64, p.y as f64, 1.0);
        let w = v[2];
        Point::new((v[0] / w) as f32, (v[1] / w) as f32)
    }

    pub fn inverse(&self) -> Option<Self> {
        self.h.try_inverse().map(Self::new)
    }
}

/// Translates points to their centroid and scales them so their mean
/// distance from it is √2.
fn normalize_points(points: &[Point<f32>]) -> (Vec<Point<f64>>, Matrix3<f64>) {
    let n = points.len() as f64;
    let cx = points.iter().map(|p| p.x as f64).sum::<f64>() / n;
    let cy = points.iter().map(|p| p.y as f64).sum::<f64>() / n;
    let mean_distance = points
        .iter()
        .map(|p| ((p.x as f64 - cx).powi(2) + (p.y as f64 - cy).powi(2)).sqrt())
        .sum::<f64>()
        / n;
    let s = if mean_distance > 1e-12 {
        2f64.sqrt() / mean_distance
    } else {
        1.0
    };
    let t = Matrix3::new(s, 0.0, -s * cx, 0.0, s, -s * cy, 0.0, 0.0, 1.0);

    let normalized = points
        .iter()
        .map(|p| {
            let v = t * Vector3::new(p.x as f64, p.y as f64, 1.0);
            Point::new(v[0], v[1])
        })
        .collect();
    (normalized, t)
}

fn denormalize(hn: Matrix3<f64>, t_from: Matrix3<f64>, t_to: Matrix3<f64>) -> Option<Homography> {
    let h = t_to.try_inverse()? * hn * t_from;
    let s = h[(2, 2)];
    if s.abs() < 1e-12 {
        return None;
    }
    Some(Homography::new(h / s))
}

/// Estimates the homography taking each point in `from` to the point at the
/// same index in `to`. Four correspondences are solved exactly; more use a
/// least-squares DLT. Returns `None` for fewer than four points or a
/// degenerate configuration.
pub fn find_homography(from: &[Point<f32>], to: &[Point<f32>]) -> Option<Homography> {
    if from.len() != to.len() || from.len() < 4 {
        return None;
    }

    let (from_n, t_from) = normalize_points(from);
    let (to_n, t_to) = normalize_points(to);

    if from.len() == 4 {
        let mut a = SMatrix::<f64, 8, 8>::zeros();
        let mut b = SVector::<f64, 8>::zeros();

        for k in 0..4 {
            let (x, y) = (from_n[k].x, from_n[k].y);
            let (u, v) = (to_n[k].x, to_n[k].y);

            a[(2 * k, 0)] = x;
            a[(2 * k, 1)] = y;
            a[(2 * k, 2)] = 1.0;
            a[(2 * k, 6)] = -u * x;
            a[(2 * k, 7)] = -u * y;
            b[2 * k] = u;

            a[(2 * k + 1, 3)] = x;
            a[(2 * k + 1, 4)] = y;
            a[(2 * k + 1, 5)] = 1.0;
            a[(2 * k + 1, 6)] = -v * x;
            a[(2 * k + 1, 7)] = -v * y;
            b[2 * k + 1] = v;
        }

        let x = a.lu().solve(&b)?;
        let hn = Matrix3::new(x[0], x[1], x[2], x[3], x[4], x[5], x[6], x[7], 1.0);
        return denormalize(hn, t_from, t_to);
    }

    let n = from.len();
    let mut a = DMatrix::<f64>::zeros(2 * n, 9);
    for k in 0..n {
        let (x, y) = (from_n[k].x, from_n[k].y);
        let (u, v) = (to_n[k].x, to_n[k].y);

        a[(2 * k, 0)] = -x;
        a[(2 * k, 1)] = -y;
        a[(2 * k, 2)] = -1.0;
        a[(2 * k, 6)] = u * x;
        a[(2 * k, 7)] = u * y;
        a[(2 * k, 8)] = u;

        a[(2 * k + 1, 3)] = -x;
        a[(2 * k + 1, 4)] = -y;
        a[(2 * k + 1, 5)] = -1.0;
        a[(2 * k + 1, 6)] = v * x;
        a[(2 * k + 1, 7)] = v * y;
        a[(2 * k + 1, 8)] = v;
    }

    // the solution is the right singular vector of the smallest singular value
    let svd = a.svd(true, true);
    let v_t = svd.v_t?;
    let last = v_t.nrows().checked_sub(1)?;
    let h = v_t.row(last);
    let hn = Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], h[8]);
    denormalize(hn, t_from, t_to)
}

fn sample_bilinear(img: &GrayImage, x: f32, y: f32) -> u8 {
    let pixel = |px: i64, py: i64| -> f32 {
        if px < 0 || py < 0 || px >= img.width() as i64 || py >= img.height() as i64 {
            return WHITE.0[0] as f32;
        }
        img.get_pixel(px as u32, py as u32).0[0] as f32
    };

    let x0 = x.floor();
    let y0 = y.floor();
    let fx = x - x0;
    let fy = y - y0;
    let (x0, y0) = (x0 as i64, y0 as i64);

    let top = pixel(x0, y0) * (1.0 - fx) + pixel(x0 + 1, y0) * fx;
    let bottom = pixel(x0, y0 + 1) * (1.0 - fx) + pixel(x0 + 1, y0 + 1) * fx;
    (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8
}

/// Renders `img` into a `width` x `height` image whose pixel `p` comes from
/// `img` at `from_destination(p)`. Pixels mapped from outside `img` are
/// white.
pub fn warp_perspective(
    img: &GrayImage,
    from_destination: &Homography,
    width: u32,
    height: u32,
) -> GrayImage {
    GrayImage::from_fn(width, height, |x, y| {
        let source = from_destination.apply(Point::new(x as f32, y as f32));
        Luma([sample_bilinear(img, source.x, source.y)])
    })
}

/// Maps a scanned page onto its template's pixel grid using corresponding
/// points on each, then binarizes the result. Without enough usable points
/// the scan is only resized.
#[time]
pub fn map_ballot_onto_template(
    scan: &GrayImage,
    scan_points: &[Point<f32>],
    template_points: &[Point<f32>],
    template_size: (u32, u32),
) -> GrayImage {
    let (width, height) = template_size;

    let from_template = find_homography(scan_points, template_points)
        .and_then(|to_template| to_template.inverse());
    let mut mapped = match from_template {
        Some(from_template) => warp_perspective(scan, &from_template, width, height),
        None => {
            if !scan_points.is_empty() {
                warn!(
                    "could not compute a homography from {} point(s), resizing instead",
                    scan_points.len()
                );
            }
            resize_to(scan, width, height)
        }
    };

    let threshold = binarize_gray_mut(&mut mapped, None);
    debug!("mapped ballot binarized at threshold {threshold}");
    mapped
}
