use image::GrayImage;
use logging_timer::time;

use crate::boxes::GridSegment;
use crate::geometry::Point;

/// Source of straight line segments for box finding. Segment directions
/// follow the convention in [`GridSegment`]: light on the right-hand side
/// of travel, so the inside of a dark outline traces clockwise.
pub trait LineSegmentDetector: Send + Sync {
    fn detect(&self, img: &GrayImage) -> Vec<GridSegment>;
}

/// Traces runs of edge pixels in a binarized image. A run follows one kind
/// of edge (dark pixel with a light neighbor on one particular side) and may
/// drift by one pixel per step, so slightly rotated lines stay whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeRunDetector {
    /// Shorter runs are discarded.
    pub min_length: u32,
}

impl Default for EdgeRunDetector {
    fn default() -> Self {
        Self { min_length: 8 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EdgeKind {
    LightBelow,
    LightAbove,
    LightRight,
    LightLeft,
}

impl EdgeKind {
    const ALL: [EdgeKind; 4] = [
        EdgeKind::LightBelow,
        EdgeKind::LightAbove,
        EdgeKind::LightRight,
        EdgeKind::LightLeft,
    ];

    const fn light_offset(self) -> (i64, i64) {
        match self {
            EdgeKind::LightBelow => (0, 1),
            EdgeKind::LightAbove => (0, -1),
            EdgeKind::LightRight => (1, 0),
            EdgeKind::LightLeft => (-1, 0),
        }
    }

    const fn is_horizontal(self) -> bool {
        matches!(self, EdgeKind::LightBelow | EdgeKind::LightAbove)
    }

    /// Whether segments of this kind run against the scan order (right to
    /// left, or bottom to top).
    const fn is_reversed(self) -> bool {
        matches!(self, EdgeKind::LightAbove | EdgeKind::LightRight)
    }
}

struct EdgeImage<'a> {
    img: &'a GrayImage,
    width: i64,
    height: i64,
}

impl<'a> EdgeImage<'a> {
    fn new(img: &'a GrayImage) -> Self {
        Self {
            img,
            width: img.width() as i64,
            height: img.height() as i64,
        }
    }

    fn in_bounds(&self, x: i64, y: i64) -> bool {
        x >= 0 && y >= 0 && x < self.width && y < self.height
    }

    fn is_dark(&self, x: i64, y: i64) -> bool {
        self.img.get_pixel(x as u32, y as u32).0[0] < 128
    }

    /// Pixels at the image border have no light neighbor outside it.
    fn is_edge(&self, x: i64, y: i64, kind: EdgeKind) -> bool {
        let (dx, dy) = kind.light_offset();
        self.in_bounds(x, y)
            && self.in_bounds(x + dx, y + dy)
            && self.is_dark(x, y)
            && !self.is_dark(x + dx, y + dy)
    }

    fn index(&self, x: i64, y: i64) -> usize {
        (y * self.width + x) as usize
    }
}

impl EdgeRunDetector {
    fn detect_kind(&self, edges: &EdgeImage, kind: EdgeKind, segments: &mut Vec<GridSegment>) {
        let mut visited = vec![false; (edges.width * edges.height) as usize];
        let (outer, inner) = if kind.is_horizontal() {
            (edges.width, edges.height)
        } else {
            (edges.height, edges.width)
        };

        // horizontal runs are discovered from their leftmost pixel by
        // scanning column-major, vertical runs from their topmost
        for a in 0..outer {
            for b in 0..inner {
                let (x, y) = if kind.is_horizontal() { (a, b) } else { (b, a) };
                if visited[edges.index(x, y)] || !edges.is_edge(x, y, kind) {
                    continue;
                }

                visited[edges.index(x, y)] = true;
                let (mut cx, mut cy) = (x, y);
                loop {
                    let candidates = if kind.is_horizontal() {
                        [(cx + 1, cy), (cx + 1, cy - 1), (cx + 1, cy + 1)]
                    } else {
                        [(cx, cy + 1), (cx - 1, cy + 1), (cx + 1, cy + 1)]
                    };
                    let Some((nx, ny)) = candidates.into_iter().find(|&(nx, ny)| {
                        edges.is_edge(nx, ny, kind) && !visited[edges.index(nx, ny)]
                    }) else {
                        break;
                    };
                    visited[edges.index(nx, ny)] = true;
                    cx = nx;
                    cy = ny;
                }

                let run_length = if kind.is_horizontal() { cx - x + 1 } else { cy - y + 1 };
                if run_length < self.min_length as i64 {
                    continue;
                }

                let first = Point::new(x as f32, y as f32);
                let last = Point::new(cx as f32, cy as f32);
                segments.push(if kind.is_reversed() {
                    GridSegment::new(last, first)
                } else {
                    GridSegment::new(first, last)
                });
            }
        }
    }
}

impl LineSegmentDetector for EdgeRunDetector {
    #[time]
    fn detect(&self, img: &GrayImage) -> Vec<GridSegment> {
        let edges = EdgeImage::new(img);
        let mut segments = vec![];
        for kind in EdgeKind::ALL {
            self.detect_kind(&edges, kind, &mut segments);
        }
        segments
    }
}
