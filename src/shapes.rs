use image::{GrayImage, Luma};

use crate::geometry::{euclidean_distance, Corners, Point, Rect};

/// Default tolerance for how far a contest box may be skewed before its
/// detected corners are ignored in favor of its bounding rectangle.
pub const DEFAULT_MAX_SKEW_DEGREES: f32 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanDirection {
    TopToBottom,
    BottomToTop,
}

/// Walks evenly spaced vertical columns of a region one row at a time,
/// yielding `(column_index, point)` pairs. Columns disabled by the mask are
/// skipped. Callers that consume a shape call `skip_to` to jump past it.
#[derive(Debug, Clone)]
pub struct ColumnScanner {
    columns: Vec<(usize, i32)>,
    current: usize,
    row: i32,
    top: i32,
    bottom: i32,
    direction: ScanDirection,
}

impl ColumnScanner {
    pub fn new(bounds: Rect, column_mask: &[bool], direction: ScanDirection) -> Self {
        let count = column_mask.len().max(1) as i64;
        let columns = column_mask
            .iter()
            .enumerate()
            .filter(|(_, enabled)| **enabled)
            .map(|(index, _)| {
                let offset = (2 * index as i64 + 1) * bounds.width as i64 / (2 * count);
                (index, bounds.x + offset as i32)
            })
            .collect();

        let mut scanner = Self {
            columns,
            current: 0,
            row: 0,
            top: bounds.top(),
            bottom: bounds.bottom(),
            direction,
        };
        scanner.row = scanner.first_row();
        scanner
    }

    /// Index (into the column mask) of the column currently being scanned.
    pub fn column(&self) -> Option<usize> {
        self.columns.get(self.current).map(|(index, _)| *index)
    }

    /// Continues the current column at `row`. Rows past the end of the
    /// column move the scan on to the next column.
    pub fn skip_to(&mut self, row: i32) {
        self.row = row;
    }

    /// Abandons the rest of the current column.
    pub fn next_column(&mut self) {
        self.current += 1;
        self.row = self.first_row();
    }

    fn first_row(&self) -> i32 {
        match self.direction {
            ScanDirection::TopToBottom => self.top,
            ScanDirection::BottomToTop => self.bottom,
        }
    }

    fn row_in_range(&self) -> bool {
        self.row >= self.top && self.row <= self.bottom
    }
}

impl Iterator for ColumnScanner {
    type Item = (usize, Point<i32>);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (index, x) = *self.columns.get(self.current)?;
            if !self.row_in_range() {
                self.next_column();
                continue;
            }

            let point = Point::new(x, self.row);
            self.row += match self.direction {
                ScanDirection::TopToBottom => 1,
                ScanDirection::BottomToTop => -1,
            };
            return Some((index, point));
        }
    }
}

/// Tracks pixels already claimed by a flood fill.
#[derive(Debug, Clone)]
pub struct VisitedMap {
    width: u32,
    height: u32,
    visited: Vec<bool>,
}

impl VisitedMap {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            visited: vec![false; (width * height) as usize],
        }
    }

    pub fn for_image(img: &GrayImage) -> Self {
        Self::new(img.width(), img.height())
    }

    pub fn is_visited(&self, x: i32, y: i32) -> bool {
        self.index(x, y).map_or(true, |index| self.visited[index])
    }

    fn mark(&mut self, x: i32, y: i32) {
        if let Some(index) = self.index(x, y) {
            self.visited[index] = true;
        }
    }

    fn index(&self, x: i32, y: i32) -> Option<usize> {
        if x < 0 || y < 0 || x as u32 >= self.width || y as u32 >= self.height {
            return None;
        }
        Some(y as usize * self.width as usize + x as usize)
    }
}

/// Extreme foreground coordinates along each side of a shape. `top` and
/// `bottom` are indexed by column (relative to the shape's left edge), `left`
/// and `right` by row (relative to its top edge).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edges {
    pub top: Vec<i32>,
    pub right: Vec<i32>,
    pub bottom: Vec<i32>,
    pub left: Vec<i32>,
}

/// A connected region of same-colored pixels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shape {
    pub bounds: Rect,
    pub edges: Edges,
}

/// Flood fills (8-connected) from `seed` over pixels of `color` that lie
/// inside `within`. Returns `None` if the seed is not of that color or was
/// already claimed by an earlier fill sharing `visited`.
pub fn find_shape(
    img: &GrayImage,
    seed: Point<i32>,
    color: Luma<u8>,
    within: &Rect,
    visited: &mut VisitedMap,
) -> Option<Shape> {
    let matches = |x: i32, y: i32| -> bool {
        within.contains(x, y)
            && x >= 0
            && y >= 0
            && img.get_pixel_checked(x as u32, y as u32) == Some(&color)
    };

    if !matches(seed.x, seed.y) || visited.is_visited(seed.x, seed.y) {
        return None;
    }

    let mut pixels = vec![];
    let mut stack = vec![seed];
    visited.mark(seed.x, seed.y);

    while let Some(point) = stack.pop() {
        pixels.push(point);
        for dy in -1..=1 {
            for dx in -1..=1 {
                if dx == 0 && dy == 0 {
                    continue;
                }
                let (x, y) = (point.x + dx, point.y + dy);
                if !visited.is_visited(x, y) && matches(x, y) {
                    visited.mark(x, y);
                    stack.push(Point::new(x, y));
                }
            }
        }
    }

    Some(shape_from_pixels(&pixels))
}

fn shape_from_pixels(pixels: &[Point<i32>]) -> Shape {
    let left = pixels.iter().map(|p| p.x).min().unwrap_or_default();
    let right = pixels.iter().map(|p| p.x).max().unwrap_or_default();
    let top = pixels.iter().map(|p| p.y).min().unwrap_or_default();
    let bottom = pixels.iter().map(|p| p.y).max().unwrap_or_default();
    let bounds = Rect::from_points(left, top, right, bottom);

    let mut edges = Edges {
        top: vec![i32::MAX; bounds.width as usize],
        right: vec![i32::MIN; bounds.height as usize],
        bottom: vec![i32::MIN; bounds.width as usize],
        left: vec![i32::MAX; bounds.height as usize],
    };

    for point in pixels {
        let column = (point.x - left) as usize;
        let row = (point.y - top) as usize;
        edges.top[column] = edges.top[column].min(point.y);
        edges.bottom[column] = edges.bottom[column].max(point.y);
        edges.left[row] = edges.left[row].min(point.x);
        edges.right[row] = edges.right[row].max(point.x);
    }

    Shape { bounds, edges }
}

/// Finds the four extreme corners of `shape`. Any corner farther than
/// `height * tan(max_skew)` from the matching corner of the shape's bounding
/// rectangle is replaced by that bounding corner.
pub fn get_corners(shape: &Shape, max_skew: f32) -> Corners {
    let bounds = shape.bounds;
    let rows = shape
        .edges
        .left
        .iter()
        .zip(shape.edges.right.iter())
        .enumerate()
        .map(|(row, (&left, &right))| (bounds.top() + row as i32, left, right));

    let mut top_left = (i32::MAX, Point::new(bounds.left(), bounds.top()));
    let mut top_right = (i32::MIN, Point::new(bounds.right(), bounds.top()));
    let mut bottom_left = (i32::MAX, Point::new(bounds.left(), bounds.bottom()));
    let mut bottom_right = (i32::MIN, Point::new(bounds.right(), bounds.bottom()));

    for (y, left, right) in rows {
        if left + y < top_left.0 {
            top_left = (left + y, Point::new(left, y));
        }
        if right - y > top_right.0 {
            top_right = (right - y, Point::new(right, y));
        }
        if left - y < bottom_left.0 {
            bottom_left = (left - y, Point::new(left, y));
        }
        if right + y > bottom_right.0 {
            bottom_right = (right + y, Point::new(right, y));
        }
    }

    let tolerance = (bounds.height as f32 * max_skew.tan()).ceil();
    let found = [top_left.1, top_right.1, bottom_left.1, bottom_right.1];
    let mut corners = bounds.corners();

    for (corner, point) in corners.iter_mut().zip(found) {
        let point = Point::new(point.x as f32, point.y as f32);
        if euclidean_distance(corner, &point) <= tolerance {
            *corner = point;
        }
    }

    corners
}
