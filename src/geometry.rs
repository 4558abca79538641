use std::f32::consts::PI;
use std::ops::{Add, Mul, Sub};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Point<T> {
    pub x: T,
    pub y: T,
}

impl<T> Point<T> {
    pub const fn new(x: T, y: T) -> Self {
        Self { x, y }
    }
}

impl Point<f32> {
    pub fn length(&self) -> f32 {
        self.x.hypot(self.y)
    }
}

impl Add for Point<f32> {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self::new(self.x + other.x, self.y + other.y)
    }
}

impl Sub for Point<f32> {
    type Output = Self;

    fn sub(self, other: Self) -> Self {
        Self::new(self.x - other.x, self.y - other.y)
    }
}

impl Mul<f32> for Point<f32> {
    type Output = Self;

    fn mul(self, scale: f32) -> Self {
        Self::new(self.x * scale, self.y * scale)
    }
}

/// A pixel offset used when searching around a registered position.
pub type Offset = Point<i32>;

/// Four corners of a quadrilateral in the order top-left, top-right,
/// bottom-left, bottom-right.
pub type Corners = [Point<f32>; 4];

/// An axis-aligned pixel rectangle. `right()` and `bottom()` are inclusive,
/// matching `imageproc::rect::Rect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub const fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Builds the smallest rectangle containing both inclusive corners.
    pub fn from_points(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self::new(
            left.min(right),
            top.min(bottom),
            (right - left).unsigned_abs() + 1,
            (bottom - top).unsigned_abs() + 1,
        )
    }

    pub const fn left(&self) -> i32 {
        self.x
    }

    pub const fn top(&self) -> i32 {
        self.y
    }

    pub const fn right(&self) -> i32 {
        self.x + self.width as i32 - 1
    }

    pub const fn bottom(&self) -> i32 {
        self.y + self.height as i32 - 1
    }

    pub const fn area(&self) -> u32 {
        self.width * self.height
    }

    pub fn center(&self) -> Point<f32> {
        center_of_rect(self)
    }

    pub const fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.left() && x <= self.right() && y >= self.top() && y <= self.bottom()
    }

    pub fn contains_point(&self, point: &Point<f32>) -> bool {
        point.x >= self.left() as f32
            && point.x <= self.right() as f32
            && point.y >= self.top() as f32
            && point.y <= self.bottom() as f32
    }

    pub fn contains_rect(&self, other: &Rect) -> bool {
        other.left() >= self.left()
            && other.right() <= self.right()
            && other.top() >= self.top()
            && other.bottom() <= self.bottom()
    }

    pub const fn offset(&self, dx: i32, dy: i32) -> Rect {
        Rect::new(self.x + dx, self.y + dy, self.width, self.height)
    }

    /// Shrinks the rectangle by `dx` on the left and right and `dy` on the
    /// top and bottom, saturating at an empty-ish 1x1 rectangle.
    pub fn inset(&self, dx: u32, dy: u32) -> Rect {
        let width = self.width.saturating_sub(2 * dx).max(1);
        let height = self.height.saturating_sub(2 * dy).max(1);
        Rect::new(self.x + dx as i32, self.y + dy as i32, width, height)
    }

    /// The four outer pixel corners of this rectangle.
    pub fn corners(&self) -> Corners {
        [
            Point::new(self.left() as f32, self.top() as f32),
            Point::new(self.right() as f32, self.top() as f32),
            Point::new(self.left() as f32, self.bottom() as f32),
            Point::new(self.right() as f32, self.bottom() as f32),
        ]
    }
}

impl From<Rect> for imageproc::rect::Rect {
    fn from(rect: Rect) -> Self {
        imageproc::rect::Rect::at(rect.x, rect.y).of_size(rect.width.max(1), rect.height.max(1))
    }
}

pub type Segment<T> = (Point<T>, Point<T>);

/// Intersection of the lines through two segments. With `bounded`, the
/// intersection must lie within both segments.
pub fn intersection_of_lines(
    segment1: &Segment<f32>,
    segment2: &Segment<f32>,
    bounded: bool,
) -> Option<Point<f32>> {
    let (p1, p2) = segment1;
    let (p3, p4) = segment2;
    let d = (p4.y - p3.y) * (p2.x - p1.x) - (p4.x - p3.x) * (p2.y - p1.y);
    if d == 0.0 {
        return None;
    }
    let u_a = ((p4.x - p3.x) * (p1.y - p3.y) - (p4.y - p3.y) * (p1.x - p3.x)) / d;
    let u_b = ((p2.x - p1.x) * (p1.y - p3.y) - (p2.y - p1.y) * (p1.x - p3.x)) / d;
    if !bounded || ((0.0..=1.0).contains(&u_a) && (0.0..=1.0).contains(&u_b)) {
        return Some(Point::new(
            p1.x + u_a * (p2.x - p1.x),
            p1.y + u_a * (p2.y - p1.y),
        ));
    }
    None
}

/// Normalizes a directed angle into `(-PI, PI]`.
pub fn normalize_signed_angle(angle: f32) -> f32 {
    let angle = angle.rem_euclid(2.0 * PI);
    if angle > PI {
        angle - 2.0 * PI
    } else {
        angle
    }
}

pub fn euclidean_distance(p1: &Point<f32>, p2: &Point<f32>) -> f32 {
    (*p1 - *p2).length()
}

pub fn center_of_rect(rect: &Rect) -> Point<f32> {
    Point::new(
        rect.left() as f32 + rect.width as f32 / 2.0,
        rect.top() as f32 + rect.height as f32 / 2.0,
    )
}

/// Area of a quadrilateral given as `Corners` (TL, TR, BL, BR).
pub fn poly4_area(corners: &Corners) -> f32 {
    let [top_left, top_right, bottom_left, bottom_right] = corners;
    let ring = [top_left, top_right, bottom_right, bottom_left];
    let twice_area: f32 = (0..4)
        .map(|i| {
            let a = ring[i];
            let b = ring[(i + 1) % 4];
            a.x * b.y - b.x * a.y
        })
        .sum();
    twice_area.abs() / 2.0
}
