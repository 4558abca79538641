use std::collections::{HashMap, HashSet};
use std::f32::consts::{FRAC_PI_2, FRAC_PI_4};

use image::GrayImage;
use log::debug;
use logging_timer::time;
use serde::Serialize;

use crate::binarize::binarize_gray;
use crate::geometry::{
    euclidean_distance, intersection_of_lines, normalize_signed_angle, poly4_area, Corners,
    Point, Rect,
};
use crate::image_utils::size_image_to_fit;
use crate::segments::LineSegmentDetector;

/// Segments whose deviation from the page axes differ by no more than this
/// are considered to share a rotation.
const SAME_ROTATION_THRESHOLD: f32 = 1.0 * std::f32::consts::PI / 180.0;

/// Tolerance for segments to count as having the same angle, or for two
/// segments to meet at a right angle.
const ANGLE_TOLERANCE: f32 = 2.0 * std::f32::consts::PI / 180.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Direction {
    Right,
    Left,
    Up,
    Down,
}

impl Direction {
    pub const fn is_vertical(self) -> bool {
        matches!(self, Direction::Up | Direction::Down)
    }

    pub const fn inverse(self) -> Self {
        match self {
            Direction::Right => Direction::Left,
            Direction::Left => Direction::Right,
            Direction::Up => Direction::Down,
            Direction::Down => Direction::Up,
        }
    }
}

/// A directed line segment. Boxes are built from segments that travel
/// clockwise around them: tops go right, right sides go down, bottoms go left
/// and left sides go up.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GridSegment {
    pub start: Point<f32>,
    pub end: Point<f32>,
    pub direction: Direction,
    pub length: f32,
    /// Set when the segment was constructed rather than detected.
    pub inferred: bool,
}

impl GridSegment {
    pub fn new(start: Point<f32>, end: Point<f32>) -> Self {
        Self::with_inferred(start, end, false)
    }

    pub fn inferred(start: Point<f32>, end: Point<f32>) -> Self {
        Self::with_inferred(start, end, true)
    }

    fn with_inferred(start: Point<f32>, end: Point<f32>, inferred: bool) -> Self {
        let dx = end.x - start.x;
        let dy = end.y - start.y;
        let direction = if dx.abs() > dy.abs() {
            if dx > 0.0 {
                Direction::Right
            } else {
                Direction::Left
            }
        } else if dy > 0.0 {
            Direction::Down
        } else {
            Direction::Up
        };

        Self {
            start,
            end,
            direction,
            length: euclidean_distance(&start, &end),
            inferred,
        }
    }

    /// A segment with new endpoints that keeps this one's provenance.
    fn derive(&self, start: Point<f32>, end: Point<f32>) -> Self {
        Self::with_inferred(start, end, self.inferred)
    }

    fn join(a: &Self, b: &Self, start: Point<f32>, end: Point<f32>) -> Self {
        Self::with_inferred(start, end, a.inferred || b.inferred)
    }

    pub fn angle(&self) -> f32 {
        (self.end.y - self.start.y).atan2(self.end.x - self.start.x)
    }

    pub fn vector(&self) -> Point<f32> {
        self.end - self.start
    }

    pub const fn inverse(&self) -> Self {
        Self {
            start: self.end,
            end: self.start,
            direction: self.direction.inverse(),
            length: self.length,
            inferred: self.inferred,
        }
    }

    pub fn scale(&self, x_scale: f32, y_scale: f32) -> Self {
        self.derive(
            Point::new(self.start.x * x_scale, self.start.y * y_scale),
            Point::new(self.end.x * x_scale, self.end.y * y_scale),
        )
    }

    /// Same geometry, ignoring provenance.
    pub fn equivalent(&self, other: &Self) -> bool {
        self.start == other.start
            && self.end == other.end
            && self.direction == other.direction
            && self.length == other.length
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PartialGridBox {
    pub top: Option<GridSegment>,
    pub right: Option<GridSegment>,
    pub bottom: Option<GridSegment>,
    pub left: Option<GridSegment>,
}

impl PartialGridBox {
    pub fn side_count(&self) -> usize {
        [self.top, self.right, self.bottom, self.left]
            .iter()
            .filter(|side| side.is_some())
            .count()
    }

    pub fn complete(&self) -> Option<GridBox> {
        Some(GridBox {
            top: self.top?,
            right: self.right?,
            bottom: self.bottom?,
            left: self.left?,
        })
    }

    pub fn scale(&self, x_scale: f32, y_scale: f32) -> Self {
        let scale = |side: Option<GridSegment>| side.map(|s| s.scale(x_scale, y_scale));
        Self {
            top: scale(self.top),
            right: scale(self.right),
            bottom: scale(self.bottom),
            left: scale(self.left),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GridBox {
    pub top: GridSegment,
    pub right: GridSegment,
    pub bottom: GridSegment,
    pub left: GridSegment,
}

impl GridBox {
    pub fn corners(&self) -> Corners {
        box_corners(self)
    }
}

impl From<GridBox> for PartialGridBox {
    fn from(b: GridBox) -> Self {
        Self {
            top: Some(b.top),
            right: Some(b.right),
            bottom: Some(b.bottom),
            left: Some(b.left),
        }
    }
}

/// Boxes grouped into columns, left to right, each column top to bottom.
#[derive(Debug, Clone, PartialEq)]
pub struct Layout {
    pub width: u32,
    pub height: u32,
    pub columns: Vec<Vec<GridBox>>,
}

impl Layout {
    pub fn box_count(&self) -> usize {
        self.columns.iter().map(Vec::len).sum()
    }

    pub fn boxes(&self) -> impl Iterator<Item = &GridBox> {
        self.columns.iter().flatten()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Rotation {
    pub angle: f32,
    pub matched_segments: Vec<GridSegment>,
}

/// Estimates the page rotation as the mean deviation from the nearest page
/// axis of the largest cluster of similarly-deviating segments.
pub fn find_rotation(segments: &[GridSegment]) -> Option<Rotation> {
    let mut annotated = segments
        .iter()
        .map(|segment| {
            let deviation = (segment.angle() + FRAC_PI_4).rem_euclid(FRAC_PI_2) - FRAC_PI_4;
            (deviation, *segment)
        })
        .collect::<Vec<_>>();
    annotated.sort_by(|a, b| a.0.total_cmp(&b.0));

    let mut groups: Vec<Vec<(f32, GridSegment)>> = vec![];
    for (deviation, segment) in annotated {
        match groups.last_mut() {
            Some(group)
                if group
                    .last()
                    .map_or(false, |(last, _)| deviation - last <= SAME_ROTATION_THRESHOLD) =>
            {
                group.push((deviation, segment));
            }
            _ => groups.push(vec![(deviation, segment)]),
        }
    }

    let largest = groups.iter().fold(None::<&Vec<(f32, GridSegment)>>, |largest, group| {
        match largest {
            Some(largest) if largest.len() >= group.len() => Some(largest),
            _ => Some(group),
        }
    })?;

    let angle = largest.iter().map(|(deviation, _)| deviation).sum::<f32>() / largest.len() as f32;
    Some(Rotation {
        angle,
        matched_segments: largest.iter().map(|(_, segment)| *segment).collect(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Intersection {
    Point(Point<f32>),
    Colinear,
    Parallel,
}

/// Intersection of the infinite lines through two segments, using 2D cross
/// products. Cross products within `parallel_threshold` of zero count as
/// parallel (or colinear, if the lines also coincide).
pub fn project_line_intersection(
    segment1: &GridSegment,
    segment2: &GridSegment,
    parallel_threshold: f32,
) -> Intersection {
    fn cross(v: Point<f32>, w: Point<f32>) -> f32 {
        v.x * w.y - v.y * w.x
    }

    let p = segment1.start;
    let r = segment1.vector();
    let q = segment2.start;
    let s = segment2.vector();
    let r_cross_s = cross(r, s);
    let q_minus_p = q - p;

    if r_cross_s.abs() <= parallel_threshold {
        if cross(q_minus_p, r).abs() <= parallel_threshold {
            return Intersection::Colinear;
        }
        return Intersection::Parallel;
    }

    let t = cross(q_minus_p, s) / r_cross_s;
    Intersection::Point(p + r * t)
}

fn is_same_angle(a: f32, b: f32) -> bool {
    normalize_signed_angle(b - a).abs() <= ANGLE_TOLERANCE
}

/// Whether `to` continues from `from` by turning 90° clockwise on the page.
fn turns_right(from: &GridSegment, to: &GridSegment) -> bool {
    normalize_signed_angle(to.angle() - from.angle() - FRAC_PI_2).abs() <= ANGLE_TOLERANCE
}

/// Repeatedly joins pairs of colinear, same-direction segments whose ends are
/// within `max_connected_segment_gap` of each other.
pub fn merge_adjacent_line_segments(
    segments: &[GridSegment],
    parallel_threshold: f32,
    max_connected_segment_gap: f32,
) -> Vec<GridSegment> {
    let mut result = segments.to_vec();

    loop {
        let mut merge = None;

        'search: for i in 0..result.len() {
            for j in 0..result.len() {
                if i == j {
                    continue;
                }

                let a = &result[i];
                let b = &result[j];
                if !is_same_angle(a.angle(), b.angle())
                    || project_line_intersection(a, b, parallel_threshold)
                        != Intersection::Colinear
                {
                    continue;
                }

                let mut merged = None;
                if euclidean_distance(&a.start, &b.end) <= max_connected_segment_gap {
                    // `b` ends where `a` starts
                    merged = Some(GridSegment::join(a, b, b.start, a.end));
                }
                if euclidean_distance(&b.start, &a.end) <= max_connected_segment_gap {
                    // `a` ends where `b` starts
                    merged = Some(GridSegment::join(a, b, a.start, b.end));
                }

                if let Some(merged) = merged {
                    merge = Some((i, j, merged));
                    break 'search;
                }
            }
        }

        let Some((i, j, merged)) = merge else {
            break;
        };
        result.remove(i.max(j));
        result.remove(i.min(j));
        result.push(merged);
    }

    result
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoxFindingOptions {
    pub max_connected_corner_distance: f32,
    pub parallel_threshold: f32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FoundBoxes {
    pub clockwise: Vec<PartialGridBox>,
    pub counter_clockwise: Vec<PartialGridBox>,
    pub unused_segments: Vec<GridSegment>,
}

/// Joins segments at their corners into (possibly partial) boxes. Segments
/// are tried as given (clockwise) and reversed (counter-clockwise), since
/// the outside of a printed box traces the opposite way from its inside.
#[time]
pub fn find_boxes(segments: &[GridSegment], options: &BoxFindingOptions) -> FoundBoxes {
    let Some(rotation) = find_rotation(segments) else {
        return FoundBoxes {
            unused_segments: segments.to_vec(),
            ..FoundBoxes::default()
        };
    };
    debug!(
        "rotation: {:.3}° from {} of {} segment(s)",
        rotation.angle.to_degrees(),
        rotation.matched_segments.len(),
        segments.len()
    );

    let by_direction = |direction: Direction| -> Vec<GridSegment> {
        rotation
            .matched_segments
            .iter()
            .filter(|segment| segment.direction == direction)
            .copied()
            .collect()
    };
    let invert = |segments: &[GridSegment]| -> Vec<GridSegment> {
        segments.iter().map(GridSegment::inverse).collect()
    };

    let up = by_direction(Direction::Up);
    let down = by_direction(Direction::Down);
    let left = by_direction(Direction::Left);
    let right = by_direction(Direction::Right);

    let (clockwise, clockwise_unused) = find_boxes_from_segments(
        &DirectedSegments {
            up: &up,
            down: &down,
            left: &left,
            right: &right,
        },
        options,
    );
    let (counter_clockwise, counter_clockwise_unused) = find_boxes_from_segments(
        &DirectedSegments {
            up: &invert(&down),
            down: &invert(&up),
            left: &invert(&right),
            right: &invert(&left),
        },
        options,
    );

    let counter_clockwise_unused = invert(&counter_clockwise_unused);
    let unused_segments = clockwise_unused
        .into_iter()
        .filter(|cw| counter_clockwise_unused.iter().any(|ccw| cw.equivalent(ccw)))
        .collect();

    FoundBoxes {
        clockwise,
        counter_clockwise,
        unused_segments,
    }
}

struct DirectedSegments<'a> {
    up: &'a [GridSegment],
    down: &'a [GridSegment],
    left: &'a [GridSegment],
    right: &'a [GridSegment],
}

fn find_boxes_from_segments(
    segments: &DirectedSegments,
    options: &BoxFindingOptions,
) -> (Vec<PartialGridBox>, Vec<GridSegment>) {
    let max_distance = options.max_connected_corner_distance;
    let mut builder = BoxesBuilder::new(options.parallel_threshold);
    let up = builder.add_segments(segments.up);
    let down = builder.add_segments(segments.down);
    let left = builder.add_segments(segments.left);
    let right = builder.add_segments(segments.right);
    let mut unused = up
        .iter()
        .chain(&down)
        .chain(&left)
        .chain(&right)
        .copied()
        .collect::<HashSet<_>>();

    let mut try_corner = |builder: &mut BoxesBuilder, sides: BoxSides| {
        if builder.add_corner(sides) {
            for id in sides.ids() {
                unused.remove(&id);
            }
        }
    };

    // top-left: left side (up) turns into the top (right)
    for &r in &right {
        for &u in &up {
            let (top, left_side) = (builder.segment(r), builder.segment(u));
            if euclidean_distance(&top.start, &left_side.end) <= max_distance
                && turns_right(&left_side, &top)
            {
                let sides = BoxSides {
                    left: Some(u),
                    top: Some(r),
                    ..BoxSides::default()
                };
                try_corner(&mut builder, sides);
            }
        }
    }

    // top-right: top (right) turns into the right side (down)
    for &r in &right {
        for &d in &down {
            let (top, right_side) = (builder.segment(r), builder.segment(d));
            if euclidean_distance(&top.end, &right_side.start) <= max_distance
                && turns_right(&top, &right_side)
            {
                let sides = BoxSides {
                    top: Some(r),
                    right: Some(d),
                    ..BoxSides::default()
                };
                try_corner(&mut builder, sides);
            }
        }
    }

    // bottom-right: right side (down) turns into the bottom (left)
    for &l in &left {
        for &d in &down {
            let (bottom, right_side) = (builder.segment(l), builder.segment(d));
            if euclidean_distance(&bottom.start, &right_side.end) <= max_distance
                && turns_right(&right_side, &bottom)
            {
                let sides = BoxSides {
                    right: Some(d),
                    bottom: Some(l),
                    ..BoxSides::default()
                };
                try_corner(&mut builder, sides);
            }
        }
    }

    // bottom-left: bottom (left) turns into the left side (up)
    for &l in &left {
        for &u in &up {
            let (bottom, left_side) = (builder.segment(l), builder.segment(u));
            if euclidean_distance(&bottom.end, &left_side.start) <= max_distance
                && turns_right(&bottom, &left_side)
            {
                let sides = BoxSides {
                    bottom: Some(l),
                    left: Some(u),
                    ..BoxSides::default()
                };
                try_corner(&mut builder, sides);
            }
        }
    }

    let mut unused = unused.into_iter().collect::<Vec<_>>();
    unused.sort_unstable();
    let unused = unused.into_iter().map(|id| builder.segment(id)).collect();
    (builder.build(), unused)
}

type SegmentId = usize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct BoxSides {
    top: Option<SegmentId>,
    right: Option<SegmentId>,
    bottom: Option<SegmentId>,
    left: Option<SegmentId>,
}

impl BoxSides {
    fn ids(&self) -> impl Iterator<Item = SegmentId> {
        [self.top, self.right, self.bottom, self.left].into_iter().flatten()
    }
}

#[derive(Debug, Clone, Copy)]
enum Side {
    Top,
    Right,
    Bottom,
    Left,
}

/// Builds boxes by joining segments at corners. Segments live in an arena so
/// boxes can refer to them by identity; merging two sides adds a new segment.
struct BoxesBuilder {
    segments: Vec<GridSegment>,
    boxes: Vec<Option<BoxSides>>,
    segment_boxes: HashMap<SegmentId, usize>,
    parallel_threshold: f32,
}

impl BoxesBuilder {
    fn new(parallel_threshold: f32) -> Self {
        Self {
            segments: vec![],
            boxes: vec![],
            segment_boxes: HashMap::new(),
            parallel_threshold,
        }
    }

    fn add_segments(&mut self, segments: &[GridSegment]) -> Vec<SegmentId> {
        segments
            .iter()
            .map(|segment| {
                self.segments.push(*segment);
                self.segments.len() - 1
            })
            .collect()
    }

    fn segment(&self, id: SegmentId) -> GridSegment {
        self.segments[id]
    }

    /// Adds a corner joining two segments. Boxes already holding either
    /// segment are merged with it; returns false if they conflict.
    fn add_corner(&mut self, corner: BoxSides) -> bool {
        let mut box_ids = corner
            .ids()
            .filter_map(|id| self.segment_boxes.get(&id).copied())
            .collect::<Vec<_>>();
        box_ids.sort_unstable();
        box_ids.dedup();

        let mut merged = corner;
        for &box_id in &box_ids {
            let Some(existing) = self.boxes[box_id] else {
                continue;
            };
            match self.merge_boxes(&merged, &existing) {
                Some(next) => merged = next,
                None => {
                    debug!("add_corner: merge failed for {corner:?}");
                    return false;
                }
            }
        }

        for box_id in box_ids {
            if let Some(existing) = self.boxes[box_id].take() {
                for id in existing.ids() {
                    self.segment_boxes.remove(&id);
                }
            }
        }

        let box_id = self.boxes.len();
        self.boxes.push(Some(merged));
        for id in merged.ids() {
            self.segment_boxes.insert(id, box_id);
        }
        true
    }

    fn merge_boxes(&mut self, a: &BoxSides, b: &BoxSides) -> Option<BoxSides> {
        Some(BoxSides {
            top: self.merge_side(a.top, b.top, Side::Top)?,
            right: self.merge_side(a.right, b.right, Side::Right)?,
            bottom: self.merge_side(a.bottom, b.bottom, Side::Bottom)?,
            left: self.merge_side(a.left, b.left, Side::Left)?,
        })
    }

    /// Combines two candidates for the same side of a box. Distinct segments
    /// must be colinear and are joined into one spanning both.
    fn merge_side(
        &mut self,
        a: Option<SegmentId>,
        b: Option<SegmentId>,
        side: Side,
    ) -> Option<Option<SegmentId>> {
        let (a, b) = match (a, b) {
            (Some(a), Some(b)) if a != b => (a, b),
            (a, b) => return Some(a.or(b)),
        };

        let (sa, sb) = (self.segments[a], self.segments[b]);
        let intersection = project_line_intersection(&sa, &sb, self.parallel_threshold);
        if intersection != Intersection::Colinear {
            debug!("cannot merge {side:?} sides, not colinear: {intersection:?}");
            return None;
        }

        let a_first = match side {
            Side::Top => sa.start.x < sb.start.x,
            Side::Right => sa.start.y < sb.start.y,
            Side::Bottom => sa.start.x > sb.start.x,
            Side::Left => sa.start.y > sb.start.y,
        };
        let joined = if a_first {
            GridSegment::join(&sa, &sb, sa.start, sb.end)
        } else {
            GridSegment::join(&sa, &sb, sb.start, sa.end)
        };
        self.segments.push(joined);
        Some(Some(self.segments.len() - 1))
    }

    fn build(&self) -> Vec<PartialGridBox> {
        let resolve = |id: Option<SegmentId>| id.map(|id| self.segments[id]);
        self.boxes
            .iter()
            .flatten()
            .map(|sides| PartialGridBox {
                top: resolve(sides.top),
                right: resolve(sides.right),
                bottom: resolve(sides.bottom),
                left: resolve(sides.left),
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Adjust {
    Forward,
    Backward,
}

/// Stretches `segment` to `length` along its own angle, moving its end
/// (forward) or its start (backward).
fn adjust_segment_length(segment: &GridSegment, length: f32, adjust: Adjust) -> GridSegment {
    let angle = segment.angle();
    let delta = Point::new(length * angle.cos(), length * angle.sin());
    match adjust {
        Adjust::Forward => segment.derive(segment.start, segment.start + delta),
        Adjust::Backward => segment.derive(segment.end - delta, segment.end),
    }
}

/// Completes a box from three sides, or from two perpendicular adjacent
/// sides. Anything else cannot be inferred.
pub fn infer_box_from_partial(partial: &PartialGridBox) -> Option<GridBox> {
    use Adjust::{Backward, Forward};

    match (partial.top, partial.right, partial.bottom, partial.left) {
        (Some(top), Some(right), Some(bottom), Some(left)) => Some(GridBox {
            top,
            right,
            bottom,
            left,
        }),

        // missing left
        (Some(mut top), Some(right), Some(mut bottom), None) => {
            if top.length > bottom.length {
                bottom = adjust_segment_length(&bottom, top.length, Forward);
            } else if top.length < bottom.length {
                top = adjust_segment_length(&top, bottom.length, Backward);
            }
            Some(GridBox {
                top,
                right,
                bottom,
                left: GridSegment::inferred(bottom.end, top.start),
            })
        }

        // missing bottom
        (Some(top), Some(mut right), None, Some(mut left)) => {
            if left.length > right.length {
                right = adjust_segment_length(&right, left.length, Forward);
            } else if left.length < right.length {
                left = adjust_segment_length(&left, right.length, Backward);
            }
            Some(GridBox {
                top,
                right,
                bottom: GridSegment::inferred(right.end, left.start),
                left,
            })
        }

        // missing right
        (Some(mut top), None, Some(mut bottom), Some(left)) => {
            if top.length > bottom.length {
                bottom = adjust_segment_length(&bottom, top.length, Backward);
            } else if top.length < bottom.length {
                top = adjust_segment_length(&top, bottom.length, Forward);
            }
            Some(GridBox {
                top,
                right: GridSegment::inferred(top.end, bottom.start),
                bottom,
                left,
            })
        }

        // missing top
        (None, Some(mut right), Some(bottom), Some(mut left)) => {
            if left.length > right.length {
                right = adjust_segment_length(&right, left.length, Backward);
            } else if left.length < right.length {
                left = adjust_segment_length(&left, right.length, Forward);
            }
            Some(GridBox {
                top: GridSegment::inferred(left.end, right.start),
                right,
                bottom,
                left,
            })
        }

        (Some(top), Some(right), None, None) => {
            let v_top = top.vector();
            let v_right = right.vector();
            Some(GridBox {
                top,
                right,
                bottom: GridSegment::inferred(right.end, right.end - v_top),
                left: GridSegment::inferred(top.start + v_right, top.start),
            })
        }

        (None, Some(right), Some(bottom), None) => {
            let v_right = right.vector();
            let v_bottom = bottom.vector();
            Some(GridBox {
                top: GridSegment::inferred(right.start + v_bottom, right.start),
                right,
                bottom,
                left: GridSegment::inferred(bottom.end, bottom.end - v_right),
            })
        }

        (None, None, Some(bottom), Some(left)) => {
            let v_bottom = bottom.vector();
            let v_left = left.vector();
            Some(GridBox {
                top: GridSegment::inferred(left.end, left.end - v_bottom),
                right: GridSegment::inferred(bottom.start + v_left, bottom.start),
                bottom,
                left,
            })
        }

        (Some(top), None, None, Some(left)) => {
            let v_left = left.vector();
            let v_top = top.vector();
            Some(GridBox {
                top,
                right: GridSegment::inferred(top.end, top.end - v_left),
                bottom: GridSegment::inferred(left.start + v_top, left.start),
                left,
            })
        }

        _ => None,
    }
}

/// Extends or trims each side so adjacent sides meet exactly at the
/// intersection of their lines.
pub fn close_box_segment_gaps(grid_box: &GridBox) -> GridBox {
    let GridBox {
        mut top,
        mut right,
        mut bottom,
        mut left,
    } = *grid_box;
    let line = |segment: &GridSegment| (segment.start, segment.end);

    if let Some(top_left) = intersection_of_lines(&line(&left), &line(&top), false) {
        left = left.derive(left.start, top_left);
        top = top.derive(top_left, top.end);
    }

    if let Some(top_right) = intersection_of_lines(&line(&top), &line(&right), false) {
        top = top.derive(top.start, top_right);
        right = right.derive(top_right, right.end);
    }

    if let Some(bottom_right) = intersection_of_lines(&line(&right), &line(&bottom), false) {
        right = right.derive(right.start, bottom_right);
        bottom = bottom.derive(bottom_right, bottom.end);
    }

    if let Some(bottom_left) = intersection_of_lines(&line(&bottom), &line(&left), false) {
        bottom = bottom.derive(bottom.start, bottom_left);
        left = left.derive(bottom_left, left.end);
    }

    GridBox {
        top,
        right,
        bottom,
        left,
    }
}

pub fn box_contains(container: &GridBox, contained: &GridBox) -> bool {
    container.top.start.x <= contained.top.start.x
        && container.top.start.y <= contained.top.start.y
        && container.top.end.x >= contained.top.end.x
        && container.top.end.y <= contained.top.end.y
        && container.right.start.x >= contained.right.start.x
        && container.right.start.y <= contained.right.start.y
        && container.right.end.x >= contained.right.end.x
        && container.right.end.y >= contained.right.end.y
        && container.bottom.start.x >= contained.bottom.start.x
        && container.bottom.start.y >= contained.bottom.start.y
        && container.bottom.end.x <= contained.bottom.end.x
        && container.bottom.end.y >= contained.bottom.end.y
        && container.left.start.x <= contained.left.start.x
        && container.left.start.y >= contained.left.start.y
        && container.left.end.x <= contained.left.end.x
        && container.left.end.y <= contained.left.end.y
}

/// Drops boxes that lie inside another box.
pub fn filter_contained_boxes(boxes: &[GridBox]) -> Vec<GridBox> {
    boxes
        .iter()
        .enumerate()
        .filter(|(i, grid_box)| {
            !boxes
                .iter()
                .enumerate()
                .any(|(j, container)| *i != j && box_contains(container, grid_box))
        })
        .map(|(_, grid_box)| *grid_box)
        .collect()
}

/// Keeps boxes whose every side has at least one endpoint inside `bounds`.
pub fn filter_in_bounds(boxes: &[GridBox], bounds: &Rect) -> Vec<GridBox> {
    boxes
        .iter()
        .filter(|grid_box| {
            [grid_box.top, grid_box.right, grid_box.bottom, grid_box.left]
                .iter()
                .all(|side| bounds.contains_point(&side.start) || bounds.contains_point(&side.end))
        })
        .copied()
        .collect()
}

pub fn area(grid_box: &GridBox) -> f32 {
    let GridBox {
        top,
        right,
        bottom,
        left,
    } = grid_box;
    ((top.end.x - top.start.x + bottom.start.x - bottom.end.x) / 2.0)
        * (right.end.y - right.start.y + left.start.y - left.end.y)
        / 2.0
}

/// Corners of a box as TL, TR, BL, BR.
pub fn box_corners(grid_box: &GridBox) -> Corners {
    [
        grid_box.top.start,
        grid_box.top.end,
        grid_box.bottom.end,
        grid_box.bottom.start,
    ]
}

fn mid_x(segment: &GridSegment) -> f32 {
    (segment.start.x + segment.end.x) / 2.0
}

/// Groups boxes into columns by horizontal overlap of their tops, ordering
/// columns left to right and boxes within a column top to bottom.
pub fn split_into_columns(boxes: &[GridBox]) -> Vec<Vec<GridBox>> {
    let mut columns: Vec<Vec<GridBox>> = vec![];

    for grid_box in boxes {
        let box_mid_x = mid_x(&grid_box.top);
        let mut placed = false;

        for c in 0..columns.len() {
            let first = columns[c][0];
            let column_mid_x = mid_x(&first.top);

            if (grid_box.top.start.x < column_mid_x && grid_box.top.end.x > column_mid_x)
                || (first.top.start.x < box_mid_x && first.top.end.x > box_mid_x)
            {
                let column = &mut columns[c];
                let box_y = grid_box.left.end.y + grid_box.left.start.y;
                let index = column
                    .iter()
                    .position(|existing| existing.left.end.y + existing.left.start.y > box_y)
                    .unwrap_or(column.len());
                column.insert(index, *grid_box);
                placed = true;
                break;
            } else if grid_box.top.end.x < column_mid_x {
                columns.insert(c, vec![*grid_box]);
                placed = true;
                break;
            }
        }

        if !placed {
            columns.push(vec![*grid_box]);
        }
    }

    debug!(
        "split {} box(es) into columns: {:?}",
        boxes.len(),
        columns.iter().map(Vec::len).collect::<Vec<_>>()
    );
    columns
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MatchMerge {
    Merged(GridBox),
    Underfilled(GridBox),
    Overfilled(GridBox),
}

/// Combines consecutive scan boxes into one and compares its share of the
/// scan page with the template box's share of the template page.
pub fn match_merge(
    template: &Layout,
    template_box: &GridBox,
    scan: &Layout,
    scan_boxes: &[GridBox],
    allowed_area_ratio_error: f32,
) -> Option<MatchMerge> {
    let scan_top = scan_boxes.first()?;
    let scan_bottom = scan_boxes.last()?;

    let template_area = template.width as f32 * template.height as f32;
    let scan_area = scan.width as f32 * scan.height as f32;
    let expected_ratio = scan_area / template_area;
    let min_ratio = expected_ratio * (1.0 - allowed_area_ratio_error);
    let max_ratio = expected_ratio * (1.0 + allowed_area_ratio_error);

    let template_box_area = poly4_area(&box_corners(template_box));
    let [scan_top_left, scan_top_right, _, _] = box_corners(scan_top);
    let [_, _, scan_bottom_left, scan_bottom_right] = box_corners(scan_bottom);
    let scan_boxes_area = poly4_area(&[
        scan_top_left,
        scan_top_right,
        scan_bottom_left,
        scan_bottom_right,
    ]);

    let candidate = GridBox {
        top: scan_top.top,
        right: GridSegment::join(
            &scan_top.right,
            &scan_bottom.right,
            scan_top.right.start,
            scan_bottom.right.end,
        ),
        bottom: scan_bottom.bottom,
        left: GridSegment::join(
            &scan_top.left,
            &scan_bottom.left,
            scan_bottom.left.start,
            scan_top.left.end,
        ),
    };
    let ratio = scan_boxes_area / template_box_area;

    Some(if ratio < min_ratio {
        debug!("scan area too small compared to scaled template area: {ratio} < {min_ratio}");
        MatchMerge::Underfilled(candidate)
    } else if ratio > max_ratio {
        debug!("scan area too large compared to scaled template area: {ratio} > {max_ratio}");
        MatchMerge::Overfilled(candidate)
    } else {
        MatchMerge::Merged(candidate)
    })
}

/// Matches a scanned page's boxes to the template's, column by column,
/// merging runs of scan boxes that were split apart by detection. Returns
/// `None` if any template box has no acceptable match.
pub fn match_template_layout(
    template: &Layout,
    scan: &Layout,
    unused_segments: &[GridSegment],
    allowed_area_ratio_error: f32,
) -> Option<Layout> {
    if template.columns.len() != scan.columns.len() {
        debug!(
            "column count differs (template={} scan={}), cannot merge",
            template.columns.len(),
            scan.columns.len()
        );
        return None;
    }

    let mut merged_columns = vec![];

    for (column_index, (template_column, scan_column)) in
        template.columns.iter().zip(&scan.columns).enumerate()
    {
        if scan_column.len() < template_column.len() {
            debug!(
                "column {column_index}: not enough scan boxes ({} < {})",
                scan_column.len(),
                template_column.len()
            );
            return None;
        }

        let mut merged_column = vec![];
        let mut scan_index = 0;

        for (template_index, template_box) in template_column.iter().enumerate() {
            let mut merged: Option<(GridBox, usize)> = None;
            let mut underfilled: Option<(GridBox, usize)> = None;

            for scan_end in scan_index + 1..=scan_column.len() {
                match match_merge(
                    template,
                    template_box,
                    scan,
                    &scan_column[scan_index..scan_end],
                    allowed_area_ratio_error,
                ) {
                    Some(MatchMerge::Merged(candidate)) => merged = Some((candidate, scan_end)),
                    Some(MatchMerge::Underfilled(candidate)) => {
                        underfilled = Some((candidate, scan_end));
                    }
                    _ if merged.is_some() => break,
                    _ => {}
                }
            }

            if merged.is_none() {
                if let Some((candidate, scan_end)) = underfilled {
                    if !candidate.top.inferred && candidate.bottom.inferred {
                        merged = replace_inferred_bottom(
                            template,
                            template_box,
                            scan,
                            &candidate,
                            unused_segments,
                            allowed_area_ratio_error,
                        )
                        .map(|replaced| (replaced, scan_end));
                    }
                }
            }

            let Some((merged_box, scan_end)) = merged else {
                debug!("column {column_index}: no match for template box {template_index}");
                return None;
            };

            merged_column.push(merged_box);
            scan_index = scan_end;
        }

        merged_columns.push(merged_column);
    }

    Some(Layout {
        width: scan.width,
        height: scan.height,
        columns: merged_columns,
    })
}

/// Swaps an incorrectly inferred bottom edge for an unused horizontal
/// segment if that makes the box match.
fn replace_inferred_bottom(
    template: &Layout,
    template_box: &GridBox,
    scan: &Layout,
    underfilled: &GridBox,
    unused_segments: &[GridSegment],
    allowed_area_ratio_error: f32,
) -> Option<GridBox> {
    unused_segments
        .iter()
        .filter(|segment| {
            !segment.direction.is_vertical() && segment.length > 0.5 * underfilled.top.length
        })
        .find_map(|segment| {
            let bottom = if segment.direction == Direction::Left {
                *segment
            } else {
                segment.inverse()
            };
            let candidate = close_box_segment_gaps(&GridBox {
                bottom,
                ..*underfilled
            });
            match match_merge(
                template,
                template_box,
                scan,
                &[candidate],
                allowed_area_ratio_error,
            ) {
                Some(MatchMerge::Merged(merged)) => Some(merged),
                _ => None,
            }
        })
}

#[derive(Debug, Clone, PartialEq)]
pub struct LineLayoutOptions {
    /// Images wider than this are scaled down before detecting segments.
    pub detection_width: u32,
    /// Fractions of the detection image width.
    pub min_segment_length_fraction: f32,
    pub max_connected_corner_distance_fraction: f32,
    pub max_connected_segment_gap_fraction: f32,
    /// Cross-product tolerance as a multiple of the detection image width.
    pub parallel_threshold_factor: f32,
    /// Boxes must lie within the page inset by this fraction of its width.
    pub inset_fraction: f32,
    pub allowed_area_ratio_error: f32,
}

impl Default for LineLayoutOptions {
    fn default() -> Self {
        Self {
            detection_width: 1060,
            min_segment_length_fraction: 0.1,
            max_connected_corner_distance_fraction: 0.01,
            max_connected_segment_gap_fraction: 0.01,
            parallel_threshold_factor: 2.0,
            inset_fraction: 0.015,
            allowed_area_ratio_error: 0.02,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LineLayout {
    pub layout: Layout,
    pub unused_segments: Vec<GridSegment>,
}

/// Finds complete boxes from long straight segments and groups them into
/// columns, in the coordinates of `img`.
#[time]
pub fn find_line_layout(
    img: &GrayImage,
    detector: &dyn LineSegmentDetector,
    options: &LineLayoutOptions,
) -> LineLayout {
    let (scaled, _) = size_image_to_fit(img, options.detection_width);
    let scaled = binarize_gray(&scaled);
    let width = scaled.width() as f32;
    let x_scale = img.width() as f32 / scaled.width() as f32;
    let y_scale = img.height() as f32 / scaled.height() as f32;

    let min_length = width * options.min_segment_length_fraction;
    let segments = detector
        .detect(&scaled)
        .into_iter()
        .filter(|segment| segment.length >= min_length)
        .collect::<Vec<_>>();
    let parallel_threshold = width * options.parallel_threshold_factor;
    let segments = merge_adjacent_line_segments(
        &segments,
        parallel_threshold,
        width * options.max_connected_segment_gap_fraction,
    );
    let found = find_boxes(
        &segments,
        &BoxFindingOptions {
            max_connected_corner_distance: width * options.max_connected_corner_distance_fraction,
            parallel_threshold,
        },
    );
    debug!(
        "found {} clockwise and {} counter-clockwise partial box(es) from {} segment(s)",
        found.clockwise.len(),
        found.counter_clockwise.len(),
        segments.len()
    );

    let boxes = found
        .clockwise
        .iter()
        .chain(&found.counter_clockwise)
        .filter_map(|partial| infer_box_from_partial(&partial.scale(x_scale, y_scale)))
        .map(|grid_box| close_box_segment_gaps(&grid_box))
        .collect::<Vec<_>>();
    let boxes = filter_contained_boxes(&boxes);
    let inset = (img.width() as f32 * options.inset_fraction).round() as u32;
    let bounds = Rect::new(0, 0, img.width(), img.height()).inset(inset, inset);
    let boxes = filter_in_bounds(&boxes, &bounds);

    LineLayout {
        layout: Layout {
            width: img.width(),
            height: img.height(),
            columns: split_into_columns(&boxes),
        },
        unused_segments: found
            .unused_segments
            .iter()
            .map(|segment| segment.scale(x_scale, y_scale))
            .collect(),
    }
}
