use image::GrayImage;
use log::debug;
use logging_timer::time;
use serde::Serialize;

use crate::boxes::Layout;
use crate::geometry::{Corners, Rect};
use crate::image_utils::{BLACK, WHITE};
use crate::metadata::BallotPageMetadata;
use crate::shapes::{
    find_shape, get_corners, ColumnScanner, ScanDirection, Shape, VisitedMap,
    DEFAULT_MAX_SKEW_DEGREES,
};

/// Column layouts tried, in order, when the number of columns on a page is
/// not known up front.
pub const COLUMN_PATTERNS: [&[bool]; 2] = [&[true, true, true], &[true, true]];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetShape {
    pub bounds: Rect,
    pub inner: Rect,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContestOption {
    pub bounds: Rect,
    pub target: TargetShape,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContestLayout {
    pub bounds: Rect,
    pub corners: Corners,
    pub options: Vec<ContestOption>,
}

/// A contest box found on a page, before its targets are located.
#[derive(Debug, Clone, PartialEq)]
pub struct ContestShape {
    pub bounds: Rect,
    pub corners: Corners,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BallotImage {
    #[serde(skip)]
    pub image: GrayImage,
    pub metadata: BallotPageMetadata,
}

/// The unit stored as a template and produced for a scanned page.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BallotPageLayout {
    pub ballot_image: BallotImage,
    pub contests: Vec<ContestLayout>,
    #[serde(skip)]
    pub line_layout: Option<Layout>,
}

impl BallotPageLayout {
    pub fn metadata(&self) -> &BallotPageMetadata {
        &self.ballot_image.metadata
    }

    pub fn image(&self) -> &GrayImage {
        &self.ballot_image.image
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContestSearchOptions {
    /// Contest width range as a fraction of one column's share of the page.
    pub min_width_fraction: f32,
    pub max_width_fraction: f32,
    /// Minimum contest height as a fraction of the page height.
    pub min_height_fraction: f32,
    /// How far below the top of the page the first contest in a column may
    /// start, as a fraction of the page height.
    pub max_first_offset_fraction: f32,
    /// How far below the previous contest the next may start, as a fraction
    /// of the page width.
    pub max_gap_fraction: f32,
    /// Radians.
    pub max_skew: f32,
}

impl Default for ContestSearchOptions {
    fn default() -> Self {
        Self {
            min_width_fraction: 0.75,
            max_width_fraction: 1.05,
            min_height_fraction: 0.05,
            max_first_offset_fraction: 0.5,
            max_gap_fraction: 0.025,
            max_skew: DEFAULT_MAX_SKEW_DEGREES.to_radians(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TargetSearchOptions {
    pub aspect_ratio: f32,
    pub aspect_ratio_tolerance: f32,
    /// Target width range as a fraction of the contest width.
    pub min_width_fraction: f32,
    pub max_width_fraction: f32,
}

impl Default for TargetSearchOptions {
    fn default() -> Self {
        Self {
            aspect_ratio: 1.5,
            aspect_ratio_tolerance: 0.25,
            min_width_fraction: 0.04,
            max_width_fraction: 0.15,
        }
    }
}

/// Finds contest boxes by scanning the columns in `column_mask` from the top
/// of the page down.
#[time]
pub fn find_contests(
    img: &GrayImage,
    column_mask: &[bool],
    options: &ContestSearchOptions,
) -> Vec<ContestShape> {
    let (width, height) = img.dimensions();
    let bounds = Rect::new(0, 0, width, height);
    let column_width = width as f32 / column_mask.len().max(1) as f32;
    let min_width = column_width * options.min_width_fraction;
    let max_width = column_width * options.max_width_fraction;
    let min_height = height as f32 * options.min_height_fraction;
    let max_first_offset = height as f32 * options.max_first_offset_fraction;
    let max_gap = width as f32 * options.max_gap_fraction;

    let mut visited = VisitedMap::for_image(img);
    let mut previous_bottoms: Vec<Option<i32>> = vec![None; column_mask.len()];
    let mut contests = vec![];
    let mut scanner = ColumnScanner::new(bounds, column_mask, ScanDirection::TopToBottom);

    while let Some((column, seed)) = scanner.next() {
        let Some(shape) = find_shape(img, seed, BLACK, &bounds, &mut visited) else {
            continue;
        };
        scanner.skip_to(shape.bounds.bottom() + 1);

        let shape_width = shape.bounds.width as f32;
        let shape_height = shape.bounds.height as f32;
        if shape_width < min_width || shape_width > max_width || shape_height < min_height {
            debug!(
                "column {column}: skipping {:?}, not contest-sized ({min_width:.0}..{max_width:.0} x {min_height:.0}+)",
                shape.bounds
            );
            continue;
        }

        let gap = match previous_bottoms[column] {
            Some(previous_bottom) => (shape.bounds.top() - previous_bottom) as f32,
            None => (shape.bounds.top() - bounds.top()) as f32,
        };
        let max_allowed_gap = match previous_bottoms[column] {
            Some(_) => max_gap,
            None => max_first_offset,
        };
        if gap > max_allowed_gap {
            debug!(
                "column {column}: skipping {:?}, too far from previous contest ({gap} > {max_allowed_gap})",
                shape.bounds
            );
            continue;
        }

        previous_bottoms[column] = Some(shape.bounds.bottom());
        contests.push(ContestShape {
            bounds: shape.bounds,
            corners: get_corners(&shape, options.max_skew),
        });
    }

    contests
}

/// Tries each of `COLUMN_PATTERNS`, preferring one that yields
/// `expected_count` contests and otherwise the first that yields any.
pub fn find_contests_with_unknown_column_layout(
    img: &GrayImage,
    expected_count: Option<usize>,
    options: &ContestSearchOptions,
) -> Vec<ContestShape> {
    let mut fallback: Option<Vec<ContestShape>> = None;

    for column_mask in COLUMN_PATTERNS {
        let contests = find_contests(img, column_mask, options);
        debug!(
            "found {} contest(s) with {} column(s)",
            contests.len(),
            column_mask.len()
        );

        match expected_count {
            Some(expected) if contests.len() == expected => return contests,
            None if !contests.is_empty() => return contests,
            _ => {}
        }

        if fallback.is_none() && !contests.is_empty() {
            fallback = Some(contests);
        }
    }

    fallback.unwrap_or_default()
}

/// Finds vote targets inside a contest, bottom-to-top.
#[time]
pub fn find_targets(
    img: &GrayImage,
    contest_bounds: &Rect,
    options: &TargetSearchOptions,
) -> Vec<TargetShape> {
    let min_width = contest_bounds.width as f32 * options.min_width_fraction;
    let max_width = contest_bounds.width as f32 * options.max_width_fraction;
    let column_count = (contest_bounds.width as f32 / (min_width / 2.0).max(1.0)).ceil() as usize;
    let column_mask = vec![true; column_count.max(1)];

    let mut visited = VisitedMap::for_image(img);
    let mut targets = vec![];
    let mut scanner = ColumnScanner::new(*contest_bounds, &column_mask, ScanDirection::BottomToTop);

    while let Some((_, seed)) = scanner.next() {
        let Some(shape) = find_shape(img, seed, BLACK, contest_bounds, &mut visited) else {
            continue;
        };

        let width = shape.bounds.width as f32;
        let aspect_ratio = width / shape.bounds.height as f32;
        if width < min_width
            || width > max_width
            || (aspect_ratio - options.aspect_ratio).abs() > options.aspect_ratio_tolerance
        {
            continue;
        }

        let Some(inner) = find_target_interior(img, &shape) else {
            debug!("target candidate {:?} has no enclosed interior", shape.bounds);
            continue;
        };

        scanner.skip_to(shape.bounds.top() - 1);
        targets.push(TargetShape {
            bounds: shape.bounds,
            inner,
        });
    }

    targets.sort_by(|a, b| {
        b.bounds
            .bottom()
            .cmp(&a.bounds.bottom())
            .then(a.bounds.left().cmp(&b.bounds.left()))
    });
    targets
}

/// Flood fills the white interior of an outline from its center. The
/// interior must not touch the outline's bounding box.
fn find_target_interior(img: &GrayImage, outline: &Shape) -> Option<Rect> {
    let center = outline.bounds.center();
    let seed = crate::geometry::Point::new(center.x as i32, center.y as i32);
    let mut visited = VisitedMap::for_image(img);
    let interior = find_shape(img, seed, WHITE, &outline.bounds, &mut visited)?;
    let inner = interior.bounds;
    let outer = outline.bounds;

    if inner.left() > outer.left()
        && inner.right() < outer.right()
        && inner.top() > outer.top()
        && inner.bottom() < outer.bottom()
    {
        Some(inner)
    } else {
        None
    }
}

/// Splits a contest into one option per target (top-to-bottom). Options are
/// separated at the midpoint between neighboring targets.
pub fn find_contest_options(contest_bounds: &Rect, targets: &[TargetShape]) -> Vec<ContestOption> {
    targets
        .iter()
        .enumerate()
        .map(|(i, target)| {
            let top = match i.checked_sub(1).and_then(|previous| targets.get(previous)) {
                Some(previous) => midpoint(previous.bounds.bottom(), target.bounds.top()) + 1,
                None => target.bounds.top() - target.bounds.height as i32 / 2,
            }
            .max(contest_bounds.top());

            let bottom = match targets.get(i + 1) {
                Some(next) => midpoint(target.bounds.bottom(), next.bounds.top()),
                None => contest_bounds.bottom(),
            };

            ContestOption {
                bounds: Rect::from_points(
                    contest_bounds.left(),
                    top,
                    contest_bounds.right(),
                    bottom.max(top),
                ),
                target: *target,
            }
        })
        .collect()
}

const fn midpoint(a: i32, b: i32) -> i32 {
    a + (b - a) / 2
}

/// Finds contests, their targets, and their options on a template page.
#[time]
pub fn find_contest_layouts(
    img: &GrayImage,
    contest_options: &ContestSearchOptions,
    target_options: &TargetSearchOptions,
) -> Vec<ContestLayout> {
    find_contests_with_unknown_column_layout(img, None, contest_options)
        .into_iter()
        .map(|contest| {
            let mut targets = find_targets(img, &contest.bounds, target_options);
            targets.reverse();
            ContestLayout {
                bounds: contest.bounds,
                corners: contest.corners,
                options: find_contest_options(&contest.bounds, &targets),
            }
        })
        .collect()
}
