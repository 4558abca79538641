//! Synthetic ballot pages for tests.

use image::GrayImage;
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut};

use crate::election::{
    BallotStyle, BallotStyleId, Candidate, CandidateId, Contest, ContestId, DistrictId, Election,
    Precinct, PrecinctId,
};
use crate::geometry::Rect;
use crate::image_utils::{flip_in_place, BLACK, WHITE};
use crate::metadata::{BallotLocales, BallotPageMetadata, BallotType, DetectQrCode, QrCodeDetection};

pub const PAGE_WIDTH: u32 = 850;
pub const PAGE_HEIGHT: u32 = 1100;

const COLUMN_LEFT: i32 = 40;
const COLUMN_STRIDE: i32 = 395;
const CONTEST_WIDTH: u32 = 375;
const CONTEST_TOP: i32 = 120;
const CONTEST_BORDER: u32 = 3;
const OPTION_HEIGHT: u32 = 50;
const TARGET_WIDTH: u32 = 40;
const TARGET_HEIGHT: u32 = 26;

/// Where the stand-in QR code is printed on an upright page.
pub const QR_MARKER: Rect = Rect::new(760, 1010, 60, 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContestSpec {
    pub column: usize,
    pub option_count: usize,
}

impl ContestSpec {
    pub const fn new(column: usize, option_count: usize) -> Self {
        Self {
            column,
            option_count,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageSpec {
    pub contests: Vec<ContestSpec>,
    /// Blank rows between consecutive contests in a column.
    pub contest_gap: u32,
}

impl PageSpec {
    pub fn new(contests: Vec<ContestSpec>) -> Self {
        Self {
            contests,
            contest_gap: 12,
        }
    }

    fn contest_height(option_count: usize) -> u32 {
        60 + OPTION_HEIGHT * option_count as u32
    }

    /// Contest bounds in the order they appear on the page: each column top
    /// to bottom, left column first. Contests are given in that order too.
    pub fn contest_bounds(&self) -> Vec<Rect> {
        let mut next_top = vec![];
        self.contests
            .iter()
            .map(|contest| {
                if next_top.len() <= contest.column {
                    next_top.resize(contest.column + 1, CONTEST_TOP);
                }
                let bounds = Rect::new(
                    COLUMN_LEFT + COLUMN_STRIDE * contest.column as i32,
                    next_top[contest.column],
                    CONTEST_WIDTH,
                    Self::contest_height(contest.option_count),
                );
                next_top[contest.column] = bounds.bottom() + 1 + self.contest_gap as i32;
                bounds
            })
            .collect()
    }

    /// Target bubble bounds for one contest, top to bottom.
    pub fn target_bounds(&self, contest_index: usize) -> Vec<Rect> {
        let contest = self.contest_bounds()[contest_index];
        (0..self.contests[contest_index].option_count)
            .map(|option| {
                Rect::new(
                    contest.x + 20,
                    contest.y + 45 + (OPTION_HEIGHT * option as u32) as i32,
                    TARGET_WIDTH,
                    TARGET_HEIGHT,
                )
            })
            .collect()
    }
}

fn fill_rect(img: &mut GrayImage, rect: Rect) {
    draw_filled_rect_mut(img, rect.into(), BLACK);
}

fn outline_rect(img: &mut GrayImage, rect: Rect, thickness: u32) {
    for inset in 0..thickness {
        draw_hollow_rect_mut(img, rect.inset(inset, inset).into(), BLACK);
    }
}

/// Draws an unmarked page: a header bar, then bordered contests each with a
/// title band and one bubble plus label per option.
pub fn blank_page(spec: &PageSpec) -> GrayImage {
    let mut img = GrayImage::from_pixel(PAGE_WIDTH, PAGE_HEIGHT, WHITE);
    fill_rect(&mut img, Rect::new(40, 30, 770, 30));

    for (index, contest) in spec.contest_bounds().into_iter().enumerate() {
        outline_rect(&mut img, contest, CONTEST_BORDER);
        fill_rect(
            &mut img,
            Rect::new(
                contest.x + CONTEST_BORDER as i32,
                contest.y + CONTEST_BORDER as i32,
                contest.width - 2 * CONTEST_BORDER,
                27,
            ),
        );

        for target in spec.target_bounds(index) {
            outline_rect(&mut img, target, 2);
            fill_rect(&mut img, Rect::new(contest.x + 80, target.y + 8, 150, 10));
        }
    }

    img
}

/// A blank page carrying the stand-in QR code recognized by
/// [`MarkerQrDetector`].
pub fn printed_page(spec: &PageSpec) -> GrayImage {
    let mut img = blank_page(spec);
    fill_rect(&mut img, QR_MARKER);
    img
}

/// Fills the given share of a target's interior, left to right, the way a
/// pen stroke might.
pub fn fill_target(img: &mut GrayImage, target: Rect, coverage: f32) {
    let inner = target.inset(2, 2);
    let width = (inner.width as f32 * coverage).round() as u32;
    if width > 0 {
        fill_rect(img, Rect::new(inner.x, inner.y, width, inner.height));
    }
}

pub fn flipped(img: &GrayImage) -> GrayImage {
    let mut out = img.clone();
    flip_in_place(&mut out);
    out
}

/// Stands in for a real QR decoder: "decodes" `payload` from any region
/// holding a solid dark square at least [`QR_MARKER_MIN_SIZE`] across. On
/// test pages only the marker is that large.
pub struct MarkerQrDetector {
    pub payload: Vec<u8>,
}

pub const QR_MARKER_MIN_SIZE: u32 = 50;

fn contains_solid_square(img: &GrayImage, size: u32) -> bool {
    // dark pixels in an unbroken vertical run ending at the current row
    let mut runs = vec![0u32; img.width() as usize];
    for y in 0..img.height() {
        let mut consecutive = 0;
        for x in 0..img.width() {
            let run = &mut runs[x as usize];
            *run = if *img.get_pixel(x, y) == BLACK { *run + 1 } else { 0 };
            consecutive = if *run >= size { consecutive + 1 } else { 0 };
            if consecutive >= size {
                return true;
            }
        }
    }
    false
}

impl DetectQrCode for MarkerQrDetector {
    fn detect(&self, img: &GrayImage) -> Option<QrCodeDetection> {
        contains_solid_square(img, QR_MARKER_MIN_SIZE).then(|| QrCodeDetection {
            data: self.payload.clone(),
            right_side_up: None,
        })
    }
}

/// Election whose single ballot style has one page per entry of `pages`,
/// with contests matching each page's layout. Two-option contests are yes/no
/// questions and the rest are single-seat candidate races.
pub fn election_for_pages(pages: &[&PageSpec]) -> Election {
    let contests = pages
        .iter()
        .flat_map(|page| page.contests.iter())
        .enumerate()
        .map(|(index, contest)| {
            let id = ContestId::from(format!("contest-{index}"));
            if contest.option_count == 2 {
                Contest::YesNo {
                    id,
                    district_id: DistrictId::from("district-1"),
                    party_id: None,
                    title: format!("Question {index}"),
                    description: None,
                }
            } else {
                Contest::Candidate {
                    id,
                    district_id: DistrictId::from("district-1"),
                    party_id: None,
                    title: format!("Race {index}"),
                    seats: 1,
                    candidates: (0..contest.option_count)
                        .map(|candidate| Candidate {
                            id: CandidateId::from(format!("candidate-{index}-{candidate}")),
                            name: format!("Candidate {index}-{candidate}"),
                            is_write_in: false,
                        })
                        .collect(),
                    allow_write_ins: false,
                }
            }
        })
        .collect();

    Election {
        title: "Synthetic Election".to_string(),
        ballot_styles: vec![BallotStyle {
            id: BallotStyleId::from("1"),
            precincts: vec![PrecinctId::from("23")],
            districts: vec![DistrictId::from("district-1")],
            party_id: None,
            page_count: Some(pages.len() as u32),
        }],
        precincts: vec![Precinct {
            id: PrecinctId::from("23"),
            name: "Center Springfield".to_string(),
        }],
        contests,
        mark_thresholds: None,
    }
}

pub fn page_metadata(page_number: u32, page_count: u32, is_test_mode: bool) -> BallotPageMetadata {
    BallotPageMetadata {
        ballot_style_id: BallotStyleId::from("1"),
        precinct_id: PrecinctId::from("23"),
        is_test_mode,
        page_number,
        page_count,
        locales: BallotLocales::default(),
        election_hash: "0123456789abcdef0123".to_string(),
        ballot_type: BallotType::Standard,
    }
}
