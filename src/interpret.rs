use std::path::{Path, PathBuf};

use image::{DynamicImage, GrayImage};
use log::{debug, info, warn};
use logging_timer::time;
use serde::Serialize;

use crate::binarize::{binarize_gray_mut, BinarizeError, PageImage};
use crate::boxes::{find_line_layout, match_template_layout, LineLayoutOptions};
use crate::election::{BallotStyleId, Candidate, Contest, ContestId, Election};
use crate::geometry::Point;
use crate::image_utils::flip_in_place;
use crate::layout::{
    find_contest_layouts, find_contests_with_unknown_column_layout, BallotImage, BallotPageLayout,
    ContestSearchOptions, TargetSearchOptions,
};
use crate::metadata::{
    detect_metadata, BallotPageMetadata, CompactMetadataCodec, DetectQrCode, MetadataCodec,
    MetadataError,
};
use crate::qr_code::RqrrDetector;
use crate::registration::map_ballot_onto_template;
use crate::scoring::{target_mark_score, MarkScore};
use crate::segments::LineSegmentDetector;
use crate::templates::{MissingTemplate, TemplateError, TemplateRegistry};
use crate::votes::{
    get_votes_from_marks, BallotMark, VotesDict, YesNoOption, DEFAULT_MARK_SCORE_VOTE_THRESHOLD,
};

#[derive(Debug, thiserror::Error)]
pub enum InterpretError {
    #[error("interpreter configured with testMode={configured} cannot add templates with isTestMode={claimed}")]
    TemplateTestModeMismatch { configured: bool, claimed: bool },

    #[error("interpreter configured with testMode={configured} cannot interpret ballots with isTestMode={claimed}")]
    BallotTestModeMismatch { configured: bool, claimed: bool },

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("refusing to interpret ballots before all templates are added, missing: {}", list_missing(.0))]
    MissingTemplates(Vec<MissingTemplate>),

    #[error("could not read ballot metadata: {0}")]
    Metadata(#[from] MetadataError),

    #[error("contest {contest_id} is supposed to have {expected} option(s), but found {found}")]
    OptionCountMismatch {
        contest_id: ContestId,
        expected: usize,
        found: usize,
    },

    #[error("found {found} contest(s) on the ballot but its template (ballot style {ballot_style_id} page {page_number}) has {expected}")]
    ContestCountMismatch {
        ballot_style_id: BallotStyleId,
        page_number: u32,
        expected: usize,
        found: usize,
    },

    #[error("unsupported ballot image: {0}")]
    Image(#[from] BinarizeError),

    #[error("failed to open image {path:?}: {source}")]
    ImageOpen {
        path: PathBuf,
        source: image::ImageError,
    },
}

fn list_missing(missing: &[MissingTemplate]) -> String {
    missing
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Clone, PartialEq)]
pub struct InterpreterOptions {
    /// Whether templates and ballots must be test-mode ones.
    pub test_mode: bool,
    /// Overrides the election's definite mark threshold.
    pub mark_score_vote_threshold: Option<f32>,
    pub contest_search: ContestSearchOptions,
    pub target_search: TargetSearchOptions,
    pub line_layout: LineLayoutOptions,
}

impl Default for InterpreterOptions {
    fn default() -> Self {
        Self {
            test_mode: false,
            mark_score_vote_threshold: None,
            contest_search: ContestSearchOptions::default(),
            target_search: TargetSearchOptions::default(),
            line_layout: LineLayoutOptions::default(),
        }
    }
}

/// Options for a single `interpret_ballot` call.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct InterpretOptions {
    /// The image is upside down. Only consulted when metadata is supplied,
    /// since otherwise the QR code's position says so.
    pub flipped: bool,
    pub mark_score_vote_threshold: Option<f32>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InterpretedBallot {
    pub matched_template: BallotPageLayout,
    /// The ballot warped onto the template's pixel grid.
    #[serde(skip)]
    pub mapped_ballot: GrayImage,
    pub metadata: BallotPageMetadata,
    pub marks: Vec<BallotMark>,
    pub votes: VotesDict,
}

/// Interprets hand-marked ballots by comparing them against blank templates
/// of the same pages.
///
/// Add a template for every page of every ballot style first, then
/// interpret ballots. Interpretation only reads the interpreter, so ballots
/// may be interpreted in parallel.
pub struct Interpreter {
    election: Election,
    options: InterpreterOptions,
    qr_detector: Box<dyn DetectQrCode>,
    metadata_codec: Box<dyn MetadataCodec>,
    line_detector: Option<Box<dyn LineSegmentDetector>>,
    templates: TemplateRegistry,
}

impl Interpreter {
    pub fn new(election: Election, options: InterpreterOptions) -> Self {
        let metadata_codec = Box::new(CompactMetadataCodec::new(&election));
        let templates = TemplateRegistry::new(&election);
        Self {
            election,
            options,
            qr_detector: Box::new(RqrrDetector),
            metadata_codec,
            line_detector: None,
            templates,
        }
    }

    #[must_use]
    pub fn with_qr_detector(mut self, detector: Box<dyn DetectQrCode>) -> Self {
        self.qr_detector = detector;
        self
    }

    #[must_use]
    pub fn with_metadata_codec(mut self, codec: Box<dyn MetadataCodec>) -> Self {
        self.metadata_codec = codec;
        self
    }

    /// Enables registration from ruled lines, falling back to contest corners
    /// when the lines do not match up.
    #[must_use]
    pub fn with_line_detector(mut self, detector: Box<dyn LineSegmentDetector>) -> Self {
        self.line_detector = Some(detector);
        self
    }

    pub const fn election(&self) -> &Election {
        &self.election
    }

    pub const fn options(&self) -> &InterpreterOptions {
        &self.options
    }

    /// Finds the layout of a blank ballot page and registers it as the
    /// template for its ballot style and page.
    #[time]
    pub fn add_template(
        &mut self,
        image: PageImage,
        metadata: Option<BallotPageMetadata>,
    ) -> Result<&BallotPageLayout, InterpretError> {
        let layout = self.interpret_template(image, metadata)?;
        self.add_template_layout(layout)
    }

    /// Registers a previously found template layout.
    pub fn add_template_layout(
        &mut self,
        layout: BallotPageLayout,
    ) -> Result<&BallotPageLayout, InterpretError> {
        let claimed = layout.metadata().is_test_mode;
        if claimed != self.options.test_mode {
            return Err(InterpretError::TemplateTestModeMismatch {
                configured: self.options.test_mode,
                claimed,
            });
        }

        Ok(self.templates.insert(&self.election, layout)?)
    }

    /// Finds the layout of a blank ballot page without registering it.
    pub fn interpret_template(
        &self,
        image: PageImage,
        metadata: Option<BallotPageMetadata>,
    ) -> Result<BallotPageLayout, InterpretError> {
        let (img, metadata) = self.normalize(image, metadata, false)?;
        if metadata.is_test_mode != self.options.test_mode {
            return Err(InterpretError::TemplateTestModeMismatch {
                configured: self.options.test_mode,
                claimed: metadata.is_test_mode,
            });
        }

        let contests = find_contest_layouts(
            &img,
            &self.options.contest_search,
            &self.options.target_search,
        );
        debug!(
            "template for ballot style {} page {} has {} contest(s)",
            metadata.ballot_style_id,
            metadata.page_number,
            contests.len()
        );

        let line_layout = self.line_detector.as_deref().and_then(|detector| {
            let found = find_line_layout(&img, detector, &self.options.line_layout);
            if found.layout.box_count() == contests.len() {
                Some(found.layout)
            } else {
                debug!(
                    "line layout has {} box(es) for {} contest(s), not keeping it",
                    found.layout.box_count(),
                    contests.len()
                );
                None
            }
        });

        Ok(BallotPageLayout {
            ballot_image: BallotImage {
                image: img,
                metadata,
            },
            contests,
            line_layout,
        })
    }

    /// Ends template registration. Adding templates afterwards fails.
    pub fn finalize(&mut self) {
        self.templates.finalize();
    }

    pub fn has_missing_templates(&self) -> bool {
        self.templates.has_missing_templates(&self.election)
    }

    pub fn missing_templates(&self) -> Vec<MissingTemplate> {
        self.templates.missing_templates(&self.election)
    }

    /// Reads the marks and votes on a scanned ballot page.
    #[time]
    pub fn interpret_ballot(
        &self,
        image: PageImage,
        metadata: Option<BallotPageMetadata>,
        options: &InterpretOptions,
    ) -> Result<InterpretedBallot, InterpretError> {
        let missing = self.missing_templates();
        if !missing.is_empty() {
            return Err(InterpretError::MissingTemplates(missing));
        }

        let (img, metadata) = self.normalize(image, metadata, options.flipped)?;
        if metadata.is_test_mode != self.options.test_mode {
            return Err(InterpretError::BallotTestModeMismatch {
                configured: self.options.test_mode,
                claimed: metadata.is_test_mode,
            });
        }

        let template = self.matching_template(&metadata)?;
        let contests = self.templates.contests_for_template(&self.election, template)?;
        for (layout, contest) in template.contests.iter().zip(&contests) {
            let expected = contest.expected_option_count();
            if layout.options.len() != expected {
                return Err(InterpretError::OptionCountMismatch {
                    contest_id: contest.id().clone(),
                    expected,
                    found: layout.options.len(),
                });
            }
        }

        let (scan_points, template_points) = self.correspondences(&img, template)?;
        let mapped_ballot = map_ballot_onto_template(
            &img,
            &scan_points,
            &template_points,
            template.image().dimensions(),
        );

        let marks = marks_for_ballot(template, &mapped_ballot, &contests);
        let threshold = self.vote_threshold(options);
        let votes = get_votes_from_marks(&marks, threshold);
        info!(
            "ballot style {} page {}: {} mark(s), {} contest(s) with votes at threshold {threshold}",
            metadata.ballot_style_id,
            metadata.page_number,
            marks.len(),
            votes.len()
        );

        Ok(InterpretedBallot {
            matched_template: template.clone(),
            mapped_ballot,
            metadata,
            marks,
            votes,
        })
    }

    /// Binarizes the image, reading metadata from it if none was given, and
    /// turns it right side up.
    fn normalize(
        &self,
        image: PageImage,
        metadata: Option<BallotPageMetadata>,
        flipped: bool,
    ) -> Result<(GrayImage, BallotPageMetadata), InterpretError> {
        let mut img = image.into_luma();
        let threshold = binarize_gray_mut(&mut img, None);
        debug!(
            "binarized {}x{} image at threshold {threshold}",
            img.width(),
            img.height()
        );

        let (metadata, flipped) = match metadata {
            Some(metadata) => (metadata, flipped),
            None => {
                let detected = detect_metadata(
                    &img,
                    self.qr_detector.as_ref(),
                    self.metadata_codec.as_ref(),
                )?;
                (detected.metadata, detected.flipped)
            }
        };

        if flipped {
            debug!("image is upside down, rotating");
            flip_in_place(&mut img);
        }

        Ok((img, metadata))
    }

    fn matching_template(
        &self,
        metadata: &BallotPageMetadata,
    ) -> Result<&BallotPageLayout, InterpretError> {
        if let Some(template) = self
            .templates
            .get(&metadata.ballot_style_id, metadata.page_number)
        {
            return Ok(template);
        }

        let error = match self.templates.page_count(&metadata.ballot_style_id) {
            Some(page_count) => TemplateError::InvalidPageNumber {
                ballot_style_id: metadata.ballot_style_id.clone(),
                page_number: metadata.page_number,
                page_count,
            },
            None => TemplateError::UnknownBallotStyle(metadata.ballot_style_id.clone()),
        };
        Err(error.into())
    }

    /// Matching points on the scan and the template, from ruled lines when
    /// possible and otherwise from contest corners.
    fn correspondences(
        &self,
        img: &GrayImage,
        template: &BallotPageLayout,
    ) -> Result<(Vec<Point<f32>>, Vec<Point<f32>>), InterpretError> {
        if let Some(points) = self.line_layout_correspondences(img, template) {
            return Ok(points);
        }

        let scan_contests = find_contests_with_unknown_column_layout(
            img,
            Some(template.contests.len()),
            &self.options.contest_search,
        );
        if scan_contests.len() != template.contests.len() {
            let metadata = template.metadata();
            return Err(InterpretError::ContestCountMismatch {
                ballot_style_id: metadata.ballot_style_id.clone(),
                page_number: metadata.page_number,
                expected: template.contests.len(),
                found: scan_contests.len(),
            });
        }

        let scan_points = scan_contests
            .iter()
            .flat_map(|contest| contest.corners)
            .collect();
        let template_points = template
            .contests
            .iter()
            .flat_map(|contest| contest.corners)
            .collect();
        Ok((scan_points, template_points))
    }

    fn line_layout_correspondences(
        &self,
        img: &GrayImage,
        template: &BallotPageLayout,
    ) -> Option<(Vec<Point<f32>>, Vec<Point<f32>>)> {
        let detector = self.line_detector.as_deref()?;
        let template_layout = template.line_layout.as_ref()?;

        let scan = find_line_layout(img, detector, &self.options.line_layout);
        let Some(matched) = match_template_layout(
            template_layout,
            &scan.layout,
            &scan.unused_segments,
            self.options.line_layout.allowed_area_ratio_error,
        ) else {
            warn!("line layout does not match the template, using contest corners");
            return None;
        };

        let scan_points = matched.boxes().flat_map(|grid_box| grid_box.corners()).collect();
        let template_points = template_layout
            .boxes()
            .flat_map(|grid_box| grid_box.corners())
            .collect();
        Some((scan_points, template_points))
    }

    fn vote_threshold(&self, options: &InterpretOptions) -> f32 {
        options
            .mark_score_vote_threshold
            .or(self.options.mark_score_vote_threshold)
            .or_else(|| {
                self.election
                    .mark_thresholds
                    .map(|thresholds| thresholds.definite)
            })
            .unwrap_or(DEFAULT_MARK_SCORE_VOTE_THRESHOLD)
    }
}

/// Scores every target on the template against the mapped ballot. Option
/// counts must already match the contests.
fn marks_for_ballot(
    template: &BallotPageLayout,
    mapped_ballot: &GrayImage,
    contests: &[&Contest],
) -> Vec<BallotMark> {
    let mut marks = vec![];

    for (layout, contest) in template.contests.iter().zip(contests) {
        match contest {
            Contest::Candidate { id, candidates, .. } => {
                for (index, option) in layout.options.iter().enumerate() {
                    let candidate = candidates
                        .get(index)
                        .cloned()
                        .unwrap_or_else(|| Candidate::write_in(index - candidates.len()));
                    let MarkScore { score, offset } =
                        target_mark_score(template.image(), mapped_ballot, &option.target);
                    debug!("contest {id}: candidate {} scored {score:.3}", candidate.id);
                    marks.push(BallotMark::Candidate {
                        contest_id: id.clone(),
                        option: candidate,
                        score,
                        bounds: option.target.bounds,
                        target: option.target,
                        scored_offset: offset,
                    });
                }
            }

            Contest::YesNo { id, .. } => {
                for (option, label) in layout.options.iter().zip(YesNoOption::ALL) {
                    let MarkScore { score, offset } =
                        target_mark_score(template.image(), mapped_ballot, &option.target);
                    debug!("contest {id}: {label:?} scored {score:.3}");
                    marks.push(BallotMark::YesNo {
                        contest_id: id.clone(),
                        option: label,
                        score,
                        bounds: option.target.bounds,
                        target: option.target,
                        scored_offset: offset,
                    });
                }
            }
        }
    }

    marks
}

/// Loads a ballot page image. Color images without alpha are given an
/// opaque alpha channel.
#[time]
pub fn load_page_image(path: &Path) -> Result<PageImage, InterpretError> {
    let img = image::open(path).map_err(|source| InterpretError::ImageOpen {
        path: path.to_path_buf(),
        source,
    })?;
    let img = match img {
        rgb @ DynamicImage::ImageRgb8(_) => DynamicImage::ImageRgba8(rgb.into_rgba8()),
        other => other,
    };
    Ok(PageImage::try_from(img)?)
}

#[cfg(test)]
mod tests {
    use image::{Rgba, RgbaImage};

    use super::*;
    use crate::election::{CandidateId, DistrictId, MarkThresholds};
    use crate::segments::EdgeRunDetector;
    use crate::test_utils::{
        blank_page, election_for_pages, fill_target, flipped, page_metadata, printed_page,
        ContestSpec, MarkerQrDetector, PageSpec,
    };

    const URL: &[u8] = b"https://ballot.page/?t=_&pr=23&bs=1&p=1-1";
    const TEST_URL: &[u8] = b"https://ballot.page/?t=t&pr=23&bs=1&p=1-1";

    fn page_spec() -> PageSpec {
        PageSpec::new(vec![
            ContestSpec::new(0, 3),
            ContestSpec::new(0, 2),
            ContestSpec::new(1, 4),
        ])
    }

    fn interpreter_with_payload(spec: &PageSpec, payload: &[u8]) -> Interpreter {
        Interpreter::new(election_for_pages(&[spec]), InterpreterOptions::default())
            .with_qr_detector(Box::new(MarkerQrDetector {
                payload: payload.to_vec(),
            }))
    }

    fn ready_interpreter(spec: &PageSpec) -> Interpreter {
        let mut interpreter = interpreter_with_payload(spec, URL);
        interpreter
            .add_template(PageImage::Gray(printed_page(spec)), None)
            .unwrap();
        interpreter.finalize();
        interpreter
    }

    fn vote_ids(ballot: &InterpretedBallot) -> serde_json::Value {
        serde_json::to_value(&ballot.votes).unwrap()
    }

    #[test]
    fn test_interpreter_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Interpreter>();
    }

    #[test]
    fn test_add_template_reads_layout_and_metadata() {
        let spec = page_spec();
        let mut interpreter = interpreter_with_payload(&spec, URL);
        let template = interpreter
            .add_template(PageImage::Gray(printed_page(&spec)), None)
            .unwrap();
        assert_eq!(template.metadata().page_number, 1);
        assert_eq!(
            template.contests.iter().map(|c| c.bounds).collect::<Vec<_>>(),
            spec.contest_bounds()
        );
        assert_eq!(
            template.contests.iter().map(|c| c.options.len()).collect::<Vec<_>>(),
            vec![3, 2, 4]
        );
        assert!(!interpreter.has_missing_templates());
    }

    #[test]
    fn test_unmarked_template_has_no_votes() {
        let spec = page_spec();
        let interpreter = ready_interpreter(&spec);
        let ballot = interpreter
            .interpret_ballot(
                PageImage::Gray(printed_page(&spec)),
                None,
                &InterpretOptions::default(),
            )
            .unwrap();
        assert!(ballot.votes.is_empty());
        assert_eq!(ballot.marks.len(), 9);
        assert_eq!(
            ballot.mapped_ballot.dimensions(),
            ballot.matched_template.image().dimensions()
        );
        for mark in &ballot.marks {
            assert!(mark.score().unwrap() < 0.05, "unexpected mark: {mark:?}");
        }
    }

    fn marked_page(spec: &PageSpec) -> GrayImage {
        let mut img = printed_page(spec);
        fill_target(&mut img, spec.target_bounds(0)[1], 1.0);
        fill_target(&mut img, spec.target_bounds(1)[0], 0.8);
        fill_target(&mut img, spec.target_bounds(1)[1], 0.9);
        fill_target(&mut img, spec.target_bounds(2)[3], 1.0);
        img
    }

    fn expected_votes() -> serde_json::Value {
        serde_json::json!({
            "contest-0": [{ "id": "candidate-0-1", "name": "Candidate 0-1" }],
            "contest-1": ["yes", "no"],
            "contest-2": [{ "id": "candidate-2-3", "name": "Candidate 2-3" }],
        })
    }

    #[test]
    fn test_marked_ballot_votes() {
        let spec = page_spec();
        let interpreter = ready_interpreter(&spec);
        let ballot = interpreter
            .interpret_ballot(
                PageImage::Gray(marked_page(&spec)),
                None,
                &InterpretOptions::default(),
            )
            .unwrap();
        assert_eq!(vote_ids(&ballot), expected_votes());
    }

    #[test]
    fn test_flipped_ballot_found_by_qr_position() {
        let spec = page_spec();
        let interpreter = ready_interpreter(&spec);
        let ballot = interpreter
            .interpret_ballot(
                PageImage::Gray(flipped(&marked_page(&spec))),
                None,
                &InterpretOptions::default(),
            )
            .unwrap();
        assert_eq!(vote_ids(&ballot), expected_votes());
    }

    #[test]
    fn test_flipped_ballot_with_supplied_metadata() {
        let spec = page_spec();
        let interpreter = ready_interpreter(&spec);
        let upright = interpreter
            .interpret_ballot(
                PageImage::Gray(marked_page(&spec)),
                Some(page_metadata(1, 1, false)),
                &InterpretOptions::default(),
            )
            .unwrap();
        let upside_down = interpreter
            .interpret_ballot(
                PageImage::Gray(flipped(&marked_page(&spec))),
                Some(page_metadata(1, 1, false)),
                &InterpretOptions {
                    flipped: true,
                    ..InterpretOptions::default()
                },
            )
            .unwrap();
        assert_eq!(upright.votes, upside_down.votes);
        assert_eq!(vote_ids(&upright), expected_votes());
    }

    #[test]
    fn test_shifted_scan_is_registered() {
        let spec = page_spec();
        let interpreter = ready_interpreter(&spec);
        let mut scan = GrayImage::from_pixel(870, 1120, crate::image_utils::WHITE);
        image::imageops::overlay(&mut scan, &marked_page(&spec), 7, 5);
        let ballot = interpreter
            .interpret_ballot(PageImage::Gray(scan), None, &InterpretOptions::default())
            .unwrap();
        assert_eq!(ballot.mapped_ballot.dimensions(), (850, 1100));
        assert_eq!(vote_ids(&ballot), expected_votes());
    }

    #[test]
    fn test_rgba_ballot() {
        let spec = page_spec();
        let interpreter = ready_interpreter(&spec);
        let gray = marked_page(&spec);
        let rgba = RgbaImage::from_fn(gray.width(), gray.height(), |x, y| {
            let level = gray.get_pixel(x, y).0[0];
            Rgba([level, level, level, 255])
        });
        let ballot = interpreter
            .interpret_ballot(PageImage::Rgba(rgba), None, &InterpretOptions::default())
            .unwrap();
        assert_eq!(vote_ids(&ballot), expected_votes());
    }

    #[test]
    fn test_line_detector_registration() {
        let spec = page_spec();
        let mut interpreter = interpreter_with_payload(&spec, URL)
            .with_line_detector(Box::new(EdgeRunDetector::default()));
        interpreter
            .add_template(PageImage::Gray(printed_page(&spec)), None)
            .unwrap();
        let ballot = interpreter
            .interpret_ballot(
                PageImage::Gray(marked_page(&spec)),
                None,
                &InterpretOptions::default(),
            )
            .unwrap();
        assert_eq!(vote_ids(&ballot), expected_votes());
    }

    #[test]
    fn test_threshold_precedence() {
        let spec = page_spec();
        let mut img = printed_page(&spec);
        fill_target(&mut img, spec.target_bounds(0)[0], 0.5);
        let image = || PageImage::Gray(img.clone());

        let mut election = election_for_pages(&[&spec]);
        election.mark_thresholds = Some(MarkThresholds {
            definite: 0.6,
            marginal: 0.3,
        });
        let mut interpreter = Interpreter::new(election, InterpreterOptions::default())
            .with_qr_detector(Box::new(MarkerQrDetector {
                payload: URL.to_vec(),
            }));
        interpreter
            .add_template(PageImage::Gray(printed_page(&spec)), None)
            .unwrap();

        let score = interpreter
            .interpret_ballot(image(), None, &InterpretOptions::default())
            .unwrap()
            .marks[0]
            .score()
            .unwrap();
        assert!(score > 0.3 && score < 0.6, "score was {score}");

        let votes = |interpreter: &Interpreter, options: &InterpretOptions| {
            interpreter
                .interpret_ballot(image(), None, options)
                .unwrap()
                .votes
                .len()
        };
        assert_eq!(votes(&interpreter, &InterpretOptions::default()), 0);
        assert_eq!(
            votes(
                &interpreter,
                &InterpretOptions {
                    mark_score_vote_threshold: Some(0.3),
                    ..InterpretOptions::default()
                }
            ),
            1
        );

        interpreter.options.mark_score_vote_threshold = Some(0.25);
        assert_eq!(votes(&interpreter, &InterpretOptions::default()), 1);
        assert_eq!(
            votes(
                &interpreter,
                &InterpretOptions {
                    mark_score_vote_threshold: Some(0.9),
                    ..InterpretOptions::default()
                }
            ),
            0
        );
    }

    #[test]
    fn test_template_test_mode_mismatch() {
        let spec = page_spec();
        let mut interpreter = interpreter_with_payload(&spec, TEST_URL);
        let error = interpreter
            .add_template(PageImage::Gray(printed_page(&spec)), None)
            .unwrap_err();
        assert!(matches!(
            error,
            InterpretError::TemplateTestModeMismatch {
                configured: false,
                claimed: true
            }
        ));
        assert_eq!(
            error.to_string(),
            "interpreter configured with testMode=false cannot add templates with isTestMode=true"
        );
        assert!(interpreter.has_missing_templates());
    }

    #[test]
    fn test_ballot_test_mode_mismatch() {
        let spec = page_spec();
        let interpreter = ready_interpreter(&spec);
        let error = interpreter
            .interpret_ballot(
                PageImage::Gray(printed_page(&spec)),
                Some(page_metadata(1, 1, true)),
                &InterpretOptions::default(),
            )
            .unwrap_err();
        assert_eq!(
            error.to_string(),
            "interpreter configured with testMode=false cannot interpret ballots with isTestMode=true"
        );
    }

    #[test]
    fn test_interpret_before_templates_added() {
        let spec = page_spec();
        let interpreter = interpreter_with_payload(&spec, URL);
        let error = interpreter
            .interpret_ballot(
                PageImage::Gray(printed_page(&spec)),
                None,
                &InterpretOptions::default(),
            )
            .unwrap_err();
        assert_eq!(
            error.to_string(),
            "refusing to interpret ballots before all templates are added, missing: ballot style 1 page 1"
        );
        match error {
            InterpretError::MissingTemplates(missing) => {
                assert_eq!(missing.len(), 1);
                assert_eq!(missing[0].page_number, Some(1));
            }
            error => panic!("unexpected error: {error}"),
        }
    }

    #[test]
    fn test_add_template_after_finalize() {
        let spec = page_spec();
        let mut interpreter = ready_interpreter(&spec);
        let error = interpreter
            .add_template(PageImage::Gray(printed_page(&spec)), None)
            .unwrap_err();
        assert!(matches!(
            error,
            InterpretError::Template(TemplateError::Finalized { .. })
        ));
    }

    #[test]
    fn test_option_count_mismatch() {
        let spec = page_spec();
        let mut election = election_for_pages(&[&spec]);
        if let Contest::Candidate { candidates, .. } = &mut election.contests[2] {
            candidates.pop();
        }
        let mut interpreter = Interpreter::new(election, InterpreterOptions::default())
            .with_qr_detector(Box::new(MarkerQrDetector {
                payload: URL.to_vec(),
            }));
        interpreter
            .add_template(PageImage::Gray(printed_page(&spec)), None)
            .unwrap();
        let error = interpreter
            .interpret_ballot(
                PageImage::Gray(printed_page(&spec)),
                None,
                &InterpretOptions::default(),
            )
            .unwrap_err();
        assert!(matches!(
            &error,
            InterpretError::OptionCountMismatch {
                contest_id,
                expected: 3,
                found: 4,
            } if contest_id.as_str() == "contest-2"
        ));
        assert_eq!(
            error.to_string(),
            "contest contest-2 is supposed to have 3 option(s), but found 4"
        );
    }

    #[test]
    fn test_write_in_options() {
        let spec = page_spec();
        let mut election = election_for_pages(&[&spec]);
        election.contests[2] = Contest::Candidate {
            id: ContestId::from("contest-2"),
            district_id: DistrictId::from("district-1"),
            party_id: None,
            title: "Council".to_string(),
            seats: 2,
            candidates: vec![
                Candidate {
                    id: CandidateId::from("ann"),
                    name: "Ann".to_string(),
                    is_write_in: false,
                },
                Candidate {
                    id: CandidateId::from("ben"),
                    name: "Ben".to_string(),
                    is_write_in: false,
                },
            ],
            allow_write_ins: true,
        };
        let mut interpreter = Interpreter::new(election, InterpreterOptions::default())
            .with_qr_detector(Box::new(MarkerQrDetector {
                payload: URL.to_vec(),
            }));
        interpreter
            .add_template(PageImage::Gray(printed_page(&spec)), None)
            .unwrap();

        let mut img = printed_page(&spec);
        fill_target(&mut img, spec.target_bounds(2)[0], 1.0);
        fill_target(&mut img, spec.target_bounds(2)[3], 1.0);
        let ballot = interpreter
            .interpret_ballot(PageImage::Gray(img), None, &InterpretOptions::default())
            .unwrap();
        assert_eq!(
            vote_ids(&ballot),
            serde_json::json!({
                "contest-2": [
                    { "id": "ann", "name": "Ann" },
                    { "id": "write-in-1", "name": "Write-In", "isWriteIn": true },
                ],
            })
        );
    }

    #[test]
    fn test_scan_with_missing_contest() {
        let spec = page_spec();
        let interpreter = ready_interpreter(&spec);
        let fewer = PageSpec::new(vec![ContestSpec::new(0, 3), ContestSpec::new(0, 2)]);
        let error = interpreter
            .interpret_ballot(
                PageImage::Gray(printed_page(&fewer)),
                None,
                &InterpretOptions::default(),
            )
            .unwrap_err();
        assert!(matches!(
            error,
            InterpretError::ContestCountMismatch {
                expected: 3,
                found: 2,
                ..
            }
        ));
    }

    #[test]
    fn test_unreadable_metadata() {
        let spec = page_spec();
        let interpreter = ready_interpreter(&spec);
        let error = interpreter
            .interpret_ballot(
                PageImage::Gray(blank_page(&spec)),
                None,
                &InterpretOptions::default(),
            )
            .unwrap_err();
        assert!(matches!(
            error,
            InterpretError::Metadata(MetadataError::NotFound)
        ));
    }

    #[test]
    fn test_load_page_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("page.png");
        let img = printed_page(&page_spec());
        img.save(&path).unwrap();

        match load_page_image(&path).unwrap() {
            PageImage::Gray(loaded) => assert_eq!(loaded, img),
            other => panic!("expected a grayscale image, got {} channel(s)", other.channels()),
        }

        let rgb_path = dir.path().join("page-rgb.png");
        DynamicImage::ImageLuma8(img).into_rgb8().save(&rgb_path).unwrap();
        assert_eq!(load_page_image(&rgb_path).unwrap().channels(), 4);

        let missing = dir.path().join("missing.png");
        assert!(matches!(
            load_page_image(&missing),
            Err(InterpretError::ImageOpen { .. })
        ));
    }
}
