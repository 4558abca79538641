use std::collections::BTreeMap;
use std::fmt;

use log::debug;

use crate::election::{BallotStyleId, Contest, Election};
use crate::layout::BallotPageLayout;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("templates are finalized, cannot add a template for ballot style {ballot_style_id} page {page_number}")]
    Finalized {
        ballot_style_id: BallotStyleId,
        page_number: u32,
    },

    #[error("ballot style {0} is not in the election")]
    UnknownBallotStyle(BallotStyleId),

    #[error("ballot style {ballot_style_id} has {page_count} page(s), page {page_number} is out of range")]
    InvalidPageNumber {
        ballot_style_id: BallotStyleId,
        page_number: u32,
        page_count: u32,
    },

    #[error("a template for ballot style {ballot_style_id} page {page_number} was already added")]
    Duplicate {
        ballot_style_id: BallotStyleId,
        page_number: u32,
    },

    #[error("ballot style {ballot_style_id} page {page_number} has {found} contest(s) but the election only has {expected} left for it")]
    ContestCountMismatch {
        ballot_style_id: BallotStyleId,
        page_number: u32,
        expected: usize,
        found: usize,
    },
}

/// A page expected by the election that has no template yet. `page_number`
/// is `None` when nothing is known about the style's pages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingTemplate {
    pub ballot_style_id: BallotStyleId,
    pub page_number: Option<u32>,
}

impl fmt::Display for MissingTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.page_number {
            Some(page_number) => {
                write!(f, "ballot style {} page {page_number}", self.ballot_style_id)
            }
            None => write!(f, "ballot style {} (no pages)", self.ballot_style_id),
        }
    }
}

/// Registered template layouts, one slot per page of each ballot style.
#[derive(Debug, Clone, Default)]
pub struct TemplateRegistry {
    pages: BTreeMap<BallotStyleId, Vec<Option<BallotPageLayout>>>,
    finalized: bool,
}

impl TemplateRegistry {
    /// Creates an empty registry with page slots for every ballot style whose
    /// page count the election declares.
    pub fn new(election: &Election) -> Self {
        let pages = election
            .ballot_styles
            .iter()
            .map(|style| {
                let page_count = style.page_count.unwrap_or(0) as usize;
                (style.id.clone(), vec![None; page_count])
            })
            .collect();
        Self {
            pages,
            finalized: false,
        }
    }

    pub const fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Ends the registration phase. Later inserts fail.
    pub fn finalize(&mut self) {
        self.finalized = true;
    }

    /// Stores `layout` under the ballot style and page number in its
    /// metadata. Styles whose page count the election leaves out grow to the
    /// largest page count seen in their templates' metadata. Nothing changes
    /// when the template is rejected.
    pub fn insert(
        &mut self,
        election: &Election,
        layout: BallotPageLayout,
    ) -> Result<&BallotPageLayout, TemplateError> {
        let metadata = layout.metadata();
        let ballot_style_id = metadata.ballot_style_id.clone();
        let page_number = metadata.page_number;

        if self.finalized {
            return Err(TemplateError::Finalized {
                ballot_style_id,
                page_number,
            });
        }

        let style = election
            .ballot_style(&ballot_style_id)
            .ok_or_else(|| TemplateError::UnknownBallotStyle(ballot_style_id.clone()))?;
        let known_page_count = self.pages.get(&style.id).map_or(0, Vec::len) as u32;
        let page_count = style
            .page_count
            .unwrap_or_else(|| known_page_count.max(metadata.page_count));
        if page_number == 0 || page_number > page_count {
            return Err(TemplateError::InvalidPageNumber {
                ballot_style_id,
                page_number,
                page_count,
            });
        }

        if self.get(&style.id, page_number).is_some() {
            return Err(TemplateError::Duplicate {
                ballot_style_id,
                page_number,
            });
        }

        debug!(
            "added template for ballot style {ballot_style_id} page {page_number}/{page_count} with {} contest(s)",
            layout.contests.len()
        );
        let slots = self.pages.entry(style.id.clone()).or_default();
        if slots.len() < page_count as usize {
            slots.resize(page_count as usize, None);
        }
        Ok(slots[page_number as usize - 1].insert(layout))
    }

    /// Number of page slots for a ballot style, once known.
    pub fn page_count(&self, ballot_style_id: &BallotStyleId) -> Option<u32> {
        self.pages
            .get(ballot_style_id)
            .filter(|slots| !slots.is_empty())
            .map(|slots| slots.len() as u32)
    }

    pub fn get(
        &self,
        ballot_style_id: &BallotStyleId,
        page_number: u32,
    ) -> Option<&BallotPageLayout> {
        let index = (page_number as usize).checked_sub(1)?;
        self.pages.get(ballot_style_id)?.get(index)?.as_ref()
    }

    /// Pages of every ballot style in the election that still lack a
    /// template, in election order.
    pub fn missing_templates(&self, election: &Election) -> Vec<MissingTemplate> {
        let mut missing = vec![];
        for style in &election.ballot_styles {
            match self.pages.get(&style.id) {
                Some(slots) if !slots.is_empty() => {
                    missing.extend(slots.iter().enumerate().filter(|(_, slot)| slot.is_none()).map(
                        |(index, _)| MissingTemplate {
                            ballot_style_id: style.id.clone(),
                            page_number: Some(index as u32 + 1),
                        },
                    ));
                }
                _ => missing.push(MissingTemplate {
                    ballot_style_id: style.id.clone(),
                    page_number: None,
                }),
            }
        }
        missing
    }

    pub fn has_missing_templates(&self, election: &Election) -> bool {
        !self.missing_templates(election).is_empty()
    }

    /// The election's contests printed on `template`: the style's contests
    /// after those on earlier pages, as many as the template has.
    pub fn contests_for_template<'e>(
        &self,
        election: &'e Election,
        template: &BallotPageLayout,
    ) -> Result<Vec<&'e Contest>, TemplateError> {
        let metadata = template.metadata();
        let style = election
            .ballot_style(&metadata.ballot_style_id)
            .ok_or_else(|| TemplateError::UnknownBallotStyle(metadata.ballot_style_id.clone()))?;

        let contest_offset = (1..metadata.page_number)
            .map(|page_number| {
                self.get(&metadata.ballot_style_id, page_number)
                    .map_or(0, |page| page.contests.len())
            })
            .sum::<usize>();

        let contests = election.contests_for_ballot_style(style);
        let remaining = contests.len().saturating_sub(contest_offset);
        if template.contests.len() > remaining {
            return Err(TemplateError::ContestCountMismatch {
                ballot_style_id: metadata.ballot_style_id.clone(),
                page_number: metadata.page_number,
                expected: remaining,
                found: template.contests.len(),
            });
        }

        Ok(contests
            .into_iter()
            .skip(contest_offset)
            .take(template.contests.len())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use image::GrayImage;

    use super::*;
    use crate::geometry::Rect;
    use crate::layout::{BallotImage, ContestLayout};
    use crate::metadata::{CompactMetadataCodec, MetadataCodec};
    use crate::test_utils::{election_for_pages, page_metadata, ContestSpec, PageSpec};

    fn layout(page_number: u32, page_count: u32, contest_count: usize) -> BallotPageLayout {
        let bounds = Rect::new(40, 120, 375, 210);
        BallotPageLayout {
            ballot_image: BallotImage {
                image: GrayImage::new(1, 1),
                metadata: page_metadata(page_number, page_count, false),
            },
            contests: vec![
                ContestLayout {
                    bounds,
                    corners: bounds.corners(),
                    options: vec![],
                };
                contest_count
            ],
            line_layout: None,
        }
    }

    fn two_page_election() -> Election {
        let first = PageSpec::new(vec![ContestSpec::new(0, 3), ContestSpec::new(1, 2)]);
        let second = PageSpec::new(vec![ContestSpec::new(0, 4)]);
        election_for_pages(&[&first, &second])
    }

    #[test]
    fn test_missing_templates_until_every_page_added() {
        let election = two_page_election();
        let mut registry = TemplateRegistry::new(&election);
        assert_eq!(
            registry.missing_templates(&election),
            vec![
                MissingTemplate {
                    ballot_style_id: BallotStyleId::from("1"),
                    page_number: Some(1),
                },
                MissingTemplate {
                    ballot_style_id: BallotStyleId::from("1"),
                    page_number: Some(2),
                },
            ]
        );

        registry.insert(&election, layout(2, 2, 1)).unwrap();
        assert!(registry.has_missing_templates(&election));
        registry.insert(&election, layout(1, 2, 2)).unwrap();
        assert!(!registry.has_missing_templates(&election));
        assert!(registry.get(&BallotStyleId::from("1"), 1).is_some());
        assert!(registry.get(&BallotStyleId::from("1"), 0).is_none());
        assert!(registry.get(&BallotStyleId::from("1"), 3).is_none());
    }

    #[test]
    fn test_page_count_from_metadata_when_election_omits_it() {
        let mut election = two_page_election();
        election.ballot_styles[0].page_count = None;
        let mut registry = TemplateRegistry::new(&election);
        assert_eq!(
            registry.missing_templates(&election),
            vec![MissingTemplate {
                ballot_style_id: BallotStyleId::from("1"),
                page_number: None,
            }]
        );

        registry.insert(&election, layout(1, 2, 2)).unwrap();
        assert_eq!(
            registry.missing_templates(&election),
            vec![MissingTemplate {
                ballot_style_id: BallotStyleId::from("1"),
                page_number: Some(2),
            }]
        );
    }

    #[test]
    fn test_page_count_grows_with_binary_records() {
        let mut election = two_page_election();
        election.ballot_styles[0].page_count = None;
        let codec = CompactMetadataCodec::new(&election);
        let mut registry = TemplateRegistry::new(&election);

        for page_number in 1..=2 {
            let bytes = codec.encode(&page_metadata(page_number, 2, false)).unwrap();
            let mut template = layout(page_number, 2, 1);
            template.ballot_image.metadata = codec.decode(&bytes).unwrap();
            assert_eq!(template.metadata().page_count, page_number);
            registry.insert(&election, template).unwrap();
        }

        assert_eq!(registry.page_count(&BallotStyleId::from("1")), Some(2));
        assert!(!registry.has_missing_templates(&election));
        assert!(registry.get(&BallotStyleId::from("1"), 2).is_some());
    }

    #[test]
    fn test_rejected_insert_leaves_registry_unchanged() {
        let mut election = two_page_election();
        election.ballot_styles[0].page_count = None;
        let mut registry = TemplateRegistry::new(&election);

        assert!(matches!(
            registry.insert(&election, layout(5, 1, 1)),
            Err(TemplateError::InvalidPageNumber {
                page_number: 5,
                page_count: 1,
                ..
            })
        ));
        assert_eq!(registry.page_count(&BallotStyleId::from("1")), None);
        assert_eq!(
            registry.missing_templates(&election),
            vec![MissingTemplate {
                ballot_style_id: BallotStyleId::from("1"),
                page_number: None,
            }]
        );

        registry.insert(&election, layout(2, 2, 1)).unwrap();
        assert_eq!(
            registry.missing_templates(&election),
            vec![MissingTemplate {
                ballot_style_id: BallotStyleId::from("1"),
                page_number: Some(1),
            }]
        );
    }

    #[test]
    fn test_missing_template_display() {
        let page = MissingTemplate {
            ballot_style_id: BallotStyleId::from("1"),
            page_number: Some(2),
        };
        assert_eq!(page.to_string(), "ballot style 1 page 2");
        let style = MissingTemplate {
            page_number: None,
            ..page
        };
        assert_eq!(style.to_string(), "ballot style 1 (no pages)");
    }

    #[test]
    fn test_insert_rejects_bad_pages() {
        let election = two_page_election();
        let mut registry = TemplateRegistry::new(&election);
        assert_eq!(
            registry.insert(&election, layout(3, 3, 1)),
            Err(TemplateError::InvalidPageNumber {
                ballot_style_id: BallotStyleId::from("1"),
                page_number: 3,
                page_count: 2,
            })
        );
        assert!(matches!(
            registry.insert(&election, layout(0, 2, 1)),
            Err(TemplateError::InvalidPageNumber { page_number: 0, .. })
        ));

        registry.insert(&election, layout(1, 2, 2)).unwrap();
        assert!(matches!(
            registry.insert(&election, layout(1, 2, 2)),
            Err(TemplateError::Duplicate { page_number: 1, .. })
        ));

        let mut unknown = layout(1, 1, 1);
        unknown.ballot_image.metadata.ballot_style_id = BallotStyleId::from("99");
        assert_eq!(
            registry.insert(&election, unknown),
            Err(TemplateError::UnknownBallotStyle(BallotStyleId::from("99")))
        );
    }

    #[test]
    fn test_insert_after_finalize_fails() {
        let election = two_page_election();
        let mut registry = TemplateRegistry::new(&election);
        registry.finalize();
        assert!(registry.is_finalized());
        assert!(matches!(
            registry.insert(&election, layout(1, 2, 2)),
            Err(TemplateError::Finalized { page_number: 1, .. })
        ));
    }

    #[test]
    fn test_contests_for_template_follow_earlier_pages() {
        let election = two_page_election();
        let mut registry = TemplateRegistry::new(&election);
        registry.insert(&election, layout(1, 2, 2)).unwrap();
        registry.insert(&election, layout(2, 2, 1)).unwrap();

        let ids = |page_number| {
            let template = registry.get(&BallotStyleId::from("1"), page_number).unwrap();
            registry
                .contests_for_template(&election, template)
                .unwrap()
                .into_iter()
                .map(|contest| contest.id().to_string())
                .collect::<Vec<_>>()
        };
        assert_eq!(ids(1), vec!["contest-0", "contest-1"]);
        assert_eq!(ids(2), vec!["contest-2"]);
    }

    #[test]
    fn test_contests_for_template_with_too_many_contests() {
        let election = two_page_election();
        let mut registry = TemplateRegistry::new(&election);
        registry.insert(&election, layout(1, 2, 2)).unwrap();
        let template = layout(2, 2, 3);
        assert_eq!(
            registry.contests_for_template(&election, &template),
            Err(TemplateError::ContestCountMismatch {
                ballot_style_id: BallotStyleId::from("1"),
                page_number: 2,
                expected: 1,
                found: 3,
            })
        );
    }
}
