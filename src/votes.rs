use std::collections::BTreeMap;

use serde::Serialize;

use crate::election::{Candidate, ContestId};
use crate::geometry::{Offset, Rect};
use crate::layout::TargetShape;

/// Default score at or above which a mark counts as a vote.
pub const DEFAULT_MARK_SCORE_VOTE_THRESHOLD: f32 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum YesNoOption {
    Yes,
    No,
}

impl YesNoOption {
    /// Options in the order their targets are printed.
    pub const ALL: [YesNoOption; 2] = [YesNoOption::Yes, YesNoOption::No];
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum BallotMark {
    #[serde(rename_all = "camelCase", rename = "candidate")]
    Candidate {
        contest_id: ContestId,
        option: Candidate,
        score: f32,
        bounds: Rect,
        target: TargetShape,
        scored_offset: Offset,
    },

    #[serde(rename_all = "camelCase", rename = "yesno")]
    YesNo {
        contest_id: ContestId,
        option: YesNoOption,
        score: f32,
        bounds: Rect,
        target: TargetShape,
        scored_offset: Offset,
    },

    #[serde(rename_all = "camelCase", rename = "stray")]
    Stray {
        bounds: Rect,
        #[serde(skip_serializing_if = "Option::is_none")]
        contest_id: Option<ContestId>,
    },
}

impl BallotMark {
    pub fn score(&self) -> Option<f32> {
        match self {
            BallotMark::Candidate { score, .. } | BallotMark::YesNo { score, .. } => Some(*score),
            BallotMark::Stray { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Vote {
    Candidates(Vec<Candidate>),
    YesNo(Vec<YesNoOption>),
}

pub type VotesDict = BTreeMap<ContestId, Vote>;

/// Collects the votes cast by `marks`. Contests without a vote are absent.
/// Both yes and no are kept when both are marked.
pub fn get_votes_from_marks(marks: &[BallotMark], threshold: f32) -> VotesDict {
    let mut votes = VotesDict::new();

    for mark in marks {
        match mark {
            BallotMark::Candidate {
                contest_id,
                option,
                score,
                ..
            } if *score >= threshold => {
                if let Vote::Candidates(candidates) = votes
                    .entry(contest_id.clone())
                    .or_insert_with(|| Vote::Candidates(vec![]))
                {
                    candidates.push(option.clone());
                }
            }

            BallotMark::YesNo {
                contest_id,
                option,
                score,
                ..
            } if *score >= threshold => {
                if let Vote::YesNo(options) = votes
                    .entry(contest_id.clone())
                    .or_insert_with(|| Vote::YesNo(vec![]))
                {
                    options.push(*option);
                }
            }

            _ => {}
        }
    }

    votes
}
