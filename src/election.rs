use serde::{Deserialize, Serialize};

use crate::types::idtype;

idtype!(ContestId);
idtype!(CandidateId);
idtype!(BallotStyleId);
idtype!(PrecinctId);
idtype!(DistrictId);
idtype!(PartyId);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Election {
    pub title: String,
    pub ballot_styles: Vec<BallotStyle>,
    pub precincts: Vec<Precinct>,
    pub contests: Vec<Contest>,
    pub mark_thresholds: Option<MarkThresholds>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BallotStyle {
    pub id: BallotStyleId,
    pub precincts: Vec<PrecinctId>,
    pub districts: Vec<DistrictId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub party_id: Option<PartyId>,
    /// Number of printed pages, when the election declares it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_count: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Precinct {
    pub id: PrecinctId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub id: CandidateId,
    pub name: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_write_in: bool,
}

impl Candidate {
    /// The placeholder recorded for a marked write-in slot.
    pub fn write_in(index: usize) -> Self {
        Self {
            id: CandidateId::from(format!("write-in-{index}")),
            name: "Write-In".to_string(),
            is_write_in: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum Contest {
    #[serde(rename_all = "camelCase", rename = "candidate")]
    Candidate {
        id: ContestId,
        district_id: DistrictId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        party_id: Option<PartyId>,
        title: String,
        seats: u32,
        candidates: Vec<Candidate>,
        allow_write_ins: bool,
    },

    #[serde(rename_all = "camelCase", rename = "yesno")]
    YesNo {
        id: ContestId,
        district_id: DistrictId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        party_id: Option<PartyId>,
        title: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
}

impl Contest {
    pub const fn id(&self) -> &ContestId {
        match self {
            Contest::Candidate { id, .. } | Contest::YesNo { id, .. } => id,
        }
    }

    pub const fn district_id(&self) -> &DistrictId {
        match self {
            Contest::Candidate { district_id, .. } | Contest::YesNo { district_id, .. } => {
                district_id
            }
        }
    }

    pub const fn party_id(&self) -> Option<&PartyId> {
        match self {
            Contest::Candidate { party_id, .. } | Contest::YesNo { party_id, .. } => {
                party_id.as_ref()
            }
        }
    }

    /// Number of targets printed for this contest: one per candidate plus
    /// one per seat when write-ins are allowed, or two for yes/no.
    pub fn expected_option_count(&self) -> usize {
        match self {
            Contest::Candidate {
                seats,
                candidates,
                allow_write_ins,
                ..
            } => candidates.len() + if *allow_write_ins { *seats as usize } else { 0 },
            Contest::YesNo { .. } => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkThresholds {
    pub definite: f32,
    pub marginal: f32,
}

impl Election {
    pub fn ballot_style(&self, id: &BallotStyleId) -> Option<&BallotStyle> {
        self.ballot_styles.iter().find(|style| &style.id == id)
    }

    pub fn precinct(&self, id: &PrecinctId) -> Option<&Precinct> {
        self.precincts.iter().find(|precinct| &precinct.id == id)
    }

    /// Contests appearing on a ballot style, in ballot order.
    pub fn contests_for_ballot_style(&self, ballot_style: &BallotStyle) -> Vec<&Contest> {
        self.contests
            .iter()
            .filter(|contest| {
                ballot_style.districts.contains(contest.district_id())
                    && contest.party_id() == ballot_style.party_id.as_ref()
            })
            .collect()
    }
}
