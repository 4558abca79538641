use base64::Engine;
use image::GrayImage;
use log::debug;
use logging_timer::time;
use serde::{Deserialize, Serialize};

use crate::election::{BallotStyleId, Election, PrecinctId};
use crate::geometry::Rect;
use crate::image_utils::{crop, WHITE};

pub const DEFAULT_PRIMARY_LOCALE: &str = "en-US";

/// Leading bytes of a binary ballot record.
pub const BALLOT_RECORD_MAGIC: &[u8; 2] = b"VP";
pub const BALLOT_RECORD_VERSION: u8 = 2;
const ELECTION_HASH_BYTES: usize = 10;
const PRECINCT_INDEX_BITS: u32 = 13;
const BALLOT_STYLE_INDEX_BITS: u32 = 13;
const PAGE_NUMBER_BITS: u32 = 5;
const BALLOT_TYPE_BITS: u32 = 4;

/// Size of each corner region searched for the QR code, as fractions of the
/// page width and height.
const QR_SEARCH_WIDTH_FRACTION: f32 = 0.4;
const QR_SEARCH_HEIGHT_FRACTION: f32 = 0.25;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BallotType {
    #[default]
    Standard,
    Absentee,
    Provisional,
}

impl BallotType {
    pub const fn code(self) -> u32 {
        match self {
            BallotType::Standard => 0,
            BallotType::Absentee => 1,
            BallotType::Provisional => 2,
        }
    }

    pub const fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(BallotType::Standard),
            1 => Some(BallotType::Absentee),
            2 => Some(BallotType::Provisional),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BallotLocales {
    pub primary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary: Option<String>,
}

impl Default for BallotLocales {
    fn default() -> Self {
        Self {
            primary: DEFAULT_PRIMARY_LOCALE.to_string(),
            secondary: None,
        }
    }
}

/// Identity of one page of one ballot style.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BallotPageMetadata {
    pub ballot_style_id: BallotStyleId,
    pub precinct_id: PrecinctId,
    pub is_test_mode: bool,
    pub page_number: u32,
    pub page_count: u32,
    pub locales: BallotLocales,
    pub election_hash: String,
    pub ballot_type: BallotType,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MetadataError {
    #[error("no QR code found in ballot image")]
    NotFound,

    #[error("QR code data is neither a ballot record nor a ballot URL")]
    UnrecognizedPayload,

    #[error("ballot URL is missing required parameter '{0}'")]
    MissingParameter(&'static str),

    #[error("invalid value for ballot URL parameter '{name}': {value:?}")]
    InvalidParameter { name: &'static str, value: String },

    #[error("ballot record is truncated")]
    Truncated,

    #[error("unsupported ballot record version: {0}")]
    UnsupportedVersion(u8),

    #[error("ballot record refers to unknown precinct index {0}")]
    UnknownPrecinctIndex(u32),

    #[error("ballot record refers to unknown ballot style index {0}")]
    UnknownBallotStyleIndex(u32),

    #[error("unknown ballot type code: {0}")]
    UnknownBallotType(u32),

    #[error("cannot encode {field} {value:?} in a ballot record")]
    Unencodable { field: &'static str, value: String },
}

/// Result of finding and decoding a QR code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QrCodeDetection {
    pub data: Vec<u8>,
    /// Orientation reported by the decoder, if it can tell.
    pub right_side_up: Option<bool>,
}

/// A QR code decoding backend.
pub trait DetectQrCode: Send + Sync {
    fn detect(&self, img: &GrayImage) -> Option<QrCodeDetection>;
}

/// Tries each backend in order, returning the first detection.
pub struct ChainedQrDetector {
    detectors: Vec<Box<dyn DetectQrCode>>,
}

impl ChainedQrDetector {
    pub fn new(detectors: Vec<Box<dyn DetectQrCode>>) -> Self {
        Self { detectors }
    }
}

impl DetectQrCode for ChainedQrDetector {
    fn detect(&self, img: &GrayImage) -> Option<QrCodeDetection> {
        self.detectors.iter().find_map(|detector| detector.detect(img))
    }
}

/// Decodes binary ballot records, i.e. payloads starting with
/// [`BALLOT_RECORD_MAGIC`].
pub trait MetadataCodec: Send + Sync {
    fn decode(&self, data: &[u8]) -> Result<BallotPageMetadata, MetadataError>;
}

/// Binary ballot record:
///
/// ```text
/// bytes 0..2    "VP"
/// byte  2       version (2)
/// bytes 3..13   election hash prefix
/// then, most significant bit first:
///   13 bits     precinct index
///   13 bits     ballot style index
///    5 bits     page number
///    1 bit      test mode
///    4 bits     ballot type
/// ```
///
/// Indexes refer to the election's precinct and ballot style lists. The
/// record does not carry a page count; it comes from the ballot style when
/// the election declares one and otherwise is taken to be the page number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactMetadataCodec {
    precincts: Vec<PrecinctId>,
    ballot_styles: Vec<(BallotStyleId, Option<u32>)>,
}

impl CompactMetadataCodec {
    pub fn new(election: &Election) -> Self {
        Self {
            precincts: election.precincts.iter().map(|p| p.id.clone()).collect(),
            ballot_styles: election
                .ballot_styles
                .iter()
                .map(|style| (style.id.clone(), style.page_count))
                .collect(),
        }
    }

    pub fn encode(&self, metadata: &BallotPageMetadata) -> Result<Vec<u8>, MetadataError> {
        let unencodable =
            |field: &'static str, value: String| MetadataError::Unencodable { field, value };

        let precinct_index = self
            .precincts
            .iter()
            .position(|id| id == &metadata.precinct_id)
            .ok_or_else(|| unencodable("precinct", metadata.precinct_id.to_string()))?;
        let ballot_style_index = self
            .ballot_styles
            .iter()
            .position(|(id, _)| id == &metadata.ballot_style_id)
            .ok_or_else(|| unencodable("ballot style", metadata.ballot_style_id.to_string()))?;
        let hash = decode_hex(&metadata.election_hash)
            .filter(|hash| hash.len() == ELECTION_HASH_BYTES)
            .ok_or_else(|| unencodable("election hash", metadata.election_hash.clone()))?;
        if metadata.page_number >= 1 << PAGE_NUMBER_BITS {
            return Err(unencodable("page number", metadata.page_number.to_string()));
        }

        let mut bytes = BALLOT_RECORD_MAGIC.to_vec();
        bytes.push(BALLOT_RECORD_VERSION);
        bytes.extend_from_slice(&hash);

        let mut bits = BitWriter::default();
        bits.write(precinct_index as u32, PRECINCT_INDEX_BITS);
        bits.write(ballot_style_index as u32, BALLOT_STYLE_INDEX_BITS);
        bits.write(metadata.page_number, PAGE_NUMBER_BITS);
        bits.write(u32::from(metadata.is_test_mode), 1);
        bits.write(metadata.ballot_type.code(), BALLOT_TYPE_BITS);
        bytes.extend(bits.finish());
        Ok(bytes)
    }
}

impl MetadataCodec for CompactMetadataCodec {
    fn decode(&self, data: &[u8]) -> Result<BallotPageMetadata, MetadataError> {
        let header_length = BALLOT_RECORD_MAGIC.len() + 1;
        if data.len() < header_length || !data.starts_with(BALLOT_RECORD_MAGIC) {
            return Err(MetadataError::UnrecognizedPayload);
        }

        let version = data[BALLOT_RECORD_MAGIC.len()];
        if version != BALLOT_RECORD_VERSION {
            return Err(MetadataError::UnsupportedVersion(version));
        }

        let hash = data
            .get(header_length..header_length + ELECTION_HASH_BYTES)
            .ok_or(MetadataError::Truncated)?;
        let mut bits = BitReader::new(&data[header_length + ELECTION_HASH_BYTES..]);
        let precinct_index = bits.read(PRECINCT_INDEX_BITS)?;
        let ballot_style_index = bits.read(BALLOT_STYLE_INDEX_BITS)?;
        let page_number = bits.read(PAGE_NUMBER_BITS)?;
        let is_test_mode = bits.read(1)? == 1;
        let ballot_type_code = bits.read(BALLOT_TYPE_BITS)?;

        let precinct_id = self
            .precincts
            .get(precinct_index as usize)
            .ok_or(MetadataError::UnknownPrecinctIndex(precinct_index))?;
        let (ballot_style_id, page_count) = self
            .ballot_styles
            .get(ballot_style_index as usize)
            .ok_or(MetadataError::UnknownBallotStyleIndex(ballot_style_index))?;
        let ballot_type = BallotType::from_code(ballot_type_code)
            .ok_or(MetadataError::UnknownBallotType(ballot_type_code))?;

        Ok(BallotPageMetadata {
            ballot_style_id: ballot_style_id.clone(),
            precinct_id: precinct_id.clone(),
            is_test_mode,
            page_number,
            page_count: page_count.unwrap_or(page_number),
            locales: BallotLocales::default(),
            election_hash: encode_hex(hash),
            ballot_type,
        })
    }
}

struct BitReader<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> BitReader<'a> {
    const fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    fn read(&mut self, bit_count: u32) -> Result<u32, MetadataError> {
        let mut value = 0;
        for _ in 0..bit_count {
            let byte = self
                .data
                .get(self.position / 8)
                .ok_or(MetadataError::Truncated)?;
            let bit = (byte >> (7 - self.position % 8)) & 1;
            value = (value << 1) | u32::from(bit);
            self.position += 1;
        }
        Ok(value)
    }
}

#[derive(Default)]
struct BitWriter {
    bytes: Vec<u8>,
    position: usize,
}

impl BitWriter {
    fn write(&mut self, value: u32, bit_count: u32) {
        for shift in (0..bit_count).rev() {
            if self.position % 8 == 0 {
                self.bytes.push(0);
            }
            let bit = ((value >> shift) & 1) as u8;
            if let Some(byte) = self.bytes.last_mut() {
                *byte |= bit << (7 - self.position % 8);
            }
            self.position += 1;
        }
    }

    fn finish(self) -> Vec<u8> {
        self.bytes
    }
}

fn encode_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

fn decode_hex(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok())
        .collect()
}

/// Decodes QR code data: a binary ballot record, a base64-encoded one, or a
/// ballot URL.
pub fn decode_metadata(
    data: &[u8],
    codec: &dyn MetadataCodec,
) -> Result<BallotPageMetadata, MetadataError> {
    if data.starts_with(BALLOT_RECORD_MAGIC) {
        return codec.decode(data);
    }

    let text = std::str::from_utf8(data)
        .map_err(|_| MetadataError::UnrecognizedPayload)?
        .trim();

    if let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(text) {
        if decoded.starts_with(BALLOT_RECORD_MAGIC) {
            return codec.decode(&decoded);
        }
    }

    if text.contains('?') {
        return parse_url_metadata(text);
    }

    Err(MetadataError::UnrecognizedPayload)
}

/// Parses ballot metadata from the query string of a ballot URL, e.g.
/// `https://ballot.page/?t=_&pr=23&bs=12&p=1-2&l1=en-US`.
pub fn parse_url_metadata(url: &str) -> Result<BallotPageMetadata, MetadataError> {
    let query = url
        .split_once('?')
        .map(|(_, query)| query)
        .ok_or(MetadataError::UnrecognizedPayload)?;
    let query = query.split_once('#').map_or(query, |(query, _)| query);
    let params = query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (percent_decode(key), percent_decode(value))
        })
        .collect::<Vec<_>>();
    let param = |name: &str| {
        params
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    };
    let required = |name: &'static str| param(name).ok_or(MetadataError::MissingParameter(name));

    let mode = required("t")?;
    let mut mode_chars = mode.chars();
    let is_test_mode = mode_chars.next() == Some('t');
    let ballot_type = match mode_chars.next() {
        Some('a') => BallotType::Absentee,
        Some('p') => BallotType::Provisional,
        _ => BallotType::Standard,
    };

    let precinct_id = PrecinctId::from(required("pr")?);
    let ballot_style_id = BallotStyleId::from(required("bs")?);

    let page = required("p")?;
    let invalid_page = || MetadataError::InvalidParameter {
        name: "p",
        value: page.to_string(),
    };
    let (page_number, page_count) = page.split_once('-').ok_or_else(invalid_page)?;
    let page_number = page_number.parse::<u32>().map_err(|_| invalid_page())?;
    let page_count = page_count.parse::<u32>().map_err(|_| invalid_page())?;
    if page_number == 0 || page_number > page_count {
        return Err(invalid_page());
    }

    Ok(BallotPageMetadata {
        ballot_style_id,
        precinct_id,
        is_test_mode,
        page_number,
        page_count,
        locales: BallotLocales {
            primary: param("l1")
                .filter(|locale| !locale.is_empty())
                .unwrap_or(DEFAULT_PRIMARY_LOCALE)
                .to_string(),
            secondary: param("l2")
                .filter(|locale| !locale.is_empty())
                .map(str::to_string),
        },
        election_hash: String::new(),
        ballot_type,
    })
}

fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => decoded.push(b' '),
            b'%' => match value
                .get(i + 1..i + 3)
                .and_then(|hex| u8::from_str_radix(hex, 16).ok())
            {
                Some(byte) => {
                    decoded.push(byte);
                    i += 2;
                }
                None => decoded.push(b'%'),
            },
            byte => decoded.push(byte),
        }
        i += 1;
    }
    String::from_utf8_lossy(&decoded).into_owned()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedMetadata {
    pub metadata: BallotPageMetadata,
    /// Whether the page is upside down and must be rotated 180°.
    pub flipped: bool,
}

/// Regions searched for the QR code, in order, with the orientation each
/// implies: bottom-right for an upright page, then top-left for one that is
/// upside down.
fn qr_search_regions(width: u32, height: u32) -> [(Rect, bool); 2] {
    let search_width =
        ((width as f32 * QR_SEARCH_WIDTH_FRACTION).round() as u32).clamp(1, width.max(1));
    let search_height =
        ((height as f32 * QR_SEARCH_HEIGHT_FRACTION).round() as u32).clamp(1, height.max(1));
    [
        (
            Rect::new(
                width.saturating_sub(search_width) as i32,
                height.saturating_sub(search_height) as i32,
                search_width,
                search_height,
            ),
            true,
        ),
        (Rect::new(0, 0, search_width, search_height), false),
    ]
}

/// Finds and decodes the page's QR code. A decoder-reported orientation
/// overrides the one implied by where the code was found.
#[time]
pub fn detect_metadata(
    img: &GrayImage,
    detector: &dyn DetectQrCode,
    codec: &dyn MetadataCodec,
) -> Result<DetectedMetadata, MetadataError> {
    for (bounds, implied_right_side_up) in qr_search_regions(img.width(), img.height()) {
        let region = crop(img, &bounds, WHITE);
        let Some(detection) = detector.detect(&region) else {
            debug!("no QR code found in {bounds:?}");
            continue;
        };

        let right_side_up = detection.right_side_up.unwrap_or(implied_right_side_up);
        debug!(
            "found QR code in {bounds:?} ({} byte(s), right side up: {right_side_up})",
            detection.data.len()
        );
        let metadata = decode_metadata(&detection.data, codec)?;
        return Ok(DetectedMetadata {
            metadata,
            flipped: !right_side_up,
        });
    }

    Err(MetadataError::NotFound)
}
