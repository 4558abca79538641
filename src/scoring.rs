use image::GrayImage;
use serde::Serialize;

use crate::geometry::{Offset, Rect};
use crate::image_utils::{count_pixels, crop, diff, outline, BLACK, WHITE};
use crate::layout::TargetShape;

/// Shifts tried when comparing a ballot target against its template. The
/// first is no shift at all.
pub const SCORE_OFFSETS: [Offset; 5] = [
    Offset::new(0, 0),
    Offset::new(1, 0),
    Offset::new(-1, 0),
    Offset::new(0, 1),
    Offset::new(0, -1),
];

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkScore {
    pub score: f32,
    pub offset: Offset,
}

/// Scores how much of `target` was filled in on `ballot`, a page already
/// mapped onto `template`'s pixel grid.
///
/// The score is the fraction of fillable template pixels inside the target
/// that are newly dark on the ballot. Template pixels are dilated by one
/// pixel first so that printed edges never count. The ballot is compared at
/// each of [`SCORE_OFFSETS`] and the lowest score wins, so a mark only scores
/// well if it is there however the page is nudged.
pub fn target_mark_score(
    template: &GrayImage,
    ballot: &GrayImage,
    target: &TargetShape,
) -> MarkScore {
    let fillable = count_pixels(&outline(&crop(template, &target.inner, WHITE)), &WHITE);
    if fillable == 0 {
        return MarkScore {
            score: 0.0,
            offset: SCORE_OFFSETS[0],
        };
    }

    let outlined_target = outline(&crop(template, &target.bounds, WHITE));
    let template_inner = crop(
        &outlined_target,
        &Rect::new(
            target.inner.x - target.bounds.x,
            target.inner.y - target.bounds.y,
            target.inner.width,
            target.inner.height,
        ),
        WHITE,
    );

    let mut best: Option<MarkScore> = None;
    for offset in SCORE_OFFSETS {
        let ballot_inner = crop(ballot, &target.inner.offset(offset.x, offset.y), WHITE);
        let new_black = count_pixels(&diff(&template_inner, &ballot_inner), &BLACK);
        let score = new_black as f32 / fillable as f32;
        if best.map_or(true, |best| score < best.score) {
            best = Some(MarkScore { score, offset });
        }
    }

    best.unwrap_or(MarkScore {
        score: 0.0,
        offset: SCORE_OFFSETS[0],
    })
}
