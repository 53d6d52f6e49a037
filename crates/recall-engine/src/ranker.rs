use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How a result list was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RankingMode {
    /// Vector and keyword channels fused.
    Hybrid,
    /// The vector channel was unavailable; ranked by keyword score alone.
    /// Callers should lower their confidence in these results.
    KeywordOnly,
}

/// Channel weights for score fusion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusionWeights {
    /// Weight of the normalized vector score.
    pub vector: f32,
    /// Weight of the normalized keyword score.
    pub text: f32,
}

impl Default for FusionWeights {
    fn default() -> Self {
        Self {
            vector: 0.6,
            text: 0.4,
        }
    }
}

/// One fused result with the per-channel scores that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RankedId {
    /// Item id.
    pub id: Uuid,
    /// Fused score in `[0, weight_v + weight_t]`.
    pub score: f32,
    /// Normalized vector score, if the id came back from the vector channel.
    pub vector_score: Option<f32>,
    /// Normalized keyword score, if the id came back from the text channel.
    pub text_score: Option<f32>,
}

/// Ordered fusion output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Ranking {
    /// Whether both channels contributed.
    pub mode: RankingMode,
    /// Best first; equal scores ordered by id ascending.
    pub hits: Vec<RankedId>,
}

impl Ranking {
    /// Ids in rank order.
    pub fn ids(&self) -> Vec<Uuid> {
        self.hits.iter().map(|h| h.id).collect()
    }

    /// Whether the result came from the keyword channel alone.
    pub fn is_degraded(&self) -> bool {
        self.mode == RankingMode::KeywordOnly
    }
}

/// Fuses vector and keyword results into one ranking.
///
/// Each channel is min-max normalized to `[0, 1]` on its own, then combined
/// as `w_v * vector + w_t * text`. An id missing from a channel scores 0
/// there. Passing `None` for the vector channel selects keyword-only mode,
/// where the normalized keyword score is the final score.
pub fn fuse(
    vector_results: Option<&[(Uuid, f32)]>,
    text_results: &[(Uuid, f32)],
    weights: FusionWeights,
) -> Ranking {
    let mut merged: BTreeMap<Uuid, (Option<f32>, Option<f32>)> = BTreeMap::new();

    let mode = match vector_results {
        Some(results) => {
            for (id, norm) in normalize(results) {
                merged.entry(id).or_default().0 = Some(norm);
            }
            RankingMode::Hybrid
        }
        None => RankingMode::KeywordOnly,
    };
    for (id, norm) in normalize(text_results) {
        merged.entry(id).or_default().1 = Some(norm);
    }

    let mut hits: Vec<RankedId> = merged
        .into_iter()
        .map(|(id, (vector_score, text_score))| {
            let score = match mode {
                RankingMode::Hybrid => {
                    weights.vector * vector_score.unwrap_or(0.0)
                        + weights.text * text_score.unwrap_or(0.0)
                }
                RankingMode::KeywordOnly => text_score.unwrap_or(0.0),
            };
            RankedId {
                id,
                score,
                vector_score,
                text_score,
            }
        })
        .collect();

    hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
    Ranking { mode, hits }
}

/// Fuses both channels and returns ids only.
pub fn rank(
    vector_results: &[(Uuid, f32)],
    text_results: &[(Uuid, f32)],
    weights: FusionWeights,
) -> Vec<Uuid> {
    fuse(Some(vector_results), text_results, weights).ids()
}

/// Min-max normalization. A channel whose scores are all equal maps to 1.0.
fn normalize(results: &[(Uuid, f32)]) -> Vec<(Uuid, f32)> {
    let mut min = f32::INFINITY;
    let mut max = f32::NEG_INFINITY;
    for (_, score) in results {
        min = min.min(*score);
        max = max.max(*score);
    }
    let span = max - min;
    results
        .iter()
        .map(|(id, score)| {
            let norm = if span > f32::EPSILON {
                (score - min) / span
            } else {
                1.0
            };
            (*id, norm.clamp(0.0, 1.0))
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = (0..n).map(|_| Uuid::new_v4()).collect();
        ids.sort();
        ids
    }

    #[test]
    fn test_single_channel_ids_are_kept() {
        let ids = ids(3);
        let vector = [(ids[0], 0.9), (ids[1], 0.5)];
        let text = [(ids[2], 4.0)];

        let ranking = fuse(Some(&vector), &text, FusionWeights::default());
        assert_eq!(ranking.mode, RankingMode::Hybrid);
        assert_eq!(ranking.hits.len(), 3);
        let only_text = ranking.hits.iter().find(|h| h.id == ids[2]).unwrap();
        assert_eq!(only_text.vector_score, None);
        assert!((only_text.score - 0.4).abs() < 1e-6);
    }

    #[test]
    fn test_weighted_combination() {
        let ids = ids(2);
        // a: best vector, worst text. b: worst vector, best text.
        let vector = [(ids[0], 0.9), (ids[1], 0.1)];
        let text = [(ids[0], 1.0), (ids[1], 3.0)];

        let vector_heavy = rank(&vector, &text, FusionWeights { vector: 0.8, text: 0.2 });
        assert_eq!(vector_heavy, vec![ids[0], ids[1]]);
        let text_heavy = rank(&vector, &text, FusionWeights { vector: 0.2, text: 0.8 });
        assert_eq!(text_heavy, vec![ids[1], ids[0]]);
    }

    #[test]
    fn test_ties_break_by_id_ascending() {
        let ids = ids(4);
        let text: Vec<(Uuid, f32)> = ids.iter().rev().map(|id| (*id, 2.0)).collect();
        let ranking = fuse(Some(&[]), &text, FusionWeights::default());
        assert_eq!(ranking.ids(), ids);
    }

    #[test]
    fn test_keyword_only_mode() {
        let ids = ids(2);
        let text = [(ids[1], 5.0), (ids[0], 1.0)];
        let ranking = fuse(None, &text, FusionWeights::default());
        assert!(ranking.is_degraded());
        assert_eq!(ranking.ids(), vec![ids[1], ids[0]]);
        assert!((ranking.hits[0].score - 1.0).abs() < 1e-6);
        assert!(ranking.hits.iter().all(|h| h.vector_score.is_none()));
    }

    #[test]
    fn test_empty_inputs() {
        assert!(rank(&[], &[], FusionWeights::default()).is_empty());
        assert!(fuse(None, &[], FusionWeights::default()).hits.is_empty());
    }

    #[test]
    fn test_normalization_bounds() {
        let ids = ids(3);
        let norm = normalize(&[(ids[0], -0.2), (ids[1], 0.4), (ids[2], 1.0)]);
        assert!((norm[0].1 - 0.0).abs() < 1e-6);
        assert!((norm[1].1 - 0.5).abs() < 1e-6);
        assert!((norm[2].1 - 1.0).abs() < 1e-6);
    }
}
