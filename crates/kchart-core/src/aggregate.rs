//! Weighted merge of per-service hourly charts into one ranked chart.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::{AggregateEntry, ChartEntry, EntityId};

/// Points a chart position is worth before weighting: rank 1 earns 100.
const POINT_BASE: f64 = 101.0;
const POINT_SCALE: f64 = 100.0;

/// One component chart feeding an aggregate.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightedChart {
    pub chart_id: i64,
    pub weight: f64,
    pub entries: Vec<ChartEntry>,
}

#[derive(Debug, Default, Clone, Copy)]
struct ScoreAccumulator {
    points: f64,
    max_points: f64,
}

/// Score and rank every song found in `charts`.
///
/// A song scores `Σ w·(101 − pos) / Σ w·100` over the charts that list it, so a
/// song absent from a chart simply has no term for that chart. Charts are
/// summed in `chart_id` order so scores do not depend on the order the charts
/// were supplied in. Equal scores are ranked by ascending song id. Charts with
/// a non-positive or non-finite weight are ignored.
pub fn aggregate(charts: &[WeightedChart]) -> Vec<AggregateEntry> {
    let mut ordered: Vec<&WeightedChart> = charts
        .iter()
        .filter(|c| c.weight.is_finite() && c.weight > 0.0)
        .collect();
    ordered.sort_by_key(|c| c.chart_id);

    let mut scores: BTreeMap<EntityId, ScoreAccumulator> = BTreeMap::new();
    for chart in ordered {
        for entry in &chart.entries {
            let acc = scores.entry(entry.song_id).or_default();
            acc.points += chart.weight * (POINT_BASE - f64::from(entry.position));
            acc.max_points += chart.weight * POINT_SCALE;
        }
    }

    let mut ranked = scores
        .into_iter()
        .map(|(song_id, acc)| (song_id, acc.points / acc.max_points))
        .collect::<Vec<_>>();
    ranked.sort_by(|(song_a, score_a), (song_b, score_b)| {
        score_b
            .partial_cmp(score_a)
            .unwrap_or(Ordering::Equal)
            .then_with(|| song_a.cmp(song_b))
    });

    ranked
        .into_iter()
        .enumerate()
        .map(|(idx, (song_id, score))| AggregateEntry {
            song_id,
            position: idx as u32 + 1,
            score,
        })
        .collect()
}
