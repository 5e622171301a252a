//! Artist-set disambiguation and candidate filters used by the resolver.

use std::collections::HashSet;

use kchart_core::ServiceLocalId;

/// Outcome of comparing an album's artist set with per-artist candidate sets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtistSetMatch {
    /// `(artist index, reference artist id)` for every artist that pinned down
    /// exactly one album artist.
    Unique(Vec<(usize, ServiceLocalId)>),
    Ambiguous,
    None,
}

/// Compare the reference album's artist ids against the candidate id set of
/// each source artist.
///
/// Each candidate set may meet the album in at most one id; more than one is
/// ambiguous and empty intersections are ignored. The accepted single ids must
/// also be pairwise distinct, otherwise two source artists would collapse onto
/// the same reference artist.
pub fn compare_artist_sets(
    album_artists: &HashSet<ServiceLocalId>,
    candidate_sets: &[HashSet<ServiceLocalId>],
) -> ArtistSetMatch {
    let mut singles = Vec::new();
    for (idx, candidates) in candidate_sets.iter().enumerate() {
        let mut common = candidates.intersection(album_artists);
        match (common.next(), common.next()) {
            (None, _) => {}
            (Some(&id), None) => singles.push((idx, id)),
            (Some(_), Some(_)) => return ArtistSetMatch::Ambiguous,
        }
    }

    if singles.is_empty() {
        return ArtistSetMatch::None;
    }
    let distinct = singles.iter().map(|(_, id)| *id).collect::<HashSet<_>>();
    if distinct.len() != singles.len() {
        return ArtistSetMatch::Ambiguous;
    }
    ArtistSetMatch::Unique(singles)
}

/// Instrumental tracks are titled `Inst...` on every service.
pub fn is_instrumental(name: &str) -> bool {
    name.get(..4)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("inst"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(ids: &[ServiceLocalId]) -> HashSet<ServiceLocalId> {
        ids.iter().copied().collect()
    }

    #[test]
    fn disjoint_single_intersections_match() {
        let result = compare_artist_sets(&set(&[1, 2, 3]), &[set(&[1, 4]), set(&[2, 5])]);
        assert_eq!(result, ArtistSetMatch::Unique(vec![(0, 1), (1, 2)]));
    }

    #[test]
    fn wholly_ambiguous_sets_are_rejected() {
        let result = compare_artist_sets(&set(&[1, 2]), &[set(&[1, 2]), set(&[1, 2])]);
        assert_eq!(result, ArtistSetMatch::Ambiguous);
    }

    #[test]
    fn two_artists_collapsing_onto_one_id_is_ambiguous() {
        let result = compare_artist_sets(&set(&[1, 2]), &[set(&[1, 7]), set(&[1, 9])]);
        assert_eq!(result, ArtistSetMatch::Ambiguous);
    }

    #[test]
    fn overlap_is_rejected_for_three_artists() {
        let result = compare_artist_sets(
            &set(&[1, 2, 3]),
            &[set(&[1]), set(&[2, 8]), set(&[2, 9])],
        );
        assert_eq!(result, ArtistSetMatch::Ambiguous);
    }

    #[test]
    fn single_known_artist_matches() {
        let result = compare_artist_sets(&set(&[42]), &[set(&[42])]);
        assert_eq!(result, ArtistSetMatch::Unique(vec![(0, 42)]));
    }

    #[test]
    fn artists_outside_the_album_are_ignored() {
        let result = compare_artist_sets(&set(&[1, 2]), &[set(&[1]), set(&[30, 31])]);
        assert_eq!(result, ArtistSetMatch::Unique(vec![(0, 1)]));
    }

    #[test]
    fn no_intersection_is_no_match() {
        assert_eq!(
            compare_artist_sets(&set(&[1, 2]), &[set(&[3]), set(&[4])]),
            ArtistSetMatch::None
        );
        assert_eq!(compare_artist_sets(&set(&[1]), &[]), ArtistSetMatch::None);
    }

    #[test]
    fn instrumental_prefix_is_case_insensitive() {
        assert!(is_instrumental("Inst. Version"));
        assert!(is_instrumental("INSTRUMENTAL"));
        assert!(is_instrumental("inst"));
        assert!(!is_instrumental("LOVE DIVE (Inst.)"));
        assert!(!is_instrumental("Ins"));
        assert!(!is_instrumental("사랑 inst"));
    }
}
