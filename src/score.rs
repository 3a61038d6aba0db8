//! Per-read scoring against one filter group.
//!
//! Standard mode runs two phases per filter: a cheap screening pass over
//! strict non-overlapping tiles (only when `min_hit` is set), then a dense
//! scan whose streak schedule gives partial credit for an isolated hit and
//! asymptotically full credit for consecutive hits. `min_hit_only` mode is
//! the screening tiling alone, batched across the whole group.

use crate::kmer::KmerProcessor;
use crate::multi::FilterGroup;

#[derive(Debug, Clone)]
pub struct ScoreParams {
    /// Match threshold in [0, 1]; 1.0 switches the classifier to best-hit.
    pub score_threshold: f64,
    /// Tiling hits required to enter the dense scan; 0 bypasses the gate.
    pub min_hit: u32,
    /// Streak length at which a miss jumps a whole tile instead of one base.
    pub streak_threshold: u32,
    /// Screening tiling only; ignores the three fields above.
    pub min_hit_only: bool,
}

impl Default for ScoreParams {
    fn default() -> Self {
        ScoreParams {
            score_threshold: 0.15,
            min_hit: 0,
            streak_threshold: 3,
            min_hit_only: false,
        }
    }
}

/// First scan position, centering the strict tiling on the read.
#[inline]
pub fn tiling_start(seq_len: usize, kmer_size: usize) -> usize {
    (seq_len % kmer_size) / 2
}

/// Hit-count denominator mapping scores into [0, 1].
#[inline]
pub fn normalization(seq_len: usize, kmer_size: usize) -> f64 {
    seq_len.saturating_sub(kmer_size - 1).max(1) as f64
}

/// Score one read against every filter of `group`, writing normalized
/// scores into `hits` (one slot per member, in id order, pre-zeroed).
///
/// Reads shorter than the window leave every score at 0.
pub fn score_read(
    seq: &[u8],
    group: &FilterGroup,
    proc: &mut KmerProcessor,
    params: &ScoreParams,
    hash_scratch: &mut Vec<u64>,
    hits: &mut [f64],
) {
    debug_assert_eq!(hits.len(), group.len());
    let k = group.kmer_size();
    if seq.len() < k {
        return;
    }
    let norm = normalization(seq.len(), k);

    if params.min_hit_only {
        let mut loc = tiling_start(seq.len(), k);
        while loc + k <= seq.len() {
            if let Some(kmer) = proc.prep_seq(seq, loc) {
                group.prehash(kmer, hash_scratch);
                for (slot, filter) in hits.iter_mut().zip(group.filters()) {
                    if filter.contains_prehashed(hash_scratch) {
                        *slot += 1.0;
                    }
                }
            }
            loc += k;
        }
        for slot in hits.iter_mut() {
            *slot /= norm;
        }
        return;
    }

    let threshold = params.score_threshold * norm;

    for (slot, filter) in hits.iter_mut().zip(group.filters()) {
        // Phase 1: screening gate over strict tiles
        if params.min_hit > 0 {
            let mut screening_hits = 0u32;
            let mut loc = tiling_start(seq.len(), k);
            let mut pass = false;
            while loc + k <= seq.len() {
                if let Some(kmer) = proc.prep_seq(seq, loc) {
                    if filter.contains(kmer) {
                        screening_hits += 1;
                        if screening_hits >= params.min_hit {
                            pass = true;
                            break;
                        }
                    }
                }
                loc += k;
            }
            if !pass {
                continue;
            }
        }

        // Phase 2: streak-aware dense scan
        let mut loc = 0usize;
        let mut score = 0.0f64;
        let mut streak = 0u32;
        while loc + k <= seq.len() {
            match proc.prep_seq(seq, loc) {
                None => {
                    // the next valid window cannot start inside the
                    // ambiguous region
                    loc += k + 1;
                    streak = 0;
                }
                Some(kmer) => {
                    if filter.contains(kmer) {
                        streak += 1;
                        score += if streak == 1 {
                            0.5
                        } else {
                            1.0 - 1.0 / (2.0 * f64::from(streak))
                        };
                        loc += 1;
                        if streak > 1 && score >= threshold {
                            break;
                        }
                    } else {
                        if streak == 0 || streak < params.streak_threshold {
                            loc += 1;
                        } else {
                            loc += k;
                        }
                        streak = 0;
                    }
                }
            }
        }
        *slot = score / norm;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bloom::BloomFilter;
    use crate::info::FilterInfo;
    use crate::multi::load_filters;
    use crate::multi::FilterSet;

    const K: usize = 5;

    /// Filter containing every window of `reference`, loaded through the
    /// normal path so the group wiring is exercised too.
    fn set_from_references(refs: &[(&str, &[u8])]) -> FilterSet {
        let dir = tempfile::tempdir().unwrap();
        let mut paths = Vec::new();
        for (id, reference) in refs {
            let mut bf = BloomFilter::new(1 << 16, 3, K).unwrap();
            let mut proc = KmerProcessor::new(K);
            for pos in 0..=reference.len() - K {
                if let Some(kmer) = proc.prep_seq(reference, pos) {
                    bf.insert(kmer);
                }
            }
            let bf_path = dir.path().join(format!("{}.bf", id));
            bf.store(&bf_path).unwrap();
            FilterInfo {
                filter_id: id.to_string(),
                kmer_size: K,
                hash_num: 3,
                filter_size: 1 << 16,
            }
            .store(&FilterInfo::sidecar_path(&bf_path))
            .unwrap();
            paths.push(bf_path);
        }
        load_filters(&paths).unwrap()
    }

    fn score_one(seq: &[u8], set: &FilterSet, params: &ScoreParams) -> Vec<f64> {
        let group = &set.groups()[0];
        let mut proc = KmerProcessor::new(group.kmer_size());
        let mut scratch = Vec::new();
        let mut hits = vec![0.0; group.len()];
        score_read(seq, group, &mut proc, params, &mut scratch, &mut hits);
        hits
    }

    #[test]
    fn read_from_reference_scores_high() {
        let reference: &[u8] = b"ACGGTTAACCGGTTACACGTGGCCAATT";
        let set = set_from_references(&[("a", reference)]);
        let hits = score_one(&reference[2..22], &set, &ScoreParams::default());
        assert!(hits[0] >= 0.15, "score {} below threshold", hits[0]);
        assert!(hits[0] <= 1.0 + 1e-9);
    }

    #[test]
    fn short_read_scores_zero() {
        let set = set_from_references(&[("a", &b"ACGGTTAACCGG"[..])]);
        let hits = score_one(b"ACG", &set, &ScoreParams::default());
        assert_eq!(hits[0], 0.0);
    }

    #[test]
    fn foreign_read_scores_zero_with_empty_filter() {
        // an empty filter can produce no hits at all
        let dir = tempfile::tempdir().unwrap();
        let bf = BloomFilter::new(1 << 16, 3, K).unwrap();
        let bf_path = dir.path().join("empty.bf");
        bf.store(&bf_path).unwrap();
        FilterInfo {
            filter_id: "empty".to_string(),
            kmer_size: K,
            hash_num: 3,
            filter_size: 1 << 16,
        }
        .store(&FilterInfo::sidecar_path(&bf_path))
        .unwrap();
        let set = load_filters(&[bf_path]).unwrap();
        let hits = score_one(b"ACGTACGTACGTACGTACGT", &set, &ScoreParams::default());
        assert_eq!(hits[0], 0.0);
    }

    #[test]
    fn early_accept_reports_at_least_threshold() {
        let reference: &[u8] = b"ACGGTTAACCGGTTACACGTGGCCAATT";
        let set = set_from_references(&[("a", reference)]);
        let params = ScoreParams {
            score_threshold: 0.3,
            ..ScoreParams::default()
        };
        let hits = score_one(reference, &set, &params);
        assert!(hits[0] >= 0.3);
    }

    #[test]
    fn min_hit_gate_blocks_sparse_matches() {
        let reference: &[u8] = b"ACGGTTAACCGGTTACACGTGGCCAATT";
        let set = set_from_references(&[("a", reference)]);
        // a read sharing nothing with the reference cannot reach the gate
        let params = ScoreParams {
            min_hit: 1,
            ..ScoreParams::default()
        };
        let hits = score_one(b"AAAAAAAAAAAAAAAAAAAAAAAA", &set, &params);
        assert_eq!(hits[0], 0.0);
    }

    #[test]
    fn min_hit_only_counts_tiles() {
        let reference: &[u8] = b"ACGGTTAACCGGTTACACGTGGCCAATT";
        let set = set_from_references(&[("a", reference)]);
        let params = ScoreParams {
            min_hit_only: true,
            ..ScoreParams::default()
        };
        let read = &reference[0..20];
        let hits = score_one(read, &set, &params);
        // 4 strict tiles out of N = 16 possible windows
        assert!((hits[0] - 4.0 / 16.0).abs() < 1e-9);
    }

    #[test]
    fn ambiguous_windows_are_skipped_not_fatal() {
        let reference: &[u8] = b"ACGGTTAACCGGTTACACGTGGCCAATT";
        let set = set_from_references(&[("a", reference)]);
        let mut read = reference[0..20].to_vec();
        read[10] = b'N';
        let hits = score_one(&read, &set, &ScoreParams::default());
        assert!(hits[0] >= 0.0 && hits[0] <= 1.0 + 1e-9);
    }
}
