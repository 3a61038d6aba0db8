//! Read-stream orchestration and category reduction.
//!
//! The sequential reader fills batches of read units (reads or pairs); a
//! rayon pool scores each batch with per-worker scratch; the serial
//! epilogue updates the counters and writes sinks, so mate files stay
//! position-aligned and summary counts stay exact.

use std::hash::BuildHasherDefault;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use hashbrown::HashMap;
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use rustc_hash::FxHasher;

use crate::error::SieveError;
use crate::io::{write_formatted, OutputFormat, ReadRecord, RecordStream, SinkSet};
use crate::kmer::KmerProcessor;
use crate::multi::FilterSet;
use crate::results::{Category, ResultsManager};
use crate::score::{score_read, ScoreParams};

type FastHashMap<K, V> = HashMap<K, V, BuildHasherDefault<FxHasher>>;

// read units handed to the worker pool per dispatch
const BATCH_SIZE: usize = 4096;
const PROGRESS_INTERVAL: u64 = 1_000_000;

#[derive(Debug, Clone)]
pub struct ClassifyConfig {
    pub params: ScoreParams,
    /// Earlier filters win multi-matches instead of `multiMatch`.
    pub ordered: bool,
    /// Paired reduction keeps a pair when either mate matches.
    pub inclusive: bool,
    /// Append the winning score to output read ids.
    pub with_score: bool,
    /// Reads shorter than this are discarded before scoring.
    pub min_length: usize,
    /// Discard unchaste reads.
    pub chastity: bool,
    pub threads: usize,
    /// Global indices of the collaborative subset, ascending.
    pub collab: Option<Vec<usize>>,
    /// Reads categorized as this filter also go to stdout as FASTQ.
    pub main_filter: Option<usize>,
}

enum ReadUnit {
    Single(ReadRecord),
    Pair(ReadRecord, ReadRecord),
}

/// Worker verdict for one unit. `score2` is only meaningful for pairs.
struct Verdict {
    category: Category,
    score1: f64,
    score2: f64,
}

/// Per-worker scratch, allocated once per worker rather than per read.
struct WorkerScratch {
    procs: Vec<KmerProcessor>,
    hashes: Vec<u64>,
    hits1: Vec<f64>,
    hits2: Vec<f64>,
}

impl WorkerScratch {
    fn new(set: &FilterSet) -> Self {
        WorkerScratch {
            procs: set
                .groups()
                .iter()
                .map(|g| KmerProcessor::new(g.kmer_size()))
                .collect(),
            hashes: Vec::new(),
            hits1: vec![0.0; set.num_filters()],
            hits2: vec![0.0; set.num_filters()],
        }
    }
}

pub struct Classifier {
    set: FilterSet,
    cfg: ClassifyConfig,
}

impl Classifier {
    pub fn new(set: FilterSet, cfg: ClassifyConfig) -> Self {
        Classifier { set, cfg }
    }

    // ------------------------------
    // Reduction
    // ------------------------------

    // best-hit applies in min_hit_only mode too: scores are hits/N there
    #[inline]
    fn best_hit_mode(&self) -> bool {
        self.cfg.params.score_threshold >= 1.0
    }

    #[inline]
    fn qualifies(&self, score: f64) -> bool {
        if self.cfg.params.min_hit_only {
            score > 0.0
        } else {
            score > 0.0 && score >= self.cfg.params.score_threshold
        }
    }

    /// Highest score wins; ties break to the earlier filter. A read with
    /// no hits anywhere is still `noMatch`.
    fn best_hit(scores: impl Iterator<Item = f64>) -> Category {
        let mut winner = 0usize;
        let mut best = f64::NEG_INFINITY;
        for (i, score) in scores.enumerate() {
            if score > best {
                best = score;
                winner = i;
            }
        }
        if best > 0.0 {
            Category::Filter(winner)
        } else {
            Category::NoMatch
        }
    }

    /// Reduce one hit vector to a category.
    fn reduce(&self, hits: &[f64]) -> Category {
        if self.best_hit_mode() {
            return Self::best_hit(hits.iter().copied());
        }

        if let Some(subset) = &self.cfg.collab {
            // combined score of the declared subset; the top contributor
            // takes the call
            let sum: f64 = subset.iter().map(|&i| hits[i]).sum();
            if !self.qualifies(sum) {
                return Category::NoMatch;
            }
            let mut winner = subset[0];
            for &i in subset {
                if hits[i] > hits[winner] {
                    winner = i;
                }
            }
            return Category::Filter(winner);
        }

        let mut winner = None;
        let mut qualifiers = 0usize;
        for (i, &score) in hits.iter().enumerate() {
            if self.qualifies(score) {
                qualifiers += 1;
                if winner.is_none() {
                    winner = Some(i);
                }
                if self.cfg.ordered {
                    // first qualifier in insertion order wins outright
                    break;
                }
            }
        }
        match (qualifiers, winner) {
            (0, _) => Category::NoMatch,
            (1, Some(i)) => Category::Filter(i),
            (_, Some(i)) if self.cfg.ordered => Category::Filter(i),
            _ => Category::MultiMatch,
        }
    }

    /// Combine the per-mate categories of a pair.
    fn reduce_pair(&self, hits1: &[f64], hits2: &[f64]) -> Category {
        if self.best_hit_mode() {
            // rank by summed mate scores
            return Self::best_hit(hits1.iter().zip(hits2).map(|(a, b)| a + b));
        }
        let c1 = self.reduce(hits1);
        let c2 = self.reduce(hits2);
        if c1 == c2 {
            return c1;
        }
        if self.cfg.inclusive {
            match (c1, c2) {
                (Category::NoMatch, other) | (other, Category::NoMatch) => other,
                _ => Category::MultiMatch,
            }
        } else {
            match (c1, c2) {
                (Category::NoMatch, _) | (_, Category::NoMatch) => Category::NoMatch,
                _ => Category::MultiMatch,
            }
        }
    }

    /// Score to report for a unit: the winner's, or the best seen.
    fn report_score(category: Category, hits: &[f64]) -> f64 {
        match category {
            Category::Filter(i) => hits[i],
            _ => hits.iter().copied().fold(0.0, f64::max),
        }
    }

    // ------------------------------
    // Scoring
    // ------------------------------

    fn score_all(
        &self,
        procs: &mut [KmerProcessor],
        hashes: &mut Vec<u64>,
        seq: &[u8],
        hits: &mut [f64],
    ) {
        hits.fill(0.0);
        for (group, proc) in self.set.groups().iter().zip(procs) {
            let range = group.offset()..group.offset() + group.len();
            score_read(seq, group, proc, &self.cfg.params, hashes, &mut hits[range]);
        }
    }

    fn classify_unit(&self, scratch: &mut WorkerScratch, unit: &ReadUnit) -> Verdict {
        let WorkerScratch {
            procs,
            hashes,
            hits1,
            hits2,
        } = scratch;
        match unit {
            ReadUnit::Single(rec) => {
                self.score_all(procs, hashes, &rec.seq, hits1);
                let category = self.reduce(hits1);
                Verdict {
                    category,
                    score1: Self::report_score(category, hits1),
                    score2: 0.0,
                }
            }
            ReadUnit::Pair(rec1, rec2) => {
                self.score_all(procs, hashes, &rec1.seq, hits1);
                self.score_all(procs, hashes, &rec2.seq, hits2);
                let category = self.reduce_pair(hits1, hits2);
                Verdict {
                    category,
                    score1: Self::report_score(category, hits1),
                    score2: Self::report_score(category, hits2),
                }
            }
        }
    }

    fn classify_batch(&self, pool: &rayon::ThreadPool, batch: &[ReadUnit]) -> Vec<Verdict> {
        pool.install(|| {
            batch
                .par_iter()
                .map_init(
                    || WorkerScratch::new(&self.set),
                    |scratch, unit| self.classify_unit(scratch, unit),
                )
                .collect()
        })
    }

    // ------------------------------
    // Stream drivers
    // ------------------------------

    fn build_pool(&self) -> Result<rayon::ThreadPool> {
        ThreadPoolBuilder::new()
            .num_threads(self.cfg.threads.max(1))
            .build()
            .context("build worker thread pool")
    }

    /// Discard filters applied before a unit is counted.
    fn keep_record(&self, rec: &ReadRecord) -> bool {
        if rec.seq.len() < self.cfg.min_length {
            return false;
        }
        !(self.cfg.chastity && rec.is_unchaste())
    }

    fn drain_batch(
        &self,
        batch: &[ReadUnit],
        verdicts: &[Verdict],
        results: &mut ResultsManager,
        mut sinks: Option<&mut SinkSet>,
        stdout_sink: &mut Option<BufWriter<io::Stdout>>,
        total: &mut u64,
    ) -> Result<()> {
        let num_filters = self.set.num_filters();
        for (unit, verdict) in batch.iter().zip(verdicts) {
            results.record(verdict.category);
            *total += 1;
            if *total % PROGRESS_INTERVAL == 0 {
                eprintln!("processed {} read units", total);
            }

            let to_main = matches!(
                (self.cfg.main_filter, verdict.category),
                (Some(main), Category::Filter(i)) if main == i
            );

            match unit {
                ReadUnit::Single(rec) => {
                    let score = self.cfg.with_score.then_some(verdict.score1);
                    if let Some(sinks) = sinks.as_deref_mut() {
                        sinks.write_single(verdict.category, num_filters, rec, score)?;
                    }
                    if to_main {
                        if let Some(out) = stdout_sink.as_mut() {
                            write_formatted(out, OutputFormat::Fastq, rec, None)?;
                        }
                    }
                }
                ReadUnit::Pair(rec1, rec2) => {
                    let score1 = self.cfg.with_score.then_some(verdict.score1);
                    let score2 = self.cfg.with_score.then_some(verdict.score2);
                    if let Some(sinks) = sinks.as_deref_mut() {
                        sinks.write_pair(
                            verdict.category,
                            num_filters,
                            rec1,
                            rec2,
                            score1,
                            score2,
                        )?;
                    }
                    if to_main {
                        if let Some(out) = stdout_sink.as_mut() {
                            // interleaved on stdout
                            write_formatted(out, OutputFormat::Fastq, rec1, None)?;
                            write_formatted(out, OutputFormat::Fastq, rec2, None)?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn stdout_sink(&self) -> Option<BufWriter<io::Stdout>> {
        self.cfg.main_filter.map(|_| BufWriter::new(io::stdout()))
    }

    /// Single-end categorization over one or more input files.
    pub fn run_single(
        &self,
        inputs: &[PathBuf],
        results: &mut ResultsManager,
        mut sinks: Option<&mut SinkSet>,
    ) -> Result<()> {
        let pool = self.build_pool()?;
        let mut stdout_sink = self.stdout_sink();
        let mut total = 0u64;

        for path in inputs {
            let mut stream = RecordStream::open(path)?;
            let mut eof = false;
            while !eof {
                let mut batch = Vec::with_capacity(BATCH_SIZE);
                while batch.len() < BATCH_SIZE {
                    match stream.next_record()? {
                        None => {
                            eof = true;
                            break;
                        }
                        Some(rec) => {
                            if self.keep_record(&rec) {
                                batch.push(ReadUnit::Single(rec));
                            }
                        }
                    }
                }
                if batch.is_empty() {
                    continue;
                }
                let verdicts = self.classify_batch(&pool, &batch);
                self.drain_batch(
                    &batch,
                    &verdicts,
                    results,
                    sinks.as_deref_mut(),
                    &mut stdout_sink,
                    &mut total,
                )?;
            }
        }

        if let Some(out) = stdout_sink.as_mut() {
            out.flush()?;
        }
        Ok(())
    }

    /// Paired categorization over two lockstep files.
    pub fn run_paired(
        &self,
        file1: &Path,
        file2: &Path,
        results: &mut ResultsManager,
        mut sinks: Option<&mut SinkSet>,
    ) -> Result<()> {
        let pool = self.build_pool()?;
        let mut stdout_sink = self.stdout_sink();
        let mut total = 0u64;

        let mut stream1 = RecordStream::open(file1)?;
        let mut stream2 = RecordStream::open(file2)?;
        let mut eof = false;
        while !eof {
            let mut batch = Vec::with_capacity(BATCH_SIZE);
            while batch.len() < BATCH_SIZE {
                match (stream1.next_record()?, stream2.next_record()?) {
                    (None, None) => {
                        eof = true;
                        break;
                    }
                    (Some(_), None) | (None, Some(_)) => {
                        eprintln!(
                            "warning: {:?} and {:?} have different lengths; trailing reads ignored",
                            file1, file2
                        );
                        eof = true;
                        break;
                    }
                    (Some(rec1), Some(rec2)) => {
                        if rec1.pair_prefix() != rec2.pair_prefix() {
                            return Err(SieveError::PairMismatch {
                                id1: rec1.id().to_string(),
                                id2: rec2.id().to_string(),
                            }
                            .into());
                        }
                        if self.keep_record(&rec1) && self.keep_record(&rec2) {
                            batch.push(ReadUnit::Pair(rec1, rec2));
                        }
                    }
                }
            }
            if batch.is_empty() {
                continue;
            }
            let verdicts = self.classify_batch(&pool, &batch);
            self.drain_batch(
                &batch,
                &verdicts,
                results,
                sinks.as_deref_mut(),
                &mut stdout_sink,
                &mut total,
            )?;
        }

        if let Some(out) = stdout_sink.as_mut() {
            out.flush()?;
        }
        Ok(())
    }

    /// Paired categorization over one interleaved stream. Mates may arrive
    /// in any order; a pending map holds the first-seen mate until its
    /// partner shows up, so poorly ordered input costs memory.
    pub fn run_interleaved(
        &self,
        file: &Path,
        results: &mut ResultsManager,
        mut sinks: Option<&mut SinkSet>,
    ) -> Result<()> {
        let pool = self.build_pool()?;
        let mut stdout_sink = self.stdout_sink();
        let mut total = 0u64;

        let mut stream = RecordStream::open(file)?;
        let mut pending: FastHashMap<String, ReadRecord> = FastHashMap::default();
        let mut eof = false;
        while !eof {
            let mut batch = Vec::with_capacity(BATCH_SIZE);
            while batch.len() < BATCH_SIZE {
                match stream.next_record()? {
                    None => {
                        eof = true;
                        break;
                    }
                    Some(rec) => {
                        let key = rec.pair_prefix().to_string();
                        if let Some(first) = pending.remove(&key) {
                            let (rec1, rec2) = if rec.mate_num() == Some(1) {
                                (rec, first)
                            } else {
                                (first, rec)
                            };
                            if self.keep_record(&rec1) && self.keep_record(&rec2) {
                                batch.push(ReadUnit::Pair(rec1, rec2));
                            }
                        } else {
                            pending.insert(key, rec);
                        }
                    }
                }
            }
            if batch.is_empty() {
                continue;
            }
            let verdicts = self.classify_batch(&pool, &batch);
            self.drain_batch(
                &batch,
                &verdicts,
                results,
                sinks.as_deref_mut(),
                &mut stdout_sink,
                &mut total,
            )?;
        }

        if !pending.is_empty() {
            eprintln!(
                "warning: {} read(s) in {:?} never saw a mate",
                pending.len(),
                file
            );
        }
        if let Some(out) = stdout_sink.as_mut() {
            out.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bloom::BloomFilter;
    use crate::info::FilterInfo;
    use crate::multi::load_filters;

    const K: usize = 5;

    fn test_set(refs: &[(&str, &[u8])]) -> FilterSet {
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
            let path = dir.path().join(format!("{}.bf", id));
            bf.store(&path).unwrap();
            FilterInfo {
                filter_id: id.to_string(),
                kmer_size: K,
                hash_num: 3,
                filter_size: 1 << 16,
            }
            .store(&FilterInfo::sidecar_path(&path))
            .unwrap();
            paths.push(path);
        }
        load_filters(&paths).unwrap()
    }

    fn classifier(refs: &[(&str, &[u8])], cfg: ClassifyConfig) -> Classifier {
        Classifier::new(test_set(refs), cfg)
    }

    fn default_cfg() -> ClassifyConfig {
        ClassifyConfig {
            params: ScoreParams::default(),
            ordered: false,
            inclusive: false,
            with_score: false,
            min_length: 0,
            chastity: false,
            threads: 1,
            collab: None,
            main_filter: None,
        }
    }

    #[test]
    fn single_qualifier_wins() {
        let refs: &[(&str, &[u8])] = &[("a", b"ACGGTTAACCGGTTACACGT")];
        let c = classifier(refs, default_cfg());
        assert_eq!(c.reduce(&[0.5]), Category::Filter(0));
        assert_eq!(c.reduce(&[0.0]), Category::NoMatch);
        assert_eq!(c.reduce(&[0.1]), Category::NoMatch);
    }

    #[test]
    fn two_qualifiers_multi_match_unless_ordered() {
        let refs: &[(&str, &[u8])] =
            &[("a", b"ACGGTTAACCGGTTACACGT"), ("b", b"TTACACGTGGCCAATTGGCC")];
        let c = classifier(refs, default_cfg());
        assert_eq!(c.reduce(&[0.5, 0.4]), Category::MultiMatch);

        let mut cfg = default_cfg();
        cfg.ordered = true;
        let c = classifier(refs, cfg);
        assert_eq!(c.reduce(&[0.5, 0.4]), Category::Filter(0));
        assert_eq!(c.reduce(&[0.0, 0.4]), Category::Filter(1));
    }

    #[test]
    fn best_hit_breaks_ties_by_insertion_order() {
        let refs: &[(&str, &[u8])] =
            &[("a", b"ACGGTTAACCGGTTACACGT"), ("b", b"TTACACGTGGCCAATTGGCC")];
        let mut cfg = default_cfg();
        cfg.params.score_threshold = 1.0;
        let c = classifier(refs, cfg);
        assert_eq!(c.reduce(&[0.6, 0.6]), Category::Filter(0));
        assert_eq!(c.reduce(&[0.2, 0.6]), Category::Filter(1));
        assert_eq!(c.reduce(&[0.0, 0.0]), Category::NoMatch);
    }

    #[test]
    fn collab_sums_subset_scores() {
        let refs: &[(&str, &[u8])] =
            &[("a", b"ACGGTTAACCGGTTACACGT"), ("b", b"TTACACGTGGCCAATTGGCC")];
        let mut cfg = default_cfg();
        cfg.params.score_threshold = 0.5;
        cfg.collab = Some(vec![0, 1]);
        let c = classifier(refs, cfg);
        // neither alone reaches 0.5 but the sum does; b contributes more
        assert_eq!(c.reduce(&[0.2, 0.4]), Category::Filter(1));
        assert_eq!(c.reduce(&[0.1, 0.1]), Category::NoMatch);
    }

    #[test]
    fn strict_pair_reduction() {
        let refs: &[(&str, &[u8])] =
            &[("a", b"ACGGTTAACCGGTTACACGT"), ("b", b"TTACACGTGGCCAATTGGCC")];
        let c = classifier(refs, default_cfg());
        // agreeing mates keep the filter
        assert_eq!(c.reduce_pair(&[0.8, 0.0], &[0.5, 0.0]), Category::Filter(0));
        // one noMatch mate sinks the pair
        assert_eq!(c.reduce_pair(&[0.8, 0.0], &[0.0, 0.0]), Category::NoMatch);
        // mates on different filters disagree
        assert_eq!(c.reduce_pair(&[0.8, 0.0], &[0.0, 0.8]), Category::MultiMatch);
    }

    #[test]
    fn inclusive_pair_reduction() {
        let refs: &[(&str, &[u8])] =
            &[("a", b"ACGGTTAACCGGTTACACGT"), ("b", b"TTACACGTGGCCAATTGGCC")];
        let mut cfg = default_cfg();
        cfg.inclusive = true;
        let c = classifier(refs, cfg);
        assert_eq!(c.reduce_pair(&[0.8, 0.0], &[0.0, 0.0]), Category::Filter(0));
        assert_eq!(c.reduce_pair(&[0.8, 0.0], &[0.0, 0.8]), Category::MultiMatch);
        assert_eq!(c.reduce_pair(&[0.0, 0.0], &[0.0, 0.0]), Category::NoMatch);
    }
}
