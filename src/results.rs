use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};

pub const NO_MATCH: &str = "noMatch";
pub const MULTI_MATCH: &str = "multiMatch";

/// The single categorical assignment of a read or pair. `Filter` carries
/// the global filter index (insertion order across groups).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    NoMatch,
    MultiMatch,
    Filter(usize),
}

/// Counts one update per read (single-end) or per pair (paired-end).
pub struct ResultsManager {
    ids: Vec<String>,
    hits: Vec<u64>,
    multi_match: u64,
    no_match: u64,
    total: u64,
}

impl ResultsManager {
    pub fn new(ids: &[String]) -> Self {
        ResultsManager {
            ids: ids.to_vec(),
            hits: vec![0; ids.len()],
            multi_match: 0,
            no_match: 0,
            total: 0,
        }
    }

    pub fn record(&mut self, category: Category) {
        match category {
            Category::NoMatch => self.no_match += 1,
            Category::MultiMatch => self.multi_match += 1,
            Category::Filter(i) => self.hits[i] += 1,
        }
        self.total += 1;
    }

    #[inline]
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Category label, for file naming and reporting.
    pub fn label(&self, category: Category) -> &str {
        match category {
            Category::NoMatch => NO_MATCH,
            Category::MultiMatch => MULTI_MATCH,
            Category::Filter(i) => &self.ids[i],
        }
    }

    /// Write the summary: one row per filter in insertion order, then
    /// `multiMatch`, then `noMatch`.
    pub fn write_summary(&self, path: &Path) -> Result<()> {
        let file = File::create(path).with_context(|| format!("create {:?}", path))?;
        let mut w = BufWriter::new(file);
        writeln!(w, "id\thits\tfraction")?;
        for (id, &hits) in self.ids.iter().zip(&self.hits) {
            writeln!(w, "{}\t{}\t{}", id, hits, self.fraction(hits))?;
        }
        writeln!(
            w,
            "{}\t{}\t{}",
            MULTI_MATCH,
            self.multi_match,
            self.fraction(self.multi_match)
        )?;
        writeln!(
            w,
            "{}\t{}\t{}",
            NO_MATCH,
            self.no_match,
            self.fraction(self.no_match)
        )?;
        w.flush()?;
        Ok(())
    }

    fn fraction(&self, hits: u64) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            hits as f64 / self.total as f64
        }
    }
}
