use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, ensure, Context, Result};

/// Metadata pairing 1:1 with a `.bf` file at the same stem.
///
/// The sidecar is `key=value` lines; section headers, comments, blank
/// lines, and build-statistic keys the categorizer does not need are
/// skipped.
#[derive(Debug, Clone)]
pub struct FilterInfo {
    pub filter_id: String,
    pub kmer_size: usize,
    pub hash_num: u32,
    /// Bit length of the filter.
    pub filter_size: u64,
}

impl FilterInfo {
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("open {:?}", path))?;
        let reader = BufReader::new(file);

        let mut filter_id: Option<String> = None;
        let mut kmer_size: Option<usize> = None;
        let mut hash_num: Option<u32> = None;
        let mut filter_size: Option<u64> = None;

        for (line_idx, line) in reader.lines().enumerate() {
            let line = line.with_context(|| format!("read {:?}", path))?;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('[') || trimmed.starts_with('#') {
                continue;
            }
            let Some((key, value)) = trimmed.split_once('=') else {
                bail!(
                    "line {} in {:?} is not a key=value pair: {:?}",
                    line_idx + 1,
                    path,
                    trimmed
                );
            };
            let value = value.trim();
            match key.trim() {
                "filter_id" => filter_id = Some(value.to_string()),
                "kmer_size" => {
                    kmer_size = Some(value.parse().with_context(|| {
                        format!("kmer_size {:?} in {:?} is not a number", value, path)
                    })?)
                }
                "hash_number" => {
                    hash_num = Some(value.parse().with_context(|| {
                        format!("hash_number {:?} in {:?} is not a number", value, path)
                    })?)
                }
                "filter_size" => {
                    filter_size = Some(value.parse().with_context(|| {
                        format!("filter_size {:?} in {:?} is not a number", value, path)
                    })?)
                }
                // build statistics (source counts, expected FPR, ...) are
                // written by the builder and ignored here
                _ => {}
            }
        }

        let missing = |field: &str| format!("{:?} is missing the {} field", path, field);
        let info = FilterInfo {
            filter_id: filter_id.ok_or_else(|| anyhow::anyhow!(missing("filter_id")))?,
            kmer_size: kmer_size.ok_or_else(|| anyhow::anyhow!(missing("kmer_size")))?,
            hash_num: hash_num.ok_or_else(|| anyhow::anyhow!(missing("hash_number")))?,
            filter_size: filter_size.ok_or_else(|| anyhow::anyhow!(missing("filter_size")))?,
        };
        ensure!(
            info.kmer_size > 0,
            "{:?} declares a zero kmer_size",
            path
        );
        ensure!(
            info.hash_num > 0,
            "{:?} declares zero hash functions",
            path
        );
        Ok(info)
    }

    /// Write the sidecar in the same `key=value` shape the loader reads.
    pub fn store(&self, path: &Path) -> Result<()> {
        let file = File::create(path).with_context(|| format!("create {:?}", path))?;
        let mut w = BufWriter::new(file);
        writeln!(w, "filter_id={}", self.filter_id)?;
        writeln!(w, "kmer_size={}", self.kmer_size)?;
        writeln!(w, "hash_number={}", self.hash_num)?;
        writeln!(w, "filter_size={}", self.filter_size)?;
        w.flush()?;
        Ok(())
    }

    /// Sidecar path for a `.bf` file (same stem, `.txt` extension).
    pub fn sidecar_path(bf_path: &Path) -> PathBuf {
        bf_path.with_extension("txt")
    }

    /// Filters sharing a signature may be grouped for shared hashing.
    #[inline]
    pub fn signature(&self) -> (u32, usize) {
        (self.hash_num, self.kmer_size)
    }
}
