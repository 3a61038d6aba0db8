//! Groups of Bloom filters sharing one `(hash_num, kmer_size)` signature.
//!
//! Filters in a group answer a batched membership query from a single
//! hashing pass. Group order and member order both follow the `-f` list;
//! that order is externally observable (summary rows, ordered-mode
//! priority, best-hit tie-breaks).

use std::path::{Path, PathBuf};

use anyhow::{ensure, Result};

use crate::bloom::{seeded_hashes, BloomFilter};
use crate::error::SieveError;
use crate::info::FilterInfo;

pub struct FilterGroup {
    hash_num: u32,
    kmer_size: usize,
    // index of this group's first member in the global filter order
    offset: usize,
    ids: Vec<String>,
    filters: Vec<BloomFilter>,
}

impl FilterGroup {
    fn new(hash_num: u32, kmer_size: usize) -> Self {
        FilterGroup {
            hash_num,
            kmer_size,
            offset: 0,
            ids: Vec::new(),
            filters: Vec::new(),
        }
    }

    #[inline]
    pub fn hash_num(&self) -> u32 {
        self.hash_num
    }

    #[inline]
    pub fn kmer_size(&self) -> usize {
        self.kmer_size
    }

    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.filters.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    #[inline]
    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    #[inline]
    pub fn filters(&self) -> &[BloomFilter] {
        &self.filters
    }

    /// Raw probe hashes for one packed k-mer, shared by every member.
    #[inline]
    pub fn prehash(&self, kmer: &[u8], out: &mut Vec<u64>) {
        seeded_hashes(kmer, self.hash_num, out);
    }
}

/// Every filter of a run: groups in first-seen signature order, members in
/// `-f` order within each group. The flattened id list defines the global
/// filter indices used by hit vectors and the summary.
pub struct FilterSet {
    groups: Vec<FilterGroup>,
    ids: Vec<String>,
}

impl FilterSet {
    #[inline]
    pub fn groups(&self) -> &[FilterGroup] {
        &self.groups
    }

    /// Global filter-id order.
    #[inline]
    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    #[inline]
    pub fn num_filters(&self) -> usize {
        self.ids.len()
    }

    /// Global index of a filter id, if loaded.
    pub fn index_of(&self, filter_id: &str) -> Option<usize> {
        self.ids.iter().position(|id| id == filter_id)
    }
}

/// Load every `.bf`/sidecar pair and group them by signature.
pub fn load_filters(filter_paths: &[PathBuf]) -> Result<FilterSet> {
    ensure!(!filter_paths.is_empty(), "need at least one filter file (-f)");

    eprintln!("loading {} filter(s)", filter_paths.len());
    let mut groups: Vec<FilterGroup> = Vec::new();

    for path in filter_paths {
        let info_path = FilterInfo::sidecar_path(path);
        if !info_path.is_file() {
            return Err(SieveError::FilterIntegrity(format!(
                "{:?} could not be opened; a corresponding information file is needed",
                info_path
            ))
            .into());
        }
        let info = FilterInfo::load(&info_path)?;
        let filter = BloomFilter::load(path, info.filter_size, info.hash_num, info.kmer_size)?;

        let duplicate = groups.iter().any(|g| g.ids.iter().any(|id| *id == info.filter_id));
        ensure!(
            !duplicate,
            "filter id {:?} appears more than once in the filter list",
            info.filter_id
        );

        let pos = groups
            .iter()
            .position(|g| g.hash_num == info.hash_num && g.kmer_size == info.kmer_size)
            .unwrap_or_else(|| {
                groups.push(FilterGroup::new(info.hash_num, info.kmer_size));
                groups.len() - 1
            });
        let group = &mut groups[pos];
        group.ids.push(info.filter_id.clone());
        group.filters.push(filter);
        eprintln!("loaded filter: {}", info.filter_id);
    }

    // assign global offsets and flatten the id order
    let mut ids = Vec::new();
    let mut offset = 0;
    for group in &mut groups {
        group.offset = offset;
        offset += group.len();
        ids.extend_from_slice(&group.ids);
    }

    Ok(FilterSet { groups, ids })
}
