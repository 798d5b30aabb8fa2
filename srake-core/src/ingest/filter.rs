//! Record-level ingest filters.
//!
//! All filters are conjunctive and applied at emit time. An empty filter
//! set accepts everything; a filter whose field is absent on a record also
//! accepts it (a taxon filter says nothing about a run).

use crate::record::SraRecord;
use std::collections::HashSet;

#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub taxon_ids: HashSet<i64>,
    /// Lowercased scientific names.
    pub organisms: HashSet<String>,
    /// Lowercased platform names.
    pub platforms: HashSet<String>,
    /// Lowercased library strategies.
    pub strategies: HashSet<String>,
    /// Half-open interval on `submission_date`: `[date_from, date_to)`.
    pub date_from: Option<String>,
    pub date_to: Option<String>,
    /// Inclusive bounds on `total_spots`.
    pub min_reads: Option<u64>,
    pub max_reads: Option<u64>,
    /// Inclusive bounds on `total_bases`.
    pub min_bases: Option<u64>,
    pub max_bases: Option<u64>,
}

impl RecordFilter {
    pub fn is_empty(&self) -> bool {
        self.taxon_ids.is_empty()
            && self.organisms.is_empty()
            && self.platforms.is_empty()
            && self.strategies.is_empty()
            && self.date_from.is_none()
            && self.date_to.is_none()
            && self.min_reads.is_none()
            && self.max_reads.is_none()
            && self.min_bases.is_none()
            && self.max_bases.is_none()
    }

    pub fn with_organisms<I: IntoIterator<Item = String>>(mut self, organisms: I) -> Self {
        self.organisms = organisms.into_iter().map(|o| o.to_lowercase()).collect();
        self
    }

    pub fn with_platforms<I: IntoIterator<Item = String>>(mut self, platforms: I) -> Self {
        self.platforms = platforms.into_iter().map(|p| p.to_lowercase()).collect();
        self
    }

    pub fn with_strategies<I: IntoIterator<Item = String>>(mut self, strategies: I) -> Self {
        self.strategies = strategies.into_iter().map(|s| s.to_lowercase()).collect();
        self
    }

    pub fn accepts(&self, record: &SraRecord) -> bool {
        if self.is_empty() {
            return true;
        }
        match record {
            SraRecord::Study(study) => self.date_window_accepts(study.submission_date.as_deref()),
            SraRecord::Experiment(exp) => {
                set_accepts(&self.platforms, exp.platform.as_deref())
                    && set_accepts(&self.strategies, exp.library_strategy.as_deref())
            }
            SraRecord::Sample(sample) => {
                let taxon_ok = self.taxon_ids.is_empty()
                    || sample.taxon_id.is_none_or(|id| self.taxon_ids.contains(&id));
                taxon_ok && set_accepts(&self.organisms, sample.scientific_name.as_deref())
            }
            SraRecord::Run(run) => {
                bounds_accept(run.total_spots, self.min_reads, self.max_reads)
                    && bounds_accept(run.total_bases, self.min_bases, self.max_bases)
            }
            SraRecord::Submission(_) | SraRecord::Analysis(_) => true,
        }
    }

    fn date_window_accepts(&self, date: Option<&str>) -> bool {
        let Some(date) = date else {
            // no date on the record: only a window can't exclude it
            return true;
        };
        if let Some(from) = &self.date_from {
            if date < from.as_str() {
                return false;
            }
        }
        if let Some(to) = &self.date_to {
            if date >= to.as_str() {
                return false;
            }
        }
        true
    }
}

fn set_accepts(set: &HashSet<String>, value: Option<&str>) -> bool {
    if set.is_empty() {
        return true;
    }
    value.is_none_or(|v| set.contains(&v.to_lowercase()))
}

fn bounds_accept(value: Option<u64>, min: Option<u64>, max: Option<u64>) -> bool {
    let Some(value) = value else {
        return true;
    };
    if let Some(min) = min {
        if value < min {
            return false;
        }
    }
    if let Some(max) = max {
        if value > max {
            return false;
        }
    }
    true
}
