//! Job catalog
//!
//! The catalog is the only source of brand jobs. `BrandLookup` resolves job
//! ids and lists the catalog; `ConfigCatalog` implements it over the
//! `[[brand]]` table. The auto-mode cursor remembers where the previous
//! session stopped walking the catalog.

mod cursor;

pub use cursor::{AutoBatch, Cursor, JobOutcome};

use crate::config::Config;
use crate::state::BrandJob;
use std::cmp::Ordering;

/// Source of brand jobs
pub trait BrandLookup: Send + Sync {
    /// Resolves one job id, or `None` if the catalog has no such brand
    fn resolve(&self, id: &str) -> Option<BrandJob>;

    /// Every job in the catalog, in catalog order
    fn catalog(&self) -> Vec<BrandJob>;
}

/// Catalog backed by the `[[brand]]` entries of the configuration
#[derive(Debug, Clone)]
pub struct ConfigCatalog {
    jobs: Vec<BrandJob>,
}

impl ConfigCatalog {
    /// Builds the catalog, assigning priority ranks from `[scheduler] priority`
    pub fn new(config: &Config) -> Self {
        let jobs = config
            .brands
            .iter()
            .map(|entry| {
                let mut job = BrandJob::new(entry.name.clone(), entry.source_ids.clone());
                job.priority_rank = config
                    .scheduler
                    .priority
                    .iter()
                    .position(|p| *p == entry.name);
                job
            })
            .collect();
        Self { jobs }
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

impl BrandLookup for ConfigCatalog {
    fn resolve(&self, id: &str) -> Option<BrandJob> {
        self.jobs.iter().find(|job| job.id == id).cloned()
    }

    fn catalog(&self) -> Vec<BrandJob> {
        self.jobs.clone()
    }
}

/// Admission order: ranked jobs first by rank, then the rest by name
pub fn priority_order(a: &BrandJob, b: &BrandJob) -> Ordering {
    match (a.priority_rank, b.priority_rank) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.id.cmp(&b.id),
    }
}

/// Sorts jobs into admission order
pub fn sort_by_priority(jobs: &mut [BrandJob]) {
    jobs.sort_by(priority_order);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrandEntry;

    fn config(names: &[&str], priority: &[&str]) -> Config {
        let mut config = Config::default();
        config.brands = names
            .iter()
            .enumerate()
            .map(|(i, name)| BrandEntry::new(*name, vec![i.to_string()]))
            .collect();
        config.scheduler.priority = priority.iter().map(|s| s.to_string()).collect();
        config
    }

    #[test]
    fn test_resolve_known_and_unknown() {
        let catalog = ConfigCatalog::new(&config(&["Acme", "Zeta"], &["Zeta"]));

        let zeta = catalog.resolve("Zeta").unwrap();
        assert_eq!(zeta.priority_rank, Some(0));
        assert_eq!(zeta.source_ids, vec!["1".to_string()]);
        assert_eq!(catalog.resolve("Acme").unwrap().priority_rank, None);
        assert!(catalog.resolve("acme").is_none());
    }

    #[test]
    fn test_catalog_keeps_config_order() {
        let catalog = ConfigCatalog::new(&config(&["Zeta", "Acme", "Mid"], &[]));
        let ids: Vec<String> = catalog.catalog().into_iter().map(|j| j.id).collect();
        assert_eq!(ids, vec!["Zeta", "Acme", "Mid"]);
    }

    #[test]
    fn test_priority_sort() {
        let catalog = ConfigCatalog::new(&config(
            &["Kia", "Audi", "BYD", "Tesla", "Fiat"],
            &["BYD", "Tesla", "BMW", "Audi"],
        ));
        let mut jobs = catalog.catalog();
        sort_by_priority(&mut jobs);

        let ids: Vec<&str> = jobs.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, vec!["BYD", "Tesla", "Audi", "Fiat", "Kia"]);
    }
}
