use rand::seq::SliceRandom;
use rand::Rng;

use crate::model::{CountryCode, Question, QuestionMode};
use crate::projection::CountryStatusMap;

/// Countries offered when no catalog is configured.
pub const DEFAULT_CATALOG: &[&str] = &[
    "ARG", "AUS", "AUT", "BEL", "BOL", "BRA", "CAN", "CHE", "CHL", "CHN", "COL", "CUB", "CZE",
    "DEU", "DNK", "DZA", "ECU", "EGY", "ESP", "ETH", "FIN", "FRA", "GBR", "GRC", "HUN", "IDN",
    "IND", "IRL", "IRN", "ISL", "ITA", "JPN", "KEN", "KOR", "MAR", "MEX", "NGA", "NLD", "NOR",
    "NZL", "PER", "PHL", "POL", "PRT", "ROU", "RUS", "SWE", "THA", "TUR", "UKR", "URY", "USA",
    "VEN", "VNM", "ZAF",
];

#[derive(Debug, Clone)]
pub struct QuestionPool {
    catalog: Vec<CountryCode>,
    mode: QuestionMode,
}

impl QuestionPool {
    pub fn new(catalog: Vec<CountryCode>, mode: QuestionMode) -> Self {
        let mut catalog = catalog;
        catalog.sort();
        catalog.dedup();
        Self { catalog, mode }
    }

    pub fn with_default_catalog(mode: QuestionMode) -> Self {
        Self::new(DEFAULT_CATALOG.iter().map(|c| CountryCode::new(c)).collect(), mode)
    }

    pub fn mode(&self) -> QuestionMode {
        self.mode
    }

    pub fn len(&self) -> usize {
        self.catalog.len()
    }

    pub fn is_empty(&self) -> bool {
        self.catalog.is_empty()
    }

    pub fn contains(&self, country: &CountryCode) -> bool {
        self.catalog.binary_search(country).is_ok()
    }

    /// Targets still open: no status yet and not the one just resolved.
    pub fn remaining<'a>(
        &'a self,
        status: &'a CountryStatusMap,
        just_resolved: Option<&'a CountryCode>,
    ) -> impl Iterator<Item = &'a CountryCode> + 'a {
        self.catalog
            .iter()
            .filter(move |c| !status.contains_key(*c) && Some(*c) != just_resolved)
    }

    /// Picks uniformly among the remaining targets. `None` once the map is exhausted.
    pub fn pick(
        &self,
        status: &CountryStatusMap,
        just_resolved: Option<&CountryCode>,
        rng: &mut impl Rng,
    ) -> Option<Question> {
        let open: Vec<&CountryCode> = self.remaining(status, just_resolved).collect();
        open.choose(rng).map(|target| Question {
            target: (*target).clone(),
            mode: self.mode,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    use crate::projection::CountryStatus;

    fn pool(codes: &[&str]) -> QuestionPool {
        QuestionPool::new(codes.iter().map(|c| CountryCode::new(c)).collect(), QuestionMode::Name)
    }

    #[test]
    fn test_default_catalog_is_normalized() {
        let p = QuestionPool::with_default_catalog(QuestionMode::Flag);
        assert_eq!(p.len(), DEFAULT_CATALOG.len());
        assert!(p.contains(&"fra".into()));
    }

    #[test]
    fn test_pick_skips_resolved_and_just_resolved() {
        let p = pool(&["FRA", "DEU", "ITA"]);
        let mut status = CountryStatusMap::new();
        status.insert("FRA".into(), CountryStatus::Correct);
        let ita = CountryCode::new("ITA");
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        for _ in 0..20 {
            let q = p.pick(&status, Some(&ita), &mut rng).unwrap();
            assert_eq!(q.target.as_str(), "DEU");
            assert_eq!(q.mode, QuestionMode::Name);
        }
    }

    #[test]
    fn test_pick_exhausted() {
        let p = pool(&["FRA"]);
        let mut status = CountryStatusMap::new();
        status.insert("FRA".into(), CountryStatus::Failed);
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        assert!(p.pick(&status, None, &mut rng).is_none());
    }

    #[test]
    fn test_pick_covers_all_open_targets() {
        let p = pool(&["FRA", "DEU", "ITA", "ESP"]);
        let status = CountryStatusMap::new();
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        let mut seen = std::collections::BTreeSet::new();
        for _ in 0..200 {
            seen.insert(p.pick(&status, None, &mut rng).unwrap().target);
        }
        assert_eq!(seen.len(), 4);
    }

    #[test]
    fn test_duplicates_collapsed() {
        let p = pool(&["FRA", "fra", "DEU"]);
        assert_eq!(p.len(), 2);
    }
}
