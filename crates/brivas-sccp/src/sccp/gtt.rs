//! Global Title Translation

use super::address::SccpAddress;
use crate::errors::SccpError;
use crate::types::{NumberingPlan, PointCode, Sls};
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// How a rule with several candidates picks one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectionMode {
    /// First candidate that is not prohibited, in list order
    PrimaryBackup,
    /// `candidates[sls mod n]`, then ring order past prohibited ones
    LoadShare,
}

/// A translation rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslationRule {
    pub translation_type: u8,
    /// `None` matches any numbering plan
    pub numbering_plan: Option<NumberingPlan>,
    /// Leading digits to match
    pub prefix: String,
    /// Candidate destinations, each with at least a point code
    pub candidates: Vec<SccpAddress>,
    pub mode: SelectionMode,
}

impl TranslationRule {
    fn matches(&self, translation_type: u8, numbering_plan: Option<NumberingPlan>, digits: &str) -> bool {
        self.translation_type == translation_type
            && self.numbering_plan.map_or(true, |np| Some(np) == numbering_plan)
            && digits.starts_with(&self.prefix)
    }
}

/// Immutable set of translation rules, in configured order
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TranslationTable {
    pub rules: Vec<TranslationRule>,
}

impl TranslationTable {
    pub fn new(rules: Vec<TranslationRule>) -> Self {
        Self { rules }
    }

    /// Check that every candidate names a point code
    pub fn validate(&self) -> Result<(), SccpError> {
        for rule in &self.rules {
            if rule.candidates.is_empty() {
                return Err(SccpError::Config(format!("rule '{}' has no candidates", rule.prefix)));
            }
            if rule.candidates.iter().any(|c| c.point_code.is_none()) {
                return Err(SccpError::Config(format!(
                    "rule '{}' has a candidate without a point code",
                    rule.prefix
                )));
            }
        }
        Ok(())
    }

    /// Longest matching prefix; the earlier rule wins a tie
    fn lookup(&self, translation_type: u8, numbering_plan: Option<NumberingPlan>, digits: &str) -> Option<&TranslationRule> {
        let mut best: Option<&TranslationRule> = None;
        for rule in &self.rules {
            if rule.matches(translation_type, numbering_plan, digits)
                && best.map_or(true, |b| rule.prefix.len() > b.prefix.len())
            {
                best = Some(rule);
            }
        }
        best
    }
}

/// Availability of a candidate destination as seen by the resolver
pub trait DestinationAvailability: Send + Sync {
    /// True when traffic must not be sent to (`pc`, `ssn`)
    fn is_prohibited(&self, pc: PointCode, ssn: Option<u8>) -> bool;
}

/// Outcome of address resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDestination {
    pub point_code: PointCode,
    pub ssn: Option<u8>,
    /// Called party to put in the outgoing message
    pub address: SccpAddress,
}

/// Global Title Translator
pub struct Router {
    table: ArcSwap<TranslationTable>,
    availability: Arc<dyn DestinationAvailability>,
}

impl Router {
    pub fn new(table: TranslationTable, availability: Arc<dyn DestinationAvailability>) -> Self {
        Self {
            table: ArcSwap::from_pointee(table),
            availability,
        }
    }

    /// Replace the rule table; resolutions in flight keep their snapshot
    pub fn reload(&self, table: TranslationTable) -> Result<(), SccpError> {
        table.validate()?;
        self.table.store(Arc::new(table));
        Ok(())
    }

    /// Rule table currently in use
    pub fn table(&self) -> Arc<TranslationTable> {
        self.table.load_full()
    }

    /// Translate an address to a destination
    pub fn resolve(&self, address: &SccpAddress, sls: Sls) -> Result<ResolvedDestination, SccpError> {
        self.resolve_excluding(address, sls, &[])
    }

    /// Translate, treating `excluded` point codes as prohibited
    pub fn resolve_excluding(
        &self,
        address: &SccpAddress,
        sls: Sls,
        excluded: &[PointCode],
    ) -> Result<ResolvedDestination, SccpError> {
        address.validate()?;

        if !address.is_route_on_gt() {
            return match (address.point_code, address.subsystem_number) {
                (Some(pc), ssn) => Ok(ResolvedDestination {
                    point_code: pc,
                    ssn,
                    address: address.clone(),
                }),
                (None, _) => Err(SccpError::InvalidAddress(
                    "route on SSN without a point code".to_string(),
                )),
            };
        }

        let gt = address
            .global_title
            .as_ref()
            .ok_or_else(|| SccpError::InvalidAddress("missing global title".to_string()))?;

        let table = self.table.load();
        let rule = table
            .lookup(gt.translation_type(), gt.numbering_plan(), gt.digits())
            .ok_or(SccpError::NoRouteFound)?;

        let n = rule.candidates.len();
        let start = match rule.mode {
            SelectionMode::PrimaryBackup => 0,
            SelectionMode::LoadShare => sls as usize % n,
        };

        for i in 0..n {
            let candidate = &rule.candidates[(start + i) % n];
            let Some(pc) = candidate.point_code else { continue };
            let ssn = candidate.subsystem_number.or(address.subsystem_number);
            if excluded.contains(&pc) || self.availability.is_prohibited(pc, ssn) {
                continue;
            }
            return Ok(ResolvedDestination {
                point_code: pc,
                ssn,
                address: translated_address(address, candidate, ssn),
            });
        }

        Err(SccpError::AllRoutesProhibited)
    }
}

/// Called party after translation: the candidate's routing indicator and
/// point code, with the original global title kept for the next node
fn translated_address(original: &SccpAddress, candidate: &SccpAddress, ssn: Option<u8>) -> SccpAddress {
    SccpAddress {
        routing_indicator: candidate.routing_indicator,
        global_title: candidate
            .global_title
            .clone()
            .or_else(|| original.global_title.clone()),
        point_code: candidate.point_code,
        subsystem_number: ssn,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sccp::address::GlobalTitle;
    use parking_lot::RwLock;
    use std::collections::HashSet;

    #[derive(Default)]
    struct Prohibited(RwLock<HashSet<PointCode>>);

    impl Prohibited {
        fn set(&self, pc: u32, prohibited: bool) {
            if prohibited {
                self.0.write().insert(PointCode(pc));
            } else {
                self.0.write().remove(&PointCode(pc));
            }
        }
    }

    impl DestinationAvailability for Prohibited {
        fn is_prohibited(&self, pc: PointCode, _ssn: Option<u8>) -> bool {
            self.0.read().contains(&pc)
        }
    }

    fn rule(prefix: &str, pcs: &[u32], mode: SelectionMode) -> TranslationRule {
        TranslationRule {
            translation_type: 0,
            numbering_plan: None,
            prefix: prefix.to_string(),
            candidates: pcs
                .iter()
                .map(|pc| SccpAddress::from_ssn_pc(8, PointCode(*pc)))
                .collect(),
            mode,
        }
    }

    fn gt(digits: &str) -> SccpAddress {
        SccpAddress::from_gt(GlobalTitle::e164(digits), None)
    }

    #[test]
    fn test_gtt_longest_prefix() {
        let status = Arc::new(Prohibited::default());
        let router = Router::new(
            TranslationTable::new(vec![
                rule("234", &[1001], SelectionMode::PrimaryBackup),
                rule("2348", &[1002], SelectionMode::PrimaryBackup),
            ]),
            status,
        );

        let resolved = router.resolve(&gt("2348012345678"), 0).unwrap();
        assert_eq!(resolved.point_code, PointCode(1002)); // Should match longer prefix

        let resolved = router.resolve(&gt("2340123456789"), 0).unwrap();
        assert_eq!(resolved.point_code, PointCode(1001)); // Falls back to shorter prefix

        assert_eq!(router.resolve(&gt("44207"), 0), Err(SccpError::NoRouteFound));
    }

    #[test]
    fn test_primary_backup_1800() {
        let status = Arc::new(Prohibited::default());
        let router = Router::new(
            TranslationTable::new(vec![rule("1800", &[5, 6], SelectionMode::PrimaryBackup)]),
            status.clone(),
        );
        let called = gt("18005551234");

        let resolved = router.resolve(&called, 3).unwrap();
        assert_eq!((resolved.point_code, resolved.ssn), (PointCode(5), Some(8)));
        assert_eq!(resolved.address.global_title.as_ref().unwrap().digits(), "18005551234");

        status.set(5, true);
        let resolved = router.resolve(&called, 3).unwrap();
        assert_eq!((resolved.point_code, resolved.ssn), (PointCode(6), Some(8)));

        status.set(6, true);
        assert_eq!(router.resolve(&called, 3), Err(SccpError::AllRoutesProhibited));

        status.set(5, false);
        assert_eq!(router.resolve(&called, 3).unwrap().point_code, PointCode(5));
    }

    #[test]
    fn test_load_share_distribution() {
        let status = Arc::new(Prohibited::default());
        let router = Router::new(
            TranslationTable::new(vec![rule("1", &[10, 11, 12], SelectionMode::LoadShare)]),
            status.clone(),
        );
        let called = gt("1555");

        let mut counts = std::collections::HashMap::new();
        for i in 0..1000u32 {
            let resolved = router.resolve(&called, (i % 256) as u8).unwrap();
            *counts.entry(resolved.point_code).or_insert(0u32) += 1;
        }
        for pc in [10, 11, 12] {
            let share = counts[&PointCode(pc)] as f64 / 1000.0;
            assert!((share - 1.0 / 3.0).abs() < 0.05, "pc {} share {}", pc, share);
        }

        // Traffic of a prohibited candidate moves to the next one in the ring
        status.set(11, true);
        let mut counts = std::collections::HashMap::new();
        for i in 0..1000u32 {
            let resolved = router.resolve(&called, (i % 256) as u8).unwrap();
            *counts.entry(resolved.point_code).or_insert(0u32) += 1;
        }
        assert!(!counts.contains_key(&PointCode(11)));
        assert_eq!(counts.values().sum::<u32>(), 1000);
        assert!(counts[&PointCode(10)] > 0 && counts[&PointCode(12)] > 0);
    }

    #[test]
    fn test_route_on_ssn_skips_table() {
        let router = Router::new(TranslationTable::default(), Arc::new(Prohibited::default()));
        let called = SccpAddress::from_ssn_pc(6, PointCode(77));
        let resolved = router.resolve(&called, 0).unwrap();
        assert_eq!(resolved.point_code, PointCode(77));
        assert_eq!(resolved.address, called);
    }

    #[test]
    fn test_exclusion_and_reload() {
        let router = Router::new(
            TranslationTable::new(vec![rule("1800", &[5, 6], SelectionMode::PrimaryBackup)]),
            Arc::new(Prohibited::default()),
        );
        let called = gt("1800123");
        let resolved = router.resolve_excluding(&called, 0, &[PointCode(5)]).unwrap();
        assert_eq!(resolved.point_code, PointCode(6));

        let before = router.table();
        router
            .reload(TranslationTable::new(vec![rule("1800", &[9], SelectionMode::PrimaryBackup)]))
            .unwrap();
        assert_eq!(before.rules[0].candidates.len(), 2);
        assert_eq!(router.resolve(&called, 0).unwrap().point_code, PointCode(9));

        let invalid = TranslationTable::new(vec![rule("1", &[], SelectionMode::LoadShare)]);
        assert!(router.reload(invalid).is_err());
        assert_eq!(router.resolve(&called, 0).unwrap().point_code, PointCode(9));
    }

    #[test]
    fn test_numbering_plan_filter() {
        let mut e214 = rule("1800", &[20], SelectionMode::PrimaryBackup);
        e214.numbering_plan = Some(NumberingPlan::IsdnMobile);
        let router = Router::new(
            TranslationTable::new(vec![e214, rule("18", &[21], SelectionMode::PrimaryBackup)]),
            Arc::new(Prohibited::default()),
        );
        // E.164 address does not match the E.214 rule
        assert_eq!(router.resolve(&gt("1800123"), 0).unwrap().point_code, PointCode(21));
    }
}
