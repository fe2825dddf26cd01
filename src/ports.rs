//! Port-conflict detector (C13): extracts port mappings from compose
//! fragments, finds collisions, and synthesizes re-assignments.

use std::collections::{BTreeMap, BTreeSet};

/// Services in these catalog categories are treated as "well-known
/// infrastructure" for severity classification.
const INFRA_CATEGORIES: &[&str] = &["database", "messaging"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortConflict {
    pub host_port: u16,
    pub services: BTreeSet<String>,
    pub severity: Severity,
}

/// A single port encoding extracted from a compose fragment: the host port
/// plus the raw string it came from (needed to rewrite later).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedPort {
    pub service_id: String,
    pub host_port: u16,
    pub raw: String,
}

/// Parse one port string. Handles `5432`, `5432:5432`, `"${VAR:-5432}"`, and
/// ranges (`1000-1010`), which expand to every integer in the interval.
pub fn extract_ports(service_id: &str, raw: &str) -> Vec<ExtractedPort> {
    let host_part = raw.split(':').next().unwrap_or(raw);
    let host_part = expand_env_default(host_part);

    let mut results = Vec::new();
    if let Some((lo, hi)) = host_part.split_once('-') {
        if let (Ok(lo), Ok(hi)) = (lo.parse::<u32>(), hi.parse::<u32>()) {
            for port in lo..=hi {
                if let Ok(port) = u16::try_from(port) {
                    results.push(ExtractedPort {
                        service_id: service_id.to_string(),
                        host_port: port,
                        raw: raw.to_string(),
                    });
                }
            }
        }
        return results;
    }

    if let Ok(port) = host_part.parse::<u32>() {
        if let Ok(port) = u16::try_from(port) {
            results.push(ExtractedPort {
                service_id: service_id.to_string(),
                host_port: port,
                raw: raw.to_string(),
            });
        }
    }
    results
}

/// `${VAR:-default}` -> `default`; passthrough otherwise.
fn expand_env_default(text: &str) -> String {
    let trimmed = text.trim();
    if let Some(inner) = trimmed.strip_prefix("${").and_then(|s| s.strip_suffix('}')) {
        if let Some((_, default)) = inner.split_once(":-") {
            return default.to_string();
        }
    }
    trimmed.to_string()
}

/// Detect collisions across a set of (service id, category, port strings).
pub fn detect(services: &[(String, String, Vec<String>)]) -> Vec<PortConflict> {
    let mut by_port: BTreeMap<u16, BTreeSet<String>> = BTreeMap::new();
    let mut category_of: BTreeMap<String, String> = BTreeMap::new();

    for (service_id, category, port_strings) in services {
        category_of.insert(service_id.clone(), category.clone());
        for port_string in port_strings {
            for extracted in extract_ports(service_id, port_string) {
                by_port
                    .entry(extracted.host_port)
                    .or_default()
                    .insert(service_id.clone());
            }
        }
    }

    let mut conflicts = Vec::new();
    for (port, claimants) in by_port {
        let is_privileged = port < 1024;
        let has_infra_claimant = claimants.iter().any(|id| {
            category_of
                .get(id)
                .map(|c| INFRA_CATEGORIES.contains(&c.as_str()))
                .unwrap_or(false)
        });
        let is_multi_claim = claimants.len() > 1;

        if !is_multi_claim && !is_privileged {
            continue;
        }

        let severity = if is_privileged || (is_multi_claim && has_infra_claimant) {
            Severity::Error
        } else {
            Severity::Warning
        };

        conflicts.push(PortConflict {
            host_port: port,
            services: claimants,
            severity,
        });
    }
    conflicts
}

/// Automatic resolution: the first participant (lexicographically smallest
/// service id) keeps the original port; every other participant gets the
/// lowest free port >= original + 1 not already claimed.
pub fn resolve(
    conflicts: &[PortConflict],
) -> BTreeMap<String, BTreeMap<u16, u16>> {
    let mut claimed: BTreeSet<u16> = conflicts.iter().map(|c| c.host_port).collect();
    let mut rewrites: BTreeMap<String, BTreeMap<u16, u16>> = BTreeMap::new();

    for conflict in conflicts {
        let mut participants: Vec<&String> = conflict.services.iter().collect();
        participants.sort();
        let Some((first, rest)) = participants.split_first() else {
            continue;
        };
        let _ = first; // keeps original port, no rewrite entry needed

        let mut next_candidate = conflict.host_port + 1;
        for service_id in rest {
            while claimed.contains(&next_candidate) {
                next_candidate += 1;
            }
            rewrites
                .entry((*service_id).clone())
                .or_default()
                .insert(conflict.host_port, next_candidate);
            claimed.insert(next_candidate);
            next_candidate += 1;
        }
    }

    rewrites
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_single_numeric_port() {
        let extracted = extract_ports("svc", "5432");
        assert_eq!(extracted, vec![ExtractedPort {
            service_id: "svc".to_string(),
            host_port: 5432,
            raw: "5432".to_string(),
        }]);
    }

    #[test]
    fn extracts_host_container_pair() {
        let extracted = extract_ports("svc", "5432:5432");
        assert_eq!(extracted[0].host_port, 5432);
    }

    #[test]
    fn extracts_env_default_expansion() {
        let extracted = extract_ports("svc", "${PORT:-8080}");
        assert_eq!(extracted[0].host_port, 8080);
    }

    #[test]
    fn extracts_range_into_interval() {
        let extracted = extract_ports("svc", "1000-1002");
        let ports: Vec<u16> = extracted.iter().map(|e| e.host_port).collect();
        assert_eq!(ports, vec![1000, 1001, 1002]);
    }

    #[test]
    fn privileged_port_range_is_error_severity() {
        let services = vec![("svc".to_string(), "cache".to_string(), vec!["1-1024".to_string()])];
        let conflicts = detect(&services);
        assert!(conflicts.iter().any(|c| c.severity == Severity::Error));
    }

    #[test]
    fn infra_collision_is_error_other_collisions_are_warning() {
        let services = vec![
            ("postgres".to_string(), "database".to_string(), vec!["5432".to_string()]),
            ("other-db".to_string(), "database".to_string(), vec!["5432".to_string()]),
            ("app-a".to_string(), "misc".to_string(), vec!["9000".to_string()]),
            ("app-b".to_string(), "misc".to_string(), vec!["9000".to_string()]),
        ];
        let conflicts = detect(&services);
        let infra = conflicts.iter().find(|c| c.host_port == 5432).unwrap();
        assert_eq!(infra.severity, Severity::Error);
        let misc = conflicts.iter().find(|c| c.host_port == 9000).unwrap();
        assert_eq!(misc.severity, Severity::Warning);
    }

    #[test]
    fn auto_fix_assigns_lowest_free_port_to_losing_participant() {
        let services = vec![
            ("postgres".to_string(), "database".to_string(), vec!["5432".to_string()]),
            ("other-db".to_string(), "database".to_string(), vec!["5432".to_string()]),
        ];
        let conflicts = detect(&services);
        let rewrites = resolve(&conflicts);
        let other_db_rewrite = rewrites.get("other-db").unwrap();
        assert_eq!(other_db_rewrite.get(&5432), Some(&5433));
        assert!(!rewrites.contains_key("postgres"));
    }

    proptest::proptest! {
        #[test]
        fn range_expansion_covers_exactly_the_closed_interval(lo in 1u32..2000, span in 0u32..50) {
            let hi = lo + span;
            let raw = format!("{lo}-{hi}");
            let extracted = extract_ports("svc", &raw);
            let ports: Vec<u32> = extracted.iter().map(|e| e.host_port as u32).collect();
            let expected: Vec<u32> = (lo..=hi).collect();
            prop_assert_eq!(ports, expected);
        }

        #[test]
        fn single_port_extraction_is_idempotent(port in 1u32..65535) {
            let raw = port.to_string();
            let once = extract_ports("svc", &raw);
            let twice = extract_ports("svc", &raw);
            prop_assert_eq!(once, twice);
        }
    }
}
