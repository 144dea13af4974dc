use crate::config::types::{RiskFinding, RiskLevel};

/// Weighted sum of finding severities
pub fn risk_score(findings: &[RiskFinding]) -> u32 {
    findings.iter().map(|f| f.severity.weight()).sum()
}

/// Band implied by a numeric score
pub fn level_for_score(score: u32) -> RiskLevel {
    match score {
        0..=4 => RiskLevel::Low,
        5..=14 => RiskLevel::Medium,
        15..=29 => RiskLevel::High,
        _ => RiskLevel::Critical,
    }
}

/// The higher of the score band and the worst single finding
pub fn risk_level(score: u32, findings: &[RiskFinding]) -> RiskLevel {
    let worst = findings
        .iter()
        .map(|f| RiskLevel::from(f.severity))
        .max()
        .unwrap_or(RiskLevel::Low);
    level_for_score(score).max(worst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::{Location, RiskCategory, Severity};

    fn finding(severity: Severity) -> RiskFinding {
        RiskFinding {
            rule_id: "test".to_string(),
            category: RiskCategory::UnsafeExec,
            severity,
            location: Location {
                line: 1,
                column: 1,
                offset: 0,
            },
            description: String::new(),
        }
    }

    #[test]
    fn score_is_weighted_sum() {
        let findings = vec![
            finding(Severity::Low),
            finding(Severity::Medium),
            finding(Severity::High),
            finding(Severity::Critical),
        ];
        assert_eq!(risk_score(&findings), 1 + 3 + 7 + 15);
    }

    #[test]
    fn empty_findings_are_low() {
        assert_eq!(risk_score(&[]), 0);
        assert_eq!(risk_level(0, &[]), RiskLevel::Low);
    }

    #[test]
    fn level_takes_worst_of_band_and_severity() {
        let one_critical = vec![finding(Severity::Critical)];
        assert_eq!(risk_level(15, &one_critical), RiskLevel::Critical);

        let many_lows: Vec<_> = (0..6).map(|_| finding(Severity::Low)).collect();
        assert_eq!(risk_level(6, &many_lows), RiskLevel::Medium);
    }

    #[test]
    fn band_edges() {
        assert_eq!(level_for_score(4), RiskLevel::Low);
        assert_eq!(level_for_score(5), RiskLevel::Medium);
        assert_eq!(level_for_score(15), RiskLevel::High);
        assert_eq!(level_for_score(30), RiskLevel::Critical);
    }
}
