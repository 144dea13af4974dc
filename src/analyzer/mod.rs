//! Static security analysis
//!
//! Scans uploaded scripts for risk indicators without executing them.
//! Output is a pure function of the content: no clock, no randomness.

pub mod python;
pub(crate) mod rules;
pub mod score;
pub mod source;
pub mod sql;

use crate::config::types::{
    FileKind, Result, RiskCategory, RiskFinding, RiskLevel, ScriptUpload, Severity,
};
use rules::Hit;
use serde::{Deserialize, Serialize};
use source::SourceMap;

/// Ordered findings with their aggregate score and level
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SecurityReport {
    pub findings: Vec<RiskFinding>,
    pub score: u32,
    pub level: RiskLevel,
}

/// Security analyzer holding the compiled rule sets for both languages
pub struct SecurityAnalyzer {
    python: python::PythonRules,
    sql: sql::SqlRules,
}

impl SecurityAnalyzer {
    pub fn new() -> Result<Self> {
        Ok(Self {
            python: python::PythonRules::new()?,
            sql: sql::SqlRules::new()?,
        })
    }

    pub fn analyze(&self, script: &ScriptUpload) -> SecurityReport {
        self.analyze_source(script.kind(), script.content())
    }

    pub fn analyze_source(&self, kind: FileKind, content: &[u8]) -> SecurityReport {
        let map = SourceMap::new(content);

        let text = match std::str::from_utf8(content) {
            Ok(text) => text,
            Err(e) => {
                // Nothing past the first bad byte can be trusted; stop here.
                let hit = Hit::parse_failure(e.valid_up_to(), "content is not valid UTF-8");
                return build_report(vec![hit], &map);
            }
        };

        let (mut hits, lexed) = match kind {
            FileKind::Python => self.python.scan(text),
            FileKind::Sql => self.sql.scan(text),
        };
        if let Some((offset, description)) = lexed.issue {
            hits.push(Hit::parse_failure(
                offset,
                format!("could not fully parse script: {description}"),
            ));
        }

        rules::order_hits(&mut hits);
        build_report(hits, &map)
    }
}

fn build_report(hits: Vec<Hit>, map: &SourceMap<'_>) -> SecurityReport {
    let findings: Vec<RiskFinding> = hits
        .into_iter()
        .map(|hit| {
            let mut finding = hit.into_finding(|offset| map.locate(offset));
            if finding.category == RiskCategory::UnsafeIo {
                finding.severity = finding.severity.max(Severity::Medium);
            }
            finding
        })
        .collect();
    let score = score::risk_score(&findings);
    let level = score::risk_level(score, &findings);
    SecurityReport {
        findings,
        score,
        level,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analyzer() -> SecurityAnalyzer {
        SecurityAnalyzer::new().unwrap()
    }

    #[test]
    fn clean_python_has_no_findings() {
        let report = analyzer().analyze_source(FileKind::Python, b"print(sum(range(10)))\n");
        assert!(report.findings.is_empty());
        assert_eq!(report.score, 0);
        assert_eq!(report.level, RiskLevel::Low);
    }

    #[test]
    fn invalid_utf8_yields_single_parse_failure() {
        let report = analyzer().analyze_source(FileKind::Python, b"eval(x)\n\xff\xfe");
        assert_eq!(report.findings.len(), 1);
        let finding = &report.findings[0];
        assert_eq!(finding.category, RiskCategory::ParseFailure);
        assert_eq!(finding.severity, Severity::Medium);
        assert_eq!(finding.location.offset, 8);
        assert_eq!(finding.location.line, 2);
    }

    #[test]
    fn structural_issue_still_scans_rest() {
        let report = analyzer().analyze_source(FileKind::Python, b"x = (1\neval(y)\n");
        let categories: Vec<_> = report.findings.iter().map(|f| f.category).collect();
        assert_eq!(
            categories
                .iter()
                .filter(|c| **c == RiskCategory::ParseFailure)
                .count(),
            1
        );
        assert!(categories.contains(&RiskCategory::CodeInjection));
    }

    #[test]
    fn findings_follow_source_order() {
        let src = b"import subprocess\nsubprocess.run(cmd, shell=True)\nopen('f')\n";
        let report = analyzer().analyze_source(FileKind::Python, src);
        let offsets: Vec<_> = report.findings.iter().map(|f| f.location.offset).collect();
        let mut sorted = offsets.clone();
        sorted.sort();
        assert_eq!(offsets, sorted);
    }

    #[test]
    fn unsafe_io_is_never_low() {
        let report = analyzer().analyze_source(
            FileKind::Python,
            b"from pathlib import Path\nPath('x').write_text('y')\nopen('z')\n",
        );
        assert!(report
            .findings
            .iter()
            .filter(|f| f.category == RiskCategory::UnsafeIo)
            .all(|f| f.severity >= Severity::Medium));
    }

    #[test]
    fn sql_delete_without_where() {
        let report = analyzer().analyze_source(FileKind::Sql, b"DELETE FROM users;");
        assert_eq!(report.findings.len(), 1);
        assert_eq!(
            report.findings[0].category,
            RiskCategory::DestructiveStatement
        );
        assert!(report.score > 0);
    }

    #[test]
    fn repeated_analysis_is_identical() {
        let python = b"import os, pickle\n\
                       data = pickle.loads(blob)\n\
                       os.system('rm -rf ' + data)\n\
                       exec(compile(src, 'x', 'exec'))\n\
                       open('/etc/passwd').read()\n\
                       x = (1\n";
        let sql = b"DROP TABLE audit;\n\
                    DELETE FROM users;\n\
                    SELECT * FROM t WHERE name = 'a' OR 1=1;\n\
                    ATTACH DATABASE 'other.db' AS o;\n";
        let first = analyzer();
        let second = analyzer();
        for (kind, content) in [(FileKind::Python, &python[..]), (FileKind::Sql, &sql[..])] {
            let report = first.analyze_source(kind, content);
            assert!(report.findings.len() > 2, "{:?}", report);
            assert_eq!(first.analyze_source(kind, content), report);
            assert_eq!(second.analyze_source(kind, content), report);
        }
    }
}
