/// SQL static scan
///
/// Comments and literal contents are blanked, then the masked script is
/// split into statements at `;`. Statement-anchored rules (`^`) see each
/// statement with leading whitespace trimmed.
use crate::analyzer::rules::{self, Hit, Rule, RuleSpec};
use crate::analyzer::source::{blank, check_brackets, Lexed};
use crate::config::types::{Result, RiskCategory as C, Severity as S};
use regex::Regex;

const RULES: &[RuleSpec] = &[
    // Destructive statements
    ("sql-drop-database", C::DestructiveStatement, S::Critical, r"(?i)^DROP\s+(?:DATABASE|SCHEMA)\b", "drops an entire database"),
    ("sql-drop-table", C::DestructiveStatement, S::High, r"(?i)^DROP\s+TABLE\b", "drops a table and all of its rows"),
    ("sql-drop-object", C::DestructiveStatement, S::Medium, r"(?i)^DROP\s+(?:VIEW|INDEX|TRIGGER|PROCEDURE|FUNCTION)\b", "drops a schema object"),
    ("sql-truncate", C::DestructiveStatement, S::High, r"(?i)^TRUNCATE\b", "removes every row of a table"),
    ("sql-drop-column", C::DestructiveStatement, S::Medium, r"(?is)^ALTER\s+TABLE\b.*?\b(?P<at>DROP)\b", "drops part of a table"),
    // Injection-enabling constructs
    ("sql-exec-dynamic", C::SqlInjectionPattern, S::High, r"(?i)\bEXEC(?:UTE)?\s*\(", "executes dynamically built SQL"),
    ("sql-execute-immediate", C::SqlInjectionPattern, S::High, r"(?i)\bEXECUTE\s+IMMEDIATE\b", "executes dynamically built SQL"),
    ("sql-executesql", C::SqlInjectionPattern, S::High, r"(?i)\bsp_executesql\b", "executes dynamically built SQL"),
    ("sql-prepare-from", C::SqlInjectionPattern, S::Medium, r"(?i)^PREPARE\s+\w+\s+FROM\b", "prepares a statement from dynamic text"),
    ("sql-tautology", C::SqlInjectionPattern, S::High, r"(?i)\bOR\s+(?P<at>(?:'[^']*'|\d+)\s*=\s*(?:'[^']*'|\d+))", "always-true predicate"),
    // Privilege changes
    ("sql-grant-all", C::PrivilegeEscalation, S::Critical, r"(?i)^GRANT\s+ALL\b", "grants every privilege"),
    ("sql-grant-option", C::PrivilegeEscalation, S::High, r"(?i)\bWITH\s+(?:GRANT|ADMIN)\s+OPTION\b", "lets the grantee re-grant privileges"),
    ("sql-alter-user", C::PrivilegeEscalation, S::High, r"(?i)^ALTER\s+(?:USER|ROLE|LOGIN)\b", "changes an account or role"),
    ("sql-create-user", C::PrivilegeEscalation, S::Medium, r"(?i)^CREATE\s+(?:USER|ROLE|LOGIN)\b", "creates an account or role"),
    // Host access
    ("sql-attach", C::UnsafeIo, S::High, r"(?i)^ATTACH\b", "attaches another database file"),
    ("sql-file-function", C::UnsafeIo, S::High, r"(?i)\b(?:readfile|writefile|pg_read_file|pg_read_binary_file|lo_import|lo_export)\s*\(", "reads or writes host files"),
    ("sql-into-outfile", C::UnsafeIo, S::High, r"(?i)\bINTO\s+(?:OUTFILE|DUMPFILE)\b", "writes query results to a host file"),
    ("sql-load-data", C::UnsafeIo, S::High, r"(?i)^LOAD\s+DATA\s+(?:LOCAL\s+)?INFILE\b", "loads a host file"),
    ("sql-writable-schema", C::UnsafeIo, S::Medium, r"(?i)^PRAGMA\s+writable_schema\b", "allows direct edits of the schema table"),
    ("sql-load-extension", C::UnsafeExec, S::Critical, r"(?i)\bload_extension\s*\(", "loads native code into the database process"),
    ("sql-copy-program", C::UnsafeExec, S::Critical, r"(?is)^COPY\b.*?\b(?:FROM|TO)\s+PROGRAM\b", "runs a host program"),
    ("sql-xp-cmdshell", C::UnsafeExec, S::Critical, r"(?i)\bxp_cmdshell\b", "runs a host shell command"),
];

/// Statement keywords the scanner understands
const KNOWN_STATEMENTS: &[&str] = &[
    "ALTER", "ANALYZE", "ATTACH", "BEGIN", "CALL", "COMMENT", "COMMIT", "COPY", "CREATE",
    "DEALLOCATE", "DECLARE", "DELETE", "DESC", "DESCRIBE", "DETACH", "DROP", "END", "EXEC",
    "EXECUTE", "EXPLAIN", "GRANT", "INSERT", "LOAD", "LOCK", "MERGE", "PRAGMA", "PREPARE",
    "REINDEX", "RELEASE", "RENAME", "REPLACE", "REVOKE", "ROLLBACK", "SAVEPOINT", "SELECT",
    "SET", "SHOW", "START", "TRUNCATE", "UNLOCK", "UPDATE", "UPSERT", "USE", "VACUUM", "VALUES",
    "WITH",
];

/// Compiled SQL rule set
pub(crate) struct SqlRules {
    rules: Vec<Rule>,
    where_clause: Regex,
    literal_predicate: Regex,
    parameter_marker: Regex,
    query_keyword: Regex,
    user_input: Regex,
}

/// One statement: masked text with leading whitespace trimmed, and its byte offset
struct Statement<'a> {
    text: &'a str,
    offset: usize,
}

impl SqlRules {
    pub fn new() -> Result<Self> {
        Ok(Self {
            rules: rules::compile(RULES)?,
            where_clause: rules::pattern(r"(?i)\bWHERE\b")?,
            literal_predicate: rules::pattern(
                r"(?is)\b(?P<at>WHERE)\b.*?(?:=|<>|!=|\bLIKE\b|\bIN\s*\()\s*'",
            )?,
            parameter_marker: rules::pattern(r"\?|[:@$][A-Za-z_0-9]")?,
            query_keyword: rules::pattern(
                r"(?i)\b(?:SELECT|INSERT|UPDATE|DELETE|DROP|EXEC|UNION|WHERE)\b",
            )?,
            user_input: rules::pattern(r"(?i)\b(?:input|argv|getenv|request|user_input|param)\w*\b")?,
        })
    }

    pub fn scan(&self, text: &str) -> (Vec<Hit>, Lexed) {
        let mut lexed = lex(text);
        let statements = split_statements(&lexed.masked);
        let has_parameters = self.parameter_marker.is_match(&lexed.masked);
        let mut hits = Vec::new();

        let mut issues = Vec::new();

        let base_order = self.rules.len() + 1;
        for stmt in &statements {
            if let Some(keyword) = leading_keyword(stmt.text) {
                if !KNOWN_STATEMENTS.contains(&keyword.to_ascii_uppercase().as_str()) {
                    issues.push((stmt.offset, format!("unrecognised statement `{keyword}`")));
                }
            } else if !stmt.text.starts_with('(') {
                issues.push((stmt.offset, "statement does not start with a keyword".to_string()));
            }

            rules::scan(&self.rules, stmt.text, stmt.offset, 1, &mut hits);
            self.check_unguarded(stmt, base_order, &mut hits);
            if !has_parameters {
                self.check_literal_predicate(stmt, base_order + 1, &mut hits);
            }
            self.check_concatenation(text, stmt, &lexed, base_order + 2, &mut hits);
        }
        drop(statements);

        for (offset, description) in issues {
            lexed.note_issue(offset, description);
        }
        (hits, lexed)
    }

    /// DELETE / UPDATE with no WHERE clause touch every row
    fn check_unguarded(&self, stmt: &Statement<'_>, order: usize, hits: &mut Vec<Hit>) {
        let Some(keyword) = leading_keyword(stmt.text) else { return };
        let (rule_id, severity, description) = match keyword.to_ascii_uppercase().as_str() {
            "DELETE" => ("sql-delete-no-where", S::High, "DELETE without WHERE removes every row"),
            "UPDATE" => ("sql-update-no-where", S::Medium, "UPDATE without WHERE rewrites every row"),
            _ => return,
        };
        if self.where_clause.is_match(stmt.text) {
            return;
        }
        hits.push(Hit {
            offset: stmt.offset,
            order,
            rule_id,
            category: C::DestructiveStatement,
            severity,
            description: description.to_string(),
        });
    }

    /// A script that never uses parameter markers and filters on inline literals
    fn check_literal_predicate(&self, stmt: &Statement<'_>, order: usize, hits: &mut Vec<Hit>) {
        if let Some(at) = self
            .literal_predicate
            .captures(stmt.text)
            .and_then(|caps| caps.name("at"))
        {
            hits.push(Hit {
                offset: stmt.offset + at.start(),
                order,
                rule_id: "sql-literal-predicate",
                category: C::SqlInjectionPattern,
                severity: S::Low,
                description: "predicate compares against an inline literal; script uses no parameter markers"
                    .to_string(),
            });
        }
    }

    /// Query text glued together with `||` or `+`
    fn check_concatenation(
        &self,
        raw: &str,
        stmt: &Statement<'_>,
        lexed: &Lexed,
        order: usize,
        hits: &mut Vec<Hit>,
    ) {
        let stmt_end = stmt.offset + stmt.text.len();
        let masked = lexed.masked.as_str();
        for &(start, end) in &lexed.literals {
            if start < stmt.offset || end > stmt_end {
                continue;
            }
            if !self.query_keyword.is_match(&raw[start..end]) {
                continue;
            }
            let after = masked[(end + 1).min(masked.len())..].trim_start();
            let before = masked[..start.saturating_sub(1)].trim_end();
            let glued = after.starts_with("||")
                || after.starts_with('+')
                || before.ends_with("||")
                || before.ends_with('+');
            if !glued {
                continue;
            }
            let severity = if self.user_input.is_match(stmt.text) {
                S::Critical
            } else {
                S::High
            };
            hits.push(Hit {
                offset: start - 1,
                order,
                rule_id: "sql-concat-query",
                category: C::SqlInjectionPattern,
                severity,
                description: "query text assembled by string concatenation".to_string(),
            });
        }
    }
}

fn leading_keyword(text: &str) -> Option<&str> {
    let end = text
        .find(|c: char| !(c.is_ascii_alphabetic() || c == '_'))
        .unwrap_or(text.len());
    (end > 0).then(|| &text[..end])
}

fn split_statements(masked: &str) -> Vec<Statement<'_>> {
    let mut statements = Vec::new();
    let mut start = 0;
    for piece in masked.split(';') {
        let trimmed = piece.trim_start();
        if !trimmed.trim_end().is_empty() {
            statements.push(Statement {
                text: trimmed.trim_end(),
                offset: start + (piece.len() - trimmed.len()),
            });
        }
        start += piece.len() + 1;
    }
    statements
}

/// Mask comments, string literals and quoted identifiers
pub(crate) fn lex(text: &str) -> Lexed {
    let src = text.as_bytes();
    let n = src.len();
    let mut buf = src.to_vec();
    let mut lexed = Lexed::default();
    let mut i = 0;

    while i < n {
        match src[i] {
            b'-' if src.get(i + 1) == Some(&b'-') => {
                let end = src[i..].iter().position(|b| *b == b'\n').map_or(n, |p| i + p);
                blank(&mut buf, i, end);
                i = end;
            }
            b'/' if src.get(i + 1) == Some(&b'*') => {
                let end = match text[i + 2..].find("*/") {
                    Some(p) => i + 2 + p + 2,
                    None => {
                        lexed.note_issue(i, "unterminated block comment");
                        n
                    }
                };
                blank(&mut buf, i, end);
                i = end;
            }
            quote @ (b'\'' | b'"' | b'`') => {
                let content_start = i + 1;
                let mut k = content_start;
                let content_end = loop {
                    if k >= n {
                        let what = if quote == b'\'' { "string literal" } else { "quoted identifier" };
                        lexed.note_issue(i, format!("unterminated {what}"));
                        break n;
                    }
                    if src[k] == quote {
                        // doubled quote is an escaped quote
                        if src.get(k + 1) == Some(&quote) {
                            k += 2;
                            continue;
                        }
                        break k;
                    }
                    k += 1;
                };
                if quote == b'\'' {
                    lexed.literals.push((content_start, content_end));
                }
                blank(&mut buf, content_start, content_end);
                i = (content_end + 1).min(n);
            }
            _ => i += 1,
        }
    }

    let masked = String::from_utf8(buf)
        .unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned());
    check_brackets(&masked, &mut lexed);
    lexed.masked = masked;
    lexed
}
