/// Python static scan
///
/// The lexer blanks comments and string literal contents so rules only ever
/// see code. Literal spans are kept for the hardcoded-credential check.
use crate::analyzer::rules::{self, Hit, Rule, RuleSpec};
use crate::analyzer::source::{blank, check_brackets, Lexed};
use crate::config::types::{Result, RiskCategory as C, Severity as S};
use regex::Regex;

const RULES: &[RuleSpec] = &[
    // Dynamic code execution
    ("py-eval", C::CodeInjection, S::High, r"\beval\s*\(", "dynamic code evaluation via eval()"),
    ("py-exec", C::CodeInjection, S::High, r"\bexec\s*\(", "dynamic code execution via exec()"),
    ("py-compile", C::CodeInjection, S::Medium, r"(?:^|[^.\w])(?P<at>compile)\s*\(", "runtime code compilation via compile()"),
    ("py-dunder-import", C::CodeInjection, S::Medium, r"\b__import__\s*\(", "dynamic import via __import__()"),
    ("py-pickle-load", C::CodeInjection, S::High, r"\b(?:pickle|cPickle|_pickle|dill|jsonpickle)\s*\.\s*(?:loads?|Unpickler|decode)\b", "unsafe deserialization of untrusted data"),
    ("py-shelve-open", C::CodeInjection, S::Medium, r"\bshelve\s*\.\s*open\s*\(", "shelve storage is pickle-backed"),
    ("py-marshal-load", C::CodeInjection, S::High, r"\bmarshal\s*\.\s*loads?\s*\(", "unsafe deserialization via marshal"),
    ("py-yaml-load", C::CodeInjection, S::Medium, r"\byaml\s*\.\s*(?:load|unsafe_load|full_load|load_all)\s*\(", "yaml loading can construct arbitrary objects"),
    // Command injection: a process call fed straight from user-controlled input
    ("py-command-injection", C::CodeInjection, S::Critical, r"\b(?:system|popen|call|run|Popen|check_call|check_output|getoutput)\s*\([^)\n]*?\b(?:input\s*\(|argv\b|getenv\s*\(|environ\b)", "command built from user-controlled input"),
    // Process execution
    ("py-os-system", C::UnsafeExec, S::High, r"\bos\s*\.\s*system\s*\(", "shell command execution via os.system()"),
    ("py-os-popen", C::UnsafeExec, S::High, r"\bos\s*\.\s*popen\s*\(", "shell command execution via os.popen()"),
    ("py-os-exec", C::UnsafeExec, S::High, r"\bos\s*\.\s*(?:exec[lv]p?e?|spawn[lv]p?e?|posix_spawnp?|fork|forkpty)\s*\(", "process replacement or spawning via os"),
    ("py-subprocess", C::UnsafeExec, S::Medium, r"\bsubprocess\s*\.\s*(?:run|call|check_call|check_output|Popen|getoutput|getstatusoutput)\s*\(", "process execution via subprocess"),
    ("py-shell-true", C::UnsafeExec, S::High, r"\bshell\s*=\s*True\b", "subprocess invoked through a shell"),
    // File access
    ("py-open", C::UnsafeIo, S::Medium, r"(?:^|[^.\w])(?P<at>open)\s*\(", "file access via open()"),
    ("py-io-open", C::UnsafeIo, S::Medium, r"\b(?:io|os|codecs)\s*\.\s*open\s*\(", "file access via low-level open"),
    ("py-os-destructive", C::UnsafeIo, S::High, r"\bos\s*\.\s*(?:remove|unlink|rmdir|removedirs|rename|renames|replace|chmod|chown|truncate|symlink|link)\s*\(", "destructive filesystem call"),
    ("py-shutil-rmtree", C::UnsafeIo, S::High, r"\bshutil\s*\.\s*rmtree\s*\(", "recursive directory deletion"),
    ("py-shutil-copy", C::UnsafeIo, S::Medium, r"\bshutil\s*\.\s*(?:move|copy|copy2|copyfile|copytree|chown)\s*\(", "filesystem copy or move via shutil"),
    ("py-path-io", C::UnsafeIo, S::Medium, r"\.\s*(?:write_text|write_bytes|read_text|read_bytes|unlink|rmdir|touch|chmod)\s*\(", "file access via pathlib"),
    // Network
    ("py-socket", C::UnsafeNetwork, S::High, r"\bsocket\s*\.\s*(?:socket|create_connection|create_server|socketpair)\s*\(", "raw socket use"),
    ("py-http-client", C::UnsafeNetwork, S::Medium, r"\b(?:requests|httpx|aiohttp)\s*\.\s*(?:get|post|put|delete|patch|head|options|request|Session|ClientSession)\s*\(", "outbound HTTP request"),
    ("py-urlopen", C::UnsafeNetwork, S::Medium, r"\b(?:urlopen|urlretrieve)\s*\(", "outbound URL fetch"),
    ("py-http-connection", C::UnsafeNetwork, S::Medium, r"\bHTTPS?Connection\s*\(", "outbound HTTP connection"),
];

/// Module import risk: top-level module, severity, reason
const DANGEROUS_MODULES: &[(&str, S, &str)] = &[
    ("ctypes", S::High, "native memory access"),
    ("cffi", S::High, "native memory access"),
    ("pty", S::High, "pseudo-terminal spawning"),
    ("subprocess", S::Medium, "process execution"),
    ("multiprocessing", S::Medium, "process spawning"),
    ("pickle", S::Medium, "unsafe deserialization"),
    ("cPickle", S::Medium, "unsafe deserialization"),
    ("dill", S::Medium, "unsafe deserialization"),
    ("marshal", S::Medium, "unsafe deserialization"),
    ("shelve", S::Medium, "unsafe deserialization"),
    ("socket", S::Low, "network access"),
    ("socketserver", S::Low, "network access"),
    ("ftplib", S::Low, "network access"),
    ("telnetlib", S::Low, "network access"),
    ("smtplib", S::Low, "network access"),
    ("paramiko", S::Low, "network access"),
    ("requests", S::Low, "network access"),
    ("httpx", S::Low, "network access"),
    ("urllib", S::Low, "network access"),
    ("http", S::Low, "network access"),
];

/// Compiled Python rule set
pub(crate) struct PythonRules {
    rules: Vec<Rule>,
    import_stmt: Regex,
    from_stmt: Regex,
    credential: Regex,
}

impl PythonRules {
    pub fn new() -> Result<Self> {
        Ok(Self {
            rules: rules::compile(RULES)?,
            import_stmt: rules::pattern(r"(?m)(?:^|;)[ \t]*import[ \t]+(?P<list>[^\n;#]+)")?,
            from_stmt: rules::pattern(r"(?m)(?:^|;)[ \t]*from[ \t]+(?P<module>[\w.]+)[ \t]+import\b")?,
            credential: rules::pattern(
                r"(?i)\b(?P<at>[a-z_][a-z0-9_]*?(?:password|passwd|pwd|secret|api_?key|access_?key|private_?key|auth_?token|token))\s*=\s*[rbu]{0,2}(?P<q>['\x22])",
            )?,
        })
    }

    pub fn scan(&self, text: &str) -> (Vec<Hit>, Lexed) {
        let lexed = lex(text);
        let mut hits = Vec::new();

        rules::scan(&self.rules, &lexed.masked, 0, 1, &mut hits);
        let next = self.rules.len() + 1;
        self.scan_imports(&lexed.masked, next, &mut hits);
        self.scan_credentials(&lexed, next + 1, &mut hits);

        (hits, lexed)
    }

    fn scan_imports(&self, masked: &str, order: usize, hits: &mut Vec<Hit>) {
        for caps in self.import_stmt.captures_iter(masked) {
            let Some(list) = caps.name("list") else { continue };
            let mut cursor = list.start();
            for item in list.as_str().split(',') {
                let leading = item.len() - item.trim_start().len();
                let module = item.split_whitespace().next().unwrap_or("");
                flag_module(module, cursor + leading, order, hits);
                cursor += item.len() + 1;
            }
        }
        for caps in self.from_stmt.captures_iter(masked) {
            if let Some(module) = caps.name("module") {
                flag_module(module.as_str(), module.start(), order, hits);
            }
        }
    }

    fn scan_credentials(&self, lexed: &Lexed, order: usize, hits: &mut Vec<Hit>) {
        for caps in self.credential.captures_iter(&lexed.masked) {
            let (Some(name), Some(quote)) = (caps.name("at"), caps.name("q")) else {
                continue;
            };
            let non_empty = lexed
                .literal_after_quote(quote.start())
                .map(|(start, end)| end > start)
                .unwrap_or(false);
            if non_empty {
                hits.push(Hit {
                    offset: name.start(),
                    order,
                    rule_id: "py-hardcoded-secret",
                    category: C::HardcodedSecret,
                    severity: S::High,
                    description: format!("hardcoded credential assigned to `{}`", name.as_str()),
                });
            }
        }
    }
}

fn flag_module(module: &str, offset: usize, order: usize, hits: &mut Vec<Hit>) {
    let top = module.split('.').next().unwrap_or(module);
    if let Some((_, severity, reason)) = DANGEROUS_MODULES.iter().find(|(name, _, _)| *name == top) {
        hits.push(Hit {
            offset,
            order,
            rule_id: "py-dangerous-import",
            category: C::DangerousImport,
            severity: *severity,
            description: format!("import of `{module}` ({reason})"),
        });
    }
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b >= 0x80
}

fn is_string_prefix(ident: &[u8]) -> bool {
    ident.len() <= 2
        && ident
            .iter()
            .all(|b| matches!(b, b'r' | b'R' | b'b' | b'B' | b'u' | b'U' | b'f' | b'F'))
}

/// Mask comments and string contents, keeping every byte offset in place
pub(crate) fn lex(text: &str) -> Lexed {
    let src = text.as_bytes();
    let n = src.len();
    let mut buf = src.to_vec();
    let mut lexed = Lexed::default();
    let mut i = 0;

    while i < n {
        let c = src[i];
        if c == b'#' {
            let end = src[i..].iter().position(|b| *b == b'\n').map_or(n, |p| i + p);
            blank(&mut buf, i, end);
            i = end;
            continue;
        }

        let quote_at = if c == b'\'' || c == b'"' {
            Some(i)
        } else if is_ident_byte(c) && !c.is_ascii_digit() {
            let end = src[i..]
                .iter()
                .position(|b| !is_ident_byte(*b))
                .map_or(n, |p| i + p);
            if end < n && (src[end] == b'\'' || src[end] == b'"') && is_string_prefix(&src[i..end]) {
                Some(end)
            } else {
                i = end;
                continue;
            }
        } else {
            None
        };

        let Some(q) = quote_at else {
            i += 1;
            continue;
        };

        let quote = src[q];
        let triple = q + 2 < n && src[q + 1] == quote && src[q + 2] == quote;
        let content_start = if triple { q + 3 } else { q + 1 };
        let mut k = content_start;
        let (content_end, resume) = loop {
            if k >= n {
                lexed.note_issue(i, "unterminated string literal");
                break (n, n);
            }
            let b = src[k];
            if b == b'\\' {
                k = (k + 2).min(n);
                continue;
            }
            if triple {
                if src[k..].starts_with(&[quote; 3]) {
                    break (k, k + 3);
                }
            } else if b == quote {
                break (k, k + 1);
            } else if b == b'\n' {
                lexed.note_issue(i, "unterminated string literal");
                break (k, k);
            }
            k += 1;
        };

        lexed.literals.push((content_start, content_end));
        blank(&mut buf, content_start, content_end);
        i = resume;
    }

    let masked = String::from_utf8(buf)
        .unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned());
    check_brackets(&masked, &mut lexed);
    lexed.masked = masked;
    lexed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule_ids(text: &str) -> Vec<&'static str> {
        let rules = PythonRules::new().unwrap();
        let (mut hits, _) = rules.scan(text);
        rules::order_hits(&mut hits);
        hits.into_iter().map(|h| h.rule_id).collect()
    }

    #[test]
    fn lexer_masks_strings_and_comments_in_place() {
        let src = "x = 'eval(1)'  # os.system('x')\ny = 2\n";
        let lexed = lex(src);
        assert_eq!(lexed.masked.len(), src.len());
        assert!(!lexed.masked.contains("eval"));
        assert!(!lexed.masked.contains("system"));
        assert!(lexed.masked.contains("y = 2"));
        assert!(lexed.issue.is_none());
    }

    #[test]
    fn lexer_handles_prefixes_triple_quotes_and_escapes() {
        let src = "a = rb'\\''\nb = \"\"\"multi\n'line' eval()\"\"\"\nc = f\"{x}\"\n";
        let lexed = lex(src);
        assert!(lexed.issue.is_none(), "{:?}", lexed.issue);
        assert!(!lexed.masked.contains("eval"));
        assert_eq!(lexed.literals.len(), 3);
    }

    #[test]
    fn lexer_reports_unterminated_string() {
        let lexed = lex("x = 'open\nprint(1)\n");
        assert_eq!(lexed.issue.as_ref().map(|(o, _)| *o), Some(4));
    }

    #[test]
    fn lexer_reports_unterminated_triple_quote() {
        let lexed = lex("x = '''never closed\n");
        assert!(lexed.issue.is_some());
    }

    #[test]
    fn ignores_calls_inside_strings_and_comments() {
        assert!(rule_ids("print('eval(x)')  # exec(y)\n").is_empty());
    }

    #[test]
    fn flags_eval_and_os_system_in_source_order() {
        let ids = rule_ids("import os\nos.system('ls')\nresult = eval(data)\n");
        assert_eq!(ids, vec!["py-os-system", "py-eval"]);
    }

    #[test]
    fn flags_open_but_not_method_named_open() {
        assert_eq!(rule_ids("f = open('x.txt')\n"), vec!["py-open"]);
        assert!(rule_ids("browser.open(url)\n").is_empty());
    }

    #[test]
    fn flags_command_injection_from_input() {
        let ids = rule_ids("import os\nos.system(input('cmd: '))\n");
        assert!(ids.contains(&"py-command-injection"));
        assert!(ids.contains(&"py-os-system"));
    }

    #[test]
    fn flags_dangerous_imports_per_module() {
        let ids = rule_ids("import os, ctypes\nfrom pickle import loads\n");
        assert_eq!(ids, vec!["py-dangerous-import", "py-dangerous-import"]);
    }

    #[test]
    fn flags_hardcoded_secret_only_for_non_empty_literals() {
        assert_eq!(rule_ids("db_password = 'hunter2'\n"), vec!["py-hardcoded-secret"]);
        assert!(rule_ids("password = ''\n").is_empty());
        assert!(rule_ids("password = get_password()\n").is_empty());
        assert!(rule_ids("if password == 'x': pass\n").is_empty());
    }

    #[test]
    fn flags_network_calls() {
        let ids = rule_ids("import socket\ns = socket.socket()\n");
        assert_eq!(ids, vec!["py-dangerous-import", "py-socket"]);
    }
}
