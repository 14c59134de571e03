//! Pre-dispatch checks on untrusted payloads.
//!
//! Query mode is read-only by construction: the statement grammar is checked
//! here, the driver opens the snapshot read-only, and the driver refuses any
//! statement SQLite itself does not report as read-only. Script mode gets a
//! configurable list of banned patterns.

use regex::Regex;
use std::sync::LazyLock;

use crate::errors::EngineError;

const ALLOWED_LEADING: &[&str] = &["SELECT", "WITH", "VALUES", "EXPLAIN"];

const FORBIDDEN: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "UPSERT", "CREATE", "DROP", "ALTER", "ATTACH", "DETACH",
    "PRAGMA", "VACUUM", "REINDEX", "ANALYZE", "BEGIN", "COMMIT", "ROLLBACK", "SAVEPOINT",
    "RELEASE", "TRANSACTION",
];

static WORD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z_][A-Za-z0-9_]*").expect("word pattern is valid"));

static REPLACE_INTO_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bREPLACE\s+INTO\b").expect("REPLACE INTO pattern is valid")
});

/// Rejects scripts matching any configured pattern.
#[derive(Debug, Clone)]
pub struct PayloadGuard {
    patterns: Vec<Regex>,
}

impl PayloadGuard {
    pub fn new(patterns: &[String]) -> Result<Self, EngineError> {
        let patterns = patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| {
                    EngineError::ConfigError(format!("invalid payload_guard pattern '{}': {}", p, e))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    /// `Err` carries the reason the payload was refused.
    pub fn check(&self, payload: &str) -> Result<(), String> {
        match self.patterns.iter().find(|p| p.is_match(payload)) {
            Some(pattern) => Err(format!(
                "payload matches banned pattern '{}'",
                pattern.as_str()
            )),
            None => Ok(()),
        }
    }
}

/// Accept exactly one read-only statement. `Err` carries the reason.
pub fn validate_read_only(sql: &str) -> Result<(), String> {
    let stripped = strip_comments_and_literals(sql);
    let body = stripped.trim_end();
    let body = body.strip_suffix(';').unwrap_or(body).trim();

    if body.is_empty() {
        return Err("query is empty".to_string());
    }
    if body.contains(';') {
        return Err("only a single statement is allowed".to_string());
    }

    let mut words = WORD_RE.find_iter(body).map(|m| m.as_str().to_ascii_uppercase());

    let leading = words.next().unwrap_or_default();
    if !ALLOWED_LEADING.contains(&leading.as_str()) {
        return Err(format!(
            "statement must start with one of {}, found '{}'",
            ALLOWED_LEADING.join(", "),
            leading
        ));
    }

    if let Some(keyword) = words.find(|w| FORBIDDEN.contains(&w.as_str())) {
        return Err(format!("'{}' is not allowed in a read-only query", keyword));
    }

    if REPLACE_INTO_RE.is_match(body) {
        return Err("'REPLACE INTO' is not allowed in a read-only query".to_string());
    }

    Ok(())
}

/// Blank out comments, string literals and quoted identifiers so that only
/// bare SQL remains. Unterminated constructs swallow the rest of the input.
fn strip_comments_and_literals(sql: &str) -> String {
    let chars: Vec<char> = sql.chars().collect();
    let mut out = String::with_capacity(sql.len());
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            '-' if next == Some('-') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
                out.push(' ');
            }
            '/' if next == Some('*') => {
                i += 2;
                while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                    i += 1;
                }
                i += 2;
                out.push(' ');
            }
            '\'' | '"' | '`' | '[' => {
                let close = if c == '[' { ']' } else { c };
                i += 1;
                loop {
                    match chars.get(i) {
                        None => break,
                        // Doubled quote is an escaped quote.
                        Some(&ch) if ch == close && close != ']' && chars.get(i + 1) == Some(&close) => {
                            i += 2;
                        }
                        Some(&ch) if ch == close => {
                            i += 1;
                            break;
                        }
                        Some(_) => i += 1,
                    }
                }
                out.push_str(" x ");
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_plain_selects() {
        assert!(validate_read_only("SELECT * FROM data").is_ok());
        assert!(validate_read_only("  select a, count(*) from data group by a;  ").is_ok());
        assert!(validate_read_only(
            "WITH t AS (SELECT a FROM data) SELECT replace(a, 'x', 'y') FROM t"
        )
        .is_ok());
        assert!(validate_read_only("VALUES (1), (2)").is_ok());
    }

    #[test]
    fn test_keywords_inside_literals_are_ignored() {
        assert!(validate_read_only("SELECT 'DROP TABLE data; --' AS s").is_ok());
        assert!(validate_read_only("SELECT \"update\" FROM data").is_ok());
        assert!(validate_read_only("SELECT 1 -- DELETE FROM data").is_ok());
        assert!(validate_read_only("SELECT /* ; INSERT */ 1").is_ok());
        assert!(validate_read_only("SELECT 'it''s' FROM data").is_ok());
    }

    #[test]
    fn test_rejects_writes_and_ddl() {
        for sql in [
            "DELETE FROM data",
            "UPDATE data SET a = 1",
            "INSERT INTO data VALUES (1)",
            "DROP TABLE data",
            "PRAGMA writable_schema = 1",
            "ATTACH DATABASE '/tmp/x.db' AS x",
            "WITH t AS (SELECT 1) DELETE FROM data",
            "WITH t AS (SELECT 1) REPLACE INTO data SELECT * FROM t",
            "EXPLAIN DELETE FROM data",
        ] {
            assert!(validate_read_only(sql).is_err(), "accepted: {sql}");
        }
    }

    #[test]
    fn test_keyword_patterns_compile_once() {
        let words: Vec<&str> = LazyLock::force(&WORD_RE)
            .find_iter("select a_1 FROM t2")
            .map(|m| m.as_str())
            .collect();
        assert_eq!(words, ["select", "a_1", "FROM", "t2"]);
        assert!(LazyLock::force(&REPLACE_INTO_RE).is_match("replace   into data"));
        assert!(!REPLACE_INTO_RE.is_match("SELECT replace(a, 'x', 'y') INTO"));

        // Both statics are reused across calls.
        let first: *const Regex = &*WORD_RE;
        for _ in 0..3 {
            assert!(validate_read_only("SELECT 1").is_ok());
        }
        assert!(std::ptr::eq(first, &*WORD_RE));
    }

    #[test]
    fn test_rejects_multiple_statements() {
        let err = validate_read_only("SELECT 1; SELECT 2").unwrap_err();
        assert!(err.contains("single statement"));
        assert!(validate_read_only("SELECT 1;;").is_err());
    }

    #[test]
    fn test_rejects_empty() {
        assert!(validate_read_only("").is_err());
        assert!(validate_read_only(" -- just a comment\n").is_err());
        assert!(validate_read_only(";").is_err());
    }

    #[test]
    fn test_payload_guard_defaults() {
        let config = crate::config::EngineConfig::default();
        let guard = PayloadGuard::new(&config.payload_guard).unwrap();
        assert!(guard.check("let x = df.len();\noutput_data = x;").is_ok());
        assert!(guard.check("eval(\"40 + 2\")").is_err());
        assert!(guard.check("import \"os\" as os;").is_err());
        assert!(guard.check("let evaluation = 1;").is_ok());
    }

    #[test]
    fn test_payload_guard_bad_pattern() {
        assert!(PayloadGuard::new(&["[".to_string()]).is_err());
    }
}
