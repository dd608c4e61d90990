//! Enforces the read-only contract before any statement reaches the database
//! (spec §4.2). A whitelist-plus-keyword-blacklist layered check, using
//! `regex` the way `krabs-core/src/hooks/registry.rs`'s `HookRegistry`
//! matches a tool name against a pattern.

use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

const BLACKLIST: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "TRUNCATE", "ALTER", "CREATE", "REPLACE", "GRANT",
    "REVOKE", "ATTACH", "DETACH", "PRAGMA", "VACUUM", "EXEC", "EXECUTE",
];

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("statement must start with SELECT or WITH")]
    NotReadOnly,
    #[error("statement contains a blacklisted keyword: {0}")]
    BlacklistedKeyword(String),
    #[error("statement contains multiple SQL statements")]
    MultipleStatements,
    #[error("statement must reference table `{0}`")]
    MissingTable(String),
}

pub struct SqlValidator {
    table_name: String,
}

fn word_re(word: &str) -> Regex {
    Regex::new(&format!(r"(?i)\b{}\b", regex::escape(word))).expect("static pattern")
}

fn blacklist_res() -> &'static [(&'static str, Regex)] {
    static CELL: OnceLock<Vec<(&'static str, Regex)>> = OnceLock::new();
    CELL.get_or_init(|| BLACKLIST.iter().map(|w| (*w, word_re(w))).collect())
}

impl SqlValidator {
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
        }
    }

    pub fn validate(&self, sql: &str) -> Result<(), ValidationError> {
        let normalized = normalize(sql);

        if !(normalized.starts_with("SELECT") || normalized.starts_with("WITH")) {
            return Err(ValidationError::NotReadOnly);
        }

        for (word, re) in blacklist_res() {
            if re.is_match(&normalized) {
                return Err(ValidationError::BlacklistedKeyword((*word).to_string()));
            }
        }

        if has_trailing_statement(sql) {
            return Err(ValidationError::MultipleStatements);
        }

        let table_re = word_re(&self.table_name);
        if !table_re.is_match(sql) {
            return Err(ValidationError::MissingTable(self.table_name.clone()));
        }

        Ok(())
    }
}

fn normalize(sql: &str) -> String {
    sql.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase()
}

/// True if a `;` is followed by non-whitespace, non-comment content.
fn has_trailing_statement(sql: &str) -> bool {
    let Some((_, rest)) = sql.split_once(';') else {
        return false;
    };
    strip_comments(rest).trim().is_empty().not()
}

trait Not {
    fn not(self) -> bool;
}
impl Not for bool {
    fn not(self) -> bool {
        !self
    }
}

fn strip_comments(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '-' && chars.peek() == Some(&'-') {
            for c in chars.by_ref() {
                if c == '\n' {
                    break;
                }
            }
            continue;
        }
        if c == '/' && chars.peek() == Some(&'*') {
            chars.next();
            let mut prev = ' ';
            for c in chars.by_ref() {
                if prev == '*' && c == '/' {
                    break;
                }
                prev = c;
            }
            continue;
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v() -> SqlValidator {
        SqlValidator::new("app_portfolio")
    }

    #[test]
    fn accepts_simple_select() {
        assert!(v()
            .validate("SELECT COUNT(*) FROM app_portfolio")
            .is_ok());
    }

    #[test]
    fn accepts_with_cte() {
        assert!(v()
            .validate("WITH t AS (SELECT * FROM app_portfolio) SELECT * FROM t")
            .is_ok());
    }

    #[test]
    fn rejects_non_select() {
        assert_eq!(
            v().validate("UPDATE app_portfolio SET x = 1"),
            Err(ValidationError::NotReadOnly)
        );
    }

    #[test]
    fn rejects_blacklisted_keyword_mid_query() {
        assert_eq!(
            v().validate("SELECT * FROM app_portfolio; DROP TABLE app_portfolio"),
            Err(ValidationError::BlacklistedKeyword("DROP".to_string()))
        );
    }

    #[test]
    fn rejects_missing_table() {
        assert_eq!(
            v().validate("SELECT * FROM other_table"),
            Err(ValidationError::MissingTable("app_portfolio".to_string()))
        );
    }

    #[test]
    fn rejects_stacked_statements() {
        assert_eq!(
            v().validate("SELECT * FROM app_portfolio; SELECT 1"),
            Err(ValidationError::MultipleStatements)
        );
    }

    #[test]
    fn allows_trailing_semicolon_with_only_comment() {
        assert!(v()
            .validate("SELECT * FROM app_portfolio; -- trailing comment")
            .is_ok());
    }

    #[test]
    fn case_insensitive_blacklist() {
        assert!(matches!(
            v().validate("select * from app_portfolio where 1=1; insert into app_portfolio values (1)"),
            Err(ValidationError::BlacklistedKeyword(_))
        ));
    }
}
