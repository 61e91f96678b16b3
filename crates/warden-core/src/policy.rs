use regex::Regex;

use crate::error::BrokerError;

/// Allowlist entry that must match the whole input, not a substring.
#[derive(Debug, Clone)]
pub struct AllowPattern {
    source: String,
    regex: Regex,
}

impl AllowPattern {
    /// Compile `pattern` anchored at both ends.
    ///
    /// # Errors
    ///
    /// Returns the regex error if `pattern` is not a valid expression.
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        let regex = Regex::new(&format!("^(?:{pattern})$"))?;
        Ok(Self {
            source: pattern.to_owned(),
            regex,
        })
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.source
    }

    #[must_use]
    pub fn matches(&self, input: &str) -> bool {
        self.regex.is_match(input)
    }
}

/// Allowlist and SQL-safety checks, evaluated before any connection is opened.
#[derive(Debug, Clone, Copy, Default)]
pub struct PolicyGate;

impl PolicyGate {
    /// An empty allowlist permits everything; otherwise one pattern must match.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::PolicyViolation` if no pattern matches.
    pub fn check_allowlist(patterns: &[AllowPattern], input: &str) -> Result<(), BrokerError> {
        if patterns.is_empty() || patterns.iter().any(|p| p.matches(input)) {
            return Ok(());
        }
        tracing::debug!(patterns = patterns.len(), "input matched no allowlist pattern");
        Err(BrokerError::PolicyViolation)
    }

    /// Allowlist plus single-statement, comment-free scan of relational text.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::PolicyViolation` on empty text, comment markers,
    /// more than one statement, or an allowlist miss.
    pub fn check_query(patterns: &[AllowPattern], query: &str) -> Result<(), BrokerError> {
        if let Err(reason) = scan_statement(query) {
            tracing::debug!(reason, "query rejected by statement scan");
            return Err(BrokerError::PolicyViolation);
        }
        Self::check_allowlist(patterns, query)
    }
}

/// Apply a per-call override that may only tighten `ceiling`, never loosen it.
#[must_use]
pub fn tighten<T: Ord + Copy>(requested: Option<T>, ceiling: T) -> T {
    requested.map_or(ceiling, |r| r.min(ceiling))
}

/// Reject empty text, `--`, `/*`, `*/` and a second top-level statement.
///
/// Markers inside single- or double-quoted literals are ignored; a backslash
/// escapes the next character inside a literal. One trailing `;` followed only
/// by whitespace is accepted.
fn scan_statement(text: &str) -> Result<(), &'static str> {
    if text.trim().is_empty() {
        return Err("empty statement");
    }

    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut chars = text.char_indices().peekable();

    while let Some((idx, ch)) = chars.next() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == q {
                quote = None;
            }
            continue;
        }

        let next = chars.peek().map(|&(_, c)| c);
        match (ch, next) {
            ('\'' | '"', _) => quote = Some(ch),
            ('-', Some('-')) => return Err("inline comment"),
            ('/', Some('*')) | ('*', Some('/')) => return Err("block comment"),
            (';', _) => {
                if !text[idx + 1..].trim().is_empty() {
                    return Err("multiple statements");
                }
                return Ok(());
            }
            _ => {}
        }
    }

    Ok(())
}
