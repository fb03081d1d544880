use regex::Regex;

use crate::error::{PatternError, PatternResult};

/// A compiled image reference pattern.
#[derive(Debug, Clone)]
pub enum CompiledPattern {
    /// Exact reference match (no wildcards).
    Exact(String),
    /// Glob pattern compiled to regex.
    Glob { original: String, regex: Regex },
    /// Explicit regex pattern (prefixed with "regex:").
    Regex { original: String, regex: Regex },
}

impl CompiledPattern {
    /// Check if the pattern matches the image reference.
    pub fn matches(&self, input: &str) -> bool {
        match self {
            CompiledPattern::Exact(s) => s == input,
            CompiledPattern::Glob { regex, .. } => regex.is_match(input),
            CompiledPattern::Regex { regex, .. } => regex.is_match(input),
        }
    }

    /// Get the original pattern string.
    pub fn original(&self) -> &str {
        match self {
            CompiledPattern::Exact(s) => s,
            CompiledPattern::Glob { original, .. } => original,
            CompiledPattern::Regex { original, .. } => original,
        }
    }
}

/// Compile an image reference pattern.
///
/// Pattern syntax:
/// - `regex:...` - Explicit regex pattern
/// - Contains `*` or `?` - Glob pattern, `*` spans registry and path segments
/// - Otherwise - Exact match
pub fn compile_pattern(pattern: &str) -> PatternResult<CompiledPattern> {
    if pattern.is_empty() {
        return Err(PatternError::InvalidGlob("empty pattern".to_string()));
    }

    if let Some(regex_str) = pattern.strip_prefix("regex:") {
        let regex = Regex::new(regex_str).map_err(|e| PatternError::InvalidRegex {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        return Ok(CompiledPattern::Regex {
            original: pattern.to_string(),
            regex,
        });
    }

    if pattern.contains('*') || pattern.contains('?') {
        let regex = glob_to_regex(pattern)?;
        return Ok(CompiledPattern::Glob {
            original: pattern.to_string(),
            regex,
        });
    }

    Ok(CompiledPattern::Exact(pattern.to_string()))
}

/// Convert a glob pattern to an anchored regex.
///
/// `*` and `**` match any sequence, `?` matches one character, everything
/// else is literal.
fn glob_to_regex(glob: &str) -> PatternResult<Regex> {
    let mut regex = String::with_capacity(glob.len() + 8);
    regex.push('^');

    let mut chars = glob.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                while chars.peek() == Some(&'*') {
                    chars.next();
                }
                regex.push_str(".*");
            }
            '?' => regex.push('.'),
            c => {
                if is_regex_metachar(c) {
                    regex.push('\\');
                }
                regex.push(c);
            }
        }
    }

    regex.push('$');

    Regex::new(&regex).map_err(|e| PatternError::InvalidRegex {
        pattern: glob.to_string(),
        reason: e.to_string(),
    })
}

fn is_regex_metachar(c: char) -> bool {
    matches!(
        c,
        '.' | '+' | '(' | ')' | '[' | ']' | '{' | '}' | '|' | '^' | '$' | '\\'
    )
}
