//! Sender patterns scoping a cache directory and its sync watermark.
//!
//! Accepted forms:
//!
//! * `/regex/` matched case-insensitively against the sender address
//! * `@domain` matched as an address suffix
//! * globs containing `*` or `?`, matched against the whole address
//! * anything else is a case-insensitive substring

use std::fmt;

use regex::{Regex, RegexBuilder};
use sha2::{Digest, Sha256};

use crate::core::error::PatternError;

#[derive(Debug, Clone)]
enum Rule {
    Regex(Regex),
    Domain(String),
    Glob(Regex),
    Substring(String),
}

#[derive(Debug, Clone)]
pub struct Pattern {
    raw: String,
    rule: Rule,
}

impl Pattern {
    pub fn parse(text: &str) -> Result<Self, PatternError> {
        let raw = text.trim();
        if raw.is_empty() {
            return Err(PatternError::Empty);
        }

        let lower = raw.to_lowercase();
        let rule = if raw.len() > 2 && raw.starts_with('/') && raw.ends_with('/') {
            Rule::Regex(compile(&raw[1..raw.len() - 1], raw)?)
        } else if lower.starts_with('@') && !has_wildcard(&lower) {
            Rule::Domain(lower)
        } else if lower.starts_with('@') {
            // "@*.example.com" is a suffix glob
            Rule::Glob(compile(&glob_to_regex(&format!("*{lower}")), raw)?)
        } else if has_wildcard(&lower) {
            Rule::Glob(compile(&glob_to_regex(&lower), raw)?)
        } else {
            Rule::Substring(lower)
        };

        Ok(Pattern {
            raw: raw.to_string(),
            rule,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Directory name for this pattern under the storage root. When unsafe
    /// characters had to be replaced, a short digest of the raw pattern keeps
    /// distinct patterns in distinct directories.
    pub fn dir_name(&self) -> String {
        let name = safe_dir_name(&self.raw);
        if name == self.raw {
            name
        } else {
            format!("{name}-{}", short_digest(&self.raw))
        }
    }

    /// Narrowing query to hand the remote listing, when the pattern has a
    /// direct equivalent. Regex and glob patterns are filtered locally.
    pub fn remote_query(&self) -> Option<String> {
        match &self.rule {
            Rule::Domain(d) => Some(format!("from:{}", &d[1..])),
            Rule::Substring(s) => Some(format!("from:{s}")),
            Rule::Regex(_) | Rule::Glob(_) => None,
        }
    }

    /// Does the sender in `from_header` (`Name <addr>` or bare) match?
    pub fn matches(&self, from_header: &str) -> bool {
        let email = extract_address(from_header);
        match &self.rule {
            Rule::Regex(re) => re.is_match(&email),
            Rule::Domain(d) => email.ends_with(d.as_str()),
            Rule::Glob(re) => re.is_match(&email),
            Rule::Substring(s) => email.contains(s.as_str()),
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Lower-cased address out of a `Name <addr>` header, or the trimmed header.
pub fn extract_address(from_header: &str) -> String {
    match (from_header.find('<'), from_header.rfind('>')) {
        (Some(open), Some(close)) if open < close => {
            from_header[open + 1..close].trim().to_lowercase()
        }
        _ => from_header.trim().to_lowercase(),
    }
}

pub(crate) fn safe_dir_name(raw: &str) -> String {
    let name: String = raw
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '_' | '@' | '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();

    // "." and ".." would escape the storage root
    if name.chars().all(|c| c == '.') {
        name.replace('.', "_")
    } else {
        name
    }
}

fn short_digest(raw: &str) -> String {
    Sha256::digest(raw.as_bytes())[..4]
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

fn has_wildcard(s: &str) -> bool {
    s.contains('*') || s.contains('?')
}

fn glob_to_regex(glob: &str) -> String {
    let mut out = String::with_capacity(glob.len() + 8);
    out.push('^');
    for c in glob.chars() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            c => out.push_str(&regex::escape(&c.to_string())),
        }
    }
    out.push('$');
    out
}

fn compile(expr: &str, raw: &str) -> Result<Regex, PatternError> {
    RegexBuilder::new(expr)
        .case_insensitive(true)
        .build()
        .map_err(|e| PatternError::BadRegex {
            pattern: raw.to_string(),
            reason: e.to_string(),
        })
}
