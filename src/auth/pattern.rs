//! Path pattern compilation
//!
//! A pattern such as `/live/{app}/{username}` is escaped as a literal except
//! for its `{name}` placeholders, each of which becomes a named capture
//! matching a single path segment:
//!
//! ```text
//! /live/{app}/{username}  =>  ^/live/(?P<app>[^/]+)/(?P<username>[^/]+)$
//! ```

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

/// Variables captured from a matching target
pub type Captures = HashMap<String, String>;

fn placeholder_regex() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    // Matches a placeholder after regex::escape turned `{name}` into `\{name\}`
    PLACEHOLDER.get_or_init(|| {
        Regex::new(r"\\\{([A-Za-z0-9_]+)\\\}").expect("placeholder expression is valid")
    })
}

/// A compiled authorization pattern
#[derive(Debug, Clone)]
pub struct PathPattern {
    source: String,
    names: Vec<String>,
    /// `None` when the generated expression failed to compile
    matcher: Option<Regex>,
}

impl PathPattern {
    /// Compile a pattern. Never fails: a malformed pattern never matches.
    pub fn compile(pattern: &str) -> Self {
        let escaped = regex::escape(pattern);
        let mut names = Vec::new();

        let body = placeholder_regex().replace_all(&escaped, |caps: &regex::Captures<'_>| {
            let name = &caps[1];
            names.push(name.to_string());
            format!("(?P<{}>[^/]+)", name)
        });

        let expr = format!("^{}$", body);
        let matcher = match Regex::new(&expr) {
            Ok(re) => Some(re),
            Err(e) => {
                tracing::warn!(pattern = pattern, error = %e, "Pattern failed to compile, it will never match");
                None
            }
        };

        Self {
            source: pattern.to_string(),
            names,
            matcher,
        }
    }

    /// The pattern as configured
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Placeholder names in order of appearance
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Whether the pattern compiled into a usable matcher
    pub fn is_valid(&self) -> bool {
        self.matcher.is_some()
    }

    /// Match a path, returning the captured variables
    pub fn captures(&self, path: &str) -> Option<Captures> {
        let matcher = self.matcher.as_ref()?;
        let caps = matcher.captures(path)?;

        let vars = matcher
            .capture_names()
            .flatten()
            .filter_map(|name| caps.name(name).map(|m| (name.to_string(), m.as_str().to_string())))
            .collect();

        Some(vars)
    }

    /// Check whether a path matches
    pub fn matches(&self, path: &str) -> bool {
        self.matcher
            .as_ref()
            .map(|re| re.is_match(path))
            .unwrap_or(false)
    }
}
