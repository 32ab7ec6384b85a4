//! Connect-target authorization
//!
//! The authorizer holds the configured patterns, compiled once, and a list of
//! capture rules applied when a connection starts publishing.

use std::fmt;

use percent_encoding::percent_decode_str;
use url::Url;

use crate::error::AuthError;

use super::pattern::{Captures, PathPattern};

/// A check applied to captured variables at publish time
///
/// Rules run in order after the publishing identity has been checked for
/// emptiness; the first failing rule rejects the publish.
pub trait CaptureRule: Send + Sync {
    /// Validate `vars` for a publisher named `identity`
    fn check(&self, vars: &Captures, identity: &str) -> Result<(), AuthError>;
}

/// Requires a `{username}` capture, when present, to equal the identity
#[derive(Debug, Clone, Copy, Default)]
pub struct UsernameRule;

impl CaptureRule for UsernameRule {
    fn check(&self, vars: &Captures, identity: &str) -> Result<(), AuthError> {
        match vars.get("username") {
            Some(username) if username != identity => Err(AuthError::IdentityMismatch {
                name: "username".to_string(),
                captured: username.clone(),
                identity: identity.to_string(),
            }),
            _ => Ok(()),
        }
    }
}

/// Matches connect targets against the configured patterns
pub struct Authorizer {
    patterns: Vec<PathPattern>,
    rules: Vec<Box<dyn CaptureRule>>,
}

impl Authorizer {
    /// Create an authorizer with the default capture rules
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::with_rules(patterns, vec![Box::new(UsernameRule)])
    }

    /// Create an authorizer with a custom rule set
    pub fn with_rules<I, S>(patterns: I, rules: Vec<Box<dyn CaptureRule>>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns: Vec<PathPattern> = patterns
            .into_iter()
            .map(|p| PathPattern::compile(p.as_ref()))
            .collect();

        tracing::debug!(patterns = patterns.len(), rules = rules.len(), "Authorizer ready");

        Self { patterns, rules }
    }

    /// Append a capture rule
    pub fn add_rule(&mut self, rule: impl CaptureRule + 'static) {
        self.rules.push(Box::new(rule));
    }

    /// Configured pattern sources, in match order
    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.patterns.iter().map(|p| p.source())
    }

    /// Check whether any pattern accepts the target's path
    pub fn is_authorized(&self, target: &str) -> bool {
        let path = target_path(target);
        self.patterns.iter().any(|p| p.matches(&path))
    }

    /// Captured variables from the first pattern accepting the target
    pub fn extract_variables(&self, target: &str) -> Option<Captures> {
        let path = target_path(target);
        self.patterns.iter().find_map(|p| p.captures(&path))
    }

    /// Authorize a connect target, returning its captures
    pub fn authorize(&self, target: &str) -> Result<Captures, AuthError> {
        self.extract_variables(target)
            .ok_or_else(|| AuthError::NoMatchingPattern(target.to_string()))
    }

    /// Validate a publishing identity against the captures of its connection
    pub fn validate_authentication(&self, vars: &Captures, identity: &str) -> Result<(), AuthError> {
        if identity.is_empty() {
            return Err(AuthError::EmptyIdentity);
        }

        for rule in &self.rules {
            rule.check(vars, identity)?;
        }

        Ok(())
    }
}

impl fmt::Debug for Authorizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Authorizer")
            .field("patterns", &self.patterns().collect::<Vec<_>>())
            .field("rules", &self.rules.len())
            .finish()
    }
}

/// Path component of a connect target
///
/// Absolute URLs contribute only their percent-decoded path, so they capture
/// the same values as the equivalent plain path. Anything else (already a
/// path, or unparseable) is used verbatim.
pub fn target_path(target: &str) -> String {
    let Ok(url) = Url::parse(target) else {
        return target.to_string();
    };

    match percent_decode_str(url.path()).decode_utf8() {
        Ok(path) => path.into_owned(),
        Err(_) => url.path().to_string(),
    }
}
