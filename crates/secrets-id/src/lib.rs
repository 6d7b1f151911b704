//! Validated secret identifiers and glob-style patterns.
//!
//! Both grammars are hand-rolled over `&str` splits; no regex is used,
//! per the containment/matching contract this crate implements for.

use std::fmt;

use thiserror::Error;

/// Why a raw string failed to parse as an [`Identifier`] or [`Pattern`].
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum ParseError {
    #[error("identifier or pattern must not be empty")]
    Empty,
    #[error("identifier or pattern must not start or end with '/'")]
    EdgeSlash,
    #[error("identifier or pattern must not contain an empty component ('//')")]
    EmptyComponent,
    #[error("component {0:?} contains characters outside [A-Za-z0-9._-]")]
    InvalidCharacters(String),
    #[error("component {0:?} mixes '*' with other characters")]
    MixedWildcard(String),
    #[error("component {0:?} has more than two asterisks")]
    TooManyAsterisks(String),
}

fn split_components(s: &str) -> Result<Vec<&str>, ParseError> {
    if s.is_empty() {
        return Err(ParseError::Empty);
    }
    if s.starts_with('/') || s.ends_with('/') {
        return Err(ParseError::EdgeSlash);
    }
    let parts: Vec<&str> = s.split('/').collect();
    if parts.iter().any(|p| p.is_empty()) {
        return Err(ParseError::EmptyComponent);
    }
    Ok(parts)
}

fn is_literal_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-'
}

/// Validate one component of an [`Identifier`]: every character must be
/// in `[A-Za-z0-9._-]`, no wildcards allowed.
fn validate_identifier_component(c: &str) -> Result<(), ParseError> {
    if c.chars().all(is_literal_char) {
        Ok(())
    } else {
        Err(ParseError::InvalidCharacters(c.to_string()))
    }
}

/// Validate one component of a [`Pattern`]: either the same grammar as an
/// identifier component, or a run of one or two `*` and nothing else.
fn validate_pattern_component(c: &str) -> Result<(), ParseError> {
    if c.contains('*') {
        let star_count = c.chars().filter(|&ch| ch == '*').count();
        if c.chars().any(|ch| ch != '*') {
            return Err(ParseError::MixedWildcard(c.to_string()));
        }
        if star_count > 2 {
            return Err(ParseError::TooManyAsterisks(c.to_string()));
        }
        Ok(())
    } else {
        validate_identifier_component(c)
    }
}

/// A non-empty, slash-separated, validated secret identifier.
///
/// Equality is by string value; construction is the only validation
/// point, so a live `Identifier` is always well-formed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identifier(String);

impl Identifier {
    pub fn new(raw: impl Into<String>) -> Result<Self, ParseError> {
        let raw = raw.into();
        for component in split_components(&raw)? {
            validate_identifier_component(component)?;
        }
        Ok(Identifier(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn components(&self) -> Vec<&str> {
        self.0.split('/').collect()
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for Identifier {
    type Err = ParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Identifier::new(s)
    }
}

/// A glob-style pattern over the same grammar as [`Identifier`], plus
/// `*` (exactly one component) and `**` (zero or more components).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Pattern(String);

impl Pattern {
    pub fn new(raw: impl Into<String>) -> Result<Self, ParseError> {
        let raw = raw.into();
        for component in split_components(&raw)? {
            validate_pattern_component(component)?;
        }
        Ok(Pattern(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn components(&self) -> Vec<&str> {
        self.0.split('/').collect()
    }

    /// Does this pattern match the given identifier?
    ///
    /// Implemented as a recursive left-to-right walk over the two
    /// component sequences, backtracking over every split point when a
    /// non-final `**` is encountered.
    pub fn matches(&self, id: &Identifier) -> bool {
        match_components(&self.components(), &id.components())
    }

    /// Conservative containment: does every identifier matched by
    /// `other` also match `self`?
    ///
    /// Exact when neither pattern contains `**` (fixed-arity patterns
    /// are compared component-wise: a literal only covers itself, `*`
    /// covers any single literal-or-`*` component). Falls back to the
    /// always-safe `self == "**" || self == other` rule the moment
    /// either side contains `**`, since a full `**`-aware containment
    /// algebra is out of scope and a false positive here would cause
    /// spurious plugin polling and ordering-dependent provider
    /// attribution.
    pub fn includes(&self, other: &Pattern) -> bool {
        if self.0 == "**" || self.0 == other.0 {
            return true;
        }
        let a = self.components();
        let b = other.components();
        let has_double_star = |cs: &[&str]| cs.iter().any(|c| *c == "**");
        if has_double_star(&a) || has_double_star(&b) {
            return false;
        }
        if a.len() != b.len() {
            return false;
        }
        a.iter().zip(b.iter()).all(|(ac, bc)| *ac == "*" || ac == bc)
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for Pattern {
    type Err = ParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Pattern::new(s)
    }
}

impl From<Identifier> for Pattern {
    fn from(id: Identifier) -> Self {
        // every identifier is trivially a (wildcard-free) pattern
        Pattern(id.0)
    }
}

fn match_components(pattern: &[&str], id: &[&str]) -> bool {
    match pattern.split_first() {
        None => id.is_empty(),
        Some((&"**", rest)) => {
            if rest.is_empty() {
                true
            } else {
                (0..=id.len()).any(|split| match_components(rest, &id[split..]))
            }
        }
        Some((&p, rest)) => match id.split_first() {
            None => false,
            Some((&head, id_rest)) => {
                if p == "*" || p == head {
                    match_components(rest, id_rest)
                } else {
                    false
                }
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_accepts_valid_grammar() {
        for s in ["a", "a/b", "a.b-c_d/e123", "A/B/C"] {
            assert!(Identifier::new(s).is_ok(), "{s:?} should parse");
        }
    }

    #[test]
    fn identifier_rejects_bad_grammar() {
        assert_eq!(Identifier::new(""), Err(ParseError::Empty));
        assert_eq!(Identifier::new("/a"), Err(ParseError::EdgeSlash));
        assert_eq!(Identifier::new("a/"), Err(ParseError::EdgeSlash));
        assert_eq!(Identifier::new("a//b"), Err(ParseError::EmptyComponent));
        assert!(matches!(
            Identifier::new("a/b c"),
            Err(ParseError::InvalidCharacters(_))
        ));
        assert!(matches!(
            Identifier::new("a/*"),
            Err(ParseError::InvalidCharacters(_))
        ));
    }

    #[test]
    fn pattern_accepts_wildcards() {
        for s in ["*", "**", "a/*", "a/**", "foo/**/baz", "a/*/b/**"] {
            assert!(Pattern::new(s).is_ok(), "{s:?} should parse");
        }
    }

    #[test]
    fn pattern_rejects_malformed_wildcards() {
        assert!(matches!(
            Pattern::new("a/***"),
            Err(ParseError::TooManyAsterisks(_))
        ));
        assert!(matches!(
            Pattern::new("a/*b"),
            Err(ParseError::MixedWildcard(_))
        ));
        assert!(matches!(
            Pattern::new("a/b*"),
            Err(ParseError::MixedWildcard(_))
        ));
    }

    #[test]
    fn universal_pattern_matches_everything() {
        let p = Pattern::new("**").unwrap();
        for id in ["a", "a/b", "a/b/c/d"] {
            assert!(p.matches(&Identifier::new(id).unwrap()));
        }
    }

    #[test]
    fn literal_pattern_matches_its_own_identifier() {
        for id in ["a", "a/b", "a/b/c"] {
            let ident = Identifier::new(id).unwrap();
            let pattern = Pattern::new(ident.as_str()).unwrap();
            assert!(pattern.matches(&ident));
        }
    }

    #[test]
    fn single_star_does_not_match_missing_component() {
        let p = Pattern::new("a/*").unwrap();
        assert!(!p.matches(&Identifier::new("a").unwrap()));
        assert!(p.matches(&Identifier::new("a/b").unwrap()));
        assert!(!p.matches(&Identifier::new("a/b/c").unwrap()));
    }

    #[test]
    fn double_star_in_the_middle_matches_zero_or_more() {
        let p = Pattern::new("foo/**/baz").unwrap();
        assert!(p.matches(&Identifier::new("foo/baz").unwrap()));
        assert!(p.matches(&Identifier::new("foo/mid/baz").unwrap()));
        assert!(p.matches(&Identifier::new("foo/a/b/c/baz").unwrap()));
        assert!(!p.matches(&Identifier::new("foo/baz/extra").unwrap()));
        assert!(!p.matches(&Identifier::new("bar/baz").unwrap()));
    }

    #[test]
    fn trailing_double_star_matches_any_suffix_including_zero() {
        let p = Pattern::new("a/**").unwrap();
        assert!(p.matches(&Identifier::new("a").unwrap()));
        assert!(p.matches(&Identifier::new("a/b").unwrap()));
        assert!(p.matches(&Identifier::new("a/b/c").unwrap()));
        assert!(!p.matches(&Identifier::new("b").unwrap()));
    }

    #[test]
    fn includes_is_reflexive_and_universal() {
        let p = Pattern::new("team/*").unwrap();
        assert!(p.includes(&p));
        let star = Pattern::new("**").unwrap();
        assert!(star.includes(&p));
        assert!(!p.includes(&star));
    }

    #[test]
    fn includes_covers_fixed_arity_star_over_literal() {
        let wide = Pattern::new("team/*").unwrap();
        let narrow = Pattern::new("team/alice").unwrap();
        assert!(wide.includes(&narrow));
        assert!(!narrow.includes(&wide));
    }

    #[test]
    fn includes_never_false_positives_across_double_star() {
        let a = Pattern::new("team/*").unwrap();
        let b = Pattern::new("team/**").unwrap();
        assert!(!a.includes(&b));
        assert!(!b.includes(&a));
    }
}
