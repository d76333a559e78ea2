//! Parsing of `WWW-Authenticate` challenges
//!
//! A header value holds one or more challenges, each an authentication scheme
//! followed by `key=value` parameters:
//!
//! ```http
//! www-authenticate: Bearer realm="example", error="invalid_token", PoP nonce="abc123"
//! ```
//!
//! A parameter name must be followed directly by `=`; a token followed by
//! whitespace starts a new challenge. Whitespace after the `=` is allowed.
//! Values may be quoted, in which case they can contain spaces, commas, and
//! backslash-escaped characters.

use std::borrow::Cow;

use thiserror::Error;

/// A single authentication challenge
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Challenge<'a> {
    scheme: &'a str,
    parameters: Vec<(&'a str, Cow<'a, str>)>,
}

impl<'a> Challenge<'a> {
    /// The authentication scheme, as written in the header
    #[inline]
    pub fn scheme(&self) -> &'a str {
        self.scheme
    }

    /// Looks up a parameter by case-insensitive name
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_ref())
    }

    /// The parameters in the order they appear
    pub fn parameters(&self) -> impl Iterator<Item = (&'a str, &str)> + '_ {
        self.parameters
            .iter()
            .map(|(key, value)| (*key, value.as_ref()))
    }
}

/// A `WWW-Authenticate` value that could not be parsed
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ChallengeParseError {
    /// A parameter appeared before any authentication scheme
    #[error("parameter `{0}` appears before any authentication scheme")]
    ParameterWithoutScheme(String),
    /// A quoted value was never closed
    #[error("unterminated quoted value for parameter `{0}`")]
    UnterminatedQuote(String),
    /// A `=` appeared where a scheme or parameter name was expected
    #[error("expected a scheme or parameter name")]
    MissingName,
}

/// Parses every challenge in a `WWW-Authenticate` header value
pub fn parse_challenges(header: &str) -> Result<Vec<Challenge<'_>>, ChallengeParseError> {
    let mut cursor = Cursor { rest: header };
    let mut challenges: Vec<Challenge> = Vec::new();

    loop {
        cursor.skip_separators();
        if cursor.rest.is_empty() {
            return Ok(challenges);
        }

        let name = cursor.token();
        if name.is_empty() {
            return Err(ChallengeParseError::MissingName);
        }

        if !cursor.eat('=') {
            challenges.push(Challenge {
                scheme: name,
                parameters: Vec::new(),
            });
            continue;
        }

        cursor.skip_whitespace();
        let value = if cursor.eat('"') {
            cursor
                .quoted()
                .ok_or_else(|| ChallengeParseError::UnterminatedQuote(name.to_owned()))?
        } else {
            Cow::Borrowed(cursor.bare())
        };

        match challenges.last_mut() {
            Some(challenge) => challenge.parameters.push((name, value)),
            None => return Err(ChallengeParseError::ParameterWithoutScheme(name.to_owned())),
        }
    }
}

/// Extracts the value of `parameter` from the first `scheme` challenge that carries it
///
/// Scheme and parameter names are compared case-insensitively. A malformed
/// header is treated as not carrying the parameter.
pub fn parse_challenge_parameter(header: &str, scheme: &str, parameter: &str) -> Option<String> {
    let challenges = match parse_challenges(header) {
        Ok(challenges) => challenges,
        Err(error) => {
            tracing::debug!(%error, "ignoring malformed authentication challenge");
            return None;
        }
    };

    challenges
        .iter()
        .filter(|c| c.scheme.eq_ignore_ascii_case(scheme))
        .find_map(|c| c.parameter(parameter))
        .map(ToOwned::to_owned)
}

struct Cursor<'a> {
    rest: &'a str,
}

impl<'a> Cursor<'a> {
    fn skip_whitespace(&mut self) {
        self.rest = self.rest.trim_start_matches(|c: char| c.is_ascii_whitespace());
    }

    fn skip_separators(&mut self) {
        self.rest = self
            .rest
            .trim_start_matches(|c: char| c.is_ascii_whitespace() || c == ',');
    }

    fn eat(&mut self, expected: char) -> bool {
        match self.rest.strip_prefix(expected) {
            Some(rest) => {
                self.rest = rest;
                true
            }
            None => false,
        }
    }

    fn take_until(&mut self, stop: impl Fn(char) -> bool) -> &'a str {
        let rest = self.rest;
        let end = rest.find(stop).unwrap_or(rest.len());
        let (taken, remaining) = rest.split_at(end);
        self.rest = remaining;
        taken
    }

    /// A scheme or parameter name
    fn token(&mut self) -> &'a str {
        self.take_until(|c| c.is_ascii_whitespace() || c == ',' || c == '=')
    }

    /// An unquoted value, which may itself contain `=` (as in base64 padding)
    fn bare(&mut self) -> &'a str {
        self.take_until(|c| c.is_ascii_whitespace() || c == ',')
    }

    /// The remainder of a quoted value, after its opening quote
    fn quoted(&mut self) -> Option<Cow<'a, str>> {
        let rest = self.rest;
        let mut unescaped: Option<String> = None;
        let mut start = 0;
        let mut chars = rest.char_indices();

        while let Some((idx, c)) = chars.next() {
            match c {
                '"' => {
                    let value = match unescaped {
                        Some(mut buf) => {
                            buf.push_str(&rest[start..idx]);
                            Cow::Owned(buf)
                        }
                        None => Cow::Borrowed(&rest[..idx]),
                    };
                    self.rest = &rest[idx + 1..];
                    return Some(value);
                }
                '\\' => {
                    let buf = unescaped.get_or_insert_with(String::new);
                    buf.push_str(&rest[start..idx]);
                    let (escaped_idx, escaped) = chars.next()?;
                    buf.push(escaped);
                    start = escaped_idx + escaped.len_utf8();
                }
                _ => {}
            }
        }

        None
    }
}
