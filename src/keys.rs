//! Key codec.
//!
//! Every cached entity is identified by a single string built from its structured identity:
//!
//! ```text
//! provider:type:account:region:name[:extra...]
//! ```
//!
//! Segments are joined with [`SEPARATOR`]. A segment that itself contains the separator (or the escape character `%`)
//! is percent-escaped, so the raw key can always be split on the separator. Providers that need sub-resource segments
//! append them after `name`; they are preserved as [`ParsedKey::extra`].
//!
//! Keys are the only source of scoping information: the merge engine parses them to find out which account and region
//! an identifier belongs to.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt::Debug;
use std::fmt::Display;
use std::sync::Arc;

use crate::error::CacheError;
use crate::error::Result;

pub const SEPARATOR: char = ':';

const ESCAPE: char = '%';
const ESCAPED_SEPARATOR: &str = "%3A";
const ESCAPED_ESCAPE: &str = "%25";

// provider, type, account, region, name
const REQUIRED_SEGMENTS: usize = 5;

/// Helpers for building keys following the common separator convention.
pub struct Keys;

impl Keys {
    pub fn escape(segment: &str) -> Cow<'_, str> {
        if !segment.contains([SEPARATOR, ESCAPE]) {
            return Cow::Borrowed(segment);
        }

        let mut escaped = String::with_capacity(segment.len() + 4);
        for c in segment.chars() {
            match c {
                SEPARATOR => escaped.push_str(ESCAPED_SEPARATOR),
                ESCAPE => escaped.push_str(ESCAPED_ESCAPE),
                c => escaped.push(c),
            }
        }
        Cow::Owned(escaped)
    }

    pub fn unescape(segment: &str) -> Result<Cow<'_, str>> {
        if !segment.contains(ESCAPE) {
            return Ok(Cow::Borrowed(segment));
        }

        let mut unescaped = String::with_capacity(segment.len());
        let mut rest = segment;
        while let Some(pos) = rest.find(ESCAPE) {
            unescaped.push_str(&rest[..pos]);
            let tail = &rest[pos..];
            match tail.get(..3) {
                Some(code) if code.eq_ignore_ascii_case(ESCAPED_SEPARATOR) => unescaped.push(SEPARATOR),
                Some(ESCAPED_ESCAPE) => unescaped.push(ESCAPE),
                _ => return Err(CacheError::key_format(segment, "invalid escape sequence")),
            }
            rest = &tail[3..];
        }
        unescaped.push_str(rest);

        Ok(Cow::Owned(unescaped))
    }

    /// Joins already unescaped segments into a key, escaping each of them.
    pub fn build<S: AsRef<str>>(segments: &[S]) -> String {
        let mut key = String::new();
        for (idx, segment) in segments.iter().enumerate() {
            if idx > 0 {
                key.push(SEPARATOR);
            }
            key.push_str(&Self::escape(segment.as_ref()));
        }
        key
    }

    pub fn resource(provider: &str, data_type: &str, account: &str, region: &str, name: &str) -> String {
        Self::build(&[provider, data_type, account, region, name])
    }

    /// Returns the provider segment of a key without parsing the rest of it.
    pub fn provider_of(key: &str) -> Option<&str> {
        key.split(SEPARATOR).next().filter(|p| !p.is_empty())
    }
}

/// Structured form of a cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ParsedKey {
    pub provider:  String,
    pub data_type: String,
    pub account:   String,
    pub region:    String,
    pub name:      String,
    pub extra:     Vec<String>,
}

impl ParsedKey {
    pub fn new<S: ToString>(provider: S, data_type: S, account: S, region: S, name: S) -> Self {
        Self {
            provider:  provider.to_string(),
            data_type: data_type.to_string(),
            account:   account.to_string(),
            region:    region.to_string(),
            name:      name.to_string(),
            extra:     Vec::new(),
        }
    }

    pub fn with_extra<S: ToString>(mut self, segment: S) -> Self {
        self.extra.push(segment.to_string());
        self
    }

    pub fn to_key(&self) -> String {
        let mut segments = vec![
            self.provider.as_str(),
            self.data_type.as_str(),
            self.account.as_str(),
            self.region.as_str(),
            self.name.as_str(),
        ];
        segments.extend(self.extra.iter().map(String::as_str));
        Keys::build(&segments)
    }
}

impl Display for ParsedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_key())
    }
}

/// Provider-specific key codec.
pub trait KeyParser: Debug + Send + Sync + 'static {
    /// Name of the cloud provider this parser understands, matching the first key segment.
    fn cloud_provider(&self) -> &str;

    fn parse_key(&self, key: &str) -> Result<ParsedKey>;

    fn can_parse_type(&self, _data_type: &str) -> bool {
        true
    }
}

/// Parser for keys that follow the common `provider:type:account:region:name[:extra...]` layout.
#[derive(Debug, Clone)]
pub struct DefaultKeyParser {
    provider: String,
}

impl DefaultKeyParser {
    /// Parser restricted to keys of the given provider.
    pub fn new<S: ToString>(provider: S) -> Self {
        Self {
            provider: provider.to_string(),
        }
    }

    /// Parser accepting keys of any provider.
    pub fn any() -> Self {
        Self { provider: String::new() }
    }
}

impl KeyParser for DefaultKeyParser {
    fn cloud_provider(&self) -> &str {
        &self.provider
    }

    fn parse_key(&self, key: &str) -> Result<ParsedKey> {
        let raw: Vec<&str> = key.split(SEPARATOR).collect();
        if raw.len() < REQUIRED_SEGMENTS {
            return Err(CacheError::key_format(
                key,
                format!("expected at least {REQUIRED_SEGMENTS} segments, found {}", raw.len()),
            ));
        }

        let mut segments = Vec::with_capacity(raw.len());
        for segment in raw {
            if segment.is_empty() {
                return Err(CacheError::key_format(key, "empty segment"));
            }
            segments.push(Keys::unescape(segment)?.into_owned());
        }

        if !self.provider.is_empty() && segments[0] != self.provider {
            return Err(CacheError::key_format(
                key,
                format!("provider '{}' is not '{}'", segments[0], self.provider),
            ));
        }

        let mut segments = segments.into_iter();
        // The length check above guarantees the first five segments.
        let mut next = || segments.next().unwrap_or_default();
        let mut parsed = ParsedKey {
            provider:  next(),
            data_type: next(),
            account:   next(),
            region:    next(),
            name:      next(),
            extra:     Vec::new(),
        };
        parsed.extra = segments.collect();

        Ok(parsed)
    }
}

/// Parsers indexed by the provider segment of a key.
#[derive(Debug, Clone)]
pub struct KeyParsers {
    parsers:  HashMap<String, Arc<dyn KeyParser>>,
    fallback: Arc<dyn KeyParser>,
}

impl Default for KeyParsers {
    fn default() -> Self {
        Self {
            parsers:  HashMap::new(),
            fallback: Arc::new(DefaultKeyParser::any()),
        }
    }
}

impl KeyParsers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_parser(mut self, parser: Arc<dyn KeyParser>) -> Self {
        self.register(parser);
        self
    }

    pub fn register(&mut self, parser: Arc<dyn KeyParser>) {
        self.parsers.insert(parser.cloud_provider().to_string(), parser);
    }

    pub fn parser_for(&self, provider: &str) -> &Arc<dyn KeyParser> {
        self.parsers.get(provider).unwrap_or(&self.fallback)
    }

    /// Parses a key with the parser registered for its provider segment.
    pub fn parse(&self, key: &str) -> Result<ParsedKey> {
        let provider = Keys::provider_of(key).ok_or_else(|| CacheError::key_format(key, "missing provider"))?;
        self.parser_for(provider).parse_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_and_parses_resource_key() {
        let key = Keys::resource("aws", "instances", "prod", "us-east-1", "i-1234");
        assert_eq!(key, "aws:instances:prod:us-east-1:i-1234");

        let parsed = DefaultKeyParser::new("aws").parse_key(&key).unwrap();
        assert_eq!(parsed.account, "prod");
        assert_eq!(parsed.region, "us-east-1");
        assert_eq!(parsed.name, "i-1234");
        assert!(parsed.extra.is_empty());
    }

    #[test]
    fn separator_inside_segment_is_escaped() {
        let key = Keys::resource("aws", "images", "prod", "us-east-1", "arn:aws:ami/100%");
        assert_eq!(key, "aws:images:prod:us-east-1:arn%3Aaws%3Aami/100%25");

        let parsed = DefaultKeyParser::any().parse_key(&key).unwrap();
        assert_eq!(parsed.name, "arn:aws:ami/100%");
        assert_eq!(parsed.to_key(), key);
    }

    #[test]
    fn extra_segments_are_kept() {
        let key = ParsedKey::new("kubernetes", "pods", "k8s", "default", "web")
            .with_extra("container")
            .to_key();
        let parsed = DefaultKeyParser::any().parse_key(&key).unwrap();
        assert_eq!(parsed.extra, vec!["container".to_string()]);
    }

    #[test]
    fn malformed_keys_are_rejected() {
        let parser = DefaultKeyParser::new("aws");
        assert!(matches!(
            parser.parse_key("aws:instances:prod"),
            Err(CacheError::KeyFormat { .. })
        ));
        assert!(matches!(
            parser.parse_key("aws:instances::us-east-1:i-1"),
            Err(CacheError::KeyFormat { .. })
        ));
        assert!(matches!(
            parser.parse_key("gce:instances:prod:us-east1:i-1"),
            Err(CacheError::KeyFormat { .. })
        ));
        assert!(matches!(
            parser.parse_key("aws:instances:prod:us-east-1:bad%zz"),
            Err(CacheError::KeyFormat { .. })
        ));
    }

    #[test]
    fn parsers_are_selected_by_provider() {
        let parsers = KeyParsers::new().with_parser(Arc::new(DefaultKeyParser::new("aws")));
        assert_eq!(parsers.parser_for("aws").cloud_provider(), "aws");
        assert_eq!(parsers.parser_for("gce").cloud_provider(), "");
        assert!(parsers.parse("gce:instances:prod:us-east1:i-1").is_ok());
        assert!(parsers.parse(":instances:prod:us-east1:i-1").is_err());
    }
}
