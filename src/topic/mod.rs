//! Topic matching
//!
//! Topics and filters are `/`-separated segment sequences. A filter segment is
//! either a literal, the single-level wildcard `+`, or the multi-level wildcard
//! `#` (final segment only). Topics whose first segment starts with `$` are
//! reserved for broker-internal channels and are never matched by a filter
//! whose first segment is a wildcard.

use std::fmt;

pub const SEPARATOR: char = '/';
pub const SINGLE_LEVEL: &str = "+";
pub const MULTI_LEVEL: &str = "#";
pub const RESERVED_PREFIX: char = '$';

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopicError {
    #[error("filter is empty")]
    EmptyFilter,

    #[error("topic is empty")]
    EmptyTopic,

    #[error("'#' must be the last segment")]
    MultiLevelNotLast,

    #[error("wildcard must occupy the whole segment: '{0}'")]
    PartialWildcard(String),

    #[error("topic must not contain wildcards")]
    WildcardInTopic,

    #[error("null character not allowed")]
    NullCharacter,
}

/// One segment of a parsed filter
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FilterSegment {
    Literal(String),
    SingleLevel,
    MultiLevel,
}

/// A validated subscription filter
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicFilter {
    raw: String,
    segments: Vec<FilterSegment>,
}

impl TopicFilter {
    pub fn parse(filter: impl Into<String>) -> Result<Self, TopicError> {
        let raw = filter.into();
        if raw.is_empty() {
            return Err(TopicError::EmptyFilter);
        }
        if raw.contains('\0') {
            return Err(TopicError::NullCharacter);
        }

        let parts: Vec<&str> = raw.split(SEPARATOR).collect();
        let last = parts.len() - 1;
        let mut segments = Vec::with_capacity(parts.len());

        for (i, part) in parts.iter().enumerate() {
            let segment = match *part {
                SINGLE_LEVEL => FilterSegment::SingleLevel,
                MULTI_LEVEL if i == last => FilterSegment::MultiLevel,
                MULTI_LEVEL => return Err(TopicError::MultiLevelNotLast),
                literal if literal.contains(['+', '#']) => {
                    return Err(TopicError::PartialWildcard(literal.to_string()))
                }
                literal => FilterSegment::Literal(literal.to_string()),
            };
            segments.push(segment);
        }

        Ok(Self { raw, segments })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn segments(&self) -> &[FilterSegment] {
        &self.segments
    }

    pub fn has_wildcards(&self) -> bool {
        self.segments
            .iter()
            .any(|s| !matches!(s, FilterSegment::Literal(_)))
    }

    pub fn matches(&self, topic: &str) -> bool {
        let mut topic_segments = topic.split(SEPARATOR).peekable();

        if let Some(first) = topic_segments.peek() {
            if first.starts_with(RESERVED_PREFIX)
                && !matches!(self.segments.first(), Some(FilterSegment::Literal(_)))
            {
                return false;
            }
        }

        for segment in &self.segments {
            match segment {
                // Matches the parent level too, so `a/#` covers `a`
                FilterSegment::MultiLevel => return true,
                FilterSegment::SingleLevel => {
                    if topic_segments.next().is_none() {
                        return false;
                    }
                }
                FilterSegment::Literal(literal) => match topic_segments.next() {
                    Some(t) if t == literal => {}
                    _ => return false,
                },
            }
        }

        topic_segments.next().is_none()
    }
}

impl fmt::Display for TopicFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl std::str::FromStr for TopicFilter {
    type Err = TopicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Decides whether `filter` matches the concrete `topic`.
///
/// A malformed filter matches nothing.
pub fn matches(filter: &str, topic: &str) -> bool {
    TopicFilter::parse(filter)
        .map(|f| f.matches(topic))
        .unwrap_or(false)
}

/// Checks that a topic is usable for publishing.
pub fn validate_topic(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::EmptyTopic);
    }
    if topic.contains('\0') {
        return Err(TopicError::NullCharacter);
    }
    if topic.contains(['+', '#']) {
        return Err(TopicError::WildcardInTopic);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn reference_table() {
        let cases = [
            ("a/b/c", "a/b/c", true),
            ("a/b/c", "a/b", false),
            ("a/+/c", "a/b/c", true),
            ("a/+/c", "a/b/c/d", false),
            ("a/+/c", "a//c", true),
            ("a/#", "a", true),
            ("a/#", "a/b", true),
            ("a/#", "a/b/c", true),
            ("a/#", "b/c", false),
            ("+/b", "a/b/c", false),
            ("+/b", "a/b", true),
            ("+", "a", true),
            ("+", "a/b", false),
            ("#", "a/b/c", true),
            ("+/+", "/finance", true),
            ("/+", "/finance", true),
            ("sensor/+/temp", "sensor/room1/temp", true),
            ("sensor/+/temp", "sensor/room1/humidity", false),
        ];

        for (filter, topic, expected) in cases {
            assert_eq!(
                matches(filter, topic),
                expected,
                "filter {filter} against topic {topic}"
            );
        }
    }

    #[test]
    fn reserved_topics_hidden_from_leading_wildcards() {
        assert!(!matches("#", "$SYS/broker/uptime"));
        assert!(!matches("+/broker/uptime", "$SYS/broker/uptime"));
        assert!(matches("$SYS/#", "$SYS/broker/uptime"));
        assert!(matches("$SYS/+/uptime", "$SYS/broker/uptime"));
    }

    #[test]
    fn malformed_filters_rejected() {
        assert_eq!(TopicFilter::parse(""), Err(TopicError::EmptyFilter));
        assert_eq!(
            TopicFilter::parse("a/#/c"),
            Err(TopicError::MultiLevelNotLast)
        );
        assert_eq!(
            TopicFilter::parse("a/b#"),
            Err(TopicError::PartialWildcard("b#".to_string()))
        );
        assert_eq!(
            TopicFilter::parse("a/b+/c"),
            Err(TopicError::PartialWildcard("b+".to_string()))
        );
        assert!(!matches("a/#/c", "a/b/c"));
    }

    #[test]
    fn topic_validation() {
        assert!(validate_topic("sensor/room1/temp").is_ok());
        assert_eq!(validate_topic(""), Err(TopicError::EmptyTopic));
        assert_eq!(validate_topic("a/+"), Err(TopicError::WildcardInTopic));
        assert_eq!(validate_topic("a/#"), Err(TopicError::WildcardInTopic));
    }

    #[test]
    fn segments_parsed() {
        let filter = TopicFilter::parse("a/+/#").unwrap();
        assert_eq!(
            filter.segments(),
            &[
                FilterSegment::Literal("a".to_string()),
                FilterSegment::SingleLevel,
                FilterSegment::MultiLevel
            ]
        );
        assert!(filter.has_wildcards());
        assert!(!TopicFilter::parse("a/b").unwrap().has_wildcards());
    }

    fn topic_strategy() -> impl Strategy<Value = String> {
        prop::collection::vec("[a-z0-9]{0,4}", 1..6).prop_map(|segments| segments.join("/"))
    }

    proptest! {
        #[test]
        fn literal_filter_matches_itself(topic in topic_strategy()) {
            prop_assert!(matches(&topic, &topic));
        }

        #[test]
        fn multi_level_matches_everything_unreserved(topic in topic_strategy()) {
            prop_assert!(matches("#", &topic));
        }

        #[test]
        fn single_level_replacement_still_matches(topic in topic_strategy(), index in 0usize..6) {
            let mut segments: Vec<&str> = topic.split('/').collect();
            let index = index % segments.len();
            segments[index] = "+";
            let filter = segments.join("/");
            prop_assert!(matches(&filter, &topic));
        }

        #[test]
        fn longer_topic_needs_multi_level(topic in topic_strategy(), extra in "[a-z]{1,3}") {
            let longer = format!("{topic}/{extra}");
            prop_assert!(!matches(&topic, &longer));
            let parent = format!("{topic}/#");
            prop_assert!(matches(&parent, &longer));
            prop_assert!(matches(&parent, &topic));
        }
    }
}
