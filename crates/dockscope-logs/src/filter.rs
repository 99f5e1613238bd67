use std::collections::HashSet;

use regex::{Regex, RegexBuilder};
use serde_json::{Map, Value};
use thiserror::Error;

use dockscope_types::{LogEvent, LogLevel, LogMessage};

#[derive(Debug, Error)]
#[error("invalid search pattern '{pattern}': {source}")]
pub struct FilterError {
    pattern: String,
    #[source]
    source: regex::Error,
}

/// A regex tested against one value of a structured message.
/// `path` is a dotted key path, so `http.status` looks inside nested objects.
#[derive(Clone, Debug)]
struct FieldClause {
    path: Vec<String>,
    pattern: Regex,
}

/// Search over parsed log events
///
/// An event passes when its level is among `levels` (if any are set) and the
/// search clauses hold: the text regex against `raw_message`, and every field
/// clause against the structured message. Inversion flips the search clauses
/// only, so `--level error -v timeout` means errors that do not mention timeouts.
/// Plain-text events never satisfy a field clause.
#[derive(Clone, Debug, Default)]
pub struct LogFilter {
    text: Option<Regex>,
    fields: Vec<FieldClause>,
    levels: HashSet<LogLevel>,
    invert: bool,
    ignore_case: bool,
}

impl LogFilter {
    /// Filter that lets everything through
    pub fn new() -> Self {
        Self::default()
    }

    /// Case-insensitive matching for clauses added after this call
    pub fn ignore_case(mut self) -> Self {
        self.ignore_case = true;
        self
    }

    /// Require `pattern` somewhere in the message text; empty means no text clause
    pub fn text(mut self, pattern: &str) -> Result<Self, FilterError> {
        self.text = match pattern {
            "" => None,
            pattern => Some(self.compile(pattern)?),
        };
        Ok(self)
    }

    /// Require the structured value at `path` to match `pattern`
    pub fn field(mut self, path: &str, pattern: &str) -> Result<Self, FilterError> {
        let pattern = self.compile(pattern)?;
        self.fields.push(FieldClause {
            path: path.split('.').map(str::to_string).collect(),
            pattern,
        });
        Ok(self)
    }

    pub fn with_levels(mut self, levels: HashSet<LogLevel>) -> Self {
        self.levels = levels;
        self
    }

    pub fn inverted(mut self) -> Self {
        self.invert = true;
        self
    }

    pub fn matches(&self, event: &LogEvent) -> bool {
        if !self.levels.is_empty() && !self.levels.contains(&event.level) {
            return false;
        }

        let text_ok = self
            .text
            .as_ref()
            .is_none_or(|re| re.is_match(&event.raw_message));
        let fields_ok = self.fields.iter().all(|clause| match &event.message {
            LogMessage::Fields(fields) => clause.matches(fields),
            LogMessage::Text(_) => false,
        });

        (text_ok && fields_ok) != self.invert
    }

    /// Byte ranges of text-clause hits in `text`, for highlighting
    pub fn highlights(&self, text: &str) -> Vec<(usize, usize)> {
        match &self.text {
            Some(re) => re.find_iter(text).map(|m| (m.start(), m.end())).collect(),
            None => Vec::new(),
        }
    }

    fn compile(&self, pattern: &str) -> Result<Regex, FilterError> {
        RegexBuilder::new(pattern)
            .case_insensitive(self.ignore_case)
            .build()
            .map_err(|source| FilterError {
                pattern: pattern.to_string(),
                source,
            })
    }
}

impl FieldClause {
    fn matches(&self, fields: &Map<String, Value>) -> bool {
        let Some((first, rest)) = self.path.split_first() else {
            return false;
        };
        let mut value = fields.get(first);
        for key in rest {
            value = value.and_then(|v| v.get(key));
        }

        match value {
            Some(Value::String(s)) => self.pattern.is_match(s),
            Some(Value::Null) | None => false,
            Some(other) => self.pattern.is_match(&other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dockscope_types::StdType;
    use serde_json::json;

    fn text_event(raw: &str) -> LogEvent {
        LogEvent::new(1, raw.to_string(), StdType::Stdout)
    }

    fn json_event(value: Value) -> LogEvent {
        let mut event = text_event(&value.to_string());
        if let Value::Object(fields) = value {
            event.message = LogMessage::Fields(fields);
        }
        event
    }

    #[test]
    fn test_empty_filter_passes_everything() {
        let filter = LogFilter::new().text("").unwrap();
        assert!(filter.matches(&text_event("anything")));
        assert!(filter.highlights("anything").is_empty());
    }

    #[test]
    fn test_text_clause_searches_raw_message() {
        let filter = LogFilter::new().text("timeout").unwrap();
        assert!(filter.matches(&text_event("upstream timeout after 3s")));
        assert!(filter.matches(&json_event(json!({"msg": "db timeout"}))));
        assert!(!filter.matches(&text_event("all good")));
    }

    #[test]
    fn test_ignore_case() {
        let filter = LogFilter::new().ignore_case().text("timeout").unwrap();
        assert!(filter.matches(&text_event("Request TIMEOUT")));
    }

    #[test]
    fn test_field_clause_reads_nested_values() {
        let filter = LogFilter::new()
            .field("http.status", "^5\\d\\d$")
            .unwrap()
            .field("service", "api")
            .unwrap();

        assert!(filter.matches(&json_event(json!({"service": "api", "http": {"status": 503}}))));
        assert!(!filter.matches(&json_event(json!({"service": "api", "http": {"status": 200}}))));
        assert!(!filter.matches(&json_event(json!({"service": "web", "http": {"status": 500}}))));
        assert!(!filter.matches(&json_event(json!({"service": "api"}))));
    }

    #[test]
    fn test_field_clause_rejects_plain_text() {
        let filter = LogFilter::new().field("service", "api").unwrap();
        assert!(!filter.matches(&text_event("service=api but not parsed")));
    }

    #[test]
    fn test_invert_keeps_level_gate() {
        let filter = LogFilter::new()
            .text("timeout")
            .unwrap()
            .with_levels(HashSet::from([LogLevel::Error]))
            .inverted();

        let mut event = text_event("disk full");
        event.level = LogLevel::Error;
        assert!(filter.matches(&event));

        event.raw_message = "timeout talking to db".to_string();
        assert!(!filter.matches(&event));

        let mut info = text_event("disk full");
        info.level = LogLevel::Info;
        assert!(!filter.matches(&info));
    }

    #[test]
    fn test_highlights() {
        let filter = LogFilter::new().text("error").unwrap();
        let ranges = filter.highlights("an error occurred, another error here");
        assert_eq!(ranges, vec![(3, 8), (27, 32)]);
    }

    #[test]
    fn test_bad_pattern_names_it() {
        let err = LogFilter::new().field("level", "(").unwrap_err();
        assert!(err.to_string().contains("'('"));
    }
}
