use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum LogfmtError {
    #[error("empty key")]
    EmptyKey,
    #[error("space inside key")]
    SpaceInKey,
    #[error("unterminated quoted value")]
    UnterminatedQuote,
    #[error("key without value")]
    DanglingKey,
}

#[derive(Clone, Copy)]
enum Mode {
    Key,
    Value { escaping: bool },
    Quoted { escaping: bool },
}

/// Parse `key=value key2="quoted value"` text into an ordered map
///
/// Keys end at `=`. Unquoted values end at the next unescaped space, quoted
/// values at the next unescaped `"`. A backslash escapes the following character.
pub fn parse_logfmt(input: &str) -> Result<Map<String, Value>, LogfmtError> {
    let mut fields = Map::new();
    let mut mode = Mode::Key;
    let mut key = String::new();
    let mut value = String::new();

    for c in input.chars() {
        match mode {
            Mode::Key => match c {
                '=' if key.is_empty() => return Err(LogfmtError::EmptyKey),
                '=' => mode = Mode::Value { escaping: false },
                ' ' if key.is_empty() => {}
                ' ' => return Err(LogfmtError::SpaceInKey),
                _ => key.push(c),
            },
            Mode::Value { escaping: true } => {
                value.push(c);
                mode = Mode::Value { escaping: false };
            }
            Mode::Value { escaping: false } => match c {
                '"' if value.is_empty() => mode = Mode::Quoted { escaping: false },
                '\\' => mode = Mode::Value { escaping: true },
                ' ' => {
                    fields.insert(std::mem::take(&mut key), Value::String(std::mem::take(&mut value)));
                    mode = Mode::Key;
                }
                _ => value.push(c),
            },
            Mode::Quoted { escaping: true } => {
                value.push(c);
                mode = Mode::Quoted { escaping: false };
            }
            Mode::Quoted { escaping: false } => match c {
                '\\' => mode = Mode::Quoted { escaping: true },
                '"' => {
                    fields.insert(std::mem::take(&mut key), Value::String(std::mem::take(&mut value)));
                    mode = Mode::Key;
                }
                _ => value.push(c),
            },
        }
    }

    match mode {
        Mode::Key if !key.is_empty() => Err(LogfmtError::DanglingKey),
        Mode::Key => Ok(fields),
        Mode::Value { .. } => {
            fields.insert(key, Value::String(value));
            Ok(fields)
        }
        Mode::Quoted { .. } => Err(LogfmtError::UnterminatedQuote),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_pairs_in_order() {
        let fields = parse_logfmt(r#"time=12:00 level=info msg="hello world" status=200"#).unwrap();
        let keys: Vec<_> = fields.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["time", "level", "msg", "status"]);
        assert_eq!(fields["msg"], "hello world");
        assert_eq!(fields["status"], "200");
    }

    #[test]
    fn test_escapes() {
        let fields = parse_logfmt(r#"msg="say \"hi\"" path=a\ b"#).unwrap();
        assert_eq!(fields["msg"], r#"say "hi""#);
        assert_eq!(fields["path"], "a b");
    }

    #[test]
    fn test_empty_value() {
        let fields = parse_logfmt("a= b=2").unwrap();
        assert_eq!(fields["a"], "");
        assert_eq!(fields["b"], "2");
    }

    #[test]
    fn test_failure_modes() {
        assert_eq!(parse_logfmt(r#"msg="never closed"#), Err(LogfmtError::UnterminatedQuote));
        assert_eq!(parse_logfmt("bad key=value"), Err(LogfmtError::SpaceInKey));
        assert_eq!(parse_logfmt("a=1 dangling"), Err(LogfmtError::DanglingKey));
        assert_eq!(parse_logfmt("=value"), Err(LogfmtError::EmptyKey));
    }

    #[test]
    fn test_plain_text_is_rejected() {
        assert!(parse_logfmt("Starting server on port 8080").is_err());
        assert!(parse_logfmt("hello").is_err());
    }
}
