use std::borrow::Cow;
use std::fmt;

/// One line of `key=value` pairs, the only thing the CLI writes to stdout.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct KvLine {
    fields: Vec<(&'static str, String)>,
}

impl KvLine {
    pub fn ok() -> Self {
        Self::default().field("ok", true)
    }

    pub fn failed(error: impl fmt::Display) -> Self {
        Self::default().field("ok", false).field("error", error)
    }

    pub fn field(mut self, key: &'static str, value: impl fmt::Display) -> Self {
        self.fields.push((key, value.to_string()));
        self
    }

    /// Writes an empty value for `None` so the key set per command stays fixed.
    pub fn opt(self, key: &'static str, value: Option<impl fmt::Display>) -> Self {
        match value {
            Some(value) => self.field(key, value),
            None => self.field(key, ""),
        }
    }
}

impl fmt::Display for KvLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, (key, value)) in self.fields.iter().enumerate() {
            if idx > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{key}={}", quote(value))?;
        }
        Ok(())
    }
}

fn quote(value: &str) -> Cow<'_, str> {
    let needs_quotes = value
        .chars()
        .any(|ch| ch.is_whitespace() || matches!(ch, '"' | '=' | '\\'));
    if !needs_quotes {
        return Cow::Borrowed(value);
    }
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for ch in value.chars() {
        match ch {
            '"' => quoted.push_str("\\\""),
            '\\' => quoted.push_str("\\\\"),
            '\n' => quoted.push_str("\\n"),
            '\r' => quoted.push_str("\\r"),
            '\t' => quoted.push_str("\\t"),
            other => quoted.push(other),
        }
    }
    quoted.push('"');
    Cow::Owned(quoted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_values_are_bare() {
        let line = KvLine::ok().field("id", 12).field("task_type", "deploy");
        assert_eq!(line.to_string(), "ok=true id=12 task_type=deploy");
    }

    #[test]
    fn values_with_spaces_or_quotes_are_escaped() {
        let line = KvLine::failed("job 7 not found").field("data", r#"{"a":"b c"}"#);
        assert_eq!(
            line.to_string(),
            r#"ok=false error="job 7 not found" data="{\"a\":\"b c\"}""#
        );
    }

    #[test]
    fn missing_optionals_render_empty() {
        let line = KvLine::ok().opt("worker_id", None::<&str>).opt("priority", Some(3));
        assert_eq!(line.to_string(), "ok=true worker_id= priority=3");
    }

    #[test]
    fn newlines_never_break_the_line() {
        let line = KvLine::failed("first\nsecond");
        assert_eq!(line.to_string(), r#"ok=false error="first\nsecond""#);
    }
}
