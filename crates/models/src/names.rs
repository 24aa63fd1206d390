/// Characters that may not appear in a snapshot name because the name is
/// used as part of repository blob paths.
const INVALID_FILENAME_CHARS: &[char] = &['\\', '/', '*', '?', '"', '<', '>', '|', ','];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid snapshot name [{name}]: {reason}")]
pub struct InvalidName {
    pub name: String,
    pub reason: String,
}

/// Validates a user-supplied snapshot name at admission time.
pub fn validate_snapshot_name(name: &str) -> Result<(), InvalidName> {
    let fail = |reason: &str| {
        Err(InvalidName {
            name: name.to_string(),
            reason: reason.to_string(),
        })
    };
    if name.is_empty() {
        return fail("cannot be empty");
    }
    if name.contains(char::is_whitespace) {
        return fail("must not contain whitespace");
    }
    if name.contains('#') {
        return fail("must not contain '#'");
    }
    if name.starts_with('_') {
        return fail("must not start with '_'");
    }
    if name.to_lowercase() != name {
        return fail("must be lowercase");
    }
    if name.contains(INVALID_FILENAME_CHARS) {
        return fail(r#"must not contain the following characters: \, /, *, ?, ", <, >, |, ','"#);
    }
    Ok(())
}

/// Matches `value` against a pattern where `*` matches any run of
/// characters. A pattern without `*` is an exact comparison.
pub fn simple_match(pattern: &str, value: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == value;
    }
    let mut expr = String::from("^");
    for (i, part) in pattern.split('*').enumerate() {
        if i > 0 {
            expr.push_str(".*");
        }
        expr.push_str(&regex::escape(part));
    }
    expr.push('$');
    regex::Regex::new(&expr)
        .map(|re| re.is_match(value))
        .unwrap_or(false)
}

/// Whether any of `patterns` matches `value`.
pub fn match_any<S: AsRef<str>>(patterns: &[S], value: &str) -> bool {
    patterns.iter().any(|p| simple_match(p.as_ref(), value))
}
