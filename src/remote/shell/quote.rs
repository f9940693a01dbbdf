//! POSIX shell quoting helpers for synthesized remote commands.

/// Single-quote `value` for `sh`, escaping embedded single quotes.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Quote a path for `sh`, leaving a leading `~` unquoted so it still expands.
pub fn quote_path(path: &str) -> String {
    match path.strip_prefix('~') {
        Some("") => "~".to_string(),
        Some(rest) if rest.starts_with('/') => {
            let rest = rest.trim_start_matches('/');
            if rest.is_empty() {
                "~/".to_string()
            } else {
                format!("~/{}", shell_quote(rest))
            }
        }
        _ => shell_quote(path),
    }
}

/// Whether `name` is a valid shell variable name.
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c == '_' || c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

/// Strip surrounding single or double quotes.
pub fn strip_quotes(value: &str) -> &str {
    value.trim_matches(|c| c == '"' || c == '\'')
}

/// Escape `literal` for use inside a basic regular expression.
pub fn grep_escape(literal: &str) -> String {
    let mut escaped = String::with_capacity(literal.len());
    for c in literal.chars() {
        if matches!(c, '\\' | '.' | '[' | ']' | '*' | '^' | '$') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Whether `command` contains operators that chain or redirect commands.
pub fn has_shell_operators(command: &str) -> bool {
    command.contains("&&")
        || command.contains("||")
        || command.contains(';')
        || command.contains('|')
        || command.contains('`')
        || command.contains("$(")
}

/// Whether any command word in `command` is `cd`, `pushd` or `popd`.
pub fn changes_directory(command: &str) -> bool {
    command
        .split(|c: char| c.is_whitespace() || matches!(c, ';' | '&' | '|' | '(' | ')'))
        .any(|word| matches!(word, "cd" | "pushd" | "popd"))
}
