//! Command-line tokenizer.
//!
//! Splits a command line on whitespace, treating single- or
//! double-quoted runs as one token. The quotes themselves survive
//! tokenization; [`strip_quotes`] removes them when the command parser
//! consumes the argument, so the raw token is available for logging.

use crate::error::ProtocolError;

/// Splits one command line into tokens. Quotes group; they are kept in
/// the token. A line that ends inside a quoted run is rejected.
pub fn tokenize(line: &str) -> Result<Vec<String>, ProtocolError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_single = false;
    let mut in_double = false;

    for c in line.chars() {
        if c == '\'' && !in_double {
            in_single = !in_single;
            current.push(c);
        } else if c == '"' && !in_single {
            in_double = !in_double;
            current.push(c);
        } else if c.is_whitespace() && !in_single && !in_double {
            if !current.is_empty() {
                tokens.push(std::mem::take(&mut current));
            }
        } else {
            current.push(c);
        }
    }
    if in_single || in_double {
        return Err(ProtocolError::UnbalancedQuotes);
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    Ok(tokens)
}

/// Removes one layer of matching outer quotes, if present.
pub fn strip_quotes(token: &str) -> &str {
    let bytes = token.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if (first == b'\'' && last == b'\'') || (first == b'"' && last == b'"') {
            return &token[1..token.len() - 1];
        }
    }
    token
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_whitespace() {
        assert_eq!(tokenize("SET foo bar").unwrap(), vec!["SET", "foo", "bar"]);
        assert_eq!(tokenize("  PING  ").unwrap(), vec!["PING"]);
        assert!(tokenize("").unwrap().is_empty());
        assert!(tokenize("   ").unwrap().is_empty());
    }

    #[test]
    fn double_quotes_group_spaces() {
        assert_eq!(
            tokenize(r#"SET msg "hello world""#).unwrap(),
            vec!["SET", "msg", r#""hello world""#]
        );
    }

    #[test]
    fn single_quotes_group_spaces() {
        assert_eq!(
            tokenize("SET msg 'a b c'").unwrap(),
            vec!["SET", "msg", "'a b c'"]
        );
    }

    #[test]
    fn quotes_inside_other_quotes_are_literal() {
        assert_eq!(
            tokenize(r#"ECHO "it's fine""#).unwrap(),
            vec!["ECHO", r#""it's fine""#]
        );
    }

    #[test]
    fn unbalanced_quotes_rejected() {
        assert_eq!(
            tokenize(r#"SET k "oops"#),
            Err(ProtocolError::UnbalancedQuotes)
        );
        assert_eq!(tokenize("SET k 'oops"), Err(ProtocolError::UnbalancedQuotes));
    }

    #[test]
    fn strip_quotes_removes_matching_pairs() {
        assert_eq!(strip_quotes(r#""hello world""#), "hello world");
        assert_eq!(strip_quotes("'a b'"), "a b");
        assert_eq!(strip_quotes("plain"), "plain");
        assert_eq!(strip_quotes(r#""mismatched'"#), r#""mismatched'"#);
        assert_eq!(strip_quotes("\""), "\"");
        assert_eq!(strip_quotes("\"\""), "");
    }

    #[test]
    fn tabs_separate_tokens() {
        assert_eq!(tokenize("GET\tfoo").unwrap(), vec!["GET", "foo"]);
    }
}
