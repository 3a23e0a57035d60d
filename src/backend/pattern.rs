//! LIKE matching with `\` as the escape character. Case-sensitive.
//!
//! The emulator evaluates the two shapes the service issues: an exact
//! literal and a literal followed by a single trailing `%`. Any other use of
//! `%` or `_` is rejected with `InvalidArgument`.

use crate::core::{BackendError, BackendResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LikeToken {
    Literal(char),
    AnyOne,
    AnyMany,
}

fn tokenize(pattern: &str) -> BackendResult<Vec<LikeToken>> {
    let mut tokens = Vec::with_capacity(pattern.len());
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        let token = match c {
            '%' => LikeToken::AnyMany,
            '_' => LikeToken::AnyOne,
            '\\' => match chars.next() {
                Some(escaped) => LikeToken::Literal(escaped),
                None => {
                    return Err(BackendError::InvalidArgument(format!(
                        "LIKE pattern ends with a dangling escape: '{}'",
                        pattern
                    )));
                }
            },
            other => LikeToken::Literal(other),
        };
        tokens.push(token);
    }
    Ok(tokens)
}

/// Leading literal run and whatever follows it.
fn split_prefix(tokens: &[LikeToken]) -> (String, &[LikeToken]) {
    let literal_len = tokens
        .iter()
        .take_while(|t| matches!(t, LikeToken::Literal(_)))
        .count();
    let prefix = tokens[..literal_len]
        .iter()
        .filter_map(|t| match t {
            LikeToken::Literal(c) => Some(*c),
            _ => None,
        })
        .collect();
    (prefix, &tokens[literal_len..])
}

/// Evaluate `text LIKE pattern`.
pub fn eval_like(text: &str, pattern: &str) -> BackendResult<bool> {
    let tokens = tokenize(pattern)?;
    let (prefix, rest) = split_prefix(&tokens);
    match rest {
        [] => Ok(text == prefix),
        [LikeToken::AnyMany] => Ok(text.starts_with(&prefix)),
        _ => Err(BackendError::InvalidArgument(format!(
            "only exact and trailing-'%' LIKE patterns are supported, got '{}'",
            pattern
        ))),
    }
}
