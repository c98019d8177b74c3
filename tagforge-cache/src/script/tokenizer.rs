//! Tokenizer for the parenthesis-delimited scripting language.
//!
//! The lexer is a two-state machine: outside a token, or inside one with a
//! known terminator (a closing quote for quoted strings, whitespace or a
//! parenthesis for bare tokens). Parentheses are single-character tokens
//! anywhere outside a quoted string; a backslash escapes exactly one
//! character; a semicolon outside a string opens a line comment.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub enum TokenValue {
    ParenthesisBegin,
    ParenthesisEnd,
    String(String),
    Integer(i32),
    Decimal(f32),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    /// 1-based line of the token's first character.
    pub line: usize,
    /// 1-based column of the token's first character.
    pub column: usize,
    pub value: TokenValue,
}

/// Input ended while a token was still open. Tokenization is not resumable
/// past this point.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("unterminated token at {line}:{column}: {token}")]
pub struct TokenizerError {
    pub line: usize,
    pub column: usize,
    /// The partial token text from its first character to end of input.
    pub token: String,
}

pub fn tokenize(source: &str) -> Result<Vec<Token>, TokenizerError> {
    let chars: Vec<(usize, char)> = source.char_indices().collect();
    let mut tokens = Vec::new();

    // Token start, if we are inside one.
    let mut token_start: Option<usize> = None;
    let mut token_start_line = 0usize;
    let mut token_start_column = 0usize;
    let mut escape = false;

    // The expected terminator of the token: '"' inside a quoted string,
    // ' ' standing in for "any whitespace" inside a bare token.
    let mut expected_end = '\0';

    let mut line = 1usize;
    let mut column = 1usize;
    let mut i = 0usize;

    while i < chars.len() {
        let (byte_offset, c) = chars[i];
        let whitespace = matches!(c, ' ' | '\t' | '\r' | '\n');
        let parenthesis = (c == '(' || c == ')') && expected_end != '"';
        let mut reprocess = false;

        if let Some(start) = token_start {
            // Breaking the token? Not while escaping.
            if !escape && ((expected_end == ' ' && whitespace) || expected_end == c || parenthesis)
            {
                let raw = &source[start..byte_offset];
                tokens.push(finish_token(raw, token_start_line, token_start_column));
                expected_end = '\0';
                token_start = None;
                // A parenthesis both ends the token and is a token itself, so
                // run this character again from the "outside" state.
                reprocess = parenthesis;
            }
        } else if !whitespace {
            if parenthesis {
                tokens.push(Token {
                    line,
                    column,
                    value: if c == '(' {
                        TokenValue::ParenthesisBegin
                    } else {
                        TokenValue::ParenthesisEnd
                    },
                });
            } else if c == ';' {
                // Line comment: skip to the newline, which still counts.
                match chars[i..].iter().position(|&(_, k)| k == '\n') {
                    Some(skip) => {
                        i += skip + 1;
                        line += 1;
                        column = 1;
                        escape = false;
                        continue;
                    }
                    None => break,
                }
            } else {
                token_start = Some(byte_offset);
                expected_end = if c == '"' { '"' } else { ' ' };
                token_start_line = line;
                token_start_column = column;
            }
        }

        if reprocess {
            continue;
        }

        escape = c == '\\' && !escape;

        if c == '\n' {
            line += 1;
            column = 1;
        } else {
            column += 1;
        }
        i += 1;
    }

    // Ending while still in the middle of a token is an error.
    if let Some(start) = token_start {
        return Err(TokenizerError {
            line: token_start_line,
            column: token_start_column,
            token: source[start..].to_owned(),
        });
    }

    Ok(tokens)
}

/// Decode escapes and classify a finished token.
fn finish_token(raw: &str, line: usize, column: usize) -> Token {
    let mut numeric = true;
    let mut decimal = false;
    let mut escape = false;
    let mut s = String::with_capacity(raw.len());

    let mut it = raw.chars().peekable();
    while let Some(c) = it.next() {
        if c == '\\' && !escape {
            escape = true;
            numeric = false;
            continue;
        }
        if escape {
            match c {
                'n' => s.push('\n'),
                'r' => s.push('\r'),
                't' => s.push('\t'),
                other => s.push(other),
            }
        } else {
            if !c.is_ascii_digit() && (c != '-' || !s.is_empty()) {
                // A single interior '.' keeps the token numeric as a decimal.
                if c == '.' && it.peek().is_some() && !decimal {
                    decimal = true;
                } else {
                    numeric = false;
                }
            }
            s.push(c);
        }
        escape = false;
    }

    let quoted = raw.starts_with('"');
    if quoted {
        s.remove(0);
    }

    let value = if quoted || !numeric {
        TokenValue::String(s)
    } else if decimal {
        TokenValue::Decimal(s.parse().unwrap_or(0.0))
    } else {
        TokenValue::Integer(parse_integer(&s))
    };

    Token { line, column, value }
}

/// strtol-ish: clamp to the i32 range, unparseable leftovers become 0.
fn parse_integer(s: &str) -> i32 {
    s.parse::<i64>()
        .map(|v| v.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32)
        .unwrap_or(0)
}
