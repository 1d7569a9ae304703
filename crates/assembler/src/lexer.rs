//! Tokenizer for symil assembly text.

use crate::error::AsmError;

/// A single token from an assembly line.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Token {
    /// A name, mnemonic, directive or type. May contain `.`, `::`, `!`,
    /// balanced `<...>` argument lists and `[]`/`&` suffixes.
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    /// One of `( ) , = :`.
    Punct(char),
}

impl Token {
    /// Source-like spelling, for error messages.
    pub(crate) fn text(&self) -> String {
        match self {
            Token::Ident(s) => s.clone(),
            Token::Int(n) => n.to_string(),
            Token::Float(v) => format!("{v:?}"),
            Token::Str(s) => format!("{s:?}"),
            Token::Punct(c) => c.to_string(),
        }
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '!' | '$' | '`' | '@')
}

/// Tokenize a single line of assembly text.
///
/// Returns an empty Vec for blank lines and comment-only lines.
/// Comments start with `;` or `//` outside string literals.
pub(crate) fn tokenize_line(line: &str, line_num: usize) -> Result<Vec<Token>, AsmError> {
    let chars: Vec<char> = line.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c == ';' || (c == '/' && chars.get(i + 1) == Some(&'/')) {
            break;
        } else if c == '"' {
            let (s, next) = string_literal(&chars, i + 1, line_num)?;
            tokens.push(Token::Str(s));
            i = next;
        } else if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(char::is_ascii_digit)) {
            let start = i;
            i += 1;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || matches!(chars[i], '.' | '_')) {
                // `1e-5`
                if matches!(chars[i], 'e' | 'E') && chars.get(i + 1) == Some(&'-') {
                    i += 1;
                }
                i += 1;
            }
            let word: String = chars[start..i].iter().collect();
            tokens.push(number(&word, line_num)?);
        } else if matches!(c, '(' | ')' | ',' | '=') {
            tokens.push(Token::Punct(c));
            i += 1;
        } else if c == ':' && chars.get(i + 1) != Some(&':') {
            tokens.push(Token::Punct(':'));
            i += 1;
        } else if is_ident_char(c) || c == ':' {
            let (word, next) = ident(&chars, i, line_num)?;
            tokens.push(Token::Ident(word));
            i = next;
        } else {
            return Err(AsmError::UnexpectedToken {
                line: line_num,
                token: c.to_string(),
            });
        }
    }

    Ok(tokens)
}

/// Scans an identifier starting at `start`; whitespace inside `<...>` is
/// dropped.
fn ident(chars: &[char], start: usize, line_num: usize) -> Result<(String, usize), AsmError> {
    let mut word = String::new();
    let mut depth = 0usize;
    let mut i = start;
    while i < chars.len() {
        let c = chars[i];
        if c == ':' && chars.get(i + 1) == Some(&':') {
            word.push_str("::");
            i += 2;
            continue;
        }
        let accepted = match c {
            '<' => {
                depth += 1;
                true
            }
            '>' if depth > 0 => {
                depth -= 1;
                true
            }
            ',' if depth > 0 => true,
            c if c.is_whitespace() && depth > 0 => {
                i += 1;
                continue;
            }
            '[' if chars.get(i + 1) == Some(&']') => {
                word.push_str("[]");
                i += 2;
                continue;
            }
            '&' => true,
            c => is_ident_char(c),
        };
        if !accepted {
            break;
        }
        word.push(c);
        i += 1;
    }
    if depth > 0 {
        return Err(AsmError::UnexpectedToken {
            line: line_num,
            token: word,
        });
    }
    Ok((word, i))
}

fn string_literal(chars: &[char], start: usize, line_num: usize) -> Result<(String, usize), AsmError> {
    let mut s = String::new();
    let mut i = start;
    while i < chars.len() {
        match chars[i] {
            '"' => return Ok((s, i + 1)),
            '\\' => {
                let escaped = match chars.get(i + 1) {
                    Some('n') => '\n',
                    Some('t') => '\t',
                    Some('r') => '\r',
                    Some('0') => '\0',
                    Some('\\') => '\\',
                    Some('"') => '"',
                    _ => return Err(AsmError::UnterminatedString { line: line_num }),
                };
                s.push(escaped);
                i += 2;
            }
            c => {
                s.push(c);
                i += 1;
            }
        }
    }
    Err(AsmError::UnterminatedString { line: line_num })
}

fn number(word: &str, line_num: usize) -> Result<Token, AsmError> {
    let invalid = || AsmError::InvalidNumber {
        line: line_num,
        token: word.to_string(),
    };
    let (negative, digits) = match word.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, word),
    };
    if let Some(hex) = digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        let v = u64::from_str_radix(hex, 16).map_err(|_| invalid())? as i64;
        return Ok(Token::Int(if negative { v.wrapping_neg() } else { v }));
    }
    if digits.contains(['.', 'e', 'E']) {
        return word.parse().map(Token::Float).map_err(|_| invalid());
    }
    word.parse().map(Token::Int).map_err(|_| invalid())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ident(s: &str) -> Token {
        Token::Ident(s.to_string())
    }

    #[test]
    fn empty_line() {
        assert_eq!(tokenize_line("", 1).unwrap(), vec![]);
    }

    #[test]
    fn comment_only() {
        assert_eq!(tokenize_line("; this is a comment", 1).unwrap(), vec![]);
        assert_eq!(tokenize_line("   // so is this", 1).unwrap(), vec![]);
    }

    #[test]
    fn opcode_with_comment() {
        assert_eq!(tokenize_line("  add ; add two values", 1).unwrap(), vec![ident("add")]);
    }

    #[test]
    fn numbers() {
        assert_eq!(
            tokenize_line("ldc.i4 -5", 1).unwrap(),
            vec![ident("ldc.i4"), Token::Int(-5)]
        );
        assert_eq!(tokenize_line("ldc.i8 0x2a", 1).unwrap()[1], Token::Int(42));
        assert_eq!(tokenize_line("ldc.r8 1.5", 1).unwrap()[1], Token::Float(1.5));
        assert_eq!(tokenize_line("ldc.r8 1e-3", 1).unwrap()[1], Token::Float(0.001));
    }

    #[test]
    fn strings_keep_comment_characters() {
        assert_eq!(
            tokenize_line(r#"ldstr "a;b \"c\"\n" ; trailing"#, 1).unwrap(),
            vec![ident("ldstr"), Token::Str("a;b \"c\"\n".to_string())]
        );
    }

    #[test]
    fn unterminated_string() {
        assert_eq!(
            tokenize_line("ldstr \"abc", 4).unwrap_err(),
            AsmError::UnterminatedString { line: 4 }
        );
    }

    #[test]
    fn member_and_generic_names() {
        assert_eq!(
            tokenize_line("call Dictionary<string, i32>::Add(string, i32)", 1).unwrap(),
            vec![
                ident("call"),
                ident("Dictionary<string,i32>::Add"),
                Token::Punct('('),
                ident("string"),
                Token::Punct(','),
                ident("i32"),
                Token::Punct(')'),
            ]
        );
        assert_eq!(
            tokenize_line("newobj Point::.ctor(i32[], i32&)", 1).unwrap()[1],
            ident("Point::.ctor")
        );
    }

    #[test]
    fn label_definition() {
        assert_eq!(
            tokenize_line("done: ret", 1).unwrap(),
            vec![ident("done"), Token::Punct(':'), ident("ret")]
        );
    }

    #[test]
    fn invalid_numbers() {
        assert_eq!(
            tokenize_line("ldc.i4 0xZZ", 3).unwrap_err(),
            AsmError::InvalidNumber {
                line: 3,
                token: "0xZZ".to_string()
            }
        );
        assert!(matches!(
            tokenize_line("ldc.i8 99999999999999999999999", 5),
            Err(AsmError::InvalidNumber { line: 5, .. })
        ));
    }

    #[test]
    fn unbalanced_generic_arguments() {
        assert!(matches!(
            tokenize_line(".field Dictionary<string x", 2),
            Err(AsmError::UnexpectedToken { line: 2, .. })
        ));
    }
}
