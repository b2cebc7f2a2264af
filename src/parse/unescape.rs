use std::num::ParseIntError;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UnescapeError {
    #[error("dangling backslash at {index}")]
    Dangling { index: usize },
    #[error("expected '{{' after \\u at {index}")]
    BraceNotFound { index: usize },
    #[error("could not parse {digits} as hex at {index}: {source}")]
    ParseHexFailed {
        #[source]
        source: ParseIntError,
        digits: String,
        index: usize,
    },
    #[error("{value:#x} is not a unicode scalar value (at {index})")]
    NotAChar { value: u32, index: usize },
}

/// Resolves the escapes inside a double quoted word, quotes already removed.
///
/// Unknown escapes keep their backslash, as a POSIX shell does.
pub fn unescape(inner: &str) -> Result<String, UnescapeError> {
    let mut res = String::with_capacity(inner.len());
    let mut chars = inner.char_indices();

    while let Some((index, c)) = chars.next() {
        if c != '\\' {
            res.push(c);
            continue;
        }

        let Some((_, escaped)) = chars.next() else {
            return Err(UnescapeError::Dangling { index });
        };

        match escaped {
            'n' => res.push('\n'),
            'r' => res.push('\r'),
            't' => res.push('\t'),
            'a' => res.push('\u{07}'),
            'e' | 'E' => res.push('\u{1B}'),
            '0' => res.push('\0'),
            '"' | '\\' | '$' | '`' => res.push(escaped),
            'u' => res.push(parse_unicode(&mut chars, index)?),
            other => {
                res.push('\\');
                res.push(other);
            }
        }
    }

    Ok(res)
}

fn parse_unicode<I>(chars: &mut I, index: usize) -> Result<char, UnescapeError>
where
    I: Iterator<Item = (usize, char)>,
{
    if !matches!(chars.next(), Some((_, '{'))) {
        return Err(UnescapeError::BraceNotFound { index });
    }

    let digits = chars
        .take_while(|&(_, c)| c != '}')
        .map(|(_, c)| c)
        .collect::<String>();

    let value = u32::from_str_radix(&digits, 16).map_err(|source| {
        UnescapeError::ParseHexFailed {
            source,
            digits: digits.clone(),
            index,
        }
    })?;

    char::from_u32(value).ok_or(UnescapeError::NotAChar { value, index })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_common_escapes() {
        assert_eq!(unescape(r#"a\tb\n\"q\" \$HOME"#).unwrap(), "a\tb\n\"q\" $HOME");
        assert_eq!(unescape(r"\u{1F600}").unwrap(), "\u{1F600}");
    }

    #[test]
    fn unknown_escape_keeps_backslash() {
        assert_eq!(unescape(r"C:\dir\x").unwrap(), r"C:\dir\x");
    }

    #[test]
    fn reports_bad_escapes() {
        assert_eq!(unescape("end\\"), Err(UnescapeError::Dangling { index: 3 }));
        assert_eq!(
            unescape(r"\u1234"),
            Err(UnescapeError::BraceNotFound { index: 0 })
        );
        assert!(matches!(
            unescape(r"\u{zz}"),
            Err(UnescapeError::ParseHexFailed { .. })
        ));
        assert!(matches!(
            unescape(r"\u{D800}"),
            Err(UnescapeError::NotAChar { .. })
        ));
    }
}
