use logos::{Lexer, Logos};
use thiserror::Error;

use super::unescape::{unescape, UnescapeError};

#[derive(Debug, Clone, PartialEq, Default, Error)]
pub enum LexerError {
    #[default]
    #[error("unknown token")]
    UnknownToken,
    #[error("unterminated string")]
    UnterminatedString,
    #[error(transparent)]
    Escape(#[from] UnescapeError),
}

#[derive(Debug, PartialEq, Logos)]
#[logos(skip r"[ \t\r\n\f]+", error = LexerError)]
pub enum Token<'a> {
    #[token("&&")]
    And,
    #[token("||")]
    Or,
    #[token(";")]
    Semi,
    #[token("&")]
    Background,
    #[token("|")]
    Pipe,
    #[token(">>")]
    Append,
    #[token(">")]
    Write,
    #[token("<")]
    Read,
    #[token("2>>")]
    ErrAppend,
    #[token("2>")]
    ErrWrite,
    #[token("2>&1")]
    ErrToOut,

    #[regex(r##"[^ \t\r\n\f|&;<>'"#]+"##)]
    Word(&'a str),
    #[regex(r#""([^"\\]|\\.)*""#, double_quoted)]
    DoubleQuotedString(String),
    #[regex(r"'[^']*'", single_quoted)]
    SingleQuotedString(String),
    #[regex(r#""([^"\\]|\\.)*"#, unterminated)]
    #[regex(r"'[^']*", unterminated)]
    Unterminated,
    #[regex(r"#[^\n]*")]
    Comment(&'a str),
}

impl Token<'_> {
    /// Whether the token is (part of) an argument.
    pub fn is_word(&self) -> bool {
        matches!(
            self,
            Self::Word(_) | Self::DoubleQuotedString(_) | Self::SingleQuotedString(_)
        )
    }
}

fn double_quoted<'a>(lex: &mut Lexer<'a, Token<'a>>) -> Result<String, LexerError> {
    let slice = lex.slice();
    Ok(unescape(&slice[1..slice.len() - 1])?)
}

fn single_quoted<'a>(lex: &mut Lexer<'a, Token<'a>>) -> String {
    let slice = lex.slice();
    slice[1..slice.len() - 1].to_owned()
}

fn unterminated<'a>(_: &mut Lexer<'a, Token<'a>>) -> Result<(), LexerError> {
    Err(LexerError::UnterminatedString)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(input: &str) -> Vec<Result<Token<'_>, LexerError>> {
        Token::lexer(input).collect()
    }

    #[test]
    fn splits_words_and_operators() {
        assert_eq!(
            lex("ls -la | grep foo && echo ok; sleep 1 &"),
            vec![
                Ok(Token::Word("ls")),
                Ok(Token::Word("-la")),
                Ok(Token::Pipe),
                Ok(Token::Word("grep")),
                Ok(Token::Word("foo")),
                Ok(Token::And),
                Ok(Token::Word("echo")),
                Ok(Token::Word("ok")),
                Ok(Token::Semi),
                Ok(Token::Word("sleep")),
                Ok(Token::Word("1")),
                Ok(Token::Background),
            ]
        );
    }

    #[test]
    fn stderr_redirections_win_over_words() {
        assert_eq!(
            lex("make 2>&1 2>> log 2> err"),
            vec![
                Ok(Token::Word("make")),
                Ok(Token::ErrToOut),
                Ok(Token::ErrAppend),
                Ok(Token::Word("log")),
                Ok(Token::ErrWrite),
                Ok(Token::Word("err")),
            ]
        );
        assert_eq!(lex("echo a2"), vec![Ok(Token::Word("echo")), Ok(Token::Word("a2"))]);
    }

    #[test]
    fn quoted_strings() {
        assert_eq!(
            lex(r#"echo "a \"b\"" 'c d'"#),
            vec![
                Ok(Token::Word("echo")),
                Ok(Token::DoubleQuotedString("a \"b\"".into())),
                Ok(Token::SingleQuotedString("c d".into())),
            ]
        );
    }

    #[test]
    fn words_end_at_quotes_and_comments() {
        assert_eq!(
            lex(r#"say"hi" x#rest"#),
            vec![
                Ok(Token::Word("say")),
                Ok(Token::DoubleQuotedString("hi".into())),
                Ok(Token::Word("x")),
                Ok(Token::Comment("#rest")),
            ]
        );
    }

    #[test]
    fn unterminated_strings_are_errors() {
        assert!(lex(r#"echo "open"#)
            .iter()
            .any(|token| token == &Err(LexerError::UnterminatedString)));
        assert!(lex("echo 'open")
            .iter()
            .any(|token| token == &Err(LexerError::UnterminatedString)));
    }
}
