//! A small plan builder: words, quotes, pipes, conditional chaining,
//! background stages and redirection. No control flow, no expansion.

use std::{ops::Range, path::PathBuf};

use logos::Logos;
use thiserror::Error;

use crate::cmd::execution_plan::{ExecPlan, InputSource, NextProgram, OutputTarget, Stage};

use self::token::{LexerError, Token};

pub mod token;
pub mod unescape;

const NULL_DEVICE: &str = "/dev/null";

#[derive(Debug, Error)]
pub enum CommandParseError {
    #[error("failed to tokenize command: {}", .0.iter().map(ToString::to_string).collect::<Vec<_>>().join(", "))]
    Lexer(Vec<LexerError>),
    #[error("missing command before {0}")]
    MissingCommand(&'static str),
    #[error("missing target after {0}")]
    MissingTarget(&'static str),
}

#[derive(Debug, Clone, Copy)]
enum Redirect {
    Input,
    Overwrite,
    Append,
    ErrOverwrite,
    ErrAppend,
}

impl Redirect {
    fn operator(self) -> &'static str {
        match self {
            Self::Input => "<",
            Self::Overwrite => ">",
            Self::Append => ">>",
            Self::ErrOverwrite => "2>",
            Self::ErrAppend => "2>>",
        }
    }
}

/// Collects one stage while its tokens are read.
#[derive(Default)]
struct PendingStage {
    argv: Vec<String>,
    span: Option<Range<usize>>,
    stdin: Option<InputSource>,
    stdout: Option<OutputTarget>,
    stderr: Option<OutputTarget>,
    redirect: Option<Redirect>,
    /// Whether the last word may still be extended by an adjacent one.
    word_end: Option<usize>,
}

impl PendingStage {
    fn extend_span(&mut self, span: &Range<usize>) {
        self.span = Some(match self.span.take() {
            Some(existing) => existing.start..span.end,
            None => span.clone(),
        });
    }

    fn push_word(&mut self, word: String, span: Range<usize>) {
        self.extend_span(&span);

        if let Some(redirect) = self.redirect.take() {
            let path = PathBuf::from(&word);
            let null = word == NULL_DEVICE;
            match redirect {
                Redirect::Input if null => self.stdin = Some(InputSource::Null),
                Redirect::Input => self.stdin = Some(InputSource::File(path)),
                Redirect::Overwrite | Redirect::Append if null => {
                    self.stdout = Some(OutputTarget::Null)
                }
                Redirect::Overwrite => self.stdout = Some(OutputTarget::Overwrite(path)),
                Redirect::Append => self.stdout = Some(OutputTarget::Append(path)),
                Redirect::ErrOverwrite | Redirect::ErrAppend if null => {
                    self.stderr = Some(OutputTarget::Null)
                }
                Redirect::ErrOverwrite => self.stderr = Some(OutputTarget::Overwrite(path)),
                Redirect::ErrAppend => self.stderr = Some(OutputTarget::Append(path)),
            }
            self.word_end = None;
            return;
        }

        match (self.word_end, self.argv.last_mut()) {
            // `foo"bar"` is one argument
            (Some(end), Some(last)) if end == span.start => last.push_str(&word),
            _ => self.argv.push(word),
        }
        self.word_end = Some(span.end);
    }

    fn redirect(&mut self, redirect: Redirect, span: &Range<usize>) -> Result<(), CommandParseError> {
        if let Some(previous) = self.redirect {
            return Err(CommandParseError::MissingTarget(previous.operator()));
        }
        self.extend_span(span);
        self.redirect = Some(redirect);
        self.word_end = None;
        Ok(())
    }

    fn finish(self, source: &str, operator: &'static str) -> Result<Stage, CommandParseError> {
        if let Some(redirect) = self.redirect {
            return Err(CommandParseError::MissingTarget(redirect.operator()));
        }
        if self.argv.is_empty() {
            return Err(CommandParseError::MissingCommand(operator));
        }

        let text = self
            .span
            .map(|span| source[span].to_owned())
            .unwrap_or_default();

        let mut stage = Stage::new(self.argv).with_text(text);
        if let Some(stdin) = self.stdin {
            stage.stdin = stdin;
        }
        if let Some(stdout) = self.stdout {
            stage.stdout = stdout;
        }
        if let Some(stderr) = self.stderr {
            stage.stderr = stderr;
        }

        Ok(stage)
    }
}

/// Builds an exec plan from one command line. An empty line yields an empty
/// plan.
pub fn parse_command(cmd: &str) -> Result<ExecPlan, CommandParseError> {
    let mut lexer = Token::lexer(cmd);
    let mut tokens = Vec::new();
    let mut errors = Vec::new();

    while let Some(token) = lexer.next() {
        match token {
            Ok(token) => tokens.push((token, lexer.span())),
            Err(err) => errors.push(err),
        }
    }

    if !errors.is_empty() {
        return Err(CommandParseError::Lexer(errors));
    }

    let mut stages = Vec::new();
    let mut current = PendingStage::default();
    let mut piped = false;

    for (token, span) in tokens {
        let link = match token {
            Token::Comment(_) | Token::Unterminated => continue,
            Token::Word(word) => {
                current.push_word(word.to_owned(), span);
                continue;
            }
            Token::DoubleQuotedString(word) | Token::SingleQuotedString(word) => {
                current.push_word(word, span);
                continue;
            }
            Token::Read => {
                current.redirect(Redirect::Input, &span)?;
                continue;
            }
            Token::Write => {
                current.redirect(Redirect::Overwrite, &span)?;
                continue;
            }
            Token::Append => {
                current.redirect(Redirect::Append, &span)?;
                continue;
            }
            Token::ErrWrite => {
                current.redirect(Redirect::ErrOverwrite, &span)?;
                continue;
            }
            Token::ErrAppend => {
                current.redirect(Redirect::ErrAppend, &span)?;
                continue;
            }
            Token::ErrToOut => {
                current.extend_span(&span);
                current.stderr = Some(OutputTarget::SameAsOther);
                continue;
            }
            Token::Pipe => ("|", NextProgram::Concurrent),
            Token::And => ("&&", NextProgram::OnSuccess),
            Token::Or => ("||", NextProgram::OnFailure),
            Token::Semi => (";", NextProgram::Unconditional),
            Token::Background => ("&", NextProgram::Concurrent),
        };

        let (operator, next) = link;
        let mut stage = std::mem::take(&mut current).finish(cmd, operator)?;
        stage.next = next;

        if piped && stage.stdin == InputSource::Inherit {
            stage.stdin = InputSource::PipeFromPrevious;
        }
        piped = operator == "|";

        match operator {
            "|" => {
                if stage.stdout == OutputTarget::Inherit {
                    stage.stdout = OutputTarget::PipeToNext;
                }
                stage.wait_for_completion = false;
            }
            "&" => {
                stage.wait_for_completion = false;
                stage.terminate_gracefully = true;
            }
            _ => {}
        }

        stages.push(stage);
    }

    let trailing = current.argv.is_empty() && current.redirect.is_none();
    if trailing {
        if piped {
            return Err(CommandParseError::MissingCommand("end of line"));
        }
        if let Some(last) = stages.last() {
            if matches!(last.next, NextProgram::OnSuccess | NextProgram::OnFailure) {
                return Err(CommandParseError::MissingCommand("end of line"));
            }
        }
    } else {
        let mut stage = current.finish(cmd, "end of line")?;
        if piped && stage.stdin == InputSource::Inherit {
            stage.stdin = InputSource::PipeFromPrevious;
        }
        stages.push(stage);
    }

    Ok(ExecPlan::new(cmd.trim(), stages))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_line_is_empty_plan() {
        assert!(parse_command("   ").unwrap().is_empty());
        assert!(parse_command("# only a comment").unwrap().is_empty());
    }

    #[test]
    fn pipeline_links_stages() {
        let plan = parse_command("cat file | sort -r | uniq").unwrap();
        let stages = plan.stages();
        assert_eq!(plan.len(), 3);

        assert_eq!(stages[0].argv, ["cat", "file"]);
        assert_eq!(stages[0].stdout, OutputTarget::PipeToNext);
        assert_eq!(stages[0].next, NextProgram::Concurrent);
        assert!(!stages[0].wait_for_completion);

        assert_eq!(stages[1].stdin, InputSource::PipeFromPrevious);
        assert_eq!(stages[1].stdout, OutputTarget::PipeToNext);

        assert_eq!(stages[2].stdin, InputSource::PipeFromPrevious);
        assert_eq!(stages[2].stdout, OutputTarget::Inherit);
        assert!(stages[2].wait_for_completion);
        assert!(plan.wait_for_completion);
    }

    #[test]
    fn conditional_and_background_rules() {
        let plan = parse_command("make && ./run || echo failed; sleep 10 &").unwrap();
        let rules = plan.rules();
        assert_eq!(rules[..3], [
            NextProgram::OnSuccess,
            NextProgram::OnFailure,
            NextProgram::Unconditional,
        ]);

        let background = &plan.stages()[3];
        assert_eq!(background.next, NextProgram::Concurrent);
        assert!(!background.wait_for_completion);
        assert!(background.terminate_gracefully);
        assert!(!plan.wait_for_completion);
    }

    #[test]
    fn redirections() {
        let plan = parse_command("sort < in.txt > out.txt 2>> err.log").unwrap();
        let stage = &plan.stages()[0];
        assert_eq!(stage.argv, ["sort"]);
        assert_eq!(stage.stdin, InputSource::File("in.txt".into()));
        assert_eq!(stage.stdout, OutputTarget::Overwrite("out.txt".into()));
        assert_eq!(stage.stderr, OutputTarget::Append("err.log".into()));

        let plan = parse_command("build >> log 2>&1").unwrap();
        assert_eq!(plan.stages()[0].stdout, OutputTarget::Append("log".into()));
        assert_eq!(plan.stages()[0].stderr, OutputTarget::SameAsOther);

        let plan = parse_command("noisy > /dev/null 2> /dev/null < /dev/null").unwrap();
        let stage = &plan.stages()[0];
        assert_eq!(stage.stdin, InputSource::Null);
        assert_eq!(stage.stdout, OutputTarget::Null);
        assert_eq!(stage.stderr, OutputTarget::Null);
    }

    #[test]
    fn adjacent_words_join() {
        let plan = parse_command(r#"echo pre"fix"'ed' "two words""#).unwrap();
        assert_eq!(plan.stages()[0].argv, ["echo", "prefixed", "two words"]);
    }

    #[test]
    fn stage_text_is_source_slice() {
        let plan = parse_command("echo  'a  b' > out ; pwd").unwrap();
        assert_eq!(plan.stages()[0].text, "echo  'a  b' > out");
        assert_eq!(plan.stages()[1].text, "pwd");
        assert_eq!(plan.text, "echo  'a  b' > out ; pwd");
    }

    #[test]
    fn dangling_operators_are_errors() {
        assert!(matches!(
            parse_command("| grep x"),
            Err(CommandParseError::MissingCommand("|"))
        ));
        assert!(matches!(
            parse_command("ls |"),
            Err(CommandParseError::MissingCommand(_))
        ));
        assert!(matches!(
            parse_command("true &&"),
            Err(CommandParseError::MissingCommand(_))
        ));
        assert!(matches!(
            parse_command("echo >"),
            Err(CommandParseError::MissingTarget(">"))
        ));
        assert!(matches!(
            parse_command(r#"echo "open"#),
            Err(CommandParseError::Lexer(_))
        ));
    }
}
