use std::ops::Range;

use async_recursion::async_recursion;

use super::execution_plan::OutputTarget;
use crate::{parse::parse_command, prelude::*, process::status::EXIT_FAILURE};

/// Where an embedded command sits in an expression.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Substitution {
    /// The whole `` `…` `` or `$(…)`, delimiters included.
    outer: Range<usize>,
    inner: Range<usize>,
}

/// Finds the first complete substitution. `$(` nests, backticks do not.
fn find_substitution(expr: &str) -> Option<Substitution> {
    let bytes = expr.as_bytes();
    let mut index = 0;

    while index < bytes.len() {
        match bytes[index] {
            b'`' => {
                let close = expr[index + 1..].find('`')? + index + 1;
                return Some(Substitution {
                    outer: index..close + 1,
                    inner: index + 1..close,
                });
            }
            b'$' if bytes.get(index + 1) == Some(&b'(') => {
                let start = index + 2;
                let mut depth = 1;
                let mut cursor = start;

                while cursor < bytes.len() {
                    match bytes[cursor] {
                        b'$' if bytes.get(cursor + 1) == Some(&b'(') => {
                            depth += 1;
                            cursor += 1;
                        }
                        b')' => {
                            depth -= 1;
                            if depth == 0 {
                                return Some(Substitution {
                                    outer: index..cursor + 1,
                                    inner: start..cursor,
                                });
                            }
                        }
                        _ => {}
                    }
                    cursor += 1;
                }

                return None;
            }
            _ => index += 1,
        }
    }

    None
}

/// Turns captured output into a single line: trailing line breaks go, every
/// other `\r` or `\n` becomes a space.
fn flatten_output(output: &str) -> String {
    output
        .trim_end_matches(['\r', '\n'])
        .chars()
        .map(|c| if c == '\r' || c == '\n' { ' ' } else { c })
        .collect()
}

impl Shell {
    /// Replaces every embedded command in `expr` with its flattened output.
    /// The expression is rescanned from the start after each replacement.
    ///
    /// An embedded command that cannot run is reported and ends the
    /// expansion; it and everything after it are left as written.
    #[async_recursion(?Send)]
    pub async fn expand_substitutions(&self, expr: &str) -> String {
        let mut expr = expr.to_owned();

        while let Some(found) = find_substitution(&expr) {
            let inner = expr[found.inner.clone()].to_owned();
            trace!(%inner, "expanding substitution");

            match self.execute_expression_and_capture(&inner).await {
                Ok(output) => expr.replace_range(found.outer, &output),
                Err(err) => {
                    warn!(%err, %inner, "substitution failed, expansion stopped");
                    eprintln!("shex: {err}");
                    break;
                }
            }

            if self.cancel().is_set() {
                break;
            }
        }

        expr
    }

    /// Runs `expr` to completion with its output sent to a buffer and
    /// returns that output flattened.
    pub async fn execute_expression_and_capture(&self, expr: &str) -> ExecResult<String> {
        let previous = self.set_synchronous_task(true);
        let output = self.capture(expr).await;
        self.set_synchronous_task(previous);
        output
    }

    async fn capture(&self, expr: &str) -> ExecResult<String> {
        let expr = self.expand_substitutions(expr).await;
        let mut plan = parse_command(&expr)?;

        for stage in plan.stages_mut() {
            if stage.stdout == OutputTarget::Inherit {
                stage.stdout = OutputTarget::Buffer;
            }
            if stage.stdout.is_buffer() {
                stage.wait_for_completion = true;
            }
        }
        plan.wait_for_completion = true;

        let output = plan
            .execute(self, true)
            .await
            .map(|buffer| buffer.to_string_lossy())
            .unwrap_or_default();

        Ok(flatten_output(&output))
    }

    /// Expands, plans and runs one line. Returns the resulting error level.
    pub async fn execute_expression(&self, expr: &str) -> i32 {
        let expanded = self.expand_substitutions(expr).await;

        let mut plan = match parse_command(&expanded) {
            Ok(plan) => plan,
            Err(err) => {
                error!(%err, %expr, "failed to prepare expression");
                eprintln!("shex: {err}");
                self.set_error_level(EXIT_FAILURE);
                return EXIT_FAILURE;
            }
        };

        if plan.is_empty() {
            return self.error_level();
        }

        debug!(plan = %plan.text, stages = plan.len(), "executing");
        plan.execute(self, false).await;
        self.error_level()
    }
}
