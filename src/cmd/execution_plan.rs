use std::{os::fd::OwnedFd, path::PathBuf, sync::Arc, thread::JoinHandle};

use itertools::Itertools;

use crate::process::{buffer::OutputBuffer, child::StageChild, StageRuntime};

/// How the stage after this one is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NextProgram {
    #[default]
    Unconditional,
    Concurrent,
    OnSuccess,
    OnFailure,
    Never,
}

/// Picks the stage to run after `current` exited with `status`.
///
/// `rules[i]` describes how stage `i + 1` relates to stage `i`. When a
/// conditional rule does not hold, the whole run of stages chained to it by
/// the same rule (or by `Concurrent`) is skipped, including the stage that
/// ends the run.
pub fn next_stage(rules: &[NextProgram], current: usize, status: i32) -> Option<usize> {
    let count = rules.len();
    if current + 1 >= count {
        return None;
    }

    let skip_chain = |chained: NextProgram| {
        let mut index = current + 1;
        while index < count && matches!(rules[index], r if r == chained || r == NextProgram::Concurrent)
        {
            index += 1;
        }
        // `index` ends the chain; resume after it
        Some(index + 1).filter(|&next| next < count)
    };

    match rules[current] {
        NextProgram::Unconditional | NextProgram::Concurrent => Some(current + 1),
        NextProgram::OnSuccess if status == 0 => Some(current + 1),
        NextProgram::OnSuccess => skip_chain(NextProgram::OnSuccess),
        NextProgram::OnFailure if status != 0 => Some(current + 1),
        NextProgram::OnFailure => skip_chain(NextProgram::OnFailure),
        NextProgram::Never => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum InputSource {
    #[default]
    Inherit,
    File(PathBuf),
    Null,
    PipeFromPrevious,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum OutputTarget {
    #[default]
    Inherit,
    Overwrite(PathBuf),
    Append(PathBuf),
    Null,
    /// Only meaningful for stdout.
    PipeToNext,
    /// An engine owned in-memory buffer.
    Buffer,
    /// Alias this stream to the other output stream (`2>&1`).
    SameAsOther,
}

impl OutputTarget {
    pub fn is_buffer(&self) -> bool {
        matches!(self, Self::Buffer)
    }
}

/// One element of a pipeline.
#[derive(Debug)]
pub struct Stage {
    pub argv: Vec<String>,
    /// The stage as the user typed it, used when handing it to a subshell.
    pub text: String,
    pub stdin: InputSource,
    pub stdout: OutputTarget,
    pub stderr: OutputTarget,
    pub next: NextProgram,
    pub wait_for_completion: bool,
    pub terminate_gracefully: bool,
    pub runtime: Arc<StageRuntime>,

    pub(crate) child: Option<StageChild>,
    pub(crate) stdout_buffer: Option<OutputBuffer>,
    pub(crate) stderr_buffer: Option<OutputBuffer>,
    pub(crate) piped_input: Option<OwnedFd>,
    pub(crate) pending_drains: Vec<(OutputBuffer, OwnedFd)>,
    pub(crate) debugger: Option<JoinHandle<()>>,
}

impl Stage {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let argv = argv.into_iter().map(Into::into).collect::<Vec<String>>();
        let text = argv.iter().map(|arg| quote_arg(arg)).join(" ");

        Self {
            argv,
            text,
            stdin: InputSource::Inherit,
            stdout: OutputTarget::Inherit,
            stderr: OutputTarget::Inherit,
            next: NextProgram::Unconditional,
            wait_for_completion: true,
            terminate_gracefully: false,
            runtime: Arc::default(),
            child: None,
            stdout_buffer: None,
            stderr_buffer: None,
            piped_input: None,
            pending_drains: Vec::new(),
            debugger: None,
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn with_stdin(mut self, stdin: InputSource) -> Self {
        self.stdin = stdin;
        self
    }

    pub fn with_stdout(mut self, stdout: OutputTarget) -> Self {
        self.stdout = stdout;
        self
    }

    pub fn with_stderr(mut self, stderr: OutputTarget) -> Self {
        self.stderr = stderr;
        self
    }

    pub fn with_next(mut self, next: NextProgram) -> Self {
        self.next = next;
        self
    }

    pub fn with_wait(mut self, wait: bool) -> Self {
        self.wait_for_completion = wait;
        self
    }

    pub fn program(&self) -> &str {
        self.argv.first().map(String::as_str).unwrap_or_default()
    }

    pub fn stdout_buffer(&self) -> Option<&OutputBuffer> {
        self.stdout_buffer.as_ref()
    }

    pub fn stderr_buffer(&self) -> Option<&OutputBuffer> {
        self.stderr_buffer.as_ref()
    }

    pub fn process_id(&self) -> Option<i32> {
        self.runtime.process_id()
    }

    pub fn has_live_process(&mut self) -> bool {
        self.child.as_mut().map_or(false, |child| child.is_running())
    }
}

/// An ordered arena of stages with the rules linking them.
#[derive(Debug, Default)]
pub struct ExecPlan {
    pub text: String,
    pub wait_for_completion: bool,
    stages: Vec<Stage>,
}

impl ExecPlan {
    pub fn new(text: impl Into<String>, stages: Vec<Stage>) -> Self {
        let wait_for_completion = stages.last().map_or(true, |s| s.wait_for_completion);
        Self {
            text: text.into(),
            wait_for_completion,
            stages,
        }
    }

    pub fn single(stage: Stage) -> Self {
        let text = stage.text.clone();
        Self::new(text, vec![stage])
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn stages_mut(&mut self) -> &mut [Stage] {
        &mut self.stages
    }

    pub fn stage(&self, index: usize) -> Option<&Stage> {
        self.stages.get(index)
    }

    pub fn rules(&self) -> Vec<NextProgram> {
        self.stages.iter().map(|stage| stage.next).collect()
    }
}

pub(crate) fn quote_arg(arg: &str) -> String {
    if !arg.is_empty()
        && !arg
            .chars()
            .any(|c| c.is_whitespace() || "|&;<>'\"`$()\\".contains(c))
    {
        return arg.to_owned();
    }

    format!("'{}'", arg.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::{NextProgram::*, *};

    #[test]
    fn never_stops_after_first() {
        let rules = [Never, Never, Never];
        assert_eq!(next_stage(&rules, 0, 0), None);
        assert_eq!(next_stage(&rules, 0, 1), None);
    }

    #[test]
    fn unconditional_and_concurrent_advance() {
        let rules = [Unconditional, Concurrent, Unconditional];
        assert_eq!(next_stage(&rules, 0, 7), Some(1));
        assert_eq!(next_stage(&rules, 1, 7), Some(2));
        assert_eq!(next_stage(&rules, 2, 0), None);
    }

    #[test]
    fn on_success_skips_chain_after_failure() {
        // a && b && c ; d
        let rules = [OnSuccess, OnSuccess, Unconditional, Unconditional];
        assert_eq!(next_stage(&rules, 0, 0), Some(1));
        assert_eq!(next_stage(&rules, 0, 1), Some(3));
        assert_eq!(next_stage(&rules, 1, 1), Some(3));
    }

    #[test]
    fn on_success_skips_piped_successors() {
        // a && b | c ; d
        let rules = [OnSuccess, Concurrent, Unconditional, Unconditional];
        assert_eq!(next_stage(&rules, 0, 2), Some(3));
    }

    #[test]
    fn on_failure_is_symmetric() {
        // a || b || c ; d
        let rules = [OnFailure, OnFailure, Unconditional, Unconditional];
        assert_eq!(next_stage(&rules, 0, 1), Some(1));
        assert_eq!(next_stage(&rules, 0, 0), Some(3));
    }

    #[test]
    fn mixed_chain_resumes_at_alternative() {
        // a && b || c
        let rules = [OnSuccess, OnFailure, Unconditional];
        assert_eq!(next_stage(&rules, 0, 1), Some(2));
        assert_eq!(next_stage(&rules, 1, 0), None);
    }

    #[test]
    fn skipping_past_the_end_stops() {
        let rules = [OnSuccess, OnSuccess, OnSuccess];
        assert_eq!(next_stage(&rules, 0, 1), None);
    }

    #[test]
    fn plan_waits_like_its_last_stage() {
        let plan = ExecPlan::new(
            "a & b &",
            vec![Stage::new(["a"]).with_wait(false), Stage::new(["b"]).with_wait(false)],
        );
        assert!(!plan.wait_for_completion);
        assert_eq!(plan.len(), 2);
    }

    #[test]
    fn stage_text_quotes_arguments() {
        let stage = Stage::new(["echo", "two words", "it's"]);
        assert_eq!(stage.text, r"echo 'two words' 'it'\''s'");
    }
}
