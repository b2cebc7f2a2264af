use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicI32, Ordering},
        Arc, Mutex, PoisonError,
    },
};

use crate::{
    cancel::Cancellation,
    config::Config,
    console::{Console, NoConsole},
    env::{AliasSource, AliasTable, NoSystemAliases},
    error::{ExecError, ExecResult},
    process::{jobs::JobTable, status::EXIT_SUCCESS},
};

/// Names the shell's own executable for nested instances.
pub const SUBSHELL_ENV: &str = "SHEXSPEC";

/// Everything the engine shares across the plans it runs. Cheap to clone.
#[derive(Clone)]
pub struct Shell {
    inner: Arc<ShellInner>,
}

struct ShellInner {
    config: Config,
    cancel: Cancellation,
    aliases: AliasTable,
    system_aliases: Arc<dyn AliasSource>,
    console: Arc<dyn Console>,
    jobs: JobTable,
    error_level: AtomicI32,
    synchronous_task: AtomicBool,
    subshell: AtomicBool,
    exit_request: Mutex<Option<i32>>,
}

impl Default for Shell {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl Shell {
    pub fn new(config: Config) -> Self {
        Self::with_parts(config, Arc::new(NoConsole), Arc::new(NoSystemAliases))
    }

    pub fn with_parts(
        config: Config,
        console: Arc<dyn Console>,
        system_aliases: Arc<dyn AliasSource>,
    ) -> Self {
        Self {
            inner: Arc::new(ShellInner {
                config,
                cancel: Cancellation::new(),
                aliases: AliasTable::default(),
                system_aliases,
                console,
                jobs: JobTable::default(),
                error_level: AtomicI32::new(EXIT_SUCCESS),
                synchronous_task: AtomicBool::new(false),
                subshell: AtomicBool::new(false),
                exit_request: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn cancel(&self) -> &Cancellation {
        &self.inner.cancel
    }

    pub fn aliases(&self) -> &AliasTable {
        &self.inner.aliases
    }

    pub fn system_aliases(&self) -> Arc<dyn AliasSource> {
        self.inner.system_aliases.clone()
    }

    pub fn console(&self) -> &dyn Console {
        self.inner.console.as_ref()
    }

    pub fn jobs(&self) -> &JobTable {
        &self.inner.jobs
    }

    pub fn error_level(&self) -> i32 {
        self.inner.error_level.load(Ordering::SeqCst)
    }

    pub fn set_error_level(&self, level: i32) {
        self.inner.error_level.store(level, Ordering::SeqCst);
    }

    pub fn synchronous_task_active(&self) -> bool {
        self.inner.synchronous_task.load(Ordering::SeqCst)
    }

    /// Marks a task the user cannot detach from. Returns the previous state.
    pub fn set_synchronous_task(&self, active: bool) -> bool {
        self.inner.synchronous_task.swap(active, Ordering::SeqCst)
    }

    /// Marks this instance as the subshell another shell delegated to.
    /// Plans are then always run here rather than handed on again.
    pub fn mark_as_subshell(&self) {
        self.inner.subshell.store(true, Ordering::SeqCst);
    }

    pub fn is_subshell(&self) -> bool {
        self.inner.subshell.load(Ordering::SeqCst)
    }

    pub fn request_exit(&self, code: i32) {
        *self
            .inner
            .exit_request
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(code);
    }

    pub fn exit_requested(&self) -> Option<i32> {
        *self
            .inner
            .exit_request
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// The executable nested instances of the shell are started from.
    pub fn subshell_program(&self) -> ExecResult<PathBuf> {
        if let Some(program) = &self.config().subshell.program {
            return Ok(program.clone());
        }

        std::env::var_os(SUBSHELL_ENV)
            .filter(|program| !program.is_empty())
            .map(PathBuf::from)
            .ok_or(ExecError::NoSubshell)
    }

    /// Runs a script one line at a time. Blank lines and `#` comments are
    /// skipped.
    pub async fn run_script(&self, path: &Path) -> ExecResult<i32> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ExecError::Script {
                path: path.to_owned(),
                source,
            })?;

        for line in text.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            self.execute_expression(line).await;

            if self.exit_requested().is_some() || self.cancel().is_set() {
                break;
            }
        }

        Ok(self.exit_requested().unwrap_or_else(|| self.error_level()))
    }
}
