use std::{os::unix::process::ExitStatusExt, process::ExitStatus};

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;

/// Unix convention for a process killed by a signal.
const SIGNAL_BASE: i32 = 128;

#[derive(Debug, Clone, Copy)]
pub enum StageExitStatus {
    Process(ExitStatus),
    Builtin(BuiltinExitStatus),
    /// Reported by the debug pump, which reaps harvested stages itself.
    Traced(i32),
}

impl From<ExitStatus> for StageExitStatus {
    fn from(value: ExitStatus) -> Self {
        Self::Process(value)
    }
}

impl From<BuiltinExitStatus> for StageExitStatus {
    fn from(value: BuiltinExitStatus) -> Self {
        Self::Builtin(value)
    }
}

impl StageExitStatus {
    pub fn code(&self) -> i32 {
        match self {
            Self::Process(status) => status
                .code()
                .or_else(|| status.signal().map(|sig| SIGNAL_BASE + sig))
                .unwrap_or(EXIT_FAILURE),
            Self::Builtin(status) => status.code(),
            Self::Traced(code) => *code,
        }
    }

    pub fn success(&self) -> bool {
        self.code() == EXIT_SUCCESS
    }
}

pub fn signaled_code(signal: i32) -> i32 {
    SIGNAL_BASE + signal
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuiltinExitStatus(i32);

impl BuiltinExitStatus {
    pub fn new_success() -> Self {
        Self(EXIT_SUCCESS)
    }

    pub fn new_failure() -> Self {
        Self(EXIT_FAILURE)
    }

    pub fn from_code(code: i32) -> Self {
        Self(code)
    }

    pub fn success(&self) -> bool {
        self.0 == EXIT_SUCCESS
    }

    pub fn failure(&self) -> bool {
        !self.success()
    }

    pub fn code(&self) -> i32 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_deaths_map_above_128() {
        // raw wait status for "killed by SIGKILL"
        let status = StageExitStatus::from(ExitStatus::from_raw(9));
        assert_eq!(status.code(), 137);
        assert!(!status.success());

        let status = StageExitStatus::from(ExitStatus::from_raw(3 << 8));
        assert_eq!(status.code(), 3);
    }

    #[test]
    fn builtin_codes_pass_through() {
        assert!(StageExitStatus::from(BuiltinExitStatus::new_success()).success());
        assert_eq!(StageExitStatus::from(BuiltinExitStatus::from_code(4)).code(), 4);
        assert!(BuiltinExitStatus::new_failure().failure());
        assert_eq!(StageExitStatus::Traced(2).code(), 2);
    }
}
