pub use crate::error::{ExecError, ExecResult};
pub use crate::shell::Shell;
