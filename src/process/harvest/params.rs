//! Reading what a stopped tracee leaves behind: its environment block and
//! its current directory.

use std::{
    io::IoSliceMut,
    path::{Path, PathBuf},
};

use nix::{
    errno::Errno,
    sys::uio::{process_vm_readv, RemoteIoVec},
    unistd::Pid,
};

use crate::{config::HarvestConfig, env::EnvBlock, error::HarvestError};

// 1-based field numbers in /proc/<pid>/stat
const ENV_START_FIELD: usize = 50;
const ENV_END_FIELD: usize = 51;
// fields after the command name start at 3
const FIRST_FIELD_AFTER_COMM: usize = 3;

const DELETED_SUFFIX: &str = " (deleted)";

#[derive(Debug, Default)]
pub struct ProcessParameters {
    pub environment: Option<EnvBlock>,
    pub current_directory: Option<PathBuf>,
}

impl ProcessParameters {
    /// Reads both parts independently; whatever cannot be read is absent.
    pub fn read(pid: Pid, config: &HarvestConfig) -> Self {
        let environment = read_environment(pid, config)
            .map_err(|err| debug!(%pid, %err, "environment not harvested"))
            .ok();
        let current_directory = current_directory(pid)
            .map_err(|err| debug!(%pid, %err, "directory not harvested"))
            .ok();

        Self {
            environment,
            current_directory,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.environment.is_none() && self.current_directory.is_none()
    }

    /// Makes these the shell's own environment and current directory.
    /// Returns whether anything was applied.
    pub fn apply(&self) -> bool {
        if let Some(environment) = &self.environment {
            trace!(vars = environment.len(), "applying harvested environment");
            environment.apply();
        }

        if let Some(directory) = &self.current_directory {
            if let Err(err) = std::env::set_current_dir(directory) {
                warn!(directory = %directory.display(), %err, "cannot enter harvested directory");
            }
        }

        !self.is_empty()
    }
}

pub fn read_environment(pid: Pid, config: &HarvestConfig) -> Result<EnvBlock, HarvestError> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat"))?;
    let (start, end) = environment_bounds(&stat)?;
    let mut block = probe(pid, start, config)?;

    block.truncate(end - start);
    block.push(0);

    decode_environment(block)
}

/// Extracts `env_start` and `env_end` from the text of `/proc/<pid>/stat`.
pub fn environment_bounds(stat: &str) -> Result<(usize, usize), HarvestError> {
    // the command name may contain spaces and parentheses
    let (_, fields) = stat
        .rsplit_once(')')
        .ok_or_else(|| HarvestError::Parameters("malformed stat line".into()))?;
    let fields = fields.split_whitespace().collect::<Vec<_>>();

    let field = |number: usize| -> Result<usize, HarvestError> {
        fields
            .get(number - FIRST_FIELD_AFTER_COMM)
            .and_then(|value| value.parse().ok())
            .ok_or_else(|| HarvestError::Parameters(format!("stat field {number} unavailable")))
    };

    let (start, end) = (field(ENV_START_FIELD)?, field(ENV_END_FIELD)?);
    if start == 0 || end <= start {
        return Err(HarvestError::Parameters(
            "environment bounds withheld".into(),
        ));
    }

    Ok((start, end))
}

/// The read sizes tried in order: the window minus the offset of `start`
/// into its page, then one page less each time down to one page, and last
/// the stretch from `start` to the end of its own page.
pub fn probe_sizes(start: usize, window: usize, page: usize) -> impl Iterator<Item = usize> {
    let first = window.saturating_sub(start % page);
    let remainder = page - start % page;

    std::iter::successors(Some(first), move |size| size.checked_sub(page))
        .take_while(move |&size| size >= page)
        .chain((remainder < page).then_some(remainder))
}

fn probe(pid: Pid, start: usize, config: &HarvestConfig) -> Result<Vec<u8>, HarvestError> {
    let mut block = vec![0u8; config.probe_window.max(config.page_size)];

    for size in probe_sizes(start, config.probe_window, config.page_size) {
        let remote = [RemoteIoVec {
            base: start,
            len: size,
        }];
        let mut local = [IoSliceMut::new(&mut block[..size])];

        match process_vm_readv(pid, &mut local, &remote) {
            Ok(read) if read == size => {
                block.truncate(size);
                return Ok(block);
            }
            Ok(read) => trace!(size, read, "partial environment read, shrinking"),
            Err(Errno::EFAULT) => trace!(size, "environment read faulted, shrinking"),
            Err(err) => return Err(HarvestError::MemoryRead(err)),
        }
    }

    Err(HarvestError::ProbeExhausted)
}

/// Validates a raw block, transcoding it from Latin-1 when it is not UTF-8.
pub fn decode_environment(block: Vec<u8>) -> Result<EnvBlock, HarvestError> {
    let text = match String::from_utf8(block) {
        Ok(text) => text,
        Err(err) => err.into_bytes().into_iter().map(char::from).collect(),
    };

    EnvBlock::parse(&text)
}

pub fn current_directory(pid: Pid) -> Result<PathBuf, HarvestError> {
    let link = std::fs::read_link(format!("/proc/{pid}/cwd"))?;
    Ok(strip_deleted(&link))
}

fn strip_deleted(path: &Path) -> PathBuf {
    match path.to_str().and_then(|path| path.strip_suffix(DELETED_SUFFIX)) {
        Some(stripped) => PathBuf::from(stripped),
        None => path.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stat_line(comm: &str, env_start: usize, env_end: usize) -> String {
        // fields 3..=49 are irrelevant here, 50 and 51 carry the bounds
        let filler = vec!["0"; ENV_START_FIELD - FIRST_FIELD_AFTER_COMM].join(" ");
        format!("1234 ({comm}) {filler} {env_start} {env_end} 0")
    }

    #[test]
    fn bounds_survive_odd_command_names() {
        let stat = stat_line("we ird) (name", 140_000, 140_500);
        assert_eq!(environment_bounds(&stat).unwrap(), (140_000, 140_500));
    }

    #[test]
    fn withheld_bounds_are_an_error() {
        let stat = stat_line("sh", 0, 0);
        assert!(matches!(
            environment_bounds(&stat),
            Err(HarvestError::Parameters(_))
        ));
        assert!(environment_bounds("1234 (sh) S 1").is_err());
    }

    #[test]
    fn reads_shrink_by_pages_then_end_at_the_page_boundary() {
        let sizes = probe_sizes(0x1100, 16384, 4096).collect::<Vec<_>>();
        assert_eq!(sizes, vec![16128, 12032, 7936, 3840]);

        let last = probe_sizes(0x100, 65536, 4096).last();
        assert_eq!(last, Some(3840));

        let aligned = probe_sizes(0x2000, 8192, 4096).collect::<Vec<_>>();
        assert_eq!(aligned, vec![8192, 4096]);

        let narrow = probe_sizes(0x1f00, 1024, 4096).collect::<Vec<_>>();
        assert_eq!(narrow, vec![256]);
    }

    #[test]
    fn latin1_block_is_transcoded() {
        let block = b"NAME=caf\xe9\0\0".to_vec();
        let env = decode_environment(block).unwrap();
        assert_eq!(env.get("NAME"), Some("café"));
    }

    #[test]
    fn tiny_block_is_absent() {
        assert!(matches!(
            decode_environment(vec![0, 0]),
            Err(HarvestError::EmptyEnvironment)
        ));
    }

    #[test]
    fn deleted_directory_suffix_is_dropped() {
        assert_eq!(
            strip_deleted(Path::new("/tmp/gone (deleted)")),
            PathBuf::from("/tmp/gone")
        );
        assert_eq!(strip_deleted(Path::new("/tmp")), PathBuf::from("/tmp"));
    }

    #[test]
    fn reads_own_environment() {
        let pid = nix::unistd::getpid();
        let env = read_environment(pid, &HarvestConfig::default()).unwrap();
        assert!(!env.is_empty());
        assert_eq!(
            current_directory(pid).unwrap(),
            std::env::current_dir().unwrap()
        );
    }

    #[test]
    fn reads_a_small_environment_near_the_stack_top() {
        let mut child = std::process::Command::new("sleep")
            .arg("2")
            .env_clear()
            .env("A", "1")
            .spawn()
            .unwrap();
        let pid = Pid::from_raw(child.id() as i32);

        // the bounds only describe the new image once exec has finished
        let mut env = Err(HarvestError::ProbeExhausted);
        for _ in 0..100 {
            let comm = std::fs::read_to_string(format!("/proc/{pid}/comm")).unwrap_or_default();
            if comm.trim() == "sleep" {
                env = read_environment(pid, &HarvestConfig::default());
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }

        let _ = child.kill();
        let _ = child.wait();

        let env = env.unwrap();
        assert_eq!(env.get("A"), Some("1"));
        assert_eq!(env.len(), 1);
    }
}
