//! Console input as seen by the termination monitor.
//!
//! The foreground stage is the intended reader of the terminal, so the
//! monitor only counts what is queued. Bytes are taken off the terminal only
//! once the same amount has sat unread through every detach strike; keys
//! other than gestures are then discarded unless typeahead is kept.

use std::{
    io::{self, Write},
    os::fd::{AsRawFd, FromRawFd, OwnedFd},
    sync::{Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use nix::{
    fcntl::{fcntl, FcntlArg},
    unistd::read,
};
use tokio::io::unix::AsyncFd;

use crate::config::MonitorConfig;

const ESC: u8 = 0x1b;
const DETACH_CHORD: u8 = 0x02;

// OSC 9;4 taskbar progress: 3 = indeterminate, 0 = cleared
const INDICATOR_RUNNING: &str = "\x1b]9;4;3;0\x07";
const INDICATOR_CLEAR: &str = "\x1b]9;4;0;0\x07";

nix::ioctl_read_bad!(fionread, nix::libc::FIONREAD, nix::libc::c_int);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputEvent {
    Key {
        ctrl: bool,
        alt: bool,
        key: char,
        down: bool,
    },
    Focus {
        gained: bool,
    },
}

impl InputEvent {
    /// Ctrl+B, the gesture that sends a foreground stage to the background.
    pub fn is_detach_chord(&self) -> bool {
        matches!(
            self,
            Self::Key {
                ctrl: true,
                alt: false,
                key: 'b',
                down: true,
            }
        )
    }
}

#[async_trait]
pub trait Console: Send + Sync {
    /// Resolves when new input may be available.
    async fn readable(&self);

    fn has_pending(&self) -> bool;

    /// The input events currently queued, without consuming them.
    fn peek(&self) -> Vec<InputEvent>;

    fn show_task_indicator(&self) {}

    fn clear_task_indicator(&self) {}

    /// Forgets gestures the monitor has already acted on.
    fn discard_gestures(&self) {}

    /// Input the shell set aside while a stage ran, gestures removed.
    fn take_typeahead(&self) -> Vec<u8> {
        Vec::new()
    }
}

/// Counts consecutive looks that found the same, non-zero number of queued
/// bytes. Any change means somebody is reading or typing.
#[derive(Debug, Clone, Default)]
pub struct UnreadInput {
    strikes: u32,
    last: usize,
    passes: u32,
}

impl UnreadInput {
    pub fn new(strikes: u32) -> Self {
        Self {
            strikes,
            ..Default::default()
        }
    }

    /// Records one look; true once `pending` has stayed put for every strike.
    pub fn observe(&mut self, pending: usize) -> bool {
        if pending == 0 || pending != self.last {
            self.last = pending;
            self.passes = 0;
            return false;
        }

        self.passes += 1;
        if self.passes < self.strikes {
            return false;
        }

        self.last = 0;
        self.passes = 0;
        true
    }
}

/// No interactive console, e.g. when input is a file or a pipe.
#[derive(Debug, Default)]
pub struct NoConsole;

#[async_trait]
impl Console for NoConsole {
    async fn readable(&self) {
        std::future::pending::<()>().await
    }

    fn has_pending(&self) -> bool {
        false
    }

    fn peek(&self) -> Vec<InputEvent> {
        Vec::new()
    }
}

pub struct Terminal {
    input: AsyncFd<OwnedFd>,
    lookahead: Mutex<Vec<u8>>,
    unread: Mutex<UnreadInput>,
    keep_typeahead: bool,
    indicator: bool,
}

impl Terminal {
    /// Watches the terminal behind fd 0 as it is now. Later redirection of
    /// fd 0 does not affect it.
    pub fn new(config: &MonitorConfig) -> io::Result<Self> {
        let fd = fcntl(0, FcntlArg::F_DUPFD_CLOEXEC(3))?;
        let input = AsyncFd::new(unsafe { OwnedFd::from_raw_fd(fd) })?;

        Ok(Self {
            input,
            lookahead: Mutex::new(Vec::new()),
            unread: Mutex::new(UnreadInput::new(config.detach_strikes.max(1))),
            keep_typeahead: config.keep_typeahead,
            indicator: termion::is_tty(&io::stderr()),
        })
    }

    fn pending_bytes(&self) -> usize {
        let mut count: nix::libc::c_int = 0;
        match unsafe { fionread(self.input.as_raw_fd(), &mut count) } {
            Ok(_) => count.max(0) as usize,
            Err(err) => {
                trace!(%err, "FIONREAD failed");
                0
            }
        }
    }

    fn lookahead(&self) -> MutexGuard<'_, Vec<u8>> {
        self.lookahead
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write_indicator(&self, sequence: &str) {
        if !self.indicator {
            return;
        }

        let mut stderr = io::stderr().lock();
        if let Err(err) = stderr
            .write_all(sequence.as_bytes())
            .and_then(|_| stderr.flush())
        {
            debug!(%err, "failed to update task indicator");
        }
    }
}

#[async_trait]
impl Console for Terminal {
    async fn readable(&self) {
        match self.input.readable().await {
            Ok(mut guard) => guard.clear_ready(),
            Err(err) => {
                warn!(%err, "console input cannot be watched");
                std::future::pending::<()>().await
            }
        }
    }

    fn has_pending(&self) -> bool {
        self.pending_bytes() > 0 || !self.lookahead().is_empty()
    }

    fn peek(&self) -> Vec<InputEvent> {
        let pending = self.pending_bytes();
        let unread = self
            .unread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .observe(pending);
        let mut lookahead = self.lookahead();

        if unread {
            let start = lookahead.len();
            lookahead.resize(start + pending, 0);
            match read(self.input.as_raw_fd(), &mut lookahead[start..]) {
                Ok(len) => lookahead.truncate(start + len),
                Err(err) => {
                    lookahead.truncate(start);
                    trace!(%err, "console read failed");
                }
            }
        }

        decode_events(&lookahead)
    }

    fn show_task_indicator(&self) {
        self.write_indicator(INDICATOR_RUNNING);
    }

    fn clear_task_indicator(&self) {
        self.write_indicator(INDICATOR_CLEAR);
    }

    fn discard_gestures(&self) {
        let mut lookahead = self.lookahead();
        *lookahead = strip_gestures(&lookahead);
    }

    fn take_typeahead(&self) -> Vec<u8> {
        let typed = strip_gestures(&std::mem::take(&mut *self.lookahead()));
        if self.keep_typeahead || typed.is_empty() {
            return typed;
        }

        debug!(len = typed.len(), "discarding keys typed while a stage ran");
        Vec::new()
    }
}

/// Decodes raw terminal bytes into key and focus events.
pub fn decode_events(bytes: &[u8]) -> Vec<InputEvent> {
    let mut events = Vec::new();
    let mut index = 0;

    while index < bytes.len() {
        match bytes[index..] {
            [ESC, b'[', b'I', ..] => {
                events.push(InputEvent::Focus { gained: true });
                index += 3;
            }
            [ESC, b'[', b'O', ..] => {
                events.push(InputEvent::Focus { gained: false });
                index += 3;
            }
            [ESC, next, ..] if next.is_ascii_graphic() => {
                events.push(key(next as char, false, true));
                index += 2;
            }
            [byte @ 0x01..=0x1a, ..] if !matches!(byte, b'\t' | b'\n' | b'\r') => {
                events.push(key((byte + 0x60) as char, true, false));
                index += 1;
            }
            [byte, ..] => {
                events.push(key(byte as char, false, false));
                index += 1;
            }
            [] => break,
        }
    }

    events
}

fn key(key: char, ctrl: bool, alt: bool) -> InputEvent {
    InputEvent::Key {
        ctrl,
        alt,
        key,
        down: true,
    }
}

fn strip_gestures(bytes: &[u8]) -> Vec<u8> {
    let mut kept = Vec::with_capacity(bytes.len());
    let mut index = 0;

    while index < bytes.len() {
        match bytes[index..] {
            [ESC, b'[', b'I' | b'O', ..] => index += 3,
            [DETACH_CHORD, ..] => index += 1,
            [byte, ..] => {
                kept.push(byte);
                index += 1;
            }
            [] => break,
        }
    }

    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_detach_chord_and_focus() {
        let events = decode_events(b"a\x02\x1b[O\x1b[I");
        assert_eq!(events.len(), 4);
        assert!(!events[0].is_detach_chord());
        assert!(events[1].is_detach_chord());
        assert_eq!(events[2], InputEvent::Focus { gained: false });
        assert_eq!(events[3], InputEvent::Focus { gained: true });
    }

    #[test]
    fn alt_chord_is_not_detach() {
        let events = decode_events(b"\x1bb");
        assert_eq!(events, vec![key('b', false, true)]);
        assert!(!events[0].is_detach_chord());
    }

    #[test]
    fn typeahead_drops_gestures() {
        assert_eq!(strip_gestures(b"ls\x02\x1b[O -l\n"), b"ls -l\n");
    }

    #[test]
    fn input_is_taken_only_after_sitting_unread() {
        let mut unread = UnreadInput::new(3);
        assert!(!unread.observe(4));
        assert!(!unread.observe(4));
        assert!(!unread.observe(4));
        assert!(unread.observe(4));

        // a reader draining the queue resets the count
        assert!(!unread.observe(6));
        assert!(!unread.observe(6));
        assert!(!unread.observe(2));
        assert!(!unread.observe(2));
        assert!(!unread.observe(0));
        assert!(!unread.observe(0));
        assert!(!unread.observe(0));
        assert!(!unread.observe(0));
    }

    #[tokio::test]
    async fn no_console_is_never_ready() {
        let console = NoConsole;
        assert!(!console.has_pending());
        assert!(console.peek().is_empty());

        let ready =
            tokio::time::timeout(std::time::Duration::from_millis(10), console.readable()).await;
        assert!(ready.is_err());
    }
}
