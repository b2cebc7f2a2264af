use std::time::Duration;

use nix::sys::signal::Signal;
use tokio::select;

use super::status::{BuiltinExitStatus, StageExitStatus};
use crate::{
    cmd::execution_plan::Stage, config::MonitorConfig, console::InputEvent, error::ExecResult,
    Shell,
};

#[derive(Debug)]
pub enum WaitOutcome {
    Completed(StageExitStatus),
    Cancelled,
    /// The user detached the stage; it keeps running unsupervised.
    Backgrounded,
}

/// What one look at the console input decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SnoopStep {
    /// How long to wait before looking again; `None` waits for new input.
    pub delay: Option<Duration>,
    pub detach: bool,
    pub show_indicator: bool,
}

/// Debounces the detach chord and focus loss over consecutive looks at the
/// console input. A gesture only counts once it has stayed unread through
/// every strike, i.e. the foreground stage is not consuming it.
#[derive(Debug, Clone)]
pub struct DetachSnoop {
    detach_strikes: u32,
    focus_strikes: u32,
    detach_count: u32,
    focus_count: u32,
    pending_input_delay: Duration,
    confirm_delay: Duration,
}

impl DetachSnoop {
    pub fn new(config: &MonitorConfig) -> Self {
        Self {
            detach_strikes: config.detach_strikes,
            focus_strikes: config.focus_strikes,
            detach_count: 0,
            focus_count: 0,
            pending_input_delay: config.pending_input_delay(),
            confirm_delay: config.confirm_delay(),
        }
    }

    pub fn observe(&mut self, events: &[InputEvent], pending: bool) -> SnoopStep {
        let mut step = SnoopStep::default();

        if events.iter().any(InputEvent::is_detach_chord) {
            if self.detach_count < self.detach_strikes {
                self.detach_count += 1;
                step.delay = Some(self.confirm_delay);
            } else {
                step.detach = true;
                return step;
            }
        } else {
            self.detach_count = 0;
        }

        let focus = events.iter().rev().find_map(|event| match event {
            InputEvent::Focus { gained } => Some(*gained),
            _ => None,
        });

        match focus {
            Some(false) if self.focus_count < self.focus_strikes => {
                self.focus_count += 1;
                step.delay.get_or_insert(self.confirm_delay);
            }
            Some(false) => step.show_indicator = true,
            Some(true) => self.focus_count = 0,
            None => {}
        }

        if step.delay.is_none() && (pending || !events.is_empty()) {
            step.delay = Some(self.pending_input_delay);
        }

        step
    }
}

/// Waits for a foreground stage while watching for cancellation and for the
/// detach gesture.
pub async fn wait_for_stage(stage: &mut Stage, shell: &Shell) -> ExecResult<WaitOutcome> {
    let graceful = stage.terminate_gracefully;
    let runtime = stage.runtime.clone();
    let Some(child) = stage.child.as_mut() else {
        return Ok(WaitOutcome::Completed(
            BuiltinExitStatus::new_success().into(),
        ));
    };

    let cancel = shell.cancel();
    let console = shell.console();
    let mut snoop = DetachSnoop::new(&shell.config().monitor);
    let mut delay: Option<Duration> = None;
    let routed = cancel.enable();

    let outcome = loop {
        let snoop_input =
            delay.is_none() && !cancel.is_set() && !shell.synchronous_task_active();
        let pause = delay.unwrap_or_default();

        select! {
            biased;

            _ = cancel.wait() => {
                let signal = if graceful { Signal::SIGTERM } else { Signal::SIGKILL };
                debug!(pid = ?child.id(), ?signal, "cancelling foreground stage");
                if let Err(err) = child.signal(signal) {
                    trace!(%err, "stage already gone");
                }
                break WaitOutcome::Cancelled;
            }
            status = child.wait() => break WaitOutcome::Completed(status?),
            _ = console.readable(), if snoop_input => {}
            _ = tokio::time::sleep(pause), if delay.is_some() => {}
        }

        let step = snoop.observe(&console.peek(), console.has_pending());

        if step.detach {
            debug!(pid = ?child.id(), "stage detached to the background");
            runtime.set_capture_environment_on_exit(false);
            console.discard_gestures();
            console.clear_task_indicator();
            break WaitOutcome::Backgrounded;
        }

        if step.show_indicator
            && !runtime.suppress_task_completion()
            && !runtime.display_task_completion()
        {
            console.show_task_indicator();
        }

        delay = step.delay;
    };

    cancel.restore_routing(routed);

    if let WaitOutcome::Completed(_) = outcome {
        if runtime.task_completion_displayed() {
            console.clear_task_indicator();
        }

        for buffer in [&stage.stdout_buffer, &stage.stderr_buffer]
            .into_iter()
            .flatten()
        {
            buffer.wait_for_finalize().await;
        }
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(strikes: u32) -> MonitorConfig {
        MonitorConfig {
            detach_strikes: strikes,
            focus_strikes: strikes,
            ..Default::default()
        }
    }

    fn chord() -> InputEvent {
        InputEvent::Key {
            ctrl: true,
            alt: false,
            key: 'b',
            down: true,
        }
    }

    #[test]
    fn idle_console_waits_for_input() {
        let mut snoop = DetachSnoop::new(&config(3));
        assert_eq!(snoop.observe(&[], false), SnoopStep::default());
    }

    #[test]
    fn pending_input_polls_slowly() {
        let mut snoop = DetachSnoop::new(&config(3));
        let step = snoop.observe(&[], true);
        assert_eq!(step.delay, Some(Duration::from_millis(100)));
        assert!(!step.detach);
    }

    #[test]
    fn detach_needs_every_strike() {
        let mut snoop = DetachSnoop::new(&config(3));
        for _ in 0..3 {
            let step = snoop.observe(&[chord()], true);
            assert_eq!(step.delay, Some(Duration::from_millis(30)));
            assert!(!step.detach);
        }
        assert!(snoop.observe(&[chord()], true).detach);
    }

    #[test]
    fn consumed_chord_resets_the_count() {
        let mut snoop = DetachSnoop::new(&config(2));
        snoop.observe(&[chord()], true);
        snoop.observe(&[chord()], true);
        snoop.observe(&[], false);
        assert!(!snoop.observe(&[chord()], true).detach);
    }

    #[test]
    fn focus_loss_only_shows_indicator() {
        let mut snoop = DetachSnoop::new(&config(1));
        let lost = [InputEvent::Focus { gained: false }];

        let step = snoop.observe(&lost, true);
        assert!(!step.show_indicator);
        assert_eq!(step.delay, Some(Duration::from_millis(30)));

        let step = snoop.observe(&lost, true);
        assert!(step.show_indicator);
        assert!(!step.detach);

        let regained = [
            InputEvent::Focus { gained: false },
            InputEvent::Focus { gained: true },
        ];
        snoop.observe(&regained, true);
        assert!(!snoop.observe(&lost, true).show_indicator);
    }
}
