use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    thread::JoinHandle,
};

use super::child::StageChild;

/// A stage the shell no longer waits for: started in the background, handed
/// off to a subshell, or detached from the foreground.
#[derive(Debug)]
struct Job {
    id: usize,
    text: String,
    child: Option<StageChild>,
    /// A harvester still servicing tracees the stage left behind.
    debugger: Option<JoinHandle<()>>,
}

impl Job {
    fn status(&mut self) -> Option<i32> {
        let exit = match self.child.as_mut() {
            Some(child) => child.try_status().map(|status| status.code())?,
            None => 0,
        };

        if self
            .debugger
            .as_ref()
            .map_or(false, |debugger| !debugger.is_finished())
        {
            return None;
        }

        if let Some(debugger) = self.debugger.take() {
            if debugger.join().is_err() {
                warn!(id = self.id, "harvester thread panicked");
            }
        }

        Some(exit)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSummary {
    pub id: usize,
    pub text: String,
    pub pid: Option<i32>,
    pub exit: Option<i32>,
}

#[derive(Debug, Default)]
struct JobTableInner {
    next_id: usize,
    jobs: Vec<Job>,
}

#[derive(Debug, Clone, Default)]
pub struct JobTable {
    inner: Arc<Mutex<JobTableInner>>,
}

impl JobTable {
    pub fn register(
        &self,
        text: impl Into<String>,
        child: Option<StageChild>,
        debugger: Option<JoinHandle<()>>,
    ) -> usize {
        let mut inner = self.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        let text = text.into();

        debug!(id, %text, pid = ?child.as_ref().and_then(StageChild::id), "job registered");
        inner.jobs.push(Job {
            id,
            text,
            child,
            debugger,
        });

        id
    }

    /// Every job, finished ones with their exit code. Finished jobs stay
    /// listed until reaped.
    pub fn list(&self) -> Vec<JobSummary> {
        self.lock()
            .jobs
            .iter_mut()
            .map(|job| JobSummary {
                id: job.id,
                pid: job.child.as_ref().and_then(StageChild::id),
                exit: job.status(),
                text: job.text.clone(),
            })
            .collect()
    }

    /// Removes and returns the jobs that have finished.
    pub fn reap(&self) -> Vec<JobSummary> {
        let mut inner = self.lock();
        let mut finished = Vec::new();

        inner.jobs.retain_mut(|job| match job.status() {
            Some(exit) => {
                finished.push(JobSummary {
                    id: job.id,
                    text: job.text.clone(),
                    pid: job.child.as_ref().and_then(StageChild::id),
                    exit: Some(exit),
                });
                false
            }
            None => true,
        });

        finished
    }

    pub fn len(&self) -> usize {
        self.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, JobTableInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::{process::Stdio, time::Duration};

    use tokio::process::Command;

    use super::*;

    fn spawn(script: &str) -> StageChild {
        Command::new("/bin/sh")
            .args(["-c", script])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .unwrap()
            .into()
    }

    #[tokio::test]
    async fn finished_jobs_are_reaped_once() {
        let jobs = JobTable::default();
        let quick = jobs.register("exit 4", Some(spawn("exit 4")), None);
        let slow = jobs.register("sleep 5", Some(spawn("sleep 5")), None);
        assert_eq!((quick, slow), (1, 2));

        let mut reaped = Vec::new();
        for _ in 0..200 {
            reaped = jobs.reap();
            if !reaped.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].id, quick);
        assert_eq!(reaped[0].exit, Some(4));
        assert!(jobs.reap().is_empty());

        let listed = jobs.list();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].text, "sleep 5");
        assert_eq!(listed[0].exit, None);
    }

    #[test]
    fn job_waits_for_its_harvester() {
        let jobs = JobTable::default();
        let (release, hold) = std::sync::mpsc::channel::<()>();
        let debugger = std::thread::spawn(move || {
            let _ = hold.recv();
        });

        jobs.register("harvested", None, Some(debugger));
        assert!(jobs.reap().is_empty());

        release.send(()).unwrap();
        let mut reaped = Vec::new();
        for _ in 0..200 {
            reaped = jobs.reap();
            if !reaped.is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(reaped.len(), 1);
        assert!(jobs.is_empty());
    }
}
