use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use tokio::{
    signal::unix::{signal, SignalKind},
    sync::watch,
};

/// The engine's cancellation signal.
///
/// Level-triggered: once set it stays set until [`Cancellation::reset`], so
/// the driver can check it before every stage and the monitor can wait on it
/// during every wait. Ctrl+C only raises it while routing is enabled; the rest
/// of the time the interactive loop owns Ctrl+C.
#[derive(Clone)]
pub struct Cancellation {
    inner: Arc<CancelInner>,
}

struct CancelInner {
    signaled: watch::Sender<bool>,
    routed: AtomicBool,
}

impl Default for Cancellation {
    fn default() -> Self {
        let (signaled, _) = watch::channel(false);
        Self {
            inner: Arc::new(CancelInner {
                signaled,
                routed: AtomicBool::new(false),
            }),
        }
    }
}

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.inner.signaled.send_replace(true);
    }

    pub fn reset(&self) {
        self.inner.signaled.send_replace(false);
    }

    pub fn is_set(&self) -> bool {
        *self.inner.signaled.borrow()
    }

    /// Resolves once the event is signaled; immediately if it already is.
    pub async fn wait(&self) {
        let mut rx = self.inner.signaled.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                // the sender lives in `self`, so this cannot happen
                std::future::pending::<()>().await;
            }
        }
    }

    /// Route Ctrl+C into the event. Returns the previous routing state.
    pub fn enable(&self) -> bool {
        self.inner.routed.swap(true, Ordering::SeqCst)
    }

    /// Stop routing Ctrl+C into the event. Returns the previous routing state.
    pub fn ignore(&self) -> bool {
        self.inner.routed.swap(false, Ordering::SeqCst)
    }

    pub fn restore_routing(&self, routed: bool) {
        self.inner.routed.store(routed, Ordering::SeqCst);
    }

    pub fn is_routed(&self) -> bool {
        self.inner.routed.load(Ordering::SeqCst)
    }

    /// Installs the SIGINT listener feeding this event. The handler catches
    /// the signal, so children still start with the default disposition.
    pub fn listen_for_interrupts(&self) -> std::io::Result<()> {
        let mut interrupts = signal(SignalKind::interrupt())?;
        let cancel = self.clone();

        tokio::spawn(async move {
            while interrupts.recv().await.is_some() {
                if cancel.is_routed() {
                    debug!("interrupt routed to cancellation");
                    cancel.set();
                } else {
                    trace!("interrupt ignored at prompt");
                }
            }
        });

        Ok(())
    }
}
