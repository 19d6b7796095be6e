use nix::errno::Errno;
use nix::libc;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::sync::{Arc, OnceLock};
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Signals that are never relayed.
///
/// `SIGCHLD` stays with the runtime, which reaps the child. `SIGKILL` and `SIGSTOP` cannot be
/// caught, and tokio refuses handlers for `SIGILL`, `SIGFPE` and `SIGSEGV`.
pub const NOT_FORWARDED: &[Signal] = &[
    Signal::SIGCHLD,
    Signal::SIGKILL,
    Signal::SIGSTOP,
    Signal::SIGILL,
    Signal::SIGFPE,
    Signal::SIGSEGV,
];

/// Raw numbers of every signal relayed to the child: all named signals of the platform except
/// [`NOT_FORWARDED`], plus the real-time range where the platform has one.
pub fn forwarded_signals() -> Vec<i32> {
    let mut signals: Vec<i32> = Signal::iterator()
        .filter(|sig| !NOT_FORWARDED.contains(sig))
        .map(|sig| sig as i32)
        .collect();
    #[cfg(any(target_os = "linux", target_os = "android"))]
    signals.extend(libc::SIGRTMIN()..=libc::SIGRTMAX());
    signals
}

/// Pid of the supervised child, published once after spawn.
#[derive(Debug, Clone, Default)]
pub struct ChildSlot(Arc<OnceLock<Pid>>);

impl ChildSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes the pid. Returns `false` if a pid was already set.
    pub fn set(&self, pid: Pid) -> bool {
        self.0.set(pid).is_ok()
    }

    pub fn get(&self) -> Option<Pid> {
        self.0.get().copied()
    }
}

/// Relays received OS signals to the child process.
///
/// One listener task per signal in [`forwarded_signals`], all tracked by a [`TaskTracker`] and
/// stopped through a shared [`CancellationToken`]. Handlers are registered on construction, so
/// it must be created before the child is spawned.
pub struct SigForward {
    task_tracker: TaskTracker,
    cancellation_token: CancellationToken,
    child: ChildSlot,
}

impl SigForward {
    /// Registers the signal handlers and starts listening.
    ///
    /// Returns an error if signal registration fails.
    pub fn try_new() -> Result<Self, std::io::Error> {
        let child = ChildSlot::new();
        let cancellation_token = CancellationToken::new();
        let task_tracker = TaskTracker::new();
        for sig in forwarded_signals() {
            let mut stream = signal(SignalKind::from_raw(sig))?;
            let token = cancellation_token.clone();
            let child = child.clone();
            task_tracker.spawn(async move {
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        received = stream.recv() => match received {
                            Some(()) => relay(&child, sig),
                            None => break,
                        },
                    }
                }
            });
        }
        task_tracker.close();
        Ok(Self {
            task_tracker,
            cancellation_token,
            child,
        })
    }

    /// Slot the listeners read the child pid from.
    pub fn child(&self) -> &ChildSlot {
        &self.child
    }

    /// Stops every listener and waits for them to finish.
    pub async fn shutdown(&self) {
        self.cancellation_token.cancel();
        self.task_tracker.wait().await;
    }
}

fn relay(child: &ChildSlot, sig: i32) {
    let name = signal_name(sig);
    match child.get() {
        Some(pid) => match send(pid, sig) {
            Ok(()) => tracing::debug!(pid = pid.as_raw(), "Forwarded {}", name),
            Err(Errno::ESRCH) => tracing::debug!("Child already exited, dropped {}", name),
            Err(e) => tracing::warn!(pid = pid.as_raw(), "Failed to forward {}: {}", name, e),
        },
        None => {
            tracing::error!("Received {} before the child process started, exiting", name);
            std::process::exit(1);
        }
    }
}

/// Sends a raw signal number, including the real-time ones [`Signal`] has no variant for.
fn send(pid: Pid, sig: i32) -> Result<(), Errno> {
    match Signal::try_from(sig) {
        Ok(signal) => kill(pid, signal),
        // SAFETY: kill(2) takes plain integers and touches no memory of this process.
        Err(_) => Errno::result(unsafe { libc::kill(pid.as_raw(), sig) }).map(drop),
    }
}

fn signal_name(sig: i32) -> String {
    match Signal::try_from(sig) {
        Ok(signal) => signal.as_str().to_string(),
        Err(_) => format!("signal {sig}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_slot_is_set_once() {
        let slot = ChildSlot::new();
        let reader = slot.clone();
        assert_eq!(reader.get(), None);
        assert!(slot.set(Pid::from_raw(42)));
        assert!(!slot.set(Pid::from_raw(43)));
        assert_eq!(reader.get(), Some(Pid::from_raw(42)));
    }

    #[test]
    fn test_every_catchable_signal_is_forwarded() {
        let signals = forwarded_signals();
        for reserved in NOT_FORWARDED {
            assert!(!signals.contains(&(*reserved as i32)), "{reserved}");
        }
        for expected in [
            Signal::SIGTERM,
            Signal::SIGHUP,
            Signal::SIGUSR1,
            Signal::SIGBUS,
            Signal::SIGTRAP,
        ] {
            assert!(signals.contains(&(expected as i32)), "{expected}");
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_linux_extras_are_forwarded() {
        let signals = forwarded_signals();
        assert!(signals.contains(&(Signal::SIGPWR as i32)));
        assert!(signals.contains(&(Signal::SIGSTKFLT as i32)));
        for rt in libc::SIGRTMIN()..=libc::SIGRTMAX() {
            assert!(signals.contains(&rt), "real-time signal {rt}");
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_realtime_signal_reaches_a_process() {
        use std::os::unix::process::ExitStatusExt;

        let mut child = std::process::Command::new("sleep")
            .arg("5")
            .spawn()
            .unwrap();
        let sig = libc::SIGRTMIN() + 1;
        send(Pid::from_raw(child.id() as i32), sig).unwrap();
        let status = child.wait().unwrap();
        assert_eq!(status.signal(), Some(sig));
    }

    #[test]
    fn test_signal_names() {
        assert_eq!(signal_name(Signal::SIGTERM as i32), "SIGTERM");
        #[cfg(target_os = "linux")]
        assert_eq!(
            signal_name(libc::SIGRTMIN()),
            format!("signal {}", libc::SIGRTMIN())
        );
    }
}
