//! SIGALRM-based interruption for blocking FIFO syscalls.
//!
//! Signal delivery for `alarm(2)` is only usable from the thread that owns
//! process-wide signal handling: the main thread. Everywhere else a
//! readiness-poll loop must be used instead, or deadline enforcement
//! silently disappears on background threads.

use std::time::Duration;

use crate::deadline::Deadline;

/// How a blocking channel operation enforces its deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitStrategy {
    /// Blocking syscall interrupted by SIGALRM. Main thread only.
    Alarm,
    /// Non-blocking syscalls in a sleep loop with poll granularity.
    Poll,
}

impl WaitStrategy {
    pub(crate) fn for_current_thread() -> Self {
        if is_main_thread() {
            WaitStrategy::Alarm
        } else {
            WaitStrategy::Poll
        }
    }
}

#[cfg(target_os = "linux")]
fn is_main_thread() -> bool {
    // The main thread's tid equals the pid.
    // SAFETY: gettid and getpid take no arguments and cannot fail.
    unsafe { libc::syscall(libc::SYS_gettid) == libc::c_long::from(libc::getpid()) }
}

#[cfg(target_os = "macos")]
fn is_main_thread() -> bool {
    // SAFETY: pthread_main_np takes no arguments and cannot fail.
    unsafe { libc::pthread_main_np() != 0 }
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn is_main_thread() -> bool {
    // No reliable detection; fall back to polling.
    false
}

extern "C" fn on_alarm(_signum: libc::c_int) {
    // Installed without SA_RESTART so the pending blocking syscall
    // returns EINTR. Nothing to do in the handler itself.
}

/// Arms `alarm(2)` with an empty SIGALRM handler for the scope of one
/// blocking syscall. Dropping the guard cancels the alarm and restores the
/// previous handler.
pub(crate) struct AlarmGuard {
    previous: libc::sigaction,
}

impl AlarmGuard {
    /// Arm an alarm for the deadline's remaining time.
    ///
    /// Returns `None` for unbounded deadlines: no alarm is needed and the
    /// syscall may block indefinitely. `alarm(2)` has whole-second
    /// granularity; sub-second remainders round up.
    pub(crate) fn arm(deadline: &Deadline) -> Option<Self> {
        let remaining = deadline.remaining()?;
        let secs = alarm_seconds(remaining);

        // SAFETY: `action` is fully initialized before use; `on_alarm` is
        // an async-signal-safe empty handler; `previous` is a valid out
        // pointer for the prior disposition.
        let previous = unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            let mut previous: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = on_alarm as usize;
            libc::sigemptyset(&mut action.sa_mask);
            action.sa_flags = 0; // deliberately no SA_RESTART
            libc::sigaction(libc::SIGALRM, &action, &mut previous);
            libc::alarm(secs);
            previous
        };

        Some(Self { previous })
    }
}

impl Drop for AlarmGuard {
    fn drop(&mut self) {
        // SAFETY: cancels the pending alarm and restores the handler
        // captured in `arm`; both pointers are valid for the call.
        unsafe {
            libc::alarm(0);
            libc::sigaction(libc::SIGALRM, &self.previous, std::ptr::null_mut());
        }
    }
}

fn alarm_seconds(remaining: Duration) -> libc::c_uint {
    let secs = remaining.as_secs();
    let secs = if remaining.subsec_nanos() > 0 { secs + 1 } else { secs };
    secs.clamp(1, libc::c_uint::MAX as u64) as libc::c_uint
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn background_threads_must_poll() {
        let strategy = std::thread::spawn(WaitStrategy::for_current_thread)
            .join()
            .expect("strategy probe thread should finish");
        assert_eq!(strategy, WaitStrategy::Poll);
    }

    #[test]
    fn alarm_seconds_rounds_up() {
        assert_eq!(alarm_seconds(Duration::from_millis(100)), 1);
        assert_eq!(alarm_seconds(Duration::from_secs(2)), 2);
        assert_eq!(alarm_seconds(Duration::from_millis(2500)), 3);
        assert_eq!(alarm_seconds(Duration::ZERO), 1);
    }
}
