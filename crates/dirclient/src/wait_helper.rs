//! Generic helper for the wait-with-notification pattern
//!
//! Responses for asynchronous strategies are posted into a shared table by
//! a background reader which then wakes every waiter. A waiter re-checks
//! its own slot on each wakeup, so a wakeup meant for another message id
//! simply sends it back to sleep.

use std::time::Duration;
use tokio::sync::Notify;

/// Wait until `check_fn` yields a value
///
/// 1. Register interest in the next notification
/// 2. Check the condition (fast path, and no lost wakeups in between)
/// 3. Sleep until notified or until `timeout` elapses
/// 4. Repeat from 1
///
/// `timeout` bounds the whole wait; `None` waits forever. On expiry the
/// condition is checked one last time before `timeout_error` is returned.
pub async fn wait_for_condition<T, E, CheckFn>(
    mut check_fn: CheckFn,
    notify: &Notify,
    timeout: Option<Duration>,
    timeout_error: E,
) -> Result<T, E>
where
    CheckFn: FnMut() -> Option<T>,
{
    let deadline = timeout.map(|t| tokio::time::Instant::now() + t);

    loop {
        let notified = notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if let Some(value) = check_fn() {
            return Ok(value);
        }

        match deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = &mut notified => {}
                    _ = tokio::time::sleep_until(deadline) => {
                        return check_fn().ok_or(timeout_error);
                    }
                }
            }
            None => notified.await,
        }
    }
}
