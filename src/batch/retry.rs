use std::{future::Future, io, time::Duration};

use backoff::{backoff::Backoff, ExponentialBackoff};

/// Whether a failed operation is worth another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Transient,
    Fatal,
}

/// Wait between two attempts.
#[derive(Debug, Clone)]
pub enum Delay {
    /// `base * attempt`; used for intra-transaction retries such as deadlocks.
    Linear(Duration),
    /// Constant wait; used when an external service is unreachable.
    Fixed(Duration),
    /// Randomized exponential backoff capped at `max`.
    Exponential { initial: Duration, max: Duration },
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError {
    #[error("{0:#}")]
    Fatal(anyhow::Error),

    #[error("gave up after {attempts} attempts: {last_error:#}")]
    Exhausted { attempts: u32, last_error: anyhow::Error },
}

impl RetryError {
    pub fn into_inner(self) -> anyhow::Error {
        match self {
            RetryError::Fatal(err) => err,
            RetryError::Exhausted { last_error, .. } => last_error,
        }
    }
}

/// Successful result plus how many extra attempts it took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retried<T> {
    pub value: T,
    pub retries: u32,
}

/// Bounded retry of transient faults. `max_attempts` counts every invocation,
/// the first one included.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Delay,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Delay) -> Self {
        Self { max_attempts: max_attempts.max(1), delay }
    }

    /// Deadlocks and serialization failures inside a transaction.
    pub fn deadlock() -> Self {
        Self::new(3, Delay::Linear(Duration::from_millis(100)))
    }

    /// Chain or database unreachable. Exhausting it should stop the process.
    pub fn connectivity() -> Self {
        Self::new(10, Delay::Fixed(Duration::from_secs(5)))
    }

    pub fn none() -> Self {
        Self::new(1, Delay::Fixed(Duration::ZERO))
    }

    fn backoff(&self) -> Option<ExponentialBackoff> {
        match self.delay {
            Delay::Exponential { initial, max } => Some(ExponentialBackoff {
                initial_interval: initial,
                max_interval: max,
                max_elapsed_time: None,
                ..ExponentialBackoff::default()
            }),
            _ => None,
        }
    }

    fn delay_for(&self, attempt: u32, backoff: &mut Option<ExponentialBackoff>) -> Duration {
        match (&self.delay, backoff) {
            (Delay::Linear(base), _) => *base * attempt,
            (Delay::Fixed(delay), _) => *delay,
            (Delay::Exponential { max, .. }, Some(backoff)) => {
                backoff.next_backoff().unwrap_or(*max)
            }
            (Delay::Exponential { max, .. }, None) => *max,
        }
    }

    /// Run `operation` until it succeeds, fails fatally, or attempts run out.
    /// The last error is always returned on exhaustion.
    pub async fn run<T, F, Fut, C>(&self, classify: C, mut operation: F) -> Result<Retried<T>, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
        C: Fn(&anyhow::Error) -> FaultKind,
    {
        let mut backoff = self.backoff();
        let mut attempt = 0;

        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => return Ok(Retried { value, retries: attempt - 1 }),
                Err(err) => {
                    if classify(&err) == FaultKind::Fatal {
                        return Err(RetryError::Fatal(err));
                    }
                    if attempt >= self.max_attempts {
                        return Err(RetryError::Exhausted { attempts: attempt, last_error: err });
                    }

                    let delay = self.delay_for(attempt, &mut backoff);
                    tracing::warn!(
                        error = %format!("{err:#}"),
                        attempt,
                        max_attempts = self.max_attempts,
                        "Transient failure, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Transient if the failure is a deadlock, serialization conflict, or lost connection.
pub fn classify_fault(err: &anyhow::Error) -> FaultKind {
    if is_transaction_conflict(err) || is_connectivity_error(err) {
        FaultKind::Transient
    } else {
        FaultKind::Fatal
    }
}

/// Transient only if the failure is a lost or refused connection, or a timeout.
pub fn classify_connectivity(err: &anyhow::Error) -> FaultKind {
    if is_connectivity_error(err) {
        FaultKind::Transient
    } else {
        FaultKind::Fatal
    }
}

/// Transient only for deadlocks and serialization conflicts.
pub fn classify_transaction(err: &anyhow::Error) -> FaultKind {
    if is_transaction_conflict(err) {
        FaultKind::Transient
    } else {
        FaultKind::Fatal
    }
}

pub fn is_transaction_conflict(err: &anyhow::Error) -> bool {
    use diesel::result::{DatabaseErrorKind, Error as DieselError};

    err.chain().any(|cause| {
        if let Some(DieselError::DatabaseError(kind, info)) = cause.downcast_ref::<DieselError>() {
            return matches!(kind, DatabaseErrorKind::SerializationFailure)
                || info.message().contains("deadlock detected");
        }
        cause.to_string().contains("deadlock detected")
    })
}

pub fn is_connectivity_error(err: &anyhow::Error) -> bool {
    use diesel::result::{DatabaseErrorKind, Error as DieselError};

    err.chain().any(|cause| {
        if let Some(err) = cause.downcast_ref::<reqwest::Error>() {
            return err.is_connect() || err.is_timeout();
        }
        if let Some(err) = cause.downcast_ref::<io::Error>() {
            return matches!(
                err.kind(),
                io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::TimedOut
            );
        }
        if cause.downcast_ref::<tokio::time::error::Elapsed>().is_some() {
            return true;
        }
        if let Some(DieselError::DatabaseError(DatabaseErrorKind::ClosedConnection, _)) =
            cause.downcast_ref::<DieselError>()
        {
            return true;
        }
        // Pool and driver errors only expose their cause as text.
        let message = cause.to_string().to_ascii_lowercase();
        message.contains("connection refused")
            || message.contains("connection reset")
            || message.contains("connection closed")
            || message.contains("timed out")
    })
}
