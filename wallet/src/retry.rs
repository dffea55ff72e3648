// Bounded retry with an explicit attempt budget

use tracing::debug;

use crate::error::{ResourceError, WalletError};

/// Outcome of one failed attempt
#[derive(Debug)]
pub enum Attempt {
    /// Draw again with fresh randomness
    Retry(&'static str),
    /// Stop immediately
    Fatal(WalletError),
}

impl From<WalletError> for Attempt {
    fn from(e: WalletError) -> Self {
        Attempt::Fatal(e)
    }
}

/// Run `f` with attempt numbers `0..max_tries` until it succeeds or fails
/// fatally. Running out of attempts yields `ResourceError::RetriesExhausted`.
pub fn retry<T, F>(max_tries: usize, mut f: F) -> Result<T, WalletError>
where
    F: FnMut(usize) -> Result<T, Attempt>,
{
    for attempt in 0..max_tries {
        match f(attempt) {
            Ok(v) => return Ok(v),
            Err(Attempt::Retry(reason)) => {
                debug!(attempt, reason, "retrying");
            }
            Err(Attempt::Fatal(e)) => return Err(e),
        }
    }
    Err(ResourceError::RetriesExhausted(max_tries).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_succeeds_after_retries() {
        let mut calls = 0;
        let v = retry(5, |attempt| {
            calls += 1;
            if attempt < 3 {
                Err(Attempt::Retry("not yet"))
            } else {
                Ok(attempt)
            }
        })
        .unwrap();
        assert_eq!(v, 3);
        assert_eq!(calls, 4);
    }

    #[test]
    fn test_exhausted() {
        let r: Result<(), _> = retry(3, |_| Err(Attempt::Retry("never")));
        assert!(matches!(
            r,
            Err(WalletError::ResourceExhausted(ResourceError::RetriesExhausted(3)))
        ));
    }

    #[test]
    fn test_fatal_stops_early() {
        let mut calls = 0;
        let r: Result<(), _> = retry(10, |_| {
            calls += 1;
            Err(Attempt::Fatal(WalletError::Locked))
        });
        assert!(matches!(r, Err(WalletError::Locked)));
        assert_eq!(calls, 1);
    }
}
