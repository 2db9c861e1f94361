//! First-success-wins combinator over an ordered list of strategies.
//!
//! Fallback policy lives in data: each step is a named async strategy, and
//! the chain is evaluated in order until one produces an accepted value.
//!
//! - `stop_when` marks errors that end the chain immediately (they are
//!   surfaced as [`FallbackError::Terminal`]).
//! - `accept_when` marks which `Ok` values count as success. A rejected
//!   value moves on to the next strategy; if no strategy is accepted, the
//!   last rejected value is returned with `accepted = false`.
//!
//! # Example
//!
//! ```rust,ignore
//! let resolved = FallbackChain::new()
//!     .then("similarity", || store.search(&embedding, &scope, 0.7, 5))
//!     .then("recent", || store.recent(&scope, 10))
//!     .accept_when(|rows: &Vec<_>| !rows.is_empty())
//!     .run()
//!     .await?;
//! ```

use std::future::Future;

use futures::future::BoxFuture;
use tracing::{debug, warn};

type Strategy<'a, T, E> = Box<dyn FnOnce() -> BoxFuture<'a, Result<T, E>> + Send + 'a>;
type Predicate<'a, V> = Box<dyn Fn(&V) -> bool + Send + Sync + 'a>;

/// Value produced by the first accepted strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved<T> {
    pub value: T,
    /// Name of the strategy that produced `value`.
    pub strategy: &'static str,
    /// Number of strategies that were run, including the winning one.
    pub attempts: usize,
    /// False when every strategy returned a rejected value.
    pub accepted: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum FallbackError<E> {
    #[error("strategy '{strategy}' failed terminally: {source}")]
    Terminal { strategy: &'static str, source: E },

    #[error("all {} strategies failed", .failures.len())]
    Exhausted { failures: Vec<(&'static str, E)> },

    #[error("no strategies configured")]
    Empty,
}

impl<E> FallbackError<E> {
    /// The error to report: the terminal one, or the last in the chain.
    pub fn into_last(self) -> Option<E> {
        match self {
            Self::Terminal { source, .. } => Some(source),
            Self::Exhausted { mut failures } => failures.pop().map(|(_, e)| e),
            Self::Empty => None,
        }
    }
}

/// Ordered strategies evaluated until the first accepted success.
pub struct FallbackChain<'a, T, E> {
    strategies: Vec<(&'static str, Strategy<'a, T, E>)>,
    accept: Option<Predicate<'a, T>>,
    stop: Option<Predicate<'a, E>>,
}

impl<'a, T, E> Default for FallbackChain<'a, T, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, T, E> FallbackChain<'a, T, E> {
    pub fn new() -> Self {
        Self {
            strategies: Vec::new(),
            accept: None,
            stop: None,
        }
    }

    /// Append a strategy.
    pub fn then<F, Fut>(mut self, name: &'static str, strategy: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'a,
        Fut: Future<Output = Result<T, E>> + Send + 'a,
    {
        self.strategies
            .push((name, Box::new(move || Box::pin(strategy()))));
        self
    }

    /// Append a strategy only when `enabled` holds.
    pub fn then_if<F, Fut>(self, enabled: bool, name: &'static str, strategy: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'a,
        Fut: Future<Output = Result<T, E>> + Send + 'a,
    {
        if enabled {
            self.then(name, strategy)
        } else {
            self
        }
    }

    pub fn accept_when(mut self, predicate: impl Fn(&T) -> bool + Send + Sync + 'a) -> Self {
        self.accept = Some(Box::new(predicate));
        self
    }

    pub fn stop_when(mut self, predicate: impl Fn(&E) -> bool + Send + Sync + 'a) -> Self {
        self.stop = Some(Box::new(predicate));
        self
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    pub async fn run(self) -> Result<Resolved<T>, FallbackError<E>>
    where
        E: std::fmt::Display,
    {
        if self.strategies.is_empty() {
            return Err(FallbackError::Empty);
        }

        let mut failures = Vec::new();
        let mut rejected: Option<(&'static str, T)> = None;
        let mut attempts = 0;

        for (name, strategy) in self.strategies {
            attempts += 1;
            match strategy().await {
                Ok(value) => {
                    let accepted = self.accept.as_ref().is_none_or(|accept| accept(&value));
                    if accepted {
                        debug!(strategy = name, attempts, "Fallback chain resolved");
                        return Ok(Resolved {
                            value,
                            strategy: name,
                            attempts,
                            accepted: true,
                        });
                    }
                    debug!(strategy = name, "Strategy result rejected, trying next");
                    rejected = Some((name, value));
                }
                Err(e) => {
                    if self.stop.as_ref().is_some_and(|stop| stop(&e)) {
                        debug!(strategy = name, error = %e, "Terminal error, chain stopped");
                        return Err(FallbackError::Terminal {
                            strategy: name,
                            source: e,
                        });
                    }
                    warn!(strategy = name, error = %e, "Strategy failed, trying next");
                    failures.push((name, e));
                }
            }
        }

        match rejected {
            Some((strategy, value)) => Ok(Resolved {
                value,
                strategy,
                attempts,
                accepted: false,
            }),
            None => Err(FallbackError::Exhausted { failures }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;

    #[tokio::test]
    async fn test_first_success_wins() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();

        let resolved = FallbackChain::<u32, String>::new()
            .then("a", || async { Ok(1) })
            .then("b", move || async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(2)
            })
            .run()
            .await
            .unwrap();

        assert_eq!(resolved.value, 1);
        assert_eq!(resolved.strategy, "a");
        assert_eq!(resolved.attempts, 1);
        assert!(resolved.accepted);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_error_falls_through() {
        let resolved = FallbackChain::<u32, String>::new()
            .then("a", || async { Err("down".to_string()) })
            .then("b", || async { Ok(7) })
            .run()
            .await
            .unwrap();

        assert_eq!(resolved.value, 7);
        assert_eq!(resolved.strategy, "b");
        assert_eq!(resolved.attempts, 2);
    }

    #[tokio::test]
    async fn test_terminal_error_stops_chain() {
        let err = FallbackChain::<u32, String>::new()
            .then("a", || async { Err("fatal".to_string()) })
            .then("b", || async { Ok(7) })
            .stop_when(|e| e == "fatal")
            .run()
            .await
            .unwrap_err();

        assert!(matches!(err, FallbackError::Terminal { strategy: "a", .. }));
        assert_eq!(err.into_last().as_deref(), Some("fatal"));
    }

    #[tokio::test]
    async fn test_exhausted_reports_last_error() {
        let err = FallbackChain::<u32, String>::new()
            .then("a", || async { Err("first".to_string()) })
            .then("b", || async { Err("second".to_string()) })
            .run()
            .await
            .unwrap_err();

        match &err {
            FallbackError::Exhausted { failures } => assert_eq!(failures.len(), 2),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(err.into_last().as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn test_rejected_values_fall_through_and_last_is_returned() {
        let resolved = FallbackChain::<Vec<u32>, String>::new()
            .then("a", || async { Ok(vec![]) })
            .then("b", || async { Err("down".to_string()) })
            .then("c", || async { Ok(vec![]) })
            .accept_when(|v: &Vec<u32>| !v.is_empty())
            .run()
            .await
            .unwrap();

        assert!(!resolved.accepted);
        assert_eq!(resolved.strategy, "c");
        assert_eq!(resolved.attempts, 3);
    }

    #[tokio::test]
    async fn test_then_if_skips_disabled_strategy() {
        let chain = FallbackChain::<u32, String>::new()
            .then_if(false, "skipped", || async { Ok(1) })
            .then("kept", || async { Ok(2) });
        assert_eq!(chain.len(), 1);

        let resolved = chain.run().await.unwrap();
        assert_eq!(resolved.strategy, "kept");
    }

    #[tokio::test]
    async fn test_empty_chain() {
        let err = FallbackChain::<u32, String>::new().run().await.unwrap_err();
        assert!(matches!(err, FallbackError::Empty));
    }
}
