//! Request lifecycle state machine.
//!
//! Every call to [`RequestHandler::fetch`](crate::RequestHandler::fetch) and
//! every queue drain walks a request through these states. The transition
//! function is pure so the handler and its tests agree on what happens next.

/// Classification of a failed attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
    /// Connection refused, DNS failure, a request that cannot be built and
    /// similar.
    Transport,
    /// The per-attempt cancellation timer fired.
    Timeout,
    /// 5xx response.
    ServerError,
    /// 429 response.
    RateLimited,
    /// 401 response.
    Unauthorized,
}

impl FailureKind {
    pub fn is_retryable(self) -> bool {
        !matches!(self, Self::Unauthorized)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestState {
    /// An attempt is in flight.
    Attempting,
    /// Waiting out the backoff delay before the next attempt.
    Backoff,
    /// In-line budget spent; the request lives in the background queue.
    Queued,
    /// Moved to the failure archive. Terminal.
    Archived,
    /// A response was returned to the caller. Terminal.
    Succeeded,
    /// Rejected without retry (401). Terminal.
    Rejected,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestEvent {
    AttemptFailed(FailureKind),
    AttemptSucceeded,
    BackoffElapsed,
    RetryBudgetExhausted,
}

impl RequestState {
    /// Applies `event` and returns the next state.
    ///
    /// Events that make no sense for the current state leave it unchanged.
    pub fn on(self, event: RequestEvent) -> Self {
        use RequestEvent::*;
        use RequestState::*;

        match (self, event) {
            (Attempting, AttemptSucceeded) => Succeeded,
            (Attempting, AttemptFailed(FailureKind::Unauthorized)) => Rejected,
            (Attempting, AttemptFailed(_)) => Backoff,
            (Attempting, RetryBudgetExhausted) => Queued,
            (Backoff, BackoffElapsed) => Attempting,
            (Queued, AttemptSucceeded) => Succeeded,
            (Queued, AttemptFailed(FailureKind::Unauthorized)) => Rejected,
            (Queued, RetryBudgetExhausted) => Archived,
            (state, _) => state,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Archived | Self::Succeeded | Self::Rejected)
    }
}

#[cfg(test)]
mod tests {
    use super::{FailureKind, RequestEvent, RequestState};

    #[test]
    fn inline_retry_cycle() {
        let state = RequestState::Attempting
            .on(RequestEvent::AttemptFailed(FailureKind::ServerError))
            .on(RequestEvent::BackoffElapsed);
        assert_eq!(state, RequestState::Attempting);
        assert_eq!(
            state.on(RequestEvent::AttemptSucceeded),
            RequestState::Succeeded
        );
    }

    #[test]
    fn unauthorized_is_rejected_without_backoff() {
        let state =
            RequestState::Attempting.on(RequestEvent::AttemptFailed(FailureKind::Unauthorized));
        assert_eq!(state, RequestState::Rejected);
        assert!(state.is_terminal());
    }

    #[test]
    fn exhausted_inline_goes_to_queue_then_archive() {
        let queued = RequestState::Attempting.on(RequestEvent::RetryBudgetExhausted);
        assert_eq!(queued, RequestState::Queued);
        assert_eq!(
            queued.on(RequestEvent::AttemptFailed(FailureKind::Transport)),
            RequestState::Queued
        );
        assert_eq!(
            queued.on(RequestEvent::RetryBudgetExhausted),
            RequestState::Archived
        );
    }

    #[test]
    fn terminal_states_ignore_events() {
        for state in [
            RequestState::Archived,
            RequestState::Succeeded,
            RequestState::Rejected,
        ] {
            assert_eq!(state.on(RequestEvent::BackoffElapsed), state);
            assert_eq!(state.on(RequestEvent::AttemptSucceeded), state);
        }
    }
}
