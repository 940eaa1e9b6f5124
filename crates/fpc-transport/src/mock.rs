//! Scripted transport for testing.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::{Request, Response, Transport, TransportError};

type Handler = Box<dyn Fn(&Request) -> Result<Response, TransportError> + Send + Sync>;

/// Transport that answers from a queue of scripted results, then from a
/// handler, then with an empty `200`.
///
/// Every request is recorded.
///
/// # Example
///
/// ```ignore
/// use fpc_transport::{MockTransport, Request, Response, Transport};
///
/// let transport = MockTransport::new();
/// transport.push(Ok(Response::new(503)));
///
/// assert_eq!(transport.send(&Request::get("a")).unwrap().code, 503);
/// assert_eq!(transport.send(&Request::get("b")).unwrap().code, 200);
/// assert_eq!(transport.requests().len(), 2);
/// ```
#[derive(Default)]
pub struct MockTransport {
    script: Mutex<VecDeque<Result<Response, TransportError>>>,
    handler: Option<Handler>,
    sent: Mutex<Vec<Request>>,
    replays: AtomicUsize,
}

impl MockTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every unscripted request with `handler`.
    #[must_use]
    pub fn with_handler(
        handler: impl Fn(&Request) -> Result<Response, TransportError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            handler: Some(Box::new(handler)),
            ..Self::default()
        }
    }

    /// Queue the result of the next request.
    pub fn push(&self, result: Result<Response, TransportError>) {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(result);
    }

    /// Every request sent or replayed, in order.
    pub fn requests(&self) -> Vec<Request> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn replay_count(&self) -> usize {
        self.replays.load(Ordering::SeqCst)
    }
}

impl Transport for MockTransport {
    fn send(&self, request: &Request) -> Result<Response, TransportError> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());
        let scripted = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        match (scripted, &self.handler) {
            (Some(result), _) => result,
            (None, Some(handler)) => handler(request),
            (None, None) => Ok(Response::new(200)),
        }
    }

    fn replay(&self, request: &Request) -> Result<Response, TransportError> {
        self.replays.fetch_add(1, Ordering::SeqCst);
        self.send(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_script_then_handler() {
        let transport = MockTransport::with_handler(|r| Ok(Response::new(200).with_body(r.path.clone())));
        transport.push(Err(TransportError::Connection("refused".to_owned())));

        assert!(transport.send(&Request::get("a")).is_err());
        assert_eq!(transport.send(&Request::get("b")).unwrap().body, b"b");
        assert_eq!(transport.replay(&Request::get("c")).unwrap().body, b"c");
        assert_eq!(transport.requests().len(), 3);
        assert_eq!(transport.replay_count(), 1);
    }
}
