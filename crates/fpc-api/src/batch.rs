//! Bounded concurrent execution of independent requests.
//!
//! A batch runs on its own rayon pool. The calling thread keeps at most
//! `size` requests in flight, refills a slot whenever a request completes and
//! collects completions from a channel. Retryable transport failures are
//! replayed up to a fixed number of times per request.

use std::collections::HashMap;
use std::sync::{Arc, mpsc};

use fpc_transport::{Request, Response, Transport, TransportError};

use crate::ApiError;

/// Replays of one request before its failure is final.
pub const MAX_RETRIES: u32 = 5;

/// Most concurrent cache lookups.
const LOOKUP_CONCURRENCY: usize = 5;

/// Most concurrent purges.
const PURGE_CONCURRENCY: usize = 25;

/// How one request of a batch ended.
#[derive(Debug)]
pub struct BatchOutcome {
    pub request: Request,
    pub result: Result<Response, TransportError>,
    /// Replays that were needed.
    pub retries: u32,
}

/// Runs a batch with bounded concurrency.
#[derive(Debug, Clone, Copy)]
pub struct BatchPool {
    size: usize,
    max_retries: u32,
}

impl BatchPool {
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            size: size.max(1),
            max_retries: MAX_RETRIES,
        }
    }

    /// Pool for `count` cache lookups.
    #[must_use]
    pub fn for_lookups(count: usize) -> Self {
        Self::new(count.min(LOOKUP_CONCURRENCY))
    }

    /// Pool for purging `count` URLs: a fifth of them at once, at most 25.
    #[must_use]
    pub fn for_purges(count: usize) -> Self {
        Self::new(count.div_ceil(5).min(PURGE_CONCURRENCY))
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Send every request and return the outcomes in request order.
    ///
    /// Connection failures and connect timeouts are replayed up to
    /// [`MAX_RETRIES`] times. Read timeouts are not replayed since the
    /// service may already have acted on the request.
    pub fn run(
        &self,
        transport: &Arc<dyn Transport>,
        requests: Vec<Request>,
    ) -> Result<Vec<BatchOutcome>, ApiError> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.size)
            .thread_name(|i| format!("fpc-batch-{i}"))
            .build()
            .map_err(|e| ApiError::Pool(e.to_string()))?;

        let requests: Vec<Arc<Request>> = requests.into_iter().map(Arc::new).collect();
        let (tx, rx) = mpsc::channel();
        let spawn = |index: usize, replay: bool| {
            let tx = tx.clone();
            let transport = Arc::clone(transport);
            let request = Arc::clone(&requests[index]);
            pool.spawn(move || {
                let result = if replay {
                    transport.replay(&request)
                } else {
                    transport.send(&request)
                };
                tx.send((index, result)).ok();
            });
        };

        let mut results: Vec<Option<Result<Response, TransportError>>> =
            (0..requests.len()).map(|_| None).collect();
        let mut retries: HashMap<usize, u32> = HashMap::new();
        let mut pending = 0..requests.len();
        let mut in_flight = 0usize;

        for index in pending.by_ref().take(self.size) {
            spawn(index, false);
            in_flight += 1;
        }

        while in_flight > 0 {
            let Ok((index, result)) = rx.recv() else {
                break;
            };
            in_flight -= 1;

            if let Err(e) = &result
                && e.is_retryable()
                && !e.is_read_timeout()
            {
                let count = retries.entry(index).or_insert(0);
                if *count < self.max_retries {
                    *count += 1;
                    tracing::debug!(path = %requests[index].path, retry = *count, error = %e, "Replaying batch request");
                    spawn(index, true);
                    in_flight += 1;
                    continue;
                }
            }
            results[index] = Some(result);

            if let Some(next) = pending.next() {
                spawn(next, false);
                in_flight += 1;
            }
        }

        let outcomes = requests
            .into_iter()
            .zip(results)
            .enumerate()
            .map(|(index, (request, result))| BatchOutcome {
                request: Arc::unwrap_or_clone(request),
                result: result.unwrap_or_else(|| {
                    Err(TransportError::Fatal("request did not complete".to_owned()))
                }),
                retries: retries.get(&index).copied().unwrap_or(0),
            })
            .collect();
        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    use fpc_transport::{MockTransport, TimeoutPhase};
    use pretty_assertions::assert_eq;

    fn requests(n: usize) -> Vec<Request> {
        (0..n).map(|i| Request::post(format!("p{i}"))).collect()
    }

    #[test]
    fn test_pool_sizes() {
        assert_eq!(BatchPool::for_purges(1).size(), 1);
        assert_eq!(BatchPool::for_purges(11).size(), 3);
        assert_eq!(BatchPool::for_purges(1000).size(), 25);
        assert_eq!(BatchPool::for_lookups(3).size(), 3);
        assert_eq!(BatchPool::for_lookups(40).size(), 5);
        assert_eq!(BatchPool::new(0).size(), 1);
    }

    #[test]
    fn test_runs_every_request_in_order() {
        let transport: Arc<dyn Transport> = Arc::new(MockTransport::with_handler(|r| {
            Ok(Response::new(200).with_body(r.path.clone()))
        }));

        let outcomes = BatchPool::new(3).run(&transport, requests(10)).unwrap();

        assert_eq!(outcomes.len(), 10);
        for (i, outcome) in outcomes.iter().enumerate() {
            assert_eq!(outcome.request.path, format!("p{i}"));
            assert_eq!(outcome.result.as_ref().unwrap().body, format!("p{i}").into_bytes());
            assert_eq!(outcome.retries, 0);
        }
    }

    #[test]
    fn test_concurrency_is_bounded() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let transport: Arc<dyn Transport> = {
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            Arc::new(MockTransport::with_handler(move |_| {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(5));
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(Response::new(200))
            }))
        };

        let outcomes = BatchPool::new(2).run(&transport, requests(8)).unwrap();

        assert_eq!(outcomes.len(), 8);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn test_retryable_failures_are_replayed() {
        let failures = Mutex::new(HashMap::<String, usize>::new());
        let mock = MockTransport::with_handler(move |r| {
            let mut failures = failures.lock().unwrap();
            let count = failures.entry(r.path.clone()).or_insert(0);
            *count += 1;
            if r.path == "p1" && *count <= 2 {
                Err(TransportError::Connection("refused".to_owned()))
            } else {
                Ok(Response::new(200))
            }
        });
        let mock = Arc::new(mock);
        let transport: Arc<dyn Transport> = Arc::clone(&mock) as Arc<dyn Transport>;

        let outcomes = BatchPool::new(2).run(&transport, requests(3)).unwrap();

        assert!(outcomes.iter().all(|o| o.result.is_ok()));
        assert_eq!(outcomes[1].retries, 2);
        assert_eq!(mock.replay_count(), 2);
    }

    #[test]
    fn test_retries_are_capped() {
        let mock = Arc::new(MockTransport::with_handler(|_| {
            Err(TransportError::Connection("refused".to_owned()))
        }));
        let transport: Arc<dyn Transport> = Arc::clone(&mock) as Arc<dyn Transport>;

        let outcomes = BatchPool::new(1).run(&transport, requests(1)).unwrap();

        assert!(outcomes[0].result.is_err());
        assert_eq!(outcomes[0].retries, MAX_RETRIES);
        assert_eq!(mock.requests().len(), 1 + MAX_RETRIES as usize);
    }

    #[test]
    fn test_read_timeouts_and_fatal_errors_are_final() {
        let mock = MockTransport::with_handler(|r| {
            if r.path == "p0" {
                Err(TransportError::Timeout {
                    phase: TimeoutPhase::Read,
                    message: "slow".to_owned(),
                })
            } else {
                Err(TransportError::Fatal("bad url".to_owned()))
            }
        });
        let mock = Arc::new(mock);
        let transport: Arc<dyn Transport> = Arc::clone(&mock) as Arc<dyn Transport>;

        let outcomes = BatchPool::new(2).run(&transport, requests(2)).unwrap();

        assert!(outcomes[0].result.as_ref().unwrap_err().is_read_timeout());
        assert!(matches!(outcomes[1].result, Err(TransportError::Fatal(_))));
        assert_eq!(mock.replay_count(), 0);
    }

    #[test]
    fn test_empty_batch() {
        let transport: Arc<dyn Transport> = Arc::new(MockTransport::new());

        assert!(BatchPool::new(4).run(&transport, Vec::new()).unwrap().is_empty());
    }
}
