//! Network fault injection.
//!
//! [`FlakyConnector`] wraps another connector and hands out transports that
//! share one set of switches: the link can be taken down, or the next few
//! requests can be made to fail. Failures look like unreachable sources,
//! i.e. retryable transport errors.

use logship_applier::{ApplierError, ApplierResult, Connector, ReplicationTransport};
use logship_protocol::{Request, Response};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
struct Faults {
    down: AtomicBool,
    fail_next: AtomicU32,
    injected: AtomicU64,
}

impl Faults {
    fn should_fail(&self) -> bool {
        if self.down.load(Ordering::SeqCst) {
            return true;
        }
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn fail(&self, what: &str) -> ApplierError {
        self.injected.fetch_add(1, Ordering::SeqCst);
        ApplierError::transport_retryable(format!("injected fault: {what}"))
    }
}

/// A connector whose links can be broken on demand.
pub struct FlakyConnector {
    inner: Arc<dyn Connector>,
    faults: Arc<Faults>,
}

impl FlakyConnector {
    /// Wraps `inner`. The link starts up.
    pub fn new(inner: Arc<dyn Connector>) -> Self {
        Self {
            inner,
            faults: Arc::new(Faults::default()),
        }
    }

    /// Takes every link down, or brings it back up.
    pub fn set_down(&self, down: bool) {
        self.faults.down.store(down, Ordering::SeqCst);
    }

    /// Makes the next `count` requests fail.
    pub fn fail_next(&self, count: u32) {
        self.faults.fail_next.store(count, Ordering::SeqCst);
    }

    /// Number of failures injected so far.
    pub fn injected(&self) -> u64 {
        self.faults.injected.load(Ordering::SeqCst)
    }
}

impl Connector for FlakyConnector {
    fn connect(&self, endpoint: &str) -> ApplierResult<Arc<dyn ReplicationTransport>> {
        if self.faults.down.load(Ordering::SeqCst) {
            return Err(self.faults.fail(&format!("connect to {endpoint}")));
        }
        Ok(Arc::new(FlakyTransport {
            inner: self.inner.connect(endpoint)?,
            faults: Arc::clone(&self.faults),
        }))
    }
}

struct FlakyTransport {
    inner: Arc<dyn ReplicationTransport>,
    faults: Arc<Faults>,
}

impl ReplicationTransport for FlakyTransport {
    fn request(&self, request: &Request) -> ApplierResult<Response> {
        if self.faults.should_fail() {
            return Err(self.faults.fail(request.body.name()));
        }
        self.inner.request(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use logship_applier::MockTransport;
    use logship_protocol::RequestBody;

    fn connector() -> (Arc<MockTransport>, FlakyConnector) {
        let mock = Arc::new(MockTransport::new());
        mock.set_fallback(Response::Released);
        let flaky = FlakyConnector::new(Arc::new(Arc::clone(&mock)) as Arc<dyn Connector>);
        (mock, flaky)
    }

    fn request() -> Request {
        Request::anonymous(RequestBody::LoggerState)
    }

    #[test]
    fn fail_next_counts_down() {
        let (mock, flaky) = connector();
        let transport = flaky.connect("mock://").unwrap();
        flaky.fail_next(2);

        assert!(transport.request(&request()).unwrap_err().is_retryable());
        assert!(transport.request(&request()).is_err());
        assert!(transport.request(&request()).is_ok());
        assert_eq!(flaky.injected(), 2);
        assert_eq!(mock.requests().len(), 1);
    }

    #[test]
    fn down_link_refuses_connections() {
        let (_mock, flaky) = connector();
        let transport = flaky.connect("mock://").unwrap();
        flaky.set_down(true);
        assert!(flaky.connect("mock://").is_err());
        assert!(transport.request(&request()).is_err());

        flaky.set_down(false);
        assert!(transport.request(&request()).is_ok());
    }
}
