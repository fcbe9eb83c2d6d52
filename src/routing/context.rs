//! Per-request routing inputs.

use std::time::Duration;

use crate::load_balancer::geo::GeoPoint;
use crate::load_balancer::SelectionContext;
use crate::resilience::Deadline;
use crate::routing::upstream::UpstreamRequest;

/// Everything `Dispatcher::route` needs to know about one request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request: UpstreamRequest,
    pub session_key: Option<String>,
    pub client_id: Option<String>,
    pub location: Option<GeoPoint>,
    /// Falls back to the dispatcher's request timeout when unset.
    pub deadline: Option<Deadline>,
}

impl RequestContext {
    pub fn new(request: UpstreamRequest) -> Self {
        Self {
            request,
            session_key: None,
            client_id: None,
            location: None,
            deadline: None,
        }
    }

    pub fn session(mut self, key: impl Into<String>) -> Self {
        self.session_key = Some(key.into());
        self
    }

    pub fn client(mut self, id: impl Into<String>) -> Self {
        self.client_id = Some(id.into());
        self
    }

    pub fn location(mut self, point: GeoPoint) -> Self {
        self.location = Some(point);
        self
    }

    pub fn deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Deadline `timeout` from now.
    pub fn timeout(self, timeout: Duration) -> Self {
        self.deadline(Deadline::after(timeout))
    }

    pub fn selection(&self) -> SelectionContext<'_> {
        SelectionContext {
            client_key: self.client_id.as_deref(),
            session_key: self.session_key.as_deref(),
            location: self.location,
        }
    }
}
