//! Action admission and execution pipeline
//!
//! Everything between "a button was pressed" and "a service call went
//! out": authorization, duplicate suppression, gesture coalescing, rate
//! limiting and auditing.

mod rate_limit;
mod router;

pub use rate_limit::{Permit, RateLimitDecision, RateLimitError, RateLimiter};
pub use router::{AuditSink, CallbackRouter, RouteOutcome, RouterError, TracingAudit};
