//! Subscription-driven notification engine
//!
//! Users subscribe to entities; state changes become actionable alerts,
//! subject to per-subscription mute and a per-entity throttle.

mod alert;
mod dispatcher;

pub use alert::{domain_actions, Alert, AlertAction, MUTE_DURATION};
pub use dispatcher::{DeliveryError, Messenger, NotificationDispatcher, NotifyError};
