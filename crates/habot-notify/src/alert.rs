//! Actionable alert construction
//!
//! An alert is the structured payload handed to the messenger: what
//! happened, plus the quick actions appropriate for the entity's domain.
//! Rendering it into chat markup is the messenger's business.

use std::time::Duration;

use habot_core::{map_state, EntityId, EntityState};

/// How long the alert's mute control silences the entity for
pub const MUTE_DURATION: Duration = Duration::from_secs(3600);

/// One notification, ready for delivery
#[derive(Debug, Clone)]
pub struct Alert {
    pub entity_id: EntityId,
    pub title: String,
    pub state_line: String,
    /// Key attributes that moved, as (attribute, new value) pairs
    pub changed_attributes: Vec<(String, String)>,
    pub is_active: bool,
    pub is_unavailable: bool,
    pub actions: Vec<AlertAction>,
}

/// A quick-action button attached to an alert
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlertAction {
    /// Invoke this service on the alert's entity (same domain)
    Service {
        label: &'static str,
        service: &'static str,
    },
    /// Silence this subscription for a while
    Mute {
        label: &'static str,
        duration: Duration,
    },
}

impl Alert {
    pub fn for_change(
        display_name: &str,
        new_state: &EntityState,
        changed_attributes: Vec<(String, String)>,
    ) -> Self {
        let domain = new_state.entity_id.domain();
        let mapped = map_state(domain, &new_state.state);
        Self {
            entity_id: new_state.entity_id.clone(),
            title: display_name.to_string(),
            state_line: format!("{display_name} is now {}", new_state.state),
            changed_attributes,
            is_active: mapped.is_active,
            is_unavailable: mapped.is_unavailable,
            actions: domain_actions(domain),
        }
    }
}

/// Quick actions by domain. Every alert also gets the mute control.
pub fn domain_actions(domain: &str) -> Vec<AlertAction> {
    let services: &[(&'static str, &'static str)] = match domain {
        "vacuum" => &[
            ("Dock", "return_to_base"),
            ("Locate", "locate"),
            ("Pause", "pause"),
        ],
        "light" | "switch" => &[("On", "turn_on"), ("Off", "turn_off")],
        "cover" => &[
            ("Open", "open_cover"),
            ("Stop", "stop_cover"),
            ("Close", "close_cover"),
        ],
        _ => &[],
    };

    let mut actions: Vec<AlertAction> = services
        .iter()
        .copied()
        .map(|(label, service)| AlertAction::Service { label, service })
        .collect();
    actions.push(AlertAction::Mute {
        label: "Mute 1h",
        duration: MUTE_DURATION,
    });
    actions
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_vacuum_actions() {
        let actions = domain_actions("vacuum");
        assert_eq!(
            actions,
            vec![
                AlertAction::Service {
                    label: "Dock",
                    service: "return_to_base"
                },
                AlertAction::Service {
                    label: "Locate",
                    service: "locate"
                },
                AlertAction::Service {
                    label: "Pause",
                    service: "pause"
                },
                AlertAction::Mute {
                    label: "Mute 1h",
                    duration: MUTE_DURATION
                },
            ]
        );
    }

    #[test]
    fn test_unactionable_domain_still_gets_mute() {
        let actions = domain_actions("sensor");
        assert_eq!(actions.len(), 1);
        assert!(matches!(actions[0], AlertAction::Mute { .. }));
    }

    #[test]
    fn test_alert_classification() {
        let state = EntityState::new(
            "vacuum.roborock".parse().unwrap(),
            "cleaning",
            HashMap::new(),
        );
        let alert = Alert::for_change("Upstairs Vacuum", &state, vec![]);
        assert!(alert.is_active);
        assert!(!alert.is_unavailable);
        assert_eq!(alert.state_line, "Upstairs Vacuum is now cleaning");
        assert_eq!(alert.actions.len(), 4);
    }
}
