//! Domain-aware state classification and tracked-attribute tables
//!
//! Pure functions only; no dependency on the rest of the workspace.

/// Normalized reading of a raw state string for one domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedState {
    /// True when the entity is actively doing something (light on,
    /// vacuum cleaning, media playing, ...)
    pub is_active: bool,
    /// True when the platform reports the entity as unreachable
    pub is_unavailable: bool,
    /// True for sensor-like domains that take no commands
    pub is_read_only: bool,
}

/// Attributes whose changes are notification-worthy in
/// `state_and_key_attrs` mode, per domain.
pub fn key_attributes(domain: &str) -> &'static [&'static str] {
    match domain {
        "vacuum" => &["status", "battery_level", "error", "fan_speed"],
        "climate" => &["current_temperature", "temperature", "hvac_action"],
        "media_player" => &["media_title", "source"],
        // Generic fallback: things with batteries and thermometers
        _ => &["battery_level", "temperature"],
    }
}

/// States that mean "actively doing something" per domain.
fn active_states(domain: &str) -> &'static [&'static str] {
    match domain {
        "light" | "switch" | "fan" | "input_boolean" | "binary_sensor" => &["on"],
        "cover" => &["open", "opening", "closing"],
        "lock" => &["unlocked"],
        "vacuum" => &["cleaning", "returning"],
        "media_player" => &["playing", "buffering"],
        "climate" => &[
            "heating", "cooling", "drying", "heat", "cool", "heat_cool", "auto",
        ],
        "water_heater" => &["heating", "on"],
        _ => &[],
    }
}

const READ_ONLY_DOMAINS: &[&str] = &["sensor", "binary_sensor", "event"];
const UNAVAILABLE_STATES: &[&str] = &["unavailable", "unknown"];

/// Classify a raw state string for a domain.
pub fn map_state(domain: &str, state: &str) -> MappedState {
    let is_unavailable = UNAVAILABLE_STATES.contains(&state);
    MappedState {
        is_active: !is_unavailable && active_states(domain).contains(&state),
        is_unavailable,
        is_read_only: READ_ONLY_DOMAINS.contains(&domain),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_light_on_is_active() {
        let m = map_state("light", "on");
        assert!(m.is_active);
        assert!(!m.is_read_only);
        assert!(!m.is_unavailable);
    }

    #[test]
    fn test_vacuum_states() {
        assert!(map_state("vacuum", "cleaning").is_active);
        assert!(map_state("vacuum", "returning").is_active);
        assert!(!map_state("vacuum", "docked").is_active);
    }

    #[test]
    fn test_unavailable_never_active() {
        let m = map_state("light", "unavailable");
        assert!(m.is_unavailable);
        assert!(!m.is_active);
    }

    #[test]
    fn test_sensor_is_read_only() {
        assert!(map_state("sensor", "23.5").is_read_only);
        assert!(!map_state("climate", "heat").is_read_only);
    }

    #[test]
    fn test_key_attributes_per_domain() {
        assert!(key_attributes("vacuum").contains(&"battery_level"));
        assert!(key_attributes("climate").contains(&"hvac_action"));
        assert!(key_attributes("sensor").contains(&"temperature"));
    }
}
