//! Per-type collection configuration.

use std::time::Duration;

/// Replication policy for one collection type.
///
/// Override just the fields you care about:
///
/// ```rust
/// use std::time::Duration;
/// use roomsync_collection::CollectionConfig;
///
/// let config = CollectionConfig {
///     throttle: Duration::from_millis(50),
///     reactive: true,
///     ..CollectionConfig::default()
/// };
/// assert!(config.save_data);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionConfig {
    /// Keep a local mirror of the records. When `false` the collection
    /// only forwards events and never stores anything.
    pub save_data: bool,

    /// Minimum spacing between outbound update frames for one record id.
    /// Zero sends every update immediately.
    pub throttle: Duration,

    /// Writes made through `modify_item` are sent automatically when they
    /// change the value.
    pub reactive: bool,

    /// Default mutability for new records. While `true`, reactive writes
    /// on any record in the collection stay local.
    pub readonly: bool,

    /// Locally originated mutations also notify local subscribers.
    /// Remote mutations always notify.
    pub local_events: bool,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            save_data: true,
            throttle: Duration::ZERO,
            reactive: false,
            readonly: false,
            local_events: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_sends_immediately_and_stores() {
        let config = CollectionConfig::default();
        assert!(config.save_data);
        assert_eq!(config.throttle, Duration::ZERO);
        assert!(!config.reactive);
        assert!(!config.readonly);
        assert!(config.local_events);
    }
}
