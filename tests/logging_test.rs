//! Global subscriber installation.
//!
//! Kept in its own test binary: installing the global subscriber would hide events from
//! `#[traced_test]` captures in the library's unit tests.

use logic2_automation::config::AutomationConfig;
use logic2_automation::logging::{self, LogSettings, OutputFormat};
use tracing::Level;

#[test]
fn test_init_is_idempotent() {
    let settings = LogSettings::new(Level::WARN).with_format(OutputFormat::Compact);
    assert!(logging::init(settings.clone()).is_ok(), "First init should succeed");
    assert!(logging::init(settings).is_ok(), "Second init should be a no-op");

    let config = AutomationConfig::default();
    assert!(
        logging::init_from_config(&config).is_ok(),
        "Init from config after a subscriber exists should be a no-op"
    );
}
