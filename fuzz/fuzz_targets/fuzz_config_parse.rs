//! Fuzz target for agent configuration parsing.
//!
//! Tests that JSON and TOML config parsing plus validation handle arbitrary
//! input without panicking.

#![no_main]

use libfuzzer_sys::fuzz_target;
use pw_common::config::ConfigFormat;
use pw_common::AgentConfig;

fuzz_target!(|data: &str| {
    for format in [ConfigFormat::Json, ConfigFormat::Toml] {
        if let Ok(config) = AgentConfig::parse(data, format) {
            let _ = config.validate_for_run();
        }
    }
});
