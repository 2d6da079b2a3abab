//! Fuzz target for /proc/[pid]/stat parsing.
//!
//! Tests that `parse_stat_content` handles arbitrary input without panicking,
//! including process names containing spaces and parentheses.

#![no_main]

use libfuzzer_sys::fuzz_target;
use pw_core::collect::procfs::{parse_stat_content, parse_statm_content};

fuzz_target!(|data: &str| {
    // The parsers should never panic, only return None for malformed input
    let _ = parse_stat_content(data);
    let _ = parse_statm_content(data);
});
