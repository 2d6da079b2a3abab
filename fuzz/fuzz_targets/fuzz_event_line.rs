//! Fuzz target for persisted event lines.
//!
//! Any line that parses must serialize back to a line that parses to the
//! same event.

#![no_main]

use libfuzzer_sys::fuzz_target;
use pw_common::Event;

fuzz_target!(|data: &str| {
    let Ok(event) = Event::from_line(data) else {
        return;
    };
    let line = event.to_line().expect("parsed events serialize");
    let again = Event::from_line(&line).expect("serialized events parse");
    assert_eq!(again.event_type, event.event_type);
    assert_eq!(again.pid, event.pid);
});
