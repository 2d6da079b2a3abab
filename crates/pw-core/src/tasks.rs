//! Periodic worker threads.
//!
//! Every probe runs on its own named OS thread and sleeps on the shared
//! [`Shutdown`] signal between iterations. A failing or panicking
//! iteration is logged and the loop continues with the next interval.

use std::any::Any;
use std::fmt::Display;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use pw_common::Shutdown;
use tracing::{error, warn, Span};

/// Run `tick` every `interval` until `stop` is triggered.
pub fn run_periodic<F, E>(task: &'static str, stop: &Shutdown, interval: Duration, mut tick: F)
where
    F: FnMut() -> Result<(), E>,
    E: Display,
{
    while !stop.is_triggered() {
        match panic::catch_unwind(AssertUnwindSafe(&mut tick)) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(task, error = %e, "iteration failed"),
            Err(payload) => {
                error!(task, panic = %panic_message(payload.as_ref()), "iteration panicked")
            }
        }
        if stop.wait_timeout(interval) {
            break;
        }
    }
}

/// Spawn a named worker thread that logs inside `span`.
pub fn spawn_worker<F>(name: &str, span: Span, body: F) -> io::Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(move || span.in_scope(body))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
