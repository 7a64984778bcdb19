//! Scheduling hints for threads that poll the bus.
//!
//! Background polling must never preempt latency-sensitive work sharing the
//! same core, so a polling thread can drop itself into the idle scheduling
//! class. Failure only means the thread keeps its current priority; bus
//! operations are unaffected.

use crate::{error::Result, tracing::prelude::*};
use std::io;

/// Move the calling thread to `SCHED_IDLE`.
#[cfg(target_os = "linux")]
pub fn set_background_priority() -> Result<()> {
    let param = libc::sched_param { sched_priority: 0 };
    // SAFETY: pid 0 names the calling thread; param is a valid pointer for
    // the duration of the call.
    let rc = unsafe { libc::sched_setscheduler(0, libc::SCHED_IDLE, &param) };
    if rc != 0 {
        let e = io::Error::last_os_error();
        warn!(error = %e, "Failed to switch thread to idle scheduling");
        return Err(e.into());
    }
    debug!("Thread switched to idle scheduling");
    Ok(())
}

/// Idle-class scheduling is Linux-specific.
#[cfg(not(target_os = "linux"))]
pub fn set_background_priority() -> Result<()> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "idle scheduling requires Linux").into())
}
