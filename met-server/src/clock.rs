//! The single wall-clock source stamped onto server-synthesized signals
//! (`mstart`'s trial-index cargo, `mwait(init)`'s time field).

use std::time::{SystemTime, UNIX_EPOCH};

pub fn now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
