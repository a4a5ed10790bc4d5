use chrono::{DateTime, Utc};
use serde::Serialize;

/// Summary of one check cycle
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CycleStats {
    pub selected: usize,
    pub active_selected: usize,
    pub new_selected: usize,
    pub stale_selected: usize,
    pub checked: usize,
    pub active: usize,
    pub tunnel_capable: usize,
    pub store_errors: usize,
    pub duration_secs: f64,
    pub finished_at: Option<DateTime<Utc>>,
}

impl CycleStats {
    /// Share of checked proxies that answered
    pub fn active_rate(&self) -> f64 {
        if self.checked == 0 {
            0.0
        } else {
            self.active as f64 / self.checked as f64
        }
    }
}
