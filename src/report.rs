//! Point-in-time status snapshots for the control surface
//!
//! Reports are plain serializable data: the daemon builds them, the control
//! API ships them as JSON, the CLI renders them. Ordering puts actionable
//! instances (starting/serving/stopping) first with a stable sort, so the
//! terminal tail of the history keeps its original relative order.

use crate::instance::InstanceStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Instances shown per app when no explicit tail length is requested.
pub const DEFAULT_TAIL: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceReport {
    pub id: u32,
    pub status: String,
    pub port: u16,
    pub started_at: DateTime<Utc>,
    pub exited_at: Option<DateTime<Utc>>,
    pub in_flight: u32,
    #[serde(skip)]
    pub(crate) actionable: bool,
}

impl InstanceReport {
    pub fn new(
        id: u32,
        status: InstanceStatus,
        port: u16,
        started_at: DateTime<Utc>,
        exited_at: Option<DateTime<Utc>>,
        in_flight: u32,
    ) -> Self {
        Self {
            id,
            status: status.to_string(),
            port,
            started_at,
            exited_at,
            in_flight,
            actionable: status.is_actionable(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppReport {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub instances: Vec<InstanceReport>,
}

/// Bring actionable instances to the front without reshuffling either group.
pub fn order_actionable_first(instances: &mut [InstanceReport]) {
    instances.sort_by_key(|report| !report.actionable);
}
