use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Placement record for one file-storage group, the value type of the
/// gateway's replicated map. Store servers publish these; the gateway routes
/// uploads and downloads off them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreInfo {
    /// Storage group the record describes.
    pub group: String,
    /// Node serving the group.
    pub node_id: String,
    pub ip: String,
    pub http_port: u16,
    /// Files currently held by the group.
    pub file_count: u64,
    /// Bytes used on disk.
    pub used_space: u64,
    /// Last update, epoch millis.
    pub update_time: i64,
}

impl StoreInfo {
    pub fn new(group: &str, node_id: &str, ip: &str, http_port: u16) -> Self {
        Self {
            group: group.to_string(),
            node_id: node_id.to_string(),
            ip: ip.to_string(),
            http_port,
            file_count: 0,
            used_space: 0,
            update_time: Utc::now().timestamp_millis(),
        }
    }

    pub fn touch(&mut self) {
        self.update_time = Utc::now().timestamp_millis();
    }
}
