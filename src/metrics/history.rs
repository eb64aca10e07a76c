use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Mask a credential for display: short values collapse entirely, longer
/// ones keep a three-character prefix and two-character suffix. No raw key
/// ever reaches the history ring or the admin surface.
pub fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 6 {
        return "***".to_string();
    }
    let prefix: String = chars[..3].iter().collect();
    let suffix: String = chars[chars.len() - 2..].iter().collect();
    format!("{}***{}", prefix, suffix)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryKind {
    Request,
    Response,
}

/// One entry of the recent-traffic ring. `request` entries record the
/// dispatch, `response` entries pair with them carrying status and latency.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub kind: HistoryKind,
    pub timestamp_ms: u64,
    pub upstream_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,
    /// Masked key id.
    pub key_id: String,
}

impl HistoryEntry {
    pub fn request(upstream_id: &str, masked_key: &str) -> Self {
        Self {
            kind: HistoryKind::Request,
            timestamp_ms: unix_ms(),
            upstream_id: upstream_id.to_string(),
            status_code: None,
            elapsed_ms: None,
            key_id: masked_key.to_string(),
        }
    }

    pub fn response(upstream_id: &str, masked_key: &str, status: u16, elapsed_ms: u64) -> Self {
        Self {
            kind: HistoryKind::Response,
            timestamp_ms: unix_ms(),
            upstream_id: upstream_id.to_string(),
            status_code: Some(status),
            elapsed_ms: Some(elapsed_ms),
            key_id: masked_key.to_string(),
        }
    }
}

fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Bounded ring buffer of recent traffic; the oldest entry is evicted when
/// the capacity is reached. Push is a short critical section on the request
/// path; reads happen only from the admin surface.
pub struct HistoryRing {
    inner: Mutex<VecDeque<HistoryEntry>>,
    capacity: usize,
}

impl HistoryRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, entry: HistoryEntry) {
        let mut ring = self.inner.lock().unwrap();
        if ring.len() == self.capacity {
            ring.pop_front();
        }
        ring.push_back(entry);
    }

    /// Newest-last copy of the ring.
    pub fn snapshot(&self) -> Vec<HistoryEntry> {
        self.inner.lock().unwrap().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masking_hides_the_middle() {
        assert_eq!(mask_key("sk-abcdef123456"), "sk-***56");
        assert_eq!(mask_key("short"), "***");
        assert_eq!(mask_key(""), "***");
    }

    #[test]
    fn ring_evicts_oldest() {
        let ring = HistoryRing::new(3);
        for i in 0..5 {
            ring.push(HistoryEntry::request(&format!("u{}", i), "***"));
        }
        let entries = ring.snapshot();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].upstream_id, "u2");
        assert_eq!(entries[2].upstream_id, "u4");
    }

    #[test]
    fn response_entries_carry_status_and_latency() {
        let ring = HistoryRing::new(8);
        ring.push(HistoryEntry::request("u", "a***b"));
        ring.push(HistoryEntry::response("u", "a***b", 200, 12));
        let entries = ring.snapshot();
        assert_eq!(entries[0].kind, HistoryKind::Request);
        assert_eq!(entries[1].status_code, Some(200));
        assert_eq!(entries[1].elapsed_ms, Some(12));
    }
}
