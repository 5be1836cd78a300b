//! Forwarder counters.

use log::debug;

#[derive(Debug, Default, Clone)]
pub struct ForwarderStats {
    pub interests_received: u64,
    pub interests_dropped: u64,
    pub interests_satisfied: u64,
    pub interests_propagated: u64,
    pub duplicate_nonces: u64,
    pub content_received: u64,
    pub content_stored: u64,
    pub content_duplicates: u64,
    pub content_collisions: u64,
    pub content_sent: u64,
    pub parse_errors: u64,
    pub faces_created: u64,
    pub faces_destroyed: u64,
}

impl ForwarderStats {
    pub fn log_summary(&self) {
        debug!(
            "stats: interests rcvd={} dropped={} satisfied={} propagated={} dup_nonce={}; \
             content rcvd={} stored={} sent={} dup={} collided={}; \
             faces created={} destroyed={}; parse_errors={}",
            self.interests_received,
            self.interests_dropped,
            self.interests_satisfied,
            self.interests_propagated,
            self.duplicate_nonces,
            self.content_received,
            self.content_stored,
            self.content_sent,
            self.content_duplicates,
            self.content_collisions,
            self.faces_created,
            self.faces_destroyed,
            self.parse_errors,
        );
    }
}
