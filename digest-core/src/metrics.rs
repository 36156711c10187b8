// ABOUTME: Counter helpers over the metrics facade
// ABOUTME: No-ops unless the embedding process installs a recorder

use metrics::counter;

pub fn record_upstream_call(method: &'static str) {
    counter!("slack_digest_upstream_calls_total", "method" => method).increment(1);
}

pub fn record_rate_limited(method: &'static str) {
    counter!("slack_digest_rate_limited_total", "method" => method).increment(1);
}

/// `outcome` is one of `hit`, `miss`, `stale`
pub fn record_cache_lookup(outcome: &'static str) {
    counter!("slack_digest_cache_lookups_total", "outcome" => outcome).increment(1);
}

pub fn record_skipped_conversation(kind: &'static str) {
    counter!("slack_digest_skipped_conversations_total", "kind" => kind).increment(1);
}

pub fn record_digest(mode: &'static str) {
    counter!("slack_digest_digests_total", "mode" => mode).increment(1);
}
