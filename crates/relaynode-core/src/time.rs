/// Return the current Unix time in milliseconds.
///
/// All wire timestamps (envelopes, heartbeats, metrics samples) use this
/// representation.
pub fn now_ms() -> u64 {
    let ms = chrono::Utc::now().timestamp_millis();
    u64::try_from(ms).unwrap_or(0)
}
