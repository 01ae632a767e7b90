/// Seconds since the UNIX epoch, saturating to 0 on a pre-epoch clock.
pub fn now_epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Offset of an epoch timestamp within its UTC day.
pub fn day_offset_secs(epoch_secs: u64) -> u64 {
    epoch_secs % 86_400
}
