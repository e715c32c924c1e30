use chrono::Utc;

use super::{MeasurementResult, RawMeasurement};
use crate::settings::SpeedTestConfig;

const BITS_PER_GBIT: f64 = 1_000_000_000.0;
const LOW_SPEED_BPS: f64 = 1_000_000.0;

/// Apply the two-tier plausibility bounds and convert to Mbps.
///
/// Typical bounds only add warnings. Reasonable bounds, negative or
/// non-finite values, and a run that moved no data at all mark the result
/// invalid. The `bits_to_mbps` conversion happens here and nowhere else.
pub fn validate(raw: &RawMeasurement, config: &SpeedTestConfig) -> MeasurementResult {
    let (is_valid, warnings) = assess(raw, config);
    MeasurementResult {
        download_mbps: raw.download_bps / config.bits_to_mbps,
        upload_mbps: raw.upload_bps / config.bits_to_mbps,
        ping_ms: raw.ping_ms,
        server_info: raw.server_info.clone(),
        is_valid,
        warnings,
        timestamp: Utc::now(),
    }
}

fn assess(raw: &RawMeasurement, config: &SpeedTestConfig) -> (bool, Vec<String>) {
    let (down, up, ping) = (raw.download_bps, raw.upload_bps, raw.ping_ms);

    if !(down.is_finite() && up.is_finite() && ping.is_finite()) {
        return (false, vec!["Non-numeric values detected - measurement failed".into()]);
    }
    if down < 0.0 || up < 0.0 || ping < 0.0 {
        return (false, vec!["Invalid negative values detected - measurement failed".into()]);
    }
    if down == 0.0 && up == 0.0 {
        return (false, vec!["No data transferred - measurement failed".into()]);
    }

    let max_reasonable_bps = config.max_reasonable_speed_gbps * BITS_PER_GBIT;
    if down > max_reasonable_bps || up > max_reasonable_bps {
        return (
            false,
            vec![format!(
                "Extremely high speed ({:.1} Gbps) exceeds {} Gbps - likely measurement error",
                down.max(up) / BITS_PER_GBIT,
                config.max_reasonable_speed_gbps
            )],
        );
    }
    if ping > config.max_reasonable_ping_ms {
        return (
            false,
            vec![format!(
                "Extremely high ping ({:.0} ms) exceeds {} ms - likely measurement error",
                ping, config.max_reasonable_ping_ms
            )],
        );
    }

    let mut warnings = Vec::new();
    let max_typical_bps = config.max_typical_speed_gbps * BITS_PER_GBIT;
    if down > max_typical_bps || up > max_typical_bps {
        warnings.push(format!(
            "Unusually high speed ({:.1} Gbps) - please verify results",
            down.max(up) / BITS_PER_GBIT
        ));
    }
    if ping > config.max_typical_ping_ms {
        warnings.push(format!(
            "High latency ({:.0} ms) detected - connection may be slow",
            ping
        ));
    }
    if down < LOW_SPEED_BPS && up < LOW_SPEED_BPS {
        warnings.push("Very low speeds detected - check network connection".into());
    }
    (true, warnings)
}
