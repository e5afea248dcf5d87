//! Presentation helpers for telemetry values.

use std::fmt;

use colored::{ColoredString, Colorize};
use rover_types::TelemetrySnapshot;

/// Wi-Fi link quality bucket derived from RSSI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalQuality {
    Excellent,
    Good,
    Weak,
}

impl SignalQuality {
    pub fn from_rssi(dbm: i32) -> Self {
        if dbm > -50 {
            SignalQuality::Excellent
        } else if dbm > -70 {
            SignalQuality::Good
        } else {
            SignalQuality::Weak
        }
    }

    fn colored(self) -> ColoredString {
        match self {
            SignalQuality::Excellent => self.to_string().green(),
            SignalQuality::Good => self.to_string().yellow(),
            SignalQuality::Weak => self.to_string().red(),
        }
    }
}

impl fmt::Display for SignalQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SignalQuality::Excellent => "Excellent",
            SignalQuality::Good => "Good",
            SignalQuality::Weak => "Weak",
        })
    }
}

/// `3661000` → `"1h 1m 1s"`.
pub fn format_uptime(uptime_ms: u64) -> String {
    let total = uptime_ms / 1000;
    format!("{}h {}m {}s", total / 3600, (total % 3600) / 60, total % 60)
}

fn or_dash<T: fmt::Display>(value: Option<T>) -> String {
    value.map_or_else(|| "—".to_string(), |v| v.to_string())
}

/// Multi-line status block for one vehicle.
pub fn render_snapshot(snapshot: &TelemetrySnapshot, stale: bool) -> String {
    let mut out = String::new();
    let header = format!("Vehicle {}", snapshot.vehicle_id).bold();
    if stale {
        out.push_str(&format!("  {} {}\n", header, "(stale)".red()));
    } else {
        out.push_str(&format!("  {}\n", header));
    }

    out.push_str(&format!(
        "    Status       : {}\n",
        or_dash(snapshot.status.as_deref())
    ));
    out.push_str(&format!(
        "    Last command : {}\n",
        or_dash(snapshot.last_command.as_deref())
    ));
    out.push_str(&format!("    Speed        : {}\n", or_dash(snapshot.speed)));
    let signal = match snapshot.wifi_rssi {
        Some(rssi) => format!("{rssi} dBm ({})", SignalQuality::from_rssi(rssi).colored()),
        None => "—".to_string(),
    };
    out.push_str(&format!("    Wi-Fi        : {signal}\n"));
    out.push_str(&format!(
        "    Uptime       : {}\n",
        or_dash(snapshot.uptime_ms.map(format_uptime))
    ));
    out.push_str(&format!(
        "    Free heap    : {}\n",
        or_dash(snapshot.free_heap_bytes.map(|b| format!("{b} bytes")))
    ));

    let battery = match (snapshot.battery_percentage, snapshot.battery_voltage) {
        (Some(pct), Some(volts)) => {
            let charging = if snapshot.charging == Some(true) { ", charging" } else { "" };
            format!("{pct}% ({volts:.2} V{charging})")
        }
        _ => "—".to_string(),
    };
    out.push_str(&format!("    Battery      : {battery}\n"));
    out.push_str(&format!(
        "    Received     : {}\n",
        snapshot.received_at.format("%H:%M:%S")
    ));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rover_types::VehicleId;

    #[test]
    fn signal_quality_thresholds() {
        assert_eq!(SignalQuality::from_rssi(-49), SignalQuality::Excellent);
        assert_eq!(SignalQuality::from_rssi(-50), SignalQuality::Good);
        assert_eq!(SignalQuality::from_rssi(-69), SignalQuality::Good);
        assert_eq!(SignalQuality::from_rssi(-70), SignalQuality::Weak);
        assert_eq!(SignalQuality::from_rssi(-95), SignalQuality::Weak);
    }

    #[test]
    fn uptime_formatting() {
        assert_eq!(format_uptime(3_661_000), "1h 1m 1s");
        assert_eq!(format_uptime(0), "0h 0m 0s");
        assert_eq!(format_uptime(59_999), "0h 0m 59s");
        assert_eq!(format_uptime(90_000_000), "25h 0m 0s");
    }

    #[test]
    fn snapshot_rendering_marks_missing_fields_and_staleness() {
        colored::control::set_override(false);
        let mut snap = TelemetrySnapshot::empty(VehicleId::new("A"), Utc::now());
        snap.uptime_ms = Some(3_661_000);
        snap.wifi_rssi = Some(-40);
        snap.status = Some("online".into());

        let text = render_snapshot(&snap, true);
        assert!(text.contains("Vehicle A (stale)"));
        assert!(text.contains("1h 1m 1s"));
        assert!(text.contains("-40 dBm (Excellent)"));
        assert!(text.contains("Status       : online"));
        assert!(text.contains("Battery      : —"));
    }
}
