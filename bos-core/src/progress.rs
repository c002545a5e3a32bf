//! Transfer progress reporting through the log.

/// Returns a progress callback that logs every 25% of a transfer once.
pub fn log_progress(label: &str) -> impl FnMut(u64, u64) + '_ {
    let mut last_quarter = 0u64;
    move |done, total| {
        if total == 0 {
            return;
        }
        let quarter = done.saturating_mul(4) / total;
        if quarter > last_quarter {
            last_quarter = quarter;
            log::debug!("{}: {}% ({} of {} bytes)", label, quarter * 25, done, total);
        }
    }
}

/// Human readable byte count.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_are_scaled() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(40 * 1024 * 1024), "40.0 MiB");
    }

    #[test]
    fn unknown_totals_are_ignored() {
        let mut cb = log_progress("x");
        cb(10, 0);
        cb(10, 10);
    }
}
