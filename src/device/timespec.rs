//! Schedule time specifications
//!
//! The device accepts a cron-like 6-field spec (`sec min hours dom mon dow`).
//! A whole day's activation hours are expressed as one comma-joined entry to
//! conserve the device's limited schedule slots.

/// Build the timespec for a set of activation hours.
///
/// Hours are sorted and deduplicated so identical plans always render to the
/// same string.
pub fn build(hours: &[u8]) -> String {
    let mut hours: Vec<u8> = hours.to_vec();
    hours.sort_unstable();
    hours.dedup();
    let list: Vec<String> = hours.iter().map(|h| h.to_string()).collect();
    format!("0 0 {} * * *", list.join(","))
}

/// Normalize a timespec for comparison.
///
/// Installed entries may differ from freshly built ones in whitespace or
/// hour order (hand-edited on the device UI, or created by older versions);
/// comparison must not care.
pub fn normalize(spec: &str) -> String {
    let fields: Vec<&str> = spec.split_whitespace().collect();
    if fields.len() != 6 {
        // Not the shape we build; compare with collapsed whitespace only
        return fields.join(" ");
    }

    let mut normalized: Vec<String> = fields.iter().map(|f| f.to_string()).collect();
    let hour_field = fields[2];
    let mut hours: Vec<u32> = Vec::new();
    let mut all_numeric = true;
    for part in hour_field.split(',') {
        match part.trim().parse::<u32>() {
            Ok(h) => hours.push(h),
            Err(_) => {
                all_numeric = false;
                break;
            }
        }
    }
    if all_numeric && !hours.is_empty() {
        hours.sort_unstable();
        hours.dedup();
        let list: Vec<String> = hours.iter().map(|h| h.to_string()).collect();
        normalized[2] = list.join(",");
    }
    normalized.join(" ")
}

/// Whether two timespecs mean the same schedule.
pub fn equivalent(a: &str, b: &str) -> bool {
    normalize(a) == normalize(b)
}
