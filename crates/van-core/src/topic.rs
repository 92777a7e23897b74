//! Topic naming for published telemetry
//!
//! Device names are human labels ("Victron MPPT 100/50") and may contain
//! characters that are structural in a bus topic. They are slugged before
//! use: ASCII letters are lowercased, ASCII digits kept, and every other run
//! of characters collapses to a single `_`. Leading and trailing separators
//! are dropped, so "Victron MPPT 100/50" becomes `victron_mppt_100_50`.

/// Slug used when a name contains no ASCII alphanumerics at all
const EMPTY_SLUG: &str = "device";

/// Normalize a device name into a topic-safe slug
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_sep = false;

    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_sep && !slug.is_empty() {
                slug.push('_');
            }
            pending_sep = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_sep = true;
        }
    }

    if slug.is_empty() {
        EMPTY_SLUG.to_string()
    } else {
        slug
    }
}

/// Topic carrying one device's status heartbeat
pub fn status_topic(system: &str, device_name: &str) -> String {
    format!("{}/devices/{}/status", system, slugify(device_name))
}

/// Topic carrying the agent's own online/offline marker
pub fn agent_status_topic(system: &str) -> String {
    format!("{}/agent/status", system)
}
