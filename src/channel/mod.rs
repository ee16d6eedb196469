//! Logical channels and their tenant-qualified wire names.
//!
//! Every transport resolves the name it publishes on through [`wire_channel`],
//! and every subscriber decodes incoming names through [`decode_wire_channel`],
//! so both sides always agree:
//!
//! | Mode | Logical | Wire |
//! |------|---------|------|
//! | single-tenant | `task-updated` | `task-updated` |
//! | multi-tenant  | `task-updated` | `tenant-acme-task-updated` |

mod catalog;

pub use catalog::{is_known_channel, CHANNELS, FORCED_LOGOUT_CHANNEL};

/// Prefix of every tenant-qualified wire channel
pub const TENANT_PREFIX: &str = "tenant-";

/// Map a logical channel and optional tenant to the wire channel name.
pub fn wire_channel(channel: &str, tenant_id: Option<&str>) -> String {
    match tenant_id {
        Some(tenant) => format!("{}{}-{}", TENANT_PREFIX, tenant, channel),
        None => channel.to_string(),
    }
}

/// Decode a wire channel back into `(logical channel, tenant)`.
///
/// `is_channel` recognises logical channel names; the split point between
/// tenant id and channel is the one where the remainder is a known channel and
/// the prefix is a valid tenant id.
pub fn decode_wire_channel<'a, F>(wire: &'a str, is_channel: F) -> Option<(&'a str, Option<&'a str>)>
where
    F: Fn(&str) -> bool,
{
    if let Some(rest) = wire.strip_prefix(TENANT_PREFIX) {
        for (idx, _) in rest.match_indices('-') {
            let (tenant, channel) = (&rest[..idx], &rest[idx + 1..]);
            if is_valid_tenant_id(tenant) && is_channel(channel) {
                return Some((channel, Some(tenant)));
            }
        }
    }

    if is_channel(wire) {
        return Some((wire, None));
    }

    None
}

/// Check a tenant id against `^[a-z0-9]([a-z0-9-]*[a-z0-9])?$`.
pub fn is_valid_tenant_id(id: &str) -> bool {
    let bytes = id.as_bytes();
    let (Some(first), Some(last)) = (bytes.first(), bytes.last()) else {
        return false;
    };

    let alnum = |b: &u8| b.is_ascii_lowercase() || b.is_ascii_digit();

    alnum(first)
        && alnum(last)
        && bytes.iter().all(|b| alnum(b) || *b == b'-')
}

/// Check a logical channel name used on the wire: lowercase words joined by `-`.
pub fn is_valid_channel_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && !name.starts_with('-')
        && !name.ends_with('-')
        && !name.starts_with(TENANT_PREFIX)
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}
