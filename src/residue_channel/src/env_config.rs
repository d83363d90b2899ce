//! Environment-variable parsing shared by `ChannelOptions::from_env`.
//!
//! Helpers take a lookup closure rather than reading the process
//! environment directly so option overlays can be exercised in tests.

/// `1`, `true`, `yes` or `on` (case-insensitive, trimmed).
pub(crate) fn truthy<F>(lookup: &F, var_name: &str) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    lookup(var_name)
        .map(|raw| {
            let normalized = raw.trim().to_ascii_lowercase();
            normalized == "1" || normalized == "true" || normalized == "yes" || normalized == "on"
        })
        .unwrap_or(false)
}

/// Strictly positive `u32`; anything else is ignored with a warning.
pub(crate) fn positive_u32<F>(lookup: &F, var_name: &str) -> Option<u32>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(var_name)?;
    match raw.trim().parse::<u32>() {
        Ok(value) if value > 0 => Some(value),
        _ => {
            log::warn!("ignoring {var_name}={raw:?}: expected a positive integer");
            None
        }
    }
}

pub(crate) fn index<F>(lookup: &F, var_name: &str) -> Option<usize>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(var_name)?;
    match raw.trim().parse::<usize>() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("ignoring {var_name}={raw:?}: expected an adapter index");
            None
        }
    }
}
