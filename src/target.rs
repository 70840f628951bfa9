use crate::error::ValidationError;

const MAX_TARGET_LEN: usize = 255;
const MAX_HOSTNAME_LEN: usize = 253;

/// Accepts a dotted IPv4 address, `localhost`, or a DNS hostname with an
/// alphabetic top-level label. Returns the trimmed target.
pub fn validate_target(value: &str) -> Result<String, ValidationError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::EmptyTarget);
    }
    if trimmed.len() > MAX_TARGET_LEN {
        return Err(ValidationError::TargetTooLong);
    }
    if !trimmed
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | ':'))
    {
        return Err(ValidationError::ForbiddenCharacters);
    }
    if is_ipv4(trimmed) || is_hostname(trimmed) {
        return Ok(trimmed.to_string());
    }
    Err(ValidationError::InvalidTarget)
}

/// Dotted quad, each octet 0..=255 (leading zeros tolerated).
pub fn is_ipv4(s: &str) -> bool {
    let octets: Vec<&str> = s.split('.').collect();
    octets.len() == 4
        && octets.iter().all(|o| {
            !o.is_empty()
                && o.len() <= 3
                && o.bytes().all(|b| b.is_ascii_digit())
                && o.parse::<u16>().map(|n| n <= 255).unwrap_or(false)
        })
}

pub fn is_hostname(s: &str) -> bool {
    if s.eq_ignore_ascii_case("localhost") {
        return true;
    }
    if s.len() > MAX_HOSTNAME_LEN {
        return false;
    }
    let labels: Vec<&str> = s.split('.').collect();
    let Some((tld, rest)) = labels.split_last() else {
        return false;
    };
    if rest.is_empty() {
        return false;
    }
    let tld_ok = (2..=63).contains(&tld.len()) && tld.bytes().all(|b| b.is_ascii_alphabetic());
    tld_ok && rest.iter().all(|label| is_label(label))
}

fn is_label(label: &str) -> bool {
    (1..=63).contains(&label.len())
        && !label.starts_with('-')
        && !label.ends_with('-')
        && label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
}
