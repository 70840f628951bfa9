use crate::error::ValidationError;

/// Inclusive port range; a single port has `start == end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

/// Parse a scanner port specification such as `22,80,8000-8100`.
///
/// Grammar: `N` or `N-M`, comma separated, no whitespace, 1 to 5 digits per
/// number. Every port must be in 1..=65535 and ranges must not be reversed.
/// Surrounding whitespace is trimmed.
pub fn parse_ports_spec(s: &str) -> Result<Vec<PortRange>, ValidationError> {
    let spec = s.trim();
    if spec.is_empty() {
        return Err(ValidationError::EmptyPorts);
    }

    let mut out = Vec::new();
    for segment in spec.split(',') {
        let range = match segment.split_once('-') {
            Some((a, b)) => {
                let start = parse_port_str(a, segment)?;
                let end = parse_port_str(b, segment)?;
                if start > end {
                    return Err(ValidationError::InvalidRange(segment.to_string()));
                }
                PortRange { start, end }
            }
            None => {
                let p = parse_port_str(segment, segment)?;
                PortRange { start: p, end: p }
            }
        };
        out.push(range);
    }
    Ok(out)
}

/// Validate and normalise a port specification for the scanner command line.
pub fn validate_ports_spec(s: &str) -> Result<String, ValidationError> {
    parse_ports_spec(s)?;
    Ok(s.trim().to_string())
}

fn parse_port_str(s: &str, segment: &str) -> Result<u16, ValidationError> {
    if s.is_empty() || s.len() > 5 || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ValidationError::InvalidPortsFormat);
    }
    // at most 5 digits, always fits
    let val: u32 = s.parse().map_err(|_| ValidationError::InvalidPortsFormat)?;
    if val == 0 || val > 65535 {
        return Err(ValidationError::PortOutOfRange(segment.to_string()));
    }
    Ok(val as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_singles_and_ranges() {
        let ranges = parse_ports_spec("22,80,8000-8100").unwrap();
        assert_eq!(
            ranges,
            vec![
                PortRange { start: 22, end: 22 },
                PortRange { start: 80, end: 80 },
                PortRange { start: 8000, end: 8100 },
            ]
        );
    }

    #[test]
    fn overlapping_ranges_are_accepted() {
        let ranges = parse_ports_spec("80-90,85,88-100").unwrap();
        assert_eq!(ranges.len(), 3);
    }

    #[test]
    fn reversed_range_rejected() {
        assert_eq!(
            parse_ports_spec("100-10"),
            Err(ValidationError::InvalidRange("100-10".into()))
        );
    }

    #[test]
    fn out_of_range_rejected() {
        assert_eq!(
            parse_ports_spec("70000"),
            Err(ValidationError::PortOutOfRange("70000".into()))
        );
        assert_eq!(
            parse_ports_spec("1-65536"),
            Err(ValidationError::PortOutOfRange("1-65536".into()))
        );
        assert!(parse_ports_spec("0").is_err());
    }

    #[test]
    fn malformed_rejected() {
        for bad in ["", "  ", "22,", ",22", "22 ,80", "a", "1-2-3", "123456", "22;80", "-5"] {
            assert!(parse_ports_spec(bad).is_err(), "{bad:?}");
        }
    }

    #[test]
    fn validate_trims() {
        assert_eq!(validate_ports_spec("  22,443 ").unwrap(), "22,443");
    }
}
