use scan_dispatch::error::ValidationError;
use scan_dispatch::ports::{parse_ports_spec, validate_ports_spec, PortRange};
use scan_dispatch::target::validate_target;

#[test]
fn parse_singles_and_ranges() {
    let ranges = parse_ports_spec(" 22,443,8000-8002 ").expect("parse ok");
    assert_eq!(
        ranges,
        vec![
            PortRange { start: 22, end: 22 },
            PortRange { start: 443, end: 443 },
            PortRange { start: 8000, end: 8002 },
        ]
    );
    assert_eq!(validate_ports_spec(" 1-65535 ").unwrap(), "1-65535");
}

#[test]
fn invalid_ports_rejected() {
    assert_eq!(parse_ports_spec(""), Err(ValidationError::EmptyPorts));
    assert_eq!(
        parse_ports_spec("0"),
        Err(ValidationError::PortOutOfRange("0".into()))
    );
    assert_eq!(
        parse_ports_spec("22, 80"),
        Err(ValidationError::InvalidPortsFormat)
    );
    assert_eq!(
        parse_ports_spec("9000-8000"),
        Err(ValidationError::InvalidRange("9000-8000".into()))
    );
}

#[test]
fn targets_are_trimmed_and_checked() {
    assert_eq!(validate_target(" scanme.example.org ").unwrap(), "scanme.example.org");
    assert_eq!(validate_target("localhost").unwrap(), "localhost");
    assert_eq!(
        validate_target("$(id)"),
        Err(ValidationError::ForbiddenCharacters)
    );
    assert_eq!(validate_target("999.1.1.1"), Err(ValidationError::InvalidTarget));
}
