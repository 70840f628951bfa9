//! Turns scanner output lines into typed records.
//!
//! Recognised shapes (case-insensitive):
//! - `[+] Puerto 22/tcp -> open`
//! - `[-] Puerto 23/tcp -> closed (refused)`
//! - `Banner: OpenSSH 8.9`
//!
//! Anything else is not an error; it simply yields `None` and is kept only
//! as raw text by the caller.

use regex::Regex;

use crate::types::Protocol;

/// A port line as reported by the scanner, before reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortLine {
    pub port: u16,
    pub protocol: Protocol,
    pub state: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScannerLine {
    Port(PortLine),
    /// Applies to the most recently reported port; the caller tracks which.
    Banner(String),
}

/// Contract between the runner and whatever understands the scanner's output.
pub trait LineParser: Send + Sync {
    fn parse(&self, line: &str) -> Option<ScannerLine>;
}

pub struct PatternParser {
    open_re: Regex,
    closed_re: Regex,
    banner_re: Regex,
}

impl PatternParser {
    pub fn new() -> Self {
        Self {
            open_re: Regex::new(r"(?i)\[\+\]\s+Puerto\s+(\d+)/(tcp|udp)\s*->\s*(\w+)")
                .expect("open pattern is valid"),
            closed_re: Regex::new(r"(?i)\[-\]\s+Puerto\s+(\d+)/(tcp|udp)\s*->\s*(.+)")
                .expect("closed pattern is valid"),
            banner_re: Regex::new(r"(?i)^\s*Banner:\s*(.+)$").expect("banner pattern is valid"),
        }
    }

    fn port_line(caps: &regex::Captures<'_>) -> Option<PortLine> {
        let port: u32 = caps.get(1)?.as_str().parse().ok()?;
        if port == 0 || port > u16::MAX as u32 {
            return None;
        }
        let protocol = if caps.get(2)?.as_str().eq_ignore_ascii_case("udp") {
            Protocol::Udp
        } else {
            Protocol::Tcp
        };
        let state = caps.get(3)?.as_str().trim().to_lowercase();
        Some(PortLine {
            port: port as u16,
            protocol,
            state,
        })
    }
}

impl Default for PatternParser {
    fn default() -> Self {
        Self::new()
    }
}

impl LineParser for PatternParser {
    fn parse(&self, line: &str) -> Option<ScannerLine> {
        if let Some(caps) = self.open_re.captures(line) {
            return Self::port_line(&caps).map(ScannerLine::Port);
        }
        if let Some(caps) = self.closed_re.captures(line) {
            return Self::port_line(&caps).map(ScannerLine::Port);
        }
        let banner = self.banner_re.captures(line)?.get(1)?.as_str().trim();
        if banner.is_empty() {
            return None;
        }
        Some(ScannerLine::Banner(banner.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port(line: &str) -> PortLine {
        match PatternParser::new().parse(line) {
            Some(ScannerLine::Port(p)) => p,
            other => panic!("expected port line for {line:?}, got {other:?}"),
        }
    }

    #[test]
    fn open_line() {
        let p = port("[+] Puerto 22/tcp -> open");
        assert_eq!(p.port, 22);
        assert_eq!(p.protocol, Protocol::Tcp);
        assert_eq!(p.state, "open");
    }

    #[test]
    fn case_insensitive_and_udp() {
        let p = port("[+] PUERTO 53/UDP -> OPEN|filtered");
        assert_eq!(p.port, 53);
        assert_eq!(p.protocol, Protocol::Udp);
        // Positive lines keep only the first word of the state.
        assert_eq!(p.state, "open");
    }

    #[test]
    fn closed_line_keeps_free_text() {
        let p = port("[-] Puerto 23/tcp -> Closed (connection refused)  ");
        assert_eq!(p.port, 23);
        assert_eq!(p.state, "closed (connection refused)");
    }

    #[test]
    fn banner_line() {
        let parsed = PatternParser::new().parse("   Banner:   OpenSSH 8.9  ");
        assert_eq!(parsed, Some(ScannerLine::Banner("OpenSSH 8.9".into())));
    }

    #[test]
    fn unrecognised_lines_are_ignored() {
        let parser = PatternParser::new();
        for line in [
            "",
            "Escaneando 127.0.0.1 ...",
            "[+] Puerto abc/tcp -> open",
            "[+] Puerto 22/sctp -> open",
            "Banner:",
            "[*] done",
        ] {
            assert_eq!(parser.parse(line), None, "{line:?}");
        }
    }

    #[test]
    fn out_of_range_port_is_ignored() {
        let parser = PatternParser::new();
        assert_eq!(parser.parse("[+] Puerto 0/tcp -> open"), None);
        assert_eq!(parser.parse("[+] Puerto 70000/tcp -> open"), None);
        assert_eq!(port("[+] Puerto 65535/tcp -> open").port, 65535);
    }
}
