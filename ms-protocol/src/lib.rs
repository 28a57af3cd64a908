//! Medisense wire protocol
//!
//! Plain text, one command per line and exactly one response line per command.
//! Response wording is part of the contract with the deployed kiosk clients and
//! must not change.
//!
//! The framing is newline-delimited text over plain TCP. Browser kiosk pages
//! cannot open raw TCP sockets; they reach the bridge through a WebSocket
//! front (for example `websocat` or a reverse proxy) that forwards each
//! message as one line.

use std::fmt;

/// Line sent to every client right after it connects
pub const GREETING: &str = "Connection au serveur effectuée";

/// Default maximum request line size in bytes (terminator included)
pub const MAX_MESSAGE_SIZE: usize = 1024;

/// Zero rendering used for absent or invalid fields
const ABSENT: &str = "0";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    GetWeight,
    GetTemperature,
    GetHeight,
    /// Consume-on-read: clears the validation code it returns
    GetValidation,
    /// Reads every field; clears the validation code
    AllMeasures,
    Reset,
    Ping,
    Status,
    DebugPorts,
    /// Anything else, carrying the request text as received
    Unknown(String),
}

impl Command {
    /// Parse one request line. The line terminator is stripped; surrounding
    /// whitespace is ignored for matching but kept in `Unknown`.
    pub fn parse(line: &str) -> Self {
        let text = line.trim_end_matches(['\r', '\n']);
        match text.trim() {
            "get-poid" => Command::GetWeight,
            "get-temperature" => Command::GetTemperature,
            "get-taille" => Command::GetHeight,
            "get-validation" => Command::GetValidation,
            "all-mesure" => Command::AllMeasures,
            "reset-data" => Command::Reset,
            "ping" => Command::Ping,
            "status" => Command::Status,
            "debug-ports" => Command::DebugPorts,
            _ => Command::Unknown(text.to_string()),
        }
    }
}

/// Latest reported value of every sensor. `None` renders as `0`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MeasureSnapshot {
    pub weight: Option<f64>,
    pub temperature: Option<f64>,
    pub height: Option<f64>,
    pub validation: Option<i64>,
}

/// Diagnostic view returned by `status`. Slots are raw (no zero-sentinel).
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub clients: usize,
    pub mode: String,
    pub slots: MeasureSnapshot,
}

/// Presence of one configured serial device path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortPresence {
    pub path: String,
    pub present: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Greeting,
    Weight(Option<f64>),
    Temperature(Option<f64>),
    Height(Option<f64>),
    Validation(Option<i64>),
    AllMeasures(MeasureSnapshot),
    ResetOk,
    Pong,
    Status(StatusReport),
    Ports(Vec<PortPresence>),
    UnknownCommand(String),
    /// Generic failure when a request handler faults
    ServerError(String),
}

impl Response {
    /// Wire form including the trailing newline
    pub fn to_line(&self) -> String {
        let mut line = self.to_string();
        line.push('\n');
        line
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Response::Greeting => f.write_str(GREETING),
            Response::Weight(v) => write!(f, "Poids:{}", decimal_or_zero(*v)),
            Response::Temperature(v) => write!(f, "Température:{}", decimal_or_zero(*v)),
            Response::Height(v) => write!(f, "Taille:{}", decimal_or_zero(*v)),
            Response::Validation(v) => write!(f, "Validation:{}", code_or_zero(*v)),
            Response::AllMeasures(m) => write!(
                f,
                "All-Mesure:poids:{}:temperature:{}:taille:{}:validation:{}",
                decimal_or_zero(m.weight),
                decimal_or_zero(m.temperature),
                decimal_or_zero(m.height),
                code_or_zero(m.validation),
            ),
            Response::ResetOk => f.write_str("Reset:OK"),
            Response::Pong => f.write_str("pong"),
            Response::Status(s) => write!(
                f,
                "Status:clients={},mode={},poids={},temperature={},taille={},validation={}",
                s.clients,
                s.mode,
                s.slots.weight.map(format_decimal).unwrap_or_else(|| "none".into()),
                s.slots.temperature.map(format_decimal).unwrap_or_else(|| "none".into()),
                s.slots.height.map(format_decimal).unwrap_or_else(|| "none".into()),
                s.slots.validation.map(|c| c.to_string()).unwrap_or_else(|| "none".into()),
            ),
            Response::Ports(ports) => {
                let entries: Vec<String> = ports
                    .iter()
                    .map(|p| format!("{}:{}", p.path, if p.present { "OK" } else { "MISSING" }))
                    .collect();
                write!(f, "Ports:{}", entries.join(","))
            }
            Response::UnknownCommand(text) => write!(f, "Commande inconnue: {}", text),
            Response::ServerError(msg) => write!(f, "Erreur serveur: {}", sanitize_line(msg)),
        }
    }
}

/// Render a decimal reading in shortest round-trip form, always with a
/// fractional part (`70.4`, `72.0`).
pub fn format_decimal(value: f64) -> String {
    let s = value.to_string();
    if s.contains('.') || !value.is_finite() {
        s
    } else {
        format!("{}.0", s)
    }
}

fn decimal_or_zero(value: Option<f64>) -> String {
    value.map(format_decimal).unwrap_or_else(|| ABSENT.to_string())
}

fn code_or_zero(value: Option<i64>) -> String {
    value.map(|c| c.to_string()).unwrap_or_else(|| ABSENT.to_string())
}

/// Keep diagnostics on a single line
fn sanitize_line(msg: &str) -> String {
    msg.replace(['\r', '\n'], " ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_commands() {
        assert_eq!(Command::parse("get-poid\n"), Command::GetWeight);
        assert_eq!(Command::parse("get-temperature\r\n"), Command::GetTemperature);
        assert_eq!(Command::parse("get-taille"), Command::GetHeight);
        assert_eq!(Command::parse("get-validation"), Command::GetValidation);
        assert_eq!(Command::parse("all-mesure"), Command::AllMeasures);
        assert_eq!(Command::parse("reset-data"), Command::Reset);
        assert_eq!(Command::parse("  ping  "), Command::Ping);
        assert_eq!(Command::parse("status"), Command::Status);
        assert_eq!(Command::parse("debug-ports"), Command::DebugPorts);
    }

    #[test]
    fn test_parse_unknown_keeps_text() {
        assert_eq!(Command::parse("foo\n"), Command::Unknown("foo".into()));
        assert_eq!(Command::parse("GET-POID"), Command::Unknown("GET-POID".into()));
        assert_eq!(
            Response::UnknownCommand("foo".into()).to_string(),
            "Commande inconnue: foo"
        );
    }

    #[test]
    fn test_single_field_responses() {
        assert_eq!(Response::Weight(Some(70.4)).to_string(), "Poids:70.4");
        assert_eq!(Response::Weight(None).to_string(), "Poids:0");
        assert_eq!(Response::Temperature(Some(36.5)).to_string(), "Température:36.5");
        assert_eq!(Response::Temperature(None).to_string(), "Température:0");
        assert_eq!(Response::Height(Some(1.75)).to_string(), "Taille:1.75");
        assert_eq!(Response::Validation(Some(310502)).to_string(), "Validation:310502");
        assert_eq!(Response::Validation(None).to_string(), "Validation:0");
    }

    #[test]
    fn test_all_measures_line() {
        let snapshot = MeasureSnapshot {
            weight: Some(72.0),
            temperature: None,
            height: Some(1.8),
            validation: Some(310502),
        };
        assert_eq!(
            Response::AllMeasures(snapshot).to_line(),
            "All-Mesure:poids:72.0:temperature:0:taille:1.8:validation:310502\n"
        );
    }

    #[test]
    fn test_status_and_ports() {
        let report = StatusReport {
            clients: 2,
            mode: "serial".into(),
            slots: MeasureSnapshot {
                weight: Some(70.4),
                ..MeasureSnapshot::default()
            },
        };
        assert_eq!(
            Response::Status(report).to_string(),
            "Status:clients=2,mode=serial,poids=70.4,temperature=none,taille=none,validation=none"
        );

        let ports = vec![
            PortPresence { path: "/dev/ttyUSB0".into(), present: true },
            PortPresence { path: "/dev/ttyACM0".into(), present: false },
        ];
        assert_eq!(
            Response::Ports(ports).to_string(),
            "Ports:/dev/ttyUSB0:OK,/dev/ttyACM0:MISSING"
        );
    }

    #[test]
    fn test_server_error_stays_single_line() {
        let r = Response::ServerError("boom\nsecond line".into());
        assert_eq!(r.to_line(), "Erreur serveur: boom second line\n");
    }

    #[test]
    fn test_format_decimal() {
        assert_eq!(format_decimal(70.4), "70.4");
        assert_eq!(format_decimal(72.0), "72.0");
        assert_eq!(format_decimal(0.95), "0.95");
    }
}
