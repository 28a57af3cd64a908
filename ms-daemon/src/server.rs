//! Measurement server
//!
//! TCP, one command per line and exactly one response line per command.
//!
//! # Limits
//! - **Connection limits**: sessions beyond `max_connections` are refused
//! - **Message size limits**: an oversized line gets the failure response, the
//!   rest of it is skipped and the session continues
//! - **Write timeout**: a client that stops reading is dropped

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use ms_core::{Reading, SensorKind, ServerConfig};
use ms_error::{MedisenseError, Result};
use ms_protocol::{Command, Response};

use crate::state::BridgeState;

/// Write timeout per response
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause after a failed accept so a persistent error does not spin
const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy)]
pub struct ServerLimits {
    pub max_connections: usize,
    pub max_message_size: usize,
}

impl From<&ServerConfig> for ServerLimits {
    fn from(config: &ServerConfig) -> Self {
        Self {
            max_connections: config.max_connections,
            max_message_size: config.max_message_size,
        }
    }
}

pub async fn bind(address: &str) -> Result<TcpListener> {
    let listener = TcpListener::bind(address).await?;
    info!("SERVER: listening on {}", listener.local_addr()?);
    Ok(listener)
}

/// Read one line of at most `max_len` bytes (terminator included).
/// Returns 0 on EOF.
async fn read_line_bounded<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    out: &mut Vec<u8>,
    max_len: usize,
) -> io::Result<usize> {
    out.clear();

    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(out.len());
        }

        let mut take_len = available.len();
        let mut found_newline = false;
        if let Some(pos) = available.iter().position(|b| *b == b'\n') {
            take_len = pos + 1;
            found_newline = true;
        }

        let remaining = max_len.saturating_sub(out.len());
        if take_len > remaining {
            let consume_len = remaining.min(available.len());
            reader.consume(consume_len);
            return Err(io::Error::new(io::ErrorKind::InvalidData, "message too large"));
        }

        out.extend_from_slice(&available[..take_len]);
        reader.consume(take_len);

        if found_newline {
            return Ok(out.len());
        }
    }
}

/// Skip input through the next newline without buffering it.
/// Returns false on EOF.
async fn discard_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> io::Result<bool> {
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(false);
        }
        if let Some(pos) = available.iter().position(|b| *b == b'\n') {
            reader.consume(pos + 1);
            return Ok(true);
        }
        let len = available.len();
        reader.consume(len);
    }
}

/// Accept sessions until cancelled, then wait for every session to end
pub async fn run_server(
    listener: Arc<TcpListener>,
    state: Arc<BridgeState>,
    limits: ServerLimits,
    cancel: CancellationToken,
) {
    info!(
        "SERVER: accepting (max_conn={}, max_msg={})",
        limits.max_connections, limits.max_message_size
    );

    let mut sessions = JoinSet::new();
    let mut total: u64 = 0;

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        let current = state.session_count();
                        if current >= limits.max_connections {
                            warn!("SERVER: connection limit reached ({}), rejecting {}", current, peer);
                            drop(stream);
                            continue;
                        }

                        total += 1;
                        let guard = state.open_session();
                        let state = state.clone();
                        let cancel = cancel.clone();
                        sessions.spawn(async move {
                            handle_client(stream, peer, &state, limits.max_message_size, &cancel).await;
                            drop(guard);
                        });
                    }
                    Err(e) => {
                        error!("SERVER: accept error: {}", e);
                        tokio::time::sleep(ACCEPT_ERROR_PAUSE).await;
                    }
                }
            }
            Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                if let Err(e) = joined {
                    error!("SERVER: session task failed: {}", e);
                }
            }
            _ = cancel.cancelled() => {
                break;
            }
        }
    }

    info!("SHUTDOWN: server stopped accepting, closing {} sessions", sessions.len());
    while sessions.join_next().await.is_some() {}
    info!("SHUTDOWN: server stopped ({} connections served)", total);
}

/// Serve one client until EOF, I/O error or shutdown
async fn handle_client(
    stream: TcpStream,
    peer: SocketAddr,
    state: &BridgeState,
    max_message_size: usize,
    cancel: &CancellationToken,
) {
    debug!("SERVER: client connected: {}", peer);
    let started = Instant::now();

    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line: Vec<u8> = Vec::with_capacity(max_message_size);
    let mut request_count: u64 = 0;

    if send_response(&mut writer, &Response::Greeting).await.is_err() {
        return;
    }

    loop {
        let read_result = tokio::select! {
            r = read_line_bounded(&mut reader, &mut line, max_message_size) => r,
            _ = cancel.cancelled() => break,
        };

        match read_result {
            Ok(0) => break,
            Ok(n) => {
                request_count += 1;
                trace!("SERVER: request #{} from {}: {} bytes", request_count, peer, n);

                let response = match std::str::from_utf8(&line) {
                    Ok(text) => process_request(&Command::parse(text), state),
                    Err(e) => {
                        let err = MedisenseError::protocol(format!("invalid request encoding: {}", e));
                        debug!("SERVER: {} from {}", err, peer);
                        Response::ServerError(err.to_string())
                    }
                };

                if send_response(&mut writer, &response).await.is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                let err = MedisenseError::MessageTooLarge {
                    size: line.len().max(max_message_size + 1),
                    max_size: max_message_size,
                };
                warn!("SERVER: {} from {}, skipping line", err, peer);
                if send_response(&mut writer, &Response::ServerError(err.to_string()))
                    .await
                    .is_err()
                {
                    break;
                }

                let skipped = tokio::select! {
                    r = discard_line(&mut reader) => r,
                    _ = cancel.cancelled() => break,
                };
                match skipped {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => {
                        debug!("SERVER: read error from {}: {}", peer, e);
                        break;
                    }
                }
            }
            Err(e) => {
                debug!("SERVER: read error from {}: {}", peer, e);
                break;
            }
        }
    }

    debug!(
        "SERVER: client disconnected: {}, requests={}, duration={:?}",
        peer,
        request_count,
        started.elapsed()
    );
}

/// Execute one command against the shared state
pub fn process_request(command: &Command, state: &BridgeState) -> Response {
    let registry = state.registry();
    let decimal = |kind: SensorKind| registry.reported(kind).and_then(Reading::as_decimal);

    match command {
        Command::GetWeight => Response::Weight(decimal(SensorKind::Weight)),
        Command::GetTemperature => Response::Temperature(decimal(SensorKind::Temperature)),
        Command::GetHeight => Response::Height(decimal(SensorKind::Height)),
        Command::GetValidation => Response::Validation(
            registry
                .take_reported(SensorKind::ValidationCode)
                .and_then(Reading::as_code),
        ),
        Command::AllMeasures => Response::AllMeasures(registry.measure_all()),
        Command::Reset => {
            registry.reset_all();
            info!("SERVER: registry reset by client");
            Response::ResetOk
        }
        Command::Ping => Response::Pong,
        Command::Status => Response::Status(state.status()),
        Command::DebugPorts => Response::Ports(state.port_presence()),
        Command::Unknown(text) => {
            debug!("SERVER: unknown command {:?}", text);
            Response::UnknownCommand(text.clone())
        }
    }
}

/// Send response with timeout
async fn send_response(writer: &mut OwnedWriteHalf, response: &Response) -> Result<()> {
    let line = response.to_line();
    match timeout(WRITE_TIMEOUT, writer.write_all(line.as_bytes())).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            debug!("SERVER: write error: {}", e);
            Err(MedisenseError::Io(e))
        }
        Err(_) => {
            warn!("SERVER: write timeout");
            Err(MedisenseError::SessionClosed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ms_core::{SensorCatalog, SensorRegistry};
    use ms_protocol::MeasureSnapshot;

    fn state() -> Arc<BridgeState> {
        let registry = Arc::new(SensorRegistry::new(Arc::new(SensorCatalog::builtin().unwrap())));
        Arc::new(BridgeState::new(registry, vec!["/dev/medisense-missing".into()]))
    }

    fn feed(state: &BridgeState, kind: SensorKind, raw: &str) {
        state.registry().accept(kind, raw, Instant::now()).unwrap();
    }

    #[tokio::test]
    async fn test_read_line_bounded() {
        let mut input: &[u8] = b"ping\nget-poid\r\npartial";
        let mut line = Vec::new();
        assert_eq!(read_line_bounded(&mut input, &mut line, 64).await.unwrap(), 5);
        assert_eq!(line, b"ping\n");
        read_line_bounded(&mut input, &mut line, 64).await.unwrap();
        assert_eq!(line, b"get-poid\r\n");
        assert_eq!(read_line_bounded(&mut input, &mut line, 64).await.unwrap(), 7);
        assert_eq!(read_line_bounded(&mut input, &mut line, 64).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_read_line_bounded_rejects_oversized() {
        let mut input: &[u8] = b"0123456789\n";
        let mut line = Vec::new();
        let err = read_line_bounded(&mut input, &mut line, 8).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_oversized_line_is_skipped() {
        let long = format!("{}\nping\n", "x".repeat(40));
        let mut input: &[u8] = long.as_bytes();
        let mut line = Vec::new();
        assert!(read_line_bounded(&mut input, &mut line, 16).await.is_err());
        assert!(discard_line(&mut input).await.unwrap());
        assert_eq!(read_line_bounded(&mut input, &mut line, 16).await.unwrap(), 5);
        assert_eq!(line, b"ping\n");

        let mut input: &[u8] = b"no terminator";
        assert!(!discard_line(&mut input).await.unwrap());
    }

    #[tokio::test]
    async fn test_session_survives_oversized_line() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = state();
        let cancel = CancellationToken::new();

        let session_cancel = cancel.clone();
        let session = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            handle_client(stream, peer, &state, 32, &session_cancel).await;
        });

        let (reader, mut writer) = TcpStream::connect(addr).await.unwrap().into_split();
        let mut reader = BufReader::new(reader);
        let mut answer = String::new();
        reader.read_line(&mut answer).await.unwrap();

        let request = format!("{}\nping\n", "x".repeat(2000));
        writer.write_all(request.as_bytes()).await.unwrap();

        answer.clear();
        reader.read_line(&mut answer).await.unwrap();
        assert!(answer.starts_with("Erreur serveur: Message too large"), "{}", answer);
        answer.clear();
        reader.read_line(&mut answer).await.unwrap();
        assert_eq!(answer, "pong\n");

        drop(writer);
        session.await.unwrap();
    }

    #[tokio::test]
    async fn test_non_utf8_request_is_answered() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = state();
        let cancel = CancellationToken::new();

        let session_cancel = cancel.clone();
        let session = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            handle_client(stream, peer, &state, 64, &session_cancel).await;
        });

        let (reader, mut writer) = TcpStream::connect(addr).await.unwrap().into_split();
        let mut reader = BufReader::new(reader);
        let mut answer = String::new();
        reader.read_line(&mut answer).await.unwrap();

        writer.write_all(b"\xff\xfe\nping\n").await.unwrap();
        answer.clear();
        reader.read_line(&mut answer).await.unwrap();
        assert!(answer.starts_with("Erreur serveur: Protocol error: invalid request encoding"), "{}", answer);
        answer.clear();
        reader.read_line(&mut answer).await.unwrap();
        assert_eq!(answer, "pong\n");

        drop(writer);
        session.await.unwrap();
    }

    #[test]
    fn test_weight_read_is_non_destructive() {
        let state = state();
        feed(&state, SensorKind::Weight, "70.4");
        for _ in 0..2 {
            assert_eq!(
                process_request(&Command::GetWeight, &state).to_string(),
                "Poids:70.4"
            );
        }
    }

    #[test]
    fn test_validation_is_consumed() {
        let state = state();
        feed(&state, SensorKind::ValidationCode, "310502");
        assert_eq!(
            process_request(&Command::GetValidation, &state).to_string(),
            "Validation:310502"
        );
        assert_eq!(
            process_request(&Command::GetValidation, &state).to_string(),
            "Validation:0"
        );
    }

    #[test]
    fn test_zero_reads_as_absent() {
        let state = state();
        feed(&state, SensorKind::Temperature, "0");
        assert_eq!(
            process_request(&Command::GetTemperature, &state).to_string(),
            "Température:0"
        );
        assert_eq!(
            process_request(&Command::GetHeight, &state).to_string(),
            "Taille:0"
        );
    }

    #[test]
    fn test_all_measures_and_reset() {
        let state = state();
        feed(&state, SensorKind::Weight, "72");
        feed(&state, SensorKind::Temperature, "36.6");
        feed(&state, SensorKind::ValidationCode, "310502");

        assert_eq!(
            process_request(&Command::AllMeasures, &state).to_string(),
            "All-Mesure:poids:72.0:temperature:36.6:taille:0:validation:310502"
        );
        assert_eq!(
            process_request(&Command::AllMeasures, &state).to_string(),
            "All-Mesure:poids:72.0:temperature:36.6:taille:0:validation:0"
        );

        assert_eq!(process_request(&Command::Reset, &state), Response::ResetOk);
        assert_eq!(state.registry().raw_snapshot(), MeasureSnapshot::default());
    }

    #[test]
    fn test_diagnostics() {
        let state = state();
        feed(&state, SensorKind::Weight, "70.4");
        assert_eq!(
            process_request(&Command::Status, &state).to_string(),
            "Status:clients=0,mode=serial,poids=70.4,temperature=none,taille=none,validation=none"
        );
        assert_eq!(
            process_request(&Command::DebugPorts, &state).to_string(),
            "Ports:/dev/medisense-missing:MISSING"
        );
        assert_eq!(process_request(&Command::Ping, &state), Response::Pong);
    }

    #[test]
    fn test_unknown_command() {
        let state = state();
        assert_eq!(
            process_request(&Command::parse("foo\n"), &state).to_string(),
            "Commande inconnue: foo"
        );
    }
}
