//! End-to-end tests: scripted serial devices in, TCP client out

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use medisense_daemon::transport::{Connector, Transport};
use medisense_daemon::{AcquisitionMode, Bridge};
use ms_core::{BridgeConfig, ChannelConfig, SensorKind};
use ms_error::{MedisenseError, Result};

/// Devices keyed by port path; each emits its frames once, then stays quiet
struct FakeDevices {
    frames: Mutex<Vec<(String, VecDeque<String>)>>,
}

struct FakeDevice {
    frames: VecDeque<String>,
}

impl Transport for FakeDevice {
    fn poll_frame(&mut self) -> io::Result<Option<String>> {
        Ok(self.frames.pop_front())
    }
}

impl Connector for FakeDevices {
    fn open(&self, port: &str, _baud_rate: u32, _read_timeout: Duration) -> Result<Box<dyn Transport>> {
        let mut devices = self.frames.lock();
        match devices.iter_mut().find(|(p, _)| p == port) {
            Some((_, frames)) => Ok(Box::new(FakeDevice {
                frames: std::mem::take(frames),
            })),
            None => Err(MedisenseError::unavailable(port, "no such device")),
        }
    }
}

fn test_config() -> BridgeConfig {
    let mut config = BridgeConfig::default();
    config.server.bind = "127.0.0.1:0".into();
    config.timing.settle_ms = 0;
    config.timing.busy_pause_ms = 5;
    config.timing.idle_pause_ms = 20;
    config.channels = vec![
        ChannelConfig {
            id: "weight".into(),
            port: "/fake/scale".into(),
            baud_rate: 57600,
            kind: Some(SensorKind::Weight),
            enabled: true,
        },
        ChannelConfig {
            id: "validation".into(),
            port: "/fake/card".into(),
            baud_rate: 9600,
            kind: Some(SensorKind::ValidationCode),
            enabled: true,
        },
        ChannelConfig {
            id: "thermo".into(),
            port: "/fake/missing".into(),
            baud_rate: 9600,
            kind: Some(SensorKind::Temperature),
            enabled: true,
        },
    ];
    config
}

fn devices(list: &[(&str, &[&str])]) -> Arc<FakeDevices> {
    Arc::new(FakeDevices {
        frames: Mutex::new(
            list.iter()
                .map(|(port, frames)| {
                    (port.to_string(), frames.iter().map(|f| f.to_string()).collect())
                })
                .collect(),
        ),
    })
}

struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Client {
    async fn connect(bridge: &Bridge) -> Self {
        let stream = TcpStream::connect(bridge.local_addr()).await.unwrap();
        let (reader, writer) = stream.into_split();
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }

    async fn line(&mut self) -> String {
        let mut line = String::new();
        tokio::time::timeout(Duration::from_secs(5), self.reader.read_line(&mut line))
            .await
            .expect("response timed out")
            .unwrap();
        line.trim_end_matches('\n').to_string()
    }

    async fn ask(&mut self, command: &str) -> String {
        self.writer
            .write_all(format!("{}\n", command).as_bytes())
            .await
            .unwrap();
        self.line().await
    }

    /// Repeat `command` until the answer differs from `absent`
    async fn ask_until(&mut self, command: &str, absent: &str) -> String {
        for _ in 0..200 {
            let answer = self.ask(command).await;
            if answer != absent {
                return answer;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{} never changed from {}", command, absent);
    }
}

async fn launch(config: &BridgeConfig, connector: Arc<FakeDevices>) -> (Bridge, CancellationToken) {
    let catalog = config.validate().unwrap();
    let cancel = CancellationToken::new();
    let bridge = Bridge::launch(config, catalog, connector, cancel.clone())
        .await
        .unwrap();
    (bridge, cancel)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_serial_readings_served_over_tcp() {
    let config = test_config();
    let (bridge, cancel) = launch(
        &config,
        devices(&[("/fake/scale", &["abc", "70.4"]), ("/fake/card", &["310502"])]),
    )
    .await;
    assert_eq!(bridge.state().mode(), AcquisitionMode::Serial);

    let mut client = Client::connect(&bridge).await;
    assert_eq!(client.line().await, "Connection au serveur effectuée");

    assert_eq!(client.ask_until("get-poid", "Poids:0").await, "Poids:70.4");
    assert_eq!(client.ask("get-poid").await, "Poids:70.4");

    assert_eq!(
        client.ask_until("get-validation", "Validation:0").await,
        "Validation:310502"
    );
    assert_eq!(client.ask("get-validation").await, "Validation:0");

    assert_eq!(client.ask("get-temperature").await, "Température:0");
    assert_eq!(client.ask("foo").await, "Commande inconnue: foo");
    assert_eq!(client.ask("ping").await, "pong");
    assert_eq!(
        client.ask("debug-ports").await,
        "Ports:/fake/scale:MISSING,/fake/card:MISSING,/fake/missing:MISSING"
    );

    assert_eq!(client.ask("reset-data").await, "Reset:OK");
    assert_eq!(
        client.ask("all-mesure").await,
        "All-Mesure:poids:0:temperature:0:taille:0:validation:0"
    );

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), bridge.wait())
        .await
        .expect("bridge did not shut down");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_falls_back_to_simulation() {
    let mut config = test_config();
    config.timing.simulation_period_ms = 50;
    let (bridge, cancel) = launch(&config, devices(&[])).await;
    assert_eq!(bridge.state().mode(), AcquisitionMode::Simulation);

    let mut client = Client::connect(&bridge).await;
    client.line().await;
    let weight = client.ask_until("get-poid", "Poids:0").await;
    assert!(weight.starts_with("Poids:7"), "unexpected {}", weight);
    assert!(client.ask("status").await.contains("mode=simulation"));

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), bridge.wait())
        .await
        .expect("bridge did not shut down");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_oversized_line_keeps_session() {
    let mut config = test_config();
    config.acquisition.force_simulation = true;
    config.server.max_message_size = 32;
    let (bridge, cancel) = launch(&config, devices(&[])).await;

    let mut client = Client::connect(&bridge).await;
    client.line().await;
    let answer = client.ask(&"x".repeat(2000)).await;
    assert!(answer.starts_with("Erreur serveur: "), "unexpected {}", answer);
    assert_eq!(client.ask("ping").await, "pong");
    assert_eq!(client.ask("status").await.split(',').next(), Some("Status:clients=1"));

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), bridge.wait())
        .await
        .expect("bridge did not shut down");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_closes_idle_sessions() {
    let mut config = test_config();
    config.acquisition.force_simulation = true;
    let (bridge, cancel) = launch(&config, devices(&[])).await;

    let mut client = Client::connect(&bridge).await;
    client.line().await;
    assert_eq!(client.ask("status").await.split(',').next(), Some("Status:clients=1"));

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), bridge.wait())
        .await
        .expect("bridge did not shut down");

    let mut rest = String::new();
    let n = client.reader.read_line(&mut rest).await.unwrap_or(0);
    assert_eq!(n, 0);
}
