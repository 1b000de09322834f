//! Serial transport to the UWB bridge node.
//!
//! `serialport` reads are blocking, so the port lives on a dedicated OS
//! thread bridged to the async side with channels: raw bytes and transport
//! errors flow out as [`SerialEvent`]s, reset/shutdown requests flow in as
//! [`SerialCommand`]s. The thread owns the port exclusively; nothing else
//! touches the device.
//!
//! A reset toggles DTR to power-cycle the bridge node's MCU, then rewrites
//! the start-ranging command once the line settles.

use std::io::{Read, Write};
use std::thread;
use std::time::Duration;

use anyhow::Context;
use serialport::{DataBits, Parity, SerialPort, StopBits};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use uwb_proto::START_RANGING_CMD;

const READ_CHUNK: usize = 1024;
const DTR_SETTLE: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub enum SerialEvent {
    /// Raw bytes read from the port; framing happens downstream.
    Data(Vec<u8>),
    /// Transport-level read failure (not a parse error).
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerialCommand {
    /// DTR-toggle the device and restart the ranging stream.
    Reset,
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct SerialConfig {
    pub path: String,
    pub baud_rate: u32,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            path: "/dev/ttyUSB0".to_string(),
            baud_rate: 115_200,
        }
    }
}

pub struct SerialLink {
    pub events: mpsc::Receiver<SerialEvent>,
    pub commands: mpsc::Sender<SerialCommand>,
}

/// Open the port and start the reader thread. Failing to open is fatal;
/// everything after that is reported through the event channel.
pub fn spawn(cfg: &SerialConfig) -> anyhow::Result<SerialLink> {
    let mut port = serialport::new(&cfg.path, cfg.baud_rate)
        .timeout(Duration::from_millis(100))
        .data_bits(DataBits::Eight)
        .stop_bits(StopBits::One)
        .parity(Parity::None)
        .open()
        .with_context(|| format!("failed to open serial port {}", cfg.path))?;
    info!("🔌 Serial port {} open at {} baud", cfg.path, cfg.baud_rate);

    if let Err(e) = start_ranging(port.as_mut()) {
        warn!("Initial start-ranging write failed: {e}");
    }

    let (event_tx, event_rx) = mpsc::channel(64);
    let (command_tx, command_rx) = mpsc::channel(8);
    thread::Builder::new()
        .name("serial-reader".to_string())
        .spawn(move || reader_loop(port, event_tx, command_rx))
        .context("failed to spawn serial reader thread")?;

    Ok(SerialLink {
        events: event_rx,
        commands: command_tx,
    })
}

fn start_ranging(port: &mut dyn SerialPort) -> anyhow::Result<()> {
    port.write_all(&START_RANGING_CMD)?;
    port.flush()?;
    debug!("Start-ranging command written");
    Ok(())
}

fn reset_device(port: &mut dyn SerialPort) -> anyhow::Result<()> {
    port.write_data_terminal_ready(false)?;
    thread::sleep(DTR_SETTLE);
    port.write_data_terminal_ready(true)?;
    thread::sleep(DTR_SETTLE);
    start_ranging(port)
}

fn reader_loop(
    mut port: Box<dyn SerialPort>,
    events: mpsc::Sender<SerialEvent>,
    mut commands: mpsc::Receiver<SerialCommand>,
) {
    let mut buf = [0u8; READ_CHUNK];
    loop {
        match commands.try_recv() {
            Ok(SerialCommand::Reset) => {
                info!("Resetting UWB bridge node via DTR toggle");
                if let Err(e) = reset_device(port.as_mut()) {
                    error!("Device reset failed: {e}");
                    let _ = events.blocking_send(SerialEvent::Error(e.to_string()));
                }
                continue;
            }
            Ok(SerialCommand::Shutdown) | Err(mpsc::error::TryRecvError::Disconnected) => {
                debug!("Serial reader shutting down");
                return;
            }
            Err(mpsc::error::TryRecvError::Empty) => {}
        }

        match port.read(&mut buf) {
            Ok(0) => {}
            Ok(n) => {
                if events.blocking_send(SerialEvent::Data(buf[..n].to_vec())).is_err() {
                    return;
                }
            }
            // Timeouts are the idle heartbeat of a blocking read loop.
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => {
                if events
                    .blocking_send(SerialEvent::Error(e.to_string()))
                    .is_err()
                {
                    return;
                }
                thread::sleep(Duration::from_millis(100));
            }
        }
    }
}
