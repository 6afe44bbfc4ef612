//! Vendor SDK abstraction and the concrete Tello UDP implementation: one
//! reader task per socket, pushing frames/events onto a channel.

use async_trait::async_trait;
use drone_bridge_protocol::{DroneConfig, EncoderRate, MotionVector};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub const MTU_BUFFER_SIZE: usize = 1600;

#[derive(Debug, Clone)]
pub enum DriverEvent {
    Connected,
    FlightData { battery: u8 },
    VideoFrame(Vec<u8>),
}

#[async_trait]
pub trait Driver: Send + Sync {
    async fn take_off(&self) -> anyhow::Result<()>;
    async fn land(&self) -> anyhow::Result<()>;
    async fn set_vector(&self, v: MotionVector) -> anyhow::Result<()>;
    async fn start_video(&self) -> anyhow::Result<()>;
    async fn set_video_encoder_rate(&self, rate: EncoderRate) -> anyhow::Result<()>;
    async fn stop(&self) -> anyhow::Result<()>;
}

/// UDP-based Tello driver: command socket to `192.168.10.1:8889`, state
/// listener on `0.0.0.0:8890`, video listener on `0.0.0.0:11111`.
pub struct TelloDriver {
    command_socket: Arc<UdpSocket>,
    last_battery: Arc<AtomicU8>,
}

impl TelloDriver {
    /// Binds the command socket and spawns the state/video listener tasks,
    /// which push events onto `events_tx` for as long as the returned
    /// `TelloDriver` (and the channel's other end) stay alive.
    pub async fn connect(config: &DroneConfig, events_tx: mpsc::Sender<DriverEvent>) -> anyhow::Result<Self> {
        let command_socket = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);
        command_socket.connect(config.command_addr).await?;
        command_socket.send(b"command").await?;

        let last_battery = Arc::new(AtomicU8::new(0));

        spawn_state_listener(config.state_bind, Arc::clone(&last_battery), events_tx.clone()).await?;
        spawn_video_listener(config.video_bind, events_tx).await?;

        Ok(Self { command_socket, last_battery })
    }

    pub fn last_battery(&self) -> u8 {
        self.last_battery.load(Ordering::Relaxed)
    }

    async fn send_text(&self, command: &str) -> anyhow::Result<()> {
        debug!(command, "sending drone command");
        self.command_socket.send(command.as_bytes()).await?;
        Ok(())
    }
}

#[async_trait]
impl Driver for TelloDriver {
    async fn take_off(&self) -> anyhow::Result<()> {
        self.send_text("takeoff").await
    }

    async fn land(&self) -> anyhow::Result<()> {
        self.send_text("land").await
    }

    async fn set_vector(&self, v: MotionVector) -> anyhow::Result<()> {
        let command = format!("rc {} {} {} {}", to_rc(v.x), to_rc(v.y), to_rc(v.z), to_rc(v.r));
        self.send_text(&command).await
    }

    async fn start_video(&self) -> anyhow::Result<()> {
        self.send_text("streamon").await
    }

    async fn set_video_encoder_rate(&self, rate: EncoderRate) -> anyhow::Result<()> {
        let value = match rate {
            EncoderRate::R1_0 => "1",
            EncoderRate::R1_5 => "1.5",
            EncoderRate::R2_0 => "2",
            EncoderRate::R3_0 => "3",
            EncoderRate::R4_0 => "4",
        };
        self.send_text(&format!("setbitrate {value}")).await
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.send_text("land").await.ok();
        Ok(())
    }
}

/// Maps a `[-1.0, 1.0]` stick axis to the Tello `rc` command's `[-100, 100]` integer range.
fn to_rc(axis: f64) -> i32 {
    (axis.clamp(-1.0, 1.0) * 100.0).round() as i32
}

async fn spawn_state_listener(
    bind_addr: std::net::SocketAddr,
    last_battery: Arc<AtomicU8>,
    events_tx: mpsc::Sender<DriverEvent>,
) -> anyhow::Result<()> {
    let socket = UdpSocket::bind(bind_addr).await?;
    info!(%bind_addr, "drone state listener bound");
    tokio::spawn(async move {
        let mut buf = [0u8; MTU_BUFFER_SIZE];
        loop {
            let Ok((len, _)) = socket.recv_from(&mut buf).await else { break };
            if let Some(battery) = parse_battery(&buf[..len]) {
                last_battery.store(battery, Ordering::Relaxed);
                if events_tx.send(DriverEvent::FlightData { battery }).await.is_err() {
                    break;
                }
            }
        }
    });
    Ok(())
}

async fn spawn_video_listener(
    bind_addr: std::net::SocketAddr,
    events_tx: mpsc::Sender<DriverEvent>,
) -> anyhow::Result<()> {
    let socket = UdpSocket::bind(bind_addr).await?;
    info!(%bind_addr, "drone video listener bound");
    tokio::spawn(async move {
        let mut buf = [0u8; MTU_BUFFER_SIZE];
        let mut framer = crate::video_framer::VideoFramer::new();
        loop {
            let Ok((len, _)) = socket.recv_from(&mut buf).await else { break };
            if let Some(frame) = framer.push(&buf[..len]) {
                if events_tx.send(DriverEvent::VideoFrame(frame)).await.is_err() {
                    break;
                }
            }
        }
    });
    Ok(())
}

/// Parse `;`-separated `key:value` state telemetry, extracting `bat`.
fn parse_battery(datagram: &[u8]) -> Option<u8> {
    let text = std::str::from_utf8(datagram).ok()?;
    for pair in text.split(';') {
        let mut parts = pair.splitn(2, ':');
        let (key, value) = (parts.next()?, parts.next()?);
        if key == "bat" {
            return match value.trim().parse::<u8>() {
                Ok(v) => Some(v),
                Err(_) => {
                    warn!(value, "unparsable battery value in state telemetry");
                    None
                }
            };
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_battery_from_state_line() {
        let line = b"pitch:0;roll:0;yaw:0;vgx:0;vgy:0;vgz:0;bat:87;baro:0.00;time:0;";
        assert_eq!(parse_battery(line), Some(87));
    }

    #[test]
    fn parse_battery_missing_key_returns_none() {
        assert_eq!(parse_battery(b"pitch:0;roll:0;"), None);
    }

    #[test]
    fn rc_mapping_clamps_and_scales() {
        assert_eq!(to_rc(1.0), 100);
        assert_eq!(to_rc(-1.0), -100);
        assert_eq!(to_rc(0.5), 50);
        assert_eq!(to_rc(2.0), 100);
        assert_eq!(to_rc(0.0), 0);
    }
}
