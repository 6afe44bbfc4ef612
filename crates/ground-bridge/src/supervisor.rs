//! Drone supervisor: the command loop, RTCP-driven bitrate/keyframe
//! reactions, the health-check watchdog, and the safety-guard ticker.

use crate::coordinator::RoutineCoordinator;
use crate::drone::{Driver, DriverEvent, TelloDriver};
use crate::state::{ApplicationState, DroneState};
use drone_bridge_protocol::{DroneCommand, DroneConfig, EncoderRate, MotionVector};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{interval, Instant};
use tracing::{info, warn};

const SAFETY_GUARD_TICK: Duration = Duration::from_millis(100);
const SAFETY_GUARD_TIMEOUT: Duration = Duration::from_millis(500);
const HEALTH_CHECK_TICK: Duration = Duration::from_secs(1);
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

fn now_millis() -> i64 {
    // Avoids a direct `Instant::now()` dependency in the guard's shared
    // counter so it can be compared across tasks with a plain integer.
    static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    let start = *START.get_or_init(Instant::now);
    Instant::now().saturating_duration_since(start).as_millis() as i64
}

/// Armed on the first non-zero vector; disarmed on a zero vector or on
/// silence past `SAFETY_GUARD_TIMEOUT`.
struct SafetyGuard {
    active: AtomicBool,
    last_access_millis: AtomicI64,
}

impl SafetyGuard {
    fn new() -> Self {
        Self { active: AtomicBool::new(false), last_access_millis: AtomicI64::new(0) }
    }

    fn record(&self, vector: MotionVector) {
        if vector.is_zero() {
            self.active.store(false, Ordering::SeqCst);
        } else {
            self.last_access_millis.store(now_millis(), Ordering::SeqCst);
            self.active.store(true, Ordering::SeqCst);
        }
    }

    fn is_expired(&self) -> bool {
        self.active.load(Ordering::SeqCst)
            && now_millis() - self.last_access_millis.load(Ordering::SeqCst) > SAFETY_GUARD_TIMEOUT.as_millis() as i64
    }

    fn disarm(&self) {
        self.active.store(false, Ordering::SeqCst);
    }
}

pub struct DroneSupervisor {
    driver: RwLock<Arc<dyn Driver>>,
    drone_config: DroneConfig,
    events_tx: mpsc::Sender<DriverEvent>,
    coordinator: Arc<RoutineCoordinator>,
    app_state: Arc<ApplicationState>,
    safety_guard: Arc<SafetyGuard>,
    last_video_millis: Arc<AtomicI64>,
    last_flight_data_millis: Arc<AtomicI64>,
}

impl DroneSupervisor {
    pub fn new(
        driver: Arc<dyn Driver>,
        drone_config: DroneConfig,
        events_tx: mpsc::Sender<DriverEvent>,
        coordinator: Arc<RoutineCoordinator>,
        app_state: Arc<ApplicationState>,
    ) -> Self {
        let now = now_millis();
        Self {
            driver: RwLock::new(driver),
            drone_config,
            events_tx,
            coordinator,
            app_state,
            safety_guard: Arc::new(SafetyGuard::new()),
            last_video_millis: Arc::new(AtomicI64::new(now)),
            last_flight_data_millis: Arc::new(AtomicI64::new(now)),
        }
    }

    async fn current_driver(&self) -> Arc<dyn Driver> {
        Arc::clone(&*self.driver.read().await)
    }

    /// Stops the current driver and reconnects a fresh `TelloDriver` on the
    /// same event channel, replacing the supervisor's driver handle on success.
    async fn restart_driver(&self) {
        let old = self.current_driver().await;
        if let Err(e) = old.stop().await {
            warn!("failed to stop drone before restart: {e}");
        }
        match TelloDriver::connect(&self.drone_config, self.events_tx.clone()).await {
            Ok(fresh) => {
                *self.driver.write().await = Arc::new(fresh);
                info!("drone driver restarted after starvation");
            }
            Err(e) => warn!("failed to reconnect drone driver: {e}"),
        }
    }

    /// Spawns the command loop, health-check loop, safety-guard ticker, and
    /// the driver-event consumer. Each loop selects against `Stop`.
    pub fn spawn(self: Arc<Self>, driver_events_rx: mpsc::Receiver<DriverEvent>) {
        self.clone().spawn_command_loop();
        self.clone().spawn_safety_guard();
        self.clone().spawn_health_check();
        self.spawn_driver_event_consumer(driver_events_rx);
    }

    fn spawn_command_loop(self: Arc<Self>) {
        tokio::spawn(async move {
            let Some(mut commands_rx) = self.coordinator.take_commands_rx().await else { return };
            let Some(mut rtcp_rx) = self.coordinator.take_rtcp_rx().await else { return };
            let mut stop_rx = self.coordinator.subscribe_stop().await;
            loop {
                tokio::select! {
                    _ = stop_rx.recv() => break,
                    command = commands_rx.recv() => {
                        let Some(command) = command else { break };
                        self.handle_command(command).await;
                    }
                    packet = rtcp_rx.recv() => {
                        let Some(packet) = packet else { break };
                        self.handle_rtcp(packet.packet.as_ref()).await;
                    }
                }
            }
        });
    }

    async fn handle_command(&self, command: DroneCommand) {
        let driver = self.current_driver().await;
        match command {
            DroneCommand::Takeoff => {
                if let Err(e) = driver.take_off().await {
                    warn!("takeoff failed: {e}");
                }
            }
            DroneCommand::Land => {
                if let Err(e) = driver.land().await {
                    warn!("land failed: {e}");
                }
            }
            DroneCommand::Vector(v) => {
                self.safety_guard.record(v);
                // Wire order is (X,Y,Z,R); the driver expects (Y,X,Z,R).
                let swapped = MotionVector { x: v.y, y: v.x, z: v.z, r: v.r };
                if let Err(e) = driver.set_vector(swapped).await {
                    warn!("set_vector failed: {e}");
                }
            }
        }
    }

    async fn handle_rtcp(&self, packet: &(dyn rtcp::packet::Packet + Send + Sync)) {
        let any = packet.as_any();
        if any.is::<rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication>() {
            if let Err(e) = self.current_driver().await.start_video().await {
                warn!("failed to force keyframe on PLI: {e}");
            }
            return;
        }
        if let Some(remb) =
            any.downcast_ref::<rtcp::payload_feedbacks::receiver_estimated_maximum_bitrate::ReceiverEstimatedMaximumBitrate>()
        {
            let mbps = remb.bitrate as f64 / 1_000_000.0;
            let rate = EncoderRate::from_remb_mbps(mbps);
            if let Err(e) = self.current_driver().await.set_video_encoder_rate(rate).await {
                warn!("failed to apply REMB-driven bitrate: {e}");
            }
        }
    }

    fn spawn_safety_guard(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut ticker = interval(SAFETY_GUARD_TICK);
            let mut stop_rx = self.coordinator.subscribe_stop().await;
            loop {
                tokio::select! {
                    _ = stop_rx.recv() => break,
                    _ = ticker.tick() => {
                        if self.safety_guard.is_expired() {
                            // Queued through Commands so handle_command's coordinate
                            // swap runs exactly once instead of racing a direct call here.
                            self.coordinator.send_command(DroneCommand::Vector(MotionVector::ZERO)).await;
                            self.safety_guard.disarm();
                        }
                    }
                }
            }
        });
    }

    fn spawn_health_check(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut ticker = interval(HEALTH_CHECK_TICK);
            let mut stop_rx = self.coordinator.subscribe_stop().await;
            loop {
                tokio::select! {
                    _ = stop_rx.recv() => break,
                    _ = ticker.tick() => {
                        let now = now_millis();
                        let video_silence = now - self.last_video_millis.load(Ordering::SeqCst);
                        let flight_data_silence = now - self.last_flight_data_millis.load(Ordering::SeqCst);
                        let threshold = HEALTH_CHECK_TIMEOUT.as_millis() as i64;
                        if video_silence > threshold || flight_data_silence > threshold {
                            let last_battery = self.app_state.drone_health().1;
                            self.app_state.set_drone_health(false, last_battery);
                            self.app_state.set_drone_state(DroneState::Unknown);
                            warn!(video_silence, flight_data_silence, "drone starvation detected, restarting driver");
                            self.restart_driver().await;
                        } else {
                            self.app_state.set_drone_health(true, self.app_state.drone_health().1);
                        }
                    }
                }
            }
        });
    }

    fn spawn_driver_event_consumer(self: Arc<Self>, mut driver_events_rx: mpsc::Receiver<DriverEvent>) {
        tokio::spawn(async move {
            let mut stop_rx = self.coordinator.subscribe_stop().await;
            loop {
                tokio::select! {
                    _ = stop_rx.recv() => break,
                    event = driver_events_rx.recv() => {
                        let Some(event) = event else { break };
                        match event {
                            DriverEvent::Connected => info!("drone connected"),
                            DriverEvent::FlightData { battery } => {
                                self.last_flight_data_millis.store(now_millis(), Ordering::SeqCst);
                                self.app_state.set_drone_health(true, battery);
                            }
                            DriverEvent::VideoFrame(bytes) => {
                                self.last_video_millis.store(now_millis(), Ordering::SeqCst);
                                self.coordinator.send_frame(bytes::Bytes::from(bytes)).await;
                            }
                        }
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safety_guard_arms_on_nonzero_and_disarms_on_zero() {
        let guard = SafetyGuard::new();
        guard.record(MotionVector { x: 0.5, y: 0.0, z: 0.0, r: 0.0 });
        assert!(guard.active.load(Ordering::SeqCst));
        guard.record(MotionVector::ZERO);
        assert!(!guard.active.load(Ordering::SeqCst));
    }

    #[test]
    fn safety_guard_not_expired_immediately_after_arming() {
        let guard = SafetyGuard::new();
        guard.record(MotionVector { x: 0.5, y: 0.0, z: 0.0, r: 0.0 });
        assert!(!guard.is_expired());
    }

    #[test]
    fn safety_guard_inactive_guard_never_expires() {
        let guard = SafetyGuard::new();
        assert!(!guard.is_expired());
    }
}
