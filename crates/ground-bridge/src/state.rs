//! Atomic application-state snapshot plus the `/state` WebSocket broadcaster:
//! read-heavy shared state with infrequent writes, pushed on a periodic
//! select loop alongside client replies.

use axum::extract::ws::{Message, WebSocket};
use serde::Serialize;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::interval;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AppState {
    Init,
    Started,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DroneState {
    Unknown,
    Ready,
    Land,
    Takeoff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DroneHealthStatus {
    Ok,
    Ng,
}

fn encode_app_state(state: AppState) -> u8 {
    match state {
        AppState::Init => 0,
        AppState::Started => 1,
    }
}

fn decode_app_state(raw: u8) -> AppState {
    if raw == 1 { AppState::Started } else { AppState::Init }
}

fn encode_drone_state(state: DroneState) -> u8 {
    match state {
        DroneState::Unknown => 0,
        DroneState::Ready => 1,
        DroneState::Land => 2,
        DroneState::Takeoff => 3,
    }
}

fn decode_drone_state(raw: u8) -> DroneState {
    match raw {
        1 => DroneState::Ready,
        2 => DroneState::Land,
        3 => DroneState::Takeoff,
        _ => DroneState::Unknown,
    }
}

/// All fields use atomic stores so any reader observes a consistent
/// snapshot without locking; only `start`/`stop` take the mutex.
pub struct ApplicationState {
    app_state: AtomicU8,
    drone_state: AtomicU8,
    drone_health_ok: AtomicU8,
    battery: AtomicU8,
    start_key: Mutex<Option<String>>,
    session_key: Mutex<Option<String>>,
    access_key: Mutex<Option<String>>,
    start_stop_mutex: Mutex<()>,
    generation: AtomicU64,
}

impl ApplicationState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            app_state: AtomicU8::new(encode_app_state(AppState::Init)),
            drone_state: AtomicU8::new(encode_drone_state(DroneState::Unknown)),
            drone_health_ok: AtomicU8::new(1),
            battery: AtomicU8::new(0),
            start_key: Mutex::new(None),
            session_key: Mutex::new(None),
            access_key: Mutex::new(None),
            start_stop_mutex: Mutex::new(()),
            generation: AtomicU64::new(0),
        })
    }

    pub fn app_state(&self) -> AppState {
        decode_app_state(self.app_state.load(Ordering::Relaxed))
    }

    pub fn set_app_state(&self, state: AppState) {
        self.app_state.store(encode_app_state(state), Ordering::Relaxed);
    }

    pub fn drone_state(&self) -> DroneState {
        decode_drone_state(self.drone_state.load(Ordering::Relaxed))
    }

    pub fn set_drone_state(&self, state: DroneState) {
        self.drone_state.store(encode_drone_state(state), Ordering::Relaxed);
    }

    pub fn set_drone_health(&self, ok: bool, battery: u8) {
        self.drone_health_ok.store(ok as u8, Ordering::Relaxed);
        self.battery.store(battery, Ordering::Relaxed);
    }

    pub fn drone_health(&self) -> (DroneHealthStatus, u8) {
        let status =
            if self.drone_health_ok.load(Ordering::Relaxed) == 1 { DroneHealthStatus::Ok } else { DroneHealthStatus::Ng };
        (status, self.battery.load(Ordering::Relaxed))
    }

    pub async fn start_key(&self) -> Option<String> {
        self.start_key.lock().await.clone()
    }

    pub async fn set_start_key(&self, key: Option<String>) {
        *self.start_key.lock().await = key;
    }

    pub async fn session_key(&self) -> Option<String> {
        self.session_key.lock().await.clone()
    }

    pub async fn set_session_key(&self, key: Option<String>) {
        *self.session_key.lock().await = key;
    }

    pub async fn access_key(&self) -> Option<String> {
        self.access_key.lock().await.clone()
    }

    pub async fn set_access_key(&self, key: Option<String>) {
        *self.access_key.lock().await = key;
    }

    /// Holds the start/stop mutex for the whole critical section, matching
    /// `restartApp`'s "under the app start/stop mutex" requirement.
    pub async fn lock_start_stop(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.start_stop_mutex.lock().await
    }

    pub fn bump_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn snapshot(&self) -> AppInfoSnapshot {
        let (health, battery) = self.drone_health();
        AppInfoSnapshot {
            message_type: "appInfo",
            session_key: None,
            state: self.app_state(),
            drone_state: self.drone_state(),
            drone_health: DroneHealthSnapshot { health, battery_level: battery },
        }
    }
}

#[derive(Serialize)]
pub struct DroneHealthSnapshot {
    pub health: DroneHealthStatus,
    #[serde(rename = "batteryLevel")]
    pub battery_level: u8,
}

#[derive(Serialize)]
pub struct AppInfoSnapshot {
    #[serde(rename = "messageType")]
    message_type: &'static str,
    #[serde(rename = "sessionKey", skip_serializing_if = "Option::is_none")]
    session_key: Option<String>,
    state: AppState,
    #[serde(rename = "droneState")]
    drone_state: DroneState,
    #[serde(rename = "droneHealth")]
    drone_health: DroneHealthSnapshot,
}

const BROADCAST_INTERVAL: Duration = Duration::from_secs(1);

/// Drives one `/state` WebSocket connection: pushes a snapshot once per
/// second and answers `{messageType:"checkSessionKey"}` inline. A mutex
/// guards the socket because the two concerns share it.
pub async fn run_state_broadcaster(socket: WebSocket, app_state: Arc<ApplicationState>) {
    let socket = Arc::new(Mutex::new(socket));
    let mut ticker = interval(BROADCAST_INTERVAL);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let mut snapshot = app_state.snapshot();
                snapshot.session_key = app_state.session_key().await;
                let Ok(json) = serde_json::to_string(&snapshot) else { continue };
                let mut guard = socket.lock().await;
                if guard.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            incoming = async { socket.lock().await.recv().await } => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if text.contains("checkSessionKey") {
                            let session_key = app_state.session_key().await.unwrap_or_default();
                            let reply = serde_json::json!({
                                "messageType": "checkSessionKey",
                                "sessionKey": session_key,
                            });
                            let mut guard = socket.lock().await;
                            if guard.send(Message::Text(reply.to_string().into())).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_init_and_unknown() {
        let state = ApplicationState::new();
        assert_eq!(state.app_state(), AppState::Init);
        assert_eq!(state.drone_state(), DroneState::Unknown);
        assert_eq!(state.drone_health().0, DroneHealthStatus::Ok);
    }

    #[test]
    fn drone_health_transitions_track_battery() {
        let state = ApplicationState::new();
        state.set_drone_health(false, 42);
        let (health, battery) = state.drone_health();
        assert_eq!(health, DroneHealthStatus::Ng);
        assert_eq!(battery, 42);
    }

    #[tokio::test]
    async fn start_key_roundtrips_under_lock() {
        let state = ApplicationState::new();
        state.set_start_key(Some("abc".to_string())).await;
        assert_eq!(state.start_key().await.as_deref(), Some("abc"));
    }

    #[test]
    fn snapshot_serializes_expected_shape() {
        let state = ApplicationState::new();
        state.set_app_state(AppState::Started);
        state.set_drone_state(DroneState::Ready);
        let snapshot = state.snapshot();
        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(json.contains(r#""messageType":"appInfo""#));
        assert!(json.contains(r#""state":"STARTED""#));
        assert!(json.contains(r#""droneState":"READY""#));
    }
}
