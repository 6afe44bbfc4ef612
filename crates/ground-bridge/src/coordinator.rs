//! Owns the channel set shared by one signaling session's tasks, plus the
//! socket-release barrier that keeps a restart from racing the previous
//! session's sockets.

use bytes::Bytes;
use drone_bridge_protocol::DroneCommand;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex, Notify};

/// Approximates an unbuffered rendezvous channel: a bounded mpsc with
/// capacity 1 blocks the sender until the single slot is free, which is the
/// closest stable tokio primitive to a true rendezvous.
const RENDEZVOUS_CAPACITY: usize = 1;

pub struct RtcpPacket {
    pub peer_connection_id: String,
    pub packet: Box<dyn rtcp::packet::Packet + Send + Sync>,
}

pub struct RoutineCoordinator {
    inner: Mutex<Option<Channels>>,
    is_stopped: Mutex<bool>,
    socket_release_barrier: AtomicI64,
    barrier_released: Notify,
}

struct Channels {
    commands_tx: mpsc::Sender<DroneCommand>,
    commands_rx: Mutex<Option<mpsc::Receiver<DroneCommand>>>,
    frames_tx: mpsc::Sender<Bytes>,
    frames_rx: Mutex<Option<mpsc::Receiver<Bytes>>>,
    data_channel_out_tx: broadcast::Sender<String>,
    rtcp_tx: mpsc::Sender<RtcpPacket>,
    rtcp_rx: Mutex<Option<mpsc::Receiver<RtcpPacket>>>,
    stop_tx: broadcast::Sender<()>,
}

impl Channels {
    fn new() -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(RENDEZVOUS_CAPACITY);
        let (frames_tx, frames_rx) = mpsc::channel(RENDEZVOUS_CAPACITY);
        let (data_channel_out_tx, _) = broadcast::channel(16);
        let (rtcp_tx, rtcp_rx) = mpsc::channel(RENDEZVOUS_CAPACITY);
        let (stop_tx, _) = broadcast::channel(1);
        Self {
            commands_tx,
            commands_rx: Mutex::new(Some(commands_rx)),
            frames_tx,
            frames_rx: Mutex::new(Some(frames_rx)),
            data_channel_out_tx,
            rtcp_tx,
            rtcp_rx: Mutex::new(Some(rtcp_rx)),
            stop_tx,
        }
    }
}

impl RoutineCoordinator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Some(Channels::new())),
            is_stopped: Mutex::new(false),
            socket_release_barrier: AtomicI64::new(0),
            barrier_released: Notify::new(),
        })
    }

    /// `Init(force)`: (re)creates the channel set when stopped or `force` is set.
    pub async fn init(&self, force: bool) {
        let mut stopped = self.is_stopped.lock().await;
        let mut inner = self.inner.lock().await;
        if *stopped || force || inner.is_none() {
            *inner = Some(Channels::new());
            *stopped = false;
        }
    }

    /// Idempotent: takes the mutex for the whole operation, per the resolved
    /// Open Question on mutexed `Stop`.
    pub async fn stop(&self) {
        let mut stopped = self.is_stopped.lock().await;
        if *stopped {
            return;
        }
        if let Some(channels) = self.inner.lock().await.as_ref() {
            let _ = channels.stop_tx.send(());
        }
        *stopped = true;
    }

    pub async fn is_stopped(&self) -> bool {
        *self.is_stopped.lock().await
    }

    pub async fn subscribe_stop(&self) -> broadcast::Receiver<()> {
        self.inner.lock().await.as_ref().expect("coordinator initialized").stop_tx.subscribe()
    }

    pub async fn send_command(&self, command: DroneCommand) {
        if *self.is_stopped.lock().await {
            return;
        }
        if let Some(channels) = self.inner.lock().await.as_ref() {
            let _ = channels.commands_tx.send(command).await;
        }
    }

    pub async fn take_commands_rx(&self) -> Option<mpsc::Receiver<DroneCommand>> {
        self.inner.lock().await.as_ref()?.commands_rx.lock().await.take()
    }

    pub async fn send_frame(&self, frame: Bytes) {
        if *self.is_stopped.lock().await {
            return;
        }
        if let Some(channels) = self.inner.lock().await.as_ref() {
            let _ = channels.frames_tx.send(frame).await;
        }
    }

    pub async fn take_frames_rx(&self) -> Option<mpsc::Receiver<Bytes>> {
        self.inner.lock().await.as_ref()?.frames_rx.lock().await.take()
    }

    pub async fn send_data_channel_out(&self, text: String) {
        if *self.is_stopped.lock().await {
            return;
        }
        if let Some(channels) = self.inner.lock().await.as_ref() {
            let _ = channels.data_channel_out_tx.send(text);
        }
    }

    pub async fn subscribe_data_channel_out(&self) -> broadcast::Receiver<String> {
        self.inner.lock().await.as_ref().expect("coordinator initialized").data_channel_out_tx.subscribe()
    }

    pub async fn send_rtcp(&self, packet: RtcpPacket) {
        if *self.is_stopped.lock().await {
            return;
        }
        if let Some(channels) = self.inner.lock().await.as_ref() {
            let _ = channels.rtcp_tx.send(packet).await;
        }
    }

    pub async fn take_rtcp_rx(&self) -> Option<mpsc::Receiver<RtcpPacket>> {
        self.inner.lock().await.as_ref()?.rtcp_rx.lock().await.take()
    }

    /// Any task that owns a UDP or WebSocket socket calls this on start.
    pub fn acquire_socket(&self) {
        self.socket_release_barrier.fetch_add(1, Ordering::SeqCst);
    }

    /// ... and this in its cleanup path, exactly once.
    pub fn release_socket(&self) {
        let remaining = self.socket_release_barrier.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining <= 0 {
            self.barrier_released.notify_waiters();
        }
    }

    /// Blocks until the socket-release barrier returns to zero.
    pub async fn wait_until_released(&self) {
        loop {
            if self.socket_release_barrier.load(Ordering::SeqCst) <= 0 {
                return;
            }
            self.barrier_released.notified().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stop_is_idempotent_and_sends_no_panic() {
        let coord = RoutineCoordinator::new();
        coord.stop().await;
        coord.stop().await;
        assert!(coord.is_stopped().await);

        // Sends after stop are silent no-ops, never panics.
        coord.send_command(DroneCommand::Takeoff).await;
        coord.send_frame(Bytes::from_static(b"x")).await;
        coord.send_data_channel_out("noop".to_string()).await;
    }

    #[tokio::test]
    async fn init_after_stop_clears_is_stopped() {
        let coord = RoutineCoordinator::new();
        coord.stop().await;
        coord.init(false).await;
        assert!(!coord.is_stopped().await);
    }

    #[tokio::test]
    async fn socket_release_barrier_waits_for_zero() {
        let coord = RoutineCoordinator::new();
        coord.acquire_socket();
        coord.acquire_socket();

        let waiter_coord = Arc::clone(&coord);
        let waiter = tokio::spawn(async move {
            waiter_coord.wait_until_released().await;
        });

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        coord.release_socket();
        coord.release_socket();
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn command_roundtrips_through_channel() {
        let coord = RoutineCoordinator::new();
        let mut rx = coord.take_commands_rx().await.unwrap();
        coord.send_command(DroneCommand::Takeoff).await;
        assert_eq!(rx.recv().await, Some(DroneCommand::Takeoff));
    }
}
