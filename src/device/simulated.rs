//! In-process stand-in for a bluetooth stack.
//!
//! Advertisements are scripted with a delay relative to the start of each scan, notifications are
//! pushed by the test (or demo) driver and every write is recorded. Used by the tests and by the
//! `--simulate` flag of the binary, so the whole lifecycle can be exercised without a radio.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use async_trait::async_trait;
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::StreamExt;
use log::debug;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::device::constants::make_inhaler_string_uuid;
use crate::device::transport::{NameFilter, NotificationStream, Transport};
use crate::device::types::DeviceHandle;
use crate::error::TransportError;

#[derive(Debug, Clone)]
struct Advertisement {
    name: String,
    address: String,
    after: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedConnection {
    pub address: String,
}

#[derive(Default)]
struct SimInner {
    advertisements: Vec<Advertisement>,
    characteristics: Vec<Uuid>,
    connect_delay: Duration,
    subscribe_delay: Duration,
    // how long a connection status check takes
    status_delay: Duration,
    connect_failure: Option<String>,
    subscribe_failure: Option<String>,
    write_failure: Option<String>,
    connected: bool,
    subscriber: Option<UnboundedSender<Vec<u8>>>,
    // notifications pushed before anyone subscribed
    pending: Vec<Vec<u8>>,
    writes: Vec<(Uuid, Vec<u8>)>,
    scans: usize,
    cancelled_scans: usize,
    connects: usize,
    aborted_connects: usize,
    unsubscribes: usize,
    disconnects: usize,
}

#[derive(Clone)]
pub struct SimulatedTransport {
    inner: Arc<Mutex<SimInner>>,
}

impl Default for SimulatedTransport {
    fn default() -> Self {
        SimulatedTransport::new()
    }
}

impl SimulatedTransport {
    pub fn new() -> Self {
        let inner = SimInner {
            characteristics: vec![make_inhaler_string_uuid()],
            ..SimInner::default()
        };

        SimulatedTransport { inner: Arc::new(Mutex::new(inner)) }
    }

    fn inner(&self) -> MutexGuard<'_, SimInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Let a peripheral advertise `after` the start of every scan.
    pub fn advertise(&self, name: &str, address: &str, after: Duration) -> &Self {
        self.inner().advertisements.push(Advertisement {
            name: name.to_string(),
            address: address.to_string(),
            after,
        });
        self
    }

    pub fn set_characteristics(&self, characteristics: Vec<Uuid>) -> &Self {
        self.inner().characteristics = characteristics;
        self
    }

    pub fn set_connect_delay(&self, delay: Duration) -> &Self {
        self.inner().connect_delay = delay;
        self
    }

    pub fn set_subscribe_delay(&self, delay: Duration) -> &Self {
        self.inner().subscribe_delay = delay;
        self
    }

    pub fn set_status_delay(&self, delay: Duration) -> &Self {
        self.inner().status_delay = delay;
        self
    }

    pub fn fail_connect(&self, reason: &str) -> &Self {
        self.inner().connect_failure = Some(reason.to_string());
        self
    }

    pub fn fail_subscribe(&self, reason: &str) -> &Self {
        self.inner().subscribe_failure = Some(reason.to_string());
        self
    }

    pub fn fail_write(&self, reason: &str) -> &Self {
        self.inner().write_failure = Some(reason.to_string());
        self
    }

    /// Push a notification from the peripheral. Queued until a subscription exists.
    pub fn notify(&self, payload: &[u8]) {
        let mut inner = self.inner();
        let delivered = match &inner.subscriber {
            Some(sender) => sender.unbounded_send(payload.to_vec()).is_ok(),
            None => false,
        };

        if !delivered {
            inner.pending.push(payload.to_vec());
        }
    }

    /// The peripheral goes out of range.
    pub fn drop_link(&self) {
        let mut inner = self.inner();
        inner.connected = false;
        inner.subscriber = None;
    }

    pub fn is_subscribed(&self) -> bool {
        self.inner().subscriber.is_some()
    }

    pub fn writes(&self) -> Vec<(Uuid, Vec<u8>)> {
        self.inner().writes.clone()
    }

    pub fn scan_count(&self) -> usize {
        self.inner().scans
    }

    pub fn cancelled_scan_count(&self) -> usize {
        self.inner().cancelled_scans
    }

    pub fn connect_count(&self) -> usize {
        self.inner().connects
    }

    pub fn aborted_connect_count(&self) -> usize {
        self.inner().aborted_connects
    }

    pub fn unsubscribe_count(&self) -> usize {
        self.inner().unsubscribes
    }

    pub fn disconnect_count(&self) -> usize {
        self.inner().disconnects
    }

    fn record_cancelled_scan(&self) -> Result<Option<DeviceHandle>, TransportError> {
        debug!("Simulated scan cancelled");
        self.inner().cancelled_scans += 1;
        Ok(None)
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    type Connection = SimulatedConnection;

    async fn scan(
        &self,
        filter: &NameFilter,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<Option<DeviceHandle>, TransportError> {
        let started = Instant::now();
        let mut advertisements = {
            let mut inner = self.inner();
            inner.scans += 1;
            inner.advertisements.clone()
        };
        // stable, so equal delays keep their scripted order
        advertisements.sort_by_key(|advertisement| advertisement.after);

        for advertisement in advertisements {
            if advertisement.after > timeout {
                break;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return self.record_cancelled_scan(),
                _ = sleep_until(started + advertisement.after) => {},
            }

            if filter(&advertisement.name) {
                return Ok(Some(DeviceHandle {
                    address: advertisement.address,
                    name: advertisement.name,
                }));
            }
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => self.record_cancelled_scan(),
            _ = sleep_until(started + timeout) => Ok(None),
        }
    }

    async fn connect(&self, handle: &DeviceHandle) -> Result<SimulatedConnection, TransportError> {
        let delay = {
            let mut inner = self.inner();
            inner.connects += 1;
            inner.connect_delay
        };

        if !delay.is_zero() {
            sleep(delay).await;
        }

        let mut inner = self.inner();
        if let Some(reason) = &inner.connect_failure {
            return Err(TransportError::ConnectError { reason: reason.clone() });
        }

        let known = inner.advertisements.iter().any(|advertisement| advertisement.address == handle.address);
        if !known {
            return Err(TransportError::ConnectError { reason: format!("{} is unreachable", handle.address) });
        }

        inner.connected = true;
        Ok(SimulatedConnection { address: handle.address.clone() })
    }

    async fn abort_connect(&self, handle: &DeviceHandle) {
        debug!("Simulated connect to {} abandoned", handle.address);
        let mut inner = self.inner();
        inner.aborted_connects += 1;
        inner.connected = false;
    }

    async fn subscribe(&self, _connection: &SimulatedConnection, characteristic: Uuid) -> Result<NotificationStream, TransportError> {
        let delay = self.inner().subscribe_delay;
        if !delay.is_zero() {
            sleep(delay).await;
        }

        let mut inner = self.inner();
        if !inner.connected {
            return Err(TransportError::SubscribeError { reason: "link is down".to_string() });
        }
        if let Some(reason) = &inner.subscribe_failure {
            return Err(TransportError::SubscribeError { reason: reason.clone() });
        }
        if !inner.characteristics.contains(&characteristic) {
            return Err(TransportError::SubscribeError {
                reason: format!("characteristic {} is not available", characteristic),
            });
        }

        let (sender, receiver) = unbounded();
        for payload in inner.pending.drain(..) {
            // the receiver is still in scope, so this can not fail
            let _ = sender.unbounded_send(payload);
        }
        inner.subscriber = Some(sender);

        Ok(receiver.boxed())
    }

    async fn unsubscribe(&self, _connection: &SimulatedConnection, _characteristic: Uuid) -> Result<(), TransportError> {
        let mut inner = self.inner();
        inner.unsubscribes += 1;
        inner.subscriber = None;
        Ok(())
    }

    async fn write(&self, _connection: &SimulatedConnection, characteristic: Uuid, bytes: &[u8]) -> Result<(), TransportError> {
        let mut inner = self.inner();
        if !inner.connected {
            return Err(TransportError::WriteError { reason: "disconnected".to_string() });
        }
        if let Some(reason) = &inner.write_failure {
            return Err(TransportError::WriteError { reason: reason.clone() });
        }

        inner.writes.push((characteristic, bytes.to_vec()));
        Ok(())
    }

    async fn is_connected(&self, _connection: &SimulatedConnection) -> bool {
        let delay = self.inner().status_delay;
        if !delay.is_zero() {
            sleep(delay).await;
        }

        self.inner().connected
    }

    async fn disconnect(&self, _connection: &SimulatedConnection) {
        let mut inner = self.inner();
        inner.disconnects += 1;
        inner.connected = false;
        inner.subscriber = None;
    }
}
