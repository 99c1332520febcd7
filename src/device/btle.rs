use std::collections::HashMap;
use std::sync::Mutex;
use async_trait::async_trait;
use futures::stream::{select_all, BoxStream, SelectAll};
use futures::{future, StreamExt};
use btleplug::api::{Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use log::{debug, info, warn};
use tokio::time::{sleep, timeout, Duration};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::types::Config;
use crate::device::constants::IS_CONNECTED_DEADLINE;
use crate::device::transport::{NameFilter, NotificationStream, Transport};
use crate::device::types::DeviceHandle;
use crate::error::{DeviceError, TransportError};

#[derive(Debug, Clone)]
pub struct BtleConnection {
    peripheral: Peripheral,
}

pub struct BtleTransport {
    manager: Manager,
    // peripherals seen by the last scan, by address
    discovered: Mutex<HashMap<String, Peripheral>>,
    connect_deadline: u64,
    write_deadline: u64,
}

impl BtleTransport {
    pub async fn new(config: &Config) -> Result<Self, DeviceError> {
        let manager = Manager::new().await?;

        Ok(BtleTransport {
            manager,
            discovered: Mutex::new(HashMap::new()),
            connect_deadline: config.connect_timeout_ms,
            write_deadline: config.write_timeout_ms,
        })
    }

    fn remember(&self, address: &str, peripheral: &Peripheral) {
        let mut discovered = self.discovered.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        discovered.clear();
        discovered.insert(address.to_string(), peripheral.clone());
    }

    fn lookup(&self, address: &str) -> Option<Peripheral> {
        let discovered = self.discovered.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        discovered.get(address).cloned()
    }
}

// adapter events of one scan, tagged with the adapter that saw them
type ScanEvents = SelectAll<BoxStream<'static, (Adapter, CentralEvent)>>;

async fn start_scanning(manager: &Manager) -> Result<(Vec<Adapter>, ScanEvents), DeviceError> {
    let adapters = manager.adapters().await?;
    if adapters.is_empty() {
        return Err(DeviceError::NoAdapter);
    }

    let mut streams = Vec::with_capacity(adapters.len());
    for adapter in &adapters {
        // listen before scanning so the first advertisement is not missed
        let source = adapter.clone();
        let events = adapter.events().await?;
        streams.push(events.map(move |event| (source.clone(), event)).boxed());
    }

    // identification is by name only, so no service filter
    for adapter in &adapters {
        info!("Scanning using adapter {}...", adapter.adapter_info().await.unwrap_or("UNKNOWN".to_string()));
        adapter.start_scan(ScanFilter::default()).await?;
    }

    Ok((adapters, select_all(streams)))
}

async fn stop_scanning(adapters: &Vec<Adapter>) {
    for adapter in adapters {
        if let Err(err) = adapter.stop_scan().await {
            warn!("Failed to stop scanning: {}", err);
        }
    }
}

async fn match_peripheral(adapter: &Adapter, id: &PeripheralId, filter: &NameFilter) -> Result<Option<(Peripheral, DeviceHandle)>, DeviceError> {
    let peripheral = adapter.peripheral(id).await?;

    let properties = match peripheral.properties().await? {
        Some(properties) => properties,
        None => return Ok(None),
    };

    // the name often only arrives with a later scan response, which shows up as DeviceUpdated
    let name = match properties.local_name {
        Some(name) => name,
        None => return Ok(None),
    };

    if !filter(&name) {
        debug!("Ignoring peripheral {:?}", name);
        return Ok(None);
    }

    info!("Using peripheral {} {:?} {}", properties.address, properties.address_type, name);
    let handle = DeviceHandle {
        address: format!("{:?}", peripheral.id()),
        name,
    };
    Ok(Some((peripheral, handle)))
}

fn find_characteristic(peripheral: &Peripheral, uuid: Uuid) -> Result<Characteristic, DeviceError> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|characteristic| characteristic.uuid == uuid)
        .ok_or(DeviceError::MissingCharacteristic)
}

#[async_trait]
impl Transport for BtleTransport {
    type Connection = BtleConnection;

    async fn scan(
        &self,
        filter: &NameFilter,
        scan_timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<Option<DeviceHandle>, TransportError> {
        let (adapters, mut events) = start_scanning(&self.manager)
            .await
            .map_err(|err| TransportError::Scan { reason: err.to_string() })?;

        let deadline = sleep(scan_timeout);
        tokio::pin!(deadline);

        // advertisements are judged in the order they are received, the first match wins
        let found = 'scanloop: loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Scan cancelled");
                    break 'scanloop None;
                },
                _ = &mut deadline => break 'scanloop None,
                event = events.next() => match event {
                    Some((adapter, CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id))) => {
                        match match_peripheral(&adapter, &id, filter).await {
                            Ok(Some(found)) => break 'scanloop Some(found),
                            Ok(None) => {},
                            Err(err) => warn!("Could not inspect peripheral {:?}: {}", id, err),
                        }
                    },
                    Some(_) => {},
                    None => {
                        warn!("Adapter event stream ended while scanning");
                        break 'scanloop None;
                    },
                },
            }
        };

        stop_scanning(&adapters).await;

        Ok(found.map(|(peripheral, handle)| {
            self.remember(&handle.address, &peripheral);
            handle
        }))
    }

    async fn connect(&self, handle: &DeviceHandle) -> Result<BtleConnection, TransportError> {
        let peripheral = self.lookup(&handle.address).ok_or_else(|| TransportError::ConnectError {
            reason: format!("peripheral {} is no longer known", handle.address),
        })?;

        let connect_error = |err: DeviceError| TransportError::ConnectError { reason: err.to_string() };

        info!("Connecting to peripheral...");
        match timeout(Duration::from_millis(self.connect_deadline), peripheral.connect()).await {
            Err(_) => return Err(connect_error(DeviceError::Deadline(self.connect_deadline))),
            Ok(Err(err)) => return Err(connect_error(err.into())),
            Ok(Ok(())) => {},
        }

        info!("Connected; Discovering services...");
        peripheral.discover_services().await.map_err(|err| connect_error(err.into()))?;

        Ok(BtleConnection { peripheral })
    }

    async fn abort_connect(&self, handle: &DeviceHandle) {
        let peripheral = match self.lookup(&handle.address) {
            Some(peripheral) => peripheral,
            None => return,
        };

        // also cancels a connection attempt the stack is still working on
        match timeout(Duration::from_millis(IS_CONNECTED_DEADLINE), peripheral.disconnect()).await {
            Err(_) => warn!("Disconnecting an abandoned connection took too long"),
            Ok(Err(err)) => debug!("Disconnecting an abandoned connection failed: {:?}", err),
            Ok(Ok(())) => info!("Abandoned connection to {} closed", handle.address),
        }
    }

    async fn subscribe(&self, connection: &BtleConnection, characteristic: Uuid) -> Result<NotificationStream, TransportError> {
        let subscribe_error = |err: DeviceError| TransportError::SubscribeError { reason: err.to_string() };
        let peripheral = &connection.peripheral;
        let data_char = find_characteristic(peripheral, characteristic).map_err(subscribe_error)?;

        // open the stream first so that no notification slips through between the two calls
        let notifications = peripheral.notifications().await.map_err(|err| subscribe_error(err.into()))?;

        info!("Subscribing to characteristic {:?}", data_char.uuid);
        peripheral.subscribe(&data_char).await.map_err(|err| subscribe_error(err.into()))?;

        let stream = notifications.filter_map(move |notification| {
            future::ready(if notification.uuid == characteristic { Some(notification.value) } else { None })
        });

        Ok(stream.boxed())
    }

    async fn unsubscribe(&self, connection: &BtleConnection, characteristic: Uuid) -> Result<(), TransportError> {
        let subscribe_error = |err: DeviceError| TransportError::SubscribeError { reason: err.to_string() };
        let peripheral = &connection.peripheral;
        let data_char = find_characteristic(peripheral, characteristic).map_err(subscribe_error)?;

        peripheral.unsubscribe(&data_char).await.map_err(|err| subscribe_error(err.into()))
    }

    async fn write(&self, connection: &BtleConnection, characteristic: Uuid, bytes: &[u8]) -> Result<(), TransportError> {
        let write_error = |err: DeviceError| TransportError::WriteError { reason: err.to_string() };
        let peripheral = &connection.peripheral;
        let control_char = find_characteristic(peripheral, characteristic).map_err(write_error)?;

        let write_type = if control_char.properties.contains(CharPropFlags::WRITE) {
            WriteType::WithResponse
        } else if control_char.properties.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE) {
            WriteType::WithoutResponse
        } else {
            return Err(TransportError::WriteError {
                reason: format!("characteristic {} is not writable", characteristic),
            });
        };

        match timeout(Duration::from_millis(self.write_deadline), peripheral.write(&control_char, bytes, write_type)).await {
            Err(_) => Err(write_error(DeviceError::Deadline(self.write_deadline))),
            Ok(Err(err)) => Err(write_error(err.into())),
            Ok(Ok(())) => Ok(()),
        }
    }

    async fn is_connected(&self, connection: &BtleConnection) -> bool {
        tokio::select! {
            _ = sleep(Duration::from_millis(IS_CONNECTED_DEADLINE)) => {
                // macOS
                warn!("Checking for connection status took too long");
                false
            }
            result = connection.peripheral.is_connected() => match result {
                Err(err) => {
                    warn!("Error checking for connection state: {:?}", err);
                    false
                },
                Ok(connected) => connected,
            }
        }
    }

    async fn disconnect(&self, connection: &BtleConnection) {
        if !self.is_connected(connection).await {
            debug!("Peripheral already disconnected");
            return;
        }

        if let Err(err) = connection.peripheral.disconnect().await {
            warn!("Failed to disconnect peripheral: {:?}", err);
        }
    }
}
