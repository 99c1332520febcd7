//! The capability interface the session needs from a bluetooth stack.

use std::time::Duration;
use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::device::types::DeviceHandle;
use crate::error::TransportError;

/// Inbound notification payloads of one characteristic, in the order the peripheral sent them.
/// The stream ends when the link goes down.
pub type NotificationStream = BoxStream<'static, Vec<u8>>;

/// Decides on the advertised local name whether a peripheral is the one we want.
pub type NameFilter = dyn for<'n> Fn(&'n str) -> bool + Send + Sync;

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Connection: Clone + Send + Sync + 'static;

    /// Scan for at most `timeout`, returning the first advertisement whose local name passes
    /// `filter`. Returns `Ok(None)` on timeout, or as soon as `cancel` is cancelled.
    async fn scan(
        &self,
        filter: &NameFilter,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<Option<DeviceHandle>, TransportError>;

    async fn connect(&self, handle: &DeviceHandle) -> Result<Self::Connection, TransportError>;

    /// Called after a pending `connect` for `handle` was dropped. Tears down a link the stack may
    /// still have finished in the background. Best effort.
    async fn abort_connect(&self, handle: &DeviceHandle);

    async fn subscribe(
        &self,
        connection: &Self::Connection,
        characteristic: Uuid,
    ) -> Result<NotificationStream, TransportError>;

    async fn unsubscribe(&self, connection: &Self::Connection, characteristic: Uuid) -> Result<(), TransportError>;

    async fn write(&self, connection: &Self::Connection, characteristic: Uuid, bytes: &[u8]) -> Result<(), TransportError>;

    async fn is_connected(&self, connection: &Self::Connection) -> bool;

    /// Best effort, safe to call on a connection that is already closed.
    async fn disconnect(&self, connection: &Self::Connection);
}
