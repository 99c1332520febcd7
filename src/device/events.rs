use std::sync::{Arc, Mutex};
use futures::channel::mpsc::{channel, Receiver, Sender};
use futures::StreamExt;
use log::{debug, warn};
use tokio::spawn;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::device::types::{DeviceEvent, SessionSnapshot};
use crate::error::{SessionError, TransportError};

/// Fan-out of [`DeviceEvent`]s to any number of subscribers.
///
/// Publishing never waits: every subscriber has its own bounded queue, a subscriber whose queue is
/// full misses the event and a subscriber that went away is forgotten.
#[derive(Clone)]
pub struct EventBus {
    senders: Arc<Mutex<Vec<Sender<DeviceEvent>>>>,
    buffer: usize,
}

impl EventBus {
    pub fn new(buffer: usize) -> Self {
        EventBus {
            senders: Arc::new(Mutex::new(Vec::new())),
            buffer,
        }
    }

    pub fn subscribe(&self) -> Receiver<DeviceEvent> {
        let (sender, receiver) = channel::<DeviceEvent>(self.buffer);
        self.senders.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).push(sender);
        receiver
    }

    pub fn subscriber_count(&self) -> usize {
        self.senders.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }

    pub fn publish(&self, event: DeviceEvent) {
        let mut senders = self.senders.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        senders.retain_mut(|sender| match sender.try_send(event.clone()) {
            Ok(()) => true,
            Err(err) if err.is_full() => {
                warn!("Subscriber is not keeping up, dropping {:?}", err.into_inner());
                true
            },
            Err(_) => {
                debug!("Subscriber went away");
                false
            },
        });
    }
}

/// Callbacks for the events a presentation layer cares about, driven by a task of their own.
#[derive(Default)]
pub struct EventHandlers {
    on_connected: Vec<Box<dyn FnMut() + Send>>,
    on_data_received: Vec<Box<dyn FnMut(&str) + Send>>,
    on_decode_error: Vec<Box<dyn FnMut(&[u8]) + Send>>,
    on_state_changed: Vec<Box<dyn FnMut(&SessionSnapshot) + Send>>,
    on_failed: Vec<Box<dyn FnMut(&SessionError) + Send>>,
    on_write_failed: Vec<Box<dyn FnMut(&TransportError) + Send>>,
}

impl EventHandlers {
    pub fn new() -> Self {
        EventHandlers::default()
    }

    pub fn on_connected(mut self, callback: impl FnMut() + Send + 'static) -> Self {
        self.on_connected.push(Box::new(callback));
        self
    }

    pub fn on_data_received(mut self, callback: impl FnMut(&str) + Send + 'static) -> Self {
        self.on_data_received.push(Box::new(callback));
        self
    }

    pub fn on_decode_error(mut self, callback: impl FnMut(&[u8]) + Send + 'static) -> Self {
        self.on_decode_error.push(Box::new(callback));
        self
    }

    pub fn on_state_changed(mut self, callback: impl FnMut(&SessionSnapshot) + Send + 'static) -> Self {
        self.on_state_changed.push(Box::new(callback));
        self
    }

    pub fn on_failed(mut self, callback: impl FnMut(&SessionError) + Send + 'static) -> Self {
        self.on_failed.push(Box::new(callback));
        self
    }

    pub fn on_write_failed(mut self, callback: impl FnMut(&TransportError) + Send + 'static) -> Self {
        self.on_write_failed.push(Box::new(callback));
        self
    }

    pub fn dispatch(&mut self, event: &DeviceEvent) {
        match event {
            DeviceEvent::Connected => self.on_connected.iter_mut().for_each(|callback| callback()),
            DeviceEvent::DataReceived { text, .. } => {
                self.on_data_received.iter_mut().for_each(|callback| callback(text.as_str()))
            },
            DeviceEvent::DecodeError { raw } => self.on_decode_error.iter_mut().for_each(|callback| callback(raw.as_slice())),
            DeviceEvent::StateChanged(snapshot) => {
                self.on_state_changed.iter_mut().for_each(|callback| callback(snapshot))
            },
            DeviceEvent::Failed(reason) => self.on_failed.iter_mut().for_each(|callback| callback(reason)),
            DeviceEvent::WriteFailed(reason) => {
                self.on_write_failed.iter_mut().for_each(|callback| callback(reason))
            },
        }
    }

    /// Subscribe to `events` and invoke the callbacks until `cancel` is cancelled or the bus is
    /// gone.
    pub fn spawn(mut self, events: &EventBus, cancel: CancellationToken) -> JoinHandle<()> {
        let mut receiver = events.subscribe();

        spawn(async move {
            'mainloop: loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        break 'mainloop;
                    },
                    event = receiver.next() => match event {
                        Some(event) => self.dispatch(&event),
                        None => break 'mainloop,
                    },
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use super::*;
    use crate::device::types::SessionState;

    #[test]
    fn every_subscriber_sees_events_in_order() {
        let bus = EventBus::new(8);
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.publish(DeviceEvent::Connected);
        bus.publish(DeviceEvent::from_notification(b"12.5".to_vec()));

        for receiver in [&mut first, &mut second] {
            assert_eq!(receiver.try_next().unwrap(), Some(DeviceEvent::Connected));
            assert_eq!(receiver.try_next().unwrap(), Some(DeviceEvent::from_notification(b"12.5".to_vec())));
        }
    }

    #[test]
    fn full_subscriber_does_not_block_or_starve_others() {
        let bus = EventBus::new(1);
        let _slow = bus.subscribe();
        let mut fast = bus.subscribe();

        for i in 0..100 {
            bus.publish(DeviceEvent::from_notification(format!("{}", i).into_bytes()));
            assert!(fast.try_next().unwrap().is_some());
        }

        assert_eq!(bus.subscriber_count(), 2);
    }

    #[test]
    fn dropped_subscriber_is_removed() {
        let bus = EventBus::new(8);
        let receiver = bus.subscribe();
        drop(receiver);

        bus.publish(DeviceEvent::Connected);

        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn handlers_receive_matching_events() {
        let bus = EventBus::new(8);
        let seen = Arc::new(Mutex::new(Vec::<String>::new()));
        let cancel = CancellationToken::new();

        let (s1, s2, s3, s4) = (seen.clone(), seen.clone(), seen.clone(), seen.clone());
        let handle = EventHandlers::new()
            .on_connected(move || s1.lock().unwrap().push("connected".to_string()))
            .on_data_received(move |text| s2.lock().unwrap().push(format!("data {}", text)))
            .on_decode_error(move |raw| s3.lock().unwrap().push(format!("decode {}", raw.len())))
            .on_state_changed(move |snapshot| s4.lock().unwrap().push(format!("state {}", snapshot.state)))
            .spawn(&bus, cancel.clone());

        bus.publish(DeviceEvent::StateChanged(SessionSnapshot { state: SessionState::Scanning, device: None }));
        bus.publish(DeviceEvent::Connected);
        bus.publish(DeviceEvent::from_notification(b"13.0".to_vec()));
        bus.publish(DeviceEvent::from_notification(b"\xFF\xFE".to_vec()));

        // dropping the bus ends the subscription once the queue is drained
        drop(bus);
        handle.await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![
            "state scanning".to_string(),
            "connected".to_string(),
            "data 13.0".to_string(),
            "decode 2".to_string(),
        ]);
    }
}
