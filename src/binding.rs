// Gated publisher binding
//
// Wraps one output topic so the bus only sees it as live while a message is
// being emitted: enable -> advertise (once) -> alloc -> publish -> disable.

use tracing::{debug, trace};

use crate::bus::{BusError, MessageSlot, Middleware, TopicHandle};
use crate::messages::Message;

/// Error types for gated publishing
#[derive(Debug, thiserror::Error)]
pub enum BindingError {
    #[error("Binding '{topic}' used while idle")]
    NotEnabled { topic: String },

    #[error("Binding '{topic}' used before it was advertised")]
    NotAdvertised { topic: String },

    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Lifecycle of a binding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingState {
    Idle,
    Publishing,
}

/// Result of one gated publish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Published; number of subscribers that took the sample
    Published(usize),
    /// Pool exhausted, nothing was sent
    Skipped,
}

/// Output topic with an idle/publishing lifecycle and one-time registration
pub struct TopicBinding {
    bus: Middleware,
    topic: String,
    state: BindingState,
    // Set by the first advertise, never cleared
    handle: Option<TopicHandle>,
}

impl TopicBinding {
    pub fn new(bus: Middleware, topic: impl Into<String>) -> Self {
        Self {
            bus,
            topic: topic.into(),
            state: BindingState::Idle,
            handle: None,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn state(&self) -> BindingState {
        self.state
    }

    pub fn is_advertised(&self) -> bool {
        self.handle.is_some()
    }

    pub fn enable(&mut self) {
        self.set_state(BindingState::Publishing);
    }

    pub fn disable(&mut self) {
        self.set_state(BindingState::Idle);
    }

    fn set_state(&mut self, state: BindingState) {
        self.state = state;
        if let Some(handle) = &self.handle {
            self.bus.set_enabled(handle, state == BindingState::Publishing);
        }
    }

    /// Register the topic on the bus the first time only
    ///
    /// Returns true when this call performed the registration.
    pub fn advertise_if_needed(&mut self) -> bool {
        if self.handle.is_some() {
            return false;
        }

        let handle = self.bus.advertise(&self.topic);
        self.bus
            .set_enabled(&handle, self.state == BindingState::Publishing);
        self.handle = Some(handle);
        debug!("Registered {} on first use", self.topic);
        true
    }

    fn active_handle(&self) -> Result<&TopicHandle, BindingError> {
        if self.state != BindingState::Publishing {
            return Err(BindingError::NotEnabled {
                topic: self.topic.clone(),
            });
        }
        self.handle.as_ref().ok_or_else(|| BindingError::NotAdvertised {
            topic: self.topic.clone(),
        })
    }

    /// Take a slot from the pool; only valid while publishing
    pub fn alloc(&self) -> Result<Option<MessageSlot>, BindingError> {
        let handle = self.active_handle()?;
        Ok(self.bus.alloc(handle))
    }

    pub fn publish(&self, slot: MessageSlot) -> Result<usize, BindingError> {
        let handle = self.active_handle()?;
        Ok(self.bus.publish(handle, slot)?)
    }

    /// Run one full enable/alloc/publish/disable bracket
    ///
    /// `fill` runs on the filled slot just before it is published.
    /// The binding is back to idle when this returns, whatever the outcome.
    pub fn gated_publish(
        &mut self,
        message: Message,
        fill: impl FnOnce(&mut MessageSlot),
    ) -> Result<PublishOutcome, BindingError> {
        self.enable();
        self.advertise_if_needed();
        let outcome = self.emit(message, fill);
        self.disable();
        outcome
    }

    fn emit(
        &self,
        message: Message,
        fill: impl FnOnce(&mut MessageSlot),
    ) -> Result<PublishOutcome, BindingError> {
        let Some(mut slot) = self.alloc()? else {
            trace!("{}: pool exhausted, skipping publish", self.topic);
            return Ok(PublishOutcome::Skipped);
        };
        slot.set(message);
        fill(&mut slot);
        Ok(PublishOutcome::Published(self.publish(slot)?))
    }

    /// Gated publish of a locally produced message
    pub fn send(&mut self, message: Message) -> Result<PublishOutcome, BindingError> {
        self.gated_publish(message, |_| {})
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::SubscriptionMode;
    use crate::messages::{PidConfig, Speed2};
    use std::time::Duration;

    fn pid(k: f32) -> Message {
        Message::PidConfig(PidConfig { k, ti: 0.0, td: 0.0 })
    }

    #[test]
    fn test_advertise_only_once() {
        let mw = Middleware::new("test", 4);
        let mut binding = TopicBinding::new(mw.clone(), "pidcfg");
        assert!(!binding.is_advertised());

        assert!(binding.advertise_if_needed());
        for _ in 0..5 {
            assert!(!binding.advertise_if_needed());
        }
        assert_eq!(mw.advertisements("pidcfg"), 1);
    }

    #[test]
    fn test_alloc_and_publish_rejected_while_idle() {
        let mw = Middleware::new("test", 4);
        let mut binding = TopicBinding::new(mw.clone(), "speed2");
        binding.advertise_if_needed();

        assert!(matches!(binding.alloc(), Err(BindingError::NotEnabled { .. })));

        binding.enable();
        let mut slot = binding.alloc().unwrap().unwrap();
        slot.set(Message::Speed2(Speed2::default()));
        binding.disable();

        assert!(matches!(binding.publish(slot), Err(BindingError::NotEnabled { .. })));
        // The rejected slot went back to the pool
        assert_eq!(mw.free_slots("speed2"), Some(4));
    }

    #[test]
    fn test_enable_before_advertise_reaches_bus() {
        let mw = Middleware::new("test", 4);
        let mut binding = TopicBinding::new(mw.clone(), "speed2");

        binding.enable();
        binding.enable();
        assert!(matches!(binding.alloc(), Err(BindingError::NotAdvertised { .. })));
        binding.advertise_if_needed();
        assert!(mw.is_live("speed2"));

        binding.disable();
        binding.disable();
        assert_eq!(binding.state(), BindingState::Idle);
        assert!(!mw.is_live("speed2"));
    }

    #[tokio::test]
    async fn test_gated_publish_brackets_and_delivers() {
        let mw = Middleware::new("test", 4);
        let mut sub = mw.subscribe("pidcfg", 5, SubscriptionMode::Queued).unwrap();
        let mut binding = TopicBinding::new(mw.clone(), "pidcfg");

        assert_eq!(binding.send(pid(1.0)).unwrap(), PublishOutcome::Published(1));
        assert_eq!(binding.send(pid(2.0)).unwrap(), PublishOutcome::Published(1));
        assert_eq!(binding.state(), BindingState::Idle);
        assert!(!mw.is_live("pidcfg"));
        assert_eq!(mw.advertisements("pidcfg"), 1);

        let timeout = Duration::from_millis(20);
        assert_eq!(sub.poll(timeout).await.unwrap().message(), &pid(1.0));
        assert_eq!(sub.poll(timeout).await.unwrap().message(), &pid(2.0));
    }

    #[tokio::test]
    async fn test_gated_publish_skips_on_exhausted_pool() {
        let mw = Middleware::new("test", 1);
        let _sub = mw.subscribe("pidcfg", 5, SubscriptionMode::Queued).unwrap();
        let mut binding = TopicBinding::new(mw.clone(), "pidcfg");

        // First sample stays queued and keeps the only slot
        assert_eq!(binding.send(pid(1.0)).unwrap(), PublishOutcome::Published(1));
        assert_eq!(binding.send(pid(2.0)).unwrap(), PublishOutcome::Skipped);
        assert_eq!(binding.state(), BindingState::Idle);
    }

    #[tokio::test]
    async fn test_fill_can_mark_remote() {
        let mw = Middleware::new("test", 2);
        let mut sub = mw.subscribe("imu", 5, SubscriptionMode::Queued).unwrap();
        let mut binding = TopicBinding::new(mw.clone(), "imu");

        binding.gated_publish(pid(0.5), |slot| slot.mark_remote()).unwrap();
        let sample = sub.poll(Duration::from_millis(20)).await.unwrap();
        assert_eq!(sample.origin(), crate::bus::Origin::Remote);
    }
}
