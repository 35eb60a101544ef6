//! Delivery through the single shared input device.
//!
//! There is exactly one input device for the whole process. Every delivery
//! holds its lock for the full focus → clear → inject sequence, since a
//! focus or clear without the matching inject would corrupt whichever
//! session another delivery targets next.
//!
//! # Injection sequence
//!
//! ```text
//! Unfocused ── focus(target) ──→ Focused ── clear() ──→ Cleared ── inject(text) ──→ done
//! ```
//!
//! The sequence is a typestate, so skipping a step does not compile.

use async_trait::async_trait;
use fleet_core::{AgentEndpoint, AgentId, DeliveryError, FleetError, FleetResult, Locator, Message, MessageId};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use uuid::Uuid;

// ============================================================================
// INPUT DEVICE
// ============================================================================

/// The stateful, non-reentrant automation resource.
#[async_trait]
pub trait InputDevice: Send {
    /// Move input focus to the session at `target`.
    async fn focus(&mut self, target: Locator) -> FleetResult<()>;

    /// Remove any text already present at the focus.
    async fn clear(&mut self) -> FleetResult<()>;

    /// Type `text` into the focused session and submit it.
    async fn inject(&mut self, text: &str) -> FleetResult<()>;
}

/// The process-wide device handle. Created once and passed to the adapter.
pub type SharedInputDevice = Arc<Mutex<Box<dyn InputDevice>>>;

pub fn shared_device(device: impl InputDevice + 'static) -> SharedInputDevice {
    Arc::new(Mutex::new(Box::new(device)))
}

// ============================================================================
// INJECTION TYPESTATE
// ============================================================================

pub trait InjectionState: private::Sealed + Send {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unfocused;
impl InjectionState for Unfocused {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Focused;
impl InjectionState for Focused {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cleared;
impl InjectionState for Cleared {}

mod private {
    pub trait Sealed {}
    impl Sealed for super::Unfocused {}
    impl Sealed for super::Focused {}
    impl Sealed for super::Cleared {}
}

/// One injection in progress on a borrowed device.
pub struct Injection<'d, S: InjectionState> {
    device: &'d mut dyn InputDevice,
    _state: PhantomData<S>,
}

impl<'d> Injection<'d, Unfocused> {
    pub fn new(device: &'d mut dyn InputDevice) -> Self {
        Injection {
            device,
            _state: PhantomData,
        }
    }

    pub async fn focus(self, target: Locator) -> FleetResult<Injection<'d, Focused>> {
        self.device.focus(target).await?;
        Ok(Injection {
            device: self.device,
            _state: PhantomData,
        })
    }
}

impl<'d> Injection<'d, Focused> {
    pub async fn clear(self) -> FleetResult<Injection<'d, Cleared>> {
        self.device.clear().await?;
        Ok(Injection {
            device: self.device,
            _state: PhantomData,
        })
    }
}

impl<'d> Injection<'d, Cleared> {
    /// Final step; consumes the injection.
    pub async fn inject(self, text: &str) -> FleetResult<()> {
        self.device.inject(text).await
    }
}

// ============================================================================
// PAYLOAD FRAMING
// ============================================================================

const FRAME_OPEN: &str = "[fleet:";
const FRAME_FROM: &str = " from ";
const FRAME_CLOSE: &str = "] ";

/// Text actually injected for a message. The header lets whatever receives
/// the text file it under the right message id.
pub fn frame_payload(message: &Message) -> String {
    format!(
        "{FRAME_OPEN}{}{FRAME_FROM}{}{FRAME_CLOSE}{}",
        message.id, message.sender, message.content
    )
}

/// A parsed injection payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramedPayload {
    pub message_id: MessageId,
    pub sender: AgentId,
    pub content: String,
}

pub fn parse_payload(text: &str) -> Option<FramedPayload> {
    let rest = text.strip_prefix(FRAME_OPEN)?;
    let (id, rest) = rest.split_once(FRAME_FROM)?;
    let (sender, content) = rest.split_once(FRAME_CLOSE)?;
    Some(FramedPayload {
        message_id: Uuid::parse_str(id).ok()?,
        sender: sender.to_string(),
        content: content.to_string(),
    })
}

// ============================================================================
// ADAPTER
// ============================================================================

/// What a successful delivery cost.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub agent_id: AgentId,
    /// Time spent waiting for the device
    pub lock_wait: Duration,
    /// Time spent in the injection sequence
    pub elapsed: Duration,
}

#[derive(Clone)]
pub struct DeliveryAdapter {
    device: SharedInputDevice,
    timeout: Duration,
}

impl DeliveryAdapter {
    pub fn new(device: SharedInputDevice, timeout: Duration) -> Self {
        Self { device, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run focus → clear → inject under the device lock. Waiting for the
    /// lock is unbounded; the sequence itself must finish within `timeout`.
    pub async fn deliver(&self, endpoint: &AgentEndpoint, payload: &str) -> FleetResult<DeliveryReceipt> {
        let waiting = Instant::now();
        let mut device = self.device.lock().await;
        let lock_wait = waiting.elapsed();

        let started = Instant::now();
        let sequence = async {
            Injection::new(&mut **device)
                .focus(endpoint.injection_target)
                .await?
                .clear()
                .await?
                .inject(payload)
                .await?;
            Ok::<(), FleetError>(())
        };

        match tokio::time::timeout(self.timeout, sequence).await {
            Ok(Ok(())) => {
                let elapsed = started.elapsed();
                tracing::debug!(
                    agent_id = %endpoint.agent_id,
                    lock_wait_ms = lock_wait.as_millis() as u64,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "injection sequence finished"
                );
                Ok(DeliveryReceipt {
                    agent_id: endpoint.agent_id.clone(),
                    lock_wait,
                    elapsed,
                })
            }
            Ok(Err(e)) => Err(match e {
                FleetError::Delivery(_) => e,
                other => DeliveryError::Failed {
                    reason: other.to_string(),
                }
                .into(),
            }),
            Err(_) => Err(DeliveryError::Timeout {
                budget_ms: self.timeout.as_millis() as u64,
            }
            .into()),
        }
    }
}

impl std::fmt::Debug for DeliveryAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryAdapter")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    /// Records every call into a shared log.
    struct LogDevice {
        log: Arc<StdMutex<Vec<String>>>,
        delay: Duration,
        fail_inject: bool,
    }

    #[async_trait]
    impl InputDevice for LogDevice {
        async fn focus(&mut self, target: Locator) -> FleetResult<()> {
            self.log.lock().unwrap().push(format!("focus {},{}", target.x, target.y));
            tokio::time::sleep(self.delay).await;
            Ok(())
        }

        async fn clear(&mut self) -> FleetResult<()> {
            self.log.lock().unwrap().push("clear".to_string());
            Ok(())
        }

        async fn inject(&mut self, text: &str) -> FleetResult<()> {
            if self.fail_inject {
                return Err(fleet_core::StoreError::LockPoisoned.into());
            }
            self.log.lock().unwrap().push(format!("inject {text}"));
            Ok(())
        }
    }

    fn device(delay: Duration, fail_inject: bool) -> (SharedInputDevice, Arc<StdMutex<Vec<String>>>) {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let dev = shared_device(LogDevice {
            log: log.clone(),
            delay,
            fail_inject,
        });
        (dev, log)
    }

    fn endpoint(id: &str, x: i32) -> AgentEndpoint {
        AgentEndpoint::new(id, Locator::new(x, 10), format!("inboxes/{id}"))
    }

    #[test]
    fn test_frame_roundtrip() {
        let msg = Message::new("Captain", "Agent-3", "status] from [report");
        let framed = frame_payload(&msg);
        let parsed = parse_payload(&framed).unwrap();
        assert_eq!(parsed.message_id, msg.id);
        assert_eq!(parsed.sender, "Captain");
        assert_eq!(parsed.content, "status] from [report");
        assert!(parse_payload("plain text").is_none());
        assert!(parse_payload("[fleet:not-a-uuid from x] y").is_none());
    }

    #[tokio::test]
    async fn test_sequence_order() {
        let (dev, log) = device(Duration::ZERO, false);
        let adapter = DeliveryAdapter::new(dev, Duration::from_secs(1));
        let receipt = adapter.deliver(&endpoint("Agent-1", 5), "hi").await.unwrap();
        assert_eq!(receipt.agent_id, "Agent-1");
        assert_eq!(
            *log.lock().unwrap(),
            vec!["focus 5,10".to_string(), "clear".to_string(), "inject hi".to_string()]
        );
    }

    #[tokio::test]
    async fn test_concurrent_deliveries_never_interleave() {
        let (dev, log) = device(Duration::from_millis(5), false);
        let adapter = DeliveryAdapter::new(dev, Duration::from_secs(5));
        let handles: Vec<_> = (0..6)
            .map(|i| {
                let adapter = adapter.clone();
                tokio::spawn(async move {
                    adapter
                        .deliver(&endpoint(&format!("Agent-{i}"), i), &format!("m{i}"))
                        .await
                })
            })
            .collect();
        for h in handles {
            h.await.unwrap().unwrap();
        }
        let log = log.lock().unwrap();
        assert_eq!(log.len(), 18);
        for chunk in log.chunks(3) {
            assert!(chunk[0].starts_with("focus "));
            assert_eq!(chunk[1], "clear");
            assert!(chunk[2].starts_with("inject "));
        }
    }

    #[tokio::test]
    async fn test_timeout() {
        let (dev, _log) = device(Duration::from_millis(200), false);
        let adapter = DeliveryAdapter::new(dev.clone(), Duration::from_millis(20));
        let err = adapter.deliver(&endpoint("Agent-1", 1), "x").await.unwrap_err();
        assert_eq!(err, FleetError::Delivery(DeliveryError::Timeout { budget_ms: 20 }));
        // Lock released after the timeout
        assert!(dev.try_lock().is_ok());
    }

    #[tokio::test]
    async fn test_device_error_becomes_delivery_failure() {
        let (dev, _log) = device(Duration::ZERO, true);
        let adapter = DeliveryAdapter::new(dev, Duration::from_secs(1));
        let err = adapter.deliver(&endpoint("Agent-1", 1), "x").await.unwrap_err();
        assert!(matches!(err, FleetError::Delivery(DeliveryError::Failed { .. })));
        assert!(err.is_retryable_delivery());
    }
}
