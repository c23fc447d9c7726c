//! Typed log & signal bus.
//!
//! Structured events are fanned out to registered handlers and to a lossy
//! broadcast channel that UI shells can subscribe to. Publishing never
//! blocks and never influences control flow.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use http::Method;
use tokio::sync::broadcast;

use crate::config::Website;

/// Channel capacity before slow subscribers start losing events.
const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct RequestEvent {
    pub method: Method,
    pub url: String,
    pub status: u16,
    pub latency: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RequestFailureEvent {
    pub method: Method,
    pub url: String,
    pub error: String,
    pub attempt: u32,
    pub attempts_total: u32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct BypassEvent {
    pub host: String,
    pub forced: bool,
    pub success: bool,
    pub detail: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct TrailerEvent {
    pub previous: String,
    pub upgraded: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SiteOutcomeEvent {
    pub site: Website,
    pub number: String,
    pub success: bool,
    pub detail: String,
    pub elapsed: Duration,
    pub timestamp: DateTime<Utc>,
}

/// Structured events emitted across the pipeline.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    RequestSucceeded(RequestEvent),
    RequestFailed(RequestFailureEvent),
    ChallengeDetected { host: String, url: String },
    Bypass(BypassEvent),
    TrailerUpgraded(TrailerEvent),
    SiteOutcome(SiteOutcomeEvent),
    Note(String),
}

/// Trait implemented by in-process event consumers.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &PipelineEvent);
}

/// Bus that feeds registered handlers plus a lossy broadcast channel.
pub struct EventBus {
    handlers: Vec<Arc<dyn EventHandler>>,
    channel: broadcast::Sender<PipelineEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (channel, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            handlers: vec![Arc::new(LoggingHandler)],
            channel,
        }
    }

    /// Bus without the default logging handler (quiet tests).
    pub fn silent() -> Self {
        let (channel, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            handlers: Vec::new(),
            channel,
        }
    }

    pub fn register_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    /// Subscribe an external consumer. Slow consumers lose events instead
    /// of backpressuring the pipeline.
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.channel.subscribe()
    }

    pub fn publish(&self, event: PipelineEvent) {
        for handler in &self.handlers {
            handler.handle(&event);
        }
        // Errors only mean there is no subscriber right now.
        let _ = self.channel.send(event);
    }
}

/// Renders events as emoji-prefixed `log` lines so operators can filter
/// by category.
#[derive(Debug)]
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn handle(&self, event: &PipelineEvent) {
        match event {
            PipelineEvent::RequestSucceeded(req) => {
                log::debug!(
                    "✅ {} {} -> {} ({:.2}s)",
                    req.method,
                    req.url,
                    req.status,
                    req.latency.as_secs_f64()
                );
            }
            PipelineEvent::RequestFailed(failure) => {
                log::warn!(
                    "🔴 {} {} failed: {} ({}/{})",
                    failure.method,
                    failure.url,
                    failure.error,
                    failure.attempt,
                    failure.attempts_total
                );
            }
            PipelineEvent::ChallengeDetected { host, url } => {
                log::info!("🛑 cloudflare challenge from {host}: {url}");
            }
            PipelineEvent::Bypass(bypass) => {
                if bypass.success {
                    log::info!(
                        "🛡️ {} bypass ok{}: {}",
                        bypass.host,
                        if bypass.forced { " (forced)" } else { "" },
                        bypass.detail
                    );
                } else {
                    log::warn!("⚠️ {} bypass failed: {}", bypass.host, bypass.detail);
                }
            }
            PipelineEvent::TrailerUpgraded(trailer) => {
                log::info!(
                    "🎬 trailer upgraded: {} -> {}",
                    trailer.previous,
                    trailer.upgraded
                );
            }
            PipelineEvent::SiteOutcome(outcome) => {
                if outcome.success {
                    log::info!(
                        "✅ [{}] {} ({:.2}s)",
                        outcome.site,
                        outcome.number,
                        outcome.elapsed.as_secs_f64()
                    );
                } else {
                    log::info!(
                        "🔴 [{}] {} failed: {} ({:.2}s)",
                        outcome.site,
                        outcome.number,
                        outcome.detail,
                        outcome.elapsed.as_secs_f64()
                    );
                }
            }
            PipelineEvent::Note(text) => {
                log::debug!("{text}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct CountingHandler(Mutex<usize>);

    impl EventHandler for CountingHandler {
        fn handle(&self, _event: &PipelineEvent) {
            *self.0.lock().unwrap() += 1;
        }
    }

    #[test]
    fn dispatches_to_handlers() {
        let mut bus = EventBus::silent();
        let counter = Arc::new(CountingHandler(Mutex::new(0)));
        bus.register_handler(counter.clone());
        bus.publish(PipelineEvent::Note("hello".into()));
        assert_eq!(*counter.0.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn subscribers_receive_events() {
        let bus = EventBus::silent();
        let mut rx = bus.subscribe();
        bus.publish(PipelineEvent::ChallengeDetected {
            host: "missav.ws".into(),
            url: "https://missav.ws/x".into(),
        });
        match rx.recv().await.unwrap() {
            PipelineEvent::ChallengeDetected { host, .. } => assert_eq!(host, "missav.ws"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let bus = EventBus::silent();
        bus.publish(PipelineEvent::Note("no one listening".into()));
    }
}
