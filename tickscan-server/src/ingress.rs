//! Tick feed client: connects to the pub-sub feed, subscribes to tick channels and pushes every
//! tick into the [`Pipeline`].
//!
//! Provides automatic reconnection with exponential backoff and an idle-read timeout.

use futures::{SinkExt, StreamExt};
use std::{sync::Arc, time::Duration};
use tickscan_data::{
    error::ScanError,
    event::Symbol,
    pipeline::Pipeline,
    router::RouteOutcome,
    streams::timeout::{DEFAULT_READ_TIMEOUT, TimeoutStream},
    wire::{FeedFrame, FeedSubscribe},
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Tick feed client configuration
#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// Feed WebSocket URL
    pub url: String,
    /// Symbols to subscribe to, every symbol if empty
    pub symbols: Vec<Symbol>,
    /// Reconnect if nothing is received for this long
    pub read_timeout: Duration,
    /// Delay before the first reconnection attempt
    pub reconnect_delay: Duration,
    /// Upper bound on the reconnection delay
    pub max_reconnect_delay: Duration,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8765".to_string(),
            symbols: Vec::new(),
            read_timeout: DEFAULT_READ_TIMEOUT,
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(60),
        }
    }
}

impl FeedConfig {
    /// Create a new configuration with custom URL
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Set the subscribed symbols
    pub fn with_symbols(mut self, symbols: Vec<Symbol>) -> Self {
        self.symbols = symbols;
        self
    }

    /// Set the idle read timeout
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Set the initial and maximum reconnect delay
    pub fn with_reconnect_delay(mut self, initial: Duration, max: Duration) -> Self {
        self.reconnect_delay = initial;
        self.max_reconnect_delay = max;
        self
    }

    /// Delay before reconnection `attempt` (1-based): doubles every attempt up to the maximum.
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.reconnect_delay
            .saturating_mul(factor)
            .min(self.max_reconnect_delay)
    }
}

/// Parse `TICKSCAN_FEED_SYMBOLS` style lists, eg/ "aapl, MSFT,,spy".
pub fn parse_symbols(raw: &str) -> Vec<Symbol> {
    raw.split(',')
        .map(str::trim)
        .filter(|symbol| !symbol.is_empty())
        .map(|symbol| Symbol::new(symbol.to_ascii_uppercase()))
        .collect()
}

/// Result of pushing one or more feed frames into the pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameOutcome {
    pub accepted: usize,
    pub dropped: usize,
    /// Undecodable frames or ticks, plus ticks the pipeline refused.
    pub rejected: usize,
    /// The pipeline no longer accepts ticks.
    pub closed: bool,
}

impl FrameOutcome {
    /// Fold another frame's counts into this running total.
    pub fn accumulate(&mut self, other: FrameOutcome) {
        self.accepted += other.accepted;
        self.dropped += other.dropped;
        self.rejected += other.rejected;
        self.closed |= other.closed;
    }
}

/// Decode one text frame and ingest every tick it carries.
pub fn ingest_frame(pipeline: &Pipeline, text: &str) -> FrameOutcome {
    let mut outcome = FrameOutcome::default();

    let frame = match serde_json::from_str::<FeedFrame>(text) {
        Ok(frame) => frame,
        Err(error) => {
            warn!(%error, "failed to parse feed frame");
            debug!("Raw frame: {}", text);
            pipeline.record_malformed(&ScanError::MalformedTick(error.to_string()));
            outcome.rejected += 1;
            return outcome;
        }
    };

    for raw in frame.into_ticks() {
        let raw = match raw {
            Ok(raw) => raw,
            Err(error) => {
                pipeline.record_malformed(&error);
                outcome.rejected += 1;
                continue;
            }
        };

        match pipeline.ingest_raw(raw) {
            Ok(RouteOutcome::Queued | RouteOutcome::QueuedWithShed) => outcome.accepted += 1,
            Ok(RouteOutcome::Dropped) => outcome.dropped += 1,
            Err(ScanError::ChannelClosed(kind)) => {
                debug!(channel = %kind, "pipeline closed, discarding frame");
                outcome.closed = true;
                break;
            }
            Err(error) => {
                debug!(%error, "tick not ingested");
                outcome.rejected += 1;
            }
        }
    }

    outcome
}

/// Feed connection loop with auto-reconnect. Returns once the pipeline stops accepting ticks.
pub async fn run_feed_loop(config: FeedConfig, pipeline: Arc<Pipeline>) {
    info!(url = %config.url, symbols = config.symbols.len(), "starting tick feed client");
    let subscribe = FeedSubscribe::new(&config.symbols);
    let mut attempt = 0u32;

    loop {
        match connect_async(config.url.as_str()).await {
            Ok((ws_stream, _)) => {
                info!(url = %config.url, "connected to tick feed");
                attempt = 0;

                let (mut write, read) = ws_stream.split();

                match serde_json::to_string(&subscribe) {
                    Ok(json) => {
                        if let Err(error) = write.send(Message::Text(json.into())).await {
                            warn!(%error, "failed to send feed subscription");
                        } else {
                            info!(channels = ?subscribe.channels, "subscribed to tick feed");
                        }
                    }
                    Err(error) => error!(%error, "failed to serialise feed subscription"),
                }

                let mut read = TimeoutStream::new(read, config.read_timeout);
                let mut totals = FrameOutcome::default();
                while let Some(message) = read.next().await {
                    let outcome = match message {
                        Ok(Message::Text(text)) => ingest_frame(&pipeline, &text),
                        Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                            Ok(text) => ingest_frame(&pipeline, text),
                            Err(error) => {
                                warn!(%error, "ignoring non UTF-8 binary frame");
                                continue;
                            }
                        },
                        Ok(Message::Close(frame)) => {
                            info!(?frame, "tick feed closed the connection");
                            break;
                        }
                        Ok(_) => continue,
                        Err(error) => {
                            warn!(%error, "tick feed read failed");
                            break;
                        }
                    };

                    if outcome.dropped > 0 || outcome.rejected > 0 {
                        debug!(
                            dropped = outcome.dropped,
                            rejected = outcome.rejected,
                            "feed frame partially ingested"
                        );
                    }
                    totals.accumulate(outcome);
                    if totals.closed {
                        info!(
                            ticks = totals.accepted,
                            dropped = totals.dropped,
                            rejected = totals.rejected,
                            "pipeline stopped, closing tick feed"
                        );
                        let _ = write.send(Message::Close(None)).await;
                        return;
                    }
                }

                if read.timed_out() {
                    warn!(url = %config.url, "tick feed went idle");
                }
                info!(
                    ticks = totals.accepted,
                    dropped = totals.dropped,
                    rejected = totals.rejected,
                    "tick feed disconnected"
                );
            }
            Err(error) => {
                warn!(url = %config.url, %error, "failed to connect to tick feed");
            }
        }

        attempt = attempt.saturating_add(1);
        let delay = config.reconnect_delay(attempt);
        info!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting to tick feed");
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tickscan_data::{config::ScanConfig, sink::LogSink};

    #[test]
    fn test_reconnect_delay() {
        struct TestCase {
            input: u32,
            expected: Duration,
        }

        let config = FeedConfig::default()
            .with_reconnect_delay(Duration::from_millis(500), Duration::from_secs(5));

        let tests = vec![
            TestCase {
                // TC0: first attempt waits the initial delay
                input: 1,
                expected: Duration::from_millis(500),
            },
            TestCase {
                // TC1: doubles per attempt
                input: 3,
                expected: Duration::from_secs(2),
            },
            TestCase {
                // TC2: capped at the maximum
                input: 5,
                expected: Duration::from_secs(5),
            },
            TestCase {
                // TC3: huge attempt counts saturate rather than overflow
                input: u32::MAX,
                expected: Duration::from_secs(5),
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = config.reconnect_delay(test.input);
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_parse_symbols() {
        assert_eq!(
            parse_symbols("aapl, MSFT,,spy "),
            vec![Symbol::new("AAPL"), Symbol::new("MSFT"), Symbol::new("SPY")]
        );
        assert!(parse_symbols(" , ").is_empty());
    }

    #[tokio::test]
    async fn test_ingest_frame() {
        struct TestCase {
            input: &'static str,
            expected: FrameOutcome,
        }

        let pipeline = Pipeline::new(ScanConfig::default(), Arc::new(LogSink)).unwrap();

        // 2024-07-09 16:00:00 UTC in epoch millis
        let tests = vec![
            TestCase {
                // TC0: unknown event type and zero price are rejected, the rest ingested
                input: r#"[
                    {"ticker":"spy","price":550.0,"volume":10,"timestamp":1720540800000,"event_type":"T"},
                    {"ticker":"spy","price":550.1,"volume":10,"timestamp":1720540801000,"event_type":"X"},
                    {"ticker":"spy","price":0.0,"volume":10,"timestamp":1720540802000,"event_type":"T"}
                ]"#,
                expected: FrameOutcome {
                    accepted: 1,
                    dropped: 0,
                    rejected: 2,
                    closed: false,
                },
            },
            TestCase {
                // TC1: an undecodable element does not hide the valid one beside it
                input: r#"[
                    {"ticker":"qqq","price":480.0,"volume":10,"timestamp":1720540800000,"event_type":"T"},
                    {"ticker":"qqq","volume":10,"timestamp":1720540801000,"event_type":"T"}
                ]"#,
                expected: FrameOutcome {
                    accepted: 1,
                    dropped: 0,
                    rejected: 1,
                    closed: false,
                },
            },
            TestCase {
                // TC2: bare tick missing its price
                input: r#"{"ticker":"spy","volume":10,"timestamp":1720540803000,"event_type":"T"}"#,
                expected: FrameOutcome {
                    accepted: 0,
                    dropped: 0,
                    rejected: 1,
                    closed: false,
                },
            },
            TestCase {
                // TC3: heartbeats are not ticks
                input: r#"{"status":"ok"}"#,
                expected: FrameOutcome::default(),
            },
            TestCase {
                // TC4: not JSON at all
                input: "not json",
                expected: FrameOutcome {
                    accepted: 0,
                    dropped: 0,
                    rejected: 1,
                    closed: false,
                },
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = ingest_frame(&pipeline, test.input);
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }

        // Unknown event type, missing price twice, and the unparsable frame
        assert_eq!(pipeline.health().malformed, 4);

        pipeline.shutdown().await;

        let tick = r#"{"ticker":"spy","price":551.0,"volume":10,"timestamp":1720540804000,"event_type":"T"}"#;
        assert!(ingest_frame(&pipeline, tick).closed);
    }

    #[test]
    fn test_frame_outcome_accumulate() {
        let mut totals = FrameOutcome::default();
        totals.accumulate(FrameOutcome {
            accepted: 3,
            dropped: 1,
            rejected: 2,
            closed: false,
        });
        totals.accumulate(FrameOutcome {
            accepted: 1,
            dropped: 0,
            rejected: 1,
            closed: true,
        });

        assert_eq!(
            totals,
            FrameOutcome {
                accepted: 4,
                dropped: 1,
                rejected: 3,
                closed: true,
            }
        );
    }
}
