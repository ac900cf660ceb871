//! JSON frames exchanged with the tick feed and with subscriber connections.

use crate::{
    error::ScanError,
    event::{DetectionEvent, EventKind, SessionTag, Symbol, Tick, TickKind},
    subscription::{Interest, KindMask, SubscriberId, SymbolFilter},
    threshold::ExchangeClock,
};
use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::sync::Arc;

/// Feed channel carrying every symbol's ticks.
pub const ALL_TICKS_CHANNEL: &str = "ticks.*";

/// Tick as published on the feed, before validation.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct RawTickMessage {
    pub ticker: SmolStr,
    pub price: f64,
    #[serde(default)]
    pub volume: f64,
    /// Epoch milliseconds.
    pub timestamp: i64,
    pub event_type: SmolStr,
    #[serde(default)]
    pub source: Option<SmolStr>,
    #[serde(default)]
    pub open: Option<f64>,
    #[serde(default)]
    pub high: Option<f64>,
    #[serde(default)]
    pub low: Option<f64>,
    #[serde(default)]
    pub close: Option<f64>,
    #[serde(default)]
    pub vwap: Option<f64>,
    #[serde(default)]
    pub bid: Option<f64>,
    #[serde(default)]
    pub ask: Option<f64>,
    #[serde(default)]
    pub session: Option<SmolStr>,
}

impl RawTickMessage {
    /// Normalise into a [`Tick`], deriving the session from `clock` when the feed omits it.
    pub fn into_tick(self, clock: &ExchangeClock) -> Result<Tick, ScanError> {
        let symbol = Symbol::new(self.ticker.trim().to_ascii_uppercase());
        let kind = parse_tick_kind(&self.event_type)?;
        let timestamp = DateTime::from_timestamp_millis(self.timestamp).ok_or_else(|| {
            ScanError::MalformedTick(format!(
                "{symbol} timestamp {} out of range",
                self.timestamp
            ))
        })?;
        let session = match &self.session {
            Some(session) => parse_session(session)?,
            None => clock.period_at(timestamp).session(),
        };

        Ok(Tick {
            symbol,
            price: self.price,
            volume: self.volume,
            timestamp,
            kind,
            session,
            source: self.source,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            vwap: self.vwap,
            bid: self.bid,
            ask: self.ask,
        })
    }
}

/// Map a feed `event_type` onto a [`TickKind`].
pub fn parse_tick_kind(event_type: &str) -> Result<TickKind, ScanError> {
    match event_type {
        "A" | "AM" => Ok(TickKind::Aggregate),
        "T" => Ok(TickKind::Trade),
        "Q" => Ok(TickKind::Quote),
        other => match other.to_ascii_lowercase().as_str() {
            "aggregate" | "agg" => Ok(TickKind::Aggregate),
            "trade" => Ok(TickKind::Trade),
            "quote" => Ok(TickKind::Quote),
            _ => Err(ScanError::MalformedTick(format!(
                "unknown event_type: {event_type}"
            ))),
        },
    }
}

fn parse_session(session: &str) -> Result<SessionTag, ScanError> {
    match session.to_ascii_lowercase().as_str() {
        "pre" | "premarket" | "extended_pre" => Ok(SessionTag::Pre),
        "regular" | "market" | "rth" => Ok(SessionTag::Regular),
        "post" | "afterhours" | "extended_post" => Ok(SessionTag::Post),
        other => Err(ScanError::MalformedTick(format!("unknown session: {other}"))),
    }
}

/// Keys that mark a JSON object as a tick rather than a control message.
const TICK_KEYS: [&str; 2] = ["ticker", "event_type"];

/// Inbound feed frame. Ticks may arrive bare, batched, or wrapped in a channel envelope.
///
/// Elements are kept as raw JSON so one malformed tick does not hide the rest of its frame;
/// [`FeedFrame::into_ticks`] decodes them individually.
#[derive(Clone, PartialEq, Debug)]
pub enum FeedFrame {
    Batch(Vec<serde_json::Value>),
    Envelope {
        channel: SmolStr,
        data: serde_json::Value,
    },
    Tick(serde_json::Value),
    /// Acknowledgements, heartbeats and anything else that is not a tick.
    Other(serde_json::Value),
}

impl FeedFrame {
    /// Classify a decoded JSON document.
    pub fn from_value(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Array(elements) => FeedFrame::Batch(elements),
            serde_json::Value::Object(mut object) if is_envelope(&object) => {
                let channel = object
                    .remove("channel")
                    .and_then(|channel| channel.as_str().map(SmolStr::new))
                    .unwrap_or_default();
                let data = object.remove("data").unwrap_or_default();
                FeedFrame::Envelope { channel, data }
            }
            serde_json::Value::Object(object)
                if TICK_KEYS.iter().any(|key| object.contains_key(*key)) =>
            {
                FeedFrame::Tick(serde_json::Value::Object(object))
            }
            other => FeedFrame::Other(other),
        }
    }

    /// Decode every tick the frame carries, one result per element.
    pub fn into_ticks(self) -> Vec<Result<RawTickMessage, ScanError>> {
        match self {
            FeedFrame::Batch(elements) => elements.into_iter().map(decode_tick).collect(),
            FeedFrame::Envelope { data, .. } => vec![decode_tick(data)],
            FeedFrame::Tick(tick) => vec![decode_tick(tick)],
            FeedFrame::Other(_) => vec![],
        }
    }
}

impl<'de> Deserialize<'de> for FeedFrame {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        serde_json::Value::deserialize(deserializer).map(FeedFrame::from_value)
    }
}

fn is_envelope(object: &serde_json::Map<String, serde_json::Value>) -> bool {
    object.contains_key("data")
        && object.get("channel").is_some_and(serde_json::Value::is_string)
}

fn decode_tick(value: serde_json::Value) -> Result<RawTickMessage, ScanError> {
    RawTickMessage::deserialize(value)
        .map_err(|error| ScanError::MalformedTick(format!("undecodable tick: {error}")))
}

/// Subscription command sent to the feed after connecting.
#[derive(Clone, Eq, PartialEq, Debug, Deserialize, Serialize)]
pub struct FeedSubscribe {
    pub action: SmolStr,
    pub channels: Vec<String>,
}

impl FeedSubscribe {
    /// Subscribe to `ticks.<SYMBOL>` per symbol, or to every tick if `symbols` is empty.
    pub fn new(symbols: &[Symbol]) -> Self {
        let channels = if symbols.is_empty() {
            vec![ALL_TICKS_CHANNEL.to_string()]
        } else {
            symbols
                .iter()
                .map(|symbol| format!("ticks.{}", symbol.to_ascii_uppercase()))
                .collect()
        };

        Self {
            action: SmolStr::new_static("subscribe"),
            channels,
        }
    }
}

/// Request sent by a subscriber connection.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientRequest {
    Subscribe {
        /// Empty, or containing `*`, means every symbol.
        #[serde(default)]
        symbols: Vec<Symbol>,
        /// Empty, or containing `*`/`all`, means every event kind.
        #[serde(default)]
        events: Vec<SmolStr>,
    },
    Unsubscribe,
    Ping,
}

/// Translate a subscribe request into index [`Interest`]s.
pub fn interests(symbols: &[Symbol], events: &[SmolStr]) -> Result<Vec<Interest>, String> {
    let kinds = if events.is_empty() || events.iter().any(|event| event == "*" || event == "all")
    {
        KindMask::ALL
    } else {
        events
            .iter()
            .map(|event| event.parse::<EventKind>())
            .collect::<Result<KindMask, _>>()?
    };

    if symbols.is_empty() || symbols.iter().any(|symbol| symbol == "*") {
        return Ok(vec![Interest::new(SymbolFilter::All, kinds)]);
    }

    Ok(symbols
        .iter()
        .map(|symbol| Symbol::new(symbol.trim().to_ascii_uppercase()))
        .sorted()
        .dedup()
        .map(|symbol| Interest::new(SymbolFilter::Symbol(symbol), kinds))
        .collect())
}

/// Frame sent to a subscriber connection.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Welcome {
        subscriber: SubscriberId,
        timestamp: DateTime<Utc>,
    },
    Subscribed {
        interests: Vec<Interest>,
    },
    Unsubscribed,
    Pong {
        timestamp: DateTime<Utc>,
    },
    Error {
        message: String,
    },
    Events {
        events: Vec<Arc<DetectionEvent>>,
    },
}
