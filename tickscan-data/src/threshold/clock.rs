use crate::{
    config::{ClockConfig, PeriodWindows},
    event::MarketPeriod,
};
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, Utc, Weekday};

/// Converts UTC instants into exchange-local time and [`MarketPeriod`]s.
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct ExchangeClock {
    utc_offset: Duration,
    observe_us_dst: bool,
    windows: PeriodWindows,
}

impl ExchangeClock {
    pub fn new(config: &ClockConfig, windows: PeriodWindows) -> Self {
        Self {
            utc_offset: Duration::minutes(i64::from(config.utc_offset_minutes)),
            observe_us_dst: config.observe_us_dst,
            windows,
        }
    }

    /// Exchange-local wall-clock time of the provided instant.
    pub fn local_time(&self, at: DateTime<Utc>) -> NaiveDateTime {
        let offset = if self.is_daylight_saving(at) {
            self.utc_offset + Duration::hours(1)
        } else {
            self.utc_offset
        };
        at.naive_utc() + offset
    }

    /// US rules: from 02:00 local on the second Sunday of March until 02:00 local on the
    /// first Sunday of November.
    pub fn is_daylight_saving(&self, at: DateTime<Utc>) -> bool {
        if !self.observe_us_dst {
            return false;
        }

        let year = (at.naive_utc() + self.utc_offset).year();
        let transition = |month, nth, offset: Duration| {
            NaiveDate::from_weekday_of_month_opt(year, month, Weekday::Sun, nth)
                .and_then(|date| date.and_hms_opt(2, 0, 0))
                .map(|local| local - offset)
        };

        match (
            transition(3, 2, self.utc_offset),
            transition(11, 1, self.utc_offset + Duration::hours(1)),
        ) {
            (Some(start), Some(end)) => {
                let now = at.naive_utc();
                start <= now && now < end
            }
            _ => false,
        }
    }

    pub fn period_at(&self, at: DateTime<Utc>) -> MarketPeriod {
        let local = self.local_time(at);
        if matches!(local.weekday(), Weekday::Sat | Weekday::Sun) {
            return MarketPeriod::Closed;
        }

        let time = local.time();
        let windows = &self.windows;
        if time < windows.premarket_open {
            MarketPeriod::Closed
        } else if time < windows.market_open {
            MarketPeriod::Premarket
        } else if time < windows.midday_start {
            MarketPeriod::Opening
        } else if time < windows.closing_start {
            MarketPeriod::Midday
        } else if time < windows.market_close {
            MarketPeriod::Closing
        } else if time < windows.afterhours_close {
            MarketPeriod::Afterhours
        } else {
            MarketPeriod::Closed
        }
    }
}

impl Default for ExchangeClock {
    fn default() -> Self {
        Self::new(&ClockConfig::default(), PeriodWindows::default())
    }
}
