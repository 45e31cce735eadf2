use std::collections::HashSet;

use chrono::{Datelike, Days, NaiveDate, Weekday};

/// Weekdays minus a fixed holiday list.
pub struct TradingCalendar {
    holidays: HashSet<NaiveDate>,
}

impl TradingCalendar {
    pub fn new(holidays: impl IntoIterator<Item = NaiveDate>) -> Self {
        Self {
            holidays: holidays.into_iter().collect(),
        }
    }

    pub fn is_trading_day(&self, d: NaiveDate) -> bool {
        !matches!(d.weekday(), Weekday::Sat | Weekday::Sun) && !self.holidays.contains(&d)
    }

    /// `today` if it is a trading day, otherwise the closest one before it.
    pub fn last_trading_day(&self, today: NaiveDate) -> NaiveDate {
        let mut d = today;
        while !self.is_trading_day(d) {
            match d.checked_sub_days(Days::new(1)) {
                Some(prev) => d = prev,
                None => break,
            }
        }
        d
    }

    /// The last `n` trading days up to and including `today`, most recent first.
    pub fn trading_days_back(&self, today: NaiveDate, n: usize) -> Vec<NaiveDate> {
        let mut days = Vec::new();
        let mut d = today;
        while days.len() < n {
            if self.is_trading_day(d) {
                days.push(d);
            }
            match d.checked_sub_days(Days::new(1)) {
                Some(prev) => d = prev,
                None => break,
            }
        }
        days
    }
}
