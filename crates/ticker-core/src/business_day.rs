//! Pluggable business-day predicate.
//!
//! The distilled requirements left the business-day calendar as an open
//! question rather than hardcoding Monday-through-Friday. This trait is the
//! resolution: a `BusinessDayCalendar` decides whether a given local date is
//! a trading day, with `WeekdayCalendar` as the shipped default and room for
//! a holiday-aware implementation to be swapped in later without touching
//! the scheduler.

use chrono::{Datelike, NaiveDate, Weekday};

/// Decides whether a given date is a business day in some calendar.
pub trait BusinessDayCalendar: Send + Sync {
    fn is_business_day(&self, date: NaiveDate) -> bool;

    /// The next business day strictly after `date`.
    fn next_business_day(&self, date: NaiveDate) -> NaiveDate {
        let mut next = date.succ_opt().expect("date overflow");
        while !self.is_business_day(next) {
            next = next.succ_opt().expect("date overflow");
        }
        next
    }
}

/// Monday through Friday, no holiday awareness. The default calendar.
#[derive(Debug, Clone, Copy, Default)]
pub struct WeekdayCalendar;

impl BusinessDayCalendar for WeekdayCalendar {
    fn is_business_day(&self, date: NaiveDate) -> bool {
        !matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
    }
}
