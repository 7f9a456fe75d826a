//! Kernel - core infrastructure, constructed once at startup and passed by
//! reference into every service. Replaces the "reach for a singleton
//! anywhere" pattern with an explicit struct assembled in `main` and handed
//! to whatever needs it.

use std::sync::Arc;

use sqlx::PgPool;
use ticker_core::{BusinessDayCalendar, QuoteSource, RateLimitTracker, Settings, Store};

/// Everything a running service depends on. Holds no business logic of its
/// own; it is pure dependency wiring.
pub struct Kernel {
    pub db_pool: PgPool,
    pub store: Arc<dyn Store>,
    pub rate_limit_tracker: Arc<dyn RateLimitTracker>,
    pub quote_source: Arc<dyn QuoteSource>,
    pub business_day_calendar: Arc<dyn BusinessDayCalendar>,
    pub settings: Settings,
}

impl Kernel {
    pub fn new(
        db_pool: PgPool,
        store: Arc<dyn Store>,
        rate_limit_tracker: Arc<dyn RateLimitTracker>,
        quote_source: Arc<dyn QuoteSource>,
        business_day_calendar: Arc<dyn BusinessDayCalendar>,
        settings: Settings,
    ) -> Self {
        Self {
            db_pool,
            store,
            rate_limit_tracker,
            quote_source,
            business_day_calendar,
            settings,
        }
    }
}
