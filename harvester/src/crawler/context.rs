use std::sync::Arc;

use super::rate_limiter::RateLimiter;
use crate::credentials::CredentialPool;
use crate::ledger::ProgressLedger;
use crate::sink::RecordSink;
use crate::source::AnalyticsSource;

/// Shared services every worker needs for one run.
#[derive(Clone)]
pub struct CrawlContext {
    pub pool: Arc<CredentialPool>,
    pub limiter: Arc<RateLimiter>,
    pub ledger: Arc<ProgressLedger>,
    pub source: Arc<dyn AnalyticsSource>,
    pub sink: Arc<dyn RecordSink>,
}
