use std::sync::Arc;

use crate::{
    booking_service::BookingService, reconcile::Reconciler, repositories::BookingLedger,
    watch::WatchManager,
};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub reconciler: Reconciler,
    pub watches: WatchManager,
    pub bookings: BookingService,
    pub ledger: Arc<dyn BookingLedger>,
    pub cron_secret: Arc<str>,
}
