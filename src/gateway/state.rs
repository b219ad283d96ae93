use std::sync::Arc;

use crate::ledger::LedgerService;
use crate::websocket::ConnectionRegistry;

/// Gateway shared state
#[derive(Clone)]
pub struct AppState {
    /// Ledger query and transfer operations
    pub ledger: Arc<LedgerService>,
    /// Push subscribers
    pub ws_registry: Arc<ConnectionRegistry>,
    /// Per-connection outbound queue depth
    pub ws_outbound_capacity: usize,
}

impl AppState {
    pub fn new(
        ledger: Arc<LedgerService>,
        ws_registry: Arc<ConnectionRegistry>,
        ws_outbound_capacity: usize,
    ) -> Self {
        Self {
            ledger,
            ws_registry,
            ws_outbound_capacity,
        }
    }
}
