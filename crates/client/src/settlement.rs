//! Contract settlement poller.
//!
//! On a fixed interval, and right away whenever the price or symbol changes, the
//! poller asks the trading backend to close the user's expired positions at the
//! latest price. Each newly closed position is surfaced once per session as a
//! [`SettlementNotice`]. Failures are logged and the next tick tries again.

use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tradedesk_core::{
    Position, PositionId, PositionsResponse, SettleResponse, SettlementApi, SettlementError,
    SettlementNotice,
};

/// `tokio::time::interval` rejects a zero period.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Settlement poller settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SettlementConfig {
    /// Trading API root, e.g. `http://localhost:3000/api/contract`.
    pub base_url: String,
    pub auth_token: Option<String>,
    pub poll_interval_ms: u64,
    /// Handling fee as a fraction of the stake.
    pub fee_rate: Decimal,
    /// `None` leaves requests unbounded.
    pub request_timeout_secs: Option<u64>,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000/api/contract".to_string(),
            auth_token: None,
            poll_interval_ms: 2_000,
            fee_rate: Decimal::new(1, 3),
            request_timeout_secs: Some(10),
        }
    }
}

impl SettlementConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SettleRequest<'a> {
    symbol: &'a str,
    #[serde(with = "rust_decimal::serde::float")]
    current_price: Decimal,
}

/// Settlement endpoints of the trading backend, authorised with a bearer token.
pub struct HttpSettlementApi {
    http: Client,
    base_url: String,
    auth_token: Option<String>,
}

impl HttpSettlementApi {
    pub fn new(config: &SettlementConfig) -> Result<Self, SettlementError> {
        let mut builder = Client::builder();
        if let Some(secs) = config.request_timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        let http = builder
            .build()
            .map_err(|e| SettlementError::Http(e.to_string()))?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            auth_token: config.auth_token.clone(),
        })
    }

    fn authorised(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl SettlementApi for HttpSettlementApi {
    async fn settle_user(
        &self,
        symbol: &str,
        current_price: Decimal,
    ) -> Result<SettleResponse, SettlementError> {
        let request = self
            .http
            .post(format!("{}/settle-user", self.base_url))
            .json(&SettleRequest {
                symbol,
                current_price,
            });
        let response = self
            .authorised(request)
            .send()
            .await
            .map_err(|e| SettlementError::Http(e.to_string()))?;
        let status = response.status();
        let body: SettleResponse = response
            .json()
            .await
            .map_err(|e| SettlementError::Decode(format!("{} ({})", e, status)))?;
        if !body.success {
            return Err(SettlementError::Rejected(
                body.error.unwrap_or_else(|| status.to_string()),
            ));
        }
        Ok(body)
    }

    async fn closed_positions(&self) -> Result<Vec<Position>, SettlementError> {
        let request = self
            .http
            .get(format!("{}/positions", self.base_url))
            .query(&[("status", "CLOSED")]);
        let response = self
            .authorised(request)
            .send()
            .await
            .map_err(|e| SettlementError::Http(e.to_string()))?;
        let status = response.status();
        let body: PositionsResponse = response
            .json()
            .await
            .map_err(|e| SettlementError::Decode(format!("{} ({})", e, status)))?;
        if !body.success {
            return Err(SettlementError::Rejected(
                body.error.unwrap_or_else(|| status.to_string()),
            ));
        }
        Ok(body.positions)
    }
}

// ---------------------------------------------------------------------------
// Poller
// ---------------------------------------------------------------------------

/// What a single tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// No usable price yet.
    NoPrice,
    /// Another run was still in flight.
    Busy,
    /// Nothing was newly closed.
    Idle,
    Notified(usize),
    Failed,
}

/// Latest market view the poller settles against.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Market {
    pub symbol: String,
    pub price: Option<f64>,
}

struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct SettlementPoller {
    api: Arc<dyn SettlementApi>,
    fee_rate: Decimal,
    in_flight: AtomicBool,
    /// Positions already surfaced in this session.
    shown: Mutex<HashSet<PositionId>>,
    notices: mpsc::UnboundedSender<SettlementNotice>,
}

impl SettlementPoller {
    pub fn new(
        api: Arc<dyn SettlementApi>,
        fee_rate: Decimal,
    ) -> (Self, mpsc::UnboundedReceiver<SettlementNotice>) {
        let (notices, rx) = mpsc::unbounded_channel();
        let poller = Self {
            api,
            fee_rate,
            in_flight: AtomicBool::new(false),
            shown: Mutex::new(HashSet::new()),
            notices,
        };
        (poller, rx)
    }

    pub async fn was_shown(&self, id: PositionId) -> bool {
        self.shown.lock().await.contains(&id)
    }

    /// Run one settlement pass. At most one pass is in flight per poller.
    pub async fn tick(&self, symbol: &str, price: Option<f64>) -> TickOutcome {
        let Some(price) = price.filter(|p| p.is_finite() && *p > 0.0) else {
            return TickOutcome::NoPrice;
        };
        let Ok(price) = Decimal::try_from(price) else {
            return TickOutcome::NoPrice;
        };

        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(symbol, "Settlement run already in flight");
            return TickOutcome::Busy;
        }
        let _guard = InFlight(&self.in_flight);

        let settled = match self.api.settle_user(symbol, price).await {
            Ok(settled) => settled,
            Err(e) => {
                warn!(symbol, error = %e, "Settlement request failed");
                return TickOutcome::Failed;
            }
        };
        if settled.positions.is_empty() {
            return TickOutcome::Idle;
        }

        {
            let shown = self.shown.lock().await;
            if settled.positions.iter().all(|p| shown.contains(&p.id)) {
                return TickOutcome::Idle;
            }
        }

        let closed = match self.api.closed_positions().await {
            Ok(closed) => closed,
            Err(e) => {
                warn!(symbol, error = %e, "Failed to load closed positions");
                return TickOutcome::Failed;
            }
        };

        let mut shown = self.shown.lock().await;
        let mut notified = 0;
        for reported in &settled.positions {
            if shown.contains(&reported.id) {
                continue;
            }
            let Some(position) = closed.iter().find(|p| p.id == reported.id) else {
                warn!(position_id = reported.id, "Settled position missing from closed list");
                continue;
            };
            let Some(notice) = SettlementNotice::from_position(position, self.fee_rate) else {
                warn!(position_id = reported.id, "Settled position has no result yet");
                continue;
            };
            info!(
                position_id = notice.position_id,
                result = ?notice.result,
                profit = %notice.profit,
                "Position settled"
            );
            if self.notices.send(notice).is_err() {
                debug!("Settlement notice receiver dropped");
            }
            shown.insert(reported.id);
            notified += 1;
        }
        TickOutcome::Notified(notified)
    }

    /// Poll on `interval` and on every market change until the handle is dropped.
    ///
    /// Runs happen inside the polling task, so dropping the handle also cancels
    /// a run in flight. Market changes seen during a run are folded into it.
    pub fn spawn(self: Arc<Self>, interval: Duration, market: Market) -> PollerHandle {
        let interval = interval.max(MIN_POLL_INTERVAL);
        let (market_tx, mut market_rx) = watch::channel(market);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = market_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                let market = market_rx.borrow_and_update().clone();
                self.tick(&market.symbol, market.price).await;
                market_rx.mark_unchanged();
            }
        });
        PollerHandle { market: market_tx, task }
    }
}

/// Running poller. Dropping it stops polling.
pub struct PollerHandle {
    market: watch::Sender<Market>,
    task: JoinHandle<()>,
}

impl PollerHandle {
    pub fn set_price(&self, price: Option<f64>) {
        self.market.send_modify(|m| m.price = price);
    }

    pub fn set_symbol(&self, symbol: impl Into<String>) {
        let symbol = symbol.into();
        self.market.send_modify(|m| m.symbol = symbol);
    }

    pub fn stop(self) {
        drop(self);
    }
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
