//! HTTP control surface of a running daemon and the client the CLI uses
//! to talk to it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use chrono::Local;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use warp::http::StatusCode;
use warp::Filter;

use crate::stats::aggregator::{DecisionRecord, PeriodSummary, StatsAggregator};
use crate::sync::reload::{ReloadOutcome, Synchronizer};
use crate::sync::snapshot::{SnapshotSlot, SnapshotSummary};

/// Days covered by the summary in `/stats`
const SUMMARY_DAYS: u32 = 7;

/// Control surface errors
#[derive(Error, Debug)]
pub enum ControlError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Daemon answered {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Server error: {0}")]
    Server(#[from] warp::Error),
}

pub type ControlResult<T> = Result<T, ControlError>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatsReply {
    pub total_blocked: u64,
    pub today: DecisionRecord,
    pub last_week: PeriodSummary,
}

impl StatsReply {
    pub fn from_aggregator(stats: &StatsAggregator) -> Self {
        let today = Local::now().date_naive();
        Self {
            total_blocked: stats.total_blocked(),
            today: stats.record_for(today),
            last_week: stats.period_summary(SUMMARY_DAYS, today),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReloadReply {
    pub published: bool,
    pub version: u64,
}

impl From<ReloadOutcome> for ReloadReply {
    fn from(outcome: ReloadOutcome) -> Self {
        match outcome {
            ReloadOutcome::Published(version) => Self { published: true, version },
            ReloadOutcome::Unchanged(version) => Self { published: false, version },
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ErrorReply {
    error: String,
}

/// Everything the control routes read from
#[derive(Clone)]
pub struct ControlState {
    pub slot: Arc<SnapshotSlot>,
    pub stats: Arc<StatsAggregator>,
    pub synchronizer: Arc<Synchronizer>,
}

/// `GET /health`, `GET /stats`, `GET /snapshot`, `POST /reload`
pub fn routes(
    state: ControlState,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    let health_route = warp::path("health")
        .and(warp::path::end())
        .and(warp::get())
        .map(|| "OK");

    let stats = state.stats.clone();
    let stats_route = warp::path("stats")
        .and(warp::path::end())
        .and(warp::get())
        .map(move || warp::reply::json(&StatsReply::from_aggregator(&stats)));

    let slot = state.slot.clone();
    let snapshot_route = warp::path("snapshot")
        .and(warp::path::end())
        .and(warp::get())
        .map(move || warp::reply::json(&slot.current().summary()));

    let synchronizer = state.synchronizer.clone();
    let reload_route = warp::path("reload")
        .and(warp::path::end())
        .and(warp::post())
        .and_then(move || {
            let synchronizer = synchronizer.clone();
            async move {
                let reply = match synchronizer.reload().await {
                    Ok(outcome) => warp::reply::with_status(
                        warp::reply::json(&ReloadReply::from(outcome)),
                        StatusCode::OK,
                    ),
                    Err(e) => {
                        warn!("Reload requested over HTTP failed: {}", e);
                        warp::reply::with_status(
                            warp::reply::json(&ErrorReply { error: e.to_string() }),
                            StatusCode::INTERNAL_SERVER_ERROR,
                        )
                    }
                };
                Ok::<_, warp::Rejection>(reply)
            }
        });

    health_route
        .or(stats_route)
        .or(snapshot_route)
        .or(reload_route)
}

/// Bind the control server and serve it in the background
pub fn start_server(addr: SocketAddr, state: ControlState) -> ControlResult<SocketAddr> {
    let (bound, server) = warp::serve(routes(state)).try_bind_ephemeral(addr)?;
    info!("Control server listening on {}", bound);
    tokio::spawn(server);
    Ok(bound)
}

/// Talks to a running daemon's control server
pub struct ControlClient {
    base: String,
    http: reqwest::Client,
}

impl ControlClient {
    pub fn new(addr: SocketAddr) -> ControlResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            base: format!("http://{}", addr),
            http,
        })
    }

    async fn check(response: reqwest::Response) -> ControlResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ControlError::Status {
            status: status.as_u16(),
            body,
        })
    }

    pub async fn health(&self) -> ControlResult<bool> {
        let response = self.http.get(format!("{}/health", self.base)).send().await?;
        Ok(Self::check(response).await.is_ok())
    }

    pub async fn reload(&self) -> ControlResult<ReloadReply> {
        let response = self.http.post(format!("{}/reload", self.base)).send().await?;
        Ok(Self::check(response).await?.json().await?)
    }

    pub async fn snapshot(&self) -> ControlResult<SnapshotSummary> {
        let response = self.http.get(format!("{}/snapshot", self.base)).send().await?;
        Ok(Self::check(response).await?.json().await?)
    }

    pub async fn stats(&self) -> ControlResult<StatsReply> {
        let response = self.http.get(format!("{}/stats", self.base)).send().await?;
        Ok(Self::check(response).await?.json().await?)
    }
}
