//! GameEngine (§4.8–§4.11): round state machine, tick loop, and bet
//! admission, composed from the other components.
//!
//! The hot path is modeled as a single Tokio task that owns `&mut
//! GameState` exclusively (no `Mutex` on the hot fields). Admission and
//! the tick timer both route through one `mpsc` command channel so they
//! never run concurrently with each other — a direct, idiomatic
//! translation of spec §5's "cooperative single logical thread"
//! requirement using Rust's actor-via-channel idiom, itself grounded in
//! the teacher's heavy use of channels (settlement pipeline) and
//! `broadcast` (event fan-out) throughout `vault`/`main.rs`.

pub mod admission;
pub mod bet_heap;
pub mod multiplier;
pub mod price_feed;
pub mod round;
pub mod snapshots;
pub mod tick;

use crate::config::Config;
use crate::errors::EngineError;
use crate::ledger::{FinancialLedger, HousePoolLedger};
use crate::locks::{CacheStore, LockService};
use crate::models::GameState;
use crate::protocol::{EventTarget, RoutedEvent, ServerEvent};
use crate::risk::RiskManager;
use crate::settlement::SettlementQueueHandle;
use crate::store::Store;
use bet_heap::BetHeap;
use rust_decimal::Decimal;
use snapshots::SnapshotBuffer;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};

pub use admission::{PlaceBetOutcome, PlaceBetRequest};

/// Immutable (for the engine's lifetime) collaborators the actor holds.
pub struct EngineDeps {
    pub store: Arc<dyn Store>,
    pub cache: Arc<dyn CacheStore>,
    pub locks: LockService,
    pub risk: RiskManager,
    pub ledger: FinancialLedger,
    pub house_pool: HousePoolLedger,
    pub snapshots: Arc<SnapshotBuffer>,
    pub settlement: SettlementQueueHandle,
    pub events: broadcast::Sender<RoutedEvent>,
    pub config: Arc<Config>,
}

impl EngineDeps {
    pub fn emit(&self, target: EventTarget, event: ServerEvent) {
        // A lagging/absent subscriber is not a delivery failure worth
        // logging on every tick; the gateway is the only consumer.
        let _ = self.events.send(RoutedEvent { target, event });
    }

    pub fn broadcast(&self, event: ServerEvent) {
        self.emit(EventTarget::Broadcast, event);
    }
}

/// A read-only view of `GameState` for the gateway's state-snapshot path.
#[derive(Debug, Clone)]
pub struct GameStateView {
    pub round_id: String,
    pub status: String,
    pub asset: String,
    pub start_price: Decimal,
    pub current_price: Decimal,
    pub current_row: f64,
    pub elapsed: f64,
    pub round_start_time_ms: i64,
}

impl From<&GameState> for GameStateView {
    fn from(s: &GameState) -> Self {
        Self {
            round_id: s.round_id.clone(),
            status: s.status.as_str().to_string(),
            asset: s.asset.clone(),
            start_price: s.start_price,
            current_price: s.current_price,
            current_row: s.current_row,
            elapsed: s.elapsed,
            round_start_time_ms: s.round_start_time_ms,
        }
    }
}

enum Command {
    StartRound {
        resp: oneshot::Sender<Result<String, EngineError>>,
    },
    PlaceBet {
        req: PlaceBetRequest,
        resp: oneshot::Sender<Result<PlaceBetOutcome, EngineError>>,
    },
    Refund {
        order_id: String,
        resp: oneshot::Sender<Result<(), EngineError>>,
    },
    EndRound {
        reason: String,
    },
    CancelRound {
        reason: String,
    },
    StateSnapshot {
        resp: oneshot::Sender<Option<GameStateView>>,
    },
    Tick,
}

/// Cloneable handle admission callers (the gateway) and the tick timer use
/// to talk to the engine's owning task.
#[derive(Clone)]
pub struct GameEngineHandle {
    cmd_tx: mpsc::Sender<Command>,
}

impl GameEngineHandle {
    pub async fn start_round(&self) -> Result<String, EngineError> {
        let (resp, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::StartRound { resp })
            .await
            .map_err(|_| EngineError::Internal(anyhow::anyhow!("engine task gone")))?;
        rx.await
            .map_err(|_| EngineError::Internal(anyhow::anyhow!("engine task dropped response")))?
    }

    pub async fn place_bet(
        &self,
        req: PlaceBetRequest,
    ) -> Result<PlaceBetOutcome, EngineError> {
        let (resp, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::PlaceBet { req, resp })
            .await
            .map_err(|_| EngineError::Internal(anyhow::anyhow!("engine task gone")))?;
        rx.await
            .map_err(|_| EngineError::Internal(anyhow::anyhow!("engine task dropped response")))?
    }

    pub async fn refund(&self, order_id: String) -> Result<(), EngineError> {
        let (resp, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Refund { order_id, resp })
            .await
            .map_err(|_| EngineError::Internal(anyhow::anyhow!("engine task gone")))?;
        rx.await
            .map_err(|_| EngineError::Internal(anyhow::anyhow!("engine task dropped response")))?
    }

    pub async fn end_round(&self, reason: impl Into<String>) {
        let _ = self
            .cmd_tx
            .send(Command::EndRound {
                reason: reason.into(),
            })
            .await;
    }

    pub async fn cancel_round(&self, reason: impl Into<String>) {
        let _ = self
            .cmd_tx
            .send(Command::CancelRound {
                reason: reason.into(),
            })
            .await;
    }

    pub async fn state_snapshot(&self) -> Option<GameStateView> {
        let (resp, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::StateSnapshot { resp })
            .await
            .is_err()
        {
            return None;
        }
        rx.await.ok().flatten()
    }
}

/// A round-ending action `on_tick` detected but deferred — it must run
/// after `on_tick` returns so the mutable borrow of `self.state` it held
/// while scanning is fully released first (`end_round`/`cancel_round` also
/// need `&mut self`).
pub(crate) enum PendingRoundAction {
    End(String),
    Cancel(String),
}

/// Owns `GameState` exclusively; every mutation happens inside this task.
pub(crate) struct EngineActor {
    pub(crate) state: Option<GameState>,
    pub(crate) heap: BetHeap,
    pub(crate) round_lock_token: Option<String>,
    pub(crate) deps: EngineDeps,
    pub(crate) last_state_update_emit_ms: i64,
    pub(crate) last_snapshot_elapsed: f64,
    pub(crate) pending_action: Option<PendingRoundAction>,
}

impl EngineActor {
    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    async fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::StartRound { resp } => {
                let result = self.start_round().await;
                let _ = resp.send(result);
            }
            Command::PlaceBet { req, resp } => {
                let result = self.place_bet(req).await;
                let _ = resp.send(result);
            }
            Command::Refund { order_id, resp } => {
                let result = self.refund(&order_id).await;
                let _ = resp.send(result);
            }
            Command::EndRound { reason } => {
                self.end_round(&reason).await;
            }
            Command::CancelRound { reason } => {
                self.cancel_round(&reason).await;
            }
            Command::StateSnapshot { resp } => {
                let view = self.state.as_ref().map(GameStateView::from);
                let _ = resp.send(view);
            }
            Command::Tick => {
                self.on_tick().await;
                match self.pending_action.take() {
                    Some(PendingRoundAction::End(reason)) => self.end_round(&reason).await,
                    Some(PendingRoundAction::Cancel(reason)) => self.cancel_round(&reason).await,
                    None => {}
                }
            }
        }
    }
}

/// Spawns the engine's owning task and returns a handle to it. The tick
/// timer lives inside the same task so tick and admission never overlap.
pub fn spawn(deps: EngineDeps) -> GameEngineHandle {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<Command>(1024);
    let tick_interval = deps.config.tick_interval;

    let mut actor = EngineActor {
        state: None,
        heap: BetHeap::new(),
        round_lock_token: None,
        deps,
        last_state_update_emit_ms: 0,
        last_snapshot_elapsed: -1.0,
        pending_action: None,
    };

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => actor.handle(cmd).await,
                        None => break,
                    }
                }
                _ = ticker.tick() => {
                    actor.handle(Command::Tick).await;
                }
            }
        }
    });

    GameEngineHandle { cmd_tx }
}
