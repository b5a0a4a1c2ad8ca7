//! adafstore - persistent record layer for ADAF
//!
//! A filesystem-backed, concurrent-safe store. Per-project records live under
//! `<repo>/.adaf/`; global session metas and the feedback ledger live under
//! `$HOME/.adaf/`. Every mutation is write-then-rename atomic, monotonic ids
//! survive crashes via counter reconciliation, and composite updates are
//! serialised by per-entity mutexes.
//!
//! # Modules
//!
//! - [`store`] - the per-project `Store` facade
//! - [`project`], [`plan`], [`issue`], [`wiki`], [`turn`], [`spawn`],
//!   [`looprun`] - entity records and their operations
//! - [`recording`] - per-turn append-only event logs
//! - [`signal`] - marker-file control signals
//! - [`session`] - global session metas with pid reconciliation
//! - [`feedback`] - the profile-score ledger

pub mod error;
pub mod feedback;
pub mod fsutil;
pub mod issue;
pub mod looprun;
pub mod plan;
pub mod project;
pub mod recording;
pub mod session;
pub mod signal;
pub mod spawn;
pub mod store;
pub mod turn;
pub mod wiki;

pub use error::{Result, StoreError};
pub use feedback::{FeedbackLedger, FeedbackRecord, FeedbackSummary};
pub use fsutil::{hex_alias, now_ms};
pub use issue::{Issue, IssueStatus, NewIssue, Priority};
pub use looprun::{LoopMessage, LoopRunRecord, LoopRunStatus, StepMeta};
pub use plan::{NewPlan, Phase, PhaseStatus, Plan, PlanStatus, valid_plan_id};
pub use project::Project;
pub use recording::{RecordedEvent, RecordedEventKind, RecordingSummary};
pub use session::{SessionMeta, SessionStatus, SessionStore, pid_alive};
pub use signal::SignalKind;
pub use spawn::{NewSpawn, SpawnDirection, SpawnMessage, SpawnMessageKind, SpawnRecord, SpawnStatus};
pub use store::{STORE_DIR, Store};
pub use turn::{NewTurn, Turn, TurnReport};
pub use wiki::{Doc, WikiChange, WikiHit, WikiPage};
