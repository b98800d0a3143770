pub mod engine;
pub mod executor;
pub mod inventory;
pub mod planner;

pub use engine::{EnvOutcome, OutcomeStatus, SyncConfig, SyncEngine, SyncReport};
pub use executor::{ExecutorConfig, TransferExecutor};
pub use inventory::{build_inventories, Inventories, InventoryFilter, LocalEnv, RemoteEnv};
pub use planner::{plan, summarize, PlanEntry, PlanSummary, SyncAction};
