//! Operator CLI: inspect and drive the sync engine by hand

use anyhow::{anyhow, Context};
use clap::{Subcommand, ValueEnum};
use serde_json::Value;

use menu_sync::conflict::{Conflict, Resolution};
use menu_sync::recovery::{Modifications, RecoveryOutcome, RecoveryPlan, Strategy};
use menu_sync::sync::{DrainReport, EntityRefresh, PendingOperation};
use menu_sync::SyncRuntime;

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the background sync loop until interrupted
    Run,

    /// Show sync status and recent history
    Status,

    /// Replay the pending operation queue once
    Drain,

    /// Refresh every collection from the server
    Refresh,

    /// List pending operations in replay order
    Queue,

    /// List recovery plans
    Plans,

    /// Execute the recovery plan of an operation now
    Recover {
        /// Operation id
        operation_id: String,
    },

    /// Requeue an operation with corrected data
    Requeue {
        /// Operation id
        operation_id: String,
        /// Replacement payload (JSON)
        #[arg(long)]
        data: String,
        /// Note kept with the plan
        #[arg(long)]
        note: Option<String>,
    },

    /// Override the recovery strategy of an operation
    Strategy {
        /// Operation id
        operation_id: String,
        /// retry, requeue, escalate, modify or manual
        strategy: String,
    },

    /// List unresolved conflicts
    Conflicts,

    /// Resolve a conflict
    Resolve {
        /// Conflict id
        conflict_id: String,
        #[arg(value_enum)]
        resolution: ResolutionArg,
        /// Fields to merge over the server record (JSON, merge only)
        #[arg(long)]
        data: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ResolutionArg {
    KeepLocal,
    KeepServer,
    Merge,
}

fn parse_json(raw: &str) -> anyhow::Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("invalid JSON: {}", raw))
}

/// Execute a one-shot command. `Run` is handled by the caller.
pub async fn execute_command(runtime: &SyncRuntime, command: Commands) -> anyhow::Result<String> {
    match command {
        Commands::Run => Err(anyhow!("run is not a one-shot command")),

        Commands::Status => {
            let status = runtime.status.current();
            let history = runtime.status.history();
            let queued = runtime.queue.len()?;
            let mut out = serde_json::to_string_pretty(&status)?;
            out.push_str(&format!("\nQueued operations: {}", queued));
            if let Some(last) = history.last() {
                out.push_str(&format!(
                    "\nLast drain: processed={} failed={} retrying={} deferred={} ({} ms)",
                    last.processed,
                    last.failed,
                    last.retrying,
                    last.deferred,
                    last.duration_ms()
                ));
            }
            Ok(out)
        }

        Commands::Drain => {
            let report = runtime.engine.drain().await?;
            Ok(format_drain(&report))
        }

        Commands::Refresh => {
            let results = runtime.refresher.refresh_all().await?;
            Ok(format_refresh(&results))
        }

        Commands::Queue => Ok(format_queue(&runtime.queue.list()?)),

        Commands::Plans => Ok(format_plans(&runtime.recovery.plans()?)),

        Commands::Recover { operation_id } => {
            let outcome = runtime.recovery.execute_recovery(&operation_id).await?;
            Ok(format_outcome(&outcome))
        }

        Commands::Requeue {
            operation_id,
            data,
            note,
        } => {
            let modifications = Modifications {
                data: Some(parse_json(&data)?),
                note,
            };
            runtime
                .recovery
                .set_modifications(&operation_id, modifications)?;
            let outcome = runtime.recovery.execute_recovery(&operation_id).await?;
            Ok(format_outcome(&outcome))
        }

        Commands::Strategy {
            operation_id,
            strategy,
        } => {
            let strategy = Strategy::parse(&strategy)
                .ok_or_else(|| anyhow!("unknown strategy: {}", strategy))?;
            let plan = runtime.recovery.set_strategy(&operation_id, strategy)?;
            Ok(format_plans(&[plan]))
        }

        Commands::Conflicts => Ok(format_conflicts(&runtime.refresher.conflicts()?)),

        Commands::Resolve {
            conflict_id,
            resolution,
            data,
        } => {
            let resolution = match (resolution, data) {
                (ResolutionArg::KeepLocal, _) => Resolution::KeepLocal,
                (ResolutionArg::KeepServer, _) => Resolution::KeepServer,
                (ResolutionArg::Merge, Some(raw)) => Resolution::Merge(parse_json(&raw)?),
                (ResolutionArg::Merge, None) => return Err(anyhow!("merge needs --data")),
            };
            runtime.refresher.resolve_conflict(&conflict_id, resolution)?;
            Ok(format!("Resolved {}", conflict_id))
        }
    }
}

fn format_drain(report: &DrainReport) -> String {
    format!(
        "Drain finished in {} ms: processed={} failed={} retrying={} deferred={}",
        report.duration_ms, report.processed, report.failed, report.retrying, report.deferred
    )
}

fn format_refresh(results: &[EntityRefresh]) -> String {
    let mut out = String::from("=== Refresh ===\n");
    for r in results {
        out.push_str(&format!(
            "  {:<14} {:>5} records  {} conflicts\n",
            r.entity.collection(),
            r.records,
            r.conflicts.len()
        ));
    }
    out
}

fn format_queue(ops: &[PendingOperation]) -> String {
    if ops.is_empty() {
        return "Queue is empty".to_string();
    }
    let mut out = format!("=== Pending Operations ({}) ===\n", ops.len());
    for op in ops {
        let hold = if op.on_hold { " [held]" } else { "" };
        out.push_str(&format!(
            "  {} {} {} {} retries={}{}\n",
            op.id, op.operation_type, op.http_method, op.target_endpoint, op.retry_count, hold
        ));
        if let Some(err) = &op.last_error {
            out.push_str(&format!("      last error: {}\n", err.message));
        }
    }
    out
}

fn format_plans(plans: &[RecoveryPlan]) -> String {
    if plans.is_empty() {
        return "No recovery plans".to_string();
    }
    let mut out = String::from("=== Recovery Plans ===\n");
    for plan in plans {
        out.push_str(&format!(
            "  {} {:?} strategy={} error={} attempts={}\n",
            plan.operation_id, plan.status, plan.strategy, plan.error_type, plan.attempts
        ));
    }
    out
}

fn format_outcome(outcome: &RecoveryOutcome) -> String {
    match outcome {
        RecoveryOutcome::Recovered { operation_id } => format!("Recovered {}", operation_id),
        RecoveryOutcome::Failed(failure) => format!(
            "Failed again ({}): {}; strategy now {}{}",
            failure.error.error_type,
            failure.error.message,
            failure.strategy,
            if failure.requires_action { ", needs action" } else { "" }
        ),
    }
}

fn format_conflicts(conflicts: &[Conflict]) -> String {
    if conflicts.is_empty() {
        return "No conflicts".to_string();
    }
    let mut out = String::from("=== Conflicts ===\n");
    for c in conflicts {
        out.push_str(&format!(
            "  {} local={} server={}\n",
            c.id, c.local_id, c.server_id
        ));
    }
    out
}
