//! `steward run`, `steward resume`, and `steward cancel`.

use anyhow::Result;
use console::style;

use steward::chain::executor::ChainExecutor;
use steward::config::StewardConfig;
use steward::run::{Classification, Run, RunStatus, RunStore};

pub async fn cmd_run(
    config: StewardConfig,
    ticket: &str,
    chain: Option<&str>,
    classification: Classification,
) -> Result<()> {
    let executor = ChainExecutor::new(config)?;
    let run = executor.create_run(ticket, chain, classification)?;
    println!(
        "Created run {} for ticket {} (chain '{}')",
        style(&run.run_id).cyan(),
        ticket,
        run.chain_name
    );

    let done = executor.run_chain(&run.run_id).await?;
    print_outcome(&done);
    if done.status != RunStatus::Succeeded {
        std::process::exit(1);
    }
    Ok(())
}

pub async fn cmd_resume(config: StewardConfig, run_id: &str) -> Result<()> {
    let executor = ChainExecutor::new(config)?;
    let done = executor.run_chain(run_id).await?;
    print_outcome(&done);
    if done.status != RunStatus::Succeeded {
        std::process::exit(1);
    }
    Ok(())
}

pub fn cmd_cancel(config: StewardConfig, run_id: &str) -> Result<()> {
    let store = RunStore::new(&config.paths.state_root);
    store.request_cancel(run_id)?;
    println!(
        "Run {} marked for termination at the next phase boundary.",
        style(run_id).cyan()
    );
    Ok(())
}

fn print_outcome(run: &Run) {
    let status = match run.status {
        RunStatus::Succeeded => style(run.status.as_str()).green(),
        RunStatus::Failed => style(run.status.as_str()).red(),
        RunStatus::Blocked => style(run.status.as_str()).yellow(),
        _ => style(run.status.as_str()).dim(),
    };
    println!("Run {} ended: {}", style(&run.run_id).cyan(), status);

    for record in &run.phase_history {
        let mark = match record.outcome {
            steward::run::PhaseOutcomeKind::Success => style("ok").green(),
            _ => style(record.outcome.as_str()).red(),
        };
        println!("  {:10} {} {}", record.phase_name, mark, record.detail.summary);
    }
    if !run.next_steps.is_empty() {
        println!("Next steps: {}", run.next_steps.join(", "));
    }
}
