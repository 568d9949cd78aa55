//! Job counts per state.

use anyhow::Result;
use serde::Serialize;
use tabled::Tabled;

use runmanager_core::jobs::JobState;
use runmanager_core::scheduler::RunStats;

use super::Session;
use crate::output::{self, OutputFormat};

#[derive(Debug, Serialize, Tabled)]
struct StateRow {
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Jobs")]
    count: u64,
}

pub async fn execute(session: &Session, format: OutputFormat) -> Result<()> {
    let store = session.open_store().await?;
    let totals = store.stats(None).await?;
    store.close().await;
    print_stats(&totals, format)
}

pub fn print_stats(stats: &RunStats, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Table => {
            let mut rows: Vec<StateRow> = JobState::ALL
                .into_iter()
                .map(|state| StateRow {
                    state: output::state_label(state),
                    count: stats.count(state),
                })
                .collect();
            rows.push(StateRow {
                state: "total".to_string(),
                count: stats.total,
            });
            output::print_list(&rows, format)
        }
        _ => output::print_item(stats, format),
    }
}
