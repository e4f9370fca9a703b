//! `opscore goals` — read-only table listing for operators, bypassing the
//! HTTP surface (`spec.md` §6).

use comfy_table::{presets, Cell, Color, ContentArrangement, Table};

use crate::config::Config;
use crate::domain::models::{GoalKind, GoalStatus};
use crate::domain::ports::{GoalFilter, Store};
use crate::store::{initialize_database, SqliteStore};

fn status_cell(status: GoalStatus) -> Cell {
    let cell = Cell::new(status.as_str());
    match status {
        GoalStatus::Completed => cell.fg(Color::Green),
        GoalStatus::Rejected => cell.fg(Color::Red),
        GoalStatus::Approved => cell.fg(Color::Cyan),
        GoalStatus::Identified => cell.fg(Color::Yellow),
    }
}

pub async fn list_goals(config: &Config, status: Option<&str>, kind: Option<&str>, limit: i64) -> anyhow::Result<()> {
    let database_url = format!("sqlite:{}", config.database_path);
    let pool = initialize_database(&database_url).await?;
    let store = SqliteStore::new(pool);

    let filter = GoalFilter { status: status.and_then(GoalStatus::from_str), kind: kind.and_then(GoalKind::from_str) };
    let goals = store.list_goals(filter, limit).await?;

    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL).set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["ID", "Kind", "Status", "Impact", "Description"]);
    for goal in &goals {
        table.add_row(vec![
            Cell::new(&goal.id.to_string()[..8]),
            Cell::new(goal.kind.as_str()),
            status_cell(goal.status),
            Cell::new(format!("{:.1}", goal.impact_score)),
            Cell::new(&goal.description),
        ]);
    }

    println!("{} goal(s)", goals.len());
    println!("{table}");
    Ok(())
}
