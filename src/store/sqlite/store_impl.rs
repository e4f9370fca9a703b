//! SQLite implementation of the `Store` port (`spec.md` §4.3, §6 persisted
//! state layout).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::domain::error::{StoreError, StoreResult};
use crate::domain::models::{
    Actor, AuditEvent, Goal, GoalKind, GoalOutcome, GoalStatus, LedgerEntry, LedgerFilter, LedgerRange, Project,
    ProjectStatus, Task, TaskError, TaskPriority, TaskResult, TaskStatus,
};
use crate::domain::ports::{GoalFilter, Store};
use crate::domain::Usd;

fn parse_uuid(s: &str) -> StoreResult<Uuid> {
    Uuid::parse_str(s).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn parse_optional_uuid(s: Option<String>) -> StoreResult<Option<Uuid>> {
    s.map(|s| Uuid::parse_str(&s)).transpose().map_err(|e| StoreError::Serialization(e.to_string()))
}

fn parse_datetime(s: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s).map_err(|e| StoreError::Serialization(e.to_string())).map(|dt| dt.with_timezone(&Utc))
}

fn parse_optional_datetime(s: Option<String>) -> StoreResult<Option<DateTime<Utc>>> {
    s.map(|s| DateTime::parse_from_rfc3339(&s).map(|d| d.with_timezone(&Utc)))
        .transpose()
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

fn parse_usd(s: &str) -> StoreResult<Usd> {
    s.parse::<i64>().map(Usd::micros).map_err(|e| StoreError::Serialization(e.to_string()))
}

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn load_depends_on(&self, task_id: Uuid) -> StoreResult<Vec<Uuid>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT parent_task_id FROM task_dependencies WHERE task_id = ?")
                .bind(task_id.to_string())
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(|(s,)| parse_uuid(&s)).collect()
    }

    async fn save_depends_on(&self, task_id: Uuid, parents: &[Uuid]) -> StoreResult<()> {
        sqlx::query("DELETE FROM task_dependencies WHERE task_id = ?").bind(task_id.to_string()).execute(&self.pool).await?;
        for parent in parents {
            sqlx::query("INSERT INTO task_dependencies (task_id, parent_task_id) VALUES (?, ?)")
                .bind(task_id.to_string())
                .bind(parent.to_string())
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct GoalRow {
    id: String,
    kind: String,
    description: String,
    rationale: String,
    estimated_budget_usd: String,
    estimated_duration_h: f64,
    status: String,
    impact_score: f64,
    source_tag: String,
    metadata: String,
    identified_at: String,
    approved_at: Option<String>,
    approved_by: Option<String>,
    approval_notes: Option<String>,
    effectiveness_score: Option<f64>,
    outcome_measured_at: Option<String>,
    learn_from: i64,
    completed_at: Option<String>,
    version: i64,
}

impl TryFrom<GoalRow> for Goal {
    type Error = StoreError;

    fn try_from(row: GoalRow) -> Result<Self, Self::Error> {
        Ok(Goal {
            id: parse_uuid(&row.id)?,
            kind: GoalKind::from_str(&row.kind).ok_or_else(|| StoreError::Serialization(format!("bad goal kind {}", row.kind)))?,
            description: row.description,
            rationale: row.rationale,
            estimated_budget_usd: parse_usd(&row.estimated_budget_usd)?,
            estimated_duration_h: row.estimated_duration_h,
            status: GoalStatus::from_str(&row.status).ok_or_else(|| StoreError::Serialization(format!("bad goal status {}", row.status)))?,
            impact_score: row.impact_score,
            source_tag: row.source_tag,
            metadata: serde_json::from_str(&row.metadata).unwrap_or_default(),
            identified_at: parse_datetime(&row.identified_at)?,
            approved_at: parse_optional_datetime(row.approved_at)?,
            approved_by: row.approved_by,
            approval_notes: row.approval_notes,
            effectiveness_score: row.effectiveness_score,
            outcome_measured_at: parse_optional_datetime(row.outcome_measured_at)?,
            learn_from: row.learn_from != 0,
            completed_at: parse_optional_datetime(row.completed_at)?,
            version: row.version as u64,
        })
    }
}

const GOAL_COLUMNS: &str = "id, kind, description, rationale, estimated_budget_usd, estimated_duration_h, status, \
    impact_score, source_tag, metadata, identified_at, approved_at, approved_by, approval_notes, \
    effectiveness_score, outcome_measured_at, learn_from, completed_at, version";

#[derive(sqlx::FromRow)]
struct ProjectRow {
    id: String,
    goal_id: String,
    title: String,
    description: String,
    status: String,
    budget_allocated_usd: String,
    budget_spent_usd: String,
    actual_duration_h: Option<f64>,
    created_at: String,
    completed_at: Option<String>,
    version: i64,
}

impl TryFrom<ProjectRow> for Project {
    type Error = StoreError;

    fn try_from(row: ProjectRow) -> Result<Self, Self::Error> {
        Ok(Project {
            id: parse_uuid(&row.id)?,
            goal_id: parse_uuid(&row.goal_id)?,
            title: row.title,
            description: row.description,
            status: ProjectStatus::from_str(&row.status).ok_or_else(|| StoreError::Serialization(format!("bad project status {}", row.status)))?,
            budget_allocated_usd: parse_usd(&row.budget_allocated_usd)?,
            budget_spent_usd: parse_usd(&row.budget_spent_usd)?,
            actual_duration_h: row.actual_duration_h,
            created_at: parse_datetime(&row.created_at)?,
            completed_at: parse_optional_datetime(row.completed_at)?,
            version: row.version as u64,
        })
    }
}

const PROJECT_COLUMNS: &str =
    "id, goal_id, title, description, status, budget_allocated_usd, budget_spent_usd, actual_duration_h, created_at, completed_at, version";

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: String,
    project_id: String,
    kind: String,
    title: String,
    priority: String,
    status: String,
    budget_allocated_usd: String,
    result: Option<String>,
    error: Option<String>,
    attempts: i64,
    max_attempts: i64,
    metadata: String,
    created_at: String,
    started_at: Option<String>,
    finished_at: Option<String>,
    deadline: Option<String>,
    version: i64,
}

const TASK_COLUMNS: &str = "id, project_id, kind, title, priority, status, budget_allocated_usd, result, error, \
    attempts, max_attempts, metadata, created_at, started_at, finished_at, deadline, version";

impl TaskRow {
    fn into_task(self, depends_on: Vec<Uuid>) -> StoreResult<Task> {
        Ok(Task {
            id: parse_uuid(&self.id)?,
            project_id: parse_uuid(&self.project_id)?,
            kind: self.kind,
            title: self.title,
            priority: TaskPriority::from_str(&self.priority).ok_or_else(|| StoreError::Serialization(format!("bad priority {}", self.priority)))?,
            depends_on,
            status: TaskStatus::from_str(&self.status).ok_or_else(|| StoreError::Serialization(format!("bad task status {}", self.status)))?,
            budget_allocated_usd: parse_usd(&self.budget_allocated_usd)?,
            result: self.result.and_then(|s| serde_json::from_str::<TaskResult>(&s).ok()),
            error: self.error.and_then(|s| serde_json::from_str::<TaskError>(&s).ok()),
            attempts: self.attempts as u32,
            max_attempts: self.max_attempts as u32,
            metadata: serde_json::from_str(&self.metadata).unwrap_or_default(),
            created_at: parse_datetime(&self.created_at)?,
            started_at: parse_optional_datetime(self.started_at)?,
            finished_at: parse_optional_datetime(self.finished_at)?,
            deadline: parse_optional_datetime(self.deadline)?,
            version: self.version as u64,
        })
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn create_goal(&self, goal: &Goal) -> StoreResult<()> {
        sqlx::query(&format!(
            "INSERT INTO goals ({GOAL_COLUMNS}) VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?)"
        ))
        .bind(goal.id.to_string())
        .bind(goal.kind.as_str())
        .bind(&goal.description)
        .bind(&goal.rationale)
        .bind(goal.estimated_budget_usd.as_micros().to_string())
        .bind(goal.estimated_duration_h)
        .bind(goal.status.as_str())
        .bind(goal.impact_score)
        .bind(&goal.source_tag)
        .bind(serde_json::to_string(&goal.metadata).unwrap_or_default())
        .bind(goal.identified_at.to_rfc3339())
        .bind(goal.approved_at.map(|d| d.to_rfc3339()))
        .bind(&goal.approved_by)
        .bind(&goal.approval_notes)
        .bind(goal.effectiveness_score)
        .bind(goal.outcome_measured_at.map(|d| d.to_rfc3339()))
        .bind(i64::from(goal.learn_from))
        .bind(goal.completed_at.map(|d| d.to_rfc3339()))
        .bind(goal.version as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_goal(&self, id: Uuid) -> StoreResult<Option<Goal>> {
        let row: Option<GoalRow> = sqlx::query_as(&format!("SELECT {GOAL_COLUMNS} FROM goals WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(Goal::try_from).transpose()
    }

    async fn update_goal(&self, goal: &Goal) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE goals SET kind=?, description=?, rationale=?, estimated_budget_usd=?, estimated_duration_h=?, \
             status=?, impact_score=?, source_tag=?, metadata=?, approved_at=?, approved_by=?, approval_notes=?, \
             effectiveness_score=?, outcome_measured_at=?, learn_from=?, completed_at=?, version=? WHERE id = ?",
        )
        .bind(goal.kind.as_str())
        .bind(&goal.description)
        .bind(&goal.rationale)
        .bind(goal.estimated_budget_usd.as_micros().to_string())
        .bind(goal.estimated_duration_h)
        .bind(goal.status.as_str())
        .bind(goal.impact_score)
        .bind(&goal.source_tag)
        .bind(serde_json::to_string(&goal.metadata).unwrap_or_default())
        .bind(goal.approved_at.map(|d| d.to_rfc3339()))
        .bind(&goal.approved_by)
        .bind(&goal.approval_notes)
        .bind(goal.effectiveness_score)
        .bind(goal.outcome_measured_at.map(|d| d.to_rfc3339()))
        .bind(i64::from(goal.learn_from))
        .bind(goal.completed_at.map(|d| d.to_rfc3339()))
        .bind(goal.version as i64)
        .bind(goal.id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound { entity: "goal", id: goal.id });
        }
        Ok(())
    }

    async fn list_goals(&self, filter: GoalFilter, limit: i64) -> StoreResult<Vec<Goal>> {
        let mut query = format!("SELECT {GOAL_COLUMNS} FROM goals WHERE 1=1");
        let mut bindings = Vec::new();
        if let Some(status) = filter.status {
            query.push_str(" AND status = ?");
            bindings.push(status.as_str().to_string());
        }
        if let Some(kind) = filter.kind {
            query.push_str(" AND kind = ?");
            bindings.push(kind.as_str().to_string());
        }
        query.push_str(" ORDER BY impact_score DESC, identified_at ASC, id ASC LIMIT ?");

        let mut q = sqlx::query_as::<_, GoalRow>(&query);
        for b in &bindings {
            q = q.bind(b);
        }
        q = q.bind(limit);

        let rows = q.fetch_all(&self.pool).await?;
        rows.into_iter().map(Goal::try_from).collect()
    }

    async fn list_non_terminal_goals_by_source_tag(&self, source_tag: &str) -> StoreResult<Vec<Goal>> {
        let rows: Vec<GoalRow> = sqlx::query_as(&format!(
            "SELECT {GOAL_COLUMNS} FROM goals WHERE source_tag = ? AND status IN ('identified', 'approved')"
        ))
        .bind(source_tag)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Goal::try_from).collect()
    }

    async fn goals_due_for_measurement(&self, now: DateTime<Utc>, window_days: i64) -> StoreResult<Vec<Goal>> {
        let rows: Vec<GoalRow> =
            sqlx::query_as(&format!("SELECT {GOAL_COLUMNS} FROM goals WHERE status = 'completed' AND completed_at IS NOT NULL"))
                .fetch_all(&self.pool)
                .await?;
        let goals: Vec<Goal> = rows.into_iter().map(Goal::try_from).collect::<StoreResult<_>>()?;
        Ok(goals.into_iter().filter(|g| g.eligible_for_measurement(now, window_days)).collect())
    }

    async fn find_approved_goals_without_project(&self) -> StoreResult<Vec<Goal>> {
        let rows: Vec<GoalRow> = sqlx::query_as(&format!(
            "SELECT {GOAL_COLUMNS} FROM goals g WHERE g.status = 'approved' \
             AND NOT EXISTS (SELECT 1 FROM projects p WHERE p.goal_id = g.id)"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Goal::try_from).collect()
    }

    async fn create_project_with_tasks(&self, project: &Project, tasks: &[Task]) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!("INSERT INTO projects ({PROJECT_COLUMNS}) VALUES (?,?,?,?,?,?,?,?,?,?,?)"))
            .bind(project.id.to_string())
            .bind(project.goal_id.to_string())
            .bind(&project.title)
            .bind(&project.description)
            .bind(project.status.as_str())
            .bind(project.budget_allocated_usd.as_micros().to_string())
            .bind(project.budget_spent_usd.as_micros().to_string())
            .bind(project.actual_duration_h)
            .bind(project.created_at.to_rfc3339())
            .bind(project.completed_at.map(|d| d.to_rfc3339()))
            .bind(project.version as i64)
            .execute(&mut *tx)
            .await?;

        for task in tasks {
            sqlx::query(&format!("INSERT INTO tasks ({TASK_COLUMNS}) VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?)"))
                .bind(task.id.to_string())
                .bind(task.project_id.to_string())
                .bind(&task.kind)
                .bind(&task.title)
                .bind(task.priority.as_str())
                .bind(task.status.as_str())
                .bind(task.budget_allocated_usd.as_micros().to_string())
                .bind(task.result.as_ref().and_then(|r| serde_json::to_string(r).ok()))
                .bind(task.error.as_ref().and_then(|e| serde_json::to_string(e).ok()))
                .bind(i64::from(task.attempts))
                .bind(i64::from(task.max_attempts))
                .bind(serde_json::to_string(&task.metadata).unwrap_or_default())
                .bind(task.created_at.to_rfc3339())
                .bind(task.started_at.map(|d| d.to_rfc3339()))
                .bind(task.finished_at.map(|d| d.to_rfc3339()))
                .bind(task.deadline.map(|d| d.to_rfc3339()))
                .bind(task.version as i64)
                .execute(&mut *tx)
                .await?;

            for parent in &task.depends_on {
                sqlx::query("INSERT INTO task_dependencies (task_id, parent_task_id) VALUES (?, ?)")
                    .bind(task.id.to_string())
                    .bind(parent.to_string())
                    .execute(&mut *tx)
                    .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_project(&self, id: Uuid) -> StoreResult<Option<Project>> {
        let row: Option<ProjectRow> = sqlx::query_as(&format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(Project::try_from).transpose()
    }

    async fn get_project_by_goal(&self, goal_id: Uuid) -> StoreResult<Option<Project>> {
        let row: Option<ProjectRow> = sqlx::query_as(&format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE goal_id = ?"))
            .bind(goal_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(Project::try_from).transpose()
    }

    async fn update_project(&self, project: &Project) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE projects SET title=?, description=?, status=?, budget_allocated_usd=?, budget_spent_usd=?, \
             actual_duration_h=?, completed_at=?, version=? WHERE id = ?",
        )
        .bind(&project.title)
        .bind(&project.description)
        .bind(project.status.as_str())
        .bind(project.budget_allocated_usd.as_micros().to_string())
        .bind(project.budget_spent_usd.as_micros().to_string())
        .bind(project.actual_duration_h)
        .bind(project.completed_at.map(|d| d.to_rfc3339()))
        .bind(project.version as i64)
        .bind(project.id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound { entity: "project", id: project.id });
        }
        Ok(())
    }

    async fn claim_ready_tasks(&self, limit: i64, now: DateTime<Utc>) -> StoreResult<Vec<Task>> {
        let mut tx = self.pool.begin().await?;

        let ready_ids: Vec<(String,)> = sqlx::query_as(
            "SELECT t.id FROM tasks t WHERE t.status = 'pending' \
             AND NOT EXISTS ( \
                SELECT 1 FROM task_dependencies td JOIN tasks pt ON pt.id = td.parent_task_id \
                WHERE td.task_id = t.id AND pt.status <> 'completed' \
             ) ORDER BY t.priority = 'high' DESC, t.created_at ASC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;

        let mut claimed = Vec::with_capacity(ready_ids.len());
        for (id_str,) in ready_ids {
            let updated = sqlx::query("UPDATE tasks SET status = 'in_progress', started_at = ?, version = version + 1 WHERE id = ? AND status = 'pending'")
                .bind(now.to_rfc3339())
                .bind(&id_str)
                .execute(&mut *tx)
                .await?;
            if updated.rows_affected() == 1 {
                let row: TaskRow = sqlx::query_as(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?"))
                    .bind(&id_str)
                    .fetch_one(&mut *tx)
                    .await?;
                let parents: Vec<(String,)> = sqlx::query_as("SELECT parent_task_id FROM task_dependencies WHERE task_id = ?")
                    .bind(&id_str)
                    .fetch_all(&mut *tx)
                    .await?;
                let depends_on = parents.into_iter().map(|(s,)| parse_uuid(&s)).collect::<StoreResult<Vec<_>>>()?;
                claimed.push(row.into_task(depends_on)?);
            }
        }

        tx.commit().await?;
        Ok(claimed)
    }

    async fn get_task(&self, id: Uuid) -> StoreResult<Option<Task>> {
        let row: Option<TaskRow> = sqlx::query_as(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let depends_on = self.load_depends_on(id).await?;
                Ok(Some(row.into_task(depends_on)?))
            }
            None => Ok(None),
        }
    }

    async fn update_task(&self, task: &Task) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE tasks SET status=?, result=?, error=?, attempts=?, started_at=?, finished_at=?, version=? WHERE id = ?",
        )
        .bind(task.status.as_str())
        .bind(task.result.as_ref().and_then(|r| serde_json::to_string(r).ok()))
        .bind(task.error.as_ref().and_then(|e| serde_json::to_string(e).ok()))
        .bind(i64::from(task.attempts))
        .bind(task.started_at.map(|d| d.to_rfc3339()))
        .bind(task.finished_at.map(|d| d.to_rfc3339()))
        .bind(task.version as i64)
        .bind(task.id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound { entity: "task", id: task.id });
        }
        self.save_depends_on(task.id, &task.depends_on).await?;
        Ok(())
    }

    async fn list_tasks_for_project(&self, project_id: Uuid) -> StoreResult<Vec<Task>> {
        let rows: Vec<TaskRow> = sqlx::query_as(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE project_id = ? ORDER BY created_at ASC"))
            .bind(project_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        let mut tasks = Vec::with_capacity(rows.len());
        for row in rows {
            let id = parse_uuid(&row.id)?;
            let depends_on = self.load_depends_on(id).await?;
            tasks.push(row.into_task(depends_on)?);
        }
        Ok(tasks)
    }

    async fn list_tasks_by_status_since(&self, status: TaskStatus, since: DateTime<Utc>, limit: i64) -> StoreResult<Vec<Task>> {
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE status = ? AND created_at >= ? ORDER BY created_at DESC LIMIT ?"
        ))
        .bind(status.as_str())
        .bind(since.to_rfc3339())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        let mut tasks = Vec::with_capacity(rows.len());
        for row in rows {
            let id = parse_uuid(&row.id)?;
            let depends_on = self.load_depends_on(id).await?;
            tasks.push(row.into_task(depends_on)?);
        }
        Ok(tasks)
    }

    async fn ledger_append(&self, entry: &LedgerEntry) -> StoreResult<()> {
        sqlx::query("INSERT INTO budget_ledger (id, ts, project_id, task_id, amount_usd, reason) VALUES (?,?,?,?,?,?)")
            .bind(entry.id.to_string())
            .bind(entry.ts.to_rfc3339())
            .bind(entry.project_id.map(|id| id.to_string()))
            .bind(entry.task_id.map(|id| id.to_string()))
            .bind(entry.amount_usd.as_micros().to_string())
            .bind(&entry.reason)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn ledger_sum(&self, range: LedgerRange, filter: LedgerFilter) -> StoreResult<Usd> {
        let mut query = String::from("SELECT amount_usd FROM budget_ledger WHERE ts >= ? AND ts < ?");
        if filter.project_id.is_some() {
            query.push_str(" AND project_id = ?");
        }
        let mut q = sqlx::query_as::<_, (String,)>(&query).bind(range.start.to_rfc3339()).bind(range.end.to_rfc3339());
        if let Some(project_id) = filter.project_id {
            q = q.bind(project_id.to_string());
        }
        let rows = q.fetch_all(&self.pool).await?;
        rows.into_iter().map(|(s,)| parse_usd(&s)).sum()
    }

    async fn record_outcome(&self, outcome: &GoalOutcome) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO goal_outcomes (goal_id, baseline_date, measurement_date, baseline_metrics, outcome_metrics, \
             impact, roi, adoption, quality, effectiveness_score, measurement_method, notes) \
             VALUES (?,?,?,?,?,?,?,?,?,?,?,?) \
             ON CONFLICT(goal_id) DO NOTHING",
        )
        .bind(outcome.goal_id.to_string())
        .bind(outcome.baseline_date.to_rfc3339())
        .bind(outcome.measurement_date.to_rfc3339())
        .bind(serde_json::to_string(&outcome.baseline_metrics).unwrap_or_default())
        .bind(serde_json::to_string(&outcome.outcome_metrics).unwrap_or_default())
        .bind(outcome.impact)
        .bind(outcome.roi)
        .bind(outcome.adoption)
        .bind(outcome.quality)
        .bind(outcome.effectiveness_score)
        .bind(&outcome.measurement_method)
        .bind(&outcome.notes)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_outcome(&self, goal_id: Uuid) -> StoreResult<Option<GoalOutcome>> {
        let row: Option<OutcomeRow> = sqlx::query_as(
            "SELECT goal_id, baseline_date, measurement_date, baseline_metrics, outcome_metrics, impact, roi, \
             adoption, quality, effectiveness_score, measurement_method, notes FROM goal_outcomes WHERE goal_id = ?",
        )
        .bind(goal_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(GoalOutcome::try_from).transpose()
    }

    async fn recent_outcomes_by_kind(&self, kind: GoalKind, limit: i64) -> StoreResult<Vec<GoalOutcome>> {
        let rows: Vec<OutcomeRow> = sqlx::query_as(
            "SELECT o.goal_id, o.baseline_date, o.measurement_date, o.baseline_metrics, o.outcome_metrics, o.impact, \
             o.roi, o.adoption, o.quality, o.effectiveness_score, o.measurement_method, o.notes \
             FROM goal_outcomes o JOIN goals g ON g.id = o.goal_id \
             WHERE g.kind = ? ORDER BY o.measurement_date DESC LIMIT ?",
        )
        .bind(kind.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(GoalOutcome::try_from).collect()
    }

    async fn append_audit_event(&self, event: &AuditEvent) -> StoreResult<()> {
        sqlx::query("INSERT INTO audit_events (id, ts, actor, event_kind, subject_id, payload) VALUES (?,?,?,?,?,?)")
            .bind(event.id.to_string())
            .bind(event.ts.to_rfc3339())
            .bind(event.actor.as_str())
            .bind(&event.event_kind)
            .bind(event.subject_id.map(|id| id.to_string()))
            .bind(serde_json::to_string(&event.payload).unwrap_or_default())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct OutcomeRow {
    goal_id: String,
    baseline_date: String,
    measurement_date: String,
    baseline_metrics: String,
    outcome_metrics: String,
    impact: f64,
    roi: f64,
    adoption: f64,
    quality: f64,
    effectiveness_score: f64,
    measurement_method: String,
    notes: String,
}

impl TryFrom<OutcomeRow> for GoalOutcome {
    type Error = StoreError;

    fn try_from(row: OutcomeRow) -> Result<Self, Self::Error> {
        Ok(GoalOutcome {
            goal_id: parse_uuid(&row.goal_id)?,
            baseline_date: parse_datetime(&row.baseline_date)?,
            measurement_date: parse_datetime(&row.measurement_date)?,
            baseline_metrics: serde_json::from_str(&row.baseline_metrics).unwrap_or_default(),
            outcome_metrics: serde_json::from_str(&row.outcome_metrics).unwrap_or_default(),
            impact: row.impact,
            roi: row.roi,
            adoption: row.adoption,
            quality: row.quality,
            effectiveness_score: row.effectiveness_score,
            measurement_method: row.measurement_method,
            notes: row.notes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use crate::store::sqlite::create_migrated_test_pool;

    async fn store() -> SqliteStore {
        SqliteStore::new(create_migrated_test_pool().await.unwrap())
    }

    #[tokio::test]
    async fn create_and_get_goal_round_trips() {
        let s = store().await;
        let goal = Goal::new(GoalKind::Research, "desc", "tag", 60.0, HashMap::new(), Utc::now());
        s.create_goal(&goal).await.unwrap();
        let fetched = s.get_goal(goal.id).await.unwrap().unwrap();
        assert_eq!(fetched.description, "desc");
        assert_eq!(fetched.status, GoalStatus::Identified);
    }

    #[tokio::test]
    async fn claim_ready_tasks_respects_dependency_order() {
        let s = store().await;
        let goal = Goal::new(GoalKind::Research, "desc", "tag", 60.0, HashMap::new(), Utc::now());
        let mut goal = goal;
        goal.transition_to(GoalStatus::Approved, Utc::now(), Some("a"), None).unwrap();
        s.create_goal(&goal).await.unwrap();

        let project = Project::new(goal.id, "proj", Usd::from_dollars(10.0), Utc::now());
        let t1 = Task::new(project.id, "search", "search", TaskPriority::High, vec![], Usd::from_dollars(4.0), 3, Utc::now());
        let t2 = Task::new(project.id, "synthesize", "synth", TaskPriority::High, vec![t1.id], Usd::from_dollars(2.0), 3, Utc::now());
        s.create_project_with_tasks(&project, &[t1.clone(), t2.clone()]).await.unwrap();

        let claimed = s.claim_ready_tasks(10, Utc::now()).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, t1.id);

        // t2 still not ready since t1 isn't completed yet.
        let claimed_again = s.claim_ready_tasks(10, Utc::now()).await.unwrap();
        assert!(claimed_again.is_empty());
    }

    #[tokio::test]
    async fn ledger_sum_filters_by_range_and_project() {
        let s = store().await;
        let project_id = Uuid::new_v4();
        let entry = LedgerEntry::new(Some(project_id), None, Usd::from_dollars(5.0), "test", Utc::now());
        s.ledger_append(&entry).await.unwrap();

        let sum = s
            .ledger_sum(LedgerRange::day_containing(Utc::now()), LedgerFilter { project_id: Some(project_id) })
            .await
            .unwrap();
        assert_eq!(sum, Usd::from_dollars(5.0));
    }
}
