//! PostgreSQL queue store.

use async_trait::async_trait;
use buildq_core::{
    AccessLevel, ClaimOutcome, FeatureAccessLevel, GroupId, JobId, PendingBuild, PendingJob,
    Project, ProjectId, QueueStore, Result, Runner, RunnerId, RunnerScope, TagId,
};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::debug;

use crate::{DbError, DbResult};

/// Deepest group nesting followed when walking ancestors.
const MAX_GROUP_DEPTH: i32 = 20;

#[derive(Debug, sqlx::FromRow)]
struct PendingJobRow {
    id: i64,
    project_id: i64,
    protected: bool,
    queued_at: Option<DateTime<Utc>>,
    tag_ids: Vec<i64>,
}

impl From<PendingJobRow> for PendingJob {
    fn from(row: PendingJobRow) -> Self {
        Self {
            id: JobId::new(row.id),
            project_id: ProjectId::new(row.project_id),
            tag_ids: row.tag_ids.into_iter().map(TagId::new).collect(),
            protected: row.protected,
            queued_at: row.queued_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PendingBuildRow {
    build_id: i64,
    project_id: i64,
    protected: bool,
    instance_runners_enabled: bool,
    namespace_traversal_ids: Vec<i64>,
    tag_ids: Vec<i64>,
}

impl From<PendingBuildRow> for PendingBuild {
    fn from(row: PendingBuildRow) -> Self {
        Self {
            build_id: JobId::new(row.build_id),
            project_id: ProjectId::new(row.project_id),
            tag_ids: row.tag_ids.into_iter().map(TagId::new).collect(),
            protected: row.protected,
            instance_runners_enabled: row.instance_runners_enabled,
            namespace_traversal_ids: row
                .namespace_traversal_ids
                .into_iter()
                .map(GroupId::new)
                .collect(),
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ProjectRow {
    id: i64,
    namespace_id: Option<i64>,
    shared_runners_enabled: bool,
    group_runners_enabled: bool,
    pending_delete: bool,
    builds_access_level: Option<i32>,
}

impl From<ProjectRow> for Project {
    fn from(row: ProjectRow) -> Self {
        Self {
            id: ProjectId::new(row.id),
            group_id: row.namespace_id.map(GroupId::new),
            shared_runners_enabled: row.shared_runners_enabled,
            group_runners_enabled: row.group_runners_enabled,
            pending_delete: row.pending_delete,
            // Unknown levels are treated like an unset level.
            builds_access_level: row
                .builds_access_level
                .and_then(FeatureAccessLevel::from_i32),
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct RunnerRow {
    id: i64,
    runner_type: String,
    run_untagged: bool,
    access_level: String,
    namespace_id: Option<i64>,
}

#[derive(Debug, sqlx::FromRow)]
struct QueuedBuildRow {
    id: i64,
    project_id: i64,
    protected: bool,
}

const PROJECT_COLUMNS: &str = r#"
    SELECT p.id, p.namespace_id, p.shared_runners_enabled, p.group_runners_enabled,
           p.pending_delete, f.builds_access_level
    FROM projects p
    LEFT JOIN project_features f ON f.project_id = p.id
"#;

/// PostgreSQL implementation of [`QueueStore`].
pub struct PgQueueStore {
    pool: PgPool,
}

impl PgQueueStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Load a runner descriptor with its tags and project assignments.
    pub async fn runner(&self, id: RunnerId) -> DbResult<Runner> {
        let row = sqlx::query_as::<_, RunnerRow>(
            "SELECT id, runner_type, run_untagged, access_level, namespace_id FROM ci_runners WHERE id = $1",
        )
        .bind(id.get())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("runner {}", id)))?;

        let tag_list = sqlx::query_scalar::<_, String>(
            r#"
            SELECT t.name FROM ci_runner_taggings rt
            JOIN tags t ON t.id = rt.tag_id
            WHERE rt.runner_id = $1
            ORDER BY t.name
            "#,
        )
        .bind(id.get())
        .fetch_all(&self.pool)
        .await?;

        let project_ids = sqlx::query_scalar::<_, i64>(
            "SELECT project_id FROM ci_runner_projects WHERE runner_id = $1 ORDER BY project_id",
        )
        .bind(id.get())
        .fetch_all(&self.pool)
        .await?;

        let scope: RunnerScope = row
            .runner_type
            .parse()
            .map_err(|_| DbError::InvalidData(format!("runner type {}", row.runner_type)))?;
        let access_level = match row.access_level.as_str() {
            "ref_protected" => AccessLevel::RefProtected,
            "not_protected" => AccessLevel::NotProtected,
            other => return Err(DbError::InvalidData(format!("access level {}", other))),
        };

        Ok(Runner {
            id: RunnerId::new(row.id),
            scope,
            tag_list,
            run_untagged: row.run_untagged,
            access_level,
            project_ids: project_ids.into_iter().map(ProjectId::new).collect(),
            group_id: row.namespace_id.map(GroupId::new),
        })
    }

    /// Move a build to pending and write its projection row.
    ///
    /// Eligibility columns are computed here from the project's current
    /// settings, with the same predicates the builds-table queue applies at
    /// query time.
    pub async fn enqueue(&self, build_id: JobId) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;

        let build = sqlx::query_as::<_, QueuedBuildRow>(
            r#"
            UPDATE ci_builds SET status = 'pending', queued_at = NOW()
            WHERE id = $1 AND status IN ('created', 'pending') AND runner_id IS NULL
            RETURNING id, project_id, COALESCE(protected, FALSE) AS protected
            "#,
        )
        .bind(build_id.get())
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("queueable build {}", build_id)))?;

        let project: Project = sqlx::query_as::<_, ProjectRow>(&format!(
            "{} WHERE p.id = $1",
            PROJECT_COLUMNS
        ))
        .bind(build.project_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("project {}", build.project_id)))?
        .into();

        let traversal_ids = match project.group_id {
            Some(group_id) if project.allows_group_runners() => {
                sqlx::query_scalar::<_, i64>(
                    r#"
                    WITH RECURSIVE ancestors AS (
                        SELECT id, parent_id, 0 AS depth FROM namespaces WHERE id = $1
                        UNION ALL
                        SELECT n.id, n.parent_id, a.depth + 1
                        FROM namespaces n
                        JOIN ancestors a ON n.id = a.parent_id
                        WHERE a.depth < $2
                    )
                    SELECT id FROM ancestors ORDER BY depth DESC
                    "#,
                )
                .bind(group_id.get())
                .bind(MAX_GROUP_DEPTH)
                .fetch_all(&mut *tx)
                .await?
            }
            _ => Vec::new(),
        };

        let tag_ids = sqlx::query_scalar::<_, i64>(
            "SELECT tag_id FROM ci_build_taggings WHERE build_id = $1 ORDER BY tag_id",
        )
        .bind(build.id)
        .fetch_all(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO ci_pending_builds
                (build_id, project_id, protected, instance_runners_enabled, namespace_traversal_ids, tag_ids)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (build_id) DO UPDATE SET
                protected = EXCLUDED.protected,
                instance_runners_enabled = EXCLUDED.instance_runners_enabled,
                namespace_traversal_ids = EXCLUDED.namespace_traversal_ids,
                tag_ids = EXCLUDED.tag_ids
            "#,
        )
        .bind(build.id)
        .bind(build.project_id)
        .bind(build.protected)
        .bind(project.allows_shared_runners())
        .bind(&traversal_ids)
        .bind(&tag_ids)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(build_id = %build_id, "Queued build");
        Ok(())
    }

    async fn fetch_pending_jobs(&self) -> DbResult<Vec<PendingJob>> {
        let rows = sqlx::query_as::<_, PendingJobRow>(
            r#"
            SELECT b.id, b.project_id, COALESCE(b.protected, FALSE) AS protected, b.queued_at,
                   COALESCE(array_agg(t.tag_id ORDER BY t.tag_id) FILTER (WHERE t.tag_id IS NOT NULL), '{}') AS tag_ids
            FROM ci_builds b
            LEFT JOIN ci_build_taggings t ON t.build_id = b.id
            WHERE b.status = 'pending' AND b.runner_id IS NULL
            GROUP BY b.id
            ORDER BY b.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn fetch_pending_builds(&self) -> DbResult<Vec<PendingBuild>> {
        let rows = sqlx::query_as::<_, PendingBuildRow>(
            r#"
            SELECT build_id, project_id, protected, instance_runners_enabled,
                   namespace_traversal_ids, tag_ids
            FROM ci_pending_builds
            ORDER BY build_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn fetch_running_counts(&self, scope: RunnerScope) -> DbResult<HashMap<ProjectId, u64>> {
        let rows = sqlx::query_as::<_, (i64, i64)>(
            r#"
            SELECT b.project_id, COUNT(*)
            FROM ci_builds b
            JOIN ci_runners r ON r.id = b.runner_id
            WHERE b.status = 'running' AND r.runner_type = $1
            GROUP BY b.project_id
            "#,
        )
        .bind(scope.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(project_id, count)| (ProjectId::new(project_id), count.max(0) as u64))
            .collect())
    }

    async fn fetch_projects(&self, ids: &[ProjectId]) -> DbResult<Vec<Project>> {
        let ids: Vec<i64> = ids.iter().map(|id| id.get()).collect();
        let rows = sqlx::query_as::<_, ProjectRow>(&format!(
            "{} WHERE p.id = ANY($1)",
            PROJECT_COLUMNS
        ))
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn fetch_hierarchy_projects(&self, group_id: GroupId) -> DbResult<HashSet<ProjectId>> {
        let ids = sqlx::query_scalar::<_, i64>(
            r#"
            WITH RECURSIVE hierarchy AS (
                SELECT id FROM namespaces WHERE id = $1
                UNION
                SELECT n.id FROM namespaces n JOIN hierarchy h ON n.parent_id = h.id
            )
            SELECT p.id FROM projects p JOIN hierarchy h ON p.namespace_id = h.id
            "#,
        )
        .bind(group_id.get())
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().map(ProjectId::new).collect())
    }

    async fn fetch_tag_ids(&self, names: &[String]) -> DbResult<BTreeSet<TagId>> {
        let ids = sqlx::query_scalar::<_, i64>("SELECT id FROM tags WHERE name = ANY($1)")
            .bind(names)
            .fetch_all(&self.pool)
            .await?;
        Ok(ids.into_iter().map(TagId::new).collect())
    }

    async fn claim_build(&self, job_id: JobId, runner_id: RunnerId) -> DbResult<ClaimOutcome> {
        let mut tx = self.pool.begin().await?;

        // Concurrent updaters block on the row lock and re-check the WHERE
        // clause after the winner commits, so at most one sees a row.
        let updated = sqlx::query(
            r#"
            UPDATE ci_builds SET status = 'running', runner_id = $2, started_at = NOW()
            WHERE id = $1 AND status = 'pending' AND runner_id IS NULL
            "#,
        )
        .bind(job_id.get())
        .bind(runner_id.get())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        sqlx::query("DELETE FROM ci_pending_builds WHERE build_id = $1")
            .bind(job_id.get())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(if updated == 1 {
            ClaimOutcome::Claimed
        } else {
            ClaimOutcome::AlreadyClaimed
        })
    }
}

#[async_trait]
impl QueueStore for PgQueueStore {
    async fn pending_jobs(&self) -> Result<Vec<PendingJob>> {
        Ok(self.fetch_pending_jobs().await?)
    }

    async fn pending_builds(&self) -> Result<Vec<PendingBuild>> {
        Ok(self.fetch_pending_builds().await?)
    }

    async fn running_job_count_by_project(
        &self,
        scope: RunnerScope,
    ) -> Result<HashMap<ProjectId, u64>> {
        Ok(self.fetch_running_counts(scope).await?)
    }

    async fn projects(&self, ids: &[ProjectId]) -> Result<Vec<Project>> {
        Ok(self.fetch_projects(ids).await?)
    }

    async fn group_hierarchy_projects(&self, group_id: GroupId) -> Result<HashSet<ProjectId>> {
        Ok(self.fetch_hierarchy_projects(group_id).await?)
    }

    async fn tag_ids(&self, names: &[String]) -> Result<BTreeSet<TagId>> {
        Ok(self.fetch_tag_ids(names).await?)
    }

    async fn claim(&self, job_id: JobId, runner: &Runner) -> Result<ClaimOutcome> {
        Ok(self.claim_build(job_id, runner.id).await?)
    }
}
