//! Queue snapshot parsing.
//!
//! A snapshot describes groups, projects, runners and jobs so scheduling
//! decisions can be replayed without a database:
//!
//! ```kdl
//! group 1
//! group 2 parent=1
//! project 10 group=2 shared-runners=#true builds="enabled"
//! runner 7 scope="instance" run-untagged=#false {
//!     tags "docker" "linux"
//! }
//! runner 8 scope="project" {
//!     projects 10
//! }
//! job 100 project=10 protected=#true {
//!     tags "docker"
//! }
//! job 101 project=10 status="running" runner=7
//! ```

use crate::kdl_ext::{
    get_all_int_args, get_all_string_args, get_bool_prop, get_int_prop, get_string_prop,
    require_first_int_arg,
};
use crate::{ConfigError, ConfigResult};
use buildq_core::{
    AccessLevel, FeatureAccessLevel, Group, GroupId, JobId, JobStatus, Project, ProjectId,
    QueueSnapshot, Runner, RunnerId, RunnerScope, SnapshotJob,
};
use kdl::{KdlDocument, KdlNode};
use std::collections::HashSet;
use std::hash::Hash;

/// Parse a queue snapshot from KDL text.
pub fn parse_snapshot(kdl: &str) -> ConfigResult<QueueSnapshot> {
    let doc: KdlDocument = kdl.parse()?;
    let mut snapshot = QueueSnapshot::default();

    for node in doc.nodes() {
        match node.name().value() {
            "group" => snapshot.groups.push(parse_group(node)?),
            "project" => snapshot.projects.push(parse_project(node)?),
            "runner" => snapshot.runners.push(parse_runner(node)?),
            "job" => snapshot.jobs.push(parse_job(node)?),
            _ => {} // Ignore unknown nodes
        }
    }

    validate(&snapshot)?;
    Ok(snapshot)
}

fn parse_group(node: &KdlNode) -> ConfigResult<Group> {
    Ok(Group {
        id: GroupId::new(require_first_int_arg(node, "group id")?),
        parent_id: get_int_prop(node, "parent")?.map(GroupId::new),
    })
}

fn parse_project(node: &KdlNode) -> ConfigResult<Project> {
    let mut project = Project::new(ProjectId::new(require_first_int_arg(node, "project id")?));
    project.group_id = get_int_prop(node, "group")?.map(GroupId::new);
    if let Some(enabled) = get_bool_prop(node, "shared-runners") {
        project.shared_runners_enabled = enabled;
    }
    if let Some(enabled) = get_bool_prop(node, "group-runners") {
        project.group_runners_enabled = enabled;
    }
    if let Some(pending_delete) = get_bool_prop(node, "pending-delete") {
        project.pending_delete = pending_delete;
    }
    if let Some(level) = get_string_prop(node, "builds") {
        project.builds_access_level =
            Some(level.parse::<FeatureAccessLevel>().map_err(|e| {
                ConfigError::InvalidValue {
                    field: format!("project {} builds", project.id),
                    message: e.to_string(),
                }
            })?);
    }
    Ok(project)
}

fn parse_runner(node: &KdlNode) -> ConfigResult<Runner> {
    let id = RunnerId::new(require_first_int_arg(node, "runner id")?);
    let scope: RunnerScope = get_string_prop(node, "scope")
        .ok_or_else(|| ConfigError::MissingField(format!("runner {} scope", id)))?
        .parse()
        .map_err(|e: buildq_core::Error| ConfigError::InvalidValue {
            field: format!("runner {} scope", id),
            message: e.to_string(),
        })?;

    let mut tags = Vec::new();
    let mut project_ids = Vec::new();
    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "tags" => tags.extend(get_all_string_args(child)),
                "projects" => {
                    project_ids.extend(get_all_int_args(child)?.into_iter().map(ProjectId::new))
                }
                _ => {}
            }
        }
    }

    let mut runner = match scope {
        RunnerScope::Instance => Runner::instance(id),
        RunnerScope::Group => {
            let group_id = get_int_prop(node, "group")?
                .ok_or_else(|| ConfigError::MissingField(format!("runner {} group", id)))?;
            Runner::group(id, GroupId::new(group_id))
        }
        RunnerScope::Project => Runner::project(id, project_ids),
    }
    .with_tags(tags);

    if let Some(run_untagged) = get_bool_prop(node, "run-untagged") {
        runner = runner.with_run_untagged(run_untagged);
    }
    if get_bool_prop(node, "protected").unwrap_or(false) {
        runner = runner.with_access_level(AccessLevel::RefProtected);
    }
    Ok(runner)
}

fn parse_job(node: &KdlNode) -> ConfigResult<SnapshotJob> {
    let id = JobId::new(require_first_int_arg(node, "job id")?);
    let project_id = get_int_prop(node, "project")?
        .ok_or_else(|| ConfigError::MissingField(format!("job {} project", id)))?;

    let mut job = SnapshotJob::pending(id, ProjectId::new(project_id));
    job.protected = get_bool_prop(node, "protected").unwrap_or(false);
    job.runner_id = get_int_prop(node, "runner")?.map(RunnerId::new);
    if let Some(status) = get_string_prop(node, "status") {
        job.status = status
            .parse::<JobStatus>()
            .map_err(|e| ConfigError::InvalidValue {
                field: format!("job {} status", id),
                message: e.to_string(),
            })?;
    }
    if let Some(children) = node.children() {
        for child in children.nodes() {
            if child.name().value() == "tags" {
                job.tags.extend(get_all_string_args(child));
            }
        }
    }
    Ok(job)
}

fn validate(snapshot: &QueueSnapshot) -> ConfigResult<()> {
    let groups = unique_ids("group", snapshot.groups.iter().map(|g| g.id))?;
    let projects = unique_ids("project", snapshot.projects.iter().map(|p| p.id))?;
    let runners = unique_ids("runner", snapshot.runners.iter().map(|r| r.id))?;
    unique_ids("job", snapshot.jobs.iter().map(|j| j.id))?;

    for group in &snapshot.groups {
        if let Some(parent) = group.parent_id.filter(|p| !groups.contains(p)) {
            return Err(ConfigError::InvalidReference(format!(
                "group {} has unknown parent {}",
                group.id, parent
            )));
        }
    }

    for project in &snapshot.projects {
        if let Some(group) = project.group_id.filter(|g| !groups.contains(g)) {
            return Err(ConfigError::InvalidReference(format!(
                "project {} belongs to unknown group {}",
                project.id, group
            )));
        }
    }

    for runner in &snapshot.runners {
        if let Some(group) = runner.group_id.filter(|g| !groups.contains(g)) {
            return Err(ConfigError::InvalidReference(format!(
                "runner {} serves unknown group {}",
                runner.id, group
            )));
        }
        if let Some(project) = runner.project_ids.iter().find(|p| !projects.contains(*p)) {
            return Err(ConfigError::InvalidReference(format!(
                "runner {} is assigned to unknown project {}",
                runner.id, project
            )));
        }
    }

    for job in &snapshot.jobs {
        if !projects.contains(&job.project_id) {
            return Err(ConfigError::InvalidReference(format!(
                "job {} belongs to unknown project {}",
                job.id, job.project_id
            )));
        }
        match job.runner_id {
            Some(runner) if !runners.contains(&runner) => {
                return Err(ConfigError::InvalidReference(format!(
                    "job {} runs on unknown runner {}",
                    job.id, runner
                )));
            }
            None if job.status == JobStatus::Running => {
                return Err(ConfigError::MissingField(format!("job {} runner", job.id)));
            }
            _ => {}
        }
    }

    Ok(())
}

fn unique_ids<T>(kind: &str, ids: impl Iterator<Item = T>) -> ConfigResult<HashSet<T>>
where
    T: Eq + Hash + std::fmt::Display,
{
    let mut seen = HashSet::new();
    for id in ids {
        if seen.contains(&id) {
            return Err(ConfigError::Duplicate(format!("{} {}", kind, id)));
        }
        seen.insert(id);
    }
    Ok(seen)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SNAPSHOT: &str = r#"
        group 1
        group 2 parent=1

        project 10 group=2
        project 11 shared-runners=#false builds="private"
        project 12 group=1 pending-delete=#true

        runner 7 scope="instance" run-untagged=#false {
            tags "docker" "linux"
        }
        runner 8 scope="group" group=1 protected=#true
        runner 9 scope="project" {
            projects 10 11
        }

        job 100 project=10 protected=#true {
            tags "docker"
        }
        job 101 project=11
        job 102 project=10 status="running" runner=7
    "#;

    #[test]
    fn test_parse_snapshot() {
        let snapshot = parse_snapshot(SNAPSHOT).unwrap();
        assert_eq!(snapshot.groups.len(), 2);
        assert_eq!(snapshot.groups[1].parent_id, Some(GroupId::new(1)));

        assert_eq!(snapshot.projects.len(), 3);
        let p11 = &snapshot.projects[1];
        assert!(!p11.shared_runners_enabled);
        assert_eq!(p11.builds_access_level, Some(FeatureAccessLevel::Private));
        assert!(snapshot.projects[2].pending_delete);

        let shared = snapshot.runner(RunnerId::new(7)).unwrap();
        assert_eq!(shared.scope, RunnerScope::Instance);
        assert_eq!(shared.tag_list, vec!["docker", "linux"]);
        assert!(!shared.run_untagged);

        let group = snapshot.runner(RunnerId::new(8)).unwrap();
        assert_eq!(group.group_id, Some(GroupId::new(1)));
        assert!(group.is_ref_protected());

        let project = snapshot.runner(RunnerId::new(9)).unwrap();
        assert_eq!(
            project.project_ids,
            vec![ProjectId::new(10), ProjectId::new(11)]
        );

        assert_eq!(snapshot.jobs.len(), 3);
        assert!(snapshot.jobs[0].protected);
        assert_eq!(snapshot.jobs[0].tags, vec!["docker"]);
        assert_eq!(snapshot.jobs[1].status, JobStatus::Pending);
        assert_eq!(snapshot.jobs[2].status, JobStatus::Running);
        assert_eq!(snapshot.jobs[2].runner_id, Some(RunnerId::new(7)));
    }

    #[test]
    fn test_group_runner_requires_group() {
        let result = parse_snapshot(r#"runner 1 scope="group""#);
        assert!(matches!(result, Err(ConfigError::MissingField(_))));
    }

    #[test]
    fn test_unknown_scope_is_rejected() {
        let result = parse_snapshot(r#"runner 1 scope="cluster""#);
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_job_referencing_unknown_project() {
        let result = parse_snapshot("job 1 project=99");
        assert!(matches!(result, Err(ConfigError::InvalidReference(_))));
    }

    #[test]
    fn test_runner_assigned_to_unknown_project() {
        let kdl = r#"
            project 1
            runner 1 scope="project" {
                projects 1 2
            }
        "#;
        assert!(matches!(
            parse_snapshot(kdl),
            Err(ConfigError::InvalidReference(_))
        ));
    }

    #[test]
    fn test_running_job_requires_runner() {
        let kdl = r#"
            project 1
            job 1 project=1 status="running"
        "#;
        assert!(matches!(
            parse_snapshot(kdl),
            Err(ConfigError::MissingField(_))
        ));
    }

    #[test]
    fn test_duplicate_job_is_rejected() {
        let kdl = r#"
            project 1
            job 1 project=1
            job 1 project=1
        "#;
        assert!(matches!(parse_snapshot(kdl), Err(ConfigError::Duplicate(_))));
    }

    #[test]
    fn test_declaration_order_does_not_matter() {
        let kdl = r#"
            job 5 project=3
            project 3 group=4
            group 4
        "#;
        let snapshot = parse_snapshot(kdl).unwrap();
        assert_eq!(snapshot.jobs[0].project_id, ProjectId::new(3));
    }
}
