//! Statement routing and distributed execution against fake data nodes.

mod common;

use common::{
    harness, location, region, retryable_write_failure, test_config, wait_until, PlannerScript,
};
use strata_coordinator::{
    CoordinatorConfig, CoordinatorError, ExecutionState, QueryType, SessionInfo, SqlDialect,
    Statement, Status, StatusCode, TableStatementKind, TreeStatementKind,
};

fn session() -> SessionInfo {
    SessionInfo::new(1, "root")
}

#[test]
fn tree_config_statements_run_as_config_tasks() {
    let h = harness(test_config());
    let show = Statement::new(TreeStatementKind::ShowDatabases);
    let result = h
        .coordinator
        .execute_for_tree_model(&show, session(), "show databases", 0, true)
        .expect("execute");
    assert!(result.status.is_success());
    assert_eq!(*h.backend.config_calls.lock(), vec![SqlDialect::Tree]);
    assert!(h.backend.planner_calls.lock().is_empty());
    let execution = h
        .coordinator
        .get_execution(result.query_id)
        .expect("read config statements are queries");
    assert_eq!(execution.context().query_type(), QueryType::Read);
    assert_eq!(execution.state(), ExecutionState::Finished);
    h.coordinator.cleanup_query(result.query_id);
}

#[test]
fn write_typed_config_statement_is_not_registered() {
    let h = harness(test_config());
    let create = Statement::new(TreeStatementKind::CreateDatabase);
    assert_eq!(
        TreeStatementKind::CreateDatabase.config_query_type(),
        Some(QueryType::Write)
    );
    *h.backend.config_status.lock() = Status::error(StatusCode::SystemReadOnly, "read only");
    let result = h
        .coordinator
        .execute_for_tree_model(&create, session(), "create database root.sg", 0, true)
        .expect("execute");
    assert_eq!(result.status.code, StatusCode::SystemReadOnly);
    assert!(result.status.need_retry);
    assert_eq!(h.coordinator.execution_count(), 0);
}

#[test]
fn tree_queries_dispatch_fragments_to_region_hosts() {
    let h = harness(test_config());
    *h.backend.script.lock() = PlannerScript {
        regions: vec![region(1, &[1, 2]), region(2, &[3])],
        ..PlannerScript::default()
    };
    let query = Statement::new(TreeStatementKind::Query);
    let result = h
        .coordinator
        .execute_for_tree_model(&query, session(), "select s1 from root.sg.**", 0, true)
        .expect("execute");
    assert!(result.status.is_success(), "{}", result.status);
    assert_eq!(*h.backend.planner_calls.lock(), vec![SqlDialect::Tree]);

    let mut hosts: Vec<_> = h
        .cluster
        .sent
        .lock()
        .iter()
        .map(|(endpoint, _)| endpoint.clone())
        .collect();
    hosts.sort_by(|a, b| a.ip.cmp(&b.ip));
    assert_eq!(
        hosts,
        vec![location(1).internal_endpoint, location(3).internal_endpoint]
    );
    let execution = h.coordinator.get_execution(result.query_id).expect("registered");
    assert_eq!(execution.state(), ExecutionState::Running);
    h.coordinator.cleanup_query(result.query_id);
    assert_eq!(execution.state(), ExecutionState::Finished);
    assert!(h.cluster.canceled.lock().is_empty());
}

#[test]
fn planning_failure_releases_reserved_memory() {
    let h = harness(test_config());
    *h.backend.script.lock() = PlannerScript {
        fail_analysis: true,
        reserve_bytes: 2_048,
        take_schema_lock: true,
        ..PlannerScript::default()
    };
    let query = Statement::new(TreeStatementKind::Query);
    let result = h
        .coordinator
        .execute_for_tree_model(&query, session(), "select x from root.sg", 0, true)
        .expect("execute");
    assert_eq!(result.status.code, StatusCode::PlanningError);
    assert_eq!(h.coordinator.memory_pool().used(), 0);
    assert_eq!(h.coordinator.schema_locks().reader_count(), 0);
    assert!(h.cluster.sent.lock().is_empty());
    h.coordinator.cleanup_query(result.query_id);
}

#[test]
fn distributed_write_failures_are_merged_and_flagged() {
    let h = harness(test_config());
    *h.backend.script.lock() = PlannerScript {
        is_query: false,
        regions: vec![region(1, &[1]), region(2, &[2]), region(3, &[3])],
        ..PlannerScript::default()
    };
    {
        let mut answers = h.cluster.answers.lock();
        answers.insert(location(1).internal_endpoint, retryable_write_failure());
        answers.insert(
            location(2).internal_endpoint,
            Status::error(StatusCode::WriteProcessError, "flush in progress"),
        );
    }
    let insert = Statement::new(TreeStatementKind::InsertTablet);
    let result = h
        .coordinator
        .execute_write_for_tree_model(&insert, session(), "")
        .expect("execute");
    assert_eq!(result.status.code, StatusCode::MultipleError);
    assert_eq!(result.status.sub_status.len(), 2);
    assert!(result.status.need_retry);
    assert_eq!(h.cluster.sent.lock().len(), 3);
    assert_eq!(h.coordinator.execution_count(), 0);
}

#[test]
fn table_config_kinds_route_to_config_tasks() {
    let h = harness(test_config());
    for kind in [TableStatementKind::CreateDatabase, TableStatementKind::ShowDatabases] {
        let statement = Statement::new(kind);
        let result = h
            .coordinator
            .execute_for_table_model(&statement, session(), "ddl", 0, true)
            .expect("execute");
        assert!(result.status.is_success());
        h.coordinator.cleanup_query(result.query_id);
    }
    assert_eq!(
        *h.backend.config_calls.lock(),
        vec![SqlDialect::Table, SqlDialect::Table]
    );

    let select = Statement::new(TableStatementKind::Query);
    let result = h
        .coordinator
        .execute_internal_for_table_model(&select, session(), "select * from t", 0)
        .expect("execute");
    assert!(result.status.is_success());
    assert_eq!(*h.backend.planner_calls.lock(), vec![SqlDialect::Table]);
    let execution = h.coordinator.get_execution(result.query_id).expect("registered");
    assert!(!execution.is_user_query());
    h.coordinator.cleanup_query(result.query_id);
}

#[test]
fn tree_statements_in_table_model_are_always_planned() {
    let h = harness(test_config());
    let show = Statement::new(TreeStatementKind::ShowDatabases);
    let result = h
        .coordinator
        .execute_tree_statement_for_table_model(&show, session(), "show databases", 0)
        .expect("execute");
    assert!(result.status.is_success());
    assert!(h.backend.config_calls.lock().is_empty());
    assert_eq!(*h.backend.planner_calls.lock(), vec![SqlDialect::Table]);
    h.coordinator.cleanup_query(result.query_id);
}

#[test]
fn query_past_deadline_fails_and_cancels_instances() {
    let h = harness(CoordinatorConfig {
        query_timeout_threshold_ms: 60_000,
        ..test_config()
    });
    *h.backend.script.lock() = PlannerScript {
        regions: vec![region(1, &[1]), region(2, &[2])],
        ..PlannerScript::default()
    };
    let query = Statement::new(TreeStatementKind::Query);
    let result = h
        .coordinator
        .execute_for_tree_model(&query, session(), "select * from root.**", 300, true)
        .expect("execute");
    assert!(result.status.is_success());
    let execution = h.coordinator.get_execution(result.query_id).expect("registered");
    assert!(wait_until(|| execution.state() == ExecutionState::Failed));
    assert_eq!(h.coordinator.metrics().snapshot().timeouts, 1);

    let failure = CoordinatorError::Timeout(result.query_id);
    h.coordinator.cleanup(result.query_id, None, Some(&failure));
    assert!(wait_until(|| h.cluster.canceled.lock().len() == 2));
}

#[test]
fn canceled_query_is_stopped_on_remote_nodes() {
    let h = harness(test_config());
    let query = Statement::new(TreeStatementKind::Query);
    let result = h
        .coordinator
        .execute_for_tree_model(&query, session(), "select * from root.**", 0, true)
        .expect("execute");
    let failure = CoordinatorError::Canceled(result.query_id);
    h.coordinator.cleanup(result.query_id, None, Some(&failure));
    assert!(wait_until(|| h.cluster.canceled.lock().len() == 1));
}
