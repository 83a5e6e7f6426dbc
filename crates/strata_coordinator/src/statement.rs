//! Statement kinds accepted by the coordinator and how each is routed.
//!
//! Routing is declared per variant with exhaustive matches, so a new kind
//! cannot be added without deciding whether it runs as a config task or goes
//! through distributed planning.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Whether an operation reads or mutates state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueryType {
    #[default]
    Read,
    Write,
}

/// Execution path chosen for a statement.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StatementRouting {
    /// Lightweight config task, no distributed plan.
    Config,
    /// Planned and dispatched as plan fragments.
    DataPlane,
}

/// Path-oriented (tree model) statement kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TreeStatementKind {
    Query,
    Explain,
    ExplainAnalyze,
    Insert,
    InsertRows,
    InsertTablet,
    DeleteData,
    LoadTsFile,
    CreateTimeSeries,
    CreateAlignedTimeSeries,
    DeleteTimeSeries,
    ShowTimeSeries,
    ShowDevices,
    CountTimeSeries,
    CountDevices,
    ShowQueries,
    CreateDatabase,
    DeleteDatabase,
    ShowDatabases,
    SetTtl,
    ShowTtl,
    CreateTemplate,
    ShowTemplates,
    Flush,
    ClearCache,
    ShowCluster,
    ShowRegions,
    ShowDataNodes,
    ShowVersion,
    KillQuery,
    CreateFunction,
    DropFunction,
    ShowFunctions,
    CreatePipe,
    ShowPipes,
    Author,
    SetConfiguration,
    MigrateRegion,
}

impl TreeStatementKind {
    /// Query type of config statements; `None` for data-plane statements.
    pub fn config_query_type(self) -> Option<QueryType> {
        use QueryType::{Read, Write};
        match self {
            Self::Query
            | Self::Explain
            | Self::ExplainAnalyze
            | Self::Insert
            | Self::InsertRows
            | Self::InsertTablet
            | Self::DeleteData
            | Self::LoadTsFile
            | Self::CreateTimeSeries
            | Self::CreateAlignedTimeSeries
            | Self::DeleteTimeSeries
            | Self::ShowTimeSeries
            | Self::ShowDevices
            | Self::CountTimeSeries
            | Self::CountDevices
            | Self::ShowQueries => None,
            Self::ShowDatabases
            | Self::ShowTtl
            | Self::ShowTemplates
            | Self::ShowCluster
            | Self::ShowRegions
            | Self::ShowDataNodes
            | Self::ShowVersion
            | Self::ShowFunctions
            | Self::ShowPipes => Some(Read),
            Self::CreateDatabase
            | Self::DeleteDatabase
            | Self::SetTtl
            | Self::CreateTemplate
            | Self::Flush
            | Self::ClearCache
            | Self::KillQuery
            | Self::CreateFunction
            | Self::DropFunction
            | Self::CreatePipe
            | Self::Author
            | Self::SetConfiguration
            | Self::MigrateRegion => Some(Write),
        }
    }

    pub fn routing(self) -> StatementRouting {
        match self.config_query_type() {
            Some(_) => StatementRouting::Config,
            None => StatementRouting::DataPlane,
        }
    }
}

/// Relational (table model) statement kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TableStatementKind {
    Query,
    Explain,
    ExplainAnalyze,
    Insert,
    Delete,
    Update,
    LoadTsFile,
    DropDatabase,
    ShowDatabases,
    CreateDatabase,
    AlterDatabase,
    Use,
    CreateTable,
    DescribeTable,
    ShowTables,
    AddColumn,
    SetProperties,
    DropColumn,
    DropTable,
    SetTableComment,
    SetColumnComment,
    DeleteDevice,
    RenameColumn,
    RenameTable,
    ShowCluster,
    ShowRegions,
    ShowDataNodes,
    ShowConfigNodes,
    ShowAiNodes,
    Flush,
    ClearCache,
    SetConfiguration,
    LoadConfiguration,
    SetSystemStatus,
    StartRepairData,
    StopRepairData,
    Pipe,
    RemoveDataNode,
    RemoveConfigNode,
    RemoveAiNode,
    Subscription,
    ShowCurrentSqlDialect,
    SetSqlDialect,
    ShowCurrentUser,
    ShowCurrentDatabase,
    ShowVersion,
    ShowVariables,
    ShowClusterId,
    ShowCurrentTimestamp,
    KillQuery,
    CreateFunction,
    DropFunction,
    ShowFunctions,
    Author,
    MigrateRegion,
    ReconstructRegion,
    ExtendRegion,
    CreateModel,
    CreateTraining,
    ShowModels,
    DropModel,
    RemoveRegion,
}

impl TableStatementKind {
    /// Every table statement kind.
    pub const ALL: [TableStatementKind; 62] = [
        Self::Query,
        Self::Explain,
        Self::ExplainAnalyze,
        Self::Insert,
        Self::Delete,
        Self::Update,
        Self::LoadTsFile,
        Self::DropDatabase,
        Self::ShowDatabases,
        Self::CreateDatabase,
        Self::AlterDatabase,
        Self::Use,
        Self::CreateTable,
        Self::DescribeTable,
        Self::ShowTables,
        Self::AddColumn,
        Self::SetProperties,
        Self::DropColumn,
        Self::DropTable,
        Self::SetTableComment,
        Self::SetColumnComment,
        Self::DeleteDevice,
        Self::RenameColumn,
        Self::RenameTable,
        Self::ShowCluster,
        Self::ShowRegions,
        Self::ShowDataNodes,
        Self::ShowConfigNodes,
        Self::ShowAiNodes,
        Self::Flush,
        Self::ClearCache,
        Self::SetConfiguration,
        Self::LoadConfiguration,
        Self::SetSystemStatus,
        Self::StartRepairData,
        Self::StopRepairData,
        Self::Pipe,
        Self::RemoveDataNode,
        Self::RemoveConfigNode,
        Self::RemoveAiNode,
        Self::Subscription,
        Self::ShowCurrentSqlDialect,
        Self::SetSqlDialect,
        Self::ShowCurrentUser,
        Self::ShowCurrentDatabase,
        Self::ShowVersion,
        Self::ShowVariables,
        Self::ShowClusterId,
        Self::ShowCurrentTimestamp,
        Self::KillQuery,
        Self::CreateFunction,
        Self::DropFunction,
        Self::ShowFunctions,
        Self::Author,
        Self::MigrateRegion,
        Self::ReconstructRegion,
        Self::ExtendRegion,
        Self::CreateModel,
        Self::CreateTraining,
        Self::ShowModels,
        Self::DropModel,
        Self::RemoveRegion,
    ];

    /// Kinds the table config visitor can execute.
    pub const CONFIG_ROUTED: [TableStatementKind; 55] = [
        Self::DropDatabase,
        Self::ShowDatabases,
        Self::CreateDatabase,
        Self::AlterDatabase,
        Self::Use,
        Self::CreateTable,
        Self::DescribeTable,
        Self::ShowTables,
        Self::AddColumn,
        Self::SetProperties,
        Self::DropColumn,
        Self::DropTable,
        Self::SetTableComment,
        Self::SetColumnComment,
        Self::DeleteDevice,
        Self::RenameColumn,
        Self::RenameTable,
        Self::ShowCluster,
        Self::ShowRegions,
        Self::ShowDataNodes,
        Self::ShowConfigNodes,
        Self::ShowAiNodes,
        Self::Flush,
        Self::ClearCache,
        Self::SetConfiguration,
        Self::LoadConfiguration,
        Self::SetSystemStatus,
        Self::StartRepairData,
        Self::StopRepairData,
        Self::Pipe,
        Self::RemoveDataNode,
        Self::RemoveConfigNode,
        Self::RemoveAiNode,
        Self::Subscription,
        Self::ShowCurrentSqlDialect,
        Self::SetSqlDialect,
        Self::ShowCurrentUser,
        Self::ShowCurrentDatabase,
        Self::ShowVersion,
        Self::ShowVariables,
        Self::ShowClusterId,
        Self::ShowCurrentTimestamp,
        Self::KillQuery,
        Self::CreateFunction,
        Self::DropFunction,
        Self::ShowFunctions,
        Self::Author,
        Self::MigrateRegion,
        Self::ReconstructRegion,
        Self::ExtendRegion,
        Self::CreateModel,
        Self::CreateTraining,
        Self::ShowModels,
        Self::DropModel,
        Self::RemoveRegion,
    ];

    pub fn routing(self) -> StatementRouting {
        match self {
            Self::Query
            | Self::Explain
            | Self::ExplainAnalyze
            | Self::Insert
            | Self::Delete
            | Self::Update
            | Self::LoadTsFile => StatementRouting::DataPlane,
            Self::DropDatabase
            | Self::ShowDatabases
            | Self::CreateDatabase
            | Self::AlterDatabase
            | Self::Use
            | Self::CreateTable
            | Self::DescribeTable
            | Self::ShowTables
            | Self::AddColumn
            | Self::SetProperties
            | Self::DropColumn
            | Self::DropTable
            | Self::SetTableComment
            | Self::SetColumnComment
            | Self::DeleteDevice
            | Self::RenameColumn
            | Self::RenameTable
            | Self::ShowCluster
            | Self::ShowRegions
            | Self::ShowDataNodes
            | Self::ShowConfigNodes
            | Self::ShowAiNodes
            | Self::Flush
            | Self::ClearCache
            | Self::SetConfiguration
            | Self::LoadConfiguration
            | Self::SetSystemStatus
            | Self::StartRepairData
            | Self::StopRepairData
            | Self::Pipe
            | Self::RemoveDataNode
            | Self::RemoveConfigNode
            | Self::RemoveAiNode
            | Self::Subscription
            | Self::ShowCurrentSqlDialect
            | Self::SetSqlDialect
            | Self::ShowCurrentUser
            | Self::ShowCurrentDatabase
            | Self::ShowVersion
            | Self::ShowVariables
            | Self::ShowClusterId
            | Self::ShowCurrentTimestamp
            | Self::KillQuery
            | Self::CreateFunction
            | Self::DropFunction
            | Self::ShowFunctions
            | Self::Author
            | Self::MigrateRegion
            | Self::ReconstructRegion
            | Self::ExtendRegion
            | Self::CreateModel
            | Self::CreateTraining
            | Self::ShowModels
            | Self::DropModel
            | Self::RemoveRegion => StatementRouting::Config,
        }
    }
}

/// Parsed statement handed to the coordinator.
///
/// The AST itself is opaque here; planners downcast the payload.
#[derive(Clone)]
pub struct Statement<K> {
    kind: K,
    payload: Arc<dyn Any + Send + Sync>,
}

/// Tree-model statement.
pub type TreeStatement = Statement<TreeStatementKind>;
/// Table-model statement.
pub type TableStatement = Statement<TableStatementKind>;

impl<K: Copy> Statement<K> {
    pub fn new(kind: K) -> Self {
        Self {
            kind,
            payload: Arc::new(()),
        }
    }

    pub fn with_payload<T: Any + Send + Sync>(kind: K, payload: T) -> Self {
        Self {
            kind,
            payload: Arc::new(payload),
        }
    }

    pub fn kind(&self) -> K {
        self.kind
    }

    pub fn payload<T: Any>(&self) -> Option<&T> {
        self.payload.downcast_ref::<T>()
    }
}

impl<K: fmt::Debug> fmt::Debug for Statement<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Statement").field("kind", &self.kind).finish()
    }
}

/// Borrowed statement of either model.
#[derive(Clone, Copy, Debug)]
pub enum StatementRef<'a> {
    Tree(&'a TreeStatement),
    Table(&'a TableStatement),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn table_config_list_matches_routing() {
        let listed: HashSet<_> = TableStatementKind::CONFIG_ROUTED.iter().copied().collect();
        assert_eq!(listed.len(), TableStatementKind::CONFIG_ROUTED.len());
        for kind in TableStatementKind::ALL {
            let routed_to_config = kind.routing() == StatementRouting::Config;
            assert_eq!(
                routed_to_config,
                listed.contains(&kind),
                "{kind:?} routing disagrees with the config list"
            );
        }
    }

    #[test]
    fn all_kinds_are_distinct() {
        let all: HashSet<_> = TableStatementKind::ALL.iter().copied().collect();
        assert_eq!(all.len(), TableStatementKind::ALL.len());
    }

    #[test]
    fn tree_config_statements_carry_query_type() {
        assert_eq!(
            TreeStatementKind::ShowDatabases.config_query_type(),
            Some(QueryType::Read)
        );
        assert_eq!(
            TreeStatementKind::CreateDatabase.config_query_type(),
            Some(QueryType::Write)
        );
        assert_eq!(TreeStatementKind::Insert.routing(), StatementRouting::DataPlane);
        assert_eq!(TreeStatementKind::Flush.routing(), StatementRouting::Config);
    }

    #[test]
    fn payload_downcasts_to_its_type() {
        let statement = TableStatement::with_payload(TableStatementKind::Query, "select 1".to_string());
        assert_eq!(statement.payload::<String>().map(String::as_str), Some("select 1"));
        assert!(statement.payload::<u32>().is_none());
        assert_eq!(statement.kind(), TableStatementKind::Query);
    }
}
