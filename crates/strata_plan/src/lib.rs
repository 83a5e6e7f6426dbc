//! Plan fragment model shared by coordinators and executing data nodes.
//!
//! Nothing here depends on the coordinator runtime, thread pools or RPC
//! clients; the crate only knows how a distributed plan is identified, placed
//! and encoded on the wire.

pub mod codec;
pub mod fragment;
pub mod ids;
pub mod node;
pub mod region;
pub mod types;

pub use codec::{WireReader, WireWriter};
pub use fragment::PlanFragment;
pub use ids::{DataNodeId, PlanFragmentId, PlanNodeId, QueryId, QueryIdGenerator};
pub use node::{LocationBinding, NodeIndex, PlanNode, PlanNodeBuilder, PlanNodeKind, PlanTree};
pub use region::{
    ConsensusGroupId, ConsensusGroupType, DataNodeLocation, Endpoint, NodeDistribution,
    NodeDistributionType, RegionReplicaSet,
};
pub use types::{DataType, MeasurementSchema, ScanOrder, TemplatedInfo, TypeProvider};
