//! Cluster placement model: endpoints, data node locations and region replica sets.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::codec::{WireReader, WireWriter};
use crate::ids::DataNodeId;

/// Host/port pair of a node service.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    pub ip: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
        }
    }

    pub(crate) fn encode(&self, out: &mut WireWriter) {
        out.put_str(&self.ip);
        out.put_i32(i32::from(self.port));
    }

    pub(crate) fn decode(reader: &mut WireReader<'_>) -> anyhow::Result<Self> {
        let ip = reader.read_string()?;
        let port = reader.read_i32()?;
        let port = u16::try_from(port)
            .map_err(|_| anyhow::anyhow!("endpoint port out of range: {port}"))?;
        Ok(Self { ip, port })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Where a data node can be reached.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataNodeLocation {
    pub data_node_id: DataNodeId,
    /// Internal RPC service endpoint used for fragment dispatch.
    pub internal_endpoint: Endpoint,
    /// Endpoint used by exchange operators to pull result blocks.
    pub data_block_endpoint: Endpoint,
}

impl DataNodeLocation {
    pub fn new(
        data_node_id: DataNodeId,
        internal_endpoint: Endpoint,
        data_block_endpoint: Endpoint,
    ) -> Self {
        Self {
            data_node_id,
            internal_endpoint,
            data_block_endpoint,
        }
    }

    pub(crate) fn encode(&self, out: &mut WireWriter) {
        out.put_i32(self.data_node_id);
        self.internal_endpoint.encode(out);
        self.data_block_endpoint.encode(out);
    }

    pub(crate) fn decode(reader: &mut WireReader<'_>) -> anyhow::Result<Self> {
        Ok(Self {
            data_node_id: reader.read_i32()?,
            internal_endpoint: Endpoint::decode(reader)?,
            data_block_endpoint: Endpoint::decode(reader)?,
        })
    }
}

/// Kind of consensus group a region belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ConsensusGroupType {
    ConfigRegion,
    SchemaRegion,
    DataRegion,
}

impl ConsensusGroupType {
    fn as_i8(self) -> i8 {
        match self {
            Self::ConfigRegion => 0,
            Self::SchemaRegion => 1,
            Self::DataRegion => 2,
        }
    }

    fn from_i8(value: i8) -> anyhow::Result<Self> {
        match value {
            0 => Ok(Self::ConfigRegion),
            1 => Ok(Self::SchemaRegion),
            2 => Ok(Self::DataRegion),
            other => anyhow::bail!("unknown consensus group type {other}"),
        }
    }
}

/// Identifier of a replicated region.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConsensusGroupId {
    pub group_type: ConsensusGroupType,
    pub id: i32,
}

impl ConsensusGroupId {
    pub const fn data_region(id: i32) -> Self {
        Self {
            group_type: ConsensusGroupType::DataRegion,
            id,
        }
    }

    pub const fn schema_region(id: i32) -> Self {
        Self {
            group_type: ConsensusGroupType::SchemaRegion,
            id,
        }
    }
}

/// Id of the "not assigned" sentinel region.
pub const NOT_ASSIGNED_REGION_ID: i32 = -1;

/// A region together with the data nodes hosting its replicas.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegionReplicaSet {
    pub region_id: ConsensusGroupId,
    pub data_node_locations: Vec<DataNodeLocation>,
}

impl RegionReplicaSet {
    /// Sentinel for operators that are not bound to a region yet.
    pub const NOT_ASSIGNED: RegionReplicaSet = RegionReplicaSet {
        region_id: ConsensusGroupId::data_region(NOT_ASSIGNED_REGION_ID),
        data_node_locations: Vec::new(),
    };

    pub fn new(region_id: ConsensusGroupId, data_node_locations: Vec<DataNodeLocation>) -> Self {
        Self {
            region_id,
            data_node_locations,
        }
    }

    pub fn is_not_assigned(&self) -> bool {
        *self == Self::NOT_ASSIGNED
    }

    pub(crate) fn encode(&self, out: &mut WireWriter) {
        out.put_i8(self.region_id.group_type.as_i8());
        out.put_i32(self.region_id.id);
        out.put_i32(self.data_node_locations.len() as i32);
        for location in &self.data_node_locations {
            location.encode(out);
        }
    }

    pub(crate) fn decode(reader: &mut WireReader<'_>) -> anyhow::Result<Self> {
        let group_type = ConsensusGroupType::from_i8(reader.read_i8()?)?;
        let id = reader.read_i32()?;
        let count = reader.read_len()?;
        let mut data_node_locations = Vec::with_capacity(count);
        for _ in 0..count {
            data_node_locations.push(DataNodeLocation::decode(reader)?);
        }
        Ok(Self {
            region_id: ConsensusGroupId { group_type, id },
            data_node_locations,
        })
    }
}

/// How a plan node's output is distributed across regions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeDistributionType {
    SameWithAllChildren,
    SameWithSomeChild,
    DifferentFromAllChildren,
    NoChild,
}

/// Per-node placement decided by the table-model distribution planner.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDistribution {
    pub distribution_type: NodeDistributionType,
    pub region: Option<RegionReplicaSet>,
}

impl NodeDistribution {
    pub fn new(distribution_type: NodeDistributionType, region: Option<RegionReplicaSet>) -> Self {
        Self {
            distribution_type,
            region,
        }
    }
}
