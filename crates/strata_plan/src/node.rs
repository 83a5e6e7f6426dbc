//! Arena-backed plan node tree.
//!
//! A [`PlanTree`] owns its nodes in a flat vector; children are referenced by
//! [`NodeIndex`] in their stored order, so the tree has no shared ownership and
//! no parent pointers. Placement code never inspects concrete node types: it
//! asks a node for its intrinsic region or location through
//! [`PlanNodeKind::intrinsic_region`] and [`PlanNodeKind::intrinsic_location`].

use std::collections::BTreeSet;

use crate::codec::{WireReader, WireWriter};
use crate::ids::PlanNodeId;
use crate::region::{DataNodeLocation, Endpoint, RegionReplicaSet};
use crate::types::{ScanOrder, TemplatedInfo};

/// Position of a node inside its [`PlanTree`] arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeIndex(usize);

impl NodeIndex {
    pub fn get(self) -> usize {
        self.0
    }
}

/// How a node is bound to a concrete data node, if at all.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LocationBinding<'a> {
    /// The node names the data node that must run it.
    Direct(&'a DataNodeLocation),
    /// System-table scan; its region must list exactly one data node.
    SingleReplica(Option<&'a RegionReplicaSet>),
}

/// Variant-specific payload of a plan node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PlanNodeKind {
    /// Fragment root that forwards its child's output to downstream exchanges.
    IdentitySink { downstream_endpoints: Vec<Endpoint> },
    /// Receives the output of a fragment running elsewhere.
    Exchange {
        upstream_endpoint: Option<Endpoint>,
        upstream_plan_node_id: Option<PlanNodeId>,
        output_columns: Vec<String>,
    },
    DeviceView {
        devices: Vec<String>,
        output_columns: Vec<String>,
    },
    FullOuterTimeJoin { scan_order: ScanOrder },
    Limit { count: i64 },
    Offset { count: i64 },
    Filter { predicate: String },
    Project { output_columns: Vec<String> },
    Aggregation {
        aggregations: Vec<String>,
        group_by: Vec<String>,
    },
    SeriesScan {
        series_path: String,
        scan_order: ScanOrder,
        region: Option<RegionReplicaSet>,
    },
    AlignedSeriesScan {
        device: String,
        measurements: Vec<String>,
        scan_order: ScanOrder,
        limit: i64,
        offset: i64,
        region: Option<RegionReplicaSet>,
    },
    AlignedSeriesAggregationScan {
        device: String,
        measurements: Vec<String>,
        aggregations: Vec<String>,
        scan_order: ScanOrder,
        region: Option<RegionReplicaSet>,
    },
    DeviceTableScan {
        table: String,
        devices: Vec<String>,
        output_columns: Vec<String>,
        region: Option<RegionReplicaSet>,
    },
    InformationSchemaTableScan {
        table: String,
        output_columns: Vec<String>,
        region: Option<RegionReplicaSet>,
    },
    /// Source whose rows are produced by one specific data node.
    VirtualSource {
        location: DataNodeLocation,
        output_columns: Vec<String>,
    },
}

/// Deepest plan tree accepted from the wire.
pub const MAX_PLAN_DEPTH: usize = 1_024;

const TAG_IDENTITY_SINK: i16 = 0;
const TAG_EXCHANGE: i16 = 1;
const TAG_DEVICE_VIEW: i16 = 2;
const TAG_FULL_OUTER_TIME_JOIN: i16 = 3;
const TAG_LIMIT: i16 = 4;
const TAG_OFFSET: i16 = 5;
const TAG_FILTER: i16 = 6;
const TAG_PROJECT: i16 = 7;
const TAG_AGGREGATION: i16 = 8;
const TAG_SERIES_SCAN: i16 = 20;
const TAG_ALIGNED_SERIES_SCAN: i16 = 21;
const TAG_ALIGNED_SERIES_AGGREGATION_SCAN: i16 = 22;
const TAG_DEVICE_TABLE_SCAN: i16 = 40;
const TAG_INFORMATION_SCHEMA_TABLE_SCAN: i16 = 41;
const TAG_VIRTUAL_SOURCE: i16 = 60;

impl PlanNodeKind {
    pub fn tag(&self) -> i16 {
        match self {
            Self::IdentitySink { .. } => TAG_IDENTITY_SINK,
            Self::Exchange { .. } => TAG_EXCHANGE,
            Self::DeviceView { .. } => TAG_DEVICE_VIEW,
            Self::FullOuterTimeJoin { .. } => TAG_FULL_OUTER_TIME_JOIN,
            Self::Limit { .. } => TAG_LIMIT,
            Self::Offset { .. } => TAG_OFFSET,
            Self::Filter { .. } => TAG_FILTER,
            Self::Project { .. } => TAG_PROJECT,
            Self::Aggregation { .. } => TAG_AGGREGATION,
            Self::SeriesScan { .. } => TAG_SERIES_SCAN,
            Self::AlignedSeriesScan { .. } => TAG_ALIGNED_SERIES_SCAN,
            Self::AlignedSeriesAggregationScan { .. } => TAG_ALIGNED_SERIES_AGGREGATION_SCAN,
            Self::DeviceTableScan { .. } => TAG_DEVICE_TABLE_SCAN,
            Self::InformationSchemaTableScan { .. } => TAG_INFORMATION_SCHEMA_TABLE_SCAN,
            Self::VirtualSource { .. } => TAG_VIRTUAL_SOURCE,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::IdentitySink { .. } => "IdentitySink",
            Self::Exchange { .. } => "Exchange",
            Self::DeviceView { .. } => "DeviceView",
            Self::FullOuterTimeJoin { .. } => "FullOuterTimeJoin",
            Self::Limit { .. } => "Limit",
            Self::Offset { .. } => "Offset",
            Self::Filter { .. } => "Filter",
            Self::Project { .. } => "Project",
            Self::Aggregation { .. } => "Aggregation",
            Self::SeriesScan { .. } => "SeriesScan",
            Self::AlignedSeriesScan { .. } => "AlignedSeriesScan",
            Self::AlignedSeriesAggregationScan { .. } => "AlignedSeriesAggregationScan",
            Self::DeviceTableScan { .. } => "DeviceTableScan",
            Self::InformationSchemaTableScan { .. } => "InformationSchemaTableScan",
            Self::VirtualSource { .. } => "VirtualSource",
        }
    }

    /// Region association of partition-related nodes.
    ///
    /// The outer `Option` says whether the node is partition-related at all;
    /// the inner one is the region it currently carries, which may be absent
    /// or the not-assigned sentinel.
    pub fn intrinsic_region(&self) -> Option<Option<&RegionReplicaSet>> {
        match self {
            Self::SeriesScan { region, .. }
            | Self::AlignedSeriesScan { region, .. }
            | Self::AlignedSeriesAggregationScan { region, .. }
            | Self::DeviceTableScan { region, .. }
            | Self::InformationSchemaTableScan { region, .. } => Some(region.as_ref()),
            Self::VirtualSource { .. } => Some(None),
            _ => None,
        }
    }

    pub fn intrinsic_location(&self) -> Option<LocationBinding<'_>> {
        match self {
            Self::VirtualSource { location, .. } => Some(LocationBinding::Direct(location)),
            Self::InformationSchemaTableScan { region, .. } => {
                Some(LocationBinding::SingleReplica(region.as_ref()))
            }
            _ => None,
        }
    }

    /// Whether the node has a reduced encoding under templated info.
    pub fn is_templated_scan(&self) -> bool {
        matches!(
            self,
            Self::AlignedSeriesScan { .. } | Self::AlignedSeriesAggregationScan { .. }
        )
    }

    /// Column names this node introduces into the plan output.
    pub fn declared_columns(&self) -> Vec<String> {
        match self {
            Self::SeriesScan { series_path, .. } => vec![series_path.clone()],
            Self::AlignedSeriesScan {
                device,
                measurements,
                ..
            } => measurements
                .iter()
                .map(|m| format!("{device}.{m}"))
                .collect(),
            Self::AlignedSeriesAggregationScan {
                device,
                measurements,
                aggregations,
                ..
            } => aggregations
                .iter()
                .flat_map(|agg| {
                    measurements
                        .iter()
                        .map(move |m| format!("{agg}({device}.{m})"))
                })
                .collect(),
            Self::Aggregation {
                aggregations,
                group_by,
            } => group_by.iter().chain(aggregations).cloned().collect(),
            Self::Exchange { output_columns, .. }
            | Self::DeviceView { output_columns, .. }
            | Self::Project { output_columns }
            | Self::DeviceTableScan { output_columns, .. }
            | Self::InformationSchemaTableScan { output_columns, .. }
            | Self::VirtualSource { output_columns, .. } => output_columns.clone(),
            Self::IdentitySink { .. }
            | Self::FullOuterTimeJoin { .. }
            | Self::Limit { .. }
            | Self::Offset { .. }
            | Self::Filter { .. } => Vec::new(),
        }
    }

    /// Write tag, attributes and node id.
    fn encode_head(&self, id: &PlanNodeId, out: &mut WireWriter, template: Option<&TemplatedInfo>) {
        out.put_i16(self.tag());
        match self {
            Self::AlignedSeriesScan { device, region, .. }
            | Self::AlignedSeriesAggregationScan { device, region, .. }
                if template.is_some() =>
            {
                out.put_str(device);
                put_opt_region(out, region.as_ref());
            }
            Self::IdentitySink {
                downstream_endpoints,
            } => {
                out.put_i32(downstream_endpoints.len() as i32);
                for endpoint in downstream_endpoints {
                    endpoint.encode(out);
                }
            }
            Self::Exchange {
                upstream_endpoint,
                upstream_plan_node_id,
                output_columns,
            } => {
                match upstream_endpoint {
                    Some(endpoint) => {
                        out.put_bool(true);
                        endpoint.encode(out);
                    }
                    None => out.put_bool(false),
                }
                out.put_opt_str(upstream_plan_node_id.as_ref().map(PlanNodeId::as_str));
                put_strings(out, output_columns);
            }
            Self::DeviceView {
                devices,
                output_columns,
            } => {
                put_strings(out, devices);
                put_strings(out, output_columns);
            }
            Self::FullOuterTimeJoin { scan_order } => scan_order.encode(out),
            Self::Limit { count } | Self::Offset { count } => out.put_i64(*count),
            Self::Filter { predicate } => out.put_str(predicate),
            Self::Project { output_columns } => put_strings(out, output_columns),
            Self::Aggregation {
                aggregations,
                group_by,
            } => {
                put_strings(out, aggregations);
                put_strings(out, group_by);
            }
            Self::SeriesScan {
                series_path,
                scan_order,
                region,
            } => {
                out.put_str(series_path);
                scan_order.encode(out);
                put_opt_region(out, region.as_ref());
            }
            Self::AlignedSeriesScan {
                device,
                measurements,
                scan_order,
                limit,
                offset,
                region,
            } => {
                out.put_str(device);
                put_strings(out, measurements);
                scan_order.encode(out);
                out.put_i64(*limit);
                out.put_i64(*offset);
                put_opt_region(out, region.as_ref());
            }
            Self::AlignedSeriesAggregationScan {
                device,
                measurements,
                aggregations,
                scan_order,
                region,
            } => {
                out.put_str(device);
                put_strings(out, measurements);
                put_strings(out, aggregations);
                scan_order.encode(out);
                put_opt_region(out, region.as_ref());
            }
            Self::DeviceTableScan {
                table,
                devices,
                output_columns,
                region,
            } => {
                out.put_str(table);
                put_strings(out, devices);
                put_strings(out, output_columns);
                put_opt_region(out, region.as_ref());
            }
            Self::InformationSchemaTableScan {
                table,
                output_columns,
                region,
            } => {
                out.put_str(table);
                put_strings(out, output_columns);
                put_opt_region(out, region.as_ref());
            }
            Self::VirtualSource {
                location,
                output_columns,
            } => {
                location.encode(out);
                put_strings(out, output_columns);
            }
        }
        out.put_str(id.as_str());
    }

    /// Inverse of [`Self::encode_head`].
    fn decode_head(
        reader: &mut WireReader<'_>,
        template: Option<&TemplatedInfo>,
    ) -> anyhow::Result<(PlanNodeId, PlanNodeKind)> {
        let tag = reader.read_i16()?;
        let kind = match (tag, template) {
            (TAG_ALIGNED_SERIES_SCAN, Some(info)) => Self::AlignedSeriesScan {
                device: reader.read_string()?,
                region: read_opt_region(reader)?,
                measurements: info.measurement_names(),
                scan_order: info.scan_order,
                limit: info.limit,
                offset: info.offset,
            },
            (TAG_ALIGNED_SERIES_AGGREGATION_SCAN, Some(info)) => {
                Self::AlignedSeriesAggregationScan {
                    device: reader.read_string()?,
                    region: read_opt_region(reader)?,
                    measurements: info.measurement_names(),
                    aggregations: info.aggregations.clone(),
                    scan_order: info.scan_order,
                }
            }
            (TAG_IDENTITY_SINK, _) => {
                let count = reader.read_len()?;
                let mut downstream_endpoints = Vec::with_capacity(count);
                for _ in 0..count {
                    downstream_endpoints.push(Endpoint::decode(reader)?);
                }
                Self::IdentitySink {
                    downstream_endpoints,
                }
            }
            (TAG_EXCHANGE, _) => {
                let upstream_endpoint = if reader.read_bool()? {
                    Some(Endpoint::decode(reader)?)
                } else {
                    None
                };
                Self::Exchange {
                    upstream_endpoint,
                    upstream_plan_node_id: reader.read_opt_string()?.map(PlanNodeId::from),
                    output_columns: read_strings(reader)?,
                }
            }
            (TAG_DEVICE_VIEW, _) => Self::DeviceView {
                devices: read_strings(reader)?,
                output_columns: read_strings(reader)?,
            },
            (TAG_FULL_OUTER_TIME_JOIN, _) => Self::FullOuterTimeJoin {
                scan_order: ScanOrder::decode(reader)?,
            },
            (TAG_LIMIT, _) => Self::Limit {
                count: reader.read_i64()?,
            },
            (TAG_OFFSET, _) => Self::Offset {
                count: reader.read_i64()?,
            },
            (TAG_FILTER, _) => Self::Filter {
                predicate: reader.read_string()?,
            },
            (TAG_PROJECT, _) => Self::Project {
                output_columns: read_strings(reader)?,
            },
            (TAG_AGGREGATION, _) => Self::Aggregation {
                aggregations: read_strings(reader)?,
                group_by: read_strings(reader)?,
            },
            (TAG_SERIES_SCAN, _) => Self::SeriesScan {
                series_path: reader.read_string()?,
                scan_order: ScanOrder::decode(reader)?,
                region: read_opt_region(reader)?,
            },
            (TAG_ALIGNED_SERIES_SCAN, None) => Self::AlignedSeriesScan {
                device: reader.read_string()?,
                measurements: read_strings(reader)?,
                scan_order: ScanOrder::decode(reader)?,
                limit: reader.read_i64()?,
                offset: reader.read_i64()?,
                region: read_opt_region(reader)?,
            },
            (TAG_ALIGNED_SERIES_AGGREGATION_SCAN, None) => Self::AlignedSeriesAggregationScan {
                device: reader.read_string()?,
                measurements: read_strings(reader)?,
                aggregations: read_strings(reader)?,
                scan_order: ScanOrder::decode(reader)?,
                region: read_opt_region(reader)?,
            },
            (TAG_DEVICE_TABLE_SCAN, _) => Self::DeviceTableScan {
                table: reader.read_string()?,
                devices: read_strings(reader)?,
                output_columns: read_strings(reader)?,
                region: read_opt_region(reader)?,
            },
            (TAG_INFORMATION_SCHEMA_TABLE_SCAN, _) => Self::InformationSchemaTableScan {
                table: reader.read_string()?,
                output_columns: read_strings(reader)?,
                region: read_opt_region(reader)?,
            },
            (TAG_VIRTUAL_SOURCE, _) => Self::VirtualSource {
                location: DataNodeLocation::decode(reader)?,
                output_columns: read_strings(reader)?,
            },
            (other, _) => anyhow::bail!("unknown plan node tag {other}"),
        };
        let id = PlanNodeId::from(reader.read_string()?);
        Ok((id, kind))
    }
}

fn put_strings(out: &mut WireWriter, values: &[String]) {
    out.put_i32(values.len() as i32);
    for value in values {
        out.put_str(value);
    }
}

fn read_strings(reader: &mut WireReader<'_>) -> anyhow::Result<Vec<String>> {
    let count = reader.read_len()?;
    let mut values = Vec::with_capacity(count);
    for _ in 0..count {
        values.push(reader.read_string()?);
    }
    Ok(values)
}

fn put_opt_region(out: &mut WireWriter, region: Option<&RegionReplicaSet>) {
    match region {
        Some(region) => {
            out.put_bool(true);
            region.encode(out);
        }
        None => out.put_bool(false),
    }
}

fn read_opt_region(reader: &mut WireReader<'_>) -> anyhow::Result<Option<RegionReplicaSet>> {
    if reader.read_bool()? {
        Ok(Some(RegionReplicaSet::decode(reader)?))
    } else {
        Ok(None)
    }
}

/// One node of a [`PlanTree`].
#[derive(Clone, Debug)]
pub struct PlanNode {
    pub id: PlanNodeId,
    pub kind: PlanNodeKind,
    children: Vec<NodeIndex>,
}

impl PlanNode {
    pub fn children(&self) -> &[NodeIndex] {
        &self.children
    }
}

/// Rooted, ordered plan node tree stored as an arena.
#[derive(Clone, Debug)]
pub struct PlanTree {
    nodes: Vec<PlanNode>,
    root: NodeIndex,
}

impl PlanTree {
    pub fn with_root(id: impl Into<PlanNodeId>, kind: PlanNodeKind) -> Self {
        Self {
            nodes: vec![PlanNode {
                id: id.into(),
                kind,
                children: Vec::new(),
            }],
            root: NodeIndex(0),
        }
    }

    /// Append a child after the existing children of `parent`.
    pub fn add_child(
        &mut self,
        parent: NodeIndex,
        id: impl Into<PlanNodeId>,
        kind: PlanNodeKind,
    ) -> NodeIndex {
        let index = NodeIndex(self.nodes.len());
        self.nodes.push(PlanNode {
            id: id.into(),
            kind,
            children: Vec::new(),
        });
        self.nodes[parent.0].children.push(index);
        index
    }

    pub fn root(&self) -> NodeIndex {
        self.root
    }

    pub fn root_node(&self) -> &PlanNode {
        &self.nodes[self.root.0]
    }

    pub fn node(&self, index: NodeIndex) -> &PlanNode {
        &self.nodes[index.0]
    }

    pub fn node_mut(&mut self, index: NodeIndex) -> &mut PlanNode {
        &mut self.nodes[index.0]
    }

    pub fn children(&self, index: NodeIndex) -> &[NodeIndex] {
        &self.nodes[index.0].children
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Walk the tree in pre-order and return the first `Some` produced by `f`.
    pub fn find_map_preorder<'a, T, F>(&'a self, f: F) -> Option<T>
    where
        F: FnMut(&'a PlanNode) -> Option<T>,
    {
        let mut f = f;
        self.find_map_from(self.root, &mut f)
    }

    fn find_map_from<'a, T, F>(&'a self, index: NodeIndex, f: &mut F) -> Option<T>
    where
        F: FnMut(&'a PlanNode) -> Option<T>,
    {
        let node = self.node(index);
        if let Some(found) = f(node) {
            return Some(found);
        }
        node.children
            .iter()
            .find_map(|child| self.find_map_from(*child, f))
    }

    /// Nodes in pre-order, children in stored order.
    pub fn preorder(&self) -> Vec<&PlanNode> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![self.root];
        while let Some(index) = stack.pop() {
            let node = self.node(index);
            out.push(node);
            stack.extend(node.children.iter().rev().copied());
        }
        out
    }

    /// Every column name declared anywhere in the tree.
    pub fn declared_columns(&self) -> BTreeSet<String> {
        self.nodes
            .iter()
            .flat_map(|node| node.kind.declared_columns())
            .collect()
    }

    /// Recursive framing: head, then child count and children.
    pub fn encode(&self, out: &mut WireWriter) {
        self.encode_from(self.root, out, None);
    }

    /// Template-aware framing; templated scans carry no child count.
    pub fn encode_with_template(&self, out: &mut WireWriter, template: &TemplatedInfo) {
        self.encode_from(self.root, out, Some(template));
    }

    fn encode_from(&self, index: NodeIndex, out: &mut WireWriter, template: Option<&TemplatedInfo>) {
        let node = self.node(index);
        node.kind.encode_head(&node.id, out, template);
        if template.is_some() && node.kind.is_templated_scan() {
            return;
        }
        out.put_i32(node.children.len() as i32);
        for child in &node.children {
            self.encode_from(*child, out, template);
        }
    }

    /// Decode a tree written by [`Self::encode`] or [`Self::encode_with_template`].
    pub fn decode(
        reader: &mut WireReader<'_>,
        template: Option<&TemplatedInfo>,
    ) -> anyhow::Result<Self> {
        let mut nodes = Vec::new();
        let root = decode_subtree(reader, template, &mut nodes, 1)?;
        Ok(Self { nodes, root })
    }

    fn subtree_eq(&self, index: NodeIndex, other: &PlanTree, other_index: NodeIndex) -> bool {
        let left = self.node(index);
        let right = other.node(other_index);
        left.id == right.id
            && left.kind == right.kind
            && left.children.len() == right.children.len()
            && left
                .children
                .iter()
                .zip(&right.children)
                .all(|(l, r)| self.subtree_eq(*l, other, *r))
    }
}

fn decode_subtree(
    reader: &mut WireReader<'_>,
    template: Option<&TemplatedInfo>,
    nodes: &mut Vec<PlanNode>,
    depth: usize,
) -> anyhow::Result<NodeIndex> {
    anyhow::ensure!(
        depth <= MAX_PLAN_DEPTH,
        "plan tree nested deeper than {MAX_PLAN_DEPTH} levels"
    );
    let (id, kind) = PlanNodeKind::decode_head(reader, template)?;
    let short_circuit = template.is_some() && kind.is_templated_scan();
    let index = NodeIndex(nodes.len());
    nodes.push(PlanNode {
        id,
        kind,
        children: Vec::new(),
    });
    if short_circuit {
        return Ok(index);
    }
    let child_count = reader.read_len()?;
    for _ in 0..child_count {
        let child = decode_subtree(reader, template, nodes, depth + 1)?;
        nodes[index.0].children.push(child);
    }
    Ok(index)
}

/// Structural equality; arena layout is irrelevant.
impl PartialEq for PlanTree {
    fn eq(&self, other: &Self) -> bool {
        self.subtree_eq(self.root, other, other.root)
    }
}

impl Eq for PlanTree {}

/// Nested description of a subtree, flattened into a [`PlanTree`] by [`Self::build`].
#[derive(Clone, Debug)]
pub struct PlanNodeBuilder {
    id: PlanNodeId,
    kind: PlanNodeKind,
    children: Vec<PlanNodeBuilder>,
}

impl PlanNodeBuilder {
    pub fn new(id: impl Into<PlanNodeId>, kind: PlanNodeKind) -> Self {
        Self {
            id: id.into(),
            kind,
            children: Vec::new(),
        }
    }

    pub fn child(mut self, child: PlanNodeBuilder) -> Self {
        self.children.push(child);
        self
    }

    pub fn build(self) -> PlanTree {
        let PlanNodeBuilder { id, kind, children } = self;
        let mut tree = PlanTree::with_root(id, kind);
        let root = tree.root();
        for child in children {
            attach(&mut tree, root, child);
        }
        tree
    }
}

fn attach(tree: &mut PlanTree, parent: NodeIndex, builder: PlanNodeBuilder) {
    let index = tree.add_child(parent, builder.id, builder.kind);
    for child in builder.children {
        attach(tree, index, child);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::ConsensusGroupId;

    fn region(id: i32) -> RegionReplicaSet {
        RegionReplicaSet::new(ConsensusGroupId::data_region(id), Vec::new())
    }

    fn sample_tree() -> PlanTree {
        PlanNodeBuilder::new("limit", PlanNodeKind::Limit { count: 10 })
            .child(
                PlanNodeBuilder::new(
                    "join",
                    PlanNodeKind::FullOuterTimeJoin {
                        scan_order: ScanOrder::Asc,
                    },
                )
                .child(PlanNodeBuilder::new(
                    "s1",
                    PlanNodeKind::SeriesScan {
                        series_path: "root.sg.d1.s1".into(),
                        scan_order: ScanOrder::Asc,
                        region: Some(region(1)),
                    },
                ))
                .child(PlanNodeBuilder::new(
                    "s2",
                    PlanNodeKind::SeriesScan {
                        series_path: "root.sg.d1.s2".into(),
                        scan_order: ScanOrder::Asc,
                        region: None,
                    },
                )),
            )
            .build()
    }

    #[test]
    fn builder_preserves_child_order() {
        let tree = sample_tree();
        let ids: Vec<_> = tree.preorder().iter().map(|n| n.id.to_string()).collect();
        assert_eq!(ids, vec!["limit", "join", "s1", "s2"]);
        assert_eq!(tree.len(), 4);
    }

    #[test]
    fn equality_ignores_arena_layout() {
        let built = sample_tree();
        let mut manual = PlanTree::with_root("limit", PlanNodeKind::Limit { count: 10 });
        let join = manual.add_child(
            manual.root(),
            "join",
            PlanNodeKind::FullOuterTimeJoin {
                scan_order: ScanOrder::Asc,
            },
        );
        // Insert s2 first into the arena, then move it behind s1.
        let s2 = manual.add_child(
            join,
            "s2",
            PlanNodeKind::SeriesScan {
                series_path: "root.sg.d1.s2".into(),
                scan_order: ScanOrder::Asc,
                region: None,
            },
        );
        let s1 = manual.add_child(
            join,
            "s1",
            PlanNodeKind::SeriesScan {
                series_path: "root.sg.d1.s1".into(),
                scan_order: ScanOrder::Asc,
                region: Some(region(1)),
            },
        );
        manual.node_mut(join).children = vec![s1, s2];
        assert_eq!(built, manual);
    }

    #[test]
    fn child_order_is_significant() {
        let tree = sample_tree();
        let mut swapped = tree.clone();
        let join = swapped.children(swapped.root())[0];
        swapped.node_mut(join).children.reverse();
        assert_ne!(tree, swapped);
    }

    #[test]
    fn find_map_visits_children_in_order() {
        let tree = sample_tree();
        let first_scan = tree.find_map_preorder(|node| match &node.kind {
            PlanNodeKind::SeriesScan { series_path, .. } => Some(series_path.clone()),
            _ => None,
        });
        assert_eq!(first_scan.as_deref(), Some("root.sg.d1.s1"));
    }

    #[test]
    fn capability_queries() {
        let info_scan = PlanNodeKind::InformationSchemaTableScan {
            table: "queries".into(),
            output_columns: vec![],
            region: None,
        };
        assert_eq!(info_scan.intrinsic_region(), Some(None));
        assert_eq!(
            info_scan.intrinsic_location(),
            Some(LocationBinding::SingleReplica(None))
        );
        assert_eq!(PlanNodeKind::Limit { count: 1 }.intrinsic_region(), None);
        assert!(PlanNodeKind::AlignedSeriesScan {
            device: "root.sg.d1".into(),
            measurements: vec![],
            scan_order: ScanOrder::Asc,
            limit: 0,
            offset: 0,
            region: None,
        }
        .is_templated_scan());
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let mut out = WireWriter::new();
        out.put_i16(999);
        let bytes = out.freeze();
        let err = PlanTree::decode(&mut WireReader::new(&bytes), None).unwrap_err();
        assert!(err.to_string().contains("unknown plan node tag"), "{err}");
    }

    #[test]
    fn deeply_nested_payload_is_rejected() {
        let mut out = WireWriter::new();
        let id = PlanNodeId::new("limit");
        for _ in 0..200_000 {
            PlanNodeKind::Limit { count: 1 }.encode_head(&id, &mut out, None);
            out.put_i32(1);
        }
        let bytes = out.freeze();
        let err = PlanTree::decode(&mut WireReader::new(&bytes), None).unwrap_err();
        assert!(err.to_string().contains("nested deeper"), "{err}");
    }

    #[test]
    fn tree_at_depth_limit_decodes() {
        let mut builder = PlanNodeBuilder::new("leaf", PlanNodeKind::Limit { count: 1 });
        for level in 1..MAX_PLAN_DEPTH {
            builder = PlanNodeBuilder::new(format!("limit-{level}"), PlanNodeKind::Limit { count: 1 })
                .child(builder);
        }
        let tree = builder.build();
        let mut out = WireWriter::new();
        tree.encode(&mut out);
        let bytes = out.freeze();
        assert_eq!(PlanTree::decode(&mut WireReader::new(&bytes), None).unwrap(), tree);
    }

    #[test]
    fn corrupt_endpoint_count_is_rejected() {
        let mut out = WireWriter::new();
        out.put_i16(TAG_IDENTITY_SINK);
        out.put_i32(0x7fff_ffff);
        out.put_str("10.0.0.1");
        let bytes = out.freeze();
        let err = PlanTree::decode(&mut WireReader::new(&bytes), None).unwrap_err();
        assert!(err.to_string().contains("exceeds"), "{err}");
    }
}
