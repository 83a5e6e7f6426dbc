//! Plan fragments: the placement-bound unit of distributed execution.
//!
//! A fragment owns one subtree of a distributed plan plus the column types
//! its operators need. Placement is resolved by walking the subtree:
//! region-affine fragments resolve to a replica set, system and virtual
//! sources resolve to one concrete data node.
//!
//! Two byte layouts exist and both are part of the inter-node protocol:
//!
//! - stream form: `id | flag | [type provider] | tree`, where a templated type
//!   provider switches the tree to the template-aware encoder.
//! - buffer form: `id | tree | flag | [type provider]`, tree always generic.

use std::collections::HashMap;
use std::fmt;
use std::io::Write;

use anyhow::Context;
use bytes::Bytes;

use crate::codec::{WireReader, WireWriter};
use crate::ids::{PlanFragmentId, PlanNodeId, QueryId};
use crate::node::{LocationBinding, NodeIndex, PlanTree};
use crate::region::{DataNodeLocation, NodeDistribution, RegionReplicaSet};
use crate::types::TypeProvider;

/// Serializable subtree of a distributed plan.
#[derive(Clone, Debug)]
pub struct PlanFragment {
    id: PlanFragmentId,
    plan_node_tree: Option<PlanTree>,
    type_provider: Option<TypeProvider>,
    /// Whether this fragment holds the root of the whole distributed plan.
    is_root: bool,
    /// Position in the fragment instance list, `-1` until instances exist.
    index_in_fragment_instance_list: i32,
}

impl PlanFragment {
    pub fn new(id: PlanFragmentId, plan_node_tree: Option<PlanTree>) -> Self {
        Self {
            id,
            plan_node_tree,
            type_provider: None,
            is_root: false,
            index_in_fragment_instance_list: -1,
        }
    }

    pub fn id(&self) -> PlanFragmentId {
        self.id
    }

    pub fn plan_node_tree(&self) -> Option<&PlanTree> {
        self.plan_node_tree.as_ref()
    }

    pub fn set_plan_node_tree(&mut self, tree: PlanTree) {
        self.plan_node_tree = Some(tree);
    }

    pub fn type_provider(&self) -> Option<&TypeProvider> {
        self.type_provider.as_ref()
    }

    pub fn set_type_provider(&mut self, type_provider: TypeProvider) {
        self.type_provider = Some(type_provider);
    }

    /// Narrow a plan-wide provider to the columns declared by this fragment.
    pub fn generate_type_provider(&mut self, all_types: &TypeProvider) {
        if let Some(tree) = &self.plan_node_tree {
            let columns = tree.declared_columns();
            self.type_provider = Some(all_types.extract_for(columns.iter().map(String::as_str)));
        }
    }

    pub fn is_root(&self) -> bool {
        self.is_root
    }

    pub fn set_root(&mut self, is_root: bool) {
        self.is_root = is_root;
    }

    pub fn index_in_fragment_instance_list(&self) -> i32 {
        self.index_in_fragment_instance_list
    }

    pub fn set_index_in_fragment_instance_list(&mut self, index: i32) {
        self.index_in_fragment_instance_list = index;
    }

    /// Region owning this fragment's source nodes, from the tree alone.
    pub fn target_region_for_tree_model(&self) -> Option<&RegionReplicaSet> {
        let tree = self.plan_node_tree.as_ref()?;
        node_region(tree, tree.root(), None)
    }

    /// Region resolution where the distribution map overrides tree inspection.
    pub fn target_region_for_table_model<'a>(
        &'a self,
        distribution: &'a HashMap<PlanNodeId, NodeDistribution>,
    ) -> Option<&'a RegionReplicaSet> {
        let tree = self.plan_node_tree.as_ref()?;
        node_region(tree, tree.root(), Some(distribution))
    }

    /// Data node a node-affine fragment must run on.
    ///
    /// # Panics
    ///
    /// If an information-schema scan does not carry exactly one data node
    /// location. The planner guarantees that shape.
    pub fn target_location(&self) -> Option<&DataNodeLocation> {
        let tree = self.plan_node_tree.as_ref()?;
        node_location(tree, tree.root())
    }

    /// Drop the node tree and type provider once the fragment is dispatched.
    pub fn clear_useless_field(&mut self) {
        self.plan_node_tree = None;
        self.type_provider = None;
    }

    pub fn clear_type_provider(&mut self) {
        self.type_provider = None;
    }

    /// Write the stream form to `stream`.
    pub fn serialize<W: Write>(&self, stream: &mut W) -> anyhow::Result<()> {
        let mut out = WireWriter::new();
        self.encode_stream_form(&mut out)?;
        stream
            .write_all(out.as_slice())
            .with_context(|| format!("write {self} to stream"))
    }

    /// Stream form as an owned byte buffer.
    pub fn to_bytes(&self) -> anyhow::Result<Bytes> {
        let mut out = WireWriter::new();
        self.encode_stream_form(&mut out)?;
        Ok(out.freeze())
    }

    fn encode_stream_form(&self, out: &mut WireWriter) -> anyhow::Result<()> {
        let tree = self.tree_for_encoding()?;
        encode_fragment_id(&self.id, out);
        match &self.type_provider {
            None => out.put_u8(0),
            Some(type_provider) => {
                out.put_u8(1);
                type_provider.encode(out);
                if let Some(template) = type_provider.templated_info() {
                    tree.encode_with_template(out, template);
                    return Ok(());
                }
            }
        }
        tree.encode(out);
        Ok(())
    }

    /// Append the buffer form to `out`.
    pub fn serialize_to_buffer(&self, out: &mut WireWriter) -> anyhow::Result<()> {
        let tree = self.tree_for_encoding()?;
        encode_fragment_id(&self.id, out);
        tree.encode(out);
        match &self.type_provider {
            None => out.put_u8(0),
            Some(type_provider) => {
                out.put_u8(1);
                type_provider.encode(out);
            }
        }
        Ok(())
    }

    fn tree_for_encoding(&self) -> anyhow::Result<&PlanTree> {
        self.plan_node_tree
            .as_ref()
            .with_context(|| format!("{self} has no plan node tree to serialize"))
    }

    /// Decode a complete stream-form payload.
    pub fn deserialize(data: &[u8]) -> anyhow::Result<Self> {
        let mut reader = WireReader::new(data);
        let fragment = Self::deserialize_from(&mut reader)?;
        anyhow::ensure!(
            reader.is_empty(),
            "{} trailing bytes after {fragment}",
            reader.remaining()
        );
        Ok(fragment)
    }

    /// Decode one stream-form fragment from `reader`.
    pub fn deserialize_from(reader: &mut WireReader<'_>) -> anyhow::Result<Self> {
        let id = decode_fragment_id(reader).context("decode plan fragment id")?;
        let type_provider = if reader.read_bool()? {
            Some(TypeProvider::decode(reader).context("decode type provider")?)
        } else {
            None
        };
        let template = type_provider
            .as_ref()
            .and_then(TypeProvider::templated_info);
        let tree = PlanTree::decode(reader, template)
            .with_context(|| format!("decode plan node tree of fragment {id}"))?;
        let mut fragment = Self::new(id, Some(tree));
        fragment.type_provider = type_provider;
        Ok(fragment)
    }

    /// Decode a complete buffer-form payload.
    pub fn deserialize_buffer_form(data: &[u8]) -> anyhow::Result<Self> {
        let mut reader = WireReader::new(data);
        let id = decode_fragment_id(&mut reader).context("decode plan fragment id")?;
        let tree = PlanTree::decode(&mut reader, None)
            .with_context(|| format!("decode plan node tree of fragment {id}"))?;
        let type_provider = if reader.read_bool()? {
            Some(TypeProvider::decode(&mut reader).context("decode type provider")?)
        } else {
            None
        };
        anyhow::ensure!(
            reader.is_empty(),
            "{} trailing bytes after fragment {id}",
            reader.remaining()
        );
        let mut fragment = Self::new(id, Some(tree));
        fragment.type_provider = type_provider;
        Ok(fragment)
    }
}

fn node_region<'a>(
    tree: &'a PlanTree,
    index: NodeIndex,
    distribution: Option<&'a HashMap<PlanNodeId, NodeDistribution>>,
) -> Option<&'a RegionReplicaSet> {
    let node = tree.node(index);
    if let Some(assigned) = distribution.and_then(|map| map.get(&node.id)) {
        return assigned.region.as_ref();
    }
    if let Some(region) = node.kind.intrinsic_region() {
        return region;
    }
    node.children().iter().find_map(|child| {
        node_region(tree, *child, distribution).filter(|region| !region.is_not_assigned())
    })
}

fn node_location(tree: &PlanTree, index: NodeIndex) -> Option<&DataNodeLocation> {
    let node = tree.node(index);
    match node.kind.intrinsic_location() {
        Some(LocationBinding::Direct(location)) => Some(location),
        Some(LocationBinding::SingleReplica(region)) => {
            let locations = region
                .map(|region| region.data_node_locations.as_slice())
                .unwrap_or_default();
            assert!(
                locations.len() == 1,
                "information schema scan {} must be bound to exactly one data node, found {}",
                node.id,
                locations.len()
            );
            locations.first()
        }
        None => node
            .children()
            .iter()
            .find_map(|child| node_location(tree, *child)),
    }
}

fn encode_fragment_id(id: &PlanFragmentId, out: &mut WireWriter) {
    out.put_i32(id.query_id.data_node_id);
    out.put_u64(id.query_id.counter);
    out.put_i32(id.fragment_id);
}

fn decode_fragment_id(reader: &mut WireReader<'_>) -> anyhow::Result<PlanFragmentId> {
    let data_node_id = reader.read_i32()?;
    let counter = reader.read_u64()?;
    let fragment_id = reader.read_i32()?;
    Ok(PlanFragmentId::new(
        QueryId::new(data_node_id, counter),
        fragment_id,
    ))
}

/// Fragments are equal when their ids and node trees are.
impl PartialEq for PlanFragment {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.plan_node_tree == other.plan_node_tree
    }
}

impl Eq for PlanFragment {}

impl fmt::Display for PlanFragment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PlanFragment-{}", self.id)
    }
}
