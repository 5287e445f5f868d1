use crate::network::{
    BufferId, BufferKey, ComputationNetwork, LoopId, NetworkError, NodeId, StepDirection,
};
use crate::ops::Operation;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyNode {
    pub id: NodeId,
    pub name: String,
    pub op: String,
    pub layout: Option<String>,
    pub groups: Vec<String>,
    pub loop_id: Option<LoopId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyEdge {
    pub from: NodeId,
    pub to: NodeId,
    pub input_index: usize,
    /// The consumer is a delay, so this edge crosses time steps.
    pub delayed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyLoop {
    pub id: LoopId,
    pub anchor: String,
    pub direction: StepDirection,
    pub members: Vec<String>,
}

/// Nodes and edges for external visualization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyExport {
    pub nodes: Vec<TopologyNode>,
    pub edges: Vec<TopologyEdge>,
    pub loops: Vec<TopologyLoop>,
    pub roots: Vec<String>,
}

fn dot_id(id: NodeId) -> String {
    format!("n{}", id.0)
}

fn escape_dot(text: &str) -> String {
    text.replace('\\', "\\\\").replace('"', "\\\"")
}

impl ComputationNetwork {
    pub fn export_topology(&self) -> TopologyExport {
        let mut nodes = Vec::new();
        let mut edges = Vec::new();
        for (id, node) in self.nodes() {
            nodes.push(TopologyNode {
                id,
                name: node.name.clone(),
                op: node.op_name().to_string(),
                layout: node.layout.map(|x| x.to_string()),
                groups: node.tags.iter().map(|x| x.to_string()).collect(),
                loop_id: node.loop_id,
            });
            let delayed = node.op.delay_offset().is_some();
            for (input_index, input) in node.inputs.iter().enumerate() {
                edges.push(TopologyEdge {
                    from: *input,
                    to: id,
                    input_index,
                    delayed,
                });
            }
        }
        let loops = self
            .loops
            .iter()
            .map(|unit| TopologyLoop {
                id: unit.id(),
                anchor: self.node_name(unit.anchor()),
                direction: unit.direction(),
                members: unit.members().iter().map(|x| self.node_name(*x)).collect(),
            })
            .collect();
        TopologyExport {
            nodes,
            edges,
            loops,
            roots: self.roots.iter().map(|x| self.node_name(*x)).collect(),
        }
    }

    pub fn export_topology_json(&self) -> Result<String, NetworkError> {
        Ok(serde_json::to_string_pretty(&self.export_topology())?)
    }

    /// Graphviz rendering; loop units become clusters and delayed edges are dashed.
    pub fn export_topology_dot(&self) -> String {
        let topology = self.export_topology();
        let mut out = String::from("digraph network {\n  rankdir=BT;\n");
        for unit in &self.loops {
            out.push_str(&format!(
                "  subgraph cluster_loop{} {{\n    label=\"loop {} ({})\";\n",
                unit.id().0,
                unit.id().0,
                unit.direction()
            ));
            for member in unit.members() {
                out.push_str(&format!("    {};\n", dot_id(*member)));
            }
            out.push_str("  }\n");
        }
        for node in &topology.nodes {
            let shape = if topology.roots.contains(&node.name) {
                "doubleoctagon"
            } else {
                "box"
            };
            out.push_str(&format!(
                "  {} [label=\"{}\\n{}\", shape={shape}];\n",
                dot_id(node.id),
                escape_dot(&node.name),
                node.op
            ));
        }
        for edge in &topology.edges {
            let style = if edge.delayed { " [style=dashed]" } else { "" };
            out.push_str(&format!(
                "  {} -> {}{style};\n",
                dot_id(edge.from),
                dot_id(edge.to)
            ));
        }
        out.push_str("}\n");
        out
    }

    /// Text description of one node: its definition and/or its current value.
    pub fn dump_node_info(
        &self,
        id: NodeId,
        print_values: bool,
        print_metadata: bool,
    ) -> Result<String, NetworkError> {
        let node = self.node(id)?;
        let mut out = String::new();
        if print_metadata {
            let inputs: Vec<String> = node.inputs.iter().map(|x| self.node_name(*x)).collect();
            out.push_str(&format!(
                "{} = {}({})",
                node.name,
                node.op_name(),
                inputs.join(", ")
            ));
            if let Some(layout) = node.layout {
                out.push_str(&format!(" : {layout}"));
            }
            if let Some(loop_id) = node.loop_id {
                out.push_str(&format!(" in {loop_id}"));
            }
            if !node.tags.is_empty() {
                let tags: Vec<String> = node.tags.iter().map(|x| x.to_string()).collect();
                out.push_str(&format!(" [{}]", tags.join(", ")));
            }
            out.push_str(&format!(
                " state={} stamp={} needs_gradient={}\n",
                node.state, node.eval_time_stamp, node.needs_gradient
            ));
        }
        if print_values {
            match self.value(id) {
                Ok(value) if value.is_empty() => out.push_str(&format!("{}: (empty)\n", node.name)),
                Ok(value) => {
                    out.push_str(&format!("{}: {} x {}\n", node.name, value.nrows(), value.ncols()));
                    for row in value.rows() {
                        let cells: Vec<String> = row.iter().map(|x| format!("{x:.6}")).collect();
                        out.push_str(&cells.join(" "));
                        out.push('\n');
                    }
                }
                Err(_) => out.push_str(&format!("{}: (no value)\n", node.name)),
            }
        }
        Ok(out)
    }

    /// Dumps every node matching `pattern` (exact name or `prefix*suffix`).
    pub fn dump_nodes_to_file(
        &self,
        pattern: &str,
        path: impl AsRef<Path>,
        print_values: bool,
        print_metadata: bool,
    ) -> Result<(), NetworkError> {
        let ids = self.nodes_from_name(pattern);
        if ids.is_empty() {
            return Err(NetworkError::UnknownNodeName(pattern.to_string()));
        }
        self.dump_ids_to_file(&ids, path.as_ref(), print_values, print_metadata)
    }

    pub fn dump_all_nodes_to_file(
        &self,
        path: impl AsRef<Path>,
        print_values: bool,
        print_metadata: bool,
    ) -> Result<(), NetworkError> {
        let ids: Vec<NodeId> = self.nodes().map(|(id, _)| id).collect();
        self.dump_ids_to_file(&ids, path.as_ref(), print_values, print_metadata)
    }

    fn dump_ids_to_file(
        &self,
        ids: &[NodeId],
        path: &Path,
        print_values: bool,
        print_metadata: bool,
    ) -> Result<(), NetworkError> {
        let mut text = String::new();
        for id in ids {
            text.push_str(&self.dump_node_info(*id, print_values, print_metadata)?);
        }
        std::fs::write(path, text)?;
        Ok(())
    }

    /// Which requests ended up on which pooled buffer.
    pub fn describe_memory_sharing(&self) -> String {
        let mut by_buffer: BTreeMap<BufferId, Vec<BufferKey>> = BTreeMap::new();
        for (key, buffer) in self.pool.assignments() {
            by_buffer.entry(buffer).or_default().push(key);
        }
        let shared = by_buffer.values().filter(|x| x.len() > 1).count();
        let mut out = format!(
            "Memory sharing: {} buffers, {} shared\n",
            by_buffer.len(),
            shared
        );
        for (buffer, keys) in by_buffer {
            let holders: Vec<String> = keys
                .iter()
                .map(|key| format!("{}.{}", self.node_name(key.node), key.role))
                .collect();
            let kind = if self.pool.is_shareable(buffer) {
                "shared"
            } else {
                "dedicated"
            };
            out.push_str(&format!(
                "  {buffer} {} {kind}: {}\n",
                self.pool.size_class(buffer),
                holders.join(", ")
            ));
        }
        let step_only: Vec<String> = self
            .nodes()
            .filter(|(id, _)| self.step_values.contains(id))
            .map(|(_, node)| node.name.clone())
            .collect();
        if !step_only.is_empty() {
            out.push_str(&format!("  one step at a time: {}\n", step_only.join(", ")));
        }
        out
    }
}
