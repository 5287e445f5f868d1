use crate::network::{ComputationNetwork, ComputationNode, NetworkError, NodeGroup, NodeId};
use crate::ops::AnyOperation;
use log::{debug, error};
use std::collections::HashMap;
use std::str::FromStr;

pub fn parse_group_tag(tag: &str) -> Result<NodeGroup, NetworkError> {
    NodeGroup::from_str(tag.trim()).map_err(|_| NetworkError::InvalidGroupTag(tag.to_string()))
}

fn matches_pattern(name: &str, pattern: &str) -> bool {
    match pattern.split_once('*') {
        Some((prefix, suffix)) => {
            name.len() >= prefix.len() + suffix.len()
                && name.starts_with(prefix)
                && name.ends_with(suffix)
        }
        None => name == pattern,
    }
}

impl ComputationNetwork {
    /// Registers a node, applying the configured duplicate-name policy. A taken
    /// name is always a duplicate, even when the registered node looks the same.
    pub fn add_node(&mut self, node: ComputationNode) -> Result<NodeId, NetworkError> {
        let make_unique = self.config.make_unique_names;
        self.register(node, make_unique)
    }

    /// Shorthand for `add_node(ComputationNode::new(name, op).with_inputs(inputs))`.
    pub fn add_operation(
        &mut self,
        name: &str,
        op: impl Into<AnyOperation>,
        inputs: &[NodeId],
    ) -> Result<NodeId, NetworkError> {
        self.add_node(ComputationNode::new(name, op).with_inputs(inputs.iter().copied()))
    }

    /// Registers `node` unless an identical node (same name, operation parameters,
    /// inputs and tags) is already present, in which case its id is returned with
    /// `false`.
    ///
    /// A different node under the same name is a duplicate. With `make_unique`,
    /// qualified names (containing `.`, `[` or `]`) are prefixed with `_` until they
    /// are free; plain names are still rejected.
    pub fn add_node_if_not_yet(
        &mut self,
        node: ComputationNode,
        make_unique: bool,
    ) -> Result<(NodeId, bool), NetworkError> {
        if let Some(existing) = self.name_index.get(&node.name).copied() {
            let same = self.node(existing).is_ok_and(|x| {
                x.op == node.op && x.inputs == node.inputs && x.tags == node.tags
            });
            if same {
                return Ok((existing, false));
            }
        }
        self.register(node, make_unique).map(|id| (id, true))
    }

    fn register(&mut self, mut node: ComputationNode, make_unique: bool) -> Result<NodeId, NetworkError> {
        while self.name_index.contains_key(&node.name) {
            if !make_unique || !node.name.contains(['.', '[', ']']) {
                error!("Duplicate node name {}", node.name);
                return Err(NetworkError::DuplicateNodeName(node.name));
            }
            node.name = format!("_{}", node.name);
        }
        let id = NodeId(self.nodes.len());
        debug!("Registered node {} ({}) as {id}", node.name, node.op_name());
        self.name_index.insert(node.name.clone(), id);
        self.nodes.push(Some(node));
        self.registration_order.push(id);
        self.invalidate_structure();
        Ok(id)
    }

    /// Detaches the node from the registry. Other nodes' input lists and groups are
    /// left as they are; a remaining reference shows up as a dangling input at compile.
    pub fn remove_node(&mut self, id: NodeId) -> Result<ComputationNode, NetworkError> {
        let node = self
            .nodes
            .get_mut(id.0)
            .and_then(|x| x.take())
            .ok_or(NetworkError::UnknownNode(id))?;
        self.name_index.remove(&node.name);
        self.registration_order.retain(|x| *x != id);
        self.invalidate_structure();
        Ok(node)
    }

    pub fn rename_node(&mut self, id: NodeId, new_name: &str) -> Result<(), NetworkError> {
        if self.name_index.contains_key(new_name) {
            return Err(NetworkError::DuplicateNodeName(new_name.to_string()));
        }
        let node = self.node_mut(id)?;
        let old_name = std::mem::replace(&mut node.name, new_name.to_string());
        self.name_index.remove(&old_name);
        self.name_index.insert(new_name.to_string(), id);
        Ok(())
    }

    /// Replaces the inputs of a node.
    pub fn attach_inputs(&mut self, id: NodeId, inputs: &[NodeId]) -> Result<(), NetworkError> {
        self.node_mut(id)?.inputs = inputs.to_vec();
        self.invalidate_structure();
        Ok(())
    }

    /// Exact name, or a single-wildcard pattern `prefix*suffix`. Registration order.
    pub fn nodes_from_name(&self, pattern: &str) -> Vec<NodeId> {
        if !pattern.contains('*') {
            return self.name_index.get(pattern).copied().into_iter().collect();
        }
        self.nodes()
            .filter(|(_, node)| matches_pattern(&node.name, pattern))
            .map(|(id, _)| id)
            .collect()
    }

    pub fn nodes_with_op(&self, op_name: &str) -> Vec<NodeId> {
        self.nodes()
            .filter(|(_, node)| node.op_name() == op_name)
            .map(|(id, _)| id)
            .collect()
    }

    /// Consumers of every node, in registration order.
    pub fn parents_map(&self) -> HashMap<NodeId, Vec<NodeId>> {
        let mut parents: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        for (id, node) in self.nodes() {
            parents.entry(id).or_default();
            for input in &node.inputs {
                let consumers = parents.entry(*input).or_default();
                if !consumers.contains(&id) {
                    consumers.push(id);
                }
            }
        }
        parents
    }

    pub fn parent_nodes(&self, name: &str) -> Result<Vec<NodeId>, NetworkError> {
        let id = self.node_id(name)?;
        Ok(self.parents_map().remove(&id).unwrap_or_default())
    }

    pub fn add_to_group(&mut self, id: NodeId, group: NodeGroup) -> Result<(), NetworkError> {
        let inserted = self.node_mut(id)?.tags.insert(group);
        if inserted && group.is_root_group() {
            self.invalidate_structure();
        }
        Ok(())
    }

    /// Like [`Self::add_to_group`], with the group given as a text tag.
    pub fn add_to_group_by_tag(&mut self, id: NodeId, tag: &str) -> Result<(), NetworkError> {
        let group = parse_group_tag(tag)?;
        self.add_to_group(id, group)
    }

    pub fn remove_from_group(&mut self, id: NodeId, group: NodeGroup) -> Result<(), NetworkError> {
        let removed = self.node_mut(id)?.tags.remove(&group);
        if removed && group.is_root_group() {
            self.invalidate_structure();
        }
        Ok(())
    }

    pub fn group_nodes(&self, group: NodeGroup) -> Vec<NodeId> {
        self.nodes()
            .filter(|(_, node)| node.has_tag(group))
            .map(|(id, _)| id)
            .collect()
    }

    pub fn feature_nodes(&self) -> Vec<NodeId> {
        self.group_nodes(NodeGroup::Input)
    }

    pub fn label_nodes(&self) -> Vec<NodeId> {
        self.group_nodes(NodeGroup::Target)
    }

    pub fn final_criterion_nodes(&self) -> Vec<NodeId> {
        self.group_nodes(NodeGroup::Loss)
    }

    pub fn evaluation_nodes(&self) -> Vec<NodeId> {
        self.group_nodes(NodeGroup::Metric)
    }

    pub fn output_nodes(&self) -> Vec<NodeId> {
        self.group_nodes(NodeGroup::Output)
    }
}
