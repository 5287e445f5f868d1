use crate::network_tests::{build_accumulator, build_chain, build_recurrent_pair};
use compnet::network::StepDirection;
use compnet::ops::{
    BinaryOperation, DelayOperation, InputValueOperation, LearnableParameterOperation,
    TimesOperation, UnaryOperation,
};
use compnet::{ComputationNetwork, ErrorKind, NetworkConfig, NetworkError, PlanStep, SampleLayout};
use std::collections::HashSet;

pub fn test_chain_order(config: NetworkConfig) {
    let (mut network, [x, y, z]) = build_chain(config);
    network.compile().unwrap();
    assert_eq!(network.roots(), &[z]);
    assert!(network.loops().is_empty());
    assert_eq!(
        network.compute_order(&[]).unwrap(),
        vec![PlanStep::Node(x), PlanStep::Node(y), PlanStep::Node(z)]
    );
    assert_eq!(network.get_flat_order(None).unwrap(), vec![x, y, z]);
}

pub fn test_diamond_order(config: NetworkConfig) {
    let mut network = ComputationNetwork::new(config);
    let a = network
        .add_operation("a", InputValueOperation::new(3), &[])
        .unwrap();
    let b = network.add_operation("b", UnaryOperation::tanh(), &[a]).unwrap();
    let c = network
        .add_operation("c", UnaryOperation::sigmoid(), &[a])
        .unwrap();
    let d = network
        .add_operation("d", BinaryOperation::plus(), &[b, c])
        .unwrap();
    network.compile().unwrap();
    assert_eq!(
        network.compute_order(&[d]).unwrap(),
        vec![
            PlanStep::Node(a),
            PlanStep::Node(b),
            PlanStep::Node(c),
            PlanStep::Node(d)
        ]
    );
}

pub fn test_shared_ancestor_ordered_once(config: NetworkConfig) {
    let mut network = ComputationNetwork::new(config);
    let a = network
        .add_operation("a", InputValueOperation::new(3), &[])
        .unwrap();
    let b = network.add_operation("b", UnaryOperation::tanh(), &[a]).unwrap();
    let c1 = network
        .add_operation("c1", UnaryOperation::sigmoid(), &[b])
        .unwrap();
    let c2 = network.add_operation("c2", UnaryOperation::relu(), &[b]).unwrap();
    network.compile().unwrap();
    assert_eq!(network.roots(), &[c1, c2]);

    let order = network.compute_order(&[c1, c2]).unwrap();
    assert_eq!(order.iter().filter(|x| **x == PlanStep::Node(b)).count(), 1);
    assert_eq!(
        order,
        vec![
            PlanStep::Node(a),
            PlanStep::Node(b),
            PlanStep::Node(c1),
            PlanStep::Node(c2)
        ]
    );
}

pub fn test_recurrent_pair_forms_one_loop(config: NetworkConfig) {
    let (mut network, [x, p, q, d]) = build_recurrent_pair(config);
    network.compile().unwrap();

    // Nothing outside the loop consumes it, so a member is picked as root.
    assert_eq!(network.roots(), &[p]);
    assert_eq!(network.loops().len(), 1);
    let unit = &network.loops()[0];
    assert_eq!(unit.direction(), StepDirection::Forward);
    assert_eq!(unit.anchor(), d);
    assert_eq!(unit.members(), &[d, p, q]);
    for member in [p, q, d] {
        let node = network.node(member).unwrap();
        assert!(node.is_part_of_loop());
        assert_eq!(node.loop_id(), Some(unit.id()));
        assert_eq!(node.layout(), Some(SampleLayout::Minibatch { rows: 2 }));
    }
    assert!(!network.node(x).unwrap().is_part_of_loop());
    assert_eq!(
        network.compute_order(&[]).unwrap(),
        vec![PlanStep::Node(x), PlanStep::Loop(unit.id())]
    );
}

pub fn test_future_value_loop_steps_backward(config: NetworkConfig) {
    let mut network = ComputationNetwork::new(config);
    let x = network
        .add_operation("x", InputValueOperation::new(1), &[])
        .unwrap();
    let p = network.add_operation("p", BinaryOperation::plus(), &[]).unwrap();
    let next = network
        .add_operation("next", DelayOperation::future_value(1, 1), &[p])
        .unwrap();
    network.attach_inputs(p, &[x, next]).unwrap();
    let out = network.add_operation("out", UnaryOperation::tanh(), &[p]).unwrap();
    network.compile().unwrap();

    assert_eq!(network.roots(), &[out]);
    let unit = &network.loops()[0];
    assert_eq!(unit.direction(), StepDirection::Backward);
    assert_eq!(unit.members(), &[next, p]);
    assert_eq!(
        network.compute_order(&[]).unwrap(),
        vec![
            PlanStep::Node(x),
            PlanStep::Loop(unit.id()),
            PlanStep::Node(out)
        ]
    );
}

pub fn test_ungrounded_cycle_rejected(config: NetworkConfig) {
    let mut network = ComputationNetwork::new(config);
    let x = network
        .add_operation("x", InputValueOperation::new(1), &[])
        .unwrap();
    let a = network.add_operation("a", BinaryOperation::plus(), &[]).unwrap();
    let b = network.add_operation("b", UnaryOperation::tanh(), &[a]).unwrap();
    network.attach_inputs(a, &[x, b]).unwrap();

    let err = network.compile().unwrap_err();
    let NetworkError::UngroundedCycle(members) = &err else {
        panic!("unexpected error {err}");
    };
    let members: HashSet<&str> = members.iter().map(|x| x.as_str()).collect();
    assert_eq!(members, HashSet::from(["a", "b"]));
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert!(!network.is_compiled());
}

pub fn test_self_edge_without_delay_rejected(config: NetworkConfig) {
    let mut network = ComputationNetwork::new(config);
    let x = network
        .add_operation("x", InputValueOperation::new(1), &[])
        .unwrap();
    let a = network.add_operation("a", BinaryOperation::plus(), &[]).unwrap();
    network.attach_inputs(a, &[x, a]).unwrap();
    assert!(matches!(
        network.compile(),
        Err(NetworkError::UngroundedCycle(_))
    ));
}

pub fn test_conflicting_step_direction_rejected(config: NetworkConfig) {
    let mut network = ComputationNetwork::new(config);
    let x = network
        .add_operation("x", InputValueOperation::new(1), &[])
        .unwrap();
    let p = network.add_operation("p", BinaryOperation::plus(), &[]).unwrap();
    let q = network.add_operation("q", BinaryOperation::plus(), &[]).unwrap();
    let past = network
        .add_operation("past", DelayOperation::past_value(1, 1), &[q])
        .unwrap();
    let future = network
        .add_operation("future", DelayOperation::future_value(1, 1), &[p])
        .unwrap();
    network.attach_inputs(p, &[x, past]).unwrap();
    network.attach_inputs(q, &[p, future]).unwrap();

    let err = network.compile().unwrap_err();
    assert!(matches!(err, NetworkError::ConflictingStepDirection(_)));
    assert_eq!(err.kind(), ErrorKind::Configuration);
}

pub fn test_compile_is_idempotent(config: NetworkConfig) {
    let (mut network, [x, p, q, d]) = build_recurrent_pair(config.clone());
    network.compile().unwrap();
    let order = network.compute_order(&[]).unwrap();
    let flat = network.get_flat_order(None).unwrap();
    let roots = network.roots().to_vec();
    let loops = network.loops().to_vec();
    let loop_ids: Vec<_> = [x, p, q, d]
        .iter()
        .map(|x| network.node(*x).unwrap().loop_id())
        .collect();
    network.compile().unwrap();
    assert_eq!(network.compute_order(&[]).unwrap(), order);

    // An edit that is undone still forces a full rebuild.
    let extra = network
        .add_operation("extra", UnaryOperation::relu(), &[q])
        .unwrap();
    network.remove_node(extra).unwrap();
    assert!(!network.is_compiled());
    network.compile().unwrap();
    assert_eq!(network.compute_order(&[]).unwrap(), order);
    assert_eq!(network.get_flat_order(None).unwrap(), flat);
    assert_eq!(network.roots(), roots.as_slice());
    assert_eq!(network.loops(), loops.as_slice());
    for (id, loop_id) in [x, p, q, d].iter().zip(&loop_ids) {
        assert_eq!(network.node(*id).unwrap().loop_id(), *loop_id);
    }
    let unit = &network.loops()[0];
    assert_eq!(unit.anchor(), d);
    assert_eq!(unit.members(), &[d, p, q]);
    assert_eq!(unit.direction(), StepDirection::Forward);

    let (mut network, [_, y, z]) = build_chain(config);
    network.compile().unwrap();

    let w = network
        .add_operation("w", UnaryOperation::relu(), &[y])
        .unwrap();
    assert!(!network.is_compiled());
    assert!(matches!(
        network.compute_order(&[]),
        Err(NetworkError::NotCompiled)
    ));
    network.compile().unwrap();
    assert_eq!(network.roots(), &[z, w]);
    assert_eq!(network.compute_order(&[]).unwrap().len(), 4);
}

pub fn test_dangling_input_rejected(config: NetworkConfig) {
    let (mut network, [_, y, _]) = build_chain(config);
    network.remove_node(y).unwrap();
    let err = network.compile().unwrap_err();
    assert!(matches!(err, NetworkError::DanglingInput { input, .. } if input == y));
    assert_eq!(err.kind(), ErrorKind::Configuration);
}

pub fn test_incompatible_layouts_rejected(config: NetworkConfig) {
    let mut network = ComputationNetwork::new(config);
    let x = network
        .add_operation("x", InputValueOperation::new(4), &[])
        .unwrap();
    let w = network
        .add_operation("w", LearnableParameterOperation::new(3, 2), &[])
        .unwrap();
    network
        .add_operation("wx", TimesOperation::new(), &[w, x])
        .unwrap();
    let err = network.compile().unwrap_err();
    assert!(matches!(err, NetworkError::InvalidOperation { ref node, .. } if node == "wx"));
    assert_eq!(err.kind(), ErrorKind::Configuration);
}

pub fn test_gradient_flags(config: NetworkConfig) {
    let mut acc = build_accumulator(config);
    acc.network.compile().unwrap();
    let network = &acc.network;
    assert!(!network.node(acc.x).unwrap().needs_gradient());
    for id in [acc.w, acc.h, acc.h_prev, acc.loss] {
        assert!(network.node(id).unwrap().needs_gradient());
    }

    let mut frozen = ComputationNetwork::new(NetworkConfig::default());
    let w = frozen
        .add_operation(
            "w",
            LearnableParameterOperation::new(1, 1).with_learning_rate_multiplier(0.0),
            &[],
        )
        .unwrap();
    let y = frozen.add_operation("y", UnaryOperation::tanh(), &[w]).unwrap();
    frozen.compile().unwrap();
    assert!(!frozen.node(y).unwrap().needs_gradient());
}
