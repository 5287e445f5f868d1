use crate::network_tests::{build_accumulator, feed_accumulator, test_eq};
use compnet::network::{BufferKey, BufferPool, BufferPoolError, SizeClass};
use compnet::ops::{InputValueOperation, ReduceSumOperation, UnaryOperation};
use compnet::{ComputationNetwork, ErrorKind, MBLayout, NetworkConfig, NetworkError, NodeId, SampleLayout};
use ndarray::array;

/// x -> tanh -> sigmoid -> relu -> sum
fn build_stack(config: NetworkConfig) -> (ComputationNetwork, [NodeId; 5]) {
    let mut network = ComputationNetwork::new(config);
    let x = network
        .add_operation("x", InputValueOperation::new(2), &[])
        .unwrap();
    let a = network.add_operation("a", UnaryOperation::tanh(), &[x]).unwrap();
    let b = network.add_operation("b", UnaryOperation::sigmoid(), &[a]).unwrap();
    let c = network.add_operation("c", UnaryOperation::relu(), &[b]).unwrap();
    let d = network
        .add_operation("d", ReduceSumOperation::new(), &[c])
        .unwrap();
    network.compile().unwrap();
    network.set_mb_layout(MBLayout::from_sequence_lengths(&[1, 1]).unwrap());
    network
        .set_input_value(x, array![[0.5, -0.5], [1.0, 2.0]])
        .unwrap();
    (network, [x, a, b, c, d])
}

fn expected_stack_sum() -> f32 {
    [0.5f32, -0.5, 1.0, 2.0]
        .iter()
        .map(|x| 1.0 / (1.0 + (-x.tanh()).exp()))
        .sum()
}

pub fn test_pool_protocol_errors(config: NetworkConfig) {
    let mut pool = if config.audit_buffers {
        BufferPool::with_audit()
    } else {
        BufferPool::new()
    };
    let (network, [_, y, _]) = crate::network_tests::build_chain(config);
    let key = BufferKey::value(y);
    let class = SizeClass::of_layout(SampleLayout::Minibatch { rows: 2 });

    pool.request(key, class, true).unwrap();
    let err = pool.request(key, class, true).unwrap_err();
    assert_eq!(err, BufferPoolError::DoubleRequest(key));
    assert_eq!(NetworkError::from(err).kind(), ErrorKind::Logic);

    pool.release(key).unwrap();
    let err = pool.release(key).unwrap_err();
    assert_eq!(err, BufferPoolError::ReleaseWithoutRequest(key));
    assert_eq!(NetworkError::from(err).kind(), ErrorKind::Logic);

    // The failed calls left the pool consistent.
    assert_eq!(pool.num_held(), 0);
    assert!(pool.violations().is_empty());
    assert!(matches!(
        network.buffer_pool().assignment(&key),
        Err(BufferPoolError::NotAssigned(_))
    ));
}

pub fn test_disjoint_lifetimes_share_buffers(config: NetworkConfig) {
    let share_buffers = config.share_buffers;
    let (mut network, [_, a, _, c, d]) = build_stack(config);
    network.allocate_buffers(&[d], &[], None).unwrap();

    let pool = network.buffer_pool();
    assert_eq!(pool.assignments().len(), 4);
    let a_buffer = pool.assignment(&BufferKey::value(a)).unwrap();
    let c_buffer = pool.assignment(&BufferKey::value(c)).unwrap();
    if share_buffers {
        assert_eq!(pool.num_buffers(), 3);
        assert_eq!(a_buffer, c_buffer);
    } else {
        assert_eq!(pool.num_buffers(), 4);
        assert_ne!(a_buffer, c_buffer);
    }
    assert!(pool.violations().is_empty());

    network.forward(&[d]).unwrap();
    test_eq(
        network.value(d).unwrap(),
        &array![[expected_stack_sum()]],
        1e-5,
        1e-5,
    );
}

pub fn test_output_nodes_keep_their_buffers(config: NetworkConfig) {
    let (mut network, [_, a, b, _, d]) = build_stack(config);
    network.allocate_buffers(&[d], &[b], None).unwrap();
    let pool = network.buffer_pool();
    let b_buffer = pool.assignment(&BufferKey::value(b)).unwrap();
    assert!(!pool.is_shareable(b_buffer));
    assert_ne!(pool.assignment(&BufferKey::value(a)).unwrap(), b_buffer);

    network.forward(&[d, b]).unwrap();
    let expected = array![[0.5f32, -0.5], [1.0, 2.0]].mapv(|x| 1.0 / (1.0 + (-x.tanh()).exp()));
    test_eq(network.value(b).unwrap(), &expected, 1e-6, 1e-5);
}

pub fn test_training_plan_has_no_overlaps(config: NetworkConfig) {
    let mut acc = build_accumulator(config);
    acc.network.compile().unwrap();
    acc.network
        .allocate_buffers(&[acc.loss], &[], Some(acc.loss))
        .unwrap();
    feed_accumulator(&mut acc, 1.0);
    acc.network.forward(&[acc.loss]).unwrap();
    acc.network.backward(acc.loss).unwrap();

    let network = &acc.network;
    let pool = network.buffer_pool();
    assert!(pool.is_audited());
    assert!(pool.violations().is_empty(), "{:?}", pool.violations());
    // Learnable gradients are never shared.
    let w_gradient = pool.assignment(&BufferKey::gradient(acc.w)).unwrap();
    assert!(!pool.is_shareable(w_gradient));

    let loop_id = network.node(acc.h).unwrap().loop_id().unwrap();
    let step_pool = network.step_pool(loop_id).unwrap();
    // Two members, three steps.
    assert_eq!(step_pool.windows().len(), 6);
    assert!(step_pool.violations().is_empty());
    assert_eq!(step_pool.num_held(), 0);
}

pub fn test_reallocation_resets_pool(config: NetworkConfig) {
    let (mut network, [_, _, b, _, d]) = build_stack(config);
    network.allocate_buffers(&[d], &[], None).unwrap();
    let first = network.buffer_pool().assignments().len();
    network.allocate_buffers(&[d], &[b], None).unwrap();
    assert_eq!(network.buffer_pool().assignments().len(), first);
    assert!(network.are_buffers_allocated());

    // Structural edits throw the allocation away.
    network
        .add_operation("extra", UnaryOperation::tanh(), &[b])
        .unwrap();
    assert!(!network.are_buffers_allocated());
    assert!(network.buffer_pool().assignments().is_empty());
}

pub fn test_loop_internal_members_use_step_buffers(config: NetworkConfig) {
    let share_buffers = config.share_buffers;
    let mut acc = build_accumulator(config);
    acc.network.compile().unwrap();
    acc.network.allocate_buffers(&[acc.loss], &[], None).unwrap();

    // `h` feeds the delay and `loss`; `h_prev` is only read by `h` in the same step.
    assert!(!acc.network.is_step_only(acc.h));
    assert_eq!(acc.network.is_step_only(acc.h_prev), share_buffers);
    let pool = acc.network.buffer_pool();
    assert!(pool.assignment(&BufferKey::value(acc.h)).is_ok());
    let h_prev = pool.assignment(&BufferKey::value(acc.h_prev));
    if share_buffers {
        assert_eq!(
            h_prev,
            Err(BufferPoolError::NotAssigned(BufferKey::value(acc.h_prev)))
        );
        assert!(
            acc.network
                .describe_memory_sharing()
                .contains("one step at a time: h_prev")
        );
    } else {
        assert!(h_prev.is_ok());
    }

    feed_accumulator(&mut acc, 2.0);
    acc.network.forward(&[acc.loss]).unwrap();
    test_eq(
        acc.network.value(acc.h).unwrap(),
        &array![[2.0, 20.0, 6.0, 60.0, 12.0, 0.0]],
        1e-6,
        1e-6,
    );
    test_eq(acc.network.value(acc.loss).unwrap(), &array![[100.0]], 1e-5, 1e-6);
    let loop_id = acc.network.loops()[0].id();
    assert_eq!(acc.network.step_pool(loop_id).unwrap().num_held(), 0);
}
