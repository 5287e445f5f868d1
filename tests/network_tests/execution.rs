use crate::network_tests::{
    CountingObserver, build_accumulator, build_chain, build_recurrent_pair, feed_accumulator,
    test_eq,
};
use compnet::network::{BufferKey, ParameterInit};
use compnet::ops::{
    BinaryOperation, InputValueOperation, LearnableParameterOperation, SquareErrorOperation,
    TimesOperation, UnaryOperation,
};
use compnet::{ComputationNetwork, ErrorKind, MBLayout, NetworkConfig, NetworkError};
use ndarray::{Array2, array};

pub fn test_chain_forward_values(config: NetworkConfig) {
    let (mut network, [x, y, z]) = build_chain(config);
    network.compile().unwrap();
    network.allocate_buffers(&[z], &[], None).unwrap();
    network.set_mb_layout(MBLayout::from_sequence_lengths(&[1, 1, 1]).unwrap());
    let input = array![[0.5, -1.0, 2.0], [0.0, 0.25, -0.75]];
    network.set_input_value(x, input.clone()).unwrap();
    network.forward(&[z]).unwrap();

    let expected_y = input.mapv(f32::tanh);
    test_eq(network.value(y).unwrap(), &expected_y, 1e-6, 1e-5);
    test_eq(
        network.value(z).unwrap(),
        &array![[expected_y.sum()]],
        1e-5,
        1e-5,
    );
    assert_eq!(network.value(network.node_id("z").unwrap()).unwrap().dim(), (1, 1));
}

pub fn test_accumulator_forward_values(config: NetworkConfig) {
    let mut acc = build_accumulator(config);
    acc.network.compile().unwrap();
    acc.network.allocate_buffers(&[acc.loss], &[], None).unwrap();
    feed_accumulator(&mut acc, 2.0);
    acc.network.forward(&[acc.loss]).unwrap();

    let network = &acc.network;
    // The gap column of the input is masked on the way in.
    test_eq(
        network.value(acc.x).unwrap(),
        &array![[1.0, 10.0, 2.0, 20.0, 3.0, 0.0]],
        1e-6,
        0.0,
    );
    test_eq(
        network.value(acc.h).unwrap(),
        &array![[2.0, 20.0, 6.0, 60.0, 12.0, 0.0]],
        1e-5,
        1e-6,
    );
    test_eq(network.value(acc.loss).unwrap(), &array![[100.0]], 1e-4, 1e-6);
}

pub fn test_recurrent_pair_steps_each_member(config: NetworkConfig) {
    let share_buffers = config.share_buffers;
    let (mut network, [x, p, q, d]) = build_recurrent_pair(config);
    network.compile().unwrap();
    network.allocate_buffers(&[], &[], None).unwrap();
    network.set_mb_layout(MBLayout::from_sequence_lengths(&[5]).unwrap());
    let input = Array2::from_shape_fn((2, 5), |(r, t)| 0.1 * (r + 1) as f32 * t as f32 - 0.2);
    network.set_input_value(x, input.clone()).unwrap();

    let mut observer = CountingObserver::default();
    network.forward_with_observer(&[], &mut observer).unwrap();
    for name in ["p", "q", "d"] {
        assert_eq!(observer.forward_count(name), 5, "{name}");
    }
    assert_eq!(observer.forward_count("x"), 0);
    // `d` is only read by `p` within the same step, so with sharing it never
    // gets a full value and is reported once per step instead.
    let reported = |name: &str| observer.assigned.iter().filter(|x| *x == name).count();
    assert_eq!(reported("p"), 1);
    assert_eq!(reported("q"), 1);
    assert_eq!(reported("d"), if share_buffers { 5 } else { 1 });
    assert_eq!(network.is_step_only(d), share_buffers);

    let mut expected = Array2::<f32>::zeros((2, 5));
    for r in 0..2 {
        let mut previous = 0.0f32;
        for t in 0..5 {
            previous = (input[[r, t]] + previous).tanh();
            expected[[r, t]] = previous;
        }
    }
    test_eq(network.value(q).unwrap(), &expected, 1e-6, 1e-5);
    if share_buffers {
        assert!(network.value(d).is_err());
    } else {
        assert_eq!(network.value(d).unwrap()[[0, 0]], 0.0);
    }
    test_eq(
        &network.value(p).unwrap().mapv(f32::tanh),
        &expected,
        1e-6,
        1e-5,
    );

    // Nothing changed, so the loop is not stepped again.
    network.forward_with_observer(&[], &mut observer).unwrap();
    assert_eq!(observer.forward_count("p"), 5);

    network.set_input_value(x, input).unwrap();
    network.forward_with_observer(&[], &mut observer).unwrap();
    assert_eq!(observer.forward_count("p"), 10);
}

pub fn test_up_to_date_nodes_are_skipped(config: NetworkConfig) {
    let (mut network, [x, y, z]) = build_chain(config);
    network.compile().unwrap();
    network.allocate_buffers(&[z], &[], None).unwrap();
    network.set_mb_layout(MBLayout::from_sequence_lengths(&[1, 1]).unwrap());
    network.set_input_value(x, array![[1.0, 2.0], [3.0, 4.0]]).unwrap();

    let mut observer = CountingObserver::default();
    network.forward_with_observer(&[z], &mut observer).unwrap();
    network.forward_with_observer(&[z], &mut observer).unwrap();
    assert_eq!(observer.forward_count("y"), 1);
    assert_eq!(observer.forward_count("z"), 1);

    network.set_input_value(x, array![[0.0, 0.0], [0.0, 0.0]]).unwrap();
    network.forward_with_observer(&[z], &mut observer).unwrap();
    assert_eq!(observer.forward_count("y"), 2);
    assert_eq!(network.value(z).unwrap()[[0, 0]], 0.0);

    network.start_new_evaluation(&[]).unwrap();
    assert_eq!(network.node(y).unwrap().eval_time_stamp(), 0);
    network.forward_with_observer(&[z], &mut observer).unwrap();
    assert_eq!(observer.forward_count("y"), 3);
}

pub fn test_forward_from_to_recomputes_dependents(config: NetworkConfig) {
    let (mut network, [x, y, z]) = build_chain(config);
    network.compile().unwrap();
    network.allocate_buffers(&[z], &[], None).unwrap();
    network.set_mb_layout(MBLayout::from_sequence_lengths(&[1]).unwrap());
    network.set_input_value(x, array![[1.0], [2.0]]).unwrap();
    network.forward(&[z]).unwrap();

    let y_stamp = network.node(y).unwrap().eval_time_stamp();
    let z_stamp = network.node(z).unwrap().eval_time_stamp();
    network.forward_from_to(&[y], &[z]).unwrap();
    assert_eq!(network.node(y).unwrap().eval_time_stamp(), y_stamp);
    assert!(network.node(z).unwrap().eval_time_stamp() > z_stamp);
}

/// `z = tanh(x1) + tanh(x2)` beside `w = tanh(sigmoid(x1))`. With sharing, `w2`
/// takes over the buffer `b` left once `z` consumed it.
pub fn test_forward_from_to_recomputes_overwritten_inputs(config: NetworkConfig) {
    let share_buffers = config.share_buffers;
    let mut network = ComputationNetwork::new(config);
    let x1 = network
        .add_operation("x1", InputValueOperation::new(2), &[])
        .unwrap();
    let x2 = network
        .add_operation("x2", InputValueOperation::new(2), &[])
        .unwrap();
    let a = network.add_operation("a", UnaryOperation::tanh(), &[x1]).unwrap();
    let b = network.add_operation("b", UnaryOperation::tanh(), &[x2]).unwrap();
    let z = network.add_operation("z", BinaryOperation::plus(), &[a, b]).unwrap();
    let w2 = network
        .add_operation("w2", UnaryOperation::sigmoid(), &[x1])
        .unwrap();
    let w = network.add_operation("w", UnaryOperation::tanh(), &[w2]).unwrap();
    network.compile().unwrap();
    network.allocate_buffers(&[z, w], &[], None).unwrap();
    let pool = network.buffer_pool();
    let b_buffer = pool.assignment(&BufferKey::value(b)).unwrap();
    let w2_buffer = pool.assignment(&BufferKey::value(w2)).unwrap();
    assert_eq!(b_buffer == w2_buffer, share_buffers);

    network.set_mb_layout(MBLayout::from_sequence_lengths(&[1]).unwrap());
    let x2_value = array![[0.25], [0.5]];
    network.set_input_value(x1, array![[1.0], [-1.0]]).unwrap();
    network.set_input_value(x2, x2_value.clone()).unwrap();
    network.forward(&[z, w]).unwrap();

    let x1_value = array![[0.5], [2.0]];
    network.set_input_value(x1, x1_value.clone()).unwrap();
    network.forward_from_to(&[x1], &[z]).unwrap();
    test_eq(
        network.value(z).unwrap(),
        &(x1_value.mapv(f32::tanh) + x2_value.mapv(f32::tanh)),
        1e-6,
        1e-5,
    );

    network.forward(&[w]).unwrap();
    test_eq(
        network.value(w).unwrap(),
        &x1_value.mapv(|x| (1.0 / (1.0 + (-x).exp())).tanh()),
        1e-6,
        1e-5,
    );
}

pub fn test_accumulator_backward(config: NetworkConfig) {
    let mut acc = build_accumulator(config);
    acc.network.compile().unwrap();
    acc.network
        .allocate_buffers(&[acc.loss], &[], Some(acc.loss))
        .unwrap();
    feed_accumulator(&mut acc, 2.0);

    let mut observer = CountingObserver::default();
    let network = &mut acc.network;
    network.forward_with_observer(&[acc.loss], &mut observer).unwrap();
    network.backward_with_observer(acc.loss, &mut observer).unwrap();

    // d loss / d w = sum over every step of the running sum of x.
    test_eq(network.gradient(acc.w).unwrap(), &array![[50.0]], 1e-4, 1e-5);
    test_eq(
        network.gradient(network.node_id("wx").unwrap()).unwrap(),
        &array![[3.0, 2.0, 2.0, 1.0, 1.0, 0.0]],
        1e-5,
        1e-6,
    );
    assert_eq!(observer.backward_count("h"), 3);
    assert_eq!(observer.backward_count("h_prev"), 3);
    assert_eq!(observer.backward_count("loss"), 1);
    assert_eq!(observer.backward_count("x"), 0);
}

pub fn test_gradients_match_finite_differences(config: NetworkConfig) {
    let mut network = ComputationNetwork::new(config);
    let x = network
        .add_operation("x", InputValueOperation::new(2), &[])
        .unwrap();
    let target = network
        .add_operation("target", InputValueOperation::new(3), &[])
        .unwrap();
    let w = network
        .add_operation("w", LearnableParameterOperation::new(3, 2), &[])
        .unwrap();
    let b = network
        .add_operation("b", LearnableParameterOperation::new(3, 1), &[])
        .unwrap();
    let wx = network.add_operation("wx", TimesOperation::new(), &[w, x]).unwrap();
    let z = network.add_operation("z", BinaryOperation::plus(), &[wx, b]).unwrap();
    let a = network.add_operation("a", UnaryOperation::tanh(), &[z]).unwrap();
    let loss = network
        .add_operation("loss", SquareErrorOperation::new(), &[a, target])
        .unwrap();
    network.compile().unwrap();
    network
        .init_learnable_parameters(w, ParameterInit::Uniform { scale: 0.5 }, 1)
        .unwrap();
    network
        .init_learnable_parameters(b, ParameterInit::Uniform { scale: 0.5 }, 2)
        .unwrap();
    network.allocate_buffers(&[loss], &[], Some(loss)).unwrap();
    network.set_mb_layout(MBLayout::from_sequence_lengths(&[1, 1, 1, 1]).unwrap());
    network
        .set_input_value(
            x,
            Array2::from_shape_fn((2, 4), |(r, c)| ((r * 4 + c) as f32 * 0.7).sin()),
        )
        .unwrap();
    network
        .set_input_value(
            target,
            Array2::from_shape_fn((3, 4), |(r, c)| ((r + 2 * c) as f32 * 0.3).cos() * 0.5),
        )
        .unwrap();

    network.forward(&[loss]).unwrap();
    network.backward(loss).unwrap();
    let analytic_w = network.gradient(w).unwrap().clone();
    let analytic_b = network.gradient(b).unwrap().clone();

    let eps = 1e-2;
    for (parameter, analytic) in [(w, analytic_w), (b, analytic_b)] {
        let original = network.value(parameter).unwrap().clone();
        let mut numeric = Array2::<f32>::zeros(original.dim());
        for index in 0..original.len() {
            let (r, c) = (index / original.ncols(), index % original.ncols());
            let mut evaluate = |delta: f32| {
                let mut value = original.clone();
                value[[r, c]] += delta;
                network.set_parameter_value(parameter, value).unwrap();
                network.forward(&[loss]).unwrap();
                network.value(loss).unwrap()[[0, 0]]
            };
            let plus = evaluate(eps);
            let minus = evaluate(-eps);
            numeric[[r, c]] = (plus - minus) / (2.0 * eps);
        }
        network.set_parameter_value(parameter, original).unwrap();
        test_eq(&analytic, &numeric, 2e-3, 2e-2);
    }
}

pub fn test_runtime_errors(config: NetworkConfig) {
    let (mut network, [x, y, z]) = build_chain(config);
    network.compile().unwrap();
    network.allocate_buffers(&[z], &[], Some(z)).unwrap();
    network.set_mb_layout(MBLayout::from_sequence_lengths(&[1, 1]).unwrap());

    let err = network.forward(&[z]).unwrap_err();
    assert!(matches!(err, NetworkError::EmptyInput(ref name) if name == "x"));
    assert_eq!(err.kind(), ErrorKind::Runtime);

    let err = network.set_input_value(x, Array2::zeros((3, 2))).unwrap_err();
    assert!(matches!(err, NetworkError::ShapeMismatch { .. }));
    assert_eq!(err.kind(), ErrorKind::Runtime);

    let err = network.set_input_value(y, Array2::zeros((2, 2))).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Logic);

    let err = network.backward(z).unwrap_err();
    assert!(matches!(err, NetworkError::ForwardNotDone(_)));

    // After a failed evaluation the network is still usable.
    network.set_input_value(x, Array2::ones((2, 2))).unwrap();
    network.forward(&[z]).unwrap();
    test_eq(
        network.value(z).unwrap(),
        &array![[4.0 * 1.0f32.tanh()]],
        1e-5,
        1e-5,
    );
    // Nothing here is trainable, so backward has nothing to do.
    network.backward(z).unwrap();
}

pub fn test_nan_in_live_column_reported(config: NetworkConfig) {
    let config = NetworkConfig {
        track_gap_nans: true,
        ..config
    };
    let (mut network, [x, _, z]) = build_chain(config);
    network.compile().unwrap();
    network.allocate_buffers(&[z], &[], None).unwrap();
    network.set_mb_layout(MBLayout::from_sequence_lengths(&[2, 1]).unwrap());

    // Column 3 is the gap of the shorter sequence, so its NaN is masked away.
    network
        .set_input_value(x, array![[1.0, 2.0, 3.0, f32::NAN], [0.0, 0.0, 0.0, 0.0]])
        .unwrap();
    network.forward(&[z]).unwrap();

    network
        .set_input_value(x, array![[1.0, f32::NAN, 3.0, 0.0], [0.0, 0.0, 0.0, 0.0]])
        .unwrap();
    let err = network.forward(&[z]).unwrap_err();
    assert!(matches!(
        err,
        NetworkError::NanInOutput { ref node, column: 1 } if node == "y"
    ));
    assert_eq!(err.kind(), ErrorKind::Runtime);
}

pub fn test_clones_evaluate_on_threads(config: NetworkConfig) {
    let mut acc = build_accumulator(config);
    acc.network.compile().unwrap();
    acc.network.allocate_buffers(&[acc.loss], &[], None).unwrap();
    feed_accumulator(&mut acc, 1.0);

    let handles: Vec<_> = (1..=4)
        .map(|i| {
            let mut network = acc.network.clone();
            let (w, loss) = (acc.w, acc.loss);
            std::thread::spawn(move || {
                network.set_parameter_value(w, array![[i as f32]]).unwrap();
                network.forward(&[loss]).unwrap();
                network.value(loss).unwrap()[[0, 0]]
            })
        })
        .collect();
    for (i, handle) in handles.into_iter().enumerate() {
        let loss = handle.join().unwrap();
        assert!((loss - 50.0 * (i + 1) as f32).abs() < 1e-3, "{loss}");
    }
}
