use anyhow::Context;
use compnet::network::ParameterInit;
use compnet::ops::{
    BinaryOperation, DelayOperation, InputValueOperation, LearnableParameterOperation,
    SquareErrorOperation, TimesOperation, UnaryOperation,
};
use compnet::{ComputationNetwork, MBLayout, NetworkConfig, NodeGroup};
use ndarray::Array2;

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config = match std::env::args().nth(1) {
        Some(path) => NetworkConfig::from_file(path)?,
        None => NetworkConfig::default(),
    };
    let mut network = ComputationNetwork::new(config);

    // h[t] = tanh(W x[t] + R h[t-1] + b), y[t] = V h[t]
    let x = network.add_operation("features", InputValueOperation::new(2), &[])?;
    let target = network.add_operation("labels", InputValueOperation::new(1), &[])?;
    let w = network.add_operation("W", LearnableParameterOperation::new(3, 2), &[])?;
    let r = network.add_operation("R", LearnableParameterOperation::new(3, 3), &[])?;
    let b = network.add_operation("b", LearnableParameterOperation::new(3, 1), &[])?;
    let v = network.add_operation("V", LearnableParameterOperation::new(1, 3), &[])?;

    let wx = network.add_operation("Wx", TimesOperation::new(), &[w, x])?;
    let wxb = network.add_operation("Wx_b", BinaryOperation::plus(), &[wx, b])?;
    let h = network.add_operation("h", UnaryOperation::tanh(), &[])?;
    let h_prev = network.add_operation("h_prev", DelayOperation::past_value(3, 1), &[h])?;
    let rh = network.add_operation("Rh", TimesOperation::new(), &[r, h_prev])?;
    let pre = network.add_operation("pre", BinaryOperation::plus(), &[wxb, rh])?;
    network.attach_inputs(h, &[pre])?;
    let y = network.add_operation("y", TimesOperation::new(), &[v, h])?;
    let loss = network.add_operation("loss", SquareErrorOperation::new(), &[y, target])?;

    network.add_to_group(x, NodeGroup::Input)?;
    network.add_to_group(target, NodeGroup::Target)?;
    network.add_to_group(loss, NodeGroup::Loss)?;
    network.add_to_group(y, NodeGroup::Output)?;

    network.compile().context("compiling demo network")?;
    for (seed, parameter) in [w, r, b, v].into_iter().enumerate() {
        network.init_learnable_parameters(parameter, ParameterInit::Uniform { scale: 0.5 }, seed as u64)?;
    }
    network.allocate_buffers(&[loss], &[y], Some(loss))?;

    let mb_layout = MBLayout::from_sequence_lengths(&[5, 3])?;
    let num_cols = mb_layout.num_cols();
    network.set_mb_layout(mb_layout);
    network.set_input_value(
        x,
        Array2::from_shape_fn((2, num_cols), |(i, j)| ((i + j) as f32 * 0.3).sin()),
    )?;
    network.set_input_value(
        target,
        Array2::from_shape_fn((1, num_cols), |(_, j)| (j as f32 * 0.2).cos()),
    )?;

    network.start_new_evaluation(&[loss])?;
    network.forward(&[loss])?;
    network.backward(loss)?;

    println!("loss = {:.6}", network.value(loss)?[[0, 0]]);
    for parameter in [w, r, b, v] {
        let gradient = network.gradient(parameter)?;
        let norm = gradient.iter().map(|x| x * x).sum::<f32>().sqrt();
        println!("|d loss / d {}| = {norm:.6}", network.node(parameter)?.name());
    }
    println!("{}", network.describe_memory_sharing());
    println!("{}", network.export_topology_dot());
    Ok(())
}
