use crate::network_tests::{build_accumulator, feed_accumulator};
use compnet::network::StepDirection;
use compnet::{NetworkConfig, NetworkError};

pub fn test_topology_export(config: NetworkConfig) {
    let mut acc = build_accumulator(config);
    acc.network.compile().unwrap();
    let network = &acc.network;

    let topology = network.export_topology();
    assert_eq!(topology.nodes.len(), 6);
    assert_eq!(topology.roots, vec!["loss".to_string()]);
    assert_eq!(topology.loops.len(), 1);
    assert_eq!(topology.loops[0].anchor, "h_prev");
    assert_eq!(topology.loops[0].direction, StepDirection::Forward);
    let delayed: Vec<_> = topology.edges.iter().filter(|x| x.delayed).collect();
    assert_eq!(delayed.len(), 1);
    assert_eq!((delayed[0].from, delayed[0].to), (acc.h, acc.h_prev));

    let json: serde_json::Value =
        serde_json::from_str(&network.export_topology_json().unwrap()).unwrap();
    assert_eq!(json["nodes"].as_array().unwrap().len(), 6);
    assert_eq!(json["loops"][0]["members"].as_array().unwrap().len(), 2);

    let dot = network.export_topology_dot();
    assert!(dot.starts_with("digraph network {"));
    assert!(dot.contains("subgraph cluster_loop0"));
    assert!(dot.contains("[style=dashed]"));
}

pub fn test_dump_nodes_to_file(config: NetworkConfig) {
    let mut acc = build_accumulator(config);
    acc.network.compile().unwrap();
    acc.network.allocate_buffers(&[acc.loss], &[], None).unwrap();
    feed_accumulator(&mut acc, 1.0);
    acc.network.forward(&[acc.loss]).unwrap();
    let network = &acc.network;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("w.txt");
    network.dump_nodes_to_file("w*", &path, true, true).unwrap();
    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text.contains("w = LearnableParameter()"));
    assert!(text.contains("wx = Times(w, x)"));
    assert!(text.contains("w: 1 x 1"));

    let path = dir.path().join("all.txt");
    network.dump_all_nodes_to_file(&path, false, true).unwrap();
    let text = std::fs::read_to_string(&path).unwrap();
    assert_eq!(text.lines().count(), network.num_nodes());
    assert!(text.contains("h = Plus(wx, h_prev)"));
    assert!(text.contains(" in loop0"));

    let info = network.dump_node_info(acc.loss, true, false).unwrap();
    assert_eq!(info, "loss: 1 x 1\n50.000000\n");

    let err = network
        .dump_nodes_to_file("nothing*", dir.path().join("none.txt"), true, true)
        .unwrap_err();
    assert!(matches!(err, NetworkError::UnknownNodeName(_)));

    assert!(network.describe_memory_sharing().starts_with("Memory sharing: "));
}
