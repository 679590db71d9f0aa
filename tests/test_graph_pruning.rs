use proptest::prelude::*;
use rtgraph::test_utils::FixedLatency;
use rtgraph::{prune_graph_to_terminals, Graph, NodeId};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

/// Build a graph from named nodes and `(from, to)` edges between them
fn build(names: &[&str], edges: &[(&str, &str)]) -> (Graph, HashMap<String, NodeId>) {
    let mut graph = Graph::new();
    let ids: HashMap<String, NodeId> = names
        .iter()
        .map(|&n| (n.to_string(), graph.add_node_for_processable(Arc::new(FixedLatency::new(n, 0)))))
        .collect();
    for (from, to) in edges {
        graph.connect(ids[*from], ids[*to]).unwrap();
    }
    graph.finalize_nodes();
    (graph, ids)
}

fn names(graph: &Graph) -> HashSet<String> {
    graph.nodes().nodes().iter().map(|n| n.name()).collect()
}

#[test]
fn test_linear_chain_keeps_all_nodes() {
    let (mut graph, ids) = build(&["A", "B", "C", "D"], &[("A", "B"), ("B", "C"), ("C", "D")]);

    assert!(prune_graph_to_terminals(&mut graph, &[ids["D"]]));
    assert_eq!(graph.len(), 4);
    assert!(graph.is_valid());
}

#[test]
fn test_branch_pruned_to_side_terminal() {
    let (mut graph, ids) = build(
        &["A", "B", "C", "D", "E"],
        &[("A", "B"), ("B", "C"), ("C", "D"), ("B", "E")],
    );

    assert!(prune_graph_to_terminals(&mut graph, &[ids["E"]]));
    assert_eq!(graph.len(), 3);
    assert_eq!(
        names(&graph),
        ["A", "B", "E"].iter().map(|s| s.to_string()).collect()
    );

    let terminals: Vec<NodeId> = graph.nodes().terminal_nodes().map(|n| n.id()).collect();
    assert_eq!(terminals, vec![ids["E"]]);
    assert!(graph.is_valid(), "edges to removed nodes must be gone on both sides");

    // B lost its edge to C
    let b = graph.nodes().node_by_id(ids["B"]).unwrap();
    assert_eq!(b.feeds().len(), 1);
}

#[test]
fn test_empty_terminal_set_is_not_an_error() {
    let (mut graph, _) = build(&["A", "B"], &[("A", "B")]);

    assert!(!prune_graph_to_terminals(&mut graph, &[]));
    assert_eq!(graph.len(), 2);
}

#[test]
fn test_pruning_reports_true_when_nothing_removed() {
    let (mut graph, ids) = build(&["A", "B"], &[("A", "B")]);

    assert!(prune_graph_to_terminals(&mut graph, &[ids["B"]]));
    assert_eq!(graph.len(), 2);
}

#[test]
fn test_node_ids_survive_pruning() {
    let (mut graph, ids) = build(&["X", "A", "Y", "B"], &[("A", "B")]);

    prune_graph_to_terminals(&mut graph, &[ids["B"]]);
    assert_eq!(graph.len(), 2);
    assert_eq!(graph.nodes().node_by_id(ids["A"]).unwrap().name(), "A");
    assert_eq!(graph.nodes().node_by_id(ids["B"]).unwrap().name(), "B");
    assert!(graph.nodes().node_by_id(ids["X"]).is_none());
}

#[test]
fn test_latency_is_recomputed_after_pruning() {
    let mut graph = Graph::new();
    let src = graph.add_node_for_processable(Arc::new(FixedLatency::new("src", 0)));
    let slow = graph.add_node_for_processable(Arc::new(FixedLatency::new("slow", 500)));
    let fast = graph.add_node_for_processable(Arc::new(FixedLatency::new("fast", 10)));
    graph.connect(src, slow).unwrap();
    graph.connect(src, fast).unwrap();
    graph.finalize_nodes();
    assert_eq!(graph.nodes().max_route_playback_latency(), 500);

    prune_graph_to_terminals(&mut graph, &[fast]);
    assert_eq!(graph.nodes().max_route_playback_latency(), 10);
}

#[test]
fn test_update_latencies_is_idempotent() {
    let mut graph = Graph::new();
    let a = graph.add_node_for_processable(Arc::new(FixedLatency::new("a", 7)));
    let b = graph.add_node_for_processable(Arc::new(FixedLatency::new("b", 5)));
    graph.connect(a, b).unwrap();
    graph.finalize_nodes();

    let nodes = graph.steal_nodes();
    nodes.update_latencies();
    let first = nodes.max_route_playback_latency();
    nodes.update_latencies();
    assert_eq!(first, 12);
    assert_eq!(nodes.max_route_playback_latency(), first);
}

/// Random DAG: edges only go from lower to higher index
fn dag_strategy() -> impl Strategy<Value = (usize, Vec<(usize, usize)>, Vec<u32>)> {
    (1usize..14).prop_flat_map(|n| {
        let edges = proptest::collection::vec((0..n, 0..n), 0..n * 2).prop_map(|pairs| {
            let mut seen = HashSet::new();
            pairs
                .into_iter()
                .filter(|(a, b)| a != b)
                .map(|(a, b)| (a.min(b), a.max(b)))
                .filter(|e| seen.insert(*e))
                .collect::<Vec<_>>()
        });
        let latencies = proptest::collection::vec(0u32..100, n);
        (Just(n), edges, latencies)
    })
}

fn build_indexed(n: usize, edges: &[(usize, usize)], latencies: &[u32]) -> (Graph, Vec<NodeId>) {
    let mut graph = Graph::new();
    let ids: Vec<NodeId> = (0..n)
        .map(|i| graph.add_node_for_processable(Arc::new(FixedLatency::new(format!("n{}", i), latencies[i]))))
        .collect();
    for &(a, b) in edges {
        graph.connect(ids[a], ids[b]).unwrap();
    }
    graph.finalize_nodes();
    (graph, ids)
}

proptest! {
    #[test]
    fn test_pruning_is_sound_and_complete(
        (n, edges, latencies) in dag_strategy(),
        picks in proptest::collection::vec(any::<prop::sample::Index>(), 1..4),
    ) {
        let (mut graph, ids) = build_indexed(n, &edges, &latencies);
        let terminal_idx: HashSet<usize> = picks.iter().map(|p| p.index(n)).collect();
        let terminals: Vec<NodeId> = terminal_idx.iter().map(|&i| ids[i]).collect();

        // Backward reachability on the unpruned edges
        let mut expected: HashSet<NodeId> = HashSet::new();
        let mut queue: VecDeque<usize> = terminal_idx.iter().copied().collect();
        while let Some(i) = queue.pop_front() {
            if expected.insert(ids[i]) {
                queue.extend(edges.iter().filter(|(_, b)| *b == i).map(|(a, _)| *a));
            }
        }

        prop_assert!(prune_graph_to_terminals(&mut graph, &terminals));
        prop_assert!(graph.is_valid());

        let remaining: HashSet<NodeId> = graph.nodes().nodes().iter().map(|n| n.id()).collect();
        prop_assert_eq!(&remaining, &expected);

        // Every remaining node still reaches a terminal inside the pruned graph
        let collection = graph.nodes();
        let wanted: HashSet<NodeId> = terminals.iter().copied().collect();
        for start in 0..collection.len() {
            let mut stack = vec![start];
            let mut seen = vec![false; collection.len()];
            let mut found = false;
            while let Some(i) = stack.pop() {
                if seen[i] {
                    continue;
                }
                seen[i] = true;
                if wanted.contains(&collection.node(i).id()) {
                    found = true;
                    break;
                }
                stack.extend_from_slice(collection.node(i).feeds());
            }
            prop_assert!(found, "node {} has no path to a terminal", collection.node(start).id());
        }
    }

    #[test]
    fn test_max_route_latency_is_longest_path(
        (n, edges, latencies) in dag_strategy(),
    ) {
        let (graph, _) = build_indexed(n, &edges, &latencies);

        // Edges go from low to high index, so a reverse sweep sees feeds first
        let mut route = vec![0u32; n];
        for i in (0..n).rev() {
            let downstream = edges
                .iter()
                .filter(|(a, _)| *a == i)
                .map(|(_, b)| route[*b])
                .max()
                .unwrap_or(0);
            route[i] = latencies[i] + downstream;
        }
        let expected = route.iter().copied().max().unwrap_or(0);

        prop_assert_eq!(graph.nodes().max_route_playback_latency(), expected);
        for (i, node) in graph.nodes().nodes().iter().enumerate() {
            prop_assert_eq!(node.route_playback_latency(), route[i]);
        }
    }
}
