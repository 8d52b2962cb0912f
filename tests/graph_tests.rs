use memplan::{
    error::Result,
    memory::{AddressAssignment, BufferAllocation, BufferId},
    model::{EdgeId, Graph, GraphMode, Normalized, NodeId, OpKind, Raw},
    schedule::{replay, Schedule, ScheduleStep},
    simulator::{MemoryEventKind, Simulator},
    validation::{validate_address_allocation, validate_node_ordering, validate_timeline},
};
use rand::prelude::*;

// One training step: forward, loss, backward and an optimizer update
fn training_graph() -> Result<Graph<Raw>> {
    let mut g = Graph::new("training_step", GraphMode::Training);
    let x = g.add_node("x", OpKind::Input, None)?;
    let w = g.add_node("w", OpKind::Weight, None)?;
    let fwd = g.add_node("fwd", OpKind::Compute, Some(0.002))?;
    let aux = g.add_node("aux", OpKind::Compute, Some(0.001))?;
    let loss = g.add_node("loss", OpKind::Compute, Some(0.001))?;
    let bwd = g.add_node("bwd", OpKind::Compute, Some(0.004))?;
    let upd = g.add_node("upd", OpKind::WeightUpdate, Some(0.001))?;

    g.add_edge(x, &[fwd], 64, "x")?;
    g.add_edge(w, &[fwd, aux, upd], 32, "w")?;
    g.add_edge(fwd, &[loss, bwd], 128, "act")?;
    g.add_edge(aux, &[], 8, "aux_out")?;
    g.add_edge(loss, &[bwd], 16, "grad")?;
    g.add_edge(bwd, &[upd], 32, "dw")?;
    g.add_edge(upd, &[], 32, "w_new")?;
    Ok(g)
}

fn random_dag(seed: u64, n: usize) -> Graph<Normalized> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut g = Graph::new(format!("random_{}", seed), GraphMode::Inference);
    let nodes: Vec<NodeId> = (0..n)
        .map(|i| {
            let kind = if i == 0 { OpKind::Input } else { OpKind::Compute };
            g.add_node(format!("v{}", i), kind, Some(0.001)).unwrap()
        })
        .collect();
    for i in 0..n - 1 {
        for k in 0..rng.gen_range(1..=2) {
            let mut sinks: Vec<NodeId> = (0..rng.gen_range(1..=3))
                .map(|_| nodes[rng.gen_range(i + 1..n)])
                .collect();
            sinks.sort();
            sinks.dedup();
            g.add_edge(nodes[i], &sinks, rng.gen_range(1..200), format!("t{}_{}", i, k))
                .unwrap();
        }
    }
    g.into_normalized().unwrap()
}

#[test]
fn test_training_graph_normalization() -> Result<()> {
    let g = training_graph()?.normalize()?;
    assert!(g.is_valid(true));

    let output = g.node_id("output").expect("output node");
    assert_eq!(g.node(output).unwrap().kind, OpKind::Output);
    assert_eq!(g.predecessors(output).len(), 2);

    // aux reads the old weight value and is otherwise unordered with upd
    let aux = g.node_id("aux").unwrap();
    let upd = g.node_id("upd").unwrap();
    assert!(g.predecessors(upd).contains(&aux));

    let order = g.topological_order()?;
    let position = |n: NodeId| order.iter().position(|&m| m == n).unwrap();
    assert!(position(aux) < position(upd));
    Ok(())
}

#[test]
fn test_training_graph_requires_weight_updates() -> Result<()> {
    let mut g = Graph::new("no_updates", GraphMode::Training);
    let x = g.add_node("x", OpKind::Input, None)?;
    let f = g.add_node("f", OpKind::Compute, Some(0.001))?;
    g.add_edge(x, &[f], 4, "x")?;
    assert!(g.clone().normalize().is_err());

    // Sealing without the constraint passes does not look for updates.
    assert!(g.into_normalized().is_ok());
    Ok(())
}

#[test]
fn test_cycles_are_rejected() -> Result<()> {
    let mut g = Graph::new("cycle", GraphMode::Inference);
    let a = g.add_node("a", OpKind::Compute, None)?;
    let b = g.add_node("b", OpKind::Compute, None)?;
    g.add_edge(a, &[b], 4, "ab")?;
    g.add_edge(b, &[a], 4, "ba")?;
    assert!(!g.is_valid(false));
    assert!(g.into_normalized().is_err());
    Ok(())
}

#[test]
fn test_json_round_trip_through_file() -> anyhow::Result<()> {
    let g = training_graph()?.normalize()?;
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("training_step.json");
    g.save(&path)?;

    let loaded = Graph::<Raw>::load(&path)?.into_normalized()?;
    assert_eq!(loaded.num_nodes(), g.num_nodes());
    assert_eq!(loaded.num_edges(), g.num_edges());
    for node in g.nodes() {
        assert_eq!(loaded.node_id(&node.name), Some(node.id));
    }
    assert_eq!(loaded.to_json()?, g.to_json()?);
    Ok(())
}

#[test]
fn test_simulator_agrees_with_replay() -> Result<()> {
    for seed in 0..20 {
        let g = random_dag(seed, 12);
        let order = g.topological_order()?;
        let simulated = Simulator::new(&g).simulate(&order)?;
        let replayed = replay(&g, &Schedule::from_order(&g, &order)?)?;
        assert_eq!(simulated.peak_mem_usage, replayed.peak, "seed {}", seed);
        let per_step: Vec<u64> = simulated.mem_per_timestep.iter().map(|(_, m)| *m).collect();
        assert_eq!(per_step, replayed.usage, "seed {}", seed);
    }
    Ok(())
}

#[test]
fn test_memory_events_balance() -> Result<()> {
    let g = random_dag(42, 16);
    let order = g.topological_order()?;
    let events = Simulator::new(&g).memory_events(&order)?;
    let allocated: u64 = events
        .iter()
        .filter(|e| e.kind == MemoryEventKind::Allocate)
        .map(|e| e.size)
        .sum();
    let freed: u64 = events
        .iter()
        .filter(|e| e.kind == MemoryEventKind::Free)
        .map(|e| e.size)
        .sum();
    assert_eq!(allocated, freed);
    assert_eq!(allocated, g.total_edge_bytes());
    Ok(())
}

#[test]
fn test_simulator_rejects_invalid_orders() -> Result<()> {
    let g = training_graph()?.normalize()?;
    let mut order = g.topological_order()?;
    order.reverse();
    assert!(Simulator::new(&g).simulate(&order).is_err());
    assert!(Simulator::new(&g).simulate(&order[1..]).is_err());
    Ok(())
}

#[test]
fn test_relative_ordering_is_enforced() -> Result<()> {
    let mut g = Graph::new("independent", GraphMode::Inference);
    let names = ["p", "q", "r"];
    for name in names {
        let src = g.add_node(format!("{}_src", name), OpKind::Input, None)?;
        let node = g.add_node(name, OpKind::Compute, Some(0.001))?;
        g.add_edge(src, &[node], 10, format!("{}_in", name))?;
    }
    let g = g.into_normalized()?;
    let pinned = g.resolve(&["r", "p", "q"])?;

    let g = g.constrain_relative_ordering(&pinned, true)?;
    let order = g.topological_order()?;
    let positions: Vec<usize> = pinned
        .iter()
        .map(|n| order.iter().position(|m| m == n).unwrap())
        .collect();
    assert!(positions.windows(2).all(|w| w[0] < w[1]));

    let contradiction = g.resolve(&["q", "r"])?;
    assert!(g.constrain_relative_ordering(&contradiction, false).is_err());
    Ok(())
}

#[test]
fn test_validation_rejects_broken_schedules() -> Result<()> {
    let g = training_graph()?.normalize()?;
    let order = g.topological_order()?;
    let schedule = Schedule::from_order(&g, &order)?;
    validate_timeline(&g, &schedule)?;
    validate_node_ordering(&g, &schedule)?;

    // Spilling a buffer that was never produced
    let mut steps = schedule.steps().to_vec();
    steps.insert(0, ScheduleStep::SpillOut(EdgeId(0)));
    assert!(validate_timeline(&g, &Schedule::new(steps)).is_err());

    // Dropping the last node
    let truncated = Schedule::new(schedule.steps()[..order.len() - 1].to_vec());
    assert!(validate_node_ordering(&g, &truncated).is_err());
    Ok(())
}

#[test]
fn test_validation_rejects_overlapping_addresses() {
    let alloc = |edge: usize, offset: u64, start: usize, end: usize| BufferAllocation {
        buffer: BufferId { edge: EdgeId(edge), instance: 0 },
        offset,
        size: 64,
        start,
        end,
    };
    let disjoint = AddressAssignment {
        allocations: vec![alloc(0, 0, 0, 2), alloc(1, 0, 2, 4), alloc(2, 64, 1, 3)],
        alignment: 64,
    };
    assert!(validate_address_allocation(&disjoint).is_ok());

    let clash = AddressAssignment {
        allocations: vec![alloc(0, 0, 0, 2), alloc(1, 32, 1, 3)],
        alignment: 32,
    };
    assert!(validate_address_allocation(&clash).is_err());

    let misaligned = AddressAssignment {
        allocations: vec![alloc(0, 16, 0, 2)],
        alignment: 64,
    };
    assert!(validate_address_allocation(&misaligned).is_err());
}
