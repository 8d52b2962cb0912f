use std::time::Duration;

use memplan::{
    error::Result,
    model::{Graph, GraphMode, Normalized, NodeId, OpKind},
    scheduler::{
        BottleneckSearch, BruteForceSolver, Deadline, OrderingModel, OrderingSolver, ScheduleOutcome,
        ScheduleRequest, Scheduler, SchedulerOptions, SolveStatus,
    },
    simulator::Simulator,
};
use rand::prelude::*;

fn options() -> SchedulerOptions {
    SchedulerOptions::new()
        .set_timeout(Duration::from_secs(20))
        .set_rel_stop(0.0)
        .set_max_packing_iterations(200)
}

/// n0 -> n1 -> n2, each handing a 100-byte tensor to the next
fn linear_chain() -> Result<Graph<Normalized>> {
    let mut g = Graph::new("chain", GraphMode::Inference);
    let nodes = (0..3)
        .map(|i| g.add_node(format!("n{}", i), OpKind::Compute, Some(0.001)))
        .collect::<Result<Vec<_>>>()?;
    g.add_edge(nodes[0], &[nodes[1]], 100, "t0")?;
    g.add_edge(nodes[1], &[nodes[2]], 100, "t1")?;
    g.add_edge(nodes[2], &[], 100, "t2")?;
    g.into_normalized()
}

/// Two branches with a 1000-byte intermediate each, joined at the end.
/// Nodes are declared so that the plain topological order runs both
/// branch heads first.
fn two_branches() -> Result<Graph<Normalized>> {
    let mut g = Graph::new("branches", GraphMode::Inference);
    let a1 = g.add_node("a1", OpKind::Compute, Some(0.001))?;
    let b1 = g.add_node("b1", OpKind::Compute, Some(0.001))?;
    let a2 = g.add_node("a2", OpKind::Compute, Some(0.001))?;
    let b2 = g.add_node("b2", OpKind::Compute, Some(0.001))?;
    let join = g.add_node("join", OpKind::Compute, Some(0.001))?;
    g.add_edge(a1, &[a2], 1000, "a_big")?;
    g.add_edge(b1, &[b2], 1000, "b_big")?;
    g.add_edge(a2, &[join], 10, "a_small")?;
    g.add_edge(b2, &[join], 10, "b_small")?;
    g.into_normalized()
}

/// Activation `h` is produced first and read again by the last node.
/// The only order peaks at 200 bytes.
fn activation_reuse() -> Result<Graph<Normalized>> {
    let mut g = Graph::new("reuse", GraphMode::Inference);
    let f1 = g.add_node("f1", OpKind::Compute, Some(0.001))?;
    let f2 = g.add_node("f2", OpKind::Compute, Some(0.001))?;
    let f3 = g.add_node("f3", OpKind::Compute, Some(0.001))?;
    let b2 = g.add_node("b2", OpKind::Compute, Some(0.001))?;
    let b1 = g.add_node("b1", OpKind::Compute, Some(0.001))?;
    g.add_edge(f1, &[f2, b1], 100, "h")?;
    g.add_edge(f2, &[f3], 20, "y")?;
    g.add_edge(f3, &[b2], 100, "z")?;
    g.add_edge(b2, &[b1], 10, "dy")?;
    g.add_edge(b1, &[], 1, "dx")?;
    g.into_normalized()
}

/// `activation_reuse` where f1 also reads a 10-byte graph input `x`.
/// Recomputing `h` needs `x`, which the plain order frees right after f1.
fn activation_reuse_with_input() -> Result<Graph<Normalized>> {
    let mut g = Graph::new("reuse_input", GraphMode::Inference);
    let x = g.add_node("x", OpKind::Input, None)?;
    let f1 = g.add_node("f1", OpKind::Compute, Some(0.001))?;
    let f2 = g.add_node("f2", OpKind::Compute, Some(0.001))?;
    let f3 = g.add_node("f3", OpKind::Compute, Some(0.001))?;
    let b2 = g.add_node("b2", OpKind::Compute, Some(0.001))?;
    let b1 = g.add_node("b1", OpKind::Compute, Some(0.001))?;
    g.add_edge(x, &[f1], 10, "x")?;
    g.add_edge(f1, &[f2, b1], 100, "h")?;
    g.add_edge(f2, &[f3], 20, "y")?;
    g.add_edge(f3, &[b2], 100, "z")?;
    g.add_edge(b2, &[b1], 10, "dy")?;
    g.add_edge(b1, &[], 1, "dx")?;
    g.into_normalized()
}

fn random_dag(seed: u64, n: usize) -> Graph<Normalized> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut g = Graph::new(format!("random_{}", seed), GraphMode::Inference);
    let nodes: Vec<NodeId> = (0..n)
        .map(|i| g.add_node(format!("v{}", i), OpKind::Compute, Some(0.001)).unwrap())
        .collect();
    for i in 0..n - 1 {
        for k in 0..rng.gen_range(1..=2) {
            let mut sinks: Vec<NodeId> = (0..rng.gen_range(1..=2))
                .map(|_| nodes[rng.gen_range(i + 1..n)])
                .collect();
            sinks.sort();
            sinks.dedup();
            g.add_edge(nodes[i], &sinks, rng.gen_range(1..100), format!("t{}_{}", i, k))
                .unwrap();
        }
    }
    g.into_normalized().unwrap()
}

fn scheduled(outcome: ScheduleOutcome) -> memplan::scheduler::ScheduleResult {
    match outcome {
        ScheduleOutcome::Scheduled(result) => result,
        ScheduleOutcome::Infeasible(reason) => panic!("unexpected infeasibility: {:?}", reason),
    }
}

#[test]
fn test_linear_chain_peak() -> Result<()> {
    let g = linear_chain()?;
    let scheduler = Scheduler::new(&g, options())?;
    let result = scheduled(scheduler.compute_optimal_schedule(&ScheduleRequest::new())?);
    assert_eq!(result.summary.peak_mem_usage, 100);
    assert_eq!(result.summary.required_memory, 100);
    assert_eq!(result.summary.status, SolveStatus::Optimal);
    assert_eq!(result.summary.address_extent, 100);
    Ok(())
}

#[test]
fn test_branches_are_not_overlapped() -> Result<()> {
    let g = two_branches()?;
    let kahn = g.topological_order()?;
    assert_eq!(Simulator::new(&g).simulate(&kahn)?.peak_mem_usage, 2000);

    let scheduler = Scheduler::new(&g, options())?;
    let result = scheduled(scheduler.compute_optimal_schedule(&ScheduleRequest::new())?);
    assert_eq!(result.summary.peak_mem_usage, 1010);
    assert_eq!(result.summary.total_data_swapped, 0);
    assert!(result.summary.gap <= 1e-9);

    let order = result.schedule.node_order();
    assert_eq!(Simulator::new(&g).simulate(&order)?.peak_mem_usage, 1010);
    Ok(())
}

#[test]
fn test_rematerialization_under_budget() -> Result<()> {
    let g = activation_reuse()?;
    let scheduler = Scheduler::new(&g, options())?;
    let minimum = scheduler.compute_minimum_memory_required()?;
    assert_eq!(minimum.no_mitigation, 200);
    assert!(minimum.rematerialization < 150);

    let request = ScheduleRequest::new().allow_rematerialization(true).mem_limit(150);
    let result = scheduled(scheduler.compute_optimal_schedule(&request)?);
    assert!(result.summary.rematerialization_time > 0.0);
    assert_eq!(result.summary.peak_mem_usage, 150);
    assert!(result.summary.max_live_bytes <= 150);
    assert_eq!(result.summary.recomputed_nodes, result.schedule.recomputed_nodes().len());
    assert_eq!(result.summary.total_data_swapped, 0);
    Ok(())
}

#[test]
fn test_spilling_under_budget() -> Result<()> {
    let g = activation_reuse()?;
    let scheduler = Scheduler::new(&g, options())?;
    let request = ScheduleRequest::new().allow_swaps(true).mem_limit(150);
    let result = scheduled(scheduler.compute_optimal_schedule(&request)?);
    assert_eq!(result.summary.spills, 1);
    assert_eq!(result.summary.total_data_swapped, 200);
    assert!((result.summary.spill_time - 200.0 / 16e9).abs() < 1e-15);
    assert_eq!(result.summary.rematerialization_time, 0.0);
    assert!(result.summary.max_live_bytes <= 150);
    Ok(())
}

#[test]
fn test_combined_mitigations_pick_the_cheaper_action() -> Result<()> {
    let g = activation_reuse()?;
    let scheduler = Scheduler::new(&g, options())?;
    let request = ScheduleRequest::new()
        .allow_swaps(true)
        .allow_rematerialization(true)
        .mem_limit(150);
    let result = scheduled(scheduler.compute_optimal_schedule(&request)?);
    // Moving 200 bytes is far cheaper than a millisecond of recompute.
    assert!(result.summary.runtime_overhead() < 0.001);
    assert_eq!(result.summary.spills, 1);
    Ok(())
}

#[test]
fn test_zero_spill_cap_is_infeasible() -> Result<()> {
    let g = activation_reuse()?;
    let scheduler = Scheduler::new(&g, options())?;
    let request = ScheduleRequest::new().allow_swaps(true).max_spills(0).mem_limit(150);
    match scheduler.compute_optimal_schedule(&request)? {
        ScheduleOutcome::Infeasible(reason) => {
            assert_eq!(reason.mem_limit, 150);
            assert_eq!(reason.minimum_memory, 200);
        }
        ScheduleOutcome::Scheduled(result) => {
            panic!("budget silently accepted: {:?}", result.summary)
        }
    }
    Ok(())
}

#[test]
fn test_budget_below_every_mitigation_is_infeasible() -> Result<()> {
    let g = activation_reuse()?;
    let scheduler = Scheduler::new(&g, options())?;
    // b1 alone holds 110 bytes of inputs.
    let request = ScheduleRequest::new()
        .allow_swaps(true)
        .allow_rematerialization(true)
        .mem_limit(100);
    let outcome = scheduler.compute_optimal_schedule(&request)?;
    assert!(!outcome.is_feasible());
    assert!(outcome.infeasibility().unwrap().minimum_memory >= 110);
    Ok(())
}

#[test]
fn test_generous_budget_needs_no_mitigation() -> Result<()> {
    let g = activation_reuse()?;
    let scheduler = Scheduler::new(&g, options())?;
    let request = ScheduleRequest::new().allow_rematerialization(true).mem_limit(1000);
    let result = scheduled(scheduler.compute_optimal_schedule(&request)?);
    assert!(result.schedule.is_plain());
    assert_eq!(result.summary.runtime_overhead(), 0.0);
    assert_eq!(result.summary.status, SolveStatus::Optimal);
    assert_eq!(result.summary.max_live_bytes, 200);
    Ok(())
}

#[test]
fn test_fragmentation_with_alignment() -> Result<()> {
    let mut g = Graph::new("aligned", GraphMode::Inference);
    let a = g.add_node("a", OpKind::Input, None)?;
    let b = g.add_node("b", OpKind::Input, None)?;
    let c = g.add_node("c", OpKind::Compute, Some(0.001))?;
    g.add_edge(a, &[c], 100, "x")?;
    g.add_edge(b, &[c], 100, "y")?;
    let g = g.into_normalized()?;

    let scheduler = Scheduler::new(&g, options().set_alignment(64))?;
    let order = g.resolve(&["a", "b", "c"])?;
    let request = ScheduleRequest::new()
        .account_for_fragmentation(true)
        .user_schedule(order.clone());
    let result = scheduled(scheduler.compute_optimal_schedule(&request)?);
    assert_eq!(result.schedule.node_order(), order);
    assert_eq!(result.summary.required_memory, 200);
    assert_eq!(result.summary.peak_mem_usage, 228);
    assert!((result.summary.fragmentation() - 0.14).abs() < 1e-9);
    assert!(result.addresses.allocations.iter().all(|a| a.offset % 64 == 0));
    Ok(())
}

#[test]
fn test_fragmentation_requires_a_user_schedule() -> Result<()> {
    let g = linear_chain()?;
    let scheduler = Scheduler::new(&g, options())?;
    let request = ScheduleRequest::new().account_for_fragmentation(true);
    assert!(scheduler.compute_optimal_schedule(&request).is_err());
    Ok(())
}

#[test]
fn test_search_matches_brute_force() -> Result<()> {
    let deadline = Deadline::after(Duration::from_secs(60));
    for seed in 0..12 {
        let g = random_dag(seed, 9);
        let model = OrderingModel::new(&g);
        let exact = BruteForceSolver::new().solve(&model, &deadline)?;
        let searched = BottleneckSearch::new().solve(&model, &deadline)?;
        assert_eq!(exact.status, SolveStatus::Optimal);
        assert_eq!(searched.peak, exact.peak, "seed {}", seed);
        assert_eq!(searched.status, SolveStatus::Optimal, "seed {}", seed);
        assert_eq!(model.evaluate(&searched.order)?, searched.peak);
    }
    Ok(())
}

#[test]
fn test_results_are_deterministic() -> Result<()> {
    let g = random_dag(99, 25);
    let first = Scheduler::new(&g, options().set_seed(7).set_thread_count(2))?;
    let second = Scheduler::new(&g, options().set_seed(7).set_thread_count(3))?;
    let a = scheduled(first.compute_optimal_schedule(&ScheduleRequest::new())?);
    let b = scheduled(second.compute_optimal_schedule(&ScheduleRequest::new())?);
    assert_eq!(a.schedule, b.schedule);
    assert_eq!(a.addresses, b.addresses);
    assert_eq!(a.summary.peak_mem_usage, b.summary.peak_mem_usage);
    Ok(())
}

#[test]
fn test_summary_serializes() -> anyhow::Result<()> {
    let g = two_branches()?;
    let scheduler = Scheduler::new(&g, options())?;
    let result = scheduled(scheduler.compute_optimal_schedule(&ScheduleRequest::new())?);
    let json = serde_json::to_string(&result.summary)?;
    assert!(json.contains("\"peak_mem_usage\":1010"));
    Ok(())
}

#[test]
fn test_rematerialization_keeps_recompute_inputs() -> Result<()> {
    let g = activation_reuse_with_input()?;
    let scheduler = Scheduler::new(&g, options())?;
    let minimum = scheduler.compute_minimum_memory_required()?;
    assert_eq!(minimum.no_mitigation, 200);
    assert!(minimum.rematerialization <= 130);

    let request = ScheduleRequest::new().allow_rematerialization(true).mem_limit(150);
    let result = scheduled(scheduler.compute_optimal_schedule(&request)?);
    let f1 = g.node_id("f1").unwrap();
    assert_eq!(result.schedule.recomputed_nodes(), vec![f1]);
    assert!(result.summary.max_live_bytes <= 150);
    assert_eq!(result.summary.total_data_swapped, 0);
    Ok(())
}

/// Each reported minimum is reachable with its mitigations, one byte less
/// is not
fn assert_minimums_are_tight(g: &Graph<Normalized>) -> Result<()> {
    let scheduler = Scheduler::new(g, options())?;
    let minimum = scheduler.compute_minimum_memory_required()?;
    assert_ne!(minimum.status, SolveStatus::TimedOut, "{}", g.name());
    assert!(minimum.rematerialization.max(minimum.spilling) <= minimum.no_mitigation);

    let cases = [
        (minimum.no_mitigation, false, false),
        (minimum.rematerialization, true, false),
        (minimum.spilling, false, true),
        (minimum.combined, true, true),
    ];
    for (budget, rematerialize, spill) in cases {
        let request = |limit| {
            let mut request = ScheduleRequest::new().mem_limit(limit);
            if rematerialize {
                request = request.allow_rematerialization(true);
            }
            if spill {
                request = request.allow_swaps(true);
            }
            request
        };
        let context = format!("{} at {} bytes (remat {}, spill {})", g.name(), budget, rematerialize, spill);

        let result = scheduled(scheduler.compute_optimal_schedule(&request(budget))?);
        assert!(result.summary.max_live_bytes <= budget, "{}", context);
        assert_eq!(result.summary.peak_mem_usage, budget, "{}", context);

        if budget > 0 {
            let outcome = scheduler.compute_optimal_schedule(&request(budget - 1))?;
            assert_eq!(
                outcome.infeasibility().map(|reason| reason.minimum_memory),
                Some(budget),
                "{}",
                context
            );
        }
    }
    Ok(())
}

#[test]
fn test_minimum_memory_is_tight() -> Result<()> {
    assert_minimums_are_tight(&activation_reuse()?)?;
    assert_minimums_are_tight(&activation_reuse_with_input()?)?;
    for seed in 0..6 {
        assert_minimums_are_tight(&random_dag(seed, 12))?;
    }
    Ok(())
}

#[test]
fn test_address_extent_covers_required_memory() -> Result<()> {
    for seed in 0..8 {
        let g = random_dag(seed, 20);
        let scheduler = Scheduler::new(&g, options())?;
        let plain = scheduled(scheduler.compute_optimal_schedule(&ScheduleRequest::new())?);
        assert!(plain.summary.address_extent >= plain.summary.required_memory, "seed {}", seed);

        let request = ScheduleRequest::new()
            .account_for_fragmentation(true)
            .user_schedule(plain.schedule.node_order());
        let packed = scheduled(scheduler.compute_optimal_schedule(&request)?);
        let fragmentation = packed.summary.fragmentation();
        assert!((0.0..1.0).contains(&fragmentation), "seed {}: {}", seed, fragmentation);
        assert_eq!(packed.summary.address_extent, packed.summary.peak_mem_usage);
        assert!(packed.summary.address_extent >= packed.summary.required_memory, "seed {}", seed);
        assert_eq!(packed.summary.required_memory, plain.summary.required_memory);
    }
    Ok(())
}

#[test]
fn test_minimum_memory_honors_the_timeout() -> Result<()> {
    let g = random_dag(5, 60);
    let scheduler = Scheduler::new(&g, options().set_timeout(Duration::ZERO))?;
    let minimum = scheduler.compute_minimum_memory_required()?;
    assert_eq!(minimum.status, SolveStatus::TimedOut);
    // No bisection step runs, so every figure stays at the plain peak.
    assert_eq!(minimum.rematerialization, minimum.no_mitigation);
    assert_eq!(minimum.combined, minimum.no_mitigation);

    let request = ScheduleRequest::new()
        .allow_rematerialization(true)
        .allow_swaps(true)
        .mem_limit(minimum.combined);
    let result = scheduled(scheduler.compute_optimal_schedule(&request)?);
    assert_eq!(result.summary.status, SolveStatus::TimedOut);
    assert!(result.summary.max_live_bytes <= minimum.combined);
    Ok(())
}
