//! Integration Tests for the Graph Engine
//!
//! These tests exercise the core contract: dependency activation, once-per-
//! event execution, topological ordering, cycle rejection, mutation
//! legality, side-effect ordering, and transient clearing.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use pretty_assertions::assert_eq;

use cascade_core::graph::{
    ExtentBuilder, Graph, GraphConfig, GraphError, PreAddWrites,
};

/// Route violations into a vector instead of panicking.
fn capture_violations(graph: &Graph) -> Arc<Mutex<Vec<GraphError>>> {
    let violations = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&violations);
    graph.set_violation_hook(move |error| sink.lock().unwrap().push(error.clone()));
    violations
}

#[test]
fn demanded_update_activates_behavior() {
    let graph = Graph::new();
    let mut builder = ExtentBuilder::new(&graph);
    let r_a = builder.state_eq(0i32);
    let r_b = builder.state_eq(0i32);

    let input = r_a.clone();
    let output = r_b.clone();
    builder
        .behavior()
        .supplies([r_b.resource()])
        .demands([r_a.link()])
        .runs(move |_graph| {
            output.update(2 * input.value());
        });

    let extent = builder.build();
    extent.add_to_graph_with_action();

    r_a.update_with_action(5, "test");

    assert_eq!(r_b.value(), 10);
    assert_eq!(r_b.event(), r_a.event());
}

#[test]
fn behavior_runs_once_per_event() {
    let graph = Graph::new();
    let mut builder = ExtentBuilder::new(&graph);
    let r_a = builder.state_eq(0i32);
    let r_b = builder.state_eq(0i32);
    let r_c = builder.state_eq(0i32);

    let runs = Arc::new(AtomicUsize::new(0));
    let runs_clone = Arc::clone(&runs);
    builder
        .behavior()
        .supplies([r_c.resource()])
        .demands([r_a.link(), r_b.link()])
        .runs(move |_graph| {
            runs_clone.fetch_add(1, Ordering::SeqCst);
        });

    let extent = builder.build();
    extent.add_to_graph_with_action();

    let (a, b) = (r_a.clone(), r_b.clone());
    graph.action_sync("update both", move || {
        a.update(1);
        b.update(2);
    });

    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[test]
fn behaviors_run_in_dependency_order() {
    let graph = Graph::new();
    let mut builder = ExtentBuilder::new(&graph);
    let r_a = builder.state_eq(0i32);
    let r_b = builder.state_eq(0i32);
    let r_c = builder.state_eq(0i32);

    let log = Arc::new(Mutex::new(Vec::new()));

    // Declared out of dependency order on purpose.
    let log_second = Arc::clone(&log);
    let (b_in, c_out) = (r_b.clone(), r_c.clone());
    builder
        .behavior()
        .supplies([r_c.resource()])
        .demands([r_b.link()])
        .runs(move |_graph| {
            log_second.lock().unwrap().push("second");
            c_out.update(b_in.value() + 1);
        });

    let log_first = Arc::clone(&log);
    let (a_in, b_out) = (r_a.clone(), r_b.clone());
    builder
        .behavior()
        .supplies([r_b.resource()])
        .demands([r_a.link()])
        .runs(move |_graph| {
            log_first.lock().unwrap().push("first");
            b_out.update(a_in.value() + 1);
        });

    let extent = builder.build();
    extent.add_to_graph_with_action();

    r_a.update_with_action(1, "test");

    assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
    assert_eq!(r_c.value(), 3);
}

#[test]
fn dependency_cycles_are_rejected() {
    let graph = Graph::new();
    let violations = capture_violations(&graph);

    let mut builder = ExtentBuilder::new(&graph);
    let r_a = builder.state_eq(0i32);
    let r_b = builder.state_eq(0i32);

    builder
        .behavior()
        .supplies([r_a.resource()])
        .demands([r_b.link()])
        .runs(|_graph| {});
    builder
        .behavior()
        .supplies([r_b.resource()])
        .demands([r_a.link()])
        .runs(|_graph| {});

    let extent = builder.build();
    extent.add_to_graph_with_action();

    assert!(violations
        .lock()
        .unwrap()
        .iter()
        .any(|error| matches!(error, GraphError::DependencyCycle { .. })));
}

#[test]
fn resource_accepts_only_one_static_supplier() {
    let graph = Graph::new();
    let violations = capture_violations(&graph);

    let mut builder = ExtentBuilder::new(&graph);
    let r_a = builder.state_eq(0i32);

    builder
        .behavior()
        .supplies([r_a.resource()])
        .runs(|_graph| {});
    builder
        .behavior()
        .supplies([r_a.resource()])
        .runs(|_graph| {});

    assert!(violations
        .lock()
        .unwrap()
        .iter()
        .any(|error| matches!(error, GraphError::DoubleSupply { .. })));
}

#[test]
fn dynamic_supply_of_taken_resource_is_rejected() {
    let graph = Graph::new();
    let violations = capture_violations(&graph);

    let mut builder = ExtentBuilder::new(&graph);
    let r_a = builder.state_eq(0i32);

    builder
        .behavior()
        .supplies([r_a.resource()])
        .runs(|_graph| {});
    let free = builder.behavior().runs(|_graph| {});

    let extent = builder.build();
    extent.add_to_graph_with_action();
    assert!(violations.lock().unwrap().is_empty());

    let supply = r_a.resource();
    graph.action_sync("steal supply", move || {
        free.set_dynamic_supplies([supply]);
    });

    assert!(violations
        .lock()
        .unwrap()
        .iter()
        .any(|error| matches!(error, GraphError::DoubleSupply { .. })));
}

#[test]
fn update_outside_event_is_rejected() {
    let graph = Graph::new();
    let violations = capture_violations(&graph);

    let mut builder = ExtentBuilder::new(&graph);
    let r_a = builder.state_eq(0i32);
    let extent = builder.build();
    extent.add_to_graph_with_action();

    r_a.update(5);

    assert_eq!(
        violations.lock().unwrap().as_slice(),
        &[GraphError::UpdateOutsideEvent { resource: r_a.id() }]
    );
    assert_eq!(r_a.value(), 0);
}

#[test]
fn supplied_resource_rejects_foreign_writers() {
    let graph = Graph::new();
    let violations = capture_violations(&graph);

    let mut builder = ExtentBuilder::new(&graph);
    let r_a = builder.state_eq(0i32);
    builder
        .behavior()
        .supplies([r_a.resource()])
        .runs(|_graph| {});
    let extent = builder.build();
    extent.add_to_graph_with_action();

    let writer = r_a.clone();
    graph.action_sync("illegal write", move || {
        writer.update(9);
    });

    assert!(violations
        .lock()
        .unwrap()
        .iter()
        .any(|error| matches!(error, GraphError::WrongSupplier { .. })));
    assert_eq!(r_a.value(), 0);
}

#[test]
fn unsupplied_resource_rejects_behavior_writers() {
    let graph = Graph::new();
    let violations = capture_violations(&graph);

    let mut builder = ExtentBuilder::new(&graph);
    let added = builder.added();
    let r_a = builder.state_eq(0i32);

    let writer = r_a.clone();
    builder
        .behavior()
        .demands([added.link()])
        .runs(move |_graph| {
            writer.update(9);
        });
    let extent = builder.build();
    extent.add_to_graph_with_action();

    assert!(violations
        .lock()
        .unwrap()
        .iter()
        .any(|error| matches!(error, GraphError::UpdateOutsideAction { .. })));
    assert_eq!(r_a.value(), 0);
}

#[test]
fn second_write_in_one_event_is_rejected() {
    let graph = Graph::new();
    let violations = capture_violations(&graph);

    let mut builder = ExtentBuilder::new(&graph);
    let r_a = builder.state(0i32);
    let extent = builder.build();
    extent.add_to_graph_with_action();

    let writer = r_a.clone();
    graph.action_sync("double write", move || {
        writer.update(1);
        writer.update(2);
    });

    assert!(violations
        .lock()
        .unwrap()
        .iter()
        .any(|error| matches!(error, GraphError::DoubleUpdate { .. })));
    assert_eq!(r_a.value(), 1);
}

#[test]
fn equal_write_is_a_silent_no_op() {
    let graph = Graph::new();
    let mut builder = ExtentBuilder::new(&graph);
    let r_a = builder.state_eq(7i32);

    let runs = Arc::new(AtomicUsize::new(0));
    let runs_clone = Arc::clone(&runs);
    builder
        .behavior()
        .demands([r_a.link()])
        .runs(move |_graph| {
            runs_clone.fetch_add(1, Ordering::SeqCst);
        });
    let extent = builder.build();
    extent.add_to_graph_with_action();

    let before = r_a.event();
    r_a.update_with_action(7, "same value");

    assert_eq!(r_a.event(), before);
    assert_eq!(runs.load(Ordering::SeqCst), 0);

    r_a.update_with_action(8, "new value");
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert!(r_a.event().sequence() > before.sequence());
}

#[test]
fn uncompared_state_treats_every_write_as_a_change() {
    let graph = Graph::new();
    let mut builder = ExtentBuilder::new(&graph);
    let r_a = builder.state(7i32);

    let runs = Arc::new(AtomicUsize::new(0));
    let runs_clone = Arc::clone(&runs);
    builder
        .behavior()
        .demands([r_a.link()])
        .runs(move |_graph| {
            runs_clone.fetch_add(1, Ordering::SeqCst);
        });
    let extent = builder.build();
    extent.add_to_graph_with_action();

    r_a.update_with_action(7, "same value");
    r_a.update_with_action(7, "same value again");

    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[test]
fn side_effects_run_in_creation_order_after_fixed_point() {
    let graph = Graph::new();
    let mut builder = ExtentBuilder::new(&graph);
    let r_a = builder.state_eq(0i32);
    let r_b = builder.state_eq(0i32);

    let log = Arc::new(Mutex::new(Vec::new()));

    let (a_in, b_out) = (r_a.clone(), r_b.clone());
    let log_first = Arc::clone(&log);
    builder
        .behavior()
        .supplies([r_b.resource()])
        .demands([r_a.link()])
        .runs(move |graph| {
            b_out.update(a_in.value() * 10);
            let log = Arc::clone(&log_first);
            graph.side_effect("b", move || {
                log.lock().unwrap().push("b".to_string());
            });
        });

    let log_second = Arc::clone(&log);
    let b_probe = r_b.clone();
    builder
        .behavior()
        .demands([r_b.link()])
        .runs(move |graph| {
            let log = Arc::clone(&log_second);
            let probe = b_probe.clone();
            graph.side_effect("c", move || {
                log.lock().unwrap().push(format!("c:{}", probe.value()));
            });
        });

    let extent = builder.build();
    extent.add_to_graph_with_action();

    let log_action = Arc::clone(&log);
    let a = r_a.clone();
    let host = extent.clone();
    graph.action_sync("effects", move || {
        let log = Arc::clone(&log_action);
        host.side_effect("a", move || {
            log.lock().unwrap().push("a".to_string());
        });
        a.update(4);
    });

    // Creation order is the action's effect, then each behavior's in run
    // order; all of them observe the settled graph.
    assert_eq!(
        *log.lock().unwrap(),
        vec!["a".to_string(), "b".to_string(), "c:40".to_string()]
    );
}

#[test]
fn transient_payloads_clear_when_the_event_completes() {
    let graph = Graph::new();
    let mut builder = ExtentBuilder::new(&graph);
    let signal = builder.typed_moment::<i32>();

    let seen = Arc::new(Mutex::new(None));
    let seen_clone = Arc::clone(&seen);
    let probe = signal.clone();
    builder
        .behavior()
        .demands([signal.link()])
        .runs(move |_graph| {
            *seen_clone.lock().unwrap() = probe.updated_value();
        });
    let extent = builder.build();
    extent.add_to_graph_with_action();

    signal.update_with_action(42, "payload");

    // Visible mid-event, gone afterwards.
    assert_eq!(*seen.lock().unwrap(), Some(42));
    assert_eq!(signal.updated_value(), None);
    assert!(signal.has_updated());
}

#[test]
fn trace_reads_expose_the_pre_event_value() {
    let graph = Graph::new();
    let mut builder = ExtentBuilder::new(&graph);
    let r_a = builder.state_eq(1i32);

    let traced = Arc::new(Mutex::new(None));
    let traced_clone = Arc::clone(&traced);
    let probe = r_a.clone();
    builder
        .behavior()
        .demands([r_a.link()])
        .runs(move |_graph| {
            *traced_clone.lock().unwrap() = Some((probe.trace_value(), probe.value()));
        });
    let extent = builder.build();
    extent.add_to_graph_with_action();

    r_a.update_with_action(2, "test");

    assert_eq!(*traced.lock().unwrap(), Some((1, 2)));
    // Outside the event the trace collapses to the current value.
    assert_eq!(r_a.trace_value(), 2);
}

#[test]
fn just_updated_is_scoped_to_the_current_event() {
    let graph = Graph::new();
    let mut builder = ExtentBuilder::new(&graph);
    let r_a = builder.state_eq(0i32);

    let observed = Arc::new(Mutex::new(None));
    let observed_clone = Arc::clone(&observed);
    let probe = r_a.clone();
    builder
        .behavior()
        .demands([r_a.link()])
        .runs(move |_graph| {
            *observed_clone.lock().unwrap() =
                Some((probe.just_updated(), probe.just_updated_to(&3)));
        });
    let extent = builder.build();
    extent.add_to_graph_with_action();

    r_a.update_with_action(3, "test");

    assert_eq!(*observed.lock().unwrap(), Some((true, true)));
    assert!(!r_a.just_updated());
}

#[test]
fn order_only_links_never_activate() {
    let graph = Graph::new();
    let mut builder = ExtentBuilder::new(&graph);
    let r_a = builder.state_eq(0i32);

    let runs = Arc::new(AtomicUsize::new(0));
    let runs_clone = Arc::clone(&runs);
    builder
        .behavior()
        .demands([r_a.order()])
        .runs(move |_graph| {
            runs_clone.fetch_add(1, Ordering::SeqCst);
        });
    let extent = builder.build();
    extent.add_to_graph_with_action();

    r_a.update_with_action(5, "test");

    assert_eq!(runs.load(Ordering::SeqCst), 0);
}

#[test]
fn adding_an_extent_twice_is_rejected() {
    let graph = Graph::new();
    let violations = capture_violations(&graph);

    let builder = ExtentBuilder::new(&graph);
    let extent = builder.build();
    extent.add_to_graph_with_action();
    extent.add_to_graph_with_action();

    assert!(violations
        .lock()
        .unwrap()
        .iter()
        .any(|error| matches!(error, GraphError::ExtentAlreadyAdded { .. })));
}

#[test]
fn adding_an_extent_requires_an_action() {
    let graph = Graph::new();
    let violations = capture_violations(&graph);

    let builder = ExtentBuilder::new(&graph);
    let extent = builder.build();
    extent.add_to_graph();

    assert!(violations
        .lock()
        .unwrap()
        .iter()
        .any(|error| matches!(error, GraphError::AddExtentOutsideEvent { .. })));
}

#[test]
fn dynamic_link_updates_require_an_event() {
    let graph = Graph::new();
    let violations = capture_violations(&graph);

    let mut builder = ExtentBuilder::new(&graph);
    let r_a = builder.state_eq(0i32);
    let behavior = builder.behavior().runs(|_graph| {});
    let extent = builder.build();
    extent.add_to_graph_with_action();

    behavior.set_dynamic_demands([r_a.link()]);

    assert!(violations
        .lock()
        .unwrap()
        .iter()
        .any(|error| matches!(error, GraphError::LinkUpdateOutsideEvent { .. })));
}

#[test]
fn pre_add_writes_are_rejected_by_default() {
    let graph = Graph::new();
    let violations = capture_violations(&graph);

    let mut builder = ExtentBuilder::new(&graph);
    let r_a = builder.state_eq(0i32);
    let extent = builder.build();

    let writer = r_a.clone();
    let target = extent.clone();
    graph.action_sync("add and write", move || {
        writer.update(5);
        target.add_to_graph();
    });

    assert!(violations
        .lock()
        .unwrap()
        .iter()
        .any(|error| matches!(error, GraphError::ResourceNotAttached { .. })));
    assert_eq!(r_a.value(), 0);
}

#[test]
fn pre_add_writes_can_be_permitted_and_activate_at_commit() {
    let graph = Graph::with_config(GraphConfig {
        pre_add_writes: PreAddWrites::Permit,
        ..GraphConfig::default()
    });
    let violations = capture_violations(&graph);

    let mut builder = ExtentBuilder::new(&graph);
    let r_a = builder.state_eq(0i32);

    let seen = Arc::new(Mutex::new(None));
    let seen_clone = Arc::clone(&seen);
    let probe = r_a.clone();
    builder
        .behavior()
        .demands([r_a.link()])
        .runs(move |_graph| {
            *seen_clone.lock().unwrap() = Some(probe.value());
        });
    let extent = builder.build();

    let writer = r_a.clone();
    let target = extent.clone();
    graph.action_sync("write then add", move || {
        writer.update(5);
        target.add_to_graph();
    });

    // The demand committed in the same event sees the write and activates.
    assert!(violations.lock().unwrap().is_empty());
    assert_eq!(*seen.lock().unwrap(), Some(5));
}

#[test]
fn undeclared_demand_reads_are_flagged_when_enabled() {
    let graph = Graph::with_config(GraphConfig {
        check_undeclared_demands: true,
        ..GraphConfig::default()
    });
    let violations = capture_violations(&graph);

    let mut builder = ExtentBuilder::new(&graph);
    let added = builder.added();
    let r_a = builder.state_eq(0i32);

    let probe = r_a.clone();
    builder
        .behavior()
        .demands([added.link()])
        .runs(move |_graph| {
            let _ = probe.value();
        });
    let extent = builder.build();
    extent.add_to_graph_with_action();

    assert!(violations
        .lock()
        .unwrap()
        .iter()
        .any(|error| matches!(error, GraphError::UndeclaredDemand { .. })));
}

#[test]
fn declared_demand_reads_pass_verification() {
    let graph = Graph::with_config(GraphConfig {
        check_undeclared_demands: true,
        ..GraphConfig::default()
    });
    let violations = capture_violations(&graph);

    let mut builder = ExtentBuilder::new(&graph);
    let r_a = builder.state_eq(0i32);
    let r_b = builder.state_eq(0i32);

    let (input, output) = (r_a.clone(), r_b.clone());
    builder
        .behavior()
        .supplies([r_b.resource()])
        .demands([r_a.link()])
        .runs(move |_graph| {
            output.update(input.value() + 1);
        });
    let extent = builder.build();
    extent.add_to_graph_with_action();

    r_a.update_with_action(1, "test");

    assert_eq!(violations.lock().unwrap().as_slice(), &[] as &[GraphError]);
    assert_eq!(r_b.value(), 2);
}

#[test]
fn moment_signals_carry_no_payload_but_stamp_events() {
    let graph = Graph::new();
    let mut builder = ExtentBuilder::new(&graph);
    let tick = builder.moment();

    let runs = Arc::new(AtomicUsize::new(0));
    let runs_clone = Arc::clone(&runs);
    builder
        .behavior()
        .demands([tick.link()])
        .runs(move |_graph| {
            runs_clone.fetch_add(1, Ordering::SeqCst);
        });
    let extent = builder.build();
    extent.add_to_graph_with_action();

    assert!(!tick.has_updated());
    tick.update_with_action("tick");
    tick.update_with_action("tock");

    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert!(tick.has_updated());
    assert!(tick.event().happened_since(2));
}
