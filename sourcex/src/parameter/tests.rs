use common::FloatExt;

use super::*;

/// x, y free; flux constant; radius = hypot(x, y); scaled = radius * flux.
fn graph() -> (Arc<ParameterGraph>, [ParameterId; 5]) {
    let mut graph = ParameterGraph::new();
    let x = graph.add_free("x", 3.0);
    let y = graph.add_free("y", 4.0);
    let flux = graph.add_constant("flux", 2.0);
    let radius = graph
        .add_dependent("radius", &[x, y], |v| v[0].hypot(v[1]))
        .unwrap();
    let scaled = graph
        .add_dependent("scaled", &[radius, flux], |v| v[0] * v[1])
        .unwrap();
    (Arc::new(graph), [x, y, flux, radius, scaled])
}

#[test]
fn dependee_must_be_declared_first() {
    let mut graph = ParameterGraph::new();
    let a = graph.add_free("a", 0.0);
    let err = graph
        .add_dependent("b", &[a, ParameterId(7)], |v| v[0])
        .unwrap_err();
    match err {
        Error::UndeclaredDependee {
            parameter,
            dependee,
        } => {
            assert_eq!(parameter, ParameterId(1));
            assert_eq!(dependee, ParameterId(7));
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(graph.len(), 1);
}

#[test]
fn accessing_dependent_marks_transitive_dependees() {
    let (graph, [x, y, flux, radius, scaled]) = graph();
    let entity = EntityId::new(1);
    let other = EntityId::new(2);
    let mut manager = ParameterManager::new(graph);
    manager.add_all(entity).unwrap();
    manager.add_all(other).unwrap();
    assert_eq!(manager.parameter_count(), 10);

    manager.get_parameter(entity, scaled).unwrap();
    for id in [x, y, flux, radius, scaled] {
        assert!(manager.is_param_accessed(entity, id), "{} not accessed", id);
        assert!(!manager.is_param_accessed(other, id));
    }

    manager.clear_access_check();
    manager.get_parameter(other, radius).unwrap();
    assert!(manager.is_param_accessed(other, x));
    assert!(!manager.is_param_accessed(other, flux));
    assert!(!manager.is_param_accessed(entity, scaled));
}

#[test]
fn evaluate_follows_free_values() {
    let (graph, [x, _, _, radius, scaled]) = graph();
    let entity = EntityId::new(1);
    let mut manager = ParameterManager::new(graph);
    manager.add_all(entity).unwrap();

    assert!(manager.evaluate(entity, scaled).unwrap().approximately_eq(10.0));
    manager.get_parameter(entity, x).unwrap().set_value(0.0);
    assert!(manager.evaluate(entity, radius).unwrap().approximately_eq(4.0));
    assert!(manager.evaluate(entity, scaled).unwrap().approximately_eq(8.0));
}

#[test]
fn prune_drops_unread_bindings() {
    let (graph, [x, y, _, radius, scaled]) = graph();
    let entity = EntityId::new(5);
    let mut manager = ParameterManager::new(graph);
    manager.add_all(entity).unwrap();

    manager.get_parameter(entity, radius).unwrap();
    assert_eq!(manager.prune_unaccessed(), 2);
    assert_eq!(manager.parameter_count(), 3);
    assert!(manager.get_parameter(entity, x).is_ok());
    assert!(manager.get_parameter(entity, y).is_ok());
    assert!(matches!(
        manager.get_parameter(entity, scaled),
        Err(Error::UnknownParameter { .. })
    ));
}

#[test]
fn unknown_bindings_are_errors() {
    let (graph, [x, ..]) = graph();
    let mut manager = ParameterManager::new(graph);
    let entity = EntityId::new(3);

    assert!(manager.get_parameter(entity, x).is_err());
    assert!(manager
        .add_parameter(entity, FitParameter::new(ParameterId(99), 0.0))
        .is_err());

    let engine_param = FitParameter::new(x, 1.5);
    manager.add_parameter(entity, engine_param.clone()).unwrap();
    manager.store_parameter(engine_param);
    assert_eq!(manager.stored_count(), 1);
    assert_eq!(manager.get_parameter(entity, x).unwrap().value(), 1.5);
}
