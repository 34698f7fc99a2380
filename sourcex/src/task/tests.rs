use std::sync::atomic::{AtomicUsize, Ordering};

use super::*;
use crate::entity::{Entity, EntityFactory};
use crate::property::Property;

#[derive(Debug)]
struct Width(u32);

impl Property for Width {
    const NAME: &'static str = "Width";
}

#[derive(Debug)]
struct Label(String);

impl Property for Label {
    const NAME: &'static str = "Label";
}

struct WidthFactory {
    created: Arc<AtomicUsize>,
    section: Option<&'static str>,
    configured: bool,
}

impl TaskFactory for WidthFactory {
    fn name(&self) -> &'static str {
        "width"
    }

    fn produced_properties(&self) -> Vec<PropertyKind> {
        vec![PropertyKind::of::<Width>()]
    }

    fn report_config_dependencies(&self, deps: &mut ConfigDependencies) {
        if let Some(section) = self.section {
            deps.declare(section);
        }
    }

    fn configure(&mut self, _config: &Config) -> Result<()> {
        self.configured = true;
        Ok(())
    }

    fn create_source_task(&self, id: PropertyId) -> Option<Arc<dyn Task<Source>>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        let instance = id.instance;
        Some(source_task(move |source: &mut Source| {
            source.set_indexed_property(instance, Width(instance * 10));
            Ok(())
        }))
    }
}

fn width_factory(created: &Arc<AtomicUsize>) -> Box<WidthFactory> {
    Box::new(WidthFactory {
        created: created.clone(),
        section: None,
        configured: false,
    })
}

#[test]
fn duplicate_producer_is_rejected() {
    let created = Arc::new(AtomicUsize::new(0));
    let mut registry = TaskFactoryRegistry::new();
    registry.register(width_factory(&created)).unwrap();

    let err = registry.register(width_factory(&created)).unwrap_err();
    assert!(matches!(err, Error::DuplicateTaskFactory { name: "Width" }));
    assert_eq!(registry.len(), 1);
}

#[test]
fn resolver_caches_created_tasks_per_id() {
    let created = Arc::new(AtomicUsize::new(0));
    let mut registry = TaskFactoryRegistry::new();
    registry.register(width_factory(&created)).unwrap();
    let resolver = TaskResolver::new(registry);

    assert!(resolver.create_source_task(PropertyId::of::<Width>()).is_some());
    assert!(resolver.create_source_task(PropertyId::of::<Width>()).is_some());
    assert!(resolver.create_source_task(PropertyId::indexed::<Width>(2)).is_some());
    assert_eq!(created.load(Ordering::SeqCst), 2);

    assert!(resolver.create_source_task(PropertyId::of::<Label>()).is_none());
    assert!(resolver.create_group_task(PropertyId::of::<Width>()).is_none());
}

#[test]
fn indexed_tasks_know_their_instance() {
    let created = Arc::new(AtomicUsize::new(0));
    let mut registry = TaskFactoryRegistry::new();
    registry.register(width_factory(&created)).unwrap();
    let factory = EntityFactory::new(TaskResolver::new(registry));

    let mut source = factory.create_source();
    assert_eq!(source.get_indexed_property::<Width>(3).unwrap().0, 30);
    assert_eq!(source.get_property::<Width>().unwrap().0, 0);
}

#[test]
fn configure_checks_plugin_sections() {
    let created = Arc::new(AtomicUsize::new(0));
    let config = Config::from_yaml_str("plugins: {width: {scale: 2}}").unwrap();

    let mut registry = TaskFactoryRegistry::new();
    registry.register(width_factory(&created)).unwrap();
    assert!(matches!(
        registry.configure(&config),
        Err(Error::UnknownConfigSection(_))
    ));

    let mut registry = TaskFactoryRegistry::new();
    registry
        .register(Box::new(WidthFactory {
            created,
            section: Some("width"),
            configured: false,
        }))
        .unwrap();
    registry.configure(&config).unwrap();
    assert!(registry.config_dependencies().contains("width"));
    assert!(registry.produces(PropertyKind::of::<Width>()));
}

#[test]
fn closure_tasks_run_on_groups() {
    let task = group_task(|group: &mut SourceGroup| {
        let count = group.len() as u32;
        group.set_property(Width(count));
        Ok(())
    });
    let factory = EntityFactory::new(TaskResolver::new(TaskFactoryRegistry::new()));
    let mut group = factory.create_group();
    group.add_source(factory.create_source());
    group.add_source(factory.create_source());

    task.compute_properties(&mut group).unwrap();
    assert_eq!(group.peek_property::<Width>().unwrap().0, 2);
}
