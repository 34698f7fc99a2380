use std::sync::Arc;

use crate::entity::{Entity, SourceGroup};
use crate::error::{Error, Result};
use crate::plugins::pixel::PixelBoundaries;
use crate::property::{Property, PropertyId, PropertyKind};
use crate::task::{group_task, Task, TaskFactory};

/// Set by the grouping stage when a group is released.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GroupInfo {
    pub group_id: u64,
}

impl Property for GroupInfo {
    const NAME: &'static str = "GroupInfo";
}

/// Union of the member bounding boxes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GroupBoundaries(pub PixelBoundaries);

impl Property for GroupBoundaries {
    const NAME: &'static str = "GroupBoundaries";
}

fn compute_group_boundaries(group: &mut SourceGroup) -> Result<()> {
    let mut bounds: Option<PixelBoundaries> = None;
    for source in group.sources_mut() {
        let member = *source.get_property::<PixelBoundaries>()?;
        bounds = Some(bounds.map_or(member, |b| b.union(&member)));
    }
    let bounds = bounds.ok_or(Error::Measurement {
        property: GroupBoundaries::NAME,
        reason: "group has no sources".to_string(),
    })?;
    group.set_property(GroupBoundaries(bounds));
    Ok(())
}

#[derive(Debug, Default)]
pub struct GroupTaskFactory;

impl TaskFactory for GroupTaskFactory {
    fn name(&self) -> &'static str {
        "group"
    }

    fn produced_properties(&self) -> Vec<PropertyKind> {
        vec![PropertyKind::of::<GroupBoundaries>()]
    }

    fn create_group_task(&self, id: PropertyId) -> Option<Arc<dyn Task<SourceGroup>>> {
        if id == PropertyId::of::<GroupBoundaries>() {
            Some(group_task(compute_group_boundaries))
        } else {
            None
        }
    }
}
