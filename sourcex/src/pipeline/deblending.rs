use super::{Emitter, Stage};
use crate::entity::{Entity, SourceGroup};
use crate::error::Result;
use crate::plugins::detection::{DetectionId, SourceId};

/// Splits, merges or removes sources of one group.
pub trait DeblendAction: Send + Sync {
    fn deblend(&self, group: &mut SourceGroup) -> Result<()>;
}

impl<F> DeblendAction for F
where
    F: Fn(&mut SourceGroup) -> Result<()> + Send + Sync,
{
    fn deblend(&self, group: &mut SourceGroup) -> Result<()> {
        self(group)
    }
}

/// Runs every deblend action on a group, then gives its sources
/// contiguous canonical ids in detection order.
pub struct Deblending {
    actions: Vec<Box<dyn DeblendAction>>,
    next_source_id: u64,
}

impl Deblending {
    pub fn new(actions: Vec<Box<dyn DeblendAction>>, first_source_id: u64) -> Self {
        Self {
            actions,
            next_source_id: first_source_id,
        }
    }

    pub fn next_source_id(&self) -> u64 {
        self.next_source_id
    }
}

impl Stage for Deblending {
    type Input = SourceGroup;
    type Output = SourceGroup;

    fn name(&self) -> &'static str {
        "deblending"
    }

    fn handle(&mut self, mut group: SourceGroup, out: &Emitter<SourceGroup>) -> Result<()> {
        for action in &self.actions {
            action.deblend(&mut group)?;
        }
        if group.is_empty() {
            tracing::debug!(group = %group.id(), "deblending left an empty group");
            return Ok(());
        }

        group.sources_mut().sort_by_key(|source| {
            source
                .peek_property::<DetectionId>()
                .map_or(u64::MAX, |id| id.0)
        });
        for source in group.sources_mut() {
            source.set_property(SourceId(self.next_source_id));
            self.next_source_id += 1;
        }
        out.emit(group)
    }
}
