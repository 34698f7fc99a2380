use std::sync::Arc;

use super::{Emitter, SegmentationProgress, SourceMessage, Stage};
use crate::entity::{Entity, EntityFactory, Source, SourceGroup};
use crate::error::Result;
use crate::plugins::detection::PixelCoordinateList;
use crate::plugins::group::GroupInfo;
use crate::plugins::pixel::PixelBoundaries;

/// Decides whether two sources belong in the same group.
pub trait GroupingCriteria: Send + Sync {
    fn should_group(&self, a: &mut Source, b: &mut Source) -> Result<bool>;

    /// Rows beyond a group's last row at which a later source may still
    /// join it.
    fn margin(&self) -> i64 {
        0
    }
}

/// Groups sources whose pixel bounding boxes, grown by `margin`, overlap.
#[derive(Clone, Copy, Debug, Default)]
pub struct OverlappingBoundariesCriteria {
    pub margin: i64,
}

impl GroupingCriteria for OverlappingBoundariesCriteria {
    fn should_group(&self, a: &mut Source, b: &mut Source) -> Result<bool> {
        let a = a.get_property::<PixelBoundaries>()?;
        let b = b.get_property::<PixelBoundaries>()?;
        let m = self.margin;
        Ok(a.min_x - m <= b.max_x
            && b.min_x - m <= a.max_x
            && a.min_y - m <= b.max_y
            && b.min_y - m <= a.max_y)
    }

    fn margin(&self) -> i64 {
        self.margin.max(0)
    }
}

struct PendingGroup {
    group: SourceGroup,
    max_y: i64,
}

/// Collects sources into groups and releases a group once the
/// segmentation has moved past its last row plus the criteria's margin,
/// so no later source can join it.
pub struct SourceGrouping {
    criteria: Box<dyn GroupingCriteria>,
    factory: Arc<EntityFactory>,
    pending: Vec<PendingGroup>,
    next_group_id: u64,
}

impl SourceGrouping {
    pub fn new(criteria: Box<dyn GroupingCriteria>, factory: Arc<EntityFactory>) -> Self {
        Self {
            criteria,
            factory,
            pending: Vec::new(),
            next_group_id: 1,
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn add_source(&mut self, mut source: Source) -> Result<()> {
        let max_y = source
            .get_property::<PixelCoordinateList>()?
            .coordinates
            .iter()
            .map(|p| p.y)
            .max()
            .unwrap_or(i64::MIN);

        let mut matched = Vec::new();
        for (index, pending) in self.pending.iter_mut().enumerate() {
            for member in pending.group.sources_mut() {
                if self.criteria.should_group(&mut source, member)? {
                    matched.push(index);
                    break;
                }
            }
        }

        let Some((&target, others)) = matched.split_first() else {
            let mut group = self.factory.create_group();
            group.add_source(source);
            self.pending.push(PendingGroup { group, max_y });
            return Ok(());
        };

        // later indices first so earlier ones stay valid
        for &index in others.iter().rev() {
            let merged = self.pending.remove(index);
            let pending = &mut self.pending[target];
            pending.max_y = pending.max_y.max(merged.max_y);
            pending.group.merge(merged.group);
        }
        let pending = &mut self.pending[target];
        pending.max_y = pending.max_y.max(max_y);
        pending.group.add_source(source);
        Ok(())
    }

    fn release(&mut self, mut group: SourceGroup, out: &Emitter<SourceGroup>) -> Result<()> {
        group.set_property(GroupInfo {
            group_id: self.next_group_id,
        });
        self.next_group_id += 1;
        out.emit(group)
    }

    fn release_before(&mut self, progress: SegmentationProgress, out: &Emitter<SourceGroup>) -> Result<()> {
        let margin = self.criteria.margin();
        let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|pending| {
                progress.is_done() || pending.max_y + margin < progress.position as i64
            });
        self.pending = waiting;
        for pending in ready {
            self.release(pending.group, out)?;
        }
        Ok(())
    }
}

impl Stage for SourceGrouping {
    type Input = SourceMessage;
    type Output = SourceGroup;

    fn name(&self) -> &'static str {
        "grouping"
    }

    fn handle(&mut self, msg: SourceMessage, out: &Emitter<SourceGroup>) -> Result<()> {
        match msg {
            SourceMessage::Source(source) => self.add_source(source),
            SourceMessage::Progress(progress) => self.release_before(progress, out),
        }
    }

    fn finish(&mut self, out: &Emitter<SourceGroup>) -> Result<()> {
        self.release_before(SegmentationProgress::done(0), out)
    }
}
