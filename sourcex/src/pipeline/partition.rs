use super::{Emitter, SourceMessage, Stage};
use crate::entity::{Entity, Source};
use crate::error::Result;
use crate::plugins::detection::PixelCoordinateList;

/// Splits or filters one source. Returning an empty vector drops it.
pub trait PartitionStep: Send + Sync {
    fn partition(&self, source: Source) -> Result<Vec<Source>>;
}

/// Drops sources with fewer than `min_area` pixels.
#[derive(Clone, Copy, Debug)]
pub struct MinAreaStep {
    pub min_area: usize,
}

impl MinAreaStep {
    pub fn new(min_area: usize) -> Self {
        Self { min_area }
    }
}

impl PartitionStep for MinAreaStep {
    fn partition(&self, mut source: Source) -> Result<Vec<Source>> {
        let pixels = source.get_property::<PixelCoordinateList>()?;
        if pixels.len() < self.min_area {
            tracing::trace!(
                source = %source.id(),
                area = pixels.len(),
                min_area = self.min_area,
                "dropped small detection"
            );
            return Ok(Vec::new());
        }
        Ok(vec![source])
    }
}

/// Applies every step in order to each source; progress passes through.
#[derive(Default)]
pub struct Partition {
    steps: Vec<Box<dyn PartitionStep>>,
}

impl Partition {
    pub fn new(steps: Vec<Box<dyn PartitionStep>>) -> Self {
        Self { steps }
    }
}

impl Stage for Partition {
    type Input = SourceMessage;
    type Output = SourceMessage;

    fn name(&self) -> &'static str {
        "partition"
    }

    fn handle(&mut self, msg: SourceMessage, out: &Emitter<SourceMessage>) -> Result<()> {
        let source = match msg {
            SourceMessage::Source(source) => source,
            progress @ SourceMessage::Progress(_) => return out.emit(progress),
        };

        let mut sources = vec![source];
        for step in &self.steps {
            let mut next = Vec::with_capacity(sources.len());
            for source in sources {
                next.extend(step.partition(source)?);
            }
            sources = next;
        }
        for source in sources {
            out.emit(SourceMessage::Source(source))?;
        }
        Ok(())
    }
}
