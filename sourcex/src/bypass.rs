//! Storing detection results and replaying them in a later run.
//!
//! File layout, one group per block:
//!
//! ```text
//! <group_id> <source_count>
//! \t<detection_id> <source_id> <pixel_count> <x0> <y0> <x1> <y1> ...
//! ```

use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::task::JoinHandle;

use crate::entity::{Entity, EntityFactory, SourceGroup};
use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::pipeline::{AbortSignal, Emitter, Stage};
use crate::plugins::detection::{
    DetectionFrame, DetectionId, PixelCoordinate, PixelCoordinateList, SourceId,
};
use crate::plugins::group::GroupInfo;
use crate::progress::ProgressMediator;

pub const PROGRESS_LABEL: &str = "Recovered";

/// Pass-through stage writing every group it sees.
pub struct StoreBypass {
    path: PathBuf,
    writer: BufWriter<File>,
    groups: u64,
}

impl StoreBypass {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path).map_err(|source| Error::Io {
            path: path.clone(),
            source,
        })?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            groups: 0,
        })
    }

    fn write_group(&mut self, group: &SourceGroup) -> io::Result<()> {
        let group_id = group.peek_property::<GroupInfo>().map_or(0, |info| info.group_id);
        writeln!(self.writer, "{} {}", group_id, group.len())?;
        for source in group.sources() {
            let detection = source.peek_property::<DetectionId>().map_or(0, |id| id.0);
            let source_id = source.peek_property::<SourceId>().map_or(0, |id| id.0);
            let pixels = source.peek_property::<PixelCoordinateList>().unwrap_or_default();
            write!(self.writer, "\t{} {} {}", detection, source_id, pixels.len())?;
            for p in &pixels.coordinates {
                write!(self.writer, " {} {}", p.x, p.y)?;
            }
            writeln!(self.writer)?;
        }
        Ok(())
    }

    fn io_error(&self, source: io::Error) -> Error {
        Error::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl Stage for StoreBypass {
    type Input = SourceGroup;
    type Output = SourceGroup;

    fn name(&self) -> &'static str {
        "store_bypass"
    }

    fn handle(&mut self, group: SourceGroup, out: &Emitter<SourceGroup>) -> Result<()> {
        if let Err(err) = self.write_group(&group) {
            return Err(self.io_error(err));
        }
        self.groups += 1;
        out.emit(group)
    }

    fn finish(&mut self, _out: &Emitter<SourceGroup>) -> Result<()> {
        if let Err(err) = self.writer.flush() {
            return Err(self.io_error(err));
        }
        tracing::info!(path = %self.path.display(), groups = self.groups, "stored detection bypass");
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecoveredSource {
    pub detection_id: u64,
    pub source_id: u64,
    pub pixels: Vec<PixelCoordinate>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecoveredGroup {
    pub group_id: u64,
    pub sources: Vec<RecoveredSource>,
}

/// Groups read back from a bypass file.
#[derive(Clone, Debug)]
pub struct RecoverBypass {
    path: PathBuf,
    groups: Vec<RecoveredGroup>,
}

fn parse_numbers(line: &str) -> std::result::Result<Vec<i64>, String> {
    line.split_whitespace()
        .map(|token| {
            token
                .parse::<i64>()
                .map_err(|_| format!("'{}' is not an integer", token))
        })
        .collect()
}

fn non_negative(value: i64, what: &str) -> std::result::Result<u64, String> {
    u64::try_from(value).map_err(|_| format!("negative {} {}", what, value))
}

impl RecoverBypass {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|source| Error::Io {
            path: path.clone(),
            source,
        })?;
        Self::read(&path, BufReader::new(file))
    }

    pub fn read(path: &Path, reader: impl BufRead) -> Result<Self> {
        let malformed = |line: usize, reason: String| Error::Bypass {
            path: path.to_path_buf(),
            reason: format!("line {}: {}", line, reason),
        };

        let mut groups: Vec<RecoveredGroup> = Vec::new();
        let mut expected_sources = 0usize;
        for (index, line) in reader.lines().enumerate() {
            let number = index + 1;
            let line = line.map_err(|source| Error::Io {
                path: path.to_path_buf(),
                source,
            })?;
            if line.trim().is_empty() {
                continue;
            }
            let values = parse_numbers(&line).map_err(|reason| malformed(number, reason))?;

            if !line.starts_with('\t') {
                if expected_sources > 0 {
                    return Err(malformed(
                        number,
                        format!("previous group is missing {} source(s)", expected_sources),
                    ));
                }
                let &[group_id, count] = values.as_slice() else {
                    return Err(malformed(number, "expected '<group_id> <source_count>'".to_string()));
                };
                let group_id = non_negative(group_id, "group id").map_err(|r| malformed(number, r))?;
                expected_sources = non_negative(count, "source count")
                    .map_err(|r| malformed(number, r))? as usize;
                groups.push(RecoveredGroup {
                    group_id,
                    sources: Vec::new(),
                });
                continue;
            }

            let Some(group) = groups.last_mut().filter(|_| expected_sources > 0) else {
                return Err(malformed(number, "source line outside of a group".to_string()));
            };
            let &[detection_id, source_id, count, ref coords @ ..] = values.as_slice() else {
                return Err(malformed(
                    number,
                    "expected '<detection_id> <source_id> <pixel_count> ...'".to_string(),
                ));
            };
            let count = non_negative(count, "pixel count").map_err(|r| malformed(number, r))? as usize;
            if count.checked_mul(2) != Some(coords.len()) {
                return Err(malformed(
                    number,
                    format!("{} pixel(s) declared, {} coordinate(s) found", count, coords.len()),
                ));
            }
            group.sources.push(RecoveredSource {
                detection_id: non_negative(detection_id, "detection id")
                    .map_err(|r| malformed(number, r))?,
                source_id: non_negative(source_id, "source id").map_err(|r| malformed(number, r))?,
                pixels: coords
                    .chunks_exact(2)
                    .map(|xy| PixelCoordinate::new(xy[0], xy[1]))
                    .collect(),
            });
            expected_sources -= 1;
        }

        if expected_sources > 0 {
            return Err(Error::Bypass {
                path: path.to_path_buf(),
                reason: format!("file ends {} source(s) short", expected_sources),
            });
        }
        tracing::debug!(path = %path.display(), groups = groups.len(), "read detection bypass");
        Ok(Self {
            path: path.to_path_buf(),
            groups,
        })
    }

    pub fn groups(&self) -> &[RecoveredGroup] {
        &self.groups
    }

    pub fn source_count(&self) -> usize {
        self.groups.iter().map(|group| group.sources.len()).sum()
    }

    /// Smallest stored source id, where canonical ordering resumes.
    pub fn first_source_id(&self) -> Option<u64> {
        self.groups
            .iter()
            .flat_map(|group| &group.sources)
            .map(|source| source.source_id)
            .min()
    }

    /// Replays the groups as entities detected on `frame`, in file order.
    pub fn spawn(
        self,
        factory: Arc<EntityFactory>,
        frame: Arc<Frame>,
        abort: AbortSignal,
        progress: Option<Arc<ProgressMediator>>,
    ) -> (UnboundedReceiver<SourceGroup>, JoinHandle<Result<u64>>) {
        let (tx, rx) = unbounded_channel();
        let handle = tokio::task::spawn_blocking(move || {
            let out = Emitter::new("recover_bypass", tx);
            let total = self.source_count() as i64;
            let mut replayed = 0u64;
            for recovered in self.groups {
                if let Err(err) = abort.check() {
                    return Err(err);
                }
                let mut group = factory.create_group();
                group.set_property(GroupInfo {
                    group_id: recovered.group_id,
                });
                for stored in recovered.sources {
                    let mut source = factory.create_source();
                    source.set_property(DetectionId(stored.detection_id));
                    source.set_property(SourceId(stored.source_id));
                    source.set_property(PixelCoordinateList::new(stored.pixels));
                    source.set_property(DetectionFrame {
                        frame: frame.clone(),
                    });
                    group.add_source(source);
                }
                replayed += group.len() as u64;
                if let Err(err) = out.emit(group) {
                    abort.abort();
                    return Err(err);
                }
                if let Some(progress) = &progress {
                    progress.update(PROGRESS_LABEL, replayed as i64, total);
                }
            }
            if let Some(progress) = &progress {
                progress.update(PROGRESS_LABEL, total, total);
            }
            tracing::info!(path = %self.path.display(), sources = replayed, "replayed detection bypass");
            Ok(replayed)
        });
        (rx, handle)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn parse(text: &str) -> Result<RecoverBypass> {
        RecoverBypass::read(Path::new("test.bypass"), Cursor::new(text))
    }

    #[test]
    fn parses_groups_and_sources() {
        let bypass = parse("1 2\n\t1 1 2 3 4 4 4\n\t2 2 1 9 9\n2 1\n\t3 3 1 0 0\n").unwrap();
        assert_eq!(bypass.groups().len(), 2);
        assert_eq!(bypass.source_count(), 3);
        assert_eq!(bypass.first_source_id(), Some(1));
        assert_eq!(
            bypass.groups()[0].sources[0],
            RecoveredSource {
                detection_id: 1,
                source_id: 1,
                pixels: vec![PixelCoordinate::new(3, 4), PixelCoordinate::new(4, 4)],
            }
        );
    }

    #[test]
    fn reports_line_of_malformed_entry() {
        let err = parse("1 1\n\t1 1 2 3 4\n").unwrap_err();
        assert!(matches!(err, Error::Bypass { .. }));
        assert!(err.to_string().contains("line 2"));

        let err = parse("1 2\n\t1 1 1 0 0\n").unwrap_err();
        assert!(err.to_string().contains("1 source(s) short"));

        let err = parse("\t1 1 1 0 0\n").unwrap_err();
        assert!(err.to_string().contains("outside of a group"));

        assert!(parse("1 x\n").is_err());
    }

    #[test]
    fn huge_counts_are_malformed_not_fatal() {
        let err = parse("1 1\n\t1 1 4611686018427387904 0 0\n").unwrap_err();
        assert!(err.to_string().contains("line 2"), "{}", err);
        assert!(err.to_string().contains("coordinate(s) found"));

        let err = parse("1 4611686018427387904\n\t1 1 1 0 0\n").unwrap_err();
        assert!(matches!(err, Error::Bypass { .. }));
    }
}
