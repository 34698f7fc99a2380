use std::io::{self, Write};
use std::sync::Arc;

use super::{OutputRegistry, OutputSink};
use crate::entity::SourceGroup;
use crate::error::{Error, Result};

/// Whitespace-separated text catalog with a numbered `#` header.
#[derive(Debug)]
pub struct AsciiCatalog<W: Write> {
    writer: W,
    columns: Arc<OutputRegistry>,
    header_written: bool,
}

impl<W: Write + Send> AsciiCatalog<W> {
    pub fn new(writer: W, columns: Arc<OutputRegistry>) -> Self {
        Self {
            writer,
            columns,
            header_written: false,
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    fn write_header(&mut self) -> io::Result<()> {
        for (index, name) in self.columns.column_names().into_iter().enumerate() {
            writeln!(self.writer, "# {:>3} {}", index + 1, name)?;
        }
        self.header_written = true;
        Ok(())
    }

    fn write_rows(&mut self, group: &SourceGroup) -> io::Result<()> {
        if !self.header_written {
            self.write_header()?;
        }
        for source in group.sources() {
            let line = self
                .columns
                .row(group, source)
                .iter()
                .map(|value| value.to_string())
                .collect::<Vec<_>>()
                .join(" ");
            writeln!(self.writer, "{}", line)?;
        }
        Ok(())
    }
}

fn output_error(source: io::Error) -> Error {
    Error::Output {
        sink: "ascii",
        source,
    }
}

impl<W: Write + Send> OutputSink for AsciiCatalog<W> {
    fn name(&self) -> &'static str {
        "ascii"
    }

    fn write_group(&mut self, group: &SourceGroup) -> Result<()> {
        self.write_rows(group).map_err(output_error)
    }

    fn finish(&mut self) -> Result<()> {
        let result = if self.header_written {
            Ok(())
        } else {
            self.write_header()
        };
        result
            .and_then(|()| self.writer.flush())
            .map_err(output_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Entity, EntityFactory};
    use crate::output::{ColumnValue, OutputColumn};
    use crate::plugins::detection::SourceId;
    use crate::task::{TaskFactoryRegistry, TaskResolver};

    #[test]
    fn writes_header_then_rows() {
        let mut outputs = OutputRegistry::new();
        outputs
            .register(OutputColumn::source::<SourceId, _>("SOURCE_ID", 0, |id| {
                ColumnValue::Int(id.0 as i64)
            }))
            .unwrap();
        outputs
            .register(OutputColumn::source::<SourceId, _>("SCALED", 0, |id| {
                ColumnValue::Float(id.0 as f64 * 0.5)
            }))
            .unwrap();

        let factory = EntityFactory::new(TaskResolver::new(TaskFactoryRegistry::new()));
        let mut group = factory.create_group();
        for id in [7, 8] {
            let mut source = factory.create_source();
            source.set_property(SourceId(id));
            group.add_source(source);
        }

        let mut catalog = AsciiCatalog::new(Vec::new(), Arc::new(outputs));
        catalog.write_group(&group).unwrap();
        catalog.finish().unwrap();

        let text = String::from_utf8(catalog.into_inner()).unwrap();
        assert_eq!(
            text,
            "#   1 SOURCE_ID\n#   2 SCALED\n7 3.500000\n8 4.000000\n"
        );
    }

    #[test]
    fn empty_catalog_still_has_header() {
        let mut outputs = OutputRegistry::new();
        outputs
            .register(OutputColumn::source::<SourceId, _>("SOURCE_ID", 0, |id| {
                ColumnValue::Int(id.0 as i64)
            }))
            .unwrap();
        let mut catalog = AsciiCatalog::new(Vec::new(), Arc::new(outputs));
        catalog.finish().unwrap();
        assert_eq!(catalog.into_inner(), b"#   1 SOURCE_ID\n");
    }
}
