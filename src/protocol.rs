//! The line-based metric record format.
//!
//! One record per line, UTF-8, newline-terminated:
//!
//! ```text
//! put <metric_name> <timestamp_ms> <value> [<tag>=<value>]*
//! ```
//!
//! The same format is used for staged local files and the objects uploaded
//! to the store, so readers and writers here are generic over `io` traits.

use crate::schema::{TagSet, Value};
use crate::{Error, Result};

use std::collections::HashSet;
use std::io::{BufRead, Write};
use tracing::warn;

/// Which tags a reader materializes for each record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagSelection {
    /// Parse and return every tag; malformed tags are format errors.
    All,
    /// Skip tag parsing (and validation) entirely, for speed.
    Skip,
    /// Return only the listed tags. Tags outside the set are not validated,
    /// so malformed-tag errors are only guaranteed for requested keys.
    Keys(HashSet<String>),
}

impl TagSelection {
    pub fn keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        TagSelection::Keys(keys.into_iter().map(Into::into).collect())
    }
}

/// One decoded record.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub name: String,
    pub timestamp: i64,
    pub value: Value,
    pub tags: TagSet,
}

/// Appends records to a line-protocol stream.
pub struct LineWriter<W: Write> {
    out: W,
}

impl<W: Write> LineWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    /// Appends one record.
    ///
    /// A value that does not parse as a float is written as-is with a
    /// `type=string` tag added to the *written* tag set; the caller's tags
    /// are never mutated.
    pub fn put_value(
        &mut self,
        name: &str,
        timestamp: i64,
        value: &Value,
        tags: &TagSet,
    ) -> Result<()> {
        let mut line = format!("put {} {} {}", name, timestamp, value);
        if value.as_f64().is_none() {
            warn!(value = %value, "metric value is not a float, adding type=string tag");
            let mut tagged = tags.clone();
            tagged.insert("type".to_string(), "string".to_string());
            for (key, tag_value) in &tagged {
                line.push_str(&format!(" {}={}", key, tag_value));
            }
        } else {
            for (key, tag_value) in tags {
                line.push_str(&format!(" {}={}", key, tag_value));
            }
        }
        line.push('\n');
        self.out.write_all(line.as_bytes())?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

/// Reads records from a line-protocol stream.
pub struct LineReader<R: BufRead> {
    input: R,
    tags: TagSelection,
    line_number: usize,
    /// Origin (file path or object key) for error messages
    origin: Option<String>,
}

impl<R: BufRead> LineReader<R> {
    pub fn new(input: R, tags: TagSelection) -> Self {
        Self {
            input,
            tags,
            line_number: 0,
            origin: None,
        }
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    fn format_error(&self, message: &str, line: &str) -> Error {
        let origin = self.origin.as_deref().unwrap_or("<input>");
        Error::Format(format!(
            "{} at {}:{}: '{}'",
            message,
            origin,
            self.line_number,
            line.trim_end()
        ))
    }

    /// Reads the next record, or `Ok(None)` at end of input.
    pub fn read_record(&mut self) -> Result<Option<Record>> {
        let mut line = String::new();
        if self.input.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        self.line_number += 1;

        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.first() != Some(&"put") {
            return Err(self.format_error("metric record must start with 'put'", &line));
        }
        if fields.len() < 4 {
            return Err(self.format_error("metric record is missing fields", &line));
        }

        let name = fields[1].to_string();
        let timestamp: i64 = fields[2]
            .parse()
            .map_err(|_| self.format_error("unparsable timestamp", &line))?;
        let value = match fields[3].parse::<f64>() {
            Ok(number) => Value::Number(number),
            Err(_) => {
                warn!(
                    value = fields[3],
                    line = self.line_number,
                    "non-float metric value, treating as a string"
                );
                Value::Text(fields[3].to_string())
            }
        };

        let mut tags = TagSet::new();
        match &self.tags {
            TagSelection::Skip => {}
            TagSelection::All => {
                for token in &fields[4..] {
                    let parts: Vec<&str> = token.split('=').collect();
                    if parts.len() != 2 {
                        return Err(self.format_error("invalid tag", &line));
                    }
                    tags.insert(parts[0].to_string(), parts[1].to_string());
                }
            }
            TagSelection::Keys(wanted) => {
                for token in &fields[4..] {
                    let key = token.split('=').next().unwrap_or(token);
                    if !wanted.contains(key) {
                        continue;
                    }
                    let parts: Vec<&str> = token.split('=').collect();
                    if parts.len() != 2 {
                        return Err(self.format_error("invalid tag", &line));
                    }
                    tags.insert(parts[0].to_string(), parts[1].to_string());
                }
            }
        }

        Ok(Some(Record {
            name,
            timestamp,
            value,
            tags,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::is_close;
    use std::io::Cursor;

    fn write_one(name: &str, ts: i64, value: Value, tags: &[(&str, &str)]) -> String {
        let mut writer = LineWriter::new(Vec::new());
        let tags: TagSet = tags
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        writer.put_value(name, ts, &value, &tags).unwrap();
        String::from_utf8(writer.into_inner()).unwrap()
    }

    fn read_all(input: &str, tags: TagSelection) -> Vec<Record> {
        let mut reader = LineReader::new(Cursor::new(input), tags);
        let mut records = Vec::new();
        while let Some(record) = reader.read_record().unwrap() {
            records.push(record);
        }
        records
    }

    #[test]
    fn test_round_trip() {
        let line = write_one(
            "airflow.temperature.out",
            1_445_356_041_000,
            Value::Number(21.375),
            &[("source", "slab01"), ("version", "1")],
        );
        let records = read_all(&line, TagSelection::All);
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.name, "airflow.temperature.out");
        assert_eq!(record.timestamp, 1_445_356_041_000);
        assert!(is_close(record.value.as_f64().unwrap(), 21.375));
        assert_eq!(record.tags.get("source").unwrap(), "slab01");
        assert_eq!(record.tags.get("version").unwrap(), "1");
    }

    #[test]
    fn test_string_value_gets_type_tag_on_write() {
        let line = write_one("status", 1000, Value::Text("rebooting".into()), &[]);
        assert!(line.contains("type=string"));

        let records = read_all(&line, TagSelection::All);
        assert_eq!(records[0].value, Value::Text("rebooting".into()));
        assert_eq!(records[0].tags.get("type").unwrap(), "string");
    }

    #[test]
    fn test_string_value_write_does_not_mutate_caller_tags() {
        let tags = TagSet::new();
        let mut writer = LineWriter::new(Vec::new());
        writer
            .put_value("status", 1000, &Value::Text("off".into()), &tags)
            .unwrap();
        assert!(tags.is_empty());
    }

    #[test]
    fn test_non_put_line_is_a_format_error() {
        let mut reader = LineReader::new(
            Cursor::new("what a bunch of junk\n"),
            TagSelection::All,
        );
        assert!(matches!(reader.read_record(), Err(Error::Format(_))));
    }

    #[test]
    fn test_missing_fields_is_a_format_error() {
        let mut reader = LineReader::new(Cursor::new("put motion 1000\n"), TagSelection::All);
        assert!(matches!(reader.read_record(), Err(Error::Format(_))));
    }

    #[test]
    fn test_bad_timestamp_is_a_format_error() {
        let mut reader =
            LineReader::new(Cursor::new("put motion later 5\n"), TagSelection::All);
        assert!(matches!(reader.read_record(), Err(Error::Format(_))));
    }

    #[test]
    fn test_non_float_value_falls_back_to_text() {
        let records = read_all("put motion 1000 wiggle\n", TagSelection::All);
        assert_eq!(records[0].value, Value::Text("wiggle".into()));
    }

    #[test]
    fn test_malformed_tag_is_a_format_error() {
        let mut reader = LineReader::new(
            Cursor::new("put motion 1000 5 notatag\n"),
            TagSelection::All,
        );
        assert!(matches!(reader.read_record(), Err(Error::Format(_))));

        let mut reader = LineReader::new(
            Cursor::new("put motion 1000 5 a=b=c\n"),
            TagSelection::All,
        );
        assert!(matches!(reader.read_record(), Err(Error::Format(_))));
    }

    #[test]
    fn test_skip_selection_skips_tag_validation() {
        let records = read_all("put motion 1000 5 notatag\n", TagSelection::Skip);
        assert!(records[0].tags.is_empty());
    }

    #[test]
    fn test_keys_selection_returns_intersection_only() {
        let input = "put motion 1000 5 version=2 source=slab01\n";
        let records = read_all(input, TagSelection::keys(["version"]));
        assert_eq!(records[0].tags.len(), 1);
        assert_eq!(records[0].tags.get("version").unwrap(), "2");
    }

    #[test]
    fn test_keys_selection_ignores_malformed_unrequested_tags() {
        let input = "put motion 1000 5 junktag version=2\n";
        let records = read_all(input, TagSelection::keys(["version"]));
        assert_eq!(records[0].tags.get("version").unwrap(), "2");

        // But a malformed *requested* tag still fails
        let mut reader = LineReader::new(
            Cursor::new("put motion 1000 5 version=2=3\n"),
            TagSelection::keys(["version"]),
        );
        assert!(matches!(reader.read_record(), Err(Error::Format(_))));
    }

    #[test]
    fn test_end_of_input_is_a_sentinel() {
        let mut reader = LineReader::new(Cursor::new(""), TagSelection::All);
        assert!(reader.read_record().unwrap().is_none());
        // and stays that way
        assert!(reader.read_record().unwrap().is_none());
    }

    #[test]
    fn test_multiple_records() {
        let input = "put a 1000 1\nput b 2000 2 source=x\n";
        let records = read_all(input, TagSelection::All);
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].name, "b");
    }
}
