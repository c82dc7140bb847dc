//! Result records and output encoding.
//!
//! Each validated response becomes a [`FieldSet`]: an ordered list of named
//! values following the schema a probe module declares plus the shared IP
//! and system fields. Encoders turn fieldsets into JSON or CSV lines; the
//! sink serializes writers so records never interleave.

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

/// Wire type of an output field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    Int,
    Bool,
    Binary,
    Repeated,
}

/// Declaration of one output field: name, type, human description.
#[derive(Debug, Clone, Copy)]
pub struct FieldDef {
    pub name: &'static str,
    pub ftype: FieldType,
    pub desc: &'static str,
}

/// Shared IP-layer fields prepended to every record.
pub const IP_FIELDS: &[FieldDef] = &[
    FieldDef { name: "saddr", ftype: FieldType::String, desc: "source IP address of response" },
    FieldDef { name: "saddr_raw", ftype: FieldType::Int, desc: "network order integer form of source IP address" },
    FieldDef { name: "daddr", ftype: FieldType::String, desc: "destination IP address of response" },
    FieldDef { name: "daddr_raw", ftype: FieldType::Int, desc: "network order integer form of destination IP address" },
    FieldDef { name: "ipid", ftype: FieldType::Int, desc: "IP identification number of response" },
    FieldDef { name: "ttl", ftype: FieldType::Int, desc: "time-to-live of response packet" },
];

/// Shared system fields appended to every record.
pub const SYS_FIELDS: &[FieldDef] = &[
    FieldDef { name: "repeat", ftype: FieldType::Bool, desc: "Is response a repeat response from host" },
    FieldDef { name: "cooldown", ftype: FieldType::Bool, desc: "Was response received during the cooldown period" },
    FieldDef { name: "timestamp_str", ftype: FieldType::String, desc: "timestamp of when response arrived in ISO8601 format" },
    FieldDef { name: "timestamp_ts", ftype: FieldType::Int, desc: "timestamp of when response arrived in seconds since Epoch" },
    FieldDef { name: "timestamp_us", ftype: FieldType::Int, desc: "microsecond part of timestamp" },
];

/// A single field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(String),
    Uint(u64),
    Bool(bool),
    Binary(Vec<u8>),
    Repeated(Vec<FieldSet>),
    Null,
}

/// An ordered set of named field values; one per output record.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FieldSet {
    fields: Vec<(&'static str, Value)>,
}

impl FieldSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_str(&mut self, name: &'static str, value: impl Into<String>) {
        self.fields.push((name, Value::Str(value.into())));
    }

    pub fn add_uint(&mut self, name: &'static str, value: u64) {
        self.fields.push((name, Value::Uint(value)));
    }

    pub fn add_bool(&mut self, name: &'static str, value: bool) {
        self.fields.push((name, Value::Bool(value)));
    }

    pub fn add_binary(&mut self, name: &'static str, value: Vec<u8>) {
        self.fields.push((name, Value::Binary(value)));
    }

    pub fn add_repeated(&mut self, name: &'static str, value: Vec<FieldSet>) {
        self.fields.push((name, Value::Repeated(value)));
    }

    pub fn add_null(&mut self, name: &'static str) {
        self.fields.push((name, Value::Null));
    }

    /// Replace the value of an existing field (e.g. the ICMP saddr fix-up).
    /// Appends instead when the field is not present yet.
    pub fn set_str(&mut self, name: &'static str, value: impl Into<String>) {
        match self.fields.iter_mut().find(|(n, _)| *n == name) {
            Some((_, v)) => *v = Value::Str(value.into()),
            None => self.add_str(name, value),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(&'static str, Value)> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

// =============================================================================
// Encoders
// =============================================================================

/// Turns one fieldset into one output line.
pub trait Encoder: Send + Sync {
    /// Optional header line, written once before any records.
    fn header(&self, _defs: &[FieldDef]) -> Option<String> {
        None
    }

    fn encode(&self, fs: &FieldSet) -> String;
}

/// JSON Lines encoder; binary values are base64, field order preserved.
pub struct JsonEncoder;

fn to_json(fs: &FieldSet) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    for (name, value) in fs.iter() {
        let v = match value {
            Value::Str(s) => serde_json::Value::String(s.clone()),
            Value::Uint(u) => serde_json::Value::from(*u),
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Binary(b) => serde_json::Value::String(BASE64.encode(b)),
            Value::Repeated(sets) => {
                serde_json::Value::Array(sets.iter().map(to_json).collect())
            }
            Value::Null => serde_json::Value::Null,
        };
        map.insert((*name).to_string(), v);
    }
    serde_json::Value::Object(map)
}

impl Encoder for JsonEncoder {
    fn encode(&self, fs: &FieldSet) -> String {
        to_json(fs).to_string()
    }
}

/// CSV encoder. Nested (repeated) values are embedded as JSON strings so
/// flat consumers can still ingest DNS records.
pub struct CsvEncoder;

fn csv_escape(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

impl Encoder for CsvEncoder {
    fn header(&self, defs: &[FieldDef]) -> Option<String> {
        Some(
            defs.iter()
                .map(|d| d.name)
                .collect::<Vec<_>>()
                .join(","),
        )
    }

    fn encode(&self, fs: &FieldSet) -> String {
        fs.iter()
            .map(|(_, v)| match v {
                Value::Str(s) => csv_escape(s),
                Value::Uint(u) => u.to_string(),
                Value::Bool(b) => b.to_string(),
                Value::Binary(b) => BASE64.encode(b),
                Value::Repeated(sets) => {
                    let json = serde_json::Value::Array(sets.iter().map(to_json).collect());
                    csv_escape(&json.to_string())
                }
                Value::Null => String::new(),
            })
            .collect::<Vec<_>>()
            .join(",")
    }
}

// =============================================================================
// Sink
// =============================================================================

/// Destination for encoded records.
///
/// The writer lock is held only for the duration of a single record write,
/// never across a suspension point.
pub struct OutputSink {
    encoder: Box<dyn Encoder>,
    writer: Mutex<Box<dyn Write + Send>>,
    records: AtomicU64,
}

impl OutputSink {
    pub fn new(encoder: Box<dyn Encoder>, writer: Box<dyn Write + Send>) -> Self {
        Self {
            encoder,
            writer: Mutex::new(writer),
            records: AtomicU64::new(0),
        }
    }

    /// Write the encoder's header, if it has one.
    pub fn write_header(&self, defs: &[FieldDef]) -> std::io::Result<()> {
        if let Some(header) = self.encoder.header(defs) {
            let mut w = self.writer.lock().expect("output writer poisoned");
            writeln!(w, "{header}")?;
        }
        Ok(())
    }

    /// Encode and write one record.
    pub fn write_record(&self, fs: &FieldSet) -> std::io::Result<()> {
        let line = self.encoder.encode(fs);
        let mut w = self.writer.lock().expect("output writer poisoned");
        writeln!(w, "{line}")?;
        self.records.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn flush(&self) -> std::io::Result<()> {
        self.writer.lock().expect("output writer poisoned").flush()
    }

    pub fn records_written(&self) -> u64 {
        self.records.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn sample() -> FieldSet {
        let mut fs = FieldSet::new();
        fs.add_str("classification", "synack");
        fs.add_uint("sport", 443);
        fs.add_bool("success", true);
        fs.add_null("icmp_responder");
        fs
    }

    #[test]
    fn test_json_preserves_order_and_types() {
        let line = JsonEncoder.encode(&sample());
        let expected =
            r#"{"classification":"synack","sport":443,"success":true,"icmp_responder":null}"#;
        assert_eq!(line, expected);
    }

    #[test]
    fn test_json_binary_is_base64() {
        let mut fs = FieldSet::new();
        fs.add_binary("rdata", vec![0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(JsonEncoder.encode(&fs), r#"{"rdata":"3q2+7w=="}"#);
    }

    #[test]
    fn test_json_repeated_nests() {
        let mut inner = FieldSet::new();
        inner.add_str("rdata", "93.184.216.34");
        let mut fs = FieldSet::new();
        fs.add_repeated("dns_answers", vec![inner]);
        assert_eq!(
            JsonEncoder.encode(&fs),
            r#"{"dns_answers":[{"rdata":"93.184.216.34"}]}"#
        );
    }

    #[test]
    fn test_csv_row_and_header() {
        let defs = [
            FieldDef { name: "classification", ftype: FieldType::String, desc: "" },
            FieldDef { name: "sport", ftype: FieldType::Int, desc: "" },
            FieldDef { name: "success", ftype: FieldType::Bool, desc: "" },
            FieldDef { name: "icmp_responder", ftype: FieldType::String, desc: "" },
        ];
        assert_eq!(
            CsvEncoder.header(&defs).unwrap(),
            "classification,sport,success,icmp_responder"
        );
        assert_eq!(CsvEncoder.encode(&sample()), "synack,443,true,");
    }

    #[test]
    fn test_csv_escapes_commas_and_quotes() {
        let mut fs = FieldSet::new();
        fs.add_str("s", "a,b");
        fs.add_str("q", "say \"hi\"");
        assert_eq!(CsvEncoder.encode(&fs), "\"a,b\",\"say \"\"hi\"\"\"");
    }

    #[test]
    fn test_set_str_replaces_in_place() {
        let mut fs = sample();
        fs.set_str("classification", "rst");
        assert_eq!(fs.get("classification"), Some(&Value::Str("rst".into())));
        assert_eq!(fs.len(), 4, "replacement must not append");
    }

    #[test]
    fn test_sink_counts_and_writes() {
        struct SharedBuf(Arc<Mutex<Vec<u8>>>);
        impl Write for SharedBuf {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }
        let buf = Arc::new(Mutex::new(Vec::new()));
        let sink = OutputSink::new(Box::new(JsonEncoder), Box::new(SharedBuf(Arc::clone(&buf))));
        sink.write_record(&sample()).unwrap();
        sink.write_record(&sample()).unwrap();
        assert_eq!(sink.records_written(), 2);
        let data = String::from_utf8(buf.lock().unwrap().clone()).unwrap();
        assert_eq!(data.lines().count(), 2);
    }
}
