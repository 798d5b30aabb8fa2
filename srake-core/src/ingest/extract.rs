//! XML extraction: one archive member in, domain records out.
//!
//! A pull decoder walks the member; each recognized top-level element
//! (`STUDY`, `EXPERIMENT`, `SAMPLE`, `RUN`, `SUBMISSION`, `ANALYSIS`, with
//! or without their `…_SET` wrappers) is materialized as a small subtree
//! and mapped to a record. Unrecognized subtrees inside a record are kept
//! in the record's `metadata` blob, never dropped. A subtree is bounded by
//! one record's size, so memory stays flat regardless of member size.

use crate::ingest::filter::RecordFilter;
use crate::record::{
    non_empty, normalize_date, Analysis, AttributeBag, Experiment, Run, RunFile, Sample,
    SraRecord, Study, Submission,
};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::io::BufRead;
use tracing::{debug, warn};

/// Wrapper elements that are descended through, not captured.
const SET_WRAPPERS: &[&str] = &[
    "STUDY_SET",
    "EXPERIMENT_SET",
    "SAMPLE_SET",
    "RUN_SET",
    "SUBMISSION_SET",
    "ANALYSIS_SET",
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractCounts {
    /// Records successfully mapped from XML.
    pub records: u64,
    /// Mapped records that passed the filters and were emitted.
    pub accepted: u64,
    /// Mapped records dropped by a filter.
    pub rejected: u64,
    /// Malformed records, undecodable dates, and stream errors.
    pub warnings: u64,
}

impl ExtractCounts {
    pub fn absorb(&mut self, other: ExtractCounts) {
        self.records += other.records;
        self.accepted += other.accepted;
        self.rejected += other.rejected;
        self.warnings += other.warnings;
    }
}

/// Decode one member, emitting accepted records into `sink`.
///
/// XML malformations are counted as warnings and end the member early;
/// they never fail the ingest. IO failures underneath the decoder (gzip
/// CRC, truncated stream) surface as `DecodeCorrupt` so the caller can
/// mark the file errored and move on. Errors returned by `sink` (store
/// failures, cancellation) propagate.
pub fn extract_member<R: BufRead>(
    member_path: &str,
    reader: R,
    filter: &RecordFilter,
    mut sink: impl FnMut(SraRecord) -> crate::Result<()>,
) -> crate::Result<ExtractCounts> {
    let mut xml = Reader::from_reader(reader);
    let mut counts = ExtractCounts::default();
    let mut buf = Vec::new();

    loop {
        match xml.read_event_into(&mut buf) {
            Ok(Event::Start(start)) => {
                let name = element_name(&start);
                if SET_WRAPPERS.contains(&name.as_str()) {
                    // transparent container; keep pulling events
                } else if record_kind(&name) {
                    let start = start.to_owned();
                    match read_node(&mut xml, &start, false) {
                        Ok(node) => {
                            emit_node(&node, filter, &mut counts, &mut sink)?;
                        }
                        Err(err) => {
                            warn!(member = member_path, element = %name, error = %err, "skipping malformed record");
                            counts.warnings += 1;
                        }
                    }
                }
            }
            Ok(Event::Empty(start)) => {
                let name = element_name(&start);
                if record_kind(&name) {
                    let start = start.to_owned();
                    match read_node(&mut xml, &start, true) {
                        Ok(node) => emit_node(&node, filter, &mut counts, &mut sink)?,
                        Err(_) => counts.warnings += 1,
                    }
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(quick_xml::Error::Io(err)) => {
                return Err(crate::SrakeError::DecodeCorrupt {
                    member: member_path.to_string(),
                    message: err.to_string(),
                });
            }
            Err(err) => {
                warn!(member = member_path, error = %err, "malformed XML, abandoning member");
                counts.warnings += 1;
                break;
            }
        }
        buf.clear();
    }

    debug!(
        member = member_path,
        records = counts.records,
        accepted = counts.accepted,
        rejected = counts.rejected,
        warnings = counts.warnings,
        "member extracted"
    );
    Ok(counts)
}

fn record_kind(name: &str) -> bool {
    matches!(
        name,
        "STUDY" | "EXPERIMENT" | "SAMPLE" | "RUN" | "SUBMISSION" | "ANALYSIS"
    )
}

fn emit_node(
    node: &XmlNode,
    filter: &RecordFilter,
    counts: &mut ExtractCounts,
    sink: &mut impl FnMut(SraRecord) -> crate::Result<()>,
) -> crate::Result<()> {
    let record = match node.name.as_str() {
        "STUDY" => map_study(node, counts).map(SraRecord::Study),
        "EXPERIMENT" => map_experiment(node).map(SraRecord::Experiment),
        "SAMPLE" => map_sample(node).map(SraRecord::Sample),
        "RUN" => map_run(node, counts).map(SraRecord::Run),
        "SUBMISSION" => map_submission(node, counts).map(SraRecord::Submission),
        "ANALYSIS" => map_analysis(node).map(SraRecord::Analysis),
        _ => None,
    };

    let Some(record) = record else {
        counts.warnings += 1;
        return Ok(());
    };

    counts.records += 1;
    if filter.accepts(&record) {
        counts.accepted += 1;
        sink(record)?;
    } else {
        counts.rejected += 1;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Generic subtree reader
// ---------------------------------------------------------------------------

/// One materialized XML element.
#[derive(Debug, Clone, Default)]
pub struct XmlNode {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub text: String,
    pub children: Vec<XmlNode>,
}

impl XmlNode {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn child(&self, name: &str) -> Option<&XmlNode> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a XmlNode> {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// Descend a path of child element names.
    pub fn find(&self, path: &[&str]) -> Option<&XmlNode> {
        let mut node = self;
        for name in path {
            node = node.child(name)?;
        }
        Some(node)
    }

    /// Normalized text at a child path (empty and `NULL` map to absent).
    pub fn text_at(&self, path: &[&str]) -> Option<String> {
        self.find(path).and_then(|n| non_empty(&n.text))
    }

    /// JSON rendering used for the `metadata` blob.
    pub fn to_json(&self) -> serde_json::Value {
        if self.attrs.is_empty() && self.children.is_empty() {
            return serde_json::Value::String(self.text.trim().to_string());
        }
        let mut map = serde_json::Map::new();
        for (k, v) in &self.attrs {
            map.insert(format!("@{k}"), serde_json::Value::String(v.clone()));
        }
        let text = self.text.trim();
        if !text.is_empty() {
            map.insert("#text".into(), serde_json::Value::String(text.to_string()));
        }
        for child in &self.children {
            let rendered = child.to_json();
            match map.get_mut(&child.name) {
                Some(serde_json::Value::Array(items)) => items.push(rendered),
                Some(existing) => {
                    let prior = existing.take();
                    *existing = serde_json::Value::Array(vec![prior, rendered]);
                }
                None => {
                    map.insert(child.name.clone(), rendered);
                }
            }
        }
        serde_json::Value::Object(map)
    }
}

fn element_name(start: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(start.local_name().as_ref()).into_owned()
}

fn node_from_start(start: &BytesStart<'_>) -> XmlNode {
    let mut node = XmlNode {
        name: element_name(start),
        ..Default::default()
    };
    for attr in start.attributes().flatten() {
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map(|v| v.into_owned())
            .unwrap_or_default();
        node.attrs.push((key, value));
    }
    node
}

/// Read the subtree rooted at `start` into an [`XmlNode`].
fn read_node<R: BufRead>(
    xml: &mut Reader<R>,
    start: &BytesStart<'_>,
    empty: bool,
) -> Result<XmlNode, quick_xml::Error> {
    let mut node = node_from_start(start);
    if empty {
        return Ok(node);
    }

    let mut buf = Vec::new();
    loop {
        match xml.read_event_into(&mut buf)? {
            Event::Start(child) => {
                let child = child.to_owned();
                node.children.push(read_node(xml, &child, false)?);
            }
            Event::Empty(child) => {
                node.children.push(node_from_start(&child));
            }
            Event::Text(text) => {
                let text = text.unescape().unwrap_or_default();
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    if !node.text.is_empty() {
                        node.text.push(' ');
                    }
                    node.text.push_str(trimmed);
                }
            }
            Event::CData(cdata) => {
                let text = String::from_utf8_lossy(&cdata).into_owned();
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    if !node.text.is_empty() {
                        node.text.push(' ');
                    }
                    node.text.push_str(trimmed);
                }
            }
            Event::End(_) => break,
            Event::Eof => {
                return Err(quick_xml::Error::Io(std::sync::Arc::new(
                    std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!("EOF inside <{}>", node.name),
                    ),
                )));
            }
            _ => {}
        }
        buf.clear();
    }
    Ok(node)
}

// ---------------------------------------------------------------------------
// Record mappers
// ---------------------------------------------------------------------------

fn accession_of(node: &XmlNode) -> Option<String> {
    node.attr("accession")
        .and_then(non_empty)
        .or_else(|| node.text_at(&["IDENTIFIERS", "PRIMARY_ID"]))
}

/// Date attribute with warning accounting for unparseable values.
fn date_attr(node: &XmlNode, name: &str, counts: &mut ExtractCounts) -> Option<String> {
    let raw = node.attr(name).and_then(non_empty)?;
    match normalize_date(&raw) {
        Some(date) => Some(date),
        None => {
            counts.warnings += 1;
            None
        }
    }
}

/// Everything not in `known` goes to the metadata blob.
fn collect_metadata(
    node: &XmlNode,
    known: &[&str],
) -> serde_json::Map<String, serde_json::Value> {
    let mut metadata = serde_json::Map::new();
    for child in &node.children {
        if !known.contains(&child.name.as_str()) {
            metadata.insert(child.name.clone(), child.to_json());
        }
    }
    metadata
}

/// Parse `<X_ATTRIBUTES><X_ATTRIBUTE><TAG/><VALUE/><UNITS/>…` bags.
fn parse_attribute_bag(node: &XmlNode, container: &str, entry: &str) -> AttributeBag {
    let mut bag = AttributeBag::default();
    let Some(container) = node.child(container) else {
        return bag;
    };
    for attr in container.children_named(entry) {
        let Some(tag) = attr.text_at(&["TAG"]) else {
            continue;
        };
        let value = attr.text_at(&["VALUE"]).unwrap_or_default();
        let unit = attr.text_at(&["UNITS"]);
        bag.push(tag, value, unit);
    }
    bag
}

fn map_study(node: &XmlNode, counts: &mut ExtractCounts) -> Option<Study> {
    let accession = accession_of(node)?;
    let descriptor = node.child("DESCRIPTOR");
    let study_type = descriptor.and_then(|d| {
        d.child("STUDY_TYPE")
            .and_then(|t| t.attr("existing_study_type").and_then(non_empty).or_else(|| non_empty(&t.text)))
    });
    Some(Study {
        accession,
        title: descriptor.and_then(|d| d.text_at(&["STUDY_TITLE"])),
        abstract_text: descriptor.and_then(|d| d.text_at(&["STUDY_ABSTRACT"])),
        study_type,
        center_name: node.attr("center_name").and_then(non_empty),
        submission_date: date_attr(node, "submission_date", counts),
        attributes: parse_attribute_bag(node, "STUDY_ATTRIBUTES", "STUDY_ATTRIBUTE"),
        metadata: collect_metadata(node, &["IDENTIFIERS", "DESCRIPTOR", "STUDY_ATTRIBUTES"]),
    })
}

fn map_experiment(node: &XmlNode) -> Option<Experiment> {
    let accession = accession_of(node)?;
    let design = node.child("DESIGN");
    let library = design.and_then(|d| d.child("LIBRARY_DESCRIPTOR"));
    let library_layout = library
        .and_then(|l| l.child("LIBRARY_LAYOUT"))
        .and_then(|layout| layout.children.first())
        .map(|c| c.name.clone());

    // Platform is the name of the vendor element; the instrument model
    // lives underneath it.
    let platform_node = node.child("PLATFORM").and_then(|p| p.children.first());
    let platform = platform_node.map(|p| p.name.clone());
    let instrument_model = platform_node.and_then(|p| p.text_at(&["INSTRUMENT_MODEL"]));

    let mut sample_accessions = Vec::new();
    if let Some(descriptor) = design.and_then(|d| d.child("SAMPLE_DESCRIPTOR")) {
        if let Some(acc) = descriptor.attr("accession").and_then(non_empty) {
            sample_accessions.push(acc);
        }
        if let Some(pool) = descriptor.child("POOL") {
            for member in pool.children_named("MEMBER") {
                if let Some(acc) = member.attr("accession").and_then(non_empty) {
                    if !sample_accessions.contains(&acc) {
                        sample_accessions.push(acc);
                    }
                }
            }
        }
    }

    Some(Experiment {
        accession,
        study_accession: node
            .child("STUDY_REF")
            .and_then(|r| r.attr("accession").and_then(non_empty))
            .or_else(|| node.text_at(&["STUDY_REF", "IDENTIFIERS", "PRIMARY_ID"])),
        title: node.text_at(&["TITLE"]),
        library_strategy: library.and_then(|l| l.text_at(&["LIBRARY_STRATEGY"])),
        library_source: library.and_then(|l| l.text_at(&["LIBRARY_SOURCE"])),
        library_selection: library.and_then(|l| l.text_at(&["LIBRARY_SELECTION"])),
        library_layout,
        platform,
        instrument_model,
        sample_accessions,
        metadata: collect_metadata(node, &["IDENTIFIERS", "TITLE", "STUDY_REF", "DESIGN", "PLATFORM"]),
    })
}

fn map_sample(node: &XmlNode) -> Option<Sample> {
    let accession = accession_of(node)?;
    let name = node.child("SAMPLE_NAME");
    Some(Sample {
        accession,
        title: node.text_at(&["TITLE"]),
        description: node.text_at(&["DESCRIPTION"]),
        scientific_name: name.and_then(|n| n.text_at(&["SCIENTIFIC_NAME"])),
        taxon_id: name
            .and_then(|n| n.text_at(&["TAXON_ID"]))
            .and_then(|t| t.parse().ok()),
        attributes: parse_attribute_bag(node, "SAMPLE_ATTRIBUTES", "SAMPLE_ATTRIBUTE"),
        metadata: collect_metadata(
            node,
            &["IDENTIFIERS", "TITLE", "DESCRIPTION", "SAMPLE_NAME", "SAMPLE_ATTRIBUTES"],
        ),
    })
}

fn map_run(node: &XmlNode, counts: &mut ExtractCounts) -> Option<Run> {
    let accession = accession_of(node)?;
    let mut files = Vec::new();
    let file_containers = [&["DATA_BLOCK", "FILES"][..], &["FILES"][..]];
    for path in file_containers {
        if let Some(container) = node.find(path) {
            for file in container.children_named("FILE") {
                let Some(filename) = file.attr("filename").and_then(non_empty) else {
                    continue;
                };
                files.push(RunFile {
                    filename,
                    filetype: file.attr("filetype").and_then(non_empty),
                    checksum: file.attr("checksum").and_then(non_empty),
                });
            }
            break;
        }
    }

    let mut total_spots: Option<u64> = node.attr("total_spots").and_then(|v| v.parse().ok());
    let mut total_bases: Option<u64> = node.attr("total_bases").and_then(|v| v.parse().ok());
    // a run cannot have fewer bases than spots; violating pairs are
    // stored as NULL and counted, like unparseable dates
    if let (Some(spots), Some(bases)) = (total_spots, total_bases) {
        if bases < spots {
            counts.warnings += 1;
            total_spots = None;
            total_bases = None;
        }
    }

    Some(Run {
        accession,
        experiment_accession: node
            .child("EXPERIMENT_REF")
            .and_then(|r| r.attr("accession").and_then(non_empty)),
        run_date: date_attr(node, "run_date", counts),
        center: node
            .attr("run_center")
            .and_then(non_empty)
            .or_else(|| node.attr("center_name").and_then(non_empty)),
        total_spots,
        total_bases,
        files,
        metadata: collect_metadata(node, &["IDENTIFIERS", "EXPERIMENT_REF", "DATA_BLOCK", "FILES"]),
    })
}

fn map_submission(node: &XmlNode, counts: &mut ExtractCounts) -> Option<Submission> {
    // Submissions carry non-tiered accessions (SRA…); accept any non-empty.
    let accession = accession_of(node)?;
    Some(Submission {
        accession,
        center_name: node.attr("center_name").and_then(non_empty),
        lab_name: node.attr("lab_name").and_then(non_empty),
        submission_date: date_attr(node, "submission_date", counts),
        metadata: collect_metadata(node, &["IDENTIFIERS"]),
    })
}

fn map_analysis(node: &XmlNode) -> Option<Analysis> {
    let accession = accession_of(node)?;
    Some(Analysis {
        accession,
        title: node.text_at(&["TITLE"]),
        analysis_type: node
            .child("ANALYSIS_TYPE")
            .and_then(|t| t.children.first())
            .map(|c| c.name.clone()),
        study_accession: node
            .child("STUDY_REF")
            .and_then(|r| r.attr("accession").and_then(non_empty)),
        metadata: collect_metadata(node, &["IDENTIFIERS", "TITLE", "STUDY_REF", "ANALYSIS_TYPE"]),
    })
}
