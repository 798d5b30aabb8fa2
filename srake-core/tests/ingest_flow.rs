//! End-to-end ingest: archive in, rows and resumable state out.

use flate2::write::GzEncoder;
use flate2::Compression;
use srake_core::ingest::{self, IngestController, IngestOptions, RecordFilter};
use srake_core::store::{FileState, MetadataStore, SourceState};
use srake_core::Config;
use std::sync::atomic::Ordering;
use tempfile::TempDir;

/// Build a .tar.gz of (path, contents) members on disk.
fn write_archive(dir: &TempDir, name: &str, members: &[(&str, &str)]) -> std::path::PathBuf {
    let path = dir.path().join(name);
    let file = std::fs::File::create(&path).unwrap();
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    for (member, contents) in members {
        let bytes = contents.as_bytes();
        let mut header = tar::Header::new_gnu();
        header.set_size(bytes.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, member, bytes).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap();
    path
}

fn study_xml(accession: &str, title: &str, organism: &str) -> String {
    format!(
        r#"<STUDY_SET>
             <STUDY accession="{accession}" center_name="GEO">
               <DESCRIPTOR>
                 <STUDY_TITLE>{title}</STUDY_TITLE>
                 <STUDY_ABSTRACT>Sequencing of {organism}.</STUDY_ABSTRACT>
               </DESCRIPTOR>
             </STUDY>
           </STUDY_SET>"#
    )
}

fn sample_xml(entries: &[(&str, i64)]) -> String {
    let mut xml = String::from("<SAMPLE_SET>");
    for (accession, taxon) in entries {
        xml.push_str(&format!(
            r#"<SAMPLE accession="{accession}">
                 <SAMPLE_NAME><TAXON_ID>{taxon}</TAXON_ID></SAMPLE_NAME>
               </SAMPLE>"#
        ));
    }
    xml.push_str("</SAMPLE_SET>");
    xml
}

fn three_member_archive(dir: &TempDir) -> std::path::PathBuf {
    write_archive(
        dir,
        "dump.tar.gz",
        &[
            (
                "batch1/study_a.xml",
                &study_xml("SRP000001", "RNA-Seq of Homo sapiens liver", "Homo sapiens"),
            ),
            (
                "batch1/study_b.xml",
                &study_xml("SRP000002", "ChIP-Seq of Mus musculus brain", "Mus musculus"),
            ),
            // third member is malformed: mismatched end tag
            (
                "batch2/broken.xml",
                "<STUDY_SET><STUDY accession=\"SRP000003\"><DESCRIPTOR></STUDY></STUDY_SET>",
            ),
        ],
    )
}

#[test]
fn test_three_member_archive_with_malformed_entry() {
    let dir = TempDir::new().unwrap();
    let archive = three_member_archive(&dir);
    let mut store = MetadataStore::open(&dir.path().join("srake.db")).unwrap();

    let mut controller = IngestController::new(Config::default(), RecordFilter::default());
    let outcome = controller
        .run(&mut store, archive.to_str().unwrap(), &IngestOptions::default())
        .unwrap();

    assert_eq!(outcome.state, SourceState::Completed);
    assert_eq!(outcome.writes.inserted, 2);
    assert!(outcome.counts.warnings >= 1);
    assert_eq!(store.counts().unwrap().studies, 2);
}

#[test]
fn test_reingest_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let archive = three_member_archive(&dir);
    let mut store = MetadataStore::open(&dir.path().join("srake.db")).unwrap();

    let mut controller = IngestController::new(Config::default(), RecordFilter::default());
    let origin = archive.to_str().unwrap();
    controller
        .run(&mut store, origin, &IngestOptions::default())
        .unwrap();

    // completed source without --force is a no-op
    let second = controller
        .run(&mut store, origin, &IngestOptions::default())
        .unwrap();
    assert!(second.already_complete);
    assert_eq!(store.counts().unwrap().studies, 2);

    // --force reprocesses but accession conflicts keep row count stable
    let forced = controller
        .run(
            &mut store,
            origin,
            &IngestOptions {
                force: true,
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(forced.state, SourceState::Completed);
    assert_eq!(store.counts().unwrap().studies, 2);
    assert_eq!(forced.writes.inserted, 0);
    assert_eq!(forced.writes.ignored, 2);
}

#[test]
fn test_interrupt_and_resume_matches_uninterrupted_run() {
    let dir = TempDir::new().unwrap();
    let members: Vec<(String, String)> = (1..=4)
        .map(|i| {
            (
                format!("batch/study_{i}.xml"),
                study_xml(&format!("SRP00000{i}"), &format!("Study {i}"), "Homo sapiens"),
            )
        })
        .collect();
    let member_refs: Vec<(&str, &str)> = members
        .iter()
        .map(|(p, c)| (p.as_str(), c.as_str()))
        .collect();
    let archive = write_archive(&dir, "dump.tar.gz", &member_refs);
    let origin = archive.to_str().unwrap();

    // interrupted run: request cancellation once the first member landed
    let mut store = MetadataStore::open(&dir.path().join("srake.db")).unwrap();
    let mut controller = IngestController::new(Config::default(), RecordFilter::default());
    let cancel = controller.cancel_flag();
    controller.on_progress(move |update| {
        if update.records_done >= 1 {
            cancel.store(true, Ordering::Relaxed);
        }
    });
    let interrupted = controller
        .run(&mut store, origin, &IngestOptions::default())
        .unwrap();
    assert_eq!(interrupted.state, SourceState::Paused);
    let partial = store.counts().unwrap().studies;
    assert!(partial < 4, "cancellation should stop before the archive ends");

    // resume without --force
    let mut controller = IngestController::new(Config::default(), RecordFilter::default());
    let resumed = controller
        .run(&mut store, origin, &IngestOptions::default())
        .unwrap();
    assert_eq!(resumed.state, SourceState::Completed);
    assert!(resumed.files_skipped >= 1, "done members must fast-forward");

    // same rows as a single uninterrupted run
    assert_eq!(store.counts().unwrap().studies, 4);

    let statuses = ingest::status(&store).unwrap();
    assert_eq!(statuses.len(), 1);
    let status = &statuses[0];
    assert!(status.last_checkpoint.is_some(), "a checkpoint row must exist");
    assert!(
        status
            .files
            .iter()
            .all(|f| f.state != FileState::InProgress),
        "no file may stay in_progress after completion"
    );
    assert_eq!(status.records_done, 4);
}

#[test]
fn test_stats_only_with_taxon_filter_writes_nothing() {
    let dir = TempDir::new().unwrap();
    let human: Vec<(String, i64)> = (1..=10).map(|i| (format!("SRS0000{i:02}"), 9606)).collect();
    let other: Vec<(String, i64)> = (11..=15).map(|i| (format!("SRS0000{i:02}"), 10090)).collect();
    let mut entries: Vec<(&str, i64)> = human.iter().map(|(a, t)| (a.as_str(), *t)).collect();
    entries.extend(other.iter().map(|(a, t)| (a.as_str(), *t)));

    let xml = sample_xml(&entries);
    let archive = write_archive(&dir, "samples.tar.gz", &[("batch/samples.xml", &xml)]);

    let mut store = MetadataStore::open(&dir.path().join("srake.db")).unwrap();
    let mut filter = RecordFilter::default();
    filter.taxon_ids.insert(9606);

    let mut controller = IngestController::new(Config::default(), filter);
    let outcome = controller
        .run(
            &mut store,
            archive.to_str().unwrap(),
            &IngestOptions {
                stats_only: true,
                ..Default::default()
            },
        )
        .unwrap();

    assert_eq!(outcome.counts.accepted, 10);
    assert_eq!(outcome.counts.rejected, 5);
    assert_eq!(outcome.writes.inserted, 0);
    assert_eq!(store.counts().unwrap().samples, 0);

    // stats-only leaves no durable ingest progress either
    let statuses = ingest::status(&store).unwrap();
    assert!(statuses[0].files.is_empty());
}

#[test]
fn test_corrupt_archive_fails_source() {
    let dir = TempDir::new().unwrap();
    let archive = three_member_archive(&dir);
    let bytes = std::fs::read(&archive).unwrap();
    let truncated_path = dir.path().join("truncated.tar.gz");
    std::fs::write(&truncated_path, &bytes[..bytes.len() / 3]).unwrap();

    let mut store = MetadataStore::open(&dir.path().join("srake.db")).unwrap();
    let mut controller = IngestController::new(Config::default(), RecordFilter::default());
    let result = controller.run(
        &mut store,
        truncated_path.to_str().unwrap(),
        &IngestOptions::default(),
    );

    match result {
        Err(err) => assert_eq!(err.code(), "decode_corrupt"),
        Ok(outcome) => {
            // a truncation landing on a member boundary surfaces as an
            // errored file instead of a failed source
            assert!(outcome.files_errored >= 1, "{outcome:?}");
        }
    }
}
