//! Unit tests for artifact records.

use std::io::Cursor;

use rstest::rstest;
use serde_json::json;

use super::*;
use crate::model::ObjectMeta;

fn live_volume(name: &str) -> Volume {
    let mut volume = Volume::new(name, "longhorn-system", 1_073_741_824);
    volume.api_version.clear();
    volume.kind.clear();
    volume.metadata.resource_version = Some(String::from("42"));
    volume.metadata.uid = Some(String::from("0b7c"));
    volume.metadata.creation_timestamp = Some(String::from("2024-05-01T00:00:00Z"));
    volume.metadata.generation = Some(3);
    volume.metadata.managed_fields = vec![json!({"manager": "longhorn-manager"})];
    volume
        .metadata
        .extra
        .insert(String::from("selfLink"), json!("/apis/longhorn.io/v1beta2/x"));
    volume
        .metadata
        .extra
        .insert(String::from("finalizers"), json!(["longhorn.io"]));
    volume.spec.node_id = String::from("node-a");
    volume
}

fn write_all(volumes: Vec<Volume>, claims: Vec<PersistentVolumeClaim>) -> String {
    let mut writer = RecordWriter::new(Vec::new());
    for volume in volumes {
        writer.write_record(volume).expect("write volume");
    }
    for claim in claims {
        writer.write_record(claim).expect("write claim");
    }
    let bytes = writer.finish().expect("finish");
    String::from_utf8(bytes).expect("utf8 artifact")
}

fn read_all(artifact: &str) -> Vec<UntypedRecord> {
    RecordReader::new(Cursor::new(artifact.as_bytes()))
        .collect::<Result<Vec<_>, _>>()
        .expect("records")
}

#[test]
fn strip_removes_server_bookkeeping_only() {
    let mut volume = live_volume("pvc-1");
    strip(&mut volume);
    let meta = &volume.metadata;
    assert_eq!(meta.resource_version, None);
    assert_eq!(meta.uid, None);
    assert_eq!(meta.creation_timestamp, None);
    assert_eq!(meta.generation, None);
    assert!(meta.managed_fields.is_empty());
    assert!(!meta.extra.contains_key("selfLink"));
    assert_eq!(meta.extra.get("finalizers"), Some(&json!(["longhorn.io"])));
    assert_eq!(meta.name, "pvc-1");
}

#[test]
fn written_volume_reads_back_stripped_and_tagged() {
    let artifact = write_all(vec![live_volume("pvc-1")], Vec::new());
    assert!(artifact.ends_with("---\n"), "{artifact}");
    assert!(artifact.contains("1073741824"), "{artifact}");

    let records = read_all(&artifact);
    assert_eq!(records.len(), 1);
    let record = records.into_iter().next().expect("one record");
    assert_eq!(record.kind(), VOLUME_KIND);
    assert_eq!(record.name(), "pvc-1");
    assert_eq!(record.namespace(), "longhorn-system");

    let decoded = record.into_volume().expect("volume");
    let mut expected = live_volume("pvc-1");
    strip(&mut expected);
    expected.tag();
    assert_eq!(decoded, expected);
}

#[test]
fn records_keep_stream_order() {
    let claim = PersistentVolumeClaim::new("data", "apps", "pvc-1", Some("longhorn"));
    let artifact = write_all(
        vec![live_volume("pvc-1"), live_volume("pvc-2")],
        vec![claim],
    );
    let records = read_all(&artifact);
    let summary: Vec<(usize, &str, &str)> = records
        .iter()
        .map(|record| (record.index(), record.kind(), record.name()))
        .collect();
    assert_eq!(
        summary,
        vec![
            (0, VOLUME_KIND, "pvc-1"),
            (1, VOLUME_KIND, "pvc-2"),
            (2, CLAIM_KIND, "data"),
        ]
    );
}

#[test]
fn writer_counts_records() {
    let mut writer = RecordWriter::new(Vec::new());
    assert_eq!(writer.records_written(), 0);
    writer
        .write_record(PersistentVolumeClaim::new("a", "apps", "pvc-1", None))
        .expect("write");
    assert_eq!(writer.records_written(), 1);
}

#[rstest]
#[case::leading_separator("---\nkind: Volume\nmetadata:\n  name: a\nspec:\n  size: '1'\n---\n")]
#[case::blank_documents("\n---\n---\nkind: Volume\nmetadata:\n  name: a\nspec:\n  size: '1'\n---\n\n")]
#[case::no_trailing_separator("kind: Volume\nmetadata:\n  name: a\nspec:\n  size: '1'\n")]
#[case::null_document("~\n---\nkind: Volume\nmetadata:\n  name: a\nspec:\n  size: '1'\n---\n")]
fn empty_documents_are_skipped(#[case] artifact: &str) {
    let records = read_all(artifact);
    assert_eq!(records.len(), 1, "{records:?}");
    let volume = records
        .into_iter()
        .next()
        .expect("one record")
        .into_volume()
        .expect("volume");
    assert_eq!(volume.spec.size, 1);
}

#[test]
fn empty_stream_yields_nothing() {
    assert!(read_all("").is_empty());
    assert!(read_all("---\n---\n").is_empty());
}

#[rstest]
#[case("'4096'", 4096)]
#[case("4096", 4096)]
#[case("' 4096 '", 4096)]
fn volume_size_is_normalised(#[case] raw: &str, #[case] expected: u64) {
    let artifact = format!("kind: Volume\nmetadata:\n  name: a\nspec:\n  size: {raw}\n---\n");
    let volume = read_all(&artifact)
        .into_iter()
        .next()
        .expect("record")
        .into_volume()
        .expect("volume");
    assert_eq!(volume.spec.size, expected);
}

#[test]
fn unparsable_size_is_a_decode_error() {
    let artifact = "kind: Volume\nmetadata:\n  name: a\nspec:\n  size: ten\n---\n";
    let err = read_all(artifact)
        .into_iter()
        .next()
        .expect("record")
        .into_volume()
        .expect_err("bad size");
    assert!(
        matches!(err, RecordError::Decode { index: 0, ref name, .. } if name == "a"),
        "{err}"
    );
}

#[test]
fn document_without_kind_is_rejected() {
    let mut reader = RecordReader::new(Cursor::new(&b"metadata:\n  name: a\n---\n"[..]));
    let err = reader.next().expect("item").expect_err("missing kind");
    assert_eq!(err, RecordError::MissingKind { index: 0 });
}

#[test]
fn invalid_yaml_reports_its_position() {
    let artifact = "kind: Volume\nmetadata: {name: a}\nspec: {size: '1'}\n---\nkind: [unclosed\n---\n";
    let mut reader = RecordReader::new(Cursor::new(artifact.as_bytes()));
    assert!(reader.next().expect("first").is_ok());
    let err = reader.next().expect("second").expect_err("parse error");
    assert!(matches!(err, RecordError::Parse { index: 1, .. }), "{err}");
}

#[test]
fn claim_record_does_not_decode_as_volume() {
    let artifact = write_all(
        Vec::new(),
        vec![PersistentVolumeClaim::new("data", "apps", "pvc-1", None)],
    );
    let record = read_all(&artifact).into_iter().next().expect("record");
    let err = record.clone().into_volume().expect_err("wrong kind");
    assert!(matches!(err, RecordError::Decode { .. }), "{err}");

    let claim = record.into_claim().expect("claim");
    assert_eq!(claim.spec.volume_name, "pvc-1");
    assert_eq!(claim.api_version, "v1");
    assert_eq!(
        claim.metadata,
        ObjectMeta::named("data", "apps"),
        "claim metadata should survive unchanged"
    );
}
