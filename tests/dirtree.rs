use std::fs;
use std::sync::Arc;

use assert_matches::assert_matches;
use camino::{Utf8Path, Utf8PathBuf};
use serde_json::{Value, json};

use kira_dataset_store::backend::{Backend, BackendArgs, SharedBackend, backends};
use kira_dataset_store::column::{DataSink, DataSource};
use kira_dataset_store::config::Settings;
use kira_dataset_store::dataset::Dataset;
use kira_dataset_store::datatype::lookup;
use kira_dataset_store::dirtree::DirTree;
use kira_dataset_store::error::KiraError;
use kira_dataset_store::item::DataItem;
use kira_dataset_store::provenance::Provenance;
use kira_dataset_store::space::{DataSpace, Hierarchy};
use kira_dataset_store::tree::{Criterion, TreeLayout, TreeState};

fn temp_root() -> (tempfile::TempDir, Utf8PathBuf) {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    (temp, root)
}

fn write_files(dir: &Utf8Path, names: &[&str]) {
    fs::create_dir_all(dir.as_std_path()).unwrap();
    for name in names {
        fs::write(dir.join(name).as_std_path(), name.as_bytes()).unwrap();
    }
}

fn layout() -> TreeLayout {
    let space = DataSpace::clinical();
    let hierarchy = Hierarchy::new(&space, &["subject", "session"]).unwrap();
    TreeLayout::new(space, hierarchy)
}

fn dataset(root: &Utf8Path) -> Dataset {
    let backend: SharedBackend = Arc::new(DirTree::new(root.to_path_buf()));
    Dataset::new("study", "default", backend, layout())
}

fn provenance(value: Value) -> Provenance {
    match value {
        Value::Object(map) => Provenance::new(map),
        other => panic!("not an object: {other}"),
    }
}

fn populated_root() -> (tempfile::TempDir, Utf8PathBuf) {
    let (temp, root) = temp_root();
    write_files(&root.join("study/01/01_MR1"), &["T1w.nii.gz", "T1w.json"]);
    write_files(&root.join("study/01/01_MR2"), &["T1w.nii.gz"]);
    write_files(&root.join("study/02/02_MR1"), &["T1w.nii.gz"]);
    fs::create_dir_all(root.join("study/.hidden/x").as_std_path()).unwrap();
    (temp, root)
}

#[test]
fn discovers_rows_from_directories() {
    let (_temp, root) = populated_root();
    let mut dataset = dataset(&root);
    assert_eq!(dataset.state(), TreeState::Unpopulated);

    let session = dataset.frequency("session").unwrap();
    let subject = dataset.frequency("subject").unwrap();
    assert_eq!(
        dataset.row_ids(session).unwrap(),
        vec![
            Some("01_MR1".to_string()),
            Some("01_MR2".to_string()),
            Some("02_MR1".to_string())
        ]
    );
    assert_eq!(
        dataset.row_ids(subject).unwrap(),
        vec![Some("01".to_string()), Some("02".to_string())]
    );
    assert_eq!(dataset.state(), TreeState::Populated);
    assert!(dataset.rejected_rows().is_empty());
}

#[test]
fn excluded_rows_are_left_out() {
    let (_temp, root) = populated_root();
    let subject = DataSpace::clinical().frequency("subject").unwrap();
    let backend: SharedBackend = Arc::new(DirTree::new(root.clone()));
    let layout = layout().exclude(subject, Criterion::Ids(vec!["02".to_string()]));
    let mut dataset = Dataset::new("study", "default", backend, layout);

    let session = dataset.frequency("session").unwrap();
    assert_eq!(dataset.rows(session).unwrap().len(), 2);
    assert_matches!(
        dataset.row(session, Some("02_MR1")),
        Err(KiraError::RowNotFound { .. })
    );
}

#[test]
fn missing_dataset_directory_is_reported() {
    let (_temp, root) = temp_root();
    let mut dataset = dataset(&root);
    let session = dataset.frequency("session").unwrap();
    let err = dataset.rows(session).unwrap_err();
    assert_matches!(err, KiraError::DatasetNotFound(ref path) if path.ends_with("study"));
    assert_eq!(dataset.state(), TreeState::Unpopulated);
}

#[test]
fn side_car_header_is_read() {
    let (_temp, root) = temp_root();
    let row_dir = root.join("study/01/01_MR1");
    write_files(&row_dir, &["T1w.nii.gz"]);
    fs::write(
        row_dir.join("T1w.json").as_std_path(),
        br#"{"RepetitionTime": 2.3}"#,
    )
    .unwrap();
    let mut dataset = dataset(&root);
    let session = dataset.frequency("session").unwrap();
    dataset
        .add_source(
            DataSource::new("t1w", "T1w", lookup("nifti_gz_x").unwrap(), session)
                .with_header_value("RepetitionTime", json!(2.3)),
            false,
        )
        .unwrap();

    let row = dataset.row(session, Some("01_MR1")).unwrap();
    let locations = dataset.get_item_locations(row, "t1w").unwrap();
    assert_eq!(
        locations,
        vec![row_dir.join("T1w.nii.gz"), row_dir.join("T1w.json")]
    );
}

#[test]
fn stored_item_is_renamed_to_sink_path() {
    let (_temp, root) = populated_root();
    let work = root.join("work");
    write_files(&work, &["mask_out.nii.gz"]);
    let mut dataset = dataset(&root);
    let session = dataset.frequency("session").unwrap();
    dataset
        .add_sink(
            DataSink::new("brain", lookup("nifti_gz").unwrap(), session).with_pipeline("bet"),
            false,
        )
        .unwrap();
    let row = dataset.row(session, Some("01_MR1")).unwrap();
    assert!(!dataset.item(row, "brain").unwrap().exists());

    let record = provenance(json!({"pipeline": "bet", "frac": 0.5}));
    let stored = dataset
        .put_item(row, "brain", &[work.join("mask_out.nii.gz")], Some(&record))
        .unwrap();

    let row_dir = root.join("study/01/01_MR1");
    assert_eq!(stored.locations, vec![row_dir.join("brain.nii.gz")]);
    assert!(stored.checksums.contains_key("brain.nii.gz"));
    assert!(row_dir.join("brain.__prov__.json").as_std_path().is_file());

    let item = dataset.item(row, "brain").unwrap();
    assert!(item.exists());
    assert_eq!(item.path(), "brain");
    assert_eq!(
        dataset.get_item_locations(row, "brain").unwrap(),
        vec![row_dir.join("brain.nii.gz")]
    );
    assert_eq!(dataset.provenance(row, "brain").unwrap(), Some(record.clone()));

    // Derived files never show up as rows or as extra items.
    dataset.refresh().unwrap();
    assert_eq!(dataset.rows(session).unwrap().len(), 3);
}

#[test]
fn staleness_follows_recorded_provenance() {
    let (_temp, root) = populated_root();
    let work = root.join("work");
    write_files(&work, &["out.nii.gz"]);
    let mut dataset = dataset(&root);
    let session = dataset.frequency("session").unwrap();
    dataset
        .add_source(DataSource::new("t1w", "T1w", lookup("nifti_gz").unwrap(), session), false)
        .unwrap();
    dataset
        .add_sink(DataSink::new("brain", lookup("nifti_gz").unwrap(), session), false)
        .unwrap();
    let row = dataset.row(session, Some("01_MR1")).unwrap();

    let recorded = provenance(json!({"frac": 0.5, "inputs": ["t1w"]}));
    assert!(dataset.is_stale(row, "brain", &recorded, &[], &[]).unwrap());
    dataset
        .put_item(row, "brain", &[work.join("out.nii.gz")], Some(&recorded))
        .unwrap();

    let same = provenance(json!({"inputs": ["t1w"], "frac": 0.5}));
    assert!(!dataset.is_stale(row, "brain", &same, &[], &[]).unwrap());
    let changed = provenance(json!({"frac": 0.6, "inputs": ["t1w"]}));
    assert!(dataset.is_stale(row, "brain", &changed, &[], &[]).unwrap());
    assert!(!dataset.is_stale(row, "brain", &changed, &[], &["frac"]).unwrap());

    // Acquired data carries no provenance.
    assert!(dataset.is_stale(row, "t1w", &same, &[], &[]).unwrap());
}

#[test]
fn unreadable_provenance_only_affects_its_item() {
    let (_temp, root) = populated_root();
    let row_dir = root.join("study/01/01_MR1");
    let work = root.join("work");
    write_files(&work, &["a.nii.gz", "b.nii.gz"]);
    write_files(&row_dir, &["notes.txt"]);
    fs::write(row_dir.join("notes.__prov__.json").as_std_path(), b"{\"pipeline\": ").unwrap();
    let mut dataset = dataset(&root);
    let session = dataset.frequency("session").unwrap();
    for name in ["brain", "mask"] {
        dataset
            .add_sink(DataSink::new(name, lookup("nifti_gz").unwrap(), session), false)
            .unwrap();
    }
    dataset
        .add_source(
            DataSource::new("notes", "notes", lookup("text_file").unwrap(), session),
            false,
        )
        .unwrap();
    let row = dataset.row(session, Some("01_MR1")).unwrap();
    let record = provenance(json!({"pipeline": "bet"}));
    dataset.put_item(row, "brain", &[work.join("a.nii.gz")], Some(&record)).unwrap();
    dataset.put_item(row, "mask", &[work.join("b.nii.gz")], Some(&record)).unwrap();
    fs::write(
        row_dir.join("mask.__prov__.json").as_std_path(),
        br#"{"__prov_version__": "0.1", "pipeline": "bet"}"#,
    )
    .unwrap();

    dataset.refresh().unwrap();
    let row = dataset.row(session, Some("01_MR1")).unwrap();
    assert_eq!(dataset.provenance(row, "brain").unwrap(), Some(record));
    assert_eq!(
        dataset.get_item_locations(row, "mask").unwrap(),
        vec![row_dir.join("mask.nii.gz")]
    );
    assert_matches!(
        dataset.provenance(row, "mask"),
        Err(KiraError::StaleFormat { ref found, .. }) if found == "0.1"
    );
    assert_matches!(
        dataset.provenance(row, "notes"),
        Err(KiraError::InvalidProvenance(_))
    );
}

#[test]
fn fields_are_coerced_and_kept_with_provenance() {
    let (_temp, root) = populated_root();
    let mut dataset = dataset(&root);
    let session = dataset.frequency("session").unwrap();
    dataset
        .add_sink(DataSink::new("volume", lookup("integer").unwrap(), session), false)
        .unwrap();
    dataset
        .add_source(
            DataSource::new("t1w", "T1w", lookup("nifti_gz").unwrap(), session),
            false,
        )
        .unwrap();
    let row = dataset.row(session, Some("01_MR2")).unwrap();
    assert_eq!(dataset.get_field_value(row, "volume").unwrap(), None);

    let record = provenance(json!({"pipeline": "stats"}));
    dataset
        .put_field(row, "volume", json!("1200"), Some(&record))
        .unwrap();
    assert_eq!(dataset.get_field_value(row, "volume").unwrap(), Some(json!(1200)));
    assert_eq!(dataset.provenance(row, "volume").unwrap(), Some(record));
    assert!(root.join("study/01/01_MR2/__fields__.json").as_std_path().is_file());

    let err = dataset
        .put_field(row, "volume", json!("large"), None)
        .unwrap_err();
    assert_matches!(err, KiraError::InvalidValue { .. });
    assert_matches!(
        dataset.put_field(row, "t1w", json!(1), None),
        Err(KiraError::NotASink(_))
    );
}

#[test]
fn summary_rows_store_under_escape_directory() {
    let (_temp, root) = populated_root();
    let work = root.join("work");
    write_files(&work, &["template.nii.gz"]);
    let mut dataset = dataset(&root);
    let subject = dataset.frequency("subject").unwrap();
    dataset
        .add_sink(DataSink::new("template", lookup("nifti_gz").unwrap(), subject), false)
        .unwrap();

    let row = dataset.row(subject, Some("01")).unwrap();
    let stored = dataset
        .put_item(row, "template", &[work.join("template.nii.gz")], None)
        .unwrap();
    assert_eq!(
        stored.locations,
        vec![root.join("study/01/__dataset__/template.nii.gz")]
    );

    dataset.refresh().unwrap();
    let session = dataset.frequency("session").unwrap();
    assert_eq!(dataset.rows(session).unwrap().len(), 3);
    let row = dataset.row(subject, Some("01")).unwrap();
    assert!(dataset.item(row, "template").unwrap().exists());
}

#[test]
fn directory_store_is_registered() {
    let (_temp, root) = populated_root();
    let args = BackendArgs {
        settings: Settings::with_cache_root(root.join("cache")),
        params: json!({"root": root.as_str()}),
    };
    let backend = backends().create("dirtree", &args).unwrap();
    assert_eq!(backend.name(), "dirtree");

    let mut dataset = Dataset::new("study", "default", backend, layout());
    let session = dataset.frequency("session").unwrap();
    assert_eq!(dataset.rows(session).unwrap().len(), 3);

    let err = backends()
        .create("dirtree", &BackendArgs { params: json!({}), ..args })
        .unwrap_err();
    assert_matches!(err, KiraError::ConfigParse(_));
}
