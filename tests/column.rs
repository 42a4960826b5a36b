use std::fs;
use std::sync::Arc;

use assert_matches::assert_matches;
use camino::{Utf8Path, Utf8PathBuf};

use kira_dataset_store::backend::SharedBackend;
use kira_dataset_store::column::{DataSink, DataSource};
use kira_dataset_store::dataset::Dataset;
use kira_dataset_store::datatype::lookup;
use kira_dataset_store::dirtree::DirTree;
use kira_dataset_store::error::KiraError;
use kira_dataset_store::item::{DataItem, Item};
use kira_dataset_store::space::{DataSpace, Hierarchy};
use kira_dataset_store::tree::{RowIndex, TreeLayout};

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

fn dataset(root: &Utf8Path) -> Dataset {
    let space = DataSpace::clinical();
    let hierarchy = Hierarchy::new(&space, &["subject", "session"]).unwrap();
    let backend: SharedBackend = Arc::new(DirTree::new(root.to_path_buf()));
    Dataset::new("study", "default", backend, TreeLayout::new(space, hierarchy))
}

fn session_row(dataset: &mut Dataset) -> RowIndex {
    let session = dataset.frequency("session").unwrap();
    dataset.row(session, Some("MR1")).unwrap()
}

fn file_names(item: &Item) -> Vec<String> {
    item.as_file_group()
        .unwrap()
        .file_names()
        .into_iter()
        .map(str::to_string)
        .collect()
}

#[test]
fn literal_path_matches_grouped_files() {
    let (_temp, root) = temp_root();
    write_files(&root.join("study/01/MR1"), &["T1w.nii.gz", "T1w.json"]);
    let mut dataset = dataset(&root);
    let session = dataset.frequency("session").unwrap();
    dataset
        .add_source(DataSource::new("t1w", "T1w", lookup("fileset").unwrap(), session), false)
        .unwrap();

    let row = session_row(&mut dataset);
    let item = dataset.item(row, "t1w").unwrap();
    assert_eq!(item.path(), "T1w");
    assert_eq!(file_names(item), vec!["T1w.json", "T1w.nii.gz"]);
}

#[test]
fn order_selects_among_regex_matches() {
    let (_temp, root) = temp_root();
    write_files(
        &root.join("study/01/MR1"),
        &["scan1.nii", "scan2.nii", "scan3.nii", "T1w.nii"],
    );
    let mut dataset = dataset(&root);
    let session = dataset.frequency("session").unwrap();
    let datatype = lookup("fileset").unwrap();
    dataset
        .add_source(
            DataSource::regex("second", "scan.*", datatype.clone(), session)
                .unwrap()
                .with_order(1),
            false,
        )
        .unwrap();
    dataset
        .add_source(
            DataSource::regex("sixth", "scan.*", datatype.clone(), session)
                .unwrap()
                .with_order(5),
            false,
        )
        .unwrap();
    dataset
        .add_source(DataSource::regex("any", "scan.*", datatype, session).unwrap(), false)
        .unwrap();

    let row = session_row(&mut dataset);
    assert_eq!(dataset.item(row, "second").unwrap().path(), "scan2");

    let err = dataset.item(row, "sixth").unwrap_err();
    assert_matches!(err, KiraError::IndexOutOfRange { order: 5, ref candidates, .. } if candidates.len() == 3);

    let err = dataset.item(row, "any").unwrap_err();
    assert_matches!(err, KiraError::AmbiguousMatch { ref matches, .. } if matches.len() == 3);
}

#[test]
fn unmatched_extra_file_does_not_change_match() {
    let (_temp, root) = temp_root();
    let row_dir = root.join("study/01/MR1");
    write_files(&row_dir, &["T1w.nii.gz", "T1w.json"]);
    let mut dataset = dataset(&root);
    let session = dataset.frequency("session").unwrap();
    dataset
        .add_source(
            DataSource::new("t1w", "T1w", lookup("nifti_gz_x").unwrap(), session),
            false,
        )
        .unwrap();
    let row = session_row(&mut dataset);
    let before = file_names(dataset.item(row, "t1w").unwrap());
    assert_eq!(before, file_names(dataset.item(row, "t1w").unwrap()));

    write_files(&row_dir, &["T1w.bak"]);
    dataset.refresh().unwrap();
    let row = session_row(&mut dataset);
    let after = file_names(dataset.item(row, "t1w").unwrap());
    assert_eq!(before, after);
    assert_eq!(after, vec!["T1w.nii.gz", "T1w.json"]);
}

#[test]
fn failed_match_names_row_and_criterion() {
    let (_temp, root) = temp_root();
    write_files(&root.join("study/01/MR1"), &["T2w.nii.gz"]);
    let mut dataset = dataset(&root);
    let session = dataset.frequency("session").unwrap();
    dataset
        .add_source(DataSource::new("t1w", "T1w", lookup("fileset").unwrap(), session), false)
        .unwrap();
    dataset
        .add_source(DataSource::new("fa", "FA", lookup("decimal").unwrap(), session), false)
        .unwrap();

    let row = session_row(&mut dataset);
    let err = dataset.item(row, "t1w").unwrap_err();
    assert_matches!(
        err,
        KiraError::NoMatch { ref row, ref criterion, ref candidates, .. }
            if row.contains("subject=01")
                && criterion.contains("'T1w'")
                && candidates.len() == 1
    );

    let err = dataset.item(row, "fa").unwrap_err();
    assert_matches!(err, KiraError::NoCandidates { .. });
}

#[test]
fn columns_only_apply_to_their_frequency() {
    let (_temp, root) = temp_root();
    write_files(&root.join("study/01/MR1"), &["T1w.nii.gz"]);
    let mut dataset = dataset(&root);
    let subject = dataset.frequency("subject").unwrap();
    dataset
        .add_sink(DataSink::new("template", lookup("fileset").unwrap(), subject), false)
        .unwrap();

    let row = session_row(&mut dataset);
    assert_matches!(
        dataset.item(row, "template"),
        Err(KiraError::WrongFrequency { .. })
    );

    let subject_row = dataset.row(subject, Some("01")).unwrap();
    let placeholder = dataset.item(subject_row, "template").unwrap();
    assert!(!placeholder.exists());
}

#[test]
fn column_names_are_unique_unless_overwritten() {
    let (_temp, root) = temp_root();
    let mut dataset = dataset(&root);
    let session = dataset.frequency("session").unwrap();
    let source = DataSource::new("t1w", "T1w", lookup("fileset").unwrap(), session);
    dataset.add_source(source.clone(), false).unwrap();
    assert_matches!(
        dataset.add_source(source.clone(), false),
        Err(KiraError::ColumnNameClash(_))
    );
    dataset.add_source(source, true).unwrap();
    dataset.remove_column("t1w").unwrap();
    assert_matches!(dataset.column("t1w"), Err(KiraError::UnknownColumn(_)));
}
