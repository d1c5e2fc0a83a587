// 该文件是 Jiejing （街景巡检） 项目的一部分。
// tests/unify.rs - 数据集合并测试
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

mod common;

use std::fs;

use jiejing::dataset::{
  DatasetUnifier, ManifestDocument, ShardError, ShardLocator, Split, UnifiedManifest, UnifyError,
  label::class_indices,
};

use common::{files_in, write_shard};

const BOX: &str = "0 0.5 0.5 0.2 0.2\n";

fn pothole_and_litter(parts: &std::path::Path) {
  write_shard(
    parts,
    "Pothole",
    "train",
    &[
      ("IMG_0001.jpg", Some(BOX)),
      ("IMG_0002.jpg", Some(BOX)),
      ("IMG_0003.png", Some("0 0.1 0.1 0.05 0.05\n0 0.9 0.9 0.05 0.05\n")),
    ],
  );
  write_shard(
    parts,
    "Litter",
    "train",
    &[("IMG_0001.jpg", Some(BOX)), ("IMG_0009.jpg", None)],
  );
}

fn unifier(root: &std::path::Path) -> DatasetUnifier {
  DatasetUnifier::new(
    ShardLocator::new(root.join("dataset_parts")),
    root.join("unified_dataset"),
  )
}

#[test]
fn pothole_and_litter_merge() {
  let dir = tempfile::tempdir().unwrap();
  pothole_and_litter(&dir.path().join("dataset_parts"));

  let report = unifier(dir.path())
    .unify_with_report(&["Pothole", "Litter"])
    .unwrap();
  let manifest = &report.manifest;
  assert!(!report.reused);
  assert_eq!(manifest.num_classes(), 2);
  assert_eq!(manifest.class_table.get(0), Some("Pothole"));
  assert_eq!(manifest.class_table.get(1), Some("Litter"));

  let train = manifest.split(Split::Train);
  assert_eq!(
    files_in(&train.images),
    [
      "Litter_IMG_0001.jpg",
      "Litter_IMG_0009.jpg",
      "Pothole_IMG_0001.jpg",
      "Pothole_IMG_0002.jpg",
      "Pothole_IMG_0003.png",
    ]
  );
  assert_eq!(files_in(&train.labels).len(), 4);
  assert_eq!(report.stats.images_copied, 5);
  assert_eq!(report.stats.labels_written, 4);
  assert_eq!(report.stats.labels_missing, 1);
  assert_eq!(report.tally[&Split::Train].images, 5);
  assert_eq!(report.tally[&Split::Valid].images, 0);

  let litter = fs::read_to_string(train.labels.join("Litter_IMG_0001.txt")).unwrap();
  assert_eq!(litter, "1 0.5 0.5 0.2 0.2\n");
  let pothole = fs::read_to_string(train.labels.join("Pothole_IMG_0003.txt")).unwrap();
  assert_eq!(pothole, "0 0.1 0.1 0.05 0.05\n0 0.9 0.9 0.05 0.05\n");

  let yaml = fs::read_to_string(&report.manifest_path).unwrap();
  assert!(yaml.contains("nc: 2"));
  assert!(yaml.contains("0: Pothole"));
  assert!(yaml.contains("1: Litter"));
}

#[test]
fn second_run_reuses_manifest() {
  let dir = tempfile::tempdir().unwrap();
  pothole_and_litter(&dir.path().join("dataset_parts"));
  let unifier = unifier(dir.path());

  let first = unifier.unify_with_report(&["Pothole", "Litter"]).unwrap();
  let first_bytes = fs::read(&first.manifest_path).unwrap();

  let second = unifier.unify_with_report(&["Pothole", "Litter"]).unwrap();
  let second_bytes = fs::read(&second.manifest_path).unwrap();

  assert!(second.reused);
  assert_eq!(second.stats.images_copied, 0);
  assert_eq!(second.stats.labels_written, 0);
  assert_eq!(first_bytes, second_bytes);
  assert_eq!(first.manifest, second.manifest);
}

#[test]
fn changed_categories_rebuild_from_scratch() {
  let dir = tempfile::tempdir().unwrap();
  pothole_and_litter(&dir.path().join("dataset_parts"));
  let unifier = unifier(dir.path());

  unifier.unify(&["Pothole", "Litter"]).unwrap();
  let report = unifier.unify_with_report(&["Litter"]).unwrap();

  assert!(!report.reused);
  assert_eq!(report.manifest.class_table.get(0), Some("Litter"));
  let train = report.manifest.split(Split::Train);
  assert_eq!(
    files_in(&train.images),
    ["Litter_IMG_0001.jpg", "Litter_IMG_0009.jpg"]
  );
  let label = fs::read_to_string(train.labels.join("Litter_IMG_0001.txt")).unwrap();
  assert!(label.starts_with("0 "));
}

#[test]
fn missing_shard_aborts_before_writing() {
  let dir = tempfile::tempdir().unwrap();
  pothole_and_litter(&dir.path().join("dataset_parts"));

  let err = unifier(dir.path())
    .unify(&["Pothole", "Flood"])
    .unwrap_err();
  match &err {
    UnifyError::Shard(ShardError::MissingShard { category, .. }) => {
      assert_eq!(category, "Flood")
    }
    other => panic!("unexpected error: {other}"),
  }
  assert!(err.to_string().contains("Flood"));
  assert!(
    UnifiedManifest::load(&dir.path().join("unified_dataset"))
      .unwrap()
      .is_none()
  );
}

#[test]
fn duplicate_categories_are_rejected() {
  let dir = tempfile::tempdir().unwrap();
  pothole_and_litter(&dir.path().join("dataset_parts"));
  assert!(matches!(
    unifier(dir.path()).unify(&["Litter", "Litter"]),
    Err(UnifyError::DuplicateCategory(_))
  ));
  assert!(matches!(
    unifier(dir.path()).unify::<&str>(&[]),
    Err(UnifyError::NoCategories)
  ));
}

#[test]
fn empty_labels_skipped_and_optional_splits_merged() {
  let dir = tempfile::tempdir().unwrap();
  let parts = dir.path().join("dataset_parts");
  write_shard(&parts, "Flood", "train", &[("a.jpg", Some("")), ("b.jpg", Some(BOX))]);
  write_shard(&parts, "Flood", "valid", &[("c.jpg", Some(BOX))]);
  write_shard(&parts, "Light", "train", &[("d.bmp", Some(BOX)), ("notes.md", None)]);
  write_shard(&parts, "Light", "test", &[("e.jpeg", Some("2 0.3 0.3 0.1 0.1\n"))]);

  let report = unifier(dir.path())
    .with_batch_size(1)
    .unify_with_report(&["Flood", "Light"])
    .unwrap();
  let manifest = &report.manifest;

  let train = manifest.split(Split::Train);
  assert_eq!(
    files_in(&train.images),
    ["Flood_a.jpg", "Flood_b.jpg", "Light_d.bmp"]
  );
  assert_eq!(files_in(&train.labels), ["Flood_b.txt", "Light_d.txt"]);
  assert_eq!(report.stats.labels_empty, 1);
  assert_eq!(files_in(&manifest.split(Split::Valid).images), ["Flood_c.jpg"]);
  assert_eq!(files_in(&manifest.split(Split::Test).images), ["Light_e.jpeg"]);

  // 所有标注的类别编号都在范围内
  for split in Split::ALL {
    let labels = &manifest.split(split).labels;
    for name in files_in(labels) {
      let content = fs::read_to_string(labels.join(name)).unwrap();
      for index in class_indices(&content) {
        let index = index.unwrap();
        assert!(index < manifest.num_classes());
      }
    }
  }
  let light = fs::read_to_string(manifest.split(Split::Test).labels.join("Light_e.txt")).unwrap();
  assert_eq!(light, "1 0.3 0.3 0.1 0.1\n");
}

#[test]
fn shard_without_train_split_is_rejected() {
  let dir = tempfile::tempdir().unwrap();
  let parts = dir.path().join("dataset_parts");
  write_shard(&parts, "Pothole", "valid", &[("a.jpg", Some(BOX))]);
  assert!(matches!(
    unifier(dir.path()).unify(&["Pothole"]),
    Err(UnifyError::Shard(ShardError::MissingTrainSplit { .. }))
  ));
}

#[test]
fn path_like_categories_are_rejected() {
  let dir = tempfile::tempdir().unwrap();
  pothole_and_litter(&dir.path().join("dataset_parts"));
  for bad in ["", "  ", ".", "..", "../Pothole", "a/b"] {
    match unifier(dir.path()).unify(&["Pothole", bad]) {
      Err(UnifyError::InvalidCategory(name)) => assert_eq!(name, bad),
      other => panic!("`{}` should be rejected, got {:?}", bad, other.map(|m| m.root)),
    }
  }
  assert!(!dir.path().join("unified_dataset").exists());
}

#[cfg(unix)]
#[test]
fn relative_output_root_is_written_as_absolute() {
  let dir = tempfile::tempdir().unwrap();
  pothole_and_litter(&dir.path().join("dataset_parts"));

  // 从当前工作目录出发的相对路径
  let cwd = std::env::current_dir().unwrap();
  let mut relative = std::path::PathBuf::new();
  for _ in cwd.components().skip(1) {
    relative.push("..");
  }
  let relative = relative
    .join(dir.path().strip_prefix("/").unwrap())
    .join("unified_dataset");
  assert!(relative.is_relative());

  let unifier = DatasetUnifier::new(ShardLocator::new(dir.path().join("dataset_parts")), &relative);
  assert!(unifier.output_root().is_absolute());

  let report = unifier.unify_with_report(&["Pothole", "Litter"]).unwrap();
  let document = ManifestDocument::read(&report.manifest_path).unwrap();
  assert!(document.path.is_absolute());
  assert!(document.train.is_absolute());
  assert!(document.val.is_absolute());
  assert!(document.test.is_absolute());
  assert_eq!(files_in(&document.train).len(), 5);
}

#[test]
fn same_stem_images_keep_both_images() {
  let dir = tempfile::tempdir().unwrap();
  let parts = dir.path().join("dataset_parts");
  write_shard(&parts, "Light", "train", &[("a.jpg", Some(BOX)), ("a.png", Some(BOX))]);

  let report = unifier(dir.path()).unify_with_report(&["Light"]).unwrap();
  let train = report.manifest.split(Split::Train);
  assert_eq!(files_in(&train.images), ["Light_a.jpg", "Light_a.png"]);
  // 两张图共用一个标注文件名
  assert_eq!(files_in(&train.labels), ["Light_a.txt"]);
  assert_eq!(report.stats.labels_written, 2);
}
