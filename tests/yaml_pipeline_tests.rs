//! YAML pipelines over files on the local filesystem.

use std::fs;
use std::path::PathBuf;

use rowforge::core::config::{BackendKind, EngineConfig};
use rowforge::core::types::Scalar;
use rowforge::{parse_yaml_pipeline, Plan};

fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("rowforge-{name}-{}", std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).expect("create scratch dir");
    dir
}

fn write_orders(dir: &PathBuf, rows: usize) -> String {
    let mut text = String::from("id,price,qty\n");
    for i in 0..rows {
        // every fifth price is missing
        let price = if i % 5 == 0 { String::new() } else { format!("{}.5", i % 10) };
        text.push_str(&format!("{i},{price},{}\n", i % 4 + 1));
    }
    let path = dir.join("orders.csv");
    fs::write(&path, text).expect("write orders");
    path.to_string_lossy().into_owned()
}

fn pipeline(input: &str, sink: &str) -> String {
    format!(
        r#"
config:
  max_parallel_tasks: 3
  partition_bytes: 64
  backend: local
steps:
  - op: csv
    uris: ["{input}"]
    schema:
      - {{ name: id,    type: int64 }}
      - {{ name: price, type: float64, nullable: true }}
      - {{ name: qty,   type: int64 }}
  - op: map
    udf: "id, price * qty AS total"
  - op: resolve
    code: TypeError
    udf: "id, 0.0 AS total"
  - op: filter
    udf: "total >= 0"
  - op: {sink}
"#
    )
}

#[test]
fn yaml_pipeline_reads_every_row_once_across_byte_ranges() {
    let dir = scratch_dir("ranges");
    let input = write_orders(&dir, 40);
    let parsed = parse_yaml_pipeline(&pipeline(&input, "collect")).unwrap();

    let mut cfg = EngineConfig::default();
    parsed.config.apply_to(&mut cfg);
    assert_eq!(cfg.backend, BackendKind::Local);
    assert_eq!(cfg.partition_bytes, 64);

    let mut plan = Plan::from_logical(&parsed.plan, cfg);
    let rs = plan.execute().unwrap().clone();
    let ids: Vec<i64> = rs.rows.iter().filter_map(|r| r[0].as_i64()).collect();
    assert_eq!(ids, (0..40).collect::<Vec<_>>());
    assert!(plan.diagnostics().stages[0].partitions > 1);

    // missing prices were resolved to zero
    assert_eq!(rs.rows[0][1], Scalar::F64(0.0));
    assert_eq!(plan.exception_counts().get("TypeError"), Some(&8));
    assert!(plan.unresolved().is_empty());

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn yaml_pipeline_writes_csv_parts() {
    let dir = scratch_dir("sink");
    let input = write_orders(&dir, 12);
    let out = dir.join("out");
    let sink = format!("to_csv\n    uri: \"{}\"", out.to_string_lossy());
    let parsed = parse_yaml_pipeline(&pipeline(&input, &sink)).unwrap();

    let mut cfg = EngineConfig::default();
    parsed.config.apply_to(&mut cfg);
    let mut plan = Plan::from_logical(&parsed.plan, cfg);
    let rs = plan.execute().unwrap();
    assert_eq!(rs.row_count, 12);

    let mut lines = 0;
    for uri in &rs.written {
        let text = fs::read_to_string(uri).unwrap();
        assert!(text.starts_with("id,total\n"));
        lines += text.lines().count() - 1;
    }
    assert_eq!(lines, 12);

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn invalid_yaml_is_rejected() {
    let err = parse_yaml_pipeline("steps:\n  - op: map\n    udf: \"x AS x\"\n  - op: collect\n").unwrap_err();
    assert!(err.to_string().contains("csv or parallelize"));
}
