//! Tests for the plugin registry and the builtin plugins.

use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use cyclemetric::plugin::{json_rows, parse_config, RecordSender, Registry};
use cyclemetric::task::{CycleMode, CycleWindow, PluginConfig};
use cyclemetric::time_windows::CycleType;
use cyclemetric::types::Record;

fn window(begin: i64, end: i64) -> CycleWindow {
    CycleWindow {
        metric_name: "m".to_string(),
        begin,
        end,
        cycle: CycleType::Day,
        mode: CycleMode::Always,
        last_finish_time: 0,
    }
}

async fn collect(registry: &Registry, cfg: serde_json::Value, key: &str, w: &CycleWindow) -> Vec<Record> {
    let collector = registry
        .collector(&PluginConfig::new(json_rows::NAME, cfg))
        .unwrap();
    let (tx, mut rx) = mpsc::channel(16);
    let sender = RecordSender::new(tx, CancellationToken::new());
    collector.run(key, w, &sender).await.unwrap();
    drop(sender);
    let mut out = Vec::new();
    while let Some(record) = rx.recv().await {
        out.push(record);
    }
    out
}

#[test]
fn test_builtin_catalog_lists_every_stage() {
    let registry = Registry::with_builtins();
    let names: Vec<(&str, String)> = registry
        .catalog()
        .into_iter()
        .map(|(stage, name, _)| (stage, name))
        .collect();
    for expected in [
        ("collector", "json_rows"),
        ("filter", "label_default"),
        ("filter", "require_labels"),
        ("aggregator", "count"),
        ("aggregator", "two_field_sum_rate"),
        ("output", "log"),
    ] {
        assert!(
            names.contains(&(expected.0, expected.1.to_string())),
            "{expected:?} missing from {names:?}"
        );
    }
}

#[test]
fn test_unknown_plugins_are_reported_by_name() {
    let registry = Registry::with_builtins();
    let err = registry
        .aggregator(&PluginConfig::named("median"))
        .err()
        .unwrap();
    assert!(err.to_string().contains("median"));
    assert!(registry.filter(&PluginConfig::named("nope")).is_err());
    assert!(registry.output("nope", &window(0, 1)).is_err());
}

#[test]
fn test_bad_plugin_config_is_rejected() {
    let registry = Registry::with_builtins();
    let missing_fields = PluginConfig::new("two_field_sum_rate", json!({"output_key": "r"}));
    assert!(registry.aggregator(&missing_fields).is_err());

    let bad_operator = PluginConfig::new(
        "count",
        json!({"rules": [{"field": "a", "operator": "greater"}]}),
    );
    assert!(registry.aggregator(&bad_operator).is_err());
}

#[test]
fn test_parse_config_defaults_on_blank_input() {
    #[derive(Debug, Default, serde::Deserialize, PartialEq)]
    struct Cfg {
        n: u32,
    }
    assert_eq!(parse_config::<Cfg>(b"").unwrap(), Cfg::default());
    assert_eq!(parse_config::<Cfg>(b"  \n").unwrap(), Cfg::default());
    assert_eq!(parse_config::<Cfg>(br#"{"n": 4}"#).unwrap(), Cfg { n: 4 });
    assert!(parse_config::<Cfg>(b"{").is_err());
}

#[tokio::test]
async fn test_json_rows_keys_in_first_seen_order() {
    let registry = Registry::with_builtins();
    let collector = registry
        .collector(&PluginConfig::new(
            json_rows::NAME,
            json!({"rows": [{"user": "b"}, {"user": "a"}, {"user": "b"}, {"other": 1}]}),
        ))
        .unwrap();
    assert_eq!(collector.keys().await.unwrap(), vec!["b", "a"]);

    let explicit = registry
        .collector(&PluginConfig::new(
            json_rows::NAME,
            json!({"keys": ["z"], "rows": [{"user": "b"}]}),
        ))
        .unwrap();
    assert_eq!(explicit.keys().await.unwrap(), vec!["z"]);
}

#[tokio::test]
async fn test_json_rows_reads_file_and_filters_by_window() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rows.json");
    std::fs::write(
        &path,
        json!([
            {"id": 1, "user": "u", "ts": 100, "amount": 2.5},
            {"id": 2, "user": "u", "ts": 199},
            {"id": 3, "user": "u", "ts": 200},
            {"id": 4, "user": "v", "ts": 150}
        ])
        .to_string(),
    )
    .unwrap();
    let registry = Registry::with_builtins();
    let cfg = json!({"path": path, "time_field": "ts"});

    let records = collect(&registry, cfg, "u", &window(100, 200)).await;
    let ids: Vec<&str> = records.iter().map(Record::fingerprint).collect();
    assert_eq!(ids, vec!["1", "2"]);
    assert_eq!(records[0].field("amount"), Some(2.5));
    assert_eq!(records[0].label("amount"), Some("2.5"));
}

#[tokio::test]
async fn test_label_filters() {
    let registry = Registry::with_builtins();
    let defaults = registry
        .filter(&PluginConfig::new(
            "label_default",
            json!({"defaults": {"region": "unknown"}}),
        ))
        .unwrap();
    let require = registry
        .filter(&PluginConfig::new("require_labels", json!({"labels": ["region"]})))
        .unwrap();

    let mut bare = Record::new("1");
    assert!(require.run("k", &mut bare).await.is_err());
    defaults.run("k", &mut bare).await.unwrap();
    assert_eq!(bare.label("region"), Some("unknown"));
    require.run("k", &mut bare).await.unwrap();

    let mut tagged = Record::new("2").with_label("region", "eu");
    defaults.run("k", &mut tagged).await.unwrap();
    assert_eq!(tagged.label("region"), Some("eu"));
}

#[tokio::test]
async fn test_sum_rate_through_registry() {
    let registry = Registry::with_builtins();
    let mut agg = registry
        .aggregator(&PluginConfig::new(
            "two_field_sum_rate",
            json!({
                "field": {"molecular": "ok", "denominator": "total"},
                "output_key": "success",
                "power": 2
            }),
        ))
        .unwrap();
    agg.set_window(&window(0, 1)).unwrap();
    agg.run("k", &Record::new("1").with_field("ok", 3.0).with_field("total", 4.0))
        .await
        .unwrap();
    agg.run("k", &Record::new("2").with_field("ok", 1.0).with_field("total", 4.0))
        .await
        .unwrap();
    assert_eq!(agg.metric(), ("success".to_string(), 50.0));
}
