//! Tests for the Elasticsearch output.
//! Uses wiremock to stand in for the document API.

use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use wiremock::matchers::{body_partial_json, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use cyclemetric::es_http::EsHttp;
use cyclemetric::plugin::elasticsearch::{doc_id, index_for, EsOutput};
use cyclemetric::plugin::Output;
use cyclemetric::task::{CycleMode, CycleWindow};
use cyclemetric::time_windows::CycleType;
use cyclemetric::types::MetricOutput;

const BEGIN: i64 = 1_714_521_600;

fn window(last_finish_time: i64) -> CycleWindow {
    CycleWindow {
        metric_name: "Orders Daily".to_string(),
        begin: BEGIN,
        end: BEGIN + 86_400,
        cycle: CycleType::Day,
        mode: CycleMode::InnerDay,
        last_finish_time,
    }
}

fn output(server: &MockServer, window: &CycleWindow) -> EsOutput {
    let http = EsHttp::new(server.uri(), "elastic", "changeme", Duration::from_secs(5)).unwrap();
    let mut out = EsOutput::new(http, "cm");
    out.set_window(window).unwrap();
    out
}

fn doc_path(key: &str) -> String {
    format!("/cm-metric-orders-daily/_doc/{}", doc_id(BEGIN, key))
}

#[test]
fn test_index_and_doc_naming() {
    assert_eq!(index_for("CM", "Orders Daily"), "cm-metric-orders-daily");
    assert_eq!(index_for("cm", "a/b_c"), "cm-metric-a-b_c");
    assert_eq!(doc_id(10, "u1"), "10-7531");
    assert_ne!(doc_id(10, "a-b"), doc_id(10, "a_b"));
}

#[tokio::test]
async fn test_write_puts_document_per_key_and_window() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path(doc_path("u1")))
        .and(header_exists("authorization"))
        .and(body_partial_json(json!({
            "metric_name": "Orders Daily",
            "metric_key": "u1",
            "cycle": "day",
            "start_time": BEGIN,
            "end_time": BEGIN + 86_400,
            "values": {"cnt": 3.0}
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"result": "created"})))
        .expect(1)
        .mount(&server)
        .await;

    let out = output(&server, &window(0));
    let mut metric = MetricOutput::new("u1");
    metric.values.insert("cnt".to_string(), 3.0);
    out.write(&metric).await.unwrap();
    assert_eq!(out.index_name().await.unwrap(), "cm-metric-orders-daily");
}

#[tokio::test]
async fn test_write_surfaces_server_errors() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(500).set_body_string("disk full"))
        .mount(&server)
        .await;

    let out = output(&server, &window(0));
    let err = out.write(&MetricOutput::new("u1")).await.unwrap_err();
    let msg = format!("{err:#}");
    assert!(msg.contains("status=500"), "{msg}");
    assert!(msg.contains("disk full"), "{msg}");
}

#[tokio::test]
async fn test_exists_skips_lookup_before_todays_first_run() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let out = output(&server, &window(0));
    assert!(!out.exists("u1").await.unwrap());
}

#[tokio::test]
async fn test_exists_compares_mtime_with_last_finish() {
    let server = MockServer::start().await;
    let last_finish = Utc::now().timestamp();
    Mock::given(method("GET"))
        .and(path(doc_path("fresh")))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"_source": {"mtime": last_finish + 5}})),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(doc_path("stale")))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"_source": {"mtime": last_finish - 5}})),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(doc_path("missing")))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({"found": false})))
        .mount(&server)
        .await;

    let out = output(&server, &window(last_finish));
    assert!(out.exists("fresh").await.unwrap());
    assert!(!out.exists("stale").await.unwrap());
    assert!(!out.exists("missing").await.unwrap());
}
