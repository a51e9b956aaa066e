//! Handler-level integration tests for local-hit, peer-redirect, and filter
//! behavior. These go through `RequestHandler::handle_request()` with crafted
//! requests; no network privileges required.

mod common;

use common::*;
use hickory_proto::op::ResponseCode;
use hickory_proto::rr::RecordType;
use meridian_dns::geo::Point;
use meridian_dns::table::{LocalServices, ServiceTable};

#[tokio::test]
async fn test_local_service_answers_own_ip() {
    // LocalServiceSet = {"foo"}, base domain ".", question "foo. A".
    let local = LocalServices::new();
    local.add("foo");
    let handler = build_handler(test_config(), ServiceTable::new(), local, Vec::new());

    let response = execute_query(&handler, "foo.", RecordType::A, None).await;
    assert_authoritative_a(&response, OWN_IP);
}

#[tokio::test]
async fn test_redirect_prefers_site_closest_to_marker() {
    // Table: foo -> {1.1.1.1 @ (0,0), 2.2.2.2 @ (60,15)}; marker (59,14).
    let table = ServiceTable::new();
    table.replace(
        "foo",
        vec![site("1.1.1.1", 0.0, 0.0), site("2.2.2.2", 60.0, 15.0)],
    );
    let handler = build_handler(test_config(), table, LocalServices::new(), Vec::new());

    let response = execute_query(
        &handler,
        "foo.",
        RecordType::A,
        Some(Point::new(59.0, 14.0)),
    )
    .await;
    assert_authoritative_a(&response, "2.2.2.2");
}

#[tokio::test]
async fn test_redirect_prefers_site_closest_to_own_point() {
    // Same table, no marker: own point (55,13) picks the northern site.
    let table = ServiceTable::new();
    table.replace(
        "foo",
        vec![site("1.1.1.1", 0.0, 0.0), site("2.2.2.2", 60.0, 15.0)],
    );
    let handler = build_handler(test_config(), table, LocalServices::new(), Vec::new());

    let response = execute_query(&handler, "foo.", RecordType::A, None).await;
    assert_authoritative_a(&response, "2.2.2.2");
}

#[tokio::test]
async fn test_marker_disables_local_answer() {
    // A peer-relayed query for a locally running service must not be
    // answered with our own IP; with no table entry and no upstreams it is
    // refused back to the host.
    let local = LocalServices::new();
    local.add("foo");
    let handler = build_handler(test_config(), ServiceTable::new(), local, Vec::new());

    let response = execute_query(
        &handler,
        "foo.",
        RecordType::A,
        Some(Point::new(10.0, 10.0)),
    )
    .await;
    assert_response_code(&response, ResponseCode::Refused);
}

#[tokio::test]
async fn test_query_outside_base_domain_is_refused() {
    let mut config = test_config();
    config.base_domain = "edge.example".to_string();
    let local = LocalServices::new();
    local.add("foo.other.example");
    let handler = build_handler(config, ServiceTable::new(), local, Vec::new());

    let response = execute_query(&handler, "foo.other.example.", RecordType::A, None).await;
    assert_response_code(&response, ResponseCode::Refused);
    assert!(response.answers().is_empty());
}

#[tokio::test]
async fn test_excepted_suffix_is_refused() {
    let mut config = test_config();
    config.base_domain = "edge.example".to_string();
    config.except = vec!["internal.edge.example".to_string()];
    let local = LocalServices::new();
    local.add("db.internal.edge.example");
    let handler = build_handler(config, ServiceTable::new(), local, Vec::new());

    let response =
        execute_query(&handler, "db.internal.edge.example.", RecordType::A, None).await;
    assert_response_code(&response, ResponseCode::Refused);
}

#[tokio::test]
async fn test_unknown_service_without_upstreams_is_refused() {
    let handler = build_handler(
        test_config(),
        ServiceTable::new(),
        LocalServices::new(),
        Vec::new(),
    );

    let response = execute_query(&handler, "nowhere.", RecordType::A, None).await;
    assert_response_code(&response, ResponseCode::Refused);
}

#[tokio::test]
async fn test_local_answer_ttl_is_zero() {
    let local = LocalServices::new();
    local.add("foo");
    let handler = build_handler(test_config(), ServiceTable::new(), local, Vec::new());

    let response = execute_query(&handler, "foo.", RecordType::A, None).await;
    assert_eq!(response.answers()[0].ttl(), 0);
}

#[tokio::test]
async fn test_local_set_lookup_is_case_insensitive() {
    let local = LocalServices::new();
    local.add("Foo");
    let handler = build_handler(test_config(), ServiceTable::new(), local, Vec::new());

    let response = execute_query(&handler, "FOO.", RecordType::A, None).await;
    assert_authoritative_a(&response, OWN_IP);
}

#[tokio::test]
async fn test_redirect_single_site_table() {
    let table = ServiceTable::new();
    table.replace("solo", vec![site("7.7.7.7", -30.0, 150.0)]);
    let handler = build_handler(test_config(), table, LocalServices::new(), Vec::new());

    let response = execute_query(&handler, "solo.", RecordType::A, None).await;
    assert_authoritative_a(&response, "7.7.7.7");
}
