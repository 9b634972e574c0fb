//! Rendezvous handshake tests against an in-process HTTP server

mod common;

use common::{assignment_body, closed_port, start_http_server, test_config, TEST_TIMEOUT};
use localtunnel_client::{
    resolve_assignment, AssignmentClient, AssignmentError, PoolError, TunnelPool,
};
use std::time::Duration;
use tokio::time::timeout;

#[tokio::test]
async fn test_resolve_new_subdomain() {
    let (base_url, server) = start_http_server("200 OK", assignment_body(9000, 10)).await;

    let record = timeout(TEST_TIMEOUT, resolve_assignment(None, &base_url))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(record.assigned_id, "abc");
    assert_eq!(record.url, "https://abc.loca.lt");
    assert_eq!(record.remote_port, 9000);
    assert_eq!(record.max_connection_count, 10);

    let request_line = server.await.unwrap();
    assert_eq!(request_line, "GET /?new HTTP/1.1");
}

#[tokio::test]
async fn test_resolve_requested_subdomain() {
    let (base_url, server) = start_http_server("200 OK", assignment_body(9000, 1)).await;

    let client = AssignmentClient::new(Duration::from_secs(5)).unwrap();
    client
        .resolve_assignment(Some("myapp"), &format!("{}/", base_url))
        .await
        .unwrap();

    assert_eq!(server.await.unwrap(), "GET /myapp HTTP/1.1");
}

#[tokio::test]
async fn test_server_error_field() {
    let (base_url, _server) = start_http_server(
        "200 OK",
        r#"{"error":"subdomain unavailable"}"#.to_string(),
    )
    .await;

    let result = resolve_assignment(None, &base_url).await;
    match result {
        Err(AssignmentError::Assignment(msg)) => assert_eq!(msg, "subdomain unavailable"),
        other => panic!("unexpected result: {:?}", other),
    }
}

#[tokio::test]
async fn test_non_success_status() {
    let (base_url, _server) =
        start_http_server("503 Service Unavailable", "{}".to_string()).await;

    let result = resolve_assignment(None, &base_url).await;
    assert!(matches!(result, Err(AssignmentError::Transport(_))));
}

#[tokio::test]
async fn test_malformed_body() {
    let (base_url, _server) = start_http_server("200 OK", "not json".to_string()).await;

    let result = resolve_assignment(None, &base_url).await;
    assert!(matches!(result, Err(AssignmentError::Format(_))));
}

#[tokio::test]
async fn test_connection_refused() {
    let base_url = format!("http://127.0.0.1:{}", closed_port().await);

    let result = timeout(TEST_TIMEOUT, resolve_assignment(None, &base_url))
        .await
        .unwrap();
    assert!(matches!(result, Err(AssignmentError::Transport(_))));
}

#[tokio::test]
async fn test_failed_assignment_never_reaches_start() {
    let (base_url, _server) = start_http_server(
        "200 OK",
        r#"{"error":"subdomain unavailable"}"#.to_string(),
    )
    .await;

    let pool = TunnelPool::new(test_config());
    let result = pool.resolve_url(None, &base_url).await;
    assert!(matches!(
        result,
        Err(PoolError::Assignment(AssignmentError::Assignment(_)))
    ));
    assert!(pool.assignment().is_none());

    let start = pool.start(8080).await;
    assert!(matches!(start, Err(PoolError::NoAssignment)));
    assert!(pool.connections().is_empty());
}

#[tokio::test]
async fn test_resolve_url_stores_assignment() {
    let (base_url, _server) = start_http_server("200 OK", assignment_body(9000, 4)).await;

    let pool = TunnelPool::new(test_config());
    let url = pool.resolve_url(Some("abc"), &base_url).await.unwrap();

    assert_eq!(url, "https://abc.loca.lt");
    let assignment = pool.assignment().unwrap();
    assert_eq!(assignment.max_connection_count, 4);
    assert_eq!(assignment.remote_port, 9000);
}
