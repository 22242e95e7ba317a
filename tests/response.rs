use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use cellar::body::Body;
use cellar::response::{Response, ResponseWriter};
use http::header::CONTENT_TYPE;
use http::{HeaderName, HeaderValue, StatusCode};

fn header(name: &str) -> HeaderName {
    name.parse().expect("header name")
}

fn value(raw: &str) -> HeaderValue {
    raw.parse().expect("header value")
}

#[tokio::test]
async fn snapshot_is_readable_once_the_header_gate_opens() {
    let response = Arc::new(Response::new());

    let producer = Arc::clone(&response);
    tokio::spawn(async move {
        producer.set_header(header("content-type"), value("application/json"));
        producer.write_header(StatusCode::OK);
    });

    response.wait_headers().await;
    let snapshot = response.snapshot_headers();
    assert_eq!(
        snapshot.get(CONTENT_TYPE).and_then(|v| v.to_str().ok()),
        Some("application/json")
    );
}

#[tokio::test]
async fn write_blocks_until_a_body_store_is_attached() {
    let response = Arc::new(Response::new());

    let producer = Arc::clone(&response);
    let writing = tokio::spawn(async move {
        producer
            .write(Bytes::from_static(b"abc"))
            .await
            .expect("write");
    });

    // The implicit write_header(200) has happened, the body write has not.
    response.wait_headers().await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!writing.is_finished());

    response.set_body(Body::buffer());
    writing.await.expect("writer task");

    response.close();
    let mut reader = response.reader().expect("reader");
    let out = reader.read_to_end().await.expect("read_to_end");
    assert_eq!(out, b"abc");
}

#[tokio::test]
async fn close_ends_the_body_stream() {
    let response = Response::new();
    response.write_header(StatusCode::OK);
    response.set_body(Body::buffer());
    response.write(Bytes::from_static(b"x")).await.expect("write");

    let mut reader = response.reader().expect("reader");
    response.close();

    let out = reader.read_to_end().await.expect("read_to_end");
    assert_eq!(out, b"x");
}

#[tokio::test]
async fn implicit_header_sniffs_the_content_type() {
    let response = Arc::new(Response::new());

    let producer = Arc::clone(&response);
    let writing = tokio::spawn(async move {
        producer
            .write(Bytes::from_static(b"<!DOCTYPE html><html></html>"))
            .await
            .expect("write");
    });

    response.wait_headers().await;
    assert_eq!(response.code(), StatusCode::OK);
    let content_type = response
        .snapshot_headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .expect("content type");
    assert!(content_type.starts_with("text/html"));

    response.set_body(Body::buffer());
    writing.await.expect("writer task");
}

#[tokio::test]
async fn explicit_content_type_is_not_overridden() {
    let response = Arc::new(Response::new());
    response.set_header(header("content-type"), value("application/wasm"));

    let producer = Arc::clone(&response);
    let writing = tokio::spawn(async move {
        producer
            .write(Bytes::from_static(b"<html>"))
            .await
            .expect("write");
    });

    response.wait_headers().await;
    assert_eq!(
        response
            .snapshot_headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok()),
        Some("application/wasm")
    );

    response.set_body(Body::buffer());
    writing.await.expect("writer task");
}

#[tokio::test]
async fn header_mutations_after_the_head_are_dropped() {
    let response = Response::new();
    response.set_header(header("x-a"), value("A"));
    response.write_header(StatusCode::ACCEPTED);
    response.set_header(header("x-b"), value("B"));

    let snapshot = response.snapshot_headers();
    assert_eq!(snapshot.get("x-a").and_then(|v| v.to_str().ok()), Some("A"));
    assert!(snapshot.get("x-b").is_none());
    assert_eq!(response.code(), StatusCode::ACCEPTED);
}

#[tokio::test]
async fn write_header_only_honours_the_first_call() {
    let response = Response::new();
    response.write_header(StatusCode::ACCEPTED);
    response.write_header(StatusCode::NOT_FOUND);
    assert_eq!(response.code(), StatusCode::ACCEPTED);
}

#[tokio::test]
async fn abort_unblocks_writers_with_an_error() {
    let response = Arc::new(Response::new());

    let producer = Arc::clone(&response);
    let writing =
        tokio::spawn(async move { producer.write(Bytes::from_static(b"abc")).await });

    response.wait_headers().await;
    response.abort();

    let result = writing.await.expect("writer task");
    assert!(result.is_err());
}

#[tokio::test]
async fn wait_close_observes_close() {
    let response = Arc::new(Response::new());
    response.write_header(StatusCode::OK);
    response.set_body(Body::buffer());

    let waiter = {
        let response = Arc::clone(&response);
        tokio::spawn(async move {
            response.wait_close().await;
        })
    };

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!waiter.is_finished());

    response.close();
    waiter.await.expect("waiter");
}
