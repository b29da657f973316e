/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */


use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;

use s3_throughput_client::error::ErrorKind;
use s3_throughput_client::http::HttpRequest;
use s3_throughput_client::meta_request::MetaRequestOptions;

use test_utils::*;

#[tokio::test]
async fn test_meta_request_validation() {
    let (client, _transport) = TestClientBuilder::new(object_handler(Bytes::new())).build();

    // No Host header.
    let err = client
        .make_meta_request(MetaRequestOptions::passthrough(HttpRequest::new(
            http::Method::HEAD,
            "/key",
        )))
        .unwrap_err();
    assert_eq!(&ErrorKind::InputInvalid, err.kind());

    // Ranged GET without a body receiver.
    let err = client
        .make_meta_request(MetaRequestOptions::ranged_get(TEST_HOST, "/key"))
        .unwrap_err();
    assert_eq!(&ErrorKind::InputInvalid, err.kind());

    // Ranged GET with a non-GET message.
    let mut message = HttpRequest::new(http::Method::HEAD, "/key");
    message.headers.insert(
        http::header::HOST,
        http::HeaderValue::from_static(TEST_HOST),
    );
    let err = client
        .make_meta_request(
            MetaRequestOptions::ranged_get(TEST_HOST, "/key")
                .message(message)
                .on_body(|_, _| Ok(())),
        )
        .unwrap_err();
    assert_eq!(&ErrorKind::InputInvalid, err.kind());
}

#[tokio::test]
async fn test_passthrough_meta_request() {
    let object = test_data(1024);
    let (client, transport) =
        TestClientBuilder::new(object_handler(object.clone())).build();

    let chunks: Arc<Mutex<Vec<Bytes>>> = Arc::new(Mutex::new(Vec::new()));
    let chunks_cb = chunks.clone();

    let mut message = HttpRequest::new(http::Method::GET, "/small-object");
    message.headers.insert(
        http::header::HOST,
        http::HeaderValue::from_static(TEST_HOST),
    );

    let handle = client
        .make_meta_request(
            MetaRequestOptions::passthrough(message).on_body(move |_, data| {
                chunks_cb.lock().unwrap().push(data.clone());
                Ok(())
            }),
        )
        .unwrap();

    let result = handle.join().await;
    assert!(result.is_success(), "finish error: {:?}", result.error);
    // One exchange, body forwarded whole.
    assert_eq!(1, transport.total_sends());
    let chunks = chunks.lock().unwrap();
    assert_eq!(1, chunks.len());
    assert_eq!(object, chunks[0]);
}

#[tokio::test]
async fn test_shutdown_cancels_in_flight_meta_requests() {
    let events: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

    let object = test_data(25 * MEBIBYTE as usize);
    let shutdown_events = events.clone();
    let (client, _transport) = TestClientBuilder::new(object_handler(object))
        .part_size(5 * MEBIBYTE)
        .send_delay(Duration::from_millis(50))
        .on_shutdown(move || {
            shutdown_events.lock().unwrap().push("shutdown".to_string());
            let _ = shutdown_tx.send(());
        })
        .build();

    let mut handles = Vec::new();
    for i in 0..2 {
        let finish_events = events.clone();
        let handle = client
            .make_meta_request(
                MetaRequestOptions::ranged_get(TEST_HOST, &format!("/object-{i}"))
                    .on_body(|_, _| Ok(()))
                    .on_finish(move |_| {
                        finish_events.lock().unwrap().push(format!("finish-{i}"));
                    }),
            )
            .unwrap();
        handles.push(handle);
    }

    // Let the probes land and the part fan-out get in flight, then drop the
    // only client handle.
    tokio::time::sleep(Duration::from_millis(70)).await;
    drop(client);

    for handle in handles {
        let result = handle.join().await;
        let error = result.error.expect("cancelled by shutdown");
        assert_eq!(&ErrorKind::ClientShutdown, error.kind());
    }

    tokio::time::timeout(Duration::from_secs(5), shutdown_rx)
        .await
        .expect("shutdown callback fired")
        .expect("sender kept");

    let events = events.lock().unwrap();
    assert_eq!(3, events.len());
    // Both finish callbacks strictly precede the shutdown callback.
    assert_eq!("shutdown", events[2]);
    assert!(events[0].starts_with("finish-"));
    assert!(events[1].starts_with("finish-"));
}

#[tokio::test]
async fn test_shutdown_callback_after_successful_finish() {
    let events: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

    let shutdown_events = events.clone();
    let (client, _transport) = TestClientBuilder::new(object_handler(test_data(1024)))
        .on_shutdown(move || {
            shutdown_events.lock().unwrap().push("shutdown".to_string());
            let _ = shutdown_tx.send(());
        })
        .build();

    let finish_events = events.clone();
    let handle = client
        .make_meta_request(
            MetaRequestOptions::ranged_get(TEST_HOST, "/object")
                .on_body(|_, _| Ok(()))
                .on_finish(move |result| {
                    assert!(result.is_success());
                    finish_events.lock().unwrap().push("finish".to_string());
                }),
        )
        .unwrap();

    assert!(handle.join().await.is_success());
    drop(client);

    tokio::time::timeout(Duration::from_secs(5), shutdown_rx)
        .await
        .expect("shutdown callback fired")
        .expect("sender kept");

    assert_eq!(
        vec!["finish".to_string(), "shutdown".to_string()],
        *events.lock().unwrap()
    );
}

#[tokio::test]
async fn test_concurrency_bounded_by_vip_pool() {
    // 1 Gbps target sizes the pool at a single VIP even though two addresses
    // resolve, and a VIP carries ten connection slots.
    let object = test_data(60 * MEBIBYTE as usize);
    let (client, transport) = TestClientBuilder::new(object_handler(object.clone()))
        .part_size(5 * MEBIBYTE)
        .throughput_gbps(1.0)
        .send_delay(Duration::from_millis(5))
        .build();

    let handle = client
        .make_meta_request(
            MetaRequestOptions::ranged_get(TEST_HOST, "/wide-object").on_body(|_, _| Ok(())),
        )
        .unwrap();

    let result = handle.join().await;
    assert!(result.is_success(), "finish error: {:?}", result.error);

    assert_eq!(1, transport.managers_created());
    assert!(
        transport.max_active_sends() <= 10,
        "max concurrent sends {} exceeded the per-VIP connection count",
        transport.max_active_sends()
    );
    // 60 MiB in 5 MiB parts.
    assert_eq!(12, transport.total_sends());
}

#[tokio::test]
async fn test_clone_holds_the_client_open() {
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel();

    let (client, _transport) = TestClientBuilder::new(object_handler(test_data(1024)))
        .on_shutdown(move || {
            let _ = shutdown_tx.send(());
        })
        .build();

    let submitter = client.clone();
    drop(client);

    // The surviving clone still accepts work.
    let handle = submitter
        .make_meta_request(
            MetaRequestOptions::ranged_get(TEST_HOST, "/object").on_body(|_, _| Ok(())),
        )
        .unwrap();
    assert!(handle.join().await.is_success());
    assert!(shutdown_rx.try_recv().is_err(), "shutdown before last clone dropped");

    drop(submitter);
    tokio::time::timeout(Duration::from_secs(5), shutdown_rx)
        .await
        .expect("shutdown callback fired")
        .expect("sender kept");
}
