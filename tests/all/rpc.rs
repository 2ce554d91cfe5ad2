use crate::helpers::{get_client, get_rpc_settings, unique, Responder};
use funnel_cake::amqp::configuration::{RabbitMqSettings, RpcSettings};
use funnel_cake::publishers::RetryPolicy;
use funnel_cake::rpc::{CallPayload, RefreshOptions, ReplyStatus, RpcClient, RpcError};
use serde_json::json;
use std::time::Duration;

fn quick_refresh() -> RefreshOptions {
    RefreshOptions {
        poll_timeout: Duration::from_millis(300),
        ..RefreshOptions::default()
    }
}

#[tokio::test]
#[ignore = "requires a running RabbitMQ broker"]
async fn a_call_round_trips_through_the_broker() {
    // Arrange
    let settings = get_rpc_settings();
    let client = get_client(settings.clone());
    let responder = Responder::bind(&settings, "store", "get_product").await.unwrap();

    let mut kwargs = serde_json::Map::new();
    kwargs.insert("product_id".into(), json!(42));
    let payload = CallPayload::new(vec![], kwargs);

    // Act
    let event = client.call("store", "get_product", &payload).await.unwrap();
    let request_body = responder
        .reply_once(&[
            json!({"status": "STARTED", "result": null}),
            json!({"status": "SUCCESS", "result": {"price": 350}}),
        ])
        .await
        .unwrap();
    event.refresh(quick_refresh()).await.unwrap();

    // Assert
    let snapshot = event.snapshot().await;
    assert_eq!(snapshot.status, ReplyStatus::Success);
    assert_eq!(snapshot.result, Some(json!({"price": 350})));
    assert!(!snapshot.timed_out);
    // the request travelled in the three-element task-protocol shape
    assert_eq!(
        request_body,
        json!([
            [],
            {"product_id": 42},
            {"callbacks": null, "errbacks": null, "chain": null, "chord": null},
        ])
    );

    client.shutdown().await;
}

#[tokio::test]
#[ignore = "requires a running RabbitMQ broker"]
async fn an_unroutable_call_finishes_as_fail_publish() {
    // Arrange: nobody is bound for this destination.
    let settings = get_rpc_settings();
    let client = get_client(settings.clone());
    let method = unique("no_such_method");

    // Act
    let event = client
        .call("ghost-app", &method, &CallPayload::default())
        .await
        .unwrap();

    // Assert
    let snapshot = event.snapshot().await;
    assert_eq!(snapshot.status, ReplyStatus::FailPublish);
    assert!(event.finished().await);
    let result = snapshot.result.unwrap();
    assert_eq!(result["exchange"], json!(settings.exchange_name));
    assert_eq!(result["routing_key"], json!(format!("rpc.ghost-app.{method}")));

    client.shutdown().await;
}

#[tokio::test]
#[ignore = "requires a running RabbitMQ broker"]
async fn a_silent_responder_times_out_and_retry_resumes_polling() {
    // Arrange: the responder is bound but holds the reply back past the
    // one-second call deadline.
    let settings = RpcSettings {
        reply_timeout_seconds: 1,
        ..get_rpc_settings()
    };
    let client = get_client(settings.clone());
    let responder = Responder::bind(&settings, "store", "slow_method").await.unwrap();

    // Act
    let event = client
        .call("store", "slow_method", &CallPayload::default())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(1100)).await;
    event.refresh(quick_refresh()).await.unwrap();

    // Assert: timed out, but not finished - no reply ever arrived.
    let snapshot = event.snapshot().await;
    assert!(snapshot.timed_out);
    assert_eq!(snapshot.status, ReplyStatus::Inited);
    assert!(!event.finished().await);

    // Act: the reply shows up late; a retrying refresh picks it up.
    responder
        .reply_once(&[json!({"status": "STARTED", "result": null})])
        .await
        .unwrap();
    event
        .refresh(RefreshOptions {
            retry: true,
            ..quick_refresh()
        })
        .await
        .unwrap();

    // Assert
    let snapshot = event.snapshot().await;
    assert_eq!(snapshot.status, ReplyStatus::Started);
    assert!(!snapshot.timed_out);

    client.shutdown().await;
}

#[tokio::test]
async fn an_unreachable_broker_surfaces_on_the_first_call() {
    // Arrange: nothing is listening on port 1.
    let rabbitmq = RabbitMqSettings {
        port: 1,
        connection_timeout_seconds: Some(1),
        ..RabbitMqSettings::default()
    };
    let rpc = RpcSettings {
        retry: RetryPolicy {
            max_retries: 0,
            ..RetryPolicy::default()
        },
        ..RpcSettings::default()
    };
    let client = RpcClient::builder("test-app")
        .rabbitmq_settings(rabbitmq)
        .rpc_settings(rpc)
        .build()
        .unwrap();

    // Act
    let outcome = client.call("store", "get_product", &CallPayload::default()).await;

    // Assert: the topology could not even be declared.
    assert!(matches!(outcome, Err(RpcError::Topology(_))));
}
