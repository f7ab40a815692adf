use std::time::Duration;

use anyhow::{Context, Result};
use lib_signalflow::{Client, ClientOptions, ComputationError, ExecuteRequest, Tsid};
use project_tests::{MockServer, WAIT, authenticated, end_of_channel, float_batch, info, init_logging, job_start};
use serde_json::json;
use tokio::time::timeout;

const PROGRAM: &str = "data('requests.count').sum().publish()";

#[tokio::test]
async fn lost_connection_fails_open_computations_and_recovers() -> Result<()> {
    init_logging();
    let mut server = MockServer::start().await?;
    let options = ClientOptions::new()
        .with_stream_url(server.url())
        .with_access_token("secret-token")
        .with_reconnect_delay(Duration::from_millis(50));
    let client = Client::new(options)?;

    server.next_request_of("authenticate").await?;
    server.send_json(authenticated())?;
    let first = client.execute(ExecuteRequest::new(PROGRAM)).await?;
    let second = client.execute(ExecuteRequest::new(PROGRAM)).await?;
    server.next_request_of("execute").await?;
    server.next_request_of("execute").await?;
    server.send_json(job_start("ch-1", "JOB-1"))?;
    assert_eq!(first.handle().await.as_deref(), Some("JOB-1"));

    server.drop_connection()?;
    timeout(WAIT, first.done()).await?;
    timeout(WAIT, second.done()).await?;
    assert_eq!(first.err(), Some(ComputationError::ConnectionLost));
    assert_eq!(second.err(), Some(ComputationError::ConnectionLost));

    // A fresh connection authenticates again and takes new work.
    server.wait_for_connections(2).await?;
    let auth = server.next_request_of("authenticate").await?;
    assert_eq!(auth["token"], "secret-token");

    let third = client.execute(ExecuteRequest::new(PROGRAM)).await?;
    assert_eq!(third.name(), "ch-3");
    let execute = server.next_request_of("execute").await?;
    assert_eq!(execute["channel"], "ch-3");

    server.send_json(job_start("ch-3", "JOB-3"))?;
    server.send_json(end_of_channel("ch-3"))?;
    assert_eq!(third.handle().await.as_deref(), Some("JOB-3"));
    timeout(WAIT, third.done()).await?;
    assert_eq!(third.err(), None);

    client.close();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn messages_sent_before_a_drop_are_delivered_first() -> Result<()> {
    init_logging();
    for round in 0..5 {
        let mut server = MockServer::start().await?;
        let options = ClientOptions::new()
            .with_stream_url(server.url())
            .with_access_token("secret-token")
            .with_reconnect_delay(Duration::from_millis(50));
        let client = Client::new(options)?;
        server.next_request_of("authenticate").await?;
        server.send_json(authenticated())?;

        let finished = client.execute(ExecuteRequest::new(PROGRAM)).await?;
        let running = client.execute(ExecuteRequest::new(PROGRAM)).await?;
        server.next_request_of("execute").await?;
        server.next_request_of("execute").await?;

        server.send_json(job_start("ch-1", "JOB-1"))?;
        for lag in 0..800 {
            server.send_json(info("ch-1", "JOB_DETECTED_LAG", json!({ "lagMs": lag })))?;
        }
        server.send_binary(float_batch("ch-1", 1_000, &[(Tsid(1), 0.5)], true)?)?;
        server.send_json(end_of_channel("ch-1"))?;
        server.drop_connection()?;

        timeout(WAIT, finished.done()).await?;
        timeout(WAIT, running.done()).await?;
        assert_eq!(finished.err(), None, "round {}", round);
        assert_eq!(finished.lag().await, Some(Duration::from_millis(799)), "round {}", round);
        let mut data = finished.data().context("data relay")?;
        let batch = timeout(WAIT, data.recv()).await?.context("batch sent before the drop")?;
        assert_eq!(batch.timestamp_ms, 1_000);
        assert_eq!(running.err(), Some(ComputationError::ConnectionLost), "round {}", round);

        client.close();
    }
    Ok(())
}

#[tokio::test]
async fn silent_server_triggers_a_reconnect() -> Result<()> {
    init_logging();
    let mut server = MockServer::start().await?;
    let options = ClientOptions::new()
        .with_stream_url(server.url())
        .with_read_timeout(Duration::from_millis(200))
        .with_reconnect_delay(Duration::from_millis(50));
    let client = Client::new(options)?;

    server.wait_for_connections(1).await?;
    server.wait_for_connections(2).await?;
    // Without a token nothing is sent on connect.
    server.expect_no_request(Duration::from_millis(100)).await?;

    client.close();
    Ok(())
}

#[tokio::test]
async fn requests_issued_while_disconnected_go_out_after_reconnect() -> Result<()> {
    init_logging();
    let mut server = MockServer::start().await?;
    let options = ClientOptions::new()
        .with_stream_url(server.url())
        .with_access_token("secret-token")
        .with_reconnect_delay(Duration::from_millis(300));
    let client = Client::new(options)?;
    server.next_request_of("authenticate").await?;

    server.drop_connection()?;
    // Let the client notice the drop; the execute then lands in the reconnect delay.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.execute(ExecuteRequest::new(PROGRAM)).await })
    };

    server.wait_for_connections(2).await?;
    server.next_request_of("authenticate").await?;
    let execute = server.next_request_of("execute").await?;
    assert_eq!(execute["program"], PROGRAM);

    let computation = timeout(WAIT, pending).await???;
    assert!(!computation.is_done());

    // The channel belongs to the connection that carried the request.
    server.send_json(job_start("ch-1", "JOB-1"))?;
    assert_eq!(computation.handle().await.as_deref(), Some("JOB-1"));
    assert_eq!(computation.err(), None);

    client.close();
    Ok(())
}
