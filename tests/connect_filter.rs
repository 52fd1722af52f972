//! Connect filter driven through pipelines

use std::time::Duration;

use bytes::BytesMut;
use relayflow::config::{ConnectConfig, Protocol, WorkerConfig};
use relayflow::filter::ConnectTarget;
use relayflow::inbound::InboundInfo;
use relayflow::{Connect, ConnectOptions, Event, OptionsSource, PipelineLayout, Setting, Worker};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(30);

async fn echo_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                while let Ok(n) = stream.read(&mut buf).await {
                    if n == 0 || stream.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    port
}

/// Drain a pipeline up to and including its StreamEnd
async fn collect(pipeline: &mut relayflow::Pipeline) -> (BytesMut, Event) {
    let mut data = BytesMut::new();
    loop {
        let event = timeout(WAIT, pipeline.recv())
            .await
            .expect("pipeline output in time")
            .expect("pipeline output open");
        match event {
            Event::Data(chunk) => data.extend_from_slice(&chunk),
            end @ Event::StreamEnd(_) => return (data, end),
            _ => {}
        }
    }
}

#[tokio::test]
async fn test_bad_target_is_config_error() {
    let worker = Worker::new(WorkerConfig::default());
    let layout = PipelineLayout::builder("bad")
        .filter("connect.js", Connect::fixed("bad-target", ConnectOptions::new()))
        .build(&worker);

    let mut pipeline = layout.spawn(&worker, None);
    pipeline.send(Event::data(&b"hello"[..]));

    let (data, end) = collect(&mut pipeline).await;
    assert!(data.is_empty());
    let err = end.error().expect("abnormal end");
    assert_eq!(err.error_code(), "CONFIG_ERROR");
    assert_eq!(err.to_string(), "invalid target format: bad-target");
    assert!(pipeline.context().data(0).get::<ConnectTarget>().is_none());

    pipeline.join().await;
    assert_eq!(worker.error_stats().config_errors, 1);
    drop(pipeline);
    assert_eq!(worker.context_count(), 0);
    assert_eq!(layout.pool().cached(), 1);
}

#[tokio::test]
async fn test_stream_end_before_data_passes_through() {
    let worker = Worker::new(WorkerConfig::default());
    let layout = PipelineLayout::builder("empty-stream")
        .filter("connect.js", Connect::fixed("127.0.0.1:1", ConnectOptions::new()))
        .build(&worker);

    let mut pipeline = layout.spawn(&worker, None);
    pipeline.send(Event::end());

    let (data, end) = collect(&mut pipeline).await;
    assert!(data.is_empty());
    assert_eq!(end, Event::end());
}

#[tokio::test]
async fn test_relay_through_pipeline() {
    println!("🧪 relay a stream through a connect pipeline");
    let port = echo_server().await;
    let worker = Worker::new(WorkerConfig::default());
    let layout = PipelineLayout::builder("relay")
        .filter(
            "connect.js",
            Connect::fixed(format!("127.0.0.1:{}", port), ConnectOptions::new().with_no_delay(true)),
        )
        .build(&worker);
    assert_eq!(layout.len(), 1);

    let inbound = worker
        .inbounds()
        .register(InboundInfo::new(Protocol::Tcp, "0.0.0.0:8000"));
    let mut pipeline = layout.spawn(&worker, Some(inbound.downgrade()));
    assert_eq!(pipeline.context().inbound().unwrap().label, "0.0.0.0:8000");
    assert_eq!(pipeline.context().slot_count(), 1);

    pipeline.send(Event::data(&b"hello "[..]));
    pipeline.send(Event::data(&b"world"[..]));
    pipeline.send(Event::end());

    let (data, end) = collect(&mut pipeline).await;
    assert_eq!(&data[..], b"hello world");
    assert_eq!(end, Event::end());
    assert_eq!(
        pipeline.context().data(0).get::<ConnectTarget>(),
        Some(&ConnectTarget {
            host: "127.0.0.1".to_string(),
            port
        })
    );

    // the inbound going away is visible, not dangling
    inbound.close();
    assert!(pipeline.context().inbound().is_none());

    pipeline.join().await;
    drop(pipeline);
    assert_eq!(worker.context_count(), 0);
    println!("✅ relay ok");
}

#[tokio::test]
async fn test_dynamic_target_from_global() {
    let port = echo_server().await;
    let config = WorkerConfig {
        global: json!({ "upstream": format!("127.0.0.1:{}", port) }),
        ..Default::default()
    };
    let worker = Worker::from_config(config).unwrap();

    let target = Setting::computed(|ctx| Ok(ctx.global()["upstream"].clone()));
    let options = OptionsSource::dynamic(ConnectOptions::new(), |ctx| async move {
        tokio::task::yield_now().await;
        Ok(json!({ "noDelay": true, "idleTimeout": 30, "tag": ctx.id().as_u64() }))
    });
    let layout = PipelineLayout::builder("dynamic")
        .filter("connect.js", Connect::new(target, options))
        .build(&worker);

    let mut pipeline = layout.spawn(&worker, None);
    pipeline.send(Event::data(&b"ping"[..]));
    pipeline.send(Event::end());

    let (data, end) = collect(&mut pipeline).await;
    assert_eq!(&data[..], b"ping");
    assert_eq!(end, Event::end());
}

#[tokio::test]
async fn test_refused_upstream_reports_failure() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let worker = Worker::new(WorkerConfig::default());
    let layout = PipelineLayout::builder("refused")
        .filter(
            "connect.js",
            Connect::fixed(
                format!("127.0.0.1:{}", port),
                ConnectOptions::new().with_retry(1, Duration::from_millis(20)),
            ),
        )
        .build(&worker);

    let mut pipeline = layout.spawn(&worker, None);
    pipeline.send(Event::data(&b"x"[..]));

    let (_, end) = collect(&mut pipeline).await;
    assert_eq!(end.error().map(|e| e.error_code()), Some("CONNECT_ERROR"));

    // one retry, then one terminal failure, accounted on the worker
    let stats = worker.error_stats();
    assert_eq!(stats.retries, 1);
    assert_eq!(stats.connection_errors, 1);
    assert_eq!(stats.total_errors, 1);
}

#[tokio::test]
async fn test_abort_releases_context() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let worker = Worker::new(WorkerConfig::default());
    let layout = PipelineLayout::builder("aborted")
        .filter("connect.js", Connect::fixed(format!("127.0.0.1:{}", port), ConnectOptions::new()))
        .build(&worker);

    let mut pipeline = layout.spawn(&worker, None);
    pipeline.send(Event::data(&b"x"[..]));
    let (_stream, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();

    pipeline.abort();
    pipeline.join().await;
    drop(pipeline);
    assert_eq!(worker.context_count(), 0);
}

#[tokio::test]
async fn test_abort_while_options_callback_pending() {
    let worker = Worker::new(WorkerConfig::default());
    let options = OptionsSource::dynamic(ConnectOptions::new(), |_| std::future::pending::<relayflow::Result<Value>>());
    let layout = PipelineLayout::builder("stuck")
        .filter("connect.js", Connect::new(json!("127.0.0.1:80").into(), options))
        .build(&worker);

    let mut pipeline = layout.spawn(&worker, None);
    pipeline.send(Event::data(&b"x"[..]));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(worker.context_count(), 1);

    pipeline.abort();
    timeout(Duration::from_secs(2), pipeline.join())
        .await
        .expect("runner stops while a filter is suspended");
    drop(pipeline);
    assert_eq!(worker.context_count(), 0);
    assert_eq!(layout.pool().cached(), 1);
}

#[tokio::test]
async fn test_bad_bind_aborts_attempt() {
    let worker = Worker::new(WorkerConfig::default());
    let options = ConnectOptions::new().with_bind("not-an-address");
    let layout = PipelineLayout::builder("bad-bind")
        .filter("connect.js", Connect::fixed("127.0.0.1:80", options))
        .build(&worker);

    let mut pipeline = layout.spawn(&worker, None);
    pipeline.send(Event::data(&b"x"[..]));

    let (_, end) = collect(&mut pipeline).await;
    assert_eq!(end.error().map(|e| e.error_code()), Some("CONFIG_ERROR"));
}

#[test]
fn test_connect_config_from_toml() {
    let config: ConnectConfig = toml::from_str(
        r#"
        target = "127.0.0.1:8080"

        [options]
        protocol = "udp"
        bind = "127.0.0.1"
        retryCount = 3
        retryDelay = "250ms"
        bufferLimit = "64k"
        congestionLimit = 16384
        idleTimeout = 60
        keepAlive = true
        "#,
    )
    .unwrap();

    config.validate().unwrap();
    let options = config.options().unwrap();
    assert_eq!(options.protocol, Protocol::Udp);
    assert_eq!(options.retry_count, 3);
    assert_eq!(options.retry_delay, Duration::from_millis(250));
    assert_eq!(options.buffer_limit, Some(64 * 1024));
    assert_eq!(options.congestion_limit, Some(16384));
    assert_eq!(options.idle_timeout, Some(Duration::from_secs(60)));
    assert!(options.keep_alive);
    assert!(options.bind.is_some());

    let filter = Connect::from_config(&config).unwrap();
    assert_eq!(filter.state(), relayflow::filter::ConnectState::Unbound);
}

#[test]
fn test_connect_config_rejects_bad_values() {
    let config: ConnectConfig = toml::from_str(r#"target = "nowhere""#).unwrap();
    assert!(Connect::from_config(&config).is_err());

    let config: ConnectConfig = toml::from_str(
        r#"
        target = "127.0.0.1:80"
        [options]
        retryCount = "lots"
        "#,
    )
    .unwrap();
    let err = Connect::from_config(&config).unwrap_err();
    assert!(err.to_string().contains("retryCount"));
}

#[test]
fn test_connect_config_from_json() {
    let value = json!({ "target": "[::1]:443" });
    let config: ConnectConfig = serde_json::from_value(value).unwrap();
    assert_eq!(config.options, Value::Null);
    assert!(Connect::from_config(&config).is_ok());
}
