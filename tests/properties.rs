//! Randomized properties: address round trips, option defaults, id ordering

use std::collections::HashSet;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use rand::seq::SliceRandom;
use rand::Rng;
use relayflow::address::{format_host_port, parse_host_port};
use relayflow::config::{ConnectOptions, Protocol, WorkerConfig};
use relayflow::Worker;
use serde_json::{json, Map, Value};

fn random_hostname(rng: &mut impl Rng) -> String {
    const CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789-";
    let labels = rng.gen_range(1..=4);
    (0..labels)
        .map(|_| {
            let len = rng.gen_range(1..=12);
            (0..len)
                .map(|_| *CHARS.choose(rng).unwrap() as char)
                .collect::<String>()
        })
        .collect::<Vec<_>>()
        .join(".")
}

#[test]
fn test_host_port_round_trip() {
    let mut rng = rand::thread_rng();
    for _ in 0..2000 {
        let host = match rng.gen_range(0..3) {
            0 => random_hostname(&mut rng),
            1 => Ipv4Addr::from(rng.gen::<u32>()).to_string(),
            _ => Ipv6Addr::from(rng.gen::<u128>()).to_string(),
        };
        let port: u16 = rng.gen();
        let formatted = format_host_port(&host, port);
        assert_eq!(
            parse_host_port(&formatted),
            Some((host.clone(), port)),
            "round trip of {}",
            formatted
        );
    }
}

#[test]
fn test_missing_keys_take_defaults() {
    let full = json!({
        "protocol": "udp",
        "bind": "127.0.0.1:0",
        "congestionLimit": 1024,
        "bufferLimit": 4096,
        "retryCount": 5,
        "retryDelay": 2,
        "connectTimeout": 3,
        "readTimeout": 4,
        "writeTimeout": 5,
        "idleTimeout": 6,
        "keepAlive": true,
        "noDelay": true,
    });
    let keys: Vec<String> = full.as_object().unwrap().keys().cloned().collect();
    let mut rng = rand::thread_rng();

    for _ in 0..200 {
        let mut subset = Map::new();
        for key in &keys {
            if rng.gen_bool(0.5) {
                subset.insert(key.clone(), full[key].clone());
            }
        }
        let present = |key: &str| subset.contains_key(key);
        let options = ConnectOptions::from_value(&Value::Object(subset.clone())).unwrap();

        if !present("protocol") {
            assert_eq!(options.protocol, Protocol::Tcp);
        }
        if !present("bind") {
            assert!(options.bind.is_none());
        }
        if !present("congestionLimit") {
            assert_eq!(options.congestion_limit, None);
        }
        if !present("bufferLimit") {
            assert_eq!(options.buffer_limit, None);
        }
        if !present("retryCount") {
            assert_eq!(options.retry_count, 0);
        }
        if !present("retryDelay") {
            assert_eq!(options.retry_delay, Duration::ZERO);
        }
        for (key, value) in [
            ("connectTimeout", options.connect_timeout),
            ("readTimeout", options.read_timeout),
            ("writeTimeout", options.write_timeout),
            ("idleTimeout", options.idle_timeout),
        ] {
            if !present(key) {
                assert_eq!(value, None, "{} should default to unlimited", key);
            }
        }
        if !present("keepAlive") {
            assert!(!options.keep_alive);
        }
        if !present("noDelay") {
            assert!(!options.no_delay);
        }
    }
}

#[test]
fn test_context_ids_distinct_and_increasing() {
    let worker = Worker::new(WorkerConfig::default());
    let pool = worker.context_pool(vec!["a.js".into(), "b.js".into()]);
    let mut rng = rand::thread_rng();

    let mut seen = HashSet::new();
    let mut last = 0;
    let mut alive: Vec<std::sync::Arc<relayflow::Context>> = Vec::new();
    for _ in 0..1000 {
        let ctx = if !alive.is_empty() && rng.gen_bool(0.3) {
            worker.derive_context(&alive[rng.gen_range(0..alive.len())])
        } else {
            worker.new_context(&pool, None)
        };
        let id = ctx.id().as_u64();
        assert!(id > last);
        assert!(seen.insert(id));
        last = id;

        alive.push(ctx);
        if rng.gen_bool(0.5) {
            let victim = rng.gen_range(0..alive.len());
            alive.swap_remove(victim).finalize();
        }
    }
    assert_eq!(worker.context_count(), alive.len());
}
