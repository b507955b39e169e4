mod test_helpers;

use std::sync::Arc;

use shardcanary::canary_client::NAMESPACE_HEADER;
use shardcanary::executor::{ExecutorRegistry, ShardOwnership};
use shardcanary::handler::PingHandler;
use shardcanary::metrics;
use shardcanary::pb;
use shardcanary::pb::canary_api_server::CanaryApi;
use test_helpers::StaticOwnership;

fn handler() -> PingHandler {
    let executor: Arc<dyn ShardOwnership> =
        Arc::new(StaticOwnership::new("ns1", "127.0.0.1:7953", &["shard-1"]));
    let registry = ExecutorRegistry::new([executor]).unwrap();
    PingHandler::new(registry, None)
}

fn ping(namespace: &str, shard_key: &str) -> pb::PingRequest {
    pb::PingRequest {
        namespace: namespace.to_string(),
        shard_key: shard_key.to_string(),
    }
}

#[shardcanary::test]
async fn unknown_namespace_yields_empty_negative_response() {
    let resp = handler()
        .ping(tonic::Request::new(ping("bogus", "7")))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(
        resp,
        pb::PingResponse {
            executor_id: String::new(),
            owns_shard: false,
            shard_key: "7".to_string(),
        }
    );
}

#[shardcanary::test]
async fn owned_shard_is_confirmed() {
    let resp = handler()
        .ping(tonic::Request::new(ping("ns1", "shard-1")))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(
        resp,
        pb::PingResponse {
            executor_id: "127.0.0.1:7953".to_string(),
            owns_shard: true,
            shard_key: "shard-1".to_string(),
        }
    );
}

#[shardcanary::test]
async fn missing_shard_is_denied_with_executor_id() {
    let resp = handler()
        .ping(tonic::Request::new(ping("ns1", "shard-2")))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(
        resp,
        pb::PingResponse {
            executor_id: "127.0.0.1:7953".to_string(),
            owns_shard: false,
            shard_key: "shard-2".to_string(),
        }
    );
}

#[shardcanary::test]
fn repeated_checks_are_identical() {
    let handler = handler();
    for request in [ping("ns1", "shard-1"), ping("ns1", "shard-2"), ping("bogus", "7")] {
        assert_eq!(
            handler.check_ownership(&request),
            handler.check_ownership(&request)
        );
    }
}

#[shardcanary::test]
fn namespace_match_is_exact() {
    let handler = handler();
    assert!(handler.check_ownership(&ping("NS1", "shard-1")).executor_id.is_empty());
    assert!(handler.check_ownership(&ping("ns1 ", "shard-1")).executor_id.is_empty());
}

#[shardcanary::test]
fn executor_without_address_reports_empty_id() {
    let mut executor = StaticOwnership::new("ns2", "", &["a"]);
    executor.metadata.clear();
    let registry = ExecutorRegistry::new([Arc::new(executor) as Arc<dyn ShardOwnership>]).unwrap();
    let resp = PingHandler::new(registry, None).check_ownership(&ping("ns2", "a"));
    assert_eq!(resp.executor_id, "");
    assert!(resp.owns_shard);
}

#[shardcanary::test]
async fn namespace_header_is_used_when_body_is_empty() {
    let mut request = tonic::Request::new(ping("", "shard-1"));
    request
        .metadata_mut()
        .insert(NAMESPACE_HEADER, "ns1".parse().unwrap());
    let resp = handler().ping(request).await.unwrap().into_inner();
    assert!(resp.owns_shard);
    assert_eq!(resp.executor_id, "127.0.0.1:7953");
}

#[shardcanary::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_pings_all_answer() {
    let handler = Arc::new(handler());
    let tasks: Vec<_> = (0..64)
        .map(|i| {
            let handler = handler.clone();
            tokio::spawn(async move {
                let key = if i % 2 == 0 { "shard-1" } else { "shard-2" };
                let resp = handler
                    .ping(tonic::Request::new(ping("ns1", key)))
                    .await
                    .unwrap()
                    .into_inner();
                (key, resp.owns_shard)
            })
        })
        .collect();
    for task in tasks {
        let (key, owns) = task.await.unwrap();
        assert_eq!(owns, key == "shard-1");
    }
}

#[shardcanary::test]
fn duplicate_namespaces_are_rejected() {
    let a: Arc<dyn ShardOwnership> = Arc::new(StaticOwnership::new("ns1", "a:1", &[]));
    let b: Arc<dyn ShardOwnership> = Arc::new(StaticOwnership::new("ns1", "b:1", &[]));
    assert!(ExecutorRegistry::new([a, b]).is_err());
}

#[shardcanary::test]
fn handled_pings_are_counted() {
    let m = metrics::init().unwrap();
    let executor: Arc<dyn ShardOwnership> =
        Arc::new(StaticOwnership::new("ns1", "127.0.0.1:7953", &["shard-1"]));
    let handler = PingHandler::new(ExecutorRegistry::new([executor]).unwrap(), Some(m.clone()));
    handler.check_ownership(&ping("ns1", "shard-1"));
    handler.check_ownership(&ping("ns1", "shard-2"));
    let text = m.encode_text().unwrap();
    assert!(text.contains(r#"shardcanary_pings_handled_total{namespace="ns1",owns_shard="true"} 1"#));
    assert!(text.contains(r#"shardcanary_pings_handled_total{namespace="ns1",owns_shard="false"} 1"#));
}

#[shardcanary::test]
fn pings_for_unknown_namespaces_are_counted_as_not_owned() {
    let m = metrics::init().unwrap();
    let executor: Arc<dyn ShardOwnership> =
        Arc::new(StaticOwnership::new("ns1", "127.0.0.1:7953", &["shard-1"]));
    let handler = PingHandler::new(ExecutorRegistry::new([executor]).unwrap(), Some(m.clone()));
    let resp = handler.check_ownership(&ping("bogus", "7"));
    assert!(!resp.owns_shard);
    assert!(resp.executor_id.is_empty());
    let text = m.encode_text().unwrap();
    assert!(text.contains(r#"shardcanary_pings_handled_total{namespace="bogus",owns_shard="false"} 1"#));
    assert!(!text.contains(r#"namespace="ns1",owns_shard"#));
}
