//! End-to-end admission scenarios driven through `tonic::Request`.

use std::sync::Arc;
use std::time::Duration;

use rategate::grpc::{
    Admission, CallContext, CallGate, FieldTag, FieldTagAttributes, MetadataIdentity,
};
use rategate::ratelimit::{
    CounterStore, InMemoryCounterStore, ManualClock, MethodRegistry, Rule, RuleSource,
    ServiceDescriptor, StaticRules, TimeUnit,
};
use serde::Serialize;
use tonic::metadata::MetadataMap;
use tonic::{Code, Request, Response, Status};

const SAY: &str = "/pkg.Echo/Say";

#[derive(Debug, Serialize)]
struct SayRequest {
    message: String,
    region: String,
}

fn request(user: &str, region: &str) -> Request<SayRequest> {
    let mut request = Request::new(SayRequest {
        message: format!("hello from {user}"),
        region: region.to_string(),
    });
    request
        .metadata_mut()
        .insert("x-user-id", user.parse().unwrap());
    request
}

async fn echo(request: Request<SayRequest>) -> Result<Response<String>, Status> {
    Ok(Response::new(request.into_inner().message))
}

fn say_rules(rules: Vec<Rule>) -> RuleSource {
    RuleSource::new(Arc::new(
        MethodRegistry::new().register(ServiceDescriptor::new("pkg.Echo").method("Say", rules)),
    ))
}

#[tokio::test]
async fn test_per_minute_limit_is_per_identity() {
    let store = Arc::new(InMemoryCounterStore::new());
    let gate = CallGate::builder()
        .namespace("svc")
        .store(store.clone())
        .rule_source(say_rules(vec![
            Rule::new("per_minute", 2, Duration::from_secs(60)).unwrap()
        ]))
        .identity_provider(MetadataIdentity::new("x-user-id"))
        .build();

    assert!(gate.intercept(SAY, request("u1", "eu"), echo).await.is_ok());
    assert!(gate.intercept(SAY, request("u1", "eu"), echo).await.is_ok());

    let status = gate
        .intercept(SAY, request("u1", "eu"), echo)
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::ResourceExhausted);
    assert!(status.message().contains("per_minute"));

    let response = gate.intercept(SAY, request("u2", "eu"), echo).await.unwrap();
    assert_eq!(response.into_inner(), "hello from u2");

    assert_eq!(store.count("rate-limiter:svc:u1:/pkg.Echo/Say:per_minute"), Some(3));
    assert_eq!(store.count("rate-limiter:svc:u2:/pkg.Echo/Say:per_minute"), Some(1));
}

#[tokio::test]
async fn test_global_qps_rejects_under_method_limit() {
    let gate = CallGate::builder()
        .global_rules(vec![Rule::per("global_qps", 1, TimeUnit::Second).unwrap()])
        .rule_source(say_rules(vec![
            Rule::per("per_minute", 5, TimeUnit::Minute).unwrap()
        ]))
        .identity_provider(MetadataIdentity::new("x-user-id"))
        .build();

    assert!(gate.intercept(SAY, request("u1", "eu"), echo).await.is_ok());

    let status = gate
        .intercept(SAY, request("u1", "eu"), echo)
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::ResourceExhausted);
    assert_eq!(status.message(), "rate limit exceeded: global_qps");
}

#[tokio::test]
async fn test_rejection_names_every_exceeded_rule() {
    let gate = CallGate::builder()
        .rule_source(RuleSource::new(Arc::new(StaticRules::default().with_method(
            SAY,
            vec![
                Rule::per("first", 1, TimeUnit::Minute).unwrap(),
                Rule::per("second", 10, TimeUnit::Minute).unwrap(),
                Rule::per("third", 1, TimeUnit::Minute).unwrap(),
            ],
        ))))
        .build();

    let metadata = MetadataMap::new();
    let call = CallContext::new(SAY, &metadata);

    assert!(gate.admit(&call, &()).await.unwrap().is_proceed());
    let admission = gate.admit(&call, &()).await.unwrap();
    assert_eq!(admission.rule_names(), vec!["first", "third"]);
    assert!(matches!(admission, Admission::Rejected(ref rules) if rules.len() == 2));
}

#[tokio::test]
async fn test_window_rollover_readmits_caller() {
    let clock = Arc::new(ManualClock::new());
    let gate = CallGate::builder()
        .store(Arc::new(InMemoryCounterStore::with_clock(clock.clone())))
        .rule_source(say_rules(vec![
            Rule::new("per_minute", 1, Duration::from_secs(60)).unwrap()
        ]))
        .identity_provider(MetadataIdentity::new("x-user-id"))
        .build();

    assert!(gate.intercept(SAY, request("u1", "eu"), echo).await.is_ok());
    assert!(gate.intercept(SAY, request("u1", "eu"), echo).await.is_err());

    clock.advance(Duration::from_secs(61));
    assert!(gate.intercept(SAY, request("u1", "eu"), echo).await.is_ok());
}

#[tokio::test]
async fn test_payload_attributes_split_counters() {
    let gate = CallGate::builder()
        .rule_source(say_rules(vec![
            Rule::per("per_region", 1, TimeUnit::Minute).unwrap()
        ]))
        .identity_provider(FieldTagAttributes::new(
            MetadataIdentity::new("x-user-id"),
            vec![FieldTag::new("region", "/region")],
        ))
        .build();

    assert!(gate.intercept(SAY, request("u1", "eu"), echo).await.is_ok());
    assert!(gate.intercept(SAY, request("u1", "us"), echo).await.is_ok());
    assert!(gate.intercept(SAY, request("u1", "eu"), echo).await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_calls_admit_exactly_limit() {
    const LIMIT: usize = 20;
    let store: Arc<dyn CounterStore> = Arc::new(InMemoryCounterStore::new());
    let gate = Arc::new(
        CallGate::builder()
            .store(store)
            .rule_source(say_rules(vec![
                Rule::per("per_minute", LIMIT as u64, TimeUnit::Minute).unwrap()
            ]))
            .identity_provider(MetadataIdentity::new("x-user-id"))
            .build(),
    );

    let handles: Vec<_> = (0..LIMIT * 2)
        .map(|_| {
            let gate = gate.clone();
            tokio::spawn(async move {
                gate.intercept(SAY, request("u1", "eu"), echo).await.is_ok()
            })
        })
        .collect();

    let admitted = futures::future::join_all(handles)
        .await
        .into_iter()
        .filter(|r| *r.as_ref().unwrap())
        .count();

    assert_eq!(admitted, LIMIT);
}
