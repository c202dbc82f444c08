//! Wire strategies over in-memory links
//!
//! SYNC, ASYNC, RESTARTABLE and REUSABLE run their own code paths here;
//! only the socket is replaced by `DirectoryConnector`.

mod common;

use bytes::Bytes;
use common::{admin_config, init_tracing, populated_directory, DirectoryConnector, ADMIN, BASE};
use dirauth::{AuthError, ChallengeResponseClient, ChallengeResponseFactory};
use dirclient::{
    AuthenticationKind, DirectoryEvent, ErrorKind, Outcome, PooledBindPolicy, Session,
    SessionConfig, SessionError, StrategyKind,
};
use dirproto::builder::SearchParams;
use dirproto::{BindAuthentication, Operation, Request, ResultCode};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn people() -> SearchParams {
    SearchParams::new("ou=people,dc=example,dc=com", "(objectClass=person)").attributes(["cn"])
}

fn session_over(config: SessionConfig, connector: &DirectoryConnector) -> Session {
    Session::builder(config)
        .connector(Arc::new(connector.clone()))
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_synchronous_round_trip() {
    init_tracing();
    let directory = populated_directory();
    let connector = DirectoryConnector::new(directory);
    let mut config = admin_config(StrategyKind::Sync);
    config.collect_usage = true;
    let session = session_over(config, &connector);

    assert!(session.open().await.unwrap());
    assert!(session.start_tls().await.unwrap());
    assert!(session.bind(&[]).await.unwrap());
    assert_eq!(session.search(&people(), &[]).await.unwrap(), Outcome::Done(true));
    assert_eq!(session.entries().await.unwrap().len(), 3);
    session.unbind().await;

    assert_eq!(connector.connects(), 1);
    let usage = session.usage().await.unwrap();
    assert_eq!(usage.open_sockets, 1);
    assert_eq!(usage.closed_sockets, 1);
    assert_eq!(usage.extended_operations, 1);
    // root DSE after open, after StartTLS and after bind, then the people
    assert_eq!(usage.search_operations, 4);
    assert_eq!(usage.entries_received, 6);
    assert!(matches!(connector.requests().last(), Some(Request::Unbind)));
}

#[tokio::test]
async fn test_asynchronous_round_trip() {
    init_tracing();
    let directory = populated_directory();
    let connector = DirectoryConnector::new(Arc::clone(&directory));
    let session = session_over(admin_config(StrategyKind::Async), &connector);

    assert!(session.open().await.unwrap());
    // queued; the I/O task upgrades the link when the answer arrives
    assert!(session.start_tls().await.unwrap());
    assert!(session.bind(&[]).await.unwrap());
    assert!(session.server_info().await.is_some());

    let outcome = session.search(&people(), &[]).await.unwrap();
    let id = outcome.message_id().expect("asynchronous search is pending");
    let collected = session.get_response(id).await.unwrap();
    assert!(collected.is_success());
    assert_eq!(collected.responses.len(), 3);
    assert_eq!(session.last_response().await.len(), 3);
    assert!(directory.events().contains(&DirectoryEvent::StartTls));

    // a second collect of the same id finds nothing
    assert!(session.get_response(id).await.is_err());
    session.unbind().await;
    assert!(session.is_closed().await);
}

#[tokio::test]
async fn test_asynchronous_operations_interleave() {
    let directory = populated_directory();
    let connector = DirectoryConnector::new(directory);
    let session = session_over(admin_config(StrategyKind::Async), &connector);
    session.bind(&[]).await.unwrap();

    let first = session.search(&people(), &[]).await.unwrap();
    let second = session
        .compare("cn=alice,ou=people,dc=example,dc=com", "uidNumber", "1001", &[])
        .await
        .unwrap();
    let (Outcome::Pending(first), Outcome::Pending(second)) = (first, second) else {
        panic!("both operations should be pending");
    };

    let compared = session.get_response(second).await.unwrap();
    assert_eq!(compared.result.unwrap().code, ResultCode::COMPARE_TRUE);
    let searched = session.get_response(first).await.unwrap();
    assert_eq!(searched.responses.len(), 3);
}

#[tokio::test]
async fn test_refused_connection_is_a_transport_failure() {
    let directory = populated_directory();
    let connector = DirectoryConnector::refusing(directory);
    let mut config = admin_config(StrategyKind::Sync);
    config.collect_usage = true;
    let session = session_over(config, &connector);

    assert!(!session.open().await.unwrap());
    assert_eq!(
        session.last_error().await.unwrap().kind,
        ErrorKind::TransportFailure
    );
    assert!(session.is_closed().await);
    assert_eq!(session.usage().await.unwrap().failed_sockets, 1);
}

#[tokio::test]
async fn test_next_endpoint_tried_after_a_failure() {
    let directory = populated_directory();
    let connector = DirectoryConnector::new(directory).refuse_host("first.test");
    let mut config = admin_config(StrategyKind::Sync);
    config.collect_usage = true;
    config.urls = vec![
        "ldap://first.test:389".into(),
        "ldap://second.test:389".into(),
    ];
    let session = session_over(config, &connector);

    assert!(session.open().await.unwrap());
    assert_eq!(session.endpoint().await.unwrap().host, "second.test");
    assert_eq!(connector.connects(), 1);
    let usage = session.usage().await.unwrap();
    assert_eq!(usage.failed_sockets, 1);
    assert_eq!(usage.open_sockets, 1);

    // the refused endpoint is not tried again after a reconnect
    session.unbind().await;
    assert!(session.open().await.unwrap());
    assert_eq!(session.usage().await.unwrap().failed_sockets, 1);
    assert_eq!(connector.connects(), 2);
}

#[tokio::test]
async fn test_synchronous_transport_failure_closes_the_session() {
    let directory = populated_directory();
    let connector = DirectoryConnector::new(directory);
    let session = session_over(admin_config(StrategyKind::Sync), &connector);
    session.bind(&[]).await.unwrap();

    connector.fail_sends(1);
    assert_eq!(session.search(&people(), &[]).await.unwrap(), Outcome::Done(false));
    assert_eq!(
        session.last_error().await.unwrap().kind,
        ErrorKind::TransportFailure
    );
    assert!(session.is_closed().await);
    assert!(!session.is_bound().await);
    assert_eq!(connector.connects(), 1);
}

#[tokio::test]
async fn test_restartable_retries_once() {
    init_tracing();
    let directory = populated_directory();
    let connector = DirectoryConnector::new(Arc::clone(&directory));
    let mut config = admin_config(StrategyKind::Restartable);
    config.collect_usage = true;
    let session = session_over(config, &connector);
    session.bind(&[]).await.unwrap();
    directory.clear_events();

    connector.fail_sends(1);
    assert_eq!(session.search(&people(), &[]).await.unwrap(), Outcome::Done(true));
    assert_eq!(connector.connects(), 2);
    assert!(session.is_bound().await);
    // the bind was replayed on the new connection before the search
    assert_eq!(
        directory.events(),
        vec![
            DirectoryEvent::Request(Operation::Bind),
            DirectoryEvent::Request(Operation::Search),
        ]
    );
    let usage = session.usage().await.unwrap();
    assert_eq!(usage.restartable_failures, 1);
    assert_eq!(usage.restartable_successes, 1);
}

#[tokio::test]
async fn test_restartable_reports_a_second_failure() {
    let directory = populated_directory();
    let connector = DirectoryConnector::new(directory);
    let mut config = admin_config(StrategyKind::Restartable);
    config.raise_exceptions = true;
    let session = session_over(config, &connector);
    session.bind(&[]).await.unwrap();

    // the search fails, and so does the rebind after reconnecting
    connector.fail_sends(2);
    let err = session.search(&people(), &[]).await.unwrap_err();
    assert!(err.is_transport_failure(), "{:?}", err);
    assert_eq!(err.kind(), ErrorKind::TransportFailure);
    assert!(session.is_closed().await);
    assert_eq!(
        session.last_error().await.unwrap().kind,
        ErrorKind::TransportFailure
    );
}

#[tokio::test]
async fn test_pool_spreads_work_over_workers() {
    init_tracing();
    let directory = populated_directory();
    let connector = DirectoryConnector::new(Arc::clone(&directory));
    let mut config = admin_config(StrategyKind::Reusable);
    config.pool_size = 3;
    config.collect_usage = true;
    let session = session_over(config, &connector);

    assert!(session.open().await.unwrap());
    assert_eq!(connector.connects(), 3);
    // server info is not read through a pool
    assert!(session.server_info().await.is_none());

    assert!(session.bind(&[]).await.unwrap());
    assert!(session.is_bound().await);
    assert_eq!(directory.count(Operation::Bind), 3);

    let mut tickets = Vec::new();
    for _ in 0..4 {
        match session.search(&people(), &[]).await.unwrap() {
            Outcome::Pending(ticket) => tickets.push(ticket),
            other => panic!("pooled operations are answered with a ticket, got {}", other),
        }
    }
    for ticket in tickets {
        let collected = session.get_response(ticket).await.unwrap();
        assert_eq!(collected.responses.len(), 3);
    }

    session.unbind().await;
    let usage = session.usage().await.unwrap();
    assert_eq!(usage.open_sockets, 3);
    assert_eq!(usage.closed_sockets, 3);
    assert_eq!(usage.search_operations, 4);
    assert_eq!(usage.unbind_operations, 3);
}

#[tokio::test]
async fn test_pool_confirm_policy_reports_bind_failure() {
    let directory = populated_directory();
    let connector = DirectoryConnector::new(directory);
    let mut config = admin_config(StrategyKind::Reusable);
    config.pool_size = 2;
    config.pool_bind_policy = PooledBindPolicy::Confirm;
    config.password = Some("wrong".into());
    let session = session_over(config, &connector);

    assert!(!session.bind(&[]).await.unwrap());
    assert!(!session.is_bound().await);
    assert_eq!(
        session.last_error().await.unwrap().kind,
        ErrorKind::BindFailure
    );
}

#[tokio::test]
async fn test_pool_optimistic_policy_assumes_success() {
    let directory = populated_directory();
    let connector = DirectoryConnector::new(directory);
    let mut config = admin_config(StrategyKind::Reusable);
    config.pool_size = 2;
    config.password = Some("wrong".into());
    let session = session_over(config, &connector);

    assert!(session.bind(&[]).await.unwrap());
    assert!(session.is_bound().await);
}

#[tokio::test]
async fn test_pool_of_asynchronous_workers() {
    let directory = populated_directory();
    let connector = DirectoryConnector::new(directory);
    let mut config = admin_config(StrategyKind::Reusable);
    config.pool_size = 2;
    config.pool_async = true;
    let session = session_over(config, &connector);

    assert!(session.bind(&[]).await.unwrap());
    let ticket = session.search(&people(), &[]).await.unwrap().message_id().unwrap();
    assert!(session.abandon(ticket, &[]).await.unwrap());
    assert!(session.get_response(ticket).await.is_err());

    let ticket = session.search(&people(), &[]).await.unwrap().message_id().unwrap();
    assert_eq!(session.get_response(ticket).await.unwrap().responses.len(), 3);
}

#[tokio::test]
async fn test_abandon_while_another_task_waits_for_the_response() {
    init_tracing();
    let directory = populated_directory();
    let connector = DirectoryConnector::new(directory);
    let session = session_over(admin_config(StrategyKind::Async), &connector);
    session.bind(&[]).await.unwrap();
    connector.mute(Operation::Search);

    let id = session.search(&people(), &[]).await.unwrap().message_id().unwrap();
    let waiter = tokio::spawn({
        let session = session.clone();
        async move { session.get_response(id).await }
    });
    // let the waiter park on the unanswered search
    tokio::time::sleep(Duration::from_millis(20)).await;

    let abandoned = tokio::time::timeout(Duration::from_secs(2), session.abandon(id, &[]))
        .await
        .expect("abandon blocked behind get_response");
    assert!(abandoned.unwrap());
    let waited = tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .expect("waiter not woken by abandon")
        .unwrap();
    assert!(waited.is_err());
    assert!(matches!(
        connector.requests().last(),
        Some(Request::Abandon { message_id }) if *message_id == id
    ));

    assert!(tokio::time::timeout(Duration::from_secs(2), session.unbind())
        .await
        .unwrap());
    assert!(session.is_closed().await);
}

#[tokio::test]
async fn test_uncollected_asynchronous_responses_are_dropped() {
    let directory = populated_directory();
    let connector = DirectoryConnector::new(directory);
    let mut config = admin_config(StrategyKind::Async);
    config.uncollected_age = Some(Duration::from_millis(20));
    let session = session_over(config, &connector);
    session.bind(&[]).await.unwrap();

    let forgotten = session.search(&people(), &[]).await.unwrap().message_id().unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;

    // the next request sweeps the stale response away
    let id = session.search(&people(), &[]).await.unwrap().message_id().unwrap();
    assert_eq!(session.get_response(id).await.unwrap().responses.len(), 3);
    assert!(!session.abandon(forgotten, &[]).await.unwrap());
    assert!(session.get_response(forgotten).await.is_err());
}

#[tokio::test]
async fn test_pool_retires_expired_workers_despite_uncollected_tickets() {
    init_tracing();
    let directory = populated_directory();
    let connector = DirectoryConnector::new(Arc::clone(&directory));
    let mut config = admin_config(StrategyKind::Reusable);
    config.pool_size = 1;
    config.pool_lifetime = Some(Duration::from_millis(20));
    config.uncollected_age = Some(Duration::from_millis(50));
    config.collect_usage = true;
    let session = session_over(config, &connector);
    session.bind(&[]).await.unwrap();

    let forgotten = session.search(&people(), &[]).await.unwrap().message_id().unwrap();
    for _ in 0..3 {
        tokio::time::sleep(Duration::from_millis(40)).await;
        let ticket = session.search(&people(), &[]).await.unwrap().message_id().unwrap();
        assert_eq!(session.get_response(ticket).await.unwrap().responses.len(), 3);
    }

    assert_eq!(connector.connects(), 4);
    let usage = session.usage().await.unwrap();
    assert_eq!(usage.workers_recycled, 3);
    assert_eq!(usage.open_sockets, 4);
    assert_eq!(usage.closed_sockets, 3);
    // counters of retired workers are kept
    assert_eq!(usage.search_operations, 4);
    assert_eq!(usage.bind_operations, 4);
    assert_eq!(directory.count(Operation::Bind), 4);

    // the forgotten ticket outlived the uncollected age
    assert!(session.get_response(forgotten).await.is_err());
    assert!(!session.abandon(forgotten, &[]).await.unwrap());
}

/// Challenge-response client that answers with the challenge it was given
struct EchoClient {
    seen: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl ChallengeResponseClient for EchoClient {
    fn negotiate(&mut self) -> dirauth::Result<Bytes> {
        Ok(Bytes::from_static(b"negotiate"))
    }

    fn authenticate(&mut self, challenge: &[u8]) -> dirauth::Result<Bytes> {
        self.seen
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(challenge.to_vec());
        Ok(Bytes::copy_from_slice(challenge))
    }
}

#[derive(Default)]
struct EchoFactory {
    seen: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl ChallengeResponseFactory for EchoFactory {
    fn create(
        &self,
        domain: &str,
        user: &str,
        _password: &[u8],
    ) -> dirauth::Result<Box<dyn ChallengeResponseClient>> {
        if domain != "EXAMPLE" || user != "admin" {
            return Err(AuthError::AuthenticationFailed(format!("{}\\{}", domain, user)));
        }
        Ok(Box::new(EchoClient {
            seen: Arc::clone(&self.seen),
        }))
    }
}

fn ntlm_config(strategy: StrategyKind) -> SessionConfig {
    let mut config = SessionConfig::default()
        .with_strategy(strategy)
        .with_credentials("EXAMPLE\\admin", "secret");
    config.authentication = Some(AuthenticationKind::Ntlm);
    config
}

#[tokio::test]
async fn test_ntlm_bind_runs_three_rounds() {
    let directory = populated_directory();
    let connector = DirectoryConnector::new(directory);
    let factory = Arc::new(EchoFactory::default());
    let session = Session::builder(ntlm_config(StrategyKind::Sync))
        .connector(Arc::new(connector.clone()))
        .challenge_response(factory.clone())
        .build()
        .unwrap();

    assert!(session.bind(&[]).await.unwrap());
    let rounds: Vec<BindAuthentication> = connector
        .requests()
        .into_iter()
        .filter_map(|request| match request {
            Request::Bind(bind) => Some(bind.authentication),
            _ => None,
        })
        .collect();
    assert_eq!(rounds.len(), 3);
    assert_eq!(rounds[0], BindAuthentication::SicilyPackageDiscovery);
    assert!(matches!(rounds[1], BindAuthentication::SicilyNegotiate(_)));
    assert_eq!(
        rounds[2],
        BindAuthentication::SicilyResponse(Bytes::from_static(
            dirclient::strategy::mock::directory::SICILY_CHALLENGE
        ))
    );
    assert_eq!(factory.seen.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_ntlm_without_package_or_offer() {
    let directory = populated_directory();
    let session = Session::builder(ntlm_config(StrategyKind::MockSync))
        .mock_directory(Arc::clone(&directory))
        .build()
        .unwrap();
    assert!(!session.bind(&[]).await.unwrap());
    assert_eq!(
        session.last_error().await.unwrap().kind,
        ErrorKind::MissingPackage
    );

    directory.set_sicily_packages("GSS-SPNEGO");
    let session = Session::builder(ntlm_config(StrategyKind::MockSync))
        .mock_directory(Arc::clone(&directory))
        .challenge_response(Arc::new(EchoFactory::default()))
        .build()
        .unwrap();
    assert!(!session.bind(&[]).await.unwrap());
    assert_eq!(
        session.last_error().await.unwrap().kind,
        ErrorKind::AuthMethodNotSupported
    );
    assert_eq!(directory.count(Operation::Bind), 1);
}

#[tokio::test]
async fn test_multi_round_bind_refused_by_pool() {
    let directory = populated_directory();
    let connector = DirectoryConnector::new(directory);
    let mut config = ntlm_config(StrategyKind::Reusable);
    config.pool_size = 2;
    config.raise_exceptions = true;
    let session = Session::builder(config)
        .connector(Arc::new(connector))
        .challenge_response(Arc::new(EchoFactory::default()))
        .build()
        .unwrap();

    let err = session.bind(&[]).await.unwrap_err();
    assert!(matches!(err, SessionError::Unsupported(_)), "{:?}", err);
    assert!(!session.is_bound().await);
}

#[tokio::test]
async fn test_whoami_reflects_the_bound_identity() {
    let directory = populated_directory();
    let connector = DirectoryConnector::new(directory);
    let session = session_over(admin_config(StrategyKind::Sync), &connector);
    session.bind(&[]).await.unwrap();

    session
        .extended(dirproto::WHO_AM_I_OID, None, &[])
        .await
        .unwrap();
    let value = session.last_result().await.unwrap().response_value.unwrap();
    assert_eq!(value, Bytes::from(format!("dn:{}", ADMIN)));

    let base = session.search(&SearchParams::new(BASE, "(dc=example)"), &[]).await.unwrap();
    assert!(base.is_success());
}
