//! Session lifecycle against the in-memory directory
//!
//! Open, StartTLS, bind and unbind on the mock strategies, lazy
//! (deferred) execution, and the automatic bind run by
//! `SessionBuilder::connect`.

mod common;

use common::{admin_config, init_tracing, populated_directory, ADMIN, BASE};
use dirclient::{
    AuthenticationKind, AutoBind, DirectoryEvent, ErrorKind, Outcome, ServerInfoMode, Session,
    SessionConfig, SessionError, StrategyKind,
};
use dirproto::builder::SearchParams;
use dirproto::{Operation, ResultCode, WHO_AM_I_OID};

#[tokio::test]
async fn test_bind_and_unbind_on_mock_strategies() {
    init_tracing();
    for strategy in [StrategyKind::MockSync, StrategyKind::MockAsync] {
        let directory = populated_directory();
        let session = Session::builder(admin_config(strategy))
            .mock_directory(directory.clone())
            .build()
            .unwrap();
        assert_eq!(session.strategy_kind().await, strategy);

        assert!(session.open().await.unwrap());
        assert!(!session.is_closed().await);
        assert!(session.is_listening().await);
        let info = session.server_info().await.expect("root DSE read at open");
        assert_eq!(info.naming_contexts, vec![BASE.to_string()]);

        assert!(session.bind(&[]).await.unwrap(), "{} bind", strategy);
        assert!(session.is_bound().await);
        assert!(session.status().await.contains(" - bound - "));

        assert!(session.unbind().await);
        assert!(session.is_closed().await);
        assert!(!session.is_bound().await);
        assert!(!session.is_listening().await);
        assert_eq!(directory.count(Operation::Unbind), 1);
        assert_eq!(directory.events().last(), Some(&DirectoryEvent::Close));
    }
}

#[tokio::test]
async fn test_bind_opens_the_connection_itself() {
    let directory = populated_directory();
    let session = Session::builder(admin_config(StrategyKind::MockSync))
        .mock_directory(directory.clone())
        .build()
        .unwrap();

    assert!(session.bind(&[]).await.unwrap());
    assert!(!session.is_closed().await);
    assert!(matches!(directory.events()[0], DirectoryEvent::Open(_)));
}

#[tokio::test]
async fn test_failed_bind_sets_last_error() {
    let directory = populated_directory();
    let mut config = admin_config(StrategyKind::MockSync);
    config.password = Some("wrong".into());
    let session = Session::builder(config)
        .mock_directory(directory)
        .build()
        .unwrap();

    assert!(!session.bind(&[]).await.unwrap());
    assert!(!session.is_bound().await);
    let error = session.last_error().await.unwrap();
    assert_eq!(error.kind, ErrorKind::BindFailure);
    assert_eq!(
        session.last_result().await.unwrap().code,
        ResultCode::INVALID_CREDENTIALS
    );
}

#[tokio::test]
async fn test_failed_bind_raises_in_raising_mode() {
    let mut config = admin_config(StrategyKind::MockSync);
    config.password = Some("wrong".into());
    config.raise_exceptions = true;
    let session = Session::builder(config)
        .mock_directory(populated_directory())
        .build()
        .unwrap();

    let err = session.bind(&[]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OperationResult);
    assert_eq!(err.result().unwrap().code, ResultCode::INVALID_CREDENTIALS);
    assert!(!session.is_bound().await);
}

#[tokio::test]
async fn test_anonymous_bind() {
    let config = SessionConfig::default().with_strategy(StrategyKind::MockSync);
    let session = Session::builder(config)
        .mock_directory(populated_directory())
        .build()
        .unwrap();
    assert!(session.bind(&[]).await.unwrap());
    assert!(session.status().await.contains("user: <anonymous>"));
}

#[tokio::test]
async fn test_start_tls_requires_an_open_session() {
    let mut config = admin_config(StrategyKind::MockSync);
    config.raise_exceptions = true;
    let session = Session::builder(config)
        .mock_directory(populated_directory())
        .build()
        .unwrap();

    let err = session.start_tls().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TransportFailure);

    session.open().await.unwrap();
    assert!(session.start_tls().await.unwrap());
    assert!(session.tls_started().await);
}

#[tokio::test]
async fn test_start_tls_skipped_on_ldaps() {
    let directory = populated_directory();
    let config = admin_config(StrategyKind::MockSync).with_urls(["ldaps://directory.test:636"]);
    let session = Session::builder(config)
        .mock_directory(directory.clone())
        .build()
        .unwrap();

    session.open().await.unwrap();
    assert!(!session.start_tls().await.unwrap());
    assert_eq!(directory.count(Operation::Extended), 0);
    assert!(session.status().await.contains("ssl"));
}

#[tokio::test]
async fn test_lazy_steps_resolve_once_in_order() {
    init_tracing();
    let directory = populated_directory();
    let mut config = admin_config(StrategyKind::MockSync);
    config.lazy = true;
    let session = Session::builder(config)
        .mock_directory(directory.clone())
        .build()
        .unwrap();

    assert!(session.open().await.unwrap());
    assert!(session.start_tls().await.unwrap());
    assert!(session.bind(&[]).await.unwrap());

    // nothing reached the directory yet
    assert!(directory.events().is_empty());
    assert!(session.is_bound().await);
    assert!(session.tls_started().await);
    let status = session.status().await;
    assert!(status.contains("deferred open"), "{}", status);
    assert!(status.contains("deferred bind"), "{}", status);
    assert_eq!(session.deferred_resolutions().await, 0);

    let people = SearchParams::new("ou=people,dc=example,dc=com", "(objectClass=person)");
    assert_eq!(session.search(&people, &[]).await.unwrap(), Outcome::Done(true));

    let events = directory.events();
    assert!(matches!(events[0], DirectoryEvent::Open(_)));
    assert_eq!(
        &events[1..],
        &[
            DirectoryEvent::Request(Operation::Extended),
            DirectoryEvent::StartTls,
            DirectoryEvent::Request(Operation::Bind),
            // root DSE read after resolution, then the caller's search
            DirectoryEvent::Request(Operation::Search),
            DirectoryEvent::Request(Operation::Search),
        ]
    );
    assert_eq!(session.deferred_resolutions().await, 1);
    assert!(session.server_info().await.is_some());

    // later operations find nothing left to resolve
    session.search(&people, &[]).await.unwrap();
    assert_eq!(directory.count(Operation::Bind), 1);
    assert_eq!(directory.count(Operation::Extended), 1);
    assert_eq!(directory.count(Operation::Search), 3);
    assert_eq!(session.deferred_resolutions().await, 2);
    assert!(session.status().await.contains(" - bound - open - tls started"));
}

#[tokio::test]
async fn test_lazy_unbind_before_any_operation_sends_nothing() {
    let directory = populated_directory();
    let mut config = admin_config(StrategyKind::MockSync);
    config.lazy = true;
    let session = Session::builder(config)
        .mock_directory(directory.clone())
        .build()
        .unwrap();

    session.open().await.unwrap();
    session.bind(&[]).await.unwrap();
    assert!(session.unbind().await);

    assert!(directory.events().is_empty());
    assert!(session.is_closed().await);
    assert!(!session.is_bound().await);
}

#[tokio::test]
async fn test_lazy_resolution_failure_is_reported_by_the_operation() {
    let directory = populated_directory();
    let mut config = admin_config(StrategyKind::MockSync);
    config.lazy = true;
    config.raise_exceptions = true;
    config.sasl_mechanism = Some("PLAIN".into());
    config.authentication = Some(AuthenticationKind::Sasl);
    let session = Session::builder(config)
        .mock_directory(directory.clone())
        .build()
        .unwrap();

    session.bind(&[]).await.unwrap();
    let err = session
        .search(&SearchParams::new(BASE, "(objectClass=*)"), &[])
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::UnsupportedMechanism(_)));
    assert_eq!(directory.count(Operation::Search), 0);
}

#[tokio::test]
async fn test_auto_bind_variants() {
    for mode in [AutoBind::NoTls, AutoBind::TlsBeforeBind, AutoBind::TlsAfterBind] {
        let directory = populated_directory();
        let mut config = admin_config(StrategyKind::MockSync);
        config.auto_bind = mode;
        let session = Session::builder(config)
            .mock_directory(directory.clone())
            .connect()
            .await
            .unwrap();

        assert!(session.is_bound().await, "{:?}", mode);
        assert_eq!(session.tls_started().await, mode != AutoBind::NoTls);
        assert!(session.server_info().await.is_some());

        let operations: Vec<DirectoryEvent> = directory
            .events()
            .into_iter()
            .filter(|e| matches!(e, DirectoryEvent::Request(_)))
            .collect();
        let expected = match mode {
            AutoBind::TlsBeforeBind => vec![Operation::Extended, Operation::Bind, Operation::Search],
            AutoBind::TlsAfterBind => vec![Operation::Bind, Operation::Extended, Operation::Search],
            _ => vec![Operation::Bind, Operation::Search],
        };
        assert_eq!(
            operations,
            expected
                .into_iter()
                .map(DirectoryEvent::Request)
                .collect::<Vec<_>>()
        );
    }
}

#[tokio::test]
async fn test_auto_bind_failure_is_a_bind_failure() {
    let mut config = admin_config(StrategyKind::MockSync);
    config.auto_bind = AutoBind::NoTls;
    config.password = Some("wrong".into());
    let err = Session::builder(config)
        .mock_directory(populated_directory())
        .connect()
        .await
        .unwrap_err();

    match err {
        SessionError::BindFailure(message) => {
            assert!(message.starts_with("automatic bind not successful - "));
            assert!(message.ends_with("invalidCredentials"), "{}", message);
        }
        other => panic!("expected a bind failure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_no_auto_bind_leaves_session_closed() {
    let directory = populated_directory();
    let session = Session::builder(admin_config(StrategyKind::MockSync))
        .mock_directory(directory.clone())
        .connect()
        .await
        .unwrap();
    assert!(session.is_closed().await);
    assert!(directory.events().is_empty());
}

#[tokio::test]
async fn test_server_info_mode_none_skips_root_dse() {
    let directory = populated_directory();
    let mut config = admin_config(StrategyKind::MockSync);
    config.server_info = ServerInfoMode::None;
    let session = Session::builder(config)
        .mock_directory(directory.clone())
        .build()
        .unwrap();

    session.open().await.unwrap();
    session.bind(&[]).await.unwrap();
    assert!(session.server_info().await.is_none());
    assert_eq!(directory.count(Operation::Search), 0);
}

#[tokio::test]
async fn test_refresh_keeps_last_response() {
    let directory = populated_directory();
    directory.set_root_dse_attribute("vendorName", vec!["Example Directory"]);
    let session = Session::builder(admin_config(StrategyKind::MockSync))
        .mock_directory(directory)
        .build()
        .unwrap();
    session.bind(&[]).await.unwrap();

    let people = SearchParams::new("ou=people,dc=example,dc=com", "(objectClass=person)");
    session.search(&people, &[]).await.unwrap();
    let before = session.last_response().await;
    assert_eq!(before.len(), 3);

    session.refresh_server_info().await.unwrap();
    assert_eq!(session.last_response().await, before);
    assert_eq!(
        session.server_info().await.unwrap().vendor_name.as_deref(),
        Some("Example Directory")
    );
}

#[tokio::test]
async fn test_sasl_external_bind() {
    let directory = populated_directory();
    let mut config = SessionConfig::default().with_strategy(StrategyKind::MockSync);
    config.authentication = Some(AuthenticationKind::Sasl);
    config.sasl_mechanism = Some("EXTERNAL".into());
    let session = Session::builder(config)
        .mock_directory(directory)
        .build()
        .unwrap();

    assert!(session.bind(&[]).await.unwrap());
    let outcome = session.extended(WHO_AM_I_OID, None, &[]).await.unwrap();
    assert_eq!(outcome, Outcome::Done(true));
    let result = session.last_result().await.unwrap();
    assert_eq!(result.response_value.as_deref(), Some(&b"dn:cn=external"[..]));
}

#[tokio::test]
async fn test_unsupported_sasl_mechanism() {
    let mut config = SessionConfig::default().with_strategy(StrategyKind::MockSync);
    config.authentication = Some(AuthenticationKind::Sasl);
    config.sasl_mechanism = Some("GSSAPI".into());
    let directory = populated_directory();
    let session = Session::builder(config)
        .mock_directory(directory.clone())
        .build()
        .unwrap();

    assert!(!session.bind(&[]).await.unwrap());
    assert_eq!(
        session.last_error().await.unwrap().kind,
        ErrorKind::UnsupportedMechanism
    );
    assert_eq!(directory.count(Operation::Bind), 0);
}

#[tokio::test]
async fn test_who_am_i_after_simple_bind() {
    let session = Session::builder(admin_config(StrategyKind::MockAsync))
        .mock_directory(populated_directory())
        .build()
        .unwrap();
    session.bind(&[]).await.unwrap();

    let Outcome::Pending(id) = session.extended(WHO_AM_I_OID, None, &[]).await.unwrap() else {
        panic!("asynchronous strategy leaves the operation pending");
    };
    let collected = session.get_response(id).await.unwrap();
    let expected = format!("dn:{}", ADMIN);
    assert_eq!(
        collected.result.unwrap().response_value.as_deref(),
        Some(expected.as_bytes())
    );
}

#[tokio::test]
async fn test_usage_collected_only_when_enabled() {
    let mut config = admin_config(StrategyKind::MockSync);
    config.collect_usage = true;
    let session = Session::builder(config)
        .mock_directory(populated_directory())
        .build()
        .unwrap();
    session.bind(&[]).await.unwrap();
    session
        .search(&SearchParams::new(BASE, "(objectClass=person)"), &[])
        .await
        .unwrap();
    session.unbind().await;

    let usage = session.usage().await.unwrap();
    assert_eq!(usage.open_sockets, 1);
    assert_eq!(usage.closed_sockets, 1);
    assert_eq!(usage.bind_operations, 1);
    // root DSE after the bind, then the search
    assert_eq!(usage.search_operations, 2);
    assert_eq!(usage.unbind_operations, 1);
}
