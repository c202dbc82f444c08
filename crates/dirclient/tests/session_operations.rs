//! Directory operations through a bound session
//!
//! Writes, compare, paged search, abandon, read-only mode, change-set
//! validation and the typed entries view.

mod common;

use bytes::Bytes;
use common::{admin_config, populated_directory, BASE};
use dirclient::{
    signature, ChangeSet, ErrorKind, MockDirectory, Outcome, Session, SessionError, StrategyKind,
};
use dirproto::builder::{self, SearchParams};
use dirproto::{ChangeType, Modification, Operation, ResultCode, Scope};
use serde_json::json;
use std::sync::Arc;

const DAVE: &str = "cn=dave,ou=people,dc=example,dc=com";

async fn bound_session(strategy: StrategyKind, directory: &Arc<MockDirectory>) -> Session {
    let session = Session::builder(admin_config(strategy))
        .mock_directory(Arc::clone(directory))
        .build()
        .unwrap();
    assert!(session.bind(&[]).await.unwrap());
    session
}

#[tokio::test]
async fn test_add_compare_and_delete() {
    let directory = populated_directory();
    let session = bound_session(StrategyKind::MockSync, &directory).await;

    let added = session
        .add(DAVE, &["person"], [("cn", vec!["dave"]), ("sn", vec!["Dent"])], &[])
        .await
        .unwrap();
    assert_eq!(added, Outcome::Done(true));
    let entry = directory.entry(DAVE).unwrap();
    assert_eq!(entry.first_str("objectClass"), Some("person"));

    // adding it twice is refused by the directory
    let again = session
        .add(DAVE, &["person"], [("cn", vec!["dave"])], &[])
        .await
        .unwrap();
    assert_eq!(again, Outcome::Done(false));
    assert_eq!(
        session.last_result().await.unwrap().code,
        ResultCode::ENTRY_ALREADY_EXISTS
    );
    assert_eq!(
        session.last_error().await.unwrap().kind,
        ErrorKind::OperationResult
    );

    assert_eq!(
        session.compare(DAVE, "sn", "dent", &[]).await.unwrap(),
        Outcome::Done(true)
    );
    assert_eq!(
        session.compare(DAVE, "sn", "Prefect", &[]).await.unwrap(),
        Outcome::Done(false)
    );
    assert_eq!(
        session.last_result().await.unwrap().code,
        ResultCode::COMPARE_FALSE
    );

    assert_eq!(session.delete(DAVE, &[]).await.unwrap(), Outcome::Done(true));
    assert!(directory.entry(DAVE).is_none());
}

#[tokio::test]
async fn test_add_requires_an_object_class() {
    let directory = populated_directory();
    let session = bound_session(StrategyKind::MockSync, &directory).await;

    let outcome = session
        .add(DAVE, &[], [("cn", vec!["dave"])], &[])
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Done(false));
    assert_eq!(
        session.last_error().await.unwrap().kind,
        ErrorKind::ObjectClassMissing
    );
    assert_eq!(directory.count(Operation::Add), 0);

    // an objectClass attribute is merged with the explicit classes
    let outcome = session
        .add(
            DAVE,
            &["top"],
            [("objectClass", vec!["person"]), ("cn", vec!["dave"])],
            &[],
        )
        .await
        .unwrap();
    assert!(outcome.is_success());
    let classes: Vec<Bytes> = directory.entry(DAVE).unwrap().attributes["objectClass"].clone();
    assert_eq!(classes, vec![Bytes::from("top"), Bytes::from("person")]);
}

#[tokio::test]
async fn test_delete_non_leaf_raises_in_raising_mode() {
    let directory = populated_directory();
    let mut config = admin_config(StrategyKind::MockSync);
    config.raise_exceptions = true;
    let session = Session::builder(config)
        .mock_directory(Arc::clone(&directory))
        .build()
        .unwrap();
    session.bind(&[]).await.unwrap();

    let err = session
        .delete("ou=people,dc=example,dc=com", &[])
        .await
        .unwrap_err();
    assert_eq!(err.result().unwrap().code, ResultCode::NOT_ALLOWED_ON_NON_LEAF);
    assert_eq!(
        session.last_error().await.unwrap().message,
        "notAllowedOnNonLeaf"
    );
}

#[tokio::test]
async fn test_modify_with_typed_and_dynamic_change_sets() {
    let directory = populated_directory();
    let session = bound_session(StrategyKind::MockSync, &directory).await;
    let alice = "cn=alice,ou=people,dc=example,dc=com";

    let changes = ChangeSet::new()
        .replace("sn", ["Liddell"])
        .add("mail", ["alice@example.com"])
        .increment("uidNumber", 10);
    assert!(session.modify(alice, changes, &[]).await.unwrap().is_success());
    let entry = directory.entry(alice).unwrap();
    assert_eq!(entry.first_str("sn"), Some("Liddell"));
    assert_eq!(entry.first_str("uidNumber"), Some("1011"));

    let dynamic = json!({
        "mail": ["MODIFY_DELETE", []],
        "description": [[0, ["wonderland"]]],
    });
    assert!(session.modify(alice, dynamic, &[]).await.unwrap().is_success());
    let entry = directory.entry(alice).unwrap();
    assert!(entry.first_str("mail").is_none());
    assert_eq!(entry.first_str("description"), Some("wonderland"));

    let raw = vec![Modification::new(
        "description",
        ChangeType::Replace,
        vec![Bytes::from("looking glass")],
    )];
    assert!(session.modify(alice, raw, &[]).await.unwrap().is_success());
}

#[tokio::test]
async fn test_malformed_change_sets_send_nothing() {
    let directory = populated_directory();
    let session = bound_session(StrategyKind::MockSync, &directory).await;
    let bob = "cn=bob,ou=people,dc=example,dc=com";

    let outcome = session
        .modify(bob, json!({ "sn": ["MODIFY_RENAME", ["x"]] }), &[])
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Done(false));
    assert_eq!(
        session.last_error().await.unwrap().kind,
        ErrorKind::UnknownChangeType
    );

    let outcome = session.modify(bob, json!(["sn"]), &[]).await.unwrap();
    assert_eq!(outcome, Outcome::Done(false));
    assert_eq!(
        session.last_error().await.unwrap().kind,
        ErrorKind::MalformedChangeSet
    );
    assert_eq!(directory.count(Operation::Modify), 0);
}

#[tokio::test]
async fn test_modify_is_all_or_nothing() {
    let directory = populated_directory();
    let session = bound_session(StrategyKind::MockSync, &directory).await;
    let carol = "cn=carol,ou=people,dc=example,dc=com";

    let changes = ChangeSet::new()
        .replace("sn", ["Changed"])
        .delete("telephoneNumber", Vec::<&str>::new());
    assert_eq!(
        session.modify(carol, changes, &[]).await.unwrap(),
        Outcome::Done(false)
    );
    assert_eq!(
        session.last_result().await.unwrap().code,
        ResultCode::NO_SUCH_ATTRIBUTE
    );
    assert_eq!(directory.entry(carol).unwrap().first_str("sn"), Some("carol"));
}

#[tokio::test]
async fn test_modify_dn_rename_and_move() {
    let directory = populated_directory();
    let session = bound_session(StrategyKind::MockSync, &directory).await;
    let bob = "cn=bob,ou=people,dc=example,dc=com";

    // a move must keep the RDN
    let outcome = session
        .modify_dn(bob, "cn=robert", true, Some("ou=groups,dc=example,dc=com"), &[])
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Done(false));
    assert_eq!(
        session.last_error().await.unwrap().kind,
        ErrorKind::InvalidDnTransition
    );
    assert_eq!(directory.count(Operation::ModifyDn), 0);

    let moved = session
        .modify_dn(bob, "cn=bob", true, Some("ou=groups,dc=example,dc=com"), &[])
        .await
        .unwrap();
    assert!(moved.is_success());
    assert!(directory.entry("cn=bob,ou=groups,dc=example,dc=com").is_some());

    let renamed = session
        .modify_dn("cn=bob,ou=groups,dc=example,dc=com", "cn=robert", true, None, &[])
        .await
        .unwrap();
    assert!(renamed.is_success());
    let robert = directory.entry("cn=robert,ou=groups,dc=example,dc=com").unwrap();
    assert_eq!(robert.first_str("cn"), Some("robert"));
}

#[tokio::test]
async fn test_read_only_session_refuses_writes_before_sending() {
    let directory = populated_directory();
    let mut config = admin_config(StrategyKind::MockSync);
    config.read_only = true;
    let session = Session::builder(config)
        .mock_directory(Arc::clone(&directory))
        .build()
        .unwrap();
    session.bind(&[]).await.unwrap();
    directory.clear_events();

    let outcomes = [
        session.add(DAVE, &["person"], [("cn", vec!["dave"])], &[]).await,
        session.delete(DAVE, &[]).await,
        session
            .modify(DAVE, ChangeSet::new().replace("sn", ["x"]), &[])
            .await,
        session.modify_dn(DAVE, "cn=david", true, None, &[]).await,
        session.send(builder::delete(DAVE), &[]).await,
    ];
    for outcome in outcomes {
        assert_eq!(outcome.unwrap(), Outcome::Done(false));
        assert_eq!(
            session.last_error().await.unwrap().kind,
            ErrorKind::ReadOnlyViolation
        );
    }
    assert!(directory.events().is_empty());

    // reads still work
    let search = SearchParams::new(BASE, "(objectClass=person)");
    assert!(session.search(&search, &[]).await.unwrap().is_success());
    assert!(session.status().await.ends_with("read-only"));
}

#[tokio::test]
async fn test_read_only_check_precedes_deferred_work() {
    let directory = populated_directory();
    let mut config = admin_config(StrategyKind::MockSync);
    config.read_only = true;
    config.lazy = true;
    config.raise_exceptions = true;
    let session = Session::builder(config)
        .mock_directory(Arc::clone(&directory))
        .build()
        .unwrap();
    session.open().await.unwrap();
    session.bind(&[]).await.unwrap();

    let err = session.delete(DAVE, &[]).await.unwrap_err();
    assert!(matches!(err, SessionError::ReadOnlyViolation(ref name) if name == "delRequest"));
    assert!(directory.events().is_empty());
    assert_eq!(session.deferred_resolutions().await, 0);
}

#[tokio::test]
async fn test_search_outcomes() {
    let directory = populated_directory();
    let session = bound_session(StrategyKind::MockSync, &directory).await;

    let people = SearchParams::new(BASE, "(objectClass=posixAccount)").attributes(["cn"]);
    assert_eq!(session.search(&people, &[]).await.unwrap(), Outcome::Done(true));
    assert_eq!(session.last_response().await.len(), 3);

    let nobody = SearchParams::new(BASE, "(cn=nobody)");
    assert_eq!(session.search(&nobody, &[]).await.unwrap(), Outcome::Done(false));
    assert!(session.last_result().await.unwrap().is_success());

    let missing = SearchParams::new("ou=nowhere,dc=example,dc=com", "(objectClass=*)");
    assert_eq!(session.search(&missing, &[]).await.unwrap(), Outcome::Done(false));
    assert_eq!(
        session.last_error().await.unwrap().kind,
        ErrorKind::OperationResult
    );

    let one_level = SearchParams::new(BASE, "(objectClass=*)").scope(Scope::OneLevel);
    session.search(&one_level, &[]).await.unwrap();
    assert_eq!(session.last_response().await.len(), 3);
}

#[tokio::test]
async fn test_paged_search_collects_every_page() {
    let directory = populated_directory();
    let session = bound_session(StrategyKind::MockSync, &directory).await;
    directory.clear_events();

    let params = SearchParams::new(BASE, "(objectClass=person)").attributes(["cn"]);
    let entries = session.paged_search_all(&params, 2, &[]).await.unwrap();
    assert_eq!(entries.len(), 4);
    assert_eq!(directory.count(Operation::Search), 2);
    assert!(session.last_result().await.unwrap().cookie.unwrap().is_empty());
}

#[tokio::test]
async fn test_paged_search_on_asynchronous_strategy() {
    let directory = populated_directory();
    let session = bound_session(StrategyKind::MockAsync, &directory).await;

    let params = SearchParams::new(BASE, "(objectClass=person)");
    let entries = session.paged_search_all(&params, 3, &[]).await.unwrap();
    let mut names: Vec<String> = entries.into_iter().map(|e| e.dn).collect();
    names.sort();
    assert_eq!(
        names,
        vec![
            "cn=admin,dc=example,dc=com",
            "cn=alice,ou=people,dc=example,dc=com",
            "cn=bob,ou=people,dc=example,dc=com",
            "cn=carol,ou=people,dc=example,dc=com",
        ]
    );
}

#[tokio::test]
async fn test_abandon_pending_search() {
    let directory = populated_directory();
    let session = bound_session(StrategyKind::MockAsync, &directory).await;

    let search = SearchParams::new(BASE, "(objectClass=*)");
    let outcome = session.search(&search, &[]).await.unwrap();
    let id = outcome.message_id().expect("pending search");

    assert!(session.abandon(id, &[]).await.unwrap());
    assert_eq!(directory.count(Operation::Abandon), 1);
    assert!(session.get_response(id).await.is_err());
    assert_eq!(
        session.last_error().await.unwrap().kind,
        ErrorKind::Unsupported
    );

    // unknown ids and binds are never abandoned
    assert!(!session.abandon(9999, &[]).await.unwrap());
    let bind = session
        .send(builder::bind_anonymous(3), &[])
        .await
        .unwrap();
    let bind_id = bind.message_id().unwrap();
    assert!(!session.abandon(bind_id, &[]).await.unwrap());
    assert!(session.get_response(bind_id).await.unwrap().is_success());
    assert_eq!(directory.count(Operation::Abandon), 1);
}

#[tokio::test]
async fn test_entries_grouped_by_signature() {
    let directory = populated_directory();
    let session = bound_session(StrategyKind::MockSync, &directory).await;

    // the administrator has no uidNumber, the people do
    let params = SearchParams::new(BASE, "(objectClass=person)").attributes(["cn", "uidNumber"]);
    session.search(&params, &[]).await.unwrap();

    let entries = session.entries().await.unwrap();
    assert_eq!(entries.len(), 4);
    let wide = signature(["cn", "uidNumber"]);
    assert!(entries.iter().all(|e| e.signature == wide));
    let admin = entries.iter().find(|e| e.dn.starts_with("cn=admin")).unwrap();
    assert!(admin.values("uidNumber").is_empty());

    let typed = session
        .materialize_with(&[signature(["cn"]), signature(["cn", "uidnumber"])])
        .await
        .unwrap();
    assert!(typed.iter().all(|e| e.signature.len() == 2));

    let err = session
        .materialize_with(&[signature(["sn"])])
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::AttributeSetUnmatched(_)));
    assert_eq!(
        session.last_error().await.unwrap().kind,
        ErrorKind::AttributeSetUnmatched
    );
}

#[tokio::test]
async fn test_injected_failure_reaches_last_error() {
    let directory = populated_directory();
    let session = bound_session(StrategyKind::MockSync, &directory).await;
    directory.fail_next(ResultCode::BUSY);

    let outcome = session
        .search(&SearchParams::new(BASE, "(objectClass=*)"), &[])
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Done(false));
    let error = session.last_error().await.unwrap();
    assert_eq!(error.kind, ErrorKind::OperationResult);
    assert_eq!(error.message, "busy");
}

#[tokio::test]
async fn test_ldif_strategy_renders_change_records() {
    let mut config = admin_config(StrategyKind::Ldif);
    config.auto_bind = dirclient::AutoBind::NoTls;
    let session = Session::builder(config).connect().await.unwrap();
    assert!(session.is_closed().await);

    session.open().await.unwrap();
    session
        .add(DAVE, &["person"], [("cn", vec!["dave"])], &[])
        .await
        .unwrap();
    session
        .modify(DAVE, ChangeSet::new().replace("sn", ["Dent"]), &[])
        .await
        .unwrap();
    session.delete(DAVE, &[]).await.unwrap();

    let stream = session.change_stream().await.unwrap();
    assert!(stream.contains("changetype: add"));
    assert!(stream.contains("changetype: modify"));
    assert!(stream.contains("changetype: delete"));
    assert!(session.server_info().await.is_none());

    let outcome = session
        .search(&SearchParams::new(BASE, "(objectClass=*)"), &[])
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Done(false));
    assert_eq!(
        session.last_error().await.unwrap().kind,
        ErrorKind::Unsupported
    );
}
