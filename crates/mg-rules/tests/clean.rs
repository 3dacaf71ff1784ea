//! Clean: ledger replay, reverse-order fan-out, byproduct removal.

mod harness;

use std::sync::Arc;

use harness::Setup;
use mg_engine::{
    BuildError, Engine, FileKind, Operation, Prerequisite, Target, TargetState,
};

fn declare_group(setup: &Setup, engine: &Arc<Engine>) -> Arc<Target> {
    let env = &setup.env;
    env.write_file("a.h", "class A { Q_OBJECT };\n");
    env.write_file("b.h", "class B {};\n");
    env.write_file("c.cxx", "class C { Q_OBJECT };\n");

    let (group, _) = engine
        .graph
        .search_or_create(FileKind::AutomocGroup, &env.dir, "meta");
    for (kind, name) in [
        (FileKind::Header, "a.h"),
        (FileKind::Header, "b.h"),
        (FileKind::Source, "c.cxx"),
    ] {
        let (t, _) = engine.graph.search_or_create(kind, &env.dir, name);
        group.push_prerequisite(Prerequisite::new(t));
    }
    group
}

#[tokio::test(flavor = "multi_thread")]
async fn clean_replays_the_ledger_without_scanning() {
    let setup = Setup::new();

    let (engine, _) = setup.engine();
    let group = declare_group(&setup, &engine);
    engine.run(Operation::Update, &[group]).await.unwrap();
    assert!(setup.env.exists("moc_a.cxx"));
    assert!(setup.env.exists("c.moc"));

    let (engine, automoc) = setup.engine();
    let group = declare_group(&setup, &engine);
    let state = engine.run(Operation::Clean, &[group]).await.unwrap();

    assert_eq!(state, TargetState::Changed);
    // Member identity came from the ledger, not from reading contents.
    assert_eq!(automoc.scans_performed(), 0);

    // Outputs, their ledgers and byproducts, and the group ledger are
    // gone; inputs stay.
    assert!(!setup.env.exists("moc_a.cxx"));
    assert!(!setup.env.exists("moc_a.cxx.d"));
    assert!(!setup.env.exists("moc_a.cxx.t"));
    assert!(!setup.env.exists("c.moc"));
    assert!(!setup.env.exists("meta.automoc.d"));
    assert!(setup.env.exists("a.h"));
    assert!(setup.env.exists("c.cxx"));
}

#[tokio::test(flavor = "multi_thread")]
async fn clean_twice_is_a_noop() {
    let setup = Setup::new();

    let (engine, _) = setup.engine();
    let group = declare_group(&setup, &engine);
    engine.run(Operation::Update, &[group]).await.unwrap();

    let (engine, _) = setup.engine();
    let group = declare_group(&setup, &engine);
    engine.run(Operation::Clean, &[group]).await.unwrap();

    // No ledger, nothing discovered, nothing to do.
    let (engine, _) = setup.engine();
    let group = declare_group(&setup, &engine);
    let state = engine.run(Operation::Clean, &[group]).await.unwrap();
    assert_eq!(state, TargetState::Unchanged);
}

#[tokio::test(flavor = "multi_thread")]
async fn clean_with_a_foreign_ledger_stamp_is_fatal() {
    let setup = Setup::new();

    let (engine, _) = setup.engine();
    let group = declare_group(&setup, &engine);
    engine.run(Operation::Update, &[group]).await.unwrap();

    // Another rule version wrote this; replaying it could remove the
    // wrong files.
    setup
        .env
        .write_file("meta.automoc.d", "moc.automoc 99\n1 /nowhere.h\n\n");

    let (engine, _) = setup.engine();
    let group = declare_group(&setup, &engine);
    let err = engine.run(Operation::Clean, &[group]).await.unwrap_err();

    assert!(matches!(err, BuildError::Config { .. }));
    assert!(err.to_string().contains("cannot clean"));
}

#[tokio::test(flavor = "multi_thread")]
async fn update_after_clean_rebuilds_from_scratch() {
    let setup = Setup::new();

    let (engine, _) = setup.engine();
    let group = declare_group(&setup, &engine);
    engine.run(Operation::Update, &[group]).await.unwrap();

    let (engine, _) = setup.engine();
    let group = declare_group(&setup, &engine);
    engine.run(Operation::Clean, &[group]).await.unwrap();

    let (engine, automoc) = setup.engine();
    let group = declare_group(&setup, &engine);
    let state = engine.run(Operation::Update, &[group]).await.unwrap();

    assert_eq!(state, TargetState::Changed);
    assert_eq!(automoc.scans_performed(), 3);
    assert!(setup.env.exists("moc_a.cxx"));
    assert!(setup.env.exists("c.moc"));
}

#[tokio::test(flavor = "multi_thread")]
async fn configure_leaves_the_group_undiscovered_and_quiet() {
    let setup = Setup::new();

    let (engine, automoc) = setup.engine();
    let group = declare_group(&setup, &engine);
    let state = engine
        .run(Operation::ConfigureUpdate, &[group])
        .await
        .unwrap();

    assert_eq!(state, TargetState::Unchanged);
    assert_eq!(automoc.scans_performed(), 0);
    assert!(!setup.env.exists("meta.automoc.d"));
    assert!(!setup.env.exists("moc_a.cxx"));
}
