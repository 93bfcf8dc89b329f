//! Project-level behavior: registry resolution, disposal ordering,
//! diagnostics wiring and the multi-peer aggregation façade.

mod common;

use common::{lua_definition, wait_until, FakePeerConfig, FakePeerFactory};
use lsp_sessions::definition::ServerDefinition;
use lsp_sessions::events::{topics, EventContext, EventListener};
use lsp_sessions::project::{Project, SessionTarget};
use lsp_sessions::session::SessionStatus;
use lsp_sessions::timeouts::{FeatureKind, Timeouts};
use serde_json::json;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn test_timeouts() -> Timeouts {
    Timeouts {
        initialize_ms: 1_000,
        shutdown_ms: 200,
        ..Timeouts::default()
    }
}

#[tokio::test]
async fn sessions_are_lazy_and_never_duplicated() {
    let factory = FakePeerFactory::new(FakePeerConfig::default());
    let project = Project::with_timeouts("/project", test_timeouts());
    project.register_definition(lua_definition(factory.clone()));

    // Nothing started yet: registration alone spawns no peer.
    assert!(project.session("lua-ls").is_none());
    assert_eq!(factory.spawn_count.load(std::sync::atomic::Ordering::SeqCst), 0);

    let first = match project.resolve("lua") {
        Some(SessionTarget::Single(session)) => session,
        _ => panic!("expected single session"),
    };
    let second = match project.resolve("lua") {
        Some(SessionTarget::Single(session)) => session,
        _ => panic!("expected single session"),
    };
    assert!(Arc::ptr_eq(&first, &second));
    assert!(project.resolve("rs").is_none());
}

#[tokio::test]
async fn dispose_closes_documents_before_stopping_sessions() {
    let factory = FakePeerFactory::new(FakePeerConfig::default());
    let project = Project::with_timeouts("/project", test_timeouts());
    project.register_definition(lua_definition(factory.clone()));

    let doc_a = project
        .open_document(Path::new("/project/a.lua"), "")
        .unwrap();
    let doc_b = project
        .open_document(Path::new("/project/b.lua"), "")
        .unwrap();
    doc_a.connect().await.unwrap();
    doc_b.connect().await.unwrap();

    let session = match project.resolve("lua") {
        Some(SessionTarget::Single(session)) => session,
        _ => panic!("expected single session"),
    };
    wait_until(Duration::from_secs(2), || session.connected_count() == 2).await;

    project.dispose().await;

    assert_eq!(project.document_count(), 0);
    assert_eq!(session.status(), SessionStatus::Stopped);
    assert!(doc_a.is_disposed());

    // Close notifications went out while the channel was still live.
    let methods = factory.methods();
    let shutdown_index = methods.iter().position(|m| m == "shutdown").unwrap();
    let close_indexes: Vec<usize> = methods
        .iter()
        .enumerate()
        .filter(|(_, m)| *m == "textDocument/didClose")
        .map(|(i, _)| i)
        .collect();
    assert_eq!(close_indexes.len(), 2);
    assert!(close_indexes.iter().all(|i| *i < shutdown_index));
}

#[tokio::test]
async fn diagnostics_from_the_peer_reach_store_and_bus() {
    struct CountingListener {
        updates: Arc<Mutex<Vec<(String, u64)>>>,
    }

    #[async_trait::async_trait]
    impl EventListener for CountingListener {
        fn handle(&self, _event: &str, ctx: &mut EventContext) -> anyhow::Result<()> {
            let uri = ctx
                .get(lsp_sessions::events::ctx_keys::DOCUMENT)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let count = ctx.get("count").and_then(|v| v.as_u64()).unwrap_or(0);
            self.updates.lock().unwrap().push((uri, count));
            Ok(())
        }
    }

    let factory = FakePeerFactory::new(FakePeerConfig {
        diagnostics_on_open: Some(json!([
            {
                "range": {
                    "start": { "line": 0, "character": 0 },
                    "end": { "line": 0, "character": 5 },
                },
                "severity": 1,
                "message": "undefined variable",
            }
        ])),
        ..Default::default()
    });
    let project = Project::with_timeouts("/project", test_timeouts());
    project.register_definition(lua_definition(factory));

    let updates = Arc::new(Mutex::new(Vec::new()));
    project.bus().subscribe(
        topics::DIAGNOSTICS_UPDATED,
        Arc::new(CountingListener {
            updates: updates.clone(),
        }),
    );

    let doc = project
        .open_document(Path::new("/project/a.lua"), "print(x)")
        .unwrap();
    doc.connect().await.unwrap();

    let diagnostics = project.diagnostics();
    wait_until(Duration::from_secs(2), || {
        !diagnostics.get(doc.uri()).is_empty()
    })
    .await;

    let stored = diagnostics.get(doc.uri());
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].message, "undefined variable");

    let updates = updates.lock().unwrap();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].0, doc.uri().as_str());
    assert_eq!(updates[0].1, 1);

    drop(updates);
    project.dispose().await;
}

#[tokio::test]
async fn aggregated_extension_fans_out_and_merges() {
    let lua_factory = FakePeerFactory::new(FakePeerConfig::default());
    let teal_factory = FakePeerFactory::new(FakePeerConfig {
        capabilities: json!({
            "completionProvider": { "triggerCharacters": [":", "@"] },
            "definitionProvider": true,
        }),
        ..Default::default()
    });

    let project = Project::with_timeouts("/project", test_timeouts());
    project.register_definition(lua_definition(lua_factory.clone()));
    project.register_definition(ServerDefinition::new(
        "teal-ls",
        ["lua"],
        teal_factory.clone(),
    ));

    let aggregated = match project.resolve("lua") {
        Some(SessionTarget::Aggregated(aggregated)) => aggregated,
        _ => panic!("expected aggregation for a doubly-claimed extension"),
    };
    assert_eq!(aggregated.len(), 2);

    let doc = project
        .open_document(Path::new("/project/a.lua"), "")
        .unwrap();
    let merged = aggregated.connect_all(&doc).await.unwrap();

    // Exactly one handshake per underlying peer.
    assert_eq!(lua_factory.count_of("initialize"), 1);
    assert_eq!(teal_factory.count_of("initialize"), 1);

    // Union of trigger characters, first-wins for scalars.
    let triggers = merged
        .completion_provider
        .unwrap()
        .trigger_characters
        .unwrap();
    assert_eq!(triggers, vec![".", ":", "@"]);
    assert!(merged.hover_provider.is_some());
    assert!(merged.definition_provider.is_some());

    // Both sessions track the document; trigger sets were unioned on it.
    for session in aggregated.sessions() {
        assert!(session.is_connected(doc.uri()));
    }
    assert_eq!(doc.completion_triggers(), vec![".", ":", "@"]);

    // Feature fan-out targets only advertisers.
    assert_eq!(aggregated.sessions_with(FeatureKind::Hover).len(), 1);
    assert_eq!(aggregated.sessions_with(FeatureKind::Completion).len(), 2);

    project.dispose().await;
}

#[tokio::test]
async fn feature_requests_require_a_connected_document() {
    let factory = FakePeerFactory::new(FakePeerConfig::default());
    let project = Project::with_timeouts("/project", test_timeouts());
    project.register_definition(lua_definition(factory));
    let session = match project.resolve("lua") {
        Some(SessionTarget::Single(session)) => session,
        _ => panic!("expected single session"),
    };

    let doc = project
        .open_document(Path::new("/project/a.lua"), "")
        .unwrap();

    // Not connected yet: the request is refused, not sent.
    let err = session
        .request_feature(
            doc.uri(),
            FeatureKind::Hover,
            "textDocument/hover",
            json!({}),
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not connected"));

    doc.connect().await.unwrap();
    wait_until(Duration::from_secs(2), || session.connected_count() == 1).await;

    let hover = session
        .request_feature(
            doc.uri(),
            FeatureKind::Hover,
            "textDocument/hover",
            json!({
                "textDocument": { "uri": doc.uri().as_str() },
                "position": { "line": 0, "character": 0 },
            }),
        )
        .await
        .unwrap();
    assert_eq!(hover["contents"], "fake docs");

    project.dispose().await;
}

#[tokio::test]
async fn unregister_stops_the_definition_session() {
    let factory = FakePeerFactory::new(FakePeerConfig::default());
    let project = Project::with_timeouts("/project", test_timeouts());
    project.register_definition(lua_definition(factory.clone()));

    let doc = project
        .open_document(Path::new("/project/a.lua"), "")
        .unwrap();
    doc.connect().await.unwrap();
    let session = project.session("lua-ls").unwrap();
    wait_until(Duration::from_secs(2), || session.connected_count() == 1).await;

    project.unregister_definition("lua-ls").await;
    assert_eq!(session.status(), SessionStatus::Stopped);
    assert!(project.resolve("lua").is_none());
    assert_eq!(factory.count_of("shutdown"), 1);
}
