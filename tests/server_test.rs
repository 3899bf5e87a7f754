//! End-to-end language server tests over an in-memory duplex stream.

mod common;

use common::{file_uri, init_logging, write_notes, TestClient};
use notedown_core::config::{NotedownConfig, StaticConfigProvider, TaskState, TaskVocabulary};
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;
use test_log::test;

fn notes(files: &[(&str, &str)]) -> TempDir {
    init_logging();
    let dir = TempDir::new().unwrap();
    write_notes(dir.path(), files);
    dir
}

fn messages(diagnostics: &[Value]) -> Vec<&str> {
    diagnostics
        .iter()
        .filter_map(|d| d.get("message").and_then(Value::as_str))
        .collect()
}

#[test(tokio::test)]
async fn test_open_modify_close_tracks_references() {
    let dir = notes(&[("a.md", "# Title\n"), ("b.md", "# B\n")]);
    let uri = file_uri(&dir.path().join("a.md"));
    let mut client = TestClient::initialized(dir.path()).await;
    let workspace = client.server.workspace().unwrap();

    assert!(client.open(&uri, "# Title\n").await.is_empty());

    client
        .notify(
            "textDocument/didChange",
            json!({
                "textDocument": {"uri": uri, "version": 2},
                "contentChanges": [{"text": "# Title\n\n[[b]]\n"}]
            }),
        )
        .await;
    assert!(client.diagnostics_for(&uri).await.is_empty());
    let info = workspace.wikilinks().get_target("b").unwrap();
    assert_eq!(info.referenced_by.into_iter().collect::<Vec<_>>(), vec![uri.clone()]);
    assert_eq!(info.matching_files.into_iter().collect::<Vec<_>>(), vec!["b.md"]);

    client
        .notify("textDocument/didClose", json!({"textDocument": {"uri": uri}}))
        .await;
    assert!(client.diagnostics_for(&uri).await.is_empty());
    let still_referenced = workspace
        .wikilinks()
        .get_target("b")
        .map(|info| !info.referenced_by.is_empty())
        .unwrap_or(false);
    assert!(!still_referenced);
    assert!(client.server.store().get(&uri).is_none());
}

#[test(tokio::test)]
async fn test_stale_change_is_ignored() {
    let dir = notes(&[("a.md", "")]);
    let uri = file_uri(&dir.path().join("a.md"));
    let mut client = TestClient::initialized(dir.path()).await;
    client.open(&uri, "first").await;

    client
        .notify(
            "textDocument/didChange",
            json!({
                "textDocument": {"uri": uri, "version": 3},
                "contentChanges": [{"text": "third"}]
            }),
        )
        .await;
    client.diagnostics_for(&uri).await;
    for (version, text) in [(2, "second"), (4, "fourth")] {
        client
            .notify(
                "textDocument/didChange",
                json!({
                    "textDocument": {"uri": uri, "version": version},
                    "contentChanges": [{"text": text}]
                }),
            )
            .await;
    }
    // Notifications are handled in order and the stale one publishes nothing.
    let published = client
        .read_until(|msg| msg["method"] == "textDocument/publishDiagnostics")
        .await;
    assert_eq!(published["params"]["version"], 4);
    let doc = client.server.store().get(&uri).unwrap();
    assert_eq!(doc.content, "fourth");
    assert_eq!(doc.version, 4);
}

#[test(tokio::test)]
async fn test_ambiguous_wikilink_diagnostic() {
    let dir = notes(&[("docs/a.md", "# A\n"), ("notes/a.md", "# Other A\n")]);
    let uri = file_uri(&dir.path().join("index.md"));
    let mut client = TestClient::initialized(dir.path()).await;

    let diagnostics = client.open(&uri, "See [[a]].\n").await;
    assert_eq!(diagnostics.len(), 1);
    let diagnostic = &diagnostics[0];
    assert_eq!(
        diagnostic["message"],
        "Ambiguous wikilink 'a' matches multiple files: docs/a.md, notes/a.md"
    );
    assert_eq!(diagnostic["severity"], 2);
    assert_eq!(diagnostic["source"], "notedown");
    assert_eq!(diagnostic["range"]["start"], json!({"line": 0, "character": 4}));
    let related = diagnostic["relatedInformation"].as_array().unwrap();
    assert_eq!(related.len(), 2);
    assert_eq!(
        related[0]["location"]["uri"],
        json!(file_uri(&dir.path().join("docs/a.md")))
    );
    assert_eq!(
        related[1]["location"]["uri"],
        json!(file_uri(&dir.path().join("notes/a.md")))
    );
}

#[test(tokio::test)]
async fn test_watched_file_creates_ambiguity() {
    let dir = notes(&[("docs/a.md", "# A\n")]);
    let uri = file_uri(&dir.path().join("index.md"));
    let mut client = TestClient::initialized(dir.path()).await;
    assert!(client.open(&uri, "[[a]]\n").await.is_empty());

    write_notes(dir.path(), &[("notes/a.md", "# Another\n")]);
    client
        .notify(
            "workspace/didChangeWatchedFiles",
            json!({"changes": [{"uri": file_uri(&dir.path().join("notes/a.md")), "type": 1}]}),
        )
        .await;
    let diagnostics = client.diagnostics_for(&uri).await;
    assert_eq!(
        messages(&diagnostics),
        vec!["Ambiguous wikilink 'a' matches multiple files: docs/a.md, notes/a.md"]
    );

    std::fs::remove_file(dir.path().join("notes/a.md")).unwrap();
    client
        .notify(
            "workspace/didChangeWatchedFiles",
            json!({"changes": [{"uri": file_uri(&dir.path().join("notes/a.md")), "type": 3}]}),
        )
        .await;
    assert!(client.diagnostics_for(&uri).await.is_empty());
}

#[test(tokio::test)]
async fn test_task_state_diagnostics_use_configured_vocabulary() {
    let settings = "tasks:\n  states:\n    - value: \" \"\n      name: todo\n    - value: x\n      name: done\n    - value: wip\n      name: in progress\n";
    let dir = notes(&[(".notedown/settings.yaml", settings)]);
    let uri = file_uri(&dir.path().join("tasks.md"));
    let mut client = TestClient::initialized(dir.path()).await;

    let text = "- [x] ok\n- [done] bad\n- [wip] going\n\n[x] not-a-task\n";
    let diagnostics = client.open(&uri, text).await;
    assert_eq!(diagnostics.len(), 1);
    assert_eq!(
        diagnostics[0]["message"],
        "Invalid task state 'done'. Valid states: ' ', 'x', 'wip'"
    );
    assert_eq!(diagnostics[0]["range"]["start"], json!({"line": 1, "character": 2}));
    assert_eq!(diagnostics[0]["range"]["end"], json!({"line": 1, "character": 8}));
}

#[test(tokio::test)]
async fn test_config_provider_overrides_settings_file() {
    // The settings file only knows ' ' and 'x'; the provider adds 'wip'.
    let settings = "tasks:\n  states:\n    - value: \" \"\n      name: todo\n    - value: x\n      name: done\n";
    let dir = notes(&[(".notedown/settings.yaml", settings)]);
    let uri = file_uri(&dir.path().join("tasks.md"));
    let vocabulary = TaskVocabulary::new(vec![
        TaskState::new(" ", "todo"),
        TaskState::new("x", "done"),
        TaskState::new("wip", "in progress"),
    ])
    .unwrap();
    let provider = StaticConfigProvider(NotedownConfig::default().with_tasks(vocabulary));
    let mut client = TestClient::initialized_with(dir.path(), Some(Arc::new(provider))).await;

    let diagnostics = client.open(&uri, "- [wip] going\n- [done] unknown\n").await;
    assert_eq!(
        messages(&diagnostics),
        vec!["Invalid task state 'done'. Valid states: ' ', 'x', 'wip'"]
    );
}

#[test(tokio::test)]
async fn test_protocol_errors() {
    init_logging();
    let mut client = TestClient::start();

    let early = client
        .request(
            "textDocument/definition",
            json!({
                "textDocument": {"uri": "file:///tmp/a.md"},
                "position": {"line": 0, "character": 0}
            }),
        )
        .await;
    assert_eq!(early["error"]["code"], -32600);

    let unknown = client.request("notedown/unknown", json!({})).await;
    assert_eq!(unknown["error"]["code"], -32601);
}

#[test(tokio::test)]
async fn test_language_features() {
    let dir = notes(&[("projects/plan.md", "# Plan\n"), ("inbox.md", "")]);
    let uri = file_uri(&dir.path().join("inbox.md"));
    let mut client = TestClient::initialized(dir.path()).await;
    client.open(&uri, "Go to [[plan]]\n[[missing]]\n[[pl").await;

    let definition = client
        .request(
            "textDocument/definition",
            json!({"textDocument": {"uri": uri}, "position": {"line": 0, "character": 9}}),
        )
        .await;
    let locations = definition["result"].as_array().unwrap();
    assert_eq!(locations.len(), 1);
    assert_eq!(
        locations[0]["uri"],
        json!(file_uri(&dir.path().join("projects/plan.md")))
    );

    let completion = client
        .request(
            "textDocument/completion",
            json!({"textDocument": {"uri": uri}, "position": {"line": 2, "character": 4}}),
        )
        .await;
    let labels: Vec<&str> = completion["result"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|item| item["label"].as_str())
        .collect();
    assert_eq!(labels, vec!["plan"]);

    let actions = client
        .request(
            "textDocument/codeAction",
            json!({
                "textDocument": {"uri": uri},
                "range": {
                    "start": {"line": 1, "character": 4},
                    "end": {"line": 1, "character": 4}
                },
                "context": {"diagnostics": []}
            }),
        )
        .await;
    let actions = actions["result"].as_array().unwrap();
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0]["title"], "Create note 'missing'");
}

#[test(tokio::test)]
async fn test_custom_commands() {
    let dir = notes(&[]);
    let uri = file_uri(&dir.path().join("a.md"));
    let mut client = TestClient::initialized(dir.path()).await;
    client
        .open(&uri, "- first [[x|shown]]\n- second\n")
        .await;

    let conceal = client
        .request(
            "workspace/executeCommand",
            json!({"command": "notedown.getConcealRanges", "arguments": [uri]}),
        )
        .await;
    assert_eq!(
        conceal["result"],
        json!([{
            "start": {"line": 0, "character": 10},
            "end": {"line": 0, "character": 11}
        }])
    );

    let boundaries = client
        .request(
            "workspace/executeCommand",
            json!({
                "command": "notedown.getListItemBoundaries",
                "arguments": [uri, {"line": 1, "character": 4}]
            }),
        )
        .await;
    assert_eq!(
        boundaries["result"],
        json!({
            "start": {"line": 1, "character": 0},
            "end": {"line": 1, "character": 8}
        })
    );

    let unknown = client
        .request(
            "workspace/executeCommand",
            json!({"command": "notedown.bogus", "arguments": []}),
        )
        .await;
    assert_eq!(unknown["error"]["code"], -32602);
    assert_eq!(unknown["error"]["message"], "Invalid Command: Unknown command 'notedown.bogus'");
}

#[cfg(unix)]
#[test(tokio::test)]
async fn test_execute_code_blocks() {
    let dir = notes(&[("run.md", "```bash\necho one\n```\n\ntext\n\n```bash\necho two\n```\n")]);
    let uri = file_uri(&dir.path().join("run.md"));
    let mut client = TestClient::initialized(dir.path()).await;

    // Not open: the command reads the file from disk.
    let response = client
        .request(
            "workspace/executeCommand",
            json!({
                "command": "notedown.executeCodeBlocks",
                "arguments": [{"textDocument": {"uri": uri}}]
            }),
        )
        .await;
    let result = &response["result"];
    assert_eq!(result["success"], true, "{response}");
    assert_eq!(result["stdout"], "one\ntwo\n");
    assert_eq!(result["exitCode"], 0);

    let missing = client
        .request(
            "workspace/executeCommand",
            json!({
                "command": "notedown.executeCodeBlocks",
                "arguments": [{"textDocument": {"uri": uri}, "language": "python"}]
            }),
        )
        .await;
    assert_eq!(missing["error"]["code"], -32602);
}

#[test(tokio::test)]
async fn test_list_documents_with_filter() {
    let dir = notes(&[
        ("active.md", "---\nstatus: active\n---\n# Active\n\n- [ ] ship it\n[[done]]\n"),
        ("done.md", "---\nstatus: archived\n---\n# Done\n"),
        ("plain.md", "# Plain\n"),
    ]);
    let mut client = TestClient::initialized(dir.path()).await;

    let all = client.request("notedown/listDocuments", Value::Null).await;
    let paths: Vec<&str> = all["result"]["documents"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|d| d["path"].as_str())
        .collect();
    assert_eq!(paths, vec!["active.md", "done.md", "plain.md"]);

    let filtered = client
        .request(
            "notedown/listDocuments",
            json!({"filter": {"field": "status", "op": "eq", "value": "active"}}),
        )
        .await;
    let documents = filtered["result"]["documents"].as_array().unwrap();
    assert_eq!(documents.len(), 1);
    let active = &documents[0];
    assert_eq!(active["path"], "active.md");
    assert_eq!(active["metadata"]["status"], "active");
    assert_eq!(active["tasks"][0]["state"], " ");
    assert_eq!(active["tasks"][0]["name"], "todo");
    assert_eq!(active["wikilinks"][0]["target"], "done");
    assert_eq!(active["checksum"].as_str().unwrap().len(), 64);
    assert_eq!(filtered["result"]["errors"], json!([]));
}

#[test(tokio::test)]
async fn test_workspace_folder_changes() {
    let first = notes(&[("a.md", "# A\n")]);
    let second = notes(&[("b.md", "# B\n")]);
    let mut client = TestClient::initialized(first.path()).await;
    let workspace = client.server.workspace().unwrap();
    assert_eq!(workspace.files().len(), 1);

    client
        .notify(
            "workspace/didChangeWorkspaceFolders",
            json!({"event": {
                "added": [{"uri": file_uri(second.path()), "name": "second"}],
                "removed": [{"uri": file_uri(first.path()), "name": "notes"}]
            }}),
        )
        .await;
    // The folder change is handled concurrently with requests, so poll until the rescan lands.
    let mut paths = Vec::new();
    for _ in 0..50 {
        let listed = client.request("notedown/listDocuments", json!({})).await;
        paths = listed["result"]["documents"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|d| d["path"].as_str().map(str::to_string))
            .collect::<Vec<String>>();
        if paths == ["b.md"] {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    assert_eq!(paths, vec!["b.md"]);
}

#[test(tokio::test)]
async fn test_shutdown_then_exit() {
    let dir = notes(&[("a.md", "# A\n")]);
    let mut client = TestClient::initialized(dir.path()).await;

    let response = client.request("shutdown", Value::Null).await;
    assert_eq!(response["result"], Value::Null);
    assert!(response.get("error").is_none());
    assert!(client.server.is_shutting_down());

    let refused = client.request("notedown/listDocuments", json!({})).await;
    assert_eq!(refused["error"]["code"], -32600);

    client.notify("exit", Value::Null).await;
    client.finished().await;
}
