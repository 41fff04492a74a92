mod common;

use common::{MockOptions, MockServer};
use hyperftp_engine::*;
use std::path::Path;

/// `project/readme.txt` and `project/sub/data.bin`.
fn local_tree(root: &Path) -> std::path::PathBuf {
    let project = root.join("project");
    std::fs::create_dir_all(project.join("sub")).unwrap();
    std::fs::write(project.join("readme.txt"), b"read me").unwrap();
    std::fs::write(project.join("sub").join("data.bin"), vec![7u8; 3000]).unwrap();
    project
}

async fn connected_in_home(server: &MockServer) -> SessionManager {
    server.add_dir("/home");
    let manager = SessionManager::new(TransferQueueConfig::default(), EventSink::disabled());
    manager.connect(server.anonymous()).await.unwrap();
    assert_eq!(manager.change_directory("/home").await.unwrap(), "/home");
    manager
}

#[tokio::test]
async fn uploads_tree_and_restores_directory() {
    let server = MockServer::start().await;
    let manager = connected_in_home(&server).await;
    let dir = tempfile::tempdir().unwrap();
    let project = local_tree(dir.path());

    let handles = manager.upload_folder(&project).await.unwrap();
    assert_eq!(handles.len(), 2);
    let remote: Vec<String> = handles.iter().map(|h| h.snapshot().remote_path).collect();
    assert_eq!(remote, ["/home/project/readme.txt", "/home/project/sub/data.bin"]);

    for handle in &handles {
        assert_eq!(handle.wait().await.state, TransferState::Succeeded);
    }
    assert!(server.is_dir("/home/project"));
    assert!(server.is_dir("/home/project/sub"));
    assert_eq!(server.file("/home/project/readme.txt").as_deref(), Some(&b"read me"[..]));
    assert_eq!(server.file("/home/project/sub/data.bin").map(|d| d.len()), Some(3000));

    assert_eq!(server.commands_named("MKD"), ["MKD project", "MKD sub"]);
    let cwds = server.commands_named("CWD");
    assert!(cwds.contains(&"CWD project".to_string()));
    assert!(cwds.contains(&"CWD sub".to_string()));
    assert_eq!(cwds.last().map(String::as_str), Some("CWD /home"));
    assert_eq!(manager.current_directory().await.unwrap(), "/home");
}

#[tokio::test]
async fn failed_file_does_not_stop_restore() {
    let server = MockServer::with_options(MockOptions {
        reject_stor: vec!["data.bin".into()],
        ..Default::default()
    })
    .await;
    let manager = connected_in_home(&server).await;
    let dir = tempfile::tempdir().unwrap();
    let project = local_tree(dir.path());

    let handles = manager.upload_folder(&project).await.unwrap();
    assert_eq!(manager.current_directory().await.unwrap(), "/home");

    let mut states = Vec::new();
    for handle in &handles {
        let task = handle.wait().await;
        if task.state == TransferState::Failed {
            let err = task.error.unwrap();
            assert_eq!(err.cause, Some(FailureCause::Remote));
            assert_eq!(err.path.as_deref(), Some("/home/project/sub/data.bin"));
        }
        states.push(task.state);
    }
    assert_eq!(states, [TransferState::Succeeded, TransferState::Failed]);
    assert_eq!(manager.current_directory().await.unwrap(), "/home");
}

#[tokio::test]
async fn existing_remote_folder_is_reused() {
    let server = MockServer::start().await;
    let manager = connected_in_home(&server).await;
    server.add_dir("/home/project");
    let dir = tempfile::tempdir().unwrap();
    let project = local_tree(dir.path());

    let handles = manager.upload_folder(&project).await.unwrap();
    assert_eq!(handles.len(), 2);
    for handle in &handles {
        assert_eq!(handle.wait().await.state, TransferState::Succeeded);
    }
    assert_eq!(server.file("/home/project/readme.txt").as_deref(), Some(&b"read me"[..]));
    assert_eq!(manager.current_directory().await.unwrap(), "/home");
}

#[tokio::test]
async fn missing_local_folder_still_restores() {
    let server = MockServer::start().await;
    let manager = connected_in_home(&server).await;
    let dir = tempfile::tempdir().unwrap();

    let err = manager
        .upload_folder(&dir.path().join("absent"))
        .await
        .unwrap_err();
    assert_eq!(err.error.cause, Some(FailureCause::Local));
    assert!(err.dispatched.is_empty());
    assert!(manager.is_connected().await);
    assert_eq!(manager.current_directory().await.unwrap(), "/home");
    assert!(manager.transfers().await.unwrap().is_empty());
}

#[tokio::test]
async fn stopped_walk_still_hands_back_started_transfers() {
    let server = MockServer::start().await;
    let manager = connected_in_home(&server).await;
    server.add_dir("/home/project");
    // A file where the subfolder should go: MKD and CWD both fail.
    server.add_file("/home/project/sub", b"in the way");
    let dir = tempfile::tempdir().unwrap();
    let project = local_tree(dir.path());

    let err = manager.upload_folder(&project).await.unwrap_err();
    assert_eq!(err.error.kind, FtpErrorKind::RemoteOp);
    assert_eq!(err.error.code, Some(550));
    assert_eq!(err.error.command.as_deref(), Some("CWD sub"));

    assert_eq!(err.dispatched.len(), 1);
    let task = err.dispatched[0].wait().await;
    assert_eq!(task.remote_path, "/home/project/readme.txt");
    assert_eq!(task.state, TransferState::Succeeded);
    assert_eq!(server.file("/home/project/readme.txt").as_deref(), Some(&b"read me"[..]));

    assert!(manager.is_connected().await);
    assert_eq!(manager.current_directory().await.unwrap(), "/home");
}
