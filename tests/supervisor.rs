use scuttle_rs::supervisor::{ProcessSupervisor, SupervisorError};

fn sh(script: &str) -> ProcessSupervisor {
    ProcessSupervisor::new("sh", vec!["-c".to_string(), script.to_string()])
}

#[tokio::test]
async fn test_exit_code_is_propagated() {
    assert_eq!(sh("exit 0").run().await.unwrap(), 0);
    assert_eq!(sh("exit 3").run().await.unwrap(), 3);
}

#[tokio::test]
async fn test_killed_child_maps_to_128_plus_signal() {
    assert_eq!(sh("kill -TERM $$").run().await.unwrap(), 143);
    assert_eq!(sh("kill -KILL $$").run().await.unwrap(), 137);
}

#[tokio::test]
async fn test_arguments_reach_the_child() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("args");
    let supervisor = ProcessSupervisor::from_command(vec![
        "sh".to_string(),
        "-c".to_string(),
        format!("echo \"$0 $1\" > '{}'", out.display()),
        "first".to_string(),
        "--second".to_string(),
    ])
    .unwrap();
    assert_eq!(supervisor.program(), "sh");
    assert_eq!(supervisor.run().await.unwrap(), 0);
    assert_eq!(
        std::fs::read_to_string(&out).unwrap().trim(),
        "first --second"
    );
}

#[tokio::test]
async fn test_empty_command_has_no_supervisor() {
    assert!(ProcessSupervisor::from_command(vec![]).is_none());
}

#[tokio::test]
async fn test_unknown_program_is_not_found() {
    let err = ProcessSupervisor::new("definitely-not-installed-scuttle", vec![])
        .run()
        .await
        .unwrap_err();
    assert!(matches!(err, SupervisorError::NotFound { .. }));
    assert_eq!(err.exit_code(), 127);
}
