// Own test binary so no other test has installed a global subscriber yet.

#[test]
fn tracing_writes_to_the_log_directory() {
    let dir = tempfile::tempdir().expect("tempdir");
    let log_dir = dir.path().join("logs");
    holodeck::init_tracing(&log_dir).expect("tracing init");
    assert!(log_dir.is_dir());

    tracing::info!(target: "holodeck", "tracing initialised");
    assert!(matches!(
        holodeck::init_tracing(&log_dir),
        Err(holodeck::errors::AppError::Internal(_))
    ));
}
