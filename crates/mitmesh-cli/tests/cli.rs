//! Command-line parsing and the cluster-free render path

use clap::Parser;
use mitmesh_cli::commands::render::MeshArg;
use mitmesh_cli::{Cli, Commands, Error};

fn empty_config() -> tempfile::NamedTempFile {
    tempfile::NamedTempFile::new().unwrap()
}

#[tokio::test]
async fn render_runs_without_a_cluster() {
    let config = empty_config();
    let cli = Cli::try_parse_from([
        "mitmesh",
        "--config",
        config.path().to_str().unwrap(),
        "render",
        "--mesh",
        "istio",
        "-n",
        "intercept",
    ])
    .unwrap();

    match &cli.command {
        Some(Commands::Render(args)) => assert_eq!(args.mesh, MeshArg::Istio),
        other => panic!("unexpected command: {:?}", other),
    }
    cli.run().await.unwrap();
}

#[test]
fn unknown_mesh_is_not_a_render_choice() {
    assert!(Cli::try_parse_from(["mitmesh", "render", "--mesh", "unknown"]).is_err());
}

#[tokio::test]
async fn invalid_namespace_fails_before_any_call() {
    let config = empty_config();
    let cli = Cli::try_parse_from([
        "mitmesh",
        "--config",
        config.path().to_str().unwrap(),
        "--namespace",
        "UPPER",
        "up",
    ])
    .unwrap();

    let err = cli.run().await.unwrap_err();
    assert!(matches!(err, Error::Provision(_)));
    assert_eq!(err.step(), None);
}

#[tokio::test]
async fn missing_config_file_is_reported() {
    let cli = Cli::try_parse_from([
        "mitmesh",
        "--config",
        "/nonexistent/mitmesh.yaml",
        "render",
    ])
    .unwrap();

    let err = cli.run().await.unwrap_err();
    assert!(matches!(err, Error::ConfigFile { .. }));
    assert!(err.to_string().contains("/nonexistent/mitmesh.yaml"));
}
