// End-to-end orchestration over a local tap and a scripted bottle server:
// resolve → download → install → receipts, plus uninstall safety and
// lockfile restore.


use std::time::Duration;
use test_helpers::{TestEnvironment, formula_source, make_bottle};
use velo::download::{DownloadConfig, Downloader};
use velo::error::VeloError;
use velo::lockfile::Lockfile;
use velo::receipt::InstalledAs;
use velo::{Orchestrator, OrchestratorConfig};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const PLATFORM: &str = "arm64_sonoma";

async fn serve_bottle(server: &MockServer, name: &str, version: &str, bytes: Vec<u8>) {
    Mock::given(method("GET"))
        .and(path(format!(
            "/bottles/{name}-{version}.{PLATFORM}.bottle.tar.gz"
        )))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(bytes))
        .mount(server)
        .await;
}

fn orchestrator(env: &TestEnvironment) -> Orchestrator {
    let downloader = Downloader::with_config(DownloadConfig {
        request_timeout: Duration::from_secs(5),
        resource_timeout: Duration::from_secs(30),
        ..DownloadConfig::default()
    })
    .unwrap();
    Orchestrator::new(env.prefix.clone())
        .unwrap()
        .with_platform_tag(PLATFORM)
        .with_downloader(downloader)
        .with_config(OrchestratorConfig {
            max_concurrent_downloads: 4,
            abort_on_conflict: true,
        })
}

/// Build the tap and bottle server for a root package `a` depending on `b`.
async fn chain_fixture(env: &TestEnvironment, server: &MockServer) {
    let root_url = format!("{}/bottles", server.uri());

    let (bottle_a, sha_a) = make_bottle(
        env.scratch(),
        "pkga",
        "1.0.0",
        &[("bin/pkga", "#!/bin/sh\necho pkga\n")],
    );
    let (bottle_b, sha_b) = make_bottle(
        env.scratch(),
        "pkgb",
        "2.0.0",
        &[("bin/pkgb", "#!/bin/sh\necho pkgb\n")],
    );

    env.write_formula(
        "homebrew/core",
        "pkga",
        &formula_source("pkga", "1.0.0", &root_url, &sha_a, &["pkgb"]),
    );
    env.write_formula(
        "homebrew/core",
        "pkgb",
        &formula_source("pkgb", "2.0.0", &root_url, &sha_b, &[]),
    );

    serve_bottle(server, "pkga", "1.0.0", std::fs::read(bottle_a).unwrap()).await;
    serve_bottle(server, "pkgb", "2.0.0", std::fs::read(bottle_b).unwrap()).await;
}

#[tokio::test]
async fn installs_chain_in_dependency_order_with_receipts() {
    let env = TestEnvironment::new();
    let server = MockServer::start().await;
    chain_fixture(&env, &server).await;

    let orchestrator = orchestrator(&env);
    let report = orchestrator
        .install(&["pkga".to_string()], false)
        .await
        .unwrap();

    // Dependency first, root second.
    let order: Vec<&str> = report
        .installed
        .iter()
        .map(|o| o.package.as_str())
        .collect();
    assert_eq!(order, vec!["pkgb", "pkga"]);

    assert!(env.prefix.is_installed("pkga"));
    assert!(env.prefix.is_installed("pkgb"));
    assert!(env.prefix.symlink_path("pkga").symlink_metadata().is_ok());
    assert!(
        env.prefix
            .versioned_symlink_path("pkgb", "2.0.0")
            .symlink_metadata()
            .is_ok()
    );
    assert!(env.prefix.opt_path("pkga").symlink_metadata().is_ok());

    // Receipts: the root is explicit, the dependency records its dependent.
    let receipts = orchestrator.installer().receipts();
    let root = receipts.load("pkga", "1.0.0").unwrap().unwrap();
    assert_eq!(root.installed_as, InstalledAs::Explicit);
    assert!(!root.symlinks_created.is_empty());

    let dep = receipts.load("pkgb", "2.0.0").unwrap().unwrap();
    assert_eq!(dep.installed_as, InstalledAs::Dependency);
    assert_eq!(dep.requested_by, vec!["pkga"]);
}

#[tokio::test]
async fn second_install_is_a_no_op() {
    let env = TestEnvironment::new();
    let server = MockServer::start().await;
    chain_fixture(&env, &server).await;

    let orchestrator = orchestrator(&env);
    orchestrator
        .install(&["pkga".to_string()], false)
        .await
        .unwrap();
    let report = orchestrator
        .install(&["pkga".to_string()], false)
        .await
        .unwrap();

    assert!(report.installed.is_empty());
    let mut already = report.already_installed.clone();
    already.sort();
    assert_eq!(already, vec!["pkga", "pkgb"]);
}

#[tokio::test]
async fn download_failure_aborts_before_any_install() {
    let env = TestEnvironment::new();
    let server = MockServer::start().await;
    let root_url = format!("{}/bottles", server.uri());

    let (bottle_b, sha_b) = make_bottle(env.scratch(), "pkgb", "2.0.0", &[("bin/pkgb", "x")]);
    env.write_formula(
        "homebrew/core",
        "pkga",
        &formula_source("pkga", "1.0.0", &root_url, &"1".repeat(64), &["pkgb"]),
    );
    env.write_formula(
        "homebrew/core",
        "pkgb",
        &formula_source("pkgb", "2.0.0", &root_url, &sha_b, &[]),
    );
    // pkgb downloads fine; pkga's bottle is missing from the server.
    serve_bottle(&server, "pkgb", "2.0.0", std::fs::read(bottle_b).unwrap()).await;

    let orchestrator = orchestrator(&env);
    let err = orchestrator
        .install(&["pkga".to_string()], false)
        .await
        .unwrap_err();

    assert!(matches!(err, VeloError::InstallationFailed { .. }));
    // Nothing was installed, not even the dependency that downloaded.
    assert!(!env.prefix.is_installed("pkga"));
    assert!(!env.prefix.is_installed("pkgb"));
}

#[tokio::test]
async fn uninstall_refuses_while_dependents_remain() {
    let env = TestEnvironment::new();
    let server = MockServer::start().await;
    chain_fixture(&env, &server).await;

    let orchestrator = orchestrator(&env);
    orchestrator
        .install(&["pkga".to_string()], false)
        .await
        .unwrap();

    let err = orchestrator.uninstall("pkgb", false).unwrap_err();
    assert!(matches!(err, VeloError::InstallationFailed { .. }));
    assert!(env.prefix.is_installed("pkgb"));

    // Removing the dependent first clears the way.
    orchestrator.uninstall("pkga", false).unwrap();
    orchestrator.uninstall("pkgb", false).unwrap();
    assert!(!env.prefix.is_installed("pkga"));
    assert!(!env.prefix.is_installed("pkgb"));
    // No symlinks reference the removed versions.
    assert!(env.prefix.symlink_path("pkga").symlink_metadata().is_err());
    assert!(env.prefix.symlink_path("pkgb").symlink_metadata().is_err());
    assert!(env.prefix.opt_path("pkgb").symlink_metadata().is_err());
}

#[tokio::test]
async fn force_uninstall_ignores_dependents() {
    let env = TestEnvironment::new();
    let server = MockServer::start().await;
    chain_fixture(&env, &server).await;

    let orchestrator = orchestrator(&env);
    orchestrator
        .install(&["pkga".to_string()], false)
        .await
        .unwrap();

    orchestrator.uninstall("pkgb", true).unwrap();
    assert!(!env.prefix.is_installed("pkgb"));
    assert!(env.prefix.is_installed("pkga"));
}

#[tokio::test]
async fn lockfile_roundtrip_restores_uninstalled_packages() {
    let env = TestEnvironment::new();
    let server = MockServer::start().await;
    chain_fixture(&env, &server).await;

    let orchestrator = orchestrator(&env);
    let report = orchestrator
        .install(&["pkga".to_string()], false)
        .await
        .unwrap();

    let lock_path = orchestrator.write_lockfile(&report.plan).unwrap();
    let lockfile = Lockfile::read(&lock_path).unwrap();
    assert_eq!(lockfile.lockfile_version, 1);
    assert_eq!(lockfile.dependencies.len(), 2);
    assert_eq!(lockfile.dependencies["pkgb"].version, "2.0.0");
    assert_eq!(lockfile.dependencies["pkga"].deps, vec!["pkgb"]);

    orchestrator.uninstall("pkga", false).unwrap();
    orchestrator.uninstall("pkgb", false).unwrap();

    let restored = orchestrator.install_from_lockfile(&lockfile).await.unwrap();
    let mut names: Vec<&str> = restored.iter().map(|o| o.package.as_str()).collect();
    names.sort();
    assert_eq!(names, vec!["pkga", "pkgb"]);
    assert!(env.prefix.is_installed("pkga"));
    assert!(env.prefix.is_installed("pkgb"));
}

#[tokio::test]
async fn conflicting_requirements_abort_when_configured() {
    let env = TestEnvironment::new();
    let server = MockServer::start().await;
    let root_url = format!("{}/bottles", server.uri());

    let sha = "9".repeat(64);
    env.write_formula(
        "homebrew/core",
        "needsnew",
        &format!(
            r#"class Needsnew < Formula
  url "https://example.com/needsnew-1.0.0.tar.gz"
  bottle do
    root_url "{root_url}"
    sha256 cellar: :any, arm64_sonoma: "{sha}"
  end
  depends_on "openssl@3" => ">=3.1.0"
end
"#
        ),
    );
    env.write_formula(
        "homebrew/core",
        "needsold",
        &format!(
            r#"class Needsold < Formula
  url "https://example.com/needsold-1.0.0.tar.gz"
  bottle do
    root_url "{root_url}"
    sha256 cellar: :any, arm64_sonoma: "{sha}"
  end
  depends_on "openssl@3" => "<3.0.0"
end
"#
        ),
    );
    env.write_formula(
        "homebrew/core",
        "openssl@3",
        &formula_source("openssl@3", "3.3.1", &root_url, &sha, &[]),
    );

    let orchestrator = orchestrator(&env);
    // The plan itself records the conflict without failing.
    let plan = orchestrator
        .plan(&["needsnew".to_string(), "needsold".to_string()])
        .unwrap();
    assert_eq!(plan.graph.version_conflicts.len(), 1);
    assert_eq!(plan.graph.version_conflicts[0].package, "openssl@3");

    // With abort_on_conflict, install refuses.
    let err = orchestrator
        .install(&["needsnew".to_string(), "needsold".to_string()], false)
        .await
        .unwrap_err();
    assert!(matches!(err, VeloError::VersionConflict { .. }));
}
