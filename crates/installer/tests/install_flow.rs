//! End-to-end runs of the TLS and TURN steps against an in-memory cluster.

mod common;

use std::sync::Arc;

use june_installer::config::keys;
use june_installer::stages::{CertificateStep, ClusterIssuer, Stunner};
use june_installer::{Category, CertificateBackups, RunState, Sequencer, Step, StepStatus};
use pretty_assertions::assert_eq;
use tempfile::TempDir;

use common::{context, MemoryCluster};

fn steps() -> Vec<Box<dyn Step>> {
    vec![Box::new(ClusterIssuer), Box::new(CertificateStep), Box::new(Stunner)]
}

#[tokio::test]
async fn test_first_run_installs_and_persists_derived_values() {
    let dir = TempDir::new().unwrap();
    let cluster = MemoryCluster::new();
    let mut ctx = context(&dir, Arc::clone(&cluster));
    let state_file = ctx.config.state_file();

    let report = Sequencer::new(steps())
        .with_state_file(&state_file)
        .run(&mut ctx)
        .await
        .unwrap();

    assert!(report.is_clean(), "{report:?}");
    for name in ["cluster-issuer", "certificate", "stunner"] {
        assert_eq!(report.status_of(name), Some(StepStatus::Ok));
    }

    let domain = ctx.store.load(Category::Domain).unwrap();
    assert_eq!(domain[keys::CERT_SECRET_NAME], "june-example-com-tls");
    let stunner = ctx.store.load(Category::Stunner).unwrap();
    assert_eq!(stunner[keys::STUNNER_REALM], "june.example.com");
    assert_eq!(stunner[keys::STUNNER_PASSWORD].len(), 32);

    let backups = CertificateBackups::new(&ctx.config.certs_dir).list().unwrap();
    assert_eq!(backups.len(), 1);
    assert_eq!(backups[0].secret_name, "june-example-com-tls");

    let state = RunState::load(&state_file).unwrap().unwrap();
    assert!(state.completed);
    assert_eq!(state.report(), report);
}

#[tokio::test]
async fn test_second_run_skips_everything_without_side_effects() {
    let dir = TempDir::new().unwrap();
    let cluster = MemoryCluster::new();

    let mut first = context(&dir, Arc::clone(&cluster));
    Sequencer::new(steps()).run(&mut first).await.unwrap();
    let password = first.store.get(Category::Stunner, keys::STUNNER_PASSWORD).unwrap();
    let mutations = cluster.mutations();

    let mut second = context(&dir, Arc::clone(&cluster));
    let report = Sequencer::new(steps()).run(&mut second).await.unwrap();

    for name in ["cluster-issuer", "certificate", "stunner"] {
        assert_eq!(report.status_of(name), Some(StepStatus::Skipped));
    }
    assert_eq!(cluster.mutations(), mutations);
    assert_eq!(
        second.store.get(Category::Stunner, keys::STUNNER_PASSWORD).unwrap(),
        password
    );
}

#[tokio::test]
async fn test_reinstall_restores_certificate_before_requesting() {
    let dir = TempDir::new().unwrap();

    let mut original = context(&dir, MemoryCluster::new());
    Sequencer::new(steps()).run(&mut original).await.unwrap();

    // Fresh cluster, same host: the certificate backup survives.
    let cluster = MemoryCluster::new();
    let mut ctx = context(&dir, Arc::clone(&cluster));
    let report = Sequencer::new(vec![Box::new(CertificateStep) as Box<dyn Step>])
        .run(&mut ctx)
        .await
        .unwrap();

    assert_eq!(report.status_of("certificate"), Some(StepStatus::Ok));
    assert_eq!(
        cluster.mutations(),
        vec![
            "apply:Namespace/june",
            "secret:june/june-example-com-tls",
            "apply:Certificate/june-example-com-tls",
        ]
    );
    assert_eq!(
        CertificateBackups::new(&ctx.config.certs_dir).list().unwrap().len(),
        2
    );
}

#[tokio::test(start_paused = true)]
async fn test_unready_issuer_degrades_and_later_steps_still_run() {
    let dir = TempDir::new().unwrap();
    let cluster = MemoryCluster::new();
    cluster.mark_not_ready("letsencrypt-prod");
    let mut ctx = context(&dir, Arc::clone(&cluster));

    let report = Sequencer::new(steps()).run(&mut ctx).await.unwrap();

    assert_eq!(report.status_of("cluster-issuer"), Some(StepStatus::Degraded));
    assert_eq!(report.status_of("certificate"), Some(StepStatus::Ok));
    assert_eq!(report.status_of("stunner"), Some(StepStatus::Ok));
    assert_eq!(
        report.degraded().map(|r| r.name.as_str()).collect::<Vec<_>>(),
        vec!["cluster-issuer"]
    );
}

#[tokio::test]
async fn test_missing_token_degrades_issuer_only() {
    let dir = TempDir::new().unwrap();
    let cluster = MemoryCluster::new();
    let mut ctx = context(&dir, Arc::clone(&cluster));
    ctx.config.cf_api_token = None;

    let report = Sequencer::new(steps())
        .with_disabled(["stunner"])
        .run(&mut ctx)
        .await
        .unwrap();

    assert_eq!(report.status_of("cluster-issuer"), Some(StepStatus::Degraded));
    assert_eq!(report.status_of("stunner"), Some(StepStatus::Skipped));
    let issuer = report.steps.iter().find(|r| r.name == "cluster-issuer").unwrap();
    assert!(issuer.detail.as_deref().unwrap().contains("Cloudflare API token"));
}
