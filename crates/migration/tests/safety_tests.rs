//! Run-level guarantees: re-runs are no-ops, nothing is written for data that
//! needs no change, ambiguous keys are never guessed, output does not depend
//! on scheduling, and a failed run can simply be run again.

mod common;

use common::*;
use helios_migration::preload::IdMap;
use helios_migration::types::security;
use helios_migration::variants::{IdentityFix, ThedacareIdFix};

fn proa_patient(original: &str) -> ResourceFixture {
    ResourceFixture::new("Patient", format!("client-{original}"), "client")
        .with_security(security::CONNECTION_TYPE_SYSTEM, "proa")
        .with_meta_source(format!("http://ehr.example.com/Patient/{original}"))
}

/// Two proa patients, one with history, and observations about both.
fn seed_main(ctx: &TestContext) -> Vec<ResourceFixture> {
    let first = proa_patient("100");
    ctx.insert(&first);
    ctx.insert_history(&first);
    ctx.insert(&proa_patient("200"));
    let observations: Vec<ResourceFixture> = (0..5)
        .map(|i| {
            let subject = if i % 2 == 0 { "Patient/client-100" } else { "Patient/client-200" };
            observation(&format!("obs-{i}"), "client", subject)
        })
        .collect();
    for obs in &observations {
        ctx.insert(obs);
    }
    ctx.insert(&observation("obs-unrelated", "client", "Patient/somebody-else"));
    observations
}

/// [`seed_main`] plus a history entry per observation.
fn seed(ctx: &TestContext) {
    for obs in seed_main(ctx) {
        ctx.insert_history(&obs);
    }
}

// ============================================================================
// Idempotence
// ============================================================================

#[tokio::test]
async fn test_second_run_is_a_no_op() {
    let ctx = TestContext::new();
    seed(&ctx);
    let first = ctx.run(&IdentityFix::connection("proa")).await;
    assert!(first.operations() > 0);
    let writes = ctx.store.bulk_write_count();
    let snapshot = ctx.snapshot();

    let second = ctx.run(&IdentityFix::connection("proa")).await;

    assert_eq!(second.operations(), 0);
    assert_eq!(second.cache_entries, 0);
    assert_eq!(ctx.store.bulk_write_count(), writes);
    assert_eq!(ctx.snapshot(), snapshot);
}

// ============================================================================
// No spurious writes
// ============================================================================

#[tokio::test]
async fn test_nothing_to_migrate_writes_nothing() {
    let ctx = TestContext::new();
    // already canonical: the id is the original from meta.source
    ctx.insert(
        &ResourceFixture::new("Patient", "100", "client")
            .with_security(security::CONNECTION_TYPE_SYSTEM, "proa")
            .with_meta_source("http://ehr.example.com/Patient/100"),
    );
    ctx.insert(&observation("obs-1", "client", "Patient/100"));
    let snapshot = ctx.snapshot();

    let summary = ctx.run(&IdentityFix::connection("proa")).await;

    assert!(!summary.has_errors());
    assert_eq!(summary.operations(), 0);
    assert_eq!(ctx.store.bulk_write_count(), 0);
    assert_eq!(ctx.snapshot(), snapshot);
}

#[tokio::test]
async fn test_unrelated_documents_keep_their_version() {
    let ctx = TestContext::new();
    seed(&ctx);

    ctx.run(&IdentityFix::connection("proa")).await;

    let unrelated = ctx.find("Observation", "obs-unrelated").unwrap();
    assert_eq!(version_id(&unrelated), Some("1"));
    assert_eq!(unrelated["subject"]["reference"], "Patient/somebody-else");
}

// ============================================================================
// Ambiguity
// ============================================================================

#[tokio::test]
async fn test_ambiguous_reference_is_left_alone() {
    let ctx = TestContext::new();
    // `client-east-300` is either `east-300` under `client` or `300` under `client-east`
    ctx.insert(
        &ResourceFixture::new("Patient", "client-east-300", "client")
            .with_security(security::CONNECTION_TYPE_SYSTEM, "proa")
            .with_meta_source("http://ehr.example.com/Patient/east-300"),
    );
    ctx.insert(
        &ResourceFixture::new("Patient", "client-east-300", "client-east")
            .with_security(security::CONNECTION_TYPE_SYSTEM, "proa")
            .with_meta_source("http://ehr.example.com/Patient/300"),
    );
    ctx.insert(&observation("obs-1", "client", "Patient/client-east-300"));

    let summary = ctx.run(&IdentityFix::connection("proa")).await;

    assert!(!summary.has_errors());
    assert_eq!(summary.ambiguous_keys, 1);
    assert_eq!(summary.unresolved, 1);
    let obs = ctx.find("Observation", "obs-1").unwrap();
    assert_eq!(obs["subject"]["reference"], "Patient/client-east-300");
    assert!(obs["subject"].get("_uuid").is_none());
    assert_eq!(version_id(&obs), Some("1"));
}

#[tokio::test]
async fn test_shared_truncated_id_is_not_renamed() {
    let dir = tempfile::tempdir().unwrap();
    let id_cache = dir.path().join("cachedResourceIds.json");
    let synthetic = "A".repeat(64);
    let mut ids = IdMap::default();
    ids.record_original("Patient", &format!("{synthetic}-first"), 64);
    ids.record_original("Patient", &format!("{synthetic}-second"), 64);
    ids.save(&id_cache).await.unwrap();

    let ctx = TestContext::new();
    let patient = ResourceFixture::new("Patient", synthetic.as_str(), "thedacare");
    ctx.insert(&patient);
    ctx.insert(&observation("obs-1", "thedacare", &format!("Patient/{synthetic}")));
    let snapshot = ctx.snapshot();

    let summary = ctx.run(&ThedacareIdFix::new(id_cache, None)).await;

    assert!(!summary.has_errors());
    assert_eq!(summary.ambiguous_keys, 1);
    assert_eq!(summary.unresolved, 1);
    assert_eq!(summary.operations(), 0);
    assert_eq!(ctx.find("Patient", &synthetic).unwrap(), patient.build());
    assert_eq!(ctx.snapshot(), snapshot);
}

// ============================================================================
// Determinism
// ============================================================================

#[tokio::test]
async fn test_output_does_not_depend_on_concurrency() {
    let serial = {
        let mut options = test_options();
        options.collection_concurrency = 1;
        options.batch_size = 1;
        TestContext::new().with_options(options)
    };
    let parallel = {
        let mut options = test_options();
        options.collection_concurrency = 8;
        options.batch_size = 100;
        TestContext::new().with_options(options)
    };
    seed(&serial);
    seed(&parallel);

    serial.run(&IdentityFix::connection("proa")).await;
    parallel.run(&IdentityFix::connection("proa")).await;

    assert_eq!(serial.snapshot(), parallel.snapshot());
}

// ============================================================================
// Resumability
// ============================================================================

#[tokio::test]
async fn test_failed_run_completes_when_run_again() {
    let options = {
        let mut options = test_options();
        options.collection_concurrency = 1;
        options.batch_size = 1;
        options
    };
    // history of observations written before the failure is not revisited
    let reference = TestContext::new().with_options(options.clone());
    seed_main(&reference);
    reference.run(&IdentityFix::connection("proa")).await;

    let ctx = TestContext::new().with_options(options);
    seed_main(&ctx);
    ctx.store.fail_bulk_writes_after(Some(2));
    let failed = ctx.run(&IdentityFix::connection("proa")).await;
    assert!(failed.has_errors());
    assert!(failed.rename_skipped);
    let resume_at = failed.failed().next().and_then(|c| c.start_from_id.clone());
    assert!(resume_at.is_some());

    ctx.store.fail_bulk_writes_after(None);
    let retried = ctx.run(&IdentityFix::connection("proa")).await;

    assert!(!retried.has_errors());
    assert_eq!(ctx.snapshot(), reference.snapshot());
}
