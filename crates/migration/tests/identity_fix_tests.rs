//! Identity fixes end to end: references are rewritten first, then the
//! owning resources are renamed, with history kept in step.

mod common;

use serde_json::{Value, json};

use common::*;
use helios_migration::types::{derive_uuid, security};
use helios_migration::variants::{IdentityFix, ThedacareIdFix};
use helios_migration::{MigrationError, Phase};

// ============================================================================
// Fixtures
// ============================================================================

/// A proa patient stored under the `client-<original>` composite key.
fn proa_patient(original: &str) -> ResourceFixture {
    ResourceFixture::new("Patient", format!("client-{original}"), "client")
        .with_security(security::CONNECTION_TYPE_SYSTEM, "proa")
        .with_meta_source(format!("http://ehr.example.com/Patient/{original}"))
}

fn seed_proa_patient(ctx: &TestContext, original: &str) -> ResourceFixture {
    let fixture = proa_patient(original);
    ctx.insert(&fixture);
    fixture
}

// ============================================================================
// Connection composite keys
// ============================================================================

#[tokio::test]
async fn test_connection_fix_renames_patient_and_rewrites_references() {
    let ctx = TestContext::new();
    let patient = seed_proa_patient(&ctx, "12345");
    for i in 0..3 {
        ctx.insert(&observation(&format!("obs-{i}"), "client", "Patient/client-12345"));
    }

    let summary = ctx.run(&IdentityFix::connection("proa")).await;

    assert!(!summary.has_errors());
    assert!(!summary.rename_skipped);
    assert_eq!(summary.cache_entries, 1);
    assert_eq!(summary.ambiguous_keys, 0);

    let new_uuid = derive_uuid("12345", "client");
    let renamed = ctx.find("Patient", "12345").expect("renamed patient");
    assert_eq!(renamed["id"], "12345");
    assert_eq!(renamed["_uuid"], new_uuid.as_str());
    assert_eq!(renamed["_sourceAssigningAuthority"], "client");
    assert_eq!(version_id(&renamed), Some("2"));
    assert!(ctx.find("Patient", &patient.source_id).is_none());

    for obs in ctx.resources("Observation") {
        assert_eq!(obs["subject"]["reference"], "Patient/12345");
        assert_eq!(obs["subject"]["_sourceId"], "Patient/12345");
        assert_eq!(obs["subject"]["_uuid"], format!("Patient/{new_uuid}"));
        assert_eq!(obs["subject"]["_sourceAssigningAuthority"], "client");
        assert_eq!(version_id(&obs), Some("2"));
    }
    // one new version per rewritten observation
    assert_eq!(ctx.history("Observation").len(), 3);
}

#[tokio::test]
async fn test_connection_fix_walks_phases_in_order() {
    let ctx = TestContext::new();
    seed_proa_patient(&ctx, "12345");
    ctx.insert(&observation("obs-1", "client", "Patient/client-12345"));

    let summary = ctx.run(&IdentityFix::connection("proa")).await;

    let rewrite = summary
        .phases
        .iter()
        .position(|p| matches!(p, Phase::RewriteReferences(_)))
        .expect("rewrite phase");
    let rename = summary
        .phases
        .iter()
        .position(|p| matches!(p, Phase::RenameIdentities(_)))
        .expect("rename phase");
    assert_eq!(summary.phases.first(), Some(&Phase::Init));
    assert!(summary.phases.contains(&Phase::Preload));
    assert!(rewrite < rename);
    assert_eq!(summary.phases.last(), Some(&Phase::Shutdown));
}

#[tokio::test]
async fn test_connection_fix_updates_history_of_touched_resources_only() {
    let ctx = TestContext::new();
    let patient = seed_proa_patient(&ctx, "12345");
    ctx.insert_history(&patient);
    // eligible history entry whose resource is no longer stored
    let orphan = proa_patient("777");
    ctx.insert_history(&orphan);

    ctx.run(&IdentityFix::connection("proa")).await;

    let history = ctx.history("Patient");
    let renamed: Vec<&Value> = history
        .iter()
        .filter(|entry| entry["resource"]["_sourceId"] == "12345")
        .collect();
    // the rewritten old entry and the version appended by the rename
    assert_eq!(renamed.len(), 2);
    assert!(renamed.iter().any(|entry| entry["request"]["url"] == "/4_0_0/Patient/12345"));

    let untouched = history
        .iter()
        .find(|entry| entry["resource"]["_uuid"] == orphan.uuid().as_str())
        .expect("orphan entry");
    assert_eq!(untouched["resource"]["_sourceId"], orphan.source_id.as_str());
    assert_eq!(untouched["request"]["url"], format!("/4_0_0/Patient/{}", orphan.source_id));
}

#[tokio::test]
async fn test_human_api_fix_strips_authority_prefix() {
    let ctx = TestContext::new();
    ctx.insert(&ResourceFixture::new("Patient", "HumanApi-abc", "humanapi"));
    ctx.insert(&observation("obs-1", "humanapi", "Patient/HumanApi-abc"));

    let summary = ctx.run(&IdentityFix::human_api()).await;
    assert!(!summary.has_errors());

    let renamed = ctx.find("Patient", "abc").expect("renamed patient");
    assert_eq!(renamed["_uuid"], derive_uuid("abc", "humanapi").as_str());
    let obs = &ctx.resources("Observation")[0];
    assert_eq!(obs["subject"]["reference"], "Patient/abc");
}

// ============================================================================
// Extensions and contained resources
// ============================================================================

#[tokio::test]
async fn test_references_in_extensions_and_contained_resources_are_rewritten() {
    let ctx = TestContext::new();
    seed_proa_patient(&ctx, "abc");
    let stale = "Patient/client-abc";
    ctx.insert(
        &observation("obs-everywhere", "client", stale)
            .with_field("extension", json!([{"url": "http://example.com/focus", "valueReference": reference(stale)}]))
            .with_field("contained", json!([{"resourceType": "Provenance", "id": "p", "target": [reference(stale)]}])),
    );
    // the stale reference appears nowhere else in these two
    ctx.insert(
        &observation("obs-extension", "client", "Patient/somebody-else").with_field(
            "modifierExtension",
            json!([{"url": "http://example.com/about", "valueReference": reference(stale)}]),
        ),
    );
    ctx.insert(
        &observation("obs-contained", "client", "Patient/somebody-else").with_field(
            "contained",
            json!([{"resourceType": "Provenance", "id": "p", "target": [reference(stale)]}]),
        ),
    );

    let summary = ctx.run(&IdentityFix::connection("proa")).await;
    assert!(!summary.has_errors());

    let everywhere = ctx.find("Observation", "obs-everywhere").unwrap();
    assert_eq!(everywhere["subject"]["reference"], "Patient/abc");
    assert_eq!(everywhere["extension"][0]["valueReference"]["reference"], "Patient/abc");
    assert_eq!(everywhere["contained"][0]["target"][0]["reference"], "Patient/abc");
    assert_eq!(version_id(&everywhere), Some("2"));

    let extension = ctx.find("Observation", "obs-extension").unwrap();
    assert_eq!(extension["modifierExtension"][0]["valueReference"]["reference"], "Patient/abc");
    assert_eq!(extension["subject"]["reference"], "Patient/somebody-else");

    let contained = ctx.find("Observation", "obs-contained").unwrap();
    assert_eq!(contained["contained"][0]["target"][0]["reference"], "Patient/abc");
    assert_eq!(
        contained["contained"][0]["target"][0]["_uuid"],
        format!("Patient/{}", derive_uuid("abc", "client"))
    );
}

// ============================================================================
// Thedacare id map
// ============================================================================

#[tokio::test]
async fn test_thedacare_fix_restores_original_id() {
    let dir = tempfile::tempdir().unwrap();
    let id_cache = dir.path().join("cachedResourceIds.json");
    let synthetic = synthetic_thedacare_id();
    std::fs::write(&id_cache, json!({"Patient": {synthetic.clone(): "A.B-1"}}).to_string()).unwrap();

    let ctx = TestContext::new();
    ctx.insert(&ResourceFixture::new("Patient", synthetic.as_str(), "thedacare"));
    ctx.insert(&observation("obs-1", "thedacare", &format!("Patient/{synthetic}")));

    let summary = ctx.run(&ThedacareIdFix::new(id_cache.clone(), None)).await;
    assert!(!summary.has_errors());

    let expected_uuid = uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, b"A.B-1|thedacare").to_string();
    let renamed = ctx.find("Patient", "A.B-1").expect("renamed patient");
    assert_eq!(renamed["id"], "A.B-1");
    assert_eq!(renamed["_uuid"], expected_uuid.as_str());
    assert!(ctx.find("Patient", &synthetic).is_none());

    let obs = &ctx.resources("Observation")[0];
    assert_eq!(obs["subject"]["reference"], "Patient/A.B-1");
    assert_eq!(obs["subject"]["_uuid"], format!("Patient/{expected_uuid}"));
}

#[tokio::test]
async fn test_thedacare_fix_without_id_source_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = TestContext::new();
    ctx.insert(&ResourceFixture::new("Patient", synthetic_thedacare_id(), "thedacare"));

    let err = ctx
        .try_run(&ThedacareIdFix::new(dir.path().join("missing.json"), None))
        .await
        .unwrap_err();

    assert!(matches!(err, MigrationError::Setup { .. }));
    assert!(err.is_fatal());
    assert_eq!(ctx.store.bulk_write_count(), 0);
}

// ============================================================================
// Failure handling
// ============================================================================

#[tokio::test]
async fn test_index_failure_aborts_run() {
    let ctx = TestContext::new();
    seed_proa_patient(&ctx, "12345");
    ctx.insert(&observation("obs-1", "client", "Patient/client-12345"));
    ctx.store.fail_index_creation(true);

    let err = ctx.try_run(&IdentityFix::connection("proa")).await.unwrap_err();

    assert!(err.is_fatal());
    assert_eq!(ctx.store.bulk_write_count(), 0);
    assert!(ctx.find("Patient", "client-12345").is_some());
}

#[tokio::test]
async fn test_rewrite_errors_skip_rename() {
    let mut options = test_options();
    options.batch_size = 1;
    options.collection_concurrency = 1;
    let ctx = TestContext::new().with_options(options);
    seed_proa_patient(&ctx, "12345");
    let first = ctx.insert(&observation("obs-1", "client", "Patient/client-12345"));
    ctx.insert(&observation("obs-2", "client", "Patient/client-12345"));
    ctx.insert(&observation("obs-3", "client", "Patient/client-12345"));
    ctx.store.fail_bulk_writes_after(Some(1));

    let summary = ctx.run(&IdentityFix::connection("proa")).await;

    assert!(summary.has_errors());
    assert!(summary.rename_skipped);
    let failed: Vec<_> = summary.failed().collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].collection.as_str(), "Observation_4_0_0");
    assert_eq!(failed[0].start_from_id.as_ref(), Some(&first));

    // nothing was renamed while references still point at the old id
    assert!(ctx.find("Patient", "client-12345").is_some());
    let rewritten = ctx
        .resources("Observation")
        .iter()
        .filter(|obs| obs["subject"]["reference"] == "Patient/12345")
        .count();
    assert_eq!(rewritten, 1);
}
