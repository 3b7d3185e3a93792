//! Master person links are pointed at uuid references.

mod common;

use serde_json::Value;

use common::*;
use helios_migration::variants::MasterPersonReferenceFix;

/// Two patients share the source id `dup` under different authorities.
fn seed_patients(ctx: &TestContext) -> ResourceFixture {
    let p1 = ResourceFixture::new("Patient", "p1", "client-a");
    ctx.insert(&p1);
    ctx.insert(&ResourceFixture::new("Patient", "dup", "client-a"));
    ctx.insert(&ResourceFixture::new("Patient", "dup", "client-b"));
    p1
}

fn link_references(person: &Value) -> Vec<String> {
    person["link"]
        .as_array()
        .map(|links| {
            links
                .iter()
                .filter_map(|link| link.pointer("/target/reference").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[tokio::test]
async fn test_links_point_at_uuid_references() {
    let dir = tempfile::tempdir().unwrap();
    let mut options = test_options();
    options.unresolved_dir = Some(dir.path().to_path_buf());
    let ctx = TestContext::new().with_options(options);
    let p1 = seed_patients(&ctx);
    let master = linked_person("m1", "bwell", &["Patient/p1", "Patient/dup", "Patient/p1"]);
    ctx.insert(&master);

    let summary = ctx.run(&MasterPersonReferenceFix::default()).await;

    assert!(!summary.has_errors());
    assert_eq!(summary.ambiguous_keys, 1);
    assert_eq!(summary.unresolved, 1);

    let person = ctx.find("Person", "m1").expect("master person");
    let uuid_reference = format!("Patient/{}", p1.uuid());
    // the two links to p1 collapse into one
    assert_eq!(link_references(&person), vec![uuid_reference.clone(), "Patient/dup".to_string()]);
    assert_eq!(person["link"][0]["target"]["_uuid"], uuid_reference.as_str());
    assert_eq!(person["link"][0]["target"]["_sourceId"], uuid_reference.as_str());
    assert_eq!(person["link"][0]["target"]["_sourceAssigningAuthority"], "client-a");
    assert_eq!(version_id(&person), Some("2"));

    let files: Vec<_> = std::fs::read_dir(dir.path()).unwrap().map(|e| e.unwrap().path()).collect();
    assert_eq!(files.len(), 1);
    let name = files[0].file_name().unwrap().to_string_lossy().to_string();
    assert!(name.starts_with("unresolvedReferences-"));
    let contents = std::fs::read_to_string(&files[0]).unwrap();
    assert_eq!(contents, format!("{{\n\t\"Person/{}\": \"Patient/dup\",\n}}\n", master.uuid()));
}

#[tokio::test]
async fn test_only_owned_people_are_rewritten() {
    let ctx = TestContext::new();
    seed_patients(&ctx);
    let foreign = linked_person("m2", "client-a", &["Patient/p1"]);
    ctx.insert(&foreign);

    let summary = ctx.run(&MasterPersonReferenceFix::default()).await;

    assert_eq!(summary.operations(), 0);
    assert_eq!(ctx.find("Person", "m2").unwrap(), foreign.build());
}

#[tokio::test]
async fn test_second_run_writes_nothing() {
    let ctx = TestContext::new();
    seed_patients(&ctx);
    ctx.insert(&linked_person("m1", "bwell", &["Patient/p1", "Patient/dup"]));
    ctx.run(&MasterPersonReferenceFix::default()).await;
    let writes = ctx.store.bulk_write_count();
    let before = ctx.find("Person", "m1").unwrap();

    let summary = ctx.run(&MasterPersonReferenceFix::default()).await;

    assert_eq!(summary.operations(), 0);
    assert_eq!(ctx.store.bulk_write_count(), writes);
    assert_eq!(ctx.find("Person", "m1").unwrap(), before);
    // the ambiguous link is reported on every run
    assert_eq!(summary.unresolved, 1);
}
