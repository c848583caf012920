mod common;

use std::fs;

use common::*;
use pagewright::recipe::{RecipeError, RecipeRegistry, StorageRoot, Tier};
use tokio_test::{assert_err, assert_ok};

fn three_tiers() -> (Vec<tempfile::TempDir>, RecipeRegistry) {
    let dirs: Vec<_> = (0..3).map(|_| create_test_dir()).collect();
    let registry = RecipeRegistry::new(vec![
        StorageRoot::new(Tier::Project, dirs[0].path()),
        StorageRoot::new(Tier::User, dirs[1].path()),
        StorageRoot::new(Tier::Examples, dirs[2].path()),
    ]);
    (dirs, registry)
}

#[test]
fn test_first_tier_shadows_and_deletion_is_seen_immediately() {
    let (dirs, registry) = three_tiers();
    for (dir, label) in dirs.iter().zip(["project", "user", "examples"]) {
        shell_recipe(
            dir.path(),
            "x",
            &format!("description: from {}\n", label),
            "echo '{}'\n",
        );
    }

    let bundle = assert_ok!(registry.resolve("x"));
    assert_eq!(bundle.tier, Tier::Project);
    assert_eq!(bundle.metadata.description, "from project");

    fs::remove_dir_all(dirs[0].path().join("x")).unwrap();
    let bundle = assert_ok!(registry.resolve("x"));
    assert_eq!(bundle.tier, Tier::User);
    assert_eq!(bundle.metadata.description, "from user");

    fs::remove_dir_all(dirs[1].path().join("x")).unwrap();
    assert_eq!(registry.resolve("x").unwrap().tier, Tier::Examples);

    fs::remove_dir_all(dirs[2].path().join("x")).unwrap();
    match assert_err!(registry.resolve("x")) {
        RecipeError::NotFound { name, searched } => {
            assert_eq!(name, "x");
            assert_eq!(searched.len(), 3);
        }
        other => panic!("unexpected: {:?}", other),
    }
}

#[test]
fn test_invalid_project_bundle_is_not_skipped() {
    let (dirs, registry) = three_tiers();
    write_recipe(
        dirs[0].path(),
        "x",
        "runtime: cobol\n",
        "recipe.sh",
        "echo '{}'\n",
    );
    shell_recipe(dirs[1].path(), "x", "", "echo '{}'\n");

    // a broken bundle in an earlier tier still wins resolution
    assert!(matches!(
        registry.resolve("x").unwrap_err(),
        RecipeError::Validation { .. }
    ));
}

#[test]
fn test_metadata_without_kind_is_rejected() {
    let (dirs, registry) = three_tiers();
    let bundle = dirs[0].path().join("untyped");
    fs::create_dir_all(&bundle).unwrap();
    fs::write(bundle.join("recipe.md"), "---\nname: untyped\nruntime: shell\n---\n").unwrap();
    fs::write(bundle.join("recipe.sh"), "echo '{}'\n").unwrap();

    match assert_err!(registry.resolve("untyped")) {
        RecipeError::Validation { name, reasons, .. } => {
            assert_eq!(name, "untyped");
            assert!(reasons[0].contains("type"), "{:?}", reasons);
        }
        other => panic!("unexpected: {:?}", other),
    }
}

#[test]
fn test_oversized_timeout_is_rejected() {
    let (dirs, registry) = three_tiers();
    shell_recipe(
        dirs[0].path(),
        "forever",
        "timeout: 18446744073709551615\n",
        "echo '{}'\n",
    );

    match assert_err!(registry.resolve("forever")) {
        RecipeError::Validation { reasons, .. } => {
            assert!(reasons.iter().any(|r| r.contains("at most")), "{:?}", reasons);
        }
        other => panic!("unexpected: {:?}", other),
    }
}

#[test]
fn test_list_marks_shadowed_entries() {
    let (dirs, registry) = three_tiers();
    shell_recipe(dirs[0].path(), "shared", "", "echo '{}'\n");
    shell_recipe(dirs[2].path(), "shared", "", "echo '{}'\n");
    shell_recipe(dirs[2].path(), "only-example", "", "echo '{}'\n");

    let listings = registry.list();
    let shared: Vec<_> = listings.iter().filter(|l| l.name == "shared").collect();
    assert_eq!(shared.len(), 2);
    assert!(!shared[0].shadowed);
    assert_eq!(shared[0].tier, Tier::Project);
    assert!(shared[1].shadowed);

    let example = listings.iter().find(|l| l.name == "only-example").unwrap();
    assert!(!example.shadowed);
    assert_eq!(example.tier, Tier::Examples);
}

#[test]
fn test_path_escape_rejected() {
    let (_dirs, registry) = three_tiers();
    for name in ["../etc", "a/../../b", "", "/abs"] {
        assert!(
            matches!(registry.resolve(name), Err(RecipeError::InvalidName(_))),
            "{name} accepted"
        );
    }
}
