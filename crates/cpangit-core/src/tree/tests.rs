use std::rc::Rc;

use anyhow::Result;
use tempfile::tempdir;

use cpangit_domain::BranchConfig;

use super::archive::{ArchiveError, ArchiveTree, AUTHORS_PREFIX, CONFIG_PATH};
use super::{CommitOptions, MutableTree, TreeError};
use crate::gitstore::{GitStore, FILEMODE_BLOB};

fn new_store() -> Result<(tempfile::TempDir, Rc<GitStore>)> {
    let temp = tempdir()?;
    let store = Rc::new(GitStore::open(temp.path())?);
    Ok((temp, store))
}

fn seed_branch(store: &Rc<GitStore>, name: &str, files: &[(&str, &[u8])]) -> Result<()> {
    let mut tree = MutableTree::unborn(Rc::clone(store), name);
    for (path, bytes) in files {
        tree.write(path, bytes)?;
    }
    tree.commit(
        "seed",
        CommitOptions {
            create_branch: true,
            ..Default::default()
        },
    )?;
    Ok(())
}

#[test]
fn staged_writes_are_visible_before_update_tree() -> Result<()> {
    let (_temp, store) = new_store()?;
    let mut tree = MutableTree::from_tree(Rc::clone(&store), None);
    let oid = tree.write("modules/02packages.details.txt", b"payload")?;

    let (found, mode) = tree
        .get_path("modules/02packages.details.txt")?
        .expect("staged path visible");
    assert_eq!(found, oid);
    assert_eq!(mode, FILEMODE_BLOB);
    assert!(tree.has_changes());
    Ok(())
}

#[test]
fn staged_deletions_shadow_the_snapshot() -> Result<()> {
    let (_temp, store) = new_store()?;
    seed_branch(&store, "seeded", &[("doomed.txt", b"bytes")])?;

    let mut tree = MutableTree::from_branch(Rc::clone(&store), "seeded")?;
    assert!(tree.get_path("doomed.txt")?.is_some());

    tree.set_path("doomed.txt", None, FILEMODE_BLOB)?;
    assert!(tree.get_path("doomed.txt")?.is_none());
    Ok(())
}

#[test]
fn update_tree_is_deterministic_and_preserves_has_changes() -> Result<()> {
    let (_temp, store) = new_store()?;

    let mut first = MutableTree::from_tree(Rc::clone(&store), None);
    first.write("a/b.txt", b"one")?;
    first.write("a/c.txt", b"two")?;
    let first_tree = first.update_tree()?;
    assert!(first.has_changes(), "pending-commit state survives");
    assert_eq!(first.snapshot(), Some(first_tree));

    let mut second = MutableTree::from_tree(Rc::clone(&store), None);
    second.write("a/c.txt", b"two")?;
    second.write("a/b.txt", b"one")?;
    assert_eq!(second.update_tree()?, first_tree);
    Ok(())
}

#[test]
fn commit_advances_the_branch_with_exactly_the_staged_changes() -> Result<()> {
    let (_temp, store) = new_store()?;
    seed_branch(&store, "work", &[("existing.txt", b"old")])?;

    let mut tree = MutableTree::from_branch(Rc::clone(&store), "work")?;
    tree.write("added.txt", b"new")?;
    let commit = tree.commit("add a file", CommitOptions::default())?;

    assert!(!tree.has_changes());
    let (tip, tip_tree) = store.branch_tip("work")?.expect("branch");
    assert_eq!(tip, commit);
    assert_eq!(tree.snapshot(), Some(tip_tree));
    assert!(store.tree_entry(tip_tree, "existing.txt")?.is_some());
    assert!(store.tree_entry(tip_tree, "added.txt")?.is_some());
    assert!(store.tree_entry(tip_tree, "uninvited.txt")?.is_none());
    Ok(())
}

#[test]
fn commit_without_a_target_fails() -> Result<()> {
    let (_temp, store) = new_store()?;
    let mut tree = MutableTree::from_tree(Rc::clone(&store), None);
    tree.write("orphan.txt", b"bytes")?;

    let err = tree.commit("nowhere to go", CommitOptions::default()).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<TreeError>(),
        Some(TreeError::NoCommitTarget)
    ));
    Ok(())
}

#[test]
fn commit_without_changes_fails() -> Result<()> {
    let (_temp, store) = new_store()?;
    seed_branch(&store, "idle", &[("a.txt", b"a")])?;
    let mut tree = MutableTree::from_branch(Rc::clone(&store), "idle")?;
    let err = tree.commit("nothing", CommitOptions::default()).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<TreeError>(),
        Some(TreeError::NothingToCommit)
    ));
    Ok(())
}

#[test]
fn missing_branches_are_reported() -> Result<()> {
    let (_temp, store) = new_store()?;
    let err = MutableTree::from_branch(Rc::clone(&store), "ghost").unwrap_err();
    assert!(matches!(
        err.downcast_ref::<TreeError>(),
        Some(TreeError::MissingBranch(name)) if name == "ghost"
    ));
    Ok(())
}

#[test]
fn workdir_trees_stage_through_the_index() -> Result<()> {
    let (_temp, store) = new_store()?;
    let mut tree = MutableTree::for_workdir(Rc::clone(&store))?;
    tree.write("staged.txt", b"bytes")?;
    assert!(tree.get_path("staged.txt")?.is_some());
    assert!(store.index_find("staged.txt").is_some());

    let first = tree.commit("first", CommitOptions::default())?;
    assert_eq!(store.head_target()?, Some(first));

    // The index layer answers lookups for a fresh workdir tree.
    let fresh = MutableTree::for_workdir(Rc::clone(&store))?;
    assert!(fresh.get_path("staged.txt")?.is_some());

    let mut tree = MutableTree::for_workdir(Rc::clone(&store))?;
    tree.set_path("staged.txt", None, FILEMODE_BLOB)?;
    assert!(tree.get_path("staged.txt")?.is_none());
    let second = tree.commit("remove", CommitOptions::default())?;
    let second_tree = store.commit_tree(second)?;
    assert!(store.tree_entry(second_tree, "staged.txt")?.is_none());
    assert_eq!(store.head_target()?, Some(second));
    Ok(())
}

fn archive_on(store: &Rc<GitStore>, branch: &str) -> Result<ArchiveTree> {
    Ok(ArchiveTree::new(MutableTree::from_branch(
        Rc::clone(store),
        branch,
    )?))
}

#[test]
fn missing_config_is_a_typed_error() -> Result<()> {
    let (_temp, store) = new_store()?;
    seed_branch(&store, "bare", &[("unrelated.txt", b"x")])?;
    let mut archive = archive_on(&store, "bare")?;
    let err = archive.config().unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ArchiveError>(),
        Some(ArchiveError::MissingConfig)
    ));
    assert!(archive.config_opt()?.is_none());
    Ok(())
}

#[test]
fn write_config_skips_identical_content() -> Result<()> {
    let (_temp, store) = new_store()?;
    let config = BranchConfig {
        canonical_url: Some("https://darkpan.example/".to_string()),
        ..Default::default()
    };
    seed_branch(
        &store,
        "configured",
        &[(CONFIG_PATH, config.to_canonical_bytes()?.as_slice())],
    )?;

    let mut archive = archive_on(&store, "configured")?;
    assert!(!archive.write_config(&config)?, "identical content not restaged");
    assert!(!archive.tree().has_changes());

    let changed = BranchConfig {
        canonical_url: Some("https://elsewhere.example/".to_string()),
        ..Default::default()
    };
    assert!(archive.write_config(&changed)?);
    assert!(archive.tree().has_changes());
    assert_eq!(
        archive.config()?.canonical_url.as_deref(),
        Some("https://elsewhere.example/")
    );
    Ok(())
}

#[test]
fn config_cache_invalidates_on_rewrite() -> Result<()> {
    let (_temp, store) = new_store()?;
    let config = BranchConfig {
        corelist_perl_version: Some("5.036".to_string()),
        ..Default::default()
    };
    seed_branch(
        &store,
        "reconfigured",
        &[(CONFIG_PATH, config.to_canonical_bytes()?.as_slice())],
    )?;

    let mut archive = archive_on(&store, "reconfigured")?;
    assert_eq!(
        archive.config()?.corelist_perl_version.as_deref(),
        Some("5.036")
    );

    let replacement = BranchConfig {
        corelist_perl_version: Some("5.040".to_string()),
        ..Default::default()
    };
    archive.set_path(
        CONFIG_PATH,
        Some(&replacement.to_canonical_bytes()?),
        FILEMODE_BLOB,
    )?;
    assert_eq!(
        archive.config()?.corelist_perl_version.as_deref(),
        Some("5.040")
    );
    Ok(())
}

#[test]
fn meta_paths_strip_known_archive_extensions() {
    for (dist, meta) in [
        ("A/AA/AAA/Foo-1.0.tar.gz", "A/AA/AAA/Foo-1.0.meta"),
        ("A/AA/AAA/Foo-1.0.tgz", "A/AA/AAA/Foo-1.0.meta"),
        ("A/AA/AAA/Foo-1.0.zip", "A/AA/AAA/Foo-1.0.meta"),
        ("A/AA/AAA/Foo-1.0.tar.bz2", "A/AA/AAA/Foo-1.0.meta"),
        ("A/AA/AAA/Foo-1.0.tbz2", "A/AA/AAA/Foo-1.0.meta"),
        ("A/AA/AAA/Foo-1.0.unknown", "A/AA/AAA/Foo-1.0.unknown.meta"),
    ] {
        assert_eq!(ArchiveTree::meta_path_for_dist(dist), meta);
    }
}

const PEER_INDEX: &str = "\
File:         02packages.details.txt
URL:          http://www.perl.com/CPAN/modules/02packages.details.txt
Description:  Package names found in directory $CPAN/authors/id/
Columns:      package name, version, path
Intended-For: Automated fetch routines, namespace documentation.
Written-By:   PAUSE version 1.005
Line-Count:   11
Last-Updated: Sun, 02 Aug 2026 01:23:45 GMT

Alone::Module 2.0  B/BB/BBB/Alone-Module-2.0.tar.gz
Twin::One 1.5  A/AA/AAA/Twin-1.5.tar.gz
Twin::Two undef  A/AA/AAA/Twin-1.5.tar.gz
";

fn seed_peer(store: &Rc<GitStore>) -> Result<()> {
    seed_branch(
        store,
        "peer",
        &[
            (
                "modules/02packages.details.txt",
                PEER_INDEX.as_bytes(),
            ),
            ("authors/id/A/AA/AAA/Twin-1.5.tar.gz", b"twin archive"),
            ("authors/id/B/BB/BBB/Alone-Module-2.0.tar.gz", b"alone archive"),
        ],
    )
}

fn seed_curated(store: &Rc<GitStore>) -> Result<()> {
    let config = BranchConfig {
        default_import_sources: vec!["peer".to_string()],
        ..Default::default()
    };
    seed_branch(
        store,
        "curated",
        &[(CONFIG_PATH, config.to_canonical_bytes()?.as_slice())],
    )
}

#[test]
fn import_dist_copies_the_blob_and_every_provided_module() -> Result<()> {
    let (_temp, store) = new_store()?;
    seed_peer(&store)?;
    seed_curated(&store)?;

    let mut peer = archive_on(&store, "peer")?;
    let mut curated = archive_on(&store, "curated")?;
    curated.import_dist(&mut peer, "A/AA/AAA/Twin-1.5.tar.gz")?;

    let path = format!("{AUTHORS_PREFIX}A/AA/AAA/Twin-1.5.tar.gz");
    let copied = curated.get_path(&path)?.expect("dist staged");
    let original = peer.get_path(&path)?.expect("dist in peer");
    assert_eq!(copied.0, original.0, "content-addressing shares the blob");

    let index = curated.package_details()?;
    assert_eq!(index.len(), 2);
    assert_eq!(
        index.row("Twin::One").expect("row").version.as_deref(),
        Some("1.5")
    );
    assert!(index.row("Twin::Two").expect("row").version.is_none());
    assert!(index.row("Alone::Module").is_none());
    Ok(())
}

#[test]
fn import_dist_twice_is_a_no_op() -> Result<()> {
    let (_temp, store) = new_store()?;
    seed_peer(&store)?;
    seed_curated(&store)?;

    let mut peer = archive_on(&store, "peer")?;
    let mut curated = archive_on(&store, "curated")?;
    curated.import_dist(&mut peer, "A/AA/AAA/Twin-1.5.tar.gz")?;
    curated.tree_mut().commit("import", CommitOptions::default())?;
    assert!(!curated.tree().has_changes());

    curated.import_dist(&mut peer, "A/AA/AAA/Twin-1.5.tar.gz")?;
    assert!(
        !curated.tree().has_changes(),
        "re-importing identical content stages nothing"
    );
    let index = curated.package_details()?;
    assert_eq!(index.len(), 2);
    Ok(())
}

#[test]
fn import_dist_refuses_differing_content() -> Result<()> {
    let (_temp, store) = new_store()?;
    seed_peer(&store)?;

    let config = BranchConfig::default();
    seed_branch(
        &store,
        "clashing",
        &[
            (CONFIG_PATH, config.to_canonical_bytes()?.as_slice()),
            ("authors/id/A/AA/AAA/Twin-1.5.tar.gz", b"different bytes"),
        ],
    )?;

    let mut peer = archive_on(&store, "peer")?;
    let mut clashing = archive_on(&store, "clashing")?;
    let err = clashing
        .import_dist(&mut peer, "A/AA/AAA/Twin-1.5.tar.gz")
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ArchiveError>(),
        Some(ArchiveError::DistCollision { .. })
    ));
    Ok(())
}

#[test]
fn import_dist_requires_the_peer_to_have_the_dist() -> Result<()> {
    let (_temp, store) = new_store()?;
    seed_peer(&store)?;
    seed_curated(&store)?;

    let mut peer = archive_on(&store, "peer")?;
    let mut curated = archive_on(&store, "curated")?;
    let err = curated
        .import_dist(&mut peer, "X/XX/XXX/Absent-1.0.tar.gz")
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ArchiveError>(),
        Some(ArchiveError::NotInPeer(_))
    ));
    Ok(())
}

#[test]
fn import_dist_carries_the_meta_blob_when_present() -> Result<()> {
    let (_temp, store) = new_store()?;
    seed_branch(
        &store,
        "peer-with-meta",
        &[
            (
                "modules/02packages.details.txt",
                "File: x\n\nWith::Meta 1.0  W/WI/WITH/With-Meta-1.0.tar.gz\n".as_bytes(),
            ),
            ("authors/id/W/WI/WITH/With-Meta-1.0.tar.gz", b"archive"),
            (
                "authors/id/W/WI/WITH/With-Meta-1.0.meta",
                br#"{"prereqs":{"runtime":{"requires":{"Dep::One":"1.0"}}}}"#,
            ),
        ],
    )?;
    seed_curated(&store)?;

    let mut peer = archive_on(&store, "peer-with-meta")?;
    let mut curated = archive_on(&store, "curated")?;
    curated.import_dist(&mut peer, "W/WI/WITH/With-Meta-1.0.tar.gz")?;

    let prereqs = curated.dist_prereqs("W/WI/WITH/With-Meta-1.0.tar.gz")?;
    assert_eq!(prereqs.len(), 1);
    assert_eq!(prereqs["Dep::One"].to_string(), ">=1.0");

    // A dist without a meta blob resolves to unknown prereqs.
    assert!(curated.dist_prereqs("A/AA/AAA/Twin-1.5.tar.gz")?.is_empty());
    Ok(())
}
