//! SBOM determinism and sensitivity tests.

mod helpers;

use helpers::{add_module, TestEnv};
use rootcast::sbom::{generate_sbom, SbomFormat};
use std::fs;

#[test]
fn test_sbom_is_deterministic() {
    let env = TestEnv::new(&["example.com/cmd/hello"]);
    let cfg = env.config(&["example.com/cmd/hello"]);

    let (first, first_hash) = generate_sbom(&cfg.snapshot(), &env.instance.builddir()).unwrap();
    let (second, second_hash) = generate_sbom(&cfg.snapshot(), &env.instance.builddir()).unwrap();

    assert_eq!(first, second);
    assert_eq!(first_hash.sbom_hash, second_hash.sbom_hash);
}

#[test]
fn test_adding_and_removing_package_restores_hash() {
    let env = TestEnv::new(&["cmd/hello", "cmd/world"]);
    let builddir = env.instance.builddir();

    let h1 = generate_sbom(&env.config(&["cmd/hello"]).snapshot(), &builddir)
        .unwrap()
        .1
        .sbom_hash;
    let h2 = generate_sbom(&env.config(&["cmd/hello", "cmd/world"]).snapshot(), &builddir)
        .unwrap()
        .1
        .sbom_hash;
    let h1_again = generate_sbom(&env.config(&["cmd/hello"]).snapshot(), &builddir)
        .unwrap()
        .1
        .sbom_hash;

    assert_ne!(h1, h2);
    assert_eq!(h1, h1_again);
}

#[test]
fn test_dependency_change_changes_hash() {
    let env = TestEnv::new(&["cmd/hello"]);
    let cfg = env.config(&["cmd/hello"]);
    let builddir = env.instance.builddir();
    let before = generate_sbom(&cfg.snapshot(), &builddir).unwrap().1;

    fs::write(builddir.join("cmd/hello/go.sum"), "golang.org/x/sys v0.20.0 h1:new=\n").unwrap();
    let after = generate_sbom(&cfg.snapshot(), &builddir).unwrap().1;

    assert_ne!(before.sbom_hash, after.sbom_hash);
    assert_eq!(before.sbom.config_hash, after.sbom.config_hash);
}

#[test]
fn test_runtime_adjustments_do_not_reach_the_sbom() {
    let env = TestEnv::new(&["cmd/hello"]);
    let cfg = env.config(&["cmd/hello"]);
    let snapshot = cfg.snapshot();
    let builddir = env.instance.builddir();
    let before = generate_sbom(&snapshot, &builddir).unwrap().0;

    let mut working = env.working(cfg);
    working.internal.goarch = "arm64".into();
    working.config.packages.push("cmd/extra".into());

    assert_eq!(generate_sbom(&snapshot, &builddir).unwrap().0, before);
}

#[test]
fn test_packages_sharing_a_module_hash_it_once() {
    let env = TestEnv::new(&["example.com/tools"]);
    let cfg = env.config(&["example.com/tools/cmd/a", "example.com/tools/cmd/b"]);
    let (_, with_hash) = generate_sbom(&cfg.snapshot(), &env.instance.builddir()).unwrap();

    let paths: Vec<&str> = with_hash
        .sbom
        .go_mod_hashes
        .iter()
        .map(|h| h.path.as_str())
        .collect();
    assert_eq!(
        paths,
        [
            "builddir/example.com/tools/go.mod",
            "builddir/example.com/tools/go.sum"
        ]
    );
}

#[test]
fn test_unresolvable_package_is_not_found() {
    let env = TestEnv::new(&[]);
    add_module(&env.instance.builddir(), "cmd/hello");
    // go.mod only exists for cmd/hello; the builddir root has none
    let cfg = env.config(&["cmd/hello", "other.org/cmd/missing"]);
    let err = generate_sbom(&cfg.snapshot(), &env.instance.builddir()).unwrap_err();
    assert!(err.is_not_found());
    assert!(err.to_string().contains("other.org/cmd/missing"));
}

#[test]
fn test_hash_format_prints_only_the_hash() {
    let env = TestEnv::new(&["cmd/hello"]);
    let cfg = env.config(&["cmd/hello"]);
    let (marshaled, with_hash) = generate_sbom(&cfg.snapshot(), &env.instance.builddir()).unwrap();

    let out = SbomFormat::Hash.render(&marshaled, &with_hash);
    let text = String::from_utf8(out).unwrap();
    assert_eq!(text.trim_end(), with_hash.sbom_hash);
    assert_eq!(with_hash.sbom_hash.len(), 64);
}
