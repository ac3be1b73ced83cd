// Criterion benches for the resolver and version hot paths.

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use std::collections::BTreeMap;
use tempfile::TempDir;
use velo::formula::{Dependency, Formula};
use velo::prefix::Prefix;
use velo::resolver::Resolver;
use velo::version::{SemanticVersion, VersionConstraint};

fn chain_formulas(depth: usize) -> BTreeMap<String, Formula> {
    (0..depth)
        .map(|i| {
            let name = format!("pkg{i}");
            let dependencies = if i + 1 < depth {
                vec![Dependency::required(format!("pkg{}", i + 1))]
            } else {
                vec![]
            };
            let formula = Formula {
                name: name.clone(),
                version: "1.0.0".to_string(),
                description: None,
                homepage: None,
                dependencies,
                bottles: vec![],
                source_sha256: None,
                tap: None,
            };
            (name, formula)
        })
        .collect()
}

fn bench_resolution(c: &mut Criterion) {
    let tmp = TempDir::new().unwrap();
    let prefix = Prefix::new(tmp.path());
    prefix.ensure_skeleton().unwrap();
    let formulas = chain_formulas(64);

    c.bench_function("resolve_64_deep_chain", |b| {
        b.iter(|| {
            let resolver = Resolver::new(&formulas, &prefix, "arm64_sonoma");
            black_box(resolver.resolve(&["pkg0".to_string()]).unwrap())
        })
    });
}

fn bench_version_parse(c: &mut Criterion) {
    c.bench_function("semver_parse_and_compare", |b| {
        b.iter(|| {
            let a = SemanticVersion::parse(black_box("1.10.3-beta2+build7")).unwrap();
            let z = SemanticVersion::parse(black_box("1.9.12")).unwrap();
            black_box(a > z)
        })
    });

    c.bench_function("constraint_satisfaction", |b| {
        let constraint = VersionConstraint::parse("~>1.2.3").unwrap();
        b.iter(|| black_box(constraint.satisfied_by(black_box("1.2.9"))))
    });
}

criterion_group!(benches, bench_resolution, bench_version_parse);
criterion_main!(benches);
