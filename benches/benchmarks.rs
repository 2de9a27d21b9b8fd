//! Benchmark suite for the patch and prompt hot paths.
//!
//! - Diff sanitizing (clean and damaged agent output)
//! - Hunk validation
//! - Prompt assembly from error excerpts
//!
//! # Running Benchmarks
//!
//! ```bash
//! cargo bench
//! cargo bench -- --save-baseline main
//! cargo bench -- --baseline main
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use healer::issue::IssueKind;
use healer::prompt::{build_fix_prompt, extract_line_refs, extract_search_terms};
use healer::{sanitize, validate};
use std::fmt::Write;
use std::fs;
use tempfile::TempDir;

// ============================================================================
// Diff Generation Helpers
// ============================================================================

/// A well-formed diff touching `files` files with `hunks` hunks each.
fn clean_diff(files: usize, hunks: usize) -> String {
    let mut out = String::new();
    for f in 0..files {
        let path = format!("src/module_{f}.ts");
        let _ = writeln!(out, "diff --git a/{path} b/{path}");
        let _ = writeln!(out, "index 1111111..2222222 100644");
        let _ = writeln!(out, "--- a/{path}");
        let _ = writeln!(out, "+++ b/{path}");
        for h in 0..hunks {
            let start = h * 20 + 1;
            let _ = writeln!(out, "@@ -{start},4 +{start},4 @@ export function f{h}() {{");
            let _ = writeln!(out, " const a = {h};");
            let _ = writeln!(out, "-const b = a + 1;");
            let _ = writeln!(out, "+const b = a + 2;");
            let _ = writeln!(out, " const c = b * 2;");
            let _ = writeln!(out, " return c;");
        }
    }
    out
}

/// The same diff the way a chatty model returns it: prose, a code fence,
/// CRLF endings, unprefixed context and wrong ranges.
fn damaged_diff(files: usize, hunks: usize) -> String {
    let clean = clean_diff(files, hunks)
        .replace(",4 +", ",3 +")
        .replace(" return c;", "return c;");
    format!("Here is the fix:\n\n```diff\n{clean}```\n").replace('\n', "\r\n")
}

// ============================================================================
// Patch Benchmarks
// ============================================================================

fn bench_sanitize(c: &mut Criterion) {
    let mut group = c.benchmark_group("sanitize");

    for files in [1, 10, 50] {
        let clean = clean_diff(files, 5);
        let damaged = damaged_diff(files, 5);
        group.throughput(Throughput::Bytes(clean.len() as u64));

        group.bench_with_input(BenchmarkId::new("clean", files), &clean, |b, diff| {
            b.iter(|| black_box(sanitize(black_box(diff))))
        });
        group.bench_with_input(BenchmarkId::new("damaged", files), &damaged, |b, diff| {
            b.iter(|| black_box(sanitize(black_box(diff))))
        });
    }

    group.finish();
}

fn bench_validate(c: &mut Criterion) {
    let mut group = c.benchmark_group("validate");

    for hunks in [5, 50, 200] {
        let diff = clean_diff(4, hunks);
        group.throughput(Throughput::Elements((4 * hunks) as u64));
        group.bench_with_input(BenchmarkId::new("hunks", hunks), &diff, |b, diff| {
            b.iter(|| black_box(validate(black_box(diff))))
        });
    }

    group.finish();
}

// ============================================================================
// Prompt Benchmarks
// ============================================================================

const EXCERPT: &str = "TypeError: Cannot read properties of undefined (reading 'map')
    at UserList (src/components/UserList.tsx:42:18)
    at renderWithHooks (node_modules/react-dom/cjs/react-dom.development.js:14985:18)
    at mountIndeterminateComponent (node_modules/react-dom/cjs/react-dom.development.js:17811:13)
    at fetchUsers (src/api/users.ts:17:5)
Error in UserProfileCard while rendering";

fn bench_prompt_extraction(c: &mut Criterion) {
    let mut group = c.benchmark_group("prompt_extraction");

    group.bench_function("line_refs", |b| {
        b.iter(|| black_box(extract_line_refs(black_box(EXCERPT))))
    });
    group.bench_function("search_terms", |b| {
        b.iter(|| black_box(extract_search_terms(black_box(EXCERPT))))
    });

    group.finish();
}

fn bench_fix_prompt(c: &mut Criterion) {
    let temp = TempDir::new().unwrap();
    for (rel, lines) in [("src/components/UserList.tsx", 400), ("src/api/users.ts", 60)] {
        let path = temp.path().join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let body: String = (1..=lines)
            .map(|n| format!("export const line{n} = {n};\n"))
            .collect();
        fs::write(path, body).unwrap();
    }

    c.bench_function("build_fix_prompt", |b| {
        b.iter(|| {
            black_box(build_fix_prompt(
                black_box(EXCERPT),
                IssueKind::Runtime,
                temp.path(),
            ))
        })
    });
}

criterion_group!(patch_benches, bench_sanitize, bench_validate);

criterion_group!(prompt_benches, bench_prompt_extraction, bench_fix_prompt);

criterion_main!(patch_benches, prompt_benches);
