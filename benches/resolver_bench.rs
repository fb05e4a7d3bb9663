//! 声明解析与运行时装配性能基准测试
//!
//! 使用 Criterion 框架进行性能测试，包括：
//! - 嵌套声明解析基准
//! - 模块标识解析基准
//! - 运行时创建与销毁基准

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use chips_testkit::module::ModuleIdentity;
use chips_testkit::{
    DescriptorResolver, HarnessConfig, ModuleRequirement, ScopeDeclaration, TestHarness,
    COMPONENT_RUNTIME_COMPOSITE,
};
use tempfile::TempDir;

// ============================================================================
// 测试辅助
// ============================================================================

/// 构造指定嵌套深度的声明，每层声明若干模块和属性
fn nested_scope(depth: usize, modules_per_level: usize) -> ScopeDeclaration {
    let mut scope: Option<ScopeDeclaration> = None;
    for level in 0..depth {
        let mut current = ScopeDeclaration::new(format!("Level{}", level))
            .with_property("level", level.to_string())
            .with_export(format!("bench.level{}.api;version=\"1.0.0\"", level));
        for index in 0..modules_per_level {
            let requirement = ModuleRequirement::new(format!("bench.module.{}", index));
            current = current.with_module(if index % 3 == 0 {
                requirement.started().isolated_in(format!("group{}", index % 2))
            } else {
                requirement
            });
        }
        if level == 0 {
            current = current.with_composite(COMPONENT_RUNTIME_COMPOSITE);
        }
        if let Some(parent) = scope.take() {
            current = current.with_parent(parent);
        }
        scope = Some(current);
    }
    scope.unwrap_or_else(|| ScopeDeclaration::new("Empty"))
}

// ============================================================================
// 声明解析基准
// ============================================================================

fn bench_resolve(c: &mut Criterion) {
    let resolver = DescriptorResolver::new();
    let mut group = c.benchmark_group("resolve");

    for depth in [1, 4, 16] {
        let scope = nested_scope(depth, 8);
        group.bench_with_input(BenchmarkId::new("nested", depth), &scope, |b, scope| {
            b.iter(|| black_box(resolver.resolve(black_box(scope))))
        });
    }

    group.finish();
}

fn bench_identity_parse(c: &mut Criterion) {
    c.bench_function("identity_parse", |b| {
        b.iter(|| {
            black_box(ModuleIdentity::parse(black_box(
                "my.api.module;version=\"[1.0.0, 2.0.0)\";region=eu",
            )))
        })
    });
}

// ============================================================================
// 运行时装配基准
// ============================================================================

fn bench_acquire_release(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let temp = TempDir::new().unwrap();
    for index in 0..8 {
        let name = format!("bench.module.{}", index);
        let dir = temp.path().join(&name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("module.yaml"),
            format!("name: {}\nversion: 1.0.0\n", name),
        )
        .unwrap();
    }

    let harness = TestHarness::new(
        HarnessConfig::builder()
            .search_root(temp.path())
            .ignore_env_search_path()
            .build(),
    );
    let mut scope = ScopeDeclaration::new("Bench");
    for index in 0..8 {
        scope = scope.with_module(ModuleRequirement::new(format!("bench.module.{}", index)).started());
    }

    c.bench_function("acquire_release", |b| {
        b.iter(|| {
            rt.block_on(async {
                let runtime = harness.before_all(&scope).await.unwrap();
                black_box(runtime.installed().len());
                harness.after_all(&scope).await;
            })
        })
    });
}

criterion_group!(benches, bench_resolve, bench_identity_parse, bench_acquire_release);
criterion_main!(benches);
