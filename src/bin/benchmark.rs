use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::{Parser, ValueEnum};
use futures::future::try_join_all;
use rvfs::{
    BackendKind, BackendRegistry, FileSystem, LocalStorage, Location, MountTable, Node,
    SessionStorage, StorageGateway, VirtualFileSystem,
};
use uuid::Uuid;

#[derive(ValueEnum, Clone, Debug, PartialEq)]
enum BackendMode {
    Session,
    Local,
    Both,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "RVFS Benchmark Tool", long_about = None)]
struct Args {
    /// 本地存储目录
    #[arg(short = 'L', long, default_value = ".rvfs-bench")]
    local: PathBuf,

    /// 被测后端
    #[arg(long, value_enum, default_value_t = BackendMode::Both)]
    mode: BackendMode,

    /// 每项测试的操作数
    #[arg(short, long, default_value = "1000")]
    ops: usize,

    /// 测试文件数量
    #[arg(short, long, default_value = "100")]
    num_files: usize,

    /// 文件大小（字节）
    #[arg(long, default_value = "1024")]
    file_size: usize,
}

struct BenchmarkResult {
    operation: String,
    duration: Duration,
    ops_per_sec: f64,
    mb_per_sec: Option<f64>,
}

impl BenchmarkResult {
    fn new(operation: &str, duration: Duration, ops: usize, bytes: Option<usize>) -> Self {
        let ops_per_sec = ops as f64 / duration.as_secs_f64();
        let mb_per_sec = bytes.map(|b| (b as f64 / 1_048_576.0) / duration.as_secs_f64());

        Self {
            operation: operation.to_string(),
            duration,
            ops_per_sec,
            mb_per_sec,
        }
    }

    fn print(&self) {
        print!("  {:<30} {:>10.3} ms", self.operation, self.duration.as_secs_f64() * 1000.0);
        print!(" | {:>8.1} ops/s", self.ops_per_sec);
        if let Some(mb_per_sec) = self.mb_per_sec {
            print!(" | {:>8.2} MB/s", mb_per_sec);
        }
        println!();
    }
}

async fn benchmark_backend(
    kind: BackendKind,
    registry: BackendRegistry,
    args: &Args,
    test_name: &str,
) -> Result<Vec<BenchmarkResult>> {
    let mut results = Vec::new();
    println!("\n=== {} ===", test_name);

    let gateway = Arc::new(StorageGateway::new(registry));
    let mounts = MountTable::new([("/", Location::root(kind))])?;
    let vfs = VirtualFileSystem::new(gateway.clone(), mounts);
    gateway.set_node(kind, "bench", &Node::file("x"), None).await?;

    // 1. 同一个键上的并发读取，闸门使它们串行
    println!("\n测试同一键上的并发操作 ({} 次)...", args.ops);
    let start = Instant::now();
    try_join_all((0..args.ops).map(|_| gateway.get_node(kind, "bench", None))).await?;
    results.push(BenchmarkResult::new("同一键并发读取", start.elapsed(), args.ops, None));

    // 2. 不同键上的并发写入
    println!("测试不同键上的并发操作...");
    let keys: Vec<String> = (0..args.ops).map(|i| format!("bench_{}", i)).collect();
    let node = Node::file("x");
    let start = Instant::now();
    try_join_all(keys.iter().map(|key| gateway.set_node(kind, key, &node, None))).await?;
    results.push(BenchmarkResult::new("不同键并发写入", start.elapsed(), args.ops, None));

    // 3. 显式加锁/解锁
    println!("测试加锁/解锁循环...");
    let start = Instant::now();
    for _ in 0..args.ops {
        let lock = gateway.lock_node(kind, "bench").await?;
        gateway.unlock_node(kind, "bench", lock).await?;
    }
    results.push(BenchmarkResult::new("加锁/解锁", start.elapsed(), args.ops, None));

    // 4. 持锁读-改-写
    println!("测试持锁读-改-写...");
    let start = Instant::now();
    for i in 0..args.ops {
        let lock = gateway.lock_node(kind, "bench").await?;
        let mut node = gateway
            .get_node(kind, "bench", Some(lock))
            .await?
            .unwrap_or_else(|| Node::file(""));
        node.set_content(i.to_string());
        gateway.set_node(kind, "bench", &node, Some(lock)).await?;
        gateway.unlock_node(kind, "bench", lock).await?;
    }
    results.push(BenchmarkResult::new("持锁读-改-写", start.elapsed(), args.ops, None));

    for key in keys.iter().map(String::as_str).chain(["bench"]) {
        gateway.delete_node(kind, key, None).await?;
    }

    // 5. 同一目录下创建文件
    let data = vec![b'a'; args.file_size];
    let dir = format!("/bench_{}", Uuid::new_v4().simple());
    println!("\n测试文件创建 ({} 个文件, 每个 {} 字节)...", args.num_files, args.file_size);
    let start = Instant::now();
    try_join_all(
        (0..args.num_files).map(|i| {
            let path = format!("{}/file_{}.txt", dir, i);
            let vfs = &vfs;
            let data = &data;
            async move { vfs.write_file(&path, data).await }
        }),
    )
    .await?;
    results.push(BenchmarkResult::new(
        "并发创建文件",
        start.elapsed(),
        args.num_files,
        Some(args.num_files * args.file_size),
    ));

    // 6. 文件读取
    println!("测试文件读取...");
    let start = Instant::now();
    for i in 0..args.num_files {
        vfs.read_file(&format!("{}/file_{}.txt", dir, i)).await?;
    }
    results.push(BenchmarkResult::new(
        "文件读取",
        start.elapsed(),
        args.num_files,
        Some(args.num_files * args.file_size),
    ));

    // 7. 目录列表
    println!("测试目录列表...");
    let start = Instant::now();
    let entries = vfs.list_directory(&dir).await?;
    results.push(BenchmarkResult::new("目录列表", start.elapsed(), entries.len(), None));

    // 清理
    for i in 0..args.num_files {
        vfs.remove(&format!("{}/file_{}.txt", dir, i)).await?;
    }
    vfs.remove(&dir).await?;

    Ok(results)
}

fn print_results(results: &[BenchmarkResult]) {
    println!("\n📊 性能测试结果:");
    println!("  {:<30} {:>10} | {:>8} | {:>8}", "操作", "耗时", "吞吐量", "带宽");
    println!("  {}", "-".repeat(70));
    for result in results {
        result.print();
    }
}

fn compare_results(session_results: &[BenchmarkResult], local_results: &[BenchmarkResult]) {
    println!("\n📈 性能对比:");
    println!("  {:<30} {:>15} {:>15} {:>10}", "操作", "Session (ms)", "Local (ms)", "差异");
    println!("  {}", "-".repeat(75));

    for (session, local) in session_results.iter().zip(local_results.iter()) {
        let session_ms = session.duration.as_secs_f64() * 1000.0;
        let local_ms = local.duration.as_secs_f64() * 1000.0;
        let diff_percent = (local_ms - session_ms) / session_ms * 100.0;

        print!("  {:<30}", session.operation);
        print!(" {:>15.3}", session_ms);
        print!(" {:>15.3}", local_ms);
        println!(" {:>9.1}%", diff_percent);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    println!("🚀 RVFS 性能基准测试");
    println!("配置：");
    println!("  本地存储: {:?}", args.local);
    println!("  操作数: {}", args.ops);
    println!("  测试文件数: {}", args.num_files);
    println!("  文件大小: {} 字节", args.file_size);

    let mut session_results = Vec::new();
    let mut local_results = Vec::new();

    if args.mode == BackendMode::Session || args.mode == BackendMode::Both {
        println!("\n\n🔧 测试 SessionStorage 后端...");
        let registry = BackendRegistry::new().with(BackendKind::Session, SessionStorage::new());
        session_results =
            benchmark_backend(BackendKind::Session, registry, &args, "SessionStorage").await?;
        print_results(&session_results);
    }

    if args.mode == BackendMode::Local || args.mode == BackendMode::Both {
        println!("\n\n🔧 测试 LocalStorage 后端...");
        let storage = LocalStorage::new(args.local.clone(), Uuid::new_v4());
        let registry = BackendRegistry::new().with(BackendKind::Local, storage);
        local_results =
            benchmark_backend(BackendKind::Local, registry, &args, "LocalStorage").await?;
        print_results(&local_results);
    }

    if !session_results.is_empty() && !local_results.is_empty() {
        compare_results(&session_results, &local_results);
    }

    println!("\n✅ 基准测试完成！");
    Ok(())
}
