use std::io::{self, BufRead, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use rvfs::fs::path;
use rvfs::{
    BackendKind, FileSystem, Location, NodeId, NodeKind, StorageGateway, StorageRequest,
    VfsConfig, VirtualFileSystem,
};
use tracing::{debug, info};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about = "分层虚拟文件系统", long_about = None)]
struct Args {
    /// 配置文件（JSON），缺省时使用内置的挂载表
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 当前目录，用于解析相对路径
    #[arg(long, default_value = "/")]
    cwd: String,

    /// 用户名，`~` 展开为 /home/<用户名>
    #[arg(short, long)]
    user: Option<String>,

    /// 日志级别（-v info, -vv debug, -vvv trace）
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 创建目录，缺失的父目录一并创建
    Mkdir { path: String },
    /// 写文件；省略内容时从标准输入读取
    Write {
        path: String,
        content: Option<String>,
    },
    /// 输出文件内容
    Cat { path: String },
    /// 列出目录
    Ls {
        path: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// 显示整棵树
    Tree {
        #[arg(long)]
        json: bool,
    },
    Stat { path: String },
    /// 删除文件、空目录或挂载节点
    Rm { path: String },
    /// 在 PATH 处创建指向 BACKEND 中某个目录的挂载节点
    Mount {
        path: String,
        backend: BackendKind,
        /// 目标目录，缺省为后端的根
        #[arg(long)]
        root: Option<NodeId>,
    },
    /// 显示挂载表
    Mounts,
    /// 从标准输入读取一条 JSON 存储请求并输出响应
    Request,
    /// 从标准输入逐行读取命令，会话存储在命令之间保留
    Batch,
}

/// batch 模式下的一行
#[derive(Parser, Debug)]
#[command(no_binary_name = true)]
struct BatchLine {
    #[command(subcommand)]
    command: Command,
}

/// 按 shell 规则切分一行，引号内的空白属于同一个参数
fn parse_batch_line(line: &str) -> Result<Command> {
    let words = shlex::split(line).ok_or_else(|| anyhow!("unbalanced quotes"))?;
    Ok(BatchLine::try_parse_from(words)?.command)
}

struct Shell {
    vfs: VirtualFileSystem,
    cwd: String,
    home: String,
}

impl Shell {
    fn resolve(&self, p: &str) -> String {
        path::resolve(p, &self.cwd, &self.home)
    }

    async fn run(&self, command: Command, batch: bool, out: &mut impl Write) -> Result<()> {
        match command {
            Command::Mkdir { path } => {
                let location = self.vfs.mkdir(&self.resolve(&path)).await?;
                debug!("mkdir {} -> {}", path, location);
            }
            Command::Write { path, content } => {
                let data = match content {
                    Some(text) => text.into_bytes(),
                    None if batch => bail!("write in batch mode needs inline content"),
                    None => {
                        let mut buf = Vec::new();
                        io::stdin().read_to_end(&mut buf)?;
                        buf
                    }
                };
                self.vfs.write_file(&self.resolve(&path), &data).await?;
            }
            Command::Cat { path } => {
                let data = self.vfs.read_file(&self.resolve(&path)).await?;
                out.write_all(&data)?;
                if !data.ends_with(b"\n") {
                    writeln!(out)?;
                }
            }
            Command::Ls { path, json } => {
                let target = self.resolve(path.as_deref().unwrap_or(""));
                let entries = self.vfs.list_directory(&target).await?;
                if json {
                    writeln!(out, "{}", serde_json::to_string_pretty(&entries)?)?;
                } else {
                    for entry in entries {
                        let suffix = if entry.kind == NodeKind::Directory { "/" } else { "" };
                        let marker = if entry.mounted { " @" } else { "" };
                        writeln!(out, "{:<10} {}{}{}", entry.kind, entry.name, suffix, marker)?;
                    }
                }
            }
            Command::Tree { json } => {
                let tree = self.vfs.get_tree().await?;
                if json {
                    writeln!(out, "{}", serde_json::to_string_pretty(&tree)?)?;
                } else {
                    write!(out, "{}", tree.render())?;
                }
            }
            Command::Stat { path } => {
                let stat = self.vfs.stat(&self.resolve(&path)).await?;
                writeln!(out, "path:     {}", stat.path)?;
                writeln!(out, "kind:     {}", stat.kind)?;
                writeln!(out, "size:     {}", stat.size)?;
                if let Some(location) = stat.location {
                    writeln!(out, "location: {}", location)?;
                }
                if let Some(modified) = stat.modified_at {
                    writeln!(out, "modified: {}", modified.to_rfc3339())?;
                }
            }
            Command::Rm { path } => {
                self.vfs.remove(&self.resolve(&path)).await?;
            }
            Command::Mount { path, backend, root } => {
                let target = Location::new(backend, root.unwrap_or(NodeId::ROOT));
                let location = self.vfs.create_mount(&self.resolve(&path), target).await?;
                writeln!(out, "{}", location)?;
            }
            Command::Mounts => {
                for mount in self.vfs.mounts().iter() {
                    writeln!(out, "{:<16} {}", mount.path, mount.root)?;
                }
            }
            Command::Request => {
                if batch {
                    bail!("use `request <json>` inside batch mode");
                }
                let mut text = String::new();
                io::stdin().read_to_string(&mut text)?;
                self.request(&text, out).await?;
            }
            Command::Batch => bail!("batch mode cannot be nested"),
        }
        Ok(())
    }

    async fn request(&self, text: &str, out: &mut impl Write) -> Result<()> {
        let request: StorageRequest =
            serde_json::from_str(text).context("malformed storage request")?;
        let response = self.vfs.gateway().handle(request).await;
        writeln!(out, "{}", serde_json::to_string(&response)?)?;
        Ok(())
    }

    /// 逐行执行，单行失败不影响后续命令
    async fn batch(&self, out: &mut impl Write) -> Result<()> {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let outcome = match line.strip_prefix("request ") {
                Some(json) => self.request(json, out).await,
                None => match parse_batch_line(line) {
                    Ok(command) => self.run(command, true, out).await,
                    Err(e) => Err(e),
                },
            };
            if let Err(e) = outcome {
                writeln!(out, "error: {}: {:#}", line, e)?;
            }
            out.flush()?;
        }
        Ok(())
    }
}

fn load_config(args: &Args) -> Result<VfsConfig> {
    let mut config = match &args.config {
        Some(path) => VfsConfig::load(path)
            .with_context(|| format!("failed to load config from {:?}", path))?,
        None => VfsConfig::default(),
    };
    config.apply_env()?;
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = match args.verbose {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let config = load_config(&args)?;
    let user = args.user.clone().unwrap_or_else(whoami::username);
    info!("初始化虚拟文件系统，会话={}, 用户={}", config.session_id, user);

    let gateway = Arc::new(StorageGateway::new(config.build_registry()));
    let shell = Shell {
        vfs: VirtualFileSystem::new(gateway, config.mount_table()?),
        cwd: path::absolute(&args.cwd),
        home: format!("/home/{}", user),
    };

    let stdout = io::stdout();
    let mut out = stdout.lock();
    match args.command {
        Command::Batch => shell.batch(&mut out).await?,
        command => shell.run(command, false, &mut out).await?,
    }
    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_line_keeps_quoted_content() {
        match parse_batch_line(r#"write /notes/a.txt "hello world""#).unwrap() {
            Command::Write { path, content } => {
                assert_eq!(path, "/notes/a.txt");
                assert_eq!(content.as_deref(), Some("hello world"));
            }
            other => panic!("unexpected command: {:?}", other),
        }

        match parse_batch_line("mount '/my dir' session").unwrap() {
            Command::Mount { path, backend, root } => {
                assert_eq!(path, "/my dir");
                assert_eq!(backend, BackendKind::Session);
                assert!(root.is_none());
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_batch_line_errors() {
        assert!(parse_batch_line(r#"write /f "hello"#).is_err());
        assert!(parse_batch_line("write /f hello world").is_err());
        assert!(parse_batch_line("frobnicate /f").is_err());
    }
}
