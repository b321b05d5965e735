use anyhow::{bail, Context};
use sshdeck::ssh::TransportSession;
use sshdeck::state::AppContext;
use sshdeck::transfer::TransferEngine;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sshdeck=info,warn".into()),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        print_usage();
        return Ok(());
    };

    let ctx = AppContext::new().context("failed to initialize sshdeck")?;

    let result = match command.as_str() {
        "profiles" => cmd_profiles(&ctx),
        "sessions" => cmd_sessions(&ctx),
        "run" => cmd_run(&ctx, &args[1..]),
        "push" => cmd_push(&ctx, &args[1..]),
        "pull" => cmd_pull(&ctx, &args[1..]),
        "push-dir" => cmd_push_dir(&ctx, &args[1..]),
        "pull-dir" => cmd_pull_dir(&ctx, &args[1..]),
        "ls" => cmd_ls(&ctx, &args[1..]),
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            print_usage();
            bail!("unknown command: {}", other)
        }
    };

    // No dangling transports on the way out, whatever happened above.
    ctx.sessions.disconnect_all();
    result
}

fn print_usage() {
    println!("sshdeck {} - SSH manager for personal devices", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Usage: sshdeck <command> [args]");
    println!();
    println!("Commands:");
    println!("  profiles                              List configured device profiles");
    println!("  sessions                              List live sessions");
    println!("  run <profile> <command...>            Run a command on a device");
    println!("  push [--no-verify] <profile> <local> <remote>   Upload a file");
    println!("  pull [--no-verify] <profile> <remote> <local>   Download a file");
    println!("  push-dir <profile> <local> <remote>   Upload a directory tree");
    println!("  pull-dir <profile> <remote> <local>   Download a directory tree");
    println!("  ls <profile> <remote-path>            List a remote directory");
}

/// Create and connect a session for a named profile.
fn open_session(ctx: &AppContext, profile: &str) -> anyhow::Result<Arc<TransportSession>> {
    let id = ctx.sessions.create(profile, None)?;
    let timeout = Duration::from_secs(ctx.settings.connect_timeout_secs);
    let session = ctx.sessions.connect(&id, timeout)?;
    Ok(session)
}

fn cmd_profiles(ctx: &AppContext) -> anyhow::Result<()> {
    let profiles = ctx.profiles.read().list();
    if profiles.is_empty() {
        println!("No profiles configured. Add devices to devices.toml in the config directory.");
        return Ok(());
    }
    for profile in profiles {
        println!(
            "{:<16} {}@{}:{}",
            profile.name, profile.username, profile.hostname, profile.port
        );
    }
    Ok(())
}

fn cmd_sessions(ctx: &AppContext) -> anyhow::Result<()> {
    let sessions = ctx.sessions.list();
    if sessions.is_empty() {
        println!("No live sessions.");
        return Ok(());
    }
    for info in sessions {
        println!(
            "{:<12} {}@{}  connected={} alive={} cwd={}",
            info.id, info.username, info.hostname, info.connected, info.alive, info.working_directory
        );
    }
    Ok(())
}

fn cmd_run(ctx: &AppContext, args: &[String]) -> anyhow::Result<()> {
    let Some((profile, rest)) = args.split_first() else {
        bail!("usage: sshdeck run <profile> <command...>");
    };
    if rest.is_empty() {
        bail!("usage: sshdeck run <profile> <command...>");
    }
    let command = rest.join(" ");

    let session = open_session(ctx, profile)?;
    let timeout = Duration::from_secs(ctx.settings.command_timeout_secs);
    let output = session.execute_command(&command, Some(timeout))?;

    print!("{}", output.stdout);
    eprint!("{}", output.stderr);
    if output.exit_code != 0 {
        bail!("remote command exited with status {}", output.exit_code);
    }
    Ok(())
}

/// Split off a leading `--no-verify` flag.
fn verify_flag(args: &[String]) -> (bool, &[String]) {
    match args.first().map(String::as_str) {
        Some("--no-verify") => (false, &args[1..]),
        _ => (true, args),
    }
}

fn cmd_push(ctx: &AppContext, args: &[String]) -> anyhow::Result<()> {
    let (verify, args) = verify_flag(args);
    let [profile, local, remote] = args else {
        bail!("usage: sshdeck push [--no-verify] <profile> <local> <remote>");
    };

    let session = open_session(ctx, profile)?;
    let engine = TransferEngine::new(&session);
    let result = engine.upload(Path::new(local), remote, verify);

    if !result.success {
        bail!(
            "upload failed: {}",
            result.error.unwrap_or_else(|| "unknown error".to_string())
        );
    }
    println!(
        "Uploaded {} ({} bytes{})",
        result.remote_path,
        result.size_bytes,
        result
            .checksum
            .map(|sum| format!(", sha256 {}", sum))
            .unwrap_or_default()
    );
    Ok(())
}

fn cmd_pull(ctx: &AppContext, args: &[String]) -> anyhow::Result<()> {
    let (verify, args) = verify_flag(args);
    let [profile, remote, local] = args else {
        bail!("usage: sshdeck pull [--no-verify] <profile> <remote> <local>");
    };

    let session = open_session(ctx, profile)?;
    let engine = TransferEngine::new(&session);
    let result = engine.download(remote, Path::new(local), verify);

    if !result.success {
        bail!(
            "download failed: {}",
            result.error.unwrap_or_else(|| "unknown error".to_string())
        );
    }
    println!(
        "Downloaded {} ({} bytes{})",
        result.local_path,
        result.size_bytes,
        result
            .checksum
            .map(|sum| format!(", sha256 {}", sum))
            .unwrap_or_default()
    );
    Ok(())
}

fn cmd_push_dir(ctx: &AppContext, args: &[String]) -> anyhow::Result<()> {
    let [profile, local, remote] = args else {
        bail!("usage: sshdeck push-dir <profile> <local> <remote>");
    };

    let session = open_session(ctx, profile)?;
    let engine = TransferEngine::new(&session);
    let report = engine.upload_directory(Path::new(local), remote)?;
    print_dir_report(report.files_transferred, report.files_failed, &report.failed_files);
    Ok(())
}

fn cmd_pull_dir(ctx: &AppContext, args: &[String]) -> anyhow::Result<()> {
    let [profile, remote, local] = args else {
        bail!("usage: sshdeck pull-dir <profile> <remote> <local>");
    };

    let session = open_session(ctx, profile)?;
    let engine = TransferEngine::new(&session);
    let report = engine.download_directory(remote, Path::new(local))?;
    print_dir_report(report.files_transferred, report.files_failed, &report.failed_files);
    Ok(())
}

fn print_dir_report(transferred: usize, failed: usize, failures: &[(String, String)]) {
    println!("{} file(s) transferred, {} failed", transferred, failed);
    for (path, error) in failures {
        eprintln!("  {}: {}", path, error);
    }
}

fn cmd_ls(ctx: &AppContext, args: &[String]) -> anyhow::Result<()> {
    let [profile, remote] = args else {
        bail!("usage: sshdeck ls <profile> <remote-path>");
    };

    let session = open_session(ctx, profile)?;
    let engine = TransferEngine::new(&session);
    for entry in engine.list_remote_directory(remote)? {
        println!("{} {:>12}  {}", entry.mode, entry.size, entry.name);
    }
    Ok(())
}
