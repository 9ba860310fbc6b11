//! CLI command implementations

use anyhow::{Context, Result};
use cm_core::{
    CreateOptions, Environment, EnvironmentManager, EnvironmentStatus, LinkOptions, ListOptions,
};
use std::io::Write;

pub async fn create(manager: &EnvironmentManager, opts: CreateOptions) -> Result<()> {
    let no_start = opts.no_start;
    let env = manager.create(opts).await?;

    println!("Created environment '{}' ({})", env.name, env.id);
    if !no_start {
        if let Some(ref network) = env.network_name {
            println!("  network:   {}", network);
        }
        if !env.ports.is_empty() {
            let ports: Vec<_> = env.ports.values().map(u16::to_string).collect();
            println!("  ports:     {}", ports.join(", "));
        }
        println!("\nUse 'cm env shell {}' to open a shell.", env.name);
    }
    Ok(())
}

pub async fn start(manager: &EnvironmentManager, name: &str) -> Result<()> {
    manager.start(name).await?;
    println!("Started '{}'", name);
    Ok(())
}

pub async fn stop(manager: &EnvironmentManager, name: &str, timeout: Option<u32>) -> Result<()> {
    manager.stop(name, timeout).await?;
    println!("Stopped '{}'", name);
    Ok(())
}

pub async fn restart(manager: &EnvironmentManager, name: &str) -> Result<()> {
    manager.restart(name).await?;
    println!("Restarted '{}'", name);
    Ok(())
}

pub async fn delete(manager: &EnvironmentManager, name: &str, force: bool) -> Result<()> {
    let leaked = manager.delete(name, force).await?;
    println!("Deleted '{}'", name);
    if let Some(network) = leaked {
        eprintln!(
            "Network '{}' is still in use and was left behind; run 'cm env prune' once it is free.",
            network
        );
    }
    Ok(())
}

/// List environments
pub async fn list(manager: &EnvironmentManager, opts: &ListOptions) -> Result<()> {
    let envs = manager.list(opts).await?;

    if envs.is_empty() {
        println!("No environments found.");
        println!("\nUse 'cm env create <name>' in a project directory to add one.");
        return Ok(());
    }

    let active = manager.store().get_active().ok().flatten();

    // Column widths
    const NAME_WIDTH: usize = 20;
    const STATUS_WIDTH: usize = 10;
    const CONTAINER_WIDTH: usize = 14;

    println!(
        "  {:<NAME_WIDTH$} {:<STATUS_WIDTH$} {:<CONTAINER_WIDTH$} PROJECT",
        "NAME", "STATUS", "CONTAINER"
    );
    println!("{}", "-".repeat(75));

    for env in envs {
        let marker = if active.as_deref() == Some(env.id.as_str()) {
            "*"
        } else {
            " "
        };
        let project = env
            .project_dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| env.project_dir.to_string_lossy().to_string());

        println!(
            "{} {:<NAME_WIDTH$} {:<STATUS_WIDTH$} {:<CONTAINER_WIDTH$} {}",
            marker,
            env.name,
            status_label(env.status),
            env.short_container_id(),
            project
        );
    }

    Ok(())
}

fn status_label(status: EnvironmentStatus) -> String {
    let symbol = match status {
        EnvironmentStatus::Running => "●",
        EnvironmentStatus::Stopped => "○",
        EnvironmentStatus::Creating => "◐",
        EnvironmentStatus::Paused => "◑",
        EnvironmentStatus::Error => "✗",
        EnvironmentStatus::Orphaned => "?",
    };
    format!("{} {}", symbol, status)
}

pub async fn switch(manager: &EnvironmentManager, name: &str) -> Result<()> {
    let env = manager.switch(name).await?;
    println!("Switched to '{}'", env.name);
    Ok(())
}

pub async fn active(manager: &EnvironmentManager) -> Result<()> {
    let env = manager.get_active().await?;
    print_details(&env);
    Ok(())
}

fn print_details(env: &Environment) {
    println!("Name:       {}", env.name);
    println!("ID:         {}", env.id);
    println!("Status:     {}", env.status);
    if let Some(ref msg) = env.status_msg {
        println!("Message:    {}", msg);
    }
    println!("Project:    {}", env.project_dir.display());
    if let Some(ref container) = env.container_name {
        println!("Container:  {} ({})", container, env.short_container_id());
    }
    if let Some(ref network) = env.network_name {
        println!("Network:    {}", network);
    }
    if !env.linked_envs.is_empty() {
        let links: Vec<_> = env.linked_envs.iter().map(String::as_str).collect();
        println!("Linked:     {}", links.join(", "));
    }
}

pub async fn link(
    manager: &EnvironmentManager,
    env1: &str,
    env2: &str,
    bidirectional: bool,
) -> Result<()> {
    manager
        .link(env1, env2, LinkOptions { bidirectional })
        .await?;
    let arrow = if bidirectional { "<->" } else { "->" };
    println!("Linked {} {} {}", env1, arrow, env2);
    Ok(())
}

pub async fn unlink(manager: &EnvironmentManager, env1: &str, env2: &str) -> Result<()> {
    manager.unlink(env1, env2).await?;
    println!("Unlinked {} and {}", env1, env2);
    Ok(())
}

/// Open an interactive shell through the runtime CLI
pub async fn shell(
    manager: &EnvironmentManager,
    name: Option<&str>,
    shell: Option<&str>,
) -> Result<()> {
    let name = match name {
        Some(name) => name.to_string(),
        None => manager.get_active().await?.id,
    };
    let target = manager.shell(&name, shell).await?;

    let status = std::process::Command::new(&target.program)
        .args(target.args())
        .status()
        .with_context(|| format!("Failed to spawn {}", target.program))?;

    if !status.success() {
        std::process::exit(status.code().unwrap_or(1));
    }
    Ok(())
}

/// Run a command in a container
pub async fn exec(manager: &EnvironmentManager, name: &str, cmd: Vec<String>) -> Result<()> {
    let result = manager.exec(name, cmd).await?;

    let mut stdout = std::io::stdout();
    stdout.write_all(result.output.as_bytes())?;
    stdout.flush()?;

    if result.exit_code != 0 {
        std::process::exit(result.exit_code as i32);
    }
    Ok(())
}

pub async fn prune(manager: &EnvironmentManager, all: bool) -> Result<()> {
    let removed = manager.prune(all).await?;
    match removed {
        0 => println!("Nothing to prune."),
        1 => println!("Pruned 1 environment."),
        n => println!("Pruned {} environments.", n),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_label() {
        assert_eq!(status_label(EnvironmentStatus::Running), "● running");
        assert_eq!(status_label(EnvironmentStatus::Orphaned), "? orphaned");
    }
}
