//! Line-oriented admin console for the daemon binary.
//!
//! Each stdin line is one command. Server names containing spaces can be
//! quoted: `start "My Spigot Server"`.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::process::{format_uptime, ServerProcess};
use crate::registry::{ServerRegistry, ServerType};

const DEFAULT_CONSOLE_LINES: usize = 20;

pub const HELP: &str = "\
commands:
  list                              all servers and their status
  status <name>                     status, pid, uptime, players, backup progress
  start <name> | stop <name>
  cmd <name> <command...>           send a console command
  console <name> [lines]            last console lines (default 20)
  players <name>
  backup <name> | backups <name>
  restore <name> <backup>           replaces the data directory
  props <name>                      server.properties
  setprop <name> <key> <value...>   change an existing property
  create <name> <type> [version]    type: spigot, forge, neoforge, fabric
  delete <name>
  quit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminCommand {
    Help,
    Quit,
    List,
    Status(String),
    Start(String),
    Stop(String),
    Cmd(String, String),
    Console(String, usize),
    Players(String),
    Backup(String),
    Backups(String),
    Restore(String, String),
    Props(String),
    SetProp(String, String, String),
    Create(String, ServerType, Option<String>),
    Delete(String),
}

/// Whitespace split with double-quoted segments kept together.
fn split_args(line: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut has_token = false;

    for c in line.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                has_token = true;
            }
            c if c.is_whitespace() && !quoted => {
                if has_token {
                    args.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            c => {
                current.push(c);
                has_token = true;
            }
        }
    }
    if has_token {
        args.push(current);
    }
    args
}

pub fn parse_command(line: &str) -> Result<AdminCommand, String> {
    let args = split_args(line);
    let Some((verb, rest)) = args.split_first() else {
        return Err("empty command".to_string());
    };

    let name = |idx: usize| -> Result<String, String> {
        rest.get(idx).cloned().ok_or_else(|| format!("usage: {} <name> ...", verb))
    };

    let cmd = match verb.to_ascii_lowercase().as_str() {
        "help" | "?" => AdminCommand::Help,
        "quit" | "exit" => AdminCommand::Quit,
        "list" | "ls" => AdminCommand::List,
        "status" => AdminCommand::Status(name(0)?),
        "start" => AdminCommand::Start(name(0)?),
        "stop" => AdminCommand::Stop(name(0)?),
        "cmd" => {
            if rest.len() < 2 {
                return Err("usage: cmd <name> <command...>".to_string());
            }
            AdminCommand::Cmd(rest[0].clone(), rest[1..].join(" "))
        }
        "console" => {
            let lines = match rest.get(1) {
                Some(n) => n.parse().map_err(|_| format!("not a line count: {}", n))?,
                None => DEFAULT_CONSOLE_LINES,
            };
            AdminCommand::Console(name(0)?, lines)
        }
        "players" => AdminCommand::Players(name(0)?),
        "backup" => AdminCommand::Backup(name(0)?),
        "backups" => AdminCommand::Backups(name(0)?),
        "restore" => AdminCommand::Restore(name(0)?, name(1)?),
        "props" => AdminCommand::Props(name(0)?),
        "setprop" => {
            if rest.len() < 2 {
                return Err("usage: setprop <name> <key> <value...>".to_string());
            }
            AdminCommand::SetProp(rest[0].clone(), rest[1].clone(), rest[2..].join(" "))
        }
        "create" => {
            let server_type = name(1)?.parse::<ServerType>()?;
            AdminCommand::Create(name(0)?, server_type, rest.get(2).cloned())
        }
        "delete" | "rm" => AdminCommand::Delete(name(0)?),
        other => return Err(format!("unknown command '{}' (try 'help')", other)),
    };
    Ok(cmd)
}

fn lookup(registry: &ServerRegistry, name: &str) -> Result<Arc<ServerProcess>, String> {
    registry
        .get_by_name(name)
        .ok_or_else(|| format!("server '{}' not found", name))
}

/// Run one command and render its reply. `Quit` is handled by the caller.
pub async fn execute(registry: &Arc<ServerRegistry>, cmd: AdminCommand) -> Result<String, String> {
    match cmd {
        AdminCommand::Help | AdminCommand::Quit => Ok(HELP.to_string()),
        AdminCommand::List => {
            let mut out = Vec::new();
            for process in registry.list() {
                out.push(format!(
                    "{:<24} {:<9} {}",
                    process.name(),
                    process.status(),
                    process.definition().server_type
                ));
            }
            for name in registry.provisioning() {
                out.push(format!("{:<24} CREATING", name));
            }
            if out.is_empty() {
                return Ok("no servers".to_string());
            }
            Ok(out.join("\n"))
        }
        AdminCommand::Status(name) => {
            let status = registry
                .status(&name)
                .ok_or_else(|| format!("server '{}' not found", name))?;
            let Some(process) = registry.get_by_name(&name) else {
                return Ok(format!("{}: {}", name, status));
            };
            let (backing_up, percent) = process.backup_progress();
            let mut out = vec![format!("{}: {}", name, status)];
            if let Some(pid) = process.pid() {
                out.push(format!("  pid      {}", pid));
            }
            if let Some(uptime) = process.uptime() {
                out.push(format!("  uptime   {}", format_uptime(uptime)));
            }
            out.push(format!("  players  {}", process.players().join(", ")));
            if backing_up {
                out.push(format!("  backup   {}%", percent));
            }
            Ok(out.join("\n"))
        }
        AdminCommand::Start(name) => {
            let process = lookup(registry, &name)?;
            match process.start().await {
                Ok(true) => Ok(format!("'{}' starting", name)),
                Ok(false) => Ok(format!("'{}' is already running", name)),
                Err(e) => Err(format!("[{}] {}", e.error_code(), e)),
            }
        }
        AdminCommand::Stop(name) => {
            if lookup(registry, &name)?.stop() {
                Ok(format!("stop sent to '{}'", name))
            } else {
                Err(format!("'{}' is not running", name))
            }
        }
        AdminCommand::Cmd(name, command) => {
            lookup(registry, &name)?
                .run_command(&command)
                .map_err(|e| format!("[{}] {}", e.error_code(), e))?;
            Ok(format!("sent to '{}'", name))
        }
        AdminCommand::Console(name, lines) => {
            let console = lookup(registry, &name)?.console();
            let from = console.len().saturating_sub(lines);
            Ok(console[from..].join("\n"))
        }
        AdminCommand::Players(name) => {
            let players = lookup(registry, &name)?.players();
            Ok(format!("{} online: {}", players.len(), players.join(", ")))
        }
        AdminCommand::Backup(name) => {
            let process = lookup(registry, &name)?;
            process
                .start_backup()
                .map_err(|e| format!("[{}] {}", e.error_code(), e))?;
            Ok(format!("backup of '{}' started", name))
        }
        AdminCommand::Backups(name) => {
            let backups = lookup(registry, &name)?
                .list_backups()
                .map_err(|e| format!("[{}] {}", e.error_code(), e))?;
            if backups.is_empty() {
                return Ok("no backups".to_string());
            }
            Ok(backups.join("\n"))
        }
        AdminCommand::Restore(name, backup) => {
            let process = lookup(registry, &name)?;
            if process.is_running() {
                return Err(format!("stop '{}' before restoring", name));
            }
            process
                .restore(&backup)
                .await
                .map_err(|e| format!("[{}] {}", e.error_code(), e))?;
            Ok(format!("'{}' restored from {}", name, backup))
        }
        AdminCommand::Props(name) => {
            let props = lookup(registry, &name)?
                .properties()
                .map_err(|e| format!("[{}] {}", e.error_code(), e))?;
            Ok(props
                .iter()
                .map(|(key, value)| format!("{}={}", key, value))
                .collect::<Vec<_>>()
                .join("\n"))
        }
        AdminCommand::SetProp(name, key, value) => {
            let changed = lookup(registry, &name)?
                .set_properties(&BTreeMap::from([(key.clone(), value)]))
                .map_err(|e| format!("[{}] {}", e.error_code(), e))?;
            if changed == 0 {
                return Err(format!("'{}' not changed (unknown, hidden or same value)", key));
            }
            Ok(format!("'{}' updated; restart '{}' to apply", key, name))
        }
        AdminCommand::Create(name, server_type, version) => {
            registry
                .create(&name, server_type, version)
                .map_err(|e| format!("[{}] {}", e.error_code(), e))?;
            Ok(format!("creating '{}'", name))
        }
        AdminCommand::Delete(name) => {
            registry
                .delete(&name)
                .map_err(|e| format!("[{}] {}", e.error_code(), e))?;
            Ok(format!("deleting '{}'", name))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_args_with_quotes() {
        assert_eq!(split_args("start survival"), vec!["start", "survival"]);
        assert_eq!(
            split_args("start \"My Spigot Server\"  "),
            vec!["start", "My Spigot Server"]
        );
        assert_eq!(split_args("cmd x \"\""), vec!["cmd", "x", ""]);
        assert!(split_args("   ").is_empty());
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(parse_command("list").unwrap(), AdminCommand::List);
        assert_eq!(
            parse_command("cmd survival say hello world").unwrap(),
            AdminCommand::Cmd("survival".into(), "say hello world".into())
        );
        assert_eq!(
            parse_command("console survival").unwrap(),
            AdminCommand::Console("survival".into(), DEFAULT_CONSOLE_LINES)
        );
        assert_eq!(
            parse_command("create modded neoforge 1.21").unwrap(),
            AdminCommand::Create("modded".into(), ServerType::Neoforge, Some("1.21".into()))
        );
        assert_eq!(
            parse_command("restore survival 1-2-2024_10-45").unwrap(),
            AdminCommand::Restore("survival".into(), "1-2-2024_10-45".into())
        );
        assert_eq!(
            parse_command("setprop survival motd Welcome back").unwrap(),
            AdminCommand::SetProp("survival".into(), "motd".into(), "Welcome back".into())
        );
        assert_eq!(
            parse_command("setprop survival level-seed").unwrap(),
            AdminCommand::SetProp("survival".into(), "level-seed".into(), String::new())
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_command("").is_err());
        assert!(parse_command("start").is_err());
        assert!(parse_command("cmd survival").is_err());
        assert!(parse_command("setprop survival").is_err());
        assert!(parse_command("create x vanilla").is_err());
        assert!(parse_command("console survival lots").is_err());
        assert!(parse_command("frobnicate").is_err());
    }
}
