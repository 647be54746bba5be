#![forbid(unsafe_code)]

use std::env;
use std::io::{self, IsTerminal, Read};
use std::time::{SystemTime, UNIX_EPOCH};

use signup_contracts::MonotonicTimeNs;
use signup_storage::{data_dir_from_env, StorePaths};
use signup_tools::admin_cli::{execute_admin_command, execute_status_command, ADMIN_USAGE};

const USAGE: &str = "usage: signup <admin|status> ...";

fn main() {
    if let Err(err) = run() {
        eprintln!("{err}");
        std::process::exit(2);
    }
}

fn run() -> Result<(), String> {
    let args: Vec<String> = env::args().skip(1).collect();
    let output = match args.first().map(String::as_str) {
        Some("admin") => run_admin(&args[1..])?,
        Some("status") => {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
                .unwrap_or(1);
            execute_status_command(&StorePaths::in_dir(data_dir_from_env()), MonotonicTimeNs(now))?
        }
        _ => return Err(USAGE.to_string()),
    };
    if !output.is_empty() {
        println!("{output}");
    }
    Ok(())
}

fn run_admin(args: &[String]) -> Result<String, String> {
    let subcommand = args
        .first()
        .ok_or_else(|| ADMIN_USAGE.to_string())?
        .as_str();
    let value = match subcommand {
        "set-password" => Some(read_secret_value("New admin password (printable ASCII):")?),
        _ => args.get(1).cloned(),
    };
    execute_admin_command(
        &StorePaths::in_dir(data_dir_from_env()),
        subcommand,
        value.as_deref(),
    )
}

fn read_secret_value(prompt: &str) -> Result<String, String> {
    if io::stdin().is_terminal() {
        let value = rpassword::prompt_password(prompt).map_err(|e| e.to_string())?;
        if value.trim().is_empty() {
            return Err("secret value must not be empty".to_string());
        }
        Ok(value)
    } else {
        let mut input = String::new();
        io::stdin()
            .read_to_string(&mut input)
            .map_err(|e| e.to_string())?;
        let trimmed = input.trim().to_string();
        if trimmed.is_empty() {
            return Err("secret value must not be empty".to_string());
        }
        Ok(trimmed)
    }
}
