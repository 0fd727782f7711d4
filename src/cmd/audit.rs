//! Audit log commands: `weave audit verify|show`.

use anyhow::Result;
use console::style;

use weave::audit::AuditLog;
use weave::config::Config;

use super::super::AuditCommands;

pub fn cmd_audit(config: &Config, command: &AuditCommands) -> Result<()> {
    let audit = AuditLog::new(&config.audit_file, &config.audit_lock);

    match command {
        AuditCommands::Verify => match audit.verify()? {
            None => {
                let entries = audit.head()?.map(|e| e.seq).unwrap_or(0);
                println!(
                    "{} audit chain intact ({} entries)",
                    style("✓").green(),
                    entries
                );
            }
            Some(seq) => {
                anyhow::bail!("Audit chain broken at entry {}", seq);
            }
        },
        AuditCommands::Show { task, limit } => {
            let entries = audit.tail(*limit, task.as_deref())?;
            if entries.is_empty() {
                println!("No audit entries.");
                return Ok(());
            }
            for entry in &entries {
                println!(
                    "{:>5} {} {:<8} {:<18} {:<10} {}",
                    entry.seq,
                    entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    entry.actor,
                    style(entry.action.as_str()).cyan().to_string(),
                    entry.task_id.as_deref().unwrap_or("-"),
                    entry.result
                );
            }
        }
    }
    Ok(())
}
