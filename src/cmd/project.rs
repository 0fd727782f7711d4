//! Project initialization command.

use anyhow::Result;

pub fn cmd_init(project_dir: &std::path::Path) -> Result<()> {
    use weave::config::Config;
    use weave::init::init_project;

    let was_initialized = Config::is_initialized(project_dir);

    let result = init_project(project_dir)?;

    if result.created {
        println!(
            "Initialized weave project at {}",
            result.weave_dir.display()
        );
        println!();
        println!("Created directory structure:");
        println!("  .weave/");
        println!("  ├── weave.toml     # Configuration");
        println!("  ├── context/       # Assembled context artifacts");
        println!("  ├── worktrees/     # One git worktree per task");
        println!("  ├── certificates/  # Completion certificates");
        println!("  └── logs/          # Rolling log files");
        println!();
        println!("Next steps:");
        println!("  1. Put role instructions in .github/agents/<role>.agent.md");
        println!("  2. Run `weave issue create \"<title>\"` to record a task");
        println!("  3. Run `weave spawn <task-id>` to start work on it");
    } else if was_initialized {
        println!(
            "Weave project already initialized at {}",
            result.weave_dir.display()
        );
        println!("Directory structure verified.");
    } else {
        println!(
            "Completed weave initialization at {}",
            result.weave_dir.display()
        );
    }
    if !result.wrote_config {
        println!("Kept existing weave.toml.");
    }

    Ok(())
}
