use super::{colorize_status, json_pretty, resolve_env, OutputMode, EXIT_SUCCESS};
use stackgate_core::{Engine, StoreLock};
use stackgate_schema::{parse_environments_file, Environment, EnvironmentId, EnvironmentSummary};
use std::path::Path;

pub struct AddRequest {
    pub id: Option<u64>,
    pub name: String,
    pub repo: String,
    pub branch: String,
    pub path: String,
    pub vars: Vec<(String, String)>,
    pub auto_apply: bool,
}

fn store_lock(engine: &Engine) -> Result<Option<StoreLock>, String> {
    engine
        .layout()
        .map(|layout| StoreLock::acquire(&layout.lock_file()))
        .transpose()
        .map_err(|e| format!("store lock: {e}"))
}

pub fn add(engine: &Engine, req: AddRequest, mode: OutputMode) -> Result<u8, String> {
    let _lock = store_lock(engine)?;
    let id = match req.id {
        Some(id) => EnvironmentId::new(id),
        None => engine.next_id().map_err(|e| e.to_string())?,
    };
    let mut env = Environment::new(id, req.name, req.repo)
        .with_branch(req.branch)
        .with_path(req.path)
        .with_auto_apply(req.auto_apply);
    for (key, value) in req.vars {
        env = env.with_variable(key, value);
    }
    engine.register(&env).map_err(|e| e.to_string())?;

    if mode.json {
        println!("{}", json_pretty(&EnvironmentSummary::from(&env))?);
    } else {
        println!("registered environment '{}' (id {})", env.name, env.id);
    }
    Ok(EXIT_SUCCESS)
}

pub fn import(engine: &Engine, file: &Path, mode: OutputMode) -> Result<u8, String> {
    let envs = parse_environments_file(file).map_err(|e| format!("schema error: {e}"))?;
    let _lock = store_lock(engine)?;
    let count = engine.import(&envs).map_err(|e| e.to_string())?;

    if mode.json {
        let payload: Vec<_> = envs.iter().map(EnvironmentSummary::from).collect();
        println!("{}", json_pretty(&payload)?);
    } else {
        println!("imported {count} environment(s) from {}", file.display());
    }
    Ok(EXIT_SUCCESS)
}

pub fn list(engine: &Engine, mode: OutputMode) -> Result<u8, String> {
    let envs = engine.list().map_err(|e| e.to_string())?;
    if mode.json {
        let payload: Vec<_> = envs.iter().map(EnvironmentSummary::from).collect();
        println!("{}", json_pretty(&payload)?);
    } else if envs.is_empty() {
        println!("no environments found");
    } else {
        println!("{:<6} {:<16} {:<8} {:<20} REPO", "ID", "NAME", "CHANGES", "LATEST");
        for env in &envs {
            let latest = env
                .changes
                .latest()
                .map_or_else(|| "-".to_owned(), |c| colorize_status(c.status));
            println!(
                "{:<6} {:<16} {:<8} {:<20} {}",
                env.id,
                env.name,
                env.changes.len(),
                latest,
                env.repo
            );
        }
    }
    Ok(EXIT_SUCCESS)
}

pub fn show(engine: &Engine, input: &str, mode: OutputMode) -> Result<u8, String> {
    let id = resolve_env(engine, input)?;
    let env = engine.get(id).map_err(|e| e.to_string())?;
    if mode.json {
        println!("{}", json_pretty(&env)?);
        return Ok(EXIT_SUCCESS);
    }

    println!("id:          {}", env.id);
    println!("name:        {}", env.name);
    println!("repo:        {}", env.repo);
    println!("branch:      {}", env.branch);
    println!(
        "path:        {}",
        if env.path.is_empty() { "." } else { env.path.as_str() }
    );
    println!("auto_apply:  {}", env.auto_apply);
    for (key, value) in &env.variables {
        println!("var:         {key}={value}");
    }
    if env.changes.is_empty() {
        println!("changes:     (none)");
    } else {
        println!("changes:");
        for change in env.changes.iter().rev() {
            println!(
                "  {:<4} {:<12} {:<20} {}",
                change.id,
                change.revision,
                colorize_status(change.status),
                change.updated_at
            );
        }
    }
    Ok(EXIT_SUCCESS)
}
