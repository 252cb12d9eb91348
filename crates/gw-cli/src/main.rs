use anyhow::Context;
use clap::{Parser, Subcommand};
use gw_alloc::AllocatorRegistry;
use gw_core::{ClusterState, GatewayConfig, PolicyStore, PolicyValidator, TableFamily};
use gw_metrics::{MetricsCollector, MetricsServer};
use gw_nft::{compile_table, plan, InstalledState, NftManager, TableProgram};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "gwarden")]
#[command(version, about = "Multi-cluster gateway control plane", long_about = None)]
struct Cli {
    /// Gateway configuration file
    #[arg(short, long, global = true, default_value = "gateway.yaml")]
    config: PathBuf,

    /// Cluster state file (overrides statePath from the configuration)
    #[arg(long, global = true)]
    state: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Firewall policy management
    Policy {
        #[command(subcommand)]
        action: PolicyAction,
    },
    /// Mark and address allocation
    Alloc {
        #[command(subcommand)]
        action: AllocAction,
    },
    /// Metrics server
    Metrics {
        #[command(subcommand)]
        action: MetricsAction,
    },
}

#[derive(Subcommand)]
enum PolicyAction {
    /// Validate every firewall configuration
    Check {
        #[arg(short, long, default_value = "policies.yaml")]
        file: PathBuf,
    },
    /// Compile tables and print their expressions
    Compile {
        #[arg(short, long, default_value = "policies.yaml")]
        file: PathBuf,
        #[arg(long)]
        table: Option<String>,
        /// Print the nftables JSON payload instead
        #[arg(long)]
        json: bool,
    },
    /// Show the rendered difference against the installed tables
    Diff {
        #[arg(short, long, default_value = "policies.yaml")]
        file: PathBuf,
        #[arg(long)]
        table: Option<String>,
        #[arg(long)]
        installed: Option<PathBuf>,
    },
    /// Plan and apply tables to the kernel
    Apply {
        #[arg(short, long, default_value = "policies.yaml")]
        file: PathBuf,
        #[arg(long)]
        table: Option<String>,
        #[arg(long)]
        installed: Option<PathBuf>,
        #[arg(long)]
        commit: bool,
    },
    /// Delete a managed table
    Delete {
        #[arg(long)]
        table: String,
        #[arg(long, default_value = "inet")]
        family: TableFamily,
        #[arg(long)]
        installed: Option<PathBuf>,
    },
    /// List tables present in the kernel
    List,
}

#[derive(Subcommand)]
enum AllocAction {
    /// Allocate (or look up) the mark of an owner
    Mark {
        #[arg(long)]
        owner: String,
    },
    /// Release the mark of an owner
    ReleaseMark {
        #[arg(long)]
        owner: String,
    },
    /// Allocate (or look up) an address in a pool
    Address {
        #[arg(long)]
        pool: String,
        #[arg(long)]
        key: String,
    },
    /// Release an address reservation
    ReleaseAddress {
        #[arg(long)]
        pool: String,
        #[arg(long)]
        key: String,
    },
    /// Show marks and pool usage
    Status,
}

#[derive(Subcommand)]
enum MetricsAction {
    /// Start metrics server
    Serve {
        #[arg(long, default_value = "9138")]
        port: u16,
        /// Policies to validate and count on startup
        #[arg(short, long, default_value = "policies.yaml")]
        file: PathBuf,
        /// Apply the policies to the kernel before serving
        #[arg(long)]
        apply: bool,
    },
}

const DEFAULT_STATE_PATH: &str = "cluster-state.yaml";
const DEFAULT_INSTALLED_PATH: &str = "installed.json";

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    let state_path = cli
        .state
        .clone()
        .or_else(|| config.state_path.clone())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_PATH));

    match cli.command {
        Commands::Policy { action } => {
            tokio::runtime::Runtime::new()?
                .block_on(async { handle_policy_action(action, &config).await })?;
        }
        Commands::Alloc { action } => {
            tokio::runtime::Runtime::new()?
                .block_on(async { handle_alloc_action(action, &config, &state_path).await })?;
        }
        Commands::Metrics { action } => {
            tokio::runtime::Runtime::new()?
                .block_on(async { handle_metrics_action(action, &config, &state_path).await })?;
        }
    }

    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<GatewayConfig> {
    if path.exists() {
        return GatewayConfig::from_file(path);
    }
    info!(path = %path.display(), "No gateway configuration found, using defaults");
    Ok(GatewayConfig::default())
}

fn installed_path(flag: Option<PathBuf>, config: &GatewayConfig) -> PathBuf {
    flag.or_else(|| config.installed_path.clone())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_INSTALLED_PATH))
}

/// Load policies and refuse to continue if any of them is invalid.
fn load_valid_policies(file: &Path) -> anyhow::Result<PolicyStore> {
    let store = PolicyStore::from_file(file)?;
    let failures = PolicyValidator::new(&store.configurations).validate();

    if !failures.is_empty() {
        println!("\n❌ Validation failed:\n");
        for (name, err) in &failures {
            println!("  • {}: {}", name, err);
        }
        anyhow::bail!("{} configuration(s) failed validation", failures.len());
    }

    Ok(store)
}

fn compile_selected(store: &PolicyStore, table: Option<&str>) -> anyhow::Result<Vec<TableProgram>> {
    let programs = store
        .configurations
        .iter()
        .filter(|c| table.is_none_or(|t| c.table.name == t))
        .map(|c| {
            compile_table(&c.table).with_context(|| format!("Failed to compile configuration {}", c.name))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    if let Some(table) = table {
        if programs.is_empty() {
            anyhow::bail!("No configuration defines table {}", table);
        }
    }

    Ok(programs)
}

async fn handle_policy_action(action: PolicyAction, config: &GatewayConfig) -> anyhow::Result<()> {
    match action {
        PolicyAction::Check { file } => {
            println!("🔍 Validating {}...", file.display());
            let store = load_valid_policies(&file)?;
            println!(
                "✅ {} configuration(s) passed validation",
                store.configurations.len()
            );
        }
        PolicyAction::Compile { file, table, json } => {
            let store = load_valid_policies(&file)?;
            let programs = compile_selected(&store, table.as_deref())?;
            let nft_mgr = NftManager::new();

            for program in &programs {
                if json {
                    println!("{}", nft_mgr.render_program(program)?);
                    continue;
                }

                println!("table {} {}", program.family, program.name);
                for chain in &program.chains {
                    println!(
                        "  chain {} ({} hook {} priority {} policy {})",
                        chain.name,
                        chain.chain_type,
                        chain.hook,
                        chain.priority,
                        chain.policy.as_str()
                    );
                    for rule in &chain.rules {
                        println!("    rule {}", rule.id);
                        for expr in &rule.exprs {
                            println!("      {}", expr);
                        }
                    }
                }
            }
        }
        PolicyAction::Diff {
            file,
            table,
            installed,
        } => {
            let store = load_valid_policies(&file)?;
            let programs = compile_selected(&store, table.as_deref())?;
            let state = InstalledState::from_file(&installed_path(installed, config))?;
            let nft_mgr = NftManager::new();

            for program in &programs {
                let current = state.table(program.family, &program.name);
                let diff = nft_mgr.diff_programs(current, program)?;
                if diff.matches {
                    println!("✅ {} is up to date", diff.table);
                } else if let Some(text) = diff.diff {
                    let marker = if diff.current_exists { "changed" } else { "new" };
                    println!("📋 {} ({}):\n{}", diff.table, marker, text);
                }
            }
        }
        PolicyAction::Apply {
            file,
            table,
            installed,
            commit,
        } => {
            apply_policies(
                &file,
                table.as_deref(),
                &installed_path(installed, config),
                commit,
                None,
            )
            .await?;
        }
        PolicyAction::Delete {
            table,
            family,
            installed,
        } => {
            let installed = installed_path(installed, config);
            let mut state = InstalledState::from_file(&installed)?;
            NftManager::new().delete_table(family, &table).await?;
            state.remove(family, &table);
            state.write_file(&installed)?;
            println!("🗑️  Deleted table {} {}", family, table);
        }
        PolicyAction::List => {
            let tables = NftManager::new().list_tables().await?;
            if tables.is_empty() {
                println!("No nftables tables found");
            }
            for (family, name) in tables {
                println!("  {} {}", family, name);
            }
        }
    }
    Ok(())
}

async fn apply_policies(
    file: &Path,
    table: Option<&str>,
    installed_path: &Path,
    commit: bool,
    metrics: Option<&MetricsCollector>,
) -> anyhow::Result<()> {
    println!("🚀 Loading policies from {}", file.display());
    let store = load_valid_policies(file)?;
    println!("✅ Policy validation passed\n");

    let programs = compile_selected(&store, table)?;
    let mut state = InstalledState::from_file(installed_path)?;
    let nft_mgr = NftManager::new();
    let mut snapshots = Vec::new();
    let mut written = Vec::new();

    for program in programs {
        let rule_plan = plan(state.table(program.family, &program.name), &program);

        println!("📋 Table {} {}", program.family, program.name);
        if rule_plan.is_noop() {
            println!("   ✅ Up to date ({} rules)", rule_plan.unchanged);
            continue;
        }
        rule_plan.display();

        if !commit {
            continue;
        }

        match nft_mgr.apply_program(&program).await {
            Ok(snapshot) => snapshots.push((program.family, program.name.clone(), snapshot)),
            Err(e) => {
                rollback(&nft_mgr, &snapshots).await;
                return Err(e).with_context(|| format!("Failed to apply table {}", program.name));
            }
        }

        info!(
            table = %program.name,
            adds = rule_plan.count("add"),
            replaces = rule_plan.count("replace"),
            deletes = rule_plan.count("delete"),
            chains = rule_plan.count("chain"),
            "Table reconciled"
        );
        written.push(rule_plan);
        state.upsert(program);
    }

    if !commit {
        println!("\n⚠️  Dry run mode. Use --commit to apply changes.");
        return Ok(());
    }

    if !written.is_empty() {
        if let Err(e) = state.write_file(installed_path) {
            rollback(&nft_mgr, &snapshots).await;
            return Err(e);
        }
    }

    if let Some(metrics) = metrics {
        for rule_plan in &written {
            for op in ["add", "replace", "delete", "chain"] {
                metrics.record_rule_writes(op, rule_plan.count(op) as u64);
            }
        }
    }

    println!("\n✅ Applied {} table(s)", written.len());
    Ok(())
}

/// Put tables written earlier in this run back to their snapshots, newest first.
async fn rollback(nft_mgr: &NftManager, snapshots: &[(TableFamily, String, Option<String>)]) {
    for (family, name, snapshot) in snapshots.iter().rev() {
        warn!(table = %name, family = %family, "Rolling back table");
        if let Err(e) = nft_mgr.restore_table(*family, name, snapshot.as_deref()).await {
            warn!(table = %name, error = %e, "Failed to roll back table");
        }
    }
}

async fn handle_alloc_action(
    action: AllocAction,
    config: &GatewayConfig,
    state_path: &Path,
) -> anyhow::Result<()> {
    let mut state = ClusterState::from_file(state_path)?;
    let registry = AllocatorRegistry::new(config, Arc::new(state.clone()))?;

    match action {
        AllocAction::Mark { owner } => {
            let marks = registry.marks().await?;
            let txn = marks.start_transaction(&owner)?;
            let mark = txn.mark();

            if !txn.is_new() {
                txn.commit();
                println!("✅ {} already owns mark {}", owner, mark);
                return Ok(());
            }

            state.record_mark(&owner, mark);
            let outcome = state.write_file(state_path);
            txn.finish(&outcome);
            outcome?;
            println!("✅ Allocated mark {} to {}", mark, owner);
        }
        AllocAction::ReleaseMark { owner } => {
            let marks = registry.marks().await?;
            let txn = marks.start_transaction(&owner)?;

            if txn.is_new() {
                txn.abort();
                println!("⚠️  {} owns no mark", owner);
                return Ok(());
            }

            let holders = state.mark_holders(&owner);
            if !holders.is_empty() {
                let mark = txn.mark();
                txn.abort();
                println!(
                    "⚠️  Mark {} of {} is held by {}; remove those configurations first",
                    mark,
                    owner,
                    holders.join(", ")
                );
                return Ok(());
            }

            state.remove_mark(&owner);
            match state.write_file(state_path) {
                Ok(()) => {
                    let freed = txn.free();
                    println!("🗑️  Released mark {:?} from {}", freed, owner);
                }
                Err(e) => {
                    txn.abort();
                    return Err(e);
                }
            }
        }
        AllocAction::Address { pool, key } => {
            let ip_pool = registry.pool(&pool).await?;
            let existing = ip_pool.address_of(&key);
            let address = ip_pool.allocate(&key)?;

            if existing.is_some() {
                println!("✅ {} already holds {} in pool {}", key, address, pool);
                return Ok(());
            }

            state.record_address(&pool, &key, address);
            if let Err(e) = state.write_file(state_path) {
                ip_pool.release(&key);
                return Err(e);
            }
            println!("✅ Allocated {} to {} in pool {}", address, key, pool);
        }
        AllocAction::ReleaseAddress { pool, key } => {
            let ip_pool = registry.pool(&pool).await?;
            match ip_pool.release(&key) {
                Some(address) => {
                    state.remove_address(&pool, &key);
                    state.write_file(state_path)?;
                    println!("🗑️  Released {} from {} in pool {}", address, key, pool);
                }
                None => println!("⚠️  {} holds no address in pool {}", key, pool),
            }
        }
        AllocAction::Status => {
            let marks = registry.marks().await?;
            println!("🔖 Marks ({} in use, max {})", marks.in_use_count(), marks.max());
            for (owner, mark) in marks.bindings() {
                println!("  {:>10}  {}", mark, owner);
            }

            let names: Vec<String> = registry.pool_names().map(str::to_string).collect();
            for name in names {
                let ip_pool = registry.pool(&name).await?;
                println!(
                    "\n🌐 Pool {} {} ({}/{} in use)",
                    name,
                    ip_pool.cidr(),
                    ip_pool.in_use(),
                    ip_pool.capacity()
                );
                for (address, key) in ip_pool.assignments() {
                    println!("  {:>15}  {}", address, key);
                }
            }
        }
    }
    Ok(())
}

async fn handle_metrics_action(
    action: MetricsAction,
    config: &GatewayConfig,
    state_path: &Path,
) -> anyhow::Result<()> {
    match action {
        MetricsAction::Serve { port, file, apply } => {
            println!("🚀 Starting metrics server on port {}...", port);

            let collector = MetricsCollector::new()?;

            let state = ClusterState::from_file(state_path)?;
            let registry = AllocatorRegistry::new(config, Arc::new(state))?;
            collector.update_mark_metrics(&*registry.marks().await?);
            let names: Vec<String> = registry.pool_names().map(str::to_string).collect();
            for name in &names {
                registry.pool(name).await?;
            }
            collector.update_pool_metrics(&registry.loaded_pools());

            if file.exists() {
                let store = PolicyStore::from_file(&file)?;
                let validator = PolicyValidator::new(&store.configurations);
                let failures = validator.validate();
                for (name, err) in &failures {
                    warn!(configuration = %name, error = %err, "Rejected configuration");
                    collector.record_rejection(err.reason());
                }
                for configuration in &store.configurations {
                    if failures.iter().any(|(name, _)| name == &configuration.name) {
                        continue;
                    }
                    match compile_table(&configuration.table) {
                        Ok(program) => collector.set_table_rules(
                            program.family.as_str(),
                            &program.name,
                            program.rule_count(),
                        ),
                        Err(e) => {
                            warn!(configuration = %configuration.name, error = %e, "Failed to compile")
                        }
                    }
                }
            }

            if apply {
                let installed = installed_path(None, config);
                apply_policies(&file, None, &installed, true, Some(&collector)).await?;
            }

            let server = MetricsServer::new(collector, port);
            server.serve().await?;
        }
    }
    Ok(())
}
