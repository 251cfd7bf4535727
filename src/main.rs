use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use vmss_exec::azure::{
    ArmComputeClient, ArmInventory, AzureCliCredential, ChainedCredential, DeviceCodeCredential,
    TokenCredential,
};
use vmss_exec::cluster::KubeNodeLookup;
use vmss_exec::config::{default_config_path, ConfigFile, ConfigStore, NodeEntry};
use vmss_exec::connectivity::check_apiserver_connectivity;
use vmss_exec::progress::Spinner;
use vmss_exec::error::{Result, VmssError};
use vmss_exec::runcmd::{
    OutputTruncate, RemoteCommandExecutor, RunCommandRequest, DEFAULT_TIMEOUT_SECS,
};
use vmss_exec::target::{resolve_fields, NodeFlags, NodeIdentityResolver, ProcessEnv};
use vmss_exec::vmss::MachineCoordinate;

#[derive(Parser, Debug)]
#[command(name = "vmss-exec")]
#[command(version)]
#[command(about = "Run commands on Kubernetes nodes backed by Azure VM scale set instances")]
#[command(propagate_version = true)]
struct Args {
    /// Verbose output
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    /// Path to the config file
    #[arg(long, global = true, env = "VMSS_EXEC_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run a command in a node
    RunCommand(RunCommandArgs),

    /// Check connectivity between the node and the Kubernetes API server
    CheckApiserverConnectivity {
        #[command(flatten)]
        node: NodeArgs,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

// =============================================================================
// Node Arguments (shared by every command that targets a node)
// =============================================================================

// A node is given by exactly one of: --node, --id, or all four VMSS instance
// flags. Unset flags fall back to VMSS_EXEC_<FLAG> and then to the config file.
#[derive(clap::Args, Debug, Clone, Default)]
struct NodeArgs {
    /// Kubernetes node name
    #[arg(long)]
    node: Option<String>,

    /// Subscription ID
    #[arg(long)]
    subscription: Option<String>,

    /// Node resource group name
    #[arg(long)]
    node_resource_group: Option<String>,

    /// Virtual machine scale set name
    #[arg(long)]
    vmss: Option<String>,

    /// VM scale set instance ID
    #[arg(long)]
    instance_id: Option<String>,

    /// Resource ID of the VMSS instance, case-insensitive, e.g.
    /// /subscriptions/mySubID/resourceGroups/myRG/providers/myProvider/virtualMachineScaleSets/myVMSS/virtualMachines/myInsID
    #[arg(long)]
    id: Option<String>,
}

impl NodeArgs {
    fn to_flags(&self) -> NodeFlags {
        NodeFlags {
            node: self.node.clone(),
            subscription: self.subscription.clone(),
            node_resource_group: self.node_resource_group.clone(),
            vmss: self.vmss.clone(),
            instance_id: self.instance_id.clone(),
            id: self.id.clone(),
        }
    }
}

// =============================================================================
// Run Command Arguments
// =============================================================================

#[derive(clap::Args, Debug)]
struct RunCommandArgs {
    /// The command to run on the node (e.g., "uptime")
    command: String,

    /// Timeout in seconds for the command to complete
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_SECS)]
    timeout: u64,

    /// Return the last 4096 bytes of output instead of the first 4096
    #[arg(long)]
    truncate_head: bool,

    #[command(flatten)]
    node: NodeArgs,
}

// =============================================================================
// Config Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum ConfigCommands {
    /// Show the configuration
    Show,
    /// Set the current node in the configuration
    UseNode {
        /// Name of a node entry
        name: String,
    },
    /// Unset the current node in the configuration
    UnsetCurrentNode,
    /// Unset a given node in the configuration
    UnsetNode {
        /// Name of a node entry
        name: String,
    },
    /// Unset all nodes in the configuration
    UnsetAll,
    /// Set a given node in the configuration
    ///
    /// Node name, resource ID and VMSS instance information are mutually
    /// exclusive; any previous entry for the name is replaced.
    SetNode {
        /// Name of the node entry
        name: String,

        #[command(flatten)]
        node: NodeArgs,
    },
    /// Import Kubernetes nodes into the configuration
    ///
    /// Uses kubeconfig by default. With --subscription, --resource-group and
    /// --cluster-name the VMSS instances are listed through the Azure API.
    Import {
        /// Subscription ID of the cluster (Azure API only)
        #[arg(long)]
        subscription: Option<String>,

        /// Resource group of the cluster (Azure API only)
        #[arg(long)]
        resource_group: Option<String>,

        /// Name of the cluster (Azure API only)
        #[arg(long)]
        cluster_name: Option<String>,
    },
}

// =============================================================================
// Helpers
// =============================================================================

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();
}

/// Azure CLI session first, then device code sign-in with a cached token.
fn credential() -> Result<Arc<dyn TokenCredential>> {
    let sources: Vec<Arc<dyn TokenCredential>> = vec![
        Arc::new(AzureCliCredential::new()),
        Arc::new(DeviceCodeCredential::new()?),
    ];
    Ok(Arc::new(ChainedCredential::new(sources)))
}

/// Flags, then environment, then config file; then resolve to coordinates.
async fn resolve_vm(node: &NodeArgs, config: &ConfigFile) -> Result<MachineCoordinate> {
    let target = resolve_fields(&node.to_flags(), &ProcessEnv, config).into_target()?;
    tracing::debug!(target = %target, "resolved node target");

    let lookup = KubeNodeLookup::new();
    NodeIdentityResolver::new(config, &lookup)
        .resolve(&target)
        .await
}

// =============================================================================
// Command Handlers
// =============================================================================

async fn handle_run_command(args: RunCommandArgs, store: &ConfigStore, verbose: bool) -> Result<()> {
    let config = store.load()?;
    let vm = resolve_vm(&args.node, &config).await?;

    let truncate = if args.truncate_head {
        OutputTruncate::Head
    } else {
        OutputTruncate::Tail
    };
    let request = RunCommandRequest::new(vm, args.command)
        .with_timeout(args.timeout)
        .with_truncate(truncate);

    let client = ArmComputeClient::new(credential()?)?;
    let result = RemoteCommandExecutor::new(&client)
        .verbose(verbose)
        .run(&request)
        .await?;

    if !result.stderr.is_empty() {
        eprintln!("{}", result.stderr);
    }
    if !result.stdout.is_empty() {
        println!("{}", result.stdout);
    }
    Ok(())
}

async fn handle_connectivity_check(node: NodeArgs, store: &ConfigStore, verbose: bool) -> Result<()> {
    let config = store.load()?;
    let vm = resolve_vm(&node, &config).await?;

    let client = ArmComputeClient::new(credential()?)?;
    let executor = RemoteCommandExecutor::new(&client).verbose(verbose);
    let report = check_apiserver_connectivity(&executor, vm).await?;

    println!("\n{}", report.summary());
    if !report.succeeded() {
        // Forward the remote return value so scripts can act on it.
        std::process::exit(report.return_value);
    }
    Ok(())
}

async fn handle_config(command: ConfigCommands, store: &ConfigStore) -> Result<()> {
    match command {
        ConfigCommands::Show => {
            print!("{}", store.raw()?);
        }
        ConfigCommands::UseNode { name } => {
            store.update(|cfg| cfg.with_current_node(&name))?;
        }
        ConfigCommands::UnsetCurrentNode => {
            if store.load()?.current_node().is_some() {
                store.update(|cfg| Ok(cfg.without_current_node()))?;
            }
        }
        ConfigCommands::UnsetNode { name } => {
            if store.load()?.node(&name).is_some() {
                store.update(|cfg| Ok(cfg.without_node(&name)))?;
            }
        }
        ConfigCommands::UnsetAll => {
            store.remove()?;
        }
        ConfigCommands::SetNode { name, node } => {
            let target = node.to_flags().into_target()?;
            let entry = NodeEntry::from(&target);
            store.update(|cfg| Ok(cfg.with_node(&name, entry)))?;
        }
        ConfigCommands::Import {
            subscription,
            resource_group,
            cluster_name,
        } => {
            let arm_cluster = match (subscription, resource_group, cluster_name) {
                (Some(sub), Some(rg), Some(cluster)) => Some((sub, rg, cluster)),
                _ => None,
            };

            let spinner = Spinner::start("Importing...");
            let listed = match &arm_cluster {
                Some((sub, rg, cluster)) => ArmInventory::new(credential()?)?
                    .list_coordinates(sub, rg, cluster)
                    .await
                    .map_err(|e| VmssError::Arm(format!("getting VMSS VMs via Azure API: {e}"))),
                None => KubeNodeLookup::new().list_coordinates().await,
            };
            drop(spinner);

            let coordinates = match listed {
                Ok(coordinates) => coordinates,
                Err(e) if arm_cluster.is_none() => {
                    tracing::warn!("Could not get VMSS VMs via Kubernetes API");
                    tracing::warn!(
                        "Please provide '--subscription', '--resource-group' and '--cluster-name' to get VMSS VMs via Azure API"
                    );
                    return Err(e);
                }
                Err(e) => return Err(e),
            };

            let count = coordinates.len();
            store.update(|cfg| {
                Ok(coordinates
                    .iter()
                    .fold(cfg, |cfg, (name, vm)| cfg.with_node(name, NodeEntry::from(vm))))
            })?;
            println!("Imported {count} nodes into {}", store.path().display());
        }
    }
    Ok(())
}

async fn run(args: Args) -> Result<()> {
    let store = ConfigStore::new(args.config.unwrap_or_else(default_config_path));

    match args.command {
        Commands::RunCommand(run_args) => handle_run_command(run_args, &store, args.verbose).await,
        Commands::CheckApiserverConnectivity { node } => {
            handle_connectivity_check(node, &store, args.verbose).await
        }
        Commands::Config { command } => handle_config(command, &store).await,
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_tracing(args.verbose);

    if let Err(e) = run(args).await {
        eprintln!("Error: {e}");
        std::process::exit(e.exit_code());
    }
}
