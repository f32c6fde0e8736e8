//! Command surface over the navigation tree service.
//!
//! Host code should embed through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_command`] for direct command execution against an existing
//!   [`NavTreeService`].

use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use nav_tree_core::{NavConfig, NavItemInput, NavItemUpdate, NavNode};
use nav_tree_store_sqlite::{
    title_contains, uri_prefix, NavTreeService, QueryCustomizer, SqliteNavStore,
};

#[derive(Debug, Parser)]
#[command(name = "nav")]
#[command(about = "Navigation tree CLI")]
pub struct Cli {
    #[arg(long, default_value = "./nav_tree.sqlite3")]
    db: PathBuf,

    /// Attach permission bindings alongside role bindings on tree fetches.
    #[arg(long)]
    bind_permission: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Item {
        #[command(subcommand)]
        command: Box<ItemCommand>,
    },
    Role {
        #[command(subcommand)]
        command: Box<RoleCommand>,
    },
    Permission {
        #[command(subcommand)]
        command: Box<PermissionCommand>,
    },
    Tree {
        #[command(subcommand)]
        command: Box<TreeCommand>,
    },
}

#[derive(Debug, Subcommand)]
pub enum ItemCommand {
    Add(ItemAddArgs),
    Update(ItemUpdateArgs),
    Remove(ItemIdArgs),
    Show(ItemIdArgs),
    List,
}

#[derive(Debug, Args)]
pub struct ItemAddArgs {
    #[arg(long)]
    title: String,
    #[arg(long)]
    parent_id: Option<i64>,
    #[arg(long, default_value_t = 0)]
    order: i64,
    #[arg(long)]
    icon: Option<String>,
    #[arg(long)]
    uri: Option<String>,
    #[arg(long)]
    permission_ref: Option<String>,
}

#[derive(Debug, Args)]
pub struct ItemUpdateArgs {
    #[arg(long)]
    id: i64,
    #[arg(long)]
    title: Option<String>,
    #[arg(long)]
    parent_id: Option<i64>,
    #[arg(long, conflicts_with = "parent_id")]
    clear_parent: bool,
    #[arg(long)]
    order: Option<i64>,
    #[arg(long)]
    icon: Option<String>,
    #[arg(long, conflicts_with = "icon")]
    clear_icon: bool,
    #[arg(long)]
    uri: Option<String>,
    #[arg(long, conflicts_with = "uri")]
    clear_uri: bool,
    #[arg(long)]
    permission_ref: Option<String>,
    #[arg(long, conflicts_with = "permission_ref")]
    clear_permission_ref: bool,
}

#[derive(Debug, Args)]
pub struct ItemIdArgs {
    #[arg(long)]
    id: i64,
}

#[derive(Debug, Subcommand)]
pub enum RoleCommand {
    Bind(RoleBindingArgs),
    Unbind(RoleBindingArgs),
}

#[derive(Debug, Args)]
pub struct RoleBindingArgs {
    #[arg(long)]
    item_id: i64,
    #[arg(long)]
    role_id: i64,
}

#[derive(Debug, Subcommand)]
pub enum PermissionCommand {
    Bind(PermissionBindingArgs),
    Unbind(PermissionBindingArgs),
}

#[derive(Debug, Args)]
pub struct PermissionBindingArgs {
    #[arg(long)]
    item_id: i64,
    #[arg(long)]
    permission_id: i64,
}

#[derive(Debug, Subcommand)]
pub enum TreeCommand {
    Show(TreeShowArgs),
}

#[derive(Debug, Args)]
pub struct TreeShowArgs {
    /// Rebuild the tree even when a memoized one exists.
    #[arg(long)]
    force_refresh: bool,
    /// Only records whose title contains the given text (bypasses the cache).
    #[arg(long)]
    title_contains: Option<String>,
    /// Only records whose uri starts with the given prefix (bypasses the cache).
    #[arg(long)]
    uri_prefix: Option<String>,
    #[arg(long)]
    json: bool,
}

/// Opens the store at `--db`, migrates it, and executes the parsed command.
///
/// # Errors
/// Returns an error when store open/migrate or command execution fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let config = NavConfig {
        bind_permission: cli.bind_permission,
        ..NavConfig::default()
    };
    let store = SqliteNavStore::open(&cli.db, config)?;
    store.migrate()?;
    let service = NavTreeService::new(store);
    run_command(cli.command, &service)
}

/// Executes a parsed command against an existing service.
///
/// # Errors
/// Returns an error when validation, persistence, or fetch operations fail.
pub fn run_command(command: Command, service: &NavTreeService) -> Result<()> {
    match command {
        Command::Item { command } => run_item(*command, service),
        Command::Role { command } => run_role(*command, service),
        Command::Permission { command } => run_permission(*command, service),
        Command::Tree { command } => run_tree(*command, service),
    }
}

fn run_item(command: ItemCommand, service: &NavTreeService) -> Result<()> {
    match command {
        ItemCommand::Add(args) => {
            let input = NavItemInput {
                parent_id: args.parent_id,
                order: args.order,
                title: args.title,
                icon: args.icon,
                uri: args.uri,
                permission_ref: args.permission_ref,
            };
            let record = service.create_item(&input)?;
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        }
        ItemCommand::Update(args) => {
            let update = NavItemUpdate {
                parent_id: clearable(args.clear_parent, args.parent_id),
                order: args.order,
                title: args.title,
                icon: clearable(args.clear_icon, args.icon),
                uri: clearable(args.clear_uri, args.uri),
                permission_ref: clearable(args.clear_permission_ref, args.permission_ref),
            };
            let record = service.update_item(args.id, &update)?;
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        }
        ItemCommand::Remove(args) => {
            service.delete_item(args.id)?;
            println!("{}", serde_json::json!({ "removed": args.id }));
            Ok(())
        }
        ItemCommand::Show(args) => {
            let record = service
                .get_item(args.id)?
                .ok_or_else(|| anyhow!("no navigation item with id {}", args.id))?;
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        }
        ItemCommand::List => {
            let items = service.list_items()?;
            println!("{}", serde_json::to_string_pretty(&items)?);
            Ok(())
        }
    }
}

fn run_role(command: RoleCommand, service: &NavTreeService) -> Result<()> {
    match command {
        RoleCommand::Bind(args) => service.bind_role(args.item_id, args.role_id),
        RoleCommand::Unbind(args) => service.unbind_role(args.item_id, args.role_id),
    }
}

fn run_permission(command: PermissionCommand, service: &NavTreeService) -> Result<()> {
    match command {
        PermissionCommand::Bind(args) => service.bind_permission(args.item_id, args.permission_id),
        PermissionCommand::Unbind(args) => {
            service.unbind_permission(args.item_id, args.permission_id)
        }
    }
}

fn run_tree(command: TreeCommand, service: &NavTreeService) -> Result<()> {
    match command {
        TreeCommand::Show(args) => {
            let mut customizers: Vec<QueryCustomizer> = Vec::new();
            if let Some(needle) = args.title_contains.as_deref() {
                customizers.push(title_contains(needle));
            }
            if let Some(prefix) = args.uri_prefix.as_deref() {
                customizers.push(uri_prefix(prefix));
            }

            let tree = service.fetch_tree(args.force_refresh, &customizers)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(tree.as_ref())?);
            } else {
                print_tree(&tree, 0);
            }
            Ok(())
        }
    }
}

fn clearable<T>(clear: bool, value: Option<T>) -> Option<Option<T>> {
    if clear {
        Some(None)
    } else {
        value.map(Some)
    }
}

fn print_tree(nodes: &[NavNode], depth: usize) {
    for node in nodes {
        let indent = "  ".repeat(depth);
        let uri = node.record.uri.as_deref().unwrap_or("-");
        println!("{indent}{} [id={} uri={}]", node.record.title, node.record.id, uri);
        print_tree(&node.children, depth + 1);
    }
}
