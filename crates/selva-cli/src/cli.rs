use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Opts {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub cmd: OptsCmd,
}

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Seed a small demo hierarchy (a few nodes under root) before running
    /// the command, since this process has no persisted store to load.
    #[arg(long, default_value_t = true)]
    pub seed_demo: bool,
}

#[derive(Debug, Subcommand)]
pub enum OptsCmd {
    /// `hierarchy.find` / `hierarchy.inherit` (§6).
    #[command(subcommand)]
    Hierarchy(HierarchyCmd),
    /// `modify` (§4.6).
    Modify {
        node: String,
        /// Dot-path field to set.
        field: String,
        value: String,
        /// Create the node if it doesn't already exist.
        #[arg(long)]
        create: bool,
    },
    /// `object.get` / `object.set` / `object.del` / `object.exists` (§6).
    #[command(subcommand)]
    Object(ObjectCmd),
    /// `index.list` / `index.new` / `index.del` (§6).
    #[command(subcommand)]
    Index(IndexCmd),
    /// `hierarchy.types.add` / `clear` / `list` (§6).
    #[command(subcommand)]
    Types(TypesCmd),
    /// `resolve.nodeId` (§6).
    Resolve {
        /// Each argument is tried as a node id, then as an alias.
        ids: Vec<String>,
    },
}

#[derive(Debug, Subcommand)]
pub enum HierarchyCmd {
    Find {
        anchor: String,
        #[arg(long, conflicts_with = "ancestors")]
        descendants: bool,
        #[arg(long)]
        ancestors: bool,
        #[arg(long, value_delimiter = ',')]
        fields: Vec<String>,
        #[arg(long)]
        order: Option<String>,
        #[arg(long)]
        order_desc: bool,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    Inherit {
        node: String,
        #[arg(value_delimiter = ',')]
        fields: Vec<String>,
    },
}

#[derive(Debug, Subcommand)]
pub enum ObjectCmd {
    Get { node: String, field: String },
    Set { node: String, field: String, value: String },
    Del { node: String, field: String },
    Exists { node: String, field: String },
}

#[derive(Debug, Subcommand)]
pub enum IndexCmd {
    List,
    New {
        anchor: String,
        #[arg(long, conflicts_with = "ancestors")]
        descendants: bool,
        #[arg(long)]
        ancestors: bool,
    },
    Del { id: u64 },
}

#[derive(Debug, Subcommand)]
pub enum TypesCmd {
    Add { code: String, name: String },
    Clear,
    List,
}
