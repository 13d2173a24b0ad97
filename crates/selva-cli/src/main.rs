mod cli;

use std::io;

use cli::{HierarchyCmd, IndexCmd, ObjectCmd, OptsCmd, TypesCmd};
use clap::Parser;
use selva_core::{NodeId, ROOT_NODE_ID, Timestamp};
use selva_db::{
    Config, Db, DbError, Direction, FindOptions, FindTraversal, IndexDirection, ModifyFlags,
    ModifyOp, ModifyTriplet, ObjectValue, SetMode,
};
use selva_util_error::FmtCompact as _;
use snafu::{FromString, ResultExt, Snafu, Whatever};
use tracing::warn;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

pub const LOG_TARGET: &str = "selva::cli";

type WhateverResult<T> = std::result::Result<T, snafu::Whatever>;

#[derive(Debug, Snafu)]
pub enum CliError {
    #[snafu(transparent)]
    Db { source: DbError },
    #[snafu(display("no such node or alias: {id}"))]
    UnresolvedId { id: String },
    #[snafu(display("miscellaneous error: {source}"))]
    Whatever { source: Whatever },
}

pub type CliResult<T> = std::result::Result<T, CliError>;

#[snafu::report]
fn main() -> CliResult<()> {
    init_logging().context(WhateverSnafu)?;

    let opts = cli::Opts::parse();
    let mut db = Db::with_config(Config::from_env());
    if opts.global.seed_demo {
        seed_demo(&mut db);
    }

    let value = handle_cmd(&mut db, opts.cmd)?;
    println!("{}", serde_json::to_string_pretty(&value).expect("json values never fail to serialize"));
    Ok(())
}

/// A tiny hierarchy so every subcommand has something to operate on,
/// standing in for the `hierarchy.find`/`load` bootstrap a long-running
/// process would normally do once at startup.
fn seed_demo(db: &mut Db) {
    let now = Timestamp::now();
    let h = db.hierarchy_mut();
    let _ = h.set_hierarchy(nid("team"), &[ROOT_NODE_ID], &[], now);
    let _ = h.set_hierarchy(nid("alice"), &[nid("team")], &[], now);
    let _ = h.set_hierarchy(nid("bob"), &[nid("team")], &[], now);
    let _ = h.set_alias("lead", nid("alice"));
    if let Err(err) = h.upsert(nid("team"), now).object.set_string("title", "Platform", SetMode::Set) {
        warn!(target: LOG_TARGET, err = %err.fmt_compact(), "demo seed field write failed");
    }
    let _ = h.upsert(nid("alice"), now).object.set_string("role", "lead", SetMode::Set);
    let _ = h.upsert(nid("bob"), now).object.set_string("role", "engineer", SetMode::Set);
}

fn nid(s: &str) -> NodeId {
    s.parse().expect("demo ids fit the fixed node id width")
}

fn parse_node(s: &str) -> CliResult<NodeId> {
    s.parse::<NodeId>().map_err(|_| CliError::UnresolvedId { id: s.to_string() })
}

fn handle_cmd(db: &mut Db, cmd: OptsCmd) -> CliResult<serde_json::Value> {
    let now = Timestamp::now();
    match cmd {
        OptsCmd::Hierarchy(HierarchyCmd::Find { anchor, descendants, ancestors: _, fields, order, order_desc, limit, offset }) => {
            let dir = if descendants { Direction::BFS_DESCENDANTS } else { Direction::BFS_ANCESTORS };
            let opts = FindOptions {
                anchor: parse_node(&anchor)?,
                traversal: FindTraversal::Direction(dir),
                filter: None,
                order: order.map(|f| (f, order_desc)),
                limit,
                offset,
                fields: (!fields.is_empty()).then_some(fields),
                fields_rpn: None,
                excluded_fields: Default::default(),
                merge: Default::default(),
                inherit: false,
                now,
            };
            let rows = db.find(opts)?;
            Ok(serde_json::json!(rows
                .into_iter()
                .map(|r| serde_json::json!([r.node.to_string(), r.field, format!("{:?}", r.value)]))
                .collect::<Vec<_>>()))
        }
        OptsCmd::Hierarchy(HierarchyCmd::Inherit { node, fields }) => {
            let opts = FindOptions {
                anchor: parse_node(&node)?,
                traversal: FindTraversal::Direction(Direction::BFS_ANCESTORS),
                filter: None,
                order: None,
                limit: None,
                offset: 0,
                fields: Some(fields),
                fields_rpn: None,
                excluded_fields: Default::default(),
                merge: Default::default(),
                inherit: true,
                now,
            };
            let rows = db.find(opts)?;
            Ok(serde_json::json!(rows
                .into_iter()
                .map(|r| serde_json::json!([r.node.to_string(), r.field, format!("{:?}", r.value)]))
                .collect::<Vec<_>>()))
        }
        OptsCmd::Modify { node, field, value, create } => {
            let flags = if create { ModifyFlags::CREATE } else { ModifyFlags::UPDATE };
            let triplets = vec![ModifyTriplet::new(ModifyOp::Scalar {
                path: field,
                value: ObjectValue::String(value),
                mode: SetMode::Set,
            })];
            let outcomes = db.modify(parse_node(&node)?, flags, triplets, now)?;
            Ok(serde_json::json!(outcomes.iter().map(|o| format!("{o:?}")).collect::<Vec<_>>()))
        }
        OptsCmd::Object(ObjectCmd::Get { node, field }) => {
            let id = parse_node(&node)?;
            let value = db.hierarchy().find_node(id).and_then(|n| n.object.get(&field));
            Ok(serde_json::json!(value.map(|v| format!("{v:?}"))))
        }
        OptsCmd::Object(ObjectCmd::Set { node, field, value }) => {
            let id = parse_node(&node)?;
            let n = db.hierarchy_mut().upsert(id, now);
            let changed = n.object.set_string(&field, value, SetMode::Set)?;
            Ok(serde_json::json!(changed))
        }
        OptsCmd::Object(ObjectCmd::Del { node, field }) => {
            let id = parse_node(&node)?;
            let removed = db
                .hierarchy_mut()
                .find_node_mut(id)
                .map(|n| n.object.del(&field))
                .unwrap_or(false);
            Ok(serde_json::json!(removed))
        }
        OptsCmd::Object(ObjectCmd::Exists { node, field }) => {
            let id = parse_node(&node)?;
            let exists = db.hierarchy().find_node(id).is_some_and(|n| n.object.exists(&field));
            Ok(serde_json::json!(exists))
        }
        OptsCmd::Index(IndexCmd::List) => Ok(serde_json::json!(
            db.index_list()
                .map(|icb| serde_json::json!({
                    "id": icb.id,
                    "name": icb.name,
                    "active": icb.active,
                    "permanent": icb.permanent,
                }))
                .collect::<Vec<_>>()
        )),
        OptsCmd::Index(IndexCmd::New { anchor, descendants, ancestors: _ }) => {
            let dir = if descendants { IndexDirection::BfsDescendants } else { IndexDirection::BfsAncestors };
            let id = db.index_new(parse_node(&anchor)?, dir, None, None, None, now)?;
            Ok(serde_json::json!(id))
        }
        OptsCmd::Index(IndexCmd::Del { id }) => {
            db.index_del(id, false)?;
            Ok(serde_json::json!(true))
        }
        OptsCmd::Types(TypesCmd::Add { code, name }) => {
            let mut bytes = [0u8; selva_core::NODE_TYPE_CODE_LEN];
            let src = code.as_bytes();
            let len = src.len().min(bytes.len());
            bytes[..len].copy_from_slice(&src[..len]);
            db.hierarchy_mut().types_add(bytes, name);
            Ok(serde_json::json!(true))
        }
        OptsCmd::Types(TypesCmd::Clear) => {
            db.hierarchy_mut().types_clear();
            Ok(serde_json::json!(true))
        }
        OptsCmd::Types(TypesCmd::List) => Ok(serde_json::json!(
            db.hierarchy()
                .types_list()
                .map(|(code, name)| serde_json::json!([String::from_utf8_lossy(code), name]))
                .collect::<Vec<_>>()
        )),
        OptsCmd::Resolve { ids } => {
            for candidate in &ids {
                if let Ok(id) = candidate.parse::<NodeId>() {
                    if db.hierarchy().contains(id) {
                        return Ok(serde_json::json!(id.to_string()));
                    }
                }
                if let Some(id) = db.hierarchy().resolve_alias(candidate) {
                    return Ok(serde_json::json!(id.to_string()));
                }
            }
            Ok(serde_json::Value::Null)
        }
    }
}

pub fn init_logging() -> WhateverResult<()> {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .try_init()
        .map_err(|_| Whatever::without_source("failed to initialize logging".to_string()))?;

    tracing::debug!(target: LOG_TARGET, "logging initialized");
    Ok(())
}
