#![allow(dead_code)]

use rustconfdb::{ConfigDb, EngineConfig, LeafType, ModuleSchema, SchemaBuilder};
use std::path::Path;
use std::time::Duration;

/// `example-module`: plain config with a keyed list, a leaf-list and a
/// user-ordered list.
pub fn example_module() -> ModuleSchema {
    let mut b = SchemaBuilder::new("example-module", "urn:example", "ex");
    let container = b.container(None, "container");
    let list = b.list(Some(container), "list", &["key1", "key2"]);
    b.leaf(Some(list), "key1", LeafType::String);
    b.leaf(Some(list), "key2", LeafType::String);
    b.leaf(Some(list), "leaf", LeafType::String);
    b.leaf_list(Some(container), "options", LeafType::String);
    let queue = b.user_list(None, "queue", &["name"]);
    b.leaf(Some(queue), "name", LeafType::String);
    b.build()
}

/// `test-module`: defaults, an RPC with input defaults, a nested action and
/// a top-level notification.
pub fn test_module() -> ModuleSchema {
    let mut b = SchemaBuilder::new("test-module", "urn:test", "t");
    let main = b.container(None, "main");
    b.leaf(Some(main), "i8", LeafType::Int8);
    b.leaf_with_default(Some(main), "speed", LeafType::Uint32, "100");

    let (_rpc, input, output) = b.rpc("activate-software-image");
    b.leaf(Some(input), "image-name", LeafType::String);
    b.leaf_with_default(Some(input), "location", LeafType::String, "/");
    b.leaf(Some(output), "status", LeafType::String);

    let modules = b.container(None, "kernel-modules");
    let module = b.list(Some(modules), "kernel-module", &["name"]);
    b.leaf(Some(module), "name", LeafType::String);
    let (_action, action_input, _action_output) = b.action(module, "status-change");
    b.leaf(Some(action_input), "interval", LeafType::Uint16);

    let notification = b.notification(None, "link-down");
    b.leaf(Some(notification), "severity", LeafType::String);
    b.build()
}

/// `state-module`: config plus a `config false` subtree served by
/// operational-data providers.
pub fn state_module() -> ModuleSchema {
    let mut b = SchemaBuilder::new("state-module", "urn:state", "s");
    let config = b.container(None, "config");
    b.leaf(Some(config), "name", LeafType::String);
    let stats = b.container(None, "stats");
    b.mark_state(stats);
    b.leaf(Some(stats), "counter", LeafType::Uint64);
    b.build()
}

/// Engine over a throwaway repository with the three test schemas
/// installed. Timeouts are tightened so failure paths stay fast.
pub async fn open_db(root: &Path) -> ConfigDb {
    let config = EngineConfig::new(root)
        .worker_count(2)
        .operational_data_timeout(Duration::from_millis(300))
        .commit_verify_timeout(Duration::from_secs(2));
    let db = ConfigDb::open(config).await.expect("engine open");
    db.install_module(example_module(), Vec::new())
        .await
        .expect("install example-module");
    db.install_module(test_module(), Vec::new())
        .await
        .expect("install test-module");
    db.install_module(state_module(), Vec::new())
        .await
        .expect("install state-module");
    db
}
